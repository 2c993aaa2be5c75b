use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};

use crate::alarm::clock::next_trigger_instant;
use crate::alarm::model::{Alarm, AlarmError, SchedulerSettings};
use crate::alarm::tracker::{OccurrenceKey, OccurrenceTracker};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TickDecision {
    /// No alarm configured for the user.
    NoAlarm,
    /// The next occurrence is outside the tolerance window.
    NotImminent { trigger: DateTime<Utc> },
    /// The occurrence is imminent but was already fired this session.
    AlreadyHandled { trigger: DateTime<Utc> },
    /// A new occurrence; it has been marked handled.
    Triggered { trigger: DateTime<Utc> },
}

impl TickDecision {
    pub fn triggered(&self) -> Option<DateTime<Utc>> {
        match self {
            TickDecision::Triggered { trigger } => Some(*trigger),
            _ => None,
        }
    }
}

/// Decides, once per poll, whether an alarm occurrence should fire.
///
/// Owns the session's [`OccurrenceTracker`]; `evaluate` takes `&mut self`,
/// so the check and the mark can never interleave with another tick.
#[derive(Debug)]
pub struct WakeupScheduler {
    tolerance: chrono::Duration,
    lookback: chrono::Duration,
    tracker: OccurrenceTracker,
}

impl WakeupScheduler {
    pub fn new(settings: &SchedulerSettings) -> Self {
        Self {
            tolerance: settings.tolerance(),
            lookback: settings.lookback(),
            tracker: OccurrenceTracker::new(),
        }
    }

    /// Trigger instant the scheduler is currently aiming at. The anchor is
    /// pulled back by the lookback so timer jitter cannot push an imminent
    /// occurrence to the next day.
    pub fn next_trigger<Tz>(&self, alarm: &Alarm, now: &DateTime<Tz>) -> Result<DateTime<Tz>, AlarmError>
    where
        Tz: TimeZone,
        Tz::Offset: Copy,
    {
        let anchor = now.clone() - self.lookback;
        next_trigger_instant(alarm, &anchor)
    }

    pub fn evaluate<Tz>(
        &mut self,
        alarm: Option<&Alarm>,
        now: &DateTime<Tz>,
    ) -> Result<TickDecision, AlarmError>
    where
        Tz: TimeZone,
        Tz::Offset: Copy,
    {
        let Some(alarm) = alarm else {
            debug!("no alarm configured, skipping tick");
            return Ok(TickDecision::NoAlarm);
        };

        let trigger = self.next_trigger(alarm, now)?;
        let trigger_utc = trigger.with_timezone(&Utc);
        let distance = (now.clone() - trigger.clone()).abs();
        if distance > self.tolerance {
            debug!(
                alarm = %alarm,
                trigger = %trigger_utc,
                distance_secs = distance.num_seconds(),
                "next occurrence not in range"
            );
            return Ok(TickDecision::NotImminent {
                trigger: trigger_utc,
            });
        }

        let key = OccurrenceKey::from_instant(&trigger);
        if !self.tracker.claim(key) {
            debug!(%key, "occurrence already handled");
            return Ok(TickDecision::AlreadyHandled {
                trigger: trigger_utc,
            });
        }

        info!(alarm = %alarm, trigger = %trigger_utc, "alarm occurrence triggered");
        Ok(TickDecision::Triggered {
            trigger: trigger_utc,
        })
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &OccurrenceTracker {
        &self.tracker
    }
}
