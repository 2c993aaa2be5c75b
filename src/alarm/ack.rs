use chrono::{DateTime, Utc};

use crate::alarm::model::{SchedulerSettings, Wakeup};
use crate::audio::AudioState;

/// How long an acknowledged wake-up keeps the phase at `Acknowledged`.
const ACKNOWLEDGED_HOLD_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WakeupPhase {
    NoAlarm,
    AlarmSet { next_trigger: DateTime<Utc> },
    Active { alarm_instant: DateTime<Utc> },
    Acknowledged { alarm_instant: DateTime<Utc> },
}

impl WakeupPhase {
    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        matches!(self, WakeupPhase::Active { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AckWindowPolicy {
    ack_window: chrono::Duration,
}

impl AckWindowPolicy {
    pub fn new(ack_window: chrono::Duration) -> Self {
        Self { ack_window }
    }

    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self::new(settings.ack_window())
    }

    pub fn is_active(
        &self,
        latest: Option<&Wakeup>,
        audio_state: AudioState,
        now: &DateTime<Utc>,
    ) -> bool {
        let Some(wakeup) = latest else {
            return false;
        };
        if wakeup.is_acknowledged() {
            return false;
        }
        let elapsed = (*now - wakeup.alarm_instant).abs();
        elapsed <= self.ack_window || audio_state == AudioState::Alarm
    }

    /// `next_trigger` is `None` when the user has no alarm configured.
    pub fn phase(
        &self,
        next_trigger: Option<DateTime<Utc>>,
        latest: Option<&Wakeup>,
        audio_state: AudioState,
        now: &DateTime<Utc>,
    ) -> WakeupPhase {
        if let Some(wakeup) = latest
            && self.is_active(Some(wakeup), audio_state, now)
        {
            return WakeupPhase::Active {
                alarm_instant: wakeup.alarm_instant,
            };
        }

        let Some(next_trigger) = next_trigger else {
            return WakeupPhase::NoAlarm;
        };

        if let Some(wakeup) = latest
            && wakeup.is_acknowledged()
            && *now - wakeup.alarm_instant < chrono::Duration::hours(ACKNOWLEDGED_HOLD_HOURS)
        {
            return WakeupPhase::Acknowledged {
                alarm_instant: wakeup.alarm_instant,
            };
        }

        WakeupPhase::AlarmSet { next_trigger }
    }
}
