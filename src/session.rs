use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alarm::ack::{AckWindowPolicy, WakeupPhase};
use crate::alarm::model::{
    Acknowledgment, Alarm, AlarmError, SchedulerSettings, UserId, Wakeup, WakeupTriggered,
};
use crate::alarm::scheduler::{TickDecision, WakeupScheduler};
use crate::audio::AlarmAudioController;
use crate::store::{AlarmConfigStore, StoreError, WakeupStore};
use crate::time_provider::ClockSource;

pub const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Alarm(#[from] AlarmError),
}

#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn ClockSource>,
    pub alarms: Arc<dyn AlarmConfigStore>,
    pub wakeups: Arc<dyn WakeupStore>,
    pub audio: Arc<dyn AlarmAudioController>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub decision: TickDecision,
    pub phase: WakeupPhase,
    pub pending_writes: usize,
}

async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

fn newest(stored: Option<Wakeup>, unsaved: Option<Wakeup>) -> Option<Wakeup> {
    match (stored, unsaved) {
        (Some(stored), Some(unsaved)) => {
            if stored.alarm_instant == unsaved.alarm_instant {
                Some(stored.merge(unsaved))
            } else if stored.alarm_instant > unsaved.alarm_instant {
                Some(stored)
            } else {
                Some(unsaved)
            }
        }
        (stored, unsaved) => stored.or(unsaved),
    }
}

pub struct WakeupSession {
    user_id: UserId,
    settings: SchedulerSettings,
    scheduler: WakeupScheduler,
    policy: AckWindowPolicy,
    collaborators: Collaborators,
    pending_writes: Vec<Wakeup>,
    events: mpsc::Sender<WakeupTriggered>,
    phase_tx: watch::Sender<WakeupPhase>,
    fired_tx: watch::Sender<Option<DateTime<Utc>>>,
}

impl WakeupSession {
    pub fn new(
        user_id: UserId,
        settings: SchedulerSettings,
        collaborators: Collaborators,
    ) -> (Self, mpsc::Receiver<WakeupTriggered>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (phase_tx, _) = watch::channel(WakeupPhase::NoAlarm);
        let (fired_tx, _) = watch::channel(None);
        let session = Self {
            user_id,
            scheduler: WakeupScheduler::new(&settings),
            policy: AckWindowPolicy::from_settings(&settings),
            settings,
            collaborators,
            pending_writes: Vec::new(),
            events,
            phase_tx,
            fired_tx,
        };
        (session, events_rx)
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<WakeupPhase> {
        self.phase_tx.subscribe()
    }

    pub fn acknowledger(&self) -> Acknowledger {
        Acknowledger {
            user_id: self.user_id.clone(),
            wakeups: Arc::clone(&self.collaborators.wakeups),
            audio: Arc::clone(&self.collaborators.audio),
            fired: self.fired_tx.subscribe(),
            timeout: self.settings.write_timeout(),
        }
    }

    pub fn spawn(self) -> SessionHandle {
        let cancellation = CancellationToken::new();
        let join = tokio::spawn(self.run(cancellation.clone()));
        SessionHandle { cancellation, join }
    }

    pub async fn run(mut self, cancellation: CancellationToken) {
        info!(user_id = %self.user_id, "wake-up session started");
        if let Err(err) = self.collaborators.audio.play_silent_loop() {
            warn!(%err, "could not start silent loop");
        }

        let mut interval = tokio::time::interval(self.settings.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = interval.tick() => {}
            }
            // Sign-out abandons an in-flight tick rather than waiting on its writes.
            tokio::select! {
                _ = cancellation.cancelled() => break,
                result = self.tick() => match result {
                    Ok(outcome) => debug!(
                        decision = ?outcome.decision,
                        phase = ?outcome.phase,
                        pending_writes = outcome.pending_writes,
                        "tick complete"
                    ),
                    Err(err) => warn!(user_id = %self.user_id, %err, "tick skipped"),
                }
            }
        }

        if let Err(err) = self.collaborators.audio.stop() {
            warn!(%err, "could not stop audio");
        }
        if !self.pending_writes.is_empty() {
            warn!(
                user_id = %self.user_id,
                unsaved = self.pending_writes.len(),
                "session ended with unsaved wakeups"
            );
        }
        info!(user_id = %self.user_id, "wake-up session ended");
    }

    pub async fn tick(&mut self) -> Result<TickOutcome, SessionError> {
        let now = self.collaborators.clock.now();
        let timeout = self.settings.write_timeout();
        self.flush_pending_writes(timeout).await;

        let alarm = bounded(timeout, self.collaborators.alarms.get(&self.user_id)).await?;
        let decision = self.scheduler.evaluate(alarm.as_ref(), &now)?;
        if let Some(trigger) = decision.triggered() {
            self.fired_tx.send_replace(Some(trigger));
            self.persist(Wakeup::pending(trigger), timeout).await;
            self.start_alarm_audio();
            self.publish_trigger(trigger);
        }

        let phase = self.refresh_phase(alarm.as_ref(), &now, timeout).await?;
        Ok(TickOutcome {
            decision,
            phase,
            pending_writes: self.pending_writes.len(),
        })
    }

    async fn flush_pending_writes(&mut self, timeout: Duration) {
        for wakeup in std::mem::take(&mut self.pending_writes) {
            self.persist(wakeup, timeout).await;
        }
    }

    async fn persist(&mut self, wakeup: Wakeup, timeout: Duration) {
        let store = Arc::clone(&self.collaborators.wakeups);
        match bounded(timeout, store.upsert(&self.user_id, wakeup.clone())).await {
            Ok(_) => debug!(
                user_id = %self.user_id,
                alarm_instant = %wakeup.alarm_instant,
                "wakeup persisted"
            ),
            Err(err) => {
                warn!(
                    user_id = %self.user_id,
                    alarm_instant = %wakeup.alarm_instant,
                    %err,
                    "could not persist wakeup, will retry next tick"
                );
                self.pending_writes.push(wakeup);
            }
        }
    }

    fn start_alarm_audio(&self) {
        let audio = &self.collaborators.audio;
        if let Err(err) = audio.force_volume(self.settings.forced_volume) {
            warn!(%err, "could not force volume");
        }
        if let Err(err) = audio.play_alarm_loop() {
            warn!(%err, "could not start alarm loop");
        }
    }

    fn publish_trigger(&self, alarm_instant: DateTime<Utc>) {
        let event = WakeupTriggered {
            user_id: self.user_id.clone(),
            alarm_instant,
        };
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!(
                alarm_instant = %event.alarm_instant,
                "trigger event dropped, receiver is behind"
            ),
            Err(TrySendError::Closed(_)) => debug!("no trigger listener"),
        }
    }

    async fn refresh_phase(
        &self,
        alarm: Option<&Alarm>,
        now: &DateTime<Local>,
        timeout: Duration,
    ) -> Result<WakeupPhase, SessionError> {
        let next_trigger = match alarm {
            Some(alarm) => Some(self.scheduler.next_trigger(alarm, now)?.with_timezone(&Utc)),
            None => None,
        };

        let stored = match bounded(timeout, self.collaborators.wakeups.latest(&self.user_id)).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(user_id = %self.user_id, %err, "could not read latest wakeup");
                None
            }
        };
        let latest = newest(stored, self.pending_writes.last().cloned());

        let phase = self.policy.phase(
            next_trigger,
            latest.as_ref(),
            self.collaborators.audio.current_state(),
            &now.with_timezone(&Utc),
        );
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            debug!(previous = ?*current, new = ?phase, "wake-up phase changed");
            *current = phase;
            true
        });
        Ok(phase)
    }
}

pub struct SessionHandle {
    cancellation: CancellationToken,
    join: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn sign_out(self) {
        self.cancellation.cancel();
        if let Err(err) = self.join.await {
            warn!(%err, "wake-up session task failed");
        }
    }
}

#[derive(Clone)]
pub struct Acknowledger {
    user_id: UserId,
    wakeups: Arc<dyn WakeupStore>,
    audio: Arc<dyn AlarmAudioController>,
    fired: watch::Receiver<Option<DateTime<Utc>>>,
    timeout: Duration,
}

impl Acknowledger {
    pub async fn latest(&self) -> Result<Option<Wakeup>, SessionError> {
        Ok(bounded(self.timeout, self.wakeups.latest(&self.user_id)).await?)
    }

    /// A missing record is recreated only for the occurrence this session
    /// last fired.
    pub async fn acknowledge(
        &self,
        alarm_instant: DateTime<Utc>,
        ack_instant: DateTime<Utc>,
        photo_reference: Option<String>,
    ) -> Result<Wakeup, SessionError> {
        if alarm_instant > ack_instant {
            return Err(AlarmError::NotTriggered { alarm_instant }.into());
        }
        let latest = self.latest().await?;
        let last_fired = *self.fired.borrow();
        let mut wakeup = match latest {
            Some(latest) if latest.alarm_instant > alarm_instant => {
                return Err(AlarmError::Superseded {
                    alarm_instant,
                    latest: latest.alarm_instant,
                }
                .into());
            }
            Some(latest) if latest.alarm_instant == alarm_instant => latest,
            _ if last_fired == Some(alarm_instant) => Wakeup::pending(alarm_instant),
            _ => return Err(AlarmError::NotTriggered { alarm_instant }.into()),
        };
        wakeup.acknowledge(Acknowledgment {
            ack_instant,
            photo_reference,
        })?;

        let stored = bounded(self.timeout, self.wakeups.upsert(&self.user_id, wakeup)).await?;
        info!(
            user_id = %self.user_id,
            alarm_instant = %alarm_instant,
            with_photo = stored
                .acknowledgment
                .as_ref()
                .is_some_and(|ack| ack.photo_reference.is_some()),
            "wakeup acknowledged"
        );
        self.resume_silent_loop();
        Ok(stored)
    }

    pub fn silence(&self) {
        info!(user_id = %self.user_id, "alarm silenced");
        self.resume_silent_loop();
    }

    fn resume_silent_loop(&self) {
        if let Err(err) = self.audio.stop() {
            warn!(%err, "could not stop alarm loop");
        }
        if let Err(err) = self.audio.play_silent_loop() {
            warn!(%err, "could not resume silent loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::audio::{AudioState, LoggingAudioController, Sound};
    use crate::store::memory::{MemoryAlarmConfigStore, MemoryWakeupStore};
    use crate::time_provider::ManualClock;

    fn local(hour: u32, minute: u32, second: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 6, 10, hour, minute, second)
            .single()
            .expect("unambiguous local time")
    }

    fn eight_am_utc() -> DateTime<Utc> {
        local(8, 0, 0).with_timezone(&Utc)
    }

    /// Fails the first `failures` upserts, then behaves like the inner store.
    struct FlakyWakeupStore {
        inner: MemoryWakeupStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl WakeupStore for FlakyWakeupStore {
        async fn latest(&self, user_id: &UserId) -> Result<Option<Wakeup>, StoreError> {
            self.inner.latest(user_id).await
        }

        async fn upsert(&self, user_id: &UserId, wakeup: Wakeup) -> Result<Wakeup, StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("network down".to_string()));
            }
            self.inner.upsert(user_id, wakeup).await
        }
    }

    /// Never answers an upsert within any reasonable timeout.
    struct StalledWakeupStore;

    #[async_trait]
    impl WakeupStore for StalledWakeupStore {
        async fn latest(&self, _user_id: &UserId) -> Result<Option<Wakeup>, StoreError> {
            Ok(None)
        }

        async fn upsert(&self, _user_id: &UserId, wakeup: Wakeup) -> Result<Wakeup, StoreError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(wakeup)
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        audio: Arc<LoggingAudioController>,
        session: WakeupSession,
        events: mpsc::Receiver<WakeupTriggered>,
    }

    fn harness(wakeups: Arc<dyn WakeupStore>, alarm: Option<Alarm>, start: DateTime<Local>) -> Harness {
        let user = UserId::new("uid-a");
        let mut alarms = MemoryAlarmConfigStore::new();
        if let Some(alarm) = alarm {
            alarms = alarms.with_alarm(user.clone(), alarm);
        }
        let clock = Arc::new(ManualClock::new(start));
        let audio = Arc::new(LoggingAudioController::new());
        let collaborators = Collaborators {
            clock: clock.clone(),
            alarms: Arc::new(alarms),
            wakeups,
            audio: audio.clone(),
        };
        let (session, events) = WakeupSession::new(user, SchedulerSettings::default(), collaborators);
        Harness {
            clock,
            audio,
            session,
            events,
        }
    }

    fn eight_am() -> Option<Alarm> {
        Some(Alarm::new(8, 0).expect("valid alarm"))
    }

    #[tokio::test]
    async fn ticks_inside_the_window_trigger_once() {
        let wakeups = Arc::new(MemoryWakeupStore::new());
        let mut h = harness(wakeups.clone(), eight_am(), local(7, 59, 35));

        let mut triggers = 0;
        for _ in 0..6 {
            let outcome = h.session.tick().await.expect("tick");
            if outcome.decision.triggered().is_some() {
                triggers += 1;
            }
            h.clock.advance(chrono::Duration::seconds(5));
        }

        assert_eq!(triggers, 1);
        let event = h.events.try_recv().expect("one event");
        assert_eq!(event.alarm_instant, eight_am_utc());
        assert_eq!(event.user_id, UserId::new("uid-a"));
        assert!(h.events.try_recv().is_err());

        assert_eq!(wakeups.len(), 1);
        assert_eq!(h.audio.current_state(), AudioState::Alarm);
        assert_eq!(h.audio.volume(), Some(1.0));
        assert_eq!(
            *h.session.subscribe_phase().borrow(),
            WakeupPhase::Active {
                alarm_instant: eight_am_utc()
            }
        );
    }

    #[tokio::test]
    async fn no_alarm_means_no_trigger() {
        let wakeups = Arc::new(MemoryWakeupStore::new());
        let mut h = harness(wakeups.clone(), None, local(8, 0, 0));

        let outcome = h.session.tick().await.expect("tick");
        assert_eq!(outcome.decision, TickDecision::NoAlarm);
        assert_eq!(outcome.phase, WakeupPhase::NoAlarm);
        assert!(wakeups.is_empty());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_write_still_fires_once_and_is_retried() {
        let wakeups = Arc::new(FlakyWakeupStore {
            inner: MemoryWakeupStore::new(),
            failures: AtomicUsize::new(1),
        });
        let mut h = harness(wakeups.clone(), eight_am(), local(8, 0, 0));

        let first = h.session.tick().await.expect("tick");
        assert!(first.decision.triggered().is_some());
        assert_eq!(first.pending_writes, 1);
        assert!(first.phase.is_active());
        assert!(h.events.try_recv().is_ok());

        h.clock.advance(chrono::Duration::seconds(5));
        let second = h.session.tick().await.expect("tick");
        assert!(matches!(second.decision, TickDecision::AlreadyHandled { .. }));
        assert_eq!(second.pending_writes, 0);
        assert!(h.events.try_recv().is_err());
        assert_eq!(
            wakeups.inner.latest(&UserId::new("uid-a")).await.expect("latest"),
            Some(Wakeup::pending(eight_am_utc()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out_without_blocking_the_tick() {
        let mut h = harness(Arc::new(StalledWakeupStore), eight_am(), local(8, 0, 0));

        let outcome = h.session.tick().await.expect("tick");
        assert!(outcome.decision.triggered().is_some());
        assert_eq!(outcome.pending_writes, 1);
        assert!(h.events.try_recv().is_ok());
        assert_eq!(h.audio.current_state(), AudioState::Alarm);
    }

    #[tokio::test]
    async fn acknowledgment_closes_the_active_wakeup() {
        let wakeups = Arc::new(MemoryWakeupStore::new());
        let mut h = harness(wakeups.clone(), eight_am(), local(8, 0, 0));
        h.session.tick().await.expect("trigger tick");

        let acknowledger = h.session.acknowledger();
        let ack_at = eight_am_utc() + chrono::Duration::minutes(3);
        let stored = acknowledger
            .acknowledge(eight_am_utc(), ack_at, Some("https://photos.example/1.jpg".to_string()))
            .await
            .expect("ack");
        assert!(stored.is_acknowledged());
        assert_eq!(h.audio.playing(), Some(Sound::SilentLoop));

        h.clock.advance(chrono::Duration::minutes(3));
        let outcome = h.session.tick().await.expect("tick");
        assert_eq!(
            outcome.phase,
            WakeupPhase::Acknowledged {
                alarm_instant: eight_am_utc()
            }
        );

        let err = acknowledger
            .acknowledge(eight_am_utc(), ack_at, None)
            .await
            .expect_err("second ack");
        assert!(matches!(
            err,
            SessionError::Alarm(AlarmError::AlreadyAcknowledged { .. })
        ));
    }

    #[tokio::test]
    async fn silencing_does_not_acknowledge() {
        let wakeups = Arc::new(MemoryWakeupStore::new());
        let mut h = harness(wakeups.clone(), eight_am(), local(8, 0, 0));
        h.session.tick().await.expect("trigger tick");

        h.session.acknowledger().silence();
        assert_eq!(h.audio.current_state(), AudioState::Silent);

        h.clock.advance(chrono::Duration::minutes(10));
        let inside = h.session.tick().await.expect("tick");
        assert!(inside.phase.is_active());

        h.clock.advance(chrono::Duration::minutes(30));
        let past = h.session.tick().await.expect("tick");
        assert_eq!(
            past.phase,
            WakeupPhase::AlarmSet {
                next_trigger: eight_am_utc() + chrono::Duration::days(1)
            }
        );
    }

    #[tokio::test]
    async fn unsilenced_alarm_keeps_wakeup_active_past_the_window() {
        let wakeups = Arc::new(MemoryWakeupStore::new());
        let mut h = harness(wakeups, eight_am(), local(8, 0, 0));
        h.session.tick().await.expect("trigger tick");

        h.clock.advance(chrono::Duration::minutes(45));
        let outcome = h.session.tick().await.expect("tick");
        assert!(outcome.phase.is_active());
    }

    #[tokio::test]
    async fn acknowledging_an_older_occurrence_is_rejected() {
        let wakeups = Arc::new(MemoryWakeupStore::new());
        let h = harness(wakeups.clone(), eight_am(), local(8, 0, 0));
        let user = UserId::new("uid-a");
        let yesterday = eight_am_utc() - chrono::Duration::days(1);
        wakeups
            .upsert(&user, Wakeup::pending(eight_am_utc()))
            .await
            .expect("seed");

        let err = h
            .session
            .acknowledger()
            .acknowledge(yesterday, eight_am_utc(), None)
            .await
            .expect_err("superseded");
        assert!(matches!(err, SessionError::Alarm(AlarmError::Superseded { .. })));
    }

    #[tokio::test]
    async fn acknowledgment_repairs_a_lost_trigger_write() {
        let wakeups = Arc::new(FlakyWakeupStore {
            inner: MemoryWakeupStore::new(),
            failures: AtomicUsize::new(1),
        });
        let mut h = harness(wakeups.clone(), eight_am(), local(8, 0, 0));
        let first = h.session.tick().await.expect("trigger tick");
        assert_eq!(first.pending_writes, 1);
        assert!(wakeups.inner.is_empty());

        let ack_at = eight_am_utc() + chrono::Duration::minutes(2);
        let stored = h
            .session
            .acknowledger()
            .acknowledge(eight_am_utc(), ack_at, None)
            .await
            .expect("ack");
        assert!(stored.is_acknowledged());

        h.clock.advance(chrono::Duration::minutes(2));
        let after = h.session.tick().await.expect("tick");
        assert_eq!(after.pending_writes, 0);
        assert_eq!(
            after.phase,
            WakeupPhase::Acknowledged {
                alarm_instant: eight_am_utc()
            }
        );
        let latest = wakeups
            .inner
            .latest(&UserId::new("uid-a"))
            .await
            .expect("latest")
            .expect("record");
        assert!(latest.is_acknowledged());
    }

    #[tokio::test]
    async fn upcoming_occurrence_cannot_be_acknowledged_in_advance() {
        let wakeups = Arc::new(MemoryWakeupStore::new());
        let mut h = harness(wakeups.clone(), eight_am(), local(7, 0, 0));

        let err = h
            .session
            .acknowledger()
            .acknowledge(eight_am_utc(), local(7, 0, 0).with_timezone(&Utc), None)
            .await
            .expect_err("alarm has not rung yet");
        assert!(matches!(
            err,
            SessionError::Alarm(AlarmError::NotTriggered { .. })
        ));
        assert!(wakeups.is_empty());

        h.clock.set(local(8, 0, 0));
        let outcome = h.session.tick().await.expect("tick");
        assert_eq!(outcome.decision.triggered(), Some(eight_am_utc()));
        assert!(outcome.phase.is_active());
        assert_eq!(h.audio.current_state(), AudioState::Alarm);
    }

    #[tokio::test]
    async fn occurrence_never_fired_in_this_session_cannot_be_acknowledged() {
        let wakeups = Arc::new(MemoryWakeupStore::new());
        let h = harness(wakeups.clone(), eight_am(), local(8, 3, 0));

        let err = h
            .session
            .acknowledger()
            .acknowledge(eight_am_utc(), local(8, 3, 0).with_timezone(&Utc), None)
            .await
            .expect_err("no trigger and no record");
        assert!(matches!(
            err,
            SessionError::Alarm(AlarmError::NotTriggered { .. })
        ));
        assert!(wakeups.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn running_session_fires_and_stops_on_sign_out() {
        let wakeups = Arc::new(MemoryWakeupStore::new());
        let h = harness(wakeups.clone(), eight_am(), local(8, 0, 5));
        let Harness {
            audio,
            session,
            mut events,
            ..
        } = h;

        let handle = session.spawn();
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        assert_eq!(event.alarm_instant, eight_am_utc());
        assert_eq!(audio.current_state(), AudioState::Alarm);

        handle.sign_out().await;
        assert_eq!(audio.playing(), None);
        assert_eq!(wakeups.len(), 1);
    }
}
