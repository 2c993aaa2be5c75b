use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AudioState {
    Silent,
    Alarm,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Sound {
    SilentLoop,
    AlarmLoop,
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("volume {0} is outside 0.0..=1.0")]
    InvalidVolume(f32),
    #[error("audio controller state lock poisoned")]
    Poisoned,
}

/// Sound output used by the wake-up session.
///
/// Loops play until replaced or stopped. Starting a loop replaces whatever
/// is playing.
pub trait AlarmAudioController: Send + Sync {
    fn play_silent_loop(&self) -> Result<(), AudioError>;
    fn play_alarm_loop(&self) -> Result<(), AudioError>;
    fn force_volume(&self, level: f32) -> Result<(), AudioError>;
    fn stop(&self) -> Result<(), AudioError>;
    fn current_state(&self) -> AudioState;
}

#[derive(Debug)]
struct PlaybackState {
    playing: Option<Sound>,
    volume: f32,
}

/// Controller without an output device. Tracks what would be playing and
/// logs every change.
#[derive(Debug)]
pub struct LoggingAudioController {
    state: Mutex<PlaybackState>,
}

impl Default for LoggingAudioController {
    fn default() -> Self {
        Self {
            state: Mutex::new(PlaybackState {
                playing: None,
                volume: 0.5,
            }),
        }
    }
}

impl LoggingAudioController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn playing(&self) -> Option<Sound> {
        self.state.lock().ok().and_then(|state| state.playing)
    }

    #[cfg(test)]
    pub fn volume(&self) -> Option<f32> {
        self.state.lock().ok().map(|state| state.volume)
    }

    fn play(&self, sound: Sound) -> Result<(), AudioError> {
        let mut state = self.state.lock().map_err(|_| AudioError::Poisoned)?;
        if let Some(previous) = state.playing.replace(sound) {
            debug!(?previous, "replacing current loop");
        }
        info!(?sound, volume = state.volume, "loop started");
        Ok(())
    }
}

impl AlarmAudioController for LoggingAudioController {
    fn play_silent_loop(&self) -> Result<(), AudioError> {
        self.play(Sound::SilentLoop)
    }

    fn play_alarm_loop(&self) -> Result<(), AudioError> {
        self.play(Sound::AlarmLoop)
    }

    fn force_volume(&self, level: f32) -> Result<(), AudioError> {
        if !(0.0..=1.0).contains(&level) {
            return Err(AudioError::InvalidVolume(level));
        }
        let mut state = self.state.lock().map_err(|_| AudioError::Poisoned)?;
        state.volume = level;
        info!(volume = level, "volume forced");
        Ok(())
    }

    fn stop(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock().map_err(|_| AudioError::Poisoned)?;
        if let Some(sound) = state.playing.take() {
            info!(?sound, "loop stopped");
        }
        Ok(())
    }

    fn current_state(&self) -> AudioState {
        match self.playing() {
            Some(Sound::AlarmLoop) => AudioState::Alarm,
            _ => AudioState::Silent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_loop_reports_alarm_state_until_stopped() {
        let audio = LoggingAudioController::new();
        assert_eq!(audio.current_state(), AudioState::Silent);

        audio.play_silent_loop().expect("silent");
        assert_eq!(audio.playing(), Some(Sound::SilentLoop));
        assert_eq!(audio.current_state(), AudioState::Silent);

        audio.play_alarm_loop().expect("alarm");
        assert_eq!(audio.current_state(), AudioState::Alarm);

        audio.stop().expect("stop");
        assert_eq!(audio.playing(), None);
        assert_eq!(audio.current_state(), AudioState::Silent);
    }

    #[test]
    fn force_volume_rejects_out_of_range_levels() {
        let audio = LoggingAudioController::new();
        audio.force_volume(1.0).expect("max volume");
        assert_eq!(audio.volume(), Some(1.0));
        assert!(matches!(
            audio.force_volume(1.5),
            Err(AudioError::InvalidVolume(_))
        ));
        assert_eq!(audio.volume(), Some(1.0));
    }
}
