//! Playback session: a passive mirror of the audio sink's event stream.
//!
//! Callers request playback (`play_from_url`, `pause`, volume and mute);
//! the session answers with what the sink must do.  Once playback has been
//! requested only [`MediaEvent`]s move `is_playing` / `is_buffering` and the
//! `Errored` state.
use serde::{Deserialize, Serialize};

use crate::error::{Result, StashError};

pub const DEFAULT_VOLUME: u8 = 80;

/// Logical playback state.
///
/// Transitions:
///   Idle -> Loading -> Playing <-> Paused
///   Loading | Playing -> Errored
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Errored,
}

/// Low-level events reported by the audio sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MediaEvent {
    /// Playback was (re)started.
    Play,
    /// Audio is actually flowing.
    Playing,
    /// Playback stopped, whether we asked for it or the stream ended.
    Pause,
    /// Stalled waiting for data.
    Waiting,
    /// Network, codec or access failure.
    Error { message: String },
}

/// What the sink has to do after a successful `play_from_url`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub url: String,
    /// A different source was loaded and must be torn down first.
    pub replace_source: bool,
    /// The source has to be loaded afresh rather than resumed: it changed,
    /// or the previous attempt ended or failed.
    pub reload: bool,
    /// Output volume (0.0..=1.0) to apply with the new source.
    pub volume: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackSession {
    pub current_url: String,
    pub status: PlaybackStatus,
    pub is_playing: bool,
    pub is_buffering: bool,
    pub is_muted: bool,
    /// 0..=100
    pub volume: u8,
    #[serde(default)]
    pub last_error: String,
}

impl Default for PlaybackSession {
    fn default() -> Self {
        Self::with_preferences(DEFAULT_VOLUME, false)
    }
}

impl PlaybackSession {
    pub fn with_preferences(volume: u8, is_muted: bool) -> Self {
        Self {
            current_url: String::new(),
            status: PlaybackStatus::Idle,
            is_playing: false,
            is_buffering: false,
            is_muted,
            volume: volume.min(100),
            last_error: String::new(),
        }
    }

    /// Request playback of `url`.  A blank URL records `last_error` and leaves
    /// everything else untouched.
    pub fn play_from_url(&mut self, url: &str) -> Result<PlayRequest> {
        if url.trim().is_empty() {
            self.last_error = StashError::EmptyUrl.to_string();
            return Err(StashError::EmptyUrl);
        }

        let same_source = self.current_url == url;
        self.last_error.clear();

        // already live: nothing to restart, and no event would ever end a
        // second Loading phase
        if same_source && self.status == PlaybackStatus::Playing {
            return Ok(PlayRequest {
                url: url.to_string(),
                replace_source: false,
                reload: false,
                volume: self.effective_volume(),
            });
        }

        let replace_source = !self.current_url.is_empty() && !same_source;
        if replace_source {
            // previous source is torn down before the new one is assigned
            self.is_playing = false;
        }
        let reload = !same_source
            || matches!(self.status, PlaybackStatus::Idle | PlaybackStatus::Errored);

        self.current_url = url.to_string();
        self.status = PlaybackStatus::Loading;
        self.is_buffering = true;

        Ok(PlayRequest {
            url: url.to_string(),
            replace_source,
            reload,
            volume: self.effective_volume(),
        })
    }

    /// Returns true when the sink has to be paused.
    pub fn pause(&mut self) -> bool {
        match self.status {
            PlaybackStatus::Playing | PlaybackStatus::Loading => {
                self.status = PlaybackStatus::Paused;
                self.is_playing = false;
                self.is_buffering = false;
                true
            }
            _ => false,
        }
    }

    /// Play/pause button: pause when something is live, otherwise (re)start
    /// the current URL.
    pub fn toggle(&mut self) -> Result<Toggle> {
        if self.is_playing || self.status == PlaybackStatus::Loading {
            self.pause();
            return Ok(Toggle::Pause);
        }
        let url = self.current_url.clone();
        self.play_from_url(&url).map(Toggle::Play)
    }

    /// Store a new volume (clamped to 0..=100).  Raising it above zero
    /// clears mute.  Returns the effective output volume.
    pub fn set_volume(&mut self, volume: i64) -> f32 {
        self.volume = volume.clamp(0, 100) as u8;
        if self.volume > 0 && self.is_muted {
            self.is_muted = false;
        }
        self.effective_volume()
    }

    /// Returns the effective output volume.
    pub fn toggle_mute(&mut self) -> f32 {
        self.is_muted = !self.is_muted;
        self.effective_volume()
    }

    pub fn effective_volume(&self) -> f32 {
        if self.is_muted {
            0.0
        } else {
            f32::from(self.volume) / 100.0
        }
    }

    /// Mirror one event from the sink.
    pub fn apply(&mut self, event: &MediaEvent) {
        match event {
            MediaEvent::Play | MediaEvent::Playing => {
                self.is_playing = true;
                self.is_buffering = false;
                self.status = PlaybackStatus::Playing;
                self.last_error.clear();
            }
            MediaEvent::Pause => {
                self.is_playing = false;
                self.is_buffering = false;
                self.status = match self.status {
                    PlaybackStatus::Errored => PlaybackStatus::Errored,
                    _ if self.current_url.is_empty() => PlaybackStatus::Idle,
                    _ => PlaybackStatus::Paused,
                };
            }
            MediaEvent::Waiting => {
                self.is_buffering = true;
                if self.status != PlaybackStatus::Playing {
                    self.status = PlaybackStatus::Loading;
                }
            }
            MediaEvent::Error { message } => {
                self.is_playing = false;
                self.is_buffering = false;
                self.status = PlaybackStatus::Errored;
                self.last_error = StashError::Playback {
                    message: message.clone(),
                }
                .to_string();
            }
        }
    }

    /// Back to `Idle` with no source; preferences are kept.
    pub fn clear(&mut self) {
        *self = Self::with_preferences(self.volume, self.is_muted);
    }

    /// One-line status, as shown in the player badge.
    pub fn status_line(&self) -> String {
        if !self.last_error.is_empty() && !self.current_url.is_empty() {
            return self.last_error.clone();
        }
        if self.is_buffering {
            return format!("Buffering {}", self.current_url);
        }
        if self.is_playing {
            return format!("Listening to {}", self.current_url);
        }
        if !self.current_url.is_empty() {
            return format!("Paused on {}", self.current_url);
        }
        "No station selected".to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Toggle {
    Play(PlayRequest),
    Pause,
}

/// Volume and mute survive restarts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackPreferences {
    pub volume: u8,
    #[serde(default)]
    pub is_muted: bool,
}

impl Default for PlaybackPreferences {
    fn default() -> Self {
        Self {
            volume: DEFAULT_VOLUME,
            is_muted: false,
        }
    }
}

impl From<&PlaybackSession> for PlaybackPreferences {
    fn from(session: &PlaybackSession) -> Self {
        Self {
            volume: session.volume,
            is_muted: session.is_muted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(url: &str) -> PlaybackSession {
        let mut s = PlaybackSession::default();
        s.play_from_url(url).unwrap();
        s.apply(&MediaEvent::Playing);
        s
    }

    #[test]
    fn blank_url_sets_error_and_keeps_state() {
        let mut s = playing("https://a/live");
        let before = s.clone();
        assert!(matches!(s.play_from_url("  "), Err(StashError::EmptyUrl)));
        assert_eq!(s.last_error, "Please enter a stream URL");
        assert_eq!(s.current_url, before.current_url);
        assert_eq!(s.status, PlaybackStatus::Playing);
        assert!(s.is_playing);
    }

    #[test]
    fn play_enters_loading() {
        let mut s = PlaybackSession::default();
        let req = s.play_from_url("https://a/live").unwrap();
        assert!(!req.replace_source);
        assert!(req.reload);
        assert_eq!(req.volume, 0.8);
        assert_eq!(s.status, PlaybackStatus::Loading);
        assert!(s.is_buffering);
        assert!(!s.is_playing);
    }

    #[test]
    fn switching_station_replaces_source() {
        let mut s = playing("https://a/live");
        let req = s.play_from_url("https://b/live").unwrap();
        assert!(req.replace_source);
        assert!(!s.is_playing);
        assert_eq!(s.current_url, "https://b/live");
    }

    #[test]
    fn resuming_same_url_keeps_source() {
        let mut s = playing("https://a/live");
        s.pause();
        let req = s.play_from_url("https://a/live").unwrap();
        assert!(!req.replace_source);
        assert!(!req.reload);
        assert_eq!(s.status, PlaybackStatus::Loading);
    }

    #[test]
    fn replaying_live_url_stays_playing() {
        let mut s = playing("https://a/live");
        let req = s.play_from_url("https://a/live").unwrap();
        assert!(!req.replace_source);
        assert!(!req.reload);
        assert_eq!(s.status, PlaybackStatus::Playing);
        assert!(s.is_playing);
        assert!(!s.is_buffering);
        assert_eq!(s.status_line(), "Listening to https://a/live");
    }

    #[test]
    fn replaying_after_error_reloads() {
        let mut s = playing("https://a/live");
        s.apply(&MediaEvent::Error {
            message: "network".into(),
        });
        let req = s.play_from_url("https://a/live").unwrap();
        assert!(req.reload);
        assert!(!req.replace_source);
        assert_eq!(s.status, PlaybackStatus::Loading);
        assert_eq!(s.last_error, "");
    }

    #[test]
    fn waiting_then_playing_ends_playing() {
        let mut s = PlaybackSession::default();
        s.play_from_url("https://a/live").unwrap();
        s.apply(&MediaEvent::Waiting);
        s.apply(&MediaEvent::Playing);
        assert!(!s.is_buffering);
        assert!(s.is_playing);
        assert_eq!(s.status, PlaybackStatus::Playing);
    }

    #[test]
    fn playing_then_error_ends_errored() {
        let mut s = PlaybackSession::default();
        s.play_from_url("https://a/live").unwrap();
        s.apply(&MediaEvent::Playing);
        s.apply(&MediaEvent::Error {
            message: "network".into(),
        });
        assert!(!s.is_playing);
        assert!(!s.is_buffering);
        assert_eq!(s.status, PlaybackStatus::Errored);
        assert_eq!(s.last_error, "Failed to play stream: network");
        assert_eq!(s.status_line(), "Failed to play stream: network");
    }

    #[test]
    fn stall_keeps_playing_intent() {
        let mut s = playing("https://a/live");
        s.apply(&MediaEvent::Waiting);
        assert!(s.is_buffering);
        assert_eq!(s.status, PlaybackStatus::Playing);
        assert_eq!(s.status_line(), "Buffering https://a/live");
    }

    #[test]
    fn external_pause_clears_playing() {
        let mut s = playing("https://a/live");
        s.apply(&MediaEvent::Pause);
        assert!(!s.is_playing);
        assert_eq!(s.status, PlaybackStatus::Paused);
        assert_eq!(s.status_line(), "Paused on https://a/live");
    }

    #[test]
    fn pause_is_noop_when_idle_or_paused() {
        let mut s = PlaybackSession::default();
        assert!(!s.pause());
        let mut s = playing("https://a/live");
        assert!(s.pause());
        assert!(!s.pause());
        assert_eq!(s.status, PlaybackStatus::Paused);
    }

    #[test]
    fn toggle_pauses_then_resumes() {
        let mut s = playing("https://a/live");
        assert_eq!(s.toggle().unwrap(), Toggle::Pause);
        match s.toggle().unwrap() {
            Toggle::Play(req) => assert_eq!(req.url, "https://a/live"),
            other => panic!("expected play, got {:?}", other),
        }
    }

    #[test]
    fn toggle_without_station_is_empty_url() {
        let mut s = PlaybackSession::default();
        assert!(matches!(s.toggle(), Err(StashError::EmptyUrl)));
    }

    #[test]
    fn mute_is_independent_of_volume() {
        let mut s = PlaybackSession::default();
        s.set_volume(0);
        s.is_muted = false;
        assert_eq!(s.effective_volume(), 0.0);

        s.set_volume(50);
        s.toggle_mute();
        assert!(s.is_muted);
        assert_eq!(s.effective_volume(), 0.0);
        assert_eq!(s.volume, 50);

        assert_eq!(s.toggle_mute(), 0.5);
    }

    #[test]
    fn raising_volume_unmutes() {
        let mut s = PlaybackSession::default();
        s.toggle_mute();
        assert_eq!(s.set_volume(0), 0.0);
        assert!(s.is_muted);
        assert_eq!(s.set_volume(30), 0.3);
        assert!(!s.is_muted);
    }

    #[test]
    fn volume_is_clamped() {
        let mut s = PlaybackSession::default();
        s.set_volume(250);
        assert_eq!(s.volume, 100);
        s.set_volume(-4);
        assert_eq!(s.volume, 0);
    }

    #[test]
    fn idle_status_line() {
        assert_eq!(PlaybackSession::default().status_line(), "No station selected");
    }
}
