//! Session lifecycle events.
//!
//! Status changes are broadcast as [`SessionStatusEvent`] to any number of
//! subscribers; a single [`SessionObserver`] additionally receives the
//! open/close/error callbacks and the output analyser.

use serde::{Deserialize, Serialize};

use crate::{audio::tap::AudioTap, error::ParleyError};

/// Lifecycle state of a duplex session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, never connected.
    Idle,
    /// Devices opening and handshake in flight.
    Connecting,
    /// Streaming in both directions.
    Open,
    /// Teardown requested by the host.
    Closing,
    /// Torn down cleanly; may connect again.
    Closed,
    /// Torn down after a failure; may connect again.
    Error,
}

impl SessionStatus {
    /// States from which `connect` is allowed.
    pub fn can_connect(self) -> bool {
        matches!(self, Self::Idle | Self::Closed | Self::Error)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Closing)
    }
}

/// Emitted whenever the session changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub status: SessionStatus,
    /// Human-readable detail, e.g. the error message.
    pub detail: Option<String>,
}

/// Host callbacks. Every method defaults to a no-op.
///
/// Per connection, `on_open` fires at most once and at most one of
/// `on_close` / `on_error` fires, never before `on_open` if the connection
/// opened. `on_open` runs while the session holds its connection lock, so it
/// must not call back into `connect` or `disconnect`.
pub trait SessionObserver: Send + Sync {
    fn on_open(&self) {}

    fn on_close(&self) {}

    fn on_error(&self, _error: &ParleyError) {}

    /// Analyser over the speaker output, handed over once the output device
    /// is open. Poll it from the render loop.
    fn on_audio_tap(&self, _tap: AudioTap) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = SessionStatusEvent {
            seq: 4,
            status: SessionStatus::Connecting,
            detail: Some("opening microphone".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["status"], "connecting");
        assert_eq!(json["detail"], "opening microphone");

        let back: SessionStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(back.status, SessionStatus::Connecting);
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<SessionStatus>(r#""Open""#).is_err());
    }

    #[test]
    fn connect_is_allowed_only_from_resting_states() {
        assert!(SessionStatus::Idle.can_connect());
        assert!(SessionStatus::Closed.can_connect());
        assert!(SessionStatus::Error.can_connect());
        assert!(!SessionStatus::Connecting.can_connect());
        assert!(!SessionStatus::Open.can_connect());
        assert!(!SessionStatus::Closing.can_connect());
        assert!(SessionStatus::Closing.is_active());
    }
}
