use thiserror::Error;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote did not acknowledge the session within {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("connect aborted by a concurrent disconnect")]
    ConnectAborted,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Microphone or speaker could not be opened or failed mid-session.
    pub fn is_capture_failure(&self) -> bool {
        matches!(
            self,
            Self::AudioDevice(_)
                | Self::AudioStream(_)
                | Self::NoDefaultInputDevice
                | Self::NoDefaultOutputDevice
        )
    }

    /// The remote channel failed, closed unexpectedly, or never acknowledged.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ConnectTimeout(_) | Self::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
