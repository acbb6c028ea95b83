//! # parley-core
//!
//! Full-duplex voice session engine for a remote speech model.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → SPSC RingBuffer → CaptureSession(thread) → resample → PCM16
//!                                                            │
//!                                           RemoteLink.outbound (bounded)
//!                                                            │
//!                                                      remote model
//!                                                            │
//!                    RemoteLink.inbound → route(task) → decode → PlaybackScheduler
//!                                                            │
//!                                          OutputDevice mixer → speaker + AudioTap
//! ```
//!
//! Audio callbacks never allocate or block; all heap work happens on the
//! capture thread and the inbound task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod engine;
pub mod error;
pub mod events;
pub mod playback;
pub mod protocol;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::{AudioTap, CpalOutput};
pub use engine::{
    AudioBackend, CaptureConfig, CaptureSnapshot, CpalBackend, DuplexSession, PlaybackConfig,
    SessionConfig,
};
pub use error::ParleyError;
pub use events::{NoopObserver, SessionObserver, SessionStatus, SessionStatusEvent};
pub use playback::{PlaybackHandle, PlaybackScheduler, ScheduleStats};
pub use transport::{Connector, LiveConnector, RemoteEndpoint, SessionSetup};
