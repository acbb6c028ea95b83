//! Gapless playback of model audio.
//!
//! The scheduler never touches hardware directly. It drives an
//! [`OutputDevice`], which owns a monotonic clock (seconds since the device
//! was opened), can start a buffer at an exact clock time and can silence
//! everything at once.
//! `audio::output::CpalOutput` is the real implementation; tests use a manual
//! clock.

pub mod scheduler;

pub use scheduler::{PlaybackScheduler, ScheduleStats};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::buffering::frame::DecodedBuffer;

/// Monotonic playback clock in seconds.
pub trait OutputClock: Send + Sync {
    fn now(&self) -> f64;
}

/// A device that can play decoded buffers at scheduled clock times.
///
/// `start` must not block; a start time already in the past plays from the
/// current position. `stop_all` silences every buffer the device was given,
/// including ones whose start time has not come yet, within one render
/// block, and never fails.
pub trait OutputDevice: OutputClock {
    fn start(&self, id: HandleId, buffer: DecodedBuffer, at: f64);
    fn stop_all(&self);
    /// Release the device. Called once, after `stop_all`.
    fn close(&self);
}

/// Stable identity of one scheduled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a scheduled buffer as seen at a given clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Scheduled,
    Playing,
    Completed,
    Cancelled,
}

/// Handle to one buffer on the output timeline.
///
/// Clones share the cancellation flag, so a handle returned from
/// [`PlaybackScheduler::enqueue`] observes a later interrupt.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    pub id: HandleId,
    pub start_at: f64,
    pub duration: f64,
    cancelled: Arc<AtomicBool>,
}

impl PlaybackHandle {
    pub(crate) fn new(id: HandleId, start_at: f64, duration: f64) -> Self {
        Self {
            id,
            start_at,
            duration,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }

    pub fn state(&self, now: f64) -> HandleState {
        if self.is_cancelled() {
            HandleState::Cancelled
        } else if now < self.start_at {
            HandleState::Scheduled
        } else if now < self.end_at() {
            HandleState::Playing
        } else {
            HandleState::Completed
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_state_follows_the_clock() {
        let handle = PlaybackHandle::new(HandleId(1), 0.5, 0.3);
        assert_eq!(handle.state(0.2), HandleState::Scheduled);
        assert_eq!(handle.state(0.5), HandleState::Playing);
        assert_eq!(handle.state(0.79), HandleState::Playing);
        assert_eq!(handle.state(0.8), HandleState::Completed);
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let handle = PlaybackHandle::new(HandleId(2), 0.0, 1.0);
        let observer = handle.clone();
        handle.cancel();
        assert_eq!(observer.state(0.5), HandleState::Cancelled);
        assert_eq!(observer.state(5.0), HandleState::Cancelled);
    }
}
