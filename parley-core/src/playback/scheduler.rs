//! Gapless scheduler with barge-in.
//!
//! ```text
//! enqueue(b)   start = max(next_start_time, now)
//!              next_start_time = start + b.duration
//! interrupt()  device.stop_all(), cancel every live handle, next_start_time = 0
//! shutdown()   interrupt + close the device, later calls are no-ops
//! ```
//!
//! The cursor and the live set sit behind one mutex and device calls are made
//! while it is held, so an interrupt can never interleave with an enqueue.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{HandleId, OutputDevice, PlaybackHandle};
use crate::buffering::frame::DecodedBuffer;

/// Counters describing what the scheduler has done since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScheduleStats {
    pub enqueued: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub interrupts: u64,
    /// Buffers that arrived after their chained start time had already
    /// passed while a model turn was streaming.
    pub late_starts: u64,
    /// Total time the late buffers missed their chained start by.
    pub late_seconds: f64,
}

struct ScheduleState {
    next_start_time: f64,
    live: BTreeMap<HandleId, PlaybackHandle>,
    next_id: u64,
    closed: bool,
    /// Set by the first buffer of a model turn, cleared at turn end or interrupt.
    turn_open: bool,
    stats: ScheduleStats,
}

impl ScheduleState {
    fn allocate_id(&mut self) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Drop handles whose playback has finished by `now`.
    fn reap(&mut self, now: f64) {
        let before = self.live.len();
        self.live.retain(|_, handle| now < handle.end_at());
        self.stats.completed += (before - self.live.len()) as u64;
    }

    /// The live set mirrors the device's voices, so one `stop_all` covers
    /// every handle.
    fn cancel_all(&mut self, device: &dyn OutputDevice) -> usize {
        let count = self.live.len();
        device.stop_all();
        for handle in std::mem::take(&mut self.live).into_values() {
            handle.cancel();
        }
        self.stats.cancelled += count as u64;
        self.next_start_time = 0.0;
        self.turn_open = false;
        count
    }
}

pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    state: Mutex<ScheduleState>,
}

impl PlaybackScheduler {
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(ScheduleState {
                next_start_time: 0.0,
                live: BTreeMap::new(),
                next_id: 1,
                closed: false,
                turn_open: false,
                stats: ScheduleStats::default(),
            }),
        }
    }

    /// Append `buffer` to the timeline directly after the previous one.
    ///
    /// If the chained start time has already passed the buffer starts now.
    /// After [`shutdown`](Self::shutdown) the buffer is discarded and the
    /// returned handle is already cancelled.
    pub fn enqueue(&self, buffer: DecodedBuffer) -> PlaybackHandle {
        let mut state = self.state.lock();
        let id = state.allocate_id();

        if state.closed {
            let handle = PlaybackHandle::new(id, 0.0, buffer.duration);
            handle.cancel();
            debug!(%id, "enqueue after shutdown ignored");
            return handle;
        }

        let now = self.device.now();
        state.reap(now);

        let pending = state.next_start_time;
        if state.turn_open && pending < now {
            let missed = now - pending;
            state.stats.late_starts += 1;
            state.stats.late_seconds += missed;
            warn!(%id, missed_ms = missed * 1000.0, "playback buffer decoded late");
        }

        let start_at = pending.max(now);
        let duration = buffer.duration;
        state.next_start_time = start_at + duration;
        state.turn_open = true;

        let handle = PlaybackHandle::new(id, start_at, duration);
        self.device.start(id, buffer, start_at);
        state.live.insert(id, handle.clone());
        state.stats.enqueued += 1;

        debug!(%id, start_at, duration, live = state.live.len(), "buffer scheduled");
        handle
    }

    /// Silence everything immediately and reset the timeline.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let now = self.device.now();
        state.reap(now);
        let stopped = state.cancel_all(self.device.as_ref());
        state.stats.interrupts += 1;
        info!(stopped, at = now, "playback interrupted");
    }

    /// The current model turn finished; a gap before the next turn is not late.
    pub fn mark_turn_complete(&self) {
        self.state.lock().turn_open = false;
    }

    /// Stop all playback and release the device. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let stopped = state.cancel_all(self.device.as_ref());
        state.closed = true;
        self.device.close();
        info!(stopped, "playback shut down");
    }

    pub fn now(&self) -> f64 {
        self.device.now()
    }

    pub fn next_start_time(&self) -> f64 {
        self.state.lock().next_start_time
    }

    /// Number of handles still scheduled or playing.
    pub fn live_count(&self) -> usize {
        let mut state = self.state.lock();
        let now = self.device.now();
        state.reap(now);
        state.live.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> ScheduleStats {
        self.state.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{HandleState, OutputClock};
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        now: Mutex<f64>,
        started: Mutex<Vec<(HandleId, f64)>>,
        stop_alls: Mutex<usize>,
        closes: Mutex<usize>,
    }

    #[derive(Clone, Default)]
    struct FakeDevice(Arc<Recorder>);

    impl FakeDevice {
        fn set_now(&self, t: f64) {
            *self.0.now.lock() = t;
        }
    }

    impl OutputClock for FakeDevice {
        fn now(&self) -> f64 {
            *self.0.now.lock()
        }
    }

    impl OutputDevice for FakeDevice {
        fn start(&self, id: HandleId, _buffer: DecodedBuffer, at: f64) {
            self.0.started.lock().push((id, at));
        }

        fn stop_all(&self) {
            *self.0.stop_alls.lock() += 1;
        }

        fn close(&self) {
            *self.0.closes.lock() += 1;
        }
    }

    fn buffer(seconds: f64) -> DecodedBuffer {
        let frames = (seconds * 24_000.0).round() as usize;
        DecodedBuffer::new(vec![0.0; frames], 24_000, 1)
    }

    fn scheduler() -> (PlaybackScheduler, FakeDevice) {
        let device = FakeDevice::default();
        (PlaybackScheduler::new(Box::new(device.clone())), device)
    }

    #[test]
    fn chains_buffers_without_gaps() {
        let (scheduler, device) = scheduler();
        let a = scheduler.enqueue(buffer(0.5));
        let b = scheduler.enqueue(buffer(0.3));
        let c = scheduler.enqueue(buffer(0.2));

        assert_abs_diff_eq!(a.start_at, 0.0);
        assert_abs_diff_eq!(b.start_at, 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(c.start_at, 0.8, epsilon = 1e-9);
        assert_abs_diff_eq!(scheduler.next_start_time(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(b.start_at, a.end_at(), epsilon = 1e-12);
        assert_abs_diff_eq!(c.start_at, b.end_at(), epsilon = 1e-12);
        assert_eq!(device.0.started.lock().len(), 3);
        assert_eq!(scheduler.live_count(), 3);
    }

    #[test]
    fn interrupt_mid_playback_clears_the_timeline() {
        let (scheduler, device) = scheduler();
        let a = scheduler.enqueue(buffer(0.5));
        let b = scheduler.enqueue(buffer(0.3));
        let c = scheduler.enqueue(buffer(0.2));

        device.set_now(0.6);
        assert_eq!(a.state(0.6), HandleState::Completed);
        assert_eq!(b.state(0.6), HandleState::Playing);
        assert_eq!(c.state(0.6), HandleState::Scheduled);

        scheduler.interrupt();

        assert_eq!(b.state(0.6), HandleState::Cancelled);
        assert_eq!(c.state(0.6), HandleState::Cancelled);
        assert_eq!(a.state(0.6), HandleState::Completed);
        assert_eq!(*device.0.stop_alls.lock(), 1);
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);

        let stats = scheduler.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.interrupts, 1);
    }

    #[test]
    fn enqueue_after_interrupt_starts_at_now() {
        let (scheduler, device) = scheduler();
        scheduler.enqueue(buffer(0.5));
        device.set_now(0.2);
        scheduler.interrupt();

        let next = scheduler.enqueue(buffer(0.3));
        assert_abs_diff_eq!(next.start_at, 0.2);
        assert_abs_diff_eq!(scheduler.next_start_time(), 0.5, epsilon = 1e-9);
        assert_eq!(scheduler.stats().late_starts, 0);
    }

    #[test]
    fn late_decode_starts_immediately_and_is_counted() {
        let (scheduler, device) = scheduler();
        scheduler.enqueue(buffer(0.5));

        device.set_now(0.7);
        let late = scheduler.enqueue(buffer(0.3));
        assert_abs_diff_eq!(late.start_at, 0.7);
        assert_abs_diff_eq!(scheduler.next_start_time(), 1.0, epsilon = 1e-9);

        let stats = scheduler.stats();
        assert_eq!(stats.late_starts, 1);
        assert_abs_diff_eq!(stats.late_seconds, 0.2, epsilon = 1e-9);
    }

    #[test]
    fn gap_between_turns_is_not_late() {
        let (scheduler, device) = scheduler();
        scheduler.enqueue(buffer(0.5));
        scheduler.mark_turn_complete();

        device.set_now(3.0);
        let next = scheduler.enqueue(buffer(0.2));
        assert_abs_diff_eq!(next.start_at, 3.0);
        assert_eq!(scheduler.stats().late_starts, 0);
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[test]
    fn completed_handles_leave_the_live_set() {
        let (scheduler, device) = scheduler();
        scheduler.enqueue(buffer(0.5));
        scheduler.enqueue(buffer(0.3));

        device.set_now(0.5);
        assert_eq!(scheduler.live_count(), 1);
        device.set_now(0.8);
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.stats().completed, 2);
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_new_audio() {
        let (scheduler, device) = scheduler();
        let playing = scheduler.enqueue(buffer(0.5));

        scheduler.shutdown();
        scheduler.shutdown();
        scheduler.interrupt();

        assert!(scheduler.is_closed());
        assert!(playing.is_cancelled());
        assert_eq!(*device.0.closes.lock(), 1);
        assert_eq!(*device.0.stop_alls.lock(), 1);

        let ignored = scheduler.enqueue(buffer(0.2));
        assert!(ignored.is_cancelled());
        assert_eq!(device.0.started.lock().len(), 1);
        assert_eq!(scheduler.stats().interrupts, 0);
    }

    #[test]
    fn interrupt_never_interleaves_with_concurrent_enqueues() {
        let (scheduler, _device) = scheduler();
        let handles: Vec<PlaybackHandle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..250)
                            .map(|_| scheduler.enqueue(buffer(0.01)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for _ in 0..5 {
                std::thread::yield_now();
                scheduler.interrupt();
            }
            workers
                .into_iter()
                .flat_map(|w| w.join().expect("worker thread"))
                .collect()
        });

        let mut survivors: Vec<&PlaybackHandle> =
            handles.iter().filter(|h| !h.is_cancelled()).collect();
        survivors.sort_by_key(|h| h.id);
        assert_eq!(scheduler.live_count(), survivors.len());

        // Everything scheduled before the last reset was cancelled.
        if let Some(first) = survivors.first() {
            assert!(handles
                .iter()
                .filter(|h| h.is_cancelled())
                .all(|h| h.id < first.id));
        }

        // Survivors chain from the reset with no gap.
        let mut cursor = 0.0;
        for handle in &survivors {
            assert_abs_diff_eq!(handle.start_at, cursor, epsilon = 1e-9);
            cursor = handle.end_at();
        }
        assert_abs_diff_eq!(scheduler.next_start_time(), cursor, epsilon = 1e-9);

        let stats = scheduler.stats();
        assert_eq!(stats.enqueued, 1_000);
        assert_eq!(stats.cancelled as usize, handles.len() - survivors.len());
        assert_eq!(stats.interrupts, 5);
    }

    #[test]
    fn handle_ids_are_unique_and_increasing() {
        let (scheduler, _device) = scheduler();
        let ids: Vec<_> = (0..4).map(|_| scheduler.enqueue(buffer(0.1)).id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
