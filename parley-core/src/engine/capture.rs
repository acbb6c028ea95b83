//! Capture cadence loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Check the device for a fault; report it once and stop; copy its
//!    overrun count
//! 2. Drain the ring buffer
//! 3. Resample device rate → wire rate
//! 4. Slice fixed-size frames, encode, base64-wrap
//! 5. try_send on the outbound queue; a full queue drops the frame
//! ```
//!
//! The loop runs on its own OS thread and never awaits, so a slow network
//! can cost frames but can never stall the microphone.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use super::{backend::CaptureStream, CaptureConfig};
use crate::{
    audio::resample::RateConverter,
    buffering::{frame::AudioFrame, Consumer},
    codec::encode,
    error::{ParleyError, Result},
    protocol::RealtimeInput,
};

/// Samples drained from the ring per iteration.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const IDLE_SLEEP: Duration = Duration::from_millis(5);

#[derive(Default)]
pub struct CaptureDiagnostics {
    pub samples_in: AtomicUsize,
    pub frames_encoded: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    /// Device samples lost before they reached the ring.
    pub overruns: AtomicU64,
}

impl CaptureDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.frames_encoded.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub samples_in: usize,
    pub frames_encoded: usize,
    pub frames_sent: usize,
    pub frames_dropped: usize,
    pub overruns: u64,
}

/// A running capture cadence. Stops on [`stop`](Self::stop) or drop.
pub struct CaptureSession {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    diagnostics: Arc<CaptureDiagnostics>,
}

struct Cadence {
    stream: CaptureStream,
    resampler: RateConverter,
    frame_size: usize,
    wire_rate: u32,
    outbound: mpsc::Sender<RealtimeInput>,
    faults: mpsc::UnboundedSender<ParleyError>,
    running: Arc<AtomicBool>,
    diagnostics: Arc<CaptureDiagnostics>,
}

impl CaptureSession {
    /// Start streaming `stream` to `outbound`.
    ///
    /// Audio that queued in the ring before this call is discarded. A device
    /// fault is reported once on `faults`, after which the cadence stops.
    ///
    /// # Errors
    /// `ParleyError::AudioDevice` if the rate converter cannot be built, or
    /// `ParleyError::Io` if the thread cannot be spawned.
    pub fn start(
        mut stream: CaptureStream,
        config: &CaptureConfig,
        outbound: mpsc::Sender<RealtimeInput>,
        faults: mpsc::UnboundedSender<ParleyError>,
        diagnostics: Arc<CaptureDiagnostics>,
    ) -> Result<Self> {
        let resampler = RateConverter::new(stream.sample_rate, config.sample_rate, DRAIN_CHUNK)?;
        let stale = stream.consumer.clear();
        if stale > 0 {
            debug!(stale, "discarded stale capture samples");
        }

        let running = Arc::new(AtomicBool::new(true));
        let cadence = Cadence {
            stream,
            resampler,
            frame_size: config.frame_size.max(1),
            wire_rate: config.sample_rate,
            outbound,
            faults,
            running: Arc::clone(&running),
            diagnostics: Arc::clone(&diagnostics),
        };

        let worker = std::thread::Builder::new()
            .name("parley-capture".into())
            .spawn(move || cadence.run())
            .map_err(ParleyError::Io)?;

        info!(
            frame_size = config.frame_size,
            wire_rate = config.sample_rate,
            "capture started"
        );
        Ok(Self {
            running,
            worker: Some(worker),
            diagnostics,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn diagnostics(&self) -> CaptureSnapshot {
        self.diagnostics.snapshot()
    }

    /// Stop the cadence and release the microphone. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("capture thread panicked");
            }
            info!("capture stopped");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Cadence {
    fn run(mut self) {
        let mut raw = vec![0f32; DRAIN_CHUNK];
        let mut pending: Vec<f32> = Vec::with_capacity(self.frame_size * 2);

        while self.running.load(Ordering::Acquire) {
            if let Some(fault) = self.stream.device.take_error() {
                error!("microphone failed: {fault}");
                let _ = self.faults.send(fault);
                break;
            }
            self.diagnostics
                .overruns
                .store(self.stream.device.overruns(), Ordering::Relaxed);

            let n = self.stream.consumer.pop_slice(&mut raw);
            if n == 0 {
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            self.diagnostics.samples_in.fetch_add(n, Ordering::Relaxed);

            self.resampler.process_into(&raw[..n], &mut pending);
            while pending.len() >= self.frame_size {
                let samples: Vec<f32> = pending.drain(..self.frame_size).collect();
                self.ship(AudioFrame::new(samples, self.wire_rate));
            }
        }

        self.stream.device.close();
        self.running.store(false, Ordering::Release);
    }

    fn ship(&self, frame: AudioFrame) {
        let chunk = encode(frame);
        self.diagnostics.frames_encoded.fetch_add(1, Ordering::Relaxed);

        match self.outbound.try_send(RealtimeInput::audio(&chunk)) {
            Ok(()) => {
                self.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
                debug!(bytes = chunk.data.len(), "capture frame sent");
            }
            Err(TrySendError::Full(_)) => {
                self.diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("outbound queue full, capture frame dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("outbound channel closed, capture frame dropped");
            }
        }
    }
}
