//! `DuplexSession`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! DuplexSession::new(backend)                       Idle
//!     └─► connect()     speaker + tap, microphone,  Connecting
//!         │             handshake, capture, inbound Open
//!         ├─► disconnect()                          Closing → Closed
//!         ├─► remote close                          Closed
//!         └─► remote / device failure               Error
//! ```
//!
//! A session can connect again from `Closed` or `Error`.
//!
//! ## Teardown
//!
//! Everything a connection owns lives in one `Connection` value inside an
//! `Option`. Whoever takes it (host disconnect, remote close, a fault, or a
//! failed connect) tears it down and fires the single terminal callback; a
//! later attempt finds `None` and does nothing. A connect that loses this race
//! returns `ConnectAborted` and cleans up only what it opened itself.
//!
//! ## Threading
//!
//! Device open happens on dedicated audio threads (see `audio`). The capture
//! cadence is a plain OS thread; inbound routing is one tokio task per
//! connection, so decode and scheduling happen strictly in arrival order.
//! Teardown joins the device threads. When the session ends on its own, or a
//! connect fails, that runs on tokio's blocking pool.

pub mod backend;
pub mod capture;

pub use backend::{AudioBackend, CaptureStream, CpalBackend, InputDevice};
pub use capture::{CaptureDiagnostics, CaptureSession, CaptureSnapshot};

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    audio::tap::{AudioTap, DEFAULT_FFT_SIZE},
    codec::{decode, PcmFormat},
    error::{ParleyError, Result},
    events::{SessionObserver, SessionStatus, SessionStatusEvent},
    playback::{PlaybackScheduler, ScheduleStats},
    protocol::ServerMessage,
    transport::{Connector, LinkCloser, RemoteEndpoint, TransportEvent},
};

/// Status events buffered for slow subscribers.
const BROADCAST_CAP: usize = 64;

/// Microphone side of the session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Wire sample rate (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Samples per outbound frame at the wire rate. Default: 4096 (256 ms).
    pub frame_size: usize,
    /// Input device name; `None` uses the system default.
    pub preferred_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_size: 4_096,
            preferred_device: None,
        }
    }
}

/// Speaker side of the session.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Rate of the model's audio (Hz). Default: 24000.
    pub sample_rate: u32,
    /// Channel count of the model's audio. Default: 1.
    pub channels: u16,
    pub preferred_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            preferred_device: None,
        }
    }
}

/// Configuration for one `connect`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    /// Analyser window handed to the observer. Default: 512.
    pub fft_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            fft_size: DEFAULT_FFT_SIZE,
        }
    }
}

/// Resources owned by one connection.
struct Connection {
    id: u64,
    observer: Arc<dyn SessionObserver>,
    scheduler: Option<Arc<PlaybackScheduler>>,
    capture: Option<CaptureSession>,
    closer: Option<LinkCloser>,
    stop_inbound: Option<oneshot::Sender<()>>,
}

impl Connection {
    fn new(id: u64, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            id,
            observer,
            scheduler: None,
            capture: None,
            closer: None,
            stop_inbound: None,
        }
    }

    /// Stop capture, silence playback, close the link. Returns the final
    /// playback counters if a speaker was open.
    fn release(&mut self) -> Option<ScheduleStats> {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        let stats = self.scheduler.take().map(|scheduler| {
            scheduler.shutdown();
            scheduler.stats()
        });
        if let Some(mut closer) = self.closer.take() {
            closer.close();
        }
        if let Some(stop) = self.stop_inbound.take() {
            let _ = stop.send(());
        }
        stats
    }
}

struct Shared {
    status: Mutex<SessionStatus>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    seq: AtomicU64,
    connections: AtomicU64,
    connection: Mutex<Option<Connection>>,
    capture_diagnostics: Arc<CaptureDiagnostics>,
    last_playback: Mutex<ScheduleStats>,
}

impl Shared {
    fn set_status(&self, status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        info!(?status, seq, "session status");
        let _ = self.status_tx.send(SessionStatusEvent {
            seq,
            status,
            detail,
        });
    }

    fn begin_connect(&self, observer: Arc<dyn SessionObserver>) -> Result<u64> {
        let mut slot = self.connection.lock();
        if slot.is_some() || !self.status.lock().can_connect() {
            return Err(ParleyError::AlreadyConnected);
        }
        let id = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        *slot = Some(Connection::new(id, observer));
        self.capture_diagnostics.reset();
        self.set_status(SessionStatus::Connecting, None);
        Ok(id)
    }

    /// Run `f` on connection `id` if it is still the current one.
    fn attach(&self, id: u64, f: impl FnOnce(&mut Connection)) -> bool {
        match self.connection.lock().as_mut() {
            Some(connection) if connection.id == id => {
                f(connection);
                true
            }
            _ => false,
        }
    }

    /// Take the current connection; with `Some(id)` only if it is that one.
    fn take(&self, id: Option<u64>) -> Option<Connection> {
        let mut slot = self.connection.lock();
        let current = match (slot.as_ref(), id) {
            (Some(connection), Some(id)) => connection.id == id,
            _ => true,
        };
        if current {
            slot.take()
        } else {
            None
        }
    }

    /// Tear `connection` down and fire its terminal callback.
    fn finish(&self, mut connection: Connection, status: SessionStatus, cause: Option<&ParleyError>) {
        if let Some(stats) = connection.release() {
            *self.last_playback.lock() = stats;
        }
        self.set_status(status, cause.map(ToString::to_string));
        match cause {
            Some(error) => connection.observer.on_error(error),
            None => connection.observer.on_close(),
        }
        info!(connection = connection.id, ?status, "session torn down");
    }

    /// End connection `id` if it is still current. No-op otherwise.
    fn end(&self, id: u64, status: SessionStatus, cause: Option<&ParleyError>) {
        if let Some(connection) = self.take(Some(id)) {
            self.finish(connection, status, cause);
        }
    }

    fn playback_stats(&self) -> ScheduleStats {
        let live = self
            .connection
            .lock()
            .as_ref()
            .and_then(|c| c.scheduler.as_ref().map(|s| s.stats()));
        live.unwrap_or_else(|| *self.last_playback.lock())
    }
}

/// A full-duplex voice conversation with a remote model.
///
/// `DuplexSession` is `Send + Sync`; wrap it in an `Arc` to call
/// `disconnect` from another task while `connect` is pending.
pub struct DuplexSession {
    backend: Arc<dyn AudioBackend>,
    shared: Arc<Shared>,
}

impl DuplexSession {
    pub fn new(backend: impl AudioBackend + 'static) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            backend: Arc::new(backend),
            shared: Arc::new(Shared {
                status: Mutex::new(SessionStatus::Idle),
                status_tx,
                seq: AtomicU64::new(0),
                connections: AtomicU64::new(0),
                connection: Mutex::new(None),
                capture_diagnostics: Arc::new(CaptureDiagnostics::default()),
                last_playback: Mutex::new(ScheduleStats::default()),
            }),
        }
    }

    /// Open devices, perform the handshake and start streaming.
    ///
    /// On success the session is `Open` and `observer.on_open` has fired.
    /// On failure everything opened so far is released, the session is in
    /// `Error`, `observer.on_error` has fired, and the cause is returned.
    ///
    /// # Errors
    /// - `ParleyError::AlreadyConnected` unless the session is `Idle`,
    ///   `Closed` or `Error`.
    /// - `ParleyError::ConnectAborted` if `disconnect` ran while this call
    ///   was pending (the disconnect already fired `on_close`).
    /// - Device, transport or protocol errors from opening the session.
    pub async fn connect<C: Connector>(
        &self,
        connector: &C,
        endpoint: &RemoteEndpoint,
        config: SessionConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<()> {
        let id = self.shared.begin_connect(Arc::clone(&observer))?;
        info!(connection = id, "session connecting");

        match self.establish(id, connector, endpoint, &config, observer.as_ref()).await {
            Ok(()) => Ok(()),
            Err(ParleyError::ConnectAborted) => {
                info!(connection = id, "connect aborted by disconnect");
                Err(ParleyError::ConnectAborted)
            }
            Err(e) => {
                error!(connection = id, "session failed to open: {e}");
                let cause = end_off_runtime(&self.shared, id, SessionStatus::Error, Some(e)).await;
                Err(cause.unwrap_or_else(|| anyhow::anyhow!("session teardown panicked").into()))
            }
        }
    }

    async fn establish<C: Connector>(
        &self,
        id: u64,
        connector: &C,
        endpoint: &RemoteEndpoint,
        config: &SessionConfig,
        observer: &dyn SessionObserver,
    ) -> Result<()> {
        let (tap_writer, tap) = AudioTap::new(config.fft_size);
        let output = self.backend.open_output(&config.playback, tap_writer)?;
        let scheduler = Arc::new(PlaybackScheduler::new(output));
        if !self
            .shared
            .attach(id, |c| c.scheduler = Some(Arc::clone(&scheduler)))
        {
            scheduler.shutdown();
            return Err(ParleyError::ConnectAborted);
        }
        observer.on_audio_tap(tap);

        let mut stream = self.backend.open_input(&config.capture)?;
        let link = match connector.connect(endpoint).await {
            Ok(link) => link,
            Err(e) => {
                stream.device.close();
                return Err(e);
            }
        };
        let (outbound, inbound, mut closer) = link.into_parts();

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        {
            let mut slot = self.shared.connection.lock();
            let connection = match slot.as_mut() {
                Some(connection) if connection.id == id => connection,
                _ => {
                    drop(slot);
                    closer.close();
                    stream.device.close();
                    return Err(ParleyError::ConnectAborted);
                }
            };
            connection.closer = Some(closer);
            connection.capture = Some(CaptureSession::start(
                stream,
                &config.capture,
                outbound,
                fault_tx,
                Arc::clone(&self.shared.capture_diagnostics),
            )?);
            connection.stop_inbound = Some(stop_tx);
            self.shared.set_status(SessionStatus::Open, None);
            // Still holding the slot: no teardown path can run before this.
            observer.on_open();
        }

        tokio::spawn(run_inbound(Inbound {
            shared: Arc::clone(&self.shared),
            id,
            scheduler,
            events: inbound,
            faults: fault_rx,
            stop: stop_rx,
            playback: config.playback.clone(),
        }));
        Ok(())
    }

    /// Tear the session down: stop capture, silence playback, close the
    /// link. Fires `on_close`. Idempotent; a no-op when nothing is running.
    ///
    /// Returns once the device threads have exited, which takes up to one
    /// capture poll interval. From async code prefer
    /// `tokio::task::spawn_blocking` when that matters.
    pub fn disconnect(&self) {
        let Some(connection) = self.shared.take(None) else {
            debug!("disconnect: nothing to tear down");
            return;
        };
        self.shared.set_status(SessionStatus::Closing, None);
        self.shared.finish(connection, SessionStatus::Closed, None);
    }

    pub fn state(&self) -> SessionStatus {
        *self.shared.status.lock()
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    /// Playback counters of the current connection, or of the last one.
    pub fn playback_stats(&self) -> ScheduleStats {
        self.shared.playback_stats()
    }

    /// Capture counters since the last `connect`.
    pub fn capture_stats(&self) -> CaptureSnapshot {
        self.shared.capture_diagnostics.snapshot()
    }
}

impl Drop for DuplexSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct Inbound {
    shared: Arc<Shared>,
    id: u64,
    scheduler: Arc<PlaybackScheduler>,
    events: mpsc::Receiver<TransportEvent>,
    faults: mpsc::UnboundedReceiver<ParleyError>,
    stop: oneshot::Receiver<()>,
    playback: PlaybackConfig,
}

async fn run_inbound(mut task: Inbound) {
    let default_mime = PcmFormat::with_rate(task.playback.sample_rate).mime_type();

    let (status, cause) = loop {
        tokio::select! {
            biased;
            _ = &mut task.stop => {
                debug!(connection = task.id, "inbound routing stopped");
                return;
            }
            Some(fault) = task.faults.recv() => break (SessionStatus::Error, Some(fault)),
            event = task.events.recv() => match event {
                Some(TransportEvent::Message(message)) => {
                    route(&task.scheduler, message, &task.playback, &default_mime);
                }
                Some(TransportEvent::Closed { reason }) => {
                    info!(reason = reason.as_deref().unwrap_or(""), "remote closed the session");
                    break (SessionStatus::Closed, None);
                }
                Some(TransportEvent::Error(detail)) => {
                    let cause = ParleyError::Transport(detail);
                    error!("transport failed: {cause}");
                    break (SessionStatus::Error, Some(cause));
                }
                None => break (SessionStatus::Closed, None),
            },
        }
    };
    end_off_runtime(&task.shared, task.id, status, cause).await;
    debug!(connection = task.id, "inbound routing finished");
}

/// End connection `id` on the blocking pool, since releasing the devices
/// joins their threads. Hands `cause` back once the observer has seen it.
async fn end_off_runtime(
    shared: &Arc<Shared>,
    id: u64,
    status: SessionStatus,
    cause: Option<ParleyError>,
) -> Option<ParleyError> {
    let shared = Arc::clone(shared);
    let teardown = tokio::task::spawn_blocking(move || {
        shared.end(id, status, cause.as_ref());
        cause
    });
    match teardown.await {
        Ok(cause) => cause,
        Err(e) => {
            error!(connection = id, "session teardown panicked: {e}");
            None
        }
    }
}

/// Apply one server message: schedule its audio, then honour an interrupt
/// or end of turn.
fn route(
    scheduler: &PlaybackScheduler,
    message: ServerMessage,
    playback: &PlaybackConfig,
    default_mime: &str,
) {
    let interrupted = message.is_interrupted();
    let turn_complete = message.is_turn_complete();

    for blob in message.audio_blobs() {
        let decoded = blob
            .into_chunk(default_mime)
            .and_then(|chunk| decode(chunk, playback.sample_rate, playback.channels));
        match decoded {
            Ok(buffer) => {
                scheduler.enqueue(buffer);
            }
            Err(e) => warn!("dropping model audio chunk: {e}"),
        }
    }

    if interrupted {
        scheduler.interrupt();
    }
    if turn_complete {
        scheduler.mark_turn_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffering::frame::DecodedBuffer,
        codec::EncodedChunk,
        playback::{HandleId, OutputClock, OutputDevice},
    };

    #[derive(Default)]
    struct Log {
        started: Mutex<Vec<HandleId>>,
        stop_alls: Mutex<usize>,
    }

    struct Speaker(Arc<Log>);

    impl OutputClock for Speaker {
        fn now(&self) -> f64 {
            0.0
        }
    }

    impl OutputDevice for Speaker {
        fn start(&self, id: HandleId, _buffer: DecodedBuffer, _at: f64) {
            self.0.started.lock().push(id);
        }

        fn stop_all(&self) {
            *self.0.stop_alls.lock() += 1;
        }

        fn close(&self) {}
    }

    fn scheduler() -> (Arc<Log>, PlaybackScheduler) {
        let log = Arc::new(Log::default());
        let scheduler = PlaybackScheduler::new(Box::new(Speaker(Arc::clone(&log))));
        (log, scheduler)
    }

    #[test]
    fn defaults_match_the_wire_format() {
        let config = SessionConfig::default();
        assert_eq!(config.capture.sample_rate, 16_000);
        assert_eq!(config.capture.frame_size, 4_096);
        assert_eq!(config.playback.sample_rate, 24_000);
        assert_eq!(config.playback.channels, 1);
        assert_eq!(config.fft_size, 512);
    }

    #[test]
    fn interrupt_in_the_same_message_cancels_its_audio() {
        let (log, scheduler) = scheduler();
        let playback = PlaybackConfig::default();
        let mut message =
            ServerMessage::model_audio(&EncodedChunk::new(vec![0; 480], "audio/pcm;rate=24000"));
        if let Some(content) = message.server_content.as_mut() {
            content.interrupted = true;
        }

        route(&scheduler, message, &playback, "audio/pcm;rate=24000");

        assert_eq!(log.started.lock().len(), 1);
        assert_eq!(*log.stop_alls.lock(), 1);
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.stats().interrupts, 1);
    }

    #[test]
    fn turn_complete_ends_the_turn_without_stopping_audio() {
        let (log, scheduler) = scheduler();
        let playback = PlaybackConfig::default();
        let mut message =
            ServerMessage::model_audio(&EncodedChunk::new(vec![0; 480], "audio/pcm;rate=24000"));
        if let Some(content) = message.server_content.as_mut() {
            content.turn_complete = true;
        }

        route(&scheduler, message, &playback, "audio/pcm;rate=24000");

        assert_eq!(log.started.lock().len(), 1);
        assert_eq!(*log.stop_alls.lock(), 0);
        assert_eq!(scheduler.live_count(), 1);
    }

    #[test]
    fn messages_without_audio_leave_the_schedule_alone() {
        let (log, scheduler) = scheduler();
        let message: ServerMessage =
            serde_json::from_str(r#"{"serverContent":{"modelTurn":{"parts":[{"text":"hi"}]}},"usageMetadata":{}}"#)
                .expect("parse");

        route(&scheduler, message, &PlaybackConfig::default(), "audio/pcm;rate=24000");

        assert!(log.started.lock().is_empty());
        assert_eq!(scheduler.stats(), ScheduleStats::default());
    }
}
