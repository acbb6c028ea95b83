//! Parley console host.
//!
//! Opens the default (or configured) microphone and speaker, connects to the
//! live model and holds the conversation until Ctrl-C or until the remote
//! ends the session.
//!
//! ```text
//! parley                 start a conversation
//! parley --list-devices  print audio devices and exit
//! ```

mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use parking_lot::Mutex;
use parley_core::{
    audio::device::{list_input_devices, list_output_devices, DeviceInfo},
    AudioTap, CpalBackend, DuplexSession, LiveConnector, ParleyError, SessionObserver,
    SessionStatus, SessionStatusEvent,
};
use settings::{default_settings_path, load_settings};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

/// How often the output level is sampled for the console meter.
const LEVEL_INTERVAL: Duration = Duration::from_millis(250);

/// Routes session callbacks to the log and keeps the analyser for the meter.
#[derive(Default)]
struct ConsoleObserver {
    tap: Mutex<Option<AudioTap>>,
}

impl SessionObserver for ConsoleObserver {
    fn on_open(&self) {
        info!("conversation open, start talking");
    }

    fn on_close(&self) {
        info!("conversation closed");
    }

    fn on_error(&self, error: &ParleyError) {
        if error.is_capture_failure() {
            error!("audio device failed: {error}");
        } else if error.is_transport_failure() {
            error!("connection to the model failed: {error}");
        } else {
            error!("session failed: {error}");
        }
    }

    fn on_audio_tap(&self, tap: AudioTap) {
        *self.tap.lock() = Some(tap);
    }
}

fn print_devices(title: &str, devices: &[DeviceInfo]) {
    println!("{title}:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{marker}", device.name);
    }
}

/// Log a coarse speaker level until the task is aborted.
async fn run_level_meter(mut tap: AudioTap) {
    let mut ticker = tokio::time::interval(LEVEL_INTERVAL);
    let mut bins = vec![0u8; tap.frequency_bin_count()];
    loop {
        ticker.tick().await;
        let level = tap.level();
        tap.byte_frequency_data(&mut bins);
        let peak_bin = bins
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
            .map(|(i, _)| i)
            .unwrap_or(0);
        debug!(level, peak_bin, "speaker level");
    }
}

/// Wait until the session reaches a terminal state.
async fn wait_for_end(status: &mut broadcast::Receiver<SessionStatusEvent>) -> SessionStatus {
    loop {
        match status.recv().await {
            Ok(event) if matches!(event.status, SessionStatus::Closed | SessionStatus::Error) => {
                return event.status;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "status events lagged"),
            Err(RecvError::Closed) => return SessionStatus::Closed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley=info,parley_core=info")),
        )
        .init();

    if std::env::args().skip(1).any(|arg| arg == "--list-devices") {
        print_devices("Input devices", &list_input_devices());
        print_devices("Output devices", &list_output_devices());
        return Ok(());
    }

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = default_settings_path();
    let mut app_settings = load_settings(&settings_path);
    app_settings.apply_env();
    info!(
        settings_path = ?settings_path,
        model = %app_settings.model,
        voice = app_settings.voice_name.as_deref().unwrap_or("default"),
        input = app_settings.preferred_input_device.as_deref().unwrap_or("default"),
        output = app_settings.preferred_output_device.as_deref().unwrap_or("default"),
        "runtime settings loaded"
    );
    if app_settings.api_key.is_none() {
        bail!(
            "no API key: set GEMINI_API_KEY or add \"apiKey\" to {}",
            settings_path.display()
        );
    }

    // ── Session ───────────────────────────────────────────────────────────
    let session = DuplexSession::new(CpalBackend);
    let observer = Arc::new(ConsoleObserver::default());
    let mut status = session.subscribe_status();

    session
        .connect(
            &LiveConnector::new(),
            &app_settings.endpoint(),
            app_settings.session_config(),
            observer.clone(),
        )
        .await
        .context("failed to start the conversation")?;

    let meter = observer.tap.lock().take().map(|tap| tokio::spawn(run_level_meter(tap)));

    let ended_by = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("ctrl-c handler failed: {e}");
            }
            info!("interrupt received, hanging up");
            None
        }
        end = wait_for_end(&mut status) => Some(end),
    };

    session.disconnect();
    if let Some(meter) = meter {
        meter.abort();
    }

    let playback = session.playback_stats();
    let capture = session.capture_stats();
    info!(
        frames_sent = capture.frames_sent,
        frames_dropped = capture.frames_dropped,
        mic_overruns = capture.overruns,
        buffers_played = playback.enqueued,
        interrupts = playback.interrupts,
        late_starts = playback.late_starts,
        "session summary"
    );

    if ended_by == Some(SessionStatus::Error) {
        bail!("the conversation ended with an error");
    }
    Ok(())
}
