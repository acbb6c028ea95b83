//! Speaker output via cpal with a sample-accurate voice mixer.
//!
//! # Clock
//!
//! The output clock is the number of frames the callback has rendered divided
//! by the device rate. A buffer scheduled at time `t` begins on frame
//! `round(t * rate)`, so back-to-back buffers chained by the scheduler land on
//! adjacent frames with no gap and no overlap.
//!
//! # Threading
//!
//! Like the microphone, the stream lives on a dedicated thread because
//! `cpal::Stream` is `!Send`. New voices reach the callback through an
//! unbounded crossbeam channel drained at the top of every callback, so a
//! start is never dropped. `stop_all` bumps a stop epoch instead of queueing
//! a command: every voice tagged with an older epoch is discarded on the next
//! block, however many are pending. Voices the callback is done with travel
//! back over a second channel and are dropped on the control side, so the
//! audio thread never frees sample memory.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    audio::tap::TapWriter,
    buffering::{frame::DecodedBuffer, Producer},
    playback::{HandleId, OutputClock, OutputDevice},
};

/// Retired voices the callback can hand back before it frees them itself.
const RETIRED_CAPACITY: usize = 1_024;
/// Voices mixed at once before the mixer has to grow its table.
const VOICE_CAPACITY: usize = 64;

/// One decoded buffer placed on the device timeline.
pub(crate) struct Voice {
    samples: Vec<f32>,
    channels: usize,
    frames: usize,
    /// Source frames advanced per device frame.
    step: f64,
    start_frame: u64,
    /// Stop epoch current when the voice was started.
    epoch: u64,
}

impl Voice {
    fn new(buffer: DecodedBuffer, device_rate: u32, start_frame: u64, epoch: u64) -> Self {
        let channels = buffer.channels.max(1) as usize;
        let frames = buffer.frames();
        Self {
            samples: buffer.samples,
            channels,
            frames,
            step: buffer.sample_rate as f64 / device_rate as f64,
            start_frame,
            epoch,
        }
    }

    /// Linear-interpolated sample for device frame `frame` on `channel`.
    /// `None` once the voice has run past its last source frame.
    #[inline]
    fn sample_at(&self, frame: u64, channel: usize) -> Option<f32> {
        let elapsed = frame.checked_sub(self.start_frame)?;
        let pos = elapsed as f64 * self.step;
        let idx = pos as usize;
        if idx >= self.frames {
            return None;
        }
        let ch = channel.min(self.channels - 1);
        let current = self.samples[idx * self.channels + ch];
        let next = if idx + 1 < self.frames {
            self.samples[(idx + 1) * self.channels + ch]
        } else {
            current
        };
        let frac = (pos - idx as f64) as f32;
        Some(current + (next - current) * frac)
    }

    fn is_finished(&self, frame: u64) -> bool {
        frame >= self.start_frame
            && ((frame - self.start_frame) as f64 * self.step) as usize >= self.frames
    }
}

/// State owned by the real-time callback.
pub(crate) struct Mixer {
    incoming: Receiver<Voice>,
    retired: Sender<Voice>,
    stop_epoch: Arc<AtomicU64>,
    voices: Vec<Voice>,
    device_channels: usize,
    frames_rendered: Arc<AtomicU64>,
    tap: Option<TapWriter>,
    mono: Vec<f32>,
}

impl Mixer {
    fn admit(&mut self, now_frame: u64) {
        while let Ok(mut voice) = self.incoming.try_recv() {
            voice.start_frame = voice.start_frame.max(now_frame);
            self.voices.push(voice);
        }
        // Read after draining: a voice queued before the latest stop_all
        // carries an older epoch and is dropped here.
        let epoch = self.stop_epoch.load(Ordering::Acquire);
        self.retire_where(|voice| voice.epoch < epoch);
    }

    fn retire_where(&mut self, mut done: impl FnMut(&Voice) -> bool) {
        let mut i = 0;
        while i < self.voices.len() {
            if done(&self.voices[i]) {
                let voice = self.voices.swap_remove(i);
                let _ = self.retired.try_send(voice);
            } else {
                i += 1;
            }
        }
    }

    /// Render one interleaved block and advance the clock.
    pub(crate) fn render(&mut self, out: &mut [f32]) {
        let base = self.frames_rendered.load(Ordering::Acquire);
        self.admit(base);

        let ch = self.device_channels;
        let frames = out.len() / ch;
        self.mono.clear();

        for f in 0..frames {
            let frame = base + f as u64;
            let mut mono = 0.0f32;
            for c in 0..ch {
                let mut acc = 0.0f32;
                for voice in &self.voices {
                    if let Some(s) = voice.sample_at(frame, c) {
                        acc += s;
                    }
                }
                out[f * ch + c] = acc.clamp(-1.0, 1.0);
                mono += acc;
            }
            self.mono.push(mono / ch as f32);
        }
        for s in &mut out[frames * ch..] {
            *s = 0.0;
        }

        let end = base + frames as u64;
        self.retire_where(|voice| voice.is_finished(end));

        if let Some(tap) = self.tap.as_mut() {
            tap.push_slice(&self.mono);
        }
        self.frames_rendered.store(end, Ordering::Release);
    }
}

/// Control-side half of an output device: clock, voice sender, stop epoch,
/// and the queue of voices waiting to be freed.
pub(crate) struct VoiceControl {
    device_rate: u32,
    frames_rendered: Arc<AtomicU64>,
    stop_epoch: Arc<AtomicU64>,
    incoming: Sender<Voice>,
    retired: Receiver<Voice>,
}

impl VoiceControl {
    /// Build a matched control half and mixer for a device at `device_rate`.
    pub(crate) fn pair(device_rate: u32, device_channels: u16, tap: Option<TapWriter>) -> (Self, Mixer) {
        let (voice_tx, voice_rx) = crossbeam_channel::unbounded();
        let (retired_tx, retired_rx) = crossbeam_channel::bounded(RETIRED_CAPACITY);
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let stop_epoch = Arc::new(AtomicU64::new(0));
        let mixer = Mixer {
            incoming: voice_rx,
            retired: retired_tx,
            stop_epoch: Arc::clone(&stop_epoch),
            voices: Vec::with_capacity(VOICE_CAPACITY),
            device_channels: device_channels.max(1) as usize,
            frames_rendered: Arc::clone(&frames_rendered),
            tap,
            mono: Vec::with_capacity(8_192),
        };
        let control = Self {
            device_rate,
            frames_rendered,
            stop_epoch,
            incoming: voice_tx,
            retired: retired_rx,
        };
        (control, mixer)
    }

    /// Free whatever the callback has retired since the last call.
    fn collect_retired(&self) {
        while self.retired.try_recv().is_ok() {}
    }
}

impl OutputClock for VoiceControl {
    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }
}

impl OutputDevice for VoiceControl {
    fn start(&self, id: HandleId, buffer: DecodedBuffer, at: f64) {
        self.collect_retired();
        let start_frame = (at.max(0.0) * self.device_rate as f64).round() as u64;
        let epoch = self.stop_epoch.load(Ordering::Acquire);
        let voice = Voice::new(buffer, self.device_rate, start_frame, epoch);
        if self.incoming.send(voice).is_err() {
            debug!(%id, "output stream gone, voice dropped");
        }
    }

    fn stop_all(&self) {
        self.stop_epoch.fetch_add(1, Ordering::AcqRel);
        self.collect_retired();
    }

    fn close(&self) {
        self.stop_all();
    }
}

/// Default (or named) speaker opened through cpal.
pub struct CpalOutput {
    control: VoiceControl,
    /// Device rate in Hz. Buffers at other rates are interpolated.
    pub sample_rate: u32,
    pub channels: u16,
    worker: Mutex<Option<(std::sync::mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl CpalOutput {
    /// Open the output device and start rendering silence.
    ///
    /// Every rendered sample (downmixed to mono) is pushed into `tap`.
    ///
    /// # Errors
    /// `ParleyError::NoDefaultOutputDevice` when there is no speaker, or
    /// `ParleyError::AudioStream` if cpal fails to build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(preferred_device: Option<&str>, tap: TapWriter) -> crate::error::Result<Self> {
        use crate::error::ParleyError;

        let preferred = preferred_device.map(str::to_owned);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<crate::error::Result<(VoiceControl, u32, u16)>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let worker = std::thread::Builder::new()
            .name("parley-output".into())
            .spawn(move || {
                let stream = match stream::open(preferred.as_deref(), tap) {
                    Ok((stream, control, rate, channels)) => {
                        let _ = open_tx.send(Ok((control, rate, channels)));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                // Parked until close(); the stream drops on this thread.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("output stream released");
            })
            .map_err(ParleyError::Io)?;

        match open_rx.recv() {
            Ok(Ok((control, sample_rate, channels))) => Ok(Self {
                control,
                sample_rate,
                channels,
                worker: Mutex::new(Some((stop_tx, worker))),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(ParleyError::AudioStream("output thread died while opening".into()))
            }
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(_preferred_device: Option<&str>, _tap: TapWriter) -> crate::error::Result<Self> {
        Err(crate::error::ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl OutputClock for CpalOutput {
    fn now(&self) -> f64 {
        self.control.now()
    }
}

impl OutputDevice for CpalOutput {
    fn start(&self, id: HandleId, buffer: DecodedBuffer, at: f64) {
        self.control.start(id, buffer, at);
    }

    fn stop_all(&self) {
        self.control.stop_all();
    }

    fn close(&self) {
        let Some((stop_tx, worker)) = self.worker.lock().take() else {
            return;
        };
        self.control.close();
        let _ = stop_tx.send(());
        if worker.join().is_err() {
            warn!("output thread panicked");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "audio-cpal")]
mod stream {
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleFormat, Stream, StreamConfig,
    };
    use tracing::{error, info, warn};

    use super::{Mixer, VoiceControl};
    use crate::{
        audio::tap::TapWriter,
        error::{ParleyError, Result},
    };

    pub(super) fn open(
        preferred_device: Option<&str>,
        tap: TapWriter,
    ) -> Result<(Stream, VoiceControl, u32, u16)> {
        let host = cpal::default_host();
        let device = match preferred_device {
            Some(name) => {
                let found = host
                    .output_devices()
                    .map_err(|e| ParleyError::AudioDevice(e.to_string()))?
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false));
                if found.is_none() {
                    warn!("preferred output device '{}' not found, falling back", name);
                }
                found.or_else(|| host.default_output_device())
            }
            None => host.default_output_device(),
        }
        .ok_or(ParleyError::NoDefaultOutputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        info!(sample_rate, channels, ?sample_format, "output config selected");

        let (control, mut mixer) = VoiceControl::pair(sample_rate, channels, Some(tap));

        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| mixer.render(data),
                |err| error!("output stream error: {err}"),
                None,
            ),
            SampleFormat::I16 => {
                let mut scratch: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _info| {
                        scratch.resize(data.len(), 0.0);
                        render_i16(&mut mixer, &mut scratch, data);
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                )
            }
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        Ok((stream, control, sample_rate, channels))
    }

    fn render_i16(mixer: &mut Mixer, scratch: &mut [f32], out: &mut [i16]) {
        mixer.render(scratch);
        for (dst, src) in out.iter_mut().zip(scratch.iter()) {
            *dst = (src * 32767.0) as i16;
        }
    }
}
