//! Audio devices via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal callbacks run on an OS audio thread at elevated priority. They
//! must not allocate after warm-up, block on a lock, or perform I/O. The
//! microphone callback therefore only downmixes into a reused scratch buffer
//! and pushes into an SPSC ring producer; the speaker callback only mixes
//! voices it was handed over a channel.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Each stream is created, parked and dropped on a dedicated thread;
//! the open result is sent back to the caller over a sync channel.

pub mod device;
pub mod output;
pub mod resample;
pub mod tap;

pub use output::CpalOutput;
pub use tap::{AudioTap, TapWriter};

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::{buffering::AudioProducer, error::{ParleyError, Result}};

/// An open microphone feeding mono f32 samples into a ring.
///
/// The device is released by [`close`](Self::close) or on drop.
pub struct Microphone {
    /// Native capture rate reported by the device (Hz).
    pub sample_rate: u32,
    running: Arc<AtomicBool>,
    overruns: Arc<AtomicU64>,
    errors: Receiver<ParleyError>,
    worker: Option<(std::sync::mpsc::Sender<()>, JoinHandle<()>)>,
}

impl Microphone {
    /// Open the preferred input device (by exact name), falling back to the
    /// system default and then the first available input.
    ///
    /// # Errors
    /// `ParleyError::NoDefaultInputDevice` when no microphone exists, or
    /// `ParleyError::AudioStream` if cpal fails to build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(preferred_device: Option<&str>, producer: AudioProducer) -> Result<Self> {
        let preferred = preferred_device.map(str::to_owned);
        let running = Arc::new(AtomicBool::new(true));
        let overruns = Arc::new(AtomicU64::new(0));
        let (error_tx, errors) = crossbeam_channel::bounded(4);
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let shared = input::Shared {
            running: Arc::clone(&running),
            overruns: Arc::clone(&overruns),
            errors: error_tx,
        };

        let worker = std::thread::Builder::new()
            .name("parley-microphone".into())
            .spawn(move || {
                let (stream, rate) = match input::open(preferred.as_deref(), producer, shared) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                let _ = open_tx.send(Ok(rate));
                let _ = stop_rx.recv();
                drop(stream);
                debug!("input stream released");
            })
            .map_err(ParleyError::Io)?;

        match open_rx.recv() {
            Ok(Ok(sample_rate)) => Ok(Self {
                sample_rate,
                running,
                overruns,
                errors,
                worker: Some((stop_tx, worker)),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(ParleyError::AudioStream(
                    "microphone thread died while opening".into(),
                ))
            }
        }
    }

    #[cfg(not(feature = "audio-cpal"))]
    pub fn open(_preferred_device: Option<&str>, _producer: AudioProducer) -> Result<Self> {
        Err(ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    /// First device error reported by the stream since the last call.
    pub fn take_error(&self) -> Option<ParleyError> {
        self.errors.try_recv().ok()
    }

    /// Samples discarded because the ring was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Stop the callback and release the device. Idempotent.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some((stop_tx, worker)) = self.worker.take() {
            let _ = stop_tx.send(());
            if worker.join().is_err() {
                warn!("microphone thread panicked");
            }
        }
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        self.close();
    }
}

/// Average interleaved frames into `out`, converting each sample with
/// `convert`. `out` is resized to the frame count.
pub(crate) fn downmix_into<T: Copy>(
    data: &[T],
    channels: usize,
    out: &mut Vec<f32>,
    convert: impl Fn(T) -> f32,
) {
    let channels = channels.max(1);
    let frames = data.len() / channels;
    out.resize(frames, 0.0);
    if channels == 1 {
        for (dst, src) in out.iter_mut().zip(data) {
            *dst = convert(*src);
        }
        return;
    }
    for (dst, frame) in out.iter_mut().zip(data.chunks_exact(channels)) {
        let sum: f32 = frame.iter().map(|s| convert(*s)).sum();
        *dst = sum / channels as f32;
    }
}

#[cfg(feature = "audio-cpal")]
mod input {
    use std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    };

    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        Device, SampleFormat, SizedSample, Stream, StreamConfig,
    };
    use crossbeam_channel::Sender;
    use tracing::{error, info, warn};

    use super::downmix_into;
    use crate::{
        buffering::{AudioProducer, Producer},
        error::{ParleyError, Result},
    };

    /// State shared between the callback and the `Microphone` handle.
    pub(super) struct Shared {
        pub running: Arc<AtomicBool>,
        pub overruns: Arc<AtomicU64>,
        pub errors: Sender<ParleyError>,
    }

    fn select_device(host: &cpal::Host, preferred: Option<&str>) -> Result<Device> {
        if let Some(name) = preferred {
            match host.input_devices() {
                Ok(mut devices) => {
                    if let Some(device) =
                        devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    {
                        return Ok(device);
                    }
                    warn!("preferred input device '{}' not found, falling back", name);
                }
                Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
            }
        }

        if let Some(default) = host.default_input_device() {
            return Ok(default);
        }
        let mut devices = host
            .input_devices()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
        let fallback = devices.next().ok_or(ParleyError::NoDefaultInputDevice)?;
        warn!("no default input device, falling back to first available input");
        Ok(fallback)
    }

    pub(super) fn open(
        preferred: Option<&str>,
        producer: AudioProducer,
        shared: Shared,
    ) -> Result<(Stream, u32)> {
        let host = cpal::default_host();
        let device = select_device(&host, preferred)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        info!(sample_rate, channels, ?sample_format, "input config selected");

        let stream = match sample_format {
            SampleFormat::F32 => build::<f32>(&device, &config, producer, shared, |s| s),
            SampleFormat::I16 => {
                build::<i16>(&device, &config, producer, shared, |s| s as f32 / 32768.0)
            }
            SampleFormat::U8 => build::<u8>(&device, &config, producer, shared, |s| {
                (s as f32 - 128.0) / 128.0
            }),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        Ok((stream, sample_rate))
    }

    fn build<T>(
        device: &Device,
        config: &StreamConfig,
        mut producer: AudioProducer,
        shared: Shared,
        convert: fn(T) -> f32,
    ) -> Result<Stream>
    where
        T: SizedSample + Copy + Send + 'static,
    {
        let channels = config.channels as usize;
        let Shared {
            running,
            overruns,
            errors,
        } = shared;
        let mut mono: Vec<f32> = Vec::with_capacity(8_192);

        device
            .build_input_stream(
                config,
                move |data: &[T], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    downmix_into(data, channels, &mut mono, convert);
                    let written = producer.push_slice(&mono);
                    if written < mono.len() {
                        overruns.fetch_add((mono.len() - written) as u64, Ordering::Relaxed);
                    }
                },
                move |err| {
                    error!("input stream error: {err}");
                    let _ = errors.try_send(ParleyError::AudioStream(err.to_string()));
                },
                None,
            )
            .map_err(|e| ParleyError::AudioStream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::downmix_into;

    #[test]
    fn downmixes_interleaved_stereo() {
        let mut out = Vec::new();
        downmix_into(&[0.2f32, 0.4, -1.0, 1.0, 0.5, 0.5], 2, &mut out, |s| s);
        assert_eq!(out.len(), 3);
        approx::assert_abs_diff_eq!(out[0], 0.3, epsilon = 1e-6);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], 0.5);
    }

    #[test]
    fn converts_integer_formats() {
        let mut out = Vec::new();
        downmix_into(&[16_384i16, -32_768], 1, &mut out, |s| s as f32 / 32768.0);
        assert_eq!(out, vec![0.5, -1.0]);

        downmix_into(&[128u8, 255, 0, 0], 2, &mut out, |s| (s as f32 - 128.0) / 128.0);
        assert_eq!(out.len(), 2);
        approx::assert_abs_diff_eq!(out[0], 127.0 / 256.0, epsilon = 1e-6);
        assert_eq!(out[1], -1.0);
    }

    #[test]
    fn drops_a_trailing_partial_frame() {
        let mut out = vec![9.0; 10];
        downmix_into(&[0.1f32, 0.1, 0.1], 2, &mut out, |s| s);
        assert_eq!(out.len(), 1);
    }
}
