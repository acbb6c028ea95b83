//! Analyser tap over the mixed speaker output.
//!
//! The output callback pushes every rendered (mono) sample into an SPSC
//! ring; [`AudioTap`] drains it on the consumer's schedule and exposes the
//! same views a Web Audio `AnalyserNode` does: smoothed byte frequency data
//! and an overall level. Consumers are expected to poll it once per
//! animation frame.

use std::sync::Arc;

use rustfft::{num_complex::Complex, FftPlanner};

use crate::buffering::{create_ring, AudioConsumer, AudioProducer, Consumer, TAP_RING_CAPACITY};

/// Producer half handed to the output device.
pub type TapWriter = AudioProducer;

pub const DEFAULT_FFT_SIZE: usize = 512;
const MIN_FFT_SIZE: usize = 32;
const MAX_FFT_SIZE: usize = 32_768;

const SMOOTHING: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

pub struct AudioTap {
    consumer: AudioConsumer,
    fft_size: usize,
    /// Most recent `fft_size` output samples, oldest first.
    history: Vec<f32>,
    incoming: Vec<f32>,
    window: Vec<f32>,
    fft: Arc<dyn rustfft::Fft<f32>>,
    fft_buf: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

impl AudioTap {
    /// Create a tap. `fft_size` is rounded to a power of two in `32..=32768`.
    pub fn new(fft_size: usize) -> (TapWriter, AudioTap) {
        let fft_size = fft_size.clamp(MIN_FFT_SIZE, MAX_FFT_SIZE).next_power_of_two();
        let (producer, consumer) = create_ring(TAP_RING_CAPACITY.max(fft_size * 4));
        let fft = Arc::from(FftPlanner::<f32>::new().plan_fft_forward(fft_size));

        let tap = AudioTap {
            consumer,
            fft_size,
            history: vec![0.0; fft_size],
            incoming: vec![0.0; fft_size],
            window: build_blackman_window(fft_size),
            fft,
            fft_buf: vec![Complex::new(0.0, 0.0); fft_size],
            smoothed: vec![0.0; fft_size / 2],
        };
        (producer, tap)
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Fill `out` with smoothed magnitudes mapped onto `0..=255` between
    /// -100 dB and -30 dB. Extra entries in `out` are left untouched.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        self.pull();
        self.analyse();

        let scale = 255.0 / (MAX_DECIBELS - MIN_DECIBELS);
        for (byte, magnitude) in out.iter_mut().zip(&self.smoothed) {
            let db = 20.0 * magnitude.log10();
            *byte = ((db - MIN_DECIBELS) * scale).clamp(0.0, 255.0) as u8;
        }
    }

    /// Copy the latest time-domain window into `out`.
    pub fn float_time_domain_data(&mut self, out: &mut [f32]) {
        self.pull();
        for (dst, src) in out.iter_mut().zip(&self.history) {
            *dst = *src;
        }
    }

    /// RMS of the latest window, in `[0, 1]` for in-range audio.
    pub fn level(&mut self) -> f32 {
        self.pull();
        let sum: f32 = self.history.iter().map(|s| s * s).sum();
        (sum / self.fft_size as f32).sqrt()
    }

    /// Move everything the output callback produced into the history window.
    fn pull(&mut self) {
        loop {
            let n = self.consumer.pop_slice(&mut self.incoming);
            if n == 0 {
                break;
            }
            if n >= self.fft_size {
                self.history.copy_from_slice(&self.incoming[..self.fft_size]);
            } else {
                self.history.copy_within(n.., 0);
                let tail = self.fft_size - n;
                self.history[tail..].copy_from_slice(&self.incoming[..n]);
            }
        }
    }

    fn analyse(&mut self) {
        for ((slot, sample), w) in self.fft_buf.iter_mut().zip(&self.history).zip(&self.window) {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.fft_buf);

        let norm = 1.0 / self.fft_size as f32;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.fft_buf) {
            let magnitude = bin.norm() * norm;
            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;
        }
    }
}

fn build_blackman_window(n: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..n)
        .map(|i| {
            let x = std::f32::consts::TAU * i as f32 / n as f32;
            A0 - A1 * x.cos() + A2 * (2.0 * x).cos()
        })
        .collect()
}
