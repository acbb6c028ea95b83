//! Typed audio blocks passed between the capture, codec and playback stages.

/// A contiguous block of mono capture samples at a known sample rate.
///
/// Produced once per capture tick and moved into the encoder.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples, nominally in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16000 on the wire).
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }
}

/// A fully decoded block of playback samples.
///
/// `duration` is exact (`frames / sample_rate`): the scheduler chains start
/// times off it, so it must not be rounded to a coarser unit.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    /// Interleaved f32 samples in [-1.0, 1.0).
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count of the interleaved samples.
    pub channels: u16,
    /// Playback length in seconds.
    pub duration: f64,
}

impl DecodedBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let frames = samples.len() / channels.max(1) as usize;
        Self {
            samples,
            sample_rate,
            channels,
            duration: frames as f64 / sample_rate as f64,
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}
