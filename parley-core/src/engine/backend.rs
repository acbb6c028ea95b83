//! Device seam between the session and the platform audio stack.

use tracing::info;

use super::{CaptureConfig, PlaybackConfig};
use crate::{
    audio::{tap::TapWriter, CpalOutput, Microphone},
    buffering::{create_audio_ring, AudioConsumer},
    error::{ParleyError, Result},
    playback::OutputDevice,
};

/// The producing side of a capture ring: reports device faults and can be
/// released.
pub trait InputDevice: Send {
    /// A fault raised by the device since the last call, if any.
    fn take_error(&mut self) -> Option<ParleyError>;

    /// Samples discarded so far because the ring was full.
    fn overruns(&self) -> u64 {
        0
    }

    /// Stop producing samples and release the device. Idempotent.
    fn close(&mut self);
}

impl InputDevice for Microphone {
    fn take_error(&mut self) -> Option<ParleyError> {
        Microphone::take_error(self)
    }

    fn overruns(&self) -> u64 {
        Microphone::overruns(self)
    }

    fn close(&mut self) {
        Microphone::close(self);
    }
}

/// An open capture source: mono samples arriving in `consumer` at
/// `sample_rate`.
pub struct CaptureStream {
    pub consumer: AudioConsumer,
    pub sample_rate: u32,
    pub device: Box<dyn InputDevice>,
}

/// Opens the session's speaker and microphone.
pub trait AudioBackend: Send + Sync {
    /// Open the speaker. Every rendered sample is also pushed into `tap`.
    fn open_output(&self, config: &PlaybackConfig, tap: TapWriter) -> Result<Box<dyn OutputDevice>>;

    fn open_input(&self, config: &CaptureConfig) -> Result<CaptureStream>;
}

/// Real devices through cpal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_output(&self, config: &PlaybackConfig, tap: TapWriter) -> Result<Box<dyn OutputDevice>> {
        let output = CpalOutput::open(config.preferred_device.as_deref(), tap)?;
        info!(
            device_rate = output.sample_rate,
            channels = output.channels,
            source_rate = config.sample_rate,
            "speaker ready"
        );
        Ok(Box::new(output))
    }

    fn open_input(&self, config: &CaptureConfig) -> Result<CaptureStream> {
        let (producer, consumer) = create_audio_ring();
        let microphone = Microphone::open(config.preferred_device.as_deref(), producer)?;
        info!(device_rate = microphone.sample_rate, "microphone ready");
        Ok(CaptureStream {
            consumer,
            sample_rate: microphone.sample_rate,
            device: Box::new(microphone),
        })
    }
}
