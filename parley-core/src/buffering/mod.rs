//! Lock-free SPSC ring buffers for audio samples.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from a real-time audio callback. Two rings exist per
//! session: microphone → cadence thread, and speaker mix → analyser tap.

pub mod frame;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by an audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the thread or task reading the samples.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Capture ring capacity: 2^17 = 131 072 f32 samples ≈ 2.7 s at 48 kHz.
/// The cadence thread drains every few milliseconds, so anything beyond a
/// couple of frames is already stale audio.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 17;

/// Analyser tap capacity: 2^14 samples ≈ 0.34 s at 48 kHz.
pub const TAP_RING_CAPACITY: usize = 1 << 14;

/// Create a matched producer/consumer pair for microphone samples.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    create_ring(CAPTURE_RING_CAPACITY)
}

/// Create a matched producer/consumer pair with an explicit capacity.
pub fn create_ring(capacity: usize) -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(capacity).split()
}
