//! Float → 16-bit PCM encoder.

use crate::buffering::frame::AudioFrame;
use crate::codec::{EncodedChunk, PcmFormat, SAMPLE_WIDTH};

/// Encode one capture frame as little-endian `i16` PCM.
///
/// Out-of-range input is clamped rather than rejected; the clamp is lossy
/// on purpose so a hot microphone never breaks the stream.
pub fn encode(frame: AudioFrame) -> EncodedChunk {
    let mut data = Vec::with_capacity(frame.samples.len() * SAMPLE_WIDTH);
    for sample in &frame.samples {
        data.extend_from_slice(&to_i16(*sample).to_le_bytes());
    }
    EncodedChunk::new(data, PcmFormat::with_rate(frame.sample_rate).mime_type())
}

#[inline]
fn to_i16(sample: f32) -> i16 {
    // NaN maps to silence; `as` saturates the +1.0 edge to i16::MAX.
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * 32768.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples_of(chunk: &EncodedChunk) -> Vec<i16> {
        chunk
            .data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn encodes_little_endian_with_rate_tag() {
        let chunk = encode(AudioFrame::new(vec![0.0, 0.5, -0.5], 16_000));
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert_eq!(chunk.data.len(), 6);
        assert_eq!(samples_of(&chunk), vec![0, 16_384, -16_384]);
        assert_eq!(&chunk.data[2..4], &[0x00, 0x40]);
    }

    #[test]
    fn clamps_out_of_range_samples() {
        let chunk = encode(AudioFrame::new(vec![1.0, -1.0, 3.5, -7.0, f32::NAN], 16_000));
        assert_eq!(
            samples_of(&chunk),
            vec![i16::MAX, i16::MIN, i16::MAX, i16::MIN, 0]
        );
    }

    #[test]
    fn preserves_sample_count() {
        let chunk = encode(AudioFrame::new(vec![0.1; 4_096], 16_000));
        assert_eq!(chunk.data.len(), 4_096 * SAMPLE_WIDTH);
    }
}
