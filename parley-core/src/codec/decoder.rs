//! 16-bit PCM → float decoder.

use crate::buffering::frame::DecodedBuffer;
use crate::codec::{DecodeError, EncodedChunk, PcmFormat, SAMPLE_WIDTH};

/// Decode one inbound chunk into a playable buffer.
///
/// # Errors
/// - [`DecodeError::UnsupportedFormat`] when the tag is not `audio/pcm`, it
///   declares a rate other than `output_rate`, or `channels` is zero.
/// - [`DecodeError::Malformed`] when the payload is empty or its length is
///   not a whole number of sample frames.
pub fn decode(
    chunk: EncodedChunk,
    output_rate: u32,
    channels: u16,
) -> Result<DecodedBuffer, DecodeError> {
    let format = PcmFormat::parse(&chunk.mime_type)
        .ok_or_else(|| DecodeError::UnsupportedFormat(chunk.mime_type.clone()))?;
    if let Some(rate) = format.sample_rate {
        if rate != output_rate {
            return Err(DecodeError::UnsupportedFormat(format!(
                "declared rate {rate} Hz, playback expects {output_rate} Hz"
            )));
        }
    }
    if channels == 0 || output_rate == 0 {
        return Err(DecodeError::UnsupportedFormat(format!(
            "{channels} channels @ {output_rate} Hz"
        )));
    }

    let frame_width = SAMPLE_WIDTH * channels as usize;
    if chunk.data.is_empty() {
        return Err(DecodeError::Malformed("empty payload".into()));
    }
    if chunk.data.len() % frame_width != 0 {
        return Err(DecodeError::Malformed(format!(
            "{} bytes is not a multiple of the {frame_width}-byte frame",
            chunk.data.len()
        )));
    }

    let samples = chunk
        .data
        .chunks_exact(SAMPLE_WIDTH)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();

    Ok(DecodedBuffer::new(samples, output_rate, channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::frame::AudioFrame;
    use crate::codec::encode;

    fn pcm(samples: &[i16], mime: &str) -> EncodedChunk {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        EncodedChunk::new(data, mime)
    }

    #[test]
    fn decodes_samples_and_exact_duration() {
        let chunk = pcm(&vec![16_384; 7_200], "audio/pcm;rate=24000");
        let buffer = decode(chunk, 24_000, 1).expect("valid pcm");
        assert_eq!(buffer.frames(), 7_200);
        assert_eq!(buffer.duration, 7_200.0 / 24_000.0);
        assert_eq!(buffer.samples[0], 0.5);
    }

    #[test]
    fn odd_byte_length_is_malformed() {
        let chunk = EncodedChunk::new(vec![0, 1, 2], "audio/pcm;rate=24000");
        assert!(matches!(
            decode(chunk, 24_000, 1),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn partial_stereo_frame_is_malformed() {
        let chunk = pcm(&[1, 2, 3], "audio/pcm");
        assert!(matches!(
            decode(chunk, 24_000, 2),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn empty_payload_is_malformed() {
        let chunk = EncodedChunk::new(Vec::new(), "audio/pcm");
        assert!(matches!(
            decode(chunk, 24_000, 1),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_foreign_format_and_rate_mismatch() {
        let opus = EncodedChunk::new(vec![0; 4], "audio/opus");
        assert!(matches!(
            decode(opus, 24_000, 1),
            Err(DecodeError::UnsupportedFormat(_))
        ));

        let wrong_rate = pcm(&[0, 0], "audio/pcm;rate=16000");
        assert!(matches!(
            decode(wrong_rate, 24_000, 1),
            Err(DecodeError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn decodes_what_the_encoder_produces() {
        let chunk = encode(AudioFrame::new(vec![0.25, -0.75], 24_000));
        let buffer = decode(chunk, 24_000, 1).expect("encoder output decodes");
        assert_eq!(buffer.samples, vec![0.25, -0.75]);
    }
}
