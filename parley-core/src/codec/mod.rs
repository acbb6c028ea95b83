//! 16-bit PCM wire codec.
//!
//! Capture frames go out as little-endian `i16` samples tagged
//! `audio/pcm;rate=16000`; model audio comes back in the same encoding at
//! 24 kHz. Both directions are pure functions over owned buffers.

pub mod decoder;
pub mod encoder;

pub use decoder::decode;
pub use encoder::encode;

use thiserror::Error;

/// Bytes per encoded sample.
pub const SAMPLE_WIDTH: usize = 2;

const PCM_MIME: &str = "audio/pcm";

/// Encoded audio plus its declared format tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl EncodedChunk {
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            mime_type: mime_type.into(),
        }
    }
}

/// Why an inbound chunk could not be turned into playable audio.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed audio chunk: {0}")]
    Malformed(String),

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
}

/// Parsed `audio/pcm[;rate=N]` format tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Declared sample rate, if the tag carries one.
    pub sample_rate: Option<u32>,
}

impl PcmFormat {
    pub fn with_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate: Some(sample_rate),
        }
    }

    /// Parse a mime tag. Returns `None` unless the essence is `audio/pcm`.
    pub fn parse(mime_type: &str) -> Option<Self> {
        let mut params = mime_type.split(';').map(str::trim);
        let essence = params.next()?;
        if !essence.eq_ignore_ascii_case(PCM_MIME) {
            return None;
        }

        let mut sample_rate = None;
        for param in params {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("rate") {
                sample_rate = Some(value.trim().parse().ok()?);
            }
        }
        Some(Self { sample_rate })
    }

    pub fn mime_type(&self) -> String {
        match self.sample_rate {
            Some(rate) => format!("{PCM_MIME};rate={rate}"),
            None => PCM_MIME.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rate_parameter() {
        let fmt = PcmFormat::parse("audio/pcm;rate=24000").expect("pcm tag");
        assert_eq!(fmt.sample_rate, Some(24_000));
        assert_eq!(fmt.mime_type(), "audio/pcm;rate=24000");
    }

    #[test]
    fn accepts_bare_tag_and_loose_spacing() {
        assert_eq!(PcmFormat::parse("audio/pcm"), Some(PcmFormat { sample_rate: None }));
        assert_eq!(
            PcmFormat::parse("Audio/PCM; rate = 16000"),
            Some(PcmFormat::with_rate(16_000))
        );
    }

    #[test]
    fn rejects_other_encodings() {
        assert!(PcmFormat::parse("audio/opus").is_none());
        assert!(PcmFormat::parse("audio/pcm;rate=fast").is_none());
        assert!(PcmFormat::parse("").is_none());
    }
}
