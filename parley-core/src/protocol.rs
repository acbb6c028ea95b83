//! Messages exchanged with the remote conversational model.
//!
//! ```text
//! outbound  { "media": { "mimeType": "audio/pcm;rate=16000", "data": "<base64>" } }
//! inbound   { "serverContent": { "modelTurn": { "parts": [ { "inlineData": { "data": "<base64>" } } ] } } }
//!           { "serverContent": { "interrupted": true } }
//! ```
//!
//! Every inbound field is optional and unknown fields are ignored, so newer
//! server message kinds deserialize cleanly and are simply not routed.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::codec::{DecodeError, EncodedChunk};

/// Base64-encoded media payload with its mime tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data: String,
}

impl Blob {
    pub fn from_chunk(chunk: &EncodedChunk) -> Self {
        Self {
            mime_type: Some(chunk.mime_type.clone()),
            data: STANDARD.encode(&chunk.data),
        }
    }

    /// Decode the base64 payload. A missing mime tag falls back to
    /// `default_mime`.
    pub fn into_chunk(self, default_mime: &str) -> Result<EncodedChunk, DecodeError> {
        let data = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| DecodeError::Malformed(format!("base64: {e}")))?;
        let mime_type = self.mime_type.unwrap_or_else(|| default_mime.to_string());
        Ok(EncodedChunk::new(data, mime_type))
    }
}

/// One captured frame on its way to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeInput {
    pub media: Blob,
}

impl RealtimeInput {
    pub fn audio(chunk: &EncodedChunk) -> Self {
        Self {
            media: Blob::from_chunk(chunk),
        }
    }
}

/// Any message the remote sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
    /// Present (usually as `{}`) once the remote accepted the session setup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ServerMessage {
    /// Model audio carried by this message, in part order.
    pub fn audio_blobs(self) -> Vec<Blob> {
        self.server_content
            .and_then(|content| content.model_turn)
            .map(|turn| turn.parts.into_iter().filter_map(|p| p.inline_data).collect())
            .unwrap_or_default()
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.interrupted)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.turn_complete)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Convenience constructor for a single-part audio message.
    pub fn model_audio(chunk: &EncodedChunk) -> Self {
        Self {
            server_content: Some(ServerContent {
                model_turn: Some(ModelTurn {
                    parts: vec![Part {
                        inline_data: Some(Blob::from_chunk(chunk)),
                        text: None,
                    }],
                }),
                ..Default::default()
            }),
            setup_complete: None,
        }
    }

    pub fn interrupted() -> Self {
        Self {
            server_content: Some(ServerContent {
                interrupted: true,
                ..Default::default()
            }),
            setup_complete: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_input_serializes_media_blob() {
        let chunk = EncodedChunk::new(vec![0x00, 0x40], "audio/pcm;rate=16000");
        let json = serde_json::to_value(RealtimeInput::audio(&chunk)).expect("serialize");
        assert_eq!(json["media"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(json["media"]["data"], "AEA=");
    }

    #[test]
    fn parses_model_audio_message() {
        let raw = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AEA="}}]}}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).expect("parse");
        assert!(!msg.is_interrupted());
        let blobs = msg.audio_blobs();
        assert_eq!(blobs.len(), 1);
        let chunk = blobs[0]
            .clone()
            .into_chunk("audio/pcm")
            .expect("base64 payload");
        assert_eq!(chunk.data, vec![0x00, 0x40]);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=24000");
    }

    #[test]
    fn parses_interruption_and_turn_complete() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent":{"interrupted":true}}"#).expect("parse");
        assert!(msg.is_interrupted());
        assert!(msg.audio_blobs().is_empty());

        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent":{"turnComplete":true}}"#).expect("parse");
        assert!(msg.is_turn_complete());
    }

    #[test]
    fn unknown_shapes_deserialize_to_nothing_routable() {
        let raw = r#"{"toolCall":{"functionCalls":[]},"usageMetadata":{"totalTokenCount":3}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).expect("parse");
        assert_eq!(msg, ServerMessage::default());
        assert!(!msg.is_setup_complete());
    }

    #[test]
    fn missing_mime_uses_default_and_bad_base64_is_malformed() {
        let blob = Blob {
            mime_type: None,
            data: "AEA=".into(),
        };
        let chunk = blob.into_chunk("audio/pcm;rate=24000").expect("decode");
        assert_eq!(chunk.mime_type, "audio/pcm;rate=24000");

        let bad = Blob {
            mime_type: None,
            data: "@@not base64@@".into(),
        };
        assert!(matches!(
            bad.into_chunk("audio/pcm"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn text_only_parts_carry_no_audio() {
        let raw = r#"{"serverContent":{"modelTurn":{"parts":[{"text":"hi"},{"inlineData":{"data":"AAA="}}]}}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).expect("parse");
        assert_eq!(msg.audio_blobs().len(), 1);
    }
}
