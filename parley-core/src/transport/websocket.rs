//! Gemini Live bidirectional websocket client.
//!
//! ```text
//! connect  ──► {"setup": {...}}
//!          ◄── {"setupComplete": {}}            link handed to the session
//! capture  ──► {"realtimeInput": {"mediaChunks": [{mimeType, data}]}}
//! model    ◄── {"serverContent": {...}}         forwarded as TransportEvent
//! ```
//!
//! Frames that do not parse as a server message are logged and skipped.
//!
//! After the handshake the socket is split. A writer task sends captured
//! frames and a reader task forwards server messages, so a slow socket write
//! never delays inbound audio or an interrupt. When either task ends the
//! other is aborted.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::CloseFrame, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::{Connector, RemoteEndpoint, RemoteLink, SessionSetup, TransportEvent, INBOUND_CAPACITY};
use crate::{
    error::{ParleyError, Result},
    protocol::{Blob, RealtimeInput, ServerMessage},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct ClientSetup<'a> {
    setup: SetupBody<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupBody<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<SpeechConfig<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientRealtime {
    realtime_input: MediaChunks,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunks {
    media_chunks: [Blob; 1],
}

pub(crate) fn setup_message(setup: &SessionSetup) -> Result<String> {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };
    let body = ClientSetup {
        setup: SetupBody {
            model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: setup.voice_name.as_deref().map(|voice_name| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice { voice_name },
                    },
                }),
            },
            system_instruction: setup.system_instruction.as_deref().map(|text| Content {
                parts: [TextPart { text }],
            }),
        },
    };
    Ok(serde_json::to_string(&body)?)
}

pub(crate) fn realtime_message(input: RealtimeInput) -> Result<String> {
    let body = ClientRealtime {
        realtime_input: MediaChunks {
            media_chunks: [input.media],
        },
    };
    Ok(serde_json::to_string(&body)?)
}

/// Endpoint URL with the API key attached as the `key` query parameter.
pub(crate) fn request_url(endpoint: &RemoteEndpoint) -> String {
    match endpoint.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => {
            let sep = if endpoint.url.contains('?') { '&' } else { '?' };
            format!("{}{sep}key={key}", endpoint.url)
        }
        None => endpoint.url.clone(),
    }
}

fn parse_frame(message: &Message) -> Option<ServerMessage> {
    let bytes: &[u8] = match message {
        Message::Text(text) => text.as_bytes(),
        Message::Binary(data) => data.as_slice(),
        _ => return None,
    };
    match serde_json::from_slice(bytes) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(len = bytes.len(), "ignoring unparseable server frame: {e}");
            None
        }
    }
}

fn close_reason(frame: Option<CloseFrame<'_>>) -> Option<String> {
    frame
        .map(|f| f.reason.into_owned())
        .filter(|reason| !reason.is_empty())
}

/// Connects to the Gemini Live endpoint over TLS.
#[derive(Debug, Clone, Default)]
pub struct LiveConnector;

impl LiveConnector {
    pub fn new() -> Self {
        Self
    }

    async fn handshake(endpoint: &RemoteEndpoint) -> Result<Socket> {
        let url = request_url(endpoint);
        let (mut socket, _response) = connect_async(url)
            .await
            .map_err(|e| ParleyError::Transport(e.to_string()))?;

        socket
            .send(Message::Text(setup_message(&endpoint.setup)?))
            .await
            .map_err(|e| ParleyError::Transport(e.to_string()))?;

        while let Some(frame) = socket.next().await {
            let frame = frame.map_err(|e| ParleyError::Transport(e.to_string()))?;
            if let Message::Close(close) = &frame {
                let reason =
                    close_reason(close.clone()).unwrap_or_else(|| "no reason given".into());
                return Err(ParleyError::Transport(format!(
                    "remote closed during setup: {reason}"
                )));
            }
            if parse_frame(&frame).is_some_and(|m| m.is_setup_complete()) {
                return Ok(socket);
            }
        }
        Err(ParleyError::Protocol(
            "stream ended before setup was acknowledged".into(),
        ))
    }
}

impl Connector for LiveConnector {
    async fn connect(&self, endpoint: &RemoteEndpoint) -> Result<RemoteLink> {
        info!(model = endpoint.setup.model.as_str(), "connecting to remote model");
        let socket = timeout(endpoint.connect_timeout, Self::handshake(endpoint))
            .await
            .map_err(|_| ParleyError::ConnectTimeout(endpoint.connect_timeout))??;
        info!("remote session set up");

        let (outbound_tx, outbound_rx) = mpsc::channel(endpoint.outbound_queue.max(1));
        let (event_tx, event_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();

        let (sink, stream) = socket.split();
        tokio::spawn(drive(sink, stream, outbound_rx, event_tx, close_rx));

        Ok(RemoteLink::new(outbound_tx, event_rx, close_tx))
    }
}

/// Run the writer and reader until either one ends.
async fn drive<W, R>(
    sink: W,
    stream: R,
    outbound: mpsc::Receiver<RealtimeInput>,
    events: mpsc::Sender<TransportEvent>,
    close_rx: oneshot::Receiver<()>,
) where
    W: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    R: Stream<Item = std::result::Result<Message, WsError>> + Unpin + Send + 'static,
{
    let mut writer = tokio::spawn(write_frames(sink, outbound, close_rx, events.clone()));
    let mut reader = tokio::spawn(read_frames(stream, events));
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    debug!("websocket link finished");
}

/// Send captured frames until the session closes the link.
async fn write_frames<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<RealtimeInput>,
    mut close_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<TransportEvent>,
) where
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let input = tokio::select! {
            _ = &mut close_rx => None,
            input = outbound.recv() => input,
        };
        let Some(input) = input else {
            debug!("closing websocket");
            let _ = sink.send(Message::Close(None)).await;
            return;
        };
        let text = match realtime_message(input) {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to encode outbound frame: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            let _ = events.send(TransportEvent::Error(e.to_string())).await;
            return;
        }
    }
}

/// Forward server messages until the socket closes or fails.
async fn read_frames<R>(mut stream: R, events: mpsc::Sender<TransportEvent>)
where
    R: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    let last = loop {
        match stream.next().await {
            Some(Ok(Message::Close(close))) => {
                let reason = close_reason(close);
                info!(reason = reason.as_deref().unwrap_or(""), "remote closed websocket");
                break TransportEvent::Closed { reason };
            }
            Some(Ok(message)) => {
                let Some(parsed) = parse_frame(&message) else {
                    continue;
                };
                if events.send(TransportEvent::Message(parsed)).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => break TransportEvent::Error(e.to_string()),
            None => break TransportEvent::Closed { reason: None },
        }
    };
    let _ = events.send(last).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EncodedChunk;
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    /// A socket whose send buffer never drains.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> std::result::Result<(), WsError> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), WsError>> {
            Poll::Pending
        }
    }

    type Frames = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

    /// Server frames fed by hand.
    fn scripted_frames() -> (mpsc::UnboundedSender<Message>, Frames) {
        let (tx, rx) = mpsc::unbounded_channel();
        let frames = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (Ok(message), rx))
        });
        (tx, Box::pin(frames))
    }

    fn captured_frame() -> RealtimeInput {
        RealtimeInput::audio(&EncodedChunk::new(vec![0; 8_192], "audio/pcm;rate=16000"))
    }

    #[tokio::test]
    async fn server_messages_arrive_while_a_send_is_stuck() {
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (_close_tx, close_rx) = oneshot::channel();
        let (server, frames) = scripted_frames();
        tokio::spawn(drive(StalledSink, frames, outbound_rx, event_tx, close_rx));

        outbound_tx.send(captured_frame()).await.expect("link open");
        tokio::time::sleep(Duration::from_millis(20)).await;

        server
            .send(Message::Text(r#"{"serverContent":{"interrupted":true}}"#.into()))
            .expect("reader alive");
        let event = timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .expect("reader is not held up by the writer")
            .expect("link open");
        assert!(matches!(event, TransportEvent::Message(m) if m.is_interrupted()));
    }

    #[tokio::test]
    async fn remote_close_ends_both_directions() {
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (_close_tx, close_rx) = oneshot::channel();
        let (server, frames) = scripted_frames();
        tokio::spawn(drive(StalledSink, frames, outbound_rx, event_tx, close_rx));

        server.send(Message::Close(None)).expect("reader alive");
        let event = timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .expect("close forwarded")
            .expect("link open");
        assert_eq!(event, TransportEvent::Closed { reason: None });

        // The writer was aborted and dropped its queue.
        timeout(Duration::from_secs(1), outbound_tx.closed())
            .await
            .expect("writer stopped");
    }

    #[test]
    fn setup_message_matches_live_api_shape() {
        let setup = SessionSetup {
            model: "gemini-live".into(),
            voice_name: Some("Kore".into()),
            system_instruction: Some("Be brief.".into()),
        };
        let json: serde_json::Value =
            serde_json::from_str(&setup_message(&setup).expect("encode")).expect("json");

        assert_eq!(json["setup"]["model"], "models/gemini-live");
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
    }

    #[test]
    fn optional_setup_fields_are_omitted() {
        let setup = SessionSetup {
            model: "models/x".into(),
            voice_name: None,
            system_instruction: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&setup_message(&setup).expect("encode")).expect("json");
        assert_eq!(json["setup"]["model"], "models/x");
        assert!(json["setup"].get("systemInstruction").is_none());
        assert!(json["setup"]["generationConfig"].get("speechConfig").is_none());
    }

    #[test]
    fn realtime_frames_wrap_media_chunks() {
        let chunk = EncodedChunk::new(vec![0x00, 0x40], "audio/pcm;rate=16000");
        let json: serde_json::Value = serde_json::from_str(
            &realtime_message(RealtimeInput::audio(&chunk)).expect("encode"),
        )
        .expect("json");
        let media = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(media["data"], "AEA=");
    }

    #[test]
    fn api_key_goes_in_the_query() {
        let mut endpoint = RemoteEndpoint {
            url: "wss://example.test/live".into(),
            api_key: Some("k123".into()),
            ..Default::default()
        };
        assert_eq!(request_url(&endpoint), "wss://example.test/live?key=k123");

        endpoint.url = "wss://example.test/live?alt=1".into();
        assert_eq!(request_url(&endpoint), "wss://example.test/live?alt=1&key=k123");

        endpoint.api_key = None;
        assert_eq!(request_url(&endpoint), "wss://example.test/live?alt=1");
    }

    #[test]
    fn binary_and_text_frames_both_parse() {
        let raw = r#"{"setupComplete":{}}"#;
        let text = parse_frame(&Message::Text(raw.into())).expect("text frame");
        assert!(text.is_setup_complete());
        let binary = parse_frame(&Message::Binary(raw.as_bytes().to_vec())).expect("binary frame");
        assert!(binary.is_setup_complete());
        assert!(parse_frame(&Message::Text("not json".into())).is_none());
        assert!(parse_frame(&Message::Ping(vec![])).is_none());
    }
}
