use std::path::PathBuf;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;

use crate::session::SessionEvent;
use crate::trace::{self, Span};

const EVENT_TRANSCRIPTION_UPDATE: &str = "transcription_update";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TranscriptionEvent {
    pub text: String,
    pub correlation_id: Option<String>,
}

// Inbound frames are JSON like
// {"event":"transcription_update","text":"...","correlation_id":"..."}.
// Frames with another event name, or without a text field, are ignored.
pub fn parse_frame(raw: &str) -> Option<TranscriptionEvent> {
    let v: serde_json::Value = serde_json::from_str(raw).ok()?;
    let name = v
        .get("event")
        .or_else(|| v.get("type"))
        .and_then(|x| x.as_str())?;
    if name != EVENT_TRANSCRIPTION_UPDATE {
        return None;
    }
    let text = v.get("text").and_then(|x| x.as_str())?.to_string();
    let correlation_id = v
        .get("correlation_id")
        .and_then(|x| x.as_str())
        .map(|s| s.to_string());
    Some(TranscriptionEvent {
        text,
        correlation_id,
    })
}

// One connection per session: connected at session start, closed by the
// session token on teardown. No reconnect; a failed connect leaves the
// session working without realtime events.
pub fn spawn_channel(
    url: String,
    data_dir: PathBuf,
    session_id: String,
    tx: UnboundedSender<SessionEvent>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let span = Span::start(
            &data_dir,
            Some(&session_id),
            "Realtime",
            "RT.connect",
            Some(serde_json::json!({ "url": url })),
        );
        let ws = tokio::select! {
            _ = token.cancelled() => {
                span.err("ws", "E_REALTIME_CANCELLED", "cancelled before connect", None);
                return;
            }
            r = connect_async(url.as_str()) => r,
        };
        let ws = match ws {
            Ok((stream, _resp)) => {
                span.ok(None);
                stream
            }
            Err(e) => {
                span.err("ws", "E_REALTIME_CONNECT", &e.to_string(), None);
                return;
            }
        };

        let (mut ws_tx, mut ws_rx) = ws.split();
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                f = ws_rx.next() => f,
            };
            match frame {
                Some(Ok(WsMessage::Text(raw))) => {
                    if let Some(ev) = parse_frame(&raw) {
                        trace::event(
                            &data_dir,
                            Some(&session_id),
                            "Realtime",
                            "RT.transcription_update",
                            "ok",
                            Some(serde_json::json!({
                                "text_chars": ev.text.chars().count(),
                                "has_correlation_id": ev.correlation_id.is_some(),
                            })),
                        );
                        if tx
                            .send(SessionEvent::TranscriptionReceived {
                                text: ev.text,
                                correlation_id: ev.correlation_id,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = ws_tx.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    trace::event(
                        &data_dir,
                        Some(&session_id),
                        "Realtime",
                        "RT.read_error",
                        "err",
                        Some(serde_json::json!({ "error": e.to_string() })),
                    );
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frame_accepts_transcription_update() {
        let ev = parse_frame(
            r#"{"event":"transcription_update","text":"hello","correlation_id":"c-1"}"#,
        )
        .expect("event");
        assert_eq!(ev.text, "hello");
        assert_eq!(ev.correlation_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn parse_frame_accepts_type_field_and_missing_correlation() {
        let ev = parse_frame(r#"{"type":"transcription_update","text":"hi"}"#).expect("event");
        assert_eq!(ev.text, "hi");
        assert!(ev.correlation_id.is_none());
    }

    #[test]
    fn parse_frame_rejects_other_events_and_garbage() {
        assert!(parse_frame(r#"{"event":"presence","text":"x"}"#).is_none());
        assert!(parse_frame(r#"{"event":"transcription_update"}"#).is_none());
        assert!(parse_frame("not json").is_none());
    }
}
