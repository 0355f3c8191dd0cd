//! SSE wire format for the events endpoint.
//!
//! Frames are `data: <json>\n\n`. When a chat is idle for one second the
//! stream emits a heartbeat frame so proxies keep the connection open.

use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::events::{ChatEvent, ChatEventKind};
use crate::ids::utc_now_iso;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Encode one event as an SSE data frame.
pub fn frame(event: &ChatEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {}\n\n", json)
}

fn heartbeat(chat_id: &str) -> ChatEvent {
    ChatEvent {
        kind: ChatEventKind::Heartbeat {},
        chat_id: chat_id.to_string(),
        timestamp: utc_now_iso(),
        sequence: 0,
    }
}

/// Turn a subscription receiver into a stream of SSE frames with heartbeats
/// interleaved on idle. Ends when the subscription closes.
pub fn frames_with_heartbeat(
    chat_id: String,
    receiver: mpsc::Receiver<ChatEvent>,
) -> impl Stream<Item = String> + Send {
    futures_util::stream::unfold(
        (chat_id, receiver),
        |(chat_id, mut receiver)| async move {
            match tokio::time::timeout(HEARTBEAT_INTERVAL, receiver.recv()).await {
                Ok(Some(event)) => Some((frame(&event), (chat_id, receiver))),
                Ok(None) => None,
                Err(_) => {
                    let beat = frame(&heartbeat(&chat_id));
                    Some((beat, (chat_id, receiver)))
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn frame_has_sse_shape() {
        let event = heartbeat("chat-1");
        let text = frame(&event);
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"type\":\"heartbeat\""));
        assert!(text.contains("\"chatId\":\"chat-1\""));
    }

    #[tokio::test]
    async fn idle_stream_emits_heartbeats() {
        let (_tx, rx) = mpsc::channel(4);
        let mut stream = Box::pin(frames_with_heartbeat("chat-1".to_string(), rx));
        let first = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("stream yielded nothing")
            .unwrap();
        assert!(first.contains("heartbeat"));
    }

    #[tokio::test]
    async fn events_pass_through_before_heartbeat() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ChatEvent {
            kind: ChatEventKind::ContentDelta {
                message_id: "m".into(),
                delta: "d".into(),
            },
            chat_id: "chat-1".into(),
            timestamp: utc_now_iso(),
            sequence: 1,
        })
        .await
        .unwrap();

        let mut stream = Box::pin(frames_with_heartbeat("chat-1".to_string(), rx));
        let first = stream.next().await.unwrap();
        assert!(first.contains("content_delta"));
    }

    #[tokio::test]
    async fn stream_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel::<ChatEvent>(1);
        drop(tx);
        let mut stream = Box::pin(frames_with_heartbeat("chat-1".to_string(), rx));
        assert!(stream.next().await.is_none());
    }
}
