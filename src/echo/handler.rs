//! Echo loop for a single WebSocket connection.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

/// Characters of a text message shown in debug logs.
const PREVIEW_CHARS: usize = 50;

/// Why an echo loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Peer closed with 1000/1001 or without a status code.
    Normal,
    /// Peer went away badly: protocol violation, reset, I/O failure or
    /// an error close code.
    Abnormal(String),
    /// We failed while echoing a message back.
    Failed(String),
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Normal => write!(f, "closed normally"),
            Disconnect::Abnormal(reason) => write!(f, "closed abnormally: {reason}"),
            Disconnect::Failed(reason) => write!(f, "echo failed: {reason}"),
        }
    }
}

/// Echo messages on `ws` until the connection ends.
///
/// Never returns an error: every way the connection can end is folded
/// into a [`Disconnect`] for the caller to log.
pub async fn echo_messages<S>(ws: &mut S, peer: SocketAddr) -> Disconnect
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    // Set once the peer's close frame arrives; the stream is then polled
    // until tungstenite has answered the close and reports the end.
    let mut closing: Option<Disconnect> = None;

    while let Some(item) = ws.next().await {
        let reply = match item {
            Ok(Message::Text(text)) => {
                debug!(
                    peer = %peer,
                    kind = "text",
                    bytes = text.len(),
                    chars = text.chars().count(),
                    preview = preview(&text),
                    "Echoing message"
                );
                Message::Text(text)
            }
            Ok(Message::Binary(data)) => {
                debug!(peer = %peer, kind = "binary", bytes = data.len(), "Echoing message");
                Message::Binary(data)
            }
            Ok(Message::Close(frame)) => {
                closing = Some(classify_close(frame.as_ref()));
                continue;
            }
            // Pongs are queued by tungstenite, raw frames never surface on read.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Err(WsError::ConnectionClosed) => break,
            Err(e) => {
                return match closing {
                    Some(disconnect) => disconnect,
                    None => Disconnect::Abnormal(e.to_string()),
                }
            }
        };

        if let Err(e) = ws.send(reply).await {
            if let Some(disconnect) = closing {
                return disconnect;
            }
            return match e {
                WsError::Io(_)
                | WsError::Protocol(_)
                | WsError::ConnectionClosed
                | WsError::AlreadyClosed => Disconnect::Abnormal(e.to_string()),
                e => Disconnect::Failed(e.to_string()),
            };
        }
    }

    closing.unwrap_or_else(|| Disconnect::Abnormal("connection ended without a close frame".into()))
}

fn classify_close(frame: Option<&CloseFrame<'_>>) -> Disconnect {
    match frame {
        None => Disconnect::Normal,
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
            Disconnect::Normal
        }
        Some(frame) => Disconnect::Abnormal(format!(
            "close code {} ({})",
            u16::from(frame.code),
            frame.reason
        )),
    }
}

/// First [`PREVIEW_CHARS`] characters of `text`, cut on a char boundary.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use tokio::io::{duplex, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server, client) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        (server, client)
    }

    fn spawn_echo(
        mut server: WebSocketStream<DuplexStream>,
    ) -> tokio::task::JoinHandle<Disconnect> {
        tokio::spawn(async move { echo_messages(&mut server, peer()).await })
    }

    #[tokio::test]
    async fn test_text_echo() {
        let (server, mut client) = pair().await;
        let task = spawn_echo(server);

        client.send(Message::Text("héllo wörld".into())).await.unwrap();
        let echoed = client.next().await.unwrap().unwrap();
        assert_eq!(echoed, Message::Text("héllo wörld".into()));

        client.close(None).await.unwrap();
        assert_eq!(task.await.unwrap(), Disconnect::Normal);
    }

    #[tokio::test]
    async fn test_binary_stays_binary() {
        let (server, mut client) = pair().await;
        let task = spawn_echo(server);

        // Valid UTF-8 bytes must still come back as binary.
        let payload = b"plain ascii".to_vec();
        client.send(Message::Binary(payload.clone())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Binary(payload)
        );

        let raw: Vec<u8> = (0..=255).collect();
        client.send(Message::Binary(raw.clone())).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Message::Binary(raw));

        client.close(None).await.unwrap();
        assert_eq!(task.await.unwrap(), Disconnect::Normal);
    }

    #[tokio::test]
    async fn test_order_preserved() {
        let (server, mut client) = pair().await;
        let task = spawn_echo(server);

        let sent: Vec<Message> = (0..50)
            .map(|i| {
                if i % 2 == 0 {
                    Message::Text(format!("message {i}"))
                } else {
                    Message::Binary(vec![i as u8; i])
                }
            })
            .collect();

        for msg in &sent {
            client.send(msg.clone()).await.unwrap();
        }
        for expected in &sent {
            assert_eq!(&client.next().await.unwrap().unwrap(), expected);
        }

        client.close(None).await.unwrap();
        assert_eq!(task.await.unwrap(), Disconnect::Normal);
    }

    #[tokio::test]
    async fn test_empty_messages() {
        let (server, mut client) = pair().await;
        let task = spawn_echo(server);

        client.send(Message::Text(String::new())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text(String::new())
        );
        client.send(Message::Binary(Vec::new())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Binary(Vec::new())
        );

        client.close(None).await.unwrap();
        assert_eq!(task.await.unwrap(), Disconnect::Normal);
    }

    #[tokio::test]
    async fn test_ping_answered_not_echoed() {
        let (server, mut client) = pair().await;
        let task = spawn_echo(server);

        client.send(Message::Ping(vec![7, 7])).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Pong(vec![7, 7])
        );

        client.send(Message::Text("after ping".into())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("after ping".into())
        );

        client.close(None).await.unwrap();
        assert_eq!(task.await.unwrap(), Disconnect::Normal);
    }

    #[tokio::test]
    async fn test_going_away_is_normal() {
        let (server, mut client) = pair().await;
        let task = spawn_echo(server);

        client
            .close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: Cow::Borrowed("bye"),
            }))
            .await
            .unwrap();
        assert_eq!(task.await.unwrap(), Disconnect::Normal);
    }

    #[tokio::test]
    async fn test_error_close_code_is_abnormal() {
        let (server, mut client) = pair().await;
        let task = spawn_echo(server);

        client
            .close(Some(CloseFrame {
                code: CloseCode::Error,
                reason: Cow::Borrowed("client crashed"),
            }))
            .await
            .unwrap();

        match task.await.unwrap() {
            Disconnect::Abnormal(reason) => {
                assert!(reason.contains("1011"), "{reason}");
                assert!(reason.contains("client crashed"), "{reason}");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_without_close_is_abnormal() {
        let (server, mut client) = pair().await;
        let task = spawn_echo(server);

        client.send(Message::Text("one".into())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("one".into())
        );
        drop(client);

        assert!(matches!(task.await.unwrap(), Disconnect::Abnormal(_)));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("short"), "short");

        let long = "x".repeat(80);
        assert_eq!(preview(&long).len(), PREVIEW_CHARS);

        let wide = "é".repeat(60);
        let cut = preview(&wide);
        assert_eq!(cut.chars().count(), PREVIEW_CHARS);
        assert_eq!(cut.len(), PREVIEW_CHARS * 2);
    }

    #[test]
    fn test_classify_close() {
        assert_eq!(classify_close(None), Disconnect::Normal);

        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        };
        assert_eq!(classify_close(Some(&normal)), Disconnect::Normal);

        let policy = CloseFrame {
            code: CloseCode::Policy,
            reason: Cow::Borrowed("nope"),
        };
        assert_eq!(
            classify_close(Some(&policy)),
            Disconnect::Abnormal("close code 1008 (nope)".into())
        );
    }
}
