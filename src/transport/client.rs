//! Websocket connection to the voice bridge
//!
//! The socket is split into a write half owned by a writer task and a read
//! half owned by a reader task. Everything the rest of the client sends goes
//! through [`TransportHandle`]; everything it receives comes out of the
//! [`TransportEvent`] channel, in arrival order.

use crate::error::{Result, VoiceError};
use crate::transport::codec::{
    ClientEvent, Frame, ServerEvent, CONNECT_FRAME, DISCONNECT_FRAME, PONG_FRAME,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// What the transport reports to the session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket.IO handshake finished; events can flow
    Connected,
    Server(ServerEvent),
    /// Connection lost after it was established
    Disconnected(String),
    /// Connection never became usable
    Failed(String),
}

/// Frames queued for the writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Event(ClientEvent),
    Connect,
    Pong,
    Close,
}

/// Sending side of the transport. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl TransportHandle {
    /// A handle not attached to a socket; frames land in the returned
    /// receiver.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: ClientEvent) -> Result<()> {
        self.tx
            .send(Outgoing::Event(event))
            .map_err(|_| VoiceError::ConnectionClosed)
    }

    /// Ask the writer to say goodbye and close the socket. Idempotent.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Open the websocket and start the reader and writer tasks.
///
/// Returns once the websocket is up; [`TransportEvent::Connected`] follows
/// when the Socket.IO handshake completes, or [`TransportEvent::Failed`] if
/// it does not complete within `handshake_timeout`.
pub async fn connect(
    url: &str,
    handshake_timeout: Duration,
) -> Result<(TransportHandle, mpsc::UnboundedReceiver<TransportEvent>)> {
    info!("Connecting to voice bridge at {}", url);

    let (ws_stream, resp) = tokio::time::timeout(handshake_timeout, connect_async(url))
        .await
        .map_err(|_| VoiceError::Timeout)??;
    debug!("WebSocket connection response: {:?}", resp.status());

    let (sink, stream) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(sink, out_rx));
    tokio::spawn(read_loop(stream, out_tx.clone(), event_tx, handshake_timeout));

    Ok((TransportHandle { tx: out_tx }, event_rx))
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    debug!("Writer task started");

    while let Some(outgoing) = rx.recv().await {
        let text = match outgoing {
            Outgoing::Event(event) => match event.encode() {
                Ok(text) => {
                    match &event {
                        ClientEvent::AudioData(data) => {
                            debug!("Sending audio-data ({} chars)", data.len())
                        }
                        other => info!("Sending {}", other.name()),
                    }
                    text
                }
                Err(e) => {
                    error!("Failed to encode {}: {}", event.name(), e);
                    continue;
                }
            },
            Outgoing::Connect => CONNECT_FRAME.to_string(),
            Outgoing::Pong => PONG_FRAME.to_string(),
            Outgoing::Close => {
                let _ = sink.send(Message::Text(DISCONNECT_FRAME.into())).await;
                let _ = sink.close().await;
                info!("Transport closed");
                break;
            }
        };

        if let Err(e) = sink.send(Message::Text(text.into())).await {
            error!("Failed to send frame: {}", e);
            break;
        }
    }

    debug!("Writer task terminated");
}

async fn read_loop(
    mut stream: WsSource,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    handshake_timeout: Duration,
) {
    debug!("Reader task started");

    // The Socket.IO ack must arrive within the handshake timeout; after it,
    // silence is bounded by the heartbeat interval
    let handshake_deadline = Instant::now() + handshake_timeout;
    let mut liveness = handshake_timeout;
    let mut connected = false;

    // Before the handshake completes every ending is a failure
    let ending = |connected: bool, reason: String| {
        if connected {
            TransportEvent::Disconnected(reason)
        } else {
            TransportEvent::Failed(reason)
        }
    };

    loop {
        let deadline = if connected {
            Instant::now() + liveness
        } else {
            handshake_deadline
        };
        let message = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                let reason = if connected {
                    "heartbeat timeout"
                } else {
                    "handshake timeout"
                };
                warn!("Transport {}", reason);
                let _ = event_tx.send(ending(connected, reason.to_string()));
                break;
            }
            Ok(None) => {
                let _ = event_tx.send(ending(connected, "connection closed".to_string()));
                break;
            }
            Ok(Some(Err(e))) => {
                error!("WebSocket error: {:?}", e);
                let _ = event_tx.send(ending(connected, e.to_string()));
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => {
                info!("WebSocket closed: {:?}", frame);
                let _ = event_tx.send(ending(connected, "connection closed".to_string()));
                break;
            }
            Message::Binary(bytes) => {
                debug!("Ignoring binary frame ({} bytes)", bytes.len());
                continue;
            }
            _ => continue,
        };

        let frame = match Frame::decode(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                continue;
            }
        };

        let forwarded = match frame {
            Frame::Open(handshake) => {
                debug!("Engine open, sid {}", handshake.sid);
                liveness = handshake.liveness_timeout();
                if out_tx.send(Outgoing::Connect).is_err() {
                    break;
                }
                continue;
            }
            Frame::Ping => {
                if out_tx.send(Outgoing::Pong).is_err() {
                    break;
                }
                continue;
            }
            Frame::Pong | Frame::Noop => continue,
            Frame::Unhandled(name) => {
                debug!("Ignoring event {}", name);
                continue;
            }
            Frame::Connect => {
                info!("Connected to voice bridge");
                connected = true;
                TransportEvent::Connected
            }
            Frame::ConnectError(message) => {
                let _ = event_tx.send(TransportEvent::Failed(message));
                break;
            }
            Frame::Disconnect | Frame::Close => {
                let reason = "server closed the connection".to_string();
                let _ = event_tx.send(ending(connected, reason));
                break;
            }
            Frame::Event(event) => TransportEvent::Server(event),
        };

        if event_tx.send(forwarded).is_err() {
            break;
        }
    }

    debug!("Reader task terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const OPEN: &str =
        r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(_)) => continue,
                other => panic!("Unexpected message: {:?}", other),
            }
        }
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{}/socket.io/?EIO=4&transport=websocket", addr);
        (listener, url)
    }

    #[tokio::test]
    async fn test_handshake_events_and_heartbeat() {
        let (listener, url) = listen().await;

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            ws.send(Message::Text(OPEN.into())).await.unwrap();
            assert_eq!(next_text(&mut ws).await, "40");
            ws.send(Message::Text(r#"40{"sid":"x"}"#.into())).await.unwrap();

            assert_eq!(
                next_text(&mut ws).await,
                r#"42["start-voice-session",{"sessionId":"abc"}]"#
            );
            ws.send(Message::Text(r#"42["voice-session-started"]"#.into())).await.unwrap();
            ws.send(Message::Text(r#"42["something-else",1]"#.into())).await.unwrap();
            ws.send(Message::Text(r#"42["token-usage",{"totalTokens":7}]"#.into())).await.unwrap();

            ws.send(Message::Text("2".into())).await.unwrap();
            assert_eq!(next_text(&mut ws).await, "3");

            assert_eq!(next_text(&mut ws).await, r#"42["stop-voice-session"]"#);
            assert_eq!(next_text(&mut ws).await, "41");
        });

        let (handle, mut events) = connect(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        handle
            .send(ClientEvent::StartVoiceSession {
                session_id: "abc".to_string(),
            })
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Server(ServerEvent::VoiceSessionStarted))
        );
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Server(ServerEvent::TokenUsage { total_tokens: 7 }))
        );

        // give the pong a moment before the goodbye frames
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.send(ClientEvent::StopVoiceSession).unwrap();
        handle.close();
        handle.close();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_error_is_a_failure() {
        let (listener, url) = listen().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(OPEN.into())).await.unwrap();
            let _ = next_text(&mut ws).await;
            ws.send(Message::Text(r#"44{"message":"Not authorized"}"#.into()))
                .await
                .unwrap();
        });

        let (_handle, mut events) = connect(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Failed("Not authorized".to_string()))
        );
    }

    #[tokio::test]
    async fn test_server_drop_after_connect_is_a_disconnect() {
        let (listener, url) = listen().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(OPEN.into())).await.unwrap();
            let _ = next_text(&mut ws).await;
            ws.send(Message::Text("40".into())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let (_handle, mut events) = connect(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out_handshake() {
        let (listener, url) = listen().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            // never sends the open packet
            let _ = ws.next().await;
        });

        let (_handle, mut events) = connect(&url, Duration::from_millis(200)).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Failed("handshake timeout".to_string()))
        );
    }

    #[tokio::test]
    async fn test_open_without_ack_times_out_handshake() {
        let (listener, url) = listen().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            // long heartbeat, but the connect is never acknowledged
            ws.send(Message::Text(OPEN.into())).await.unwrap();
            assert_eq!(next_text(&mut ws).await, "40");
            let _ = ws.next().await;
        });

        let (_handle, mut events) = connect(&url, Duration::from_millis(200)).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("handshake deadline not enforced");
        assert_eq!(event, Some(TransportEvent::Failed("handshake timeout".to_string())));
    }

    #[tokio::test]
    async fn test_silence_after_connect_is_a_heartbeat_drop() {
        let (listener, url) = listen().await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let open = r#"0{"sid":"s2","upgrades":[],"pingInterval":50,"pingTimeout":50}"#;
            ws.send(Message::Text(open.into())).await.unwrap();
            assert_eq!(next_text(&mut ws).await, "40");
            ws.send(Message::Text("40".into())).await.unwrap();
            // no pings from here on
            let _ = ws.next().await;
        });

        let (_handle, mut events) = connect(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(events.recv().await, Some(TransportEvent::Connected));

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("heartbeat timeout not enforced");
        assert_eq!(
            event,
            Some(TransportEvent::Disconnected("heartbeat timeout".to_string()))
        );
    }

    #[test]
    fn test_detached_handle() {
        let (handle, mut rx) = TransportHandle::detached();
        handle.send(ClientEvent::StopVoiceSession).unwrap();
        handle.close();
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Event(ClientEvent::StopVoiceSession));
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Close);
        drop(rx);
        assert!(handle.is_closed());
        assert!(handle.send(ClientEvent::StopVoiceSession).is_err());
    }
}
