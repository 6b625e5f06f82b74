//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] carries the collaboration protocol's JSON text
//! messages over a WebSocket connection, for both the client side (via
//! [`connect`](WebSocketTransport::connect)) and the server side (wrap an
//! accepted stream with [`from_stream`](WebSocketTransport::from_stream)).
//! Both `ws://` and `wss://` URLs are supported; TLS is handled transparently
//! via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! Only available with the `transport-websocket` feature (on by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), scenelink::SceneLinkError> {
//! use scenelink::{Transport, WebSocketTransport};
//!
//! // The subscribe credential rides along as a query parameter.
//! let mut transport =
//!     WebSocketTransport::connect("ws://localhost:4800/collab?token=abc").await?;
//! transport.send(r#"{"type":"PING","data":{"ts":1}}"#.to_string()).await?;
//! if let Some(Ok(reply)) = transport.recv().await {
//!     println!("received: {reply}");
//! }
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::error::SceneLinkError;
use crate::transport::Transport;

/// The underlying WebSocket stream type.
///
/// Exposed so callers with custom TLS or proxy setup can hand a connected
/// stream to [`WebSocketTransport::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Map a tungstenite connect error to [`SceneLinkError::Io`], preserving the
/// [`ErrorKind`](std::io::ErrorKind) when the cause was an I/O failure.
fn connect_error(e: tokio_tungstenite::tungstenite::Error) -> SceneLinkError {
    let kind = match &e {
        tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
        _ => std::io::ErrorKind::Other,
    };
    SceneLinkError::Io(std::io::Error::new(kind, e))
}

/// A [`Transport`] over a WebSocket connection.
///
/// Protocol messages map one-to-one onto text frames. Control frames
/// (ping/pong/close) are handled at this layer and never surface to the
/// session; binary frames are skipped with a warning since the protocol is
/// text-only.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe: dropping its future mid-poll
/// loses no frames, so it can sit inside `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Dial a collaboration endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SceneLinkError::Io`] when the URL is invalid or the
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, SceneLinkError> {
        debug!(url = %url, "connecting to collaboration server");
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(connect_error)?;
        tracing::info!(url = %url, "WebSocket connection established");
        Ok(Self::from_stream(stream))
    }

    /// Dial with a deadline, failing with [`SceneLinkError::Timeout`] if the
    /// connection is not up in time.
    ///
    /// # Errors
    ///
    /// [`SceneLinkError::Timeout`] on expiry, otherwise whatever
    /// [`connect`](Self::connect) returns.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: std::time::Duration,
    ) -> Result<Self, SceneLinkError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| SceneLinkError::Timeout)?
    }

    /// Wrap an already-established WebSocket stream.
    ///
    /// This is the server-side entry point (wrap the stream from
    /// `accept_async`) and the escape hatch for custom TLS configuration or
    /// extra handshake headers on the client side.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), SceneLinkError> {
        if self.closed {
            return Err(SceneLinkError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| SceneLinkError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, SceneLinkError>> {
        // Non-text frames are consumed here; keep polling until a protocol
        // message or end-of-stream.
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "peer sent close frame");
                    return None;
                }
                // tungstenite queues the pong reply itself; the protocol's
                // own PING/PONG runs above this layer.
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(Message::Binary(_)) => {
                    warn!("skipping binary frame on a text-only channel");
                }
                // Not produced by the read half; kept for exhaustiveness.
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(SceneLinkError::TransportReceive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), SceneLinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| SceneLinkError::TransportSend(e.to_string()))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessage, ServerMessage};
    use tokio::net::TcpListener;

    /// Spawn a one-connection WebSocket server driven by `handler`, returning
    /// its `ws://` URL.
    async fn spawn_ws_peer<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    #[test]
    fn transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_rejects_garbage_url() {
        let err = WebSocketTransport::connect("not-a-valid-url")
            .await
            .unwrap_err();
        assert!(matches!(err, SceneLinkError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_expires_on_unresponsive_peer() {
        // A local listener that accepts the TCP connection but never answers
        // the WebSocket handshake, so the deadline is what ends the attempt.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let err = WebSocketTransport::connect_with_timeout(
            &format!("ws://{addr}"),
            std::time::Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SceneLinkError::Timeout));
        peer.abort();
    }

    #[tokio::test]
    async fn protocol_messages_survive_the_round_trip() {
        // The peer echoes the first frame back, so one transport exercises
        // both directions with real protocol JSON.
        let url = spawn_ws_peer(|mut ws| async move {
            if let Some(Ok(frame)) = ws.next().await {
                ws.send(frame).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        let ping = serde_json::to_string(&ClientMessage::Ping { ts: 777 }).unwrap();
        transport.send(ping.clone()).await.unwrap();

        let echoed = transport.recv().await.unwrap().unwrap();
        assert_eq!(echoed, ping);
        let parsed: ClientMessage = serde_json::from_str(&echoed).unwrap();
        assert!(matches!(parsed, ClientMessage::Ping { ts: 777 }));
    }

    #[tokio::test]
    async fn recv_skips_control_and_binary_frames() {
        let pong = serde_json::to_string(&ServerMessage::Pong { ts: 9 }).unwrap();
        let url = spawn_ws_peer(move |mut ws| async move {
            ws.send(Message::Ping(vec![1].into())).await.unwrap();
            ws.send(Message::Binary(vec![0xDE, 0xAD].into())).await.unwrap();
            ws.send(Message::Text(pong.into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        // The first protocol-visible message is the text frame.
        let text = transport.recv().await.unwrap().unwrap();
        let parsed: ServerMessage = serde_json::from_str(&text).unwrap();
        assert!(matches!(parsed, ServerMessage::Pong { ts: 9 }));
        // Then the close frame ends the stream.
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_sends() {
        let url = spawn_ws_peer(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, SceneLinkError::TransportClosed));

        // recv after close must not hang; end-of-stream or an error are both
        // acceptable, a message is not.
        match transport.recv().await {
            None | Some(Err(_)) => {}
            Some(Ok(msg)) => panic!("unexpected message after close: {msg}"),
        }
    }

    #[tokio::test]
    async fn from_stream_wraps_a_dialed_connection() {
        let url = spawn_ws_peer(|mut ws| async move {
            ws.send(Message::Text("wrapped".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let (raw, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let mut transport = WebSocketTransport::from_stream(raw);
        assert_eq!(transport.recv().await.unwrap().unwrap(), "wrapped");
    }
}
