//! WebSocket connection carrying Engine.IO frames

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::frame;
use crate::error::{ChatError, ChatResult};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct EngineSocket {
    stream: WsStream,
    /// Last time anything arrived from the server, pings included.
    last_inbound: Instant,
}

impl EngineSocket {
    /// Open the websocket transport. The bearer token goes in the upgrade request;
    /// the Socket.IO connect packet carries it again once the socket is open.
    pub async fn connect(socket_url: &str, token: &str) -> ChatResult<Self> {
        let ws_url = websocket_url(socket_url)?;
        tracing::info!("Connecting WebSocket to {}", ws_url);

        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| ChatError::Handshake(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ChatError::Handshake(format!("invalid token: {}", e)))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| ChatError::Handshake(format!("WebSocket connection failed: {}", e)))?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self {
            stream,
            last_inbound: Instant::now(),
        })
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, msg: &str) -> ChatResult<()> {
        tracing::debug!("WS send: {}", msg);
        self.stream
            .send(Message::Text(msg.to_string()))
            .await
            .map_err(|e| ChatError::Handshake(format!("Failed to send WebSocket message: {}", e)))
    }

    /// Receive the next text frame, ignoring pings/pongs.
    ///
    /// Engine.IO pings (`2`) are answered with a pong (`3`) here and never
    /// returned; the server drops clients that miss a pong.
    pub async fn recv_frame(&mut self) -> ChatResult<Option<String>> {
        loop {
            let next = self.stream.next().await;
            if matches!(next, Some(Ok(_))) {
                self.last_inbound = Instant::now();
            }
            match next {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);

                    if text == "2" {
                        self.send_text(frame::PONG).await?;
                        continue;
                    }

                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| ChatError::Handshake(format!("Failed to send pong: {}", e)))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(ChatError::Handshake(format!("WebSocket receive error: {}", e)));
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    /// Time since the server last sent anything.
    pub fn quiet_for(&self) -> Duration {
        self.last_inbound.elapsed()
    }

    /// Close gracefully; errors are irrelevant at this point.
    pub async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close: {}", e);
        }
    }
}

/// Socket.IO websocket endpoint for a server base URL.
pub fn websocket_url(base: &str) -> ChatResult<Url> {
    let mut url =
        Url::parse(base).map_err(|e| ChatError::Handshake(format!("invalid socket URL {}: {}", base, e)))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Handshake(format!("cannot use {} as a websocket URL", base)))?;
    url.set_path("/socket.io/");
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url)
}
