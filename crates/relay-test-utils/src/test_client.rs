// test_client: a bare WebSocket client for poking relay endpoints.
//
// No reconnect, no resume: tests drive every frame explicitly and assert
// on exactly what comes back.  For the full client policy use the
// relay-client crate instead.

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{Envelope, FrameDecode};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

/// What one `recv` yielded.
#[derive(Debug)]
pub enum Received {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

impl TestClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws, _response) = connect_async(url).await?;
        Ok(TestClient { ws })
    }

    /// Send any serializable value as one JSON text frame.
    pub async fn send_json<T: Serialize>(
        &mut self,
        value: &T,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let text = serde_json::to_string(value)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send a raw text frame (for malformed-input tests).
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.ws.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Next text frame or close, with a deadline.
    pub async fn recv(&mut self) -> Result<Received, Box<dyn std::error::Error>> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .map_err(|_| "timeout waiting for frame")?;
            match msg {
                None => {
                    return Ok(Received::Closed {
                        code: None,
                        reason: "stream ended".to_owned(),
                    });
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => return Ok(Received::Text(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Ok(Received::Closed { code, reason });
                }
                Some(Ok(Message::Ping(data))) => {
                    self.ws.send(Message::Pong(data)).await?;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// Next text frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        match self.recv().await? {
            Received::Text(text) => Ok(serde_json::from_str(&text)?),
            Received::Closed { code, reason } => {
                Err(format!("closed ({code:?}): {reason}").into())
            }
        }
    }

    /// Next text frame decoded as a protocol envelope.
    pub async fn recv_envelope(&mut self) -> Result<Envelope, Box<dyn std::error::Error>> {
        match self.recv().await? {
            Received::Text(text) => match Envelope::decode(&text) {
                FrameDecode::Envelope(envelope) => Ok(envelope),
                other => Err(format!("not an envelope: {other:?}").into()),
            },
            Received::Closed { code, reason } => {
                Err(format!("closed ({code:?}): {reason}").into())
            }
        }
    }

    /// Expect the server to close with `code`.
    pub async fn expect_close(&mut self, code: u16) -> Result<String, Box<dyn std::error::Error>> {
        loop {
            match self.recv().await? {
                Received::Closed {
                    code: Some(actual),
                    reason,
                } if actual == code => return Ok(reason),
                Received::Closed { code: actual, reason } => {
                    return Err(format!(
                        "expected close {code}, got {actual:?} ({reason})"
                    )
                    .into());
                }
                Received::Text(_) => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
