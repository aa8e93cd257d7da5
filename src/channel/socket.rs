use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_CONNECT_TIMEOUT: u16 = 4000;
pub const CLOSE_PING_FAILED: u16 = 4001;

/// JSON envelope exchanged on the channel: `{type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChannelFrame {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: None,
        }
    }

    pub fn ping(now_ms: i64) -> Self {
        Self {
            kind: "ping".to_string(),
            data: Value::Null,
            timestamp: Some(now_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Closed(CloseInfo),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelFault {
    #[error("channel connect failed: {0}")]
    Connect(String),
    #[error("channel send failed: {0}")]
    Send(String),
    #[error("invalid channel url: {0}")]
    Url(String),
}

/// Opens duplex connections. The production implementation is [`WsConnector`].
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn ChannelSocket>, ChannelFault>;
}

/// An open connection. `next_event` must be cancel safe; it is raced against
/// outbound traffic and timers.
#[async_trait]
pub trait ChannelSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelFault>;
    async fn next_event(&mut self) -> SocketEvent;
    async fn close(&mut self, code: u16, reason: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn ChannelSocket>, ChannelFault> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|err| ChannelFault::Connect(err.to_string()))?;
        Ok(Box::new(WsSocket { stream }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl ChannelSocket for WsSocket {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelFault> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| ChannelFault::Send(err.to_string()))
    }

    async fn next_event(&mut self) -> SocketEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return SocketEvent::Text(text.as_str().to_owned()),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return SocketEvent::Text(text),
                    Err(_) => tracing::debug!("ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let info = frame
                        .map(|frame| CloseInfo::new(frame.code.into(), frame.reason.as_str()))
                        .unwrap_or_else(|| CloseInfo::new(CLOSE_ABNORMAL, ""));
                    return SocketEvent::Closed(info);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(err)) => return SocketEvent::Closed(CloseInfo::new(CLOSE_ABNORMAL, err.to_string())),
                None => return SocketEvent::Closed(CloseInfo::new(CLOSE_ABNORMAL, "connection closed")),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Err(err) = self.stream.close(Some(frame)).await {
            tracing::debug!(error = %err, "channel close handshake failed");
        }
    }
}
