//! Socket transport seam
//!
//! The manager never touches a socket directly. A [`Connector`] opens a
//! [`Link`]: an outbound text sender and an inbound event receiver. The
//! production connector drives a WebSocket with tokio-tungstenite; tests
//! hand the manager in-memory links.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::{ConnectionFailure, Error, Result};

/// RFC 6455 normal closure
pub const NORMAL_CLOSE: u16 = 1000;
/// RFC 6455 abnormal closure (no close frame received)
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Something that happened on the inbound side of a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A text frame
    Message(String),
    /// The link closed; `code` is the close code, if any was received
    Closed { code: Option<u16>, reason: String },
    /// The link failed
    Error(String),
}

impl LinkEvent {
    /// Effective close code, treating a missing one as abnormal
    pub fn close_code(code: Option<u16>) -> u16 {
        code.unwrap_or(ABNORMAL_CLOSE)
    }
}

/// An open bidirectional link
#[derive(Debug)]
pub struct Link {
    /// Frames written here are sent in order; dropping it closes the link
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link>;
}

/// WebSocket connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    open_timeout: Duration,
}

impl WsConnector {
    pub fn new(open_timeout: Duration) -> Self {
        Self { open_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let (stream, _response) =
            tokio::time::timeout(self.open_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| Error::Timeout(self.open_timeout))?
                .map_err(classify_ws_error)?;

        tracing::debug!(url = %redact(url), "WebSocket opened");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<LinkEvent>();

        // Writer: forwards frames until the sender is dropped, then closes
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::debug!(error = %e, "WebSocket send failed");
                    return;
                }
            }
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client closing".into(),
                })))
                .await;
            let _ = sink.close().await;
        });

        // Reader: forwards text frames and the final close or error
        tokio::spawn(async move {
            loop {
                let event = match source.next().await {
                    Some(Ok(Message::Text(text))) => LinkEvent::Message(text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => LinkEvent::Message(text),
                        Err(_) => {
                            tracing::warn!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                            None => (None, String::new()),
                        };
                        let _ = inbound_tx.send(LinkEvent::Closed { code, reason });
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = inbound_tx.send(LinkEvent::Error(e.to_string()));
                        return;
                    }
                    None => {
                        let _ = inbound_tx.send(LinkEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        });
                        return;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    return;
                }
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Map a handshake failure onto the error taxonomy
fn classify_ws_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                Error::Authentication(format!("socket handshake rejected ({})", status))
            } else {
                Error::connection(
                    ConnectionFailure::Status(status),
                    format!("socket handshake failed ({})", status),
                )
            }
        }
        tungstenite::Error::Io(e) => Error::unreachable(format!("socket unreachable: {}", e)),
        tungstenite::Error::Tls(e) => Error::unreachable(format!("TLS failure: {}", e)),
        tungstenite::Error::Url(e) => Error::Validation(format!("invalid socket URL: {}", e)),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Error::connection(ConnectionFailure::Closed, "socket closed during handshake")
        }
        other => Error::protocol(format!("socket handshake failed: {}", other)),
    }
}

/// Strip query parameters (which may carry keys) from a URL for logging
pub(crate) fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
