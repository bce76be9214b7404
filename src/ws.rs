//! WebSocket transport.
//!
//! [`WsConn`] wraps a `tokio-tungstenite` stream behind a pump task that
//! owns the socket: sends are serialized through a command channel, inbound
//! frames are forwarded in receipt order, and ping/pong is answered inside
//! the pump. The transport is opaque to message semantics; the Live session
//! layer interprets frames.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::LiveErrorKind;
use crate::http::Headers;
use crate::{Error, Result};

/// An inbound frame, decoded to the level the transport understands.
#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame {
    /// A text frame.
    Text(String),
    /// A binary frame.
    Binary(Vec<u8>),
    /// The peer closed the connection.
    Closed {
        /// Close code (1000 = normal).
        code: u16,
        /// Close reason text.
        reason: String,
    },
}

enum WsCommand {
    Send {
        message: Message,
        tx_result: oneshot::Sender<std::result::Result<(), WsError>>,
    },
    Close {
        tx_result: oneshot::Sender<std::result::Result<(), WsError>>,
    },
}

/// Sending half of a connection. Clones share the same serialized queue.
#[derive(Clone)]
pub struct WsSender {
    tx_command: mpsc::Sender<WsCommand>,
}

impl WsSender {
    async fn request(
        &self,
        make_command: impl FnOnce(oneshot::Sender<std::result::Result<(), WsError>>) -> WsCommand,
    ) -> Result<()> {
        let (tx_result, rx_result) = oneshot::channel();
        if self.tx_command.send(make_command(tx_result)).await.is_err() {
            return Err(closed_error(1006, "connection pump gone"));
        }
        rx_result
            .await
            .unwrap_or(Err(WsError::ConnectionClosed))
            .map_err(|e| closed_error(1006, e.to_string()))
    }

    /// Sends a text frame.
    pub async fn send_text(&self, frame: String) -> Result<()> {
        self.request(|tx_result| WsCommand::Send {
            message: Message::Text(frame.into()),
            tx_result,
        })
        .await
    }

    /// Sends a binary frame.
    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.request(|tx_result| WsCommand::Send {
            message: Message::Binary(bytes.into()),
            tx_result,
        })
        .await
    }

    /// Sends a close frame and shuts the pump down.
    pub async fn close(&self) -> Result<()> {
        self.request(|tx_result| WsCommand::Close { tx_result }).await
    }
}

impl std::fmt::Debug for WsSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSender").finish_non_exhaustive()
    }
}

/// Receiving half of a connection. Owns the pump task.
pub struct WsReceiver {
    rx_message: mpsc::UnboundedReceiver<std::result::Result<WsFrame, WsError>>,
    pump_task: tokio::task::JoinHandle<()>,
}

impl WsReceiver {
    /// Next inbound frame, in receipt order. `None` after the pump exits.
    pub async fn next(&mut self) -> Option<Result<WsFrame>> {
        match self.rx_message.recv().await {
            Some(Ok(frame)) => Some(Ok(frame)),
            Some(Err(err)) => Some(Err(closed_error(1006, err.to_string()))),
            None => None,
        }
    }
}

impl Drop for WsReceiver {
    fn drop(&mut self) {
        self.pump_task.abort();
    }
}

impl std::fmt::Debug for WsReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsReceiver").finish_non_exhaustive()
    }
}

/// A live WebSocket connection.
///
/// Sends are serialized in call order through the pump's command channel;
/// [`WsConn::next`] yields inbound frames in receipt order. [`WsConn::split`]
/// separates the halves for sessions that read and write from different
/// tasks.
pub struct WsConn {
    sender: WsSender,
    receiver: WsReceiver,
}

impl WsConn {
    /// Opens a connection to `url` with the given headers.
    pub async fn connect(url: &str, headers: &Headers) -> Result<Self> {
        info!(url = redact_query(url), "connecting websocket");
        let mut request = url
            .into_client_request()
            .map_err(|e| map_connect_error(e, url))?;
        for (name, value) in headers {
            let name: tokio_tungstenite::tungstenite::http::HeaderName = name
                .parse()
                .map_err(|_| Error::validation(format!("invalid header name {name}")))?;
            let value = value
                .parse()
                .map_err(|_| Error::validation(format!("invalid value for header {name}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| map_connect_error(e, url))?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (tx_command, mut rx_command) = mpsc::channel::<WsCommand>(32);
        let (tx_message, rx_message) =
            mpsc::unbounded_channel::<std::result::Result<WsFrame, WsError>>();

        let pump_task = tokio::spawn(async move {
            let mut inner = inner;
            loop {
                tokio::select! {
                    command = rx_command.recv() => {
                        let Some(command) = command else {
                            let _ = inner.close(None).await;
                            break;
                        };
                        match command {
                            WsCommand::Send { message, tx_result } => {
                                let result = inner.send(message).await;
                                let should_break = result.is_err();
                                let _ = tx_result.send(result);
                                if should_break {
                                    break;
                                }
                            }
                            WsCommand::Close { tx_result } => {
                                let result = inner.close(None).await;
                                let _ = tx_result.send(result);
                                break;
                            }
                        }
                    }
                    message = inner.next() => {
                        let Some(message) = message else {
                            break;
                        };
                        match message {
                            Ok(Message::Ping(payload)) => {
                                if let Err(err) = inner.send(Message::Pong(payload)).await {
                                    let _ = tx_message.send(Err(err));
                                    break;
                                }
                            }
                            Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                            Ok(Message::Text(text)) => {
                                if tx_message.send(Ok(WsFrame::Text(text.to_string()))).is_err() {
                                    break;
                                }
                            }
                            Ok(Message::Binary(bytes)) => {
                                if tx_message.send(Ok(WsFrame::Binary(bytes.to_vec()))).is_err() {
                                    break;
                                }
                            }
                            Ok(Message::Close(frame)) => {
                                let frame = match frame {
                                    Some(f) => WsFrame::Closed {
                                        code: f.code.into(),
                                        reason: f.reason.to_string(),
                                    },
                                    None => WsFrame::Closed {
                                        code: 1000,
                                        reason: String::new(),
                                    },
                                };
                                let _ = tx_message.send(Ok(frame));
                                break;
                            }
                            Err(err) => {
                                let _ = tx_message.send(Err(err));
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            sender: WsSender { tx_command },
            receiver: WsReceiver {
                rx_message,
                pump_task,
            },
        }
    }

    /// Splits into independent sending and receiving halves.
    pub fn split(self) -> (WsSender, WsReceiver) {
        (self.sender, self.receiver)
    }

    /// Sends a text frame.
    pub async fn send_text(&self, frame: String) -> Result<()> {
        self.sender.send_text(frame).await
    }

    /// Sends a binary frame.
    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.sender.send_binary(bytes).await
    }

    /// Sends a close frame and shuts the pump down.
    pub async fn close(&self) -> Result<()> {
        self.sender.close().await
    }

    /// Next inbound frame, in receipt order. `None` after the pump exits.
    pub async fn next(&mut self) -> Option<Result<WsFrame>> {
        self.receiver.next().await
    }
}

impl std::fmt::Debug for WsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConn").finish_non_exhaustive()
    }
}

fn closed_error(code: u16, reason: impl Into<String>) -> Error {
    Error::live(LiveErrorKind::Closed {
        code,
        reason: reason.into(),
    })
}

fn map_connect_error(err: WsError, url: &str) -> Error {
    debug!(url = redact_query(url), error = %err, "websocket connect failed");
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .and_then(|bytes| String::from_utf8(bytes.clone()).ok())
                .unwrap_or_default();
            Error::http(status, body)
        }
        other => closed_error(1006, other.to_string()),
    }
}

/// Strips the query string before a URL reaches a log line; API keys travel
/// in `?key=`.
fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_query() {
        assert_eq!(
            redact_query("wss://host/ws/path?key=secret"),
            "wss://host/ws/path"
        );
        assert_eq!(redact_query("wss://host/ws/path"), "wss://host/ws/path");
    }

    #[test]
    fn test_closed_frame_shape() {
        let frame = WsFrame::Closed {
            code: 1000,
            reason: String::new(),
        };
        assert_eq!(
            frame,
            WsFrame::Closed {
                code: 1000,
                reason: String::new()
            }
        );
    }
}
