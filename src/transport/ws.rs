//! WebSocket channel implementation.
//!
//! Each opened channel is one spawned task owning the
//! [`tokio_tungstenite`] stream. The task performs the connect handshake,
//! then pumps inbound frames into the owner's event channel and drains
//! outbound commands from the handle, until either side ends the
//! connection. Ping/pong frames are answered by the library and never
//! surface as events.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::transport::{ChannelEvent, ChannelHandle, Connector, CLOSE_ABNORMAL};
use crate::{AppError, Result};

/// Outbound commands from the handle to the channel task.
#[derive(Debug)]
enum WsCommand {
    /// Transmit one text frame.
    Send(String),
    /// Close with a code and diagnostic reason.
    Close { code: u16, reason: String },
}

/// [`Connector`] producing WebSocket channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a WebSocket connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str, events: mpsc::Sender<ChannelEvent>) -> Result<Box<dyn ChannelHandle>> {
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(AppError::Connection(format!(
                "unsupported endpoint `{url}` (expected a ws:// or wss:// URL)"
            )));
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_channel(url.to_owned(), events, cmd_rx));
        Ok(Box::new(WsHandle { cmd_tx }))
    }
}

/// Outbound half of a WebSocket channel.
struct WsHandle {
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
}

impl ChannelHandle for WsHandle {
    fn transmit(&self, text: String) -> Result<()> {
        self.cmd_tx
            .send(WsCommand::Send(text))
            .map_err(|_| AppError::ConnectionClosed("channel task has exited".into()))
    }

    fn begin_close(&self, code: u16, reason: String) {
        // The task may already be gone; nothing left to close then.
        let _ = self.cmd_tx.send(WsCommand::Close { code, reason });
    }
}

/// Channel task: connect, then pump frames and commands until the
/// connection ends.
///
/// Every exit path emits a terminal [`ChannelEvent::Closed`], preceded by
/// [`ChannelEvent::Errored`] when the end was not a close handshake. Event
/// sends are allowed to fail silently; that means the owner has already
/// detached.
async fn drive_channel(
    url: String,
    events: mpsc::Sender<ChannelEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
) {
    let (stream, _response) = match connect_async(url.as_str()).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(url, %err, "websocket connect failed");
            let detail = err.to_string();
            let _ = events.send(ChannelEvent::Errored(detail.clone())).await;
            let _ = events
                .send(ChannelEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: detail,
                })
                .await;
            return;
        }
    };

    debug!(url, "websocket connected");
    if events.send(ChannelEvent::Opened).await.is_err() {
        return;
    }

    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(WsCommand::Send(text)) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!(url, %err, "websocket send failed");
                        let detail = err.to_string();
                        let _ = events.send(ChannelEvent::Errored(detail.clone())).await;
                        let _ = events
                            .send(ChannelEvent::Closed { code: CLOSE_ABNORMAL, reason: detail })
                            .await;
                        return;
                    }
                }
                Some(WsCommand::Close { code, reason }) => {
                    debug!(url, code, reason, "closing websocket");
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    let _ = events.send(ChannelEvent::Closed { code, reason }).await;
                    return;
                }
                None => {
                    // Handle dropped without an explicit close.
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },

            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if events.send(ChannelEvent::Message(text)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or_else(
                        || (CLOSE_ABNORMAL, "closed without a close frame".into()),
                        |f| (u16::from(f.code), f.reason.into_owned()),
                    );
                    debug!(url, code, reason, "websocket closed by peer");
                    let _ = events.send(ChannelEvent::Closed { code, reason }).await;
                    return;
                }
                // Binary, ping, and pong frames carry no protocol traffic.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(url, %err, "websocket stream error");
                    let detail = err.to_string();
                    let _ = events.send(ChannelEvent::Errored(detail.clone())).await;
                    let _ = events
                        .send(ChannelEvent::Closed { code: CLOSE_ABNORMAL, reason: detail })
                        .await;
                    return;
                }
                None => {
                    let _ = events
                        .send(ChannelEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: "stream ended".into(),
                        })
                        .await;
                    return;
                }
            },
        }
    }
}
