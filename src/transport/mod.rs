//! Duplex channel abstraction.
//!
//! A channel is an ordered, reliable, bidirectional message stream. The
//! [`Connector`] trait hides the concrete transport behind two halves: a
//! [`ChannelHandle`] for outbound traffic and a tokio [`mpsc`] stream of
//! [`ChannelEvent`]s for everything the transport reports back. Opening
//! returns immediately with the handle; the channel is not usable until the
//! [`ChannelEvent::Opened`] event arrives.
//!
//! The production implementation is [`ws::WsConnector`]; tests substitute
//! scripted stubs to drive the session state machine deterministically.

pub mod ws;

use tokio::sync::mpsc;

use crate::Result;

/// Close code for normal application-level closes.
///
/// The accompanying reason string is diagnostic only and never parsed by
/// the peer.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when a channel ends without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Lifecycle state of a session's channel.
///
/// Mirrors the transport's reported state, plus `Idle` before any channel
/// exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No channel exists.
    Idle,
    /// A channel exists but has not finished its opening handshake.
    Connecting,
    /// The channel is open for traffic.
    Open,
    /// An explicit close was requested; underlying teardown is in flight.
    Closing,
    /// The channel closed without an explicit request.
    Closed,
}

/// Events a channel reports to its owner, in the order the transport
/// observed them.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The opening handshake completed.
    Opened,
    /// One complete inbound text message.
    Message(String),
    /// A transport-level error occurred. Always followed by `Closed`.
    Errored(String),
    /// The channel is gone. Terminal for this channel instance.
    Closed {
        /// Close code (1000 for clean closes, 1006 for abnormal ends).
        code: u16,
        /// Diagnostic reason string.
        reason: String,
    },
}

/// Outbound half of an open channel.
///
/// Both operations enqueue onto the transport task and return immediately;
/// delivery failures surface later as [`ChannelEvent`]s.
pub trait ChannelHandle: Send + Sync {
    /// Enqueue one text message for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`](crate::AppError::ConnectionClosed)
    /// if the transport task has already exited.
    fn transmit(&self, text: String) -> Result<()>;

    /// Request the channel close with `(code, reason)`.
    ///
    /// Best-effort: a channel whose task already exited is silently left
    /// alone.
    fn begin_close(&self, code: u16, reason: String);
}

/// Factory for channels to a fixed kind of endpoint.
pub trait Connector: Send + Sync {
    /// Begin opening a channel to `url`.
    ///
    /// Returns immediately with the outbound handle; the channel is in the
    /// connecting state until [`ChannelEvent::Opened`] arrives on `events`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Connection`](crate::AppError::Connection) if the
    /// attempt cannot even be started (e.g. an unsupported URL scheme).
    fn open(&self, url: &str, events: mpsc::Sender<ChannelEvent>) -> Result<Box<dyn ChannelHandle>>;
}
