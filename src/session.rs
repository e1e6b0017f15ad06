//! Connection-session lifecycle management.
//!
//! A [`Session`] owns at most one live channel and presents a
//! request/response-friendly API over it: [`Session::ensure_open`] to reach
//! the open state (concurrent callers share one attempt),
//! [`Session::send`] for outbound requests, and [`Session::close`] for
//! explicit teardown. Everything the channel reports is fanned out to a
//! single [`SessionEvents`] listener registered at construction.
//!
//! Each channel instance gets an epoch number when it is created; events
//! carrying a stale epoch are dropped before any state change or listener
//! call, so a discarded channel can never mutate the session it used to
//! belong to. One pump task per channel delivers events in arrival order
//! and runs each listener callback to completion before taking the next
//! event. Callbacks are invoked outside the session lock, so a listener may
//! call back into the session (e.g. to close it).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{ClientRequest, ServerMessage};
use crate::transport::{ChannelEvent, ChannelHandle, ChannelState, Connector};
use crate::{AppError, Result};

/// Buffered channel events per channel before the transport task blocks.
const EVENT_BUFFER: usize = 32;

/// How a channel went away.
#[derive(Debug, Clone)]
pub struct Disconnect {
    /// Whether this channel instance ever reached the open state.
    pub was_connected: bool,
    /// Transport-level detail, for diagnostics only.
    pub detail: String,
}

/// Listener capability a [`Session`] fans its events out to.
///
/// Exactly one listener is registered per session, at construction. All
/// callbacks for one channel run on that channel's pump task, in event
/// order, each to completion before the next.
pub trait SessionEvents: Send + Sync {
    /// The channel finished its opening handshake.
    fn on_open(&self) {}

    /// One parsed inbound message.
    fn on_message(&self, message: ServerMessage);

    /// An inbound payload failed to parse. The message is dropped; the
    /// channel stays up.
    fn on_malformed_message(&self, error: &AppError) {
        debug!(%error, "malformed message ignored");
    }

    /// The channel reported an error. `was_connected` tells whether the
    /// channel had ever been open.
    fn on_error(&self, disconnect: Disconnect);

    /// The channel closed unexpectedly after having been open. Never
    /// delivered for explicit [`Session::close`] calls, and never together
    /// with the `on_error` notification of a channel that failed to open.
    fn on_close(&self, disconnect: Disconnect);
}

/// A live channel attached to the session.
struct Slot {
    handle: Box<dyn ChannelHandle>,
    epoch: u64,
    cancel: CancellationToken,
}

/// Mutable session state, guarded by the session mutex.
struct Inner {
    state: ChannelState,
    channel: Option<Slot>,
    /// Unsettled `ensure_open` waiters; drained exactly once per attempt.
    waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Set by [`Session::close`]; suppresses unexpected-close notification.
    explicit_close: bool,
    /// Whether the current channel instance ever reached open.
    connected: bool,
    /// Monotonic channel counter; stale-event guard.
    epoch: u64,
}

/// Owns one channel and its lifecycle.
pub struct Session {
    inner: Arc<Mutex<Inner>>,
    listener: Arc<dyn SessionEvents>,
    connector: Arc<dyn Connector>,
    url: String,
}

impl Session {
    /// Create a session for `url`. No channel is opened until
    /// [`Session::ensure_open`] is called.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        url: impl Into<String>,
        listener: Arc<dyn SessionEvents>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ChannelState::Idle,
                channel: None,
                waiters: Vec::new(),
                explicit_close: false,
                connected: false,
                epoch: 0,
            })),
            listener,
            connector,
            url: url.into(),
        }
    }

    /// Current channel state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    /// Bring the session to the open state.
    ///
    /// Open: returns immediately. Connecting: joins the in-flight attempt,
    /// so concurrent callers share one channel and one outcome. Closing or
    /// closed: the dead channel is discarded and a fresh one is opened.
    /// Idle: a fresh channel is opened.
    ///
    /// # Errors
    ///
    /// - [`AppError::Connection`] — the channel never reached open.
    /// - [`AppError::ConnectionClosed`] — the channel (or the session)
    ///   closed before the handshake finished.
    pub async fn ensure_open(&self) -> Result<()> {
        let rx = {
            let mut inner = lock(&self.inner);
            match inner.state {
                ChannelState::Open => return Ok(()),
                ChannelState::Connecting => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    rx
                }
                ChannelState::Idle | ChannelState::Closing | ChannelState::Closed => {
                    discard_slot(&mut inner);
                    self.open_channel(&mut inner)?
                }
            }
        };

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::ConnectionClosed("open attempt abandoned".into())),
        }
    }

    /// Serialize `request` and transmit it as one channel message.
    ///
    /// Nothing is queued while the channel is not open; callers must
    /// [`Session::ensure_open`] first.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotOpen`] — the channel is not open.
    /// - [`AppError::ConnectionClosed`] — the channel task exited under us.
    pub fn send(&self, request: &ClientRequest) -> Result<()> {
        let inner = lock(&self.inner);
        if inner.state != ChannelState::Open {
            return Err(AppError::NotOpen);
        }
        let Some(slot) = inner.channel.as_ref() else {
            return Err(AppError::NotOpen);
        };
        let text = serde_json::to_string(request)
            .map_err(|err| AppError::Io(format!("failed to serialise request: {err}")))?;
        slot.handle.transmit(text)
    }

    /// Explicitly close the session's channel with `(code, reason)`.
    ///
    /// Detaches the channel's pump (no further events are delivered for
    /// it), rejects any unsettled open waiters, and requests the underlying
    /// close. The listener is not notified; explicit closes are silent by
    /// contract. Idempotent: calling on an idle session is a no-op.
    pub fn close(&self, code: u16, reason: &str) {
        let (slot, waiters) = {
            let mut inner = lock(&self.inner);
            if inner.channel.is_none() && inner.state == ChannelState::Idle {
                return;
            }
            inner.explicit_close = true;
            inner.connected = false;
            let slot = inner.channel.take();
            let waiters = std::mem::take(&mut inner.waiters);
            inner.state = if slot.is_some() {
                ChannelState::Closing
            } else {
                ChannelState::Idle
            };
            (slot, waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(Err(AppError::ConnectionClosed(
                "closed before the channel opened".into(),
            )));
        }

        if let Some(slot) = slot {
            debug!(code, reason, epoch = slot.epoch, "session close requested");
            slot.cancel.cancel();
            slot.handle.begin_close(code, reason.to_owned());
        }
    }

    /// Open a fresh channel and spawn its event pump.
    ///
    /// Caller holds the lock and has already discarded any previous slot.
    fn open_channel(&self, inner: &mut Inner) -> Result<oneshot::Receiver<Result<()>>> {
        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.explicit_close = false;
        inner.connected = false;

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let handle = self.connector.open(&self.url, event_tx)?;
        let cancel = CancellationToken::new();
        inner.channel = Some(Slot {
            handle,
            epoch,
            cancel: cancel.clone(),
        });
        inner.state = ChannelState::Connecting;

        let (tx, rx) = oneshot::channel();
        inner.waiters.push(tx);

        let shared = Arc::clone(&self.inner);
        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => {
                        debug!(epoch, "channel pump detached");
                        break;
                    }

                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        if handle_event(&shared, listener.as_ref(), epoch, event) {
                            break;
                        }
                    }
                }
            }
        });

        debug!(epoch, url = self.url, "channel opening");
        Ok(rx)
    }
}

/// What a handled event asks the pump to do after the lock is released.
enum Notify {
    Open,
    Message(ServerMessage),
    Malformed(AppError),
    Error(Disconnect),
    Close(Disconnect),
}

/// Process one channel event: mutate state under the lock, then settle
/// waiters and invoke the listener after releasing it.
///
/// Returns `true` when the pump should stop (terminal event or stale
/// channel).
fn handle_event(
    inner: &Mutex<Inner>,
    listener: &dyn SessionEvents,
    epoch: u64,
    event: ChannelEvent,
) -> bool {
    let mut settled: Option<(Vec<oneshot::Sender<Result<()>>>, Result<()>)> = None;
    let mut notifies: Vec<Notify> = Vec::new();
    let mut terminal = false;

    {
        let mut st = lock(inner);
        let attached = st.channel.as_ref().is_some_and(|slot| slot.epoch == epoch);
        if !attached {
            debug!(epoch, "dropping event from detached channel");
            return true;
        }

        match event {
            ChannelEvent::Opened => {
                st.state = ChannelState::Open;
                st.connected = true;
                settled = Some((std::mem::take(&mut st.waiters), Ok(())));
                notifies.push(Notify::Open);
            }

            ChannelEvent::Message(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => notifies.push(Notify::Message(message)),
                Err(err) => notifies.push(Notify::Malformed(AppError::MalformedMessage(
                    err.to_string(),
                ))),
            },

            ChannelEvent::Errored(detail) => {
                if !st.connected {
                    settled = Some((
                        std::mem::take(&mut st.waiters),
                        Err(AppError::Connection(detail.clone())),
                    ));
                }
                notifies.push(Notify::Error(Disconnect {
                    was_connected: st.connected,
                    detail,
                }));
            }

            ChannelEvent::Closed { code, reason } => {
                st.channel = None;
                st.state = ChannelState::Closed;
                let was_explicit = st.explicit_close;
                let was_connected = st.connected;
                st.explicit_close = false;
                st.connected = false;

                if !st.waiters.is_empty() {
                    settled = Some((
                        std::mem::take(&mut st.waiters),
                        Err(AppError::ConnectionClosed(reason.clone())),
                    ));
                }

                if !was_explicit {
                    let disconnect = Disconnect {
                        was_connected,
                        detail: format!("{code}: {reason}"),
                    };
                    if was_connected {
                        notifies.push(Notify::Close(disconnect));
                    } else {
                        notifies.push(Notify::Error(disconnect));
                    }
                }
                terminal = true;
            }
        }
    }

    if let Some((waiters, outcome)) = settled {
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    for notify in notifies {
        match notify {
            Notify::Open => listener.on_open(),
            Notify::Message(message) => listener.on_message(message),
            Notify::Malformed(error) => listener.on_malformed_message(&error),
            Notify::Error(disconnect) => listener.on_error(disconnect),
            Notify::Close(disconnect) => listener.on_close(disconnect),
        }
    }

    terminal
}

/// Detach and drop the current channel slot, if any.
fn discard_slot(inner: &mut Inner) {
    if let Some(slot) = inner.channel.take() {
        debug!(epoch = slot.epoch, "discarding dead channel");
        slot.cancel.cancel();
    }
}

/// Lock the session state, recovering from a poisoned mutex.
fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
