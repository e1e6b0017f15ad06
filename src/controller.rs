//! Run governance: turn "check this domain now" into exactly one run.
//!
//! A [`RunController`] owns the token lineage. Every [`RunController::start`]
//! allocates a fresh [`RunToken`], closes whatever session the previous run
//! was using, and binds a brand-new [`Session`] to the new token; two runs
//! never share a session. Any continuation that captured an older token
//! re-checks it against the current token after every suspension point and
//! at every dispatch; a mismatch voids the continuation without touching
//! shared state.
//!
//! Cancellation is cooperative: a superseded attempt is never aborted
//! mid-flight, its channel is closed and its results are discarded at the
//! token checks.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::consensus::ConsensusAggregator;
use crate::protocol::{ClientRequest, Provider, ProviderResult, ServerMessage, TransportMode};
use crate::session::{Disconnect, Session, SessionEvents};
use crate::sink::PresentationSink;
use crate::transport::{ChannelState, Connector, CLOSE_NORMAL};
use crate::{AppError, Result};

/// User-visible failure when an open channel drops mid-run.
pub const MSG_CONNECTION_LOST: &str = "Connection lost before all results were received.";

/// User-visible failure when the channel never reached open.
pub const MSG_COULD_NOT_CONNECT: &str = "Unable to connect to the DNS checker service.";

/// User-visible notice for an unparseable server message. The run keeps
/// going; nothing is torn down.
pub const MSG_MALFORMED: &str = "Received a malformed message from the server.";

/// Domain shape accepted before a check is submitted (length is checked
/// separately).
const DOMAIN_PATTERN: &str = r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$";

/// Identifies one run for its whole lineage. Strictly increasing per
/// controller; a stale token voids whatever continuation holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunToken(u64);

impl Display for RunToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Caller input for one check run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckParams {
    /// Domain name to check.
    pub domain: String,
    /// Provider list to run against; server default when absent.
    pub list_id: Option<String>,
    /// Resolver transport mode; server default when absent.
    pub transport: Option<TransportMode>,
}

impl CheckParams {
    /// Parameters for `domain` with server-side defaults for the rest.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            list_id: None,
            transport: None,
        }
    }

    /// Trim and lowercase the domain, rejecting input that cannot be a
    /// domain name.
    fn normalized(&self) -> Result<Self> {
        let domain = self.domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            return Err(AppError::InvalidInput("domain must not be empty".into()));
        }
        if domain.len() > 255 {
            return Err(AppError::InvalidInput(
                "domain exceeds 255 characters".into(),
            ));
        }
        if !Regex::new(DOMAIN_PATTERN).map_or(true, |re| re.is_match(&domain)) {
            return Err(AppError::InvalidInput(format!(
                "`{domain}` does not look like a domain name"
            )));
        }
        Ok(Self {
            domain,
            list_id: self.list_id.clone(),
            transport: self.transport,
        })
    }
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Submitted; `run_started` not yet acknowledged.
    Starting,
    /// The server acknowledged the run and providers are reporting.
    InProgress,
    /// Every provider reported.
    Completed,
    /// The run ended without completing.
    Failed,
}

/// One run, active or historical. Superseded records are immutable
/// history: only the active run's record ever transitions.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// The run's token.
    pub token: RunToken,
    /// Normalized caller input.
    pub params: CheckParams,
    /// Current lifecycle state.
    pub status: RunStatus,
    /// When the run was requested.
    pub created_at: DateTime<Utc>,
}

/// Mutable controller state, guarded by the controller mutex. Every
/// mutation happens after a token check.
struct ControllerState {
    next_token: u64,
    current: Option<RunToken>,
    session: Option<Arc<Session>>,
    runs: Vec<RunRecord>,
    aggregator: ConsensusAggregator,
    /// Provider display metadata, refreshed from `provider_lists` pushes.
    providers: BTreeMap<String, Provider>,
    /// Whether any run has ever been requested. Connection failures before
    /// the first request are silent non-events.
    has_requested: bool,
}

/// Governs runs against one `DnsCheck` endpoint.
pub struct RunController {
    shared: Arc<Mutex<ControllerState>>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn PresentationSink>,
    url: String,
}

impl RunController {
    /// Create a controller for `url`, delivering observable state to
    /// `sink`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        url: impl Into<String>,
        sink: Arc<dyn PresentationSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(ControllerState {
                next_token: 0,
                current: None,
                session: None,
                runs: Vec::new(),
                aggregator: ConsensusAggregator::new(),
                providers: BTreeMap::new(),
                has_requested: false,
            })),
            connector,
            sink,
            url: url.into(),
        }
    }

    /// Start a run for `params`, superseding any run in flight.
    ///
    /// Returns `Ok(true)` when the check was submitted on a fresh session,
    /// `Ok(false)` when a newer `start` superseded this one while it was
    /// still connecting. In that case nothing was sent and no shared state
    /// was touched on its behalf.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidInput`] — the domain failed validation; nothing
    ///   was allocated.
    /// - [`AppError::Connection`] / [`AppError::ConnectionClosed`] — the
    ///   open attempt failed. The run is not started; the failure has
    ///   already been surfaced through the sink.
    pub async fn start(&self, params: CheckParams) -> Result<bool> {
        let params = params.normalized()?;

        let (token, previous) = {
            let mut st = lock(&self.shared);
            st.next_token += 1;
            let token = RunToken(st.next_token);
            st.current = Some(token);
            st.has_requested = true;
            st.aggregator.reset();
            st.runs.push(RunRecord {
                token,
                params: params.clone(),
                status: RunStatus::Starting,
                created_at: Utc::now(),
            });
            (token, st.session.take())
        };

        if let Some(previous) = previous {
            debug!(token = %token, "superseding previous run");
            previous.close(CLOSE_NORMAL, "starting new run");
        }

        let Some(session) = self.bind_session(token) else {
            return Ok(false);
        };

        let opened = session.ensure_open().await;
        if !self.is_token_current(token) {
            debug!(token = %token, "superseded while connecting");
            return Ok(false);
        }
        opened?;

        let request = ClientRequest::Check {
            domain: params.domain.clone(),
            list_id: params.list_id.clone(),
            transport: params.transport,
        };
        if let Err(err) = session.send(&request) {
            if !self.is_token_current(token) {
                return Ok(false);
            }
            warn!(token = %token, %err, "check submission failed");
            return Err(err);
        }

        info!(token = %token, domain = params.domain, "check submitted");
        Ok(true)
    }

    /// Open a session speculatively, without requesting a run.
    ///
    /// The server pushes the provider catalog on every accept, so a warm
    /// session prefetches display metadata. Failures here are non-events:
    /// nothing reaches the sink, and the next [`RunController::start`]
    /// simply opens a fresh session.
    ///
    /// # Errors
    ///
    /// Returns the open failure for the caller's own diagnostics.
    pub async fn warm_up(&self) -> Result<()> {
        let (token, previous) = {
            let mut st = lock(&self.shared);
            st.next_token += 1;
            let token = RunToken(st.next_token);
            st.current = Some(token);
            (token, st.session.take())
        };

        if let Some(previous) = previous {
            previous.close(CLOSE_NORMAL, "refreshing connection");
        }

        let Some(session) = self.bind_session(token) else {
            return Ok(());
        };

        let opened = session.ensure_open().await;
        if !self.is_token_current(token) {
            return Ok(());
        }
        opened
    }

    /// Close the current session, if any, with a normal code.
    pub fn shutdown(&self) {
        let session = lock(&self.shared).session.take();
        if let Some(session) = session {
            session.close(CLOSE_NORMAL, "client closing");
        }
    }

    /// Provider display metadata accumulated from catalog pushes, keyed by
    /// provider id.
    #[must_use]
    pub fn providers(&self) -> BTreeMap<String, Provider> {
        lock(&self.shared).providers.clone()
    }

    /// Every run requested so far, oldest first.
    #[must_use]
    pub fn runs(&self) -> Vec<RunRecord> {
        lock(&self.shared).runs.clone()
    }

    /// The record of the currently active run, if one exists.
    #[must_use]
    pub fn active_run(&self) -> Option<RunRecord> {
        let st = lock(&self.shared);
        let current = st.current?;
        st.runs.iter().rev().find(|r| r.token == current).cloned()
    }

    /// Create a session bound to `token` and publish it as current, unless
    /// a newer run already took over.
    fn bind_session(&self, token: RunToken) -> Option<Arc<Session>> {
        let listener = Arc::new(RunListener {
            token,
            shared: Arc::clone(&self.shared),
            sink: Arc::clone(&self.sink),
        });
        let session = Arc::new(Session::new(
            Arc::clone(&self.connector),
            self.url.clone(),
            listener,
        ));

        let mut st = lock(&self.shared);
        if st.current == Some(token) {
            st.session = Some(Arc::clone(&session));
            Some(session)
        } else {
            drop(st);
            debug!(token = %token, "superseded before the session was bound");
            session.close(CLOSE_NORMAL, "starting new run");
            None
        }
    }

    fn is_token_current(&self, token: RunToken) -> bool {
        lock(&self.shared).current == Some(token)
    }
}

/// Session listener for one run. Captures the run's token and voids itself
/// at dispatch time whenever the token has gone stale.
struct RunListener {
    token: RunToken,
    shared: Arc<Mutex<ControllerState>>,
    sink: Arc<dyn PresentationSink>,
}

/// What a disconnect asks the listener to do once the lock is released.
enum DisconnectAction {
    Silent {
        session: Option<Arc<Session>>,
        reason: &'static str,
    },
    Surface {
        session: Option<Arc<Session>>,
        failed_now: bool,
    },
}

impl RunListener {
    fn is_current(&self, st: &ControllerState) -> bool {
        st.current == Some(self.token)
    }

    fn is_token_live(&self) -> bool {
        let st = lock(&self.shared);
        self.is_current(&st)
    }

    fn dispatch_run_started(&self, providers: Vec<String>) {
        {
            let mut st = lock(&self.shared);
            if !self.is_current(&st) {
                debug!(token = %self.token, "discarding run_started from superseded run");
                return;
            }
            transition(&mut st, self.token, RunStatus::InProgress);
        }
        info!(token = %self.token, providers = providers.len(), "run started");
        self.sink.on_run_started(&providers);
    }

    fn dispatch_provider_result(&self, result: ProviderResult) {
        let snapshot = {
            let mut st = lock(&self.shared);
            if !self.is_current(&st) {
                debug!(token = %self.token, "discarding provider_result from superseded run");
                return;
            }
            st.aggregator.record(result.clone());
            st.aggregator.snapshot()
        };
        debug!(
            token = %self.token,
            provider = result.provider.id,
            latency_ms = result.latency_ms,
            "provider reported"
        );
        self.sink.on_provider_result(&result, &snapshot);
    }

    fn dispatch_run_complete(&self) {
        let (snapshot, session) = {
            let mut st = lock(&self.shared);
            if !self.is_current(&st) {
                debug!(token = %self.token, "discarding run_complete from superseded run");
                return;
            }
            transition(&mut st, self.token, RunStatus::Completed);
            (st.aggregator.snapshot(), st.session.take())
        };
        info!(token = %self.token, "run complete");
        self.sink.on_run_complete(&snapshot);
        if let Some(session) = session {
            session.close(CLOSE_NORMAL, "run complete");
        }
    }

    fn dispatch_server_error(&self, message: &str) {
        let session = {
            let mut st = lock(&self.shared);
            if !self.is_current(&st) {
                debug!(token = %self.token, "discarding error from superseded run");
                return;
            }
            transition(&mut st, self.token, RunStatus::Failed);
            st.session.take()
        };
        warn!(token = %self.token, message, "server reported an error");
        self.sink.on_failure(message, true);
        if let Some(session) = session {
            session.close(CLOSE_NORMAL, "run error");
        }
    }

    fn on_disconnect(&self, disconnect: &Disconnect) {
        let action = {
            let mut st = lock(&self.shared);
            if !self.is_current(&st) {
                debug!(token = %self.token, "discarding disconnect from superseded run");
                return;
            }
            let session = st.session.take();
            // A run is pending while its record is neither completed nor
            // failed, whether the check is still connecting, submitted, or
            // already streaming results.
            let pending = st
                .runs
                .iter()
                .rev()
                .find(|r| r.token == self.token)
                .is_some_and(|r| {
                    matches!(r.status, RunStatus::Starting | RunStatus::InProgress)
                });
            if !st.has_requested {
                DisconnectAction::Silent {
                    session,
                    reason: "idle connection lost",
                }
            } else if !pending {
                DisconnectAction::Silent {
                    session,
                    reason: "connection closed after run",
                }
            } else {
                let failed_now = transition(&mut st, self.token, RunStatus::Failed);
                DisconnectAction::Surface {
                    session,
                    failed_now,
                }
            }
        };

        match action {
            DisconnectAction::Silent { session, reason } => {
                debug!(token = %self.token, reason, "disconnect discarded quietly");
                if let Some(session) = session {
                    session.close(CLOSE_NORMAL, reason);
                }
            }
            DisconnectAction::Surface {
                session,
                failed_now,
            } => {
                warn!(
                    token = %self.token,
                    was_connected = disconnect.was_connected,
                    detail = disconnect.detail,
                    "run connection failure"
                );
                self.sink.on_connection_status(ChannelState::Closed, true);
                if failed_now {
                    let message = if disconnect.was_connected {
                        MSG_CONNECTION_LOST
                    } else {
                        MSG_COULD_NOT_CONNECT
                    };
                    self.sink.on_failure(message, true);
                }
                if let Some(session) = session {
                    session.close(CLOSE_NORMAL, "run connection failure");
                }
            }
        }
    }
}

impl SessionEvents for RunListener {
    fn on_open(&self) {
        let requested = {
            let st = lock(&self.shared);
            self.is_current(&st) && st.has_requested
        };
        if !requested {
            return;
        }
        debug!(token = %self.token, "channel open");
        self.sink.on_connection_status(ChannelState::Open, false);
    }

    fn on_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::ProviderLists { lists } => {
                let mut st = lock(&self.shared);
                st.providers = lists
                    .values()
                    .flat_map(|list| list.providers.iter().map(|p| (p.id.clone(), p.clone())))
                    .collect();
                debug!(
                    lists = lists.len(),
                    providers = st.providers.len(),
                    "provider catalog refreshed"
                );
            }
            ServerMessage::RunStarted { providers, .. } => self.dispatch_run_started(providers),
            ServerMessage::ProviderResult { result, .. } => self.dispatch_provider_result(result),
            ServerMessage::RunComplete { .. } => self.dispatch_run_complete(),
            ServerMessage::Error { message } => self.dispatch_server_error(&message),
            ServerMessage::Unknown => {
                debug!(token = %self.token, "ignoring unrecognized message type");
            }
        }
    }

    fn on_malformed_message(&self, error: &AppError) {
        if !self.is_token_live() {
            return;
        }
        warn!(token = %self.token, %error, "malformed message from server");
        self.sink.on_failure(MSG_MALFORMED, false);
    }

    fn on_error(&self, disconnect: Disconnect) {
        self.on_disconnect(&disconnect);
    }

    fn on_close(&self, disconnect: Disconnect) {
        self.on_disconnect(&disconnect);
    }
}

/// Transition the record for `token`, enforcing the legal lifecycle.
/// Superseded and already-terminal records are never mutated. Returns
/// whether the transition happened.
fn transition(st: &mut ControllerState, token: RunToken, to: RunStatus) -> bool {
    let Some(record) = st.runs.iter_mut().rev().find(|r| r.token == token) else {
        return false;
    };
    let allowed = matches!(
        (record.status, to),
        (
            RunStatus::Starting,
            RunStatus::InProgress | RunStatus::Completed | RunStatus::Failed
        ) | (RunStatus::InProgress, RunStatus::Completed | RunStatus::Failed)
    );
    if allowed {
        record.status = to;
    }
    allowed
}

/// Lock the controller state, recovering from a poisoned mutex.
fn lock(shared: &Mutex<ControllerState>) -> MutexGuard<'_, ControllerState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
