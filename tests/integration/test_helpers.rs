//! Shared test helpers for session and controller integration tests.
//!
//! Provides a scripted stub transport (channels are opened instantly and
//! driven by the test pushing [`ChannelEvent`]s), a recording presentation
//! sink, a recording session listener, and wire-message builders, so
//! individual test modules can focus on behaviour rather than plumbing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use dnscheck::protocol::{
    ConsensusMap, Provider, ProviderList, ProviderResult, RecordType, ServerMessage,
};
use dnscheck::session::{Disconnect, SessionEvents};
use dnscheck::sink::PresentationSink;
use dnscheck::transport::{ChannelEvent, ChannelHandle, ChannelState, Connector};
use dnscheck::{AppError, Result};

/// How long polling helpers wait before declaring a test hung.
const WAIT_BUDGET: Duration = Duration::from_secs(2);

/// Poll until `condition` holds, panicking with `what` after the budget.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give in-flight pump tasks a moment to (not) act, for negative checks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ── Scripted transport ────────────────────────────────────────────────────────

/// One channel created through [`StubConnector`], driven by the test.
pub struct StubChannel {
    events: mpsc::Sender<ChannelEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl StubChannel {
    /// Complete the opening handshake.
    pub async fn open(&self) {
        self.push_event(ChannelEvent::Opened).await;
    }

    /// Deliver one raw text message.
    pub async fn push_text(&self, text: &str) {
        self.push_event(ChannelEvent::Message(text.to_owned())).await;
    }

    /// Deliver one wire message.
    pub async fn push(&self, message: &ServerMessage) {
        self.push_text(&serde_json::to_string(message).unwrap()).await;
    }

    /// Report a transport error.
    pub async fn error(&self, detail: &str) {
        self.push_event(ChannelEvent::Errored(detail.to_owned())).await;
    }

    /// Report the channel closed.
    pub async fn close(&self, code: u16, reason: &str) {
        self.push_event(ChannelEvent::Closed {
            code,
            reason: reason.to_owned(),
        })
        .await;
    }

    /// Messages the client transmitted on this channel.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// The `(code, reason)` the client requested the close with, if any.
    pub fn close_request(&self) -> Option<(u16, String)> {
        self.closed.lock().unwrap().clone()
    }

    /// Events sent to a detached channel are dropped, mirroring a real
    /// transport talking to no one.
    async fn push_event(&self, event: ChannelEvent) {
        let _ = self.events.send(event).await;
    }
}

struct StubHandle {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl ChannelHandle for StubHandle {
    fn transmit(&self, text: String) -> Result<()> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    fn begin_close(&self, code: u16, reason: String) {
        *self.closed.lock().unwrap() = Some((code, reason));
    }
}

/// Counting stub connector: every open succeeds instantly and hands the
/// test a [`StubChannel`] to script.
#[derive(Default)]
pub struct StubConnector {
    channels: Mutex<Vec<Arc<StubChannel>>>,
    opens: AtomicUsize,
}

impl StubConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of channels opened so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// The `index`-th channel opened (0-based), panicking if absent.
    pub fn channel(&self, index: usize) -> Arc<StubChannel> {
        Arc::clone(&self.channels.lock().unwrap()[index])
    }

    /// Wait until `count` channels have been opened.
    pub async fn wait_for_opens(&self, count: usize) {
        wait_until("channel open attempts", || self.opens() >= count).await;
    }
}

impl Connector for StubConnector {
    fn open(&self, _url: &str, events: mpsc::Sender<ChannelEvent>) -> Result<Box<dyn ChannelHandle>> {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(None));
        let channel = Arc::new(StubChannel {
            events,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        });
        self.channels.lock().unwrap().push(channel);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubHandle { sent, closed }))
    }
}

// ── Recording sink ────────────────────────────────────────────────────────────

/// Everything a controller delivered to the presentation seam.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Status(ChannelState, bool),
    RunStarted(Vec<String>),
    Result {
        result: ProviderResult,
        snapshot: ConsensusMap,
    },
    Complete(ConsensusMap),
    Failure {
        message: String,
        retryable: bool,
    },
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<(String, bool)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Failure { message, retryable } => Some((message, retryable)),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `count` events were recorded.
    pub async fn wait_for(&self, count: usize) {
        wait_until("sink events", || self.events.lock().unwrap().len() >= count).await;
    }

    fn record(&self, event: SinkEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl PresentationSink for RecordingSink {
    fn on_connection_status(&self, state: ChannelState, allow_retry: bool) {
        self.record(SinkEvent::Status(state, allow_retry));
    }

    fn on_run_started(&self, provider_ids: &[String]) {
        self.record(SinkEvent::RunStarted(provider_ids.to_vec()));
    }

    fn on_provider_result(&self, result: &ProviderResult, snapshot: &ConsensusMap) {
        self.record(SinkEvent::Result {
            result: result.clone(),
            snapshot: snapshot.clone(),
        });
    }

    fn on_run_complete(&self, snapshot: &ConsensusMap) {
        self.record(SinkEvent::Complete(snapshot.clone()));
    }

    fn on_failure(&self, message: &str, retryable: bool) {
        self.record(SinkEvent::Failure {
            message: message.to_owned(),
            retryable,
        });
    }
}

// ── Recording session listener ────────────────────────────────────────────────

/// Everything a session delivered to its listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Open,
    Message(ServerMessage),
    Malformed(String),
    Error { was_connected: bool },
    Close { was_connected: bool },
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, count: usize) {
        wait_until("listener events", || {
            self.events.lock().unwrap().len() >= count
        })
        .await;
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl SessionEvents for RecordingListener {
    fn on_open(&self) {
        self.record(ListenerEvent::Open);
    }

    fn on_message(&self, message: ServerMessage) {
        self.record(ListenerEvent::Message(message));
    }

    fn on_malformed_message(&self, error: &AppError) {
        self.record(ListenerEvent::Malformed(error.to_string()));
    }

    fn on_error(&self, disconnect: Disconnect) {
        self.record(ListenerEvent::Error {
            was_connected: disconnect.was_connected,
        });
    }

    fn on_close(&self, disconnect: Disconnect) {
        self.record(ListenerEvent::Close {
            was_connected: disconnect.was_connected,
        });
    }
}

// ── Wire-message builders ─────────────────────────────────────────────────────

pub fn provider(id: &str) -> Provider {
    Provider {
        id: id.to_owned(),
        name: format!("{id} DNS"),
        nameservers: vec!["192.0.2.1".into()],
    }
}

pub fn provider_list(id: &str, providers: &[&str]) -> ProviderList {
    ProviderList {
        id: id.to_owned(),
        label: format!("{id} providers"),
        description: "test catalog".into(),
        providers: providers.iter().map(|p| provider(p)).collect(),
    }
}

pub fn provider_lists_message(list_id: &str, providers: &[&str]) -> ServerMessage {
    ServerMessage::ProviderLists {
        lists: BTreeMap::from([(list_id.to_owned(), provider_list(list_id, providers))]),
    }
}

pub fn run_started_message(providers: &[&str]) -> ServerMessage {
    ServerMessage::RunStarted {
        providers: providers.iter().map(|p| (*p).to_owned()).collect(),
        domain: None,
        list_id: None,
        transport: None,
    }
}

pub fn a_result(provider_id: &str, addresses: &[&str]) -> ProviderResult {
    ProviderResult {
        provider: provider(provider_id),
        records: BTreeMap::from([(
            RecordType::A,
            addresses.iter().map(|a| (*a).to_owned()).collect(),
        )]),
        errors: BTreeMap::new(),
        latency_ms: 12,
    }
}

pub fn provider_result_message(provider_id: &str, addresses: &[&str]) -> ServerMessage {
    ServerMessage::ProviderResult {
        result: a_result(provider_id, addresses),
        consensus: ConsensusMap::new(),
    }
}

pub fn run_complete_message() -> ServerMessage {
    ServerMessage::RunComplete {
        consensus: ConsensusMap::new(),
        domain: None,
        list_id: None,
        providers: BTreeMap::new(),
        transport: None,
    }
}
