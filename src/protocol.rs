//! Wire message types for the `DnsCheck` WebSocket protocol.
//!
//! One JSON object per transmitted text message. Client → server messages
//! are tagged by an `action` field, server → client messages by a `type`
//! field. Unknown server message types deserialize to
//! [`ServerMessage::Unknown`] so new server features never break older
//! clients; the controller logs and ignores them.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// DNS record categories queried per provider.
///
/// Consensus is computed independently per record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// IPv4 address records.
    A,
    /// IPv6 address records.
    #[serde(rename = "AAAA")]
    Aaaa,
}

impl RecordType {
    /// All record types queried during a run, in display order.
    pub const ALL: [Self; 2] = [Self::A, Self::Aaaa];
}

impl Display for RecordType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::Aaaa => write!(f, "AAAA"),
        }
    }
}

/// How the server's resolvers should reach each nameserver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Let the resolver pick (UDP with TCP fallback).
    #[default]
    Auto,
    /// Force UDP.
    Udp,
    /// Force TCP.
    Tcp,
}

impl Display for TransportMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            other => Err(AppError::InvalidInput(format!(
                "unknown transport mode `{other}` (expected auto, udp, or tcp)"
            ))),
        }
    }
}

/// An upstream DNS provider the server queries on behalf of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    /// Stable provider identifier (e.g. `cloudflare`).
    pub id: String,
    /// Human-readable provider name.
    pub name: String,
    /// Nameserver addresses queried for this provider.
    pub nameservers: Vec<String>,
}

/// A named catalog of providers the server can run a check against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderList {
    /// Stable list identifier (e.g. `global`).
    pub id: String,
    /// Display label.
    pub label: String,
    /// One-line description of the list's focus.
    pub description: String,
    /// Providers queried when this list is selected.
    pub providers: Vec<Provider>,
}

/// Classification of a per-record-type lookup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsErrorKind {
    /// The nameserver answered but had no records of this type.
    NoAnswer,
    /// The domain does not exist.
    Nxdomain,
    /// The domain name itself was rejected.
    DomainError,
    /// The resolver failed (timeout, no usable nameservers, …).
    ResolverError,
    /// A kind this client does not know about.
    #[serde(other)]
    Other,
}

/// A per-record-type lookup failure reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsErrorInfo {
    /// Failure classification.
    #[serde(rename = "type")]
    pub kind: DnsErrorKind,
    /// Human-readable failure description.
    pub message: String,
}

impl DnsErrorInfo {
    /// Whether this failure indicates the resolver itself broke, as opposed
    /// to a well-formed negative answer.
    #[must_use]
    pub fn is_hard(&self) -> bool {
        self.kind == DnsErrorKind::ResolverError
    }
}

/// The currently agreed value set per record type.
pub type ConsensusMap = BTreeMap<RecordType, Vec<String>>;

/// One provider's complete result for a run.
///
/// Produced once per provider per run; immutable after creation. The server
/// sends `null` entries in `errors` for record types that succeeded, so the
/// values are optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResult {
    /// The provider this result belongs to.
    pub provider: Provider,
    /// Record values per record type, in resolver answer order.
    #[serde(default)]
    pub records: BTreeMap<RecordType, Vec<String>>,
    /// Lookup failures per record type; `None` marks a clean lookup.
    #[serde(default)]
    pub errors: BTreeMap<RecordType, Option<DnsErrorInfo>>,
    /// Wall-clock time the provider's lookups took, in milliseconds.
    pub latency_ms: u64,
}

impl ProviderResult {
    /// The failure recorded for `record_type`, if any.
    #[must_use]
    pub fn error_for(&self, record_type: RecordType) -> Option<&DnsErrorInfo> {
        self.errors.get(&record_type).and_then(Option::as_ref)
    }

    /// The values recorded for `record_type` (empty when absent).
    #[must_use]
    pub fn records_for(&self, record_type: RecordType) -> &[String] {
        self.records
            .get(&record_type)
            .map_or(&[], Vec::as_slice)
    }

    /// Whether any record type produced at least one value.
    #[must_use]
    pub fn has_records(&self) -> bool {
        self.records.values().any(|values| !values.is_empty())
    }
}

/// Client → server requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientRequest {
    /// Start a check run for a domain.
    Check {
        /// Domain name to check.
        domain: String,
        /// Provider list to run against; server default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        list_id: Option<String>,
        /// Resolver transport mode; server default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport: Option<TransportMode>,
    },
    /// Request the provider-list catalog.
    Lists,
}

/// Server → client messages.
///
/// The `run_started` and `run_complete` echo fields (`domain`, `list_id`,
/// `transport`, the final per-provider map) are always sent by the server
/// but are not required by this client, so they deserialize with defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The provider-list catalog, pushed on connect and on request.
    ProviderLists {
        /// Available catalogs keyed by list id.
        lists: BTreeMap<String, ProviderList>,
    },
    /// A run was accepted and is underway.
    RunStarted {
        /// Provider ids that will report, in query order.
        providers: Vec<String>,
        /// Echo of the checked domain.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        domain: Option<String>,
        /// Echo of the selected list.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        list_id: Option<String>,
        /// Echo of the resolver transport mode.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport: Option<TransportMode>,
    },
    /// One provider finished its lookups.
    ProviderResult {
        /// The provider's complete result.
        result: ProviderResult,
        /// The server's consensus over results so far.
        #[serde(default)]
        consensus: ConsensusMap,
    },
    /// Every provider has reported; the run is over.
    RunComplete {
        /// The server's final consensus.
        consensus: ConsensusMap,
        /// Echo of the checked domain.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        domain: Option<String>,
        /// Echo of the selected list.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        list_id: Option<String>,
        /// Final results keyed by provider id.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        providers: BTreeMap<String, ProviderResult>,
        /// Echo of the resolver transport mode.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transport: Option<TransportMode>,
    },
    /// The server rejected a request or hit an unexpected failure.
    Error {
        /// Human-readable failure description.
        message: String,
    },
    /// Any message type this client does not recognize.
    ///
    /// Logged and ignored by the dispatcher, never a fatal condition.
    #[serde(other)]
    Unknown,
}
