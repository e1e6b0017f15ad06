//! Presentation sink capability.
//!
//! The fixed seam between the run controller and whatever renders results.
//! Implementations are purely reactive collaborators (a terminal table, a
//! test recorder); no core logic lives behind this trait.

use crate::protocol::{ConsensusMap, ProviderResult};
use crate::transport::ChannelState;

/// Callbacks the run controller delivers observable run state through.
///
/// All callbacks for one run arrive on that run's channel pump task, in
/// event order. Only the currently active run ever reaches the sink.
pub trait PresentationSink: Send + Sync {
    /// The run's connection changed state. `allow_retry` tells whether a
    /// retryable failure accompanies the change.
    fn on_connection_status(&self, state: ChannelState, allow_retry: bool);

    /// The server accepted the run and will query `provider_ids` in order.
    fn on_run_started(&self, provider_ids: &[String]);

    /// One provider reported, with the consensus snapshot recomputed over
    /// every result seen so far in this run.
    fn on_provider_result(&self, result: &ProviderResult, snapshot: &ConsensusMap);

    /// Every provider reported; `snapshot` is the run's final consensus.
    fn on_run_complete(&self, snapshot: &ConsensusMap);

    /// A user-visible failure. `retryable` tells whether re-running the
    /// same check is offered; retry always starts a fresh run.
    fn on_failure(&self, message: &str, retryable: bool);
}
