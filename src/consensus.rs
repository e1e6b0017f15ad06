//! Consensus over per-provider results.
//!
//! The aggregator keeps every [`ProviderResult`] of the active run in
//! arrival order and recomputes the agreed value set per record type from
//! scratch on each insert. Run sizes are bounded by the configured provider
//! count, so recomputation stays cheap and the logic stays obvious.
//!
//! The agreed set per record type is chosen by plurality over exact record
//! sequences, ties broken in favor of the sequence reported first. A single
//! reporting provider provisionally defines the agreed set; providers whose
//! sequence differs from the agreed set are flagged divergent, not
//! excluded.

use std::collections::BTreeSet;

use crate::protocol::{ConsensusMap, ProviderResult, RecordType};

/// Incremental consensus computation for one run.
#[derive(Debug, Default)]
pub struct ConsensusAggregator {
    results: Vec<ProviderResult>,
}

impl ConsensusAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all recorded results, ready for a new run.
    pub fn reset(&mut self) {
        self.results.clear();
    }

    /// Record one provider's result.
    pub fn record(&mut self, result: ProviderResult) {
        self.results.push(result);
    }

    /// Results recorded so far, in arrival order.
    #[must_use]
    pub fn results(&self) -> &[ProviderResult] {
        &self.results
    }

    /// Recompute the agreed value set per record type over every result
    /// seen so far.
    ///
    /// Record types with no contributing sequence are omitted from the
    /// snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConsensusMap {
        let mut snapshot = ConsensusMap::new();

        let categories: BTreeSet<RecordType> = self
            .results
            .iter()
            .flat_map(|result| result.records.keys().copied())
            .collect();

        for category in categories {
            // A sequence contributes when the provider neither errored on
            // this record type nor came back empty.
            let sequences = self.results.iter().filter_map(|result| {
                if result.error_for(category).is_some() {
                    return None;
                }
                let values = result.records_for(category);
                if values.is_empty() {
                    None
                } else {
                    Some(values)
                }
            });

            // Plurality over exact sequences; strict `>` keeps the
            // earliest-reported sequence on ties.
            let mut tally: Vec<(&[String], usize)> = Vec::new();
            for sequence in sequences {
                if let Some(entry) = tally.iter_mut().find(|(seen, _)| *seen == sequence) {
                    entry.1 += 1;
                } else {
                    tally.push((sequence, 1));
                }
            }

            let mut agreed: Option<(&[String], usize)> = None;
            for (sequence, count) in tally {
                match agreed {
                    Some((_, best)) if count <= best => {}
                    _ => agreed = Some((sequence, count)),
                }
            }

            if let Some((sequence, _)) = agreed {
                snapshot.insert(category, sequence.to_vec());
            }
        }

        snapshot
    }
}

/// Whether `result` diverges from the agreed set for `category`.
///
/// Divergence requires both sides non-empty and an order-sensitive
/// mismatch; a provider with no values (or no agreed set to differ from)
/// is not divergent.
#[must_use]
pub fn is_divergent(result: &ProviderResult, category: RecordType, snapshot: &ConsensusMap) -> bool {
    let records = result.records_for(category);
    if records.is_empty() {
        return false;
    }
    let Some(agreed) = snapshot.get(&category) else {
        return false;
    };
    !agreed.is_empty() && records != agreed.as_slice()
}
