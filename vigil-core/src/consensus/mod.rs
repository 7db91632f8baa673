//! Consensus and deduplication of raw findings.
//!
//! Findings from different agents that point at the same file region and the
//! same taxonomy category are merged into one [`ConsensusFinding`] whose score
//! grows with every independent agent that agrees.
//!
//! [`ConsensusFinding`]: crate::types::ConsensusFinding

pub mod cluster;
pub mod engine;
pub mod score;
pub mod taxonomy;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, ScanError},
    types::AgentName,
};

pub use cluster::DisjointSet;
pub use engine::{ConsensusEngine, ConsensusReport};
pub use score::AgentWeights;
pub use taxonomy::{CategoryTaxonomy, TaxonomyRule};

/// Clustering window, reliability weights and taxonomy. None of these have
/// meaningful universal values; deployments are expected to tune them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Maximum gap, in lines, between two findings in the same cluster.
    pub proximity_window: u32,
    /// Weight for agents missing from `agent_weights`.
    pub default_weight: f64,
    /// Per-agent reliability weight in `[0, 1]`.
    pub agent_weights: BTreeMap<AgentName, f64>,
    /// Tie-break order when picking representative text; earlier wins.
    pub agent_priority: Vec<AgentName>,
    /// Maps agent rule identifiers onto shared categories.
    pub taxonomy: Vec<TaxonomyRule>,
    /// Scores at or above this count as high confidence.
    pub high_confidence: f64,
    /// Scores at or above this (and below `high_confidence`) count as medium.
    pub medium_confidence: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            proximity_window: 2,
            default_weight: 1.0,
            agent_weights: BTreeMap::new(),
            agent_priority: Vec::new(),
            taxonomy: Vec::new(),
            high_confidence: 0.8,
            medium_confidence: 0.5,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_unit(self.default_weight) {
            return Err(ScanError::Config(
                "consensus.default_weight must be within [0, 1]".into(),
            ));
        }
        if let Some((agent, _)) =
            self.agent_weights.iter().find(|(_, w)| !in_unit(**w))
        {
            return Err(ScanError::Config(format!(
                "consensus.agent_weights.{agent} must be within [0, 1]"
            )));
        }
        if !in_unit(self.high_confidence)
            || !in_unit(self.medium_confidence)
            || self.medium_confidence > self.high_confidence
        {
            return Err(ScanError::Config(
                "consensus confidence thresholds must satisfy 0 <= medium <= high <= 1"
                    .into(),
            ));
        }
        CategoryTaxonomy::compile(&self.taxonomy).map(|_| ())
    }
}
