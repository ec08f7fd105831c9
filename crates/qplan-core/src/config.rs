//! Optimizer configuration and cooperative cancellation.

use crate::cost::CostWeights;
use crate::error::{OptimizerError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Configuration knobs for one optimizer instance.
///
/// These limits keep pathological statements from exhausting memory: the conjunct
/// ceiling bounds predicate inference and the sort-record ceiling bounds the width
/// of sort buffers. Both are reported as errors, never truncated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Ceiling on decomposed conjuncts per query level. Including inferred
    /// conjuncts, a level never holds more than twice this number.
    pub max_conjuncts: usize,
    /// Largest sort record in bytes.
    pub max_sort_record: usize,
    /// Carried non-key bytes above which a sort carries record keys and refetches.
    pub refetch_threshold: usize,
    /// Join components with more streams than this are ordered greedily.
    pub max_exhaustive_join_streams: usize,
    pub hash_join_enabled: bool,
    pub merge_join_enabled: bool,
    /// Take navigational access whenever an index can deliver the requested order.
    pub prefer_navigation: bool,
    pub cost: CostWeights,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_conjuncts: 1024,
            max_sort_record: 65535,
            refetch_threshold: 512,
            max_exhaustive_join_streams: 7,
            hash_join_enabled: true,
            merge_join_enabled: true,
            prefer_navigation: true,
            cost: CostWeights::default(),
        }
    }
}

impl OptimizerConfig {
    /// Parse a configuration from JSON; missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| OptimizerError::Internal(format!("invalid optimizer config: {}", e)))
    }
}

/// Shared flag through which a statement's compile can be cancelled from another
/// thread. The optimizer polls it between planning phases and inside join search.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(OptimizerError::Cancelled)
        } else {
            Ok(())
        }
    }
}
