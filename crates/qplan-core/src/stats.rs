//! # Statistics and Selectivity Estimation
//!
//! Cardinality and selectivity estimates drive every cost comparison the optimizer
//! makes: which index to pick, which stream goes first in a nested loop, whether a
//! hash join beats a sort/merge.
//!
//! ## Sources
//!
//! - **Relation cardinality** comes from the catalog. When the storage layer has no
//!   estimate, `DEFAULT_CARDINALITY` is assumed; estimates never drop below
//!   `MINIMUM_CARDINALITY`.
//! - **Index selectivity** is `1 / distinct keys`, per full key and optionally per key
//!   prefix. Missing statistics fall back to `DEFAULT_SELECTIVITY` per segment.
//!
//! ## Reduction Factors
//!
//! A predicate that cannot be priced from index statistics reduces the row estimate by
//! a fixed factor depending on its comparison kind:
//!
//! ```text
//! equality   0.1       between   0.0025
//! less       0.05      greater   0.05
//! starting   0.01      other     0.01
//! ```
//!
//! Conjunctions multiply (independence assumption); disjunctions combine as
//! `1 - Π(1 - s)`.
//!
//! ## Join Cardinality
//!
//! An equi-join of inputs with no distinct-value statistics follows the containment
//! formula `|A JOIN B| = |A| * |B| / max(|A|, |B|)`, applied per joined input.

use crate::catalog::{IndexDescriptor, RelationMeta};
use crate::expr::{BoolExpr, CompareOp};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SELECTIVITY: f64 = 0.1;
pub const MAXIMUM_SELECTIVITY: f64 = 1.0;
pub const MINIMUM_CARDINALITY: f64 = 1.0;
/// Assumed row count of relations without an estimate.
pub const DEFAULT_CARDINALITY: f64 = 1000.0;
/// Assumed rows per execution of a selectable procedure.
pub const DEFAULT_PROCEDURE_CARDINALITY: f64 = 1000.0;

pub const REDUCE_SELECTIVITY_FACTOR_EQUALITY: f64 = 0.1;
pub const REDUCE_SELECTIVITY_FACTOR_BETWEEN: f64 = 0.0025;
pub const REDUCE_SELECTIVITY_FACTOR_LESS: f64 = 0.05;
pub const REDUCE_SELECTIVITY_FACTOR_GREATER: f64 = 0.05;
pub const REDUCE_SELECTIVITY_FACTOR_STARTING: f64 = 0.01;
pub const REDUCE_SELECTIVITY_FACTOR_OTHER: f64 = 0.01;

/// Row estimate attached to a planned record source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Rows produced per execution.
    pub cardinality: f64,
    /// Rows read before predicates were applied.
    pub base_cardinality: f64,
}

impl Statistics {
    pub fn new(cardinality: f64) -> Self {
        let cardinality = cardinality.max(MINIMUM_CARDINALITY);
        Self {
            cardinality,
            base_cardinality: cardinality,
        }
    }

    /// Estimate after applying a filter of the given selectivity.
    pub fn filtered(&self, selectivity: f64) -> Statistics {
        Statistics {
            cardinality: (self.cardinality * selectivity).max(MINIMUM_CARDINALITY),
            base_cardinality: self.base_cardinality,
        }
    }
}

/// Row estimate of a relation.
pub fn relation_cardinality(relation: &RelationMeta) -> f64 {
    relation
        .cardinality
        .unwrap_or(DEFAULT_CARDINALITY)
        .max(MINIMUM_CARDINALITY)
}

/// Selectivity of an equality lookup on the first `segments` key segments.
pub fn index_prefix_selectivity(index: &IndexDescriptor, segments: usize, cardinality: f64) -> f64 {
    if segments == 0 {
        return MAXIMUM_SELECTIVITY;
    }
    if segments >= index.segments.len() {
        if index.unique {
            return 1.0 / cardinality.max(MINIMUM_CARDINALITY);
        }
        if let Some(sel) = index.selectivity {
            return sel.clamp(0.0, MAXIMUM_SELECTIVITY);
        }
    }
    if let Some(sel) = index.segment_selectivity.get(segments - 1) {
        return sel.clamp(0.0, MAXIMUM_SELECTIVITY);
    }
    DEFAULT_SELECTIVITY.powi(segments as i32)
}

/// Reduction factor of one comparison operator.
pub fn compare_factor(op: CompareOp) -> f64 {
    match op {
        CompareOp::Eq | CompareOp::Equiv => REDUCE_SELECTIVITY_FACTOR_EQUALITY,
        CompareOp::Between => REDUCE_SELECTIVITY_FACTOR_BETWEEN,
        CompareOp::Lt | CompareOp::Le => REDUCE_SELECTIVITY_FACTOR_LESS,
        CompareOp::Gt | CompareOp::Ge => REDUCE_SELECTIVITY_FACTOR_GREATER,
        CompareOp::Starting => REDUCE_SELECTIVITY_FACTOR_STARTING,
        CompareOp::NotEq => MAXIMUM_SELECTIVITY - REDUCE_SELECTIVITY_FACTOR_EQUALITY,
        CompareOp::Like | CompareOp::Similar | CompareOp::Containing => {
            REDUCE_SELECTIVITY_FACTOR_OTHER
        }
    }
}

/// Estimated fraction of rows a predicate keeps.
pub fn conjunct_selectivity(expr: &BoolExpr) -> f64 {
    match expr {
        BoolExpr::Compare { op, .. } => compare_factor(*op),
        BoolExpr::IsNull(_) => REDUCE_SELECTIVITY_FACTOR_EQUALITY,
        BoolExpr::InList { list, .. } => {
            (REDUCE_SELECTIVITY_FACTOR_EQUALITY * list.len() as f64).min(MAXIMUM_SELECTIVITY)
        }
        BoolExpr::Not(inner) => (MAXIMUM_SELECTIVITY - conjunct_selectivity(inner)).max(REDUCE_SELECTIVITY_FACTOR_OTHER),
        BoolExpr::And(terms) => terms.iter().map(conjunct_selectivity).product(),
        BoolExpr::Or(terms) => {
            let miss: f64 = terms.iter().map(|t| 1.0 - conjunct_selectivity(t)).product();
            1.0 - miss
        }
        BoolExpr::Constant(true) => MAXIMUM_SELECTIVITY,
        BoolExpr::Constant(false) => 0.0,
    }
}

/// Cardinality of an equi-join over the given input cardinalities.
pub fn derive_join_cardinality(inputs: &[f64]) -> f64 {
    let mut iter = inputs.iter().copied();
    let Some(mut rows) = iter.next() else {
        return MINIMUM_CARDINALITY;
    };
    for next in iter {
        let max = rows.max(next).max(MINIMUM_CARDINALITY);
        rows = rows * next / max;
    }
    rows.max(MINIMUM_CARDINALITY)
}
