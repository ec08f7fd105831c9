//! # Cost Model
//!
//! This module defines the cost abstraction and a default cost model for the optimizer.
//!
//! ## Single-Node Cost Model
//!
//! Everything the optimizer compares is priced in one currency: the estimated number
//! of record and index-key visits, scaled by per-operation weights. The
//! `DefaultCostModel` prices each access method and join algorithm as:
//!
//! ```text
//! full scan        rows * record_read
//! index retrieval  indexes * index_descent + rows * sel * (index_key + record_read)
//! navigation       index_descent + rows * sel * (index_key + record_read * navigation_factor)
//! sort             rows * log2(rows) * sort_compare
//! hash join        sum(build rows) * hash_build + probe rows * hash_probe
//! merge join       sum(input rows) * merge_row
//! ```
//!
//! Navigation reads records in key order rather than storage order, which is why
//! its record reads carry an extra factor.
//!
//! ## Cost Accumulation
//!
//! Costs are **additive**. A nested loop multiplies the per-execution cost of its
//! inner input by the rows of everything placed before it, then adds the outer cost.
//!
//! ## Pluggable Design
//!
//! The `CostModel` trait allows replacing the default model, e.g. with weights
//! calibrated against a particular storage engine.

use serde::{Deserialize, Serialize};

/// Cost is a single comparable value representing the estimated expense of a plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cost {
    /// The total weighted cost. Lower is better. `f64::MAX` represents infinity
    /// (an infeasible or not-yet-costed plan).
    pub total: f64,
}

impl Cost {
    pub fn zero() -> Self {
        Self { total: 0.0 }
    }

    pub fn new(total: f64) -> Self {
        Self { total }
    }

    pub fn infinite() -> Self {
        Self { total: f64::MAX }
    }

    pub fn is_infinite(&self) -> bool {
        self.total == f64::MAX
    }

    pub fn add(self, other: Cost) -> Cost {
        if self.is_infinite() || other.is_infinite() {
            return Cost::infinite();
        }
        Cost::new(self.total + other.total)
    }
}

/// Epsilon-based equality to handle floating-point imprecision in cost comparisons.
impl PartialEq for Cost {
    fn eq(&self, other: &Self) -> bool {
        (self.total - other.total).abs() < f64::EPSILON
    }
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.total.partial_cmp(&other.total)
    }
}

/// Weights of the default cost model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostWeights {
    pub record_read: f64,
    pub index_key: f64,
    pub index_descent: f64,
    pub navigation_factor: f64,
    pub sort_compare: f64,
    pub hash_build: f64,
    pub hash_probe: f64,
    pub merge_row: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            record_read: 1.0,
            index_key: 0.5,
            index_descent: 4.0,
            navigation_factor: 1.5,
            sort_compare: 0.05,
            hash_build: 1.5,
            hash_probe: 0.5,
            merge_row: 0.5,
        }
    }
}

/// Trait for pluggable cost models.
pub trait CostModel: Send + Sync {
    fn full_scan(&self, cardinality: f64) -> Cost;

    /// Bitmap retrieval through `indexes` index ranges with the combined selectivity.
    fn index_retrieval(&self, cardinality: f64, selectivity: f64, indexes: usize) -> Cost;

    /// Ordered walk of one index range.
    fn navigation(&self, cardinality: f64, selectivity: f64) -> Cost;

    fn sort(&self, rows: f64) -> Cost;

    fn hash_join(&self, build_rows: &[f64], probe_rows: f64) -> Cost;

    /// Merge phase only; the sorts feeding it are priced separately.
    fn merge_join(&self, input_rows: &[f64]) -> Cost;

    /// Inner input executed once per outer row.
    fn nested_loop(&self, outer_rows: f64, outer_cost: Cost, inner_cost: Cost) -> Cost {
        outer_cost.add(Cost::new(outer_rows.max(1.0) * inner_cost.total))
    }
}

/// Default cost model, weighted by `CostWeights`.
#[derive(Debug, Clone, Default)]
pub struct DefaultCostModel {
    pub weights: CostWeights,
}

impl DefaultCostModel {
    pub fn new(weights: CostWeights) -> Self {
        Self { weights }
    }
}

impl CostModel for DefaultCostModel {
    fn full_scan(&self, cardinality: f64) -> Cost {
        Cost::new(cardinality * self.weights.record_read)
    }

    fn index_retrieval(&self, cardinality: f64, selectivity: f64, indexes: usize) -> Cost {
        let rows = cardinality * selectivity;
        Cost::new(
            indexes as f64 * self.weights.index_descent
                + rows * (self.weights.index_key * indexes as f64 + self.weights.record_read),
        )
    }

    fn navigation(&self, cardinality: f64, selectivity: f64) -> Cost {
        let rows = cardinality * selectivity;
        Cost::new(
            self.weights.index_descent
                + rows
                    * (self.weights.index_key
                        + self.weights.record_read * self.weights.navigation_factor),
        )
    }

    fn sort(&self, rows: f64) -> Cost {
        let n_log_n = if rows > 1.0 { rows * rows.log2() } else { 1.0 };
        Cost::new(rows * self.weights.record_read * 0.1 + n_log_n * self.weights.sort_compare)
    }

    fn hash_join(&self, build_rows: &[f64], probe_rows: f64) -> Cost {
        let build: f64 = build_rows.iter().sum();
        Cost::new(build * self.weights.hash_build + probe_rows * self.weights.hash_probe)
    }

    fn merge_join(&self, input_rows: &[f64]) -> Cost {
        Cost::new(input_rows.iter().sum::<f64>() * self.weights.merge_row)
    }
}
