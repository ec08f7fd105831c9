//! # qplan-core: Query Optimizer Data Model
//!
//! This crate holds everything the query optimizer consumes and produces, without
//! any of the planning algorithms themselves. It is the foundation of the
//! `qplan-optimizer` crate and of any execution layer consuming its plans.
//!
//! ## Module Overview
//!
//! - **`stream`**: Compile-scoped stream ids and the growable `StreamSet` bitset.
//! - **`expr`**: Resolved value and boolean expressions with stream-dependency
//!   introspection and computability checks.
//! - **`query`**: The resolved query representation (`QuerySpec`), sort
//!   specifications and user plan hints.
//! - **`catalog`**: Catalog trait for relation metadata, indexes and cardinalities.
//! - **`stats`**: Cardinality and selectivity estimation constants and formulas.
//! - **`cost`**: Cost model trait and default implementation.
//! - **`plan`**: Physical record-source tree, inversions, sort maps and plan explain.
//! - **`config`**: Optimizer configuration and cooperative cancellation.
//! - **`error`**: The `OptimizerError` type.

pub mod catalog;
pub mod config;
pub mod cost;
pub mod error;
pub mod expr;
pub mod plan;
pub mod query;
pub mod stats;
pub mod stream;

pub use error::{OptimizerError, Result};
