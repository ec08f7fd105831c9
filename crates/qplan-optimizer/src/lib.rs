//! # qplan-optimizer: Access-Path Optimizer
//!
//! This crate turns a resolved query (`qplan_core::query::QuerySpec`) into a tree
//! of physical record sources. It is entered through [`Optimizer::compile`].
//!
//! ## Module Overview
//!
//! - **`conjunct`**: The per-level conjunct set, with zones, USED/MATCHED
//!   bookkeeping and the placement of every consumed conjunct.
//! - **`decompose`**: Flattens a boolean into conjuncts, splitting `BETWEEN`,
//!   deriving `STARTING WITH` from `LIKE` prefixes and factoring `OR`s.
//! - **`distribute`**: Infers conjuncts from equality classes.
//! - **`context`**: The compile-scoped `Planner` and per-stream state.
//! - **`retrieval`**: Index matching, inversions and navigation for one stream.
//! - **`inner_join`**: Connected components and join-order search.
//! - **`river`**: Filters over rivers, hash / merge equi-joins and cross joins.
//! - **`outer_join`**: LEFT and FULL join plans.
//! - **`sort`**: Sort elimination and sort-record layout.
//! - **`hint`**: Binding of user plan hints.
//! - **`optimizer`**: The compile driver.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use qplan_core::catalog::{FieldMeta, InMemoryCatalog, RelationMeta};
//! use qplan_core::config::OptimizerConfig;
//! use qplan_core::expr::DataType;
//! use qplan_core::query::{QuerySpec, StreamNode};
//! use qplan_optimizer::Optimizer;
//!
//! let mut catalog = InMemoryCatalog::new();
//! catalog.add_relation(RelationMeta::table(
//!     "T",
//!     vec![FieldMeta { name: "ID".into(), data_type: DataType::Int64 }],
//! ));
//! let optimizer = Optimizer::new(Arc::new(catalog), OptimizerConfig::default());
//! let plan = optimizer.compile(&QuerySpec::inner(vec![StreamNode::relation(0, "T")])).unwrap();
//! assert_eq!(plan.to_string(), "PLAN T NATURAL");
//! ```

pub mod conjunct;
pub mod context;
pub mod decompose;
pub mod distribute;
pub mod hint;
pub mod inner_join;
pub mod optimizer;
pub mod outer_join;
pub mod retrieval;
pub mod river;
pub mod sort;

pub use optimizer::Optimizer;
