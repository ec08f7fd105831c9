//! # Optimizer Errors
//!
//! Every failure of a compile is reported through `OptimizerError` and unwinds the
//! compile entirely: there is no partial plan and no retry. The variants fall into
//! four groups:
//!
//! - **Capacity**: `TooManyConjuncts`, `SortRecordTooLarge`.
//! - **Unsatisfiable user plan**: `IndexNotFound`, `IndexNotUsable`, `StreamNotFound`,
//!   `StreamNotInPlan`, `PlanNotSatisfiable`. These always name the offending index
//!   or stream.
//! - **Invalid sort datatype**: `InvalidSortType`.
//! - **Internal consistency** and cancellation: `Internal`, `Cancelled`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizerError {
    /// More conjuncts than the optimizer block can hold.
    #[error("optimizer block exceeded: {count} conjuncts (limit {limit})")]
    TooManyConjuncts { count: usize, limit: usize },

    /// The sort record layout does not fit in the maximum sort record.
    #[error("sort record size of {length} bytes is too big (limit {limit})")]
    SortRecordTooLarge { length: usize, limit: usize },

    /// A plan names an index the relation does not have.
    #[error("index {index} cannot be found for relation {relation}")]
    IndexNotFound { index: String, relation: String },

    /// A plan names an index that cannot be used as specified.
    #[error("index {index} cannot be used in the specified plan for relation {relation}")]
    IndexNotUsable { index: String, relation: String },

    /// A plan names a stream that is not part of the query level.
    #[error("table or alias {name} in the plan is not part of the query")]
    StreamNotFound { name: String },

    /// A stream of the query level is missing from the plan.
    #[error("table or alias {name} is not referenced in the plan")]
    StreamNotInPlan { name: String },

    #[error("invalid plan: {reason}")]
    PlanNotSatisfiable { reason: String },

    /// A sort key resolves to a type without a sort-key encoding.
    #[error("datatype {type_name} is not supported for sorting")]
    InvalidSortType { type_name: String },

    #[error("relation {relation} is not defined")]
    UnknownRelation { relation: String },

    #[error("compilation cancelled")]
    Cancelled,

    #[error("internal optimizer error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OptimizerError>;
