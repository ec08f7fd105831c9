//! # Resolved Query Representation
//!
//! The optimizer's input: one `QuerySpec` per query level, already resolved by the
//! statement compiler. Every stream has its compile-scoped id, every column
//! reference names a stream and a field position, and views have been expanded.
//!
//! ## Levels and Streams
//!
//! A `QuerySpec` lists its streams as `StreamNode`s. Base relations, procedures and
//! derived tables each own one stream id. A `StreamNode::Join` embeds a nested join
//! sub-tree: an inner sub-join is flattened into the enclosing level, while a
//! LEFT or FULL sub-join is planned as one unit and joined to its siblings as a
//! river. The stream ids inside a nested join belong to the enclosing level; the
//! ids inside a derived table do not, and its output is exposed through the derived
//! stream's own id (field `i` is the derived query's `select[i]`).
//!
//! RIGHT joins are expected to have been normalised to LEFT joins by swapping the
//! two sides.
//!
//! ## Outer Joins
//!
//! For `JoinKind::Left` and `JoinKind::Full` the query holds exactly two stream
//! nodes, the preserved (outer) side first, and `boolean` is the ON condition.
//! A WHERE clause over an outer join lives in the enclosing level.
//!
//! ## Plan Hints
//!
//! `PlanHint` is the user-written access plan (`PLAN JOIN (A INDEX (A_X), B NATURAL)`).
//! It is bound against the level's streams before planning; anything it names that
//! cannot be honoured fails the compile.

use crate::expr::{BoolExpr, ValueExpr};
use crate::stream::{StreamId, StreamSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the streams of a level are joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
    Full,
}

/// Placement of NULLs in a sort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NullsPlacement {
    /// NULLs first when ascending, last when descending.
    #[default]
    Default,
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortItem {
    pub expr: ValueExpr,
    pub descending: bool,
    pub nulls: NullsPlacement,
}

impl SortItem {
    pub fn asc(expr: ValueExpr) -> Self {
        Self {
            expr,
            descending: false,
            nulls: NullsPlacement::Default,
        }
    }

    pub fn desc(expr: ValueExpr) -> Self {
        Self {
            expr,
            descending: true,
            nulls: NullsPlacement::Default,
        }
    }

    pub fn with_nulls(mut self, nulls: NullsPlacement) -> Self {
        self.nulls = nulls;
        self
    }

    /// Whether NULLs come before every value once placement defaults are resolved.
    pub fn nulls_first(&self) -> bool {
        match self.nulls {
            NullsPlacement::Default => !self.descending,
            NullsPlacement::First => true,
            NullsPlacement::Last => false,
        }
    }
}

/// Ordered list of sort keys (ORDER BY, GROUP BY or the DISTINCT key).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub items: Vec<SortItem>,
}

impl SortSpec {
    pub fn new(items: Vec<SortItem>) -> Self {
        Self { items }
    }

    /// Ascending spec over the given expressions.
    pub fn ascending(exprs: Vec<ValueExpr>) -> Self {
        Self::new(exprs.into_iter().map(SortItem::asc).collect())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn exprs(&self) -> impl Iterator<Item = &ValueExpr> {
        self.items.iter().map(|i| &i.expr)
    }

    pub fn contains_expr(&self, expr: &ValueExpr) -> bool {
        self.items.iter().any(|i| &i.expr == expr)
    }

    pub fn streams(&self) -> StreamSet {
        let mut set = StreamSet::new();
        for item in &self.items {
            item.expr.collect_streams(&mut set);
        }
        set
    }
}

/// One entry of a level's FROM list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamNode {
    /// Base relation (table, virtual or external).
    Relation {
        stream: StreamId,
        relation: String,
        alias: Option<String>,
    },
    /// Selectable stored procedure. `inputs` may reference sibling streams, which
    /// then have to be active before the procedure executes.
    Procedure {
        stream: StreamId,
        procedure: String,
        alias: Option<String>,
        inputs: Vec<ValueExpr>,
    },
    /// Derived table or flattened view with its own query level.
    Derived {
        stream: StreamId,
        alias: Option<String>,
        query: Box<QuerySpec>,
    },
    /// Nested join sub-tree sharing this level's stream namespace.
    Join(Box<QuerySpec>),
}

impl StreamNode {
    pub fn relation(stream: u32, relation: impl Into<String>) -> Self {
        StreamNode::Relation {
            stream: StreamId(stream),
            relation: relation.into(),
            alias: None,
        }
    }

    pub fn aliased(stream: u32, relation: impl Into<String>, alias: impl Into<String>) -> Self {
        StreamNode::Relation {
            stream: StreamId(stream),
            relation: relation.into(),
            alias: Some(alias.into()),
        }
    }

    /// Stream id of a single-stream node.
    pub fn id(&self) -> Option<StreamId> {
        match self {
            StreamNode::Relation { stream, .. }
            | StreamNode::Procedure { stream, .. }
            | StreamNode::Derived { stream, .. } => Some(*stream),
            StreamNode::Join(_) => None,
        }
    }

    /// Name the stream is referred to by in plans: its alias, else the object name.
    pub fn name(&self) -> Option<&str> {
        match self {
            StreamNode::Relation {
                relation, alias, ..
            } => Some(alias.as_deref().unwrap_or(relation)),
            StreamNode::Procedure {
                procedure, alias, ..
            } => Some(alias.as_deref().unwrap_or(procedure)),
            StreamNode::Derived { alias, .. } => alias.as_deref(),
            StreamNode::Join(_) => None,
        }
    }

    /// Stream ids this node contributes to the enclosing level.
    pub fn collect_streams(&self, out: &mut StreamSet) {
        match self {
            StreamNode::Join(spec) => {
                for node in &spec.streams {
                    node.collect_streams(out);
                }
            }
            other => {
                if let Some(id) = other.id() {
                    out.insert(id);
                }
            }
        }
    }
}

/// One query level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub streams: Vec<StreamNode>,
    pub join: JoinKind,
    /// WHERE clause, or the ON condition of an outer join.
    pub boolean: Option<BoolExpr>,
    /// Output list; defines the fields of a derived stream.
    pub select: Vec<ValueExpr>,
    pub sort: Option<SortSpec>,
    pub group: Option<SortSpec>,
    /// DISTINCT key.
    pub distinct: Option<SortSpec>,
    pub first: Option<ValueExpr>,
    pub skip: Option<ValueExpr>,
    pub plan: Option<PlanHint>,
    pub with_lock: bool,
    /// Sub-select that must return at most one row.
    pub singular: bool,
}

impl QuerySpec {
    pub fn inner(streams: Vec<StreamNode>) -> Self {
        Self {
            streams,
            ..Default::default()
        }
    }

    pub fn left_join(outer: StreamNode, inner: StreamNode, on: BoolExpr) -> Self {
        Self {
            streams: vec![outer, inner],
            join: JoinKind::Left,
            boolean: Some(on),
            ..Default::default()
        }
    }

    pub fn full_join(left: StreamNode, right: StreamNode, on: BoolExpr) -> Self {
        Self {
            streams: vec![left, right],
            join: JoinKind::Full,
            boolean: Some(on),
            ..Default::default()
        }
    }

    pub fn with_boolean(mut self, boolean: BoolExpr) -> Self {
        self.boolean = Some(boolean);
        self
    }

    pub fn with_select(mut self, select: Vec<ValueExpr>) -> Self {
        self.select = select;
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_group(mut self, group: SortSpec) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_distinct(mut self, distinct: SortSpec) -> Self {
        self.distinct = Some(distinct);
        self
    }

    pub fn with_first(mut self, first: ValueExpr) -> Self {
        self.first = Some(first);
        self
    }

    pub fn with_skip(mut self, skip: ValueExpr) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_plan(mut self, plan: PlanHint) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Every stream id belonging to this level, including those of nested joins.
    pub fn level_streams(&self) -> StreamSet {
        let mut set = StreamSet::new();
        for node in &self.streams {
            node.collect_streams(&mut set);
        }
        set
    }

    /// Whether anything above the row source itself depends on row order or count.
    pub fn has_row_shaping(&self) -> bool {
        self.singular
            || self.sort.is_some()
            || self.group.is_some()
            || self.distinct.is_some()
            || self.first.is_some()
            || self.skip.is_some()
    }
}

/// Access method requested for one stream in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessHint {
    /// Full scan.
    Natural,
    /// Bitmap retrieval through every named index.
    Index(Vec<String>),
    /// Navigation through `index`, optionally filtered by a bitmap of `indexes`.
    Order { index: String, indexes: Vec<String> },
}

/// User-specified access plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanHint {
    /// Nested-loop join in the listed order.
    Join(Vec<PlanHint>),
    /// Hash join of the listed groups.
    Hash(Vec<PlanHint>),
    /// Sort/merge join of the listed groups.
    Merge(Vec<PlanHint>),
    /// Legacy `SORT (...)` wrapper; the sort itself is decided by the optimizer.
    Sort(Box<PlanHint>),
    Stream { alias: String, access: AccessHint },
}

impl PlanHint {
    pub fn natural(alias: impl Into<String>) -> Self {
        PlanHint::Stream {
            alias: alias.into(),
            access: AccessHint::Natural,
        }
    }

    pub fn index(alias: impl Into<String>, indexes: &[&str]) -> Self {
        PlanHint::Stream {
            alias: alias.into(),
            access: AccessHint::Index(indexes.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn order(alias: impl Into<String>, index: &str) -> Self {
        PlanHint::Stream {
            alias: alias.into(),
            access: AccessHint::Order {
                index: index.to_string(),
                indexes: Vec::new(),
            },
        }
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, name: &str, items: &[PlanHint]) -> fmt::Result {
    write!(f, "{} (", name)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    write!(f, ")")
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[String]) -> fmt::Result {
    write!(f, "{}", items.join(", "))
}

impl fmt::Display for PlanHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanHint::Join(items) => write_group(f, "JOIN", items),
            PlanHint::Hash(items) => write_group(f, "HASH", items),
            PlanHint::Merge(items) => write_group(f, "MERGE", items),
            PlanHint::Sort(inner) => write!(f, "SORT ({})", inner),
            PlanHint::Stream { alias, access } => match access {
                AccessHint::Natural => write!(f, "{} NATURAL", alias),
                AccessHint::Index(names) => {
                    write!(f, "{} INDEX (", alias)?;
                    write_list(f, names)?;
                    write!(f, ")")
                }
                AccessHint::Order { index, indexes } => {
                    write!(f, "{} ORDER {}", alias, index)?;
                    if !indexes.is_empty() {
                        write!(f, " INDEX (")?;
                        write_list(f, indexes)?;
                        write!(f, ")")?;
                    }
                    Ok(())
                }
            },
        }
    }
}
