//! # Physical Access Plans
//!
//! The optimizer's output is a tree of record sources: the physical operators the
//! execution layer iterates to produce rows. `RecordSource` is a closed enum so that
//! every consumer (the executor, the explain renderer, tests) handles each operator
//! exhaustively.
//!
//! ## Inversions
//!
//! Index-based retrieval of one stream is described by an `Inversion`: leaves are
//! ranges of a single index (`IndexRange`), combined with `And` (bitmap
//! intersection) and `Or` (bitmap union). A navigational scan walks one index range
//! in key order instead, optionally filtered by a bitmap inversion over other
//! indexes.
//!
//! ## Sort Maps
//!
//! A `Sort` carries a `SortMap` describing the fixed-size sort record: key slots (a
//! one-byte null indicator followed by the value key, per sort item) and the values
//! carried through the sort. When the map carries record keys instead of values,
//! a `Refetch` above the sort re-reads the records.
//!
//! ## Explain
//!
//! Two renderings exist. `Display` produces the legacy one-line plan text
//! (`PLAN SORT (JOIN (A INDEX (A_X), B NATURAL))`); `AccessPlan::explain` produces an
//! indented operator tree with access details.

use crate::cost::Cost;
use crate::expr::{BoolExpr, DataType, FieldRef, ValueExpr};
use crate::query::SortItem;
use crate::stream::{StreamId, StreamSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;

/// Lower or upper end of a range segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeBound {
    pub value: ValueExpr,
    pub inclusive: bool,
}

/// How one key segment is restricted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentMatch {
    /// `=`; a NULL value matches nothing.
    Equal(ValueExpr),
    /// `IS NOT DISTINCT FROM`; NULL matches NULL keys.
    Equivalent(ValueExpr),
    IsNull,
    /// One lookup per list value.
    List(Vec<ValueExpr>),
    Range {
        lower: Option<RangeBound>,
        upper: Option<RangeBound>,
    },
    Starting(ValueExpr),
}

impl SegmentMatch {
    /// Equality-like matches leave the following segments usable.
    pub fn is_equality(&self) -> bool {
        matches!(
            self,
            SegmentMatch::Equal(_) | SegmentMatch::Equivalent(_) | SegmentMatch::IsNull
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentBound {
    /// Field of the indexed relation.
    pub field: u16,
    pub matched: SegmentMatch,
}

/// A range over a single index: a prefix of its segments with bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRange {
    pub index: String,
    pub index_id: u32,
    pub descending: bool,
    pub unique: bool,
    /// Number of segments in the index key.
    pub key_segments: usize,
    /// Bounds of the matched key prefix. Empty means the whole index.
    pub segments: Vec<SegmentBound>,
}

impl IndexRange {
    pub fn equality_prefix(&self) -> usize {
        self.segments
            .iter()
            .take_while(|s| s.matched.is_equality())
            .count()
    }

    fn describe(&self) -> String {
        if self.segments.is_empty() {
            return "Full Scan".to_string();
        }
        let eq = self.equality_prefix();
        if eq == self.key_segments && self.unique {
            return "Unique Scan".to_string();
        }
        let full = if self.segments.len() == self.key_segments {
            "full match".to_string()
        } else {
            format!("partial match: {}/{}", self.segments.len(), self.key_segments)
        };
        match self.segments.last().map(|s| &s.matched) {
            Some(SegmentMatch::List(values)) => format!("List Scan ({}, {} values)", full, values.len()),
            _ => format!("Range Scan ({})", full),
        }
    }
}

/// Index-based retrieval description for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Inversion {
    Index(IndexRange),
    /// Bitmap intersection.
    And(Vec<Inversion>),
    /// Bitmap union.
    Or(Vec<Inversion>),
}

impl Inversion {
    /// Names of the indexes in the order they appear.
    pub fn index_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, out: &mut Vec<String>) {
        match self {
            Inversion::Index(range) => out.push(range.index.clone()),
            Inversion::And(items) | Inversion::Or(items) => {
                for item in items {
                    item.collect_names(out);
                }
            }
        }
    }

    pub fn uses_index(&self, index_id: u32) -> bool {
        match self {
            Inversion::Index(range) => range.index_id == index_id,
            Inversion::And(items) | Inversion::Or(items) => items.iter().any(|i| i.uses_index(index_id)),
        }
    }

    fn explain_into(&self, depth: usize, out: &mut String) {
        match self {
            Inversion::Index(range) => {
                line(out, depth, &format!("Index \"{}\" {}", range.index, range.describe()));
            }
            Inversion::And(items) | Inversion::Or(items) => {
                let name = if matches!(self, Inversion::And(_)) {
                    "Bitmap And"
                } else {
                    "Bitmap Or"
                };
                line(out, depth, name);
                for item in items {
                    item.explain_into(depth + 1, out);
                }
            }
        }
    }
}

/// Kind of a key slot in a sort record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortKeyKind {
    /// One byte ordering NULLs before or after values.
    NullFlag { nulls_first: bool },
    Value { data_type: DataType },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    /// Index of the sort item this key encodes.
    pub item: usize,
    pub kind: SortKeyKind,
    pub offset: usize,
    pub length: usize,
    pub descending: bool,
}

/// A value carried through the sort record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortValue {
    Field(FieldRef),
    /// Non-restorable expression value.
    Expression(ValueExpr),
    /// Record key, used to refetch after sorting.
    DbKey(StreamId),
    /// Transaction that wrote the record, validated on refetch.
    TxnNumber(StreamId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortMapItem {
    pub value: SortValue,
    pub offset: usize,
    /// Bytes including the null flag. Zero when restored from a key.
    pub length: usize,
    /// Key slot the value is restored from instead of being stored.
    pub from_key: Option<usize>,
}

/// Layout of the sort record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortMap {
    /// Sort items in key order.
    pub order: Vec<SortItem>,
    pub keys: Vec<SortKey>,
    pub items: Vec<SortMapItem>,
    pub key_length: usize,
    pub record_length: usize,
    /// Drop records with equal keys (DISTINCT).
    pub unique: bool,
    /// Records are re-read through `DbKey` after sorting.
    pub refetch: bool,
}

/// Semantics of a nested-loop join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    /// Emit a null-extended row when the inner input produces nothing.
    Outer,
    /// Emit only outer rows for which the inner input produces nothing.
    Anti,
}

/// Identification of the stream a leaf scan reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamScan {
    pub stream: StreamId,
    /// Relation or procedure name.
    pub relation: String,
    pub alias: String,
}

impl StreamScan {
    fn label(&self, kind: &str) -> String {
        if self.alias.eq_ignore_ascii_case(&self.relation) {
            format!("{} \"{}\"", kind, self.relation)
        } else {
            format!("{} \"{}\" as \"{}\"", kind, self.relation, self.alias)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HashBuild {
    pub source: RecordSource,
    /// Key expressions, positionally matched with the probe keys.
    pub keys: Vec<ValueExpr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeInput {
    /// Sorted on `keys`.
    pub source: RecordSource,
    pub keys: Vec<ValueExpr>,
}

/// Physical operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordSource {
    FullScan(StreamScan),
    VirtualScan(StreamScan),
    ExternalScan(StreamScan),
    ProcedureScan {
        scan: StreamScan,
        inputs: Vec<ValueExpr>,
    },
    /// Bitmap retrieval: records matching the inversion, in storage order.
    IndexedScan {
        scan: StreamScan,
        inversion: Inversion,
    },
    /// Records in the key order of `range`, optionally pre-filtered by a bitmap.
    NavigationalScan {
        scan: StreamScan,
        range: IndexRange,
        inversion: Option<Inversion>,
    },
    /// Derived table: field `i` of `stream` is `output[i]` evaluated over `source`.
    DerivedScan {
        stream: StreamId,
        alias: String,
        source: Box<RecordSource>,
        output: Vec<ValueExpr>,
    },
    Filter {
        input: Box<RecordSource>,
        condition: BoolExpr,
    },
    /// Inner joins take any number of inputs, outer and anti joins exactly two.
    /// `boolean` is evaluated on the outer row before the inner input is opened;
    /// when false the inner input is skipped as if it produced nothing.
    NestedLoopJoin {
        kind: JoinType,
        inputs: Vec<RecordSource>,
        boolean: Option<BoolExpr>,
    },
    /// Rows of `forward` (an outer join) followed by rows of `reverse` (an anti join).
    FullOuterJoin {
        forward: Box<RecordSource>,
        reverse: Box<RecordSource>,
    },
    /// Streams `probe` and looks up every build input in a hash table.
    HashJoin {
        probe: Box<RecordSource>,
        probe_keys: Vec<ValueExpr>,
        builds: Vec<HashBuild>,
        /// Per key: NULL keys match each other.
        null_matches: Vec<bool>,
    },
    MergeJoin {
        inputs: Vec<MergeInput>,
        null_matches: Vec<bool>,
    },
    Sort {
        input: Box<RecordSource>,
        map: SortMap,
    },
    Refetch {
        input: Box<RecordSource>,
        streams: StreamSet,
    },
    /// Groups consecutive rows with equal `group` values.
    Aggregate {
        input: Box<RecordSource>,
        group: Vec<ValueExpr>,
    },
    Skip {
        input: Box<RecordSource>,
        count: ValueExpr,
    },
    First {
        input: Box<RecordSource>,
        count: ValueExpr,
    },
    Lock {
        input: Box<RecordSource>,
    },
    /// Fails at run time when the input produces more than one row.
    Singular {
        input: Box<RecordSource>,
    },
    /// Materialises its input once and replays it.
    Buffered {
        input: Box<RecordSource>,
    },
}

impl RecordSource {
    pub fn filter(input: RecordSource, conditions: Vec<BoolExpr>) -> RecordSource {
        if conditions.is_empty() {
            return input;
        }
        RecordSource::Filter {
            input: Box::new(input),
            condition: BoolExpr::and(conditions),
        }
    }

    pub fn children(&self) -> Vec<&RecordSource> {
        match self {
            RecordSource::FullScan(_)
            | RecordSource::VirtualScan(_)
            | RecordSource::ExternalScan(_)
            | RecordSource::ProcedureScan { .. }
            | RecordSource::IndexedScan { .. }
            | RecordSource::NavigationalScan { .. } => Vec::new(),
            RecordSource::DerivedScan { source, .. } => vec![source.as_ref()],
            RecordSource::NestedLoopJoin { inputs, .. } => inputs.iter().collect(),
            RecordSource::FullOuterJoin { forward, reverse } => vec![forward.as_ref(), reverse.as_ref()],
            RecordSource::HashJoin { probe, builds, .. } => {
                let mut out = vec![probe.as_ref()];
                out.extend(builds.iter().map(|b| &b.source));
                out
            }
            RecordSource::MergeJoin { inputs, .. } => inputs.iter().map(|i| &i.source).collect(),
            RecordSource::Filter { input, .. }
            | RecordSource::Sort { input, .. }
            | RecordSource::Refetch { input, .. }
            | RecordSource::Aggregate { input, .. }
            | RecordSource::Skip { input, .. }
            | RecordSource::First { input, .. }
            | RecordSource::Lock { input }
            | RecordSource::Singular { input }
            | RecordSource::Buffered { input } => vec![input.as_ref()],
        }
    }

    /// Streams whose records this source produces.
    pub fn streams(&self) -> StreamSet {
        let mut set = StreamSet::new();
        self.collect_streams(&mut set);
        set
    }

    fn collect_streams(&self, out: &mut StreamSet) {
        match self {
            RecordSource::FullScan(scan)
            | RecordSource::VirtualScan(scan)
            | RecordSource::ExternalScan(scan)
            | RecordSource::ProcedureScan { scan, .. }
            | RecordSource::IndexedScan { scan, .. }
            | RecordSource::NavigationalScan { scan, .. } => {
                out.insert(scan.stream);
            }
            RecordSource::DerivedScan { stream, .. } => {
                out.insert(*stream);
            }
            RecordSource::FullOuterJoin { forward, .. } => forward.collect_streams(out),
            other => {
                for child in other.children() {
                    child.collect_streams(out);
                }
            }
        }
    }

    /// The index range whose key order this source's output follows for `stream`,
    /// if row order survives every operator between here and that stream's scan.
    pub fn navigation_of(&self, stream: StreamId) -> Option<&IndexRange> {
        match self {
            RecordSource::NavigationalScan { scan, range, .. } if scan.stream == stream => Some(range),
            RecordSource::Filter { input, .. }
            | RecordSource::Refetch { input, .. }
            | RecordSource::Lock { input }
            | RecordSource::Skip { input, .. }
            | RecordSource::First { input, .. } => input.navigation_of(stream),
            RecordSource::NestedLoopJoin { kind, inputs, .. } if *kind != JoinType::Anti => {
                inputs.first().and_then(|i| i.navigation_of(stream))
            }
            RecordSource::HashJoin { probe, .. } => probe.navigation_of(stream),
            _ => None,
        }
    }

    fn write_legacy(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordSource::FullScan(scan)
            | RecordSource::VirtualScan(scan)
            | RecordSource::ExternalScan(scan)
            | RecordSource::ProcedureScan { scan, .. } => write!(f, "{} NATURAL", scan.alias),
            RecordSource::IndexedScan { scan, inversion } => {
                write!(f, "{} INDEX ({})", scan.alias, inversion.index_names().join(", "))
            }
            RecordSource::NavigationalScan {
                scan,
                range,
                inversion,
            } => {
                write!(f, "{} ORDER {}", scan.alias, range.index)?;
                if let Some(inv) = inversion {
                    write!(f, " INDEX ({})", inv.index_names().join(", "))?;
                }
                Ok(())
            }
            RecordSource::NestedLoopJoin { inputs, .. } => {
                write_group(f, "JOIN", &inputs.iter().collect::<Vec<_>>())
            }
            RecordSource::FullOuterJoin { forward, .. } => forward.write_legacy(f),
            RecordSource::HashJoin { .. } => write_group(f, "HASH", &self.children()),
            RecordSource::MergeJoin { .. } => write_group(f, "MERGE", &self.children()),
            RecordSource::Sort { input, .. } => write_group(f, "SORT", &[input.as_ref()]),
            RecordSource::DerivedScan { source, .. } => source.write_legacy(f),
            RecordSource::Filter { input, .. }
            | RecordSource::Refetch { input, .. }
            | RecordSource::Aggregate { input, .. }
            | RecordSource::Skip { input, .. }
            | RecordSource::First { input, .. }
            | RecordSource::Lock { input }
            | RecordSource::Singular { input }
            | RecordSource::Buffered { input } => input.write_legacy(f),
        }
    }

    fn explain_into(&self, depth: usize, out: &mut String) {
        match self {
            RecordSource::FullScan(scan) => line(out, depth, &format!("{} Full Scan", scan.label("Table"))),
            RecordSource::VirtualScan(scan) => {
                line(out, depth, &format!("{} Full Scan", scan.label("Virtual Table")))
            }
            RecordSource::ExternalScan(scan) => {
                line(out, depth, &format!("{} Full Scan", scan.label("External Table")))
            }
            RecordSource::ProcedureScan { scan, .. } => {
                line(out, depth, &format!("{} Scan", scan.label("Procedure")))
            }
            RecordSource::IndexedScan { scan, inversion } => {
                line(out, depth, &format!("{} Access By ID", scan.label("Table")));
                line(out, depth + 1, "Bitmap");
                inversion.explain_into(depth + 2, out);
            }
            RecordSource::NavigationalScan {
                scan,
                range,
                inversion,
            } => {
                line(out, depth, &format!("{} Access By ID", scan.label("Table")));
                line(
                    out,
                    depth + 1,
                    &format!("Index \"{}\" {} (ordered)", range.index, range.describe()),
                );
                if let Some(inv) = inversion {
                    line(out, depth + 1, "Bitmap");
                    inv.explain_into(depth + 2, out);
                }
            }
            RecordSource::DerivedScan { alias, source, .. } => {
                line(out, depth, &format!("Derived Table \"{}\"", alias));
                source.explain_into(depth + 1, out);
            }
            RecordSource::Filter { input, .. } => {
                line(out, depth, "Filter");
                input.explain_into(depth + 1, out);
            }
            RecordSource::NestedLoopJoin { kind, inputs, .. } => {
                let kind = match kind {
                    JoinType::Inner => "inner",
                    JoinType::Outer => "outer",
                    JoinType::Anti => "anti",
                };
                line(out, depth, &format!("Nested Loop Join ({})", kind));
                for input in inputs {
                    input.explain_into(depth + 1, out);
                }
            }
            RecordSource::FullOuterJoin { forward, reverse } => {
                line(out, depth, "Full Outer Join");
                forward.explain_into(depth + 1, out);
                reverse.explain_into(depth + 1, out);
            }
            RecordSource::HashJoin { probe, builds, .. } => {
                line(out, depth, &format!("Hash Join (inner, {} keys)", self.key_count()));
                probe.explain_into(depth + 1, out);
                for build in builds {
                    line(out, depth + 1, "Record Buffer");
                    build.source.explain_into(depth + 2, out);
                }
            }
            RecordSource::MergeJoin { inputs, .. } => {
                line(out, depth, &format!("Merge Join (inner, {} keys)", self.key_count()));
                for input in inputs {
                    input.source.explain_into(depth + 1, out);
                }
            }
            RecordSource::Sort { input, map } => {
                let name = if map.unique { "Unique Sort" } else { "Sort" };
                let refetch = if map.refetch { ", refetch" } else { "" };
                line(
                    out,
                    depth,
                    &format!(
                        "{} (record length: {}, key length: {}{})",
                        name, map.record_length, map.key_length, refetch
                    ),
                );
                input.explain_into(depth + 1, out);
            }
            RecordSource::Refetch { input, .. } => {
                line(out, depth, "Refetch");
                input.explain_into(depth + 1, out);
            }
            RecordSource::Aggregate { input, .. } => {
                line(out, depth, "Aggregate");
                input.explain_into(depth + 1, out);
            }
            RecordSource::Skip { input, count } => {
                line(out, depth, &format!("Skip {} Records", count));
                input.explain_into(depth + 1, out);
            }
            RecordSource::First { input, count } => {
                line(out, depth, &format!("First {} Records", count));
                input.explain_into(depth + 1, out);
            }
            RecordSource::Lock { input } => {
                line(out, depth, "Write Lock");
                input.explain_into(depth + 1, out);
            }
            RecordSource::Singular { input } => {
                line(out, depth, "Singularity Check");
                input.explain_into(depth + 1, out);
            }
            RecordSource::Buffered { input } => {
                line(out, depth, "Record Buffer");
                input.explain_into(depth + 1, out);
            }
        }
    }

    fn key_count(&self) -> usize {
        match self {
            RecordSource::HashJoin { probe_keys, .. } => probe_keys.len(),
            RecordSource::MergeJoin { inputs, .. } => inputs.first().map_or(0, |i| i.keys.len()),
            _ => 0,
        }
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, name: &str, items: &[&RecordSource]) -> fmt::Result {
    write!(f, "{} (", name)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        item.write_legacy(f)?;
    }
    write!(f, ")")
}

fn line(out: &mut String, depth: usize, text: &str) {
    let _ = writeln!(out, "{}-> {}", "    ".repeat(depth + 1), text);
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PLAN ")?;
        self.write_legacy(f)
    }
}

/// Zone a conjunct came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConjunctOrigin {
    /// Decomposed from this level's own boolean.
    Base,
    /// Inferred from base conjuncts by equality distribution.
    BaseDerived,
    /// Inherited from the enclosing level.
    Parent,
    /// Inferred after merging parent conjuncts.
    ParentDerived,
    /// Inherited but possibly unknown across an outer join; never used for
    /// inference or index matching.
    ParentMissing,
}

/// Where a conjunct ended up in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    /// Consumed by a range of `index` while retrieving `stream`.
    IndexMatch { stream: StreamId, index: String },
    /// Evaluated by a filter once `streams` are active.
    Filter { streams: StreamSet },
    /// Gating boolean of an outer join, evaluated on the preserved row.
    JoinGate,
    HashKey,
    MergeKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConjunctPlacement {
    pub conjunct: BoolExpr,
    pub origin: ConjunctOrigin,
    pub placement: Placement,
    /// A fresh copy evaluated by the reverse pass of a full outer join.
    pub cloned: bool,
}

/// Immutable record of a sort-related rewrite made while planning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanDecision {
    /// ORDER BY folded into GROUP BY, whose key now follows the requested order.
    SortMergedIntoGroup,
    /// ORDER BY folded into DISTINCT, whose key was permuted to the requested order.
    SortMergedIntoDistinct,
    /// DISTINCT over exactly the grouping key.
    DistinctDroppedByGroup,
    SortPushedIntoDerived { stream: StreamId },
    SortSatisfiedByNavigation { stream: StreamId, index: String },
    GroupSatisfiedByNavigation { stream: StreamId, index: String },
}

/// A compiled access plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPlan {
    pub root: RecordSource,
    pub cost: f64,
    pub cardinality: f64,
    pub decisions: Vec<PlanDecision>,
    pub placements: Vec<ConjunctPlacement>,
}

impl AccessPlan {
    pub fn new(root: RecordSource, cost: Cost, cardinality: f64) -> Self {
        Self {
            root,
            cost: cost.total,
            cardinality,
            decisions: Vec::new(),
            placements: Vec::new(),
        }
    }

    /// Indented operator tree.
    pub fn explain(&self) -> String {
        let mut out = String::from("Select Expression\n");
        self.root.explain_into(0, &mut out);
        out
    }
}

impl fmt::Display for AccessPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(stream: u32, name: &str) -> StreamScan {
        StreamScan {
            stream: StreamId(stream),
            relation: name.to_string(),
            alias: name.to_string(),
        }
    }

    fn range(name: &str, id: u32) -> IndexRange {
        IndexRange {
            index: name.to_string(),
            index_id: id,
            descending: false,
            unique: false,
            key_segments: 1,
            segments: vec![SegmentBound {
                field: 0,
                matched: SegmentMatch::Equal(ValueExpr::int(1)),
            }],
        }
    }

    #[test]
    fn test_legacy_plan_text() {
        let join = RecordSource::NestedLoopJoin {
            kind: JoinType::Inner,
            inputs: vec![
                RecordSource::IndexedScan {
                    scan: scan(0, "A"),
                    inversion: Inversion::Index(range("A_X", 1)),
                },
                RecordSource::filter(
                    RecordSource::FullScan(scan(1, "B")),
                    vec![BoolExpr::Constant(true)],
                ),
            ],
            boolean: None,
        };
        let root = RecordSource::Sort {
            input: Box::new(join),
            map: SortMap {
                order: Vec::new(),
                keys: Vec::new(),
                items: Vec::new(),
                key_length: 0,
                record_length: 0,
                unique: false,
                refetch: false,
            },
        };
        assert_eq!(root.to_string(), "PLAN SORT (JOIN (A INDEX (A_X), B NATURAL))");
    }

    #[test]
    fn test_navigation_survives_outer_side_only() {
        let nav = RecordSource::NavigationalScan {
            scan: scan(0, "A"),
            range: range("A_X", 1),
            inversion: None,
        };
        let join = RecordSource::NestedLoopJoin {
            kind: JoinType::Inner,
            inputs: vec![nav, RecordSource::FullScan(scan(1, "B"))],
            boolean: None,
        };
        assert!(join.navigation_of(StreamId(0)).is_some());
        assert!(join.navigation_of(StreamId(1)).is_none());
        assert_eq!(join.streams().len(), 2);
    }

    #[test]
    fn test_explain_tree() {
        let plan = AccessPlan::new(
            RecordSource::IndexedScan {
                scan: scan(0, "A"),
                inversion: Inversion::And(vec![
                    Inversion::Index(range("A_X", 1)),
                    Inversion::Index(range("A_Y", 2)),
                ]),
            },
            Cost::zero(),
            1.0,
        );
        let text = plan.explain();
        assert!(text.starts_with("Select Expression\n"));
        assert!(text.contains("Bitmap And"));
        assert!(text.contains("Index \"A_Y\" Range Scan (full match)"));
    }
}
