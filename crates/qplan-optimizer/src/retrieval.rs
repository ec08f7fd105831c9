//! # Retrieval Planning
//!
//! Chooses how one stream is read, given the streams already active before it
//! and the unused conjuncts of its level.
//!
//! ## Index Matching
//!
//! An index matches a prefix of its key segments. For each segment, in key
//! order, the conjuncts bound on that field are examined:
//!
//! - `=`, `IS NOT DISTINCT FROM` and `IS NULL` fix the segment and matching
//!   continues with the next one;
//! - `IN (...)` turns the segment into a list of lookups and ends the prefix;
//! - `<`, `<=`, `>`, `>=` (a lower and an upper bound may come from different
//!   conjuncts) or `STARTING WITH` on text make the segment a range and end the
//!   prefix.
//!
//! The value side must be computable from the active streams and must not read
//! the stream itself. When the value's type family differs from the field's the
//! conjunct still narrows the range but is re-checked by the filter above the
//! scan.
//!
//! An `OR` conjunct becomes a union of index ranges when every branch matches an
//! index; it is consumed only when every branch is matched exactly and
//! completely.
//!
//! ## Combination
//!
//! Candidates are ranked by estimated cost, then by fewer matched segments, then
//! by lower index id. The best one is taken, and further candidates are
//! intersected with it while that lowers the estimate. The whole inversion is
//! dropped in favour of a full scan when the scan is cheaper.
//!
//! ## Navigation
//!
//! When a sort is requested, an index whose key order yields that sort (after
//! skipping segments fixed by equalities) may be walked in order. An ascending
//! index delivers `ASC NULLS FIRST`, a descending one `DESC NULLS LAST`. The
//! navigation index is never part of the bitmap intersected with it.
//!
//! ## Plan Hints
//!
//! `NATURAL` forbids index use, `INDEX (...)` forces exactly the named indexes
//! and `ORDER idx` forces navigation. A named index the relation lacks, or one
//! that matches nothing it would need to, fails the compile.

use crate::conjunct::ConjunctSet;
use crate::context::{Planner, StreamInfo};
use crate::decompose::conjuncts_of;
use qplan_core::catalog::{IndexDescriptor, RelationMeta};
use qplan_core::cost::Cost;
use qplan_core::error::{OptimizerError, Result};
use qplan_core::expr::{BoolExpr, CompareOp, DataType, FieldRef, ValueExpr};
use qplan_core::plan::{
    ConjunctOrigin, IndexRange, Inversion, Placement, RangeBound, RecordSource, SegmentBound,
    SegmentMatch,
};
use qplan_core::query::{AccessHint, SortSpec};
use qplan_core::stats::{
    conjunct_selectivity, index_prefix_selectivity, MINIMUM_CARDINALITY,
    REDUCE_SELECTIVITY_FACTOR_BETWEEN, REDUCE_SELECTIVITY_FACTOR_GREATER,
    REDUCE_SELECTIVITY_FACTOR_LESS, REDUCE_SELECTIVITY_FACTOR_STARTING,
};
use qplan_core::stream::{StreamId, StreamSet};
use std::cmp::Ordering;
use tracing::trace;

/// What the caller wants planned.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'r> {
    pub stream: StreamId,
    /// Level streams already producing rows when this one is read.
    pub active: &'r StreamSet,
    pub level: &'r StreamSet,
    /// Conjunct zones the stream may consume.
    pub zones: &'r [ConjunctOrigin],
    /// Order the caller would like the rows in.
    pub order: Option<&'r SortSpec>,
}

/// Chosen access path for one stream.
#[derive(Debug, Clone)]
pub struct StreamAccess {
    pub stream: StreamId,
    pub source: RecordSource,
    /// Cost of one execution.
    pub cost: Cost,
    /// Rows produced by one execution.
    pub cardinality: f64,
    /// Conjuncts consumed by index ranges, with the index consuming each.
    pub matched: Vec<(usize, String)>,
    /// Conjuncts evaluated by the filter above the scan.
    pub filtered: Vec<usize>,
    /// Navigation index, when the requested order is delivered.
    pub navigation: Option<String>,
    /// Level streams the index lookups read values from.
    pub lookup_dependencies: StreamSet,
}

impl StreamAccess {
    /// Mark the conjuncts this access consumes.
    pub fn apply(&self, conjuncts: &mut ConjunctSet, active: &StreamSet) -> Result<()> {
        for (i, index) in &self.matched {
            conjuncts.consume(
                *i,
                Placement::IndexMatch {
                    stream: self.stream,
                    index: index.clone(),
                },
            )?;
        }
        let mut streams = active.clone();
        streams.insert(self.stream);
        for i in &self.filtered {
            conjuncts.consume(
                *i,
                Placement::Filter {
                    streams: streams.clone(),
                },
            )?;
        }
        Ok(())
    }
}

/// Plan the access to `request.stream`. Nothing is consumed until `apply`.
pub fn plan_stream(
    planner: &Planner<'_>,
    conjuncts: &ConjunctSet,
    request: &AccessRequest<'_>,
) -> Result<StreamAccess> {
    let info = planner.stream(request.stream)?;
    if info.dependencies().intersects(&request.level.difference(request.active)) {
        return Err(OptimizerError::Internal(format!(
            "stream {} planned before its input streams",
            info.alias
        )));
    }

    let mut with_self = request.active.clone();
    with_self.insert(request.stream);
    let eligible: Vec<Pred<'_>> = conjuncts
        .unused()
        .filter(|(_, c)| {
            c.is_distributable()
                && request.zones.contains(&c.origin)
                && c.streams.contains(request.stream)
                && c.expr.computable(&with_self, request.level)
        })
        .map(|(id, c)| Pred { id, expr: &c.expr })
        .collect();

    let matcher = Matcher {
        planner,
        stream: request.stream,
        active: request.active,
        level: request.level,
        cardinality: info.cardinality,
    };
    let relation = info.relation().filter(|_| info.is_table());
    let choice = match (relation, &info.access) {
        (_, Some(AccessHint::Natural)) | (None, None) => matcher.full_scan(),
        (Some(rel), None) => matcher.best(rel, &eligible, request.order),
        (Some(rel), Some(AccessHint::Index(names))) => matcher.hinted_bitmap(rel, names, &eligible)?,
        (Some(rel), Some(AccessHint::Order { index, indexes })) => {
            matcher.hinted_navigation(rel, index, indexes, &eligible, request.order)?
        }
        (None, Some(AccessHint::Index(names))) => {
            return Err(OptimizerError::IndexNotFound {
                index: names.first().cloned().unwrap_or_default(),
                relation: info.object_name().to_string(),
            })
        }
        (None, Some(AccessHint::Order { index, .. })) => {
            return Err(OptimizerError::IndexNotFound {
                index: index.clone(),
                relation: info.object_name().to_string(),
            })
        }
    };
    build_access(info, &eligible, choice)
}

fn build_access(info: &StreamInfo, eligible: &[Pred<'_>], choice: Choice) -> Result<StreamAccess> {
    let Choice {
        bitmap,
        navigation,
        cost,
    } = choice;
    let mut matched: Vec<(usize, String)> = Vec::new();
    let mut narrowed: Vec<usize> = Vec::new();
    let mut selectivity = 1.0;
    let mut lookup_dependencies = StreamSet::new();
    for candidate in navigation
        .as_ref()
        .and_then(|n| n.base.as_ref())
        .into_iter()
        .chain(bitmap.as_ref())
    {
        for (id, index) in &candidate.consumed {
            if !matched.iter().any(|(m, _)| m == id) {
                matched.push((*id, index.clone()));
            }
        }
        narrowed.extend(candidate.narrowed.iter().copied());
        selectivity *= candidate.selectivity;
        lookup_dependencies.union_with(&candidate.dependencies);
    }

    let filtered: Vec<usize> = eligible
        .iter()
        .map(|p| p.id)
        .filter(|id| !matched.iter().any(|(m, _)| m == id))
        .collect();
    let filter_selectivity: f64 = eligible
        .iter()
        .filter(|p| filtered.contains(&p.id) && !narrowed.contains(&p.id))
        .map(|p| conjunct_selectivity(p.expr))
        .product();

    let scan = info.scan();
    let navigated = navigation.as_ref().map(|n| n.range.index.clone());
    let source = match (navigation, bitmap) {
        (Some(nav), bitmap) => RecordSource::NavigationalScan {
            scan,
            range: nav.range,
            inversion: bitmap.map(|b| b.inversion),
        },
        (None, Some(bitmap)) => RecordSource::IndexedScan {
            scan,
            inversion: bitmap.inversion,
        },
        (None, None) => info.full_scan()?,
    };
    let conditions = eligible
        .iter()
        .filter(|p| filtered.contains(&p.id))
        .map(|p| p.expr.clone())
        .collect();

    trace!(
        stream = %info.alias,
        cost = cost.total,
        matched = matched.len(),
        filtered = filtered.len(),
        "access for {}: {}",
        info.alias,
        source
    );
    Ok(StreamAccess {
        stream: info.id,
        source: RecordSource::filter(source, conditions),
        cost,
        cardinality: (info.cardinality * selectivity * filter_selectivity).max(MINIMUM_CARDINALITY),
        matched,
        filtered,
        navigation: navigated,
        lookup_dependencies,
    })
}

#[derive(Debug, Clone, Copy)]
struct Pred<'e> {
    id: usize,
    expr: &'e BoolExpr,
}

/// Restriction a conjunct puts on one key segment.
#[derive(Debug, Clone, Copy)]
enum KeyPred<'e> {
    Equal(&'e ValueExpr),
    Equivalent(&'e ValueExpr),
    IsNull,
    List(&'e [ValueExpr]),
    Lower(&'e ValueExpr, bool),
    Upper(&'e ValueExpr, bool),
    Starting(&'e ValueExpr),
}

impl<'e> KeyPred<'e> {
    fn is_equality(&self) -> bool {
        matches!(self, KeyPred::Equal(_) | KeyPred::Equivalent(_) | KeyPred::IsNull)
    }

    fn rank(&self) -> u8 {
        match self {
            KeyPred::Equal(_) => 0,
            KeyPred::Equivalent(_) => 1,
            KeyPred::IsNull => 2,
            _ => 3,
        }
    }

    fn value(&self) -> Option<&'e ValueExpr> {
        match *self {
            KeyPred::Equal(v)
            | KeyPred::Equivalent(v)
            | KeyPred::Lower(v, _)
            | KeyPred::Upper(v, _)
            | KeyPred::Starting(v) => Some(v),
            KeyPred::IsNull | KeyPred::List(_) => None,
        }
    }
}

struct Found<'e> {
    id: usize,
    pred: KeyPred<'e>,
    exact: bool,
}

/// Index matching result: a single range, or several combined.
#[derive(Debug, Clone)]
struct IndexCandidate {
    inversion: Inversion,
    index_id: u32,
    segments: usize,
    leaves: usize,
    selectivity: f64,
    /// Conjuncts the ranges fully enforce.
    consumed: Vec<(usize, String)>,
    /// Every conjunct that narrowed a range, enforced or not.
    narrowed: Vec<usize>,
    dependencies: StreamSet,
}

impl IndexCandidate {
    fn intersect(self, other: IndexCandidate) -> IndexCandidate {
        let mut items = match self.inversion {
            Inversion::And(items) => items,
            single => vec![single],
        };
        items.push(other.inversion);
        let mut consumed = self.consumed;
        consumed.extend(other.consumed);
        let mut narrowed = self.narrowed;
        narrowed.extend(other.narrowed);
        IndexCandidate {
            inversion: Inversion::And(items),
            index_id: self.index_id.min(other.index_id),
            segments: self.segments + other.segments,
            leaves: self.leaves + other.leaves,
            selectivity: self.selectivity * other.selectivity,
            consumed,
            narrowed,
            dependencies: self.dependencies.union(&other.dependencies),
        }
    }
}

fn range_bound(found: Option<&Found<'_>>) -> Option<RangeBound> {
    match found?.pred {
        KeyPred::Lower(value, inclusive) | KeyPred::Upper(value, inclusive) => Some(RangeBound {
            value: value.clone(),
            inclusive,
        }),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct NavCandidate {
    range: IndexRange,
    /// Match providing the range bounds, if any.
    base: Option<IndexCandidate>,
    index_id: u32,
}

struct Choice {
    bitmap: Option<IndexCandidate>,
    navigation: Option<NavCandidate>,
    cost: Cost,
}

struct Matcher<'m, 'a> {
    planner: &'m Planner<'a>,
    stream: StreamId,
    active: &'m StreamSet,
    level: &'m StreamSet,
    cardinality: f64,
}

impl Matcher<'_, '_> {
    fn full_scan(&self) -> Choice {
        Choice {
            bitmap: None,
            navigation: None,
            cost: self.planner.cost_model.full_scan(self.cardinality),
        }
    }

    fn bitmap_cost(&self, candidate: &IndexCandidate) -> Cost {
        self.planner
            .cost_model
            .index_retrieval(self.cardinality, candidate.selectivity, candidate.leaves)
    }

    fn navigation_cost(&self, nav: &NavCandidate, bitmap: Option<&IndexCandidate>) -> Cost {
        let range = nav.base.as_ref().map_or(1.0, |b| b.selectivity);
        match bitmap {
            Some(b) => self
                .planner
                .cost_model
                .navigation(self.cardinality, range * b.selectivity)
                .add(self.planner.cost_model.index_retrieval(self.cardinality, 0.0, b.leaves)),
            None => self.planner.cost_model.navigation(self.cardinality, range),
        }
    }

    fn compare(&self, a: &IndexCandidate, b: &IndexCandidate) -> Ordering {
        self.bitmap_cost(a)
            .total
            .total_cmp(&self.bitmap_cost(b).total)
            .then(a.segments.cmp(&b.segments))
            .then(a.index_id.cmp(&b.index_id))
    }

    /// Value usable as a lookup key at this point of the join.
    fn bindable(&self, value: &ValueExpr) -> bool {
        !value.contains_stream(self.stream)
            && value.computable(self.active, self.level)
            && !value.is_volatile()
    }

    fn exact(&self, field: &FieldRef, value: &ValueExpr) -> bool {
        match (self.planner.field_type(field), self.planner.expr_type(value)) {
            (Some(a), Some(b)) => a.family() == b.family(),
            _ => true,
        }
    }

    fn key_pred<'e>(&self, expr: &'e BoolExpr, field: &FieldRef) -> Option<(KeyPred<'e>, bool)> {
        match expr {
            BoolExpr::Compare {
                op,
                left,
                right,
                extra: None,
            } => {
                let (op, value) = if left.as_field() == Some(field) {
                    (*op, right)
                } else if right.as_field() == Some(field) {
                    (op.commute()?, left)
                } else {
                    return None;
                };
                if !self.bindable(value) {
                    return None;
                }
                let pred = match op {
                    CompareOp::Eq => KeyPred::Equal(value),
                    CompareOp::Equiv => KeyPred::Equivalent(value),
                    CompareOp::Lt => KeyPred::Upper(value, false),
                    CompareOp::Le => KeyPred::Upper(value, true),
                    CompareOp::Gt => KeyPred::Lower(value, false),
                    CompareOp::Ge => KeyPred::Lower(value, true),
                    CompareOp::Starting => match self.planner.field_type(field) {
                        Some(DataType::Text { .. }) => KeyPred::Starting(value),
                        _ => return None,
                    },
                    _ => return None,
                };
                Some((pred, self.exact(field, value)))
            }
            BoolExpr::IsNull(value) if value.as_field() == Some(field) => Some((KeyPred::IsNull, true)),
            BoolExpr::InList { value, list }
                if value.as_field() == Some(field)
                    && !list.is_empty()
                    && list.iter().all(|v| self.bindable(v)) =>
            {
                let exact = list.iter().all(|v| self.exact(field, v));
                Some((KeyPred::List(list), exact))
            }
            _ => None,
        }
    }

    /// Match a prefix of `index` against `preds`. IN lists are skipped when
    /// `lists` is false, since their lookups do not follow key order.
    fn match_index(&self, index: &IndexDescriptor, preds: &[Pred<'_>], lists: bool) -> Option<IndexCandidate> {
        let mut segments = Vec::new();
        let mut consumed: Vec<(usize, String)> = Vec::new();
        let mut narrowed: Vec<usize> = Vec::new();
        let mut dependencies = StreamSet::new();
        let mut equalities = 0;
        let mut tail_factor: Option<f64> = None;
        let mut list_len = 0usize;

        let mut note = |found: &Found<'_>, values: &[&ValueExpr]| {
            if !narrowed.contains(&found.id) {
                narrowed.push(found.id);
                if found.exact {
                    consumed.push((found.id, index.name.clone()));
                }
            }
            for v in values {
                v.collect_streams(&mut dependencies);
            }
        };

        for segment in &index.segments {
            let field = FieldRef::new(self.stream, segment.field);
            let found: Vec<Found<'_>> = preds
                .iter()
                .filter_map(|p| {
                    self.key_pred(p.expr, &field)
                        .map(|(pred, exact)| Found { id: p.id, pred, exact })
                })
                .collect();

            if let Some(eq) = found
                .iter()
                .filter(|f| f.pred.is_equality())
                .min_by_key(|f| (!f.exact, f.pred.rank()))
            {
                let matched = match eq.pred {
                    KeyPred::Equal(v) => SegmentMatch::Equal(v.clone()),
                    KeyPred::Equivalent(v) => SegmentMatch::Equivalent(v.clone()),
                    _ => SegmentMatch::IsNull,
                };
                note(eq, &eq.pred.value().into_iter().collect::<Vec<_>>());
                segments.push(SegmentBound {
                    field: segment.field,
                    matched,
                });
                equalities += 1;
                continue;
            }

            if lists {
                if let Some(list) = found.iter().find(|f| matches!(f.pred, KeyPred::List(_))) {
                    if let KeyPred::List(values) = list.pred {
                        note(list, &values.iter().collect::<Vec<_>>());
                        list_len = values.len();
                        segments.push(SegmentBound {
                            field: segment.field,
                            matched: SegmentMatch::List(values.to_vec()),
                        });
                    }
                    break;
                }
            }

            let pick = |lower: bool| {
                found
                    .iter()
                    .filter(|f| match f.pred {
                        KeyPred::Lower(..) => lower,
                        KeyPred::Upper(..) => !lower,
                        _ => false,
                    })
                    .min_by_key(|f| !f.exact)
            };
            let (lower, upper) = (pick(true), pick(false));
            if lower.is_some() || upper.is_some() {
                let matched = SegmentMatch::Range {
                    lower: range_bound(lower),
                    upper: range_bound(upper),
                };
                for f in [lower, upper].into_iter().flatten() {
                    note(f, &f.pred.value().into_iter().collect::<Vec<_>>());
                }
                tail_factor = Some(match (lower, upper) {
                    (Some(_), Some(_)) => REDUCE_SELECTIVITY_FACTOR_BETWEEN,
                    (Some(_), None) => REDUCE_SELECTIVITY_FACTOR_GREATER,
                    _ => REDUCE_SELECTIVITY_FACTOR_LESS,
                });
                segments.push(SegmentBound {
                    field: segment.field,
                    matched,
                });
                break;
            }

            if let Some(starting) = found.iter().find(|f| matches!(f.pred, KeyPred::Starting(_))) {
                if let KeyPred::Starting(v) = starting.pred {
                    note(starting, &[v]);
                    segments.push(SegmentBound {
                        field: segment.field,
                        matched: SegmentMatch::Starting(v.clone()),
                    });
                    tail_factor = Some(REDUCE_SELECTIVITY_FACTOR_STARTING);
                }
            }
            break;
        }

        if segments.is_empty() {
            return None;
        }
        let prefix = index_prefix_selectivity(index, equalities, self.cardinality);
        let selectivity = if list_len > 0 {
            (index_prefix_selectivity(index, equalities + 1, self.cardinality) * list_len as f64).min(prefix)
        } else {
            prefix * tail_factor.unwrap_or(1.0)
        };
        let dependencies: StreamSet = dependencies
            .iter()
            .filter(|s| *s != self.stream && self.level.contains(*s))
            .collect();
        Some(IndexCandidate {
            inversion: Inversion::Index(IndexRange {
                index: index.name.clone(),
                index_id: index.id,
                descending: index.descending,
                unique: index.unique,
                key_segments: index.segments.len(),
                segments,
            }),
            index_id: index.id,
            segments: equalities + usize::from(list_len > 0 || tail_factor.is_some()),
            leaves: 1,
            selectivity: selectivity.clamp(0.0, 1.0),
            consumed,
            narrowed,
            dependencies,
        })
    }

    /// Union of index ranges for an OR conjunct.
    fn match_or(&self, pred: &Pred<'_>, indexes: &[IndexDescriptor]) -> Option<IndexCandidate> {
        let BoolExpr::Or(branches) = pred.expr else {
            return None;
        };
        let mut inversions = Vec::new();
        let mut selectivity = 0.0;
        let mut complete = true;
        let mut dependencies = StreamSet::new();
        let mut segments = 0;
        let mut index_id = u32::MAX;
        let mut names: Vec<String> = Vec::new();
        for branch in branches {
            let parts = conjuncts_of(branch);
            let preds: Vec<Pred<'_>> = parts
                .iter()
                .enumerate()
                .map(|(id, expr)| Pred { id, expr })
                .collect();
            let best = indexes
                .iter()
                .filter_map(|idx| self.match_index(idx, &preds, true))
                .min_by(|a, b| self.compare(a, b))?;
            if best.consumed.len() != parts.len() {
                complete = false;
            }
            selectivity += best.selectivity;
            dependencies.union_with(&best.dependencies);
            segments += best.segments;
            index_id = index_id.min(best.index_id);
            for name in best.inversion.index_names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            inversions.push(best.inversion);
        }
        let consumed = if complete {
            vec![(pred.id, names.join(", "))]
        } else {
            Vec::new()
        };
        Some(IndexCandidate {
            leaves: inversions.len(),
            inversion: Inversion::Or(inversions),
            index_id,
            segments,
            selectivity: f64::min(selectivity, 1.0),
            consumed,
            narrowed: vec![pred.id],
            dependencies,
        })
    }

    fn candidates(&self, relation: &RelationMeta, preds: &[Pred<'_>]) -> Vec<IndexCandidate> {
        let mut out: Vec<IndexCandidate> = relation
            .indexes
            .iter()
            .filter_map(|idx| self.match_index(idx, preds, true))
            .collect();
        out.extend(preds.iter().filter_map(|p| self.match_or(p, &relation.indexes)));
        out
    }

    /// Greedy intersection of the candidates, cheapest first.
    fn combine(&self, mut candidates: Vec<IndexCandidate>, covered: &[usize]) -> Option<IndexCandidate> {
        candidates.sort_by(|a, b| self.compare(a, b));
        let mut covered = covered.to_vec();
        let mut best: Option<IndexCandidate> = None;
        for candidate in candidates {
            if candidate.narrowed.iter().any(|id| covered.contains(id)) {
                continue;
            }
            let next = match &best {
                None => candidate,
                Some(current) => {
                    let merged = current.clone().intersect(candidate);
                    if self.bitmap_cost(&merged) >= self.bitmap_cost(current) {
                        continue;
                    }
                    merged
                }
            };
            covered = next.narrowed.clone();
            trace!(
                stream = %self.stream,
                indexes = ?next.inversion.index_names(),
                selectivity = next.selectivity,
                "index candidate accepted"
            );
            best = Some(next);
        }
        best
    }

    /// Navigation over `index` delivering `order`, if it can.
    fn navigation(&self, index: &IndexDescriptor, preds: &[Pred<'_>], order: Option<&SortSpec>) -> Option<NavCandidate> {
        let base = self.match_index(index, preds, false);
        let range = match &base {
            Some(IndexCandidate {
                inversion: Inversion::Index(range),
                ..
            }) => range.clone(),
            _ => IndexRange {
                index: index.name.clone(),
                index_id: index.id,
                descending: index.descending,
                unique: index.unique,
                key_segments: index.segments.len(),
                segments: Vec::new(),
            },
        };
        if let Some(order) = order {
            let fixed: Vec<u16> = range.segments[..range.equality_prefix()]
                .iter()
                .map(|s| s.field)
                .collect();
            let mut position = fixed.len();
            for item in &order.items {
                let field = item.expr.as_field().filter(|f| f.stream == self.stream)?;
                if fixed.contains(&field.field) {
                    continue;
                }
                let direction = if index.descending {
                    item.descending && !item.nulls_first()
                } else {
                    !item.descending && item.nulls_first()
                };
                if !direction || index.segments.get(position)?.field != field.field {
                    return None;
                }
                position += 1;
            }
        }
        Some(NavCandidate {
            range,
            base,
            index_id: index.id,
        })
    }

    fn best(&self, relation: &RelationMeta, preds: &[Pred<'_>], order: Option<&SortSpec>) -> Choice {
        let candidates = self.candidates(relation, preds);
        let scan = self.full_scan();
        let plain = match self.combine(candidates.clone(), &[]) {
            Some(bitmap) if self.bitmap_cost(&bitmap) < scan.cost => Choice {
                cost: self.bitmap_cost(&bitmap),
                bitmap: Some(bitmap),
                navigation: None,
            },
            _ => scan,
        };
        let Some(order) = order else {
            return plain;
        };

        let mut best_nav: Option<Choice> = None;
        for index in &relation.indexes {
            let Some(nav) = self.navigation(index, preds, Some(order)) else {
                continue;
            };
            let covered = nav.base.as_ref().map(|b| b.narrowed.clone()).unwrap_or_default();
            let others: Vec<IndexCandidate> = candidates
                .iter()
                .filter(|c| !c.inversion.uses_index(index.id))
                .cloned()
                .collect();
            let bitmap = self.combine(others, &covered);
            let cost = self.navigation_cost(&nav, bitmap.as_ref());
            let better = match &best_nav {
                None => true,
                Some(current) => {
                    let current_id = current.navigation.as_ref().map_or(u32::MAX, |n| n.index_id);
                    cost < current.cost || (cost == current.cost && nav.index_id < current_id)
                }
            };
            if better {
                best_nav = Some(Choice {
                    bitmap,
                    navigation: Some(nav),
                    cost,
                });
            }
        }
        let Some(nav) = best_nav else {
            return plain;
        };
        let plain_rows = self.cardinality * plain.bitmap.as_ref().map_or(1.0, |b| b.selectivity);
        let sorted = plain.cost.add(self.planner.cost_model.sort(plain_rows));
        if self.planner.config.prefer_navigation || nav.cost < sorted {
            trace!(stream = %self.stream, cost = nav.cost.total, "navigation chosen");
            nav
        } else {
            plain
        }
    }

    fn lookup<'r>(&self, relation: &'r RelationMeta, name: &str) -> Result<&'r IndexDescriptor> {
        relation
            .index_by_name(name)
            .ok_or_else(|| OptimizerError::IndexNotFound {
                index: name.to_string(),
                relation: relation.name.clone(),
            })
    }

    fn not_usable(relation: &RelationMeta, index: &IndexDescriptor) -> OptimizerError {
        OptimizerError::IndexNotUsable {
            index: index.name.clone(),
            relation: relation.name.clone(),
        }
    }

    /// Intersection of exactly the named indexes; each must match something.
    fn forced_bitmap(
        &self,
        relation: &RelationMeta,
        names: &[String],
        preds: &[Pred<'_>],
        exclude: Option<u32>,
    ) -> Result<Option<IndexCandidate>> {
        let mut bitmap: Option<IndexCandidate> = None;
        for name in names {
            let index = self.lookup(relation, name)?;
            if Some(index.id) == exclude {
                return Err(Self::not_usable(relation, index));
            }
            let mut candidate = self
                .match_index(index, preds, true)
                .ok_or_else(|| Self::not_usable(relation, index))?;
            if let Some(current) = &bitmap {
                candidate
                    .consumed
                    .retain(|(id, _)| !current.consumed.iter().any(|(c, _)| c == id));
            }
            bitmap = Some(match bitmap {
                None => candidate,
                Some(current) => current.intersect(candidate),
            });
        }
        Ok(bitmap)
    }

    fn hinted_bitmap(&self, relation: &RelationMeta, names: &[String], preds: &[Pred<'_>]) -> Result<Choice> {
        let bitmap = self.forced_bitmap(relation, names, preds, None)?;
        let cost = match &bitmap {
            Some(b) => self.bitmap_cost(b),
            None => self.full_scan().cost,
        };
        Ok(Choice {
            bitmap,
            navigation: None,
            cost,
        })
    }

    fn hinted_navigation(
        &self,
        relation: &RelationMeta,
        index: &str,
        indexes: &[String],
        preds: &[Pred<'_>],
        order: Option<&SortSpec>,
    ) -> Result<Choice> {
        let descriptor = self.lookup(relation, index)?;
        let nav = self
            .navigation(descriptor, preds, order)
            .ok_or_else(|| Self::not_usable(relation, descriptor))?;
        let mut bitmap = self.forced_bitmap(relation, indexes, preds, Some(descriptor.id))?;
        if let (Some(b), Some(base)) = (bitmap.as_mut(), nav.base.as_ref()) {
            b.consumed
                .retain(|(id, _)| !base.consumed.iter().any(|(c, _)| c == id));
        }
        let cost = self.navigation_cost(&nav, bitmap.as_ref());
        Ok(Choice {
            bitmap,
            navigation: Some(nav),
            cost,
        })
    }
}
