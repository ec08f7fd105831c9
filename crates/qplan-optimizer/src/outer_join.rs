//! # Outer Joins
//!
//! LEFT and FULL joins are not reordered. Each has a fixed shape built from its
//! two sides, a single stream or a river planned beforehand.
//!
//! ## LEFT
//!
//! ```text
//! Nested Loop Join (outer)  [gate: ON conjuncts reading only the preserved side]
//!     preserved side        [WHERE conjuncts of the enclosing level on this side]
//!     null-extended side    [ON conjuncts, through index lookups or a filter]
//! ```
//!
//! ON conjuncts never filter the preserved side: those that only read it form the
//! gate of the join, which skips the inner side for a row without dropping the row.
//! WHERE conjuncts handed down from the enclosing level may read the preserved
//! side (`Parent` zone) or the null-extended side (`ParentMissing`). The former
//! are used for the preserved side's access; the latter are evaluated above the
//! join, after NULL extension.
//!
//! ## FULL
//!
//! A forward pass (LEFT join of the first side to the second) is followed by a
//! reverse pass (anti join of the second side to the first) that emits the rows of
//! the second side without a partner. The reverse pass evaluates fresh copies of
//! the ON conjuncts, recorded as cloned placements.

use crate::conjunct::ConjunctSet;
use crate::context::Planner;
use crate::retrieval::{plan_stream, AccessRequest};
use crate::river::River;
use qplan_core::error::{OptimizerError, Result};
use qplan_core::expr::BoolExpr;
use qplan_core::plan::{ConjunctOrigin, JoinType, Placement, RecordSource};
use qplan_core::query::{JoinKind, SortSpec};
use qplan_core::stream::{StreamId, StreamSet};
use tracing::trace;

const ON_ZONES: &[ConjunctOrigin] = &[ConjunctOrigin::Base];
const PRESERVED_ZONES: &[ConjunctOrigin] = &[ConjunctOrigin::Parent, ConjunctOrigin::ParentDerived];
const ALL_ZONES: &[ConjunctOrigin] = &[
    ConjunctOrigin::Base,
    ConjunctOrigin::BaseDerived,
    ConjunctOrigin::Parent,
    ConjunctOrigin::ParentDerived,
    ConjunctOrigin::ParentMissing,
];

/// One side of an outer join.
#[derive(Debug, Clone)]
pub enum Side {
    Stream(StreamId),
    River(River),
}

impl Side {
    pub fn streams(&self) -> StreamSet {
        match self {
            Side::Stream(s) => StreamSet::single(*s),
            Side::River(r) => r.streams.clone(),
        }
    }
}

struct OuterJoin<'p, 'a> {
    planner: &'p Planner<'a>,
    level: &'p StreamSet,
}

impl<'p, 'a> OuterJoin<'p, 'a> {
    /// The side read first, restricted by conjuncts of `zones` only.
    fn outer(
        &self,
        side: Side,
        conjuncts: &mut ConjunctSet,
        zones: &[ConjunctOrigin],
        order: Option<&SortSpec>,
    ) -> Result<(River, Option<(StreamId, String)>)> {
        match side {
            Side::Stream(stream) => {
                let active = StreamSet::new();
                let access = plan_stream(
                    self.planner,
                    conjuncts,
                    &AccessRequest {
                        stream,
                        active: &active,
                        level: self.level,
                        zones,
                        order,
                    },
                )?;
                access.apply(conjuncts, &active)?;
                let navigation = access.navigation.clone().map(|index| (stream, index));
                Ok((
                    River::new(access.source, StreamSet::single(stream), access.cost, access.cardinality),
                    navigation,
                ))
            }
            Side::River(river) => Ok((river.apply_filters(conjuncts, self.level, zones)?, None)),
        }
    }

    /// The side read once per row of `outer`, restricted by the ON conjuncts.
    fn inner(&self, side: Side, conjuncts: &mut ConjunctSet, outer: &StreamSet) -> Result<River> {
        match side {
            Side::Stream(stream) => {
                let access = plan_stream(
                    self.planner,
                    conjuncts,
                    &AccessRequest {
                        stream,
                        active: outer,
                        level: self.level,
                        zones: ON_ZONES,
                        order: None,
                    },
                )?;
                access.apply(conjuncts, outer)?;
                Ok(River::new(
                    access.source,
                    StreamSet::single(stream),
                    access.cost,
                    access.cardinality,
                ))
            }
            Side::River(river) => {
                let correlated = conjuncts.unused().any(|(_, c)| {
                    ON_ZONES.contains(&c.origin) && c.streams.intersects(&river.streams) && c.streams.intersects(outer)
                });
                let river = river.apply_correlated(conjuncts, outer, self.level, ON_ZONES)?;
                if correlated {
                    return Ok(river);
                }
                // Produced once, replayed for every outer row.
                let replay = self.planner.cost_model.full_scan(river.cardinality);
                Ok(River::new(
                    RecordSource::Buffered {
                        input: Box::new(river.source),
                    },
                    river.streams,
                    river.cost.add(replay),
                    river.cardinality,
                ))
            }
        }
    }

    /// Consume the ON conjuncts that do not read `inner` as the join gate.
    fn gate(&self, conjuncts: &mut ConjunctSet, inner: &StreamSet) -> Result<Option<BoolExpr>> {
        let ids: Vec<usize> = conjuncts
            .unused()
            .filter(|(_, c)| ON_ZONES.contains(&c.origin) && !c.streams.intersects(inner))
            .map(|(i, _)| i)
            .collect();
        let mut terms = Vec::with_capacity(ids.len());
        for i in ids {
            terms.push(conjuncts.get(i).expr.clone());
            conjuncts.consume(i, Placement::JoinGate)?;
        }
        Ok((!terms.is_empty()).then(|| BoolExpr::and(terms)))
    }

    fn join(&self, kind: JoinType, outer: River, inner: River, gate: Option<BoolExpr>) -> River {
        let cost = self
            .planner
            .cost_model
            .nested_loop(outer.cardinality, outer.cost, inner.cost);
        let cardinality = match kind {
            JoinType::Anti => outer.cardinality,
            _ => outer.cardinality * inner.cardinality.max(1.0),
        };
        River::new(
            RecordSource::NestedLoopJoin {
                kind,
                inputs: vec![outer.source, inner.source],
                boolean: gate,
            },
            outer.streams.union(&inner.streams),
            cost,
            cardinality,
        )
    }

    /// Outer join pass of `inner` against `outer`.
    fn pass(
        &self,
        kind: JoinType,
        conjuncts: &mut ConjunctSet,
        outer: Side,
        inner: Side,
        outer_zones: &[ConjunctOrigin],
        order: Option<&SortSpec>,
    ) -> Result<(River, Option<(StreamId, String)>)> {
        let inner_streams = inner.streams();
        let (outer, navigation) = self.outer(outer, conjuncts, outer_zones, order)?;
        let gate = self.gate(conjuncts, &inner_streams)?;
        let inner = self.inner(inner, conjuncts, &outer.streams)?;
        Ok((self.join(kind, outer, inner, gate), navigation))
    }
}

/// Plan a LEFT or FULL join of two sides. `conjuncts` holds the ON conjuncts and,
/// for LEFT, the WHERE conjuncts handed down from the enclosing level.
pub fn generate_outer_join(
    planner: &Planner<'_>,
    conjuncts: &mut ConjunctSet,
    kind: JoinKind,
    preserved: Side,
    other: Side,
    order: Option<&SortSpec>,
) -> Result<(River, Option<(StreamId, String)>)> {
    planner.check_cancelled()?;
    let level = preserved.streams().union(&other.streams());
    let join = OuterJoin {
        planner,
        level: &level,
    };
    match kind {
        JoinKind::Left => {
            let (river, navigation) = join.pass(
                JoinType::Outer,
                conjuncts,
                preserved,
                other,
                PRESERVED_ZONES,
                order,
            )?;
            trace!(streams = river.streams.len(), "left join formed");
            Ok((river.apply_residual(conjuncts, ALL_ZONES)?, navigation))
        }
        JoinKind::Full => {
            let mut reverse = conjuncts.clone();
            reverse.take_placements();
            let (forward, _) = join.pass(
                JoinType::Outer,
                conjuncts,
                preserved.clone(),
                other.clone(),
                &[],
                None,
            )?;
            let (anti, _) = join.pass(JoinType::Anti, &mut reverse, other, preserved, &[], None)?;
            conjuncts.absorb_clones(reverse);
            trace!(streams = forward.streams.len(), "full join formed");
            let river = River::new(
                RecordSource::FullOuterJoin {
                    forward: Box::new(forward.source),
                    reverse: Box::new(anti.source),
                },
                forward.streams,
                forward.cost.add(anti.cost),
                forward.cardinality + anti.cardinality,
            );
            Ok((river.apply_residual(conjuncts, ALL_ZONES)?, None))
        }
        JoinKind::Inner => Err(OptimizerError::Internal(
            "inner join planned as an outer join".to_string(),
        )),
    }
}
