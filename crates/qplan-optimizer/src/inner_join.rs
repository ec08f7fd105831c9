//! # Inner Join Ordering
//!
//! Orders the streams of an inner-join level into nested-loop sequences.
//!
//! ## Components
//!
//! Streams are first split into components: two streams belong together when one
//! can be looked up through an index keyed on values of the other, or when a
//! procedure takes the other's values as input. Each component becomes one
//! nested-loop river; rivers are later combined by hash, merge or cross joins.
//!
//! ## Search
//!
//! For a component of at most `max_exhaustive_join_streams` streams every order
//! is enumerated depth-first with branch-and-bound pruning. Larger components are
//! ordered greedily, cheapest next stream first. The cost of an order is
//!
//! ```text
//! cost = sum over positions i of rows(0..i) * cost(stream_i | streams 0..i)
//! ```
//!
//! so an order is cheap when early streams are small and later streams are
//! reached through selective index lookups. Per-stream estimates are memoised on
//! the stream and the set of streams active before it.
//!
//! When a sort is requested and navigation is preferred, a stream whose access
//! can deliver the sort through an index is fixed in the first position.

use crate::conjunct::ConjunctSet;
use crate::context::Planner;
use crate::retrieval::{plan_stream, AccessRequest};
use crate::river::River;
use qplan_core::cost::Cost;
use qplan_core::error::{OptimizerError, Result};
use qplan_core::plan::{ConjunctOrigin, JoinType, RecordSource};
use qplan_core::query::SortSpec;
use qplan_core::stream::{StreamId, StreamSet};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct Estimate {
    cost: Cost,
    cardinality: f64,
    navigates: bool,
}

struct Best {
    cost: f64,
    order: Vec<StreamId>,
}

pub struct InnerJoin<'p, 'a> {
    planner: &'p Planner<'a>,
    level: &'p StreamSet,
    zones: &'p [ConjunctOrigin],
    order: Option<&'p SortSpec>,
    estimates: RefCell<HashMap<(StreamId, StreamSet), Estimate>>,
}

impl<'p, 'a> InnerJoin<'p, 'a> {
    pub fn new(
        planner: &'p Planner<'a>,
        level: &'p StreamSet,
        zones: &'p [ConjunctOrigin],
        order: Option<&'p SortSpec>,
    ) -> Self {
        Self {
            planner,
            level,
            zones,
            order,
            estimates: RefCell::new(HashMap::new()),
        }
    }

    fn ready(&self, stream: StreamId, active: &StreamSet) -> Result<bool> {
        let deps = self.planner.stream(stream)?.dependencies();
        Ok(!deps.intersects(&self.level.difference(active)))
    }

    fn estimate(&self, conjuncts: &ConjunctSet, stream: StreamId, active: &StreamSet) -> Result<Estimate> {
        let key = (stream, active.clone());
        if let Some(e) = self.estimates.borrow().get(&key) {
            return Ok(*e);
        }
        let access = plan_stream(
            self.planner,
            conjuncts,
            &AccessRequest {
                stream,
                active,
                level: self.level,
                zones: self.zones,
                order: if active.is_empty() { self.order } else { None },
            },
        )?;
        let estimate = Estimate {
            cost: access.cost,
            cardinality: access.cardinality,
            navigates: access.navigation.is_some(),
        };
        self.estimates.borrow_mut().insert(key, estimate);
        Ok(estimate)
    }

    /// Split `streams` into groups connected by index lookups or procedure inputs.
    pub fn components(&self, conjuncts: &ConjunctSet, streams: &[StreamId]) -> Result<Vec<Vec<StreamId>>> {
        let mut group: Vec<usize> = (0..streams.len()).collect();
        fn root(group: &mut [usize], mut i: usize) -> usize {
            while group[i] != i {
                group[i] = group[group[i]];
                i = group[i];
            }
            i
        }

        for (i, &a) in streams.iter().enumerate() {
            for (j, &b) in streams.iter().enumerate() {
                if i == j {
                    continue;
                }
                let info = self.planner.stream(b)?;
                let deps = info.dependencies();
                let connected = if !deps.is_empty() {
                    deps.contains(a)
                } else {
                    let active = StreamSet::single(a);
                    plan_stream(
                        self.planner,
                        conjuncts,
                        &AccessRequest {
                            stream: b,
                            active: &active,
                            level: self.level,
                            zones: self.zones,
                            order: None,
                        },
                    )?
                    .lookup_dependencies
                    .contains(a)
                };
                if connected {
                    let (ra, rb) = (root(&mut group, i), root(&mut group, j));
                    group[ra.max(rb)] = ra.min(rb);
                }
            }
        }

        let mut out: Vec<(usize, Vec<StreamId>)> = Vec::new();
        for (i, &s) in streams.iter().enumerate() {
            let r = root(&mut group, i);
            match out.iter_mut().find(|(g, _)| *g == r) {
                Some((_, members)) => members.push(s),
                None => out.push((r, vec![s])),
            }
        }
        Ok(out.into_iter().map(|(_, members)| members).collect())
    }

    /// Cheapest nested-loop order of `streams`.
    pub fn find_order(&self, conjuncts: &ConjunctSet, streams: &[StreamId]) -> Result<Vec<StreamId>> {
        if streams.len() <= 1 {
            return Ok(streams.to_vec());
        }
        let mut remaining = streams.to_vec();
        let mut placed = Vec::new();
        let mut active = StreamSet::new();
        let mut cost = 0.0;
        let mut rows = 1.0;

        if self.order.is_some() && self.planner.config.prefer_navigation {
            let mut first: Option<(StreamId, Estimate)> = None;
            for &s in streams {
                if !self.ready(s, &active)? {
                    continue;
                }
                let e = self.estimate(conjuncts, s, &active)?;
                if e.navigates && first.map_or(true, |(_, f)| e.cost < f.cost) {
                    first = Some((s, e));
                }
            }
            if let Some((s, e)) = first {
                trace!(stream = %s, "navigable stream fixed first");
                remaining.retain(|r| *r != s);
                placed.push(s);
                active.insert(s);
                cost = e.cost.total;
                rows = e.cardinality;
            }
        }

        let order = if streams.len() <= self.planner.config.max_exhaustive_join_streams {
            let mut best = None;
            self.search(conjuncts, &mut remaining, &mut placed, &mut active, cost, rows, &mut best)?;
            best.map(|b| b.order)
        } else {
            self.greedy(conjuncts, remaining, placed, active, rows).map(Some)?
        };
        order.ok_or_else(|| OptimizerError::PlanNotSatisfiable {
            reason: "circular dependencies between procedure inputs".to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn search(
        &self,
        conjuncts: &ConjunctSet,
        remaining: &mut Vec<StreamId>,
        placed: &mut Vec<StreamId>,
        active: &mut StreamSet,
        cost: f64,
        rows: f64,
        best: &mut Option<Best>,
    ) -> Result<()> {
        self.planner.check_cancelled()?;
        if remaining.is_empty() {
            if best.as_ref().map_or(true, |b| cost < b.cost) {
                trace!(order = ?placed, cost, "join order accepted");
                *best = Some(Best {
                    cost,
                    order: placed.clone(),
                });
            }
            return Ok(());
        }
        for i in 0..remaining.len() {
            let stream = remaining[i];
            if !self.ready(stream, active)? {
                continue;
            }
            let e = self.estimate(conjuncts, stream, active)?;
            let next_cost = cost + rows * e.cost.total;
            if let Some(b) = best.as_ref() {
                if next_cost >= b.cost {
                    trace!(order = ?placed, next = %stream, "join order pruned");
                    continue;
                }
            }
            remaining.remove(i);
            placed.push(stream);
            active.insert(stream);
            let result = self.search(
                conjuncts,
                remaining,
                placed,
                active,
                next_cost,
                rows * e.cardinality,
                best,
            );
            active.remove(stream);
            placed.pop();
            remaining.insert(i, stream);
            result?;
        }
        Ok(())
    }

    fn greedy(
        &self,
        conjuncts: &ConjunctSet,
        mut remaining: Vec<StreamId>,
        mut placed: Vec<StreamId>,
        mut active: StreamSet,
        mut rows: f64,
    ) -> Result<Vec<StreamId>> {
        while !remaining.is_empty() {
            self.planner.check_cancelled()?;
            let mut pick: Option<(usize, Estimate)> = None;
            for (i, &s) in remaining.iter().enumerate() {
                if !self.ready(s, &active)? {
                    continue;
                }
                let e = self.estimate(conjuncts, s, &active)?;
                let better = match pick {
                    None => true,
                    Some((_, p)) => {
                        let (a, b) = (rows * e.cost.total, rows * p.cost.total);
                        a < b || (a == b && e.cardinality < p.cardinality)
                    }
                };
                if better {
                    pick = Some((i, e));
                }
            }
            let Some((i, e)) = pick else {
                return Err(OptimizerError::PlanNotSatisfiable {
                    reason: "circular dependencies between procedure inputs".to_string(),
                });
            };
            let s = remaining.remove(i);
            placed.push(s);
            active.insert(s);
            rows *= e.cardinality;
        }
        Ok(placed)
    }

    /// Build the nested-loop river for `order` and consume its conjuncts.
    /// Returns the navigation of the first stream when it delivers the sort.
    pub fn form_river(
        &self,
        conjuncts: &mut ConjunctSet,
        order: &[StreamId],
    ) -> Result<(River, Option<(StreamId, String)>)> {
        let mut active = StreamSet::new();
        let mut inputs = Vec::new();
        let mut cost = Cost::zero();
        let mut rows = 1.0;
        let mut navigation = None;
        for (position, &stream) in order.iter().enumerate() {
            self.planner.check_cancelled()?;
            let access = plan_stream(
                self.planner,
                conjuncts,
                &AccessRequest {
                    stream,
                    active: &active,
                    level: self.level,
                    zones: self.zones,
                    order: if position == 0 { self.order } else { None },
                },
            )?;
            let correlated = access
                .filtered
                .iter()
                .any(|i| conjuncts.get(*i).streams.intersects(&active));
            access.apply(conjuncts, &active)?;
            if position == 0 {
                navigation = access.navigation.clone().map(|index| (stream, index));
                cost = access.cost;
            } else {
                cost = self.planner.cost_model.nested_loop(rows, cost, access.cost);
            }
            rows *= access.cardinality;

            let info = self.planner.stream(stream)?;
            let source = if position > 0
                && !info.is_table()
                && !correlated
                && access.lookup_dependencies.is_empty()
                && info.dependencies().is_empty()
            {
                RecordSource::Buffered {
                    input: Box::new(access.source),
                }
            } else {
                access.source
            };
            inputs.push(source);
            active.insert(stream);
        }

        let source = if inputs.len() == 1 {
            inputs.remove(0)
        } else {
            RecordSource::NestedLoopJoin {
                kind: JoinType::Inner,
                inputs,
                boolean: None,
            }
        };
        Ok((River::new(source, active, cost, rows), navigation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qplan_core::catalog::{FieldMeta, IndexDescriptor, InMemoryCatalog, RelationMeta};
    use qplan_core::config::{CancelFlag, OptimizerConfig};
    use qplan_core::cost::DefaultCostModel;
    use qplan_core::expr::{BoolExpr, DataType, ValueExpr};
    use qplan_core::query::{QuerySpec, StreamNode};

    const ZONES: &[ConjunctOrigin] = &[ConjunctOrigin::Base, ConjunctOrigin::BaseDerived];

    fn f(stream: u32, field: u16) -> ValueExpr {
        ValueExpr::field(StreamId(stream), field)
    }

    fn table(name: &str, rows: f64, pk: u32) -> RelationMeta {
        RelationMeta::table(
            name,
            vec![
                FieldMeta {
                    name: "ID".into(),
                    data_type: DataType::Int64,
                },
                FieldMeta {
                    name: "REF".into(),
                    data_type: DataType::Int64,
                },
            ],
        )
        .with_cardinality(rows)
        .with_index(IndexDescriptor::new(pk, format!("PK_{}", name), &[0]).unique())
    }

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(table("FACT", 1_000_000.0, 1));
        catalog.add_relation(table("DIM", 100.0, 2));
        catalog.add_relation(table("OTHER", 50.0, 3));
        catalog
    }

    #[test]
    fn test_lookup_side_goes_inner() {
        let catalog = catalog();
        let config = OptimizerConfig::default();
        let model = DefaultCostModel::default();
        let cancel = CancelFlag::new();
        let mut planner = Planner::new(&catalog, &config, &model, &cancel);
        planner
            .register(&QuerySpec::inner(vec![
                StreamNode::relation(0, "FACT"),
                StreamNode::relation(1, "DIM"),
                StreamNode::relation(2, "OTHER"),
            ]))
            .unwrap();

        let mut conjuncts = ConjunctSet::new(16);
        conjuncts
            .push(BoolExpr::equal(f(0, 1), f(1, 0)), ConjunctOrigin::Base)
            .unwrap();
        let level: StreamSet = (0..3).map(StreamId).collect();
        let join = InnerJoin::new(&planner, &level, ZONES, None);

        let components = join
            .components(&conjuncts, &[StreamId(0), StreamId(1), StreamId(2)])
            .unwrap();
        assert_eq!(components, vec![vec![StreamId(0), StreamId(1)], vec![StreamId(2)]]);

        let order = join.find_order(&conjuncts, &components[0]).unwrap();
        assert_eq!(order, vec![StreamId(0), StreamId(1)]);

        let (river, navigation) = join.form_river(&mut conjuncts, &order).unwrap();
        assert!(navigation.is_none());
        assert_eq!(river.source.to_string(), "PLAN JOIN (FACT NATURAL, DIM INDEX (PK_DIM))");
        assert_eq!(conjuncts.unused().count(), 0);
    }

    #[test]
    fn test_cancellation_is_observed() {
        let catalog = catalog();
        let config = OptimizerConfig::default();
        let model = DefaultCostModel::default();
        let cancel = CancelFlag::new();
        let mut planner = Planner::new(&catalog, &config, &model, &cancel);
        planner
            .register(&QuerySpec::inner(vec![
                StreamNode::relation(0, "FACT"),
                StreamNode::relation(1, "DIM"),
            ]))
            .unwrap();
        let conjuncts = ConjunctSet::new(16);
        let level: StreamSet = (0..2).map(StreamId).collect();
        let join = InnerJoin::new(&planner, &level, ZONES, None);

        cancel.cancel();
        assert_eq!(
            join.find_order(&conjuncts, &[StreamId(0), StreamId(1)]),
            Err(OptimizerError::Cancelled)
        );
    }
}
