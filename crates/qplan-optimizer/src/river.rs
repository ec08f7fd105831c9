//! # Rivers
//!
//! A river is a partial plan covering a set of streams. The inner-join search
//! produces one river per component, nested joins and derived tables contribute
//! rivers of their own, and the rivers of a level are then merged until one
//! remains:
//!
//! 1. **Equi-joins**: `=` and `IS NOT DISTINCT FROM` conjuncts whose sides each
//!    read exactly one river form key classes. The class spanning the most rivers
//!    is chosen, together with every class spanning the same rivers, and those
//!    rivers are joined on them by hash join (largest river probes, the others are
//!    built smallest first) or by merge join (each input sorted on its keys),
//!    whichever is estimated cheaper. This repeats while any class spans two
//!    rivers.
//! 2. **Cross join**: whatever is left is joined by nested loops. Inner inputs
//!    that are not a single table are buffered so they are produced once.
//!
//! After each merge the conjuncts that became computable are applied as a filter.

use crate::conjunct::ConjunctSet;
use crate::context::{Planner, StreamSource};
use crate::sort::sort_river;
use qplan_core::cost::Cost;
use qplan_core::error::{OptimizerError, Result};
use qplan_core::expr::{BoolExpr, CompareOp, ValueExpr};
use qplan_core::plan::{ConjunctOrigin, HashBuild, JoinType, MergeInput, Placement, RecordSource};
use qplan_core::query::SortSpec;
use qplan_core::stats::{conjunct_selectivity, derive_join_cardinality, MINIMUM_CARDINALITY};
use qplan_core::stream::{StreamId, StreamSet};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct River {
    pub source: RecordSource,
    pub streams: StreamSet,
    pub cost: Cost,
    pub cardinality: f64,
}

impl River {
    pub fn new(source: RecordSource, streams: StreamSet, cost: Cost, cardinality: f64) -> Self {
        Self {
            source,
            streams,
            cost,
            cardinality,
        }
    }

    /// Put every unused conjunct computable on this river into a filter above it.
    pub fn apply_filters(
        self,
        conjuncts: &mut ConjunctSet,
        level: &StreamSet,
        zones: &[ConjunctOrigin],
    ) -> Result<River> {
        self.apply_correlated(conjuncts, &StreamSet::new(), level, zones)
    }

    /// Like `apply_filters` for a river evaluated once per row of `outer`.
    pub fn apply_correlated(
        mut self,
        conjuncts: &mut ConjunctSet,
        outer: &StreamSet,
        level: &StreamSet,
        zones: &[ConjunctOrigin],
    ) -> Result<River> {
        let active = self.streams.union(outer);
        let ready: Vec<usize> = conjuncts
            .unused()
            .filter(|(_, c)| {
                zones.contains(&c.origin)
                    && c.streams.intersects(&self.streams)
                    && c.expr.computable(&active, level)
            })
            .map(|(i, _)| i)
            .collect();
        if ready.is_empty() {
            return Ok(self);
        }
        let mut conditions = Vec::with_capacity(ready.len());
        for i in ready {
            conditions.push(conjuncts.get(i).expr.clone());
            self.cardinality *= conjunct_selectivity(&conjuncts.get(i).expr);
            conjuncts.consume(
                i,
                Placement::Filter {
                    streams: active.clone(),
                },
            )?;
        }
        self.cardinality = self.cardinality.max(MINIMUM_CARDINALITY);
        self.source = RecordSource::filter(self.source, conditions);
        Ok(self)
    }

    /// Put every remaining unused conjunct of `zones` into a filter above the river.
    pub fn apply_residual(mut self, conjuncts: &mut ConjunctSet, zones: &[ConjunctOrigin]) -> Result<River> {
        let rest: Vec<usize> = conjuncts
            .unused()
            .filter(|(_, c)| zones.contains(&c.origin))
            .map(|(i, _)| i)
            .collect();
        let mut conditions = Vec::with_capacity(rest.len());
        for i in rest {
            conditions.push(conjuncts.get(i).expr.clone());
            self.cardinality = (self.cardinality * conjunct_selectivity(&conjuncts.get(i).expr)).max(MINIMUM_CARDINALITY);
            conjuncts.consume(
                i,
                Placement::Filter {
                    streams: self.streams.clone(),
                },
            )?;
        }
        self.source = RecordSource::filter(self.source, conditions);
        Ok(self)
    }
}

/// Join algorithm for an equi-join of rivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMethod {
    Hash,
    Merge,
}

#[derive(Debug, Clone)]
struct KeyClass {
    null_matches: bool,
    members: Vec<(usize, ValueExpr)>,
}

impl KeyClass {
    fn support(&self) -> Vec<usize> {
        let mut rivers: Vec<usize> = self.members.iter().map(|(r, _)| *r).collect();
        rivers.sort_unstable();
        rivers.dedup();
        rivers
    }

    fn key_for(&self, river: usize) -> Option<&ValueExpr> {
        self.members.iter().find(|(r, _)| *r == river).map(|(_, e)| e)
    }
}

fn equi_sides(expr: &BoolExpr) -> Option<(bool, &ValueExpr, &ValueExpr)> {
    match expr {
        BoolExpr::Compare {
            op: op @ (CompareOp::Eq | CompareOp::Equiv),
            left,
            right,
            extra: None,
        } => Some((*op == CompareOp::Equiv, left, right)),
        _ => None,
    }
}

/// River reading every level stream of `expr`.
fn owner(expr: &ValueExpr, rivers: &[River], level: &StreamSet) -> Option<usize> {
    if expr.is_volatile() {
        return None;
    }
    let streams: StreamSet = expr.streams().iter().filter(|s| level.contains(*s)).collect();
    if streams.is_empty() {
        return None;
    }
    rivers.iter().position(|r| streams.is_subset(&r.streams))
}

fn key_classes(conjuncts: &ConjunctSet, rivers: &[River], level: &StreamSet, zones: &[ConjunctOrigin]) -> Vec<KeyClass> {
    let mut nodes: Vec<(bool, usize, ValueExpr)> = Vec::new();
    let mut parent: Vec<usize> = Vec::new();
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }
    fn slot(nodes: &mut Vec<(bool, usize, ValueExpr)>, parent: &mut Vec<usize>, key: (bool, usize, &ValueExpr)) -> usize {
        match nodes
            .iter()
            .position(|(n, r, e)| *n == key.0 && *r == key.1 && e == key.2)
        {
            Some(i) => i,
            None => {
                nodes.push((key.0, key.1, key.2.clone()));
                parent.push(parent.len());
                parent.len() - 1
            }
        }
    }

    for (_, c) in conjuncts.unused() {
        if !zones.contains(&c.origin) || !c.is_distributable() {
            continue;
        }
        let Some((null_matches, left, right)) = equi_sides(&c.expr) else {
            continue;
        };
        let (Some(rl), Some(rr)) = (owner(left, rivers, level), owner(right, rivers, level)) else {
            continue;
        };
        if rl == rr {
            continue;
        }
        let a = slot(&mut nodes, &mut parent, (null_matches, rl, left));
        let b = slot(&mut nodes, &mut parent, (null_matches, rr, right));
        let (ra, rb) = (root(&mut parent, a), root(&mut parent, b));
        parent[ra.max(rb)] = ra.min(rb);
    }

    let mut classes: Vec<(usize, KeyClass)> = Vec::new();
    for i in 0..nodes.len() {
        let r = root(&mut parent, i);
        let (null_matches, river, expr) = nodes[i].clone();
        match classes.iter_mut().find(|(g, _)| *g == r) {
            Some((_, class)) => class.members.push((river, expr)),
            None => classes.push((
                r,
                KeyClass {
                    null_matches,
                    members: vec![(river, expr)],
                },
            )),
        }
    }
    classes
        .into_iter()
        .map(|(_, c)| c)
        .filter(|c| c.support().len() > 1)
        .collect()
}

/// Merge rivers through equi-joins until no key class spans two of them.
/// `method` forces the join algorithm.
pub fn generate_equi_join(
    planner: &Planner<'_>,
    conjuncts: &mut ConjunctSet,
    mut rivers: Vec<River>,
    level: &StreamSet,
    zones: &[ConjunctOrigin],
    method: Option<JoinMethod>,
) -> Result<Vec<River>> {
    while rivers.len() > 1 {
        planner.check_cancelled()?;
        let classes = key_classes(conjuncts, &rivers, level, zones);
        // Widest class; the first one wins ties.
        let Some(selected) = classes.iter().map(KeyClass::support).fold(None, |best: Option<Vec<usize>>, s| {
            match best {
                Some(b) if b.len() >= s.len() => Some(b),
                _ => Some(s),
            }
        }) else {
            break;
        };
        let keys: Vec<&KeyClass> = classes
            .iter()
            .filter(|c| {
                let support = c.support();
                selected.iter().all(|r| support.contains(r))
            })
            .collect();

        let cards: Vec<f64> = selected.iter().map(|&r| rivers[r].cardinality).collect();
        let probe_pos = cards
            .iter()
            .enumerate()
            .fold(0, |best, (i, c)| if *c > cards[best] { i } else { best });
        let build_cards: Vec<f64> = cards
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != probe_pos)
            .map(|(_, c)| *c)
            .collect();
        let hash_cost = planner.cost_model.hash_join(&build_cards, cards[probe_pos]);
        let merge_cost = cards.iter().fold(planner.cost_model.merge_join(&cards), |acc, c| {
            acc.add(planner.cost_model.sort(*c))
        });
        let mergeable = selected
            .iter()
            .all(|&r| rivers[r].streams.iter().all(|s| sortable_stream(planner, s)));

        let method = match method {
            Some(JoinMethod::Merge) if !mergeable => {
                return Err(OptimizerError::PlanNotSatisfiable {
                    reason: "merge join input has no known record format".to_string(),
                })
            }
            Some(m) => m,
            None => {
                let hash = planner.config.hash_join_enabled;
                let merge = planner.config.merge_join_enabled && mergeable;
                match (hash, merge) {
                    (true, true) if merge_cost < hash_cost => JoinMethod::Merge,
                    (true, _) => JoinMethod::Hash,
                    (false, true) => JoinMethod::Merge,
                    (false, false) => break,
                }
            }
        };

        let placement = match method {
            JoinMethod::Hash => Placement::HashKey,
            JoinMethod::Merge => Placement::MergeKey,
        };
        let key_conjuncts: Vec<usize> = conjuncts
            .unused()
            .filter(|(_, c)| zones.contains(&c.origin) && c.is_distributable())
            .filter_map(|(i, c)| {
                let (null_matches, left, right) = equi_sides(&c.expr)?;
                keys.iter()
                    .filter(|k| k.null_matches == null_matches)
                    .any(|k| {
                        selected.iter().any(|&a| {
                            selected.iter().any(|&b| {
                                a != b && k.key_for(a) == Some(left) && k.key_for(b) == Some(right)
                            })
                        })
                    })
                    .then_some(i)
            })
            .collect();
        for i in key_conjuncts {
            conjuncts.consume(i, placement.clone())?;
        }

        let null_matches: Vec<bool> = keys.iter().map(|k| k.null_matches).collect();
        let key_exprs = |r: usize| -> Vec<ValueExpr> {
            keys.iter()
                .filter_map(|k| k.key_for(r).cloned())
                .collect()
        };
        let mut taken: Vec<(usize, River)> = Vec::new();
        for &r in selected.iter().rev() {
            taken.push((r, rivers.remove(r)));
        }
        taken.reverse();
        let insert_at = selected[0];

        let mut streams = StreamSet::new();
        let mut cost = Cost::zero();
        for (_, river) in &taken {
            streams.union_with(&river.streams);
            cost = cost.add(river.cost);
        }
        let source = match method {
            JoinMethod::Hash => {
                let probe_keys = key_exprs(taken[probe_pos].0);
                let mut builds: Vec<(f64, HashBuild)> = Vec::new();
                let mut probe = None;
                for (pos, (r, river)) in taken.into_iter().enumerate() {
                    if pos == probe_pos {
                        probe = Some(river.source);
                    } else {
                        builds.push((
                            river.cardinality,
                            HashBuild {
                                source: river.source,
                                keys: key_exprs(r),
                            },
                        ));
                    }
                }
                builds.sort_by(|a, b| a.0.total_cmp(&b.0));
                let probe = probe.ok_or_else(|| OptimizerError::Internal("hash join without probe".into()))?;
                cost = cost.add(hash_cost);
                RecordSource::HashJoin {
                    probe: Box::new(probe),
                    probe_keys,
                    builds: builds.into_iter().map(|(_, b)| b).collect(),
                    null_matches,
                }
            }
            JoinMethod::Merge => {
                let mut inputs = Vec::new();
                for (r, river) in taken {
                    let keys = key_exprs(r);
                    let order = SortSpec::ascending(keys.clone());
                    inputs.push(MergeInput {
                        source: sort_river(planner, river.source, &river.streams, &order, &[], false)?,
                        keys,
                    });
                }
                cost = cost.add(merge_cost);
                RecordSource::MergeJoin {
                    inputs,
                    null_matches,
                }
            }
        };
        trace!(?method, streams = %streams.len(), keys = keys.len(), "rivers merged");
        let river = River::new(source, streams, cost, derive_join_cardinality(&cards))
            .apply_filters(conjuncts, level, zones)?;
        rivers.insert(insert_at.min(rivers.len()), river);
    }
    Ok(rivers)
}

/// Streams whose record format is known, so they can pass through a sort.
fn sortable_stream(planner: &Planner<'_>, stream: StreamId) -> bool {
    matches!(
        planner.stream(stream).map(|i| &i.source),
        Ok(StreamSource::Relation(_)) | Ok(StreamSource::Derived { .. })
    )
}

/// Join the remaining rivers by nested loops. The river holding `first` leads.
pub fn generate_cross_join(
    planner: &Planner<'_>,
    conjuncts: &mut ConjunctSet,
    mut rivers: Vec<River>,
    level: &StreamSet,
    zones: &[ConjunctOrigin],
    first: Option<StreamId>,
) -> Result<River> {
    if let Some(pos) = first.and_then(|s| rivers.iter().position(|r| r.streams.contains(s))) {
        let lead = rivers.remove(pos);
        rivers.insert(0, lead);
    }
    let mut iter = rivers.into_iter();
    let Some(head) = iter.next() else {
        return Err(OptimizerError::Internal("cross join of no rivers".into()));
    };
    let mut rest = iter.peekable();
    if rest.peek().is_none() {
        return head.apply_filters(conjuncts, level, zones);
    }

    let mut streams = head.streams.clone();
    let mut cost = head.cost;
    let mut rows = head.cardinality;
    let mut inputs = vec![head.source];
    for river in rest {
        let buffered = river.streams.len() > 1 || !planner.all_tables(&river.streams);
        if buffered {
            let replay = planner.cost_model.full_scan(river.cardinality);
            cost = planner.cost_model.nested_loop(rows, cost, replay).add(river.cost);
            inputs.push(RecordSource::Buffered {
                input: Box::new(river.source),
            });
        } else {
            cost = planner.cost_model.nested_loop(rows, cost, river.cost);
            inputs.push(river.source);
        }
        rows *= river.cardinality;
        streams.union_with(&river.streams);
    }
    trace!(inputs = inputs.len(), "cross join");
    River::new(
        RecordSource::NestedLoopJoin {
            kind: JoinType::Inner,
            inputs,
            boolean: None,
        },
        streams,
        cost,
        rows,
    )
    .apply_filters(conjuncts, level, zones)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qplan_core::catalog::{FieldMeta, InMemoryCatalog, RelationMeta};
    use qplan_core::config::{CancelFlag, OptimizerConfig};
    use qplan_core::cost::DefaultCostModel;
    use qplan_core::expr::DataType;
    use qplan_core::plan::StreamScan;
    use qplan_core::query::{QuerySpec, StreamNode};

    const ZONES: &[ConjunctOrigin] = &[ConjunctOrigin::Base, ConjunctOrigin::BaseDerived];

    fn f(stream: u32, field: u16) -> ValueExpr {
        ValueExpr::field(StreamId(stream), field)
    }

    fn scan_river(stream: u32, name: &str, rows: f64) -> River {
        River::new(
            RecordSource::FullScan(StreamScan {
                stream: StreamId(stream),
                relation: name.into(),
                alias: name.into(),
            }),
            StreamSet::single(StreamId(stream)),
            Cost::new(rows),
            rows,
        )
    }

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        for name in ["A", "B", "C"] {
            catalog.add_relation(RelationMeta::table(
                name,
                vec![FieldMeta {
                    name: "K".into(),
                    data_type: DataType::Int64,
                }],
            ));
        }
        catalog
    }

    fn with_planner(config: OptimizerConfig, test: impl FnOnce(&Planner<'_>)) {
        let catalog = catalog();
        let model = DefaultCostModel::default();
        let cancel = CancelFlag::new();
        let mut planner = Planner::new(&catalog, &config, &model, &cancel);
        planner
            .register(&QuerySpec::inner(vec![
                StreamNode::relation(0, "A"),
                StreamNode::relation(1, "B"),
                StreamNode::relation(2, "C"),
            ]))
            .unwrap();
        test(&planner);
    }

    #[test]
    fn test_three_way_hash_join_on_one_class() {
        with_planner(OptimizerConfig::default(), |planner| {
            let mut conjuncts = ConjunctSet::new(16);
            for e in [
                BoolExpr::equal(f(0, 0), f(1, 0)),
                BoolExpr::equal(f(1, 0), f(2, 0)),
                BoolExpr::equal(f(0, 0), f(2, 0)),
            ] {
                conjuncts.push(e, ConjunctOrigin::Base).unwrap();
            }
            let level: StreamSet = (0..3).map(StreamId).collect();
            let rivers = vec![
                scan_river(0, "A", 1000.0),
                scan_river(1, "B", 10.0),
                scan_river(2, "C", 100.0),
            ];
            let out = generate_equi_join(planner, &mut conjuncts, rivers, &level, ZONES, None).unwrap();
            assert_eq!(out.len(), 1);
            let RecordSource::HashJoin { probe, builds, .. } = &out[0].source else {
                panic!("expected a hash join, got {}", out[0].source);
            };
            assert_eq!(probe.streams(), StreamSet::single(StreamId(0)));
            assert_eq!(builds[0].source.streams(), StreamSet::single(StreamId(1)));
            assert_eq!(conjuncts.unused().count(), 0);
        });
    }

    #[test]
    fn test_no_key_falls_back_to_cross_join() {
        with_planner(OptimizerConfig::default(), |planner| {
            let mut conjuncts = ConjunctSet::new(16);
            conjuncts
                .push(
                    BoolExpr::compare(CompareOp::Lt, f(0, 0), f(1, 0)),
                    ConjunctOrigin::Base,
                )
                .unwrap();
            let level: StreamSet = (0..2).map(StreamId).collect();
            let rivers = vec![scan_river(0, "A", 10.0), scan_river(1, "B", 10.0)];
            let rivers = generate_equi_join(planner, &mut conjuncts, rivers, &level, ZONES, None).unwrap();
            assert_eq!(rivers.len(), 2);
            let river =
                generate_cross_join(planner, &mut conjuncts, rivers, &level, ZONES, Some(StreamId(1))).unwrap();
            assert_eq!(river.source.to_string(), "PLAN JOIN (B NATURAL, A NATURAL)");
            assert!(matches!(river.source, RecordSource::Filter { .. }));
            assert_eq!(conjuncts.unused().count(), 0);
        });
    }

    #[test]
    fn test_merge_join_when_hash_disabled() {
        let config = OptimizerConfig {
            hash_join_enabled: false,
            ..OptimizerConfig::default()
        };
        with_planner(config, |planner| {
            let mut conjuncts = ConjunctSet::new(16);
            conjuncts
                .push(
                    BoolExpr::compare(CompareOp::Equiv, f(0, 0), f(1, 0)),
                    ConjunctOrigin::Base,
                )
                .unwrap();
            let level: StreamSet = (0..2).map(StreamId).collect();
            let rivers = vec![scan_river(0, "A", 10.0), scan_river(1, "B", 10.0)];
            let out = generate_equi_join(planner, &mut conjuncts, rivers, &level, ZONES, None).unwrap();
            let RecordSource::MergeJoin { inputs, null_matches } = &out[0].source else {
                panic!("expected a merge join");
            };
            assert_eq!(null_matches, &vec![true]);
            assert!(inputs
                .iter()
                .all(|i| matches!(i.source, RecordSource::Sort { .. })));
        });
    }
}
