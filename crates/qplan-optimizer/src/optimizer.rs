//! # Compile Driver
//!
//! `Optimizer::compile` turns one resolved `QuerySpec` into an `AccessPlan`. A
//! query is compiled level by level:
//!
//! 1. Sorts made redundant by GROUP BY, DISTINCT or a derived table are removed
//!    and recorded as `PlanDecision`s.
//! 2. The level's boolean is decomposed into conjuncts, conjuncts handed down
//!    from the enclosing level are merged in, and equalities are distributed.
//! 3. Derived tables and nested outer joins are compiled into rivers of their
//!    own. Nested inner joins without row shaping are flattened into the level.
//! 4. The remaining streams are ordered per connected component (or laid out as
//!    a plan hint dictates), and the resulting rivers are combined by hash, merge
//!    or cross joins.
//! 5. Conjuncts nothing consumed are attached as a final filter.
//!
//! Above the level the driver adds the lock, aggregate, distinct and sort
//! operators (dropping a sort delivered by index navigation), then the SKIP,
//! FIRST and singular wrappers.

use crate::conjunct::ConjunctSet;
use crate::context::Planner;
use crate::decompose::decompose;
use crate::distribute::distribute_equalities;
use crate::hint::{bind_plan, JoinShape};
use crate::inner_join::InnerJoin;
use crate::outer_join::{generate_outer_join, Side};
use crate::river::{generate_cross_join, generate_equi_join, JoinMethod, River};
use crate::sort::{check_sorts, sort_river};
use qplan_core::catalog::Catalog;
use qplan_core::config::{CancelFlag, OptimizerConfig};
use qplan_core::cost::{CostModel, DefaultCostModel};
use qplan_core::error::{OptimizerError, Result};
use qplan_core::expr::{BoolExpr, FieldRef, ScalarValue, ValueExpr};
use qplan_core::plan::{AccessPlan, ConjunctOrigin, ConjunctPlacement, PlanDecision, RecordSource};
use qplan_core::query::{JoinKind, QuerySpec, SortSpec, StreamNode};
use qplan_core::stats::MINIMUM_CARDINALITY;
use qplan_core::stream::{StreamId, StreamSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Zones an inner-join level plans accesses and joins with.
const INNER_ZONES: &[ConjunctOrigin] = &[
    ConjunctOrigin::Base,
    ConjunctOrigin::BaseDerived,
    ConjunctOrigin::Parent,
    ConjunctOrigin::ParentDerived,
];

const ALL_ZONES: &[ConjunctOrigin] = &[
    ConjunctOrigin::Base,
    ConjunctOrigin::BaseDerived,
    ConjunctOrigin::Parent,
    ConjunctOrigin::ParentDerived,
    ConjunctOrigin::ParentMissing,
];

/// Rows kept per group when estimating an aggregate.
const GROUP_REDUCTION: f64 = 0.1;

type Navigation = Option<(StreamId, String)>;

/// The query optimizer.
///
/// Holds only read-only state, so one optimizer may compile statements from
/// several threads at once; each `compile` call owns all of its scratch state.
pub struct Optimizer {
    catalog: Arc<dyn Catalog>,
    config: OptimizerConfig,
    cost_model: Arc<dyn CostModel>,
    cancel: CancelFlag,
}

impl Optimizer {
    /// Create an optimizer using the default cost model weighted by `config.cost`.
    pub fn new(catalog: Arc<dyn Catalog>, config: OptimizerConfig) -> Self {
        let cost_model = Arc::new(DefaultCostModel::new(config.cost.clone()));
        Self {
            catalog,
            config,
            cost_model,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cost_model(mut self, cost_model: Arc<dyn CostModel>) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// Observe `cancel` during compilation. Compiles started after the flag is
    /// raised fail immediately with `Cancelled`.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Compile `spec` into an access plan.
    pub fn compile(&self, spec: &QuerySpec) -> Result<AccessPlan> {
        let level = spec.level_streams();
        debug!(
            "Starting compile: streams={}, plan_hint={}",
            level.len(),
            spec.plan.is_some()
        );
        self.cancel.check()?;

        let mut planner = Planner::new(
            self.catalog.as_ref(),
            &self.config,
            self.cost_model.as_ref(),
            &self.cancel,
        );
        planner.register(spec)?;
        let mut compiler = Compiler {
            planner,
            placements: Vec::new(),
        };
        let river = compiler.compile_query(spec, Vec::new())?;

        let mut plan = AccessPlan::new(river.source, river.cost, river.cardinality);
        plan.decisions = compiler.planner.decisions;
        plan.placements = compiler.placements;
        debug!(
            "Compile complete: cost={:.1}, rows={:.1}, conjuncts={}",
            plan.cost,
            plan.cardinality,
            plan.placements.len()
        );
        Ok(plan)
    }
}

struct Compiler<'a> {
    planner: Planner<'a>,
    placements: Vec<ConjunctPlacement>,
}

impl<'a> Compiler<'a> {
    /// Compile one query level and stack its shaping operators on top.
    /// `parent` holds conjuncts handed down by the enclosing level.
    fn compile_query(&mut self, spec: &QuerySpec, parent: Vec<(BoolExpr, ConjunctOrigin)>) -> Result<River> {
        let (spec, decisions) = check_sorts(spec);
        for decision in decisions {
            self.planner.record(decision);
        }

        // Order the level should try to deliver through index navigation.
        let order = match (&spec.group, &spec.sort, &spec.distinct) {
            (Some(group), _, _) => Some(group.clone()),
            (None, Some(sort), None) => Some(sort.clone()),
            _ => None,
        };
        let (river, navigation) = self.compile_level(&spec, parent, order.as_ref())?;
        let River {
            mut source,
            streams,
            mut cost,
            mut cardinality,
        } = river;

        if spec.with_lock {
            source = RecordSource::Lock {
                input: Box::new(source),
            };
        }

        if let Some(group) = &spec.group {
            match navigated(&source, &navigation) {
                Some((stream, index)) => {
                    self.planner
                        .record(PlanDecision::GroupSatisfiedByNavigation { stream, index });
                }
                None => {
                    source = sort_river(&self.planner, source, &streams, group, &spec.select, false)?;
                    cost = cost.add(self.planner.cost_model.sort(cardinality));
                }
            }
            source = RecordSource::Aggregate {
                input: Box::new(source),
                group: group.exprs().cloned().collect(),
            };
            cardinality = (cardinality * GROUP_REDUCTION).max(MINIMUM_CARDINALITY);
        }

        if let Some(distinct) = &spec.distinct {
            source = sort_river(&self.planner, source, &streams, distinct, &spec.select, true)?;
            cost = cost.add(self.planner.cost_model.sort(cardinality));
        }

        if let Some(sort) = &spec.sort {
            let delivered = spec.group.is_none() && spec.distinct.is_none();
            match navigated(&source, &navigation).filter(|_| delivered) {
                Some((stream, index)) => {
                    self.planner
                        .record(PlanDecision::SortSatisfiedByNavigation { stream, index });
                }
                None => {
                    source = sort_river(&self.planner, source, &streams, sort, &spec.select, false)?;
                    cost = cost.add(self.planner.cost_model.sort(cardinality));
                }
            }
        }

        if let Some(count) = &spec.skip {
            if let Some(n) = literal_count(count) {
                cardinality = (cardinality - n).max(MINIMUM_CARDINALITY);
            }
            source = RecordSource::Skip {
                input: Box::new(source),
                count: count.clone(),
            };
        }
        if let Some(count) = &spec.first {
            if let Some(n) = literal_count(count) {
                cardinality = cardinality.min(n.max(MINIMUM_CARDINALITY));
            }
            source = RecordSource::First {
                input: Box::new(source),
                count: count.clone(),
            };
        }
        if spec.singular {
            source = RecordSource::Singular {
                input: Box::new(source),
            };
            cardinality = MINIMUM_CARDINALITY;
        }

        Ok(River::new(source, streams, cost, cardinality))
    }

    fn compile_level(
        &mut self,
        spec: &QuerySpec,
        parent: Vec<(BoolExpr, ConjunctOrigin)>,
        order: Option<&SortSpec>,
    ) -> Result<(River, Navigation)> {
        self.planner.check_cancelled()?;
        match spec.join {
            JoinKind::Inner => self.inner_level(spec, parent, order),
            kind => self.outer_level(spec, kind, parent, order),
        }
    }

    /// Decompose `booleans` into a fresh conjunct set, merging in `parent`.
    fn conjunct_set(&self, booleans: &[&BoolExpr], parent: Vec<(BoolExpr, ConjunctOrigin)>) -> Result<ConjunctSet> {
        let mut base = Vec::new();
        for boolean in booleans {
            decompose(boolean, &mut base);
        }
        let limit = self.planner.config.max_conjuncts;
        if base.len() > limit {
            return Err(OptimizerError::TooManyConjuncts {
                count: base.len(),
                limit,
            });
        }
        let mut conjuncts = ConjunctSet::new(limit);
        for expr in base {
            conjuncts.push(expr, ConjunctOrigin::Base)?;
        }
        for (expr, origin) in parent {
            conjuncts.push(expr, origin)?;
        }
        Ok(conjuncts)
    }

    /// Add the conjuncts implied by equalities: first among the level's own
    /// conjuncts, then after merging those of the enclosing level.
    fn distribute(&self, conjuncts: &mut ConjunctSet, level: &StreamSet) -> Result<()> {
        let field_type = |f: &FieldRef| self.planner.field_type(f);
        let rounds: [(&[ConjunctOrigin], ConjunctOrigin); 2] = [
            (&[ConjunctOrigin::Base], ConjunctOrigin::BaseDerived),
            (INNER_ZONES, ConjunctOrigin::ParentDerived),
        ];
        for (sources, origin) in rounds {
            if origin == ConjunctOrigin::ParentDerived && conjuncts.count_origin(ConjunctOrigin::Parent) == 0 {
                break;
            }
            let known: Vec<BoolExpr> = conjuncts
                .iter()
                .filter(|(_, c)| sources.contains(&c.origin))
                .map(|(_, c)| c.expr.clone())
                .collect();
            let refs: Vec<&BoolExpr> = known.iter().collect();
            let room = conjuncts.limit().saturating_sub(conjuncts.len());
            let derived = distribute_equalities(&refs, level, &field_type, room);
            trace!(count = derived.len(), ?origin, "equalities distributed");
            for expr in derived {
                if !conjuncts.contains(&expr) {
                    conjuncts.push(expr, origin)?;
                }
            }
        }
        Ok(())
    }

    fn derived_river(&mut self, stream: StreamId, query: &QuerySpec) -> Result<River> {
        let sub = self.compile_query(query, Vec::new())?;
        let info = self.planner.stream_mut(stream)?;
        info.cardinality = sub.cardinality;
        let source = RecordSource::DerivedScan {
            stream,
            alias: info.alias.clone(),
            source: Box::new(sub.source),
            output: query.select.clone(),
        };
        Ok(River::new(source, StreamSet::single(stream), sub.cost, sub.cardinality))
    }

    fn inner_level(
        &mut self,
        spec: &QuerySpec,
        parent: Vec<(BoolExpr, ConjunctOrigin)>,
        order: Option<&SortSpec>,
    ) -> Result<(River, Navigation)> {
        let level = spec.level_streams();
        let mut nodes = Vec::new();
        let mut booleans = Vec::new();
        flatten(spec, &mut nodes, &mut booleans);

        let mut conjuncts = self.conjunct_set(&booleans, parent)?;
        self.distribute(&mut conjuncts, &level)?;
        debug!(
            "Planning inner join: streams={}, conjuncts={}",
            level.len(),
            conjuncts.len()
        );

        // Streams planned by the join search, and rivers built before it.
        let mut base = Vec::new();
        let mut prebuilt = Vec::new();
        for node in nodes {
            match node {
                StreamNode::Relation { stream, .. } | StreamNode::Procedure { stream, .. } => base.push(*stream),
                StreamNode::Derived { stream, query, .. } => {
                    let river = self.derived_river(*stream, query)?;
                    prebuilt.push(river.apply_filters(&mut conjuncts, &level, INNER_ZONES)?);
                }
                StreamNode::Join(sub) => {
                    // Nothing may be filtered below the rows a nested join picks.
                    let handed = if sub.has_row_shaping() {
                        Vec::new()
                    } else {
                        hand_down(&mut conjuncts, sub, &level)?
                    };
                    let river = self.compile_query(sub, handed)?;
                    prebuilt.push(river.apply_filters(&mut conjuncts, &level, INNER_ZONES)?);
                }
            }
        }

        let shape = match &spec.plan {
            Some(plan) => Some(bind_plan(&mut self.planner, plan, &level)?),
            None => None,
        };

        let (rivers, navigation) = match &shape {
            Some(shape) => {
                let mut claimed = StreamSet::new();
                let built = self.build_shape(shape, &mut conjuncts, &level, order, &mut prebuilt, &mut claimed)?;
                match built {
                    Some((river, navigation)) => (vec![river], navigation),
                    None => return Err(OptimizerError::Internal("empty plan hint".to_string())),
                }
            }
            None => {
                let (mut rivers, navigation) = self.order_streams(&mut conjuncts, &level, &base, order)?;
                rivers.extend(prebuilt);
                (rivers, navigation)
            }
        };

        let rivers = generate_equi_join(&self.planner, &mut conjuncts, rivers, &level, INNER_ZONES, None)?;
        let first = navigation.as_ref().map(|(s, _)| *s);
        let river = generate_cross_join(&self.planner, &mut conjuncts, rivers, &level, INNER_ZONES, first)?;
        let river = river.apply_residual(&mut conjuncts, ALL_ZONES)?;
        self.placements.extend(conjuncts.take_placements());
        Ok((river, navigation))
    }

    /// One nested-loop river per connected component of `base`.
    fn order_streams(
        &self,
        conjuncts: &mut ConjunctSet,
        level: &StreamSet,
        base: &[StreamId],
        order: Option<&SortSpec>,
    ) -> Result<(Vec<River>, Navigation)> {
        if base.is_empty() {
            return Ok((Vec::new(), None));
        }
        let search = InnerJoin::new(&self.planner, level, INNER_ZONES, None);
        let components = search.components(conjuncts, base)?;
        let order_streams = order.map(SortSpec::streams).unwrap_or_default();

        let mut rivers = Vec::with_capacity(components.len());
        let mut navigation = None;
        for component in components {
            let members: StreamSet = component.iter().copied().collect();
            let wanted = (!order_streams.is_empty() && order_streams.is_subset(&members))
                .then_some(order)
                .flatten();
            let join = InnerJoin::new(&self.planner, level, INNER_ZONES, wanted);
            let streams = join.find_order(conjuncts, &component)?;
            let (river, nav) = join.form_river(conjuncts, &streams)?;
            trace!(streams = %river.streams, cost = river.cost.total, "river formed");
            if navigation.is_none() {
                navigation = nav;
            }
            rivers.push(river);
        }
        Ok((rivers, navigation))
    }

    /// Build the river a bound plan hint asks for. Streams of rivers built
    /// before the search (derived tables and nested joins) bring the whole river
    /// along at their first mention.
    fn build_shape(
        &self,
        shape: &JoinShape,
        conjuncts: &mut ConjunctSet,
        level: &StreamSet,
        order: Option<&SortSpec>,
        prebuilt: &mut Vec<River>,
        claimed: &mut StreamSet,
    ) -> Result<Option<(River, Navigation)>> {
        let items = match shape {
            JoinShape::Stream(stream) => {
                if claimed.contains(*stream) {
                    return Ok(None);
                }
                if let Some(pos) = prebuilt.iter().position(|r| r.streams.contains(*stream)) {
                    let river = prebuilt.remove(pos);
                    claimed.union_with(&river.streams);
                    return Ok(Some((river, None)));
                }
                claimed.insert(*stream);
                let join = InnerJoin::new(&self.planner, level, INNER_ZONES, order);
                return join.form_river(conjuncts, &[*stream]).map(Some);
            }
            JoinShape::Join(items) | JoinShape::Hash(items) | JoinShape::Merge(items) => items,
        };

        if let JoinShape::Join(items) = shape {
            let streams: Option<Vec<StreamId>> = items
                .iter()
                .map(|i| match i {
                    JoinShape::Stream(s) if !claimed.contains(*s) && !prebuilt.iter().any(|r| r.streams.contains(*s)) => {
                        Some(*s)
                    }
                    _ => None,
                })
                .collect();
            if let Some(streams) = streams.filter(|s| !s.is_empty()) {
                claimed.extend(streams.iter().copied());
                let join = InnerJoin::new(&self.planner, level, INNER_ZONES, order);
                return join.form_river(conjuncts, &streams).map(Some);
            }
        }

        let mut rivers = Vec::with_capacity(items.len());
        let mut navigation = None;
        for (position, item) in items.iter().enumerate() {
            let wanted = if position == 0 { order } else { None };
            if let Some((river, nav)) = self.build_shape(item, conjuncts, level, wanted, prebuilt, claimed)? {
                if position == 0 {
                    navigation = nav;
                }
                rivers.push(river);
            }
        }
        if rivers.is_empty() {
            return Ok(None);
        }

        let river = match shape {
            JoinShape::Hash(_) | JoinShape::Merge(_) => {
                let method = if matches!(shape, JoinShape::Hash(_)) {
                    JoinMethod::Hash
                } else {
                    JoinMethod::Merge
                };
                let mut joined =
                    generate_equi_join(&self.planner, conjuncts, rivers, level, INNER_ZONES, Some(method))?;
                if joined.len() != 1 {
                    return Err(OptimizerError::PlanNotSatisfiable {
                        reason: format!("no equality joins every input of {:?} join", method),
                    });
                }
                navigation = None;
                joined.remove(0)
            }
            _ => {
                let first = navigation.as_ref().map(|(s, _)| *s);
                generate_cross_join(&self.planner, conjuncts, rivers, level, INNER_ZONES, first)?
            }
        };
        Ok(Some((river, navigation)))
    }

    fn outer_level(
        &mut self,
        spec: &QuerySpec,
        kind: JoinKind,
        parent: Vec<(BoolExpr, ConjunctOrigin)>,
        order: Option<&SortSpec>,
    ) -> Result<(River, Navigation)> {
        let [preserved, other] = spec.streams.as_slice() else {
            return Err(OptimizerError::Internal(format!(
                "outer join of {} inputs",
                spec.streams.len()
            )));
        };
        if let Some(plan) = &spec.plan {
            bind_plan(&mut self.planner, plan, &spec.level_streams())?;
        }
        let booleans: Vec<&BoolExpr> = spec.boolean.iter().collect();
        let mut conjuncts = self.conjunct_set(&booleans, parent)?;
        debug!(
            "Planning {:?} join: conjuncts={}",
            kind,
            conjuncts.len()
        );

        let preserved = self.side(preserved)?;
        let other = self.side(other)?;
        let (river, navigation) =
            generate_outer_join(&self.planner, &mut conjuncts, kind, preserved, other, order)?;
        self.placements.extend(conjuncts.take_placements());
        Ok((river, navigation))
    }

    fn side(&mut self, node: &StreamNode) -> Result<Side> {
        Ok(match node {
            StreamNode::Relation { stream, .. } | StreamNode::Procedure { stream, .. } => Side::Stream(*stream),
            StreamNode::Derived { stream, query, .. } => Side::River(self.derived_river(*stream, query)?),
            StreamNode::Join(sub) => Side::River(self.compile_query(sub, Vec::new())?),
        })
    }
}

/// Collect the streams and booleans of `spec`, merging nested inner joins that
/// neither shape rows, lock them, nor carry a plan of their own.
fn flatten<'s>(spec: &'s QuerySpec, nodes: &mut Vec<&'s StreamNode>, booleans: &mut Vec<&'s BoolExpr>) {
    booleans.extend(spec.boolean.iter());
    for node in &spec.streams {
        match node {
            StreamNode::Join(sub)
                if sub.join == JoinKind::Inner && !sub.has_row_shaping() && !sub.with_lock && sub.plan.is_none() =>
            {
                flatten(sub, nodes, booleans)
            }
            other => nodes.push(other),
        }
    }
}

/// Hand the unused conjuncts reading only streams of `sub` down to it. Below a
/// LEFT join those that read the null-extended side are marked missing.
fn hand_down(
    conjuncts: &mut ConjunctSet,
    sub: &QuerySpec,
    level: &StreamSet,
) -> Result<Vec<(BoolExpr, ConjunctOrigin)>> {
    if sub.join == JoinKind::Full {
        return Ok(Vec::new());
    }
    let streams = sub.level_streams();
    let preserved = sub
        .streams
        .first()
        .map(|node| {
            let mut set = StreamSet::new();
            node.collect_streams(&mut set);
            set
        })
        .unwrap_or_default();

    let ids: Vec<(usize, ConjunctOrigin)> = conjuncts
        .unused()
        .filter(|(_, c)| c.streams.intersects(&streams) && !c.streams.difference(&streams).intersects(level))
        .map(|(i, c)| {
            let origin = match c.origin {
                ConjunctOrigin::ParentMissing => ConjunctOrigin::ParentMissing,
                _ if sub.join == JoinKind::Left && c.streams.intersects(&streams.difference(&preserved)) => {
                    ConjunctOrigin::ParentMissing
                }
                _ => ConjunctOrigin::Parent,
            };
            (i, origin)
        })
        .collect();

    let mut handed = Vec::with_capacity(ids.len());
    for (i, origin) in ids {
        handed.push((conjuncts.hand_off(i)?, origin));
    }
    trace!(count = handed.len(), "conjuncts handed to nested join");
    Ok(handed)
}

/// The navigation the level delivered, if row order survived to `source`.
fn navigated(source: &RecordSource, navigation: &Navigation) -> Option<(StreamId, String)> {
    let (stream, index) = navigation.as_ref()?;
    source
        .navigation_of(*stream)
        .filter(|range| &range.index == index)
        .map(|_| (*stream, index.clone()))
}

fn literal_count(expr: &ValueExpr) -> Option<f64> {
    match expr {
        ValueExpr::Literal(ScalarValue::Int64(n)) => Some(*n as f64),
        _ => None,
    }
}
