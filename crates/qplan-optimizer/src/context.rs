//! # Compile Context
//!
//! `Planner` carries everything one compile needs besides the conjuncts of the
//! level being planned: the catalog, configuration, cost model and cancellation
//! flag, plus the per-stream compile state.
//!
//! Every stream of the statement (all levels, nested joins and derived tables
//! included) is registered once, before planning starts. Registration resolves
//! relations against the catalog, so an unknown relation fails the compile before
//! any planning work is done.

use qplan_core::catalog::{Catalog, RelationKind, RelationMeta};
use qplan_core::config::{CancelFlag, OptimizerConfig};
use qplan_core::cost::CostModel;
use qplan_core::error::{OptimizerError, Result};
use qplan_core::expr::{DataType, FieldRef, ValueExpr};
use qplan_core::plan::{PlanDecision, RecordSource, StreamScan};
use qplan_core::query::{AccessHint, QuerySpec, StreamNode};
use qplan_core::stats::{relation_cardinality, DEFAULT_CARDINALITY, DEFAULT_PROCEDURE_CARDINALITY};
use qplan_core::stream::{StreamId, StreamSet};
use std::collections::HashMap;

/// What a stream reads.
#[derive(Debug, Clone)]
pub enum StreamSource {
    Relation(RelationMeta),
    Procedure { name: String, inputs: Vec<ValueExpr> },
    /// Field `i` is `output[i]` of the derived query.
    Derived { output: Vec<ValueExpr> },
}

/// Compile state of one stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub id: StreamId,
    /// Name used in plans and plan hints.
    pub alias: String,
    pub source: StreamSource,
    /// Estimated rows before any filtering.
    pub cardinality: f64,
    /// Access method requested by a bound plan hint.
    pub access: Option<AccessHint>,
}

impl StreamInfo {
    pub fn relation(&self) -> Option<&RelationMeta> {
        match &self.source {
            StreamSource::Relation(rel) => Some(rel),
            _ => None,
        }
    }

    /// Persistent table with indexes and record keys.
    pub fn is_table(&self) -> bool {
        matches!(self.relation(), Some(rel) if rel.kind == RelationKind::Table)
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.source, StreamSource::Derived { .. })
    }

    pub fn object_name(&self) -> &str {
        match &self.source {
            StreamSource::Relation(rel) => &rel.name,
            StreamSource::Procedure { name, .. } => name,
            StreamSource::Derived { .. } => &self.alias,
        }
    }

    pub fn scan(&self) -> StreamScan {
        StreamScan {
            stream: self.id,
            relation: self.object_name().to_string(),
            alias: self.alias.clone(),
        }
    }

    /// Streams that must be active before this one can be read.
    pub fn dependencies(&self) -> StreamSet {
        let mut set = StreamSet::new();
        if let StreamSource::Procedure { inputs, .. } = &self.source {
            for input in inputs {
                input.collect_streams(&mut set);
            }
        }
        set
    }

    /// Sequential read of the stream without index use.
    pub fn full_scan(&self) -> Result<RecordSource> {
        let scan = self.scan();
        Ok(match &self.source {
            StreamSource::Relation(rel) => match rel.kind {
                RelationKind::Table => RecordSource::FullScan(scan),
                RelationKind::Virtual => RecordSource::VirtualScan(scan),
                RelationKind::External => RecordSource::ExternalScan(scan),
            },
            StreamSource::Procedure { inputs, .. } => RecordSource::ProcedureScan {
                scan,
                inputs: inputs.clone(),
            },
            StreamSource::Derived { .. } => {
                return Err(OptimizerError::Internal(format!(
                    "derived stream {} has no scan of its own",
                    self.alias
                )))
            }
        })
    }
}

/// State shared by every planning step of one compile.
pub struct Planner<'a> {
    pub catalog: &'a dyn Catalog,
    pub config: &'a OptimizerConfig,
    pub cost_model: &'a dyn CostModel,
    cancel: &'a CancelFlag,
    streams: HashMap<StreamId, StreamInfo>,
    pub decisions: Vec<PlanDecision>,
}

impl<'a> Planner<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        config: &'a OptimizerConfig,
        cost_model: &'a dyn CostModel,
        cancel: &'a CancelFlag,
    ) -> Self {
        Self {
            catalog,
            config,
            cost_model,
            cancel,
            streams: HashMap::new(),
            decisions: Vec::new(),
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    /// Register every stream of `spec` and of the levels nested in it.
    pub fn register(&mut self, spec: &QuerySpec) -> Result<()> {
        for node in &spec.streams {
            match node {
                StreamNode::Relation {
                    stream,
                    relation,
                    alias,
                } => {
                    let meta = self
                        .catalog
                        .relation(relation)
                        .ok_or_else(|| OptimizerError::UnknownRelation {
                            relation: relation.clone(),
                        })?;
                    let cardinality = relation_cardinality(&meta);
                    self.insert(StreamInfo {
                        id: *stream,
                        alias: alias.clone().unwrap_or_else(|| meta.name.clone()),
                        source: StreamSource::Relation(meta),
                        cardinality,
                        access: None,
                    })?;
                }
                StreamNode::Procedure {
                    stream,
                    procedure,
                    alias,
                    inputs,
                } => {
                    let cardinality = self
                        .catalog
                        .procedure_cardinality(procedure)
                        .unwrap_or(DEFAULT_PROCEDURE_CARDINALITY);
                    self.insert(StreamInfo {
                        id: *stream,
                        alias: alias.clone().unwrap_or_else(|| procedure.clone()),
                        source: StreamSource::Procedure {
                            name: procedure.clone(),
                            inputs: inputs.clone(),
                        },
                        cardinality,
                        access: None,
                    })?;
                }
                StreamNode::Derived {
                    stream,
                    alias,
                    query,
                } => {
                    self.register(query)?;
                    self.insert(StreamInfo {
                        id: *stream,
                        alias: alias.clone().unwrap_or_else(|| format!("DT{}", stream.0)),
                        source: StreamSource::Derived {
                            output: query.select.clone(),
                        },
                        cardinality: DEFAULT_CARDINALITY,
                        access: None,
                    })?;
                }
                StreamNode::Join(sub) => self.register(sub)?,
            }
        }
        Ok(())
    }

    fn insert(&mut self, info: StreamInfo) -> Result<()> {
        if self.streams.contains_key(&info.id) {
            return Err(OptimizerError::Internal(format!(
                "stream {} registered twice",
                info.id
            )));
        }
        self.streams.insert(info.id, info);
        Ok(())
    }

    pub fn stream(&self, id: StreamId) -> Result<&StreamInfo> {
        self.streams
            .get(&id)
            .ok_or_else(|| OptimizerError::Internal(format!("unknown stream {}", id)))
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Result<&mut StreamInfo> {
        self.streams
            .get_mut(&id)
            .ok_or_else(|| OptimizerError::Internal(format!("unknown stream {}", id)))
    }

    /// Type of a field; derived fields resolve through the derived query.
    pub fn field_type(&self, field: &FieldRef) -> Option<DataType> {
        let info = self.streams.get(&field.stream)?;
        match &info.source {
            StreamSource::Relation(rel) => rel.field_type(field.field),
            StreamSource::Procedure { .. } => None,
            StreamSource::Derived { output } => output
                .get(field.field as usize)?
                .data_type(&|f: &FieldRef| self.field_type(f)),
        }
    }

    pub fn expr_type(&self, expr: &ValueExpr) -> Option<DataType> {
        expr.data_type(&|f: &FieldRef| self.field_type(f))
    }

    /// Whether every stream of `streams` reads a persistent table.
    pub fn all_tables(&self, streams: &StreamSet) -> bool {
        streams
            .iter()
            .all(|s| self.streams.get(&s).map_or(false, |i| i.is_table()))
    }

    pub fn record(&mut self, decision: PlanDecision) {
        tracing::trace!(?decision, "plan decision");
        self.decisions.push(decision);
    }
}
