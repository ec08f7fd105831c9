//! Binding of user plan hints.
//!
//! A `PlanHint` names streams by alias (case-insensitively). Binding resolves
//! every name against the streams of the level, stores each stream's access hint
//! on its compile state, and returns the join structure with names replaced by
//! stream ids. Every stream of the level must appear exactly once.

use crate::context::Planner;
use qplan_core::error::{OptimizerError, Result};
use qplan_core::query::{AccessHint, PlanHint};
use qplan_core::stream::{StreamId, StreamSet};
use tracing::trace;

/// Join structure requested by a bound plan hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinShape {
    Stream(StreamId),
    /// Nested loops in the listed order.
    Join(Vec<JoinShape>),
    Hash(Vec<JoinShape>),
    Merge(Vec<JoinShape>),
}

impl JoinShape {
    pub fn streams(&self) -> StreamSet {
        let mut set = StreamSet::new();
        self.collect_streams(&mut set);
        set
    }

    fn collect_streams(&self, out: &mut StreamSet) {
        match self {
            JoinShape::Stream(s) => {
                out.insert(*s);
            }
            JoinShape::Join(items) | JoinShape::Hash(items) | JoinShape::Merge(items) => {
                for item in items {
                    item.collect_streams(out);
                }
            }
        }
    }
}

/// Bind `plan` against the streams of a level.
pub fn bind_plan(planner: &mut Planner<'_>, plan: &PlanHint, level: &StreamSet) -> Result<JoinShape> {
    let mut seen = StreamSet::new();
    let shape = bind(planner, plan, level, &mut seen)?;
    for stream in level.iter() {
        if !seen.contains(stream) {
            return Err(OptimizerError::StreamNotInPlan {
                name: planner.stream(stream)?.alias.clone(),
            });
        }
    }
    trace!(plan = %plan, "plan bound");
    Ok(shape)
}

fn bind_all(
    planner: &mut Planner<'_>,
    items: &[PlanHint],
    level: &StreamSet,
    seen: &mut StreamSet,
) -> Result<Vec<JoinShape>> {
    items.iter().map(|i| bind(planner, i, level, seen)).collect()
}

fn bind(planner: &mut Planner<'_>, plan: &PlanHint, level: &StreamSet, seen: &mut StreamSet) -> Result<JoinShape> {
    Ok(match plan {
        PlanHint::Sort(inner) => bind(planner, inner, level, seen)?,
        PlanHint::Join(items) => JoinShape::Join(bind_all(planner, items, level, seen)?),
        PlanHint::Hash(items) => JoinShape::Hash(bind_all(planner, items, level, seen)?),
        PlanHint::Merge(items) => JoinShape::Merge(bind_all(planner, items, level, seen)?),
        PlanHint::Stream { alias, access } => {
            let mut found = None;
            for stream in level.iter() {
                if planner.stream(stream)?.alias.eq_ignore_ascii_case(alias) {
                    found = Some(stream);
                    break;
                }
            }
            let stream = found.ok_or_else(|| OptimizerError::StreamNotFound { name: alias.clone() })?;
            if !seen.insert(stream) {
                return Err(OptimizerError::PlanNotSatisfiable {
                    reason: format!("{} appears more than once in the plan", alias),
                });
            }
            let info = planner.stream_mut(stream)?;
            if info.is_derived() && *access != AccessHint::Natural {
                return Err(OptimizerError::PlanNotSatisfiable {
                    reason: format!("derived table {} has no indexes", alias),
                });
            }
            info.access = Some(access.clone());
            JoinShape::Stream(stream)
        }
    })
}
