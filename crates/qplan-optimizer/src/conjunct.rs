//! # Conjunct Bookkeeping
//!
//! A query level's predicate is planned as a flat list of conjuncts. Each slot
//! records where the conjunct came from (`ConjunctOrigin`), the streams it
//! references, and whether it has been consumed by some plan-construction step.
//! A conjunct is consumed at most once; later steps skip it.
//!
//! Consuming a conjunct also records its `Placement`, so that the finished plan can
//! account for every conjunct of the level.
//!
//! ## Capacity
//!
//! A level never holds more than `2 * max_conjuncts` slots. Exceeding that is the
//! "optimizer block exceeded" condition and fails the compile.

use qplan_core::error::{OptimizerError, Result};
use qplan_core::expr::BoolExpr;
use qplan_core::plan::{ConjunctOrigin, ConjunctPlacement, Placement};
use qplan_core::stream::StreamSet;

#[derive(Debug, Clone)]
pub struct Conjunct {
    pub expr: BoolExpr,
    pub origin: ConjunctOrigin,
    pub streams: StreamSet,
    pub used: bool,
}

impl Conjunct {
    /// Usable for inference, index matching and join keys. Conjuncts over the
    /// null-extended side of an enclosing outer join are only ever filters.
    pub fn is_distributable(&self) -> bool {
        self.origin != ConjunctOrigin::ParentMissing
    }
}

#[derive(Debug, Clone)]
pub struct ConjunctSet {
    items: Vec<Conjunct>,
    max_conjuncts: usize,
    placements: Vec<ConjunctPlacement>,
}

impl ConjunctSet {
    pub fn new(max_conjuncts: usize) -> Self {
        Self {
            items: Vec::new(),
            max_conjuncts,
            placements: Vec::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.max_conjuncts.saturating_mul(2)
    }

    pub fn push(&mut self, expr: BoolExpr, origin: ConjunctOrigin) -> Result<usize> {
        if self.items.len() >= self.limit() {
            return Err(OptimizerError::TooManyConjuncts {
                count: self.items.len() + 1,
                limit: self.limit(),
            });
        }
        let streams = expr.streams();
        self.items.push(Conjunct {
            expr,
            origin,
            streams,
            used: false,
        });
        Ok(self.items.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> &Conjunct {
        &self.items[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Conjunct)> {
        self.items.iter().enumerate()
    }

    pub fn unused(&self) -> impl Iterator<Item = (usize, &Conjunct)> {
        self.iter().filter(|(_, c)| !c.used)
    }

    pub fn count_origin(&self, origin: ConjunctOrigin) -> usize {
        self.items.iter().filter(|c| c.origin == origin).count()
    }

    pub fn contains(&self, expr: &BoolExpr) -> bool {
        self.items.iter().any(|c| &c.expr == expr)
    }

    /// Mark a conjunct consumed and record where it went.
    pub fn consume(&mut self, index: usize, placement: Placement) -> Result<()> {
        let Some(conjunct) = self.items.get_mut(index) else {
            return Err(OptimizerError::Internal(format!("no conjunct #{}", index)));
        };
        debug_assert!(!conjunct.used, "conjunct {} consumed twice", conjunct.expr);
        if conjunct.used {
            return Err(OptimizerError::Internal(format!(
                "conjunct {} consumed twice",
                conjunct.expr
            )));
        }
        conjunct.used = true;
        self.placements.push(ConjunctPlacement {
            conjunct: conjunct.expr.clone(),
            origin: conjunct.origin,
            placement,
            cloned: false,
        });
        Ok(())
    }

    /// Mark a conjunct consumed by a nested level, which records its placement.
    pub fn hand_off(&mut self, index: usize) -> Result<BoolExpr> {
        let Some(conjunct) = self.items.get_mut(index) else {
            return Err(OptimizerError::Internal(format!("no conjunct #{}", index)));
        };
        if conjunct.used {
            return Err(OptimizerError::Internal(format!(
                "conjunct {} handed off after use",
                conjunct.expr
            )));
        }
        conjunct.used = true;
        Ok(conjunct.expr.clone())
    }

    /// Take over the placements of `copy`, a clone of this set planned separately,
    /// as placements of fresh copies of the conjuncts.
    pub fn absorb_clones(&mut self, mut copy: ConjunctSet) {
        for mut placement in copy.take_placements() {
            placement.cloned = true;
            self.placements.push(placement);
        }
    }

    pub fn take_placements(&mut self) -> Vec<ConjunctPlacement> {
        std::mem::take(&mut self.placements)
    }
}
