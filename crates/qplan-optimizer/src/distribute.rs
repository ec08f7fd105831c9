//! # Equality Distribution
//!
//! Infers extra conjuncts from equalities so that more of them can be matched
//! against indexes:
//!
//! 1. Fields connected by `=` conjuncts form equivalence classes (union-find). For
//!    every pair of fields in a class that is not already compared, `a = b` is added.
//! 2. A comparison between a class member and a value that does not depend on the
//!    level's streams (`a > 5`, `a = ?`, `a STARTING WITH 'x'`) is repeated for every
//!    other member of the class.
//!
//! Only `=` builds classes: it rejects NULLs, so every inferred conjunct holds
//! whenever the conjuncts it was inferred from hold. Fields are only unified when
//! their types belong to the same family, so no implicit conversion can change the
//! meaning of an inferred comparison. Conjuncts from the missing zone of an outer
//! join are never passed in.
//!
//! The number of inferred conjuncts is capped by the caller.

use qplan_core::expr::{BoolExpr, CompareOp, DataType, FieldRef, ValueExpr};
use qplan_core::stream::StreamSet;
use std::collections::HashSet;
use tracing::trace;

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new() -> Self {
        Self { parent: Vec::new() }
    }

    fn add(&mut self) -> usize {
        self.parent.push(self.parent.len());
        self.parent.len() - 1
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

fn slot_of(f: FieldRef, fields: &mut Vec<FieldRef>, uf: &mut UnionFind) -> usize {
    match fields.iter().position(|x| *x == f) {
        Some(i) => i,
        None => {
            fields.push(f);
            uf.add()
        }
    }
}

/// Classes of fields connected by `=`, in order of first appearance.
pub fn equivalence_classes(
    conjuncts: &[&BoolExpr],
    level: &StreamSet,
    field_type: &dyn Fn(&FieldRef) -> Option<DataType>,
) -> Vec<Vec<FieldRef>> {
    let mut fields: Vec<FieldRef> = Vec::new();
    let mut uf = UnionFind::new();
    for conjunct in conjuncts {
        let BoolExpr::Compare {
            op: CompareOp::Eq,
            left: ValueExpr::Field(a),
            right: ValueExpr::Field(b),
            extra: None,
        } = conjunct
        else {
            continue;
        };
        if a == b || !level.contains(a.stream) || !level.contains(b.stream) {
            continue;
        }
        let family = |f: &FieldRef| field_type(f).map(|t| t.family());
        if family(a) != family(b) {
            continue;
        }
        let ia = slot_of(*a, &mut fields, &mut uf);
        let ib = slot_of(*b, &mut fields, &mut uf);
        uf.union(ia, ib);
    }

    let mut classes: Vec<(usize, Vec<FieldRef>)> = Vec::new();
    for i in 0..fields.len() {
        let root = uf.find(i);
        match classes.iter_mut().find(|(r, _)| *r == root) {
            Some((_, members)) => members.push(fields[i]),
            None => classes.push((root, vec![fields[i]])),
        }
    }
    classes.into_iter().map(|(_, members)| members).collect()
}

/// Record an inferred conjunct unless already known; false once the cap is hit.
fn add_derived(
    expr: BoolExpr,
    known: &mut HashSet<BoolExpr>,
    derived: &mut Vec<BoolExpr>,
    limit: usize,
) -> bool {
    if derived.len() >= limit {
        return false;
    }
    if known.insert(expr.clone()) {
        trace!(conjunct = %expr, "inferred conjunct");
        derived.push(expr);
    }
    true
}

fn propagatable(op: CompareOp) -> bool {
    matches!(
        op,
        CompareOp::Eq | CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge | CompareOp::Starting
    )
}

/// Conjuncts implied by `conjuncts`, at most `limit` of them, none of which is
/// already present.
pub fn distribute_equalities(
    conjuncts: &[&BoolExpr],
    level: &StreamSet,
    field_type: &dyn Fn(&FieldRef) -> Option<DataType>,
    limit: usize,
) -> Vec<BoolExpr> {
    let classes = equivalence_classes(conjuncts, level, field_type);
    let mut known: HashSet<BoolExpr> = conjuncts.iter().map(|c| (*c).clone()).collect();
    let mut derived = Vec::new();
    for class in &classes {
        for (i, a) in class.iter().enumerate() {
            for b in &class[i + 1..] {
                let reversed = BoolExpr::equal(ValueExpr::Field(*b), ValueExpr::Field(*a));
                if known.contains(&reversed) {
                    continue;
                }
                let expr = BoolExpr::equal(ValueExpr::Field(*a), ValueExpr::Field(*b));
                if !add_derived(expr, &mut known, &mut derived, limit) {
                    return derived;
                }
            }
        }
    }

    for conjunct in conjuncts {
        let BoolExpr::Compare {
            op,
            left,
            right,
            extra: None,
        } = conjunct
        else {
            continue;
        };
        if !propagatable(*op) {
            continue;
        }
        let (field, value, field_left) = match (left, right) {
            (ValueExpr::Field(f), other) => (f, other, true),
            (other, ValueExpr::Field(f)) => (f, other, false),
            _ => continue,
        };
        if value.streams().intersects(level) || value.is_volatile() {
            continue;
        }
        let Some(class) = classes.iter().find(|c| c.contains(field)) else {
            continue;
        };
        for other in class.iter().filter(|g| *g != field) {
            let expr = if field_left {
                BoolExpr::compare(*op, ValueExpr::Field(*other), value.clone())
            } else {
                BoolExpr::compare(*op, value.clone(), ValueExpr::Field(*other))
            };
            if !add_derived(expr, &mut known, &mut derived, limit) {
                return derived;
            }
        }
    }
    derived
}
