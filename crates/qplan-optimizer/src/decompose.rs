//! # Conjunct Decomposition
//!
//! Turns an arbitrary boolean tree into the flat list of conjuncts the planner
//! works on:
//!
//! - nested `AND`s are flattened;
//! - `x BETWEEN a AND b` becomes `x >= a` and `x <= b`, so each bound can match an
//!   index on its own;
//! - `x LIKE 'abc%'` (and `SIMILAR TO`) with a literal prefix free of wildcards adds a
//!   derived `x STARTING WITH 'abc'` ahead of the original, which still enforces the
//!   full pattern;
//! - an `OR` whose branches share conjuncts is factored:
//!   `(a AND b) OR (a AND c)` yields `a` and `b OR c`. When a branch consists only of
//!   shared conjuncts the remaining `OR` is implied and dropped.

use qplan_core::expr::{BoolExpr, CompareOp, ScalarValue, ValueExpr};

/// Append the conjuncts of `expr` to `out`.
pub fn decompose(expr: &BoolExpr, out: &mut Vec<BoolExpr>) {
    match expr {
        BoolExpr::And(terms) => {
            for term in terms {
                decompose(term, out);
            }
        }
        BoolExpr::Compare {
            op: CompareOp::Between,
            left,
            right,
            extra: Some(high),
        } => {
            out.push(BoolExpr::compare(CompareOp::Ge, left.clone(), right.clone()));
            out.push(BoolExpr::compare(CompareOp::Le, left.clone(), high.clone()));
        }
        BoolExpr::Compare {
            op: op @ (CompareOp::Like | CompareOp::Similar),
            left,
            right: ValueExpr::Literal(ScalarValue::Utf8(pattern)),
            extra,
        } => {
            let escape = match extra {
                Some(ValueExpr::Literal(ScalarValue::Utf8(e))) => e.chars().next(),
                Some(_) => {
                    // Escape character only known at run time.
                    out.push(expr.clone());
                    return;
                }
                None => None,
            };
            if let Some(prefix) = literal_prefix(pattern, escape, *op == CompareOp::Similar) {
                out.push(BoolExpr::compare(
                    CompareOp::Starting,
                    left.clone(),
                    ValueExpr::text(prefix),
                ));
            }
            out.push(expr.clone());
        }
        BoolExpr::Or(terms) => decompose_or(terms, out),
        other => out.push(other.clone()),
    }
}

/// Convenience wrapper returning a fresh list.
pub fn conjuncts_of(expr: &BoolExpr) -> Vec<BoolExpr> {
    let mut out = Vec::new();
    decompose(expr, &mut out);
    out
}

fn flatten_or<'a>(terms: &'a [BoolExpr], out: &mut Vec<&'a BoolExpr>) {
    for term in terms {
        match term {
            BoolExpr::Or(inner) => flatten_or(inner, out),
            other => out.push(other),
        }
    }
}

fn decompose_or(terms: &[BoolExpr], out: &mut Vec<BoolExpr>) {
    let mut alternatives = Vec::new();
    flatten_or(terms, &mut alternatives);
    if alternatives.is_empty() {
        // A disjunction of nothing is false.
        out.push(BoolExpr::Constant(false));
        return;
    }
    if alternatives.len() == 1 {
        decompose(alternatives[0], out);
        return;
    }

    let branches: Vec<Vec<BoolExpr>> = alternatives.iter().map(|b| conjuncts_of(b)).collect();
    let mut common: Vec<BoolExpr> = Vec::new();
    for candidate in &branches[0] {
        if !common.contains(candidate) && branches[1..].iter().all(|b| b.contains(candidate)) {
            common.push(candidate.clone());
        }
    }

    if common.is_empty() {
        out.push(BoolExpr::Or(
            branches.into_iter().map(BoolExpr::and).collect(),
        ));
        return;
    }

    let remainders: Vec<Vec<BoolExpr>> = branches
        .into_iter()
        .map(|b| b.into_iter().filter(|c| !common.contains(c)).collect())
        .collect();
    out.extend(common);
    if remainders.iter().any(|r| r.is_empty()) {
        return;
    }
    out.push(BoolExpr::Or(remainders.into_iter().map(BoolExpr::and).collect()));
}

/// Leading characters of a pattern that match literally, if there are any.
fn literal_prefix(pattern: &str, escape: Option<char>, similar: bool) -> Option<String> {
    let mut prefix = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            match chars.next() {
                Some(escaped) => prefix.push(escaped),
                None => break,
            }
            continue;
        }
        let special = if similar {
            matches!(
                c,
                '%' | '_' | '[' | ']' | '(' | ')' | '|' | '^' | '-' | '+' | '*' | '?' | '{' | '}'
            )
        } else {
            matches!(c, '%' | '_')
        };
        if special {
            break;
        }
        prefix.push(c);
    }
    if prefix.is_empty() {
        None
    } else {
        Some(prefix)
    }
}
