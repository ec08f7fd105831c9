//! Inner join planning end to end.
//!
//! A small star schema (a fact table with two dimensions, each reachable through
//! its primary key) and a pair of unindexed tables. The tests check the shape the
//! optimizer picks where the choice is clear-cut, that every conjunct is placed
//! exactly once, and that executing the plan returns what naive evaluation of
//! the query returns.

mod common;

use common::*;
use qplan_core::catalog::IndexDescriptor;
use qplan_core::config::OptimizerConfig;
use qplan_core::expr::{BoolExpr, ValueExpr};
use qplan_core::plan::{ConjunctOrigin, JoinType, RecordSource};
use qplan_core::query::{QuerySpec, StreamNode};
use qplan_optimizer::decompose::conjuncts_of;

fn database() -> Database {
    let mut db = Database::new();
    let fact: Vec<Vec<Option<i64>>> = (0..40).map(|i| vec![Some(i), Some(i % 4), Some(i % 5)]).collect();
    let fact: Vec<&[Option<i64>]> = fact.iter().map(|r| r.as_slice()).collect();
    db.int_table("FACT", &["ID", "D1", "D2"], vec![], &fact);
    // Dimensions are large enough for a key lookup to beat a scan.
    let dim1: Vec<Vec<Option<i64>>> = (0..8)
        .map(|i| vec![Some(i), Some(if i % 2 == 0 { 100 } else { 100 + i })])
        .collect();
    let dim1: Vec<&[Option<i64>]> = dim1.iter().map(|r| r.as_slice()).collect();
    db.int_table(
        "DIM1",
        &["ID", "NAME"],
        vec![IndexDescriptor::new(1, "PK_DIM1", &[0]).unique()],
        &dim1,
    );
    let dim2: Vec<Vec<Option<i64>>> = (0..20)
        .map(|i| vec![Some(i), if i == 3 { None } else { Some(200 + i) }])
        .collect();
    let dim2: Vec<&[Option<i64>]> = dim2.iter().map(|r| r.as_slice()).collect();
    db.int_table(
        "DIM2",
        &["ID", "NAME"],
        vec![IndexDescriptor::new(2, "PK_DIM2", &[0]).unique()],
        &dim2,
    );
    db.int_table(
        "L",
        &["K", "V"],
        vec![],
        &[&[Some(1), Some(1)], &[Some(2), Some(2)], &[None, Some(3)], &[Some(2), Some(4)]],
    );
    db.int_table(
        "R",
        &["K", "W"],
        vec![],
        &[&[Some(2), Some(20)], &[None, Some(30)], &[Some(5), Some(50)]],
    );
    db
}

fn star() -> QuerySpec {
    QuerySpec::inner(vec![
        StreamNode::relation(0, "FACT"),
        StreamNode::relation(1, "DIM1"),
        StreamNode::relation(2, "DIM2"),
    ])
    .with_boolean(BoolExpr::and(vec![
        eq(f(0, 1), f(1, 0)),
        eq(f(0, 2), f(2, 0)),
        eq(f(1, 1), ValueExpr::int(100)),
    ]))
}

#[test]
fn test_star_join_matches_naive_evaluation() {
    init_tracing();
    let db = database();
    let spec = star();
    let plan = db.optimizer().compile(&spec).unwrap();
    assert_eq!(canonical(&db.execute(&plan.root)), canonical(&db.naive(&spec)));
    // 40 fact rows, D1 in {0, 2} for half of them.
    assert_eq!(db.execute(&plan.root).len(), 20);
}

#[test]
fn test_every_conjunct_is_placed_once() {
    let db = database();
    let spec = star();
    let plan = db.optimizer().compile(&spec).unwrap();
    for conjunct in conjuncts_of(spec.boolean.as_ref().unwrap()) {
        let placed = plan
            .placements
            .iter()
            .filter(|p| p.conjunct == conjunct && p.origin == ConjunctOrigin::Base)
            .count();
        assert_eq!(placed, 1, "{} placed {} times", conjunct, placed);
    }
}

#[test]
fn test_dimension_reached_through_primary_key() {
    let db = database();
    let plan = db.optimizer().compile(&star()).unwrap();
    let text = plan.to_string();
    assert!(
        text.contains("DIM2 INDEX (PK_DIM2)"),
        "DIM2 should be looked up by key: {}",
        text
    );
}

#[test]
fn test_unindexed_equi_join_uses_hash_join() {
    let db = database();
    let spec = QuerySpec::inner(vec![StreamNode::relation(0, "L"), StreamNode::relation(1, "R")])
        .with_boolean(eq(f(0, 0), f(1, 0)));
    let plan = db.optimizer().compile(&spec).unwrap();
    assert!(
        matches!(plan.root, RecordSource::HashJoin { .. } | RecordSource::MergeJoin { .. }),
        "{}",
        plan
    );
    let rows = db.execute(&plan.root);
    // NULL keys never match under `=`.
    assert_eq!(rows.len(), 2);
    assert_eq!(canonical(&rows), canonical(&db.naive(&spec)));
}

#[test]
fn test_merge_join_when_hashing_is_disabled() {
    let db = database();
    let spec = QuerySpec::inner(vec![StreamNode::relation(0, "L"), StreamNode::relation(1, "R")])
        .with_boolean(eq(f(0, 0), f(1, 0)));
    let config = OptimizerConfig {
        hash_join_enabled: false,
        ..OptimizerConfig::default()
    };
    let plan = db.optimizer_with(config).compile(&spec).unwrap();
    assert!(matches!(plan.root, RecordSource::MergeJoin { .. }), "{}", plan);
    assert_eq!(canonical(&db.execute(&plan.root)), canonical(&db.naive(&spec)));
}

#[test]
fn test_unrelated_streams_are_cross_joined() {
    let db = database();
    let spec = QuerySpec::inner(vec![StreamNode::relation(0, "L"), StreamNode::relation(1, "R")]);
    let plan = db.optimizer().compile(&spec).unwrap();
    assert!(matches!(
        plan.root,
        RecordSource::NestedLoopJoin {
            kind: JoinType::Inner,
            ..
        }
    ));
    assert_eq!(db.execute(&plan.root).len(), 12);
}

#[test]
fn test_nested_inner_join_is_flattened() {
    let db = database();
    let nested = QuerySpec::inner(vec![StreamNode::relation(1, "DIM1"), StreamNode::relation(2, "DIM2")]);
    let spec = QuerySpec::inner(vec![StreamNode::relation(0, "FACT"), StreamNode::Join(Box::new(nested))])
        .with_boolean(star().boolean.unwrap());
    let plan = db.optimizer().compile(&spec).unwrap();
    assert_eq!(canonical(&db.execute(&plan.root)), canonical(&db.naive(&star())));
}

#[test]
fn test_first_inside_nested_inner_join() {
    let db = database();
    // Both L rows with K = 2 join R, and FIRST keeps one of them.
    let nested = QuerySpec::inner(vec![StreamNode::relation(0, "L"), StreamNode::relation(1, "R")])
        .with_boolean(eq(f(0, 0), f(1, 0)))
        .with_first(ValueExpr::int(1));
    let spec = QuerySpec::inner(vec![StreamNode::Join(Box::new(nested)), StreamNode::relation(2, "DIM1")])
        .with_boolean(BoolExpr::and(vec![eq(f(0, 0), f(2, 0)), eq(f(1, 1), ValueExpr::int(20))]));
    let plan = db.optimizer().compile(&spec).unwrap();

    assert_eq!(db.execute(&plan.root).len(), 1, "{}", plan);
    // The outer WHERE filters the picked row and is not pushed below FIRST.
    assert!(plan.placements.iter().all(|p| p.origin != ConjunctOrigin::Parent));
    let placed = plan
        .placements
        .iter()
        .filter(|p| p.conjunct == eq(f(1, 1), ValueExpr::int(20)))
        .count();
    assert_eq!(placed, 1);
}
