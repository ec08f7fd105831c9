//! Capacity limits and sort datatype errors, reported as errors and never
//! truncated.

mod common;

use common::*;
use qplan_core::catalog::{FieldMeta, RelationMeta};
use qplan_core::config::OptimizerConfig;
use qplan_core::error::OptimizerError;
use qplan_core::expr::{BoolExpr, DataType, ValueExpr};
use qplan_core::plan::{ConjunctOrigin, RecordSource};
use qplan_core::query::{QuerySpec, SortSpec, StreamNode};

fn text(name: &str, length: u16) -> FieldMeta {
    FieldMeta {
        name: name.into(),
        data_type: DataType::Text {
            length,
            collated: false,
        },
    }
}

fn database() -> Database {
    let mut db = Database::new();
    db.int_table("T", &["ID", "V"], vec![], &[&[Some(1), Some(2)]]);
    let mut fields = int_fields(&["ID"]);
    fields.push(text("A", 40000));
    fields.push(text("B", 40000));
    fields.push(FieldMeta {
        name: "DOC".into(),
        data_type: DataType::Blob,
    });
    fields.push(text("NOTES", 1000));
    db.table(RelationMeta::table("WIDE", fields), vec![]);
    db
}

fn wide() -> QuerySpec {
    QuerySpec::inner(vec![StreamNode::relation(0, "WIDE")])
}

#[test]
fn test_too_many_conjuncts() {
    init_tracing();
    let db = database();
    let conjuncts: Vec<BoolExpr> = (0..1025).map(|i| eq(f(0, 0), ValueExpr::int(i))).collect();
    let spec = QuerySpec::inner(vec![StreamNode::relation(0, "T")]).with_boolean(BoolExpr::and(conjuncts));
    let err = db.optimizer().compile(&spec).unwrap_err();
    assert_eq!(err, OptimizerError::TooManyConjuncts { count: 1025, limit: 1024 });
}

#[test]
fn test_inference_stops_at_twice_the_limit() {
    let mut db = Database::new();
    let names = ["S0", "S1", "S2", "S3", "S4"];
    for name in names {
        db.int_table(name, &["ID"], vec![], &[&[Some(1)]]);
    }
    let config = OptimizerConfig {
        max_conjuncts: 4,
        ..OptimizerConfig::default()
    };
    // A chain of four equalities over five streams implies six more; only
    // four fit next to the base conjuncts.
    let streams = names
        .iter()
        .enumerate()
        .map(|(i, name)| StreamNode::relation(i as u32, *name))
        .collect();
    let chain = (0..4).map(|i| eq(f(i, 0), f(i + 1, 0))).collect();
    let spec = QuerySpec::inner(streams).with_boolean(BoolExpr::and(chain));
    let plan = db.optimizer_with(config).compile(&spec).unwrap();
    let derived = plan
        .placements
        .iter()
        .filter(|p| p.origin == ConjunctOrigin::BaseDerived)
        .count();
    assert_eq!(derived, 4);
    assert_eq!(canonical(&db.execute(&plan.root)), canonical(&db.naive(&spec)));
}

#[test]
fn test_sort_record_too_large() {
    let db = database();
    let spec = wide().with_sort(SortSpec::ascending(vec![f(0, 1), f(0, 2)]));
    let err = db.optimizer().compile(&spec).unwrap_err();
    assert!(
        matches!(err, OptimizerError::SortRecordTooLarge { limit: 65535, length } if length > 80000),
        "{:?}",
        err
    );
}

#[test]
fn test_blob_cannot_be_sorted() {
    let db = database();
    let spec = wide().with_sort(SortSpec::ascending(vec![f(0, 3)]));
    let err = db.optimizer().compile(&spec).unwrap_err();
    assert_eq!(
        err,
        OptimizerError::InvalidSortType {
            type_name: "BLOB".into()
        }
    );
    assert!(err.to_string().contains("BLOB"));
}

#[test]
fn test_wide_records_are_refetched_after_sorting() {
    let mut db = database();
    db.table(
        RelationMeta::table("NOTE", vec![int_fields(&["ID"]).remove(0), text("BODY", 1000)]),
        vec![],
    );
    let spec = QuerySpec::inner(vec![StreamNode::relation(0, "NOTE")]).with_sort(SortSpec::ascending(vec![f(0, 0)]));
    let plan = db.optimizer().compile(&spec).unwrap();
    let RecordSource::Refetch { input, .. } = &plan.root else {
        panic!("refetch expected, got {}", plan.root);
    };
    let RecordSource::Sort { map, .. } = input.as_ref() else {
        panic!("sort expected below the refetch");
    };
    assert!(map.refetch);
    assert!(map.record_length < 1000);
}

#[test]
fn test_config_from_json() {
    let config = OptimizerConfig::from_json(r#"{"max_conjuncts": 2, "hash_join_enabled": false}"#).unwrap();
    assert_eq!(config.max_conjuncts, 2);
    assert!(!config.hash_join_enabled);
    assert_eq!(config.max_sort_record, OptimizerConfig::default().max_sort_record);

    let db = database();
    let spec = QuerySpec::inner(vec![StreamNode::relation(0, "T")]).with_boolean(BoolExpr::and(vec![
        eq(f(0, 0), ValueExpr::int(1)),
        eq(f(0, 1), ValueExpr::int(2)),
        BoolExpr::IsNull(f(0, 0)),
    ]));
    let err = db.optimizer_with(config).compile(&spec).unwrap_err();
    assert_eq!(err, OptimizerError::TooManyConjuncts { count: 3, limit: 2 });

    assert!(matches!(
        OptimizerConfig::from_json("{\"max_conjuncts\": \"many\"}"),
        Err(OptimizerError::Internal(_))
    ));
}
