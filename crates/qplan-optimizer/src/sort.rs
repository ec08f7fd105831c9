//! # Sorts
//!
//! Two steps deal with ordering.
//!
//! `check_sorts` runs before a query is planned and removes sorts that another
//! clause already provides. It returns a rewritten copy of the query together
//! with one `PlanDecision` per rewrite, leaving the caller's query untouched:
//!
//! - a DISTINCT whose key covers every grouping expression is dropped;
//! - when no DISTINCT remains, an ORDER BY over grouping expressions is folded
//!   into GROUP BY, whose key is reordered to lead with the sort items (direction
//!   and NULL placement included);
//! - an ORDER BY over DISTINCT expressions is folded into the DISTINCT key;
//! - an ORDER BY of a level reading a single derived table moves into the derived
//!   query when that query does not shape its own rows.
//!
//! `generate_sort` lays out the sort record for a sort that remains. Every sort
//! item becomes two key slots, a NULL flag byte then the value key. The record
//! then carries the values needed above the sort. Fields that are also sort keys
//! are restored from the key instead of being stored twice, except collated text
//! whose key cannot be turned back into the value. When the stored values exceed
//! the refetch threshold and every sorted stream is a table, the record carries
//! record keys instead and a `Refetch` re-reads the rows after sorting.

use crate::context::{Planner, StreamSource};
use qplan_core::error::{OptimizerError, Result};
use qplan_core::expr::{DataType, FieldRef, ValueExpr};
use qplan_core::plan::{PlanDecision, RecordSource, SortKey, SortKeyKind, SortMap, SortMapItem, SortValue};
use qplan_core::query::{QuerySpec, SortItem, SortSpec, StreamNode};
use qplan_core::stream::StreamSet;
use tracing::trace;

const NULL_FLAG_LENGTH: usize = 1;
const DB_KEY_LENGTH: usize = 8;
const TXN_NUMBER_LENGTH: usize = 8;

/// `key` reordered to start with the items of `sort`, or `None` when `sort`
/// uses an expression `key` lacks.
fn lead_with(key: &SortSpec, sort: &SortSpec) -> Option<SortSpec> {
    if sort.len() > key.len() || !sort.exprs().all(|e| key.contains_expr(e)) {
        return None;
    }
    let mut items: Vec<SortItem> = sort.items.clone();
    items.extend(key.items.iter().filter(|i| !sort.contains_expr(&i.expr)).cloned());
    Some(SortSpec::new(items))
}

/// Sort of the outer level restated over the derived query's output.
fn map_into_derived(sort: &SortSpec, node: &StreamNode) -> Option<SortSpec> {
    let StreamNode::Derived { stream, query, .. } = node else {
        return None;
    };
    if query.has_row_shaping() {
        return None;
    }
    let items = sort
        .items
        .iter()
        .map(|item| {
            let field = item.expr.as_field().filter(|f| f.stream == *stream)?;
            let expr = query.select.get(field.field as usize)?.clone();
            Some(SortItem { expr, ..item.clone() })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(SortSpec::new(items))
}

/// Remove sorts made redundant by GROUP BY, DISTINCT or a derived table.
pub fn check_sorts(spec: &QuerySpec) -> (QuerySpec, Vec<PlanDecision>) {
    let mut spec = spec.clone();
    let mut decisions = Vec::new();

    if let (Some(distinct), Some(group)) = (&spec.distinct, &spec.group) {
        if group.exprs().all(|e| distinct.contains_expr(e)) {
            spec.distinct = None;
            decisions.push(PlanDecision::DistinctDroppedByGroup);
        }
    }

    // A DISTINCT above the group re-sorts the rows, so only its key can carry
    // the requested order.
    if spec.distinct.is_none() {
        if let (Some(sort), Some(group)) = (&spec.sort, &spec.group) {
            if let Some(group) = lead_with(group, sort) {
                spec.group = Some(group);
                spec.sort = None;
                decisions.push(PlanDecision::SortMergedIntoGroup);
            }
        }
    }

    if let (Some(sort), Some(distinct)) = (&spec.sort, &spec.distinct) {
        if let Some(distinct) = lead_with(distinct, sort) {
            spec.distinct = Some(distinct);
            spec.sort = None;
            decisions.push(PlanDecision::SortMergedIntoDistinct);
        }
    }

    if spec.group.is_none() && spec.distinct.is_none() && spec.streams.len() == 1 {
        if let Some(pushed) = spec.sort.as_ref().and_then(|s| map_into_derived(s, &spec.streams[0])) {
            if let StreamNode::Derived { stream, query, .. } = &mut spec.streams[0] {
                query.sort = Some(pushed);
                decisions.push(PlanDecision::SortPushedIntoDerived { stream: *stream });
                spec.sort = None;
            }
        }
    }

    for decision in &decisions {
        trace!(?decision, "sort rewritten");
    }
    (spec, decisions)
}

// Untyped values (procedure outputs) are sized as BIGINT.
fn sized_type(planner: &Planner<'_>, expr: &ValueExpr) -> DataType {
    planner.expr_type(expr).unwrap_or(DataType::Int64)
}

/// Lay out the sort record for sorting `streams` by `order` while carrying
/// `carried` through the sort.
pub fn generate_sort(
    planner: &Planner<'_>,
    streams: &StreamSet,
    order: &SortSpec,
    carried: &[ValueExpr],
    unique: bool,
) -> Result<SortMap> {
    let mut keys = Vec::with_capacity(order.len() * 2);
    let mut offset = 0;
    // Value key slot of each sort item, restorable or not.
    let mut value_keys: Vec<(usize, bool)> = Vec::with_capacity(order.len());
    for (i, item) in order.items.iter().enumerate() {
        let data_type = sized_type(planner, &item.expr);
        let length = data_type
            .sort_key_length()
            .ok_or_else(|| OptimizerError::InvalidSortType {
                type_name: data_type.name().to_string(),
            })?;
        keys.push(SortKey {
            item: i,
            kind: SortKeyKind::NullFlag {
                nulls_first: item.nulls_first(),
            },
            offset,
            length: NULL_FLAG_LENGTH,
            descending: false,
        });
        offset += NULL_FLAG_LENGTH;
        let restorable = !matches!(data_type, DataType::Text { collated: true, .. });
        value_keys.push((keys.len(), restorable));
        keys.push(SortKey {
            item: i,
            kind: SortKeyKind::Value { data_type },
            offset,
            length,
            descending: item.descending,
        });
        offset += length;
    }
    let key_length = offset;

    let mut restored = Vec::new();
    let mut stored = Vec::new();
    let mut volatile = Vec::new();
    for item in &order.items {
        if item.expr.is_volatile() && !volatile.contains(&item.expr) {
            volatile.push(item.expr.clone());
        }
    }
    let mut seen: Vec<&ValueExpr> = Vec::new();
    for value in carried {
        if seen.contains(&value) {
            continue;
        }
        seen.push(value);
        match value {
            ValueExpr::Field(field) => {
                let key = order
                    .items
                    .iter()
                    .position(|i| &i.expr == value)
                    .map(|pos| value_keys[pos])
                    .filter(|(_, restorable)| *restorable);
                match key {
                    Some((slot, _)) => restored.push(SortMapItem {
                        value: SortValue::Field(*field),
                        offset: keys[slot].offset,
                        length: 0,
                        from_key: Some(slot),
                    }),
                    None => stored.push((
                        SortValue::Field(*field),
                        sized_type(planner, value).value_length() + NULL_FLAG_LENGTH,
                    )),
                }
            }
            other if other.is_volatile() && !volatile.contains(other) => volatile.push(other.clone()),
            _ => {}
        }
    }
    let volatile: Vec<(SortValue, usize)> = volatile
        .into_iter()
        .map(|expr| {
            let length = sized_type(planner, &expr).value_length() + NULL_FLAG_LENGTH;
            (SortValue::Expression(expr), length)
        })
        .collect();

    let stored_length: usize = stored.iter().map(|(_, l)| l).sum();
    let refetch = stored_length > planner.config.refetch_threshold
        && !streams.is_empty()
        && planner.all_tables(streams);
    if refetch {
        stored = streams
            .iter()
            .flat_map(|s| {
                [
                    (SortValue::DbKey(s), DB_KEY_LENGTH),
                    (SortValue::TxnNumber(s), TXN_NUMBER_LENGTH),
                ]
            })
            .collect();
    }

    let mut items = restored;
    for (value, length) in stored.into_iter().chain(volatile) {
        items.push(SortMapItem {
            value,
            offset,
            length,
            from_key: None,
        });
        offset += length;
    }
    let record_length = offset;
    if record_length > planner.config.max_sort_record {
        return Err(OptimizerError::SortRecordTooLarge {
            length: record_length,
            limit: planner.config.max_sort_record,
        });
    }
    trace!(key_length, record_length, refetch, unique, "sort map generated");
    Ok(SortMap {
        order: order.items.clone(),
        keys,
        items,
        key_length,
        record_length,
        unique,
        refetch,
    })
}

/// Fields of `streams` and the values of `extra`, the values a sort above
/// those streams has to carry.
fn carried_values(planner: &Planner<'_>, streams: &StreamSet, extra: &[ValueExpr]) -> Result<Vec<ValueExpr>> {
    let mut values = Vec::new();
    for stream in streams.iter() {
        let info = planner.stream(stream)?;
        let count = match &info.source {
            StreamSource::Relation(rel) => rel.fields.len(),
            StreamSource::Derived { output } => output.len(),
            StreamSource::Procedure { .. } => 0,
        };
        values.extend((0..count).map(|i| ValueExpr::field(stream, i as u16)));
    }
    for expr in extra {
        if expr.is_volatile() {
            values.push(expr.clone());
            continue;
        }
        let mut fields: Vec<FieldRef> = Vec::new();
        expr.collect_fields(&mut fields);
        values.extend(
            fields
                .into_iter()
                .filter(|f| streams.contains(f.stream))
                .map(ValueExpr::Field),
        );
    }
    Ok(values)
}

/// Sort `input` over `streams` by `order`, carrying every value read from those
/// streams plus `extra`. Adds a refetch when the sort map calls for one.
pub fn sort_river(
    planner: &Planner<'_>,
    input: RecordSource,
    streams: &StreamSet,
    order: &SortSpec,
    extra: &[ValueExpr],
    unique: bool,
) -> Result<RecordSource> {
    let carried = carried_values(planner, streams, extra)?;
    let map = generate_sort(planner, streams, order, &carried, unique)?;
    let refetch = map.refetch;
    let sort = RecordSource::Sort {
        input: Box::new(input),
        map,
    };
    Ok(if refetch {
        RecordSource::Refetch {
            input: Box::new(sort),
            streams: streams.clone(),
        }
    } else {
        sort
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qplan_core::catalog::{FieldMeta, InMemoryCatalog, RelationMeta};
    use qplan_core::config::{CancelFlag, OptimizerConfig};
    use qplan_core::cost::DefaultCostModel;
    use qplan_core::query::NullsPlacement;
    use qplan_core::stream::StreamId;

    fn f(stream: u32, field: u16) -> ValueExpr {
        ValueExpr::field(StreamId(stream), field)
    }

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(RelationMeta::table(
            "T",
            vec![
                FieldMeta {
                    name: "ID".into(),
                    data_type: DataType::Int64,
                },
                FieldMeta {
                    name: "NAME".into(),
                    data_type: DataType::Text {
                        length: 40,
                        collated: true,
                    },
                },
                FieldMeta {
                    name: "NOTES".into(),
                    data_type: DataType::Text {
                        length: 2000,
                        collated: false,
                    },
                },
                FieldMeta {
                    name: "DOC".into(),
                    data_type: DataType::Blob,
                },
            ],
        ));
        catalog
    }

    fn with_planner(config: OptimizerConfig, test: impl FnOnce(&Planner<'_>)) {
        let catalog = catalog();
        let model = DefaultCostModel::default();
        let cancel = CancelFlag::new();
        let mut planner = Planner::new(&catalog, &config, &model, &cancel);
        planner
            .register(&QuerySpec::inner(vec![StreamNode::relation(0, "T")]))
            .unwrap();
        test(&planner);
    }

    #[test]
    fn test_sort_merged_into_group() {
        let spec = QuerySpec::inner(vec![StreamNode::relation(0, "T")])
            .with_group(SortSpec::ascending(vec![f(0, 0), f(0, 1)]))
            .with_sort(SortSpec::new(vec![SortItem::desc(f(0, 1))]));
        let (rewritten, decisions) = check_sorts(&spec);
        assert_eq!(decisions, vec![PlanDecision::SortMergedIntoGroup]);
        assert!(rewritten.sort.is_none());
        let group = rewritten.group.unwrap();
        assert_eq!(group.items[0], SortItem::desc(f(0, 1)));
        assert_eq!(group.items[1], SortItem::asc(f(0, 0)));
        // The caller's query is not modified.
        assert!(spec.sort.is_some());
    }

    #[test]
    fn test_distinct_rules() {
        let spec = QuerySpec::inner(vec![StreamNode::relation(0, "T")])
            .with_group(SortSpec::ascending(vec![f(0, 0)]))
            .with_distinct(SortSpec::ascending(vec![f(0, 0)]));
        let (rewritten, decisions) = check_sorts(&spec);
        assert_eq!(decisions, vec![PlanDecision::DistinctDroppedByGroup]);
        assert!(rewritten.distinct.is_none());

        let spec = QuerySpec::inner(vec![StreamNode::relation(0, "T")])
            .with_distinct(SortSpec::ascending(vec![f(0, 0), f(0, 1)]))
            .with_sort(SortSpec::ascending(vec![f(0, 1)]));
        let (rewritten, decisions) = check_sorts(&spec);
        assert_eq!(decisions, vec![PlanDecision::SortMergedIntoDistinct]);
        let exprs: Vec<_> = rewritten.distinct.unwrap().exprs().cloned().collect();
        assert_eq!(exprs, vec![f(0, 1), f(0, 0)]);

        // A sort over something the distinct key lacks stays.
        let spec = QuerySpec::inner(vec![StreamNode::relation(0, "T")])
            .with_distinct(SortSpec::ascending(vec![f(0, 0)]))
            .with_sort(SortSpec::ascending(vec![f(0, 2)]));
        let (rewritten, decisions) = check_sorts(&spec);
        assert!(decisions.is_empty());
        assert!(rewritten.sort.is_some());
    }

    #[test]
    fn test_sort_over_group_and_distinct_goes_to_distinct() {
        let spec = QuerySpec::inner(vec![StreamNode::relation(0, "T")])
            .with_group(SortSpec::ascending(vec![f(0, 0), f(0, 1)]))
            .with_distinct(SortSpec::ascending(vec![f(0, 1)]))
            .with_sort(SortSpec::new(vec![SortItem::desc(f(0, 1))]));
        let (rewritten, decisions) = check_sorts(&spec);
        assert_eq!(decisions, vec![PlanDecision::SortMergedIntoDistinct]);
        assert_eq!(rewritten.group, spec.group);
        assert_eq!(
            rewritten.distinct.unwrap().items,
            vec![SortItem::desc(f(0, 1))]
        );

        // Once the DISTINCT is dropped the group takes the order.
        let spec = QuerySpec::inner(vec![StreamNode::relation(0, "T")])
            .with_group(SortSpec::ascending(vec![f(0, 0)]))
            .with_distinct(SortSpec::ascending(vec![f(0, 0)]))
            .with_sort(SortSpec::new(vec![SortItem::desc(f(0, 0))]));
        let (rewritten, decisions) = check_sorts(&spec);
        assert_eq!(
            decisions,
            vec![PlanDecision::DistinctDroppedByGroup, PlanDecision::SortMergedIntoGroup]
        );
        assert_eq!(rewritten.group.unwrap().items, vec![SortItem::desc(f(0, 0))]);
    }

    #[test]
    fn test_sort_pushed_into_derived() {
        let inner = QuerySpec::inner(vec![StreamNode::relation(1, "T")])
            .with_select(vec![f(1, 1), f(1, 0)]);
        let spec = QuerySpec::inner(vec![StreamNode::Derived {
            stream: StreamId(0),
            alias: Some("D".into()),
            query: Box::new(inner),
        }])
        .with_sort(SortSpec::ascending(vec![f(0, 1)]));
        let (rewritten, decisions) = check_sorts(&spec);
        assert_eq!(
            decisions,
            vec![PlanDecision::SortPushedIntoDerived { stream: StreamId(0) }]
        );
        assert!(rewritten.sort.is_none());
        let StreamNode::Derived { query, .. } = &rewritten.streams[0] else {
            panic!("derived node expected");
        };
        assert_eq!(query.sort, Some(SortSpec::ascending(vec![f(1, 0)])));
    }

    #[test]
    fn test_sort_map_layout() {
        with_planner(OptimizerConfig::default(), |planner| {
            let order = SortSpec::new(vec![
                SortItem::asc(f(0, 0)).with_nulls(NullsPlacement::Last),
                SortItem::desc(f(0, 1)),
            ]);
            let streams = StreamSet::single(StreamId(0));
            let carried = vec![f(0, 0), f(0, 1), ValueExpr::CurrentTimestamp];
            let map = generate_sort(planner, &streams, &order, &carried, false).unwrap();

            assert_eq!(map.keys.len(), 4);
            assert_eq!(
                map.keys[0].kind,
                SortKeyKind::NullFlag { nulls_first: false }
            );
            // 1 + 8 + 1 + 160 (collation key of 40 characters).
            assert_eq!(map.key_length, 170);
            // ID comes back from its key, the collated NAME is stored.
            assert_eq!(map.items[0].from_key, Some(1));
            assert_eq!(map.items[1].value, SortValue::Field(FieldRef::new(StreamId(0), 1)));
            assert_eq!(map.items[1].length, 43);
            assert_eq!(map.items[2].value, SortValue::Expression(ValueExpr::CurrentTimestamp));
            assert!(!map.refetch);
        });
    }

    #[test]
    fn test_wide_records_refetch() {
        with_planner(OptimizerConfig::default(), |planner| {
            let streams = StreamSet::single(StreamId(0));
            let source = sort_river(
                planner,
                RecordSource::FullScan(planner.stream(StreamId(0)).unwrap().scan()),
                &streams,
                &SortSpec::ascending(vec![f(0, 0)]),
                &[],
                false,
            )
            .unwrap();
            let RecordSource::Refetch { input, .. } = source else {
                panic!("refetch expected");
            };
            let RecordSource::Sort { map, .. } = *input else {
                panic!("sort expected");
            };
            assert!(map.refetch);
            assert!(map
                .items
                .iter()
                .any(|i| i.value == SortValue::DbKey(StreamId(0))));
        });
    }

    #[test]
    fn test_sort_errors() {
        with_planner(OptimizerConfig::default(), |planner| {
            let streams = StreamSet::single(StreamId(0));
            let err = generate_sort(planner, &streams, &SortSpec::ascending(vec![f(0, 3)]), &[], false)
                .unwrap_err();
            assert_eq!(
                err,
                OptimizerError::InvalidSortType {
                    type_name: "BLOB".into()
                }
            );
        });

        let config = OptimizerConfig {
            max_sort_record: 100,
            refetch_threshold: 100_000,
            ..OptimizerConfig::default()
        };
        with_planner(config, |planner| {
            let streams = StreamSet::single(StreamId(0));
            let err = generate_sort(
                planner,
                &streams,
                &SortSpec::ascending(vec![f(0, 0)]),
                &[f(0, 2)],
                false,
            )
            .unwrap_err();
            assert!(matches!(err, OptimizerError::SortRecordTooLarge { limit: 100, .. }));
        });
    }
}
