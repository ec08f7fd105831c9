//! Shared fixtures for the integration tests.
//!
//! `Database` pairs an in-memory catalog with table contents and executes compiled
//! record-source trees over them with SQL three-valued logic, so tests can check
//! what a plan returns and not only how it looks. `naive` evaluates an inner-join
//! level directly (cross product, then filter) as the reference result.

#![allow(dead_code)]

use qplan_core::catalog::{FieldMeta, IndexDescriptor, InMemoryCatalog, RelationMeta};
use qplan_core::config::OptimizerConfig;
use qplan_core::expr::{ArithOp, BoolExpr, CompareOp, DataType, ScalarValue, ValueExpr};
use qplan_core::plan::{IndexRange, Inversion, JoinType, RecordSource, SegmentMatch, StreamScan};
use qplan_core::query::{QuerySpec, SortItem, StreamNode};
use qplan_core::stream::StreamId;
use qplan_optimizer::Optimizer;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Values of the streams a row carries. A stream missing from the map is NULL
/// extended.
pub type Row = BTreeMap<StreamId, Vec<ScalarValue>>;

/// Install a test subscriber honouring `RUST_LOG`; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn f(stream: u32, field: u16) -> ValueExpr {
    ValueExpr::field(StreamId(stream), field)
}

pub fn int(v: i64) -> ScalarValue {
    ScalarValue::Int64(v)
}

pub fn ints(values: &[Option<i64>]) -> Vec<ScalarValue> {
    values
        .iter()
        .map(|v| v.map_or(ScalarValue::Null, ScalarValue::Int64))
        .collect()
}

pub fn eq(left: ValueExpr, right: ValueExpr) -> BoolExpr {
    BoolExpr::equal(left, right)
}

pub fn int_fields(names: &[&str]) -> Vec<FieldMeta> {
    names
        .iter()
        .map(|name| FieldMeta {
            name: name.to_string(),
            data_type: DataType::Int64,
        })
        .collect()
}

#[derive(Default)]
pub struct Database {
    pub catalog: InMemoryCatalog,
    tables: HashMap<String, Vec<Vec<ScalarValue>>>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table; its cardinality estimate is its row count.
    pub fn table(&mut self, meta: RelationMeta, rows: Vec<Vec<ScalarValue>>) -> &mut Self {
        let meta = meta.with_cardinality((rows.len() as f64).max(1.0));
        self.tables.insert(meta.name.to_uppercase(), rows);
        self.catalog.add_relation(meta);
        self
    }

    /// Integer table `name` with `fields`, `indexes` and `rows`.
    pub fn int_table(
        &mut self,
        name: &str,
        fields: &[&str],
        indexes: Vec<IndexDescriptor>,
        rows: &[&[Option<i64>]],
    ) -> &mut Self {
        let mut meta = RelationMeta::table(name, int_fields(fields));
        for index in indexes {
            meta = meta.with_index(index);
        }
        self.table(meta, rows.iter().map(|r| ints(r)).collect())
    }

    pub fn optimizer(&self) -> Optimizer {
        self.optimizer_with(OptimizerConfig::default())
    }

    pub fn optimizer_with(&self, config: OptimizerConfig) -> Optimizer {
        Optimizer::new(Arc::new(self.catalog.clone()), config)
    }

    /// Compile `spec` and run the plan.
    pub fn run(&self, spec: &QuerySpec) -> Vec<Row> {
        let plan = self.optimizer().compile(spec).expect("compile failed");
        self.execute(&plan.root)
    }

    pub fn execute(&self, source: &RecordSource) -> Vec<Row> {
        self.exec(source, &Row::new())
    }

    fn records(&self, scan: &StreamScan) -> &[Vec<ScalarValue>] {
        self.tables
            .get(&scan.relation.to_uppercase())
            .unwrap_or_else(|| panic!("no data for {}", scan.relation))
    }

    fn exec(&self, source: &RecordSource, ctx: &Row) -> Vec<Row> {
        match source {
            RecordSource::FullScan(scan) | RecordSource::VirtualScan(scan) | RecordSource::ExternalScan(scan) => {
                self.records(scan).iter().map(|r| single(scan.stream, r)).collect()
            }
            RecordSource::ProcedureScan { scan, .. } => panic!("procedure {} cannot be executed", scan.relation),
            RecordSource::IndexedScan { scan, inversion } => self
                .records(scan)
                .iter()
                .filter(|r| in_inversion(inversion, r, ctx))
                .map(|r| single(scan.stream, r))
                .collect(),
            RecordSource::NavigationalScan {
                scan,
                range,
                inversion,
            } => {
                let mut rows: Vec<&Vec<ScalarValue>> = self
                    .records(scan)
                    .iter()
                    .filter(|r| in_range(range, r, ctx))
                    .filter(|r| inversion.as_ref().map_or(true, |inv| in_inversion(inv, r, ctx)))
                    .collect();
                let meta = self
                    .catalog
                    .relations
                    .get(&scan.relation.to_uppercase())
                    .expect("navigated relation");
                let index = meta.index_by_name(&range.index).expect("navigated index");
                rows.sort_by(|a, b| {
                    let ord = index
                        .segments
                        .iter()
                        .map(|s| {
                            let field = s.field as usize;
                            order_values(&a[field], &b[field], true)
                        })
                        .find(|o| *o != Ordering::Equal)
                        .unwrap_or(Ordering::Equal);
                    if index.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                rows.into_iter().map(|r| single(scan.stream, r)).collect()
            }
            RecordSource::DerivedScan {
                stream,
                source,
                output,
                ..
            } => self
                .exec(source, ctx)
                .into_iter()
                .map(|row| {
                    let scope = merge(ctx, &row);
                    single(*stream, &output.iter().map(|e| value(e, &scope)).collect::<Vec<_>>())
                })
                .collect(),
            RecordSource::Filter { input, condition } => self
                .exec(input, ctx)
                .into_iter()
                .filter(|row| truth(condition, &merge(ctx, row)) == Some(true))
                .collect(),
            RecordSource::NestedLoopJoin { kind, inputs, boolean } => match kind {
                JoinType::Inner => {
                    let mut rows = vec![Row::new()];
                    for input in inputs {
                        let mut next = Vec::new();
                        for row in &rows {
                            for inner in self.exec(input, &merge(ctx, row)) {
                                next.push(merge(row, &inner));
                            }
                        }
                        rows = next;
                    }
                    rows
                }
                JoinType::Outer | JoinType::Anti => {
                    let mut out = Vec::new();
                    for outer in self.exec(&inputs[0], ctx) {
                        let scope = merge(ctx, &outer);
                        let open = boolean.as_ref().map_or(true, |b| truth(b, &scope) == Some(true));
                        let matches = if open { self.exec(&inputs[1], &scope) } else { Vec::new() };
                        match kind {
                            JoinType::Anti => {
                                if matches.is_empty() {
                                    out.push(outer);
                                }
                            }
                            _ if matches.is_empty() => out.push(outer),
                            _ => out.extend(matches.iter().map(|m| merge(&outer, m))),
                        }
                    }
                    out
                }
            },
            RecordSource::FullOuterJoin { forward, reverse } => {
                let mut rows = self.exec(forward, ctx);
                rows.extend(self.exec(reverse, ctx));
                rows
            }
            RecordSource::HashJoin {
                probe,
                probe_keys,
                builds,
                null_matches,
            } => {
                let mut rows = self.exec(probe, ctx);
                for build in builds {
                    let candidates = self.exec(&build.source, ctx);
                    rows = rows
                        .into_iter()
                        .flat_map(|row| {
                            let left: Vec<ScalarValue> =
                                probe_keys.iter().map(|k| value(k, &merge(ctx, &row))).collect();
                            candidates
                                .iter()
                                .filter(|c| {
                                    let right: Vec<ScalarValue> =
                                        build.keys.iter().map(|k| value(k, &merge(ctx, c))).collect();
                                    keys_match(&left, &right, null_matches)
                                })
                                .map(|c| merge(&row, c))
                                .collect::<Vec<_>>()
                        })
                        .collect();
                }
                rows
            }
            RecordSource::MergeJoin { inputs, null_matches } => {
                let mut rows = self.exec(&inputs[0].source, ctx);
                for input in &inputs[1..] {
                    let candidates = self.exec(&input.source, ctx);
                    rows = rows
                        .into_iter()
                        .flat_map(|row| {
                            let left: Vec<ScalarValue> =
                                inputs[0].keys.iter().map(|k| value(k, &merge(ctx, &row))).collect();
                            candidates
                                .iter()
                                .filter(|c| {
                                    let right: Vec<ScalarValue> =
                                        input.keys.iter().map(|k| value(k, &merge(ctx, c))).collect();
                                    keys_match(&left, &right, null_matches)
                                })
                                .map(|c| merge(&row, c))
                                .collect::<Vec<_>>()
                        })
                        .collect();
                }
                rows
            }
            RecordSource::Sort { input, map } => {
                let mut rows = self.exec(input, ctx);
                rows.sort_by(|a, b| compare_rows(&map.order, &merge(ctx, a), &merge(ctx, b)));
                if map.unique {
                    rows.dedup_by(|a, b| compare_rows(&map.order, &merge(ctx, a), &merge(ctx, b)) == Ordering::Equal);
                }
                rows
            }
            RecordSource::Aggregate { input, group } => {
                let mut rows = self.exec(input, ctx);
                rows.dedup_by(|a, b| {
                    group.iter().all(|e| {
                        let (x, y) = (value(e, &merge(ctx, a)), value(e, &merge(ctx, b)));
                        x == y
                    })
                });
                rows
            }
            RecordSource::Skip { input, count } => {
                let n = count_of(count, ctx);
                self.exec(input, ctx).into_iter().skip(n).collect()
            }
            RecordSource::First { input, count } => {
                let n = count_of(count, ctx);
                self.exec(input, ctx).into_iter().take(n).collect()
            }
            RecordSource::Singular { input } => {
                let rows = self.exec(input, ctx);
                assert!(rows.len() <= 1, "singular select returned {} rows", rows.len());
                rows
            }
            RecordSource::Refetch { input, .. } | RecordSource::Lock { input } | RecordSource::Buffered { input } => {
                self.exec(input, ctx)
            }
        }
    }

    /// Reference result of an inner-join level over relations: every combination
    /// of rows for which the boolean is true.
    pub fn naive(&self, spec: &QuerySpec) -> Vec<Row> {
        let mut rows = vec![Row::new()];
        for node in &spec.streams {
            let StreamNode::Relation { stream, relation, .. } = node else {
                panic!("naive evaluation handles relations only");
            };
            let records = self
                .tables
                .get(&relation.to_uppercase())
                .unwrap_or_else(|| panic!("no data for {}", relation));
            rows = rows
                .iter()
                .flat_map(|row| {
                    records.iter().map(move |r| {
                        let mut next = row.clone();
                        next.insert(*stream, r.clone());
                        next
                    })
                })
                .collect();
        }
        match &spec.boolean {
            Some(b) => rows.into_iter().filter(|r| truth(b, r) == Some(true)).collect(),
            None => rows,
        }
    }
}

/// Order-insensitive rendering of a result, for comparing two results.
pub fn canonical(rows: &[Row]) -> Vec<String> {
    let mut out: Vec<String> = rows.iter().map(|r| format!("{:?}", r)).collect();
    out.sort();
    out
}

/// Field `field` of `stream` in every row, in result order.
pub fn column(rows: &[Row], stream: u32, field: usize) -> Vec<ScalarValue> {
    rows.iter()
        .map(|r| {
            r.get(&StreamId(stream))
                .map_or(ScalarValue::Null, |values| values[field].clone())
        })
        .collect()
}

fn single(stream: StreamId, values: &[ScalarValue]) -> Row {
    let mut row = Row::new();
    row.insert(stream, values.to_vec());
    row
}

fn merge(a: &Row, b: &Row) -> Row {
    let mut out = a.clone();
    out.extend(b.iter().map(|(k, v)| (*k, v.clone())));
    out
}

fn count_of(expr: &ValueExpr, ctx: &Row) -> usize {
    match value(expr, ctx) {
        ScalarValue::Int64(n) => n.max(0) as usize,
        other => panic!("row count {} is not an integer", other),
    }
}

fn keys_match(left: &[ScalarValue], right: &[ScalarValue], null_matches: &[bool]) -> bool {
    left.iter().zip(right).enumerate().all(|(i, (l, r))| match (l.is_null(), r.is_null()) {
        (true, true) => null_matches.get(i).copied().unwrap_or(false),
        (false, false) => compare(l, r) == Some(Ordering::Equal),
        _ => false,
    })
}

fn compare_rows(order: &[SortItem], a: &Row, b: &Row) -> Ordering {
    for item in order {
        let (x, y) = (value(&item.expr, a), value(&item.expr, b));
        // NULL placement does not depend on the direction.
        let ord = if x.is_null() || y.is_null() {
            order_values(&x, &y, item.nulls_first())
        } else if item.descending {
            order_values(&x, &y, true).reverse()
        } else {
            order_values(&x, &y, true)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn order_values(a: &ScalarValue, b: &ScalarValue, nulls_first: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) if nulls_first => Ordering::Less,
        (true, false) => Ordering::Greater,
        (false, true) if nulls_first => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

fn compare(a: &ScalarValue, b: &ScalarValue) -> Option<Ordering> {
    use ScalarValue::*;
    match (a, b) {
        (Int64(x), Int64(y)) => Some(x.cmp(y)),
        (Int64(x), Float64(y)) => (*x as f64).partial_cmp(&y.0),
        (Float64(x), Int64(y)) => x.0.partial_cmp(&(*y as f64)),
        (Float64(x), Float64(y)) => x.0.partial_cmp(&y.0),
        (Utf8(x), Utf8(y)) => Some(x.cmp(y)),
        (Date(x), Date(y)) => Some(x.cmp(y)),
        (Bool(x), Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn value(expr: &ValueExpr, row: &Row) -> ScalarValue {
    match expr {
        ValueExpr::Field(f) => row
            .get(&f.stream)
            .and_then(|values| values.get(f.field as usize))
            .cloned()
            .unwrap_or(ScalarValue::Null),
        ValueExpr::Literal(v) => v.clone(),
        ValueExpr::Cast { operand, .. } => value(operand, row),
        ValueExpr::Arithmetic { op, left, right } => match (op, value(left, row), value(right, row)) {
            (ArithOp::Add, ScalarValue::Int64(a), ScalarValue::Int64(b)) => ScalarValue::Int64(a + b),
            (ArithOp::Sub, ScalarValue::Int64(a), ScalarValue::Int64(b)) => ScalarValue::Int64(a - b),
            (ArithOp::Mul, ScalarValue::Int64(a), ScalarValue::Int64(b)) => ScalarValue::Int64(a * b),
            (ArithOp::Div, ScalarValue::Int64(a), ScalarValue::Int64(b)) if b != 0 => ScalarValue::Int64(a / b),
            (ArithOp::Concat, ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => ScalarValue::Utf8(a + &b),
            _ => ScalarValue::Null,
        },
        other => panic!("expression {} cannot be evaluated here", other),
    }
}

/// Three-valued truth of `expr`: `None` is UNKNOWN.
pub fn truth(expr: &BoolExpr, row: &Row) -> Option<bool> {
    match expr {
        BoolExpr::Compare {
            op,
            left,
            right,
            extra,
        } => {
            let l = value(left, row);
            let r = value(right, row);
            if *op == CompareOp::Equiv {
                return Some(match (l.is_null(), r.is_null()) {
                    (true, true) => true,
                    (false, false) => compare(&l, &r) == Some(Ordering::Equal),
                    _ => false,
                });
            }
            if l.is_null() || r.is_null() {
                return None;
            }
            let ord = compare(&l, &r);
            match op {
                CompareOp::Eq => Some(ord == Some(Ordering::Equal)),
                CompareOp::NotEq => Some(ord.is_some_and(|o| o != Ordering::Equal)),
                CompareOp::Lt => Some(ord == Some(Ordering::Less)),
                CompareOp::Le => Some(matches!(ord, Some(Ordering::Less | Ordering::Equal))),
                CompareOp::Gt => Some(ord == Some(Ordering::Greater)),
                CompareOp::Ge => Some(matches!(ord, Some(Ordering::Greater | Ordering::Equal))),
                CompareOp::Starting => match (&l, &r) {
                    (ScalarValue::Utf8(s), ScalarValue::Utf8(p)) => Some(s.starts_with(p.as_str())),
                    _ => None,
                },
                CompareOp::Containing => match (&l, &r) {
                    (ScalarValue::Utf8(s), ScalarValue::Utf8(p)) => Some(s.contains(p.as_str())),
                    _ => None,
                },
                CompareOp::Like | CompareOp::Similar => match (&l, &r) {
                    (ScalarValue::Utf8(s), ScalarValue::Utf8(p)) => Some(like(s.as_bytes(), p.as_bytes())),
                    _ => None,
                },
                CompareOp::Between => {
                    let high = value(extra.as_ref()?, row);
                    if high.is_null() {
                        return None;
                    }
                    Some(
                        matches!(ord, Some(Ordering::Greater | Ordering::Equal))
                            && matches!(compare(&l, &high), Some(Ordering::Less | Ordering::Equal)),
                    )
                }
                CompareOp::Equiv => unreachable!(),
            }
        }
        BoolExpr::IsNull(v) => Some(value(v, row).is_null()),
        BoolExpr::InList { value: v, list } => {
            let v = value(v, row);
            if v.is_null() {
                return None;
            }
            let mut unknown = false;
            for item in list {
                let item = value(item, row);
                if item.is_null() {
                    unknown = true;
                } else if compare(&v, &item) == Some(Ordering::Equal) {
                    return Some(true);
                }
            }
            if unknown {
                None
            } else {
                Some(false)
            }
        }
        BoolExpr::Not(inner) => truth(inner, row).map(|b| !b),
        BoolExpr::And(items) => {
            let mut result = Some(true);
            for item in items {
                match truth(item, row) {
                    Some(false) => return Some(false),
                    None => result = None,
                    Some(true) => {}
                }
            }
            result
        }
        BoolExpr::Or(items) => {
            let mut result = Some(false);
            for item in items {
                match truth(item, row) {
                    Some(true) => return Some(true),
                    None => result = None,
                    Some(false) => {}
                }
            }
            result
        }
        BoolExpr::Constant(b) => Some(*b),
    }
}

fn like(s: &[u8], p: &[u8]) -> bool {
    match p.split_first() {
        None => s.is_empty(),
        Some((b'%', rest)) => (0..=s.len()).any(|i| like(&s[i..], rest)),
        Some((b'_', rest)) => !s.is_empty() && like(&s[1..], rest),
        Some((c, rest)) => s.first() == Some(c) && like(&s[1..], rest),
    }
}

fn in_inversion(inversion: &Inversion, record: &[ScalarValue], ctx: &Row) -> bool {
    match inversion {
        Inversion::Index(range) => in_range(range, record, ctx),
        Inversion::And(items) => items.iter().all(|i| in_inversion(i, record, ctx)),
        Inversion::Or(items) => items.iter().any(|i| in_inversion(i, record, ctx)),
    }
}

fn in_range(range: &IndexRange, record: &[ScalarValue], ctx: &Row) -> bool {
    range.segments.iter().all(|segment| {
        let key = record.get(segment.field as usize).cloned().unwrap_or(ScalarValue::Null);
        let equal = |e: &ValueExpr| {
            let v = value(e, ctx);
            !v.is_null() && !key.is_null() && compare(&key, &v) == Some(Ordering::Equal)
        };
        match &segment.matched {
            SegmentMatch::Equal(e) => equal(e),
            SegmentMatch::Equivalent(e) => {
                let v = value(e, ctx);
                (v.is_null() && key.is_null()) || equal(e)
            }
            SegmentMatch::IsNull => key.is_null(),
            SegmentMatch::List(values) => values.iter().any(|e| equal(e)),
            SegmentMatch::Range { lower, upper } => {
                if key.is_null() {
                    return false;
                }
                let lower_ok = lower.as_ref().map_or(true, |b| match compare(&key, &value(&b.value, ctx)) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => b.inclusive,
                    _ => false,
                });
                let upper_ok = upper.as_ref().map_or(true, |b| match compare(&key, &value(&b.value, ctx)) {
                    Some(Ordering::Less) => true,
                    Some(Ordering::Equal) => b.inclusive,
                    _ => false,
                });
                lower_ok && upper_ok
            }
            SegmentMatch::Starting(e) => match (&key, value(e, ctx)) {
                (ScalarValue::Utf8(s), ScalarValue::Utf8(p)) => s.starts_with(p.as_str()),
                _ => false,
            },
        }
    })
}
