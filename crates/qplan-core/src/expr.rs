//! # Value and Boolean Expressions
//!
//! The optimizer consumes already-resolved expressions: every column reference names
//! the stream it reads and the field position within that stream's record format.
//! Two closed expression families are defined here:
//!
//! ## Value Expressions (`ValueExpr`)
//! Computations producing one scalar per row: field references, literals, statement
//! parameters, arithmetic, function calls and casts. The optimizer only needs a few
//! capabilities from them: which streams they depend on, whether they can be
//! recomputed after a sort (`is_volatile`), and their data type for index matching
//! and sort-key layout.
//!
//! ## Boolean Expressions (`BoolExpr`)
//! Predicates over rows. Comparisons carry their operator as a `CompareOp` tag
//! rather than being separate node types, so the planner can dispatch with a single
//! `match` and the compiler checks every case. `And`/`Or` hold flat lists, matching
//! the way conjunct decomposition consumes them.
//!
//! ## Computability
//! A predicate is *computable* at a point in the plan when every stream of the
//! current query level it references is already active. References to streams of
//! enclosing query levels are fixed for the whole compile and behave like
//! parameters, so `computable` takes both the active set and the level's stream set.

use crate::stream::{StreamId, StreamSet};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Reference to one field of a stream's record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub stream: StreamId,
    pub field: u16,
}

impl FieldRef {
    pub fn new(stream: StreamId, field: u16) -> Self {
        Self { stream, field }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stream, self.field)
    }
}

/// Scalar value for expressions.
///
/// Uses `OrderedFloat` for `f64` so that literal-bearing expressions can be compared
/// and hashed structurally (needed to deduplicate conjuncts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    /// SQL NULL value.
    Null,
    Bool(bool),
    Int64(i64),
    Float64(OrderedFloat<f64>),
    Utf8(String),
    /// Days since 1970-01-01.
    Date(i32),
}

impl ScalarValue {
    /// Natural type of the literal; `None` for an untyped NULL.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            ScalarValue::Null => None,
            ScalarValue::Bool(_) => Some(DataType::Boolean),
            ScalarValue::Int64(_) => Some(DataType::Int64),
            ScalarValue::Float64(_) => Some(DataType::Float64),
            ScalarValue::Utf8(s) => Some(DataType::Text {
                length: s.len().min(u16::MAX as usize) as u16,
                collated: false,
            }),
            ScalarValue::Date(_) => Some(DataType::Date),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a == b,
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::Int64(v) => v.hash(state),
            Self::Float64(v) => v.hash(state),
            Self::Utf8(v) => v.hash(state),
            Self::Date(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{}", v),
            ScalarValue::Utf8(s) => write!(f, "'{}'", s),
            ScalarValue::Date(d) => write!(f, "DATE {}", d),
        }
    }
}

/// Column and expression data types as far as the optimizer cares about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Decimal { precision: u8, scale: u8 },
    Date,
    Timestamp,
    /// Character data of at most `length` bytes. `collated` text sorts through a
    /// collation key rather than its raw bytes.
    Text { length: u16, collated: bool },
    Blob,
    Array,
}

/// Coarse type families: values of the same family compare without conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeFamily {
    Boolean,
    Numeric,
    Temporal,
    Text,
    Opaque,
}

impl DataType {
    pub fn family(&self) -> TypeFamily {
        match self {
            DataType::Boolean => TypeFamily::Boolean,
            DataType::Int32 | DataType::Int64 | DataType::Float64 | DataType::Decimal { .. } => {
                TypeFamily::Numeric
            }
            DataType::Date | DataType::Timestamp => TypeFamily::Temporal,
            DataType::Text { .. } => TypeFamily::Text,
            DataType::Blob | DataType::Array => TypeFamily::Opaque,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int32 => "INTEGER",
            DataType::Int64 => "BIGINT",
            DataType::Float64 => "DOUBLE PRECISION",
            DataType::Decimal { .. } => "DECIMAL",
            DataType::Date => "DATE",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Text { .. } => "VARCHAR",
            DataType::Blob => "BLOB",
            DataType::Array => "ARRAY",
        }
    }

    /// Bytes a value of this type occupies in a record. Blobs and arrays are stored
    /// by id.
    pub fn value_length(&self) -> usize {
        match self {
            DataType::Boolean => 1,
            DataType::Int32 | DataType::Date => 4,
            DataType::Int64 | DataType::Float64 | DataType::Timestamp => 8,
            DataType::Decimal { precision, .. } => {
                if *precision > 18 {
                    16
                } else {
                    8
                }
            }
            DataType::Text { length, .. } => *length as usize + 2,
            DataType::Blob | DataType::Array => 8,
        }
    }

    /// Bytes of the binary sort key, or `None` when the type has no key encoding.
    /// Collated text sorts on an expanded collation key.
    pub fn sort_key_length(&self) -> Option<usize> {
        match self {
            DataType::Blob | DataType::Array => None,
            DataType::Text { length, collated } => {
                let length = *length as usize;
                Some(if *collated { length * 4 } else { length })
            }
            other => Some(other.value_length()),
        }
    }
}

/// Arithmetic and string operators inside value expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Concat,
}

/// Scalar computations producing one value per row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueExpr {
    /// Field of a stream.
    Field(FieldRef),
    Literal(ScalarValue),
    /// Statement parameter, bound at execution time.
    Parameter { index: u16, data_type: DataType },
    /// CURRENT_TIMESTAMP: constant per statement but not restorable from a sort key.
    CurrentTimestamp,
    Arithmetic {
        op: ArithOp,
        left: Box<ValueExpr>,
        right: Box<ValueExpr>,
    },
    /// Function call. Non-deterministic functions are volatile.
    Function {
        name: String,
        args: Vec<ValueExpr>,
        returns: DataType,
        deterministic: bool,
    },
    Cast {
        operand: Box<ValueExpr>,
        to: DataType,
    },
}

impl ValueExpr {
    pub fn field(stream: StreamId, field: u16) -> Self {
        ValueExpr::Field(FieldRef::new(stream, field))
    }

    pub fn int(v: i64) -> Self {
        ValueExpr::Literal(ScalarValue::Int64(v))
    }

    pub fn text(v: impl Into<String>) -> Self {
        ValueExpr::Literal(ScalarValue::Utf8(v.into()))
    }

    pub fn null() -> Self {
        ValueExpr::Literal(ScalarValue::Null)
    }

    /// The field reference when this expression is a bare field.
    pub fn as_field(&self) -> Option<&FieldRef> {
        match self {
            ValueExpr::Field(f) => Some(f),
            _ => None,
        }
    }

    /// Streams this expression reads.
    pub fn streams(&self) -> StreamSet {
        let mut set = StreamSet::new();
        self.collect_streams(&mut set);
        set
    }

    pub fn collect_streams(&self, out: &mut StreamSet) {
        match self {
            ValueExpr::Field(f) => {
                out.insert(f.stream);
            }
            ValueExpr::Literal(_) | ValueExpr::Parameter { .. } | ValueExpr::CurrentTimestamp => {}
            ValueExpr::Arithmetic { left, right, .. } => {
                left.collect_streams(out);
                right.collect_streams(out);
            }
            ValueExpr::Function { args, .. } => {
                for a in args {
                    a.collect_streams(out);
                }
            }
            ValueExpr::Cast { operand, .. } => operand.collect_streams(out),
        }
    }

    /// Collect every field reference in evaluation order.
    pub fn collect_fields(&self, out: &mut Vec<FieldRef>) {
        match self {
            ValueExpr::Field(f) => out.push(*f),
            ValueExpr::Literal(_) | ValueExpr::Parameter { .. } | ValueExpr::CurrentTimestamp => {}
            ValueExpr::Arithmetic { left, right, .. } => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
            ValueExpr::Function { args, .. } => {
                for a in args {
                    a.collect_fields(out);
                }
            }
            ValueExpr::Cast { operand, .. } => operand.collect_fields(out),
        }
    }

    pub fn contains_stream(&self, stream: StreamId) -> bool {
        self.streams().contains(stream)
    }

    /// True when no stream of the level it is evaluated in is inactive.
    pub fn computable(&self, active: &StreamSet, level: &StreamSet) -> bool {
        !self.streams().intersects(&level.difference(active))
    }

    /// Volatile values cannot be re-derived after a sort and must travel in the
    /// sort record.
    pub fn is_volatile(&self) -> bool {
        match self {
            ValueExpr::CurrentTimestamp => true,
            ValueExpr::Function {
                args, deterministic, ..
            } => !deterministic || args.iter().any(|a| a.is_volatile()),
            ValueExpr::Arithmetic { left, right, .. } => left.is_volatile() || right.is_volatile(),
            ValueExpr::Cast { operand, .. } => operand.is_volatile(),
            ValueExpr::Field(_) | ValueExpr::Literal(_) | ValueExpr::Parameter { .. } => false,
        }
    }

    /// Resolve the expression's type; `field_type` supplies types of field references.
    pub fn data_type(&self, field_type: &dyn Fn(&FieldRef) -> Option<DataType>) -> Option<DataType> {
        match self {
            ValueExpr::Field(f) => field_type(f),
            ValueExpr::Literal(v) => v.data_type(),
            ValueExpr::Parameter { data_type, .. } => Some(*data_type),
            ValueExpr::CurrentTimestamp => Some(DataType::Timestamp),
            ValueExpr::Arithmetic { op, left, right } => {
                let l = left.data_type(field_type);
                let r = right.data_type(field_type);
                match op {
                    ArithOp::Concat => {
                        let len = |t: Option<DataType>| match t {
                            Some(DataType::Text { length, .. }) => length,
                            _ => 32,
                        };
                        Some(DataType::Text {
                            length: len(l).saturating_add(len(r)),
                            collated: false,
                        })
                    }
                    _ => match (l, r) {
                        (Some(DataType::Float64), _) | (_, Some(DataType::Float64)) => {
                            Some(DataType::Float64)
                        }
                        (Some(t), _) if t.family() == TypeFamily::Numeric => Some(DataType::Int64),
                        (_, Some(t)) if t.family() == TypeFamily::Numeric => Some(DataType::Int64),
                        (Some(t), _) => Some(t),
                        (None, r) => r,
                    },
                }
            }
            ValueExpr::Function { returns, .. } => Some(*returns),
            ValueExpr::Cast { to, .. } => Some(*to),
        }
    }
}

impl fmt::Display for ValueExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueExpr::Field(r) => write!(f, "{}", r),
            ValueExpr::Literal(v) => write!(f, "{}", v),
            ValueExpr::Parameter { index, .. } => write!(f, "?{}", index),
            ValueExpr::CurrentTimestamp => write!(f, "CURRENT_TIMESTAMP"),
            ValueExpr::Arithmetic { op, left, right } => {
                let sym = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                    ArithOp::Concat => "||",
                };
                write!(f, "({} {} {})", left, sym, right)
            }
            ValueExpr::Function { name, args, .. } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            ValueExpr::Cast { operand, to } => write!(f, "CAST({} AS {})", operand, to.name()),
        }
    }
}

/// Comparison operators of boolean expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    /// `=`: unknown when either side is NULL.
    Eq,
    /// `IS NOT DISTINCT FROM`: NULL matches NULL.
    Equiv,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    /// `STARTING WITH`: prefix match, index-matchable as a range.
    Starting,
    /// `LIKE`; `extra` of the comparison holds the optional ESCAPE character.
    Like,
    /// `SIMILAR TO`; `extra` holds the optional ESCAPE character.
    Similar,
    Containing,
    /// `BETWEEN left AND extra`.
    Between,
}

impl CompareOp {
    /// Operator obtained by swapping the operands, if the comparison is symmetric
    /// enough to be swapped.
    pub fn commute(self) -> Option<CompareOp> {
        match self {
            CompareOp::Eq => Some(CompareOp::Eq),
            CompareOp::Equiv => Some(CompareOp::Equiv),
            CompareOp::NotEq => Some(CompareOp::NotEq),
            CompareOp::Lt => Some(CompareOp::Gt),
            CompareOp::Le => Some(CompareOp::Ge),
            CompareOp::Gt => Some(CompareOp::Lt),
            CompareOp::Ge => Some(CompareOp::Le),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Equiv => "IS NOT DISTINCT FROM",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Starting => "STARTING WITH",
            CompareOp::Like => "LIKE",
            CompareOp::Similar => "SIMILAR TO",
            CompareOp::Containing => "CONTAINING",
            CompareOp::Between => "BETWEEN",
        }
    }
}

/// Boolean predicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoolExpr {
    /// Binary comparison. `extra` is the upper bound of BETWEEN or the escape
    /// character of LIKE / SIMILAR TO; `None` for every other operator.
    Compare {
        op: CompareOp,
        left: ValueExpr,
        right: ValueExpr,
        extra: Option<ValueExpr>,
    },
    IsNull(ValueExpr),
    InList {
        value: ValueExpr,
        list: Vec<ValueExpr>,
    },
    Not(Box<BoolExpr>),
    And(Vec<BoolExpr>),
    Or(Vec<BoolExpr>),
    Constant(bool),
}

impl BoolExpr {
    pub fn compare(op: CompareOp, left: ValueExpr, right: ValueExpr) -> Self {
        BoolExpr::Compare {
            op,
            left,
            right,
            extra: None,
        }
    }

    pub fn equal(left: ValueExpr, right: ValueExpr) -> Self {
        Self::compare(CompareOp::Eq, left, right)
    }

    pub fn between(value: ValueExpr, low: ValueExpr, high: ValueExpr) -> Self {
        BoolExpr::Compare {
            op: CompareOp::Between,
            left: value,
            right: low,
            extra: Some(high),
        }
    }

    /// Conjunction; a single term is returned as is.
    pub fn and(mut terms: Vec<BoolExpr>) -> Self {
        if terms.len() == 1 {
            terms.remove(0)
        } else {
            BoolExpr::And(terms)
        }
    }

    /// Disjunction; a single term is returned as is, no terms as FALSE.
    pub fn or(mut terms: Vec<BoolExpr>) -> Self {
        if terms.is_empty() {
            BoolExpr::Constant(false)
        } else if terms.len() == 1 {
            terms.remove(0)
        } else {
            BoolExpr::Or(terms)
        }
    }

    pub fn streams(&self) -> StreamSet {
        let mut set = StreamSet::new();
        self.collect_streams(&mut set);
        set
    }

    pub fn collect_streams(&self, out: &mut StreamSet) {
        match self {
            BoolExpr::Compare {
                left, right, extra, ..
            } => {
                left.collect_streams(out);
                right.collect_streams(out);
                if let Some(e) = extra {
                    e.collect_streams(out);
                }
            }
            BoolExpr::IsNull(v) => v.collect_streams(out),
            BoolExpr::InList { value, list } => {
                value.collect_streams(out);
                for v in list {
                    v.collect_streams(out);
                }
            }
            BoolExpr::Not(b) => b.collect_streams(out),
            BoolExpr::And(terms) | BoolExpr::Or(terms) => {
                for t in terms {
                    t.collect_streams(out);
                }
            }
            BoolExpr::Constant(_) => {}
        }
    }

    pub fn contains_stream(&self, stream: StreamId) -> bool {
        self.streams().contains(stream)
    }

    /// True when no stream of `level` referenced here is missing from `active`.
    pub fn computable(&self, active: &StreamSet, level: &StreamSet) -> bool {
        !self.streams().intersects(&level.difference(active))
    }
}

impl fmt::Display for BoolExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoolExpr::Compare {
                op: CompareOp::Between,
                left,
                right,
                extra,
            } => match extra {
                Some(high) => write!(f, "{} BETWEEN {} AND {}", left, right, high),
                None => write!(f, "{} BETWEEN {}", left, right),
            },
            BoolExpr::Compare {
                op, left, right, ..
            } => write!(f, "{} {} {}", left, op.symbol(), right),
            BoolExpr::IsNull(v) => write!(f, "{} IS NULL", v),
            BoolExpr::InList { value, list } => {
                write!(f, "{} IN (", value)?;
                for (i, v) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            BoolExpr::Not(b) => write!(f, "NOT ({})", b),
            BoolExpr::And(terms) | BoolExpr::Or(terms) => {
                let sep = if matches!(self, BoolExpr::And(_)) { " AND " } else { " OR " };
                write!(f, "(")?;
                for (i, t) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", sep)?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            BoolExpr::Constant(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
        }
    }
}
