//! # Catalog Interface
//!
//! The catalog is the optimizer's window onto the storage layer's metadata: the record
//! format of each relation, its indexes and their statistics, and a cardinality
//! estimate. Everything here is read-only during a compile. Implementations must be
//! safe for concurrent readers (`Send + Sync`) because independent statements may be
//! compiled on separate threads against the same catalog.
//!
//! ## Trait Design
//!
//! The `Catalog` trait is deliberately narrow and used as `dyn Catalog` so that the
//! storage engine, a test fixture or a statistics snapshot can all back it. The
//! `InMemoryCatalog` is a HashMap-based implementation populated programmatically.
//!
//! ## Relation Kinds
//!
//! Only `RelationKind::Table` relations take part in index matching. Virtual (system)
//! relations and external-file relations are always read by a full scan, whatever
//! predicates apply to them.

use crate::expr::DataType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What kind of storage backs a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// Ordinary table stored in pages with indexes.
    Table,
    /// Virtual relation materialised by the engine (system monitoring tables).
    Virtual,
    /// Table backed by an external file; no indexes, no record keys.
    External,
}

/// One field of a record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub data_type: DataType,
}

/// One key segment of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSegment {
    /// Field position in the relation's record format.
    pub field: u16,
}

/// Descriptor of one index over a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Catalog-assigned id; lower ids win cost ties.
    pub id: u32,
    pub name: String,
    pub segments: Vec<IndexSegment>,
    pub unique: bool,
    /// Descending indexes keep keys (and NULLs) in reverse order.
    pub descending: bool,
    /// Fraction of rows matched by an equality lookup on the full key
    /// (1 / distinct keys). `None` when statistics were never gathered.
    pub selectivity: Option<f64>,
    /// Per-prefix selectivities: entry `i` covers the first `i + 1` segments.
    #[serde(default)]
    pub segment_selectivity: Vec<f64>,
}

impl IndexDescriptor {
    pub fn new(id: u32, name: impl Into<String>, fields: &[u16]) -> Self {
        Self {
            id,
            name: name.into(),
            segments: fields.iter().map(|&field| IndexSegment { field }).collect(),
            unique: false,
            descending: false,
            selectivity: None,
            segment_selectivity: Vec::new(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn with_selectivity(mut self, selectivity: f64) -> Self {
        self.selectivity = Some(selectivity);
        self
    }

    /// Position of `field` within the key, if it is a segment.
    pub fn segment_position(&self, field: u16) -> Option<usize> {
        self.segments.iter().position(|s| s.field == field)
    }
}

/// Metadata of one relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationMeta {
    pub name: String,
    pub kind: RelationKind,
    pub fields: Vec<FieldMeta>,
    pub indexes: Vec<IndexDescriptor>,
    /// Estimated row count. `None` when the storage layer has no estimate.
    pub cardinality: Option<f64>,
}

impl RelationMeta {
    pub fn table(name: impl Into<String>, fields: Vec<FieldMeta>) -> Self {
        Self {
            name: name.into(),
            kind: RelationKind::Table,
            fields,
            indexes: Vec::new(),
            cardinality: None,
        }
    }

    pub fn with_kind(mut self, kind: RelationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_cardinality(mut self, rows: f64) -> Self {
        self.cardinality = Some(rows);
        self
    }

    pub fn field_type(&self, field: u16) -> Option<DataType> {
        self.fields.get(field as usize).map(|f| f.data_type)
    }

    pub fn index_by_name(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }

    /// Width of a full record, used when sizing sort records.
    pub fn record_length(&self) -> usize {
        self.fields.iter().map(|f| f.data_type.value_length()).sum()
    }
}

/// Catalog provides relation metadata and statistics.
pub trait Catalog: Send + Sync {
    fn relation(&self, name: &str) -> Option<RelationMeta>;

    /// Estimated rows produced by one execution of a selectable procedure.
    fn procedure_cardinality(&self, _name: &str) -> Option<f64> {
        None
    }
}

/// In-memory catalog for tests and embedding.
///
/// Relations are keyed by upper-cased name, so lookups are case-insensitive the
/// way SQL identifiers are.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    pub relations: HashMap<String, RelationMeta>,
    pub procedures: HashMap<String, f64>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_relation(&mut self, relation: RelationMeta) {
        self.relations.insert(relation.name.to_uppercase(), relation);
    }

    pub fn add_procedure(&mut self, name: &str, cardinality: f64) {
        self.procedures.insert(name.to_uppercase(), cardinality);
    }
}

impl Catalog for InMemoryCatalog {
    fn relation(&self, name: &str) -> Option<RelationMeta> {
        self.relations.get(&name.to_uppercase()).cloned()
    }

    fn procedure_cardinality(&self, name: &str) -> Option<f64> {
        self.procedures.get(&name.to_uppercase()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(
            RelationMeta::table(
                "Orders",
                vec![FieldMeta {
                    name: "ID".into(),
                    data_type: DataType::Int64,
                }],
            )
            .with_index(IndexDescriptor::new(1, "PK_ORDERS", &[0]).unique()),
        );

        let rel = catalog.relation("ORDERS").unwrap();
        assert!(rel.index_by_name("pk_orders").is_some());
        assert_eq!(rel.record_length(), 8);
        assert!(catalog.relation("customers").is_none());
    }
}
