//! Core identifier and value types.
//!
//! Every stored vertex is addressed by a [`ConceptId`]. Types additionally
//! carry a stable [`TypeLabel`] and a compact, graph-local [`TypeId`].
//! Resources carry a [`ResourceValue`]; the pair (type id, value) yields the
//! [`ResourceIndex`] used to find duplicate resources.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Globally unique, niche-optimized identifier for a concept.
///
/// Uses `NonZeroU64` so that `Option<ConceptId>` is the same size as `ConceptId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ConceptId(NonZeroU64);

impl ConceptId {
    /// Create a `ConceptId` from a raw `u64`. Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(ConceptId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for ConceptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// Compact, graph-local type identifier.
///
/// Assigned exactly once when a type is created. The same label may map to
/// different ids in different graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(u32);

impl TypeId {
    pub const fn new(raw: u32) -> Self {
        TypeId(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable, human-assigned type label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeLabel(String);

impl TypeLabel {
    pub fn new(label: impl Into<String>) -> Self {
        TypeLabel(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeLabel {
    fn from(s: &str) -> Self {
        TypeLabel(s.to_string())
    }
}

impl From<String> for TypeLabel {
    fn from(s: String) -> Self {
        TypeLabel(s)
    }
}

impl std::fmt::Display for TypeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Data type declared by a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Long,
    Double,
    Boolean,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::String => write!(f, "string"),
            DataType::Long => write!(f, "long"),
            DataType::Double => write!(f, "double"),
            DataType::Boolean => write!(f, "boolean"),
        }
    }
}

/// Value carried by a resource vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceValue {
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
}

impl ResourceValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ResourceValue::String(_) => DataType::String,
            ResourceValue::Long(_) => DataType::Long,
            ResourceValue::Double(_) => DataType::Double,
            ResourceValue::Boolean(_) => DataType::Boolean,
        }
    }
}

impl std::fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceValue::String(s) => f.write_str(s),
            ResourceValue::Long(n) => write!(f, "{n}"),
            // `{:?}` keeps a trailing `.0`, so 1.0 and 1 never share an index.
            ResourceValue::Double(d) => write!(f, "{d:?}"),
            ResourceValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for ResourceValue {
    fn from(s: &str) -> Self {
        ResourceValue::String(s.to_string())
    }
}

impl From<String> for ResourceValue {
    fn from(s: String) -> Self {
        ResourceValue::String(s)
    }
}

impl From<i64> for ResourceValue {
    fn from(n: i64) -> Self {
        ResourceValue::Long(n)
    }
}

impl From<f64> for ResourceValue {
    fn from(d: f64) -> Self {
        ResourceValue::Double(d)
    }
}

impl From<bool> for ResourceValue {
    fn from(b: bool) -> Self {
        ResourceValue::Boolean(b)
    }
}

/// Deterministic duplicate-detection key derived from (resource type id, value).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceIndex(String);

impl ResourceIndex {
    pub fn of(type_id: TypeId, value: &ResourceValue) -> Self {
        ResourceIndex(format!("RESOURCE-{type_id}-{value}"))
    }

    /// Wrap an index string received from a commit log.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        ResourceIndex(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Thread-safe id allocator for vertices and edges.
///
/// Produces monotonically increasing ids starting from 1.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Create an allocator that resumes from a given id.
    ///
    /// Used when reopening a persistent store.
    pub fn starting_from(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    /// Allocate the next raw id.
    pub fn next_raw(&self) -> Result<u64, StoreError> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        if raw == 0 || raw == u64::MAX {
            return Err(StoreError::IdsExhausted);
        }
        Ok(raw)
    }

    /// Allocate the next concept id.
    pub fn next_concept(&self) -> Result<ConceptId, StoreError> {
        let raw = self.next_raw()?;
        ConceptId::new(raw).ok_or(StoreError::IdsExhausted)
    }

    /// Return the next id that *would* be allocated, without consuming it.
    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concept_id_niche_optimization() {
        assert_eq!(
            std::mem::size_of::<Option<ConceptId>>(),
            std::mem::size_of::<ConceptId>()
        );
        assert!(ConceptId::new(0).is_none());
        assert_eq!(ConceptId::new(42).unwrap().get(), 42);
    }

    #[test]
    fn index_is_deterministic_per_type_and_value() {
        let email = TypeId::new(9);
        let a = ResourceIndex::of(email, &"a@example.com".into());
        let b = ResourceIndex::of(email, &"a@example.com".into());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "RESOURCE-9-a@example.com");

        let other_type = ResourceIndex::of(TypeId::new(10), &"a@example.com".into());
        assert_ne!(a, other_type);
    }

    #[test]
    fn long_and_double_indices_differ() {
        let t = TypeId::new(8);
        let long = ResourceIndex::of(t, &ResourceValue::Long(1));
        let double = ResourceIndex::of(t, &ResourceValue::Double(1.0));
        assert_ne!(long, double);
    }

    #[test]
    fn allocator_is_sequential_and_resumable() {
        let alloc = IdAllocator::new();
        assert_eq!(alloc.next_concept().unwrap().get(), 1);
        assert_eq!(alloc.next_concept().unwrap().get(), 2);

        let resumed = IdAllocator::starting_from(100);
        assert_eq!(resumed.peek_next(), 100);
        assert_eq!(resumed.next_raw().unwrap(), 100);
    }

    #[test]
    fn resource_values_report_their_data_type() {
        assert_eq!(ResourceValue::from("x").data_type(), DataType::String);
        assert_eq!(ResourceValue::from(3i64).data_type(), DataType::Long);
        assert_eq!(ResourceValue::from(0.5).data_type(), DataType::Double);
        assert_eq!(ResourceValue::from(true).data_type(), DataType::Boolean);
    }
}
