//! Storage collaborator for the batch graph store.
//!
//! Two backends implement [`GraphStore`]:
//!
//! - [`MemGraphStore`] — volatile, lock-guarded maps; used for tests and
//!   memory-only sessions
//! - [`DurableGraphStore`] — ACID tables in redb; counters and shard lists
//!   survive restarts
//!
//! Every write goes through [`GraphStore::apply`] with a [`WriteBatch`]: a set
//! of optimistic [`Precondition`]s plus the [`Mutation`]s to apply. A batch is
//! all-or-nothing. Both backends share the batch semantics in [`batch`].

pub mod batch;
pub mod durable;
pub mod mem;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::concept::{ConceptId, DataType, ResourceIndex, ResourceValue, TypeId, TypeLabel};
use crate::error::StoreError;
use crate::registry::MetaKind;

pub use batch::{Mutation, Precondition, WriteBatch};
pub use durable::DurableGraphStore;
pub use mem::MemGraphStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Structural role of a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseType {
    Type,
    Entity,
    Relation,
    Resource,
    Rule,
    Shard,
}

impl std::fmt::Display for BaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BaseType::Type => "type",
            BaseType::Entity => "entity",
            BaseType::Relation => "relation",
            BaseType::Resource => "resource",
            BaseType::Rule => "rule",
            BaseType::Shard => "shard",
        };
        f.write_str(name)
    }
}

/// Closed set of vertex property keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertyKey {
    Label,
    TypeId,
    Kind,
    DataType,
    Index,
    Value,
    InstanceOf,
    CurrentShard,
    ShardGeneration,
    ShardOwner,
}

/// A vertex property together with its declared value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Property {
    /// Type label (type vertices). Indexed.
    Label(TypeLabel),
    /// Graph-local type id (type vertices). Indexed.
    TypeId(TypeId),
    /// Root kind of a type vertex.
    Kind(MetaKind),
    /// Declared data type of a resource type.
    DataType(DataType),
    /// Duplicate-detection key of a resource. Indexed.
    Index(ResourceIndex),
    /// Value of a resource.
    Value(ResourceValue),
    /// Type vertex an instance belongs to.
    InstanceOf(ConceptId),
    /// Shard new instances of a type attach to.
    CurrentShard(ConceptId),
    /// Number of threshold crossings already answered with a shard.
    ShardGeneration(u64),
    /// Owner of a shard vertex.
    ShardOwner(ConceptId),
}

impl Property {
    pub fn key(&self) -> PropertyKey {
        match self {
            Property::Label(_) => PropertyKey::Label,
            Property::TypeId(_) => PropertyKey::TypeId,
            Property::Kind(_) => PropertyKey::Kind,
            Property::DataType(_) => PropertyKey::DataType,
            Property::Index(_) => PropertyKey::Index,
            Property::Value(_) => PropertyKey::Value,
            Property::InstanceOf(_) => PropertyKey::InstanceOf,
            Property::CurrentShard(_) => PropertyKey::CurrentShard,
            Property::ShardGeneration(_) => PropertyKey::ShardGeneration,
            Property::ShardOwner(_) => PropertyKey::ShardOwner,
        }
    }
}

/// A stored vertex.
///
/// `version` is maintained by the store: it starts at 1 and increases on every
/// property change and every incident edge added or removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: ConceptId,
    pub base: BaseType,
    pub properties: BTreeMap<PropertyKey, Property>,
    pub version: u64,
}

impl Vertex {
    pub fn new(id: ConceptId, base: BaseType) -> Self {
        Self {
            id,
            base,
            properties: BTreeMap::new(),
            version: 0,
        }
    }

    /// Builder-style property setter.
    pub fn with(mut self, property: Property) -> Self {
        self.properties.insert(property.key(), property);
        self
    }

    pub fn property(&self, key: PropertyKey) -> Option<&Property> {
        self.properties.get(&key)
    }

    pub fn label(&self) -> Option<&TypeLabel> {
        match self.property(PropertyKey::Label) {
            Some(Property::Label(l)) => Some(l),
            _ => None,
        }
    }

    pub fn type_id(&self) -> Option<TypeId> {
        match self.property(PropertyKey::TypeId) {
            Some(Property::TypeId(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<MetaKind> {
        match self.property(PropertyKey::Kind) {
            Some(Property::Kind(k)) => Some(*k),
            _ => None,
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self.property(PropertyKey::DataType) {
            Some(Property::DataType(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn index(&self) -> Option<&ResourceIndex> {
        match self.property(PropertyKey::Index) {
            Some(Property::Index(i)) => Some(i),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&ResourceValue> {
        match self.property(PropertyKey::Value) {
            Some(Property::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn instance_of(&self) -> Option<ConceptId> {
        match self.property(PropertyKey::InstanceOf) {
            Some(Property::InstanceOf(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn current_shard(&self) -> Option<ConceptId> {
        match self.property(PropertyKey::CurrentShard) {
            Some(Property::CurrentShard(s)) => Some(*s),
            _ => None,
        }
    }

    pub fn shard_generation(&self) -> u64 {
        match self.property(PropertyKey::ShardGeneration) {
            Some(Property::ShardGeneration(g)) => *g,
            _ => 0,
        }
    }

    pub fn shard_owner(&self) -> Option<ConceptId> {
        match self.property(PropertyKey::ShardOwner) {
            Some(Property::ShardOwner(o)) => Some(*o),
            _ => None,
        }
    }
}

/// Edge identifier, allocated from the same id space as vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(u64);

impl EdgeId {
    pub fn new(raw: u64) -> Self {
        EdgeId(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Closed set of edge labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeLabel {
    /// instance → shard of its type
    Isa,
    /// subtype → supertype
    Sub,
    /// shard → owner
    Shard,
    /// relation → role player, qualified by the role type
    RolePlayer,
    /// relation type → role type
    Relates,
    /// type → role type it may play
    Plays,
}

impl std::fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EdgeLabel::Isa => "isa",
            EdgeLabel::Sub => "sub",
            EdgeLabel::Shard => "shard",
            EdgeLabel::RolePlayer => "role-player",
            EdgeLabel::Relates => "relates",
            EdgeLabel::Plays => "plays",
        };
        f.write_str(name)
    }
}

/// A stored, directed edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub label: EdgeLabel,
    pub source: ConceptId,
    pub target: ConceptId,
    /// Role type of a role-player edge.
    pub role: Option<TypeId>,
}

/// Identity of an edge ignoring its id; two edges with the same key are duplicates.
pub type EdgeKey = (EdgeLabel, ConceptId, ConceptId, Option<TypeId>);

impl Edge {
    pub fn new(id: EdgeId, label: EdgeLabel, source: ConceptId, target: ConceptId) -> Self {
        Self {
            id,
            label,
            source,
            target,
            role: None,
        }
    }

    pub fn with_role(mut self, role: TypeId) -> Self {
        self.role = Some(role);
        self
    }

    pub fn key(&self) -> EdgeKey {
        (self.label, self.source, self.target, self.role)
    }

    /// The endpoint that is not `id`, or `id` itself for a self-loop.
    pub fn other_end(&self, id: ConceptId) -> ConceptId {
        if self.source == id {
            self.target
        } else {
            self.source
        }
    }
}

/// Which incident edges to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// Typed lookup key: a closed set of indexable properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConceptProperty {
    Id(ConceptId),
    Index(ResourceIndex),
    TypeLabel(TypeLabel),
    TypeId(TypeId),
}

impl std::fmt::Display for ConceptProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConceptProperty::Id(id) => write!(f, "id={id}"),
            ConceptProperty::Index(i) => write!(f, "index={i}"),
            ConceptProperty::TypeLabel(l) => write!(f, "label={l}"),
            ConceptProperty::TypeId(t) => write!(f, "type-id={t}"),
        }
    }
}

/// The storage collaborator consumed by the core.
///
/// Reads are individually consistent; writes are atomic per [`WriteBatch`].
/// Implementations must be safe to share across threads.
pub trait GraphStore: Send + Sync {
    /// Fetch a vertex by id. `Ok(None)` if it does not exist.
    fn get_vertex(&self, id: ConceptId) -> StoreResult<Option<Vertex>>;

    /// Ids of live vertices matching a typed property, ascending.
    fn lookup(&self, property: &ConceptProperty) -> StoreResult<Vec<ConceptId>>;

    /// Edges incident to `id` in the given direction, ordered by edge id.
    fn edges(&self, id: ConceptId, direction: Direction) -> StoreResult<Vec<Edge>>;

    /// Raw signed sum of a concept counter, `None` if never written.
    fn counter(&self, concept: ConceptId) -> StoreResult<Option<i64>>;

    /// All type vertices, used to restore the registry.
    fn type_vertices(&self) -> StoreResult<Vec<Vertex>>;

    /// Allocate a fresh id for a vertex or edge.
    fn allocate_id(&self) -> StoreResult<u64>;

    /// Check every precondition, then apply every mutation, atomically.
    fn apply(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Remove every vertex, edge and counter.
    fn clear(&self) -> StoreResult<()>;

    /// Number of live vertices.
    fn vertex_count(&self) -> StoreResult<usize>;

    fn allocate_concept_id(&self) -> StoreResult<ConceptId> {
        let raw = self.allocate_id()?;
        ConceptId::new(raw).ok_or(StoreError::IdsExhausted)
    }

    fn allocate_edge_id(&self) -> StoreResult<EdgeId> {
        Ok(EdgeId::new(self.allocate_id()?))
    }
}
