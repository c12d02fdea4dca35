//! Catalog collaborator surface.
//!
//! The scheduler does not own schema metadata; it only needs to record newly
//! produced blocks and to look up the metadata of a query's result relation.
//! The catalog is assumed to be individually thread-safe per call, so the
//! in-memory implementation wraps its tables in a plain mutex.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

pub type RelationId = u64;
pub type BlockId = u64;
pub type PartitionId = u64;

/// Metadata snapshot for one relation, as reported to clients in a
/// query-execution-success notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationMetadata {
    pub relation_id: RelationId,
    pub name: String,
    pub blocks: Vec<BlockId>,
    /// Blocks grouped by partition, for partitioned relations.
    pub partitions: HashMap<PartitionId, Vec<BlockId>>,
}

impl RelationMetadata {
    pub fn new(relation_id: RelationId, name: impl Into<String>) -> Self {
        Self {
            relation_id,
            name: name.into(),
            blocks: Vec::new(),
            partitions: HashMap::new(),
        }
    }
}

/// Lookup/mutation-by-id surface consumed by the scheduler.
pub trait Catalog: Send + Sync {
    /// Record a newly produced block for the relation, optionally within a
    /// partition.
    fn add_block(&self, relation_id: RelationId, block_id: BlockId, partition_id: Option<PartitionId>);

    /// Metadata snapshot for a relation, if it exists.
    fn relation(&self, relation_id: RelationId) -> Option<RelationMetadata>;
}

/// In-memory catalog used by tests and the demo runner.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    relations: Mutex<HashMap<RelationId, RelationMetadata>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_relation(&self, relation_id: RelationId, name: impl Into<String>) {
        let mut relations = self.relations.lock().unwrap();
        relations.insert(relation_id, RelationMetadata::new(relation_id, name));
    }
}

impl Catalog for InMemoryCatalog {
    fn add_block(&self, relation_id: RelationId, block_id: BlockId, partition_id: Option<PartitionId>) {
        let mut relations = self.relations.lock().unwrap();
        let relation = relations
            .entry(relation_id)
            .or_insert_with(|| RelationMetadata::new(relation_id, format!("relation-{relation_id}")));
        relation.blocks.push(block_id);
        if let Some(partition_id) = partition_id {
            relation.partitions.entry(partition_id).or_default().push(block_id);
        }
    }

    fn relation(&self, relation_id: RelationId) -> Option<RelationMetadata> {
        self.relations.lock().unwrap().get(&relation_id).cloned()
    }
}
