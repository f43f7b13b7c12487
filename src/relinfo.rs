//! Relation summaries produced by a profile

use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;

/// Summary a profile keeps for a relation it is interested in
///
/// The concrete shape is the profile's business; the pipeline only needs to
/// account for its memory and hand it back when the relation's member ways
/// are processed.
pub trait RelationInfo: Send + Sync {
    /// Upper bound on the retained heap footprint of this summary
    fn size_bytes(&self) -> usize;
    /// Downcast support, so a profile can recover its own summary type
    fn as_any(&self) -> &dyn Any;
}

/// Table of relation summaries, keyed by relation id
///
/// Filled by the single pass-1 indexer, read-only afterwards.
#[derive(Default)]
pub struct RelationInfoTable {
    infos: FxHashMap<u64, Vec<Arc<dyn RelationInfo>>>,
    total_bytes: usize,
}

impl RelationInfoTable {
    pub fn new() -> RelationInfoTable {
        RelationInfoTable::default()
    }

    pub fn put(&mut self, relation_id: u64, info: Arc<dyn RelationInfo>) {
        self.total_bytes += info.size_bytes();
        self.infos.entry(relation_id).or_default().push(info);
    }

    /// Summaries stored for a relation; empty for unknown ids
    pub fn get(&self, relation_id: u64) -> &[Arc<dyn RelationInfo>] {
        self.infos.get(&relation_id).map_or(&[], Vec::as_slice)
    }

    /// Number of relations with at least one summary
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Accounted heap footprint of all stored summaries
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}
