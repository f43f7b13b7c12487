//! Multipolygon way membership and geometry

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Mutex;

use crate::osm::PackedLocation;

/// Geometry entries are striped over this many maps
const SHARD_COUNT: usize = 64;

/// Set of way ids that participate in any multipolygon relation
///
/// Filled by the single pass-1 indexer, queried read-only by pass-2 workers.
#[derive(Default)]
pub struct MultipolygonWaySet {
    ways: FxHashSet<u64>,
}

impl MultipolygonWaySet {
    pub fn new() -> MultipolygonWaySet {
        MultipolygonWaySet::default()
    }

    pub fn add(&mut self, way_id: u64) {
        self.ways.insert(way_id);
    }

    pub fn contains(&self, way_id: u64) -> bool {
        self.ways.contains(&way_id)
    }

    pub fn len(&self) -> usize {
        self.ways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ways.is_empty()
    }
}

/// Node coordinates of multipolygon member ways
///
/// Pass-2 workers store each member way's decoded geometry the first time
/// they process the way; relations read it back after the ways-done barrier,
/// so a `get` never races a `put` for the same key. Striped mutexes keep
/// concurrent `put`s for different ways cheap.
pub struct MultipolygonWayGeometry {
    shards: Vec<Mutex<FxHashMap<u64, Vec<PackedLocation>>>>,
}

impl Default for MultipolygonWayGeometry {
    fn default() -> MultipolygonWayGeometry {
        MultipolygonWayGeometry {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(FxHashMap::default())).collect(),
        }
    }
}

impl MultipolygonWayGeometry {
    pub fn new() -> MultipolygonWayGeometry {
        MultipolygonWayGeometry::default()
    }

    fn shard_of(&self, way_id: u64) -> &Mutex<FxHashMap<u64, Vec<PackedLocation>>> {
        &self.shards[(way_id as usize) % SHARD_COUNT]
    }

    /// Store the ordered node locations of a way
    ///
    /// Each way appears once in an extract, so no key is ever put twice.
    pub fn put(&self, way_id: u64, locs: Vec<PackedLocation>) {
        let prev = self.shard_of(way_id).lock().unwrap().insert(way_id, locs);
        debug_assert!(prev.is_none(), "way {way_id} stored twice");
    }

    /// Ordered node locations of a way, in insertion order
    pub fn get(&self, way_id: u64) -> Option<Vec<PackedLocation>> {
        self.shard_of(way_id).lock().unwrap().get(&way_id).cloned()
    }

    pub fn has(&self, way_id: u64) -> bool {
        self.shard_of(way_id).lock().unwrap().contains_key(&way_id)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
