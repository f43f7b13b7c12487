//! Interfaces between the pipeline and a user-supplied feature mapping

use std::sync::Arc;

use crate::osm::{PackedLocation, Relation, Tags};
use crate::relinfo::RelationInfo;

/// A sort key and an opaque payload, ready for the external sort
///
/// The payload's meaning belongs to the downstream tile encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedFeature {
    pub sort_key: i64,
    pub payload: Vec<u8>,
}

/// A way's membership in a relation the profile kept a summary for
#[derive(Clone)]
pub struct RelationMembership {
    pub relation_id: u64,
    pub info: Arc<dyn RelationInfo>,
}

/// Feature reconstructed from the extract during the second pass
///
/// Lives for one worker loop iteration only.
pub enum SourceFeature {
    Node {
        id: u64,
        location: PackedLocation,
    },
    Way {
        id: u64,
        tags: Tags,
        /// Node locations along the way; refs to unknown nodes are skipped
        geometry: Vec<PackedLocation>,
        /// Memberships resolved through the way→relation index
        relations: Vec<RelationMembership>,
    },
    Multipolygon {
        id: u64,
        tags: Tags,
        /// One entry per way member with known geometry, in member order
        rings: Vec<Vec<PackedLocation>>,
    },
}

impl SourceFeature {
    pub fn id(&self) -> u64 {
        match self {
            SourceFeature::Node { id, .. }
            | SourceFeature::Way { id, .. }
            | SourceFeature::Multipolygon { id, .. } => *id,
        }
    }
}

/// User-supplied mapping from OSM elements to renderable features
pub trait Profile: Sync {
    /// Whatever the profile emits for the renderer to consume
    type Renderable: Send;

    /// Called once per relation during the first pass; returning summaries
    /// registers the relation's way members for lookup in the second pass.
    fn preprocess_relation(&self, relation: &Relation) -> Vec<Arc<dyn RelationInfo>>;

    /// Called once per reconstructed feature during the second pass; may
    /// emit zero or more renderables.
    fn process_feature(&self, feature: &SourceFeature, emit: &mut dyn FnMut(Self::Renderable));
}

/// Converts renderables into rendered features
pub trait FeatureRenderer<R>: Sync {
    fn render(&self, renderable: R, emit: &mut dyn FnMut(RenderedFeature));
}
