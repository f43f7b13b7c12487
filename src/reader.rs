//! Two-pass reader over an OSM extract

use log::{debug, info};
use std::error::Error;
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Barrier;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crate::extsort::{Entry, ExternalMergeSort, SortError};
use crate::multipoly::{MultipolygonWayGeometry, MultipolygonWaySet};
use crate::nodestore::NodeLocationStore;
use crate::osm::{Element, PackedLocation, Relation, Way};
use crate::profile::{FeatureRenderer, Profile, RelationMembership, RenderedFeature, SourceFeature};
use crate::relinfo::RelationInfoTable;
use crate::topology::{QueueReceiver, QueueSender, Topology, TopologyError};
use crate::wayindex::WayToRelationIndex;

/// Elements (or rendered features) per queue message
const BATCH_LEN: usize = 1024;

/// Source of OSM elements that can be scanned once per pass
///
/// Implementations decode in whatever way suits them (the PBF source runs
/// its own decoder pool) and push elements in file order. The sink returns
/// false to request an early stop.
pub trait ElementSource: Sync {
    fn read_elements(
        &self,
        sink: &mut dyn FnMut(Element) -> bool,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid reader configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("element source failed: {0}")]
    Source(Box<dyn Error + Send + Sync>),
    #[error(transparent)]
    Sort(#[from] SortError),
    #[error("worker {0} panicked")]
    Panic(String),
}

impl From<TopologyError<PipelineError>> for PipelineError {
    fn from(e: TopologyError<PipelineError>) -> PipelineError {
        match e {
            TopologyError::Worker(e) => e,
            TopologyError::Panic(name) => PipelineError::Panic(name),
        }
    }
}

/// Reader configuration
///
/// `dir` becomes the reader's exclusive working directory for the on-disk
/// indexes; it is created on construction and removed on close/drop.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    pub dir: PathBuf,
    /// Pass-2 processor workers
    pub process_threads: usize,
    /// Queue capacity between stages, in element batches
    pub queue_capacity: usize,
}

impl ReaderConfig {
    pub fn new(dir: &Path) -> ReaderConfig {
        ReaderConfig {
            dir: dir.to_path_buf(),
            process_threads: num_cpus::get(),
            queue_capacity: 8,
        }
    }
}

/// Counters observed by a progress logger; never a source of truth
#[derive(Default)]
pub struct ReaderStats {
    nodes: AtomicU64,
    ways: AtomicU64,
    relations: AtomicU64,
    features: AtomicU64,
    missing_nodes: AtomicU64,
    missing_multipolygon_ways: AtomicU64,
}

impl ReaderStats {
    pub fn nodes(&self) -> u64 {
        self.nodes.load(Ordering::Relaxed)
    }
    pub fn ways(&self) -> u64 {
        self.ways.load(Ordering::Relaxed)
    }
    pub fn relations(&self) -> u64 {
        self.relations.load(Ordering::Relaxed)
    }
    /// Source features handed to the profile in pass 2
    pub fn features(&self) -> u64 {
        self.features.load(Ordering::Relaxed)
    }
    /// Node references that had no stored location
    pub fn missing_nodes(&self) -> u64 {
        self.missing_nodes.load(Ordering::Relaxed)
    }
    /// Multipolygon way members with no materialized geometry
    pub fn missing_multipolygon_ways(&self) -> u64 {
        self.missing_multipolygon_ways.load(Ordering::Relaxed)
    }
}

/// Streaming reader digesting an OSM extract in two passes
///
/// Pass 1 scans the extract once and fills the auxiliary indexes: node
/// locations, way→relation back-references, the multipolygon way set and the
/// profile's relation summaries. Pass 2 scans again, reconstructs feature
/// geometries through the sealed indexes and pushes everything the profile
/// and renderer emit into an [`ExternalMergeSort`]. Ways are guaranteed to
/// be fully processed before any relation is: every processor stops at a
/// one-shot barrier when it first dequeues a relation (or when it shuts
/// down), so multipolygon geometry reads never race the writes.
pub struct OsmTwoPassReader {
    dir: PathBuf,
    process_threads: usize,
    queue_capacity: usize,
    nodes: NodeLocationStore,
    way_relations: WayToRelationIndex,
    multipolygon_ways: MultipolygonWaySet,
    multipolygon_geometry: MultipolygonWayGeometry,
    relation_infos: RelationInfoTable,
    stats: ReaderStats,
    pass1_done: bool,
    closed: bool,
}

impl OsmTwoPassReader {
    pub fn new(config: ReaderConfig) -> Result<OsmTwoPassReader, PipelineError> {
        if config.process_threads == 0 {
            return Err(PipelineError::Config(String::from(
                "process_threads must be at least 1",
            )));
        }
        if config.queue_capacity == 0 {
            return Err(PipelineError::Config(String::from(
                "queue_capacity must be at least 1",
            )));
        }
        fs::create_dir_all(&config.dir)
            .map_err(|e| PipelineError::Config(format!("work dir {:?}: {e}", config.dir)))?;
        Ok(OsmTwoPassReader {
            nodes: NodeLocationStore::create(&config.dir.join("node.loc"))?,
            way_relations: WayToRelationIndex::create(&config.dir.join("wayrel"))?,
            multipolygon_ways: MultipolygonWaySet::new(),
            multipolygon_geometry: MultipolygonWayGeometry::new(),
            relation_infos: RelationInfoTable::new(),
            stats: ReaderStats::default(),
            dir: config.dir,
            process_threads: config.process_threads,
            queue_capacity: config.queue_capacity,
            pass1_done: false,
            closed: false,
        })
    }

    /// Pass 1: build the indexes
    pub fn pass1<S, P>(&mut self, source: &S, profile: &P) -> Result<(), PipelineError>
    where
        S: ElementSource,
        P: Profile,
    {
        assert!(!self.pass1_done, "pass 1 ran twice");
        info!("pass 1: indexing elements");

        let queue_capacity = self.queue_capacity;
        let Self {
            nodes,
            way_relations,
            multipolygon_ways,
            relation_infos,
            stats,
            ..
        } = self;
        let nodes = &*nodes;
        let stats = &*stats;

        let result: Result<(), TopologyError<PipelineError>> = thread::scope(|s| {
            let mut topo = Topology::new(s);
            let (tx, rx) = topo.queue::<Vec<Element>>(queue_capacity);

            topo.spawn("source", move |_| source_worker(source, &tx));
            topo.spawn("indexer", move |_| {
                while let Some(batch) = rx.recv() {
                    for element in batch {
                        match element {
                            Element::Node(node) => {
                                stats.nodes.fetch_add(1, Ordering::Relaxed);
                                nodes.put(node.id, PackedLocation::encode(node.lon, node.lat))?;
                            }
                            Element::Way(_) => {
                                stats.ways.fetch_add(1, Ordering::Relaxed);
                            }
                            Element::Relation(relation) => {
                                stats.relations.fetch_add(1, Ordering::Relaxed);
                                let infos = profile.preprocess_relation(&relation);
                                if !infos.is_empty() {
                                    for way_id in relation.way_member_refs() {
                                        way_relations.put(way_id, relation.id)?;
                                    }
                                    for info in infos {
                                        relation_infos.put(relation.id, info);
                                    }
                                }
                                if relation.is_multipolygon() {
                                    for way_id in relation.way_member_refs() {
                                        multipolygon_ways.add(way_id);
                                    }
                                }
                            }
                        }
                    }
                }
                Ok(())
            });
            topo.join()
        });
        result.map_err(PipelineError::from)?;

        self.nodes.seal()?;
        self.way_relations.seal()?;
        self.pass1_done = true;
        info!(
            "pass 1 done: {} nodes, {} ways, {} relations ({} summarized, {} multipolygon ways)",
            self.stats.nodes(),
            self.stats.ways(),
            self.stats.relations(),
            self.relation_infos.len(),
            self.multipolygon_ways.len(),
        );
        Ok(())
    }

    /// Pass 2: reconstruct features and feed the sorter
    pub fn pass2<S, P, R>(
        &mut self,
        source: &S,
        profile: &P,
        renderer: &R,
        sorter: &mut ExternalMergeSort,
    ) -> Result<(), PipelineError>
    where
        S: ElementSource,
        P: Profile,
        R: FeatureRenderer<P::Renderable>,
    {
        assert!(self.pass1_done, "pass 2 before pass 1");
        info!("pass 2: emitting features");

        let process_threads = self.process_threads;
        let queue_capacity = self.queue_capacity;
        let ways_done = Barrier::new(process_threads);
        let Self {
            nodes,
            way_relations,
            multipolygon_ways,
            multipolygon_geometry,
            relation_infos,
            stats,
            ..
        } = self;
        let nodes = &*nodes;
        let way_relations = &*way_relations;
        let multipolygon_ways = &*multipolygon_ways;
        let multipolygon_geometry = &*multipolygon_geometry;
        let relation_infos = &*relation_infos;
        let stats = &*stats;

        let result: Result<(), TopologyError<PipelineError>> = thread::scope(|s| {
            let mut topo = Topology::new(s);
            let (tx_elements, rx_elements) = topo.queue::<Vec<Element>>(queue_capacity);
            let (tx_rendered, rx_rendered) = topo.queue::<Vec<RenderedFeature>>(queue_capacity);

            topo.spawn("source", move |_| source_worker(source, &tx_elements));
            for i in 0..process_threads {
                let rx = rx_elements.clone();
                let tx = tx_rendered.clone();
                let ways_done = &ways_done;
                topo.spawn(&format!("process-{i}"), move |_| {
                    let ctx = PassContext {
                        nodes,
                        way_relations,
                        multipolygon_ways,
                        multipolygon_geometry,
                        relation_infos,
                        stats,
                        profile,
                        renderer,
                    };
                    process_worker(&ctx, ways_done, &rx, &tx)
                });
            }
            drop(rx_elements);
            drop(tx_rendered);
            topo.spawn("sink", move |_| {
                while let Some(batch) = rx_rendered.recv() {
                    for feature in batch {
                        sorter.add(Entry {
                            sort_key: feature.sort_key,
                            payload: feature.payload,
                        })?;
                    }
                }
                Ok(())
            });
            topo.join()
        });
        result.map_err(PipelineError::from)?;

        info!(
            "pass 2 done: {} features ({} missing node refs, {} missing multipolygon ways)",
            self.stats.features(),
            self.stats.missing_nodes(),
            self.stats.missing_multipolygon_ways(),
        );
        Ok(())
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    /// Drop the indexes and remove the working directory
    pub fn close(mut self) -> Result<(), io::Error> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Result<(), io::Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        fs::remove_dir_all(&self.dir)
    }
}

impl Drop for OsmTwoPassReader {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Read the source and push element batches downstream
fn source_worker<S: ElementSource>(
    source: &S,
    tx: &QueueSender<Vec<Element>>,
) -> Result<(), PipelineError> {
    let mut batch = Vec::with_capacity(BATCH_LEN);
    let result = source.read_elements(&mut |element| {
        batch.push(element);
        if batch.len() < BATCH_LEN {
            return true;
        }
        let full = mem::replace(&mut batch, Vec::with_capacity(BATCH_LEN));
        tx.send(full)
    });
    result.map_err(PipelineError::Source)?;
    if !batch.is_empty() {
        tx.send(batch);
    }
    Ok(())
}

struct PassContext<'a, P, R> {
    nodes: &'a NodeLocationStore,
    way_relations: &'a WayToRelationIndex,
    multipolygon_ways: &'a MultipolygonWaySet,
    multipolygon_geometry: &'a MultipolygonWayGeometry,
    relation_infos: &'a RelationInfoTable,
    stats: &'a ReaderStats,
    profile: &'a P,
    renderer: &'a R,
}

fn process_worker<P, R>(
    ctx: &PassContext<'_, P, R>,
    ways_done: &Barrier,
    rx: &QueueReceiver<Vec<Element>>,
    tx: &QueueSender<Vec<RenderedFeature>>,
) -> Result<(), PipelineError>
where
    P: Profile,
    R: FeatureRenderer<P::Renderable>,
{
    let mut reached_barrier = false;
    let result = process_loop(ctx, ways_done, &mut reached_barrier, rx, tx);
    // A worker that never dequeued a relation still has to release its
    // peers, on error paths included.
    if !reached_barrier {
        ways_done.wait();
    }
    result
}

fn process_loop<P, R>(
    ctx: &PassContext<'_, P, R>,
    ways_done: &Barrier,
    reached_barrier: &mut bool,
    rx: &QueueReceiver<Vec<Element>>,
    tx: &QueueSender<Vec<RenderedFeature>>,
) -> Result<(), PipelineError>
where
    P: Profile,
    R: FeatureRenderer<P::Renderable>,
{
    let mut rendered: Vec<RenderedFeature> = Vec::new();
    while let Some(batch) = rx.recv() {
        for element in batch {
            let feature = match element {
                Element::Node(node) => Some(SourceFeature::Node {
                    id: node.id,
                    location: PackedLocation::encode(node.lon, node.lat),
                }),
                Element::Way(way) => way_feature(ctx, way)?,
                Element::Relation(relation) => {
                    if !*reached_barrier {
                        *reached_barrier = true;
                        ways_done.wait();
                    }
                    relation_feature(ctx, relation)
                }
            };
            if let Some(feature) = feature {
                ctx.stats.features.fetch_add(1, Ordering::Relaxed);
                ctx.profile.process_feature(&feature, &mut |renderable| {
                    ctx.renderer.render(renderable, &mut |f| rendered.push(f));
                });
            }
            if rendered.len() >= BATCH_LEN && !tx.send(mem::take(&mut rendered)) {
                return Ok(());
            }
        }
    }
    if !rendered.is_empty() {
        tx.send(rendered);
    }
    Ok(())
}

/// Assemble a way's geometry and relation memberships
fn way_feature<P, R>(
    ctx: &PassContext<'_, P, R>,
    way: Way,
) -> Result<Option<SourceFeature>, PipelineError> {
    let mut geometry = Vec::with_capacity(way.node_refs.len());
    for &node_ref in &way.node_refs {
        let loc = ctx.nodes.get(node_ref)?;
        if loc.is_missing() {
            ctx.stats.missing_nodes.fetch_add(1, Ordering::Relaxed);
            debug!("way {}: no location for node {node_ref}", way.id);
        } else {
            geometry.push(loc);
        }
    }
    if ctx.multipolygon_ways.contains(way.id) {
        ctx.multipolygon_geometry.put(way.id, geometry.clone());
    }
    if geometry.len() < 2 {
        return Ok(None);
    }

    let mut relations = Vec::new();
    for relation_id in ctx.way_relations.get(way.id)? {
        for info in ctx.relation_infos.get(relation_id) {
            relations.push(RelationMembership {
                relation_id,
                info: info.clone(),
            });
        }
    }
    Ok(Some(SourceFeature::Way {
        id: way.id,
        tags: way.tags,
        geometry,
        relations,
    }))
}

/// Assemble a multipolygon's rings; other relations yield nothing here,
/// their summaries already travelled with the member ways
fn relation_feature<P, R>(
    ctx: &PassContext<'_, P, R>,
    relation: Relation,
) -> Option<SourceFeature> {
    if !relation.is_multipolygon() {
        return None;
    }

    let mut rings: Vec<Vec<PackedLocation>> = Vec::new();
    let mut current: Vec<PackedLocation> = Vec::new();
    for way_id in relation.way_member_refs() {
        let Some(mut locs) = ctx.multipolygon_geometry.get(way_id) else {
            ctx.stats
                .missing_multipolygon_ways
                .fetch_add(1, Ordering::Relaxed);
            debug!("relation {}: no geometry for way {way_id}", relation.id);
            continue;
        };
        if locs.is_empty() {
            continue;
        }
        if current.is_empty() {
            current = locs;
        } else {
            // Stitch onto the open ring, reversing the segment if its far
            // end is the one that matches
            let end = *current.last().unwrap();
            if locs.first() == Some(&end) {
                current.extend(locs.into_iter().skip(1));
            } else if locs.last() == Some(&end) {
                locs.reverse();
                current.extend(locs.into_iter().skip(1));
            } else {
                rings.push(mem::take(&mut current));
                current = locs;
            }
        }
        if current.len() > 3 && current.first() == current.last() {
            // Closed: drop the duplicated closing vertex
            current.pop();
            rings.push(mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        rings.push(current);
    }

    if rings.is_empty() {
        return None;
    }
    Some(SourceFeature::Multipolygon {
        id: relation.id,
        tags: relation.tags,
        rings,
    })
}
