use clap::Parser;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use osm_tileflow::extsort::{ExternalMergeSort, SortConfig, default_chunk_size_limit};
use osm_tileflow::osm::Relation;
use osm_tileflow::osmpbf::OsmPbf;
use osm_tileflow::profile::{FeatureRenderer, Profile, RenderedFeature, SourceFeature};
use osm_tileflow::reader::{OsmTwoPassReader, ReaderConfig};
use osm_tileflow::relinfo::RelationInfo;

#[derive(Parser, Debug)]
#[command(version, about = "Run a pbf extract through both passes and the sort", long_about = None)]
struct Args {
    #[arg(help = "Input .osm.pbf file")]
    input: String,
    #[arg(long, default_value = "tileflow-work", help = "Working directory for indexes and sort spills")]
    workdir: String,
    #[arg(long, help = "Processing and sort threads (default: all cores)")]
    threads: Option<usize>,
    #[arg(long, default_value_t = 4_294_967_296, help = "Heap budget in bytes for the sorter")]
    max_heap: u64,
}

/// Renders every reconstructed feature keyed by its element id
struct IdProfile;

impl Profile for IdProfile {
    type Renderable = RenderedFeature;
    fn preprocess_relation(&self, _relation: &Relation) -> Vec<Arc<dyn RelationInfo>> {
        Vec::new()
    }
    #[allow(clippy::cast_possible_wrap)]
    fn process_feature(&self, feature: &SourceFeature, emit: &mut dyn FnMut(RenderedFeature)) {
        emit(RenderedFeature {
            sort_key: feature.id() as i64,
            payload: Vec::new(),
        });
    }
}

struct PassthroughRenderer;

impl FeatureRenderer<RenderedFeature> for PassthroughRenderer {
    fn render(&self, renderable: RenderedFeature, emit: &mut dyn FnMut(RenderedFeature)) {
        emit(renderable);
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let workdir = Path::new(&args.workdir);

    let mut reader_config = ReaderConfig::new(&workdir.join("indexes"));
    if let Some(threads) = args.threads {
        reader_config.process_threads = threads;
    }
    let mut sort_config = SortConfig::new(&workdir.join("sort"), args.max_heap);
    if let Some(threads) = args.threads {
        sort_config.workers = threads;
        sort_config.chunk_size_limit = default_chunk_size_limit(args.max_heap, threads);
    }

    let mut reader = OsmTwoPassReader::new(reader_config)?;
    let mut sorter = ExternalMergeSort::new(sort_config)?;
    let source = OsmPbf::new(Path::new(&args.input));

    reader.pass1(&source, &IdProfile)?;
    reader.pass2(&source, &IdProfile, &PassthroughRenderer, &mut sorter)?;

    let stats = reader.stats();
    println!(
        "read {} nodes, {} ways, {} relations; {} features ({} missing node refs)",
        stats.nodes(),
        stats.ways(),
        stats.relations(),
        stats.features(),
        stats.missing_nodes(),
    );

    sorter.sort()?;
    let mut count = 0u64;
    let mut last_key = i64::MIN;
    for entry in sorter.iter()? {
        let entry = entry?;
        debug_assert!(entry.sort_key >= last_key);
        last_key = entry.sort_key;
        count += 1;
    }
    println!("{count} rendered features sorted");

    reader.close()?;
    Ok(())
}
