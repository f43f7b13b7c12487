//! Stream OpenStreetMap extracts into a sorted feature stream
//!
//! osm-tileflow is the ingestion and sorting core of a vector-tile build
//! pipeline: a two-pass reader digests an OSM extract through disk-backed
//! indexes, a user profile maps elements to renderable features, and an
//! external merge sort orders the rendered features for tile assembly.

pub mod extsort;
pub mod multipoly;
pub mod nodestore;
pub mod osm;
pub mod osmpbf;
pub mod profile;
pub mod reader;
pub mod relinfo;
pub mod topology;
pub mod wayindex;
