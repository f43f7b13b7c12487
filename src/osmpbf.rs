//! Reader for OpenStreetMap pbf files

use osmpbfreader;
use std::error::Error;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::osm::{Element, Member, MemberType, Node, Relation, Tags, Way, decimicro_to_coord};
use crate::reader::ElementSource;

/// Element source reading a `.osm.pbf` file
///
/// Only the path is held, so the file can be opened once per pass. Block
/// decompression runs on `osmpbfreader`'s internal worker pool.
pub struct OsmPbf {
    filename: PathBuf,
}

impl OsmPbf {
    pub fn new(filename: &Path) -> OsmPbf {
        OsmPbf {
            filename: filename.to_path_buf(),
        }
    }
}

fn convert_tags(tags: osmpbfreader::Tags) -> Tags {
    tags.into_inner()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl ElementSource for OsmPbf {
    #[allow(clippy::cast_sign_loss)]
    fn read_elements(
        &self,
        sink: &mut dyn FnMut(Element) -> bool,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let file = File::open(&self.filename)?;
        let mut pbf = osmpbfreader::OsmPbfReader::new(file);

        for obj in pbf.par_iter() {
            let element = match obj? {
                osmpbfreader::OsmObj::Node(node) => Element::Node(Node {
                    id: node.id.0 as u64,
                    lon: decimicro_to_coord(node.decimicro_lon),
                    lat: decimicro_to_coord(node.decimicro_lat),
                    tags: convert_tags(node.tags),
                }),
                osmpbfreader::OsmObj::Way(way) => Element::Way(Way {
                    id: way.id.0 as u64,
                    node_refs: way.nodes.iter().map(|n| n.0 as u64).collect(),
                    tags: convert_tags(way.tags),
                }),
                osmpbfreader::OsmObj::Relation(relation) => {
                    let mut members = Vec::with_capacity(relation.refs.len());
                    for r in relation.refs {
                        let (member_type, ref_) = match r.member {
                            osmpbfreader::objects::OsmId::Node(id) => {
                                (MemberType::Node, id.0 as u64)
                            }
                            osmpbfreader::objects::OsmId::Way(id) => (MemberType::Way, id.0 as u64),
                            osmpbfreader::objects::OsmId::Relation(id) => {
                                (MemberType::Relation, id.0 as u64)
                            }
                        };
                        members.push(Member {
                            member_type,
                            ref_,
                            role: r.role.to_string(),
                        });
                    }
                    Element::Relation(Relation {
                        id: relation.id.0 as u64,
                        members,
                        tags: convert_tags(relation.tags),
                    })
                }
            };
            if !sink(element) {
                break;
            }
        }
        Ok(())
    }
}
