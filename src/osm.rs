//! Basic handling of OpenStreetMap data

/// Decimicro offset that keeps every valid coordinate word non-zero,
/// so an all-zero record can stand for a missing location.
const COORD_OFFSET: i64 = 1_800_000_000;

/// Tags of an element, in file order
pub type Tags = Vec<(String, String)>;

/// Returns the value of `key` in `tags`, if present.
pub fn tag_value<'a>(tags: &'a [(String, String)], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[allow(clippy::cast_possible_truncation)]
/// Convert a floating-point latitude/longitude to the decimicro format
pub fn coord_to_decimicro(coord: f64) -> i32 {
    (coord * 1e7).round() as i32
}
/// Convert a decimicro latitude/longitude to floating-point
pub fn decimicro_to_coord(decimicro: i32) -> f64 {
    f64::from(decimicro) * 1e-7
}

/// Longitude/latitude packed into 64 bits
///
/// Both coordinates are quantized to decimicro degrees (10⁻⁷ degrees) and
/// stored offset by 1.8×10⁹, longitude in the high word and latitude in the
/// low word. A valid latitude always yields a non-zero low word, so the
/// all-zero value is reserved for [`PackedLocation::MISSING`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedLocation(u64);

impl PackedLocation {
    /// Sentinel for a node id that was never stored
    pub const MISSING: PackedLocation = PackedLocation(0);

    /// Pack a longitude/latitude pair given in degrees
    pub fn encode(lon: f64, lat: f64) -> PackedLocation {
        Self::from_decimicro(coord_to_decimicro(lon), coord_to_decimicro(lat))
    }

    /// Pack a longitude/latitude pair given in decimicro degrees
    #[allow(clippy::cast_sign_loss)]
    pub fn from_decimicro(decimicro_lon: i32, decimicro_lat: i32) -> PackedLocation {
        debug_assert!((-COORD_OFFSET..=COORD_OFFSET).contains(&i64::from(decimicro_lon)));
        debug_assert!((-COORD_OFFSET / 2..=COORD_OFFSET / 2).contains(&i64::from(decimicro_lat)));
        let lon = (i64::from(decimicro_lon) + COORD_OFFSET) as u64;
        let lat = (i64::from(decimicro_lat) + COORD_OFFSET) as u64;
        PackedLocation((lon << 32) | lat)
    }

    pub fn is_missing(self) -> bool {
        self.0 == 0
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn decimicro_lon(self) -> i32 {
        ((self.0 >> 32) as i64 - COORD_OFFSET) as i32
    }
    #[allow(clippy::cast_possible_truncation)]
    pub fn decimicro_lat(self) -> i32 {
        ((self.0 & 0xffff_ffff) as i64 - COORD_OFFSET) as i32
    }

    /// Returns the longitude in degrees.
    pub fn lon(self) -> f64 {
        decimicro_to_coord(self.decimicro_lon())
    }
    /// Returns the latitude in degrees.
    pub fn lat(self) -> f64 {
        decimicro_to_coord(self.decimicro_lat())
    }

    /// Raw 64-bit value, as stored on disk
    pub fn to_bits(self) -> u64 {
        self.0
    }
    /// Rebuild a location from its stored 64-bit value
    pub fn from_bits(bits: u64) -> PackedLocation {
        PackedLocation(bits)
    }
}

/// Node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    /// Node id
    pub id: u64,
    /// Longitude in degrees
    pub lon: f64,
    /// Latitude in degrees
    pub lat: f64,
    /// Tags
    pub tags: Tags,
}

/// Way
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Way {
    /// Way id
    pub id: u64,
    /// List of ordered node references
    pub node_refs: Vec<u64>,
    /// Tags
    pub tags: Tags,
}

/// Type of a relation member
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

/// Relation member
#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    /// Member type: node/way/relation
    pub member_type: MemberType,
    /// node/way/relation id
    pub ref_: u64,
    /// Role in relation
    pub role: String,
}

/// Relation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Relation {
    /// Relation id
    pub id: u64,
    /// List of ordered members
    pub members: Vec<Member>,
    /// Tags
    pub tags: Tags,
}

impl Relation {
    /// True when the relation carries `type=multipolygon`
    pub fn is_multipolygon(&self) -> bool {
        tag_value(&self.tags, "type") == Some("multipolygon")
    }

    /// Iterator over the way-type member ids, in member order
    pub fn way_member_refs(&self) -> impl Iterator<Item = u64> + '_ {
        self.members
            .iter()
            .filter(|m| m.member_type == MemberType::Way)
            .map(|m| m.ref_)
    }
}

/// Element read from an OSM extract
#[derive(Clone, Debug, PartialEq)]
pub enum Element {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_location_roundtrip() {
        for decimicro_lon in (-1_800_000_000_i32..=1_800_000_000_i32).step_by(130_000_000) {
            for decimicro_lat in (-900_000_000_i32..=900_000_000_i32).step_by(70_000_000) {
                let loc = PackedLocation::from_decimicro(decimicro_lon, decimicro_lat);
                assert_eq!(decimicro_lon, loc.decimicro_lon());
                assert_eq!(decimicro_lat, loc.decimicro_lat());
                assert!(!loc.is_missing());
            }
        }
    }

    #[test]
    fn packed_location_encode_quantizes() {
        let loc = PackedLocation::encode(2.294_481_2, 48.858_370_1);
        assert_eq!(22_944_812, loc.decimicro_lon());
        assert_eq!(488_583_701, loc.decimicro_lat());
        assert!((loc.lon() - 2.294_481_2).abs() < 1e-7);
        assert!((loc.lat() - 48.858_370_1).abs() < 1e-7);
    }

    #[test]
    fn packed_location_extremes_are_not_missing() {
        assert!(!PackedLocation::encode(-180.0, -90.0).is_missing());
        assert!(!PackedLocation::encode(180.0, 90.0).is_missing());
        assert!(!PackedLocation::encode(0.0, 0.0).is_missing());
        assert!(PackedLocation::MISSING.is_missing());
    }

    #[test]
    fn packed_location_bits_roundtrip() {
        let loc = PackedLocation::encode(-62.836_307_4, 17.903_174_5);
        assert_eq!(loc, PackedLocation::from_bits(loc.to_bits()));
    }

    #[test]
    fn multipolygon_detection() {
        let mut rel = Relation {
            id: 200,
            members: vec![
                Member {
                    member_type: MemberType::Way,
                    ref_: 100,
                    role: String::from("outer"),
                },
                Member {
                    member_type: MemberType::Node,
                    ref_: 1,
                    role: String::from("admin_centre"),
                },
                Member {
                    member_type: MemberType::Way,
                    ref_: 101,
                    role: String::from("inner"),
                },
            ],
            tags: vec![(String::from("type"), String::from("boundary"))],
        };
        assert!(!rel.is_multipolygon());
        rel.tags = vec![(String::from("type"), String::from("multipolygon"))];
        assert!(rel.is_multipolygon());
        assert_eq!(vec![100, 101], rel.way_member_refs().collect::<Vec<_>>());
    }
}
