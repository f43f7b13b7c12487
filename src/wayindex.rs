//! Way → relation back-reference index

use byteorder::{BigEndian, WriteBytesExt};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Size of one (way_id, relation_id) record
const PAIR_SIZE: u64 = 16;

/// Pairs buffered in memory before a sorted run is spilled (16 MiB)
const DEFAULT_SPILL_LEN: usize = 1 << 20;

const MERGED_NAME: &str = "wayrel.idx";

/// Index from a way id to the relations that reference it
///
/// Built append-only during the first pass: pairs accumulate in memory and
/// are spilled to disk as way_id-sorted run files above a configurable
/// threshold. [`WayToRelationIndex::seal`] merges the runs into a single
/// sorted file of fixed 16-byte big-endian records, which `get` then
/// binary-searches with positional reads, safe for concurrent readers.
/// Duplicate pairs are preserved.
pub struct WayToRelationIndex {
    dir: PathBuf,
    spill_len: usize,
    buffer: Vec<(u64, u64)>,
    runs: Vec<(PathBuf, u64)>,
    sealed: Option<Sealed>,
}

struct Sealed {
    file: File,
    records: u64,
}

impl WayToRelationIndex {
    /// Create an empty index keeping its files under `dir`
    pub fn create(dir: &Path) -> Result<WayToRelationIndex, io::Error> {
        Self::with_spill_len(dir, DEFAULT_SPILL_LEN)
    }

    /// Create an empty index spilling a run every `spill_len` pairs
    pub fn with_spill_len(dir: &Path, spill_len: usize) -> Result<WayToRelationIndex, io::Error> {
        fs::create_dir_all(dir)?;
        Ok(WayToRelationIndex {
            dir: dir.to_path_buf(),
            spill_len,
            buffer: Vec::new(),
            runs: Vec::new(),
            sealed: None,
        })
    }

    /// Record that `relation_id` references way `way_id`
    pub fn put(&mut self, way_id: u64, relation_id: u64) -> Result<(), io::Error> {
        assert!(self.sealed.is_none(), "put on a sealed WayToRelationIndex");
        self.buffer.push((way_id, relation_id));
        if self.buffer.len() >= self.spill_len {
            self.spill_run()?;
        }
        Ok(())
    }

    fn spill_run(&mut self) -> Result<(), io::Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort_by_key(|&(way, _)| way);
        let path = self.dir.join(format!("wayrel.run{}", self.runs.len()));
        let mut writer = BufWriter::new(File::create(&path)?);
        for &(way, rel) in &self.buffer {
            writer.write_u64::<BigEndian>(way)?;
            writer.write_u64::<BigEndian>(rel)?;
        }
        writer.into_inner().map_err(io::Error::from)?.sync_data()?;
        self.runs.push((path, self.buffer.len() as u64));
        self.buffer.clear();
        Ok(())
    }

    /// Merge all runs into the final sorted record file
    pub fn seal(&mut self) -> Result<(), io::Error> {
        assert!(self.sealed.is_none(), "double seal on WayToRelationIndex");
        self.spill_run()?;

        let merged_path = self.dir.join(MERGED_NAME);
        let merged_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&merged_path)?;
        let mut writer = BufWriter::new(merged_file);
        let mut records = 0u64;

        let mut readers: Vec<BufReader<File>> = Vec::with_capacity(self.runs.len());
        let mut heap: BinaryHeap<Reverse<(u64, u64, usize)>> = BinaryHeap::new();
        for (i, (path, _)) in self.runs.iter().enumerate() {
            let mut reader = BufReader::new(File::open(path)?);
            if let Some((way, rel)) = read_pair(&mut reader)? {
                heap.push(Reverse((way, rel, i)));
            }
            readers.push(reader);
        }
        while let Some(Reverse((way, rel, i))) = heap.pop() {
            writer.write_u64::<BigEndian>(way)?;
            writer.write_u64::<BigEndian>(rel)?;
            records += 1;
            if let Some((way, rel)) = read_pair(&mut readers[i])? {
                heap.push(Reverse((way, rel, i)));
            }
        }
        let file = writer.into_inner().map_err(io::Error::from)?;
        file.sync_data()?;

        for (path, _) in self.runs.drain(..) {
            fs::remove_file(path)?;
        }
        self.sealed = Some(Sealed { file, records });
        Ok(())
    }

    /// All relation ids referencing `way_id`; empty for unknown ways
    ///
    /// Duplicates are returned as stored. The order is unspecified but
    /// stable across repeated queries.
    pub fn get(&self, way_id: u64) -> Result<Vec<u64>, io::Error> {
        let sealed = self
            .sealed
            .as_ref()
            .expect("get on an unsealed WayToRelationIndex");
        let mut relations = Vec::new();
        let mut index = lower_bound(sealed, way_id)?;
        while index < sealed.records {
            let (way, rel) = pair_at(&sealed.file, index)?;
            if way != way_id {
                break;
            }
            relations.push(rel);
            index += 1;
        }
        Ok(relations)
    }

    /// Number of stored (way_id, relation_id) pairs
    pub fn len(&self) -> u64 {
        match &self.sealed {
            Some(sealed) => sealed.records,
            None => {
                self.buffer.len() as u64 + self.runs.iter().map(|&(_, n)| n).sum::<u64>()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First record index whose way id is not below `way_id`
fn lower_bound(sealed: &Sealed, way_id: u64) -> Result<u64, io::Error> {
    let mut lo = 0u64;
    let mut hi = sealed.records;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let (way, _) = pair_at(&sealed.file, mid)?;
        if way < way_id {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

fn pair_at(file: &File, index: u64) -> Result<(u64, u64), io::Error> {
    let mut buf = [0u8; PAIR_SIZE as usize];
    file.read_exact_at(&mut buf, index * PAIR_SIZE)?;
    let way = u64::from_be_bytes(buf[0..8].try_into().unwrap());
    let rel = u64::from_be_bytes(buf[8..16].try_into().unwrap());
    Ok((way, rel))
}

fn read_pair<R: Read>(reader: &mut R) -> Result<Option<(u64, u64)>, io::Error> {
    let mut buf = [0u8; PAIR_SIZE as usize];
    match reader.read_exact(&mut buf) {
        Ok(()) => {
            let way = u64::from_be_bytes(buf[0..8].try_into().unwrap());
            let rel = u64::from_be_bytes(buf[8..16].try_into().unwrap());
            Ok(Some((way, rel)))
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}
