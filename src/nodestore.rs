//! Disk-backed store of node locations

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::osm::PackedLocation;

/// Size of one location record in the store file
const RECORD_SIZE: u64 = 8;

/// Ids are striped over this many write buffers
const SHARD_COUNT: usize = 64;

/// Records buffered per shard before they are flushed to disk
const DEFAULT_FLUSH_LEN: usize = 64 * 1024;

/// Blocks of ids sharing a shard, so a flush writes mostly consecutive records
const SHARD_BLOCK_SHIFT: u64 = 8;

/// Store of node locations, directly indexed by node id
///
/// The store is a single file of fixed 8-byte records at offset `id * 8`.
/// Node ids are roughly monotonic but very sparse, so unallocated ranges are
/// never written and the file stays far smaller than `max(node_id) * 8`,
/// thanks to sparse files. An all-zero record means the id was never stored
/// ([`PackedLocation`] guarantees a valid location never encodes to zero).
///
/// Writes go through striped buffers so that concurrent `put` is safe during
/// the first pass; after [`NodeLocationStore::seal`] the buffers are empty
/// and `get` reads the file with positional reads, without any locking.
pub struct NodeLocationStore {
    file: File,
    shards: Vec<Mutex<Vec<(u64, u64)>>>,
    flush_len: usize,
    sealed: AtomicBool,
}

impl NodeLocationStore {
    /// Create an empty store backed by the file at `path`
    pub fn create(path: &Path) -> Result<NodeLocationStore, io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(NodeLocationStore {
            file,
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
            flush_len: DEFAULT_FLUSH_LEN,
            sealed: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    fn with_flush_len(path: &Path, flush_len: usize) -> Result<NodeLocationStore, io::Error> {
        let mut store = Self::create(path)?;
        store.flush_len = flush_len;
        Ok(store)
    }

    fn shard_of(id: u64) -> usize {
        ((id >> SHARD_BLOCK_SHIFT) as usize) % SHARD_COUNT
    }

    /// Record the location of a node
    ///
    /// Safe to call from several threads at once. Calling twice for the same
    /// id keeps the last value; other ids are unaffected because records are
    /// fixed-width and written positionally.
    pub fn put(&self, id: u64, loc: PackedLocation) -> Result<(), io::Error> {
        assert!(
            !self.sealed.load(Ordering::Acquire),
            "put on a sealed NodeLocationStore"
        );
        let mut pending = self.shards[Self::shard_of(id)].lock().unwrap();
        pending.push((id, loc.to_bits()));
        if pending.len() >= self.flush_len {
            self.flush(&mut pending)?;
        }
        Ok(())
    }

    /// Flush every buffer and allow concurrent readers
    pub fn seal(&mut self) -> Result<(), io::Error> {
        for shard in &self.shards {
            let mut pending = shard.lock().unwrap();
            self.flush(&mut pending)?;
        }
        self.file.sync_data()?;
        self.sealed.store(true, Ordering::Release);
        Ok(())
    }

    /// Look up a node location; [`PackedLocation::MISSING`] for unknown ids
    pub fn get(&self, id: u64) -> Result<PackedLocation, io::Error> {
        debug_assert!(
            self.sealed.load(Ordering::Acquire),
            "get on an unsealed NodeLocationStore"
        );
        let mut buf = [0u8; RECORD_SIZE as usize];
        match self.file.read_exact_at(&mut buf, id * RECORD_SIZE) {
            Ok(()) => Ok(PackedLocation::from_bits(u64::from_be_bytes(buf))),
            // Beyond the last written record: never stored
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(PackedLocation::MISSING),
            Err(e) => Err(e),
        }
    }

    /// Sort a shard's records and write them as runs of consecutive ids,
    /// so most flushes end up as a few large positional writes.
    fn flush(&self, pending: &mut Vec<(u64, u64)>) -> Result<(), io::Error> {
        if pending.is_empty() {
            return Ok(());
        }
        // Stable by id: a duplicate put keeps its insertion order, and the
        // later record overwrites the earlier one below.
        pending.sort_by_key(|&(id, _)| id);

        let mut run_start = pending[0].0;
        let mut prev_id = run_start;
        let mut buf: Vec<u8> = Vec::with_capacity(RECORD_SIZE as usize * pending.len());
        buf.extend_from_slice(&pending[0].1.to_be_bytes());

        for &(id, bits) in &pending[1..] {
            if id == prev_id {
                let last = buf.len() - RECORD_SIZE as usize;
                buf[last..].copy_from_slice(&bits.to_be_bytes());
            } else if id == prev_id + 1 {
                buf.extend_from_slice(&bits.to_be_bytes());
                prev_id = id;
            } else {
                self.file.write_all_at(&buf, run_start * RECORD_SIZE)?;
                buf.clear();
                buf.extend_from_slice(&bits.to_be_bytes());
                run_start = id;
                prev_id = id;
            }
        }
        self.file.write_all_at(&buf, run_start * RECORD_SIZE)?;
        pending.clear();
        Ok(())
    }
}
