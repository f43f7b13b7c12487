//! Bounded-memory external merge sort of keyed byte payloads

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rayon::prelude::*;
use std::cmp::{self, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const GIB: u64 = 1 << 30;

/// Approximate in-memory footprint of one materialized entry besides its
/// payload bytes: the key, the payload vector header and allocator slack.
const ENTRY_OVERHEAD: u64 = 64;

#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("invalid sorter configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("chunk {path:?} ended after {got} of {expected} entries")]
    ShortChunk {
        path: PathBuf,
        expected: u64,
        got: u64,
    },
    #[error("payload of {0} bytes does not fit the chunk framing")]
    PayloadTooLarge(usize),
}

/// One sortable entry: a key and an opaque payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub sort_key: i64,
    pub payload: Vec<u8>,
}

/// Number of sort workers matching the machine
pub fn default_workers() -> usize {
    num_cpus::get()
}

/// Largest chunk that keeps `workers` concurrently loaded chunks within
/// half of the heap budget, capped at 1 GiB
pub fn default_chunk_size_limit(max_heap_bytes: u64, workers: usize) -> u64 {
    cmp::max(1, cmp::min(GIB, max_heap_bytes / 2 / cmp::max(1, workers) as u64))
}

/// Sorter configuration
///
/// `temp_dir` becomes the sorter's exclusive property: it is created on
/// construction and removed, with everything in it, when the sorter drops.
#[derive(Clone, Debug)]
pub struct SortConfig {
    pub chunk_size_limit: u64,
    pub workers: usize,
    pub max_heap_bytes: u64,
    pub temp_dir: PathBuf,
}

impl SortConfig {
    /// Defaults derived from the heap budget and the machine
    pub fn new(temp_dir: &Path, max_heap_bytes: u64) -> SortConfig {
        let workers = default_workers();
        SortConfig {
            chunk_size_limit: default_chunk_size_limit(max_heap_bytes, workers),
            workers,
            max_heap_bytes,
            temp_dir: temp_dir.to_path_buf(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Building,
    Sorting,
    Reading,
}

struct Chunk {
    path: PathBuf,
    item_count: u64,
}

struct ChunkWriter {
    writer: BufWriter<File>,
    chunk: Chunk,
    bytes_in_memory: u64,
}

/// External merge sort over [`Entry`] values
///
/// Entries stream to length-prefixed chunk files as they are added, with an
/// in-memory byte estimate deciding when to cut a chunk. [`sort`] loads and
/// sorts each chunk in place on a pool of `workers` threads, so at most
/// `workers × chunk_size_limit` estimated bytes of entries are resident at
/// once. [`iter`] merges the sorted chunks through a min-heap into a single
/// non-decreasing, single-pass stream.
///
/// [`sort`]: ExternalMergeSort::sort
/// [`iter`]: ExternalMergeSort::iter
pub struct ExternalMergeSort {
    config: SortConfig,
    state: State,
    chunks: Vec<Chunk>,
    current: Option<ChunkWriter>,
    entries: u64,
    drained: bool,
}

impl ExternalMergeSort {
    pub fn new(config: SortConfig) -> Result<ExternalMergeSort, SortError> {
        if config.workers == 0 {
            return Err(SortError::Config(String::from("workers must be at least 1")));
        }
        if config.chunk_size_limit == 0 {
            return Err(SortError::Config(String::from(
                "chunk_size_limit must be at least 1 byte",
            )));
        }
        let budget = config.max_heap_bytes / 2;
        let needed = config.chunk_size_limit.saturating_mul(config.workers as u64);
        if needed > budget {
            return Err(SortError::Config(format!(
                "{} workers × {} bytes per chunk exceeds half of the {}-byte heap budget",
                config.workers, config.chunk_size_limit, config.max_heap_bytes
            )));
        }
        fs::create_dir_all(&config.temp_dir).map_err(|e| {
            SortError::Config(format!(
                "temp dir {:?} is not writable: {e}",
                config.temp_dir
            ))
        })?;
        Ok(ExternalMergeSort {
            config,
            state: State::Building,
            chunks: Vec::new(),
            current: None,
            entries: 0,
            drained: false,
        })
    }

    /// Append one entry to the current chunk
    pub fn add(&mut self, entry: Entry) -> Result<(), SortError> {
        assert!(self.state == State::Building, "add after sort");
        let payload_len = entry.payload.len();
        if i32::try_from(payload_len).is_err() {
            return Err(SortError::PayloadTooLarge(payload_len));
        }

        if self.current.is_none() {
            let path = self.config.temp_dir.join(format!("chunk{}.dat", self.chunks.len()));
            self.current = Some(ChunkWriter {
                writer: BufWriter::new(File::create(&path)?),
                chunk: Chunk {
                    path,
                    item_count: 0,
                },
                bytes_in_memory: 0,
            });
        }
        let current = self.current.as_mut().unwrap();
        write_entry(&mut current.writer, &entry)?;
        current.chunk.item_count += 1;
        current.bytes_in_memory += ENTRY_OVERHEAD + payload_len as u64;
        self.entries += 1;

        if current.bytes_in_memory >= self.config.chunk_size_limit {
            self.finish_chunk()?;
        }
        Ok(())
    }

    fn finish_chunk(&mut self) -> Result<(), SortError> {
        if let Some(current) = self.current.take() {
            let file = current.writer.into_inner().map_err(io::Error::from)?;
            file.sync_data()?;
            self.chunks.push(current.chunk);
        }
        Ok(())
    }

    /// Sort every chunk file in place, in parallel
    pub fn sort(&mut self) -> Result<(), SortError> {
        assert!(self.state == State::Building, "double sort");
        self.state = State::Sorting;
        self.finish_chunk()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| SortError::Config(e.to_string()))?;
        pool.install(|| self.chunks.par_iter().try_for_each(sort_chunk))?;

        self.state = State::Reading;
        Ok(())
    }

    /// Merged iterator over all entries, non-decreasing by sort key
    ///
    /// Single-pass: the iterator consumes the sorted chunks and cannot be
    /// re-created. I/O errors end the iteration and are yielded to the
    /// consumer.
    pub fn iter(&mut self) -> Result<SortedIter<'_>, SortError> {
        assert!(self.state == State::Reading, "iter before sort");
        assert!(!self.drained, "second iter on ExternalMergeSort");
        self.drained = true;

        let mut readers = Vec::new();
        let mut heap = BinaryHeap::new();
        for chunk in self.chunks.iter().filter(|c| c.item_count > 0) {
            let mut reader = ChunkReader::open(chunk)?;
            if let Some(entry) = &reader.peeked {
                heap.push(Reverse((entry.sort_key, readers.len())));
            }
            readers.push(Some(reader));
        }
        Ok(SortedIter {
            readers,
            heap,
            _sorter: PhantomData,
        })
    }

    /// Total number of added entries
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Number of chunks written so far (the open chunk included)
    pub fn chunk_count(&self) -> usize {
        self.chunks.len() + usize::from(self.current.is_some())
    }
}

impl Drop for ExternalMergeSort {
    fn drop(&mut self) {
        self.current = None;
        let _ = fs::remove_dir_all(&self.config.temp_dir);
    }
}

fn write_entry<W: Write>(writer: &mut W, entry: &Entry) -> Result<(), io::Error> {
    writer.write_i64::<BigEndian>(entry.sort_key)?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    writer.write_i32::<BigEndian>(entry.payload.len() as i32)?;
    writer.write_all(&entry.payload)
}

/// Load, sort and rewrite one chunk file
fn sort_chunk(chunk: &Chunk) -> Result<(), SortError> {
    let mut reader = BufReader::new(File::open(&chunk.path)?);
    let mut entries = Vec::with_capacity(usize::try_from(chunk.item_count).unwrap_or(0));
    for got in 0..chunk.item_count {
        match read_entry(&mut reader) {
            Ok(entry) => entries.push(entry),
            Err(SortError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(SortError::ShortChunk {
                    path: chunk.path.clone(),
                    expected: chunk.item_count,
                    got,
                });
            }
            Err(e) => return Err(e),
        }
    }
    drop(reader);

    entries.sort_unstable_by_key(|e| e.sort_key);

    let mut writer = BufWriter::new(File::create(&chunk.path)?);
    for entry in &entries {
        write_entry(&mut writer, entry)?;
    }
    let file = writer.into_inner().map_err(io::Error::from)?;
    file.sync_data()?;
    Ok(())
}

fn read_entry<R: io::Read>(reader: &mut R) -> Result<Entry, SortError> {
    let sort_key = reader.read_i64::<BigEndian>()?;
    let len = reader.read_i32::<BigEndian>()?;
    let len = usize::try_from(len).map_err(|_| {
        SortError::Io(io::Error::new(ErrorKind::InvalidData, "negative payload length"))
    })?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Entry { sort_key, payload })
}

struct ChunkReader {
    reader: BufReader<File>,
    path: PathBuf,
    expected: u64,
    read: u64,
    peeked: Option<Entry>,
}

impl ChunkReader {
    fn open(chunk: &Chunk) -> Result<ChunkReader, SortError> {
        let mut reader = ChunkReader {
            reader: BufReader::new(File::open(&chunk.path)?),
            path: chunk.path.clone(),
            expected: chunk.item_count,
            read: 0,
            peeked: None,
        };
        reader.advance()?;
        Ok(reader)
    }

    /// Read the next entry into `peeked`; None once the chunk is exhausted
    fn advance(&mut self) -> Result<(), SortError> {
        if self.read == self.expected {
            self.peeked = None;
            return Ok(());
        }
        match read_entry(&mut self.reader) {
            Ok(entry) => {
                self.read += 1;
                self.peeked = Some(entry);
                Ok(())
            }
            Err(SortError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(SortError::ShortChunk {
                    path: self.path.clone(),
                    expected: self.expected,
                    got: self.read,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Single-pass merged iterator over the sorted chunks
pub struct SortedIter<'a> {
    readers: Vec<Option<ChunkReader>>,
    heap: BinaryHeap<Reverse<(i64, usize)>>,
    _sorter: PhantomData<&'a mut ExternalMergeSort>,
}

impl Iterator for SortedIter<'_> {
    type Item = Result<Entry, SortError>;

    fn next(&mut self) -> Option<Result<Entry, SortError>> {
        let Reverse((_, index)) = self.heap.pop()?;
        let reader = self.readers[index].as_mut().unwrap();
        let entry = reader.peeked.take().unwrap();
        match reader.advance() {
            Ok(()) => match &reader.peeked {
                Some(peeked) => self.heap.push(Reverse((peeked.sort_key, index))),
                // Exhausted: close the chunk's file
                None => self.readers[index] = None,
            },
            Err(e) => {
                // I/O errors are fatal for the whole iteration
                self.heap.clear();
                return Some(Err(e));
            }
        }
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, chunk_size_limit: u64, workers: usize) -> SortConfig {
        SortConfig {
            chunk_size_limit,
            workers,
            max_heap_bytes: 1 << 32,
            temp_dir: dir.join("sort"),
        }
    }

    fn entry(sort_key: i64, payload: &[u8]) -> Entry {
        Entry {
            sort_key,
            payload: payload.to_vec(),
        }
    }

    fn drain(sorter: &mut ExternalMergeSort) -> Vec<Entry> {
        sorter.iter().unwrap().map(|e| e.unwrap()).collect()
    }

    #[test]
    fn empty_sort() {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 1000, 2)).unwrap();
        sorter.sort().unwrap();
        assert!(sorter.is_empty());
        assert_eq!(0, drain(&mut sorter).len());
    }

    #[test]
    fn single_entry() {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 1000, 2)).unwrap();
        sorter.add(entry(42, &[0xAB])).unwrap();
        sorter.sort().unwrap();
        assert_eq!(vec![entry(42, &[0xAB])], drain(&mut sorter));
    }

    #[test]
    fn out_of_order_keys_across_three_chunks() {
        let tmpdir = tempfile::tempdir().unwrap();
        // ENTRY_OVERHEAD + 1 payload byte = 65; two entries reach a 130-byte
        // limit, so five entries land in three chunks
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 130, 2)).unwrap();
        for (i, key) in [5i64, 1, 9, 3, 1].into_iter().enumerate() {
            sorter.add(entry(key, &[i as u8])).unwrap();
        }
        assert_eq!(3, sorter.chunk_count());
        sorter.sort().unwrap();

        let keys: Vec<i64> = drain(&mut sorter).iter().map(|e| e.sort_key).collect();
        assert_eq!(vec![1, 1, 3, 5, 9], keys);
    }

    #[test]
    fn sorted_output_is_the_same_multiset() {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 4096, 3)).unwrap();

        // Deterministic pseudo-random keys
        let mut x: u64 = 0x2545_f491_4f6c_dd1d;
        let mut added = Vec::new();
        for _ in 0..10_000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            #[allow(clippy::cast_possible_wrap)]
            let key = (x % 1000) as i64 - 500;
            let payload = x.to_be_bytes().to_vec();
            added.push(Entry {
                sort_key: key,
                payload: payload.clone(),
            });
            sorter.add(Entry {
                sort_key: key,
                payload,
            }).unwrap();
        }
        sorter.sort().unwrap();
        let sorted = drain(&mut sorter);
        assert_eq!(10_000, sorted.len());
        assert!(sorted.windows(2).all(|w| w[0].sort_key <= w[1].sort_key));

        // Same multiset as what went in
        let key = |e: &Entry| (e.sort_key, e.payload.clone());
        let mut expected: Vec<_> = added.iter().map(key).collect();
        expected.sort();
        let mut got: Vec<_> = sorted.iter().map(key).collect();
        got.sort();
        assert_eq!(expected, got);
    }

    #[test]
    fn uniform_payload_chunk_count() {
        let tmpdir = tempfile::tempdir().unwrap();
        // 64 overhead + 16 payload = 80 bytes per entry; 400-byte chunks
        // hold 5 entries each, so 100 entries make exactly 20 chunks
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 400, 2)).unwrap();
        for i in 0..100i64 {
            sorter.add(entry(i, &[0u8; 16])).unwrap();
        }
        assert_eq!(20, sorter.chunk_count());
    }

    #[test]
    fn temp_files_removed_on_drop() {
        let tmpdir = tempfile::tempdir().unwrap();
        let sort_dir = tmpdir.path().join("sort");
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 130, 2)).unwrap();
        for key in 0..50i64 {
            sorter.add(entry(key, &[1, 2, 3])).unwrap();
        }
        sorter.sort().unwrap();
        assert!(sort_dir.exists());
        drop(sorter);
        assert!(!sort_dir.exists());
    }

    #[test]
    fn rejects_oversized_worker_configuration() {
        let tmpdir = tempfile::tempdir().unwrap();
        let config = SortConfig {
            chunk_size_limit: GIB,
            workers: 16,
            max_heap_bytes: 4 * GIB,
            temp_dir: tmpdir.path().join("sort"),
        };
        match ExternalMergeSort::new(config) {
            Err(SortError::Config(_)) => (),
            other => panic!("expected a configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn default_sizing() {
        assert_eq!(GIB, default_chunk_size_limit(16 * GIB, 4));
        assert_eq!(GIB / 4, default_chunk_size_limit(2 * GIB, 4));
        assert_eq!(1, default_chunk_size_limit(0, 4));
    }

    #[test]
    #[should_panic(expected = "add after sort")]
    fn add_after_sort_panics() {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 1000, 1)).unwrap();
        sorter.sort().unwrap();
        let _ = sorter.add(entry(1, &[]));
    }

    #[test]
    #[should_panic(expected = "iter before sort")]
    fn iter_before_sort_panics() {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 1000, 1)).unwrap();
        let _ = sorter.iter();
    }

    #[test]
    #[should_panic(expected = "double sort")]
    fn double_sort_panics() {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 1000, 1)).unwrap();
        sorter.sort().unwrap();
        sorter.sort().unwrap();
    }

    #[test]
    #[should_panic(expected = "second iter")]
    fn second_iter_panics() {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 1000, 1)).unwrap();
        sorter.sort().unwrap();
        drain(&mut sorter);
        let _ = sorter.iter();
    }

    #[test]
    fn short_chunk_is_a_hard_error() {
        let tmpdir = tempfile::tempdir().unwrap();
        let mut sorter = ExternalMergeSort::new(config(tmpdir.path(), 10_000, 1)).unwrap();
        for key in 0..10i64 {
            sorter.add(entry(key, &[7u8; 8])).unwrap();
        }
        // Truncate the chunk file behind the sorter's back
        let path = sorter.config.temp_dir.join("chunk0.dat");
        sorter.finish_chunk().unwrap();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(40).unwrap();
        drop(file);

        match sorter.sort() {
            Err(SortError::ShortChunk { expected, got, .. }) => {
                assert_eq!(10, expected);
                assert!(got < 10);
            }
            other => panic!("expected ShortChunk, got {:?}", other.map(|()| ())),
        }
    }
}
