//! Transparent on-disk revision cache.
//!
//! Wraps any [`Backend`] behind the same boundary. Completed revisions
//! are persisted in rotated binary segment files plus an append-only
//! index; cached revisions are served locally, misses are delegated to
//! the wrapped backend, and `revision` misses are written back before
//! returning.
//!
//! # Layout
//!
//! Per repository, under `<root>/<uuid>/`:
//!
//! ```text
//! index      gzip stream: u32 version=1, then (id_string, u32 seg, u32 off)*
//! cache.<N>  segment files: (u32 compressed_len, zlib(revision))*
//! ```
//!
//! The index is authoritative: segment bytes past the last indexed offset
//! are unreachable garbage after a crash. Index entries are appended only
//! after the segment bytes are flushed, so a crash loses at most the
//! trailing revisions but never produces a dangling entry. Because the
//! writer appends a fresh gzip member per run, the index is read with a
//! multi-member decoder, and a truncated trailing entry (or member) is
//! treated as end-of-stream.
//!
//! # Writer/reader discipline
//!
//! One writer process per cache directory (cooperative); a process-wide
//! mutex serialises `put` against itself. Segments rotate when the writer
//! position reaches the configured threshold. At most one segment reader
//! is open at a time, switched on segment change, with a seek per read.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use ahash::AHashMap;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::backend::{Backend, BackendError, LogIterator, Tag};
use crate::revision::{Diffstat, Revision};
use crate::wire;

/// Segment rotation threshold: keeps single-file seek times reasonable
/// and lets older segments be packaged independently.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;

/// Index format version this build reads and writes.
const CACHE_VERSION: u32 = 1;

/// Serialises `put` across cache instances in this process.
static PUT_LOCK: Mutex<()> = Mutex::new(());

/// Cache construction parameters.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Root directory holding one subdirectory per repository uuid.
    pub root: PathBuf,
    /// Segment rotation threshold in bytes.
    pub max_segment_size: u64,
}

impl CacheConfig {
    /// Config with the default rotation threshold.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
        }
    }
}

/// Errors from the cache layer.
#[derive(Debug)]
#[non_exhaustive]
pub enum CacheError {
    /// Filesystem failure, with context.
    Io { context: String, source: io::Error },
    /// The on-disk index carries a version this build does not read.
    UnknownVersion(u32),
    /// An entry failed to decompress, decode, or match its index key.
    Corrupt { detail: String },
    /// The confirm callback refused to clear a corrupt cache.
    Abort,
    /// Failure in the wrapped backend during cache setup.
    Backend(BackendError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { context, source } => write!(f, "{context}: {source}"),
            Self::UnknownVersion(version) => {
                write!(f, "unknown cache version {version}")
            }
            Self::Corrupt { detail } => write!(f, "corrupt cache: {detail}"),
            Self::Abort => write!(f, "cache clearing refused"),
            Self::Backend(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CacheError> for BackendError {
    fn from(err: CacheError) -> Self {
        BackendError::Cache {
            detail: err.to_string(),
        }
    }
}

/// Outcome of an integrity check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Every entry decoded and matched its index key.
    Clean,
    /// Corruption was found; the repository's cache was cleared.
    Cleared,
}

struct SegmentWriter {
    file: BufWriter<File>,
    segment: u32,
    pos: u64,
}

struct SegmentReader {
    file: File,
    segment: u32,
}

/// Caching decorator around a [`Backend`].
pub struct Cache {
    backend: Box<dyn Backend>,
    dir: PathBuf,
    uuid: String,
    max_segment_size: u64,
    index: AHashMap<String, (u32, u32)>,
    writer: Option<SegmentWriter>,
    index_out: Option<GzEncoder<File>>,
    reader: Option<SegmentReader>,
}

impl Cache {
    /// Wraps `backend`, loading (or creating) the on-disk cache for its
    /// repository.
    ///
    /// # Errors
    /// [`CacheError::Backend`] if the uuid cannot be determined,
    /// [`CacheError::UnknownVersion`] for a version-mismatched index,
    /// [`CacheError::Io`] if the cache directory cannot be created.
    pub fn new(mut backend: Box<dyn Backend>, config: CacheConfig) -> Result<Self, CacheError> {
        let uuid = backend.uuid().map_err(CacheError::Backend)?;
        let dir = config.root.join(&uuid);
        let mut cache = Self {
            backend,
            dir,
            uuid,
            max_segment_size: config.max_segment_size.max(1),
            index: AHashMap::new(),
            writer: None,
            index_out: None,
            reader: None,
        };
        cache.load()?;
        Ok(cache)
    }

    /// Number of revisions currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Non-blocking: true if `id` is indexed.
    #[must_use]
    pub fn lookup(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Re-reads the index from disk into the in-memory map.
    fn load(&mut self) -> Result<(), CacheError> {
        self.index.clear();

        if !self.dir.is_dir() {
            fs::create_dir_all(&self.dir).map_err(|source| CacheError::Io {
                context: format!("creating cache directory {}", self.dir.display()),
                source,
            })?;
            eprintln!("cache: creating cache directory for '{}'", self.uuid);
            return Ok(());
        }

        let file = match File::open(self.dir.join("index")) {
            Ok(file) => file,
            Err(_) => {
                eprintln!("cache: empty cache for '{}'", self.uuid);
                return Ok(());
            }
        };
        let mut input = MultiGzDecoder::new(BufReader::new(file));

        let version = match wire::read_u32(&mut input) {
            Ok(version) => version,
            Err(_) => {
                eprintln!("cache: empty cache for '{}'", self.uuid);
                return Ok(());
            }
        };
        if version != CACHE_VERSION {
            return Err(CacheError::UnknownVersion(version));
        }

        // Partial trailing entries (from a crashed writer) end the stream.
        loop {
            let id = match wire::read_string(&mut input) {
                Ok(id) if !id.is_empty() => id,
                _ => break,
            };
            let Ok(segment) = wire::read_u32(&mut input) else {
                break;
            };
            let Ok(offset) = wire::read_u32(&mut input) else {
                break;
            };
            self.index.insert(id, (segment, offset));
        }

        eprintln!(
            "cache: {} cached revisions for '{}'",
            self.index.len(),
            self.uuid
        );
        Ok(())
    }

    fn segment_path(&self, segment: u32) -> PathBuf {
        self.dir.join(format!("cache.{segment}"))
    }

    /// Reads and decodes the revision stored for `id`.
    fn fetch(&mut self, id: &str) -> Result<Revision, CacheError> {
        let &(segment, offset) = self.index.get(id).ok_or_else(|| CacheError::Corrupt {
            detail: format!("revision {id} is not indexed"),
        })?;

        let switch = match &self.reader {
            Some(reader) => reader.segment != segment,
            None => true,
        };
        if switch {
            let path = self.segment_path(segment);
            let file = File::open(&path).map_err(|source| CacheError::Io {
                context: format!("opening cache file {}", path.display()),
                source,
            })?;
            self.reader = Some(SegmentReader { file, segment });
        }
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => unreachable!("segment reader installed above"),
        };

        let read = |source: io::Error| CacheError::Io {
            context: format!("reading cache segment {segment}"),
            source,
        };
        reader
            .file
            .seek(SeekFrom::Start(u64::from(offset)))
            .map_err(read)?;
        let len = wire::read_u32(&mut reader.file).map_err(read)?;
        let mut compressed = vec![0u8; len as usize];
        reader.file.read_exact(&mut compressed).map_err(read)?;

        let mut payload = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut payload)
            .map_err(|err| CacheError::Corrupt {
                detail: format!("revision {id} does not decompress: {err}"),
            })?;
        Revision::decode(&mut payload.as_slice()).map_err(|err| CacheError::Corrupt {
            detail: format!("revision {id} does not decode: {err}"),
        })
    }

    /// Persists a revision and appends its index entry.
    ///
    /// Serialised under a process-wide mutex. The segment record is
    /// flushed before the index entry is written.
    pub fn put(&mut self, id: &str, revision: &Revision) -> Result<(), CacheError> {
        let _guard = PUT_LOCK.lock().unwrap_or_else(|err| err.into_inner());

        let payload = revision.encode();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        let write = |source: io::Error| CacheError::Io {
            context: format!("writing revision {id}"),
            source,
        };
        encoder.write_all(&payload).map_err(write)?;
        let compressed = encoder.finish().map_err(write)?;

        self.ensure_writer()?;
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => unreachable!("segment writer installed above"),
        };
        let segment = writer.segment;
        let offset = writer.pos as u32;

        let mut record = Vec::with_capacity(4 + compressed.len());
        wire::put_u32(&mut record, compressed.len() as u32);
        record.extend_from_slice(&compressed);
        writer.file.write_all(&record).map_err(write)?;
        writer.file.flush().map_err(write)?;
        writer.pos += record.len() as u64;

        self.append_index_entry(id, segment, offset)?;
        self.index.insert(id.to_string(), (segment, offset));
        Ok(())
    }

    /// Opens (or rotates) the segment writer.
    fn ensure_writer(&mut self) -> Result<(), CacheError> {
        let rotate = match &self.writer {
            Some(writer) => writer.pos >= self.max_segment_size,
            None => false,
        };

        let segment = if let Some(writer) = &self.writer {
            if !rotate {
                return Ok(());
            }
            writer.segment + 1
        } else {
            // First write after open: highest segment still under the
            // threshold, scanning from zero.
            let mut segment = 0u32;
            while let Ok(meta) = fs::metadata(self.segment_path(segment)) {
                if meta.len() < self.max_segment_size {
                    break;
                }
                segment += 1;
            }
            segment
        };

        if rotate {
            // Close the previous writer before starting the next file.
            self.writer = None;
        }

        let path = self.segment_path(segment);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| CacheError::Io {
                context: format!("opening cache file {}", path.display()),
                source,
            })?;
        let pos = file
            .metadata()
            .map_err(|source| CacheError::Io {
                context: format!("sizing cache file {}", path.display()),
                source,
            })?
            .len();
        self.writer = Some(SegmentWriter {
            file: BufWriter::new(file),
            segment,
            pos,
        });
        Ok(())
    }

    fn append_index_entry(&mut self, id: &str, segment: u32, offset: u32) -> Result<(), CacheError> {
        let write = |source: io::Error| CacheError::Io {
            context: "writing cache index".to_string(),
            source,
        };

        if self.index_out.is_none() {
            let path = self.dir.join("index");
            let fresh = !path.is_file();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(write)?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            if fresh {
                let mut header = Vec::new();
                wire::put_u32(&mut header, CACHE_VERSION);
                encoder.write_all(&header).map_err(write)?;
            }
            self.index_out = Some(encoder);
        }

        let encoder = match self.index_out.as_mut() {
            Some(encoder) => encoder,
            None => unreachable!("index writer installed above"),
        };
        let mut entry = Vec::new();
        wire::put_string(&mut entry, id);
        wire::put_u32(&mut entry, segment);
        wire::put_u32(&mut entry, offset);
        encoder.write_all(&entry).map_err(write)?;
        encoder.flush().map_err(write)?;
        Ok(())
    }

    /// Flushes and closes the cache streams. Reopened lazily on the next
    /// operation.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        let close = |source: io::Error| CacheError::Io {
            context: "closing cache streams".to_string(),
            source,
        };
        if let Some(writer) = self.writer.as_mut() {
            writer.file.flush().map_err(close)?;
        }
        self.writer = None;
        if let Some(encoder) = self.index_out.take() {
            encoder.finish().map_err(close)?;
        }
        self.reader = None;
        Ok(())
    }

    /// Re-deserialises every indexed entry, clearing the repository's
    /// cache on the first corruption found.
    ///
    /// # Errors
    /// [`CacheError::Io`] if the cleared directory cannot be rebuilt.
    pub fn check(&mut self) -> Result<CheckOutcome, CacheError> {
        self.check_with(|_| true)
    }

    /// Like [`check`](Self::check), but consults `confirm` with the
    /// corruption detail before clearing; refusal returns
    /// [`CacheError::Abort`] and leaves the cache untouched.
    pub fn check_with<F>(&mut self, mut confirm: F) -> Result<CheckOutcome, CacheError>
    where
        F: FnMut(&str) -> bool,
    {
        let mut ids: Vec<String> = self.index.keys().cloned().collect();
        ids.sort_unstable();

        let mut corruption: Option<String> = None;
        for id in ids {
            match self.fetch(&id) {
                Ok(revision) if revision.id() == id => {}
                Ok(revision) => {
                    corruption = Some(format!(
                        "index key {id} stores revision {}",
                        revision.id()
                    ));
                    break;
                }
                Err(err) => {
                    corruption = Some(err.to_string());
                    break;
                }
            }
        }

        match corruption {
            None => Ok(CheckOutcome::Clean),
            Some(detail) => {
                eprintln!("cache: corruption detected: {detail}");
                if !confirm(&detail) {
                    return Err(CacheError::Abort);
                }
                self.clear()?;
                Ok(CheckOutcome::Cleared)
            }
        }
    }

    /// Moves the repository's cache directory aside and starts fresh.
    fn clear(&mut self) -> Result<(), CacheError> {
        self.writer = None;
        self.reader = None;
        if let Some(encoder) = self.index_out.take() {
            let _ = encoder.finish();
        }

        let aside = self.dir.with_file_name(format!("{}.corrupt", self.uuid));
        if aside.exists() {
            let _ = fs::remove_dir_all(&aside);
        }
        let io_err = |context: String| {
            move |source: io::Error| CacheError::Io { context, source }
        };
        fs::rename(&self.dir, &aside).map_err(io_err(format!(
            "moving corrupt cache to {}",
            aside.display()
        )))?;
        fs::create_dir_all(&self.dir).map_err(io_err(format!(
            "recreating cache directory {}",
            self.dir.display()
        )))?;
        self.index.clear();
        eprintln!(
            "cache: cleared cache for '{}', old data in {}",
            self.uuid,
            aside.display()
        );
        Ok(())
    }
}

impl Backend for Cache {
    fn name(&self) -> &'static str {
        self.backend.name()
    }

    fn uuid(&mut self) -> Result<String, BackendError> {
        Ok(self.uuid.clone())
    }

    fn head(&self, branch: &str) -> Result<String, BackendError> {
        self.backend.head(branch)
    }

    fn main_branch(&self) -> Result<String, BackendError> {
        self.backend.main_branch()
    }

    fn branches(&self) -> Result<Vec<String>, BackendError> {
        self.backend.branches()
    }

    fn tags(&self) -> Result<Vec<Tag>, BackendError> {
        self.backend.tags()
    }

    fn tree(&self, id: &str) -> Result<Vec<String>, BackendError> {
        self.backend.tree(id)
    }

    fn diffstat(&mut self, id: &str) -> Result<Diffstat, BackendError> {
        if self.lookup(id) {
            match self.fetch(id) {
                Ok(revision) => return Ok(revision.into_diffstat()),
                Err(err) => {
                    // Read failures degrade to a miss.
                    eprintln!("cache: read failed for {id}: {err}");
                }
            }
        }
        self.backend.diffstat(id)
    }

    fn revision(&mut self, id: &str) -> Result<Revision, BackendError> {
        if self.lookup(id) {
            match self.fetch(id) {
                Ok(revision) => return Ok(revision),
                Err(err) => {
                    eprintln!("cache: read failed for {id}: {err}");
                }
            }
        }
        let revision = self.backend.revision(id)?;
        // Write failures propagate; the revision itself is already here.
        self.put(id, &revision)?;
        Ok(revision)
    }

    fn iterator(
        &self,
        branch: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<LogIterator, BackendError> {
        self.backend.iterator(branch, start, end)
    }

    /// Forwards only the ids that are not already cached.
    fn prefetch(&mut self, ids: &[String]) -> Result<(), BackendError> {
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !self.lookup(id))
            .cloned()
            .collect();
        eprintln!(
            "cache: {} of {} revisions already cached, prefetching {}",
            ids.len() - missing.len(),
            ids.len(),
            missing.len()
        );
        self.backend.prefetch(&missing)
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        self.flush()?;
        self.backend.finalize()
    }
}
