//! Rotating on-disk archive of one publisher's messages
//!
//! Layout, per generation:
//! - `<publisher>_<firstTimestampMs>.idx`: one record per message, the
//!   33-byte encoded header followed by an 8-byte big-endian offset into
//!   the data file
//! - `<publisher>_<firstTimestampMs>.iomsg`: the data sections of the
//!   encoded messages, concatenated
//!
//! Only one generation is open for appending at a time. A new generation is
//! started when the data file would grow past `max_file_bytes` or the index
//! already holds `max_records_per_file` records. Payload bytes are written
//! before the index record that points at them, and a torn trailing index
//! record is truncated when the generation is reopened.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::memory::MemoryProbe;
use crate::message::{Message, codec, codec::HEADER_SIZE};

const INDEX_EXTENSION: &str = "idx";
const DATA_EXTENSION: &str = "iomsg";
const OFFSET_SIZE: usize = 8;
const INDEX_RECORD_SIZE: usize = HEADER_SIZE + OFFSET_SIZE;

/// Records scanned between two available-memory checks.
const MEMORY_CHECK_EVERY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_file_bytes: u64,
    pub max_records_per_file: u64,
    /// Queries stop early once available memory drops below this.
    pub memory_floor_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 1024 * 1024,
            max_records_per_file: 1000,
            memory_floor_bytes: 32 * 1024 * 1024,
        }
    }
}

struct Generation {
    timestamp: u64,
    index: File,
    data: File,
    data_len: u64,
    records: u64,
}

impl Generation {
    fn open(dir: &Path, publisher: &str, timestamp: u64) -> io::Result<Self> {
        let (index_path, data_path) = generation_paths(dir, publisher, timestamp);
        let index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)?;
        let data = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)?;

        let index_len = index.metadata()?.len();
        let records = index_len / INDEX_RECORD_SIZE as u64;
        if index_len % INDEX_RECORD_SIZE as u64 != 0 {
            warn!("Truncating torn index record in {}", index_path.display());
            index.set_len(records * INDEX_RECORD_SIZE as u64)?;
        }
        let data_len = data.metadata()?.len();

        debug!(
            "Opened archive generation {} ({records} records)",
            index_path.display()
        );
        Ok(Self {
            timestamp,
            index,
            data,
            data_len,
            records,
        })
    }

    fn is_full(&self, limits: &ArchiveLimits, incoming: usize) -> bool {
        self.records >= limits.max_records_per_file
            || self.data_len + incoming as u64 > limits.max_file_bytes
    }

    /// Offsets come from the files themselves, so bytes left behind by an
    /// earlier failed append never shift later records.
    fn append(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        let index_len = self.index.metadata()?.len();
        if index_len % INDEX_RECORD_SIZE as u64 != 0 {
            warn!("Dropping torn index record before append");
            self.index.set_len(index_len - index_len % INDEX_RECORD_SIZE as u64)?;
        }
        let offset = self.data.metadata()?.len();
        self.data.write_all(payload)?;

        let mut record = [0u8; INDEX_RECORD_SIZE];
        record[..HEADER_SIZE].copy_from_slice(header);
        record[HEADER_SIZE..].copy_from_slice(&offset.to_be_bytes());
        self.index.write_all(&record)?;

        self.data_len = offset + payload.len() as u64;
        self.records = index_len / INDEX_RECORD_SIZE as u64 + 1;
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        self.data.sync_data()?;
        self.index.sync_data()
    }
}

#[derive(Default)]
struct ArchiveState {
    current: Option<Generation>,
    /// Generation found at start-up that still has room, opened on first write.
    resume: Option<u64>,
}

/// Append-only message store for one publisher.
pub struct Archive {
    publisher: String,
    dir: PathBuf,
    limits: ArchiveLimits,
    memory: Arc<dyn MemoryProbe>,
    state: Mutex<ArchiveState>,
}

impl Archive {
    /// Open the archive for `publisher` in `dir`, resuming the most recent
    /// generation if it is below the record ceiling.
    pub fn open(
        dir: impl AsRef<Path>,
        publisher: &str,
        limits: ArchiveLimits,
        memory: Arc<dyn MemoryProbe>,
    ) -> io::Result<Self> {
        if !is_valid_publisher(publisher) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("publisher id {publisher:?} cannot name an archive file"),
            ));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let generations = list_generations(&dir, publisher)?;
        let resume = match generations.last() {
            Some((timestamp, index_path)) => {
                let records = fs::metadata(index_path)?.len() / INDEX_RECORD_SIZE as u64;
                (records < limits.max_records_per_file).then_some(*timestamp)
            }
            None => None,
        };
        if let Some(timestamp) = resume {
            info!("Archive for {publisher} resumes generation {timestamp}");
        }

        Ok(Self {
            publisher: publisher.to_string(),
            dir,
            limits,
            memory,
            state: Mutex::new(ArchiveState {
                current: None,
                resume,
            }),
        })
    }

    /// Append one encoded message.
    ///
    /// A generation is only rotated when `timestamp` differs from the open
    /// generation's name, so two generations never share a file name.
    pub fn save(&self, encoded: &[u8], timestamp: u64) -> io::Result<()> {
        if encoded.len() < HEADER_SIZE {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "encoded message shorter than header",
            ));
        }
        let (header, payload) = encoded.split_at(HEADER_SIZE);

        let mut state = self.state.lock();
        let mut current = match state.current.take() {
            Some(generation) => generation,
            None => {
                let name = state.resume.take().unwrap_or(timestamp);
                Generation::open(&self.dir, &self.publisher, name)?
            }
        };
        if current.is_full(&self.limits, payload.len()) && current.timestamp != timestamp {
            debug!("Rotating archive for {} at {}", self.publisher, timestamp);
            current.close()?;
            current = Generation::open(&self.dir, &self.publisher, timestamp)?;
        }

        match current.append(header, payload) {
            Ok(()) => {
                state.current = Some(current);
                Ok(())
            }
            Err(e) => {
                // Reopened on the next save, which re-reads both file lengths.
                state.resume = Some(current.timestamp);
                Err(e)
            }
        }
    }

    /// Flush and close the open generation, if any.
    pub fn close(&self) -> io::Result<()> {
        match self.state.lock().current.take() {
            Some(generation) => generation.close(),
            None => Ok(()),
        }
    }

    /// Messages whose timestamp lies in `[from, to]`, in file order.
    ///
    /// The result is best-effort: the scan stops early and returns what it
    /// has when available memory drops below the configured floor.
    pub fn query(&self, from: u64, to: u64) -> io::Result<Vec<Message>> {
        let mut messages = Vec::new();
        if from > to {
            return Ok(messages);
        }

        let generations = list_generations(&self.dir, &self.publisher)?;
        // The last generation named before `from` may still hold records
        // inside the range.
        let start = generations
            .iter()
            .rposition(|(timestamp, _)| *timestamp < from)
            .unwrap_or(0);

        let mut scanned = 0usize;
        for (timestamp, index_path) in &generations[start..] {
            if *timestamp > to {
                break;
            }
            if self.memory_is_low() {
                return Ok(messages);
            }
            let data_path = index_path.with_extension(DATA_EXTENSION);
            let complete = self.scan_generation(
                index_path,
                &data_path,
                (from, to),
                &mut scanned,
                &mut messages,
            )?;
            if !complete {
                return Ok(messages);
            }
        }
        Ok(messages)
    }

    /// Returns `false` when the scan was cut short by memory pressure.
    fn scan_generation(
        &self,
        index_path: &Path,
        data_path: &Path,
        (from, to): (u64, u64),
        scanned: &mut usize,
        out: &mut Vec<Message>,
    ) -> io::Result<bool> {
        let mut index = BufReader::new(File::open(index_path)?);
        let mut data = BufReader::new(File::open(data_path)?);
        let mut position = 0u64;
        let mut record = [0u8; INDEX_RECORD_SIZE];

        loop {
            match index.read_exact(&mut record) {
                Ok(()) => {}
                // A torn or in-flight trailing record ends the generation.
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(true),
                Err(e) => return Err(e),
            }

            *scanned += 1;
            if *scanned % MEMORY_CHECK_EVERY == 0 && self.memory_is_low() {
                return Ok(false);
            }

            let header = &record[..HEADER_SIZE];
            let mut offset_bytes = [0u8; OFFSET_SIZE];
            offset_bytes.copy_from_slice(&record[HEADER_SIZE..]);
            let offset = u64::from_be_bytes(offset_bytes);

            let len = match codec::payload_len(header) {
                Ok(len) => len,
                Err(e) => {
                    warn!("Skipping unreadable record in {}: {e}", index_path.display());
                    continue;
                }
            };

            if offset != position {
                data.seek(SeekFrom::Start(offset))?;
            }
            let mut payload = vec![0u8; len];
            data.read_exact(&mut payload)?;
            position = offset + len as u64;

            match codec::decode_parts(header, &payload) {
                Ok(message) if (from..=to).contains(&message.timestamp) => out.push(message),
                Ok(_) => {}
                Err(e) => warn!("Skipping undecodable record in {}: {e}", index_path.display()),
            }
        }
    }

    fn memory_is_low(&self) -> bool {
        let available = self.memory.available_bytes();
        if available < self.limits.memory_floor_bytes {
            warn!(
                "Archive query for {} stopped early: {} bytes available",
                self.publisher, available
            );
            return true;
        }
        false
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("publisher", &self.publisher)
            .field("dir", &self.dir)
            .field("limits", &self.limits)
            .finish()
    }
}

/// Publisher ids become file name stems and must stay inside the archive
/// directory.
fn is_valid_publisher(publisher: &str) -> bool {
    !publisher.is_empty()
        && publisher != "."
        && publisher != ".."
        && !publisher.contains(['/', '\\', '\0'])
}

fn generation_paths(dir: &Path, publisher: &str, timestamp: u64) -> (PathBuf, PathBuf) {
    let stem = format!("{publisher}_{timestamp}");
    (
        dir.join(format!("{stem}.{INDEX_EXTENSION}")),
        dir.join(format!("{stem}.{DATA_EXTENSION}")),
    )
}

/// Index files of `publisher`, sorted by generation timestamp.
fn list_generations(dir: &Path, publisher: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut generations = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(INDEX_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((name, timestamp)) = stem.rsplit_once('_') else {
            continue;
        };
        if name != publisher {
            continue;
        }
        if let Ok(timestamp) = timestamp.parse::<u64>() {
            generations.push((timestamp, path));
        }
    }
    generations.sort_by_key(|(timestamp, _)| *timestamp);
    Ok(generations)
}
