//! Ban persistence.
//!
//! The engine reports every inserted ban and every reclaimed ban to a
//! [`BanPersistence`] collaborator. Reporting is fire-and-forget: a failed
//! write is logged and never retried.
//!
//! [`FileJournal`] keeps an append-only file of records, each one kind byte
//! followed by the raw ban spec (which carries its own length). Dropped bans
//! leave dead records behind; the file is rewritten from the live bans once
//! they dominate it.

use crate::ban::spec::BanSpec;
use crate::error::BanError;
use crate::metrics::BanStats;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Offset of the length field inside a spec, and the bytes needed to read it.
const SPEC_LENGTH_AT: usize = 8;
const SPEC_PREFIX: usize = 12;

/// A persisted ban event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BanEvent {
    /// A ban was inserted.
    New = 1,
    /// A ban was reclaimed.
    Drop = 2,
}

impl BanEvent {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::New),
            2 => Some(Self::Drop),
            _ => None,
        }
    }
}

/// Receives ban insert and drop notifications.
pub trait BanPersistence: Send + Sync {
    fn ban_info(&self, event: BanEvent, spec: &BanSpec);
}

/// Persistence that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

impl BanPersistence for NoopPersistence {
    #[inline]
    fn ban_info(&self, _event: BanEvent, _spec: &BanSpec) {}
}

/// Errors while opening or replaying a journal.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown record kind {kind:#04x} at offset {offset}")]
    UnknownKind { kind: u8, offset: u64 },
    #[error("bad ban record at offset {offset}: {source}")]
    BadRecord {
        offset: u64,
        #[source]
        source: BanError,
    },
}

/// Journal size, in bytes, that a compaction is not worth below.
pub const DEFAULT_COMPACT_BYTES: u64 = 64 * 1024;

/// Replayed journal contents.
struct Scan {
    /// Live bans by timestamp bits.
    live: BTreeMap<u64, BanSpec>,
    /// Length of the well-formed prefix of the file.
    valid: u64,
}

struct JournalState {
    out: BufWriter<File>,
    live: BTreeMap<u64, BanSpec>,
    /// Bytes in the file.
    bytes: u64,
    /// Bytes held by dropped bans and their drop records.
    dead: u64,
}

/// Append-only ban journal, rewritten from the live bans once dropped bans
/// make up at least half of it.
pub struct FileJournal {
    path: PathBuf,
    state: Mutex<JournalState>,
    compact_bytes: u64,
    stats: BanStats,
}

fn record_len(spec: &BanSpec) -> u64 {
    1 + spec.as_bytes().len() as u64
}

impl FileJournal {
    /// Open (creating if needed) the journal at `path` for appending.
    ///
    /// Existing records are read to learn which bans are still live. A record
    /// cut short at the end of the file is cut off so later appends stay
    /// readable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let scan = Self::scan(&bytes)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if scan.valid < bytes.len() as u64 {
            warn!(
                path = %path.display(),
                valid = scan.valid,
                len = bytes.len(),
                "Cutting torn record off the ban journal"
            );
            file.set_len(scan.valid)?;
        }

        let live_bytes: u64 = scan.live.values().map(record_len).sum();
        info!(path = %path.display(), bans = scan.live.len(), "Ban journal opened");
        let journal = Self {
            path,
            state: Mutex::new(JournalState {
                out: BufWriter::new(file),
                live: scan.live,
                bytes: scan.valid,
                dead: scan.valid - live_bytes,
            }),
            compact_bytes: DEFAULT_COMPACT_BYTES,
            stats: BanStats::new(),
        };
        journal.publish(&journal.state.lock());
        Ok(journal)
    }

    /// Compact once at least `bytes` are held by dropped bans.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_bytes = bytes;
        self
    }

    /// Report journal size through `stats`.
    pub fn with_stats(mut self, stats: BanStats) -> Self {
        self.stats = stats;
        self.publish(&self.state.lock());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bans recorded as inserted and not yet dropped.
    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Bytes currently in the journal file.
    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    /// Read the journal at `path` and return the bans still alive, oldest
    /// first. A missing file is an empty journal. A record cut short at the
    /// end of the file (interrupted write) ends the replay with a warning.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<BanSpec>, JournalError> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let alive = Self::fold(&bytes)?;
        debug!(path = %path.display(), bans = alive.len(), "Ban journal replayed");
        Ok(alive)
    }

    fn fold(bytes: &[u8]) -> Result<Vec<BanSpec>, JournalError> {
        let mut specs: Vec<BanSpec> = Self::scan(bytes)?.live.into_values().collect();
        specs.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));
        Ok(specs)
    }

    fn scan(mut bytes: &[u8]) -> Result<Scan, JournalError> {
        // Timestamps are unique per ban; key by their bit pattern.
        let mut live: BTreeMap<u64, BanSpec> = BTreeMap::new();
        let mut offset = 0u64;

        loop {
            let mut kind = [0u8; 1];
            if bytes.read(&mut kind)? == 0 {
                break;
            }
            let Some(event) = BanEvent::from_byte(kind[0]) else {
                return Err(JournalError::UnknownKind { kind: kind[0], offset });
            };

            if bytes.len() < SPEC_PREFIX {
                warn!(offset, "Truncated ban journal record, ignoring tail");
                break;
            }
            let mut len = [0u8; 4];
            len.copy_from_slice(&bytes[SPEC_LENGTH_AT..SPEC_PREFIX]);
            let len = u32::from_be_bytes(len) as usize;
            if bytes.len() < len {
                warn!(offset, "Truncated ban journal record, ignoring tail");
                break;
            }

            let (record, rest) = bytes.split_at(len);
            let spec = BanSpec::from_bytes(record)
                .map_err(|source| JournalError::BadRecord { offset, source })?;
            let key = spec.timestamp().to_bits();
            match event {
                BanEvent::New => {
                    live.insert(key, spec);
                }
                BanEvent::Drop => {
                    live.remove(&key);
                }
            }

            offset += 1 + len as u64;
            bytes = rest;
        }

        Ok(Scan { live, valid: offset })
    }

    /// Rewrite the journal from the live bans.
    pub fn compact(&self) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        self.compact_locked(&mut state)?;
        Ok(())
    }

    /// Forget every live ban, leaving an empty journal.
    pub fn clear(&self) -> Result<(), JournalError> {
        let mut state = self.state.lock();
        state.live.clear();
        self.compact_locked(&mut state)?;
        Ok(())
    }

    fn compact_locked(&self, state: &mut JournalState) -> io::Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut bytes = 0u64;
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            for spec in state.live.values() {
                w.write_all(&[BanEvent::New as u8])?;
                w.write_all(spec.as_bytes())?;
                bytes += record_len(spec);
            }
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        state.out = BufWriter::new(file);
        info!(
            path = %self.path.display(),
            bans = state.live.len(),
            before = state.bytes,
            after = bytes,
            "Ban journal compacted"
        );
        state.bytes = bytes;
        state.dead = 0;
        self.publish(state);
        Ok(())
    }

    fn publish(&self, state: &JournalState) {
        self.stats.bans_persisted_bytes.set(state.bytes as i64);
        self.stats.bans_persisted_fragmentation.set(state.dead as i64);
    }

    fn append(&self, event: BanEvent, spec: &BanSpec) -> io::Result<()> {
        let mut state = self.state.lock();
        state.out.write_all(&[event as u8])?;
        state.out.write_all(spec.as_bytes())?;
        state.out.flush()?;

        let rec = record_len(spec);
        state.bytes += rec;
        let key = spec.timestamp().to_bits();
        match event {
            BanEvent::New => {
                if let Some(old) = state.live.insert(key, spec.clone()) {
                    state.dead += record_len(&old);
                }
            }
            BanEvent::Drop => {
                state.dead += rec;
                if let Some(old) = state.live.remove(&key) {
                    state.dead += record_len(&old);
                }
            }
        }
        self.publish(&state);

        if state.dead >= self.compact_bytes && state.dead * 2 >= state.bytes {
            self.compact_locked(&mut state)?;
        }
        Ok(())
    }
}

impl BanPersistence for FileJournal {
    fn ban_info(&self, event: BanEvent, spec: &BanSpec) {
        if let Err(e) = self.append(event, spec) {
            warn!(
                path = %self.path.display(),
                error = %e,
                ?event,
                "Failed to record ban"
            );
        }
    }
}
