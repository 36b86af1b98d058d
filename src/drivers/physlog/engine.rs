//! Minimal storage-engine model the physical-log driver works
//! against: a table is a data file plus an index file, writes go
//! through a [`TableShare`] which mirrors them into the shared
//! [`PhysicalLog`] while logging is enabled.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use ::log::warn;

use crate::error::{Error, Result};

use super::log::{write_entry, LogEntry};

/// Extension of a table's data file.
pub const DATA_EXT: &str = "tbd";
/// Extension of a table's index file.
pub const INDEX_EXT: &str = "tbi";

/// The index file starts with a fixed-size header; a header-only
/// backup copies just this much.
pub const INDEX_HEADER_SIZE: u64 = 1024;

const INDEX_MAGIC: [u8; 4] = *b"XIH1";
/// Offset of the dirty-open counter inside the index header.
const OPEN_COUNT_OFFSET: u64 = 4;

/// Locates the two files of one table.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TableFiles {
    pub dir: PathBuf,
    pub db: String,
    pub name: String,
}

impl TableFiles {
    pub fn new(dir: &Path, db: &str, name: &str) -> Self {
        Self { dir: dir.to_owned(), db: db.to_string(), name: name.to_string() }
    }

    /// Directory-relative stem, also used to bind log entries to
    /// tables across backup and restore.
    pub fn stem(&self) -> String {
        format!("{}.{}", self.db, self.name)
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem(), DATA_EXT))
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem(), INDEX_EXT))
    }

    /// Same table files under a different directory.
    pub fn rebased(&self, dir: &Path) -> Self {
        Self { dir: dir.to_owned(), db: self.db.clone(), name: self.name.clone() }
    }
}

struct LogWriter {
    out: BufWriter<File>,
    /// Table stem -> file id; an `Open` entry is emitted when a stem
    /// first shows up.
    ids: HashMap<String, u32>,
    next_file_id: u32,
}

/// The shared physical log.
///
/// Engine worker threads append under the internal mutex; a write
/// failure latches a hard error that fails the backup while the
/// tables themselves stay usable.
pub struct PhysicalLog {
    inner: Mutex<Option<LogWriter>>,
    hard_write_error: AtomicBool,
}

impl Default for PhysicalLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalLog {
    pub fn new() -> Self {
        Self { inner: Mutex::new(None), hard_write_error: AtomicBool::new(false) }
    }

    /// Start logging into a fresh file at `path`.
    pub fn start(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_some() {
            return Err(Error::logic("physical logging is already running"));
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| Error::io(format!("cannot create {}", path.display()), err))?;
        *inner = Some(LogWriter {
            out: BufWriter::new(file),
            ids: HashMap::new(),
            next_file_id: 1,
        });
        self.hard_write_error.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    pub fn had_write_error(&self) -> bool {
        self.hard_write_error.load(Ordering::SeqCst)
    }

    /// Append one entry for `share`; called from the engine write path
    /// after the file write completed. Failures latch the hard error
    /// instead of failing the writer.
    fn append(&self, share: &TableShare, entry_for: impl FnOnce(u32) -> LogEntry) {
        let mut inner = self.inner.lock().unwrap();
        let writer = match inner.as_mut() {
            Some(writer) => writer,
            None => return, // logging stopped between flag check and here
        };
        let stem = share.files.stem();
        let result = (|| -> std::io::Result<()> {
            let file_id = match writer.ids.get(&stem) {
                Some(id) => *id,
                None => {
                    let id = writer.next_file_id;
                    writer.next_file_id += 1;
                    writer.ids.insert(stem.clone(), id);
                    write_entry(
                        &mut writer.out,
                        &LogEntry::Open { file_id: id, name: stem.into_bytes() },
                    )?;
                    id
                }
            };
            write_entry(&mut writer.out, &entry_for(file_id))
        })();
        if let Err(err) = result {
            warn!("physical log write failed: {}", err);
            self.hard_write_error.store(true, Ordering::SeqCst);
        }
    }

    /// Stop logging so that the log ends in a consistent state.
    ///
    /// Requires that the caller holds read locks on all logged
    /// tables. Cached index headers are flushed into the log first,
    /// then the log file is flushed and closed.
    pub fn close_consistent(&self, shares: &[Arc<TableShare>]) -> Result<()> {
        for share in shares {
            if !share.physical_logging.load(Ordering::SeqCst) {
                continue;
            }
            let header = share.read_index_header()?;
            self.append(share, |file_id| LogEntry::WriteIndex {
                file_id,
                offset: 0,
                data: header.clone(),
            });
            self.append(share, |file_id| LogEntry::Close { file_id });
            share.set_physical_logging(false);
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(mut writer) = inner.take() {
            writer
                .out
                .flush()
                .map_err(|err| Error::io("flush physical log", err))?;
        }
        Ok(())
    }

    /// Stop logging without consistency guarantees (cancellation).
    pub fn close_inconsistent(&self, shares: &[Arc<TableShare>]) {
        for share in shares {
            share.set_physical_logging(false);
        }
        let _ = self.inner.lock().unwrap().take();
    }
}

/// One open table of the model engine.
///
/// All writes go through `pwrite_*`/`chsize_index`: they perform the
/// file write first and read the logging flag *afterwards*, which
/// together with the flag being set before the copy starts guarantees
/// that no write is lost between copy and log.
pub struct TableShare {
    files: TableFiles,
    data: File,
    index: File,
    physical_logging: AtomicBool,
    lock: RwLock<()>,
    log: Arc<PhysicalLog>,
}

impl TableShare {
    /// Create a fresh table: empty data file, index file holding only
    /// a header.
    pub fn create(files: TableFiles, log: Arc<PhysicalLog>) -> Result<Arc<Self>> {
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(files.data_path())
            .map_err(|err| Error::io(format!("cannot create {}", files.data_path().display()), err))?;
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(files.index_path())
            .map_err(|err| {
                Error::io(format!("cannot create {}", files.index_path().display()), err)
            })?;

        let mut header = vec![0u8; INDEX_HEADER_SIZE as usize];
        header[..4].copy_from_slice(&INDEX_MAGIC);
        index
            .write_all_at(&header, 0)
            .map_err(|err| Error::io("initialize index header", err))?;

        Ok(Arc::new(Self {
            files,
            data,
            index,
            physical_logging: AtomicBool::new(false),
            lock: RwLock::new(()),
            log,
        }))
    }

    /// Open an existing table.
    pub fn open(files: TableFiles, log: Arc<PhysicalLog>) -> Result<Arc<Self>> {
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .open(files.data_path())
            .map_err(|err| Error::io(format!("cannot open {}", files.data_path().display()), err))?;
        let index = OpenOptions::new()
            .read(true)
            .write(true)
            .open(files.index_path())
            .map_err(|err| Error::io(format!("cannot open {}", files.index_path().display()), err))?;
        Ok(Arc::new(Self {
            files,
            data,
            index,
            physical_logging: AtomicBool::new(false),
            lock: RwLock::new(()),
            log,
        }))
    }

    pub fn files(&self) -> &TableFiles {
        &self.files
    }

    pub fn set_physical_logging(&self, on: bool) {
        self.physical_logging.store(on, Ordering::SeqCst);
    }

    /// Shared lock blocking all writers; held by the backup locking
    /// thread around the validity point.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap()
    }

    pub fn data_len(&self) -> Result<u64> {
        self.data
            .metadata()
            .map(|m| m.len())
            .map_err(|err| Error::io("stat data file", err))
    }

    pub fn index_len(&self) -> Result<u64> {
        self.index
            .metadata()
            .map(|m| m.len())
            .map_err(|err| Error::io("stat index file", err))
    }

    /// Write to the data file at `offset`.
    pub fn pwrite_data(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let _w = self.lock.write().unwrap();
        self.data
            .write_all_at(buf, offset)
            .map_err(|err| Error::io("write data file", err))?;
        // flag is read after the write completed; see module docs
        if self.physical_logging.load(Ordering::SeqCst) {
            self.log.append(self, |file_id| LogEntry::WriteData {
                file_id,
                offset,
                data: buf.to_vec(),
            });
        }
        Ok(())
    }

    /// Write to the index file at `offset`.
    pub fn pwrite_index(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let _w = self.lock.write().unwrap();
        self.index
            .write_all_at(buf, offset)
            .map_err(|err| Error::io("write index file", err))?;
        if self.physical_logging.load(Ordering::SeqCst) {
            self.log.append(self, |file_id| LogEntry::WriteIndex {
                file_id,
                offset,
                data: buf.to_vec(),
            });
        }
        Ok(())
    }

    /// Truncate or extend the index file.
    pub fn chsize_index(&self, new_len: u64) -> Result<()> {
        let _w = self.lock.write().unwrap();
        self.index
            .set_len(new_len)
            .map_err(|err| Error::io("resize index file", err))?;
        if self.physical_logging.load(Ordering::SeqCst) {
            self.log
                .append(self, |file_id| LogEntry::ChsizeIndex { file_id, new_len });
        }
        Ok(())
    }

    /// Mark the table dirty-open; goes through the logged write path.
    pub fn bump_open_count(&self) -> Result<()> {
        let count = read_open_count(&self.files.index_path())?;
        self.pwrite_index(OPEN_COUNT_OFFSET, &(count + 1).to_le_bytes())
    }

    fn read_index_header(&self) -> Result<Vec<u8>> {
        let len = self.index_len()?.min(INDEX_HEADER_SIZE) as usize;
        let mut buf = vec![0u8; len];
        self.index
            .read_exact_at(&mut buf, 0)
            .map_err(|err| Error::io("read index header", err))?;
        Ok(buf)
    }
}

/// Dirty-open counter of an index file.
pub fn read_open_count(index_path: &Path) -> Result<u32> {
    let file = File::open(index_path)
        .map_err(|err| Error::io(format!("cannot open {}", index_path.display()), err))?;
    let mut buf = [0u8; 4];
    file.read_exact_at(&mut buf, OPEN_COUNT_OFFSET)
        .map_err(|err| Error::io("read open count", err))?;
    Ok(u32::from_le_bytes(buf))
}

/// Reset the dirty-open counter after a restore replay, so future
/// opens do not trigger spurious repair warnings.
pub fn reset_open_count(index_path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(index_path)
        .map_err(|err| Error::io(format!("cannot open {}", index_path.display()), err))?;
    file.write_all_at(&0u32.to_le_bytes(), OPEN_COUNT_OFFSET)
        .map_err(|err| Error::io("reset open count", err))
}

/// Engine repair path used when only the index header was backed up.
pub trait IndexRepair {
    fn rebuild(&self, files: &TableFiles) -> Result<()>;
}

/// Fallback repair: truncate the index to its header and clear the
/// dirty-open counter. A real engine rebuilds the index from the data
/// file here.
pub struct HeaderOnlyRepair;

impl IndexRepair for HeaderOnlyRepair {
    fn rebuild(&self, files: &TableFiles) -> Result<()> {
        let path = files.index_path();
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|err| Error::io(format!("cannot open {}", path.display()), err))?;
        file.set_len(INDEX_HEADER_SIZE)
            .map_err(|err| Error::io("truncate index", err))?;
        drop(file);
        reset_open_count(&path)
    }
}
