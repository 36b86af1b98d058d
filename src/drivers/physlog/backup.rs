//! Backup side of the physical-log driver.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ::log::{debug, warn};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::error::{Error, Result};
use crate::kernel::{BackupDriver, Buffer, DriverReply};
use crate::tools::scratch_file_name;

use super::{
    PhysicalLog, TableShare, DRIVER_NAME, FILE_CODE_DATA, FILE_CODE_INDEX_HEADER, FILE_CODE_LOG,
    FILE_CODE_WHOLE_INDEX, INDEX_HEADER_SIZE,
};

/// Copy only the index header and rebuild the index at restore.
const ENV_NO_INDEX: &str = "BACKUP_NO_INDEX";
/// Milliseconds to sleep per [`BYTES_BETWEEN_SLEEPS`] copied.
const ENV_SLEEP: &str = "BACKUP_SLEEP";

const BYTES_BETWEEN_SLEEPS: u64 = 10 * 1024 * 1024;

/// Driver configuration; the env knobs are read at `begin()`.
#[derive(Clone, Debug)]
pub struct PhyslogConfig {
    /// Where the physical log scratch file lives during the backup.
    pub scratch_dir: PathBuf,
    /// Set when outside processes may write the table files; the
    /// driver refuses to run then, since such writes would bypass the
    /// log.
    pub external_locking: bool,
}

impl Default for PhyslogConfig {
    fn default() -> Self {
        Self { scratch_dir: std::env::temp_dir(), external_locking: false }
    }
}

/// Copies one file in bounded blocks, each prefixed with its file
/// code.
struct FileCopy {
    file: File,
    pos: u64,
    /// Copy stops here even if the file grew meanwhile.
    limit: u64,
    code: u8,
}

impl FileCopy {
    fn open(path: &Path, limit: Option<u64>, code: u8) -> Result<Self> {
        let file = File::open(path)
            .map_err(|err| Error::io(format!("cannot open {}", path.display()), err))?;
        let limit = match limit {
            Some(limit) => limit,
            None => u64::MAX,
        };
        Ok(Self { file, pos: 0, limit, code })
    }

    /// Fill `buf` with the next block; at end of file the buffer is
    /// empty with the LAST flag set.
    fn get_data(&mut self, buf: &mut Buffer) -> Result<()> {
        let space = buf.space();
        debug_assert!(space.len() >= 2);
        space[0] = self.code;

        let want = (space.len() as u64 - 1).min(self.limit.saturating_sub(self.pos)) as usize;
        let got = if want == 0 {
            0
        } else {
            self.file
                .read_at(&mut space[1..1 + want], self.pos)
                .map_err(|err| Error::io("read table file", err))?
        };

        if got == 0 {
            buf.set_size(0);
            buf.last = true;
        } else {
            self.pos += got as u64;
            buf.set_size(1 + got);
            buf.last = false;
        }
        Ok(())
    }
}

/// Copies one table: data file first, then the index file (or just
/// its header).
struct TableBackup {
    data: FileCopy,
    index: FileCopy,
    in_index: bool,
}

impl TableBackup {
    fn open(share: &TableShare, index_pages: bool) -> Result<Self> {
        let files = share.files();
        let data = FileCopy::open(&files.data_path(), Some(share.data_len()?), FILE_CODE_DATA)?;
        let index = if index_pages {
            FileCopy::open(
                &files.index_path(),
                Some(share.index_len()?),
                FILE_CODE_WHOLE_INDEX,
            )?
        } else {
            FileCopy::open(
                &files.index_path(),
                Some(INDEX_HEADER_SIZE),
                FILE_CODE_INDEX_HEADER,
            )?
        };
        Ok(Self { data, index, in_index: false })
    }

    fn get_data(&mut self, buf: &mut Buffer) -> Result<()> {
        if !self.in_index {
            self.data.get_data(buf)?;
            if buf.last {
                // move on to the index file; not the end of this stream
                self.in_index = true;
                buf.last = false;
            }
            return Ok(());
        }
        self.index.get_data(buf)
    }
}

enum Phase {
    TableFiles,
    LogBeforeLock,
    LogAfterLock,
    Done,
}

enum LockNote {
    Acquired,
}

/// Online backup driver: dirty table copies plus the physical log.
pub struct PhyslogBackupDriver {
    shares: Vec<Arc<TableShare>>,
    log: Arc<PhysicalLog>,
    config: PhyslogConfig,
    phase: Phase,
    /// Stream currently written: tables use 1..=N, the log stream 0.
    stream: u32,
    table: Option<TableBackup>,
    log_copy: Option<FileCopy>,
    log_path: Option<PathBuf>,
    index_pages: bool,
    sleep_ms: u64,
    bytes_since_sleep: u64,
    lock_rx: Option<Receiver<LockNote>>,
    lock_stop: Option<Sender<()>>,
    lock_thread: Option<JoinHandle<()>>,
}

impl PhyslogBackupDriver {
    pub fn new(shares: Vec<Arc<TableShare>>, log: Arc<PhysicalLog>, config: PhyslogConfig) -> Self {
        Self {
            shares,
            log,
            config,
            phase: Phase::TableFiles,
            stream: 1,
            table: None,
            log_copy: None,
            log_path: None,
            index_pages: true,
            sleep_ms: 0,
            bytes_since_sleep: 0,
            lock_rx: None,
            lock_stop: None,
            lock_thread: None,
        }
    }

    fn err(&self, reason: impl Into<String>) -> Error {
        Error::driver(DRIVER_NAME, reason.into())
    }

    /// Tell the locking thread to release its locks and wait for it.
    fn kill_locking_thread(&mut self) {
        if let Some(stop) = self.lock_stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.lock_thread.take() {
            let _ = handle.join();
        }
        self.lock_rx = None;
    }

    fn remove_log_file(&mut self) {
        if let Some(path) = self.log_path.take() {
            let _ = std::fs::remove_file(&path);
        }
    }

    /// Abandon logging and all helper state; used by cancel and drop.
    fn teardown(&mut self) {
        self.log.close_inconsistent(&self.shares);
        self.kill_locking_thread();
        self.log_copy = None;
        self.remove_log_file();
    }

    fn throttle(&mut self, produced: usize) {
        if self.sleep_ms == 0 {
            return;
        }
        self.bytes_since_sleep += produced as u64;
        if self.bytes_since_sleep > BYTES_BETWEEN_SLEEPS {
            std::thread::sleep(Duration::from_millis(self.sleep_ms));
            self.bytes_since_sleep = 0;
        }
    }
}

impl BackupDriver for PhyslogBackupDriver {
    fn init_size(&self) -> Option<u64> {
        None
    }

    fn begin(&mut self, _block_size: usize) -> Result<()> {
        if self.shares.is_empty() {
            return Err(Error::logic("physlog driver started without tables"));
        }
        if self.config.external_locking {
            // outside writers would bypass the log
            return Err(self.err("no consistent copy possible with external locking"));
        }

        self.index_pages = match std::env::var(ENV_NO_INDEX) {
            Ok(val) => val.trim().parse::<i64>().map(|v| v == 0).unwrap_or(true),
            Err(_) => true,
        };
        self.sleep_ms = std::env::var(ENV_SLEEP)
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(0);

        let log_path = self
            .config
            .scratch_dir
            .join(scratch_file_name("img", "backuplog"));
        self.log.start(&log_path)?;
        self.log_path = Some(log_path);
        for share in &self.shares {
            share.set_physical_logging(true);
        }
        debug!(
            "{} driver logging {} tables{}",
            DRIVER_NAME,
            self.shares.len(),
            if self.index_pages { "" } else { " (index headers only)" }
        );
        Ok(())
    }

    fn get_data(&mut self, buf: &mut Buffer) -> Result<DriverReply> {
        buf.table_num = self.stream;

        if let Phase::Done = self.phase {
            buf.set_size(0);
            buf.last = true;
            return Ok(DriverReply::Done);
        }

        match self.phase {
            Phase::TableFiles => {
                if self.table.is_none() {
                    let share = &self.shares[self.stream as usize - 1];
                    self.table = Some(TableBackup::open(share, self.index_pages)?);
                }
                self.table.as_mut().unwrap().get_data(buf)?;
            }
            Phase::LogBeforeLock | Phase::LogAfterLock => {
                if self.log.had_write_error() {
                    return Err(self.err("physical log write failed, copy is inconsistent"));
                }
                if self.log_copy.is_none() {
                    let path = self
                        .log_path
                        .as_ref()
                        .ok_or_else(|| Error::logic("log phase without a log file"))?;
                    self.log_copy = Some(FileCopy::open(path, None, FILE_CODE_LOG)?);
                }
                self.log_copy.as_mut().unwrap().get_data(buf)?;
            }
            Phase::Done => unreachable!(),
        }

        self.throttle(buf.size());

        match self.phase {
            Phase::LogBeforeLock => {
                // the log may still grow until the locks are in place
                buf.last = false;
                let rx = match &self.lock_rx {
                    Some(rx) => rx,
                    None => return Ok(DriverReply::Ok), // prelock not called yet
                };
                match rx.try_recv() {
                    Err(TryRecvError::Empty) => Ok(DriverReply::Ok),
                    Ok(LockNote::Acquired) => {
                        debug!("{} locking thread acquired table locks", DRIVER_NAME);
                        self.log.close_consistent(&self.shares)?;
                        if self.log.had_write_error() {
                            return Err(
                                self.err("physical log write failed, copy is inconsistent")
                            );
                        }
                        self.phase = Phase::LogAfterLock;
                        // end of prepare, ready for lock()
                        Ok(DriverReply::Ready)
                    }
                    Err(TryRecvError::Disconnected) => {
                        Err(self.err("locking thread died without acquiring locks"))
                    }
                }
            }
            _ => {
                if buf.last {
                    if let Phase::LogAfterLock = self.phase {
                        // log fully streamed; the log stream is not a
                        // table, so it gets no LAST marker on the wire
                        buf.last = false;
                        self.log_copy = None;
                        self.remove_log_file();
                        self.phase = Phase::Done;
                        return Ok(DriverReply::Done);
                    }
                    // this stream is finished, the next call opens the
                    // next one
                    self.table = None;
                    self.stream += 1;
                    if self.stream > self.shares.len() as u32 {
                        self.stream = 0;
                        self.phase = Phase::LogBeforeLock;
                        // end of the initial transfer
                        return Ok(DriverReply::Ready);
                    }
                }
                Ok(DriverReply::Ok)
            }
        }
    }

    /// Launch the locking thread. Locking through the table lock
    /// manager blocks, and blocking here would stall the whole
    /// kernel, hence the helper thread.
    fn prelock(&mut self) -> Result<DriverReply> {
        let (note_tx, note_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);
        let shares = self.shares.clone();

        let handle = std::thread::spawn(move || {
            let guards: Vec<_> = shares.iter().map(|share| share.read_lock()).collect();
            if note_tx.send(LockNote::Acquired).is_err() {
                return; // driver is gone
            }
            // hold the locks until the driver tells us to let go
            let _ = stop_rx.recv();
            drop(guards);
        });

        self.lock_rx = Some(note_rx);
        self.lock_stop = Some(stop_tx);
        self.lock_thread = Some(handle);
        Ok(DriverReply::Ok)
    }

    fn lock(&mut self) -> Result<()> {
        // locking was done during prelock already
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.kill_locking_thread();
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.remove_log_file();
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        self.teardown();
        Ok(())
    }
}

impl Drop for PhyslogBackupDriver {
    fn drop(&mut self) {
        // if logging is still on the backup did not end cleanly
        if self.log.is_active() {
            warn!("{} driver dropped while logging, stopping dirtily", DRIVER_NAME);
        }
        self.teardown();
    }
}
