//! Operation contexts: lifecycle of a whole backup or restore run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use once_cell::sync::Lazy;

use crate::catalog::{Catalog, ItemRef, Snapshot};
use crate::error::{Error, Result};
use crate::stream::serialize::{self, Summary};
use crate::stream::{HeaderFlags, InputStream, OutputStream, StreamConfig};

use super::{
    restore_table_data, write_table_data, BackupDriver, BackupStats, CommitBlocker, RestoreDriver,
    RestoreJob, SnapshotJob,
};

/// Shared cancellation signal; any clone can cancel the operation.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct RunRegistry {
    busy: Mutex<bool>,
}

/// At most one backup/restore operation per process.
static RUN_REGISTRY: Lazy<RunRegistry> = Lazy::new(|| RunRegistry { busy: Mutex::new(false) });

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Holds the process-wide operation slot.
///
/// Dropping the guard releases the slot and removes the output file of
/// a failed run (a successful run calls
/// [`keep_output`](RunGuard::keep_output) first).
pub struct RunGuard {
    op_id: u64,
    kind: &'static str,
    output: Option<PathBuf>,
    remove_output: bool,
}

impl RunGuard {
    pub fn acquire(kind: &'static str) -> Result<Self> {
        let mut busy = RUN_REGISTRY.busy.lock().unwrap();
        if *busy {
            return Err(Error::Policy(
                "another backup/restore operation is already running".to_string(),
            ));
        }
        *busy = true;
        drop(busy);

        let op_id = NEXT_OP_ID.fetch_add(1, Ordering::Relaxed);
        info!("{} #{}: operation starting", kind, op_id);
        Ok(Self { op_id, kind, output: None, remove_output: false })
    }

    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    /// Remember an output file created by this run; it is removed if
    /// the guard drops without [`keep_output`](RunGuard::keep_output).
    pub fn register_output(&mut self, path: &Path) {
        self.output = Some(path.to_owned());
        self.remove_output = true;
    }

    pub fn keep_output(&mut self) {
        self.remove_output = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.remove_output {
            if let Some(path) = &self.output {
                match std::fs::remove_file(path) {
                    Ok(()) => info!(
                        "{} #{}: removed incomplete image {}",
                        self.kind,
                        self.op_id,
                        path.display()
                    ),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(
                        "{} #{}: cannot remove {}: {}",
                        self.kind,
                        self.op_id,
                        path.display(),
                        err
                    ),
                }
            }
        }
        *RUN_REGISTRY.busy.lock().unwrap() = false;
    }
}

/// Creates the drivers for the snapshots of a catalogue. This is the
/// seam to the storage engine plug-in registry. `snap_num` is the
/// 1-based snapshot number.
pub trait DriverProvider {
    fn backup_driver(
        &self,
        snap_num: u16,
        snap: &Snapshot,
        cat: &Catalog,
    ) -> Result<Box<dyn BackupDriver>>;

    fn restore_driver(
        &self,
        snap_num: u16,
        snap: &Snapshot,
        cat: &Catalog,
    ) -> Result<Box<dyn RestoreDriver>>;
}

/// Recreates database objects from their metadata during restore.
/// External collaborator; object serialization formats are not part
/// of the image subsystem.
pub trait ObjectMaterializer {
    fn materialize(&mut self, item: ItemRef, cat: &Catalog) -> Result<()>;
}

/// Materializer that ignores all objects.
pub struct NullMaterializer;

impl ObjectMaterializer for NullMaterializer {
    fn materialize(&mut self, _item: ItemRef, _cat: &Catalog) -> Result<()> {
        Ok(())
    }
}

fn snapshot_jobs<T>(
    cat: &Catalog,
    mut create: impl FnMut(u16, &Snapshot, &Catalog) -> Result<T>,
) -> Result<Vec<(u16, String, u32, T)>> {
    let mut jobs = Vec::with_capacity(cat.snap_count() as usize);
    for (idx, snap) in cat.snapshots().enumerate() {
        let snap_num = idx as u16 + 1;
        let driver = create(snap_num, snap, cat)?;
        jobs.push((snap_num, snap.descr.name(), snap.table_count(), driver));
    }
    Ok(jobs)
}

/// Context of one backup operation.
///
/// Create with [`prepare`](BackupContext::prepare), populate the
/// catalogue, then run [`do_backup`](BackupContext::do_backup).
pub struct BackupContext {
    guard: RunGuard,
    config: StreamConfig,
    path: PathBuf,
    catalog: Catalog,
    cancel: CancelFlag,
}

impl BackupContext {
    /// Acquire the run lock and set up an empty catalogue.
    pub fn prepare(path: &Path, config: StreamConfig) -> Result<Self> {
        let guard = RunGuard::acquire("backup")?;
        let mut catalog = Catalog::new();
        catalog.header.save_start_time();
        Ok(Self {
            guard,
            config,
            path: path.to_owned(),
            catalog,
            cancel: CancelFlag::new(),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub fn op_id(&self) -> u64 {
        self.guard.op_id()
    }

    /// Handle for cancelling the operation from another thread.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the backup: open the stream, write the preamble, run the
    /// scheduler, write the summary. On any fatal error the output
    /// file is removed.
    pub fn do_backup(
        mut self,
        provider: &dyn DriverProvider,
        blocker: &mut dyn CommitBlocker,
    ) -> Result<BackupStats> {
        let op_id = self.guard.op_id();
        self.catalog.close();

        let mut out = OutputStream::open_write(&self.path, &self.config)?;
        self.guard.register_output(&self.path);
        info!(
            "backup #{}: writing image of {} tables to {}",
            op_id,
            self.catalog.table_count(),
            self.path.display()
        );

        let stats = Self::run_backup(
            &mut self.catalog,
            &mut out,
            provider,
            blocker,
            &self.cancel,
        )?;
        let file_bytes = out.close()?;
        self.guard.keep_output();
        info!(
            "backup #{}: done, {} bytes of table data, {} bytes written",
            op_id, stats.data_size, file_bytes
        );
        Ok(stats)
    }

    fn run_backup(
        cat: &mut Catalog,
        out: &mut OutputStream,
        provider: &dyn DriverProvider,
        blocker: &mut dyn CommitBlocker,
        cancel: &CancelFlag,
    ) -> Result<BackupStats> {
        serialize::write_preamble(out, cat)?;

        let jobs = snapshot_jobs(cat, |num, snap, cat| provider.backup_driver(num, snap, cat))?
            .into_iter()
            .map(|(snap_num, name, table_count, driver)| SnapshotJob {
                snap_num,
                name,
                table_count,
                driver,
            })
            .collect();

        let stats = write_table_data(cat, jobs, out, blocker, cancel)?;

        cat.header.save_end_time();
        let summary = Summary {
            end_time: cat.header.end_time,
            vp_time: cat.header.vp_time,
            binlog_pos: cat.header.binlog_pos.clone(),
            data_size: stats.data_size,
            chunk_count: stats.chunk_count,
            snapshot_bytes: stats.snapshot_bytes.clone(),
        };
        serialize::write_summary(out, &summary)?;
        Ok(stats)
    }
}

/// Context of one restore operation.
pub struct RestoreContext {
    guard: RunGuard,
    catalog: Catalog,
    cancel: CancelFlag,
    inp: InputStream,
    /// Present when the image carries its summary inline after the
    /// header.
    early_summary: Option<Summary>,
}

impl RestoreContext {
    /// Acquire the run lock, open the image and read header and
    /// catalogue.
    pub fn prepare(path: &Path) -> Result<Self> {
        let guard = RunGuard::acquire("restore")?;
        let mut inp = InputStream::open_read(path)?;
        let header = serialize::read_header(&mut inp)?;
        let early_summary = if header.flags.contains(HeaderFlags::INLINE_SUMMARY) {
            Some(serialize::read_summary(&mut inp)?)
        } else {
            None
        };
        let mut catalog = Catalog::from_header(header);
        serialize::read_catalogue(&mut inp, &mut catalog)?;
        info!(
            "restore #{}: image {} holds {} tables in {} snapshots",
            guard.op_id(),
            path.display(),
            catalog.table_count(),
            catalog.snap_count()
        );
        Ok(Self { guard, catalog, cancel: CancelFlag::new(), inp, early_summary })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn op_id(&self) -> u64 {
        self.guard.op_id()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the restore: materialize metadata, feed data chunks to the
    /// restore drivers, read the summary.
    pub fn do_restore(
        mut self,
        provider: &dyn DriverProvider,
        materializer: &mut dyn ObjectMaterializer,
    ) -> Result<(Catalog, Summary)> {
        let op_id = self.guard.op_id();
        serialize::read_meta_data(&mut self.inp, &mut self.catalog)?;

        for (item_ref, item) in self.catalog.image_order() {
            if item.meta().is_some() {
                materializer.materialize(item_ref, &self.catalog)?;
            }
        }
        self.catalog.close();

        let jobs =
            snapshot_jobs(&self.catalog, |num, snap, cat| provider.restore_driver(num, snap, cat))?
            .into_iter()
            .map(|(snap_num, name, _, driver)| RestoreJob { snap_num, name, driver })
            .collect();
        restore_table_data(&mut self.catalog, jobs, &mut self.inp, &self.cancel)?;

        let summary = match self.early_summary.take() {
            Some(summary) => summary,
            None => serialize::read_summary(&mut self.inp)?,
        };
        self.catalog.header.end_time = summary.end_time;
        if self.catalog.header.vp_time.is_zero() {
            self.catalog.header.vp_time = summary.vp_time;
        }
        if self.catalog.header.binlog_pos.is_none() {
            if let Some(pos) = &summary.binlog_pos {
                self.catalog.header.save_binlog_pos(pos.clone());
            }
        }
        info!(
            "restore #{}: done, {} bytes of table data restored",
            op_id, self.catalog.data_size
        );
        Ok((self.catalog, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // the run lock is process-wide; serialize the tests touching it
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn run_guard_is_exclusive() {
        let _t = TEST_LOCK.lock().unwrap();
        let first = RunGuard::acquire("backup").unwrap();
        assert!(matches!(RunGuard::acquire("restore"), Err(Error::Policy(_))));
        drop(first);
        let second = RunGuard::acquire("restore").unwrap();
        assert!(second.op_id() > 0);
    }

    #[test]
    fn run_guard_removes_abandoned_output() {
        let _t = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        std::fs::write(&path, b"partial").unwrap();

        let mut guard = RunGuard::acquire("backup").unwrap();
        guard.register_output(&path);
        drop(guard);
        assert!(!path.exists());

        // a kept output survives
        std::fs::write(&path, b"complete").unwrap();
        let mut guard = RunGuard::acquire("backup").unwrap();
        guard.register_output(&path);
        guard.keep_output();
        drop(guard);
        assert!(path.exists());
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
