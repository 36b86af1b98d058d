//! Restore-side demultiplexer.

use log::{debug, warn};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::stream::{serialize, InputStream};

use super::{CancelFlag, DataSlice, DriverReply, RestoreDriver};

/// One snapshot's restore work.
pub struct RestoreJob {
    /// 1-based snapshot number.
    pub snap_num: u16,
    pub name: String,
    pub driver: Box<dyn RestoreDriver>,
}

/// Consecutive `Err` answers tolerated for the same chunk.
const MAX_ERRORS: u32 = 3;
/// Consecutive `Processing`/`Busy` answers tolerated for the same
/// chunk before the driver counts as deadlocked.
const MAX_REPEATS: u32 = 7;

/// Read data chunks off the stream and route each to the restore
/// driver of its snapshot.
///
/// Chunks for snapshots without a driver are skipped with a trace, so
/// partial-restore tools keep working. At the end of the data section
/// every driver is shut down; the names of drivers that failed to shut
/// down are collected into a single diagnostic.
pub fn restore_table_data(
    cat: &mut Catalog,
    jobs: Vec<RestoreJob>,
    inp: &mut InputStream,
    cancel: &CancelFlag,
) -> Result<()> {
    let mut drivers: Vec<Option<(String, Box<dyn RestoreDriver>)>> = Vec::new();
    drivers.resize_with(cat.snap_count() as usize, || None);
    for job in jobs {
        let slot = (job.snap_num as usize)
            .checked_sub(1)
            .and_then(|n| drivers.get_mut(n))
            .ok_or_else(|| {
                Error::logic(format!(
                    "restore driver for unknown snapshot {}",
                    job.snap_num
                ))
            })?;
        *slot = Some((job.name, job.driver));
    }

    let cancel_all = |drivers: &mut Vec<Option<(String, Box<dyn RestoreDriver>)>>| {
        for entry in drivers.iter_mut().flatten() {
            let _ = entry.1.cancel(); // best-effort cleanup
        }
    };

    let mut init_failure: Option<(String, Error)> = None;
    for entry in drivers.iter_mut().flatten() {
        if let Err(err) = entry.1.begin(0) {
            init_failure = Some((entry.0.clone(), err));
            break;
        }
    }
    if let Some((name, err)) = init_failure {
        cancel_all(&mut drivers);
        return Err(Error::driver(name, format!("failed to initialize: {}", err)));
    }

    let mut errors = 0u32;
    let mut repeats = 0u32;

    loop {
        if cancel.is_cancelled() {
            cancel_all(&mut drivers);
            return Err(Error::cancelled());
        }

        let chunk = match serialize::read_data_chunk(inp) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                cancel_all(&mut drivers);
                return Err(err);
            }
        };

        let entry = match (chunk.snap_num as usize)
            .checked_sub(1)
            .and_then(|n| drivers.get_mut(n))
            .and_then(Option::as_mut)
        {
            Some(entry) => entry,
            None => {
                debug!("skipping data from snapshot #{}", chunk.snap_num);
                continue;
            }
        };
        let (name, drv) = (&entry.0, &mut entry.1);
        debug!(
            "got {} bytes of {} image data (for table #{})",
            chunk.data.len(),
            name,
            chunk.table_num
        );

        let slice = DataSlice {
            data: &chunk.data,
            table_num: chunk.table_num,
            last: chunk.last,
        };

        // keep offering the same chunk until it is accepted
        let fatal = loop {
            match drv.send_data(&slice) {
                Ok(DriverReply::Ok) | Ok(DriverReply::Ready) | Ok(DriverReply::Done) => {
                    cat.data_size += chunk.data.len() as u64;
                    errors = 0;
                    repeats = 0;
                    break None;
                }
                Ok(DriverReply::Processing) | Ok(DriverReply::Busy) => {
                    repeats += 1;
                    if repeats > MAX_REPEATS {
                        break Some(Error::driver(
                            name.clone(),
                            format!("did not accept data after {} retries", repeats),
                        ));
                    }
                }
                Err(err) => {
                    errors += 1;
                    warn!("{} restore driver error: {}", name, err);
                    if errors > MAX_ERRORS {
                        break Some(Error::driver(
                            name.clone(),
                            format!("failed to restore data of table #{}", chunk.table_num),
                        ));
                    }
                }
            }
        };
        if let Some(err) = fatal {
            cancel_all(&mut drivers);
            return Err(err);
        }
    }
    debug!("end of backup stream");

    // shut down all drivers, collecting failures
    let mut bad_drivers: Vec<String> = Vec::new();
    for entry in drivers.iter_mut().flatten() {
        debug!("shutting down {} restore driver", entry.0);
        if let Err(err) = entry.1.end() {
            warn!("{} restore driver failed to shut down: {}", entry.0, err);
            bad_drivers.push(entry.0.clone());
        }
    }
    if !bad_drivers.is_empty() {
        return Err(Error::driver(
            bad_drivers.join(","),
            "restore drivers failed to shut down",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::catalog::{SnapshotDescriptor, SnapshotInfo};
    use crate::stream::{serialize, OutputStream, StreamConfig};

    #[derive(Default)]
    struct SinkState {
        chunks: Vec<(u32, bool, Vec<u8>)>,
        ended: bool,
        cancelled: bool,
    }

    /// Collects everything; can be scripted to stall or fail.
    struct SinkDriver {
        state: Arc<Mutex<SinkState>>,
        /// `Busy` answers before accepting each chunk.
        stall: u32,
        stalled: u32,
        /// `Err` answers before accepting each chunk.
        fail: u32,
        failed: u32,
        fail_end: bool,
    }

    impl SinkDriver {
        fn new(state: Arc<Mutex<SinkState>>) -> Self {
            Self { state, stall: 0, stalled: 0, fail: 0, failed: 0, fail_end: false }
        }
    }

    impl RestoreDriver for SinkDriver {
        fn begin(&mut self, _block_size: usize) -> Result<()> {
            Ok(())
        }

        fn send_data(&mut self, chunk: &DataSlice) -> Result<DriverReply> {
            if self.stalled < self.stall {
                self.stalled += 1;
                return Ok(DriverReply::Busy);
            }
            if self.failed < self.fail {
                self.failed += 1;
                return Err(Error::format("scripted send failure"));
            }
            self.stalled = 0;
            self.failed = 0;
            self.state.lock().unwrap().chunks.push((
                chunk.table_num,
                chunk.last,
                chunk.data.to_vec(),
            ));
            Ok(DriverReply::Ok)
        }

        fn end(&mut self) -> Result<()> {
            if self.fail_end {
                return Err(Error::format("scripted end failure"));
            }
            self.state.lock().unwrap().ended = true;
            Ok(())
        }

        fn cancel(&mut self) -> Result<()> {
            self.state.lock().unwrap().cancelled = true;
            Ok(())
        }
    }

    fn catalog_with_snapshots(n: u16) -> Catalog {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        for i in 0..n {
            let mut snap = SnapshotInfo::new(SnapshotDescriptor::default_blocking(1));
            cat.add_table(db, format!("t{}", i).as_bytes(), &mut snap, 0)
                .unwrap();
        }
        cat.close();
        cat
    }

    fn image_with_chunks(
        dir: &tempfile::TempDir,
        chunks: &[(u16, u32, bool, &[u8])],
    ) -> InputStream {
        let path = dir.path().join("img");
        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        for (snap, table, last, data) in chunks {
            serialize::write_data_chunk(&mut out, *snap, *table, *last, data).unwrap();
        }
        serialize::end_data_chunks(&mut out).unwrap();
        out.close().unwrap();
        InputStream::open_read(&path).unwrap()
    }

    fn job(snap_num: u16, driver: SinkDriver) -> RestoreJob {
        RestoreJob { snap_num, name: "Default".to_string(), driver: Box::new(driver) }
    }

    #[test]
    fn routes_chunks_by_snapshot_number() {
        let dir = tempfile::tempdir().unwrap();
        let mut inp = image_with_chunks(
            &dir,
            &[
                (1, 0, false, b"one"),
                (2, 0, false, b"two"),
                (1, 0, true, b"more"),
                (2, 0, true, &[]),
            ],
        );

        let s1 = Arc::new(Mutex::new(SinkState::default()));
        let s2 = Arc::new(Mutex::new(SinkState::default()));
        let jobs = vec![job(1, SinkDriver::new(s1.clone())), job(2, SinkDriver::new(s2.clone()))];

        let mut cat = catalog_with_snapshots(2);
        restore_table_data(&mut cat, jobs, &mut inp, &CancelFlag::new()).unwrap();

        let s1 = s1.lock().unwrap();
        let s2 = s2.lock().unwrap();
        assert_eq!(s1.chunks.len(), 2);
        assert_eq!(s1.chunks[1], (0, true, b"more".to_vec()));
        assert_eq!(s2.chunks.len(), 2);
        assert!(s2.chunks[1].2.is_empty() && s2.chunks[1].1);
        assert!(s1.ended && s2.ended);
        assert_eq!(cat.data_size, 3 + 3 + 4);
    }

    #[test]
    fn chunks_for_unknown_snapshots_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut inp = image_with_chunks(
            &dir,
            &[(1, 0, true, b"keep"), (2, 0, true, b"drop")],
        );

        let s1 = Arc::new(Mutex::new(SinkState::default()));
        // only snapshot 1 gets a driver
        let jobs = vec![job(1, SinkDriver::new(s1.clone()))];

        let mut cat = catalog_with_snapshots(2);
        restore_table_data(&mut cat, jobs, &mut inp, &CancelFlag::new()).unwrap();
        assert_eq!(s1.lock().unwrap().chunks.len(), 1);
        assert_eq!(cat.data_size, 4);
    }

    #[test]
    fn transient_stalls_and_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut inp = image_with_chunks(&dir, &[(1, 0, true, b"data")]);

        let state = Arc::new(Mutex::new(SinkState::default()));
        let mut driver = SinkDriver::new(state.clone());
        driver.stall = 5; // within MAX_REPEATS
        driver.fail = 2; // within MAX_ERRORS

        let mut cat = catalog_with_snapshots(1);
        restore_table_data(&mut cat, vec![job(1, driver)], &mut inp, &CancelFlag::new()).unwrap();
        assert_eq!(state.lock().unwrap().chunks.len(), 1);
    }

    #[test]
    fn deadlocked_driver_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut inp = image_with_chunks(&dir, &[(1, 0, true, b"data")]);

        let state = Arc::new(Mutex::new(SinkState::default()));
        let mut driver = SinkDriver::new(state.clone());
        driver.stall = MAX_REPEATS + 1;

        let mut cat = catalog_with_snapshots(1);
        let err =
            restore_table_data(&mut cat, vec![job(1, driver)], &mut inp, &CancelFlag::new())
                .unwrap_err();
        assert!(matches!(err, Error::Driver { .. }));
        assert!(state.lock().unwrap().cancelled);
    }

    #[test]
    fn persistently_failing_driver_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut inp = image_with_chunks(&dir, &[(1, 0, true, b"data")]);

        let state = Arc::new(Mutex::new(SinkState::default()));
        let mut driver = SinkDriver::new(state.clone());
        driver.fail = MAX_ERRORS + 1;

        let mut cat = catalog_with_snapshots(1);
        let err =
            restore_table_data(&mut cat, vec![job(1, driver)], &mut inp, &CancelFlag::new())
                .unwrap_err();
        assert!(matches!(err, Error::Driver { .. }));
    }

    #[test]
    fn shutdown_failures_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let mut inp = image_with_chunks(&dir, &[(1, 0, true, b"x"), (2, 0, true, b"y")]);

        let s1 = Arc::new(Mutex::new(SinkState::default()));
        let s2 = Arc::new(Mutex::new(SinkState::default()));
        let mut d1 = SinkDriver::new(s1.clone());
        d1.fail_end = true;
        let mut d2 = SinkDriver::new(s2.clone());
        d2.fail_end = true;

        let mut cat = catalog_with_snapshots(2);
        let err = restore_table_data(
            &mut cat,
            vec![job(1, d1), job(2, d2)],
            &mut inp,
            &CancelFlag::new(),
        )
        .unwrap_err();
        match err {
            Error::Driver { driver, .. } => assert_eq!(driver, "Default,Default"),
            other => panic!("expected driver error, got {:?}", other),
        }
    }
}
