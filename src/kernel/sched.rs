//! Backup-side scheduler.
//!
//! Each driver is wrapped in a [`Pump`] which polls it for data and
//! pushes the data through a per-driver [`BlockWriter`] into the
//! shared output stream. The [`Scheduler`] runs all pumps round-robin
//! on one thread and tracks how many drivers sit in each lifecycle
//! phase; [`write_table_data`] drives the whole data phase including
//! driver admission and the validity point.

use std::collections::VecDeque;

use log::{debug, info};

use crate::catalog::{BinlogPos, Catalog, StreamTime};
use crate::error::{Error, Result};
use crate::stream::{serialize, OutputStream};

use super::{BackupDriver, Buffer, CancelFlag, DriverReply};

/// Lifecycle states of a single backup driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BackupState {
    /// Created, not yet admitted to the scheduler.
    Inactive,
    /// Transferring initial data.
    Init,
    /// Initial transfer done, waiting for the other drivers.
    Waiting,
    /// Preparing for the validity point.
    Preparing,
    /// Ready for `lock()`.
    Ready,
    /// Transferring final data after `unlock()`.
    Finishing,
    /// All data transferred.
    Done,
    /// After `end()`.
    ShutDown,
    /// After `cancel()`.
    Cancelled,
    Error,
}

impl BackupState {
    pub fn name(self) -> &'static str {
        match self {
            BackupState::Inactive => "INACTIVE",
            BackupState::Init => "INIT",
            BackupState::Waiting => "WAITING",
            BackupState::Preparing => "PREPARING",
            BackupState::Ready => "READY",
            BackupState::Finishing => "FINISHING",
            BackupState::Done => "DONE",
            BackupState::ShutDown => "SHUT DOWN",
            BackupState::Cancelled => "CANCELLED",
            BackupState::Error => "ERROR",
        }
    }
}

/// One snapshot's backup work: its number, display name and driver.
pub struct SnapshotJob {
    /// 1-based snapshot number.
    pub snap_num: u16,
    pub name: String,
    pub table_count: u32,
    pub driver: Box<dyn BackupDriver>,
}

/// Writes data blocks of one driver to the stream.
///
/// Holds a single transfer buffer: `get_buf` hands it out, `write_buf`
/// or `drop_buf` return it. An exhausted pool is the backpressure
/// signal.
struct BlockWriter {
    snap_num: u16,
    pool: Option<Buffer>,
}

impl BlockWriter {
    fn new(snap_num: u16, buf_size: usize) -> Self {
        Self { snap_num, pool: Some(Buffer::new(buf_size)) }
    }

    fn get_buf(&mut self) -> Option<Buffer> {
        self.pool.take().map(|mut buf| {
            buf.reset();
            buf
        })
    }

    fn drop_buf(&mut self, buf: Buffer) {
        self.pool = Some(buf);
    }

    fn write_buf(&mut self, out: &mut OutputStream, buf: Buffer) -> Result<()> {
        serialize::write_data_chunk(out, self.snap_num, buf.table_num, buf.last, buf.bytes())?;
        self.pool = Some(buf);
        Ok(())
    }
}

/// How many times a pump retries buffer acquisition before giving up.
const GET_BUF_RETRIES: u32 = 3;

/// How many driver errors on the same buffer are tolerated before the
/// driver counts as failed.
const GET_DATA_RETRIES: u32 = 3;

/// What one polling step produced.
#[derive(Default)]
struct PumpProgress {
    bytes: u64,
    wrote_chunk: bool,
}

/// Polls one backup driver and forwards its data to the stream.
pub(super) struct Pump {
    state: BackupState,
    name: String,
    snap_num: u16,
    init_size: Option<u64>,
    start_pos: u64,
    bytes_in: u64,
    bytes_out: u64,
    drv: Box<dyn BackupDriver>,
    bw: BlockWriter,
    /// Buffer the driver is still filling (`Processing` answers).
    held: Option<Buffer>,
    /// Filled buffer awaiting its stream write.
    pending: Option<Buffer>,
    buf_retries: u32,
    data_err_retries: u32,
    /// Bit per stream of this snapshot (stream 0 is reserved for
    /// driver-internal use, tables use 1..=table_count in drivers that
    /// follow that convention, so table_count + 1 bits).
    closed_streams: Vec<bool>,
}

impl Pump {
    fn new(job: SnapshotJob, block_size: usize) -> Self {
        let init_size = job.driver.init_size();
        Self {
            state: BackupState::Inactive,
            name: job.name,
            snap_num: job.snap_num,
            init_size,
            start_pos: 0,
            bytes_in: 0,
            bytes_out: 0,
            drv: job.driver,
            bw: BlockWriter::new(job.snap_num, block_size),
            held: None,
            pending: None,
            buf_retries: 0,
            data_err_retries: 0,
            closed_streams: vec![false; job.table_count as usize + 1],
        }
    }

    fn driver_err(&mut self, what: &str, err: Error) -> Error {
        self.state = BackupState::Error;
        Error::driver(self.name.clone(), format!("{}: {}", what, err))
    }

    fn begin(&mut self, block_size: usize) -> Result<()> {
        self.state = BackupState::Init;
        debug!("{} driver enters INIT state", self.name);
        self.drv
            .begin(block_size)
            .map_err(|err| self.driver_err("failed to initialize", err))
    }

    fn end(&mut self) -> Result<()> {
        if self.state == BackupState::ShutDown {
            return Ok(());
        }
        debug!(
            "shutting down {} driver ({} bytes in, {} bytes out)",
            self.name, self.bytes_in, self.bytes_out
        );
        self.drv
            .end()
            .map_err(|err| self.driver_err("failed to shut down", err))?;
        self.state = BackupState::ShutDown;
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        let reply = self
            .drv
            .prelock()
            .map_err(|err| self.driver_err("failed to prepare", err))?;
        self.state = match reply {
            DriverReply::Ready => BackupState::Ready,
            _ => BackupState::Preparing,
        };
        debug!(
            "preparing {} driver, goes to {} state",
            self.name,
            self.state.name()
        );
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        debug!("locking {} driver", self.name);
        self.drv
            .lock()
            .map_err(|err| self.driver_err("failed to create validity point", err))
    }

    fn unlock(&mut self) -> Result<()> {
        debug!("unlocking {} driver, goes to FINISHING state", self.name);
        self.state = BackupState::Finishing;
        self.drv
            .unlock()
            .map_err(|err| self.driver_err("failed to unlock", err))
    }

    fn cancel(&mut self) {
        if self.drv.cancel().is_err() {
            // best-effort cleanup
            debug!("{} driver failed to cancel", self.name);
        }
        self.state = BackupState::Cancelled;
    }

    fn mark_stream_closed(&mut self, stream: u32) {
        if let Some(bit) = self.closed_streams.get_mut(stream as usize) {
            *bit = true;
        }
    }

    fn all_streams_closed(&self) -> bool {
        self.closed_streams.iter().all(|closed| *closed)
    }

    fn pos(&self) -> u64 {
        self.start_pos + self.bytes_in
    }

    /// One polling step: ask the driver for data and/or write data
    /// obtained before to the stream.
    fn pump(&mut self, out: &mut OutputStream) -> Result<PumpProgress> {
        match self.state {
            BackupState::Inactive | BackupState::ShutDown | BackupState::Cancelled => {
                return Err(Error::logic(format!(
                    "pumping {} driver in {} state",
                    self.name,
                    self.state.name()
                )));
            }
            BackupState::Error => {
                return Err(Error::driver(self.name.clone(), "driver is in error state"));
            }
            BackupState::Done => return Ok(PumpProgress::default()),
            _ => {}
        }

        let before = self.state;
        let mut progress = PumpProgress::default();

        if self.all_streams_closed() {
            match self.state {
                BackupState::Init => self.state = BackupState::Waiting,
                BackupState::Preparing => self.state = BackupState::Ready,
                BackupState::Finishing => self.state = BackupState::Done,
                _ => {}
            }
        } else {
            if self.pending.is_none() {
                // reading phase
                let mut buf = match self.held.take().or_else(|| self.bw.get_buf()) {
                    Some(buf) => {
                        self.buf_retries = 0;
                        buf
                    }
                    None => {
                        self.buf_retries += 1;
                        if self.buf_retries <= GET_BUF_RETRIES {
                            return Ok(progress); // try again next step
                        }
                        return Err(self.driver_err(
                            "no transfer buffer",
                            Error::OutOfResources("block writer pool exhausted".to_string()),
                        ));
                    }
                };

                let reply = match self.drv.get_data(&mut buf) {
                    Ok(reply) => {
                        self.data_err_retries = 0;
                        reply
                    }
                    Err(err) => {
                        self.bw.drop_buf(buf);
                        self.data_err_retries += 1;
                        if self.data_err_retries <= GET_DATA_RETRIES {
                            // tolerated; the driver gets the same
                            // buffer again on the next poll
                            log::warn!("{} driver error (retrying): {}", self.name, err);
                            return Ok(progress);
                        }
                        return Err(self.driver_err("failed to get data", err));
                    }
                };

                match reply {
                    DriverReply::Ready | DriverReply::Ok => {
                        if reply == DriverReply::Ready {
                            match self.state {
                                BackupState::Init => self.state = BackupState::Waiting,
                                BackupState::Preparing => self.state = BackupState::Ready,
                                _ => {}
                            }
                        }
                        if buf.last {
                            self.mark_stream_closed(buf.table_num);
                            debug!("{} driver closed stream {}", self.name, buf.table_num);
                        }
                        // empty buffers are only written as LAST markers
                        if buf.size() > 0 || buf.last {
                            self.pending = Some(buf);
                        } else {
                            self.bw.drop_buf(buf);
                        }
                    }
                    DriverReply::Processing => {
                        self.held = Some(buf);
                    }
                    DriverReply::Done => {
                        self.state = BackupState::Done;
                        self.bw.drop_buf(buf);
                    }
                    DriverReply::Busy => {
                        self.bw.drop_buf(buf);
                    }
                }
            }

            if self.state != BackupState::Error && self.state != BackupState::Done {
                if let Some(buf) = self.pending.take() {
                    let size = buf.size() as u64;
                    self.bytes_in += size;
                    self.bw
                        .write_buf(out, buf)
                        .map_err(|err| self.driver_err("failed to write data", err))?;
                    self.bytes_out += size;
                    progress.bytes = size;
                    progress.wrote_chunk = true;
                }
            }
        }

        if self.state != before {
            debug!(
                "{} driver changes state {} -> {}",
                self.name,
                before.name(),
                self.state.name()
            );
        }
        Ok(progress)
    }
}

/// Counters of a finished (or aborted) data phase.
#[derive(Clone, Debug, Default)]
pub struct BackupStats {
    pub data_size: u64,
    pub chunk_count: u64,
    /// Bytes per snapshot, indexed by number - 1.
    pub snapshot_bytes: Vec<u64>,
}

/// Collaborator that can hold off commits around the validity point
/// and report the replication log position.
pub trait CommitBlocker {
    fn block_commits(&mut self) -> Result<()>;
    fn unblock_commits(&mut self) -> Result<()>;
    fn binlog_position(&mut self) -> Result<Option<BinlogPos>>;
}

/// No-op blocker for standalone use and tests.
pub struct NullBlocker;

impl CommitBlocker for NullBlocker {
    fn block_commits(&mut self) -> Result<()> {
        Ok(())
    }

    fn unblock_commits(&mut self) -> Result<()> {
        Ok(())
    }

    fn binlog_position(&mut self) -> Result<Option<BinlogPos>> {
        Ok(None)
    }
}

/// Drives several backup pumps in a fair (round-robin) fashion and
/// tracks their lifecycle phases.
pub(super) struct Scheduler<'a> {
    pumps: VecDeque<Pump>,
    out: &'a mut OutputStream,
    pub init_count: usize,
    pub prepare_count: usize,
    pub finish_count: usize,
    total: u64,
    init_left: i64,
    known_count: usize,
    stats: BackupStats,
    cancelled: bool,
}

impl<'a> Scheduler<'a> {
    fn new(out: &'a mut OutputStream, snap_count: u16) -> Self {
        Self {
            pumps: VecDeque::new(),
            out,
            init_count: 0,
            prepare_count: 0,
            finish_count: 0,
            total: 0,
            init_left: 0,
            known_count: 0,
            stats: BackupStats {
                snapshot_bytes: vec![0; snap_count as usize],
                ..BackupStats::default()
            },
            cancelled: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.pumps.is_empty()
    }

    /// Current estimate of initial data left per known-size driver.
    fn init_left(&self) -> u64 {
        if self.known_count > 0 {
            (self.init_left.max(0) as u64) / self.known_count as u64 + 1
        } else {
            0
        }
    }

    /// Admit a pump; it is initialized with `begin()`.
    fn add(&mut self, mut pump: Pump) -> Result<()> {
        let avg = if self.pumps.is_empty() {
            0
        } else {
            self.total / self.pumps.len() as u64 + 1
        };
        pump.start_pos = avg;

        if let Err(err) = pump.begin(self.out.block_size()) {
            self.cancel_backup();
            return Err(err);
        }

        debug!("adding {} driver to scheduler (at pos {})", pump.name, avg);
        self.total += avg;
        if let Some(size) = pump.init_size {
            self.init_left += size as i64;
            self.known_count += 1;
        }
        match pump.state {
            BackupState::Init => self.init_count += 1,
            BackupState::Preparing => self.prepare_count += 1,
            BackupState::Finishing => self.finish_count += 1,
            _ => {}
        }
        self.pumps.push_back(pump);
        debug!(
            "driver counts: total={}, init={}, prepare={}, finish={}",
            self.pumps.len(),
            self.init_count,
            self.prepare_count,
            self.finish_count
        );
        Ok(())
    }

    /// Poll the next pump and update the phase statistics.
    fn step(&mut self) -> Result<()> {
        let mut pump = match self.pumps.pop_front() {
            Some(pump) => pump,
            None => {
                // no active pumps
                self.init_count = 0;
                self.prepare_count = 0;
                self.finish_count = 0;
                return Ok(());
            }
        };

        debug!("polling {} driver (pos {})", pump.name, pump.pos());
        let before = pump.state;
        let progress = match pump.pump(self.out) {
            Ok(progress) => progress,
            Err(err) => {
                // drop the failed pump, abort everything else
                self.cancel_backup();
                return Err(err);
            }
        };

        if progress.bytes > 0 {
            self.total += progress.bytes;
            if before == BackupState::Init && pump.init_size.is_some() {
                self.init_left -= progress.bytes as i64;
            }
        }
        if progress.wrote_chunk {
            self.stats.data_size += progress.bytes;
            self.stats.chunk_count += 1;
            if let Some(slot) = self
                .stats
                .snapshot_bytes
                .get_mut(pump.snap_num as usize - 1)
            {
                *slot += progress.bytes;
            }
        }

        let after = pump.state;
        if after != before {
            match before {
                BackupState::Init => self.init_count = self.init_count.saturating_sub(1),
                BackupState::Preparing => self.prepare_count = self.prepare_count.saturating_sub(1),
                BackupState::Finishing => self.finish_count = self.finish_count.saturating_sub(1),
                _ => {}
            }
            match after {
                BackupState::Init => self.init_count += 1,
                BackupState::Preparing => self.prepare_count += 1,
                BackupState::Finishing => self.finish_count += 1,
                _ => {}
            }
        }

        if after == BackupState::Done {
            if let Err(err) = pump.end() {
                self.cancel_backup();
                return Err(err);
            }
            debug!(
                "driver counts: total={}, init={}, prepare={}, finish={}",
                self.pumps.len(),
                self.init_count,
                self.prepare_count,
                self.finish_count
            );
            return Ok(()); // pump is dropped, not requeued
        }

        self.pumps.push_back(pump);
        Ok(())
    }

    /// Start the prepare phase on every driver.
    fn prepare(&mut self) -> Result<()> {
        debug!("calling prelock() for all drivers");
        for i in 0..self.pumps.len() {
            if let Err(err) = self.pumps[i].prepare() {
                self.cancel_backup();
                return Err(err);
            }
            if self.pumps[i].state == BackupState::Preparing {
                self.prepare_count += 1;
            }
        }
        Ok(())
    }

    /// Create the validity point on every driver.
    fn lock(&mut self) -> Result<()> {
        debug!("calling lock() for all drivers");
        for i in 0..self.pumps.len() {
            if let Err(err) = self.pumps[i].lock() {
                self.cancel_backup();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release the validity point; drivers move to FINISHING.
    fn unlock(&mut self) -> Result<()> {
        debug!("calling unlock() for all drivers");
        for i in 0..self.pumps.len() {
            if let Err(err) = self.pumps[i].unlock() {
                self.cancel_backup();
                return Err(err);
            }
            if self.pumps[i].state == BackupState::Finishing {
                self.finish_count += 1;
            }
        }
        Ok(())
    }

    /// Abort: cancel every remaining driver, ignoring their errors.
    /// Idempotent.
    fn cancel_backup(&mut self) {
        if self.cancelled {
            return;
        }
        while let Some(mut pump) = self.pumps.pop_front() {
            pump.cancel();
        }
        self.init_count = 0;
        self.prepare_count = 0;
        self.finish_count = 0;
        self.cancelled = true;
    }

    fn take_stats(&mut self) -> BackupStats {
        std::mem::take(&mut self.stats)
    }
}

impl Drop for Scheduler<'_> {
    fn drop(&mut self) {
        self.cancel_backup();
    }
}

fn check_cancel(sch: &mut Scheduler, cancel: &CancelFlag) -> Result<()> {
    if cancel.is_cancelled() {
        sch.cancel_backup();
        return Err(Error::cancelled());
    }
    Ok(())
}

/// Save the data of all tables in the catalogue.
///
/// Runs every driver through its lifecycle: admission (largest
/// known-size drivers are held back until the running drivers have
/// little initial data left), initial transfer, prepare, validity
/// point, final transfer. The validity point time and the replication
/// position are recorded in the catalogue header. Always terminates
/// the data section, even when there is nothing to back up.
pub fn write_table_data(
    cat: &mut Catalog,
    jobs: Vec<SnapshotJob>,
    out: &mut OutputStream,
    blocker: &mut dyn CommitBlocker,
    cancel: &CancelFlag,
) -> Result<BackupStats> {
    if cat.snap_count() == 0 || cat.table_count() == 0 {
        serialize::end_data_chunks(out)?;
        return Ok(BackupStats::default());
    }

    let block_size = out.block_size();
    let mut sch = Scheduler::new(&mut *out, cat.snap_count());
    let mut inactive: Vec<Pump> = Vec::new();
    let mut max_init_size: u64 = 0;

    debug!("initializing scheduler");
    for job in jobs {
        let pump = Pump::new(job, block_size);
        match pump.init_size {
            None => sch.add(pump)?,
            Some(size) => {
                if size > max_init_size {
                    max_init_size = size;
                }
                inactive.push(pump);
            }
        }
    }

    debug!(
        "{} drivers initialized, {} inactive",
        sch.pumps.len(),
        inactive.len()
    );

    // initial transfer; inactive drivers are admitted largest-first
    // once the estimate of data left drops below their own size
    debug!("-- INIT PHASE --");
    while sch.init_count > 0 || (sch.is_empty() && max_init_size > 0) {
        check_cancel(&mut sch, cancel)?;

        if max_init_size > 0 && sch.init_left() <= max_init_size {
            let mut largest = 0;
            for (i, pump) in inactive.iter().enumerate() {
                if pump.init_size >= inactive[largest].init_size {
                    largest = i;
                }
            }
            let pump = inactive.swap_remove(largest);
            max_init_size = inactive
                .iter()
                .map(|p| p.init_size.unwrap_or(0))
                .max()
                .unwrap_or(0);
            sch.add(pump)?;
        }

        sch.step()?;
    }

    // admit whatever never made it in (small or zero init size)
    debug!("activating remaining drivers");
    for pump in inactive.drain(..) {
        sch.add(pump)?;
    }
    while sch.init_count > 0 {
        check_cancel(&mut sch, cancel)?;
        sch.step()?;
    }

    debug!("-- PREPARE PHASE --");
    sch.prepare()?;
    while sch.prepare_count > 0 {
        check_cancel(&mut sch, cancel)?;
        sch.step()?;
    }

    // validity point: block commits, record the replication position,
    // lock every driver, take the timestamp, unlock, unblock
    debug!("-- SYNC PHASE --");
    check_cancel(&mut sch, cancel)?;
    blocker.block_commits()?;

    let vp_result = (|| -> Result<(StreamTime, Option<BinlogPos>)> {
        let binlog_pos = blocker.binlog_position()?;
        sch.lock()?;
        let vp_time = StreamTime::now();
        sch.unlock()?;
        Ok((vp_time, binlog_pos))
    })();
    let unblock_result = blocker.unblock_commits();
    let (vp_time, binlog_pos) = match vp_result {
        Ok(vp) => vp,
        Err(err) => {
            sch.cancel_backup();
            return Err(err);
        }
    };
    unblock_result?;

    cat.header.save_vp_time(vp_time);
    info!("validity point created at {}", vp_time);
    if let Some(pos) = binlog_pos {
        info!("replication position at validity point: {}/{}", pos.file, pos.offset);
        cat.header.save_binlog_pos(pos);
    }

    debug!("-- FINISH PHASE --");
    while sch.finish_count > 0 {
        check_cancel(&mut sch, cancel)?;
        sch.step()?;
    }
    debug!("-- DONE --");

    let stats = sch.take_stats();
    drop(sch);
    serialize::end_data_chunks(out)?;
    cat.data_size = stats.data_size;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{SnapshotDescriptor, SnapshotInfo};
    use crate::stream::{InputStream, StreamConfig};

    /// Emits scripted per-table data during the initial phase, then
    /// waits for the validity point and finishes without final data.
    struct MemDriver {
        tables: Vec<Vec<Vec<u8>>>,
        table: usize,
        chunk: usize,
        init_done: bool,
        finishing: bool,
        init_size: Option<u64>,
        cancelled: Arc<AtomicBool>,
        fail_after: Option<usize>,
        transient_failures: u32,
        produced: usize,
    }

    impl MemDriver {
        fn new(tables: Vec<Vec<Vec<u8>>>) -> Self {
            Self {
                tables,
                table: 0,
                chunk: 0,
                init_done: false,
                finishing: false,
                init_size: None,
                cancelled: Arc::new(AtomicBool::new(false)),
                fail_after: None,
                transient_failures: 0,
                produced: 0,
            }
        }
    }

    impl BackupDriver for MemDriver {
        fn init_size(&self) -> Option<u64> {
            self.init_size
        }

        fn begin(&mut self, _block_size: usize) -> Result<()> {
            Ok(())
        }

        fn get_data(&mut self, buf: &mut Buffer) -> Result<DriverReply> {
            if self.transient_failures > 0 {
                self.transient_failures -= 1;
                return Err(Error::format("scripted transient failure"));
            }
            if let Some(limit) = self.fail_after {
                if self.produced >= limit {
                    return Err(Error::format("scripted failure"));
                }
            }
            if self.finishing {
                buf.set_size(0);
                return Ok(DriverReply::Done);
            }
            if self.table < self.tables.len() {
                let chunks = &self.tables[self.table];
                buf.table_num = self.table as u32;
                buf.fill(&chunks[self.chunk]);
                buf.last = self.chunk + 1 == chunks.len();
                self.chunk += 1;
                self.produced += 1;
                if buf.last {
                    self.table += 1;
                    self.chunk = 0;
                }
                return Ok(DriverReply::Ok);
            }
            if !self.init_done {
                self.init_done = true;
                buf.set_size(0);
                return Ok(DriverReply::Ready);
            }
            buf.set_size(0);
            Ok(DriverReply::Processing)
        }

        fn prelock(&mut self) -> Result<DriverReply> {
            Ok(DriverReply::Ready)
        }

        fn lock(&mut self) -> Result<()> {
            Ok(())
        }

        fn unlock(&mut self) -> Result<()> {
            self.finishing = true;
            Ok(())
        }

        fn end(&mut self) -> Result<()> {
            Ok(())
        }

        fn cancel(&mut self) -> Result<()> {
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RecordingBlocker {
        blocked: bool,
        cycles: u32,
    }

    impl CommitBlocker for RecordingBlocker {
        fn block_commits(&mut self) -> Result<()> {
            self.blocked = true;
            Ok(())
        }

        fn unblock_commits(&mut self) -> Result<()> {
            assert!(self.blocked);
            self.blocked = false;
            self.cycles += 1;
            Ok(())
        }

        fn binlog_position(&mut self) -> Result<Option<BinlogPos>> {
            assert!(self.blocked);
            Ok(Some(BinlogPos { file: "repl.000001".to_string(), offset: 1234 }))
        }
    }

    fn two_snapshot_catalog() -> Catalog {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        let mut s1 = SnapshotInfo::new(SnapshotDescriptor::default_blocking(1));
        let mut s2 = SnapshotInfo::new(SnapshotDescriptor::nodata(1));
        cat.add_table(db, b"t1", &mut s1, 0).unwrap();
        cat.add_table(db, b"t2", &mut s1, 1).unwrap();
        cat.add_table(db, b"t3", &mut s2, 0).unwrap();
        cat
    }

    fn open_out(dir: &tempfile::TempDir) -> OutputStream {
        OutputStream::open_write(&dir.path().join("img"), &StreamConfig::default()).unwrap()
    }

    #[test]
    fn empty_catalog_backup_writes_nothing_but_terminates_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = open_out(&dir);
        let mut cat = Catalog::new();
        cat.close();

        let stats = write_table_data(
            &mut cat,
            Vec::new(),
            &mut out,
            &mut NullBlocker,
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(stats.data_size, 0);
        assert_eq!(stats.chunk_count, 0);
        out.close().unwrap();

        let mut inp = InputStream::open_read(&dir.path().join("img")).unwrap();
        assert!(serialize::read_data_chunk(&mut inp).unwrap().is_none());
    }

    #[test]
    fn multiplexes_two_drivers_and_marks_every_stream_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = open_out(&dir);
        let mut cat = two_snapshot_catalog();
        cat.close();

        let d1 = MemDriver::new(vec![
            vec![b"aaaa".to_vec(), b"bb".to_vec()],
            vec![b"cccccc".to_vec()],
        ]);
        let mut d2 = MemDriver::new(vec![vec![b"zzz".to_vec()]]);
        d2.init_size = Some(3);

        let jobs = vec![
            SnapshotJob {
                snap_num: 1,
                name: "Default".to_string(),
                table_count: 2,
                driver: Box::new(d1),
            },
            SnapshotJob {
                snap_num: 2,
                name: "Nodata".to_string(),
                table_count: 1,
                driver: Box::new(d2),
            },
        ];

        let mut blocker = RecordingBlocker { blocked: false, cycles: 0 };
        let stats =
            write_table_data(&mut cat, jobs, &mut out, &mut blocker, &CancelFlag::new()).unwrap();
        out.close().unwrap();

        assert_eq!(blocker.cycles, 1);
        assert_eq!(stats.data_size, 4 + 2 + 6 + 3);
        assert_eq!(stats.snapshot_bytes, vec![12, 3]);
        assert!(!cat.header.vp_time.is_zero());
        assert_eq!(cat.header.binlog_pos.as_ref().unwrap().offset, 1234);
        assert_eq!(cat.data_size, 15);

        // every (snapshot, table) stream carries exactly one LAST chunk
        let mut inp = InputStream::open_read(&dir.path().join("img")).unwrap();
        let mut last_flags = std::collections::BTreeMap::new();
        let mut bytes_by_table = std::collections::BTreeMap::new();
        while let Some(chunk) = serialize::read_data_chunk(&mut inp).unwrap() {
            if chunk.last {
                *last_flags.entry((chunk.snap_num, chunk.table_num)).or_insert(0) += 1;
            }
            bytes_by_table
                .entry((chunk.snap_num, chunk.table_num))
                .or_insert_with(Vec::new)
                .extend_from_slice(&chunk.data);
        }
        assert_eq!(last_flags.len(), 3);
        assert!(last_flags.values().all(|count| *count == 1));
        assert_eq!(bytes_by_table[&(1, 0)], b"aaaabb".to_vec());
        assert_eq!(bytes_by_table[&(1, 1)], b"cccccc".to_vec());
        assert_eq!(bytes_by_table[&(2, 0)], b"zzz".to_vec());
    }

    #[test]
    fn transient_driver_errors_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = open_out(&dir);
        let mut cat = two_snapshot_catalog();
        cat.close();

        let mut flaky = MemDriver::new(vec![vec![b"row".to_vec()], vec![b"row".to_vec()]]);
        flaky.transient_failures = 3; // within the retry limit
        let jobs = vec![SnapshotJob {
            snap_num: 1,
            name: "Default".to_string(),
            table_count: 2,
            driver: Box::new(flaky),
        }];

        let stats = write_table_data(
            &mut cat,
            jobs,
            &mut out,
            &mut NullBlocker,
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(stats.data_size, 6);
        out.close().unwrap();
    }

    #[test]
    fn driver_failure_cancels_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = open_out(&dir);
        let mut cat = two_snapshot_catalog();
        cat.close();

        let mut failing = MemDriver::new(vec![vec![vec![1u8; 10]; 5], vec![vec![2u8; 10]]]);
        failing.fail_after = Some(2);
        let healthy = MemDriver::new(vec![vec![b"x".to_vec()]]);
        let healthy_cancelled = healthy.cancelled.clone();

        let jobs = vec![
            SnapshotJob {
                snap_num: 1,
                name: "Default".to_string(),
                table_count: 2,
                driver: Box::new(failing),
            },
            SnapshotJob {
                snap_num: 2,
                name: "Nodata".to_string(),
                table_count: 1,
                driver: Box::new(healthy),
            },
        ];

        let err = write_table_data(
            &mut cat,
            jobs,
            &mut out,
            &mut NullBlocker,
            &CancelFlag::new(),
        )
        .unwrap_err();
        match err {
            Error::Driver { driver, .. } => assert_eq!(driver, "Default"),
            other => panic!("expected driver error, got {:?}", other),
        }
        assert!(healthy_cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn cancellation_aborts_before_data_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = open_out(&dir);
        let mut cat = two_snapshot_catalog();
        cat.close();

        let driver = MemDriver::new(vec![vec![vec![1u8; 10]; 100], vec![vec![2u8; 10]]]);
        let cancelled = driver.cancelled.clone();
        let jobs = vec![SnapshotJob {
            snap_num: 1,
            name: "Default".to_string(),
            table_count: 2,
            driver: Box::new(driver),
        }];

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err =
            write_table_data(&mut cat, jobs, &mut out, &mut NullBlocker, &cancel).unwrap_err();
        assert!(matches!(err, Error::Concurrency(_)));
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn known_size_drivers_are_admitted_after_unknown_ones() {
        // a driver with a known init size joins late but still
        // completes; its data ends up in the image
        let dir = tempfile::tempdir().unwrap();
        let mut out = open_out(&dir);
        let mut cat = two_snapshot_catalog();
        cat.close();

        let unknown = MemDriver::new(vec![
            vec![vec![b'u'; 100]; 3],
            vec![vec![b'v'; 100]],
        ]);
        let mut known = MemDriver::new(vec![vec![vec![b'k'; 50]; 2]]);
        known.init_size = Some(100);

        let jobs = vec![
            SnapshotJob {
                snap_num: 1,
                name: "Default".to_string(),
                table_count: 2,
                driver: Box::new(unknown),
            },
            SnapshotJob {
                snap_num: 2,
                name: "CS".to_string(),
                table_count: 1,
                driver: Box::new(known),
            },
        ];

        let stats = write_table_data(
            &mut cat,
            jobs,
            &mut out,
            &mut NullBlocker,
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(stats.snapshot_bytes, vec![400, 100]);
        out.close().unwrap();
    }
}
