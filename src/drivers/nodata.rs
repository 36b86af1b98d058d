//! Driver pair for engines whose tables store no data.
//!
//! The backup driver emits one empty LAST marker per table so the
//! image records every `(snapshot, table)` stream, then finishes; the
//! restore driver accepts and discards whatever arrives.

use crate::error::Result;
use crate::kernel::{BackupDriver, Buffer, DataSlice, DriverReply, RestoreDriver};

/// Name used in diagnostics.
pub const DRIVER_NAME: &str = "Nodata";

/// Driver format version stored in the snapshot descriptor.
pub const DRIVER_VERSION: u16 = 1;

pub struct NodataBackupDriver {
    table_count: u32,
    next_table: u32,
}

impl NodataBackupDriver {
    pub fn new(table_count: u32) -> Self {
        Self { table_count, next_table: 0 }
    }
}

impl BackupDriver for NodataBackupDriver {
    fn init_size(&self) -> Option<u64> {
        Some(0)
    }

    fn begin(&mut self, _block_size: usize) -> Result<()> {
        Ok(())
    }

    fn get_data(&mut self, buf: &mut Buffer) -> Result<DriverReply> {
        if self.next_table < self.table_count {
            buf.table_num = self.next_table;
            buf.set_size(0);
            buf.last = true;
            self.next_table += 1;
            return Ok(DriverReply::Ok);
        }
        buf.set_size(0);
        buf.last = false;
        Ok(DriverReply::Done)
    }

    fn prelock(&mut self) -> Result<DriverReply> {
        Ok(DriverReply::Ready)
    }

    fn lock(&mut self) -> Result<()> {
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct NodataRestoreDriver;

impl NodataRestoreDriver {
    pub fn new() -> Self {
        Self
    }
}

impl RestoreDriver for NodataRestoreDriver {
    fn begin(&mut self, _block_size: usize) -> Result<()> {
        Ok(())
    }

    fn send_data(&mut self, _chunk: &DataSlice) -> Result<DriverReply> {
        Ok(DriverReply::Ok)
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_one_last_marker_per_table() {
        let mut drv = NodataBackupDriver::new(3);
        drv.begin(1024).unwrap();
        let mut buf = Buffer::new(1024);
        for table in 0..3 {
            buf.reset();
            assert_eq!(drv.get_data(&mut buf).unwrap(), DriverReply::Ok);
            assert_eq!(buf.table_num, table);
            assert_eq!(buf.size(), 0);
            assert!(buf.last);
        }
        buf.reset();
        assert_eq!(drv.get_data(&mut buf).unwrap(), DriverReply::Done);
        drv.end().unwrap();
    }
}
