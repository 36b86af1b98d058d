//! Restore side of the physical-log driver.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ::log::{debug, warn};

use crate::error::{Error, Result};
use crate::kernel::{DataSlice, DriverReply, RestoreDriver};
use crate::tools::scratch_file_name;

use super::{
    apply_physical_log, reset_open_count, HeaderOnlyRepair, IndexRepair, TableFiles, DRIVER_NAME,
    FILE_CODE_DATA, FILE_CODE_INDEX_HEADER, FILE_CODE_LOG, FILE_CODE_WHOLE_INDEX,
};

/// Writes one stream's bytes sequentially into a file.
struct FileRestore {
    file: File,
}

impl FileRestore {
    fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| Error::io(format!("cannot create {}", path.display()), err))?;
        Ok(Self { file })
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .map_err(|err| Error::io("restore file write", err))
    }
}

/// Receives the dirty copy of one table.
struct TableRestore {
    data: FileRestore,
    index: FileRestore,
    /// Only the index header arrived; the index must be rebuilt.
    rebuild_index: bool,
}

impl TableRestore {
    fn create(files: &TableFiles) -> Result<Self> {
        Ok(Self {
            data: FileRestore::create(&files.data_path())?,
            index: FileRestore::create(&files.index_path())?,
            rebuild_index: false,
        })
    }

    fn send_data(&mut self, chunk: &DataSlice) -> Result<()> {
        let code = chunk.data[0];
        let payload = &chunk.data[1..];
        match code {
            FILE_CODE_DATA => self.data.append(payload),
            FILE_CODE_WHOLE_INDEX => self.index.append(payload),
            FILE_CODE_INDEX_HEADER => {
                self.rebuild_index = true;
                self.index.append(payload)
            }
            other => Err(Error::format(format!(
                "unexpected file code {} in table stream",
                other
            ))),
        }
    }
}

enum ObjectRestore {
    Table(TableRestore),
    Log(FileRestore),
}

/// Restore driver: copies table files and the physical log back, then
/// replays the log and repairs indexes as needed.
pub struct PhyslogRestoreDriver {
    tables: Vec<TableFiles>,
    base_dir: PathBuf,
    scratch_dir: PathBuf,
    repair: Box<dyn IndexRepair>,
    log_path: Option<PathBuf>,
    got_log_data: bool,
    images: Vec<Option<ObjectRestore>>,
}

impl PhyslogRestoreDriver {
    /// `tables` must be ordered by their table number within the
    /// snapshot; all files live under `base_dir`.
    pub fn new(tables: Vec<TableFiles>, base_dir: &Path) -> Self {
        Self {
            tables,
            base_dir: base_dir.to_owned(),
            scratch_dir: std::env::temp_dir(),
            repair: Box::new(HeaderOnlyRepair),
            log_path: None,
            got_log_data: false,
            images: Vec::new(),
        }
    }

    /// Replace the engine repair path (used after header-only index
    /// copies).
    pub fn with_repair(mut self, repair: Box<dyn IndexRepair>) -> Self {
        self.repair = repair;
        self
    }

    /// Place the scratch log somewhere other than the system temp
    /// directory.
    pub fn with_scratch_dir(mut self, dir: &Path) -> Self {
        self.scratch_dir = dir.to_owned();
        self
    }

    fn err(&self, reason: impl Into<String>) -> Error {
        Error::driver(DRIVER_NAME, reason.into())
    }

    fn remove_log(&mut self) {
        if let Some(path) = self.log_path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("cannot remove restore log {}: {}", path.display(), err);
                }
            }
        }
    }

    fn apply_and_repair(&mut self) -> Result<()> {
        // close everything before touching the files again
        let rebuild: Vec<bool> = self
            .images
            .iter()
            .skip(1)
            .map(|image| match image {
                Some(ObjectRestore::Table(t)) => t.rebuild_index,
                _ => false,
            })
            .collect();
        self.images.clear();

        if self.got_log_data {
            let path = self
                .log_path
                .clone()
                .ok_or_else(|| Error::logic("log data without a log file"))?;
            apply_physical_log(&path, &self.base_dir)?;
        }

        for (i, files) in self.tables.iter().enumerate() {
            if rebuild.get(i).copied().unwrap_or(false) {
                debug!("rebuilding index of {}", files.stem());
                self.repair.rebuild(files)?;
            } else {
                // the source table may have been open while it was
                // copied
                reset_open_count(&files.index_path())?;
            }
        }
        Ok(())
    }
}

impl RestoreDriver for PhyslogRestoreDriver {
    fn begin(&mut self, _block_size: usize) -> Result<()> {
        if self.tables.is_empty() {
            return Err(Error::logic("physlog restore driver without tables"));
        }
        self.images = (0..self.tables.len() + 1).map(|_| None).collect();
        self.log_path = Some(
            self.scratch_dir
                .join(scratch_file_name("img", "restorelog")),
        );
        Ok(())
    }

    fn send_data(&mut self, chunk: &DataSlice) -> Result<DriverReply> {
        // trailing cleanup calls after the LAST chunk are fine
        if chunk.data.is_empty() {
            return Ok(DriverReply::Ok);
        }

        let stream = chunk.table_num as usize;
        if stream >= self.images.len() {
            return Err(self.err(format!("chunk for unknown stream {}", stream)));
        }

        if self.images[stream].is_none() {
            let image = if stream >= 1 {
                ObjectRestore::Table(TableRestore::create(&self.tables[stream - 1])?)
            } else {
                let path = self
                    .log_path
                    .as_ref()
                    .ok_or_else(|| Error::logic("restore driver not initialized"))?;
                ObjectRestore::Log(FileRestore::create(path)?)
            };
            self.images[stream] = Some(image);
        }

        match self.images[stream].as_mut().unwrap() {
            ObjectRestore::Table(table) => table.send_data(chunk)?,
            ObjectRestore::Log(log) => {
                if chunk.data[0] != FILE_CODE_LOG {
                    return Err(self.err("log stream carries a non-log block"));
                }
                self.got_log_data = true;
                log.append(&chunk.data[1..])?;
            }
        }
        Ok(DriverReply::Ok)
    }

    fn end(&mut self) -> Result<()> {
        // the scratch log goes away no matter how the replay went
        let result = self.apply_and_repair();
        self.remove_log();
        result
    }

    fn cancel(&mut self) -> Result<()> {
        self.images.clear();
        self.remove_log();
        Ok(())
    }
}

impl Drop for PhyslogRestoreDriver {
    fn drop(&mut self) {
        self.images.clear();
        self.remove_log();
    }
}
