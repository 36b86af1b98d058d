//! Physical log entries: codec and replay.
//!
//! Entries are self-describing and idempotent. The opcode's high bit
//! selects the big-numbers variant (3-byte file id, 8-byte
//! offsets/lengths) used when the compact fields would overflow;
//! small entries keep the per-write overhead low since many writes
//! are only a few bytes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use ::log::debug;

use crate::error::{Error, Result};

use super::engine::{DATA_EXT, INDEX_EXT};

const OP_OPEN: u8 = 1;
const OP_WRITE_BYTES_DATA: u8 = 2;
const OP_WRITE_BYTES_INDEX: u8 = 3;
const OP_CHSIZE_INDEX: u8 = 4;
const OP_CLOSE: u8 = 5;

/// High bit of the opcode: wide file id and 8-byte numbers.
const BIG_NUMBERS: u8 = 0x80;

const MAX_SMALL_ID: u32 = u16::MAX as u32;
const MAX_SMALL_OFFSET: u64 = u32::MAX as u64;
const MAX_SMALL_LEN: usize = u16::MAX as usize;

/// One record of the physical log.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LogEntry {
    /// Binds a file id to a table (by its file stem).
    Open { file_id: u32, name: Vec<u8> },
    WriteData { file_id: u32, offset: u64, data: Vec<u8> },
    WriteIndex { file_id: u32, offset: u64, data: Vec<u8> },
    /// Truncate or extend the index file.
    ChsizeIndex { file_id: u32, new_len: u64 },
    /// Releases a file id binding.
    Close { file_id: u32 },
}

fn put_u16(w: &mut impl Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_u24(w: &mut impl Write, v: u32) -> io::Result<()> {
    debug_assert!(v < 1 << 24);
    w.write_all(&v.to_le_bytes()[..3])
}

fn get_u16(r: &mut (impl Read + ?Sized)) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn get_u32(r: &mut (impl Read + ?Sized)) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn get_u64(r: &mut (impl Read + ?Sized)) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn get_u24(r: &mut (impl Read + ?Sized)) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf[..3])?;
    Ok(u32::from_le_bytes(buf))
}

fn put_file_id(w: &mut impl Write, file_id: u32, big: bool) -> io::Result<()> {
    if big {
        put_u24(w, file_id)
    } else {
        put_u16(w, file_id as u16)
    }
}

fn get_file_id(r: &mut (impl Read + ?Sized), big: bool) -> io::Result<u32> {
    if big {
        get_u24(r)
    } else {
        get_u16(r).map(u32::from)
    }
}

fn write_bytes_entry(
    w: &mut impl Write,
    opcode: u8,
    file_id: u32,
    offset: u64,
    data: &[u8],
) -> io::Result<()> {
    let big = file_id > MAX_SMALL_ID || offset > MAX_SMALL_OFFSET || data.len() >= MAX_SMALL_LEN;
    if big {
        w.write_all(&[opcode | BIG_NUMBERS])?;
        put_u24(w, file_id)?;
        put_u64(w, offset)?;
        put_u32(w, data.len() as u32)?;
    } else {
        w.write_all(&[opcode])?;
        put_u16(w, file_id as u16)?;
        put_u32(w, offset as u32)?;
        put_u16(w, data.len() as u16)?;
    }
    w.write_all(data)
}

/// Append one entry to a log stream.
pub fn write_entry(w: &mut impl Write, entry: &LogEntry) -> io::Result<()> {
    match entry {
        LogEntry::Open { file_id, name } => {
            let big = *file_id > MAX_SMALL_ID;
            w.write_all(&[if big { OP_OPEN | BIG_NUMBERS } else { OP_OPEN }])?;
            put_file_id(w, *file_id, big)?;
            put_u16(w, name.len() as u16)?;
            w.write_all(name)
        }
        LogEntry::WriteData { file_id, offset, data } => {
            write_bytes_entry(w, OP_WRITE_BYTES_DATA, *file_id, *offset, data)
        }
        LogEntry::WriteIndex { file_id, offset, data } => {
            write_bytes_entry(w, OP_WRITE_BYTES_INDEX, *file_id, *offset, data)
        }
        LogEntry::ChsizeIndex { file_id, new_len } => {
            let big = *file_id > MAX_SMALL_ID || *new_len > MAX_SMALL_OFFSET;
            if big {
                w.write_all(&[OP_CHSIZE_INDEX | BIG_NUMBERS])?;
                put_u24(w, *file_id)?;
                put_u64(w, *new_len)
            } else {
                w.write_all(&[OP_CHSIZE_INDEX])?;
                put_u16(w, *file_id as u16)?;
                put_u32(w, *new_len as u32)
            }
        }
        LogEntry::Close { file_id } => {
            let big = *file_id > MAX_SMALL_ID;
            w.write_all(&[if big { OP_CLOSE | BIG_NUMBERS } else { OP_CLOSE }])?;
            put_file_id(w, *file_id, big)
        }
    }
}

/// Read the next entry; `None` at a clean end of log.
pub fn read_entry(r: &mut impl Read) -> Result<Option<LogEntry>> {
    let mut opcode = [0u8; 1];
    match r.read(&mut opcode) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::Interrupted => return read_entry(r),
        Err(err) => return Err(Error::io("read physical log", err)),
    }
    let big = opcode[0] & BIG_NUMBERS != 0;
    let op = opcode[0] & !BIG_NUMBERS;

    let parse = |r: &mut dyn Read| -> io::Result<LogEntry> {
        Ok(match op {
            OP_OPEN => {
                let file_id = get_file_id(r, big)?;
                let len = get_u16(r)? as usize;
                let mut name = vec![0u8; len];
                r.read_exact(&mut name)?;
                LogEntry::Open { file_id, name }
            }
            OP_WRITE_BYTES_DATA | OP_WRITE_BYTES_INDEX => {
                let file_id = get_file_id(r, big)?;
                let (offset, len) = if big {
                    (get_u64(r)?, get_u32(r)? as usize)
                } else {
                    (get_u32(r)? as u64, get_u16(r)? as usize)
                };
                let mut data = vec![0u8; len];
                r.read_exact(&mut data)?;
                if op == OP_WRITE_BYTES_DATA {
                    LogEntry::WriteData { file_id, offset, data }
                } else {
                    LogEntry::WriteIndex { file_id, offset, data }
                }
            }
            OP_CHSIZE_INDEX => {
                let file_id = get_file_id(r, big)?;
                let new_len = if big { get_u64(r)? } else { get_u32(r)? as u64 };
                LogEntry::ChsizeIndex { file_id, new_len }
            }
            OP_CLOSE => {
                let file_id = get_file_id(r, big)?;
                LogEntry::Close { file_id }
            }
            _ => return Err(io::ErrorKind::InvalidData.into()),
        })
    };
    match parse(r) {
        Ok(entry) => Ok(Some(entry)),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => Err(Error::format(format!(
            "unknown physical log opcode {}",
            opcode[0]
        ))),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            Err(Error::format("physical log ends mid-entry"))
        }
        Err(err) => Err(Error::io("read physical log", err)),
    }
}

/// All entries of a log file; for diagnostics and tests.
pub fn read_all_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let file =
        File::open(path).map_err(|err| Error::io(format!("cannot open {}", path.display()), err))?;
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    while let Some(entry) = read_entry(&mut reader)? {
        entries.push(entry);
    }
    Ok(entries)
}

/// Replay a physical log against the table files under `base_dir`.
///
/// `Open` entries bind file ids to table stems; write entries patch
/// the files in place, resize entries set the index length. Applying
/// a log twice leaves the files unchanged.
pub fn apply_physical_log(log_path: &Path, base_dir: &Path) -> Result<()> {
    let file = File::open(log_path)
        .map_err(|err| Error::io(format!("cannot open {}", log_path.display()), err))?;
    let mut reader = BufReader::new(file);

    let mut files: HashMap<u32, (File, File)> = HashMap::new();
    let mut applied = 0u64;

    while let Some(entry) = read_entry(&mut reader)? {
        match entry {
            LogEntry::Open { file_id, name } => {
                let stem = String::from_utf8_lossy(&name).into_owned();
                let data_path = base_dir.join(format!("{}.{}", stem, DATA_EXT));
                let index_path = base_dir.join(format!("{}.{}", stem, INDEX_EXT));
                let data = OpenOptions::new()
                    .write(true)
                    .open(&data_path)
                    .map_err(|err| {
                        Error::io(format!("cannot open {}", data_path.display()), err)
                    })?;
                let index = OpenOptions::new()
                    .write(true)
                    .open(&index_path)
                    .map_err(|err| {
                        Error::io(format!("cannot open {}", index_path.display()), err)
                    })?;
                files.insert(file_id, (data, index));
            }
            LogEntry::WriteData { file_id, offset, data } => {
                let (data_file, _) = files
                    .get(&file_id)
                    .ok_or_else(|| Error::format("log entry for unbound file id"))?;
                data_file
                    .write_all_at(&data, offset)
                    .map_err(|err| Error::io("replay data write", err))?;
                applied += 1;
            }
            LogEntry::WriteIndex { file_id, offset, data } => {
                let (_, index_file) = files
                    .get(&file_id)
                    .ok_or_else(|| Error::format("log entry for unbound file id"))?;
                index_file
                    .write_all_at(&data, offset)
                    .map_err(|err| Error::io("replay index write", err))?;
                applied += 1;
            }
            LogEntry::ChsizeIndex { file_id, new_len } => {
                let (_, index_file) = files
                    .get(&file_id)
                    .ok_or_else(|| Error::format("log entry for unbound file id"))?;
                index_file
                    .set_len(new_len)
                    .map_err(|err| Error::io("replay index resize", err))?;
                applied += 1;
            }
            LogEntry::Close { file_id } => {
                files.remove(&file_id);
            }
        }
    }
    debug!(
        "applied {} physical log entries from {}",
        applied,
        log_path.display()
    );
    Ok(())
}
