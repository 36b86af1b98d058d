//! Physical-log driver: online backup for engines without native
//! snapshots.
//!
//! Two data paths run side by side. The *copy path* reads each
//! table's data and index file in bounded blocks while no locks are
//! held, so the copy is dirty. The *log path* mirrors every write
//! that completes after logging started into an append-only physical
//! log. At the validity point a helper thread holds read locks on all
//! tables, the log is closed in a consistent state and then streamed
//! as the driver's final data. Restore copies everything back and
//! replays the log; entries are idempotent, so replaying twice is
//! harmless.
//!
//! The ordering that makes the dirty copy safe: a writer first writes
//! the file, then atomically reads the per-table logging flag and
//! appends the log entry if it is set. The backup side sets the flag
//! before it starts copying. A write that misses the flag therefore
//! completed before the copy began (the copy sees it); a write that
//! sees the flag lands in the log.

mod engine;
pub use self::engine::*;

mod log;
pub use self::log::*;

mod backup;
pub use self::backup::*;

mod restore;
pub use self::restore::*;

/// Name used in diagnostics ("... backup driver").
pub const DRIVER_NAME: &str = "Physlog";

/// Driver format version stored in the snapshot descriptor.
pub const DRIVER_VERSION: u16 = 1;

/// First byte of every data block, telling which file it belongs to.
/// Starts at 1 because garbage is often zeros.
pub const FILE_CODE_DATA: u8 = 1;
pub const FILE_CODE_WHOLE_INDEX: u8 = 2;
pub const FILE_CODE_INDEX_HEADER: u8 = 3;
pub const FILE_CODE_LOG: u8 = 4;
