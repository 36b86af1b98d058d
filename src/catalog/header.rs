use chrono::{Datelike, Timelike, Utc};

use crate::stream::HeaderFlags;

use super::SnapshotDescriptor;

/// UTC time broken into calendar fields, as stored on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StreamTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl StreamTime {
    pub fn now() -> Self {
        let t = Utc::now();
        Self {
            year: t.year() as u16,
            month: t.month() as u8,
            day: t.day() as u8,
            hour: t.hour() as u8,
            minute: t.minute() as u8,
            second: t.second() as u8,
        }
    }

    /// All-zero value meaning "not recorded".
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl std::fmt::Display for StreamTime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Replication log coordinates captured at the validity point.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BinlogPos {
    pub file: String,
    pub offset: u32,
}

/// Server version triple plus free-form suffix ("5.1.30-debug").
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ServerVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub suffix: String,
}

impl Default for ServerVersion {
    fn default() -> Self {
        Self { major: 0, minor: 0, patch: 0, suffix: String::new() }
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}{}", self.major, self.minor, self.patch, self.suffix)
    }
}

/// Image header: everything about the image that is not an item.
#[derive(Clone, Debug)]
pub struct ImageHeader {
    pub server_version: ServerVersion,
    pub flags: HeaderFlags,
    pub start_time: StreamTime,
    /// The validity point: the instant at which all snapshots together
    /// form a consistent database image.
    pub vp_time: StreamTime,
    /// Filled from the summary section; not part of the header on the
    /// wire.
    pub end_time: StreamTime,
    pub binlog_pos: Option<BinlogPos>,
    pub snapshots: Vec<SnapshotDescriptor>,
}

impl Default for ImageHeader {
    fn default() -> Self {
        let mut flags = HeaderFlags::empty();
        if cfg!(target_endian = "big") {
            flags |= HeaderFlags::BIG_ENDIAN;
        }
        Self {
            server_version: ServerVersion::default(),
            flags,
            start_time: StreamTime::default(),
            vp_time: StreamTime::default(),
            end_time: StreamTime::default(),
            binlog_pos: None,
            snapshots: Vec::new(),
        }
    }
}

impl ImageHeader {
    pub fn save_start_time(&mut self) {
        self.start_time = StreamTime::now();
    }

    pub fn save_end_time(&mut self) {
        self.end_time = StreamTime::now();
    }

    pub fn save_vp_time(&mut self, time: StreamTime) {
        self.vp_time = time;
    }

    pub fn save_binlog_pos(&mut self, pos: BinlogPos) {
        self.binlog_pos = Some(pos);
        self.flags |= HeaderFlags::BINLOG_POS;
    }
}
