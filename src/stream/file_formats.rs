use bitflags::bitflags;

/// Magic bytes at the start of every (uncompressed) backup image.
pub const IMAGE_MAGIC_1_0: [u8; 8] = [0xe0, 0xf8, 0x7f, 0x7e, 0x7e, 0x5f, 0x0f, 0x03];

/// Image format version written after the magic bytes (u16 LE).
///
/// Readers accept any version up to their own and reject newer ones.
pub const IMAGE_FORMAT_VERSION: u16 = 1;

/// First three bytes of a gzip container; detected on the raw file.
pub const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// Default size of the data transfer buffers between kernel and drivers.
pub const DATA_BUFFER_SIZE: usize = 1024 * 1024;

/// Write buffering for the image file.
pub const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// I/O staging buffer used on the compressed path.
pub const ZBUF_SIZE: usize = 64 * 1024;

/// Upper bound on a single framed chunk, as a corruption guard.
pub const MAX_CHUNK_SIZE: usize = 128 * 1024 * 1024;

/// Largest number of snapshots an image can hold: the snapshot number
/// is a single byte in every data chunk.
pub const MAX_SNAPSHOTS: usize = 256;

bitflags! {
    /// Flag bitmap stored in the image header.
    pub struct HeaderFlags: u32 {
        /// Image was written on a big-endian server.
        const BIG_ENDIAN = 0b0000_0001;
        /// The summary section directly follows the header section
        /// instead of ending the stream.
        const INLINE_SUMMARY = 0b0000_0010;
        /// The header carries a replication log position.
        const BINLOG_POS = 0b0000_0100;
    }
}

/// Flag bits of a table data chunk.
pub const CHUNK_FLAG_LAST: u8 = 0x01;
