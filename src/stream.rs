//! The framed image stream.
//!
//! [`OutputStream`]/[`InputStream`] implement the file-level container:
//! the magic prefix, optional gzip compression and the CRC-protected,
//! length-prefixed chunk framing. [`serialize`] builds the logical
//! sections (header, catalogue, metadata, data chunks, summary) on top
//! of the framing.

use std::path::PathBuf;

mod file_formats;
pub use file_formats::*;

mod wire;
pub use wire::*;

mod output;
pub use output::*;

mod input;
pub use input::*;

pub mod serialize;

/// Stream-level configuration.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Write the image through a gzip encoder.
    pub compress: bool,
    /// If set, output paths must live under this prefix.
    pub secure_path: Option<PathBuf>,
    /// Size of the data transfer buffers handed to backup drivers.
    pub block_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            compress: false,
            secure_path: None,
            block_size: DATA_BUFFER_SIZE,
        }
    }
}
