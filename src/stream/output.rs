use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

use super::{
    write_u32, StreamConfig, IMAGE_FORMAT_VERSION, IMAGE_MAGIC_1_0, MAX_CHUNK_SIZE,
    WRITE_BUFFER_SIZE,
};

enum Sink {
    Plain(BufWriter<std::fs::File>),
    Compressed(GzEncoder<BufWriter<std::fs::File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Compressed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Compressed(w) => w.flush(),
        }
    }
}

/// Append-only framed image writer.
///
/// The caller sees the stream as a sequence of chunks grouped into
/// chunk lists; [`write_chunk`](OutputStream::write_chunk) appends one
/// chunk, [`end_chunk_list`](OutputStream::end_chunk_list) closes the
/// current list. Compression, when enabled, is transparent: the frame
/// layout describes the logical (uncompressed) stream.
pub struct OutputStream {
    sink: Option<Sink>,
    path: PathBuf,
    block_size: usize,
    bytes: u64,
}

impl OutputStream {
    /// Create the output file and write the image prefix.
    ///
    /// Fails with a policy error when a secure path prefix is
    /// configured and `path` is not under it. The file must not exist
    /// yet (named pipes are the concern of the caller).
    pub fn open_write(path: &Path, config: &StreamConfig) -> Result<Self> {
        if let Some(prefix) = &config.secure_path {
            if !path.starts_with(prefix) {
                return Err(Error::Policy(format!(
                    "{} is outside the secure backup directory {}",
                    path.display(),
                    prefix.display()
                )));
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| Error::io(format!("cannot create {}", path.display()), err))?;
        let writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let sink = if config.compress {
            Sink::Compressed(GzEncoder::new(writer, Compression::default()))
        } else {
            Sink::Plain(writer)
        };

        let mut stream = Self {
            sink: Some(sink),
            path: path.to_owned(),
            block_size: config.block_size,
            bytes: 0,
        };
        stream.write_magic_and_version()?;
        Ok(stream)
    }

    fn write_magic_and_version(&mut self) -> Result<()> {
        let mut prefix = [0u8; 10];
        prefix[..8].copy_from_slice(&IMAGE_MAGIC_1_0);
        prefix[8..].copy_from_slice(&IMAGE_FORMAT_VERSION.to_le_bytes());
        self.write_all(&prefix)
    }

    fn sink(&mut self) -> &mut Sink {
        // sink is only None after close()
        self.sink.as_mut().expect("stream already closed")
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let path = self.path.clone();
        self.sink()
            .write_all(data)
            .map_err(|err| Error::io(format!("write to {}", path.display()), err))?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Append one chunk built from several payload slices.
    pub fn write_chunk_parts(&mut self, parts: &[&[u8]]) -> Result<()> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len == 0 {
            return Err(Error::logic("refusing to write an empty chunk frame"));
        }
        if len > MAX_CHUNK_SIZE {
            return Err(Error::format(format!("chunk too large ({} bytes)", len)));
        }

        let mut hasher = crc32fast::Hasher::new();
        for part in parts {
            hasher.update(part);
        }

        let mut head = Vec::with_capacity(8);
        write_u32(&mut head, len as u32).unwrap();
        write_u32(&mut head, hasher.finalize()).unwrap();
        self.write_all(&head)?;
        for part in parts {
            self.write_all(part)?;
        }
        Ok(())
    }

    /// Append one chunk.
    pub fn write_chunk(&mut self, payload: &[u8]) -> Result<()> {
        self.write_chunk_parts(&[payload])
    }

    /// Close the current chunk list.
    pub fn end_chunk_list(&mut self) -> Result<()> {
        self.write_all(&0u32.to_le_bytes())
    }

    /// Logical bytes written so far (before compression).
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finalize compression and flush everything to disk.
    pub fn close(mut self) -> Result<u64> {
        let path = self.path.clone();
        match self.sink.take() {
            Some(Sink::Plain(mut w)) => w
                .flush()
                .map_err(|err| Error::io(format!("flush {}", path.display()), err))?,
            Some(Sink::Compressed(gz)) => {
                let mut w = gz
                    .finish()
                    .map_err(|err| Error::Compression(format!("finalize gzip: {}", err)))?;
                w.flush()
                    .map_err(|err| Error::io(format!("flush {}", path.display()), err))?;
            }
            None => {}
        }
        Ok(self.bytes)
    }
}
