use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use crate::error::{Error, Result};

use super::{IMAGE_FORMAT_VERSION, IMAGE_MAGIC_1_0, GZIP_MAGIC, MAX_CHUNK_SIZE, ZBUF_SIZE};

enum Source {
    Plain(BufReader<File>),
    Compressed(BufReader<MultiGzDecoder<BufReader<File>>>),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Source::Plain(r) => r.read(buf),
            Source::Compressed(r) => r.read(buf),
        }
    }
}

/// Result of advancing the framed reader.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NextChunk {
    /// A chunk was read; its payload is available via
    /// [`InputStream::chunk`].
    Chunk,
    /// The current chunk list ended.
    EndOfChunkList,
    /// Physical end of the stream.
    EndOfStream,
}

/// Positioned framed image reader with transparent gzip detection.
pub struct InputStream {
    src: Source,
    compressed: bool,
    path: PathBuf,
    chunk: Vec<u8>,
    bytes: u64,
    version: u16,
}

impl InputStream {
    /// Open an image, sniff the gzip container and check the prefix.
    pub fn open_read(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|err| Error::io(format!("cannot open {}", path.display()), err))?;

        let mut probe = [0u8; 3];
        if file.read_exact(&mut probe).is_err() {
            // too short to even hold the prefix
            return Err(Error::BadMagic);
        }
        file.seek(SeekFrom::Start(0))
            .map_err(|err| Error::io(format!("seek {}", path.display()), err))?;

        let compressed = probe == GZIP_MAGIC;
        let src = if compressed {
            let inner = BufReader::with_capacity(ZBUF_SIZE, file);
            Source::Compressed(BufReader::with_capacity(ZBUF_SIZE, MultiGzDecoder::new(inner)))
        } else {
            Source::Plain(BufReader::with_capacity(ZBUF_SIZE, file))
        };

        let mut stream = Self {
            src,
            compressed,
            path: path.to_owned(),
            chunk: Vec::new(),
            bytes: 0,
            version: 0,
        };
        stream.check_magic_and_version()?;
        Ok(stream)
    }

    fn check_magic_and_version(&mut self) -> Result<()> {
        let mut prefix = [0u8; 10];
        if self.read_exact(&mut prefix).is_err() {
            return Err(Error::BadMagic);
        }
        if prefix[..8] != IMAGE_MAGIC_1_0 {
            return Err(Error::BadMagic);
        }
        let version = u16::from_le_bytes([prefix[8], prefix[9]]);
        if version == 0 || version > IMAGE_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        self.version = version;
        Ok(())
    }

    fn map_read_err(&self, err: std::io::Error) -> Error {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::unexpected_eos(),
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData
                if self.compressed =>
            {
                Error::Compression(err.to_string())
            }
            _ => Error::io(format!("read from {}", self.path.display()), err),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.src.read_exact(buf) {
            Ok(()) => {
                self.bytes += buf.len() as u64;
                Ok(())
            }
            Err(err) => Err(self.map_read_err(err)),
        }
    }

    /// Read the length word of the next frame. `None` at a clean end
    /// of stream.
    fn read_len_word(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            match self.src.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(Error::unexpected_eos()),
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.map_read_err(err)),
            }
        }
        self.bytes += 4;
        Ok(Some(u32::from_le_bytes(buf)))
    }

    /// Advance past the current chunk boundary to the next one.
    pub fn next_chunk(&mut self) -> Result<NextChunk> {
        let len = match self.read_len_word()? {
            None => return Ok(NextChunk::EndOfStream),
            Some(0) => return Ok(NextChunk::EndOfChunkList),
            Some(len) => len as usize,
        };
        if len > MAX_CHUNK_SIZE {
            return Err(Error::format(format!("chunk too large ({} bytes)", len)));
        }

        let mut crc_buf = [0u8; 4];
        self.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_le_bytes(crc_buf);

        self.chunk.resize(len, 0);
        let mut chunk = std::mem::take(&mut self.chunk);
        let res = self.read_exact(&mut chunk);
        self.chunk = chunk;
        res?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.chunk);
        if hasher.finalize() != expected_crc {
            return Err(Error::format("chunk checksum mismatch"));
        }
        Ok(NextChunk::Chunk)
    }

    /// Payload of the chunk read by the last [`next_chunk`] call.
    ///
    /// [`next_chunk`]: InputStream::next_chunk
    pub fn chunk(&self) -> &[u8] {
        &self.chunk
    }

    /// Logical bytes consumed so far (after decompression).
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    pub fn format_version(&self) -> u16 {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::super::{OutputStream, StreamConfig};
    use super::*;

    fn temp_image(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    fn write_image(path: &Path, compress: bool, chunks: &[&[u8]]) {
        let config = StreamConfig { compress, ..StreamConfig::default() };
        let mut out = OutputStream::open_write(path, &config).unwrap();
        for chunk in chunks {
            out.write_chunk(chunk).unwrap();
        }
        out.end_chunk_list().unwrap();
        out.close().unwrap();
    }

    #[test]
    fn chunk_roundtrip_is_byte_exact() {
        let (_dir, path) = temp_image("plain.img");
        let payloads: Vec<Vec<u8>> = vec![
            vec![0u8; 1],
            (0..=255u8).collect(),
            vec![0xa5; 100_000],
        ];
        let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
        write_image(&path, false, &refs);

        let mut inp = InputStream::open_read(&path).unwrap();
        for payload in &payloads {
            assert_eq!(inp.next_chunk().unwrap(), NextChunk::Chunk);
            assert_eq!(inp.chunk(), payload.as_slice());
        }
        assert_eq!(inp.next_chunk().unwrap(), NextChunk::EndOfChunkList);
        assert_eq!(inp.next_chunk().unwrap(), NextChunk::EndOfStream);
    }

    #[test]
    fn compressed_image_reads_identically() {
        let (_d1, plain) = temp_image("a.img");
        let (_d2, packed) = temp_image("b.img");
        let payloads: Vec<Vec<u8>> = (0..20).map(|i| vec![i as u8; 3000]).collect();
        let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
        write_image(&plain, false, &refs);
        write_image(&packed, true, &refs);

        // compressed file starts with the gzip magic, not ours
        let raw = std::fs::read(&packed).unwrap();
        assert_eq!(&raw[..3], &GZIP_MAGIC);

        let mut a = InputStream::open_read(&plain).unwrap();
        let mut b = InputStream::open_read(&packed).unwrap();
        loop {
            let ra = a.next_chunk().unwrap();
            let rb = b.next_chunk().unwrap();
            assert_eq!(ra, rb);
            if ra != NextChunk::Chunk {
                break;
            }
            assert_eq!(a.chunk(), b.chunk());
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (_dir, path) = temp_image("bad.img");
        std::fs::write(&path, [0u8, 0, 0, 0, 0, 0, 0, 0, 1, 0]).unwrap();
        match InputStream::open_read(&path) {
            Err(Error::BadMagic) => {}
            other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn newer_version_is_rejected() {
        let (_dir, path) = temp_image("new.img");
        let mut data = IMAGE_MAGIC_1_0.to_vec();
        data.extend_from_slice(&[0xff, 0x00]);
        std::fs::write(&path, data).unwrap();
        match InputStream::open_read(&path) {
            Err(Error::UnsupportedVersion(0xff)) => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn short_file_is_bad_magic() {
        let (_dir, path) = temp_image("short.img");
        std::fs::write(&path, [0xe0, 0xf8]).unwrap();
        assert!(matches!(InputStream::open_read(&path), Err(Error::BadMagic)));
    }

    #[test]
    fn corrupt_chunk_crc_is_detected() {
        let (_dir, path) = temp_image("crc.img");
        write_image(&path, false, &[&[1, 2, 3, 4, 5]]);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x40;
        std::fs::write(&path, raw).unwrap();

        let mut inp = InputStream::open_read(&path).unwrap();
        match inp.next_chunk() {
            Err(Error::Format(msg)) => assert!(msg.contains("checksum")),
            other => panic!("expected checksum error, got {:?}", other),
        }
    }

    #[test]
    fn truncated_gzip_mid_chunk_fails() {
        let (_dir, path) = temp_image("trunc.img");
        write_image(&path, true, &[&vec![7u8; 200_000]]);
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() / 2]).unwrap();

        let mut inp = InputStream::open_read(&path).unwrap();
        let mut result = Ok(NextChunk::Chunk);
        for _ in 0..3 {
            result = inp.next_chunk();
            if result.is_err() || matches!(result, Ok(NextChunk::EndOfStream)) {
                break;
            }
        }
        match result {
            Err(Error::Format(_)) | Err(Error::Compression(_)) => {}
            other => panic!("expected end-of-stream error, got {:?}", other),
        }
    }

    #[test]
    fn secure_path_policy_rejects_outside_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = StreamConfig {
            secure_path: Some(dir.path().join("allowed")),
            ..StreamConfig::default()
        };
        let outside = dir.path().join("elsewhere").join("x.img");
        match OutputStream::open_write(&outside, &config) {
            Err(Error::Policy(_)) => {}
            other => panic!("expected Policy error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_frame_write_is_a_logic_error() {
        let (_dir, path) = temp_image("empty.img");
        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        assert!(matches!(out.write_chunk(&[]), Err(Error::Logic(_))));
        // stream still usable afterwards
        out.write_chunk(&[1]).unwrap();
        out.end_chunk_list().unwrap();
        out.close().unwrap();
    }
}
