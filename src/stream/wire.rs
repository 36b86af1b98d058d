//! Little-endian primitives for the image wire format.

use std::io::{self, Read, Write};

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u16<R: Read>(r: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Object names: u16 length prefix, raw bytes. Names are not
/// NUL-terminated, any byte value round-trips.
pub fn write_name<W: Write>(w: &mut W, name: &[u8]) -> io::Result<()> {
    debug_assert!(name.len() <= u16::MAX as usize);
    write_u16(w, name.len() as u16)?;
    w.write_all(name)
}

pub fn read_name<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Metadata blobs: u32 length prefix, raw bytes.
pub fn write_blob<W: Write>(w: &mut W, blob: &[u8]) -> io::Result<()> {
    write_u32(w, blob.len() as u32)?;
    w.write_all(blob)
}

pub fn read_blob<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ints_roundtrip() {
        let mut buf = Vec::new();
        write_u8(&mut buf, 0xab).unwrap();
        write_u16(&mut buf, 0xbeef).unwrap();
        write_u32(&mut buf, 0xdead_beef).unwrap();
        write_u64(&mut buf, 0x0123_4567_89ab_cdef).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(read_u8(&mut r).unwrap(), 0xab);
        assert_eq!(read_u16(&mut r).unwrap(), 0xbeef);
        assert_eq!(read_u32(&mut r).unwrap(), 0xdead_beef);
        assert_eq!(read_u64(&mut r).unwrap(), 0x0123_4567_89ab_cdef);
        assert!(r.is_empty());
    }

    #[test]
    fn names_preserve_every_byte() {
        let name: Vec<u8> = (1..=255u8).collect();
        let mut buf = Vec::new();
        write_name(&mut buf, &name).unwrap();
        assert_eq!(read_name(&mut buf.as_slice()).unwrap(), name);
    }

    #[test]
    fn empty_blob_roundtrips() {
        let mut buf = Vec::new();
        write_blob(&mut buf, &[]).unwrap();
        assert_eq!(read_blob(&mut buf.as_slice()).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn short_name_is_eof() {
        let mut buf = Vec::new();
        write_u16(&mut buf, 10).unwrap();
        buf.extend_from_slice(b"abc");
        assert!(read_name(&mut buf.as_slice()).is_err());
    }
}
