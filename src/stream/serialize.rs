//! Section-level serializer for backup images.
//!
//! Seven logical sections sit on top of the chunk framing, each closed
//! by a chunk-list terminator: header, catalogue, metadata, data
//! chunks and summary. The summary normally ends the stream; with
//! [`HeaderFlags::INLINE_SUMMARY`] it directly follows the header
//! section instead.

use std::io::Read;

use log::warn;

use crate::catalog::{
    BinlogPos, Catalog, EngineInfo, ImageHeader, ItemMeta, ItemRef, ItemType, ServerVersion,
    SnapshotDescriptor, SnapshotKind, StreamTime,
};
use crate::error::{Error, Result};

use super::{
    read_blob, read_name, read_u16, read_u32, read_u64, read_u8, write_blob, write_name,
    write_u16, write_u32, write_u64, write_u8, HeaderFlags, InputStream, NextChunk, OutputStream,
    CHUNK_FLAG_LAST, MAX_SNAPSHOTS,
};

/// Summary section: end-of-operation counters.
///
/// The validity point and the replication position are only known
/// after the preamble has already been written, so the summary is
/// their authoritative record; readers merge them back into the
/// header.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Summary {
    pub end_time: StreamTime,
    pub vp_time: StreamTime,
    pub binlog_pos: Option<BinlogPos>,
    /// Total bytes of table data in the image.
    pub data_size: u64,
    /// Number of table data chunks.
    pub chunk_count: u64,
    /// Bytes of table data per snapshot, indexed by number - 1.
    pub snapshot_bytes: Vec<u64>,
}

/// One table data chunk as read off the stream.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DataChunk {
    /// 1-based snapshot number.
    pub snap_num: u16,
    pub table_num: u32,
    pub last: bool,
    pub data: Vec<u8>,
}

fn wire_err(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::unexpected_eos()
    } else {
        Error::io("decode image section", err)
    }
}

// --- time ------------------------------------------------------------

fn write_time(buf: &mut Vec<u8>, t: &StreamTime) {
    write_u16(buf, t.year).unwrap();
    buf.extend_from_slice(&[t.month, t.day, t.hour, t.minute, t.second]);
}

fn read_time<R: Read>(r: &mut R) -> Result<StreamTime> {
    let year = read_u16(r).map_err(wire_err)?;
    let mut rest = [0u8; 5];
    r.read_exact(&mut rest).map_err(wire_err)?;
    Ok(StreamTime {
        year,
        month: rest[0],
        day: rest[1],
        hour: rest[2],
        minute: rest[3],
        second: rest[4],
    })
}

// --- single-chunk sections -------------------------------------------

fn write_section(out: &mut OutputStream, payload: &[u8]) -> Result<()> {
    out.write_chunk(payload)?;
    out.end_chunk_list()
}

fn read_section(inp: &mut InputStream, what: &str) -> Result<Vec<u8>> {
    match inp.next_chunk()? {
        NextChunk::Chunk => {}
        NextChunk::EndOfChunkList | NextChunk::EndOfStream => {
            return Err(Error::format(format!("missing {} section", what)));
        }
    }
    let payload = inp.chunk().to_vec();
    match inp.next_chunk()? {
        NextChunk::EndOfChunkList => Ok(payload),
        NextChunk::Chunk => Err(Error::format(format!(
            "unexpected extra chunk in {} section",
            what
        ))),
        NextChunk::EndOfStream => Err(Error::unexpected_eos()),
    }
}

// --- header ----------------------------------------------------------

/// Write the header section from the catalogue's header and snapshot
/// slots.
pub fn write_header(out: &mut OutputStream, cat: &Catalog) -> Result<()> {
    let hdr = &cat.header;
    if cat.snap_count() as usize > MAX_SNAPSHOTS {
        return Err(Error::format("too many snapshots in image"));
    }

    let mut buf = Vec::with_capacity(256);
    write_u8(&mut buf, hdr.server_version.major).unwrap();
    write_u8(&mut buf, hdr.server_version.minor).unwrap();
    write_u8(&mut buf, hdr.server_version.patch).unwrap();
    write_name(&mut buf, hdr.server_version.suffix.as_bytes()).unwrap();
    write_u32(&mut buf, hdr.flags.bits()).unwrap();
    write_time(&mut buf, &hdr.start_time);
    write_time(&mut buf, &hdr.vp_time);
    if hdr.flags.contains(HeaderFlags::BINLOG_POS) {
        let pos = hdr
            .binlog_pos
            .as_ref()
            .ok_or_else(|| Error::logic("binlog flag set without a position"))?;
        write_name(&mut buf, pos.file.as_bytes()).unwrap();
        write_u32(&mut buf, pos.offset).unwrap();
    }

    write_u16(&mut buf, cat.snap_count()).unwrap();
    for snap in cat.snapshots() {
        let descr = &snap.descr;
        write_u8(&mut buf, descr.kind.type_tag()).unwrap();
        write_u16(&mut buf, descr.version).unwrap();
        write_u32(&mut buf, snap.table_count()).unwrap();
        if descr.kind == SnapshotKind::Native {
            let engine = descr
                .engine
                .as_ref()
                .ok_or_else(|| Error::logic("native snapshot without engine info"))?;
            write_name(&mut buf, engine.name.as_bytes()).unwrap();
            write_u8(&mut buf, engine.major).unwrap();
            write_u8(&mut buf, engine.minor).unwrap();
        }
    }

    write_section(out, &buf)
}

/// Read the header section.
pub fn read_header(inp: &mut InputStream) -> Result<ImageHeader> {
    let payload = read_section(inp, "header")?;
    let r = &mut payload.as_slice();

    let major = read_u8(r).map_err(wire_err)?;
    let minor = read_u8(r).map_err(wire_err)?;
    let patch = read_u8(r).map_err(wire_err)?;
    let suffix = String::from_utf8_lossy(&read_name(r).map_err(wire_err)?).into_owned();
    let flags = HeaderFlags::from_bits_truncate(read_u32(r).map_err(wire_err)?);
    let start_time = read_time(r)?;
    let vp_time = read_time(r)?;
    let binlog_pos = if flags.contains(HeaderFlags::BINLOG_POS) {
        let file = String::from_utf8_lossy(&read_name(r).map_err(wire_err)?).into_owned();
        let offset = read_u32(r).map_err(wire_err)?;
        Some(BinlogPos { file, offset })
    } else {
        None
    };

    let snap_count = read_u16(r).map_err(wire_err)? as usize;
    if snap_count > MAX_SNAPSHOTS {
        return Err(Error::format(format!(
            "image claims {} snapshots (at most {})",
            snap_count, MAX_SNAPSHOTS
        )));
    }
    let mut snapshots = Vec::with_capacity(snap_count);
    for _ in 0..snap_count {
        let tag = read_u8(r).map_err(wire_err)?;
        let kind = SnapshotKind::from_tag(tag)
            .ok_or_else(|| Error::format(format!("unknown snapshot type {}", tag)))?;
        let version = read_u16(r).map_err(wire_err)?;
        let table_count = read_u32(r).map_err(wire_err)?;
        let engine = if kind == SnapshotKind::Native {
            let name = String::from_utf8_lossy(&read_name(r).map_err(wire_err)?).into_owned();
            let e_major = read_u8(r).map_err(wire_err)?;
            let e_minor = read_u8(r).map_err(wire_err)?;
            Some(EngineInfo { name, major: e_major, minor: e_minor })
        } else {
            None
        };
        snapshots.push(SnapshotDescriptor { kind, version, table_count, engine });
    }

    Ok(ImageHeader {
        server_version: ServerVersion { major, minor, patch, suffix },
        flags,
        start_time,
        vp_time,
        end_time: StreamTime::default(),
        binlog_pos,
        snapshots,
    })
}

// --- catalogue -------------------------------------------------------

/// Write the catalogue section.
///
/// Container order is fixed: charsets (reserved, empty), tablespaces,
/// users (reserved, empty), databases; per database its tables in
/// insertion order, then its other objects; finally the per-table
/// items.
pub fn write_catalogue(out: &mut OutputStream, cat: &Catalog) -> Result<()> {
    let mut buf = Vec::with_capacity(1024);

    // reserved containers, always empty
    write_u16(&mut buf, 0).unwrap(); // charsets
    write_u16(&mut buf, 0).unwrap(); // users

    write_u16(&mut buf, cat.ts_count()).unwrap();
    for ts in cat.tablespaces() {
        write_name(&mut buf, &ts.name).unwrap();
    }

    write_u16(&mut buf, cat.db_count()).unwrap();
    for db in cat.dbs() {
        write_name(&mut buf, &db.name).unwrap();
    }

    let mut trigger_total = 0u32;
    for db in cat.dbs() {
        write_u32(&mut buf, db.table_count()).unwrap();
        for (snap_num, pos) in db.table_coords() {
            let table = cat
                .get_table(snap_num, pos)
                .ok_or_else(|| Error::logic("dangling table coordinate"))?;
            write_name(&mut buf, &table.name).unwrap();
            write_u8(&mut buf, (snap_num - 1) as u8).unwrap();
            write_u32(&mut buf, pos).unwrap();
        }

        write_u32(&mut buf, db.object_count()).unwrap();
        for obj in db.objects() {
            write_u8(&mut buf, obj.typ.type_tag()).unwrap();
            write_name(&mut buf, &obj.name).unwrap();
            if obj.typ == ItemType::Privilege {
                write_u32(&mut buf, obj.unique_id).unwrap();
            }
        }
        trigger_total += db.trigger_count();
    }

    write_u32(&mut buf, trigger_total).unwrap();
    for (db_pos, db) in cat.dbs().enumerate() {
        for trg in db.triggers() {
            write_u16(&mut buf, db_pos as u16).unwrap();
            write_u32(&mut buf, trg.table_pos).unwrap();
            write_u32(&mut buf, trg.pos).unwrap();
            write_name(&mut buf, &trg.name).unwrap();
        }
    }

    write_section(out, &buf)
}

/// Read the catalogue section into a catalogue created from the
/// header ([`Catalog::from_header`]).
pub fn read_catalogue(inp: &mut InputStream, cat: &mut Catalog) -> Result<()> {
    crate::fault_point!("read_catalogue");

    let payload = read_section(inp, "catalogue")?;
    let r = &mut payload.as_slice();

    // reserved containers: tolerate entries, ignore them
    for _ in 0..read_u16(r).map_err(wire_err)? {
        read_name(r).map_err(wire_err)?;
    }
    for _ in 0..read_u16(r).map_err(wire_err)? {
        read_name(r).map_err(wire_err)?;
    }

    let ts_count = read_u16(r).map_err(wire_err)?;
    for pos in 0..ts_count {
        let name = read_name(r).map_err(wire_err)?;
        cat.add_tablespace(&name, pos)?;
    }

    let db_count = read_u16(r).map_err(wire_err)?;
    for pos in 0..db_count {
        let name = read_name(r).map_err(wire_err)?;
        cat.add_database(&name, pos)?;
    }

    // tables arrive in emission order; snapshot positions are explicit
    let mut tables = Vec::new();
    for db in 0..db_count {
        let table_count = read_u32(r).map_err(wire_err)?;
        for _ in 0..table_count {
            let name = read_name(r).map_err(wire_err)?;
            let snap_num = read_u8(r).map_err(wire_err)? as u16 + 1;
            let pos = read_u32(r).map_err(wire_err)?;
            if cat.get_snapshot(snap_num).is_none() {
                return Err(Error::format(format!(
                    "table {} references unknown snapshot {}",
                    crate::catalog::display_name(&name),
                    snap_num
                )));
            }
            tables.push((db, name, snap_num, pos));
        }

        let obj_count = read_u32(r).map_err(wire_err)?;
        for pos in 0..obj_count {
            let tag = read_u8(r).map_err(wire_err)?;
            let typ = ItemType::from_tag(tag)
                .ok_or_else(|| Error::format(format!("unknown item type {}", tag)))?;
            let name = read_name(r).map_err(wire_err)?;
            if typ == ItemType::Privilege {
                let unique_id = read_u32(r).map_err(wire_err)?;
                cat.add_privilege(db, &name, unique_id, pos)?;
            } else {
                cat.add_db_object(db, typ, &name, pos)?;
            }
        }
    }
    cat.load_tables(tables)?;

    let trigger_total = read_u32(r).map_err(wire_err)?;
    for _ in 0..trigger_total {
        let db = read_u16(r).map_err(wire_err)?;
        let table_pos = read_u32(r).map_err(wire_err)?;
        let pos = read_u32(r).map_err(wire_err)?;
        let name = read_name(r).map_err(wire_err)?;
        cat.add_trigger(db, table_pos, &name, pos)
            .map_err(|_| Error::format("trigger references unknown table"))?;
    }

    // the header's table counts must agree with the catalogue, and a
    // snapshot with no tables has no business being in an image
    for (idx, snap) in cat.snapshots().enumerate() {
        if snap.table_count() == 0 {
            return Err(Error::format(format!(
                "snapshot {} has no tables",
                idx + 1
            )));
        }
        if snap.descr.table_count != snap.table_count() {
            return Err(Error::format(format!(
                "snapshot table count mismatch ({} in header, {} in catalogue)",
                snap.descr.table_count,
                snap.table_count()
            )));
        }
    }

    Ok(())
}

// --- metadata --------------------------------------------------------

fn write_item_ref(buf: &mut Vec<u8>, typ: ItemType, item: &ItemRef) {
    write_u8(buf, typ.type_tag()).unwrap();
    match *item {
        ItemRef::Tablespace { pos } | ItemRef::Database { pos } => {
            write_u16(buf, pos).unwrap();
        }
        ItemRef::Table { snap_num, pos } => {
            write_u8(buf, (snap_num - 1) as u8).unwrap();
            write_u32(buf, pos).unwrap();
        }
        ItemRef::DbObject { db, pos } => {
            write_u16(buf, db).unwrap();
            write_u32(buf, pos).unwrap();
        }
        ItemRef::TableObject { db, table_pos, pos } => {
            write_u16(buf, db).unwrap();
            write_u32(buf, table_pos).unwrap();
            write_u32(buf, pos).unwrap();
        }
    }
}

fn read_item_ref<R: Read>(r: &mut R, typ: ItemType) -> Result<ItemRef> {
    Ok(match typ {
        ItemType::Tablespace => ItemRef::Tablespace { pos: read_u16(r).map_err(wire_err)? },
        ItemType::Database => ItemRef::Database { pos: read_u16(r).map_err(wire_err)? },
        ItemType::Table => {
            let snap_num = read_u8(r).map_err(wire_err)? as u16 + 1;
            let pos = read_u32(r).map_err(wire_err)?;
            ItemRef::Table { snap_num, pos }
        }
        ItemType::View
        | ItemType::StoredProc
        | ItemType::StoredFunc
        | ItemType::Event
        | ItemType::Privilege => {
            let db = read_u16(r).map_err(wire_err)?;
            let pos = read_u32(r).map_err(wire_err)?;
            ItemRef::DbObject { db, pos }
        }
        ItemType::Trigger => {
            let db = read_u16(r).map_err(wire_err)?;
            let table_pos = read_u32(r).map_err(wire_err)?;
            let pos = read_u32(r).map_err(wire_err)?;
            ItemRef::TableObject { db, table_pos, pos }
        }
        ItemType::Charset | ItemType::User => {
            return Err(Error::format("metadata for reserved item type"));
        }
    })
}

/// Write the metadata section: one chunk per item with metadata, in
/// image order.
pub fn write_meta_data(out: &mut OutputStream, cat: &Catalog) -> Result<()> {
    for (item_ref, item) in cat.image_order() {
        let meta = match item.meta() {
            Some(meta) => meta,
            None => continue,
        };
        let mut buf = Vec::with_capacity(64 + meta.create_stmt.len() + meta.extra.len());
        write_item_ref(&mut buf, item.item_type(), &item_ref);
        write_blob(&mut buf, &meta.create_stmt).unwrap();
        write_blob(&mut buf, &meta.extra).unwrap();
        out.write_chunk(&buf)?;
    }
    out.end_chunk_list()
}

/// Read the metadata section, attaching blobs to catalogue items.
///
/// Entries with an unknown type tag are skipped with a warning so
/// partial readers stay usable; entries pointing at items the
/// catalogue does not contain are a format error.
pub fn read_meta_data(inp: &mut InputStream, cat: &mut Catalog) -> Result<()> {
    loop {
        match inp.next_chunk()? {
            NextChunk::Chunk => {}
            NextChunk::EndOfChunkList => return Ok(()),
            NextChunk::EndOfStream => return Err(Error::unexpected_eos()),
        }
        let payload = inp.chunk().to_vec();
        let r = &mut payload.as_slice();

        let tag = read_u8(r).map_err(wire_err)?;
        let typ = match ItemType::from_tag(tag) {
            Some(typ) => typ,
            None => {
                warn!("skipping metadata for unsupported item type {}", tag);
                continue;
            }
        };
        let item_ref = read_item_ref(r, typ)?;
        let create_stmt = read_blob(r).map_err(wire_err)?;
        let extra = read_blob(r).map_err(wire_err)?;
        cat.set_meta(item_ref, ItemMeta { create_stmt, extra })?;
    }
}

/// Write the whole preamble: header, catalogue and metadata.
pub fn write_preamble(out: &mut OutputStream, cat: &Catalog) -> Result<()> {
    write_header(out, cat)?;
    write_catalogue(out, cat)?;
    write_meta_data(out, cat)
}

// --- data chunks -----------------------------------------------------

/// Append one table data chunk.
///
/// An empty payload is only legal as a LAST marker.
pub fn write_data_chunk(
    out: &mut OutputStream,
    snap_num: u16,
    table_num: u32,
    last: bool,
    payload: &[u8],
) -> Result<()> {
    if snap_num == 0 || snap_num as usize > MAX_SNAPSHOTS {
        return Err(Error::logic(format!("invalid snapshot number {}", snap_num)));
    }
    if payload.is_empty() && !last {
        return Err(Error::logic("empty data chunk without LAST flag"));
    }

    let mut head = Vec::with_capacity(6);
    write_u8(&mut head, (snap_num - 1) as u8).unwrap();
    write_u32(&mut head, table_num).unwrap();
    write_u8(&mut head, if last { CHUNK_FLAG_LAST } else { 0 }).unwrap();
    out.write_chunk_parts(&[&head, payload])
}

/// Close the data section.
pub fn end_data_chunks(out: &mut OutputStream) -> Result<()> {
    out.end_chunk_list()
}

/// Read the next table data chunk; `None` once the data section (or
/// the stream) ends.
pub fn read_data_chunk(inp: &mut InputStream) -> Result<Option<DataChunk>> {
    match inp.next_chunk()? {
        NextChunk::Chunk => {}
        NextChunk::EndOfChunkList | NextChunk::EndOfStream => return Ok(None),
    }
    let payload = inp.chunk();
    let r = &mut &payload[..];

    let snap_num = read_u8(r).map_err(wire_err)? as u16 + 1;
    let table_num = read_u32(r).map_err(wire_err)?;
    let flags = read_u8(r).map_err(wire_err)?;
    let last = flags & CHUNK_FLAG_LAST != 0;
    let data = r.to_vec();
    if data.is_empty() && !last {
        return Err(Error::format("zero-length data chunk without LAST flag"));
    }
    Ok(Some(DataChunk { snap_num, table_num, last, data }))
}

// --- summary ---------------------------------------------------------

/// Write the summary section.
pub fn write_summary(out: &mut OutputStream, summary: &Summary) -> Result<()> {
    let mut buf = Vec::with_capacity(64 + summary.snapshot_bytes.len() * 8);
    write_time(&mut buf, &summary.end_time);
    write_time(&mut buf, &summary.vp_time);
    match &summary.binlog_pos {
        Some(pos) => {
            write_u8(&mut buf, 1).unwrap();
            write_name(&mut buf, pos.file.as_bytes()).unwrap();
            write_u32(&mut buf, pos.offset).unwrap();
        }
        None => write_u8(&mut buf, 0).unwrap(),
    }
    write_u64(&mut buf, summary.data_size).unwrap();
    write_u64(&mut buf, summary.chunk_count).unwrap();
    write_u16(&mut buf, summary.snapshot_bytes.len() as u16).unwrap();
    for bytes in &summary.snapshot_bytes {
        write_u64(&mut buf, *bytes).unwrap();
    }
    write_section(out, &buf)
}

/// Read the summary section.
pub fn read_summary(inp: &mut InputStream) -> Result<Summary> {
    let payload = read_section(inp, "summary")?;
    let r = &mut payload.as_slice();

    let end_time = read_time(r)?;
    let vp_time = read_time(r)?;
    let binlog_pos = match read_u8(r).map_err(wire_err)? {
        0 => None,
        1 => {
            let file = String::from_utf8_lossy(&read_name(r).map_err(wire_err)?).into_owned();
            let offset = read_u32(r).map_err(wire_err)?;
            Some(BinlogPos { file, offset })
        }
        other => {
            return Err(Error::format(format!(
                "bad binlog marker {} in summary",
                other
            )));
        }
    };
    let data_size = read_u64(r).map_err(wire_err)?;
    let chunk_count = read_u64(r).map_err(wire_err)?;
    let snap_count = read_u16(r).map_err(wire_err)? as usize;
    if snap_count > MAX_SNAPSHOTS {
        return Err(Error::format("summary snapshot count out of range"));
    }
    let mut snapshot_bytes = Vec::with_capacity(snap_count);
    for _ in 0..snap_count {
        snapshot_bytes.push(read_u64(r).map_err(wire_err)?);
    }
    Ok(Summary {
        end_time,
        vp_time,
        binlog_pos,
        data_size,
        chunk_count,
        snapshot_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::super::StreamConfig;
    use super::*;
    use crate::catalog::{ItemMeta, SnapshotInfo};

    fn temp(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    fn sample_catalog() -> Catalog {
        let mut cat = Catalog::new();
        cat.header.server_version =
            ServerVersion { major: 6, minor: 0, patch: 7, suffix: "-alpha".to_string() };
        cat.add_tablespace(b"ts1", 0).unwrap();
        let d0 = cat.add_database(b"sales", 0).unwrap();
        let d1 = cat.add_database(b"hr", 1).unwrap();
        let mut s1 = SnapshotInfo::new(SnapshotDescriptor::native(
            EngineInfo { name: "treestore".to_string(), major: 1, minor: 4 },
            2,
        ));
        let mut s2 = SnapshotInfo::new(SnapshotDescriptor::default_blocking(1));

        // interleave positions across databases
        cat.add_table(d0, b"orders", &mut s1, 0).unwrap();
        let people = cat.add_table(d1, b"people", &mut s1, 1).unwrap();
        cat.add_table(d0, b"items", &mut s2, 0).unwrap();
        cat.add_db_object(d0, ItemType::View, b"v_orders", 0).unwrap();
        cat.add_privilege(d0, b"grant7", 7, 1).unwrap();
        cat.add_trigger(d0, 0, b"trg_audit", 0).unwrap();

        cat.set_meta(
            ItemRef::Database { pos: d0 },
            ItemMeta { create_stmt: b"CREATE DATABASE sales".to_vec(), extra: vec![] },
        )
        .unwrap();
        cat.set_meta(
            people,
            ItemMeta { create_stmt: b"CREATE TABLE people (x INT)".to_vec(), extra: vec![1, 2] },
        )
        .unwrap();
        cat.close();
        cat
    }

    fn assert_catalogs_equal(a: &Catalog, b: &Catalog) {
        assert_eq!(a.ts_count(), b.ts_count());
        assert_eq!(a.db_count(), b.db_count());
        assert_eq!(a.snap_count(), b.snap_count());
        assert_eq!(a.table_count(), b.table_count());
        let order_a = a.image_order();
        let order_b = b.image_order();
        assert_eq!(order_a.len(), order_b.len());
        for ((ref_a, item_a), (ref_b, item_b)) in order_a.iter().zip(order_b.iter()) {
            assert_eq!(ref_a, ref_b);
            assert_eq!(item_a.item_type(), item_b.item_type());
            assert_eq!(item_a.name(), item_b.name());
            assert_eq!(item_a.meta(), item_b.meta());
        }
        for (sa, sb) in a.snapshots().zip(b.snapshots()) {
            assert_eq!(sa.descr, sb.descr);
        }
    }

    #[test]
    fn preamble_roundtrip_preserves_the_catalogue() {
        let (_dir, path) = temp("preamble.img");
        let cat = sample_catalog();

        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        write_preamble(&mut out, &cat).unwrap();
        out.close().unwrap();

        let mut inp = InputStream::open_read(&path).unwrap();
        let header = read_header(&mut inp).unwrap();
        assert_eq!(header.server_version, cat.header.server_version);
        assert_eq!(header.snapshots.len(), 2);
        assert_eq!(header.snapshots[0].engine.as_ref().unwrap().name, "treestore");

        let mut read_back = Catalog::from_header(header);
        read_catalogue(&mut inp, &mut read_back).unwrap();
        read_meta_data(&mut inp, &mut read_back).unwrap();
        read_back.close();

        assert_catalogs_equal(&cat, &read_back);
    }

    #[test]
    fn data_chunks_roundtrip_and_interleave() {
        let (_dir, path) = temp("data.img");
        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        write_data_chunk(&mut out, 1, 0, false, b"aaa").unwrap();
        write_data_chunk(&mut out, 2, 0, false, b"bbb").unwrap();
        write_data_chunk(&mut out, 1, 0, true, b"a2").unwrap();
        write_data_chunk(&mut out, 2, 0, true, &[]).unwrap();
        end_data_chunks(&mut out).unwrap();
        out.close().unwrap();

        let mut inp = InputStream::open_read(&path).unwrap();
        // no preamble in this stream: consume frames directly
        let c1 = read_data_chunk(&mut inp).unwrap().unwrap();
        assert_eq!((c1.snap_num, c1.last, c1.data.as_slice()), (1, false, &b"aaa"[..]));
        let c2 = read_data_chunk(&mut inp).unwrap().unwrap();
        assert_eq!(c2.snap_num, 2);
        let c3 = read_data_chunk(&mut inp).unwrap().unwrap();
        assert!(c3.last);
        let c4 = read_data_chunk(&mut inp).unwrap().unwrap();
        assert!(c4.last && c4.data.is_empty());
        assert!(read_data_chunk(&mut inp).unwrap().is_none());
    }

    #[test]
    fn empty_chunk_needs_last_flag() {
        let (_dir, path) = temp("empty.img");
        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        assert!(matches!(
            write_data_chunk(&mut out, 1, 0, false, &[]),
            Err(Error::Logic(_))
        ));
        out.close().unwrap();
    }

    #[test]
    fn summary_roundtrips() {
        let (_dir, path) = temp("summary.img");
        let summary = Summary {
            end_time: StreamTime::now(),
            vp_time: StreamTime::now(),
            binlog_pos: Some(BinlogPos { file: "repl.000042".to_string(), offset: 99 }),
            data_size: 123_456,
            chunk_count: 42,
            snapshot_bytes: vec![100_000, 23_456],
        };
        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        write_summary(&mut out, &summary).unwrap();
        out.close().unwrap();

        let mut inp = InputStream::open_read(&path).unwrap();
        assert_eq!(read_summary(&mut inp).unwrap(), summary);
    }

    #[test]
    fn header_carries_binlog_position() {
        let (_dir, path) = temp("binlog.img");
        let mut cat = Catalog::new();
        cat.header.save_binlog_pos(BinlogPos { file: "repl.000007".to_string(), offset: 4711 });
        cat.close();

        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        write_header(&mut out, &cat).unwrap();
        out.close().unwrap();

        let mut inp = InputStream::open_read(&path).unwrap();
        let header = read_header(&mut inp).unwrap();
        assert_eq!(
            header.binlog_pos,
            Some(BinlogPos { file: "repl.000007".to_string(), offset: 4711 })
        );
    }

    #[test]
    fn table_names_with_all_byte_values_roundtrip() {
        let (_dir, path) = temp("names.img");
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        let mut snap = SnapshotInfo::new(SnapshotDescriptor::default_blocking(1));
        let name: Vec<u8> = (1..=255u8).collect();
        cat.add_table(db, &name, &mut snap, 0).unwrap();
        cat.close();

        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        write_preamble(&mut out, &cat).unwrap();
        out.close().unwrap();

        let mut inp = InputStream::open_read(&path).unwrap();
        let header = read_header(&mut inp).unwrap();
        let mut read_back = Catalog::from_header(header);
        read_catalogue(&mut inp, &mut read_back).unwrap();
        assert_eq!(read_back.get_table(1, 0).unwrap().name, name);
    }

    #[test]
    fn metadata_for_unknown_coordinates_is_a_format_error() {
        let (_dir, path) = temp("badmeta.img");
        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        let mut buf = Vec::new();
        write_item_ref(&mut buf, ItemType::Database, &ItemRef::Database { pos: 9 });
        write_blob(&mut buf, b"x").unwrap();
        write_blob(&mut buf, b"").unwrap();
        out.write_chunk(&buf).unwrap();
        out.end_chunk_list().unwrap();
        out.close().unwrap();

        let mut inp = InputStream::open_read(&path).unwrap();
        let mut cat = Catalog::new();
        assert!(matches!(
            read_meta_data(&mut inp, &mut cat),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn unknown_metadata_type_is_skipped() {
        let (_dir, path) = temp("unknown.img");
        let mut out = OutputStream::open_write(&path, &StreamConfig::default()).unwrap();
        out.write_chunk(&[0xee, 1, 2, 3]).unwrap();
        out.end_chunk_list().unwrap();
        out.close().unwrap();

        let mut inp = InputStream::open_read(&path).unwrap();
        let mut cat = Catalog::new();
        read_meta_data(&mut inp, &mut cat).unwrap();
    }
}
