use crate::error::{Error, Result};
use crate::stream::MAX_SNAPSHOTS;

use super::{
    display_name, ImageHeader, ItemMeta, ItemRef, ItemType, Snapshot, SnapshotDescriptor,
    SnapshotInfo,
};

/// A tablespace item.
#[derive(Debug)]
pub struct Tablespace {
    pub name: Vec<u8>,
    pub meta: Option<ItemMeta>,
}

/// A table item. Owned by its snapshot slot; its database keeps a
/// coordinate reference.
#[derive(Debug)]
pub struct Table {
    pub name: Vec<u8>,
    /// Position of the owning database.
    pub db: u16,
    /// 1-based number of the owning snapshot.
    pub snap_num: u16,
    /// Position within the snapshot.
    pub pos: u32,
    pub meta: Option<ItemMeta>,
}

/// A per-database object other than a table or trigger.
#[derive(Debug)]
pub struct DbObject {
    pub typ: ItemType,
    pub name: Vec<u8>,
    /// Distinguishes same-named privileges; zero for other types.
    /// Kept separate so the name itself is never mangled.
    pub unique_id: u32,
    pub meta: Option<ItemMeta>,
}

/// A per-table object.
#[derive(Debug)]
pub struct Trigger {
    pub name: Vec<u8>,
    /// Position of the owning table within its database (insertion
    /// order).
    pub table_pos: u32,
    /// Position among the triggers of that table.
    pub pos: u32,
    pub meta: Option<ItemMeta>,
}

/// A database item with its per-database containers.
#[derive(Debug)]
pub struct Database {
    pub name: Vec<u8>,
    pub meta: Option<ItemMeta>,
    /// `(snap_num, pos)` coordinates of the tables, in insertion order.
    tables: Vec<(u16, u32)>,
    objects: Vec<DbObject>,
    triggers: Vec<Trigger>,
}

impl Database {
    fn new(name: &[u8]) -> Self {
        Self {
            name: name.to_vec(),
            meta: None,
            tables: Vec::new(),
            objects: Vec::new(),
            triggers: Vec::new(),
        }
    }

    pub fn table_count(&self) -> u32 {
        self.tables.len() as u32
    }

    pub fn object_count(&self) -> u32 {
        self.objects.len() as u32
    }

    pub fn trigger_count(&self) -> u32 {
        self.triggers.len() as u32
    }

    /// Table coordinates in insertion order.
    pub fn table_coords(&self) -> impl Iterator<Item = (u16, u32)> + '_ {
        self.tables.iter().copied()
    }

    pub fn objects(&self) -> impl Iterator<Item = &DbObject> {
        self.objects.iter()
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter()
    }

    pub fn get_object(&self, pos: u32) -> Option<&DbObject> {
        self.objects.get(pos as usize)
    }

    pub fn get_trigger(&self, table_pos: u32, pos: u32) -> Option<&Trigger> {
        self.triggers
            .iter()
            .find(|t| t.table_pos == table_pos && t.pos == pos)
    }
}

/// Borrowed view of any catalogue item.
#[derive(Clone, Copy, Debug)]
pub enum CatalogItem<'a> {
    Tablespace(&'a Tablespace),
    Database(&'a Database),
    Table(&'a Table),
    DbObject(&'a DbObject),
    Trigger(&'a Trigger),
}

impl<'a> CatalogItem<'a> {
    pub fn name(&self) -> &'a [u8] {
        match self {
            CatalogItem::Tablespace(i) => &i.name,
            CatalogItem::Database(i) => &i.name,
            CatalogItem::Table(i) => &i.name,
            CatalogItem::DbObject(i) => &i.name,
            CatalogItem::Trigger(i) => &i.name,
        }
    }

    pub fn item_type(&self) -> ItemType {
        match self {
            CatalogItem::Tablespace(_) => ItemType::Tablespace,
            CatalogItem::Database(_) => ItemType::Database,
            CatalogItem::Table(_) => ItemType::Table,
            CatalogItem::DbObject(i) => i.typ,
            CatalogItem::Trigger(_) => ItemType::Trigger,
        }
    }

    pub fn meta(&self) -> Option<&'a ItemMeta> {
        match self {
            CatalogItem::Tablespace(i) => i.meta.as_ref(),
            CatalogItem::Database(i) => i.meta.as_ref(),
            CatalogItem::Table(i) => i.meta.as_ref(),
            CatalogItem::DbObject(i) => i.meta.as_ref(),
            CatalogItem::Trigger(i) => i.meta.as_ref(),
        }
    }
}

/// Catalogue of one backup image.
///
/// Populated either by the caller before a backup or by the stream
/// reader during restore; immutable once [`close`](Catalog::close) has
/// been called.
#[derive(Debug)]
pub struct Catalog {
    pub header: ImageHeader,
    /// Bytes of table data carried by the image; filled while data
    /// chunks are written or read.
    pub data_size: u64,
    tablespaces: Vec<Tablespace>,
    databases: Vec<Database>,
    snapshots: Vec<Snapshot>,
    table_count: u32,
    closed: bool,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            header: ImageHeader::default(),
            data_size: 0,
            tablespaces: Vec::new(),
            databases: Vec::new(),
            snapshots: Vec::new(),
            table_count: 0,
            closed: false,
        }
    }

    /// Build a catalogue from a header read off a stream. Snapshot
    /// slots are created for the header's descriptors; the item
    /// containers are filled by the catalogue section reader.
    pub fn from_header(header: ImageHeader) -> Self {
        let snapshots = header.snapshots.iter().cloned().map(Snapshot::new).collect();
        Self {
            header,
            data_size: 0,
            tablespaces: Vec::new(),
            databases: Vec::new(),
            snapshots,
            table_count: 0,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::logic("catalogue is closed"));
        }
        Ok(())
    }

    /// Mark the catalogue complete: descriptors are synced with their
    /// slots and further insertions are rejected.
    pub fn close(&mut self) {
        // snapshots only join the image together with their first
        // table, so no slot can be empty here
        debug_assert!(self.snapshots.iter().all(|snap| !snap.tables.is_empty()));
        for snap in &mut self.snapshots {
            snap.descr.table_count = snap.tables.len() as u32;
        }
        self.header.snapshots = self.snapshots.iter().map(|s| s.descr.clone()).collect();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // --- counts -------------------------------------------------------

    pub fn db_count(&self) -> u16 {
        self.databases.len() as u16
    }

    pub fn ts_count(&self) -> u16 {
        self.tablespaces.len() as u16
    }

    pub fn snap_count(&self) -> u16 {
        self.snapshots.len() as u16
    }

    pub fn table_count(&self) -> u32 {
        self.table_count
    }

    // --- population ---------------------------------------------------

    /// Register a snapshot; returns its 1-based number. Only called
    /// from [`add_table`](Catalog::add_table) when a snapshot receives
    /// its first table, so every registered snapshot holds at least
    /// one table.
    fn add_snapshot(&mut self, descr: SnapshotDescriptor) -> Result<u16> {
        self.ensure_open()?;
        if self.snapshots.len() >= MAX_SNAPSHOTS {
            return Err(Error::format(format!(
                "too many snapshots in image (at most {})",
                MAX_SNAPSHOTS
            )));
        }
        self.snapshots.push(Snapshot::new(descr));
        Ok(self.snapshots.len() as u16)
    }

    pub fn add_database(&mut self, name: &[u8], pos: u16) -> Result<u16> {
        self.ensure_open()?;
        if pos as usize != self.databases.len() {
            return Err(Error::logic(format!(
                "database {} added at position {} (expected {})",
                display_name(name),
                pos,
                self.databases.len()
            )));
        }
        self.databases.push(Database::new(name));
        Ok(pos)
    }

    pub fn add_tablespace(&mut self, name: &[u8], pos: u16) -> Result<u16> {
        self.ensure_open()?;
        if pos as usize != self.tablespaces.len() {
            return Err(Error::logic(format!(
                "tablespace {} added at position {} (expected {})",
                display_name(name),
                pos,
                self.tablespaces.len()
            )));
        }
        self.tablespaces.push(Tablespace { name: name.to_vec(), meta: None });
        Ok(pos)
    }

    /// Record a table in both its database and its snapshot.
    ///
    /// A snapshot joins the image with its first table: when `snap`
    /// has no number yet, one is assigned here. All validation runs
    /// before anything is inserted, so a failing sub-step leaves the
    /// catalogue (and an unnumbered `snap`) untouched.
    pub fn add_table(
        &mut self,
        db: u16,
        name: &[u8],
        snap: &mut SnapshotInfo,
        pos: u32,
    ) -> Result<ItemRef> {
        self.ensure_open()?;
        if db as usize >= self.databases.len() {
            return Err(Error::logic(format!("no database at position {}", db)));
        }

        // positions stay dense; a snapshot without a number holds no
        // tables yet
        let expected = match snap.num {
            Some(num) => match self.get_snapshot(num) {
                Some(slot) => slot.tables.len(),
                None => {
                    return Err(Error::logic(format!(
                        "snapshot handle #{} does not belong to this catalogue",
                        num
                    )));
                }
            },
            None => 0,
        };
        if pos as usize != expected {
            return Err(Error::logic(format!(
                "table {} added at position {} of {} snapshot (expected {})",
                display_name(name),
                pos,
                snap.descr.name(),
                expected
            )));
        }

        let snap_num = match snap.num {
            Some(num) => num,
            None => {
                let num = self.add_snapshot(snap.descr.clone())?;
                snap.num = Some(num);
                num
            }
        };

        let slot = self
            .snapshots
            .get_mut(snap_num as usize - 1)
            .ok_or_else(|| Error::logic(format!("no snapshot number {}", snap_num)))?;
        slot.tables.push(Table {
            name: name.to_vec(),
            db,
            snap_num,
            pos,
            meta: None,
        });
        self.databases[db as usize].tables.push((snap_num, pos));
        self.table_count += 1;
        Ok(ItemRef::Table { snap_num, pos })
    }

    /// Bulk-load tables parsed off a stream: `(db, name, snap_num,
    /// pos)` entries in emission (database-major) order, with explicit
    /// snapshot positions that may interleave across databases.
    /// Positions of every snapshot must form a dense 0-based sequence.
    pub(crate) fn load_tables(&mut self, entries: Vec<(u16, Vec<u8>, u16, u32)>) -> Result<()> {
        self.ensure_open()?;
        if self.table_count != 0 {
            return Err(Error::logic("bulk table load into a populated catalogue"));
        }

        let mut slots: Vec<Vec<Option<Table>>> =
            self.snapshots.iter().map(|_| Vec::new()).collect();
        for (db, name, snap_num, pos) in entries {
            if db as usize >= self.databases.len() {
                return Err(Error::format("table references unknown database"));
            }
            let slot = match (snap_num as usize)
                .checked_sub(1)
                .and_then(|n| slots.get_mut(n))
            {
                Some(slot) => slot,
                None => return Err(Error::format("table references unknown snapshot")),
            };
            if pos as usize >= slot.len() {
                slot.resize_with(pos as usize + 1, || None);
            }
            if slot[pos as usize].is_some() {
                return Err(Error::format(format!(
                    "duplicate table at position {} of snapshot {}",
                    pos, snap_num
                )));
            }
            slot[pos as usize] = Some(Table { name, db, snap_num, pos, meta: None });
            self.databases[db as usize].tables.push((snap_num, pos));
            self.table_count += 1;
        }

        for (idx, slot) in slots.into_iter().enumerate() {
            let mut tables = Vec::with_capacity(slot.len());
            for (pos, table) in slot.into_iter().enumerate() {
                match table {
                    Some(table) => tables.push(table),
                    None => {
                        return Err(Error::format(format!(
                            "gap at position {} of snapshot {}",
                            pos,
                            idx + 1
                        )));
                    }
                }
            }
            self.snapshots[idx].tables = tables;
        }
        Ok(())
    }

    /// Add a non-table, non-trigger object to a database.
    pub fn add_db_object(&mut self, db: u16, typ: ItemType, name: &[u8], pos: u32) -> Result<()> {
        self.add_db_object_full(db, typ, name, 0, pos)
    }

    /// Add a privilege; `unique_id` distinguishes same-named grants.
    pub fn add_privilege(&mut self, db: u16, name: &[u8], unique_id: u32, pos: u32) -> Result<()> {
        self.add_db_object_full(db, ItemType::Privilege, name, unique_id, pos)
    }

    fn add_db_object_full(
        &mut self,
        db: u16,
        typ: ItemType,
        name: &[u8],
        unique_id: u32,
        pos: u32,
    ) -> Result<()> {
        self.ensure_open()?;
        if !typ.is_per_db() {
            return Err(Error::logic(format!(
                "{} is not a per-database object type",
                typ.describe()
            )));
        }
        let db = self
            .databases
            .get_mut(db as usize)
            .ok_or_else(|| Error::logic(format!("no database at position {}", db)))?;
        if pos as usize != db.objects.len() {
            return Err(Error::logic(format!(
                "object {} added at position {} (expected {})",
                display_name(name),
                pos,
                db.objects.len()
            )));
        }
        db.objects.push(DbObject { typ, name: name.to_vec(), unique_id, meta: None });
        Ok(())
    }

    /// Add a trigger to the table at `table_pos` of database `db`.
    pub fn add_trigger(&mut self, db: u16, table_pos: u32, name: &[u8], pos: u32) -> Result<()> {
        self.ensure_open()?;
        let db = self
            .databases
            .get_mut(db as usize)
            .ok_or_else(|| Error::logic(format!("no database at position {}", db)))?;
        if table_pos as usize >= db.tables.len() {
            return Err(Error::logic(format!("no table at position {}", table_pos)));
        }
        let expected = db.triggers.iter().filter(|t| t.table_pos == table_pos).count();
        if pos as usize != expected {
            return Err(Error::logic(format!(
                "trigger {} added at position {} (expected {})",
                display_name(name),
                pos,
                expected
            )));
        }
        db.triggers.push(Trigger { name: name.to_vec(), table_pos, pos, meta: None });
        Ok(())
    }

    // --- access -------------------------------------------------------

    pub fn get_db(&self, pos: u16) -> Option<&Database> {
        self.databases.get(pos as usize)
    }

    pub fn get_tablespace(&self, pos: u16) -> Option<&Tablespace> {
        self.tablespaces.get(pos as usize)
    }

    pub fn get_snapshot(&self, snap_num: u16) -> Option<&Snapshot> {
        snap_num
            .checked_sub(1)
            .and_then(|n| self.snapshots.get(n as usize))
    }

    pub fn get_table(&self, snap_num: u16, pos: u32) -> Option<&Table> {
        self.get_snapshot(snap_num)?.get_table(pos)
    }

    pub fn get_db_object(&self, db: u16, pos: u32) -> Option<&DbObject> {
        self.get_db(db)?.get_object(pos)
    }

    pub fn has_db(&self, name: &[u8]) -> bool {
        self.databases.iter().any(|db| db.name == name)
    }

    /// Resolve an item descriptor to the item it names.
    pub fn find(&self, item: ItemRef) -> Option<CatalogItem<'_>> {
        match item {
            ItemRef::Tablespace { pos } => self.get_tablespace(pos).map(CatalogItem::Tablespace),
            ItemRef::Database { pos } => self.get_db(pos).map(CatalogItem::Database),
            ItemRef::Table { snap_num, pos } => {
                self.get_table(snap_num, pos).map(CatalogItem::Table)
            }
            ItemRef::DbObject { db, pos } => self.get_db_object(db, pos).map(CatalogItem::DbObject),
            ItemRef::TableObject { db, table_pos, pos } => self
                .get_db(db)?
                .get_trigger(table_pos, pos)
                .map(CatalogItem::Trigger),
        }
    }

    /// Attach metadata to an existing item.
    pub fn set_meta(&mut self, item: ItemRef, meta: ItemMeta) -> Result<()> {
        let slot = match item {
            ItemRef::Tablespace { pos } => self
                .tablespaces
                .get_mut(pos as usize)
                .map(|i| &mut i.meta),
            ItemRef::Database { pos } => self.databases.get_mut(pos as usize).map(|i| &mut i.meta),
            ItemRef::Table { snap_num, pos } => snap_num
                .checked_sub(1)
                .and_then(|n| self.snapshots.get_mut(n as usize))
                .and_then(|s| s.tables.get_mut(pos as usize))
                .map(|t| &mut t.meta),
            ItemRef::DbObject { db, pos } => self
                .databases
                .get_mut(db as usize)
                .and_then(|d| d.objects.get_mut(pos as usize))
                .map(|o| &mut o.meta),
            ItemRef::TableObject { db, table_pos, pos } => self
                .databases
                .get_mut(db as usize)
                .and_then(|d| {
                    d.triggers
                        .iter_mut()
                        .find(|t| t.table_pos == table_pos && t.pos == pos)
                })
                .map(|t| &mut t.meta),
        };
        match slot {
            Some(slot) => {
                *slot = Some(meta);
                Ok(())
            }
            None => Err(Error::format(format!("metadata for unknown item {:?}", item))),
        }
    }

    // --- iteration ----------------------------------------------------

    pub fn tablespaces(&self) -> impl Iterator<Item = &Tablespace> {
        self.tablespaces.iter()
    }

    pub fn dbs(&self) -> impl Iterator<Item = &Database> {
        self.databases.iter()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    /// Items of one database: first all tables in insertion order,
    /// then the other objects by position. The stream writer derives
    /// wire positions from this order.
    pub fn db_objects<'a>(&'a self, db: &'a Database) -> impl Iterator<Item = CatalogItem<'a>> + 'a {
        let tables = db
            .tables
            .iter()
            .filter_map(move |&(snap, pos)| self.get_table(snap, pos))
            .map(CatalogItem::Table);
        let objects = db.objects.iter().map(CatalogItem::DbObject);
        tables.chain(objects)
    }

    /// All items in image (emission) order, with their coordinates.
    pub fn image_order(&self) -> Vec<(ItemRef, CatalogItem<'_>)> {
        let mut out = Vec::new();
        for (pos, ts) in self.tablespaces.iter().enumerate() {
            out.push((ItemRef::Tablespace { pos: pos as u16 }, CatalogItem::Tablespace(ts)));
        }
        for (pos, db) in self.databases.iter().enumerate() {
            out.push((ItemRef::Database { pos: pos as u16 }, CatalogItem::Database(db)));
        }
        for (db_pos, db) in self.databases.iter().enumerate() {
            for &(snap_num, pos) in &db.tables {
                if let Some(table) = self.get_table(snap_num, pos) {
                    out.push((ItemRef::Table { snap_num, pos }, CatalogItem::Table(table)));
                }
            }
            for (pos, obj) in db.objects.iter().enumerate() {
                out.push((
                    ItemRef::DbObject { db: db_pos as u16, pos: pos as u32 },
                    CatalogItem::DbObject(obj),
                ));
            }
        }
        for (db_pos, db) in self.databases.iter().enumerate() {
            for trg in &db.triggers {
                out.push((
                    ItemRef::TableObject {
                        db: db_pos as u16,
                        table_pos: trg.table_pos,
                        pos: trg.pos,
                    },
                    CatalogItem::Trigger(trg),
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::SnapshotKind;
    use super::*;

    fn snap() -> SnapshotInfo {
        SnapshotInfo::new(SnapshotDescriptor::default_blocking(1))
    }

    #[test]
    fn dense_positions_are_enforced() {
        let mut cat = Catalog::new();
        cat.add_database(b"one", 0).unwrap();
        assert!(matches!(cat.add_database(b"bad", 2), Err(Error::Logic(_))));
        cat.add_database(b"two", 1).unwrap();
        assert_eq!(cat.db_count(), 2);

        cat.add_tablespace(b"ts0", 0).unwrap();
        assert!(matches!(cat.add_tablespace(b"ts0", 0), Err(Error::Logic(_))));
    }

    #[test]
    fn tables_are_numbered_inside_their_snapshot() {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        let mut s1 = snap();
        let mut s2 = SnapshotInfo::new(SnapshotDescriptor::nodata(1));
        // numbering happens with the first table of each snapshot
        assert_eq!(s1.num(), None);

        cat.add_table(db, b"t1", &mut s1, 0).unwrap();
        cat.add_table(db, b"t2", &mut s2, 0).unwrap();
        cat.add_table(db, b"t3", &mut s1, 1).unwrap();
        assert_eq!((s1.num(), s2.num()), (Some(1), Some(2)));
        assert!(matches!(
            cat.add_table(db, b"t4", &mut s1, 3),
            Err(Error::Logic(_))
        ));

        assert_eq!(cat.table_count(), 3);
        assert_eq!(cat.snap_count(), 2);
        assert_eq!(cat.get_table(1, 1).unwrap().name, b"t3");
        assert_eq!(cat.get_table(2, 0).unwrap().name, b"t2");
        assert_eq!(cat.get_table(2, 0).unwrap().db, db);
        assert!(cat.get_table(3, 0).is_none());

        // database sees its tables in insertion order
        let names: Vec<&[u8]> = cat
            .db_objects(cat.get_db(db).unwrap())
            .map(|i| i.name())
            .collect();
        assert_eq!(names, vec![&b"t1"[..], b"t2", b"t3"]);
    }

    #[test]
    fn snapshot_limit_is_a_format_error() {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        for i in 0..256 {
            let mut s = snap();
            cat.add_table(db, format!("t{}", i).as_bytes(), &mut s, 0)
                .unwrap();
        }
        assert_eq!(cat.snap_count(), 256);

        // the 257th snapshot is rejected and its table is not added
        let mut extra = snap();
        assert!(matches!(
            cat.add_table(db, b"overflow", &mut extra, 0),
            Err(Error::Format(_))
        ));
        assert_eq!(extra.num(), None);
        assert_eq!(cat.table_count(), 256);
    }

    #[test]
    fn db_objects_lists_tables_before_objects() {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        let mut snap = snap();
        cat.add_db_object(db, ItemType::View, b"v", 0).unwrap();
        cat.add_table(db, b"t", &mut snap, 0).unwrap();
        cat.add_privilege(db, b"grant42", 7, 1).unwrap();

        let types: Vec<ItemType> = cat
            .db_objects(cat.get_db(db).unwrap())
            .map(|i| i.item_type())
            .collect();
        assert_eq!(types, vec![ItemType::Table, ItemType::View, ItemType::Privilege]);
        assert_eq!(cat.get_db_object(db, 1).unwrap().unique_id, 7);
        assert_eq!(cat.get_db_object(db, 1).unwrap().name, b"grant42");
    }

    #[test]
    fn triggers_attach_to_tables() {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        let mut snap = snap();
        cat.add_table(db, b"t0", &mut snap, 0).unwrap();
        cat.add_table(db, b"t1", &mut snap, 1).unwrap();

        cat.add_trigger(db, 1, b"trg_a", 0).unwrap();
        cat.add_trigger(db, 1, b"trg_b", 1).unwrap();
        cat.add_trigger(db, 0, b"trg_c", 0).unwrap();
        assert!(matches!(cat.add_trigger(db, 0, b"bad", 3), Err(Error::Logic(_))));
        assert!(matches!(cat.add_trigger(db, 9, b"bad", 0), Err(Error::Logic(_))));

        let item = cat
            .find(ItemRef::TableObject { db, table_pos: 1, pos: 1 })
            .unwrap();
        assert_eq!(item.name(), b"trg_b");
    }

    #[test]
    fn metadata_attaches_by_coordinate() {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        let mut snap = snap();
        let table = cat.add_table(db, b"t", &mut snap, 0).unwrap();

        let meta = ItemMeta { create_stmt: b"CREATE TABLE t (a INT)".to_vec(), extra: vec![] };
        cat.set_meta(table, meta.clone()).unwrap();
        let got = cat.find(table).unwrap().meta().cloned();
        assert_eq!(got, Some(meta));

        assert!(cat
            .set_meta(ItemRef::Table { snap_num: 1, pos: 9 }, ItemMeta::default())
            .is_err());
    }

    #[test]
    fn closed_catalog_rejects_insertions() {
        let mut cat = Catalog::new();
        cat.add_database(b"d", 0).unwrap();
        cat.close();
        assert!(matches!(cat.add_database(b"e", 1), Err(Error::Logic(_))));
    }

    #[test]
    fn close_syncs_snapshot_descriptors() {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        let mut snap = snap();
        cat.add_table(db, b"t", &mut snap, 0).unwrap();
        cat.close();
        assert_eq!(cat.header.snapshots.len(), 1);
        assert_eq!(cat.header.snapshots[0].table_count, 1);
        assert_eq!(cat.header.snapshots[0].kind, SnapshotKind::DefaultBlocking);
    }

    #[test]
    fn image_order_is_deterministic() {
        let mut cat = Catalog::new();
        cat.add_tablespace(b"ts", 0).unwrap();
        let d0 = cat.add_database(b"a", 0).unwrap();
        let d1 = cat.add_database(b"b", 1).unwrap();
        let mut snap = snap();
        cat.add_table(d1, b"t", &mut snap, 0).unwrap();
        cat.add_db_object(d0, ItemType::Event, b"e", 0).unwrap();
        cat.add_trigger(d1, 0, b"trg", 0).unwrap();

        let types: Vec<ItemType> = cat
            .image_order()
            .into_iter()
            .map(|(_, item)| item.item_type())
            .collect();
        assert_eq!(
            types,
            vec![
                ItemType::Tablespace,
                ItemType::Database,
                ItemType::Database,
                ItemType::Table,
                ItemType::Event,
                ItemType::Trigger,
            ]
        );
    }
}
