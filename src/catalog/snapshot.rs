/// How the table data of one snapshot was produced.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SnapshotKind {
    /// Created by a native backup engine.
    Native,
    /// Created by the built-in engine using a consistent read.
    ConsistentSnapshot,
    /// Created by the built-in blocking engine.
    DefaultBlocking,
    /// Created for engines whose tables store no data.
    NoData,
}

impl SnapshotKind {
    pub fn type_tag(self) -> u8 {
        match self {
            SnapshotKind::Native => 1,
            SnapshotKind::ConsistentSnapshot => 2,
            SnapshotKind::DefaultBlocking => 3,
            SnapshotKind::NoData => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => SnapshotKind::Native,
            2 => SnapshotKind::ConsistentSnapshot,
            3 => SnapshotKind::DefaultBlocking,
            4 => SnapshotKind::NoData,
            _ => return None,
        })
    }
}

/// Identity of the native engine that produced a snapshot.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EngineInfo {
    pub name: String,
    pub major: u8,
    pub minor: u8,
}

/// Descriptor of one snapshot as stored in the image header.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SnapshotDescriptor {
    pub kind: SnapshotKind,
    /// Format version of the driver that produced the snapshot.
    pub version: u16,
    pub table_count: u32,
    /// Present for native snapshots only.
    pub engine: Option<EngineInfo>,
}

impl SnapshotDescriptor {
    pub fn native(engine: EngineInfo, version: u16) -> Self {
        Self { kind: SnapshotKind::Native, version, table_count: 0, engine: Some(engine) }
    }

    pub fn consistent(version: u16) -> Self {
        Self { kind: SnapshotKind::ConsistentSnapshot, version, table_count: 0, engine: None }
    }

    pub fn default_blocking(version: u16) -> Self {
        Self { kind: SnapshotKind::DefaultBlocking, version, table_count: 0, engine: None }
    }

    pub fn nodata(version: u16) -> Self {
        Self { kind: SnapshotKind::NoData, version, table_count: 0, engine: None }
    }

    /// Name identifying the snapshot in diagnostics; fits the
    /// "`{}` backup driver" pattern.
    pub fn name(&self) -> String {
        match self.kind {
            SnapshotKind::Native => match &self.engine {
                Some(info) => info.name.clone(),
                None => "Native".to_string(),
            },
            SnapshotKind::ConsistentSnapshot => "CS".to_string(),
            SnapshotKind::DefaultBlocking => "Default".to_string(),
            SnapshotKind::NoData => "Nodata".to_string(),
        }
    }
}

/// A snapshot as seen by the code populating a catalogue.
///
/// Carries the descriptor and, once the snapshot's first table has
/// been added, its 1-based number within the image. A snapshot that
/// never receives a table is never part of the image; numbering
/// happens inside [`Catalog::add_table`](super::Catalog::add_table)
/// on first use.
#[derive(Debug)]
pub struct SnapshotInfo {
    pub(super) descr: SnapshotDescriptor,
    pub(super) num: Option<u16>,
}

impl SnapshotInfo {
    pub fn new(descr: SnapshotDescriptor) -> Self {
        Self { descr, num: None }
    }

    pub fn descr(&self) -> &SnapshotDescriptor {
        &self.descr
    }

    /// Position inside the image's snapshot list, assigned with the
    /// first table. `None` means the snapshot is not (yet) included.
    pub fn num(&self) -> Option<u16> {
        self.num
    }

    /// Name identifying the snapshot in diagnostics.
    pub fn name(&self) -> String {
        self.descr.name()
    }
}

/// A snapshot slot inside the catalogue: the descriptor plus the
/// tables whose data the snapshot holds, in table-number order.
#[derive(Debug)]
pub struct Snapshot {
    pub descr: SnapshotDescriptor,
    pub(super) tables: Vec<super::Table>,
}

impl Snapshot {
    pub(super) fn new(descr: SnapshotDescriptor) -> Self {
        Self { descr, tables: Vec::new() }
    }

    pub fn table_count(&self) -> u32 {
        self.tables.len() as u32
    }

    pub fn get_table(&self, pos: u32) -> Option<&super::Table> {
        self.tables.get(pos as usize)
    }

    pub fn tables(&self) -> impl Iterator<Item = &super::Table> {
        self.tables.iter()
    }
}
