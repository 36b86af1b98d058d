use std::borrow::Cow;

/// Closed set of item types a catalogue can hold.
///
/// `Charset` and `User` are internal: the format reserves containers
/// for them but they are always emitted empty.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ItemType {
    Charset,
    User,
    Tablespace,
    Database,
    Table,
    View,
    StoredProc,
    StoredFunc,
    Event,
    Trigger,
    Privilege,
}

impl ItemType {
    pub fn type_tag(self) -> u8 {
        match self {
            ItemType::Charset => 1,
            ItemType::User => 2,
            ItemType::Tablespace => 3,
            ItemType::Database => 4,
            ItemType::Table => 5,
            ItemType::View => 6,
            ItemType::StoredProc => 7,
            ItemType::StoredFunc => 8,
            ItemType::Event => 9,
            ItemType::Trigger => 10,
            ItemType::Privilege => 11,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => ItemType::Charset,
            2 => ItemType::User,
            3 => ItemType::Tablespace,
            4 => ItemType::Database,
            5 => ItemType::Table,
            6 => ItemType::View,
            7 => ItemType::StoredProc,
            8 => ItemType::StoredFunc,
            9 => ItemType::Event,
            10 => ItemType::Trigger,
            11 => ItemType::Privilege,
            _ => return None,
        })
    }

    pub fn describe(self) -> &'static str {
        match self {
            ItemType::Charset => "charset",
            ItemType::User => "user",
            ItemType::Tablespace => "tablespace",
            ItemType::Database => "database",
            ItemType::Table => "table",
            ItemType::View => "view",
            ItemType::StoredProc => "stored procedure",
            ItemType::StoredFunc => "stored function",
            ItemType::Event => "event",
            ItemType::Trigger => "trigger",
            ItemType::Privilege => "privilege",
        }
    }

    /// Item types that live inside a database next to its tables.
    pub fn is_per_db(self) -> bool {
        matches!(
            self,
            ItemType::View
                | ItemType::StoredProc
                | ItemType::StoredFunc
                | ItemType::Event
                | ItemType::Privilege
        )
    }
}

/// Type-specific coordinates locating an item inside its catalogue.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ItemRef {
    Tablespace {
        pos: u16,
    },
    Database {
        pos: u16,
    },
    /// Tables are numbered inside their snapshot.
    Table {
        /// 1-based snapshot number.
        snap_num: u16,
        pos: u32,
    },
    /// A per-database object other than a table or trigger.
    DbObject {
        db: u16,
        pos: u32,
    },
    /// A per-table object (trigger): `table_pos` is the position of
    /// the table within its database, in insertion order.
    TableObject {
        db: u16,
        table_pos: u32,
        pos: u32,
    },
}

/// Metadata recorded for an item: a serialized create statement and an
/// opaque extra blob. Either may be empty.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ItemMeta {
    pub create_stmt: Vec<u8>,
    pub extra: Vec<u8>,
}

/// Render an item name for humans; names are raw bytes on the wire.
pub fn display_name(name: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip() {
        for typ in [
            ItemType::Charset,
            ItemType::User,
            ItemType::Tablespace,
            ItemType::Database,
            ItemType::Table,
            ItemType::View,
            ItemType::StoredProc,
            ItemType::StoredFunc,
            ItemType::Event,
            ItemType::Trigger,
            ItemType::Privilege,
        ]
        .iter()
        {
            assert_eq!(ItemType::from_tag(typ.type_tag()), Some(*typ));
        }
        assert_eq!(ItemType::from_tag(0), None);
        assert_eq!(ItemType::from_tag(200), None);
    }
}
