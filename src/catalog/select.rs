use crate::error::{Error, Result};

use super::{Catalog, ItemRef, SnapshotDescriptor, SnapshotInfo};

struct Candidate {
    info: SnapshotInfo,
    accept: Box<dyn Fn(&str) -> bool>,
}

/// Places tables into snapshots while populating a catalogue.
///
/// Candidates are tried in registration order; the first one whose
/// accept predicate matches the table's storage engine wins. A
/// candidate snapshot joins the catalogue (and gets its number) with
/// its first table, so unused candidates never appear in the image.
/// The catch-all candidate should therefore be registered last.
pub struct SnapshotSelector {
    candidates: Vec<Candidate>,
}

impl Default for SnapshotSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSelector {
    pub fn new() -> Self {
        Self { candidates: Vec::new() }
    }

    pub fn push_candidate<F>(&mut self, descr: SnapshotDescriptor, accept: F)
    where
        F: Fn(&str) -> bool + 'static,
    {
        self.candidates.push(Candidate {
            info: SnapshotInfo::new(descr),
            accept: Box::new(accept),
        });
    }

    /// Add `name` to `db`, stored in the first snapshot accepting its
    /// engine.
    pub fn place_table(
        &mut self,
        cat: &mut Catalog,
        db: u16,
        name: &[u8],
        engine: &str,
    ) -> Result<ItemRef> {
        for cand in &mut self.candidates {
            if !(cand.accept)(engine) {
                continue;
            }
            let pos = cand
                .info
                .num()
                .and_then(|num| cat.get_snapshot(num))
                .map_or(0, |slot| slot.table_count());
            return cat.add_table(db, name, &mut cand.info, pos);
        }
        Err(Error::format(format!(
            "no snapshot can hold tables of engine {}",
            engine
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{EngineInfo, ItemType, SnapshotKind};
    use super::*;

    #[test]
    fn first_accepting_candidate_wins_and_numbering_is_lazy() {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();

        let mut sel = SnapshotSelector::new();
        sel.push_candidate(
            SnapshotDescriptor::native(
                EngineInfo { name: "treestore".to_string(), major: 1, minor: 2 },
                1,
            ),
            |engine| engine == "treestore",
        );
        sel.push_candidate(SnapshotDescriptor::default_blocking(1), |_| true);

        // default snapshot gets number 1: its table arrives first
        sel.place_table(&mut cat, db, b"t2", "heapstore").unwrap();
        let t1 = sel.place_table(&mut cat, db, b"t1", "treestore").unwrap();
        sel.place_table(&mut cat, db, b"t3", "treestore").unwrap();

        assert_eq!(cat.snap_count(), 2);
        assert_eq!(cat.get_snapshot(1).unwrap().descr.kind, SnapshotKind::DefaultBlocking);
        assert_eq!(cat.get_snapshot(2).unwrap().descr.kind, SnapshotKind::Native);
        assert_eq!(cat.get_snapshot(2).unwrap().table_count(), 2);
        match t1 {
            ItemRef::Table { snap_num, pos } => {
                assert_eq!((snap_num, pos), (2, 0));
            }
            other => panic!("unexpected ref {:?}", other),
        }
        assert_eq!(
            cat.find(t1).unwrap().item_type(),
            ItemType::Table
        );
    }

    #[test]
    fn unplaceable_engine_is_an_error() {
        let mut cat = Catalog::new();
        let db = cat.add_database(b"d", 0).unwrap();
        let mut sel = SnapshotSelector::new();
        sel.push_candidate(SnapshotDescriptor::nodata(1), |e| e == "voidstore");
        assert!(sel.place_table(&mut cat, db, b"t", "heapstore").is_err());
        assert_eq!(cat.snap_count(), 0);
    }
}
