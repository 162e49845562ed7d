use log::trace;

use crate::arena::{Arena, ArenaError, NULL_OFF, Region};
use crate::object;
use crate::refs::Oid;
use crate::tree::{self, Tree, TreeDesc};

fn render_id(_arena: &Arena, id: u64) -> String {
    format!("#{id}")
}

fn render_off(_arena: &Arena, off: u64) -> String {
    format!("@{off}")
}

/// Full footprint of the mapped object: its record plus whatever it
/// transitively owns, dispatched on the kind tag.
fn obj_val_ext(arena: &Arena, off: u64) -> usize {
    object::header_at(arena, off).size() + object::ext_size(arena, off)
}

pub static OBJ_TABLE_DESC: TreeDesc = TreeDesc {
    name: "objects",
    cmp: tree::cmp_u64,
    render_key: render_id,
    render_val: render_off,
    key_ext: tree::ext_zero,
    val_ext: obj_val_ext,
};

/// Where an object currently resides, the input of the copy-on-write
/// transition: already mutable, or frozen and in need of a derived copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Mutable(u64),
    FrozenPrev(u64),
    FrozenOld(u64),
}

/// The identifier-to-offset index, split into three generations.
///
/// Only `cur` is ever inserted into after initialization; `prev` and `old`
/// are frozen roots from earlier cycles. Lookup cascades cur → prev → old,
/// and a tombstone (null offset) in a generation masks everything older.
#[derive(Debug)]
pub struct ObjectTable {
    pub cur: Tree,
    pub prev: Tree,
    pub old: Tree,
    next_id: u64,
}

impl ObjectTable {
    pub fn new(arena: &Arena, region: &mut Region) -> Result<Self, ArenaError> {
        Ok(Self {
            cur: Tree::create(arena, region)?,
            prev: Tree::create(arena, region)?,
            old: Tree::create(arena, region)?,
            next_id: 1,
        })
    }

    /// Assign the next unused identifier and bind it to `off`.
    pub fn add(
        &mut self,
        arena: &Arena,
        region: &mut Region,
        off: u64,
    ) -> Result<Oid, ArenaError> {
        let oid = Oid::from_raw(self.next_id);
        self.add_at(arena, region, oid, off)?;
        self.next_id += 1;
        Ok(oid)
    }

    /// Bind a specific identifier in the mutable generation: fresh
    /// allocation or installation of a derived copy.
    pub fn add_at(
        &mut self,
        arena: &Arena,
        region: &mut Region,
        oid: Oid,
        off: u64,
    ) -> Result<(), ArenaError> {
        debug_assert!(!oid.is_none(), "identifier 0 is reserved");
        self.cur.insert(arena, region, &OBJ_TABLE_DESC, oid.raw(), off)
    }

    /// Cascading lookup. The most recent generation holding any entry for
    /// the identifier decides; a tombstone there hides all older bindings.
    #[must_use]
    pub fn lookup(&self, arena: &Arena, oid: Oid) -> Option<u64> {
        for tree in [self.cur, self.prev, self.old] {
            if let Some(off) = tree.lookup(arena, &OBJ_TABLE_DESC, oid.raw()) {
                return (off != NULL_OFF).then_some(off);
            }
        }
        None
    }

    #[must_use]
    pub fn lookup_cur(&self, arena: &Arena, oid: Oid) -> Option<u64> {
        self.cur
            .lookup(arena, &OBJ_TABLE_DESC, oid.raw())
            .filter(|&off| off != NULL_OFF)
    }

    #[must_use]
    pub fn lookup_prev(&self, arena: &Arena, oid: Oid) -> Option<u64> {
        self.prev
            .lookup(arena, &OBJ_TABLE_DESC, oid.raw())
            .filter(|&off| off != NULL_OFF)
    }

    #[must_use]
    pub fn lookup_old(&self, arena: &Arena, oid: Oid) -> Option<u64> {
        self.old
            .lookup(arena, &OBJ_TABLE_DESC, oid.raw())
            .filter(|&off| off != NULL_OFF)
    }

    /// Mark the identifier deleted going forward, regardless of what the
    /// frozen generations still hold for it.
    pub fn invalidate(
        &mut self,
        arena: &Arena,
        region: &mut Region,
        oid: Oid,
    ) -> Result<(), ArenaError> {
        self.cur
            .insert(arena, region, &OBJ_TABLE_DESC, oid.raw(), NULL_OFF)
    }

    /// The copy-on-write state classifier: in the mutable generation, or
    /// frozen in one of the older two. `None` for unknown or tombstoned
    /// identifiers.
    #[must_use]
    pub fn residency(&self, arena: &Arena, oid: Oid) -> Option<Residency> {
        if let Some(off) = self.cur.lookup(arena, &OBJ_TABLE_DESC, oid.raw()) {
            return (off != NULL_OFF).then_some(Residency::Mutable(off));
        }
        if let Some(off) = self.prev.lookup(arena, &OBJ_TABLE_DESC, oid.raw()) {
            return (off != NULL_OFF).then_some(Residency::FrozenPrev(off));
        }
        if let Some(off) = self.old.lookup(arena, &OBJ_TABLE_DESC, oid.raw()) {
            return (off != NULL_OFF).then_some(Residency::FrozenOld(off));
        }
        None
    }

    /// Copy-on-write promotion: the single transition out of
    /// [`Residency`]. An object already in the mutable generation is
    /// returned as-is; a frozen one is copied into `region` and the copy
    /// installed under the same identifier.
    ///
    /// # Panics
    /// An identifier absent from all three generations is a broken
    /// invariant, not a recoverable condition.
    pub fn resolve_mutable(
        &mut self,
        arena: &Arena,
        region: &mut Region,
        oid: Oid,
    ) -> Result<u64, ArenaError> {
        match self.residency(arena, oid) {
            Some(Residency::Mutable(off)) => Ok(off),
            Some(Residency::FrozenPrev(off) | Residency::FrozenOld(off)) => {
                let derived = object::derive_mutable(arena, region, off)?;
                self.add_at(arena, region, oid, derived)?;
                trace!("derived mutable copy of {oid}: @{off} -> @{derived}");
                Ok(derived)
            }
            None => panic!("{oid} is absent from every generation"),
        }
    }

    #[inline]
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Generation rotation: the mutable generation freezes into `prev`,
    /// the previous `prev` ages into `old`, and a fresh empty tree becomes
    /// the mutable generation.
    pub fn rotate(&mut self, fresh_cur: Tree) {
        self.old = self.prev;
        self.prev = self.cur;
        self.cur = fresh_cur;
    }

    /// Install a compaction result: the merged tree replaces `prev`, and
    /// `old` becomes empty.
    pub fn install_compacted(&mut self, merged: Tree, empty_old: Tree) {
        self.prev = merged;
        self.old = empty_old;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::alloc_bytes;

    struct Fixture {
        arena: Arena,
        region: Region,
    }

    impl Fixture {
        fn new() -> Self {
            let arena = Arena::new(1024 * 1024).expect("map arena");
            let region = arena.carve(512 * 1024).expect("carve region");
            Self { arena, region }
        }

        fn table(&mut self) -> ObjectTable {
            ObjectTable::new(&self.arena, &mut self.region).expect("table")
        }

        fn bytes(&mut self, data: &[u8]) -> u64 {
            alloc_bytes(&self.arena, &mut self.region, data).expect("alloc")
        }

        fn rotate(&mut self, table: &mut ObjectTable) {
            let fresh =
                Tree::create(&self.arena, &mut self.region).expect("tree");
            table.rotate(fresh);
        }
    }

    #[test]
    fn identifiers_are_monotonic_and_start_at_one() {
        let mut fx = Fixture::new();
        let mut table = fx.table();

        let a = fx.bytes(b"a");
        let b = fx.bytes(b"b");
        let first = table.add(&fx.arena, &mut fx.region, a).expect("add");
        let second = table.add(&fx.arena, &mut fx.region, b).expect("add");

        assert_eq!(first.raw(), 1);
        assert_eq!(second.raw(), 2);
        assert_eq!(table.lookup(&fx.arena, first), Some(a));
        assert_eq!(table.lookup(&fx.arena, second), Some(b));
    }

    #[test]
    fn tombstone_in_the_mutable_generation_masks_older_entries() {
        let mut fx = Fixture::new();
        let mut table = fx.table();

        let off = fx.bytes(b"old");
        let oid = table.add(&fx.arena, &mut fx.region, off).expect("add");

        fx.rotate(&mut table);
        assert_eq!(
            table.lookup(&fx.arena, oid),
            Some(off),
            "entry must still cascade from the frozen generation"
        );

        table.invalidate(&fx.arena, &mut fx.region, oid).expect("invalidate");
        assert_eq!(
            table.lookup(&fx.arena, oid),
            None,
            "tombstone must hide the frozen binding"
        );
        assert_eq!(
            table.lookup_prev(&fx.arena, oid),
            Some(off),
            "the frozen generation itself is untouched"
        );
    }

    #[test]
    fn most_recent_generation_with_any_entry_wins() {
        let mut fx = Fixture::new();
        let mut table = fx.table();

        let oldest = fx.bytes(b"v1");
        let oid = table.add(&fx.arena, &mut fx.region, oldest).expect("add");
        fx.rotate(&mut table);
        fx.rotate(&mut table);
        assert_eq!(table.lookup_old(&fx.arena, oid), Some(oldest));

        let newer = fx.bytes(b"v2");
        table.add_at(&fx.arena, &mut fx.region, oid, newer).expect("add_at");
        fx.rotate(&mut table);
        assert_eq!(table.lookup_prev(&fx.arena, oid), Some(newer));

        assert_eq!(
            table.lookup(&fx.arena, oid),
            Some(newer),
            "the prev generation must shadow the old one"
        );

        let newest = fx.bytes(b"v3");
        table.add_at(&fx.arena, &mut fx.region, oid, newest).expect("add_at");
        assert_eq!(table.lookup(&fx.arena, oid), Some(newest));
    }

    #[test]
    fn generation_specific_lookups_do_not_cascade() {
        let mut fx = Fixture::new();
        let mut table = fx.table();

        let off = fx.bytes(b"x");
        let oid = table.add(&fx.arena, &mut fx.region, off).expect("add");
        fx.rotate(&mut table);

        assert_eq!(table.lookup_cur(&fx.arena, oid), None);
        assert_eq!(table.lookup_prev(&fx.arena, oid), Some(off));
        assert_eq!(table.lookup_old(&fx.arena, oid), None);
    }

    #[test]
    fn resolve_mutable_returns_existing_mutable_binding_unchanged() {
        let mut fx = Fixture::new();
        let mut table = fx.table();

        let off = fx.bytes(b"mutable");
        let oid = table.add(&fx.arena, &mut fx.region, off).expect("add");

        let resolved = table
            .resolve_mutable(&fx.arena, &mut fx.region, oid)
            .expect("resolve");
        assert_eq!(resolved, off, "already-mutable objects are not copied");
    }

    #[test]
    fn resolve_mutable_derives_a_copy_and_leaves_the_frozen_one_intact() {
        let mut fx = Fixture::new();
        let mut table = fx.table();

        let frozen = fx.bytes(b"frozen");
        let oid = table.add(&fx.arena, &mut fx.region, frozen).expect("add");
        fx.rotate(&mut table);

        assert_eq!(table.residency(&fx.arena, oid), Some(Residency::FrozenPrev(frozen)));

        let derived = table
            .resolve_mutable(&fx.arena, &mut fx.region, oid)
            .expect("resolve");
        assert_ne!(derived, frozen, "a frozen object must be copied");
        assert_eq!(table.lookup_cur(&fx.arena, oid), Some(derived));
        assert_eq!(
            table.lookup_prev(&fx.arena, oid),
            Some(frozen),
            "the frozen binding must survive the promotion"
        );
        assert_eq!(table.residency(&fx.arena, oid), Some(Residency::Mutable(derived)));

        // mutating the derived copy leaves the frozen payload untouched
        // SAFETY: derived addresses a live BytesObj
        unsafe {
            let data = fx
                .arena
                .ptr(derived)
                .add(std::mem::size_of::<crate::object::BytesObj>());
            *data = b'F';
        }
        assert_eq!(crate::object::bytes_at(&fx.arena, frozen), b"frozen");
        assert_eq!(crate::object::bytes_at(&fx.arena, derived), b"Frozen");
    }

    #[test]
    #[should_panic(expected = "absent from every generation")]
    fn resolving_an_unknown_identifier_is_fatal() {
        let mut fx = Fixture::new();
        let mut table = fx.table();
        let _ = table.resolve_mutable(&fx.arena, &mut fx.region, Oid::from_raw(99));
    }
}
