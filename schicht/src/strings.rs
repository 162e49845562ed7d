use std::hash::Hasher;

use crate::arena::{Arena, ArenaError, NULL_OFF, Region};
use crate::object;
use crate::refs::Oid;
use crate::table::ObjectTable;
use crate::tree::{self, Tree, TreeDesc};

fn render_key(_arena: &Arena, key: u64) -> String {
    format!("{key:#018x}")
}

fn render_oid(_arena: &Arena, raw: u64) -> String {
    format!("#{raw}")
}

pub static STRINGS_DESC: TreeDesc = TreeDesc {
    name: "strings",
    cmp: tree::cmp_u64,
    render_key,
    render_val: render_oid,
    key_ext: tree::ext_zero,
    val_ext: tree::ext_zero,
};

/// Stable key of an interned string: the hash of its bytes.
#[must_use]
pub fn intern_key(text: &str) -> u64 {
    let mut hasher = ahash::AHasher::default();
    hasher.write(text.as_bytes());
    hasher.finish()
}

/// The interned-string index: hash of the text to the identifier of its
/// backing bytes object, across three generations.
#[derive(Debug)]
pub struct Strings {
    pub cur: Tree,
    pub prev: Tree,
    pub old: Tree,
}

impl Strings {
    pub fn new(arena: &Arena, region: &mut Region) -> Result<Self, ArenaError> {
        Ok(Self {
            cur: Tree::create(arena, region)?,
            prev: Tree::create(arena, region)?,
            old: Tree::create(arena, region)?,
        })
    }

    #[must_use]
    pub fn lookup_key(&self, arena: &Arena, key: u64) -> Option<Oid> {
        for tree in [self.cur, self.prev, self.old] {
            if let Some(raw) = tree.lookup(arena, &STRINGS_DESC, key) {
                return (raw != NULL_OFF).then(|| Oid::from_raw(raw));
            }
        }
        None
    }

    #[must_use]
    pub fn lookup(&self, arena: &Arena, text: &str) -> Option<Oid> {
        self.lookup_key(arena, intern_key(text))
    }

    /// Get-or-create: an already interned text returns its existing
    /// identifier; otherwise the bytes are stored as a heap object and
    /// registered under a fresh one.
    pub fn intern(
        &mut self,
        arena: &Arena,
        region: &mut Region,
        table: &mut ObjectTable,
        text: &str,
    ) -> Result<Oid, ArenaError> {
        let key = intern_key(text);
        if let Some(oid) = self.lookup_key(arena, key) {
            return Ok(oid);
        }
        let off = object::alloc_bytes(arena, region, text.as_bytes())?;
        let oid = table.add(arena, region, off)?;
        self.cur.insert(arena, region, &STRINGS_DESC, key, oid.raw())?;
        Ok(oid)
    }

    pub fn rotate(&mut self, fresh_cur: Tree) {
        self.old = self.prev;
        self.prev = self.cur;
        self.cur = fresh_cur;
    }

    pub fn install_compacted(&mut self, merged: Tree, empty_old: Tree) {
        self.prev = merged;
        self.old = empty_old;
    }
}
