use std::cmp::Ordering;
use std::mem;

use crate::arena::{Arena, ArenaError, NULL_OFF, Region};

/// Bytes transitively owned by a key or value beyond its fixed 8-byte slot.
/// Must return 0 for the null sentinel.
pub type ExtSizeFn = fn(&Arena, u64) -> usize;

/// Textual rendering of a key or value for diagnostics.
pub type RenderFn = fn(&Arena, u64) -> String;

/// Programmable behavior of one tree family: comparison, rendering and
/// external sizing for both key and value terms.
pub struct TreeDesc {
    pub name: &'static str,
    pub cmp: fn(u64, u64) -> Ordering,
    pub render_key: RenderFn,
    pub render_val: RenderFn,
    pub key_ext: ExtSizeFn,
    pub val_ext: ExtSizeFn,
}

pub fn cmp_u64(a: u64, b: u64) -> Ordering {
    a.cmp(&b)
}

pub fn render_u64(_arena: &Arena, term: u64) -> String {
    format!("{term}")
}

pub fn ext_zero(_arena: &Arena, _term: u64) -> usize {
    0
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Node {
    key: u64,
    val: u64,
    left: u64,
    right: u64,
    height: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TreeHeader {
    root: u64,
    count: u64,
    ext_bytes: u64,
}

/// An ordered map rooted in the arena: a balanced search tree over
/// fixed-width terms, with nodes bump-allocated from a region.
///
/// The handle is just the offset of the header record, so a tree root can
/// be stored inside other arena structures and handed across a compaction
/// boundary. Only mutable-generation trees are ever inserted into; frozen
/// roots are traversed read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tree {
    hdr: u64,
}

#[inline]
fn node<'a>(arena: &'a Arena, off: u64) -> &'a Node {
    // SAFETY: off comes from a node allocation in this arena
    unsafe { &*(arena.ptr(off) as *const Node) }
}

#[inline]
fn node_mut<'a>(arena: &'a Arena, off: u64) -> &'a mut Node {
    // SAFETY: off comes from a node allocation in this arena
    unsafe { &mut *(arena.ptr(off) as *mut Node) }
}

#[inline]
fn height(arena: &Arena, off: u64) -> i32 {
    if off == NULL_OFF {
        0
    } else {
        node(arena, off).height as i32
    }
}

fn fix_height(arena: &Arena, off: u64) {
    let n = node(arena, off);
    let h = 1 + height(arena, n.left).max(height(arena, n.right));
    node_mut(arena, off).height = h as u32;
}

fn rotate_left(arena: &Arena, x: u64) -> u64 {
    let y = node(arena, x).right;
    node_mut(arena, x).right = node(arena, y).left;
    node_mut(arena, y).left = x;
    fix_height(arena, x);
    fix_height(arena, y);
    y
}

fn rotate_right(arena: &Arena, x: u64) -> u64 {
    let y = node(arena, x).left;
    node_mut(arena, x).left = node(arena, y).right;
    node_mut(arena, y).right = x;
    fix_height(arena, x);
    fix_height(arena, y);
    y
}

fn rebalance(arena: &Arena, off: u64) -> u64 {
    fix_height(arena, off);
    let n = node(arena, off);
    let balance = height(arena, n.left) - height(arena, n.right);

    if balance > 1 {
        let left = n.left;
        if height(arena, node(arena, left).left)
            < height(arena, node(arena, left).right)
        {
            let rotated = rotate_left(arena, left);
            node_mut(arena, off).left = rotated;
        }
        return rotate_right(arena, off);
    }
    if balance < -1 {
        let right = n.right;
        if height(arena, node(arena, right).right)
            < height(arena, node(arena, right).left)
        {
            let rotated = rotate_right(arena, right);
            node_mut(arena, off).right = rotated;
        }
        return rotate_left(arena, off);
    }
    off
}

/// Returns (new subtree root, previous value if the key was already bound).
fn insert_rec(
    arena: &Arena,
    region: &mut Region,
    desc: &TreeDesc,
    sub: u64,
    key: u64,
    val: u64,
) -> Result<(u64, Option<u64>), ArenaError> {
    if sub == NULL_OFF {
        let off = region.alloc(mem::size_of::<Node>())?;
        // SAFETY: freshly allocated, correctly sized
        unsafe {
            *(arena.ptr(off) as *mut Node) = Node {
                key,
                val,
                left: NULL_OFF,
                right: NULL_OFF,
                height: 1,
                _pad: 0,
            };
        }
        return Ok((off, None));
    }

    let n = *node(arena, sub);
    match (desc.cmp)(key, n.key) {
        Ordering::Equal => {
            node_mut(arena, sub).val = val;
            Ok((sub, Some(n.val)))
        }
        Ordering::Less => {
            let (new_left, old) =
                insert_rec(arena, region, desc, n.left, key, val)?;
            node_mut(arena, sub).left = new_left;
            Ok((rebalance(arena, sub), old))
        }
        Ordering::Greater => {
            let (new_right, old) =
                insert_rec(arena, region, desc, n.right, key, val)?;
            node_mut(arena, sub).right = new_right;
            Ok((rebalance(arena, sub), old))
        }
    }
}

fn walk(arena: &Arena, off: u64, f: &mut dyn FnMut(u64, u64)) {
    if off == NULL_OFF {
        return;
    }
    let n = *node(arena, off);
    walk(arena, n.left, f);
    f(n.key, n.val);
    walk(arena, n.right, f);
}

#[inline]
fn ext_of(desc_fn: ExtSizeFn, arena: &Arena, term: u64) -> u64 {
    if term == NULL_OFF {
        0
    } else {
        desc_fn(arena, term) as u64
    }
}

impl Tree {
    /// Create an empty tree whose header lives in `region`.
    pub fn create(
        arena: &Arena,
        region: &mut Region,
    ) -> Result<Self, ArenaError> {
        let hdr = region.alloc(mem::size_of::<TreeHeader>())?;
        // SAFETY: freshly allocated, correctly sized
        unsafe {
            *(arena.ptr(hdr) as *mut TreeHeader) = TreeHeader {
                root: NULL_OFF,
                count: 0,
                ext_bytes: 0,
            };
        }
        Ok(Self { hdr })
    }

    #[inline]
    #[must_use]
    pub fn from_off(hdr: u64) -> Self {
        Self { hdr }
    }

    #[inline]
    #[must_use]
    pub fn off(self) -> u64 {
        self.hdr
    }

    #[inline]
    fn hdr<'a>(self, arena: &'a Arena) -> &'a TreeHeader {
        // SAFETY: hdr offset always addresses a live TreeHeader
        unsafe { &*(arena.ptr(self.hdr) as *const TreeHeader) }
    }

    #[inline]
    fn hdr_mut<'a>(self, arena: &'a Arena) -> &'a mut TreeHeader {
        // SAFETY: hdr offset always addresses a live TreeHeader
        unsafe { &mut *(arena.ptr(self.hdr) as *mut TreeHeader) }
    }

    /// Bind `key` to `val`, replacing any previous binding. External size
    /// is accounted at insertion time via the descriptor callbacks.
    pub fn insert(
        self,
        arena: &Arena,
        region: &mut Region,
        desc: &TreeDesc,
        key: u64,
        val: u64,
    ) -> Result<(), ArenaError> {
        let root = self.hdr(arena).root;
        let (new_root, old) = insert_rec(arena, region, desc, root, key, val)?;

        let hdr = self.hdr_mut(arena);
        hdr.root = new_root;
        match old {
            Some(old_val) => {
                hdr.ext_bytes = hdr.ext_bytes
                    - ext_of(desc.val_ext, arena, old_val)
                    + ext_of(desc.val_ext, arena, val);
            }
            None => {
                hdr.count += 1;
                hdr.ext_bytes += ext_of(desc.key_ext, arena, key)
                    + ext_of(desc.val_ext, arena, val);
            }
        }
        Ok(())
    }

    /// Look up a binding. `Some(NULL_OFF)` is a present tombstone, `None`
    /// means no entry at all; callers must distinguish the two.
    #[must_use]
    pub fn lookup(self, arena: &Arena, desc: &TreeDesc, key: u64) -> Option<u64> {
        let mut cur = self.hdr(arena).root;
        while cur != NULL_OFF {
            let n = node(arena, cur);
            match (desc.cmp)(key, n.key) {
                Ordering::Equal => return Some(n.val),
                Ordering::Less => cur = n.left,
                Ordering::Greater => cur = n.right,
            }
        }
        None
    }

    /// In-order traversal over all bindings, tombstones included.
    pub fn for_each(self, arena: &Arena, f: &mut dyn FnMut(u64, u64)) {
        walk(arena, self.hdr(arena).root, f);
    }

    #[inline]
    #[must_use]
    pub fn len(self, arena: &Arena) -> usize {
        self.hdr(arena).count as usize
    }

    #[inline]
    #[must_use]
    pub fn is_empty(self, arena: &Arena) -> bool {
        self.hdr(arena).count == 0
    }

    /// Transitively owned bytes of stored terms beyond their fixed slots.
    #[inline]
    #[must_use]
    pub fn ext_bytes(self, arena: &Arena) -> usize {
        self.hdr(arena).ext_bytes as usize
    }

    /// Adjust the cached external size after an in-place value mutation
    /// changed its owned-byte footprint.
    pub fn adjust_ext(self, arena: &Arena, delta: i64) {
        let hdr = self.hdr_mut(arena);
        let adjusted = hdr.ext_bytes as i64 + delta;
        debug_assert!(adjusted >= 0, "external size adjusted below zero");
        hdr.ext_bytes = adjusted.max(0) as u64;
    }

    /// Total arena bytes this tree accounts for: header, nodes, and the
    /// external bytes owned by stored terms.
    #[must_use]
    pub fn owned_bytes(self, arena: &Arena) -> usize {
        let hdr = self.hdr(arena);
        mem::size_of::<TreeHeader>()
            + hdr.count as usize * mem::size_of::<Node>()
            + hdr.ext_bytes as usize
    }

    /// Render all bindings through the descriptor callbacks.
    #[must_use]
    pub fn render(self, arena: &Arena, desc: &TreeDesc) -> String {
        let mut out = format!("{} {{", desc.name);
        let mut first = true;
        self.for_each(arena, &mut |key, val| {
            if !first {
                out.push_str(", ");
            }
            first = false;
            out.push_str(&(desc.render_key)(arena, key));
            out.push_str(" => ");
            if val == NULL_OFF {
                out.push_str("<tombstone>");
            } else {
                out.push_str(&(desc.render_val)(arena, val));
            }
        });
        out.push('}');
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) static U64_DESC: TreeDesc = TreeDesc {
        name: "u64",
        cmp: cmp_u64,
        render_key: render_u64,
        render_val: render_u64,
        key_ext: ext_zero,
        val_ext: ext_zero,
    };

    fn size_as_ext(_arena: &Arena, term: u64) -> usize {
        term as usize
    }

    static SIZED_DESC: TreeDesc = TreeDesc {
        name: "sized",
        cmp: cmp_u64,
        render_key: render_u64,
        render_val: render_u64,
        key_ext: ext_zero,
        val_ext: size_as_ext,
    };

    fn fixture() -> (Arena, Region) {
        let arena = Arena::new(1024 * 1024).expect("map arena");
        let region = arena.carve(512 * 1024).expect("carve region");
        (arena, region)
    }

    #[test]
    fn insert_and_lookup_across_a_large_key_range() {
        let (arena, mut region) = fixture();
        let tree = Tree::create(&arena, &mut region).expect("create");

        // striding insert order exercises both rotation directions
        for key in (0..512u64).map(|i| (i * 7919) % 512) {
            tree.insert(&arena, &mut region, &U64_DESC, key, key + 1)
                .expect("insert");
        }

        assert_eq!(tree.len(&arena), 512);
        for key in 0..512u64 {
            assert_eq!(
                tree.lookup(&arena, &U64_DESC, key),
                Some(key + 1),
                "key {key} must be present"
            );
        }
        assert_eq!(tree.lookup(&arena, &U64_DESC, 512), None);
    }

    #[test]
    fn replacement_keeps_count_and_updates_value() {
        let (arena, mut region) = fixture();
        let tree = Tree::create(&arena, &mut region).expect("create");

        tree.insert(&arena, &mut region, &U64_DESC, 5, 10).expect("insert");
        tree.insert(&arena, &mut region, &U64_DESC, 5, 20).expect("replace");

        assert_eq!(tree.len(&arena), 1);
        assert_eq!(tree.lookup(&arena, &U64_DESC, 5), Some(20));
    }

    #[test]
    fn traversal_is_in_key_order() {
        let (arena, mut region) = fixture();
        let tree = Tree::create(&arena, &mut region).expect("create");

        for key in [9u64, 3, 7, 1, 5] {
            tree.insert(&arena, &mut region, &U64_DESC, key, key)
                .expect("insert");
        }

        let mut keys = Vec::new();
        tree.for_each(&arena, &mut |key, _| keys.push(key));
        assert_eq!(keys, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn external_size_tracks_insert_replace_and_adjust() {
        let (arena, mut region) = fixture();
        let tree = Tree::create(&arena, &mut region).expect("create");

        tree.insert(&arena, &mut region, &SIZED_DESC, 1, 100).expect("insert");
        tree.insert(&arena, &mut region, &SIZED_DESC, 2, 50).expect("insert");
        assert_eq!(tree.ext_bytes(&arena), 150);

        tree.insert(&arena, &mut region, &SIZED_DESC, 1, 30).expect("replace");
        assert_eq!(tree.ext_bytes(&arena), 80);

        tree.adjust_ext(&arena, 20);
        assert_eq!(tree.ext_bytes(&arena), 100);
        tree.adjust_ext(&arena, -40);
        assert_eq!(tree.ext_bytes(&arena), 60);
    }

    #[test]
    fn tombstones_are_present_entries_with_no_external_size() {
        let (arena, mut region) = fixture();
        let tree = Tree::create(&arena, &mut region).expect("create");

        tree.insert(&arena, &mut region, &SIZED_DESC, 1, NULL_OFF)
            .expect("insert tombstone");
        assert_eq!(tree.lookup(&arena, &SIZED_DESC, 1), Some(NULL_OFF));
        assert_eq!(tree.lookup(&arena, &SIZED_DESC, 2), None);
        assert_eq!(tree.ext_bytes(&arena), 0);
    }

    #[test]
    fn render_goes_through_the_descriptor_callbacks() {
        let (arena, mut region) = fixture();
        let tree = Tree::create(&arena, &mut region).expect("create");

        tree.insert(&arena, &mut region, &U64_DESC, 2, 4).expect("insert");
        tree.insert(&arena, &mut region, &U64_DESC, 1, NULL_OFF)
            .expect("insert");

        assert_eq!(tree.render(&arena, &U64_DESC), "u64 {1 => <tombstone>, 2 => 4}");
    }
}
