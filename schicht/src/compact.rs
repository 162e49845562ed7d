use std::ptr;

use log::debug;

use crate::arena::{Arena, ArenaError, NULL_OFF, Region};
use crate::frames::FRAME_SIZE;
use crate::globals::GLOBALS_DESC;
use crate::object::{self, ObjFlags, SLOT_DESC};
use crate::pin::ScopedPin;
use crate::stack::{SLOT, Window};
use crate::strings::STRINGS_DESC;
use crate::table::OBJ_TABLE_DESC;
use crate::tree::{Tree, TreeDesc};

/// Frozen roots of one three-generation index: the previous generation
/// masks the old one wherever both hold an entry for the same key.
#[derive(Debug, Clone, Copy)]
pub struct GenRoots {
    pub prev: Tree,
    pub old: Tree,
}

/// One frozen index range of a windowed structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrozenRange {
    pub base: u64,
    pub base_idx: usize,
    pub len: usize,
}

impl FrozenRange {
    #[must_use]
    pub fn window(self) -> Window {
        Window {
            base: self.base,
            base_idx: self.base_idx,
        }
    }
}

/// Everything the engine needs to know about the old generations: roots
/// for the keyed indexes, index ranges for the windowed structures. The
/// mutable generation is never compaction input; the caller rotates it
/// separately.
#[derive(Debug)]
pub struct CompactRequest {
    pub table: GenRoots,
    pub strings: GenRoots,
    pub globals: GenRoots,
    pub stack_prev: FrozenRange,
    pub stack_old: FrozenRange,
    pub frames_prev: FrozenRange,
    pub frames_old: FrozenRange,
}

/// The merged structures, all resident in the destination region. These
/// become the single frozen generation of the next cycle.
#[derive(Debug)]
pub struct CompactResponse {
    pub table: Tree,
    pub strings: Tree,
    pub globals: Tree,
    pub stack: FrozenRange,
    pub frames: FrozenRange,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CompactStats {
    pub objects_copied: usize,
    pub objects_merged: usize,
    pub entries_masked: usize,
    pub tombstones_elided: usize,
    pub index_entries: usize,
    pub window_elements: usize,
    pub bytes_moved: usize,
}

/// The stop-the-world condensation pass: rewrites the frozen generations
/// of every structure into one fresh region, eliding masked and
/// tombstoned entries and structurally merging kinds that carry a nested
/// key map.
///
/// The destination region is sized by the caller; running out of it
/// mid-pass is an unrecoverable invariant violation, not an error.
pub struct Compactor<'a> {
    arena: &'a Arena,
    dest: Region,
    stats: CompactStats,
}

fn collect(arena: &Arena, tree: Tree) -> Vec<(u64, u64)> {
    let mut entries = Vec::with_capacity(tree.len(arena));
    tree.for_each(arena, &mut |key, val| entries.push((key, val)));
    entries
}

impl<'a> Compactor<'a> {
    #[must_use]
    pub fn new(arena: &'a Arena, dest: Region) -> Self {
        Self {
            arena,
            dest,
            stats: CompactStats::default(),
        }
    }

    /// Run the full pass. Returns the response, the destination region
    /// with its cursor advanced past everything written, and the pass
    /// statistics.
    pub fn run(
        mut self,
        req: &CompactRequest,
    ) -> (CompactResponse, Region, CompactStats) {
        let table = self.compact_table(req.table);
        let strings = self.compact_index(&STRINGS_DESC, req.strings);
        let globals = self.compact_index(&GLOBALS_DESC, req.globals);
        let stack = self.compact_windows(SLOT, req.stack_prev, req.stack_old);
        let frames =
            self.compact_windows(FRAME_SIZE, req.frames_prev, req.frames_old);

        debug!(
            "compaction: {} objects copied, {} merged, {} masked, {} tombstones elided, \
             {} index entries, {} window elements, {} bytes moved",
            self.stats.objects_copied,
            self.stats.objects_merged,
            self.stats.entries_masked,
            self.stats.tombstones_elided,
            self.stats.index_entries,
            self.stats.window_elements,
            self.stats.bytes_moved,
        );

        (
            CompactResponse {
                table,
                strings,
                globals,
                stack,
                frames,
            },
            self.dest,
            self.stats,
        )
    }

    fn alloc(&mut self, size: usize) -> u64 {
        match self.dest.alloc(size) {
            Ok(off) => off,
            Err(ArenaError::Exhausted { requested }) => {
                panic!("compaction destination exhausted ({requested} bytes)")
            }
            Err(err) => panic!("compaction destination failed: {err}"),
        }
    }

    /// Relocate one object's bytes, nested tree included, into the
    /// destination.
    fn relocate(&mut self, off: u64) -> u64 {
        let size = object::header_at(self.arena, off).size();
        self.stats.bytes_moved += size;
        self.stats.objects_copied += 1;
        match object::copy_object(self.arena, &mut self.dest, off) {
            Ok(new_off) => new_off,
            Err(err) => panic!("compaction destination failed: {err}"),
        }
    }

    /// Structural merge of the same identifier found in both frozen
    /// generations of the object table: a fresh copy of the newer side's
    /// record, whose nested map holds the older side's entries overlaid by
    /// the newer side's (newer wins on collision, tombstones elided).
    fn merge_pair(&mut self, prev_off: u64, old_off: u64) -> u64 {
        let _pin = ScopedPin::enter(self.arena, prev_off.min(old_off));

        let size = object::header_at(self.arena, prev_off).size();
        let dst = self.alloc(size);
        // SAFETY: both offsets address `size` live bytes in disjoint regions
        unsafe {
            ptr::copy_nonoverlapping(
                self.arena.ptr(prev_off),
                self.arena.ptr(dst),
                size,
            );
        }

        let prev_slots = object::slot_tree(self.arena, prev_off)
            .expect("mergeable kind without a slot tree");
        let old_slots = object::slot_tree(self.arena, old_off)
            .expect("mergeable kind without a slot tree");

        let merged_slots = Tree::create(self.arena, &mut self.dest)
            .expect("compaction destination exhausted");

        for (key, val) in collect(self.arena, old_slots) {
            if prev_slots.lookup(self.arena, &SLOT_DESC, key).is_some() {
                continue;
            }
            if val == NULL_OFF {
                continue;
            }
            merged_slots
                .insert(self.arena, &mut self.dest, &SLOT_DESC, key, val)
                .expect("compaction destination exhausted");
        }
        for (key, val) in collect(self.arena, prev_slots) {
            if val == NULL_OFF {
                continue;
            }
            merged_slots
                .insert(self.arena, &mut self.dest, &SLOT_DESC, key, val)
                .expect("compaction destination exhausted");
        }

        object::set_slot_tree(self.arena, dst, merged_slots);
        object::header_at_mut(self.arena, dst).insert_flags(ObjFlags::MERGED);

        self.stats.objects_merged += 1;
        self.stats.bytes_moved += size;
        dst
    }

    fn mergeable_pair(&self, prev_off: u64, old_off: u64) -> bool {
        let prev_kind = object::kind_at(self.arena, prev_off);
        prev_kind == object::kind_at(self.arena, old_off)
            && prev_kind.has_slot_tree()
    }

    fn compact_table(&mut self, roots: GenRoots) -> Tree {
        let merged = Tree::create(self.arena, &mut self.dest)
            .expect("compaction destination exhausted");

        for (id, off) in collect(self.arena, roots.prev) {
            if off == NULL_OFF {
                self.stats.tombstones_elided += 1;
                continue;
            }
            let old_entry =
                roots.old.lookup(self.arena, &OBJ_TABLE_DESC, id);
            let new_off = match old_entry {
                Some(old_off)
                    if old_off != NULL_OFF
                        && self.mergeable_pair(off, old_off) =>
                {
                    self.merge_pair(off, old_off)
                }
                _ => self.relocate(off),
            };
            merged
                .insert(self.arena, &mut self.dest, &OBJ_TABLE_DESC, id, new_off)
                .expect("compaction destination exhausted");
        }

        for (id, off) in collect(self.arena, roots.old) {
            if roots.prev.lookup(self.arena, &OBJ_TABLE_DESC, id).is_some() {
                // masked, or already consumed by a merge
                self.stats.entries_masked += 1;
                continue;
            }
            if off == NULL_OFF {
                self.stats.tombstones_elided += 1;
                continue;
            }
            let new_off = self.relocate(off);
            merged
                .insert(self.arena, &mut self.dest, &OBJ_TABLE_DESC, id, new_off)
                .expect("compaction destination exhausted");
        }

        merged
    }

    /// The keyed indexes without nested structure: copy the newer
    /// generation, then older entries whose key it does not hold at all.
    fn compact_index(&mut self, desc: &TreeDesc, roots: GenRoots) -> Tree {
        let merged = Tree::create(self.arena, &mut self.dest)
            .expect("compaction destination exhausted");

        for (key, val) in collect(self.arena, roots.prev) {
            if val == NULL_OFF {
                self.stats.tombstones_elided += 1;
                continue;
            }
            merged
                .insert(self.arena, &mut self.dest, desc, key, val)
                .expect("compaction destination exhausted");
            self.stats.index_entries += 1;
        }
        for (key, val) in collect(self.arena, roots.old) {
            if roots.prev.lookup(self.arena, desc, key).is_some() {
                self.stats.entries_masked += 1;
                continue;
            }
            if val == NULL_OFF {
                self.stats.tombstones_elided += 1;
                continue;
            }
            merged
                .insert(self.arena, &mut self.dest, desc, key, val)
                .expect("compaction destination exhausted");
            self.stats.index_entries += 1;
        }

        merged
    }

    /// The windowed structures: logical concatenation of the old range and
    /// the newer range, copied in index order into one contiguous run.
    fn compact_windows(
        &mut self,
        elt: usize,
        prev: FrozenRange,
        old: FrozenRange,
    ) -> FrozenRange {
        debug_assert!(
            prev.len == 0 || old.len == 0 || old.base_idx + old.len == prev.base_idx,
            "frozen ranges must be contiguous"
        );

        let total = prev.len + old.len;
        if total == 0 {
            return FrozenRange::default();
        }

        let dst = self.alloc(total * elt);
        if old.len > 0 {
            // SAFETY: source range is frozen and live, destination fresh
            unsafe {
                ptr::copy_nonoverlapping(
                    self.arena.ptr(old.base),
                    self.arena.ptr(dst),
                    old.len * elt,
                );
            }
        }
        if prev.len > 0 {
            // SAFETY: source range is frozen and live, destination fresh
            unsafe {
                ptr::copy_nonoverlapping(
                    self.arena.ptr(prev.base),
                    self.arena.ptr(dst + (old.len * elt) as u64),
                    prev.len * elt,
                );
            }
        }

        self.stats.window_elements += total;
        self.stats.bytes_moved += total * elt;

        FrozenRange {
            base: dst,
            base_idx: if old.len > 0 { old.base_idx } else { prev.base_idx },
            len: total,
        }
    }
}
