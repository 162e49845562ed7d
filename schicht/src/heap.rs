use std::mem;

use log::{debug, info};

use crate::arena::{Arena, ArenaError, NULL_OFF, Region};
use crate::compact::{CompactRequest, Compactor, FrozenRange, GenRoots};
use crate::frames::{FRAME_SIZE, Frame, TriFrames};
use crate::globals::Globals;
use crate::object::{self, BytesObj, ClassObj, InstanceObj, SLOT_DESC};
use crate::pin::ScopedPin;
use crate::refs::{Id, Oid, Ref, Value};
use crate::stack::{SLOT, TriStack};
use crate::strings::{Strings, intern_key};
use crate::table::ObjectTable;
use crate::tree::Tree;

#[derive(Debug, Default)]
pub struct HeapCreateInfo {
    pub size: usize,
    pub stack_slots: Option<usize>,
    pub frame_count: Option<usize>,
    pub live_region_size: Option<usize>,
}

#[derive(Debug)]
pub struct HeapSettings {
    pub size: usize,
    pub stack_slots: usize,
    pub frame_count: usize,
    /// Size of one mutable generation's object-and-node region.
    pub live_region_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            size: 16 * 1024 * 1024,
            stack_slots: 4096,
            frame_count: 512,
            live_region_size: 1024 * 1024,
        }
    }
}

impl HeapSettings {
    fn validate(&self) -> Result<(), &'static str> {
        if self.size == 0 || self.stack_slots == 0 || self.frame_count == 0 {
            return Err("sizes must be > 0");
        }
        if self.live_region_size < 4096 {
            return Err("live region too small to hold the index trees");
        }
        // three generations of every region must fit, plus compaction room
        let per_cycle = self.live_region_size
            + self.stack_slots * SLOT
            + self.frame_count * FRAME_SIZE;
        if self.size < per_cycle * 4 {
            return Err("arena too small for three generations plus compaction");
        }
        Ok(())
    }
}

/// One thread's layered heap: the arena, the mutable region, and the three
/// generations of every structure, plus the rotation policy tying them
/// together.
///
/// All state is owned by one thread; independent heaps on independent
/// threads never share anything.
#[derive(Debug)]
pub struct Heap {
    pub arena: Arena,
    pub settings: HeapSettings,
    live: Region,
    stack_region: Region,
    frames_region: Region,
    pub table: ObjectTable,
    pub stack: TriStack,
    pub frames: TriFrames,
    pub strings: Strings,
    pub globals: Globals,
    /// Regions backing the frozen previous generation.
    frozen_prev: Vec<Region>,
    /// Regions backing the frozen oldest generation.
    frozen_old: Vec<Region>,
    cycles: usize,
}

impl Heap {
    /// Construction failure is loud: a heap that cannot hold three
    /// generations of its own settings is a configuration error.
    #[must_use]
    pub fn new(info: HeapCreateInfo) -> Self {
        let mut settings = HeapSettings {
            size: info.size,
            ..Default::default()
        };
        info.stack_slots.inspect(|&val| settings.stack_slots = val);
        info.frame_count.inspect(|&val| settings.frame_count = val);
        info.live_region_size
            .inspect(|&val| settings.live_region_size = val);

        settings.validate().expect("invalid heap settings");

        let arena = Arena::new(settings.size).expect("map heap arena");
        let mut live = arena
            .carve(settings.live_region_size)
            .expect("carve live region");
        let stack_region = arena
            .carve(settings.stack_slots * SLOT)
            .expect("carve stack region");
        let frames_region = arena
            .carve(settings.frame_count * FRAME_SIZE)
            .expect("carve frame region");

        let table = ObjectTable::new(&arena, &mut live).expect("object table");
        let strings = Strings::new(&arena, &mut live).expect("string index");
        let globals = Globals::new(&arena, &mut live).expect("globals index");
        let stack = TriStack::new(stack_region.start, settings.stack_slots);
        let frames = TriFrames::new(frames_region.start, settings.frame_count);

        Self {
            arena,
            settings,
            live,
            stack_region,
            frames_region,
            table,
            stack,
            frames,
            strings,
            globals,
            frozen_prev: Vec::new(),
            frozen_old: Vec::new(),
            cycles: 0,
        }
    }

    // ── Objects ───────────────────────────────────────────────────────

    pub fn intern(&mut self, text: &str) -> Result<Oid, ArenaError> {
        self.strings
            .intern(&self.arena, &mut self.live, &mut self.table, text)
    }

    pub fn alloc_bytes(
        &mut self,
        data: &[u8],
    ) -> Result<Id<BytesObj>, ArenaError> {
        let off = object::alloc_bytes(&self.arena, &mut self.live, data)?;
        let oid = self.table.add(&self.arena, &mut self.live, off)?;
        Ok(Id::new(oid))
    }

    pub fn new_class(&mut self, name: &str) -> Result<Id<ClassObj>, ArenaError> {
        self.intern(name)?;
        let off =
            object::alloc_class(&self.arena, &mut self.live, intern_key(name))?;
        let oid = self.table.add(&self.arena, &mut self.live, off)?;
        Ok(Id::new(oid))
    }

    pub fn new_instance(
        &mut self,
        class: Id<ClassObj>,
    ) -> Result<Id<InstanceObj>, ArenaError> {
        let off =
            object::alloc_instance(&self.arena, &mut self.live, class.oid())?;
        let oid = self.table.add(&self.arena, &mut self.live, off)?;
        Ok(Id::new(oid))
    }

    /// Resolve a logical reference to a raw one through the object table.
    #[must_use]
    pub fn resolve<T>(&self, id: Id<T>) -> Option<Ref<T>> {
        self.table.lookup(&self.arena, id.oid()).map(Ref::new)
    }

    #[must_use]
    pub fn bytes_of(&self, id: Id<BytesObj>) -> Option<&[u8]> {
        let raw = self.resolve(id)?;
        Some(object::bytes_at(&self.arena, raw.off()))
    }

    pub fn drop_object(&mut self, oid: Oid) -> Result<(), ArenaError> {
        self.table.invalidate(&self.arena, &mut self.live, oid)
    }

    /// Bind `selector` in a class's nested map, deriving a mutable copy of
    /// the class first if it is frozen.
    pub fn class_define(
        &mut self,
        class: Id<ClassObj>,
        selector: &str,
        value: Value,
    ) -> Result<(), ArenaError> {
        self.intern(selector)?;
        self.nested_insert(class.oid(), intern_key(selector), value.raw())
    }

    /// Delete `selector` going forward: a nested tombstone, honored by the
    /// structural merge at compaction time.
    pub fn class_undefine(
        &mut self,
        class: Id<ClassObj>,
        selector: &str,
    ) -> Result<(), ArenaError> {
        self.nested_insert(class.oid(), intern_key(selector), NULL_OFF)
    }

    #[must_use]
    pub fn class_lookup(
        &self,
        class: Id<ClassObj>,
        selector: &str,
    ) -> Option<Value> {
        self.nested_lookup(class.oid(), intern_key(selector))
    }

    pub fn instance_set(
        &mut self,
        instance: Id<InstanceObj>,
        field: &str,
        value: Value,
    ) -> Result<(), ArenaError> {
        self.intern(field)?;
        self.nested_insert(instance.oid(), intern_key(field), value.raw())
    }

    #[must_use]
    pub fn instance_get(
        &self,
        instance: Id<InstanceObj>,
        field: &str,
    ) -> Option<Value> {
        self.nested_lookup(instance.oid(), intern_key(field))
    }

    fn nested_insert(
        &mut self,
        oid: Oid,
        key: u64,
        raw: u64,
    ) -> Result<(), ArenaError> {
        let off =
            self.table
                .resolve_mutable(&self.arena, &mut self.live, oid)?;
        let slots = object::slot_tree(&self.arena, off)
            .expect("nested insert into a kind without a slot tree");

        let _pin = ScopedPin::enter(&self.arena, off);
        let before = slots.owned_bytes(&self.arena) as i64;
        slots.insert(&self.arena, &mut self.live, &SLOT_DESC, key, raw)?;
        let after = slots.owned_bytes(&self.arena) as i64;
        // the object's cached footprint in the table follows its nested map
        self.table.cur.adjust_ext(&self.arena, after - before);
        Ok(())
    }

    fn nested_lookup(&self, oid: Oid, key: u64) -> Option<Value> {
        let off = self.table.lookup(&self.arena, oid)?;
        let slots = object::slot_tree(&self.arena, off)?;
        let raw = slots.lookup(&self.arena, &SLOT_DESC, key)?;
        (raw != NULL_OFF).then(|| Value::from_raw(raw))
    }

    // ── Globals ───────────────────────────────────────────────────────

    pub fn global_set(
        &mut self,
        name: &str,
        value: Value,
    ) -> Result<(), ArenaError> {
        self.intern(name)?;
        self.globals
            .set(&self.arena, &mut self.live, intern_key(name), value)
    }

    #[must_use]
    pub fn global_get(&self, name: &str) -> Option<Value> {
        self.globals.get(&self.arena, intern_key(name))
    }

    pub fn global_unset(&mut self, name: &str) -> Result<(), ArenaError> {
        self.globals
            .unset(&self.arena, &mut self.live, intern_key(name))
    }

    // ── Stack and frames ──────────────────────────────────────────────

    pub fn push(&mut self, value: Value) {
        self.stack.push(&self.arena, value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop(&self.arena)
    }

    pub fn enter_frame(&mut self, callee: Oid, locals: u64) {
        let frame = Frame {
            callee: callee.raw(),
            ip: 0,
            stack_base: self.stack.depth() as u64,
            locals,
        };
        self.frames.enter(&self.arena, frame);
    }

    /// Return from the current call: migrate the parent frame into the
    /// mutable window if needed, then rebase the stack so the parent's
    /// slot range is contiguous and writable again.
    pub fn leave_frame(&mut self) -> Option<Frame> {
        let parent = self.frames.leave(&self.arena)?;
        self.stack.rebase_to(&self.arena, parent.stack_base as usize);
        Some(parent)
    }

    // ── Generations ───────────────────────────────────────────────────

    /// Rotation policy: the mutable generation of every structure freezes
    /// into the previous one, the previous ages into the oldest, and a
    /// fresh mutable generation is carved. Compacts first when both frozen
    /// tiers are already occupied.
    pub fn freeze(&mut self) -> Result<(), ArenaError> {
        if !self.frozen_old.is_empty() {
            self.compact()?;
        }

        let new_live = self.arena.carve(self.settings.live_region_size)?;
        let old_live = mem::replace(&mut self.live, new_live);

        let fresh_table = Tree::create(&self.arena, &mut self.live)?;
        let fresh_strings = Tree::create(&self.arena, &mut self.live)?;
        let fresh_globals = Tree::create(&self.arena, &mut self.live)?;
        self.table.rotate(fresh_table);
        self.strings.rotate(fresh_strings);
        self.globals.rotate(fresh_globals);

        let new_stack =
            self.arena.carve(self.settings.stack_slots * SLOT)?;
        let old_stack = mem::replace(&mut self.stack_region, new_stack);
        self.stack.rotate(new_stack.start);

        let new_frames =
            self.arena.carve(self.settings.frame_count * FRAME_SIZE)?;
        let old_frames = mem::replace(&mut self.frames_region, new_frames);
        self.frames.rotate(new_frames.start);

        self.frozen_old = mem::take(&mut self.frozen_prev);
        self.frozen_prev = vec![old_live, old_stack, old_frames];
        self.cycles += 1;

        debug!(
            "froze generation (cycle {}, {} bytes frozen)",
            self.cycles,
            self.frozen_footprint()
        );
        Ok(())
    }

    /// Frozen index ranges of a windowed structure, clamped below the
    /// mutable boundary.
    fn frozen_ranges(
        prev_base: u64,
        prev_idx: usize,
        old_base: u64,
        old_idx: usize,
        cur_idx: usize,
    ) -> (FrozenRange, FrozenRange) {
        let prev_range = FrozenRange {
            base: prev_base,
            base_idx: prev_idx,
            len: cur_idx.saturating_sub(prev_idx),
        };
        let old_end = prev_idx.min(cur_idx);
        let old_range = FrozenRange {
            base: old_base,
            base_idx: old_idx,
            len: old_end.saturating_sub(old_idx),
        };
        (prev_range, old_range)
    }

    fn frozen_footprint(&self) -> usize {
        let trees = [
            self.table.prev,
            self.table.old,
            self.strings.prev,
            self.strings.old,
            self.globals.prev,
            self.globals.old,
        ];
        let tree_bytes: usize =
            trees.iter().map(|t| t.owned_bytes(&self.arena)).sum();
        let window_bytes = self.stack.cur.base_idx * SLOT
            + self.frames.cur.base_idx * FRAME_SIZE;
        tree_bytes + window_bytes
    }

    /// Merge the two frozen generations of every structure into one fresh
    /// region and install the result as the single frozen generation.
    pub fn compact(&mut self) -> Result<(), ArenaError> {
        let dest_size = (self.frozen_footprint() * 2 + 64 * 1024)
            .min(self.arena.size());
        let dest = self.arena.carve(dest_size)?;

        let (stack_prev, stack_old) = Self::frozen_ranges(
            self.stack.prev.base,
            self.stack.prev.base_idx,
            self.stack.old.base,
            self.stack.old.base_idx,
            self.stack.cur.base_idx,
        );
        let (frames_prev, frames_old) = Self::frozen_ranges(
            self.frames.prev.base,
            self.frames.prev.base_idx,
            self.frames.old.base,
            self.frames.old.base_idx,
            self.frames.cur.base_idx,
        );

        let req = CompactRequest {
            table: GenRoots {
                prev: self.table.prev,
                old: self.table.old,
            },
            strings: GenRoots {
                prev: self.strings.prev,
                old: self.strings.old,
            },
            globals: GenRoots {
                prev: self.globals.prev,
                old: self.globals.old,
            },
            stack_prev,
            stack_old,
            frames_prev,
            frames_old,
        };

        let (resp, dest_used, stats) =
            Compactor::new(&self.arena, dest).run(&req);

        let empty_table = Tree::create(&self.arena, &mut self.live)?;
        let empty_strings = Tree::create(&self.arena, &mut self.live)?;
        let empty_globals = Tree::create(&self.arena, &mut self.live)?;
        self.table.install_compacted(resp.table, empty_table);
        self.strings.install_compacted(resp.strings, empty_strings);
        self.globals.install_compacted(resp.globals, empty_globals);
        self.stack.install_compacted(resp.stack.window());
        self.frames.install_compacted(resp.frames.window());

        for region in self
            .frozen_old
            .drain(..)
            .chain(self.frozen_prev.drain(..))
        {
            self.arena.release(region);
        }
        self.frozen_prev.push(dest_used);

        info!(
            "compacted: {} objects copied, {} merged, {} bytes moved",
            stats.objects_copied, stats.objects_merged, stats.bytes_moved
        );
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    #[inline]
    #[must_use]
    pub fn live_remaining(&self) -> usize {
        self.live.remaining()
    }
}
