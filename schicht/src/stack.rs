use std::mem;

use crate::arena::Arena;
use crate::refs::Value;

pub const SLOT: usize = mem::size_of::<Value>();

/// One generation's index range: `base` is the arena offset of the slot at
/// `base_idx`. Ranges are contiguous and ordered old ≤ prev ≤ cur by index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub base: u64,
    pub base_idx: usize,
}

/// The evaluation stack, windowed across three generations.
///
/// Only the `cur` window is ever written. Logical indices at or above
/// `cur.base_idx` live in the current mutable region; below that they fall
/// into whichever frozen window's range contains them. The mutable region
/// is sized to full capacity so the window boundary can move down (pop
/// clamping, rebase migration) without shifting any data.
#[derive(Debug)]
pub struct TriStack {
    pub cur: Window,
    pub prev: Window,
    pub old: Window,
    depth: usize,
    capacity: usize,
}

#[inline]
fn read(arena: &Arena, off: u64) -> Value {
    // SAFETY: off addresses a live stack slot
    unsafe { *(arena.ptr(off) as *const Value) }
}

#[inline]
fn write(arena: &Arena, off: u64, value: Value) {
    // SAFETY: off addresses a slot in the mutable window
    unsafe {
        *(arena.ptr(off) as *mut Value) = value;
    }
}

impl TriStack {
    #[must_use]
    pub fn new(region_start: u64, capacity: usize) -> Self {
        let empty = Window {
            base: region_start,
            base_idx: 0,
        };
        Self {
            cur: empty,
            prev: empty,
            old: empty,
            depth: 0,
            capacity,
        }
    }

    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Arena offset of the slot holding logical index `idx`.
    #[must_use]
    pub fn slot_off(&self, idx: usize) -> u64 {
        let window = if idx >= self.cur.base_idx {
            self.cur
        } else if idx >= self.prev.base_idx {
            self.prev
        } else {
            self.old
        };
        window.base + ((idx - window.base_idx) * SLOT) as u64
    }

    #[must_use]
    pub fn get(&self, arena: &Arena, idx: usize) -> Value {
        debug_assert!(idx < self.depth, "reading above the stack top");
        read(arena, self.slot_off(idx))
    }

    /// Writes must land in the mutable window; rebase first if the slot is
    /// still frozen.
    pub fn set(&self, arena: &Arena, idx: usize, value: Value) {
        debug_assert!(idx < self.depth, "writing above the stack top");
        debug_assert!(
            idx >= self.cur.base_idx,
            "writing into a frozen stack window"
        );
        write(arena, self.slot_off(idx), value);
    }

    /// Capacity is the caller's contract; overflow is reported as a
    /// depth-limit error by the interpreter, not checked here.
    pub fn push(&mut self, arena: &Arena, value: Value) {
        debug_assert!(self.depth < self.capacity, "stack overflow");
        let off =
            self.cur.base + ((self.depth - self.cur.base_idx) * SLOT) as u64;
        write(arena, off, value);
        self.depth += 1;
    }

    pub fn pop(&mut self, arena: &Arena) -> Option<Value> {
        if self.depth == 0 {
            return None;
        }
        let top = self.depth - 1;
        let value = read(arena, self.slot_off(top));
        self.depth = top;
        self.clamp();
        Some(value)
    }

    pub fn discard(&mut self, n: usize) {
        debug_assert!(n <= self.depth, "discarding below the stack bottom");
        self.depth -= n;
        self.clamp();
    }

    /// The mutable base index never exceeds the depth.
    fn clamp(&mut self) {
        if self.cur.base_idx > self.depth {
            let delta = self.cur.base_idx - self.depth;
            self.cur.base -= (delta * SLOT) as u64;
            self.cur.base_idx = self.depth;
        }
    }

    /// Migrate the slot range `[idx, cur.base_idx)` out of the frozen
    /// windows into the mutable region and lower the window boundary, so
    /// that everything from `idx` up is contiguous and writable again.
    pub fn rebase_to(&mut self, arena: &Arena, idx: usize) {
        if idx >= self.cur.base_idx {
            return;
        }
        for slot in idx..self.cur.base_idx {
            let src = self.slot_off(slot);
            let dst = self.cur.base
                - ((self.cur.base_idx - slot) * SLOT) as u64;
            write(arena, dst, read(arena, src));
        }
        let delta = self.cur.base_idx - idx;
        self.cur.base -= (delta * SLOT) as u64;
        self.cur.base_idx = idx;
    }

    /// Generation rotation: the mutable window freezes into `prev`, `prev`
    /// ages into `old`, and a fresh full-capacity region becomes mutable
    /// with its boundary at the current depth.
    pub fn rotate(&mut self, fresh_region_start: u64) {
        self.old = self.prev;
        self.prev = self.cur;
        self.cur = Window {
            base: fresh_region_start + (self.depth * SLOT) as u64,
            base_idx: self.depth,
        };
    }

    /// Install a compaction result: the merged window replaces both frozen
    /// generations (the old range becomes empty).
    pub fn install_compacted(&mut self, merged: Window) {
        self.prev = merged;
        self.old = merged;
    }
}
