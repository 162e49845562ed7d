use std::mem;

use crate::arena::Arena;
use crate::stack::Window;

pub const FRAME_SIZE: usize = mem::size_of::<Frame>();

/// One call activation record. All fields are identifiers or plain
/// integers, so a frame can be copied byte-for-byte across generation
/// boundaries without fixups.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Raw identifier of the executing method's owner.
    pub callee: u64,
    /// Instruction pointer within the callee's code.
    pub ip: u64,
    /// First evaluation-stack slot belonging to this activation.
    pub stack_base: u64,
    /// Local slot count of this activation.
    pub locals: u64,
}

/// The call-frame list, windowed across three generations exactly like the
/// evaluation stack, with frame-sized elements.
///
/// Leaving a call whose parent is frozen migrates the parent record into
/// the mutable window, so the executing frame is always writable.
#[derive(Debug)]
pub struct TriFrames {
    pub cur: Window,
    pub prev: Window,
    pub old: Window,
    count: usize,
    capacity: usize,
}

#[inline]
fn read(arena: &Arena, off: u64) -> Frame {
    // SAFETY: off addresses a live frame record
    unsafe { *(arena.ptr(off) as *const Frame) }
}

#[inline]
fn write(arena: &Arena, off: u64, frame: Frame) {
    // SAFETY: off addresses a frame slot in the mutable window
    unsafe {
        *(arena.ptr(off) as *mut Frame) = frame;
    }
}

impl TriFrames {
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
            count: 0,
            capacity,
        }
    }

    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn frame_off(&self, idx: usize) -> u64 {
        let window = if idx >= self.cur.base_idx {
            self.cur
        } else if idx >= self.prev.base_idx {
            self.prev
        } else {
            self.old
        };
        window.base + ((idx - window.base_idx) * FRAME_SIZE) as u64
    }

    #[must_use]
    pub fn get(&self, arena: &Arena, idx: usize) -> Frame {
        debug_assert!(idx < self.count, "reading above the frame top");
        read(arena, self.frame_off(idx))
    }

    /// The executing frame, if any call is active.
    #[must_use]
    pub fn current(&self, arena: &Arena) -> Option<Frame> {
        if self.count == 0 {
            return None;
        }
        Some(self.get(arena, self.count - 1))
    }

    /// Update the executing frame in place. It is always in the mutable
    /// window; `leave` migrates it there on every boundary crossing.
    pub fn set_current(&self, arena: &Arena, frame: Frame) {
        debug_assert!(self.count > 0, "no active frame");
        let idx = self.count - 1;
        debug_assert!(
            idx >= self.cur.base_idx,
            "executing frame left outside the mutable window"
        );
        write(arena, self.frame_off(idx), frame);
    }

    /// Capacity is the caller's contract, as for the stack.
    pub fn enter(&mut self, arena: &Arena, frame: Frame) {
        debug_assert!(self.count < self.capacity, "frame list overflow");
        let off = self.cur.base
            + ((self.count - self.cur.base_idx) * FRAME_SIZE) as u64;
        write(arena, off, frame);
        self.count += 1;
    }

    /// Return from the current call. If the parent frame is still frozen
    /// it is copied byte-for-byte into the mutable window and the window
    /// boundary lowered to its index, so execution can resume writing it.
    /// Returns the parent frame, or `None` when the list empties.
    pub fn leave(&mut self, arena: &Arena) -> Option<Frame> {
        debug_assert!(self.count > 0, "leaving with no active frame");
        self.count -= 1;
        if self.count == 0 {
            self.clamp();
            return None;
        }

        let parent_idx = self.count - 1;
        if parent_idx < self.cur.base_idx {
            let parent = read(arena, self.frame_off(parent_idx));
            let dst = self.cur.base
                - ((self.cur.base_idx - parent_idx) * FRAME_SIZE) as u64;
            write(arena, dst, parent);
            let delta = self.cur.base_idx - parent_idx;
            self.cur.base -= (delta * FRAME_SIZE) as u64;
            self.cur.base_idx = parent_idx;
        }
        self.clamp();
        Some(read(arena, self.frame_off(parent_idx)))
    }

    fn clamp(&mut self) {
        if self.cur.base_idx > self.count {
            let delta = self.cur.base_idx - self.count;
            self.cur.base -= (delta * FRAME_SIZE) as u64;
            self.cur.base_idx = self.count;
        }
    }

    /// Generation rotation, mirroring the evaluation stack.
    pub fn rotate(&mut self, fresh_region_start: u64) {
        self.old = self.prev;
        self.prev = self.cur;
        self.cur = Window {
            base: fresh_region_start + (self.count * FRAME_SIZE) as u64,
            base_idx: self.count,
        };
    }

    pub fn install_compacted(&mut self, merged: Window) {
        self.prev = merged;
        self.old = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Region;

    fn frame(callee: u64, ip: u64) -> Frame {
        Frame {
            callee,
            ip,
            stack_base: 0,
            locals: 0,
        }
    }

    struct Fixture {
        arena: Arena,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                arena: Arena::new(1024 * 1024).expect("map arena"),
            }
        }

        fn region(&self, frames: usize) -> Region {
            self.arena
                .carve(frames * FRAME_SIZE)
                .expect("carve frame region")
        }
    }

    #[test]
    fn enter_and_leave_track_the_current_frame() {
        let fx = Fixture::new();
        let region = fx.region(8);
        let mut frames = TriFrames::new(region.start, 8);

        frames.enter(&fx.arena, frame(1, 0));
        frames.enter(&fx.arena, frame(2, 0));
        assert_eq!(frames.current(&fx.arena), Some(frame(2, 0)));

        assert_eq!(frames.leave(&fx.arena), Some(frame(1, 0)));
        assert_eq!(frames.leave(&fx.arena), None);
        assert_eq!(frames.count(), 0);
    }

    #[test]
    fn leaving_within_the_mutable_window_migrates_nothing() {
        let fx = Fixture::new();
        let region = fx.region(8);
        let mut frames = TriFrames::new(region.start, 8);

        frames.enter(&fx.arena, frame(1, 0));
        frames.enter(&fx.arena, frame(2, 0));
        let base_before = frames.cur;
        frames.leave(&fx.arena);
        assert_eq!(frames.cur, base_before, "no boundary crossing, no change");
    }

    #[test]
    fn leaving_across_the_boundary_migrates_the_parent_into_the_mutable_window() {
        let fx = Fixture::new();
        let first = fx.region(8);
        let mut frames = TriFrames::new(first.start, 8);

        frames.enter(&fx.arena, frame(1, 11));
        frames.enter(&fx.arena, frame(2, 22));

        let second = fx.region(8);
        frames.rotate(second.start);
        frames.enter(&fx.arena, frame(3, 33));

        // return through the generation boundary
        let parent = frames.leave(&fx.arena).expect("parent");
        assert_eq!(parent, frame(2, 22));
        assert_eq!(
            frames.cur.base_idx, 1,
            "boundary must be lowered to the parent's index"
        );

        // the parent is now mutable; writing it must not touch the frozen copy
        frames.set_current(&fx.arena, frame(2, 99));
        let frozen = read(&fx.arena, first.start + FRAME_SIZE as u64);
        assert_eq!(frozen, frame(2, 22), "frozen record must stay intact");
        assert_eq!(frames.current(&fx.arena), Some(frame(2, 99)));
    }

    #[test]
    fn migration_happens_once_per_boundary_crossing() {
        let fx = Fixture::new();
        let first = fx.region(8);
        let mut frames = TriFrames::new(first.start, 8);

        frames.enter(&fx.arena, frame(1, 0));
        frames.enter(&fx.arena, frame(2, 0));
        let second = fx.region(8);
        frames.rotate(second.start);
        frames.enter(&fx.arena, frame(3, 0));

        frames.leave(&fx.arena);
        let after_first = frames.cur;
        frames.enter(&fx.arena, frame(4, 0));
        frames.leave(&fx.arena);
        assert_eq!(
            frames.cur, after_first,
            "re-crossing an already-migrated index must not migrate again"
        );
    }
}
