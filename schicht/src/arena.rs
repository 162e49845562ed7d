use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

use crate::system::{map_memory, round_up_to_page, unmap_memory};

/// Offset 0 is the null sentinel; no allocation ever starts there.
pub const NULL_OFF: u64 = 0;

/// Every record the heap stores is word-aligned.
pub const WORD: usize = 8;

const ARENA_BASE: u64 = 16;

/// No pin active.
pub(crate) const PIN_NONE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// The arena (or a region carved from it) has no room left.
    Exhausted { requested: usize },
    /// Growing a mapped arena while live offsets exist is not supported;
    /// the replacement path is compaction into a fresh region.
    GrowthUnsupported,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { requested } => {
                write!(f, "arena exhausted (requested {requested} bytes)")
            }
            Self::GrowthUnsupported => {
                write!(f, "arena growth while in use is not supported")
            }
        }
    }
}

impl std::error::Error for ArenaError {}

/// A contiguous, mmap-backed byte space addressed by integer offsets.
///
/// Offsets are only meaningful relative to the arena instance that produced
/// them and must not cross threads. All structures of one heap live here so
/// the whole state is relocatable as one block.
#[derive(Debug)]
pub struct Arena {
    start: NonNull<u8>,
    size: usize,
    cursor: Cell<u64>,
    /// Released ranges `(start, len)`, kept sorted by start and coalesced.
    free: RefCell<Vec<(u64, u64)>>,
    /// Lowest offset whose raw pointer is currently held on the call
    /// stack, see [`crate::pin::ScopedPin`]. `PIN_NONE` while unpinned.
    pin_floor: Cell<u64>,
}

// SAFETY: the arena owns its mapping exclusively; a heap and its arena are
// only ever used by the thread that owns them.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(size: usize) -> Result<Self, ArenaError> {
        let size = round_up_to_page(size);
        let start =
            map_memory(size).ok_or(ArenaError::Exhausted { requested: size })?;
        Ok(Self {
            start,
            size,
            cursor: Cell::new(ARENA_BASE),
            free: RefCell::new(Vec::new()),
            pin_floor: Cell::new(PIN_NONE),
        })
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Translate an offset to a raw pointer into this arena.
    #[inline]
    #[must_use]
    pub fn ptr(&self, off: u64) -> *mut u8 {
        debug_assert!(off != NULL_OFF, "dereferencing the null offset");
        debug_assert!(
            (off as usize) < self.size,
            "offset {off} outside arena of {} bytes",
            self.size
        );
        // SAFETY: off is within the mapping, checked above in debug builds
        unsafe { self.start.as_ptr().add(off as usize) }
    }

    /// Carve a region for one batch of writes.
    ///
    /// Released ranges are reused first-fit before fresh space is taken
    /// from the top cursor.
    pub fn carve(&self, size: usize) -> Result<Region, ArenaError> {
        let size = size.next_multiple_of(WORD);

        let mut free = self.free.borrow_mut();
        for idx in 0..free.len() {
            let (start, len) = free[idx];
            if (len as usize) >= size {
                if (len as usize) == size {
                    free.remove(idx);
                } else {
                    free[idx] = (start + size as u64, len - size as u64);
                }
                return Ok(Region::new(start, size));
            }
        }
        drop(free);

        let start = self.cursor.get();
        let end = start + size as u64;
        if end > self.size as u64 {
            return Err(ArenaError::Exhausted { requested: size });
        }
        self.cursor.set(end);
        Ok(Region::new(start, size))
    }

    /// Return a superseded generation's region for reuse.
    pub fn release(&self, region: Region) {
        debug_assert!(
            self.pin_floor.get() < region.start
                || self.pin_floor.get() >= region.end,
            "releasing a region while a pinned pointer into it is live"
        );

        let mut free = self.free.borrow_mut();
        let pos = free
            .iter()
            .position(|&(start, _)| start > region.start)
            .unwrap_or(free.len());
        free.insert(pos, (region.start, region.end - region.start));

        // coalesce with neighbours
        if pos + 1 < free.len() {
            let (start, len) = free[pos];
            let (next_start, next_len) = free[pos + 1];
            if start + len == next_start {
                free[pos] = (start, len + next_len);
                free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev_start, prev_len) = free[pos - 1];
            let (start, len) = free[pos];
            if prev_start + prev_len == start {
                free[pos - 1] = (prev_start, prev_len + len);
                free.remove(pos);
            }
        }
    }

    /// Growing the mapping while offsets into it are live would require a
    /// full offset rewrite; the supported path is compaction into a fresh
    /// region instead.
    pub fn grow(&self, _additional: usize) -> Result<(), ArenaError> {
        Err(ArenaError::GrowthUnsupported)
    }

    #[inline]
    pub(crate) fn pin_floor(&self) -> u64 {
        self.pin_floor.get()
    }

    #[inline]
    pub(crate) fn set_pin_floor(&self, floor: u64) {
        self.pin_floor.set(floor);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unmap_memory(self.start, self.size);
    }
}

/// A bump-allocated sub-range of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub cursor: u64,
    pub end: u64,
}

impl Region {
    #[must_use]
    pub fn new(start: u64, size: usize) -> Self {
        Self {
            start,
            cursor: start,
            end: start + size as u64,
        }
    }

    /// Allocate `size` bytes out of this region.
    pub fn alloc(&mut self, size: usize) -> Result<u64, ArenaError> {
        let size = size.next_multiple_of(WORD);
        let off = self.cursor;
        let next = off + size as u64;
        if next > self.end {
            return Err(ArenaError::Exhausted { requested: size });
        }
        self.cursor = next;
        Ok(off)
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        (self.end - self.cursor) as usize
    }

    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        (self.cursor - self.start) as usize
    }
}
