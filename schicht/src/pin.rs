use crate::arena::Arena;

/// Lexically scoped marker for the oldest arena offset whose raw pointer is
/// currently held on the call stack.
///
/// Entering a pin lowers the arena's pin floor to the pinned offset; leaving
/// restores the previous floor. The pin moves no memory itself.
/// [`Arena::release`] debug-asserts against the floor so that a frozen
/// region cannot be recycled out from under a live pointer.
#[derive(Debug)]
pub struct ScopedPin<'a> {
    arena: &'a Arena,
    prev: u64,
}

impl<'a> ScopedPin<'a> {
    pub fn enter(arena: &'a Arena, off: u64) -> Self {
        let prev = arena.pin_floor();
        arena.set_pin_floor(prev.min(off));
        Self { arena, prev }
    }
}

impl Drop for ScopedPin<'_> {
    fn drop(&mut self) {
        self.arena.set_pin_floor(self.prev);
    }
}
