use crate::arena::{Arena, ArenaError, NULL_OFF, Region};
use crate::refs::Value;
use crate::tree::{self, Tree, TreeDesc};

fn render_key(_arena: &Arena, key: u64) -> String {
    format!("{key:#018x}")
}

fn render_value(_arena: &Arena, raw: u64) -> String {
    format!("{:?}", Value::from_raw(raw))
}

pub static GLOBALS_DESC: TreeDesc = TreeDesc {
    name: "globals",
    cmp: tree::cmp_u64,
    render_key,
    render_val: render_value,
    key_ext: tree::ext_zero,
    val_ext: tree::ext_zero,
};

/// The global-variable index: interned name key to [`Value`], across three
/// generations with the same tombstone-masking cascade as the object
/// table.
#[derive(Debug)]
pub struct Globals {
    pub cur: Tree,
    pub prev: Tree,
    pub old: Tree,
}

impl Globals {
    pub fn new(arena: &Arena, region: &mut Region) -> Result<Self, ArenaError> {
        Ok(Self {
            cur: Tree::create(arena, region)?,
            prev: Tree::create(arena, region)?,
            old: Tree::create(arena, region)?,
        })
    }

    pub fn set(
        &mut self,
        arena: &Arena,
        region: &mut Region,
        key: u64,
        value: Value,
    ) -> Result<(), ArenaError> {
        debug_assert!(!value.is_null(), "the empty cell is the unset marker");
        self.cur.insert(arena, region, &GLOBALS_DESC, key, value.raw())
    }

    #[must_use]
    pub fn get(&self, arena: &Arena, key: u64) -> Option<Value> {
        for tree in [self.cur, self.prev, self.old] {
            if let Some(raw) = tree.lookup(arena, &GLOBALS_DESC, key) {
                return (raw != NULL_OFF).then(|| Value::from_raw(raw));
            }
        }
        None
    }

    /// Remove the binding going forward; frozen generations keep theirs.
    pub fn unset(
        &mut self,
        arena: &Arena,
        region: &mut Region,
        key: u64,
    ) -> Result<(), ArenaError> {
        self.cur.insert(arena, region, &GLOBALS_DESC, key, NULL_OFF)
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

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        arena: Arena,
        region: Region,
    }

    impl Fixture {
        fn new() -> Self {
            let arena = Arena::new(1024 * 1024).expect("map arena");
            let region = arena.carve(256 * 1024).expect("carve region");
            Self { arena, region }
        }

        fn rotate(&mut self, globals: &mut Globals) {
            let fresh =
                Tree::create(&self.arena, &mut self.region).expect("tree");
            globals.rotate(fresh);
        }
    }

    #[test]
    fn set_get_and_shadowing_across_generations() {
        let mut fx = Fixture::new();
        let mut globals =
            Globals::new(&fx.arena, &mut fx.region).expect("globals");

        globals
            .set(&fx.arena, &mut fx.region, 1, Value::from_i64(10))
            .expect("set");
        fx.rotate(&mut globals);

        assert_eq!(globals.get(&fx.arena, 1), Some(Value::from_i64(10)));

        globals
            .set(&fx.arena, &mut fx.region, 1, Value::from_i64(20))
            .expect("set");
        assert_eq!(
            globals.get(&fx.arena, 1),
            Some(Value::from_i64(20)),
            "mutable generation must shadow the frozen binding"
        );
    }

    #[test]
    fn unset_masks_frozen_bindings() {
        let mut fx = Fixture::new();
        let mut globals =
            Globals::new(&fx.arena, &mut fx.region).expect("globals");

        globals
            .set(&fx.arena, &mut fx.region, 7, Value::from_i64(0))
            .expect("set");
        fx.rotate(&mut globals);

        globals.unset(&fx.arena, &mut fx.region, 7).expect("unset");
        assert_eq!(
            globals.get(&fx.arena, 7),
            None,
            "tombstone must mask the frozen binding"
        );
        assert_eq!(globals.get(&fx.arena, 8), None);
    }

    #[test]
    fn fixnum_zero_is_a_real_value_not_a_tombstone() {
        let mut fx = Fixture::new();
        let mut globals =
            Globals::new(&fx.arena, &mut fx.region).expect("globals");

        globals
            .set(&fx.arena, &mut fx.region, 3, Value::from_i64(0))
            .expect("set");
        assert_eq!(globals.get(&fx.arena, 3), Some(Value::from_i64(0)));
    }
}
