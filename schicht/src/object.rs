use std::mem;
use std::ptr;

use bitflags::bitflags;

use crate::arena::{Arena, ArenaError, NULL_OFF, Region};
use crate::pin::ScopedPin;
use crate::refs::{Oid, Value};
use crate::tree::{self, Tree, TreeDesc};

/// Object kind tag stored in the header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Variable-length byte payload (interned string storage).
    Bytes = 1,
    /// Class: interned name plus a nested selector map.
    Class = 2,
    /// Instance: class identifier plus a nested field map.
    Instance = 3,
}

impl Kind {
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Bytes),
            2 => Some(Self::Class),
            3 => Some(Self::Instance),
            _ => None,
        }
    }

    /// Kinds owning a nested key map opt into structural merging at
    /// compaction time; everything else is masked whole.
    #[must_use]
    pub fn has_slot_tree(self) -> bool {
        matches!(self, Self::Class | Self::Instance)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjFlags: u8 {
        /// Copy-on-write copy derived from a frozen generation.
        const DERIVED = 1 << 0;
        /// Built by a structural merge during compaction.
        const MERGED = 1 << 1;
    }
}

/// Fixed front matter of every heap object.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Header {
    kind: u8,
    flags: u8,
    _pad: u16,
    size: u32,
}

impl Header {
    #[must_use]
    pub fn new(kind: Kind, size: usize) -> Self {
        debug_assert!(size <= u32::MAX as usize);
        Self {
            kind: kind as u8,
            flags: 0,
            _pad: 0,
            size: size as u32,
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> Kind {
        Kind::from_u8(self.kind).expect("corrupt object header kind")
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> ObjFlags {
        ObjFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn insert_flags(&mut self, flags: ObjFlags) {
        self.flags |= flags.bits();
    }

    /// Total allocation size in bytes, header included.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size as usize
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct BytesObj {
    pub header: Header,
    pub len: u64,
    // payload bytes follow
}

#[repr(C)]
#[derive(Debug)]
pub struct ClassObj {
    pub header: Header,
    /// Interned name key.
    pub name: u64,
    /// Offset of the nested selector tree header.
    pub slots: u64,
}

#[repr(C)]
#[derive(Debug)]
pub struct InstanceObj {
    pub header: Header,
    /// Raw identifier of the class object.
    pub class: u64,
    /// Offset of the nested field tree header.
    pub slots: u64,
}

fn render_slot_val(_arena: &Arena, raw: u64) -> String {
    format!("{:?}", Value::from_raw(raw))
}

/// Nested selector/field maps of classes and instances: interned key to
/// [`Value`], nothing externally owned per entry.
pub static SLOT_DESC: TreeDesc = TreeDesc {
    name: "slots",
    cmp: tree::cmp_u64,
    render_key: tree::render_u64,
    render_val: render_slot_val,
    key_ext: tree::ext_zero,
    val_ext: tree::ext_zero,
};

#[inline]
#[must_use]
pub fn header_at<'a>(arena: &'a Arena, off: u64) -> &'a Header {
    // SAFETY: every object offset starts with a Header
    unsafe { &*(arena.ptr(off) as *const Header) }
}

#[inline]
#[must_use]
pub fn header_at_mut<'a>(arena: &'a Arena, off: u64) -> &'a mut Header {
    // SAFETY: every object offset starts with a Header
    unsafe { &mut *(arena.ptr(off) as *mut Header) }
}

#[inline]
#[must_use]
pub fn kind_at(arena: &Arena, off: u64) -> Kind {
    header_at(arena, off).kind()
}

#[must_use]
pub fn bytes_at<'a>(arena: &'a Arena, off: u64) -> &'a [u8] {
    debug_assert_eq!(kind_at(arena, off), Kind::Bytes);
    // SAFETY: checked kind; payload follows the fixed record
    unsafe {
        let obj = &*(arena.ptr(off) as *const BytesObj);
        let data = arena.ptr(off).add(mem::size_of::<BytesObj>());
        std::slice::from_raw_parts(data, obj.len as usize)
    }
}

/// Nested key map of a mergeable object, if the kind carries one.
#[must_use]
pub fn slot_tree(arena: &Arena, off: u64) -> Option<Tree> {
    match kind_at(arena, off) {
        Kind::Bytes => None,
        Kind::Class => {
            // SAFETY: checked kind
            let class = unsafe { &*(arena.ptr(off) as *const ClassObj) };
            Some(Tree::from_off(class.slots))
        }
        Kind::Instance => {
            // SAFETY: checked kind
            let inst = unsafe { &*(arena.ptr(off) as *const InstanceObj) };
            Some(Tree::from_off(inst.slots))
        }
    }
}

pub(crate) fn set_slot_tree(arena: &Arena, off: u64, slots: Tree) {
    match kind_at(arena, off) {
        Kind::Bytes => unreachable!("bytes objects carry no slot tree"),
        Kind::Class => {
            // SAFETY: checked kind
            let class = unsafe { &mut *(arena.ptr(off) as *mut ClassObj) };
            class.slots = slots.off();
        }
        Kind::Instance => {
            // SAFETY: checked kind
            let inst = unsafe { &mut *(arena.ptr(off) as *mut InstanceObj) };
            inst.slots = slots.off();
        }
    }
}

/// Bytes transitively owned beyond the fixed record: the byte payload for
/// [`Kind::Bytes`], the nested tree's footprint for mergeable kinds.
///
/// This is the object table's value external-size callback, keyed on the
/// object kind.
#[must_use]
pub fn ext_size(arena: &Arena, off: u64) -> usize {
    if off == NULL_OFF {
        return 0;
    }
    match kind_at(arena, off) {
        Kind::Bytes => {
            // SAFETY: checked kind
            let obj = unsafe { &*(arena.ptr(off) as *const BytesObj) };
            obj.len as usize
        }
        Kind::Class | Kind::Instance => slot_tree(arena, off)
            .map(|slots| slots.owned_bytes(arena))
            .unwrap_or(0),
    }
}

pub fn alloc_bytes(
    arena: &Arena,
    region: &mut Region,
    data: &[u8],
) -> Result<u64, ArenaError> {
    let total = mem::size_of::<BytesObj>() + data.len();
    let off = region.alloc(total)?;
    // SAFETY: freshly allocated with room for record and payload
    unsafe {
        *(arena.ptr(off) as *mut BytesObj) = BytesObj {
            header: Header::new(Kind::Bytes, total),
            len: data.len() as u64,
        };
        let dst = arena.ptr(off).add(mem::size_of::<BytesObj>());
        ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
    }
    Ok(off)
}

pub fn alloc_class(
    arena: &Arena,
    region: &mut Region,
    name: u64,
) -> Result<u64, ArenaError> {
    let slots = Tree::create(arena, region)?;
    let total = mem::size_of::<ClassObj>();
    let off = region.alloc(total)?;
    // SAFETY: freshly allocated, correctly sized
    unsafe {
        *(arena.ptr(off) as *mut ClassObj) = ClassObj {
            header: Header::new(Kind::Class, total),
            name,
            slots: slots.off(),
        };
    }
    Ok(off)
}

pub fn alloc_instance(
    arena: &Arena,
    region: &mut Region,
    class: Oid,
) -> Result<u64, ArenaError> {
    let slots = Tree::create(arena, region)?;
    let total = mem::size_of::<InstanceObj>();
    let off = region.alloc(total)?;
    // SAFETY: freshly allocated, correctly sized
    unsafe {
        *(arena.ptr(off) as *mut InstanceObj) = InstanceObj {
            header: Header::new(Kind::Instance, total),
            class: class.raw(),
            slots: slots.off(),
        };
    }
    Ok(off)
}

/// Copy an object's full current contents into `region`.
///
/// Kinds owning a nested tree get a deep copy of that tree, never a shared
/// root: frozen generations stay byte-for-byte immutable, and the copy's
/// cached external size is rebuilt from scratch, so it cannot drift.
pub fn copy_object(
    arena: &Arena,
    region: &mut Region,
    off: u64,
) -> Result<u64, ArenaError> {
    let _pin = ScopedPin::enter(arena, off);

    let total = header_at(arena, off).size();
    let dst = region.alloc(total)?;
    // SAFETY: both offsets address `total` valid bytes; regions never overlap
    unsafe {
        ptr::copy_nonoverlapping(arena.ptr(off), arena.ptr(dst), total);
    }

    if let Some(src_slots) = slot_tree(arena, off) {
        let new_slots = Tree::create(arena, region)?;
        let mut entries = Vec::with_capacity(src_slots.len(arena));
        src_slots.for_each(arena, &mut |key, val| entries.push((key, val)));
        for (key, val) in entries {
            new_slots.insert(arena, region, &SLOT_DESC, key, val)?;
        }
        set_slot_tree(arena, dst, new_slots);
    }

    Ok(dst)
}

/// Copy-on-write derivation of a frozen object into the mutable region.
pub fn derive_mutable(
    arena: &Arena,
    region: &mut Region,
    off: u64,
) -> Result<u64, ArenaError> {
    let derived = copy_object(arena, region, off)?;
    header_at_mut(arena, derived).insert_flags(ObjFlags::DERIVED);
    Ok(derived)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Arena, Region) {
        let arena = Arena::new(1024 * 1024).expect("map arena");
        let region = arena.carve(512 * 1024).expect("carve region");
        (arena, region)
    }

    #[test]
    fn bytes_objects_round_trip_their_payload() {
        let (arena, mut region) = fixture();
        let off = alloc_bytes(&arena, &mut region, b"push").expect("alloc");

        assert_eq!(kind_at(&arena, off), Kind::Bytes);
        assert_eq!(bytes_at(&arena, off), b"push");
        assert_eq!(ext_size(&arena, off), 4);
    }

    #[test]
    fn class_external_size_follows_its_slot_tree() {
        let (arena, mut region) = fixture();
        let off = alloc_class(&arena, &mut region, 77).expect("alloc");
        let empty = ext_size(&arena, off);

        let slots = slot_tree(&arena, off).expect("class has slots");
        slots
            .insert(&arena, &mut region, &SLOT_DESC, 1, Value::from_i64(9).raw())
            .expect("insert");

        assert!(
            ext_size(&arena, off) > empty,
            "adding a selector must grow the owned footprint"
        );
    }

    #[test]
    fn copied_objects_share_no_slot_tree_with_the_source() {
        let (arena, mut region) = fixture();
        let src = alloc_class(&arena, &mut region, 1).expect("alloc");
        let src_slots = slot_tree(&arena, src).expect("slots");
        src_slots
            .insert(&arena, &mut region, &SLOT_DESC, 10, Value::from_i64(1).raw())
            .expect("insert");

        let copy = derive_mutable(&arena, &mut region, src).expect("derive");
        assert!(header_at(&arena, copy).flags().contains(ObjFlags::DERIVED));

        let copy_slots = slot_tree(&arena, copy).expect("slots");
        assert_ne!(copy_slots.off(), src_slots.off(), "tree must be deep-copied");
        copy_slots
            .insert(&arena, &mut region, &SLOT_DESC, 11, Value::from_i64(2).raw())
            .expect("insert");

        assert_eq!(
            src_slots.lookup(&arena, &SLOT_DESC, 11),
            None,
            "mutating the copy must not leak into the source"
        );
        assert_eq!(
            copy_slots.lookup(&arena, &SLOT_DESC, 10),
            Some(Value::from_i64(1).raw()),
            "existing entries must survive the copy"
        );
    }
}
