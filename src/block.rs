//! The 32-byte block header and the raw reference-counting core.
//!
//! Every runtime value is a block: a 32-byte aligned region beginning with
//! this header, optionally followed by a data payload. The layout is
//! bit-exact with the on-disk column format, so a mapped column file *is* a
//! block.
//!
//! Bytes 0-15 are a union, interpreted by tag and attrs:
//! - dense vector with ≤128 rows: inline null bitmap
//! - vector with an external nullmap: pointer to a U8 bitmap block
//! - slice view: `{parent: *mut Header, offset: i64}`
//! - atom: inline payload (value bits, small string, or payload pointer)
//! - free block: freelist `{next, prev}` links
//!
//! Bytes 24-31 hold the element count for containers and are unused for
//! atoms (atom payloads live in the head union).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::mem;
use crate::types::{is_parted_tag, Attrs, Mmod, TypeTag, MAPCOMMON};

/// Header size; also the minimum block alignment.
pub const HDR_BYTES: usize = 32;

/// Tag stamped on blocks sitting on a freelist.
pub(crate) const FREE_TAG: i8 = i8::MIN;

/// Rows at or below which the null bitmap is stored inline in the header.
pub(crate) const INLINE_NULL_ROWS: i64 = 128;

#[repr(C, align(32))]
pub struct Header {
    pub(crate) head: [u8; 16],
    pub(crate) mmod: u8,
    pub(crate) order: u8,
    pub(crate) tag: i8,
    pub(crate) attrs: u8,
    pub(crate) rc: AtomicU32,
    pub(crate) val: u64,
}

const _: () = assert!(std::mem::size_of::<Header>() == HDR_BYTES);
const _: () = assert!(std::mem::align_of::<Header>() == 32);

impl Header {
    /// Reset to a freshly allocated state: all zero except `rc = 1`,
    /// `order` and `mmod`.
    pub(crate) fn init(&mut self, mmod: Mmod, order: u8) {
        self.head = [0; 16];
        self.mmod = mmod as u8;
        self.order = order;
        self.tag = 0;
        self.attrs = 0;
        self.rc = AtomicU32::new(1);
        self.val = 0;
    }

    pub(crate) fn mark_free(&mut self, order: u8) {
        self.tag = FREE_TAG;
        self.order = order;
        self.mmod = Mmod::Heap as u8;
        self.rc = AtomicU32::new(0);
    }

    #[inline]
    pub fn mmod(&self) -> Mmod {
        match self.mmod & 0x03 {
            0 => Mmod::Heap,
            1 => Mmod::Mmap,
            2 => Mmod::Static,
            _ => Mmod::Direct,
        }
    }

    #[inline]
    pub fn tag(&self) -> i8 {
        self.tag
    }

    #[inline]
    pub fn attrs(&self) -> Attrs {
        Attrs::from_bits_retain(self.attrs)
    }

    #[inline]
    pub fn is_atom(&self) -> bool {
        self.tag < 0
    }

    #[inline]
    pub fn is_vec(&self) -> bool {
        self.tag > 0 && self.tag < 16
    }

    #[inline]
    pub fn len(&self) -> i64 {
        self.val as i64
    }

    #[inline]
    pub(crate) fn set_len(&mut self, n: i64) {
        self.val = n as u64;
    }

    /// Vector base tag, for blocks in `[1, 16)`.
    pub fn vec_tag(&self) -> Result<TypeTag> {
        TypeTag::try_from(self.tag)
            .map_err(|_| Error::Type(format!("tag {} is not a vector type", self.tag)))
    }

    /// Element width in bytes, honoring the per-vector SYM width.
    #[inline]
    pub(crate) fn elem_width(&self) -> usize {
        if self.tag == TypeTag::Sym as i8 {
            self.attrs().sym_width_bytes()
        } else {
            TypeTag::try_from(self.tag).map_or(8, TypeTag::elem_size)
        }
    }

    /// Payload bytes implied by tag, attrs and len.
    pub(crate) fn payload_bytes(&self) -> usize {
        let n = self.len() as usize;
        match self.tag {
            t if t < 0 => 0,
            t if t == TypeTag::List as i8 => n * 8,
            t if t == TypeTag::Table as i8 => n * 16, // name-id prefix + column pointers
            t if t == MAPCOMMON => 16,
            t if is_parted_tag(t) => n * 8,
            _ => n * self.elem_width(),
        }
    }

    /// Elements the current block order can hold without growing.
    pub(crate) fn capacity_elems(&self) -> i64 {
        let data = (1usize << self.order) - HDR_BYTES;
        let w = match self.tag {
            t if t == TypeTag::Table as i8 => 16,
            t if t == TypeTag::List as i8 || is_parted_tag(t) => 8,
            _ => self.elem_width(),
        };
        (data / w) as i64
    }

    // ----- head-union accessors -----

    #[inline]
    fn head_ptr(&self, at: usize) -> *mut Header {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.head[at..at + 8]);
        usize::from_ne_bytes(b) as *mut Header
    }

    #[inline]
    fn set_head_ptr(&mut self, at: usize, p: *mut Header) {
        self.head[at..at + 8].copy_from_slice(&(p as usize).to_ne_bytes());
    }

    #[inline]
    pub(crate) fn head_i64(&self, at: usize) -> i64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.head[at..at + 8]);
        i64::from_ne_bytes(b)
    }

    #[inline]
    pub(crate) fn set_head_i64(&mut self, at: usize, v: i64) {
        self.head[at..at + 8].copy_from_slice(&v.to_ne_bytes());
    }

    pub(crate) fn free_next(&self) -> *mut Header {
        self.head_ptr(0)
    }
    pub(crate) fn set_free_next(&mut self, p: *mut Header) {
        self.set_head_ptr(0, p);
    }
    pub(crate) fn free_prev(&self) -> *mut Header {
        self.head_ptr(8)
    }
    pub(crate) fn set_free_prev(&mut self, p: *mut Header) {
        self.set_head_ptr(8, p);
    }

    pub(crate) fn slice_parent(&self) -> *mut Header {
        self.head_ptr(0)
    }
    pub(crate) fn set_slice_parent(&mut self, p: *mut Header) {
        self.set_head_ptr(0, p);
    }
    pub(crate) fn slice_offset(&self) -> i64 {
        self.head_i64(8)
    }
    pub(crate) fn set_slice_offset(&mut self, off: i64) {
        self.set_head_i64(8, off);
    }

    pub(crate) fn ext_nullmap(&self) -> *mut Header {
        self.head_ptr(0)
    }
    pub(crate) fn set_ext_nullmap(&mut self, p: *mut Header) {
        self.set_head_ptr(0, p);
    }

    /// Atom payload bits (value, or pointer for STR/GUID atoms).
    pub(crate) fn atom_bits(&self) -> u64 {
        self.head_i64(0) as u64
    }
    pub(crate) fn set_atom_bits(&mut self, bits: u64) {
        self.set_head_i64(0, bits as i64);
    }
    pub(crate) fn atom_obj(&self) -> *mut Header {
        self.head_ptr(0)
    }
    pub(crate) fn set_atom_obj(&mut self, p: *mut Header) {
        self.set_head_ptr(0, p);
    }

    /// Small-string atom payload: length byte followed by up to 6 bytes.
    pub(crate) fn sso_bytes(&self) -> &[u8] {
        let n = self.head[0] as usize;
        &self.head[1..1 + n.min(6)]
    }
    pub(crate) fn set_sso_bytes(&mut self, s: &[u8]) {
        debug_assert!(s.len() <= 6);
        self.head = [0; 16];
        self.head[0] = s.len() as u8;
        self.head[1..1 + s.len()].copy_from_slice(s);
    }

    #[inline]
    pub(crate) fn inline_null(&self, idx: i64) -> bool {
        let i = idx as usize;
        (self.head[i >> 3] >> (i & 7)) & 1 != 0
    }

    #[inline]
    pub(crate) fn set_inline_null(&mut self, idx: i64, null: bool) {
        let i = idx as usize;
        if null {
            self.head[i >> 3] |= 1 << (i & 7);
        } else {
            self.head[i >> 3] &= !(1 << (i & 7));
        }
    }
}

/// Pointer to a block's data payload.
///
/// # Safety
/// `p` must be a live, non-slice block.
#[inline]
pub(crate) unsafe fn data(p: *mut Header) -> *mut u8 {
    unsafe { (p as *mut u8).add(HDR_BYTES) }
}

/// Resolve a vector to `(payload base, element offset, bitmap owner)`.
/// Dense vectors resolve to themselves; slices redirect to their parent.
///
/// # Safety
/// `p` must be a live vector block.
#[inline]
pub(crate) unsafe fn resolve(p: *mut Header) -> (*mut u8, i64, *mut Header) {
    unsafe {
        if (*p).attrs().contains(Attrs::SLICE) {
            let parent = (*p).slice_parent();
            (data(parent), (*p).slice_offset(), parent)
        } else {
            (data(p), 0, p)
        }
    }
}

/// Null test on a dense vector (no slice resolution).
///
/// # Safety
/// `p` dense vector, `idx` in bounds.
pub(crate) unsafe fn dense_is_null(p: *mut Header, idx: i64) -> bool {
    unsafe {
        let attrs = (*p).attrs();
        if !attrs.contains(Attrs::HAS_NULLS) {
            return false;
        }
        if attrs.contains(Attrs::NULLMAP_EXT) {
            let map = (*p).ext_nullmap();
            let bits = data(map);
            let i = idx as usize;
            (*bits.add(i >> 3) >> (i & 7)) & 1 != 0
        } else {
            (*p).inline_null(idx)
        }
    }
}

/// Null test with slice resolution.
///
/// # Safety
/// `p` live vector, `idx` in bounds.
pub(crate) unsafe fn is_null(p: *mut Header, idx: i64) -> bool {
    unsafe {
        if (*p).attrs().contains(Attrs::SLICE) {
            let parent = (*p).slice_parent();
            dense_is_null(parent, (*p).slice_offset() + idx)
        } else {
            dense_is_null(p, idx)
        }
    }
}

/// Bump the reference count. Safe on shared blocks: the caller already
/// holds a reference, so relaxed ordering suffices in both phases.
///
/// # Safety
/// `p` null or a live block.
#[inline]
pub(crate) unsafe fn retain_raw(p: *mut Header) {
    if p.is_null() {
        return;
    }
    unsafe { (*p).rc.fetch_add(1, Ordering::Relaxed) };
}

/// Drop one reference; the last drop releases children and returns the
/// block to its allocator. Acquire/release ordering is paid only while the
/// worker pool is active.
///
/// # Safety
/// `p` null or a live block the caller owns one reference to.
pub(crate) unsafe fn release_raw(p: *mut Header) {
    if p.is_null() {
        return;
    }
    let ordering = if mem::in_parallel_phase() {
        Ordering::AcqRel
    } else {
        Ordering::Relaxed
    };
    let old = unsafe { (*p).rc.fetch_sub(1, ordering) };
    debug_assert!(old >= 1);
    if old != 1 {
        return;
    }
    unsafe {
        drop_children(p);
        match (*p).mmod() {
            Mmod::Heap | Mmod::Direct => mem::free(p),
            Mmod::Mmap => crate::io::col::unmap_block(p),
            Mmod::Static => {}
        }
    }
}

/// Release every reference a block owns.
///
/// # Safety
/// `p` live block about to be freed.
pub(crate) unsafe fn drop_children(p: *mut Header) {
    unsafe {
        let attrs = (*p).attrs();
        if attrs.contains(Attrs::SLICE) {
            // Slices own exactly one reference: the parent.
            release_raw((*p).slice_parent());
            return;
        }
        if attrs.contains(Attrs::NULLMAP_EXT) {
            release_raw((*p).ext_nullmap());
        }
        let t = (*p).tag;
        if t < 0 {
            if -t == TypeTag::Str as i8 && (*p).len() > 6 {
                release_raw((*p).atom_obj());
            } else if -t == TypeTag::Guid as i8 {
                release_raw((*p).atom_obj());
            }
            return;
        }
        let n = (*p).len() as usize;
        if t == TypeTag::List as i8 || t == TypeTag::Str as i8 || is_parted_tag(t) {
            let kids = data(p) as *mut *mut Header;
            for i in 0..n {
                release_raw(*kids.add(i));
            }
        } else if t == TypeTag::Table as i8 {
            let cols = data(p).add(n * 8) as *mut *mut Header;
            for i in 0..n {
                release_raw(*cols.add(i));
            }
        } else if t == MAPCOMMON {
            let kids = data(p) as *mut *mut Header;
            release_raw(*kids.add(0));
            release_raw(*kids.add(1));
        }
    }
}

/// Retain every reference a block owns (used after a byte-copy duplicated
/// the pointers).
///
/// # Safety
/// `p` live non-slice block.
unsafe fn retain_children(p: *mut Header) {
    unsafe {
        let attrs = (*p).attrs();
        debug_assert!(!attrs.contains(Attrs::SLICE));
        if attrs.contains(Attrs::NULLMAP_EXT) {
            retain_raw((*p).ext_nullmap());
        }
        let t = (*p).tag;
        if t < 0 {
            if -t == TypeTag::Str as i8 && (*p).len() > 6 {
                retain_raw((*p).atom_obj());
            } else if -t == TypeTag::Guid as i8 {
                retain_raw((*p).atom_obj());
            }
            return;
        }
        let n = (*p).len() as usize;
        if t == TypeTag::List as i8 || t == TypeTag::Str as i8 || is_parted_tag(t) {
            let kids = data(p) as *mut *mut Header;
            for i in 0..n {
                retain_raw(*kids.add(i));
            }
        } else if t == TypeTag::Table as i8 {
            let cols = data(p).add(n * 8) as *mut *mut Header;
            for i in 0..n {
                retain_raw(*cols.add(i));
            }
        } else if t == MAPCOMMON {
            let kids = data(p) as *mut *mut Header;
            retain_raw(*kids.add(0));
            retain_raw(*kids.add(1));
        }
    }
}

/// Duplicate a block at the same order. Slices materialize into a dense
/// vector; everything else is byte-copied with child references retained.
/// The copy is always heap-backed, whatever the source's memory mode.
///
/// # Safety
/// `p` live block.
pub(crate) unsafe fn alloc_copy(p: *mut Header) -> Result<*mut Header> {
    unsafe {
        if (*p).attrs().contains(Attrs::SLICE) {
            return materialize_slice(p);
        }
        let data_bytes = (1usize << (*p).order).saturating_sub(HDR_BYTES);
        let q = mem::alloc(data_bytes)?;
        (*q).head = (*p).head;
        (*q).tag = (*p).tag;
        (*q).attrs = (*p).attrs;
        (*q).val = (*p).val;
        std::ptr::copy_nonoverlapping(data(p), data(q), (*p).payload_bytes());
        retain_children(q);
        Ok(q)
    }
}

/// Build a dense copy of a slice view, resolving the parent's payload and
/// null bits.
///
/// # Safety
/// `p` live slice block.
pub(crate) unsafe fn materialize_slice(p: *mut Header) -> Result<*mut Header> {
    unsafe {
        let parent = (*p).slice_parent();
        let off = (*p).slice_offset();
        let n = (*p).len();
        let w = (*parent).elem_width();
        let q = mem::alloc(n as usize * w)?;
        (*q).tag = (*p).tag;
        (*q).attrs = (*parent).attrs & crate::types::SYM_W_MASK;
        (*q).set_len(n);
        std::ptr::copy_nonoverlapping(data(parent).add(off as usize * w), data(q), n as usize * w);
        let t = (*p).tag;
        if t == TypeTag::List as i8 || t == TypeTag::Str as i8 {
            let kids = data(q) as *mut *mut Header;
            for i in 0..n as usize {
                retain_raw(*kids.add(i));
            }
        }
        if (*parent).attrs().contains(Attrs::HAS_NULLS) {
            for i in 0..n {
                if dense_is_null(parent, off + i) {
                    crate::vec::raw_set_null(q, i, true)?;
                }
            }
        }
        Ok(q)
    }
}

/// Copy-on-write: return a block safe to mutate, consuming one reference to
/// `p`. Uniquely-owned heap blocks come back unchanged; shared blocks,
/// slices and mapped blocks are duplicated onto the heap first.
///
/// # Safety
/// `p` live block the caller owns one reference to.
pub(crate) unsafe fn cow_raw(p: *mut Header) -> Result<*mut Header> {
    unsafe {
        let unique = (*p).rc.load(Ordering::Acquire) == 1;
        let in_place = unique
            && !(*p).attrs().contains(Attrs::SLICE)
            && matches!((*p).mmod(), Mmod::Heap | Mmod::Direct);
        if in_place {
            return Ok(p);
        }
        let q = alloc_copy(p)?;
        release_raw(p);
        Ok(q)
    }
}
