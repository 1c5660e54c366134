//! Typed vector and list primitives on top of blocks.
//!
//! Vectors are dense typed arrays in a single block. Appending doubles the
//! block order when full and always runs through copy-on-write first, so a
//! shared vector is never mutated in place. Slices are header-only views:
//! element access redirects to the (retained) parent with the offset added,
//! and slicing a slice re-targets the ultimate parent so indirection never
//! nests.
//!
//! Null tracking: vectors of up to 128 rows keep the bitmap inline in the
//! header; longer vectors switch to an external U8 bitmap block. The
//! transition happens transparently on append. Setting a null through a
//! slice view is an error.

use crate::block::{self, data, Header, INLINE_NULL_ROWS};
use crate::error::{Error, Result};
use crate::mem;
use crate::types::{Attrs, TypeTag, SYM_W_MASK};
use crate::value::Value;

impl Value {
    /// New empty vector of `tag` with room for `capacity` elements.
    pub fn vec(tag: TypeTag, capacity: i64) -> Result<Value> {
        if capacity < 0 {
            return Err(Error::Range(format!("negative capacity {capacity}")));
        }
        let bytes = capacity.max(1) as usize * tag.elem_size();
        let p = mem::alloc(bytes)?;
        unsafe {
            (*p).tag = tag as i8;
            (*p).set_len(0);
        }
        Ok(Value::from_raw(p))
    }

    /// New empty SYM vector with the given element width (1, 2, 4 or 8).
    pub fn sym_vec(width_bytes: usize, capacity: i64) -> Result<Value> {
        if !matches!(width_bytes, 1 | 2 | 4 | 8) {
            return Err(Error::Range(format!("bad sym width {width_bytes}")));
        }
        let p = mem::alloc(capacity.max(1) as usize * width_bytes)?;
        unsafe {
            (*p).tag = TypeTag::Sym as i8;
            (*p).attrs = Attrs::for_sym_width(width_bytes).bits();
            (*p).set_len(0);
        }
        Ok(Value::from_raw(p))
    }

    pub fn i64_vec(vals: &[i64]) -> Result<Value> {
        let v = Value::vec(TypeTag::I64, vals.len() as i64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(vals.as_ptr(), data(v.raw()) as *mut i64, vals.len());
            (*v.raw()).set_len(vals.len() as i64);
        }
        Ok(v)
    }

    pub fn f64_vec(vals: &[f64]) -> Result<Value> {
        let v = Value::vec(TypeTag::F64, vals.len() as i64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(vals.as_ptr(), data(v.raw()) as *mut f64, vals.len());
            (*v.raw()).set_len(vals.len() as i64);
        }
        Ok(v)
    }

    pub fn i32_vec(vals: &[i32]) -> Result<Value> {
        let v = Value::vec(TypeTag::I32, vals.len() as i64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(vals.as_ptr(), data(v.raw()) as *mut i32, vals.len());
            (*v.raw()).set_len(vals.len() as i64);
        }
        Ok(v)
    }

    pub fn bool_vec(vals: &[bool]) -> Result<Value> {
        let v = Value::vec(TypeTag::Bool, vals.len() as i64)?;
        unsafe {
            let d = data(v.raw());
            for (i, &b) in vals.iter().enumerate() {
                *d.add(i) = b as u8;
            }
            (*v.raw()).set_len(vals.len() as i64);
        }
        Ok(v)
    }

    /// SYM vector (8-byte ids) from a slice of global symbol ids.
    pub fn sym_vec_from(ids: &[i64]) -> Result<Value> {
        let v = Value::sym_vec(8, ids.len() as i64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ids.as_ptr(), data(v.raw()) as *mut i64, ids.len());
            (*v.raw()).set_len(ids.len() as i64);
        }
        Ok(v)
    }

    /// Vector of a given tag built from already-encoded element bytes.
    pub(crate) fn vec_from_raw(tag: TypeTag, bytes: &[u8], len: i64) -> Result<Value> {
        let v = Value::vec(tag, len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data(v.raw()), bytes.len());
            (*v.raw()).set_len(len);
        }
        Ok(v)
    }

    // ----- append -----

    /// Append one element given as raw little-endian bytes of the vector's
    /// element width. COWs first, grows by doubling the order when full.
    pub fn push_raw(&mut self, elem: &[u8]) -> Result<()> {
        self.make_unique()?;
        let w = self.elem_width();
        if elem.len() != w {
            return Err(Error::Rank(format!(
                "element width {} does not match vector width {w}",
                elem.len()
            )));
        }
        let n = self.header().len();
        if n >= self.capacity_elems() {
            self.grow()?;
        }
        unsafe {
            let p = self.raw();
            std::ptr::copy_nonoverlapping(elem.as_ptr(), data(p).add(n as usize * w), w);
            (*p).set_len(n + 1);
        }
        self.nullmap_accommodate(n + 1)?;
        Ok(())
    }

    pub fn push_i64(&mut self, v: i64) -> Result<()> {
        let w = self.elem_width();
        let bytes = v.to_le_bytes();
        self.push_raw(&bytes[..w])
    }

    pub fn push_f64(&mut self, v: f64) -> Result<()> {
        self.push_raw(&v.to_le_bytes())
    }

    pub fn push_bool(&mut self, v: bool) -> Result<()> {
        self.push_raw(&[v as u8])
    }

    /// Append a null element (zero payload, null bit set).
    pub fn push_null(&mut self) -> Result<()> {
        let w = self.elem_width();
        let zeros = [0u8; 16];
        self.push_raw(&zeros[..w])?;
        let idx = self.header().len() - 1;
        self.set_null(idx, true)
    }

    /// Double the block order, preserving contents.
    fn grow(&mut self) -> Result<()> {
        let old = self.raw();
        let new_bytes = (1usize << ((*self.header()).order + 1)) - Value::HDR;
        let p = mem::alloc(new_bytes)?;
        unsafe {
            (*p).head = (*old).head;
            (*p).tag = (*old).tag;
            (*p).attrs = (*old).attrs;
            (*p).set_len((*old).len());
            std::ptr::copy_nonoverlapping(data(old), data(p), (*old).payload_bytes());
            // The new block takes over ownership of children and the ext
            // nullmap; drop the old shell without touching them.
            (*old).head = [0; 16];
            (*old).attrs &= SYM_W_MASK;
            (*old).set_len(0);
        }
        let grown = Value::from_raw(p);
        let _old = std::mem::replace(self, grown);
        Ok(())
    }

    /// Keep the null bitmap representation in line with the element count:
    /// past 128 rows an inline bitmap is promoted to an external block, and
    /// an existing external bitmap is extended.
    fn nullmap_accommodate(&mut self, len: i64) -> Result<()> {
        let attrs = self.attrs();
        if !attrs.contains(Attrs::HAS_NULLS) {
            return Ok(());
        }
        if !attrs.contains(Attrs::NULLMAP_EXT) {
            if len <= INLINE_NULL_ROWS {
                return Ok(());
            }
            self.promote_nullmap(len)?;
            return Ok(());
        }
        // Extend the external bitmap to cover `len` rows.
        let need = (len as usize).div_ceil(8) as i64;
        unsafe {
            let p = self.raw();
            let map = (*p).ext_nullmap();
            if (*map).len() < need {
                let mut m = Value::retaining(map);
                while m.header().len() < need {
                    m.push_raw(&[0u8])?;
                }
                let new_map = m.into_raw();
                block::release_raw(map);
                (*p).set_ext_nullmap(new_map);
            }
        }
        Ok(())
    }

    fn promote_nullmap(&mut self, len: i64) -> Result<()> {
        let bytes = (len as usize).div_ceil(8);
        let mut map = Value::vec(TypeTag::U8, bytes as i64)?;
        unsafe {
            let d = data(map.raw());
            std::ptr::write_bytes(d, 0, bytes);
            for i in 0..INLINE_NULL_ROWS.min(len) {
                if (*self.raw()).inline_null(i) {
                    *d.add(i as usize >> 3) |= 1 << (i & 7);
                }
            }
            (*map.raw()).set_len(bytes as i64);
            let p = self.raw();
            (*p).head = [0; 16];
            (*p).set_ext_nullmap(map.into_raw());
            (*p).attrs |= Attrs::NULLMAP_EXT.bits();
        }
        Ok(())
    }

    // ----- element access -----

    fn check_bounds(&self, idx: i64) -> Result<()> {
        if self.is_parted() || self.is_partition_map() {
            return Err(Error::Rank(
                "element access on a parted column; take a segment or densify first".into(),
            ));
        }
        if idx < 0 || idx >= self.header().len() {
            return Err(Error::Range(format!(
                "index {idx} out of bounds for length {}",
                self.header().len()
            )));
        }
        Ok(())
    }

    /// Integral element (all integer-class tags, any sym width).
    pub fn get_i64(&self, idx: i64) -> Result<i64> {
        self.check_bounds(idx)?;
        unsafe {
            let (base, off, _) = block::resolve(self.raw());
            Ok(read_int(base, self.elem_width(), self.vec_tag_or_base()?, off + idx))
        }
    }

    pub fn get_f64(&self, idx: i64) -> Result<f64> {
        self.check_bounds(idx)?;
        let t = self.vec_tag_or_base()?;
        unsafe {
            let (base, off, _) = block::resolve(self.raw());
            if t == TypeTag::F64 {
                Ok(*(base as *const f64).add((off + idx) as usize))
            } else {
                Ok(read_int(base, self.elem_width(), t, off + idx) as f64)
            }
        }
    }

    pub fn get_bool(&self, idx: i64) -> Result<bool> {
        Ok(self.get_i64(idx)? != 0)
    }

    /// Child block of a LIST or STR vector element.
    pub fn get_child(&self, idx: i64) -> Result<Value> {
        self.check_bounds(idx)?;
        let t = self.tag();
        if t != TypeTag::List as i8 && t != TypeTag::Str as i8 {
            return Err(Error::Type(format!("tag {t} has no child elements")));
        }
        unsafe {
            let (base, off, _) = block::resolve(self.raw());
            let kid = *(base as *const *mut Header).add((off + idx) as usize);
            Ok(Value::retaining(kid))
        }
    }

    pub fn is_null_at(&self, idx: i64) -> Result<bool> {
        self.check_bounds(idx)?;
        Ok(unsafe { block::is_null(self.raw(), idx) })
    }

    /// Overwrite one element (COWs first).
    pub fn set_i64(&mut self, idx: i64, v: i64) -> Result<()> {
        self.check_bounds(idx)?;
        self.make_unique()?;
        let w = self.elem_width();
        unsafe {
            let bytes = v.to_le_bytes();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data(self.raw()).add(idx as usize * w), w);
        }
        Ok(())
    }

    pub fn set_f64(&mut self, idx: i64, v: f64) -> Result<()> {
        self.check_bounds(idx)?;
        self.make_unique()?;
        unsafe { *(data(self.raw()) as *mut f64).add(idx as usize) = v };
        Ok(())
    }

    /// Set or clear the null bit. Forbidden on slice views.
    pub fn set_null(&mut self, idx: i64, null: bool) -> Result<()> {
        self.check_bounds(idx)?;
        if self.attrs().contains(Attrs::SLICE) {
            return Err(Error::Rank("cannot set nulls through a slice view".into()));
        }
        self.make_unique()?;
        raw_set_null(self.raw(), idx, null)
    }

    // ----- views -----

    /// Zero-copy window `[offset, offset + len)`. Slicing a slice resolves
    /// to the ultimate parent.
    pub fn slice(&self, offset: i64, len: i64) -> Result<Value> {
        if offset < 0 || len < 0 || offset + len > self.header().len() {
            return Err(Error::Range(format!(
                "slice [{offset}, {offset}+{len}) out of bounds for length {}",
                self.header().len()
            )));
        }
        let (parent, base_off) = if self.attrs().contains(Attrs::SLICE) {
            (self.header().slice_parent(), self.header().slice_offset())
        } else {
            (self.raw(), 0)
        };
        let p = mem::alloc(0)?;
        unsafe {
            block::retain_raw(parent);
            (*p).tag = self.tag();
            (*p).attrs = (Attrs::SLICE.bits()) | (self.header().attrs & SYM_W_MASK)
                | (self.header().attrs & Attrs::HAS_NULLS.bits());
            (*p).set_len(len);
            (*p).set_slice_parent(parent);
            (*p).set_slice_offset(base_off + offset);
        }
        Ok(Value::from_raw(p))
    }

    /// Dense copy of a slice; dense vectors just gain a reference.
    pub fn materialize(&self) -> Result<Value> {
        if self.attrs().contains(Attrs::SLICE) {
            let p = unsafe { block::materialize_slice(self.raw()) }?;
            Ok(Value::from_raw(p))
        } else {
            Ok(self.clone())
        }
    }

    /// Concatenate two vectors of the same base type into a fresh dense
    /// vector. SYM widths are widened to the larger side.
    pub fn concat(&self, other: &Value) -> Result<Value> {
        if self.tag() != other.tag() {
            return Err(Error::Type(format!(
                "concat of mismatched tags {} and {}",
                self.tag(),
                other.tag()
            )));
        }
        let t = self.vec_tag_or_base()?;
        let (n1, n2) = (self.header().len(), other.header().len());
        let out_w = self.elem_width().max(other.elem_width());
        let mut out = if t == TypeTag::Sym {
            Value::sym_vec(out_w, n1 + n2)?
        } else {
            Value::vec(t, n1 + n2)?
        };
        for (src, n) in [(self, n1), (other, n2)] {
            for i in 0..n {
                if t == TypeTag::List || t == TypeTag::Str {
                    let kid = src.get_child(i)?;
                    out.push_child_raw(kid)?;
                } else if t == TypeTag::F64 {
                    out.push_f64(src.get_f64(i)?)?;
                } else {
                    out.push_i64(src.get_i64(i)?)?;
                }
                if src.is_null_at(i)? {
                    let idx = out.header().len() - 1;
                    out.set_null(idx, true)?;
                }
            }
        }
        Ok(out)
    }

    // ----- lists -----

    /// New empty heterogeneous list.
    pub fn list(capacity: i64) -> Result<Value> {
        let p = mem::alloc(capacity.max(1) as usize * 8)?;
        unsafe {
            (*p).tag = TypeTag::List as i8;
            (*p).set_len(0);
        }
        Ok(Value::from_raw(p))
    }

    /// Append an owned child to a LIST (or STR vector).
    pub fn push_child(&mut self, item: Value) -> Result<()> {
        let t = self.tag();
        if t != TypeTag::List as i8 && t != TypeTag::Str as i8 {
            return Err(Error::Type(format!("tag {t} does not take child blocks")));
        }
        self.push_child_raw(item)
    }

    fn push_child_raw(&mut self, item: Value) -> Result<()> {
        self.make_unique()?;
        let n = self.header().len();
        if n >= self.capacity_elems() {
            self.grow()?;
        }
        unsafe {
            let p = self.raw();
            *(data(p) as *mut *mut Header).add(n as usize) = item.into_raw();
            (*p).set_len(n + 1);
        }
        Ok(())
    }

    pub(crate) fn vec_tag_or_base(&self) -> Result<TypeTag> {
        let t = self.tag();
        if crate::types::is_parted_tag(t) {
            return TypeTag::try_from(crate::types::parted_base(t))
                .map_err(|_| Error::Corrupt(format!("bad parted tag {t}")));
        }
        self.header().vec_tag()
    }
}

/// Read an integral element of the given width, sign-extending signed
/// classes.
///
/// # Safety
/// `base` must point at vector payload valid for `idx`.
#[inline]
pub(crate) unsafe fn read_int(base: *mut u8, width: usize, tag: TypeTag, idx: i64) -> i64 {
    unsafe {
        let i = idx as usize;
        match (width, tag) {
            (1, TypeTag::Bool | TypeTag::U8 | TypeTag::Char) => *base.add(i) as i64,
            (1, _) => *base.add(i) as i64, // narrow sym ids are unsigned
            (2, TypeTag::I16) => *(base as *const i16).add(i) as i64,
            (2, _) => *(base as *const u16).add(i) as i64,
            (4, TypeTag::Sym) => *(base as *const u32).add(i) as i64,
            (4, _) => *(base as *const i32).add(i) as i64,
            _ => *(base as *const i64).add(i),
        }
    }
}

/// Set a null bit on a dense vector, creating the bitmap representation the
/// length calls for (inline up to 128 rows, external block past that).
///
/// # Safety wrapper note
/// Takes a raw header because the block layer calls it while materializing
/// slices; `p` must be a live, uniquely-owned dense vector.
pub(crate) fn raw_set_null(p: *mut Header, idx: i64, null: bool) -> Result<()> {
    unsafe {
        let len = (*p).len();
        let attrs = (*p).attrs();
        if len <= INLINE_NULL_ROWS && !attrs.contains(Attrs::NULLMAP_EXT) {
            (*p).set_inline_null(idx, null);
            if null {
                (*p).attrs |= Attrs::HAS_NULLS.bits();
            }
            return Ok(());
        }
        if !attrs.contains(Attrs::NULLMAP_EXT) {
            // First null on a long vector: build the external bitmap now.
            let bytes = (len as usize).div_ceil(8);
            let map = Value::vec(TypeTag::U8, bytes as i64)?;
            std::ptr::write_bytes(data(map.raw()), 0, bytes);
            (*map.raw()).set_len(bytes as i64);
            (*p).head = [0; 16];
            (*p).set_ext_nullmap(map.into_raw());
            (*p).attrs |= Attrs::NULLMAP_EXT.bits();
        }
        let map = block::cow_raw((*p).ext_nullmap())?;
        (*p).set_ext_nullmap(map);
        let bits = data(map);
        let i = idx as usize;
        if null {
            *bits.add(i >> 3) |= 1 << (i & 7);
            (*p).attrs |= Attrs::HAS_NULLS.bits();
        } else {
            *bits.add(i >> 3) &= !(1 << (i & 7));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_get() -> Result<()> {
        let mut v = Value::vec(TypeTag::I64, 4)?;
        for i in 0..100 {
            v.push_i64(i * 3)?;
        }
        assert_eq!(v.len(), 100);
        assert_eq!(v.get_i64(0)?, 0);
        assert_eq!(v.get_i64(99)?, 297);
        assert!(v.get_i64(100).is_err());
        Ok(())
    }

    #[test]
    fn append_copies_shared_vectors() -> Result<()> {
        let mut v = Value::i64_vec(&[1, 2, 3])?;
        let snapshot = v.clone();
        v.push_i64(4)?;
        assert_eq!(snapshot.len(), 3);
        assert_eq!(v.len(), 4);
        assert_eq!(snapshot.get_i64(2)?, 3);
        Ok(())
    }

    #[test]
    fn nullmap_inline_to_external_transition() -> Result<()> {
        let mut v = Value::vec(TypeTag::I64, 8)?;
        for i in 0..128 {
            v.push_i64(i)?;
        }
        v.set_null(5, true)?;
        assert!(!v.attrs().contains(Attrs::NULLMAP_EXT));
        assert!(v.is_null_at(5)?);
        // Crossing 128 rows promotes the bitmap to an external block.
        v.push_i64(128)?;
        assert!(v.attrs().contains(Attrs::NULLMAP_EXT));
        assert!(v.is_null_at(5)?);
        assert!(!v.is_null_at(128)?);
        v.set_null(128, true)?;
        assert!(v.is_null_at(128)?);
        Ok(())
    }

    #[test]
    fn slices_redirect_and_stay_flat() -> Result<()> {
        let v = Value::i64_vec(&[10, 20, 30, 40, 50])?;
        let s = v.slice(1, 3)?;
        assert_eq!(s.len(), 3);
        assert_eq!(s.get_i64(0)?, 20);
        let ss = s.slice(1, 2)?;
        assert_eq!(ss.get_i64(0)?, 30);
        // Slice of slice points at the original vector, not the first slice.
        assert_eq!(ss.header().slice_parent(), v.raw());
        assert!(ss.clone().set_null(0, true).is_err());
        Ok(())
    }

    #[test]
    fn materialize_densifies() -> Result<()> {
        let v = Value::i64_vec(&[1, 2, 3, 4])?;
        let s = v.slice(2, 2)?;
        let d = s.materialize()?;
        assert!(!d.attrs().contains(Attrs::SLICE));
        assert_eq!(d.get_i64(0)?, 3);
        assert_eq!(d.get_i64(1)?, 4);
        Ok(())
    }

    #[test]
    fn concat_preserves_values_and_nulls() -> Result<()> {
        let mut a = Value::i64_vec(&[1, 2])?;
        a.set_null(1, true)?;
        let b = Value::i64_vec(&[3])?;
        let c = a.concat(&b)?;
        assert_eq!(c.len(), 3);
        assert_eq!(c.get_i64(0)?, 1);
        assert!(c.is_null_at(1)?);
        assert_eq!(c.get_i64(2)?, 3);
        Ok(())
    }

    #[test]
    fn narrow_sym_vectors_round_trip() -> Result<()> {
        let mut v = Value::sym_vec(2, 4)?;
        for id in [0i64, 300, 65535] {
            v.push_i64(id)?;
        }
        assert_eq!(v.get_i64(1)?, 300);
        assert_eq!(v.get_i64(2)?, 65535);
        assert_eq!(v.elem_width(), 2);
        Ok(())
    }

    #[test]
    fn lists_own_children() -> Result<()> {
        let mut l = Value::list(2)?;
        let item = Value::i64_vec(&[1, 2, 3])?;
        let rc_before = item.rc();
        l.push_child(item.clone())?;
        assert_eq!(item.rc(), rc_before + 1);
        drop(l);
        assert_eq!(item.rc(), rc_before);
        Ok(())
    }
}
