//! Owning handles and scalar atoms.
//!
//! [`Value`] is the safe, reference-counted handle to a block: `Clone`
//! retains, `Drop` releases, and mutation goes through copy-on-write. All
//! engine results — atoms, vectors, tables, parted columns — travel as
//! `Value`s.

use std::fmt;
use std::ptr::NonNull;

use crate::block::{self, data, Header, HDR_BYTES};
use crate::error::{Error, Result};
use crate::mem;
use crate::types::{is_parted_tag, Attrs, TypeTag, MAPCOMMON};

/// Owning handle to a block. One handle holds exactly one reference.
pub struct Value {
    ptr: NonNull<Header>,
}

// Blocks are freed through their owner's return queue and mutated only via
// COW, so handles may cross threads and be read concurrently.
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

impl Clone for Value {
    fn clone(&self) -> Self {
        unsafe { block::retain_raw(self.ptr.as_ptr()) };
        Value { ptr: self.ptr }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        unsafe { block::release_raw(self.ptr.as_ptr()) };
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("tag", &self.tag())
            .field("len", &self.len())
            .field("rc", &self.rc())
            .finish()
    }
}

impl Value {
    /// Take ownership of a raw block (consumes its reference).
    pub(crate) fn from_raw(p: *mut Header) -> Value {
        Value {
            ptr: NonNull::new(p).expect("null block pointer"),
        }
    }

    /// Wrap a raw block, retaining a new reference.
    pub(crate) fn retaining(p: *mut Header) -> Value {
        unsafe { block::retain_raw(p) };
        Value::from_raw(p)
    }

    /// Give up ownership without releasing.
    pub(crate) fn into_raw(self) -> *mut Header {
        let p = self.ptr.as_ptr();
        std::mem::forget(self);
        p
    }

    #[inline]
    pub(crate) fn raw(&self) -> *mut Header {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        unsafe { self.ptr.as_ref() }
    }

    /// Signed type tag of the underlying block.
    #[inline]
    pub fn tag(&self) -> i8 {
        self.header().tag()
    }

    /// Element count for containers; 0 for atoms.
    #[inline]
    pub fn len(&self) -> i64 {
        if self.is_atom() { 0 } else { self.header().len() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_atom(&self) -> bool {
        self.header().is_atom()
    }

    #[inline]
    pub fn is_vec(&self) -> bool {
        self.header().is_vec()
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        self.tag() == TypeTag::Table as i8
    }

    #[inline]
    pub fn is_parted(&self) -> bool {
        is_parted_tag(self.tag())
    }

    #[inline]
    pub fn is_partition_map(&self) -> bool {
        self.tag() == MAPCOMMON
    }

    /// Atom kind, for atoms.
    pub fn atom_tag(&self) -> Result<TypeTag> {
        if !self.is_atom() {
            return Err(Error::Type(format!("tag {} is not an atom", self.tag())));
        }
        TypeTag::try_from(-self.tag())
            .map_err(|_| Error::Corrupt(format!("bad atom tag {}", self.tag())))
    }

    /// Current reference count (diagnostic).
    pub fn rc(&self) -> u32 {
        self.header().rc.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Copy-on-write: after this call the handle points at a uniquely-owned
    /// heap block safe to mutate in place.
    pub(crate) fn make_unique(&mut self) -> Result<()> {
        let p = unsafe { block::cow_raw(self.ptr.as_ptr()) }?;
        self.ptr = NonNull::new(p).expect("cow returned null");
        Ok(())
    }

    // ----- atom constructors -----

    fn new_atom(kind: TypeTag) -> Result<Value> {
        let p = mem::alloc(0)?;
        unsafe { (*p).tag = -(kind as i8) };
        Ok(Value::from_raw(p))
    }

    pub fn bool_atom(v: bool) -> Result<Value> {
        let a = Self::new_atom(TypeTag::Bool)?;
        unsafe { (*a.raw()).set_atom_bits(v as u64) };
        Ok(a)
    }

    pub fn u8_atom(v: u8) -> Result<Value> {
        let a = Self::new_atom(TypeTag::U8)?;
        unsafe { (*a.raw()).set_atom_bits(v as u64) };
        Ok(a)
    }

    pub fn char_atom(v: u8) -> Result<Value> {
        let a = Self::new_atom(TypeTag::Char)?;
        unsafe { (*a.raw()).set_atom_bits(v as u64) };
        Ok(a)
    }

    pub fn i16_atom(v: i16) -> Result<Value> {
        let a = Self::new_atom(TypeTag::I16)?;
        unsafe { (*a.raw()).set_atom_bits(v as i64 as u64) };
        Ok(a)
    }

    pub fn i32_atom(v: i32) -> Result<Value> {
        let a = Self::new_atom(TypeTag::I32)?;
        unsafe { (*a.raw()).set_atom_bits(v as i64 as u64) };
        Ok(a)
    }

    pub fn i64_atom(v: i64) -> Result<Value> {
        let a = Self::new_atom(TypeTag::I64)?;
        unsafe { (*a.raw()).set_atom_bits(v as u64) };
        Ok(a)
    }

    pub fn f64_atom(v: f64) -> Result<Value> {
        let a = Self::new_atom(TypeTag::F64)?;
        unsafe { (*a.raw()).set_atom_bits(v.to_bits()) };
        Ok(a)
    }

    pub fn date_atom(days: i32) -> Result<Value> {
        let a = Self::new_atom(TypeTag::Date)?;
        unsafe { (*a.raw()).set_atom_bits(days as i64 as u64) };
        Ok(a)
    }

    pub fn time_atom(nanos: i64) -> Result<Value> {
        let a = Self::new_atom(TypeTag::Time)?;
        unsafe { (*a.raw()).set_atom_bits(nanos as u64) };
        Ok(a)
    }

    pub fn timestamp_atom(nanos: i64) -> Result<Value> {
        let a = Self::new_atom(TypeTag::Timestamp)?;
        unsafe { (*a.raw()).set_atom_bits(nanos as u64) };
        Ok(a)
    }

    pub fn sym_atom(id: i64) -> Result<Value> {
        let a = Self::new_atom(TypeTag::Sym)?;
        unsafe { (*a.raw()).set_atom_bits(id as u64) };
        Ok(a)
    }

    /// String atom: ≤6 bytes inline, longer strings point at a CHAR vector.
    pub fn str_atom(s: &str) -> Result<Value> {
        let bytes = s.as_bytes();
        let a = Self::new_atom(TypeTag::Str)?;
        unsafe {
            (*a.raw()).set_len(bytes.len() as i64);
            if bytes.len() <= 6 {
                (*a.raw()).set_sso_bytes(bytes);
            } else {
                let chars = Value::char_vec_from(bytes)?;
                (*a.raw()).set_atom_obj(chars.into_raw());
            }
        }
        Ok(a)
    }

    pub fn guid_atom(bytes: [u8; 16]) -> Result<Value> {
        let payload = {
            let p = mem::alloc(16)?;
            unsafe {
                (*p).tag = TypeTag::Guid as i8;
                (*p).set_len(1);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), data(p), 16);
            }
            Value::from_raw(p)
        };
        let a = Self::new_atom(TypeTag::Guid)?;
        unsafe { (*a.raw()).set_atom_obj(payload.into_raw()) };
        Ok(a)
    }

    /// Integer-class atom of an explicit tag (used by constant folding).
    pub(crate) fn int_atom_of(tag: TypeTag, v: i64) -> Result<Value> {
        let a = Self::new_atom(tag)?;
        unsafe { (*a.raw()).set_atom_bits(v as u64) };
        Ok(a)
    }

    pub(crate) fn char_vec_from(bytes: &[u8]) -> Result<Value> {
        let p = mem::alloc(bytes.len())?;
        unsafe {
            (*p).tag = TypeTag::Char as i8;
            (*p).set_len(bytes.len() as i64);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data(p), bytes.len());
        }
        Ok(Value::from_raw(p))
    }

    // ----- atom accessors -----

    pub fn as_bool(&self) -> Result<bool> {
        match self.atom_tag()? {
            TypeTag::Bool => Ok(self.header().atom_bits() != 0),
            t => Err(Error::Type(format!("expected BOOL atom, found {t:?}"))),
        }
    }

    /// Integral atom value, accepted across the whole integer class
    /// (BOOL..I64, DATE, TIME, TIMESTAMP, SYM, ENUM).
    pub fn as_i64(&self) -> Result<i64> {
        let t = self.atom_tag()?;
        match t {
            TypeTag::Bool | TypeTag::U8 | TypeTag::Char => Ok(self.header().atom_bits() as i64),
            TypeTag::I16
            | TypeTag::I32
            | TypeTag::I64
            | TypeTag::Date
            | TypeTag::Time
            | TypeTag::Timestamp
            | TypeTag::Sym
            | TypeTag::Enum => Ok(self.header().atom_bits() as i64),
            t => Err(Error::Type(format!("expected integral atom, found {t:?}"))),
        }
    }

    /// Float value, promoting integral atoms.
    pub fn as_f64(&self) -> Result<f64> {
        match self.atom_tag()? {
            TypeTag::F64 => Ok(f64::from_bits(self.header().atom_bits())),
            _ => Ok(self.as_i64()? as f64),
        }
    }

    /// Borrow the bytes of a STR atom.
    pub fn as_str_bytes(&self) -> Result<&[u8]> {
        if self.atom_tag()? != TypeTag::Str {
            return Err(Error::Type(format!("tag {} is not a string atom", self.tag())));
        }
        let n = self.header().len() as usize;
        unsafe {
            if n <= 6 {
                Ok(&self.header().sso_bytes()[..n])
            } else {
                let chars = self.header().atom_obj();
                Ok(std::slice::from_raw_parts(data(chars), n))
            }
        }
    }

    pub fn as_guid(&self) -> Result<[u8; 16]> {
        if self.atom_tag()? != TypeTag::Guid {
            return Err(Error::Type(format!("tag {} is not a GUID atom", self.tag())));
        }
        let payload = self.header().atom_obj();
        let mut out = [0u8; 16];
        unsafe { std::ptr::copy_nonoverlapping(data(payload), out.as_mut_ptr(), 16) };
        Ok(out)
    }

    /// Whole-block byte size (header + capacity), diagnostic.
    pub fn block_bytes(&self) -> usize {
        1usize << self.header().order
    }

    pub(crate) fn attrs(&self) -> Attrs {
        self.header().attrs()
    }

    pub(crate) fn elem_width(&self) -> usize {
        self.header().elem_width()
    }

    /// Capacity check helper shared by the append paths.
    pub(crate) fn capacity_elems(&self) -> i64 {
        self.header().capacity_elems()
    }

    /// Header-size constant re-exported for the storage layer.
    pub(crate) const HDR: usize = HDR_BYTES;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_round_trips() -> Result<()> {
        assert!(Value::bool_atom(true)?.as_bool()?);
        assert_eq!(Value::i64_atom(-42)?.as_i64()?, -42);
        assert_eq!(Value::i32_atom(7)?.as_i64()?, 7);
        assert_eq!(Value::f64_atom(2.5)?.as_f64()?, 2.5);
        assert_eq!(Value::i64_atom(3)?.as_f64()?, 3.0);
        assert_eq!(Value::sym_atom(12)?.as_i64()?, 12);
        Ok(())
    }

    #[test]
    fn short_and_long_strings() -> Result<()> {
        let s = Value::str_atom("abc")?;
        assert_eq!(s.as_str_bytes()?, b"abc");
        let long = Value::str_atom("a much longer string payload")?;
        assert_eq!(long.as_str_bytes()?, b"a much longer string payload");
        Ok(())
    }

    #[test]
    fn clone_retains_drop_releases() -> Result<()> {
        let a = Value::i64_atom(1)?;
        assert_eq!(a.rc(), 1);
        let b = a.clone();
        assert_eq!(a.rc(), 2);
        drop(b);
        assert_eq!(a.rc(), 1);
        Ok(())
    }

    #[test]
    fn guid_atoms() -> Result<()> {
        let g = Value::guid_atom([7u8; 16])?;
        assert_eq!(g.as_guid()?, [7u8; 16]);
        Ok(())
    }
}
