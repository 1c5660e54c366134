//! Single-column on-disk format.
//!
//! A column file is the 32-byte block header (canonical little-endian)
//! followed by the element payload and, when the vector carries an external
//! null bitmap, the bitmap bytes appended after the payload. Loading maps
//! the file privately, so the returned block *is* the mapping: `mmod` is
//! stamped to `Mmap`, the block's lifetime owns the mapping, and the last
//! release unmaps it. Copy-on-write of a mapped block produces a heap copy
//! and leaves the mapping untouched.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::block::{data, Header, HDR_BYTES};
use crate::error::{Error, Result};
use crate::types::{Attrs, Mmod, TypeTag};
use crate::value::Value;

/// Bitmap bytes needed for `rows` rows.
fn bitmap_bytes(rows: i64) -> usize {
    (rows as usize).div_ceil(8)
}

/// Total file (and mapping) length implied by a column header.
fn mapped_len(h: &Header) -> usize {
    let mut n = HDR_BYTES + h.payload_bytes();
    if h.attrs().contains(Attrs::NULLMAP_EXT) {
        n += bitmap_bytes(h.len());
    }
    n
}

/// Unmap an `mmod = Mmap` block on its final release. Children (including
/// the heap copy of the bitmap) were already released by the caller.
pub(crate) fn unmap_block(p: *mut Header) {
    unsafe {
        let len = mapped_len(&*p);
        libc::munmap(p as *mut libc::c_void, len);
    }
}

/// Persist a dense vector to `path` in the single-column format. Slices
/// are materialized first.
pub fn col_save(col: &Value, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if !col.header().is_vec() {
        return Err(Error::Type(format!(
            "tag {} is not a column vector",
            col.tag()
        )));
    }
    let dense = col.materialize()?;
    let h = dense.header();

    let mut header_bytes = [0u8; HDR_BYTES];
    unsafe {
        std::ptr::copy_nonoverlapping(
            dense.raw() as *const u8,
            header_bytes.as_mut_ptr(),
            HDR_BYTES,
        );
    }
    if h.attrs().contains(Attrs::NULLMAP_EXT) {
        // Never let a heap pointer reach the disk; the bitmap is appended
        // after the payload instead.
        header_bytes[..16].fill(0);
    }
    // Canonical memory mode and refcount for the file image.
    header_bytes[16] = Mmod::Mmap as u8;
    header_bytes[20..24].copy_from_slice(&1u32.to_le_bytes());

    use std::io::Write;
    let f = File::create(path).map_err(|e| Error::io("create", path, e))?;
    let mut w = std::io::BufWriter::new(f);
    w.write_all(&header_bytes)
        .map_err(|e| Error::io("write", path, e))?;
    unsafe {
        let payload = std::slice::from_raw_parts(data(dense.raw()), h.payload_bytes());
        w.write_all(payload).map_err(|e| Error::io("write", path, e))?;
        if h.attrs().contains(Attrs::NULLMAP_EXT) {
            let map = h.ext_nullmap();
            let bytes = std::slice::from_raw_parts(data(map), bitmap_bytes(h.len()));
            w.write_all(bytes).map_err(|e| Error::io("write", path, e))?;
        }
    }
    w.flush().map_err(|e| Error::io("flush", path, e))
}

/// Map a column file. The result is a zero-copy `Mmap` block; an appended
/// null bitmap is rehydrated into a heap block so no file offset is ever
/// interpreted as a pointer.
pub fn col_load(path: impl AsRef<Path>) -> Result<Value> {
    let path = path.as_ref();
    let f = File::open(path).map_err(|e| Error::io("open", path, e))?;
    let file_len = f
        .metadata()
        .map_err(|e| Error::io("stat", path, e))?
        .len() as usize;
    if file_len < HDR_BYTES {
        return Err(Error::Corrupt(format!(
            "{}: {file_len} bytes is smaller than a block header",
            path.display()
        )));
    }
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            file_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE,
            f.as_raw_fd(),
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(Error::io("mmap", path, std::io::Error::last_os_error()));
    }
    let p = raw as *mut Header;

    // Header sanity before trusting any length field.
    let sane = unsafe {
        let t = (*p).tag;
        let len = (*p).len();
        t > 0 && t < 16 && TypeTag::try_from(t).is_ok() && len >= 0
    };
    if !sane {
        unsafe { libc::munmap(raw, file_len) };
        return Err(Error::Corrupt(format!(
            "{}: header failed sanity checks",
            path.display()
        )));
    }
    let expect = unsafe { mapped_len(&*p) };
    if expect > file_len {
        unsafe { libc::munmap(raw, file_len) };
        return Err(Error::Schema(format!(
            "{}: header implies {expect} bytes but file has {file_len}",
            path.display()
        )));
    }

    unsafe {
        (*p).mmod = Mmod::Mmap as u8;
        (*p).rc = std::sync::atomic::AtomicU32::new(1);
        // Restamp the order from the payload actually present, so a
        // copy-on-write of this block sizes its heap copy correctly.
        let need = (HDR_BYTES + (*p).payload_bytes()).next_power_of_two();
        (*p).order = need.trailing_zeros().max(5) as u8;
        if (*p).attrs().contains(Attrs::NULLMAP_EXT) {
            let rows = (*p).len();
            let nbytes = bitmap_bytes(rows);
            let appended = (p as *const u8).add(HDR_BYTES + (*p).payload_bytes());
            let map = Value::vec(TypeTag::U8, nbytes as i64)?;
            std::ptr::copy_nonoverlapping(appended, data(map.raw()), nbytes);
            (*map.raw()).set_len(nbytes as i64);
            (*p).head = [0; 16];
            (*p).set_ext_nullmap(map.into_raw());
        }
    }
    log::trace!("mapped column {} ({file_len} bytes)", path.display());
    Ok(Value::from_raw(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_dense_i64() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v");
        let col = Value::i64_vec(&[5, -7, 11])?;
        col_save(&col, &path)?;
        let loaded = col_load(&path)?;
        assert_eq!(loaded.header().mmod(), Mmod::Mmap);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get_i64(1)?, -7);
        Ok(())
    }

    #[test]
    fn round_trip_inline_nullmap() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v");
        let mut col = Value::i64_vec(&[1, 2, 3, 4])?;
        col.set_null(2, true)?;
        col_save(&col, &path)?;
        let loaded = col_load(&path)?;
        assert!(loaded.is_null_at(2)?);
        assert!(!loaded.is_null_at(1)?);
        Ok(())
    }

    #[test]
    fn round_trip_external_nullmap_past_128_rows() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v");
        let mut col = Value::vec(TypeTag::I64, 200)?;
        for i in 0..200 {
            col.push_i64(i)?;
        }
        col.set_null(150, true)?;
        col_save(&col, &path)?;
        let loaded = col_load(&path)?;
        assert_eq!(loaded.len(), 200);
        assert!(loaded.is_null_at(150)?);
        assert!(!loaded.is_null_at(149)?);
        assert_eq!(loaded.get_i64(199)?, 199);
        Ok(())
    }

    #[test]
    fn cow_of_mapped_block_is_heap_backed() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v");
        col_save(&Value::i64_vec(&[1, 2, 3])?, &path)?;
        let mut loaded = col_load(&path)?;
        loaded.set_i64(0, 99)?;
        assert_eq!(loaded.header().mmod(), Mmod::Heap);
        assert_eq!(loaded.get_i64(0)?, 99);
        // The file is untouched (the mapping was private).
        let again = col_load(&path)?;
        assert_eq!(again.get_i64(0)?, 1);
        Ok(())
    }

    #[test]
    fn truncated_file_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(col_load(&path), Err(Error::Corrupt(_))));
        Ok(())
    }
}
