//! Process-wide symbol interner.
//!
//! Column names and low-cardinality string values are stored once and
//! referred to by dense non-negative ids. The table is a bidirectional map:
//! an open-addressed FNV-1a hash from bytes to id, and an append-only
//! directory from id back to the interned string block. Ids are assigned
//! monotonically and never move for the process lifetime.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{OnceLock, RwLock};

use crate::block::Header;
use crate::error::{Error, Result};
use crate::types::Mmod;
use crate::value::Value;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

const SYM_FILE_MAGIC: u32 = 0x4d59_5342; // "BSYM"

#[inline]
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

struct Interner {
    /// Open-addressed slots holding directory ids; -1 marks empty.
    slots: Vec<i64>,
    /// Interned string blocks (CHAR vectors, `mmod = Static`), indexed by id.
    dir: Vec<*mut Header>,
}

// Directory blocks are immutable once published and never freed.
unsafe impl Send for Interner {}
unsafe impl Sync for Interner {}

static INTERNER: OnceLock<RwLock<Interner>> = OnceLock::new();

fn table() -> &'static RwLock<Interner> {
    INTERNER.get_or_init(|| {
        RwLock::new(Interner {
            slots: vec![-1; 1024],
            dir: Vec::new(),
        })
    })
}

impl Interner {
    fn probe(&self, bytes: &[u8]) -> std::result::Result<i64, usize> {
        let mask = self.slots.len() - 1;
        let mut i = fnv1a(bytes) as usize & mask;
        loop {
            let id = self.slots[i];
            if id < 0 {
                return Err(i);
            }
            if self.str_bytes(id) == bytes {
                return Ok(id);
            }
            i = (i + 1) & mask;
        }
    }

    fn str_bytes(&self, id: i64) -> &[u8] {
        let p = self.dir[id as usize];
        unsafe {
            std::slice::from_raw_parts(crate::block::data(p), (*p).len() as usize)
        }
    }

    fn insert_at(&mut self, slot: usize, bytes: &[u8]) -> Result<i64> {
        let block = Value::char_vec_from(bytes)?;
        let p = block.into_raw();
        // Interned strings are immortal; mark static so release never
        // returns them to a heap.
        unsafe { (*p).mmod = Mmod::Static as u8 };
        let id = self.dir.len() as i64;
        self.dir.push(p);
        self.slots[slot] = id;
        if self.dir.len() * 10 > self.slots.len() * 7 {
            self.grow();
        }
        Ok(id)
    }

    fn grow(&mut self) {
        let new_len = self.slots.len() * 2;
        let mut slots = vec![-1i64; new_len];
        let mask = new_len - 1;
        for id in 0..self.dir.len() as i64 {
            let mut i = fnv1a(self.str_bytes(id)) as usize & mask;
            while slots[i] >= 0 {
                i = (i + 1) & mask;
            }
            slots[i] = id;
        }
        self.slots = slots;
    }
}

/// Intern `bytes`, returning its stable id. Idempotent and thread-safe.
pub fn intern(bytes: &[u8]) -> Result<i64> {
    {
        let t = table().read().unwrap();
        if let Ok(id) = t.probe(bytes) {
            return Ok(id);
        }
    }
    let mut t = table().write().unwrap();
    // Re-probe under the write lock: a racing interner may have won.
    match t.probe(bytes) {
        Ok(id) => Ok(id),
        Err(slot) => t.insert_at(slot, bytes),
    }
}

/// Intern a UTF-8 string.
pub fn intern_str(s: &str) -> Result<i64> {
    intern(s.as_bytes())
}

/// Look up without interning.
pub fn find(bytes: &[u8]) -> Option<i64> {
    table().read().unwrap().probe(bytes).ok()
}

/// The interned bytes of `id`, as a shared immutable CHAR-vector block.
pub fn str_block(id: i64) -> Result<Value> {
    let t = table().read().unwrap();
    if id < 0 || id as usize >= t.dir.len() {
        return Err(Error::Range(format!("symbol id {id} out of range")));
    }
    Ok(Value::retaining(t.dir[id as usize]))
}

/// The interned bytes of `id`, copied into a `String`.
pub fn str_of(id: i64) -> Result<String> {
    let t = table().read().unwrap();
    if id < 0 || id as usize >= t.dir.len() {
        return Err(Error::Range(format!("symbol id {id} out of range")));
    }
    Ok(String::from_utf8_lossy(t.str_bytes(id)).into_owned())
}

/// Number of interned symbols.
pub fn count() -> usize {
    table().read().unwrap().dir.len()
}

/// Persist the directory in insertion order.
pub fn save(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let f = File::create(path).map_err(|e| Error::io("create", path, e))?;
    let mut w = BufWriter::new(f);
    let t = table().read().unwrap();
    let write = |w: &mut BufWriter<File>, bytes: &[u8]| -> std::io::Result<()> {
        w.write_all(&(bytes.len() as u32).to_le_bytes())?;
        w.write_all(bytes)
    };
    w.write_all(&SYM_FILE_MAGIC.to_le_bytes())
        .and_then(|()| w.write_all(&(t.dir.len() as u32).to_le_bytes()))
        .map_err(|e| Error::io("write", path, e))?;
    for id in 0..t.dir.len() as i64 {
        write(&mut w, t.str_bytes(id)).map_err(|e| Error::io("write", path, e))?;
    }
    w.flush().map_err(|e| Error::io("flush", path, e))
}

/// Restore a directory saved by [`save`], re-interning every string in its
/// original order. Called before any other interning on startup, each
/// string keeps the id it had when saved.
pub fn load(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let f = File::open(path).map_err(|e| Error::io("open", path, e))?;
    let mut r = BufReader::new(f);
    let mut u32buf = [0u8; 4];
    r.read_exact(&mut u32buf)
        .map_err(|e| Error::io("read", path, e))?;
    if u32::from_le_bytes(u32buf) != SYM_FILE_MAGIC {
        return Err(Error::Schema(format!(
            "{} is not a symbol directory",
            path.display()
        )));
    }
    r.read_exact(&mut u32buf)
        .map_err(|e| Error::io("read", path, e))?;
    let count = u32::from_le_bytes(u32buf);
    let mut buf = Vec::new();
    for _ in 0..count {
        r.read_exact(&mut u32buf)
            .map_err(|e| Error::io("read", path, e))?;
        let n = u32::from_le_bytes(u32buf) as usize;
        buf.resize(n, 0);
        r.read_exact(&mut buf)
            .map_err(|e| Error::io("read", path, e))?;
        intern(&buf)?;
    }
    log::debug!("loaded {count} symbols from {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() -> Result<()> {
        let a = intern(b"aapl")?;
        let b = intern(b"aapl")?;
        assert_eq!(a, b);
        assert_eq!(str_of(a)?, "aapl");
        Ok(())
    }

    #[test]
    fn distinct_strings_get_distinct_ids() -> Result<()> {
        let a = intern(b"alpha")?;
        let b = intern(b"beta")?;
        assert_ne!(a, b);
        assert_eq!(find(b"alpha"), Some(a));
        assert_eq!(find(b"never interned by anyone"), None);
        Ok(())
    }

    #[test]
    fn round_trips_many_through_growth() -> Result<()> {
        let mut ids = Vec::new();
        for i in 0..2000 {
            ids.push((format!("sym_{i}"), intern_str(&format!("sym_{i}"))?));
        }
        for (s, id) in ids {
            assert_eq!(intern_str(&s)?, id);
            assert_eq!(str_of(id)?, s);
        }
        Ok(())
    }

    #[test]
    fn concurrent_interners_agree() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    (0..200)
                        .map(|i| intern_str(&format!("shared_{i}")).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<i64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
    }
}
