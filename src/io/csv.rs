//! Parallel, zero-copy CSV ingest.
//!
//! The loader maps the file read-only, detects the delimiter, scans row
//! offsets (a byte scan when the file is quote-free, a quote-parity scan
//! otherwise), infers column types from a sample of rows, allocates output
//! columns at final size, and parses row ranges on the worker pool with
//! every worker writing its rows into every column directly.
//!
//! String columns cannot intern into the global table from inside a worker:
//! each task builds a private symbol table and stores packed
//! `(task, local_id)` codes; after the parallel pass the main thread
//! interns each unique string once and rewrites the codes to global ids.
//! The returned table is entirely heap-backed — the mapping is gone before
//! `read_csv` returns.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::block::data;
use crate::error::{Error, Result};
use crate::sym;
use crate::table::col_nrows;
use crate::task;
use crate::types::TypeTag;
use crate::value::Value;

/// Rows sampled for type inference.
const INFER_ROWS: usize = 100;

/// Below this many rows the loader parses serially.
const SERIAL_ROWS: usize = 4096;

/// Rows per parallel parse task; a multiple of 8 so null-bitmap bytes are
/// never shared between tasks.
const ROWS_PER_TASK: usize = task::TASK_GRAIN as usize;

/// Caller-supplied overrides for [`read_csv_opts`].
#[derive(Debug, Clone, Default)]
pub struct CsvOptions {
    /// Field delimiter; autodetected (comma vs tab) when `None`.
    pub delimiter: Option<u8>,
    /// Whether the first row is a header; heuristic when `None`.
    pub header: Option<bool>,
    /// Per-column type overrides, positional; inferred when `None`.
    pub types: Option<Vec<TypeTag>>,
}

struct FileMap {
    ptr: *mut u8,
    len: usize,
}

impl FileMap {
    fn open(path: &Path) -> Result<FileMap> {
        let f = File::open(path).map_err(|e| Error::io("open", path, e))?;
        let len = f
            .metadata()
            .map_err(|e| Error::io("stat", path, e))?
            .len() as usize;
        if len == 0 {
            return Ok(FileMap {
                ptr: std::ptr::null_mut(),
                len: 0,
            });
        }
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                f.as_raw_fd(),
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::io("mmap", path, std::io::Error::last_os_error()));
        }
        unsafe { libc::madvise(raw, len, libc::MADV_SEQUENTIAL) };
        Ok(FileMap {
            ptr: raw as *mut u8,
            len,
        })
    }

    fn bytes(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        }
    }
}

/// Read a CSV file with autodetected delimiter, header and types.
pub fn read_csv(path: impl AsRef<Path>) -> Result<Value> {
    read_csv_opts(path, CsvOptions::default())
}

/// Read a CSV file with explicit options.
pub fn read_csv_opts(path: impl AsRef<Path>, opts: CsvOptions) -> Result<Value> {
    let path = path.as_ref();
    let map = FileMap::open(path)?;
    let bytes = map.bytes();
    if bytes.is_empty() {
        return Value::table();
    }

    let delim = opts.delimiter.unwrap_or_else(|| detect_delimiter(bytes));
    let quoted = bytes.contains(&b'"');
    let lines = scan_rows(bytes, quoted);
    if lines.is_empty() {
        return Value::table();
    }

    let first_fields = split_fields(bytes, lines[0], delim);
    let ncols = first_fields.len();
    let header = opts
        .header
        .unwrap_or_else(|| looks_like_header(bytes, &first_fields));
    let names: Vec<String> = if header {
        first_fields
            .iter()
            .map(|f| String::from_utf8_lossy(&f.text(bytes)).into_owned())
            .collect()
    } else {
        (1..=ncols).map(|i| format!("V{i}")).collect()
    };
    let rows = if header { &lines[1..] } else { &lines[..] };
    let nrows = rows.len();

    let col_types = match opts.types {
        Some(ts) if ts.len() == ncols => ts,
        Some(ts) => {
            return Err(Error::Schema(format!(
                "{} type overrides for {ncols} columns",
                ts.len()
            )));
        }
        None => infer_types(bytes, rows, delim, ncols),
    };
    log::debug!(
        "csv {}: {nrows} rows x {ncols} cols, delimiter {:?}, header {header}",
        path.display(),
        delim as char
    );

    let ctx = ParseCtx::new(bytes, rows, delim, &col_types, nrows)?;
    if nrows < SERIAL_ROWS {
        parse_rows(&ctx, 0, nrows as i64);
    } else {
        task::dispatch_range(&ctx, nrows as i64, parse_rows)?;
    }
    ctx.take_error()?;

    let cols = ctx.finish()?;
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    Value::table_from(&name_refs, cols)
}

/// Write a table as CSV with a header row. Nulls become empty fields;
/// strings are quoted when they contain the delimiter, a quote or a
/// newline.
pub fn write_csv(table: &Value, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let f = File::create(path).map_err(|e| Error::io("create", path, e))?;
    let mut w = std::io::BufWriter::new(f);
    let werr = |e| Error::io("write", path.to_path_buf(), e);

    let ncols = table.ncols();
    for c in 0..ncols {
        if c > 0 {
            w.write_all(b",").map_err(werr)?;
        }
        let name = sym::str_of(table.col_name(c)?)?;
        w.write_all(name.as_bytes()).map_err(werr)?;
    }
    w.write_all(b"\n").map_err(werr)?;

    // Parted columns and the partition map flatten so rows stream in
    // global order.
    let cols: Vec<Value> = (0..ncols)
        .map(|c| crate::exec::materialize_col(&table.col_by_idx(c)?))
        .collect::<Result<_>>()?;
    let nrows = if ncols > 0 { col_nrows(&cols[0]) } else { 0 };
    let mut field = String::new();
    for r in 0..nrows {
        for (c, col) in cols.iter().enumerate() {
            if c > 0 {
                w.write_all(b",").map_err(werr)?;
            }
            field.clear();
            format_cell(col, r, &mut field)?;
            if field.contains(',') || field.contains('"') || field.contains('\n') {
                let escaped = field.replace('"', "\"\"");
                w.write_all(b"\"").map_err(werr)?;
                w.write_all(escaped.as_bytes()).map_err(werr)?;
                w.write_all(b"\"").map_err(werr)?;
            } else {
                w.write_all(field.as_bytes()).map_err(werr)?;
            }
        }
        w.write_all(b"\n").map_err(werr)?;
    }
    w.flush().map_err(|e| Error::io("flush", path, e))
}

fn format_cell(col: &Value, row: i64, out: &mut String) -> Result<()> {
    use std::fmt::Write as _;
    if col.is_null_at(row)? {
        return Ok(());
    }
    match col.vec_tag_or_base()? {
        TypeTag::Bool => out.push_str(if col.get_i64(row)? != 0 { "true" } else { "false" }),
        TypeTag::F64 => {
            let _ = write!(out, "{}", col.get_f64(row)?);
        }
        TypeTag::Sym => out.push_str(&sym::str_of(col.get_i64(row)?)?),
        _ => {
            let _ = write!(out, "{}", col.get_i64(row)?);
        }
    }
    Ok(())
}

// ----- structural scanning -----

fn detect_delimiter(bytes: &[u8]) -> u8 {
    let first = &bytes[..bytes.iter().position(|&b| b == b'\n').unwrap_or(bytes.len())];
    let commas = first.iter().filter(|&&b| b == b',').count();
    let tabs = first.iter().filter(|&&b| b == b'\t').count();
    if tabs > commas { b'\t' } else { b',' }
}

/// Offsets of row starts. The fast path scans for newlines; the slow path
/// tracks quote parity so newlines inside `"..."` do not split rows.
fn scan_rows(bytes: &[u8], quoted: bool) -> Vec<usize> {
    let mut rows = Vec::new();
    if bytes.is_empty() {
        return rows;
    }
    rows.push(0);
    if !quoted {
        for i in 0..bytes.len() {
            if bytes[i] == b'\n' && i + 1 < bytes.len() {
                rows.push(i + 1);
            }
        }
    } else {
        let mut in_quotes = false;
        for i in 0..bytes.len() {
            match bytes[i] {
                b'"' => in_quotes = !in_quotes,
                b'\n' if !in_quotes && i + 1 < bytes.len() => rows.push(i + 1),
                _ => {}
            }
        }
    }
    // Drop a phantom row made of nothing but line-ending bytes.
    if let Some(&last) = rows.last() {
        if bytes[last..].iter().all(|&b| b == b'\r' || b == b'\n') {
            rows.pop();
        }
    }
    rows
}

/// One field within a row: byte range plus whether it was quoted.
#[derive(Clone, Copy)]
struct Field {
    start: usize,
    end: usize,
    quoted: bool,
}

impl Field {
    fn raw<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        &bytes[self.start..self.end]
    }

    /// Field text with quotes stripped and `""` collapsed.
    fn text(&self, bytes: &[u8]) -> Vec<u8> {
        let raw = self.raw(bytes);
        if !self.quoted {
            return raw.to_vec();
        }
        let inner = &raw[1..raw.len().saturating_sub(1).max(1)];
        let mut out = Vec::with_capacity(inner.len());
        let mut i = 0;
        while i < inner.len() {
            if inner[i] == b'"' && i + 1 < inner.len() && inner[i + 1] == b'"' {
                out.push(b'"');
                i += 2;
            } else {
                out.push(inner[i]);
                i += 1;
            }
        }
        out
    }
}

fn split_fields(bytes: &[u8], row_start: usize, delim: u8) -> Vec<Field> {
    let mut fields = Vec::new();
    let mut i = row_start;
    let mut field_start = row_start;
    let mut quoted = false;
    let mut in_quotes = false;
    loop {
        let at_end = i >= bytes.len() || (!in_quotes && bytes[i] == b'\n');
        if at_end || (!in_quotes && bytes[i] == delim) {
            let mut end = i;
            if end > field_start && bytes[end - 1] == b'\r' {
                end -= 1;
            }
            fields.push(Field {
                start: field_start,
                end,
                quoted,
            });
            if at_end {
                return fields;
            }
            field_start = i + 1;
            quoted = false;
        } else if bytes[i] == b'"' {
            if !in_quotes && i == field_start {
                in_quotes = true;
                quoted = true;
            } else if in_quotes {
                if i + 1 < bytes.len() && bytes[i + 1] == b'"' {
                    i += 1; // escaped quote
                } else {
                    in_quotes = false;
                }
            }
        }
        i += 1;
    }
}

// ----- type inference -----

#[derive(Clone, Copy, PartialEq)]
enum Lattice {
    Unknown,
    Bool,
    I64,
    F64,
    Str,
}

impl Lattice {
    fn join(self, other: Lattice) -> Lattice {
        use Lattice::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Unknown, x) | (x, Unknown) => x,
            (I64, F64) | (F64, I64) => F64,
            _ => Str,
        }
    }

    fn classify(text: &[u8]) -> Lattice {
        if text.is_empty() {
            return Lattice::Unknown;
        }
        if text == b"true" || text == b"false" {
            return Lattice::Bool;
        }
        if parse_i64(text).is_some() {
            return Lattice::I64;
        }
        if parse_f64(text).is_some() {
            return Lattice::F64;
        }
        Lattice::Str
    }

    fn tag(self) -> TypeTag {
        match self {
            Lattice::Bool => TypeTag::Bool,
            Lattice::I64 => TypeTag::I64,
            Lattice::F64 => TypeTag::F64,
            // All-empty columns load as string columns of nulls.
            Lattice::Unknown | Lattice::Str => TypeTag::Sym,
        }
    }
}

/// A row where no field looks numeric or boolean is taken as a header.
fn looks_like_header(bytes: &[u8], fields: &[Field]) -> bool {
    !fields.is_empty()
        && fields.iter().all(|f| {
            matches!(
                Lattice::classify(&f.text(bytes)),
                Lattice::Str | Lattice::Unknown
            )
        })
}

fn infer_types(bytes: &[u8], rows: &[usize], delim: u8, ncols: usize) -> Vec<TypeTag> {
    let mut lattice = vec![Lattice::Unknown; ncols];
    for &row in rows.iter().take(INFER_ROWS) {
        let fields = split_fields(bytes, row, delim);
        for (c, f) in fields.iter().take(ncols).enumerate() {
            lattice[c] = lattice[c].join(Lattice::classify(&f.text(bytes)));
        }
    }
    lattice.into_iter().map(Lattice::tag).collect()
}

// ----- numeric parsing -----

static POW10: [f64; 23] = [
    1e0, 1e1, 1e2, 1e3, 1e4, 1e5, 1e6, 1e7, 1e8, 1e9, 1e10, 1e11, 1e12, 1e13, 1e14, 1e15, 1e16,
    1e17, 1e18, 1e19, 1e20, 1e21, 1e22,
];

fn pow10(e: i32) -> f64 {
    let a = e.unsigned_abs() as usize;
    let p = if a < POW10.len() {
        POW10[a]
    } else {
        10f64.powi(a as i32)
    };
    if e < 0 { 1.0 / p } else { p }
}

/// Inline decimal integer parser: optional sign, digits only.
fn parse_i64(text: &[u8]) -> Option<i64> {
    let (neg, digits) = match text.first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() || digits.len() > 19 {
        return None;
    }
    let mut v: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        v = v.checked_mul(10)?.checked_add((b - b'0') as i64)?;
    }
    Some(if neg { -v } else { v })
}

/// Inline float parser: digit scan plus a pow10 table for the exponent.
fn parse_f64(text: &[u8]) -> Option<f64> {
    let (neg, rest) = match text.first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let mut mant: u64 = 0;
    let mut exp: i32 = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            b'0'..=b'9' => {
                seen_digit = true;
                if mant < u64::MAX / 10 - 9 {
                    mant = mant * 10 + (rest[i] - b'0') as u64;
                    if seen_dot {
                        exp -= 1;
                    }
                } else if !seen_dot {
                    exp += 1;
                }
            }
            b'.' if !seen_dot => seen_dot = true,
            b'e' | b'E' => {
                if !seen_digit {
                    return None;
                }
                let e = parse_i64(&rest[i + 1..])?;
                exp += e as i32;
                i = rest.len();
                continue;
            }
            _ => return None,
        }
        i += 1;
    }
    if !seen_digit {
        return None;
    }
    let v = mant as f64 * pow10(exp);
    Some(if neg { -v } else { v })
}

// ----- parallel parse -----

/// Private symbol table one parse task fills: arena of unique strings plus
/// a lookup map. Column codes are `(task_index << 40) | local_id`.
#[derive(Default)]
struct LocalSyms {
    arena: Vec<Vec<u8>>,
    lookup: HashMap<Vec<u8>, u32>,
}

impl LocalSyms {
    fn intern(&mut self, text: Vec<u8>) -> u32 {
        if let Some(&id) = self.lookup.get(&text) {
            return id;
        }
        let id = self.arena.len() as u32;
        self.arena.push(text.clone());
        self.lookup.insert(text, id);
        id
    }
}

struct ColTarget {
    tag: TypeTag,
    col: Value,
    /// Raw bitmap pointer for the parallel path (rows > 128), or null.
    bitmap: *mut u8,
    has_nulls: AtomicBool,
}

struct ParseCtx<'a> {
    bytes: &'a [u8],
    rows: &'a [usize],
    delim: u8,
    cols: Vec<ColTarget>,
    locals: Vec<UnsafeCell<LocalSyms>>,
    error: AtomicBool,
}

// Tasks write disjoint row ranges of each column; bitmap bytes never span
// tasks because ranges are multiples of 8 rows.
unsafe impl Sync for ParseCtx<'_> {}

impl<'a> ParseCtx<'a> {
    fn new(
        bytes: &'a [u8],
        rows: &'a [usize],
        delim: u8,
        types: &[TypeTag],
        nrows: usize,
    ) -> Result<ParseCtx<'a>> {
        let mut cols = Vec::with_capacity(types.len());
        for &tag in types {
            let col = if tag == TypeTag::Sym {
                Value::sym_vec(8, nrows as i64)?
            } else {
                Value::vec(tag, nrows as i64)?
            };
            unsafe {
                std::ptr::write_bytes(data(col.raw()), 0, nrows * col.elem_width());
                (*col.raw()).set_len(nrows as i64);
            }
            // Long columns pre-build the external bitmap so workers can set
            // bits without coordination.
            let bitmap = if nrows as i64 > crate::block::INLINE_NULL_ROWS {
                let nbytes = nrows.div_ceil(8);
                let map = Value::vec(TypeTag::U8, nbytes as i64)?;
                unsafe {
                    std::ptr::write_bytes(data(map.raw()), 0, nbytes);
                    (*map.raw()).set_len(nbytes as i64);
                    let bits = data(map.raw());
                    (*col.raw()).set_ext_nullmap(map.into_raw());
                    (*col.raw()).attrs |= crate::types::Attrs::NULLMAP_EXT.bits();
                    bits
                }
            } else {
                std::ptr::null_mut()
            };
            cols.push(ColTarget {
                tag,
                col,
                bitmap,
                has_nulls: AtomicBool::new(false),
            });
        }
        let n_tasks = nrows.div_ceil(ROWS_PER_TASK).max(1);
        let locals = (0..n_tasks)
            .map(|_| UnsafeCell::new(LocalSyms::default()))
            .collect();
        Ok(ParseCtx {
            bytes,
            rows,
            delim,
            cols,
            locals,
            error: AtomicBool::new(false),
        })
    }

    fn take_error(&self) -> Result<()> {
        if self.error.load(Ordering::Acquire) {
            Err(Error::Schema("malformed CSV row".into()))
        } else {
            Ok(())
        }
    }

    /// Rewrite packed sym codes to global ids and finalize null flags.
    fn finish(self) -> Result<Vec<Value>> {
        let mut remap: Vec<Vec<i64>> = Vec::with_capacity(self.locals.len());
        for cell in &self.locals {
            let local = unsafe { &*cell.get() };
            let mut ids = Vec::with_capacity(local.arena.len());
            for s in &local.arena {
                ids.push(sym::intern(s)?);
            }
            remap.push(ids);
        }
        let nrows = self.rows.len();
        let mut out = Vec::with_capacity(self.cols.len());
        for target in self.cols {
            let col = target.col;
            unsafe {
                if target.tag == TypeTag::Sym {
                    let vals = data(col.raw()) as *mut i64;
                    for r in 0..nrows {
                        let packed = *vals.add(r);
                        let (t, local) =
                            ((packed >> 40) as usize, (packed & 0xff_ffff_ffff) as usize);
                        *vals.add(r) = remap[t][local];
                    }
                }
                if target.has_nulls.load(Ordering::Acquire) {
                    (*col.raw()).attrs |= crate::types::Attrs::HAS_NULLS.bits();
                } else if !target.bitmap.is_null() {
                    // No nulls materialized: drop the speculative bitmap.
                    let map = (*col.raw()).ext_nullmap();
                    (*col.raw()).head = [0; 16];
                    (*col.raw()).attrs &= !crate::types::Attrs::NULLMAP_EXT.bits();
                    crate::block::release_raw(map);
                }
            }
            out.push(col);
        }
        Ok(out)
    }

    fn set_null(&self, c: usize, row: usize) {
        let target = &self.cols[c];
        target.has_nulls.store(true, Ordering::Release);
        unsafe {
            if target.bitmap.is_null() {
                (*target.col.raw()).set_inline_null(row as i64, true);
            } else {
                *target.bitmap.add(row >> 3) |= 1 << (row & 7);
            }
        }
    }
}

/// Parse rows `[start, end)` into every column. Runs on the pool.
fn parse_rows(ctx: &ParseCtx<'_>, start: i64, end: i64) {
    let task_idx = (start as usize / ROWS_PER_TASK).min(ctx.locals.len() - 1);
    let local = unsafe { &mut *ctx.locals[task_idx].get() };
    for r in start as usize..end as usize {
        let fields = split_fields(ctx.bytes, ctx.rows[r], ctx.delim);
        for (c, target) in ctx.cols.iter().enumerate() {
            let text: Vec<u8> = match fields.get(c) {
                Some(f) => f.text(ctx.bytes),
                None => Vec::new(),
            };
            unsafe {
                let d = data(target.col.raw());
                match target.tag {
                    TypeTag::Sym => {
                        if text.is_empty() {
                            ctx.set_null(c, r);
                        }
                        let id = local.intern(text);
                        *(d as *mut i64).add(r) = ((task_idx as i64) << 40) | id as i64;
                    }
                    _ if text.is_empty() => ctx.set_null(c, r),
                    TypeTag::Bool => {
                        *d.add(r) = (text == b"true") as u8;
                    }
                    TypeTag::I64 | TypeTag::Time | TypeTag::Timestamp => match parse_i64(&text) {
                        Some(v) => *(d as *mut i64).add(r) = v,
                        None => ctx.set_null(c, r),
                    },
                    TypeTag::I32 | TypeTag::Date => match parse_i64(&text) {
                        Some(v) => *(d as *mut i32).add(r) = v as i32,
                        None => ctx.set_null(c, r),
                    },
                    TypeTag::F64 => match parse_f64(&text) {
                        Some(v) => *(d as *mut f64).add(r) = v,
                        None => ctx.set_null(c, r),
                    },
                    _ => ctx.error.store(true, Ordering::Release),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_parser_handles_signs_and_garbage() {
        assert_eq!(parse_i64(b"42"), Some(42));
        assert_eq!(parse_i64(b"-7"), Some(-7));
        assert_eq!(parse_i64(b"+13"), Some(13));
        assert_eq!(parse_i64(b""), None);
        assert_eq!(parse_i64(b"12x"), None);
        assert_eq!(parse_i64(b"1.5"), None);
    }

    #[test]
    fn float_parser_handles_exponents() {
        assert_eq!(parse_f64(b"2.5"), Some(2.5));
        assert_eq!(parse_f64(b"-0.125"), Some(-0.125));
        assert_eq!(parse_f64(b"1e3"), Some(1000.0));
        assert_eq!(parse_f64(b"2.5e-2"), Some(0.025));
        assert_eq!(parse_f64(b"abc"), None);
    }

    #[test]
    fn quoted_fields_unescape() {
        let bytes = b"a,\"x,\"\"y\"\"\",c\n";
        let fields = split_fields(bytes, 0, b',');
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1].text(bytes), b"x,\"y\"");
    }

    #[test]
    fn row_scan_respects_embedded_newlines() {
        let bytes = b"a,b\n\"line1\nline2\",2\nc,3\n";
        let rows = scan_rows(bytes, true);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn delimiter_detection_prefers_tabs_when_dominant() {
        assert_eq!(detect_delimiter(b"a\tb\tc\n1\t2\t3\n"), b'\t');
        assert_eq!(detect_delimiter(b"a,b,c\n"), b',');
    }
}
