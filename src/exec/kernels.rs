//! Element-wise morsel kernels.
//!
//! Type dispatch happens once at kernel-selection time: the outer switch
//! picks a monomorphic scalar function and the inner loop runs it over
//! 1024-row morsels. Ranges at or above the parallel threshold go through
//! the worker pool; task ranges are grain-aligned, so null-bitmap bytes
//! are never shared between tasks.
//!
//! NULL semantics: arithmetic propagates element-wise (null in, null out)
//! and comparisons with a NULL operand produce NULL, never a definite
//! true/false. FILTER later treats a null predicate row as not selected.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use paste::paste;

use crate::block::{self, data, Header, INLINE_NULL_ROWS};
use crate::error::{Error, Result};
use crate::graph::Opcode;
use crate::task;
use crate::types::{Attrs, TypeTag, PARALLEL_THRESHOLD};
use crate::value::Value;
use crate::vec::read_int;

// ----- scalar kernels -----

macro_rules! arith_kernels {
    ($( $name:ident => ($ix:expr, $fx:expr) ),* $(,)?) => {
        paste! {
            $(
                #[inline]
                fn [<int_ $name>](x: i64, y: i64) -> i64 { let f: fn(i64, i64) -> i64 = $ix; f(x, y) }
                #[inline]
                fn [<f64_ $name>](x: f64, y: f64) -> f64 { let f: fn(f64, f64) -> f64 = $fx; f(x, y) }
            )*
        }
    };
}

arith_kernels! {
    add => (|x, y| x.wrapping_add(y), |x, y| x + y),
    sub => (|x, y| x.wrapping_sub(y), |x, y| x - y),
    mul => (|x, y| x.wrapping_mul(y), |x, y| x * y),
    // INT_MIN / -1 saturates instead of trapping; modulo by zero yields 0.
    modulo => (
        |x, y| if y == 0 { 0 } else if x == i64::MIN && y == -1 { i64::MIN } else { x.wrapping_rem(y) },
        |x, y| if y == 0.0 { 0.0 } else { x % y }
    ),
    min2 => (|x, y| x.min(y), |x, y| if x.is_nan() || y.is_nan() { f64::NAN } else { x.min(y) }),
    max2 => (|x, y| x.max(y), |x, y| if x.is_nan() || y.is_nan() { f64::NAN } else { x.max(y) }),
}

fn int_fn(op: Opcode) -> Result<fn(i64, i64) -> i64> {
    Ok(match op {
        Opcode::Add => int_add,
        Opcode::Sub => int_sub,
        Opcode::Mul => int_mul,
        Opcode::Mod => int_modulo,
        Opcode::Min2 => int_min2,
        Opcode::Max2 => int_max2,
        Opcode::And => |x, y| ((x != 0) && (y != 0)) as i64,
        Opcode::Or => |x, y| ((x != 0) || (y != 0)) as i64,
        _ => return Err(Error::Type(format!("{op:?} has no integer kernel"))),
    })
}

fn float_fn(op: Opcode) -> Result<fn(f64, f64) -> f64> {
    Ok(match op {
        Opcode::Add => f64_add,
        Opcode::Sub => f64_sub,
        Opcode::Mul => f64_mul,
        Opcode::Div => |x, y| x / y,
        Opcode::Mod => f64_modulo,
        Opcode::Min2 => f64_min2,
        Opcode::Max2 => f64_max2,
        _ => return Err(Error::Type(format!("{op:?} has no float kernel"))),
    })
}

fn cmp_int_fn(op: Opcode) -> fn(i64, i64) -> bool {
    match op {
        Opcode::Eq => |x, y| x == y,
        Opcode::Ne => |x, y| x != y,
        Opcode::Lt => |x, y| x < y,
        Opcode::Le => |x, y| x <= y,
        Opcode::Gt => |x, y| x > y,
        _ => |x, y| x >= y,
    }
}

fn cmp_f64_fn(op: Opcode) -> fn(f64, f64) -> bool {
    match op {
        Opcode::Eq => |x, y| x == y,
        Opcode::Ne => |x, y| x != y,
        Opcode::Lt => |x, y| x < y,
        Opcode::Le => |x, y| x <= y,
        Opcode::Gt => |x, y| x > y,
        _ => |x, y| x >= y,
    }
}

// ----- operand views -----

/// Resolved read-only view of one dense vector (or slice window).
#[derive(Clone, Copy)]
pub(crate) struct VecView {
    base: *const u8,
    off: i64,
    pub(crate) len: i64,
    pub(crate) tag: TypeTag,
    width: usize,
    /// Block whose null bitmap describes the elements.
    null_owner: *mut Header,
    has_nulls: bool,
}

unsafe impl Send for VecView {}
unsafe impl Sync for VecView {}

impl VecView {
    pub(crate) fn of(v: &Value) -> Result<VecView> {
        let tag = v.vec_tag_or_base()?;
        unsafe {
            let (base, off, owner) = block::resolve(v.raw());
            Ok(VecView {
                base,
                off,
                len: v.header().len(),
                tag,
                width: (*owner).elem_width(),
                null_owner: owner,
                has_nulls: (*owner).attrs().contains(Attrs::HAS_NULLS),
            })
        }
    }

    /// A window of this view (used to align dense inputs with parted
    /// segmentation).
    fn window(&self, start: i64, len: i64) -> VecView {
        VecView {
            off: self.off + start,
            len,
            ..*self
        }
    }

    #[inline]
    pub(crate) fn read_i64(&self, i: i64) -> i64 {
        unsafe { read_int(self.base as *mut u8, self.width, self.tag, self.off + i) }
    }

    #[inline]
    pub(crate) fn read_f64(&self, i: i64) -> f64 {
        if self.tag == TypeTag::F64 {
            unsafe { *(self.base as *const f64).add((self.off + i) as usize) }
        } else {
            self.read_i64(i) as f64
        }
    }

    #[inline]
    pub(crate) fn is_null(&self, i: i64) -> bool {
        self.has_nulls && unsafe { block::dense_is_null(self.null_owner, self.off + i) }
    }
}

/// A kernel operand: a broadcast atom or one view per segment.
pub(crate) enum Operand {
    Atom { tag: TypeTag, bits: u64 },
    Segs { views: Vec<VecView>, parted: bool },
}

impl Operand {
    pub(crate) fn of(v: &Value) -> Result<Operand> {
        if v.is_atom() {
            return Ok(Operand::Atom {
                tag: v.atom_tag()?,
                bits: v.header().atom_bits(),
            });
        }
        if v.is_parted() {
            let mut views = Vec::with_capacity(v.nsegments() as usize);
            for i in 0..v.nsegments() {
                let seg = v.segment(i)?;
                views.push(VecView::of(&seg)?);
            }
            return Ok(Operand::Segs {
                views,
                parted: true,
            });
        }
        Ok(Operand::Segs {
            views: vec![VecView::of(v)?],
            parted: false,
        })
    }

}

/// Per-segment binding of an operand: a constant or a window of a view.
#[derive(Clone, Copy)]
enum Src {
    ConstI(i64),
    ConstF(f64),
    View(VecView),
}

impl Src {
    #[inline]
    fn i64_at(&self, i: i64) -> i64 {
        match self {
            Src::ConstI(v) => *v,
            Src::ConstF(v) => *v as i64,
            Src::View(v) => v.read_i64(i),
        }
    }

    #[inline]
    fn f64_at(&self, i: i64) -> f64 {
        match self {
            Src::ConstI(v) => *v as f64,
            Src::ConstF(v) => *v as f64,
            Src::View(v) => v.read_f64(i),
        }
    }

    #[inline]
    fn null_at(&self, i: i64) -> bool {
        match self {
            Src::View(v) => v.is_null(i),
            _ => false,
        }
    }

    fn float_class(&self) -> bool {
        match self {
            Src::ConstF(_) => true,
            Src::ConstI(_) => false,
            Src::View(v) => v.tag == TypeTag::F64,
        }
    }
}

/// The aligned segmentation shared by every operand of one kernel call.
struct Alignment {
    seg_lens: Vec<i64>,
    parted: bool,
}

fn align(ops: &[&Operand]) -> Result<Alignment> {
    let mut seg_lens: Option<Vec<i64>> = None;
    let mut parted = false;
    for op in ops {
        if let Operand::Segs { views, parted: p } = op {
            let lens: Vec<i64> = views.iter().map(|v| v.len).collect();
            match &seg_lens {
                None => {
                    seg_lens = Some(lens);
                    parted = *p;
                }
                Some(have) => {
                    let have_total: i64 = have.iter().sum();
                    let total: i64 = lens.iter().sum();
                    if have_total != total {
                        return Err(Error::LengthMismatch {
                            left: have_total,
                            right: total,
                        });
                    }
                    if *p && !parted {
                        seg_lens = Some(lens);
                        parted = true;
                    } else if *p && *have != lens {
                        return Err(Error::LengthMismatch {
                            left: have.len() as i64,
                            right: lens.len() as i64,
                        });
                    }
                }
            }
        }
    }
    match seg_lens {
        Some(seg_lens) => Ok(Alignment { seg_lens, parted }),
        None => Err(Error::Rank("kernel over atoms only".into())),
    }
}

/// Bind operand `op` to output segment `seg` starting at global row
/// `start`.
fn bind(op: &Operand, seg: usize, start: i64, len: i64) -> Src {
    match op {
        Operand::Atom { tag, bits } => {
            if *tag == TypeTag::F64 {
                Src::ConstF(f64::from_bits(*bits))
            } else {
                Src::ConstI(*bits as i64)
            }
        }
        Operand::Segs { views, parted } => {
            if *parted && views.len() > seg {
                views[seg]
            } else {
                // One dense view windowed to the segment's global range.
                views[0].window(start, len)
            }
            .into()
        }
    }
}

impl From<VecView> for Src {
    fn from(v: VecView) -> Src {
        Src::View(v)
    }
}

// ----- output buffers -----

/// Mutable view of one dense output vector under construction.
struct OutBuf {
    value: Value,
    data: *mut u8,
    bitmap: *mut u8,
    width: usize,
    len: i64,
    any_null: AtomicBool,
}

unsafe impl Send for OutBuf {}
unsafe impl Sync for OutBuf {}

impl OutBuf {
    /// Allocate a dense output of `tag` x `len`. When `nullable`, a bitmap
    /// is provisioned up front (external past 128 rows) so parallel tasks
    /// can set bits without coordination.
    fn new(tag: TypeTag, len: i64, nullable: bool) -> Result<OutBuf> {
        let value = Value::vec(tag, len)?;
        unsafe {
            std::ptr::write_bytes(data(value.raw()), 0, len as usize * tag.elem_size());
            (*value.raw()).set_len(len);
        }
        let bitmap = if nullable && len > INLINE_NULL_ROWS {
            let nbytes = (len as usize).div_ceil(8);
            let map = Value::vec(TypeTag::U8, nbytes as i64)?;
            unsafe {
                std::ptr::write_bytes(data(map.raw()), 0, nbytes);
                (*map.raw()).set_len(nbytes as i64);
                let bits = data(map.raw());
                (*value.raw()).set_ext_nullmap(map.into_raw());
                (*value.raw()).attrs |= Attrs::NULLMAP_EXT.bits();
                bits
            }
        } else {
            std::ptr::null_mut()
        };
        Ok(OutBuf {
            data: unsafe { data(value.raw()) },
            width: tag.elem_size(),
            bitmap,
            len,
            value,
            any_null: AtomicBool::new(false),
        })
    }

    #[inline]
    unsafe fn put_i64(&self, i: i64, v: i64) {
        unsafe {
            match self.width {
                1 => *self.data.add(i as usize) = v as u8,
                2 => *(self.data as *mut i16).add(i as usize) = v as i16,
                4 => *(self.data as *mut i32).add(i as usize) = v as i32,
                _ => *(self.data as *mut i64).add(i as usize) = v,
            }
        }
    }

    #[inline]
    unsafe fn put_f64(&self, i: i64, v: f64) {
        unsafe { *(self.data as *mut f64).add(i as usize) = v };
    }

    #[inline]
    unsafe fn put_null(&self, i: i64) {
        self.any_null.store(true, Ordering::Relaxed);
        unsafe {
            if self.bitmap.is_null() {
                // Small outputs only; the serial path owns the header.
                (*self.value.raw()).set_inline_null(i, true);
            } else {
                *self.bitmap.add((i >> 3) as usize) |= 1 << (i & 7);
            }
        }
    }

    fn finish(self) -> Value {
        unsafe {
            if self.any_null.load(Ordering::Acquire) {
                (*self.value.raw()).attrs |= Attrs::HAS_NULLS.bits();
            } else if !self.bitmap.is_null() {
                let map = (*self.value.raw()).ext_nullmap();
                (*self.value.raw()).head = [0; 16];
                (*self.value.raw()).attrs &= !Attrs::NULLMAP_EXT.bits();
                block::release_raw(map);
            }
        }
        self.value
    }
}

/// Which inner loop a kernel call runs.
#[derive(Clone, Copy)]
enum Loop {
    Int(fn(i64, i64) -> i64),
    Float(fn(f64, f64) -> f64),
    CmpInt(fn(i64, i64) -> bool),
    CmpFloat(fn(f64, f64) -> bool),
}

struct BinCtx {
    a: Src,
    b: Src,
    out: *const OutBuf,
    body: Loop,
}

unsafe impl Sync for BinCtx {}

fn run_bin_range(ctx: &BinCtx, start: i64, end: i64) {
    let out = unsafe { &*ctx.out };
    for i in start..end {
        if ctx.a.null_at(i) || ctx.b.null_at(i) {
            unsafe { out.put_null(i) };
            continue;
        }
        unsafe {
            match ctx.body {
                Loop::Int(f) => out.put_i64(i, f(ctx.a.i64_at(i), ctx.b.i64_at(i))),
                Loop::Float(f) => out.put_f64(i, f(ctx.a.f64_at(i), ctx.b.f64_at(i))),
                Loop::CmpInt(f) => out.put_i64(i, f(ctx.a.i64_at(i), ctx.b.i64_at(i)) as i64),
                Loop::CmpFloat(f) => out.put_i64(i, f(ctx.a.f64_at(i), ctx.b.f64_at(i)) as i64),
            }
        }
    }
}

/// Run one bound segment, going parallel above the threshold.
fn run_segment(a: Src, b: Src, out: &OutBuf, body: Loop) -> Result<()> {
    let ctx = BinCtx {
        a,
        b,
        out: out as *const OutBuf,
        body,
    };
    if out.len >= PARALLEL_THRESHOLD {
        task::dispatch_range(&ctx, out.len, run_bin_range)?;
    } else {
        run_bin_range(&ctx, 0, out.len);
    }
    Ok(())
}

// ----- public kernel entry points -----

/// Element-wise binary operator. `out_type` is the signed tag the builder
/// stamped (negative = all-atom inputs).
pub(crate) fn eval_binary(op: Opcode, a: &Value, b: &Value, out_type: i8) -> Result<Value> {
    if out_type < 0 {
        return fold_binary(op, a, b, out_type);
    }
    let out_tag = TypeTag::try_from(out_type)
        .map_err(|_| Error::Type(format!("bad output tag {out_type}")))?;
    let oa = Operand::of(a)?;
    let ob = Operand::of(b)?;
    let alignment = align(&[&oa, &ob])?;

    let float_cmp = operand_is_float(&oa) || operand_is_float(&ob);
    let body = if op.is_comparison() {
        if float_cmp {
            Loop::CmpFloat(cmp_f64_fn(op))
        } else {
            Loop::CmpInt(cmp_int_fn(op))
        }
    } else if out_tag == TypeTag::F64 {
        Loop::Float(float_fn(op)?)
    } else {
        Loop::Int(int_fn(op)?)
    };

    let nullable = operand_nullable(&oa) || operand_nullable(&ob);
    let mut outs = Vec::with_capacity(alignment.seg_lens.len());
    let mut start = 0i64;
    for (seg, &len) in alignment.seg_lens.iter().enumerate() {
        let out = OutBuf::new(out_tag, len, nullable)?;
        run_segment(
            bind(&oa, seg, start, len),
            bind(&ob, seg, start, len),
            &out,
            body,
        )?;
        outs.push(out.finish());
        start += len;
    }
    assemble(outs, alignment.parted, out_tag)
}

fn operand_is_float(op: &Operand) -> bool {
    match op {
        Operand::Atom { tag, .. } => *tag == TypeTag::F64,
        Operand::Segs { views, .. } => views.first().is_some_and(|v| v.tag == TypeTag::F64),
    }
}

fn operand_nullable(op: &Operand) -> bool {
    match op {
        Operand::Atom { .. } => false,
        Operand::Segs { views, .. } => views.iter().any(|v| v.has_nulls),
    }
}

fn assemble(mut outs: Vec<Value>, parted: bool, tag: TypeTag) -> Result<Value> {
    if !parted {
        return Ok(outs.pop().expect("at least one segment"));
    }
    Value::parted(tag, outs)
}

/// Element-wise unary operator.
pub(crate) fn eval_unary(op: Opcode, a: &Value, out_type: i8) -> Result<Value> {
    if out_type < 0 {
        return fold_unary(op, a, out_type);
    }
    let out_tag = TypeTag::try_from(out_type)
        .map_err(|_| Error::Type(format!("bad output tag {out_type}")))?;
    let oa = Operand::of(a)?;
    let alignment = align(&[&oa])?;
    let nullable = operand_nullable(&oa);

    let mut outs = Vec::with_capacity(alignment.seg_lens.len());
    let mut start = 0i64;
    for (seg, &len) in alignment.seg_lens.iter().enumerate() {
        let src = bind(&oa, seg, start, len);
        let out = OutBuf::new(out_tag, len, nullable)?;
        let ctx = UnCtx {
            src,
            out: &out as *const OutBuf,
            op,
            out_float: out_tag == TypeTag::F64,
        };
        if len >= PARALLEL_THRESHOLD {
            task::dispatch_range(&ctx, len, run_un_range)?;
        } else {
            run_un_range(&ctx, 0, len);
        }
        outs.push(out.finish());
        start += len;
    }
    assemble(outs, alignment.parted, out_tag)
}

struct UnCtx {
    src: Src,
    out: *const OutBuf,
    op: Opcode,
    out_float: bool,
}

unsafe impl Sync for UnCtx {}

fn run_un_range(ctx: &UnCtx, start: i64, end: i64) {
    let out = unsafe { &*ctx.out };
    for i in start..end {
        if ctx.src.null_at(i) {
            unsafe { out.put_null(i) };
            continue;
        }
        unsafe {
            match ctx.op {
                Opcode::Not => out.put_i64(i, (ctx.src.i64_at(i) == 0) as i64),
                Opcode::Neg if ctx.out_float => out.put_f64(i, -ctx.src.f64_at(i)),
                Opcode::Neg => out.put_i64(i, ctx.src.i64_at(i).wrapping_neg()),
                Opcode::Abs if ctx.out_float => out.put_f64(i, ctx.src.f64_at(i).abs()),
                Opcode::Abs => out.put_i64(i, ctx.src.i64_at(i).wrapping_abs()),
                Opcode::Sqrt => out.put_f64(i, ctx.src.f64_at(i).sqrt()),
                Opcode::Log => out.put_f64(i, ctx.src.f64_at(i).ln()),
                Opcode::Exp => out.put_f64(i, ctx.src.f64_at(i).exp()),
                Opcode::Ceil => out.put_f64(i, ctx.src.f64_at(i).ceil()),
                Opcode::Floor => out.put_f64(i, ctx.src.f64_at(i).floor()),
                _ => out.put_i64(i, ctx.src.i64_at(i)),
            }
        }
    }
}

/// IS NULL: BOOL vector marking null rows (never itself nullable).
pub(crate) fn eval_is_null(a: &Value) -> Result<Value> {
    if a.is_atom() {
        return Value::bool_atom(false);
    }
    let oa = Operand::of(a)?;
    let alignment = align(&[&oa])?;
    let mut outs = Vec::with_capacity(alignment.seg_lens.len());
    let mut start = 0i64;
    for (seg, &len) in alignment.seg_lens.iter().enumerate() {
        let src = bind(&oa, seg, start, len);
        let out = OutBuf::new(TypeTag::Bool, len, false)?;
        for i in 0..len {
            unsafe { out.put_i64(i, src.null_at(i) as i64) };
        }
        outs.push(out.finish());
        start += len;
    }
    assemble(outs, alignment.parted, TypeTag::Bool)
}

/// CAST between numeric classes (float truncates toward zero).
pub(crate) fn eval_cast(a: &Value, target: TypeTag) -> Result<Value> {
    if target.numeric_rank().is_none() {
        return Err(Error::Type(format!("cannot cast to {target:?}")));
    }
    if a.is_atom() {
        let t = a.atom_tag()?;
        if t.numeric_rank().is_none() {
            return Err(Error::Type(format!("cannot cast {t:?} atom")));
        }
        return if target == TypeTag::F64 {
            Value::f64_atom(a.as_f64()?)
        } else {
            Value::int_atom_of(target, a.as_f64()? as i64)
        };
    }
    let oa = Operand::of(a)?;
    let alignment = align(&[&oa])?;
    let nullable = operand_nullable(&oa);
    let mut outs = Vec::with_capacity(alignment.seg_lens.len());
    let mut start = 0i64;
    for (seg, &len) in alignment.seg_lens.iter().enumerate() {
        let src = bind(&oa, seg, start, len);
        let out = OutBuf::new(target, len, nullable)?;
        for i in 0..len {
            if src.null_at(i) {
                unsafe { out.put_null(i) };
            } else if target == TypeTag::F64 {
                unsafe { out.put_f64(i, src.f64_at(i)) };
            } else if src.float_class() {
                unsafe { out.put_i64(i, src.f64_at(i) as i64) };
            } else {
                unsafe { out.put_i64(i, src.i64_at(i)) };
            }
        }
        outs.push(out.finish());
        start += len;
    }
    assemble(outs, alignment.parted, target)
}

/// Element-wise IF: a null condition yields null; otherwise the selected
/// branch's value (and nullness) flows through.
pub(crate) fn eval_if(c: &Value, t: &Value, e: &Value, out_type: i8) -> Result<Value> {
    if out_type < 0 {
        let pick = if c.as_i64()? != 0 { t } else { e };
        return Ok(pick.clone());
    }
    let out_tag = TypeTag::try_from(out_type)
        .map_err(|_| Error::Type(format!("bad output tag {out_type}")))?;
    let oc = Operand::of(c)?;
    let ot = Operand::of(t)?;
    let oe = Operand::of(e)?;
    let alignment = align(&[&oc, &ot, &oe])?;
    let nullable = operand_nullable(&oc) || operand_nullable(&ot) || operand_nullable(&oe);
    let out_float = out_tag == TypeTag::F64;

    let mut outs = Vec::with_capacity(alignment.seg_lens.len());
    let mut start = 0i64;
    for (seg, &len) in alignment.seg_lens.iter().enumerate() {
        let (sc, st, se) = (
            bind(&oc, seg, start, len),
            bind(&ot, seg, start, len),
            bind(&oe, seg, start, len),
        );
        let out = OutBuf::new(out_tag, len, nullable)?;
        for i in 0..len {
            if sc.null_at(i) {
                unsafe { out.put_null(i) };
                continue;
            }
            let pick = if sc.i64_at(i) != 0 { &st } else { &se };
            if pick.null_at(i) {
                unsafe { out.put_null(i) };
            } else if out_float {
                unsafe { out.put_f64(i, pick.f64_at(i)) };
            } else {
                unsafe { out.put_i64(i, pick.i64_at(i)) };
            }
        }
        outs.push(out.finish());
        start += len;
    }
    assemble(outs, alignment.parted, out_tag)
}

/// Single-pass compare-and-select: global row indices where `a op b` is
/// true and neither side is null. This backs the fused filter path, which
/// never materializes the intermediate BOOL vector.
pub(crate) fn compare_selection(op: Opcode, a: &Value, b: &Value) -> Result<Vec<i64>> {
    let oa = Operand::of(a)?;
    let ob = Operand::of(b)?;
    let alignment = align(&[&oa, &ob])?;
    let float = operand_is_float(&oa) || operand_is_float(&ob);
    let ci = cmp_int_fn(op);
    let cf = cmp_f64_fn(op);
    let mut out = Vec::new();
    let mut start = 0i64;
    for (seg, &len) in alignment.seg_lens.iter().enumerate() {
        let sa = bind(&oa, seg, start, len);
        let sb = bind(&ob, seg, start, len);
        for i in 0..len {
            if sa.null_at(i) || sb.null_at(i) {
                continue;
            }
            let hit = if float {
                cf(sa.f64_at(i), sb.f64_at(i))
            } else {
                ci(sa.i64_at(i), sb.i64_at(i))
            };
            if hit {
                out.push(start + i);
            }
        }
        start += len;
    }
    Ok(out)
}

// ----- scalar (atom) folds, shared with the optimizer -----

pub(crate) fn fold_unary(op: Opcode, a: &Value, out_type: i8) -> Result<Value> {
    let int_out = TypeTag::try_from(out_type.abs())
        .ok()
        .is_some_and(TypeTag::is_integral);
    Ok(match op {
        Opcode::Not => Value::bool_atom(a.as_i64()? == 0)?,
        Opcode::Neg if int_out => Value::i64_atom(a.as_i64()?.wrapping_neg())?,
        Opcode::Neg => Value::f64_atom(-a.as_f64()?)?,
        Opcode::Abs if int_out => Value::i64_atom(a.as_i64()?.wrapping_abs())?,
        Opcode::Abs => Value::f64_atom(a.as_f64()?.abs())?,
        Opcode::Sqrt => Value::f64_atom(a.as_f64()?.sqrt())?,
        Opcode::Log => Value::f64_atom(a.as_f64()?.ln())?,
        Opcode::Exp => Value::f64_atom(a.as_f64()?.exp())?,
        Opcode::Ceil => Value::f64_atom(a.as_f64()?.ceil())?,
        Opcode::Floor => Value::f64_atom(a.as_f64()?.floor())?,
        _ => return Err(Error::Type(format!("{op:?} is not a unary scalar op"))),
    })
}

pub(crate) fn fold_binary(op: Opcode, a: &Value, b: &Value, out_type: i8) -> Result<Value> {
    let float = out_type.abs() == TypeTag::F64 as i8
        || a.atom_tag()? == TypeTag::F64
        || b.atom_tag()? == TypeTag::F64;
    if op.is_comparison() {
        let res = if float {
            cmp_f64_fn(op)(a.as_f64()?, b.as_f64()?)
        } else {
            cmp_int_fn(op)(a.as_i64()?, b.as_i64()?)
        };
        return Value::bool_atom(res);
    }
    match op {
        Opcode::And => return Value::bool_atom(a.as_i64()? != 0 && b.as_i64()? != 0),
        Opcode::Or => return Value::bool_atom(a.as_i64()? != 0 || b.as_i64()? != 0),
        Opcode::Div => return Value::f64_atom(a.as_f64()? / b.as_f64()?),
        _ => {}
    }
    if float {
        Value::f64_atom(float_fn(op)?(a.as_f64()?, b.as_f64()?))
    } else {
        Value::i64_atom(int_fn(op)?(a.as_i64()?, b.as_i64()?))
    }
}

/// Shared helper for kernels that surface the first error hit inside a
/// parallel region (the error kind is packed into one byte).
pub(crate) struct ErrSlot(AtomicU8);

impl ErrSlot {
    pub(crate) fn new() -> ErrSlot {
        ErrSlot(AtomicU8::new(0))
    }

    pub(crate) fn set(&self, code: u8) {
        let _ = self.0.compare_exchange(0, code, Ordering::AcqRel, Ordering::Relaxed);
    }

    pub(crate) fn take(&self) -> Option<u8> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            c => Some(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_add_over_vectors() -> Result<()> {
        let a = Value::i64_vec(&[1, 2, 3])?;
        let b = Value::i64_vec(&[10, 20, 30])?;
        let out = eval_binary(Opcode::Add, &a, &b, TypeTag::I64 as i8)?;
        assert_eq!(out.get_i64(2)?, 33);
        Ok(())
    }

    #[test]
    fn atom_broadcasts_across_vector() -> Result<()> {
        let a = Value::f64_vec(&[1.5, 2.5])?;
        let b = Value::f64_atom(2.0)?;
        let out = eval_binary(Opcode::Mul, &a, &b, TypeTag::F64 as i8)?;
        assert_eq!(out.get_f64(0)?, 3.0);
        assert_eq!(out.get_f64(1)?, 5.0);
        Ok(())
    }

    #[test]
    fn comparison_with_null_yields_null() -> Result<()> {
        let mut a = Value::i64_vec(&[1, 2, 3])?;
        a.set_null(1, true)?;
        let b = Value::i64_atom(2)?;
        let out = eval_binary(Opcode::Ge, &a, &b, TypeTag::Bool as i8)?;
        assert!(!out.get_bool(0)?);
        assert!(out.is_null_at(1)?);
        assert!(out.get_bool(2)?);
        Ok(())
    }

    #[test]
    fn length_mismatch_is_an_error() -> Result<()> {
        let a = Value::i64_vec(&[1, 2, 3])?;
        let b = Value::i64_vec(&[1])?;
        assert!(matches!(
            eval_binary(Opcode::Add, &a, &b, TypeTag::I64 as i8),
            Err(Error::LengthMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn parted_inputs_keep_their_partitioning() -> Result<()> {
        let p = Value::parted(
            TypeTag::I64,
            vec![Value::i64_vec(&[1, 2])?, Value::i64_vec(&[3])?],
        )?;
        let one = Value::i64_atom(10)?;
        let out = eval_binary(Opcode::Add, &p, &one, TypeTag::I64 as i8)?;
        assert!(out.is_parted());
        assert_eq!(out.nsegments(), 2);
        assert_eq!(out.segment(0)?.get_i64(1)?, 12);
        assert_eq!(out.segment(1)?.get_i64(0)?, 13);
        Ok(())
    }

    #[test]
    fn parallel_path_matches_serial() -> Result<()> {
        let _pool = crate::task::TEST_POOL_LOCK.lock().unwrap();
        let n = PARALLEL_THRESHOLD + 1;
        let vals: Vec<i64> = (0..n).collect();
        let big = Value::i64_vec(&vals)?;
        let one = Value::i64_atom(1)?;
        let out = eval_binary(Opcode::Add, &big, &one, TypeTag::I64 as i8)?;
        assert_eq!(out.len(), n);
        assert_eq!(out.get_i64(0)?, 1);
        assert_eq!(out.get_i64(n - 1)?, n);
        Ok(())
    }

    #[test]
    fn cast_truncates_floats() -> Result<()> {
        let a = Value::f64_vec(&[1.9, -2.7])?;
        let out = eval_cast(&a, TypeTag::I64)?;
        assert_eq!(out.get_i64(0)?, 1);
        assert_eq!(out.get_i64(1)?, -2);
        Ok(())
    }

    #[test]
    fn if_selects_elementwise() -> Result<()> {
        let c = Value::bool_vec(&[true, false, true])?;
        let t = Value::i64_vec(&[1, 1, 1])?;
        let e = Value::i64_vec(&[9, 9, 9])?;
        let out = eval_if(&c, &t, &e, TypeTag::I64 as i8)?;
        assert_eq!(out.get_i64(0)?, 1);
        assert_eq!(out.get_i64(1)?, 9);
        assert_eq!(out.get_i64(2)?, 1);
        Ok(())
    }
}
