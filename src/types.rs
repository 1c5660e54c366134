//! Type tags, header attribute flags, and the numeric promotion lattice.
//!
//! Every runtime value carries a signed 8-bit tag:
//! - negative: scalar atom of kind `|tag|`
//! - `0`: heterogeneous list
//! - `[1, 16)`: typed vector
//! - `[32, 48)`: parted vector wrapping segments of base type `tag - 32`
//! - `48`: partition-key map column
//!
//! The tag values are part of the on-disk column format and must not be
//! renumbered.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::error::{Error, Result};

/// Rows per morsel, the unit of vectorized execution and parallel dispatch.
pub const MORSEL_ELEMS: i64 = 1024;

/// Morsels per worker task; one task covers `MORSEL_ELEMS * MORSELS_PER_TASK`
/// rows so the dispatch overhead amortizes.
pub const MORSELS_PER_TASK: i64 = 8;

/// Element counts at or above this go through the worker pool.
pub const PARALLEL_THRESHOLD: i64 = 64 * MORSEL_ELEMS;

/// Base type tags for vectors (and, negated, for atoms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(i8)]
pub enum TypeTag {
    List = 0,
    Bool = 1,
    U8 = 2,
    Char = 3,
    I16 = 4,
    I32 = 5,
    I64 = 6,
    F64 = 7,
    Str = 8,
    Date = 9,
    Time = 10,
    Timestamp = 11,
    Guid = 12,
    Table = 13,
    Sym = 14,
    Enum = 15,
}

/// First tag of the parted range; a parted vector of base `t` has tag
/// `PARTED_BASE + t`.
pub const PARTED_BASE: i8 = 32;

/// Tag of the virtual partition-key map column.
pub const MAPCOMMON: i8 = 48;

/// True for tags in the parted vector range `[32, 48)`.
#[inline]
pub fn is_parted_tag(t: i8) -> bool {
    (PARTED_BASE..MAPCOMMON).contains(&t)
}

/// Base type of a parted tag.
#[inline]
pub fn parted_base(t: i8) -> i8 {
    t - PARTED_BASE
}

impl TypeTag {
    /// Fixed element width in bytes. SYM is the vector's *widest* encoding;
    /// narrow sym vectors override via [`Attrs::sym_width_bytes`].
    pub fn elem_size(self) -> usize {
        match self {
            TypeTag::List => 8,
            TypeTag::Bool | TypeTag::U8 | TypeTag::Char => 1,
            TypeTag::I16 => 2,
            TypeTag::I32 | TypeTag::Date | TypeTag::Enum => 4,
            TypeTag::I64
            | TypeTag::F64
            | TypeTag::Str
            | TypeTag::Time
            | TypeTag::Timestamp
            | TypeTag::Sym
            | TypeTag::Table => 8,
            TypeTag::Guid => 16,
        }
    }

    /// True if elements are pointers to child blocks that the container owns.
    pub fn owns_children(self) -> bool {
        matches!(self, TypeTag::List | TypeTag::Table | TypeTag::Str)
    }

    /// Promotion rank within the numeric lattice, or `None` for
    /// non-arithmetic types. DATE/TIME sit in the I32 class, TIMESTAMP and
    /// SYM in the I64 class.
    pub fn numeric_rank(self) -> Option<u8> {
        match self {
            TypeTag::Bool => Some(0),
            TypeTag::U8 => Some(1),
            TypeTag::I16 => Some(2),
            TypeTag::I32 | TypeTag::Date | TypeTag::Enum => Some(3),
            TypeTag::I64 | TypeTag::Time | TypeTag::Timestamp | TypeTag::Sym => Some(4),
            TypeTag::F64 => Some(5),
            _ => None,
        }
    }

    /// True for the integral classes (everything numeric below F64).
    pub fn is_integral(self) -> bool {
        matches!(self.numeric_rank(), Some(r) if r < 5)
    }
}

/// Numeric promotion for binary operators: `BOOL < U8 < I16 < I32 < I64 <
/// F64`. Division is forced to F64 and comparisons to BOOL by the graph
/// builders, not here.
pub fn promote(a: TypeTag, b: TypeTag) -> Result<TypeTag> {
    let (ra, rb) = match (a.numeric_rank(), b.numeric_rank()) {
        (Some(ra), Some(rb)) => (ra, rb),
        _ => {
            return Err(Error::Type(format!(
                "cannot promote {a:?} with {b:?}"
            )));
        }
    };
    let rank = ra.max(rb);
    Ok(match rank {
        0 => TypeTag::Bool,
        1 => TypeTag::U8,
        2 => TypeTag::I16,
        3 => TypeTag::I32,
        4 => TypeTag::I64,
        _ => TypeTag::F64,
    })
}

bitflags! {
    /// Header attribute flags (byte 19 of the block header).
    ///
    /// The low two bits encode the per-vector symbol element width and are
    /// accessed through [`Attrs::sym_width_bytes`] rather than as flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attrs: u8 {
        const SYM_W16 = 0x01;
        const SYM_W32 = 0x02;
        /// Header-only view into a parent vector.
        const SLICE = 0x10;
        /// Null bitmap lives in a separate U8 vector block.
        const NULLMAP_EXT = 0x20;
        /// At least one element is null.
        const HAS_NULLS = 0x40;
    }
}

/// Mask of the two sym-width bits.
pub const SYM_W_MASK: u8 = 0x03;

impl Attrs {
    /// Element width in bytes of a SYM vector: 1, 2, 4 or 8.
    pub fn sym_width_bytes(self) -> usize {
        match self.bits() & SYM_W_MASK {
            0 => 1,
            1 => 2,
            2 => 4,
            _ => 8,
        }
    }

    /// Attrs bits selecting a sym width (1, 2, 4 or 8 bytes).
    pub fn for_sym_width(bytes: usize) -> Attrs {
        match bytes {
            1 => Attrs::empty(),
            2 => Attrs::SYM_W16,
            4 => Attrs::SYM_W32,
            _ => Attrs::from_bits_retain(SYM_W_MASK),
        }
    }
}

/// Memory mode of a block (2 bits of header byte 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Mmod {
    /// Owned by a thread heap; freed back to the buddy allocator.
    Heap = 0,
    /// Backed by a file mapping; unmapped on release.
    Mmap = 1,
    /// Never freed (interned strings, pool headers).
    Static = 2,
    /// Single dedicated mapping for blocks too large for a pool.
    Direct = 3,
}

/// Aggregate operations accepted by GROUP and the as-of join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Sum,
    Prod,
    Min,
    Max,
    Count,
    Avg,
    First,
    Last,
    CountDistinct,
    /// Sample standard deviation (n - 1 denominator).
    Stddev,
    /// Population standard deviation.
    StddevPop,
    /// Sample variance.
    Var,
    /// Population variance.
    VarPop,
}

/// Join flavors supported by the hash join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Semi,
    Anti,
}

/// Window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunc {
    RowNumber,
    Rank,
    DenseRank,
    Ntile(i64),
    Lag(i64),
    Lead(i64),
    FirstValue,
    LastValue,
    NthValue(i64),
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl WindowFunc {
    /// True if the function consumes an input column (vs. pure ranking).
    pub fn needs_input(self) -> bool {
        !matches!(
            self,
            WindowFunc::RowNumber | WindowFunc::Rank | WindowFunc::DenseRank | WindowFunc::Ntile(_)
        )
    }

    /// True if the function is evaluated over the window frame rather than
    /// the whole partition.
    pub fn framed(self) -> bool {
        matches!(
            self,
            WindowFunc::Sum
                | WindowFunc::Avg
                | WindowFunc::Min
                | WindowFunc::Max
                | WindowFunc::Count
                | WindowFunc::FirstValue
                | WindowFunc::LastValue
                | WindowFunc::NthValue(_)
        )
    }
}

/// Window frame unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Rows,
    Range,
}

/// Window frame bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBound {
    UnboundedPreceding,
    Preceding(i64),
    CurrentRow,
    Following(i64),
    UnboundedFollowing,
}

/// Fields accepted by EXTRACT and DATE_TRUNC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    DayOfWeek,
    DayOfYear,
    Epoch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_lattice() {
        assert_eq!(promote(TypeTag::Bool, TypeTag::U8).unwrap(), TypeTag::U8);
        assert_eq!(promote(TypeTag::I16, TypeTag::I32).unwrap(), TypeTag::I32);
        assert_eq!(promote(TypeTag::I64, TypeTag::F64).unwrap(), TypeTag::F64);
        assert_eq!(promote(TypeTag::Date, TypeTag::I64).unwrap(), TypeTag::I64);
        assert!(promote(TypeTag::Guid, TypeTag::I64).is_err());
    }

    #[test]
    fn parted_tags() {
        let t = PARTED_BASE + TypeTag::I64 as i8;
        assert!(is_parted_tag(t));
        assert_eq!(parted_base(t), TypeTag::I64 as i8);
        assert!(!is_parted_tag(MAPCOMMON));
        assert!(!is_parted_tag(TypeTag::I64 as i8));
    }

    #[test]
    fn sym_width_round_trip() {
        for w in [1usize, 2, 4, 8] {
            assert_eq!(Attrs::for_sym_width(w).sym_width_bytes(), w);
        }
    }

    #[test]
    fn elem_sizes_match_format() {
        assert_eq!(TypeTag::Bool.elem_size(), 1);
        assert_eq!(TypeTag::I16.elem_size(), 2);
        assert_eq!(TypeTag::Date.elem_size(), 4);
        assert_eq!(TypeTag::Timestamp.elem_size(), 8);
        assert_eq!(TypeTag::Guid.elem_size(), 16);
    }
}
