//! Engine error taxonomy.
//!
//! Every fallible entry point in the crate returns [`Result`]. Operator
//! kernels that hit a domain problem mid-evaluation produce one of these
//! kinds and the executor short-circuits the rest of the plan.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds the engine can produce.
#[derive(Debug, Error)]
pub enum Error {
    /// Block allocation failed.
    #[error("out of memory (requested {0} bytes)")]
    OutOfMemory(usize),

    /// Invalid type tag or unpromotable operand combination.
    #[error("type error: {0}")]
    Type(String),

    /// Index out of bounds or negative length.
    #[error("range error: {0}")]
    Range(String),

    /// Column lengths diverge where they must match.
    #[error("length mismatch: {left} vs {right}")]
    LengthMismatch { left: i64, right: i64 },

    /// Scalar/vector shape mismatch.
    #[error("rank error: {0}")]
    Rank(String),

    /// Value outside an operator's domain.
    #[error("domain error: {0}")]
    Domain(String),

    /// Declared in the API but not implemented.
    #[error("not yet implemented: {0}")]
    NotYetImplemented(&'static str),

    /// File open/read/stat/mmap failure.
    #[error("io error: {op} {path}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// On-disk layout violates the format contract.
    #[error("schema error: {0}")]
    Schema(String),

    /// A block header failed sanity checks.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Query interrupted via the cancellation flag.
    #[error("query cancelled")]
    Cancelled,
}

impl Error {
    /// Annotate an `std::io::Error` with the operation and path it hit,
    /// mirroring how call sites read: `Error::io("open", path, e)`.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Stable small integer for each kind. Used by the column-file format
    /// tests and by callers that map kinds to their own message tables.
    pub fn code(&self) -> u32 {
        match self {
            Error::OutOfMemory(_) => 1,
            Error::Type(_) => 2,
            Error::Range(_) => 3,
            Error::LengthMismatch { .. } => 4,
            Error::Rank(_) => 5,
            Error::Domain(_) => 6,
            Error::NotYetImplemented(_) => 7,
            Error::Io { .. } => 8,
            Error::Schema(_) => 9,
            Error::Corrupt(_) => 10,
            Error::Cancelled => 11,
        }
    }
}
