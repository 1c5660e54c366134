//! # Basalt
//!
//! An **in-process analytical columnar engine** for Rust: typed columns on
//! reference-counted, copy-on-write blocks, a process-wide symbol interner,
//! and a morsel-driven query executor that parallelizes across a persistent
//! worker pool.
//!
//! ## Key features
//!
//! - **Buddy-allocated value model** - every value (scalar atom, vector,
//!   table, parted column) is a 32-byte-aligned refcounted block
//! - **Graph-builder API** - build an operator DAG programmatically:
//!   scans, arithmetic, comparisons, string ops, filter, group, sort,
//!   join, window, as-of join
//! - **Optimizer passes** - type inference, constant folding, predicate
//!   fusion, dead-code elimination
//! - **Parallel execution** - element-wise kernels, reductions and hash
//!   aggregates run as 1024-row morsels over the worker pool
//! - **Zero-copy storage** - a mapped column file *is* a block; partitioned
//!   tables open as virtual parted columns
//! - **Parallel CSV ingest** - mmap, offset scan, type inference, and
//!   row-range parsing with per-worker symbol tables
//!
//! ## Quick start
//!
//! ```no_run
//! use basalt::{Graph, Value};
//! # use basalt::Result;
//!
//! # fn main() -> Result<()> {
//! // Build a table of two columns.
//! let table = Value::table_from(
//!     &["id", "v"],
//!     vec![
//!         Value::i64_vec(&[1, 1, 2, 2])?,
//!         Value::f64_vec(&[10.0, 20.0, 30.0, 40.0])?,
//!     ],
//! )?;
//!
//! // sum(v * 2) over the table.
//! let mut g = Graph::new(&table)?;
//! let v = g.scan("v")?;
//! let two = g.const_f64(2.0)?;
//! let doubled = g.mul(v, two)?;
//! let total = g.sum(doubled)?;
//!
//! let root = g.optimize(total)?;
//! let result = g.execute(root)?;
//! assert_eq!(result.as_f64()?, 200.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core concepts
//!
//! ### `Value`
//!
//! A [`Value`] is the owning handle to a block: `Clone` retains, `Drop`
//! releases, and in-place mutation goes through copy-on-write, so sharing
//! is always safe. Atoms, vectors, lists, tables, parted columns and the
//! partition-key map all travel behind this one handle.
//!
//! ### `Graph`
//!
//! A [`Graph`] is a flat array of operator nodes addressed by [`OpId`].
//! Builders stamp output types at construction (promotion for arithmetic,
//! F64 for division, BOOL for comparisons); `optimize` runs the pass
//! pipeline and `execute` evaluates a root node into a concrete `Value`.
//!
//! ### Worker pool
//!
//! One process-wide pool ([`pool_init`] / [`pool_destroy`], lazily created
//! otherwise) runs both query morsels and bulk ingest. [`cancel`] flags a
//! cooperative stop; the flag clears when the next execute begins.
//!
//! ## Storage
//!
//! - [`io::col_save`] / [`io::col_load`] - single-column files, mapped back
//!   as zero-copy blocks
//! - [`io::table_save`] / [`io::table_load`] - splayed table directories
//! - [`io::part_open`] - partitioned databases with a virtual
//!   partition-key column
//! - [`io::read_csv`] / [`io::write_csv`] - CSV ingest and export
//! - [`sym::save`] / [`sym::load`] - the symbol directory
//!
//! ## Module overview
//!
//! - [`value`] - owning handles, atoms, typed accessors
//! - [`vec`] (methods on `Value`) - vector append/get/set, slices, nulls
//! - [`table`] / [`parted`] - containers
//! - [`sym`] - the process-wide interner
//! - [`mem`] - buddy pools, per-thread heaps, allocation stats
//! - [`task`] - the worker pool
//! - [`graph`] / [`optimizer`] / [`exec`] - DAG, passes, evaluation
//! - [`io`] - CSV, column files, partitioned tables

pub mod block;
pub mod error;
pub mod exec;
pub mod graph;
pub mod io;
pub mod mem;
pub mod optimizer;
pub mod parted;
pub mod sym;
pub mod table;
pub mod task;
pub mod types;
pub mod value;
pub mod vec;

// General re-exports
pub use error::{Error, Result};
pub use graph::{Frame, Graph, OpId, Opcode};
pub use io::{
    col_load, col_save, part_open, read_csv, read_csv_opts, table_load, table_save, write_csv,
    CsvOptions,
};
pub use mem::{mem_stats, MemStats};
pub use task::{cancel, pool_destroy, pool_init, PoolConfig};
pub use types::{
    AggOp, Attrs, DateField, FrameBound, FrameType, JoinType, Mmod, TypeTag, WindowFunc,
};
pub use value::Value;
