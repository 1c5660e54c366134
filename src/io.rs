//! Storage and ingest: CSV, single-column files, partitioned tables.
//!
//! - [`csv`] — parallel mmap-based CSV ingest and a row-oriented writer
//! - [`col`] — the single-column on-disk format (a mapped file *is* a block)
//! - [`part`] — splayed table directories and the partitioned database layout

pub mod col;
pub mod csv;
pub mod part;

pub use col::{col_load, col_save};
pub use csv::{read_csv, read_csv_opts, write_csv, CsvOptions};
pub use part::{part_open, part_save, table_load, table_save};
