//! Forensic reader for SQLite 3 database files.
//!
//! Decodes the file format directly from the bytes, without a SQL engine:
//! live rows come from walking each object's b-tree, deleted rows are carved
//! out of freeblocks, gaps and freelist pages. The source file is opened
//! read-only and never modified.

pub mod btree;
pub mod carve;
pub mod db;
pub mod decoder;
pub mod error;
pub mod freespace;
pub mod header;
pub mod pagemap;
pub mod pager;
pub mod record;
pub mod schema;
pub mod stats;

mod ident;
#[cfg(test)]
mod testutil;

pub use btree::{BTreeKind, RowKey, Visit, WalkSummary, walk};
pub use carve::{CarveConfig, CarveMethod, CarvedRecord, Carver};
pub use db::{ActiveRecord, AnalysisOptions, Database, ObjectWalk};
pub use error::{Corruption, Error, HeaderError, Result};
pub use freespace::{PageLayout, RegionSource, UnallocatedRegion};
pub use header::{DbHeader, TextEncoding};
pub use pagemap::{PageMap, PageType};
pub use pager::{PageId, Pager};
pub use record::{Record, SerialType, Text, Value};
pub use schema::{ObjectKind, SchemaCatalog, SchemaObject};
pub use stats::{GlobalStats, ObjectStats, Statistics};
