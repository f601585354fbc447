//! Cask - embeddable hash, ordered and table stores

pub mod btree;
pub mod config;
pub mod error;
pub mod hash;
pub mod query;
pub mod storage;
pub mod table;
pub mod text;

pub use btree::{BTreeDb, BuiltinComparator, Comparator, ContextComparator, Cursor, CursorPut};
pub use config::{BTreeOptions, HashOptions, OpenMode, TableOptions, TuneOpts, Tuning};
pub use error::{CaskError, Result};
pub use hash::HashDb;
pub use query::{CondOp, OrderType, Query, QueryOp, SetOp};
pub use storage::Codec;
pub use table::{Columns, IndexInfo, IndexKind, IndexOp, IndexSpec, TableDb, columns};
