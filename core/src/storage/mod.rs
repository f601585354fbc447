//! Durable storage shared by the hash, ordered and table stores.

pub mod codec;
pub mod engine;
pub mod file;
pub mod journal;

pub use codec::Codec;
pub use engine::{Engine, RecordMap, RestoreHook};
pub use file::{FileHeader, LogRecord, RecordFile, StoreKind};
pub use journal::{Journal, TxGate, UndoEntry};
