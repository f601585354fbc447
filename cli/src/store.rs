//! Common surface of the hash and ordered stores for the key/value commands.

use std::path::PathBuf;

use cask_core::{BTreeDb, CaskError, HashDb, Result};
use clap::ValueEnum;

/// How `put` treats an existing key.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutMode {
    /// Replace the value.
    Over,
    /// Leave an existing value alone.
    Keep,
    /// Append to the existing value.
    Cat,
    /// Add a duplicate value (ordered stores only).
    Dup,
}

pub trait KeyValue {
    fn kind(&self) -> &'static str;

    /// Returns `false` when `PutMode::Keep` found an existing key.
    fn store(&self, key: &[u8], value: &[u8], mode: PutMode) -> Result<bool>;

    /// The first value, or every duplicate when `all` is set.
    fn values(&self, key: &[u8], all: bool) -> Result<Vec<Vec<u8>>>;

    fn remove(&self, key: &[u8], all: bool) -> Result<()>;

    fn prefix_keys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>>;

    fn rnum(&self) -> Result<u64>;

    fn fsiz(&self) -> Result<u64>;

    fn path(&self) -> Option<PathBuf>;
}

impl KeyValue for HashDb {
    fn kind(&self) -> &'static str {
        "hash"
    }

    fn store(&self, key: &[u8], value: &[u8], mode: PutMode) -> Result<bool> {
        match mode {
            PutMode::Over => self.put(key, value).map(|()| true),
            PutMode::Keep => self.putkeep(key, value),
            PutMode::Cat => self.putcat(key, value).map(|()| true),
            PutMode::Dup => Err(CaskError::InvalidOperation(
                "hash stores keep one value per key".into(),
            )),
        }
    }

    fn values(&self, key: &[u8], _all: bool) -> Result<Vec<Vec<u8>>> {
        Ok(self.get(key)?.into_iter().collect())
    }

    fn remove(&self, key: &[u8], _all: bool) -> Result<()> {
        self.out(key)
    }

    fn prefix_keys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        self.fwmkeys(prefix, max)
    }

    fn rnum(&self) -> Result<u64> {
        HashDb::rnum(self)
    }

    fn fsiz(&self) -> Result<u64> {
        HashDb::fsiz(self)
    }

    fn path(&self) -> Option<PathBuf> {
        HashDb::path(self)
    }
}

impl KeyValue for BTreeDb {
    fn kind(&self) -> &'static str {
        "btree"
    }

    fn store(&self, key: &[u8], value: &[u8], mode: PutMode) -> Result<bool> {
        match mode {
            PutMode::Over => self.put(key, value).map(|()| true),
            PutMode::Keep => self.putkeep(key, value),
            PutMode::Cat => self.putcat(key, value).map(|()| true),
            PutMode::Dup => self.putdup(key, value).map(|()| true),
        }
    }

    fn values(&self, key: &[u8], all: bool) -> Result<Vec<Vec<u8>>> {
        if all {
            self.getdup(key)
        } else {
            Ok(self.get(key)?.into_iter().collect())
        }
    }

    fn remove(&self, key: &[u8], all: bool) -> Result<()> {
        if all { self.outdup(key) } else { self.out(key) }
    }

    fn prefix_keys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        self.fwmkeys(prefix, max)
    }

    fn rnum(&self) -> Result<u64> {
        BTreeDb::rnum(self)
    }

    fn fsiz(&self) -> Result<u64> {
        BTreeDb::fsiz(self)
    }

    fn path(&self) -> Option<PathBuf> {
        BTreeDb::path(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_core::OpenMode;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_put_modes() {
        let dir = tempdir().unwrap();
        let tree = BTreeDb::new();
        tree.open(dir.path().join("modes.tcb"), OpenMode::WRITER | OpenMode::CREATE)
            .unwrap();
        let db: &dyn KeyValue = &tree;

        assert!(db.store(b"k", b"a", PutMode::Over).unwrap());
        assert!(!db.store(b"k", b"z", PutMode::Keep).unwrap());
        db.store(b"k", b"b", PutMode::Cat).unwrap();
        db.store(b"k", b"c", PutMode::Dup).unwrap();
        assert_eq!(db.values(b"k", true).unwrap(), vec![b"ab".to_vec(), b"c".to_vec()]);
        assert_eq!(db.values(b"k", false).unwrap(), vec![b"ab".to_vec()]);

        db.remove(b"k", true).unwrap();
        assert!(db.values(b"k", true).unwrap().is_empty());
    }

    #[test]
    fn test_hash_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let hash = HashDb::new();
        hash.open(dir.path().join("dup.tch"), OpenMode::WRITER | OpenMode::CREATE)
            .unwrap();
        let err = KeyValue::store(&hash, b"k", b"v", PutMode::Dup).unwrap_err();
        assert_eq!(err.kind(), "invalid_operation");
    }
}
