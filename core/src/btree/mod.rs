//! Ordered key/value store with duplicate keys and cursors.

mod comparator;
mod cursor;
mod tree;

pub use comparator::{BuiltinComparator, Comparator, ContextComparator};
pub use cursor::{Cursor, CursorPut};
pub use tree::{Entries, OrderedTree, Pos};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{BTreeOptions, OpenMode, Tuning};
use crate::error::{CaskError, Result};
use crate::hash::{active_transaction, add_double, add_int, apply_tuning, check_copy_target};
use crate::storage::{Codec, Engine, FileHeader, StoreKind, TxGate};

/// B+tree database: keys kept in comparator order, each with a chain of
/// one or more values.
pub struct BTreeDb {
    shared: Arc<BTreeShared>,
}

pub(crate) struct BTreeShared {
    state: RwLock<BTreeState>,
    gate: TxGate,
}

pub(crate) struct BTreeState {
    options: BTreeOptions,
    engine: Option<Engine<OrderedTree>>,
    /// Bumped on open and close to invalidate cursors.
    generation: u64,
}

impl BTreeState {
    fn engine(&self) -> Result<&Engine<OrderedTree>> {
        self.engine.as_ref().ok_or(CaskError::NotOpen)
    }

    fn engine_mut(&mut self) -> Result<&mut Engine<OrderedTree>> {
        self.engine.as_mut().ok_or(CaskError::NotOpen)
    }

    /// Engine of the open generation `generation`.
    pub(crate) fn engine_at(&self, generation: u64) -> Result<&Engine<OrderedTree>> {
        if generation != self.generation {
            return Err(CaskError::NotOpen);
        }
        self.engine()
    }

    pub(crate) fn engine_at_mut(&mut self, generation: u64) -> Result<&mut Engine<OrderedTree>> {
        if generation != self.generation {
            return Err(CaskError::NotOpen);
        }
        self.engine_mut()
    }

    fn options_mut(&mut self) -> Result<&mut BTreeOptions> {
        if self.engine.is_some() {
            return Err(CaskError::InvalidOperation(
                "configuration cannot change while the database is open".into(),
            ));
        }
        Ok(&mut self.options)
    }
}

impl Default for BTreeDb {
    fn default() -> Self {
        Self::new()
    }
}

impl BTreeDb {
    pub fn new() -> Self {
        Self::with_options(BTreeOptions::default())
    }

    pub fn with_options(options: BTreeOptions) -> Self {
        Self {
            shared: Arc::new(BTreeShared {
                state: RwLock::new(BTreeState {
                    options,
                    engine: None,
                    generation: 0,
                }),
                gate: TxGate::default(),
            }),
        }
    }

    /// Set the key order. Only before `open`.
    pub fn setcmpfunc(&self, comparator: Arc<dyn Comparator>) -> Result<()> {
        self.shared.state.write().options_mut()?.comparator = Some(comparator);
        Ok(())
    }

    pub fn setmutex(&self) -> Result<()> {
        self.shared.state.write().options_mut()?.storage.mutex = true;
        Ok(())
    }

    pub fn tune(&self, tuning: Tuning) -> Result<()> {
        let mut state = self.shared.state.write();
        let options = state.options_mut()?;
        if tuning.bucket_count > 0 {
            options.bucket_count = tuning.bucket_count;
        }
        if let Some(lmemb) = tuning.leaf_members {
            options.leaf_members = lmemb;
        }
        if let Some(nmemb) = tuning.internal_members {
            options.internal_members = nmemb;
        }
        tuning.apply_storage(&mut options.storage);
        Ok(())
    }

    pub fn setcache(&self, leaf_cache: usize, node_cache: usize) -> Result<()> {
        let mut state = self.shared.state.write();
        let options = state.options_mut()?;
        options.leaf_cache = leaf_cache;
        options.node_cache = node_cache;
        Ok(())
    }

    pub fn setxmsize(&self, xmsize: u64) -> Result<()> {
        self.shared.state.write().options_mut()?.storage.xmsize = xmsize;
        Ok(())
    }

    pub fn setdfunit(&self, dfunit: u32) -> Result<()> {
        self.shared.state.write().options_mut()?.storage.dfunit = dfunit;
        Ok(())
    }

    pub fn setcodec(&self, codec: Arc<dyn Codec>) -> Result<()> {
        self.shared.state.write().options_mut()?.storage.codec = Some(codec);
        Ok(())
    }

    pub fn open(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<()> {
        let path = path.as_ref();
        let mut state = self.shared.state.write();
        if state.engine.is_some() {
            return Err(CaskError::InvalidOperation("database is already open".into()));
        }
        state.options.validate()?;

        let options = &state.options;
        let explicit = options.comparator.clone();
        let proposed = explicit
            .as_ref()
            .map_or(Some(BuiltinComparator::Lexical), |c| c.builtin());
        let header = FileHeader {
            opts: options.storage.opts,
            comparator: proposed.map_or(0, BuiltinComparator::id),
            alignment_power: options.storage.alignment_power,
            free_pool_power: options.storage.free_pool_power,
            bucket_count: options.bucket_count,
            leaf_members: options.leaf_members,
            internal_members: options.internal_members,
            ..FileHeader::new(StoreKind::BTree)
        };

        let engine = Engine::open(
            path,
            mode,
            header,
            options.storage.codec.clone(),
            options.storage.dfunit,
            |header| {
                let comparator = resolve_comparator(explicit, header.comparator)?;
                Ok(OrderedTree::new(
                    comparator,
                    header.leaf_members,
                    header.internal_members,
                ))
            },
        )?;
        debug!(
            path = %path.display(),
            comparator = engine.map().comparator().name(),
            records = engine.rnum(),
            "btree database opened"
        );
        state.engine = Some(engine);
        state.generation += 1;
        Ok(())
    }

    /// Close the database. Cursors become invalid and an active
    /// transaction is aborted.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        let engine = state.engine.take().ok_or(CaskError::NotOpen)?;
        state.generation += 1;
        let in_transaction = engine.in_transaction();
        let result = engine.close(&mut |_, _, _| {});
        if in_transaction {
            self.shared.gate.release();
        }
        result
    }

    /// Store `value` as the only value of `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.shared.state.write();
        state.engine_mut()?.store(key, Some(vec![value.to_vec()]))
    }

    pub fn putkeep(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut state = self.shared.state.write();
        let engine = state.engine_mut()?;
        if engine.map().contains(key) {
            return Ok(false);
        }
        engine.store(key, Some(vec![value.to_vec()]))?;
        Ok(true)
    }

    /// Append to the first value of `key`, or create the record.
    pub fn putcat(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.shared.state.write();
        let engine = state.engine_mut()?;
        let joined = match engine.map().get(key).and_then(<[Vec<u8>]>::first) {
            Some(first) => [first.as_slice(), value].concat(),
            None => value.to_vec(),
        };
        write_first(engine, key, joined)
    }

    /// Add `value` after the existing values of `key`.
    pub fn putdup(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.shared.state.write();
        let engine = state.engine_mut()?;
        let len = engine.map().get(key).map_or(0, <[Vec<u8>]>::len);
        engine.insert_value(key, len, value.to_vec())
    }

    /// Remove the first value of `key`.
    pub fn out(&self, key: &[u8]) -> Result<()> {
        let mut state = self.shared.state.write();
        state.engine_mut()?.remove_value(key, 0)
    }

    /// Remove every value of `key`.
    pub fn outdup(&self, key: &[u8]) -> Result<()> {
        let mut state = self.shared.state.write();
        let engine = state.engine_mut()?;
        if !engine.map().contains(key) {
            return Err(CaskError::not_found(key));
        }
        engine.store(key, None)
    }

    /// First value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.shared.state.read();
        Ok(state
            .engine()?
            .map()
            .get(key)
            .and_then(|chain| chain.first().cloned()))
    }

    /// Every value of `key` in insertion order.
    pub fn getdup(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let state = self.shared.state.read();
        Ok(state
            .engine()?
            .map()
            .get(key)
            .map(<[Vec<u8>]>::to_vec)
            .unwrap_or_default())
    }

    /// Whether `key` has at least one value.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let state = self.shared.state.read();
        Ok(state.engine()?.map().contains(key))
    }

    pub fn vnum(&self, key: &[u8]) -> Result<usize> {
        let state = self.shared.state.read();
        Ok(state.engine()?.map().get(key).map_or(0, <[Vec<u8>]>::len))
    }

    pub fn vsiz(&self, key: &[u8]) -> Result<Option<usize>> {
        let state = self.shared.state.read();
        Ok(state
            .engine()?
            .map()
            .get(key)
            .and_then(|chain| chain.first().map(Vec::len)))
    }

    /// Keys between `begin` and `end` in key order, once per value.
    /// `None` bounds are open; `max = None` is unlimited.
    pub fn range(
        &self,
        begin: Option<&[u8]>,
        begin_inclusive: bool,
        end: Option<&[u8]>,
        end_inclusive: bool,
        max: Option<usize>,
    ) -> Result<Vec<Vec<u8>>> {
        let state = self.shared.state.read();
        Ok(state.engine()?.map().range(
            begin.map(|key| (key, begin_inclusive)),
            end.map(|key| (key, end_inclusive)),
            max,
        ))
    }

    pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        let state = self.shared.state.read();
        Ok(state.engine()?.map().fwmkeys(prefix, max))
    }

    /// Distinct keys in key order.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let state = self.shared.state.read();
        Ok(state
            .engine()?
            .map()
            .entries()
            .map(|(key, _)| key.to_vec())
            .collect())
    }

    /// Add to the 4-byte integer first value of `key`.
    pub fn addint(&self, key: &[u8], delta: i32) -> Result<i32> {
        let mut state = self.shared.state.write();
        let engine = state.engine_mut()?;
        let first = engine.map().get(key).and_then(<[Vec<u8>]>::first);
        let sum = add_int(first.map(Vec::as_slice), delta)?;
        write_first(engine, key, sum.to_le_bytes().to_vec())?;
        Ok(sum)
    }

    /// Add to the 8-byte float first value of `key`.
    pub fn adddouble(&self, key: &[u8], delta: f64) -> Result<f64> {
        let mut state = self.shared.state.write();
        let engine = state.engine_mut()?;
        let first = engine.map().get(key).and_then(<[Vec<u8>]>::first);
        let sum = add_double(first.map(Vec::as_slice), delta)?;
        write_first(engine, key, sum.to_le_bytes().to_vec())?;
        Ok(sum)
    }

    /// New cursor, initially unset.
    pub fn cursor(&self) -> Result<Cursor> {
        let state = self.shared.state.read();
        state.engine()?;
        Ok(Cursor::new(Arc::downgrade(&self.shared), state.generation))
    }

    pub fn sync(&self) -> Result<()> {
        self.shared.state.read().engine()?.sync()
    }

    /// Rebuild the tree and file with new tuning.
    pub fn optimize(&self, tuning: Tuning) -> Result<()> {
        let mut state = self.shared.state.write();
        let codec = state.options.storage.codec.clone();
        let engine = state.engine_mut()?;
        engine.check_writable()?;

        let mut header = *engine.header();
        if tuning.bucket_count > 0 {
            header.bucket_count = tuning.bucket_count;
        }
        if let Some(lmemb) = tuning.leaf_members {
            header.leaf_members = lmemb.max(crate::config::BTREE_MIN_MEMBERS);
        }
        if let Some(nmemb) = tuning.internal_members {
            header.internal_members = nmemb.max(crate::config::BTREE_MIN_MEMBERS);
        }
        apply_tuning(&mut header, &tuning);
        if header.opts.compressed() && codec.is_none() {
            return Err(CaskError::Config("compression option requires a codec".into()));
        }

        let current = engine.map();
        let mut tree = OrderedTree::new(
            Arc::clone(current.comparator()),
            header.leaf_members,
            header.internal_members,
        );
        for (key, values) in current.entries() {
            tree.insert(key, values.to_vec());
        }
        engine.replace_image(header, tree)?;
        info!(
            leaf_members = header.leaf_members,
            internal_members = header.internal_members,
            records = engine.rnum(),
            "btree database optimized"
        );
        Ok(())
    }

    pub fn vanish(&self) -> Result<()> {
        self.shared.state.write().engine_mut()?.vanish()
    }

    pub fn copy(&self, dest: impl AsRef<Path>) -> Result<()> {
        let state = self.shared.state.read();
        let engine = state.engine()?;
        check_copy_target(engine.path(), dest.as_ref())?;
        engine.copy_to(dest.as_ref())
    }

    /// Number of values across all keys.
    pub fn rnum(&self) -> Result<u64> {
        Ok(self.shared.state.read().engine()?.rnum())
    }

    pub fn fsiz(&self) -> Result<u64> {
        Ok(self.shared.state.read().engine()?.fsiz())
    }

    pub fn path(&self) -> Option<PathBuf> {
        let state = self.shared.state.read();
        state.engine.as_ref().map(|e| e.path().to_path_buf())
    }

    pub fn tranbegin(&self) -> Result<()> {
        let wait = {
            let state = self.shared.state.read();
            state.engine()?.check_writable()?;
            state.options.storage.mutex
        };
        self.shared.gate.acquire(wait)?;
        let begun = self.shared.state.write().engine_mut().and_then(Engine::begin);
        if begun.is_err() {
            self.shared.gate.release();
        }
        begun
    }

    pub fn trancommit(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        let engine = active_transaction(state.engine_mut()?)?;
        let result = engine.commit(&mut |_, _, _| {});
        self.shared.gate.release();
        result
    }

    pub fn tranabort(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        let engine = active_transaction(state.engine_mut()?)?;
        let result = engine.abort(&mut |_, _, _| {});
        self.shared.gate.release();
        result
    }
}

/// Overwrite the first value of `key`, creating the record if absent.
fn write_first(engine: &mut Engine<OrderedTree>, key: &[u8], value: Vec<u8>) -> Result<()> {
    if engine.map().contains(key) {
        engine.replace_value(key, 0, value)
    } else {
        engine.insert_value(key, 0, value)
    }
}

/// Pick the comparator for a file recording builtin `recorded` (0 for
/// none). An explicit builtin must match the recorded one.
fn resolve_comparator(
    explicit: Option<Arc<dyn Comparator>>,
    recorded: u8,
) -> Result<Arc<dyn Comparator>> {
    match explicit {
        Some(comparator) => {
            if let Some(builtin) = comparator.builtin() {
                if recorded != 0 && builtin.id() != recorded {
                    return Err(CaskError::Config(format!(
                        "file was created with comparator {}, not {}",
                        BuiltinComparator::from_id(recorded).map_or("custom", BuiltinComparator::as_str),
                        builtin.as_str()
                    )));
                }
            }
            Ok(comparator)
        }
        None => Ok(BuiltinComparator::from_id(recorded)
            .unwrap_or(BuiltinComparator::Lexical)
            .shared()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn writer() -> OpenMode {
        OpenMode::WRITER | OpenMode::CREATE
    }

    fn open_db(path: &Path) -> BTreeDb {
        let db = BTreeDb::with_options(BTreeOptions::default().with_members(4, 4));
        db.open(path, writer()).unwrap();
        db
    }

    #[test]
    fn test_put_replaces_chain() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("put.tcb"));
        db.putdup(b"k", b"1").unwrap();
        db.putdup(b"k", b"2").unwrap();
        assert_eq!(db.vnum(b"k").unwrap(), 2);
        db.put(b"k", b"3").unwrap();
        assert_eq!(db.getdup(b"k").unwrap(), vec![b"3".to_vec()]);
    }

    #[test]
    fn test_duplicates() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("dup.tcb"));
        for value in ["a", "b", "c"] {
            db.putdup(b"k", value.as_bytes()).unwrap();
        }
        assert_eq!(
            db.getdup(b"k").unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert_eq!(db.get(b"k").unwrap(), Some(b"a".to_vec()));
        assert_eq!(db.rnum().unwrap(), 3);
        assert!(db.contains(b"k").unwrap());
        assert!(!db.contains(b"j").unwrap());

        db.out(b"k").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"b".to_vec()));

        db.outdup(b"k").unwrap();
        assert!(!db.contains(b"k").unwrap());
        assert_eq!(db.vnum(b"k").unwrap(), 0);
        assert!(db.getdup(b"k").unwrap().is_empty());
        assert!(db.outdup(b"k").unwrap_err().is_not_found());
        assert!(db.out(b"k").unwrap_err().is_not_found());
    }

    #[test]
    fn test_putcat_and_addint_touch_first_value() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("first.tcb"));
        db.putdup(b"s", b"ab").unwrap();
        db.putdup(b"s", b"zz").unwrap();
        db.putcat(b"s", b"cd").unwrap();
        assert_eq!(db.getdup(b"s").unwrap(), vec![b"abcd".to_vec(), b"zz".to_vec()]);

        assert_eq!(db.addint(b"n", 3).unwrap(), 3);
        db.putdup(b"n", b"tail").unwrap();
        assert_eq!(db.addint(b"n", 4).unwrap(), 7);
        assert_eq!(db.vnum(b"n").unwrap(), 2);
        assert_eq!(db.adddouble(b"n", 1.0).unwrap_err().kind(), "type_error");
    }

    #[test]
    fn test_range_and_prefix() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("range.tcb"));
        for key in ["b", "d", "a", "c", "e"] {
            db.put(key.as_bytes(), b"").unwrap();
        }
        db.putdup(b"c", b"again").unwrap();

        let keys = db.range(Some(b"b".as_slice()), true, Some(b"d".as_slice()), false, None).unwrap();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec(), b"c".to_vec()]);
        let keys = db.range(None, true, None, true, Some(2)).unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        db.put(b"car", b"").unwrap();
        db.put(b"cat", b"").unwrap();
        assert_eq!(
            db.fwmkeys(b"ca", None).unwrap(),
            vec![b"car".to_vec(), b"cat".to_vec()]
        );
    }

    #[test]
    fn test_builtin_comparator_is_adopted_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("int.tcb");
        let db = BTreeDb::with_options(
            BTreeOptions::default().with_comparator(BuiltinComparator::Int32.shared()),
        );
        db.open(&path, writer()).unwrap();
        for n in [300i32, -7, 42] {
            db.put(&n.to_le_bytes(), b"").unwrap();
        }
        db.close().unwrap();

        let reopened = BTreeDb::new();
        reopened.open(&path, writer()).unwrap();
        let keys: Vec<i32> = reopened
            .keys()
            .unwrap()
            .iter()
            .map(|k| i32::from_le_bytes([k[0], k[1], k[2], k[3]]))
            .collect();
        assert_eq!(keys, vec![-7, 42, 300]);
        reopened.close().unwrap();

        let mismatched = BTreeDb::new();
        mismatched
            .setcmpfunc(BuiltinComparator::Decimal.shared())
            .unwrap();
        assert_eq!(
            mismatched.open(&path, writer()).unwrap_err().kind(),
            "config_error"
        );
    }

    #[test]
    fn test_custom_comparator() {
        let dir = tempdir().unwrap();
        let reverse = ContextComparator::new((), |a: &[u8], b: &[u8], _: &()| b.cmp(a));
        let db = BTreeDb::new();
        db.setcmpfunc(Arc::new(reverse)).unwrap();
        db.open(dir.path().join("rev.tcb"), writer()).unwrap();
        for key in ["a", "c", "b"] {
            db.put(key.as_bytes(), b"").unwrap();
        }
        assert_eq!(
            db.keys().unwrap(),
            vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );
        assert!(db.setcmpfunc(BuiltinComparator::Lexical.shared()).is_err());
    }

    #[test]
    fn test_optimize_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opt.tcb");
        let db = open_db(&path);
        for i in 0..200 {
            db.put(format!("{i:04}").as_bytes(), b"v").unwrap();
        }
        for i in 0..100 {
            db.out(format!("{i:04}").as_bytes()).unwrap();
        }
        let before = db.fsiz().unwrap();
        db.optimize(Tuning {
            leaf_members: Some(64),
            ..Tuning::default()
        })
        .unwrap();
        assert!(db.fsiz().unwrap() < before);
        db.close().unwrap();

        let db = BTreeDb::new();
        db.open(&path, OpenMode::READER).unwrap();
        assert_eq!(db.rnum().unwrap(), 100);
        assert_eq!(db.keys().unwrap().first(), Some(&b"0100".to_vec()));
    }

    #[test]
    fn test_transaction_commit_and_abort() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tx.tcb");
        let db = open_db(&path);
        db.put(b"a", b"1").unwrap();

        db.tranbegin().unwrap();
        db.putdup(b"a", b"2").unwrap();
        db.putcat(b"a", b"9").unwrap();
        db.out(b"a").unwrap();
        db.put(b"b", b"x").unwrap();
        db.tranabort().unwrap();
        assert_eq!(db.getdup(b"a").unwrap(), vec![b"1".to_vec()]);
        assert_eq!(db.get(b"b").unwrap(), None);

        db.tranbegin().unwrap();
        db.putdup(b"a", b"3").unwrap();
        db.trancommit().unwrap();
        db.close().unwrap();

        db.open(&path, writer()).unwrap();
        assert_eq!(db.getdup(b"a").unwrap(), vec![b"1".to_vec(), b"3".to_vec()]);
    }
}
