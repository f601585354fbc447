//! Table store: schema-less records of named string columns, with
//! secondary indexes and queries.

mod index;
mod record;

pub use index::{IndexKind, IndexOp, IndexSpec};
pub use record::{Columns, NUMERIC_COLUMN, columns};

pub(crate) use index::SecondaryIndex;
pub(crate) use record::{column_value, decode};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{OpenMode, TableOptions, Tuning, check_bucket_count};
use crate::error::{CaskError, Result};
use crate::hash::{BucketMap, active_transaction, apply_tuning, check_copy_target};
use crate::query::{Query, SetOp};
use crate::storage::{Codec, Engine, FileHeader, StoreKind, TxGate};
use index::{INDEX_META_PREFIX, IndexDecl, meta_name};
use record::{encode, numeric};

const UID_META: &str = "uid";

/// Table database: records keyed by primary key, each a map of column
/// names to string values.
pub struct TableDb {
    shared: Arc<TableShared>,
}

pub(crate) struct TableShared {
    pub(crate) state: RwLock<TableState>,
    gate: TxGate,
}

pub(crate) struct TableState {
    options: TableOptions,
    engine: Option<Engine<BucketMap>>,
    indexes: BTreeMap<String, SecondaryIndex>,
    /// Bumped on open and close to invalidate queries.
    generation: u64,
}

/// Summary of one secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub column: String,
    pub kind: IndexKind,
    pub built: bool,
    /// Distinct index terms.
    pub terms: usize,
}

impl TableState {
    fn engine(&self) -> Result<&Engine<BucketMap>> {
        self.engine.as_ref().ok_or(CaskError::NotOpen)
    }

    fn engine_mut(&mut self) -> Result<&mut Engine<BucketMap>> {
        self.engine.as_mut().ok_or(CaskError::NotOpen)
    }

    fn options_mut(&mut self) -> Result<&mut TableOptions> {
        if self.engine.is_some() {
            return Err(CaskError::InvalidOperation(
                "configuration cannot change while the database is open".into(),
            ));
        }
        Ok(&mut self.options)
    }

    /// Records of the open generation `generation`.
    pub(crate) fn records_at(&self, generation: u64) -> Result<&BucketMap> {
        if generation != self.generation {
            return Err(CaskError::NotOpen);
        }
        Ok(self.engine()?.map())
    }

    pub(crate) fn indexes(&self) -> &BTreeMap<String, SecondaryIndex> {
        &self.indexes
    }

    pub(crate) fn has_pending_indexes(&self) -> bool {
        self.indexes.values().any(|index| !index.is_built())
    }

    /// Build every index declared as deferred and not yet built.
    pub(crate) fn build_pending_indexes(&mut self) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(CaskError::NotOpen)?;
        for index in self.indexes.values_mut().filter(|index| !index.is_built()) {
            build_index(index, engine.map())?;
        }
        Ok(())
    }

    fn record(&self, pk: &[u8]) -> Result<Option<Columns>> {
        self.engine()?.map().get(pk).map(|bytes| decode(bytes)).transpose()
    }

    /// Store or remove the record of `pk`, keeping built indexes in step.
    pub(crate) fn write_record(&mut self, pk: &[u8], record: Option<&Columns>) -> Result<()> {
        let engine = self.engine.as_mut().ok_or(CaskError::NotOpen)?;
        let encoded = record.map(encode).transpose()?;
        let previous = engine.map().get(pk).map(|bytes| decode(bytes)).transpose()?;
        engine.store(pk, encoded.map(|bytes| vec![bytes]))?;

        for index in self.indexes.values_mut().filter(|index| index.is_built()) {
            if let Some(old) = &previous {
                index.remove(pk, old);
            }
            if let Some(new) = record {
                index.insert(pk, new);
            }
        }
        Ok(())
    }
}

fn build_index(index: &mut SecondaryIndex, map: &BucketMap) -> Result<()> {
    let mut records = Vec::with_capacity(map.len());
    for (pk, bytes) in map.iter() {
        records.push((pk, decode(bytes)?));
    }
    index.rebuild(records);
    info!(
        column = index.column(),
        kind = index.kind().as_str(),
        terms = index.term_count(),
        "index built"
    );
    Ok(())
}

/// Rollback hook moving index entries from the current record to the
/// restored one.
fn restore_indexes<'a>(
    indexes: &'a mut BTreeMap<String, SecondaryIndex>,
) -> impl FnMut(&[u8], Option<&[Vec<u8>]>, Option<&[Vec<u8>]>) + 'a {
    move |pk, current, restored| {
        let current = current.and_then(first_columns);
        let restored = restored.and_then(first_columns);
        for index in indexes.values_mut().filter(|index| index.is_built()) {
            if let Some(columns) = &current {
                index.remove(pk, columns);
            }
            if let Some(columns) = &restored {
                index.insert(pk, columns);
            }
        }
    }
}

fn first_columns(chain: &[Vec<u8>]) -> Option<Columns> {
    match decode(chain.first()?) {
        Ok(columns) => Some(columns),
        Err(err) => {
            warn!(%err, "skipping undecodable record while restoring indexes");
            None
        }
    }
}

impl Default for TableDb {
    fn default() -> Self {
        Self::new()
    }
}

impl TableDb {
    pub fn new() -> Self {
        Self::with_options(TableOptions::default())
    }

    pub fn with_options(options: TableOptions) -> Self {
        Self {
            shared: Arc::new(TableShared {
                state: RwLock::new(TableState {
                    options,
                    engine: None,
                    indexes: BTreeMap::new(),
                    generation: 0,
                }),
                gate: TxGate::default(),
            }),
        }
    }

    pub fn setmutex(&self) -> Result<()> {
        self.shared.state.write().options_mut()?.storage.mutex = true;
        Ok(())
    }

    pub fn tune(&self, tuning: Tuning) -> Result<()> {
        let mut state = self.shared.state.write();
        let options = state.options_mut()?;
        if tuning.bucket_count > 0 {
            options.bucket_count = check_bucket_count(tuning.bucket_count)?;
        }
        tuning.apply_storage(&mut options.storage);
        Ok(())
    }

    /// Record cache size, plus leaf and node cache sizes of the indexes.
    pub fn setcache(&self, record_cache: usize, leaf_cache: usize, node_cache: usize) -> Result<()> {
        let mut state = self.shared.state.write();
        let options = state.options_mut()?;
        options.record_cache = record_cache;
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

    /// Open the table and rebuild its declared indexes from the records.
    /// Deferred indexes wait for the first query.
    pub fn open(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<()> {
        let path = path.as_ref();
        let mut state = self.shared.state.write();
        if state.engine.is_some() {
            return Err(CaskError::InvalidOperation("database is already open".into()));
        }
        state.options.validate()?;

        let options = &state.options;
        let header = FileHeader {
            opts: options.storage.opts,
            alignment_power: options.storage.alignment_power,
            free_pool_power: options.storage.free_pool_power,
            bucket_count: options.bucket_count,
            ..FileHeader::new(StoreKind::Table)
        };
        let engine = Engine::open(
            path,
            mode,
            header,
            options.storage.codec.clone(),
            options.storage.dfunit,
            |header| Ok(BucketMap::new(check_bucket_count(header.bucket_count)?)),
        )?;

        let mut indexes = BTreeMap::new();
        for (name, value) in engine.meta_entries() {
            let Some(column) = name.strip_prefix(INDEX_META_PREFIX) else {
                continue;
            };
            let decl: IndexDecl = bincode::deserialize(value)?;
            let mut index = SecondaryIndex::new(column, decl.kind);
            if !decl.deferred {
                build_index(&mut index, engine.map())?;
            }
            indexes.insert(column.to_string(), index);
        }
        debug!(
            path = %path.display(),
            records = engine.rnum(),
            indexes = indexes.len(),
            "table database opened"
        );
        state.engine = Some(engine);
        state.indexes = indexes;
        state.generation += 1;
        Ok(())
    }

    /// Close the table. Queries become invalid and an active transaction
    /// is aborted.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.write();
        let engine = state.engine.take().ok_or(CaskError::NotOpen)?;
        state.indexes.clear();
        state.generation += 1;
        let in_transaction = engine.in_transaction();
        let result = engine.close(&mut |_, _, _| {});
        if in_transaction {
            self.shared.gate.release();
        }
        result
    }

    /// Store `record` under `pk`, replacing any existing record.
    pub fn put(&self, pk: &[u8], record: &Columns) -> Result<()> {
        self.shared.state.write().write_record(pk, Some(record))
    }

    /// Store only if `pk` is absent. Returns `false` if it already exists.
    pub fn putkeep(&self, pk: &[u8], record: &Columns) -> Result<bool> {
        let mut state = self.shared.state.write();
        if state.engine()?.map().contains(pk) {
            return Ok(false);
        }
        state.write_record(pk, Some(record))?;
        Ok(true)
    }

    /// Merge `record` into the existing one. Existing columns keep their
    /// values; new names are added.
    pub fn putcat(&self, pk: &[u8], record: &Columns) -> Result<()> {
        let mut state = self.shared.state.write();
        let mut merged = state.record(pk)?.unwrap_or_default();
        for (name, value) in record {
            merged
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        state.write_record(pk, Some(&merged))
    }

    pub fn out(&self, pk: &[u8]) -> Result<()> {
        let mut state = self.shared.state.write();
        if !state.engine()?.map().contains(pk) {
            return Err(CaskError::not_found(pk));
        }
        state.write_record(pk, None)
    }

    pub fn get(&self, pk: &[u8]) -> Result<Option<Columns>> {
        self.shared.state.read().record(pk)
    }

    /// Whether a record is stored under `pk`, without decoding it.
    pub fn contains(&self, pk: &[u8]) -> Result<bool> {
        let state = self.shared.state.read();
        Ok(state.engine()?.map().contains(pk))
    }

    /// Size of the stored form of the record.
    pub fn vsiz(&self, pk: &[u8]) -> Result<Option<usize>> {
        let state = self.shared.state.read();
        Ok(state.engine()?.map().get(pk).map(Vec::len))
    }

    /// Primary keys starting with `prefix`, in iteration order.
    pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        let state = self.shared.state.read();
        Ok(state
            .engine()?
            .map()
            .keys()
            .filter(|pk| pk.starts_with(prefix))
            .take(max.unwrap_or(usize::MAX))
            .map(<[u8]>::to_vec)
            .collect())
    }

    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let state = self.shared.state.read();
        Ok(state.engine()?.map().keys().map(<[u8]>::to_vec).collect())
    }

    /// Add to the integer in the `_num` column. A missing record is
    /// created holding only that column.
    pub fn addint(&self, pk: &[u8], delta: i32) -> Result<i32> {
        let mut state = self.shared.state.write();
        let mut record = state.record(pk)?;
        let sum = (numeric(record.as_ref()) as i32).wrapping_add(delta);
        let record = record.get_or_insert_with(Columns::new);
        record.insert(NUMERIC_COLUMN.to_string(), sum.to_string());
        state.write_record(pk, Some(&*record))?;
        Ok(sum)
    }

    /// Add to the number in the `_num` column.
    pub fn adddouble(&self, pk: &[u8], delta: f64) -> Result<f64> {
        let mut state = self.shared.state.write();
        let mut record = state.record(pk)?;
        let sum = numeric(record.as_ref()) + delta;
        let record = record.get_or_insert_with(Columns::new);
        record.insert(NUMERIC_COLUMN.to_string(), sum.to_string());
        state.write_record(pk, Some(&*record))?;
        Ok(sum)
    }

    /// Create, rebuild or remove the index on `column`.
    pub fn setindex(&self, column: &str, spec: IndexSpec) -> Result<()> {
        if column.is_empty() {
            return Err(CaskError::InvalidOperation(
                "the primary key is always indexed".into(),
            ));
        }
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let engine = state.engine.as_mut().ok_or(CaskError::NotOpen)?;
        engine.check_writable()?;
        if engine.in_transaction() {
            return Err(CaskError::InvalidOperation(
                "cannot change indexes during a transaction".into(),
            ));
        }

        match spec.op {
            IndexOp::Create(kind) => {
                if spec.keep && state.indexes.contains_key(column) {
                    return Err(CaskError::AlreadyExists(format!("index on column {column:?}")));
                }
                let decl = IndexDecl {
                    kind,
                    deferred: spec.deferred,
                };
                engine.set_meta(&meta_name(column), Some(bincode::serialize(&decl)?))?;
                let mut index = SecondaryIndex::new(column, kind);
                if !spec.deferred {
                    build_index(&mut index, engine.map())?;
                }
                state.indexes.insert(column.to_string(), index);
            }
            IndexOp::Optimize => {
                let index = state
                    .indexes
                    .get_mut(column)
                    .ok_or_else(|| CaskError::NotFound(format!("no index on column {column:?}")))?;
                build_index(index, engine.map())?;
            }
            IndexOp::Remove => {
                if !state.indexes.contains_key(column) {
                    return Err(CaskError::NotFound(format!("no index on column {column:?}")));
                }
                engine.set_meta(&meta_name(column), None)?;
                state.indexes.remove(column);
                debug!(column, "index removed");
            }
        }
        Ok(())
    }

    pub fn indexes(&self) -> Result<Vec<IndexInfo>> {
        let state = self.shared.state.read();
        state.engine()?;
        Ok(state
            .indexes
            .values()
            .map(|index| IndexInfo {
                column: index.column().to_string(),
                kind: index.kind(),
                built: index.is_built(),
                terms: index.term_count(),
            })
            .collect())
    }

    /// Next value of the table's persistent unique id counter, starting
    /// at 1. Ids handed out inside a transaction stay used after an abort.
    pub fn genuid(&self) -> Result<u64> {
        let mut state = self.shared.state.write();
        let engine = state.engine_mut()?;
        let current = match engine.meta(UID_META) {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| CaskError::Corrupt("unique id counter is damaged".into()))?;
                u64::from_le_bytes(raw)
            }
            None => 0,
        };
        let next = current + 1;
        engine.set_meta_durable(UID_META, next.to_le_bytes().to_vec())?;
        Ok(next)
    }

    /// New query bound to the open table.
    pub fn query(&self) -> Result<Query> {
        let state = self.shared.state.read();
        state.engine()?;
        Ok(Query::new(Arc::downgrade(&self.shared), state.generation))
    }

    /// Combine the matching keys of several queries on this table.
    ///
    /// Order and limit of the first query apply to the combined result.
    pub fn metasearch(&self, queries: &[&Query], op: SetOp) -> Result<Vec<Vec<u8>>> {
        if queries.iter().any(|query| !query.is_bound_to(&self.shared)) {
            return Err(CaskError::Query(
                "every query must be bound to this table".into(),
            ));
        }
        crate::query::metasearch(&self.shared, queries, op)
    }

    pub fn sync(&self) -> Result<()> {
        self.shared.state.read().engine()?.sync()
    }

    /// Rebuild the file with new tuning, then every index.
    pub fn optimize(&self, tuning: Tuning) -> Result<()> {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let codec = state.options.storage.codec.clone();
        let engine = state.engine.as_mut().ok_or(CaskError::NotOpen)?;
        engine.check_writable()?;

        let mut header = *engine.header();
        header.bucket_count = tuning.rebuild_buckets(engine.rnum(), header.bucket_count)?;
        apply_tuning(&mut header, &tuning);
        if header.opts.compressed() && codec.is_none() {
            return Err(CaskError::Config("compression option requires a codec".into()));
        }

        let mut map = BucketMap::new(header.bucket_count);
        for (pk, bytes) in engine.map().iter() {
            map.insert(pk, bytes.to_vec());
        }
        engine.replace_image(header, map)?;
        for index in state.indexes.values_mut() {
            build_index(index, engine.map())?;
        }
        info!(
            buckets = header.bucket_count,
            records = engine.rnum(),
            indexes = state.indexes.len(),
            "table database optimized"
        );
        Ok(())
    }

    /// Remove every record. Index declarations and the id counter survive.
    pub fn vanish(&self) -> Result<()> {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        state.engine.as_mut().ok_or(CaskError::NotOpen)?.vanish()?;
        for index in state.indexes.values_mut() {
            index.clear();
        }
        Ok(())
    }

    pub fn copy(&self, dest: impl AsRef<Path>) -> Result<()> {
        let state = self.shared.state.read();
        let engine = state.engine()?;
        check_copy_target(engine.path(), dest.as_ref())?;
        engine.copy_to(dest.as_ref())
    }

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
        let mut guard = self.shared.state.write();
        let TableState { engine, indexes, .. } = &mut *guard;
        let engine = active_transaction(engine.as_mut().ok_or(CaskError::NotOpen)?)?;
        let result = engine.commit(&mut restore_indexes(indexes));
        self.shared.gate.release();
        result
    }

    /// Undo every change of the transaction, indexes included.
    pub fn tranabort(&self) -> Result<()> {
        let mut guard = self.shared.state.write();
        let TableState { engine, indexes, .. } = &mut *guard;
        let engine = active_transaction(engine.as_mut().ok_or(CaskError::NotOpen)?)?;
        let result = engine.abort(&mut restore_indexes(indexes));
        self.shared.gate.release();
        result
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

    fn open_db(path: &Path) -> TableDb {
        let db = TableDb::with_options(TableOptions::default().with_bucket_count(61));
        db.open(path, writer()).unwrap();
        db
    }

    fn person(name: &str, age: u32) -> Columns {
        columns([("name", name.to_string()), ("age", age.to_string())])
    }

    #[test]
    fn test_put_get_out() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("people.tct"));
        db.put(b"1", &person("alice", 31)).unwrap();
        assert_eq!(db.get(b"1").unwrap(), Some(person("alice", 31)));
        assert_eq!(db.vsiz(b"1").unwrap(), Some("age\x0031\x00name\x00alice\x00".len()));

        assert!(!db.putkeep(b"1", &person("bob", 40)).unwrap());
        assert!(db.putkeep(b"2", &person("bob", 40)).unwrap());
        assert_eq!(db.rnum().unwrap(), 2);

        db.out(b"1").unwrap();
        assert_eq!(db.get(b"1").unwrap(), None);
        assert!(db.out(b"1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_contains() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("contains.tct"));
        db.put(b"1", &person("alice", 31)).unwrap();
        assert!(db.contains(b"1").unwrap());
        assert!(!db.contains(b"2").unwrap());

        db.tranbegin().unwrap();
        db.put(b"2", &person("bob", 40)).unwrap();
        assert!(db.contains(b"2").unwrap());
        db.tranabort().unwrap();
        assert!(!db.contains(b"2").unwrap());
    }

    #[test]
    fn test_putcat_keeps_existing_columns() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("cat.tct"));
        db.put(b"1", &person("alice", 31)).unwrap();
        db.putcat(b"1", &columns([("name", "mallory"), ("city", "oslo")]))
            .unwrap();
        assert_eq!(
            db.get(b"1").unwrap(),
            Some(columns([("name", "alice"), ("age", "31"), ("city", "oslo")]))
        );
    }

    #[test]
    fn test_numeric_column() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("num.tct"));
        assert_eq!(db.addint(b"c", 5).unwrap(), 5);
        assert_eq!(db.addint(b"c", -2).unwrap(), 3);
        assert_eq!(db.get(b"c").unwrap(), Some(columns([("_num", "3")])));
        assert_eq!(db.adddouble(b"c", 0.5).unwrap(), 3.5);

        db.put(b"d", &columns([("name", "x"), ("_num", "1.5")])).unwrap();
        assert_eq!(db.adddouble(b"d", 1.0).unwrap(), 2.5);
        assert_eq!(db.get(b"d").unwrap().unwrap()["name"], "x");
    }

    #[test]
    fn test_invalid_columns_have_no_effect() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("nul.tct"));
        let err = db.put(b"1", &columns([("bad", "a\0b")])).unwrap_err();
        assert_eq!(err.kind(), "invalid_operation");
        assert_eq!(db.rnum().unwrap(), 0);
    }

    #[test]
    fn test_genuid_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uid.tct");
        let db = open_db(&path);
        assert_eq!(db.genuid().unwrap(), 1);
        assert_eq!(db.genuid().unwrap(), 2);
        db.vanish().unwrap();
        db.close().unwrap();

        let db = open_db(&path);
        assert_eq!(db.genuid().unwrap(), 3);
    }

    #[test]
    fn test_genuid_not_reused_after_abort() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uid_abort.tct");
        let db = open_db(&path);
        assert_eq!(db.genuid().unwrap(), 1);

        db.tranbegin().unwrap();
        let id = db.genuid().unwrap();
        db.put(id.to_string().as_bytes(), &person("carol", 22)).unwrap();
        db.tranabort().unwrap();
        assert_eq!(id, 2);
        assert_eq!(db.rnum().unwrap(), 0);
        assert_eq!(db.genuid().unwrap(), 3);

        db.tranbegin().unwrap();
        assert_eq!(db.genuid().unwrap(), 4);
        db.tranabort().unwrap();
        db.close().unwrap();

        let db = open_db(&path);
        assert_eq!(db.genuid().unwrap(), 5);
    }

    #[test]
    fn test_setindex_modifiers() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("idx.tct"));
        db.put(b"1", &person("alice", 31)).unwrap();

        db.setindex("age", IndexSpec::new(IndexKind::Decimal)).unwrap();
        let err = db
            .setindex("age", IndexSpec::new(IndexKind::Lexical).keep())
            .unwrap_err();
        assert_eq!(err.kind(), "already_exists");
        db.setindex("age", IndexSpec::new(IndexKind::Lexical)).unwrap();
        db.setindex("age", IndexSpec::optimize()).unwrap();

        let info = db.indexes().unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].kind, IndexKind::Lexical);
        assert!(info[0].built);
        assert_eq!(info[0].terms, 1);

        db.setindex("age", IndexSpec::void()).unwrap();
        assert!(db.setindex("age", IndexSpec::void()).unwrap_err().is_not_found());
        assert!(db.setindex("age", IndexSpec::optimize()).unwrap_err().is_not_found());
        assert_eq!(
            db.setindex("", IndexSpec::new(IndexKind::Lexical)).unwrap_err().kind(),
            "invalid_operation"
        );
    }

    #[test]
    fn test_index_declarations_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decl.tct");
        let db = open_db(&path);
        db.setindex("name", IndexSpec::new(IndexKind::Token)).unwrap();
        db.setindex("age", IndexSpec::new(IndexKind::Decimal).deferred())
            .unwrap();
        db.put(b"1", &person("alice smith", 31)).unwrap();
        db.close().unwrap();

        let db = open_db(&path);
        let info = db.indexes().unwrap();
        assert_eq!(
            info.iter()
                .map(|i| (i.column.as_str(), i.kind, i.built))
                .collect::<Vec<_>>(),
            vec![
                ("age", IndexKind::Decimal, false),
                ("name", IndexKind::Token, true),
            ]
        );
        assert_eq!(info[1].terms, 2);
    }

    #[test]
    fn test_abort_restores_indexes() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("tx.tct"));
        db.setindex("name", IndexSpec::new(IndexKind::Lexical)).unwrap();
        db.put(b"1", &person("alice", 31)).unwrap();

        db.tranbegin().unwrap();
        db.put(b"1", &person("bob", 31)).unwrap();
        db.put(b"2", &person("carol", 22)).unwrap();
        assert!(db.setindex("age", IndexSpec::new(IndexKind::Decimal)).is_err());
        db.tranabort().unwrap();

        assert_eq!(db.get(b"1").unwrap(), Some(person("alice", 31)));
        assert_eq!(db.get(b"2").unwrap(), None);
        let state = db.shared.state.read();
        let index = &state.indexes["name"];
        assert_eq!(index.equal("alice"), vec![b"1".to_vec()]);
        assert!(index.equal("bob").is_empty());
        assert!(index.equal("carol").is_empty());
    }

    #[test]
    fn test_vanish_in_transaction_is_undone() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir.path().join("vanish.tct"));
        db.setindex("name", IndexSpec::new(IndexKind::Lexical)).unwrap();
        db.put(b"1", &person("alice", 31)).unwrap();

        db.tranbegin().unwrap();
        db.vanish().unwrap();
        assert_eq!(db.rnum().unwrap(), 0);
        db.tranabort().unwrap();

        assert_eq!(db.rnum().unwrap(), 1);
        let state = db.shared.state.read();
        assert_eq!(state.indexes["name"].equal("alice"), vec![b"1".to_vec()]);
    }

    #[test]
    fn test_optimize_keeps_records_and_indexes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opt.tct");
        let db = open_db(&path);
        db.setindex("age", IndexSpec::new(IndexKind::Decimal)).unwrap();
        for i in 0..50u32 {
            db.put(i.to_string().as_bytes(), &person("p", i)).unwrap();
        }
        db.optimize(Tuning::default()).unwrap();
        assert_eq!(db.rnum().unwrap(), 50);
        assert_eq!(db.indexes().unwrap()[0].terms, 50);
        db.close().unwrap();

        let db = TableDb::new();
        db.open(&path, OpenMode::READER).unwrap();
        assert_eq!(db.get(b"7").unwrap(), Some(person("p", 7)));
        assert!(db.put(b"x", &person("q", 1)).is_err());
    }
}
