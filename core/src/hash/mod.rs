//! Unordered key/value store.

mod buckets;

pub use buckets::{BucketMap, Position};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{HashOptions, OpenMode, Tuning, check_bucket_count};
use crate::error::{CaskError, Result};
use crate::storage::{Codec, Engine, FileHeader, StoreKind, TxGate};

/// Hash database: one value per key, constant-time point operations.
///
/// Iteration order is bucket order, then insertion order within a bucket.
pub struct HashDb {
    state: RwLock<HashState>,
    gate: TxGate,
}

struct HashState {
    options: HashOptions,
    engine: Option<Engine<BucketMap>>,
}

impl HashState {
    fn engine(&self) -> Result<&Engine<BucketMap>> {
        self.engine.as_ref().ok_or(CaskError::NotOpen)
    }

    fn engine_mut(&mut self) -> Result<&mut Engine<BucketMap>> {
        self.engine.as_mut().ok_or(CaskError::NotOpen)
    }

    fn options_mut(&mut self) -> Result<&mut HashOptions> {
        if self.engine.is_some() {
            return Err(CaskError::InvalidOperation(
                "configuration cannot change while the database is open".into(),
            ));
        }
        Ok(&mut self.options)
    }
}

impl Default for HashDb {
    fn default() -> Self {
        Self::new()
    }
}

impl HashDb {
    pub fn new() -> Self {
        Self::with_options(HashOptions::default())
    }

    pub fn with_options(options: HashOptions) -> Self {
        Self {
            state: RwLock::new(HashState {
                options,
                engine: None,
            }),
            gate: TxGate::default(),
        }
    }

    /// Make `tranbegin` wait for a running transaction instead of failing.
    pub fn setmutex(&self) -> Result<()> {
        self.state.write().options_mut()?.storage.mutex = true;
        Ok(())
    }

    pub fn tune(&self, tuning: Tuning) -> Result<()> {
        let mut state = self.state.write();
        let options = state.options_mut()?;
        if tuning.bucket_count > 0 {
            options.bucket_count = check_bucket_count(tuning.bucket_count)?;
        }
        tuning.apply_storage(&mut options.storage);
        Ok(())
    }

    pub fn setcache(&self, record_cache: usize) -> Result<()> {
        self.state.write().options_mut()?.record_cache = record_cache;
        Ok(())
    }

    pub fn setxmsize(&self, xmsize: u64) -> Result<()> {
        self.state.write().options_mut()?.storage.xmsize = xmsize;
        Ok(())
    }

    pub fn setdfunit(&self, dfunit: u32) -> Result<()> {
        self.state.write().options_mut()?.storage.dfunit = dfunit;
        Ok(())
    }

    pub fn setcodec(&self, codec: Arc<dyn Codec>) -> Result<()> {
        self.state.write().options_mut()?.storage.codec = Some(codec);
        Ok(())
    }

    pub fn open(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<()> {
        let path = path.as_ref();
        let mut state = self.state.write();
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
            ..FileHeader::new(StoreKind::Hash)
        };
        let engine = Engine::open(
            path,
            mode,
            header,
            options.storage.codec.clone(),
            options.storage.dfunit,
            |header| Ok(BucketMap::new(check_bucket_count(header.bucket_count)?)),
        )?;
        debug!(path = %path.display(), records = engine.rnum(), "hash database opened");
        state.engine = Some(engine);
        Ok(())
    }

    /// Close the database. An active transaction is aborted.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        let engine = state.engine.take().ok_or(CaskError::NotOpen)?;
        let in_transaction = engine.in_transaction();
        let result = engine.close(&mut |_, _, _| {});
        if in_transaction {
            self.gate.release();
        }
        result
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        state.engine_mut()?.store(key, Some(vec![value.to_vec()]))
    }

    /// Store only if `key` is absent. Returns `false` if it already exists.
    pub fn putkeep(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut state = self.state.write();
        let engine = state.engine_mut()?;
        if engine.map().contains(key) {
            return Ok(false);
        }
        engine.store(key, Some(vec![value.to_vec()]))?;
        Ok(true)
    }

    /// Append `value` to the existing value, or create the record.
    pub fn putcat(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let engine = state.engine_mut()?;
        let mut joined = engine.map().get(key).cloned().unwrap_or_default();
        joined.extend_from_slice(value);
        engine.store(key, Some(vec![joined]))
    }

    pub fn out(&self, key: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let engine = state.engine_mut()?;
        if !engine.map().contains(key) {
            return Err(CaskError::not_found(key));
        }
        engine.store(key, None)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        Ok(state.engine()?.map().get(key).cloned())
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let state = self.state.read();
        Ok(state.engine()?.map().contains(key))
    }

    pub fn vsiz(&self, key: &[u8]) -> Result<Option<usize>> {
        let state = self.state.read();
        Ok(state.engine()?.map().get(key).map(Vec::len))
    }

    /// Keys starting with `prefix`, in iteration order.
    pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        let state = self.state.read();
        Ok(state
            .engine()?
            .map()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .take(max.unwrap_or(usize::MAX))
            .map(<[u8]>::to_vec)
            .collect())
    }

    /// Snapshot of every key in iteration order.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let state = self.state.read();
        Ok(state.engine()?.map().keys().map(<[u8]>::to_vec).collect())
    }

    /// Add to a 4-byte integer record. A missing record starts at zero.
    pub fn addint(&self, key: &[u8], delta: i32) -> Result<i32> {
        let mut state = self.state.write();
        let engine = state.engine_mut()?;
        let sum = add_int(engine.map().get(key).map(Vec::as_slice), delta)?;
        engine.store(key, Some(vec![sum.to_le_bytes().to_vec()]))?;
        Ok(sum)
    }

    /// Add to an 8-byte float record. A missing record starts at zero.
    pub fn adddouble(&self, key: &[u8], delta: f64) -> Result<f64> {
        let mut state = self.state.write();
        let engine = state.engine_mut()?;
        let sum = add_double(engine.map().get(key).map(Vec::as_slice), delta)?;
        engine.store(key, Some(vec![sum.to_le_bytes().to_vec()]))?;
        Ok(sum)
    }

    pub fn sync(&self) -> Result<()> {
        self.state.read().engine()?.sync()
    }

    /// Rebuild the file with new tuning. A zero bucket count is derived
    /// from the record count.
    pub fn optimize(&self, tuning: Tuning) -> Result<()> {
        let mut state = self.state.write();
        let codec = state.options.storage.codec.clone();
        let engine = state.engine_mut()?;
        engine.check_writable()?;

        let mut header = *engine.header();
        header.bucket_count = tuning.rebuild_buckets(engine.rnum(), header.bucket_count)?;
        apply_tuning(&mut header, &tuning);
        if header.opts.compressed() && codec.is_none() {
            return Err(CaskError::Config("compression option requires a codec".into()));
        }

        let mut map = BucketMap::new(header.bucket_count);
        for (key, value) in engine.map().iter() {
            map.insert(key, value.to_vec());
        }
        engine.replace_image(header, map)?;
        info!(
            buckets = header.bucket_count,
            records = engine.rnum(),
            "hash database optimized"
        );
        Ok(())
    }

    /// Remove every record.
    pub fn vanish(&self) -> Result<()> {
        self.state.write().engine_mut()?.vanish()
    }

    /// Copy the committed database file to `dest`.
    pub fn copy(&self, dest: impl AsRef<Path>) -> Result<()> {
        let state = self.state.read();
        let engine = state.engine()?;
        check_copy_target(engine.path(), dest.as_ref())?;
        engine.copy_to(dest.as_ref())
    }

    pub fn rnum(&self) -> Result<u64> {
        Ok(self.state.read().engine()?.rnum())
    }

    pub fn fsiz(&self) -> Result<u64> {
        Ok(self.state.read().engine()?.fsiz())
    }

    /// Path of the open file, `None` when closed.
    pub fn path(&self) -> Option<PathBuf> {
        let state = self.state.read();
        state.engine.as_ref().map(|e| e.path().to_path_buf())
    }

    pub fn tranbegin(&self) -> Result<()> {
        let wait = {
            let state = self.state.read();
            state.engine()?.check_writable()?;
            state.options.storage.mutex
        };
        self.gate.acquire(wait)?;
        let begun = self.state.write().engine_mut().and_then(Engine::begin);
        if begun.is_err() {
            self.gate.release();
        }
        begun
    }

    pub fn trancommit(&self) -> Result<()> {
        let mut state = self.state.write();
        let engine = active_transaction(state.engine_mut()?)?;
        let result = engine.commit(&mut |_, _, _| {});
        self.gate.release();
        result
    }

    pub fn tranabort(&self) -> Result<()> {
        let mut state = self.state.write();
        let engine = active_transaction(state.engine_mut()?)?;
        let result = engine.abort(&mut |_, _, _| {});
        self.gate.release();
        result
    }
}

pub(crate) fn active_transaction<M: crate::storage::RecordMap>(
    engine: &mut Engine<M>,
) -> Result<&mut Engine<M>> {
    if engine.in_transaction() {
        Ok(engine)
    } else {
        Err(CaskError::Transaction("no active transaction".into()))
    }
}

pub(crate) fn apply_tuning(header: &mut FileHeader, tuning: &Tuning) {
    if let Some(apow) = tuning.alignment_power {
        header.alignment_power = apow;
    }
    if let Some(fpow) = tuning.free_pool_power {
        header.free_pool_power = fpow;
    }
    if let Some(opts) = tuning.opts {
        header.opts = opts;
    }
}

pub(crate) fn check_copy_target(source: &Path, dest: &Path) -> Result<()> {
    if source == dest {
        return Err(CaskError::InvalidOperation(
            "cannot copy a database onto itself".into(),
        ));
    }
    Ok(())
}

/// Sum of a stored 4-byte little-endian integer and `delta`.
pub(crate) fn add_int(current: Option<&[u8]>, delta: i32) -> Result<i32> {
    match current {
        None => Ok(delta),
        Some(bytes) => {
            let raw: [u8; 4] = bytes.try_into().map_err(|_| CaskError::TypeError {
                expected: "4-byte integer".into(),
                actual: format!("{} bytes", bytes.len()),
            })?;
            Ok(i32::from_le_bytes(raw).wrapping_add(delta))
        }
    }
}

/// Sum of a stored 8-byte little-endian double and `delta`.
pub(crate) fn add_double(current: Option<&[u8]>, delta: f64) -> Result<f64> {
    match current {
        None => Ok(delta),
        Some(bytes) => {
            let raw: [u8; 8] = bytes.try_into().map_err(|_| CaskError::TypeError {
                expected: "8-byte double".into(),
                actual: format!("{} bytes", bytes.len()),
            })?;
            Ok(f64::from_le_bytes(raw) + delta)
        }
    }
}
