//! Record engine shared by every store kind.
//!
//! The engine owns the open file, the in-memory image and the undo
//! journal. Each mutation is logged before the image changes, so a failed
//! write leaves the store as it was.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::OpenMode;
use crate::error::{CaskError, Result};
use crate::storage::file::{FileHeader, LogRecord, RecordFile};
use crate::storage::journal::{Journal, UndoEntry};
use crate::storage::Codec;

/// In-memory image of a store: keys mapped to value chains.
///
/// Hash and table images hold one value per key; ordered images may hold
/// several.
pub trait RecordMap {
    fn chain(&self, key: &[u8]) -> Option<&[Vec<u8>]>;

    /// Replace the chain of `key`, removing the key on `None`.
    fn restore(&mut self, key: &[u8], chain: Option<Vec<Vec<u8>>>);

    fn clear(&mut self);

    fn key_count(&self) -> usize;

    /// Number of values across all chains.
    fn record_count(&self) -> u64;

    /// Visit every chain in the image's own order.
    fn for_each_chain(&self, visit: &mut dyn FnMut(&[u8], &[Vec<u8>]));

    /// Insert `value` at `index` of the chain of `key`, creating the key
    /// when `index` is 0. Returns `false` if `index` is past the chain end.
    fn insert_value(&mut self, key: &[u8], index: usize, value: Vec<u8>) -> bool {
        let mut chain = self.chain(key).map(<[Vec<u8>]>::to_vec).unwrap_or_default();
        if index > chain.len() {
            return false;
        }
        chain.insert(index, value);
        self.restore(key, Some(chain));
        true
    }

    /// Remove the value at `index`, dropping the key with its last value.
    fn remove_value(&mut self, key: &[u8], index: usize) -> Option<Vec<u8>> {
        let mut chain = self.chain(key)?.to_vec();
        if index >= chain.len() {
            return None;
        }
        let removed = chain.remove(index);
        self.restore(key, Some(chain).filter(|c| !c.is_empty()));
        Some(removed)
    }

    /// Overwrite the value at `index`, returning the old one.
    fn replace_value(&mut self, key: &[u8], index: usize, value: Vec<u8>) -> Option<Vec<u8>> {
        let mut chain = self.chain(key)?.to_vec();
        let old = std::mem::replace(chain.get_mut(index)?, value);
        self.restore(key, Some(chain));
        Some(old)
    }
}

/// Called for each key a rollback touches with the current chain and the
/// chain being restored.
pub type RestoreHook<'a> = dyn FnMut(&[u8], Option<&[Vec<u8>]>, Option<&[Vec<u8>]>) + 'a;

pub struct Engine<M> {
    file: RecordFile,
    map: M,
    meta: BTreeMap<String, Vec<u8>>,
    journal: Journal,
    dfunit: u32,
    /// Frames in the file since the last compaction.
    frames: u64,
}

impl<M: RecordMap> Engine<M> {
    /// Open the file and replay it into the image built by `make_map`
    /// from the adopted header.
    pub fn open<F>(
        path: &Path,
        mode: OpenMode,
        header: FileHeader,
        codec: Option<Arc<dyn Codec>>,
        dfunit: u32,
        make_map: F,
    ) -> Result<Self>
    where
        F: FnOnce(&FileHeader) -> Result<M>,
    {
        let (file, replay) = RecordFile::open(path, mode, header, codec)?;
        let mut map = make_map(file.header())?;
        let mut meta = BTreeMap::new();
        for record in replay.records {
            match record {
                LogRecord::Put { key, values } => map.restore(&key, Some(values)),
                LogRecord::Out { key } => map.restore(&key, None),
                LogRecord::Vanish => map.clear(),
                LogRecord::Meta { name, value: Some(value) } => {
                    meta.insert(name, value);
                }
                LogRecord::Meta { name, value: None } => {
                    meta.remove(&name);
                }
                LogRecord::Insert { key, index, value } => {
                    if !map.insert_value(&key, index as usize, value) {
                        return Err(misplaced_value(&key, index));
                    }
                }
                LogRecord::Remove { key, index } => {
                    map.remove_value(&key, index as usize)
                        .ok_or_else(|| misplaced_value(&key, index))?;
                }
                LogRecord::Replace { key, index, value } => {
                    map.replace_value(&key, index as usize, value)
                        .ok_or_else(|| misplaced_value(&key, index))?;
                }
                LogRecord::TxBegin | LogRecord::TxCommit => {}
            }
        }

        Ok(Self {
            file,
            map,
            meta,
            journal: Journal::default(),
            dfunit,
            frames: replay.frames,
        })
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    pub fn header(&self) -> &FileHeader {
        self.file.header()
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn mode(&self) -> OpenMode {
        self.file.mode()
    }

    pub fn in_transaction(&self) -> bool {
        self.journal.is_active()
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.file.mode().is_writer() {
            Ok(())
        } else {
            Err(CaskError::read_only())
        }
    }

    /// Set or remove the chain of `key`.
    pub fn store(&mut self, key: &[u8], chain: Option<Vec<Vec<u8>>>) -> Result<()> {
        self.check_writable()?;
        let chain = chain.filter(|values| !values.is_empty());
        let record = match &chain {
            Some(values) => LogRecord::Put {
                key: key.to_vec(),
                values: values.clone(),
            },
            None => LogRecord::Out { key: key.to_vec() },
        };
        self.file.append(&record)?;

        if self.journal.is_active() {
            let before = self.map.chain(key).map(<[Vec<u8>]>::to_vec);
            self.journal.record(UndoEntry::Record {
                key: key.to_vec(),
                before,
            });
        }
        self.map.restore(key, chain);
        self.frames += 1;
        self.maybe_defrag()
    }

    fn chain_len(&self, key: &[u8]) -> usize {
        self.map.chain(key).map_or(0, <[Vec<u8>]>::len)
    }

    /// Insert one value at `index` of the chain of `key`. `index` may equal
    /// the chain length to append; a missing key is created at index 0.
    /// Only the value is logged, so long chains grow the file evenly.
    pub fn insert_value(&mut self, key: &[u8], index: usize, value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        let len = self.chain_len(key);
        if index > len {
            return Err(out_of_chain(index, len));
        }
        self.file.append(&LogRecord::Insert {
            key: key.to_vec(),
            index: index as u64,
            value: value.clone(),
        })?;
        self.map.insert_value(key, index, value);
        if self.journal.is_active() {
            self.journal.record(UndoEntry::Inserted {
                key: key.to_vec(),
                index,
            });
        }
        self.frames += 1;
        self.maybe_defrag()
    }

    /// Remove the value at `index` of the chain of `key`.
    pub fn remove_value(&mut self, key: &[u8], index: usize) -> Result<()> {
        self.check_writable()?;
        let len = self.chain_len(key);
        if len == 0 {
            return Err(CaskError::not_found(key));
        }
        if index >= len {
            return Err(out_of_chain(index, len));
        }
        self.file.append(&LogRecord::Remove {
            key: key.to_vec(),
            index: index as u64,
        })?;
        let removed = self.map.remove_value(key, index);
        if let (true, Some(value)) = (self.journal.is_active(), removed) {
            self.journal.record(UndoEntry::Removed {
                key: key.to_vec(),
                index,
                value,
            });
        }
        self.frames += 1;
        self.maybe_defrag()
    }

    /// Overwrite the value at `index` of the chain of `key`.
    pub fn replace_value(&mut self, key: &[u8], index: usize, value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        let len = self.chain_len(key);
        if len == 0 {
            return Err(CaskError::not_found(key));
        }
        if index >= len {
            return Err(out_of_chain(index, len));
        }
        self.file.append(&LogRecord::Replace {
            key: key.to_vec(),
            index: index as u64,
            value: value.clone(),
        })?;
        let before = self.map.replace_value(key, index, value);
        if let (true, Some(before)) = (self.journal.is_active(), before) {
            self.journal.record(UndoEntry::Replaced {
                key: key.to_vec(),
                index,
                before,
            });
        }
        self.frames += 1;
        self.maybe_defrag()
    }

    /// Remove every record. Metadata survives.
    pub fn vanish(&mut self) -> Result<()> {
        self.check_writable()?;
        if self.journal.is_active() {
            self.file.append(&LogRecord::Vanish)?;
            let mut before = Vec::new();
            self.map.for_each_chain(&mut |key, chain| {
                before.push(UndoEntry::Record {
                    key: key.to_vec(),
                    before: Some(chain.to_vec()),
                });
            });
            for entry in before {
                self.journal.record(entry);
            }
            self.map.clear();
            self.frames += 1;
            return Ok(());
        }

        let header = *self.file.header();
        let records = self.meta_records();
        self.file.compact(header, records)?;
        self.map.clear();
        self.frames = self.meta.len() as u64;
        Ok(())
    }

    pub fn meta(&self, name: &str) -> Option<&[u8]> {
        self.meta.get(name).map(Vec::as_slice)
    }

    pub fn meta_entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.meta.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn set_meta(&mut self, name: &str, value: Option<Vec<u8>>) -> Result<()> {
        self.check_writable()?;
        self.file.append(&LogRecord::Meta {
            name: name.to_string(),
            value: value.clone(),
        })?;
        let before = match value {
            Some(value) => self.meta.insert(name.to_string(), value),
            None => self.meta.remove(name),
        };
        self.journal.record(UndoEntry::Meta {
            name: name.to_string(),
            before,
        });
        self.frames += 1;
        Ok(())
    }

    /// Set a metadata entry that outlives an aborted transaction. The
    /// frame goes straight to the file and nothing is journaled.
    pub fn set_meta_durable(&mut self, name: &str, value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        self.file.append_unbatched(&LogRecord::Meta {
            name: name.to_string(),
            value: Some(value.clone()),
        })?;
        self.meta.insert(name.to_string(), value);
        self.frames += 1;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        self.check_writable()?;
        self.journal.begin()?;
        self.file.begin_batch();
        debug!(path = %self.file.path().display(), "transaction started");
        Ok(())
    }

    /// Write the transaction batch. On failure the transaction is rolled
    /// back in memory and the write error returned.
    pub fn commit(&mut self, hook: &mut RestoreHook<'_>) -> Result<()> {
        let entries = self.journal.finish()?;
        match self.file.commit_batch() {
            Ok(frames) => {
                self.frames += frames;
                debug!(frames, "transaction committed");
                self.maybe_defrag()
            }
            Err(err) => {
                self.rollback(entries, hook);
                Err(err)
            }
        }
    }

    pub fn abort(&mut self, hook: &mut RestoreHook<'_>) -> Result<()> {
        let entries = self.journal.finish()?;
        self.file.discard_batch();
        debug!(entries = entries.len(), "transaction aborted");
        self.rollback(entries, hook);
        Ok(())
    }

    fn rollback(&mut self, entries: Vec<UndoEntry>, hook: &mut RestoreHook<'_>) {
        for entry in entries.into_iter().rev() {
            match entry {
                UndoEntry::Record { key, before } => {
                    hook(&key, self.map.chain(&key), before.as_deref());
                    self.map.restore(&key, before);
                }
                UndoEntry::Inserted { key, index } => {
                    let current = self.map.chain(&key).map(<[Vec<u8>]>::to_vec);
                    self.map.remove_value(&key, index);
                    hook(&key, current.as_deref(), self.map.chain(&key));
                }
                UndoEntry::Removed { key, index, value } => {
                    let current = self.map.chain(&key).map(<[Vec<u8>]>::to_vec);
                    self.map.insert_value(&key, index, value);
                    hook(&key, current.as_deref(), self.map.chain(&key));
                }
                UndoEntry::Replaced { key, index, before } => {
                    let current = self.map.chain(&key).map(<[Vec<u8>]>::to_vec);
                    self.map.replace_value(&key, index, before);
                    hook(&key, current.as_deref(), self.map.chain(&key));
                }
                UndoEntry::Meta { name, before } => match before {
                    Some(value) => {
                        self.meta.insert(name, value);
                    }
                    None => {
                        self.meta.remove(&name);
                    }
                },
            }
        }
    }

    /// Rewrite the file from the image, optionally with new tuning.
    pub fn compact(&mut self, header: Option<FileHeader>) -> Result<()> {
        self.check_writable()?;
        if self.journal.is_active() {
            return Err(CaskError::InvalidOperation(
                "cannot compact during a transaction".into(),
            ));
        }
        let header = header.unwrap_or(*self.file.header());
        let mut records = self.meta_records();
        self.map.for_each_chain(&mut |key, chain| {
            records.push(LogRecord::Put {
                key: key.to_vec(),
                values: chain.to_vec(),
            });
        });
        let count = records.len() as u64;
        self.file.compact(header, records)?;
        self.frames = count;
        info!(
            path = %self.file.path().display(),
            records = self.map.record_count(),
            size = self.file.size(),
            "store compacted"
        );
        Ok(())
    }

    /// Swap in a rebuilt image and rewrite the file with `header`.
    /// The previous image is kept if the rewrite fails.
    pub fn replace_image(&mut self, header: FileHeader, map: M) -> Result<()> {
        self.check_writable()?;
        if self.journal.is_active() {
            return Err(CaskError::InvalidOperation(
                "cannot optimize during a transaction".into(),
            ));
        }
        let previous = std::mem::replace(&mut self.map, map);
        if let Err(err) = self.compact(Some(header)) {
            self.map = previous;
            return Err(err);
        }
        Ok(())
    }

    fn meta_records(&self) -> Vec<LogRecord> {
        self.meta
            .iter()
            .map(|(name, value)| LogRecord::Meta {
                name: name.clone(),
                value: Some(value.clone()),
            })
            .collect()
    }

    fn maybe_defrag(&mut self) -> Result<()> {
        if self.dfunit == 0 || self.journal.is_active() {
            return Ok(());
        }
        let live = (self.map.key_count() + self.meta.len()) as u64;
        if self.frames.saturating_sub(live) >= u64::from(self.dfunit) {
            debug!(frames = self.frames, live, "automatic defragmentation");
            self.compact(None)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn copy_to(&self, dest: &Path) -> Result<()> {
        self.file.copy_to(dest)
    }

    pub fn fsiz(&self) -> u64 {
        self.file.size()
    }

    pub fn rnum(&self) -> u64 {
        self.map.record_count()
    }

    /// Abort any active transaction, then close the file.
    pub fn close(mut self, hook: &mut RestoreHook<'_>) -> Result<()> {
        if self.journal.is_active() {
            self.abort(hook)?;
        }
        self.file.close()
    }
}

fn out_of_chain(index: usize, len: usize) -> CaskError {
    CaskError::InvalidOperation(format!("value index {index} is outside a chain of {len}"))
}

fn misplaced_value(key: &[u8], index: u64) -> CaskError {
    CaskError::Corrupt(format!(
        "logged edit of value {index} does not fit the chain of {}",
        String::from_utf8_lossy(key)
    ))
}
