//! Cursor over the values of an ordered store.
//!
//! A cursor sits on one value of one key's chain. It does not own the
//! store: it holds a weak handle plus the open generation, and reports
//! `NotOpen` once the store is closed or dropped.

use std::sync::{Arc, Weak};

use crate::btree::tree::{OrderedTree, Pos};
use crate::btree::BTreeShared;
use crate::error::{CaskError, Result};

/// Where [`Cursor::put`] places the new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPut {
    /// Overwrite the value under the cursor.
    Current,
    /// Insert before it in the chain.
    Before,
    /// Insert after it in the chain.
    After,
}

#[derive(Debug, Clone)]
struct Place {
    pos: Pos,
    key: Vec<u8>,
    vidx: usize,
    /// Tree stamp when `pos` was taken.
    stamp: u64,
}

pub struct Cursor {
    db: Weak<BTreeShared>,
    generation: u64,
    place: Option<Place>,
}

fn unset() -> CaskError {
    CaskError::NotFound("cursor is not positioned on a record".into())
}

impl Cursor {
    pub(crate) fn new(db: Weak<BTreeShared>, generation: u64) -> Self {
        Self {
            db,
            generation,
            place: None,
        }
    }

    fn shared(&self) -> Result<Arc<BTreeShared>> {
        self.db.upgrade().ok_or(CaskError::NotOpen)
    }

    /// True while the cursor sits on a value. It may still turn out stale
    /// on the next operation.
    pub fn is_set(&self) -> bool {
        self.place.is_some()
    }

    fn settle(&mut self, tree: &OrderedTree, pos: Option<Pos>, last_value: bool) -> bool {
        self.place = pos.map(|pos| {
            let (key, values) = tree.record(pos);
            Place {
                pos,
                key: key.to_vec(),
                vidx: if last_value { values.len() - 1 } else { 0 },
                stamp: tree.stamp(),
            }
        });
        self.place.is_some()
    }

    /// Current position, re-located by key if the tree changed since it was
    /// taken. The cursor is unset if its value no longer exists.
    fn resolve(&mut self, tree: &OrderedTree) -> Result<(Pos, usize)> {
        let place = self.place.as_mut().ok_or_else(unset)?;
        if place.stamp != tree.stamp() {
            match tree.find(&place.key) {
                Some(pos) if place.vidx < tree.record(pos).1.len() => {
                    place.pos = pos;
                    place.stamp = tree.stamp();
                }
                _ => {
                    self.place = None;
                    return Err(unset());
                }
            }
        }
        Ok((place.pos, place.vidx))
    }

    /// Move to the first value of the first key. `false` if the store is
    /// empty.
    pub fn first(&mut self) -> Result<bool> {
        let shared = self.shared()?;
        let state = shared.state.read();
        let tree = state.engine_at(self.generation)?.map();
        Ok(self.settle(tree, tree.first(), false))
    }

    /// Move to the last value of the last key.
    pub fn last(&mut self) -> Result<bool> {
        let shared = self.shared()?;
        let state = shared.state.read();
        let tree = state.engine_at(self.generation)?.map();
        Ok(self.settle(tree, tree.last(), true))
    }

    /// Move to the first value of the first key `>= key`.
    pub fn jump(&mut self, key: &[u8]) -> Result<bool> {
        let shared = self.shared()?;
        let state = shared.state.read();
        let tree = state.engine_at(self.generation)?.map();
        Ok(self.settle(tree, tree.seek(key), false))
    }

    /// Move to the last value of the last key `<= key`.
    pub fn jump_back(&mut self, key: &[u8]) -> Result<bool> {
        let shared = self.shared()?;
        let state = shared.state.read();
        let tree = state.engine_at(self.generation)?.map();
        Ok(self.settle(tree, tree.seek_back(key), true))
    }

    /// Step to the next value. `false` once past the end, leaving the
    /// cursor unset.
    pub fn next(&mut self) -> Result<bool> {
        let shared = self.shared()?;
        let state = shared.state.read();
        let tree = state.engine_at(self.generation)?.map();
        let (pos, vidx) = self.resolve(tree)?;
        if vidx + 1 < tree.record(pos).1.len() {
            if let Some(place) = self.place.as_mut() {
                place.vidx += 1;
            }
            return Ok(true);
        }
        Ok(self.settle(tree, tree.next(pos), false))
    }

    pub fn prev(&mut self) -> Result<bool> {
        let shared = self.shared()?;
        let state = shared.state.read();
        let tree = state.engine_at(self.generation)?.map();
        let (pos, vidx) = self.resolve(tree)?;
        if vidx > 0 {
            if let Some(place) = self.place.as_mut() {
                place.vidx -= 1;
            }
            return Ok(true);
        }
        Ok(self.settle(tree, tree.prev(pos), true))
    }

    pub fn key(&mut self) -> Result<Vec<u8>> {
        Ok(self.record()?.0)
    }

    pub fn value(&mut self) -> Result<Vec<u8>> {
        Ok(self.record()?.1)
    }

    /// Key and value under the cursor.
    pub fn record(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let shared = self.shared()?;
        let state = shared.state.read();
        let tree = state.engine_at(self.generation)?.map();
        let (pos, vidx) = self.resolve(tree)?;
        let (key, values) = tree.record(pos);
        Ok((key.to_vec(), values[vidx].clone()))
    }

    /// Write `value` relative to the cursor. The cursor ends on the
    /// written value.
    pub fn put(&mut self, value: &[u8], mode: CursorPut) -> Result<()> {
        let shared = self.shared()?;
        let mut state = shared.state.write();
        let engine = state.engine_at_mut(self.generation)?;
        let (pos, vidx) = self.resolve(engine.map())?;

        let key = engine.map().record(pos).0.to_vec();
        let target = match mode {
            CursorPut::Current => {
                engine.replace_value(&key, vidx, value.to_vec())?;
                vidx
            }
            CursorPut::Before => {
                engine.insert_value(&key, vidx, value.to_vec())?;
                vidx
            }
            CursorPut::After => {
                engine.insert_value(&key, vidx + 1, value.to_vec())?;
                vidx + 1
            }
        };

        let tree = engine.map();
        let stamp = tree.stamp();
        self.place = tree.find(&key).map(|pos| Place {
            pos,
            key,
            vidx: target,
            stamp,
        });
        Ok(())
    }

    /// Remove the value under the cursor and move to the value after it.
    pub fn out(&mut self) -> Result<()> {
        let shared = self.shared()?;
        let mut state = shared.state.write();
        let engine = state.engine_at_mut(self.generation)?;
        let (pos, vidx) = self.resolve(engine.map())?;

        let key = engine.map().record(pos).0.to_vec();
        engine.remove_value(&key, vidx)?;

        let tree = engine.map();
        match tree.find(&key) {
            Some(pos) if vidx < tree.record(pos).1.len() => {
                self.place = Some(Place {
                    pos,
                    key,
                    vidx,
                    stamp: tree.stamp(),
                });
            }
            Some(pos) => {
                self.settle(tree, tree.next(pos), false);
            }
            None => {
                self.settle(tree, tree.seek(&key), false);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BTreeDb;
    use crate::config::{BTreeOptions, OpenMode};
    use pretty_assertions::assert_eq;
    use tempfile::{TempDir, tempdir};

    fn fixture() -> (TempDir, BTreeDb) {
        let dir = tempdir().unwrap();
        let db = BTreeDb::with_options(BTreeOptions::default().with_members(4, 4));
        db.open(dir.path().join("cursor.tcb"), OpenMode::WRITER | OpenMode::CREATE)
            .unwrap();
        (dir, db)
    }

    fn collect_forward(cursor: &mut Cursor) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut seen = Vec::new();
        if cursor.first().unwrap() {
            loop {
                seen.push(cursor.record().unwrap());
                if !cursor.next().unwrap() {
                    break;
                }
            }
        }
        seen
    }

    fn pair(key: &str, value: &str) -> (Vec<u8>, Vec<u8>) {
        (key.as_bytes().to_vec(), value.as_bytes().to_vec())
    }

    #[test]
    fn test_forward_and_backward_traversal() {
        let (_dir, db) = fixture();
        for i in (0..50).rev() {
            db.put(format!("{i:03}").as_bytes(), b"v").unwrap();
        }
        db.putdup(b"010", b"w").unwrap();

        let mut cursor = db.cursor().unwrap();
        let seen = collect_forward(&mut cursor);
        assert_eq!(seen.len(), 51);
        assert_eq!(seen[10], pair("010", "v"));
        assert_eq!(seen[11], pair("010", "w"));
        assert!(!cursor.is_set());
        assert!(cursor.key().unwrap_err().is_not_found());

        assert!(cursor.last().unwrap());
        assert_eq!(cursor.key().unwrap(), b"049".to_vec());
        let mut count = 1;
        while cursor.prev().unwrap() {
            count += 1;
        }
        assert_eq!(count, 51);
    }

    #[test]
    fn test_jump_positions() {
        let (_dir, db) = fixture();
        for key in ["b", "d", "f"] {
            db.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
        db.putdup(b"b", b"b2").unwrap();

        let mut cursor = db.cursor().unwrap();
        assert!(cursor.jump(b"c").unwrap());
        assert_eq!(cursor.key().unwrap(), b"d".to_vec());
        assert!(cursor.jump_back(b"c").unwrap());
        assert_eq!(cursor.record().unwrap(), pair("b", "b2"));
        assert!(!cursor.jump(b"g").unwrap());
        assert!(!cursor.jump_back(b"a").unwrap());
    }

    #[test]
    fn test_put_placements() {
        let (_dir, db) = fixture();
        db.put(b"k", b"middle").unwrap();
        let mut cursor = db.cursor().unwrap();
        cursor.first().unwrap();

        cursor.put(b"before", CursorPut::Before).unwrap();
        assert_eq!(cursor.value().unwrap(), b"before".to_vec());
        cursor.next().unwrap();
        cursor.put(b"after", CursorPut::After).unwrap();
        assert_eq!(cursor.value().unwrap(), b"after".to_vec());
        cursor.put(b"last", CursorPut::Current).unwrap();

        assert_eq!(
            db.getdup(b"k").unwrap(),
            vec![b"before".to_vec(), b"middle".to_vec(), b"last".to_vec()]
        );
    }

    #[test]
    fn test_out_advances() {
        let (_dir, db) = fixture();
        db.putdup(b"a", b"1").unwrap();
        db.putdup(b"a", b"2").unwrap();
        db.put(b"b", b"3").unwrap();

        let mut cursor = db.cursor().unwrap();
        cursor.first().unwrap();
        cursor.out().unwrap();
        assert_eq!(cursor.record().unwrap(), pair("a", "2"));
        cursor.out().unwrap();
        assert_eq!(cursor.record().unwrap(), pair("b", "3"));
        cursor.out().unwrap();
        assert!(!cursor.is_set());
        assert_eq!(db.rnum().unwrap(), 0);
        assert!(cursor.out().unwrap_err().is_not_found());
    }

    #[test]
    fn test_external_removal_unsets_cursor() {
        let (_dir, db) = fixture();
        db.put(b"a", b"1").unwrap();
        db.put(b"b", b"2").unwrap();
        let mut cursor = db.cursor().unwrap();
        cursor.jump(b"b").unwrap();

        // Unrelated writes keep the cursor on its record.
        db.put(b"c", b"3").unwrap();
        assert_eq!(cursor.key().unwrap(), b"b".to_vec());

        db.out(b"b").unwrap();
        assert!(cursor.value().unwrap_err().is_not_found());
        assert!(!cursor.is_set());
    }

    #[test]
    fn test_close_invalidates_cursor() {
        let (dir, db) = fixture();
        db.put(b"a", b"1").unwrap();
        let mut cursor = db.cursor().unwrap();
        cursor.first().unwrap();
        db.close().unwrap();
        assert_eq!(cursor.key().unwrap_err(), CaskError::NotOpen);

        db.open(dir.path().join("cursor.tcb"), OpenMode::WRITER).unwrap();
        assert_eq!(cursor.first().unwrap_err(), CaskError::NotOpen);
        drop(db);
        assert_eq!(cursor.first().unwrap_err(), CaskError::NotOpen);
    }
}
