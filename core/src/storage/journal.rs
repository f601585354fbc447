//! Undo journal and transaction admission.

use parking_lot::{Condvar, Mutex};

use crate::error::{CaskError, Result};

/// Before-image of one mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoEntry {
    /// Value chain of `key` before the change, `None` if it was absent.
    Record {
        key: Vec<u8>,
        before: Option<Vec<Vec<u8>>>,
    },
    /// A value inserted at `index` of the chain of `key`.
    Inserted { key: Vec<u8>, index: usize },
    /// A value removed from `index`.
    Removed {
        key: Vec<u8>,
        index: usize,
        value: Vec<u8>,
    },
    /// The value at `index` before it was overwritten.
    Replaced {
        key: Vec<u8>,
        index: usize,
        before: Vec<u8>,
    },
    Meta {
        name: String,
        before: Option<Vec<u8>>,
    },
}

/// Before-images recorded during the active transaction.
#[derive(Debug, Default)]
pub struct Journal {
    active: bool,
    entries: Vec<UndoEntry>,
}

impl Journal {
    pub fn begin(&mut self) -> Result<()> {
        if self.active {
            return Err(CaskError::Transaction("transaction already active".into()));
        }
        self.active = true;
        self.entries.clear();
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Record a before-image. Ignored outside a transaction.
    pub fn record(&mut self, entry: UndoEntry) {
        if self.active {
            self.entries.push(entry);
        }
    }

    /// End the transaction and hand back its entries, oldest first.
    pub fn finish(&mut self) -> Result<Vec<UndoEntry>> {
        if !self.active {
            return Err(CaskError::Transaction("no active transaction".into()));
        }
        self.active = false;
        Ok(std::mem::take(&mut self.entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Admits one transaction at a time per store.
///
/// Lives outside the store's state lock so a waiting `tranbegin` does not
/// block other readers and writers.
#[derive(Debug, Default)]
pub struct TxGate {
    busy: Mutex<bool>,
    released: Condvar,
}

impl TxGate {
    /// Claim the gate. With `wait` the call blocks until the running
    /// transaction ends; otherwise it fails immediately.
    pub fn acquire(&self, wait: bool) -> Result<()> {
        let mut busy = self.busy.lock();
        while *busy {
            if !wait {
                return Err(CaskError::Transaction(
                    "another transaction is active".into(),
                ));
            }
            self.released.wait(&mut busy);
        }
        *busy = true;
        Ok(())
    }

    pub fn release(&self) {
        let mut busy = self.busy.lock();
        *busy = false;
        self.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_journal_lifecycle() {
        let mut journal = Journal::default();
        journal.record(UndoEntry::Meta {
            name: "ignored".into(),
            before: None,
        });
        assert_eq!(journal.len(), 0);

        journal.begin().unwrap();
        assert!(journal.begin().is_err());
        journal.record(UndoEntry::Record {
            key: b"k".to_vec(),
            before: Some(vec![b"v".to_vec()]),
        });
        let entries = journal.finish().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!journal.is_active());
        assert!(journal.finish().is_err());
    }

    #[test]
    fn test_gate_fails_fast_without_wait() {
        let gate = TxGate::default();
        gate.acquire(false).unwrap();
        let err = gate.acquire(false).unwrap_err();
        assert_eq!(err.kind(), "transaction_error");
        gate.release();
        gate.acquire(false).unwrap();
    }

    #[test]
    fn test_gate_blocks_until_release() {
        let gate = Arc::new(TxGate::default());
        gate.acquire(true).unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.acquire(true).unwrap();
                gate.release();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        gate.release();
        waiter.join().unwrap();
    }
}
