//! Restartable snapshots of pending records.

use ocuscan_common::{EntityKind, Record, RecordId, Result};

use crate::store::LocalStore;

/// Pending records of one kind, captured by id in push order.
///
/// Records are loaded one at a time during iteration. Iterating again starts
/// over from the first id.
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    kind: EntityKind,
    ids: Vec<RecordId>,
    store: LocalStore,
}

impl PendingSnapshot {
    pub(crate) fn new(kind: EntityKind, ids: Vec<RecordId>, store: LocalStore) -> Self {
        Self { kind, ids, store }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> PendingIter<'_> {
        PendingIter {
            snapshot: self,
            pos: 0,
        }
    }
}

impl<'a> IntoIterator for &'a PendingSnapshot {
    type Item = Result<Record>;
    type IntoIter = PendingIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator loading each snapshot record on demand.
pub struct PendingIter<'a> {
    snapshot: &'a PendingSnapshot,
    pos: usize,
}

impl Iterator for PendingIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = *self.snapshot.ids.get(self.pos)?;
        self.pos += 1;
        Some(self.snapshot.store.get_record(self.snapshot.kind, id))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.snapshot.ids.len() - self.pos;
        (remaining, Some(remaining))
    }
}
