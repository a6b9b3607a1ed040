//! The delete ledger.
//!
//! An append-only record of local deletions, keyed by the natural key
//! snapshotted at delete time (foreign-key context may be gone afterwards).
//! Entries are written by the store's single delete choke point, never by
//! application call sites, so no deletion can slip past the ledger.

use anyhow::Result;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::{
    keys::{NaturalKey, RecordKind},
    model::Timestamp,
};

use super::tables::DELETE_LOG_TABLE;

/// One ledger entry. `sequence_id` is local and monotonic; `synced` flips
/// to true only after the remote mirror has acknowledged the delete, and a
/// synced entry is never reprocessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteEntry {
    pub sequence_id: u64,
    pub kind: RecordKind,
    /// Natural key snapshot as JSON text, e.g. `{"room_number":42}`.
    pub natural_key: String,
    pub deleted_at: Timestamp,
    pub synced: bool,
}

impl DeleteEntry {
    /// Decode the snapshotted key.
    pub fn key(&self) -> Result<NaturalKey> {
        NaturalKey::from_json(self.kind, &self.natural_key)
    }
}

/// Append an entry inside an open write transaction. Called from the delete
/// choke point only, in the same transaction that removes the row.
pub(super) fn append(
    tx: &redb::WriteTransaction,
    sequence_id: u64,
    key: &NaturalKey,
    deleted_at: Timestamp,
) -> Result<()> {
    let entry = DeleteEntry {
        sequence_id,
        kind: key.kind(),
        natural_key: key.canonical(),
        deleted_at,
        synced: false,
    };
    let bytes = serde_json::to_vec(&entry)?;
    let mut table = tx.open_table(DELETE_LOG_TABLE)?;
    table.insert(sequence_id, &bytes[..])?;
    Ok(())
}

/// All entries not yet acknowledged by the remote, in sequence order.
pub(super) fn unsynced(tx: &redb::ReadTransaction) -> Result<Vec<DeleteEntry>> {
    let table = tx.open_table(DELETE_LOG_TABLE)?;
    let mut entries = Vec::new();
    for item in table.iter()? {
        let (_, value) = item?;
        let entry: DeleteEntry = serde_json::from_slice(value.value())?;
        if !entry.synced {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Mark the given entries as acknowledged. Terminal: the push path never
/// looks at them again.
pub(super) fn mark_synced(tx: &redb::WriteTransaction, sequence_ids: &[u64]) -> Result<()> {
    let mut table = tx.open_table(DELETE_LOG_TABLE)?;
    for id in sequence_ids {
        let entry = match table.get(id)? {
            Some(value) => {
                let mut entry: DeleteEntry = serde_json::from_slice(value.value())?;
                entry.synced = true;
                Some(serde_json::to_vec(&entry)?)
            }
            None => None,
        };
        if let Some(bytes) = entry {
            table.insert(id, &bytes[..])?;
        }
    }
    Ok(())
}

/// All ledger entries, newest last. Used by tests and debugging tools.
pub(super) fn all(tx: &redb::ReadTransaction) -> Result<Vec<DeleteEntry>> {
    let table = tx.open_table(DELETE_LOG_TABLE)?;
    let mut entries = Vec::new();
    for item in table.iter()? {
        let (_, value) = item?;
        entries.push(serde_json::from_slice(value.value())?);
    }
    Ok(entries)
}
