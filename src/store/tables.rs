//! redb table definitions and the stored-row envelope.

use anyhow::{Context, Result};
use redb::TableDefinition;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::model::Timestamp;

// Entities
// Key: (name, entity_type)
// Value: Stored<Entity> as JSON
pub const ENTITIES_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("entities-1");

// Rooms
// Key: room_number
// Value: Stored<Room> as JSON
pub const ROOMS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("rooms-1");

// Exits
// Key: (from_room_number, raw direction value)
// Value: Stored<RoomExit> as JSON
pub const EXITS_TABLE: TableDefinition<(u64, &str), &[u8]> = TableDefinition::new("exits-1");

// NPCs
// Key: owning entity name
// Value: Stored<Npc> as JSON
pub const NPCS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("npcs-1");

// Observations
// Key: (entity_name, entity_type, observation_type, text)
// Value: Stored<Observation> as JSON
pub const OBSERVATIONS_TABLE: TableDefinition<(&str, &str, &str, &str), &[u8]> =
    TableDefinition::new("observations-1");

// Relations
// Key: (from_name, from_type, to_name, to_type, relation_type)
// Value: Stored<Relation> as JSON
pub const RELATIONS_TABLE: TableDefinition<(&str, &str, &str, &str, &str), &[u8]> =
    TableDefinition::new("relations-1");

// Delete ledger
// Key: local monotonic sequence id
// Value: DeleteEntry as JSON
pub const DELETE_LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("delete-log-1");

// Durable counters: local sequence, push/pull/delete checkpoints.
pub const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta-1");

/// Meta key of the local monotonic sequence counter.
pub const META_LOCAL_SEQ: &str = "local_seq";
/// Meta key of the last-pulled remote mutation sequence.
pub const META_PULL_CHECKPOINT: &str = "pull";
/// Meta key of the last remote delete-log id applied locally.
pub const META_DELETES_APPLIED: &str = "deletes_applied";
/// Meta key of the local sequence recorded when the applied-delete
/// checkpoint last advanced; rows created after it are newer than any
/// delete pulled so far.
pub const META_DELETES_APPLIED_LOCAL_SEQ: &str = "deletes_applied_local_seq";

/// Sync bookkeeping carried by every stored row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMeta {
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Local sequence at creation time.
    pub created_seq: u64,
    /// Local sequence of the last local write; 0 means clean (pulled from
    /// the remote and not locally modified since).
    pub updated_seq: u64,
    /// Remote mutation sequence last seen for this row, if it has ever been
    /// pushed or pulled.
    pub remote_seq: Option<u64>,
}

/// The on-disk envelope: a typed row plus its sync bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stored<T> {
    pub meta: RowMeta,
    pub row: T,
}

pub fn encode<T: Serialize>(stored: &Stored<T>) -> Result<Vec<u8>> {
    serde_json::to_vec(stored).context("failed to encode row")
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Stored<T>> {
    serde_json::from_slice(bytes).context("failed to decode row")
}
