//! The local world graph store.
//!
//! Rows live in redb keyed directly by natural key, so a row's identity is
//! portable by construction and local handles never leak to other peers.
//! Every operation uses its own short write transaction; gameplay writes
//! never wait on sync network I/O, only on the next free write slot.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, WriteTransaction, backends::InMemoryBackend};
use tracing::{debug, info, warn};

use crate::{
    keys::{NaturalKey, RecordKind},
    model::{
        Direction, Entity, EntityType, ExitDetails, Npc, Observation, Relation, Room,
        RoomExit, RoomObservation, now_micros,
    },
};

mod delete_log;
mod tables;

pub use delete_log::DeleteEntry;
pub(crate) use tables::{RowMeta, Stored};

use tables::{
    DELETE_LOG_TABLE, ENTITIES_TABLE, EXITS_TABLE, META_DELETES_APPLIED,
    META_DELETES_APPLIED_LOCAL_SEQ, META_LOCAL_SEQ, META_PULL_CHECKPOINT, META_TABLE,
    NPCS_TABLE, OBSERVATIONS_TABLE, RELATIONS_TABLE, ROOMS_TABLE, decode, encode,
};

/// Result of [`GraphStore::record_exit_success`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRecordOutcome {
    /// The command sequence was persisted onto the edge.
    Recorded,
    /// The edge already carries recorded details; nothing changed.
    AlreadyKnown,
    /// Another edge in the zone already uses this exact raw command.
    CollisionRejected,
    /// The origin room is not in the graph yet.
    UnknownOrigin,
}

/// Result of applying one pulled remote row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyOutcome {
    Applied,
    /// A parent referenced by the row could not be located locally.
    Skipped,
}

/// One locally-changed row enumerated for push.
#[derive(Debug, Clone)]
pub(crate) struct PushRow {
    pub key: NaturalKey,
    pub row: serde_json::Value,
    /// Local sequence of the change; the push checkpoint advances to the
    /// maximum of these after a successful phase.
    pub local_seq: u64,
}

/// Where a row write comes from; decides how sync bookkeeping is stamped.
#[derive(Debug, Clone, Copy)]
enum WriteSource {
    Local,
    Remote { remote_seq: u64 },
}

/// The store. Cheap to clone; all clones share one database.
#[derive(Debug, Clone)]
pub struct GraphStore {
    db: Arc<Database>,
}

impl GraphStore {
    /// Open or create a persistent store.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading world graph from {}", path.to_string_lossy());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create data directory at {}", parent.to_string_lossy())
            })?;
        }
        let db = Database::builder()
            .create(path)
            .context("failed to open world graph database")?;
        Self::open(db)
    }

    /// Create an in-memory store.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self> {
        let tx = db.begin_write()?;
        {
            let _ = tx.open_table(ENTITIES_TABLE)?;
            let _ = tx.open_table(ROOMS_TABLE)?;
            let _ = tx.open_table(EXITS_TABLE)?;
            let _ = tx.open_table(NPCS_TABLE)?;
            let _ = tx.open_table(OBSERVATIONS_TABLE)?;
            let _ = tx.open_table(RELATIONS_TABLE)?;
            let _ = tx.open_table(DELETE_LOG_TABLE)?;
            let _ = tx.open_table(META_TABLE)?;
        }
        tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    // --- sequence counter and checkpoints ---

    fn next_seq(tx: &WriteTransaction) -> Result<u64> {
        let mut table = tx.open_table(META_TABLE)?;
        let next = table.get(META_LOCAL_SEQ)?.map(|g| g.value()).unwrap_or(0) + 1;
        table.insert(META_LOCAL_SEQ, next)?;
        Ok(next)
    }

    /// Current value of the local sequence counter.
    pub(crate) fn local_seq(&self) -> Result<u64> {
        self.checkpoint(META_LOCAL_SEQ)
    }

    /// Read a durable counter; missing counters read as 0.
    pub(crate) fn checkpoint(&self, name: &str) -> Result<u64> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(META_TABLE)?;
        Ok(table.get(name)?.map(|g| g.value()).unwrap_or(0))
    }

    /// Atomically update a batch of durable counters. Called only after a
    /// fully successful push or pull phase.
    pub(crate) fn set_checkpoints(&self, updates: &[(String, u64)]) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(META_TABLE)?;
            for (name, value) in updates {
                table.insert(name.as_str(), *value)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Meta key of the push checkpoint for one row kind.
    pub(crate) fn push_checkpoint_key(kind: RecordKind) -> String {
        format!("push:{kind}")
    }

    pub(crate) fn pull_checkpoint_key() -> &'static str {
        META_PULL_CHECKPOINT
    }

    pub(crate) fn deletes_applied_key() -> &'static str {
        META_DELETES_APPLIED
    }

    fn stamp(
        tx: &WriteTransaction,
        existing: Option<&RowMeta>,
        source: WriteSource,
    ) -> Result<RowMeta> {
        let now = now_micros();
        let meta = match (existing, source) {
            (Some(old), WriteSource::Local) => RowMeta {
                created_at: old.created_at,
                created_seq: old.created_seq,
                updated_at: now,
                updated_seq: Self::next_seq(tx)?,
                remote_seq: old.remote_seq,
            },
            (None, WriteSource::Local) => {
                let seq = Self::next_seq(tx)?;
                RowMeta {
                    created_at: now,
                    created_seq: seq,
                    updated_at: now,
                    updated_seq: seq,
                    remote_seq: None,
                }
            }
            (Some(old), WriteSource::Remote { remote_seq }) => RowMeta {
                created_at: old.created_at,
                created_seq: old.created_seq,
                updated_at: now,
                // clean: a pulled row must not be echoed back on the next push
                updated_seq: 0,
                remote_seq: Some(remote_seq),
            },
            (None, WriteSource::Remote { remote_seq }) => RowMeta {
                created_at: now,
                created_seq: Self::next_seq(tx)?,
                updated_at: now,
                updated_seq: 0,
                remote_seq: Some(remote_seq),
            },
        };
        Ok(meta)
    }

    // --- entities ---

    fn put_entity_tx(tx: &WriteTransaction, row: Entity, source: WriteSource) -> Result<bool> {
        let mut table = tx.open_table(ENTITIES_TABLE)?;
        let name = row.name.clone();
        let ty = row.entity_type.to_string();
        let existing: Option<Stored<Entity>> = match table.get((name.as_str(), ty.as_str()))? {
            Some(g) => Some(decode(g.value())?),
            None => None,
        };
        if let Some(ref old) = existing {
            if matches!(source, WriteSource::Local) && old.row == row {
                return Ok(false);
            }
        }
        let meta = Self::stamp(tx, existing.as_ref().map(|s| &s.meta), source)?;
        let bytes = encode(&Stored { meta, row })?;
        table.insert((name.as_str(), ty.as_str()), &bytes[..])?;
        Ok(true)
    }

    /// Look up an entity by its natural key.
    pub fn get_entity(&self, name: &str, entity_type: EntityType) -> Result<Option<Entity>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(ENTITIES_TABLE)?;
        let ty = entity_type.to_string();
        match table.get((name, ty.as_str()))? {
            Some(g) => Ok(Some(decode::<Entity>(g.value())?.row)),
            None => Ok(None),
        }
    }

    // --- rooms ---

    /// Create or update a room from a server observation, together with its
    /// owning entity, then one short transaction per reported exit.
    pub fn upsert_room(&self, obs: RoomObservation) -> Result<Room> {
        let merged = {
            let tx = self.db.begin_write()?;
            let merged = {
                Self::put_entity_tx(
                    &tx,
                    Entity {
                        name: obs.room_number.to_string(),
                        entity_type: EntityType::Room,
                    },
                    WriteSource::Local,
                )?;

                let mut table = tx.open_table(ROOMS_TABLE)?;
                let existing: Option<Stored<Room>> = match table.get(obs.room_number)? {
                    Some(g) => Some(decode(g.value())?),
                    None => None,
                };
                let old = existing.as_ref().map(|s| s.row.clone());
                let merged = Room {
                    room_number: obs.room_number,
                    zone: obs.zone.or_else(|| old.as_ref().and_then(|r| r.zone.clone())),
                    terrain: obs
                        .terrain
                        .or_else(|| old.as_ref().and_then(|r| r.terrain.clone())),
                    full_name: obs
                        .full_name
                        .or_else(|| old.as_ref().and_then(|r| r.full_name.clone())),
                    outside: obs.outside,
                    coords: obs.coords.or_else(|| old.as_ref().and_then(|r| r.coords)),
                    details: obs
                        .details
                        .or_else(|| old.as_ref().and_then(|r| r.details.clone())),
                };
                if old.as_ref() != Some(&merged) {
                    let meta =
                        Self::stamp(&tx, existing.as_ref().map(|s| &s.meta), WriteSource::Local)?;
                    let bytes = encode(&Stored { meta, row: merged.clone() })?;
                    table.insert(obs.room_number, &bytes[..])?;
                }
                merged
            };
            tx.commit()?;
            merged
        };

        // One transaction per exit: the write lock is held briefly per exit
        // rather than across all of them.
        for exit in obs.exits {
            let direction = Direction::from_raw(&exit.direction);
            self.upsert_exit(RoomExit {
                from_room: merged.room_number,
                direction,
                to_room_number: exit.to_room_number,
                is_door: exit.is_door,
                door_is_closed: exit.door_is_closed,
                details: None,
            })?;
        }

        Ok(merged)
    }

    pub fn get_room(&self, room_number: u64) -> Result<Option<Room>> {
        Ok(self.stored_room(room_number)?.map(|s| s.row))
    }

    pub(crate) fn stored_room(&self, room_number: u64) -> Result<Option<Stored<Room>>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(ROOMS_TABLE)?;
        match table.get(room_number)? {
            Some(g) => Ok(Some(decode(g.value())?)),
            None => Ok(None),
        }
    }

    /// All rooms recorded in a zone.
    pub fn rooms_in_zone(&self, zone: &str) -> Result<Vec<Room>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(ROOMS_TABLE)?;
        let mut rooms = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let stored: Stored<Room> = decode(value.value())?;
            if stored.row.zone.as_deref() == Some(zone) {
                rooms.push(stored.row);
            }
        }
        Ok(rooms)
    }

    /// Delete a room, its outgoing exits, and its owning entity. Each
    /// removed row gets a delete-ledger entry in the same transaction,
    /// before its foreign-key context disappears.
    pub fn delete_room(&self, room_number: u64) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let existed = {
            let mut rooms = tx.open_table(ROOMS_TABLE)?;
            if rooms.get(room_number)?.is_none() {
                return Ok(false);
            }

            let mut exits = tx.open_table(EXITS_TABLE)?;
            let mut exit_keys = Vec::new();
            for item in exits.iter()? {
                let (key, _) = item?;
                let (from, dir) = key.value();
                if from == room_number {
                    exit_keys.push((from, dir.to_string()));
                }
            }
            let now = now_micros();
            for (from, dir) in exit_keys {
                let seq = Self::next_seq(&tx)?;
                delete_log::append(&tx, seq, &NaturalKey::exit(from, &dir), now)?;
                exits.remove((from, dir.as_str()))?;
            }

            let seq = Self::next_seq(&tx)?;
            delete_log::append(&tx, seq, &NaturalKey::room(room_number), now)?;
            rooms.remove(room_number)?;

            let name = room_number.to_string();
            let entity_key = NaturalKey::entity(&name, EntityType::Room);
            let mut entities = tx.open_table(ENTITIES_TABLE)?;
            let ty = EntityType::Room.to_string();
            if entities.get((name.as_str(), ty.as_str()))?.is_some() {
                let seq = Self::next_seq(&tx)?;
                delete_log::append(&tx, seq, &entity_key, now)?;
                entities.remove((name.as_str(), ty.as_str()))?;
            }
            true
        };
        tx.commit()?;
        debug!(room_number, "deleted room");
        Ok(existed)
    }

    // --- exits ---

    fn put_exit_tx(tx: &WriteTransaction, row: RoomExit, source: WriteSource) -> Result<bool> {
        let mut table = tx.open_table(EXITS_TABLE)?;
        let raw = row.direction.raw().to_string();
        let existing: Option<Stored<RoomExit>> = match table.get((row.from_room, raw.as_str()))? {
            Some(g) => Some(decode(g.value())?),
            None => None,
        };
        if let Some(ref old) = existing {
            if matches!(source, WriteSource::Local) && old.row == row {
                return Ok(false);
            }
        }
        let meta = Self::stamp(tx, existing.as_ref().map(|s| &s.meta), source)?;
        let from = row.from_room;
        let bytes = encode(&Stored { meta, row })?;
        table.insert((from, raw.as_str()), &bytes[..])?;
        Ok(true)
    }

    /// Create or update an exit, preserving already-recorded command details
    /// unless the caller supplies new ones.
    pub fn upsert_exit(&self, mut row: RoomExit) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let changed = {
            if row.details.is_none() {
                let table = tx.open_table(EXITS_TABLE)?;
                if let Some(g) = table.get((row.from_room, row.direction.raw()))? {
                    row.details = decode::<RoomExit>(g.value())?.row.details;
                }
            }
            Self::put_exit_tx(&tx, row, WriteSource::Local)?
        };
        tx.commit()?;
        Ok(changed)
    }

    pub fn get_exit(&self, from_room: u64, direction_raw: &str) -> Result<Option<RoomExit>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(EXITS_TABLE)?;
        match table.get((from_room, direction_raw))? {
            Some(g) => Ok(Some(decode::<RoomExit>(g.value())?.row)),
            None => Ok(None),
        }
    }

    /// All exits leaving a room.
    pub fn exits_from(&self, from_room: u64) -> Result<Vec<RoomExit>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(EXITS_TABLE)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            if key.value().0 == from_room {
                out.push(decode::<RoomExit>(value.value())?.row);
            }
        }
        Ok(out)
    }

    /// All exits whose origin room lies in the given zone.
    pub fn exits_in_zone(&self, zone: &str) -> Result<Vec<RoomExit>> {
        let rooms: HashSet<u64> = self
            .rooms_in_zone(zone)?
            .into_iter()
            .map(|r| r.room_number)
            .collect();
        let tx = self.db.begin_read()?;
        let table = tx.open_table(EXITS_TABLE)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            if rooms.contains(&key.value().0) {
                out.push(decode::<RoomExit>(value.value())?.row);
            }
        }
        Ok(out)
    }

    /// Delete a single exit, with a ledger entry.
    pub fn delete_exit(&self, from_room: u64, direction_raw: &str) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let existed = {
            let mut table = tx.open_table(EXITS_TABLE)?;
            if table.get((from_room, direction_raw))?.is_none() {
                return Ok(false);
            }
            let seq = Self::next_seq(&tx)?;
            delete_log::append(
                &tx,
                seq,
                &NaturalKey::exit(from_room, direction_raw),
                now_micros(),
            )?;
            table.remove((from_room, direction_raw))?;
            true
        };
        tx.commit()?;
        Ok(existed)
    }

    /// Persist the command sequence of a confirmed transition onto the
    /// `(from_room, raw_command)` edge.
    ///
    /// The first confirmed transition wins. Before writing, every exit
    /// already recorded in the same zone is checked: if a *different* edge
    /// carries the identical raw command (case/whitespace-normalized), the
    /// write is rejected, so one command string can never point at two
    /// destinations within a zone. Standard compass directions are exempt:
    /// they exist in every room.
    pub fn record_exit_success(
        &self,
        from_room: u64,
        to_room: u64,
        raw_command: &str,
        pre_commands: &[String],
    ) -> Result<ExitRecordOutcome> {
        let direction = Direction::from_raw(raw_command);
        let raw = direction.raw().to_string();

        let Some(room) = self.get_room(from_room)? else {
            warn!(from_room, command = %raw, "exit success for unknown origin room");
            return Ok(ExitRecordOutcome::UnknownOrigin);
        };

        let existing = self.get_exit(from_room, &raw)?;
        if let Some(ref exit) = existing {
            let has_details = exit
                .details
                .as_ref()
                .is_some_and(|d| d.move_command.is_some());
            if has_details {
                debug!(from_room, command = %raw, "exit already recorded");
                return Ok(ExitRecordOutcome::AlreadyKnown);
            }
        }

        if !direction.is_compass() {
            if let Some(zone) = room.zone.as_deref() {
                let normalized = normalize_command(&raw);
                for other in self.exits_in_zone(zone)? {
                    if other.from_room == from_room && other.direction.raw() == raw {
                        continue;
                    }
                    if exit_uses_command(&other, &normalized) {
                        warn!(
                            zone,
                            command = %raw,
                            other_room = other.from_room,
                            "raw command already used by another exit in zone, skipping"
                        );
                        return Ok(ExitRecordOutcome::CollisionRejected);
                    }
                }
            }
        }

        let details = ExitDetails {
            move_command: Some(raw.clone()),
            pre_commands: pre_commands.to_vec(),
            last_success_at: Some(now_micros()),
            source: Some("observed".to_string()),
        };
        let row = RoomExit {
            from_room,
            direction,
            to_room_number: Some(to_room),
            is_door: existing.as_ref().map(|e| e.is_door).unwrap_or(false),
            door_is_closed: existing
                .as_ref()
                .map(|e| e.door_is_closed)
                .unwrap_or(false),
            details: Some(details),
        };
        let tx = self.db.begin_write()?;
        Self::put_exit_tx(&tx, row, WriteSource::Local)?;
        tx.commit()?;
        info!(from_room, to_room, command = %raw, "recorded exit success");
        Ok(ExitRecordOutcome::Recorded)
    }

    // --- npcs ---

    /// Create or update an NPC together with its owning entity.
    pub fn upsert_npc(&self, row: Npc) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let changed = {
            Self::put_entity_tx(
                &tx,
                Entity {
                    name: row.name.clone(),
                    entity_type: EntityType::Npc,
                },
                WriteSource::Local,
            )?;
            Self::put_npc_tx(&tx, row, WriteSource::Local)?
        };
        tx.commit()?;
        Ok(changed)
    }

    fn put_npc_tx(tx: &WriteTransaction, row: Npc, source: WriteSource) -> Result<bool> {
        let mut table = tx.open_table(NPCS_TABLE)?;
        let existing: Option<Stored<Npc>> = match table.get(row.name.as_str())? {
            Some(g) => Some(decode(g.value())?),
            None => None,
        };
        if let Some(ref old) = existing {
            if matches!(source, WriteSource::Local) && old.row == row {
                return Ok(false);
            }
        }
        let meta = Self::stamp(tx, existing.as_ref().map(|s| &s.meta), source)?;
        let name = row.name.clone();
        let bytes = encode(&Stored { meta, row })?;
        table.insert(name.as_str(), &bytes[..])?;
        Ok(true)
    }

    pub fn get_npc(&self, name: &str) -> Result<Option<Npc>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(NPCS_TABLE)?;
        match table.get(name)? {
            Some(g) => Ok(Some(decode::<Npc>(g.value())?.row)),
            None => Ok(None),
        }
    }

    /// All NPCs last seen in the given room.
    pub fn npcs_in_room(&self, room_number: u64) -> Result<Vec<Npc>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(NPCS_TABLE)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let stored: Stored<Npc> = decode(value.value())?;
            if stored.row.current_room == Some(room_number) {
                out.push(stored.row);
            }
        }
        Ok(out)
    }

    /// Delete an NPC and its owning entity, with ledger entries.
    pub fn delete_npc(&self, name: &str) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let existed = {
            let mut table = tx.open_table(NPCS_TABLE)?;
            if table.get(name)?.is_none() {
                return Ok(false);
            }
            let now = now_micros();
            let seq = Self::next_seq(&tx)?;
            delete_log::append(
                &tx,
                seq,
                &NaturalKey::Npc(crate::keys::NpcKey {
                    entity_name: name.to_string(),
                    entity_type: EntityType::Npc,
                }),
                now,
            )?;
            table.remove(name)?;

            let mut entities = tx.open_table(ENTITIES_TABLE)?;
            let ty = EntityType::Npc.to_string();
            if entities.get((name, ty.as_str()))?.is_some() {
                let seq = Self::next_seq(&tx)?;
                delete_log::append(&tx, seq, &NaturalKey::entity(name, EntityType::Npc), now)?;
                entities.remove((name, ty.as_str()))?;
            }
            true
        };
        tx.commit()?;
        Ok(existed)
    }

    // --- observations ---

    /// Record an observation. The text is part of the identity, so the same
    /// note twice is one row.
    pub fn add_observation(&self, row: Observation) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let changed = Self::put_observation_tx(&tx, row, WriteSource::Local)?;
        tx.commit()?;
        Ok(changed)
    }

    fn put_observation_tx(
        tx: &WriteTransaction,
        row: Observation,
        source: WriteSource,
    ) -> Result<bool> {
        let mut table = tx.open_table(OBSERVATIONS_TABLE)?;
        let ty = row.entity_type.to_string();
        let key = (
            row.entity_name.as_str(),
            ty.as_str(),
            row.observation_type.as_str(),
            row.text.as_str(),
        );
        let existing: Option<Stored<Observation>> = match table.get(key)? {
            Some(g) => Some(decode(g.value())?),
            None => None,
        };
        if existing.is_some() && matches!(source, WriteSource::Local) {
            // identity covers every field; nothing to update
            return Ok(false);
        }
        let meta = Self::stamp(tx, existing.as_ref().map(|s| &s.meta), source)?;
        let bytes = encode(&Stored { meta, row: row.clone() })?;
        let ty = row.entity_type.to_string();
        table.insert(
            (
                row.entity_name.as_str(),
                ty.as_str(),
                row.observation_type.as_str(),
                row.text.as_str(),
            ),
            &bytes[..],
        )?;
        Ok(true)
    }

    /// All observations attached to an entity.
    pub fn observations_for(
        &self,
        entity_name: &str,
        entity_type: EntityType,
    ) -> Result<Vec<Observation>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(OBSERVATIONS_TABLE)?;
        let ty = entity_type.to_string();
        let mut out = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let (name, kind, _, _) = key.value();
            if name == entity_name && kind == ty {
                out.push(decode::<Observation>(value.value())?.row);
            }
        }
        Ok(out)
    }

    /// Delete one observation, with a ledger entry.
    pub fn delete_observation(&self, row: &Observation) -> Result<bool> {
        let key = NaturalKey::from(row);
        let tx = self.db.begin_write()?;
        let existed = {
            let mut table = tx.open_table(OBSERVATIONS_TABLE)?;
            let ty = row.entity_type.to_string();
            let table_key = (
                row.entity_name.as_str(),
                ty.as_str(),
                row.observation_type.as_str(),
                row.text.as_str(),
            );
            if table.get(table_key)?.is_none() {
                return Ok(false);
            }
            let seq = Self::next_seq(&tx)?;
            delete_log::append(&tx, seq, &key, now_micros())?;
            table.remove(table_key)?;
            true
        };
        tx.commit()?;
        Ok(existed)
    }

    // --- relations ---

    /// Record a typed relation between two entities.
    pub fn add_relation(&self, row: Relation) -> Result<bool> {
        let tx = self.db.begin_write()?;
        let changed = Self::put_relation_tx(&tx, row, WriteSource::Local)?;
        tx.commit()?;
        Ok(changed)
    }

    fn put_relation_tx(
        tx: &WriteTransaction,
        row: Relation,
        source: WriteSource,
    ) -> Result<bool> {
        let mut table = tx.open_table(RELATIONS_TABLE)?;
        let from_ty = row.from_type.to_string();
        let to_ty = row.to_type.to_string();
        let key = (
            row.from_name.as_str(),
            from_ty.as_str(),
            row.to_name.as_str(),
            to_ty.as_str(),
            row.relation_type.as_str(),
        );
        let existing: Option<Stored<Relation>> = match table.get(key)? {
            Some(g) => Some(decode(g.value())?),
            None => None,
        };
        if let Some(ref old) = existing {
            if matches!(source, WriteSource::Local) && old.row == row {
                return Ok(false);
            }
        }
        let meta = Self::stamp(tx, existing.as_ref().map(|s| &s.meta), source)?;
        let bytes = encode(&Stored { meta, row: row.clone() })?;
        let from_ty = row.from_type.to_string();
        let to_ty = row.to_type.to_string();
        table.insert(
            (
                row.from_name.as_str(),
                from_ty.as_str(),
                row.to_name.as_str(),
                to_ty.as_str(),
                row.relation_type.as_str(),
            ),
            &bytes[..],
        )?;
        Ok(true)
    }

    /// All relations originating at an entity.
    pub fn relations_from(
        &self,
        entity_name: &str,
        entity_type: EntityType,
    ) -> Result<Vec<Relation>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RELATIONS_TABLE)?;
        let ty = entity_type.to_string();
        let mut out = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let (name, kind, _, _, _) = key.value();
            if name == entity_name && kind == ty {
                out.push(decode::<Relation>(value.value())?.row);
            }
        }
        Ok(out)
    }

    /// Delete one relation, with a ledger entry.
    pub fn delete_relation(&self, row: &Relation) -> Result<bool> {
        let key = NaturalKey::from(row);
        let tx = self.db.begin_write()?;
        let existed = {
            let mut table = tx.open_table(RELATIONS_TABLE)?;
            let from_ty = row.from_type.to_string();
            let to_ty = row.to_type.to_string();
            let table_key = (
                row.from_name.as_str(),
                from_ty.as_str(),
                row.to_name.as_str(),
                to_ty.as_str(),
                row.relation_type.as_str(),
            );
            if table.get(table_key)?.is_none() {
                return Ok(false);
            }
            let seq = Self::next_seq(&tx)?;
            delete_log::append(&tx, seq, &key, now_micros())?;
            table.remove(table_key)?;
            true
        };
        tx.commit()?;
        Ok(existed)
    }

    // --- path finding ---

    /// Breadth-first shortest path over the directed exit graph, returned
    /// as the command list to traverse it: any recorded pre-commands, then
    /// the recorded move command (falling back to the raw direction).
    pub fn find_path(
        &self,
        from_room: u64,
        to_room: u64,
        max_depth: usize,
    ) -> Result<Option<Vec<String>>> {
        if from_room == to_room {
            return Ok(Some(Vec::new()));
        }
        let mut adjacency: HashMap<u64, Vec<RoomExit>> = HashMap::new();
        {
            let tx = self.db.begin_read()?;
            let table = tx.open_table(EXITS_TABLE)?;
            for item in table.iter()? {
                let (_, value) = item?;
                let exit: RoomExit = decode::<RoomExit>(value.value())?.row;
                adjacency.entry(exit.from_room).or_default().push(exit);
            }
        }

        let mut visited: HashSet<u64> = HashSet::from([from_room]);
        let mut queue: VecDeque<(u64, usize, Vec<String>)> =
            VecDeque::from([(from_room, 0, Vec::new())]);
        while let Some((room, depth, commands)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(exits) = adjacency.get(&room) else {
                continue;
            };
            for exit in exits {
                let Some(next) = exit.to_room_number else {
                    continue;
                };
                if !visited.insert(next) {
                    continue;
                }
                let mut extended = commands.clone();
                if let Some(details) = &exit.details {
                    extended.extend(details.pre_commands.iter().cloned());
                    match &details.move_command {
                        Some(cmd) => extended.push(cmd.clone()),
                        None => extended.push(exit.direction.raw().to_string()),
                    }
                } else {
                    extended.push(exit.direction.raw().to_string());
                }
                if next == to_room {
                    return Ok(Some(extended));
                }
                queue.push_back((next, depth + 1, extended));
            }
        }
        Ok(None)
    }

    // --- delete ledger ---

    /// The full delete ledger, oldest first.
    pub fn delete_log(&self) -> Result<Vec<DeleteEntry>> {
        let tx = self.db.begin_read()?;
        delete_log::all(&tx)
    }

    pub(crate) fn unsynced_deletes(&self) -> Result<Vec<DeleteEntry>> {
        let tx = self.db.begin_read()?;
        delete_log::unsynced(&tx)
    }

    pub(crate) fn mark_deletes_synced(&self, sequence_ids: &[u64]) -> Result<()> {
        let tx = self.db.begin_write()?;
        delete_log::mark_synced(&tx, sequence_ids)?;
        tx.commit()?;
        Ok(())
    }

    // --- sync: push enumeration ---

    /// Rows of one kind changed locally since the given checkpoint.
    pub(crate) fn changed_since(&self, kind: RecordKind, since: u64) -> Result<Vec<PushRow>> {
        let tx = self.db.begin_read()?;
        let mut out = Vec::new();
        match kind {
            RecordKind::Entity => {
                let table = tx.open_table(ENTITIES_TABLE)?;
                for item in table.iter()? {
                    let (_, value) = item?;
                    let stored: Stored<Entity> = decode(value.value())?;
                    if stored.meta.updated_seq > since {
                        out.push(PushRow {
                            key: NaturalKey::entity(&stored.row.name, stored.row.entity_type),
                            row: serde_json::to_value(&stored.row)?,
                            local_seq: stored.meta.updated_seq,
                        });
                    }
                }
            }
            RecordKind::Room => {
                let table = tx.open_table(ROOMS_TABLE)?;
                for item in table.iter()? {
                    let (_, value) = item?;
                    let stored: Stored<Room> = decode(value.value())?;
                    if stored.meta.updated_seq > since {
                        out.push(PushRow {
                            key: NaturalKey::from(&stored.row),
                            row: serde_json::to_value(&stored.row)?,
                            local_seq: stored.meta.updated_seq,
                        });
                    }
                }
            }
            RecordKind::RoomExit => {
                let table = tx.open_table(EXITS_TABLE)?;
                for item in table.iter()? {
                    let (_, value) = item?;
                    let stored: Stored<RoomExit> = decode(value.value())?;
                    if stored.meta.updated_seq > since {
                        out.push(PushRow {
                            key: NaturalKey::from(&stored.row),
                            row: serde_json::to_value(&stored.row)?,
                            local_seq: stored.meta.updated_seq,
                        });
                    }
                }
            }
            RecordKind::Npc => {
                let table = tx.open_table(NPCS_TABLE)?;
                for item in table.iter()? {
                    let (_, value) = item?;
                    let stored: Stored<Npc> = decode(value.value())?;
                    if stored.meta.updated_seq > since {
                        out.push(PushRow {
                            key: NaturalKey::from(&stored.row),
                            row: serde_json::to_value(&stored.row)?,
                            local_seq: stored.meta.updated_seq,
                        });
                    }
                }
            }
            RecordKind::Observation => {
                let table = tx.open_table(OBSERVATIONS_TABLE)?;
                for item in table.iter()? {
                    let (_, value) = item?;
                    let stored: Stored<Observation> = decode(value.value())?;
                    if stored.meta.updated_seq > since {
                        out.push(PushRow {
                            key: NaturalKey::from(&stored.row),
                            row: serde_json::to_value(&stored.row)?,
                            local_seq: stored.meta.updated_seq,
                        });
                    }
                }
            }
            RecordKind::Relation => {
                let table = tx.open_table(RELATIONS_TABLE)?;
                for item in table.iter()? {
                    let (_, value) = item?;
                    let stored: Stored<Relation> = decode(value.value())?;
                    if stored.meta.updated_seq > since {
                        out.push(PushRow {
                            key: NaturalKey::from(&stored.row),
                            row: serde_json::to_value(&stored.row)?,
                            local_seq: stored.meta.updated_seq,
                        });
                    }
                }
            }
        }
        out.sort_by_key(|r| r.local_seq);
        Ok(out)
    }

    /// Stamp the remote sequence a push was acknowledged with onto each row,
    /// without marking the row dirty.
    pub(crate) fn mark_pushed(&self, acks: &[(NaturalKey, u64)]) -> Result<()> {
        let tx = self.db.begin_write()?;
        for (key, remote_seq) in acks {
            match key {
                NaturalKey::Entity(k) => {
                    let mut table = tx.open_table(ENTITIES_TABLE)?;
                    let ty = k.entity_type.to_string();
                    let updated = match table.get((k.name.as_str(), ty.as_str()))? {
                        Some(g) => {
                            let mut stored: Stored<Entity> = decode(g.value())?;
                            stored.meta.remote_seq = Some(*remote_seq);
                            Some(encode(&stored)?)
                        }
                        None => None,
                    };
                    if let Some(bytes) = updated {
                        table.insert((k.name.as_str(), ty.as_str()), &bytes[..])?;
                    }
                }
                NaturalKey::Room(k) => {
                    let mut table = tx.open_table(ROOMS_TABLE)?;
                    let updated = match table.get(k.room_number)? {
                        Some(g) => {
                            let mut stored: Stored<Room> = decode(g.value())?;
                            stored.meta.remote_seq = Some(*remote_seq);
                            Some(encode(&stored)?)
                        }
                        None => None,
                    };
                    if let Some(bytes) = updated {
                        table.insert(k.room_number, &bytes[..])?;
                    }
                }
                NaturalKey::RoomExit(k) => {
                    let mut table = tx.open_table(EXITS_TABLE)?;
                    let tk = (k.from_room_number, k.direction.as_str());
                    let updated = match table.get(tk)? {
                        Some(g) => {
                            let mut stored: Stored<RoomExit> = decode(g.value())?;
                            stored.meta.remote_seq = Some(*remote_seq);
                            Some(encode(&stored)?)
                        }
                        None => None,
                    };
                    if let Some(bytes) = updated {
                        table.insert(tk, &bytes[..])?;
                    }
                }
                NaturalKey::Npc(k) => {
                    let mut table = tx.open_table(NPCS_TABLE)?;
                    let updated = match table.get(k.entity_name.as_str())? {
                        Some(g) => {
                            let mut stored: Stored<Npc> = decode(g.value())?;
                            stored.meta.remote_seq = Some(*remote_seq);
                            Some(encode(&stored)?)
                        }
                        None => None,
                    };
                    if let Some(bytes) = updated {
                        table.insert(k.entity_name.as_str(), &bytes[..])?;
                    }
                }
                NaturalKey::Observation(k) => {
                    let mut table = tx.open_table(OBSERVATIONS_TABLE)?;
                    let ty = k.entity_type.to_string();
                    let tk = (
                        k.entity_name.as_str(),
                        ty.as_str(),
                        k.observation_type.as_str(),
                        k.text.as_str(),
                    );
                    let updated = match table.get(tk)? {
                        Some(g) => {
                            let mut stored: Stored<Observation> = decode(g.value())?;
                            stored.meta.remote_seq = Some(*remote_seq);
                            Some(encode(&stored)?)
                        }
                        None => None,
                    };
                    if let Some(bytes) = updated {
                        table.insert(tk, &bytes[..])?;
                    }
                }
                NaturalKey::Relation(k) => {
                    let mut table = tx.open_table(RELATIONS_TABLE)?;
                    let from_ty = k.from_entity_type.to_string();
                    let to_ty = k.to_entity_type.to_string();
                    let tk = (
                        k.from_entity_name.as_str(),
                        from_ty.as_str(),
                        k.to_entity_name.as_str(),
                        to_ty.as_str(),
                        k.relation_type.as_str(),
                    );
                    let updated = match table.get(tk)? {
                        Some(g) => {
                            let mut stored: Stored<Relation> = decode(g.value())?;
                            stored.meta.remote_seq = Some(*remote_seq);
                            Some(encode(&stored)?)
                        }
                        None => None,
                    };
                    if let Some(bytes) = updated {
                        table.insert(tk, &bytes[..])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- sync: pull application ---

    /// Apply one pulled remote row: create if absent, overwrite if present.
    /// Pull is last-applied-wins; the remote already reflects cross-peer
    /// reconciliation. Owning entities are materialized alongside their
    /// extension row; rows whose non-derivable parents are missing are
    /// skipped with a warning.
    pub(crate) fn apply_remote_row(
        &self,
        kind: RecordKind,
        row: serde_json::Value,
        remote_seq: u64,
    ) -> Result<ApplyOutcome> {
        let source = WriteSource::Remote { remote_seq };
        let tx = self.db.begin_write()?;
        let outcome = match kind {
            RecordKind::Entity => {
                let row: Entity = serde_json::from_value(row)?;
                Self::put_entity_tx(&tx, row, source)?;
                ApplyOutcome::Applied
            }
            RecordKind::Room => {
                let row: Room = serde_json::from_value(row)?;
                // the 1:1 owning entity is fully derivable; materialize it
                Self::put_entity_tx(
                    &tx,
                    Entity {
                        name: row.room_number.to_string(),
                        entity_type: EntityType::Room,
                    },
                    source,
                )?;
                Self::put_room_tx(&tx, row, source)?;
                ApplyOutcome::Applied
            }
            RecordKind::RoomExit => {
                let row: RoomExit = serde_json::from_value(row)?;
                let rooms = tx.open_table(ROOMS_TABLE)?;
                if rooms.get(row.from_room)?.is_none() {
                    warn!(
                        from_room = row.from_room,
                        direction = %row.direction,
                        "pulled exit references unknown room, skipping"
                    );
                    ApplyOutcome::Skipped
                } else {
                    drop(rooms);
                    Self::put_exit_tx(&tx, row, source)?;
                    ApplyOutcome::Applied
                }
            }
            RecordKind::Npc => {
                let row: Npc = serde_json::from_value(row)?;
                Self::put_entity_tx(
                    &tx,
                    Entity {
                        name: row.name.clone(),
                        entity_type: EntityType::Npc,
                    },
                    source,
                )?;
                Self::put_npc_tx(&tx, row, source)?;
                ApplyOutcome::Applied
            }
            RecordKind::Observation => {
                let row: Observation = serde_json::from_value(row)?;
                let entities = tx.open_table(ENTITIES_TABLE)?;
                let ty = row.entity_type.to_string();
                if entities.get((row.entity_name.as_str(), ty.as_str()))?.is_none() {
                    warn!(
                        entity = %row.entity_name,
                        "pulled observation references unknown entity, skipping"
                    );
                    ApplyOutcome::Skipped
                } else {
                    drop(entities);
                    Self::put_observation_tx(&tx, row, source)?;
                    ApplyOutcome::Applied
                }
            }
            RecordKind::Relation => {
                let row: Relation = serde_json::from_value(row)?;
                let entities = tx.open_table(ENTITIES_TABLE)?;
                let from_ty = row.from_type.to_string();
                let to_ty = row.to_type.to_string();
                let have_from = entities
                    .get((row.from_name.as_str(), from_ty.as_str()))?
                    .is_some();
                let have_to = entities.get((row.to_name.as_str(), to_ty.as_str()))?.is_some();
                if !have_from || !have_to {
                    warn!(
                        from = %row.from_name,
                        to = %row.to_name,
                        "pulled relation references unknown entity, skipping"
                    );
                    ApplyOutcome::Skipped
                } else {
                    drop(entities);
                    Self::put_relation_tx(&tx, row, source)?;
                    ApplyOutcome::Applied
                }
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn put_room_tx(tx: &WriteTransaction, row: Room, source: WriteSource) -> Result<bool> {
        let mut table = tx.open_table(ROOMS_TABLE)?;
        let existing: Option<Stored<Room>> = match table.get(row.room_number)? {
            Some(g) => Some(decode(g.value())?),
            None => None,
        };
        if let Some(ref old) = existing {
            if matches!(source, WriteSource::Local) && old.row == row {
                return Ok(false);
            }
        }
        let meta = Self::stamp(tx, existing.as_ref().map(|s| &s.meta), source)?;
        let num = row.room_number;
        let bytes = encode(&Stored { meta, row })?;
        table.insert(num, &bytes[..])?;
        Ok(true)
    }

    /// Apply one pulled remote delete by natural key. Idempotent: a missing
    /// row is a no-op. A row whose current incarnation is provably newer
    /// than the delete (by mirror sequence, or created locally after the
    /// applied-delete checkpoint last advanced) is left alone.
    pub(crate) fn apply_remote_delete(&self, key: &NaturalKey, remote_seq: u64) -> Result<bool> {
        let suppress_floor = self.checkpoint(META_DELETES_APPLIED_LOCAL_SEQ)?;
        let tx = self.db.begin_write()?;
        let deleted = {
            match key {
                NaturalKey::Entity(k) => {
                    let mut table = tx.open_table(ENTITIES_TABLE)?;
                    let ty = k.entity_type.to_string();
                    let tk = (k.name.as_str(), ty.as_str());
                    let meta = match table.get(tk)? {
                        Some(g) => Some(decode::<Entity>(g.value())?.meta),
                        None => None,
                    };
                    match meta {
                        Some(meta) if Self::suppressed(&meta, remote_seq, suppress_floor) => false,
                        Some(_) => {
                            table.remove(tk)?;
                            true
                        }
                        None => false,
                    }
                }
                NaturalKey::Room(k) => {
                    let mut table = tx.open_table(ROOMS_TABLE)?;
                    let meta = match table.get(k.room_number)? {
                        Some(g) => Some(decode::<Room>(g.value())?.meta),
                        None => None,
                    };
                    match meta {
                        Some(meta) if Self::suppressed(&meta, remote_seq, suppress_floor) => false,
                        Some(_) => {
                            table.remove(k.room_number)?;
                            drop(table);
                            // keep the owning pair and the edge set consistent;
                            // the mirror sends their delete entries too, which
                            // then land as no-ops
                            let mut exits = tx.open_table(EXITS_TABLE)?;
                            let mut stale = Vec::new();
                            for item in exits.iter()? {
                                let (ek, _) = item?;
                                let (from, dir) = ek.value();
                                if from == k.room_number {
                                    stale.push(dir.to_string());
                                }
                            }
                            for dir in stale {
                                exits.remove((k.room_number, dir.as_str()))?;
                            }
                            let mut entities = tx.open_table(ENTITIES_TABLE)?;
                            let name = k.room_number.to_string();
                            let ty = EntityType::Room.to_string();
                            entities.remove((name.as_str(), ty.as_str()))?;
                            true
                        }
                        None => false,
                    }
                }
                NaturalKey::RoomExit(k) => {
                    let mut table = tx.open_table(EXITS_TABLE)?;
                    let tk = (k.from_room_number, k.direction.as_str());
                    let meta = match table.get(tk)? {
                        Some(g) => Some(decode::<RoomExit>(g.value())?.meta),
                        None => None,
                    };
                    match meta {
                        Some(meta) if Self::suppressed(&meta, remote_seq, suppress_floor) => false,
                        Some(_) => {
                            table.remove(tk)?;
                            true
                        }
                        None => false,
                    }
                }
                NaturalKey::Npc(k) => {
                    let mut table = tx.open_table(NPCS_TABLE)?;
                    let meta = match table.get(k.entity_name.as_str())? {
                        Some(g) => Some(decode::<Npc>(g.value())?.meta),
                        None => None,
                    };
                    match meta {
                        Some(meta) if Self::suppressed(&meta, remote_seq, suppress_floor) => false,
                        Some(_) => {
                            table.remove(k.entity_name.as_str())?;
                            drop(table);
                            let mut entities = tx.open_table(ENTITIES_TABLE)?;
                            let ty = EntityType::Npc.to_string();
                            entities.remove((k.entity_name.as_str(), ty.as_str()))?;
                            true
                        }
                        None => false,
                    }
                }
                NaturalKey::Observation(k) => {
                    let mut table = tx.open_table(OBSERVATIONS_TABLE)?;
                    let ty = k.entity_type.to_string();
                    let tk = (
                        k.entity_name.as_str(),
                        ty.as_str(),
                        k.observation_type.as_str(),
                        k.text.as_str(),
                    );
                    let meta = match table.get(tk)? {
                        Some(g) => Some(decode::<Observation>(g.value())?.meta),
                        None => None,
                    };
                    match meta {
                        Some(meta) if Self::suppressed(&meta, remote_seq, suppress_floor) => false,
                        Some(_) => {
                            table.remove(tk)?;
                            true
                        }
                        None => false,
                    }
                }
                NaturalKey::Relation(k) => {
                    let mut table = tx.open_table(RELATIONS_TABLE)?;
                    let from_ty = k.from_entity_type.to_string();
                    let to_ty = k.to_entity_type.to_string();
                    let tk = (
                        k.from_entity_name.as_str(),
                        from_ty.as_str(),
                        k.to_entity_name.as_str(),
                        to_ty.as_str(),
                        k.relation_type.as_str(),
                    );
                    let meta = match table.get(tk)? {
                        Some(g) => Some(decode::<Relation>(g.value())?.meta),
                        None => None,
                    };
                    match meta {
                        Some(meta) if Self::suppressed(&meta, remote_seq, suppress_floor) => false,
                        Some(_) => {
                            table.remove(tk)?;
                            true
                        }
                        None => false,
                    }
                }
            }
        };
        tx.commit()?;
        if deleted {
            debug!(key = %key.canonical(), remote_seq, "applied remote delete");
        }
        Ok(deleted)
    }

    fn suppressed(meta: &RowMeta, delete_remote_seq: u64, suppress_floor: u64) -> bool {
        match meta.remote_seq {
            Some(row_seq) if row_seq > delete_remote_seq => {
                debug!(
                    row_seq,
                    delete_remote_seq, "remote delete suppressed, row re-synced after delete"
                );
                true
            }
            Some(_) => false,
            None => {
                let newer = meta.created_seq > suppress_floor;
                if newer {
                    debug!(
                        created_seq = meta.created_seq,
                        suppress_floor, "remote delete suppressed, row created after checkpoint"
                    );
                }
                newer
            }
        }
    }
}

/// Meta key of the local-seq snapshot taken when the applied-delete
/// checkpoint last advanced.
pub(crate) fn deletes_applied_local_seq_key() -> &'static str {
    META_DELETES_APPLIED_LOCAL_SEQ
}

/// Case/whitespace-normalized form of a raw command, used for collision
/// comparison only; the stored raw value stays verbatim.
fn normalize_command(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

fn exit_uses_command(exit: &RoomExit, normalized: &str) -> bool {
    if let Direction::Command(raw) = &exit.direction {
        if normalize_command(raw) == normalized {
            return true;
        }
    }
    if let Some(details) = &exit.details {
        if let Some(cmd) = &details.move_command {
            if normalize_command(cmd) == normalized {
                return true;
            }
        }
    }
    false
}
