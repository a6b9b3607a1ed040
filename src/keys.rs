//! Natural keys: portable row identity.
//!
//! Local row handles are meaningless on another peer, so replication
//! addresses rows by a key derived from domain fields. A [`NaturalKey`]
//! serializes to a canonical JSON object (serde_json maps are ordered), and
//! the canonical text form is what the delete ledger and the mirror key on.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{EntityType, Npc, Observation, Relation, Room, RoomExit};

/// Discriminator for the replicated row kinds.
///
/// The string forms appear in delete-ledger entries and mirror routes;
/// keep them stable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Entity,
    Room,
    #[strum(serialize = "roomexit")]
    RoomExit,
    Npc,
    Observation,
    Relation,
}

/// Push/pull order: parents before children.
pub const KIND_ORDER: [RecordKind; 6] = [
    RecordKind::Entity,
    RecordKind::Room,
    RecordKind::RoomExit,
    RecordKind::Npc,
    RecordKind::Observation,
    RecordKind::Relation,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityKey {
    pub name: String,
    pub entity_type: EntityType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKey {
    pub room_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitKey {
    pub from_room_number: u64,
    /// The raw direction value: a compass token or the full command string.
    pub direction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcKey {
    pub entity_name: String,
    pub entity_type: EntityType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationKey {
    pub entity_name: String,
    pub entity_type: EntityType,
    pub observation_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationKey {
    pub from_entity_name: String,
    pub from_entity_type: EntityType,
    pub to_entity_name: String,
    pub to_entity_type: EntityType,
    pub relation_type: String,
}

/// A canonical, JSON-serializable row identity, stable across peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NaturalKey {
    Entity(EntityKey),
    Room(RoomKey),
    RoomExit(ExitKey),
    Npc(NpcKey),
    Observation(ObservationKey),
    Relation(RelationKey),
}

impl NaturalKey {
    pub fn kind(&self) -> RecordKind {
        match self {
            NaturalKey::Entity(_) => RecordKind::Entity,
            NaturalKey::Room(_) => RecordKind::Room,
            NaturalKey::RoomExit(_) => RecordKind::RoomExit,
            NaturalKey::Npc(_) => RecordKind::Npc,
            NaturalKey::Observation(_) => RecordKind::Observation,
            NaturalKey::Relation(_) => RecordKind::Relation,
        }
    }

    /// The key as a JSON object, e.g. `{"room_number": 42}`.
    pub fn to_value(&self) -> serde_json::Value {
        // serializing plain structs with derived Serialize cannot fail
        match self {
            NaturalKey::Entity(k) => serde_json::to_value(k),
            NaturalKey::Room(k) => serde_json::to_value(k),
            NaturalKey::RoomExit(k) => serde_json::to_value(k),
            NaturalKey::Npc(k) => serde_json::to_value(k),
            NaturalKey::Observation(k) => serde_json::to_value(k),
            NaturalKey::Relation(k) => serde_json::to_value(k),
        }
        .unwrap_or_default()
    }

    /// Canonical text form; field order is fixed by serde_json's ordered
    /// maps, so equal keys always encode to equal strings.
    pub fn canonical(&self) -> String {
        self.to_value().to_string()
    }

    /// Decode a key of a known kind from its JSON object form.
    pub fn from_value(kind: RecordKind, value: serde_json::Value) -> Result<NaturalKey> {
        let key = match kind {
            RecordKind::Entity => NaturalKey::Entity(serde_json::from_value(value)?),
            RecordKind::Room => NaturalKey::Room(serde_json::from_value(value)?),
            RecordKind::RoomExit => NaturalKey::RoomExit(serde_json::from_value(value)?),
            RecordKind::Npc => NaturalKey::Npc(serde_json::from_value(value)?),
            RecordKind::Observation => NaturalKey::Observation(serde_json::from_value(value)?),
            RecordKind::Relation => NaturalKey::Relation(serde_json::from_value(value)?),
        };
        Ok(key)
    }

    /// Decode a key of a known kind from JSON text (the delete-log column).
    pub fn from_json(kind: RecordKind, text: &str) -> Result<NaturalKey> {
        let value: serde_json::Value = serde_json::from_str(text)
            .with_context(|| format!("invalid natural key json for {kind}"))?;
        Self::from_value(kind, value)
    }
}

impl From<&Room> for NaturalKey {
    fn from(row: &Room) -> Self {
        NaturalKey::Room(RoomKey {
            room_number: row.room_number,
        })
    }
}

impl From<&RoomExit> for NaturalKey {
    fn from(row: &RoomExit) -> Self {
        NaturalKey::RoomExit(ExitKey {
            from_room_number: row.from_room,
            direction: row.direction.raw().to_string(),
        })
    }
}

impl From<&Npc> for NaturalKey {
    fn from(row: &Npc) -> Self {
        NaturalKey::Npc(NpcKey {
            entity_name: row.name.clone(),
            entity_type: EntityType::Npc,
        })
    }
}

impl From<&Observation> for NaturalKey {
    fn from(row: &Observation) -> Self {
        NaturalKey::Observation(ObservationKey {
            entity_name: row.entity_name.clone(),
            entity_type: row.entity_type,
            observation_type: row.observation_type.clone(),
            text: row.text.clone(),
        })
    }
}

impl From<&Relation> for NaturalKey {
    fn from(row: &Relation) -> Self {
        NaturalKey::Relation(RelationKey {
            from_entity_name: row.from_name.clone(),
            from_entity_type: row.from_type,
            to_entity_name: row.to_name.clone(),
            to_entity_type: row.to_type,
            relation_type: row.relation_type.clone(),
        })
    }
}

impl NaturalKey {
    /// Key for an [`crate::model::Entity`] row.
    pub fn entity(name: &str, entity_type: EntityType) -> NaturalKey {
        NaturalKey::Entity(EntityKey {
            name: name.to_string(),
            entity_type,
        })
    }

    /// Key for a room row.
    pub fn room(room_number: u64) -> NaturalKey {
        NaturalKey::Room(RoomKey { room_number })
    }

    /// Key for an exit row.
    pub fn exit(from_room_number: u64, direction_raw: &str) -> NaturalKey {
        NaturalKey::RoomExit(ExitKey {
            from_room_number,
            direction: direction_raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_key_canonical_form() {
        let key = NaturalKey::room(42);
        assert_eq!(key.canonical(), r#"{"room_number":42}"#);
    }

    #[test]
    fn canonical_is_field_order_independent() {
        // fields supplied in reverse order still decode and re-encode the same
        let text = r#"{"direction":"enter portal","from_room_number":7}"#;
        let shuffled = r#"{"from_room_number":7,"direction":"enter portal"}"#;
        let a = NaturalKey::from_json(RecordKind::RoomExit, text).unwrap();
        let b = NaturalKey::from_json(RecordKind::RoomExit, shuffled).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(RecordKind::RoomExit.to_string(), "roomexit");
        assert_eq!(RecordKind::Entity.to_string(), "entity");
        assert_eq!("observation".parse::<RecordKind>().unwrap(), RecordKind::Observation);
    }

    #[test]
    fn entity_key_round_trips() {
        let key = NaturalKey::entity("a shady thief", EntityType::Npc);
        let back = NaturalKey::from_json(RecordKind::Entity, &key.canonical()).unwrap();
        assert_eq!(key, back);
    }
}
