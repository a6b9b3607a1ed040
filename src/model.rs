//! Typed rows of the world graph.
//!
//! Every typed row (room, NPC, ...) exclusively owns one [`Entity`] row; the
//! pair is kept consistent by the store, not by a type hierarchy.

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Unix timestamp in microseconds.
pub type Timestamp = u64;

/// Current time as a [`Timestamp`].
pub fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// The type of game object an [`Entity`] describes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
pub enum EntityType {
    /// A location in the world.
    Room,
    /// A non-player character.
    #[strum(serialize = "NPC")]
    #[serde(rename = "NPC")]
    Npc,
}

/// Base record for any named game object.
///
/// Identified across peers by `(name, entity_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub entity_type: EntityType,
}

/// Grid coordinates reported by the game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coords {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

/// A location. Identified across peers by its world-unique `room_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_number: u64,
    pub zone: Option<String>,
    pub terrain: Option<String>,
    pub full_name: Option<String>,
    #[serde(default)]
    pub outside: bool,
    pub coords: Option<Coords>,
    /// Free-form extra detail blob (shop flags etc).
    pub details: Option<String>,
}

/// The six standard movement tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compass {
    North,
    South,
    East,
    West,
    Up,
    Down,
}

impl Compass {
    /// The one-letter token used on the wire and as the raw direction value.
    pub fn token(&self) -> &'static str {
        match self {
            Compass::North => "n",
            Compass::South => "s",
            Compass::East => "e",
            Compass::West => "w",
            Compass::Up => "u",
            Compass::Down => "d",
        }
    }
}

impl FromStr for Compass {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "n" | "north" => Ok(Compass::North),
            "s" | "south" => Ok(Compass::South),
            "e" | "east" => Ok(Compass::East),
            "w" | "west" => Ok(Compass::West),
            "u" | "up" => Ok(Compass::Up),
            "d" | "down" => Ok(Compass::Down),
            _ => Err(()),
        }
    }
}

/// How an exit is traversed: either a standard compass token or a free-form
/// command string such as `enter portal`.
///
/// Two command directions are the same edge only on an exact match of the
/// full raw string; `enter hut` and `enter rubble` are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Direction {
    Compass(Compass),
    Command(String),
}

impl Direction {
    /// Parse a raw direction value. Long compass names normalize to the
    /// short token; anything else is a command direction, kept verbatim
    /// apart from trimming.
    pub fn from_raw(raw: &str) -> Direction {
        let trimmed = raw.trim();
        match Compass::from_str(&trimmed.to_ascii_lowercase()) {
            Ok(c) => Direction::Compass(c),
            Err(()) => Direction::Command(trimmed.to_string()),
        }
    }

    /// The raw value this direction is keyed by.
    pub fn raw(&self) -> &str {
        match self {
            Direction::Compass(c) => c.token(),
            Direction::Command(s) => s,
        }
    }

    /// Whether this is a standard compass direction.
    pub fn is_compass(&self) -> bool {
        matches!(self, Direction::Compass(_))
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw())
    }
}

/// Verified command sequence for traversing an exit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitDetails {
    /// The exact movement command that produced the transition.
    pub move_command: Option<String>,
    /// Setup commands issued immediately before the movement command.
    #[serde(default)]
    pub pre_commands: Vec<String>,
    pub last_success_at: Option<Timestamp>,
    /// Where this knowledge came from, e.g. `observed`.
    pub source: Option<String>,
}

/// A directed edge between two rooms.
///
/// Identified across peers by `(from_room, raw direction value)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomExit {
    pub from_room: u64,
    pub direction: Direction,
    /// Destination room number, if the destination has been observed.
    pub to_room_number: Option<u64>,
    #[serde(default)]
    pub is_door: bool,
    #[serde(default)]
    pub door_is_closed: bool,
    pub details: Option<ExitDetails>,
}

/// A non-player character. Owns an [`Entity`] with type [`EntityType::Npc`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Npc {
    pub name: String,
    pub current_room: Option<u64>,
    pub npc_type: Option<String>,
}

/// A free-text note attached to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub entity_name: String,
    pub entity_type: EntityType,
    pub observation_type: String,
    pub text: String,
}

/// A typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub from_name: String,
    pub from_type: EntityType,
    pub to_name: String,
    pub to_type: EntityType,
    pub relation_type: String,
    pub metadata: Option<serde_json::Value>,
}

/// One observed state of an exit, as reported by the game server for a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitObservation {
    pub direction: String,
    pub to_room_number: Option<u64>,
    #[serde(default)]
    pub is_door: bool,
    #[serde(default)]
    pub door_is_closed: bool,
}

/// A full room observation from the game server, used by [`crate::GraphStore::upsert_room`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomObservation {
    pub room_number: u64,
    pub zone: Option<String>,
    pub terrain: Option<String>,
    pub full_name: Option<String>,
    #[serde(default)]
    pub outside: bool,
    pub coords: Option<Coords>,
    pub details: Option<String>,
    #[serde(default)]
    pub exits: Vec<ExitObservation>,
}
