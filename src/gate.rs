//! Decides when a confirmed room transition may be recorded as an exit.
//!
//! Exit knowledge must come from single deliberate movement commands.
//! Scripted multi-hop navigation replays a path that is already known, so
//! transitions observed under it prove nothing about any one command and
//! the gate records none of them. Setup commands issued before a movement
//! (`unlock portal` before `enter portal`) are buffered and attached to the
//! recorded exit as its pre-commands.

use anyhow::Result;
use tracing::debug;

use crate::{
    model::{Direction, Room, RoomObservation},
    store::GraphStore,
};

/// Verbs that prepare an exit rather than traverse it. Dispatched alone,
/// a command starting with one of these is buffered for the next movement.
const PRE_COMMAND_VERBS: &[&str] = &[
    "open", "unlock", "pick", "bash", "break", "kick", "force", "unbar", "unlatch", "say",
    "pull", "push",
];

/// Verbs that open an "implicit exit" command such as `enter portal` or
/// `climb rope`; with an argument they count as movement.
const IMPLICIT_EXIT_VERBS: &[&str] = &["enter", "climb", "board", "escape", "crawl", "jump"];

/// Commands that neither move nor prepare movement; they pass through the
/// gate without clearing a pending capture.
const PASSIVE_COMMANDS: &[&str] = &[
    "look", "l", "glance", "exits", "scan", "map", "inventory", "i", "score", "who", "time",
    "weather",
];

/// The verb that prefixes scripted navigation (`run 2n3e`).
const SCRIPTED_NAV_VERB: &str = "run";

/// Tracks dispatched commands and room transitions, feeding confirmed
/// single-command transitions into [`GraphStore::record_exit_success`].
#[derive(Debug)]
pub struct NavigationGate {
    store: GraphStore,
    current_room: Option<u64>,
    /// The one candidate movement command since the last transition,
    /// together with the room it was dispatched from.
    pending: Option<PendingCapture>,
    /// Setup commands buffered for the next movement.
    pending_pre_commands: Vec<String>,
}

#[derive(Debug)]
struct PendingCapture {
    from_room: u64,
    command: String,
    pre_commands: Vec<String>,
}

impl NavigationGate {
    pub fn new(store: GraphStore) -> Self {
        Self {
            store,
            current_room: None,
            pending: None,
            pending_pre_commands: Vec::new(),
        }
    }

    /// Room the gate last saw the player in.
    pub fn current_room(&self) -> Option<u64> {
        self.current_room
    }

    fn clear(&mut self) {
        self.pending = None;
        self.pending_pre_commands.clear();
    }

    /// Feed one dispatched command line. `is_multi_step` is true for
    /// scripted multi-hop navigation replaying a known path; such a
    /// dispatch clears any pending capture and records nothing.
    pub fn on_command(&mut self, raw: &str, is_multi_step: bool) {
        if is_multi_step {
            self.clear();
            return;
        }
        let Some(from_room) = self.current_room else {
            return;
        };

        // a single dispatch may stack setup commands before its movement,
        // separated by the step separator
        let mut dispatch_pre: Vec<String> = Vec::new();
        let mut movement: Option<String> = None;
        for token in raw.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            // a token that is itself scripted navigation means the caller
            // failed to flag the dispatch; treat it like one anyway
            if is_scripted(token) {
                debug!(command = token, "scripted navigation token, suppressing exit capture");
                self.clear();
                return;
            }
            if is_movement(token) {
                if movement.is_some() {
                    // two movements in one dispatch: unattributable
                    self.clear();
                    return;
                }
                movement = Some(token.to_string());
                continue;
            }
            let verb = first_word(token);
            if movement.is_none() && !PASSIVE_COMMANDS.contains(&verb) {
                dispatch_pre.push(token.to_string());
            }
        }

        match movement {
            Some(command) => {
                let mut pre = std::mem::take(&mut self.pending_pre_commands);
                pre.extend(dispatch_pre);
                self.pending = Some(PendingCapture {
                    from_room,
                    command,
                    pre_commands: pre,
                });
            }
            None => {
                // no movement in this dispatch; buffer recognized setup
                // commands, let everything else pass without clearing
                for token in dispatch_pre {
                    if PRE_COMMAND_VERBS.contains(&first_word(&token)) {
                        self.pending_pre_commands.push(token);
                    }
                }
            }
        }
    }

    /// Feed a room observation from the game server. The room is always
    /// upserted; the transition is recorded as an exit only when its origin
    /// matches a pending single-command capture.
    pub fn on_room_observed(&mut self, obs: RoomObservation) -> Result<Room> {
        let room = self.store.upsert_room(obs)?;
        let previous = self.current_room.replace(room.room_number);

        let Some(capture) = self.pending.take() else {
            return Ok(room);
        };
        if room.room_number == capture.from_room {
            // a re-observation of the origin (a look), not a transition
            self.pending = Some(capture);
            return Ok(room);
        }
        if previous != Some(capture.from_room) {
            return Ok(room);
        }

        let outcome = self.store.record_exit_success(
            capture.from_room,
            room.room_number,
            &capture.command,
            &capture.pre_commands,
        )?;
        debug!(
            from = capture.from_room,
            to = room.room_number,
            command = %capture.command,
            ?outcome,
            "transition observed"
        );
        Ok(room)
    }
}

fn first_word(token: &str) -> &str {
    token.split_whitespace().next().unwrap_or_default()
}

/// Compass tokens and implicit-exit commands count as movement.
fn is_movement(token: &str) -> bool {
    if Direction::from_raw(token).is_compass() {
        return true;
    }
    let lower = token.to_ascii_lowercase();
    let mut words = lower.split_whitespace();
    match (words.next(), words.next()) {
        (Some(verb), Some(_)) => IMPLICIT_EXIT_VERBS.contains(&verb),
        _ => false,
    }
}

/// `run ...` and bare speedwalk tokens such as `2n3e`.
fn is_scripted(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    if lower == SCRIPTED_NAV_VERB || lower.starts_with("run ") {
        return true;
    }
    lower.len() > 1
        && lower.chars().any(|c| c.is_ascii_digit())
        && lower.chars().all(|c| c.is_ascii_digit() || "nsewud".contains(c))
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::model::RoomObservation;

    fn obs(number: u64) -> RoomObservation {
        RoomObservation {
            room_number: number,
            zone: Some("midgaard".to_string()),
            ..Default::default()
        }
    }

    fn gate() -> Result<(NavigationGate, GraphStore)> {
        let store = GraphStore::in_memory()?;
        Ok((NavigationGate::new(store.clone()), store))
    }

    #[test]
    fn single_command_transition_is_recorded() -> TestResult {
        let (mut gate, store) = gate()?;
        gate.on_room_observed(obs(1))?;
        gate.on_command("n", false);
        gate.on_room_observed(obs(2))?;
        let exit = store.get_exit(1, "n")?.unwrap();
        assert_eq!(exit.to_room_number, Some(2));
        assert!(exit.details.unwrap().move_command.is_some());
        Ok(())
    }

    #[test]
    fn multi_step_dispatch_records_nothing() -> TestResult {
        let (mut gate, store) = gate()?;
        gate.on_room_observed(obs(1))?;
        gate.on_command("run 2n;open door;n;run 3e", true);
        // intervening transitions while the dispatch is outstanding
        gate.on_room_observed(obs(5))?;
        gate.on_room_observed(obs(6))?;
        gate.on_room_observed(obs(7))?;
        assert!(store.exits_from(1)?.is_empty());
        assert!(store.exits_from(5)?.is_empty());
        assert!(store.exits_from(6)?.is_empty());
        Ok(())
    }

    #[test]
    fn unflagged_scripted_tokens_still_suppress() -> TestResult {
        let (mut gate, store) = gate()?;
        gate.on_room_observed(obs(1))?;
        for line in ["run 2n", "2n3e"] {
            gate.on_command(line, false);
            gate.on_room_observed(obs(9))?;
        }
        assert!(store.exits_from(1)?.is_empty());
        Ok(())
    }

    #[test]
    fn stacked_setup_and_movement_in_one_dispatch() -> TestResult {
        let (mut gate, store) = gate()?;
        gate.on_room_observed(obs(1))?;
        gate.on_command("unlock portal; enter portal", false);
        gate.on_room_observed(obs(2))?;
        let details = store.get_exit(1, "enter portal")?.unwrap().details.unwrap();
        assert_eq!(details.pre_commands, vec!["unlock portal".to_string()]);
        assert_eq!(details.move_command.as_deref(), Some("enter portal"));
        Ok(())
    }

    #[test]
    fn passive_command_keeps_pending_capture() -> TestResult {
        let (mut gate, store) = gate()?;
        gate.on_room_observed(obs(1))?;
        gate.on_command("unlock portal", false);
        gate.on_command("enter portal", false);
        // latency: an unrelated command lands before the transition confirms
        gate.on_command("look", false);
        gate.on_room_observed(obs(2))?;
        let details = store.get_exit(1, "enter portal")?.unwrap().details.unwrap();
        assert_eq!(details.pre_commands, vec!["unlock portal".to_string()]);
        Ok(())
    }

    #[test]
    fn origin_relook_keeps_pending_capture() -> TestResult {
        let (mut gate, store) = gate()?;
        gate.on_room_observed(obs(1))?;
        gate.on_command("n", false);
        // a re-observation of the origin room does not consume the capture
        gate.on_room_observed(obs(1))?;
        gate.on_room_observed(obs(2))?;
        assert_eq!(store.get_exit(1, "n")?.unwrap().to_room_number, Some(2));
        Ok(())
    }

    #[test]
    fn two_movements_in_one_dispatch_are_unattributable() -> TestResult {
        let (mut gate, store) = gate()?;
        gate.on_room_observed(obs(1))?;
        gate.on_command("n;e", false);
        gate.on_room_observed(obs(2))?;
        gate.on_room_observed(obs(3))?;
        assert!(store.exits_from(1)?.is_empty());
        assert!(store.exits_from(2)?.is_empty());
        Ok(())
    }
}
