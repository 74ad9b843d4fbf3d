// ── Optimistic overlay ──
//
// Per-field optimistic values shown in place of the last known device
// status while a command is awaiting confirmation. Each field is owned
// by at most one in-flight command; a newer command on the same field
// takes it over.
//
// Lifecycle of a command:
//   begin()   -> Optimistic
//   observe() -> Confirmed when its predicate holds,
//                Expired once the guard window passes without it
//   revert()  -> Reverted (the write itself failed)
//   begin() of a later command covering all its fields -> Superseded

mod predicate;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use fansync_api::Status;

pub use predicate::{Predicate, values_match};

/// Identifier handed out by [`OptimisticOverlay::begin`].
pub type CommandId = u64;

/// Settled commands remembered for [`OptimisticOverlay::phase`].
const SETTLED_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandPhase {
    Optimistic,
    Confirmed,
    Reverted,
    Expired,
    Superseded,
}

/// What one observation did to the in-flight commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub confirmed: Vec<CommandId>,
    pub expired: Vec<CommandId>,
    /// Fields where the observed value was held back in favor of the
    /// optimistic one.
    pub suppressed: Vec<String>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.expired.is_empty() && self.suppressed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct OverlayEntry {
    value: Value,
    expires_at: Instant,
    owner: CommandId,
}

#[derive(Debug, Clone)]
struct InFlight {
    keys: BTreeSet<String>,
    predicate: Predicate,
    expires_at: Instant,
    /// State of older commands before this one took fields from them,
    /// kept so a failed write can hand the fields back.
    displaced: Vec<Displaced>,
}

#[derive(Debug, Clone)]
struct Displaced {
    owner: CommandId,
    before: Box<InFlight>,
    entries: Vec<(String, OverlayEntry)>,
}

/// Optimistic state for a single device.
#[derive(Debug)]
pub struct OptimisticOverlay {
    guard: Duration,
    entries: HashMap<String, OverlayEntry>,
    commands: BTreeMap<CommandId, InFlight>,
    settled: VecDeque<(CommandId, CommandPhase)>,
    next_id: CommandId,
}

impl OptimisticOverlay {
    pub fn new(guard: Duration) -> Self {
        Self {
            guard,
            entries: HashMap::new(),
            commands: BTreeMap::new(),
            settled: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn guard(&self) -> Duration {
        self.guard
    }

    // ── Issue ────────────────────────────────────────────────────────

    /// Start a command: overlay `optimistic` for the guard window and
    /// confirm it with `predicate`.
    ///
    /// Fields already owned by an older command move to this one. The
    /// older command keeps waiting for its remaining fields, or is
    /// superseded if none are left.
    pub fn begin(&mut self, optimistic: Status, predicate: Predicate, now: Instant) -> CommandId {
        let id = self.next_id;
        self.next_id += 1;
        let expires_at = now + self.guard;

        let mut displaced: BTreeMap<CommandId, Displaced> = BTreeMap::new();
        for key in optimistic.keys() {
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            let owner = entry.owner;
            let Some(older) = self.commands.get(&owner) else {
                continue;
            };
            displaced
                .entry(owner)
                .or_insert_with(|| Displaced {
                    owner,
                    before: Box::new(older.clone()),
                    entries: Vec::new(),
                })
                .entries
                .push((key.clone(), entry.clone()));
        }

        for (&owner, taken) in &displaced {
            let Some(older) = self.commands.get(&owner) else {
                continue;
            };
            let remaining: BTreeSet<String> = older
                .keys
                .iter()
                .filter(|key| !taken.entries.iter().any(|(t, _)| t == *key))
                .cloned()
                .collect();
            if remaining.is_empty() {
                self.commands.remove(&owner);
                self.settle(owner, CommandPhase::Superseded);
                debug!(command = owner, by = id, "optimistic command superseded");
            } else {
                let predicate = self.owned_fields_predicate(owner, &remaining);
                if let Some(older) = self.commands.get_mut(&owner) {
                    older.keys = remaining;
                    older.predicate = predicate;
                }
            }
        }

        let keys: BTreeSet<String> = optimistic.keys().cloned().collect();
        for (key, value) in optimistic {
            self.entries.insert(
                key,
                OverlayEntry {
                    value,
                    expires_at,
                    owner: id,
                },
            );
        }
        self.commands.insert(
            id,
            InFlight {
                keys,
                predicate,
                expires_at,
                displaced: displaced.into_values().collect(),
            },
        );
        id
    }

    /// Equality predicate over the optimistic values `owner` still holds
    /// for `keys`.
    fn owned_fields_predicate(&self, owner: CommandId, keys: &BTreeSet<String>) -> Predicate {
        let expected: Status = keys
            .iter()
            .filter_map(|key| {
                let entry = self.entries.get(key)?;
                (entry.owner == owner).then(|| (key.clone(), entry.value.clone()))
            })
            .collect();
        Predicate::fields_equal(expected)
    }

    // ── Read ─────────────────────────────────────────────────────────

    /// Optimistic value for `key`, if one is live at `now`.
    pub fn value(&self, key: &str, now: Instant) -> Option<Value> {
        let entry = self.entries.get(key)?.clone();
        (now < entry.expires_at).then_some(entry.value)
    }

    /// `truth` with every live optimistic value laid over it.
    pub fn overlay_onto(&self, truth: &Status, now: Instant) -> Status {
        let mut visible = truth.clone();
        for (key, entry) in &self.entries {
            if now < entry.expires_at {
                visible.insert(key.clone(), entry.value.clone());
            }
        }
        visible
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands still awaiting confirmation.
    pub fn in_flight(&self) -> usize {
        self.commands.len()
    }

    /// Earliest guard expiry among in-flight commands.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.commands.values().map(|c| c.expires_at).min()
    }

    pub fn phase(&self, id: CommandId) -> Option<CommandPhase> {
        if self.commands.contains_key(&id) {
            return Some(CommandPhase::Optimistic);
        }
        self.settled
            .iter()
            .rev()
            .find(|(settled, _)| *settled == id)
            .map(|(_, phase)| *phase)
    }

    // ── Reconcile ────────────────────────────────────────────────────

    /// Check every in-flight command against an observed status.
    pub fn observe(&mut self, truth: &Status, now: Instant) -> Reconciliation {
        let mut outcome = Reconciliation::default();
        let ids: Vec<CommandId> = self.commands.keys().copied().collect();

        for id in ids {
            let Some(command) = self.commands.get(&id) else {
                continue;
            };
            if command.predicate.check(truth) {
                self.finish(id, CommandPhase::Confirmed);
                outcome.confirmed.push(id);
            } else if now >= command.expires_at {
                self.finish(id, CommandPhase::Expired);
                outcome.expired.push(id);
            } else {
                outcome.suppressed.extend(command.keys.iter().filter_map(|key| {
                    let entry = self.entries.get(key)?;
                    let held_back = truth.get(key).is_some_and(|got| !values_match(got, &entry.value));
                    held_back.then(|| key.clone())
                }));
            }
        }

        if !outcome.is_empty() {
            debug!(
                confirmed = outcome.confirmed.len(),
                expired = outcome.expired.len(),
                suppressed = ?outcome.suppressed,
                "overlay reconciled"
            );
        }
        outcome
    }

    /// Expire commands whose guard window has passed without an
    /// observation.
    pub fn expire(&mut self, now: Instant) -> Vec<CommandId> {
        let due: Vec<CommandId> = self
            .commands
            .iter()
            .filter(|(_, command)| now >= command.expires_at)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.finish(*id, CommandPhase::Expired);
        }
        due
    }

    /// Drop a command whose write failed and give back any fields it took
    /// from commands that are still waiting. Returns `false` if the
    /// command had already settled.
    pub fn revert(&mut self, id: CommandId) -> bool {
        let Some(command) = self.commands.remove(&id) else {
            return false;
        };

        let owned: BTreeSet<String> = command
            .keys
            .iter()
            .filter(|key| self.entries.get(*key).is_some_and(|e| e.owner == id))
            .cloned()
            .collect();
        for key in &owned {
            self.entries.remove(key);
        }

        for displaced in command.displaced {
            self.restore(id, displaced, &owned);
        }

        self.settle(id, CommandPhase::Reverted);
        debug!(command = id, "optimistic command reverted");
        true
    }

    fn restore(&mut self, reverted: CommandId, displaced: Displaced, freed: &BTreeSet<String>) {
        let owner = displaced.owner;
        let alive = self.commands.contains_key(&owner);
        let superseded_by_reverted = self.phase(owner) == Some(CommandPhase::Superseded);
        if !alive && !superseded_by_reverted {
            return;
        }

        let returned: Vec<(String, OverlayEntry)> = displaced
            .entries
            .into_iter()
            .filter(|(key, _)| freed.contains(key) && !self.entries.contains_key(key))
            .collect();
        if returned.is_empty() {
            return;
        }

        let mut keys = self
            .commands
            .get(&owner)
            .map(|c| c.keys.clone())
            .unwrap_or_default();
        for (key, entry) in returned {
            keys.insert(key.clone());
            self.entries.insert(key, entry);
        }

        let mut restored = *displaced.before;
        if keys != restored.keys {
            restored.predicate = self.owned_fields_predicate(owner, &keys);
        }
        restored.keys = keys;

        if !alive {
            self.settled.retain(|(id, _)| *id != owner);
        }
        self.commands.insert(owner, restored);
        debug!(command = owner, reverted, "fields returned to earlier command");
    }

    fn finish(&mut self, id: CommandId, phase: CommandPhase) {
        if self.commands.remove(&id).is_none() {
            return;
        }
        self.entries.retain(|_, entry| entry.owner != id);
        self.settle(id, phase);
    }

    fn settle(&mut self, id: CommandId, phase: CommandPhase) {
        if self.settled.len() == SETTLED_HISTORY {
            self.settled.pop_front();
        }
        self.settled.push_back((id, phase));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    const GUARD: Duration = Duration::from_secs(12);

    fn status(value: Value) -> Status {
        value.as_object().unwrap().clone()
    }

    fn begin_fields(overlay: &mut OptimisticOverlay, fields: Value, now: Instant) -> CommandId {
        let fields = status(fields);
        overlay.begin(fields.clone(), Predicate::fields_equal(fields), now)
    }

    #[test]
    fn optimistic_value_wins_until_confirmed() {
        let now = Instant::now();
        let mut overlay = OptimisticOverlay::new(GUARD);
        let truth = status(json!({"H00": 0, "H02": 20}));
        let id = begin_fields(&mut overlay, json!({"H00": 1}), now);

        assert_eq!(overlay.value("H00", now), Some(json!(1)));
        assert_eq!(
            overlay.overlay_onto(&truth, now),
            status(json!({"H00": 1, "H02": 20}))
        );

        let stale = overlay.observe(&truth, now + Duration::from_secs(1));
        assert_eq!(stale.suppressed, vec!["H00".to_string()]);
        assert_eq!(overlay.phase(id), Some(CommandPhase::Optimistic));

        let confirmed = overlay.observe(&status(json!({"H00": 1})), now + Duration::from_secs(2));
        assert_eq!(confirmed.confirmed, vec![id]);
        assert_eq!(overlay.phase(id), Some(CommandPhase::Confirmed));
        assert_eq!(overlay.value("H00", now), None);
        assert!(overlay.is_empty());
    }

    #[test]
    fn guard_window_lapse_lets_truth_through() {
        let now = Instant::now();
        let mut overlay = OptimisticOverlay::new(GUARD);
        let id = begin_fields(&mut overlay, json!({"H02": 80}), now);

        let later = now + GUARD;
        assert_eq!(overlay.value("H02", later), None);
        let outcome = overlay.observe(&status(json!({"H02": 20})), later);
        assert_eq!(outcome.expired, vec![id]);
        assert_eq!(overlay.phase(id), Some(CommandPhase::Expired));
    }

    #[test]
    fn expire_without_observation() {
        let now = Instant::now();
        let mut overlay = OptimisticOverlay::new(GUARD);
        let id = begin_fields(&mut overlay, json!({"H06": 1}), now);

        assert!(overlay.expire(now + Duration::from_secs(5)).is_empty());
        assert_eq!(overlay.next_expiry(), Some(now + GUARD));
        assert_eq!(overlay.expire(now + GUARD), vec![id]);
        assert!(overlay.is_empty());
    }

    #[test]
    fn disjoint_commands_do_not_interfere() {
        let now = Instant::now();
        let mut overlay = OptimisticOverlay::new(GUARD);
        let speed = begin_fields(&mut overlay, json!({"H02": 60}), now);
        let light = begin_fields(&mut overlay, json!({"H0B": 1}), now);

        let outcome = overlay.observe(&status(json!({"H02": 60, "H0B": 0})), now);
        assert_eq!(outcome.confirmed, vec![speed]);
        assert_eq!(overlay.phase(light), Some(CommandPhase::Optimistic));
        assert_eq!(overlay.value("H0B", now), Some(json!(1)));
    }

    #[test]
    fn newer_command_supersedes_same_field() {
        let now = Instant::now();
        let mut overlay = OptimisticOverlay::new(GUARD);
        let first = begin_fields(&mut overlay, json!({"H02": 30}), now);
        let second = begin_fields(&mut overlay, json!({"H02": 70}), now);

        assert_eq!(overlay.phase(first), Some(CommandPhase::Superseded));
        assert_eq!(overlay.value("H02", now), Some(json!(70)));

        // The relay catching up with the first command is not a confirmation.
        let outcome = overlay.observe(&status(json!({"H02": 30})), now);
        assert!(outcome.confirmed.is_empty());
        assert_eq!(outcome.suppressed, vec!["H02".to_string()]);
        assert_eq!(overlay.phase(second), Some(CommandPhase::Optimistic));
    }

    #[test]
    fn partial_supersession_keeps_remaining_fields() {
        let now = Instant::now();
        let mut overlay = OptimisticOverlay::new(GUARD);
        let turn_on = begin_fields(&mut overlay, json!({"H00": 1, "H02": 40}), now);
        let speed = begin_fields(&mut overlay, json!({"H02": 90}), now);

        assert_eq!(overlay.phase(turn_on), Some(CommandPhase::Optimistic));
        let outcome = overlay.observe(&status(json!({"H00": 1, "H02": 40})), now);
        assert_eq!(outcome.confirmed, vec![turn_on]);
        assert_eq!(overlay.value("H02", now), Some(json!(90)));
        assert_eq!(overlay.phase(speed), Some(CommandPhase::Optimistic));
    }

    #[test]
    fn revert_clears_fields_immediately() {
        let now = Instant::now();
        let mut overlay = OptimisticOverlay::new(GUARD);
        let truth = status(json!({"H00": 0, "H02": 20}));
        let id = begin_fields(&mut overlay, json!({"H00": 1, "H02": 55}), now);

        assert!(overlay.revert(id));
        assert_eq!(overlay.phase(id), Some(CommandPhase::Reverted));
        assert_eq!(overlay.overlay_onto(&truth, now), truth);
        assert!(!overlay.revert(id));
    }

    #[test]
    fn revert_hands_fields_back_to_superseded_command() {
        let now = Instant::now();
        let mut overlay = OptimisticOverlay::new(GUARD);
        let first = begin_fields(&mut overlay, json!({"H02": 30}), now);
        let second = begin_fields(&mut overlay, json!({"H02": 70}), now);
        assert_eq!(overlay.phase(first), Some(CommandPhase::Superseded));

        assert!(overlay.revert(second));
        assert_eq!(overlay.phase(first), Some(CommandPhase::Optimistic));
        assert_eq!(overlay.value("H02", now), Some(json!(30)));

        let outcome = overlay.observe(&status(json!({"H02": 30})), now);
        assert_eq!(outcome.confirmed, vec![first]);
    }

    #[test]
    fn custom_predicate_can_ignore_optimistic_fields() {
        let now = Instant::now();
        let mut overlay = OptimisticOverlay::new(GUARD);
        let id = overlay.begin(
            status(json!({"H00": 1, "H06": 1})),
            Predicate::fields_equal(status(json!({"H06": 1}))),
            now,
        );
        let outcome = overlay.observe(&status(json!({"H00": 0, "H06": 1})), now);
        assert_eq!(outcome.confirmed, vec![id]);
        assert_eq!(overlay.value("H00", now), None);
    }
}
