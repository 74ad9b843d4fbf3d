// ── Per-device status store ──
//
// Last known device status ("truth") plus the optimistic overlay for
// each device. Observers see the visible status, truth with live
// optimistic values laid over it, through a `watch` channel that only
// fires when the visible status actually changes.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::trace;

use fansync_api::Status;

use crate::command::CommandPlan;
use crate::device::OVERLAY_KEYS;
use crate::overlay::{CommandId, CommandPhase, OptimisticOverlay, Reconciliation};
use crate::stream::StatusStream;

struct DeviceSlot {
    truth: Status,
    overlay: OptimisticOverlay,
    view: watch::Sender<Arc<Status>>,
}

impl DeviceSlot {
    fn new(guard: Duration) -> Self {
        let (view, _) = watch::channel(Arc::new(Status::new()));
        Self {
            truth: Status::new(),
            overlay: OptimisticOverlay::new(guard),
            view,
        }
    }

    fn visible(&self, now: Instant) -> Status {
        self.overlay.overlay_onto(&self.truth, now)
    }

    fn publish(&self, now: Instant) -> bool {
        let visible = self.visible(now);
        self.view.send_if_modified(|current| {
            if **current == visible {
                return false;
            }
            *current = Arc::new(visible);
            true
        })
    }
}

/// Thread-safe store keyed by device id.
pub struct StatusStore {
    guard: Duration,
    devices: DashMap<String, DeviceSlot>,
    /// Signalled whenever a command begins, so the expiry task can
    /// recompute its deadline.
    pub(crate) begun: Notify,
}

impl StatusStore {
    /// `guard` is how long optimistic values hold without confirmation.
    pub fn new(guard: Duration) -> Self {
        Self {
            guard,
            devices: DashMap::new(),
            begun: Notify::new(),
        }
    }

    fn with_slot<T>(&self, device: &str, f: impl FnOnce(&mut DeviceSlot) -> T) -> T {
        let mut slot = self
            .devices
            .entry(device.to_owned())
            .or_insert_with(|| DeviceSlot::new(self.guard));
        f(slot.value_mut())
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Show `plan`'s optimistic values until confirmed, reverted or expired.
    ///
    /// Only fan and light control fields are overlaid; anything else in
    /// the plan waits for the device to report it.
    pub fn begin(&self, device: &str, plan: &CommandPlan) -> CommandId {
        let optimistic: Status = plan
            .optimistic
            .iter()
            .filter(|(key, _)| OVERLAY_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let id = self.with_slot(device, |slot| {
            let now = Instant::now();
            let id = slot
                .overlay
                .begin(optimistic, plan.predicate.clone(), now);
            slot.publish(now);
            id
        });
        self.begun.notify_one();
        id
    }

    /// Merge an observed (possibly partial) status into the device's
    /// truth and reconcile in-flight commands against the result.
    pub fn observe(&self, device: &str, status: &Status) -> Reconciliation {
        self.with_slot(device, |slot| {
            let now = Instant::now();
            for (key, value) in status {
                slot.truth.insert(key.clone(), value.clone());
            }
            let outcome = slot.overlay.observe(&slot.truth, now);
            let published = slot.publish(now);
            trace!(device, fields = status.len(), published, "status observed");
            outcome
        })
    }

    /// Drop a failed command's optimistic values.
    pub fn revert(&self, device: &str, id: CommandId) -> bool {
        self.with_slot(device, |slot| {
            let reverted = slot.overlay.revert(id);
            slot.publish(Instant::now());
            reverted
        })
    }

    /// Expire commands whose guard window has passed.
    pub fn expire(&self, device: &str) -> Vec<CommandId> {
        self.with_slot(device, |slot| {
            let now = Instant::now();
            let expired = slot.overlay.expire(now);
            slot.publish(now);
            expired
        })
    }

    /// Expire lapsed commands on every device. Returns how many expired.
    pub fn expire_all(&self) -> usize {
        self.device_ids()
            .iter()
            .filter(|device| self.in_flight(device) > 0)
            .map(|device| self.expire(device).len())
            .sum()
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn phase(&self, device: &str, id: CommandId) -> Option<CommandPhase> {
        self.devices.get(device)?.overlay.phase(id)
    }

    /// Earliest guard expiry for the device, if it has commands in flight.
    pub fn next_expiry(&self, device: &str) -> Option<Instant> {
        self.devices.get(device)?.overlay.next_expiry()
    }

    /// Earliest guard expiry across all devices.
    pub fn next_expiry_any(&self) -> Option<Instant> {
        self.devices
            .iter()
            .filter_map(|slot| slot.overlay.next_expiry())
            .min()
    }

    pub fn in_flight(&self, device: &str) -> usize {
        self.devices
            .get(device)
            .map_or(0, |slot| slot.overlay.in_flight())
    }

    /// Truth with live optimistic values applied.
    pub fn visible(&self, device: &str) -> Option<Status> {
        let slot = self.devices.get(device)?;
        Some(slot.visible(Instant::now()))
    }

    /// One field of the visible status.
    pub fn get(&self, device: &str, key: &str) -> Option<Value> {
        let slot = self.devices.get(device)?;
        let now = Instant::now();
        slot.overlay
            .value(key, now)
            .or_else(|| slot.truth.get(key).cloned())
    }

    /// Last observed status, without optimistic values.
    pub fn truth(&self, device: &str) -> Option<Status> {
        Some(self.devices.get(device)?.truth.clone())
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Follow the device's visible status.
    pub fn subscribe(&self, device: &str) -> StatusStream {
        self.with_slot(device, |slot| StatusStream::new(slot.view.subscribe()))
    }
}
