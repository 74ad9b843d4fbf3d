// ── Controller ──
//
// Full lifecycle management for a FanSync account. Composes the wire
// client with the status store, reconciles pushes and polls against
// optimistic writes, and runs the background tasks.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fansync_api::{Client, ConnectionState, DeviceInfo, DeviceProfile, Status};

use crate::command::FanCommand;
use crate::config::ControllerConfig;
use crate::device::{Direction, FanState, PresetMode};
use crate::error::CoreError;
use crate::overlay::{CommandId, CommandPhase};
use crate::store::StatusStore;
use crate::stream::StatusStream;

/// How an optimistic write ended from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApplyOutcome {
    /// The device reported the intended state.
    Confirmed,
    /// Still unconfirmed after polling; the optimistic values hold until
    /// the guard window lapses.
    Unconfirmed,
    /// A later command took over every field before confirmation.
    Superseded,
    /// The guard window lapsed before confirmation.
    Expired,
}

// ── Controller ───────────────────────────────────────────────────────

/// The main facade for FanSync devices.
///
/// Cheaply cloneable via `Arc<ControllerInner>`.
#[derive(Clone)]
pub struct FanController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    client: Client,
    store: Arc<StatusStore>,
    background: Mutex<Option<Background>>,
}

struct Background {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl FanController {
    pub fn new(config: ControllerConfig) -> Self {
        let client = Client::new(config.client.clone(), config.credentials.clone());
        let store = Arc::new(StatusStore::new(config.guard_window));
        Self {
            inner: Arc::new(ControllerInner {
                config,
                client,
                store,
                background: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// The underlying wire client, for metrics and diagnostics.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.inner.store
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect, load every device's status, and start the background
    /// tasks (overlay expiry, periodic refresh).
    ///
    /// A no-op when already connected.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let mut background = self.inner.background.lock().await;
        if background.is_some() {
            return Ok(());
        }

        let client = &self.inner.client;
        client.connect().await?;

        let store = Arc::clone(&self.inner.store);
        let default_device = client.device_id();
        client.register_push_callback(move |update| {
            let Some(device) = update.device.or_else(|| default_device.clone()) else {
                debug!("push without a device and no default device; dropped");
                return;
            };
            store.observe(&device, &update.status);
        });

        if let Err(e) = self.refresh().await {
            client.clear_push_callback();
            client.disconnect().await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(expiry_task(
            Arc::clone(&self.inner.store),
            cancel.clone(),
        ))];
        if let Some(period) = self.inner.config.fallback_poll.filter(|p| !p.is_zero()) {
            tasks.push(tokio::spawn(refresh_task(self.clone(), period, cancel.clone())));
        }
        *background = Some(Background { cancel, tasks });

        info!(devices = client.device_ids().len(), "controller connected");
        Ok(())
    }

    /// Stop background tasks and close the connection. Idempotent.
    ///
    /// Also aborts a `connect` that is still handshaking or loading status.
    pub async fn disconnect(&self) {
        // Closing the client first releases a connect holding `background`.
        self.inner.client.disconnect().await;

        let background = self.inner.background.lock().await.take();
        if let Some(background) = background {
            background.cancel.cancel();
            for handle in background.tasks {
                let _ = handle.await;
            }
        }
        self.inner.client.clear_push_callback();
        self.inner.client.disconnect().await;
        debug!("controller disconnected");
    }

    /// Connect, run `f`, and disconnect regardless of its outcome.
    pub async fn oneshot<F, Fut, T>(config: ControllerConfig, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(FanController) -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let controller = Self::new(config);
        controller.connect().await?;
        let result = f(controller.clone()).await;
        controller.disconnect().await;
        result
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.client.connection_state()
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Poll every known device and reconcile the results.
    ///
    /// Keeps going past a failing device; the first error is returned.
    pub async fn refresh(&self) -> Result<(), CoreError> {
        let mut first_error = None;
        for device in self.inner.client.device_ids() {
            if let Err(e) = self.poll(&device).await {
                warn!(device = %device, error = %e, "status refresh failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn poll(&self, device: &str) -> Result<(), CoreError> {
        let status = self.inner.client.get_status(Some(device)).await?;
        self.inner.store.observe(device, &status);
        Ok(())
    }

    /// Visible status: last known truth with live optimistic values.
    pub fn status(&self, device: Option<&str>) -> Result<Status, CoreError> {
        let device = self.resolve_device(device)?;
        Ok(self.inner.store.visible(&device).unwrap_or_default())
    }

    /// One field of the visible status.
    pub fn get(&self, device: Option<&str>, key: &str) -> Result<Option<Value>, CoreError> {
        let device = self.resolve_device(device)?;
        Ok(self.inner.store.get(&device, key))
    }

    pub fn state(&self, device: Option<&str>) -> Result<FanState, CoreError> {
        Ok(FanState::from_status(&self.status(device)?))
    }

    /// Follow the visible status of a device.
    pub fn subscribe(&self, device: Option<&str>) -> Result<StatusStream, CoreError> {
        let device = self.resolve_device(device)?;
        Ok(self.inner.store.subscribe(&device))
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.inner.client.device_ids()
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.inner.client.devices()
    }

    pub fn device_profile(&self, device: &str) -> DeviceProfile {
        self.inner.client.device_profile(device)
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Run one optimistic write.
    ///
    /// The intended values are visible immediately. If the write fails
    /// they are withdrawn before the error is returned. Otherwise the
    /// command is confirmed by the ack's embedded status, a push, or the
    /// confirmation polls, whichever comes first.
    pub async fn apply(
        &self,
        device: Option<&str>,
        command: FanCommand,
    ) -> Result<ApplyOutcome, CoreError> {
        let device = self.resolve_device(device)?;
        let store = &self.inner.store;
        let plan = command.plan();
        let id = store.begin(&device, &plan);
        debug!(device = %device, command = command.name(), id, "optimistic write");

        match self.inner.client.set(Some(&device), plan.payload).await {
            Err(e) => {
                store.revert(&device, id);
                warn!(device = %device, command = command.name(), error = %e, "write failed; reverted");
                return Err(e.into());
            }
            Ok(Some(status)) => {
                store.observe(&device, &status);
            }
            Ok(None) => {}
        }

        if let Some(outcome) = self.outcome(&device, id) {
            return Ok(outcome);
        }
        Ok(self.confirm(&device, id).await)
    }

    /// Poll until the command settles or the confirmation policy runs out.
    async fn confirm(&self, device: &str, id: CommandId) -> ApplyOutcome {
        let policy = self.inner.config.confirm;
        let settled = policy
            .run(
                move |attempt| async move {
                    if let Err(e) = self.poll(device).await {
                        debug!(device, attempt, error = %e, "confirmation poll failed");
                    }
                    self.outcome(device, id).ok_or(())
                },
                |_| true,
            )
            .await;

        settled.unwrap_or_else(|()| {
            debug!(device, id, "write not confirmed yet; holding optimistic values");
            ApplyOutcome::Unconfirmed
        })
    }

    /// `None` while the command is still waiting.
    fn outcome(&self, device: &str, id: CommandId) -> Option<ApplyOutcome> {
        match self.inner.store.phase(device, id)? {
            CommandPhase::Optimistic => None,
            CommandPhase::Confirmed => Some(ApplyOutcome::Confirmed),
            CommandPhase::Superseded => Some(ApplyOutcome::Superseded),
            CommandPhase::Expired => Some(ApplyOutcome::Expired),
            CommandPhase::Reverted => Some(ApplyOutcome::Unconfirmed),
        }
    }

    fn resolve_device(&self, device: Option<&str>) -> Result<String, CoreError> {
        let client = &self.inner.client;
        match device {
            Some(id) => {
                let known = client.device_ids();
                if known.is_empty() || known.iter().any(|k| k == id) {
                    Ok(id.to_owned())
                } else {
                    Err(CoreError::DeviceNotFound {
                        identifier: id.to_owned(),
                    })
                }
            }
            None => client.device_id().ok_or_else(|| CoreError::DeviceNotFound {
                identifier: "<default>".into(),
            }),
        }
    }

    // ── Convenience ──────────────────────────────────────────────────

    pub async fn turn_on(
        &self,
        device: Option<&str>,
        percentage: Option<u8>,
        preset: Option<PresetMode>,
    ) -> Result<ApplyOutcome, CoreError> {
        self.apply(device, FanCommand::TurnOn { percentage, preset })
            .await
    }

    pub async fn turn_off(&self, device: Option<&str>) -> Result<ApplyOutcome, CoreError> {
        self.apply(device, FanCommand::TurnOff).await
    }

    pub async fn set_percentage(
        &self,
        device: Option<&str>,
        percentage: u8,
    ) -> Result<ApplyOutcome, CoreError> {
        self.apply(device, FanCommand::SetPercentage(percentage))
            .await
    }

    pub async fn set_direction(
        &self,
        device: Option<&str>,
        direction: Direction,
    ) -> Result<ApplyOutcome, CoreError> {
        self.apply(device, FanCommand::SetDirection(direction))
            .await
    }

    pub async fn set_preset(
        &self,
        device: Option<&str>,
        preset: PresetMode,
    ) -> Result<ApplyOutcome, CoreError> {
        self.apply(device, FanCommand::SetPreset(preset)).await
    }

    pub async fn light_on(
        &self,
        device: Option<&str>,
        brightness_pct: Option<u8>,
    ) -> Result<ApplyOutcome, CoreError> {
        self.apply(device, FanCommand::LightOn { brightness_pct })
            .await
    }

    pub async fn light_off(&self, device: Option<&str>) -> Result<ApplyOutcome, CoreError> {
        self.apply(device, FanCommand::LightOff).await
    }

    pub async fn set_brightness(
        &self,
        device: Option<&str>,
        brightness_pct: u8,
    ) -> Result<ApplyOutcome, CoreError> {
        self.apply(device, FanCommand::SetBrightness(brightness_pct))
            .await
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Periodically poll every device.
async fn refresh_task(controller: FanController, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = controller.refresh().await {
                    warn!(error = %e, "periodic refresh failed");
                }
            }
        }
    }
}

/// Withdraw optimistic values whose guard window lapsed without any
/// observation, so subscribers snap back to the real state.
async fn expiry_task(store: Arc<StatusStore>, cancel: CancellationToken) {
    loop {
        let next = store.next_expiry_any();
        let deadline = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = store.begun.notified() => {}
            () = tokio::time::sleep_until(deadline), if next.is_some() => {
                let expired = store.expire_all();
                if expired > 0 {
                    debug!(expired, "optimistic values expired");
                }
            }
        }
    }
}
