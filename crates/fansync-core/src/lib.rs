// fansync-core: Fan and light domain layer between fansync-api and consumers.

pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod overlay;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::{CommandPlan, FanCommand};
pub use config::ControllerConfig;
pub use controller::{ApplyOutcome, FanController};
pub use device::{Direction, FanState, PresetMode};
pub use error::CoreError;
pub use overlay::{CommandId, CommandPhase, OptimisticOverlay, Predicate, Reconciliation};
pub use store::StatusStore;
pub use stream::StatusStream;

// Wire-level types consumers commonly need alongside the controller.
pub use fansync_api::{
    ClientConfig, ConnectionState, Credentials, DeviceInfo, DeviceProfile, RetryPolicy, Status,
    TlsMode,
};
