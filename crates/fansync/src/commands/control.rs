//! Fan and light writes: `on`, `off`, `speed`, `direction`, `preset`, `light`.

use serde::Serialize;
use tracing::warn;

use fansync_core::{ApplyOutcome, FanCommand, FanController};

use super::status::{self, StatusView};
use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

#[derive(Serialize)]
struct ControlResult {
    command: &'static str,
    outcome: ApplyOutcome,
    #[serde(flatten)]
    view: StatusView,
}

pub async fn handle(
    controller: &FanController,
    command: FanCommand,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let device = super::target_device(controller, global)?;
    let outcome = controller.apply(Some(&device), command).await?;
    if outcome == ApplyOutcome::Unconfirmed {
        warn!(device = %device, command = command.name(), "fan has not confirmed the change yet");
    }

    let result = ControlResult {
        command: command.name(),
        outcome,
        view: StatusView::capture(controller, device)?,
    };
    let out = output::render_single(
        &global.output,
        &result,
        |r| format!("{} {}\n{}", r.command, r.outcome, status::detail(&r.view)),
        |r| r.outcome.to_string(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}
