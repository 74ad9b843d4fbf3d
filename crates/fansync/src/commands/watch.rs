//! `fansync watch`: stream visible state changes.

use std::time::Duration;

use tracing::info;

use fansync_core::{FanController, FanState, Status};

use crate::cli::{GlobalOpts, OutputFormat, WatchArgs};
use crate::error::CliError;
use crate::output;

fn line(format: &OutputFormat, device: &str, status: &Status) -> Result<String, CliError> {
    let state = FanState::from_status(status);
    Ok(match format {
        OutputFormat::Json | OutputFormat::JsonCompact => output::render_json(
            &serde_json::json!({ "device": device, "state": state, "status": status }),
            true,
        )?,
        OutputFormat::Plain => super::status::on_off(state.is_on).into(),
        OutputFormat::Table => format!(
            "{device}  fan {} {}% {}  light {} {}%",
            super::status::on_off(state.is_on),
            state.percentage,
            state.direction,
            super::status::on_off(state.light_on),
            state.light_brightness,
        ),
    })
}

pub async fn handle(
    controller: &FanController,
    args: &WatchArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let device = super::target_device(controller, global)?;
    let mut stream = controller.subscribe(Some(&device))?;
    let mut connection = controller.connection_state();

    output::print_output(&line(&global.output, &device, stream.current())?, global.quiet);

    let deadline = tokio::time::sleep(
        args.seconds
            .map_or(Duration::from_secs(u64::from(u32::MAX)), Duration::from_secs),
    );
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => break,
            () = &mut deadline => break,
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                info!(device = %device, state = %state, "connection state changed");
            }
            next = stream.changed() => {
                let Some(status) = next else { break };
                output::print_output(&line(&global.output, &device, &status)?, global.quiet);
            }
        }
    }
    Ok(())
}
