//! `fansync diagnostics`: connection health snapshot.

use fansync_core::FanController;

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

pub fn handle(controller: &FanController, global: &GlobalOpts) -> Result<(), CliError> {
    let snapshot = controller.client().diagnostics();
    let out = output::render_single(
        &global.output,
        &snapshot,
        |d| {
            let m = &d.metrics;
            output::detail_lines(&[
                ("Connection", d.connection_state.clone()),
                ("Devices", d.device_ids.join(", ")),
                ("Push", if d.push_enabled { "enabled" } else { "disabled" }.into()),
                ("Pushes received", d.push.total.to_string()),
                ("Commands", m.total_commands.to_string()),
                ("Failure rate", format!("{:.1}%", m.failure_rate * 100.0)),
                ("Timeout rate", format!("{:.1}%", m.timeout_rate * 100.0)),
                ("Avg latency", format!("{:.1}ms", m.avg_latency_ms)),
                ("Reconnects", m.websocket_reconnects.to_string()),
                ("Circuit", d.circuit_breaker.state.to_string()),
                ("Pending requests", d.pending_requests.to_string()),
                ("Recent failures", d.recent_failures.len().to_string()),
            ])
        },
        |d| d.connection_state.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}
