//! `fansync status`: the visible state of one fan.

use serde::Serialize;

use fansync_core::device::pct_to_brightness;
use fansync_core::{FanController, FanState, Status};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

#[derive(Serialize)]
pub(crate) struct StatusView {
    pub device: String,
    pub state: FanState,
    /// Optimistic writes still waiting for the fan.
    pub pending: usize,
    pub status: Status,
}

impl StatusView {
    pub fn capture(controller: &FanController, device: String) -> Result<Self, CliError> {
        let status = controller.status(Some(&device))?;
        Ok(Self {
            state: FanState::from_status(&status),
            pending: controller.store().in_flight(&device),
            device,
            status,
        })
    }
}

pub(crate) fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

pub(crate) fn detail(view: &StatusView) -> String {
    let s = &view.state;
    output::detail_lines(&[
        ("Device", view.device.clone()),
        ("Fan", on_off(s.is_on).into()),
        ("Speed", format!("{}%", s.percentage)),
        ("Direction", s.direction.to_string()),
        (
            "Preset",
            s.preset.map_or_else(|| "-".into(), |p| p.to_string()),
        ),
        ("Light", on_off(s.light_on).into()),
        (
            "Brightness",
            format!(
                "{}% (level {})",
                s.light_brightness,
                pct_to_brightness(s.light_brightness)
            ),
        ),
        ("Pending", view.pending.to_string()),
    ])
}

pub fn handle(controller: &FanController, global: &GlobalOpts) -> Result<(), CliError> {
    let device = super::target_device(controller, global)?;
    let view = StatusView::capture(controller, device)?;
    let out = output::render_single(&global.output, &view, detail, |v| {
        on_off(v.state.is_on).into()
    })?;
    output::print_output(&out, global.quiet);
    Ok(())
}
