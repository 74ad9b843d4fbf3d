//! `fansync devices`: the account's device directory.

use serde::Serialize;
use tabled::Tabled;

use fansync_core::{DeviceProfile, FanController};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

#[derive(Serialize)]
struct DeviceEntry {
    id: String,
    name: Option<String>,
    owner: Option<String>,
    role: Option<String>,
    profile: DeviceProfile,
}

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Firmware")]
    firmware: String,
    #[tabled(rename = "Role")]
    role: String,
}

fn row(d: &DeviceEntry) -> DeviceRow {
    let dash = |v: Option<&str>| v.unwrap_or("-").to_owned();
    DeviceRow {
        id: d.id.clone(),
        name: dash(d.name.as_deref()),
        model: dash(d.profile.model.as_deref()),
        firmware: dash(d.profile.firmware_version.as_deref()),
        role: dash(d.role.as_deref()),
    }
}

pub fn handle(controller: &FanController, global: &GlobalOpts) -> Result<(), CliError> {
    let entries: Vec<DeviceEntry> = controller
        .devices()
        .into_iter()
        .map(|info| DeviceEntry {
            profile: controller.device_profile(&info.device),
            name: info.display_name().map(String::from),
            id: info.device,
            owner: info.owner,
            role: info.role,
        })
        .collect();

    let out = output::render_list(&global.output, &entries, row, |d| d.id.clone())?;
    output::print_output(&out, global.quiet);
    Ok(())
}
