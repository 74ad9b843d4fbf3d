//! Command dispatch: bridges CLI args -> controller calls -> output formatting.

pub mod config_cmd;
pub mod control;
pub mod devices;
pub mod diagnostics;
pub mod status;
pub mod watch;

use fansync_core::device::brightness_to_pct;
use fansync_core::{FanCommand, FanController};

use crate::cli::{Command, GlobalOpts, LightCommand};
use crate::error::CliError;

/// Dispatch a connection-bound command to the appropriate handler.
pub async fn dispatch(
    cmd: Command,
    controller: &FanController,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match cmd {
        Command::Devices => devices::handle(controller, global),
        Command::Status => status::handle(controller, global),
        Command::On(args) => {
            let command = FanCommand::TurnOn {
                percentage: args.speed,
                preset: args.preset.map(Into::into),
            };
            control::handle(controller, command, global).await
        }
        Command::Off => control::handle(controller, FanCommand::TurnOff, global).await,
        Command::Speed(args) => {
            control::handle(controller, FanCommand::SetPercentage(args.percentage), global).await
        }
        Command::Direction(args) => {
            control::handle(controller, FanCommand::SetDirection(args.direction.into()), global)
                .await
        }
        Command::Preset(args) => {
            control::handle(controller, FanCommand::SetPreset(args.mode.into()), global).await
        }
        Command::Light(args) => {
            let command = match args.command {
                LightCommand::On { brightness, level } => FanCommand::LightOn {
                    brightness_pct: brightness.or_else(|| level.map(|l| brightness_to_pct(Some(l)))),
                },
                LightCommand::Off => FanCommand::LightOff,
                LightCommand::Brightness { percentage } => FanCommand::SetBrightness(percentage),
            };
            control::handle(controller, command, global).await
        }
        Command::Watch(args) => watch::handle(controller, &args, global).await,
        Command::Diagnostics => diagnostics::handle(controller, global),
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => unreachable!(),
    }
}

/// Device named by `--device`, or the account's default device.
pub(crate) fn target_device(
    controller: &FanController,
    global: &GlobalOpts,
) -> Result<String, CliError> {
    global
        .device
        .clone()
        .or_else(|| controller.client().device_id())
        .ok_or_else(|| CliError::DeviceNotFound {
            identifier: "<default>".into(),
        })
}
