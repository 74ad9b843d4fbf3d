//! `fansync config`: inspect configuration without connecting.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::config;
use crate::error::CliError;
use crate::output;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(
                &fansync_config::config_path().display().to_string(),
                global.quiet,
            );
            Ok(())
        }
        ConfigCommand::Show => {
            let mut cfg = fansync_config::load_config()?;
            for profile in cfg.profiles.values_mut() {
                *profile = config::redacted(profile);
            }
            let out = match global.output {
                OutputFormat::Json => output::render_json(&cfg, false)?,
                OutputFormat::JsonCompact => output::render_json(&cfg, true)?,
                OutputFormat::Table | OutputFormat::Plain => cfg.to_toml()?,
            };
            output::print_output(&out, global.quiet);
            Ok(())
        }
    }
}
