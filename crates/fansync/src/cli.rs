//! Clap derive structures for the `fansync` CLI.
//!
//! Defines the command tree, global flags, and shared value enums.

use clap::{Args, Parser, Subcommand, ValueEnum};

use fansync_core::{Direction, PresetMode};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// fansync -- control FanSync ceiling fans from the command line
#[derive(Debug, Parser)]
#[command(
    name = "fansync",
    version,
    about = "Control FanSync ceiling fans and lights from the command line",
    long_about = "Talks to the FanSync cloud relay over its WebSocket API.\n\n\
        Writes are applied optimistically and reported as confirmed once the\n\
        fan echoes the new state, or unconfirmed if it stays silent.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Account profile to use
    #[arg(long, short = 'p', env = "FANSYNC_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Account email (overrides profile)
    #[arg(long, global = true)]
    pub email: Option<String>,

    /// Device id to address (defaults to the first registered device)
    #[arg(long, short = 'd', env = "FANSYNC_DEVICE", global = true)]
    pub device: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "FANSYNC_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Skip TLS certificate verification for the session endpoint
    #[arg(long, short = 'k', env = "FANSYNC_INSECURE", global = true)]
    pub insecure: bool,

    /// HTTP login timeout in seconds
    #[arg(long, env = "FANSYNC_HTTP_TIMEOUT", global = true)]
    pub http_timeout: Option<u64>,

    /// WebSocket request timeout in seconds
    #[arg(long, env = "FANSYNC_WS_TIMEOUT", global = true)]
    pub ws_timeout: Option<u64>,
}

// ── Output Enum ──────────────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List fans registered to the account
    #[command(alias = "ls")]
    Devices,

    /// Show the current fan and light state
    Status,

    /// Turn the fan on
    On(OnArgs),

    /// Turn the fan off
    Off,

    /// Set fan speed in percent (0 turns the fan off)
    Speed(SpeedArgs),

    /// Set rotation direction
    Direction(DirectionArgs),

    /// Set the preset mode
    Preset(PresetArgs),

    /// Control the fan light
    Light(LightArgs),

    /// Stream state changes until interrupted
    Watch(WatchArgs),

    /// Print a connection diagnostics snapshot
    Diagnostics,

    /// Inspect configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Fan ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct OnArgs {
    /// Speed in percent
    #[arg(long, short = 's', value_parser = clap::value_parser!(u8).range(1..=100))]
    pub speed: Option<u8>,

    /// Preset mode to start in
    #[arg(long)]
    pub preset: Option<PresetArg>,
}

#[derive(Debug, Args)]
pub struct SpeedArgs {
    /// Speed in percent
    #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
    pub percentage: u8,
}

#[derive(Debug, Args)]
pub struct DirectionArgs {
    pub direction: DirectionArg,
}

#[derive(Debug, Args)]
pub struct PresetArgs {
    pub mode: PresetArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DirectionArg {
    Forward,
    Reverse,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Forward => Self::Forward,
            DirectionArg::Reverse => Self::Reverse,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PresetArg {
    Normal,
    FreshAir,
}

impl From<PresetArg> for PresetMode {
    fn from(arg: PresetArg) -> Self {
        match arg {
            PresetArg::Normal => Self::Normal,
            PresetArg::FreshAir => Self::FreshAir,
        }
    }
}

// ── Light ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct LightArgs {
    #[command(subcommand)]
    pub command: LightCommand,
}

#[derive(Debug, Subcommand)]
pub enum LightCommand {
    /// Turn the light on
    On {
        /// Brightness in percent
        #[arg(long, short = 'b', value_parser = clap::value_parser!(u8).range(1..=100))]
        brightness: Option<u8>,

        /// Brightness as an 8-bit level (0-255)
        #[arg(long, conflicts_with = "brightness")]
        level: Option<u8>,
    },

    /// Turn the light off
    Off,

    /// Set brightness in percent (0 turns the light off)
    Brightness {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        percentage: u8,
    },
}

// ── Watch ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Stop after this many seconds
    #[arg(long)]
    pub seconds: Option<u64>,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Show the merged configuration (passwords redacted)
    Show,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
