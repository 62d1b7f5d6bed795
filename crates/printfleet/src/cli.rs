//! Clap derive structures for the `printfleet` binary.
//!
//! Defines the command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// printfleet -- telemetry agent for a fleet of network printers
#[derive(Debug, Parser)]
#[command(
    name = "printfleet",
    version,
    about = "Discover network printers and keep their telemetry",
    long_about = "Listens for printer announcements, scans configured ranges,\n\
        identifies devices through the query gateway, and keeps tiered\n\
        page-count history.",
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
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "PRINTFLEET_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "PRINTFLEET_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Skip prompts and accept defaults
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the discovery and telemetry agent until interrupted
    Run(RunArgs),

    /// Inspect and validate discovery settings documents
    Settings(SettingsArgs),

    /// Expand IP range definitions
    Ranges(RangesArgs),

    /// Inspect devices recorded in the state file
    #[command(alias = "dev", alias = "d")]
    Devices(DevicesArgs),

    /// Manage printfleet configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Run ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Print every published event as a JSON line on stdout
    #[arg(long)]
    pub print_events: bool,

    /// Override the state file location
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

// ── Settings ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub command: SettingsCommand,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    /// Parse, migrate, and validate a settings document (JSON)
    Validate {
        /// Settings file, or '-' for stdin
        file: PathBuf,
    },
}

// ── Ranges ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct RangesArgs {
    #[command(subcommand)]
    pub command: RangesCommand,
}

#[derive(Debug, Subcommand)]
pub enum RangesCommand {
    /// Print every address the range text covers
    Expand {
        /// Range file, or '-' for stdin
        file: PathBuf,

        /// Refuse range text that covers more addresses than this
        #[arg(long, default_value = "4096")]
        max: usize,
    },
}

// ── Devices ──────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DevicesArgs {
    #[command(subcommand)]
    pub command: DevicesCommand,
}

#[derive(Debug, Subcommand)]
pub enum DevicesCommand {
    /// List devices, most recently seen first
    #[command(alias = "ls")]
    List(DeviceListArgs),

    /// Show one device by serial
    Get {
        /// Device serial number
        serial: String,
    },
}

#[derive(Debug, Args)]
pub struct DeviceListArgs {
    /// Only saved (tracked) devices
    #[arg(long)]
    pub saved: bool,

    /// Include hidden devices
    #[arg(long, short = 'a')]
    pub all: bool,

    /// Case-insensitive manufacturer substring
    #[arg(long, short = 'm')]
    pub manufacturer: Option<String>,

    /// Max results
    #[arg(long, short = 'l')]
    pub limit: Option<usize>,

    /// Read this state file instead of the configured one
    #[arg(long)]
    pub state_file: Option<PathBuf>,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Create initial config file with guided setup
    Init,

    /// Display current resolved configuration
    Show,

    /// Print the config file path
    Path,

    /// Store the gateway API key in the system keyring
    SetApiKey,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
