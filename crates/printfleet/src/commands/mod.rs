//! Subcommand handlers.

pub mod config_cmd;
pub mod devices;
pub mod ranges;
pub mod run;
pub mod settings;
pub mod util;
