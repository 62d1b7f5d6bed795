//! Shared helpers for command handlers.

use std::io::Read;
use std::path::Path;

use printfleet_config::Config;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load configuration from `--config` (or the canonical path) + environment.
pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let cfg = match global.config.as_deref() {
        Some(path) => printfleet_config::load_config_from(Some(path))?,
        None => printfleet_config::load_config()?,
    };
    Ok(cfg)
}

/// Read a whole input file; `-` means stdin.
pub fn read_input(path: &Path) -> Result<String, CliError> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    Ok(std::fs::read_to_string(path)?)
}

/// Read and parse a JSON document; `-` means stdin.
pub fn read_json(path: &Path) -> Result<serde_json::Value, CliError> {
    let contents = read_input(path)?;
    serde_json::from_str(&contents).map_err(|e| CliError::Validation {
        field: path.display().to_string(),
        reason: format!("invalid JSON: {e}"),
    })
}

/// Prompt for confirmation, auto-approving if `--yes` was passed.
pub fn confirm(message: &str, yes_flag: bool) -> Result<bool, CliError> {
    if yes_flag {
        return Ok(true);
    }
    dialoguer::Confirm::new()
        .with_prompt(message)
        .default(false)
        .interact()
        .map_err(CliError::prompt)
}
