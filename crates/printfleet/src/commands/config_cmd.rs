//! Config subcommand handlers.

use std::path::PathBuf;

use dialoguer::{Input, Select};
use owo_colors::OwoColorize;

use printfleet_config::{Config, KEYRING_SERVICE};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

use super::util;

const MASKED: &str = "********";

fn target_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(printfleet_config::config_path)
}

fn store_in_keyring(gateway: &str, key: &str) -> Result<(), CliError> {
    let entry =
        keyring::Entry::new(KEYRING_SERVICE, gateway).map_err(|e| CliError::Validation {
            field: "keyring".into(),
            reason: format!("failed to access keyring: {e}"),
        })?;
    entry.set_password(key).map_err(|e| CliError::Validation {
        field: "keyring".into(),
        reason: format!("failed to store API key in keyring: {e}"),
    })
}

fn prompt_api_key() -> Result<String, CliError> {
    let key = rpassword::prompt_password("API key: ").map_err(CliError::prompt)?;
    if key.is_empty() {
        return Err(CliError::Validation {
            field: "api_key".into(),
            reason: "API key cannot be empty".into(),
        });
    }
    Ok(key)
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&target_path(global).display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let mut cfg = util::load_config(global)?;
            if cfg.gateway.api_key.is_some() {
                cfg.gateway.api_key = Some(MASKED.into());
            }
            let rendered = match global.output {
                OutputFormat::Table | OutputFormat::Plain => {
                    toml::to_string_pretty(&cfg).map_err(|e| CliError::Validation {
                        field: "config".into(),
                        reason: format!("failed to serialize config: {e}"),
                    })?
                }
                _ => output::render_single(&global.output, &cfg, |_| String::new(), |_| String::new())?,
            };
            output::print_output(&rendered, global.quiet);
            Ok(())
        }

        ConfigCommand::Init => init(global),

        ConfigCommand::SetApiKey => {
            let cfg = util::load_config(global)?;
            let key = prompt_api_key()?;
            store_in_keyring(&cfg.gateway.name, &key)?;
            if !global.quiet {
                eprintln!("API key stored in keyring entry {KEYRING_SERVICE}/{}", cfg.gateway.name);
            }
            Ok(())
        }
    }
}

// ── Init: guided setup ──────────────────────────────────────────────

fn init(global: &GlobalOpts) -> Result<(), CliError> {
    let path = target_path(global);
    if path.exists()
        && !util::confirm(&format!("Overwrite {}?", path.display()), global.yes)?
    {
        return Ok(());
    }

    let mut cfg = Config::default();
    if !global.yes {
        let color = output::should_color(&global.color);
        if color {
            eprintln!("{}", "printfleet configuration".bold());
        } else {
            eprintln!("printfleet configuration");
        }
        eprintln!("   Config path: {}\n", path.display());

        cfg.gateway.url = Input::new()
            .with_prompt("Query gateway URL")
            .default(cfg.gateway.url.clone())
            .interact_text()
            .map_err(CliError::prompt)?;

        let choices = &[
            "No API key",
            "Store API key in system keyring (recommended)",
            "Save API key to config file (plaintext)",
        ];
        let selection = Select::new()
            .with_prompt("Gateway authentication")
            .items(choices)
            .default(0)
            .interact()
            .map_err(CliError::prompt)?;

        match selection {
            1 => {
                store_in_keyring(&cfg.gateway.name, &prompt_api_key()?)?;
                eprintln!("   API key stored in system keyring");
            }
            2 => cfg.gateway.api_key = Some(prompt_api_key()?),
            _ => {}
        }
    }

    match global.config.as_deref() {
        Some(explicit) => printfleet_config::save_config_to(&cfg, explicit)?,
        None => {
            printfleet_config::save_config(&cfg)?;
        }
    }
    if !global.quiet {
        eprintln!("Wrote {}", path.display());
    }
    Ok(())
}
