//! Settings subcommand handlers.

use printfleet_core::DiscoverySettings;

use crate::cli::{GlobalOpts, SettingsArgs, SettingsCommand};
use crate::error::CliError;
use crate::output;

use super::util;

pub fn handle(args: SettingsArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        SettingsCommand::Validate { file } => {
            let document = util::read_json(&file)?;
            let settings = DiscoverySettings::from_document(document)?;
            let rendered = output::render_single(
                &global.output,
                &settings,
                settings_detail,
                |s| format!("valid (version {})", s.version),
            )?;
            output::print_output(&rendered, global.quiet);
            Ok(())
        }
    }
}

fn settings_detail(settings: &DiscoverySettings) -> String {
    let Ok(serde_json::Value::Object(map)) = serde_json::to_value(settings) else {
        return String::new();
    };
    let pairs: Vec<(&str, String)> = map
        .iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) if s.is_empty() => "-".to_owned(),
                serde_json::Value::String(s) => s.replace('\n', ", "),
                serde_json::Value::Null => "-".to_owned(),
                other => other.to_string(),
            };
            (k.as_str(), value)
        })
        .collect();
    output::detail(&pairs)
}
