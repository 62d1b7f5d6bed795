//! Range subcommand handlers.

use std::net::Ipv4Addr;

use tabled::Tabled;

use printfleet_core::discovery::parse_ranges;

use crate::cli::{GlobalOpts, RangesArgs, RangesCommand};
use crate::error::CliError;
use crate::output;

use super::util;

#[derive(Tabled)]
struct AddressRow {
    #[tabled(rename = "Address")]
    address: String,
}

pub fn handle(args: RangesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        RangesCommand::Expand { file, max } => {
            let text = util::read_input(&file)?;
            let addresses: Vec<Ipv4Addr> = parse_ranges(&text, max).map_err(|errors| {
                CliError::InvalidRanges {
                    problems: errors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("\n"),
                }
            })?;
            tracing::debug!(count = addresses.len(), "expanded ranges");

            let rendered = output::render_list(
                &global.output,
                &addresses,
                |a| AddressRow {
                    address: a.to_string(),
                },
                ToString::to_string,
            )?;
            output::print_output(&rendered, global.quiet);
            Ok(())
        }
    }
}
