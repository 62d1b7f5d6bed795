//! Device command handlers, read straight from the agent's state file.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::SecondsFormat;
use tabled::Tabled;

use printfleet_core::{
    CoreError, Device, DeviceFilter, DeviceRegistry, MemoryStore, RetentionPolicy, SystemClock,
};

use crate::cli::{DeviceListArgs, DevicesArgs, DevicesCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::util;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "Serial")]
    serial: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Manufacturer")]
    manufacturer: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Saved")]
    saved: String,
    #[tabled(rename = "Last Seen")]
    last_seen: String,
}

impl From<&Device> for DeviceRow {
    fn from(d: &Device) -> Self {
        Self {
            serial: d.serial.clone(),
            ip: d.ip.to_string(),
            manufacturer: d.attributes.manufacturer.clone().unwrap_or_default(),
            model: d.attributes.model.clone().unwrap_or_default(),
            location: d.attributes.location.clone().unwrap_or_default(),
            saved: if d.is_saved { "yes" } else { "" }.into(),
            last_seen: d.last_seen.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

fn device_detail(d: &Device) -> String {
    let attrs = &d.attributes;
    let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".into());
    let locks = d
        .locked_fields
        .iter()
        .map(|l| l.field.to_string())
        .collect::<Vec<_>>();

    output::detail(&[
        ("Serial", d.serial.clone()),
        ("IP", d.ip.to_string()),
        ("Manufacturer", opt(&attrs.manufacturer)),
        ("Model", opt(&attrs.model)),
        ("Hostname", opt(&attrs.hostname)),
        ("Firmware", opt(&attrs.firmware)),
        ("MAC", opt(&attrs.mac_address)),
        ("Location", opt(&attrs.location)),
        ("Asset", opt(&attrs.asset_number)),
        ("Visible", d.visible.to_string()),
        ("Saved", d.is_saved.to_string()),
        ("Found via", opt(&d.discovery_method)),
        ("First seen", d.first_seen.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("Last seen", d.last_seen.to_rfc3339_opts(SecondsFormat::Secs, true)),
        (
            "Locked",
            if locks.is_empty() {
                "-".into()
            } else {
                locks.join(", ")
            },
        ),
    ])
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(args: DevicesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        DevicesCommand::List(list) => {
            let store = open_state(global, list.state_file.clone())?;
            let devices = store.list(&list_filter(&list)).await?;
            let rendered = output::render_list(
                &global.output,
                &devices,
                |d| DeviceRow::from(d),
                |d| d.serial.clone(),
            )?;
            output::print_output(&rendered, global.quiet);
            Ok(())
        }

        DevicesCommand::Get { serial } => {
            let store = open_state(global, None)?;
            let device = store
                .get(&serial)
                .await?
                .ok_or(CoreError::DeviceNotFound { serial })?;
            let rendered =
                output::render_single(&global.output, &device, device_detail, |d| d.serial.clone())?;
            output::print_output(&rendered, global.quiet);
            Ok(())
        }
    }
}

fn list_filter(args: &DeviceListArgs) -> DeviceFilter {
    DeviceFilter {
        is_saved: args.saved.then_some(true),
        visible: (!args.all).then_some(true),
        manufacturer: args.manufacturer.clone(),
        limit: args.limit,
        ..DeviceFilter::default()
    }
}

fn open_state(global: &GlobalOpts, explicit: Option<PathBuf>) -> Result<MemoryStore, CliError> {
    let path = match explicit {
        Some(path) => path,
        None => util::load_config(global)?
            .engine
            .state_file
            .unwrap_or_else(printfleet_config::default_state_path),
    };
    if !path.exists() {
        return Err(CliError::NoStateFile {
            path: path.display().to_string(),
        });
    }
    Ok(MemoryStore::open(
        path,
        Arc::new(SystemClock),
        RetentionPolicy::default(),
    )?)
}
