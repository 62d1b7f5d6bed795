//! The agent daemon: start discovery and schedules, stop on Ctrl-C.

use std::sync::Arc;

use owo_colors::OwoColorize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use printfleet_core::{Agent, BroadcastSink, FleetEvent, GatewayQuery, UdpListenerFactory};

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;
use crate::output;

use super::util;

pub async fn handle(args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = util::load_config(global)?;
    let mut engine = printfleet_config::to_engine_config(&cfg)?;
    if let Some(path) = args.state_file {
        engine.state_file = Some(path);
    }
    let settings = printfleet_config::discovery_settings(&cfg)?;
    let client = printfleet_config::build_query_client(&cfg)?;
    match client.health().await {
        Ok(health) => info!(
            gateway = %client.base_url(),
            status = %health.status,
            version = health.version.as_deref().unwrap_or("unknown"),
            "query gateway reachable"
        ),
        Err(e) => warn!(gateway = %client.base_url(), error = %e, "query gateway not reachable yet (non-fatal)"),
    }

    let events = Arc::new(BroadcastSink::default());
    let printer = args
        .print_events
        .then(|| tokio::spawn(print_events(events.subscribe())));

    let agent = Agent::with_memory_store(
        engine,
        settings,
        Arc::new(GatewayQuery::new(client)),
        events,
        Arc::new(UdpListenerFactory),
    )?;
    agent.start().await?;

    if !global.quiet {
        let running = agent
            .manager()
            .running()
            .await
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let listeners = if running.is_empty() {
            "none".to_owned()
        } else {
            running.join(", ")
        };
        if output::should_color(&global.color) {
            eprintln!("{} gateway {}", "printfleet".bold().green(), cfg.gateway.url.cyan());
            eprintln!("   discovery: {}", listeners.yellow());
        } else {
            eprintln!("printfleet gateway {}", cfg.gateway.url);
            eprintln!("   discovery: {listeners}");
        }
    }

    let interrupted = tokio::signal::ctrl_c().await;
    info!("shutting down");
    agent.shutdown().await;
    stop_printer(printer).await;
    interrupted?;
    Ok(())
}

/// One JSON object per line on stdout.
async fn print_events(mut rx: broadcast::Receiver<Arc<FleetEvent>>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&*event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "event not printable"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn stop_printer(printer: Option<JoinHandle<()>>) {
    if let Some(handle) = printer {
        handle.abort();
        let _ = handle.await;
    }
}
