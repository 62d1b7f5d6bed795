// ── Active range scanner ──
//
// Sweeps the configured ranges with cheap liveness queries and feeds
// responders to the handler. The period lives in a watch channel: a
// change reschedules the next pass but never interrupts the current one.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sink::AddressSink;
use crate::model::SettingsSource;
use crate::query::{DeviceQuery, QueryMode, with_deadline};

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanPass {
    pub targets: usize,
    pub responders: usize,
}

pub struct ActiveScanner {
    query: Arc<dyn DeviceQuery>,
    settings: Arc<dyn SettingsSource>,
    sink: AddressSink,
    timeout: Duration,
}

impl ActiveScanner {
    pub fn new(
        query: Arc<dyn DeviceQuery>,
        settings: Arc<dyn SettingsSource>,
        sink: AddressSink,
        timeout: Duration,
    ) -> Self {
        Self {
            query,
            settings,
            sink,
            timeout,
        }
    }

    /// One pass over the current targets. Stops early on cancellation.
    pub async fn sweep(&self, cancel: &CancellationToken) -> ScanPass {
        let settings = self.settings.current();
        let targets = match settings.scan_targets() {
            Ok(targets) => targets,
            Err(errors) => {
                warn!(errors = errors.len(), "scan ranges invalid, skipping pass");
                return ScanPass::default();
            }
        };
        if targets.is_empty() {
            debug!("no scan targets configured");
            return ScanPass::default();
        }

        let total = targets.len();
        let concurrency = settings.concurrency.max(1);
        let responders = stream::iter(targets)
            .map(|ip| self.probe(IpAddr::V4(ip)))
            .buffer_unordered(concurrency)
            .take_until(cancel.cancelled())
            .filter(|alive| std::future::ready(*alive))
            .count()
            .await;

        info!(targets = total, responders, "active scan pass complete");
        ScanPass {
            targets: total,
            responders,
        }
    }

    async fn probe(&self, addr: IpAddr) -> bool {
        let alive = with_deadline(
            addr,
            self.timeout,
            self.query.query(addr, QueryMode::Liveness, None, self.timeout),
        )
        .await
        .is_ok();
        if alive {
            self.sink.deliver(addr).await;
        }
        alive
    }

    /// Sweep immediately, then once per period until cancelled.
    pub async fn run(self, mut period: watch::Receiver<Duration>, cancel: CancellationToken) {
        let mut period_open = true;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.sweep(&cancel).await;
            let pass_end = Instant::now();
            let mut next = pass_end + *period.borrow_and_update();

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep_until(next) => break,
                    changed = period.changed(), if period_open => {
                        if changed.is_err() {
                            period_open = false;
                        } else {
                            let every = *period.borrow_and_update();
                            debug!(period_secs = every.as_secs(), "scan period changed");
                            next = pass_end + every;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::discovery::sink::tests::CountingHandler;
    use crate::model::{DiscoveryProtocol, DiscoverySettings, SharedSettings};
    use crate::testing::FakeQuery;
    use tokio_util::task::TaskTracker;

    fn scanner(query: Arc<FakeQuery>, handler: Arc<CountingHandler>) -> ActiveScanner {
        let settings = DiscoverySettings {
            manual_ranges: true,
            ranges_text: "10.0.0.1-4".into(),
            concurrency: 2,
            ..DiscoverySettings::default()
        };
        let sink = AddressSink::new(DiscoveryProtocol::ActiveScan, None, handler, TaskTracker::new());
        ActiveScanner::new(
            query,
            Arc::new(SharedSettings::new(settings)),
            sink,
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn responders_reach_the_handler() {
        let query = Arc::new(FakeQuery::default());
        query.answer("10.0.0.2", "S2", "M404");
        query.answer("10.0.0.4", "S4", "M404");
        let handler = Arc::new(CountingHandler::default());

        let pass = scanner(query.clone(), handler.clone())
            .sweep(&CancellationToken::new())
            .await;

        assert_eq!(pass, ScanPass { targets: 4, responders: 2 });
        let mut seen: Vec<_> = handler.seen.lock().unwrap().iter().map(|(ip, _)| *ip).collect();
        seen.sort();
        assert_eq!(seen, vec!["10.0.0.2".parse::<IpAddr>().unwrap(), "10.0.0.4".parse().unwrap()]);
        assert!(query.calls().iter().all(|(_, mode)| *mode == QueryMode::Liveness));
    }

    #[tokio::test(start_paused = true)]
    async fn period_change_reschedules_next_pass() {
        let query = Arc::new(FakeQuery::default());
        let handler = Arc::new(CountingHandler::default());
        let (tx, rx) = watch::channel(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scanner(query.clone(), handler).run(rx, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(query.calls().len(), 4);

        tx.send(Duration::from_secs(60)).unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(query.calls().len(), 8);

        cancel.cancel();
        task.await.unwrap();
    }
}
