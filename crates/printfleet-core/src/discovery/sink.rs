// ── Address sink ──
//
// The single entry point listeners push addresses into. Throttling
// happens here, on the listener's task; enrichment is spawned so a slow
// device never stalls a receive loop.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::task::TaskTracker;
use tracing::trace;

use crate::model::DiscoveryProtocol;
use crate::throttle::ThrottleMap;

/// Whatever consumes discovered addresses (normally the enrichment
/// pipeline).
#[async_trait]
pub trait AddressHandler: Send + Sync {
    async fn handle(&self, addr: IpAddr, protocol: DiscoveryProtocol);
}

#[derive(Clone)]
pub struct AddressSink {
    protocol: DiscoveryProtocol,
    throttle: Option<Arc<ThrottleMap>>,
    handler: Arc<dyn AddressHandler>,
    tracker: TaskTracker,
}

impl AddressSink {
    pub fn new(
        protocol: DiscoveryProtocol,
        throttle: Option<Arc<ThrottleMap>>,
        handler: Arc<dyn AddressHandler>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            protocol,
            throttle,
            handler,
            tracker,
        }
    }

    pub fn protocol(&self) -> DiscoveryProtocol {
        self.protocol
    }

    /// Offer one address. Returns whether enrichment was scheduled.
    pub fn offer(&self, addr: IpAddr) -> bool {
        if addr.is_unspecified() || addr.is_multicast() {
            return false;
        }
        if self.throttle.as_ref().is_some_and(|t| !t.admit(addr)) {
            trace!(ip = %addr, protocol = %self.protocol, "throttled");
            return false;
        }

        let handler = self.handler.clone();
        let protocol = self.protocol;
        self.tracker
            .spawn(async move { handler.handle(addr, protocol).await });
        true
    }

    /// Run the handler inline, bypassing the throttle. The active
    /// scanner already bounds its own concurrency.
    pub async fn deliver(&self, addr: IpAddr) {
        self.handler.handle(addr, self.protocol).await;
    }
}
