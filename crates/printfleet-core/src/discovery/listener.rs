// ── Passive UDP listeners ──
//
// One receive loop per protocol. Sockets are built with socket2 so the
// well-known ports can be shared with other responders on the host.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::packets;
use super::sink::AddressSink;
use crate::error::CoreError;
use crate::model::DiscoveryProtocol;

const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const LLMNR_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 252);

const MDNS_PORT: u16 = 5353;
const SSDP_PORT: u16 = 1900;
const WSD_PORT: u16 = 3702;
const SNMP_TRAP_PORT: u16 = 162;
const LLMNR_PORT: u16 = 5355;

const RECV_BUFFER: usize = 9000;

/// A background source of candidate addresses.
#[async_trait]
pub trait DiscoveryListener: Send + Sync {
    fn protocol(&self) -> DiscoveryProtocol;

    /// Receive until `cancel` fires. Returning early is an error the
    /// manager logs; the listener is then considered stopped.
    async fn run(&self, sink: AddressSink, cancel: CancellationToken) -> Result<(), CoreError>;
}

/// Builds the listener for a passive protocol.
pub trait ListenerFactory: Send + Sync {
    fn create(&self, protocol: DiscoveryProtocol) -> Option<Arc<dyn DiscoveryListener>>;
}

/// Real sockets on the standard ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpListenerFactory;

impl ListenerFactory for UdpListenerFactory {
    fn create(&self, protocol: DiscoveryProtocol) -> Option<Arc<dyn DiscoveryListener>> {
        UdpListener::standard(protocol).map(|l| Arc::new(l) as Arc<dyn DiscoveryListener>)
    }
}

// ── UdpListener ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UdpListener {
    protocol: DiscoveryProtocol,
    bind: SocketAddrV4,
    group: Option<Ipv4Addr>,
}

impl UdpListener {
    /// Standard port and multicast group for `protocol`. `None` for the
    /// active scanner, which has no socket.
    pub fn standard(protocol: DiscoveryProtocol) -> Option<Self> {
        let (port, group) = match protocol {
            DiscoveryProtocol::Mdns => (MDNS_PORT, Some(MDNS_GROUP)),
            DiscoveryProtocol::Ssdp => (SSDP_PORT, Some(SSDP_GROUP)),
            DiscoveryProtocol::WsDiscovery => (WSD_PORT, Some(SSDP_GROUP)),
            DiscoveryProtocol::SnmpTrap => (SNMP_TRAP_PORT, None),
            DiscoveryProtocol::Llmnr => (LLMNR_PORT, Some(LLMNR_GROUP)),
            DiscoveryProtocol::ActiveScan => return None,
        };
        Some(Self {
            protocol,
            bind: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
            group,
        })
    }

    /// Listener on an explicit address, without multicast membership.
    pub fn on(protocol: DiscoveryProtocol, bind: SocketAddrV4) -> Self {
        Self {
            protocol,
            bind,
            group: None,
        }
    }

    pub fn bind_socket(&self) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(self.bind).into())?;
        if let Some(group) = self.group {
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
    }

    /// Receive loop over an already bound socket.
    pub async fn serve(
        &self,
        socket: UdpSocket,
        sink: &AddressSink,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        self.announce(&socket).await;

        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = received.map_err(|e| self.failure(&e))?;
                    let Some(datagram) = buf.get(..len) else { continue };
                    for addr in extract_addresses(self.protocol, datagram, from) {
                        sink.offer(IpAddr::V4(addr));
                    }
                }
            }
        }
        Ok(())
    }

    /// Solicit responses from printers already on the network.
    async fn announce(&self, socket: &UdpSocket) {
        let (payload, target) = match self.protocol {
            DiscoveryProtocol::Ssdp => (
                packets::ssdp_search_request(),
                SocketAddrV4::new(SSDP_GROUP, SSDP_PORT),
            ),
            DiscoveryProtocol::WsDiscovery => (
                packets::wsd_probe(&uuid::Uuid::new_v4().to_string()),
                SocketAddrV4::new(SSDP_GROUP, WSD_PORT),
            ),
            _ => return,
        };
        if self.group.is_none() {
            return;
        }
        if let Err(e) = socket.send_to(&payload, target).await {
            warn!(protocol = %self.protocol, error = %e, "initial probe failed (non-fatal)");
        }
    }

    fn failure(&self, err: &io::Error) -> CoreError {
        CoreError::Listener {
            protocol: self.protocol.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl DiscoveryListener for UdpListener {
    fn protocol(&self) -> DiscoveryProtocol {
        self.protocol
    }

    async fn run(&self, sink: AddressSink, cancel: CancellationToken) -> Result<(), CoreError> {
        let socket = self.bind_socket().map_err(|e| self.failure(&e))?;
        info!(protocol = %self.protocol, bind = %self.bind, "listener bound");
        let result = self.serve(socket, &sink, &cancel).await;
        debug!(protocol = %self.protocol, "listener exiting");
        result
    }
}

/// Candidate printer addresses carried by one datagram.
pub fn extract_addresses(
    protocol: DiscoveryProtocol,
    datagram: &[u8],
    from: SocketAddr,
) -> Vec<Ipv4Addr> {
    let SocketAddr::V4(from) = from else {
        return Vec::new();
    };
    let source = *from.ip();

    match protocol {
        DiscoveryProtocol::Mdns => {
            if packets::mdns_mentions_printer(datagram) {
                vec![source]
            } else {
                Vec::new()
            }
        }
        DiscoveryProtocol::Ssdp => {
            packets::ssdp_addresses(&String::from_utf8_lossy(datagram), source)
        }
        DiscoveryProtocol::WsDiscovery => {
            packets::wsd_addresses(&String::from_utf8_lossy(datagram))
        }
        DiscoveryProtocol::SnmpTrap => vec![source],
        DiscoveryProtocol::Llmnr => {
            let names = packets::llmnr_query_names(datagram);
            if names.iter().any(|n| packets::looks_like_printer_name(n)) {
                vec![source]
            } else {
                Vec::new()
            }
        }
        DiscoveryProtocol::ActiveScan => Vec::new(),
    }
}
