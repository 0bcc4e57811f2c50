use std::cmp;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use futures::{pin_mut, select, FutureExt, StreamExt};
use ipnetwork::IpNetwork;
use log::{debug, trace, warn};
use net2::TcpBuilder;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, DelayQueue, Duration, Instant};

use crate::config::PeerConfig;
use crate::utils::get_host_address;

const TCP_INIT_TIMEOUT_MS: u16 = 1000;
const MAX_BACKOFF_SECS: u32 = 60;

/// A peer handed back to the poller after its session ended.
/// `immediate` skips backoff entirely: used when the only reason the session
/// ended was a local policy decision (ASN4 downgrade), not a network fault.
#[derive(Debug, Clone)]
pub struct Reschedule {
    pub config: Arc<PeerConfig>,
    pub immediate: bool,
}

#[derive(Clone)]
pub struct PollerTx(mpsc::UnboundedSender<Reschedule>);

impl From<mpsc::UnboundedSender<Reschedule>> for PollerTx {
    fn from(tx: mpsc::UnboundedSender<Reschedule>) -> Self {
        Self(tx)
    }
}

impl PollerTx {
    pub fn send(
        &self,
        config: Arc<PeerConfig>,
    ) -> Result<(), mpsc::error::SendError<Reschedule>> {
        self.0.send(Reschedule {
            config,
            immediate: false,
        })
    }

    pub fn send_immediate(
        &self,
        config: Arc<PeerConfig>,
    ) -> Result<(), mpsc::error::SendError<Reschedule>> {
        self.0.send(Reschedule {
            config,
            immediate: true,
        })
    }
}

pub type PollerRx = mpsc::UnboundedReceiver<Reschedule>;

#[derive(Debug)]
pub struct IdlePeer(Arc<PeerConfig>);

impl IdlePeer {
    pub fn new(config: Arc<PeerConfig>) -> Self {
        Self(config)
    }

    pub fn get_config(&self) -> Arc<PeerConfig> {
        Arc::clone(&self.0)
    }

    /// Initiate an outbound TCP connection to this peer.
    ///
    /// Sessions are always locally-initiated: there is no listener
    /// accepting inbound connections, so the source address is always
    /// the unspecified address matching the peer's family.
    async fn connect(&self) -> Result<(TcpStream, Arc<PeerConfig>), io::Error> {
        if let Some(remote_ip) = get_host_address(&self.0.remote_ip) {
            let peer_addr = SocketAddr::new(remote_ip, self.0.dest_port);
            let (builder, source_addr) = match peer_addr {
                SocketAddr::V4(_) => (
                    TcpBuilder::new_v4()?,
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                ),
                SocketAddr::V6(_) => (
                    TcpBuilder::new_v6()?,
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
                ),
            };
            builder.reuse_address(true)?;
            builder.bind(source_addr)?;
            let connect = TcpStream::connect_std(builder.to_tcp_stream()?, &peer_addr);

            return match timeout(Duration::from_millis(TCP_INIT_TIMEOUT_MS.into()), connect).await?
            {
                Ok(stream) => Ok((stream, self.0.clone())),
                Err(err) => Err(err),
            };
        }
        unreachable!();
    }
}

impl fmt::Display for IdlePeer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<IdlePeer {}>", self.0.remote_ip)
    }
}

/// Stores idle peers and schedules outbound re-connection attempts.
/// There is no listener: every BGP session is initiated by us.
pub struct Poller {
    idle_peers: HashMap<IpNetwork, IdlePeer>,
    rx: PollerRx,
    interval: Duration,
    delay_queue: DelayQueue<IpAddr>,
    /// Seconds to wait before the *next* reconnect attempt, per peer network.
    /// Grows as `next = 1 + 1.2*prev` (capped at MAX_BACKOFF_SECS) on failure,
    /// resets to 0 on a successful connect.
    backoff: HashMap<IpNetwork, u32>,
}

impl Poller {
    pub fn new(interval: u32 /* seconds */, rx: PollerRx) -> Self {
        let mut delay_queue = DelayQueue::with_capacity(4);
        // Add an empty IP in a year so delay_queue is never empty
        delay_queue.insert_at(
            IpAddr::from(Ipv4Addr::new(0, 0, 0, 0)),
            Instant::now() + Duration::from_secs(31_536_000),
        );
        Self {
            idle_peers: HashMap::new(),
            interval: Duration::from_secs(interval.into()),
            delay_queue,
            backoff: HashMap::new(),
            rx,
        }
    }

    fn next_backoff(&mut self, network: IpNetwork) -> Duration {
        let prev = self.backoff.get(&network).copied().unwrap_or(0);
        let next = cmp::min(1 + (prev as f64 * 1.2) as u32, MAX_BACKOFF_SECS);
        self.backoff.insert(network, next);
        Duration::from_secs(next.into())
    }

    fn reset_backoff(&mut self, network: IpNetwork) {
        self.backoff.insert(network, 0);
    }

    pub fn upsert_config(&mut self, config: Arc<PeerConfig>) {
        let network = config.remote_ip;

        if self
            .idle_peers
            .insert(config.remote_ip, IdlePeer::new(config))
            .is_some()
        {
            debug!("Peer config for {} updated", network);
        } else if let Some(remote_ip) = get_host_address(&network) {
            // Add to outgoing connection queue if there was no existing config
            // and if it's a single host
            self.delay_queue.insert(remote_ip, self.interval);
        }
    }

    pub async fn get_connection(
        &mut self,
    ) -> Result<Option<(TcpStream, Arc<PeerConfig>)>, io::Error> {
        // TODO: If DelayQueue.is_empty(), CPU spikes to 100%
        //       Look into returning a stream::pending() and remove
        //       insert() call in `new()`
        let initializer = FutureExt::fuse(self.delay_queue.next());
        let rescheduled_peers = FutureExt::fuse(self.rx.recv());
        pin_mut!(initializer, rescheduled_peers);
        select! {
            outgoing = initializer => {
                if let Some(Ok(peer)) = outgoing {
                    let addr = peer.into_inner();
                    trace!("Poller outbound triggered for {}", addr);
                    // Peer may not be present if it was rescheduled elsewhere
                    if let Some(config) = get_config_for_peer(&self.idle_peers, addr) {
                        if config.enabled {
                            let network = config.remote_ip;
                            let peer = self.idle_peers.remove(&config.remote_ip).expect("Idle peer exists");
                            match peer.connect().await {
                                Ok(connection) => {
                                    self.reset_backoff(network);
                                    return Ok(Some(connection));
                                }
                                Err(err) => {
                                    warn!("Error polling {}: {}", addr, err);
                                    let backoff = self.next_backoff(network);
                                    self.delay_queue.insert(addr, backoff);
                                }
                            }
                        }
                    }
                }
                Ok(None)
            },
            peer = rescheduled_peers => {
                if let Some(Reschedule { config, immediate }) = peer {
                    let network = config.remote_ip;
                    self.idle_peers
                        .insert(config.remote_ip, IdlePeer::new(config));
                    if let Some(addr) = get_host_address(&network) {
                        let wait = if immediate {
                            self.reset_backoff(network);
                            Duration::from_secs(0)
                        } else {
                            self.next_backoff(network)
                        };
                        self.delay_queue.insert(addr, wait);
                    }
                }
                Ok(None)
            }
        }
    }
}

impl fmt::Display for Poller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Poller peers={}>", self.idle_peers.len())
    }
}

fn get_config_for_peer(
    idle_peers: &HashMap<IpNetwork, IdlePeer>,
    peer: IpAddr,
) -> Option<Arc<PeerConfig>> {
    if let Some(network) = idle_peers.keys().find(|n| n.contains(peer)) {
        idle_peers.get(&network).map(|c| c.get_config())
    } else {
        None
    }
}
