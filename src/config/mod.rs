mod file;

pub use file::{AdvertiseSource, FlowSpec, ProcessConfigSpec, RouteSpec};

use std::collections::HashSet;
use std::io::Result;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;

use crate::rib::Family;

/// Parse a TOML config file and return a ServerConfig
pub fn from_file(path: &str) -> Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_file(path)?;
    Ok(ServerConfig::from_spec(spec))
}

#[derive(Debug)]
pub struct ServerConfig {
    pub router_id: IpAddr,
    pub default_as: u32,
    pub poll_interval: u16,
    pub peers: Vec<Arc<PeerConfig>>,
    pub processes: Vec<ProcessConfig>,
}

/// In-Memory Server representation of a Peer config
///   Has missing PeerConfigSpec items defaulted to Server values
#[derive(Debug)]
pub struct PeerConfig {
    pub remote_ip: IpNetwork,
    pub remote_as: u32,
    pub local_as: u32,
    pub local_router_id: IpAddr,
    pub enabled: bool,
    pub hold_timer: u16,
    pub dest_port: u16,
    pub families: Vec<Family>,
    pub advertise_sources: HashSet<AdvertiseSource>,
    pub static_routes: Vec<RouteSpec>,
    pub static_flows: Vec<FlowSpec>,
    pub graceful_restart: bool,
    pub learn_updates: bool,
    pub multisession: bool,
}

/// A helper process to spawn alongside the daemon, piped via stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub peers: Option<Vec<IpAddr>>,
}

impl ProcessConfig {
    /// Does this process subscribe to `neighbor ... up/down/update` lines for `peer`?
    pub fn subscribes_to(&self, peer: IpAddr) -> bool {
        match &self.peers {
            None => true,
            Some(peers) => peers.contains(&peer),
        }
    }
}

impl PeerConfig {
    // Is this an eBGP session
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }

    /// Structural equality over identity fields, excluding the route set:
    /// when this holds across a reload, the session is kept and only
    /// `reload(routes)` is applied instead of a full restart.
    pub fn same_identity(&self, other: &PeerConfig) -> bool {
        self.remote_ip == other.remote_ip
            && self.remote_as == other.remote_as
            && self.local_as == other.local_as
            && self.local_router_id == other.local_router_id
            && self.enabled == other.enabled
            && self.hold_timer == other.hold_timer
            && self.dest_port == other.dest_port
            && self.families == other.families
            && self.advertise_sources == other.advertise_sources
            && self.graceful_restart == other.graceful_restart
            && self.learn_updates == other.learn_updates
            && self.multisession == other.multisession
    }
}

impl ServerConfig {
    fn from_spec(spec: file::ServerConfigSpec) -> Self {
        let peers: Vec<_> = spec
            .peers
            .iter()
            .map(|p| {
                Arc::new(PeerConfig {
                    remote_ip: IpNetwork::from(p.remote_ip),
                    remote_as: p.remote_as,
                    local_as: p.local_as.unwrap_or(spec.default_as),
                    local_router_id: p.local_router_id.unwrap_or(spec.router_id),
                    enabled: p.enabled,
                    hold_timer: p.hold_timer,
                    dest_port: p.dest_port,
                    families: p.families.clone(),
                    advertise_sources: p.advertise_sources.clone().into_iter().collect(),
                    static_routes: p.static_routes.clone().into_iter().collect(),
                    static_flows: p.static_flows.clone().into_iter().collect(),
                    graceful_restart: p.graceful_restart,
                    learn_updates: p.learn_updates,
                    multisession: p.multisession,
                })
            })
            .collect();

        let processes = spec
            .processes
            .iter()
            .map(|p| ProcessConfig {
                name: p.name.clone(),
                command: p.command.clone(),
                args: p.args.clone(),
                peers: p.peers.clone(),
            })
            .collect();

        Self {
            router_id: spec.router_id,
            default_as: spec.default_as,
            poll_interval: spec.poll_interval,
            peers,
            processes,
        }
    }
}
