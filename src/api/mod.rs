pub mod rpc;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use jsonrpsee::core::{async_trait, Error as RpcError, RpcResult};
use tokio::sync::Mutex;

use crate::rib::{ExportEntry, RIB};
use crate::session::Session;
use crate::utils::{format_time_as_elapsed, nlri_to_string, parse_flow_spec, parse_route_spec};

pub use rpc::{ApiServer, FlowSpec, LearnedRoute, PeerDetail, PeerSummary, RouteSpec};

impl From<&ExportEntry> for LearnedRoute {
    fn from(entry: &ExportEntry) -> Self {
        let update = &entry.update;
        LearnedRoute {
            source: entry.source.to_string(),
            afi: update.family.afi.to_string(),
            safi: update.family.safi.to_string(),
            received_at: entry.timestamp.timestamp(),
            age: format_time_as_elapsed(entry.timestamp),
            prefix: nlri_to_string(&update.nlri),
            next_hop: update.attributes.next_hop,
            origin: format!("{:?}", update.attributes.origin),
            as_path: update
                .attributes
                .as_path
                .segments
                .iter()
                .map(|seg| format!("{:?}", seg))
                .collect::<Vec<_>>()
                .join(" "),
            local_pref: update.attributes.local_pref,
            multi_exit_disc: update.attributes.multi_exit_disc,
            communities: update
                .attributes
                .communities
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

/// Implementation of the `Api` RPC surface, backed by the same
/// session map and RIB the daemon's event loop owns.
pub struct BgpdApi {
    sessions: Arc<Mutex<HashMap<IpAddr, Session>>>,
    rib: Arc<Mutex<RIB>>,
}

impl BgpdApi {
    pub fn new(sessions: Arc<Mutex<HashMap<IpAddr, Session>>>, rib: Arc<Mutex<RIB>>) -> Self {
        Self { sessions, rib }
    }
}

fn peer_summary(session: &Session) -> PeerSummary {
    PeerSummary {
        peer: session.addr.to_string(),
        enabled: session.config.enabled,
        router_id: Some(session.router_id),
        remote_asn: session.config.remote_as,
        local_asn: session.config.local_as,
        msg_received: Some(session.counts.received()),
        msg_sent: Some(session.counts.sent()),
        connect_time: Some(session.connect_time.timestamp()),
        uptime: Some(format_time_as_elapsed(session.connect_time)),
        state: session.state.to_string(),
        prefixes_received: None,
    }
}

fn capability_strings(session: &Session) -> Vec<String> {
    let mut caps: Vec<String> = session
        .capabilities
        .MP_BGP_SUPPORT
        .iter()
        .map(|(afi, safi)| format!("Address family {} {}", afi, safi))
        .collect();
    if session.capabilities.FOUR_OCTET_ASN_SUPPORT {
        caps.push("4-byte ASN".to_string());
    }
    if session.capabilities.ROUTE_REFRESH_SUPPORT {
        caps.push("Route Refresh".to_string());
    }
    caps
}

fn invalid_params(msg: impl ToString) -> RpcError {
    RpcError::Custom(msg.to_string())
}

#[async_trait]
impl ApiServer for BgpdApi {
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.values().map(peer_summary).collect())
    }

    async fn show_peer_detail(&self) -> RpcResult<Vec<PeerDetail>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions
            .values()
            .map(|session| PeerDetail {
                summary: peer_summary(session),
                hold_timer: session.hold_timer.hold_timer,
                hold_timer_interval: session.hold_timer.interval,
                hold_time: Some(session.hold_timer.to_string()),
                last_received: Some(format_time_as_elapsed(session.hold_timer.last_received)),
                last_sent: Some(format_time_as_elapsed(session.hold_timer.last_sent)),
                tcp_connection: session
                    .protocol
                    .get_ref()
                    .local_addr()
                    .ok()
                    .zip(session.protocol.get_ref().peer_addr().ok())
                    .map(|(local, remote)| (local.to_string(), remote.to_string())),
                capabilities: capability_strings(session),
            })
            .collect())
    }

    async fn show_routes_learned(
        &self,
        from_peer: Option<IpNetwork>,
    ) -> RpcResult<Vec<LearnedRoute>> {
        let rib = self.rib.lock().await;
        let routes = rib.get_routes();
        let filtered = routes.iter().filter(|entry| match from_peer {
            Some(network) => match entry.source {
                crate::rib::EntrySource::Peer(addr) => network.contains(addr),
                _ => false,
            },
            None => true,
        });
        Ok(filtered.map(|entry| entry.as_ref().into()).collect())
    }

    async fn show_routes_advertised(
        &self,
        to_peer: Option<IpNetwork>,
    ) -> RpcResult<Vec<LearnedRoute>> {
        let sessions = self.sessions.lock().await;
        let mut routes = vec![];
        for session in sessions.values() {
            if let Some(network) = to_peer {
                if !network.contains(session.addr) {
                    continue;
                }
            }
            routes.extend(session.routes.advertised().iter().map(|e| e.as_ref().into()));
        }
        Ok(routes)
    }

    async fn advertise_route(&self, route: RouteSpec) -> RpcResult<LearnedRoute> {
        let (family, attributes, nlri) =
            parse_route_spec(&route).map_err(|err| invalid_params(err))?;
        let mut rib = self.rib.lock().await;
        let entry = rib.insert_from_api(family, attributes, nlri);
        Ok(entry.as_ref().into())
    }

    async fn advertise_flow(&self, flow: FlowSpec) -> RpcResult<LearnedRoute> {
        let (family, attributes, nlri) =
            parse_flow_spec(&flow).map_err(|err| invalid_params(err))?;
        let mut rib = self.rib.lock().await;
        let entry = rib.insert_from_api(family, attributes, nlri);
        Ok(entry.as_ref().into())
    }
}
