use colored::*;

use crate::api::rpc::{LearnedRoute, PeerSummary};
use crate::cli::table::TableRow;

/// A row in the `show neighbors` summary table
pub struct PeerSummaryRow(pub PeerSummary);

impl TableRow for PeerSummaryRow {
    fn columns() -> Vec<&'static str> {
        vec![
            "Neighbor", "Router ID", "AS", "MsgRcvd", "MsgSent", "Uptime", "State", "PfxRcd",
        ]
    }

    fn cells(&self) -> Vec<String> {
        let peer = &self.0;
        let neighbor = if peer.enabled {
            peer.peer.to_string()
        } else {
            format!("*{}", peer.peer).dimmed().to_string()
        };
        let state = if peer.enabled {
            peer.state.to_string()
        } else {
            "Disabled".to_string()
        };
        vec![
            neighbor,
            peer.router_id.map(|id| id.to_string()).unwrap_or_default(),
            peer.remote_asn.to_string(),
            peer.msg_received.map(|n| n.to_string()).unwrap_or_default(),
            peer.msg_sent.map(|n| n.to_string()).unwrap_or_default(),
            peer.uptime.clone().unwrap_or_default(),
            state,
            peer.prefixes_received
                .map(|n| n.to_string())
                .unwrap_or_default(),
        ]
    }
}

/// A row in the `show routes learned` table
pub struct LearnedRouteRow(pub LearnedRoute);

impl TableRow for LearnedRouteRow {
    fn columns() -> Vec<&'static str> {
        vec![
            "Received From",
            "Prefix",
            "Next Hop",
            "Age",
            "Origin",
            "Local Pref",
            "Metric",
            "AS Path",
            "Communities",
        ]
    }

    fn cells(&self) -> Vec<String> {
        let route = &self.0;
        vec![
            route.source.clone(),
            route.prefix.clone(),
            route.next_hop.map(|n| n.to_string()).unwrap_or_default(),
            route.age.clone(),
            route.origin.clone(),
            route
                .local_pref
                .map(|n| n.to_string())
                .unwrap_or_default(),
            route
                .multi_exit_disc
                .map(|n| n.to_string())
                .unwrap_or_default(),
            route.as_path.clone(),
            route.communities.join(" "),
        ]
    }
}

/// A row in the `show routes advertised` table
pub struct AdvertisedRouteRow(pub LearnedRoute);

impl TableRow for AdvertisedRouteRow {
    fn columns() -> Vec<&'static str> {
        vec![
            "Advertised To",
            "Prefix",
            "Next Hop",
            "Age",
            "Origin",
            "Local Pref",
            "Metric",
            "AS Path",
            "Communities",
        ]
    }

    fn cells(&self) -> Vec<String> {
        let route = &self.0;
        vec![
            route.source.clone(),
            route.prefix.clone(),
            route.next_hop.map(|n| n.to_string()).unwrap_or_default(),
            route.age.clone(),
            route.origin.clone(),
            route
                .local_pref
                .map(|n| n.to_string())
                .unwrap_or_default(),
            route
                .multi_exit_disc
                .map(|n| n.to_string())
                .unwrap_or_default(),
            route.as_path.clone(),
            route.communities.join(" "),
        ]
    }
}
