mod attributes;
pub mod community;
mod export;
pub mod families;
mod parse;
pub mod session;

use attributes::PathAttributeCache;
pub use attributes::{PathAttributeGroup, PathAttributes};
pub use community::{Community, CommunityList};
pub use export::{ExportEntry, ExportedUpdate};
pub use families::{Families, Family};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use bgp_rs::{Identifier, NLRIEncoding, PathAttribute, Update};
use chrono::{DateTime, Utc};
use log::debug;

use crate::session::SessionError;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EntrySource {
    Api,
    Config,
    Peer(IpAddr),
}

impl fmt::Display for EntrySource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use EntrySource::*;
        let display = match self {
            Api => "API".to_string(),
            Config => "Config".to_string(),
            Peer(addr) => addr.to_string(),
        };
        write!(f, "{}", display)
    }
}

/// RIB-internal storage of attrs and NLRI info
#[derive(Debug)]
struct RibEntry {
    family: Family,
    source: EntrySource,
    timestamp: DateTime<Utc>,
    nlri: NLRIEncoding,
    /// Withheld from every peer's advertisement journal until a helper
    /// process arms this watchdog name (`announce watchdog <name>`).
    watchdog: Option<String>,
}

impl RibEntry {
    /// Is this entry currently eligible for advertisement?
    fn is_armed(&self, armed_watchdogs: &HashSet<String>) -> bool {
        match &self.watchdog {
            None => true,
            Some(name) => armed_watchdogs.contains(name),
        }
    }
}

/// Routing-information Base
/// Contains all received NLRI information with associated Path Attributes
/// and provides an API to query:
///   - routes learned (from a peer, config, or API)
///   - routes that should be advertised to a peer
#[derive(Debug)]
pub struct RIB {
    /// Learned Rib entries, keyed by the PathAttributeGroup hash
    entries: HashMap<u64, Vec<RibEntry>>,
    /// Cache for grouping and storing common PathAttributes amongst NLRI
    cache: PathAttributeCache,
    /// Watchdog names currently armed (announced) by a helper process
    armed_watchdogs: HashSet<String>,
}

impl RIB {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(64),
            cache: PathAttributeCache::with_capacity(64),
            armed_watchdogs: HashSet::new(),
        }
    }

    /// `announce watchdog <name>`: routes bound to this name become eligible
    /// for advertisement on the next peer RIB snapshot.
    pub fn arm_watchdog(&mut self, name: &str) {
        self.armed_watchdogs.insert(name.to_string());
    }

    /// `withdraw watchdog <name>`: routes bound to this name are withheld
    /// (withdrawn if already advertised) on the next peer RIB snapshot.
    pub fn disarm_watchdog(&mut self, name: &str) {
        self.armed_watchdogs.remove(name);
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }

    pub fn get_routes(&self) -> Vec<Arc<ExportEntry>> {
        self.entries
            .iter()
            .map(|(group_key, entries)| {
                let attributes = {
                    let group = self.cache.get(&group_key).expect("Cached PAs exist");
                    Arc::new(PathAttributes::from_group(&group))
                };
                entries
                    .iter()
                    .filter(|e| e.is_armed(&self.armed_watchdogs))
                    .map(|e| Arc::new((e, attributes.clone()).into()))
                    .collect::<Vec<_>>()
            })
            .flatten()
            .collect()
    }

    pub fn get_routes_from_peer(&self, peer: IpAddr) -> Vec<Arc<ExportEntry>> {
        self.entries
            .iter()
            .map(|(group_key, entries)| entries.iter().map(|e| (group_key, e)).collect::<Vec<_>>())
            .flatten()
            .filter(|(_, e)| e.source == EntrySource::Peer(peer))
            .map(|(group_key, e)| {
                let attributes = {
                    let group = self.cache.get(&group_key).expect("Cached PAs exist");
                    Arc::new(PathAttributes::from_group(&group))
                };
                Arc::new((e, attributes.clone()).into())
            })
            .collect()
    }

    pub fn get_routes_for_peer(&self, peer: IpAddr) -> Vec<Arc<ExportEntry>> {
        // TODO: accept some kind of policy object to determine which routes
        //       a peer should receive. for now, just broadcast all that weren't
        //       learned from the peer, skipping disarmed watchdog routes
        self.entries
            .iter()
            .map(|(group_key, entries)| entries.iter().map(|e| (group_key, e)).collect::<Vec<_>>())
            .flatten()
            .filter(|(_, e)| e.source != EntrySource::Peer(peer) && e.is_armed(&self.armed_watchdogs))
            .map(|(group_key, e)| {
                let attributes = {
                    let group = self.cache.get(&group_key).expect("Cached PAs exist");
                    Arc::new(PathAttributes::from_group(&group))
                };
                Arc::new((e, attributes.clone()).into())
            })
            .collect()
    }

    /// Apply a received UPDATE to the peer-learned view of the RIB, returning
    /// every NLRI it touched (withdrawn first, then announced), paired with
    /// its next-hop (`None` for withdraws), so the caller can forward them as
    /// `neighbor <ip> <route>` lines to subscribed helper processes.
    pub fn update_from_peer(
        &mut self,
        peer: IpAddr,
        update: Update,
    ) -> Result<Vec<(NLRIEncoding, Option<IpAddr>)>, SessionError> {
        let mp_withdraws: Vec<&NLRIEncoding> = update
            .get(Identifier::MP_UNREACH_NLRI)
            .map(|attr| match attr {
                PathAttribute::MP_UNREACH_NLRI(nlri) => nlri.withdrawn_routes.iter().collect(),
                _ => unreachable!(),
            })
            .unwrap_or_else(|| vec![]);
        let withdraws: Vec<&NLRIEncoding> = mp_withdraws
            .into_iter()
            .chain(update.withdrawn_routes.iter())
            .collect();
        let mut touched: Vec<(NLRIEncoding, Option<IpAddr>)> =
            withdraws.iter().map(|n| ((*n).clone(), None)).collect();
        if !withdraws.is_empty() {
            self.withdraw_peer_nlri(peer, withdraws);
        }
        let (attributes, family, nlri) = parse::parse_update(update)?;
        let next_hop = attributes.iter().find_map(|attr| match attr {
            PathAttribute::NEXT_HOP(next_hop) => Some(*next_hop),
            _ => None,
        });
        touched.extend(nlri.iter().cloned().map(|n| (n, next_hop)));
        let group_key = self.cache.insert(attributes);
        let entry = self
            .entries
            .entry(group_key)
            .or_insert(Vec::with_capacity(nlri.len()));
        entry.extend(nlri.into_iter().map(|nlri| RibEntry {
            source: EntrySource::Peer(peer),
            family,
            timestamp: Utc::now(),
            nlri,
            watchdog: None,
        }));
        Ok(touched)
    }

    pub fn insert_from_api(
        &mut self,
        family: Family,
        attributes: Vec<PathAttribute>,
        nlri: NLRIEncoding,
    ) -> Arc<ExportEntry> {
        let group_key = self.cache.insert(attributes);
        let entry = self
            .entries
            .entry(group_key)
            .or_insert(Vec::with_capacity(1));
        entry.push(RibEntry {
            source: EntrySource::Config,
            family,
            timestamp: Utc::now(),
            nlri,
            watchdog: None,
        });
        let e = entry.last().expect("Pushed entry exists");
        let attributes = {
            let group = self.cache.get(&group_key).expect("Cached PAs exist");
            Arc::new(PathAttributes::from_group(&group))
        };
        Arc::new((e, attributes.clone()).into())
    }

    pub fn insert_from_config(
        &mut self,
        family: Family,
        attributes: Vec<PathAttribute>,
        nlri: NLRIEncoding,
        watchdog: Option<String>,
    ) {
        let group_key = self.cache.insert(attributes);
        let entry = self
            .entries
            .entry(group_key)
            .or_insert(Vec::with_capacity(1));
        entry.push(RibEntry {
            source: EntrySource::Config,
            family,
            timestamp: Utc::now(),
            nlri,
            watchdog,
        });
    }

    /// `withdraw route <spec>` from a helper process: remove a single
    /// config/API-sourced entry matching this NLRI.
    pub fn remove_from_config(&mut self, nlri: &NLRIEncoding) {
        let mut total = 0usize;
        for entries in self.entries.values_mut() {
            let before = entries.len();
            entries.retain(|e| {
                !(matches!(e.source, EntrySource::Config | EntrySource::Api) && &e.nlri == nlri)
            });
            total += before - entries.len();
        }
        self.cleanup();
        debug!("Removed {} config/API routes matching withdraw", total);
    }

    pub fn remove_from_peer(&mut self, peer: IpAddr) {
        let mut total = 0usize;
        for entries in self.entries.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.source != EntrySource::Peer(peer));
            total += before - entries.len();
        }
        self.cleanup();
        debug!("Removed {} routes from RIB for {}", total, peer);
    }

    pub fn withdraw_peer_nlri(&mut self, peer: IpAddr, withdrawn: Vec<&NLRIEncoding>) {
        // TODO: Optimize this, possibly with an index of IP -> PA Group mapping?
        let mut total = 0usize;
        for nlri in withdrawn {
            for entries in self.entries.values_mut() {
                let before = entries.len();
                entries.retain(|e| !(e.source == EntrySource::Peer(peer) && &e.nlri == nlri));
                total += before - entries.len();
            }
        }
        self.cleanup();
        debug!("Withdrew {} routes for {}", total, peer);
    }

    /// Maintentance cleanup of PathAttributeGroups
    ///   - May be due to sessions ending, withdrawn routes, etc..
    fn cleanup(&mut self) {
        let mut empty_groups: Vec<u64> = vec![];
        self.entries.retain(|&k, v| {
            if v.is_empty() {
                empty_groups.push(k);
                false
            } else {
                true
            }
        });
        for empty in empty_groups {
            self.cache.remove(&empty);
        }
    }
}
