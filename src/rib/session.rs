use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{ExportEntry, Families, Family};

/// Identity of a prefix within a peer's outbound journal: the address family
/// plus a stable-enough textual form of its NLRI. `NLRIEncoding` doesn't carry
/// `Hash`, so a `Debug`-derived string stands in as the key.
type RouteKey = (Family, String);

fn route_key(entry: &ExportEntry) -> RouteKey {
    (entry.update.family, format!("{:?}", entry.update.nlri))
}

/// One step of a peer's outbound UPDATE stream. Journal order always places
/// the `Withdraw` for a prefix before the `Announce` that replaces it.
#[derive(Debug, Clone)]
pub enum JournalEvent {
    Withdraw(Arc<ExportEntry>),
    Announce(Arc<ExportEntry>),
}

/// Per-session view of the RIB: what's believed advertised, and the queue of
/// withdraw/announce events still to be sent. `reconcile` is called once per
/// supervisor tick with the latest RIB snapshot for this peer; `next_pending`
/// drains the queue one event at a time so `Session::run` can yield between
/// each wire-sized chunk instead of blasting the whole RIB in one call.
pub struct SessionRoutes {
    pub families: Families,
    advertised: HashMap<RouteKey, (DateTime<Utc>, Arc<ExportEntry>)>,
    journal: VecDeque<JournalEvent>,
}

impl SessionRoutes {
    pub fn new(families: Families) -> Self {
        Self {
            families,
            advertised: HashMap::new(),
            journal: VecDeque::new(),
        }
    }

    /// Diff `latest` (the current RIB view for this peer) against what we
    /// believe is already advertised, enqueueing withdraw-before-announce
    /// journal events for anything that changed.
    pub fn reconcile(&mut self, latest: Vec<Arc<ExportEntry>>) {
        let mut incoming: HashMap<RouteKey, Arc<ExportEntry>> = HashMap::with_capacity(latest.len());
        for entry in latest {
            if !self.families.contains(entry.update.family) {
                continue;
            }
            incoming.insert(route_key(&entry), entry);
        }

        // Prefixes no longer present: withdraw.
        for (key, (_, entry)) in self.advertised.iter() {
            if !incoming.contains_key(key) {
                self.journal.push_back(JournalEvent::Withdraw(entry.clone()));
            }
        }
        self.advertised
            .retain(|key, _| incoming.contains_key(key));

        // New or replaced prefixes: withdraw-then-announce (or announce only
        // if this prefix wasn't previously advertised).
        for (key, entry) in incoming.into_iter() {
            let unchanged = self
                .advertised
                .get(&key)
                .map(|(ts, _)| *ts == entry.timestamp)
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            if let Some((_, prev)) = self.advertised.get(&key) {
                self.journal.push_back(JournalEvent::Withdraw(prev.clone()));
            }
            self.journal
                .push_back(JournalEvent::Announce(entry.clone()));
            self.advertised.insert(key, (entry.timestamp, entry));
        }
    }

    /// Pop the next outbound journal event, if any.
    pub fn next_pending(&mut self) -> Option<JournalEvent> {
        self.journal.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.journal.is_empty()
    }

    /// Drop all pending outbound events without sending them (used on reload).
    pub fn clear_buffer(&mut self) {
        self.journal.clear();
    }

    pub fn advertised(&self) -> Vec<Arc<ExportEntry>> {
        self.advertised.values().map(|(_, e)| e.clone()).collect()
    }

    /// ROUTE-REFRESH received: re-announce everything we believe is already
    /// advertised, regardless of whether it changed.
    pub fn resend_all(&mut self) {
        for (_, entry) in self.advertised.values() {
            self.journal.push_back(JournalEvent::Announce(entry.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::{EntrySource, ExportedUpdate, PathAttributeGroup, PathAttributes};
    use bgp_rs::{NLRIEncoding, Prefix, AFI};
    use std::net::IpAddr;

    fn entry(prefix: &str, ts: DateTime<Utc>) -> Arc<ExportEntry> {
        let ip: IpAddr = prefix.split('/').next().unwrap().parse().unwrap();
        let length: u8 = prefix.split('/').nth(1).unwrap().parse().unwrap();
        let prefix = Prefix {
            protocol: AFI::IPV4,
            length,
            prefix: match ip {
                IpAddr::V4(addr) => addr.octets().to_vec(),
                _ => unreachable!(),
            },
        };
        let attributes = Arc::new(PathAttributes::from_group(&PathAttributeGroup::from_attributes(
            vec![],
        )));
        Arc::new(ExportEntry {
            timestamp: ts,
            source: EntrySource::Config,
            update: ExportedUpdate {
                family: Family::new(AFI::IPV4, bgp_rs::SAFI::Unicast),
                attributes,
                nlri: NLRIEncoding::IP(prefix),
            },
        })
    }

    fn families() -> Families {
        Families::new(vec![Family::new(AFI::IPV4, bgp_rs::SAFI::Unicast)])
    }

    #[test]
    fn test_reconcile_new_prefix_only_announces() {
        let mut routes = SessionRoutes::new(families());
        let ts = Utc::now();
        routes.reconcile(vec![entry("10.0.0.0/24", ts)]);
        let events: Vec<_> = std::iter::from_fn(|| routes.next_pending()).collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], JournalEvent::Announce(_)));
    }

    #[test]
    fn test_reconcile_removed_prefix_withdraws() {
        let mut routes = SessionRoutes::new(families());
        let ts = Utc::now();
        routes.reconcile(vec![entry("10.0.0.0/24", ts)]);
        while routes.next_pending().is_some() {}
        routes.reconcile(vec![]);
        let events: Vec<_> = std::iter::from_fn(|| routes.next_pending()).collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], JournalEvent::Withdraw(_)));
    }

    #[test]
    fn test_reconcile_replaced_prefix_withdraws_before_announcing() {
        let mut routes = SessionRoutes::new(families());
        let ts1 = Utc::now();
        routes.reconcile(vec![entry("10.0.0.0/24", ts1)]);
        while routes.next_pending().is_some() {}
        let ts2 = ts1 + chrono::Duration::seconds(1);
        routes.reconcile(vec![entry("10.0.0.0/24", ts2)]);
        let events: Vec<_> = std::iter::from_fn(|| routes.next_pending()).collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], JournalEvent::Withdraw(_)));
        assert!(matches!(events[1], JournalEvent::Announce(_)));
    }

    #[test]
    fn test_reconcile_unchanged_prefix_is_quiet() {
        let mut routes = SessionRoutes::new(families());
        let ts = Utc::now();
        routes.reconcile(vec![entry("10.0.0.0/24", ts)]);
        while routes.next_pending().is_some() {}
        routes.reconcile(vec![entry("10.0.0.0/24", ts)]);
        assert!(!routes.has_pending());
    }
}
