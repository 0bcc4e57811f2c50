use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::net::IpAddr;
use std::sync::Arc;

use bgp_rs::{Message, Notification};
use futures::future::FutureExt;
use futures::{pin_mut, select};
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, Mutex};

use super::codec::{MessageCodec, MessageProtocol};
use super::{Poller, PollerTx, Session, SessionError, SessionUpdate};
use crate::config::{PeerConfig, ServerConfig};
use crate::rib::RIB;

pub struct SessionManager {
    pub(crate) idle_peers: Poller,
    // Active Sessions                  remote_ip: session
    pub(crate) sessions: Arc<Mutex<HashMap<IpAddr, Session>>>,
    config: Arc<ServerConfig>,
    poller_tx: PollerTx,
    config_watch: watch::Receiver<Arc<ServerConfig>>,
    /// Peers whose last session ended with `Asn4Downgrade`. Cleared only by
    /// an explicit restart (SIGALRM), so the next reconnect attempt doesn't
    /// repeat the same failed 4-byte-ASN negotiation.
    asn4_downgraded: HashSet<IpAddr>,
}

impl SessionManager {
    pub fn new(config: Arc<ServerConfig>, config_watch: watch::Receiver<Arc<ServerConfig>>) -> Self {
        let (poller_tx, poller_rx) = mpsc::unbounded_channel();
        let poller_tx = PollerTx::from(poller_tx);
        let mut poller = Poller::new(config.poll_interval.into(), poller_rx);
        for peer_config in config.peers.iter() {
            poller.upsert_config(peer_config.clone());
        }

        Self {
            idle_peers: poller,
            sessions: Arc::new(Mutex::new(HashMap::with_capacity(config.peers.len()))),
            config,
            poller_tx,
            config_watch,
            asn4_downgraded: HashSet::new(),
        }
    }

    /// SIGALRM: forget every peer's ASN4-downgrade history so the next
    /// reconnect attempts full 4-byte-ASN negotiation again.
    pub fn clear_asn4_downgrades(&mut self) {
        self.asn4_downgraded.clear();
    }

    pub fn get_peer_configs(&self) -> Vec<Arc<PeerConfig>> {
        self.config.peers.to_vec()
    }

    /// A handle to the live session map, for read-only external views
    /// (e.g. the RPC API's `show_peers`/`show_peer_detail`).
    pub fn sessions(&self) -> Arc<Mutex<HashMap<IpAddr, Session>>> {
        Arc::clone(&self.sessions)
    }

    /// Mark every active session stopped: each transits through
    /// NOTIFICATION(6,3 Administratively Reset) unless both sides agreed
    /// Graceful Restart, in which case the transport is just closed. Called
    /// once, on SIGTERM or a helper-issued `shutdown` command.
    pub async fn shutdown(&mut self) -> Result<(), Box<dyn Error>> {
        let mut sessions = self.sessions.lock().await;
        for (remote_ip, session) in sessions.iter_mut() {
            if session.graceful_restart_agreed() {
                debug!("Session with {} closing silently (graceful restart)", remote_ip);
            } else {
                warn!("Session ended with {}, daemon shutting down", remote_ip);
                let notif = Notification {
                    major_err_code: 6, // Cease
                    minor_err_code: 3, // Administratively Reset
                    data: vec![],
                };
                session.send_message(Message::Notification(notif)).await?;
            }
        }
        sessions.clear();
        Ok(())
    }

    pub async fn get_update(
        &mut self,
        rib: Arc<Mutex<RIB>>,
    ) -> Result<Option<SessionUpdate>, Box<dyn Error>> {
        let sessions_clone = Arc::clone(&self.sessions);
        let receive_new_sessions = self.idle_peers.get_connection().fuse();
        let config_updates = self.config_watch.recv().fuse();

        // TODO: Figure out how to select_all over sessions
        // let active_sessions = {
        //     let mut sessions = self.sessions.lock().await;
        //     let futs: Vec<_> = sessions
        //         .values_mut()
        //         .map(|sess| Box::pin(sess.run()))
        //         .collect();
        //     select_all(futs).fuse()
        // };
        {
            // Sessions that have ended this tick, paired with the reason to
            // relay to subscribed helper processes.
            let mut ended_sessions: Vec<(IpAddr, String)> = Vec::new();
            let mut sessions = self.sessions.lock().await;
            for (remote_ip, session) in sessions.iter_mut() {
                let routes = rib.lock().await.get_routes_for_peer(session.addr);
                session.routes.reconcile(routes);

                match session.run().await {
                    Ok(update) => {
                        if update.is_some() {
                            return Ok(update);
                        }
                    }
                    Err(err) => {
                        match err {
                            SessionError::Deconfigured => {
                                let notif = Notification {
                                    major_err_code: 6,
                                    minor_err_code: 3,
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            SessionError::HoldTimeExpired(_) => {
                                let notif = Notification {
                                    major_err_code: 4,
                                    minor_err_code: 0,
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            SessionError::FiniteStateMachine(minor) => {
                                let notif = Notification {
                                    major_err_code: 5,
                                    minor_err_code: minor,
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            SessionError::OpenAsnMismatch(_, _) => {
                                let notif = Notification {
                                    major_err_code: 2, // OPEN Message Error
                                    minor_err_code: 2, // Bad Peer AS
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            SessionError::Asn4Downgrade => {
                                let notif = Notification {
                                    major_err_code: 2, // OPEN Message Error
                                    minor_err_code: 0, // Unspecific
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                                // Local policy issue, not a network failure: retry now.
                                self.asn4_downgraded.insert(*remote_ip);
                                self.poller_tx.send_immediate(session.config.clone())?;
                                warn!("{}", err);
                                ended_sessions.push((*remote_ip, err.to_string()));
                                continue;
                            }
                            SessionError::HoldTimeUnacceptable(_) => {
                                let notif = Notification {
                                    major_err_code: 2, // OPEN Message Error
                                    minor_err_code: 6, // Unacceptable Hold Time
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            SessionError::RouterIdInvalid(_) => {
                                let notif = Notification {
                                    major_err_code: 2, // OPEN Message Error
                                    minor_err_code: 3, // Bad BGP Identifier
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            SessionError::UnsupportedCapability(is_multisession) => {
                                let notif = Notification {
                                    major_err_code: 2, // OPEN Message Error
                                    minor_err_code: if is_multisession { 8 } else { 7 },
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            SessionError::ConnectionNotSynchronized => {
                                let notif = Notification {
                                    major_err_code: 1, // Message Header Error
                                    minor_err_code: 1, // Connection Not Synchronized
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            SessionError::BadMessageLength(_) => {
                                let notif = Notification {
                                    major_err_code: 1, // Message Header Error
                                    minor_err_code: 2, // Bad Message Length
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            SessionError::BadMessageType(_) => {
                                let notif = Notification {
                                    major_err_code: 1, // Message Header Error
                                    minor_err_code: 3, // Bad Message Type
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                            _ => (),
                        }
                        warn!("{}", err);
                        self.poller_tx.send(session.config.clone()).unwrap();
                        ended_sessions.push((*remote_ip, err.to_string()));
                    }
                }
            }
            // Remove ended sessions and alert handler for RIB removal
            if !ended_sessions.is_empty() {
                for (remote_ip, _) in &ended_sessions {
                    sessions.remove(remote_ip);
                }
                return Ok(Some(SessionUpdate::Ended(ended_sessions)));
            }
        }

        pin_mut!(receive_new_sessions, config_updates);
        select! {
            new_connection = receive_new_sessions => {
                if let Ok(Some((stream, peer_config))) = new_connection {
                    let mut sessions = sessions_clone.lock().await;
                    let remote_ip = stream.peer_addr().expect("Stream has remote peer").ip();
                    if sessions.contains_key(&remote_ip) {
                        warn!(
                            "Unexpected connection from {}: Already have an existing session",
                            remote_ip,
                        );
                        return Ok(None);
                    }
                    let protocol = MessageProtocol::new(stream, MessageCodec::new());
                    let downgraded = self.asn4_downgraded.contains(&remote_ip);
                    let new_session = Session::new_with_downgrade(Arc::clone(&peer_config), protocol, downgraded);
                    info!("New session started: {}", remote_ip);
                    sessions.insert(remote_ip, new_session);
                }
                Ok(None)
            },
            update = config_updates => {
                if let Some(new_config) = update {
                    self.config = new_config.clone();
                    let configs_by_network: HashMap<IpNetwork, Arc<PeerConfig>> = new_config
                        .peers
                        .iter()
                        .map(|p| (p.remote_ip, p.clone()))
                        .collect();
                    { // Current Sessions lock scope
                        let mut current_sessions = self.sessions.lock().await;
                        // Sessions whose identity changed (not just their route
                        // set) are torn down and left to reconnect under the
                        // new config; sessions with an unchanged identity are
                        // kept in place and simply get the new config applied.
                        let mut removed_peers: Vec<IpAddr> = vec![];
                        for (addr, current_session) in current_sessions.iter_mut() {
                            match configs_by_network.keys().find(|n| n.contains(*addr)) {
                                Some(network) => {
                                    let config = configs_by_network.get(network).expect("Network has config");
                                    if current_session.config.same_identity(config) {
                                        current_session.update_config(config.clone());
                                        // Drop any events queued against the prior
                                        // route set so a reload can't flush stale
                                        // announcements after the config swap.
                                        current_session.routes.clear_buffer();
                                    } else {
                                        removed_peers.push(*addr);
                                    }
                                }
                                None => removed_peers.push(*addr),
                            }
                        }

                        debug!(
                            "Received config [{} peer configs, {} removed peer configs]",
                            configs_by_network.len(),
                            removed_peers.len()
                        );

                        for removed_ip in removed_peers {
                            let mut session = current_sessions.remove(&removed_ip).expect("Active session");
                            if session.graceful_restart_agreed() {
                                debug!("Session with {} closing silently (graceful restart)", removed_ip);
                            } else {
                                warn!("Session ended with {}, peer de-configured", removed_ip);
                                let notif = Notification {
                                    major_err_code: 6, // Cease
                                    minor_err_code: 3, // Deconfigured
                                    data: vec![],
                                };
                                session.send_message(Message::Notification(notif)).await?;
                            }
                        }
                    }

                    for (_, new_config) in configs_by_network {
                        self.poller_tx.send(new_config.clone())?;
                    }
                }
                Ok(None)
            }
        }
    }
}
