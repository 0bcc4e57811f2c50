#![allow(unused_imports)]

use std::collections::HashMap;
use std::error::Error;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bgp_rs::{Message, Notification};
use clap::Parser;
use env_logger::Builder;
use log::{debug, info, warn, LevelFilter};
use signal_hook::consts::{SIGALRM, SIGHUP, SIGTERM};
use tokio::runtime::Builder as RuntimeBuilder;
use tokio::sync::{watch, Mutex};

use bgpd_core::cli::{query_bgpd, Args, Command};
use bgpd_core::config::{self, ServerConfig};
use bgpd_core::helper_process::{HelperCommand, HelperRegistry};
use bgpd_core::rib::RIB;
use bgpd_core::session::{Session, SessionManager, SessionUpdate};
use bgpd_core::utils::nlri_to_string;

fn init_logging(verbosity: u8) {
    let (bgpd_level, other_level) = match verbosity {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bgpd_core"), bgpd_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", bgpd_level, other_level);
}

/// Flags latched by signal handlers, consumed only at loop-iteration
/// boundaries -- never from inside a codec call.
struct SignalFlags {
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
}

impl SignalFlags {
    fn register() -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        let restart = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;
        signal_hook::flag::register(SIGHUP, Arc::clone(&reload))?;
        signal_hook::flag::register(SIGALRM, Arc::clone(&restart))?;
        Ok(Self {
            shutdown,
            reload,
            restart,
        })
    }

    fn take_shutdown(&self) -> bool {
        self.shutdown.swap(false, Ordering::Relaxed)
    }

    fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::Relaxed)
    }

    fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::Relaxed)
    }
}

/// Run the `bgpd` daemon: load the config, start the RPC server, and
/// drive the single-threaded session loop until a shutdown signal
/// (or an unrecoverable error) ends it.
async fn run_daemon(config_path: &str, api_addr: std::net::SocketAddr) -> Result<(), Box<dyn Error>> {
    let config = Arc::new(config::from_file(config_path)?);
    debug!("Found {} peers in {}", config.peers.len(), config_path);

    let signals = SignalFlags::register()?;

    let rib = Arc::new(Mutex::new(RIB::new()));
    {
        let mut rib = rib.lock().await;
        for peer in &config.peers {
            for route in &peer.static_routes {
                let (family, attributes, nlri) = route.parse()?;
                rib.insert_from_config(family, attributes, nlri, route.watchdog.clone());
            }
            for flow in &peer.static_flows {
                let (family, attributes, nlri) = bgpd_core::utils::parse_flow_spec(flow)?;
                rib.insert_from_config(family, attributes, nlri, None);
            }
        }
    }
    let mut helpers = HelperRegistry::spawn(&config.processes)?;

    let (config_tx, config_watch) = watch::channel(Arc::clone(&config));
    let mut manager = SessionManager::new(Arc::clone(&config), config_watch);
    let sessions = manager.sessions();

    let api = bgpd_core::api::BgpdApi::new(Arc::clone(&sessions), Arc::clone(&rib));
    let server = jsonrpsee::http_server::HttpServerBuilder::default()
        .build(api_addr)
        .await?;
    let rpc_module = bgpd_core::api::rpc::ApiServer::into_rpc(api);
    let _server_handle = server.start(rpc_module)?;
    info!("RPC server listening on {}", api_addr);

    loop {
        if signals.take_shutdown() {
            info!("SIGTERM received, shutting down");
            manager.shutdown().await?;
            break;
        }
        if signals.take_reload() {
            info!("SIGHUP received, reloading configuration");
            match config::from_file(config_path) {
                Ok(new_config) => {
                    config_tx.send(Arc::new(new_config))?;
                }
                Err(err) => warn!("Failed to reload config: {}", err),
            }
        }
        if signals.take_restart() {
            info!("SIGALRM received, restart requested");
            manager.clear_asn4_downgrades();
        }

        tokio::select! {
            update = manager.get_update(Arc::clone(&rib)) => match update {
                Ok(Some(SessionUpdate::Learned((peer, update)))) => {
                    let touched = {
                        let mut rib = rib.lock().await;
                        rib.update_from_peer(peer, update)
                    };
                    match touched {
                        Ok(routes) if !routes.is_empty() => {
                            helpers.update_start(peer).await;
                            for (nlri, next_hop) in &routes {
                                helpers.stream_update(peer, nlri, *next_hop).await;
                            }
                            helpers.update_end(peer).await;
                        }
                        Ok(_) => (),
                        Err(err) => warn!("Error processing update from {}: {}", peer, err),
                    }
                }
                Ok(Some(SessionUpdate::Up(peer))) => {
                    helpers.neighbor_up(peer).await;
                }
                Ok(Some(SessionUpdate::Ended(peers))) => {
                    let mut rib = rib.lock().await;
                    for (peer, reason) in peers {
                        rib.remove_from_peer(peer);
                        helpers.neighbor_down(peer, &reason).await;
                    }
                }
                Ok(None) => (),
                Err(err) => warn!("Error in session loop: {}", err),
            },
            command = helpers.next_command() => {
                if let Some((name, command)) = command {
                    match dispatch_helper_command(&name, command, &rib, &sessions, &mut helpers).await {
                        Some(ControlAction::Reload) => {
                            info!("helper '{}' requested reload", name);
                            match config::from_file(config_path) {
                                Ok(new_config) => config_tx.send(Arc::new(new_config))?,
                                Err(err) => warn!("Failed to reload config: {}", err),
                            }
                        }
                        Some(ControlAction::Restart) => {
                            info!("helper '{}' requested restart", name);
                            manager.clear_asn4_downgrades();
                        }
                        Some(ControlAction::Shutdown) => {
                            info!("helper '{}' requested shutdown", name);
                            manager.shutdown().await?;
                            break;
                        }
                        None => (),
                    }
                }
            }
        }
    }
    helpers.shutdown_all().await;
    Ok(())
}

/// A control verb a helper process asked the supervisor to carry out,
/// applied at the next loop-iteration boundary exactly like a signal.
enum ControlAction {
    Reload,
    Restart,
    Shutdown,
}

/// Apply a command line read from a helper process's stdout, returning a
/// control action for `run_daemon` to carry out if the command was one of
/// reload/restart/shutdown.
async fn dispatch_helper_command(
    name: &str,
    command: HelperCommand,
    rib: &Arc<Mutex<RIB>>,
    sessions: &Arc<Mutex<HashMap<IpAddr, Session>>>,
    helpers: &mut HelperRegistry,
) -> Option<ControlAction> {
    match command {
        HelperCommand::AnnounceRoute(spec) => match spec.parse() {
            Ok((family, attributes, nlri)) => {
                rib.lock().await.insert_from_api(family, attributes, nlri);
            }
            Err(err) => warn!("helper '{}': bad announce route: {}", name, err),
        },
        HelperCommand::WithdrawRoute(spec) => match spec.parse() {
            Ok((_, _, nlri)) => rib.lock().await.remove_from_config(&nlri),
            Err(err) => warn!("helper '{}': bad withdraw route: {}", name, err),
        },
        HelperCommand::AnnounceWatchdog(watchdog) => {
            rib.lock().await.arm_watchdog(&watchdog);
        }
        HelperCommand::WithdrawWatchdog(watchdog) => {
            rib.lock().await.disarm_watchdog(&watchdog);
        }
        HelperCommand::AnnounceFlow(flow) => match bgpd_core::utils::parse_flow_spec(&flow) {
            Ok((family, attributes, nlri)) => {
                rib.lock().await.insert_from_api(family, attributes, nlri);
            }
            Err(err) => warn!("helper '{}': bad announce flow: {}", name, err),
        },
        HelperCommand::WithdrawFlow(flow) => match bgpd_core::utils::parse_flow_spec(&flow) {
            Ok((_, _, nlri)) => rib.lock().await.remove_from_config(&nlri),
            Err(err) => warn!("helper '{}': bad withdraw flow: {}", name, err),
        },
        HelperCommand::Reload => return Some(ControlAction::Reload),
        HelperCommand::Restart => return Some(ControlAction::Restart),
        HelperCommand::Shutdown => return Some(ControlAction::Shutdown),
        HelperCommand::Version => {
            helpers
                .reply(name, &format!("version bgpd-core/{}", env!("CARGO_PKG_VERSION")))
                .await;
        }
        HelperCommand::ShowNeighbors => {
            let sessions = sessions.lock().await;
            if sessions.is_empty() {
                helpers.reply(name, "neighbors none").await;
            } else {
                for session in sessions.values() {
                    helpers
                        .reply(name, &format!("neighbor {} {}", session.addr(), session.state()))
                        .await;
                }
            }
        }
        HelperCommand::ShowRoutes { extensive } => {
            let rib = rib.lock().await;
            let routes = rib.get_routes();
            if routes.is_empty() {
                helpers.reply(name, "routes none").await;
            } else {
                for entry in &routes {
                    let route = entry.update();
                    let line = if extensive {
                        format!(
                            "route {} next-hop {:?} origin {:?} source {}",
                            nlri_to_string(&route.nlri),
                            route.attributes.next_hop,
                            route.attributes.origin,
                            entry.source(),
                        )
                    } else {
                        format!("route {}", nlri_to_string(&route.nlri))
                    };
                    helpers.reply(name, &line).await;
                }
            }
        }
        HelperCommand::Unknown(line) => {
            warn!("helper '{}' sent unrecognized command: {}", name, line);
            helpers.reply(name, &format!("unknown command {}", line)).await;
        }
    }
    None
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    let runtime = RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()?;

    match &args.cmd {
        Command::Run(opts) => {
            let api_addr: std::net::SocketAddr = args
                .api
                .unwrap_or_else(|| format!("{}:{}", args.host, args.port).parse().unwrap());
            runtime.block_on(run_daemon(&opts.config_path, api_addr))?;
        }
        _ => runtime.block_on(query_bgpd(&args)),
    }
    Ok(())
}
