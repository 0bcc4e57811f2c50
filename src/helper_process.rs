//! The text-line protocol used to talk to cooperating helper processes
//! (announce/withdraw routes dynamically, receive learned UPDATEs).
//!
//! A helper process is any child program configured to run alongside
//! `bgpd`; it is spawned once at startup and kept alive across config
//! reloads. We write it status lines on its stdin and read commands
//! back from its stdout, LF-terminated, matching the conventions of
//! the ExaBGP process API this interface is modeled on.

use std::net::IpAddr;
use std::process::Stdio;

use bgp_rs::NLRIEncoding;
use futures::future::select_all;
use log::{error, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, Command};

use crate::config::{FlowSpec, ProcessConfig, RouteSpec};
use crate::utils::nlri_to_string;

/// A command sent by a helper process on its stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperCommand {
    AnnounceRoute(RouteSpec),
    WithdrawRoute(RouteSpec),
    AnnounceFlow(FlowSpec),
    WithdrawFlow(FlowSpec),
    AnnounceWatchdog(String),
    WithdrawWatchdog(String),
    Reload,
    Restart,
    Shutdown,
    Version,
    ShowNeighbors,
    ShowRoutes { extensive: bool },
    Unknown(String),
}

/// Classify a single line of process stdout into a `HelperCommand`.
///
/// Grounded in the supervisor's `handle_commands()` classification:
/// announce/withdraw of routes, flows, and watchdogs are recognized
/// by their leading two words; everything else falls through to the
/// control verbs, the `show ` prefix, or `Unknown`.
pub fn classify_command(line: &str) -> HelperCommand {
    let line = line.trim();
    let mut words = line.splitn(3, ' ');
    match (words.next(), words.next(), words.next()) {
        (Some("announce"), Some("watchdog"), Some(name)) => {
            HelperCommand::AnnounceWatchdog(name.to_string())
        }
        (Some("withdraw"), Some("watchdog"), Some(name)) => {
            HelperCommand::WithdrawWatchdog(name.to_string())
        }
        (Some("announce"), Some("route"), Some(rest)) => match parse_route_line(rest) {
            Some(spec) => HelperCommand::AnnounceRoute(spec),
            None => HelperCommand::Unknown(line.to_string()),
        },
        (Some("withdraw"), Some("route"), Some(rest)) => match parse_route_line(rest) {
            Some(spec) => HelperCommand::WithdrawRoute(spec),
            None => HelperCommand::Unknown(line.to_string()),
        },
        (Some("announce"), Some("flow"), Some(rest)) => match parse_flow_line(rest) {
            Some(spec) => HelperCommand::AnnounceFlow(spec),
            None => HelperCommand::Unknown(line.to_string()),
        },
        (Some("withdraw"), Some("flow"), Some(rest)) => match parse_flow_line(rest) {
            Some(spec) => HelperCommand::WithdrawFlow(spec),
            None => HelperCommand::Unknown(line.to_string()),
        },
        (Some("reload"), None, None) => HelperCommand::Reload,
        (Some("restart"), None, None) => HelperCommand::Restart,
        (Some("shutdown"), None, None) => HelperCommand::Shutdown,
        (Some("version"), None, None) => HelperCommand::Version,
        (Some("show"), Some("neighbors"), None) => HelperCommand::ShowNeighbors,
        (Some("show"), Some("routes"), rest) => HelperCommand::ShowRoutes {
            extensive: rest == Some("extensive"),
        },
        _ => HelperCommand::Unknown(line.to_string()),
    }
}

/// `<prefix> <next-hop> [attr ...]`, the wire-ish shorthand helpers use.
fn parse_route_line(rest: &str) -> Option<RouteSpec> {
    let mut parts = rest.split_whitespace();
    let prefix = parts.next()?.parse().ok()?;
    let next_hop: IpAddr = parts.next()?.parse().ok()?;
    Some(RouteSpec {
        prefix,
        next_hop,
        origin: None,
        local_pref: None,
        med: None,
        as_path: vec![],
        communities: vec![],
        watchdog: None,
    })
}

/// Render an NLRI (and optional next-hop) as the text form streamed to
/// helpers for received UPDATEs, e.g. `10.0.0.0/24 next-hop 192.168.1.1`.
fn format_route(nlri: &NLRIEncoding, next_hop: Option<IpAddr>) -> String {
    let prefix = nlri_to_string(nlri);
    match next_hop {
        Some(next_hop) => format!("{} next-hop {}", prefix, next_hop),
        None => format!("{} withdraw", prefix),
    }
}

/// `<afi> <action> [match ...]`
fn parse_flow_line(rest: &str) -> Option<FlowSpec> {
    let mut parts = rest.splitn(2, ' ');
    let afi = match parts.next()? {
        "ipv4" => 1,
        "ipv6" => 2,
        _ => return None,
    };
    let action = parts.next()?.to_string();
    Some(FlowSpec::new(afi, action, vec![]))
}

/// A spawned helper process and the handles used to talk to it.
pub struct HelperProcess {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<tokio::process::ChildStdout>>,
}

impl HelperProcess {
    /// Spawn `cmd` as a helper process, wiring its stdin/stdout as pipes.
    pub fn spawn(name: &str, cmd: &str, args: &[String]) -> std::io::Result<Self> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        Ok(Self {
            name: name.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write a single status line, LF-terminated.
    pub async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }

    pub async fn neighbor_up(&mut self, peer: IpAddr) -> std::io::Result<()> {
        self.send_line(&format!("neighbor {} up", peer)).await
    }

    pub async fn neighbor_down(&mut self, peer: IpAddr, reason: &str) -> std::io::Result<()> {
        self.send_line(&format!("neighbor {} down {}", peer, reason))
            .await
    }

    pub async fn update_start(&mut self, peer: IpAddr) -> std::io::Result<()> {
        self.send_line(&format!("neighbor {} update start", peer))
            .await
    }

    pub async fn update_end(&mut self, peer: IpAddr) -> std::io::Result<()> {
        self.send_line(&format!("neighbor {} update end", peer))
            .await
    }

    pub async fn route_line(
        &mut self,
        peer: IpAddr,
        nlri: &NLRIEncoding,
        next_hop: Option<IpAddr>,
    ) -> std::io::Result<()> {
        self.send_line(&format!("neighbor {} {}", peer, format_route(nlri, next_hop)))
            .await
    }

    /// Poll for the next classified command from this helper's stdout,
    /// returning `None` at EOF (the helper exited).
    pub async fn next_command(&mut self) -> std::io::Result<Option<HelperCommand>> {
        match self.stdout.next_line().await? {
            Some(line) => Ok(Some(classify_command(&line))),
            None => {
                warn!("helper process '{}' closed stdout", self.name);
                Ok(None)
            }
        }
    }

    /// Tear down the child, logging (but not failing on) a non-zero exit.
    pub async fn shutdown(mut self) {
        if let Err(err) = self.child.kill().await {
            error!("failed to terminate helper process '{}': {}", self.name, err);
        }
    }
}

/// All configured helper processes, spawned once at daemon startup and kept
/// alive across config reloads (reloading never respawns them).
pub struct HelperRegistry {
    processes: Vec<HelperProcess>,
    configs: Vec<ProcessConfig>,
}

impl HelperRegistry {
    pub fn spawn(configs: &[ProcessConfig]) -> std::io::Result<Self> {
        let mut processes = Vec::with_capacity(configs.len());
        for cfg in configs {
            processes.push(HelperProcess::spawn(&cfg.name, &cfg.command, &cfg.args)?);
        }
        Ok(Self {
            processes,
            configs: configs.to_vec(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub async fn neighbor_up(&mut self, peer: IpAddr) {
        for (process, cfg) in self.processes.iter_mut().zip(self.configs.iter()) {
            if cfg.subscribes_to(peer) {
                if let Err(err) = process.neighbor_up(peer).await {
                    warn!("helper '{}': {}", process.name(), err);
                }
            }
        }
    }

    pub async fn neighbor_down(&mut self, peer: IpAddr, reason: &str) {
        for (process, cfg) in self.processes.iter_mut().zip(self.configs.iter()) {
            if cfg.subscribes_to(peer) {
                if let Err(err) = process.neighbor_down(peer, reason).await {
                    warn!("helper '{}': {}", process.name(), err);
                }
            }
        }
    }

    pub async fn update_start(&mut self, peer: IpAddr) {
        for (process, cfg) in self.processes.iter_mut().zip(self.configs.iter()) {
            if cfg.subscribes_to(peer) {
                if let Err(err) = process.update_start(peer).await {
                    warn!("helper '{}': {}", process.name(), err);
                }
            }
        }
    }

    pub async fn update_end(&mut self, peer: IpAddr) {
        for (process, cfg) in self.processes.iter_mut().zip(self.configs.iter()) {
            if cfg.subscribes_to(peer) {
                if let Err(err) = process.update_end(peer).await {
                    warn!("helper '{}': {}", process.name(), err);
                }
            }
        }
    }

    pub async fn stream_update(&mut self, peer: IpAddr, nlri: &NLRIEncoding, next_hop: Option<IpAddr>) {
        for (process, cfg) in self.processes.iter_mut().zip(self.configs.iter()) {
            if cfg.subscribes_to(peer) {
                if let Err(err) = process.route_line(peer, nlri, next_hop).await {
                    warn!("helper '{}': {}", process.name(), err);
                }
            }
        }
    }

    /// Send a single reply line back to the named helper process (a command
    /// response or `unknown command <c>`). No-op if the name isn't found,
    /// which can only happen if the helper has already exited.
    pub async fn reply(&mut self, name: &str, line: &str) {
        if let Some(process) = self.processes.iter_mut().find(|p| p.name() == name) {
            if let Err(err) = process.send_line(line).await {
                warn!("helper '{}': {}", process.name(), err);
            }
        }
    }

    /// Terminate every helper process. Called once, at daemon shutdown.
    pub async fn shutdown_all(self) {
        for process in self.processes {
            process.shutdown().await;
        }
    }

    /// Wait for the next classified command from any helper process's
    /// stdout. A process that closes its stdout just drops out of the race
    /// on subsequent calls (`Ok(None)` is swallowed, not propagated).
    pub async fn next_command(&mut self) -> Option<(String, HelperCommand)> {
        if self.processes.is_empty() {
            return futures::future::pending().await;
        }
        let futs = self
            .processes
            .iter_mut()
            .map(|p| Box::pin(async move { (p.name().to_string(), p.next_command().await) }));
        let (result, _idx, _rest) = select_all(futs).await;
        match result {
            (name, Ok(Some(cmd))) => Some((name, cmd)),
            (name, Ok(None)) => {
                warn!("helper process '{}' produced no command", name);
                None
            }
            (name, Err(err)) => {
                warn!("helper process '{}' read error: {}", name, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_control_verbs() {
        assert_eq!(classify_command("reload"), HelperCommand::Reload);
        assert_eq!(classify_command("restart"), HelperCommand::Restart);
        assert_eq!(classify_command("shutdown"), HelperCommand::Shutdown);
        assert_eq!(classify_command("version"), HelperCommand::Version);
    }

    #[test]
    fn test_classify_show_commands() {
        assert_eq!(classify_command("show neighbors"), HelperCommand::ShowNeighbors);
        assert_eq!(
            classify_command("show routes"),
            HelperCommand::ShowRoutes { extensive: false }
        );
        assert_eq!(
            classify_command("show routes extensive"),
            HelperCommand::ShowRoutes { extensive: true }
        );
    }

    #[test]
    fn test_classify_watchdog() {
        assert_eq!(
            classify_command("announce watchdog linkup"),
            HelperCommand::AnnounceWatchdog("linkup".to_string())
        );
        assert_eq!(
            classify_command("withdraw watchdog linkup"),
            HelperCommand::WithdrawWatchdog("linkup".to_string())
        );
    }

    #[test]
    fn test_classify_route() {
        match classify_command("announce route 10.0.0.0/24 192.168.1.1") {
            HelperCommand::AnnounceRoute(spec) => {
                assert_eq!(spec.prefix.to_string(), "10.0.0.0/24");
                assert_eq!(spec.next_hop.to_string(), "192.168.1.1");
            }
            other => panic!("expected AnnounceRoute, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_unknown() {
        match classify_command("frobnicate everything") {
            HelperCommand::Unknown(line) => assert_eq!(line, "frobnicate everything"),
            other => panic!("expected Unknown, got {:?}", other),
        }
    }
}
