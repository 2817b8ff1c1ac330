//! In-process loopback transport
//!
//! [`LoopbackNetwork`] implements both [`Transport`] and [`Launcher`]
//! without sockets or processes. Each registered host is served by a small
//! simulated client thread that acknowledges init and exit, answers frame
//! finish requests, and misbehaves on request (failed init, slow frames,
//! refused connections, a link that drops after some frames).
//!
//! Every write a host receives is recorded so tests can assert on what went
//! over the wire and how it was batched.
//!
//! # Example
//!
//! ```ignore
//! use lockstep::net::{ClientBehavior, LoopbackNetwork};
//!
//! let network = LoopbackNetwork::new();
//! network.add_host("render1", ClientBehavior::default());
//! network.add_host("render2", ClientBehavior { init_ok: false, ..Default::default() });
//! ```

use super::packet::{decode_packets, Packet, PacketKind};
use super::transport::{Connection, ConnectionDescription, Launcher, Transport};
use crate::error::{LockstepError, Result};
use crate::sync::{Monitor, WaitError};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// How a simulated remote node responds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBehavior {
    /// Whether init requests are answered at all
    pub reply_init: bool,
    /// Result carried by the init acknowledgement
    pub init_ok: bool,
    /// Result carried by the exit acknowledgement
    pub exit_ok: bool,
    /// Whether frame finish requests are answered at all
    pub reply_frames: bool,
    /// Delay before each frame finish reply
    pub frame_delay: Duration,
    /// Drop the link after this many started frames
    pub drop_after_frames: Option<u32>,
    /// Reject `connect` and never connect back after a launch
    pub refuse_connections: bool,
}

impl Default for ClientBehavior {
    fn default() -> Self {
        Self {
            reply_init: true,
            init_ok: true,
            exit_ok: true,
            reply_frames: true,
            frame_delay: Duration::ZERO,
            drop_after_frames: None,
            refuse_connections: false,
        }
    }
}

#[derive(Default)]
struct HostEntry {
    behavior: ClientBehavior,
    /// Decoded packets of every write received, one entry per write
    writes: Vec<Vec<Packet>>,
    links: Vec<Arc<LoopbackConnection>>,
}

#[derive(Default)]
struct NetworkInner {
    hosts: Mutex<HashMap<String, HostEntry>>,
    /// Connections of launched nodes waiting to be accepted, by node name
    pending: Monitor<HashMap<String, Arc<LoopbackConnection>>>,
    launched: Mutex<Vec<String>>,
}

impl NetworkInner {
    fn hosts(&self) -> std::sync::MutexGuard<'_, HashMap<String, HostEntry>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of simulated hosts
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut hosts: Vec<String> = self.inner.hosts().keys().cloned().collect();
        hosts.sort();
        f.debug_struct("LoopbackNetwork").field("hosts", &hosts).finish()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or reconfigure) a reachable host
    pub fn add_host(&self, hostname: impl Into<String>, behavior: ClientBehavior) {
        let hostname = hostname.into();
        tracing::debug!("Loopback host {} registered", hostname);
        self.inner.hosts().entry(hostname).or_default().behavior = behavior;
    }

    /// Change the behavior used by future connections to `hostname`
    pub fn set_behavior(&self, hostname: &str, behavior: ClientBehavior) -> bool {
        match self.inner.hosts().get_mut(hostname) {
            Some(entry) => {
                entry.behavior = behavior;
                true
            }
            None => false,
        }
    }

    /// Every write `hostname` received, decoded, in arrival order
    pub fn writes(&self, hostname: &str) -> Vec<Vec<Packet>> {
        self.inner
            .hosts()
            .get(hostname)
            .map(|entry| entry.writes.clone())
            .unwrap_or_default()
    }

    /// Packet kinds `hostname` received, flattened across writes
    pub fn received_kinds(&self, hostname: &str) -> Vec<PacketKind> {
        self.writes(hostname)
            .iter()
            .flatten()
            .filter_map(Packet::kind)
            .collect()
    }

    pub fn clear_writes(&self, hostname: &str) {
        if let Some(entry) = self.inner.hosts().get_mut(hostname) {
            entry.writes.clear();
        }
    }

    /// Launch commands seen so far
    pub fn launched_commands(&self) -> Vec<String> {
        self.inner
            .launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sever every live link to `hostname`, as if the host crashed
    pub fn disconnect(&self, hostname: &str) {
        let links = self
            .inner
            .hosts()
            .get_mut(hostname)
            .map(|entry| std::mem::take(&mut entry.links))
            .unwrap_or_default();
        for link in links {
            tracing::warn!("Loopback host {} dropping link", hostname);
            link.close();
        }
    }

    fn open_link(&self, hostname: &str) -> Result<Arc<LoopbackConnection>> {
        let behavior = match self.inner.hosts().get(hostname) {
            Some(entry) if entry.behavior.refuse_connections => {
                return Err(LockstepError::ConnectionFailure(format!(
                    "connection to {} refused",
                    hostname
                )))
            }
            Some(entry) => entry.behavior.clone(),
            None => {
                return Err(LockstepError::ConnectionFailure(format!(
                    "host {} unreachable",
                    hostname
                )))
            }
        };

        let (to_client, client_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let (client_tx, inbound) = crossbeam_channel::unbounded::<Vec<u8>>();
        let connected = Arc::new(AtomicBool::new(true));

        let client = SimulatedClient {
            hostname: hostname.to_string(),
            behavior,
            requests: client_rx,
            replies: client_tx,
            connected: connected.clone(),
        };
        thread::Builder::new()
            .name(format!("loopback-{}", hostname))
            .spawn(move || client.run())
            .map_err(|e| {
                LockstepError::ConnectionFailure(format!(
                    "could not start simulated client for {}: {}",
                    hostname, e
                ))
            })?;

        let link = Arc::new(LoopbackConnection {
            hostname: hostname.to_string(),
            network: Arc::downgrade(&self.inner),
            outbound: Mutex::new(Some(to_client)),
            inbound,
            connected,
        });
        if let Some(entry) = self.inner.hosts().get_mut(hostname) {
            entry.links.push(link.clone());
        }
        Ok(link)
    }

    /// First whitespace-separated token of `command` naming a registered host
    fn find_host(&self, tokens: &[&str]) -> Option<String> {
        let hosts = self.inner.hosts();
        tokens
            .iter()
            .map(|t| t.trim_matches(|c: char| c == '\'' || c == '"'))
            .find(|t| hosts.contains_key(*t))
            .map(str::to_string)
    }
}

impl Transport for LoopbackNetwork {
    fn connect(&self, description: &ConnectionDescription) -> Result<Arc<dyn Connection>> {
        tracing::debug!("Loopback connect to {}", description);
        let link: Arc<dyn Connection> = self.open_link(&description.hostname)?;
        Ok(link)
    }

    fn accept(&self, node: &str, timeout: Duration) -> Result<Arc<dyn Connection>> {
        let pending = self.inner.pending.lock();
        let (mut pending, waited) =
            self.inner
                .pending
                .wait_until(pending, Some(timeout), |p| p.contains_key(node));

        match waited {
            Ok(()) => match pending.remove(node) {
                Some(link) => Ok(link as Arc<dyn Connection>),
                None => Err(LockstepError::ConnectionFailure(format!(
                    "pending connection of {} vanished",
                    node
                ))),
            },
            Err(WaitError::TimedOut) => Err(LockstepError::Timeout(format!(
                "{} did not connect back within {:?}",
                node, timeout
            ))),
            Err(WaitError::Cancelled) => Err(LockstepError::Cancelled(format!(
                "accepting connection of {}",
                node
            ))),
        }
    }
}

impl Launcher for LoopbackNetwork {
    fn launch(&self, command: &str) -> Result<()> {
        self.inner
            .launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());

        let tokens: Vec<&str> = command.split_whitespace().collect();
        let node = tokens
            .iter()
            .position(|t| *t == "--lockstep-node")
            .and_then(|i| tokens.get(i + 1))
            .map(|t| t.trim_matches(|c: char| c == '\'' || c == '"').to_string())
            .ok_or_else(|| {
                LockstepError::LaunchFailure(format!("no node name in launch command: {}", command))
            })?;
        let host = self.find_host(&tokens).ok_or_else(|| {
            LockstepError::LaunchFailure(format!("no reachable host in launch command: {}", command))
        })?;

        tracing::info!("Loopback launching {} on {}", node, host);
        match self.open_link(&host) {
            Ok(link) => {
                self.inner.pending.update(|p| {
                    p.insert(node, link);
                });
            }
            // the process started but will never connect back
            Err(e) => tracing::debug!("Launched {} will not connect: {}", node, e),
        }
        Ok(())
    }
}

/// Coordinator side of a loopback link
pub struct LoopbackConnection {
    hostname: String,
    network: std::sync::Weak<NetworkInner>,
    outbound: Mutex<Option<Sender<Vec<u8>>>>,
    inbound: Receiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl Connection for LoopbackConnection {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(LockstepError::ConnectionFailure(format!(
                "link to {} is down",
                self.hostname
            )));
        }

        let packets = decode_packets(bytes)?;
        if let Some(network) = self.network.upgrade() {
            if let Some(entry) = network.hosts().get_mut(&self.hostname) {
                entry.writes.push(packets);
            }
        }

        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) if tx.send(bytes.to_vec()).is_ok() => Ok(()),
            _ => {
                self.connected.store(false, Ordering::SeqCst);
                Err(LockstepError::ConnectionFailure(format!(
                    "link to {} is down",
                    self.hostname
                )))
            }
        }
    }

    fn inbound(&self) -> Receiver<Vec<u8>> {
        self.inbound.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn peer(&self) -> String {
        format!("loopback://{}", self.hostname)
    }
}

/// Remote side of a loopback link
struct SimulatedClient {
    hostname: String,
    behavior: ClientBehavior,
    requests: Receiver<Vec<u8>>,
    replies: Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
}

impl SimulatedClient {
    fn run(self) {
        tracing::debug!("Simulated client {} up", self.hostname);
        let mut frames_started = 0u32;

        'link: while let Ok(bytes) = self.requests.recv() {
            let packets = match decode_packets(&bytes) {
                Ok(packets) => packets,
                Err(e) => {
                    tracing::warn!("Simulated client {} got garbage: {}", self.hostname, e);
                    continue;
                }
            };

            let mut reply = Vec::new();
            for packet in packets {
                match packet.kind() {
                    Some(PacketKind::ConfigInit) if self.behavior.reply_init => {
                        Packet::config_init_reply(self.behavior.init_ok).encode_into(&mut reply)
                    }
                    Some(PacketKind::ConfigExit) => {
                        Packet::config_exit_reply(self.behavior.exit_ok).encode_into(&mut reply)
                    }
                    Some(PacketKind::FrameStart) => {
                        frames_started += 1;
                        if self
                            .behavior
                            .drop_after_frames
                            .is_some_and(|limit| frames_started > limit)
                        {
                            tracing::warn!(
                                "Simulated client {} dropping link at frame {}",
                                self.hostname,
                                packet.header.frame_number
                            );
                            break 'link;
                        }
                    }
                    Some(PacketKind::FrameFinish) if self.behavior.reply_frames => {
                        if !self.behavior.frame_delay.is_zero() {
                            thread::sleep(self.behavior.frame_delay);
                        }
                        Packet::frame_finish_reply(packet.header.frame_number)
                            .encode_into(&mut reply);
                    }
                    _ => {}
                }
            }

            if !reply.is_empty() && self.replies.send(reply).is_err() {
                break;
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!("Simulated client {} down", self.hostname);
    }
}
