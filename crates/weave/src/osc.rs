//! OSC domain
//!
//! Listens for OSC over UDP on its own thread. If the configured port is
//! taken (usually by another instance of the app on the same machine), the
//! domain walks up the port range and comes up in the `Command` role, so a
//! second copy can still be driven remotely.
//!
//! Inbound traffic goes through housekeeping before the app sees it:
//!
//! | address              | args              | effect                                   |
//! |----------------------|-------------------|------------------------------------------|
//! | `/handshake`         | `[int port]?`     | record peer, reply `/handshake/ack`       |
//! | registered parameter | `[number]`        | set the value (clamped)                  |
//! | registered parameter | none              | reply with the current value             |
//! | anything else        |                   | `on_message` hook                        |

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use portable_atomic::AtomicF32;
use rosc::{OscMessage, OscPacket, OscType};
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use weaveconf::OscSection;

use crate::domain::{Domain, DomainContext, DomainKind, DomainState, Lifecycle, Transition};
use crate::error::{DomainError, Result};
use crate::hooks::{AppHooks, MessageHook};

pub const HANDSHAKE_ADDR: &str = "/handshake";
pub const HANDSHAKE_ACK_ADDR: &str = "/handshake/ack";

/// Largest UDP payload we accept.
const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscConfig {
    pub port: u16,
    pub bind_address: String,
    /// How far above `port` to search when it is taken
    pub max_port_offset: u16,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            port: 9010,
            bind_address: "0.0.0.0".to_string(),
            max_port_offset: 100,
        }
    }
}

impl From<&OscSection> for OscConfig {
    fn from(section: &OscSection) -> Self {
        Self {
            port: section.port,
            bind_address: section.bind_address.clone(),
            max_port_offset: section.max_port_offset,
        }
    }
}

/// Whether this instance got the configured port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscRole {
    Primary,
    /// Bound to a fallback port
    Command,
}

impl OscRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OscRole::Primary => "primary",
            OscRole::Command => "command",
        }
    }
}

/// Bind `(bind_address, port + offset)` for the smallest offset in
/// `0..=max_port_offset` that succeeds.
pub fn bind_with_fallback(config: &OscConfig) -> Result<(UdpSocket, u16, OscRole)> {
    let last = config.port.saturating_add(config.max_port_offset);
    for offset in 0..=config.max_port_offset {
        let Some(port) = config.port.checked_add(offset) else {
            break;
        };
        match UdpSocket::bind((config.bind_address.as_str(), port)) {
            Ok(socket) => {
                let role = if offset == 0 {
                    OscRole::Primary
                } else {
                    OscRole::Command
                };
                // Port 0 asks the OS for one; report what we actually got.
                let port = socket.local_addr().map(|a| a.port()).unwrap_or(port);
                return Ok((socket, port, role));
            }
            Err(e) => {
                debug!("{}:{} unavailable: {}", config.bind_address, port, e);
            }
        }
    }
    Err(DomainError::PortRangeExhausted {
        address: config.bind_address.clone(),
        first: config.port,
        last,
    })
}

/// A float value settable over OSC.
#[derive(Debug, Clone)]
pub struct Parameter {
    address: String,
    value: Arc<AtomicF32>,
    min: f32,
    max: f32,
}

impl Parameter {
    pub fn new(address: impl Into<String>, default: f32, min: f32, max: f32) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            address: address.into(),
            value: Arc::new(AtomicF32::new(default.clamp(min, max))),
            min,
            max,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn get(&self) -> f32 {
        self.value.load(Ordering::Relaxed)
    }

    /// Set the value, clamped to the parameter's range.
    pub fn set(&self, value: f32) {
        if value.is_nan() {
            return;
        }
        self.value.store(value.clamp(self.min, self.max), Ordering::Relaxed);
    }

    pub fn range(&self) -> (f32, f32) {
        (self.min, self.max)
    }
}

/// Parameters reachable by OSC address. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    inner: Arc<RwLock<BTreeMap<String, Parameter>>>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, parameter: Parameter) {
        let mut table = self.inner.write().unwrap_or_else(|e| e.into_inner());
        debug!("parameter registered at {}", parameter.address());
        table.insert(parameter.address().to_string(), parameter);
    }

    pub fn get(&self, address: &str) -> Option<Parameter> {
        let table = self.inner.read().unwrap_or_else(|e| e.into_inner());
        table.get(address).cloned()
    }

    pub fn addresses(&self) -> Vec<String> {
        let table = self.inner.read().unwrap_or_else(|e| e.into_inner());
        table.keys().cloned().collect()
    }
}

fn as_f32(arg: &OscType) -> Option<f32> {
    match arg {
        OscType::Float(v) => Some(*v),
        OscType::Double(v) => Some(*v as f32),
        OscType::Int(v) => Some(*v as f32),
        OscType::Long(v) => Some(*v as f32),
        OscType::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Housekeeping and hook dispatch for inbound packets.
///
/// Returns the replies to send; the caller owns the socket.
#[derive(Clone)]
pub struct OscDispatcher {
    role: OscRole,
    port: u16,
    parameters: ParameterRegistry,
    peers: Arc<Mutex<Vec<SocketAddr>>>,
    hook: Option<MessageHook>,
}

impl OscDispatcher {
    pub fn new(
        role: OscRole,
        port: u16,
        parameters: ParameterRegistry,
        peers: Arc<Mutex<Vec<SocketAddr>>>,
        hook: Option<MessageHook>,
    ) -> Self {
        Self {
            role,
            port,
            parameters,
            peers,
            hook,
        }
    }

    pub fn dispatch(&self, packet: OscPacket, from: SocketAddr) -> Vec<(SocketAddr, OscMessage)> {
        let mut replies = Vec::new();
        self.dispatch_into(packet, from, &mut replies);
        replies
    }

    fn dispatch_into(
        &self,
        packet: OscPacket,
        from: SocketAddr,
        replies: &mut Vec<(SocketAddr, OscMessage)>,
    ) {
        match packet {
            OscPacket::Message(msg) => self.dispatch_message(msg, from, replies),
            OscPacket::Bundle(bundle) => {
                for inner in bundle.content {
                    self.dispatch_into(inner, from, replies);
                }
            }
        }
    }

    fn dispatch_message(
        &self,
        msg: OscMessage,
        from: SocketAddr,
        replies: &mut Vec<(SocketAddr, OscMessage)>,
    ) {
        if msg.addr == HANDSHAKE_ADDR {
            let peer = match msg.args.first() {
                Some(OscType::Int(port)) => u16::try_from(*port)
                    .map(|port| SocketAddr::new(from.ip(), port))
                    .unwrap_or(from),
                _ => from,
            };
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            if !peers.contains(&peer) {
                info!("OSC handshake from {}", peer);
                peers.push(peer);
            }
            replies.push((
                from,
                OscMessage {
                    addr: HANDSHAKE_ACK_ADDR.to_string(),
                    args: vec![
                        OscType::String(self.role.as_str().to_string()),
                        OscType::Int(i32::from(self.port)),
                    ],
                },
            ));
            return;
        }

        if let Some(parameter) = self.parameters.get(&msg.addr) {
            match msg.args.as_slice() {
                [] => {
                    replies.push((
                        from,
                        OscMessage {
                            addr: msg.addr,
                            args: vec![OscType::Float(parameter.get())],
                        },
                    ));
                    return;
                }
                [arg] => {
                    if let Some(value) = as_f32(arg) {
                        parameter.set(value);
                        debug!("{} = {}", msg.addr, parameter.get());
                        return;
                    }
                }
                _ => {}
            }
        }

        match &self.hook {
            Some(hook) => hook(&msg, from),
            None => debug!("unhandled OSC message {} from {}", msg.addr, from),
        }
    }
}

/// Encode a message as a single OSC packet.
pub fn encode_message(msg: &OscMessage) -> Result<Vec<u8>> {
    rosc::encoder::encode(&OscPacket::Message(msg.clone()))
        .map_err(|e| DomainError::Codec(format!("OSC encode failed: {}", e)))
}

pub struct OscDomain {
    lifecycle: Lifecycle,
    config: OscConfig,
    /// Port the fallback search starts from on every start
    base_port: u16,
    role: OscRole,
    resolved_port: Option<u16>,
    parameters: ParameterRegistry,
    peers: Arc<Mutex<Vec<SocketAddr>>>,
    hook: Option<MessageHook>,
    sender: Option<UdpSocket>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl OscDomain {
    pub fn new(config: OscConfig) -> Self {
        Self {
            lifecycle: Lifecycle::new("osc"),
            base_port: config.port,
            config,
            role: OscRole::Primary,
            resolved_port: None,
            parameters: ParameterRegistry::new(),
            peers: Arc::new(Mutex::new(Vec::new())),
            hook: None,
            sender: None,
            shutdown_tx: None,
            thread_handle: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.lifecycle = Lifecycle::new(name);
        self
    }

    /// Current configuration; `port` holds the resolved port once started.
    pub fn config(&self) -> &OscConfig {
        &self.config
    }

    /// Configured port, where the fallback search starts.
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn role(&self) -> OscRole {
        self.role
    }

    pub fn resolved_port(&self) -> Option<u16> {
        self.resolved_port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sender.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn parameters(&self) -> &ParameterRegistry {
        &self.parameters
    }

    pub fn register_parameter(&self, parameter: Parameter) {
        self.parameters.register(parameter);
    }

    /// Peers that completed a handshake.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_message_hook(
        &mut self,
        f: impl Fn(&OscMessage, SocketAddr) + Send + Sync + 'static,
    ) {
        self.hook = Some(Arc::new(f));
    }

    /// Send from the bound socket, so replies come back to this domain.
    pub fn send(&self, to: SocketAddr, msg: &OscMessage) -> Result<()> {
        let socket = self
            .sender
            .as_ref()
            .ok_or_else(|| DomainError::unavailable("OSC socket", "domain is not running"))?;
        let bytes = encode_message(msg)?;
        socket.send_to(&bytes, to)?;
        Ok(())
    }

    fn shutdown_listener(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            debug!("waiting for OSC listener to stop");
            if handle.join().is_err() {
                error!("OSC listener thread panicked");
            }
        }
        self.sender = None;
    }
}

impl Domain for OscDomain {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn kind(&self) -> DomainKind {
        DomainKind::Asynchronous
    }

    fn state(&self) -> DomainState {
        self.lifecycle.state()
    }

    fn bind_callbacks(&mut self, hooks: &mut AppHooks) {
        if self.hook.is_none() {
            self.hook = hooks.message();
        }
    }

    fn initialize(&mut self, _ctx: &DomainContext) -> Result<()> {
        self.lifecycle.check(Transition::Initialize)?;
        (self.config.bind_address.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| {
                DomainError::unavailable(format!("OSC address '{}'", self.config.bind_address), e)
            })?;
        self.lifecycle.commit(Transition::Initialize);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Start)?;

        let requested = self.base_port;
        let search = OscConfig {
            port: requested,
            ..self.config.clone()
        };
        let (socket, port, role) = bind_with_fallback(&search)?;
        if role == OscRole::Command {
            warn!(
                "OSC port {} in use; listening on {} as command instance",
                requested, port
            );
        }
        self.config.port = port;
        self.resolved_port = Some(port);
        self.role = role;
        self.sender = Some(socket.try_clone()?);

        let dispatcher = OscDispatcher::new(
            role,
            port,
            self.parameters.clone(),
            Arc::clone(&self.peers),
            self.hook.clone(),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = thread::Builder::new()
            .name(format!("weave-{}", self.lifecycle.name()))
            .spawn(move || {
                if let Err(e) = run_listener(socket, dispatcher, shutdown_rx) {
                    error!("OSC listener failed: {}", e);
                }
            })
            .map_err(|e| DomainError::Thread(e.to_string()))?;

        self.shutdown_tx = Some(shutdown_tx);
        self.thread_handle = Some(handle);
        self.lifecycle.commit(Transition::Start);
        info!(
            "OSC listening on {}:{} ({})",
            self.config.bind_address,
            port,
            role.as_str()
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Stop)?;
        self.shutdown_listener();
        self.lifecycle.commit(Transition::Stop);
        info!("OSC listener stopped");
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.lifecycle.begin_cleanup() {
            return Ok(());
        }
        self.shutdown_listener();
        self.lifecycle.commit(Transition::Cleanup);
        Ok(())
    }
}

fn run_listener(
    socket: UdpSocket,
    dispatcher: OscDispatcher,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    runtime.block_on(async move {
        socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket)?;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            let packet = match rosc::decoder::decode_udp(&buf[..len]) {
                                Ok((_, packet)) => packet,
                                Err(e) => {
                                    debug!("dropping malformed OSC packet from {}: {:?}", from, e);
                                    continue;
                                }
                            };
                            for (to, reply) in dispatcher.dispatch(packet, from) {
                                match encode_message(&reply) {
                                    Ok(bytes) => {
                                        if let Err(e) = socket.send_to(&bytes, to).await {
                                            warn!("OSC reply to {} failed: {}", to, e);
                                        }
                                    }
                                    Err(e) => warn!("{}", e),
                                }
                            }
                        }
                        Err(e) => {
                            warn!("OSC socket error: {}", e);
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!("OSC listener shutdown signal received");
                    break;
                }
            }
        }
        Ok::<(), DomainError>(())
    })
}
