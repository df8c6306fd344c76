//! State distribution over UDP
//!
//! A primary publishes its shared state every tick; replicas pick up the
//! newest datagram on their next tick. Datagrams may be lost, duplicated or
//! reordered, and nothing is acknowledged: receivers simply keep the last
//! packet that decodes.
//!
//! ```text
//! primary                                   replica
//! simulate(&mut T) ──► StateSnapshot<T>     StateSnapshot<T> ──► local copy
//!                          │                     ▲
//!                   StateSendDomain ── UDP ──► StateReceiveDomain
//! ```

mod codec;

pub use codec::{JsonCodec, MsgPackCodec, StateCodec};

use std::marker::PhantomData;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use weaveconf::StateSection;

use crate::domain::{
    Domain, DomainContext, DomainKind, DomainState, Lifecycle, SubDomainPhase, SubDomains,
    SynchronousDomain, Transition,
};
use crate::error::{DomainError, Result};

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Bound on state types that can be distributed.
pub trait SharedState: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> SharedState for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// One datagram on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePacket<T> {
    /// Identifies the sending process
    pub sender: Uuid,
    /// Increments on every send from `sender`
    pub sequence: u64,
    pub state: T,
}

/// Latest published value, shared across threads.
///
/// Writers swap in a new `Arc<T>`; readers clone the `Arc` and never see a
/// half-written value.
pub struct StateSnapshot<T> {
    inner: Arc<SnapshotInner<T>>,
}

struct SnapshotInner<T> {
    latest: Mutex<Option<Arc<T>>>,
    version: AtomicU64,
}

impl<T> StateSnapshot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                latest: Mutex::new(None),
                version: AtomicU64::new(0),
            }),
        }
    }

    pub fn publish(&self, value: T) {
        self.publish_arc(Arc::new(value));
    }

    pub fn publish_arc(&self, value: Arc<T>) {
        let mut latest = self.inner.latest.lock().unwrap_or_else(|e| e.into_inner());
        *latest = Some(value);
        self.inner.version.fetch_add(1, Ordering::Release);
    }

    pub fn latest(&self) -> Option<Arc<T>> {
        self.inner
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of publishes so far.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }
}

impl<T> Clone for StateSnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for StateSnapshot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for StateSnapshot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSnapshot")
            .field("version", &self.version())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSendConfig {
    /// `host:port` of every replica
    pub destinations: Vec<String>,
    pub max_packet_size: usize,
}

impl Default for StateSendConfig {
    fn default() -> Self {
        Self::from(&StateSection::default())
    }
}

impl From<&StateSection> for StateSendConfig {
    fn from(section: &StateSection) -> Self {
        Self {
            destinations: section.destinations.clone(),
            max_packet_size: section.max_packet_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateReceiveConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for StateReceiveConfig {
    fn default() -> Self {
        Self::from(&StateSection::default())
    }
}

impl From<&StateSection> for StateReceiveConfig {
    fn from(section: &StateSection) -> Self {
        Self {
            bind_address: section.bind_address.clone(),
            port: section.port,
        }
    }
}

/// Sends the latest snapshot to every destination on each tick.
pub struct StateSendDomain<T, C = MsgPackCodec> {
    lifecycle: Lifecycle,
    config: StateSendConfig,
    snapshot: StateSnapshot<T>,
    socket: Option<UdpSocket>,
    destinations: Vec<SocketAddr>,
    sender_id: Uuid,
    sequence: u64,
    _codec: PhantomData<C>,
}

impl<T: SharedState, C: StateCodec> StateSendDomain<T, C> {
    pub fn new(config: StateSendConfig, snapshot: StateSnapshot<T>) -> Self {
        Self {
            lifecycle: Lifecycle::new("state-send"),
            config,
            snapshot,
            socket: None,
            destinations: Vec::new(),
            sender_id: Uuid::new_v4(),
            sequence: 0,
            _codec: PhantomData,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot<T> {
        self.snapshot.clone()
    }

    pub fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    /// Packets sent so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn destinations(&self) -> &[SocketAddr] {
        &self.destinations
    }

    fn resolve_destinations(&self) -> Result<Vec<SocketAddr>> {
        let mut resolved = Vec::new();
        for destination in &self.config.destinations {
            let addr = destination
                .to_socket_addrs()
                .map_err(|e| DomainError::unavailable(format!("state destination '{}'", destination), e))?
                .next()
                .ok_or_else(|| {
                    DomainError::unavailable(
                        format!("state destination '{}'", destination),
                        "no address",
                    )
                })?;
            resolved.push(addr);
        }
        Ok(resolved)
    }

    /// Encode and send the current snapshot. Does nothing before the first
    /// publish.
    pub fn send_latest(&mut self) -> Result<()> {
        let Some(state) = self.snapshot.latest() else {
            return Ok(());
        };
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| DomainError::unavailable("state socket", "domain is not initialized"))?;

        let packet = StatePacket {
            sender: self.sender_id,
            sequence: self.sequence,
            state: &*state,
        };
        let bytes = C::encode(&packet)?;
        let limit = self.config.max_packet_size.min(MAX_DATAGRAM_SIZE);
        if bytes.len() > limit {
            return Err(DomainError::PacketTooLarge {
                size: bytes.len(),
                limit,
            });
        }

        let mut first = None;
        for to in &self.destinations {
            if let Err(e) = socket.send_to(&bytes, to) {
                debug!("state send to {} failed: {}", to, e);
                first.get_or_insert(e);
            }
        }
        self.sequence += 1;
        first.map_or(Ok(()), |e| Err(e.into()))
    }
}

impl<T: SharedState, C: StateCodec> Domain for StateSendDomain<T, C> {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn kind(&self) -> DomainKind {
        DomainKind::Synchronous
    }

    fn state(&self) -> DomainState {
        self.lifecycle.state()
    }

    fn initialize(&mut self, _ctx: &DomainContext) -> Result<()> {
        self.lifecycle.check(Transition::Initialize)?;
        if self.config.max_packet_size > MAX_DATAGRAM_SIZE {
            warn!(
                "max_packet_size {} exceeds a UDP datagram; using {}",
                self.config.max_packet_size, MAX_DATAGRAM_SIZE
            );
            self.config.max_packet_size = MAX_DATAGRAM_SIZE;
        }

        let destinations = self.resolve_destinations()?;
        let any = if destinations.iter().any(|d| d.is_ipv6()) {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket =
            UdpSocket::bind(any).map_err(|e| DomainError::unavailable("state send socket", e))?;

        info!(
            "state sender {} -> {:?} ({})",
            self.sender_id,
            destinations,
            C::NAME
        );
        self.destinations = destinations;
        self.socket = Some(socket);
        self.lifecycle.commit(Transition::Initialize);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Start)?;
        self.lifecycle.commit(Transition::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Stop)?;
        self.lifecycle.commit(Transition::Stop);
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.lifecycle.begin_cleanup() {
            return Ok(());
        }
        self.socket = None;
        self.lifecycle.commit(Transition::Cleanup);
        debug!("state sender closed after {} packets", self.sequence);
        Ok(())
    }
}

impl<T: SharedState, C: StateCodec> SynchronousDomain for StateSendDomain<T, C> {
    fn tick(&mut self, _dt: f64) -> Result<()> {
        self.send_latest()
    }
}

/// Receives state datagrams and publishes the newest one on each tick.
pub struct StateReceiveDomain<T, C = MsgPackCodec> {
    lifecycle: Lifecycle,
    config: StateReceiveConfig,
    snapshot: StateSnapshot<T>,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
    last_packet: Option<(Uuid, u64)>,
    received: u64,
    _codec: PhantomData<C>,
}

impl<T: SharedState, C: StateCodec> StateReceiveDomain<T, C> {
    pub fn new(config: StateReceiveConfig, snapshot: StateSnapshot<T>) -> Self {
        Self {
            lifecycle: Lifecycle::new("state-receive"),
            config,
            snapshot,
            socket: None,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
            last_packet: None,
            received: 0,
            _codec: PhantomData,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot<T> {
        self.snapshot.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Sender and sequence of the packet most recently applied.
    pub fn last_packet(&self) -> Option<(Uuid, u64)> {
        self.last_packet
    }

    /// Packets applied so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Drain pending datagrams and publish the last one that decodes.
    /// Returns whether a new state was published.
    pub fn poll(&mut self) -> Result<bool> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| DomainError::unavailable("state socket", "domain is not initialized"))?;

        let mut newest: Option<StatePacket<T>> = None;
        loop {
            match socket.recv_from(&mut self.buf) {
                Ok((len, from)) => match C::decode::<T>(&self.buf[..len]) {
                    Ok(packet) => newest = Some(packet),
                    Err(e) => debug!("dropping state datagram from {}: {}", from, e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("state receive error: {}", e);
                    break;
                }
            }
        }

        let Some(packet) = newest else {
            return Ok(false);
        };
        self.last_packet = Some((packet.sender, packet.sequence));
        self.received += 1;
        self.snapshot.publish(packet.state);
        Ok(true)
    }
}

impl<T: SharedState, C: StateCodec> Domain for StateReceiveDomain<T, C> {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn kind(&self) -> DomainKind {
        DomainKind::Synchronous
    }

    fn state(&self) -> DomainState {
        self.lifecycle.state()
    }

    fn initialize(&mut self, _ctx: &DomainContext) -> Result<()> {
        self.lifecycle.check(Transition::Initialize)?;
        let socket = UdpSocket::bind((self.config.bind_address.as_str(), self.config.port))
            .map_err(|e| {
                DomainError::unavailable(
                    format!(
                        "state receive socket {}:{}",
                        self.config.bind_address, self.config.port
                    ),
                    e,
                )
            })?;
        socket.set_nonblocking(true)?;
        info!(
            "state receiver listening on {} ({})",
            socket.local_addr()?,
            C::NAME
        );
        self.socket = Some(socket);
        self.lifecycle.commit(Transition::Initialize);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Start)?;
        self.lifecycle.commit(Transition::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Stop)?;
        self.lifecycle.commit(Transition::Stop);
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.lifecycle.begin_cleanup() {
            return Ok(());
        }
        self.socket = None;
        self.lifecycle.commit(Transition::Cleanup);
        debug!("state receiver closed after {} packets", self.received);
        Ok(())
    }
}

impl<T: SharedState, C: StateCodec> SynchronousDomain for StateReceiveDomain<T, C> {
    fn tick(&mut self, _dt: f64) -> Result<()> {
        self.poll().map(|_| ())
    }
}

/// Parent owning a sender and/or receiver as sub-domains.
pub struct StateDistributionDomain {
    lifecycle: Lifecycle,
    sub_domains: SubDomains,
}

impl StateDistributionDomain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            lifecycle: Lifecycle::new(name),
            sub_domains: SubDomains::new(),
        }
    }

    /// Receiver ticks first so a relay forwards what it just received.
    pub fn pair<T: SharedState, C: StateCodec>(
        name: impl Into<String>,
        sender: StateSendDomain<T, C>,
        receiver: StateReceiveDomain<T, C>,
    ) -> Self {
        let mut domain = Self::new(name);
        domain.add(SubDomainPhase::Pre, receiver);
        domain.add(SubDomainPhase::Post, sender);
        domain
    }

    pub fn add(&mut self, phase: SubDomainPhase, domain: impl SynchronousDomain + 'static) {
        self.sub_domains.push(phase, Box::new(domain));
    }

    pub fn sub_domains(&self) -> &SubDomains {
        &self.sub_domains
    }
}

impl Domain for StateDistributionDomain {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn kind(&self) -> DomainKind {
        DomainKind::Synchronous
    }

    fn state(&self) -> DomainState {
        self.lifecycle.state()
    }

    fn initialize(&mut self, ctx: &DomainContext) -> Result<()> {
        self.lifecycle.check(Transition::Initialize)?;
        let pre = self.sub_domains.initialize(SubDomainPhase::Pre, ctx);
        let post = self.sub_domains.initialize(SubDomainPhase::Post, ctx);
        pre.and(post)?;
        self.lifecycle.commit(Transition::Initialize);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Start)?;
        self.sub_domains.start()?;
        self.lifecycle.commit(Transition::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Stop)?;
        let result = self.sub_domains.stop();
        self.lifecycle.commit(Transition::Stop);
        result
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.lifecycle.begin_cleanup() {
            return Ok(());
        }
        let result = self.sub_domains.cleanup();
        self.lifecycle.commit(Transition::Cleanup);
        if let Err(e) = result {
            warn!("state distribution cleanup: {}", e);
        }
        Ok(())
    }
}

impl SynchronousDomain for StateDistributionDomain {
    fn tick(&mut self, dt: f64) -> Result<()> {
        let pre = self.sub_domains.tick(SubDomainPhase::Pre, dt);
        let post = self.sub_domains.tick(SubDomainPhase::Post, dt);
        pre.and(post)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Orbit {
        angle: f64,
        radius: f32,
        tags: Vec<String>,
    }

    fn orbit(angle: f64) -> Orbit {
        Orbit {
            angle,
            radius: 2.0,
            tags: vec!["moon".to_string()],
        }
    }

    fn loopback_pair() -> (StateSendDomain<Orbit>, StateReceiveDomain<Orbit>) {
        let ctx = DomainContext::default();
        let mut receiver = StateReceiveDomain::new(
            StateReceiveConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 0,
            },
            StateSnapshot::new(),
        );
        receiver.initialize(&ctx).unwrap();
        let addr = receiver.local_addr().unwrap();

        let mut sender = StateSendDomain::new(
            StateSendConfig {
                destinations: vec![addr.to_string()],
                max_packet_size: 8192,
            },
            StateSnapshot::new(),
        );
        sender.initialize(&ctx).unwrap();
        (sender, receiver)
    }

    fn poll_until_received(receiver: &mut StateReceiveDomain<Orbit>) -> bool {
        for _ in 0..50 {
            if receiver.poll().unwrap() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_snapshot_versions() {
        let snapshot = StateSnapshot::new();
        assert!(snapshot.latest().is_none());
        snapshot.publish(orbit(0.1));
        let reader = snapshot.clone();
        snapshot.publish(orbit(0.2));
        assert_eq!(reader.version(), 2);
        assert_eq!(reader.latest().unwrap().angle, 0.2);
    }

    #[test]
    fn test_nothing_sent_before_first_publish() {
        let (mut sender, _receiver) = loopback_pair();
        sender.tick(0.016).unwrap();
        assert_eq!(sender.sequence(), 0);
    }

    #[test]
    fn test_latest_datagram_wins() {
        let (mut sender, mut receiver) = loopback_pair();
        let snapshot = sender.snapshot();
        for i in 0..3 {
            snapshot.publish(orbit(i as f64));
            sender.tick(0.016).unwrap();
        }
        thread::sleep(Duration::from_millis(20));

        assert!(poll_until_received(&mut receiver));
        let got = receiver.snapshot().latest().unwrap();
        assert_eq!(*got, orbit(2.0));
        assert_eq!(receiver.last_packet(), Some((sender.sender_id(), 2)));
    }

    #[test]
    fn test_malformed_datagram_is_skipped() {
        let (_sender, mut receiver) = loopback_pair();
        let addr = receiver.local_addr().unwrap();
        let junk = UdpSocket::bind("127.0.0.1:0").unwrap();
        junk.send_to(b"not a state packet", addr).unwrap();
        thread::sleep(Duration::from_millis(20));

        assert!(!receiver.poll().unwrap());
        assert!(receiver.snapshot().latest().is_none());
    }

    #[test]
    fn test_oversized_packet_is_rejected() {
        let (mut sender, _receiver) = loopback_pair();
        sender.config.max_packet_size = 16;
        sender.snapshot().publish(orbit(1.0));
        assert!(matches!(
            sender.tick(0.016),
            Err(DomainError::PacketTooLarge { limit: 16, .. })
        ));
    }

    #[test]
    fn test_unresolvable_destination_fails_initialize() {
        let mut sender: StateSendDomain<Orbit> = StateSendDomain::new(
            StateSendConfig {
                destinations: vec!["not an address".to_string()],
                max_packet_size: 8192,
            },
            StateSnapshot::new(),
        );
        let err = sender.initialize(&DomainContext::default()).unwrap_err();
        assert!(matches!(err, DomainError::ResourceUnavailable { .. }));
    }

    #[test]
    fn test_pair_relays_what_it_receives() {
        let ctx = DomainContext::default();
        let relay_port = {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };

        // source -> relay (receive, then send) -> sink
        let (_unused, mut sink) = loopback_pair();
        let sink_addr = sink.local_addr().unwrap();

        let relayed = StateSnapshot::new();
        let forward: StateSendDomain<Orbit> = StateSendDomain::new(
            StateSendConfig {
                destinations: vec![sink_addr.to_string()],
                max_packet_size: 8192,
            },
            relayed.clone(),
        );
        let listen: StateReceiveDomain<Orbit> = StateReceiveDomain::new(
            StateReceiveConfig {
                bind_address: "127.0.0.1".to_string(),
                port: relay_port,
            },
            relayed,
        );
        let mut relay = StateDistributionDomain::pair("relay", forward, listen);
        assert_eq!(relay.sub_domains().describe().len(), 2);
        relay.initialize(&ctx).unwrap();
        relay.start().unwrap();

        let mut source: StateSendDomain<Orbit> = StateSendDomain::new(
            StateSendConfig {
                destinations: vec![format!("127.0.0.1:{}", relay_port)],
                max_packet_size: 8192,
            },
            StateSnapshot::new(),
        );
        source.initialize(&ctx).unwrap();
        source.snapshot().publish(orbit(4.0));
        source.tick(0.016).unwrap();

        let mut delivered = false;
        for _ in 0..50 {
            relay.tick(0.016).unwrap();
            if sink.poll().unwrap() {
                delivered = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(delivered);
        assert_eq!(*sink.snapshot().latest().unwrap(), orbit(4.0));

        relay.stop().unwrap();
        relay.cleanup().unwrap();
        assert_eq!(relay.state(), DomainState::CleanedUp);
    }
}
