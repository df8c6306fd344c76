//! Simulation domains
//!
//! Synchronous domains ticked once per graphics frame. Attach them to a
//! [`GraphicsDomain`](crate::graphics::GraphicsDomain) as `Pre` sub-domains
//! so the simulation has advanced before `on_animate` and `on_draw` run.

use tracing::{debug, info, warn};

use crate::domain::{
    Domain, DomainContext, DomainKind, DomainState, Lifecycle, SubDomainPhase, SubDomains,
    SynchronousDomain, Transition,
};
use crate::error::Result;
use crate::state::{
    MsgPackCodec, SharedState, StateCodec, StateReceiveConfig, StateReceiveDomain,
    StateSendConfig, StateSendDomain, StateSnapshot,
};

type SimulationFn = Box<dyn FnMut(f64)>;
type StateSimulationFn<T> = Box<dyn FnMut(&mut T, f64)>;

/// Runs a user simulation step every tick, between its sub-domains.
pub struct SimulationDomain {
    lifecycle: Lifecycle,
    simulation: Option<SimulationFn>,
    processing: bool,
    sub_domains: SubDomains,
}

impl SimulationDomain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            lifecycle: Lifecycle::new(name),
            simulation: None,
            processing: true,
            sub_domains: SubDomains::new(),
        }
    }

    pub fn with_simulation(mut self, f: impl FnMut(f64) + 'static) -> Self {
        self.simulation = Some(Box::new(f));
        self
    }

    pub fn set_simulation(&mut self, f: impl FnMut(f64) + 'static) {
        self.simulation = Some(Box::new(f));
    }

    /// Pause or resume the simulation step. Sub-domains keep ticking.
    pub fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub fn add_sub_domain(&mut self, phase: SubDomainPhase, domain: impl SynchronousDomain + 'static) {
        self.sub_domains.push(phase, Box::new(domain));
    }

    pub fn sub_domains(&self) -> &SubDomains {
        &self.sub_domains
    }
}

impl Domain for SimulationDomain {
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
        initialize_sub_domains(&mut self.sub_domains, ctx)?;
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
        if let Err(e) = self.sub_domains.cleanup() {
            warn!("simulation '{}' sub-domain cleanup: {}", self.lifecycle.name(), e);
        }
        self.lifecycle.commit(Transition::Cleanup);
        Ok(())
    }
}

impl SynchronousDomain for SimulationDomain {
    fn tick(&mut self, dt: f64) -> Result<()> {
        let pre = self.sub_domains.tick(SubDomainPhase::Pre, dt);
        if self.processing {
            if let Some(simulate) = self.simulation.as_mut() {
                simulate(dt);
            }
        }
        let post = self.sub_domains.tick(SubDomainPhase::Post, dt);
        pre.and(post)
    }
}

/// Whether a state simulation computes its state or copies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRole {
    /// Runs the simulation and is the only writer of the state
    Primary,
    /// Takes its state from the latest received snapshot
    Replica,
}

/// A simulation that owns a distributable state value.
///
/// The primary mutates its state in the simulation step and publishes a
/// copy to [`outbound`](Self::outbound) every tick. A replica skips the
/// simulation step and replaces its state whenever
/// [`inbound`](Self::inbound) has a newer snapshot.
pub struct StateSimulationDomain<T> {
    lifecycle: Lifecycle,
    role: StateRole,
    state: T,
    simulation: Option<StateSimulationFn<T>>,
    processing: bool,
    sub_domains: SubDomains,
    outbound: StateSnapshot<T>,
    inbound: StateSnapshot<T>,
    applied_version: u64,
}

impl<T: SharedState + Clone> StateSimulationDomain<T> {
    pub fn new(name: impl Into<String>, role: StateRole, initial: T) -> Self {
        Self {
            lifecycle: Lifecycle::new(name),
            role,
            state: initial,
            simulation: None,
            processing: true,
            sub_domains: SubDomains::new(),
            outbound: StateSnapshot::new(),
            inbound: StateSnapshot::new(),
            applied_version: 0,
        }
    }

    pub fn with_simulation(mut self, f: impl FnMut(&mut T, f64) + 'static) -> Self {
        self.simulation = Some(Box::new(f));
        self
    }

    pub fn role(&self) -> StateRole {
        self.role
    }

    pub fn shared_state(&self) -> &T {
        &self.state
    }

    pub fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    /// Snapshot of this domain's state after each tick, for other threads
    /// and for senders.
    pub fn outbound(&self) -> StateSnapshot<T> {
        self.outbound.clone()
    }

    /// Snapshot a replica copies its state from.
    pub fn inbound(&self) -> StateSnapshot<T> {
        self.inbound.clone()
    }

    /// Send the outbound snapshot with MessagePack after every tick.
    pub fn add_state_sender(&mut self, config: StateSendConfig) {
        self.add_state_sender_with::<MsgPackCodec>(config);
    }

    pub fn add_state_sender_with<C: StateCodec>(&mut self, config: StateSendConfig) {
        let sender: StateSendDomain<T, C> = StateSendDomain::new(config, self.outbound.clone());
        self.sub_domains.push(SubDomainPhase::Post, Box::new(sender));
    }

    /// Receive into the inbound snapshot before every tick.
    pub fn add_state_receiver(&mut self, config: StateReceiveConfig) {
        self.add_state_receiver_with::<MsgPackCodec>(config);
    }

    pub fn add_state_receiver_with<C: StateCodec>(&mut self, config: StateReceiveConfig) {
        let receiver: StateReceiveDomain<T, C> =
            StateReceiveDomain::new(config, self.inbound.clone());
        self.sub_domains.push(SubDomainPhase::Pre, Box::new(receiver));
    }

    pub fn add_sub_domain(&mut self, phase: SubDomainPhase, domain: impl SynchronousDomain + 'static) {
        self.sub_domains.push(phase, Box::new(domain));
    }

    pub fn sub_domains(&self) -> &SubDomains {
        &self.sub_domains
    }

    fn step(&mut self, dt: f64) {
        match self.role {
            StateRole::Primary => {
                if self.processing {
                    if let Some(simulate) = self.simulation.as_mut() {
                        simulate(&mut self.state, dt);
                    }
                }
                self.outbound.publish(self.state.clone());
            }
            StateRole::Replica => {
                let version = self.inbound.version();
                if version == self.applied_version {
                    return;
                }
                if let Some(latest) = self.inbound.latest() {
                    self.state = T::clone(&latest);
                    self.applied_version = version;
                    self.outbound.publish_arc(latest);
                }
            }
        }
    }
}

impl<T: SharedState + Clone> Domain for StateSimulationDomain<T> {
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
        initialize_sub_domains(&mut self.sub_domains, ctx)?;
        if self.role == StateRole::Primary {
            self.outbound.publish(self.state.clone());
        }
        info!(
            "state simulation '{}' ({:?}, {} sub-domains)",
            self.lifecycle.name(),
            self.role,
            self.sub_domains.len()
        );
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
        if let Err(e) = self.sub_domains.cleanup() {
            warn!("state simulation '{}' sub-domain cleanup: {}", self.lifecycle.name(), e);
        }
        self.lifecycle.commit(Transition::Cleanup);
        Ok(())
    }
}

impl<T: SharedState + Clone> SynchronousDomain for StateSimulationDomain<T> {
    fn tick(&mut self, dt: f64) -> Result<()> {
        let pre = self.sub_domains.tick(SubDomainPhase::Pre, dt);
        self.step(dt);
        let post = self.sub_domains.tick(SubDomainPhase::Post, dt);
        pre.and(post)
    }
}

/// Initialize pre then post sub-domains, attempting both.
fn initialize_sub_domains(sub_domains: &mut SubDomains, ctx: &DomainContext) -> Result<()> {
    let pre = sub_domains.initialize(SubDomainPhase::Pre, ctx);
    let post = sub_domains.initialize(SubDomainPhase::Post, ctx);
    if pre.is_err() || post.is_err() {
        debug!("some sub-domains failed to initialize");
    }
    pre.and(post)
}
