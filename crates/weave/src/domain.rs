//! Domain lifecycle model
//!
//! A domain is an execution unit with a four-phase lifecycle:
//!
//! ```text
//! Uninitialized ──initialize──▶ Initialized ──start──▶ Running
//!                                                        │  ▲
//!                                                      stop │ start
//!                                                        ▼  │
//!                   (any state) ──cleanup──▶ CleanedUp ◀── Stopped
//! ```
//!
//! Synchronous domains are ticked by a parent (simulation, state
//! distribution). Asynchronous domains drive themselves from their own thread
//! or event source (audio callback, OSC listener, window loop).

use tracing::{debug, error, warn};

use crate::error::{DomainError, Result};
use crate::hooks::AppHooks;
use crate::quit::QuitToken;

/// How a domain gets its work scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    /// Ticked cooperatively by a parent or driver; no thread of its own.
    Synchronous,
    /// Runs on its own thread or external event source.
    Asynchronous,
}

/// Position in the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainState {
    #[default]
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    CleanedUp,
}

/// A requested lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Initialize,
    Start,
    Stop,
    Cleanup,
}

impl DomainState {
    /// State reached by applying `transition`, or `None` if it is illegal.
    pub fn after(self, transition: Transition) -> Option<DomainState> {
        use DomainState::*;
        match (self, transition) {
            (Uninitialized, Transition::Initialize) => Some(Initialized),
            (Initialized | Stopped, Transition::Start) => Some(Running),
            (Running, Transition::Stop) => Some(Stopped),
            (_, Transition::Cleanup) => Some(CleanedUp),
            _ => None,
        }
    }
}

/// Transition bookkeeping embedded in every domain.
///
/// Domains call [`check`](Self::check) before doing the work of a transition
/// and [`commit`](Self::commit) once it succeeded.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    name: String,
    state: DomainState,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: DomainState::Uninitialized,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DomainState {
        self.state
    }

    /// Validate `transition` against the current state.
    pub fn check(&self, transition: Transition) -> Result<()> {
        if self.state.after(transition).is_some() {
            return Ok(());
        }
        error!(
            "domain '{}': {:?} requested while {:?}",
            self.name, transition, self.state
        );
        Err(DomainError::LifecycleOrder {
            domain: self.name.clone(),
            state: self.state,
            transition,
        })
    }

    /// Record that `transition` completed.
    pub fn commit(&mut self, transition: Transition) {
        if let Some(next) = self.state.after(transition) {
            debug!("domain '{}': {:?} -> {:?}", self.name, self.state, next);
            self.state = next;
        }
    }

    /// Start a cleanup. Returns `false` when the domain is already cleaned up,
    /// which makes a second cleanup a no-op.
    pub fn begin_cleanup(&self) -> bool {
        self.state != DomainState::CleanedUp
    }
}

/// Shared runtime context handed to every domain at initialize.
#[derive(Debug, Clone, Default)]
pub struct DomainContext {
    quit: QuitToken,
}

impl DomainContext {
    pub fn new(quit: QuitToken) -> Self {
        Self { quit }
    }

    pub fn quit_token(&self) -> &QuitToken {
        &self.quit
    }
}

/// An execution unit owned by a [`CompositeApp`](crate::CompositeApp).
///
/// Every phase reports success or failure; callers log failures and move on.
/// `cleanup` must be idempotent and release everything the domain holds.
pub trait Domain {
    fn name(&self) -> &str;

    fn kind(&self) -> DomainKind;

    fn state(&self) -> DomainState;

    fn initialize(&mut self, ctx: &DomainContext) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn cleanup(&mut self) -> Result<()>;

    /// Claim the callback slots this domain dispatches to.
    ///
    /// Called once by the orchestrator before initialize.
    fn bind_callbacks(&mut self, _hooks: &mut AppHooks) {}

    /// Whether this domain owns the blocking loop that runs the application.
    fn drives_main_loop(&self) -> bool {
        false
    }

    /// Run the blocking loop until `quit` is signalled.
    fn run_main_loop(&mut self, _quit: &QuitToken) -> Result<()> {
        Ok(())
    }
}

/// A domain ticked cooperatively by its parent.
pub trait SynchronousDomain: Domain {
    /// One unit of per-frame work. `dt` is elapsed seconds since the last tick.
    fn tick(&mut self, dt: f64) -> Result<()>;
}

/// Whether a sub-domain runs before or after its parent's own logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDomainPhase {
    Pre,
    Post,
}

/// Sub-domains exclusively owned by a parent domain.
#[derive(Default)]
pub struct SubDomains {
    entries: Vec<(SubDomainPhase, Box<dyn SynchronousDomain>)>,
}

impl SubDomains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, phase: SubDomainPhase, domain: Box<dyn SynchronousDomain>) {
        debug!("sub-domain '{}' added ({:?})", domain.name(), phase);
        self.entries.push((phase, domain));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names, phases and states, in insertion order.
    pub fn describe(&self) -> Vec<(String, SubDomainPhase, DomainState)> {
        self.entries
            .iter()
            .map(|(phase, d)| (d.name().to_string(), *phase, d.state()))
            .collect()
    }

    /// Initialize every sub-domain tagged `phase`.
    pub fn initialize(&mut self, phase: SubDomainPhase, ctx: &DomainContext) -> Result<()> {
        collect_first_error(
            self.phase_mut(phase)
                .map(|d| (d.name().to_string(), d.initialize(ctx))),
            "initialize",
        )
    }

    /// Start every initialized sub-domain, pre before post.
    pub fn start(&mut self) -> Result<()> {
        let mut results = Vec::new();
        for phase in [SubDomainPhase::Pre, SubDomainPhase::Post] {
            for d in self.phase_mut(phase) {
                if matches!(d.state(), DomainState::Initialized | DomainState::Stopped) {
                    results.push((d.name().to_string(), d.start()));
                }
            }
        }
        collect_first_error(results.into_iter(), "start")
    }

    /// Stop running sub-domains in reverse insertion order.
    pub fn stop(&mut self) -> Result<()> {
        collect_first_error(
            self.entries
                .iter_mut()
                .rev()
                .filter(|(_, d)| d.state() == DomainState::Running)
                .map(|(_, d)| (d.name().to_string(), d.stop())),
            "stop",
        )
    }

    pub fn cleanup(&mut self) -> Result<()> {
        collect_first_error(
            self.entries
                .iter_mut()
                .map(|(_, d)| (d.name().to_string(), d.cleanup())),
            "cleanup",
        )
    }

    /// Tick every running sub-domain tagged `phase`.
    pub fn tick(&mut self, phase: SubDomainPhase, dt: f64) -> Result<()> {
        collect_first_error(
            self.phase_mut(phase)
                .filter(|d| d.state() == DomainState::Running)
                .map(|d| (d.name().to_string(), d.tick(dt))),
            "tick",
        )
    }

    fn phase_mut(
        &mut self,
        phase: SubDomainPhase,
    ) -> impl Iterator<Item = &mut Box<dyn SynchronousDomain>> {
        self.entries
            .iter_mut()
            .filter(move |(p, _)| *p == phase)
            .map(|(_, d)| d)
    }
}

/// Run every step, log each failure, and return the first one.
fn collect_first_error(
    results: impl Iterator<Item = (String, Result<()>)>,
    what: &str,
) -> Result<()> {
    let mut first = None;
    for (name, result) in results {
        if let Err(e) = result {
            warn!("sub-domain '{}' failed to {}: {}", name, what, e);
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}
