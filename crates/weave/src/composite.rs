//! Composite application
//!
//! Owns an ordered list of domains and runs them through one lifecycle:
//!
//! 1. bind callback slots into domains
//! 2. initialize every domain in registration order
//! 3. start every initialized domain, recording each success
//! 4. hand the main thread to the domain that drives the main loop, or block
//!    until quit if none does
//! 5. run `on_exit`, then stop the recorded domains in reverse start order
//! 6. clean up every domain in registration order
//!
//! A failing phase is logged and the run continues; nothing is retried.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use weaveconf::WeaveConfig;

use crate::audio::{self, AudioConfig, AudioDomain};
use crate::domain::{Domain, DomainContext, DomainState, Transition};
use crate::graphics::{GraphicsConfig, GraphicsDomain};
use crate::hooks::AppHooks;
use crate::osc::{OscConfig, OscDomain};
use crate::quit::QuitToken;

/// Position of a domain in its composite's registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub usize);

/// What happened to one domain during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainOutcome {
    pub name: String,
    pub initialized: bool,
    pub started: bool,
    /// Failed phases with their error messages
    pub errors: Vec<(Transition, String)>,
}

impl DomainOutcome {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            initialized: false,
            started: false,
            errors: Vec::new(),
        }
    }
}

/// Summary returned by [`CompositeApp::start`].
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// One entry per domain, in registration order
    pub outcomes: Vec<DomainOutcome>,
    /// Domains stopped, in the order they were stopped
    pub stop_order: Vec<DomainId>,
    /// Domain whose loop ran the main thread
    pub main_loop: Option<DomainId>,
    pub main_loop_error: Option<String>,
}

impl RunReport {
    pub fn outcome(&self, id: DomainId) -> Option<&DomainOutcome> {
        self.outcomes.get(id.0)
    }

    pub fn stop_order_names(&self) -> Vec<String> {
        self.stop_order
            .iter()
            .filter_map(|id| self.outcome(*id))
            .map(|o| o.name.clone())
            .collect()
    }

    /// Whether every domain initialized and started cleanly.
    pub fn is_clean(&self) -> bool {
        self.main_loop_error.is_none() && self.outcomes.iter().all(|o| o.errors.is_empty())
    }
}

/// Shared log of the states domains reached under the orchestrator.
///
/// Clones share the log, so hooks running inside the main loop can see
/// which domains are up.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    history: Arc<Mutex<Vec<(String, DomainState)>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &str, state: DomainState) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push((name.to_string(), state));
    }

    pub fn history(&self) -> Vec<(String, DomainState)> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// States `name` passed through, oldest first.
    pub fn states_of(&self, name: &str) -> Vec<DomainState> {
        self.history()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, s)| s)
            .collect()
    }

    /// Most recent state recorded for `name`.
    pub fn current(&self, name: &str) -> Option<DomainState> {
        self.states_of(name).last().copied()
    }
}

/// An application assembled from domains.
pub struct CompositeApp {
    domains: Vec<Box<dyn Domain>>,
    hooks: AppHooks,
    quit: QuitToken,
    board: StatusBoard,
    /// Domains whose start succeeded, in start order
    running: Vec<DomainId>,
}

impl CompositeApp {
    pub fn new(hooks: AppHooks) -> Self {
        Self {
            domains: Vec::new(),
            hooks,
            quit: QuitToken::new(),
            board: StatusBoard::new(),
            running: Vec::new(),
        }
    }

    /// Share an existing quit token, e.g. one already captured by a hook.
    pub fn with_quit_token(mut self, quit: QuitToken) -> Self {
        self.quit = quit;
        self
    }

    /// Record lifecycle states into an existing board.
    pub fn with_status_board(mut self, board: StatusBoard) -> Self {
        self.board = board;
        self
    }

    /// An app with audio, graphics and OSC domains built from configuration.
    ///
    /// Audio and OSC are skipped when disabled in the config. Audio uses the
    /// default backend for this build.
    pub fn with_default_domains(config: &WeaveConfig, hooks: AppHooks) -> Self {
        let mut app = Self::new(hooks);
        if config.audio.enabled {
            app.add_domain(AudioDomain::with_backend(
                AudioConfig::from(&config.audio),
                audio::default_backend(),
            ));
        }
        app.add_domain(GraphicsDomain::new(GraphicsConfig::from(&config.graphics)));
        if config.osc.enabled {
            app.add_domain(OscDomain::new(OscConfig::from(&config.osc)));
        }
        app
    }

    pub fn add_domain(&mut self, domain: impl Domain + 'static) -> DomainId {
        self.add_boxed(Box::new(domain))
    }

    pub fn add_boxed(&mut self, domain: Box<dyn Domain>) -> DomainId {
        let id = DomainId(self.domains.len());
        debug!("domain '{}' registered as {:?}", domain.name(), id);
        self.domains.push(domain);
        id
    }

    /// Handle that ends the run from any thread.
    pub fn quit_token(&self) -> QuitToken {
        self.quit.clone()
    }

    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn domain(&self, id: DomainId) -> Option<&dyn Domain> {
        self.domains.get(id.0).map(|d| d.as_ref())
    }

    pub fn domain_states(&self) -> Vec<(String, DomainState)> {
        self.domains
            .iter()
            .map(|d| (d.name().to_string(), d.state()))
            .collect()
    }

    /// Run the whole lifecycle. Blocks until quit.
    pub fn start(&mut self) -> RunReport {
        let mut report = RunReport {
            outcomes: self
                .domains
                .iter()
                .map(|d| DomainOutcome::new(d.name()))
                .collect(),
            ..RunReport::default()
        };

        self.bind_callbacks();
        self.initialize_all(&mut report);
        self.start_all(&mut report);
        self.run_main_loop(&mut report);

        if let Some(mut on_exit) = self.hooks.take_exit() {
            on_exit();
        }

        self.stop_running(&mut report);
        self.cleanup_all(&mut report);

        info!(
            "app finished: {} domains, stop order {:?}",
            self.domains.len(),
            report.stop_order_names()
        );
        report
    }

    fn bind_callbacks(&mut self) {
        for domain in &mut self.domains {
            domain.bind_callbacks(&mut self.hooks);
        }
        debug!("callbacks bound: {:?}", self.hooks);
    }

    fn initialize_all(&mut self, report: &mut RunReport) {
        let ctx = DomainContext::new(self.quit.clone());
        for (domain, outcome) in self.domains.iter_mut().zip(&mut report.outcomes) {
            match domain.initialize(&ctx) {
                Ok(()) => {
                    outcome.initialized = true;
                    self.board.record(domain.name(), domain.state());
                }
                Err(e) => {
                    warn!("domain '{}' failed to initialize: {}", domain.name(), e);
                    outcome.errors.push((Transition::Initialize, e.to_string()));
                }
            }
        }
    }

    fn start_all(&mut self, report: &mut RunReport) {
        for (index, domain) in self.domains.iter_mut().enumerate() {
            let outcome = &mut report.outcomes[index];
            if !outcome.initialized {
                info!("skipping start of '{}' (not initialized)", domain.name());
                continue;
            }
            match domain.start() {
                Ok(()) => {
                    outcome.started = true;
                    self.running.push(DomainId(index));
                    self.board.record(domain.name(), domain.state());
                    info!("domain '{}' started", domain.name());
                }
                Err(e) => {
                    warn!("domain '{}' failed to start: {}", domain.name(), e);
                    outcome.errors.push((Transition::Start, e.to_string()));
                }
            }
        }
    }

    fn run_main_loop(&mut self, report: &mut RunReport) {
        let driver = self
            .running
            .iter()
            .copied()
            .find(|id| self.domains[id.0].drives_main_loop());

        match driver {
            Some(id) => {
                report.main_loop = Some(id);
                let domain = &mut self.domains[id.0];
                info!("main loop driven by '{}'", domain.name());
                if let Err(e) = domain.run_main_loop(&self.quit) {
                    warn!("main loop of '{}' failed: {}", domain.name(), e);
                    report.main_loop_error = Some(e.to_string());
                }
            }
            None => {
                info!("no domain drives the main loop; waiting for quit");
                self.quit.wait();
            }
        }
    }

    fn stop_running(&mut self, report: &mut RunReport) {
        while let Some(id) = self.running.pop() {
            let domain = &mut self.domains[id.0];
            if let Err(e) = domain.stop() {
                warn!("domain '{}' failed to stop: {}", domain.name(), e);
                report.outcomes[id.0]
                    .errors
                    .push((Transition::Stop, e.to_string()));
            }
            self.board.record(domain.name(), domain.state());
            report.stop_order.push(id);
        }
    }

    fn cleanup_all(&mut self, report: &mut RunReport) {
        for (domain, outcome) in self.domains.iter_mut().zip(&mut report.outcomes) {
            if let Err(e) = domain.cleanup() {
                warn!("domain '{}' failed to clean up: {}", domain.name(), e);
                outcome.errors.push((Transition::Cleanup, e.to_string()));
            }
            self.board.record(domain.name(), domain.state());
        }
    }
}

impl std::fmt::Debug for CompositeApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeApp")
            .field("domains", &self.domain_states())
            .field("quit", &self.quit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainKind, Lifecycle};
    use crate::error::{DomainError, Result};

    struct Flaky {
        lifecycle: Lifecycle,
        fail_start: bool,
    }

    impl Flaky {
        fn new(name: &str, fail_start: bool) -> Self {
            Self {
                lifecycle: Lifecycle::new(name),
                fail_start,
            }
        }
    }

    impl Domain for Flaky {
        fn name(&self) -> &str {
            self.lifecycle.name()
        }
        fn kind(&self) -> DomainKind {
            DomainKind::Asynchronous
        }
        fn state(&self) -> DomainState {
            self.lifecycle.state()
        }
        fn initialize(&mut self, _ctx: &DomainContext) -> Result<()> {
            self.lifecycle.check(Transition::Initialize)?;
            self.lifecycle.commit(Transition::Initialize);
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            self.lifecycle.check(Transition::Start)?;
            if self.fail_start {
                return Err(DomainError::unavailable("device", "busy"));
            }
            self.lifecycle.commit(Transition::Start);
            Ok(())
        }
        fn stop(&mut self) -> Result<()> {
            self.lifecycle.check(Transition::Stop)?;
            self.lifecycle.commit(Transition::Stop);
            Ok(())
        }
        fn cleanup(&mut self) -> Result<()> {
            self.lifecycle.commit(Transition::Cleanup);
            Ok(())
        }
    }

    #[test]
    fn test_failed_start_is_not_stopped() {
        let mut app = CompositeApp::new(AppHooks::new());
        app.add_domain(Flaky::new("a", false));
        let b = app.add_domain(Flaky::new("b", true));
        app.add_domain(Flaky::new("c", false));
        app.quit_token().quit();

        let report = app.start();
        assert_eq!(report.stop_order_names(), vec!["c", "a"]);
        assert!(!report.outcome(b).unwrap().started);
        assert_eq!(report.outcome(b).unwrap().errors[0].0, Transition::Start);
        assert!(!report.is_clean());
        assert!(app
            .domain_states()
            .iter()
            .all(|(_, s)| *s == DomainState::CleanedUp));
    }

    #[test]
    fn test_on_exit_runs_before_stop() {
        let board = StatusBoard::new();
        let seen = board.clone();
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);

        let mut app = CompositeApp::new(AppHooks::new().on_exit(move || {
            sink.lock().unwrap().push(seen.current("a"));
        }))
        .with_status_board(board);
        app.add_domain(Flaky::new("a", false));
        app.quit_token().quit();
        app.start();

        assert_eq!(*states.lock().unwrap(), vec![Some(DomainState::Running)]);
    }

    #[test]
    fn test_empty_app_returns_after_quit() {
        let mut app = CompositeApp::new(AppHooks::new());
        assert!(app.is_empty());
        app.quit_token().quit();
        let report = app.start();
        assert!(report.main_loop.is_none());
        assert!(report.is_clean());
    }
}
