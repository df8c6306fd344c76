//! Graphics and window domains
//!
//! The graphics domain owns the frame loop that drives the whole app: it
//! polls windows, ticks its simulation sub-domains, calls `on_animate` and
//! `on_draw`, and sleeps to the target frame interval. It is the domain that
//! [`CompositeApp`](crate::CompositeApp) hands the main thread to.
//!
//! Real rendering is outside this crate. Windows sit behind the [`Window`]
//! trait; [`HeadlessWindow`] stands in when nothing is on screen.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use weaveconf::GraphicsSection;

use crate::domain::{
    Domain, DomainContext, DomainKind, DomainState, Lifecycle, SubDomainPhase, SubDomains,
    SynchronousDomain, Transition,
};
use crate::error::{DomainError, Result};
use crate::hooks::{AnimateHook, AppHooks, CreateHook, DrawHook, InitHook};
use crate::quit::QuitToken;

/// Stable window identifier. The primary window is always `WindowId(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(pub u64);

impl WindowId {
    pub const PRIMARY: WindowId = WindowId(0);
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "weave".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Per-frame context passed to `on_draw`.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frames completed before this one
    pub index: u64,
    /// Seconds since the previous frame
    pub dt: f64,
    /// Seconds since the loop started
    pub elapsed: f64,
    pub window: WindowId,
    pub width: u32,
    pub height: u32,
}

/// A platform window. Implementations own their native handle.
pub trait Window: Send {
    fn create(&mut self, config: &WindowConfig) -> Result<()>;

    /// Pump pending events. Returns `false` once the user asked to close.
    fn poll_events(&mut self) -> bool;

    fn present(&mut self) -> Result<()>;

    fn destroy(&mut self);

    fn is_created(&self) -> bool;

    fn size(&self) -> (u32, u32);
}

/// Window with no native surface.
#[derive(Debug, Default)]
pub struct HeadlessWindow {
    config: Option<WindowConfig>,
    polls: u64,
    close_after: Option<u64>,
}

impl HeadlessWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a close request after `polls` calls to `poll_events`.
    pub fn close_after(polls: u64) -> Self {
        Self {
            close_after: Some(polls),
            ..Self::default()
        }
    }
}

impl Window for HeadlessWindow {
    fn create(&mut self, config: &WindowConfig) -> Result<()> {
        self.config = Some(config.clone());
        self.polls = 0;
        Ok(())
    }

    fn poll_events(&mut self) -> bool {
        self.polls += 1;
        self.close_after.map_or(true, |limit| self.polls < limit)
    }

    fn present(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.config = None;
    }

    fn is_created(&self) -> bool {
        self.config.is_some()
    }

    fn size(&self) -> (u32, u32) {
        self.config
            .as_ref()
            .map_or((0, 0), |c| (c.width, c.height))
    }
}

/// One window as a domain.
pub struct WindowDomain {
    lifecycle: Lifecycle,
    config: WindowConfig,
    window: Box<dyn Window>,
}

impl WindowDomain {
    pub fn new(config: WindowConfig, window: Box<dyn Window>) -> Self {
        Self {
            lifecycle: Lifecycle::new(format!("window:{}", config.title)),
            config,
            window,
        }
    }

    pub fn headless(config: WindowConfig) -> Self {
        Self::new(config, Box::new(HeadlessWindow::new()))
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn is_created(&self) -> bool {
        self.window.is_created()
    }

    pub fn size(&self) -> (u32, u32) {
        self.window.size()
    }

    pub fn poll_events(&mut self) -> bool {
        self.window.poll_events()
    }

    pub fn present(&mut self) -> Result<()> {
        self.window.present()
    }
}

impl Domain for WindowDomain {
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
        if !self.window.is_created() {
            self.window
                .create(&self.config)
                .map_err(|e| DomainError::unavailable(format!("window '{}'", self.config.title), e))?;
            debug!(
                "window '{}' created ({}x{})",
                self.config.title, self.config.width, self.config.height
            );
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
        if !self.lifecycle.begin_cleanup() {
            return Ok(());
        }
        if self.window.is_created() {
            self.window.destroy();
            debug!("window '{}' destroyed", self.config.title);
        }
        self.lifecycle.commit(Transition::Cleanup);
        Ok(())
    }
}

/// Frame loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsConfig {
    pub fps: f64,
    pub window: WindowConfig,
    /// Stop after this many frames; `None` runs until quit
    pub frame_limit: Option<u64>,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            fps: 60.0,
            window: WindowConfig::default(),
            frame_limit: None,
        }
    }
}

/// Slowest frame pacing, for rates too small to be meaningful
const MAX_FRAME_INTERVAL: Duration = Duration::from_secs(3600);

impl GraphicsConfig {
    /// Target frame interval; zero means run unthrottled.
    pub fn frame_interval(&self) -> Duration {
        if self.fps > 0.0 && self.fps.is_finite() {
            Duration::try_from_secs_f64(1.0 / self.fps)
                .map_or(MAX_FRAME_INTERVAL, |interval| interval.min(MAX_FRAME_INTERVAL))
        } else {
            Duration::ZERO
        }
    }
}

impl From<&GraphicsSection> for GraphicsConfig {
    fn from(section: &GraphicsSection) -> Self {
        Self {
            fps: section.fps,
            window: WindowConfig {
                title: section.title.clone(),
                width: section.width,
                height: section.height,
            },
            frame_limit: (section.frame_limit > 0).then_some(section.frame_limit),
        }
    }
}

type WindowFactory = Box<dyn Fn() -> Box<dyn Window> + Send>;

enum WindowCommand {
    Open(WindowId, WindowConfig),
    Close(WindowId),
}

/// Opens and closes secondary windows from any thread.
///
/// Requests are applied by the frame loop at the start of the next frame.
#[derive(Clone)]
pub struct GraphicsHandle {
    commands: Sender<WindowCommand>,
    next_id: Arc<AtomicU64>,
}

impl GraphicsHandle {
    pub fn open_window(&self, config: WindowConfig) -> WindowId {
        let id = WindowId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if self.commands.send(WindowCommand::Open(id, config)).is_err() {
            debug!("graphics domain gone; open of {:?} dropped", id);
        }
        id
    }

    pub fn close_window(&self, id: WindowId) {
        if self.commands.send(WindowCommand::Close(id)).is_err() {
            debug!("graphics domain gone; close of {:?} dropped", id);
        }
    }
}

impl std::fmt::Debug for GraphicsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsHandle").finish_non_exhaustive()
    }
}

/// The frame-clocked domain that runs the main loop.
pub struct GraphicsDomain {
    lifecycle: Lifecycle,
    config: GraphicsConfig,
    window_factory: WindowFactory,
    windows: BTreeMap<WindowId, WindowDomain>,
    sub_domains: SubDomains,
    commands_tx: Sender<WindowCommand>,
    commands_rx: Receiver<WindowCommand>,
    next_window_id: Arc<AtomicU64>,
    ctx: DomainContext,
    init_hook: Option<InitHook>,
    create_hook: Option<CreateHook>,
    animate_hook: Option<AnimateHook>,
    draw_hook: Option<DrawHook>,
    frames: u64,
}

impl GraphicsDomain {
    /// A graphics domain whose windows are headless.
    pub fn new(config: GraphicsConfig) -> Self {
        Self::with_window_factory(config, || Box::new(HeadlessWindow::new()))
    }

    /// A graphics domain that builds every window with `factory`.
    pub fn with_window_factory(
        config: GraphicsConfig,
        factory: impl Fn() -> Box<dyn Window> + Send + 'static,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel();
        Self {
            lifecycle: Lifecycle::new("graphics"),
            config,
            window_factory: Box::new(factory),
            windows: BTreeMap::new(),
            sub_domains: SubDomains::new(),
            commands_tx,
            commands_rx,
            next_window_id: Arc::new(AtomicU64::new(1)),
            ctx: DomainContext::default(),
            init_hook: None,
            create_hook: None,
            animate_hook: None,
            draw_hook: None,
            frames: 0,
        }
    }

    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    pub fn handle(&self) -> GraphicsHandle {
        GraphicsHandle {
            commands: self.commands_tx.clone(),
            next_id: Arc::clone(&self.next_window_id),
        }
    }

    /// Attach a domain ticked every frame, before or after `on_animate`.
    pub fn add_sub_domain(&mut self, phase: SubDomainPhase, domain: impl SynchronousDomain + 'static) {
        self.sub_domains.push(phase, Box::new(domain));
    }

    pub fn with_sub_domain(
        mut self,
        phase: SubDomainPhase,
        domain: impl SynchronousDomain + 'static,
    ) -> Self {
        self.add_sub_domain(phase, domain);
        self
    }

    pub fn sub_domains(&self) -> &SubDomains {
        &self.sub_domains
    }

    /// Frames completed by the last run of the main loop.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Ids of open windows, primary first.
    pub fn window_ids(&self) -> Vec<WindowId> {
        self.windows.keys().copied().collect()
    }

    fn open_window(&mut self, id: WindowId, config: WindowConfig) -> Result<()> {
        let mut window = WindowDomain::new(config, (self.window_factory)());
        window.initialize(&self.ctx)?;
        window.start()?;
        info!("window {:?} '{}' opened", id, window.config().title);
        self.windows.insert(id, window);
        Ok(())
    }

    fn close_window(&mut self, id: WindowId) {
        if let Some(mut window) = self.windows.remove(&id) {
            if window.state() == DomainState::Running {
                let _ = window.stop();
            }
            let _ = window.cleanup();
            info!("window {:?} closed", id);
        }
    }

    fn apply_window_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                WindowCommand::Open(id, config) => {
                    if let Err(e) = self.open_window(id, config) {
                        warn!("failed to open window {:?}: {}", id, e);
                    }
                }
                WindowCommand::Close(WindowId::PRIMARY) => {
                    debug!("close of the primary window requested; quitting");
                    self.ctx.quit_token().quit();
                }
                WindowCommand::Close(id) => self.close_window(id),
            }
        }
    }

    /// Poll every window. Closing the primary quits; closing any other
    /// window just removes it.
    fn poll_windows(&mut self, quit: &QuitToken) {
        let mut closed = Vec::new();
        for (id, window) in &mut self.windows {
            if !window.poll_events() {
                closed.push(*id);
            }
        }
        for id in closed {
            if id == WindowId::PRIMARY {
                debug!("primary window closed; quitting");
                quit.quit();
            } else {
                self.close_window(id);
            }
        }
    }

    fn render_frame(&mut self, dt: f64, elapsed: f64) {
        if let Err(e) = self.sub_domains.tick(SubDomainPhase::Pre, dt) {
            debug!("pre sub-domain tick failed: {}", e);
        }
        if let Some(animate) = self.animate_hook.as_mut() {
            animate(dt);
        }
        if let Err(e) = self.sub_domains.tick(SubDomainPhase::Post, dt) {
            debug!("post sub-domain tick failed: {}", e);
        }

        for (id, window) in &mut self.windows {
            let (width, height) = window.size();
            let mut frame = Frame {
                index: self.frames,
                dt,
                elapsed,
                window: *id,
                width,
                height,
            };
            if let Some(draw) = self.draw_hook.as_mut() {
                draw(&mut frame);
            }
            if let Err(e) = window.present() {
                warn!("present failed on window {:?}: {}", id, e);
            }
        }
    }
}

impl Domain for GraphicsDomain {
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
        self.init_hook = self.init_hook.take().or_else(|| hooks.take_init());
        self.create_hook = self.create_hook.take().or_else(|| hooks.take_create());
        self.animate_hook = self.animate_hook.take().or_else(|| hooks.take_animate());
        self.draw_hook = self.draw_hook.take().or_else(|| hooks.take_draw());
    }

    fn drives_main_loop(&self) -> bool {
        true
    }

    fn initialize(&mut self, ctx: &DomainContext) -> Result<()> {
        self.lifecycle.check(Transition::Initialize)?;
        self.ctx = ctx.clone();

        if let Err(e) = self.sub_domains.initialize(SubDomainPhase::Pre, ctx) {
            warn!("graphics pre sub-domain failed to initialize: {}", e);
        }
        if let Some(init) = self.init_hook.as_mut() {
            init();
        }
        if let Err(e) = self.sub_domains.initialize(SubDomainPhase::Post, ctx) {
            warn!("graphics post sub-domain failed to initialize: {}", e);
        }

        self.lifecycle.commit(Transition::Initialize);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Start)?;

        if !self.windows.contains_key(&WindowId::PRIMARY) {
            self.open_window(WindowId::PRIMARY, self.config.window.clone())?;
            if let Some(create) = self.create_hook.as_mut() {
                create();
            }
        }
        if let Err(e) = self.sub_domains.start() {
            warn!("graphics sub-domain failed to start: {}", e);
        }

        self.lifecycle.commit(Transition::Start);
        info!(
            "graphics running at {} fps ({} sub-domains)",
            self.config.fps,
            self.sub_domains.len()
        );
        Ok(())
    }

    fn run_main_loop(&mut self, quit: &QuitToken) -> Result<()> {
        let interval = self.config.frame_interval();
        let started = Instant::now();
        let mut last = started;
        self.frames = 0;

        while !quit.should_quit() {
            let frame_start = Instant::now();
            let dt = frame_start.duration_since(last).as_secs_f64();
            last = frame_start;

            self.apply_window_commands();
            self.poll_windows(quit);
            if quit.should_quit() {
                break;
            }

            self.render_frame(dt, frame_start.duration_since(started).as_secs_f64());
            self.frames += 1;

            if self.config.frame_limit.is_some_and(|limit| self.frames >= limit) {
                debug!("frame limit {} reached", self.frames);
                quit.quit();
                break;
            }

            if let Some(remaining) = interval.checked_sub(frame_start.elapsed()) {
                thread::sleep(remaining);
            }
        }

        info!("graphics loop exited after {} frames", self.frames);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Stop)?;
        let result = self.sub_domains.stop();
        for window in self.windows.values_mut() {
            if window.state() == DomainState::Running {
                let _ = window.stop();
            }
        }
        self.lifecycle.commit(Transition::Stop);
        result
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.lifecycle.begin_cleanup() {
            return Ok(());
        }
        if let Err(e) = self.sub_domains.cleanup() {
            warn!("graphics sub-domain cleanup failed: {}", e);
        }
        let ids: Vec<_> = self.windows.keys().copied().collect();
        for id in ids {
            self.close_window(id);
        }
        self.lifecycle.commit(Transition::Cleanup);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn limited(frames: u64) -> GraphicsConfig {
        GraphicsConfig {
            fps: 0.0,
            frame_limit: Some(frames),
            ..GraphicsConfig::default()
        }
    }

    fn run(graphics: &mut GraphicsDomain) -> QuitToken {
        let quit = QuitToken::new();
        let ctx = DomainContext::new(quit.clone());
        graphics.initialize(&ctx).unwrap();
        graphics.start().unwrap();
        graphics.run_main_loop(&quit).unwrap();
        quit
    }

    #[test]
    fn test_frame_interval_is_clamped() {
        let at = |fps| GraphicsConfig {
            fps,
            ..GraphicsConfig::default()
        };
        assert_eq!(at(0.0).frame_interval(), Duration::ZERO);
        assert_eq!(at(f64::NAN).frame_interval(), Duration::ZERO);
        assert_eq!(at(4.0).frame_interval(), Duration::from_millis(250));
        assert_eq!(at(1e-30).frame_interval(), MAX_FRAME_INTERVAL);
        assert_eq!(at(f64::MIN_POSITIVE).frame_interval(), MAX_FRAME_INTERVAL);
    }

    #[test]
    fn test_frame_limit_quits() {
        let mut graphics = GraphicsDomain::new(limited(3));
        let quit = run(&mut graphics);
        assert!(quit.should_quit());
        assert_eq!(graphics.frames(), 3);
    }

    #[test]
    fn test_hooks_run_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
        let mut hooks = AppHooks::new()
            .on_init(move || a.borrow_mut().push("init".to_string()))
            .on_create(move || b.borrow_mut().push("create".to_string()))
            .on_animate(move |_dt| c.borrow_mut().push("animate".to_string()))
            .on_draw(move |frame| d.borrow_mut().push(format!("draw:{}", frame.index)));

        let mut graphics = GraphicsDomain::new(limited(2));
        graphics.bind_callbacks(&mut hooks);
        run(&mut graphics);

        assert_eq!(
            *log.borrow(),
            vec!["init", "create", "animate", "draw:0", "animate", "draw:1"]
        );
    }

    #[test]
    fn test_primary_close_quits() {
        let mut graphics = GraphicsDomain::with_window_factory(
            GraphicsConfig {
                fps: 0.0,
                ..GraphicsConfig::default()
            },
            || Box::new(HeadlessWindow::close_after(3)),
        );
        let quit = run(&mut graphics);
        assert!(quit.should_quit());
        assert_eq!(graphics.frames(), 2);
    }

    #[test]
    fn test_secondary_windows_open_and_close_at_runtime() {
        let draws = Rc::new(RefCell::new(Vec::new()));
        let seen = draws.clone();
        let mut hooks = AppHooks::new().on_draw(move |frame| {
            seen.borrow_mut().push((frame.index, frame.window));
        });

        let mut graphics = GraphicsDomain::new(limited(3));
        graphics.bind_callbacks(&mut hooks);
        let handle = graphics.handle();
        let second = handle.open_window(WindowConfig {
            title: "second".to_string(),
            ..WindowConfig::default()
        });
        run(&mut graphics);

        assert_eq!(second, WindowId(1));
        assert_eq!(graphics.window_ids(), vec![WindowId::PRIMARY, second]);
        assert!(draws.borrow().contains(&(0, second)));

        handle.close_window(second);
        graphics.apply_window_commands();
        assert_eq!(graphics.window_ids(), vec![WindowId::PRIMARY]);

        graphics.stop().unwrap();
        graphics.cleanup().unwrap();
        assert!(graphics.window_ids().is_empty());
    }

    #[test]
    fn test_window_domain_lifecycle() {
        let mut window = WindowDomain::headless(WindowConfig::default());
        window.initialize(&DomainContext::default()).unwrap();
        assert!(!window.is_created());
        window.start().unwrap();
        assert!(window.is_created());
        assert_eq!(window.size(), (800, 600));
        window.stop().unwrap();
        window.cleanup().unwrap();
        assert!(!window.is_created());
        assert_eq!(window.state(), DomainState::CleanedUp);
    }
}
