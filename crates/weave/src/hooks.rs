//! User callback slots
//!
//! The composite app owns one [`AppHooks`]. At start, each domain claims the
//! slots it dispatches to through [`Domain::bind_callbacks`]:
//!
//! | domain   | slots                                          |
//! |----------|------------------------------------------------|
//! | audio    | `on_sound`                                     |
//! | graphics | `on_init`, `on_create`, `on_animate`, `on_draw` |
//! | OSC      | `on_message`                                   |
//!
//! Slots that run on a single thread are moved into the first domain that
//! claims them. `on_message` is shared and cloned into every OSC domain.
//!
//! [`Domain::bind_callbacks`]: crate::Domain::bind_callbacks

use std::net::SocketAddr;
use std::sync::Arc;

use rosc::OscMessage;

use crate::audio::AudioIOData;
use crate::graphics::Frame;

/// Runs once before windows exist.
pub type InitHook = Box<dyn FnMut()>;
/// Runs once after windows are created.
pub type CreateHook = Box<dyn FnMut()>;
/// Runs every frame with elapsed seconds.
pub type AnimateHook = Box<dyn FnMut(f64)>;
/// Runs every frame per window.
pub type DrawHook = Box<dyn FnMut(&mut Frame)>;
/// Runs on the realtime audio thread once per buffer. Must not block or allocate.
pub type SoundHook = Box<dyn FnMut(&mut AudioIOData) + Send>;
/// Runs on the OSC listener thread for every unclaimed message.
pub type MessageHook = Arc<dyn Fn(&OscMessage, SocketAddr) + Send + Sync>;
/// Runs on the main thread after the main loop returns, before domains stop.
pub type ExitHook = Box<dyn FnMut()>;

/// The set of user-overridable callbacks.
#[derive(Default)]
pub struct AppHooks {
    init: Option<InitHook>,
    create: Option<CreateHook>,
    animate: Option<AnimateHook>,
    draw: Option<DrawHook>,
    sound: Option<SoundHook>,
    message: Option<MessageHook>,
    exit: Option<ExitHook>,
}

impl AppHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_init(mut self, f: impl FnMut() + 'static) -> Self {
        self.init = Some(Box::new(f));
        self
    }

    pub fn on_create(mut self, f: impl FnMut() + 'static) -> Self {
        self.create = Some(Box::new(f));
        self
    }

    pub fn on_animate(mut self, f: impl FnMut(f64) + 'static) -> Self {
        self.animate = Some(Box::new(f));
        self
    }

    pub fn on_draw(mut self, f: impl FnMut(&mut Frame) + 'static) -> Self {
        self.draw = Some(Box::new(f));
        self
    }

    pub fn on_sound(mut self, f: impl FnMut(&mut AudioIOData) + Send + 'static) -> Self {
        self.sound = Some(Box::new(f));
        self
    }

    pub fn on_message(
        mut self,
        f: impl Fn(&OscMessage, SocketAddr) + Send + Sync + 'static,
    ) -> Self {
        self.message = Some(Arc::new(f));
        self
    }

    pub fn on_exit(mut self, f: impl FnMut() + 'static) -> Self {
        self.exit = Some(Box::new(f));
        self
    }

    pub fn take_init(&mut self) -> Option<InitHook> {
        self.init.take()
    }

    pub fn take_create(&mut self) -> Option<CreateHook> {
        self.create.take()
    }

    pub fn take_animate(&mut self) -> Option<AnimateHook> {
        self.animate.take()
    }

    pub fn take_draw(&mut self) -> Option<DrawHook> {
        self.draw.take()
    }

    pub fn take_sound(&mut self) -> Option<SoundHook> {
        self.sound.take()
    }

    pub fn take_exit(&mut self) -> Option<ExitHook> {
        self.exit.take()
    }

    /// Shared message hook; every OSC domain gets a clone.
    pub fn message(&self) -> Option<MessageHook> {
        self.message.clone()
    }
}

impl std::fmt::Debug for AppHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppHooks")
            .field("on_init", &self.init.is_some())
            .field("on_create", &self.create.is_some())
            .field("on_animate", &self.animate.is_some())
            .field("on_draw", &self.draw.is_some())
            .field("on_sound", &self.sound.is_some())
            .field("on_message", &self.message.is_some())
            .field("on_exit", &self.exit.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_slots_are_claimed_once() {
        let mut hooks = AppHooks::new().on_sound(|_io| {}).on_animate(|_dt| {});

        assert!(hooks.take_sound().is_some());
        assert!(hooks.take_sound().is_none());
        assert!(hooks.take_animate().is_some());
        assert!(hooks.take_draw().is_none());
    }

    #[test]
    fn test_message_slot_is_shared() {
        let hooks = AppHooks::new().on_message(|_msg, _from| {});
        let a = hooks.message().unwrap();
        let b = hooks.message().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
