//! Audio domain
//!
//! Owns one output (and optional input) stream on an [`AudioBackend`] and
//! runs the app's `on_sound` hook once per buffer on the backend's realtime
//! thread.
//!
//! The realtime callback never logs, never allocates and never blocks: the
//! sound hook and the output tap sit behind mutexes that the callback only
//! `try_lock`s, skipping the buffer (silence) if the control thread holds
//! them.

mod backend;
mod clocked;
mod io_data;
#[cfg(feature = "pipewire")]
mod pipewire;

pub use backend::{AudioBackend, AudioProcess, StreamConfig, StreamStats};
pub use clocked::ClockedBackend;
pub use io_data::AudioIOData;
#[cfg(feature = "pipewire")]
pub use pipewire::PipeWireBackend;

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use weaveconf::AudioSection;

use crate::domain::{Domain, DomainContext, DomainKind, DomainState, Lifecycle, Transition};
use crate::error::{AudioError, DomainError, Result};
use crate::hooks::{AppHooks, SoundHook};
use crate::sample_rate;

/// A device a backend can open.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDevice {
    pub index: usize,
    pub name: String,
    pub max_output_channels: usize,
    pub max_input_channels: usize,
    pub default_sample_rate: f64,
}

/// How the audio domain picks its device.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DeviceSelector {
    #[default]
    Default,
    Index(usize),
    /// First device whose name contains this substring (case-insensitive)
    NameMatch(String),
    Device(AudioDevice),
}

impl DeviceSelector {
    /// Parse a config string: empty or `default`, a device index, or a name
    /// fragment.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("default") {
            DeviceSelector::Default
        } else if let Ok(index) = s.parse() {
            DeviceSelector::Index(index)
        } else {
            DeviceSelector::NameMatch(s.to_string())
        }
    }

    pub fn resolve(&self, backend: &dyn AudioBackend) -> Result<AudioDevice> {
        let found = match self {
            DeviceSelector::Default => backend.default_device(),
            DeviceSelector::Index(index) => {
                backend.devices().into_iter().find(|d| d.index == *index)
            }
            DeviceSelector::NameMatch(fragment) => {
                let needle = fragment.to_lowercase();
                backend
                    .devices()
                    .into_iter()
                    .find(|d| d.name.to_lowercase().contains(&needle))
            }
            DeviceSelector::Device(device) => Some(device.clone()),
        };
        found.ok_or_else(|| {
            DomainError::unavailable(
                "audio device",
                AudioError::NoDevice(format!("{:?} on backend '{}'", self, backend.name())),
            )
        })
    }
}

/// Stream parameters for the audio domain.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    pub sample_rate: f64,
    pub block_size: usize,
    pub channels_out: usize,
    pub channels_in: usize,
    pub device: DeviceSelector,
    /// Open the stream during initialize instead of start
    pub open_on_initialize: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: sample_rate::DEFAULT_SAMPLE_RATE,
            block_size: 256,
            channels_out: 2,
            channels_in: 0,
            device: DeviceSelector::Default,
            open_on_initialize: false,
        }
    }
}

impl From<&AudioSection> for AudioConfig {
    fn from(section: &AudioSection) -> Self {
        Self {
            sample_rate: section.sample_rate,
            block_size: section.block_size,
            channels_out: section.channels_out,
            channels_in: section.channels_in,
            device: DeviceSelector::parse(&section.device),
            open_on_initialize: section.open_on_initialize,
        }
    }
}

type PreStartCallback = Box<dyn FnMut(&mut AudioConfig)>;

/// The backend compiled in as the default for this build.
pub fn default_backend() -> Box<dyn AudioBackend> {
    #[cfg(feature = "pipewire")]
    {
        Box::new(PipeWireBackend::new())
    }
    #[cfg(not(feature = "pipewire"))]
    {
        Box::new(ClockedBackend::new())
    }
}

pub struct AudioDomain {
    lifecycle: Lifecycle,
    config: AudioConfig,
    backend: Box<dyn AudioBackend>,
    device: Option<AudioDevice>,
    pre_start: Vec<PreStartCallback>,
    sound: Arc<Mutex<Option<SoundHook>>>,
    tap: Arc<Mutex<Option<rtrb::Producer<f32>>>>,
}

impl AudioDomain {
    /// An audio domain on the software-clocked backend.
    pub fn new(config: AudioConfig) -> Self {
        Self::with_backend(config, Box::new(ClockedBackend::new()))
    }

    pub fn with_backend(config: AudioConfig, backend: Box<dyn AudioBackend>) -> Self {
        Self {
            lifecycle: Lifecycle::new("audio"),
            config,
            backend,
            device: None,
            pre_start: Vec::new(),
            sound: Arc::new(Mutex::new(None)),
            tap: Arc::new(Mutex::new(None)),
        }
    }

    /// Rename the domain, for apps that run more than one stream.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.lifecycle = Lifecycle::new(name);
        self
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Device resolved at initialize.
    pub fn device(&self) -> Option<&AudioDevice> {
        self.device.as_ref()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.backend.stats()
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_open()
    }

    /// Register a callback that may adjust the configuration before the
    /// device is resolved and the stream opened.
    pub fn add_pre_start_callback(&mut self, f: impl FnMut(&mut AudioConfig) + 'static) {
        self.pre_start.push(Box::new(f));
    }

    /// Set the sound hook directly instead of through [`AppHooks`].
    pub fn set_sound_hook(&mut self, f: impl FnMut(&mut AudioIOData) + Send + 'static) {
        let mut slot = self.sound.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Box::new(f));
    }

    /// Ring buffer fed from the realtime thread with output channel 0 after
    /// every block. Replaces any previous tap. Samples that do not fit are
    /// dropped.
    pub fn output_tap(&self, capacity: usize) -> rtrb::Consumer<f32> {
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        let mut slot = self.tap.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(producer);
        consumer
    }

    fn stream_config(&self, device: AudioDevice) -> StreamConfig {
        StreamConfig {
            name: format!("weave-{}", self.lifecycle.name()),
            sample_rate: self.config.sample_rate,
            block_size: self.config.block_size,
            channels_out: self.config.channels_out,
            channels_in: self.config.channels_in,
            device,
        }
    }

    fn open(&mut self) -> Result<()> {
        let device = match &self.device {
            Some(device) => device.clone(),
            None => self.config.device.resolve(self.backend.as_ref())?,
        };
        let config = self.stream_config(device);
        let process = realtime_process(Arc::clone(&self.sound), Arc::clone(&self.tap));
        self.backend
            .open(config, process)
            .map_err(|e| DomainError::unavailable("audio stream", e))?;
        debug!("audio stream open on backend '{}'", self.backend.name());
        Ok(())
    }
}

/// Build the closure the backend runs once per buffer.
fn realtime_process(
    sound: Arc<Mutex<Option<SoundHook>>>,
    tap: Arc<Mutex<Option<rtrb::Producer<f32>>>>,
) -> AudioProcess {
    Box::new(move |io: &mut AudioIOData| {
        io.zero_outputs();
        io.reset_frame();
        if let Ok(mut hook) = sound.try_lock() {
            if let Some(hook) = hook.as_mut() {
                hook(io);
            }
        }
        io.reset_frame();

        if let Ok(mut tap) = tap.try_lock() {
            if let Some(producer) = tap.as_mut() {
                for &sample in io.out_buffer(0) {
                    if producer.push(sample).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

impl Domain for AudioDomain {
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
        let mut slot = self.sound.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = hooks.take_sound();
        }
    }

    fn initialize(&mut self, _ctx: &DomainContext) -> Result<()> {
        self.lifecycle.check(Transition::Initialize)?;

        for callback in &mut self.pre_start {
            callback(&mut self.config);
        }
        let device = self.config.device.resolve(self.backend.as_ref())?;
        info!(
            "audio device '{}' (#{}) on backend '{}'",
            device.name,
            device.index,
            self.backend.name()
        );
        self.device = Some(device);

        if self.config.open_on_initialize {
            self.open()?;
        }

        self.lifecycle.commit(Transition::Initialize);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Start)?;

        let mut first: Option<DomainError> = None;
        if !self.backend.is_open() {
            if let Err(e) = self.open() {
                warn!("audio open failed: {}", e);
                first.get_or_insert(e);
            }
        }

        sample_rate::set_global(self.config.sample_rate);

        if let Err(e) = self.backend.start() {
            warn!("audio start failed: {}", e);
            first.get_or_insert(e.into());
        }

        if let Some(e) = first {
            return Err(e);
        }

        self.lifecycle.commit(Transition::Start);
        info!(
            "audio running: {} Hz, {} frames, {} out / {} in",
            self.config.sample_rate,
            self.config.block_size,
            self.config.channels_out,
            self.config.channels_in
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.lifecycle.check(Transition::Stop)?;

        let stopped = self.backend.stop();
        let closed = self.backend.close();
        self.lifecycle.commit(Transition::Stop);

        let stats = self.backend.stats();
        info!(
            "audio stopped after {} callbacks ({} overruns, {} input dropouts)",
            stats.callbacks(),
            stats.overruns(),
            stats.input_dropouts()
        );
        stopped.and(closed).map_err(Into::into)
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.lifecycle.begin_cleanup() {
            return Ok(());
        }
        if self.backend.is_open() {
            if let Err(e) = self.backend.close() {
                warn!("audio close during cleanup failed: {}", e);
            }
        }
        self.lifecycle.commit(Transition::Cleanup);
        debug!("audio domain cleaned up");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_device_selector_parse() {
        assert_eq!(DeviceSelector::parse(""), DeviceSelector::Default);
        assert_eq!(DeviceSelector::parse("Default"), DeviceSelector::Default);
        assert_eq!(DeviceSelector::parse("3"), DeviceSelector::Index(3));
        assert_eq!(
            DeviceSelector::parse("USB"),
            DeviceSelector::NameMatch("USB".to_string())
        );
    }

    #[test]
    fn test_name_match_is_case_insensitive() {
        let backend = ClockedBackend::new();
        let device = DeviceSelector::NameMatch("CLOCK".to_string())
            .resolve(&backend)
            .unwrap();
        assert_eq!(device.name, "clocked");
    }

    #[test]
    fn test_unknown_device_fails_initialize() {
        let config = AudioConfig {
            device: DeviceSelector::Index(7),
            ..AudioConfig::default()
        };
        let mut audio = AudioDomain::new(config);
        let err = audio.initialize(&DomainContext::default()).unwrap_err();
        assert!(matches!(err, DomainError::ResourceUnavailable { .. }));
        assert_eq!(audio.state(), DomainState::Uninitialized);
    }

    #[test]
    fn test_no_devices_fails_initialize() {
        let mut audio =
            AudioDomain::with_backend(AudioConfig::default(), Box::new(ClockedBackend::without_devices()));
        assert!(audio.initialize(&DomainContext::default()).is_err());
    }

    #[test]
    fn test_pre_start_callback_adjusts_config() {
        let mut audio = AudioDomain::new(AudioConfig::default());
        audio.add_pre_start_callback(|config| config.block_size = 128);
        audio.initialize(&DomainContext::default()).unwrap();
        assert_eq!(audio.config().block_size, 128);
        assert!(!audio.is_open());
    }

    #[test]
    fn test_open_on_initialize() {
        let config = AudioConfig {
            open_on_initialize: true,
            ..AudioConfig::default()
        };
        let mut audio = AudioDomain::new(config);
        audio.initialize(&DomainContext::default()).unwrap();
        assert!(audio.is_open());
        audio.cleanup().unwrap();
        assert!(!audio.is_open());
    }

    #[test]
    fn test_start_before_initialize_is_rejected() {
        let mut audio = AudioDomain::new(AudioConfig::default());
        assert!(matches!(
            audio.start(),
            Err(DomainError::LifecycleOrder { .. })
        ));
    }

    #[test]
    fn test_sound_hook_fills_whole_blocks() {
        let mut audio = AudioDomain::new(AudioConfig::default());
        let frames_seen = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&frames_seen);
        let mut hooks = AppHooks::new().on_sound(move |io| {
            let mut n = 0;
            while io.next_frame() {
                io.set_out(0, 0.5);
                io.set_out(1, -0.5);
                n += 1;
            }
            seen.store(n, Ordering::Relaxed);
        });
        audio.bind_callbacks(&mut hooks);
        assert!(hooks.take_sound().is_none());

        let mut tap = audio.output_tap(4096);
        audio.initialize(&DomainContext::default()).unwrap();
        audio.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        audio.stop().unwrap();

        assert_eq!(frames_seen.load(Ordering::Relaxed), 256);
        assert!(audio.stats().callbacks() > 0);
        let tapped = tap.pop().unwrap();
        assert_eq!(tapped, 0.5);
        assert_eq!(audio.state(), DomainState::Stopped);

        // The realtime thread is gone: no callbacks across several periods.
        let callbacks = audio.stats().callbacks();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(audio.stats().callbacks(), callbacks);

        // A stopped stream restarts with the same hook.
        audio.start().unwrap();
        audio.stop().unwrap();
        audio.cleanup().unwrap();
        audio.cleanup().unwrap();
        assert_eq!(audio.state(), DomainState::CleanedUp);
    }
}
