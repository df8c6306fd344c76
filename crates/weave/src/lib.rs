//! Weave: computation domains for interactive audio-visual apps
//!
//! An app is a set of cooperating domains with different concurrency models,
//! assembled by a [`CompositeApp`] and driven through one lifecycle:
//!
//! - **Audio** ([`AudioDomain`]): realtime callback thread, runs `on_sound`
//!   once per buffer
//! - **Graphics** ([`GraphicsDomain`]): frame-clocked main loop, runs
//!   `on_animate` and `on_draw`, ticks simulation sub-domains
//! - **OSC** ([`OscDomain`]): UDP listener thread, runs `on_message`
//! - **Simulation** ([`SimulationDomain`], [`StateSimulationDomain`]):
//!   synchronous, ticked once per frame
//! - **State distribution** ([`StateSendDomain`], [`StateReceiveDomain`]):
//!   replicates a shared state struct from a primary to replicas
//!
//! ```no_run
//! use weave::{AppHooks, AudioConfig, AudioDomain, CompositeApp, GraphicsConfig, GraphicsDomain};
//!
//! let hooks = AppHooks::new().on_sound(|io| {
//!     while io.next_frame() {
//!         io.set_out(0, 0.0);
//!     }
//! });
//! let mut app = CompositeApp::new(hooks);
//! app.add_domain(AudioDomain::new(AudioConfig::default()));
//! app.add_domain(GraphicsDomain::new(GraphicsConfig::default()));
//! let report = app.start();
//! assert_eq!(report.stop_order_names(), vec!["graphics", "audio"]);
//! ```

pub mod audio;
pub mod composite;
pub mod domain;
pub mod error;
pub mod graphics;
pub mod hooks;
pub mod osc;
pub mod quit;
pub mod sample_rate;
pub mod simulation;
pub mod state;

pub use audio::{
    AudioBackend, AudioConfig, AudioDevice, AudioDomain, AudioIOData, ClockedBackend,
    DeviceSelector, StreamConfig, StreamStats,
};
#[cfg(feature = "pipewire")]
pub use audio::PipeWireBackend;
pub use composite::{CompositeApp, DomainId, DomainOutcome, RunReport, StatusBoard};
pub use domain::{
    Domain, DomainContext, DomainKind, DomainState, Lifecycle, SubDomainPhase, SubDomains,
    SynchronousDomain, Transition,
};
pub use error::{AudioError, DomainError, Result};
pub use graphics::{
    Frame, GraphicsConfig, GraphicsDomain, GraphicsHandle, HeadlessWindow, Window, WindowConfig,
    WindowDomain, WindowId,
};
pub use hooks::AppHooks;
pub use osc::{OscConfig, OscDomain, OscRole, Parameter, ParameterRegistry};
pub use quit::QuitToken;
pub use simulation::{SimulationDomain, StateRole, StateSimulationDomain};
pub use state::{
    JsonCodec, MsgPackCodec, SharedState, StateCodec, StateDistributionDomain, StatePacket,
    StateReceiveConfig, StateReceiveDomain, StateSendConfig, StateSendDomain, StateSnapshot,
};

pub use rosc::{OscMessage, OscType};
pub use weaveconf::WeaveConfig;
