//! Weave demo
//!
//! Runs audio, graphics and OSC domains from configuration, with an orbiting
//! point simulated on the primary and replicated to any `--replica`
//! instances over UDP.
//!
//! ```text
//! weave-demo --frames 600                 # primary, 10s at 60 fps
//! weave-demo --replica --config b.toml    # replica listening on state.port
//! ```
//!
//! While it runs, `/demo/freq <float>` over OSC changes the tone.

use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use weave::sample_rate::Sine;
use weave::{
    AppHooks, AudioConfig, AudioDomain, CompositeApp, GraphicsConfig, GraphicsDomain, OscConfig,
    OscDomain, Parameter, QuitToken, StateReceiveConfig, StateRole, StateSendConfig,
    StateSimulationDomain, SubDomainPhase, WeaveConfig,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file, loaded after the system and user configs
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Quit after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Receive the orbit state instead of simulating it
    #[arg(long)]
    replica: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Orbit {
    angle: f64,
    radius: f64,
    revolutions: u32,
}

fn init_tracing(config: &WeaveConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Quit on SIGINT or SIGTERM.
fn spawn_signal_handler(quit: QuitToken) -> Result<()> {
    thread::Builder::new()
        .name("weave-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("signal handler unavailable: {}", e);
                    return;
                }
            };
            runtime.block_on(async {
                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    match signal(SignalKind::terminate()) {
                        Ok(mut sigterm) => {
                            tokio::select! {
                                _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down"),
                                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                            }
                        }
                        Err(_) => {
                            let _ = tokio::signal::ctrl_c().await;
                            info!("Received SIGINT (Ctrl+C), shutting down");
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received Ctrl+C, shutting down");
                }
            });
            quit.quit();
        })
        .context("failed to spawn signal handler thread")?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WeaveConfig::load_from(cli.config.as_deref()).context("failed to load config")?;
    if cli.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }
    init_tracing(&config);
    info!("weave-demo {} starting", env!("CARGO_PKG_VERSION"));

    let freq = Parameter::new("/demo/freq", 220.0, 20.0, 2000.0);
    let tone = freq.clone();
    let mut sine = Sine::new(220.0, 0.2);

    let hooks = AppHooks::new()
        .on_sound(move |io| {
            sine.set_freq(f64::from(tone.get()));
            while io.next_frame() {
                let sample = sine.next_sample();
                for channel in 0..io.channels_out() {
                    io.set_out(channel, sample);
                }
            }
        })
        .on_message(|msg, from| info!("OSC {} {:?} from {}", msg.addr, msg.args, from))
        .on_exit(|| info!("exiting"));

    let role = if cli.replica {
        StateRole::Replica
    } else {
        StateRole::Primary
    };
    let mut orbit = StateSimulationDomain::new(
        "orbit",
        role,
        Orbit {
            radius: 1.0,
            ..Orbit::default()
        },
    )
    .with_simulation(|orbit: &mut Orbit, dt| {
        orbit.angle += dt * std::f64::consts::TAU * 0.25;
        if orbit.angle >= std::f64::consts::TAU {
            orbit.angle -= std::f64::consts::TAU;
            orbit.revolutions += 1;
        }
    });
    match role {
        StateRole::Primary => orbit.add_state_sender(StateSendConfig::from(&config.state)),
        StateRole::Replica => orbit.add_state_receiver(StateReceiveConfig::from(&config.state)),
    }
    let orbit_view = orbit.outbound();

    let mut graphics_config = GraphicsConfig::from(&config.graphics);
    if cli.frames.is_some() {
        graphics_config.frame_limit = cli.frames;
    }
    let graphics =
        GraphicsDomain::new(graphics_config).with_sub_domain(SubDomainPhase::Pre, orbit);

    let mut app = CompositeApp::new(hooks.on_draw(move |frame| {
        if frame.index % 60 == 0 {
            if let Some(orbit) = orbit_view.latest() {
                info!(
                    "frame {}: angle {:.2} rad, {} revolutions",
                    frame.index, orbit.angle, orbit.revolutions
                );
            }
        }
    }));

    if config.audio.enabled {
        app.add_domain(AudioDomain::with_backend(
            AudioConfig::from(&config.audio),
            weave::audio::default_backend(),
        ));
    }
    app.add_domain(graphics);
    if config.osc.enabled {
        let osc = OscDomain::new(OscConfig::from(&config.osc));
        osc.register_parameter(freq);
        app.add_domain(osc);
    }

    spawn_signal_handler(app.quit_token())?;

    let report = app.start();
    for outcome in &report.outcomes {
        for (phase, error) in &outcome.errors {
            warn!("{} {:?}: {}", outcome.name, phase, error);
        }
    }
    info!(
        "weave-demo shutdown complete (stop order {:?})",
        report.stop_order_names()
    );
    Ok(())
}
