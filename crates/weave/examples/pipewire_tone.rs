//! Simple tone generator to test PipeWire output
//!
//! Run with: cargo run -p weave --features pipewire --example pipewire_tone

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use weave::sample_rate::Sine;
use weave::{
    AudioConfig, AudioDomain, Domain, DomainContext, PipeWireBackend, QuitToken,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Starting PipeWire tone test...");
    println!("You should hear a 440Hz sine wave for 5 seconds.");

    let config = AudioConfig {
        sample_rate: 48000.0,
        block_size: 512, // ~10.7ms - try 256 for ~5ms, 128 for ~2.7ms
        ..AudioConfig::default()
    };
    println!(
        "Configured latency: {} frames ({:.1}ms)",
        config.block_size,
        config.block_size as f64 / config.sample_rate * 1000.0
    );

    let mut audio = AudioDomain::with_backend(config, Box::new(PipeWireBackend::new()));
    let mut sine = Sine::with_sample_rate(440.0, 0.3, 48000.0);
    audio.set_sound_hook(move |io| {
        while io.next_frame() {
            let sample = sine.next_sample();
            io.set_out(0, sample);
            io.set_out(1, sample);
        }
    });

    audio.initialize(&DomainContext::new(QuitToken::new()))?;
    audio.start()?;

    let stats = audio.stats();
    for second in 1..=5 {
        thread::sleep(Duration::from_secs(1));
        println!(
            "{}s: {} callbacks, {} frames, {} overruns",
            second,
            stats.callbacks.load(Ordering::Relaxed),
            stats.frames_written.load(Ordering::Relaxed),
            stats.overruns.load(Ordering::Relaxed)
        );
    }

    audio.stop()?;
    audio.cleanup()?;
    println!("Done!");
    Ok(())
}
