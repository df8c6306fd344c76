//! Software-clocked audio backend
//!
//! Runs the process callback on a dedicated thread paced to the buffer
//! period, without touching any hardware. Output is counted and discarded.
//! Input comes from an optional feed ring and is silent otherwise.
//! This is the "dummy device" used when no sound server is available.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::AudioError;

use super::backend::{AudioBackend, AudioProcess, InputCapture, StreamConfig, StreamStats};
use super::{AudioDevice, AudioIOData};

const CLOCKED_DEVICE_NAME: &str = "clocked";

/// An open stream that is not currently running.
struct Parked {
    process: AudioProcess,
    io: AudioIOData,
    capture: Option<InputCapture>,
}

pub struct ClockedBackend {
    devices: Vec<AudioDevice>,
    config: Option<StreamConfig>,
    parked: Option<Parked>,
    /// Feed installed before the stream was opened
    pending_feed: Option<rtrb::Consumer<f32>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<Parked>>,
    stats: Arc<StreamStats>,
}

impl ClockedBackend {
    pub fn new() -> Self {
        Self::with_devices(vec![AudioDevice {
            index: 0,
            name: CLOCKED_DEVICE_NAME.to_string(),
            max_output_channels: 64,
            max_input_channels: 64,
            default_sample_rate: crate::sample_rate::DEFAULT_SAMPLE_RATE,
        }])
    }

    /// A backend that reports no devices, as on a machine without audio.
    pub fn without_devices() -> Self {
        Self::with_devices(Vec::new())
    }

    pub fn with_devices(devices: Vec<AudioDevice>) -> Self {
        Self {
            devices,
            config: None,
            parked: None,
            pending_feed: None,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            stats: Arc::new(StreamStats::default()),
        }
    }

    /// Samples pushed here, interleaved by input channel, are delivered as
    /// the stream's input one block per callback. Replaces any earlier feed.
    /// A feed installed while the stream runs takes effect on the next start.
    pub fn input_feed(&mut self, capacity: usize) -> rtrb::Producer<f32> {
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        match (self.parked.as_mut(), self.config.as_ref()) {
            (Some(parked), Some(config)) if config.channels_in > 0 => {
                parked.capture = Some(InputCapture::new(consumer, config));
            }
            _ => self.pending_feed = Some(consumer),
        }
        producer
    }
}

impl Default for ClockedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for ClockedBackend {
    fn name(&self) -> &str {
        CLOCKED_DEVICE_NAME
    }

    fn devices(&self) -> Vec<AudioDevice> {
        self.devices.clone()
    }

    fn open(&mut self, config: StreamConfig, process: AudioProcess) -> Result<(), AudioError> {
        if self.is_open() {
            return Err(AudioError::AlreadyOpen);
        }
        if !self.devices.iter().any(|d| d.index == config.device.index) {
            return Err(AudioError::NoDevice(config.device.name.clone()));
        }
        config.validate()?;

        let io = config.new_io_data();
        debug!(
            "clocked stream opened: {} @ {}Hz, {} frames, {} out / {} in",
            config.name, config.sample_rate, config.block_size, config.channels_out, config.channels_in
        );
        let capture = match self.pending_feed.take() {
            Some(feed) if config.channels_in > 0 => Some(InputCapture::new(feed, &config)),
            _ => None,
        };
        self.parked = Some(Parked {
            process,
            io,
            capture,
        });
        self.config = Some(config);
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if self.is_running() {
            return Ok(());
        }
        let config = self.config.clone().ok_or(AudioError::NotOpen)?;
        let period = config.block_period()?;
        let parked = self.parked.take().ok_or(AudioError::NotOpen)?;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);

        let handle = thread::Builder::new()
            .name("weave-audio".to_string())
            .spawn(move || run_clocked_loop(parked, period, running, stats))
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                AudioError::ThreadSpawn(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        info!(
            "clocked audio started: {} @ {}Hz ({:.1}ms blocks)",
            config.name,
            config.sample_rate,
            config.latency_ms()
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::Release);
        let Some(handle) = self.thread_handle.take() else {
            return Ok(());
        };
        debug!("waiting for clocked audio thread to stop");
        match handle.join() {
            Ok(parked) => {
                self.parked = Some(parked);
                info!("clocked audio stopped");
                Ok(())
            }
            Err(_) => {
                // The callback panicked and took the stream with it.
                self.config = None;
                Err(AudioError::Stream("audio thread panicked".to_string()))
            }
        }
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let stopped = self.stop();
        self.parked = None;
        if self.config.take().is_some() {
            debug!("clocked stream closed");
        }
        stopped
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    fn stats(&self) -> Arc<StreamStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for ClockedBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_clocked_loop(
    mut parked: Parked,
    period: Duration,
    running: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
) -> Parked {
    let mut deadline = Instant::now() + period;
    while running.load(Ordering::Acquire) {
        if let Some(capture) = parked.capture.as_mut() {
            capture.fill(&mut parked.io, &stats);
        }
        (parked.process)(&mut parked.io);
        stats.record_block(parked.io.frames_per_buffer());

        let now = Instant::now();
        if now > deadline {
            stats.overruns.fetch_add(1, Ordering::Relaxed);
            deadline = now + period;
        } else {
            thread::sleep(deadline - now);
            deadline += period;
        }
    }
    parked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn stream_config(backend: &ClockedBackend) -> StreamConfig {
        StreamConfig {
            name: "test".to_string(),
            sample_rate: 44100.0,
            block_size: 64,
            channels_out: 2,
            channels_in: 0,
            device: backend.default_device().unwrap(),
        }
    }

    #[test]
    fn test_start_requires_open() {
        let mut backend = ClockedBackend::new();
        assert!(matches!(backend.start(), Err(AudioError::NotOpen)));
    }

    #[test]
    fn test_open_twice_is_rejected() {
        let mut backend = ClockedBackend::new();
        let config = stream_config(&backend);
        backend.open(config.clone(), Box::new(|_| {})).unwrap();
        assert!(matches!(
            backend.open(config, Box::new(|_| {})),
            Err(AudioError::AlreadyOpen)
        ));
    }

    #[test]
    fn test_callback_runs_and_restarts() {
        let mut backend = ClockedBackend::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        backend
            .open(
                stream_config(&backend),
                Box::new(move |io| {
                    assert_eq!(io.frames_per_buffer(), 64);
                    counter.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        backend.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        backend.stop().unwrap();
        let first_run = calls.load(Ordering::Relaxed);
        assert!(first_run > 0);
        assert!(backend.is_open());

        backend.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        backend.close().unwrap();
        assert!(calls.load(Ordering::Relaxed) > first_run);
        assert!(!backend.is_open());
        assert_eq!(
            backend.stats().frames_written(),
            backend.stats().callbacks() * 64
        );
    }

    #[test]
    fn test_too_many_channels_fails_to_open() {
        let mut backend = ClockedBackend::new();
        let mut config = stream_config(&backend);
        config.channels_out = 128;
        assert!(matches!(
            backend.open(config, Box::new(|_| {})),
            Err(AudioError::Init(_))
        ));
        assert!(!backend.is_open());
    }

    #[test]
    fn test_input_feed_reaches_the_callback() {
        let mut backend = ClockedBackend::new();
        let mut feed = backend.input_feed(1024);
        let mut config = stream_config(&backend);
        config.channels_in = 1;

        let first_input = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&first_input);
        backend
            .open(
                config,
                Box::new(move |io| {
                    io.reset_frame();
                    io.next_frame();
                    sink.lock().unwrap().push(io.input(0));
                }),
            )
            .unwrap();
        for _ in 0..64 {
            feed.push(0.25).unwrap();
        }

        backend.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        backend.stop().unwrap();

        let seen = first_input.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&0.25));
        // The feed ran dry after one block.
        assert!(seen[1..].iter().all(|&s| s == 0.0));
        assert!(backend.stats().input_dropouts() > 0);
    }

    #[test]
    fn test_degenerate_sample_rate_fails_to_open() {
        let mut backend = ClockedBackend::new();
        let mut config = stream_config(&backend);
        config.sample_rate = 1e-300;
        assert!(matches!(
            backend.open(config, Box::new(|_| {})),
            Err(AudioError::Init(_))
        ));
    }

    #[test]
    fn test_no_callbacks_after_stop() {
        let mut backend = ClockedBackend::new();
        backend
            .open(stream_config(&backend), Box::new(|_| {}))
            .unwrap();
        backend.start().unwrap();
        thread::sleep(Duration::from_millis(10));
        backend.stop().unwrap();

        let after_stop = backend.stats().callbacks();
        // Several 64-frame periods at 44.1kHz.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(backend.stats().callbacks(), after_stop);
        assert!(!backend.is_running());
    }
}
