//! Audio backend seam
//!
//! A backend owns one stream: it opens a device with a [`StreamConfig`],
//! runs the process callback on its own realtime thread, and reports
//! [`StreamStats`]. The domain never touches the device directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::error::AudioError;

use super::{AudioDevice, AudioIOData};

/// Per-buffer process callback run on the backend's realtime thread.
pub type AudioProcess = Box<dyn FnMut(&mut AudioIOData) + Send>;

/// Parameters of an open stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Client name shown by the sound server
    pub name: String,
    pub sample_rate: f64,
    pub block_size: usize,
    pub channels_out: usize,
    pub channels_in: usize,
    pub device: AudioDevice,
}

impl StreamConfig {
    /// Buffer duration in seconds.
    pub fn block_seconds(&self) -> f64 {
        self.block_size as f64 / self.sample_rate
    }

    /// Buffer duration, or an error when it cannot be represented.
    pub fn block_period(&self) -> Result<Duration, AudioError> {
        Duration::try_from_secs_f64(self.block_seconds()).map_err(|_| {
            AudioError::Init(format!(
                "{} frames at {}Hz is not a usable buffer period",
                self.block_size, self.sample_rate
            ))
        })
    }

    /// Latency in milliseconds
    pub fn latency_ms(&self) -> f64 {
        self.block_seconds() * 1000.0
    }

    pub(crate) fn new_io_data(&self) -> AudioIOData {
        AudioIOData::new(
            self.block_size,
            self.channels_out,
            self.channels_in,
            self.sample_rate,
        )
    }

    pub(crate) fn validate(&self) -> Result<(), AudioError> {
        if self.block_size == 0 {
            return Err(AudioError::Init("block size must be non-zero".to_string()));
        }
        if self.sample_rate <= 0.0 || !self.sample_rate.is_finite() {
            return Err(AudioError::Init(format!(
                "invalid sample rate {}",
                self.sample_rate
            )));
        }
        self.block_period()?;
        if self.channels_out > self.device.max_output_channels
            || self.channels_in > self.device.max_input_channels
        {
            return Err(AudioError::Init(format!(
                "device '{}' supports {} out / {} in, requested {} / {}",
                self.device.name,
                self.device.max_output_channels,
                self.device.max_input_channels,
                self.channels_out,
                self.channels_in
            )));
        }
        Ok(())
    }
}

/// Runtime statistics updated by the realtime thread.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub callbacks: AtomicU64,
    /// Frames delivered, counted once per frame regardless of channel count
    pub frames_written: AtomicU64,
    /// Buffers that finished after their deadline
    pub overruns: AtomicU64,
    /// Input blocks padded with silence, or captured frames dropped on a full ring
    pub input_dropouts: AtomicU64,
}

impl StreamStats {
    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn input_dropouts(&self) -> u64 {
        self.input_dropouts.load(Ordering::Relaxed)
    }

    pub(crate) fn record_block(&self, frames: usize) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
        self.frames_written
            .fetch_add(frames as u64, Ordering::Relaxed);
    }
}

/// Drains captured interleaved samples into the input channels, one block
/// per call. Missing samples are read as silence.
pub(crate) struct InputCapture {
    ring: rtrb::Consumer<f32>,
    scratch: Vec<f32>,
}

impl InputCapture {
    pub(crate) fn new(ring: rtrb::Consumer<f32>, config: &StreamConfig) -> Self {
        Self {
            ring,
            scratch: vec![0.0; config.block_size * config.channels_in],
        }
    }

    pub(crate) fn fill(&mut self, io: &mut AudioIOData, stats: &StreamStats) {
        let mut short = false;
        for slot in self.scratch.iter_mut() {
            *slot = match self.ring.pop() {
                Ok(sample) => sample,
                Err(_) => {
                    short = true;
                    0.0
                }
            };
        }
        if short {
            stats.input_dropouts.fetch_add(1, Ordering::Relaxed);
        }
        io.deinterleave_input(&self.scratch);
    }
}

/// Wait for a freshly spawned stream thread to report that its stream is
/// connected. Every failure, including a thread that never answers, comes
/// back as [`AudioError::Init`].
pub(crate) fn await_ready(
    ready: &mpsc::Receiver<Result<(), AudioError>>,
    timeout: Duration,
) -> Result<(), AudioError> {
    match ready.recv_timeout(timeout) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(AudioError::Init(msg))) => Err(AudioError::Init(msg)),
        Ok(Err(e)) => Err(AudioError::Init(e.to_string())),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(AudioError::Init(format!(
            "stream did not connect within {:?}",
            timeout
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(AudioError::Init(
            "stream thread exited before connecting".to_string(),
        )),
    }
}

/// A device driver the audio domain can run its stream on.
pub trait AudioBackend: Send {
    fn name(&self) -> &str;

    /// Devices this backend can open.
    fn devices(&self) -> Vec<AudioDevice>;

    fn default_device(&self) -> Option<AudioDevice> {
        self.devices().into_iter().next()
    }

    /// Allocate the stream. The callback is not run until [`start`](Self::start).
    fn open(&mut self, config: StreamConfig, process: AudioProcess) -> Result<(), AudioError>;

    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop the realtime thread and wait for it to exit.
    fn stop(&mut self) -> Result<(), AudioError>;

    /// Release the stream. Stops it first if it is still running.
    fn close(&mut self) -> Result<(), AudioError>;

    fn is_open(&self) -> bool;

    fn is_running(&self) -> bool;

    fn stats(&self) -> Arc<StreamStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(sample_rate: f64, channels_in: usize) -> StreamConfig {
        StreamConfig {
            name: "test".to_string(),
            sample_rate,
            block_size: 4,
            channels_out: 2,
            channels_in,
            device: AudioDevice {
                index: 0,
                name: "test".to_string(),
                max_output_channels: 2,
                max_input_channels: 2,
                default_sample_rate: 44100.0,
            },
        }
    }

    #[test]
    fn test_unrepresentable_period_is_rejected() {
        assert!(config(44100.0, 0).validate().is_ok());
        assert!(matches!(
            config(1e-300, 0).validate(),
            Err(AudioError::Init(_))
        ));
        assert!(matches!(
            config(f64::MIN_POSITIVE, 0).block_period(),
            Err(AudioError::Init(_))
        ));
    }

    #[test]
    fn test_capture_fills_inputs_and_pads_with_silence() {
        let config = config(44100.0, 2);
        let (mut producer, consumer) = rtrb::RingBuffer::new(64);
        let mut capture = InputCapture::new(consumer, &config);
        let stats = StreamStats::default();
        let mut io = config.new_io_data();

        for frame in 0..4 {
            producer.push(frame as f32).unwrap();
            producer.push(-(frame as f32)).unwrap();
        }
        capture.fill(&mut io, &stats);
        assert_eq!(stats.input_dropouts(), 0);
        io.next_frame();
        io.next_frame();
        io.next_frame();
        assert_eq!(io.input(0), 2.0);
        assert_eq!(io.input(1), -2.0);

        // Half a block arrives; the rest reads as silence.
        producer.push(7.0).unwrap();
        producer.push(8.0).unwrap();
        capture.fill(&mut io, &stats);
        assert_eq!(stats.input_dropouts(), 1);
        io.reset_frame();
        io.next_frame();
        assert_eq!(io.input(0), 7.0);
        assert_eq!(io.input(1), 8.0);
        io.next_frame();
        assert_eq!(io.input(0), 0.0);
    }

    #[test]
    fn test_await_ready_reports_connection_outcome() {
        let (tx, rx) = mpsc::channel();
        tx.send(Ok(())).unwrap();
        assert!(await_ready(&rx, Duration::from_secs(1)).is_ok());

        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            let _ = tx.send(Err(AudioError::Stream("refused".to_string())));
        });
        let err = await_ready(&rx, Duration::from_secs(1)).unwrap_err();
        worker.join().unwrap();
        assert!(matches!(err, AudioError::Init(msg) if msg.contains("refused")));

        let (tx, rx) = mpsc::channel::<Result<(), AudioError>>();
        drop(tx);
        assert!(matches!(
            await_ready(&rx, Duration::from_secs(1)),
            Err(AudioError::Init(_))
        ));

        let (_tx, rx) = mpsc::channel::<Result<(), AudioError>>();
        assert!(matches!(
            await_ready(&rx, Duration::from_millis(10)),
            Err(AudioError::Init(_))
        ));
    }
}
