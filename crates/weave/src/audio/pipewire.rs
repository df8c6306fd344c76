//! PipeWire audio backend
//!
//! The stream runs on its own thread inside a PipeWire main loop. PipeWire
//! asks for however many frames it wants per quantum; the process callback
//! always renders whole `block_size` buffers into an interleaved scratch
//! block, and the PipeWire callback drains that block into the server buffer.
//!
//! With input channels configured, a second capture stream on the same
//! main loop pushes captured frames into a ring that the playback side
//! drains into the input channels before each `process` call.
//!
//! ```text
//! PipeWire RT thread
//!        │
//!   capture: dequeue_buffer() ──► ring
//!        │
//!   playback: dequeue_buffer()
//!        │       scratch empty? ──► ring ──► deinterleave_input
//!        │                          process(&mut io) ──► interleave_into(scratch)
//!        ▼
//!   copy scratch ──► queue_buffer()
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::AudioError;

use super::backend::{
    await_ready, AudioBackend, AudioProcess, InputCapture, StreamConfig, StreamStats,
};
use super::{AudioDevice, AudioIOData};

const DEFAULT_TARGET: &str = "default";

/// How long start waits for the streams to connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Capture ring size, in blocks
const CAPTURE_BLOCKS: usize = 8;

/// PipeWire stream owned by the audio domain.
///
/// The process callback moves into the PipeWire thread on start, so a
/// stopped stream has to be reopened before it can run again.
pub struct PipeWireBackend {
    targets: Vec<String>,
    config: Option<StreamConfig>,
    process: Option<AudioProcess>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    stats: Arc<StreamStats>,
}

impl PipeWireBackend {
    pub fn new() -> Self {
        Self::with_targets(Vec::new())
    }

    /// Expose named sink nodes as selectable devices after the default one.
    pub fn with_targets(targets: Vec<String>) -> Self {
        pipewire::init();
        Self {
            targets,
            config: None,
            process: None,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            stats: Arc::new(StreamStats::default()),
        }
    }
}

impl Default for PipeWireBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for PipeWireBackend {
    fn name(&self) -> &str {
        "pipewire"
    }

    fn devices(&self) -> Vec<AudioDevice> {
        std::iter::once(DEFAULT_TARGET.to_string())
            .chain(self.targets.iter().cloned())
            .enumerate()
            .map(|(index, name)| AudioDevice {
                index,
                name,
                max_output_channels: 64,
                max_input_channels: 64,
                default_sample_rate: 48000.0,
            })
            .collect()
    }

    fn open(&mut self, config: StreamConfig, process: AudioProcess) -> Result<(), AudioError> {
        if self.is_open() {
            return Err(AudioError::AlreadyOpen);
        }
        config.validate()?;
        debug!(
            "pipewire stream opened: {} -> {} @ {}Hz, {} frames",
            config.name, config.device.name, config.sample_rate, config.block_size
        );
        self.config = Some(config);
        self.process = Some(process);
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioError> {
        if self.is_running() {
            return Ok(());
        }
        let config = self.config.clone().ok_or(AudioError::NotOpen)?;
        let process = self.process.take().ok_or_else(|| {
            AudioError::Stream("stream must be reopened after stop".to_string())
        })?;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let thread_config = config.clone();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("weave-pipewire".to_string())
            .spawn(move || {
                if let Err(e) = run_pipewire_loop(thread_config, process, running, stats, &ready_tx) {
                    error!("PipeWire output thread failed: {}", e);
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                AudioError::ThreadSpawn(e.to_string())
            })?;

        if let Err(e) = await_ready(&ready_rx, CONNECT_TIMEOUT) {
            self.running.store(false, Ordering::Release);
            if handle.join().is_err() {
                error!("PipeWire thread panicked while connecting");
            }
            return Err(e);
        }

        self.thread_handle = Some(handle);
        info!(
            "PipeWire stream started: {} @ {}Hz, {} channels",
            config.name, config.sample_rate, config.channels_out
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            debug!("waiting for PipeWire thread to stop");
            handle
                .join()
                .map_err(|_| AudioError::Stream("PipeWire thread panicked".to_string()))?;
            info!("PipeWire stream stopped");
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let stopped = self.stop();
        self.process = None;
        self.config = None;
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

impl Drop for PipeWireBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// State moved into the PipeWire process callback.
struct RtState {
    stats: Arc<StreamStats>,
    process: AudioProcess,
    io: AudioIOData,
    /// One interleaved block rendered by `process`
    scratch: Vec<f32>,
    /// Next unread frame in `scratch`
    cursor: usize,
    capture: Option<InputCapture>,
}

impl RtState {
    fn refill(&mut self) {
        if let Some(capture) = self.capture.as_mut() {
            capture.fill(&mut self.io, &self.stats);
        }
        (self.process)(&mut self.io);
        self.io.interleave_into(&mut self.scratch);
        self.stats.record_block(self.io.frames_per_buffer());
        self.cursor = 0;
    }
}

fn run_pipewire_loop(
    config: StreamConfig,
    process: AudioProcess,
    running: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    ready: &mpsc::Sender<Result<(), AudioError>>,
) -> Result<(), AudioError> {
    use pipewire as pw;
    use pw::spa::pod::Pod;
    use pw::{properties::properties, spa};

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| AudioError::Init(format!("Failed to create main loop: {}", e)))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| AudioError::Init(format!("Failed to create context: {}", e)))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| AudioError::Init(format!("Failed to connect to PipeWire: {}", e)))?;

    let sample_rate = config.sample_rate.round() as u32;
    let latency = format!("{}/{}", config.block_size, sample_rate);

    let mut props = properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::AUDIO_CHANNELS => config.channels_out.to_string(),
    };
    props.insert("node.latency", latency.as_str());
    if config.device.name != DEFAULT_TARGET {
        props.insert("target.object", config.device.name.as_str());
    }
    debug!("Requesting latency: {} ({:.1}ms)", latency, config.latency_ms());

    let stream = pw::stream::StreamBox::new(&core, &config.name, props)
        .map_err(|e| AudioError::Init(format!("Failed to create stream: {}", e)))?;

    let channels = config.channels_out;
    let sample_size = std::mem::size_of::<f32>();
    let stride = sample_size * channels;
    let block = config.block_size;

    let (capture_producer, capture) = if config.channels_in > 0 {
        let (producer, consumer) =
            rtrb::RingBuffer::new(block * config.channels_in * CAPTURE_BLOCKS);
        (Some(producer), Some(InputCapture::new(consumer, &config)))
    } else {
        (None, None)
    };

    let rt = RtState {
        stats: Arc::clone(&stats),
        process,
        io: config.new_io_data(),
        scratch: vec![0.0f32; block * channels],
        cursor: block,
        capture,
    };

    let _listener = stream
        .add_local_listener_with_user_data(rt)
        .process(move |stream, rt| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let requested = buffer.requested() as usize;
            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };
            let Some(slice) = data.data() else {
                return;
            };

            let max_frames = slice.len() / stride.max(1);
            let n_frames = if requested > 0 {
                requested.min(max_frames)
            } else {
                block.min(max_frames)
            };

            for i in 0..n_frames {
                if rt.cursor >= block {
                    rt.refill();
                }
                for c in 0..channels {
                    let sample = rt.scratch[rt.cursor * channels + c];
                    let start = i * stride + c * sample_size;
                    slice[start..start + sample_size].copy_from_slice(&sample.to_le_bytes());
                }
                rt.cursor += 1;
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (stride * n_frames) as u32;
        })
        .register()
        .map_err(|e| AudioError::Init(format!("Failed to register listener: {}", e)))?;

    let values = format_pod(sample_rate, channels)?;
    let mut params = [Pod::from_bytes(&values)
        .ok_or_else(|| AudioError::Init("Failed to create Pod from bytes".to_string()))?];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| AudioError::Init(format!("Failed to connect stream: {}", e)))?;

    let (capture_stream, capture_state) = match capture_producer {
        Some(producer) => {
            let mut capture_props = properties! {
                *pw::keys::MEDIA_TYPE => "Audio",
                *pw::keys::MEDIA_ROLE => "Production",
                *pw::keys::MEDIA_CATEGORY => "Capture",
                *pw::keys::AUDIO_CHANNELS => config.channels_in.to_string(),
            };
            capture_props.insert("node.latency", latency.as_str());
            let capture_name = format!("{} capture", config.name);
            let stream = pw::stream::StreamBox::new(&core, &capture_name, capture_props)
                .map_err(|e| AudioError::Init(format!("Failed to create capture stream: {}", e)))?;
            (Some(stream), Some((producer, Arc::clone(&stats))))
        }
        None => (None, None),
    };

    let in_channels = config.channels_in;
    let in_stride = sample_size * in_channels;
    let _capture_listener = match (&capture_stream, capture_state) {
        (Some(capture_stream), Some(state)) => Some(
            capture_stream
                .add_local_listener_with_user_data(state)
                .process(move |stream, (producer, stats)| {
                    let Some(mut buffer) = stream.dequeue_buffer() else {
                        return;
                    };
                    let datas = buffer.datas_mut();
                    let Some(data) = datas.first_mut() else {
                        return;
                    };
                    let size = data.chunk().size() as usize;
                    let Some(slice) = data.data() else {
                        return;
                    };
                    let n_frames = size.min(slice.len()) / in_stride.max(1);

                    for frame in slice[..n_frames * in_stride].chunks_exact(in_stride) {
                        // Whole frames only, so channels never slip.
                        if producer.slots() < in_channels {
                            stats.input_dropouts.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        for bytes in frame.chunks_exact(sample_size) {
                            let sample = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                            let _ = producer.push(sample);
                        }
                    }
                })
                .register()
                .map_err(|e| AudioError::Init(format!("Failed to register capture listener: {}", e)))?,
        ),
        _ => None,
    };

    if let Some(capture_stream) = &capture_stream {
        let values = format_pod(sample_rate, in_channels)?;
        let mut params = [Pod::from_bytes(&values)
            .ok_or_else(|| AudioError::Init("Failed to create Pod from bytes".to_string()))?];
        capture_stream
            .connect(
                spa::utils::Direction::Input,
                None,
                pw::stream::StreamFlags::AUTOCONNECT
                    | pw::stream::StreamFlags::MAP_BUFFERS
                    | pw::stream::StreamFlags::RT_PROCESS,
                &mut params,
            )
            .map_err(|e| AudioError::Init(format!("Failed to connect capture stream: {}", e)))?;
        debug!("PipeWire capture stream connected: {} channels", in_channels);
    }

    info!("PipeWire stream connected, entering main loop");

    let mainloop_weak = mainloop.downgrade();
    let timer = mainloop.loop_().add_timer(move |_| {
        if !running.load(Ordering::Acquire) {
            if let Some(ml) = mainloop_weak.upgrade() {
                ml.quit();
            }
        }
    });

    timer
        .update_timer(
            Some(Duration::from_millis(100)),
            Some(Duration::from_millis(100)),
        )
        .into_result()
        .map_err(|e| AudioError::Init(format!("Failed to set timer: {}", e)))?;

    // The receiver is gone only if start already gave up on us.
    let _ = ready.send(Ok(()));
    mainloop.run();

    info!("PipeWire main loop exited");
    Ok(())
}

/// Serialized `EnumFormat` pod for interleaved F32LE at the given rate.
fn format_pod(sample_rate: u32, channels: usize) -> Result<Vec<u8>, AudioError> {
    use pipewire::spa;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(sample_rate);
    audio_info.set_channels(channels as u32);

    let mut position = [0u32; spa::param::audio::MAX_CHANNELS];
    if channels >= 1 {
        position[0] = spa::sys::SPA_AUDIO_CHANNEL_FL;
    }
    if channels >= 2 {
        position[1] = spa::sys::SPA_AUDIO_CHANNEL_FR;
    }
    audio_info.set_position(position);

    let values = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(spa::pod::Object {
            type_: spa::sys::SPA_TYPE_OBJECT_Format,
            id: spa::sys::SPA_PARAM_EnumFormat,
            properties: audio_info.into(),
        }),
    )
    .map_err(|e| AudioError::Init(format!("Failed to serialize format: {}", e)))?
    .0
    .into_inner();
    Ok(values)
}
