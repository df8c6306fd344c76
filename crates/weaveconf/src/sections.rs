//! Configuration sections, one per domain plus telemetry.

use serde::{Deserialize, Serialize};

/// Audio stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    /// Frames per second.
    /// Default: 44100
    pub sample_rate: f64,

    /// Frames per callback buffer.
    /// Default: 256
    pub block_size: usize,

    /// Output channel count.
    /// Default: 2
    pub channels_out: usize,

    /// Input channel count.
    /// Default: 0
    pub channels_in: usize,

    /// Device selector: empty for the default device, a number for a device
    /// index, anything else is matched as a name substring.
    pub device: String,

    /// Open the stream during initialize instead of start.
    pub open_on_initialize: bool,

    /// Disable the audio domain entirely.
    pub enabled: bool,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            block_size: 256,
            channels_out: 2,
            channels_in: 0,
            device: String::new(),
            open_on_initialize: false,
            enabled: true,
        }
    }
}

/// Window and frame-loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphicsSection {
    /// Target frames per second for the frame loop.
    /// Default: 60
    pub fps: f64,

    pub width: u32,
    pub height: u32,
    pub title: String,

    /// Stop after this many frames (headless runs). Zero means unlimited.
    pub frame_limit: u64,
}

impl Default for GraphicsSection {
    fn default() -> Self {
        Self {
            fps: 60.0,
            width: 800,
            height: 600,
            title: "weave".to_string(),
            frame_limit: 0,
        }
    }
}

/// OSC listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscSection {
    /// Primary listener port.
    /// Default: 9010
    pub port: u16,

    /// Address the listener binds to.
    /// Default: 0.0.0.0
    pub bind_address: String,

    /// How far above `port` the fallback search may go.
    /// Default: 100
    pub max_port_offset: u16,

    /// Disable the OSC domain entirely.
    pub enabled: bool,
}

impl Default for OscSection {
    fn default() -> Self {
        Self {
            port: 9010,
            bind_address: "0.0.0.0".to_string(),
            max_port_offset: 100,
            enabled: true,
        }
    }
}

/// State distribution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// Port replicas listen on.
    /// Default: 10100
    pub port: u16,

    /// Address replicas bind to.
    pub bind_address: String,

    /// Where the primary sends its snapshots.
    pub destinations: Vec<String>,

    /// Largest datagram the sender will emit.
    /// Default: 8192
    pub max_packet_size: usize,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            port: 10100,
            bind_address: "0.0.0.0".to_string(),
            destinations: vec!["127.0.0.1:10100".to_string()],
            max_packet_size: 8192,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// Log level or full `EnvFilter` directive.
    /// Default: info
    pub log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
