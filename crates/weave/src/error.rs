//! Error types shared by every domain.

use crate::domain::{DomainState, Transition};

/// Result alias that carries [`DomainError`].
pub type Result<T> = std::result::Result<T, DomainError>;

/// Failure of a domain lifecycle phase or tick.
///
/// The orchestrator logs these and keeps going; none of them abort a run.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    /// A device, socket, or window could not be acquired.
    #[error("{resource} unavailable: {reason}")]
    ResourceUnavailable { resource: String, reason: String },

    /// The OSC port fallback search found nothing that binds.
    #[error("no free port in {first}..={last} on {address}")]
    PortRangeExhausted {
        address: String,
        first: u16,
        last: u16,
    },

    /// A transition was requested out of sequence (programming error).
    #[error("domain '{domain}' cannot {transition:?} from {state:?}")]
    LifecycleOrder {
        domain: String,
        state: DomainState,
        transition: Transition,
    },

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("state codec error: {0}")]
    Codec(String),

    #[error("state packet is {size} bytes, limit is {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("thread error: {0}")]
    Thread(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DomainError {
    /// Shorthand for [`DomainError::ResourceUnavailable`].
    pub fn unavailable(resource: impl Into<String>, reason: impl ToString) -> Self {
        Self::ResourceUnavailable {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors from an audio backend.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no audio device matches {0}")]
    NoDevice(String),

    #[error("audio stream is not open")]
    NotOpen,

    #[error("audio stream is already open")]
    AlreadyOpen,

    #[error("failed to initialize audio backend: {0}")]
    Init(String),

    #[error("failed to spawn audio thread: {0}")]
    ThreadSpawn(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("backend '{0}' is not compiled in")]
    NotAvailable(String),
}
