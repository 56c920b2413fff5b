// src/error.rs
use thiserror::Error;

/// Failures of the stream channel.
///
/// Transport and recovery failures are handled locally (retry with backoff,
/// or degrade to buffer-only replay); only `MaxAttemptsExceeded` becomes
/// externally visible, through the connection status watch.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Socket-level failure. Drives the reconnect state machine.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed frame. The frame is dropped and logged; the sequence
    /// counter is untouched.
    #[error("malformed frame: {0}")]
    Parse(#[from] serde_json::Error),

    /// The gap-recovery fetch failed. Replay degrades to buffered
    /// messages only.
    #[error("gap recovery fetch failed: {0}")]
    RecoveryFetch(#[from] reqwest::Error),

    /// Reconnection gave up. Terminal until `reconnect_now()` or an
    /// explicit disconnect/connect cycle.
    #[error("gave up reconnecting after {attempts} attempts")]
    MaxAttemptsExceeded { attempts: u32 },
}
