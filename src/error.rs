//! Error types shared across the tracer and enrichment pipeline.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type TraceResult<T> = Result<T, TraceError>;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("max hops must be between 1 and 255, got {0}")]
    InvalidMaxHops(u8),

    #[error("probe count must be between 1 and 10, got {0}")]
    InvalidProbeCount(u8),

    #[error("probe timeout must be at least 100ms, got {0:?}")]
    InvalidTimeout(Duration),

    #[error("first hop {first} must be between 1 and max hops {max}")]
    InvalidFirstHop { first: u8, max: u8 },

    #[error("raw socket requires elevated privileges (root or CAP_NET_RAW): {0}")]
    PermissionDenied(#[source] io::Error),

    #[error("failed to resolve target {0}")]
    Resolution(String),

    #[error("hop limit {0} out of range 1-255")]
    InvalidTtl(u8),

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("probe timed out")]
    Timeout,

    #[error("trace cancelled")]
    Cancelled,

    #[error("malformed packet: {0}")]
    InvalidPacket(&'static str),

    #[error("enrichment backend failed: {0}")]
    Enrichment(String),
}

impl TraceError {
    /// Classify an I/O error from a socket operation.
    ///
    /// Timeouts surface as `Timeout`, privilege refusals as
    /// `PermissionDenied`, everything else as `Transport`.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err),
            _ => Self::Transport(err),
        }
    }

    /// True for configuration validation failures.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidMaxHops(_)
                | Self::InvalidProbeCount(_)
                | Self::InvalidTimeout(_)
                | Self::InvalidFirstHop { .. }
        )
    }
}
