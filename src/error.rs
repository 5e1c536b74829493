//! Typed errors for the pipeline core

use thiserror::Error;

/// Errors raised by the pipeline orchestrator
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The requested transition is not allowed from the current state
    #[error("cannot {action} pipeline while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
    /// A stage thread could not be spawned
    #[error("failed to spawn {stage} thread: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },
    /// Configuration rejected before start
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors raised by the frame and region caches
#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    /// Frame buffer does not hold `stride * height` bytes
    #[error("frame buffer too small: {actual} bytes, expected at least {expected}")]
    TruncatedFrame { expected: usize, actual: usize },
    /// Frame has zero width or height
    #[error("frame has empty dimensions {width}x{height}")]
    EmptyFrame { width: u32, height: u32 },
    /// Requested region has no pixels inside the frame
    #[error("region {bbox} lies outside the frame")]
    RegionOutside { bbox: crate::vision::BBox },
}

/// Errors raised by the record store
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("no record with id {0}")]
    NotFound(uuid::Uuid),
    #[error("record {0} is confirmed and can no longer be edited")]
    Confirmed(uuid::Uuid),
}
