//! Error types for the denoise pipeline

use crate::{resource_pool::ResourceId, resource_state::ResourceState, stage_graph::GraphValidationError};
use std::path::PathBuf;

/// Errors surfaced by the pipeline and its backends
///
/// `AcquireStale` and `FrameLoadMissing` are recoverable; everything else is fatal
/// for the running pipeline.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("failed to create resource `{label}`: {reason}")]
    ResourceCreation { label: String, reason: String },

    #[error("unsupported state transition for resource {resource}: {from:?} -> {to:?}")]
    UnsupportedTransition { resource: ResourceId, from: ResourceState, to: ResourceState },

    #[error("present target is stale")]
    AcquireStale,

    #[error("failed to acquire present target: {0}")]
    Acquire(String),

    #[error("command submission failed: {0}")]
    Submission(String),

    #[error("frame file not found: {}", path.display())]
    FrameLoadMissing { path: PathBuf },

    #[error("failed to load shader `{name}`: {source}")]
    ShaderLoad {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid stage graph: {0}")]
    InvalidGraph(#[from] GraphValidationError),

    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),
}

impl PipelineError {
    pub fn resource_creation(label: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::ResourceCreation {
            label: label.into(),
            reason: reason.to_string(),
        }
    }

    pub fn submission(reason: impl ToString) -> Self {
        PipelineError::Submission(reason.to_string())
    }

    /// Whether the pipeline can continue with the next iteration
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::AcquireStale | PipelineError::FrameLoadMissing { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
