use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// How an external tool failure was classified from its stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    /// The tool could not find a usable GPU / compute device.
    GpuUnavailable,
    /// The stabilizer had no lens profile for the camera.
    LensProfileMissing,
    Generic,
}

impl std::fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolFailureKind::GpuUnavailable => f.write_str("gpu unavailable"),
            ToolFailureKind::LensProfileMissing => f.write_str("lens profile missing"),
            ToolFailureKind::Generic => f.write_str("generic failure"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("mount failed for {device}: {detail}")]
    MountFailure { device: String, detail: String },

    #[error("Integrity check failed: Size mismatch for {}: expected {expected} bytes, got {actual}", path.display())]
    IntegrityMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("{tool} failed ({classification}): {detail}")]
    ToolInvocationFailure {
        tool: String,
        classification: ToolFailureKind,
        detail: String,
    },

    #[error("capability unavailable: {capability}: {detail}")]
    CapabilityUnavailable { capability: String, detail: String },

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        PipelineError::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Whether another attempt at the same job could succeed.
    ///
    /// Missing capabilities and missing inputs do not change between
    /// attempts, so the queue fails those jobs without backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::CapabilityUnavailable { .. } | PipelineError::NotFound { .. }
        )
    }

    /// Short machine-readable tag for logs and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MountFailure { .. } => "mount_failure",
            PipelineError::IntegrityMismatch { .. } => "integrity_mismatch",
            PipelineError::ToolInvocationFailure { .. } => "tool_invocation_failure",
            PipelineError::CapabilityUnavailable { .. } => "capability_unavailable",
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::Io(_) => "io",
            PipelineError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_message_names_size_mismatch() {
        let err = PipelineError::IntegrityMismatch {
            path: PathBuf::from("/dest/DJI_0001.MP4"),
            expected: 10,
            actual: 7,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Integrity check failed: Size mismatch"));
        assert!(msg.contains("expected 10 bytes, got 7"));
    }

    #[test]
    fn test_retryable_classes() {
        assert!(!PipelineError::not_found("device", "abc").is_retryable());
        assert!(!PipelineError::CapabilityUnavailable {
            capability: "gpu".into(),
            detail: "probe failed".into(),
        }
        .is_retryable());
        assert!(PipelineError::ToolInvocationFailure {
            tool: "mp4_merge".into(),
            classification: ToolFailureKind::Generic,
            detail: "exit 1".into(),
        }
        .is_retryable());
        assert!(PipelineError::MountFailure {
            device: "/dev/sdb1".into(),
            detail: "busy".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ToolFailureKind::LensProfileMissing).unwrap();
        assert_eq!(json, "\"lens_profile_missing\"");
    }
}
