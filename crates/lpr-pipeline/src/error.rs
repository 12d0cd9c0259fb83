use thiserror::Error;

/// Failures surfaced by the recognition pipeline.
///
/// `InvalidImage`, `InvalidSelection`, `ModelLoadFailure` and `Config` reach the caller.
/// `EmptyRegion` and `Inference` are absorbed per vehicle or plate by the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("failed to load model '{path}': {reason}")]
    ModelLoadFailure { path: String, reason: String },

    #[error("empty region: {0}")]
    EmptyRegion(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Self::InvalidImage(msg.into())
    }

    pub fn model_load(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ModelLoadFailure {
            path: path.into(),
            reason: format!("{:#}", reason),
        }
    }

    pub fn inference(err: impl std::fmt::Display) -> Self {
        Self::Inference(format!("{:#}", err))
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(format!("{:#}", msg))
    }

    /// Whether the orchestrator may skip the affected region and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::EmptyRegion(_) | Self::Inference(_))
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidImage(_) => "invalid_image",
            Self::ModelLoadFailure { .. } => "model_load_failure",
            Self::EmptyRegion(_) => "empty_region",
            Self::Inference(_) => "inference",
            Self::InvalidSelection(_) => "invalid_selection",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(PipelineError::EmptyRegion("vehicle 0".into()).is_recoverable());
        assert!(PipelineError::inference("timeout").is_recoverable());
        assert!(!PipelineError::invalid_image("zero size").is_recoverable());
        assert!(!PipelineError::model_load("models/x.onnx", "missing").is_recoverable());
        assert!(!PipelineError::config("bad threshold").is_recoverable());
    }

    #[test]
    fn test_anyhow_chain_is_kept() {
        let err = anyhow::anyhow!("root cause").context("running plate model");
        let mapped = PipelineError::inference(err);
        let message = mapped.to_string();
        assert!(message.contains("running plate model"));
        assert!(message.contains("root cause"));
    }
}
