use thiserror::Error;

/// Failure of a single prediction. None of these affect process-wide state.
#[derive(Error, Debug)]
pub enum PredictError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to read control image {origin}: {error}")]
    ControlImage { origin: String, error: String },

    #[error("generation failed: {0:#}")]
    Generation(#[from] anyhow::Error),

    #[error("failed to write output image {path}: {error}")]
    Output { path: String, error: String },
}

impl PredictError {
    /// True when the request itself was at fault rather than the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::ControlImage { .. })
    }
}
