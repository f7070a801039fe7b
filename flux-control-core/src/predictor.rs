use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::anyhow;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{GenerationRequest, ModelLike, PredictError};

/// Outcome of one prediction: where the PNG was written and how it was made.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Prediction {
    pub id: String,
    pub seed: u64,
    pub output: PathBuf,
    pub width: usize,
    pub height: usize,
}

/// The process-wide prediction service.
///
/// Holds the single loaded pipeline; concurrent callers queue on the mutex so
/// at most one generation runs at a time.
pub struct Predictor {
    model: Mutex<Box<dyn ModelLike>>,
    output_dir: PathBuf,
}

impl Predictor {
    pub fn new(model: Box<dyn ModelLike>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            model: Mutex::new(model),
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Runs one prediction and writes the result to `<output_dir>/<id>.png`.
    pub fn predict(&self, request: &GenerationRequest) -> Result<Prediction, PredictError> {
        let id = Uuid::new_v4().to_string();
        let path = self.output_dir.join(format!("{id}.png"));
        self.run(id, request, &path)
    }

    /// Runs one prediction and writes the result to `path`.
    pub fn predict_to(
        &self,
        request: &GenerationRequest,
        path: &Path,
    ) -> Result<Prediction, PredictError> {
        self.run(Uuid::new_v4().to_string(), request, path)
    }

    fn run(
        &self,
        id: String,
        request: &GenerationRequest,
        path: &Path,
    ) -> Result<Prediction, PredictError> {
        let params = request.prepare()?;
        let image = {
            let mut model = self
                .model
                .lock()
                .map_err(|_| anyhow!("a previous generation panicked"))?;
            model.run(&params)?
        };

        let output_error = |error: String| PredictError::Output {
            path: path.display().to_string(),
            error,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| output_error(e.to_string()))?;
        }
        image
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|e| output_error(e.to_string()))?;
        info!(id = %id, seed = params.seed, output = %path.display(), "prediction written");

        Ok(Prediction {
            id,
            seed: params.seed,
            output: path.to_path_buf(),
            width: params.width,
            height: params.height,
        })
    }
}
