//! ONNX Runtime sessions owned by the pipeline.
//!
//! Sessions are created once at start-up into a [`ModelSet`] and shared behind a mutex,
//! so concurrent callers of the same model are serialized.

use crate::config::{PipelineConfig, PlateBackend, RecognizerBackend, RuntimeConfig};
use crate::error::{PipelineError, Result};
use anyhow::Context;
use ndarray::{Array, ArrayD, IxDyn};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use telemetry::metrics::{LPR_INFERENCE_TIME, LPR_MODELS_LOADED};

/// One loaded inference session.
pub struct OnnxModel {
    name: String,
    path: String,
    execution_provider: String,
    session: Mutex<Session>,
}

impl std::fmt::Debug for OnnxModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxModel")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("execution_provider", &self.execution_provider)
            .finish()
    }
}

impl OnnxModel {
    /// Load a model, falling back TensorRT -> CUDA -> CPU from the configured preference.
    pub fn load(name: &str, path: &str, runtime: &RuntimeConfig) -> Result<Self> {
        if !Path::new(path).is_file() {
            return Err(PipelineError::model_load(path, "model file not found"));
        }

        let (session, execution_provider) =
            create_session(path, runtime).map_err(|e| PipelineError::model_load(path, e))?;

        tracing::info!(
            model = name,
            path,
            provider = %execution_provider,
            device = runtime.device_id,
            "model loaded"
        );

        Ok(Self {
            name: name.to_string(),
            path: path.to_string(),
            execution_provider,
            session: Mutex::new(session),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn execution_provider(&self) -> &str {
        &self.execution_provider
    }

    /// Run the model on a single input tensor and return the first output found under
    /// `output_names`.
    pub fn run(&self, input: ArrayD<f32>, output_names: &[&str]) -> anyhow::Result<ArrayD<f32>> {
        let input_tensor = Value::from_array(input)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to lock {} session: {}", self.name, e))?;

        let inference_start = Instant::now();
        let outputs = session.run(ort::inputs![input_tensor])?;
        LPR_INFERENCE_TIME
            .with_label_values(&[&self.name, &self.execution_provider])
            .observe(inference_start.elapsed().as_secs_f64());

        let output_value = output_names
            .iter()
            .find_map(|name| outputs.get(*name))
            .with_context(|| {
                format!(
                    "No {} output tensor found (tried: {})",
                    self.name,
                    output_names.join(", ")
                )
            })?;
        let (shape, data) = output_value.try_extract_tensor::<f32>()?;

        let shape_usize: Vec<usize> = shape.as_ref().iter().map(|&x| x as usize).collect();
        let output = Array::from_shape_vec(IxDyn(&shape_usize), data.to_vec())?;

        Ok(output)
    }
}

fn create_session(model_path: &str, runtime: &RuntimeConfig) -> anyhow::Result<(Session, String)> {
    match runtime.execution_provider.to_uppercase().as_str() {
        "TENSORRT" => {
            tracing::info!("Attempting TensorRT for {}", model_path);
            let result = Session::builder()
                .context("Failed to create session builder")?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .context("Failed to set optimization level")?
                .with_intra_threads(runtime.intra_threads)
                .context("Failed to set intra threads")?
                .with_inter_threads(runtime.inter_threads)
                .context("Failed to set inter threads")?
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(runtime.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(runtime.device_id)
                        .build(),
                    CPUExecutionProvider::default().build(),
                ])
                .context("Failed to set execution providers")?
                .commit_from_file(model_path);

            match result {
                Ok(session) => Ok((session, "TensorRT".to_string())),
                Err(e) => {
                    tracing::warn!("TensorRT failed, trying CUDA: {}", e);
                    try_cuda(model_path, runtime)
                }
            }
        }
        "CUDA" => try_cuda(model_path, runtime),
        _ => try_cpu(model_path, runtime),
    }
}

fn try_cuda(model_path: &str, runtime: &RuntimeConfig) -> anyhow::Result<(Session, String)> {
    tracing::info!("Attempting CUDA for {}", model_path);
    let result = Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(runtime.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(runtime.inter_threads)
        .context("Failed to set inter threads")?
        .with_execution_providers([
            CUDAExecutionProvider::default()
                .with_device_id(runtime.device_id)
                .build(),
            CPUExecutionProvider::default().build(),
        ])
        .context("Failed to set execution providers")?
        .commit_from_file(model_path);

    match result {
        Ok(session) => Ok((session, "CUDA".to_string())),
        Err(e) => {
            tracing::warn!("CUDA failed, using CPU: {}", e);
            try_cpu(model_path, runtime)
        }
    }
}

fn try_cpu(model_path: &str, runtime: &RuntimeConfig) -> anyhow::Result<(Session, String)> {
    let session = Session::builder()
        .context("Failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(runtime.intra_threads)
        .context("Failed to set intra threads")?
        .with_inter_threads(runtime.inter_threads)
        .context("Failed to set inter threads")?
        .commit_from_file(model_path)
        .context("Failed to load model from file")?;
    Ok((session, "CPU".to_string()))
}

/// Every session the configured backends need.
#[derive(Debug, Clone)]
pub struct ModelSet {
    pub vehicle: Arc<OnnxModel>,
    /// Present only with the `onnx` plate backend
    pub plate: Option<Arc<OnnxModel>>,
    /// Present only with the `ctc` recognizer backend
    pub ocr: Option<Arc<OnnxModel>>,
}

impl ModelSet {
    /// Load the models named by `config`. Any failure aborts start-up.
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        let runtime = &config.runtime;

        let vehicle = Arc::new(OnnxModel::load(
            "vehicle",
            &config.localizer.vehicle_model_path,
            runtime,
        )?);

        let plate = match config.localizer.plate_backend {
            PlateBackend::Onnx => {
                let path = config.localizer.plate_model_path.as_deref().ok_or_else(|| {
                    PipelineError::Config("localizer.plate_model_path is not set".to_string())
                })?;
                Some(Arc::new(OnnxModel::load("plate", path, runtime)?))
            }
            PlateBackend::Contour => None,
        };

        let ocr = match config.recognizer.backend {
            RecognizerBackend::Ctc => {
                let path = config.recognizer.model_path.as_deref().ok_or_else(|| {
                    PipelineError::Config("recognizer.model_path is not set".to_string())
                })?;
                Some(Arc::new(OnnxModel::load("ocr", path, runtime)?))
            }
            RecognizerBackend::Disabled => {
                tracing::warn!("OCR model not configured, plates will be located but not read");
                None
            }
        };

        let set = Self {
            vehicle,
            plate,
            ocr,
        };
        LPR_MODELS_LOADED.set(set.loaded_count() as i64);
        Ok(set)
    }

    /// Number of sessions held by this set.
    pub fn loaded_count(&self) -> usize {
        1 + usize::from(self.plate.is_some()) + usize::from(self.ocr.is_some())
    }

    /// Release this handle on the sessions. Sessions shared with a live pipeline stay
    /// loaded until the pipeline is dropped too.
    pub fn shutdown(self) {
        tracing::info!(models = self.loaded_count(), "shutting down model set");
        LPR_MODELS_LOADED.set(0);
    }
}
