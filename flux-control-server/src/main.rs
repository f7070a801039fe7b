use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use clap::{Args, Parser, Subcommand};
use flux_control_core::{
    provision, ControlType, DeviceMap, FluxControlLoader, GenerationRequest, Loader,
    PredictError, Prediction, Predictor, WeightsConfig, DEFAULT_CONTROLNET_URL,
    DEFAULT_MODEL_URL,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{self, net::TcpListener};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "FLUX.1-dev multi-ControlNet image generation")]
struct Cli {
    /// Use CPU instead of GPU
    #[arg(long, global = true, env = "FLUX_CONTROL_CPU")]
    cpu: bool,

    /// Accelerator ordinal to run on
    #[arg(long, global = true, default_value_t = 0, env = "FLUX_CONTROL_DEVICE_ORDINAL")]
    device_ordinal: usize,

    /// Directory holding the downloaded weight bundles
    #[arg(long, global = true, default_value = "weights", env = "FLUX_CONTROL_WEIGHTS_DIR")]
    weights_dir: PathBuf,

    /// Archive with the FLUX.1-dev base model
    #[arg(long, global = true, default_value = DEFAULT_MODEL_URL, env = "FLUX_CONTROL_MODEL_URL")]
    model_url: String,

    /// Archive with the ControlNet Union Pro weights
    #[arg(long, global = true, default_value = DEFAULT_CONTROLNET_URL, env = "FLUX_CONTROL_CONTROLNET_URL")]
    controlnet_url: String,

    /// Fetch both bundles from the Hugging Face Hub instead of the archives
    #[arg(long, global = true, env = "FLUX_CONTROL_FROM_HUB")]
    from_hub: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn weights_config(&self) -> WeightsConfig {
        WeightsConfig {
            root: self.weights_dir.clone(),
            model_url: self.model_url.clone(),
            controlnet_url: self.controlnet_url.clone(),
            from_hub: self.from_hub,
        }
    }

    fn device_map(&self) -> DeviceMap {
        DeviceMap::from_flags(self.cpu, self.device_ordinal)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the pipeline once and serve predictions over HTTP
    Serve {
        /// Host address to bind the server to
        #[arg(long, default_value = "127.0.0.1", env = "FLUX_CONTROL_HOST")]
        host: String,

        /// Port to bind the server to
        #[arg(long, default_value_t = 8000, env = "FLUX_CONTROL_PORT")]
        port: u16,

        /// Where generated images are written
        #[arg(long, default_value = "outputs", env = "FLUX_CONTROL_OUTPUT_DIR")]
        output_dir: PathBuf,
    },
    /// Run a single prediction and exit
    Predict(PredictArgs),
    /// Fetch and verify the weight bundles, then exit
    Download,
}

#[derive(Args, Debug)]
struct PredictArgs {
    #[arg(long, default_value = "A bohemian-style female travel blogger with sun-kissed skin and messy beach waves")]
    prompt: String,

    #[arg(long, default_value_t = 3.5)]
    guidance_scale: f64,

    #[arg(long, default_value_t = 28)]
    steps: usize,

    #[arg(long, default_value = "canny")]
    control_type: ControlType,

    #[arg(long, default_value_t = 0.2)]
    control_strength: f64,

    /// Path or data URI of the first control image
    #[arg(long)]
    control_image: String,

    #[arg(long, default_value = "none")]
    control_type_2: ControlType,

    #[arg(long, default_value_t = 0.2)]
    control_strength_2: f64,

    /// Path or data URI of the optional second control image
    #[arg(long, default_value = "")]
    control_image_2: String,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "output.png")]
    output: PathBuf,
}

impl From<&PredictArgs> for GenerationRequest {
    fn from(args: &PredictArgs) -> Self {
        Self {
            prompt: args.prompt.clone(),
            guidance_scale: args.guidance_scale,
            steps: args.steps,
            control_type: args.control_type,
            control_strength: args.control_strength,
            control_image: args.control_image.clone(),
            control_type_2: args.control_type_2,
            control_strength_2: args.control_strength_2,
            control_image_2: args.control_image_2.clone(),
            seed: args.seed,
        }
    }
}

#[derive(Clone)]
struct AppState {
    predictor: Arc<Predictor>,
}

#[derive(Serialize)]
struct PredictionResponse {
    id: String,
    status: &'static str,
    output: String,
    seed: u64,
    width: usize,
    height: usize,
}

impl From<Prediction> for PredictionResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            id: prediction.id,
            status: "succeeded",
            output: prediction.output.display().to_string(),
            seed: prediction.seed,
            width: prediction.width,
            height: prediction.height,
        }
    }
}

/// Accepts the bare input object as well as a `{"input": {...}}` envelope.
fn parse_request(body: Value) -> Result<GenerationRequest, PredictError> {
    let input = match body {
        Value::Object(mut map) if map.contains_key("input") => {
            map.remove("input").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(input).map_err(|e| PredictError::InvalidInput(e.to_string()))
}

fn error_response(err: &PredictError) -> Response {
    let status = if err.is_client_error() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    if status.is_server_error() {
        error!(error = %err, "prediction failed");
    }
    (
        status,
        Json(json!({ "status": "failed", "error": err.to_string() })),
    )
        .into_response()
}

async fn predictions_handler(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let request = match parse_request(body) {
        Ok(request) => request,
        Err(err) => return error_response(&err),
    };
    let predictor = state.predictor.clone();
    match tokio::task::spawn_blocking(move || predictor.predict(&request)).await {
        Ok(Ok(prediction)) => Json(PredictionResponse::from(prediction)).into_response(),
        Ok(Err(err)) => error_response(&err),
        Err(join_error) => error_response(&PredictError::Generation(join_error.into())),
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "READY" }))
}

/// Request body cap. Control images arrive inline as base64 data URIs, so this
/// has to hold a few high resolution PNGs.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

fn router(predictor: Arc<Predictor>) -> Router {
    Router::new()
        .route("/predictions", post(predictions_handler))
        .route("/health-check", get(health_check))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(AppState { predictor })
}

/// Provisions the weights and loads the pipeline. Blocking; any failure is fatal.
fn load_predictor(weights: WeightsConfig, device_map: DeviceMap, output_dir: PathBuf) -> Result<Predictor> {
    let paths = provision(&weights).context("failed to provision weights")?;
    let model = FluxControlLoader::load(&paths, device_map).context("failed to load pipeline")?;
    Ok(Predictor::new(Box::new(model), output_dir))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let weights = cli.weights_config();
    let device_map = cli.device_map();

    match cli.command {
        Command::Download => {
            let paths = tokio::task::spawn_blocking(move || provision(&weights)).await??;
            info!(model = %paths.model.display(), controlnet = %paths.controlnet.display(), "weights ready");
        }
        Command::Predict(args) => {
            let request = GenerationRequest::from(&args);
            let prediction = tokio::task::spawn_blocking(move || -> Result<Prediction> {
                let output_dir = args.output.parent().map(PathBuf::from).unwrap_or_default();
                let predictor = load_predictor(weights, device_map, output_dir)?;
                Ok(predictor.predict_to(&request, &args.output)?)
            })
            .await??;
            println!("{}", prediction.output.display());
        }
        Command::Serve {
            host,
            port,
            output_dir,
        } => {
            let predictor =
                tokio::task::spawn_blocking(move || load_predictor(weights, device_map, output_dir))
                    .await??;
            info!(output_dir = %predictor.output_dir().display(), "pipeline loaded");
            let app = router(Arc::new(predictor));

            let bind_address = format!("{host}:{port}");
            let listener = TcpListener::bind(&bind_address)
                .await
                .with_context(|| format!("failed to bind {bind_address}"))?;
            info!(address = %listener.local_addr()?, "started server");
            axum::serve(listener, app.into_make_service()).await?;
        }
    }

    Ok(())
}
