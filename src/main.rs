use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use clap_serde_derive::ClapSerde;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{Config, HostedModel};
use crate::error::ServingResult;
use crate::handler::{Context, Handler, HandlerService, Predictor, RequestItem, SystemProperties};
use crate::inference::models::llm::LlmHandler;
use crate::inference::models::stable_diffusion::ImageHandler;
use crate::model_name::{ModelName, LLM_MODEL_ENV, SD_MODEL_ENV};

mod config;
mod error;
mod handler;
mod inference;
mod model_name;
mod telemetry;

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = "ServingHost.toml")]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

type SharedPredictor = Arc<Mutex<Box<dyn Predictor>>>;

#[derive(Clone)]
struct AppState {
    predictors: Arc<HashMap<String, SharedPredictor>>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == "ServingHost.toml" {
                Config::default().merge(args.opt_config)
            } else {
                eprintln!(
                    "Failed to read configuration file {} with error: {}",
                    args.config_file, err
                );
                std::process::exit(1);
            }
        }
    };
    telemetry::init_telemetry(config.otlp_endpoint(), true)?;

    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let mut predictors: HashMap<String, SharedPredictor> = HashMap::new();
    for model in config.hosted_models()? {
        let (aliases, predictor) = match load_model(&config, model).await {
            Ok(loaded) => loaded,
            Err(err) => exit_err!(1, "Failed to initialize {:?} handler: {:#}", model, err),
        };
        let predictor = Arc::new(Mutex::new(predictor));
        for alias in aliases {
            predictors.insert(alias, predictor.clone());
        }
    }
    let state = AppState {
        predictors: Arc::new(predictors),
    };

    let router = Router::new()
        .route("/ping", get(handle_ping))
        .route("/predictions/:model", post(handle_prediction))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Builds and initializes one handler off the async runtime. Returns the
/// names it is reachable under.
async fn load_model(config: &Config, model: HostedModel) -> Result<(Vec<String>, Box<dyn Predictor>)> {
    match model {
        HostedModel::Llm => {
            let name = ModelName::from_env(LLM_MODEL_ENV)?;
            let model_dir = std::path::Path::new(&config.llm_model_config)
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default();
            let system_properties = SystemProperties::new(model_dir).with_gpu_id(config.gpu_id);
            let ctx = with_descriptor_batch_size(Context::load(&config.llm_model_config, system_properties)?);
            let predictor = initialize(name.to_string(), LlmHandler::new(), ctx).await?;
            Ok((aliases("llm", &name), predictor))
        }
        HostedModel::StableDiffusion => {
            let name = ModelName::from_env(SD_MODEL_ENV)?;
            let system_properties = SystemProperties::new(PathBuf::from(&config.sd_model_dir))
                .with_gpu_id(config.gpu_id);
            let ctx = with_descriptor_batch_size(Context::load(&config.sd_model_config, system_properties)?);
            let predictor = initialize(name.to_string(), ImageHandler::new(), ctx).await?;
            Ok((aliases("sd", &name), predictor))
        }
    }
}

/// The descriptor's `batchSize` is what the daemon would batch requests by.
fn with_descriptor_batch_size<S>(mut ctx: Context<S>) -> Context<S> {
    if let Some(batch_size) = ctx.model_config.batch_size {
        ctx.system_properties = ctx.system_properties.with_batch_size(batch_size as usize);
    }
    ctx
}

async fn initialize<H>(name: String, handler: H, ctx: Context<H::Settings>) -> Result<Box<dyn Predictor>>
where
    H: Handler + Send + 'static,
    H::Settings: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut service = HandlerService::new(name, handler);
        service.initialize(&ctx)?;
        Ok::<_, anyhow::Error>(Box::new(service) as Box<dyn Predictor>)
    })
    .await?
}

fn aliases(kind: &str, name: &ModelName) -> Vec<String> {
    vec![kind.to_string(), name.to_string(), name.short().to_string()]
}

// TODO set timeout for shutdown signal
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[axum_macros::debug_handler]
async fn handle_ping() -> Json<Value> {
    Json(json!({ "status": "Healthy" }))
}

#[axum_macros::debug_handler]
async fn handle_prediction(
    State(state): State<AppState>,
    Path(model): Path<String>,
    body: Bytes,
) -> ServingResult<(StatusCode, Json<Value>)> {
    let Some(predictor) = state.predictors.get(&model).cloned() else {
        bail_serving!(StatusCode::NOT_FOUND, "Model {} not found", model)
    };

    let requests = vec![RequestItem::from_body(body.to_vec())];
    let response = tokio::task::spawn_blocking(move || {
        let mut predictor = predictor
            .lock()
            .map_err(|_| anyhow!("Handler lock poisoned by an earlier request"))?;
        predictor.predict(&requests)
    })
    .await??;

    Ok((StatusCode::OK, Json(response)))
}
