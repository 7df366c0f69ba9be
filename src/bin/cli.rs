use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::EnvFilter;

use crate::management::session::{Notice, Outcome};
use crate::management::{
    HttpManagementApi, ModelKind, ServingDaemon, Session, DEFAULT_INFERENCE_URL,
    DEFAULT_MANAGEMENT_URL,
};
use crate::model_name::{ModelName, LLM_MODEL_ENV, SD_MODEL_ENV};

#[allow(dead_code)]
#[path = "../management/mod.rs"]
mod management;

#[allow(dead_code)]
#[path = "../model_name.rs"]
mod model_name;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the daemon's inference API
    #[arg(long, env, default_value = DEFAULT_INFERENCE_URL)]
    inference_url: String,

    /// Base URL of the daemon's management API
    #[arg(long, env, default_value = DEFAULT_MANAGEMENT_URL)]
    management_url: String,

    /// Configuration file handed to the daemon on start
    #[arg(long, env, default_value = "/home/model-server/config.properties")]
    ts_config: PathBuf,

    /// Serving daemon executable
    #[arg(long, env, default_value = "torchserve")]
    daemon_binary: String,

    /// Seconds to wait for the daemon to answer pings after start, waits forever when omitted
    #[arg(long, env)]
    ready_timeout: Option<u64>,

    /// Interval between readiness pings in milliseconds
    #[arg(long, env, default_value = "100")]
    poll_interval: u64,

    /// Hub id of the language model
    #[arg(long, env = LLM_MODEL_ENV)]
    llm_model: String,

    /// Hub id of the Stable Diffusion model
    #[arg(long, env = SD_MODEL_ENV)]
    sd_model: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the serving daemon and wait until it answers pings
    Start,
    /// Stop the serving daemon
    Stop,
    /// Check whether the daemon is healthy
    Ping,
    /// Register a model with its default batching parameters
    Register {
        #[arg(value_enum)]
        model: ModelKind,
    },
    /// Describe the registered models
    Status,
    /// Set the minimum number of workers of a registered model
    Scale {
        #[arg(value_enum)]
        model: ModelKind,
        workers: u32,
    },
    /// Re-register the language model with a new batch size
    SetBatchSize { batch_size: u32 },
    /// Re-register the language model with a new max batch delay in milliseconds
    SetMaxBatchDelay { max_batch_delay: u32 },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("INFO")))
        .init();

    let args = Args::parse();
    let api = HttpManagementApi::new(&args.inference_url, &args.management_url)?;
    let daemon = ServingDaemon {
        binary: args.daemon_binary,
        ts_config: args.ts_config,
    };
    let llm = ModelName::new(&args.llm_model);
    let sd = ModelName::new(&args.sd_model);
    let poll_interval = Duration::from_millis(args.poll_interval);
    let ready_timeout = args.ready_timeout.map(Duration::from_secs);

    let outcome = match args.cmd {
        Commands::Start => {
            Session::new(&llm, &sd).start_server(&api, &daemon, poll_interval, ready_timeout)?
        }
        Commands::Stop => Session::discover(&api, &llm, &sd).stop_server(&daemon)?,
        Commands::Ping => {
            let session = Session::discover(&api, &llm, &sd);
            let notice = if session.started {
                Notice::Success("Serving daemon is healthy".into())
            } else {
                Notice::Error("Serving daemon is not reachable".into())
            };
            Outcome {
                session,
                notices: vec![notice],
            }
        }
        Commands::Register { model } => {
            Session::discover(&api, &llm, &sd).register_model(&api, model)?
        }
        Commands::Status => Session::discover(&api, &llm, &sd).status(&api)?,
        Commands::Scale { model, workers } => {
            Session::discover(&api, &llm, &sd).scale_workers(&api, model, workers)?
        }
        Commands::SetBatchSize { batch_size } => {
            Session::discover(&api, &llm, &sd).set_batch_size(&api, batch_size)?
        }
        Commands::SetMaxBatchDelay { max_batch_delay } => {
            Session::discover(&api, &llm, &sd).set_max_batch_delay(&api, max_batch_delay)?
        }
    };

    for notice in &outcome.notices {
        println!("{notice}");
    }
    for (name, registered) in &outcome.session.registered {
        println!("{name}: {}", if *registered { "registered" } else { "not registered" });
    }
    if outcome
        .notices
        .iter()
        .any(|notice| matches!(notice, Notice::Error(_)))
    {
        std::process::exit(1);
    }
    Ok(())
}
