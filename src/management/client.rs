use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use reqwest::blocking::Client;
use tracing::{debug, warn};
use url::Url;

use crate::model_name::ModelName;

pub const DEFAULT_INFERENCE_URL: &str = "http://localhost:8080";
pub const DEFAULT_MANAGEMENT_URL: &str = "http://localhost:8081";
pub const DEFAULT_MODEL_VERSION: &str = "1.0";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Status and body of a management call. Non-200 answers are not errors at
/// this level; callers decide what they mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Query parameters of a model registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub model_name: String,
    /// Archive name or URL the daemon loads the model from.
    pub url: String,
    pub batch_size: u32,
    pub max_batch_delay: u32,
    pub initial_workers: u32,
    pub synchronous: bool,
}

impl Registration {
    pub fn new(model: &ModelName) -> Self {
        Self {
            model_name: model.to_string(),
            url: model.to_string(),
            batch_size: 1,
            max_batch_delay: 3000,
            initial_workers: 1,
            synchronous: true,
        }
    }

    /// Takes the batching parameters from a `describe` entry, keeping the
    /// current value for anything the entry lacks.
    pub fn apply_status(&mut self, status: &serde_json::Value) {
        let field = |key: &str| {
            status
                .get(key)
                .and_then(serde_json::Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
        };
        if let Some(batch_size) = field("batchSize") {
            self.batch_size = batch_size;
        }
        if let Some(max_batch_delay) = field("maxBatchDelay") {
            self.max_batch_delay = max_batch_delay;
        }
        if let Some(min_workers) = field("minWorkers") {
            self.initial_workers = min_workers;
        }
    }

    fn query(&self) -> [(&'static str, String); 6] {
        [
            ("model_name", self.model_name.clone()),
            ("url", self.url.clone()),
            ("batch_size", self.batch_size.to_string()),
            ("max_batch_delay", self.max_batch_delay.to_string()),
            ("initial_workers", self.initial_workers.to_string()),
            ("synchronous", self.synchronous.to_string()),
        ]
    }
}

/// The daemon's control plane.
pub trait ManagementApi {
    /// `GET /ping` on the inference port.
    fn ping(&self) -> Result<ApiResponse>;

    /// `POST /models?...`
    fn register(&self, registration: &Registration) -> Result<ApiResponse>;

    /// `GET /models/{name}`
    fn describe(&self, model_name: &str) -> Result<ApiResponse>;

    /// `PUT /models/{name}?min_worker=&synchronous=true`
    fn scale(&self, model_name: &str, min_workers: u32) -> Result<ApiResponse>;

    /// `DELETE /models/{name}/{version}`
    fn unregister(&self, model_name: &str, version: &str) -> Result<ApiResponse>;
}

pub struct HttpManagementApi {
    client: Client,
    inference_url: Url,
    management_url: Url,
}

impl HttpManagementApi {
    pub fn new(inference_url: &str, management_url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            inference_url: Url::parse(inference_url)?,
            management_url: Url::parse(management_url)?,
        })
    }

    fn url(base: &Url, segments: &[&str]) -> Result<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("{base} cannot be used as a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(crate) fn ping_url(&self) -> Result<Url> {
        Self::url(&self.inference_url, &["ping"])
    }

    pub(crate) fn register_url(&self, registration: &Registration) -> Result<Url> {
        let mut url = Self::url(&self.management_url, &["models"])?;
        url.query_pairs_mut().extend_pairs(registration.query());
        Ok(url)
    }

    pub(crate) fn model_url(&self, model_name: &str) -> Result<Url> {
        Self::url(&self.management_url, &["models", model_name])
    }

    pub(crate) fn scale_url(&self, model_name: &str, min_workers: u32) -> Result<Url> {
        let mut url = self.model_url(model_name)?;
        url.query_pairs_mut()
            .append_pair("min_worker", &min_workers.to_string())
            .append_pair("synchronous", "true");
        Ok(url)
    }

    pub(crate) fn version_url(&self, model_name: &str, version: &str) -> Result<Url> {
        Self::url(&self.management_url, &["models", model_name, version])
    }

    fn send(request: reqwest::blocking::RequestBuilder) -> Result<ApiResponse> {
        let response = request.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        debug!("Management API answered {status}: {body}");
        Ok(ApiResponse { status, body })
    }
}

impl ManagementApi for HttpManagementApi {
    fn ping(&self) -> Result<ApiResponse> {
        Self::send(self.client.get(self.ping_url()?))
    }

    fn register(&self, registration: &Registration) -> Result<ApiResponse> {
        Self::send(self.client.post(self.register_url(registration)?))
    }

    fn describe(&self, model_name: &str) -> Result<ApiResponse> {
        Self::send(self.client.get(self.model_url(model_name)?))
    }

    fn scale(&self, model_name: &str, min_workers: u32) -> Result<ApiResponse> {
        Self::send(self.client.put(self.scale_url(model_name, min_workers)?))
    }

    fn unregister(&self, model_name: &str, version: &str) -> Result<ApiResponse> {
        Self::send(self.client.delete(self.version_url(model_name, version)?))
    }
}

/// Polls `ping` with a fixed sleep until the daemon answers 200. Without a
/// timeout this waits forever.
pub fn wait_until_ready<A: ManagementApi + ?Sized>(
    api: &A,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> Result<ApiResponse> {
    let start = Instant::now();
    loop {
        match api.ping() {
            Ok(response) if response.is_ok() => return Ok(response),
            Ok(response) => warn!("Serving daemon is not healthy yet: {}", response.status),
            Err(err) => debug!("Serving daemon is not reachable yet: {err}"),
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                bail!("Serving daemon did not become ready within {timeout:?}");
            }
        }
        sleep(poll_interval);
    }
}
