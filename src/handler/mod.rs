use std::fmt::{Debug, Display};
use std::time::Instant;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

pub use crate::handler::context::{Context, DeviceType, ModelConfig, Pt2Config, SystemProperties};
pub use crate::handler::request::{single_request, Payload, RequestItem, SUPPORTED_BATCH_SIZE};

pub mod context;
pub mod request;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("batch size {actual} is not supported, handler requires batch size {expected}")]
    BatchSize { expected: usize, actual: usize },

    #[error("handler is not ready to serve requests (state: {0})")]
    NotReady(HandlerState),

    #[error("handler has already been initialized")]
    AlreadyInitialized,

    #[error("handler failed to initialize and cannot be initialized again")]
    InitializationFailed,

    #[error("invalid request payload: {0}")]
    InvalidPayload(String),

    #[error("invalid request parameter: {0}")]
    InvalidParameter(String),
}

/// Lifecycle position of a handler. There is no way back to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

impl Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerState::Uninitialized => write!(f, "uninitialized"),
            HandlerState::Initializing => write!(f, "initializing"),
            HandlerState::Ready => write!(f, "ready"),
            HandlerState::Failed => write!(f, "failed"),
        }
    }
}

/// The contract a model adapter implements so the serving daemon can drive it:
/// `initialize` once, then `preprocess -> inference -> postprocess` per batch.
///
/// Implementations hold their loaded model between calls and are never called
/// concurrently; callers wrap them in a [`HandlerService`] which enforces the
/// lifecycle.
pub trait Handler {
    /// The `[handler]` section of the model's deployment descriptor.
    type Settings: DeserializeOwned + Debug;
    /// What `preprocess` hands to `inference`.
    type Input;
    /// Raw model output handed to `postprocess`.
    type Output;
    /// Transport-safe result returned to the daemon.
    type Response: Serialize;

    fn initialize(&mut self, ctx: &Context<Self::Settings>) -> Result<()>;

    fn preprocess(&mut self, requests: &[RequestItem]) -> Result<Self::Input>;

    fn inference(&mut self, input: Self::Input) -> Result<Self::Output>;

    fn postprocess(&mut self, output: Self::Output) -> Result<Self::Response>;
}

/// Owns a handler and only lets requests through once initialization succeeded.
pub struct HandlerService<H: Handler> {
    name: String,
    handler: H,
    state: HandlerState,
}

impl<H: Handler> HandlerService<H> {
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            handler,
            state: HandlerState::Uninitialized,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    #[tracing::instrument(level = "info", skip(self, ctx), fields(model = %self.name))]
    pub fn initialize(&mut self, ctx: &Context<H::Settings>) -> Result<()> {
        match self.state {
            HandlerState::Uninitialized => {}
            HandlerState::Failed => return Err(HandlerError::InitializationFailed.into()),
            _ => return Err(HandlerError::AlreadyInitialized.into()),
        }

        let batch_size = ctx.system_properties.batch_size;
        if batch_size != SUPPORTED_BATCH_SIZE {
            self.state = HandlerState::Failed;
            error!("Handler {} cannot run with batch size {batch_size}", self.name);
            return Err(HandlerError::BatchSize {
                expected: SUPPORTED_BATCH_SIZE,
                actual: batch_size,
            }
            .into());
        }

        self.state = HandlerState::Initializing;
        let start = Instant::now();
        match self.handler.initialize(ctx) {
            Ok(()) => {
                self.state = HandlerState::Ready;
                info!(
                    "Handler {} ready after {:.02} seconds",
                    self.name,
                    start.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(err) => {
                self.state = HandlerState::Failed;
                error!("Handler {} failed to initialize: {err:#}", self.name);
                Err(err)
            }
        }
    }

    /// Runs one batch through the three request steps.
    pub fn handle(&mut self, requests: &[RequestItem]) -> Result<H::Response> {
        if self.state != HandlerState::Ready {
            return Err(HandlerError::NotReady(self.state).into());
        }

        let handler = &mut self.handler;
        let input = timed(&self.name, "preprocess", || handler.preprocess(requests))?;
        let output = timed(&self.name, "inference", || handler.inference(input))?;
        timed(&self.name, "postprocess", || handler.postprocess(output))
    }

    #[cfg(test)]
    pub(crate) fn handler(&self) -> &H {
        &self.handler
    }

    /// A service around a handler whose model was set up by the test itself.
    #[cfg(test)]
    pub(crate) fn ready(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            handler,
            state: HandlerState::Ready,
        }
    }
}

fn timed<T>(model: &str, step: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let start = Instant::now();
    let result = f();
    info!(
        model,
        step,
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "{step} finished"
    );
    result
}

/// Type-erased entry point used by the host, which serves handlers with
/// different response types side by side.
pub trait Predictor: Send {
    fn name(&self) -> &str;

    fn state(&self) -> HandlerState;

    fn predict(&mut self, requests: &[RequestItem]) -> Result<serde_json::Value>;
}

impl<H> Predictor for HandlerService<H>
where
    H: Handler + Send,
{
    fn name(&self) -> &str {
        HandlerService::name(self)
    }

    fn state(&self) -> HandlerState {
        HandlerService::state(self)
    }

    fn predict(&mut self, requests: &[RequestItem]) -> Result<serde_json::Value> {
        let response = self.handle(requests)?;
        Ok(serde_json::to_value(response)?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::bail;
    use serde::Deserialize;

    use super::*;

    #[derive(Deserialize, Debug)]
    struct EchoSettings {
        #[serde(default)]
        fail: bool,
    }

    #[derive(Default)]
    struct EchoHandler {
        loads: usize,
    }

    impl Handler for EchoHandler {
        type Settings = EchoSettings;
        type Input = serde_json::Value;
        type Output = serde_json::Value;
        type Response = Vec<serde_json::Value>;

        fn initialize(&mut self, ctx: &Context<EchoSettings>) -> Result<()> {
            self.loads += 1;
            if ctx.model_config.handler.fail {
                bail!("weights not found");
            }
            Ok(())
        }

        fn preprocess(&mut self, requests: &[RequestItem]) -> Result<serde_json::Value> {
            Ok(single_request(requests)?.decode()?)
        }

        fn inference(&mut self, input: serde_json::Value) -> Result<serde_json::Value> {
            Ok(input)
        }

        fn postprocess(&mut self, output: serde_json::Value) -> Result<Vec<serde_json::Value>> {
            Ok(vec![output])
        }
    }

    fn context(fail: bool) -> Context<EchoSettings> {
        let config = format!("[handler]\nfail = {fail}\n");
        Context {
            model_config: ModelConfig::from_toml_str(&config).unwrap(),
            system_properties: SystemProperties::new(PathBuf::from(".")),
        }
    }

    #[test]
    fn serves_after_initialization() {
        let mut service = HandlerService::new("echo", EchoHandler::default());
        service.initialize(&context(false)).unwrap();
        assert_eq!(service.state(), HandlerState::Ready);

        let requests = [RequestItem::from_body(br#"{"prompt": "a cat"}"#.to_vec())];
        let response = service.handle(&requests).unwrap();
        assert_eq!(response, vec![serde_json::json!({"prompt": "a cat"})]);
    }

    #[test]
    fn rejects_requests_before_initialization() {
        let mut service = HandlerService::new("echo", EchoHandler::default());
        let requests = [RequestItem::from_body(b"{}".to_vec())];
        let err = service.handle(&requests).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandlerError>(),
            Some(HandlerError::NotReady(HandlerState::Uninitialized))
        ));
    }

    #[test]
    fn second_initialization_does_not_reload() {
        let mut service = HandlerService::new("echo", EchoHandler::default());
        service.initialize(&context(false)).unwrap();
        let err = service.initialize(&context(false)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandlerError>(),
            Some(HandlerError::AlreadyInitialized)
        ));
        assert_eq!(service.handler().loads, 1);
        assert_eq!(service.state(), HandlerState::Ready);
    }

    #[test]
    fn failed_initialization_never_serves() {
        let mut service = HandlerService::new("echo", EchoHandler::default());
        assert!(service.initialize(&context(true)).is_err());
        assert_eq!(service.state(), HandlerState::Failed);

        let err = service.initialize(&context(false)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandlerError>(),
            Some(HandlerError::InitializationFailed)
        ));
        assert_eq!(service.handler().loads, 1);

        let requests = [RequestItem::from_body(b"{}".to_vec())];
        assert!(service.handle(&requests).is_err());
    }

    #[test]
    fn rejects_daemon_batch_size_above_one() {
        let mut service = HandlerService::new("echo", EchoHandler::default());
        let mut ctx = context(false);
        ctx.system_properties = ctx.system_properties.with_batch_size(4);

        let err = service.initialize(&ctx).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandlerError>(),
            Some(HandlerError::BatchSize {
                expected: 1,
                actual: 4
            })
        ));
        assert_eq!(service.state(), HandlerState::Failed);
        assert_eq!(service.handler().loads, 0);
    }

    #[test]
    fn rejects_multi_request_batches() {
        let mut service = HandlerService::new("echo", EchoHandler::default());
        service.initialize(&context(false)).unwrap();
        let requests = [
            RequestItem::from_body(b"{}".to_vec()),
            RequestItem::from_body(b"{}".to_vec()),
        ];
        let err = service.handle(&requests).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HandlerError>(),
            Some(HandlerError::BatchSize {
                expected: 1,
                actual: 2
            })
        ));
    }

    #[test]
    fn predictor_serializes_responses() {
        let mut service = HandlerService::new("echo", EchoHandler::default());
        service.initialize(&context(false)).unwrap();
        let predictor: &mut dyn Predictor = &mut service;
        let requests = [RequestItem::from_json(serde_json::json!({"n": 1}))];
        let value = predictor.predict(&requests).unwrap();
        assert_eq!(value, serde_json::json!([{"n": 1}]));
    }
}
