use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde_json::Value;
use tracing::{info, warn};

use super::client::{wait_until_ready, ManagementApi, Registration, DEFAULT_MODEL_VERSION};
use crate::model_name::ModelName;

pub const BATCH_SIZES: [u32; 8] = [1, 2, 4, 8, 16, 32, 64, 128];
pub const MIN_BATCH_DELAY_MS: u32 = 3000;
pub const MAX_BATCH_DELAY_MS: u32 = 10000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Success(String),
    Caption(String),
    Error(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Success(msg) => write!(f, "[ok] {msg}"),
            Notice::Caption(msg) => write!(f, "{msg}"),
            Notice::Error(msg) => write!(f, "[error] {msg}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelKind {
    Llm,
    Sd,
}

/// Starts and stops the serving daemon.
pub trait DaemonControl {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

pub struct ServingDaemon {
    pub binary: String,
    pub ts_config: PathBuf,
}

impl DaemonControl for ServingDaemon {
    fn start(&self) -> Result<()> {
        let status = Command::new(&self.binary)
            .arg("--start")
            .arg("--ts-config")
            .arg(&self.ts_config)
            .status()
            .with_context(|| format!("Failed to run {}", self.binary))?;
        if !status.success() {
            bail!("{} --start exited with {status}", self.binary);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let status = Command::new(&self.binary)
            .arg("--stop")
            .status()
            .with_context(|| format!("Failed to run {}", self.binary))?;
        if !status.success() {
            warn!("{} --stop exited with {status}", self.binary);
        }
        Ok(())
    }
}

/// What the operator knows about the daemon between actions.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub started: bool,
    pub stopped: bool,
    pub registered: BTreeMap<String, bool>,
    pub llm: Registration,
    pub sd: Registration,
}

/// Session after an action, with the messages to show the operator.
#[derive(Debug)]
pub struct Outcome {
    pub session: Session,
    pub notices: Vec<Notice>,
}

impl Session {
    pub fn new(llm: &ModelName, sd: &ModelName) -> Self {
        let mut session = Self {
            started: false,
            stopped: false,
            registered: BTreeMap::new(),
            llm: Registration::new(llm),
            sd: Registration::new(sd),
        };
        session.reset_registrations();
        session
    }

    /// Rebuilds the session from a daemon that may already be running. A
    /// model counts as registered when the daemon can describe it, and its
    /// batching parameters are taken from that description.
    pub fn discover<A: ManagementApi + ?Sized>(api: &A, llm: &ModelName, sd: &ModelName) -> Self {
        let mut session = Self::new(llm, sd);
        if !matches!(api.ping(), Ok(response) if response.is_ok()) {
            return session;
        }
        session.started = true;
        for kind in [ModelKind::Llm, ModelKind::Sd] {
            let name = session.registration(kind).model_name.clone();
            let described = match api.describe(&name) {
                Ok(response) if response.is_ok() => response.body,
                _ => continue,
            };
            session.set_registered(kind, true);
            if let Ok(status) = serde_json::from_str::<Value>(&described) {
                let registration = match kind {
                    ModelKind::Llm => &mut session.llm,
                    ModelKind::Sd => &mut session.sd,
                };
                registration.apply_status(&status[0]);
            }
        }
        session
    }

    pub fn registration(&self, kind: ModelKind) -> &Registration {
        match kind {
            ModelKind::Llm => &self.llm,
            ModelKind::Sd => &self.sd,
        }
    }

    pub fn is_registered(&self, kind: ModelKind) -> bool {
        let name = &self.registration(kind).model_name;
        self.registered.get(name).copied().unwrap_or(false)
    }

    fn set_registered(&mut self, kind: ModelKind, registered: bool) {
        let name = self.registration(kind).model_name.clone();
        self.registered.insert(name, registered);
    }

    fn reset_registrations(&mut self) {
        self.registered = BTreeMap::from([
            (self.llm.model_name.clone(), false),
            (self.sd.model_name.clone(), false),
        ]);
    }

    fn done(self, notices: Vec<Notice>) -> Outcome {
        Outcome {
            session: self,
            notices,
        }
    }

    pub fn start_server<A, D>(
        mut self,
        api: &A,
        daemon: &D,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<Outcome>
    where
        A: ManagementApi + ?Sized,
        D: DaemonControl + ?Sized,
    {
        daemon.start()?;
        wait_until_ready(api, poll_interval, timeout)?;
        info!("Serving daemon is up");

        self.started = true;
        self.stopped = false;
        self.reset_registrations();
        Ok(self.done(vec![Notice::Success("Serving daemon started".into())]))
    }

    pub fn stop_server<D: DaemonControl + ?Sized>(mut self, daemon: &D) -> Result<Outcome> {
        daemon.stop()?;
        self.started = false;
        self.stopped = true;
        self.reset_registrations();
        Ok(self.done(vec![Notice::Success("Serving daemon stopped".into())]))
    }

    pub fn register_model<A: ManagementApi + ?Sized>(
        self,
        api: &A,
        kind: ModelKind,
    ) -> Result<Outcome> {
        if !self.started {
            return Ok(self.done(vec![Notice::Caption(
                "Serving daemon is not running. Start it".into(),
            )]));
        }
        let registration = self.registration(kind).clone();
        let mut notices = Vec::new();
        let session = self.register(api, kind, &registration, &mut notices)?;
        Ok(session.done(notices))
    }

    fn register<A: ManagementApi + ?Sized>(
        mut self,
        api: &A,
        kind: ModelKind,
        registration: &Registration,
        notices: &mut Vec<Notice>,
    ) -> Result<Self> {
        let response = api.register(registration)?;
        if !response.is_ok() {
            warn!(
                "Registering {} failed with {}: {}",
                registration.model_name, response.status, response.body
            );
            notices.push(Notice::Error("Error registering model".into()));
            self.started = true;
            return Ok(self);
        }

        info!("Registered {}", registration.model_name);
        self.set_registered(kind, true);
        self.stopped = false;
        match kind {
            ModelKind::Llm => self.llm = registration.clone(),
            ModelKind::Sd => self.sd = registration.clone(),
        }
        notices.push(Notice::Caption(response.body));
        notices.push(Notice::Success(format!(
            "Registered {}",
            registration.model_name
        )));
        Ok(self)
    }

    /// Describes every registered model. Stops at the first model the daemon
    /// fails to describe.
    pub fn status<A: ManagementApi + ?Sized>(self, api: &A) -> Result<Outcome> {
        let mut notices = Vec::new();
        for kind in [ModelKind::Llm, ModelKind::Sd] {
            let name = &self.registration(kind).model_name;
            if !self.is_registered(kind) {
                info!("{name} is not registered");
                continue;
            }
            let response = api.describe(name)?;
            if !response.is_ok() {
                notices.push(Notice::Error(format!(
                    "Error getting model status for {name}"
                )));
                break;
            }
            let described: Value = serde_json::from_str(&response.body)
                .with_context(|| format!("Malformed status for {name}"))?;
            let status = described.get(0).cloned().unwrap_or(described);
            notices.push(Notice::Caption(serde_json::to_string_pretty(&status)?));
        }
        Ok(self.done(notices))
    }

    pub fn scale_workers<A: ManagementApi + ?Sized>(
        self,
        api: &A,
        kind: ModelKind,
        workers: u32,
    ) -> Result<Outcome> {
        if !self.is_registered(kind) {
            let name = self.registration(kind).model_name.clone();
            return Ok(self.done(vec![Notice::Caption(format!("{name} is not registered"))]));
        }
        let response = api.scale(&self.registration(kind).model_name, workers)?;
        let notice = if response.is_ok() {
            Notice::Caption(response.body)
        } else {
            Notice::Error(format!("Error scaling workers: {}", response.body))
        };
        Ok(self.done(vec![notice]))
    }

    pub fn set_batch_size<A: ManagementApi + ?Sized>(
        self,
        api: &A,
        batch_size: u32,
    ) -> Result<Outcome> {
        if !BATCH_SIZES.contains(&batch_size) {
            bail!("Batch size must be one of {BATCH_SIZES:?}, got {batch_size}");
        }
        let registration = Registration {
            batch_size,
            ..self.llm.clone()
        };
        self.reregister_llm(api, registration)
    }

    pub fn set_max_batch_delay<A: ManagementApi + ?Sized>(
        self,
        api: &A,
        max_batch_delay: u32,
    ) -> Result<Outcome> {
        if !(MIN_BATCH_DELAY_MS..=MAX_BATCH_DELAY_MS).contains(&max_batch_delay) {
            bail!(
                "Max batch delay must be within {MIN_BATCH_DELAY_MS}..={MAX_BATCH_DELAY_MS} ms, got {max_batch_delay}"
            );
        }
        let registration = Registration {
            max_batch_delay,
            ..self.llm.clone()
        };
        self.reregister_llm(api, registration)
    }

    /// Batching parameters are fixed at registration time, so the LLM is
    /// unregistered and registered again with every stored parameter.
    fn reregister_llm<A: ManagementApi + ?Sized>(
        mut self,
        api: &A,
        registration: Registration,
    ) -> Result<Outcome> {
        if !self.is_registered(ModelKind::Llm) {
            let name = self.llm.model_name.clone();
            return Ok(self.done(vec![Notice::Caption(format!("{name} is not registered"))]));
        }

        let mut notices = Vec::new();
        let response = api.unregister(&self.llm.model_name, DEFAULT_MODEL_VERSION)?;
        info!("Unregistering {}", self.llm.model_name);
        notices.push(Notice::Caption(response.body));
        self.set_registered(ModelKind::Llm, false);

        let session = self.register(api, ModelKind::Llm, &registration, &mut notices)?;
        Ok(session.done(notices))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use anyhow::anyhow;

    use super::*;
    use crate::management::client::ApiResponse;

    const LLM: &str = "meta-llama/Llama-3.2-3B-Instruct";
    const SD: &str = "stabilityai/stable-diffusion-xl-base-1.0";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Ping,
        Register(Registration),
        Describe(String),
        Scale(String, u32),
        Unregister(String, String),
    }

    struct FakeDaemon {
        calls: RefCell<Vec<Call>>,
        register_status: Cell<u16>,
        describe_body: String,
    }

    impl FakeDaemon {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                register_status: Cell::new(200),
                describe_body: r#"[{"modelName": "m", "workers": []}]"#.into(),
            }
        }

        fn answer(&self, call: Call, status: u16, body: &str) -> Result<ApiResponse> {
            self.calls.borrow_mut().push(call);
            Ok(ApiResponse {
                status,
                body: body.into(),
            })
        }
    }

    impl ManagementApi for FakeDaemon {
        fn ping(&self) -> Result<ApiResponse> {
            self.answer(Call::Ping, 200, r#"{"status": "Healthy"}"#)
        }

        fn register(&self, registration: &Registration) -> Result<ApiResponse> {
            let status = self.register_status.get();
            self.answer(Call::Register(registration.clone()), status, "registered")
        }

        fn describe(&self, model_name: &str) -> Result<ApiResponse> {
            let body = self.describe_body.clone();
            self.answer(Call::Describe(model_name.into()), 200, &body)
        }

        fn scale(&self, model_name: &str, min_workers: u32) -> Result<ApiResponse> {
            self.answer(Call::Scale(model_name.into(), min_workers), 200, "scaled")
        }

        fn unregister(&self, model_name: &str, version: &str) -> Result<ApiResponse> {
            self.answer(
                Call::Unregister(model_name.into(), version.into()),
                200,
                "unregistered",
            )
        }
    }

    #[derive(Default)]
    struct FakeControl {
        starts: Cell<u32>,
        stops: Cell<u32>,
        fail_start: bool,
    }

    impl DaemonControl for FakeControl {
        fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(anyhow!("torchserve not found"));
            }
            self.starts.set(self.starts.get() + 1);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.stops.set(self.stops.get() + 1);
            Ok(())
        }
    }

    fn session() -> Session {
        Session::new(&ModelName::new(LLM), &ModelName::new(SD))
    }

    fn started(api: &FakeDaemon) -> Session {
        session()
            .start_server(api, &FakeControl::default(), Duration::from_millis(1), None)
            .unwrap()
            .session
    }

    fn registered_llm(api: &FakeDaemon) -> Session {
        started(api).register_model(api, ModelKind::Llm).unwrap().session
    }

    #[test]
    fn new_session_has_nothing_registered() {
        let session = session();
        assert!(!session.started);
        assert_eq!(session.registered.len(), 2);
        assert!(!session.is_registered(ModelKind::Llm));
        assert!(!session.is_registered(ModelKind::Sd));
        assert_eq!(session.llm.model_name, "meta-llama---Llama-3.2-3B-Instruct");
    }

    #[test]
    fn start_waits_for_ping_and_resets_registrations() {
        let api = FakeDaemon::new();
        let control = FakeControl::default();
        let mut session = session();
        session.registered.insert(session.llm.model_name.clone(), true);

        let outcome = session
            .start_server(&api, &control, Duration::from_millis(1), None)
            .unwrap();
        assert_eq!(control.starts.get(), 1);
        assert_eq!(api.calls.borrow().as_slice(), &[Call::Ping]);
        assert!(outcome.session.started);
        assert!(!outcome.session.stopped);
        assert!(!outcome.session.is_registered(ModelKind::Llm));
    }

    #[test]
    fn start_failure_is_an_error() {
        let api = FakeDaemon::new();
        let control = FakeControl {
            fail_start: true,
            ..Default::default()
        };
        assert!(session()
            .start_server(&api, &control, Duration::from_millis(1), None)
            .is_err());
        assert!(api.calls.borrow().is_empty());
    }

    #[test]
    fn stop_clears_state() {
        let api = FakeDaemon::new();
        let control = FakeControl::default();
        let outcome = registered_llm(&api).stop_server(&control).unwrap();
        assert_eq!(control.stops.get(), 1);
        assert!(outcome.session.stopped);
        assert!(!outcome.session.started);
        assert!(!outcome.session.is_registered(ModelKind::Llm));
    }

    #[test]
    fn register_requires_running_daemon() {
        let api = FakeDaemon::new();
        let outcome = session().register_model(&api, ModelKind::Sd).unwrap();
        assert_eq!(
            outcome.notices,
            vec![Notice::Caption("Serving daemon is not running. Start it".into())]
        );
        assert!(api.calls.borrow().is_empty());
    }

    #[test]
    fn register_marks_model_registered() {
        let api = FakeDaemon::new();
        let outcome = started(&api).register_model(&api, ModelKind::Sd).unwrap();
        assert!(outcome.session.is_registered(ModelKind::Sd));
        assert!(!outcome.session.is_registered(ModelKind::Llm));
        assert_eq!(outcome.notices[0], Notice::Caption("registered".into()));
        assert!(matches!(outcome.notices[1], Notice::Success(_)));
    }

    #[test]
    fn failed_register_leaves_model_unregistered() {
        let api = FakeDaemon::new();
        let session = started(&api);
        api.register_status.set(500);

        let outcome = session.register_model(&api, ModelKind::Llm).unwrap();
        assert!(!outcome.session.is_registered(ModelKind::Llm));
        assert!(outcome.session.started);
        assert_eq!(
            outcome.notices,
            vec![Notice::Error("Error registering model".into())]
        );
    }

    #[test]
    fn status_describes_registered_models_only() {
        let api = FakeDaemon::new();
        let session = registered_llm(&api);
        api.calls.borrow_mut().clear();

        let outcome = session.status(&api).unwrap();
        assert_eq!(
            api.calls.borrow().as_slice(),
            &[Call::Describe("meta-llama---Llama-3.2-3B-Instruct".into())]
        );
        match &outcome.notices[..] {
            [Notice::Caption(status)] => assert!(status.contains("\"modelName\": \"m\"")),
            other => panic!("unexpected notices {other:?}"),
        }
    }

    #[test]
    fn scale_requires_registration() {
        let api = FakeDaemon::new();
        let outcome = started(&api).scale_workers(&api, ModelKind::Llm, 4).unwrap();
        assert!(matches!(outcome.notices[..], [Notice::Caption(_)]));
        assert!(!api
            .calls
            .borrow()
            .iter()
            .any(|call| matches!(call, Call::Scale(..))));

        let outcome = registered_llm(&api).scale_workers(&api, ModelKind::Llm, 4).unwrap();
        assert_eq!(outcome.notices, vec![Notice::Caption("scaled".into())]);
        assert_eq!(
            api.calls.borrow().last(),
            Some(&Call::Scale("meta-llama---Llama-3.2-3B-Instruct".into(), 4))
        );
    }

    #[test]
    fn batch_size_reregisters_with_full_registration() {
        let api = FakeDaemon::new();
        let session = registered_llm(&api)
            .set_max_batch_delay(&api, 5000)
            .unwrap()
            .session;
        api.calls.borrow_mut().clear();

        let outcome = session.set_batch_size(&api, 8).unwrap();
        let calls = api.calls.borrow();
        assert_eq!(
            calls[0],
            Call::Unregister("meta-llama---Llama-3.2-3B-Instruct".into(), "1.0".into())
        );
        let Call::Register(registration) = &calls[1] else {
            panic!("expected a registration, got {:?}", calls[1]);
        };
        assert_eq!(registration.batch_size, 8);
        assert_eq!(registration.max_batch_delay, 5000);
        assert_eq!(registration.initial_workers, 1);
        assert_eq!(registration.url, "meta-llama---Llama-3.2-3B-Instruct");
        assert!(outcome.session.is_registered(ModelKind::Llm));
        assert_eq!(outcome.session.llm.batch_size, 8);
    }

    #[test]
    fn batch_settings_are_validated() {
        let api = FakeDaemon::new();
        let session = registered_llm(&api);
        assert!(session.clone().set_batch_size(&api, 3).is_err());
        assert!(session.clone().set_batch_size(&api, 256).is_err());
        assert!(session.clone().set_max_batch_delay(&api, 2999).is_err());
        assert!(session.set_max_batch_delay(&api, 10001).is_err());
    }

    #[test]
    fn failed_reregistration_leaves_llm_unregistered() {
        let api = FakeDaemon::new();
        let session = registered_llm(&api);
        api.register_status.set(400);

        let outcome = session.set_batch_size(&api, 4).unwrap();
        assert!(!outcome.session.is_registered(ModelKind::Llm));
        assert_eq!(outcome.session.llm.batch_size, 1);
        assert!(outcome
            .notices
            .contains(&Notice::Error("Error registering model".into())));
    }

    #[test]
    fn discover_reads_running_daemon() {
        let api = FakeDaemon {
            describe_body: r#"[{"modelName": "m", "batchSize": 16, "maxBatchDelay": 4000, "minWorkers": 2}]"#.into(),
            ..FakeDaemon::new()
        };
        let session = Session::discover(&api, &ModelName::new(LLM), &ModelName::new(SD));
        assert!(session.started);
        assert!(session.is_registered(ModelKind::Llm));
        assert!(session.is_registered(ModelKind::Sd));
        assert_eq!(session.llm.batch_size, 16);
        assert_eq!(session.llm.max_batch_delay, 4000);
        assert_eq!(session.sd.initial_workers, 2);
    }
}
