//! Public entry point of the master side.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::DcConfig;
use crate::driver::{build_driver, BackendDriver, Capabilities};
use crate::error::DcError;
use crate::logging::{self, LogLevel};
use crate::poller::{MasterEvent, Poller};
use crate::registry::Registry;
use crate::stager::UrlFetcher;
use crate::workunit::{
    validate_identifier, CorrelationId, TransferMode, WorkUnit, WuResult, WuState,
};

/// One master process: configuration, the WU registry and the poller.
pub struct Master {
    app_name: String,
    config: DcConfig,
    registry: Registry,
    poller: Poller,
}

impl Master {
    /// Load and validate the configuration, set up logging and build the
    /// configured backend.
    ///
    /// `config_path` defaults to `dcapi.toml` in the current directory.
    pub fn init(
        project_name: &str,
        app_name: &str,
        config_path: Option<&Path>,
    ) -> Result<Self, DcError> {
        logging::init("info");
        let config = DcConfig::load(config_path)?;
        config.validate()?;
        let driver = build_driver(&config, app_name)?;
        Self::with_driver(project_name, app_name, config, driver)
    }

    /// Build a master around an already constructed driver.
    pub fn with_driver(
        project_name: &str,
        app_name: &str,
        config: DcConfig,
        driver: Arc<dyn BackendDriver>,
    ) -> Result<Self, DcError> {
        validate_identifier("project name", project_name).map_err(DcError::Config)?;
        if app_name.trim().is_empty() {
            return Err(DcError::Config("application name must be non-empty".into()));
        }
        config.validate()?;

        let work_root = config.work_root()?.to_path_buf();
        std::fs::create_dir_all(&work_root).map_err(|e| {
            DcError::Config(format!("cannot create work_dir {}: {e}", work_root.display()))
        })?;

        info!(
            project = project_name,
            app = app_name,
            backend = %driver.kind(),
            work_dir = %work_root.display(),
            "master initialized"
        );
        let registry = Registry::new(project_name, work_root, driver, &config);
        let poller = Poller::new(&config);
        Ok(Self {
            app_name: app_name.to_string(),
            config,
            registry,
            poller,
        })
    }

    pub fn with_url_fetcher(mut self, fetcher: Arc<dyn UrlFetcher>) -> Self {
        self.registry = self.registry.with_url_fetcher(fetcher);
        self
    }

    pub fn project_name(&self) -> &str {
        self.registry.project()
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn config(&self) -> &DcConfig {
        &self.config
    }

    /// Opaque lookup of a configuration key the typed config does not know.
    pub fn config_value(&self, key: &str) -> Option<String> {
        self.config.get_str(key)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn capabilities(&self) -> Capabilities {
        self.registry.capabilities()
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        logging::log(level, message);
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.poller.cancel_token()
    }

    pub fn create(
        &mut self,
        client: &str,
        args: &[String],
        subresult_budget: u32,
        tag: Option<&str>,
    ) -> Result<String, DcError> {
        self.registry.create(client, args, subresult_budget, tag)
    }

    pub fn add_input(
        &mut self,
        wu: &str,
        logical_name: &str,
        source: &str,
        mode: TransferMode,
    ) -> Result<(), DcError> {
        self.registry.add_input(wu, logical_name, source, mode)
    }

    pub fn add_output(&mut self, wu: &str, logical_name: &str) -> Result<(), DcError> {
        self.registry.add_output(wu, logical_name)
    }

    pub fn set_priority(&mut self, wu: &str, priority: i32) -> Result<(), DcError> {
        self.registry.set_priority(wu, priority)
    }

    pub fn submit(&mut self, wu: &str) -> Result<(), DcError> {
        self.registry.submit(wu)
    }

    pub fn cancel(&mut self, wu: &str) -> Result<(), DcError> {
        self.registry.cancel(wu)
    }

    pub fn suspend(&mut self, wu: &str) -> Result<(), DcError> {
        self.registry.suspend(wu)
    }

    pub fn resume(&mut self, wu: &str) -> Result<(), DcError> {
        self.registry.resume(wu)
    }

    pub fn destroy(&mut self, wu: &str) -> Result<(), DcError> {
        self.registry.destroy(wu)
    }

    pub fn get(&self, wu: &str) -> Result<&WorkUnit, DcError> {
        self.registry.get(wu)
    }

    pub fn state(&self, wu: &str) -> Result<WuState, DcError> {
        self.registry.state(wu)
    }

    pub fn count(&self, state: WuState) -> usize {
        self.registry.count(state)
    }

    pub fn tag(&self, wu: &str) -> Result<Option<&str>, DcError> {
        self.registry.tag(wu)
    }

    pub fn correlation_id(&self, wu: &str) -> Result<Option<&CorrelationId>, DcError> {
        self.registry.correlation_id(wu)
    }

    pub fn send_message(&self, wu: &str, text: &str) -> Result<(), DcError> {
        self.registry.send_message(wu, text)
    }

    pub fn serialize(&self, wu: &str) -> Result<String, DcError> {
        self.registry.serialize(wu)
    }

    pub fn deserialize(&mut self, json: &str) -> Result<String, DcError> {
        self.registry.deserialize(json)
    }

    pub async fn check_for_result<F>(&mut self, timeout_secs: i64, on_result: F) -> Result<usize, DcError>
    where
        F: FnMut(WuResult),
    {
        self.poller
            .check_for_result(&mut self.registry, timeout_secs, on_result)
            .await
    }

    pub async fn wait_for_event(&mut self, timeout_secs: i64) -> Result<Option<MasterEvent>, DcError> {
        self.poller
            .wait_for_event(&mut self.registry, timeout_secs)
            .await
    }

    pub async fn wait_for_wu_event(
        &mut self,
        wu: &str,
        timeout_secs: i64,
    ) -> Result<Option<MasterEvent>, DcError> {
        self.poller
            .wait_for_wu_event(&mut self.registry, wu, timeout_secs)
            .await
    }
}
