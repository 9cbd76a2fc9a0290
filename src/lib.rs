pub mod audit;
pub mod catalog;
pub mod config;
pub mod coordinator;
mod error;
pub mod events;
pub mod executor;
pub mod parser;
pub mod preflight;
pub mod process;
pub(crate) mod util;

use std::sync::Arc;
use std::time::Duration;

pub use audit::{AuditExport, AuditFilter, ChainRange, ChainVerification, RunRecord, RunStatus};
pub use catalog::{Capability, CapabilityCatalog, PrivilegeLevel, RiskLevel};
pub use config::EngineConfig;
pub use coordinator::{Coordinator, ExecutionOutcome, ExecutionRequest};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus};
pub use executor::{ExecutionResult, ExecutionState, ExecutionStatus};

use audit::{AuditLog, AuditStore};
use executor::{
    AutomationExecutor, ConsentElevationProvider, ElevatedExecutor, OsascriptBridge, PrivilegeElevationProvider,
    PrivilegeRouter, UserExecutor,
};
use preflight::{PreflightValidator, SysinfoProbe};
use process::{ProcessRunner, TokioProcessRunner};

/// A wired engine: the coordinator plus the consent prompt it answers to.
pub struct Engine {
    coordinator: Arc<Coordinator>,
    consent: Arc<ConsentElevationProvider>,
    config: EngineConfig,
}

impl Engine {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.coordinator.events().subscribe()
    }

    /// Answer an [`EngineEvent::ElevationPrompt`].
    pub fn respond_elevation(&self, request_id: &str, approved: bool) -> bool {
        self.consent.respond(request_id, approved)
    }

    pub fn pending_elevations(&self) -> Vec<String> {
        self.consent.pending_requests()
    }
}

#[cfg(target_os = "macos")]
fn platform_elevation(runner: Arc<dyn ProcessRunner>) -> Arc<dyn PrivilegeElevationProvider> {
    Arc::new(executor::SudoElevationProvider::new(runner))
}

#[cfg(not(target_os = "macos"))]
fn platform_elevation(_runner: Arc<dyn ProcessRunner>) -> Arc<dyn PrivilegeElevationProvider> {
    Arc::new(executor::PkexecElevationProvider::new())
}

/// Wire the default stack around `catalog`.
///
/// The audit database lives in `config.data_dir`; if it cannot be opened the
/// engine keeps running on an in-memory store and every outcome carries a
/// warning saying so. Must be called from within a Tokio runtime.
pub fn bootstrap(config: EngineConfig, catalog: CapabilityCatalog) -> EngineResult<Engine> {
    config.validate()?;

    let (store, storage_warning) = AuditStore::open_or_in_memory(&config)?;
    let audit = AuditLog::start(Arc::new(store), config.audit.writer_capacity, config.audit.retention());
    let events = EventBus::new(config.event_capacity);

    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner::new(config.runner.clone()));
    let consent = Arc::new(ConsentElevationProvider::new(
        platform_elevation(runner.clone()),
        events.clone(),
        Duration::from_secs(config.elevation_prompt_timeout_secs),
    ));

    let router = PrivilegeRouter::new(
        Arc::new(UserExecutor::new(runner.clone())),
        Arc::new(AutomationExecutor::new(Arc::new(OsascriptBridge::new(runner.clone())))),
        Arc::new(ElevatedExecutor::new(runner, consent.clone())),
    );

    let coordinator = Coordinator::new(
        Arc::new(catalog),
        PreflightValidator::new(Arc::new(SysinfoProbe)),
        router,
        audit,
        events,
    )
    .with_storage_warning(storage_warning);

    log::info!(
        "Capability engine ready ({} capabilities, data dir {})",
        coordinator.list_capabilities().len(),
        config.data_dir.display()
    );

    Ok(Engine {
        coordinator: Arc::new(coordinator),
        consent,
        config,
    })
}
