//! Execution orchestration.
//!
//! The [`Coordinator`] is the single entry point for running a capability:
//! lookup, preflight, routing, execution and persistence happen here in that
//! order. Each attempt that reaches preflight ends in exactly one run record,
//! and lifecycle changes are published on the [`EventBus`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditExport, AuditFilter, AuditLog, ChainRange, ChainVerification, RecordDraft, RunRecord};
use crate::catalog::{Capability, CapabilityCatalog, CapabilitySummary};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::executor::{
    ExecutionContext, ExecutionResult, ExecutionState, InFlight, PrivilegeRouter, ProgressEvent, ProgressSink,
};
use crate::preflight::{PreflightReport, PreflightValidator};

/// What the caller wants run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub capability_id: String,
    pub arguments: BTreeMap<String, String>,
    /// Run the capability's side-effect-free variant instead.
    pub dry_run: bool,
}

impl ExecutionRequest {
    pub fn new(capability_id: &str) -> Self {
        Self {
            capability_id: capability_id.to_string(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, name: &str, value: &str) -> Self {
        self.arguments.insert(name.to_string(), value.to_string());
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Result plus the record it was stored as.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub result: ExecutionResult,
    /// `None` when nothing was recorded (unknown capability) or the append failed.
    pub record: Option<RunRecord>,
    pub warnings: Vec<String>,
}

/// The execution the UI shows as "running".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentExecution {
    pub execution_id: String,
    pub capability_id: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
}

type CurrentSlot = Arc<Mutex<Option<CurrentExecution>>>;

fn lock_current(slot: &CurrentSlot) -> std::sync::MutexGuard<'_, Option<CurrentExecution>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Coordinator {
    catalog: Arc<CapabilityCatalog>,
    preflight: PreflightValidator,
    router: PrivilegeRouter,
    audit: AuditLog,
    events: EventBus,
    in_flight: InFlight,
    current: CurrentSlot,
    storage_warning: Option<String>,
}

impl Coordinator {
    pub fn new(
        catalog: Arc<CapabilityCatalog>,
        preflight: PreflightValidator,
        router: PrivilegeRouter,
        audit: AuditLog,
        events: EventBus,
    ) -> Self {
        Self {
            catalog,
            preflight,
            router,
            audit,
            events,
            in_flight: InFlight::default(),
            current: Arc::new(Mutex::new(None)),
            storage_warning: None,
        }
    }

    /// Attach a warning to every outcome, e.g. when history is memory-only.
    pub fn with_storage_warning(mut self, warning: Option<String>) -> Self {
        self.storage_warning = warning;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn list_capabilities(&self) -> Vec<CapabilitySummary> {
        self.catalog.list()
    }

    pub fn capability(&self, id: &str) -> Option<Arc<Capability>> {
        self.catalog.get(id)
    }

    pub fn current_execution(&self) -> Option<CurrentExecution> {
        lock_current(&self.current).clone()
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.ids()
    }

    /// Cancel one execution. Returns `false` if it is not running.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let found = self.in_flight.cancel(execution_id);
        if found {
            log::info!("Cancellation requested for {}", execution_id);
        }
        found
    }

    pub fn cancel_current(&self) -> bool {
        let id = lock_current(&self.current).as_ref().map(|c| c.execution_id.clone());
        match id {
            Some(id) => self.cancel(&id),
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        self.router.cancel_all();
        self.in_flight.cancel_all()
    }

    pub async fn execute(&self, capability_id: &str, arguments: BTreeMap<String, String>) -> ExecutionOutcome {
        self.run(ExecutionRequest {
            capability_id: capability_id.to_string(),
            arguments,
            dry_run: false,
        })
        .await
    }

    /// Run one capability to completion.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let execution_id = uuid::Uuid::new_v4().to_string();

        let Some(capability) = self.catalog.get(&request.capability_id) else {
            let err = EngineError::CapabilityNotFound(request.capability_id.clone());
            log::warn!("{}", err);
            let result = ExecutionResult::rejected(&execution_id, &request.capability_id, &err, request.arguments)
                .with_dry_run(request.dry_run);
            self.events.emit(EngineEvent::ExecutionFinished {
                execution_id,
                capability_id: request.capability_id,
                state: result.status.terminal_state(),
                success: false,
                record_id: None,
            });
            return ExecutionOutcome {
                result,
                record: None,
                warnings: self.storage_warning.iter().cloned().collect(),
            };
        };

        let cancel = CancellationToken::new();
        let _guard = self.in_flight.track(&execution_id, &cancel);
        *lock_current(&self.current) = Some(CurrentExecution {
            execution_id: execution_id.clone(),
            capability_id: capability.id.clone(),
            state: ExecutionState::Idle,
            started_at: Utc::now(),
        });
        self.events.emit(EngineEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            capability_id: capability.id.clone(),
            dry_run: request.dry_run,
        });

        let ctx = ExecutionContext {
            execution_id: execution_id.clone(),
            cancel,
            progress: Some(self.progress_sink(&execution_id)),
            dry_run: request.dry_run,
        };

        let result = self.dispatch(&capability, &request, ctx.clone()).await;
        ctx.report_state(result.status.terminal_state());

        let outcome = self.persist(&capability, result).await;

        self.events.emit(EngineEvent::ExecutionFinished {
            execution_id: execution_id.clone(),
            capability_id: capability.id.clone(),
            state: outcome.result.status.terminal_state(),
            success: outcome.result.success,
            record_id: outcome.record.as_ref().map(|r| r.id.clone()),
        });

        let mut current = lock_current(&self.current);
        if current.as_ref().is_some_and(|c| c.execution_id == execution_id) {
            *current = None;
        }
        drop(current);

        log::info!(
            "{} [{}] finished: {:?} in {}ms",
            capability.id,
            execution_id,
            outcome.result.status,
            outcome.result.duration_ms
        );
        outcome
    }

    /// Preflight gate followed by the privilege tier's executor.
    async fn dispatch(
        &self,
        capability: &Arc<Capability>,
        request: &ExecutionRequest,
        ctx: ExecutionContext,
    ) -> ExecutionResult {
        let report = self.check_preflight(capability).await;
        if !report.can_execute {
            let err = EngineError::PreflightFailed {
                failures: report.failure_messages(),
            };
            log::info!("{} blocked by preflight: {}", capability.id, err);
            let mut result =
                ExecutionResult::rejected(&ctx.execution_id, &capability.id, &err, request.arguments.clone())
                    .with_dry_run(request.dry_run);
            if !report.remediation_steps.is_empty() {
                let steps: Vec<&str> = report.remediation_steps.iter().map(|s| s.instruction.as_str()).collect();
                result = result.with_hint(steps.join("\n"));
            }
            return result;
        }
        ctx.report_state(ExecutionState::PreflightPassed);

        let executor = self.router.route(capability.privilege);
        ctx.report_state(ExecutionState::Dispatched);
        executor.execute(capability, &request.arguments, ctx).await
    }

    async fn check_preflight(&self, capability: &Arc<Capability>) -> PreflightReport {
        if capability.preflight.is_empty() {
            return PreflightReport::passed();
        }
        let validator = self.preflight.clone();
        let capability = capability.clone();
        match tokio::task::spawn_blocking(move || validator.evaluate(&capability.preflight)).await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Preflight evaluation panicked: {}", e);
                PreflightReport {
                    can_execute: false,
                    failures: Vec::new(),
                    remediation_steps: Vec::new(),
                }
            }
        }
    }

    async fn persist(&self, capability: &Capability, result: ExecutionResult) -> ExecutionOutcome {
        let mut warnings: Vec<String> = self.storage_warning.iter().cloned().collect();
        let draft = RecordDraft::from_result(&result, capability);
        let record = match self.audit.append(draft).await {
            Ok(record) => Some(record),
            Err(e) => {
                let err = match e {
                    EngineError::AuditPersistenceFailed(_) => e,
                    other => EngineError::AuditPersistenceFailed(other.to_string()),
                };
                log::error!("Run record for {} not stored: {}", result.execution_id, err);
                self.events.emit(EngineEvent::AuditWarning {
                    execution_id: result.execution_id.clone(),
                    message: err.to_string(),
                });
                warnings.push(err.to_string());
                None
            }
        };
        ExecutionOutcome {
            result,
            record,
            warnings,
        }
    }

    fn progress_sink(&self, execution_id: &str) -> ProgressSink {
        let events = self.events.clone();
        let current = self.current.clone();
        let execution_id = execution_id.to_string();
        Arc::new(move |event: ProgressEvent| match event {
            ProgressEvent::State(state) => {
                if let Some(c) = lock_current(&current).as_mut() {
                    if c.execution_id == execution_id {
                        c.state = state;
                    }
                }
                events.emit(EngineEvent::StateChanged {
                    execution_id: execution_id.clone(),
                    state,
                });
            }
            ProgressEvent::Output(chunk) => events.emit(EngineEvent::Output {
                execution_id: execution_id.clone(),
                stream: chunk.stream,
                text: chunk.text,
            }),
        })
    }

    pub async fn history(&self, filter: AuditFilter, limit: usize, offset: usize) -> EngineResult<Vec<RunRecord>> {
        self.audit.fetch(filter, limit, offset).await
    }

    pub async fn history_count(&self, filter: AuditFilter) -> EngineResult<u64> {
        self.audit.count(filter).await
    }

    pub async fn latest_record(&self) -> EngineResult<Option<RunRecord>> {
        self.audit.latest().await
    }

    pub async fn verify(&self, range: ChainRange) -> EngineResult<ChainVerification> {
        self.audit.verify_chain(range).await
    }

    pub async fn export(&self, range: ChainRange) -> EngineResult<AuditExport> {
        self.audit.export(range).await
    }

    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        self.audit.prune_before(cutoff).await
    }

    /// Full content of a spilled stdout/stderr stream.
    pub async fn read_overflow(&self, pointer: &str) -> EngineResult<String> {
        let store = self.audit.store().clone();
        let pointer = pointer.to_string();
        tokio::task::spawn_blocking(move || store.read_overflow(&pointer))
            .await
            .map_err(|e| EngineError::AuditPersistenceFailed(format!("audit task failed: {}", e)))?
    }
}
