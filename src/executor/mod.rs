//! Privilege-tier executors.
//!
//! Every tier implements [`Executor`]; the [`router::PrivilegeRouter`] picks
//! one from the capability's declared privilege level and nothing else.
//! Executors never return errors: every failure is classified into the
//! status of the [`ExecutionResult`] they hand back.

pub mod automation;
pub mod consent;
pub mod elevated;
pub mod providers;
pub mod router;
pub mod user;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::catalog::template::CommandLine;
use crate::catalog::{Capability, PrivilegeLevel};
use crate::error::{EngineError, EngineResult};
use crate::parser::{self, ParsedOutput};
use crate::process::{OutputCallback, OutputChunk, ProcessRunner, ProcessStatus, RunOutcome, RunRequest};
use crate::util::expand_home;

pub use automation::{AutomationExecutor, OsascriptBridge, ScriptingBridge};
pub use consent::ConsentElevationProvider;
pub use elevated::{ElevatedExecutor, ElevationDecision, ElevationRequest, PrivilegeElevationProvider};
pub use providers::{PkexecElevationProvider, SudoElevationProvider};
pub use router::PrivilegeRouter;
pub use user::UserExecutor;

/// Final classification of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    PermissionDenied,
    AutomationDenied,
    PreflightFailed,
    NotFound,
}

impl ExecutionStatus {
    pub fn from_error(err: &EngineError) -> Self {
        match err {
            EngineError::CapabilityNotFound(_) => ExecutionStatus::NotFound,
            EngineError::PreflightFailed { .. } => ExecutionStatus::PreflightFailed,
            EngineError::PermissionDenied(_) | EngineError::PrivilegeRequired(_) => {
                ExecutionStatus::PermissionDenied
            }
            EngineError::AutomationDenied { .. } => ExecutionStatus::AutomationDenied,
            EngineError::TimedOut(_) => ExecutionStatus::TimedOut,
            EngineError::Cancelled => ExecutionStatus::Cancelled,
            EngineError::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                ExecutionStatus::PermissionDenied
            }
            _ => ExecutionStatus::Failed,
        }
    }

    /// Terminal state this status ends the state machine in.
    pub fn terminal_state(&self) -> ExecutionState {
        match self {
            ExecutionStatus::Completed => ExecutionState::Completed,
            ExecutionStatus::TimedOut => ExecutionState::TimedOut,
            ExecutionStatus::Cancelled => ExecutionState::Cancelled,
            ExecutionStatus::PermissionDenied | ExecutionStatus::AutomationDenied => {
                ExecutionState::PermissionDenied
            }
            ExecutionStatus::Failed | ExecutionStatus::PreflightFailed | ExecutionStatus::NotFound => {
                ExecutionState::Failed
            }
        }
    }
}

/// Lifecycle of one execution, published as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    PreflightPassed,
    Dispatched,
    Executing,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    PermissionDenied,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExecutionState::Idle
                | ExecutionState::PreflightPassed
                | ExecutionState::Dispatched
                | ExecutionState::Executing
        )
    }
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    State(ExecutionState),
    Output(OutputChunk),
}

pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Per-execution inputs shared by every tier.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressSink>,
    pub dry_run: bool,
}

impl ExecutionContext {
    pub fn new(execution_id: &str, cancel: CancellationToken) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            cancel,
            progress: None,
            dry_run: false,
        }
    }

    pub fn report_state(&self, state: ExecutionState) {
        if let Some(progress) = &self.progress {
            progress(ProgressEvent::State(state));
        }
    }

    /// Runner callback forwarding output chunks to the progress sink.
    pub fn output_callback(&self) -> Option<OutputCallback> {
        let progress = self.progress.clone()?;
        Some(Arc::new(move |chunk: OutputChunk| progress(ProgressEvent::Output(chunk))))
    }
}

/// Outcome of one execution attempt, handed to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub capability_id: String,
    pub status: ExecutionStatus,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub output_truncated: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub parsed: ParsedOutput,
    pub remediation_hint: Option<String>,
    pub message: Option<String>,
    /// Effective parameter values after defaults were applied.
    pub arguments: BTreeMap<String, String>,
    pub preflight_failures: Vec<String>,
    pub dry_run: bool,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    /// Result for an attempt that never produced a process outcome.
    pub fn rejected(
        execution_id: &str,
        capability_id: &str,
        err: &EngineError,
        arguments: BTreeMap<String, String>,
    ) -> Self {
        let preflight_failures = match err {
            EngineError::PreflightFailed { failures } => failures.clone(),
            _ => Vec::new(),
        };
        Self {
            execution_id: execution_id.to_string(),
            capability_id: capability_id.to_string(),
            status: ExecutionStatus::from_error(err),
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            stdout_bytes: 0,
            stderr_bytes: 0,
            output_truncated: false,
            exit_code: None,
            duration_ms: 0,
            parsed: ParsedOutput::text(""),
            remediation_hint: err.remediation_hint(),
            message: Some(err.to_string()),
            arguments,
            preflight_failures,
            dry_run: false,
            timestamp: Utc::now(),
        }
    }

    pub fn from_outcome(
        ctx: &ExecutionContext,
        capability: &Capability,
        arguments: BTreeMap<String, String>,
        outcome: RunOutcome,
    ) -> Self {
        let (status, error) = match outcome.status {
            ProcessStatus::Exited if outcome.exit_code == Some(0) => (ExecutionStatus::Completed, None),
            ProcessStatus::Exited => {
                let reason = match outcome.exit_code {
                    Some(code) => format!("{} exited with code {}", capability.id, code),
                    None => format!("{} was terminated by a signal", capability.id),
                };
                (ExecutionStatus::Failed, Some(EngineError::ExecutionFailed(reason)))
            }
            ProcessStatus::TimedOut => (
                ExecutionStatus::TimedOut,
                Some(EngineError::TimedOut(capability.timeout())),
            ),
            ProcessStatus::Cancelled => (ExecutionStatus::Cancelled, Some(EngineError::Cancelled)),
        };

        let parsed = if status == ExecutionStatus::Completed {
            parser::parse(&capability.parser, &outcome.stdout)
        } else {
            ParsedOutput::text(&outcome.stdout)
        };

        Self {
            execution_id: ctx.execution_id.clone(),
            capability_id: capability.id.clone(),
            status,
            success: status == ExecutionStatus::Completed,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            stdout_bytes: outcome.stdout_bytes,
            stderr_bytes: outcome.stderr_bytes,
            output_truncated: outcome.truncated,
            exit_code: outcome.exit_code,
            duration_ms: outcome.duration.as_millis() as u64,
            parsed,
            remediation_hint: error.as_ref().and_then(EngineError::remediation_hint),
            message: error.map(|e| e.to_string()),
            arguments,
            preflight_failures: Vec::new(),
            dry_run: ctx.dry_run,
            timestamp: Utc::now(),
        }
    }

    /// Reclassify as a failure caused by `err`, keeping the captured output.
    pub fn with_error(mut self, err: &EngineError) -> Self {
        self.status = ExecutionStatus::from_error(err);
        self.success = false;
        self.parsed = ParsedOutput::text(&self.stdout);
        self.message = Some(err.to_string());
        self.remediation_hint = err.remediation_hint();
        self
    }

    pub fn with_hint(mut self, hint: String) -> Self {
        self.remediation_hint = Some(hint);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn privilege(&self) -> PrivilegeLevel;

    async fn execute(
        &self,
        capability: &Capability,
        arguments: &BTreeMap<String, String>,
        ctx: ExecutionContext,
    ) -> ExecutionResult;

    /// Cancel every in-flight execution of this executor.
    fn cancel(&self);
}

/// Cancellation tokens of executions currently running, keyed by execution id.
#[derive(Clone, Default)]
pub struct InFlight {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl InFlight {
    /// Register `token` until the returned guard is dropped.
    pub fn track(&self, execution_id: &str, token: &CancellationToken) -> InFlightGuard {
        self.lock().insert(execution_id.to_string(), token.clone());
        InFlightGuard {
            tokens: self.tokens.clone(),
            execution_id: execution_id.to_string(),
        }
    }

    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.lock().get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let tokens = self.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct InFlightGuard {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
    execution_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.execution_id);
    }
}

/// Run a resolved command line through `runner` on behalf of `capability`.
pub(crate) async fn spawn_command(
    runner: &dyn ProcessRunner,
    capability: &Capability,
    command: &CommandLine,
    ctx: &ExecutionContext,
) -> EngineResult<RunOutcome> {
    ctx.report_state(ExecutionState::Executing);
    log::info!(
        "Executing {} [{}]: {}",
        capability.id,
        ctx.execution_id,
        command.program
    );

    let request = RunRequest {
        program: expand_home(&command.program).to_string_lossy().into_owned(),
        args: command.args.clone(),
        env: capability.env.clone(),
        working_dir: None,
        timeout: capability.timeout(),
    };
    runner
        .run(request, ctx.cancel.clone(), ctx.output_callback())
        .await
}
