use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{spawn_command, ExecutionContext, ExecutionResult, Executor, InFlight};
use crate::catalog::template::{self, CommandLine};
use crate::catalog::{Capability, PrivilegeLevel, RiskLevel};
use crate::error::EngineError;
use crate::process::{ProcessRunner, ProcessStatus, RunOutcome};

/// Answer of an elevation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationDecision {
    Granted,
    Denied,
    /// The user dismissed the prompt.
    Cancelled,
    /// No elevation mechanism exists on this machine.
    Unavailable,
}

/// What the provider is asked to approve.
#[derive(Debug, Clone, Serialize)]
pub struct ElevationRequest {
    pub execution_id: String,
    pub capability_id: String,
    pub capability_title: String,
    pub risk: RiskLevel,
    pub command: String,
}

/// Obtains administrator rights for one command.
///
/// The engine only defines this contract; how the user is asked (a system
/// dialog, a polkit agent, a cached sudo ticket) is up to the provider.
#[async_trait]
pub trait PrivilegeElevationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decide whether `request` may run elevated. Must return promptly with
    /// `Cancelled` once `cancel` fires.
    async fn authorize(&self, request: &ElevationRequest, cancel: &CancellationToken) -> ElevationDecision;

    /// Rewrite the command so it runs with elevated rights.
    fn wrap(&self, command: CommandLine) -> CommandLine;

    /// Some mechanisms only report refusal through the exit status of the
    /// wrapped command.
    fn classify_exit(&self, _outcome: &RunOutcome) -> Option<ElevationDecision> {
        None
    }
}

/// Runs capabilities with administrator rights obtained from a provider.
pub struct ElevatedExecutor {
    runner: Arc<dyn ProcessRunner>,
    provider: Arc<dyn PrivilegeElevationProvider>,
    in_flight: InFlight,
}

impl ElevatedExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>, provider: Arc<dyn PrivilegeElevationProvider>) -> Self {
        Self {
            runner,
            provider,
            in_flight: InFlight::default(),
        }
    }

    fn decision_error(&self, capability: &Capability, decision: ElevationDecision) -> Option<EngineError> {
        match decision {
            ElevationDecision::Granted => None,
            ElevationDecision::Cancelled => Some(EngineError::Cancelled),
            ElevationDecision::Denied => Some(EngineError::PermissionDenied(format!(
                "{} refused elevation for {}",
                self.provider.name(),
                capability.id
            ))),
            ElevationDecision::Unavailable => Some(EngineError::PrivilegeRequired(format!(
                "no elevation mechanism available ({})",
                self.provider.name()
            ))),
        }
    }
}

#[async_trait]
impl Executor for ElevatedExecutor {
    fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::Elevated
    }

    async fn execute(
        &self,
        capability: &Capability,
        arguments: &BTreeMap<String, String>,
        ctx: ExecutionContext,
    ) -> ExecutionResult {
        let (command, values) = match template::build_command(capability, arguments, ctx.dry_run) {
            Ok(built) => built,
            Err(e) => {
                return ExecutionResult::rejected(&ctx.execution_id, &capability.id, &e, arguments.clone())
                    .with_dry_run(ctx.dry_run)
            }
        };

        let _guard = self.in_flight.track(&ctx.execution_id, &ctx.cancel);

        let request = ElevationRequest {
            execution_id: ctx.execution_id.clone(),
            capability_id: capability.id.clone(),
            capability_title: capability.title.clone(),
            risk: capability.risk,
            command: command.display(),
        };
        let decision = tokio::select! {
            decision = self.provider.authorize(&request, &ctx.cancel) => decision,
            _ = ctx.cancel.cancelled() => ElevationDecision::Cancelled,
        };
        log::info!(
            "Elevation for {} [{}] via {}: {:?}",
            capability.id,
            ctx.execution_id,
            self.provider.name(),
            decision
        );
        if let Some(err) = self.decision_error(capability, decision) {
            return ExecutionResult::rejected(&ctx.execution_id, &capability.id, &err, values)
                .with_dry_run(ctx.dry_run);
        }

        let wrapped = self.provider.wrap(command);
        let outcome = match spawn_command(self.runner.as_ref(), capability, &wrapped, &ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("{} could not be started elevated: {}", capability.id, e);
                return ExecutionResult::rejected(&ctx.execution_id, &capability.id, &e, values)
                    .with_dry_run(ctx.dry_run);
            }
        };

        let late_decision = (outcome.status == ProcessStatus::Exited && !outcome.success())
            .then(|| self.provider.classify_exit(&outcome))
            .flatten();
        let result = ExecutionResult::from_outcome(&ctx, capability, values, outcome);
        match late_decision.and_then(|d| self.decision_error(capability, d)) {
            Some(err) => result.with_error(&err),
            None => result,
        }
    }

    fn cancel(&self) {
        let n = self.in_flight.cancel_all();
        if n > 0 {
            log::info!("Cancelled {} elevated execution(s)", n);
        }
    }
}
