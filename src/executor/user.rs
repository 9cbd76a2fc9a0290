use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{spawn_command, ExecutionContext, ExecutionResult, Executor, InFlight};
use crate::catalog::template;
use crate::catalog::{Capability, PrivilegeLevel};
use crate::process::ProcessRunner;

/// Runs capabilities as the current user.
pub struct UserExecutor {
    runner: Arc<dyn ProcessRunner>,
    in_flight: InFlight,
}

impl UserExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            in_flight: InFlight::default(),
        }
    }
}

#[async_trait]
impl Executor for UserExecutor {
    fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::User
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
        match spawn_command(self.runner.as_ref(), capability, &command, &ctx).await {
            Ok(outcome) => ExecutionResult::from_outcome(&ctx, capability, values, outcome),
            Err(e) => {
                log::error!("{} could not be started: {}", capability.id, e);
                ExecutionResult::rejected(&ctx.execution_id, &capability.id, &e, values)
                    .with_dry_run(ctx.dry_run)
            }
        }
    }

    fn cancel(&self) {
        let n = self.in_flight.cancel_all();
        if n > 0 {
            log::info!("Cancelled {} user execution(s)", n);
        }
    }
}
