//! Reference elevation providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::elevated::{ElevationDecision, ElevationRequest, PrivilegeElevationProvider};
use crate::catalog::template::CommandLine;
use crate::error::EngineError;
use crate::process::{ProcessRunner, ProcessStatus, RunOutcome, RunRequest};
use crate::util::find_program;

const SUDO_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

fn prepend(program: &str, prefix: &[&str], command: CommandLine) -> CommandLine {
    let mut args: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
    args.push(command.program);
    args.extend(command.args);
    CommandLine {
        program: program.to_string(),
        args,
    }
}

/// Non-interactive `sudo`. Works when the user has a cached ticket or a
/// NOPASSWD rule; never prompts on a terminal.
pub struct SudoElevationProvider {
    runner: Arc<dyn ProcessRunner>,
    program: String,
}

impl SudoElevationProvider {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            program: "sudo".into(),
        }
    }

    fn refused(stderr: &str) -> bool {
        stderr.contains("password is required") || stderr.contains("not in the sudoers")
    }
}

#[async_trait]
impl PrivilegeElevationProvider for SudoElevationProvider {
    fn name(&self) -> &'static str {
        "sudo"
    }

    async fn authorize(&self, request: &ElevationRequest, cancel: &CancellationToken) -> ElevationDecision {
        let probe = RunRequest::new(&self.program, vec!["-n".into(), "true".into()], SUDO_PROBE_TIMEOUT);
        match self.runner.run(probe, cancel.clone(), None).await {
            Ok(outcome) if outcome.success() => ElevationDecision::Granted,
            Ok(outcome) if outcome.status == ProcessStatus::Cancelled => ElevationDecision::Cancelled,
            Ok(outcome) => {
                log::info!(
                    "sudo refused {} non-interactively: {}",
                    request.capability_id,
                    outcome.stderr.trim()
                );
                ElevationDecision::Denied
            }
            Err(EngineError::Spawn { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                ElevationDecision::Unavailable
            }
            Err(e) => {
                log::warn!("sudo probe failed: {}", e);
                ElevationDecision::Unavailable
            }
        }
    }

    fn wrap(&self, command: CommandLine) -> CommandLine {
        prepend(&self.program, &["-n", "--"], command)
    }

    fn classify_exit(&self, outcome: &RunOutcome) -> Option<ElevationDecision> {
        (outcome.exit_code == Some(1) && Self::refused(&outcome.stderr)).then_some(ElevationDecision::Denied)
    }
}

/// polkit's `pkexec`. The authentication agent prompts when the wrapped
/// command starts, so authorization only checks that pkexec exists.
pub struct PkexecElevationProvider {
    program: String,
}

impl PkexecElevationProvider {
    pub fn new() -> Self {
        Self {
            program: "pkexec".into(),
        }
    }
}

impl Default for PkexecElevationProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrivilegeElevationProvider for PkexecElevationProvider {
    fn name(&self) -> &'static str {
        "pkexec"
    }

    async fn authorize(&self, _request: &ElevationRequest, _cancel: &CancellationToken) -> ElevationDecision {
        if find_program(&self.program).is_some() {
            ElevationDecision::Granted
        } else {
            ElevationDecision::Unavailable
        }
    }

    fn wrap(&self, command: CommandLine) -> CommandLine {
        prepend(&self.program, &[], command)
    }

    fn classify_exit(&self, outcome: &RunOutcome) -> Option<ElevationDecision> {
        match outcome.exit_code {
            // Authentication dialog dismissed
            Some(126) => Some(ElevationDecision::Cancelled),
            // Not authorized, or authentication failed
            Some(127) => Some(ElevationDecision::Denied),
            _ => None,
        }
    }
}
