use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::{ExecutionContext, ExecutionResult, ExecutionState, Executor, InFlight};
use crate::catalog::template;
use crate::catalog::{Capability, PrivilegeLevel};
use crate::error::{EngineError, EngineResult};
use crate::process::{OutputCallback, ProcessRunner, ProcessStatus, RunOutcome, RunRequest};

/// Runs a script against another application.
#[async_trait]
pub trait ScriptingBridge: Send + Sync {
    async fn run_script(
        &self,
        script: &str,
        timeout: Duration,
        cancel: CancellationToken,
        on_output: Option<OutputCallback>,
    ) -> EngineResult<RunOutcome>;
}

/// AppleScript through `osascript -e`.
pub struct OsascriptBridge {
    runner: Arc<dyn ProcessRunner>,
    program: String,
}

impl OsascriptBridge {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            program: "/usr/bin/osascript".into(),
        }
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }
}

#[async_trait]
impl ScriptingBridge for OsascriptBridge {
    async fn run_script(
        &self,
        script: &str,
        timeout: Duration,
        cancel: CancellationToken,
        on_output: Option<OutputCallback>,
    ) -> EngineResult<RunOutcome> {
        let request = RunRequest::new(&self.program, vec!["-e".into(), script.to_string()], timeout);
        self.runner.run(request, cancel, on_output).await
    }
}

/// Which privacy permission blocked a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialKind {
    Automation,
    Accessibility,
}

fn automation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\((?:-1743|-1744)\)|Not authorized to send Apple events").expect("automation denial regex")
    })
}

fn accessibility_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\((?:-1719|-25211)\)|not allowed assistive access").expect("accessibility denial regex")
    })
}

impl DenialKind {
    /// Classify `osascript` stderr. Error numbers only count in the
    /// parenthesised form the scripting runtime prints.
    pub fn detect(stderr: &str) -> Option<Self> {
        if automation_re().is_match(stderr) {
            Some(DenialKind::Automation)
        } else if accessibility_re().is_match(stderr) {
            Some(DenialKind::Accessibility)
        } else {
            None
        }
    }

    pub fn settings_pane(&self) -> &'static str {
        match self {
            DenialKind::Automation => "Automation",
            DenialKind::Accessibility => "Accessibility",
        }
    }

    pub fn hint(&self, application: &str) -> String {
        match self {
            DenialKind::Automation => format!(
                "Open System Settings > Privacy & Security > Automation and allow this app to control {}.",
                application
            ),
            DenialKind::Accessibility => format!(
                "Open System Settings > Privacy & Security > Accessibility and enable this app so it can drive {}.",
                application
            ),
        }
    }
}

/// Runs automation capabilities through a [`ScriptingBridge`].
pub struct AutomationExecutor {
    bridge: Arc<dyn ScriptingBridge>,
    in_flight: InFlight,
}

impl AutomationExecutor {
    pub fn new(bridge: Arc<dyn ScriptingBridge>) -> Self {
        Self {
            bridge,
            in_flight: InFlight::default(),
        }
    }
}

#[async_trait]
impl Executor for AutomationExecutor {
    fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::Automation
    }

    async fn execute(
        &self,
        capability: &Capability,
        arguments: &BTreeMap<String, String>,
        ctx: ExecutionContext,
    ) -> ExecutionResult {
        let reject = |err: &EngineError, values: BTreeMap<String, String>| {
            ExecutionResult::rejected(&ctx.execution_id, &capability.id, err, values).with_dry_run(ctx.dry_run)
        };

        if ctx.dry_run {
            let err = EngineError::PreflightFailed {
                failures: vec![format!("{} has no dry-run variant", capability.id)],
            };
            return reject(&err, arguments.clone());
        }

        let (script, values) = match template::build_script(capability, arguments) {
            Ok(built) => built,
            Err(e) => return reject(&e, arguments.clone()),
        };
        let application = capability
            .target_application
            .clone()
            .unwrap_or_else(|| capability.title.clone());

        let _guard = self.in_flight.track(&ctx.execution_id, &ctx.cancel);
        ctx.report_state(ExecutionState::Executing);
        log::info!("Running {} against {} [{}]", capability.id, application, ctx.execution_id);

        let outcome = match self
            .bridge
            .run_script(&script, capability.timeout(), ctx.cancel.clone(), ctx.output_callback())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Scripting bridge failed for {}: {}", capability.id, e);
                return reject(&e, values);
            }
        };

        let denial = (outcome.status == ProcessStatus::Exited && outcome.exit_code != Some(0))
            .then(|| DenialKind::detect(&outcome.stderr))
            .flatten();

        let result = ExecutionResult::from_outcome(&ctx, capability, values, outcome);
        match denial {
            Some(kind) => {
                log::warn!(
                    "{} was refused {} permission for {}",
                    capability.id,
                    kind.settings_pane(),
                    application
                );
                let message = result.stderr.lines().next().unwrap_or_default().trim().to_string();
                let err = EngineError::AutomationDenied {
                    application: application.clone(),
                    message,
                };
                result.with_error(&err).with_hint(kind.hint(&application))
            }
            None => result,
        }
    }

    fn cancel(&self) {
        let n = self.in_flight.cancel_all();
        if n > 0 {
            log::info!("Cancelled {} automation execution(s)", n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::capability;
    use crate::catalog::ParameterDef;
    use crate::executor::ExecutionStatus;
    use crate::process::mock::MockRunner;

    fn safari_capability() -> Capability {
        let mut cap = capability("safari.close_tabs", "", &[]);
        cap.privilege = PrivilegeLevel::Automation;
        cap.target_application = Some("Safari".into());
        cap.script = Some(r#"tell application "Safari" to close (every tab of window 1 whose URL contains {domain})"#.into());
        cap.parameters = vec![ParameterDef {
            name: "domain".into(),
            description: String::new(),
            default: Some("example.com".into()),
            required: false,
        }];
        cap
    }

    #[tokio::test]
    async fn runs_escaped_script_through_osascript() {
        let runner = Arc::new(MockRunner::new());
        let executor = AutomationExecutor::new(Arc::new(OsascriptBridge::new(runner.clone())));
        let args = BTreeMap::from([("domain".to_string(), "a\"b".to_string())]);

        let result = executor
            .execute(&safari_capability(), &args, ExecutionContext::new("e1", CancellationToken::new()))
            .await;
        assert_eq!(result.status, ExecutionStatus::Completed);

        let calls = runner.calls();
        assert_eq!(calls[0].program, "/usr/bin/osascript");
        assert_eq!(calls[0].args[0], "-e");
        assert!(calls[0].args[1].contains(r#"contains "a\"b""#));
    }

    #[tokio::test]
    async fn automation_denial_names_application() {
        let runner = Arc::new(MockRunner::new().with_outcome(RunOutcome::exited(
            1,
            "",
            "execution error: Not authorized to send Apple events to Safari. (-1743)",
        )));
        let executor = AutomationExecutor::new(Arc::new(OsascriptBridge::new(runner)));

        let result = executor
            .execute(&safari_capability(), &BTreeMap::new(), ExecutionContext::new("e1", CancellationToken::new()))
            .await;
        assert_eq!(result.status, ExecutionStatus::AutomationDenied);
        assert!(!result.success);
        let hint = result.remediation_hint.unwrap();
        assert!(hint.contains("Safari"));
        assert!(hint.contains("Automation"));
        assert!(result.message.unwrap().contains("-1743"));
    }

    #[tokio::test]
    async fn accessibility_denial_points_to_accessibility_pane() {
        let runner = Arc::new(MockRunner::new().with_outcome(RunOutcome::exited(
            1,
            "",
            "System Events got an error: osascript is not allowed assistive access. (-1719)",
        )));
        let executor = AutomationExecutor::new(Arc::new(OsascriptBridge::new(runner)));

        let result = executor
            .execute(&safari_capability(), &BTreeMap::new(), ExecutionContext::new("e1", CancellationToken::new()))
            .await;
        assert_eq!(result.status, ExecutionStatus::AutomationDenied);
        assert!(result.remediation_hint.unwrap().contains("Accessibility"));
    }

    #[test]
    fn denial_codes_match_whole_error_numbers() {
        assert_eq!(
            DenialKind::detect("execution error: Not authorized. (-1743)"),
            Some(DenialKind::Automation)
        );
        assert_eq!(
            DenialKind::detect("System Events got an error: (-25211)"),
            Some(DenialKind::Accessibility)
        );
        assert_eq!(DenialKind::detect("execution error: Unknown. (-17430)"), None);
        assert_eq!(DenialKind::detect("item -1743 of list"), None);
        assert_eq!(DenialKind::detect("execution error: (-17190)"), None);
    }

    #[tokio::test]
    async fn denial_code_in_stdout_is_ordinary_failure() {
        let runner = Arc::new(MockRunner::new().with_outcome(RunOutcome::exited(
            1,
            "window title: Not authorized to send Apple events (-1743)",
            "execution error: Can't get window 1. (-1728)",
        )));
        let executor = AutomationExecutor::new(Arc::new(OsascriptBridge::new(runner)));
        let result = executor
            .execute(&safari_capability(), &BTreeMap::new(), ExecutionContext::new("e1", CancellationToken::new()))
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn ordinary_script_error_is_failure() {
        let runner = Arc::new(MockRunner::new().with_outcome(RunOutcome::exited(
            1,
            "",
            "execution error: Can't get window 1. (-1728)",
        )));
        let executor = AutomationExecutor::new(Arc::new(OsascriptBridge::new(runner)));
        let result = executor
            .execute(&safari_capability(), &BTreeMap::new(), ExecutionContext::new("e1", CancellationToken::new()))
            .await;
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn dry_run_is_rejected_without_running() {
        let runner = Arc::new(MockRunner::new());
        let executor = AutomationExecutor::new(Arc::new(OsascriptBridge::new(runner.clone())));
        let mut ctx = ExecutionContext::new("e1", CancellationToken::new());
        ctx.dry_run = true;

        let result = executor.execute(&safari_capability(), &BTreeMap::new(), ctx).await;
        assert_eq!(result.status, ExecutionStatus::PreflightFailed);
        assert_eq!(runner.spawn_count(), 0);
    }
}
