//! Recording `ProcessRunner` for unit tests.
//!
//! Records every spawn request and replays scripted outcomes so executors and
//! the coordinator can be tested without starting real processes.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{OutputCallback, OutputChunk, OutputStream, ProcessRunner, RunOutcome, RunRequest};
use crate::error::{EngineError, EngineResult};

struct Inner {
    calls: Vec<RunRequest>,
    outcomes: VecDeque<RunOutcome>,
    delay: Option<Duration>,
    fail_spawn: bool,
}

pub struct MockRunner {
    inner: Mutex<Inner>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                calls: Vec::new(),
                outcomes: VecDeque::new(),
                delay: None,
                fail_spawn: false,
            }),
        }
    }

    /// Queue an outcome. Calls beyond the queue get a successful empty exit.
    pub fn with_outcome(self, outcome: RunOutcome) -> Self {
        self.inner.lock().unwrap().outcomes.push_back(outcome);
        self
    }

    /// Make every run take `delay`, honoring cancellation meanwhile.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap().delay = Some(delay);
        self
    }

    /// Make every spawn fail with `NotFound`.
    pub fn fail_spawn(self) -> Self {
        self.inner.lock().unwrap().fail_spawn = true;
        self
    }

    pub fn calls(&self) -> Vec<RunRequest> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        on_output: Option<OutputCallback>,
    ) -> EngineResult<RunOutcome> {
        if cancel.is_cancelled() {
            return Ok(RunOutcome::cancelled_before_start());
        }

        let (outcome, delay) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_spawn {
                return Err(EngineError::Spawn {
                    program: request.program,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            inner.calls.push(request);
            let outcome = inner
                .outcomes
                .pop_front()
                .unwrap_or_else(|| RunOutcome::exited(0, "", ""));
            (outcome, inner.delay)
        };

        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Ok(RunOutcome {
                        status: super::ProcessStatus::Cancelled,
                        exit_code: None,
                        pid: Some(4242),
                        ..RunOutcome::exited(0, "", "")
                    });
                }
            }
        }

        if let Some(cb) = on_output {
            if !outcome.stdout.is_empty() {
                cb(OutputChunk {
                    stream: OutputStream::Stdout,
                    text: outcome.stdout.clone(),
                });
            }
        }

        Ok(RunOutcome {
            pid: Some(4242),
            ..outcome
        })
    }
}
