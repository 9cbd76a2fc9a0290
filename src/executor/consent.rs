use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::elevated::{ElevationDecision, ElevationRequest, PrivilegeElevationProvider};
use crate::catalog::template::CommandLine;
use crate::events::{EngineEvent, EventBus};
use crate::process::RunOutcome;

/// Puts an explicit user confirmation in front of another provider.
///
/// `authorize` publishes an [`EngineEvent::ElevationPrompt`] and waits for the
/// UI to call [`respond`](Self::respond) with the prompt's request id. No
/// answer within the timeout counts as a denial.
pub struct ConsentElevationProvider {
    inner: Arc<dyn PrivilegeElevationProvider>,
    events: EventBus,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    timeout: Duration,
}

impl ConsentElevationProvider {
    pub fn new(inner: Arc<dyn PrivilegeElevationProvider>, events: EventBus, timeout: Duration) -> Self {
        Self {
            inner,
            events,
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Deliver the user's answer. Returns `true` if the prompt was still waiting.
    pub fn respond(&self, request_id: &str, approved: bool) -> bool {
        let tx = self.lock().remove(request_id);
        match tx {
            Some(sender) => sender.send(approved).is_ok(),
            None => false,
        }
    }

    pub fn pending_requests(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<bool>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PrivilegeElevationProvider for ConsentElevationProvider {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn authorize(&self, request: &ElevationRequest, cancel: &CancellationToken) -> ElevationDecision {
        let (tx, rx) = oneshot::channel();
        let request_id = uuid::Uuid::new_v4().to_string();
        self.lock().insert(request_id.clone(), tx);

        self.events.emit(EngineEvent::ElevationPrompt {
            request_id: request_id.clone(),
            execution_id: request.execution_id.clone(),
            capability_id: request.capability_id.clone(),
            capability_title: request.capability_title.clone(),
            command: request.command.clone(),
        });

        let answer = tokio::select! {
            answer = tokio::time::timeout(self.timeout, rx) => match answer {
                Ok(Ok(approved)) => Some(approved),
                Ok(Err(_)) => Some(false),
                Err(_) => {
                    log::warn!("Elevation prompt for {} timed out", request.capability_id);
                    Some(false)
                }
            },
            _ = cancel.cancelled() => None,
        };

        // Timeout or cancellation leaves the sender behind
        self.lock().remove(&request_id);

        match answer {
            Some(true) => self.inner.authorize(request, cancel).await,
            Some(false) => ElevationDecision::Denied,
            None => ElevationDecision::Cancelled,
        }
    }

    fn wrap(&self, command: CommandLine) -> CommandLine {
        self.inner.wrap(command)
    }

    fn classify_exit(&self, outcome: &RunOutcome) -> Option<ElevationDecision> {
        self.inner.classify_exit(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RiskLevel;
    use crate::executor::elevated::tests::FixedProvider;

    fn request() -> ElevationRequest {
        ElevationRequest {
            execution_id: "e1".into(),
            capability_id: "dns.flush".into(),
            capability_title: "Flush DNS".into(),
            risk: RiskLevel::Moderate,
            command: "dscacheutil -flushcache".into(),
        }
    }

    fn consent(timeout: Duration) -> (Arc<ConsentElevationProvider>, EventBus) {
        let bus = EventBus::new(8);
        let provider = ConsentElevationProvider::new(
            Arc::new(FixedProvider::new(ElevationDecision::Granted)),
            bus.clone(),
            timeout,
        );
        (Arc::new(provider), bus)
    }

    async fn prompt_id(bus_rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> String {
        match bus_rx.recv().await.unwrap() {
            EngineEvent::ElevationPrompt { request_id, capability_id, .. } => {
                assert_eq!(capability_id, "dns.flush");
                request_id
            }
            other => panic!("expected prompt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn approval_defers_to_inner_provider() {
        let (provider, bus) = consent(Duration::from_secs(5));
        let mut rx = bus.subscribe();

        let task = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.authorize(&request(), &CancellationToken::new()).await })
        };
        let id = prompt_id(&mut rx).await;
        assert!(provider.respond(&id, true));
        assert_eq!(task.await.unwrap(), ElevationDecision::Granted);
        assert!(provider.pending_requests().is_empty());
        assert!(!provider.respond(&id, true));
    }

    #[tokio::test]
    async fn rejection_denies() {
        let (provider, bus) = consent(Duration::from_secs(5));
        let mut rx = bus.subscribe();
        let task = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.authorize(&request(), &CancellationToken::new()).await })
        };
        let id = prompt_id(&mut rx).await;
        provider.respond(&id, false);
        assert_eq!(task.await.unwrap(), ElevationDecision::Denied);
    }

    #[tokio::test]
    async fn unanswered_prompt_times_out_as_denied() {
        let (provider, _bus) = consent(Duration::from_millis(50));
        let decision = provider.authorize(&request(), &CancellationToken::new()).await;
        assert_eq!(decision, ElevationDecision::Denied);
        assert!(provider.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn cancellation_while_waiting() {
        let (provider, _bus) = consent(Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();
        let decision = provider.authorize(&request(), &token).await;
        assert_eq!(decision, ElevationDecision::Cancelled);
    }
}
