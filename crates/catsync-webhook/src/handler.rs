//! The capability set every webhook handler variant implements, and the
//! explicit outcome a handler run produces.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{AppConfig, ResourceConfig, WebhookEvent, WebhookEventRawResults};
use catsync_storage::BackoffPolicy;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient failure the handler asks to be retried.
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("circuit breaker {0} is open")]
    CircuitOpen(String),
    #[error("webhook authentication failed")]
    AuthenticationFailed,
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `should_process_event` declined the event.
    NotApplicable,
    InvalidPayload,
    NoMatchingKinds,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NotApplicable => "event not applicable to handler",
            Self::InvalidPayload => "payload failed validation",
            Self::NoMatchingKinds => "no configured resource matches the event kinds",
        })
    }
}

/// What one handler made of one event. The worker chooses how to log and
/// what to sync from the variant alone.
#[derive(Debug)]
pub enum ProcessingOutcome {
    Skip(SkipReason),
    Process(Vec<(ResourceConfig, WebhookEventRawResults)>),
    Fault(HandlerError),
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Header or token checks that need no access to the raw body.
    async fn authenticate(&self, _payload: &JsonValue, _headers: &BTreeMap<String, String>) -> bool {
        true
    }

    async fn should_process_event(&self, event: &WebhookEvent) -> bool;

    async fn validate_payload(&self, payload: &JsonValue) -> bool;

    async fn get_matching_kinds(&self, event: &WebhookEvent) -> Vec<String>;

    async fn handle_event(
        &self,
        payload: &JsonValue,
        resource: &ResourceConfig,
    ) -> Result<WebhookEventRawResults, HandlerError>;

    async fn before_processing(&self, _event: &WebhookEvent) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn after_processing(&self, _event: &WebhookEvent, _outcome: &ProcessingOutcome) {}

    /// Applies to [`HandlerError::Retryable`] only.
    fn retry_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Builds a fresh handler for each event arriving on a path.
pub trait HandlerFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, event: &WebhookEvent) -> Box<dyn WebhookHandler>;
}

/// Runs the full handler contract for one event against the resources of
/// `config`.
pub async fn run_handler(
    handler: &dyn WebhookHandler,
    event: &WebhookEvent,
    config: &AppConfig,
) -> ProcessingOutcome {
    if !handler.should_process_event(event).await {
        return ProcessingOutcome::Skip(SkipReason::NotApplicable);
    }
    let payload = event.payload();
    if !handler.authenticate(payload, event.headers()).await {
        return ProcessingOutcome::Fault(HandlerError::AuthenticationFailed);
    }
    if !handler.validate_payload(payload).await {
        return ProcessingOutcome::Skip(SkipReason::InvalidPayload);
    }
    let kinds = handler.get_matching_kinds(event).await;
    let resources: Vec<&ResourceConfig> = config
        .resources
        .iter()
        .filter(|r| kinds.iter().any(|k| *k == r.kind))
        .collect();
    if resources.is_empty() {
        return ProcessingOutcome::Skip(SkipReason::NoMatchingKinds);
    }
    if let Err(err) = handler.before_processing(event).await {
        return ProcessingOutcome::Fault(err);
    }

    let mut results = Vec::with_capacity(resources.len());
    let mut outcome = None;
    for resource in resources {
        match handle_with_retry(handler, payload, resource).await {
            Ok(raw) => results.push((resource.clone(), raw)),
            Err(err) => {
                outcome = Some(ProcessingOutcome::Fault(err));
                break;
            }
        }
    }
    let outcome = outcome.unwrap_or(ProcessingOutcome::Process(results));
    handler.after_processing(event, &outcome).await;
    outcome
}

async fn handle_with_retry(
    handler: &dyn WebhookHandler,
    payload: &JsonValue,
    resource: &ResourceConfig,
) -> Result<WebhookEventRawResults, HandlerError> {
    let policy = handler.retry_policy();
    let mut attempt = 0;
    loop {
        match handler.handle_event(payload, resource).await {
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(kind = %resource.kind, attempt, ?delay, error = %err, "retrying webhook handler");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        accept: bool,
        authenticated: bool,
        valid: bool,
        failures_before_success: usize,
        retryable: bool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok() -> Self {
            Self {
                accept: true,
                authenticated: true,
                valid: true,
                failures_before_success: 0,
                retryable: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl WebhookHandler for Scripted {
        async fn authenticate(&self, _payload: &JsonValue, _headers: &BTreeMap<String, String>) -> bool {
            self.authenticated
        }

        async fn should_process_event(&self, _event: &WebhookEvent) -> bool {
            self.accept
        }

        async fn validate_payload(&self, _payload: &JsonValue) -> bool {
            self.valid
        }

        async fn get_matching_kinds(&self, _event: &WebhookEvent) -> Vec<String> {
            vec!["issue".into()]
        }

        async fn handle_event(
            &self,
            payload: &JsonValue,
            _resource: &ResourceConfig,
        ) -> Result<WebhookEventRawResults, HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(if self.retryable {
                    HandlerError::Retryable("throttled".into())
                } else {
                    HandlerError::Message("broken".into())
                });
            }
            Ok(WebhookEventRawResults::updated(vec![payload.clone()]))
        }

        fn retry_policy(&self) -> BackoffPolicy {
            BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            }
        }
    }

    fn config() -> AppConfig {
        AppConfig::from_yaml_str(
            r#"
resources:
  - kind: issue
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"issue"'
  - kind: repo
    port:
      entity:
        mappings:
          identifier: .id
          blueprint: '"repo"'
"#,
            "test",
        )
        .expect("config")
    }

    fn event() -> WebhookEvent {
        WebhookEvent::new(json!({"id": "1"}), BTreeMap::new())
    }

    #[tokio::test]
    async fn processes_matching_resources_only() {
        let handler = Scripted::ok();
        match run_handler(&handler, &event(), &config()).await {
            ProcessingOutcome::Process(results) => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].0.kind, "issue");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn declined_event_never_reaches_handle_event() {
        let handler = Scripted {
            accept: false,
            ..Scripted::ok()
        };
        let outcome = run_handler(&handler, &event(), &config()).await;
        assert!(matches!(outcome, ProcessingOutcome::Skip(SkipReason::NotApplicable)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn authentication_failure_is_a_fault_and_validation_failure_a_skip() {
        let unauthenticated = Scripted {
            authenticated: false,
            ..Scripted::ok()
        };
        assert!(matches!(
            run_handler(&unauthenticated, &event(), &config()).await,
            ProcessingOutcome::Fault(HandlerError::AuthenticationFailed)
        ));

        let invalid = Scripted {
            valid: false,
            ..Scripted::ok()
        };
        assert!(matches!(
            run_handler(&invalid, &event(), &config()).await,
            ProcessingOutcome::Skip(SkipReason::InvalidPayload)
        ));
    }

    #[tokio::test]
    async fn retryable_errors_are_retried() {
        let handler = Scripted {
            failures_before_success: 2,
            ..Scripted::ok()
        };
        let outcome = run_handler(&handler, &event(), &config()).await;
        assert!(matches!(outcome, ProcessingOutcome::Process(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_the_limit() {
        let handler = Scripted {
            failures_before_success: 10,
            ..Scripted::ok()
        };
        let outcome = run_handler(&handler, &event(), &config()).await;
        assert!(matches!(outcome, ProcessingOutcome::Fault(HandlerError::Retryable(_))));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let handler = Scripted {
            failures_before_success: 1,
            retryable: false,
            ..Scripted::ok()
        };
        let outcome = run_handler(&handler, &event(), &config()).await;
        assert!(matches!(outcome, ProcessingOutcome::Fault(HandlerError::Message(_))));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
