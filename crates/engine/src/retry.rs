//! Retry execution for tool invocations.
//!
//! Delay selection runs in priority order: a custom strategy (when
//! supplied), then the provider-aware error handler (category ceilings and
//! provider-suggested delays), then full-jitter exponential backoff. The
//! per-function timeout is layered inside the run's cancellation scope and
//! surfaces as a timeout error naming the function, never as a generic
//! cancellation.

use crate::config::RetryPolicy;
use crate::coordinator::EventCoordinator;
use crate::events::{EngineEventKind, RetryStatus};
use rand::Rng;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use turnloop::{AiFunction, ErrorCategory, ToolError};

/// Fully custom delay policy. Returning `None` stops retrying.
pub trait RetryDelayStrategy: Send + Sync {
    fn delay(&self, attempt: u32, error: &ToolError) -> Option<Duration>;
}

/// Provider-aware error interpretation for tool failures.
pub trait ProviderErrorHandler: Send + Sync {
    fn categorize(&self, error: &ToolError) -> ErrorCategory;

    /// Per-category retry ceiling; the overall `max_retries` still applies.
    fn max_retries_for(&self, _category: ErrorCategory) -> u32 {
        u32::MAX
    }

    /// Provider-suggested wait (e.g. a rate-limit retry-after), when known.
    fn retry_after(&self, _error: &ToolError) -> Option<Duration> {
        None
    }

    fn delay_for(&self, _category: ErrorCategory, attempt: u32, policy: &RetryPolicy) -> Duration {
        let ms = policy.base_delay.as_millis() as f64
            * policy.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(ms as u64).min(policy.max_delay)
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
    custom_strategy: Option<Arc<dyn RetryDelayStrategy>>,
    error_handler: Option<Arc<dyn ProviderErrorHandler>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            custom_strategy: None,
            error_handler: None,
        }
    }

    pub fn with_custom_strategy(mut self, strategy: Arc<dyn RetryDelayStrategy>) -> Self {
        self.custom_strategy = Some(strategy);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ProviderErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Invokes a tool, retrying per policy. The effective cancellation scope
    /// combines the run's token with the optional per-function timeout.
    #[instrument(name = "engine.tool.invoke", skip_all, fields(tool = %function.name()))]
    pub async fn invoke(
        &self,
        function: &dyn AiFunction,
        arguments: Map<String, Value>,
        function_timeout: Option<Duration>,
        cancel: &CancellationToken,
        coordinator: Option<&Arc<EventCoordinator>>,
    ) -> Result<Value, ToolError> {
        let name = function.name().to_string();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ToolError::Invocation(format!("{name} cancelled")));
            }

            let result = self
                .invoke_once(function, arguments.clone(), function_timeout, cancel, &name)
                .await?;
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= self.policy.max_retries {
                if let Some(coordinator) = coordinator {
                    coordinator.emit(EngineEventKind::Retry {
                        status: RetryStatus::Exhausted,
                        tool_name: name.clone(),
                        attempt: attempt + 1,
                        delay_ms: None,
                    });
                }
                return Err(wrap_exhausted(&name, attempt + 1, error));
            }

            let Some(delay) = self.delay_for(attempt, &error) else {
                return Err(error);
            };

            if let Some(coordinator) = coordinator {
                coordinator.emit(EngineEventKind::Retry {
                    status: RetryStatus::Attempting,
                    tool_name: name.clone(),
                    attempt: attempt + 1,
                    delay_ms: Some(delay.as_millis() as u64),
                });
            }
            log::debug!(
                "tool '{}' attempt {} failed, retrying in {:?}: {}",
                name,
                attempt + 1,
                delay,
                error
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ToolError::Invocation(format!("{name} cancelled during retry wait")));
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// One attempt under the effective cancellation scope. The outer `Result`
    /// is for aborts (cancellation) that must not be retried; the inner one
    /// is the attempt outcome.
    async fn invoke_once(
        &self,
        function: &dyn AiFunction,
        arguments: Map<String, Value>,
        function_timeout: Option<Duration>,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Result<Value, ToolError>, ToolError> {
        let scope = cancel.child_token();
        match function_timeout {
            Some(limit) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        scope.cancel();
                        Err(ToolError::Invocation(format!("{name} cancelled")))
                    }
                    _ = tokio::time::sleep(limit) => {
                        scope.cancel();
                        Ok(Err(ToolError::Timeout { tool: name.to_string() }))
                    }
                    outcome = function.invoke(arguments, scope.clone()) => Ok(outcome),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        scope.cancel();
                        Err(ToolError::Invocation(format!("{name} cancelled")))
                    }
                    outcome = function.invoke(arguments, scope.clone()) => Ok(outcome),
                }
            }
        }
    }

    fn delay_for(&self, attempt: u32, error: &ToolError) -> Option<Duration> {
        if let Some(strategy) = &self.custom_strategy {
            return strategy.delay(attempt, error);
        }

        if let Some(handler) = &self.error_handler {
            let category = handler.categorize(error);
            if !category.is_transient() {
                return None;
            }
            if attempt >= handler.max_retries_for(category) {
                return None;
            }
            if let Some(after) = handler.retry_after(error) {
                return Some(after.min(self.policy.max_delay));
            }
            return Some(handler.delay_for(category, attempt, &self.policy));
        }

        // Full jitter: uniform in [0, base × 2^attempt], capped.
        let ceiling_ms = (self.policy.base_delay.as_millis() as u64)
            .saturating_mul(1u64 << attempt.min(32))
            .min(self.policy.max_delay.as_millis() as u64);
        let jittered = rand::thread_rng().gen_range(0..=ceiling_ms);
        Some(Duration::from_millis(jittered))
    }
}

fn wrap_exhausted(name: &str, attempts: u32, error: ToolError) -> ToolError {
    match error {
        timeout @ ToolError::Timeout { .. } => timeout,
        other => ToolError::Invocation(format!("{name} failed after {attempts} attempts: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` invocations, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AiFunction for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "fails then succeeds"
        }

        async fn invoke(
            &self,
            _arguments: Map<String, Value>,
            _cancel: CancellationToken,
        ) -> Result<Value, ToolError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(ToolError::Invocation("transient".into()))
            } else {
                Ok(Value::String("ok".into()))
            }
        }
    }

    struct Hanging;

    #[async_trait]
    impl AiFunction for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        fn description(&self) -> &str {
            "never returns"
        }

        async fn invoke(
            &self,
            _arguments: Map<String, Value>,
            cancel: CancellationToken,
        ) -> Result<Value, ToolError> {
            cancel.cancelled().await;
            Err(ToolError::Invocation("cancelled".into()))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(fast_policy(3));
        let tool = Flaky::new(2);
        let out = executor
            .invoke(&tool, Map::new(), None, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(out, Value::String("ok".into()));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_wraps_with_name_and_attempts() {
        let executor = RetryExecutor::new(fast_policy(2));
        let tool = Flaky::new(10);
        let err = executor
            .invoke(&tool, Map::new(), None, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("flaky"));
        assert!(msg.contains("3 attempts"));
        // 1 initial + 2 retries
        assert_eq!(tool.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn function_timeout_raises_named_timeout() {
        let executor = RetryExecutor::new(fast_policy(0));
        let err = executor
            .invoke(
                &Hanging,
                Map::new(),
                Some(Duration::from_millis(10)),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { tool } if tool == "hanging"));
    }

    #[tokio::test]
    async fn outer_cancellation_is_not_a_timeout() {
        let executor = RetryExecutor::new(fast_policy(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .invoke(&Hanging, Map::new(), None, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Invocation(msg) if msg.contains("cancelled")));
    }

    struct NeverRetry;

    impl RetryDelayStrategy for NeverRetry {
        fn delay(&self, _attempt: u32, _error: &ToolError) -> Option<Duration> {
            None
        }
    }

    #[tokio::test]
    async fn custom_strategy_none_stops_retrying() {
        let executor =
            RetryExecutor::new(fast_policy(5)).with_custom_strategy(Arc::new(NeverRetry));
        let tool = Flaky::new(10);
        let err = executor
            .invoke(&tool, Map::new(), None, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Invocation(msg) if msg == "transient"));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    struct PermanentHandler;

    impl ProviderErrorHandler for PermanentHandler {
        fn categorize(&self, _error: &ToolError) -> ErrorCategory {
            ErrorCategory::Auth
        }
    }

    #[tokio::test]
    async fn permanent_categories_are_not_retried() {
        let executor =
            RetryExecutor::new(fast_policy(5)).with_error_handler(Arc::new(PermanentHandler));
        let tool = Flaky::new(10);
        let err = executor
            .invoke(&tool, Map::new(), None, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Invocation(_)));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    struct CeilingHandler;

    impl ProviderErrorHandler for CeilingHandler {
        fn categorize(&self, _error: &ToolError) -> ErrorCategory {
            ErrorCategory::Server
        }

        fn max_retries_for(&self, _category: ErrorCategory) -> u32 {
            1
        }

        fn delay_for(
            &self,
            _category: ErrorCategory,
            _attempt: u32,
            _policy: &RetryPolicy,
        ) -> Duration {
            Duration::from_millis(1)
        }
    }

    #[tokio::test]
    async fn per_category_ceiling_limits_retries() {
        let executor =
            RetryExecutor::new(fast_policy(5)).with_error_handler(Arc::new(CeilingHandler));
        let tool = Flaky::new(10);
        let _ = executor
            .invoke(&tool, Map::new(), None, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        // 1 initial + 1 allowed by the category ceiling.
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn full_jitter_stays_within_the_exponential_ceiling() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        });
        let error = ToolError::Invocation("x".into());
        for attempt in 0..5u32 {
            for _ in 0..50 {
                let delay = executor.delay_for(attempt, &error).unwrap();
                let ceiling = Duration::from_millis(100 * (1 << attempt));
                assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
            }
        }
    }

    #[test]
    fn full_jitter_is_capped_by_max_delay() {
        let executor = RetryExecutor::new(RetryPolicy {
            max_retries: 20,
            base_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(50),
        });
        let error = ToolError::Invocation("x".into());
        for _ in 0..50 {
            let delay = executor.delay_for(10, &error).unwrap();
            assert!(delay <= Duration::from_millis(50));
        }
    }
}
