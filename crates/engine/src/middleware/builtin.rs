//! Middleware shipped with the engine.

use crate::error::{EngineError, WaitError};
use crate::events::EngineEventKind;
use crate::middleware::context::IterationContext;
use crate::middleware::pipeline::{Middleware, Next};
use async_trait::async_trait;
use std::time::Duration;

/// Iteration middleware that, on the final allowed iteration, asks the
/// caller whether the loop may continue past the cap.
///
/// Emits a `ContinuationRequest` and blocks on the coordinator for the
/// answer; no answer within the timeout counts as a refusal. The driver
/// reads `continuation_approved` after the iteration pipeline runs.
pub struct ContinuationPrompt {
    pub timeout: Duration,
}

impl Default for ContinuationPrompt {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl Middleware<IterationContext> for ContinuationPrompt {
    fn name(&self) -> &str {
        "continuation_prompt"
    }

    async fn invoke(
        &self,
        ctx: &mut IterationContext,
        next: Next<'_, IterationContext>,
    ) -> Result<(), EngineError> {
        if ctx.is_final_iteration && ctx.continuation_approved.is_none() {
            let request_id = uuid::Uuid::new_v4().to_string();
            ctx.coordinator.emit(EngineEventKind::ContinuationRequest {
                request_id: request_id.clone(),
                iteration: ctx.iteration,
            });

            let approved = match ctx
                .coordinator
                .wait_for_response::<crate::coordinator::ContinuationDecision>(
                    &request_id,
                    self.timeout,
                    &ctx.cancel,
                )
                .await
            {
                Ok(decision) => decision.approved,
                Err(WaitError::Timeout) => false,
                Err(WaitError::Cancelled | WaitError::Closed) => false,
                Err(err @ WaitError::TypeMismatch { .. }) => {
                    return Err(EngineError::Middleware(err.to_string()));
                }
            };

            ctx.coordinator.emit(EngineEventKind::ContinuationResponse {
                request_id,
                approved,
            });
            ctx.continuation_approved = Some(approved);
        }

        next.run(ctx).await
    }
}
