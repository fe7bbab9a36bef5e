//! Permission gating for tool execution.
//!
//! Policy: functions that do not declare `requires_permission` are
//! auto-approved; functions that declare it but run in an engine with no
//! permission pipeline are denied outright; everything else is decided by
//! the permission pipeline. A denial is a result string on the function
//! call, never an error.

use crate::coordinator::{EventCoordinator, PermissionDecision};
use crate::error::{EngineError, WaitError};
use crate::events::EngineEventKind;
use crate::middleware::{
    FunctionInvocationContext, Middleware, Next, NoopTerminal, PermissionPipeline,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use turnloop::{FunctionCallRequest, ToolMetadata};

pub const NO_PERMISSION_MIDDLEWARE: &str = "No permission middleware configured";

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionVerdict {
    pub approved: bool,
    pub reason: Option<String>,
}

impl PermissionVerdict {
    pub fn approved() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct PermissionManager {
    pipeline: Option<Arc<PermissionPipeline>>,
}

impl PermissionManager {
    pub fn new(pipeline: Option<Arc<PermissionPipeline>>) -> Self {
        Self { pipeline }
    }

    pub fn has_pipeline(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Checks a single request. Emits a `PermissionCheck` event either way.
    pub async fn check(
        &self,
        request: &FunctionCallRequest,
        metadata: &ToolMetadata,
        iteration: u32,
        coordinator: &Arc<EventCoordinator>,
        cancel: &CancellationToken,
    ) -> Result<PermissionVerdict, EngineError> {
        let verdict = self
            .evaluate(request, metadata, iteration, coordinator, cancel)
            .await?;
        coordinator.emit(EngineEventKind::PermissionCheck {
            tool_name: request.name.clone(),
            call_id: request.call_id.clone(),
            is_approved: verdict.approved,
            denial_reason: verdict.reason.clone(),
        });
        Ok(verdict)
    }

    /// Checks a batch of requests; verdicts align with the input order.
    pub async fn check_all(
        &self,
        requests: &[(FunctionCallRequest, ToolMetadata)],
        iteration: u32,
        coordinator: &Arc<EventCoordinator>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PermissionVerdict>, EngineError> {
        let mut verdicts = Vec::with_capacity(requests.len());
        for (request, metadata) in requests {
            verdicts.push(
                self.check(request, metadata, iteration, coordinator, cancel)
                    .await?,
            );
        }
        Ok(verdicts)
    }

    async fn evaluate(
        &self,
        request: &FunctionCallRequest,
        metadata: &ToolMetadata,
        iteration: u32,
        coordinator: &Arc<EventCoordinator>,
        cancel: &CancellationToken,
    ) -> Result<PermissionVerdict, EngineError> {
        if !metadata.requires_permission {
            return Ok(PermissionVerdict::approved());
        }

        let Some(pipeline) = &self.pipeline else {
            return Ok(PermissionVerdict::denied(NO_PERMISSION_MIDDLEWARE));
        };

        let mut ctx = FunctionInvocationContext::new(
            request.clone(),
            metadata.clone(),
            iteration,
            coordinator.clone(),
            cancel.clone(),
        );
        pipeline.run(&mut ctx, &NoopTerminal).await?;

        if ctx.is_terminated {
            let reason = ctx
                .result_text()
                .unwrap_or_else(|| "permission denied".to_string());
            Ok(PermissionVerdict::denied(reason))
        } else {
            Ok(PermissionVerdict::approved())
        }
    }
}

/// Permission middleware that defers to the caller through the event
/// channel: emits a `PermissionRequest` and waits for the matching
/// response. No answer within the timeout denies the call.
pub struct CoordinatorPermissionMiddleware {
    pub timeout: Duration,
}

impl Default for CoordinatorPermissionMiddleware {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl Middleware<FunctionInvocationContext> for CoordinatorPermissionMiddleware {
    fn name(&self) -> &str {
        "coordinator_permission"
    }

    async fn invoke(
        &self,
        ctx: &mut FunctionInvocationContext,
        next: Next<'_, FunctionInvocationContext>,
    ) -> Result<(), EngineError> {
        let permission_id = uuid::Uuid::new_v4().to_string();
        let arguments =
            serde_json::to_string(&ctx.request.arguments).unwrap_or_else(|_| "{}".to_string());
        ctx.coordinator.emit(EngineEventKind::PermissionRequest {
            permission_id: permission_id.clone(),
            call_id: ctx.request.call_id.clone(),
            tool_name: ctx.request.name.clone(),
            arguments,
        });

        let decision = ctx
            .coordinator
            .wait_for_response::<PermissionDecision>(&permission_id, self.timeout, &ctx.cancel)
            .await;

        match decision {
            Ok(decision) if decision.approved => {
                ctx.coordinator.emit(EngineEventKind::PermissionApproved {
                    permission_id,
                    tool_name: ctx.request.name.clone(),
                });
                next.run(ctx).await
            }
            Ok(decision) => {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "denied by caller".to_string());
                ctx.coordinator.emit(EngineEventKind::PermissionDenied {
                    permission_id,
                    tool_name: ctx.request.name.clone(),
                    reason: reason.clone(),
                });
                ctx.terminate(reason);
                Ok(())
            }
            Err(WaitError::Timeout) => {
                let reason = "permission request timed out".to_string();
                ctx.coordinator.emit(EngineEventKind::PermissionDenied {
                    permission_id,
                    tool_name: ctx.request.name.clone(),
                    reason: reason.clone(),
                });
                ctx.terminate(reason);
                Ok(())
            }
            Err(WaitError::Cancelled | WaitError::Closed) => {
                ctx.terminate("cancelled while awaiting permission");
                Ok(())
            }
            Err(err @ WaitError::TypeMismatch { .. }) => {
                Err(EngineError::Middleware(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ResponsePayload;
    use serde_json::Map;

    fn request(name: &str) -> FunctionCallRequest {
        FunctionCallRequest {
            call_id: "c1".into(),
            name: name.into(),
            arguments: Map::new(),
        }
    }

    fn gated() -> ToolMetadata {
        ToolMetadata {
            requires_permission: true,
            ..Default::default()
        }
    }

    // ── Policy ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ungated_functions_auto_approve() {
        let (coordinator, _rx) = EventCoordinator::new("run-1");
        let manager = PermissionManager::new(None);
        let verdict = manager
            .check(
                &request("now"),
                &ToolMetadata::default(),
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(verdict.approved);
    }

    #[tokio::test]
    async fn gated_function_without_pipeline_is_denied() {
        let (coordinator, mut rx) = EventCoordinator::new("run-1");
        let manager = PermissionManager::new(None);
        let verdict = manager
            .check(
                &request("delete_all"),
                &gated(),
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.reason.as_deref(), Some(NO_PERMISSION_MIDDLEWARE));

        // A PermissionCheck event was emitted with the denial reason.
        let event = rx.try_recv().unwrap();
        match event.kind {
            EngineEventKind::PermissionCheck {
                is_approved,
                denial_reason,
                ..
            } => {
                assert!(!is_approved);
                assert_eq!(denial_reason.as_deref(), Some(NO_PERMISSION_MIDDLEWARE));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    struct AlwaysDeny;

    #[async_trait]
    impl Middleware<FunctionInvocationContext> for AlwaysDeny {
        async fn invoke(
            &self,
            ctx: &mut FunctionInvocationContext,
            _next: Next<'_, FunctionInvocationContext>,
        ) -> Result<(), EngineError> {
            ctx.terminate("policy forbids this tool");
            Ok(())
        }
    }

    #[tokio::test]
    async fn terminated_pipeline_context_denies_with_its_reason() {
        let (coordinator, _rx) = EventCoordinator::new("run-1");
        let pipeline = Arc::new(PermissionPipeline::new(vec![
            Arc::new(AlwaysDeny) as Arc<dyn Middleware<FunctionInvocationContext>>,
        ]));
        let manager = PermissionManager::new(Some(pipeline));
        let verdict = manager
            .check(
                &request("delete_all"),
                &gated(),
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.reason.as_deref(), Some("policy forbids this tool"));
    }

    struct PassThrough;

    #[async_trait]
    impl Middleware<FunctionInvocationContext> for PassThrough {
        async fn invoke(
            &self,
            ctx: &mut FunctionInvocationContext,
            next: Next<'_, FunctionInvocationContext>,
        ) -> Result<(), EngineError> {
            next.run(ctx).await
        }
    }

    #[tokio::test]
    async fn pass_through_pipeline_approves() {
        let (coordinator, _rx) = EventCoordinator::new("run-1");
        let pipeline = Arc::new(PermissionPipeline::new(vec![
            Arc::new(PassThrough) as Arc<dyn Middleware<FunctionInvocationContext>>,
        ]));
        let manager = PermissionManager::new(Some(pipeline));
        let verdict = manager
            .check(
                &request("delete_all"),
                &gated(),
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(verdict.approved);
    }

    // ── CoordinatorPermissionMiddleware ────────────────────────────────────

    #[tokio::test]
    async fn coordinator_middleware_approves_on_response() {
        let (coordinator, mut rx) = EventCoordinator::new("run-1");
        let pipeline = Arc::new(PermissionPipeline::new(vec![Arc::new(
            CoordinatorPermissionMiddleware::default(),
        )
            as Arc<dyn Middleware<FunctionInvocationContext>>]));
        let manager = Arc::new(PermissionManager::new(Some(pipeline)));

        let responder = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                loop {
                    if let Ok(event) = rx.try_recv() {
                        if let EngineEventKind::PermissionRequest { permission_id, .. } = event.kind
                        {
                            coordinator.send_response(
                                &permission_id,
                                ResponsePayload::Permission(PermissionDecision {
                                    approved: true,
                                    reason: None,
                                }),
                            );
                            break;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let verdict = manager
            .check(
                &request("delete_all"),
                &gated(),
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        responder.await.unwrap();
        assert!(verdict.approved);
    }

    #[tokio::test]
    async fn coordinator_middleware_denies_on_timeout() {
        let (coordinator, _rx) = EventCoordinator::new("run-1");
        let pipeline = Arc::new(PermissionPipeline::new(vec![Arc::new(
            CoordinatorPermissionMiddleware {
                timeout: Duration::from_millis(20),
            },
        )
            as Arc<dyn Middleware<FunctionInvocationContext>>]));
        let manager = PermissionManager::new(Some(pipeline));

        let verdict = manager
            .check(
                &request("delete_all"),
                &gated(),
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!verdict.approved);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("permission request timed out")
        );
    }
}
