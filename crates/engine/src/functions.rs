//! The function-call processor.
//!
//! Takes the tool requests of one LLM response through permission gating,
//! container detection, and execution (sequential for a single call,
//! bounded-parallel otherwise), and aggregates the results into the tool
//! message for the next LLM call. Container results are reported separately
//! so the driver can keep them visible within the turn without persisting
//! them.

use crate::coordinator::EventCoordinator;
use crate::events::{ContainerKind, EngineEventKind};
use crate::middleware::{
    FunctionInvocationContext, FunctionPipeline, TerminalAction,
};
use crate::permission::{PermissionManager, PermissionVerdict};
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use turnloop::{AiFunction, ContentPart, FunctionCallRequest, Message, ToolMetadata};

/// Builds the per-execution lookup table: engine-configured tools first,
/// request-scope tools overriding on name collision. Rebuilt for every
/// execution so priority is deterministic and nothing is shared across runs.
pub fn build_function_map(
    engine_tools: &[Arc<dyn AiFunction>],
    request_tools: &[Arc<dyn AiFunction>],
) -> HashMap<String, Arc<dyn AiFunction>> {
    let mut map = HashMap::with_capacity(engine_tools.len() + request_tools.len());
    for tool in engine_tools {
        map.insert(tool.name().to_string(), tool.clone());
    }
    for tool in request_tools {
        map.insert(tool.name().to_string(), tool.clone());
    }
    map
}

/// Classifies a function result. Phrases are matched case-insensitively;
/// permission denials intentionally do not match (a denial is not a
/// failure).
pub fn is_successful_result(result: &Value, exception: Option<&str>) -> bool {
    if exception.is_some() {
        return false;
    }
    let text = match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let lower = text.to_lowercase();
    if lower.starts_with("error:") || lower.starts_with("failed:") {
        return false;
    }
    const FAILURE_PHRASES: &[&str] = &[
        "exception occurred",
        "unhandled exception",
        "exception was thrown",
        "rate limit exceeded",
        "rate limited",
        "quota exceeded",
        "quota reached",
        "timeout",
    ];
    !FAILURE_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// Outcome of one tool call.
#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub call_id: String,
    pub name: String,
    pub result: Value,
    pub exception: Option<String>,
    pub denied: bool,
    pub container: Option<ContainerKind>,
    /// Instructions a skill container injects once expanded.
    pub instructions: Option<String>,
    pub success: bool,
}

impl ExecutedCall {
    fn result_part(&self) -> ContentPart {
        ContentPart::FunctionResult {
            call_id: self.call_id.clone(),
            result: self.result.clone(),
            exception: self.exception.clone(),
        }
    }

    pub fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// An error for failure-counting purposes. Denials are not errors.
    pub fn is_error(&self) -> bool {
        !self.denied && !self.success
    }
}

/// Aggregated outcome of one batch of tool requests.
pub struct ProcessedCalls {
    /// Per-call outcomes, in request order.
    pub executed: Vec<ExecutedCall>,
    /// Tool message with container results removed; safe to persist.
    pub result_message: Message,
    /// Tool message including container results, for the LLM this turn.
    pub unfiltered_message: Message,
    pub plugin_expansions: Vec<String>,
    pub skill_expansions: Vec<String>,
    pub skill_instructions: Vec<(String, String)>,
    pub successful_functions: Vec<String>,
    pub had_errors: bool,
}

pub struct FunctionCallProcessor {
    retry: Arc<RetryExecutor>,
    permissions: Arc<PermissionManager>,
    pipeline: Arc<FunctionPipeline>,
    function_timeout: Option<Duration>,
    parallel_bound: usize,
}

impl FunctionCallProcessor {
    pub fn new(
        retry: Arc<RetryExecutor>,
        permissions: Arc<PermissionManager>,
        pipeline: Arc<FunctionPipeline>,
        function_timeout: Option<Duration>,
        parallel_bound: usize,
    ) -> Self {
        Self {
            retry,
            permissions,
            pipeline,
            function_timeout,
            parallel_bound: parallel_bound.max(1),
        }
    }

    /// Executes a batch of tool requests and aggregates their results.
    #[instrument(name = "engine.tool_batch", skip_all, fields(request_count = requests.len()))]
    pub async fn execute(
        &self,
        requests: &[FunctionCallRequest],
        functions: &HashMap<String, Arc<dyn AiFunction>>,
        iteration: u32,
        coordinator: &Arc<EventCoordinator>,
        cancel: &CancellationToken,
    ) -> ProcessedCalls {
        let metadata: Vec<ToolMetadata> = requests
            .iter()
            .map(|request| {
                functions
                    .get(&request.name)
                    .map(|f| f.metadata())
                    .unwrap_or_default()
            })
            .collect();

        let verdicts = self
            .gate(requests, &metadata, iteration, coordinator, cancel)
            .await;

        let executed = if requests.len() > 1 {
            coordinator.emit(EngineEventKind::ParallelToolExecution {
                call_count: requests.len(),
                max_parallel: self.parallel_bound,
            });
            self.execute_parallel(
                requests, &metadata, &verdicts, functions, iteration, coordinator, cancel,
            )
            .await
        } else {
            self.execute_sequential(
                requests, &metadata, &verdicts, functions, iteration, coordinator, cancel,
            )
            .await
        };

        aggregate(executed)
    }

    async fn gate(
        &self,
        requests: &[FunctionCallRequest],
        metadata: &[ToolMetadata],
        iteration: u32,
        coordinator: &Arc<EventCoordinator>,
        cancel: &CancellationToken,
    ) -> Vec<PermissionVerdict> {
        if requests.len() > 1 {
            let batch: Vec<(FunctionCallRequest, ToolMetadata)> = requests
                .iter()
                .cloned()
                .zip(metadata.iter().cloned())
                .collect();
            match self
                .permissions
                .check_all(&batch, iteration, coordinator, cancel)
                .await
            {
                Ok(verdicts) => verdicts,
                Err(err) => {
                    log::warn!("batch permission check failed: {err}");
                    vec![PermissionVerdict::denied(err.to_string()); requests.len()]
                }
            }
        } else {
            let mut verdicts = Vec::with_capacity(requests.len());
            for (request, meta) in requests.iter().zip(metadata) {
                let verdict = match self
                    .permissions
                    .check(request, meta, iteration, coordinator, cancel)
                    .await
                {
                    Ok(verdict) => verdict,
                    Err(err) => PermissionVerdict::denied(err.to_string()),
                };
                verdicts.push(verdict);
            }
            verdicts
        }
    }

    async fn execute_sequential(
        &self,
        requests: &[FunctionCallRequest],
        metadata: &[ToolMetadata],
        verdicts: &[PermissionVerdict],
        functions: &HashMap<String, Arc<dyn AiFunction>>,
        iteration: u32,
        coordinator: &Arc<EventCoordinator>,
        cancel: &CancellationToken,
    ) -> Vec<ExecutedCall> {
        let mut executed = Vec::with_capacity(requests.len());
        for ((request, meta), verdict) in requests.iter().zip(metadata).zip(verdicts) {
            executed.push(
                self.run_one(
                    request.clone(),
                    meta.clone(),
                    verdict.clone(),
                    functions.get(&request.name).cloned(),
                    iteration,
                    coordinator.clone(),
                    cancel.clone(),
                )
                .await,
            );
        }
        executed
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_parallel(
        &self,
        requests: &[FunctionCallRequest],
        metadata: &[ToolMetadata],
        verdicts: &[PermissionVerdict],
        functions: &HashMap<String, Arc<dyn AiFunction>>,
        iteration: u32,
        coordinator: &Arc<EventCoordinator>,
        cancel: &CancellationToken,
    ) -> Vec<ExecutedCall> {
        let semaphore = Arc::new(Semaphore::new(self.parallel_bound));
        let mut tasks = Vec::with_capacity(requests.len());

        for ((request, meta), verdict) in requests.iter().zip(metadata).zip(verdicts) {
            let semaphore = semaphore.clone();
            let retry = self.retry.clone();
            let pipeline = self.pipeline.clone();
            let function = functions.get(&request.name).cloned();
            let request = request.clone();
            let meta = meta.clone();
            let verdict = verdict.clone();
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            let timeout = self.function_timeout;

            tasks.push(tokio::spawn(async move {
                // Closed semaphore never happens here; fall through and run.
                let _permit = semaphore.acquire_owned().await;
                run_call(
                    retry, pipeline, request, meta, verdict, function, iteration, coordinator,
                    cancel, timeout,
                )
                .await
            }));
        }

        // Await in request order so history serialization stays aligned
        // with the model's call order.
        let mut executed = Vec::with_capacity(requests.len());
        for (task, request) in tasks.into_iter().zip(requests) {
            let call = match task.await {
                Ok(call) => call,
                Err(join_err) => ExecutedCall {
                    call_id: request.call_id.clone(),
                    name: request.name.clone(),
                    result: Value::String(format!("Error: tool execution panicked: {join_err}")),
                    exception: Some(format!("tool execution panicked: {join_err}")),
                    denied: false,
                    container: None,
                    instructions: None,
                    success: false,
                },
            };
            executed.push(call);
        }
        executed
    }

    async fn run_one(
        &self,
        request: FunctionCallRequest,
        metadata: ToolMetadata,
        verdict: PermissionVerdict,
        function: Option<Arc<dyn AiFunction>>,
        iteration: u32,
        coordinator: Arc<EventCoordinator>,
        cancel: CancellationToken,
    ) -> ExecutedCall {
        run_call(
            self.retry.clone(),
            self.pipeline.clone(),
            request,
            metadata,
            verdict,
            function,
            iteration,
            coordinator,
            cancel,
            self.function_timeout,
        )
        .await
    }
}

struct RetryInvokeTerminal {
    retry: Arc<RetryExecutor>,
    function: Arc<dyn AiFunction>,
    timeout: Option<Duration>,
    coordinator: Arc<EventCoordinator>,
}

#[async_trait]
impl TerminalAction<FunctionInvocationContext> for RetryInvokeTerminal {
    async fn run(&self, ctx: &mut FunctionInvocationContext) -> Result<(), crate::error::EngineError> {
        match self
            .retry
            .invoke(
                self.function.as_ref(),
                ctx.request.arguments.clone(),
                self.timeout,
                &ctx.cancel,
                Some(&self.coordinator),
            )
            .await
        {
            Ok(value) => {
                ctx.result = Some(value);
            }
            Err(err) => {
                ctx.result = Some(Value::String(format!("Error: {err}")));
                ctx.exception = Some(err.to_string());
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_call(
    retry: Arc<RetryExecutor>,
    pipeline: Arc<FunctionPipeline>,
    request: FunctionCallRequest,
    metadata: ToolMetadata,
    verdict: PermissionVerdict,
    function: Option<Arc<dyn AiFunction>>,
    iteration: u32,
    coordinator: Arc<EventCoordinator>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> ExecutedCall {
    let container = if metadata.is_container {
        Some(if metadata.is_skill {
            ContainerKind::Skill
        } else {
            ContainerKind::Plugin
        })
    } else {
        None
    };
    let instructions = metadata.instructions.clone();

    if !verdict.approved {
        let reason = verdict
            .reason
            .unwrap_or_else(|| "permission denied".to_string());
        return ExecutedCall {
            call_id: request.call_id.clone(),
            name: request.name.clone(),
            result: Value::String(format!("Execution denied: {reason}")),
            exception: None,
            denied: true,
            container,
            instructions,
            success: false,
        };
    }

    let Some(function) = function else {
        return ExecutedCall {
            call_id: request.call_id.clone(),
            name: request.name.clone(),
            result: Value::String(format!("Error: unknown tool '{}'", request.name)),
            exception: Some(format!("unknown tool '{}'", request.name)),
            denied: false,
            container,
            instructions,
            success: false,
        };
    };

    let mut ctx = FunctionInvocationContext::new(
        request.clone(),
        metadata,
        iteration,
        coordinator.clone(),
        cancel,
    );
    let terminal = RetryInvokeTerminal {
        retry,
        function,
        timeout,
        coordinator,
    };

    let (result, exception) = match pipeline.run(&mut ctx, &terminal).await {
        Ok(()) => {
            let exception = ctx.exception.take();
            let result = ctx
                .result
                .take()
                .unwrap_or_else(|| Value::String("Error: tool produced no result".to_string()));
            (result, exception)
        }
        Err(err) => (
            Value::String(format!("Error: {err}")),
            Some(err.to_string()),
        ),
    };

    let success = is_successful_result(&result, exception.as_deref());
    ExecutedCall {
        call_id: request.call_id,
        name: request.name,
        result,
        exception,
        denied: false,
        container,
        instructions,
        success,
    }
}

fn aggregate(executed: Vec<ExecutedCall>) -> ProcessedCalls {
    let mut filtered_parts = Vec::new();
    let mut unfiltered_parts = Vec::new();
    let mut plugin_expansions = Vec::new();
    let mut skill_expansions = Vec::new();
    let mut skill_instructions = Vec::new();
    let mut successful_functions = Vec::new();
    let mut had_errors = false;

    for call in &executed {
        let part = call.result_part();
        unfiltered_parts.push(part.clone());
        if call.container.is_none() {
            filtered_parts.push(part);
        }
        if call.is_error() {
            had_errors = true;
        }
        if call.success {
            successful_functions.push(call.name.clone());
            match call.container {
                Some(ContainerKind::Plugin) => plugin_expansions.push(call.name.clone()),
                Some(ContainerKind::Skill) => {
                    skill_expansions.push(call.name.clone());
                    if let Some(instructions) = &call.instructions {
                        skill_instructions.push((call.name.clone(), instructions.clone()));
                    }
                }
                None => {}
            }
        }
    }

    ProcessedCalls {
        result_message: Message::tool(filtered_parts),
        unfiltered_message: Message::tool(unfiltered_parts),
        plugin_expansions,
        skill_expansions,
        skill_instructions,
        successful_functions,
        had_errors,
        executed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::middleware::Pipeline;
    use serde_json::{Map, json};

    struct StaticTool {
        name: &'static str,
        result: Value,
        metadata: ToolMetadata,
    }

    #[async_trait]
    impl AiFunction for StaticTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "static"
        }

        fn metadata(&self) -> ToolMetadata {
            self.metadata.clone()
        }

        async fn invoke(
            &self,
            _arguments: Map<String, Value>,
            _cancel: CancellationToken,
        ) -> Result<Value, turnloop::ToolError> {
            Ok(self.result.clone())
        }
    }

    fn processor(bound: usize) -> FunctionCallProcessor {
        FunctionCallProcessor::new(
            Arc::new(RetryExecutor::new(RetryPolicy {
                max_retries: 0,
                ..Default::default()
            })),
            Arc::new(PermissionManager::new(None)),
            Arc::new(Pipeline::empty()),
            None,
            bound,
        )
    }

    fn request(call_id: &str, name: &str) -> FunctionCallRequest {
        FunctionCallRequest {
            call_id: call_id.into(),
            name: name.into(),
            arguments: Map::new(),
        }
    }

    fn tool(name: &'static str, result: Value) -> Arc<dyn AiFunction> {
        Arc::new(StaticTool {
            name,
            result,
            metadata: ToolMetadata::default(),
        })
    }

    // ── Classification ─────────────────────────────────────────────────────

    #[test]
    fn classification_rejects_error_prefixes_and_phrases() {
        assert!(is_successful_result(&json!("12:00"), None));
        assert!(!is_successful_result(&json!("Error: nope"), None));
        assert!(!is_successful_result(&json!("FAILED: nope"), None));
        assert!(!is_successful_result(&json!("Rate Limit Exceeded"), None));
        assert!(!is_successful_result(&json!("operation timeout reached"), None));
        assert!(!is_successful_result(&json!("ok"), Some("boom")));
        // A denial string is not a failure.
        assert!(is_successful_result(&json!("Execution denied: nope"), None));
    }

    // ── Function map priority ──────────────────────────────────────────────

    #[tokio::test]
    async fn request_scope_tools_override_engine_tools() {
        let engine = vec![tool("now", json!("engine"))];
        let request_scope = vec![tool("now", json!("request"))];
        let map = build_function_map(&engine, &request_scope);
        assert_eq!(map.len(), 1);
        let chosen = map.get("now").unwrap();
        let out = chosen
            .invoke(Map::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!("request"));
    }

    // ── Execution paths ────────────────────────────────────────────────────

    #[tokio::test]
    async fn single_call_executes_sequentially() {
        let (coordinator, mut rx) = EventCoordinator::new("run-1");
        let map = build_function_map(&[tool("now", json!("12:00"))], &[]);
        let processed = processor(4)
            .execute(
                &[request("c1", "now")],
                &map,
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(processed.executed.len(), 1);
        assert!(processed.executed[0].success);
        assert_eq!(processed.successful_functions, vec!["now".to_string()]);
        assert!(!processed.had_errors);
        assert_eq!(processed.result_message.contents.len(), 1);

        // No ParallelToolExecution event on the sequential path.
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(
                event.kind,
                EngineEventKind::ParallelToolExecution { .. }
            ));
        }
    }

    #[tokio::test]
    async fn parallel_results_preserve_request_order() {
        let (coordinator, mut rx) = EventCoordinator::new("run-1");
        let map = build_function_map(
            &[
                tool("alpha", json!("a")),
                tool("beta", json!("b")),
                tool("gamma", json!("c")),
            ],
            &[],
        );
        let requests = vec![
            request("c1", "alpha"),
            request("c2", "beta"),
            request("c3", "gamma"),
        ];
        let processed = processor(2)
            .execute(&requests, &map, 0, &coordinator, &CancellationToken::new())
            .await;

        let ids: Vec<&str> = processed
            .executed
            .iter()
            .map(|c| c.call_id.as_str())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);

        let mut saw_parallel = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEventKind::ParallelToolExecution {
                call_count,
                max_parallel,
            } = event.kind
            {
                saw_parallel = true;
                assert_eq!(call_count, 3);
                assert_eq!(max_parallel, 2);
            }
        }
        assert!(saw_parallel);
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result() {
        let (coordinator, _rx) = EventCoordinator::new("run-1");
        let map = build_function_map(&[], &[]);
        let processed = processor(4)
            .execute(
                &[request("c1", "mystery")],
                &map,
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await;
        assert!(processed.had_errors);
        assert!(processed.executed[0].result_text().contains("unknown tool"));
        assert!(processed.executed[0].exception.is_some());
    }

    #[tokio::test]
    async fn gated_tool_without_permission_middleware_is_denied() {
        let (coordinator, _rx) = EventCoordinator::new("run-1");
        let gated: Arc<dyn AiFunction> = Arc::new(StaticTool {
            name: "delete_all",
            result: json!("gone"),
            metadata: ToolMetadata {
                requires_permission: true,
                ..Default::default()
            },
        });
        let map = build_function_map(&[gated], &[]);
        let processed = processor(4)
            .execute(
                &[request("c1", "delete_all")],
                &map,
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await;

        let call = &processed.executed[0];
        assert!(call.denied);
        assert!(call.result_text().starts_with("Execution denied:"));
        assert!(call.result_text().contains("No permission middleware"));
        // A denial is not an execution error.
        assert!(!processed.had_errors);
        assert!(processed.successful_functions.is_empty());
    }

    #[tokio::test]
    async fn container_results_are_filtered_from_persistable_message() {
        let (coordinator, _rx) = EventCoordinator::new("run-1");
        let container: Arc<dyn AiFunction> = Arc::new(StaticTool {
            name: "web_plugin",
            result: json!("tools: search, fetch"),
            metadata: ToolMetadata {
                is_container: true,
                ..Default::default()
            },
        });
        let map = build_function_map(&[container, tool("now", json!("12:00"))], &[]);
        let requests = vec![request("c1", "web_plugin"), request("c2", "now")];
        let processed = processor(4)
            .execute(&requests, &map, 0, &coordinator, &CancellationToken::new())
            .await;

        assert_eq!(processed.unfiltered_message.contents.len(), 2);
        assert_eq!(processed.result_message.contents.len(), 1);
        assert_eq!(processed.plugin_expansions, vec!["web_plugin".to_string()]);
        match &processed.result_message.contents[0] {
            ContentPart::FunctionResult { call_id, .. } => assert_eq!(call_id, "c2"),
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[tokio::test]
    async fn skill_container_reports_skill_expansion() {
        let (coordinator, _rx) = EventCoordinator::new("run-1");
        let skill: Arc<dyn AiFunction> = Arc::new(StaticTool {
            name: "research_skill",
            result: json!("expanded"),
            metadata: ToolMetadata {
                is_container: true,
                is_skill: true,
                ..Default::default()
            },
        });
        let map = build_function_map(&[skill], &[]);
        let processed = processor(4)
            .execute(
                &[request("c1", "research_skill")],
                &map,
                0,
                &coordinator,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(processed.skill_expansions, vec!["research_skill".to_string()]);
        assert!(processed.plugin_expansions.is_empty());
        assert!(processed.result_message.contents.is_empty());
    }
}
