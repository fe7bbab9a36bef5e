//! The agentic loop driver: the imperative shell that ties the decision
//! engine, turn preparation, function-call processor, coordinator,
//! middleware, and checkpointer together into a stream of events.
//!
//! `AgentEngine` is stateless; every `run` gets its own loop state, its own
//! coordinator, and its own output stream, so any number of concurrent runs
//! may share one engine instance.

use crate::checkpoint::{AgentThread, Checkpointer, ResumePlan, validate_resume};
use crate::config::{AgentConfiguration, CheckpointFrequency, EngineConfig};
use crate::coordinator::{EventCoordinator, ResponsePayload};
use crate::decision::{Decision, decide};
use crate::error::EngineError;
use crate::events::{
    CheckpointOp, ContainerKind, EngineEvent, EngineEventKind, EngineObserver, ReasoningPhase,
};
use crate::functions::{ExecutedCall, FunctionCallProcessor, build_function_map};
use crate::middleware::{
    FunctionInvocationContext, FunctionPipeline, IterationContext, IterationPipeline,
    IterationResponse, MessageTurnContext, MessageTurnPipeline, Middleware, NoopTerminal,
    PermissionPipeline, PromptContext, PromptPipeline, TerminalAction,
};
use crate::observer::{ObserverHealthConfig, ObserverSet};
use crate::permission::PermissionManager;
use crate::prepare::{PreparedTurn, TurnPreparer, inject_instructions, merge_options};
use crate::reduction::HistoryReducer;
use crate::retry::{ProviderErrorHandler, RetryDelayStrategy, RetryExecutor};
use crate::signature::call_signature;
use crate::state::{LoopState, PendingWrite, StateSource};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Map;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as TokioMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use turnloop::{
    AiFunction, ChatClient, ChatOptions, ContentPart, FunctionCallRequest, Message,
    ResponseStream, Role, ToolDescriptor,
};

/// Interval at which the driver polls the coordinator while awaiting
/// middleware or tool execution.
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// One run request.
pub struct RunRequest {
    pub messages: Vec<Message>,
    pub options: Option<ChatOptions>,
    pub thread: Option<Arc<TokioMutex<AgentThread>>>,
    /// Request-scope tools; override engine tools on name collision.
    pub tools: Vec<Arc<dyn AiFunction>>,
    pub cancel: Option<CancellationToken>,
    /// When this run is nested inside another engine's run, the parent's
    /// coordinator; events bubble up through it in real time.
    pub parent_coordinator: Option<Arc<EventCoordinator>>,
}

impl RunRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            options: None,
            thread: None,
            tools: Vec::new(),
            cancel: None,
            parent_coordinator: None,
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_thread(mut self, thread: Arc<TokioMutex<AgentThread>>) -> Self {
        self.thread = Some(thread);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn AiFunction>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_parent_coordinator(mut self, parent: Arc<EventCoordinator>) -> Self {
        self.parent_coordinator = Some(parent);
        self
    }
}

/// Final summary of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub termination_reason: String,
    pub iterations: u32,
    pub turn_history: Vec<Message>,
    pub state: LoopState,
}

/// Handle to an in-flight run: an event stream plus the bidirectional
/// response channel and cancellation.
pub struct ActiveRun {
    run_id: String,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    coordinator: Arc<EventCoordinator>,
    cancel: CancellationToken,
    outcome: JoinHandle<Result<RunOutcome, EngineError>>,
}

impl ActiveRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The run's coordinator; pass to a nested run's `RunRequest` to bubble
    /// its events into this one.
    pub fn coordinator(&self) -> Arc<EventCoordinator> {
        self.coordinator.clone()
    }

    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Delivers a response to a pending bidirectional request (permission,
    /// continuation, clarification).
    pub fn respond(&self, request_id: &str, payload: ResponsePayload) {
        self.coordinator.send_response(request_id, payload);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Awaits the final outcome, discarding any undrained events.
    pub async fn outcome(self) -> Result<RunOutcome, EngineError> {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(EngineError::Internal(format!("driver task failed: {join_err}"))),
        }
    }

    /// Drains every event, then awaits the outcome. Test convenience.
    pub async fn collect(mut self) -> (Vec<EngineEvent>, Result<RunOutcome, EngineError>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = match self.outcome.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(EngineError::Internal(format!("driver task failed: {join_err}"))),
        };
        (events, outcome)
    }
}

impl futures_util::Stream for ActiveRun {
    type Item = EngineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

struct EngineInner {
    client: Arc<dyn ChatClient>,
    tools: Vec<Arc<dyn AiFunction>>,
    config: EngineConfig,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    preparer: TurnPreparer,
    iteration_pipeline: Arc<IterationPipeline>,
    processor: FunctionCallProcessor,
    turn_pipeline: Arc<MessageTurnPipeline>,
    observers: ObserverSet,
}

/// The engine. Cheap to clone; all configuration is shared.
#[derive(Clone)]
pub struct AgentEngine {
    inner: Arc<EngineInner>,
}

pub struct AgentEngineBuilder {
    client: Option<Arc<dyn ChatClient>>,
    tools: Vec<Arc<dyn AiFunction>>,
    config: EngineConfig,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    reducer: Option<Arc<dyn HistoryReducer>>,
    prompt_middleware: Vec<Arc<dyn Middleware<PromptContext>>>,
    iteration_middleware: Vec<Arc<dyn Middleware<IterationContext>>>,
    function_middleware: Vec<Arc<dyn Middleware<FunctionInvocationContext>>>,
    permission_middleware: Vec<Arc<dyn Middleware<FunctionInvocationContext>>>,
    turn_middleware: Vec<Arc<dyn Middleware<MessageTurnContext>>>,
    observers: Vec<Arc<dyn EngineObserver>>,
    observer_health: ObserverHealthConfig,
    retry_strategy: Option<Arc<dyn RetryDelayStrategy>>,
    error_handler: Option<Arc<dyn ProviderErrorHandler>>,
}

impl AgentEngineBuilder {
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self {
            client: Some(client),
            tools: Vec::new(),
            config: EngineConfig::default(),
            checkpointer: None,
            reducer: None,
            prompt_middleware: Vec::new(),
            iteration_middleware: Vec::new(),
            function_middleware: Vec::new(),
            permission_middleware: Vec::new(),
            turn_middleware: Vec::new(),
            observers: Vec::new(),
            observer_health: ObserverHealthConfig::default(),
            retry_strategy: None,
            error_handler: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn AiFunction>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<Arc<dyn AiFunction>>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn reducer(mut self, reducer: Arc<dyn HistoryReducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn prompt_middleware(mut self, middleware: Arc<dyn Middleware<PromptContext>>) -> Self {
        self.prompt_middleware.push(middleware);
        self
    }

    pub fn iteration_middleware(
        mut self,
        middleware: Arc<dyn Middleware<IterationContext>>,
    ) -> Self {
        self.iteration_middleware.push(middleware);
        self
    }

    pub fn function_middleware(
        mut self,
        middleware: Arc<dyn Middleware<FunctionInvocationContext>>,
    ) -> Self {
        self.function_middleware.push(middleware);
        self
    }

    pub fn permission_middleware(
        mut self,
        middleware: Arc<dyn Middleware<FunctionInvocationContext>>,
    ) -> Self {
        self.permission_middleware.push(middleware);
        self
    }

    pub fn turn_middleware(mut self, middleware: Arc<dyn Middleware<MessageTurnContext>>) -> Self {
        self.turn_middleware.push(middleware);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn observer_health(mut self, config: ObserverHealthConfig) -> Self {
        self.observer_health = config;
        self
    }

    pub fn retry_strategy(mut self, strategy: Arc<dyn RetryDelayStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ProviderErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<AgentEngine, EngineError> {
        let client = self
            .client
            .ok_or_else(|| EngineError::Internal("chat client is required".into()))?;

        let mut retry = RetryExecutor::new(self.config.retry.clone());
        if let Some(strategy) = self.retry_strategy {
            retry = retry.with_custom_strategy(strategy);
        }
        if let Some(handler) = self.error_handler {
            retry = retry.with_error_handler(handler);
        }
        let retry = Arc::new(retry);

        let permission_pipeline = if self.permission_middleware.is_empty() {
            None
        } else {
            Some(Arc::new(PermissionPipeline::new(self.permission_middleware)))
        };
        let permissions = Arc::new(PermissionManager::new(permission_pipeline));
        let function_pipeline = Arc::new(FunctionPipeline::new(self.function_middleware));

        let processor = FunctionCallProcessor::new(
            retry,
            permissions,
            function_pipeline,
            self.config.function_timeout,
            self.config.parallel_bound(),
        );

        let preparer = TurnPreparer {
            instructions: self.config.instructions.clone(),
            default_options: self.config.default_options.clone(),
            reduction: self.config.reduction.clone(),
            reducer: self.reducer,
            prompt_pipeline: Arc::new(PromptPipeline::new(self.prompt_middleware)),
        };

        Ok(AgentEngine {
            inner: Arc::new(EngineInner {
                client,
                tools: self.tools,
                checkpointer: self.checkpointer,
                preparer,
                iteration_pipeline: Arc::new(IterationPipeline::new(self.iteration_middleware)),
                processor,
                turn_pipeline: Arc::new(MessageTurnPipeline::new(self.turn_middleware)),
                observers: ObserverSet::new(self.observers, self.observer_health),
                config: self.config,
            }),
        })
    }
}

impl AgentEngine {
    pub fn builder(client: Arc<dyn ChatClient>) -> AgentEngineBuilder {
        AgentEngineBuilder::new(client)
    }

    /// Starts a run. Must be called within a tokio runtime; the driver runs
    /// as a background task and the returned handle streams its events.
    pub fn run(&self, request: RunRequest) -> ActiveRun {
        let run_id = uuid::Uuid::new_v4().to_string();
        let (coordinator, queue_rx) = EventCoordinator::new(run_id.clone());

        if let Some(parent) = &request.parent_coordinator {
            match coordinator.set_parent(parent.clone()) {
                Ok(()) => parent.emit(EngineEventKind::NestedAgentInvoked {
                    agent_name: self.inner.config.agent_name.clone(),
                }),
                Err(err) => log::warn!("refusing nested coordinator parent: {err}"),
            }
        }

        let caller_cancel = request.cancel.clone().unwrap_or_default();
        let effective = caller_cancel.child_token();
        if let Some(deadline) = self.inner.config.max_turn_duration {
            let token = effective.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => token.cancel(),
                    _ = token.cancelled() => {}
                }
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let driver = RunDriver {
            inner: self.inner.clone(),
            coordinator: coordinator.clone(),
            queue_rx,
            out_tx,
            cancel: effective.clone(),
            run_id: run_id.clone(),
            messages: request.messages,
            options: request.options,
            thread: request.thread,
            request_tools: request.tools,
        };
        let outcome = tokio::spawn(driver.drive());

        ActiveRun {
            run_id,
            events: out_rx,
            coordinator,
            cancel: effective,
            outcome,
        }
    }
}

/// Forwards coordinator events to the caller and the observers. Kept
/// separate from the driver's other state so draining can run while
/// borrowed futures are in flight.
struct EventPump {
    queue_rx: mpsc::UnboundedReceiver<EngineEvent>,
    out_tx: mpsc::UnboundedSender<EngineEvent>,
    observers: ObserverSet,
}

impl EventPump {
    fn drain(&mut self) {
        while let Ok(event) = self.queue_rx.try_recv() {
            self.observers.dispatch(&event);
            let _ = self.out_tx.send(event);
        }
    }

    /// Awaits a future while forwarding pending events at a bounded
    /// interval, so bidirectional requests raised inside the future surface
    /// to the caller immediately instead of after it completes.
    async fn await_draining<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => {
                    self.drain();
                    return out;
                }
                _ = tokio::time::sleep(DRAIN_POLL) => {
                    self.drain();
                }
            }
        }
    }
}

struct RunDriver {
    inner: Arc<EngineInner>,
    coordinator: Arc<EventCoordinator>,
    queue_rx: mpsc::UnboundedReceiver<EngineEvent>,
    out_tx: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
    run_id: String,
    messages: Vec<Message>,
    options: Option<ChatOptions>,
    thread: Option<Arc<TokioMutex<AgentThread>>>,
    request_tools: Vec<Arc<dyn AiFunction>>,
}

impl RunDriver {
    #[instrument(name = "engine.run", skip_all, fields(run_id = %self.run_id))]
    async fn drive(self) -> Result<RunOutcome, EngineError> {
        let inner = self.inner;
        let coordinator = self.coordinator;
        let cancel = self.cancel;
        let run_id = self.run_id;
        let thread = self.thread;
        let mut pump = EventPump {
            queue_rx: self.queue_rx,
            out_tx: self.out_tx,
            observers: inner.observers.clone(),
        };

        let turn_start = Instant::now();
        let message_turn_id = uuid::Uuid::new_v4().to_string();

        // Thread snapshot for preparation and resume validation.
        let thread_snapshot = match &thread {
            Some(thread) => Some(thread.lock().await.clone()),
            None => None,
        };
        let thread_id = thread_snapshot.as_ref().map(|t| t.id.clone());

        let plan = validate_resume(
            !self.messages.is_empty(),
            thread_snapshot.as_ref(),
            inner.config.allow_stale_resume,
        )?;

        // Build per-run state: fresh (via turn preparation) or restored.
        let mut prepared: Option<PreparedTurn> = None;
        let mut state = match plan {
            ResumePlan::Fresh => {
                let thread_messages = thread_snapshot
                    .as_ref()
                    .map(|t| t.messages.as_slice())
                    .unwrap_or_default();
                let last_reduction = thread_snapshot.as_ref().and_then(|t| t.last_reduction.as_ref());
                let turn = pump
                    .await_draining(inner.preparer.prepare(
                        thread_messages,
                        last_reduction,
                        self.messages.clone(),
                        self.options.clone(),
                        &coordinator,
                    ))
                    .await?;

                let mut state = LoopState::new(
                    run_id.clone(),
                    inner.config.agent_name.clone(),
                    turn.full_messages.clone(),
                );
                if let Some(reduction) = &turn.active_reduction {
                    state = state.with_reduction(reduction.clone());
                }
                if let Some(conversation_id) = thread_snapshot
                    .as_ref()
                    .and_then(|t| t.conversation_id.clone())
                {
                    state = state.enable_history_tracking(conversation_id);
                }
                prepared = Some(turn);
                state
            }
            ResumePlan::Resume(boxed) => {
                let mut state = *boxed;
                coordinator.emit(EngineEventKind::Checkpoint {
                    op: CheckpointOp::Restored,
                    thread_id: thread_id.clone().unwrap_or_default(),
                    etag: state.etag.clone(),
                    success: true,
                    write_count: None,
                });
                state = restore_pending_writes(
                    state,
                    inner.checkpointer.as_ref(),
                    thread_id.as_deref(),
                    &coordinator,
                )
                .await;
                pump.drain();
                state
            }
        };

        // Per-run structures: merged options and the function lookup table.
        let base_options = match &prepared {
            Some(turn) => turn.options.clone(),
            None => {
                let mut options =
                    merge_options(&inner.config.default_options, self.options.clone());
                if let Some(system) = &inner.config.instructions {
                    inject_instructions(&mut options, system);
                }
                options
            }
        };
        let prepared_messages = prepared.as_ref().map(|turn| turn.messages_for_llm.clone());
        let new_reduction = prepared.as_ref().and_then(|turn| turn.new_reduction.clone());
        let new_input_messages = prepared
            .as_ref()
            .map(|turn| turn.new_input_messages.clone())
            .unwrap_or_default();

        let function_map = build_function_map(&inner.tools, &self.request_tools);
        let mut available_tools: HashSet<String> = function_map.keys().cloned().collect();
        for descriptor in &base_options.tools {
            available_tools.insert(descriptor.name.clone());
        }
        let decision_config = inner.config.decision_config(available_tools);

        coordinator.emit(EngineEventKind::MessageTurnStarted {
            message_turn_id: message_turn_id.clone(),
        });
        pump.drain();

        // Input messages persist regardless of how the turn ends.
        for message in &new_input_messages {
            state = state.append_to_turn_history(message.clone());
        }

        let mut effective_max = inner.config.max_iterations;
        let mut last_continuation: Option<bool> = None;
        let mut fatal: Option<EngineError> = None;
        // The previous iteration's assistant message; what the decision
        // engine rules on at the top of the next iteration.
        let mut last_response: Option<Message> = None;

        while !state.is_terminated {
            if cancel.is_cancelled() {
                state = state.terminate("Cancelled");
                break;
            }

            coordinator.set_iteration(state.iteration);
            let message_id = uuid::Uuid::new_v4().to_string();
            coordinator.emit(EngineEventKind::AgentTurnStarted {
                iteration: state.iteration,
            });
            coordinator.emit(EngineEventKind::IterationStart {
                iteration: state.iteration,
            });
            coordinator.emit(EngineEventKind::StateSnapshot {
                iteration: state.iteration,
                message_count: state.current_messages.len(),
                consecutive_failures: state.consecutive_failures,
                is_terminated: state.is_terminated,
            });
            pump.drain();

            let decision = decide(&state, last_response.as_ref(), &decision_config);
            coordinator.emit(EngineEventKind::AgentDecision {
                decision: decision.kind(),
                detail: decision.detail(),
            });
            pump.drain();

            match decision {
                Decision::Terminate(reason) => {
                    // A breaker termination decided on the previous
                    // response carries the same user-visible signals as
                    // the pre-execution check below.
                    if reason.starts_with("Circuit breaker") {
                        let requests = last_response
                            .as_ref()
                            .map(|message| message.function_calls())
                            .unwrap_or_default();
                        if let Some((tool_name, threshold)) = breached_request(
                            &requests,
                            inner.config.max_consecutive_function_calls,
                            &state,
                        ) {
                            let notice_id = uuid::Uuid::new_v4().to_string();
                            coordinator.emit(EngineEventKind::TextMessageStart {
                                message_id: notice_id.clone(),
                            });
                            coordinator.emit(EngineEventKind::TextDelta {
                                message_id: notice_id.clone(),
                                delta: reason.clone(),
                            });
                            coordinator.emit(EngineEventKind::TextMessageEnd {
                                message_id: notice_id,
                            });
                            coordinator.emit(EngineEventKind::CircuitBreakerTriggered {
                                tool_name,
                                consecutive_calls: threshold + 1,
                            });
                        }
                    }
                    state = state.terminate(reason);
                }
                Decision::Complete(response) => {
                    let persisted = persistable(&response, &inner.config);
                    state = state
                        .append_message(persisted.clone())
                        .append_to_turn_history(persisted)
                        .terminate("Completed successfully");
                }
                Decision::CallLlm => {
                    // Message slice for this call.
                    let to_send: Vec<Message> =
                        if state.inner_client_tracks_history && state.iteration > 0 {
                            state.current_messages[state.messages_sent_to_inner_client..].to_vec()
                        } else if state.iteration == 0 && prepared_messages.is_some() {
                            prepared_messages.clone().unwrap_or_default()
                        } else if let Some(reduction) = &state.active_reduction {
                            match reduction.apply_to_messages(&state.current_messages, None) {
                                Ok(reduced) => reduced,
                                Err(err) => {
                                    log::warn!(
                                        "active reduction no longer applies, sending full \
                                         history: {err}"
                                    );
                                    state.current_messages.clone()
                                }
                            }
                        } else {
                            state.current_messages.clone()
                        };
                    coordinator.emit(EngineEventKind::IterationMessages {
                        message_count: to_send.len(),
                    });

                    let (options, visible_tools) =
                        scoped_options(&base_options, &function_map, &state);
                    coordinator.emit(EngineEventKind::ScopedToolsVisible {
                        tools: visible_tools,
                    });

                    // Iteration middleware wraps the actual call.
                    let mut ctx = IterationContext {
                        iteration: state.iteration,
                        is_final_iteration: state.iteration >= effective_max,
                        messages: to_send,
                        options,
                        skip_llm_call: false,
                        cached_response: None,
                        response: None,
                        clear_skill_instructions: false,
                        continuation_approved: None,
                        properties: Map::new(),
                        coordinator: coordinator.clone(),
                        cancel: cancel.clone(),
                    };
                    let terminal = LlmCallTerminal {
                        client: inner.client.clone(),
                        coordinator: coordinator.clone(),
                        cancel: cancel.clone(),
                        message_id: message_id.clone(),
                    };
                    let outcome = pump
                        .await_draining(inner.iteration_pipeline.run(&mut ctx, &terminal))
                        .await;
                    if let Err(err) = outcome {
                        coordinator.emit(EngineEventKind::MiddlewareError {
                            middleware: "iteration".to_string(),
                            message: err.to_string(),
                        });
                        state = state.terminate(format!("Provider error: {err}"));
                        fatal = Some(err);
                        break;
                    }

                    last_continuation = ctx.continuation_approved;
                    if ctx.clear_skill_instructions {
                        state = state.clear_skill_instructions();
                    }
                    let response = ctx.response.take().unwrap_or_default();

                    // Server-side history tracking follows the conversation
                    // id stream.
                    if let Some(conversation_id) = &response.conversation_id {
                        if !state.inner_client_tracks_history {
                            coordinator.emit(EngineEventKind::DeltaSendingActivated {
                                conversation_id: conversation_id.clone(),
                            });
                        }
                        state = state.enable_history_tracking(conversation_id.clone());
                    } else if state.inner_client_tracks_history && !ctx.skip_llm_call {
                        state = state.disable_history_tracking();
                    }

                    let assistant = response
                        .message
                        .clone()
                        .unwrap_or_else(|| Message::new(Role::Assistant, Vec::new()))
                        .with_id(message_id.clone());
                    state.last_assistant_message_id = Some(message_id.clone());
                    let tool_requests = response.tool_requests.clone();

                    let persisted = persistable(&assistant, &inner.config);
                    last_response = Some(persisted.clone());
                    state = state
                        .append_message(persisted.clone())
                        .append_to_turn_history(persisted);
                    state = state.with_messages_sent(state.current_messages.len());

                    if tool_requests.is_empty() {
                        state = if cancel.is_cancelled() {
                            state.terminate("Cancelled")
                        } else {
                            state.terminate("Completed successfully")
                        };
                    } else {
                        // Circuit-breaker pre-check: never execute a call
                        // that would exceed the consecutive threshold.
                        let breached = breached_request(
                            &tool_requests,
                            inner.config.max_consecutive_function_calls,
                            &state,
                        );

                        if let Some((tool_name, threshold)) = breached {
                            let notice = format!(
                                "Circuit breaker: {tool_name} would be called {} consecutive \
                                 times with identical arguments; stopping execution.",
                                threshold + 1
                            );
                            let notice_id = uuid::Uuid::new_v4().to_string();
                            coordinator.emit(EngineEventKind::TextMessageStart {
                                message_id: notice_id.clone(),
                            });
                            coordinator.emit(EngineEventKind::TextDelta {
                                message_id: notice_id.clone(),
                                delta: notice.clone(),
                            });
                            coordinator.emit(EngineEventKind::TextMessageEnd {
                                message_id: notice_id,
                            });
                            coordinator.emit(EngineEventKind::CircuitBreakerTriggered {
                                tool_name,
                                consecutive_calls: threshold + 1,
                            });
                            state = state.terminate(notice);
                        } else if let Some(unknown) =
                            unknown_tool_names(&tool_requests, &decision_config)
                        {
                            // The unknown-call policy stops the run before
                            // anything is routed or executed.
                            state = state
                                .terminate(format!("Unknown tools: {}", unknown.join(", ")));
                        } else {
                            state = self::execute_tools(
                                &inner,
                                &coordinator,
                                &mut pump,
                                &cancel,
                                state,
                                &tool_requests,
                                &function_map,
                                thread_id.as_deref(),
                            )
                            .await;
                        }
                    }
                }
            }

            coordinator.emit(EngineEventKind::AgentTurnFinished {
                iteration: state.iteration,
            });
            pump.drain();
            state = state.next_iteration();

            if inner.config.checkpoint_frequency == CheckpointFrequency::PerIteration
                && !state.is_terminated
            {
                state = spawn_iteration_checkpoint(
                    &inner,
                    &thread,
                    thread_id.as_deref(),
                    &coordinator,
                    state,
                );
            }

            // Iteration cap: the final iteration's middleware already had
            // its chance to request continuation.
            if !state.is_terminated && state.iteration > effective_max {
                if last_continuation == Some(true) {
                    effective_max += inner.config.max_iterations;
                    last_continuation = None;
                } else {
                    state = state.terminate(format!(
                        "Maximum iterations ({}) reached",
                        inner.config.max_iterations
                    ));
                }
            }
        }

        // Finalization.
        coordinator.clear_iteration();
        let termination_reason = state
            .termination_reason
            .clone()
            .unwrap_or_else(|| "completed".to_string());

        let mut turn_ctx = MessageTurnContext {
            turn_history: Arc::new(state.turn_history.clone()),
            termination_reason: termination_reason.clone(),
            duration: turn_start.elapsed(),
            coordinator: coordinator.clone(),
        };
        if let Err(err) = pump
            .await_draining(inner.turn_pipeline.run(&mut turn_ctx, &NoopTerminal))
            .await
        {
            coordinator.emit(EngineEventKind::MiddlewareError {
                middleware: "message_turn".to_string(),
                message: err.to_string(),
            });
        }

        coordinator.emit(EngineEventKind::AgentCompletion {
            reason: termination_reason.clone(),
            iterations: state.iteration,
        });
        coordinator.emit(EngineEventKind::MessageTurnFinished {
            message_turn_id,
            duration_ms: turn_start.elapsed().as_millis() as u64,
        });
        pump.drain();

        // Persist the turn to the thread; failures are reported, never
        // fatal.
        if let (Some(thread), Some(thread_id)) = (&thread, thread_id.as_deref()) {
            let snapshot = {
                let mut guard = thread.lock().await;
                guard.messages.extend(state.turn_history.iter().cloned());
                if let Some(reduction) = &new_reduction {
                    guard.last_reduction = Some(reduction.clone());
                }
                guard.conversation_id = state.conversation_id.clone();
                // The turn is over; only mid-run saves leave a checkpoint.
                guard.execution_state = None;
                guard.clone()
            };
            if let Some(checkpointer) = &inner.checkpointer {
                let prev_etag = state.etag.clone();
                match checkpointer.save_thread(&snapshot).await {
                    Ok(()) => {
                        coordinator.emit(EngineEventKind::Checkpoint {
                            op: CheckpointOp::Saved,
                            thread_id: thread_id.to_string(),
                            etag: None,
                            success: true,
                            write_count: None,
                        });
                        if let Some(etag) = prev_etag {
                            if checkpointer
                                .delete_pending_writes(thread_id, &etag)
                                .await
                                .is_ok()
                            {
                                coordinator.emit(EngineEventKind::Checkpoint {
                                    op: CheckpointOp::PendingWritesDeleted,
                                    thread_id: thread_id.to_string(),
                                    etag: Some(etag),
                                    success: true,
                                    write_count: None,
                                });
                            }
                        }
                    }
                    Err(err) => {
                        log::warn!("thread persistence failed (non-fatal): {err}");
                        coordinator.emit(EngineEventKind::Checkpoint {
                            op: CheckpointOp::Saved,
                            thread_id: thread_id.to_string(),
                            etag: None,
                            success: false,
                            write_count: None,
                        });
                    }
                }
            }
            pump.drain();
        }

        coordinator.close();
        pump.drain();

        if let Some(err) = fatal {
            return Err(err);
        }

        Ok(RunOutcome {
            termination_reason,
            iterations: state.iteration,
            turn_history: state.turn_history.clone(),
            state,
        })
    }
}

/// Strips reasoning for persistence unless configured otherwise.
fn persistable(message: &Message, config: &EngineConfig) -> Message {
    if config.preserve_reasoning_in_history {
        message.clone()
    } else {
        message.without_reasoning()
    }
}

/// First request whose recorded consecutive count has already reached the
/// breaker threshold, i.e. executing it would exceed the limit.
fn breached_request(
    requests: &[FunctionCallRequest],
    threshold: Option<u32>,
    state: &LoopState,
) -> Option<(String, u32)> {
    let threshold = threshold?;
    requests.iter().find_map(|request| {
        let signature = call_signature(&request.name, &request.arguments);
        (state.consecutive_calls_with(&request.name, &signature) >= threshold)
            .then(|| (request.name.clone(), threshold))
    })
}

/// Names of requested tools outside the configured tool universe, when the
/// unknown-call policy is active.
fn unknown_tool_names(
    requests: &[FunctionCallRequest],
    config: &AgentConfiguration,
) -> Option<Vec<String>> {
    if !config.terminate_on_unknown_calls {
        return None;
    }
    let unknown: Vec<String> = requests
        .iter()
        .filter(|request| !config.available_tools.contains(&request.name))
        .map(|request| request.name.clone())
        .collect();
    (!unknown.is_empty()).then_some(unknown)
}

/// Applies plugin/skill scoping to the options: tools nested under a
/// container are visible only while that container is expanded. Also folds
/// active skill instructions into the call's instructions.
fn scoped_options(
    base: &ChatOptions,
    function_map: &std::collections::HashMap<String, Arc<dyn AiFunction>>,
    state: &LoopState,
) -> (ChatOptions, Vec<String>) {
    let mut candidates: Vec<ToolDescriptor> = if base.tools.is_empty() {
        let mut names: Vec<&String> = function_map.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| function_map[name].descriptor())
            .collect()
    } else {
        base.tools.clone()
    };

    candidates.retain(|descriptor| {
        let Some(function) = function_map.get(&descriptor.name) else {
            return true;
        };
        let metadata = function.metadata();
        if let Some(plugin) = &metadata.parent_plugin {
            if !state.expanded_plugin_containers.contains(plugin) {
                return false;
            }
        }
        if let Some(container) = &metadata.parent_skill_container {
            if !state.expanded_skill_containers.contains(container) {
                return false;
            }
        }
        true
    });

    let visible: Vec<String> = candidates.iter().map(|d| d.name.clone()).collect();
    let mut options = base.clone();
    options.tools = candidates;

    for instructions in state.active_skill_instructions.values() {
        match &options.instructions {
            Some(existing) if existing.contains(instructions.as_str()) => {}
            Some(existing) => {
                options.instructions = Some(format!("{existing}\n{instructions}"));
            }
            None => options.instructions = Some(instructions.clone()),
        }
    }

    (options, visible)
}

/// Restores pending writes against the checkpoint's eTag, materializing
/// them as a tool message so completed work is not re-executed.
async fn restore_pending_writes(
    mut state: LoopState,
    checkpointer: Option<&Arc<dyn Checkpointer>>,
    thread_id: Option<&str>,
    coordinator: &Arc<EventCoordinator>,
) -> LoopState {
    let (Some(checkpointer), Some(thread_id), Some(etag)) =
        (checkpointer, thread_id, state.etag.clone())
    else {
        return state;
    };

    match checkpointer.load_pending_writes(thread_id, &etag).await {
        Ok(writes) if !writes.is_empty() => {
            coordinator.emit(EngineEventKind::Checkpoint {
                op: CheckpointOp::PendingWritesLoaded,
                thread_id: thread_id.to_string(),
                etag: Some(etag),
                success: true,
                write_count: Some(writes.len()),
            });
            let known: HashSet<String> = state
                .pending_writes
                .iter()
                .map(|w| w.call_id.clone())
                .collect();
            let fresh: Vec<PendingWrite> = writes
                .into_iter()
                .filter(|w| !known.contains(&w.call_id))
                .collect();
            if !fresh.is_empty() {
                let parts: Vec<ContentPart> = fresh
                    .iter()
                    .map(|write| ContentPart::FunctionResult {
                        call_id: write.call_id.clone(),
                        result: write.result_json.clone(),
                        exception: None,
                    })
                    .collect();
                state = state.append_message(Message::tool(parts));
                for write in fresh {
                    state = state.complete_function(write.function_name.clone());
                    state = state.with_pending_write(write);
                }
            }
            state
        }
        Ok(_) => state,
        Err(err) => {
            log::warn!("loading pending writes failed: {err}");
            coordinator.emit(EngineEventKind::Checkpoint {
                op: CheckpointOp::PendingWritesLoaded,
                thread_id: thread_id.to_string(),
                etag: Some(etag),
                success: false,
                write_count: None,
            });
            state
        }
    }
}

/// Executes one batch of tool requests and folds the outcome into state.
#[allow(clippy::too_many_arguments)]
async fn execute_tools(
    inner: &Arc<EngineInner>,
    coordinator: &Arc<EventCoordinator>,
    pump: &mut EventPump,
    cancel: &CancellationToken,
    mut state: LoopState,
    tool_requests: &[FunctionCallRequest],
    function_map: &std::collections::HashMap<String, Arc<dyn AiFunction>>,
    thread_id: Option<&str>,
) -> LoopState {
    // Requests already satisfied by restored pending writes are not
    // re-executed.
    let completed_ids: HashSet<String> = state
        .pending_writes
        .iter()
        .map(|w| w.call_id.clone())
        .collect();
    let (precompleted, fresh): (Vec<&FunctionCallRequest>, Vec<&FunctionCallRequest>) =
        tool_requests
            .iter()
            .partition(|request| completed_ids.contains(&request.call_id));
    let fresh: Vec<FunctionCallRequest> = fresh.into_iter().cloned().collect();

    let mut precompleted_calls: Vec<ExecutedCall> = Vec::new();
    for request in precompleted {
        if let Some(write) = state
            .pending_writes
            .iter()
            .find(|w| w.call_id == request.call_id)
        {
            precompleted_calls.push(ExecutedCall {
                call_id: write.call_id.clone(),
                name: write.function_name.clone(),
                result: write.result_json.clone(),
                exception: None,
                denied: false,
                container: None,
                instructions: None,
                success: true,
            });
        }
    }

    let processed = pump
        .await_draining(inner.processor.execute(
            &fresh,
            function_map,
            state.iteration,
            coordinator,
            cancel,
        ))
        .await;

    // Durably record successful, non-container results before the next
    // checkpoint.
    if let (Some(checkpointer), Some(thread_id), Some(etag)) =
        (&inner.checkpointer, thread_id, state.etag.clone())
    {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let writes: Vec<PendingWrite> = processed
            .executed
            .iter()
            .filter(|call| call.success && call.container.is_none())
            .map(|call| PendingWrite {
                call_id: call.call_id.clone(),
                function_name: call.name.clone(),
                result_json: call.result.clone(),
                completed_at: now,
                iteration: state.iteration,
                thread_id: thread_id.to_string(),
            })
            .collect();
        if !writes.is_empty() {
            for write in &writes {
                state = state.with_pending_write(write.clone());
            }
            let checkpointer = checkpointer.clone();
            let coordinator = coordinator.clone();
            let thread_id = thread_id.to_string();
            let write_count = writes.len();
            tokio::spawn(async move {
                let success = checkpointer
                    .save_pending_writes(&thread_id, &etag, &writes)
                    .await
                    .is_ok();
                coordinator.emit(EngineEventKind::Checkpoint {
                    op: CheckpointOp::PendingWritesSaved,
                    thread_id,
                    etag: Some(etag),
                    success,
                    write_count: Some(write_count),
                });
            });
        }
    }

    // Circuit-breaker accounting per executed request.
    for request in &fresh {
        let signature = call_signature(&request.name, &request.arguments);
        state = state.record_tool_call(&request.name, &signature);
    }

    if processed.had_errors {
        state = state.with_failure();
    } else {
        state = state.with_success();
    }

    for plugin in &processed.plugin_expansions {
        state = state.with_expanded_plugin(plugin.clone());
        coordinator.emit(EngineEventKind::ContainerExpanded {
            container: plugin.clone(),
            kind: ContainerKind::Plugin,
        });
    }
    for skill in &processed.skill_expansions {
        state = state.with_expanded_skill(skill.clone());
        coordinator.emit(EngineEventKind::ContainerExpanded {
            container: skill.clone(),
            kind: ContainerKind::Skill,
        });
    }
    for (skill, instructions) in &processed.skill_instructions {
        state = state.with_skill_instructions(skill.clone(), instructions.clone());
    }
    for name in &processed.successful_functions {
        state = state.complete_function(name.clone());
    }

    // Container-filtered results persist; unfiltered results stay visible
    // to the LLM for the rest of the turn.
    let mut persisted_message = processed.result_message.clone();
    let mut visible_message = processed.unfiltered_message.clone();
    if !precompleted_calls.is_empty() {
        let mut parts: Vec<ContentPart> = precompleted_calls
            .iter()
            .map(|call| ContentPart::FunctionResult {
                call_id: call.call_id.clone(),
                result: call.result.clone(),
                exception: None,
            })
            .collect();
        parts.extend(persisted_message.contents.clone());
        persisted_message = Message::tool(parts.clone());
        let mut visible_parts = parts;
        // The unfiltered view also carries any container results.
        for part in &visible_message.contents {
            if !visible_parts.contains(part) {
                visible_parts.push(part.clone());
            }
        }
        visible_message = Message::tool(visible_parts);
    }

    if !persisted_message.contents.is_empty() {
        state = state.append_to_turn_history(persisted_message);
    }
    if !visible_message.contents.is_empty() {
        state = state.append_message(visible_message);
    }

    for call in &processed.executed {
        coordinator.emit(EngineEventKind::ToolCallEnd {
            call_id: call.call_id.clone(),
        });
        coordinator.emit(EngineEventKind::ToolCallResult {
            call_id: call.call_id.clone(),
            tool_name: call.name.clone(),
            is_error: call.is_error(),
            result: call.result_text(),
        });
    }
    pump.drain();

    if state.consecutive_failures >= inner.config.max_consecutive_failures {
        let notice = format!(
            "Maximum consecutive failures ({}) reached; stopping.",
            inner.config.max_consecutive_failures
        );
        let notice_id = uuid::Uuid::new_v4().to_string();
        coordinator.emit(EngineEventKind::TextMessageStart {
            message_id: notice_id.clone(),
        });
        coordinator.emit(EngineEventKind::TextDelta {
            message_id: notice_id.clone(),
            delta: notice.clone(),
        });
        coordinator.emit(EngineEventKind::TextMessageEnd {
            message_id: notice_id,
        });
        state = state.terminate(notice);
    }

    state
}

/// Serializes state and fires the per-iteration checkpoint save. The
/// returned state carries the new eTag and drops recorded pending writes
/// (the sidecar now owns them).
fn spawn_iteration_checkpoint(
    inner: &Arc<EngineInner>,
    thread: &Option<Arc<TokioMutex<AgentThread>>>,
    thread_id: Option<&str>,
    coordinator: &Arc<EventCoordinator>,
    state: LoopState,
) -> LoopState {
    let (Some(checkpointer), Some(thread), Some(thread_id)) =
        (inner.checkpointer.clone(), thread.clone(), thread_id)
    else {
        return state;
    };

    let prev_etag = state.etag.clone();
    let stamped = state.with_metadata(StateSource::Loop, state.iteration);
    let (json, stamped) = match stamped.to_checkpoint() {
        Ok(pair) => pair,
        Err(err) => {
            log::warn!("checkpoint serialization failed (non-fatal): {err}");
            return state;
        }
    };

    let coordinator = coordinator.clone();
    let thread_id = thread_id.to_string();
    let etag = stamped.etag.clone();
    tokio::spawn(async move {
        let snapshot = {
            let mut guard = thread.lock().await;
            guard.execution_state = Some(json);
            guard.clone()
        };
        match checkpointer.save_thread(&snapshot).await {
            Ok(()) => {
                coordinator.emit(EngineEventKind::Checkpoint {
                    op: CheckpointOp::Saved,
                    thread_id: thread_id.clone(),
                    etag: etag.clone(),
                    success: true,
                    write_count: None,
                });
                if let Some(prev) = prev_etag {
                    if checkpointer
                        .delete_pending_writes(&thread_id, &prev)
                        .await
                        .is_ok()
                    {
                        coordinator.emit(EngineEventKind::Checkpoint {
                            op: CheckpointOp::PendingWritesDeleted,
                            thread_id,
                            etag: Some(prev),
                            success: true,
                            write_count: None,
                        });
                    }
                }
            }
            Err(err) => {
                log::warn!("iteration checkpoint failed (non-fatal): {err}");
                coordinator.emit(EngineEventKind::Checkpoint {
                    op: CheckpointOp::Saved,
                    thread_id,
                    etag,
                    success: false,
                    write_count: None,
                });
            }
        }
    });

    stamped.clear_pending_writes()
}

/// Terminal action of the iteration pipeline: the actual streaming LLM
/// call, or the middleware-supplied cached response when the call is
/// skipped.
struct LlmCallTerminal {
    client: Arc<dyn ChatClient>,
    coordinator: Arc<EventCoordinator>,
    cancel: CancellationToken,
    message_id: String,
}

#[async_trait]
impl TerminalAction<IterationContext> for LlmCallTerminal {
    async fn run(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        if ctx.skip_llm_call {
            ctx.response = ctx.cached_response.take();
            return Ok(());
        }
        let stream = self
            .client
            .stream(&ctx.messages, &ctx.options, self.cancel.child_token())
            .await?;
        let response =
            consume_stream(stream, &self.coordinator, &self.cancel, &self.message_id).await?;
        ctx.response = Some(response);
        Ok(())
    }
}

/// Drives one response stream to completion, yielding content events as
/// deltas arrive and assembling the final assistant message.
async fn consume_stream(
    mut stream: ResponseStream,
    coordinator: &Arc<EventCoordinator>,
    cancel: &CancellationToken,
    message_id: &str,
) -> Result<IterationResponse, EngineError> {
    let mut response = IterationResponse::default();
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut text_open = false;
    let mut reasoning_open = false;
    let mut calls: Vec<(String, String, Map<String, serde_json::Value>)> = Vec::new();

    loop {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            update = stream.next() => update,
        };
        let Some(update) = update else { break };
        let update = update?;

        for part in &update.contents {
            match part {
                ContentPart::Reasoning { text: delta } => {
                    if !reasoning_open {
                        reasoning_open = true;
                        coordinator.emit(EngineEventKind::Reasoning {
                            message_id: message_id.to_string(),
                            phase: ReasoningPhase::SessionStart,
                            delta: None,
                        });
                        coordinator.emit(EngineEventKind::Reasoning {
                            message_id: message_id.to_string(),
                            phase: ReasoningPhase::MessageStart,
                            delta: None,
                        });
                    }
                    reasoning.push_str(delta);
                    coordinator.emit(EngineEventKind::Reasoning {
                        message_id: message_id.to_string(),
                        phase: ReasoningPhase::Delta,
                        delta: Some(delta.clone()),
                    });
                }
                ContentPart::Text { text: delta } => {
                    close_reasoning(coordinator, message_id, &mut reasoning_open);
                    if !text_open {
                        text_open = true;
                        coordinator.emit(EngineEventKind::TextMessageStart {
                            message_id: message_id.to_string(),
                        });
                    }
                    text.push_str(delta);
                    coordinator.emit(EngineEventKind::TextDelta {
                        message_id: message_id.to_string(),
                        delta: delta.clone(),
                    });
                }
                ContentPart::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    close_reasoning(coordinator, message_id, &mut reasoning_open);
                    coordinator.emit(EngineEventKind::ToolCallStart {
                        call_id: call_id.clone(),
                        tool_name: name.clone(),
                    });
                    let rendered = serde_json::to_string(arguments)
                        .unwrap_or_else(|_| "{}".to_string());
                    coordinator.emit(EngineEventKind::ToolCallArgs {
                        call_id: call_id.clone(),
                        arguments: rendered,
                    });
                    calls.push((call_id.clone(), name.clone(), arguments.clone()));
                }
                // Results never arrive on the request stream; usage and
                // binary parts carry no streaming events.
                _ => {}
            }
        }

        if update.conversation_id.is_some() {
            response.conversation_id = update.conversation_id.clone();
        }
        if update.finish_reason.is_some() {
            response.finish_reason = update.finish_reason;
        }
        response.updates.push(update);
    }

    close_reasoning(coordinator, message_id, &mut reasoning_open);
    if text_open {
        coordinator.emit(EngineEventKind::TextMessageEnd {
            message_id: message_id.to_string(),
        });
    }

    let mut contents = Vec::new();
    if !reasoning.is_empty() {
        contents.push(ContentPart::Reasoning { text: reasoning });
    }
    if !text.is_empty() {
        contents.push(ContentPart::Text { text });
    }
    for (call_id, name, arguments) in &calls {
        contents.push(ContentPart::FunctionCall {
            call_id: call_id.clone(),
            name: name.clone(),
            arguments: arguments.clone(),
        });
    }
    response.message = Some(Message::new(Role::Assistant, contents));
    response.tool_requests = calls
        .into_iter()
        .map(|(call_id, name, arguments)| FunctionCallRequest {
            call_id,
            name,
            arguments,
        })
        .collect();
    Ok(response)
}

fn close_reasoning(
    coordinator: &Arc<EventCoordinator>,
    message_id: &str,
    reasoning_open: &mut bool,
) {
    if *reasoning_open {
        *reasoning_open = false;
        coordinator.emit(EngineEventKind::Reasoning {
            message_id: message_id.to_string(),
            phase: ReasoningPhase::MessageEnd,
            delta: None,
        });
        coordinator.emit(EngineEventKind::Reasoning {
            message_id: message_id.to_string(),
            phase: ReasoningPhase::SessionEnd,
            delta: None,
        });
    }
}
