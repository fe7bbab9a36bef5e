//! Turn preparation: history assembly, option merging, instruction
//! injection, and the reduction cache.

use crate::config::ReductionSettings;
use crate::coordinator::EventCoordinator;
use crate::error::EngineError;
use crate::events::EngineEventKind;
use crate::middleware::{NoopTerminal, PromptContext, PromptPipeline};
use crate::reduction::{HistoryReducer, HistoryReductionState, reduction_state_from};
use std::sync::Arc;
use tracing::instrument;
use turnloop::{ChatOptions, Message};

/// Everything the loop needs to run a turn without re-reading history.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    /// The (possibly reduced) list to send on the first LLM call.
    pub messages_for_llm: Vec<Message>,
    /// The caller-supplied messages, kept for persistence.
    pub new_input_messages: Vec<Message>,
    pub options: ChatOptions,
    /// The reduction applied this turn (cache-reused or freshly computed).
    pub active_reduction: Option<HistoryReductionState>,
    /// Present only when a new reduction was computed this turn.
    pub new_reduction: Option<HistoryReductionState>,
    /// The full, unreduced working list (loop state starts from this).
    pub full_messages: Vec<Message>,
}

/// Merges caller options over defaults, caller winning field by field. An
/// empty caller tool list keeps the default tools; additional-properties
/// maps merge with the caller winning collisions.
pub fn merge_options(defaults: &ChatOptions, caller: Option<ChatOptions>) -> ChatOptions {
    let Some(caller) = caller else {
        return defaults.clone();
    };
    let mut merged = defaults.clone();
    if caller.model_id.is_some() {
        merged.model_id = caller.model_id;
    }
    if !caller.tools.is_empty() {
        merged.tools = caller.tools;
    }
    if caller.tool_choice.is_some() {
        merged.tool_choice = caller.tool_choice;
    }
    if caller.allow_multiple_tool_calls.is_some() {
        merged.allow_multiple_tool_calls = caller.allow_multiple_tool_calls;
    }
    if caller.instructions.is_some() {
        merged.instructions = caller.instructions;
    }
    if caller.temperature.is_some() {
        merged.temperature = caller.temperature;
    }
    if caller.top_p.is_some() {
        merged.top_p = caller.top_p;
    }
    if caller.top_k.is_some() {
        merged.top_k = caller.top_k;
    }
    if caller.max_output_tokens.is_some() {
        merged.max_output_tokens = caller.max_output_tokens;
    }
    if caller.frequency_penalty.is_some() {
        merged.frequency_penalty = caller.frequency_penalty;
    }
    if caller.presence_penalty.is_some() {
        merged.presence_penalty = caller.presence_penalty;
    }
    if !caller.stop_sequences.is_empty() {
        merged.stop_sequences = caller.stop_sequences;
    }
    if caller.response_format.is_some() {
        merged.response_format = caller.response_format;
    }
    if caller.seed.is_some() {
        merged.seed = caller.seed;
    }
    if caller.conversation_id.is_some() {
        merged.conversation_id = caller.conversation_id;
    }
    for (key, value) in caller.additional {
        merged.additional.insert(key, value);
    }
    merged
}

/// Injects system instructions into the options (never as a synthetic
/// system message). Skips when the text is already present verbatim,
/// otherwise prepends with newline separation.
pub fn inject_instructions(options: &mut ChatOptions, system: &str) {
    match &options.instructions {
        None => options.instructions = Some(system.to_string()),
        Some(existing) if existing.contains(system) => {}
        Some(existing) => options.instructions = Some(format!("{system}\n{existing}")),
    }
}

pub struct TurnPreparer {
    pub instructions: Option<String>,
    pub default_options: ChatOptions,
    pub reduction: Option<ReductionSettings>,
    pub reducer: Option<Arc<dyn HistoryReducer>>,
    pub prompt_pipeline: Arc<PromptPipeline>,
}

impl TurnPreparer {
    #[instrument(name = "engine.prepare_turn", skip_all, fields(input_count = input_messages.len()))]
    pub async fn prepare(
        &self,
        thread_messages: &[Message],
        last_reduction: Option<&HistoryReductionState>,
        input_messages: Vec<Message>,
        caller_options: Option<ChatOptions>,
        coordinator: &Arc<EventCoordinator>,
    ) -> Result<PreparedTurn, EngineError> {
        let mut working = thread_messages.to_vec();
        working.extend(input_messages.iter().cloned());

        let mut options = merge_options(&self.default_options, caller_options);
        if let Some(system) = &self.instructions {
            inject_instructions(&mut options, system);
        }

        let mut active_reduction = None;
        let mut new_reduction = None;
        let mut messages_for_llm = None;

        if let (Some(_settings), Some(last)) = (&self.reduction, last_reduction) {
            if last.is_valid_for(working.len()) && last.matches_prefix(&working) {
                coordinator.emit(EngineEventKind::HistoryReductionCache {
                    is_hit: true,
                    summarized_up_to: Some(last.summarized_up_to_index),
                });
                messages_for_llm = Some(last.apply_to_messages(&working, None)?);
                active_reduction = Some(last.clone());
            }
        }

        if messages_for_llm.is_none() {
            if let (Some(settings), Some(reducer)) = (&self.reduction, &self.reducer) {
                if settings.should_reduce(working.len()) {
                    coordinator.emit(EngineEventKind::HistoryReductionCache {
                        is_hit: false,
                        summarized_up_to: None,
                    });
                    let reduced = reducer.reduce(&working).await?;
                    match reduction_state_from(&working, &reduced, settings) {
                        Some(state) => {
                            new_reduction = Some(state.clone());
                            active_reduction = Some(state);
                            messages_for_llm = Some(reduced);
                        }
                        None => {
                            log::warn!(
                                "reducer output had no recognizable summary message; \
                                 sending full history"
                            );
                        }
                    }
                }
            }
        }

        let mut ctx = PromptContext {
            messages: messages_for_llm.unwrap_or_else(|| working.clone()),
            options,
            coordinator: coordinator.clone(),
        };
        coordinator.emit(EngineEventKind::MiddlewarePipelineStart {
            pipeline: "prompt".to_string(),
        });
        self.prompt_pipeline.run(&mut ctx, &NoopTerminal).await?;
        coordinator.emit(EngineEventKind::MiddlewarePipelineEnd {
            pipeline: "prompt".to_string(),
        });

        coordinator.emit(EngineEventKind::MessagePrepared {
            message_count: ctx.messages.len(),
            reduced: active_reduction.is_some(),
        });

        Ok(PreparedTurn {
            messages_for_llm: ctx.messages,
            new_input_messages: input_messages,
            options: ctx.options,
            active_reduction,
            new_reduction,
            full_messages: working,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReductionTrigger;
    use crate::reduction::hash_message_prefix;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use turnloop::ToolDescriptor;

    // ── Option merge ───────────────────────────────────────────────────────

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: "d".into(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn caller_fields_win_over_defaults() {
        let defaults = ChatOptions {
            model_id: Some("default-model".into()),
            temperature: Some(0.2),
            ..Default::default()
        };
        let caller = ChatOptions {
            temperature: Some(0.9),
            ..Default::default()
        };
        let merged = merge_options(&defaults, Some(caller));
        assert_eq!(merged.model_id.as_deref(), Some("default-model"));
        assert_eq!(merged.temperature, Some(0.9));
    }

    #[test]
    fn empty_caller_tool_list_keeps_defaults() {
        let defaults = ChatOptions {
            tools: vec![descriptor("now")],
            ..Default::default()
        };
        let merged = merge_options(&defaults, Some(ChatOptions::default()));
        assert_eq!(merged.tools.len(), 1);

        let caller = ChatOptions {
            tools: vec![descriptor("other"), descriptor("more")],
            ..Default::default()
        };
        let merged = merge_options(&defaults, Some(caller));
        assert_eq!(merged.tools.len(), 2);
        assert_eq!(merged.tools[0].name, "other");
    }

    #[test]
    fn additional_properties_merge_with_caller_winning() {
        let mut defaults = ChatOptions::default();
        defaults.additional.insert("a".into(), json!(1));
        defaults.additional.insert("b".into(), json!(2));
        let mut caller = ChatOptions::default();
        caller.additional.insert("b".into(), json!(20));
        caller.additional.insert("c".into(), json!(3));

        let merged = merge_options(&defaults, Some(caller));
        assert_eq!(merged.additional["a"], json!(1));
        assert_eq!(merged.additional["b"], json!(20));
        assert_eq!(merged.additional["c"], json!(3));
    }

    // ── Instruction injection ──────────────────────────────────────────────

    #[test]
    fn instructions_fill_empty_options() {
        let mut options = ChatOptions::default();
        inject_instructions(&mut options, "You are helpful.");
        assert_eq!(options.instructions.as_deref(), Some("You are helpful."));
    }

    #[test]
    fn instructions_prepend_with_newline() {
        let mut options = ChatOptions {
            instructions: Some("Caller extras.".into()),
            ..Default::default()
        };
        inject_instructions(&mut options, "You are helpful.");
        assert_eq!(
            options.instructions.as_deref(),
            Some("You are helpful.\nCaller extras.")
        );
    }

    #[test]
    fn verbatim_instructions_are_not_duplicated() {
        let mut options = ChatOptions {
            instructions: Some("You are helpful.\nCaller extras.".into()),
            ..Default::default()
        };
        inject_instructions(&mut options, "You are helpful.");
        assert_eq!(
            options.instructions.as_deref(),
            Some("You are helpful.\nCaller extras.")
        );
    }

    // ── Reduction cache ────────────────────────────────────────────────────

    struct CountingReducer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl HistoryReducer for CountingReducer {
        async fn reduce(&self, messages: &[Message]) -> Result<Vec<Message>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Summary + last 5 messages.
            let keep = messages.len().saturating_sub(5);
            let mut out = vec![Message::assistant("summary of earlier turns")];
            out.extend_from_slice(&messages[keep..]);
            Ok(out)
        }
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("m{i}"))).collect()
    }

    fn settings() -> ReductionSettings {
        ReductionSettings {
            trigger: ReductionTrigger::MessageCount,
            target_message_count: 10,
            reduction_threshold: 5,
        }
    }

    fn preparer(reducer: Arc<CountingReducer>) -> TurnPreparer {
        TurnPreparer {
            instructions: None,
            default_options: ChatOptions::default(),
            reduction: Some(settings()),
            reducer: Some(reducer),
            prompt_pipeline: Arc::new(PromptPipeline::empty()),
        }
    }

    #[tokio::test]
    async fn valid_cached_reduction_is_reused_without_reducer_call() {
        let (coordinator, mut rx) = EventCoordinator::new("run-1");
        let reducer = Arc::new(CountingReducer {
            calls: AtomicU32::new(0),
        });
        let preparer = preparer(reducer.clone());

        // Reduction computed when the thread had 100 messages, covering the
        // first 90.
        let thread_messages = history(100);
        let last = HistoryReductionState {
            summarized_up_to_index: 90,
            message_count_at_reduction: 100,
            summary_content: "old summary".into(),
            created_at: 0,
            message_hash: hash_message_prefix(&thread_messages, 90),
            target_message_count: 10,
            reduction_threshold: 5,
        };

        let input = vec![
            Message::user("q101"),
            Message::user("q102"),
            Message::user("q103"),
        ];
        let prepared = preparer
            .prepare(&thread_messages, Some(&last), input, None, &coordinator)
            .await
            .unwrap();

        assert_eq!(reducer.calls.load(Ordering::SeqCst), 0);
        // summary + messages[90..103]
        assert_eq!(prepared.messages_for_llm.len(), 1 + 13);
        assert_eq!(prepared.messages_for_llm[0].text(), "old summary");
        assert!(prepared.new_reduction.is_none());
        assert_eq!(
            prepared.active_reduction.as_ref().unwrap().summarized_up_to_index,
            90
        );

        let mut saw_hit = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEventKind::HistoryReductionCache { is_hit, .. } = event.kind {
                saw_hit = is_hit;
            }
        }
        assert!(saw_hit);
    }

    #[tokio::test]
    async fn expired_cache_triggers_new_reduction() {
        let (coordinator, mut rx) = EventCoordinator::new("run-1");
        let reducer = Arc::new(CountingReducer {
            calls: AtomicU32::new(0),
        });
        let preparer = preparer(reducer.clone());

        let thread_messages = history(100);
        let last = HistoryReductionState {
            summarized_up_to_index: 90,
            message_count_at_reduction: 100,
            summary_content: "old summary".into(),
            created_at: 0,
            message_hash: hash_message_prefix(&thread_messages, 90),
            target_message_count: 10,
            reduction_threshold: 5,
        };

        // Six new messages: past the validity window.
        let input = history(6);
        let prepared = preparer
            .prepare(&thread_messages, Some(&last), input, None, &coordinator)
            .await
            .unwrap();

        assert_eq!(reducer.calls.load(Ordering::SeqCst), 1);
        assert!(prepared.new_reduction.is_some());
        assert_eq!(prepared.messages_for_llm.len(), 6);

        let mut cache_events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEventKind::HistoryReductionCache { is_hit, .. } = event.kind {
                cache_events.push(is_hit);
            }
        }
        assert_eq!(cache_events, vec![false]);
    }

    #[tokio::test]
    async fn below_trigger_no_reduction_happens() {
        let (coordinator, _rx) = EventCoordinator::new("run-1");
        let reducer = Arc::new(CountingReducer {
            calls: AtomicU32::new(0),
        });
        let preparer = preparer(reducer.clone());

        let prepared = preparer
            .prepare(&history(10), None, vec![Message::user("q")], None, &coordinator)
            .await
            .unwrap();

        assert_eq!(reducer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(prepared.messages_for_llm.len(), 11);
        assert!(prepared.active_reduction.is_none());
        assert_eq!(prepared.full_messages.len(), 11);
    }
}
