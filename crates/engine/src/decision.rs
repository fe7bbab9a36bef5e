//! The decision engine: a pure policy function over loop state.
//!
//! `decide` does no I/O, reads no clocks, and uses no randomness; identical
//! inputs always produce identical decisions. Failures it detects become
//! `Terminate` decisions rather than errors.

use crate::config::AgentConfiguration;
use crate::events::DecisionKind;
use crate::signature::call_signature;
use crate::state::LoopState;
use turnloop::Message;

/// The next action the driver should take.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Invoke the chat client (executing any pending tool calls inline
    /// first).
    CallLlm,
    /// The response is final; end the turn with it.
    Complete(Message),
    /// Stop the loop with a human-readable reason.
    Terminate(String),
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::CallLlm => DecisionKind::CallLlm,
            Decision::Complete(_) => DecisionKind::Complete,
            Decision::Terminate(_) => DecisionKind::Terminate,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Decision::Terminate(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

/// Decides the next loop action. First matching rule wins.
pub fn decide(
    state: &LoopState,
    last_response: Option<&Message>,
    config: &AgentConfiguration,
) -> Decision {
    if state.is_terminated {
        return Decision::Terminate(
            state
                .termination_reason
                .clone()
                .unwrap_or_else(|| "terminated".to_string()),
        );
    }

    if state.consecutive_failures >= config.max_consecutive_failures {
        return Decision::Terminate(format!(
            "Maximum consecutive failures ({}) reached",
            config.max_consecutive_failures
        ));
    }

    let Some(response) = last_response else {
        return Decision::CallLlm;
    };

    let calls = response.function_calls();
    if calls.is_empty() {
        return Decision::Complete(response.clone());
    }

    if let Some(threshold) = config.max_consecutive_function_calls {
        for call in &calls {
            let signature = call_signature(&call.name, &call.arguments);
            if state.consecutive_calls_with(&call.name, &signature) >= threshold {
                return Decision::Terminate(format!(
                    "Circuit breaker: {} called {} times consecutively with identical arguments",
                    call.name, threshold
                ));
            }
        }
    }

    if config.terminate_on_unknown_calls {
        let unknown: Vec<&str> = calls
            .iter()
            .map(|call| call.name.as_str())
            .filter(|name| !config.available_tools.contains(*name))
            .collect();
        if !unknown.is_empty() {
            return Decision::Terminate(format!("Unknown tools: {}", unknown.join(", ")));
        }
    }

    Decision::CallLlm
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use turnloop::{ContentPart, Role};

    fn state() -> LoopState {
        LoopState::new("run-1", "tester", vec![Message::user("hi")])
    }

    fn config() -> AgentConfiguration {
        AgentConfiguration {
            available_tools: ["now".to_string()].into(),
            ..Default::default()
        }
    }

    fn tool_call_response(name: &str) -> Message {
        Message::new(
            Role::Assistant,
            vec![ContentPart::FunctionCall {
                call_id: "c1".into(),
                name: name.into(),
                arguments: Map::new(),
            }],
        )
    }

    // ── Decision order ─────────────────────────────────────────────────────

    #[test]
    fn terminated_state_wins_over_everything() {
        let state = state().terminate("stopped earlier");
        let decision = decide(&state, Some(&Message::assistant("hi")), &config());
        assert_eq!(decision, Decision::Terminate("stopped earlier".into()));
    }

    #[test]
    fn max_consecutive_failures_terminates() {
        let state = state().with_failure().with_failure().with_failure();
        let decision = decide(&state, None, &config());
        assert!(matches!(
            decision,
            Decision::Terminate(reason) if reason.contains("consecutive failures")
        ));
    }

    #[test]
    fn no_response_calls_llm() {
        assert_eq!(decide(&state(), None, &config()), Decision::CallLlm);
    }

    #[test]
    fn text_only_response_completes() {
        let response = Message::assistant("Hello!");
        let decision = decide(&state(), Some(&response), &config());
        assert_eq!(decision, Decision::Complete(response));
    }

    #[test]
    fn breaker_terminates_at_threshold() {
        let response = tool_call_response("now");
        let signature = call_signature("now", &Map::new());
        let state = state()
            .record_tool_call("now", &signature)
            .record_tool_call("now", &signature);
        let config = AgentConfiguration {
            max_consecutive_function_calls: Some(2),
            ..config()
        };
        let decision = decide(&state, Some(&response), &config);
        assert!(matches!(
            decision,
            Decision::Terminate(reason) if reason.contains("Circuit breaker")
        ));
    }

    #[test]
    fn breaker_allows_below_threshold() {
        let response = tool_call_response("now");
        let signature = call_signature("now", &Map::new());
        let state = state().record_tool_call("now", &signature);
        let config = AgentConfiguration {
            max_consecutive_function_calls: Some(2),
            ..config()
        };
        assert_eq!(decide(&state, Some(&response), &config), Decision::CallLlm);
    }

    #[test]
    fn unknown_tool_terminates_when_configured() {
        let response = tool_call_response("mystery");
        let config = AgentConfiguration {
            terminate_on_unknown_calls: true,
            ..config()
        };
        let decision = decide(&state(), Some(&response), &config);
        assert_eq!(decision, Decision::Terminate("Unknown tools: mystery".into()));
    }

    #[test]
    fn unknown_tool_ignored_when_not_configured() {
        let response = tool_call_response("mystery");
        assert_eq!(decide(&state(), Some(&response), &config()), Decision::CallLlm);
    }

    #[test]
    fn known_tool_calls_llm_for_inline_execution() {
        let response = tool_call_response("now");
        assert_eq!(decide(&state(), Some(&response), &config()), Decision::CallLlm);
    }

    // ── Purity (I1, R2) ────────────────────────────────────────────────────

    #[test]
    fn decide_is_referentially_transparent() {
        let state = state().with_failure();
        let response = tool_call_response("now");
        let config = config();
        let first = decide(&state, Some(&response), &config);
        let second = decide(&state, Some(&response), &config);
        assert_eq!(first, second);
        // Inputs are untouched.
        assert_eq!(state.consecutive_failures, 1);
    }
}
