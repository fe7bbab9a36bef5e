//! Engine configuration.
//!
//! All configuration is pure data, constructed once and wrapped in `Arc` by
//! the engine. `AgentConfiguration` is the slice the decision engine sees;
//! `EngineConfig` is the full execution policy.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use turnloop::ChatOptions;

/// The pure-data record the decision engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfiguration {
    pub max_iterations: u32,
    pub max_consecutive_failures: u32,
    pub terminate_on_unknown_calls: bool,
    pub available_tools: HashSet<String>,
    /// Circuit-breaker threshold: maximum consecutive invocations of the
    /// same function signature. `None` disables the breaker.
    pub max_consecutive_function_calls: Option<u32>,
}

impl Default for AgentConfiguration {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_consecutive_failures: 3,
            terminate_on_unknown_calls: false,
            available_tools: HashSet::new(),
            max_consecutive_function_calls: None,
        }
    }
}

/// When the driver persists a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    /// After each iteration, fire-and-forget.
    PerIteration,
    /// Only at the end of the turn.
    #[default]
    Final,
}

/// Retry backoff policy for tool invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// What causes a history reduction to fire.
///
/// Only the message-count strategy is active. The token strategies are
/// declared for configs that want to pre-select one, but they never fire
/// until a token-counting collaborator exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReductionTrigger {
    MessageCount,
    TokenPercentage { percent: f64 },
    AbsoluteTokens { budget: usize },
}

impl Default for ReductionTrigger {
    fn default() -> Self {
        ReductionTrigger::MessageCount
    }
}

/// History-reduction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionSettings {
    #[serde(default)]
    pub trigger: ReductionTrigger,
    /// Message count the reducer aims to shrink the history to.
    pub target_message_count: usize,
    /// How many messages may accumulate past the target before reducing
    /// again; also bounds how long a cached reduction stays valid.
    pub reduction_threshold: usize,
}

impl ReductionSettings {
    /// Whether a new reduction should be computed for the given history size.
    pub fn should_reduce(&self, message_count: usize) -> bool {
        match self.trigger {
            ReductionTrigger::MessageCount => {
                message_count > self.target_message_count + self.reduction_threshold
            }
            // Reserved strategies: inert until a token counter is supplied.
            ReductionTrigger::TokenPercentage { .. } | ReductionTrigger::AbsoluteTokens { .. } => {
                false
            }
        }
    }
}

/// Full execution policy for an engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub agent_name: String,
    /// System instructions injected into options at turn preparation.
    pub instructions: Option<String>,
    /// Defaults merged under the caller's per-run options.
    pub default_options: ChatOptions,

    pub max_iterations: u32,
    pub max_consecutive_failures: u32,
    pub terminate_on_unknown_calls: bool,
    pub max_consecutive_function_calls: Option<u32>,

    /// Bound on concurrently executing tool calls. Defaults to
    /// `4 × available_parallelism` when `None`.
    pub max_parallel_functions: Option<usize>,
    /// Keep model reasoning in persisted history (default: strip it).
    pub preserve_reasoning_in_history: bool,

    pub checkpoint_frequency: CheckpointFrequency,
    /// Accept a checkpoint whose message count no longer matches the thread.
    pub allow_stale_resume: bool,

    /// Per-turn deadline combined into the run's cancellation scope.
    pub max_turn_duration: Option<Duration>,
    /// Per-function invocation timeout.
    pub function_timeout: Option<Duration>,

    pub retry: RetryPolicy,
    pub reduction: Option<ReductionSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_name: "agent".to_string(),
            instructions: None,
            default_options: ChatOptions::default(),
            max_iterations: 10,
            max_consecutive_failures: 3,
            terminate_on_unknown_calls: false,
            max_consecutive_function_calls: None,
            max_parallel_functions: None,
            preserve_reasoning_in_history: false,
            checkpoint_frequency: CheckpointFrequency::Final,
            allow_stale_resume: false,
            max_turn_duration: None,
            function_timeout: None,
            retry: RetryPolicy::default(),
            reduction: None,
        }
    }
}

impl EngineConfig {
    /// Projects the decision-engine slice of this config for the given tool
    /// universe.
    pub fn decision_config(&self, available_tools: HashSet<String>) -> AgentConfiguration {
        AgentConfiguration {
            max_iterations: self.max_iterations,
            max_consecutive_failures: self.max_consecutive_failures,
            terminate_on_unknown_calls: self.terminate_on_unknown_calls,
            available_tools,
            max_consecutive_function_calls: self.max_consecutive_function_calls,
        }
    }

    /// Effective parallel-execution bound.
    pub fn parallel_bound(&self) -> usize {
        self.max_parallel_functions.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cores * 4
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_count_trigger_fires_past_target_plus_threshold() {
        let settings = ReductionSettings {
            trigger: ReductionTrigger::MessageCount,
            target_message_count: 10,
            reduction_threshold: 5,
        };
        assert!(!settings.should_reduce(15));
        assert!(settings.should_reduce(16));
    }

    #[test]
    fn token_triggers_never_fire() {
        let percentage = ReductionSettings {
            trigger: ReductionTrigger::TokenPercentage { percent: 0.8 },
            target_message_count: 1,
            reduction_threshold: 0,
        };
        let absolute = ReductionSettings {
            trigger: ReductionTrigger::AbsoluteTokens { budget: 100 },
            target_message_count: 1,
            reduction_threshold: 0,
        };
        assert!(!percentage.should_reduce(10_000));
        assert!(!absolute.should_reduce(10_000));
    }

    #[test]
    fn parallel_bound_defaults_to_four_times_cores() {
        let config = EngineConfig::default();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(config.parallel_bound(), cores * 4);

        let config = EngineConfig {
            max_parallel_functions: Some(2),
            ..Default::default()
        };
        assert_eq!(config.parallel_bound(), 2);
    }

    #[test]
    fn decision_config_carries_policy_fields() {
        let config = EngineConfig {
            max_iterations: 7,
            terminate_on_unknown_calls: true,
            max_consecutive_function_calls: Some(2),
            ..Default::default()
        };
        let decision = config.decision_config(["a".to_string()].into());
        assert_eq!(decision.max_iterations, 7);
        assert!(decision.terminate_on_unknown_calls);
        assert_eq!(decision.max_consecutive_function_calls, Some(2));
        assert!(decision.available_tools.contains("a"));
    }
}
