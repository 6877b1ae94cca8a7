//! 认知层：感知、决策、评估、Critic、主循环与回放

pub mod critic;
pub mod decision;
pub mod evaluator;
pub mod events;
pub mod loop_;
pub mod memory;
pub mod parse;
pub mod perception;
pub mod replay;

pub use critic::Critic;
pub use decision::{parse_plan, Decider, DecisionInput, LlmDecision, PlanDraft, DECISION_TAG};
pub use evaluator::{clamp_confidence, Evaluation, MatchMode, StepEvaluator, StepOutcome, TermMatcher};
pub use events::{Stage, TraceEvent};
pub use loop_::{AgentLoop, LoopOutcome, LoopPolicy, RunReport};
pub use memory::ContextManager;
pub use parse::{extract_json_block, ParseOutcome};
pub use perception::{parse_snapshot, LlmPerception, Perceiver, PerceptionInput, PerceptionSnapshot, SnapshotKind, PERCEPTION_TAG};
pub use replay::{replay, ReplayReport, ReplayScript};
