// Typed errors with thiserror. Surface meaningful messages to JS.
// Condition evaluation never errors; these cover parsing, strict compiles and run limits.

use thiserror::Error;
use wasm_bindgen::JsValue;

/// Timeline compiler and simulator errors.
#[derive(Error, Debug)]
pub enum TimelineError {
    #[error("Invalid timeline: {0}")]
    InvalidTimeline(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Branch target '{target}' referenced from '{from}' does not exist in the timeline")]
    UnresolvedTarget { from: String, target: String },

    #[error("Loop '{loop_id}' re-ran more than {limit} times")]
    LoopLimit { loop_id: String, limit: u32 },

    #[error("Pending jump to '{target}' still unresolved after {limit} restarts")]
    RestartLimit { target: String, limit: u32 },

    #[error("Unknown condition {0}")]
    UnknownCondition(i64),

    #[error("Rule {index} does not exist on condition {condition}")]
    RuleIndex { condition: i64, index: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TimelineError {
    fn from(err: serde_json::Error) -> Self {
        TimelineError::Serialization(err.to_string())
    }
}

impl From<serde_wasm_bindgen::Error> for TimelineError {
    fn from(err: serde_wasm_bindgen::Error) -> Self {
        TimelineError::Serialization(err.to_string())
    }
}

impl From<TimelineError> for JsValue {
    fn from(err: TimelineError) -> Self {
        JsValue::from_str(&err.to_string())
    }
}
