// timeline_core: Rust/WASM compiler for branching, looping jsPsych timelines.
// The builder UI hands over the authored tree as JSON; everything else (guards, branch
// resolution, counterbalancing, script generation, preview runs) happens here.

mod compiler;
mod condition;
mod context;
mod data;
mod editor;
mod emit;
mod error;
mod evaluator;
mod hooks;
mod interpreter;
mod ir;
mod stimuli;
mod types;

use wasm_bindgen::prelude::*;

pub use compiler::{compile, sanitize, CompileContext, ScopeNamer};
pub use condition::{
    BranchCondition, Condition, LoopCondition, Operator, ParamsOverrideCondition, RepeatCondition,
    Rule, RuleSet,
};
pub use context::{ExecutionContext, GuardDecision, ScopeFlags};
pub use data::{DataLog, LoopScopedData, LOOP_ID_COLUMN, TRIAL_ID_COLUMN};
pub use editor::{
    loop_rule_targets, rule_targets, ConditionEditor, DataColumn, EditableCondition, FieldInfo,
    PluginMetadata, RuleEdit, RuleTarget, Targeted,
};
pub use emit::emit;
pub use error::TimelineError;
pub use evaluator::{evaluate, evaluate_any, evaluate_condition, first_satisfied, RecordLookup};
pub use hooks::{
    check_repeats, continue_loop, finish_loop, finish_trial, select_branch, select_override,
    BranchChoice, FinishOutcome,
};
pub use interpreter::{
    KeepOrder, Presentation, ResponseSource, RowOrder, RunOutcome, Runner, ScriptedResponses,
    TraceEvent,
};
pub use ir::{
    BranchPlan, CompiledLoop, CompiledTimeline, CompiledTrial, Diagnostic, FinishPlan, Guard, Node,
    NodeKind, Route, ScopeRef, Severity,
};
pub use stimuli::StimulusPlan;
pub use types::*;

/// Initialize panic hook for better error messages in browser console.
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(json: &str) -> Result<T, TimelineError> {
    if json.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(json)?)
}

/// Compiler interface exposed to JavaScript. One instance per configuration; every
/// call takes the full tree so the UI never has to keep Rust state in sync.
#[wasm_bindgen]
pub struct TimelineCompiler {
    config: CompilerConfig,
}

impl TimelineCompiler {
    fn build(&self, items: &[TimelineItem]) -> Result<CompiledTimeline, TimelineError> {
        compile(items, &self.config)
    }

    fn script(&self, items: &[TimelineItem]) -> Result<String, TimelineError> {
        let timeline = self.build(items)?;
        emit(&timeline, &self.config)
    }
}

#[wasm_bindgen]
impl TimelineCompiler {
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str) -> Result<TimelineCompiler, JsValue> {
        let config: CompilerConfig = parse_or_default(config_json)
            .map_err(|e| JsValue::from_str(&format!("Invalid config: {}", e)))?;
        Ok(TimelineCompiler { config })
    }

    /// Compile a timeline tree (JSON array of trials and loops) into the experiment script.
    pub fn compile(&self, tree_json: &str) -> Result<String, JsValue> {
        let items = parse_timeline(tree_json)?;
        Ok(self.script(&items)?)
    }

    /// Same as `compile`, taking the tree as a JS object instead of a JSON string.
    pub fn compile_object(&self, tree: JsValue) -> Result<String, JsValue> {
        let items: Vec<TimelineItem> =
            serde_wasm_bindgen::from_value(tree).map_err(TimelineError::from)?;
        Ok(self.script(&items)?)
    }

    /// The compiled IR as JSON, for inspection in the builder.
    pub fn compile_ir(&self, tree_json: &str) -> Result<String, JsValue> {
        let items = parse_timeline(tree_json)?;
        let timeline = self.build(&items)?;
        serde_json::to_string(&timeline)
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Compile-time findings only (unresolved targets, duplicate ids, empty loops).
    pub fn diagnostics(&self, tree_json: &str) -> Result<String, JsValue> {
        let items = parse_timeline(tree_json)?;
        let timeline = self.build(&items)?;
        serde_json::to_string(&timeline.diagnostics)
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    /// Preview run with scripted responses: `{ trialId: [record, ...] }`.
    pub fn simulate(
        &self,
        tree_json: &str,
        responses_json: &str,
        run_config_json: &str,
    ) -> Result<String, JsValue> {
        Ok(self.simulate_json(tree_json, responses_json, run_config_json)?)
    }
}

impl TimelineCompiler {
    fn simulate_json(
        &self,
        tree_json: &str,
        responses_json: &str,
        run_config_json: &str,
    ) -> Result<String, TimelineError> {
        let items = parse_timeline(tree_json)?;
        let responses: ScriptedResponses = parse_or_default(responses_json)?;
        let run_config: RunConfig = parse_or_default(run_config_json)
            .map_err(|e| TimelineError::InvalidConfig(e.to_string()))?;
        let timeline = self.build(&items)?;
        let outcome = Runner::new(&timeline, run_config, responses).run()?;
        Ok(serde_json::to_string(&outcome)?)
    }
}

/// OR over a condition list against `{ trialId: record }`.
#[wasm_bindgen]
pub fn evaluate_conditions(conditions_json: &str, records_json: &str) -> Result<bool, JsValue> {
    let conditions: Vec<Condition> = serde_json::from_str(conditions_json).map_err(TimelineError::from)?;
    let records: std::collections::BTreeMap<ItemId, DataRecord> =
        serde_json::from_str(records_json).map_err(TimelineError::from)?;
    Ok(evaluate_any(&conditions, &records))
}

/// Trials a rule owned by `owner_id` may read from.
#[wasm_bindgen]
pub fn available_rule_targets(tree_json: &str, owner_id: &str) -> Result<String, JsValue> {
    let items = parse_timeline(tree_json)?;
    let targets = rule_targets(&items, &ItemId::from(owner_id));
    Ok(serde_json::to_string(&targets).map_err(TimelineError::from)?)
}

/// Trials a loop's own conditions may read from.
#[wasm_bindgen]
pub fn available_loop_rule_targets(loop_json: &str) -> Result<String, JsValue> {
    let loop_data: LoopData = serde_json::from_str(loop_json).map_err(TimelineError::from)?;
    Ok(serde_json::to_string(&loop_rule_targets(&loop_data)).map_err(TimelineError::from)?)
}

/// Data columns from a plugin's metadata, prefixed when the trial is dynamic.
#[wasm_bindgen]
pub fn plugin_data_columns(metadata_json: &str, component: Option<String>) -> Result<String, JsValue> {
    let metadata = PluginMetadata::from_json(metadata_json)?;
    let columns = metadata.data_columns(component.as_deref());
    Ok(serde_json::to_string(&columns).map_err(TimelineError::from)?)
}

enum EditorState {
    Loop(ConditionEditor<Condition>),
    Branch(ConditionEditor<BranchCondition>),
    Repeat(ConditionEditor<RepeatCondition>),
    Override(ConditionEditor<ParamsOverrideCondition>),
}

macro_rules! each_editor {
    ($state:expr, $editor:ident => $body:expr) => {
        match $state {
            EditorState::Loop($editor) => $body,
            EditorState::Branch($editor) => $body,
            EditorState::Repeat($editor) => $body,
            EditorState::Override($editor) => $body,
        }
    };
}

impl EditorState {
    fn parse(kind: &str, json: &str) -> Result<Self, TimelineError> {
        Ok(match kind {
            "loop" => EditorState::Loop(ConditionEditor::new(parse_or_default(json)?)),
            "branch" => EditorState::Branch(ConditionEditor::new(parse_or_default(json)?)),
            "repeat" => EditorState::Repeat(ConditionEditor::new(parse_or_default(json)?)),
            "override" => EditorState::Override(ConditionEditor::new(parse_or_default(json)?)),
            other => {
                return Err(TimelineError::InvalidConfig(format!(
                    "unknown condition kind '{}'",
                    other
                )))
            }
        })
    }

    fn add_condition(&mut self, id: i64) -> i64 {
        each_editor!(self, editor => editor.add_condition(id))
    }

    fn remove_condition(&mut self, id: i64) -> Result<(), TimelineError> {
        each_editor!(self, editor => editor.remove_condition(id).map(|_| ()))
    }

    fn add_rule(&mut self, id: i64) -> Result<usize, TimelineError> {
        each_editor!(self, editor => editor.add_rule(id))
    }

    fn remove_rule(&mut self, id: i64, index: usize) -> Result<(), TimelineError> {
        each_editor!(self, editor => editor.remove_rule(id, index).map(|_| ()))
    }

    fn update_rule(&mut self, id: i64, index: usize, edit: RuleEdit) -> Result<(), TimelineError> {
        each_editor!(self, editor => editor.update_rule(id, index, edit))
    }

    fn set_target(&mut self, id: i64, target: Option<ItemId>) -> Result<(), TimelineError> {
        match self {
            EditorState::Branch(editor) => editor.set_target(id, target),
            EditorState::Repeat(editor) => editor.set_target(id, target),
            _ => Err(TimelineError::InvalidConfig(
                "only branch and repeat conditions have targets".to_string(),
            )),
        }
    }

    fn set_parameter(&mut self, id: i64, key: &str, value: serde_json::Value) -> Result<(), TimelineError> {
        match self {
            EditorState::Branch(editor) => editor.set_custom_parameter(id, key, value),
            EditorState::Override(editor) => editor.set_override(id, key, value),
            _ => Err(TimelineError::InvalidConfig(
                "only branch and override conditions carry parameters".to_string(),
            )),
        }
    }

    fn to_json(&self) -> Result<String, TimelineError> {
        Ok(each_editor!(self, editor => serde_json::to_string(editor.conditions())?))
    }
}

/// Condition editor exposed to JavaScript. `kind` is one of
/// `loop`, `branch`, `repeat`, `override`.
#[wasm_bindgen]
pub struct WasmConditionEditor {
    state: EditorState,
}

#[wasm_bindgen]
impl WasmConditionEditor {
    #[wasm_bindgen(constructor)]
    pub fn new(kind: &str, conditions_json: &str) -> Result<WasmConditionEditor, JsValue> {
        Ok(WasmConditionEditor {
            state: EditorState::parse(kind, conditions_json)?,
        })
    }

    /// Add a condition stamped with the current time; returns its id.
    pub fn add_condition(&mut self) -> f64 {
        let now = js_sys::Date::now() as i64;
        self.state.add_condition(now) as f64
    }

    pub fn remove_condition(&mut self, id: f64) -> Result<(), JsValue> {
        Ok(self.state.remove_condition(id as i64)?)
    }

    pub fn add_rule(&mut self, id: f64) -> Result<usize, JsValue> {
        Ok(self.state.add_rule(id as i64)?)
    }

    pub fn remove_rule(&mut self, id: f64, index: usize) -> Result<(), JsValue> {
        Ok(self.state.remove_rule(id as i64, index)?)
    }

    /// `edit_json` is `{ "field": "trialId" | "column" | "op" | "value", "value": ... }`.
    pub fn update_rule(&mut self, id: f64, index: usize, edit_json: &str) -> Result<(), JsValue> {
        let edit: RuleEdit = serde_json::from_str(edit_json).map_err(TimelineError::from)?;
        Ok(self.state.update_rule(id as i64, index, edit)?)
    }

    pub fn set_target(&mut self, id: f64, target: Option<String>) -> Result<(), JsValue> {
        Ok(self.state.set_target(id as i64, target.map(ItemId::from))?)
    }

    pub fn set_parameter(&mut self, id: f64, key: &str, value_json: &str) -> Result<(), JsValue> {
        let value: serde_json::Value = serde_json::from_str(value_json).map_err(TimelineError::from)?;
        Ok(self.state.set_parameter(id as i64, key, value)?)
    }

    pub fn to_json(&self) -> Result<String, JsValue> {
        Ok(self.state.to_json()?)
    }
}
