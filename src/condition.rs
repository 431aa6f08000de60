// Condition/rule model shared by loop continuation, branch, repeat and override conditions.
// A condition is the AND of its rules; a list of conditions is satisfied if any member is.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::evaluator::js_string;
use crate::types::{DataRecord, ItemId};

/// Comparison operator. Unknown operator strings deserialize to `Unsupported`,
/// which never holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Unsupported,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Unsupported => "?",
        }
    }
}

impl From<String> for Operator {
    fn from(s: String) -> Self {
        match s.trim() {
            "==" | "===" => Operator::Eq,
            "!=" | "!==" => Operator::Ne,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            ">=" => Operator::Ge,
            "<=" => Operator::Le,
            _ => Operator::Unsupported,
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.symbol().to_string()
    }
}

/// Accepts strings, numbers and booleans for a rule's comparison value.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => js_string(Some(&other)),
    })
}

/// A single comparison against a prior trial's recorded data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub trial_id: Option<ItemId>,
    #[serde(default)]
    pub column: String,
    #[serde(default)]
    pub prop: String,
    /// Component name for dynamically composed trials; prefixes `prop`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_idx: Option<String>,
    #[serde(default)]
    pub op: Operator,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: String,
}

impl Rule {
    pub fn new(trial_id: impl Into<ItemId>, column: &str, op: Operator, value: &str) -> Self {
        Rule {
            trial_id: Some(trial_id.into()),
            column: column.to_string(),
            prop: String::new(),
            component_idx: None,
            op,
            value: value.to_string(),
        }
    }

    /// Data column this rule reads. Falls back to `<component>_<prop>` or `prop`.
    pub fn resolved_column(&self) -> String {
        if !self.column.is_empty() {
            return self.column.clone();
        }
        match &self.component_idx {
            Some(component) if !component.is_empty() && !self.prop.is_empty() => {
                format!("{}_{}", component, self.prop)
            }
            _ => self.prop.clone(),
        }
    }

    /// The trial this rule reads from, if it names one.
    pub fn target(&self) -> Option<&ItemId> {
        self.trial_id.as_ref().filter(|id| !id.is_blank())
    }

    pub fn is_complete(&self) -> bool {
        self.target().is_some() && !self.resolved_column().is_empty()
    }
}

/// Anything that is satisfied by the AND of a rule list.
pub trait RuleSet {
    fn rules(&self) -> &[Rule];
}

/// AND-combined rules. `id` is the creation timestamp assigned by the editor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Rules deciding whether a conditional loop runs another time.
pub type LoopCondition = Condition;

impl Condition {
    pub fn new(id: i64, rules: Vec<Rule>) -> Self {
        Condition { id, rules }
    }
}

impl RuleSet for Condition {
    fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// Condition plus the branch target taken when it holds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchCondition {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub next_trial_id: Option<ItemId>,
    /// Parameters handed to the branch target when this branch is taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_parameters: Option<DataRecord>,
}

impl BranchCondition {
    pub fn new(id: i64, rules: Vec<Rule>, next_trial_id: impl Into<ItemId>) -> Self {
        BranchCondition {
            id,
            rules,
            next_trial_id: Some(next_trial_id.into()),
            custom_parameters: None,
        }
    }

    pub fn target(&self) -> Option<&ItemId> {
        self.next_trial_id.as_ref().filter(|id| !id.is_blank())
    }
}

impl RuleSet for BranchCondition {
    fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// Condition plus the item to jump back to when it holds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatCondition {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub jump_to_trial_id: Option<ItemId>,
}

impl RepeatCondition {
    pub fn new(id: i64, rules: Vec<Rule>, jump_to_trial_id: impl Into<ItemId>) -> Self {
        RepeatCondition {
            id,
            rules,
            jump_to_trial_id: Some(jump_to_trial_id.into()),
        }
    }

    pub fn target(&self) -> Option<&ItemId> {
        self.jump_to_trial_id.as_ref().filter(|id| !id.is_blank())
    }
}

impl RuleSet for RepeatCondition {
    fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// Condition plus the trial parameters replaced when it holds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsOverrideCondition {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub params_to_override: DataRecord,
}

impl RuleSet for ParamsOverrideCondition {
    fn rules(&self) -> &[Rule] {
        &self.rules
    }
}
