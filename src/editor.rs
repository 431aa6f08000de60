// Condition editing as the builder UI does it: CRUD over a condition list, the trials a
// rule may read from, and the data columns a plugin records. Pure data operations; ids
// for new conditions come from the caller (the wasm facade uses the current timestamp).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::{
    BranchCondition, Condition, Operator, ParamsOverrideCondition, RepeatCondition, Rule, RuleSet,
};
use crate::error::TimelineError;
use crate::types::{ItemId, LoopData, TimelineItem};

/// A condition type the editor can manage.
pub trait EditableCondition: RuleSet + Default {
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    fn rules_mut(&mut self) -> &mut Vec<Rule>;
}

/// Conditions that carry a destination item.
pub trait Targeted {
    fn set_target(&mut self, target: Option<ItemId>);
}

macro_rules! editable {
    ($($ty:ty),*) => {
        $(impl EditableCondition for $ty {
            fn id(&self) -> i64 {
                self.id
            }
            fn set_id(&mut self, id: i64) {
                self.id = id;
            }
            fn rules_mut(&mut self) -> &mut Vec<Rule> {
                &mut self.rules
            }
        })*
    };
}

editable!(Condition, BranchCondition, RepeatCondition, ParamsOverrideCondition);

impl Targeted for BranchCondition {
    fn set_target(&mut self, target: Option<ItemId>) {
        self.next_trial_id = target;
    }
}

impl Targeted for RepeatCondition {
    fn set_target(&mut self, target: Option<ItemId>) {
        self.jump_to_trial_id = target;
    }
}

/// A single change to one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum RuleEdit {
    /// Changing the source trial invalidates the column, prop and value.
    TrialId(Option<ItemId>),
    Column(DataColumn),
    Op(Operator),
    Value(String),
}

#[derive(Debug, Clone, Default)]
pub struct ConditionEditor<C> {
    conditions: Vec<C>,
}

impl<C: EditableCondition> ConditionEditor<C> {
    pub fn new(conditions: Vec<C>) -> Self {
        ConditionEditor { conditions }
    }

    pub fn conditions(&self) -> &[C] {
        &self.conditions
    }

    pub fn into_inner(self) -> Vec<C> {
        self.conditions
    }

    fn position(&self, id: i64) -> Result<usize, TimelineError> {
        self.conditions
            .iter()
            .position(|c| c.id() == id)
            .ok_or(TimelineError::UnknownCondition(id))
    }

    fn get_mut(&mut self, id: i64) -> Result<&mut C, TimelineError> {
        let index = self.position(id)?;
        Ok(&mut self.conditions[index])
    }

    /// Append an empty condition with one blank rule. Returns the id actually used:
    /// `id` unless it is already taken.
    pub fn add_condition(&mut self, id: i64) -> i64 {
        let max = self.conditions.iter().map(EditableCondition::id).max();
        let id = match max {
            Some(max) if self.conditions.iter().any(|c| c.id() == id) => max + 1,
            _ => id,
        };
        let mut condition = C::default();
        condition.set_id(id);
        condition.rules_mut().push(Rule::default());
        self.conditions.push(condition);
        id
    }

    pub fn remove_condition(&mut self, id: i64) -> Result<C, TimelineError> {
        let index = self.position(id)?;
        Ok(self.conditions.remove(index))
    }

    /// Append a blank rule; returns its index.
    pub fn add_rule(&mut self, condition: i64) -> Result<usize, TimelineError> {
        let rules = self.get_mut(condition)?.rules_mut();
        rules.push(Rule::default());
        Ok(rules.len() - 1)
    }

    pub fn remove_rule(&mut self, condition: i64, index: usize) -> Result<Rule, TimelineError> {
        let rules = self.get_mut(condition)?.rules_mut();
        if index >= rules.len() {
            return Err(TimelineError::RuleIndex { condition, index });
        }
        Ok(rules.remove(index))
    }

    pub fn update_rule(&mut self, condition: i64, index: usize, edit: RuleEdit) -> Result<(), TimelineError> {
        let rule = self
            .get_mut(condition)?
            .rules_mut()
            .get_mut(index)
            .ok_or(TimelineError::RuleIndex { condition, index })?;
        match edit {
            RuleEdit::TrialId(trial_id) => {
                rule.trial_id = trial_id;
                rule.column.clear();
                rule.prop.clear();
                rule.component_idx = None;
                rule.value.clear();
            }
            RuleEdit::Column(column) => column.apply(rule),
            RuleEdit::Op(op) => rule.op = op,
            RuleEdit::Value(value) => rule.value = value,
        }
        Ok(())
    }
}

impl<C: EditableCondition + Targeted> ConditionEditor<C> {
    /// Set where a branch or repeat condition leads; blank clears it.
    pub fn set_target(&mut self, condition: i64, target: Option<ItemId>) -> Result<(), TimelineError> {
        let target = target.filter(|t| !t.is_blank());
        self.get_mut(condition)?.set_target(target);
        Ok(())
    }
}

impl ConditionEditor<BranchCondition> {
    pub fn set_custom_parameter(&mut self, condition: i64, key: &str, value: Value) -> Result<(), TimelineError> {
        self.get_mut(condition)?
            .custom_parameters
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value);
        Ok(())
    }
}

impl ConditionEditor<ParamsOverrideCondition> {
    pub fn set_override(&mut self, condition: i64, key: &str, value: Value) -> Result<(), TimelineError> {
        self.get_mut(condition)?
            .params_to_override
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove_override(&mut self, condition: i64, key: &str) -> Result<Option<Value>, TimelineError> {
        Ok(self.get_mut(condition)?.params_to_override.remove(key))
    }
}

/// A trial a rule may read from, as offered in the editor dropdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTarget {
    pub id: ItemId,
    pub name: String,
    pub plugin_name: String,
}

fn collect_trials(items: &[TimelineItem], stop_at: Option<&ItemId>, out: &mut Vec<RuleTarget>) -> bool {
    for item in items {
        if Some(item.id()) == stop_at {
            return true;
        }
        match item {
            TimelineItem::Trial(trial) => out.push(RuleTarget {
                id: trial.trial_id.clone(),
                name: trial.trial_name.clone(),
                plugin_name: trial.plugin_name.clone(),
            }),
            TimelineItem::Loop(l) => {
                if collect_trials(&l.items, stop_at, out) {
                    return true;
                }
            }
        }
    }
    false
}

/// Trials that run before `owner` in timeline order. For an owner that is not in the
/// tree (an item still being authored), every trial.
pub fn rule_targets(tree: &[TimelineItem], owner: &ItemId) -> Vec<RuleTarget> {
    let mut out = Vec::new();
    collect_trials(tree, Some(owner), &mut out);
    out
}

/// Trials inside a loop, at any depth: what its loop conditions may read.
pub fn loop_rule_targets(loop_data: &LoopData) -> Vec<RuleTarget> {
    let mut out = Vec::new();
    collect_trials(&loop_data.items, None, &mut out);
    out
}

/// One parameter or data field in plugin metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Plugin metadata as served by `GET /api/metadata/:plugin.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, FieldInfo>,
    #[serde(default)]
    pub data: BTreeMap<String, FieldInfo>,
}

/// A data column a rule can compare against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataColumn {
    pub column: String,
    pub prop: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_idx: Option<String>,
}

impl DataColumn {
    pub fn apply(&self, rule: &mut Rule) {
        rule.column = self.column.clone();
        rule.prop = self.prop.clone();
        rule.component_idx = self.component_idx.clone();
    }
}

impl PluginMetadata {
    pub fn from_json(json: &str) -> Result<Self, TimelineError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Data columns this plugin records. Inside a dynamic trial the component name
    /// prefixes each column.
    pub fn data_columns(&self, component: Option<&str>) -> Vec<DataColumn> {
        let component = component.filter(|c| !c.is_empty());
        self.data
            .keys()
            .map(|prop| DataColumn {
                column: match component {
                    Some(c) => format!("{}_{}", c, prop),
                    None => prop.clone(),
                },
                prop: prop.clone(),
                component_idx: component.map(str::to_string),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trial;
    use serde_json::json;

    fn trial(id: &str) -> TimelineItem {
        let mut t = Trial::new(id, &id.to_uppercase());
        t.plugin_name = "html-keyboard-response".to_string();
        TimelineItem::Trial(t)
    }

    fn tree() -> Vec<TimelineItem> {
        vec![
            trial("intro"),
            TimelineItem::Loop(LoopData::new("block", "Block", vec![trial("a"), trial("b")])),
            trial("end"),
        ]
    }

    fn target_ids(targets: &[RuleTarget]) -> Vec<&str> {
        targets.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn condition_crud() {
        let mut editor: ConditionEditor<BranchCondition> = ConditionEditor::default();
        let first = editor.add_condition(1_700_000_000_000);
        let second = editor.add_condition(1_700_000_000_000);
        assert_eq!(second, first + 1);
        assert_eq!(editor.conditions()[0].rules.len(), 1);

        assert_eq!(editor.add_rule(first).unwrap(), 1);
        editor.remove_rule(first, 0).unwrap();
        assert!(matches!(
            editor.remove_rule(first, 5),
            Err(TimelineError::RuleIndex { index: 5, .. })
        ));

        editor.remove_condition(second).unwrap();
        assert!(matches!(
            editor.remove_condition(second),
            Err(TimelineError::UnknownCondition(_))
        ));
        assert_eq!(editor.into_inner().len(), 1);
    }

    #[test]
    fn changing_trial_clears_rule() {
        let mut editor = ConditionEditor::new(vec![Condition::new(
            1,
            vec![Rule::new("a", "rt", Operator::Gt, "500")],
        )]);
        editor
            .update_rule(1, 0, RuleEdit::TrialId(Some(ItemId::from("b"))))
            .unwrap();
        let rule = &editor.conditions()[0].rules[0];
        assert_eq!(rule.trial_id, Some(ItemId::from("b")));
        assert!(rule.column.is_empty());
        assert!(rule.value.is_empty());
        assert_eq!(rule.op, Operator::Gt);
    }

    #[test]
    fn column_and_value_edits() {
        let mut editor = ConditionEditor::new(vec![Condition::new(1, vec![Rule::default()])]);
        let column = DataColumn {
            column: "survey_response".to_string(),
            prop: "response".to_string(),
            component_idx: Some("survey".to_string()),
        };
        editor.update_rule(1, 0, RuleEdit::Column(column)).unwrap();
        editor.update_rule(1, 0, RuleEdit::Op(Operator::Ne)).unwrap();
        editor.update_rule(1, 0, RuleEdit::Value("yes".to_string())).unwrap();
        let rule = &editor.conditions()[0].rules[0];
        assert_eq!(rule.resolved_column(), "survey_response");
        assert_eq!(rule.op, Operator::Ne);
        assert_eq!(rule.value, "yes");
    }

    #[test]
    fn targets_and_parameters() {
        let mut branches = ConditionEditor::new(vec![BranchCondition::default()]);
        branches.set_target(0, Some(ItemId::from("end"))).unwrap();
        assert_eq!(branches.conditions()[0].target(), Some(&ItemId::from("end")));
        branches.set_target(0, Some(ItemId::from("  "))).unwrap();
        assert!(branches.conditions()[0].target().is_none());
        branches.set_custom_parameter(0, "stimulus", json!("x.png")).unwrap();
        assert_eq!(
            branches.conditions()[0].custom_parameters.as_ref().unwrap()["stimulus"],
            json!("x.png")
        );

        let mut overrides = ConditionEditor::new(vec![ParamsOverrideCondition::default()]);
        overrides.set_override(0, "duration", json!(500)).unwrap();
        assert_eq!(overrides.remove_override(0, "duration").unwrap(), Some(json!(500)));
    }

    #[test]
    fn rule_targets_precede_owner() {
        let tree = tree();
        assert_eq!(target_ids(&rule_targets(&tree, &ItemId::from("b"))), vec!["intro", "a"]);
        assert_eq!(target_ids(&rule_targets(&tree, &ItemId::from("block"))), vec!["intro"]);
        assert_eq!(
            target_ids(&rule_targets(&tree, &ItemId::from("new"))),
            vec!["intro", "a", "b", "end"]
        );
        assert_eq!(rule_targets(&tree, &ItemId::from("a"))[0].name, "INTRO");
    }

    #[test]
    fn loop_targets_are_its_trials() {
        let inner = LoopData::new("inner", "Inner", vec![trial("x")]);
        let outer = LoopData::new("outer", "Outer", vec![trial("a"), TimelineItem::Loop(inner)]);
        assert_eq!(target_ids(&loop_rule_targets(&outer)), vec!["a", "x"]);
    }

    #[test]
    fn metadata_columns() {
        let meta = PluginMetadata::from_json(
            r#"{"name": "html-keyboard-response",
                "parameters": {"stimulus": {"type": "HTML_STRING"}},
                "data": {"response": {"type": "KEY"}, "rt": {"type": "INT"}}}"#,
        )
        .unwrap();
        let plain = meta.data_columns(None);
        assert_eq!(plain[0].column, "response");
        assert_eq!(plain[1].column, "rt");

        let dynamic = meta.data_columns(Some("survey_1"));
        assert_eq!(dynamic[1].column, "survey_1_rt");
        assert_eq!(dynamic[1].component_idx.as_deref(), Some("survey_1"));
    }
}
