// Strong typing over strings. Newtypes for item ids and participant numbers, plus the
// authored timeline tree (trials and loops) exactly as the builder UI serializes it.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::{BranchCondition, LoopCondition, ParamsOverrideCondition, RepeatCondition};
use crate::error::TimelineError;

/// One trial's recorded output: a flat key/value map, as jsPsych stores it.
pub type DataRecord = serde_json::Map<String, Value>;

/// One row of a loop's stimulus table (a jsPsych timeline variable set).
pub type StimulusRow = serde_json::Map<String, Value>;

/// Identifier of a trial or loop. The builder emits both numbers and strings,
/// so ids are normalized to their string form and compared as strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "IdRepr", into = "String")]
pub struct ItemId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(serde_json::Number),
}

impl From<IdRepr> for ItemId {
    fn from(repr: IdRepr) -> Self {
        match repr {
            IdRepr::Text(s) => ItemId(s),
            IdRepr::Number(n) => ItemId(n.to_string()),
        }
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        ItemId(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        ItemId(s)
    }
}

impl From<u64> for ItemId {
    fn from(n: u64) -> Self {
        ItemId(n.to_string())
    }
}

impl ItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id never resolves to an item.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 1-based participant number used for counterbalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantNumber(u32);

impl ParticipantNumber {
    pub fn new(n: u32) -> Self {
        ParticipantNumber(n)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Zero-based index for modulo selection. Participant 0 is treated as 1.
    pub fn zero_based(&self) -> usize {
        self.0.max(1) as usize - 1
    }
}

impl Default for ParticipantNumber {
    fn default() -> Self {
        ParticipantNumber(1)
    }
}

/// A single trial as authored in the builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trial {
    #[serde(alias = "id")]
    pub trial_id: ItemId,
    #[serde(default)]
    pub trial_name: String,
    #[serde(default)]
    pub plugin_name: String,
    /// Pre-rendered source text of the jsPsych trial object. Opaque to the compiler.
    #[serde(default)]
    pub timeline_props: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped_json: Option<Value>,
    #[serde(default)]
    pub branches: Vec<ItemId>,
    #[serde(default)]
    pub branch_conditions: Vec<BranchCondition>,
    #[serde(default)]
    pub repeat_conditions: Vec<RepeatCondition>,
    #[serde(default)]
    pub params_override: Vec<ParamsOverrideCondition>,
}

impl Trial {
    pub fn new(trial_id: impl Into<ItemId>, trial_name: &str) -> Self {
        Trial {
            trial_id: trial_id.into(),
            trial_name: trial_name.to_string(),
            plugin_name: String::new(),
            timeline_props: String::new(),
            mapped_json: None,
            branches: Vec::new(),
            branch_conditions: Vec::new(),
            repeat_conditions: Vec::new(),
            params_override: Vec::new(),
        }
    }

    /// Parameters the simulator presents: `mappedJson` when it is an object.
    pub fn parameters(&self) -> DataRecord {
        match &self.mapped_json {
            Some(Value::Object(map)) => map.clone(),
            _ => DataRecord::new(),
        }
    }
}

fn default_repetitions() -> u32 {
    1
}

/// A repeatable, branchable group of trials and nested loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopData {
    #[serde(alias = "id")]
    pub loop_id: ItemId,
    #[serde(default)]
    pub loop_name: String,
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    #[serde(default)]
    pub randomize: bool,
    #[serde(default)]
    pub orders: bool,
    #[serde(default)]
    pub stimuli_orders: Vec<Vec<usize>>,
    #[serde(default)]
    pub categories: bool,
    #[serde(default)]
    pub category_data: Vec<Value>,
    #[serde(default)]
    pub branches: Vec<ItemId>,
    #[serde(default)]
    pub branch_conditions: Vec<BranchCondition>,
    #[serde(default)]
    pub repeat_conditions: Vec<RepeatCondition>,
    #[serde(default)]
    pub loop_conditions: Vec<LoopCondition>,
    #[serde(default)]
    pub is_conditional_loop: bool,
    #[serde(default)]
    pub items: Vec<TimelineItem>,
    #[serde(default)]
    pub unified_stimuli: Vec<StimulusRow>,
    #[serde(default = "default_true")]
    pub is_loop: bool,
}

impl LoopData {
    pub fn new(loop_id: impl Into<ItemId>, loop_name: &str, items: Vec<TimelineItem>) -> Self {
        LoopData {
            loop_id: loop_id.into(),
            loop_name: loop_name.to_string(),
            repetitions: 1,
            randomize: false,
            orders: false,
            stimuli_orders: Vec::new(),
            categories: false,
            category_data: Vec::new(),
            branches: Vec::new(),
            branch_conditions: Vec::new(),
            repeat_conditions: Vec::new(),
            loop_conditions: Vec::new(),
            is_conditional_loop: false,
            items,
            unified_stimuli: Vec::new(),
            is_loop: true,
        }
    }
}

/// A node of the authored tree. Loops are recognized by `isLoop: true`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TimelineItem {
    Loop(LoopData),
    Trial(Trial),
}

impl<'de> Deserialize<'de> for TimelineItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let is_loop = value.get("isLoop").and_then(Value::as_bool).unwrap_or(false);
        if is_loop {
            serde_json::from_value(value)
                .map(TimelineItem::Loop)
                .map_err(de::Error::custom)
        } else {
            serde_json::from_value(value)
                .map(TimelineItem::Trial)
                .map_err(de::Error::custom)
        }
    }
}

impl TimelineItem {
    pub fn id(&self) -> &ItemId {
        match self {
            TimelineItem::Trial(t) => &t.trial_id,
            TimelineItem::Loop(l) => &l.loop_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TimelineItem::Trial(t) => &t.trial_name,
            TimelineItem::Loop(l) => &l.loop_name,
        }
    }

    pub fn branches(&self) -> &[ItemId] {
        match self {
            TimelineItem::Trial(t) => &t.branches,
            TimelineItem::Loop(l) => &l.branches,
        }
    }

    pub fn branch_conditions(&self) -> &[BranchCondition] {
        match self {
            TimelineItem::Trial(t) => &t.branch_conditions,
            TimelineItem::Loop(l) => &l.branch_conditions,
        }
    }

    /// True when `id` names this item or anything nested inside it.
    pub fn contains(&self, id: &ItemId) -> bool {
        if self.id() == id {
            return true;
        }
        match self {
            TimelineItem::Trial(_) => false,
            TimelineItem::Loop(l) => l.items.iter().any(|item| item.contains(id)),
        }
    }

    /// Ids of everything nested inside this item (not the item itself).
    pub fn descendant_ids(&self) -> BTreeSet<ItemId> {
        let mut ids = BTreeSet::new();
        if let TimelineItem::Loop(l) = self {
            for item in &l.items {
                ids.insert(item.id().clone());
                ids.extend(item.descendant_ids());
            }
        }
        ids
    }
}

/// Parses the builder's JSON array of timeline items. Malformed JSON is a
/// serialization error; well-formed JSON that is not a tree is an invalid timeline.
pub fn parse_timeline(json: &str) -> Result<Vec<TimelineItem>, TimelineError> {
    let value: Value = serde_json::from_str(json)?;
    serde_json::from_value(value).map_err(|e| TimelineError::InvalidTimeline(e.to_string()))
}

fn default_true() -> bool {
    true
}

fn default_timeline_var() -> String {
    "timeline".to_string()
}

fn default_participant_global() -> String {
    "participantNumber".to_string()
}

fn default_jump_storage_key() -> String {
    "jsPsych_jumpToTrial".to_string()
}

/// Compiler configuration passed from JS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Name of the timeline array the generated script pushes into.
    #[serde(default = "default_timeline_var")]
    pub timeline_var: String,
    /// Emit `const <timeline_var> = [];` ahead of the nodes.
    #[serde(default = "default_true")]
    pub declare_timeline: bool,
    /// Global holding the participant number at run time.
    #[serde(default = "default_participant_global")]
    pub participant_global: String,
    /// localStorage key for the durable jump marker.
    #[serde(default = "default_jump_storage_key")]
    pub jump_storage_key: String,
    /// Append the end-of-timeline node that restarts for a pending jump.
    #[serde(default = "default_true")]
    pub emit_reload_guard: bool,
    /// Treat unresolved branch/jump targets as errors.
    #[serde(default)]
    pub strict_targets: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            timeline_var: default_timeline_var(),
            declare_timeline: true,
            participant_global: default_participant_global(),
            jump_storage_key: default_jump_storage_key(),
            emit_reload_guard: true,
            strict_targets: false,
        }
    }
}

fn default_max_restarts() -> u32 {
    3
}

fn default_max_loop_runs() -> u32 {
    100
}

/// Simulator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub participant_number: ParticipantNumber,
    /// Restarts allowed for pending jumps before the run fails.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Upper bound on `loop_function` re-runs of a single loop entry.
    #[serde(default = "default_max_loop_runs")]
    pub max_loop_runs: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            participant_number: ParticipantNumber::default(),
            max_restarts: default_max_restarts(),
            max_loop_runs: default_max_loop_runs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_and_string_ids_normalize() {
        let ids: Vec<ItemId> = serde_json::from_str(r#"[5, "7", 12.5]"#).unwrap();
        assert_eq!(ids[0], ItemId::from("5"));
        assert_eq!(ids[1], ItemId::from(7u64));
        assert_eq!(ids[2].as_str(), "12.5");
    }

    #[test]
    fn parse_errors_distinguish_syntax_from_shape() {
        assert!(matches!(parse_timeline("[{"), Err(TimelineError::Serialization(_))));
        assert!(matches!(
            parse_timeline(r#"{"trialId": 1}"#),
            Err(TimelineError::InvalidTimeline(_))
        ));
        assert!(matches!(
            parse_timeline(r#"[{"trialName": "no id"}]"#),
            Err(TimelineError::InvalidTimeline(_))
        ));
        assert_eq!(parse_timeline(r#"[{"trialId": 1}]"#).map(|items| items.len()).ok(), Some(1));
    }

    #[test]
    fn participant_zero_is_first() {
        assert_eq!(ParticipantNumber::new(0).zero_based(), 0);
        assert_eq!(ParticipantNumber::new(1).zero_based(), 0);
        assert_eq!(ParticipantNumber::new(4).zero_based(), 3);
    }

    #[test]
    fn items_discriminate_on_is_loop() {
        let json = r#"[
            {"trialId": 1, "trialName": "Welcome", "pluginName": "html-keyboard-response", "timelineProps": "{}"},
            {"loopId": "loop_1", "loopName": "Block", "isLoop": true, "repetitions": 2,
             "items": [{"trialId": 2, "trialName": "Probe"}]}
        ]"#;
        let items = parse_timeline(json).unwrap();
        assert!(matches!(items[0], TimelineItem::Trial(_)));
        match &items[1] {
            TimelineItem::Loop(l) => {
                assert_eq!(l.repetitions, 2);
                assert_eq!(l.items.len(), 1);
                assert!(!l.randomize);
            }
            other => panic!("expected loop, got {:?}", other),
        }
        assert!(items[1].contains(&ItemId::from("2")));
        assert!(!items[0].contains(&ItemId::from("2")));
    }

    #[test]
    fn descendant_ids_recurse() {
        let inner = LoopData::new("inner", "Inner", vec![TimelineItem::Trial(Trial::new("t2", "T2"))]);
        let outer = TimelineItem::Loop(LoopData::new(
            "outer",
            "Outer",
            vec![TimelineItem::Trial(Trial::new("t1", "T1")), TimelineItem::Loop(inner)],
        ));
        let ids = outer.descendant_ids();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&ItemId::from("t2")));
        assert!(!ids.contains(&ItemId::from("outer")));
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let config: CompilerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.timeline_var, "timeline");
        assert_eq!(config.jump_storage_key, "jsPsych_jumpToTrial");
        assert!(config.emit_reload_guard);
        assert!(!config.strict_targets);

        let run: RunConfig = serde_json::from_str(r#"{"participant_number": 3}"#).unwrap();
        assert_eq!(run.participant_number.as_u32(), 3);
        assert_eq!(run.max_restarts, 3);
    }
}
