// Condition evaluation with the browser's coercion rules.
// Both operands parse as floats: numeric comparison. Otherwise `==`/`!=` compare the
// String() forms and ordering operators fail. Nothing here errors; bad rules are false.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::condition::{Operator, Rule, RuleSet};
use crate::types::{DataRecord, ItemId};

/// Source of "most recent recorded data for trial X".
pub trait RecordLookup {
    fn latest(&self, trial_id: &ItemId) -> Option<&DataRecord>;
}

impl RecordLookup for BTreeMap<ItemId, DataRecord> {
    fn latest(&self, trial_id: &ItemId) -> Option<&DataRecord> {
        self.get(trial_id)
    }
}

/// JavaScript `String(value)`; `None` is `undefined`.
pub fn js_string(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => js_string(Some(other)),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_string(),
    }
}

/// JavaScript `parseFloat`: longest numeric prefix after leading whitespace.
/// Returns `None` where the browser would produce `NaN`.
pub fn parse_float(input: &str) -> Option<f64> {
    let s = input.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    if s[end..].starts_with("Infinity") {
        let negative = bytes.first() == Some(&b'-');
        return Some(if negative { f64::NEG_INFINITY } else { f64::INFINITY });
    }

    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }
    if digits == 0 {
        return None;
    }

    // Exponent only counts when followed by at least one digit.
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().ok()
}

impl Operator {
    /// Compare a recorded value (`None` = missing key) against a rule's value.
    pub fn holds(&self, actual: Option<&Value>, expected: &str) -> bool {
        let actual_text = js_string(actual);
        if let (Some(a), Some(b)) = (parse_float(&actual_text), parse_float(expected)) {
            return match self {
                Operator::Eq => a == b,
                Operator::Ne => a != b,
                Operator::Gt => a > b,
                Operator::Lt => a < b,
                Operator::Ge => a >= b,
                Operator::Le => a <= b,
                Operator::Unsupported => false,
            };
        }
        match self {
            Operator::Eq => actual_text == expected,
            Operator::Ne => actual_text != expected,
            _ => false,
        }
    }
}

/// Evaluate one rule against the record of the trial it references.
pub fn evaluate(rule: &Rule, record: &DataRecord) -> bool {
    if !rule.is_complete() {
        return false;
    }
    let column = rule.resolved_column();
    rule.op.holds(record.get(&column), &rule.value)
}

/// AND over the rules. A condition without rules, or with a rule whose trial has no
/// recorded data yet, is not satisfied.
pub fn evaluate_condition<C, L>(condition: &C, lookup: &L) -> bool
where
    C: RuleSet + ?Sized,
    L: RecordLookup + ?Sized,
{
    let rules = condition.rules();
    !rules.is_empty()
        && rules.iter().all(|rule| match rule.target() {
            Some(trial_id) => lookup
                .latest(trial_id)
                .map(|record| evaluate(rule, record))
                .unwrap_or(false),
            None => false,
        })
}

/// OR over a condition list.
pub fn evaluate_any<C, L>(conditions: &[C], lookup: &L) -> bool
where
    C: RuleSet,
    L: RecordLookup + ?Sized,
{
    conditions.iter().any(|c| evaluate_condition(c, lookup))
}

/// First condition in declaration order that holds.
pub fn first_satisfied<'c, C, L>(conditions: &'c [C], lookup: &L) -> Option<&'c C>
where
    C: RuleSet,
    L: RecordLookup + ?Sized,
{
    conditions.iter().find(|c| evaluate_condition(*c, lookup))
}
