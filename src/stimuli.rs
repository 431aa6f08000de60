// Stimulus materialization with per-participant counterbalancing.
// Category: (participant - 1) mod #categories. Order: (participant - 1) mod #orders,
// applied to positions of the category-filtered set. No server-side state needed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{LoopData, ParticipantNumber, StimulusRow};

/// A loop's stimulus table plus its counterbalancing tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StimulusPlan {
    pub rows: Vec<StimulusRow>,
    pub orders: bool,
    pub stimuli_orders: Vec<Vec<usize>>,
    pub categories: bool,
    pub category_data: Vec<Value>,
}

impl StimulusPlan {
    pub fn from_loop(loop_data: &LoopData) -> Self {
        StimulusPlan {
            rows: loop_data.unified_stimuli.clone(),
            orders: loop_data.orders,
            stimuli_orders: loop_data.stimuli_orders.clone(),
            categories: loop_data.categories,
            category_data: loop_data.category_data.clone(),
        }
    }

    /// Rows are used verbatim when neither counterbalancing table is active.
    pub fn is_static(&self) -> bool {
        !self.orders && !self.categories
    }

    /// Distinct categories in order of first appearance.
    pub fn distinct_categories(&self) -> Vec<&Value> {
        let mut distinct: Vec<&Value> = Vec::new();
        for category in &self.category_data {
            if !distinct.contains(&category) {
                distinct.push(category);
            }
        }
        distinct
    }

    /// The category assigned to a participant, if categories are active.
    pub fn category_for(&self, participant: ParticipantNumber) -> Option<&Value> {
        if !self.categories {
            return None;
        }
        let distinct = self.distinct_categories();
        if distinct.is_empty() {
            return None;
        }
        Some(distinct[participant.zero_based() % distinct.len()])
    }

    /// The order permutation assigned to a participant, if orders are active.
    pub fn order_for(&self, participant: ParticipantNumber) -> Option<&[usize]> {
        if !self.orders || self.stimuli_orders.is_empty() {
            return None;
        }
        let index = participant.zero_based() % self.stimuli_orders.len();
        Some(&self.stimuli_orders[index])
    }

    /// Indices into `rows` presented to this participant, in presentation order.
    pub fn select_indices(&self, participant: ParticipantNumber) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.rows.len()).collect();
        if self.is_static() {
            return indices;
        }

        if let Some(category) = self.category_for(participant) {
            indices.retain(|&i| self.category_data.get(i) == Some(category));
        }

        // Order entries are positions within the filtered set; out-of-range ones drop.
        if let Some(order) = self.order_for(participant) {
            let filtered = indices;
            indices = order
                .iter()
                .filter_map(|&position| filtered.get(position).copied())
                .collect();
        }

        indices
    }

    pub fn materialize(&self, participant: ParticipantNumber) -> Vec<StimulusRow> {
        self.select_indices(participant)
            .into_iter()
            .map(|i| self.rows[i].clone())
            .collect()
    }
}
