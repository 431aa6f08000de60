// Compiled timeline IR. Every node carries the guard that decides whether it runs in
// the current pass and the finish plan applied when it completes. Both the interpreter
// and the JavaScript backend consume this tree.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::condition::{BranchCondition, LoopCondition, ParamsOverrideCondition, RepeatCondition};
use crate::stimuli::StimulusPlan;
use crate::types::{DataRecord, ItemId};

/// Which flag set a node reads and writes: the top-level timeline or one loop instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ScopeRef {
    Root,
    /// Sanitized, collision-free name derived from the loop id.
    Loop(String),
}

impl ScopeRef {
    pub fn is_root(&self) -> bool {
        matches!(self, ScopeRef::Root)
    }
}

/// Run-time decision for a node: checked against the pending jump and the
/// enclosing scope's branch flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    pub id: ItemId,
    pub scope: ScopeRef,
    /// Ids nested inside this node. A pending jump to any of them lets the node run.
    pub members: BTreeSet<ItemId>,
    /// First item of a loop body: resets the scope's transient flags before deciding.
    pub begins_pass: bool,
}

/// Where a chosen branch target is delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "scope", rename_all = "snake_case")]
pub enum Route {
    /// Target is a later sibling: arm that scope's skip-to-target flags.
    Scope(ScopeRef),
    /// Anywhere else: set the global pending jump.
    Jump,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchPlan {
    pub branches: Vec<ItemId>,
    pub conditions: Vec<BranchCondition>,
    pub routes: BTreeMap<ItemId, Route>,
}

impl BranchPlan {
    pub fn route_for(&self, target: &ItemId) -> Route {
        self.routes.get(target).cloned().unwrap_or(Route::Jump)
    }
}

/// What a node's on_finish does, in priority order: repeat, branch, escalate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinishPlan {
    pub repeats: Vec<RepeatCondition>,
    pub branch: Option<BranchPlan>,
    /// Enclosing loop (with branches of its own) to mark should-branch-on-finish.
    pub escalate_to: Option<ScopeRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledTrial {
    pub id: ItemId,
    pub name: String,
    pub plugin: String,
    /// Innermost enclosing loop, written to the `loop_id` data column.
    pub loop_id: Option<ItemId>,
    /// jsPsych trial object source, passed through untouched.
    pub props: String,
    pub parameters: DataRecord,
    pub overrides: Vec<ParamsOverrideCondition>,
    pub finish: FinishPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledLoop {
    pub id: ItemId,
    pub name: String,
    /// This loop's own flag set.
    pub scope: ScopeRef,
    pub repetitions: u32,
    pub randomize: bool,
    pub stimuli: StimulusPlan,
    pub items: Vec<Node>,
    /// Re-run conditions for conditional loops (empty otherwise).
    pub continuation: Vec<LoopCondition>,
    /// Loop ids whose records the continuation reads: this loop and every loop nested in it.
    pub data_scope: BTreeSet<ItemId>,
    pub finish: FinishPlan,
    /// No branches or repeats, placed at the top level: finishing mid-branch aborts.
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Trial(CompiledTrial),
    Loop(CompiledLoop),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub guard: Guard,
    pub kind: NodeKind,
    /// Last item of a loop body: ends the pass when it finishes.
    pub is_last: bool,
}

impl Node {
    pub fn id(&self) -> &ItemId {
        &self.guard.id
    }

    pub fn finish(&self) -> &FinishPlan {
        match &self.kind {
            NodeKind::Trial(t) => &t.finish,
            NodeKind::Loop(l) => &l.finish,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
}

/// A compile-time finding surfaced to the builder UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub item: Option<ItemId>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledTimeline {
    pub nodes: Vec<Node>,
    /// Every trial and loop id in the tree.
    pub known_ids: BTreeSet<ItemId>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompiledTimeline {
    /// Depth-first search for a node by id.
    pub fn find(&self, id: &ItemId) -> Option<&Node> {
        fn walk<'a>(nodes: &'a [Node], id: &ItemId) -> Option<&'a Node> {
            for node in nodes {
                if node.id() == id {
                    return Some(node);
                }
                if let NodeKind::Loop(l) = &node.kind {
                    if let Some(found) = walk(&l.items, id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        walk(&self.nodes, id)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }
}
