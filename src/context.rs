// Branching state for one experiment session. Replaces the generated script's window
// globals and per-loop closures with one explicit struct:
//   - pending jump: durable store channel (survives a restart) checked first, then memory
//   - per-scope flags: root (the window.* globals) and one set per loop instance
// Transient flags are reset when a loop is entered and at every pass boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ir::{Guard, Route, ScopeRef};
use crate::types::{DataRecord, ItemId};

/// Flag set shared by the items of one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeFlags {
    pub next_trial_id: Option<ItemId>,
    pub skip_remaining: bool,
    pub target_executed: bool,
    pub branching_active: bool,
    pub custom_parameters: Option<DataRecord>,
    pub should_branch_on_finish: bool,
}

impl ScopeFlags {
    /// Clear everything that only lives for one pass through the loop body.
    pub fn reset_pass(&mut self) {
        self.next_trial_id = None;
        self.skip_remaining = false;
        self.target_executed = false;
        self.branching_active = false;
        self.custom_parameters = None;
    }

    /// Arm skip-to-target: items are skipped until `target` runs.
    pub fn arm(&mut self, target: ItemId, custom_parameters: Option<DataRecord>) {
        self.next_trial_id = Some(target);
        self.skip_remaining = true;
        self.target_executed = false;
        self.branching_active = true;
        self.custom_parameters = custom_parameters;
    }
}

/// Why a guard let a node run or skipped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardDecision {
    /// Pending jump named this node; consumed.
    JumpTarget,
    /// Pending jump names something nested in this node.
    JumpThrough,
    /// Pending jump names another node.
    SkippedForJump,
    /// Nothing armed: normal execution.
    Normal,
    /// Scope is skipping to a target and this is it.
    BranchTarget,
    /// Scope is skipping to another target, or its target already ran this pass.
    SkippedForBranch,
}

impl GuardDecision {
    pub fn runs(&self) -> bool {
        matches!(
            self,
            GuardDecision::JumpTarget
                | GuardDecision::JumpThrough
                | GuardDecision::Normal
                | GuardDecision::BranchTarget
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    root: ScopeFlags,
    loops: BTreeMap<String, ScopeFlags>,
    jump_memory: Option<ItemId>,
    jump_store: Option<ItemId>,
    aborted: Option<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        ExecutionContext::default()
    }

    /// Fresh session after a page reload: only the durable jump survives.
    pub fn reload(&self) -> Self {
        ExecutionContext {
            jump_store: self.jump_store.clone(),
            ..ExecutionContext::default()
        }
    }

    pub fn scope(&self, scope: &ScopeRef) -> Option<&ScopeFlags> {
        match scope {
            ScopeRef::Root => Some(&self.root),
            ScopeRef::Loop(name) => self.loops.get(name),
        }
    }

    pub fn scope_mut(&mut self, scope: &ScopeRef) -> &mut ScopeFlags {
        match scope {
            ScopeRef::Root => &mut self.root,
            ScopeRef::Loop(name) => self.loops.entry(name.clone()).or_default(),
        }
    }

    pub fn pending_jump(&self) -> Option<&ItemId> {
        self.jump_store.as_ref().or(self.jump_memory.as_ref())
    }

    pub fn set_jump(&mut self, target: ItemId) {
        self.jump_store = Some(target.clone());
        self.jump_memory = Some(target);
    }

    pub fn clear_jump(&mut self) {
        self.jump_store = None;
        self.jump_memory = None;
    }

    /// Durable channel only, as a restarted session would see it.
    pub fn stored_jump(&self) -> Option<&ItemId> {
        self.jump_store.as_ref()
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.aborted = Some(reason.into());
    }

    pub fn aborted(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    /// The guard in front of every node. May consume the pending jump or mark the
    /// scope's target as executed.
    pub fn decide(&mut self, guard: &Guard) -> GuardDecision {
        if let Some(jump) = self.pending_jump() {
            if *jump == guard.id {
                self.clear_jump();
                return GuardDecision::JumpTarget;
            }
            if guard.members.contains(jump) {
                return GuardDecision::JumpThrough;
            }
            return GuardDecision::SkippedForJump;
        }

        let flags = self.scope_mut(&guard.scope);
        if flags.target_executed {
            return GuardDecision::SkippedForBranch;
        }
        if !flags.skip_remaining {
            return GuardDecision::Normal;
        }
        if flags.next_trial_id.as_ref() == Some(&guard.id) {
            flags.target_executed = true;
            return GuardDecision::BranchTarget;
        }
        GuardDecision::SkippedForBranch
    }

    pub fn should_run(&mut self, guard: &Guard) -> bool {
        self.decide(guard).runs()
    }

    /// Loop entry (on_timeline_start): the loop's own flags start clean.
    pub fn enter_loop(&mut self, scope: &ScopeRef) {
        *self.scope_mut(scope) = ScopeFlags::default();
    }

    pub fn reset_pass(&mut self, scope: &ScopeRef) {
        self.scope_mut(scope).reset_pass();
    }

    /// Deliver a chosen branch target.
    pub fn route(&mut self, route: &Route, target: &ItemId, custom_parameters: Option<DataRecord>) {
        match route {
            Route::Scope(scope) => self.scope_mut(scope).arm(target.clone(), custom_parameters),
            Route::Jump => self.set_jump(target.clone()),
        }
    }

    /// Parameters handed to `id` by the branch that selected it in this pass.
    pub fn custom_parameters_for(&self, scope: &ScopeRef, id: &ItemId) -> Option<&DataRecord> {
        self.scope(scope)
            .filter(|flags| flags.target_executed && flags.next_trial_id.as_ref() == Some(id))
            .and_then(|flags| flags.custom_parameters.as_ref())
    }
}
