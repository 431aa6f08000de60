// What happens when a node finishes. Shared by the interpreter and mirrored by the
// generated runtime (tlFinish / tlFinishLoop / tlContinueLoop).
// Priority on finish: pending repeat, branch, escalation to the enclosing loop.
// A loop that is terminal and finishes while the top level is mid-branch aborts.

use serde::{Deserialize, Serialize};

use crate::condition::{ParamsOverrideCondition, RepeatCondition};
use crate::context::ExecutionContext;
use crate::data::DataLog;
use crate::evaluator::{evaluate_any, evaluate_condition, first_satisfied, RecordLookup};
use crate::ir::{BranchPlan, CompiledLoop, FinishPlan, Route, ScopeRef};
use crate::types::{DataRecord, ItemId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinishOutcome {
    /// Nothing to do; execution falls through to the next item.
    Idle,
    /// A repeat condition held and set the pending jump.
    Repeat { target: ItemId },
    Branch { target: ItemId, route: Route },
    /// Marked the enclosing loop to resolve its branches when it finishes.
    Escalate { scope: ScopeRef },
    Abort,
}

/// A chosen branch target plus the parameters it hands to the target.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchChoice {
    pub target: ItemId,
    pub custom_parameters: Option<DataRecord>,
}

/// One branch, or no conditions: the first branch. Otherwise the first satisfied
/// condition with a target wins, falling back to the first branch.
pub fn select_branch<L>(plan: &BranchPlan, lookup: &L) -> Option<BranchChoice>
where
    L: RecordLookup + ?Sized,
{
    let first = plan.branches.first()?;
    let fallback = BranchChoice {
        target: first.clone(),
        custom_parameters: None,
    };
    if plan.branches.len() == 1 || plan.conditions.is_empty() {
        return Some(fallback);
    }

    let chosen = plan.conditions.iter().find_map(|condition| {
        let target = condition.target()?;
        evaluate_condition(condition, lookup).then(|| BranchChoice {
            target: target.clone(),
            custom_parameters: condition.custom_parameters.clone(),
        })
    });
    Some(chosen.unwrap_or(fallback))
}

pub fn check_repeats<'r, L>(repeats: &'r [RepeatCondition], lookup: &L) -> Option<&'r ItemId>
where
    L: RecordLookup + ?Sized,
{
    repeats.iter().find_map(|repeat| {
        let target = repeat.target()?;
        evaluate_condition(repeat, lookup).then_some(target)
    })
}

/// Parameters of the first satisfied override condition.
pub fn select_override<'o, L>(overrides: &'o [ParamsOverrideCondition], lookup: &L) -> Option<&'o DataRecord>
where
    L: RecordLookup + ?Sized,
{
    first_satisfied(overrides, lookup).map(|c| &c.params_to_override)
}

fn resolve_branch<L>(ctx: &mut ExecutionContext, plan: &BranchPlan, lookup: &L) -> FinishOutcome
where
    L: RecordLookup + ?Sized,
{
    match select_branch(plan, lookup) {
        Some(choice) => {
            let route = plan.route_for(&choice.target);
            ctx.route(&route, &choice.target, choice.custom_parameters);
            FinishOutcome::Branch {
                target: choice.target,
                route,
            }
        }
        None => FinishOutcome::Idle,
    }
}

fn repeat<L>(ctx: &mut ExecutionContext, plan: &FinishPlan, lookup: &L) -> Option<FinishOutcome>
where
    L: RecordLookup + ?Sized,
{
    let target = check_repeats(&plan.repeats, lookup)?.clone();
    ctx.set_jump(target.clone());
    Some(FinishOutcome::Repeat { target })
}

fn escalate(ctx: &mut ExecutionContext, scope: &ScopeRef) -> FinishOutcome {
    ctx.scope_mut(scope).should_branch_on_finish = true;
    FinishOutcome::Escalate {
        scope: scope.clone(),
    }
}

/// A trial's on_finish.
pub fn finish_trial<L>(ctx: &mut ExecutionContext, plan: &FinishPlan, lookup: &L) -> FinishOutcome
where
    L: RecordLookup + ?Sized,
{
    if let Some(outcome) = repeat(ctx, plan, lookup) {
        return outcome;
    }
    if let Some(branch) = &plan.branch {
        return resolve_branch(ctx, branch, lookup);
    }
    match &plan.escalate_to {
        Some(scope) => escalate(ctx, scope),
        None => FinishOutcome::Idle,
    }
}

/// A loop's on_timeline_finish, after its last run.
pub fn finish_loop<L>(ctx: &mut ExecutionContext, loop_node: &CompiledLoop, lookup: &L) -> FinishOutcome
where
    L: RecordLookup + ?Sized,
{
    // A jump set inside the loop wins over anything the loop would decide.
    if ctx.pending_jump().is_some() {
        return FinishOutcome::Idle;
    }
    let plan = &loop_node.finish;
    if let Some(outcome) = repeat(ctx, plan, lookup) {
        return outcome;
    }

    if let Some(branch) = &plan.branch {
        let flags = ctx.scope_mut(&loop_node.scope);
        if !flags.should_branch_on_finish {
            return FinishOutcome::Idle;
        }
        flags.should_branch_on_finish = false;
        return resolve_branch(ctx, branch, lookup);
    }
    if let Some(scope) = &plan.escalate_to {
        return escalate(ctx, scope);
    }

    let mid_branch = ctx
        .scope(&ScopeRef::Root)
        .map_or(false, |root| root.branching_active);
    if loop_node.terminal && mid_branch {
        ctx.abort(format!("terminal loop '{}' finished during a branch", loop_node.id));
        return FinishOutcome::Abort;
    }
    FinishOutcome::Idle
}

/// A loop's loop_function: run the body again?
pub fn continue_loop(ctx: &mut ExecutionContext, loop_node: &CompiledLoop, data: &DataLog) -> bool {
    if let Some(jump) = ctx.pending_jump().cloned() {
        if jump == loop_node.id {
            ctx.clear_jump();
            return true;
        }
        return loop_node
            .items
            .iter()
            .any(|node| *node.id() == jump || node.guard.members.contains(&jump));
    }
    evaluate_any(&loop_node.continuation, &data.within_loops(&loop_node.data_scope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::condition::{BranchCondition, Condition, Operator, Rule};
    use crate::ir::NodeKind;
    use crate::types::{CompilerConfig, LoopData, TimelineItem, Trial};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record(value: serde_json::Value) -> DataRecord {
        value.as_object().cloned().unwrap_or_default()
    }

    fn plan(branches: &[&str], conditions: Vec<BranchCondition>) -> BranchPlan {
        BranchPlan {
            branches: branches.iter().map(|b| ItemId::from(*b)).collect(),
            conditions,
            routes: BTreeMap::new(),
        }
    }

    fn compiled_loop(data: LoopData) -> CompiledLoop {
        let timeline = compile(&[TimelineItem::Loop(data)], &CompilerConfig::default()).unwrap();
        match timeline.nodes.into_iter().next().unwrap().kind {
            NodeKind::Loop(l) => l,
            NodeKind::Trial(_) => unreachable!(),
        }
    }

    #[test]
    fn default_to_first_branch() {
        let lookup: BTreeMap<ItemId, DataRecord> = BTreeMap::new();
        let choice = select_branch(&plan(&["5", "7"], vec![]), &lookup).unwrap();
        assert_eq!(choice.target, ItemId::from("5"));
        assert!(select_branch(&plan(&[], vec![]), &lookup).is_none());
    }

    #[test]
    fn first_matching_condition_wins() {
        let mut lookup = BTreeMap::new();
        lookup.insert(ItemId::from("q"), record(json!({"response": "yes"})));

        let mut params = DataRecord::new();
        params.insert("difficulty".to_string(), json!("hard"));
        let mut second = BranchCondition::new(
            2,
            vec![Rule::new("q", "response", Operator::Eq, "yes")],
            "7",
        );
        second.custom_parameters = Some(params.clone());
        let conditions = vec![
            BranchCondition::new(1, vec![Rule::new("q", "response", Operator::Eq, "no")], "9"),
            BranchCondition::new(3, vec![Rule::new("q", "response", Operator::Eq, "yes")], ""),
            second,
        ];

        let choice = select_branch(&plan(&["5", "7"], conditions.clone()), &lookup).unwrap();
        assert_eq!(choice.target, ItemId::from("7"));
        assert_eq!(choice.custom_parameters, Some(params));

        lookup.insert(ItemId::from("q"), record(json!({"response": "maybe"})));
        let choice = select_branch(&plan(&["5", "7"], conditions), &lookup).unwrap();
        assert_eq!(choice.target, ItemId::from("5"));
    }

    #[test]
    fn repeat_beats_branch_on_trial_finish() {
        let mut lookup = BTreeMap::new();
        lookup.insert(ItemId::from("a"), record(json!({"correct": false})));
        let finish = FinishPlan {
            repeats: vec![RepeatCondition::new(
                1,
                vec![Rule::new("a", "correct", Operator::Eq, "false")],
                "a",
            )],
            branch: Some(plan(&["c"], vec![])),
            escalate_to: None,
        };
        let mut ctx = ExecutionContext::new();
        assert_eq!(
            finish_trial(&mut ctx, &finish, &lookup),
            FinishOutcome::Repeat { target: ItemId::from("a") }
        );
        assert_eq!(ctx.stored_jump(), Some(&ItemId::from("a")));
    }

    #[test]
    fn trial_without_branches_escalates_one_level() {
        let lookup: BTreeMap<ItemId, DataRecord> = BTreeMap::new();
        let inner = ScopeRef::Loop("inner".to_string());
        let finish = FinishPlan {
            escalate_to: Some(inner.clone()),
            ..FinishPlan::default()
        };
        let mut ctx = ExecutionContext::new();
        finish_trial(&mut ctx, &finish, &lookup);
        assert!(ctx.scope(&inner).unwrap().should_branch_on_finish);
        assert!(ctx.scope(&ScopeRef::Loop("outer".to_string())).is_none());
    }

    #[test]
    fn loop_branches_only_after_escalation() {
        let mut data = LoopData::new("l", "l", vec![TimelineItem::Trial(Trial::new("t", "t"))]);
        data.branches = vec![ItemId::from("5"), ItemId::from("7")];
        let l = compiled_loop(data);
        let lookup: BTreeMap<ItemId, DataRecord> = BTreeMap::new();

        let mut ctx = ExecutionContext::new();
        assert_eq!(finish_loop(&mut ctx, &l, &lookup), FinishOutcome::Idle);

        ctx.scope_mut(&l.scope).should_branch_on_finish = true;
        assert_eq!(
            finish_loop(&mut ctx, &l, &lookup),
            FinishOutcome::Branch { target: ItemId::from("5"), route: Route::Jump }
        );
        assert!(!ctx.scope(&l.scope).unwrap().should_branch_on_finish);
    }

    #[test]
    fn pending_jump_suppresses_loop_finish() {
        let mut data = LoopData::new("l", "l", vec![TimelineItem::Trial(Trial::new("t", "t"))]);
        data.branches = vec![ItemId::from("5")];
        let l = compiled_loop(data);
        let mut ctx = ExecutionContext::new();
        ctx.scope_mut(&l.scope).should_branch_on_finish = true;
        ctx.set_jump(ItemId::from("t"));
        let lookup: BTreeMap<ItemId, DataRecord> = BTreeMap::new();
        assert_eq!(finish_loop(&mut ctx, &l, &lookup), FinishOutcome::Idle);
    }

    #[test]
    fn terminal_loop_aborts_mid_branch() {
        let l = compiled_loop(LoopData::new("end", "end", vec![TimelineItem::Trial(Trial::new("t", "t"))]));
        assert!(l.terminal);
        let lookup: BTreeMap<ItemId, DataRecord> = BTreeMap::new();

        let mut ctx = ExecutionContext::new();
        assert_eq!(finish_loop(&mut ctx, &l, &lookup), FinishOutcome::Idle);

        ctx.route(&Route::Scope(ScopeRef::Root), &ItemId::from("end"), None);
        assert_eq!(finish_loop(&mut ctx, &l, &lookup), FinishOutcome::Abort);
        assert!(ctx.aborted().is_some());
    }

    #[test]
    fn continuation_reads_only_this_loops_data() {
        let mut data = LoopData::new("l", "l", vec![TimelineItem::Trial(Trial::new("t", "t"))]);
        data.is_conditional_loop = true;
        data.loop_conditions = vec![Condition::new(
            1,
            vec![Rule::new("t", "correct", Operator::Eq, "false")],
        )];
        let l = compiled_loop(data);
        let mut ctx = ExecutionContext::new();

        let mut log = DataLog::new();
        log.record(&ItemId::from("t"), Some(&ItemId::from("other")), record(json!({"correct": false})));
        assert!(!continue_loop(&mut ctx, &l, &log));

        log.record(&ItemId::from("t"), Some(&ItemId::from("l")), record(json!({"correct": false})));
        assert!(continue_loop(&mut ctx, &l, &log));
    }

    #[test]
    fn pending_jump_decides_continuation() {
        let l = compiled_loop(LoopData::new("l", "l", vec![TimelineItem::Trial(Trial::new("t", "t"))]));
        let log = DataLog::new();
        let mut ctx = ExecutionContext::new();

        ctx.set_jump(ItemId::from("t"));
        assert!(continue_loop(&mut ctx, &l, &log));
        assert!(ctx.pending_jump().is_some());

        ctx.set_jump(ItemId::from("elsewhere"));
        assert!(!continue_loop(&mut ctx, &l, &log));

        ctx.set_jump(ItemId::from("l"));
        assert!(continue_loop(&mut ctx, &l, &log));
        assert!(ctx.pending_jump().is_none());
    }

    #[test]
    fn override_selection() {
        let mut lookup = BTreeMap::new();
        lookup.insert(ItemId::from("a"), record(json!({"score": 3})));
        let mut easy = DataRecord::new();
        easy.insert("duration".to_string(), json!(2000));
        let overrides = vec![
            ParamsOverrideCondition {
                id: 1,
                rules: vec![Rule::new("a", "score", Operator::Gt, "5")],
                params_to_override: DataRecord::new(),
            },
            ParamsOverrideCondition {
                id: 2,
                rules: vec![Rule::new("a", "score", Operator::Le, "5")],
                params_to_override: easy.clone(),
            },
        ];
        assert_eq!(select_override(&overrides, &lookup), Some(&easy));
    }
}
