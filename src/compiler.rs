// Tree -> IR pass. Walks the authored tree once, threading an explicit CompileContext
// (enclosing scope, loop ids, armed repeat conditions) instead of recomputing names
// at each call site. Branch targets are resolved statically where possible; targets that
// exist nowhere in the tree are reported, not fixed.

use std::collections::{BTreeMap, BTreeSet};

use crate::condition::RepeatCondition;
use crate::error::TimelineError;
use crate::ir::{
    BranchPlan, CompiledLoop, CompiledTimeline, CompiledTrial, Diagnostic, FinishPlan, Guard,
    Node, NodeKind, Route, ScopeRef, Severity,
};
use crate::stimuli::StimulusPlan;
use crate::types::{CompilerConfig, ItemId, LoopData, TimelineItem};

/// Identifier-safe form of an id: ASCII alphanumerics and `_`, everything else `_`.
pub fn sanitize(id: &ItemId) -> String {
    let cleaned: String = id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "item".to_string()
    } else {
        cleaned
    }
}

/// Hands out sanitized names, suffixing `_2`, `_3`, ... on collision.
#[derive(Debug, Default)]
pub struct ScopeNamer {
    used: BTreeSet<String>,
}

impl ScopeNamer {
    pub fn name_for(&mut self, id: &ItemId) -> String {
        let base = sanitize(id);
        if self.used.insert(base.clone()) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}_{}", base, n);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Per-sequence compile state.
#[derive(Debug, Clone)]
pub struct CompileContext {
    pub scope: ScopeRef,
    pub loop_id: Option<ItemId>,
    /// Reported in compile logs only; escalation targets go through `scope`.
    pub parent_loop_id: Option<ItemId>,
    /// The enclosing loop declares branches of its own.
    pub loop_has_branches: bool,
    /// Enclosing loop's repeat conditions, keyed by the child index they fire after.
    pub armed_repeats: BTreeMap<usize, Vec<RepeatCondition>>,
}

impl CompileContext {
    pub fn root() -> Self {
        CompileContext {
            scope: ScopeRef::Root,
            loop_id: None,
            parent_loop_id: None,
            loop_has_branches: false,
            armed_repeats: BTreeMap::new(),
        }
    }
}

struct Compiler<'c> {
    config: &'c CompilerConfig,
    known_ids: BTreeSet<ItemId>,
    namer: ScopeNamer,
    diagnostics: Vec<Diagnostic>,
}

/// Compile an authored tree into the guarded IR.
pub fn compile(
    items: &[TimelineItem],
    config: &CompilerConfig,
) -> Result<CompiledTimeline, TimelineError> {
    let mut compiler = Compiler {
        config,
        known_ids: BTreeSet::new(),
        namer: ScopeNamer::default(),
        diagnostics: Vec::new(),
    };
    compiler.index(items);
    let nodes = compiler.compile_sequence(items, &CompileContext::root())?;

    Ok(CompiledTimeline {
        nodes,
        known_ids: compiler.known_ids,
        diagnostics: compiler.diagnostics,
    })
}

impl Compiler<'_> {
    fn index(&mut self, items: &[TimelineItem]) {
        for item in items {
            if item.id().is_blank() {
                self.diagnose(Severity::Warning, None, format!("'{}' has no id", item.name()));
            } else if !self.known_ids.insert(item.id().clone()) {
                self.diagnose(
                    Severity::Warning,
                    Some(item.id().clone()),
                    format!("duplicate id '{}'; branches to it are ambiguous", item.id()),
                );
            }
            if let TimelineItem::Loop(l) = item {
                self.index(&l.items);
            }
        }
    }

    fn diagnose(&mut self, severity: Severity, item: Option<ItemId>, message: String) {
        match severity {
            Severity::Warning => log::warn!("{}", message),
            Severity::Info => log::debug!("{}", message),
        }
        self.diagnostics.push(Diagnostic {
            severity,
            item,
            message,
        });
    }

    /// Report a branch or jump target that names nothing in the tree. At run time the
    /// guard for it never matches and the remaining timeline is skipped.
    fn check_target(&mut self, from: &ItemId, target: &ItemId) -> Result<(), TimelineError> {
        if self.known_ids.contains(target) {
            return Ok(());
        }
        if self.config.strict_targets {
            return Err(TimelineError::UnresolvedTarget {
                from: from.to_string(),
                target: target.to_string(),
            });
        }
        self.diagnose(
            Severity::Warning,
            Some(from.clone()),
            format!(
                "'{}' targets '{}', which is not in the timeline; the experiment will stall there",
                from, target
            ),
        );
        Ok(())
    }

    fn compile_sequence(
        &mut self,
        items: &[TimelineItem],
        ctx: &CompileContext,
    ) -> Result<Vec<Node>, TimelineError> {
        let mut nodes = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            let later_siblings: BTreeSet<&ItemId> =
                items[index + 1..].iter().map(TimelineItem::id).collect();

            let guard = Guard {
                id: item.id().clone(),
                scope: ctx.scope.clone(),
                members: item.descendant_ids(),
                begins_pass: index == 0 && !ctx.scope.is_root(),
            };

            let branch = self.branch_plan(item, &later_siblings, &ctx.scope)?;
            let escalate_to = if branch.is_none() && ctx.loop_has_branches {
                Some(ctx.scope.clone())
            } else {
                None
            };
            let armed = ctx.armed_repeats.get(&index).cloned().unwrap_or_default();

            let kind = match item {
                TimelineItem::Trial(trial) => {
                    for repeat in &trial.repeat_conditions {
                        if let Some(target) = repeat.target() {
                            self.check_target(&trial.trial_id, target)?;
                        }
                    }
                    let mut repeats = trial.repeat_conditions.clone();
                    repeats.extend(armed);

                    NodeKind::Trial(CompiledTrial {
                        id: trial.trial_id.clone(),
                        name: trial.trial_name.clone(),
                        plugin: trial.plugin_name.clone(),
                        loop_id: ctx.loop_id.clone(),
                        props: trial.timeline_props.clone(),
                        parameters: trial.parameters(),
                        overrides: trial.params_override.clone(),
                        finish: FinishPlan {
                            repeats,
                            branch,
                            escalate_to,
                        },
                    })
                }
                TimelineItem::Loop(loop_data) => {
                    let finish = FinishPlan {
                        repeats: armed,
                        branch,
                        escalate_to,
                    };
                    NodeKind::Loop(self.compile_loop(loop_data, ctx, finish)?)
                }
            };

            nodes.push(Node {
                guard,
                kind,
                is_last: !ctx.scope.is_root() && index + 1 == items.len(),
            });
        }

        Ok(nodes)
    }

    /// Later siblings are reached through the shared scope flags; every other target
    /// goes through the global pending jump.
    fn branch_plan(
        &mut self,
        item: &TimelineItem,
        later_siblings: &BTreeSet<&ItemId>,
        scope: &ScopeRef,
    ) -> Result<Option<BranchPlan>, TimelineError> {
        let branches: Vec<ItemId> = item
            .branches()
            .iter()
            .filter(|b| !b.is_blank())
            .cloned()
            .collect();
        if branches.is_empty() {
            if !item.branch_conditions().is_empty() {
                self.diagnose(
                    Severity::Info,
                    Some(item.id().clone()),
                    format!("'{}' has branch conditions but no branches; ignored", item.id()),
                );
            }
            return Ok(None);
        }

        let mut routes = BTreeMap::new();
        let condition_targets = item.branch_conditions().iter().filter_map(|c| c.target());
        for target in branches.iter().chain(condition_targets) {
            if routes.contains_key(target) {
                continue;
            }
            let route = if later_siblings.contains(target) {
                Route::Scope(scope.clone())
            } else {
                self.check_target(item.id(), target)?;
                Route::Jump
            };
            routes.insert(target.clone(), route);
        }

        Ok(Some(BranchPlan {
            branches,
            conditions: item.branch_conditions().to_vec(),
            routes,
        }))
    }

    /// A loop's repeat condition fires when the body item following the last trial it
    /// reads finishes (or the last item, if that trial is last). Conditions that only read
    /// trials outside the loop fire after the first item.
    fn arm_repeats(
        &mut self,
        loop_data: &LoopData,
    ) -> Result<BTreeMap<usize, Vec<RepeatCondition>>, TimelineError> {
        let mut armed: BTreeMap<usize, Vec<RepeatCondition>> = BTreeMap::new();
        if loop_data.repeat_conditions.is_empty() {
            return Ok(armed);
        }
        if loop_data.items.is_empty() {
            self.diagnose(
                Severity::Info,
                Some(loop_data.loop_id.clone()),
                format!("loop '{}' is empty; its repeat conditions never fire", loop_data.loop_id),
            );
            return Ok(armed);
        }

        for repeat in &loop_data.repeat_conditions {
            if let Some(target) = repeat.target() {
                self.check_target(&loop_data.loop_id, target)?;
            }
            let position = repeat
                .rules
                .iter()
                .filter_map(|rule| rule.target())
                .filter_map(|trial_id| loop_data.items.iter().position(|item| item.contains(trial_id)))
                .map(|found| (found + 1).min(loop_data.items.len() - 1))
                .max()
                .unwrap_or(0);
            armed.entry(position).or_default().push(repeat.clone());
        }
        Ok(armed)
    }

    fn compile_loop(
        &mut self,
        loop_data: &LoopData,
        parent: &CompileContext,
        finish: FinishPlan,
    ) -> Result<CompiledLoop, TimelineError> {
        let scope = ScopeRef::Loop(self.namer.name_for(&loop_data.loop_id));
        let ctx = CompileContext {
            scope: scope.clone(),
            loop_id: Some(loop_data.loop_id.clone()),
            parent_loop_id: parent.loop_id.clone(),
            loop_has_branches: loop_data.branches.iter().any(|b| !b.is_blank()),
            armed_repeats: self.arm_repeats(loop_data)?,
        };
        let items = self.compile_sequence(&loop_data.items, &ctx)?;

        let mut data_scope = BTreeSet::from([loop_data.loop_id.clone()]);
        for child in &items {
            if let NodeKind::Loop(nested) = &child.kind {
                data_scope.extend(nested.data_scope.iter().cloned());
            }
        }

        if loop_data.repetitions == 0 {
            self.diagnose(
                Severity::Info,
                Some(loop_data.loop_id.clone()),
                format!("loop '{}' has zero repetitions and never runs its body", loop_data.loop_id),
            );
        }

        let continuation = if loop_data.is_conditional_loop {
            if loop_data.loop_conditions.is_empty() {
                self.diagnose(
                    Severity::Info,
                    Some(loop_data.loop_id.clone()),
                    format!("conditional loop '{}' has no loop conditions", loop_data.loop_id),
                );
            }
            loop_data.loop_conditions.clone()
        } else {
            Vec::new()
        };

        let terminal = loop_data.branches.is_empty()
            && loop_data.repeat_conditions.is_empty()
            && parent.scope.is_root();

        log::debug!(
            "compiled loop '{}' as {:?} ({} items, parent {:?})",
            loop_data.loop_id,
            scope,
            items.len(),
            ctx.parent_loop_id
        );

        Ok(CompiledLoop {
            id: loop_data.loop_id.clone(),
            name: loop_data.loop_name.clone(),
            scope,
            repetitions: loop_data.repetitions,
            randomize: loop_data.randomize,
            stimuli: StimulusPlan::from_loop(loop_data),
            items,
            continuation,
            data_scope,
            finish,
            terminal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{BranchCondition, Operator, Rule};
    use crate::types::Trial;

    fn trial(id: &str) -> TimelineItem {
        TimelineItem::Trial(Trial::new(id, id))
    }

    fn looped(id: &str, items: Vec<TimelineItem>) -> LoopData {
        LoopData::new(id, id, items)
    }

    fn compile_default(items: &[TimelineItem]) -> CompiledTimeline {
        compile(items, &CompilerConfig::default()).expect("compiles")
    }

    fn loop_node(timeline: &CompiledTimeline, id: &str) -> CompiledLoop {
        match &timeline.find(&ItemId::from(id)).expect("node exists").kind {
            NodeKind::Loop(l) => l.clone(),
            NodeKind::Trial(_) => panic!("{} is a trial", id),
        }
    }

    fn trial_node(timeline: &CompiledTimeline, id: &str) -> CompiledTrial {
        match &timeline.find(&ItemId::from(id)).expect("node exists").kind {
            NodeKind::Trial(t) => t.clone(),
            NodeKind::Loop(_) => panic!("{} is a loop", id),
        }
    }

    #[test]
    fn data_scope_covers_nested_loops() {
        let inner = looped("inner", vec![trial("x")]);
        let middle = looped("middle", vec![TimelineItem::Loop(inner)]);
        let outer = looped("outer", vec![trial("a"), TimelineItem::Loop(middle)]);
        let timeline = compile_default(&[TimelineItem::Loop(outer)]);

        let outer_node = loop_node(&timeline, "outer");
        let scope: Vec<&str> = outer_node
            .data_scope
            .iter()
            .map(ItemId::as_str)
            .collect();
        assert_eq!(scope, vec!["inner", "middle", "outer"]);
        assert_eq!(loop_node(&timeline, "inner").data_scope.len(), 1);
    }

    #[test]
    fn sanitize_replaces_punctuation() {
        assert_eq!(sanitize(&ItemId::from("loop-1.a")), "loop_1_a");
        assert_eq!(sanitize(&ItemId::from("")), "item");
    }

    #[test]
    fn namer_never_collides() {
        let mut namer = ScopeNamer::default();
        assert_eq!(namer.name_for(&ItemId::from("a-b")), "a_b");
        assert_eq!(namer.name_for(&ItemId::from("a_b")), "a_b_2");
        assert_eq!(namer.name_for(&ItemId::from("a.b")), "a_b_3");
    }

    #[test]
    fn guards_and_pass_markers() {
        let timeline = compile_default(&[
            trial("intro"),
            TimelineItem::Loop(looped("block", vec![trial("a"), trial("b"), trial("c")])),
        ]);
        let root = &timeline.nodes;
        assert_eq!(root[0].guard.scope, ScopeRef::Root);
        assert!(!root[0].guard.begins_pass);
        assert!(!root[1].is_last);

        let block = loop_node(&timeline, "block");
        assert_eq!(block.scope, ScopeRef::Loop("block".to_string()));
        assert!(block.items[0].guard.begins_pass);
        assert!(!block.items[1].guard.begins_pass);
        assert!(block.items[2].is_last);
        assert_eq!(root[1].guard.members.len(), 3);
        assert_eq!(block.items[1].guard.scope, block.scope);
        assert!(block.terminal);
        assert_eq!(timeline.known_ids.len(), 5);
    }

    #[test]
    fn later_siblings_route_through_scope_others_jump() {
        let mut a = Trial::new("a", "a");
        a.branches = vec![ItemId::from("c"), ItemId::from("intro")];
        let timeline = compile_default(&[
            trial("intro"),
            TimelineItem::Trial(a),
            trial("b"),
            trial("c"),
        ]);
        let plan = trial_node(&timeline, "a").finish.branch.expect("branch plan");
        assert_eq!(plan.route_for(&ItemId::from("c")), Route::Scope(ScopeRef::Root));
        assert_eq!(plan.route_for(&ItemId::from("intro")), Route::Jump);
        assert!(timeline.warnings().next().is_none());
    }

    #[test]
    fn loop_branches_route_into_parent_scope() {
        let mut inner = looped("inner", vec![trial("x")]);
        inner.branches = vec![ItemId::from("z")];
        let outer = looped(
            "outer",
            vec![TimelineItem::Loop(inner), trial("y"), trial("z")],
        );
        let timeline = compile_default(&[TimelineItem::Loop(outer)]);

        let inner = loop_node(&timeline, "inner");
        let plan = inner.finish.branch.expect("branch plan");
        assert_eq!(
            plan.route_for(&ItemId::from("z")),
            Route::Scope(ScopeRef::Loop("outer".to_string()))
        );
        // The trial inside escalates to its own loop, not to the outer one.
        let x = trial_node(&timeline, "x");
        assert_eq!(x.finish.escalate_to, Some(ScopeRef::Loop("inner".to_string())));
        assert_eq!(x.loop_id, Some(ItemId::from("inner")));
        assert!(!inner.terminal);
    }

    #[test]
    fn unresolved_targets_warn_or_fail() {
        let mut a = Trial::new("a", "a");
        a.branches = vec![ItemId::from("ghost")];
        let items = vec![TimelineItem::Trial(a)];

        let timeline = compile_default(&items);
        let warning = timeline.warnings().next().expect("warning");
        assert!(warning.message.contains("ghost"));
        assert_eq!(warning.item, Some(ItemId::from("a")));

        let strict = CompilerConfig {
            strict_targets: true,
            ..CompilerConfig::default()
        };
        assert!(matches!(
            compile(&items, &strict),
            Err(TimelineError::UnresolvedTarget { .. })
        ));
    }

    #[test]
    fn branch_condition_targets_get_routes() {
        let mut a = Trial::new("a", "a");
        a.branches = vec![ItemId::from("b")];
        a.branch_conditions = vec![BranchCondition::new(
            1,
            vec![Rule::new("a", "rt", Operator::Gt, "1")],
            "c",
        )];
        let timeline = compile_default(&[TimelineItem::Trial(a), trial("b"), trial("c")]);
        let plan = trial_node(&timeline, "a").finish.branch.expect("plan");
        assert_eq!(plan.routes.len(), 2);
        assert_eq!(plan.route_for(&ItemId::from("c")), Route::Scope(ScopeRef::Root));
    }

    #[test]
    fn repeat_conditions_arm_after_referenced_trial() {
        let mut block = looped("block", vec![trial("a"), trial("b"), trial("c")]);
        block.repeat_conditions = vec![
            RepeatCondition::new(1, vec![Rule::new("a", "correct", Operator::Eq, "false")], "a"),
            RepeatCondition::new(2, vec![Rule::new("b", "rt", Operator::Gt, "900")], "a"),
            RepeatCondition::new(3, vec![Rule::new("elsewhere", "x", Operator::Eq, "1")], "a"),
        ];
        let timeline = compile_default(&[trial("elsewhere"), TimelineItem::Loop(block)]);
        let block = loop_node(&timeline, "block");

        let ids = |node: &Node| -> Vec<i64> { node.finish().repeats.iter().map(|r| r.id).collect() };
        assert_eq!(ids(&block.items[0]), vec![3]);
        assert_eq!(ids(&block.items[1]), vec![1]);
        assert_eq!(ids(&block.items[2]), vec![2]);
        assert!(!block.terminal);
    }

    #[test]
    fn conditional_loop_keeps_conditions() {
        let mut block = looped("block", vec![trial("a")]);
        block.is_conditional_loop = true;
        block.loop_conditions = vec![crate::condition::Condition::new(
            1,
            vec![Rule::new("a", "correct", Operator::Eq, "false")],
        )];
        let timeline = compile_default(&[TimelineItem::Loop(block.clone())]);
        assert_eq!(loop_node(&timeline, "block").continuation.len(), 1);

        block.is_conditional_loop = false;
        let timeline = compile_default(&[TimelineItem::Loop(block)]);
        assert!(loop_node(&timeline, "block").continuation.is_empty());
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let timeline = compile_default(&[trial("a"), trial("a")]);
        assert_eq!(timeline.warnings().count(), 1);
    }
}
