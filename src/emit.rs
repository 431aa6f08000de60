// JavaScript backend. Turns the IR into a jsPsych timeline script:
//   runtime prelude (src/js/runtime.js), scope declarations, one wrapper per node,
//   root pushes, then the end-of-timeline reload guard for pending jumps.
// All data literals go through serde_json; only trial props are spliced in as text.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::compiler::ScopeNamer;
use crate::error::TimelineError;
use crate::ir::{CompiledLoop, CompiledTimeline, CompiledTrial, FinishPlan, Guard, Node, NodeKind, Route, ScopeRef};
use crate::types::{CompilerConfig, ItemId};

const RUNTIME: &str = include_str!("js/runtime.js");

/// JSON literal safe to embed in a `<script>` element.
fn js_literal<T: Serialize + ?Sized>(value: &T) -> Result<String, TimelineError> {
    Ok(serde_json::to_string(value)?.replace("</", "<\\/"))
}

/// Dotted identifier path such as `timeline` or `window.participantNumber`.
fn check_identifier(field: &str, value: &str) -> Result<(), TimelineError> {
    let valid = !value.is_empty()
        && value.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        });
    if valid {
        Ok(())
    } else {
        Err(TimelineError::InvalidConfig(format!(
            "{} must be a JavaScript identifier, got '{}'",
            field, value
        )))
    }
}

/// Single-line text for a `//` comment.
fn comment(text: &str) -> String {
    text.replace(|c: char| c == '\n' || c == '\r', " ")
}

fn scope_expr(scope: &ScopeRef) -> String {
    match scope {
        ScopeRef::Root => "tlRootScope".to_string(),
        ScopeRef::Loop(name) => format!("tl_scope_{}", name),
    }
}

/// Accumulates indented output lines.
#[derive(Debug, Default)]
struct ScriptWriter {
    out: String,
}

impl ScriptWriter {
    fn line(&mut self, depth: usize, text: &str) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn raw(&mut self, text: &str) {
        self.out.push_str(text);
        if !text.ends_with('\n') {
            self.out.push('\n');
        }
    }
}

struct Emitter<'c> {
    config: &'c CompilerConfig,
    names: ScopeNamer,
    writer: ScriptWriter,
}

/// Generate the experiment script for a compiled timeline.
pub fn emit(timeline: &CompiledTimeline, config: &CompilerConfig) -> Result<String, TimelineError> {
    check_identifier("timeline_var", &config.timeline_var)?;
    check_identifier("participant_global", &config.participant_global)?;

    let mut emitter = Emitter {
        config,
        names: ScopeNamer::default(),
        writer: ScriptWriter::default(),
    };
    emitter.prelude(timeline)?;

    let mut roots = Vec::with_capacity(timeline.nodes.len());
    for node in &timeline.nodes {
        roots.push(emitter.node(node)?);
    }

    let w = &mut emitter.writer;
    w.blank();
    if config.declare_timeline {
        w.line(0, &format!("const {} = [];", config.timeline_var));
    }
    for root in &roots {
        w.line(0, &format!("{}.push({});", config.timeline_var, root));
    }
    if config.emit_reload_guard {
        emitter.reload_guard();
    }
    Ok(emitter.writer.out)
}

impl Emitter<'_> {
    fn prelude(&mut self, timeline: &CompiledTimeline) -> Result<(), TimelineError> {
        let runtime = RUNTIME
            .replace("__JUMP_KEY__", &js_literal(&self.config.jump_storage_key)?)
            .replace("__PARTICIPANT__", &self.config.participant_global);
        self.writer.raw(&runtime);
        self.writer.blank();

        let known: Vec<&str> = timeline.known_ids.iter().map(ItemId::as_str).collect();
        self.writer
            .line(0, &format!("const TL_KNOWN_IDS = {};", js_literal(&known)?));

        let mut scopes = Vec::new();
        collect_loops(&timeline.nodes, &mut scopes);
        for l in scopes {
            self.writer.line(
                0,
                &format!("const {} = tlScope({});", scope_expr(&l.scope), js_literal(l.id.as_str())?),
            );
        }
        Ok(())
    }

    /// Emit a node and everything under it; returns the variable holding it.
    fn node(&mut self, node: &Node) -> Result<String, TimelineError> {
        match &node.kind {
            NodeKind::Trial(trial) => self.trial(node, trial),
            NodeKind::Loop(loop_node) => self.loop_node(node, loop_node),
        }
    }

    fn trial(&mut self, node: &Node, trial: &CompiledTrial) -> Result<String, TimelineError> {
        let name = self.names.name_for(&trial.id);
        let props = if trial.props.trim().is_empty() {
            "{}"
        } else {
            trial.props.trim()
        };
        let finish = self.finish_plan(&trial.finish)?;
        let loop_id = match &trial.loop_id {
            Some(id) => js_literal(id.as_str())?,
            None => "null".to_string(),
        };

        let w = &mut self.writer;
        w.blank();
        w.line(0, &format!("// {} ({})", comment(&trial.name), comment(trial.id.as_str())));
        w.line(0, &format!("const trial_{} = tlInstrument({}, {{", name, props));
        w.line(1, &format!("id: {},", js_literal(trial.id.as_str())?));
        w.line(1, &format!("loopId: {},", loop_id));
        w.line(1, &format!("scope: {},", scope_expr(&node.guard.scope)));
        w.line(1, &format!("overrides: {},", js_literal(&trial.overrides)?));
        w.line(1, &format!("finish: {}", finish));
        w.line(0, "});");

        w.line(0, &format!("const node_{} = {{", name));
        w.line(1, &format!("timeline: [trial_{}],", name));
        self.guard_function(&node.guard)?;
        self.pass_end(node, &[]);
        self.writer.line(0, "};");
        Ok(format!("node_{}", name))
    }

    fn loop_node(&mut self, node: &Node, loop_node: &CompiledLoop) -> Result<String, TimelineError> {
        let mut children = Vec::with_capacity(loop_node.items.len());
        for child in &loop_node.items {
            children.push(self.node(child)?);
        }

        let state = scope_expr(&loop_node.scope);
        let id = js_literal(loop_node.id.as_str())?;
        let members: Vec<&str> = node.guard.members.iter().map(ItemId::as_str).collect();
        let data_scope: Vec<&str> = loop_node.data_scope.iter().map(ItemId::as_str).collect();
        let finish = self.finish_plan(&loop_node.finish)?;
        let var = format!("loop_{}", self.names.name_for(&loop_node.id));

        let w = &mut self.writer;
        w.blank();
        w.line(0, &format!("// loop {} ({})", comment(&loop_node.name), comment(loop_node.id.as_str())));
        w.line(0, &format!("const {} = {{", var));
        w.line(1, &format!("timeline: [{}],", children.join(", ")));
        if !loop_node.stimuli.rows.is_empty() {
            w.line(
                1,
                &format!("timeline_variables: tlMaterialize({}),", js_literal(&loop_node.stimuli)?),
            );
        }
        w.line(1, &format!("repetitions: {},", loop_node.repetitions));
        w.line(1, &format!("randomize_order: {},", loop_node.randomize));
        self.guard_function(&node.guard)?;

        let w = &mut self.writer;
        w.line(1, "on_timeline_start: function () {");
        w.line(2, &format!("tlEnterLoop({});", state));
        w.line(1, "},");
        w.line(1, "loop_function: function () {");
        w.line(
            2,
            &format!(
                "return tlContinueLoop({}, {}, {}, {});",
                id,
                js_literal(&members)?,
                js_literal(&loop_node.continuation)?,
                js_literal(&data_scope)?
            ),
        );
        w.line(1, "},");

        let finish_call = format!("tlFinishLoop({}, {}, {});", state, finish, loop_node.terminal);
        self.pass_end(node, &[finish_call]);
        self.writer.line(0, "};");
        Ok(var)
    }

    fn guard_function(&mut self, guard: &Guard) -> Result<(), TimelineError> {
        let scope = scope_expr(&guard.scope);
        let members: Vec<&str> = guard.members.iter().map(ItemId::as_str).collect();
        let w = &mut self.writer;
        w.line(1, "conditional_function: function () {");
        if guard.begins_pass {
            w.line(2, &format!("tlResetPass({});", scope));
        }
        w.line(
            2,
            &format!(
                "return tlItemGuard({}, {}, {});",
                scope,
                js_literal(guard.id.as_str())?,
                js_literal(&members)?
            ),
        );
        w.line(1, "},");
        Ok(())
    }

    /// on_timeline_finish: the node's own finish work, then the pass reset if it is
    /// the last item of a loop body.
    fn pass_end(&mut self, node: &Node, before: &[String]) {
        let w = &mut self.writer;
        w.line(1, "on_timeline_finish: function () {");
        for call in before {
            w.line(2, call);
        }
        if node.is_last {
            w.line(2, &format!("tlResetPass({});", scope_expr(&node.guard.scope)));
        }
        w.line(1, "}");
    }

    fn finish_plan(&self, plan: &FinishPlan) -> Result<String, TimelineError> {
        let branch = match &plan.branch {
            Some(branch) => {
                let routes: BTreeMap<&str, String> = branch
                    .routes
                    .iter()
                    .filter_map(|(target, route)| match route {
                        Route::Scope(scope) => Some((target.as_str(), scope_expr(scope))),
                        Route::Jump => None,
                    })
                    .collect();
                let mut entries = Vec::with_capacity(routes.len());
                for (target, scope) in routes {
                    entries.push(format!("{}: {}", js_literal(target)?, scope));
                }
                format!(
                    "{{ branches: {}, conditions: {}, routes: {{ {} }} }}",
                    js_literal(&branch.branches)?,
                    js_literal(&branch.conditions)?,
                    entries.join(", ")
                )
            }
            None => "null".to_string(),
        };
        let escalate = plan
            .escalate_to
            .as_ref()
            .map(scope_expr)
            .unwrap_or_else(|| "null".to_string());
        Ok(format!(
            "{{ repeats: {}, branch: {}, escalateTo: {} }}",
            js_literal(&plan.repeats)?,
            branch,
            escalate
        ))
    }

    fn reload_guard(&mut self) {
        let w = &mut self.writer;
        w.blank();
        w.line(0, "// Restart for a jump still pending at the end; drop jumps to unknown items.");
        w.line(0, &format!("{}.push({{", self.config.timeline_var));
        w.line(1, "type: jsPsychCallFunction,");
        w.line(1, "func: function () {");
        w.line(2, "var jump = tlPendingJump();");
        w.line(2, "if (jump === null) return;");
        w.line(2, "if (TL_KNOWN_IDS.indexOf(jump) !== -1) {");
        w.line(3, "window.location.reload();");
        w.line(2, "} else {");
        w.line(3, "tlClearJump();");
        w.line(2, "}");
        w.line(1, "}");
        w.line(0, "});");
    }
}

fn collect_loops<'n>(nodes: &'n [Node], out: &mut Vec<&'n CompiledLoop>) {
    for node in nodes {
        if let NodeKind::Loop(l) = &node.kind {
            out.push(l);
            collect_loops(&l.items, out);
        }
    }
}
