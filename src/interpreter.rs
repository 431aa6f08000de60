// Simulator: executes a CompiledTimeline with jsPsych timeline semantics.
// - nodes run in order, each behind its guard; loop bodies once per repetition and row
// - loop_function decides re-runs, on_timeline_finish resolves the loop's branches
// - a jump still pending at the end restarts the session (durable channel survives)
// Responses come from a ResponseSource, so branching logic is testable without a browser.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::context::{ExecutionContext, GuardDecision};
use crate::data::DataLog;
use crate::error::TimelineError;
use crate::hooks::{self, FinishOutcome};
use crate::ir::{CompiledLoop, CompiledTimeline, CompiledTrial, Node, NodeKind, ScopeRef};
use crate::types::{DataRecord, ItemId, RunConfig, StimulusRow};

/// What the participant sees for one trial.
#[derive(Debug, Clone)]
pub struct Presentation<'a> {
    pub trial: &'a CompiledTrial,
    /// Authored parameters with overrides and branch parameters applied.
    pub parameters: &'a DataRecord,
    /// Current timeline-variable row, inside loops with stimuli.
    pub stimulus: Option<&'a StimulusRow>,
}

/// Produces the data a trial records.
pub trait ResponseSource {
    fn respond(&mut self, presentation: &Presentation<'_>) -> DataRecord;
}

/// Canned responses per trial id, consumed in order. The last one repeats once a
/// queue runs dry; trials without a script record nothing but their tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptedResponses {
    queues: BTreeMap<ItemId, VecDeque<DataRecord>>,
}

impl ScriptedResponses {
    pub fn new() -> Self {
        ScriptedResponses::default()
    }

    pub fn push(&mut self, trial_id: impl Into<ItemId>, record: DataRecord) -> &mut Self {
        self.queues.entry(trial_id.into()).or_default().push_back(record);
        self
    }
}

impl ResponseSource for ScriptedResponses {
    fn respond(&mut self, presentation: &Presentation<'_>) -> DataRecord {
        match self.queues.get_mut(&presentation.trial.id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => DataRecord::new(),
        }
    }
}

/// Arranges a loop's timeline-variable rows when `randomize` is set.
pub trait RowOrder {
    fn arrange(&mut self, loop_id: &ItemId, rows: &mut Vec<StimulusRow>);
}

/// Deterministic default: rows stay in materialized order.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepOrder;

impl RowOrder for KeepOrder {
    fn arrange(&mut self, _loop_id: &ItemId, _rows: &mut Vec<StimulusRow>) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Skipped {
        id: ItemId,
        decision: GuardDecision,
    },
    Trial {
        id: ItemId,
        loop_id: Option<ItemId>,
        parameters: DataRecord,
        #[serde(skip_serializing_if = "Option::is_none")]
        stimulus: Option<StimulusRow>,
    },
    LoopRun {
        id: ItemId,
        run: u32,
    },
    Finished {
        id: ItemId,
        #[serde(flatten)]
        outcome: FinishOutcome,
    },
    Restarted {
        target: ItemId,
    },
    JumpDropped {
        target: ItemId,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub trace: Vec<TraceEvent>,
    /// Data of the final session.
    pub data: DataLog,
    /// Data of sessions ended by a restart, oldest first.
    pub archived: Vec<DataLog>,
    pub restarts: u32,
    pub aborted: Option<String>,
    pub context: ExecutionContext,
}

impl RunOutcome {
    /// Trial ids in presentation order, across restarts.
    pub fn executed_trials(&self) -> Vec<ItemId> {
        self.trace
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Trial { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn assemble(
        trace: Vec<TraceEvent>,
        data: DataLog,
        archived: Vec<DataLog>,
        restarts: u32,
        context: ExecutionContext,
    ) -> Self {
        RunOutcome {
            trace,
            data,
            archived,
            restarts,
            aborted: context.aborted().map(str::to_string),
            context,
        }
    }
}

enum Flow {
    Continue,
    Abort,
}

pub struct Runner<'t, R, O = KeepOrder> {
    timeline: &'t CompiledTimeline,
    config: RunConfig,
    responses: R,
    row_order: O,
}

impl<'t, R: ResponseSource> Runner<'t, R, KeepOrder> {
    pub fn new(timeline: &'t CompiledTimeline, config: RunConfig, responses: R) -> Self {
        Runner {
            timeline,
            config,
            responses,
            row_order: KeepOrder,
        }
    }
}

impl<'t, R: ResponseSource, O: RowOrder> Runner<'t, R, O> {
    pub fn with_row_order<P: RowOrder>(self, row_order: P) -> Runner<'t, R, P> {
        Runner {
            timeline: self.timeline,
            config: self.config,
            responses: self.responses,
            row_order,
        }
    }

    /// Run to completion, restarting while a known jump is pending at the end.
    pub fn run(mut self) -> Result<RunOutcome, TimelineError> {
        let mut ctx = ExecutionContext::new();
        let mut trace = Vec::new();
        let mut archived = Vec::new();
        let mut restarts = 0;

        loop {
            let mut session = Session {
                config: &self.config,
                responses: &mut self.responses,
                row_order: &mut self.row_order,
                ctx,
                data: DataLog::new(),
                trace: &mut trace,
            };
            let flow = session.run_sequence(&self.timeline.nodes, None)?;
            let Session { ctx: ended, data, .. } = session;
            ctx = ended;

            if let Flow::Abort = flow {
                log::info!("run aborted: {}", ctx.aborted().unwrap_or("unknown reason"));
                return Ok(RunOutcome::assemble(trace, data, archived, restarts, ctx));
            }

            match ctx.pending_jump().cloned() {
                Some(target) if self.timeline.known_ids.contains(&target) => {
                    restarts += 1;
                    if restarts > self.config.max_restarts {
                        return Err(TimelineError::RestartLimit {
                            target: target.to_string(),
                            limit: self.config.max_restarts,
                        });
                    }
                    log::info!("restarting for pending jump to '{}' ({})", target, restarts);
                    trace.push(TraceEvent::Restarted { target });
                    archived.push(data);
                    ctx = ctx.reload();
                }
                Some(target) => {
                    log::warn!("dropping jump to unknown item '{}'", target);
                    ctx.clear_jump();
                    trace.push(TraceEvent::JumpDropped { target });
                    return Ok(RunOutcome::assemble(trace, data, archived, restarts, ctx));
                }
                None => return Ok(RunOutcome::assemble(trace, data, archived, restarts, ctx)),
            }
        }
    }
}

/// One page load.
struct Session<'s, R, O> {
    config: &'s RunConfig,
    responses: &'s mut R,
    row_order: &'s mut O,
    ctx: ExecutionContext,
    data: DataLog,
    trace: &'s mut Vec<TraceEvent>,
}

impl<R: ResponseSource, O: RowOrder> Session<'_, R, O> {
    fn run_sequence(
        &mut self,
        nodes: &[Node],
        stimulus: Option<&StimulusRow>,
    ) -> Result<Flow, TimelineError> {
        for node in nodes {
            if node.guard.begins_pass {
                self.ctx.reset_pass(&node.guard.scope);
            }
            let decision = self.ctx.decide(&node.guard);
            log::trace!("guard {} -> {:?}", node.id(), decision);
            if !decision.runs() {
                self.trace.push(TraceEvent::Skipped {
                    id: node.id().clone(),
                    decision,
                });
                continue;
            }

            let flow = match &node.kind {
                NodeKind::Trial(trial) => self.run_trial(trial, &node.guard.scope, stimulus),
                NodeKind::Loop(loop_node) => self.run_loop(loop_node)?,
            };
            if let Flow::Abort = flow {
                return Ok(Flow::Abort);
            }
            if node.is_last {
                self.ctx.reset_pass(&node.guard.scope);
            }
        }
        Ok(Flow::Continue)
    }

    fn run_trial(
        &mut self,
        trial: &CompiledTrial,
        scope: &ScopeRef,
        stimulus: Option<&StimulusRow>,
    ) -> Flow {
        let mut parameters = trial.parameters.clone();
        if let Some(overrides) = hooks::select_override(&trial.overrides, &self.data) {
            parameters.extend(overrides.clone());
        }
        if let Some(custom) = self.ctx.custom_parameters_for(scope, &trial.id) {
            parameters.extend(custom.clone());
        }

        let response = self.responses.respond(&Presentation {
            trial,
            parameters: &parameters,
            stimulus,
        });
        self.trace.push(TraceEvent::Trial {
            id: trial.id.clone(),
            loop_id: trial.loop_id.clone(),
            parameters,
            stimulus: stimulus.cloned(),
        });
        self.data.record(&trial.id, trial.loop_id.as_ref(), response);

        let outcome = hooks::finish_trial(&mut self.ctx, &trial.finish, &self.data);
        self.finished(&trial.id, outcome)
    }

    fn run_loop(&mut self, loop_node: &CompiledLoop) -> Result<Flow, TimelineError> {
        let mut runs = 0;
        loop {
            runs += 1;
            if runs > self.config.max_loop_runs {
                return Err(TimelineError::LoopLimit {
                    loop_id: loop_node.id.to_string(),
                    limit: self.config.max_loop_runs,
                });
            }
            self.ctx.enter_loop(&loop_node.scope);
            log::debug!("loop {} run {}", loop_node.id, runs);
            self.trace.push(TraceEvent::LoopRun {
                id: loop_node.id.clone(),
                run: runs,
            });

            let mut rows = loop_node.stimuli.materialize(self.config.participant_number);
            if loop_node.randomize {
                self.row_order.arrange(&loop_node.id, &mut rows);
            }
            for _ in 0..loop_node.repetitions {
                if rows.is_empty() {
                    if let Flow::Abort = self.run_sequence(&loop_node.items, None)? {
                        return Ok(Flow::Abort);
                    }
                }
                for row in &rows {
                    if let Flow::Abort = self.run_sequence(&loop_node.items, Some(row))? {
                        return Ok(Flow::Abort);
                    }
                }
            }

            if !hooks::continue_loop(&mut self.ctx, loop_node, &self.data) {
                break;
            }
        }

        let outcome = hooks::finish_loop(&mut self.ctx, loop_node, &self.data);
        Ok(self.finished(&loop_node.id, outcome))
    }

    fn finished(&mut self, id: &ItemId, outcome: FinishOutcome) -> Flow {
        let flow = match outcome {
            FinishOutcome::Abort => Flow::Abort,
            _ => Flow::Continue,
        };
        if outcome != FinishOutcome::Idle {
            self.trace.push(TraceEvent::Finished {
                id: id.clone(),
                outcome,
            });
        }
        flow
    }
}
