//! Cycle scheduler
//!
//! Executes nodes in stratified dependency order, propagates change marks
//! along continuous and one-shot edges, and drives sequence/stage state
//! machines to a fixed point within each cycle.
//!
//! Execution flow per cycle:
//!   - the global strata run (stratum 0 unconditionally, later strata only
//!     for nodes marked changed),
//!   - every sequence's active stage runs through the convergence loop
//!     until no stage transition occurs,
//!   - sequences resting in a completed terminal stage are deactivated,
//!   - the global changed set is cleared and the cycle callback fires.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, info, instrument, trace, warn};

use cascade_ir::{parse_entry, Edge, EdgeKind, NodeKey, ParamName, Program, SequenceKey, StageKey, Strata};

use crate::error::{Error, Result};
use crate::node::{Command, Context, CycleCallback, ErrorHandler, Node, RunReason};
use crate::time;

/// Identifies a stage within a sequence by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StageRef {
    sequence: usize,
    stage: usize,
}

/// Execution scope for one strata pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Global,
    Stage(StageRef),
}

/// Read-only topology derived from the program at construction.
///
/// Kept apart from [`ExecState`] so strata iteration never aliases node
/// mutation.
struct Topology {
    global: Strata,
    sequences: Vec<SequenceTopo>,
    /// Entry node key -> the stage it activates.
    transitions: HashMap<NodeKey, StageRef>,
    /// Iteration budget for the stage convergence loop: the sum of all
    /// sequences' stage counts. Each iteration can advance at most one
    /// pending transition per sequence, so a program that needs more has a
    /// transition cycle.
    max_convergence_iterations: usize,
}

struct SequenceTopo {
    key: SequenceKey,
    stages: Vec<StageTopo>,
}

struct StageTopo {
    key: StageKey,
    strata: Strata,
}

impl Topology {
    fn strata_for(&self, scope: Scope) -> &Strata {
        match scope {
            Scope::Global => &self.global,
            Scope::Stage(r) => &self.sequences[r.sequence].stages[r.stage].strata,
        }
    }
}

/// Runtime state for a single node.
struct NodeState {
    instance: Box<dyn Node>,
    /// Outgoing edges grouped by source parameter, precomputed at
    /// construction for O(1) propagation lookup.
    outgoing: IndexMap<ParamName, Vec<Edge>>,
}

/// Mutable per-stage runtime state. The changed set and one-shot memory are
/// scoped to the stage; both start fresh on every activation.
#[derive(Default)]
struct StageState {
    fired_one_shots: HashSet<Edge>,
    changed: HashSet<NodeKey>,
}

struct SequenceState {
    /// Index of the active stage; `None` means the sequence is idle and
    /// none of its stages execute.
    active: Option<usize>,
    stages: Vec<StageState>,
}

/// Mutable execution state.
struct ExecState {
    nodes: IndexMap<NodeKey, NodeState>,
    /// Global-scope changed set, cleared at the end of every cycle.
    changed: HashSet<NodeKey>,
    /// Global-scope one-shot memory; grows for the lifetime of the program.
    fired_one_shots: HashSet<Edge>,
    sequences: Vec<SequenceState>,
    ctx: Context,
    error_handler: Option<ErrorHandler>,
    cycle_callback: Option<CycleCallback>,
    /// Scratch buffer for convergence snapshots, reused across cycles.
    active_snapshot: Vec<Option<usize>>,
}

/// Orchestrates the execution of a compiled program.
///
/// Owns all node runtime state for the lifetime of one running program
/// instance. `next` must run to completion before the next call begins;
/// `&mut self` enforces this at compile time.
pub struct Scheduler {
    topo: Topology,
    exec: ExecState,
}

impl Scheduler {
    /// Build a scheduler from a compiled program and pre-instantiated node
    /// implementations.
    ///
    /// Fails if any program node has no matching instance. Entry-node keys
    /// that do not resolve to a declared (sequence, stage) pair are not
    /// errors; activation requests from them are ignored at runtime.
    pub fn new(
        program: Program,
        mut instances: IndexMap<NodeKey, Box<dyn Node>>,
    ) -> Result<Self> {
        let Program {
            nodes,
            edges,
            strata,
            sequences,
        } = program;

        // Group edges by source node and parameter.
        let mut outgoing: HashMap<NodeKey, IndexMap<ParamName, Vec<Edge>>> = HashMap::new();
        for edge in edges {
            outgoing
                .entry(edge.source.node.clone())
                .or_default()
                .entry(edge.source.param.clone())
                .or_default()
                .push(edge);
        }

        let mut node_states = IndexMap::with_capacity(nodes.len());
        for decl in &nodes {
            let instance = instances
                .shift_remove(&decl.key)
                .ok_or_else(|| Error::NodeNotFound(decl.key.clone()))?;
            node_states.insert(
                decl.key.clone(),
                NodeState {
                    instance,
                    outgoing: outgoing.remove(&decl.key).unwrap_or_default(),
                },
            );
        }

        let mut seq_topos = Vec::with_capacity(sequences.len());
        let mut seq_states = Vec::with_capacity(sequences.len());
        let mut total_stages = 0;
        for seq in sequences {
            let stages: Vec<StageTopo> = seq
                .stages
                .into_iter()
                .map(|s| StageTopo {
                    key: s.key,
                    strata: s.strata,
                })
                .collect();
            total_stages += stages.len();
            seq_states.push(SequenceState {
                active: None,
                stages: stages.iter().map(|_| StageState::default()).collect(),
            });
            seq_topos.push(SequenceTopo {
                key: seq.key,
                stages,
            });
        }

        // Derive the transition table from the entry naming convention.
        // Unresolvable entry keys stay inert.
        let mut transitions = HashMap::new();
        for decl in &nodes {
            let Some((seq_label, stage_label)) = parse_entry(&decl.key) else {
                continue;
            };
            let Some(sequence) = seq_topos.iter().position(|s| s.key.as_str() == seq_label)
            else {
                continue;
            };
            let Some(stage) = seq_topos[sequence]
                .stages
                .iter()
                .position(|s| s.key.as_str() == stage_label)
            else {
                continue;
            };
            transitions.insert(decl.key.clone(), StageRef { sequence, stage });
        }

        info!(
            nodes = node_states.len(),
            sequences = seq_topos.len(),
            entries = transitions.len(),
            "scheduler created"
        );

        let ctx = Context {
            tolerance: time::MIN_TOLERANCE,
            ..Context::default()
        };

        Ok(Self {
            topo: Topology {
                global: strata,
                sequences: seq_topos,
                transitions,
                max_convergence_iterations: total_stages,
            },
            exec: ExecState {
                nodes: node_states,
                changed: HashSet::new(),
                fired_one_shots: HashSet::new(),
                sequences: seq_states,
                ctx,
                error_handler: None,
                cycle_callback: None,
                active_snapshot: Vec::new(),
            },
        })
    }

    /// Configure the handler for node execution errors. Without a handler,
    /// reported errors are dropped.
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.exec.error_handler = Some(handler);
    }

    /// Configure a callback invoked at the end of every cycle.
    pub fn set_cycle_callback(&mut self, callback: CycleCallback) {
        self.exec.cycle_callback = Some(callback);
    }

    /// Set the early-fire tolerance handed to time-driven nodes, typically
    /// `time::tolerance(factory.base_interval())`.
    pub fn set_tolerance(&mut self, tolerance: Duration) {
        self.exec.ctx.tolerance = tolerance;
    }

    /// Mark a node as changed from outside the normal propagation path, so
    /// the next cycle treats it as eligible in non-zero global strata. Used
    /// by external event sources such as newly arrived channel data.
    pub fn mark_node_changed(&mut self, key: impl Into<NodeKey>) {
        self.exec.changed.insert(key.into());
    }

    /// One-time initialization pass over every node: the global strata
    /// first, then each stage's strata in declaration order.
    pub fn init(&mut self) {
        self.exec.ctx.elapsed = Duration::ZERO;
        self.exec.ctx.reason = RunReason::Other;
        self.exec.init_scope(&self.topo, Scope::Global);
        for sequence in 0..self.topo.sequences.len() {
            for stage in 0..self.topo.sequences[sequence].stages.len() {
                self.exec
                    .init_scope(&self.topo, Scope::Stage(StageRef { sequence, stage }));
            }
        }
    }

    /// Advance the reactive computation by one timer-driven cycle.
    /// `elapsed` is the accumulated time since program start, caller
    /// supplied and monotonic; the scheduler never reads a clock itself.
    pub fn next(&mut self, elapsed: Duration) {
        self.next_with_reason(elapsed, RunReason::TimerTick);
    }

    /// Advance one cycle with an explicit reason, for hosts that cycle on
    /// channel input or other external events.
    #[instrument(name = "cycle", skip_all, fields(elapsed = ?elapsed, reason = ?reason))]
    pub fn next_with_reason(&mut self, elapsed: Duration, reason: RunReason) {
        self.exec.ctx.elapsed = elapsed;
        self.exec.ctx.reason = reason;
        self.exec.run_strata(&self.topo, Scope::Global);
        self.exec.converge_stages(&self.topo);
        self.exec.check_terminal_stages(&self.topo);
        self.exec.changed.clear();
        if let Some(callback) = self.exec.cycle_callback.as_mut() {
            callback();
        }
    }

    /// Whether the given sequence currently has an active stage.
    pub fn is_sequence_active(&self, key: &SequenceKey) -> bool {
        self.sequence_index(key)
            .map_or(false, |s| self.exec.sequences[s].active.is_some())
    }

    /// The key of the given sequence's active stage, if any.
    pub fn active_stage_of(&self, key: &SequenceKey) -> Option<&StageKey> {
        let sequence = self.sequence_index(key)?;
        let stage = self.exec.sequences[sequence].active?;
        Some(&self.topo.sequences[sequence].stages[stage].key)
    }

    fn sequence_index(&self, key: &SequenceKey) -> Option<usize> {
        self.topo.sequences.iter().position(|s| s.key == *key)
    }
}

impl ExecState {
    fn init_scope(&mut self, topo: &Topology, scope: Scope) {
        for key in topo.strata_for(scope).keys() {
            let Some(state) = self.nodes.get_mut(key) else {
                continue;
            };
            state.instance.init(&mut self.ctx);
            self.apply_commands(topo, key, scope);
        }
    }

    /// Execute one strata pass: stratum 0 unconditionally, later strata
    /// only for nodes present in the scope's changed set when their stratum
    /// is reached.
    fn run_strata(&mut self, topo: &Topology, scope: Scope) {
        if let Scope::Stage(r) = scope {
            // Each stage pass starts from a clean slate. The global set is
            // instead cleared at the end of the cycle so marks injected
            // between cycles survive into the pass.
            self.sequences[r.sequence].stages[r.stage].changed.clear();
        }
        let strata = topo.strata_for(scope);
        for (index, stratum) in strata.iter().enumerate() {
            for key in stratum {
                if index > 0 && !self.changed_set(scope).contains(key) {
                    continue;
                }
                self.step_node(topo, key, scope);
            }
        }
    }

    fn changed_set(&self, scope: Scope) -> &HashSet<NodeKey> {
        match scope {
            Scope::Global => &self.changed,
            Scope::Stage(r) => &self.sequences[r.sequence].stages[r.stage].changed,
        }
    }

    fn step_node(&mut self, topo: &Topology, key: &NodeKey, scope: Scope) {
        let Some(state) = self.nodes.get_mut(key) else {
            trace!(node = %key, "no instance for scheduled node");
            return;
        };
        trace!(node = %key, "step");
        state.instance.next(&mut self.ctx);
        self.apply_commands(topo, key, scope);
    }

    /// Apply the commands the node queued during its step, before the next
    /// node executes. Commands only affect state reachable at or after the
    /// current stratum; earlier strata in the pass are never revisited.
    fn apply_commands(&mut self, topo: &Topology, key: &NodeKey, scope: Scope) {
        if self.ctx.commands.is_empty() {
            return;
        }
        let mut commands = mem::take(&mut self.ctx.commands);
        for command in commands.drain(..) {
            match command {
                Command::MarkChanged(param) => self.propagate(key, &param, scope),
                Command::ReportError(err) => {
                    debug!(node = %key, error = %err, "node reported error");
                    if let Some(handler) = self.error_handler.as_mut() {
                        handler(key, &err);
                    }
                }
                Command::ActivateStage => self.activate_stage(topo, key, scope),
            }
        }
        // Hand the buffer's allocation back for the next step.
        self.ctx.commands = commands;
    }

    fn propagate(&mut self, key: &NodeKey, param: &ParamName, scope: Scope) {
        let Some(state) = self.nodes.get(key) else {
            return;
        };
        let Some(edges) = state.outgoing.get(param) else {
            return;
        };
        for edge in edges {
            if edge.kind == EdgeKind::OneShot {
                // A one-shot never fires on a falsy value, even though the
                // output changed.
                if !state.instance.is_output_truthy(param) {
                    trace!(edge = %edge, "one-shot source falsy, not firing");
                    continue;
                }
                let fired = match scope {
                    Scope::Global => &mut self.fired_one_shots,
                    Scope::Stage(r) => {
                        &mut self.sequences[r.sequence].stages[r.stage].fired_one_shots
                    }
                };
                if !fired.insert(edge.clone()) {
                    trace!(edge = %edge, "one-shot already fired in this scope");
                    continue;
                }
                debug!(edge = %edge, "one-shot fired");
            }
            let changed = match scope {
                Scope::Global => &mut self.changed,
                Scope::Stage(r) => &mut self.sequences[r.sequence].stages[r.stage].changed,
            };
            changed.insert(edge.target.node.clone());
        }
    }

    /// Handle an activation request from the currently executing node.
    /// Requests from keys absent from the transition table are wholly
    /// inert: the current stage stays active.
    fn activate_stage(&mut self, topo: &Topology, key: &NodeKey, scope: Scope) {
        let Some(target) = topo.transitions.get(key).copied() else {
            trace!(node = %key, "activation request from non-entry node ignored");
            return;
        };
        // Leaving the old stage is a distinct step from entering the new
        // one, even when both belong to the same sequence.
        if let Scope::Stage(r) = scope {
            self.sequences[r.sequence].active = None;
        }
        let stage_state = &mut self.sequences[target.sequence].stages[target.stage];
        stage_state.fired_one_shots.clear();
        stage_state.changed.clear();
        for member in topo.sequences[target.sequence].stages[target.stage]
            .strata
            .keys()
        {
            if let Some(state) = self.nodes.get_mut(member) {
                state.instance.reset();
            }
        }
        self.sequences[target.sequence].active = Some(target.stage);
        debug!(
            sequence = %topo.sequences[target.sequence].key,
            stage = %topo.sequences[target.sequence].stages[target.stage].key,
            "stage activated"
        );
    }

    /// Re-run active stages until no transition occurs, bounded by the
    /// precomputed iteration budget. A newly activated stage executes
    /// within the same cycle. Budget exhaustion is a policy choice, not an
    /// error: partially applied transitions stand.
    fn converge_stages(&mut self, topo: &Topology) {
        for iteration in 0..topo.max_convergence_iterations {
            let mut snapshot = mem::take(&mut self.active_snapshot);
            snapshot.clear();
            snapshot.extend(self.sequences.iter().map(|s| s.active));

            for sequence in 0..self.sequences.len() {
                let Some(stage) = self.sequences[sequence].active else {
                    continue;
                };
                self.run_strata(topo, Scope::Stage(StageRef { sequence, stage }));
            }

            let stable = self
                .sequences
                .iter()
                .map(|s| s.active)
                .eq(snapshot.iter().copied());
            self.active_snapshot = snapshot;
            if stable {
                trace!(iteration, "stages stable");
                return;
            }
        }
        if topo.max_convergence_iterations > 0 {
            warn!(
                budget = topo.max_convergence_iterations,
                "stage transitions did not stabilize within the iteration budget"
            );
        }
    }

    /// Deactivate sequences resting in their final stage once every
    /// one-shot edge originating inside that stage has fired.
    fn check_terminal_stages(&mut self, topo: &Topology) {
        for sequence in 0..self.sequences.len() {
            let Some(stage) = self.sequences[sequence].active else {
                continue;
            };
            if stage + 1 < topo.sequences[sequence].stages.len() {
                continue;
            }
            if self.stage_has_unfired_one_shots(topo, sequence, stage) {
                continue;
            }
            debug!(
                sequence = %topo.sequences[sequence].key,
                "terminal stage complete, sequence deactivated"
            );
            self.sequences[sequence].active = None;
        }
    }

    fn stage_has_unfired_one_shots(
        &self,
        topo: &Topology,
        sequence: usize,
        stage: usize,
    ) -> bool {
        let fired = &self.sequences[sequence].stages[stage].fired_one_shots;
        for key in topo.sequences[sequence].stages[stage].strata.keys() {
            let Some(state) = self.nodes.get(key) else {
                continue;
            };
            for edges in state.outgoing.values() {
                for edge in edges {
                    if edge.kind == EdgeKind::OneShot && !fired.contains(edge) {
                        return true;
                    }
                }
            }
        }
        false
    }
}
