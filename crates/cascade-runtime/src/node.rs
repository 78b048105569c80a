//! Node interface
//!
//! The capability contract every executable unit satisfies, and the shared
//! execution context the scheduler passes into each step. Side effects a
//! node requests during a step (change marks, errors, stage activation) are
//! queued as commands on the context and applied by the scheduler right
//! after the step returns; re-entrant mutation of scheduler state from
//! inside a step is not expressible.

use std::time::Duration;

use cascade_ir::{NodeKey, ParamName};

use crate::error::Error;

/// Why a cycle was driven.
///
/// Time-driven nodes evaluate their firing condition only on `TimerTick`
/// cycles; any other reason is a complete no-op for them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunReason {
    #[default]
    TimerTick,
    ChannelInput,
    Other,
}

/// A side effect requested by the currently executing node.
#[derive(Debug)]
pub(crate) enum Command {
    MarkChanged(ParamName),
    ReportError(Error),
    ActivateStage,
}

/// Execution context shared across all node steps in a cycle.
///
/// One instance lives on the scheduler and is reused for every step; the
/// command buffer's allocation is recycled between steps.
#[derive(Debug, Default)]
pub struct Context {
    /// Accumulated elapsed time since program start, caller-supplied.
    pub elapsed: Duration,
    /// Allowed early-fire margin for timers.
    pub tolerance: Duration,
    /// Why this cycle was driven.
    pub reason: RunReason,
    pub(crate) commands: Vec<Command>,
}

impl Context {
    /// Declare that the given output parameter produced a new value this
    /// step. Downstream propagation follows the node's outgoing edges.
    pub fn mark_changed(&mut self, param: impl Into<ParamName>) {
        self.commands.push(Command::MarkChanged(param.into()));
    }

    /// Surface a recoverable error without aborting the cycle.
    pub fn report_error(&mut self, err: Error) {
        self.commands.push(Command::ReportError(err));
    }

    /// Request that the stage associated with this node become the active
    /// stage of its sequence. Ignored unless this node is an entry node.
    pub fn activate_stage(&mut self) {
        self.commands.push(Command::ActivateStage);
    }
}

/// An executable unit owned by the scheduler.
pub trait Node: Send {
    /// One-time setup before any cycles run.
    fn init(&mut self, _ctx: &mut Context) {}

    /// Execute one step of this node.
    fn next(&mut self, ctx: &mut Context);

    /// Clear internal timers and one-shot memory. Called when the stage
    /// containing this node is (re-)activated.
    fn reset(&mut self) {}

    /// Whether the given output parameter currently holds a truthy value.
    /// Gates one-shot edge propagation.
    fn is_output_truthy(&self, param: &ParamName) -> bool;
}

/// Receives errors reported by nodes during execution.
pub type ErrorHandler = Box<dyn FnMut(&NodeKey, &Error) + Send>;

/// Invoked at the end of every cycle, after the changed set is cleared.
/// Used by hosts to release per-cycle scratch buffers.
pub type CycleCallback = Box<dyn FnMut() + Send>;
