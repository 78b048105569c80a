//! Cascade IR
//!
//! Compiled program model handed over by the compiler: nodes, edges,
//! stratified execution order, and sequence/stage state machines.

pub mod ids;
pub mod program;

pub use ids::{NodeKey, ParamName, SequenceKey, StageKey};
pub use program::{
    entry_key, parse_entry, Edge, EdgeKind, Handle, Node, ParamValue, Program, Sequence, Stage,
    Strata, ENTRY_PREFIX,
};
