//! Compiled program model
//!
//! These types are produced by the external compiler and consumed by the
//! runtime. They are immutable after load; the runtime builds its own
//! lookup structures from them at construction.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ids::{NodeKey, ParamName, SequenceKey, StageKey};

/// Prefix the compiler uses to label stage entry nodes.
///
/// An entry node is keyed `entry_{sequence}_{stage}`. Sequence keys never
/// contain an underscore; stage keys may.
pub const ENTRY_PREFIX: &str = "entry_";

/// Build the node key for the entry node of `(sequence, stage)`.
pub fn entry_key(sequence: &SequenceKey, stage: &StageKey) -> NodeKey {
    NodeKey(format!("{ENTRY_PREFIX}{sequence}_{stage}"))
}

/// Parse an entry node key into its `(sequence, stage)` labels.
///
/// Returns `None` for keys that do not follow the entry convention.
pub fn parse_entry(key: &NodeKey) -> Option<(&str, &str)> {
    let rest = key.as_str().strip_prefix(ENTRY_PREFIX)?;
    let (sequence, stage) = rest.split_once('_')?;
    if sequence.is_empty() || stage.is_empty() {
        return None;
    }
    Some((sequence, stage))
}

/// One end of an edge: a parameter on a specific node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub node: NodeKey,
    pub param: ParamName,
}

impl Handle {
    pub fn new(node: impl Into<NodeKey>, param: impl Into<ParamName>) -> Self {
        Self {
            node: node.into(),
            param: param.into(),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.param)
    }
}

/// How a change on the source output propagates to the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Propagates on every change of the source output, regardless of value.
    #[default]
    Continuous,
    /// Propagates once per firing scope, and only when the source output is
    /// truthy.
    OneShot,
}

/// A directed link between two node parameters.
///
/// One-shot firing memory is keyed by the edge itself, so the same edge can
/// track firing state independently in different stage activations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: Handle,
    pub target: Handle,
    #[serde(default)]
    pub kind: EdgeKind,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=>{}", self.source, self.target)
    }
}

/// Topologically ordered layers of node keys for one execution scope.
///
/// Nodes within a stratum have no dependency on each other during one pass.
/// Stratum 0 executes unconditionally on every pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Strata(pub Vec<Vec<NodeKey>>);

impl Strata {
    pub fn iter(&self) -> impl Iterator<Item = &Vec<NodeKey>> {
        self.0.iter()
    }

    /// All node keys across all strata, in execution order.
    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.0.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A configuration value attached to a node declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::F64(v) => Some(*v),
            ParamValue::I64(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// A node declaration: key, declared type, and static configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: NodeKey,
    /// Declared node type, e.g. `"interval"`; dispatched to a factory once
    /// at construction.
    pub kind: String,
    #[serde(default)]
    pub config: IndexMap<ParamName, ParamValue>,
}

impl Node {
    pub fn new(key: impl Into<NodeKey>, kind: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            config: IndexMap::new(),
        }
    }

    pub fn with_config(mut self, name: impl Into<ParamName>, value: ParamValue) -> Self {
        self.config.insert(name.into(), value);
        self
    }
}

/// One state of a sequence, with its own execution strata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub key: StageKey,
    pub strata: Strata,
}

/// An ordered state machine of stages; at most one is active at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub key: SequenceKey,
    pub stages: Vec<Stage>,
}

/// A complete compiled program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Strata for nodes outside any stage.
    #[serde(default)]
    pub strata: Strata,
    #[serde(default)]
    pub sequences: Vec<Sequence>,
}

impl Program {
    /// All edges whose source is `key`.
    pub fn outgoing_of<'a>(&'a self, key: &'a NodeKey) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.source.node == *key)
    }
}
