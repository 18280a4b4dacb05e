use std::fmt::Display;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::ArcStr;

/// Phase boundaries of a single target.
///
/// Phases are ordered: a target moves from `Immediate` through
/// `BeginCompiling` and `ModulesReady` to `End`, never backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatePhase {
    /// Work with no compilation dependency, like creating directories.
    Immediate,
    /// The target's own prerequisite synthesis has completed.
    BeginCompiling,
    /// Interfaces needed by dependents (headers, module files) are available.
    ModulesReady,
    /// Every task of the target has completed.
    End,
}

impl GatePhase {
    pub const ALL: [GatePhase; 4] = [
        GatePhase::Immediate,
        GatePhase::BeginCompiling,
        GatePhase::ModulesReady,
        GatePhase::End,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            GatePhase::Immediate => "immediate",
            GatePhase::BeginCompiling => "begin-compiling",
            GatePhase::ModulesReady => "modules-ready",
            GatePhase::End => "end",
        }
    }
}

/// Opaque identifier of a node within one plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A file on disk, identified by its normalized path.
    File(Utf8PathBuf),
    /// A synchronization point with no file behind it.
    Virtual(ArcStr),
    /// The completion of one phase of one target.
    Gate(ArcStr, GatePhase),
}

/// A thing that tasks consume and produce.
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        match &self.kind {
            NodeKind::File(path) => Some(path),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        self.kind.to_string()
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::File(path) => f.write_str(path.as_str()),
            NodeKind::Virtual(name) => f.write_str(name),
            NodeKind::Gate(target, phase) => write!(f, "{target}-{}", phase.suffix()),
        }
    }
}
