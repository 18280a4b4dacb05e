use std::collections::BTreeMap;
use std::fmt::Display;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, normalize_path};
use crate::fingerprint::Fingerprint;
use crate::graph::node::NodeId;

/// Identifier of a task, stable for the lifetime of one plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) NodeIndex);

impl TaskId {
    pub fn index(self) -> usize {
        self.0.index()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    MkDir,
    CustomTask,
    Script,
    CopyHeader,
    EmitModule,
    WriteAuxiliaryFile,
    Compile,
    Link,
    Sign,
    Copy,
    Synthetic,
    Gate,
}

impl TaskKind {
    /// The rule type, the first element of a task's [`RuleInfo`].
    pub fn rule_type(self) -> &'static str {
        match self {
            TaskKind::MkDir => "MkDir",
            TaskKind::CustomTask => "CustomTask",
            TaskKind::Script => "PhaseScriptExecution",
            TaskKind::CopyHeader => "CpHeader",
            TaskKind::EmitModule => "EmitModule",
            TaskKind::WriteAuxiliaryFile => "WriteAuxiliaryFile",
            TaskKind::Compile => "Compile",
            TaskKind::Link => "Ld",
            TaskKind::Sign => "CodeSign",
            TaskKind::Copy => "Copy",
            TaskKind::Synthetic => "Synthetic",
            TaskKind::Gate => "Gate",
        }
    }
}

/// One command-line token.
///
/// Paths are kept apart from literals so they can be resolved against the
/// working directory only when the task runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandArg {
    Literal(String),
    Path { path: Utf8PathBuf },
}

impl CommandArg {
    pub fn path(path: impl Into<Utf8PathBuf>) -> Self {
        CommandArg::Path { path: path.into() }
    }

    /// The token as declared.
    pub fn as_str(&self) -> &str {
        match self {
            CommandArg::Literal(text) => text,
            CommandArg::Path { path } => path.as_str(),
        }
    }

    /// The token as passed to the action, with relative paths anchored at
    /// `working_directory`.
    pub fn evaluate(&self, working_directory: &Utf8Path) -> String {
        match self {
            CommandArg::Literal(text) => text.clone(),
            CommandArg::Path { path } if path.is_absolute() => normalize_path(path).into_string(),
            CommandArg::Path { path } => normalize_path(&working_directory.join(path)).into_string(),
        }
    }
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        CommandArg::Literal(value.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        CommandArg::Literal(value)
    }
}

/// Human-readable rule descriptor; the first element is the rule type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct RuleInfo(pub(crate) Vec<String>);

impl RuleInfo {
    pub fn rule_type(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl Display for RuleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// An atomic unit of scheduled work.
///
/// Tasks are created once by the plan builder and never change afterwards.
#[derive(Clone, Debug)]
pub struct PlannedTask {
    pub(crate) kind: TaskKind,
    pub(crate) rule: RuleInfo,
    pub(crate) target: Option<ArcStr>,
    pub(crate) command_line: Vec<CommandArg>,
    pub(crate) environment: BTreeMap<String, String>,
    pub(crate) working_directory: Utf8PathBuf,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) outputs: Vec<NodeId>,
    pub(crate) always_runs: bool,
    pub(crate) cacheable: bool,
    pub(crate) signature: Fingerprint,
}

impl PlannedTask {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn rule(&self) -> &RuleInfo {
        &self.rule
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn command_line(&self) -> &[CommandArg] {
        &self.command_line
    }

    /// Command line with paths resolved against the working directory.
    pub fn evaluated_command_line(&self) -> Vec<String> {
        self.command_line
            .iter()
            .map(|arg| arg.evaluate(&self.working_directory))
            .collect()
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn working_directory(&self) -> &Utf8Path {
        &self.working_directory
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn always_runs(&self) -> bool {
        self.always_runs
    }

    /// Whether results may be taken from and put into the compilation cache.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable && !self.always_runs && self.kind != TaskKind::Gate
    }

    pub fn is_gate(&self) -> bool {
        self.kind == TaskKind::Gate
    }

    pub fn signature(&self) -> Fingerprint {
        self.signature
    }

    /// Label used in progress output and failure messages.
    pub fn label(&self) -> String {
        self.rule.to_string()
    }
}

/// Description of a task before it is added to a plan.
///
/// Declared inputs and outputs take part in the fingerprint. Ordering inputs
/// added with [`TaskBuilder::after`] do not: they only constrain scheduling.
#[derive(Clone, Debug)]
pub struct TaskBuilder {
    pub(crate) kind: TaskKind,
    pub(crate) rule: Vec<String>,
    pub(crate) target: Option<ArcStr>,
    pub(crate) command_line: Vec<CommandArg>,
    pub(crate) environment: BTreeMap<String, String>,
    pub(crate) working_directory: Utf8PathBuf,
    pub(crate) inputs: Vec<Utf8PathBuf>,
    pub(crate) outputs: Vec<Utf8PathBuf>,
    pub(crate) after: Vec<NodeId>,
    pub(crate) always_runs: bool,
    pub(crate) cacheable: bool,
}

impl TaskBuilder {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            rule: Vec::new(),
            target: None,
            command_line: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: Utf8PathBuf::from("/"),
            inputs: Vec::new(),
            outputs: Vec::new(),
            after: Vec::new(),
            always_runs: false,
            cacheable: false,
        }
    }

    /// Extra rule descriptor parts following the rule type.
    pub fn rule<S: Into<String>>(mut self, parts: impl IntoIterator<Item = S>) -> Self {
        self.rule = parts.into_iter().map(Into::into).collect();
        self
    }

    pub fn target(mut self, target: ArcStr) -> Self {
        self.target = Some(target);
        self
    }

    pub fn command_line(mut self, args: impl IntoIterator<Item = CommandArg>) -> Self {
        self.command_line = args.into_iter().collect();
        self
    }

    pub fn environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn working_directory(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.working_directory = path.into();
        self
    }

    pub fn inputs(mut self, paths: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        self.inputs.extend(paths);
        self
    }

    pub fn outputs(mut self, paths: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        self.outputs.extend(paths);
        self
    }

    pub fn after(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.after.extend(nodes);
        self
    }

    pub fn always_runs(mut self, value: bool) -> Self {
        self.always_runs = value;
        self
    }

    pub fn cacheable(mut self, value: bool) -> Self {
        self.cacheable = value;
        self
    }
}
