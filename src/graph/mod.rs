//! The task graph model.
//!
//! A [`BuildPlan`] is a directed acyclic graph of [`PlannedTask`]s. Tasks do
//! not point at each other directly: each one lists the [`Node`]s it consumes
//! and produces, and an edge `a -> b` exists whenever `b` consumes a node that
//! `a` produces. Nodes are files, virtual synchronization points, or the phase
//! gates of a target.
//!
//! Plans are assembled through a [`PlanBuilder`], which interns nodes,
//! fingerprints and deduplicates tasks, and collects the predecessors of gate
//! tasks until [`PlanBuilder::finish`] materializes them.

mod node;
mod task;

use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::graph::DiGraph;

pub use self::node::{GatePhase, Node, NodeId, NodeKind};
pub use self::task::{CommandArg, PlannedTask, RuleInfo, TaskBuilder, TaskId, TaskKind};
use crate::core::{ArcStr, normalize_path};
use crate::diagnostics::Diagnostics;
use crate::error::PlanError;
use crate::fingerprint::{Fingerprint, fingerprint};

type GateKey = (ArcStr, GatePhase);
type SignatureKey = (Fingerprint, TaskKind, Option<ArcStr>);

/// Incrementally assembles a [`BuildPlan`].
#[derive(Default)]
pub struct PlanBuilder {
    graph: DiGraph<PlannedTask, ()>,
    nodes: Vec<Node>,
    interned: HashMap<NodeKind, NodeId>,
    producers: HashMap<NodeId, TaskId>,
    signatures: HashMap<SignatureKey, TaskId>,
    /// Gates in the order they were first referenced.
    gates: Vec<GateKey>,
    gate_inputs: HashMap<GateKey, Vec<NodeId>>,
    diagnostics: Diagnostics,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, kind: NodeKind) -> NodeId {
        if let Some(&id) = self.interned.get(&kind) {
            return id;
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            kind: kind.clone(),
        });
        self.interned.insert(kind, id);
        id
    }

    pub fn file(&mut self, path: impl Into<Utf8PathBuf>) -> NodeId {
        let path = path.into();
        self.intern(NodeKind::File(normalize_path(&path)))
    }

    pub fn virtual_node(&mut self, name: impl Into<ArcStr>) -> NodeId {
        self.intern(NodeKind::Virtual(name.into()))
    }

    /// Returns the output node of the gate for `(target, phase)`, creating
    /// the gate on first reference.
    pub fn gate(&mut self, target: &ArcStr, phase: GatePhase) -> NodeId {
        let key = (target.clone(), phase);
        if !self.gate_inputs.contains_key(&key) {
            self.gates.push(key.clone());
            self.gate_inputs.insert(key, Vec::new());
        }
        self.intern(NodeKind::Gate(target.clone(), phase))
    }

    /// Makes the gate for `(target, phase)` wait for `nodes`.
    pub fn gate_after(
        &mut self,
        target: &ArcStr,
        phase: GatePhase,
        nodes: impl IntoIterator<Item = NodeId>,
    ) {
        self.gate(target, phase);
        let inputs = self
            .gate_inputs
            .entry((target.clone(), phase))
            .or_default();

        for node in nodes {
            if !inputs.contains(&node) {
                inputs.push(node);
            }
        }
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Adds a task to the plan.
    ///
    /// A task whose fingerprint, kind and owning target match an already
    /// added task is not added again; the existing task is returned instead,
    /// with the new `after` nodes merged into its inputs. Identical work in
    /// two targets stays two tasks, each ordered within its own target.
    pub fn add_task(&mut self, builder: TaskBuilder) -> Result<TaskId, PlanError> {
        let TaskBuilder {
            kind,
            rule,
            target,
            command_line,
            environment,
            working_directory,
            inputs,
            outputs,
            after,
            always_runs,
            cacheable,
        } = builder;

        let working_directory = normalize_path(&working_directory);
        let anchor = |path: Utf8PathBuf| {
            if path.is_absolute() {
                normalize_path(&path)
            } else {
                normalize_path(&working_directory.join(path))
            }
        };
        let inputs: Vec<_> = inputs.into_iter().map(anchor).collect();
        let outputs: Vec<_> = outputs.into_iter().map(anchor).collect();

        let signature = fingerprint(
            &command_line
                .iter()
                .map(CommandArg::as_str)
                .collect::<Vec<_>>(),
            &environment,
            &working_directory,
            inputs.iter().map(|p| p.as_str()),
            outputs.iter().map(|p| p.as_str()),
        );

        let key = (signature, kind, target.clone());
        if let Some(&existing) = self.signatures.get(&key) {
            tracing::debug!(
                "reusing task {} for identical {}",
                self.graph[existing.0].label(),
                kind.rule_type()
            );
            let task = &mut self.graph[existing.0];
            for node in after {
                if !task.inputs.contains(&node) && !task.outputs.contains(&node) {
                    task.inputs.push(node);
                }
            }
            return Ok(existing);
        }

        let mut parts = Vec::with_capacity(rule.len() + 2);
        parts.push(kind.rule_type().to_string());
        parts.extend(rule);
        if kind == TaskKind::CustomTask {
            parts.push(signature.to_hex());
        }
        let rule = RuleInfo(parts);

        let mut input_nodes = Vec::with_capacity(inputs.len() + after.len());
        for path in inputs {
            let node = self.intern(NodeKind::File(path));
            if !input_nodes.contains(&node) {
                input_nodes.push(node);
            }
        }
        for node in after {
            if !input_nodes.contains(&node) {
                input_nodes.push(node);
            }
        }

        let mut output_nodes: Vec<_> = outputs
            .into_iter()
            .map(|path| self.intern(NodeKind::File(path)))
            .collect();
        if output_nodes.is_empty() {
            let name = match &target {
                Some(target) => format!("{target}/{}-{}", kind.rule_type(), signature.to_hex()),
                None => format!("{}-{}", kind.rule_type(), signature.to_hex()),
            };
            output_nodes.push(self.virtual_node(name));
        }

        for output in &output_nodes {
            if let Some(&first) = self.producers.get(output) {
                return Err(PlanError::DuplicateProducer {
                    node: self.nodes[output.index()].name(),
                    first: self.graph[first.0].label(),
                    second: rule.to_string(),
                });
            }
        }

        let id = TaskId(self.graph.add_node(PlannedTask {
            kind,
            rule,
            target,
            command_line,
            environment,
            working_directory,
            inputs: input_nodes,
            outputs: output_nodes.clone(),
            always_runs,
            cacheable,
            signature,
        }));

        for output in output_nodes {
            self.producers.insert(output, id);
        }
        self.signatures.insert(key, id);

        Ok(id)
    }

    pub fn task(&self, id: TaskId) -> &PlannedTask {
        &self.graph[id.0]
    }

    /// Materializes gates, derives edges from producers and rejects cycles.
    pub fn finish(mut self) -> Result<BuildPlan, PlanError> {
        let mut gates = HashMap::with_capacity(self.gates.len());

        for key in std::mem::take(&mut self.gates) {
            let inputs = self.gate_inputs.remove(&key).unwrap_or_default();
            let output = self.intern(NodeKind::Gate(key.0.clone(), key.1));
            let name = self.nodes[output.index()].name();
            let signature = fingerprint(
                &["Gate"],
                &Default::default(),
                Utf8Path::new("/"),
                [] as [&str; 0],
                [name.as_str()],
            );

            let id = TaskId(self.graph.add_node(PlannedTask {
                kind: TaskKind::Gate,
                rule: RuleInfo(vec!["Gate".into(), name]),
                target: Some(key.0.clone()),
                command_line: Vec::new(),
                environment: Default::default(),
                working_directory: "/".into(),
                inputs,
                outputs: vec![output],
                always_runs: false,
                cacheable: false,
                signature,
            }));

            self.producers.insert(output, id);
            gates.insert(key, id);
        }

        let mut seen = HashSet::new();
        let mut edges = Vec::new();
        for index in self.graph.node_indices() {
            for input in &self.graph[index].inputs {
                if let Some(&producer) = self.producers.get(input)
                    && producer.0 != index
                    && seen.insert((producer.0, index))
                {
                    edges.push((producer.0, index));
                }
            }
        }
        for (source, target) in edges {
            self.graph.add_edge(source, target, ());
        }

        if let Err(cycle) = petgraph::algo::toposort(&self.graph, None) {
            return Err(PlanError::Cycle(self.graph[cycle.node_id()].label()));
        }

        Ok(BuildPlan {
            graph: self.graph,
            nodes: self.nodes,
            producers: self.producers,
            gates,
            diagnostics: self.diagnostics,
        })
    }
}

/// A complete, acyclic task graph for one build.
#[derive(Debug)]
pub struct BuildPlan {
    pub(crate) graph: DiGraph<PlannedTask, ()>,
    nodes: Vec<Node>,
    producers: HashMap<NodeId, TaskId>,
    gates: HashMap<GateKey, TaskId>,
    diagnostics: Diagnostics,
}

impl BuildPlan {
    pub fn task(&self, id: TaskId) -> &PlannedTask {
        &self.graph[id.0]
    }

    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &PlannedTask)> {
        self.graph
            .node_indices()
            .map(|index| (TaskId(index), &self.graph[index]))
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn producer(&self, node: NodeId) -> Option<TaskId> {
        self.producers.get(&node).copied()
    }

    pub fn gate(&self, target: &str, phase: GatePhase) -> Option<TaskId> {
        self.gates.get(&(ArcStr::from(target), phase)).copied()
    }

    /// First task of `kind` in `target`, in creation order.
    pub fn find(&self, target: &str, kind: TaskKind) -> Option<TaskId> {
        self.tasks()
            .find(|(_, task)| task.kind == kind && task.target() == Some(target))
            .map(|(id, _)| id)
    }

    pub fn find_all(&self, target: &str, kind: TaskKind) -> Vec<TaskId> {
        self.tasks()
            .filter(|(_, task)| task.kind == kind && task.target() == Some(target))
            .map(|(id, _)| id)
            .collect()
    }

    /// First task in `target` whose rule descriptor contains `part`.
    pub fn find_by_rule(&self, target: &str, part: &str) -> Option<TaskId> {
        self.tasks()
            .find(|(_, task)| {
                task.target() == Some(target) && task.rule.parts().iter().any(|p| p == part)
            })
            .map(|(id, _)| id)
    }

    /// Whether `task` transitively waits for `antecedent`.
    pub fn follows(&self, task: TaskId, antecedent: TaskId) -> bool {
        task != antecedent
            && petgraph::algo::has_path_connecting(&self.graph, antecedent.0, task.0, None)
    }

    /// Direct predecessors of a task.
    pub fn dependencies(&self, task: TaskId) -> Vec<TaskId> {
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(task.0, Direction::Incoming)
            .map(TaskId)
            .collect();
        deps.sort();
        deps
    }

    /// Direct successors of a task.
    pub fn dependents(&self, task: TaskId) -> Vec<TaskId> {
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(task.0, Direction::Outgoing)
            .map(TaskId)
            .collect();
        deps.sort();
        deps
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Edges as pairs of rule labels, sorted. Equal for isomorphic plans.
    pub fn edge_labels(&self) -> Vec<(String, String)> {
        let mut labels: Vec<_> = self
            .graph
            .raw_edges()
            .iter()
            .map(|edge| {
                (
                    self.graph[edge.source()].label(),
                    self.graph[edge.target()].label(),
                )
            })
            .collect();
        labels.sort();
        labels
    }
}

impl Display for BuildPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.label().replace('"', "\\\"");
            if task.is_gate() {
                writeln!(f, "    {:?}{{{{\"{}\"}}}}", index.index(), name)?;
            } else {
                writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
            }
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str, obj: &str) -> TaskBuilder {
        TaskBuilder::new(TaskKind::Compile)
            .rule([src])
            .command_line(["cc".into(), "-c".into(), CommandArg::path(src)])
            .working_directory("/work")
            .inputs([Utf8PathBuf::from(src)])
            .outputs([Utf8PathBuf::from(obj)])
    }

    #[test]
    fn test_edges_follow_producers() {
        let mut builder = PlanBuilder::new();
        let a = builder.add_task(compile("a.c", "a.o")).unwrap();
        let link = builder
            .add_task(
                TaskBuilder::new(TaskKind::Link)
                    .working_directory("/work")
                    .inputs(["a.o".into()])
                    .outputs(["app".into()]),
            )
            .unwrap();

        let plan = builder.finish().unwrap();
        assert!(plan.follows(link, a));
        assert!(!plan.follows(a, link));
        assert_eq!(plan.dependencies(link), [a]);
        assert_eq!(plan.edge_count(), 1);
    }

    #[test]
    fn test_identical_tasks_are_deduplicated() {
        let mut builder = PlanBuilder::new();
        let first = builder.add_task(compile("a.c", "a.o")).unwrap();
        let second = builder.add_task(compile("a.c", "a.o")).unwrap();

        assert_eq!(first, second);
        assert_eq!(builder.finish().unwrap().len(), 1);
    }

    #[test]
    fn test_identical_tasks_in_different_targets_stay_apart() {
        let lint = |target: &str| {
            TaskBuilder::new(TaskKind::Script)
                .target(target.into())
                .command_line(["./lint.sh".into()])
                .working_directory("/src")
        };
        let mut builder = PlanBuilder::new();
        let a = builder.add_task(lint("A")).unwrap();
        let b = builder.add_task(lint("B")).unwrap();

        assert_ne!(a, b);
        assert_ne!(builder.task(a).outputs(), builder.task(b).outputs());
    }

    #[test]
    fn test_reused_task_merges_ordering() {
        let target: ArcStr = "A".into();
        let mut builder = PlanBuilder::new();
        let first = builder.gate(&target, GatePhase::Immediate);
        let second = builder.gate(&target, GatePhase::BeginCompiling);

        let a = builder
            .add_task(compile("a.c", "a.o").target(target.clone()).after([first]))
            .unwrap();
        let again = builder
            .add_task(compile("a.c", "a.o").target(target.clone()).after([second]))
            .unwrap();

        assert_eq!(a, again);
        assert!(builder.task(a).inputs().contains(&first));
        assert!(builder.task(a).inputs().contains(&second));
    }

    #[test]
    fn test_distinct_tasks_producing_same_file_are_rejected() {
        let mut builder = PlanBuilder::new();
        builder.add_task(compile("a.c", "out.o")).unwrap();
        let err = builder.add_task(compile("b.c", "out.o")).unwrap_err();

        assert!(matches!(err, PlanError::DuplicateProducer { .. }));
    }

    #[test]
    fn test_outputless_tasks_get_virtual_node() {
        let mut builder = PlanBuilder::new();
        let id = builder
            .add_task(
                TaskBuilder::new(TaskKind::CustomTask)
                    .rule(["Generate"])
                    .command_line(["gen".into()]),
            )
            .unwrap();

        let task = builder.task(id).clone();
        let plan = builder.finish().unwrap();
        let output = plan.node(task.outputs()[0]);

        assert_eq!(
            output.kind(),
            &NodeKind::Virtual(format!("CustomTask-{}", task.signature().to_hex()).into())
        );
        assert_eq!(task.rule().parts()[0], "CustomTask");
        assert_eq!(task.rule().parts()[1], "Generate");
        assert_eq!(task.rule().parts()[2], task.signature().to_hex());
    }

    #[test]
    fn test_gates_collect_predecessors() {
        let target: ArcStr = "Core".into();
        let mut builder = PlanBuilder::new();

        let a = builder.add_task(compile("a.c", "a.o")).unwrap();
        let a_out = builder.task(a).outputs()[0];
        builder.gate_after(&target, GatePhase::End, [a_out]);

        let end = builder.gate(&target, GatePhase::End);
        let consumer = builder
            .add_task(TaskBuilder::new(TaskKind::Copy).rule(["after-end"]).after([end]))
            .unwrap();

        let plan = builder.finish().unwrap();
        let gate = plan.gate("Core", GatePhase::End).unwrap();

        assert!(plan.task(gate).is_gate());
        assert_eq!(plan.task(gate).label(), "Gate Core-end");
        assert!(plan.follows(consumer, a));
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut builder = PlanBuilder::new();
        builder
            .add_task(
                TaskBuilder::new(TaskKind::Copy)
                    .inputs(["/b".into()])
                    .outputs(["/a".into()]),
            )
            .unwrap();
        builder
            .add_task(
                TaskBuilder::new(TaskKind::Copy)
                    .inputs(["/a".into()])
                    .outputs(["/b".into()]),
            )
            .unwrap();

        assert!(matches!(builder.finish(), Err(PlanError::Cycle(_))));
    }

    #[test]
    fn test_mermaid_rendering() {
        let mut builder = PlanBuilder::new();
        builder.add_task(compile("a.c", "a.o")).unwrap();
        let rendered = builder.finish().unwrap().to_string();

        assert!(rendered.starts_with("graph LR\n"));
        assert!(rendered.contains("[\"Compile a.c\"]"));
    }
}
