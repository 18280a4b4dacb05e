//! The gate scheduler.
//!
//! Every target gets four gate tasks, one per [`GatePhase`], and each of its
//! tasks is wired between them according to its role:
//!
//! * immediate work (directory creation) feeds `Immediate`,
//! * prerequisites (custom tasks, scripts before sources) run after
//!   `Immediate` and feed `BeginCompiling`,
//! * interface producers (headers, module files) feed `ModulesReady`,
//! * compilation, linking and everything else feed `End`.
//!
//! Dependents compile after the upstream `ModulesReady` gate when eager
//! compilation is possible, and after the upstream `End` gate otherwise. See
//! the `policy` module for when that is.

mod policy;
mod request;

use std::collections::{BTreeMap, HashMap};

use tracing::Level;

pub use self::request::{BuildRequest, TargetKind, TargetSettings, TargetSpec, TaskSpec};
use self::policy::{ScriptPosition, TargetPolicy};
use crate::core::ArcStr;
use crate::error::PlanError;
use crate::graph::{BuildPlan, GatePhase, NodeId, PlanBuilder, TaskBuilder, TaskId, TaskKind};

pub(crate) use self::request::is_truthy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Immediate,
    Prerequisite,
    Interface,
    Compile,
    Link,
    PostLink,
    PostSources,
    General,
}

fn role(target: &TargetSpec, index: usize) -> Role {
    let spec = &target.tasks[index];
    match spec.kind {
        TaskKind::MkDir => Role::Immediate,
        TaskKind::CustomTask => Role::Prerequisite,
        TaskKind::Script => match policy::script_position(target, index) {
            ScriptPosition::BeforeSources => Role::Prerequisite,
            ScriptPosition::AfterSources => Role::PostSources,
        },
        TaskKind::CopyHeader | TaskKind::EmitModule | TaskKind::WriteAuxiliaryFile => {
            Role::Interface
        }
        TaskKind::Compile => Role::Compile,
        TaskKind::Link => Role::Link,
        TaskKind::Sign => Role::PostLink,
        TaskKind::Copy | TaskKind::Synthetic | TaskKind::Gate => {
            if spec.produces_interface() {
                Role::Interface
            } else {
                Role::General
            }
        }
    }
}

/// Plans a build request into a task graph.
pub fn plan(request: &BuildRequest) -> Result<BuildPlan, PlanError> {
    let span = tracing::span!(Level::INFO, "plan", targets = request.targets.len());
    let _enter = span.enter();

    let mut index = HashMap::with_capacity(request.targets.len());
    for (i, target) in request.targets.iter().enumerate() {
        if index.insert(target.name.as_str(), i).is_some() {
            return Err(PlanError::DuplicateTarget(target.name.clone()));
        }
    }

    for target in &request.targets {
        for dependency in &target.dependencies {
            if !index.contains_key(dependency.as_str()) {
                return Err(PlanError::UnknownDependency {
                    target: target.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        if target.tasks.iter().any(|task| task.kind == TaskKind::Gate) {
            return Err(PlanError::ReservedKind(target.name.clone()));
        }
    }

    let mut builder = PlanBuilder::new();
    let policies = policy::evaluate(request, builder.diagnostics_mut());

    for (i, target) in request.targets.iter().enumerate() {
        let upstream: Vec<_> = target
            .dependencies
            .iter()
            .map(|name| {
                let j = index[name.as_str()];
                let phase = policy::upstream_phase(
                    (target, &policies[i]),
                    (&request.targets[j], &policies[j]),
                    builder.diagnostics_mut(),
                );
                (ArcStr::from(name.as_str()), phase)
            })
            .collect();

        TargetPlanner::new(&mut builder, target, &policies[i], &upstream).plan()?;
    }

    let plan = builder.finish()?;
    tracing::info!(
        "planned {} tasks with {} edges",
        plan.len(),
        plan.edge_count()
    );

    Ok(plan)
}

/// Wires the tasks of a single target.
struct TargetPlanner<'a> {
    builder: &'a mut PlanBuilder,
    target: &'a TargetSpec,
    policy: &'a TargetPolicy,
    name: ArcStr,
    /// Gates of upstream targets that compilation of this target waits for.
    upstream: Vec<NodeId>,
    /// `End` gates of all upstream targets.
    upstream_ends: Vec<NodeId>,
}

impl<'a> TargetPlanner<'a> {
    fn new(
        builder: &'a mut PlanBuilder,
        target: &'a TargetSpec,
        policy: &'a TargetPolicy,
        upstream: &[(ArcStr, GatePhase)],
    ) -> Self {
        let upstream_nodes = upstream
            .iter()
            .map(|(name, phase)| builder.gate(name, *phase))
            .collect();
        let upstream_ends = upstream
            .iter()
            .map(|(name, _)| builder.gate(name, GatePhase::End))
            .collect();

        Self {
            builder,
            target,
            policy,
            name: target.name.as_str().into(),
            upstream: upstream_nodes,
            upstream_ends,
        }
    }

    fn task_builder(&self, index: usize) -> TaskBuilder {
        let spec = &self.target.tasks[index];

        let mut environment: BTreeMap<String, String> = self.target.environment.clone();
        environment.extend(spec.environment.clone());

        let working_directory = spec
            .working_directory
            .clone()
            .unwrap_or_else(|| self.target.default_working_directory().to_owned());

        TaskBuilder::new(spec.kind)
            .rule([spec.label()])
            .target(self.name.clone())
            .command_line(spec.command_line.iter().cloned())
            .environment(environment)
            .working_directory(working_directory)
            .inputs(spec.inputs.iter().cloned())
            .outputs(spec.outputs.iter().cloned())
            .always_runs(spec.always_out_of_date)
            .cacheable(spec.cacheable)
    }

    fn add(&mut self, index: usize, after: Vec<NodeId>) -> Result<Vec<NodeId>, PlanError> {
        let builder = self.task_builder(index).after(after);
        let id: TaskId = self.builder.add_task(builder)?;
        Ok(self.builder.task(id).outputs().to_vec())
    }

    fn plan(mut self) -> Result<(), PlanError> {
        let name = self.name.clone();
        let roles: Vec<_> = (0..self.target.tasks.len())
            .map(|index| role(self.target, index))
            .collect();
        let of_role = |wanted: Role| {
            roles
                .iter()
                .enumerate()
                .filter(move |(_, role)| **role == wanted)
                .map(|(index, _)| index)
                .collect::<Vec<_>>()
        };

        let immediate = self.builder.gate(&name, GatePhase::Immediate);
        let begin = self.builder.gate(&name, GatePhase::BeginCompiling);
        let ready = self.builder.gate(&name, GatePhase::ModulesReady);
        self.builder.gate(&name, GatePhase::End);

        let mut all_outputs = Vec::new();

        // Immediate work only waits for upstream targets in serialized builds.
        let serial_after = if self.policy.serialize_immediate {
            self.upstream_ends.clone()
        } else {
            Vec::new()
        };
        self.builder
            .gate_after(&name, GatePhase::Immediate, serial_after.iter().copied());
        for index in of_role(Role::Immediate) {
            let outputs = self.add(index, serial_after.clone())?;
            self.builder
                .gate_after(&name, GatePhase::Immediate, outputs.iter().copied());
            all_outputs.extend(outputs);
        }

        // Prerequisites run in declaration order, each after the previous one.
        let mut prerequisites = Vec::new();
        for index in of_role(Role::Prerequisite) {
            let mut after = vec![immediate];
            after.extend(self.upstream.iter().copied());
            after.extend(prerequisites.iter().copied());
            let outputs = self.add(index, after)?;

            let spec = &self.target.tasks[index];
            if spec.produces_interface() || self.policy.is_delaying(index) {
                self.builder
                    .gate_after(&name, GatePhase::ModulesReady, outputs.iter().copied());
            }
            prerequisites.extend(outputs.iter().copied());
            all_outputs.extend(outputs);
        }

        self.builder.gate_after(
            &name,
            GatePhase::BeginCompiling,
            std::iter::once(immediate)
                .chain(self.upstream.iter().copied())
                .chain(prerequisites.iter().copied()),
        );

        for index in of_role(Role::Interface) {
            let outputs = self.add(index, vec![begin])?;
            self.builder
                .gate_after(&name, GatePhase::ModulesReady, outputs.iter().copied());
            all_outputs.extend(outputs);
        }

        let mut compiled = Vec::new();
        for index in of_role(Role::Compile) {
            let outputs = self.add(index, vec![begin])?;
            if self.target.settings.eager_parallel_compilation_disable {
                self.builder
                    .gate_after(&name, GatePhase::ModulesReady, outputs.iter().copied());
            }
            compiled.extend(outputs.iter().copied());
            all_outputs.extend(outputs);
        }

        for index in of_role(Role::General) {
            let outputs = self.add(index, vec![begin])?;
            all_outputs.extend(outputs);
        }

        // Linking needs upstream products to be complete.
        let mut linked = Vec::new();
        for index in of_role(Role::Link) {
            let mut after = vec![begin];
            after.extend(compiled.iter().copied());
            after.extend(self.upstream_ends.iter().copied());
            let outputs = self.add(index, after)?;
            linked.extend(outputs.iter().copied());
            all_outputs.extend(outputs);
        }

        for index in of_role(Role::PostLink) {
            let mut after = vec![begin];
            after.extend(linked.iter().copied());
            let outputs = self.add(index, after)?;
            all_outputs.extend(outputs);
        }

        // Scripts after sources see everything compiled and linked so far.
        let mut scripts = prerequisites;
        for index in of_role(Role::PostSources) {
            let mut after = vec![begin];
            after.extend(compiled.iter().copied());
            after.extend(linked.iter().copied());
            after.extend(scripts.iter().copied());
            let outputs = self.add(index, after)?;

            let spec = &self.target.tasks[index];
            if spec.produces_interface() || self.policy.is_delaying(index) {
                self.builder
                    .gate_after(&name, GatePhase::ModulesReady, outputs.iter().copied());
            }
            scripts.extend(outputs.iter().copied());
            all_outputs.extend(outputs);
        }

        self.builder
            .gate_after(&name, GatePhase::ModulesReady, [begin]);
        self.builder.gate_after(
            &name,
            GatePhase::End,
            std::iter::once(ready).chain(all_outputs),
        );

        tracing::debug!(
            "planned target '{}' with {} tasks",
            self.target.name,
            self.target.tasks.len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests;
