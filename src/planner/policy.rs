//! Eager compilation policy.
//!
//! Decides, per target and per dependency edge, whether a dependent may start
//! compiling once its upstream interfaces are ready or must wait for the
//! upstream target to finish entirely.

use camino::Utf8PathBuf;

use crate::core::{ArcStr, normalize_path};
use crate::diagnostics::Diagnostics;
use crate::graph::{GatePhase, TaskKind};
use crate::planner::request::{BuildRequest, TargetKind, TargetSpec};

/// Where a script sits relative to the target's sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScriptPosition {
    BeforeSources,
    AfterSources,
}

/// Resolved scheduling policy of one target.
#[derive(Clone, Debug)]
pub(crate) struct TargetPolicy {
    /// Immediate work waits for upstream targets to end.
    pub serialize_immediate: bool,
    /// Dependents must wait for this target to end.
    pub blocks_dependents: bool,
    /// This target waits for upstream targets to end before compiling.
    pub waits_for_upstream: bool,
    /// Indices of scripts that can mutate anything in the build area.
    pub delaying_scripts: Vec<usize>,
}

impl TargetPolicy {
    pub fn is_delaying(&self, index: usize) -> bool {
        self.delaying_scripts.contains(&index)
    }
}

/// Index of the first compile task, scripts before it run before sources.
pub(crate) fn first_compile(target: &TargetSpec) -> Option<usize> {
    target
        .tasks
        .iter()
        .position(|task| task.kind == TaskKind::Compile)
}

pub(crate) fn script_position(target: &TargetSpec, index: usize) -> ScriptPosition {
    match first_compile(target) {
        Some(first) if index > first => ScriptPosition::AfterSources,
        _ => ScriptPosition::BeforeSources,
    }
}

/// Evaluates the policy of every target, reporting conflicts.
pub(crate) fn evaluate(request: &BuildRequest, diagnostics: &mut Diagnostics) -> Vec<TargetPolicy> {
    request
        .targets
        .iter()
        .map(|target| evaluate_target(request, target, diagnostics))
        .collect()
}

fn evaluate_target(
    request: &BuildRequest,
    target: &TargetSpec,
    diagnostics: &mut Diagnostics,
) -> TargetPolicy {
    let name: ArcStr = target.name.as_str().into();
    let settings = &target.settings;

    if settings.eager_require && settings.eager_disable {
        diagnostics.warning(
            Some(&name),
            format!(
                "target '{}' has both required and disabled eager compilation",
                target.name
            ),
        );
    }

    if settings.eager_require && !request.parallel_targets {
        diagnostics.warning(
            Some(&name),
            format!(
                "target '{}' requires eager compilation, but parallel target builds are disabled, which prevent eager compilation",
                target.name
            ),
        );
    }

    let delaying_scripts: Vec<usize> = if settings.script_sandboxing || settings.eager_allow_scripts {
        Vec::new()
    } else {
        target
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.kind == TaskKind::Script)
            .map(|(index, _)| index)
            .collect()
    };

    if settings.eager_require && !settings.eager_disable {
        for &index in &delaying_scripts {
            diagnostics.warning(
                Some(&name),
                format!(
                    "target '{}' requires eager compilation, but build phase '{}' is delaying eager compilation",
                    target.name,
                    target.tasks[index].label()
                ),
            );
        }
    }

    let delaying_prerequisite = delaying_scripts
        .iter()
        .any(|&index| script_position(target, index) == ScriptPosition::BeforeSources);

    let disabled = settings.eager_disable;
    let serial = !request.parallel_targets;

    if disabled || serial || delaying_prerequisite {
        tracing::debug!(
            name = %target.name,
            disabled,
            serial,
            delaying_prerequisite,
            "eager compilation off"
        );
    }

    TargetPolicy {
        serialize_immediate: serial || disabled,
        blocks_dependents: disabled,
        waits_for_upstream: serial
            || disabled
            || delaying_prerequisite
            || target.kind == TargetKind::Aggregate,
        delaying_scripts,
    }
}

fn build_directory(target: &TargetSpec) -> Option<Utf8PathBuf> {
    if !target.settings.deployment_location {
        return None;
    }

    let install = target.settings.install_path.as_ref()?;
    let product = target
        .settings
        .product_name
        .as_deref()
        .unwrap_or(&target.name);

    Some(normalize_path(&install.join(product)))
}

/// Whether `upstream`'s deployed product directory encloses the one of
/// `dependent`, in which case `dependent` may not build inside it early.
pub(crate) fn deployment_nested(upstream: &TargetSpec, dependent: &TargetSpec) -> bool {
    match (build_directory(upstream), build_directory(dependent)) {
        (Some(outer), Some(inner)) => inner != outer && inner.starts_with(&outer),
        _ => false,
    }
}

/// The gate of `upstream` that compilation of `dependent` waits for.
pub(crate) fn upstream_phase(
    dependent: (&TargetSpec, &TargetPolicy),
    upstream: (&TargetSpec, &TargetPolicy),
    diagnostics: &mut Diagnostics,
) -> GatePhase {
    let (target, policy) = dependent;
    let (dep, dep_policy) = upstream;

    if policy.waits_for_upstream || dep_policy.blocks_dependents {
        return GatePhase::End;
    }

    if deployment_nested(dep, target) {
        if target.settings.eager_require {
            let name: ArcStr = target.name.as_str().into();
            diagnostics.warning(
                Some(&name),
                format!(
                    "target '{}' requires eager compilation, but deployment location is set and the build directory of '{}' encloses the build directory of '{}'",
                    target.name, dep.name, target.name
                ),
            );
        } else {
            tracing::debug!(
                "'{}' builds inside the deployed product of '{}', waiting for it to end",
                target.name,
                dep.name
            );
        }
        return GatePhase::End;
    }

    GatePhase::ModulesReady
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::request::{TargetSettings, TaskSpec};

    fn deployed(name: &str, install: &str, product: &str) -> TargetSpec {
        TargetSpec::new(name).settings(TargetSettings {
            deployment_location: true,
            install_path: Some(install.into()),
            product_name: Some(product.into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_deployment_nesting() {
        let a = deployed("A", "/Library/Frameworks", "A.framework");
        let b = deployed(
            "B",
            "/Library/Frameworks/A.framework/Versions/A/Frameworks",
            "B.framework",
        );
        let c = deployed("C", "/Library/Frameworks", "C.framework");

        assert!(deployment_nested(&a, &b));
        assert!(!deployment_nested(&b, &a));
        assert!(!deployment_nested(&a, &c));
    }

    #[test]
    fn test_sandboxed_scripts_do_not_delay() {
        let target = TargetSpec::new("A")
            .settings(TargetSettings {
                script_sandboxing: true,
                ..Default::default()
            })
            .task(TaskSpec::new(TaskKind::Script).describe("Run Script"));
        let request = BuildRequest::new().target(target);

        let mut diagnostics = Diagnostics::new();
        let policies = evaluate(&request, &mut diagnostics);

        assert!(policies[0].delaying_scripts.is_empty());
        assert!(!policies[0].waits_for_upstream);
    }

    #[test]
    fn test_script_position() {
        let target = TargetSpec::new("A")
            .task(TaskSpec::new(TaskKind::Script))
            .task(TaskSpec::new(TaskKind::Compile))
            .task(TaskSpec::new(TaskKind::Script));

        assert_eq!(script_position(&target, 0), ScriptPosition::BeforeSources);
        assert_eq!(script_position(&target, 2), ScriptPosition::AfterSources);
    }
}
