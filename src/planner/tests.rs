use super::*;
use crate::graph::CommandArg;

fn mkdir(target: &str) -> TaskSpec {
    TaskSpec::new(TaskKind::MkDir)
        .command(["builtin-mkdir"])
        .arg(CommandArg::path(format!("/build/{target}")))
        .output(format!("/build/{target}"))
}

fn header(target: &str) -> TaskSpec {
    TaskSpec::new(TaskKind::CopyHeader)
        .command(["builtin-copy"])
        .input(format!("/src/{target}/{target}.h"))
        .output(format!("/build/include/{target}.h"))
}

fn compile(target: &str, file: &str) -> TaskSpec {
    TaskSpec::new(TaskKind::Compile)
        .command(["cc", "-c"])
        .input(format!("/src/{target}/{file}.c"))
        .output(format!("/build/{target}/{file}.o"))
}

fn link(target: &str) -> TaskSpec {
    TaskSpec::new(TaskKind::Link)
        .command(["ld"])
        .input(format!("/build/{target}/main.o"))
        .output(format!("/build/{target}/lib{target}.dylib"))
}

fn script(name: &str) -> TaskSpec {
    TaskSpec::new(TaskKind::Script)
        .describe(name)
        .command(["/bin/sh", "-c", name])
        .always_out_of_date()
}

fn library(name: &str) -> TargetSpec {
    TargetSpec::new(name)
        .working_directory(format!("/src/{name}"))
        .task(mkdir(name))
        .task(header(name))
        .task(compile(name, "main"))
        .task(link(name))
}

fn settings(configure: impl FnOnce(&mut TargetSettings)) -> TargetSettings {
    let mut settings = TargetSettings::default();
    configure(&mut settings);
    settings
}

fn task(plan: &BuildPlan, target: &str, kind: TaskKind) -> TaskId {
    plan.find(target, kind)
        .unwrap_or_else(|| panic!("no {kind:?} task in '{target}'"))
}

fn scripted(plan: &BuildPlan, target: &str, name: &str) -> TaskId {
    plan.find_by_rule(target, name)
        .unwrap_or_else(|| panic!("no '{name}' task in '{target}'"))
}

#[test]
fn test_eager_compilation_follows_interfaces_only() {
    let request = BuildRequest::new()
        .target(library("A"))
        .target(library("B").depends_on("A"));
    let plan = plan(&request).unwrap();

    let b_compile = task(&plan, "B", TaskKind::Compile);
    let b_mkdir = task(&plan, "B", TaskKind::MkDir);

    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::CopyHeader)));
    assert!(!plan.follows(b_compile, task(&plan, "A", TaskKind::Compile)));
    assert!(!plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));

    assert!(!plan.follows(b_mkdir, task(&plan, "A", TaskKind::MkDir)));
    assert!(!plan.follows(b_mkdir, task(&plan, "A", TaskKind::Compile)));

    assert!(plan.diagnostics().is_empty());
}

#[test]
fn test_unrelated_targets_do_not_wait_for_each_other() {
    let request = BuildRequest::new()
        .target(library("A"))
        .target(library("B").depends_on("A"))
        .target(library("C").depends_on("A"));
    let plan = plan(&request).unwrap();

    let c_compile = task(&plan, "C", TaskKind::Compile);
    assert!(!plan.follows(c_compile, task(&plan, "B", TaskKind::Compile)));
    assert!(!plan.follows(c_compile, task(&plan, "B", TaskKind::CopyHeader)));
}

#[test]
fn test_linking_waits_for_upstream_end() {
    let request = BuildRequest::new()
        .target(library("A").task(
            TaskSpec::new(TaskKind::Sign)
                .command(["codesign"])
                .input("/build/A/libA.dylib"),
        ))
        .target(library("B").depends_on("A"));
    let plan = plan(&request).unwrap();

    let b_link = task(&plan, "B", TaskKind::Link);
    assert!(plan.follows(b_link, task(&plan, "A", TaskKind::Link)));
    assert!(plan.follows(b_link, task(&plan, "A", TaskKind::Sign)));
}

#[test]
fn test_disabled_upstream_serializes_compilation() {
    let request = BuildRequest::new()
        .target(library("A").settings(settings(|s| s.eager_disable = true)))
        .target(library("B").depends_on("A"));
    let plan = plan(&request).unwrap();

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::Compile)));
    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));

    let b_mkdir = task(&plan, "B", TaskKind::MkDir);
    assert!(!plan.follows(b_mkdir, task(&plan, "A", TaskKind::MkDir)));
}

#[test]
fn test_disabled_target_serializes_everything_it_owns() {
    let request = BuildRequest::new()
        .target(library("A"))
        .target(
            library("B")
                .depends_on("A")
                .settings(settings(|s| s.eager_disable = true)),
        )
        .target(library("C").depends_on("B"));
    let plan = plan(&request).unwrap();

    let b_mkdir = task(&plan, "B", TaskKind::MkDir);
    assert!(plan.follows(b_mkdir, task(&plan, "A", TaskKind::MkDir)));
    assert!(plan.follows(b_mkdir, task(&plan, "A", TaskKind::Compile)));

    let c_compile = task(&plan, "C", TaskKind::Compile);
    assert!(plan.follows(c_compile, task(&plan, "B", TaskKind::Compile)));
    assert!(plan.follows(c_compile, task(&plan, "B", TaskKind::Link)));

    let c_mkdir = task(&plan, "C", TaskKind::MkDir);
    assert!(!plan.follows(c_mkdir, task(&plan, "B", TaskKind::MkDir)));
}

#[test]
fn test_serial_builds_disable_eager_compilation() {
    let request = BuildRequest::new()
        .parallel_targets(false)
        .target(library("A"))
        .target(
            library("B")
                .depends_on("A")
                .settings(settings(|s| s.eager_require = true)),
        );
    let plan = plan(&request).unwrap();

    assert_eq!(
        plan.diagnostics().messages_for("B").collect::<Vec<_>>(),
        ["target 'B' requires eager compilation, but parallel target builds are disabled, which prevent eager compilation"]
    );

    let b_mkdir = task(&plan, "B", TaskKind::MkDir);
    assert!(plan.follows(b_mkdir, task(&plan, "A", TaskKind::Compile)));
    assert!(plan.follows(b_mkdir, task(&plan, "A", TaskKind::MkDir)));

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
}

#[test]
fn test_required_and_disabled_conflict() {
    let request = BuildRequest::new()
        .target(library("A"))
        .target(library("B").depends_on("A").settings(settings(|s| {
            s.eager_require = true;
            s.eager_disable = true;
        })));
    let plan = plan(&request).unwrap();

    assert_eq!(
        plan.diagnostics().messages_for("B").collect::<Vec<_>>(),
        ["target 'B' has both required and disabled eager compilation"]
    );

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
}

#[test]
fn test_unsandboxed_script_after_sources_delays_dependents() {
    let request = BuildRequest::new()
        .target(
            library("A")
                .settings(settings(|s| s.eager_require = true))
                .task(script("Run Script")),
        )
        .target(library("B").depends_on("A"));
    let plan = plan(&request).unwrap();

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
    assert!(plan.follows(b_compile, scripted(&plan, "A", "Run Script")));

    assert!(plan.diagnostics().contains(
        "target 'A' requires eager compilation, but build phase 'Run Script' is delaying eager compilation"
    ));
}

#[test]
fn test_unsandboxed_script_before_sources_waits_for_upstream() {
    let b = TargetSpec::new("B")
        .depends_on("A")
        .working_directory("/src/B")
        .task(mkdir("B"))
        .task(script("Generate"))
        .task(header("B"))
        .task(compile("B", "main"))
        .task(link("B"));
    let request = BuildRequest::new().target(library("A")).target(b);
    let plan = plan(&request).unwrap();

    let b_script = scripted(&plan, "B", "Generate");
    assert!(plan.follows(b_script, task(&plan, "A", TaskKind::Compile)));
    assert!(plan.follows(b_script, task(&plan, "A", TaskKind::Link)));

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
    assert!(plan.follows(b_compile, b_script));

    let b_mkdir = task(&plan, "B", TaskKind::MkDir);
    assert!(!plan.follows(b_mkdir, task(&plan, "A", TaskKind::MkDir)));
    assert!(!plan.follows(b_mkdir, task(&plan, "A", TaskKind::Compile)));
}

#[test]
fn test_identical_scripts_stay_separate_per_target() {
    let target = |name: &str| {
        TargetSpec::new(name)
            .working_directory("/src")
            .task(compile(name, "main"))
            .task(script("./lint.sh"))
    };
    let plan = plan(&BuildRequest::new().target(target("A")).target(target("B"))).unwrap();

    let a_script = scripted(&plan, "A", "./lint.sh");
    let b_script = scripted(&plan, "B", "./lint.sh");
    assert_ne!(a_script, b_script);
    assert_eq!(plan.task(a_script).signature(), plan.task(b_script).signature());

    assert!(plan.follows(a_script, task(&plan, "A", TaskKind::Compile)));
    assert!(plan.follows(b_script, task(&plan, "B", TaskKind::Compile)));
    assert!(!plan.follows(b_script, task(&plan, "A", TaskKind::Compile)));

    let b_end = plan.gate("B", GatePhase::End).unwrap();
    assert!(plan.follows(b_end, b_script));
    assert!(!plan.follows(b_end, a_script));
}

fn scripted_pair(configure: impl Fn(&mut TargetSettings) + Copy) -> BuildPlan {
    let a = library("A")
        .settings(settings(configure))
        .task(script("Post Process"));
    let b = TargetSpec::new("B")
        .depends_on("A")
        .settings(settings(configure))
        .task(mkdir("B"))
        .task(script("Generate"))
        .task(compile("B", "main"))
        .task(link("B"));

    plan(&BuildRequest::new().target(a).target(b)).unwrap()
}

#[test]
fn test_allowed_scripts_do_not_delay_eager_compilation() {
    let plan = scripted_pair(|s| s.eager_allow_scripts = true);

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(!plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
    assert!(!plan.follows(b_compile, scripted(&plan, "A", "Post Process")));

    let b_script = scripted(&plan, "B", "Generate");
    assert!(!plan.follows(b_script, task(&plan, "A", TaskKind::Link)));
    assert!(plan.follows(b_compile, b_script));
}

#[test]
fn test_sandboxed_scripts_do_not_delay_eager_compilation() {
    let plan = scripted_pair(|s| s.script_sandboxing = true);

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(!plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
    assert!(!plan.follows(b_compile, scripted(&plan, "A", "Post Process")));
    assert!(!plan.follows(
        scripted(&plan, "B", "Generate"),
        task(&plan, "A", TaskKind::Link)
    ));
}

#[test]
fn test_aggregate_scripts_wait_for_upstream_end() {
    let aggregate = TargetSpec::new("Bundle")
        .aggregate()
        .depends_on("A")
        .settings(settings(|s| s.script_sandboxing = true))
        .task(script("Package"));
    let request = BuildRequest::new().target(library("A")).target(aggregate);
    let plan = plan(&request).unwrap();

    let package = scripted(&plan, "Bundle", "Package");
    assert!(plan.follows(package, task(&plan, "A", TaskKind::Link)));
    assert!(plan.follows(package, plan.gate("A", GatePhase::End).unwrap()));
}

#[test]
fn test_header_generating_script_after_sources_feeds_modules_ready() {
    let a = library("A")
        .settings(settings(|s| s.script_sandboxing = true))
        .task(script("Generate Header").output("/foo/bar.h"));
    let request = BuildRequest::new()
        .target(a)
        .target(library("B").depends_on("A"));
    let plan = plan(&request).unwrap();

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(plan.follows(b_compile, scripted(&plan, "A", "Generate Header")));
    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
}

#[test]
fn test_header_generating_script_before_sources_keeps_eagerness() {
    let a = TargetSpec::new("A")
        .settings(settings(|s| s.script_sandboxing = true))
        .task(mkdir("A"))
        .task(script("Generate Header").output("/build/A/A.h"))
        .task(compile("A", "main"))
        .task(link("A"));
    let request = BuildRequest::new()
        .target(a)
        .target(library("B").depends_on("A"));
    let plan = plan(&request).unwrap();

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(plan.follows(b_compile, scripted(&plan, "A", "Generate Header")));
    assert!(!plan.follows(b_compile, task(&plan, "A", TaskKind::Compile)));
    assert!(!plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
}

#[test]
fn test_parallel_compilation_disabled_waits_for_upstream_compile() {
    let request = BuildRequest::new()
        .target(library("A").settings(settings(|s| s.eager_parallel_compilation_disable = true)))
        .target(library("B").depends_on("A"));
    let plan = plan(&request).unwrap();

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::Compile)));
    assert!(!plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
}

fn deployed(name: &str, install: &str, require: bool) -> TargetSpec {
    library(name).settings(settings(|s| {
        s.eager_require = require;
        s.deployment_location = true;
        s.install_path = Some(install.into());
        s.product_name = Some(format!("{name}.framework"));
    }))
}

#[test]
fn test_nested_deployment_location_disables_eagerness() {
    let request = BuildRequest::new()
        .target(deployed("A", "/Library/Frameworks", false))
        .target(
            deployed("B", "/Library/Frameworks/A.framework/Versions/A/Frameworks", true)
                .depends_on("A"),
        );
    let plan = plan(&request).unwrap();

    assert_eq!(
        plan.diagnostics().messages_for("B").collect::<Vec<_>>(),
        ["target 'B' requires eager compilation, but deployment location is set and the build directory of 'A' encloses the build directory of 'B'"]
    );

    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
}

#[test]
fn test_sibling_deployment_locations_stay_eager() {
    let request = BuildRequest::new()
        .target(deployed("A", "/Library/Frameworks", false))
        .target(deployed("B", "/Library/Frameworks", true).depends_on("A"));
    let plan = plan(&request).unwrap();

    assert!(plan.diagnostics().is_empty());
    let b_compile = task(&plan, "B", TaskKind::Compile);
    assert!(!plan.follows(b_compile, task(&plan, "A", TaskKind::Link)));
}

#[test]
fn test_gate_chain_within_target() {
    let a = TargetSpec::new("A")
        .task(mkdir("A"))
        .task(
            TaskSpec::new(TaskKind::WriteAuxiliaryFile)
                .describe("A.hmap")
                .output("/build/A/A.hmap"),
        )
        .task(
            TaskSpec::new(TaskKind::EmitModule)
                .input("/src/A/api.swift")
                .output("/build/A/A.swiftmodule"),
        )
        .task(
            compile("A", "main")
                .input("/build/A/A.swiftmodule"),
        );
    let plan = plan(&BuildRequest::new().target(a)).unwrap();

    let gate = |phase| plan.gate("A", phase).unwrap();
    let emit = task(&plan, "A", TaskKind::EmitModule);
    let compile = task(&plan, "A", TaskKind::Compile);
    let hmap = task(&plan, "A", TaskKind::WriteAuxiliaryFile);

    assert!(plan.follows(emit, gate(GatePhase::BeginCompiling)));
    assert!(plan.follows(compile, emit));
    assert!(plan.follows(gate(GatePhase::End), compile));
    assert!(plan.follows(gate(GatePhase::ModulesReady), emit));
    assert!(!plan.follows(gate(GatePhase::ModulesReady), compile));

    assert!(plan.follows(hmap, gate(GatePhase::Immediate)));
    assert!(plan.follows(gate(GatePhase::ModulesReady), hmap));
    assert!(plan.follows(gate(GatePhase::Immediate), task(&plan, "A", TaskKind::MkDir)));
}

#[test]
fn test_every_target_gets_four_gates() {
    let plan = plan(&BuildRequest::new().target(TargetSpec::new("Empty"))).unwrap();

    for phase in GatePhase::ALL {
        let gate = plan.gate("Empty", phase).unwrap();
        assert!(plan.task(gate).is_gate());
    }
    assert_eq!(plan.len(), 4);
}

#[test]
fn test_custom_tasks_are_prerequisites_with_virtual_completion() {
    let generate = TaskSpec::new(TaskKind::CustomTask)
        .describe("Generate Sources")
        .command(["gen", "--all"])
        .env("MODE", "release");
    let a = TargetSpec::new("A")
        .task(generate.clone())
        .task(generate)
        .task(compile("A", "main"));
    let plan = plan(&BuildRequest::new().target(a)).unwrap();

    let custom = plan.find_all("A", TaskKind::CustomTask);
    assert_eq!(custom.len(), 1);

    let task_ref = plan.task(custom[0]);
    let node = plan.node(task_ref.outputs()[0]);
    assert_eq!(
        node.name(),
        format!("A/CustomTask-{}", task_ref.signature().to_hex())
    );
    assert_eq!(task_ref.rule().parts()[1], "Generate Sources");

    let compile = task(&plan, "A", TaskKind::Compile);
    assert!(plan.follows(compile, custom[0]));
}

#[test]
fn test_task_environment_merges_over_target_environment() {
    let a = TargetSpec::new("A")
        .env("PATH", "/usr/bin")
        .env("MODE", "debug")
        .task(script("Run").env("MODE", "release"));
    let plan = plan(&BuildRequest::new().target(a)).unwrap();

    let env = plan.task(scripted(&plan, "A", "Run")).environment();
    assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
    assert_eq!(env.get("MODE").map(String::as_str), Some("release"));
}

#[test]
fn test_planning_is_deterministic() {
    let request = BuildRequest::new()
        .target(library("A").task(script("Post")))
        .target(library("B").depends_on("A"))
        .target(library("C").depends_on("A").depends_on("B"));

    let first = plan(&request).unwrap();
    let second = plan(&request).unwrap();

    assert_eq!(first.len(), second.len());
    assert_eq!(first.edge_labels(), second.edge_labels());
}

#[test]
fn test_invalid_requests() {
    let unknown = BuildRequest::new().target(TargetSpec::new("A").depends_on("Missing"));
    assert!(matches!(
        plan(&unknown),
        Err(PlanError::UnknownDependency { .. })
    ));

    let duplicate = BuildRequest::new()
        .target(TargetSpec::new("A"))
        .target(TargetSpec::new("A"));
    assert!(matches!(
        plan(&duplicate),
        Err(PlanError::DuplicateTarget(_))
    ));

    let cyclic = BuildRequest::new()
        .target(library("A").depends_on("B"))
        .target(library("B").depends_on("A"));
    assert!(matches!(plan(&cyclic), Err(PlanError::Cycle(_))));
}
