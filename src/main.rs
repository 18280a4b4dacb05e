use std::collections::BTreeMap;
use std::fs;
use std::process::ExitCode;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use console::style;
use kumitate::action::{
    ActionContext, CancellationToken, ObjectLibraryOptions, TaskAction, TestEntryPointOptions,
};
use kumitate::{
    BuildOptions, BuildPlan, BuildRequest, CacheConfig, CompilationCache, Diagnostics, Executor,
    Severity, TaskOutcome,
};

/// Build orchestration with eager cross-target scheduling and a compilation
/// cache.
#[derive(Parser)]
#[command(name = "kumitate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Collect object files into one directory and write a response file.
    AssembleObjectLibrary(ObjectLibraryOptions),
    /// Generate the entry point of a test runner.
    GenerateTestEntryPoint(TestEntryPointOptions),
    /// Plan a build request and print the task graph.
    Plan(PlanArgs),
    /// Plan and run a build request.
    Build(BuildArgs),
    /// Maintain a compilation cache.
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Parser)]
struct PlanArgs {
    /// Build request in JSON.
    request: Utf8PathBuf,

    /// Print the graph as a Mermaid diagram.
    #[arg(long)]
    mermaid: bool,
}

#[derive(Parser)]
struct BuildArgs {
    /// Build request in JSON.
    request: Utf8PathBuf,

    /// Number of worker threads.
    #[arg(long, short = 'j')]
    jobs: Option<usize>,

    #[arg(long)]
    continue_after_errors: bool,

    /// Root of the compilation cache. No cache is used without it.
    #[arg(long)]
    cache_path: Option<Utf8PathBuf>,

    /// Cache size limit in bytes, with an optional K, M or G suffix.
    #[arg(long, requires = "cache_path")]
    cache_limit: Option<String>,

    /// Report a note for every cache lookup.
    #[arg(long, requires = "cache_path")]
    cache_remarks: bool,

    /// Write the executed graph as a Mermaid diagram.
    #[arg(long)]
    diagram: Option<Utf8PathBuf>,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Check every entry and drop the broken ones.
    Validate { path: Utf8PathBuf },
    /// Evict least recently used entries down to a size limit.
    Evict {
        path: Utf8PathBuf,
        #[arg(long)]
        limit: String,
    },
}

fn print_diagnostics(diagnostics: &Diagnostics) {
    for diagnostic in diagnostics.iter() {
        let severity = match diagnostic.severity {
            Severity::Note => style(diagnostic.severity).cyan(),
            Severity::Warning => style(diagnostic.severity).yellow(),
            Severity::Error => style(diagnostic.severity).red(),
        };
        let target = diagnostic
            .target
            .as_deref()
            .map(|target| format!(" [{target}]"))
            .unwrap_or_default();
        eprintln!("{}{target}: {}", severity.bold(), diagnostic.message);
    }
}

fn load_plan(path: &Utf8Path) -> anyhow::Result<(BuildRequest, BuildPlan)> {
    let text = fs::read_to_string(path).with_context(|| format!("couldn't read '{path}'"))?;
    let request = BuildRequest::from_json(&text).with_context(|| format!("invalid request '{path}'"))?;
    let plan = kumitate::plan(&request)?;
    Ok((request, plan))
}

fn run_action(action: &dyn TaskAction) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| anyhow::anyhow!("current directory '{}' is not UTF-8", path.display()))?;
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let token = CancellationToken::new();

    action.execute(&ActionContext::new(&cwd, &env, &token))?;
    Ok(())
}

fn run_plan(args: PlanArgs) -> anyhow::Result<bool> {
    let (_, plan) = load_plan(&args.request)?;
    print_diagnostics(plan.diagnostics());

    if args.mermaid {
        print!("{plan}");
    } else {
        for (id, task) in plan.tasks() {
            let deps: Vec<String> = plan
                .dependencies(id)
                .into_iter()
                .map(|dep| dep.index().to_string())
                .collect();
            println!("{:>4}  {}  <- [{}]", id.index(), task.label(), deps.join(", "));
        }
    }

    eprintln!(
        "Planned {} tasks with {} edges",
        style(plan.len()).bold(),
        style(plan.edge_count()).bold()
    );
    Ok(true)
}

fn run_build(args: BuildArgs) -> anyhow::Result<bool> {
    let (request, plan) = load_plan(&args.request)?;

    let mut options =
        BuildOptions::new().continue_after_errors(args.continue_after_errors || request.continue_after_errors);
    if let Some(jobs) = args.jobs {
        options = options.jobs(jobs);
    }
    if let Some(path) = args.cache_path {
        let mut config = CacheConfig::new(path).remarks(args.cache_remarks);
        if let Some(limit) = &args.cache_limit {
            let limit = kumitate::parse_size(limit)?;
            if limit > 0 {
                config = config.limit_size(limit);
            }
        }
        options = options.cache(config);
    }

    let cache = options.cache.clone().map(CompilationCache::open).transpose()?;
    let mut executor = Executor::new(&plan, &options);
    if let Some(cache) = &cache {
        executor = executor.with_cache(cache);
    }
    let report = executor.run()?;

    print_diagnostics(report.diagnostics());
    for failure in report.failures() {
        eprintln!("{} {}\n{}", style("failed:").red().bold(), failure.rule, failure.message);
    }

    if let Some(path) = &args.diagram {
        fs::write(path, report.render_mermaid(&plan))
            .with_context(|| format!("couldn't write '{path}'"))?;
    }

    eprintln!(
        "{} executed, {} cached, {} failed, {} skipped, {} cancelled",
        report.count(&TaskOutcome::Executed),
        report.count(&TaskOutcome::CacheHit),
        report.failures().len(),
        report.count(&TaskOutcome::Skipped),
        report.count(&TaskOutcome::Cancelled),
    );

    Ok(report.is_success())
}

fn run_cache(command: CacheCommand) -> anyhow::Result<bool> {
    match command {
        CacheCommand::Validate { path } => {
            let cache = CompilationCache::open(CacheConfig::new(path))?;
            let validation = cache.validate()?;
            print_diagnostics(&cache.finish()?);
            println!("cache {validation}");
        }
        CacheCommand::Evict { path, limit } => {
            let limit = kumitate::parse_size(&limit)?;
            let cache = CompilationCache::open(CacheConfig::new(path))?;
            let evicted = cache.evict_to_budget(limit)?;
            println!(
                "evicted {evicted} entries, {} entries ({} bytes) remain",
                cache.len(),
                cache.size()
            );
        }
    }
    Ok(true)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = kumitate::init_logging() {
        eprintln!("{} {err}", style("warning:").yellow().bold());
    }

    let result = match cli.command {
        Command::AssembleObjectLibrary(options) => run_action(&options).map(|()| true),
        Command::GenerateTestEntryPoint(options) => run_action(&options).map(|()| true),
        Command::Plan(args) => run_plan(args),
        Command::Build(args) => run_build(args),
        Command::Cache(command) => run_cache(command),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}
