//! Parallel execution of a [`BuildPlan`].
//!
//! The scheduler thread counts unresolved predecessors for every task and
//! hands tasks whose count drops to zero to a bounded rayon pool. Results come
//! back over a channel. Gates carry no work and are passed inline, without
//! occupying a worker.

mod report;

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

pub use self::report::{BuildReport, TaskExecution, TaskFailure, TaskOutcome};
use crate::action::{Action, ActionContext, CancellationToken, TaskAction};
use crate::cache::CompilationCache;
use crate::config::BuildOptions;
use crate::error::{ActionError, BuildError};
use crate::graph::{BuildPlan, TaskId};

struct Completion {
    index: NodeIndex,
    result: Result<TaskOutcome, String>,
    start: Instant,
    duration: Duration,
}

/// Runs the tasks of one plan.
pub struct Executor<'a> {
    plan: &'a BuildPlan,
    options: &'a BuildOptions,
    cache: Option<&'a CompilationCache>,
    cancel: CancellationToken,
}

impl<'a> Executor<'a> {
    pub fn new(plan: &'a BuildPlan, options: &'a BuildOptions) -> Self {
        Self {
            plan,
            options,
            cache: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cache(mut self, cache: &'a CompilationCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Uses `token` to stop the build from outside. Running actions see it
    /// too and stop at their next check.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Restores or runs a single task.
    fn run_task(&self, id: TaskId) -> Result<TaskOutcome, ActionError> {
        let task = self.plan.task(id);
        let action = Action::from_command_line(&task.evaluated_command_line())?;

        let cached = match self.cache {
            Some(cache) if task.is_cacheable() => match cache.key(self.plan, id) {
                Ok(key) => Some((cache, key)),
                Err(err) => {
                    tracing::warn!("couldn't compute cache key of '{}': {err}", task.label());
                    None
                }
            },
            _ => None,
        };

        if let Some((cache, key)) = &cached
            && cache.restore(key, task.target.as_ref())
        {
            tracing::debug!("restored '{}' from cache", task.label());
            return Ok(TaskOutcome::CacheHit);
        }

        if let Some(action) = &action {
            let ctx = ActionContext::new(task.working_directory(), task.environment(), &self.cancel);
            tracing::debug!("running {} for '{}'", action.identifier(), task.label());
            action.execute(&ctx)?;
        }

        if let Some((cache, key)) = cached {
            let outputs: Vec<Utf8PathBuf> = task
                .outputs()
                .iter()
                .filter_map(|&node| self.plan.node(node).path())
                .map(ToOwned::to_owned)
                .collect();

            if let Err(err) = cache.store(key, &outputs) {
                tracing::warn!("couldn't cache outputs of '{}': {err}", task.label());
            }
        }

        Ok(TaskOutcome::Executed)
    }

    /// Runs the plan to completion and reports how every task ended.
    ///
    /// A failed task never fails the call: its transitive dependents are
    /// marked [`TaskOutcome::Skipped`] and, unless the options say to keep
    /// going, nothing new is scheduled afterwards.
    pub fn run(&self) -> Result<BuildReport, BuildError> {
        let graph = &self.plan.graph;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.jobs.max(1))
            .thread_name(|i| format!("kumitate-worker-{i}"))
            .build()?;

        // Build a map from a dependency to the nodes that depend on it.
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        let mut dependency_counts: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|i| (i, graph.neighbors_directed(i, Direction::Incoming).count()))
            .collect();

        let mut report = BuildReport {
            diagnostics: self.plan.diagnostics().clone(),
            ..BuildReport::default()
        };

        let total_tasks = graph.node_count() as u64;
        let root_span = tracing::span!(Level::INFO, "building_tasks");
        root_span.pb_set_length(total_tasks);
        root_span.pb_set_style(&crate::utils::get_style_build()?);
        root_span.pb_set_message("Building tasks...");
        let _enter = root_span.enter();

        // regular task style with no progress
        let pb_style = crate::utils::get_style_task()?;

        let mut ready: VecDeque<NodeIndex> = graph
            .node_indices()
            .filter(|i| dependency_counts.get(i).copied().unwrap_or(0) == 0)
            .collect();
        let mut in_flight = 0usize;
        let mut stopped = false;

        let (result_sender, result_receiver) = channel::<Completion>();

        pool.in_place_scope(|s| {
            loop {
                while let Some(index) = ready.pop_front() {
                    if !stopped && self.cancel.is_cancelled() {
                        tracing::warn!("Build cancelled");
                        stopped = true;
                    }
                    if stopped {
                        continue;
                    }

                    let task = &graph[index];
                    if task.is_gate() {
                        report.outcomes.insert(TaskId(index), TaskOutcome::Gate);
                        root_span.pb_inc(1);
                        release(index, &dependents, &mut dependency_counts, &mut ready);
                        continue;
                    }

                    in_flight += 1;
                    let sender = result_sender.clone();
                    let pb_style = pb_style.clone();

                    s.spawn(move |_| {
                        let label = task.label();
                        let span = tracing::span!(Level::INFO, "task", name = label.as_str());
                        span.pb_set_style(&pb_style);
                        span.pb_set_message(&format!("Running {label}"));
                        let _enter = span.enter();

                        let start = Instant::now();
                        let result = match catch_unwind(AssertUnwindSafe(|| {
                            self.run_task(TaskId(index))
                        })) {
                            Ok(Ok(outcome)) => Ok(outcome),
                            Ok(Err(ActionError::Cancelled)) => Ok(TaskOutcome::Cancelled),
                            Ok(Err(err)) => Err(err.to_string()),
                            Err(panic) => Err(if let Some(s) = panic.downcast_ref::<&str>() {
                                format!("Task panicked: {s}")
                            } else if let Some(s) = panic.downcast_ref::<String>() {
                                format!("Task panicked: {s}")
                            } else {
                                String::from("Task panicked with unknown payload")
                            }),
                        };

                        let _ = sender.send(Completion {
                            index,
                            result,
                            start,
                            duration: start.elapsed(),
                        });
                    });
                }

                if in_flight == 0 {
                    break;
                }

                let Ok(done) = result_receiver.recv() else {
                    break;
                };
                in_flight -= 1;
                root_span.pb_inc(1);

                let id = TaskId(done.index);
                let execution = TaskExecution {
                    start: done.start,
                    duration: done.duration,
                };

                match done.result {
                    Ok(TaskOutcome::Executed) => {
                        report.execution_times.insert(id, execution);
                        report.outcomes.insert(id, TaskOutcome::Executed);
                        release(done.index, &dependents, &mut dependency_counts, &mut ready);
                    }
                    Ok(TaskOutcome::Cancelled) => {
                        report.outcomes.insert(id, TaskOutcome::Cancelled);
                        stopped = true;
                    }
                    Ok(outcome) => {
                        report.outcomes.insert(id, outcome);
                        release(done.index, &dependents, &mut dependency_counts, &mut ready);
                    }
                    Err(message) => {
                        let rule = graph[done.index].label();
                        tracing::error!("{rule} failed:\n{message}");

                        report.execution_times.insert(id, execution);
                        report.failures.push(TaskFailure {
                            rule,
                            message: message.clone(),
                        });
                        report.outcomes.insert(id, TaskOutcome::Failed(message));

                        let skipped = skip_dependents(done.index, &dependents, &mut report);
                        root_span.pb_inc(skipped);

                        if !self.options.continue_after_errors {
                            stopped = true;
                        }
                    }
                }
            }
        });

        let mut cancelled = 0;
        for index in graph.node_indices() {
            report
                .outcomes
                .entry(TaskId(index))
                .or_insert_with(|| {
                    cancelled += 1;
                    TaskOutcome::Cancelled
                });
        }
        if cancelled > 0 {
            tracing::warn!("{cancelled} tasks were not started");
        }

        if let Some(cache) = self.cache {
            report.diagnostics.extend(cache.finish()?);
            report.cache = Some(cache.metrics());
        }

        if report.is_success() {
            tracing::info!("Build complete!");
        } else {
            tracing::info!("Build failed with {} errors", report.failures.len());
        }
        Ok(report)
    }
}

/// Counts down the dependents of a finished task, queueing those that
/// became ready.
fn release(
    index: NodeIndex,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    counts: &mut HashMap<NodeIndex, usize>,
    ready: &mut VecDeque<NodeIndex>,
) {
    for &dependent in dependents.get(&index).into_iter().flatten() {
        if let Some(count) = counts.get_mut(&dependent) {
            *count -= 1;
            if *count == 0 {
                ready.push_back(dependent);
            }
        }
    }
}

/// Marks every transitive dependent of a failed task as skipped. Returns how
/// many were marked.
fn skip_dependents(
    index: NodeIndex,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    report: &mut BuildReport,
) -> u64 {
    let mut skipped = 0;
    let mut stack = vec![index];

    while let Some(current) = stack.pop() {
        for &dependent in dependents.get(&current).into_iter().flatten() {
            let id = TaskId(dependent);
            if !report.outcomes.contains_key(&id) {
                report.outcomes.insert(id, TaskOutcome::Skipped);
                skipped += 1;
                stack.push(dependent);
            }
        }
    }

    skipped
}

/// Runs `plan` with the cache described by `options`, if any.
pub fn build(plan: &BuildPlan, options: &BuildOptions) -> Result<BuildReport, BuildError> {
    let cache = options.cache.clone().map(CompilationCache::open).transpose()?;

    let mut executor = Executor::new(plan, options);
    if let Some(cache) = &cache {
        executor = executor.with_cache(cache);
    }
    executor.run()
}
