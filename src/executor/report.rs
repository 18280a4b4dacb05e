use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::cache::MetricsSnapshot;
use crate::diagnostics::Diagnostics;
use crate::graph::{BuildPlan, TaskId};

/// How a single task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The action ran and succeeded.
    Executed,
    /// Outputs were restored from the compilation cache.
    CacheHit,
    /// A phase gate was passed.
    Gate,
    Failed(String),
    /// A task this one depends on failed.
    Skipped,
    /// The build stopped before this task was scheduled.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub rule: String,
    pub message: String,
}

/// Summary of one build.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub(crate) outcomes: HashMap<TaskId, TaskOutcome>,
    /// Tasks whose action ran, with their timings.
    pub execution_times: HashMap<TaskId, TaskExecution>,
    pub(crate) failures: Vec<TaskFailure>,
    pub(crate) cache: Option<MetricsSnapshot>,
    pub(crate) diagnostics: Diagnostics,
}

impl BuildReport {
    pub fn outcome(&self, id: TaskId) -> Option<&TaskOutcome> {
        self.outcomes.get(&id)
    }

    /// Number of tasks that ended with `outcome`. Failures match regardless
    /// of their message.
    pub fn count(&self, outcome: &TaskOutcome) -> usize {
        self.outcomes
            .values()
            .filter(|&seen| match (seen, outcome) {
                (TaskOutcome::Failed(_), TaskOutcome::Failed(_)) => true,
                (seen, outcome) => seen == outcome,
            })
            .count()
    }

    /// Failures in the order they were observed.
    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(|outcome| {
            matches!(
                outcome,
                TaskOutcome::Executed | TaskOutcome::CacheHit | TaskOutcome::Gate
            )
        })
    }

    /// Cache counters of this build, if a cache was used.
    pub fn cache_metrics(&self) -> Option<&MetricsSnapshot> {
        self.cache.as_ref()
    }

    /// Planning diagnostics followed by cache notes.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Renders the plan as a Mermaid diagram, color-coded by outcome.
    ///
    /// * **Green** to **Red**: executed, from fastest to slowest
    /// * **Blue**: restored from the cache
    /// * **Grey**: gates, skipped and cancelled tasks
    pub fn render_mermaid(&self, plan: &BuildPlan) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for (id, task) in plan.tasks() {
            let name = task.label().replace('"', "\\\"");

            let (label_extra, color_code) = match (self.outcomes.get(&id), times.get(&id)) {
                (Some(TaskOutcome::Failed(_)), _) => ("Failed".to_string(), "#FF6347".to_string()),
                (_, Some(exec)) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);

                    // 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
                    let (r, g, b) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255, 0)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
                    };

                    (
                        format!("{:.2?}", exec.duration),
                        format!("#{r:02X}{g:02X}{b:02X}"),
                    )
                }
                (Some(TaskOutcome::CacheHit), _) => ("Cached".to_string(), "#ADD8E6".to_string()),
                (Some(TaskOutcome::Gate), _) => ("Gate".to_string(), "#D3D3D3".to_string()),
                (Some(TaskOutcome::Skipped), _) => ("Skipped".to_string(), "#F5F5F5".to_string()),
                _ => ("Cancelled".to_string(), "#F5F5F5".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", id.index(), name, label_extra);
            let _ = writeln!(f, "    style {} fill:{}", id.index(), color_code);
        }

        for (id, _) in plan.tasks() {
            for dependent in plan.dependents(id) {
                let _ = writeln!(f, "    {} --> {}", id.index(), dependent.index());
            }
        }

        f
    }
}
