#![forbid(unsafe_code)]
//! `kumitate` plans and runs builds made of many interdependent targets.
//!
//! A [`BuildRequest`] lists targets, their dependencies and the tasks each of
//! them needs. The [`planner`] turns it into a [`BuildPlan`], a task graph in
//! which every target is split into phases by gate tasks. That lets a target
//! start compiling as soon as the interfaces of its dependencies exist,
//! instead of waiting for them to finish linking, whenever the targets'
//! settings allow it.
//!
//! The [`Executor`] runs a plan on a bounded worker pool. Tasks marked
//! cacheable are looked up in a content-addressed [`CompilationCache`] first
//! and only run on a miss.
//!
//! ```no_run
//! use kumitate::{BuildOptions, BuildRequest, TargetSpec, build, plan};
//!
//! let request = BuildRequest::new()
//!     .target(TargetSpec::new("Core"))
//!     .target(TargetSpec::new("App").depends_on("Core"));
//!
//! let plan = plan(&request)?;
//! let report = build(&plan, &BuildOptions::new())?;
//! assert!(report.is_success());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod action;
pub mod cache;
pub mod config;
mod core;
mod diagnostics;
mod error;
pub mod executor;
mod fingerprint;
pub mod graph;
pub mod planner;
mod utils;

pub use crate::cache::{CacheKey, CompilationCache, MetricsSnapshot, Validation};
pub use crate::config::{BuildOptions, CacheConfig, parse_size};
pub use crate::core::{ArcStr, Hash32, normalize_path, posix_string};
pub use crate::diagnostics::{Diagnostic, Diagnostics, Severity};
pub use crate::error::*;
pub use crate::executor::{BuildReport, Executor, TaskFailure, TaskOutcome, build};
pub use crate::fingerprint::{Fingerprint, fingerprint};
pub use crate::graph::{BuildPlan, TaskId, TaskKind};
pub use crate::planner::{BuildRequest, TargetSettings, TargetSpec, TaskSpec, plan};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
