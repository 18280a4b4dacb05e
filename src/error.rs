use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while turning a build request into a task graph.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Target '{0}' is declared more than once")]
    DuplicateTarget(String),

    #[error("Target '{target}' depends on unknown target '{dependency}'")]
    UnknownDependency { target: String, dependency: String },

    #[error("Target '{0}' declares a gate task, gates are created by the planner")]
    ReservedKind(String),

    #[error("Multiple tasks produce '{node}':\n  {first}\n  {second}")]
    DuplicateProducer {
        node: String,
        first: String,
        second: String,
    },

    #[error("Cycle detected in task graph at '{0}'")]
    Cycle(String),
}

/// Errors raised by the compilation cache.
///
/// Lookups never surface these: a broken cache degrades to misses. They are
/// returned from operations that must write, like storing or evicting.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode the cache index at '{0}':\n{1}")]
    Encode(Utf8PathBuf, String),

    #[error("Invalid cache size limit '{0}'")]
    InvalidLimit(String),

    #[error("Output '{0}' of a cacheable task does not exist")]
    MissingOutput(Utf8PathBuf),
}

/// Errors raised by task actions.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}: {1}")]
    Context(String, std::io::Error),

    #[error("Invalid arguments for '{0}':\n{1}")]
    Arguments(&'static str, clap::Error),

    #[error("Unknown builtin action '{0}'")]
    UnknownBuiltin(String),

    #[error("Failed to spawn '{0}':\n{1}")]
    Spawn(String, std::io::Error),

    #[error("Command '{program}' failed with {status}\n{output}")]
    ProcessFailed {
        program: String,
        status: std::process::ExitStatus,
        output: String,
    },

    #[error("Index store '{path}': {message}")]
    IndexStore { path: Utf8PathBuf, message: String },

    #[error("Cancelled")]
    Cancelled,
}

/// Errors that abort a build as a whole, as opposed to failing single tasks.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Error while planning the build:\n{0}")]
    Plan(#[from] PlanError),

    #[error("Compilation cache error:\n{0}")]
    Cache(#[from] CacheError),

    #[error("Couldn't start the worker pool:\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Progress(#[from] indicatif::style::TemplateError),
}
