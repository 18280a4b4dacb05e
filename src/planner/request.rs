use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::graph::{CommandArg, TaskKind};

/// Everything the planner needs: targets with fully expanded task
/// descriptors and the global scheduling switches.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildRequest {
    pub targets: Vec<TargetSpec>,
    /// Build independent targets concurrently. Eager compilation needs this.
    pub parallel_targets: bool,
    pub continue_after_errors: bool,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            parallel_targets: true,
            continue_after_errors: false,
        }
    }
}

impl BuildRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn target(mut self, target: TargetSpec) -> Self {
        self.targets.push(target);
        self
    }

    pub fn parallel_targets(mut self, value: bool) -> Self {
        self.parallel_targets = value;
        self
    }

    pub fn continue_after_errors(mut self, value: bool) -> Self {
        self.continue_after_errors = value;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    #[default]
    Standard,
    /// A target with no sources of its own, only scripts and dependencies.
    Aggregate,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSpec {
    pub name: String,
    pub kind: TargetKind,
    pub dependencies: Vec<String>,
    pub settings: TargetSettings,
    /// Default working directory of the target's tasks.
    pub working_directory: Option<Utf8PathBuf>,
    /// Base environment merged under every task's own environment.
    pub environment: BTreeMap<String, String>,
    pub tasks: Vec<TaskSpec>,
}

impl TargetSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn aggregate(mut self) -> Self {
        self.kind = TargetKind::Aggregate;
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn settings(mut self, settings: TargetSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn working_directory(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub(crate) fn default_working_directory(&self) -> &Utf8Path {
        self.working_directory
            .as_deref()
            .unwrap_or(Utf8Path::new("/"))
    }
}

/// Per-target scheduling settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    pub eager_require: bool,
    pub eager_disable: bool,
    /// Scripts of this target do not delay eager compilation of dependents.
    pub eager_allow_scripts: bool,
    /// Dependents wait for this target's compilation, not only its interfaces.
    pub eager_parallel_compilation_disable: bool,
    pub script_sandboxing: bool,
    pub deployment_location: bool,
    pub install_path: Option<Utf8PathBuf>,
    pub product_name: Option<String>,
}

impl TargetSettings {
    /// Reads settings from a map of build setting names to values.
    ///
    /// Boolean settings accept `YES`, `true` and `1`; anything else is false.
    pub fn from_build_settings(settings: &BTreeMap<String, String>) -> Self {
        let flag = |name: &str| {
            settings
                .get(name)
                .map(|value| is_truthy(value))
                .unwrap_or(false)
        };

        Self {
            eager_require: flag("EAGER_COMPILATION_REQUIRE"),
            eager_disable: flag("EAGER_COMPILATION_DISABLE"),
            eager_allow_scripts: flag("EAGER_COMPILATION_ALLOW_SCRIPTS"),
            eager_parallel_compilation_disable: flag("EAGER_PARALLEL_COMPILATION_DISABLE"),
            script_sandboxing: flag("ENABLE_USER_SCRIPT_SANDBOXING"),
            deployment_location: flag("DEPLOYMENT_LOCATION"),
            install_path: settings
                .get("INSTALL_PATH")
                .filter(|value| !value.is_empty())
                .map(Utf8PathBuf::from),
            product_name: settings
                .get("PRODUCT_NAME")
                .filter(|value| !value.is_empty())
                .cloned(),
        }
    }
}

pub(crate) fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "true" | "1"
    )
}

/// A task descriptor with every macro already expanded.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub description: Option<String>,
    pub command_line: Vec<CommandArg>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<Utf8PathBuf>,
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
    pub always_out_of_date: bool,
    pub cacheable: bool,
    /// Overrides whether the outputs feed dependents' module resolution.
    pub interface: Option<bool>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self::new(TaskKind::Synthetic)
    }
}

impl TaskSpec {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            description: None,
            command_line: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            always_out_of_date: false,
            cacheable: false,
            interface: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn command<A: Into<CommandArg>>(mut self, args: impl IntoIterator<Item = A>) -> Self {
        self.command_line = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn arg(mut self, arg: impl Into<CommandArg>) -> Self {
        self.command_line.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn working_directory(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn input(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn always_out_of_date(mut self) -> Self {
        self.always_out_of_date = true;
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn interface(mut self, value: bool) -> Self {
        self.interface = Some(value);
        self
    }

    /// Whether any output is a file dependents resolve modules through.
    pub fn produces_interface(&self) -> bool {
        const EXTENSIONS: &[&str] = &[
            "h",
            "hh",
            "hpp",
            "modulemap",
            "swiftmodule",
            "swiftinterface",
            "swiftdoc",
            "pcm",
        ];

        self.interface.unwrap_or_else(|| {
            self.outputs
                .iter()
                .filter_map(|path| path.extension())
                .any(|ext| EXTENSIONS.contains(&ext))
        })
    }

    /// Label used in rule descriptors and diagnostics.
    pub fn label(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }

        self.outputs
            .first()
            .or(self.inputs.first())
            .map(|path| path.to_string())
            .unwrap_or_else(|| self.kind.rule_type().to_string())
    }
}
