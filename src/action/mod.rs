//! What a task does when it runs.
//!
//! Every task carries a command line. Commands whose first token names one
//! of the builtin actions run in-process; anything else is spawned as a child
//! process. The set of builtins is closed, see [`Action`].

mod builtin;
mod object_library;
mod process;
mod response_file;
mod test_entry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

pub use self::builtin::{CopyOptions, MkdirOptions};
pub use self::object_library::{ObjectLibraryOptions, RESPONSE_FILE, destination_names};
pub use self::process::ProcessAction;
pub use self::response_file::ResponseFileFormat;
pub use self::test_entry::{
    JsonIndexStore, TestCaseClass, TestEntryPointOptions, TestIndex, TestMethod, filelist_objects,
    merge_classes, remap_object, render_entry_point,
};
use crate::core::normalize_path;
use crate::error::ActionError;

/// Shared flag telling running actions to stop at the next opportunity.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything an action sees of the task it runs for.
#[derive(Clone, Copy, Debug)]
pub struct ActionContext<'a> {
    working_directory: &'a Utf8Path,
    environment: &'a BTreeMap<String, String>,
    cancel: &'a CancellationToken,
}

impl<'a> ActionContext<'a> {
    pub fn new(
        working_directory: &'a Utf8Path,
        environment: &'a BTreeMap<String, String>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            working_directory,
            environment,
            cancel,
        }
    }

    pub fn working_directory(&self) -> &'a Utf8Path {
        self.working_directory
    }

    pub fn environment(&self) -> &'a BTreeMap<String, String> {
        self.environment
    }

    /// Anchors a possibly relative path at the working directory.
    pub fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        normalize_path(&self.working_directory.join(path))
    }

    pub fn check_cancelled(&self) -> Result<(), ActionError> {
        match self.cancel.is_cancelled() {
            true => Err(ActionError::Cancelled),
            false => Ok(()),
        }
    }
}

/// A unit of work performed on behalf of a task.
pub trait TaskAction {
    /// Short name used in logs.
    fn identifier(&self) -> &'static str;

    fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    AssembleObjectLibrary(ObjectLibraryOptions),
    GenerateTestEntryPoint(TestEntryPointOptions),
    MakeDirectory(MkdirOptions),
    Copy(CopyOptions),
    Process(ProcessAction),
}

const BUILTIN_PREFIX: &str = "builtin-";

fn parse<P: Parser>(identifier: &'static str, args: &[String]) -> Result<P, ActionError> {
    P::try_parse_from(args).map_err(|e| ActionError::Arguments(identifier, e))
}

impl Action {
    /// Selects the action for an evaluated command line. An empty command
    /// line has no action.
    pub fn from_command_line(args: &[String]) -> Result<Option<Action>, ActionError> {
        let Some(program) = args.first() else {
            return Ok(None);
        };

        let action = match program.as_str() {
            "builtin-assemble-object-library" => {
                Action::AssembleObjectLibrary(parse("assemble-object-library", args)?)
            }
            "builtin-generate-test-entry-point" => {
                Action::GenerateTestEntryPoint(parse("generate-test-entry-point", args)?)
            }
            "builtin-mkdir" => Action::MakeDirectory(parse("mkdir", args)?),
            "builtin-copy" => Action::Copy(parse("copy", args)?),
            other if other.starts_with(BUILTIN_PREFIX) => {
                return Err(ActionError::UnknownBuiltin(other.to_string()));
            }
            _ => Action::Process(ProcessAction::new(args.to_vec())),
        };

        Ok(Some(action))
    }

    fn inner(&self) -> &dyn TaskAction {
        match self {
            Action::AssembleObjectLibrary(action) => action,
            Action::GenerateTestEntryPoint(action) => action,
            Action::MakeDirectory(action) => action,
            Action::Copy(action) => action,
            Action::Process(action) => action,
        }
    }
}

impl TaskAction for Action {
    fn identifier(&self) -> &'static str {
        self.inner().identifier()
    }

    fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        ctx.check_cancelled()?;
        self.inner().execute(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_builtin_selection() {
        let action = Action::from_command_line(&args(&["builtin-mkdir", "/tmp/out"]))
            .unwrap()
            .unwrap();
        assert_eq!(action.identifier(), "mkdir");

        let action = Action::from_command_line(&args(&[
            "builtin-assemble-object-library",
            "a.o",
            "--output",
            "lib",
            "--linker-response-file-format",
            "unixShellQuotedNewlineSeparated",
        ]))
        .unwrap()
        .unwrap();
        assert!(matches!(action, Action::AssembleObjectLibrary(_)));
    }

    #[test]
    fn test_other_programs_are_processes() {
        let action = Action::from_command_line(&args(&["/usr/bin/cc", "-c", "main.c"]))
            .unwrap()
            .unwrap();
        assert_eq!(action.identifier(), "process");
    }

    #[test]
    fn test_unknown_builtin() {
        let err = Action::from_command_line(&args(&["builtin-frobnicate"])).unwrap_err();
        assert!(matches!(err, ActionError::UnknownBuiltin(name) if name == "builtin-frobnicate"));
    }

    #[test]
    fn test_bad_builtin_arguments() {
        let err = Action::from_command_line(&args(&["builtin-assemble-object-library", "a.o"]))
            .unwrap_err();
        assert!(matches!(err, ActionError::Arguments("assemble-object-library", _)));
    }

    #[test]
    fn test_empty_command_line() {
        assert!(Action::from_command_line(&[]).unwrap().is_none());
    }

    #[test]
    fn test_cancelled_context() {
        let env = BTreeMap::new();
        let token = CancellationToken::new();
        let ctx = ActionContext::new(Utf8Path::new("/work"), &env, &token);

        assert!(ctx.check_cancelled().is_ok());
        assert_eq!(ctx.resolve(Utf8Path::new("../out/./a.o")), "/out/a.o");
        assert_eq!(ctx.resolve(Utf8Path::new("/abs")), "/abs");

        token.clone().cancel();
        assert!(matches!(ctx.check_cancelled(), Err(ActionError::Cancelled)));

        let action = Action::from_command_line(&args(&["builtin-mkdir", "x"]))
            .unwrap()
            .unwrap();
        assert!(matches!(action.execute(&ctx), Err(ActionError::Cancelled)));
    }
}
