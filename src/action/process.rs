use std::process::Command;

use crate::action::{ActionContext, TaskAction};
use crate::error::ActionError;

/// An external program, run with exactly the task's environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessAction {
    args: Vec<String>,
}

impl ProcessAction {
    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }

    pub fn program(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl TaskAction for ProcessAction {
    fn identifier(&self) -> &'static str {
        "process"
    }

    fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let program = self.program();

        let output = Command::new(program)
            .args(self.args.iter().skip(1))
            .env_clear()
            .envs(ctx.environment())
            .current_dir(ctx.working_directory())
            .output()
            .map_err(|e| ActionError::Spawn(program.to_string(), e))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ActionError::ProcessFailed {
                program: program.to_string(),
                status: output.status,
                output: text,
            });
        }

        if !text.is_empty() {
            tracing::debug!("{program}:\n{text}");
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;

    use camino::Utf8Path;

    use super::*;
    use crate::action::CancellationToken;

    fn sh(script: &str) -> ProcessAction {
        ProcessAction::new(vec!["/bin/sh".into(), "-c".into(), script.into()])
    }

    #[test]
    fn test_environment_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let env = BTreeMap::from([("GREETING".to_string(), "hello".to_string())]);
        let token = CancellationToken::new();

        sh("printf '%s' \"$GREETING${HOME:-}\" > out.txt")
            .execute(&ActionContext::new(root, &env, &token))
            .unwrap();

        assert_eq!(std::fs::read_to_string(root.join("out.txt")).unwrap(), "hello");
    }

    #[test]
    fn test_failure_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let env = BTreeMap::new();
        let token = CancellationToken::new();

        let err = sh("echo broken >&2; exit 3")
            .execute(&ActionContext::new(root, &env, &token))
            .unwrap_err();

        match err {
            ActionError::ProcessFailed { status, output, .. } => {
                assert_eq!(status.code(), Some(3));
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_program() {
        let env = BTreeMap::new();
        let token = CancellationToken::new();

        let err = ProcessAction::new(vec!["/nonexistent/tool".into()])
            .execute(&ActionContext::new(Utf8Path::new("/"), &env, &token))
            .unwrap_err();
        assert!(matches!(err, ActionError::Spawn(..)));
    }
}
