use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::action::{ActionContext, TaskAction};
use crate::error::ActionError;

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[command(name = "builtin-mkdir")]
pub struct MkdirOptions {
    /// Directories to create, with their parents.
    #[arg(required = true)]
    pub paths: Vec<Utf8PathBuf>,
}

impl TaskAction for MkdirOptions {
    fn identifier(&self) -> &'static str {
        "mkdir"
    }

    fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        for path in &self.paths {
            let path = ctx.resolve(path);
            fs::create_dir_all(&path)
                .map_err(|e| ActionError::Context(format!("couldn't create '{path}'"), e))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[command(name = "builtin-copy")]
pub struct CopyOptions {
    pub from: Utf8PathBuf,
    pub to: Utf8PathBuf,
}

fn copy_tree(ctx: &ActionContext, from: &Utf8Path, to: &Utf8Path) -> Result<(), ActionError> {
    ctx.check_cancelled()?;

    let meta =
        fs::metadata(from).map_err(|e| ActionError::Context(format!("couldn't read '{from}'"), e))?;

    if !meta.is_dir() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ActionError::Context(format!("couldn't create '{parent}'"), e))?;
        }
        fs::copy(from, to)
            .map_err(|e| ActionError::Context(format!("couldn't copy '{from}' to '{to}'"), e))?;
        return Ok(());
    }

    fs::create_dir_all(to).map_err(|e| ActionError::Context(format!("couldn't create '{to}'"), e))?;
    for entry in from
        .read_dir_utf8()
        .map_err(|e| ActionError::Context(format!("couldn't list '{from}'"), e))?
    {
        let entry = entry?;
        copy_tree(ctx, entry.path(), &to.join(entry.file_name()))?;
    }

    Ok(())
}

impl TaskAction for CopyOptions {
    fn identifier(&self) -> &'static str {
        "copy"
    }

    fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        copy_tree(ctx, &ctx.resolve(&self.from), &ctx.resolve(&self.to))
    }
}
