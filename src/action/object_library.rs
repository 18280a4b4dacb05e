use std::collections::HashMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::action::{ActionContext, ResponseFileFormat, TaskAction};
use crate::core::posix_string;
use crate::error::ActionError;

/// Name of the response file written next to the collected objects.
pub const RESPONSE_FILE: &str = "args.resp";

/// Collects object files into one flat directory and writes a response file
/// listing them.
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[command(name = "builtin-assemble-object-library")]
pub struct ObjectLibraryOptions {
    /// Object files, in link order.
    pub inputs: Vec<Utf8PathBuf>,

    /// Directory to assemble the library in. Its previous contents are
    /// removed.
    #[arg(long)]
    pub output: Utf8PathBuf,

    #[arg(long, value_enum)]
    pub linker_response_file_format: ResponseFileFormat,
}

/// Destination file names for `inputs`, in input order.
///
/// The first input with a given basename keeps it; the n-th repeat is renamed
/// to `<stem>-<n>.<ext>`.
pub fn destination_names(inputs: &[Utf8PathBuf]) -> io::Result<Vec<String>> {
    let mut seen: HashMap<&str, usize> = HashMap::new();

    inputs
        .iter()
        .map(|input| {
            let name = input.file_name().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{input}' does not name a file"),
                )
            })?;

            let count = seen.entry(name).or_insert(0);
            let destination = match *count {
                0 => name.to_string(),
                n => {
                    let path = Utf8Path::new(name);
                    let stem = path.file_stem().unwrap_or(name);
                    match path.extension() {
                        Some(ext) => format!("{stem}-{n}.{ext}"),
                        None => format!("{stem}-{n}"),
                    }
                }
            };
            *count += 1;

            Ok(destination)
        })
        .collect()
}

impl ObjectLibraryOptions {
    /// Assembles the library, returning the paths written to the response
    /// file.
    pub fn assemble(&self, ctx: &ActionContext) -> Result<Vec<Utf8PathBuf>, ActionError> {
        let output = ctx.resolve(&self.output);

        match fs::remove_dir_all(&output) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ActionError::Context(
                    format!("couldn't clear '{output}'"),
                    err,
                ));
            }
        }
        fs::create_dir_all(&output)
            .map_err(|e| ActionError::Context(format!("couldn't create '{output}'"), e))?;

        let names = destination_names(&self.inputs)
            .map_err(|e| ActionError::Context("invalid input".into(), e))?;

        let mut written = Vec::with_capacity(names.len());
        for (input, name) in self.inputs.iter().zip(names) {
            ctx.check_cancelled()?;

            let source = ctx.resolve(input);
            let destination = output.join(name);
            fs::copy(&source, &destination).map_err(|e| {
                ActionError::Context(format!("couldn't copy '{source}' to '{destination}'"), e)
            })?;
            written.push(destination);
        }

        let args: Vec<String> = written.iter().map(|path| posix_string(path)).collect();
        let response = output.join(RESPONSE_FILE);
        fs::write(&response, self.linker_response_file_format.render(&args))
            .map_err(|e| ActionError::Context(format!("couldn't write '{response}'"), e))?;

        tracing::debug!("assembled {} objects into '{output}'", written.len());
        Ok(written)
    }
}

impl TaskAction for ObjectLibraryOptions {
    fn identifier(&self) -> &'static str {
        "assemble-object-library"
    }

    fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        self.assemble(ctx).map(|_| ())
    }
}
