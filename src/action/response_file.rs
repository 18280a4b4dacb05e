use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How arguments are quoted and separated inside a linker response file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ResponseFileFormat {
    #[value(name = "unixShellQuotedSpaceSeparated")]
    #[serde(rename = "unixShellQuotedSpaceSeparated")]
    UnixShellQuotedSpaceSeparated,
    #[value(name = "unixShellQuotedNewlineSeparated")]
    #[serde(rename = "unixShellQuotedNewlineSeparated")]
    UnixShellQuotedNewlineSeparated,
    #[value(name = "windowsShellQuotedNewlineSeparated")]
    #[serde(rename = "windowsShellQuotedNewlineSeparated")]
    WindowsShellQuotedNewlineSeparated,
}

impl ResponseFileFormat {
    /// Renders `args` as the contents of a response file.
    pub fn render<S: AsRef<str>>(self, args: &[S]) -> String {
        let quoted = args.iter().map(|arg| match self {
            ResponseFileFormat::UnixShellQuotedSpaceSeparated
            | ResponseFileFormat::UnixShellQuotedNewlineSeparated => quote_unix(arg.as_ref()),
            ResponseFileFormat::WindowsShellQuotedNewlineSeparated => {
                quote_windows(arg.as_ref())
            }
        });

        match self {
            ResponseFileFormat::UnixShellQuotedSpaceSeparated => {
                quoted.collect::<Vec<_>>().join(" ")
            }
            _ => quoted.map(|arg| arg + "\n").collect(),
        }
    }
}

fn quote_unix(arg: &str) -> String {
    fn safe(c: char) -> bool {
        c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c)
    }

    if arg.is_empty() {
        return "''".into();
    }
    if arg.chars().all(safe) {
        return arg.into();
    }

    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Quotes an argument so `CommandLineToArgvW` reads it back unchanged.
fn quote_windows(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\u{b}', '"']) {
        return arg.into();
    }

    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');

    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat_n('\\', backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat_n('\\', backslashes * 2));

    out.push('"');
    out
}
