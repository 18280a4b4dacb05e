use std::collections::HashSet;
use std::fmt::Display;

use serde::Serialize;

use crate::core::ArcStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// A single message produced while planning or executing a build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    #[serde(serialize_with = "serialize_target")]
    pub target: Option<ArcStr>,
    pub message: String,
}

fn serialize_target<S: serde::Serializer>(
    target: &Option<ArcStr>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match target {
        Some(target) => serializer.serialize_some(&**target),
        None => serializer.serialize_none(),
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(target) = &self.target {
            write!(f, " (in target '{target}')")?;
        }
        Ok(())
    }
}

/// Ordered collection of diagnostics.
///
/// A message is recorded at most once per target: policy checks run per edge
/// and would otherwise repeat the same warning for every dependent.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
    seen: HashSet<(Option<ArcStr>, String)>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a diagnostic, returning `false` if it was already present.
    pub fn push(&mut self, diagnostic: Diagnostic) -> bool {
        let key = (diagnostic.target.clone(), diagnostic.message.clone());
        if !self.seen.insert(key) {
            return false;
        }
        self.items.push(diagnostic);
        true
    }

    pub fn warning(&mut self, target: Option<&ArcStr>, message: impl Into<String>) -> bool {
        self.push(Diagnostic {
            severity: Severity::Warning,
            target: target.cloned(),
            message: message.into(),
        })
    }

    pub fn note(&mut self, target: Option<&ArcStr>, message: impl Into<String>) -> bool {
        self.push(Diagnostic {
            severity: Severity::Note,
            target: target.cloned(),
            message: message.into(),
        })
    }

    pub fn extend(&mut self, other: Diagnostics) {
        for item in other.items {
            self.push(item);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items
            .iter()
            .filter(|item| item.severity == Severity::Warning)
    }

    /// Messages recorded for a target, in order.
    pub fn messages_for<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a str> {
        self.items
            .iter()
            .filter(move |item| item.target.as_deref() == Some(target))
            .map(|item| item.message.as_str())
    }

    pub fn contains(&self, message: &str) -> bool {
        self.items.iter().any(|item| item.message == message)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
