//! Deterministic task fingerprints.
//!
//! A fingerprint digests everything that makes a task what it is: the command
//! line, the environment, the working directory and the declared input and
//! output paths. Two tasks with equal fingerprints are the same unit of work,
//! which is what lets the planner reuse virtual completion nodes and what the
//! compilation cache keys on.
//!
//! Every field is length-prefixed and every section is tagged, so neither
//! token boundaries nor section boundaries can be confused with each other.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;

/// Digest identifying a task.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(Hash32);

impl Fingerprint {
    pub fn as_hash(&self) -> Hash32 {
        self.0
    }

    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.0.to_hex())
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy)]
#[repr(u8)]
enum Section {
    CommandLine = 1,
    Environment = 2,
    WorkingDirectory = 3,
    Inputs = 4,
    Outputs = 5,
}

/// Incremental fingerprint builder over a BLAKE3 hasher.
struct FingerprintHasher(blake3::Hasher);

impl FingerprintHasher {
    fn new() -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"kumitate-fingerprint-v1");
        Self(hasher)
    }

    fn section(&mut self, section: Section, count: usize) {
        self.0.update(&[section as u8]);
        self.0.update(&(count as u64).to_le_bytes());
    }

    fn field(&mut self, bytes: &[u8]) {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(self.0.finalize().into())
    }
}

/// Computes the fingerprint of a task from its identity-bearing fields.
///
/// The environment is an ordered map, so insertion order never influences the
/// result. Command-line tokens, inputs and outputs are hashed in the order
/// they are given.
pub fn fingerprint<S, I, O>(
    command_line: &[S],
    environment: &BTreeMap<String, String>,
    working_directory: &Utf8Path,
    inputs: I,
    outputs: O,
) -> Fingerprint
where
    S: AsRef<str>,
    I: IntoIterator,
    I::Item: AsRef<str>,
    O: IntoIterator,
    O::Item: AsRef<str>,
{
    let mut hasher = FingerprintHasher::new();

    hasher.section(Section::CommandLine, command_line.len());
    for token in command_line {
        hasher.field(token.as_ref().as_bytes());
    }

    hasher.section(Section::Environment, environment.len());
    for (key, value) in environment {
        hasher.field(key.as_bytes());
        hasher.field(value.as_bytes());
    }

    hasher.section(Section::WorkingDirectory, 1);
    hasher.field(working_directory.as_str().as_bytes());

    let inputs: Vec<_> = inputs.into_iter().collect();
    hasher.section(Section::Inputs, inputs.len());
    for input in &inputs {
        hasher.field(input.as_ref().as_bytes());
    }

    let outputs: Vec<_> = outputs.into_iter().collect();
    hasher.section(Section::Outputs, outputs.len());
    for output in &outputs {
        hasher.field(output.as_ref().as_bytes());
    }

    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample(command_line: &[&str], outputs: &[&str]) -> Fingerprint {
        fingerprint(
            command_line,
            &env(&[("PATH", "/usr/bin"), ("LANG", "C")]),
            Utf8Path::new("/work"),
            ["/work/in.c"],
            outputs.iter().copied(),
        )
    }

    #[test]
    fn test_deterministic() {
        let a = sample(&["cc", "-c", "in.c"], &["/work/in.o"]);
        let b = sample(&["cc", "-c", "in.c"], &["/work/in.o"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_output_change_changes_fingerprint() {
        let a = sample(&["cc", "-c", "in.c"], &["/work/in.o"]);
        let b = sample(&["cc", "-c", "in.c"], &["/work/other.o"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_boundaries_are_significant() {
        let a = sample(&["ab", "c"], &[]);
        let b = sample(&["a", "bc"], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_section_boundaries_are_significant() {
        let empty = BTreeMap::new();
        let as_input = fingerprint(&["x"], &empty, Utf8Path::new("/"), ["a"], [] as [&str; 0]);
        let as_output = fingerprint(&["x"], &empty, Utf8Path::new("/"), [] as [&str; 0], ["a"]);
        assert_ne!(as_input, as_output);
    }

    #[test]
    fn test_embedded_nul_is_not_a_separator() {
        let a = sample(&["a\0b"], &[]);
        let b = sample(&["a", "b"], &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_environment_order_is_irrelevant() {
        let mut first = BTreeMap::new();
        first.insert("B".to_string(), "2".to_string());
        first.insert("A".to_string(), "1".to_string());

        let second = env(&[("A", "1"), ("B", "2")]);

        let a = fingerprint(&["x"], &first, Utf8Path::new("/"), ["i"], ["o"]);
        let b = fingerprint(&["x"], &second, Utf8Path::new("/"), ["i"], ["o"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_input_order_is_significant() {
        let empty = BTreeMap::new();
        let a = fingerprint(&["x"], &empty, Utf8Path::new("/"), ["a", "b"], ["o"]);
        let b = fingerprint(&["x"], &empty, Utf8Path::new("/"), ["b", "a"], ["o"]);
        assert_ne!(a, b);
    }
}
