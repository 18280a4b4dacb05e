//! Generation of the entry point of a test runner executable.
//!
//! Test classes are discovered through index stores: every object file linked
//! into the test product is looked up in each store, and the classes found are
//! compiled into a `__allDiscoveredTests()` table behind a `@main` runner.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::action::{ActionContext, TaskAction};
use crate::core::normalize_path;
use crate::error::ActionError;

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[command(name = "builtin-generate-test-entry-point")]
pub struct TestEntryPointOptions {
    /// Source file to write.
    #[arg(long)]
    pub output: Utf8PathBuf,

    /// Library implementing the index store format.
    #[arg(long)]
    pub index_store_library_path: Utf8PathBuf,

    /// Files listing the linked objects, one per line.
    #[arg(long)]
    pub linker_filelist: Vec<Utf8PathBuf>,

    #[arg(long)]
    pub index_store: Vec<Utf8PathBuf>,

    /// Prefixes under which objects are recorded in the index.
    #[arg(long)]
    pub index_unit_base_path: Vec<Utf8PathBuf>,

    #[arg(long)]
    pub enable_experimental_test_output: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMethod {
    pub name: String,
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseClass {
    pub module: String,
    pub name: String,
    #[serde(default)]
    pub methods: Vec<TestMethod>,
}

/// Source of test classes for a set of object files.
pub trait TestIndex {
    fn list_tests(&self, objects: &[Utf8PathBuf]) -> Result<Vec<TestCaseClass>, ActionError>;
}

#[derive(Debug, Deserialize)]
struct UnitRecord {
    object: Utf8PathBuf,
    #[serde(default)]
    tests: Vec<TestCaseClass>,
}

/// An index store laid out as JSON unit records under `<store>/units/`.
#[derive(Debug)]
pub struct JsonIndexStore {
    units: Vec<UnitRecord>,
}

impl JsonIndexStore {
    pub fn open(store: &Utf8Path, library: &Utf8Path) -> Result<Self, ActionError> {
        let fail = |path: &Utf8Path, message: String| ActionError::IndexStore {
            path: path.to_owned(),
            message,
        };

        if !library.exists() {
            return Err(fail(library, "index store library not found".into()));
        }

        let units_dir = store.join("units");
        let listing = fs::read_dir(&units_dir)
            .map_err(|e| fail(store, format!("couldn't open index store: {e}")))?;

        let mut paths = Vec::new();
        for item in listing {
            let item = item.map_err(|e| fail(store, e.to_string()))?;
            if let Ok(path) = Utf8PathBuf::from_path_buf(item.path())
                && path.extension() == Some("json")
            {
                paths.push(path);
            }
        }
        paths.sort();

        let units = paths
            .iter()
            .map(|path| {
                let text = fs::read_to_string(path).map_err(|e| fail(path, e.to_string()))?;
                serde_json::from_str::<UnitRecord>(&text).map_err(|e| fail(path, e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("opened index store '{store}' with {} units", units.len());
        Ok(Self { units })
    }
}

impl TestIndex for JsonIndexStore {
    fn list_tests(&self, objects: &[Utf8PathBuf]) -> Result<Vec<TestCaseClass>, ActionError> {
        let mut found = Vec::new();
        for object in objects {
            let object = normalize_path(object);
            for unit in &self.units {
                if normalize_path(&unit.object) == object {
                    found.extend(unit.tests.iter().cloned());
                }
            }
        }
        Ok(found)
    }
}

/// Re-roots `object` at `/` relative to `base`, if it lies under it.
pub fn remap_object(object: &Utf8Path, base: &Utf8Path) -> Option<Utf8PathBuf> {
    let relative = object.strip_prefix(base).ok()?;
    Some(Utf8Path::new("/").join(relative))
}

/// Objects named by the filelist contents, remapped against the first base
/// path each lies under.
pub fn filelist_objects(contents: &str, bases: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    contents
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(|line| {
            let object = Utf8Path::new(line);
            bases
                .iter()
                .find_map(|base| remap_object(object, base))
                .unwrap_or_else(|| object.to_owned())
        })
        .collect()
}

/// Merges classes sharing module and name, keeping first-seen order.
pub fn merge_classes(classes: Vec<TestCaseClass>) -> Vec<TestCaseClass> {
    let mut merged: Vec<TestCaseClass> = Vec::with_capacity(classes.len());

    for class in classes {
        match merged
            .iter_mut()
            .find(|seen| seen.module == class.module && seen.name == class.name)
        {
            Some(seen) => seen.methods.extend(class.methods),
            None => merged.push(class),
        }
    }

    merged
}

fn discovered_tests(classes: &[TestCaseClass]) -> String {
    let mut out = String::new();

    let modules: BTreeSet<&str> = classes.iter().map(|class| class.module.as_str()).collect();
    for module in modules {
        let _ = writeln!(out, "@testable import {module}");
    }

    out.push_str(
        "\n@available(*, deprecated, message: \"Not actually deprecated. Marked as deprecated to allow inclusion of deprecated tests (which test deprecated functionality) without warnings\")\n",
    );
    out.push_str("public func __allDiscoveredTests() -> [XCTestCaseEntry] {\n");
    out.push_str("    return [\n");

    for class in classes {
        let methods: Vec<String> = class
            .methods
            .iter()
            .map(|method| {
                let base = method.name.strip_suffix("()").unwrap_or(&method.name);
                if method.is_async {
                    format!("            (\"{base}\", asyncTest({}.{base}))", class.name)
                } else {
                    format!("            (\"{base}\", {}.{base})", class.name)
                }
            })
            .collect();
        let _ = writeln!(out, "        testCase([{}]),", methods.join(",\n"));
    }

    out.push_str("    ]\n}\n");
    out
}

/// XCTest observer writing test events as JSON lines.
const TEST_OBSERVER: &str = include_str!("./test_observer.swift");

/// Body of the runner for the XCTest library.
fn xctest_launch(experimental_output: bool) -> String {
    let mut out = String::new();
    if experimental_output {
        out.push_str(
            "            #if !os(Windows)\n            \
             _ = Self.testOutputPath().map { SwiftPMXCTestObserver(testOutputPath: $0) }\n            \
             #endif\n",
        );
    }
    out.push_str(
        "            #if os(WASI)\n            \
         await XCTMain(__allDiscoveredTests()) as Never\n            \
         #else\n            \
         XCTMain(__allDiscoveredTests()) as Never\n            \
         #endif\n",
    );
    out
}

/// Renders the complete entry point source.
///
/// With `experimental_output` the runner also registers an observer that
/// records test events to the path given by `--testing-output-path`.
pub fn render_entry_point(classes: &[TestCaseClass], experimental_output: bool) -> String {
    let mut out = String::new();

    out.push_str("#if canImport(Testing)\nimport Testing\n#endif\n\n");
    if experimental_output {
        out.push_str(TEST_OBSERVER);
        out.push('\n');
    }
    out.push_str("import XCTest\n");
    out.push_str(&discovered_tests(classes));

    let launch = xctest_launch(experimental_output);
    let _ = write!(
        out,
        r#"
@main
@available(*, deprecated, message: "Not actually deprecated. Marked as deprecated to allow inclusion of deprecated tests (which test deprecated functionality) without warnings")
struct Runner {{
    private static func testingLibrary() -> String {{
        var iterator = CommandLine.arguments.makeIterator()
        while let argument = iterator.next() {{
            if argument == "--testing-library", let libraryName = iterator.next() {{
                return libraryName.lowercased()
            }}
        }}
        return "xctest"
    }}

    private static func testOutputPath() -> String? {{
        var iterator = CommandLine.arguments.makeIterator()
        while let argument = iterator.next() {{
            if argument == "--testing-output-path", let outputPath = iterator.next() {{
                return outputPath
            }}
        }}
        return nil
    }}

    #if os(Linux)
    @_silgen_name("$ss13_runAsyncMainyyyyYaKcF")
    private static func _runAsyncMain(_ asyncFun: @Sendable @escaping () async throws -> ())

    static func main() {{
        let testingLibrary = Self.testingLibrary()
        #if canImport(Testing)
        if testingLibrary == "swift-testing" {{
            _runAsyncMain {{
                await Testing.__swiftPMEntryPoint() as Never
            }}
        }}
        #endif
        if testingLibrary == "xctest" {{
{launch}        }}
    }}
    #else
    static func main() async {{
        let testingLibrary = Self.testingLibrary()
        #if canImport(Testing)
        if testingLibrary == "swift-testing" {{
            await Testing.__swiftPMEntryPoint() as Never
        }}
        #endif
        if testingLibrary == "xctest" {{
{launch}        }}
    }}
    #endif
}}
"#
    );

    out
}

impl TestEntryPointOptions {
    /// Reads the filelists and returns the objects to look tests up for.
    pub fn objects(&self, ctx: &ActionContext) -> Result<Vec<Utf8PathBuf>, ActionError> {
        let mut objects = Vec::new();
        for filelist in &self.linker_filelist {
            ctx.check_cancelled()?;
            let path = ctx.resolve(filelist);
            let contents = fs::read_to_string(&path)
                .map_err(|e| ActionError::Context(format!("couldn't read '{path}'"), e))?;
            objects.extend(filelist_objects(&contents, &self.index_unit_base_path));
        }
        Ok(objects)
    }

    /// Generates the entry point using the given indexes.
    pub fn generate(
        &self,
        ctx: &ActionContext,
        indexes: &[&dyn TestIndex],
    ) -> Result<(), ActionError> {
        let objects = self.objects(ctx)?;

        let mut classes = Vec::new();
        for index in indexes {
            ctx.check_cancelled()?;
            classes.extend(index.list_tests(&objects)?);
        }
        let classes = merge_classes(classes);

        let output = ctx.resolve(&self.output);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ActionError::Context(format!("couldn't create '{parent}'"), e))?;
        }
        fs::write(
            &output,
            render_entry_point(&classes, self.enable_experimental_test_output),
        )
        .map_err(|e| ActionError::Context(format!("couldn't write '{output}'"), e))?;

        tracing::debug!(
            "generated '{output}' with {} test classes from {} objects",
            classes.len(),
            objects.len()
        );
        Ok(())
    }
}

impl TaskAction for TestEntryPointOptions {
    fn identifier(&self) -> &'static str {
        "generate-test-entry-point"
    }

    fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let library = ctx.resolve(&self.index_store_library_path);
        let stores = self
            .index_store
            .iter()
            .map(|store| JsonIndexStore::open(&ctx.resolve(store), &library))
            .collect::<Result<Vec<_>, _>>()?;

        let indexes: Vec<&dyn TestIndex> = stores.iter().map(|s| s as &dyn TestIndex).collect();
        self.generate(ctx, &indexes)
    }
}
