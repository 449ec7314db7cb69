// Copyright (c) The mettle Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test catalog: trees of discovered tests and selection resolution.
//!
//! A catalog turns a path to an executable test module into a [`TestTree`]
//! and resolves a [`Selection`] of full names against it. The engine treats
//! catalogs as opaque — it consumes trees and plans, it never inspects how
//! they were produced. The shipped implementation is [`LibtestCatalog`],
//! which understands the libtest command-line convention.

use crate::errors::{LoadError, ResolveError};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use std::collections::HashSet;
use std::process::{Command, Stdio};
use tracing::debug;

/// The kind of a node in a [`TestTree`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TestKind {
    /// The root grouping node for a loaded test module.
    Suite,
    /// An intermediate grouping node (a `::` path segment).
    Fixture,
    /// A directly executable leaf test.
    Case,
}

/// The command that executes one test case in its own process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CaseCommand {
    program: Utf8PathBuf,
    args: Vec<String>,
}

impl CaseCommand {
    /// Creates a new case command from a program and its arguments.
    pub fn new(
        program: impl Into<Utf8PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The program to execute.
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// The arguments passed to the program.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// A node in a test tree.
///
/// Trees are immutable once built: nodes expose read-only accessors and are
/// only constructed through [`TestTreeBuilder`]. Children preserve
/// declaration order.
#[derive(Clone, Debug)]
pub struct Test {
    name: String,
    full_name: String,
    kind: TestKind,
    command: Option<CaseCommand>,
    children: Vec<Test>,
}

impl Test {
    fn suite(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            full_name: name.to_owned(),
            kind: TestKind::Suite,
            command: None,
            children: Vec::new(),
        }
    }

    fn fixture(name: &str, full_name: String) -> Self {
        Self {
            name: name.to_owned(),
            full_name,
            kind: TestKind::Fixture,
            command: None,
            children: Vec::new(),
        }
    }

    fn case(name: &str, full_name: String, command: CaseCommand) -> Self {
        Self {
            name: name.to_owned(),
            full_name,
            kind: TestKind::Case,
            command: Some(command),
            children: Vec::new(),
        }
    }

    /// The last segment of this node's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unique `::`-separated full name of this node.
    ///
    /// For the root suite this is the module name itself.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// The node kind.
    pub fn kind(&self) -> TestKind {
        self.kind
    }

    /// The node's children, in declaration order. Empty for a case.
    pub fn children(&self) -> &[Test] {
        &self.children
    }

    /// The command executing this node, if it is a case.
    pub fn command(&self) -> Option<&CaseCommand> {
        self.command.as_ref()
    }

    /// The number of cases in this subtree.
    pub fn case_count(&self) -> usize {
        match self.kind {
            TestKind::Case => 1,
            TestKind::Suite | TestKind::Fixture => {
                self.children.iter().map(Test::case_count).sum()
            }
        }
    }
}

/// An immutable tree of discovered tests, rooted at a single suite.
#[derive(Clone, Debug)]
pub struct TestTree {
    path: Utf8PathBuf,
    root: Test,
}

impl TestTree {
    /// Starts building a tree for the module at `path`.
    ///
    /// The root suite is named after the path's file stem.
    pub fn builder(path: impl Into<Utf8PathBuf>) -> TestTreeBuilder {
        let path = path.into();
        let root_name = path.file_stem().unwrap_or("tests").to_owned();
        TestTreeBuilder {
            root: Test::suite(&root_name),
            path,
        }
    }

    /// The path this tree was loaded from.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The root suite.
    pub fn root(&self) -> &Test {
        &self.root
    }

    /// The total number of cases in the tree.
    pub fn case_count(&self) -> usize {
        self.root.case_count()
    }
}

/// Builder for a [`TestTree`]. Used by catalogs, and by embedders that run
/// their own discovery.
#[derive(Clone, Debug)]
pub struct TestTreeBuilder {
    path: Utf8PathBuf,
    root: Test,
}

impl TestTreeBuilder {
    /// Adds one case by full name, creating intermediate fixtures as needed.
    ///
    /// Duplicate names keep the first declaration; a name that would nest
    /// under an existing case is skipped. Both are logged rather than
    /// aborting the build, so one malformed listing entry can't invalidate
    /// an otherwise usable tree.
    pub fn add_case(&mut self, full_name: &str, command: CaseCommand) -> &mut Self {
        if full_name.is_empty() {
            debug!("skipping test with an empty name");
            return self;
        }
        let segments: Vec<&str> = full_name.split("::").collect();
        insert_case(&mut self.root, "", &segments, full_name, command);
        self
    }

    /// Finishes the build.
    pub fn build(self) -> TestTree {
        TestTree {
            path: self.path,
            root: self.root,
        }
    }
}

fn insert_case(node: &mut Test, prefix: &str, segments: &[&str], full_name: &str, command: CaseCommand) {
    let (first, rest) = segments.split_first().expect("segments are non-empty");

    if rest.is_empty() {
        if node.children.iter().any(|child| child.name == *first) {
            debug!(full_name, "duplicate test name in listing, keeping the first");
            return;
        }
        node.children
            .push(Test::case(first, full_name.to_owned(), command));
        return;
    }

    let fixture_full_name = if prefix.is_empty() {
        (*first).to_owned()
    } else {
        format!("{prefix}::{first}")
    };
    let pos = match node.children.iter().position(|child| child.name == *first) {
        Some(pos) => {
            if node.children[pos].kind == TestKind::Case {
                debug!(full_name, "name nests under an existing case, skipping");
                return;
            }
            pos
        }
        None => {
            node.children
                .push(Test::fixture(first, fixture_full_name.clone()));
            node.children.len() - 1
        }
    };
    insert_case(
        &mut node.children[pos],
        &fixture_full_name,
        rest,
        full_name,
        command,
    );
}

/// An ordered set of full names identifying which tree nodes a run should
/// execute.
///
/// Insertion order is preserved and duplicates collapse. An empty selection
/// selects the entire tree.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    names: IndexSet<String>,
}

impl Selection {
    /// The empty selection, which selects every test in the tree.
    pub fn all() -> Self {
        Self::default()
    }

    /// True if no names have been added.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// The number of distinct names in the selection.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True if `name` is part of the selection.
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Adds a name; returns false if it was already present.
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        self.names.insert(name.into())
    }

    /// Iterates over the names in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.names.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Selection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// The resolved, executable portion of a tree: the maximal selected nodes in
/// declaration order, each carrying its full pruned subtree.
///
/// Selecting a case yields just that case; selecting a suite or fixture
/// yields the node itself, so its bracketing events are emitted around its
/// descendants. A name selected inside an already-selected node is covered
/// by the outer node and doesn't appear twice.
#[derive(Clone, Debug)]
pub struct TestPlan {
    roots: Vec<Test>,
    case_count: usize,
}

impl TestPlan {
    /// The selected nodes, in declaration order.
    pub fn roots(&self) -> &[Test] {
        &self.roots
    }

    /// The total number of cases the plan will execute.
    pub fn case_count(&self) -> usize {
        self.case_count
    }
}

/// Resolves a selection against a tree.
///
/// This is the default implementation of [`TestCatalog::resolve`].
pub fn resolve_selection(tree: &TestTree, selection: &Selection) -> Result<TestPlan, ResolveError> {
    if selection.is_empty() {
        let root = tree.root().clone();
        let case_count = root.case_count();
        return Ok(TestPlan {
            roots: vec![root],
            case_count,
        });
    }

    let mut matched = HashSet::new();
    let mut roots = Vec::new();
    collect_roots(tree.root(), selection, &mut matched, &mut roots);

    let missing: Vec<String> = selection
        .iter()
        .filter(|name| !matched.contains(*name))
        .map(str::to_owned)
        .collect();
    if !missing.is_empty() {
        return Err(ResolveError::new(missing));
    }

    let case_count = roots.iter().map(Test::case_count).sum();
    Ok(TestPlan { roots, case_count })
}

fn collect_roots(
    node: &Test,
    selection: &Selection,
    matched: &mut HashSet<String>,
    roots: &mut Vec<Test>,
) {
    if selection.contains(node.full_name()) {
        matched.insert(node.full_name().to_owned());
        // Names selected inside this node are covered by it.
        mark_covered(node, selection, matched);
        roots.push(node.clone());
        return;
    }
    for child in node.children() {
        collect_roots(child, selection, matched, roots);
    }
}

fn mark_covered(node: &Test, selection: &Selection, matched: &mut HashSet<String>) {
    for child in node.children() {
        if selection.contains(child.full_name()) {
            matched.insert(child.full_name().to_owned());
        }
        mark_covered(child, selection, matched);
    }
}

/// A source of test trees.
///
/// `load` turns a path into a tree; `resolve` turns a tree plus a selection
/// into an executable plan. The engine consumes this as a trait object and
/// never looks behind it.
pub trait TestCatalog {
    /// Loads the test module at `path` into a tree.
    fn load(&self, path: &Utf8Path) -> Result<TestTree, LoadError>;

    /// Resolves `selection` against `tree`.
    fn resolve(&self, tree: &TestTree, selection: &Selection) -> Result<TestPlan, ResolveError> {
        resolve_selection(tree, selection)
    }
}

/// A catalog for executable test binaries following the libtest convention.
///
/// `binary --list --format terse` is expected to print one test per line as
/// `<name>: test`; each case then runs as `binary <name> --exact
/// --nocapture` in its own process.
#[derive(Copy, Clone, Debug, Default)]
pub struct LibtestCatalog;

impl TestCatalog for LibtestCatalog {
    fn load(&self, path: &Utf8Path) -> Result<TestTree, LoadError> {
        let output = Command::new(path)
            .args(["--list", "--format", "terse"])
            .stdin(Stdio::null())
            .output()
            .map_err(|error| LoadError::Spawn {
                path: path.to_owned(),
                error,
            })?;
        if !output.status.success() {
            return Err(LoadError::ListCommand {
                path: path.to_owned(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let listing = String::from_utf8(output.stdout).map_err(|error| LoadError::InvalidUtf8 {
            path: path.to_owned(),
            error,
        })?;
        parse_list_output(path, &listing)
    }
}

/// Parses libtest `--list --format terse` output into a tree.
pub fn parse_list_output(path: &Utf8Path, listing: &str) -> Result<TestTree, LoadError> {
    let mut builder = TestTree::builder(path);
    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_suffix(": test") {
            builder.add_case(
                name,
                CaseCommand::new(path, [name, "--exact", "--nocapture"]),
            );
        } else if line.ends_with(": benchmark") {
            debug!(line, "skipping benchmark in listing");
        } else {
            return Err(LoadError::UnrecognizedListLine {
                path: path.to_owned(),
                line: line.to_owned(),
            });
        }
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_tree() -> TestTree {
        let mut builder = TestTree::builder("target/debug/sample");
        for name in ["alpha::one", "alpha::two", "beta::deep::three", "four"] {
            builder.add_case(name, CaseCommand::new("/bin/true", [name]));
        }
        builder.build()
    }

    fn leaf_names(node: &Test, out: &mut Vec<String>) {
        if node.kind() == TestKind::Case {
            out.push(node.full_name().to_owned());
        }
        for child in node.children() {
            leaf_names(child, out);
        }
    }

    fn plan_leaves(plan: &TestPlan) -> Vec<String> {
        let mut out = Vec::new();
        for root in plan.roots() {
            leaf_names(root, &mut out);
        }
        out
    }

    #[test]
    fn builder_preserves_declaration_order() {
        let tree = sample_tree();
        assert_eq!(tree.root().name(), "sample");
        assert_eq!(tree.root().kind(), TestKind::Suite);
        assert_eq!(tree.case_count(), 4);

        let mut leaves = Vec::new();
        leaf_names(tree.root(), &mut leaves);
        assert_eq!(leaves, ["alpha::one", "alpha::two", "beta::deep::three", "four"]);

        let alpha = &tree.root().children()[0];
        assert_eq!(alpha.kind(), TestKind::Fixture);
        assert_eq!(alpha.full_name(), "alpha");
        assert_eq!(alpha.children().len(), 2);
    }

    #[test]
    fn builder_skips_duplicates_and_conflicts() {
        let mut builder = TestTree::builder("t");
        builder.add_case("a", CaseCommand::new("/bin/true", ["first"]));
        builder.add_case("a", CaseCommand::new("/bin/true", ["second"]));
        // "a" is a case, so nothing can nest under it.
        builder.add_case("a::b", CaseCommand::new("/bin/true", ["third"]));
        let tree = builder.build();

        assert_eq!(tree.case_count(), 1);
        let case = &tree.root().children()[0];
        assert_eq!(case.command().unwrap().args(), ["first"]);
        assert!(case.children().is_empty());
    }

    #[test]
    fn empty_selection_selects_whole_tree() {
        let tree = sample_tree();
        let plan = resolve_selection(&tree, &Selection::all()).unwrap();
        assert_eq!(plan.roots().len(), 1);
        assert_eq!(plan.roots()[0].kind(), TestKind::Suite);
        assert_eq!(plan.case_count(), 4);
    }

    #[test]
    fn selecting_a_case_yields_just_that_case() {
        let tree = sample_tree();
        let selection: Selection = ["alpha::two"].into_iter().collect();
        let plan = resolve_selection(&tree, &selection).unwrap();
        assert_eq!(plan.case_count(), 1);
        assert_eq!(plan.roots().len(), 1);
        assert_eq!(plan.roots()[0].kind(), TestKind::Case);
        assert_eq!(plan.roots()[0].full_name(), "alpha::two");
    }

    #[test]
    fn selecting_a_fixture_yields_its_subtree() {
        let tree = sample_tree();
        let selection: Selection = ["alpha"].into_iter().collect();
        let plan = resolve_selection(&tree, &selection).unwrap();
        assert_eq!(plan.case_count(), 2);
        assert_eq!(plan.roots()[0].kind(), TestKind::Fixture);
        assert_eq!(plan_leaves(&plan), ["alpha::one", "alpha::two"]);
    }

    #[test]
    fn overlapping_selection_does_not_duplicate() {
        let tree = sample_tree();
        let selection: Selection = ["alpha", "alpha::one"].into_iter().collect();
        let plan = resolve_selection(&tree, &selection).unwrap();
        assert_eq!(plan.case_count(), 2);
        assert_eq!(plan.roots().len(), 1);
    }

    #[test]
    fn selection_order_does_not_reorder_declaration_order() {
        let tree = sample_tree();
        let selection: Selection = ["four", "alpha::one"].into_iter().collect();
        let plan = resolve_selection(&tree, &selection).unwrap();
        assert_eq!(plan_leaves(&plan), ["alpha::one", "four"]);
    }

    #[test]
    fn unknown_names_fail_resolution() {
        let tree = sample_tree();
        let selection: Selection = ["alpha", "nope", "also::missing"].into_iter().collect();
        let error = resolve_selection(&tree, &selection).unwrap_err();
        assert_eq!(error.names(), ["nope", "also::missing"]);
    }

    #[test]
    fn parse_list_output_preserves_listing_order() {
        let path = Utf8Path::new("target/debug/fixture");
        let listing = "alpha::one: test\nalpha::two: test\nbeta: test\n\nslow::bench: benchmark\n";
        let tree = parse_list_output(path, listing).unwrap();

        let mut leaves = Vec::new();
        leaf_names(tree.root(), &mut leaves);
        assert_eq!(leaves, ["alpha::one", "alpha::two", "beta"]);

        let alpha_one = &tree.root().children()[0].children()[0];
        let command = alpha_one.command().unwrap();
        assert_eq!(command.program(), path);
        assert_eq!(command.args(), ["alpha::one", "--exact", "--nocapture"]);
    }

    #[test]
    fn parse_list_output_rejects_unknown_lines() {
        let path = Utf8Path::new("target/debug/fixture");
        let error = parse_list_output(path, "what is this\n").unwrap_err();
        assert!(matches!(error, LoadError::UnrecognizedListLine { line, .. } if line == "what is this"));
    }
}
