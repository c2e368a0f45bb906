#![forbid(unsafe_code)]

use proptest::prelude::*;
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uow_core::{IsolationLevel, RepositoryCacheMode};
use uow_storage::{
    ScopeContext, ScopeError, ScopeOptions, ScopeOutcome, ScopeProvider, Settings,
};

fn open(test_name: &str) -> (TempDir, PathBuf, ScopeProvider) {
    let dir = tempfile::Builder::new()
        .prefix(&format!("uow_{test_name}_"))
        .tempdir()
        .expect("create temp dir");
    let path = dir.path().join("scopes.db");
    let provider = ScopeProvider::open(Settings::for_database(&path)).expect("open provider");
    Connection::open(&path)
        .expect("open raw connection")
        .execute_batch("CREATE TABLE work(n INTEGER NOT NULL);")
        .expect("create work table");
    (dir, path, provider)
}

fn count_work(path: &Path) -> i64 {
    Connection::open(path)
        .expect("open raw connection")
        .query_row("SELECT COUNT(1) FROM work", [], |row| row.get(0))
        .expect("count work rows")
}

fn record(scope: &uow_storage::Scope, n: i64) {
    scope
        .with_database(|conn| conn.execute("INSERT INTO work(n) VALUES (?1)", params![n]))
        .expect("insert work row");
}

#[derive(Clone, Debug)]
struct Node {
    complete: Option<bool>,
    children: Vec<Node>,
}

impl Node {
    fn size(&self) -> i64 {
        1 + self.children.iter().map(Node::size).sum::<i64>()
    }

    fn all_completed(&self) -> bool {
        self.complete == Some(true) && self.children.iter().all(Node::all_completed)
    }
}

/// Builds `node` as a scope subtree: create, write a row, run the children
/// one after another, complete as instructed, dispose.
fn run_tree(ctx: &ScopeContext, node: &Node, counter: &mut i64) -> ScopeOutcome {
    let scope = ctx.create_scope(ScopeOptions::default()).expect("create scope");
    *counter += 1;
    record(&scope, *counter);
    for child in &node.children {
        let outcome = run_tree(ctx, child, counter);
        assert_eq!(outcome, ScopeOutcome::Deferred);
    }
    if let Some(success) = node.complete {
        scope.complete_with(success).expect("complete");
    }
    scope.dispose().expect("dispose")
}

fn chain(flags: &[Option<bool>]) -> Node {
    let (first, rest) = flags.split_first().expect("non-empty chain");
    Node {
        complete: *first,
        children: if rest.is_empty() { Vec::new() } else { vec![chain(rest)] },
    }
}

#[test]
fn chains_of_depth_one_to_four_commit_only_when_every_scope_completed() {
    let (_dir, path, provider) = open("chains");
    let ctx = provider.context();
    let states = [None, Some(false), Some(true)];

    for depth in 1..=4u32 {
        for combo in 0..states.len().pow(depth) {
            let mut rest = combo;
            let flags = (0..depth)
                .map(|_| {
                    let state = states[rest % states.len()];
                    rest /= states.len();
                    state
                })
                .collect::<Vec<_>>();
            let tree = chain(&flags);

            let before = count_work(&path);
            let outcome = run_tree(&ctx, &tree, &mut 0);
            let after = count_work(&path);

            if tree.all_completed() {
                assert_eq!(outcome, ScopeOutcome::Committed, "{flags:?}");
                assert_eq!(after - before, tree.size(), "{flags:?}");
            } else {
                assert_eq!(outcome, ScopeOutcome::RolledBack, "{flags:?}");
                assert_eq!(after, before, "{flags:?}");
            }
            assert_eq!(ctx.depth(), 0);
        }
    }
}

#[test]
fn one_failed_sibling_rolls_back_the_whole_tree() {
    let (_dir, path, provider) = open("sibling");
    let ctx = provider.context();
    let done = |children| Node {
        complete: Some(true),
        children,
    };
    let tree = done(vec![
        done(Vec::new()),
        Node {
            complete: None,
            children: Vec::new(),
        },
        done(vec![done(Vec::new())]),
    ]);

    assert_eq!(run_tree(&ctx, &tree, &mut 0), ScopeOutcome::RolledBack);
    assert_eq!(count_work(&path), 0);
}

fn node_strategy() -> impl Strategy<Value = Node> {
    let leaf = proptest::option::of(any::<bool>()).prop_map(|complete| Node {
        complete,
        children: Vec::new(),
    });
    leaf.prop_recursive(3, 16, 3, |inner| {
        (
            proptest::option::of(any::<bool>()),
            proptest::collection::vec(inner, 0..3),
        )
            .prop_map(|(complete, children)| Node { complete, children })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn completion_is_conjunctive_across_any_tree(tree in node_strategy()) {
        let (_dir, path, provider) = open("prop");
        let ctx = provider.context();

        let outcome = run_tree(&ctx, &tree, &mut 0);
        let rows = count_work(&path);

        if tree.all_completed() {
            prop_assert_eq!(outcome, ScopeOutcome::Committed);
            prop_assert_eq!(rows, tree.size());
        } else {
            prop_assert_eq!(outcome, ScopeOutcome::RolledBack);
            prop_assert_eq!(rows, 0);
        }
        prop_assert_eq!(ctx.depth(), 0);
    }
}

#[test]
fn auto_complete_scopes_count_as_completed() {
    let (_dir, path, provider) = open("auto");
    let ctx = provider.context();

    let root = ctx.create_scope(ScopeOptions::default()).expect("root");
    let reader = ctx.create_scope(ScopeOptions::auto_complete()).expect("reader");
    record(&reader, 1);
    assert_eq!(reader.dispose().expect("dispose reader"), ScopeOutcome::Deferred);
    root.complete().expect("complete root");
    assert_eq!(root.dispose().expect("dispose root"), ScopeOutcome::Committed);
    assert_eq!(count_work(&path), 1);
}

#[test]
fn conflicting_completion_is_rejected_and_repeats_are_harmless() {
    let (_dir, _path, provider) = open("double");
    let ctx = provider.context();
    let scope = ctx.create_scope(ScopeOptions::default()).expect("scope");

    scope.complete().expect("first");
    scope.complete().expect("same value again");
    let err = scope.complete_with(false).expect_err("contradiction");
    assert!(matches!(
        err,
        ScopeError::DoubleCompletion {
            first: true,
            second: false,
            ..
        }
    ));
    assert!(err.is_programming_error());
    assert_eq!(scope.completed(), Some(true));
    assert_eq!(scope.dispose().expect("dispose"), ScopeOutcome::Committed);
    assert_eq!(scope.dispose().expect("again"), ScopeOutcome::AlreadyDisposed);
}

#[test]
fn disposing_out_of_order_fails_and_leaves_the_stack_alone() {
    let (_dir, path, provider) = open("order");
    let ctx = provider.context();

    let a = ctx.create_scope(ScopeOptions::default()).expect("a");
    let b = ctx.create_scope(ScopeOptions::default()).expect("b");
    assert_eq!(b.parent_id(), Some(a.id()));
    assert_eq!(ctx.stack_ids(), vec![a.id(), b.id()]);

    let err = a.dispose().expect_err("a is not on top");
    assert_eq!(err.code(), "SCOPE_NESTING");
    assert_eq!(ctx.stack_ids(), vec![a.id(), b.id()]);
    assert!(!a.is_disposed());

    record(&b, 1);
    b.complete().expect("complete b");
    assert_eq!(b.dispose().expect("dispose b"), ScopeOutcome::Deferred);
    a.complete().expect("complete a");
    assert_eq!(a.dispose().expect("dispose a"), ScopeOutcome::Committed);
    assert_eq!(ctx.depth(), 0);
    assert_eq!(count_work(&path), 1);
}

#[test]
fn a_scope_dropped_out_of_order_rolls_back_once_it_surfaces() {
    let (_dir, path, provider) = open("abandon");
    let ctx = provider.context();

    let a = ctx.create_scope(ScopeOptions::default()).expect("a");
    let b = ctx.create_scope(ScopeOptions::default()).expect("b");
    record(&b, 1);
    a.complete().expect("complete a");
    drop(a);
    assert_eq!(ctx.depth(), 2);

    b.complete().expect("complete b");
    assert_eq!(b.dispose().expect("dispose b"), ScopeOutcome::Deferred);
    assert_eq!(ctx.depth(), 0);
    assert_eq!(count_work(&path), 0);
}

#[test]
fn disposed_scopes_refuse_further_work() {
    let (_dir, _path, provider) = open("disposed");
    let ctx = provider.context();
    let scope = ctx.create_scope(ScopeOptions::auto_complete()).expect("scope");
    scope.dispose().expect("dispose");

    let err = scope
        .with_database(|conn| conn.execute("DELETE FROM work", []))
        .expect_err("disposed");
    assert_eq!(err.code(), "SCOPE_NESTING");
    assert_eq!(
        scope.read_lock(&[uow_core::LockId::SERVERS]).expect_err("disposed").code(),
        "SCOPE_NESTING"
    );
}

#[test]
fn detached_scope_lifecycle_restores_the_original_stack() {
    let (_dir, path, provider) = open("detached");
    let ctx = provider.context();

    let outer = ctx.create_scope(ScopeOptions::default()).expect("outer");
    let detached = ctx
        .create_detached_scope(ScopeOptions::default())
        .expect("detached");
    assert!(detached.is_detached() && detached.is_root());
    assert_ne!(detached.tree_id(), outer.tree_id());
    assert_eq!(ctx.stack_ids(), vec![outer.id()]);

    let err = detached
        .with_database(|conn| conn.execute("DELETE FROM work", []))
        .expect_err("not attached yet");
    assert_eq!(err.code(), "SCOPE_NESTING");
    let err = detached
        .write_lock(&[uow_core::LockId::SERVERS])
        .expect_err("not attached yet");
    assert_eq!(err.code(), "SCOPE_NESTING");
    assert_eq!(ctx.stack_ids(), vec![outer.id()]);

    let err = ctx.detach_scope().expect_err("outer was never attached");
    assert_eq!(err.code(), "SCOPE_NESTING");

    ctx.attach_scope(&detached).expect("attach");
    assert_eq!(ctx.ambient_scope_id(), Some(detached.id()));
    assert_eq!(
        ctx.attach_scope(&detached).expect_err("twice").code(),
        "SCOPE_NESTING"
    );

    let child = ctx.create_scope(ScopeOptions::default()).expect("child");
    assert_eq!(child.parent_id(), Some(detached.id()));
    assert_eq!(child.tree_id(), detached.tree_id());
    record(&child, 1);
    child.complete().expect("complete child");
    child.dispose().expect("dispose child");

    assert_eq!(ctx.detach_scope().expect("detach"), detached.id());
    assert_eq!(ctx.stack_ids(), vec![outer.id()]);
    assert!(!detached.is_attached());

    detached.complete().expect("complete detached");
    assert_eq!(detached.dispose().expect("dispose detached"), ScopeOutcome::Committed);
    assert_eq!(count_work(&path), 1);

    assert_eq!(outer.dispose().expect("dispose outer"), ScopeOutcome::RolledBack);
    assert_eq!(ctx.depth(), 0);
}

#[test]
fn contexts_are_independent_stacks() {
    let (_dir, _path, provider) = open("contexts");
    let first = provider.context();
    let second = provider.context();

    let scope = first.create_scope(ScopeOptions::auto_complete()).expect("scope");
    assert_eq!(first.depth(), 1);
    assert_eq!(second.depth(), 0);
    assert_eq!(second.ambient_scope_id(), None);

    let foreign = second
        .create_detached_scope(ScopeOptions::default())
        .expect("detached");
    assert_eq!(
        first.attach_scope(&foreign).expect_err("other context").code(),
        "SCOPE_NESTING"
    );
    scope.dispose().expect("dispose");
}

#[test]
fn nested_isolation_only_tightens() {
    let (_dir, _path, provider) = open("isolation");
    let ctx = provider.context();

    let root = ctx
        .create_scope(ScopeOptions::default())
        .expect("root");
    assert_eq!(root.isolation_level(), IsolationLevel::ReadCommitted);

    let stricter = ctx
        .create_scope(ScopeOptions::default().with_isolation(IsolationLevel::Serializable))
        .expect("stricter");
    assert_eq!(root.isolation_level(), IsolationLevel::Serializable);

    let weaker = ctx
        .create_scope(ScopeOptions::default().with_isolation(IsolationLevel::ReadUncommitted))
        .expect("weaker request is accepted");
    assert_eq!(weaker.isolation_level(), IsolationLevel::Serializable);
    assert_eq!(root.isolation_level(), IsolationLevel::Serializable);

    weaker.complete().expect("complete");
    weaker.dispose().expect("dispose");
    stricter.complete().expect("complete");
    stricter.dispose().expect("dispose");
    assert_eq!(root.isolation_level(), IsolationLevel::Serializable);
    root.complete().expect("complete");
    root.dispose().expect("dispose");
}

#[test]
fn stricter_isolation_after_the_first_statement_is_a_conflict() {
    let (_dir, _path, provider) = open("isolation_late");
    let ctx = provider.context();

    let root = ctx.create_scope(ScopeOptions::default()).expect("root");
    root.with_database(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
        .expect("first statement");

    let err = ctx
        .create_scope(ScopeOptions::default().with_isolation(IsolationLevel::Serializable))
        .expect_err("transaction already running");
    assert!(
        matches!(
            err,
            ScopeError::ConfigurationConflict {
                option: "isolation_level",
                ..
            }
        ),
        "{err}"
    );
    assert!(err.is_programming_error());
    assert_eq!(ctx.stack_ids(), vec![root.id()]);
    assert_eq!(root.isolation_level(), IsolationLevel::ReadCommitted);

    let same = ctx
        .create_scope(ScopeOptions::default().with_isolation(IsolationLevel::ReadCommitted))
        .expect("same level");
    let weaker = ctx
        .create_scope(ScopeOptions::default().with_isolation(IsolationLevel::ReadUncommitted))
        .expect("weaker level is ignored");
    assert_eq!(weaker.isolation_level(), IsolationLevel::ReadCommitted);

    weaker.complete().expect("complete");
    weaker.dispose().expect("dispose");
    same.complete().expect("complete");
    same.dispose().expect("dispose");
    root.complete().expect("complete");
    assert_eq!(root.dispose().expect("dispose"), ScopeOutcome::Committed);
}

#[test]
fn incompatible_nested_options_are_rejected_without_touching_the_stack() {
    let (_dir, _path, provider) = open("conflict");
    let ctx = provider.context();

    let root = ctx
        .create_scope(ScopeOptions::default().with_cache_mode(RepositoryCacheMode::Scoped))
        .expect("root");

    let err = ctx
        .create_scope(ScopeOptions::default().with_cache_mode(RepositoryCacheMode::None))
        .expect_err("cache mode conflict");
    assert!(matches!(
        err,
        ScopeError::ConfigurationConflict {
            option: "repository_cache_mode",
            ..
        }
    ));
    let err = ctx
        .create_scope(ScopeOptions::default().with_scope_file_systems(true))
        .expect_err("file system conflict");
    assert_eq!(err.code(), "CONFIGURATION_CONFLICT");
    assert_eq!(ctx.stack_ids(), vec![root.id()]);

    let same = ctx
        .create_scope(ScopeOptions::default().with_cache_mode(RepositoryCacheMode::Scoped))
        .expect("same mode");
    let inherit = ctx
        .create_scope(ScopeOptions::default().with_call_context())
        .expect("inherit");
    assert_eq!(inherit.cache_mode(), RepositoryCacheMode::Scoped);
    assert!(!inherit.scope_file_systems());
    assert!(inherit.call_context());
    assert!(!same.call_context());

    inherit.complete().expect("complete");
    inherit.dispose().expect("dispose");
    same.complete().expect("complete");
    same.dispose().expect("dispose");
    root.dispose().expect("dispose");
}

#[test]
fn provider_is_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync + Clone>() {}
    assert_send_sync::<ScopeProvider>();

    let (_dir, path, provider) = open("threads");
    let handles = (0..4)
        .map(|n| {
            let provider = provider.clone();
            std::thread::spawn(move || {
                let ctx = provider.context();
                let scope = ctx.create_scope(ScopeOptions::default()).expect("scope");
                record(&scope, n);
                scope.complete().expect("complete");
                scope.dispose().expect("dispose")
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        assert_eq!(handle.join().expect("join"), ScopeOutcome::Committed);
    }
    assert_eq!(count_work(&path), 4);
}
