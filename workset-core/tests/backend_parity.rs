//! Both git backends must agree on every repository question

#[macro_use]
mod common;

use common::{backends, Fixture};
use workset_core::CallContext;

/// Assert every backend answers `is_content_merged` with `expected`
fn assert_content_merged(fx: &Fixture, branch: &str, base: &str, expected: bool) {
    let ctx = CallContext::new();
    for (label, git) in backends() {
        let merged = git
            .is_content_merged(&ctx, &fx.path, branch, base)
            .unwrap_or_else(|e| panic!("{label}: {e}"));
        assert_eq!(merged, expected, "{label}: {branch} merged into {base}");
    }
}

fn assert_ancestor(fx: &Fixture, ancestor: &str, descendant: &str, expected: bool) {
    for (label, git) in backends() {
        let result = git
            .is_ancestor(&fx.path, ancestor, descendant)
            .unwrap_or_else(|e| panic!("{label}: {e}"));
        assert_eq!(result, expected, "{label}: {ancestor} ancestor of {descendant}");
    }
}

#[test]
fn test_same_commit_is_merged() {
    require_git!();
    let fx = Fixture::new();
    fx.git(&["branch", "feature"]);

    assert_ancestor(&fx, "feature", "main", true);
    assert_content_merged(&fx, "feature", "main", true);
}

#[test]
fn test_fast_forward_merge() {
    require_git!();
    let fx = Fixture::new();
    fx.branch("feature");
    fx.commit_file("a.txt", "a\n", "add a");
    fx.checkout("main");
    fx.git(&["merge", "-q", "--ff-only", "feature"]);

    assert_ancestor(&fx, "feature", "main", true);
    assert_content_merged(&fx, "feature", "main", true);
}

#[test]
fn test_no_ff_merge() {
    require_git!();
    let fx = Fixture::new();
    fx.branch("feature");
    fx.commit_file("a.txt", "a\n", "add a");
    fx.checkout("main");
    fx.commit_file("b.txt", "b\n", "add b");
    fx.git(&["merge", "-q", "--no-ff", "-m", "merge feature", "feature"]);

    assert_ancestor(&fx, "feature", "main", true);
    assert_content_merged(&fx, "feature", "main", true);
}

#[test]
fn test_squash_merge_after_base_moved() {
    require_git!();
    let fx = Fixture::new();
    fx.branch("feature");
    fx.commit_file("a.txt", "a\n", "add a");
    fx.commit_file("a.txt", "a2\n", "edit a");
    fx.checkout("main");
    fx.commit_file("b.txt", "b\n", "add b");
    fx.git(&["merge", "-q", "--squash", "feature"]);
    fx.git(&["commit", "-q", "-m", "squash feature"]);
    fx.commit_file("c.txt", "c\n", "add c");

    assert_ancestor(&fx, "feature", "main", false);
    assert_content_merged(&fx, "feature", "main", true);
}

#[test]
fn test_cherry_pick() {
    require_git!();
    let fx = Fixture::new();
    fx.branch("feature");
    let picked = fx.commit_file("a.txt", "a\n", "add a");
    fx.checkout("main");
    fx.commit_file("b.txt", "b\n", "add b");
    fx.git(&["cherry-pick", picked.as_str()]);

    assert_ancestor(&fx, "feature", "main", false);
    assert_content_merged(&fx, "feature", "main", true);
}

#[test]
fn test_unmerged_work_is_not_merged() {
    require_git!();
    let fx = Fixture::new();
    fx.branch("feature");
    fx.commit_file("a.txt", "a\n", "add a");
    fx.checkout("main");
    fx.commit_file("b.txt", "b\n", "add b");

    assert_ancestor(&fx, "feature", "main", false);
    assert_content_merged(&fx, "feature", "main", false);
}

#[test]
fn test_same_path_different_content_is_not_merged() {
    require_git!();
    let fx = Fixture::new();
    fx.branch("feature");
    fx.commit_file("a.txt", "feature version\n", "add a");
    fx.checkout("main");
    fx.commit_file("a.txt", "main version\n", "add a differently");

    assert_content_merged(&fx, "feature", "main", false);
}

#[test]
fn test_squashed_tree_found_in_history() {
    require_git!();
    let fx = Fixture::new();
    fx.branch("feature");
    fx.commit_file("a.txt", "v1\n", "add a");
    fx.checkout("main");
    // main has not moved, so the squash commit's tree equals the branch tree
    fx.git(&["merge", "-q", "--squash", "feature"]);
    fx.git(&["commit", "-q", "-m", "squash feature"]);
    fx.commit_file("a.txt", "v2\n", "rewrite a");

    assert_ancestor(&fx, "feature", "main", false);
    assert_content_merged(&fx, "feature", "main", true);
}

#[test]
fn test_rename_and_delete_squashed() {
    require_git!();
    let fx = Fixture::new();
    fx.commit_file("old.txt", "stable contents\n", "add old");
    fx.commit_file("gone.txt", "doomed\n", "add gone");
    fx.branch("feature");
    fx.git(&["mv", "old.txt", "new.txt"]);
    fx.git(&["rm", "-q", "gone.txt"]);
    fx.git(&["commit", "-q", "-m", "rename and delete"]);
    fx.checkout("main");
    fx.commit_file("b.txt", "b\n", "add b");
    fx.git(&["merge", "-q", "--squash", "feature"]);
    fx.git(&["commit", "-q", "-m", "squash feature"]);

    assert_content_merged(&fx, "feature", "main", true);
}

#[test]
fn test_rename_not_applied_in_base() {
    require_git!();
    let fx = Fixture::new();
    fx.commit_file("old.txt", "stable contents\n", "add old");
    fx.branch("feature");
    fx.git(&["mv", "old.txt", "new.txt"]);
    fx.git(&["commit", "-q", "-m", "rename"]);
    fx.checkout("main");
    // Copy without removing the source: the rename never happened on main
    fx.commit_file("new.txt", "stable contents\n", "copy old");

    assert_content_merged(&fx, "feature", "main", false);
}

#[test]
fn test_criss_cross_merge_bases() {
    require_git!();
    let fx = Fixture::new();
    fx.branch("left");
    let left_tip = fx.commit_file("a.txt", "a\n", "add a");
    fx.checkout("main");
    fx.branch("right");
    fx.commit_file("b.txt", "b\n", "add b");
    fx.checkout("left");
    fx.git(&["merge", "-q", "--no-ff", "-m", "merge right", "right"]);
    fx.checkout("right");
    fx.git(&["merge", "-q", "--no-ff", "-m", "merge left", left_tip.as_str()]);
    fx.checkout("left");
    fx.commit_file("c.txt", "c\n", "add c");

    assert_ancestor(&fx, "right", "left", false);
    assert_content_merged(&fx, "right", "left", true);
}

#[test]
fn test_unrelated_histories_are_not_merged() {
    require_git!();
    let fx = Fixture::new();
    fx.git(&["checkout", "-q", "--orphan", "island"]);
    fx.git(&["rm", "-rq", "--cached", "."]);
    fx.commit_file("island.txt", "alone\n", "orphan root");

    assert_content_merged(&fx, "island", "main", false);
}

#[test]
fn test_missing_branch_is_an_error() {
    require_git!();
    let fx = Fixture::new();
    let ctx = CallContext::new();
    for (label, git) in backends() {
        assert!(
            git.is_content_merged(&ctx, &fx.path, "no-such-branch", "main")
                .is_err(),
            "{label}"
        );
    }
}

#[test]
fn test_cancelled_context_stops_detection() {
    require_git!();
    let fx = Fixture::new();
    let ctx = CallContext::new();
    ctx.cancel();
    for (label, git) in backends() {
        let err = git
            .is_content_merged(&ctx, &fx.path, "main", "main")
            .unwrap_err();
        assert!(matches!(err, workset_core::Error::Cancelled), "{label}: {err}");
    }
}

#[test]
fn test_status_and_refs() {
    require_git!();
    let fx = Fixture::new();
    fx.git(&["branch", "topic"]);

    for (label, git) in backends() {
        let clean = git.status(&fx.path).unwrap();
        assert!(!clean.dirty && !clean.missing, "{label}: clean");

        assert!(git.is_repo(&fx.path).unwrap(), "{label}");
        assert!(git.reference_exists(&fx.path, "refs/heads/topic").unwrap(), "{label}");
        assert!(!git.reference_exists(&fx.path, "refs/heads/nope").unwrap(), "{label}");
        assert_eq!(git.current_branch(&fx.path).unwrap().as_deref(), Some("main"), "{label}");
        assert!(!git.remote_exists(&fx.path, "origin").unwrap(), "{label}");

        let missing = git.status(&fx.scratch("nowhere")).unwrap();
        assert!(missing.missing, "{label}: missing");
    }

    fx.write("untracked.txt", "new\n");
    for (label, git) in backends() {
        assert!(git.status(&fx.path).unwrap().dirty, "{label}: untracked");
    }

    fx.git(&["add", "untracked.txt"]);
    for (label, git) in backends() {
        assert!(git.status(&fx.path).unwrap().dirty, "{label}: staged");
    }
}

#[test]
fn test_detached_head_has_no_branch() {
    require_git!();
    let fx = Fixture::new();
    let head = fx.head();
    fx.git(&["checkout", "-q", "--detach", head.as_str()]);

    for (label, git) in backends() {
        assert_eq!(git.current_branch(&fx.path).unwrap(), None, "{label}");
    }
}

#[test]
fn test_add_remote_is_idempotent() {
    require_git!();
    let fx = Fixture::new();
    let upstream = Fixture::new();
    let url = upstream.path.to_string_lossy().into_owned();

    for (label, git) in backends() {
        git.add_remote(&fx.path, "upstream", &url).unwrap();
        git.add_remote(&fx.path, "upstream", "https://example.invalid/other.git")
            .unwrap();
        assert!(git.remote_exists(&fx.path, "upstream").unwrap(), "{label}");
    }
    assert_eq!(fx.git(&["remote", "get-url", "upstream"]), url);
}
