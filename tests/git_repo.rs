//! End-to-end tests against a real git repository.
//!
//! Each test builds a small repository with the `git` CLI and drives the
//! backend, prefetcher, and cache against it. All tests skip (with a
//! note on stderr) when `git` is not on `PATH`.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;

use revlog_engine::backend::git::GitBackend;
use revlog_engine::{map_branch, open_repository, Backend, Cache, CacheConfig};

fn git_available() -> bool {
    let found = Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !found {
        eprintln!("git not found on PATH; skipping");
    }
    found
}

fn git(repo: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Alice Smith")
        .env("GIT_AUTHOR_EMAIL", "alice@example.com")
        .env("GIT_COMMITTER_NAME", "Alice Smith")
        .env("GIT_COMMITTER_EMAIL", "alice@example.com")
        .env("GIT_AUTHOR_DATE", "1000000000 +0200")
        .env("GIT_COMMITTER_DATE", "1000000000 +0200")
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

/// Builds a three-commit repository on branch `trunk`:
/// 1. adds `a.txt` (two lines) and `b.txt` (one line)
/// 2. rewrites one line of `a.txt`
/// 3. deletes `b.txt`
fn build_repo(dir: &Path) -> PathBuf {
    let repo = dir.join("repo");
    std::fs::create_dir(&repo).unwrap();
    git(&repo, &["init", "-q", "-b", "trunk"]);

    std::fs::write(repo.join("a.txt"), "one\ntwo\n").unwrap();
    std::fs::write(repo.join("b.txt"), "bee\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "first"]);

    std::fs::write(repo.join("a.txt"), "one\nTWO\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "second"]);

    git(&repo, &["rm", "-q", "b.txt"]);
    git(&repo, &["commit", "-q", "-m", "third"]);

    repo
}

#[test]
fn iterator_pairs_parent_and_child_ids() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = build_repo(tmp.path());

    let backend = open_repository(&repo).unwrap();
    let it = backend.iterator("trunk", None, None).unwrap();
    let ids = it.ids();
    assert_eq!(ids.len(), 3);
    assert!(!ids[0].contains(':'));
    let (first_parent, _) = ids[1].split_once(':').unwrap();
    assert_eq!(first_parent, ids[0]);
    let (second_parent, _) = ids[2].split_once(':').unwrap();
    assert_eq!(second_parent, ids[1].split_once(':').unwrap().1);
}

#[test]
fn repository_queries_answer_from_the_cli() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = build_repo(tmp.path());

    let mut backend = GitBackend::open(&repo).unwrap();
    assert_eq!(backend.name(), "git");
    assert_eq!(backend.main_branch().unwrap(), "trunk");
    assert_eq!(backend.branches().unwrap(), vec!["trunk".to_string()]);

    let head = backend.head("").unwrap();
    assert_eq!(head.len(), 40);
    assert_eq!(backend.head("trunk").unwrap(), head);

    let tree = backend.tree("").unwrap();
    assert_eq!(tree, vec!["a.txt".to_string()]);

    // The uuid is the root commit, and the sidecar caches it.
    let uuid = backend.uuid().unwrap();
    let it = backend.iterator("trunk", None, None).unwrap();
    assert_eq!(uuid, it.ids()[0]);
    assert!(repo.join(".git").join("revlog.cache").is_file());

    // A second backend reuses the sidecar entry.
    let mut again = GitBackend::open(&repo).unwrap();
    assert_eq!(again.uuid().unwrap(), uuid);
}

#[test]
fn revisions_carry_metadata_and_diffstats() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = build_repo(tmp.path());

    let mut backend = GitBackend::open(&repo).unwrap();
    let ids = backend.iterator("trunk", None, None).unwrap().ids().to_vec();

    // Prefetched path: workers parse the batched header stream.
    backend.prefetch(&ids).unwrap();

    let root = backend.revision(&ids[0]).unwrap();
    assert_eq!(root.author(), "Alice Smith");
    assert_eq!(root.date(), 1_000_000_000 + 200);
    assert_eq!(root.message(), "first");
    let a = root.diffstat().get("a.txt").unwrap();
    assert_eq!(a.lines_added, 2);
    assert_eq!(a.bytes_added, 6);
    let b = root.diffstat().get("b.txt").unwrap();
    assert_eq!(b.lines_added, 1);
    assert_eq!(b.bytes_added, 3);

    let second = backend.revision(&ids[1]).unwrap();
    let a = second.diffstat().get("a.txt").unwrap();
    assert_eq!(a.lines_added, 1);
    assert_eq!(a.lines_removed, 1);
    assert_eq!(a.bytes_added, 3);
    assert_eq!(a.bytes_removed, 3);

    let third = backend.revision(&ids[2]).unwrap();
    let b = third.diffstat().get("b.txt").unwrap();
    assert_eq!(b.lines_removed, 1);
    assert_eq!(b.bytes_removed, 3);
    assert_eq!(b.lines_added, 0);

    backend.finalize().unwrap();
}

#[test]
fn prefetched_results_match_one_shot_fetches_out_of_order() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = build_repo(tmp.path());

    let mut backend = GitBackend::open(&repo).unwrap();
    let ids = backend.iterator("trunk", None, None).unwrap().ids().to_vec();
    backend.prefetch(&ids).unwrap();

    // Request in reverse order; every result must match a direct fetch.
    for id in ids.iter().rev() {
        let prefetched = backend.diffstat(id).unwrap();
        // The queue entry is consumed, so this second call is one-shot.
        let direct = backend.diffstat(id).unwrap();
        assert_eq!(prefetched, direct, "diffstat mismatch for {id}");
    }
    backend.finalize().unwrap();
}

#[test]
fn one_shot_revision_fetch_needs_no_prefetch() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = build_repo(tmp.path());

    let mut backend = GitBackend::open(&repo).unwrap();
    let ids = backend.iterator("trunk", None, None).unwrap().ids().to_vec();
    let revision = backend.revision(&ids[1]).unwrap();
    assert_eq!(revision.author(), "Alice Smith");
    assert_eq!(revision.message().trim_end(), "second");
    assert_eq!(revision.date(), 1_000_000_200);
}

#[test]
fn cached_report_run_skips_the_fetch_pipeline() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = build_repo(tmp.path());
    let cache_root = tmp.path().join("cache");

    let terminate = AtomicBool::new(false);
    let mut first_run = Vec::new();
    {
        let backend = open_repository(&repo).unwrap();
        let mut cache = Cache::new(backend, CacheConfig::new(&cache_root)).unwrap();
        map_branch(&mut cache, "trunk", &terminate, |revision| {
            first_run.push(revision.clone());
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(cache.len(), 3);
    }

    // Second run over a fresh cache instance: everything is served from
    // disk and must be structurally identical.
    let backend = open_repository(&repo).unwrap();
    let mut cache = Cache::new(backend, CacheConfig::new(&cache_root)).unwrap();
    assert_eq!(cache.len(), 3);
    let mut second_run = Vec::new();
    map_branch(&mut cache, "trunk", &terminate, |revision| {
        second_run.push(revision.clone());
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(first_run, second_run);
}

#[test]
fn window_iterator_filters_by_time() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = build_repo(tmp.path());

    let backend = GitBackend::open(&repo).unwrap();
    // All commits share the same timestamp; a window containing it keeps
    // them, an upper bound below it drops them.
    let around = backend
        .iterator("trunk", Some(999_999_000), None)
        .unwrap();
    assert_eq!(around.ids().len(), 3);
    let too_early = backend
        .iterator("trunk", None, Some(999_000_000))
        .unwrap();
    assert!(too_early.ids().is_empty());
}
