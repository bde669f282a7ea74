//! GitIntegrator against a real throwaway repository.

use std::path::Path;
use std::process::Command;

use accdd_core::{GitIntegrator, IntegrationError, Integrator, MergeRequest};
use accdd_store::{Changeset, CycleId, Fileset};
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=test", "-c", "user.email=test@localhost"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn commit_file(dir: &Path, path: &str, content: &str, message: &str) -> String {
    let target = dir.join(path);
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(target, content).unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
    git(dir, &["rev-parse", "HEAD"])
}

fn init_repo() -> TempDir {
    let repo = tempfile::tempdir().unwrap();
    git(repo.path(), &["init", "-q"]);
    git(repo.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
    commit_file(repo.path(), "README.md", "# demo\n", "init");
    repo
}

fn changeset(files: &[(&str, &str)]) -> Changeset {
    Changeset::new("add greeting", files.iter().copied().collect::<Fileset>())
}

fn request<'a>(
    cycle_id: &'a CycleId,
    base_ref: &'a str,
    changeset: &'a Changeset,
) -> MergeRequest<'a> {
    MergeRequest {
        cycle_id,
        branch: "main",
        base_ref,
        changeset,
        message: "ac-cdd: cycle 01".into(),
    }
}

#[tokio::test]
async fn changeset_is_committed_on_top_of_base() {
    let repo = init_repo();
    let integrator = GitIntegrator::new(repo.path());
    let id = CycleId::new("01").unwrap();

    let base = integrator.base_ref("main").await.unwrap();
    let cs = changeset(&[("src/lib.rs", "pub fn hello() {}\n")]);
    let commit = integrator.integrate(&request(&id, &base, &cs)).await.unwrap();

    assert_ne!(commit, base);
    assert_eq!(git(repo.path(), &["rev-parse", "refs/heads/main"]), commit);
    assert_eq!(git(repo.path(), &["rev-parse", "main^"]), base);
    assert_eq!(
        git(repo.path(), &["show", "main:src/lib.rs"]),
        "pub fn hello() {}"
    );
    assert_eq!(git(repo.path(), &["log", "-1", "--format=%an", "main"]), "ac-cdd");
}

#[tokio::test]
async fn unrelated_branch_movement_still_merges() {
    let repo = init_repo();
    let integrator = GitIntegrator::new(repo.path());
    let id = CycleId::new("01").unwrap();

    let base = integrator.base_ref("main").await.unwrap();
    let moved = commit_file(repo.path(), "docs/notes.md", "notes\n", "docs");

    let cs = changeset(&[("src/lib.rs", "pub fn hello() {}\n")]);
    let commit = integrator.integrate(&request(&id, &base, &cs)).await.unwrap();

    assert_eq!(git(repo.path(), &["rev-parse", "main^"]), moved);
    assert_eq!(git(repo.path(), &["show", &format!("{commit}:docs/notes.md")]), "notes");
}

#[tokio::test]
async fn overlapping_branch_movement_is_a_conflict() {
    let repo = init_repo();
    let integrator = GitIntegrator::new(repo.path());
    let id = CycleId::new("01").unwrap();

    let base = integrator.base_ref("main").await.unwrap();
    let moved = commit_file(repo.path(), "src/lib.rs", "pub fn other() {}\n", "concurrent");

    let cs = changeset(&[("src/lib.rs", "pub fn hello() {}\n")]);
    let err = integrator
        .integrate(&request(&id, &base, &cs))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        IntegrationError::Conflict {
            paths: vec!["src/lib.rs".into()]
        }
    );
    assert_eq!(git(repo.path(), &["rev-parse", "refs/heads/main"]), moved);
}

#[tokio::test]
async fn escaping_path_is_refused() {
    let repo = init_repo();
    let integrator = GitIntegrator::new(repo.path());
    let id = CycleId::new("01").unwrap();

    let base = integrator.base_ref("main").await.unwrap();
    let cs = changeset(&[("../outside.txt", "x")]);
    let err = integrator
        .integrate(&request(&id, &base, &cs))
        .await
        .unwrap_err();

    assert!(matches!(err, IntegrationError::Failed(_)), "err: {err:?}");
    assert_eq!(git(repo.path(), &["rev-parse", "refs/heads/main"]), base);
    assert!(!repo.path().parent().unwrap().join("outside.txt").exists());
}

#[tokio::test]
async fn unknown_branch_has_no_base() {
    let repo = init_repo();
    let integrator = GitIntegrator::new(repo.path());
    assert!(integrator.base_ref("does-not-exist").await.is_err());
}
