//! CLI integration tests for workbench admin commands.
//!
//! Each test uses an isolated temp directory for the database, ensuring tests
//! can run in parallel safely.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

use std::path::Path;

use assert_cmd::Command;
use assert_fs::TempDir;
use predicates::prelude::*;
use workbench::store::{SqliteStore, Store};

struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    fn data_dir_str(&self) -> String {
        self.data_dir().to_string_lossy().to_string()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("workbench").expect("failed to find binary");
        cmd.env("NO_COLOR", "1");
        cmd
    }

    fn init(&self) -> assert_cmd::assert::Assert {
        self.cmd()
            .args([
                "admin",
                "init",
                "--data-dir",
                &self.data_dir_str(),
                "--non-interactive",
            ])
            .assert()
    }

    fn store(&self) -> SqliteStore {
        SqliteStore::new(self.data_dir().join("workbench.db")).expect("failed to open store")
    }
}

#[test]
fn test_init_creates_database_and_admin_token() {
    let ctx = TestContext::new();

    ctx.init()
        .success()
        .stdout(predicate::str::contains("Admin token"));

    let token_file = ctx.data_dir().join(".admin_token");
    let token = std::fs::read_to_string(&token_file).expect("token file written");
    assert!(token.starts_with("workbench_"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&token_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let store = ctx.store();
    assert!(store.has_admin_token().unwrap());
    assert_eq!(store.list_plans().unwrap().len(), 4);
}

#[test]
fn test_init_twice_fails() {
    let ctx = TestContext::new();
    ctx.init().success();

    ctx.init()
        .failure()
        .stderr(predicate::str::contains("already initialized"));
}

#[test]
fn test_serve_requires_init() {
    let ctx = TestContext::new();

    ctx.cmd()
        .args(["serve", "--data-dir", &ctx.data_dir_str(), "--port", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Server not initialized"));
}

#[test]
fn test_serve_rejects_invalid_config() {
    let ctx = TestContext::new();
    ctx.init().success();
    std::fs::write(
        ctx.data_dir().join("workbench.toml"),
        "session_ttl_seconds = -5\n",
    )
    .unwrap();

    ctx.cmd()
        .args(["serve", "--data-dir", &ctx.data_dir_str(), "--port", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("session_ttl_seconds"));
}
