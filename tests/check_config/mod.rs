use assert_cmd::prelude::*;
use crate::common::CommandBisectbotExt;
use predicates::str::contains;
use std::fs;
use std::process::Command;
use tempfile::NamedTempFile;

fn private_key_fixture() -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600)).unwrap();
    }
    file
}

fn base_env(key_path: &std::path::Path) -> Vec<(&'static str, String)> {
    vec![
        ("DATABASE_URL", "bisectbot-test.db".to_string()),
        ("MAX_CONCURRENT_JOBS", "4".to_string()),
        ("SANDBOX_IMAGE", "rust:1-slim".to_string()),
        ("FORGE_APP_ID", "12345".to_string()),
        ("FORGE_PRIVATE_KEY_PATH", key_path.display().to_string()),
        ("FORGE_WEBHOOK_SECRET", "shh".to_string()),
    ]
}

#[test]
fn test_good_config() {
    let key = private_key_fixture();
    Command::bisectbot()
        .arg("check-config")
        .envs(base_env(key.path()))
        .assert()
        .success();
}

#[test]
fn test_missing_required_variable() {
    let key = private_key_fixture();
    Command::bisectbot()
        .arg("check-config")
        .envs(
            base_env(key.path())
                .into_iter()
                .filter(|(name, _)| *name != "FORGE_WEBHOOK_SECRET"),
        )
        .assert()
        .failure()
        .code(1)
        .stderr(contains(
            "missing required environment variable FORGE_WEBHOOK_SECRET",
        ));
}

#[test]
fn test_zero_concurrency_is_rejected() {
    let key = private_key_fixture();
    Command::bisectbot()
        .arg("check-config")
        .envs(base_env(key.path()))
        .env("MAX_CONCURRENT_JOBS", "0")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("MAX_CONCURRENT_JOBS must be at least 1"));
}

#[test]
fn test_missing_private_key_file() {
    let key = private_key_fixture();
    let missing = key.path().with_extension("gone");
    Command::bisectbot()
        .arg("check-config")
        .envs(base_env(key.path()))
        .env("FORGE_PRIVATE_KEY_PATH", missing.display().to_string())
        .assert()
        .failure()
        .code(1)
        .stderr(contains("does not exist"));
}

#[cfg(unix)]
#[test]
fn test_world_readable_private_key_is_rejected() {
    use std::os::unix::fs::PermissionsExt;

    let key = private_key_fixture();
    fs::set_permissions(key.path(), fs::Permissions::from_mode(0o644)).unwrap();
    Command::bisectbot()
        .arg("check-config")
        .envs(base_env(key.path()))
        .assert()
        .failure()
        .code(1)
        .stderr(contains("must not be readable by group or other"));
}
