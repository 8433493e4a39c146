//! CLI integration tests for erp-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes, and a full run/audit/rollback cycle over fixture files.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::Path;

/// Get a command for the erp-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("erp-migrate").unwrap()
}

/// Write a legacy fixture and a config pointing at it; returns the config path.
fn write_fixture(dir: &Path, extra_migration: &str) -> std::path::PathBuf {
    std::fs::write(
        dir.join("legacy.json"),
        r#"{"tables":[{"name":"legacy_contacts","rows":[
            {"id":1,"full_name":"Jon Smith","email_addr":"JON@X.COM"},
            {"id":2,"full_name":"Ann Lee","email_addr":"ann@y.org"},
            {"id":3,"full_name":"Bo Chan","email_addr":"bo@z.net"}
        ]}]}"#,
    )
    .unwrap();

    let config_path = dir.join("migrate.yaml");
    let yaml = format!(
        r#"
source:
  path: {dir}/legacy.json
target:
  path: {dir}/target.json
state:
  path: {dir}/state.json
  hmac_key: state-secret
audit:
  signing_key: audit-secret
  key_id: test
migration:
  max_concurrent_jobs: 1
{extra}
entities:
  - entity_type: contacts
    table: legacy_contacts
    fields:
      - {{ source: full_name, target: name }}
      - {{ source: email_addr, target: email, data_type: email }}
"#,
        dir = dir.display(),
        extra = extra_migration
    );
    std::fs::write(&config_path, yaml).unwrap();
    config_path
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("preflight"))
        .stdout(predicate::str::contains("quarantine"))
        .stdout(predicate::str::contains("audit"))
        .stdout(predicate::str::contains("verify-audit"))
        .stdout(predicate::str::contains("rollback"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--entity"))
        .stdout(predicate::str::contains("--run-id"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_resume_requires_run_id() {
    cmd()
        .arg("resume")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--run-id"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("erp-migrate"));
}

#[test]
fn test_global_flags_in_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("--verbosity"));
}

#[test]
fn test_invalid_quarantine_stage_rejected() {
    cmd()
        .args(["quarantine", "job-1", "--stage", "teleport"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown failure stage"));
}

// =============================================================================
// Configuration Error Tests
// =============================================================================

#[test]
fn test_missing_config_file() {
    cmd()
        .args(["--config", "/nonexistent/migrate.yaml", "status"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_invalid_yaml_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source: [not: valid").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status"])
        .assert()
        .code(2);
}

#[test]
fn test_config_validation_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
source:
  path: legacy.json
target:
  path: target.json
state:
  path: state.json
  hmac_key: ""
entities: []
"#
    )
    .unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("hmac_key"));
}

#[test]
fn test_unknown_entity_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), "");

    cmd()
        .args(["--config", config.to_str().unwrap(), "run", "--entity", "vendors"])
        .assert()
        .code(2);
}

#[test]
fn test_resume_unknown_run_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), "");

    cmd()
        .args(["--config", config.to_str().unwrap(), "resume", "--run-id", "never"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no unfinished jobs"));
}

// =============================================================================
// End-to-end Tests
// =============================================================================

#[test]
fn test_preflight_passes_for_mapped_entity() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), "");

    cmd()
        .args(["--config", config.to_str().unwrap(), "preflight"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[PASS] mapping_completeness"));
}

#[test]
fn test_run_audit_verify_and_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), "");
    let config = config.to_str().unwrap();

    let output = cmd()
        .args(["--config", config, "--output-json", "run", "--run-id", "r1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["run_id"], "r1");
    assert_eq!(report["jobs"][0]["job_id"], "r1-contacts");
    assert_eq!(report["jobs"][0]["status"], "completed");

    cmd()
        .args(["--config", config, "status", "r1-contacts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Loaded: 3"));

    cmd()
        .args(["--config", config, "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("r1-contacts"));

    let audit_path = dir.path().join("audit.json");
    cmd()
        .args([
            "--config",
            config,
            "audit",
            "r1-contacts",
            "--output",
            audit_path.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Digest:"));

    cmd()
        .args(["--config", config, "verify-audit", audit_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("signature and digest"));

    // Tampering with the saved report must be detected.
    let tampered = std::fs::read_to_string(&audit_path)
        .unwrap()
        .replace("\"completed\"", "\"failed\"");
    std::fs::write(&audit_path, tampered).unwrap();
    cmd()
        .args(["--config", config, "verify-audit", audit_path.to_str().unwrap()])
        .assert()
        .code(5);

    cmd()
        .args(["--config", config, "rollback", "r1-contacts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Reverted: 3"));

    // A second rollback of the same job is refused.
    cmd()
        .args(["--config", config, "rollback", "r1-contacts"])
        .assert()
        .code(1);
}

#[test]
fn test_blocked_preflight_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), "  max_null_rate: 0.0");
    // The only contact has no email, so the null-rate gate blocks.
    std::fs::write(
        dir.path().join("legacy.json"),
        r#"{"tables":[{"name":"legacy_contacts","rows":[
            {"id":1,"full_name":"Jon Smith","email_addr":null}
        ]}]}"#,
    )
    .unwrap();

    cmd()
        .args(["--config", config.to_str().unwrap(), "run", "--run-id", "r2"])
        .assert()
        .code(3);
}
