//! CLI integration tests for redb-mapping.
//!
//! These tests cover argument parsing, the offline address and cardinality
//! commands, and exit codes for configuration errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn cmd() -> Command {
    Command::cargo_bin("redb-mapping").unwrap()
}

fn config_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", content).unwrap();
    file
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
        .stdout(predicate::str::contains("resolve"))
        .stdout(predicate::str::contains("build-address"))
        .stdout(predicate::str::contains("infer"))
        .stdout(predicate::str::contains("check-rule"))
        .stdout(predicate::str::contains("check-config"))
        .stdout(predicate::str::contains("init-store"))
        .stdout(predicate::str::contains("list-mappings"))
        .stdout(predicate::str::contains("show-mapping"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("redb-mapping"));
}

#[test]
fn test_global_flag_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: config.yaml]"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_check_rule_help() {
    cmd()
        .args(["check-rule", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--cardinality"))
        .stdout(predicate::str::contains("--transformation-type"))
        .stdout(predicate::str::contains("[default: passthrough]"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Offline Commands
// =============================================================================

#[test]
fn test_resolve_column_address() {
    cmd()
        .args(["resolve", "redb://data/database/db1/table/users/column/email"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Protocol: Redb"))
        .stdout(predicate::str::contains("Object: column email"))
        .stdout(predicate::str::contains("Database: db1"))
        .stdout(predicate::str::contains("Table: users"));
}

#[test]
fn test_resolve_legacy_dotted_prints_canonical_form() {
    cmd()
        .args(["resolve", "db1.users"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "redb://data/database/db1/table/users\n",
        ))
        .stdout(predicate::str::contains("Protocol: LegacyDotted"));
}

#[test]
fn test_resolve_json_output() {
    cmd()
        .args(["--output-json", "resolve", "mcp://customers"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""object_type":"mcp_resource""#))
        .stdout(predicate::str::contains(r#""canonical":"mcp://customers""#));
}

#[test]
fn test_resolve_unknown_scheme_exits_with_code_2() {
    cmd()
        .args(["resolve", "ftp://host/file"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unsupported address scheme"));
}

#[test]
fn test_build_address_per_scope() {
    cmd()
        .args([
            "build-address",
            "--scope",
            "column",
            "--database",
            "db1",
            "--table",
            "users",
            "--column",
            "email",
        ])
        .assert()
        .success()
        .stdout("redb://data/database/db1/table/users/column/email\n");
    cmd()
        .args(["build-address", "--scope", "database", "--database", "db1", "--table", "users"])
        .assert()
        .success()
        .stdout("redb://data/database/db1\n");
}

#[test]
fn test_build_address_degrades_missing_column() {
    cmd()
        .args([
            "--output-json",
            "build-address",
            "--scope",
            "column",
            "--database",
            "db1",
            "--table",
            "users",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""object_type":"table""#));
}

#[test]
fn test_build_address_rejects_unknown_scope() {
    cmd()
        .args(["build-address", "--scope", "schema", "--database", "db1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unsupported address scope 'schema'"));
}

#[test]
fn test_infer_labels() {
    cmd()
        .args(["infer", "1", "3"])
        .assert()
        .success()
        .stdout("one-to-many\n");
    cmd()
        .args(["infer", "2", "0"])
        .assert()
        .success()
        .stdout("sink\n");
    cmd()
        .args(["infer", "0", "0"])
        .assert()
        .success()
        .stdout("invalid\n");
}

#[test]
fn test_check_rule_accepts_matching_counts() {
    cmd()
        .args([
            "check-rule",
            "--cardinality",
            "many-to-one",
            "--sources",
            "2",
            "--targets",
            "1",
            "--transformation-type",
            "merge",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid for merge"));
}

#[test]
fn test_check_rule_rejects_count_mismatch() {
    cmd()
        .args([
            "check-rule",
            "--cardinality",
            "one-to-one",
            "--sources",
            "2",
            "--targets",
            "1",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cardinality 'one-to-one' requires"));
}

#[test]
fn test_check_rule_rejects_incompatible_transformation() {
    cmd()
        .args([
            "check-rule",
            "--cardinality",
            "many-to-one",
            "--sources",
            "2",
            "--targets",
            "1",
            "--transformation-type",
            "passthrough",
        ])
        .assert()
        .code(2);
}

#[test]
fn test_offline_commands_ignore_missing_config() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "infer", "1", "1"])
        .assert()
        .success();
}

// =============================================================================
// Configuration Exit Codes
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "check-config"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let file = config_file("invalid: yaml: content: [\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = tempfile::NamedTempFile::new().unwrap();
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .code(1);
}

#[test]
fn test_bad_ssl_mode_exits_with_code_1() {
    let file = config_file(
        "store:\n  host: localhost\n  database: controlplane\n  user: redb\n  ssl_mode: prefer\n",
    );
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("store.ssl_mode 'prefer' is invalid"));
}

#[test]
fn test_check_config_summary() {
    let file = config_file(
        "store:\n  host: localhost\n  database: controlplane\n  user: redb\ncopy:\n  batch_size: 500\n  parallel_workers: 2\n",
    );
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains(
            "Store: localhost:5432/controlplane (schema redb_mapping)",
        ))
        .stdout(predicate::str::contains("Copy: batch size 500, 2 workers"))
        .stdout(predicate::str::contains("Broadcast: single node"));
}

#[test]
fn test_unknown_verbosity_exits_with_code_1() {
    cmd()
        .args(["--verbosity", "loud", "infer", "1", "1"])
        .assert()
        .code(1);
}
