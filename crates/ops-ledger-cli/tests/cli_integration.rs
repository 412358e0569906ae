use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ol<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ol"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ol binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ol(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ol command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    parse_stdout(&output)
}

fn run_failure_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ol(args);
    assert!(
        !output.status.success(),
        "ol command should fail, stdout:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    parse_stdout(&output)
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read schema {}: {err}", schema_path.display()));
    let schema_json: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse schema {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn write_taxonomy_baseline(dir: &Path) -> PathBuf {
    let baseline = serde_json::json!({
        "tactics": [
            {"id": "", "externalId": "TA0001", "name": "Initial Access"}
        ],
        "techniques": [
            {"id": "", "externalId": "T1566", "name": "Phishing", "tacticId": "TA0001"}
        ],
        "subtechniques": [
            {
                "id": "",
                "externalId": "T1566.001",
                "name": "Spearphishing Attachment",
                "techniqueId": "T1566"
            }
        ]
    });
    let path = dir.join("taxonomy.json");
    fs::write(&path, baseline.to_string())
        .unwrap_or_else(|err| panic!("failed to write taxonomy baseline: {err}"));
    path
}

// Test IDs: TCLI-001
#[test]
fn db_commands_cover_schema_version_migrate_stats_and_integrity() {
    let sandbox = unique_temp_dir("ops-ledger-cli-db");
    let db = sandbox.join("ledger.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_i64(&dry_run, "current_version"), 0);
    assert_eq!(
        dry_run.get("would_apply_versions").and_then(Value::as_array).map(Vec::len),
        Some(1)
    );

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 1);

    let stats = run_json(["--db", path_str(&db), "db", "stats"]);
    let counts = stats
        .get("counts")
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("stats should include counts: {stats}"));
    assert_eq!(counts.len(), 18);
    assert!(counts.values().all(|count| count.as_i64() == Some(0)));

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert!(integrity.get("quick_check_ok").and_then(Value::as_bool).unwrap_or(false));

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-002, TCLI-003
#[test]
fn seed_backup_and_restore_round_trip_across_databases() {
    let sandbox = unique_temp_dir("ops-ledger-cli-roundtrip");
    let db_a = sandbox.join("a.sqlite3");
    let db_b = sandbox.join("b.sqlite3");
    let snapshot_file = sandbox.join("snapshot.json");
    let audit_log = sandbox.join("audit.ndjson");
    let baseline = write_taxonomy_baseline(&sandbox);

    let seeded = run_json([
        "--db",
        path_str(&db_a),
        "taxonomy",
        "seed",
        "--from",
        path_str(&baseline),
    ]);
    assert_eq!(
        seeded.get("summary").map(|summary| as_i64(summary, "inserted_techniques")),
        Some(1)
    );

    let backup = run_json([
        "--db",
        path_str(&db_a),
        "snapshot",
        "backup",
        "--out",
        path_str(&snapshot_file),
        "--actor",
        "admin@example.org",
        "--audit-log",
        path_str(&audit_log),
    ]);
    validate_schema("backup_result.schema.json", &backup);
    assert!(snapshot_file.exists());
    let categories = backup
        .get("categories")
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("backup should include categories: {backup}"));
    assert_eq!(categories.get("techniques").and_then(Value::as_i64), Some(1));

    let restore = run_json([
        "--db",
        path_str(&db_b),
        "snapshot",
        "restore",
        "--in",
        path_str(&snapshot_file),
        "--actor",
        "admin@example.org",
        "--audit-log",
        path_str(&audit_log),
    ]);
    validate_schema("restore_result.schema.json", &restore);
    let created = restore
        .get("summary")
        .and_then(|summary| summary.get("created"))
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("restore should report created rows: {restore}"));
    assert_eq!(created.get("subtechniques").and_then(Value::as_i64), Some(1));

    let stats = run_json(["--db", path_str(&db_b), "db", "stats"]);
    let counts = stats
        .get("counts")
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("stats should include counts: {stats}"));
    assert_eq!(counts.get("tactics").and_then(Value::as_i64), Some(1));
    assert_eq!(counts.get("techniques").and_then(Value::as_i64), Some(1));

    // Both invocations appended one audit line each.
    let audit_body = fs::read_to_string(&audit_log)
        .unwrap_or_else(|err| panic!("audit log should exist: {err}"));
    let events: Vec<Value> = audit_body
        .lines()
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|err| panic!("audit line should be JSON: {err}\nline: {line}"))
        })
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(as_str(&events[0], "action"), "backup");
    assert_eq!(as_str(&events[1], "action"), "restore");
    assert_eq!(as_str(&events[0], "actor"), "admin@example.org");

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-004
#[test]
fn engine_failures_emit_machine_readable_error_kind() {
    let sandbox = unique_temp_dir("ops-ledger-cli-error");
    let db = sandbox.join("ledger.sqlite3");
    let broken = sandbox.join("broken.json");
    fs::write(&broken, "{this is not json")
        .unwrap_or_else(|err| panic!("failed to write broken snapshot: {err}"));

    let error = run_failure_json([
        "--db",
        path_str(&db),
        "snapshot",
        "restore",
        "--in",
        path_str(&broken),
    ]);
    validate_schema("error.schema.json", &error);
    assert_eq!(as_str(&error, "error_kind"), "malformed_input");

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-005
#[test]
fn scoped_backup_serializes_only_selected_categories() {
    let sandbox = unique_temp_dir("ops-ledger-cli-scope");
    let db = sandbox.join("ledger.sqlite3");
    let snapshot_file = sandbox.join("accounts.json");

    let backup = run_json([
        "--db",
        path_str(&db),
        "snapshot",
        "backup",
        "--out",
        path_str(&snapshot_file),
        "--accounts",
    ]);
    validate_schema("backup_result.schema.json", &backup);

    let categories = backup
        .get("categories")
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("backup should include categories: {backup}"));
    assert!(categories.contains_key("accounts"));
    assert!(categories.contains_key("accessGroups"));
    assert!(!categories.contains_key("tactics"));
    assert!(!categories.contains_key("operations"));

    let snapshot_body = fs::read_to_string(&snapshot_file)
        .unwrap_or_else(|err| panic!("snapshot file should exist: {err}"));
    let snapshot: Value = serde_json::from_str(&snapshot_body)
        .unwrap_or_else(|err| panic!("snapshot should be JSON: {err}"));
    let payload = snapshot
        .get("payload")
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("snapshot should carry a payload: {snapshot}"));
    assert!(payload.contains_key("accounts"));
    assert!(!payload.contains_key("tactics"));

    let _ = fs::remove_dir_all(&sandbox);
}
