use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use guardrails_core::new_root_id;
use jsonschema::JSONSchema;
use serde_json::Value;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}\nvalue={value}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn gur_json(db_path: &Path, args: &[&str]) -> Value {
    let binary = std::env::var("CARGO_BIN_EXE_gur")
        .unwrap_or_else(|err| panic!("gur binary path not provided by cargo: {err}"));
    let output = Command::new(binary)
        .env_remove("GUR_LOG")
        .env("RUST_BACKTRACE", "0")
        .env("RUST_LIB_BACKTRACE", "0")
        .arg("--db")
        .arg(db_path)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to run gur {args:?}: {err}"));
    assert!(
        output.status.success(),
        "gur {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|err| panic!("gur {args:?} printed invalid JSON: {err}"))
}

fn string_field(value: &Value, field: &str) -> String {
    value[field]
        .as_str()
        .unwrap_or_else(|| panic!("missing string field {field} in {value}"))
        .to_string()
}

#[test]
fn cli_outputs_conform_to_contract_schemas() {
    let schema_dir = repo_root().join("contracts/v1/schemas");
    let db_path = std::env::temp_dir().join(format!("gur-integration-{}.sqlite3", new_root_id()));

    let parent = gur_json(&db_path, &["create", "epic work", "--type", "epic", "--label", "q3"]);
    assert_schema(&schema_dir.join("task.schema.json"), &parent);
    let parent_id = string_field(&parent, "id");

    let child = gur_json(&db_path, &["create", "child work", "--parent", &parent_id]);
    assert_schema(&schema_dir.join("task.schema.json"), &child);
    assert_eq!(string_field(&child, "id"), format!("{parent_id}.1"));

    let gate = gur_json(&db_path, &["gate", "create", "review", "--category", "process"]);
    let gate_id = string_field(&gate, "id");
    let link = gur_json(&db_path, &["gate", "link", "--gate", &gate_id, "--task", &parent_id]);
    assert_schema(&schema_dir.join("gate-task-link.schema.json"), &link);

    let readiness = gur_json(&db_path, &["gate", "check", &parent_id]);
    assert_schema(&schema_dir.join("close-readiness.schema.json"), &readiness);
    assert_eq!(readiness["open_subtasks"], serde_json::json!([format!("{parent_id}.1")]));

    let updated = gur_json(&db_path, &["update", &parent_id, "--status", "in_progress", "--notes", "kicked off"]);
    assert_schema(&schema_dir.join("task.schema.json"), &updated);

    let history = gur_json(&db_path, &["history", &parent_id, "--json"]);
    let entries = history
        .as_array()
        .unwrap_or_else(|| panic!("history output is not an array: {history}"));
    assert!(!entries.is_empty());
    for entry in entries {
        assert_schema(&schema_dir.join("history-entry.schema.json"), entry);
    }

    let stats = gur_json(&db_path, &["stats"]);
    assert_schema(&schema_dir.join("stats.schema.json"), &stats);
    assert_eq!(stats["total"], serde_json::json!(2));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn task_schema_accepts_every_id_shape_the_tracker_accepts() {
    let schema_path = repo_root().join("contracts/v1/schemas/task.schema.json");
    let db_path = std::env::temp_dir().join(format!("gur-integration-ids-{}.sqlite3", new_root_id()));
    let mut task = gur_json(&db_path, &["create", "id shapes"]);
    let root = string_field(&task, "id");

    for suffix in ["", ".1", ".01", ".10.002"] {
        let candidate = format!("{root}{suffix}");
        assert!(guardrails_core::is_valid_task_id(&candidate), "{candidate}");
        task["id"] = Value::String(candidate);
        assert_schema(&schema_path, &task);
    }

    let schema = read_json(&schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    for rejected in [".0", ".00", ".", ".x"] {
        let candidate = format!("{root}{rejected}");
        assert!(!guardrails_core::is_valid_task_id(&candidate), "{candidate}");
        task["id"] = Value::String(candidate);
        assert!(!compiled.is_valid(&task), "schema accepted {}", task["id"]);
    }

    let _ = fs::remove_file(&db_path);
}
