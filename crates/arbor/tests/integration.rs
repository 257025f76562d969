//! End-to-end CLI integration tests for the `arbor` binary.
//!
//! Each test creates its own temporary directory, initializes a database,
//! and exercises the `arbor` binary as a subprocess via `assert_cmd`.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a `Command` targeting the cargo-built `arbor` binary, pointed at
/// the database inside `tmp`.
fn arbor(tmp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("arbor").unwrap();
    cmd.current_dir(tmp.path())
        .env_remove("ARBOR_DB")
        .env_remove("RUST_LOG")
        .args(["--db", "forms.db"]);
    cmd
}

fn init_project() -> TempDir {
    let tmp = TempDir::new().unwrap();
    arbor(&tmp).args(["init", "--quiet"]).assert().success();
    tmp
}

fn write_json(tmp: &TempDir, name: &str, value: &Value) -> PathBuf {
    let path = tmp.path().join(name);
    fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}

/// Run with `--json` and parse stdout.
fn run_json(tmp: &TempDir, args: &[&str]) -> Value {
    let output = arbor(tmp).args(args).arg("--json").output().unwrap();
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

/// Repeater `rep` with templates `a` (formula `fa` on `b` and `global`) and
/// `b` (variable `vb`).
fn repeater_graph() -> Value {
    json!({
        "nodes": [
            {"id": "root"},
            {"id": "global", "parentId": "root", "label": "Global"},
            {"id": "rep", "parentId": "root", "type": "branch",
             "metadata": {"repeater": {"templateNodeIds": ["a", "b"]}}},
            {"id": "a", "parentId": "rep", "label": "A"},
            {"id": "b", "parentId": "rep", "label": "B"}
        ],
        "capacities": [{
            "id": "fa",
            "ownerNodeId": "a",
            "body": {
                "kind": "formula",
                "tokens": [{"type": "ref", "ref": "@value.b"}, "*", {"type": "ref", "ref": "@value.global"}]
            }
        }],
        "variables": [{"id": "vb", "nodeId": "b", "exposedKey": "b_value"}]
    })
}

fn import_repeater_graph(tmp: &TempDir) {
    let path = write_json(tmp, "graph.json", &repeater_graph());
    arbor(tmp)
        .args(["import", path.to_str().unwrap(), "--quiet"])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_database_and_config() {
    let tmp = TempDir::new().unwrap();
    arbor(&tmp)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized arbor database"));
    assert!(tmp.path().join("forms.db").exists());
    assert!(tmp.path().join("arbor.yaml").exists());
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let tmp = init_project();
    arbor(&tmp)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    arbor(&tmp).args(["init", "--force", "--quiet"]).assert().success();
}

#[test]
fn commands_require_an_initialized_database() {
    let tmp = TempDir::new().unwrap();
    arbor(&tmp)
        .args(["links", "recompute"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("arbor init"));
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

#[test]
fn import_links_owner_and_referenced_nodes() {
    let tmp = init_project();
    import_repeater_graph(&tmp);

    let views = run_json(&tmp, &["show", "a", "b", "global"]);
    for view in views.as_array().unwrap() {
        assert_eq!(view["node"]["linkedFormulaIds"], json!(["fa"]), "{}", view["node"]["id"]);
    }

    // Already converged: a second pass writes nothing.
    let report = run_json(&tmp, &["links", "recompute"]);
    assert_eq!(report["nodes_updated"], 0);
    assert_eq!(report["ids_added"], 0);

    arbor(&tmp)
        .args(["links", "recompute", "--node", "a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Links up to date"));
}

// ---------------------------------------------------------------------------
// Repeat
// ---------------------------------------------------------------------------

#[test]
fn repeat_add_list_and_remove() {
    let tmp = init_project();
    import_repeater_graph(&tmp);

    let blueprint = run_json(&tmp, &["blueprint", "rep"]);
    assert_eq!(blueprint["templateNodeIds"], json!(["a", "b"]));

    let first = run_json(&tmp, &["repeat", "add", "rep"]);
    assert_eq!(first["index"], 1);
    assert_eq!(first["nodes"]["a"], "a-1");
    assert_eq!(first["nodes"]["b"], "b-1");

    let second = run_json(&tmp, &["repeat", "add", "rep"]);
    assert_eq!(second["index"], 2);

    let listed = run_json(&tmp, &["repeat", "list", "rep"]);
    assert_eq!(listed.as_array().unwrap().len(), 2);

    // The clone of `fa` reads the cloned `b` and keeps the outside `global`.
    let global = run_json(&tmp, &["show", "global"]);
    assert_eq!(global[0]["node"]["linkedFormulaIds"], json!(["fa", "fa-1", "fa-2"]));

    let removed = run_json(&tmp, &["repeat", "remove", "b-1"]);
    assert_eq!(removed["index"], 1);
    assert_eq!(removed["deleted_node_ids"], json!(["a-1", "b-1"]));

    arbor(&tmp)
        .args(["repeat", "list", "rep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("a-2, b-2"))
        .stdout(predicate::str::contains("a-1").not());

    let global = run_json(&tmp, &["show", "global"]);
    assert_eq!(global[0]["node"]["linkedFormulaIds"], json!(["fa", "fa-2"]));
}

#[test]
fn removing_a_template_node_fails() {
    let tmp = init_project();
    import_repeater_graph(&tmp);
    arbor(&tmp)
        .args(["repeat", "remove", "a"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not part of a repeater occurrence"));
}

// ---------------------------------------------------------------------------
// Eval
// ---------------------------------------------------------------------------

#[test]
fn eval_formula_prints_trace() {
    let tmp = init_project();
    import_repeater_graph(&tmp);

    arbor(&tmp)
        .args(["eval", "node-formula:fa", "--set", "b=6", "--set", "global=0.5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("B(6) * Global(0.5) = 3"))
        .stdout(predicate::str::contains("Value: 3"));
}

#[test]
fn eval_reads_values_file() {
    let tmp = init_project();
    import_repeater_graph(&tmp);
    let values = write_json(&tmp, "values.json", &json!({"b": 4, "global": 0}));

    let evaluation = run_json(
        &tmp,
        &["eval", "node-formula:fa", "--values", values.to_str().unwrap()],
    );
    assert_eq!(evaluation["value"], json!({"kind": "number", "value": 0.0}));
    assert_eq!(evaluation["cycle_detected"], false);
}

#[test]
fn eval_missing_operand_is_not_an_error() {
    let tmp = init_project();
    import_repeater_graph(&tmp);

    arbor(&tmp)
        .args(["eval", "node-formula:fa", "--set", "b=2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("B(2) * Global(∅) = ∅"))
        .stdout(predicate::str::contains("Value: ∅ (missing)"));
}

#[test]
fn eval_condition_takes_fallback() {
    let tmp = init_project();
    let graph = json!({
        "nodes": [{"id": "x", "label": "X"}, {"id": "y", "label": "Y"}],
        "capacities": [{
            "id": "c",
            "ownerNodeId": "y",
            "body": {
                "kind": "condition",
                "branches": [{
                    "when": {"op": "isNotEmpty", "left": {"ref": "@value.x"}},
                    "actions": [{"type": "SHOW", "nodeIds": ["y"]}]
                }],
                "fallback": {"actions": [{"type": "HIDE", "nodeIds": ["y"]}]}
            }
        }]
    });
    let path = write_json(&tmp, "cond.json", &graph);
    arbor(&tmp).args(["import", path.to_str().unwrap(), "--quiet"]).assert().success();

    arbor(&tmp)
        .args(["eval", "condition:c"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "If X(∅) is not empty; THEN: SHOW [Y] -> [FALLBACK] HIDE [Y]",
        ));
}

// ---------------------------------------------------------------------------
// Errors and configuration
// ---------------------------------------------------------------------------

#[test]
fn unknown_node_reports_json_error() {
    let tmp = init_project();
    let output = arbor(&tmp).args(["show", "nope", "--json"]).output().unwrap();
    assert!(!output.status.success());
    let err: Value = serde_json::from_slice(&output.stderr).unwrap();
    assert!(err["error"].as_str().unwrap().contains("nope"));
}

#[test]
fn invalid_set_pair_is_rejected() {
    let tmp = init_project();
    arbor(&tmp)
        .args(["eval", "@value.x", "--set", "novalue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected ID=VALUE"));
}

#[test]
fn config_show_merges_environment() {
    let tmp = init_project();
    let config = run_json(&tmp, &["config", "show"]);
    assert_eq!(config["evaluation"]["empty-display"], "∅");

    let output = arbor(&tmp)
        .args(["config", "show", "--json"])
        .env("ARBOR_REPEAT__MAX_OCCURRENCES", "3")
        .output()
        .unwrap();
    assert!(output.status.success());
    let config: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["repeat"]["max-occurrences"], 3);
}

#[test]
fn completion_generates_script() {
    let tmp = TempDir::new().unwrap();
    arbor(&tmp)
        .args(["completion", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("arbor"));
}
