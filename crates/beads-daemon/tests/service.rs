//! End-to-end scenarios driven through the request dispatch layer.

use std::path::Path;

use serde_json::{Value, json};

use beads_core::cancel::CancelToken;
use beads_daemon::{Daemon, Request, Response};
use beads_storage::PREFIX_CONFIG_KEY;

fn open_daemon(root: &Path) -> Daemon {
    let state_dir = beads_config::ensure_state_dir(root).unwrap();
    let daemon = Daemon::open(&state_dir).unwrap();
    daemon
        .store()
        .set_config_impl(PREFIX_CONFIG_KEY, "bd")
        .unwrap();
    daemon
}

fn call(daemon: &Daemon, operation: &str, args: Value) -> Response {
    let mut req = Request::new(operation, args);
    req.actor = "tester".into();
    daemon.handle_request(&req, &CancelToken::new())
}

fn call_ok(daemon: &Daemon, operation: &str, args: Value) -> Value {
    let resp = call(daemon, operation, args);
    assert!(
        resp.success,
        "{operation} failed: {:?}",
        resp.error.map(|e| format!("{}: {}", e.kind, e.message))
    );
    resp.data.unwrap()
}

fn ready_ids(daemon: &Daemon) -> Vec<String> {
    call_ok(daemon, "ready", json!({}))["issues"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["id"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn create_and_ready_flow() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());

    let a = call_ok(&daemon, "create", json!({"title": "Issue A", "priority": 2}));
    let a_id = a["issue"]["id"].as_str().unwrap().to_string();

    call_ok(
        &daemon,
        "create",
        json!({
            "title": "Issue B",
            "dependencies": [{"depends_on_id": a_id, "type": "blocks"}],
        }),
    );

    // Only A is ready while it blocks B.
    assert_eq!(ready_ids(&daemon), vec![a_id.clone()]);

    call_ok(&daemon, "close", json!({"id": a_id, "reason": "done"}));
    let ready = ready_ids(&daemon);
    assert_eq!(ready.len(), 1);
    assert_ne!(ready[0], a_id);

    // A's audit trail: created then closed.
    let shown = call_ok(&daemon, "show", json!({"id": a_id}));
    let kinds: Vec<&str> = shown["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["created", "closed"]);
}

#[test]
fn hierarchical_blocking_flow() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());

    call_ok(
        &daemon,
        "create",
        json!({"id": "bd-epic", "title": "Epic", "issue_type": "epic"}),
    );
    for n in [1, 2] {
        call_ok(
            &daemon,
            "create",
            json!({
                "id": format!("bd-epic.{n}"),
                "title": format!("Task {n}"),
                "dependencies": [{"depends_on_id": "bd-epic", "type": "parent-child"}],
            }),
        );
    }
    call_ok(&daemon, "create", json!({"id": "bd-blk", "title": "Blocker"}));
    call_ok(
        &daemon,
        "dep_add",
        json!({"issue_id": "bd-epic", "depends_on_id": "bd-blk", "type": "blocks"}),
    );

    // Blockage flows through parent-child: neither task is ready.
    let ready = ready_ids(&daemon);
    assert!(!ready.contains(&"bd-epic.1".to_string()));
    assert!(!ready.contains(&"bd-epic.2".to_string()));

    call_ok(&daemon, "close", json!({"id": "bd-blk", "reason": "done"}));
    let ready = ready_ids(&daemon);
    assert!(ready.contains(&"bd-epic.1".to_string()));
    assert!(ready.contains(&"bd-epic.2".to_string()));
}

#[test]
fn partial_id_resolution_prefers_exact_hash() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());

    call_ok(
        &daemon,
        "create",
        json!({"id": "bd-3d0", "title": "Epic", "issue_type": "epic"}),
    );
    call_ok(
        &daemon,
        "create",
        json!({"id": "bd-3d0.1", "title": "Child"}),
    );

    let resolved = call_ok(&daemon, "resolve_id", json!({"id": "3d0"}));
    assert_eq!(resolved["id"], "bd-3d0");
}

#[test]
fn cycle_prevention_leaves_graph_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());

    for id in ["bd-a", "bd-b", "bd-c"] {
        call_ok(&daemon, "create", json!({"id": id, "title": id}));
    }
    call_ok(
        &daemon,
        "dep_add",
        json!({"issue_id": "bd-a", "depends_on_id": "bd-b"}),
    );
    call_ok(
        &daemon,
        "dep_add",
        json!({"issue_id": "bd-b", "depends_on_id": "bd-c"}),
    );

    let resp = call(
        &daemon,
        "dep_add",
        json!({"issue_id": "bd-c", "depends_on_id": "bd-a"}),
    );
    assert!(!resp.success);
    assert_eq!(resp.error.unwrap().kind, "cycle");

    // No edge was written.
    let shown = call_ok(&daemon, "show", json!({"id": "bd-c"}));
    assert!(
        shown["issue"].get("dependencies").is_none()
            || shown["issue"]["dependencies"].as_array().unwrap().is_empty()
    );
}

#[test]
fn version_gate_blocks_writes_but_not_ping() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path()).with_version("1.2.0");

    let mut create = Request::new("create", json!({"title": "Gated"}));
    create.client_version = "2.0.0".into();
    let resp = daemon.handle_request(&create, &CancelToken::new());
    assert!(!resp.success);
    assert_eq!(resp.error.unwrap().kind, "incompatible-version");

    let mut ping = Request::new("ping", json!({}));
    ping.client_version = "2.0.0".into();
    let resp = daemon.handle_request(&ping, &CancelToken::new());
    assert!(resp.success);

    // health reports the verdict without enforcing it.
    let mut health = Request::new("health", json!({}));
    health.client_version = "2.0.0".into();
    let resp = daemon.handle_request(&health, &CancelToken::new());
    assert!(resp.success);
    let data = resp.data.unwrap();
    assert_eq!(data["compatible"], false);
}

#[test]
fn export_import_roundtrip_through_service() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());

    for id in ["bd-1", "bd-2", "bd-3"] {
        call_ok(&daemon, "create", json!({"id": id, "title": id}));
    }
    call_ok(
        &daemon,
        "dep_add",
        json!({"issue_id": "bd-1", "depends_on_id": "bd-2"}),
    );
    call_ok(
        &daemon,
        "dep_add",
        json!({"issue_id": "bd-2", "depends_on_id": "bd-3", "type": "parent-child"}),
    );

    let exported = call_ok(&daemon, "export", json!({}));
    assert_eq!(exported["written"], 3);

    // Wipe and restore.
    daemon
        .store()
        .delete_issues_impl(
            &["bd-1".into(), "bd-2".into(), "bd-3".into()],
            true,
            true,
            false,
        )
        .unwrap();
    let imported = call_ok(&daemon, "import", json!({"policy": "allow"}));
    assert_eq!(imported["created"], 3);
    assert_eq!(imported["deps_added"], 2);

    let listed = call_ok(&daemon, "list", json!({}));
    assert_eq!(listed["count"], 3);

    // Restored state matches the mirror: nothing further to export.
    let again = call_ok(&daemon, "export", json!({}));
    assert_eq!(again["written"], 0);
}

#[test]
fn binding_mismatch_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());

    let mut req = Request::new("list", json!({}));
    req.expected_db = "/somewhere/else/beads.db".into();
    let resp = daemon.handle_request(&req, &CancelToken::new());
    assert!(!resp.success);
    assert_eq!(resp.error.unwrap().kind, "mismatch");

    // health is exempt so diagnostics still work.
    let mut health = Request::new("health", json!({}));
    health.expected_db = "/somewhere/else/beads.db".into();
    assert!(daemon.handle_request(&health, &CancelToken::new()).success);
}

#[test]
fn batch_runs_all_operations() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());

    let data = call_ok(
        &daemon,
        "batch",
        json!({"operations": [
            {"operation": "create", "args": {"id": "bd-b1", "title": "First"}},
            {"operation": "show", "args": {"id": "bd-missing"}},
            {"operation": "create", "args": {"id": "bd-b2", "title": "Second"}},
        ]}),
    );
    let results = data["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["success"], true);
    // The middle failure does not abort the batch.
    assert_eq!(results[1]["success"], false);
    assert_eq!(results[2]["success"], true);

    let listed = call_ok(&daemon, "list", json!({}));
    assert_eq!(listed["count"], 2);
}

#[test]
fn mutation_stream_long_poll() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());

    let page = call_ok(&daemon, "get_mutations", json!({"since_ms": -1}));
    assert!(page["mutations"].as_array().unwrap().is_empty());

    call_ok(&daemon, "create", json!({"id": "bd-m1", "title": "Watched"}));
    call_ok(
        &daemon,
        "update",
        json!({"id": "bd-m1", "updates": [{"field": "priority", "value": 1}]}),
    );

    let page = call_ok(&daemon, "get_mutations", json!({"since_ms": -1}));
    let muts = page["mutations"].as_array().unwrap();
    assert_eq!(muts.len(), 2);
    assert_eq!(muts[0]["kind"], "create");
    assert_eq!(muts[1]["kind"], "update");
    assert_eq!(page["resync"], false);

    // Cursor past the stream sees nothing new.
    let last_ts = muts[1]["timestamp_ms"].as_i64().unwrap();
    let page = call_ok(&daemon, "get_mutations", json!({"since_ms": last_ts}));
    assert!(page["mutations"].as_array().unwrap().is_empty());
}

#[test]
fn stale_mirror_triggers_auto_import() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());

    // Another writer appends to the mirror behind the daemon's back.
    let mirror = dir.path().join(".beads").join("beads.jsonl");
    std::fs::write(
        &mirror,
        "{\"id\":\"bd-outside\",\"title\":\"Written by a sibling\"}\n",
    )
    .unwrap();

    // Any ordinary read notices the newer mirror and imports it first.
    let listed = call_ok(&daemon, "list", json!({}));
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["issues"][0]["id"], "bd-outside");
}

#[test]
fn update_rejects_unknown_fields() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());
    call_ok(&daemon, "create", json!({"id": "bd-u1", "title": "Strict"}));

    let resp = call(
        &daemon,
        "update",
        json!({"id": "bd-u1", "updates": [{"field": "owner", "value": "eve"}]}),
    );
    assert!(!resp.success);
    assert_eq!(resp.error.unwrap().kind, "validation");
}

#[test]
fn unknown_operation_is_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = open_daemon(dir.path());
    let resp = call(&daemon, "frobnicate", json!({}));
    assert!(!resp.success);
    assert_eq!(resp.error.unwrap().kind, "validation");
}
