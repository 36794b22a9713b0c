//! Request dispatch: binding and version gates, the staleness check, and
//! one handler per operation.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use beads_core::cancel::CancelToken;
use beads_core::dependency::Dependency;
use beads_core::enums::{DependencyType, IssueType, SortPolicy, Status};
use beads_core::filter::{IssueFilter, StaleFilter, WorkFilter};
use beads_core::issue::IssueBuilder;
use beads_core::update::FieldUpdate;
use beads_storage::StorageError;
use beads_sync::{OrphanPolicy, SyncError};

use crate::Daemon;
use crate::mutations::MutationKind;
use crate::protocol::{Request, Response};
use crate::state::{memory_footprint_kb, probe_storage};
use crate::version::check_compatibility;

/// Operations exempt from the database-binding check.
const BINDING_EXEMPT: &[&str] = &["health", "metrics"];

/// Operations exempt from the version gate.
const VERSION_EXEMPT: &[&str] = &["ping", "health"];

/// Operations exempt from the mirror staleness check.
const STALENESS_EXEMPT: &[&str] = &["ping", "health", "metrics", "export", "import"];

impl Daemon {
    /// Entry point for one request. Never panics; every failure becomes a
    /// structured error response.
    pub fn handle_request(&self, req: &Request, cancel: &CancelToken) -> Response {
        self.state.touch();
        let op = req.operation.as_str();

        // Binding validation: the caller names the database it expects.
        if !BINDING_EXEMPT.contains(&op) {
            if req.expected_db.is_empty() {
                warn!(operation = op, "request without expected_db (legacy caller)");
            } else {
                let expected = resolve_for_comparison(Path::new(&req.expected_db));
                if expected != self.db_path {
                    return Response::err(
                        "mismatch",
                        format!(
                            "database mismatch: client expects {}, daemon serves {}",
                            expected.display(),
                            self.db_path.display()
                        ),
                    )
                    .with_request_id(&req.request_id);
                }
            }
        }

        // Version gate.
        if !VERSION_EXEMPT.contains(&op) {
            let verdict = check_compatibility(&self.version, &req.client_version);
            if let Some(msg) = verdict.message() {
                return Response::err("incompatible-version", msg)
                    .with_request_id(&req.request_id);
            }
        }

        // Staleness check: pull in a mirror that changed on disk. A
        // failure here is logged but never fails the caller's request.
        if !STALENESS_EXEMPT.contains(&op) {
            if let Err(e) = beads_sync::maybe_auto_import(
                &self.store,
                &self.mirror_path,
                self.orphan_policy(),
                cancel,
            ) {
                warn!(error = %e, "mirror auto-import failed");
            }
        }

        self.dispatch(op, req, cancel)
            .with_request_id(&req.request_id)
    }

    /// Routes to the per-operation handler.
    pub(crate) fn dispatch(&self, op: &str, req: &Request, cancel: &CancelToken) -> Response {
        if cancel.is_canceled() {
            return Response::err("canceled", "request canceled");
        }
        match op {
            "ping" => Response::ok(json!({"pong": true, "version": self.version})),
            "status" => self.op_status(),
            "health" => self.op_health(req),
            "metrics" => self.op_metrics(),
            "create" => self.op_create(req),
            "update" => self.op_update(req),
            "close" => self.op_close(req),
            "list" => self.op_list(req),
            "show" => self.op_show(req),
            "ready" => self.op_ready(req),
            "stale" => self.op_stale(req),
            "stats" => self.op_stats(),
            "dep_add" => self.op_dep_add(req),
            "dep_remove" => self.op_dep_remove(req),
            "dep_tree" => self.op_dep_tree(req),
            "label_add" => self.op_label(req, true),
            "label_remove" => self.op_label(req, false),
            "comment_list" => self.op_comment_list(req),
            "comment_add" => self.op_comment_add(req),
            "batch" => self.op_batch(req, cancel),
            "resolve_id" => self.op_resolve_id(req),
            "compact" => self.op_compact(req),
            "compact_stats" => self.op_compact_stats(),
            "export" => self.op_export(req, cancel),
            "import" => self.op_import(req, cancel),
            "epic_status" => self.op_epic_status(),
            "get_mutations" => self.op_get_mutations(req),
            "shutdown" => self.op_shutdown(),
            other => Response::err("validation", format!("unknown operation: {other}")),
        }
    }

    // -- Diagnostics ---------------------------------------------------------

    fn op_status(&self) -> Response {
        Response::ok(json!({
            "version": self.version,
            "database": self.db_path.display().to_string(),
            "started_at": self.state.started_at.to_rfc3339(),
            "uptime_seconds": (Utc::now() - self.state.started_at).num_seconds(),
            "last_activity": self.state.last_activity().to_rfc3339(),
            "active_connections": self.state.active_connections(),
            "max_connections": self.state.max_connections,
            "memory_kb": memory_footprint_kb(),
            "lock_holder": self.state.lock_holder(),
        }))
    }

    /// Health reports the compatibility verdict without enforcing it so
    /// diagnostics work across mismatched versions.
    fn op_health(&self, req: &Request) -> Response {
        let (status, elapsed) = probe_storage(&self.store);
        let verdict = check_compatibility(&self.version, &req.client_version);
        Response::ok(json!({
            "status": status,
            "probe_ms": elapsed.as_millis() as u64,
            "version": self.version,
            "client_version": req.client_version,
            "compatible": verdict.is_compatible(),
            "compatibility_message": verdict.message(),
        }))
    }

    fn op_metrics(&self) -> Response {
        match self.store.get_statistics_impl() {
            Ok(stats) => Response::ok(json!({
                "issues": stats,
                "mutation_buffer": self.mutations.len(),
                "active_connections": self.state.active_connections(),
                "memory_kb": memory_footprint_kb(),
            })),
            Err(e) => storage_error(e),
        }
    }

    // -- Issue CRUD ----------------------------------------------------------

    fn op_create(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct DepSpec {
            depends_on_id: String,
            #[serde(rename = "type", default)]
            dep_type: DependencyType,
        }
        #[derive(Deserialize)]
        struct CreateArgs {
            #[serde(default)]
            id: String,
            title: String,
            #[serde(default)]
            description: String,
            #[serde(default)]
            design: String,
            #[serde(default)]
            acceptance_criteria: String,
            #[serde(default)]
            notes: String,
            #[serde(default)]
            priority: Option<i32>,
            #[serde(default)]
            issue_type: Option<IssueType>,
            #[serde(default)]
            assignee: String,
            #[serde(default)]
            estimated_minutes: Option<i32>,
            #[serde(default)]
            external_ref: Option<String>,
            #[serde(default)]
            labels: Vec<String>,
            #[serde(default)]
            dependencies: Vec<DepSpec>,
        }

        let args: CreateArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };
        let actor = req.actor();

        let mut builder = IssueBuilder::new(&args.title)
            .id(&args.id)
            .description(&args.description)
            .design(&args.design)
            .acceptance_criteria(&args.acceptance_criteria)
            .notes(&args.notes)
            .assignee(&args.assignee)
            .labels(args.labels.clone());
        if let Some(p) = args.priority {
            builder = builder.priority(p);
        }
        if let Some(t) = args.issue_type.clone() {
            builder = builder.issue_type(t);
        }
        if let Some(m) = args.estimated_minutes {
            builder = builder.estimated_minutes(m);
        }
        if let Some(ext) = args.external_ref.clone() {
            builder = builder.external_ref(ext);
        }

        let created = match self.store.create_issue_impl(&builder.build(), actor) {
            Ok(issue) => issue,
            Err(e) => return storage_error(e),
        };

        for dep in &args.dependencies {
            let target = match self.store.resolve_id_impl(&dep.depends_on_id) {
                Ok(id) => id,
                Err(e) => return storage_error(e),
            };
            let edge = Dependency::new(&created.id, &target, dep.dep_type.clone(), actor);
            if let Err(e) = self.store.add_dependency_impl(&edge, actor) {
                return storage_error(e);
            }
        }

        self.mutations.record(MutationKind::Create, &created.id);
        Response::ok(json!({"issue": created}))
    }

    fn op_update(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct UpdateArgs {
            id: String,
            updates: Vec<FieldUpdate>,
        }
        let args: UpdateArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let id = match self.store.resolve_id_impl(&args.id) {
            Ok(id) => id,
            Err(e) => return storage_error(e),
        };
        match self.store.update_issue_impl(&id, &args.updates, req.actor()) {
            Ok(issue) => {
                self.mutations.record(MutationKind::Update, &id);
                Response::ok(json!({"issue": issue}))
            }
            Err(e) => storage_error(e),
        }
    }

    fn op_close(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct CloseArgs {
            id: String,
            #[serde(default)]
            reason: String,
        }
        let args: CloseArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let id = match self.store.resolve_id_impl(&args.id) {
            Ok(id) => id,
            Err(e) => return storage_error(e),
        };
        match self.store.close_issue_impl(&id, &args.reason, req.actor()) {
            Ok(issue) => {
                self.mutations.record(MutationKind::Update, &id);
                Response::ok(json!({"issue": issue}))
            }
            Err(e) => storage_error(e),
        }
    }

    fn op_list(&self, req: &Request) -> Response {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct ListArgs {
            query: String,
            status: Option<Status>,
            issue_type: Option<IssueType>,
            assignee: Option<String>,
            priority: Option<i32>,
            priority_min: Option<i32>,
            priority_max: Option<i32>,
            labels: Vec<String>,
            labels_any: Vec<String>,
            ids: Vec<String>,
            created_after: Option<DateTime<Utc>>,
            created_before: Option<DateTime<Utc>>,
            updated_after: Option<DateTime<Utc>>,
            updated_before: Option<DateTime<Utc>>,
            closed_after: Option<DateTime<Utc>>,
            closed_before: Option<DateTime<Utc>>,
            no_description: bool,
            no_assignee: bool,
            no_labels: bool,
            limit: Option<i32>,
        }
        let args: ListArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let filter = IssueFilter {
            status: args.status,
            issue_type: args.issue_type,
            assignee: args.assignee,
            priority: args.priority,
            priority_min: args.priority_min,
            priority_max: args.priority_max,
            labels: args.labels,
            labels_any: args.labels_any,
            ids: args.ids,
            created_after: args.created_after,
            created_before: args.created_before,
            updated_after: args.updated_after,
            updated_before: args.updated_before,
            closed_after: args.closed_after,
            closed_before: args.closed_before,
            no_description: args.no_description,
            no_assignee: args.no_assignee,
            no_labels: args.no_labels,
            limit: args.limit,
        };

        match self.store.search_issues_impl(&args.query, &filter) {
            Ok(issues) => {
                let count = issues.len();
                Response::ok(json!({"issues": issues, "count": count}))
            }
            Err(e) => storage_error(e),
        }
    }

    fn op_show(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct ShowArgs {
            id: String,
        }
        let args: ShowArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let id = match self.store.resolve_id_impl(&args.id) {
            Ok(id) => id,
            Err(e) => return storage_error(e),
        };
        let result = (|| -> beads_storage::Result<Value> {
            let mut issue = self.store.get_issue_impl(&id)?;
            issue.labels = self.store.get_labels_impl(&id)?;
            issue.dependencies = self.store.get_dependency_records_impl(&id)?;
            let dependents = self.store.get_dependents_with_metadata_impl(&id)?;
            let comments = self.store.get_comments_impl(&id)?;
            let events = self.store.get_events_impl(&id, 100)?;
            Ok(json!({
                "issue": issue,
                "dependents": dependents,
                "comments": comments,
                "events": events,
            }))
        })();
        match result {
            Ok(data) => Response::ok(data),
            Err(e) => storage_error(e),
        }
    }

    // -- Scheduling ----------------------------------------------------------

    fn op_ready(&self, req: &Request) -> Response {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct ReadyArgs {
            priority: Option<i32>,
            assignee: Option<String>,
            labels: Vec<String>,
            labels_any: Vec<String>,
            sort: Option<SortPolicy>,
            limit: Option<i32>,
        }
        let args: ReadyArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let filter = WorkFilter {
            priority: args.priority,
            assignee: args.assignee,
            labels: args.labels,
            labels_any: args.labels_any,
            sort_policy: args.sort.unwrap_or_default(),
            limit: args.limit,
        };
        match self.store.get_ready_work_impl(&filter) {
            Ok(issues) => {
                let count = issues.len();
                Response::ok(json!({"issues": issues, "count": count}))
            }
            Err(e) => storage_error(e),
        }
    }

    fn op_stale(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct StaleArgs {
            #[serde(default = "default_stale_days")]
            days: i64,
            #[serde(default)]
            status: Option<Status>,
            #[serde(default)]
            limit: Option<i32>,
        }
        fn default_stale_days() -> i64 {
            30
        }
        let args: StaleArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let filter = StaleFilter {
            days: args.days,
            status: args.status,
            limit: args.limit,
        };
        match self.store.get_stale_issues_impl(&filter) {
            Ok(issues) => {
                let count = issues.len();
                Response::ok(json!({"issues": issues, "count": count}))
            }
            Err(e) => storage_error(e),
        }
    }

    fn op_stats(&self) -> Response {
        match self.store.get_statistics_impl() {
            Ok(stats) => Response::ok(json!({"statistics": stats})),
            Err(e) => storage_error(e),
        }
    }

    // -- Dependencies --------------------------------------------------------

    fn op_dep_add(&self, req: &Request) -> Response {
        let (from, to, dep_type) = match self.parse_dep_args(&req.args) {
            Ok(parts) => parts,
            Err(resp) => return resp,
        };
        let edge = Dependency::new(&from, &to, dep_type.unwrap_or_default(), req.actor());
        match self.store.add_dependency_impl(&edge, req.actor()) {
            Ok(()) => {
                self.mutations.record(MutationKind::Update, &from);
                self.mutations.record(MutationKind::Update, &to);
                Response::ok(json!({"dependency": edge}))
            }
            Err(e) => storage_error(e),
        }
    }

    fn op_dep_remove(&self, req: &Request) -> Response {
        let (from, to, dep_type) = match self.parse_dep_args(&req.args) {
            Ok(parts) => parts,
            Err(resp) => return resp,
        };
        match self
            .store
            .remove_dependency_impl(&from, &to, req.actor(), dep_type.as_ref())
        {
            Ok(()) => {
                self.mutations.record(MutationKind::Update, &from);
                self.mutations.record(MutationKind::Update, &to);
                Response::ok(json!({"removed": {"issue_id": from, "depends_on_id": to}}))
            }
            Err(e) => storage_error(e),
        }
    }

    /// Shared parser for `dep_add` / `dep_remove`, resolving both ids.
    fn parse_dep_args(
        &self,
        args: &Value,
    ) -> std::result::Result<(String, String, Option<DependencyType>), Response> {
        #[derive(Deserialize)]
        struct DepArgs {
            issue_id: String,
            depends_on_id: String,
            #[serde(rename = "type", default)]
            dep_type: Option<DependencyType>,
        }
        let args: DepArgs = parse_args(args)?;
        let from = self
            .store
            .resolve_id_impl(&args.issue_id)
            .map_err(storage_error)?;
        let to = self
            .store
            .resolve_id_impl(&args.depends_on_id)
            .map_err(storage_error)?;
        Ok((from, to, args.dep_type))
    }

    fn op_dep_tree(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct DepTreeArgs {
            id: String,
            #[serde(default = "default_tree_depth")]
            max_depth: i32,
            #[serde(default)]
            reverse: bool,
        }
        fn default_tree_depth() -> i32 {
            10
        }
        let args: DepTreeArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let id = match self.store.resolve_id_impl(&args.id) {
            Ok(id) => id,
            Err(e) => return storage_error(e),
        };
        match self
            .store
            .get_dependency_tree_impl(&id, args.max_depth, args.reverse)
        {
            Ok(tree) => Response::ok(json!({"tree": tree})),
            Err(e) => storage_error(e),
        }
    }

    // -- Labels and comments -------------------------------------------------

    fn op_label(&self, req: &Request, add: bool) -> Response {
        #[derive(Deserialize)]
        struct LabelArgs {
            id: String,
            label: String,
        }
        let args: LabelArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let id = match self.store.resolve_id_impl(&args.id) {
            Ok(id) => id,
            Err(e) => return storage_error(e),
        };
        let result = if add {
            self.store.add_label_impl(&id, &args.label, req.actor())
        } else {
            self.store.remove_label_impl(&id, &args.label, req.actor())
        };
        match result {
            Ok(()) => {
                self.mutations.record(MutationKind::Update, &id);
                match self.store.get_labels_impl(&id) {
                    Ok(labels) => Response::ok(json!({"id": id, "labels": labels})),
                    Err(e) => storage_error(e),
                }
            }
            Err(e) => storage_error(e),
        }
    }

    fn op_comment_list(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct CommentListArgs {
            id: String,
        }
        let args: CommentListArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let id = match self.store.resolve_id_impl(&args.id) {
            Ok(id) => id,
            Err(e) => return storage_error(e),
        };
        match self.store.get_comments_impl(&id) {
            Ok(comments) => Response::ok(json!({"comments": comments})),
            Err(e) => storage_error(e),
        }
    }

    fn op_comment_add(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct CommentAddArgs {
            id: String,
            text: String,
        }
        let args: CommentAddArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let id = match self.store.resolve_id_impl(&args.id) {
            Ok(id) => id,
            Err(e) => return storage_error(e),
        };
        match self.store.add_comment_impl(&id, req.actor(), &args.text) {
            Ok(comment) => {
                self.mutations.record(MutationKind::Update, &id);
                Response::ok(json!({"comment": comment}))
            }
            Err(e) => storage_error(e),
        }
    }

    // -- Batch ---------------------------------------------------------------

    /// Runs an ordered list of sub-operations, returning a matching
    /// ordered result list. Sub-operation failures do not abort the
    /// batch.
    fn op_batch(&self, req: &Request, cancel: &CancelToken) -> Response {
        #[derive(Deserialize)]
        struct BatchOp {
            operation: String,
            #[serde(default)]
            args: Value,
        }
        #[derive(Deserialize)]
        struct BatchArgs {
            operations: Vec<BatchOp>,
        }
        let args: BatchArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let mut results = Vec::with_capacity(args.operations.len());
        for sub in &args.operations {
            if sub.operation == "batch" {
                results.push(Response::err("validation", "batch cannot nest"));
                continue;
            }
            let mut sub_req = Request::new(&sub.operation, sub.args.clone());
            sub_req.actor = req.actor.clone();
            sub_req.client_version = req.client_version.clone();
            results.push(self.dispatch(&sub.operation, &sub_req, cancel));
        }
        Response::ok(json!({"results": results}))
    }

    // -- Identity ------------------------------------------------------------

    fn op_resolve_id(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct ResolveArgs {
            id: String,
        }
        let args: ResolveArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };
        match self.store.resolve_id_impl(&args.id) {
            Ok(id) => Response::ok(json!({"id": id})),
            Err(e) => storage_error(e),
        }
    }

    // -- Compaction ----------------------------------------------------------

    /// With an id and summary, applies the externally-produced summary;
    /// without an id, lists candidates for the requested level.
    fn op_compact(&self, req: &Request) -> Response {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct CompactArgs {
            id: Option<String>,
            summary: Option<String>,
            commit: Option<String>,
            level: Option<i32>,
        }
        let args: CompactArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        match (args.id, args.summary) {
            (Some(id), Some(summary)) => {
                let id = match self.store.resolve_id_impl(&id) {
                    Ok(id) => id,
                    Err(e) => return storage_error(e),
                };
                match self.store.apply_compaction_impl(
                    &id,
                    &summary,
                    args.commit.as_deref(),
                    req.actor(),
                ) {
                    Ok(issue) => {
                        self.mutations.record(MutationKind::Update, &id);
                        Response::ok(json!({"issue": issue}))
                    }
                    Err(e) => storage_error(e),
                }
            }
            (None, _) => {
                match self
                    .store
                    .get_compaction_candidates_impl(args.level.unwrap_or(1))
                {
                    Ok(candidates) => {
                        let count = candidates.len();
                        Response::ok(json!({"candidates": candidates, "count": count}))
                    }
                    Err(e) => storage_error(e),
                }
            }
            (Some(_), None) => {
                Response::err("validation", "compact with an id requires a summary")
            }
        }
    }

    fn op_compact_stats(&self) -> Response {
        match self.store.get_compaction_stats_impl() {
            Ok(stats) => Response::ok(json!({"compaction": stats})),
            Err(e) => storage_error(e),
        }
    }

    // -- Mirror sync ---------------------------------------------------------

    fn op_export(&self, req: &Request, cancel: &CancelToken) -> Response {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct ExportArgs {
            full: bool,
        }
        let args: ExportArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let result = if args.full {
            beads_sync::export_full(&self.store, &self.mirror_path, cancel)
        } else {
            beads_sync::export_dirty(&self.store, &self.mirror_path, cancel)
        };
        match result {
            Ok(report) => Response::ok(json!({
                "written": report.written,
                "skipped": report.skipped,
                "path": self.mirror_path.display().to_string(),
            })),
            Err(e) => sync_error(e),
        }
    }

    fn op_import(&self, req: &Request, cancel: &CancelToken) -> Response {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct ImportArgs {
            path: Option<String>,
            policy: Option<String>,
        }
        let args: ImportArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };

        let policy = match args.policy.as_deref() {
            None => self.orphan_policy(),
            Some(name) => match OrphanPolicy::parse(name) {
                Some(p) => p,
                None => {
                    return Response::err(
                        "validation",
                        format!("unknown orphan policy: {name}"),
                    );
                }
            },
        };
        let path = args
            .path
            .map(PathBuf::from)
            .unwrap_or_else(|| self.mirror_path.clone());

        match beads_sync::import_mirror(&self.store, &path, policy, None, cancel) {
            Ok(report) => Response::ok(json!({
                "created": report.created,
                "existing": report.existing,
                "skipped": report.issues_skipped,
                "deps_added": report.deps_added,
                "deps_dropped": report.deps_dropped,
            })),
            Err(e) => sync_error(e),
        }
    }

    // -- Epics, mutations, shutdown ------------------------------------------

    fn op_epic_status(&self) -> Response {
        match self.store.get_epics_eligible_for_closure_impl() {
            Ok(epics) => {
                let count = epics.len();
                Response::ok(json!({"epics": epics, "count": count}))
            }
            Err(e) => storage_error(e),
        }
    }

    fn op_get_mutations(&self, req: &Request) -> Response {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct MutationsArgs {
            since_ms: i64,
        }
        let args: MutationsArgs = match parse_args(&req.args) {
            Ok(a) => a,
            Err(resp) => return resp,
        };
        Response::ok(
            serde_json::to_value(self.mutations.since(args.since_ms))
                .unwrap_or_else(|_| json!({"mutations": [], "resync": true})),
        )
    }

    fn op_shutdown(&self) -> Response {
        self.shutdown.cancel();
        Response::ok(json!({"stopping": true}))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Deserializes operation args, turning failures into a validation
/// response. Absent args read as an empty object.
fn parse_args<T: for<'de> Deserialize<'de>>(args: &Value) -> std::result::Result<T, Response> {
    let value = if args.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        args.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| Response::err("validation", format!("invalid arguments: {e}")))
}

/// Maps a storage error onto the wire error taxonomy.
fn storage_error(e: StorageError) -> Response {
    Response::err(e.kind(), e.to_string())
}

/// Maps a sync error onto the wire error taxonomy.
fn sync_error(e: SyncError) -> Response {
    Response::err(e.kind(), e.to_string())
}

/// Canonicalizes for binding comparison; a nonexistent path compares as
/// given.
fn resolve_for_comparison(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
