#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use guardrails_core::{
    cutoff_before_now, decide_close, derive_subtask_id, effective_close_reason, format_rfc3339,
    is_conventional_task_type, new_gate_id, new_history_id, new_root_id, new_template_id,
    normalize_task_type, now_utc, parse_rfc3339_utc, validate_flat_id, validate_task_id,
    CloseChecks, CloseDecision, CloseReadiness, ConfigKey, Dependency, DependencyGraph,
    DependencyType, Gate, GateRun, GateStatus, GateTaskLink, GuardrailsError, HistoryEntry,
    HistoryField, LinkedGate, NewGate, NewTask, NewTemplate, Priority, ProjectMode, Task,
    TaskPatch, TaskStatus, Template, Verification, DEFAULT_ACTOR, GATE_ID_PREFIX,
    SCHEMA_VERSION, TASK_ID_PREFIX, TEMPLATE_ID_PREFIX,
};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

const SCHEMA_MIGRATION_VERSION: i64 = 1;
const BULK_BATCH_SIZE: usize = 100;
const ID_ALLOCATION_ATTEMPTS: usize = 16;
const RECENT_RUNS_LIMIT: usize = 5;
const SUMMARY_HIGH_PRIORITY_LIMIT: usize = 5;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  parent_id TEXT,
  title TEXT NOT NULL CHECK (length(trim(title)) > 0),
  description TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL CHECK (status IN ('open', 'in_progress', 'closed', 'archived')),
  priority INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 4),
  task_type TEXT NOT NULL,
  labels_json TEXT NOT NULL DEFAULT '[]',
  assignee TEXT,
  notes TEXT NOT NULL DEFAULT '',
  close_reason TEXT,
  summary TEXT,
  compacted INTEGER NOT NULL DEFAULT 0 CHECK (compacted IN (0, 1)),
  child_count INTEGER NOT NULL DEFAULT 0 CHECK (child_count >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  closed_at TEXT,
  deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status_priority
  ON tasks(status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_parent
  ON tasks(parent_id);
CREATE INDEX IF NOT EXISTS idx_tasks_closed_at
  ON tasks(closed_at);

CREATE TABLE IF NOT EXISTS dependencies (
  blocker_id TEXT NOT NULL,
  blocked_id TEXT NOT NULL,
  dep_type TEXT NOT NULL DEFAULT 'blocks' CHECK (dep_type IN ('blocks', 'related', 'parent-child')),
  created_at TEXT NOT NULL,
  PRIMARY KEY (blocker_id, blocked_id)
);

CREATE INDEX IF NOT EXISTS idx_dependencies_blocked
  ON dependencies(blocked_id, dep_type);

CREATE TABLE IF NOT EXISTS gates (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL CHECK (length(trim(title)) > 0),
  description TEXT NOT NULL DEFAULT '',
  category TEXT NOT NULL DEFAULT '',
  gate_type TEXT NOT NULL DEFAULT 'manual',
  priority INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 4),
  preconditions TEXT NOT NULL DEFAULT '',
  steps TEXT NOT NULL DEFAULT '',
  expected_result TEXT NOT NULL DEFAULT '',
  command TEXT,
  labels_json TEXT NOT NULL DEFAULT '[]',
  last_result TEXT NOT NULL DEFAULT 'pending' CHECK (last_result IN ('pending', 'passed', 'failed', 'skipped')),
  last_run_at TEXT,
  last_run_by TEXT,
  last_run_notes TEXT,
  run_count INTEGER NOT NULL DEFAULT 0 CHECK (run_count >= 0),
  pass_count INTEGER NOT NULL DEFAULT 0 CHECK (pass_count >= 0),
  fail_count INTEGER NOT NULL DEFAULT 0 CHECK (fail_count >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS gate_task_links (
  gate_id TEXT NOT NULL,
  task_id TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'passed', 'failed', 'skipped')),
  verified_at TEXT,
  verified_by TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  PRIMARY KEY (gate_id, task_id)
);

CREATE INDEX IF NOT EXISTS idx_gate_task_links_task
  ON gate_task_links(task_id, status);

CREATE TABLE IF NOT EXISTS gate_runs (
  run_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  gate_id TEXT NOT NULL,
  task_id TEXT,
  result TEXT NOT NULL CHECK (result IN ('passed', 'failed', 'skipped')),
  run_by TEXT NOT NULL,
  notes TEXT,
  duration_ms INTEGER CHECK (duration_ms >= 0 OR duration_ms IS NULL),
  output TEXT,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_gate_runs_no_update
BEFORE UPDATE ON gate_runs
BEGIN
  SELECT RAISE(FAIL, 'gate_runs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_gate_runs_no_delete
BEFORE DELETE ON gate_runs
BEGIN
  SELECT RAISE(FAIL, 'gate_runs is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_gate_runs_gate_seq
  ON gate_runs(gate_id, run_seq);

CREATE TABLE IF NOT EXISTS task_history (
  history_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  id TEXT NOT NULL UNIQUE,
  task_id TEXT NOT NULL,
  field TEXT NOT NULL CHECK (
    field IN (
      'title',
      'description',
      'priority',
      'type',
      'status',
      'assignee',
      'notes',
      'close_reason',
      'label_added',
      'label_removed',
      'compacted',
      'deleted'
    )
  ),
  old_value TEXT NOT NULL,
  new_value TEXT NOT NULL,
  changed_by TEXT NOT NULL,
  changed_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_task_history_no_update
BEFORE UPDATE ON task_history
BEGIN
  SELECT RAISE(FAIL, 'task_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_task_history_no_delete
BEFORE DELETE ON task_history
BEGIN
  SELECT RAISE(FAIL, 'task_history is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_task_history_task_seq
  ON task_history(task_id, history_seq);

CREATE TABLE IF NOT EXISTS templates (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  title TEXT NOT NULL DEFAULT '',
  description TEXT NOT NULL DEFAULT '',
  priority INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 4),
  task_type TEXT NOT NULL,
  labels_json TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const TASK_COLUMNS: &str = "id, parent_id, title, description, status, priority, task_type,
    labels_json, assignee, notes, close_reason, summary, compacted,
    created_at, updated_at, closed_at, deleted_at";

const GATE_COLUMNS: &str = "id, title, description, category, gate_type, priority,
    preconditions, steps, expected_result, command, labels_json,
    last_result, last_run_at, last_run_by, last_run_notes,
    run_count, pass_count, fail_count, created_at, updated_at";

const LINK_COLUMNS: &str =
    "gate_id, task_id, status, verified_at, verified_by, notes, created_at";

const RUN_COLUMNS: &str =
    "run_seq, gate_id, task_id, result, run_by, notes, duration_ms, output, created_at";

const HISTORY_COLUMNS: &str =
    "id, task_id, field, old_value, new_value, changed_by, changed_at";

const TEMPLATE_COLUMNS: &str =
    "id, name, title, description, priority, task_type, labels_json, created_at";

/// Closed and archived tasks never count as open blockers or open subtasks.
const OPEN_STATUS_SQL: &str = "('open', 'in_progress')";

/// Source of interactive confirmation for operations that bypass or weaken
/// a gate. Implementations that are not attached to a terminal must report
/// `is_interactive() == false`; the store then refuses instead of asking.
pub trait Confirmer {
    fn is_interactive(&self) -> bool;

    /// Returns `true` only for an explicit affirmative answer.
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// Refuses every confirmation. Used for scripted and embedded callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Confirmer for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

pub struct SqliteTaskStore {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub reason: String,
    pub force: bool,
    pub actor: String,
}

impl CloseRequest {
    #[must_use]
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            force: false,
            actor: DEFAULT_ACTOR.to_string(),
        }
    }

    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    #[must_use]
    pub fn by(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub task_type: Option<String>,
    pub assignee: Option<String>,
    pub label: Option<String>,
    pub parent_id: Option<String>,
    pub include_archived: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateFilter {
    pub category: Option<String>,
    pub gate_type: Option<String>,
    pub last_result: Option<GateStatus>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DependencyView {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub dep_type: DependencyType,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskDependencies {
    pub task_id: String,
    pub blocked_by: Vec<DependencyView>,
    pub blocks: Vec<DependencyView>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LinkedTask {
    pub task_id: String,
    pub task_title: String,
    pub link: GateTaskLink,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GateDetails {
    pub gate: Gate,
    pub pass_rate: f64,
    pub linked_tasks: Vec<LinkedTask>,
    pub recent_runs: Vec<GateRun>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BulkReport {
    pub matched: usize,
    pub processed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompactedTask {
    pub task_id: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompactionReport {
    pub dry_run: bool,
    pub matched: usize,
    pub compacted: Vec<CompactedTask>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_priority: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskBrief {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProjectSummary {
    pub by_status: BTreeMap<String, i64>,
    pub created_last_24h: i64,
    pub closed_last_24h: i64,
    pub high_priority_open: Vec<TaskBrief>,
    pub compacted: i64,
    pub compactable: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EdgeRef {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub orphaned_dependencies: Vec<EdgeRef>,
    pub orphaned_gate_links: Vec<EdgeRef>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PurgeReport {
    pub tasks: usize,
    pub dependencies: usize,
    pub gate_links: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

enum Attempt<T> {
    Done(T),
    NeedsConfirmation { detail: String, action: String },
}

impl SqliteTaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;",
        )
        .context("failed to configure sqlite pragmas")?;

        debug!(path = %path.display(), "opened task store");
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply task schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_MIGRATION_VERSION, now],
            )
            .context("failed to register task schema migration")?;

        for (key, value) in [
            (ConfigKey::SchemaVersion, SCHEMA_VERSION),
            (ConfigKey::IdPrefix, TASK_ID_PREFIX),
        ] {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO config(key, value, updated_at) VALUES (?1, ?2, ?3)",
                    params![key.as_str(), value, now],
                )
                .with_context(|| format!("failed to seed config key {}", key.as_str()))?;
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Config
    // -----------------------------------------------------------------------

    /// Records project identity. `initialized_at` is written once and kept on
    /// re-initialisation.
    pub fn initialize_project(&self, project_name: &str, mode: ProjectMode) -> Result<()> {
        ConfigKey::ProjectName.validate_value(project_name)?;
        let now = format_rfc3339(now_utc())?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO config(key, value, updated_at) VALUES (?1, ?2, ?2)",
                params![ConfigKey::InitializedAt.as_str(), now],
            )
            .context("failed to record initialized_at")?;
        put_config(&self.conn, ConfigKey::ProjectName, project_name.trim(), &now)?;
        put_config(&self.conn, ConfigKey::Mode, mode.as_str(), &now)?;

        info!(project = project_name, mode = mode.as_str(), "project initialized");
        Ok(())
    }

    pub fn set_config(&self, key: ConfigKey, value: &str) -> Result<()> {
        key.validate_value(value)?;
        let now = format_rfc3339(now_utc())?;
        put_config(&self.conn, key, value.trim(), &now)
    }

    pub fn get_config(&self, key: ConfigKey) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read config key {}", key.as_str()))
    }

    pub fn list_config(&self) -> Result<Vec<ConfigEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM config ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(ConfigEntry {
                key: row.get(0)?,
                value: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub fn create_task(&mut self, request: &NewTask, actor: &str) -> Result<Task> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start create transaction")?;

        let template = match request.template.as_deref() {
            Some(name_or_id) => Some(find_template(&tx, name_or_id)?.ok_or_else(|| {
                GuardrailsError::NotFound(format!("template {name_or_id} not found"))
            })?),
            None => None,
        };
        let draft = request.resolve(template.as_ref())?;
        if !is_conventional_task_type(&draft.task_type) {
            warn!(task_type = %draft.task_type, "creating task with unconventional type");
        }

        let id = match draft.parent_id.as_deref() {
            Some(parent_id) => {
                let parent = require_task(&tx, parent_id)?;
                if !parent.status.is_active() {
                    return Err(GuardrailsError::InvariantViolation(format!(
                        "cannot add subtask to task {}: status is {}",
                        parent.id, parent.status
                    ))
                    .into());
                }
                let ordinal = next_child_ordinal(&tx, parent_id)?;
                let id = derive_subtask_id(parent_id, ordinal);
                if task_row_exists(&tx, &id)? {
                    return Err(GuardrailsError::InvariantViolation(format!(
                        "subtask id {id} is already taken"
                    ))
                    .into());
                }
                id
            }
            None => fresh_id(&tx, "tasks", new_root_id)?,
        };

        let now = now_utc();
        let task = Task {
            id,
            parent_id: draft.parent_id,
            title: draft.title,
            description: draft.description,
            status: TaskStatus::Open,
            priority: draft.priority,
            task_type: draft.task_type,
            labels: draft.labels,
            assignee: draft.assignee,
            notes: String::new(),
            close_reason: None,
            summary: None,
            compacted: false,
            created_at: now,
            updated_at: now,
            closed_at: None,
            deleted_at: None,
        };
        task.validate()?;
        insert_task(&tx, &task)?;
        tx.commit().context("failed to commit create transaction")?;

        info!(task_id = %task.id, actor, parent = ?task.parent_id, "task created");
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        validate_task_id(task_id)?;
        find_task(&self.conn, task_id)
    }

    /// Like [`SqliteTaskStore::get_task`] but a missing task is a not-found error.
    pub fn require_task(&self, task_id: &str) -> Result<Task> {
        validate_task_id(task_id)?;
        require_task(&self.conn, task_id)
    }

    pub fn update_task(
        &mut self,
        task_id: &str,
        patch: &TaskPatch,
        actor: &str,
        confirmer: &mut dyn Confirmer,
    ) -> Result<Task> {
        validate_task_id(task_id)?;
        if patch.is_empty() {
            return Err(GuardrailsError::Validation(format!(
                "no changes requested for task {task_id}"
            ))
            .into());
        }

        match self.try_update(task_id, patch, actor, false)? {
            Attempt::Done(task) => Ok(task),
            Attempt::NeedsConfirmation { detail, action } => {
                seek_confirmation(confirmer, &detail, &action)?;
                match self.try_update(task_id, patch, actor, true)? {
                    Attempt::Done(task) => Ok(task),
                    Attempt::NeedsConfirmation { .. } => Err(anyhow!(
                        "update of task {task_id} still requires confirmation after it was granted"
                    )),
                }
            }
        }
    }

    fn try_update(
        &mut self,
        task_id: &str,
        patch: &TaskPatch,
        actor: &str,
        scope_change_confirmed: bool,
    ) -> Result<Attempt<Task>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start update transaction")?;
        let mut task = require_task(&tx, task_id)?;
        patch.validate_status_change(&task)?;

        if patch.changes_scope() && !scope_change_confirmed {
            let passed: Vec<LinkedGate> = linked_gates(&tx, task_id)?
                .into_iter()
                .filter(|gate| gate.status == GateStatus::Passed)
                .collect();
            if !passed.is_empty() {
                let listed = passed
                    .iter()
                    .map(|gate| format!("{} ({})", gate.gate_id, gate.gate_title))
                    .collect::<Vec<_>>()
                    .join(", ");
                tx.rollback().context("failed to roll back update transaction")?;
                return Ok(Attempt::NeedsConfirmation {
                    detail: format!(
                        "task {task_id} has {} passed gate(s): {listed}; changing title, description or type may change the scope of verified work",
                        passed.len()
                    ),
                    action: format!("update task {task_id}"),
                });
            }
        }

        let now = now_utc();
        let history = HistoryWriter::new(&tx, task_id, actor, now);
        let mut changed = false;

        if let Some(title) = patch.title.as_deref() {
            let title = title.trim();
            if title.is_empty() {
                return Err(GuardrailsError::Validation(format!(
                    "title for task {task_id} MUST NOT be blank"
                ))
                .into());
            }
            changed |= history.record(HistoryField::Title, &task.title, title)?;
            task.title = title.to_string();
        }
        if let Some(description) = patch.description.as_deref() {
            changed |= history.record(HistoryField::Description, &task.description, description)?;
            task.description = description.to_string();
        }
        if let Some(priority) = patch.priority {
            changed |= history.record(
                HistoryField::Priority,
                &task.priority.value().to_string(),
                &priority.value().to_string(),
            )?;
            task.priority = priority;
        }
        if let Some(raw_type) = patch.task_type.as_deref() {
            let task_type = normalize_task_type(raw_type)?;
            changed |= history.record(HistoryField::Type, &task.task_type, &task_type)?;
            task.task_type = task_type;
        }
        if let Some(status) = patch.status {
            changed |= history.record(HistoryField::Status, task.status.as_str(), status.as_str())?;
            task.status = status;
        }
        if let Some(assignee) = patch.assignee.as_deref() {
            let assignee = assignee.trim();
            changed |= history.record(
                HistoryField::Assignee,
                task.assignee.as_deref().unwrap_or(""),
                assignee,
            )?;
            task.assignee = if assignee.is_empty() {
                None
            } else {
                Some(assignee.to_string())
            };
        }
        if let Some(note) = patch.notes.as_deref().filter(|note| !note.trim().is_empty()) {
            let line = task.append_notes(note.trim(), now)?;
            changed |= history.record(HistoryField::Notes, "", &line)?;
        }
        for label in &patch.add_labels {
            let label = label.trim();
            if !label.is_empty() && task.add_label(label) {
                changed |= history.record(HistoryField::LabelAdded, "", label)?;
            }
        }
        for label in &patch.remove_labels {
            if task.remove_label(label.trim()) {
                changed |= history.record(HistoryField::LabelRemoved, label.trim(), "")?;
            }
        }

        if changed {
            task.updated_at = now;
            task.validate()?;
            write_task(&tx, &task)?;
        }
        tx.commit().context("failed to commit update transaction")?;

        if changed {
            info!(task_id, actor, "task updated");
        } else {
            debug!(task_id, "update produced no changes");
        }
        Ok(Attempt::Done(task))
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut clauses = vec!["deleted_at IS NULL".to_string()];
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(status) = filter.status {
            values.push(status.as_str().to_string().into());
            clauses.push(format!("status = ?{}", values.len()));
        } else if !filter.include_archived {
            clauses.push("status != 'archived'".to_string());
        }
        if let Some(priority) = filter.priority {
            values.push(i64::from(priority.value()).into());
            clauses.push(format!("priority = ?{}", values.len()));
        }
        if let Some(task_type) = filter.task_type.as_deref() {
            values.push(normalize_task_type(task_type)?.into());
            clauses.push(format!("task_type = ?{}", values.len()));
        }
        if let Some(assignee) = filter.assignee.as_deref() {
            values.push(assignee.to_string().into());
            clauses.push(format!("assignee = ?{}", values.len()));
        }
        if let Some(label) = filter.label.as_deref() {
            values.push(label.to_string().into());
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(tasks.labels_json) WHERE json_each.value = ?{})",
                values.len()
            ));
        }
        if let Some(parent_id) = filter.parent_id.as_deref() {
            validate_task_id(parent_id)?;
            values.push(parent_id.to_string().into());
            clauses.push(format!("parent_id = ?{}", values.len()));
        }

        let mut query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE {} ORDER BY priority ASC, created_at DESC, rowid DESC",
            clauses.join(" AND ")
        );
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_task_row)?;
        collect_rows(rows)
    }

    /// Case-insensitive substring search over title and description.
    pub fn search_tasks(&self, needle: &str, limit: Option<usize>) -> Result<Vec<Task>> {
        if needle.trim().is_empty() {
            return Err(GuardrailsError::Validation("search query MUST NOT be blank".to_string()).into());
        }
        let pattern = format!("%{}%", escape_like(needle.trim()));

        let mut query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE deleted_at IS NULL
               AND (title LIKE ?1 ESCAPE '\\' OR description LIKE ?1 ESCAPE '\\')
             ORDER BY priority ASC, created_at DESC, rowid DESC"
        );
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![pattern], parse_task_row)?;
        collect_rows(rows)
    }

    /// Soft delete. The row stays until [`SqliteTaskStore::purge_deleted`].
    pub fn delete_task(&mut self, task_id: &str, actor: &str) -> Result<Task> {
        validate_task_id(task_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start delete transaction")?;
        let mut task = require_task(&tx, task_id)?;

        let now = now_utc();
        task.deleted_at = Some(now);
        task.updated_at = now;
        write_task(&tx, &task)?;
        HistoryWriter::new(&tx, task_id, actor, now).record(HistoryField::Deleted, "false", "true")?;
        tx.commit().context("failed to commit delete transaction")?;

        info!(task_id, actor, "task soft-deleted");
        Ok(task)
    }

    /// Physically removes soft-deleted tasks with their edges and gate links.
    /// History entries are kept.
    pub fn purge_deleted(&mut self) -> Result<PurgeReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start purge transaction")?;

        let dependencies = tx
            .execute(
                "DELETE FROM dependencies
                 WHERE blocker_id IN (SELECT id FROM tasks WHERE deleted_at IS NOT NULL)
                    OR blocked_id IN (SELECT id FROM tasks WHERE deleted_at IS NOT NULL)",
                [],
            )
            .context("failed to purge dependency edges")?;
        let gate_links = tx
            .execute(
                "DELETE FROM gate_task_links
                 WHERE task_id IN (SELECT id FROM tasks WHERE deleted_at IS NOT NULL)",
                [],
            )
            .context("failed to purge gate links")?;
        let tasks = tx
            .execute("DELETE FROM tasks WHERE deleted_at IS NOT NULL", [])
            .context("failed to purge tasks")?;
        tx.commit().context("failed to commit purge transaction")?;

        info!(tasks, dependencies, gate_links, "purged deleted tasks");
        Ok(PurgeReport {
            tasks,
            dependencies,
            gate_links,
        })
    }

    // -----------------------------------------------------------------------
    // Closure workflow
    // -----------------------------------------------------------------------

    /// Closes a task after checking blockers, subtasks and gates inside one
    /// immediate transaction. A forced close may bypass unready gates, but
    /// only after `confirmer` agrees; the checks are then re-run in a fresh
    /// transaction before anything is written.
    pub fn close_task(
        &mut self,
        task_id: &str,
        request: &CloseRequest,
        confirmer: &mut dyn Confirmer,
    ) -> Result<Task> {
        validate_task_id(task_id)?;
        if request.reason.trim().is_empty() {
            return Err(GuardrailsError::Validation(format!(
                "closing task {task_id} requires a reason"
            ))
            .into());
        }

        match self.try_close(task_id, request, false)? {
            Attempt::Done(task) => Ok(task),
            Attempt::NeedsConfirmation { detail, action } => {
                seek_confirmation(confirmer, &detail, &action)?;
                match self.try_close(task_id, request, true)? {
                    Attempt::Done(task) => Ok(task),
                    Attempt::NeedsConfirmation { .. } => Err(anyhow!(
                        "close of task {task_id} still requires confirmation after it was granted"
                    )),
                }
            }
        }
    }

    fn try_close(
        &mut self,
        task_id: &str,
        request: &CloseRequest,
        override_granted: bool,
    ) -> Result<Attempt<Task>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start close transaction")?;
        let mut task = require_task(&tx, task_id)?;
        let checks = gather_close_checks(&tx, &task)?;

        let gate_override = match decide_close(&task, &checks, request.force, override_granted)? {
            CloseDecision::Proceed { gate_override } => gate_override,
            CloseDecision::ConfirmGateOverride(readiness) => {
                tx.rollback().context("failed to roll back close transaction")?;
                let failure = readiness
                    .describe_failure()
                    .unwrap_or_else(|| format!("task {task_id} is not gate-ready"));
                return Ok(Attempt::NeedsConfirmation {
                    detail: format!("{failure}. Forcing bypasses the gate requirement"),
                    action: format!("force close task {task_id}"),
                });
            }
        };

        let reason = effective_close_reason(request.reason.trim(), gate_override);
        let previous_status = task.status;
        let now = now_utc();
        task.apply_close(&reason, now)?;
        write_task(&tx, &task)?;

        let history = HistoryWriter::new(&tx, task_id, &request.actor, now);
        history.record(HistoryField::Status, previous_status.as_str(), TaskStatus::Closed.as_str())?;
        history.record(HistoryField::CloseReason, "", &reason)?;
        tx.commit().context("failed to commit close transaction")?;

        if gate_override {
            warn!(task_id, actor = %request.actor, "task force-closed with unverified gates");
        } else {
            info!(task_id, actor = %request.actor, "task closed");
        }
        Ok(Attempt::Done(task))
    }

    /// Blockers, open subtasks and gate readiness as a close would see them.
    pub fn close_checks(&self, task_id: &str) -> Result<CloseChecks> {
        let task = self.require_task(task_id)?;
        gather_close_checks(&self.conn, &task)
    }

    pub fn reopen_task(&mut self, task_id: &str, actor: &str) -> Result<Task> {
        validate_task_id(task_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reopen transaction")?;
        let mut task = require_task(&tx, task_id)?;

        let previous_reason = task.close_reason.clone().unwrap_or_default();
        let now = now_utc();
        task.apply_reopen(now)?;
        write_task(&tx, &task)?;

        let history = HistoryWriter::new(&tx, task_id, actor, now);
        history.record(HistoryField::Status, TaskStatus::Closed.as_str(), TaskStatus::Open.as_str())?;
        history.record(HistoryField::CloseReason, &previous_reason, "")?;
        tx.commit().context("failed to commit reopen transaction")?;

        info!(task_id, actor, "task reopened");
        Ok(task)
    }

    pub fn archive_task(&mut self, task_id: &str, actor: &str) -> Result<Task> {
        self.transition(task_id, actor, Task::apply_archive, "archive")
    }

    pub fn unarchive_task(&mut self, task_id: &str, actor: &str) -> Result<Task> {
        self.transition(task_id, actor, Task::apply_unarchive, "unarchive")
    }

    fn transition(
        &mut self,
        task_id: &str,
        actor: &str,
        apply: fn(&mut Task, OffsetDateTime) -> Result<(), GuardrailsError>,
        label: &str,
    ) -> Result<Task> {
        validate_task_id(task_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start {label} transaction"))?;
        let mut task = require_task(&tx, task_id)?;

        let previous_status = task.status;
        let now = now_utc();
        apply(&mut task, now)?;
        write_task(&tx, &task)?;
        HistoryWriter::new(&tx, task_id, actor, now).record(
            HistoryField::Status,
            previous_status.as_str(),
            task.status.as_str(),
        )?;
        tx.commit()
            .with_context(|| format!("failed to commit {label} transaction"))?;

        info!(task_id, actor, status = task.status.as_str(), "task {label}d");
        Ok(task)
    }

    /// Archives every closed task, or only those closed more than
    /// `older_than` ago. Runs in transactions of at most 100 tasks.
    pub fn archive_closed(&mut self, older_than: Option<Duration>, actor: &str) -> Result<BulkReport> {
        let cutoff = cutoff_text(older_than)?;
        let ids = query_ids(
            &self.conn,
            "SELECT id FROM tasks
             WHERE deleted_at IS NULL
               AND status = 'closed'
               AND (?1 IS NULL OR closed_at < ?1)
             ORDER BY closed_at ASC, id ASC",
            cutoff.as_deref(),
        )?;

        let mut report = BulkReport {
            matched: ids.len(),
            processed: Vec::with_capacity(ids.len()),
        };
        for batch in ids.chunks(BULK_BATCH_SIZE) {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start archive batch")?;
            let now = now_utc();
            for task_id in batch {
                let mut task = require_task(&tx, task_id)?;
                if task.status != TaskStatus::Closed {
                    continue;
                }
                task.apply_archive(now)?;
                write_task(&tx, &task)?;
                HistoryWriter::new(&tx, task_id, actor, now).record(
                    HistoryField::Status,
                    TaskStatus::Closed.as_str(),
                    TaskStatus::Archived.as_str(),
                )?;
                report.processed.push(task_id.clone());
            }
            tx.commit().context("failed to commit archive batch")?;
            debug!(batch = batch.len(), "archive batch committed");
        }

        info!(matched = report.matched, archived = report.processed.len(), "bulk archive finished");
        Ok(report)
    }

    pub fn compact_task(&mut self, task_id: &str, dry_run: bool, actor: &str) -> Result<Task> {
        validate_task_id(task_id)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start compact transaction")?;
        let mut task = require_task(&tx, task_id)?;

        let now = now_utc();
        task.apply_compaction(now)?;
        if dry_run {
            tx.rollback().context("failed to roll back compact dry run")?;
            return Ok(task);
        }

        write_task(&tx, &task)?;
        HistoryWriter::new(&tx, task_id, actor, now).record(HistoryField::Compacted, "false", "true")?;
        tx.commit().context("failed to commit compact transaction")?;

        info!(task_id, "task compacted");
        Ok(task)
    }

    /// Compacts every closed or archived task not yet compacted, optionally
    /// only those closed more than `older_than` ago. Batched by 100.
    pub fn compact_all(
        &mut self,
        older_than: Option<Duration>,
        dry_run: bool,
        actor: &str,
    ) -> Result<CompactionReport> {
        let cutoff = cutoff_text(older_than)?;
        let ids = query_ids(
            &self.conn,
            "SELECT id FROM tasks
             WHERE deleted_at IS NULL
               AND status IN ('closed', 'archived')
               AND compacted = 0
               AND (?1 IS NULL OR closed_at < ?1)
             ORDER BY closed_at ASC, id ASC",
            cutoff.as_deref(),
        )?;

        let mut report = CompactionReport {
            dry_run,
            matched: ids.len(),
            compacted: Vec::with_capacity(ids.len()),
        };
        for batch in ids.chunks(BULK_BATCH_SIZE) {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start compact batch")?;
            let now = now_utc();
            for task_id in batch {
                let mut task = require_task(&tx, task_id)?;
                if task.ensure_compactable().is_err() {
                    continue;
                }
                task.apply_compaction(now)?;
                if !dry_run {
                    write_task(&tx, &task)?;
                    HistoryWriter::new(&tx, task_id, actor, now).record(
                        HistoryField::Compacted,
                        "false",
                        "true",
                    )?;
                }
                report.compacted.push(CompactedTask {
                    task_id: task.id.clone(),
                    summary: task.summary.clone().unwrap_or_default(),
                });
            }
            if dry_run {
                tx.rollback().context("failed to roll back compact dry run")?;
            } else {
                tx.commit().context("failed to commit compact batch")?;
            }
        }

        info!(matched = report.matched, compacted = report.compacted.len(), dry_run, "bulk compaction finished");
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Dependencies
    // -----------------------------------------------------------------------

    /// Adds a `blocks` edge: `blocker_id` must close before `blocked_id`.
    pub fn add_blocker(&mut self, blocker_id: &str, blocked_id: &str) -> Result<Dependency> {
        self.add_dependency(blocker_id, blocked_id, DependencyType::Blocks)
    }

    pub fn add_dependency(
        &mut self,
        blocker_id: &str,
        blocked_id: &str,
        dep_type: DependencyType,
    ) -> Result<Dependency> {
        validate_task_id(blocker_id)?;
        validate_task_id(blocked_id)?;
        if blocker_id == blocked_id {
            return Err(GuardrailsError::InvariantViolation(format!(
                "task cannot block itself: {blocker_id}"
            ))
            .into());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start dependency transaction")?;
        require_task(&tx, blocker_id)?;
        require_task(&tx, blocked_id)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT dep_type FROM dependencies WHERE blocker_id = ?1 AND blocked_id = ?2",
                params![blocker_id, blocked_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up existing dependency")?;
        if let Some(existing) = existing {
            return Err(GuardrailsError::InvariantViolation(format!(
                "dependency {blocker_id} -> {blocked_id} already exists ({existing})"
            ))
            .into());
        }

        if dep_type == DependencyType::Blocks {
            load_blocks_graph(&tx)?.check_new_edge(blocker_id, blocked_id)?;
        }

        let created_at = now_utc();
        tx.execute(
            "INSERT INTO dependencies(blocker_id, blocked_id, dep_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![blocker_id, blocked_id, dep_type.as_str(), format_rfc3339(created_at)?],
        )
        .context("failed to insert dependency")?;
        tx.commit().context("failed to commit dependency transaction")?;

        info!(blocker_id, blocked_id, dep_type = dep_type.as_str(), "dependency added");
        Ok(Dependency {
            blocker_id: blocker_id.to_string(),
            blocked_id: blocked_id.to_string(),
            dep_type,
            created_at,
        })
    }

    pub fn remove_dependency(&mut self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        validate_task_id(blocker_id)?;
        validate_task_id(blocked_id)?;
        require_task(&self.conn, blocker_id)?;
        require_task(&self.conn, blocked_id)?;

        let removed = self
            .conn
            .execute(
                "DELETE FROM dependencies WHERE blocker_id = ?1 AND blocked_id = ?2",
                params![blocker_id, blocked_id],
            )
            .context("failed to delete dependency")?;
        if removed == 0 {
            return Err(GuardrailsError::NotFound(format!(
                "dependency not found: {blocker_id} does not block {blocked_id}"
            ))
            .into());
        }

        info!(blocker_id, blocked_id, "dependency removed");
        Ok(())
    }

    /// Ids of tasks blocking `task_id` through a `blocks` edge that are still
    /// open or in progress.
    pub fn open_blockers_of(&self, task_id: &str) -> Result<Vec<String>> {
        validate_task_id(task_id)?;
        open_blockers(&self.conn, task_id)
    }

    pub fn list_dependencies(&self, task_id: &str) -> Result<TaskDependencies> {
        self.require_task(task_id)?;

        let blocked_by = dependency_views(
            &self.conn,
            "SELECT t.id, t.title, t.status, d.dep_type
             FROM dependencies d JOIN tasks t ON t.id = d.blocker_id
             WHERE d.blocked_id = ?1 AND t.deleted_at IS NULL
             ORDER BY d.created_at ASC, t.id ASC",
            task_id,
        )?;
        let blocks = dependency_views(
            &self.conn,
            "SELECT t.id, t.title, t.status, d.dep_type
             FROM dependencies d JOIN tasks t ON t.id = d.blocked_id
             WHERE d.blocker_id = ?1 AND t.deleted_at IS NULL
             ORDER BY d.created_at ASC, t.id ASC",
            task_id,
        )?;

        Ok(TaskDependencies {
            task_id: task_id.to_string(),
            blocked_by,
            blocks,
        })
    }

    /// Open or in-progress tasks with zero open blockers.
    pub fn ready_tasks(&self, limit: Option<usize>) -> Result<Vec<Task>> {
        let mut query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE deleted_at IS NULL
               AND status IN {OPEN_STATUS_SQL}
               AND NOT EXISTS (
                 SELECT 1 FROM dependencies d JOIN tasks b ON b.id = d.blocker_id
                 WHERE d.blocked_id = tasks.id
                   AND d.dep_type = 'blocks'
                   AND b.deleted_at IS NULL
                   AND b.status IN {OPEN_STATUS_SQL}
               )
             ORDER BY priority ASC, created_at DESC, rowid DESC"
        );
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], parse_task_row)?;
        collect_rows(rows)
    }

    /// Current `blocks` edges as an in-memory graph.
    pub fn dependency_graph(&self) -> Result<DependencyGraph> {
        load_blocks_graph(&self.conn)
    }

    // -----------------------------------------------------------------------
    // Gates
    // -----------------------------------------------------------------------

    pub fn create_gate(&mut self, input: NewGate) -> Result<Gate> {
        input.validate()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start gate transaction")?;
        let id = fresh_id(&tx, "gates", new_gate_id)?;
        let gate = input.into_gate(id, now_utc());

        tx.execute(
            &format!(
                "INSERT INTO gates({GATE_COLUMNS}) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20
                 )"
            ),
            params![
                gate.id,
                gate.title,
                gate.description,
                gate.category,
                gate.gate_type,
                i64::from(gate.priority.value()),
                gate.preconditions,
                gate.steps,
                gate.expected_result,
                gate.command,
                labels_to_sql(&gate.labels)?,
                gate.last_result.as_str(),
                optional_timestamp(gate.last_run_at)?,
                gate.last_run_by,
                gate.last_run_notes,
                i64::from(gate.run_count),
                i64::from(gate.pass_count),
                i64::from(gate.fail_count),
                format_rfc3339(gate.created_at)?,
                format_rfc3339(gate.updated_at)?,
            ],
        )
        .context("failed to insert gate")?;
        tx.commit().context("failed to commit gate transaction")?;

        info!(gate_id = %gate.id, title = %gate.title, "gate created");
        Ok(gate)
    }

    pub fn get_gate(&self, gate_id: &str) -> Result<Option<Gate>> {
        validate_flat_id(gate_id, GATE_ID_PREFIX)?;
        find_gate(&self.conn, gate_id)
    }

    pub fn list_gates(&self, filter: &GateFilter) -> Result<Vec<Gate>> {
        let mut clauses = vec!["1 = 1".to_string()];
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(category) = filter.category.as_deref() {
            values.push(category.to_string().into());
            clauses.push(format!("category = ?{}", values.len()));
        }
        if let Some(gate_type) = filter.gate_type.as_deref() {
            values.push(gate_type.to_string().into());
            clauses.push(format!("gate_type = ?{}", values.len()));
        }
        if let Some(result) = filter.last_result {
            values.push(result.as_str().to_string().into());
            clauses.push(format!("last_result = ?{}", values.len()));
        }

        let query = format!(
            "SELECT {GATE_COLUMNS} FROM gates WHERE {}
             ORDER BY priority ASC, category ASC, created_at DESC, rowid DESC",
            clauses.join(" AND ")
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_gate_row)?;
        collect_rows(rows)
    }

    pub fn link_gate(&mut self, gate_id: &str, task_id: &str) -> Result<GateTaskLink> {
        validate_flat_id(gate_id, GATE_ID_PREFIX)?;
        validate_task_id(task_id)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start link transaction")?;
        require_gate(&tx, gate_id)?;
        require_task(&tx, task_id)?;
        if find_link(&tx, gate_id, task_id)?.is_some() {
            return Err(GuardrailsError::InvariantViolation(format!(
                "gate {gate_id} is already linked to task {task_id}"
            ))
            .into());
        }

        let link = GateTaskLink::pending(gate_id, task_id, now_utc());
        tx.execute(
            &format!("INSERT INTO gate_task_links({LINK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                link.gate_id,
                link.task_id,
                link.status.as_str(),
                optional_timestamp(link.verified_at)?,
                link.verified_by,
                link.notes,
                format_rfc3339(link.created_at)?,
            ],
        )
        .context("failed to insert gate link")?;
        tx.commit().context("failed to commit link transaction")?;

        info!(gate_id, task_id, "gate linked");
        Ok(link)
    }

    pub fn unlink_gate(&mut self, gate_id: &str, task_id: &str) -> Result<()> {
        validate_flat_id(gate_id, GATE_ID_PREFIX)?;
        validate_task_id(task_id)?;

        let removed = self
            .conn
            .execute(
                "DELETE FROM gate_task_links WHERE gate_id = ?1 AND task_id = ?2",
                params![gate_id, task_id],
            )
            .context("failed to delete gate link")?;
        if removed == 0 {
            return Err(GuardrailsError::NotFound(format!(
                "gate {gate_id} is not linked to task {task_id}"
            ))
            .into());
        }

        info!(gate_id, task_id, "gate unlinked");
        Ok(())
    }

    /// Records a pass, fail or skip for one gate on one task. The link must
    /// already exist. Also bumps the gate's lifetime counters and appends a
    /// run record.
    pub fn record_verification(
        &mut self,
        gate_id: &str,
        task_id: &str,
        verification: &Verification,
    ) -> Result<GateTaskLink> {
        validate_flat_id(gate_id, GATE_ID_PREFIX)?;
        validate_task_id(task_id)?;
        if verification.verifier.trim().is_empty() {
            return Err(GuardrailsError::Validation(
                "verifier MUST be provided for every verification".to_string(),
            )
            .into());
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start verification transaction")?;
        let mut gate = require_gate(&tx, gate_id)?;
        require_task(&tx, task_id)?;
        let mut link = find_link(&tx, gate_id, task_id)?.ok_or_else(|| {
            GuardrailsError::NotFound(format!(
                "gate {gate_id} is not linked to task {task_id}; link it before recording a result"
            ))
        })?;

        let now = now_utc();
        let verifier = verification.verifier.trim();
        let notes = verification.notes.as_deref();
        link.apply_verification(verification.outcome, verifier, notes, now);
        gate.record_run(verification.outcome, verifier, notes, now);

        tx.execute(
            "UPDATE gate_task_links
             SET status = ?3, verified_at = ?4, verified_by = ?5, notes = ?6
             WHERE gate_id = ?1 AND task_id = ?2",
            params![
                gate_id,
                task_id,
                link.status.as_str(),
                optional_timestamp(link.verified_at)?,
                link.verified_by,
                link.notes,
            ],
        )
        .context("failed to update gate link")?;
        tx.execute(
            "UPDATE gates
             SET last_result = ?2, last_run_at = ?3, last_run_by = ?4, last_run_notes = ?5,
                 run_count = ?6, pass_count = ?7, fail_count = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                gate_id,
                gate.last_result.as_str(),
                optional_timestamp(gate.last_run_at)?,
                gate.last_run_by,
                gate.last_run_notes,
                i64::from(gate.run_count),
                i64::from(gate.pass_count),
                i64::from(gate.fail_count),
                format_rfc3339(gate.updated_at)?,
            ],
        )
        .context("failed to update gate counters")?;
        let duration_ms = verification
            .duration_ms
            .map(i64::try_from)
            .transpose()
            .context("duration_ms does not fit in a sqlite integer")?;
        tx.execute(
            "INSERT INTO gate_runs(gate_id, task_id, result, run_by, notes, duration_ms, output, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                gate_id,
                task_id,
                link.status.as_str(),
                verifier,
                notes,
                duration_ms,
                verification.output,
                format_rfc3339(now)?,
            ],
        )
        .context("failed to append gate run")?;
        tx.commit().context("failed to commit verification transaction")?;

        info!(gate_id, task_id, result = link.status.as_str(), verifier, "gate verification recorded");
        Ok(link)
    }

    /// Ready iff at least one gate is linked and every link has passed.
    pub fn close_readiness(&self, task_id: &str) -> Result<CloseReadiness> {
        self.require_task(task_id)?;
        Ok(CloseReadiness::evaluate(task_id, &linked_gates(&self.conn, task_id)?))
    }

    /// Links on `task_id` whose status is anything but `passed`.
    pub fn failing_gates_for_task(&self, task_id: &str) -> Result<Vec<LinkedGate>> {
        Ok(self.close_readiness(task_id)?.failing)
    }

    pub fn gate_links_for_task(&self, task_id: &str) -> Result<Vec<LinkedGate>> {
        self.require_task(task_id)?;
        linked_gates(&self.conn, task_id)
    }

    pub fn gate_details(&self, gate_id: &str) -> Result<GateDetails> {
        validate_flat_id(gate_id, GATE_ID_PREFIX)?;
        let gate = require_gate(&self.conn, gate_id)?;

        let mut stmt = self.conn.prepare(
            "SELECT t.title, l.gate_id, l.task_id, l.status, l.verified_at, l.verified_by, l.notes, l.created_at
             FROM gate_task_links l JOIN tasks t ON t.id = l.task_id
             WHERE l.gate_id = ?1 AND t.deleted_at IS NULL
             ORDER BY l.created_at ASC, l.task_id ASC",
        )?;
        let rows = stmt.query_map(params![gate_id], |row| {
            let link = parse_link_row_at(row, 1)?;
            Ok(LinkedTask {
                task_id: link.task_id.clone(),
                task_title: row.get(0)?,
                link,
            })
        })?;
        let linked_tasks = collect_rows(rows)?;
        let recent_runs = self.gate_runs(gate_id, Some(RECENT_RUNS_LIMIT))?;

        Ok(GateDetails {
            pass_rate: gate.pass_rate(),
            gate,
            linked_tasks,
            recent_runs,
        })
    }

    /// Newest first.
    pub fn gate_runs(&self, gate_id: &str, limit: Option<usize>) -> Result<Vec<GateRun>> {
        validate_flat_id(gate_id, GATE_ID_PREFIX)?;
        let mut query =
            format!("SELECT {RUN_COLUMNS} FROM gate_runs WHERE gate_id = ?1 ORDER BY run_seq DESC");
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![gate_id], parse_run_row)?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Audit trail
    // -----------------------------------------------------------------------

    /// Appends one history entry. Returns `false` without writing when the
    /// old and new values are equal.
    pub fn record_change(
        &self,
        task_id: &str,
        field: HistoryField,
        old_value: &str,
        new_value: &str,
        actor: &str,
    ) -> Result<bool> {
        validate_task_id(task_id)?;
        HistoryWriter::new(&self.conn, task_id, actor, now_utc()).record(field, old_value, new_value)
    }

    /// Newest first.
    pub fn task_history(&self, task_id: &str, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        validate_task_id(task_id)?;
        let mut query = format!(
            "SELECT {HISTORY_COLUMNS} FROM task_history WHERE task_id = ?1 ORDER BY history_seq DESC"
        );
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![task_id], parse_history_row)?;
        collect_rows(rows)
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    pub fn create_template(&mut self, input: NewTemplate) -> Result<Template> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start template transaction")?;
        let id = fresh_id(&tx, "templates", new_template_id)?;
        let template = input.into_template(id, now_utc())?;

        if find_template(&tx, &template.name)?.is_some() {
            return Err(GuardrailsError::InvariantViolation(format!(
                "template named {} already exists",
                template.name
            ))
            .into());
        }

        tx.execute(
            &format!("INSERT INTO templates({TEMPLATE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                template.id,
                template.name,
                template.title,
                template.description,
                i64::from(template.priority.value()),
                template.task_type,
                labels_to_sql(&template.labels)?,
                format_rfc3339(template.created_at)?,
            ],
        )
        .context("failed to insert template")?;
        tx.commit().context("failed to commit template transaction")?;

        info!(template = %template.name, "template created");
        Ok(template)
    }

    pub fn get_template(&self, name_or_id: &str) -> Result<Option<Template>> {
        find_template(&self.conn, name_or_id)
    }

    pub fn list_templates(&self) -> Result<Vec<Template>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TEMPLATE_COLUMNS} FROM templates ORDER BY name ASC"))?;
        let rows = stmt.query_map([], parse_template_row)?;
        collect_rows(rows)
    }

    pub fn delete_template(&mut self, name_or_id: &str) -> Result<Template> {
        let template = find_template(&self.conn, name_or_id)?.ok_or_else(|| {
            GuardrailsError::NotFound(format!("template {name_or_id} not found"))
        })?;
        self.conn
            .execute("DELETE FROM templates WHERE id = ?1", params![template.id])
            .context("failed to delete template")?;

        info!(template = %template.name, "template deleted");
        Ok(template)
    }

    // -----------------------------------------------------------------------
    // Reporting and maintenance
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> Result<TaskStats> {
        let by_status = status_counts(&self.conn)?;

        let mut by_priority: BTreeMap<String, i64> =
            (0..=4).map(|value| (format!("P{value}"), 0)).collect();
        let mut stmt = self.conn.prepare(
            "SELECT priority, COUNT(*) FROM tasks WHERE deleted_at IS NULL GROUP BY priority",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let priority: i64 = row.get(0)?;
            by_priority.insert(format!("P{priority}"), row.get(1)?);
        }

        Ok(TaskStats {
            total: by_status.values().sum(),
            by_status,
            by_priority,
        })
    }

    pub fn summary(&self) -> Result<ProjectSummary> {
        let by_status = status_counts(&self.conn)?;
        let since = format_rfc3339(now_utc() - Duration::hours(24))?;

        let created_last_24h = count(
            &self.conn,
            "SELECT COUNT(*) FROM tasks WHERE deleted_at IS NULL AND created_at >= ?1",
            &since,
        )?;
        let closed_last_24h = count(
            &self.conn,
            "SELECT COUNT(*) FROM tasks WHERE deleted_at IS NULL AND closed_at >= ?1",
            &since,
        )?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, title, status, priority FROM tasks
             WHERE deleted_at IS NULL AND status IN {OPEN_STATUS_SQL} AND priority <= 1
             ORDER BY priority ASC, created_at DESC, rowid DESC
             LIMIT {SUMMARY_HIGH_PRIORITY_LIMIT}"
        ))?;
        let rows = stmt.query_map([], |row| {
            let status_raw: String = row.get(2)?;
            let priority_raw: i64 = row.get(3)?;
            Ok(TaskBrief {
                id: row.get(0)?,
                title: row.get(1)?,
                status: TaskStatus::parse(&status_raw).ok_or_else(|| {
                    invalid_column(2, Type::Text, format!("invalid status: {status_raw}"))
                })?,
                priority: Priority::new(priority_raw)
                    .map_err(|err| invalid_column(3, Type::Integer, err.to_string()))?,
            })
        })?;
        let high_priority_open = collect_rows(rows)?;

        let compacted = self.conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE deleted_at IS NULL AND compacted = 1",
            [],
            |row| row.get(0),
        )?;
        let compactable = self.conn.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE deleted_at IS NULL AND compacted = 0 AND status IN ('closed', 'archived')",
            [],
            |row| row.get(0),
        )?;

        Ok(ProjectSummary {
            by_status,
            created_last_24h,
            closed_last_24h,
            high_priority_open,
            compacted,
            compactable,
        })
    }

    /// Finds dependency edges and gate links whose endpoints no longer exist
    /// and removes them unless `dry_run`.
    pub fn cleanup(&mut self, dry_run: bool) -> Result<CleanupReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start cleanup transaction")?;

        let orphaned_dependencies = edge_refs(
            &tx,
            "SELECT blocker_id, blocked_id FROM dependencies
             WHERE blocker_id NOT IN (SELECT id FROM tasks)
                OR blocked_id NOT IN (SELECT id FROM tasks)
             ORDER BY blocker_id, blocked_id",
        )?;
        let orphaned_gate_links = edge_refs(
            &tx,
            "SELECT gate_id, task_id FROM gate_task_links
             WHERE gate_id NOT IN (SELECT id FROM gates)
                OR task_id NOT IN (SELECT id FROM tasks)
             ORDER BY gate_id, task_id",
        )?;

        if dry_run {
            tx.rollback().context("failed to roll back cleanup dry run")?;
        } else {
            for edge in &orphaned_dependencies {
                tx.execute(
                    "DELETE FROM dependencies WHERE blocker_id = ?1 AND blocked_id = ?2",
                    params![edge.from, edge.to],
                )?;
            }
            for edge in &orphaned_gate_links {
                tx.execute(
                    "DELETE FROM gate_task_links WHERE gate_id = ?1 AND task_id = ?2",
                    params![edge.from, edge.to],
                )?;
            }
            tx.commit().context("failed to commit cleanup transaction")?;
        }

        info!(
            dependencies = orphaned_dependencies.len(),
            gate_links = orphaned_gate_links.len(),
            dry_run,
            "orphan cleanup finished"
        );
        Ok(CleanupReport {
            dry_run,
            orphaned_dependencies,
            orphaned_gate_links,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

fn seek_confirmation(confirmer: &mut dyn Confirmer, detail: &str, action: &str) -> Result<()> {
    if !confirmer.is_interactive() {
        return Err(GuardrailsError::ConfirmationRequired(format!(
            "{detail}; {action} needs confirmation from an interactive terminal"
        ))
        .into());
    }

    if confirmer.confirm(&format!("{detail}.\nType 'yes' to {action}"))? {
        Ok(())
    } else {
        Err(GuardrailsError::Cancelled(format!("{action} was not confirmed")).into())
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

struct HistoryWriter<'a> {
    conn: &'a Connection,
    task_id: &'a str,
    actor: &'a str,
    at: OffsetDateTime,
}

impl<'a> HistoryWriter<'a> {
    fn new(conn: &'a Connection, task_id: &'a str, actor: &'a str, at: OffsetDateTime) -> Self {
        Self {
            conn,
            task_id,
            actor,
            at,
        }
    }

    fn record(&self, field: HistoryField, old_value: &str, new_value: &str) -> Result<bool> {
        if old_value == new_value {
            return Ok(false);
        }

        let id = fresh_id(self.conn, "task_history", new_history_id)?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO task_history({HISTORY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    id,
                    self.task_id,
                    field.as_str(),
                    old_value,
                    new_value,
                    self.actor,
                    format_rfc3339(self.at)?,
                ],
            )
            .with_context(|| format!("failed to record {} change", field.as_str()))?;

        debug!(task_id = self.task_id, field = field.as_str(), "history recorded");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Row access helpers
// ---------------------------------------------------------------------------

fn put_config(conn: &Connection, key: ConfigKey, value: &str, now: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO config(key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key.as_str(), value, now],
    )
    .with_context(|| format!("failed to write config key {}", key.as_str()))?;
    Ok(())
}

fn fresh_id(conn: &Connection, table: &str, generate: fn() -> String) -> Result<String> {
    let query = format!("SELECT 1 FROM {table} WHERE id = ?1");
    for _ in 0..ID_ALLOCATION_ATTEMPTS {
        let candidate = generate();
        let taken = conn
            .query_row(&query, params![candidate], |_| Ok(()))
            .optional()
            .with_context(|| format!("failed to check {table} id availability"))?
            .is_some();
        if !taken {
            return Ok(candidate);
        }
    }
    Err(anyhow!(
        "failed to allocate a unique {table} id after {ID_ALLOCATION_ATTEMPTS} attempts"
    ))
}

fn task_row_exists(conn: &Connection, task_id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![task_id], |_| Ok(()))
        .optional()
        .context("failed to check task existence")?
        .is_some())
}

/// Bumps the parent's lifetime child counter and returns the new ordinal.
/// The counter never decreases, so ordinals are not reused after a purge.
fn next_child_ordinal(conn: &Connection, parent_id: &str) -> Result<u32> {
    conn.execute(
        "UPDATE tasks SET child_count = child_count + 1 WHERE id = ?1",
        params![parent_id],
    )
    .context("failed to bump child counter")?;
    let ordinal: i64 = conn
        .query_row(
            "SELECT child_count FROM tasks WHERE id = ?1",
            params![parent_id],
            |row| row.get(0),
        )
        .context("failed to read child counter")?;
    u32::try_from(ordinal).with_context(|| format!("invalid child ordinal: {ordinal}"))
}

fn find_task(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND deleted_at IS NULL"),
        params![task_id],
        parse_task_row,
    )
    .optional()
    .with_context(|| format!("failed to load task {task_id}"))
}

fn require_task(conn: &Connection, task_id: &str) -> Result<Task> {
    find_task(conn, task_id)?
        .ok_or_else(|| GuardrailsError::NotFound(format!("task {task_id} not found")).into())
}

fn insert_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks({TASK_COLUMNS}) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17
             )"
        ),
        params![
            task.id,
            task.parent_id,
            task.title,
            task.description,
            task.status.as_str(),
            i64::from(task.priority.value()),
            task.task_type,
            labels_to_sql(&task.labels)?,
            task.assignee,
            task.notes,
            task.close_reason,
            task.summary,
            bool_to_sql(task.compacted),
            format_rfc3339(task.created_at)?,
            format_rfc3339(task.updated_at)?,
            optional_timestamp(task.closed_at)?,
            optional_timestamp(task.deleted_at)?,
        ],
    )
    .with_context(|| format!("failed to insert task {}", task.id))?;
    Ok(())
}

fn write_task(conn: &Connection, task: &Task) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE tasks SET
                parent_id = ?2, title = ?3, description = ?4, status = ?5, priority = ?6,
                task_type = ?7, labels_json = ?8, assignee = ?9, notes = ?10,
                close_reason = ?11, summary = ?12, compacted = ?13,
                updated_at = ?14, closed_at = ?15, deleted_at = ?16
             WHERE id = ?1",
            params![
                task.id,
                task.parent_id,
                task.title,
                task.description,
                task.status.as_str(),
                i64::from(task.priority.value()),
                task.task_type,
                labels_to_sql(&task.labels)?,
                task.assignee,
                task.notes,
                task.close_reason,
                task.summary,
                bool_to_sql(task.compacted),
                format_rfc3339(task.updated_at)?,
                optional_timestamp(task.closed_at)?,
                optional_timestamp(task.deleted_at)?,
            ],
        )
        .with_context(|| format!("failed to update task {}", task.id))?;
    if updated != 1 {
        return Err(anyhow!("expected to update exactly one row for task {}", task.id));
    }
    Ok(())
}

fn find_gate(conn: &Connection, gate_id: &str) -> Result<Option<Gate>> {
    conn.query_row(
        &format!("SELECT {GATE_COLUMNS} FROM gates WHERE id = ?1"),
        params![gate_id],
        parse_gate_row,
    )
    .optional()
    .with_context(|| format!("failed to load gate {gate_id}"))
}

fn require_gate(conn: &Connection, gate_id: &str) -> Result<Gate> {
    find_gate(conn, gate_id)?
        .ok_or_else(|| GuardrailsError::NotFound(format!("gate {gate_id} not found")).into())
}

fn find_link(conn: &Connection, gate_id: &str, task_id: &str) -> Result<Option<GateTaskLink>> {
    conn.query_row(
        &format!("SELECT {LINK_COLUMNS} FROM gate_task_links WHERE gate_id = ?1 AND task_id = ?2"),
        params![gate_id, task_id],
        |row| parse_link_row_at(row, 0),
    )
    .optional()
    .context("failed to load gate link")
}

/// Links on `task_id` joined with their gate titles. Links whose gate no
/// longer exists are ignored.
fn linked_gates(conn: &Connection, task_id: &str) -> Result<Vec<LinkedGate>> {
    let mut stmt = conn.prepare(
        "SELECT l.gate_id, g.title, l.status
         FROM gate_task_links l JOIN gates g ON g.id = l.gate_id
         WHERE l.task_id = ?1
         ORDER BY g.priority ASC, l.created_at ASC, l.gate_id ASC",
    )?;
    let rows = stmt.query_map(params![task_id], |row| {
        let status_raw: String = row.get(2)?;
        Ok(LinkedGate {
            gate_id: row.get(0)?,
            gate_title: row.get(1)?,
            status: GateStatus::parse(&status_raw).ok_or_else(|| {
                invalid_column(2, Type::Text, format!("invalid link status: {status_raw}"))
            })?,
        })
    })?;
    collect_rows(rows)
}

fn open_blockers(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT d.blocker_id
         FROM dependencies d JOIN tasks b ON b.id = d.blocker_id
         WHERE d.blocked_id = ?1
           AND d.dep_type = 'blocks'
           AND b.deleted_at IS NULL
           AND b.status IN {OPEN_STATUS_SQL}
         ORDER BY d.blocker_id ASC"
    ))?;
    let rows = stmt.query_map(params![task_id], |row| row.get(0))?;
    collect_rows(rows)
}

fn open_subtasks(conn: &Connection, task_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM tasks
         WHERE parent_id = ?1 AND deleted_at IS NULL AND status IN {OPEN_STATUS_SQL}
         ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map(params![task_id], |row| row.get(0))?;
    collect_rows(rows)
}

fn gather_close_checks(conn: &Connection, task: &Task) -> Result<CloseChecks> {
    Ok(CloseChecks {
        open_blockers: open_blockers(conn, &task.id)?,
        open_subtasks: open_subtasks(conn, &task.id)?,
        readiness: CloseReadiness::evaluate(&task.id, &linked_gates(conn, &task.id)?),
    })
}

fn load_blocks_graph(conn: &Connection) -> Result<DependencyGraph> {
    let mut stmt =
        conn.prepare("SELECT blocker_id, blocked_id FROM dependencies WHERE dep_type = 'blocks'")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    Ok(DependencyGraph::from_edges(collect_rows(rows)?))
}

fn dependency_views(conn: &Connection, query: &str, task_id: &str) -> Result<Vec<DependencyView>> {
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map(params![task_id], |row| {
        let status_raw: String = row.get(2)?;
        let dep_type_raw: String = row.get(3)?;
        Ok(DependencyView {
            task_id: row.get(0)?,
            title: row.get(1)?,
            status: TaskStatus::parse(&status_raw).ok_or_else(|| {
                invalid_column(2, Type::Text, format!("invalid status: {status_raw}"))
            })?,
            dep_type: DependencyType::parse(&dep_type_raw).ok_or_else(|| {
                invalid_column(3, Type::Text, format!("invalid dep_type: {dep_type_raw}"))
            })?,
        })
    })?;
    collect_rows(rows)
}

fn find_template(conn: &Connection, name_or_id: &str) -> Result<Option<Template>> {
    let column = if validate_flat_id(name_or_id, TEMPLATE_ID_PREFIX).is_ok() {
        "id"
    } else {
        "name"
    };
    conn.query_row(
        &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE {column} = ?1"),
        params![name_or_id.trim()],
        parse_template_row,
    )
    .optional()
    .with_context(|| format!("failed to load template {name_or_id}"))
}

fn status_counts(conn: &Connection) -> Result<BTreeMap<String, i64>> {
    let mut counts: BTreeMap<String, i64> = TaskStatus::ALL
        .iter()
        .map(|status| (status.as_str().to_string(), 0))
        .collect();
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM tasks WHERE deleted_at IS NULL GROUP BY status")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        counts.insert(row.get(0)?, row.get(1)?);
    }
    Ok(counts)
}

fn count(conn: &Connection, query: &str, param: &str) -> Result<i64> {
    conn.query_row(query, params![param], |row| row.get(0))
        .context("failed to run count query")
}

fn query_ids(conn: &Connection, query: &str, cutoff: Option<&str>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
    collect_rows(rows)
}

fn edge_refs(conn: &Connection, query: &str) -> Result<Vec<EdgeRef>> {
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map([], |row| {
        Ok(EdgeRef {
            from: row.get(0)?,
            to: row.get(1)?,
        })
    })?;
    collect_rows(rows)
}

fn cutoff_text(older_than: Option<Duration>) -> Result<Option<String>> {
    Ok(older_than
        .map(|age| cutoff_before_now(age).and_then(format_rfc3339))
        .transpose()?)
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn optional_timestamp(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    Ok(value.map(format_rfc3339).transpose()?)
}

fn labels_to_sql(labels: &[String]) -> Result<String> {
    serde_json::to_string(labels).context("failed to serialize labels")
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

// ---------------------------------------------------------------------------
// Row parsers
// ---------------------------------------------------------------------------

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(4)?;
    let priority_raw: i64 = row.get(5)?;
    let labels_raw: String = row.get(7)?;
    let compacted: i64 = row.get(12)?;

    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| invalid_column(4, Type::Text, format!("invalid status: {status_raw}")))?;
    let priority = Priority::new(priority_raw)
        .map_err(|err| invalid_column(5, Type::Integer, err.to_string()))?;

    Ok(Task {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status,
        priority,
        task_type: row.get(6)?,
        labels: parse_labels(7, &labels_raw)?,
        assignee: row.get(8)?,
        notes: row.get(9)?,
        close_reason: row.get(10)?,
        summary: row.get(11)?,
        compacted: compacted != 0,
        created_at: timestamp_column(row, 13)?,
        updated_at: timestamp_column(row, 14)?,
        closed_at: optional_timestamp_column(row, 15)?,
        deleted_at: optional_timestamp_column(row, 16)?,
    })
}

fn parse_gate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Gate> {
    let priority_raw: i64 = row.get(5)?;
    let labels_raw: String = row.get(10)?;
    let last_result_raw: String = row.get(11)?;

    Ok(Gate {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        gate_type: row.get(4)?,
        priority: Priority::new(priority_raw)
            .map_err(|err| invalid_column(5, Type::Integer, err.to_string()))?,
        preconditions: row.get(6)?,
        steps: row.get(7)?,
        expected_result: row.get(8)?,
        command: row.get(9)?,
        labels: parse_labels(10, &labels_raw)?,
        last_result: GateStatus::parse(&last_result_raw).ok_or_else(|| {
            invalid_column(11, Type::Text, format!("invalid last_result: {last_result_raw}"))
        })?,
        last_run_at: optional_timestamp_column(row, 12)?,
        last_run_by: row.get(13)?,
        last_run_notes: row.get(14)?,
        run_count: counter_column(row, 15)?,
        pass_count: counter_column(row, 16)?,
        fail_count: counter_column(row, 17)?,
        created_at: timestamp_column(row, 18)?,
        updated_at: timestamp_column(row, 19)?,
    })
}

/// Parses [`LINK_COLUMNS`] starting at column `offset`.
fn parse_link_row_at(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<GateTaskLink> {
    let status_raw: String = row.get(offset + 2)?;
    Ok(GateTaskLink {
        gate_id: row.get(offset)?,
        task_id: row.get(offset + 1)?,
        status: GateStatus::parse(&status_raw).ok_or_else(|| {
            invalid_column(offset + 2, Type::Text, format!("invalid link status: {status_raw}"))
        })?,
        verified_at: optional_timestamp_column(row, offset + 3)?,
        verified_by: row.get(offset + 4)?,
        notes: row.get(offset + 5)?,
        created_at: timestamp_column(row, offset + 6)?,
    })
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GateRun> {
    let result_raw: String = row.get(3)?;
    let duration_raw: Option<i64> = row.get(6)?;
    let duration_ms = duration_raw
        .map(|value| {
            u64::try_from(value).map_err(|_| {
                invalid_column(6, Type::Integer, format!("invalid duration_ms: {value}"))
            })
        })
        .transpose()?;

    Ok(GateRun {
        run_seq: row.get(0)?,
        gate_id: row.get(1)?,
        task_id: row.get(2)?,
        result: GateStatus::parse(&result_raw)
            .ok_or_else(|| invalid_column(3, Type::Text, format!("invalid result: {result_raw}")))?,
        run_by: row.get(4)?,
        notes: row.get(5)?,
        duration_ms,
        output: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let field_raw: String = row.get(2)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        field: HistoryField::parse(&field_raw)
            .ok_or_else(|| invalid_column(2, Type::Text, format!("invalid field: {field_raw}")))?,
        old_value: row.get(3)?,
        new_value: row.get(4)?,
        changed_by: row.get(5)?,
        changed_at: timestamp_column(row, 6)?,
    })
}

fn parse_template_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Template> {
    let priority_raw: i64 = row.get(4)?;
    let labels_raw: String = row.get(6)?;
    Ok(Template {
        id: row.get(0)?,
        name: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        priority: Priority::new(priority_raw)
            .map_err(|err| invalid_column(4, Type::Integer, err.to_string()))?,
        task_type: row.get(5)?,
        labels: parse_labels(6, &labels_raw)?,
        created_at: timestamp_column(row, 7)?,
    })
}

fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_column(idx, Type::Text, err.to_string()))
}

fn optional_timestamp_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    raw.as_deref()
        .map(|value| {
            parse_rfc3339_utc(value).map_err(|err| invalid_column(idx, Type::Text, err.to_string()))
        })
        .transpose()
}

fn counter_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw)
        .map_err(|_| invalid_column(idx, Type::Integer, format!("invalid counter: {raw}")))
}

fn parse_labels(idx: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|err| invalid_column(idx, Type::Text, format!("invalid labels JSON: {err}")))
}

fn invalid_column(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::too_many_lines)]

    use super::*;
    use guardrails_core::{parse_ancestry, VerificationOutcome};
    use proptest::prelude::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_fail<T: std::fmt::Debug>(result: Result<T>) -> anyhow::Error {
        match result {
            Ok(value) => panic!("expected failure, got {value:?}"),
            Err(err) => err,
        }
    }

    fn error_code(err: &anyhow::Error) -> &'static str {
        match err.downcast_ref::<GuardrailsError>() {
            Some(domain) => domain.code(),
            None => panic!("expected a domain error, got: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteTaskStore {
        let store = must(SqliteTaskStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_task(store: &mut SqliteTaskStore, title: &str) -> Task {
        must(store.create_task(
            &NewTask {
                title: Some(title.to_string()),
                ..NewTask::default()
            },
            DEFAULT_ACTOR,
        ))
    }

    fn fixture_subtask(store: &mut SqliteTaskStore, parent: &str, title: &str) -> Task {
        must(store.create_task(
            &NewTask {
                title: Some(title.to_string()),
                parent_id: Some(parent.to_string()),
                ..NewTask::default()
            },
            DEFAULT_ACTOR,
        ))
    }

    fn fixture_gate(store: &mut SqliteTaskStore, title: &str) -> Gate {
        must(store.create_gate(NewGate {
            title: title.to_string(),
            category: "testing".to_string(),
            ..NewGate::default()
        }))
    }

    /// Links a fresh gate to `task_id` and passes it.
    fn pass_new_gate(store: &mut SqliteTaskStore, task_id: &str) -> Gate {
        let gate = fixture_gate(store, "unit tests");
        must(store.link_gate(&gate.id, task_id));
        must(store.record_verification(
            &gate.id,
            task_id,
            &Verification::new(VerificationOutcome::Passed),
        ));
        gate
    }

    fn seed_closed_task(store: &SqliteTaskStore, id: &str, closed_at: &str) {
        let at = match parse_rfc3339_utc(closed_at) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        };
        let task = Task {
            id: id.to_string(),
            parent_id: None,
            title: format!("seeded {id}"),
            description: "long description".to_string(),
            status: TaskStatus::Closed,
            priority: Priority::MEDIUM,
            task_type: "feature".to_string(),
            labels: Vec::new(),
            assignee: None,
            notes: "[2020-01-01 00:00:00] note\n".to_string(),
            close_reason: Some("done".to_string()),
            summary: None,
            compacted: false,
            created_at: at,
            updated_at: at,
            closed_at: Some(at),
            deleted_at: None,
        };
        must(insert_task(store.connection(), &task));
    }

    struct ScriptedConfirmer {
        answer: bool,
        prompts: Vec<String>,
    }

    impl ScriptedConfirmer {
        fn answering(answer: bool) -> Self {
            Self {
                answer,
                prompts: Vec::new(),
            }
        }
    }

    impl Confirmer for ScriptedConfirmer {
        fn is_interactive(&self) -> bool {
            true
        }

        fn confirm(&mut self, prompt: &str) -> Result<bool> {
            self.prompts.push(prompt.to_string());
            Ok(self.answer)
        }
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_triggers() {
        let store = fixture_store();
        for table in [
            "tasks",
            "dependencies",
            "gates",
            "gate_task_links",
            "gate_runs",
            "task_history",
            "templates",
            "config",
            "schema_migrations",
        ] {
            let exists = match store.connection().query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get::<_, i64>(0),
            ) {
                Ok(value) => value,
                Err(err) => panic!("failed to query table contract: {err}"),
            };
            assert_eq!(exists, 1, "missing table {table}");
        }

        let trigger_count = match store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'trigger'
               AND name IN (
                 'trg_task_history_no_update', 'trg_task_history_no_delete',
                 'trg_gate_runs_no_update', 'trg_gate_runs_no_delete'
               )",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to query trigger contract: {err}"),
        };
        assert_eq!(trigger_count, 4);
    }

    #[test]
    fn migration_is_idempotent_and_seeds_config() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "survives migrate");

        must(store.migrate());
        assert!(must(store.get_task(&task.id)).is_some());
        assert_eq!(
            must(store.get_config(ConfigKey::SchemaVersion)).as_deref(),
            Some(SCHEMA_VERSION)
        );
        assert_eq!(
            must(store.get_config(ConfigKey::IdPrefix)).as_deref(),
            Some(TASK_ID_PREFIX)
        );
    }

    #[test]
    fn history_is_append_only() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "audited");
        assert!(must(store.record_change(&task.id, HistoryField::Title, "a", "b", "tester")));

        let update = store
            .connection()
            .execute("UPDATE task_history SET new_value = 'mutated'", []);
        assert!(update.is_err());
        let delete = store.connection().execute("DELETE FROM task_history", []);
        assert!(delete.is_err());
    }

    #[test]
    fn gate_verification_unlocks_close() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "T");
        assert_eq!(task.status, TaskStatus::Open);

        let readiness = must(store.close_readiness(&task.id));
        assert!(!readiness.is_ready());
        assert_eq!(readiness.linked_gates, 0);

        let gate = fixture_gate(&mut store, "G");
        let link = must(store.link_gate(&gate.id, &task.id));
        assert_eq!(link.status, GateStatus::Pending);

        let err = must_fail(store.close_task(&task.id, &CloseRequest::new("done"), &mut NonInteractive));
        assert_eq!(error_code(&err), "precondition_failed");
        assert!(err.to_string().contains("not verified"));
        assert_eq!(must(store.failing_gates_for_task(&task.id)).len(), 1);

        let verified = must(store.record_verification(
            &gate.id,
            &task.id,
            &Verification::new(VerificationOutcome::Passed).with_verifier("ci").with_notes("green"),
        ));
        assert_eq!(verified.status, GateStatus::Passed);
        assert_eq!(verified.verified_by.as_deref(), Some("ci"));
        assert!(must(store.close_readiness(&task.id)).is_ready());

        let closed = must(store.close_task(&task.id, &CloseRequest::new("done"), &mut NonInteractive));
        assert_eq!(closed.status, TaskStatus::Closed);
        assert_eq!(closed.close_reason.as_deref(), Some("done"));
        assert!(closed.closed_at.is_some());

        let history = must(store.task_history(&task.id, None));
        let fields: Vec<HistoryField> = history.iter().map(|entry| entry.field).collect();
        assert_eq!(fields, vec![HistoryField::CloseReason, HistoryField::Status]);
        assert_eq!(history[1].old_value, "open");
        assert_eq!(history[1].new_value, "closed");

        let again = must_fail(store.close_task(&task.id, &CloseRequest::new("again"), &mut NonInteractive));
        assert_eq!(error_code(&again), "invariant_violation");
        assert!(again.to_string().contains("already closed on"));
        assert!(again.to_string().contains("with reason: done"));
    }

    #[test]
    fn verification_is_per_task() {
        let mut store = fixture_store();
        let first = fixture_task(&mut store, "A");
        let second = fixture_task(&mut store, "B");
        let gate = fixture_gate(&mut store, "review");
        must(store.link_gate(&gate.id, &first.id));
        must(store.link_gate(&gate.id, &second.id));

        must(store.record_verification(
            &gate.id,
            &first.id,
            &Verification::new(VerificationOutcome::Passed),
        ));

        assert!(must(store.close_readiness(&first.id)).is_ready());
        let second_readiness = must(store.close_readiness(&second.id));
        assert!(!second_readiness.is_ready());
        assert_eq!(second_readiness.failing[0].status, GateStatus::Pending);

        let details = must(store.gate_details(&gate.id));
        assert_eq!(details.gate.run_count, 1);
        assert_eq!(details.linked_tasks.len(), 2);
        assert_eq!(details.recent_runs.len(), 1);
    }

    #[test]
    fn skipped_and_failed_links_block_close_and_reverify_overwrites() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "needs review");
        let gate = fixture_gate(&mut store, "review");
        must(store.link_gate(&gate.id, &task.id));

        for outcome in [VerificationOutcome::Skipped, VerificationOutcome::Failed] {
            must(store.record_verification(&gate.id, &task.id, &Verification::new(outcome)));
            let readiness = must(store.close_readiness(&task.id));
            assert!(!readiness.is_ready());
            assert_eq!(readiness.failing[0].status, outcome.status());
        }

        must(store.record_verification(
            &gate.id,
            &task.id,
            &Verification::new(VerificationOutcome::Passed),
        ));
        assert!(must(store.close_readiness(&task.id)).is_ready());

        let gate = match must(store.get_gate(&gate.id)) {
            Some(value) => value,
            None => panic!("gate vanished"),
        };
        assert_eq!(gate.run_count, 3);
        assert_eq!(gate.pass_count, 1);
        assert_eq!(gate.fail_count, 1);
        assert_eq!(gate.last_result, GateStatus::Passed);

        let runs = must(store.gate_runs(&gate.id, None));
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].result, GateStatus::Passed);
        assert_eq!(runs[2].result, GateStatus::Skipped);
    }

    #[test]
    fn link_errors_are_classified() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "T");
        let gate = fixture_gate(&mut store, "G");

        let unlinked = must_fail(store.record_verification(
            &gate.id,
            &task.id,
            &Verification::new(VerificationOutcome::Passed),
        ));
        assert_eq!(error_code(&unlinked), "not_found");

        must(store.link_gate(&gate.id, &task.id));
        let duplicate = must_fail(store.link_gate(&gate.id, &task.id));
        assert_eq!(error_code(&duplicate), "invariant_violation");

        let unknown_gate = must_fail(store.link_gate("gate-ffffffff", &task.id));
        assert_eq!(error_code(&unknown_gate), "not_found");
        assert!(unknown_gate.to_string().contains("gate-ffffffff"));

        must(store.unlink_gate(&gate.id, &task.id));
        let missing = must_fail(store.unlink_gate(&gate.id, &task.id));
        assert_eq!(error_code(&missing), "not_found");
    }

    #[test]
    fn reverse_blocker_is_rejected_and_graph_keeps_first_edge() {
        let mut store = fixture_store();
        let a = fixture_task(&mut store, "A");
        let b = fixture_task(&mut store, "B");

        must(store.add_blocker(&a.id, &b.id));
        let err = must_fail(store.add_blocker(&b.id, &a.id));
        assert_eq!(error_code(&err), "invariant_violation");
        assert!(err.to_string().contains("circular dependency detected"));

        let graph = must(store.dependency_graph());
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.contains_edge(&a.id, &b.id));

        let self_block = must_fail(store.add_blocker(&a.id, &a.id));
        assert!(self_block.to_string().contains("cannot block itself"));

        let duplicate = must_fail(store.add_blocker(&a.id, &b.id));
        assert!(duplicate.to_string().contains("already exists"));

        let deps = must(store.list_dependencies(&b.id));
        assert_eq!(deps.blocked_by.len(), 1);
        assert_eq!(deps.blocked_by[0].task_id, a.id);
        assert!(deps.blocks.is_empty());

        must(store.remove_dependency(&a.id, &b.id));
        let missing = must_fail(store.remove_dependency(&a.id, &b.id));
        assert_eq!(error_code(&missing), "not_found");
        assert!(missing.to_string().contains("dependency not found"));
    }

    #[test]
    fn related_edges_do_not_block_or_count_toward_cycles() {
        let mut store = fixture_store();
        let a = fixture_task(&mut store, "A");
        let b = fixture_task(&mut store, "B");

        must(store.add_blocker(&a.id, &b.id));
        must(store.add_dependency(&b.id, &a.id, DependencyType::Related));

        assert!(must(store.open_blockers_of(&a.id)).is_empty());
        assert_eq!(must(store.open_blockers_of(&b.id)), vec![a.id.clone()]);
    }

    #[test]
    fn blockers_gate_close_and_ready_set() {
        let mut store = fixture_store();
        let blocker = fixture_task(&mut store, "blocker");
        let blocked = fixture_task(&mut store, "blocked");
        must(store.add_blocker(&blocker.id, &blocked.id));
        pass_new_gate(&mut store, &blocked.id);
        pass_new_gate(&mut store, &blocker.id);

        let ready: Vec<String> = must(store.ready_tasks(None)).into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec![blocker.id.clone()]);

        let err = must_fail(store.close_task(
            &blocked.id,
            &CloseRequest::new("done").forced(),
            &mut ScriptedConfirmer::answering(true),
        ));
        assert_eq!(error_code(&err), "precondition_failed");
        assert!(err.to_string().contains("blocked by 1 open task(s)"));
        assert!(err.to_string().contains(&blocker.id));

        must(store.close_task(&blocker.id, &CloseRequest::new("done"), &mut NonInteractive));
        let ready: Vec<String> = must(store.ready_tasks(None)).into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec![blocked.id.clone()]);
        must(store.close_task(&blocked.id, &CloseRequest::new("done"), &mut NonInteractive));
    }

    #[test]
    fn subtasks_are_numbered_and_must_close_first() {
        let mut store = fixture_store();
        let root = fixture_task(&mut store, "R");
        let child = fixture_subtask(&mut store, &root.id, "R.1");
        let grandchild = fixture_subtask(&mut store, &child.id, "R.1.1");

        assert_eq!(child.id, format!("{}.1", root.id));
        assert_eq!(grandchild.id, format!("{}.1.1", root.id));
        let ancestry = must(parse_ancestry(&grandchild.id).map_err(anyhow::Error::from));
        assert_eq!(ancestry.parent_id.as_deref(), Some(child.id.as_str()));
        assert_eq!(ancestry.root_id, root.id);
        assert_eq!(ancestry.depth, 2);

        pass_new_gate(&mut store, &root.id);
        pass_new_gate(&mut store, &child.id);
        pass_new_gate(&mut store, &grandchild.id);

        let err = must_fail(store.close_task(&root.id, &CloseRequest::new("done"), &mut NonInteractive));
        assert!(err.to_string().contains("has 1 open subtask(s)"));

        must(store.close_task(&grandchild.id, &CloseRequest::new("done"), &mut NonInteractive));
        must(store.close_task(&child.id, &CloseRequest::new("done"), &mut NonInteractive));
        let closed = must(store.close_task(&root.id, &CloseRequest::new("done"), &mut NonInteractive));
        assert_eq!(closed.status, TaskStatus::Closed);
    }

    #[test]
    fn subtask_ordinals_are_never_reused() {
        let mut store = fixture_store();
        let root = fixture_task(&mut store, "R");
        let first = fixture_subtask(&mut store, &root.id, "first");
        let second = fixture_subtask(&mut store, &root.id, "second");
        assert!(second.id.ends_with(".2"));

        must(store.delete_task(&second.id, DEFAULT_ACTOR));
        must(store.delete_task(&first.id, DEFAULT_ACTOR));
        let purged = must(store.purge_deleted());
        assert_eq!(purged.tasks, 2);

        let third = fixture_subtask(&mut store, &root.id, "third");
        assert_eq!(third.id, format!("{}.3", root.id));
    }

    #[test]
    fn subtasks_cannot_be_added_to_closed_parents() {
        let mut store = fixture_store();
        let root = fixture_task(&mut store, "R");
        pass_new_gate(&mut store, &root.id);
        must(store.close_task(&root.id, &CloseRequest::new("done"), &mut NonInteractive));

        let err = must_fail(store.create_task(
            &NewTask {
                title: Some("late".to_string()),
                parent_id: Some(root.id.clone()),
                ..NewTask::default()
            },
            DEFAULT_ACTOR,
        ));
        assert_eq!(error_code(&err), "invariant_violation");

        let missing = must_fail(store.create_task(
            &NewTask {
                title: Some("orphan".to_string()),
                parent_id: Some("gur-ffffffff".to_string()),
                ..NewTask::default()
            },
            DEFAULT_ACTOR,
        ));
        assert_eq!(error_code(&missing), "not_found");
    }

    #[test]
    fn forced_close_requires_interactive_confirmation() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "risky");
        let gate = fixture_gate(&mut store, "manual QA");
        must(store.link_gate(&gate.id, &task.id));

        let refused = must_fail(store.close_task(
            &task.id,
            &CloseRequest::new("ship it").forced(),
            &mut NonInteractive,
        ));
        assert_eq!(error_code(&refused), "confirmation_required");
        assert_eq!(must(store.require_task(&task.id)).status, TaskStatus::Open);

        let mut declining = ScriptedConfirmer::answering(false);
        let cancelled = must_fail(store.close_task(
            &task.id,
            &CloseRequest::new("ship it").forced(),
            &mut declining,
        ));
        assert_eq!(error_code(&cancelled), "cancelled");
        assert_eq!(declining.prompts.len(), 1);
        assert!(declining.prompts[0].contains(&gate.id));

        let mut accepting = ScriptedConfirmer::answering(true);
        let closed = must(store.close_task(
            &task.id,
            &CloseRequest::new("ship it").forced().by("release-bot"),
            &mut accepting,
        ));
        assert_eq!(closed.close_reason.as_deref(), Some("[FORCE CLOSED] ship it"));

        let history = must(store.task_history(&task.id, Some(1)));
        assert_eq!(history[0].field, HistoryField::CloseReason);
        assert_eq!(history[0].changed_by, "release-bot");
    }

    #[test]
    fn forced_close_with_ready_gates_skips_prompt() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "clean");
        pass_new_gate(&mut store, &task.id);

        let closed = must(store.close_task(
            &task.id,
            &CloseRequest::new("done").forced(),
            &mut NonInteractive,
        ));
        assert_eq!(closed.close_reason.as_deref(), Some("done"));
    }

    #[test]
    fn reopen_archive_and_unarchive_follow_the_state_machine() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "cycle");

        let err = must_fail(store.reopen_task(&task.id, DEFAULT_ACTOR));
        assert_eq!(error_code(&err), "invariant_violation");
        let err = must_fail(store.archive_task(&task.id, DEFAULT_ACTOR));
        assert_eq!(error_code(&err), "invariant_violation");

        pass_new_gate(&mut store, &task.id);
        must(store.close_task(&task.id, &CloseRequest::new("done"), &mut NonInteractive));

        let archived = must(store.archive_task(&task.id, DEFAULT_ACTOR));
        assert_eq!(archived.status, TaskStatus::Archived);
        assert_eq!(archived.close_reason.as_deref(), Some("done"));
        assert!(must_fail(store.reopen_task(&task.id, DEFAULT_ACTOR))
            .to_string()
            .contains("expected closed"));

        let unarchived = must(store.unarchive_task(&task.id, DEFAULT_ACTOR));
        assert_eq!(unarchived.status, TaskStatus::Closed);

        let reopened = must(store.reopen_task(&task.id, DEFAULT_ACTOR));
        assert_eq!(reopened.status, TaskStatus::Open);
        assert_eq!(reopened.close_reason, None);
        assert_eq!(reopened.closed_at, None);

        let history = must(store.task_history(&task.id, Some(2)));
        assert_eq!(history[0].field, HistoryField::CloseReason);
        assert_eq!(history[0].old_value, "done");
        assert_eq!(history[1].field, HistoryField::Status);
        assert_eq!(history[1].new_value, "open");
    }

    #[test]
    fn bulk_archive_spans_batches_and_honours_age() {
        let mut store = fixture_store();
        for idx in 0..130_u32 {
            seed_closed_task(&store, &format!("gur-{idx:08x}"), "2020-01-01T00:00:00Z");
        }
        let recent = fixture_task(&mut store, "recent");
        pass_new_gate(&mut store, &recent.id);
        must(store.close_task(&recent.id, &CloseRequest::new("done"), &mut NonInteractive));

        let report = must(store.archive_closed(Some(Duration::days(7)), DEFAULT_ACTOR));
        assert_eq!(report.matched, 130);
        assert_eq!(report.processed.len(), 130);

        let archived = must(store.list_tasks(&TaskFilter {
            status: Some(TaskStatus::Archived),
            ..TaskFilter::default()
        }));
        assert_eq!(archived.len(), 130);
        assert_eq!(must(store.require_task(&recent.id)).status, TaskStatus::Closed);

        let rest = must(store.archive_closed(None, DEFAULT_ACTOR));
        assert_eq!(rest.processed, vec![recent.id]);
    }

    #[test]
    fn bulk_age_beyond_calendar_is_a_validation_error() {
        let mut store = fixture_store();
        seed_closed_task(&store, "gur-00000001", "2020-01-01T00:00:00Z");
        let far = Duration::days(5_000_000);

        let err = must_fail(store.archive_closed(Some(far), DEFAULT_ACTOR));
        assert_eq!(error_code(&err), "validation");
        let err = must_fail(store.compact_all(Some(far), true, DEFAULT_ACTOR));
        assert_eq!(error_code(&err), "validation");

        assert_eq!(must(store.require_task("gur-00000001")).status, TaskStatus::Closed);
    }

    #[test]
    fn compaction_single_dry_run_and_bulk() {
        let mut store = fixture_store();
        seed_closed_task(&store, "gur-00000001", "2020-01-01T00:00:00Z");
        seed_closed_task(&store, "gur-00000002", "2020-01-02T00:00:00Z");
        let open = fixture_task(&mut store, "still open");

        let err = must_fail(store.compact_task(&open.id, false, DEFAULT_ACTOR));
        assert_eq!(error_code(&err), "invariant_violation");

        let preview = must(store.compact_task("gur-00000001", true, DEFAULT_ACTOR));
        assert_eq!(preview.summary.as_deref(), Some("[feature] seeded gur-00000001 | Closed: done"));
        let untouched = must(store.require_task("gur-00000001"));
        assert!(!untouched.compacted);
        assert_eq!(untouched.description, "long description");

        let compacted = must(store.compact_task("gur-00000001", false, DEFAULT_ACTOR));
        assert!(compacted.compacted);
        let stored = must(store.require_task("gur-00000001"));
        assert!(stored.description.is_empty());
        assert!(stored.notes.is_empty());
        assert!(must_fail(store.compact_task("gur-00000001", false, DEFAULT_ACTOR))
            .to_string()
            .contains("already compacted"));

        let dry = must(store.compact_all(None, true, DEFAULT_ACTOR));
        assert_eq!(dry.compacted.len(), 1);
        assert!(!must(store.require_task("gur-00000002")).compacted);

        let report = must(store.compact_all(None, false, DEFAULT_ACTOR));
        assert_eq!(report.compacted[0].task_id, "gur-00000002");
        assert!(must(store.require_task("gur-00000002")).compacted);

        let summary = must(store.summary());
        assert_eq!(summary.compacted, 2);
        assert_eq!(summary.compactable, 0);
    }

    #[test]
    fn updates_record_one_history_entry_per_field() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "original");

        let updated = must(store.update_task(
            &task.id,
            &TaskPatch {
                title: Some("renamed".to_string()),
                priority: Some(Priority::CRITICAL),
                status: Some(TaskStatus::InProgress),
                assignee: Some("sam".to_string()),
                notes: Some("picked up".to_string()),
                add_labels: vec!["backend".to_string(), "backend".to_string()],
                ..TaskPatch::default()
            },
            "sam",
            &mut NonInteractive,
        ));
        assert_eq!(updated.title, "renamed");
        assert_eq!(updated.labels, vec!["backend"]);
        assert!(updated.notes.contains("picked up"));

        let history = must(store.task_history(&task.id, None));
        let mut fields: Vec<&str> = history.iter().map(|entry| entry.field.as_str()).collect();
        fields.sort_unstable();
        assert_eq!(
            fields,
            vec!["assignee", "label_added", "notes", "priority", "status", "title"]
        );

        let unchanged = must(store.update_task(
            &task.id,
            &TaskPatch {
                title: Some("renamed".to_string()),
                ..TaskPatch::default()
            },
            "sam",
            &mut NonInteractive,
        ));
        assert_eq!(unchanged.updated_at, updated.updated_at);
        assert_eq!(must(store.task_history(&task.id, None)).len(), history.len());

        let closing = must_fail(store.update_task(
            &task.id,
            &TaskPatch {
                status: Some(TaskStatus::Closed),
                ..TaskPatch::default()
            },
            "sam",
            &mut NonInteractive,
        ));
        assert_eq!(error_code(&closing), "invariant_violation");
    }

    #[test]
    fn scope_change_after_passed_gate_needs_confirmation() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "verified scope");
        let gate = pass_new_gate(&mut store, &task.id);
        let patch = TaskPatch {
            description: Some("much bigger scope".to_string()),
            ..TaskPatch::default()
        };

        let err = must_fail(store.update_task(&task.id, &patch, DEFAULT_ACTOR, &mut NonInteractive));
        assert_eq!(error_code(&err), "confirmation_required");
        assert!(err.to_string().contains(&gate.id));

        let mut accepting = ScriptedConfirmer::answering(true);
        let updated = must(store.update_task(&task.id, &patch, DEFAULT_ACTOR, &mut accepting));
        assert_eq!(updated.description, "much bigger scope");

        // non-scope edits never prompt
        must(store.update_task(
            &task.id,
            &TaskPatch {
                priority: Some(Priority::LOW),
                ..TaskPatch::default()
            },
            DEFAULT_ACTOR,
            &mut NonInteractive,
        ));
    }

    #[test]
    fn list_filters_order_and_hide_archived() {
        let mut store = fixture_store();
        let low = must(store.create_task(
            &NewTask {
                title: Some("low".to_string()),
                priority: Some(Priority::LOWEST),
                labels: vec!["ops".to_string()],
                ..NewTask::default()
            },
            DEFAULT_ACTOR,
        ));
        let critical = must(store.create_task(
            &NewTask {
                title: Some("critical".to_string()),
                priority: Some(Priority::CRITICAL),
                task_type: Some("bug".to_string()),
                ..NewTask::default()
            },
            DEFAULT_ACTOR,
        ));
        seed_closed_task(&store, "gur-0000000a", "2020-01-01T00:00:00Z");
        must(store.archive_task("gur-0000000a", DEFAULT_ACTOR));

        let all: Vec<String> = must(store.list_tasks(&TaskFilter::default()))
            .into_iter()
            .map(|task| task.id)
            .collect();
        assert_eq!(all, vec![critical.id.clone(), low.id.clone()]);

        let with_archived = must(store.list_tasks(&TaskFilter {
            include_archived: true,
            ..TaskFilter::default()
        }));
        assert_eq!(with_archived.len(), 3);

        let bugs = must(store.list_tasks(&TaskFilter {
            task_type: Some("BUG".to_string()),
            ..TaskFilter::default()
        }));
        assert_eq!(bugs.len(), 1);

        let ops = must(store.list_tasks(&TaskFilter {
            label: Some("ops".to_string()),
            ..TaskFilter::default()
        }));
        assert_eq!(ops[0].id, low.id);
    }

    #[test]
    fn search_escapes_like_wildcards() {
        let mut store = fixture_store();
        let literal = fixture_task(&mut store, "raise limit to 100%");
        fixture_task(&mut store, "raise limit to 1000");

        let hits = must(store.search_tasks("100%", None));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, literal.id);

        let case_insensitive = must(store.search_tasks("RAISE", None));
        assert_eq!(case_insensitive.len(), 2);
        assert!(store.search_tasks("   ", None).is_err());
    }

    #[test]
    fn templates_supply_defaults() {
        let mut store = fixture_store();
        let template = must(store.create_template(NewTemplate {
            name: "bugfix".to_string(),
            title: "Fix regression".to_string(),
            description: "repro steps".to_string(),
            priority: Some(Priority::HIGH),
            task_type: Some("bug".to_string()),
            labels: vec!["triage".to_string()],
        }));
        assert!(must_fail(store.create_template(NewTemplate {
            name: "bugfix".to_string(),
            ..NewTemplate::default()
        }))
        .to_string()
        .contains("already exists"));

        let task = must(store.create_task(
            &NewTask {
                template: Some("bugfix".to_string()),
                ..NewTask::default()
            },
            DEFAULT_ACTOR,
        ));
        assert_eq!(task.title, "Fix regression");
        assert_eq!(task.priority, Priority::HIGH);
        assert_eq!(task.task_type, "bug");
        assert_eq!(task.labels, vec!["triage"]);

        assert!(must(store.get_template(&template.id)).is_some());
        assert_eq!(must(store.list_templates()).len(), 1);
        must(store.delete_template("bugfix"));
        let err = must_fail(store.create_task(
            &NewTask {
                template: Some("bugfix".to_string()),
                ..NewTask::default()
            },
            DEFAULT_ACTOR,
        ));
        assert_eq!(error_code(&err), "not_found");
    }

    #[test]
    fn config_round_trips_and_rejects_read_only_keys() {
        let store = fixture_store();
        must(store.initialize_project("demo", ProjectMode::Stealth));
        assert_eq!(must(store.get_config(ConfigKey::Mode)).as_deref(), Some("stealth"));
        let initialized = must(store.get_config(ConfigKey::InitializedAt));

        must(store.initialize_project("demo-renamed", ProjectMode::Default));
        assert_eq!(must(store.get_config(ConfigKey::InitializedAt)), initialized);
        assert_eq!(
            must(store.get_config(ConfigKey::ProjectName)).as_deref(),
            Some("demo-renamed")
        );

        assert!(store.set_config(ConfigKey::SchemaVersion, "2").is_err());
        assert!(store.set_config(ConfigKey::Mode, "loud").is_err());
        must(store.set_config(ConfigKey::Mode, "contributor"));
        assert_eq!(must(store.list_config()).len(), 5);
    }

    #[test]
    fn stats_and_summary_count_live_tasks() {
        let mut store = fixture_store();
        let urgent = must(store.create_task(
            &NewTask {
                title: Some("urgent".to_string()),
                priority: Some(Priority::CRITICAL),
                ..NewTask::default()
            },
            DEFAULT_ACTOR,
        ));
        let gone = fixture_task(&mut store, "gone");
        must(store.delete_task(&gone.id, DEFAULT_ACTOR));
        seed_closed_task(&store, "gur-0000000b", "2020-01-01T00:00:00Z");

        let stats = must(store.stats());
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status.get("open"), Some(&1));
        assert_eq!(stats.by_status.get("closed"), Some(&1));
        assert_eq!(stats.by_status.get("archived"), Some(&0));
        assert_eq!(stats.by_priority.get("P0"), Some(&1));

        let summary = must(store.summary());
        assert_eq!(summary.created_last_24h, 1);
        assert_eq!(summary.closed_last_24h, 0);
        assert_eq!(summary.high_priority_open.len(), 1);
        assert_eq!(summary.high_priority_open[0].id, urgent.id);
        assert!(must(store.get_task(&gone.id)).is_none());
    }

    #[test]
    fn cleanup_removes_orphaned_edges_and_links() {
        let mut store = fixture_store();
        let task = fixture_task(&mut store, "kept");
        let gate = fixture_gate(&mut store, "kept gate");
        must(store.link_gate(&gate.id, &task.id));
        let seeded = store.connection().execute_batch(
            "INSERT INTO dependencies(blocker_id, blocked_id, dep_type, created_at)
               VALUES ('gur-deadbeef', 'gur-feedface', 'blocks', '2020-01-01T00:00:00Z');
             INSERT INTO gate_task_links(gate_id, task_id, status, created_at)
               VALUES ('gate-deadbeef', 'gur-feedface', 'pending', '2020-01-01T00:00:00Z');",
        );
        if let Err(err) = seeded {
            panic!("failed to seed orphans: {err}");
        }

        let dry = must(store.cleanup(true));
        assert_eq!(dry.orphaned_dependencies.len(), 1);
        assert_eq!(dry.orphaned_gate_links.len(), 1);

        let report = must(store.cleanup(false));
        assert_eq!(report.orphaned_dependencies[0].from, "gur-deadbeef");
        assert!(must(store.cleanup(true)).orphaned_gate_links.is_empty());
        assert_eq!(must(store.gate_links_for_task(&task.id)).len(), 1);
    }

    #[test]
    fn malformed_ids_are_rejected_before_lookup() {
        let store = fixture_store();
        let err = must_fail(store.get_task("not-an-id"));
        assert_eq!(error_code(&err), "validation");
        let err = must_fail(store.require_task("gur-00000000"));
        assert_eq!(error_code(&err), "not_found");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_record_change_appends_only_on_difference(
            changes in prop::collection::vec(("[a-c]{0,2}", "[a-c]{0,2}"), 1..20)
        ) {
            let mut store = fixture_store();
            let task = fixture_task(&mut store, "audited");
            let mut expected = 0_usize;
            for (old, new) in &changes {
                let written = must(store.record_change(&task.id, HistoryField::Notes, old, new, "prop"));
                prop_assert_eq!(written, old != new);
                if old != new {
                    expected += 1;
                }
            }
            prop_assert_eq!(must(store.task_history(&task.id, None)).len(), expected);
        }

        #[test]
        fn prop_stored_blocks_graph_stays_acyclic(ops in prop::collection::vec((0usize..6, 0usize..6, any::<bool>()), 1..40)) {
            let mut store = fixture_store();
            let ids: Vec<String> = (0..6).map(|idx| fixture_task(&mut store, &format!("n{idx}")).id).collect();
            for (blocker, blocked, add) in ops {
                if add {
                    let _ = store.add_blocker(&ids[blocker], &ids[blocked]);
                } else {
                    let _ = store.remove_dependency(&ids[blocker], &ids[blocked]);
                }
                prop_assert!(must(store.dependency_graph()).is_acyclic());
            }
        }
    }

    #[test]
    fn sqlite_busy_timeout_allows_close_after_lock_release() {
        let db_path = std::env::temp_dir().join(format!(
            "guardrails-lock-test-{}.sqlite3",
            guardrails_core::new_root_id()
        ));

        let mut setup_store = must(SqliteTaskStore::open(&db_path));
        must(setup_store.migrate());
        let task = fixture_task(&mut setup_store, "contended");
        pass_new_gate(&mut setup_store, &task.id);
        drop(setup_store);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let close_path = db_path.clone();
        let task_id = task.id.clone();
        let close_handle = std::thread::spawn(move || {
            let mut close_store = match SqliteTaskStore::open(&close_path) {
                Ok(value) => value,
                Err(err) => panic!("failed to open close store: {err}"),
            };
            close_store.close_task(&task_id, &CloseRequest::new("done"), &mut NonInteractive)
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let close_result = match close_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("close thread join failed: {err:?}"),
        };
        assert!(
            close_result.is_ok(),
            "close should succeed after lock release: {:?}",
            close_result.err()
        );

        let _ = std::fs::remove_file(&db_path);
    }
}
