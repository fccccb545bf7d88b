//! Domain model for the guardrails task engine.
//!
//! Everything here is pure: identifiers, records, the blocking-dependency
//! graph, gate close-readiness and the closure decision. Persistence lives in
//! `guardrails-store-sqlite`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};

pub const TASK_ID_PREFIX: &str = "gur-";
pub const GATE_ID_PREFIX: &str = "gate-";
pub const HISTORY_ID_PREFIX: &str = "hist-";
pub const TEMPLATE_ID_PREFIX: &str = "tmpl-";

pub const FORCE_CLOSE_PREFIX: &str = "[FORCE CLOSED] ";
pub const DEFAULT_ACTOR: &str = "user";
pub const DEFAULT_VERIFIER: &str = "human";
pub const DEFAULT_GATE_TYPE: &str = "manual";
pub const DEFAULT_TASK_TYPE: &str = "task";
pub const CONVENTIONAL_TASK_TYPES: [&str; 4] = ["task", "bug", "feature", "epic"];
pub const SCHEMA_VERSION: &str = "1";

const ID_HEX_LEN: usize = 8;
const ID_RANDOM_BYTES: usize = 4;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GuardrailsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("confirmation required: {0}")]
    ConfirmationRequired(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl GuardrailsError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Precondition(_) => "precondition_failed",
            Self::ConfirmationRequired(_) => "confirmation_required",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Draws 4 bytes from the OS random source and hex-encodes them.
///
/// # Panics
/// Panics when the secure random source is unavailable. A host that cannot
/// provide randomness cannot mint identifiers at all.
fn random_id_suffix() -> String {
    let mut bytes = [0_u8; ID_RANDOM_BYTES];
    if let Err(err) = getrandom::getrandom(&mut bytes) {
        panic!("secure random source unavailable, cannot generate identifier: {err}");
    }
    hex::encode(bytes)
}

/// Returns a fresh root task id: `gur-` plus 8 lowercase hex characters.
#[must_use]
pub fn new_root_id() -> String {
    format!("{TASK_ID_PREFIX}{}", random_id_suffix())
}

#[must_use]
pub fn new_gate_id() -> String {
    format!("{GATE_ID_PREFIX}{}", random_id_suffix())
}

#[must_use]
pub fn new_history_id() -> String {
    format!("{HISTORY_ID_PREFIX}{}", random_id_suffix())
}

#[must_use]
pub fn new_template_id() -> String {
    format!("{TEMPLATE_ID_PREFIX}{}", random_id_suffix())
}

/// Composes `<ancestor>.<ordinal>`. The caller supplies the ordinal, which
/// must be one more than the ancestor's lifetime child count.
#[must_use]
pub fn derive_subtask_id(ancestor_id: &str, ordinal: u32) -> String {
    format!("{ancestor_id}.{ordinal}")
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Ancestry {
    pub root_id: String,
    /// `None` for root ids.
    pub parent_id: Option<String>,
    pub depth: usize,
}

/// Splits a task id into its root, immediate parent and depth.
///
/// # Errors
/// Returns [`GuardrailsError::Validation`] when `id` is not a well-formed task id.
pub fn parse_ancestry(id: &str) -> Result<Ancestry, GuardrailsError> {
    validate_task_id(id)?;

    let root_len = TASK_ID_PREFIX.len() + ID_HEX_LEN;
    let (root_id, suffix) = id.split_at(root_len);
    let depth = suffix.matches('.').count();
    let parent_id = if depth == 0 {
        None
    } else {
        id.rfind('.').map(|idx| id[..idx].to_string())
    };

    Ok(Ancestry {
        root_id: root_id.to_string(),
        parent_id,
        depth,
    })
}

/// Checks `gur-<8 lowercase hex>(.<integer >= 1>)*`.
///
/// # Errors
/// Returns [`GuardrailsError::Validation`] naming the id and the first defect found.
pub fn validate_task_id(id: &str) -> Result<(), GuardrailsError> {
    let invalid =
        |reason: &str| GuardrailsError::Validation(format!("invalid task id '{id}': {reason}"));

    let rest = match id.strip_prefix(TASK_ID_PREFIX) {
        Some(rest) => rest,
        None => return Err(invalid("expected prefix gur-")),
    };

    let mut segments = rest.split('.');
    let root = segments.next().unwrap_or_default();
    if !is_lower_hex(root) {
        return Err(invalid("expected 8 lowercase hex characters after the prefix"));
    }

    for segment in segments {
        if segment.is_empty() {
            return Err(invalid("empty subtask segment"));
        }
        if !segment.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(invalid("subtask segments must be numeric"));
        }
        if segment.bytes().all(|byte| byte == b'0') {
            return Err(invalid("subtask segments must be >= 1"));
        }
    }

    Ok(())
}

#[must_use]
pub fn is_valid_task_id(id: &str) -> bool {
    validate_task_id(id).is_ok()
}

/// Checks `<prefix><8 lowercase hex>` for gate, history and template ids.
///
/// # Errors
/// Returns [`GuardrailsError::Validation`] when the id is malformed.
pub fn validate_flat_id(id: &str, prefix: &str) -> Result<(), GuardrailsError> {
    match id.strip_prefix(prefix) {
        Some(rest) if is_lower_hex(rest) => Ok(()),
        _ => Err(GuardrailsError::Validation(format!(
            "invalid id '{id}': expected {prefix} followed by 8 lowercase hex characters"
        ))),
    }
}

fn is_lower_hex(value: &str) -> bool {
    value.len() == ID_HEX_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Closed,
    Archived,
}

impl TaskStatus {
    pub const ALL: [Self; 4] = [Self::Open, Self::InProgress, Self::Closed, Self::Archived];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Open or in progress.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const CRITICAL: Self = Self(0);
    pub const HIGH: Self = Self(1);
    pub const MEDIUM: Self = Self(2);
    pub const LOW: Self = Self(3);
    pub const LOWEST: Self = Self(4);

    /// # Errors
    /// Returns [`GuardrailsError::InvariantViolation`] outside `0..=4`.
    pub fn new(value: i64) -> Result<Self, GuardrailsError> {
        match u8::try_from(value) {
            Ok(raw) if raw <= Self::LOWEST.0 => Ok(Self(raw)),
            _ => Err(GuardrailsError::InvariantViolation(format!(
                "invalid priority {value}: must be 0 (critical) to 4 (lowest)"
            ))),
        }
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self.0 {
            0 => "P0 (Critical)",
            1 => "P1 (High)",
            2 => "P2 (Medium)",
            3 => "P3 (Low)",
            _ => "P4 (Lowest)",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl TryFrom<u8> for Priority {
    type Error = GuardrailsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(i64::from(value))
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Blocks,
    Related,
    #[serde(rename = "parent-child")]
    ParentChild,
}

impl DependencyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Related => "related",
            Self::ParentChild => "parent-child",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "blocks" => Some(Self::Blocks),
            "related" => Some(Self::Related),
            "parent-child" => Some(Self::ParentChild),
            _ => None,
        }
    }
}

impl Default for DependencyType {
    fn default() -> Self {
        Self::Blocks
    }
}

/// Status of a gate-task link and of a gate's most recent global result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Passed,
    Failed,
    Skipped,
}

impl GateStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl Display for GateStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result supplied to a verification call. A link can never be verified back
/// to `pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Passed,
    Failed,
    Skipped,
}

impl VerificationOutcome {
    #[must_use]
    pub fn status(self) -> GateStatus {
        match self {
            Self::Passed => GateStatus::Passed,
            Self::Failed => GateStatus::Failed,
            Self::Skipped => GateStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryField {
    Title,
    Description,
    Priority,
    Type,
    Status,
    Assignee,
    Notes,
    CloseReason,
    LabelAdded,
    LabelRemoved,
    Compacted,
    Deleted,
}

impl HistoryField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Priority => "priority",
            Self::Type => "type",
            Self::Status => "status",
            Self::Assignee => "assignee",
            Self::Notes => "notes",
            Self::CloseReason => "close_reason",
            Self::LabelAdded => "label_added",
            Self::LabelRemoved => "label_removed",
            Self::Compacted => "compacted",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "title" => Some(Self::Title),
            "description" => Some(Self::Description),
            "priority" => Some(Self::Priority),
            "type" => Some(Self::Type),
            "status" => Some(Self::Status),
            "assignee" => Some(Self::Assignee),
            "notes" => Some(Self::Notes),
            "close_reason" => Some(Self::CloseReason),
            "label_added" => Some(Self::LabelAdded),
            "label_removed" => Some(Self::LabelRemoved),
            "compacted" => Some(Self::Compacted),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(rename = "type")]
    pub task_type: String,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub notes: String,
    pub close_reason: Option<String>,
    pub summary: Option<String>,
    pub compacted: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none", default)]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Task {
    /// Checks the record-level invariants.
    ///
    /// # Errors
    /// Returns [`GuardrailsError::Validation`] for a malformed id or empty
    /// title, and [`GuardrailsError::InvariantViolation`] when close metadata
    /// disagrees with the status.
    pub fn validate(&self) -> Result<(), GuardrailsError> {
        validate_task_id(&self.id)?;

        if self.title.trim().is_empty() {
            return Err(GuardrailsError::Validation(format!(
                "task {} MUST have a title",
                self.id
            )));
        }

        let has_close_metadata = self.closed_at.is_some() && self.close_reason.is_some();
        let has_any_close_metadata = self.closed_at.is_some() || self.close_reason.is_some();
        match self.status {
            TaskStatus::Closed if !has_close_metadata => {
                Err(GuardrailsError::InvariantViolation(format!(
                    "closed task {} MUST carry closed_at and close_reason",
                    self.id
                )))
            }
            TaskStatus::Open | TaskStatus::InProgress if has_any_close_metadata => {
                Err(GuardrailsError::InvariantViolation(format!(
                    "task {} is {} but still carries close metadata",
                    self.id, self.status
                )))
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == TaskStatus::Closed
    }

    /// # Errors
    /// Returns [`GuardrailsError::InvariantViolation`] when the task is
    /// already closed or archived, or the reason is empty.
    pub fn apply_close(&mut self, reason: &str, at: OffsetDateTime) -> Result<(), GuardrailsError> {
        self.ensure_closable()?;
        if reason.trim().is_empty() {
            return Err(GuardrailsError::Validation(format!(
                "closing task {} requires a reason",
                self.id
            )));
        }

        self.status = TaskStatus::Closed;
        self.close_reason = Some(reason.to_string());
        self.closed_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    /// Rejects closing a task that is already closed or archived, naming the
    /// existing close date and reason.
    ///
    /// # Errors
    /// Returns [`GuardrailsError::InvariantViolation`].
    pub fn ensure_closable(&self) -> Result<(), GuardrailsError> {
        match self.status {
            TaskStatus::Closed => {
                let closed_on = self
                    .closed_at
                    .and_then(|at| format_rfc3339(at).ok())
                    .unwrap_or_else(|| "an unknown date".to_string());
                Err(GuardrailsError::InvariantViolation(format!(
                    "cannot close task {}: already closed on {closed_on} with reason: {}",
                    self.id,
                    self.close_reason.as_deref().unwrap_or("")
                )))
            }
            TaskStatus::Archived => Err(GuardrailsError::InvariantViolation(format!(
                "cannot close task {}: it is archived",
                self.id
            ))),
            TaskStatus::Open | TaskStatus::InProgress => Ok(()),
        }
    }

    /// # Errors
    /// Returns [`GuardrailsError::InvariantViolation`] unless the task is closed.
    pub fn apply_reopen(&mut self, at: OffsetDateTime) -> Result<(), GuardrailsError> {
        if !self.is_closed() {
            return Err(GuardrailsError::InvariantViolation(format!(
                "cannot reopen task {}: status is {}, expected closed",
                self.id, self.status
            )));
        }

        self.status = TaskStatus::Open;
        self.close_reason = None;
        self.closed_at = None;
        self.updated_at = at;
        Ok(())
    }

    /// Archived tasks keep their close reason and date.
    ///
    /// # Errors
    /// Returns [`GuardrailsError::InvariantViolation`] unless the task is closed.
    pub fn apply_archive(&mut self, at: OffsetDateTime) -> Result<(), GuardrailsError> {
        if !self.is_closed() {
            return Err(GuardrailsError::InvariantViolation(format!(
                "cannot archive task {}: status is {}, only closed tasks can be archived",
                self.id, self.status
            )));
        }

        self.status = TaskStatus::Archived;
        self.updated_at = at;
        Ok(())
    }

    /// # Errors
    /// Returns [`GuardrailsError::InvariantViolation`] unless the task is archived.
    pub fn apply_unarchive(&mut self, at: OffsetDateTime) -> Result<(), GuardrailsError> {
        if self.status != TaskStatus::Archived {
            return Err(GuardrailsError::InvariantViolation(format!(
                "cannot unarchive task {}: status is {}, expected archived",
                self.id, self.status
            )));
        }

        self.status = TaskStatus::Closed;
        self.updated_at = at;
        Ok(())
    }

    /// Returns `false` when the label was already present.
    pub fn add_label(&mut self, label: &str) -> bool {
        if self.labels.iter().any(|existing| existing == label) {
            return false;
        }
        self.labels.push(label.to_string());
        true
    }

    /// Returns `false` when the label was not present.
    pub fn remove_label(&mut self, label: &str) -> bool {
        let before = self.labels.len();
        self.labels.retain(|existing| existing != label);
        self.labels.len() != before
    }

    /// Appends `[YYYY-MM-DD HH:MM:SS] note` as a new line and returns the line.
    ///
    /// # Errors
    /// Returns [`GuardrailsError::Validation`] when the timestamp cannot be formatted.
    pub fn append_notes(&mut self, note: &str, at: OffsetDateTime) -> Result<String, GuardrailsError> {
        let stamp = at
            .to_offset(UtcOffset::UTC)
            .format(time::macros::format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .map_err(|err| GuardrailsError::Validation(format!("failed to format note time: {err}")))?;
        let line = format!("[{stamp}] {note}");

        if !self.notes.is_empty() && !self.notes.ends_with('\n') {
            self.notes.push('\n');
        }
        self.notes.push_str(&line);
        self.notes.push('\n');
        Ok(line)
    }

    /// One-line summary kept after compaction.
    #[must_use]
    pub fn compaction_summary(&self) -> String {
        let mut summary = self.title.clone();
        if let Some(reason) = self.close_reason.as_deref().filter(|reason| !reason.is_empty()) {
            summary.push_str(" | Closed: ");
            summary.push_str(reason);
        }
        if self.task_type != DEFAULT_TASK_TYPE {
            summary = format!("[{}] {summary}", self.task_type);
        }
        summary
    }

    /// # Errors
    /// Returns [`GuardrailsError::InvariantViolation`] unless the task is
    /// closed or archived and not yet compacted.
    pub fn ensure_compactable(&self) -> Result<(), GuardrailsError> {
        if !matches!(self.status, TaskStatus::Closed | TaskStatus::Archived) {
            return Err(GuardrailsError::InvariantViolation(format!(
                "cannot compact task {}: status is {}, only closed or archived tasks can be compacted",
                self.id, self.status
            )));
        }
        if self.compacted {
            return Err(GuardrailsError::InvariantViolation(format!(
                "task {} is already compacted",
                self.id
            )));
        }
        Ok(())
    }

    /// # Errors
    /// See [`Task::ensure_compactable`].
    pub fn apply_compaction(&mut self, at: OffsetDateTime) -> Result<(), GuardrailsError> {
        self.ensure_compactable()?;
        self.summary = Some(self.compaction_summary());
        self.description.clear();
        self.notes.clear();
        self.compacted = true;
        self.updated_at = at;
        Ok(())
    }
}

/// Lowercases and checks a task type token. Any single word is accepted;
/// [`CONVENTIONAL_TASK_TYPES`] lists the usual ones.
///
/// # Errors
/// Returns [`GuardrailsError::Validation`] for empty or whitespace-containing types.
pub fn normalize_task_type(raw: &str) -> Result<String, GuardrailsError> {
    let value = raw.trim().to_ascii_lowercase();
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(GuardrailsError::Validation(format!(
            "invalid task type '{raw}': expected a single word such as task, bug, feature or epic"
        )));
    }
    Ok(value)
}

#[must_use]
pub fn is_conventional_task_type(value: &str) -> bool {
    CONVENTIONAL_TASK_TYPES.contains(&value)
}

/// Request to create a task. Unset fields fall back to the template, then to
/// the built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub task_type: Option<String>,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub parent_id: Option<String>,
    /// Template name or id.
    pub template: Option<String>,
}

/// A [`NewTask`] after template defaults have been applied and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub task_type: String,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub parent_id: Option<String>,
}

impl NewTask {
    /// # Errors
    /// Returns [`GuardrailsError::Validation`] when no title is available, the
    /// type is malformed, or the parent id is malformed.
    pub fn resolve(&self, template: Option<&Template>) -> Result<TaskDraft, GuardrailsError> {
        let title = self
            .title
            .clone()
            .or_else(|| template.map(|tmpl| tmpl.title.clone()))
            .unwrap_or_default();
        if title.trim().is_empty() {
            return Err(GuardrailsError::Validation(
                "title is required (pass one or use a template that has one)".to_string(),
            ));
        }

        let task_type = match self
            .task_type
            .as_deref()
            .or_else(|| template.map(|tmpl| tmpl.task_type.as_str()))
        {
            Some(raw) => normalize_task_type(raw)?,
            None => DEFAULT_TASK_TYPE.to_string(),
        };

        if let Some(parent_id) = self.parent_id.as_deref() {
            validate_task_id(parent_id)?;
        }

        let mut labels: Vec<String> = Vec::new();
        let template_labels = template.map(|tmpl| tmpl.labels.as_slice()).unwrap_or_default();
        for label in template_labels.iter().chain(self.labels.iter()) {
            let label = label.trim();
            if !label.is_empty() && !labels.iter().any(|existing| existing == label) {
                labels.push(label.to_string());
            }
        }

        Ok(TaskDraft {
            title: title.trim().to_string(),
            description: self
                .description
                .clone()
                .or_else(|| template.map(|tmpl| tmpl.description.clone()))
                .unwrap_or_default(),
            priority: self
                .priority
                .or_else(|| template.map(|tmpl| tmpl.priority))
                .unwrap_or_default(),
            task_type,
            labels,
            assignee: self.assignee.clone().filter(|value| !value.trim().is_empty()),
            parent_id: self.parent_id.clone(),
        })
    }
}

/// Field edits for an existing task. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
    /// `Some("")` clears the assignee.
    pub assignee: Option<String>,
    /// Appended as a timestamped line, never replaces existing notes.
    pub notes: Option<String>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl TaskPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.task_type.is_none()
            && self.status.is_none()
            && self.assignee.is_none()
            && self.notes.is_none()
            && self.add_labels.is_empty()
            && self.remove_labels.is_empty()
    }

    /// Title, description and type define what a passed gate verified.
    #[must_use]
    pub fn changes_scope(&self) -> bool {
        self.title.is_some() || self.description.is_some() || self.task_type.is_some()
    }

    /// Status edits through update are limited to `open` <-> `in_progress`.
    ///
    /// # Errors
    /// Returns [`GuardrailsError::InvariantViolation`] for any other transition.
    pub fn validate_status_change(&self, task: &Task) -> Result<(), GuardrailsError> {
        let Some(target) = self.status else {
            return Ok(());
        };

        if matches!(task.status, TaskStatus::Closed | TaskStatus::Archived) {
            return Err(GuardrailsError::InvariantViolation(format!(
                "cannot change status of {} task {}: use reopen first",
                task.status, task.id
            )));
        }

        if !target.is_active() {
            return Err(GuardrailsError::InvariantViolation(format!(
                "invalid status '{target}' for task {}: update accepts open or in_progress, use close or archive instead",
                task.id
            )));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dependency graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dependency {
    pub blocker_id: String,
    pub blocked_id: String,
    pub dep_type: DependencyType,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Adjacency map of `blocks` edges keyed by blocker id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    blocks: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_edges<I, S>(edges: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut graph = Self::new();
        for (blocker, blocked) in edges {
            graph.insert_edge(blocker.into(), blocked.into());
        }
        graph
    }

    fn insert_edge(&mut self, blocker: String, blocked: String) -> bool {
        self.blocks.entry(blocker).or_default().insert(blocked)
    }

    #[must_use]
    pub fn contains_edge(&self, blocker: &str, blocked: &str) -> bool {
        self.blocks
            .get(blocker)
            .is_some_and(|targets| targets.contains(blocked))
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.blocks.values().map(BTreeSet::len).sum()
    }

    /// Tasks directly blocked by `blocker`.
    pub fn blocked_by(&self, blocker: &str) -> impl Iterator<Item = &str> {
        self.blocks
            .get(blocker)
            .into_iter()
            .flat_map(|targets| targets.iter().map(String::as_str))
    }

    /// Breadth-first search along `blocks` edges from `from`.
    #[must_use]
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for next in self.blocked_by(current) {
                if !visited.contains(next) {
                    queue.push_back(next);
                }
            }
        }

        false
    }

    /// Rejects a self-block and any edge that would close a cycle.
    ///
    /// # Errors
    /// Returns [`GuardrailsError::InvariantViolation`] naming both ids.
    pub fn check_new_edge(&self, blocker: &str, blocked: &str) -> Result<(), GuardrailsError> {
        if blocker == blocked {
            return Err(GuardrailsError::InvariantViolation(format!(
                "task cannot block itself: {blocker}"
            )));
        }

        if self.reaches(blocked, blocker) {
            return Err(GuardrailsError::InvariantViolation(format!(
                "circular dependency detected: {blocker} already depends on {blocked}"
            )));
        }

        Ok(())
    }

    /// Checks then inserts. Returns `false` when the edge already existed.
    ///
    /// # Errors
    /// See [`DependencyGraph::check_new_edge`].
    pub fn try_add_edge(&mut self, blocker: &str, blocked: &str) -> Result<bool, GuardrailsError> {
        self.check_new_edge(blocker, blocked)?;
        Ok(self.insert_edge(blocker.to_string(), blocked.to_string()))
    }

    pub fn remove_edge(&mut self, blocker: &str, blocked: &str) -> bool {
        let Some(targets) = self.blocks.get_mut(blocker) else {
            return false;
        };
        let removed = targets.remove(blocked);
        if targets.is_empty() {
            self.blocks.remove(blocker);
        }
        removed
    }

    /// Kahn's algorithm over every node mentioned by an edge.
    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for (blocker, targets) in &self.blocks {
            in_degree.entry(blocker.as_str()).or_insert(0);
            for blocked in targets {
                *in_degree.entry(blocked.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut visited = 0_usize;

        while let Some(node) = queue.pop_front() {
            visited += 1;
            for next in self.blocked_by(node) {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        visited == in_degree.len()
    }
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gate {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(rename = "type")]
    pub gate_type: String,
    pub priority: Priority,
    pub preconditions: String,
    pub steps: String,
    pub expected_result: String,
    pub command: Option<String>,
    pub labels: Vec<String>,
    pub last_result: GateStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    pub last_run_by: Option<String>,
    pub last_run_notes: Option<String>,
    pub run_count: u32,
    pub pass_count: u32,
    pub fail_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Gate {
    /// Updates the informational lifetime counters.
    pub fn record_run(
        &mut self,
        outcome: VerificationOutcome,
        run_by: &str,
        notes: Option<&str>,
        at: OffsetDateTime,
    ) {
        self.last_result = outcome.status();
        self.last_run_at = Some(at);
        self.last_run_by = Some(run_by.to_string());
        self.last_run_notes = notes.map(ToString::to_string);
        self.run_count = self.run_count.saturating_add(1);
        match outcome {
            VerificationOutcome::Passed => self.pass_count = self.pass_count.saturating_add(1),
            VerificationOutcome::Failed => self.fail_count = self.fail_count.saturating_add(1),
            VerificationOutcome::Skipped => {}
        }
        self.updated_at = at;
    }

    /// Percentage of runs that passed; 0 when never run.
    #[must_use]
    pub fn pass_rate(&self) -> f64 {
        if self.run_count == 0 {
            return 0.0;
        }
        f64::from(self.pass_count) / f64::from(self.run_count) * 100.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewGate {
    pub title: String,
    pub description: String,
    pub category: String,
    pub gate_type: Option<String>,
    pub priority: Option<Priority>,
    pub preconditions: String,
    pub steps: String,
    pub expected_result: String,
    pub command: Option<String>,
    pub labels: Vec<String>,
}

impl NewGate {
    /// # Errors
    /// Returns [`GuardrailsError::Validation`] when the title is empty.
    pub fn validate(&self) -> Result<(), GuardrailsError> {
        if self.title.trim().is_empty() {
            return Err(GuardrailsError::Validation(
                "gate title MUST be provided".to_string(),
            ));
        }
        if self
            .gate_type
            .as_deref()
            .is_some_and(|value| value.trim().is_empty())
        {
            return Err(GuardrailsError::Validation(
                "gate type MUST NOT be blank when provided".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn into_gate(self, id: String, at: OffsetDateTime) -> Gate {
        Gate {
            id,
            title: self.title.trim().to_string(),
            description: self.description,
            category: self.category,
            gate_type: self
                .gate_type
                .map(|value| value.trim().to_string())
                .unwrap_or_else(|| DEFAULT_GATE_TYPE.to_string()),
            priority: self.priority.unwrap_or_default(),
            preconditions: self.preconditions,
            steps: self.steps,
            expected_result: self.expected_result,
            command: self.command.filter(|value| !value.trim().is_empty()),
            labels: self.labels,
            last_result: GateStatus::Pending,
            last_run_at: None,
            last_run_by: None,
            last_run_notes: None,
            run_count: 0,
            pass_count: 0,
            fail_count: 0,
            created_at: at,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateTaskLink {
    pub gate_id: String,
    pub task_id: String,
    pub status: GateStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub verified_at: Option<OffsetDateTime>,
    pub verified_by: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl GateTaskLink {
    #[must_use]
    pub fn pending(gate_id: &str, task_id: &str, at: OffsetDateTime) -> Self {
        Self {
            gate_id: gate_id.to_string(),
            task_id: task_id.to_string(),
            status: GateStatus::Pending,
            verified_at: None,
            verified_by: None,
            notes: None,
            created_at: at,
        }
    }

    /// Overwrites the previous verification.
    pub fn apply_verification(
        &mut self,
        outcome: VerificationOutcome,
        verifier: &str,
        notes: Option<&str>,
        at: OffsetDateTime,
    ) {
        self.status = outcome.status();
        self.verified_at = Some(at);
        self.verified_by = Some(verifier.to_string());
        self.notes = notes.map(ToString::to_string);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateRun {
    pub run_seq: i64,
    pub gate_id: String,
    pub task_id: Option<String>,
    pub result: GateStatus,
    pub run_by: String,
    pub notes: Option<String>,
    pub duration_ms: Option<u64>,
    pub output: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Input to a verification call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verification {
    pub outcome: VerificationOutcome,
    pub verifier: String,
    pub notes: Option<String>,
    pub duration_ms: Option<u64>,
    pub output: Option<String>,
}

impl Verification {
    #[must_use]
    pub fn new(outcome: VerificationOutcome) -> Self {
        Self {
            outcome,
            verifier: DEFAULT_VERIFIER.to_string(),
            notes: None,
            duration_ms: None,
            output: None,
        }
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: &str) -> Self {
        self.verifier = verifier.to_string();
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
}

/// A link joined with its gate title, as needed for readiness messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkedGate {
    pub gate_id: String,
    pub gate_title: String,
    pub status: GateStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseReadiness {
    pub task_id: String,
    pub linked_gates: usize,
    pub failing: Vec<LinkedGate>,
}

impl CloseReadiness {
    /// Ready iff at least one gate is linked and every link is `passed`.
    #[must_use]
    pub fn evaluate(task_id: &str, links: &[LinkedGate]) -> Self {
        Self {
            task_id: task_id.to_string(),
            linked_gates: links.len(),
            failing: links
                .iter()
                .filter(|link| link.status != GateStatus::Passed)
                .cloned()
                .collect(),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.linked_gates > 0 && self.failing.is_empty()
    }

    /// Human-readable reason the task is not gate-ready.
    #[must_use]
    pub fn describe_failure(&self) -> Option<String> {
        if self.linked_gates == 0 {
            return Some(format!(
                "task {} has no gates linked; link at least one gate and record a passing verification",
                self.task_id
            ));
        }
        if self.failing.is_empty() {
            return None;
        }

        let listed = self
            .failing
            .iter()
            .map(|gate| format!("{} ({}): {}", gate.gate_id, gate.gate_title, gate.status))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!(
            "task {} has {} of {} gate(s) not verified: {listed}",
            self.task_id,
            self.failing.len(),
            self.linked_gates
        ))
    }

    #[must_use]
    pub fn to_error(&self) -> Option<GuardrailsError> {
        self.describe_failure().map(GuardrailsError::Precondition)
    }
}

// ---------------------------------------------------------------------------
// Closure decision
// ---------------------------------------------------------------------------

/// State gathered by the store before deciding whether a task may close.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseChecks {
    pub open_blockers: Vec<String>,
    pub open_subtasks: Vec<String>,
    pub readiness: CloseReadiness,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseDecision {
    Proceed { gate_override: bool },
    /// Forced close whose gates are not ready; the caller must obtain an
    /// interactive confirmation and retry with the override granted.
    ConfirmGateOverride(CloseReadiness),
}

/// Decides a close attempt. Blockers and open subtasks always reject; `force`
/// can only bypass the gate check, and only once `override_granted` is set.
///
/// # Errors
/// Returns [`GuardrailsError::InvariantViolation`] for tasks already closed or
/// archived and [`GuardrailsError::Precondition`] for blockers, subtasks or
/// unready gates.
pub fn decide_close(
    task: &Task,
    checks: &CloseChecks,
    force: bool,
    override_granted: bool,
) -> Result<CloseDecision, GuardrailsError> {
    task.ensure_closable()?;

    if !checks.open_blockers.is_empty() {
        return Err(GuardrailsError::Precondition(format!(
            "cannot close task {}: blocked by {} open task(s): {}",
            task.id,
            checks.open_blockers.len(),
            checks.open_blockers.join(", ")
        )));
    }

    if !checks.open_subtasks.is_empty() {
        return Err(GuardrailsError::Precondition(format!(
            "cannot close task {}: has {} open subtask(s): {}",
            task.id,
            checks.open_subtasks.len(),
            checks.open_subtasks.join(", ")
        )));
    }

    if checks.readiness.is_ready() {
        return Ok(CloseDecision::Proceed {
            gate_override: false,
        });
    }

    if !force {
        return Err(match checks.readiness.to_error() {
            Some(err) => err,
            None => GuardrailsError::Precondition(format!(
                "cannot close task {}: gates are not ready",
                task.id
            )),
        });
    }

    if override_granted {
        Ok(CloseDecision::Proceed {
            gate_override: true,
        })
    } else {
        Ok(CloseDecision::ConfirmGateOverride(checks.readiness.clone()))
    }
}

#[must_use]
pub fn effective_close_reason(reason: &str, gate_override: bool) -> String {
    if gate_override {
        format!("{FORCE_CLOSE_PREFIX}{reason}")
    } else {
        reason.to_string()
    }
}

// ---------------------------------------------------------------------------
// Audit trail, templates, project config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: String,
    pub task_id: String,
    pub field: HistoryField,
    pub old_value: String,
    pub new_value: String,
    pub changed_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    #[serde(rename = "type")]
    pub task_type: String,
    pub labels: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Template {
    /// An open-task request carrying this template's defaults.
    #[must_use]
    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            template: Some(self.id.clone()),
            ..NewTask::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTemplate {
    pub name: String,
    pub title: String,
    pub description: String,
    pub priority: Option<Priority>,
    pub task_type: Option<String>,
    pub labels: Vec<String>,
}

impl NewTemplate {
    /// # Errors
    /// Returns [`GuardrailsError::Validation`] for an empty name or a
    /// malformed type.
    pub fn into_template(self, id: String, at: OffsetDateTime) -> Result<Template, GuardrailsError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(GuardrailsError::Validation(
                "template name MUST be provided".to_string(),
            ));
        }

        let task_type = match self.task_type.as_deref() {
            Some(raw) => normalize_task_type(raw)?,
            None => DEFAULT_TASK_TYPE.to_string(),
        };

        Ok(Template {
            id,
            name,
            title: self.title,
            description: self.description,
            priority: self.priority.unwrap_or_default(),
            task_type,
            labels: self.labels,
            created_at: at,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    SchemaVersion,
    ProjectName,
    InitializedAt,
    IdPrefix,
    Mode,
}

impl ConfigKey {
    pub const ALL: [Self; 5] = [
        Self::SchemaVersion,
        Self::ProjectName,
        Self::InitializedAt,
        Self::IdPrefix,
        Self::Mode,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SchemaVersion => "schema_version",
            Self::ProjectName => "project_name",
            Self::InitializedAt => "initialized_at",
            Self::IdPrefix => "id_prefix",
            Self::Mode => "mode",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schema_version" => Some(Self::SchemaVersion),
            "project_name" => Some(Self::ProjectName),
            "initialized_at" => Some(Self::InitializedAt),
            "id_prefix" => Some(Self::IdPrefix),
            "mode" => Some(Self::Mode),
            _ => None,
        }
    }

    /// Keys managed by the store itself cannot be overwritten.
    #[must_use]
    pub fn is_user_settable(self) -> bool {
        matches!(self, Self::ProjectName | Self::Mode)
    }

    /// # Errors
    /// Returns [`GuardrailsError::Validation`] for read-only keys, blank
    /// values, or an unknown mode.
    pub fn validate_value(self, value: &str) -> Result<(), GuardrailsError> {
        if !self.is_user_settable() {
            return Err(GuardrailsError::Validation(format!(
                "config key {} is read-only",
                self.as_str()
            )));
        }
        if value.trim().is_empty() {
            return Err(GuardrailsError::Validation(format!(
                "config key {} MUST NOT be blank",
                self.as_str()
            )));
        }
        if self == Self::Mode && ProjectMode::parse(value).is_none() {
            return Err(GuardrailsError::Validation(format!(
                "invalid mode '{value}': expected default, stealth or contributor"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectMode {
    #[default]
    Default,
    Stealth,
    Contributor,
}

impl ProjectMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Stealth => "stealth",
            Self::Contributor => "contributor",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "default" => Some(Self::Default),
            "stealth" => Some(Self::Stealth),
            "contributor" => Some(Self::Contributor),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`GuardrailsError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, GuardrailsError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| GuardrailsError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(GuardrailsError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as whole-second RFC3339 UTC, so stored strings sort
/// chronologically.
///
/// # Errors
/// Returns [`GuardrailsError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, GuardrailsError> {
    truncate_to_second(value)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            GuardrailsError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Current time in UTC truncated to whole seconds.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    truncate_to_second(OffsetDateTime::now_utc())
}

fn truncate_to_second(value: OffsetDateTime) -> OffsetDateTime {
    let value = value.to_offset(UtcOffset::UTC);
    value - Duration::nanoseconds(i64::from(value.nanosecond()))
}

/// Parses an age such as `36h`, `30d` or `2w`.
///
/// # Errors
/// Returns [`GuardrailsError::Validation`] for any other shape or a zero amount.
pub fn parse_age(raw: &str) -> Result<Duration, GuardrailsError> {
    let raw = raw.trim();
    let invalid = || {
        GuardrailsError::Validation(format!(
            "invalid age '{raw}': expected <N>h, <N>d or <N>w (for example 30d)"
        ))
    };

    let unit = raw.chars().last().ok_or_else(invalid)?;
    let amount: i64 = raw[..raw.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }

    let unit_seconds: i64 = match unit {
        'h' => 3_600,
        'd' => 86_400,
        'w' => 604_800,
        _ => return Err(invalid()),
    };
    amount
        .checked_mul(unit_seconds)
        .map(Duration::seconds)
        .ok_or_else(|| GuardrailsError::Validation(format!("age '{raw}' is out of range")))
}

/// The instant `age` before now.
///
/// # Errors
/// Returns [`GuardrailsError::Validation`] when the result falls outside the
/// representable date range.
pub fn cutoff_before_now(age: Duration) -> Result<OffsetDateTime, GuardrailsError> {
    now_utc().checked_sub(age).ok_or_else(|| {
        GuardrailsError::Validation(format!(
            "age of {} days reaches past the earliest representable date",
            age.whole_days()
        ))
    })
}
