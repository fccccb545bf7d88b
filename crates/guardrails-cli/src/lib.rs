//! Command surface of the `gur` task tracker.
//!
//! Hosts that embed Guardrails should go through:
//! - [`run_cli`] for full parsed CLI execution, including project discovery.
//! - [`run_with_db`] for executing a [`Command`] against an explicit DB path.
//! - [`run_command`] for execution against an already-open [`SqliteTaskStore`].
//!
//! The binary installs logging through [`init_tracing`]; embedding hosts keep
//! their own subscriber.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use guardrails_core::{
    parse_age, ConfigKey, DependencyType, Gate, GateStatus, GuardrailsError, HistoryEntry, LinkedGate,
    NewGate, NewTask, NewTemplate, Priority, ProjectMode, Task, TaskPatch, TaskStatus, Template,
    Verification, VerificationOutcome, DEFAULT_ACTOR, DEFAULT_VERIFIER,
};
use guardrails_store_sqlite::{
    CloseRequest, ConfigEntry, Confirmer, GateFilter, SqliteTaskStore, TaskDependencies,
    TaskFilter,
};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const PROJECT_DIR: &str = ".guardrails";
pub const DB_FILE: &str = "db.sqlite";
pub const LOG_ENV: &str = "GUR_LOG";
const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Parser)]
#[command(name = "gur")]
#[command(about = "Task tracker with verification gates")]
pub struct Cli {
    /// Database path. Defaults to `.guardrails/db.sqlite` in the nearest
    /// enclosing project.
    #[arg(long, env = "GUR_DB", global = true)]
    db: Option<PathBuf>,

    /// Recorded as the actor on history entries.
    #[arg(long, env = "GUR_ACTOR", default_value = DEFAULT_ACTOR, global = true)]
    actor: String,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create `.guardrails/` and seed project config.
    Init(InitArgs),
    Create(CreateArgs),
    Show(TaskIdArgs),
    Update(UpdateArgs),
    List(ListArgs),
    Search(SearchArgs),
    Close(CloseArgs),
    Reopen(TaskIdArgs),
    /// Archive one closed task, or every closed task with `--closed`.
    Archive(ArchiveArgs),
    Unarchive(TaskIdArgs),
    Compact(CompactArgs),
    /// Soft delete; `purge` removes the row.
    Delete(TaskIdArgs),
    Purge,
    /// Open tasks with no open blockers.
    Ready(ReadyArgs),
    History(HistoryArgs),
    Stats,
    Summary,
    Cleanup(CleanupArgs),
    Dep {
        #[command(subcommand)]
        command: Box<DepCommand>,
    },
    Gate {
        #[command(subcommand)]
        command: Box<GateCommand>,
    },
    Template {
        #[command(subcommand)]
        command: Box<TemplateCommand>,
    },
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
}

#[derive(Debug, Args)]
pub struct InitArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long, value_enum, default_value_t = ModeArg::Default)]
    mode: ModeArg,
}

#[derive(Debug, Args)]
pub struct TaskIdArgs {
    id: String,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    title: Option<String>,
    #[arg(short, long)]
    description: Option<String>,
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=4))]
    priority: Option<u8>,
    #[arg(short = 't', long = "type")]
    task_type: Option<String>,
    #[arg(short, long = "label")]
    labels: Vec<String>,
    #[arg(short, long)]
    assignee: Option<String>,
    #[arg(long)]
    parent: Option<String>,
    #[arg(long)]
    template: Option<String>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(short, long)]
    description: Option<String>,
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=4))]
    priority: Option<u8>,
    #[arg(short = 't', long = "type")]
    task_type: Option<String>,
    #[arg(short, long, value_enum)]
    status: Option<ActiveStatusArg>,
    /// Pass an empty string to clear.
    #[arg(short, long)]
    assignee: Option<String>,
    /// Appended as a timestamped line.
    #[arg(long)]
    notes: Option<String>,
    #[arg(long = "add-label")]
    add_labels: Vec<String>,
    #[arg(long = "remove-label")]
    remove_labels: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(short, long, value_enum)]
    status: Option<StatusArg>,
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=4))]
    priority: Option<u8>,
    #[arg(short = 't', long = "type")]
    task_type: Option<String>,
    #[arg(short, long)]
    assignee: Option<String>,
    #[arg(short, long)]
    label: Option<String>,
    #[arg(long)]
    parent: Option<String>,
    /// Include archived tasks.
    #[arg(long)]
    all: bool,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    query: String,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CloseArgs {
    id: String,
    #[arg(short, long)]
    reason: String,
    /// Bypass unverified gates after interactive confirmation.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
pub struct ArchiveArgs {
    id: Option<String>,
    #[arg(long, conflicts_with = "id")]
    closed: bool,
    /// Only tasks closed longer ago than this, e.g. `30d`.
    #[arg(long, requires = "closed")]
    older_than: Option<String>,
}

#[derive(Debug, Args)]
pub struct CompactArgs {
    id: Option<String>,
    #[arg(long, conflicts_with = "id")]
    all: bool,
    #[arg(long, requires = "all")]
    older_than: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
pub struct ReadyArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    id: String,
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CleanupArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
pub enum DepCommand {
    Add(DepAddArgs),
    Remove(DepPairArgs),
    List(TaskIdArgs),
}

#[derive(Debug, Args)]
pub struct DepAddArgs {
    #[arg(long)]
    blocker: String,
    #[arg(long)]
    blocked: String,
    #[arg(long = "type", value_enum, default_value_t = DepTypeArg::Blocks)]
    dep_type: DepTypeArg,
}

#[derive(Debug, Args)]
pub struct DepPairArgs {
    #[arg(long)]
    blocker: String,
    #[arg(long)]
    blocked: String,
}

#[derive(Debug, Subcommand)]
pub enum GateCommand {
    Create(GateCreateArgs),
    List(GateListArgs),
    Show(GateIdArgs),
    Link(GateTaskArgs),
    Unlink(GateTaskArgs),
    Pass(GateVerifyArgs),
    Fail(GateVerifyArgs),
    Skip(GateVerifyArgs),
    /// Report whether a task may close.
    Check(TaskIdArgs),
}

#[derive(Debug, Args)]
pub struct GateCreateArgs {
    title: String,
    #[arg(short, long, default_value = "")]
    description: String,
    #[arg(short, long, default_value = "")]
    category: String,
    #[arg(short = 't', long = "type")]
    gate_type: Option<String>,
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=4))]
    priority: Option<u8>,
    #[arg(long, default_value = "")]
    preconditions: String,
    #[arg(long, default_value = "")]
    steps: String,
    #[arg(long = "expected", default_value = "")]
    expected_result: String,
    #[arg(long)]
    command: Option<String>,
    #[arg(short, long = "label")]
    labels: Vec<String>,
}

#[derive(Debug, Args)]
pub struct GateListArgs {
    #[arg(short, long)]
    category: Option<String>,
    #[arg(short = 't', long = "type")]
    gate_type: Option<String>,
    #[arg(long, value_enum)]
    result: Option<GateStatusArg>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct GateIdArgs {
    id: String,
}

#[derive(Debug, Args)]
pub struct GateTaskArgs {
    #[arg(long)]
    gate: String,
    #[arg(long)]
    task: String,
}

#[derive(Debug, Args)]
pub struct GateVerifyArgs {
    #[arg(long)]
    gate: String,
    #[arg(long)]
    task: String,
    #[arg(long, default_value = DEFAULT_VERIFIER)]
    verifier: String,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    duration_ms: Option<u64>,
    #[arg(long)]
    output: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TemplateCommand {
    Create(TemplateCreateArgs),
    List(JsonArgs),
    Show(TemplateNameArgs),
    Delete(TemplateNameArgs),
}

#[derive(Debug, Args)]
pub struct TemplateCreateArgs {
    name: String,
    #[arg(long, default_value = "")]
    title: String,
    #[arg(short, long, default_value = "")]
    description: String,
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=4))]
    priority: Option<u8>,
    #[arg(short = 't', long = "type")]
    task_type: Option<String>,
    #[arg(short, long = "label")]
    labels: Vec<String>,
}

#[derive(Debug, Args)]
pub struct TemplateNameArgs {
    name: String,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Get(ConfigGetArgs),
    Set(ConfigSetArgs),
    List(JsonArgs),
}

#[derive(Debug, Args)]
pub struct ConfigGetArgs {
    key: String,
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    key: String,
    value: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Default,
    Stealth,
    Contributor,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum StatusArg {
    Open,
    InProgress,
    Closed,
    Archived,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum ActiveStatusArg {
    Open,
    InProgress,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DepTypeArg {
    Blocks,
    Related,
    ParentChild,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GateStatusArg {
    Pending,
    Passed,
    Failed,
    Skipped,
}

/// Asks on the terminal through `dialoguer`. The answer `yes`, in any case,
/// confirms.
#[derive(Debug, Default)]
pub struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn is_interactive(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        let answer: String = dialoguer::Input::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
            .context("failed to read confirmation answer")?;
        Ok(is_affirmative(&answer))
    }
}

fn is_affirmative(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

#[derive(Debug, Serialize)]
struct TaskView {
    task: Task,
    dependencies: TaskDependencies,
    gates: Vec<LinkedGate>,
}

#[derive(Debug, Serialize)]
struct ReadinessView {
    task_id: String,
    ready: bool,
    linked_gates: usize,
    failing: Vec<LinkedGate>,
    open_blockers: Vec<String>,
    open_subtasks: Vec<String>,
}

/// Installs the stderr fmt subscriber. `GUR_LOG` takes an `EnvFilter`
/// directive; `verbose` forces `debug`.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // A host may already have installed a subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .without_time(),
        )
        .try_init();
}

/// Walks up from `start` looking for a `.guardrails/` directory and returns
/// the database path inside it.
#[must_use]
pub fn discover_project_db(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_DIR))
        .find(|dir| dir.is_dir())
        .map(|dir| dir.join(DB_FILE))
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when no project can be found, migration fails, or the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init(args) => run_init(cli.db.as_deref(), &args),
        command => {
            let db_path = match cli.db {
                Some(path) => path,
                None => {
                    let cwd = std::env::current_dir().context("failed to read current directory")?;
                    discover_project_db(&cwd).ok_or_else(|| {
                        anyhow!(
                            "no {PROJECT_DIR} directory found in {} or any parent; run `gur init` first",
                            cwd.display()
                        )
                    })?
                }
            };
            run_with_db(&db_path, command, &cli.actor)
        }
    }
}

/// Executes a parsed command against the database at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_with_db(db_path: &Path, command: Command, actor: &str) -> Result<()> {
    match command {
        Command::Init(args) => run_init(Some(db_path), &args),
        command => {
            debug!(db = %db_path.display(), "opening project database");
            let mut store = SqliteTaskStore::open(db_path)?;
            store.migrate()?;
            run_command(command, &mut store, actor, &mut TerminalConfirmer)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or a closure/verification
/// rule rejects the command.
pub fn run_command(
    command: Command,
    store: &mut SqliteTaskStore,
    actor: &str,
    confirmer: &mut dyn Confirmer,
) -> Result<()> {
    match command {
        Command::Init(_) => Err(anyhow!(
            "internal dispatch error: init should be handled before store initialization"
        )),
        Command::Create(args) => {
            let request = NewTask {
                title: args.title,
                description: args.description,
                priority: parse_priority(args.priority)?,
                task_type: args.task_type,
                labels: args.labels,
                assignee: args.assignee,
                parent_id: args.parent,
                template: args.template,
            };
            print_json(&store.create_task(&request, actor)?)
        }
        Command::Show(args) => {
            let view = TaskView {
                task: store.require_task(&args.id)?,
                dependencies: store.list_dependencies(&args.id)?,
                gates: store.gate_links_for_task(&args.id)?,
            };
            print_json(&view)
        }
        Command::Update(args) => {
            let patch = TaskPatch {
                title: args.title,
                description: args.description,
                priority: parse_priority(args.priority)?,
                task_type: args.task_type,
                status: args.status.map(map_active_status),
                assignee: args.assignee,
                notes: args.notes,
                add_labels: args.add_labels,
                remove_labels: args.remove_labels,
            };
            print_json(&store.update_task(&args.id, &patch, actor, confirmer)?)
        }
        Command::List(args) => {
            let filter = TaskFilter {
                status: args.status.map(map_status),
                priority: parse_priority(args.priority)?,
                task_type: args.task_type,
                assignee: args.assignee,
                label: args.label,
                parent_id: args.parent,
                include_archived: args.all,
                limit: args.limit,
            };
            render_tasks(&store.list_tasks(&filter)?, args.json)
        }
        Command::Search(args) => render_tasks(&store.search_tasks(&args.query, args.limit)?, args.json),
        Command::Close(args) => {
            let mut request = CloseRequest::new(&args.reason).by(actor);
            if args.force {
                request = request.forced();
            }
            print_json(&store.close_task(&args.id, &request, confirmer)?)
        }
        Command::Reopen(args) => print_json(&store.reopen_task(&args.id, actor)?),
        Command::Archive(args) => match (args.id, args.closed) {
            (Some(id), false) => print_json(&store.archive_task(&id, actor)?),
            (None, true) => {
                let older_than = args.older_than.as_deref().map(parse_age).transpose()?;
                print_json(&store.archive_closed(older_than, actor)?)
            }
            _ => Err(GuardrailsError::Validation(
                "pass a task id or --closed to archive every closed task".to_string(),
            )
            .into()),
        },
        Command::Unarchive(args) => print_json(&store.unarchive_task(&args.id, actor)?),
        Command::Compact(args) => match (args.id, args.all) {
            (Some(id), false) => print_json(&store.compact_task(&id, args.dry_run, actor)?),
            (None, true) => {
                let older_than = args.older_than.as_deref().map(parse_age).transpose()?;
                print_json(&store.compact_all(older_than, args.dry_run, actor)?)
            }
            _ => Err(GuardrailsError::Validation(
                "pass a task id or --all to compact every closed task".to_string(),
            )
            .into()),
        },
        Command::Delete(args) => print_json(&store.delete_task(&args.id, actor)?),
        Command::Purge => print_json(&store.purge_deleted()?),
        Command::Ready(args) => render_tasks(&store.ready_tasks(args.limit)?, args.json),
        Command::History(args) => {
            let entries = store.task_history(&args.id, Some(args.limit))?;
            if args.json {
                print_json(&entries)
            } else {
                print_history_table(&entries);
                Ok(())
            }
        }
        Command::Stats => print_json(&store.stats()?),
        Command::Summary => print_json(&store.summary()?),
        Command::Cleanup(args) => print_json(&store.cleanup(args.dry_run)?),
        Command::Dep { command } => run_dep(*command, store),
        Command::Gate { command } => run_gate(*command, store),
        Command::Template { command } => run_template(*command, store),
        Command::Config { command } => run_config(*command, store),
    }
}

fn run_init(db: Option<&Path>, args: &InitArgs) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let db_path = match db {
        Some(path) => path.to_path_buf(),
        None => cwd.join(PROJECT_DIR).join(DB_FILE),
    };
    if let Some(parent) = db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let project_name = match args.name.as_deref() {
        Some(name) => name.to_string(),
        None => cwd
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("guardrails")
            .to_string(),
    };

    let store = SqliteTaskStore::open(&db_path)?;
    store.migrate()?;
    store.initialize_project(&project_name, map_mode(args.mode))?;
    print_json(&store.list_config()?)
}

fn run_dep(command: DepCommand, store: &mut SqliteTaskStore) -> Result<()> {
    match command {
        DepCommand::Add(args) => print_json(&store.add_dependency(
            &args.blocker,
            &args.blocked,
            map_dep_type(args.dep_type),
        )?),
        DepCommand::Remove(args) => {
            store.remove_dependency(&args.blocker, &args.blocked)?;
            print_json(&serde_json::json!({
                "removed": true,
                "blocker_id": args.blocker,
                "blocked_id": args.blocked,
            }))
        }
        DepCommand::List(args) => print_json(&store.list_dependencies(&args.id)?),
    }
}

fn run_gate(command: GateCommand, store: &mut SqliteTaskStore) -> Result<()> {
    match command {
        GateCommand::Create(args) => {
            let input = NewGate {
                title: args.title,
                description: args.description,
                category: args.category,
                gate_type: args.gate_type,
                priority: parse_priority(args.priority)?,
                preconditions: args.preconditions,
                steps: args.steps,
                expected_result: args.expected_result,
                command: args.command,
                labels: args.labels,
            };
            print_json(&store.create_gate(input)?)
        }
        GateCommand::List(args) => {
            let filter = GateFilter {
                category: args.category,
                gate_type: args.gate_type,
                last_result: args.result.map(map_gate_status),
            };
            let gates = store.list_gates(&filter)?;
            if args.json {
                print_json(&gates)
            } else {
                print_gate_table(&gates);
                Ok(())
            }
        }
        GateCommand::Show(args) => print_json(&store.gate_details(&args.id)?),
        GateCommand::Link(args) => print_json(&store.link_gate(&args.gate, &args.task)?),
        GateCommand::Unlink(args) => {
            store.unlink_gate(&args.gate, &args.task)?;
            print_json(&serde_json::json!({
                "unlinked": true,
                "gate_id": args.gate,
                "task_id": args.task,
            }))
        }
        GateCommand::Pass(args) => verify(store, args, VerificationOutcome::Passed),
        GateCommand::Fail(args) => verify(store, args, VerificationOutcome::Failed),
        GateCommand::Skip(args) => verify(store, args, VerificationOutcome::Skipped),
        GateCommand::Check(args) => {
            let checks = store.close_checks(&args.id)?;
            let ready = checks.readiness.is_ready()
                && checks.open_blockers.is_empty()
                && checks.open_subtasks.is_empty();
            print_json(&ReadinessView {
                task_id: args.id,
                ready,
                linked_gates: checks.readiness.linked_gates,
                failing: checks.readiness.failing,
                open_blockers: checks.open_blockers,
                open_subtasks: checks.open_subtasks,
            })
        }
    }
}

fn verify(store: &mut SqliteTaskStore, args: GateVerifyArgs, outcome: VerificationOutcome) -> Result<()> {
    let verification = Verification {
        outcome,
        verifier: args.verifier,
        notes: args.notes,
        duration_ms: args.duration_ms,
        output: args.output,
    };
    print_json(&store.record_verification(&args.gate, &args.task, &verification)?)
}

fn run_template(command: TemplateCommand, store: &mut SqliteTaskStore) -> Result<()> {
    match command {
        TemplateCommand::Create(args) => {
            let input = NewTemplate {
                name: args.name,
                title: args.title,
                description: args.description,
                priority: parse_priority(args.priority)?,
                task_type: args.task_type,
                labels: args.labels,
            };
            print_json(&store.create_template(input)?)
        }
        TemplateCommand::List(args) => {
            let templates = store.list_templates()?;
            if args.json {
                print_json(&templates)
            } else {
                print_template_table(&templates);
                Ok(())
            }
        }
        TemplateCommand::Show(args) => {
            let Some(template) = store.get_template(&args.name)? else {
                return Err(GuardrailsError::NotFound(format!("template {} not found", args.name)).into());
            };
            print_json(&template)
        }
        TemplateCommand::Delete(args) => print_json(&store.delete_template(&args.name)?),
    }
}

fn run_config(command: ConfigCommand, store: &SqliteTaskStore) -> Result<()> {
    match command {
        ConfigCommand::Get(args) => {
            let key = parse_config_key(&args.key)?;
            let Some(value) = store.get_config(key)? else {
                return Err(GuardrailsError::NotFound(format!("config key {} is not set", args.key)).into());
            };
            println!("{value}");
            Ok(())
        }
        ConfigCommand::Set(args) => {
            let key = parse_config_key(&args.key)?;
            store.set_config(key, &args.value)?;
            print_json(&serde_json::json!({ "key": key.as_str(), "value": args.value.trim() }))
        }
        ConfigCommand::List(args) => {
            let entries = store.list_config()?;
            if args.json {
                print_json(&entries)
            } else {
                print_config_table(&entries);
                Ok(())
            }
        }
    }
}

fn parse_priority(raw: Option<u8>) -> Result<Option<Priority>> {
    Ok(raw.map(Priority::try_from).transpose()?)
}

fn parse_config_key(raw: &str) -> Result<ConfigKey> {
    ConfigKey::parse(raw).ok_or_else(|| {
        let known = ConfigKey::ALL
            .iter()
            .map(|key| key.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        GuardrailsError::Validation(format!("unknown config key '{raw}': expected one of {known}"))
            .into()
    })
}

fn map_mode(value: ModeArg) -> ProjectMode {
    match value {
        ModeArg::Default => ProjectMode::Default,
        ModeArg::Stealth => ProjectMode::Stealth,
        ModeArg::Contributor => ProjectMode::Contributor,
    }
}

fn map_status(value: StatusArg) -> TaskStatus {
    match value {
        StatusArg::Open => TaskStatus::Open,
        StatusArg::InProgress => TaskStatus::InProgress,
        StatusArg::Closed => TaskStatus::Closed,
        StatusArg::Archived => TaskStatus::Archived,
    }
}

fn map_active_status(value: ActiveStatusArg) -> TaskStatus {
    match value {
        ActiveStatusArg::Open => TaskStatus::Open,
        ActiveStatusArg::InProgress => TaskStatus::InProgress,
    }
}

fn map_dep_type(value: DepTypeArg) -> DependencyType {
    match value {
        DepTypeArg::Blocks => DependencyType::Blocks,
        DepTypeArg::Related => DependencyType::Related,
        DepTypeArg::ParentChild => DependencyType::ParentChild,
    }
}

fn map_gate_status(value: GateStatusArg) -> GateStatus {
    match value {
        GateStatusArg::Pending => GateStatus::Pending,
        GateStatusArg::Passed => GateStatus::Passed,
        GateStatusArg::Failed => GateStatus::Failed,
        GateStatusArg::Skipped => GateStatus::Skipped,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_tasks(tasks: &[Task], json: bool) -> Result<()> {
    if json {
        print_json(tasks)
    } else {
        print_task_table(tasks);
        Ok(())
    }
}

fn print_task_table(tasks: &[Task]) {
    println!("{:<20} {:<12} {:<4} {:<8} title", "id", "status", "pri", "type");
    println!("{}", "-".repeat(80));
    for task in tasks {
        println!(
            "{:<20} {:<12} {:<4} {:<8} {}",
            task.id,
            task.status.as_str(),
            task.priority.to_string(),
            task.task_type,
            task.title
        );
    }
}

fn print_gate_table(gates: &[Gate]) {
    println!(
        "{:<14} {:<10} {:<4} {:<12} {:<9} title",
        "id", "result", "pri", "category", "pass_rate"
    );
    println!("{}", "-".repeat(80));
    for gate in gates {
        println!(
            "{:<14} {:<10} {:<4} {:<12} {:<9.1} {}",
            gate.id,
            gate.last_result.as_str(),
            gate.priority.to_string(),
            gate.category,
            gate.pass_rate(),
            gate.title
        );
    }
}

fn print_history_table(entries: &[HistoryEntry]) {
    println!("{:<21} {:<14} {:<12} change", "changed_at", "field", "actor");
    println!("{}", "-".repeat(80));
    for entry in entries {
        let changed_at = guardrails_core::format_rfc3339(entry.changed_at)
            .unwrap_or_else(|_| "invalid".to_string());
        println!(
            "{:<21} {:<14} {:<12} {:?} -> {:?}",
            changed_at,
            entry.field.as_str(),
            entry.changed_by,
            entry.old_value,
            entry.new_value
        );
    }
}

fn print_template_table(templates: &[Template]) {
    println!("{:<14} {:<20} {:<8} {:<4} title", "id", "name", "type", "pri");
    println!("{}", "-".repeat(80));
    for template in templates {
        println!(
            "{:<14} {:<20} {:<8} {:<4} {}",
            template.id,
            template.name,
            template.task_type,
            template.priority.to_string(),
            template.title
        );
    }
}

fn print_config_table(entries: &[ConfigEntry]) {
    for entry in entries {
        println!("{:<16} {}", entry.key, entry.value);
    }
}
