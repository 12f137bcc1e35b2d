use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use release_history_api::{HistoryApi, HistoryRequest};
use release_history_core::{
    Actor, ApprovalAudit, ApprovalId, ApprovalMode, ApprovalSnapshot, ApprovalState, AuditAction,
    CheckColor, CheckRef, CommentId, CommentRecord, CommentReference, CommentStatus, OverrideAudit,
    OverrideId, OverrideState, ReleaseAudit, ReleaseId, ReleaseMeta, ReleaseState, RunAudit,
    RunResult, RunState, RunStatus, UserId, UserProfile,
};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rh")]
#[command(about = "Release history CLI")]
struct Cli {
    #[arg(long, default_value = "./release_history.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Seed {
        #[command(subcommand)]
        command: Box<SeedCommand>,
    },
    History(HistoryArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum SeedCommand {
    Release(SeedReleaseArgs),
    User(SeedUserArgs),
    ReleaseClose(SeedReleaseCloseArgs),
    ApprovalAudit(SeedApprovalAuditArgs),
    RunAudit(SeedRunAuditArgs),
    OverrideAudit(SeedOverrideAuditArgs),
    Comment(SeedCommentArgs),
}

#[derive(Debug, Args)]
struct SeedReleaseArgs {
    #[arg(long)]
    creation_time: Option<String>,
    #[arg(long, default_value_t = false)]
    closed: bool,
    #[arg(long)]
    close_time: Option<String>,
}

#[derive(Debug, Args)]
struct SeedUserArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    email: Option<String>,
}

#[derive(Debug, Args)]
struct SeedReleaseCloseArgs {
    #[arg(long)]
    release_id: String,
    #[arg(long, default_value = "release")]
    name: String,
    #[arg(long)]
    planned_date: Option<String>,
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct SeedApprovalAuditArgs {
    #[arg(long)]
    release_id: String,
    #[arg(long)]
    action: ActionArg,
    #[arg(long)]
    approver: String,
    #[arg(long)]
    approver_id: Option<String>,
    #[arg(long)]
    from_state: Option<StateArg>,
    #[arg(long)]
    to_state: Option<StateArg>,
    #[arg(long)]
    comment: Option<String>,
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct SeedRunAuditArgs {
    #[arg(long)]
    release_id: String,
    #[arg(long)]
    run_number: u32,
    #[arg(long)]
    result: ResultArg,
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct SeedOverrideAuditArgs {
    #[arg(long)]
    release_id: String,
    #[arg(long)]
    action: ActionArg,
    #[arg(long)]
    chapter: String,
    #[arg(long)]
    requirement: String,
    #[arg(long)]
    check: String,
    #[arg(long)]
    original_color: ColorArg,
    #[arg(long)]
    manual_color: Option<ColorArg>,
    #[arg(long)]
    previous_color: Option<ColorArg>,
    #[arg(long)]
    comment_id: Option<String>,
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct SeedCommentArgs {
    #[arg(long)]
    release_id: String,
    #[arg(long)]
    content: String,
    #[arg(long)]
    author: String,
    #[arg(long)]
    author_id: Option<String>,
    #[arg(long, default_value = "unresolved")]
    status: StatusArg,
    #[arg(long)]
    chapter: Option<String>,
    #[arg(long)]
    requirement: Option<String>,
    #[arg(long)]
    check: Option<String>,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    release_id: String,
    #[arg(long)]
    items: Option<usize>,
    #[arg(long)]
    sort_order: Option<SortArg>,
    #[arg(long)]
    last_timestamp: Option<i64>,
    #[arg(long)]
    filter: Option<FilterArg>,
}

#[derive(Debug, Args)]
struct ActorArgs {
    #[arg(long)]
    actor: String,
    #[arg(long)]
    actor_id: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ActionArg {
    Create,
    Update,
    Delete,
}

impl ActionArg {
    fn as_core(self) -> AuditAction {
        match self {
            Self::Create => AuditAction::Create,
            Self::Update => AuditAction::Update,
            Self::Delete => AuditAction::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Pending,
    Approved,
}

impl StateArg {
    fn as_core(self) -> ApprovalState {
        match self {
            Self::Pending => ApprovalState::Pending,
            Self::Approved => ApprovalState::Approved,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResultArg {
    Green,
    Yellow,
    Red,
    Failed,
    Error,
}

impl ResultArg {
    fn as_core(self) -> RunResult {
        match self {
            Self::Green => RunResult::Green,
            Self::Yellow => RunResult::Yellow,
            Self::Red => RunResult::Red,
            Self::Failed => RunResult::Failed,
            Self::Error => RunResult::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorArg {
    Green,
    Yellow,
    Red,
}

impl ColorArg {
    fn as_core(self) -> CheckColor {
        match self {
            Self::Green => CheckColor::Green,
            Self::Yellow => CheckColor::Yellow,
            Self::Red => CheckColor::Red,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Unresolved,
    Resolved,
}

impl StatusArg {
    fn as_core(self) -> CommentStatus {
        match self {
            Self::Unresolved => CommentStatus::Unresolved,
            Self::Resolved => CommentStatus::Resolved,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortArg {
    Asc,
    Desc,
}

impl SortArg {
    fn as_wire(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FilterArg {
    Event,
    Resolved,
    Unresolved,
}

impl FilterArg {
    fn as_wire(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = HistoryApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Seed { command } => run_seed(*command, &api),
        Command::History(args) => run_history(args, &api),
    }
}

fn run_db(command: DbCommand, api: &HistoryApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::to_value(status)?)
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn run_seed(command: SeedCommand, api: &HistoryApi) -> Result<()> {
    match command {
        SeedCommand::Release(args) => {
            let release = ReleaseMeta {
                id: ReleaseId::new(),
                creation_time: parse_timestamp(args.creation_time.as_deref())?,
                closed: args.closed,
                close_time: args
                    .close_time
                    .as_deref()
                    .map(parse_rfc3339)
                    .transpose()?,
            };
            api.create_release(&release)?;
            emit_json(serde_json::json!({ "release_id": release.id.to_string() }))
        }
        SeedCommand::User(args) => {
            let profile = UserProfile {
                id: UserId::new(),
                username: args.username,
                display_name: args.display_name,
                email: args.email,
            };
            api.register_user(&profile)?;
            emit_json(serde_json::json!({ "user_id": profile.id.to_string() }))
        }
        SeedCommand::ReleaseClose(args) => {
            let at = parse_timestamp(args.at.as_deref())?;
            let planned_date = match args.planned_date.as_deref() {
                Some(text) => parse_rfc3339(text)?,
                None => at,
            };
            let open = ReleaseState {
                name: args.name,
                planned_date,
                approval_mode: ApprovalMode::One,
                approval_state: ApprovalState::Pending,
                closed: false,
            };
            let mut closed = open.clone();
            closed.closed = true;
            api.record_release_audit(&ReleaseAudit {
                release_id: parse_release_id(&args.release_id)?,
                action: AuditAction::Update,
                original: Some(open),
                modified: Some(closed),
                actor: args.actor.build()?,
                modification_time: at,
            })?;
            emit_json(serde_json::json!({ "seeded": "release_audit" }))
        }
        SeedCommand::ApprovalAudit(args) => {
            let audit = build_approval_audit(args)?;
            api.record_approval_audit(&audit)?;
            emit_json(serde_json::json!({
                "seeded": "approval_audit",
                "approval_id": audit.approval_id.to_string(),
            }))
        }
        SeedCommand::RunAudit(args) => {
            api.record_run_audit(&RunAudit {
                release_id: parse_release_id(&args.release_id)?,
                action: AuditAction::Update,
                original: Some(RunState {
                    run_number: args.run_number,
                    status: RunStatus::Running,
                    overall_result: None,
                }),
                modified: Some(RunState {
                    run_number: args.run_number,
                    status: RunStatus::Completed,
                    overall_result: Some(args.result.as_core()),
                }),
                actor: args.actor.build()?,
                modification_time: parse_timestamp(args.at.as_deref())?,
            })?;
            emit_json(serde_json::json!({ "seeded": "run_audit" }))
        }
        SeedCommand::OverrideAudit(args) => {
            let audit = build_override_audit(args)?;
            api.record_override_audit(&audit)?;
            emit_json(serde_json::json!({
                "seeded": "override_audit",
                "override_id": audit.override_id.to_string(),
            }))
        }
        SeedCommand::Comment(args) => {
            let comment = build_comment(args)?;
            api.add_comment(&comment)?;
            emit_json(serde_json::json!({ "comment_id": comment.id.to_string() }))
        }
    }
}

fn build_approval_audit(args: SeedApprovalAuditArgs) -> Result<ApprovalAudit> {
    let approver = Actor {
        id: args.approver_id.as_deref().map(parse_user_id).transpose()?,
        username: args.approver,
    };
    let from_state = args.from_state.map_or(ApprovalState::Pending, StateArg::as_core);
    let action = args.action.as_core();

    let (original, modified) = match action {
        AuditAction::Create => (
            None,
            Some(ApprovalSnapshot {
                approver,
                state: args.to_state.map_or(ApprovalState::Pending, StateArg::as_core),
                comment: args.comment,
            }),
        ),
        AuditAction::Delete => (
            Some(ApprovalSnapshot { approver, state: from_state, comment: None }),
            None,
        ),
        AuditAction::Update => {
            let to_state = args
                .to_state
                .ok_or_else(|| anyhow!("--to-state is required for --action update"))?;
            (
                Some(ApprovalSnapshot {
                    approver: approver.clone(),
                    state: from_state,
                    comment: None,
                }),
                Some(ApprovalSnapshot {
                    approver,
                    state: to_state.as_core(),
                    comment: args.comment,
                }),
            )
        }
    };

    Ok(ApprovalAudit {
        approval_id: ApprovalId::new(),
        release_id: parse_release_id(&args.release_id)?,
        action,
        original,
        modified,
        actor: args.actor.build()?,
        modification_time: parse_timestamp(args.at.as_deref())?,
    })
}

fn build_override_audit(args: SeedOverrideAuditArgs) -> Result<OverrideAudit> {
    let check = CheckRef {
        chapter: args.chapter,
        requirement: args.requirement,
        check: args.check,
    };
    let original_color = args.original_color.as_core();
    let comment_id = args.comment_id.as_deref().map(parse_comment_id).transpose()?;
    let action = args.action.as_core();

    let manual = |arg: Option<ColorArg>, flag: &str| {
        arg.map(ColorArg::as_core).ok_or_else(|| anyhow!("{flag} is required for this action"))
    };

    let (original, modified) = match action {
        AuditAction::Create => (
            None,
            Some(OverrideState {
                check,
                original_color,
                manual_color: manual(args.manual_color, "--manual-color")?,
                comment_id,
            }),
        ),
        AuditAction::Update => (
            Some(OverrideState {
                check: check.clone(),
                original_color,
                manual_color: manual(args.previous_color, "--previous-color")?,
                comment_id: None,
            }),
            Some(OverrideState {
                check,
                original_color,
                manual_color: manual(args.manual_color, "--manual-color")?,
                comment_id,
            }),
        ),
        AuditAction::Delete => (
            Some(OverrideState {
                check,
                original_color,
                manual_color: manual(args.previous_color, "--previous-color")?,
                comment_id,
            }),
            None,
        ),
    };

    Ok(OverrideAudit {
        override_id: OverrideId::new(),
        release_id: parse_release_id(&args.release_id)?,
        action,
        original,
        modified,
        actor: args.actor.build()?,
        modification_time: parse_timestamp(args.at.as_deref())?,
    })
}

fn build_comment(args: SeedCommentArgs) -> Result<CommentRecord> {
    let reference = match (args.chapter, args.requirement, args.check) {
        (None, None, None) => CommentReference::Release,
        (Some(chapter), Some(requirement), Some(check)) => {
            CommentReference::Check { chapter, requirement, check }
        }
        _ => {
            return Err(anyhow!(
                "--chapter, --requirement, and --check must be given together"
            ))
        }
    };

    Ok(CommentRecord {
        id: CommentId::new(),
        release_id: parse_release_id(&args.release_id)?,
        content: args.content,
        created_by: Actor {
            id: args.author_id.as_deref().map(parse_user_id).transpose()?,
            username: args.author,
        },
        creation_time: parse_timestamp(args.at.as_deref())?,
        status: args.status.as_core(),
        reference,
        replies: Vec::new(),
    })
}

fn run_history(args: HistoryArgs, api: &HistoryApi) -> Result<()> {
    let release_id = parse_release_id(&args.release_id)?;
    let feed = api.release_history(
        release_id,
        &HistoryRequest {
            items: args.items,
            sort_order: args.sort_order.map(|order| order.as_wire().to_string()),
            last_timestamp: args.last_timestamp,
            filter: args.filter.map(|filter| filter.as_wire().to_string()),
        },
    )?;
    emit_json(serde_json::to_value(feed)?)
}

impl ActorArgs {
    fn build(&self) -> Result<Actor> {
        Ok(Actor {
            id: self.actor_id.as_deref().map(parse_user_id).transpose()?,
            username: self.actor.clone(),
        })
    }
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_release_id(raw: &str) -> Result<ReleaseId> {
    Ok(ReleaseId(parse_ulid(raw)?))
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    Ok(UserId(parse_ulid(raw)?))
}

fn parse_comment_id(raw: &str) -> Result<CommentId> {
    Ok(CommentId(parse_ulid(raw)?))
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {raw}"))
}

fn parse_timestamp(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(text) => parse_rfc3339(text),
        None => Ok(OffsetDateTime::now_utc()),
    }
}
