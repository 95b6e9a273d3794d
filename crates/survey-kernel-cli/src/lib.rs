//! `sk` command surface over the survey reconciliation engine.
//!
//! - [`run_cli`] executes a parsed [`Cli`] and prints JSON to stdout.
//! - [`run_command`] executes one [`Command`] against an existing engine and
//!   returns the JSON it would print.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use survey_kernel_core::{
    Actor, AssignmentId, CampaignId, ContactId, MessageStatus, OrganizationId,
    QuestionResponseInput, Role, StepId, UserId,
};
use survey_kernel_service::{
    AnswerActionRegistry, EngineConfig, LoggingActionHandler, MarkRespondedPolicy,
    MessageStatusPolicy, RetainStatusPolicy, SurveyEngine,
};
use survey_kernel_store_sqlite::{NewContact, ScriptNode};

#[derive(Debug, Parser)]
#[command(name = "sk")]
#[command(about = "Survey Kernel CLI")]
pub struct Cli {
    #[arg(long, default_value = "./survey_kernel.sqlite3")]
    db: PathBuf,

    /// Default tracing filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON engine config; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = StatusPolicyArg::Retain)]
    status_policy: StatusPolicyArg,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    Campaign {
        #[command(subcommand)]
        command: CampaignCommand,
    },
    Script {
        #[command(subcommand)]
        command: ScriptCommand,
    },
    Role {
        #[command(subcommand)]
        command: RoleCommand,
    },
    Assignment {
        #[command(subcommand)]
        command: AssignmentCommand,
    },
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
    Responses {
        #[command(subcommand)]
        command: ResponsesCommand,
    },
    Actions {
        #[command(subcommand)]
        command: ActionsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CampaignCommand {
    Create(CampaignCreateArgs),
}

#[derive(Debug, Args)]
pub struct CampaignCreateArgs {
    #[arg(long)]
    organization_id: String,
    #[arg(long)]
    title: String,
}

#[derive(Debug, Subcommand)]
pub enum ScriptCommand {
    /// Saves a new script version from a JSON script tree.
    Load(ScriptLoadArgs),
    /// Renders the script of the step a contact is currently on.
    Next(ScriptNextArgs),
}

#[derive(Debug, Args)]
pub struct ScriptLoadArgs {
    #[arg(long)]
    campaign_id: String,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ScriptNextArgs {
    #[arg(long)]
    contact_id: String,
    #[arg(long, default_value = "")]
    texter_first_name: String,
}

#[derive(Debug, Subcommand)]
pub enum RoleCommand {
    Set(RoleSetArgs),
}

#[derive(Debug, Args)]
pub struct RoleSetArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    organization_id: String,
    #[arg(long, value_enum)]
    role: RoleArg,
}

#[derive(Debug, Subcommand)]
pub enum AssignmentCommand {
    Create(AssignmentCreateArgs),
}

#[derive(Debug, Args)]
pub struct AssignmentCreateArgs {
    #[arg(long)]
    campaign_id: String,
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ContactCommand {
    Add(ContactAddArgs),
    SetStatus(ContactSetStatusArgs),
    Show(ContactShowArgs),
}

#[derive(Debug, Args)]
pub struct ContactAddArgs {
    #[arg(long)]
    campaign_id: String,
    #[arg(long)]
    cell: String,
    #[arg(long)]
    assignment_id: Option<String>,
    #[arg(long, default_value = "")]
    first_name: String,
    #[arg(long, default_value = "")]
    last_name: String,
    #[arg(long, value_enum, default_value_t = MessageStatusArg::NeedsMessage)]
    status: MessageStatusArg,
}

#[derive(Debug, Args)]
pub struct ContactSetStatusArgs {
    #[arg(long)]
    contact_id: String,
    #[arg(long, value_enum)]
    status: MessageStatusArg,
}

#[derive(Debug, Args)]
pub struct ContactShowArgs {
    #[arg(long)]
    contact_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ResponsesCommand {
    /// Reconciles a JSON array of `{campaignContactId, interactionStepId, value}`.
    Update(ResponsesUpdateArgs),
    Delete(ResponsesDeleteArgs),
    Show(ContactShowArgs),
}

#[derive(Debug, Args)]
pub struct ResponsesUpdateArgs {
    #[arg(long)]
    contact_id: String,
    #[arg(long)]
    user_id: String,
    #[arg(long, conflicts_with = "file")]
    json: Option<String>,
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ResponsesDeleteArgs {
    #[arg(long)]
    contact_id: String,
    #[arg(long)]
    user_id: String,
    #[arg(long = "step-id", required = true)]
    step_ids: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum ActionsCommand {
    List(ContactShowArgs),
    Retry(ActionsRetryArgs),
}

#[derive(Debug, Args)]
pub struct ActionsRetryArgs {
    #[arg(long)]
    contact_id: String,
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusPolicyArg {
    Retain,
    MarkResponded,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Texter,
    Supervolunteer,
    Admin,
    Owner,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MessageStatusArg {
    NeedsMessage,
    Messaged,
    NeedsResponse,
    Responded,
    Convo,
    MessageError,
    Closed,
}

/// Executes the parsed CLI and prints the command's JSON result.
///
/// # Errors
/// Returns an error when the config is invalid, the database cannot be opened
/// or migrated, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = build_engine(&cli.db, config, cli.status_policy)?;
    let output = run_command(cli.command, &engine)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Opens (and migrates) the database behind an engine with the built-in
/// `log` answer action registered.
///
/// # Errors
/// Returns an error when the config is invalid or the database cannot be
/// opened or migrated.
pub fn build_engine(
    db_path: &Path,
    config: EngineConfig,
    status_policy: StatusPolicyArg,
) -> Result<SurveyEngine> {
    let policy: Arc<dyn MessageStatusPolicy> = match status_policy {
        StatusPolicyArg::Retain => Arc::new(RetainStatusPolicy),
        StatusPolicyArg::MarkResponded => Arc::new(MarkRespondedPolicy),
    };
    let engine = SurveyEngine::builder(db_path)
        .config(config)
        .status_policy(policy)
        .actions(AnswerActionRegistry::new().with("log", Arc::new(LoggingActionHandler)))
        .build()
        .with_context(|| format!("failed to open survey database at {}", db_path.display()))?;
    Ok(engine)
}

/// Executes one command against `engine`.
///
/// # Errors
/// Returns an error when argument parsing or the requested operation fails.
pub fn run_command(command: Command, engine: &SurveyEngine) -> Result<Value> {
    match command {
        Command::Migrate => {
            engine.open_store()?.migrate()?;
            Ok(json!({
                "migrated": true,
                "db": engine.db_path().display().to_string(),
            }))
        }
        Command::Campaign {
            command: CampaignCommand::Create(args),
        } => {
            let campaign = engine.open_store()?.create_campaign(
                OrganizationId::parse(&args.organization_id)?,
                &args.title,
            )?;
            Ok(serde_json::to_value(campaign)?)
        }
        Command::Script { command } => run_script(command, engine),
        Command::Role {
            command: RoleCommand::Set(args),
        } => {
            let user_id = UserId::parse(&args.user_id)?;
            let organization_id = OrganizationId::parse(&args.organization_id)?;
            let role = map_role(args.role);
            engine
                .open_store()?
                .set_user_role(user_id, organization_id, role)?;
            Ok(json!({
                "user_id": user_id,
                "organization_id": organization_id,
                "role": role.as_str(),
            }))
        }
        Command::Assignment {
            command: AssignmentCommand::Create(args),
        } => {
            let assignment = engine.open_store()?.insert_assignment(
                CampaignId::parse(&args.campaign_id)?,
                UserId::parse(&args.user_id)?,
            )?;
            Ok(serde_json::to_value(assignment)?)
        }
        Command::Contact { command } => run_contact(command, engine),
        Command::Responses { command } => run_responses(command, engine),
        Command::Actions { command } => run_actions(command, engine),
    }
}

fn run_script(command: ScriptCommand, engine: &SurveyEngine) -> Result<Value> {
    match command {
        ScriptCommand::Load(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read script file {}", args.file.display()))?;
            let script = ScriptNode::from_json(&raw)?;
            let steps = engine
                .open_store()?
                .save_script(CampaignId::parse(&args.campaign_id)?, &script)?;
            Ok(serde_json::to_value(steps)?)
        }
        ScriptCommand::Next(args) => {
            let next = engine.next_script(
                ContactId::parse(&args.contact_id)?,
                &args.texter_first_name,
            )?;
            Ok(serde_json::to_value(next)?)
        }
    }
}

fn run_contact(command: ContactCommand, engine: &SurveyEngine) -> Result<Value> {
    match command {
        ContactCommand::Add(args) => {
            let assignment_id = args
                .assignment_id
                .as_deref()
                .map(AssignmentId::parse)
                .transpose()?;
            let contact = engine.open_store()?.insert_contact(&NewContact {
                campaign_id: CampaignId::parse(&args.campaign_id)?,
                assignment_id,
                message_status: map_status(args.status),
                cell: args.cell,
                first_name: args.first_name,
                last_name: args.last_name,
            })?;
            Ok(serde_json::to_value(contact)?)
        }
        ContactCommand::SetStatus(args) => {
            let contact_id = ContactId::parse(&args.contact_id)?;
            engine.set_message_status(contact_id, map_status(args.status))?;
            Ok(serde_json::to_value(engine.contact_record(contact_id)?)?)
        }
        ContactCommand::Show(args) => {
            let record = engine.contact_record(ContactId::parse(&args.contact_id)?)?;
            Ok(serde_json::to_value(record)?)
        }
    }
}

fn run_responses(command: ResponsesCommand, engine: &SurveyEngine) -> Result<Value> {
    match command {
        ResponsesCommand::Update(args) => {
            let raw = match (&args.json, &args.file) {
                (Some(inline), None) => inline.clone(),
                (None, Some(path)) => std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read responses file {}", path.display()))?,
                _ => return Err(anyhow!("exactly one of --json or --file MUST be provided")),
            };
            let inputs: Vec<QuestionResponseInput> =
                serde_json::from_str(&raw).context("invalid question response JSON")?;
            let record = engine.update_question_responses(
                &inputs,
                ContactId::parse(&args.contact_id)?,
                &actor(&args.user_id)?,
            )?;
            Ok(serde_json::to_value(record)?)
        }
        ResponsesCommand::Delete(args) => {
            let step_ids = args
                .step_ids
                .iter()
                .map(|raw| StepId::parse(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let record = engine.delete_question_responses(
                &step_ids,
                ContactId::parse(&args.contact_id)?,
                &actor(&args.user_id)?,
            )?;
            Ok(serde_json::to_value(record)?)
        }
        ResponsesCommand::Show(args) => {
            let store = engine.open_store()?;
            let responses = store.list_responses(ContactId::parse(&args.contact_id)?)?;
            Ok(serde_json::to_value(responses)?)
        }
    }
}

fn run_actions(command: ActionsCommand, engine: &SurveyEngine) -> Result<Value> {
    match command {
        ActionsCommand::List(args) => {
            let actions = engine
                .open_store()?
                .list_actions(ContactId::parse(&args.contact_id)?)?;
            Ok(serde_json::to_value(actions)?)
        }
        ActionsCommand::Retry(args) => {
            let retried = engine.retry_failed_actions(
                ContactId::parse(&args.contact_id)?,
                &actor(&args.user_id)?,
            )?;
            Ok(serde_json::to_value(retried)?)
        }
    }
}

fn actor(raw_user_id: &str) -> Result<Actor> {
    Ok(Actor {
        user_id: UserId::parse(raw_user_id)?,
    })
}

fn map_role(value: RoleArg) -> Role {
    match value {
        RoleArg::Texter => Role::Texter,
        RoleArg::Supervolunteer => Role::Supervolunteer,
        RoleArg::Admin => Role::Admin,
        RoleArg::Owner => Role::Owner,
    }
}

fn map_status(value: MessageStatusArg) -> MessageStatus {
    match value {
        MessageStatusArg::NeedsMessage => MessageStatus::NeedsMessage,
        MessageStatusArg::Messaged => MessageStatus::Messaged,
        MessageStatusArg::NeedsResponse => MessageStatus::NeedsResponse,
        MessageStatusArg::Responded => MessageStatus::Responded,
        MessageStatusArg::Convo => MessageStatus::Convo,
        MessageStatusArg::MessageError => MessageStatus::MessageError,
        MessageStatusArg::Closed => MessageStatus::Closed,
    }
}
