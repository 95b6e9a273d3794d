#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use survey_kernel_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Assignment, AssignmentId, Campaign, CampaignContact,
    CampaignId, ContactId, ContactSnapshot, InteractionStep, MessageStatus, OrganizationId,
    QuestionResponse, QuestionResponseValue, QueuedAction, ReconcilePlan, Role, StepId,
    SurveyError, UserId,
};
use time::OffsetDateTime;
use ulid::Ulid;

const SURVEY_MIGRATION_VERSION: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5_000;

const SCHEMA_SURVEY_V1: &str = r"
CREATE TABLE IF NOT EXISTS campaign (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  organization_id INTEGER NOT NULL,
  title TEXT NOT NULL,
  script_version INTEGER NOT NULL DEFAULT 0 CHECK (script_version >= 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_organization (
  user_id INTEGER NOT NULL,
  organization_id INTEGER NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('TEXTER', 'SUPERVOLUNTEER', 'ADMIN', 'OWNER')),
  PRIMARY KEY (user_id, organization_id)
);

CREATE TABLE IF NOT EXISTS assignment (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  campaign_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (campaign_id) REFERENCES campaign(id)
);

CREATE TABLE IF NOT EXISTS campaign_contact (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  campaign_id INTEGER NOT NULL,
  assignment_id INTEGER,
  message_status TEXT NOT NULL CHECK (
    message_status IN (
      'needsMessage',
      'messaged',
      'needsResponse',
      'responded',
      'convo',
      'messageError',
      'closed'
    )
  ),
  cell TEXT NOT NULL,
  first_name TEXT NOT NULL DEFAULT '',
  last_name TEXT NOT NULL DEFAULT '',
  updated_at TEXT NOT NULL,
  FOREIGN KEY (campaign_id) REFERENCES campaign(id),
  FOREIGN KEY (assignment_id) REFERENCES assignment(id)
);

CREATE TRIGGER IF NOT EXISTS trg_campaign_contact_no_delete
BEFORE DELETE ON campaign_contact
BEGIN
  SELECT RAISE(FAIL, 'campaign_contact rows are never deleted');
END;

CREATE INDEX IF NOT EXISTS idx_campaign_contact_assignment
  ON campaign_contact(assignment_id, message_status);

CREATE TABLE IF NOT EXISTS interaction_step (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  campaign_id INTEGER NOT NULL,
  question TEXT NOT NULL DEFAULT '',
  script TEXT NOT NULL DEFAULT '',
  answer_option TEXT NOT NULL DEFAULT '',
  answer_actions TEXT NOT NULL DEFAULT '',
  answer_actions_data TEXT NOT NULL DEFAULT '',
  parent_interaction_id INTEGER,
  is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
  script_version INTEGER NOT NULL CHECK (script_version >= 1),
  created_at TEXT NOT NULL,
  FOREIGN KEY (campaign_id) REFERENCES campaign(id),
  FOREIGN KEY (parent_interaction_id) REFERENCES interaction_step(id)
);

CREATE INDEX IF NOT EXISTS idx_interaction_step_campaign
  ON interaction_step(campaign_id, is_deleted);
CREATE INDEX IF NOT EXISTS idx_interaction_step_parent
  ON interaction_step(parent_interaction_id);

CREATE TABLE IF NOT EXISTS question_response (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  campaign_contact_id INTEGER NOT NULL,
  interaction_step_id INTEGER NOT NULL,
  value TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (campaign_contact_id, interaction_step_id),
  FOREIGN KEY (campaign_contact_id) REFERENCES campaign_contact(id),
  FOREIGN KEY (interaction_step_id) REFERENCES interaction_step(id)
);

CREATE TABLE IF NOT EXISTS answer_action_dispatch (
  campaign_contact_id INTEGER NOT NULL,
  interaction_step_id INTEGER NOT NULL,
  question_step_id INTEGER NOT NULL,
  dispatch_id TEXT NOT NULL UNIQUE,
  action TEXT NOT NULL,
  action_data TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL CHECK (status IN ('queued', 'dispatched', 'failed')),
  attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
  last_error TEXT,
  queued_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (campaign_contact_id, interaction_step_id),
  FOREIGN KEY (campaign_contact_id) REFERENCES campaign_contact(id),
  FOREIGN KEY (interaction_step_id) REFERENCES interaction_step(id)
);

CREATE INDEX IF NOT EXISTS idx_answer_action_dispatch_status
  ON answer_action_dispatch(status, campaign_contact_id);
";

pub struct SqliteSurveyStore {
    conn: Connection,
}

/// One node of a script as authored: the step plus the steps answering it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptNode {
    pub question_text: String,
    pub script: String,
    pub answer_option: String,
    pub answer_actions: String,
    pub answer_actions_data: String,
    pub interaction_steps: Vec<ScriptNode>,
}

impl ScriptNode {
    /// Decodes and validates a script tree from JSON.
    ///
    /// # Errors
    /// Returns [`SurveyError::Configuration`] when decoding fails or sibling
    /// answer options repeat.
    pub fn from_json(raw: &str) -> Result<Self, SurveyError> {
        let node: Self = serde_json::from_str(raw)
            .map_err(|err| SurveyError::Configuration(format!("invalid script JSON: {err}")))?;
        node.validate()?;
        Ok(node)
    }

    /// # Errors
    /// Returns [`SurveyError::Configuration`] when two children of one node
    /// share an answer option or a child has an empty answer option.
    pub fn validate(&self) -> Result<(), SurveyError> {
        let mut seen = BTreeSet::new();
        for child in &self.interaction_steps {
            if child.answer_option.trim().is_empty() {
                return Err(SurveyError::Configuration(format!(
                    "answer option MUST be provided for every child of {:?}",
                    self.question_text
                )));
            }
            if !seen.insert(child.answer_option.as_str()) {
                return Err(SurveyError::Configuration(format!(
                    "answer option {:?} repeated under {:?}",
                    child.answer_option, self.question_text
                )));
            }
            child.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewContact {
    pub campaign_id: CampaignId,
    pub assignment_id: Option<AssignmentId>,
    pub message_status: MessageStatus,
    pub cell: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Queued,
    Dispatched,
    Failed,
}

impl ActionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "dispatched" => Some(Self::Dispatched),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Ledger row for an answer action queued against a contact's branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerActionRecord {
    pub dispatch_id: Ulid,
    pub campaign_contact_id: ContactId,
    pub question_step_id: StepId,
    pub branch_step_id: StepId,
    pub action: String,
    pub action_data: String,
    pub status: ActionStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub queued_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// State read inside the reconciliation transaction.
#[derive(Debug, Clone)]
pub struct ContactState {
    pub contact: CampaignContact,
    /// Script version of the contact's campaign as seen by this transaction.
    pub script_version: u32,
    pub responses: Vec<QuestionResponse>,
    pub fired_branches: BTreeSet<StepId>,
}

#[derive(Debug, Clone, Default)]
pub struct PlannedWrite {
    pub plan: ReconcilePlan,
    pub message_status: Option<MessageStatus>,
}

#[derive(Debug, Clone)]
pub struct AppliedReconciliation {
    pub contact: CampaignContact,
    pub plan: ReconcilePlan,
    pub queued_actions: Vec<AnswerActionRecord>,
    pub snapshot: ContactSnapshot,
}

impl SqliteSurveyStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    pub fn open_with_busy_timeout(path: &Path, busy_timeout_ms: u32) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {busy_timeout_ms};
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;"
        ))
        .context("failed to configure sqlite pragmas")?;

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
            .execute_batch(SCHEMA_SURVEY_V1)
            .context("failed to apply survey schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SURVEY_MIGRATION_VERSION, now_text()?],
            )
            .context("failed to register survey schema migration")?;

        Ok(())
    }

    pub fn create_campaign(
        &self,
        organization_id: OrganizationId,
        title: &str,
    ) -> Result<Campaign> {
        if title.trim().is_empty() {
            return Err(anyhow!("campaign title MUST be provided"));
        }

        self.conn
            .execute(
                "INSERT INTO campaign(organization_id, title, script_version, created_at)
                 VALUES (?1, ?2, 0, ?3)",
                params![organization_id.0, title, now_text()?],
            )
            .context("failed to insert campaign")?;

        Ok(Campaign {
            id: CampaignId(self.conn.last_insert_rowid()),
            organization_id,
            title: title.to_string(),
            script_version: 0,
        })
    }

    pub fn load_campaign(&self, campaign_id: CampaignId) -> Result<Option<Campaign>> {
        let campaign = self
            .conn
            .query_row(
                "SELECT id, organization_id, title, script_version FROM campaign WHERE id = ?1",
                params![campaign_id.0],
                parse_campaign_row,
            )
            .optional()
            .context("failed to load campaign")?;
        Ok(campaign)
    }

    /// Saves a new script version: every active step of the campaign is
    /// soft-deleted and `root` is inserted in pre-order.
    pub fn save_script(
        &mut self,
        campaign_id: CampaignId,
        root: &ScriptNode,
    ) -> Result<Vec<InteractionStep>> {
        root.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start script transaction")?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT script_version FROM campaign WHERE id = ?1",
                params![campaign_id.0],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read campaign script version")?;
        let Some(current) = current else {
            return Err(SurveyError::NotFound(format!("campaign {campaign_id}")).into());
        };
        let version = current + 1;
        let now = now_text()?;

        tx.execute(
            "UPDATE interaction_step SET is_deleted = 1
             WHERE campaign_id = ?1 AND is_deleted = 0",
            params![campaign_id.0],
        )
        .context("failed to retire previous script steps")?;

        let mut inserted = Vec::new();
        let mut pending: Vec<(&ScriptNode, Option<StepId>)> = vec![(root, None)];
        while let Some((node, parent)) = pending.pop() {
            tx.execute(
                "INSERT INTO interaction_step(
                    campaign_id, question, script, answer_option, answer_actions,
                    answer_actions_data, parent_interaction_id, is_deleted,
                    script_version, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
                params![
                    campaign_id.0,
                    node.question_text,
                    node.script,
                    if parent.is_some() { node.answer_option.as_str() } else { "" },
                    node.answer_actions.trim(),
                    node.answer_actions_data,
                    parent.map(|id| id.0),
                    version,
                    now,
                ],
            )
            .context("failed to insert interaction step")?;

            let id = StepId(tx.last_insert_rowid());
            inserted.push(InteractionStep {
                id,
                campaign_id,
                question_text: node.question_text.clone(),
                script: node.script.clone(),
                answer_option: if parent.is_some() {
                    node.answer_option.clone()
                } else {
                    String::new()
                },
                answer_actions: node.answer_actions.trim().to_string(),
                answer_actions_data: node.answer_actions_data.clone(),
                parent_interaction_id: parent,
                is_deleted: false,
            });

            for child in node.interaction_steps.iter().rev() {
                pending.push((child, Some(id)));
            }
        }

        tx.execute(
            "UPDATE campaign SET script_version = ?2 WHERE id = ?1",
            params![campaign_id.0, version],
        )
        .context("failed to bump campaign script version")?;

        tx.commit().context("failed to commit script transaction")?;
        Ok(inserted)
    }

    /// Every step of the campaign, soft-deleted ones included.
    pub fn load_steps(&self, campaign_id: CampaignId) -> Result<Vec<InteractionStep>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                id, campaign_id, question, script, answer_option, answer_actions,
                answer_actions_data, parent_interaction_id, is_deleted
             FROM interaction_step
             WHERE campaign_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![campaign_id.0], parse_step_row)?;
        collect_rows(rows)
    }

    pub fn find_step_campaigns(&self, step_ids: &[StepId]) -> Result<BTreeMap<StepId, CampaignId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT campaign_id FROM interaction_step WHERE id = ?1")?;
        let mut found = BTreeMap::new();
        for &step_id in step_ids {
            if found.contains_key(&step_id) {
                continue;
            }
            let campaign: Option<i64> = stmt
                .query_row(params![step_id.0], |row| row.get(0))
                .optional()
                .with_context(|| format!("failed to resolve campaign of step {step_id}"))?;
            if let Some(campaign) = campaign {
                found.insert(step_id, CampaignId(campaign));
            }
        }
        Ok(found)
    }

    pub fn set_user_role(
        &self,
        user_id: UserId,
        organization_id: OrganizationId,
        role: Role,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_organization(user_id, organization_id, role)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, organization_id) DO UPDATE SET role = excluded.role",
                params![user_id.0, organization_id.0, role.as_str()],
            )
            .context("failed to upsert user role")?;
        Ok(())
    }

    pub fn user_role(
        &self,
        user_id: UserId,
        organization_id: OrganizationId,
    ) -> Result<Option<Role>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT role FROM user_organization WHERE user_id = ?1 AND organization_id = ?2",
                params![user_id.0, organization_id.0],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load user role")?;

        raw.map(|value| Role::parse(&value).ok_or_else(|| anyhow!("invalid stored role: {value}")))
            .transpose()
    }

    pub fn insert_assignment(
        &self,
        campaign_id: CampaignId,
        user_id: UserId,
    ) -> Result<Assignment> {
        self.conn
            .execute(
                "INSERT INTO assignment(campaign_id, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![campaign_id.0, user_id.0, now_text()?],
            )
            .context("failed to insert assignment")?;

        Ok(Assignment {
            id: AssignmentId(self.conn.last_insert_rowid()),
            campaign_id,
            user_id,
        })
    }

    pub fn load_assignment(&self, assignment_id: AssignmentId) -> Result<Option<Assignment>> {
        let assignment = self
            .conn
            .query_row(
                "SELECT id, campaign_id, user_id FROM assignment WHERE id = ?1",
                params![assignment_id.0],
                |row| {
                    Ok(Assignment {
                        id: AssignmentId(row.get(0)?),
                        campaign_id: CampaignId(row.get(1)?),
                        user_id: UserId(row.get(2)?),
                    })
                },
            )
            .optional()
            .context("failed to load assignment")?;
        Ok(assignment)
    }

    pub fn insert_contact(&self, contact: &NewContact) -> Result<CampaignContact> {
        if contact.cell.trim().is_empty() {
            return Err(anyhow!("contact cell MUST be provided"));
        }

        self.conn
            .execute(
                "INSERT INTO campaign_contact(
                    campaign_id, assignment_id, message_status, cell,
                    first_name, last_name, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    contact.campaign_id.0,
                    contact.assignment_id.map(|id| id.0),
                    contact.message_status.as_str(),
                    contact.cell,
                    contact.first_name,
                    contact.last_name,
                    now_text()?,
                ],
            )
            .context("failed to insert campaign contact")?;

        Ok(CampaignContact {
            id: ContactId(self.conn.last_insert_rowid()),
            campaign_id: contact.campaign_id,
            assignment_id: contact.assignment_id,
            message_status: contact.message_status,
            cell: contact.cell.clone(),
            first_name: contact.first_name.clone(),
            last_name: contact.last_name.clone(),
        })
    }

    pub fn load_contact(&self, contact_id: ContactId) -> Result<Option<CampaignContact>> {
        load_contact_with(&self.conn, contact_id)
    }

    pub fn set_message_status(&self, contact_id: ContactId, status: MessageStatus) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE campaign_contact SET message_status = ?2, updated_at = ?3 WHERE id = ?1",
                params![contact_id.0, status.as_str(), now_text()?],
            )
            .context("failed to update message status")?;
        if changed == 0 {
            return Err(SurveyError::NotFound(format!("campaign contact {contact_id}")).into());
        }
        Ok(())
    }

    pub fn list_responses(&self, contact_id: ContactId) -> Result<Vec<QuestionResponse>> {
        list_responses_with(&self.conn, contact_id)
    }

    pub fn contact_snapshot(&self, contact_id: ContactId) -> Result<Option<ContactSnapshot>> {
        let Some(contact) = self.load_contact(contact_id)? else {
            return Ok(None);
        };
        let responses = self.list_responses(contact_id)?;
        Ok(Some(snapshot_of(&contact, &responses)))
    }

    /// Runs `planner` against the contact's stored state and applies its
    /// plan, all inside one `IMMEDIATE` transaction.
    ///
    /// Errors raised by `planner` are returned unchanged inside the
    /// [`anyhow::Error`], so callers can `downcast` them back to
    /// [`SurveyError`].
    pub fn reconcile_contact<F>(
        &mut self,
        contact_id: ContactId,
        planner: F,
    ) -> Result<AppliedReconciliation>
    where
        F: FnOnce(&ContactState) -> std::result::Result<PlannedWrite, SurveyError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reconciliation transaction")?;

        let Some(contact) = load_contact_with(&tx, contact_id)? else {
            return Err(SurveyError::NotFound(format!("campaign contact {contact_id}")).into());
        };
        let script_version = tx
            .query_row(
                "SELECT script_version FROM campaign WHERE id = ?1",
                params![contact.campaign_id.0],
                |row| to_u32(0, row.get(0)?, "script_version"),
            )
            .context("failed to read campaign script version")?;
        let state = ContactState {
            script_version,
            responses: list_responses_with(&tx, contact_id)?,
            fired_branches: fired_branches_with(&tx, contact_id)?,
            contact,
        };

        let PlannedWrite {
            plan,
            message_status,
        } = planner(&state)?;
        let now = now_text()?;

        for delete in &plan.deletes {
            let removed = tx
                .execute(
                    "DELETE FROM question_response WHERE id = ?1 AND campaign_contact_id = ?2",
                    params![delete.response_id, contact_id.0],
                )
                .context("failed to delete question response")?;
            if removed != 1 {
                return Err(anyhow!(
                    "question response {} vanished during reconciliation",
                    delete.response_id
                ));
            }
        }

        for update in &plan.updates {
            let changed = tx
                .execute(
                    "UPDATE question_response SET value = ?3
                     WHERE id = ?1 AND campaign_contact_id = ?2",
                    params![update.response_id, contact_id.0, update.value],
                )
                .context("failed to update question response")?;
            if changed != 1 {
                return Err(anyhow!(
                    "question response {} vanished during reconciliation",
                    update.response_id
                ));
            }
        }

        for insert in &plan.inserts {
            tx.execute(
                "INSERT INTO question_response(
                    campaign_contact_id, interaction_step_id, value, created_at
                 ) VALUES (?1, ?2, ?3, ?4)",
                params![contact_id.0, insert.interaction_step_id.0, insert.value, now],
            )
            .context("failed to insert question response")?;
        }

        let mut queued_actions = Vec::with_capacity(plan.actions_to_fire.len());
        for action in &plan.actions_to_fire {
            queued_actions.push(queue_action_with(&tx, action)?);
        }

        let mut contact = state.contact;
        if let Some(status) = message_status.filter(|status| *status != contact.message_status) {
            tx.execute(
                "UPDATE campaign_contact SET message_status = ?2, updated_at = ?3 WHERE id = ?1",
                params![contact_id.0, status.as_str(), now],
            )
            .context("failed to update message status")?;
            contact.message_status = status;
        }

        let responses = list_responses_with(&tx, contact_id)?;
        tx.commit()
            .context("failed to commit reconciliation transaction")?;

        let snapshot = snapshot_of(&contact, &responses);
        Ok(AppliedReconciliation {
            contact,
            plan,
            queued_actions,
            snapshot,
        })
    }

    pub fn list_actions(&self, contact_id: ContactId) -> Result<Vec<AnswerActionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                dispatch_id, campaign_contact_id, question_step_id, interaction_step_id,
                action, action_data, status, attempts, last_error, queued_at, updated_at
             FROM answer_action_dispatch
             WHERE campaign_contact_id = ?1
             ORDER BY queued_at ASC, dispatch_id ASC",
        )?;
        let rows = stmt.query_map(params![contact_id.0], parse_action_row)?;
        collect_rows(rows)
    }

    pub fn list_failed_actions(&self, contact_id: ContactId) -> Result<Vec<AnswerActionRecord>> {
        Ok(self
            .list_actions(contact_id)?
            .into_iter()
            .filter(|record| record.status == ActionStatus::Failed)
            .collect())
    }

    /// Moves a `failed` action back to `queued` so exactly one caller
    /// re-dispatches it. Returns `false` when another caller got there first.
    pub fn claim_failed_action(&self, dispatch_id: Ulid) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE answer_action_dispatch
                 SET status = ?2, updated_at = ?3
                 WHERE dispatch_id = ?1 AND status = ?4",
                params![
                    dispatch_id.to_string(),
                    ActionStatus::Queued.as_str(),
                    now_text()?,
                    ActionStatus::Failed.as_str(),
                ],
            )
            .context("failed to claim failed answer action")?;
        Ok(changed == 1)
    }

    pub fn mark_action_dispatched(&self, dispatch_id: Ulid) -> Result<()> {
        self.finish_action(dispatch_id, ActionStatus::Dispatched, None)
    }

    pub fn mark_action_failed(&self, dispatch_id: Ulid, error: &str) -> Result<()> {
        self.finish_action(dispatch_id, ActionStatus::Failed, Some(error))
    }

    fn finish_action(
        &self,
        dispatch_id: Ulid,
        status: ActionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE answer_action_dispatch
                 SET status = ?2, attempts = attempts + 1, last_error = ?3, updated_at = ?4
                 WHERE dispatch_id = ?1",
                params![dispatch_id.to_string(), status.as_str(), error, now_text()?],
            )
            .context("failed to update answer action ledger")?;
        if changed == 0 {
            return Err(anyhow!("unknown answer action dispatch {dispatch_id}"));
        }
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn load_contact_with(conn: &Connection, contact_id: ContactId) -> Result<Option<CampaignContact>> {
    let contact = conn
        .query_row(
            "SELECT
                id, campaign_id, assignment_id, message_status, cell, first_name, last_name
             FROM campaign_contact
             WHERE id = ?1",
            params![contact_id.0],
            parse_contact_row,
        )
        .optional()
        .context("failed to load campaign contact")?;
    Ok(contact)
}

fn list_responses_with(conn: &Connection, contact_id: ContactId) -> Result<Vec<QuestionResponse>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, campaign_contact_id, interaction_step_id, value, created_at
         FROM question_response
         WHERE campaign_contact_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![contact_id.0], parse_response_row)?;
    collect_rows(rows)
}

fn fired_branches_with(conn: &Connection, contact_id: ContactId) -> Result<BTreeSet<StepId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT interaction_step_id FROM answer_action_dispatch WHERE campaign_contact_id = ?1",
    )?;
    let rows = stmt.query_map(params![contact_id.0], |row| Ok(StepId(row.get(0)?)))?;
    Ok(collect_rows(rows)?.into_iter().collect())
}

fn queue_action_with(conn: &Connection, action: &QueuedAction) -> Result<AnswerActionRecord> {
    let dispatch_id = Ulid::new();
    let queued_at = now_utc();
    let queued_text = format_rfc3339(queued_at).map_err(|err| anyhow!(err.to_string()))?;

    conn.execute(
        "INSERT INTO answer_action_dispatch(
            campaign_contact_id, interaction_step_id, question_step_id, dispatch_id,
            action, action_data, status, attempts, last_error, queued_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, ?8, ?8)",
        params![
            action.campaign_contact_id.0,
            action.branch_step_id.0,
            action.question_step_id.0,
            dispatch_id.to_string(),
            action.action,
            action.action_data,
            ActionStatus::Queued.as_str(),
            queued_text,
        ],
    )
    .context("failed to queue answer action")?;

    Ok(AnswerActionRecord {
        dispatch_id,
        campaign_contact_id: action.campaign_contact_id,
        question_step_id: action.question_step_id,
        branch_step_id: action.branch_step_id,
        action: action.action.clone(),
        action_data: action.action_data.clone(),
        status: ActionStatus::Queued,
        attempts: 0,
        last_error: None,
        queued_at,
        updated_at: queued_at,
    })
}

fn snapshot_of(contact: &CampaignContact, responses: &[QuestionResponse]) -> ContactSnapshot {
    ContactSnapshot {
        contact_id: contact.id,
        message_status: contact.message_status,
        question_response_values: responses
            .iter()
            .map(|response| QuestionResponseValue {
                interaction_step_id: response.interaction_step_id,
                value: response.value.clone(),
            })
            .collect(),
    }
}

fn parse_campaign_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
    let script_version_i64: i64 = row.get(3)?;
    Ok(Campaign {
        id: CampaignId(row.get(0)?),
        organization_id: OrganizationId(row.get(1)?),
        title: row.get(2)?,
        script_version: to_u32(3, script_version_i64, "script_version")?,
    })
}

fn parse_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InteractionStep> {
    Ok(InteractionStep {
        id: StepId(row.get(0)?),
        campaign_id: CampaignId(row.get(1)?),
        question_text: row.get(2)?,
        script: row.get(3)?,
        answer_option: row.get(4)?,
        answer_actions: row.get(5)?,
        answer_actions_data: row.get(6)?,
        parent_interaction_id: row.get::<_, Option<i64>>(7)?.map(StepId),
        is_deleted: row.get::<_, i64>(8)? == 1,
    })
}

fn parse_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CampaignContact> {
    let status_raw: String = row.get(3)?;
    let message_status = MessageStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid message_status: {status_raw}"),
            )),
        )
    })?;

    Ok(CampaignContact {
        id: ContactId(row.get(0)?),
        campaign_id: CampaignId(row.get(1)?),
        assignment_id: row.get::<_, Option<i64>>(2)?.map(AssignmentId),
        message_status,
        cell: row.get(4)?,
        first_name: row.get(5)?,
        last_name: row.get(6)?,
    })
}

fn parse_response_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuestionResponse> {
    Ok(QuestionResponse {
        id: row.get(0)?,
        campaign_contact_id: ContactId(row.get(1)?),
        interaction_step_id: StepId(row.get(2)?),
        value: row.get(3)?,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(4)?).map_err(to_sql_error)?,
    })
}

fn parse_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnswerActionRecord> {
    let dispatch_id_raw: String = row.get(0)?;
    let status_raw: String = row.get(6)?;
    let attempts_i64: i64 = row.get(7)?;

    let dispatch_id = Ulid::from_string(&dispatch_id_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid dispatch_id ULID: {dispatch_id_raw}"),
            )),
        )
    })?;

    let status = ActionStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid action status: {status_raw}"),
            )),
        )
    })?;

    Ok(AnswerActionRecord {
        dispatch_id,
        campaign_contact_id: ContactId(row.get(1)?),
        question_step_id: StepId(row.get(2)?),
        branch_step_id: StepId(row.get(3)?),
        action: row.get(4)?,
        action_data: row.get(5)?,
        status,
        attempts: to_u32(7, attempts_i64, "attempts")?,
        last_error: row.get(8)?,
        queued_at: parse_rfc3339_utc(&row.get::<_, String>(9)?).map_err(to_sql_error)?,
        updated_at: parse_rfc3339_utc(&row.get::<_, String>(10)?).map_err(to_sql_error)?,
    })
}

fn to_u32(index: usize, value: i64, label: &str) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid {label}: {value}"),
            )),
        )
    })
}

fn now_text() -> Result<String> {
    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))
}

fn to_sql_error(err: SurveyError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
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

/// The color survey used across tests:
/// favorite color -> {Red -> {Crimson, Firebrick}, Purple}.
#[cfg(any(test, feature = "test-fixtures"))]
#[must_use]
pub fn color_script() -> ScriptNode {
    fn leaf(answer: &str, script: &str) -> ScriptNode {
        ScriptNode {
            script: script.to_string(),
            answer_option: answer.to_string(),
            ..ScriptNode::default()
        }
    }

    ScriptNode {
        question_text: "What is your favorite color".to_string(),
        script: "Hello {firstName}. Let's talk about your favorite color.".to_string(),
        interaction_steps: vec![
            ScriptNode {
                question_text: "What is your favorite shade of red?".to_string(),
                script: "Red is an awesome color, {firstName}!".to_string(),
                answer_option: "Red".to_string(),
                interaction_steps: vec![
                    leaf("Crimson", "Crimson is a rad shade of red, {firstName}"),
                    leaf("Firebrick", "Firebrick is a rad shade of red, {firstName}"),
                ],
                ..ScriptNode::default()
            },
            leaf("Purple", "Purple is an awesome color, {firstName}!"),
        ],
        ..ScriptNode::default()
    }
}
