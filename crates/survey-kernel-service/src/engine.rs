use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use survey_kernel_core::{
    plan_reconciliation, render_script, AccessRequest, Actor, AssignmentOrAdminGuard, Campaign,
    CampaignContact, ContactId, ContactRecord, ContactSnapshot, MessageStatus,
    PermissionGuard, QuestionResponseInput, ScriptFields, StepId, SubmittedAnswer, SurveyError,
    SurveyTree,
};
use survey_kernel_store_sqlite::{
    AnswerActionRecord, ContactState, PlannedWrite, SqliteSurveyStore,
};
use tracing::{debug, error, info, warn};

use crate::cache::TreeCache;
use crate::locks::ContactLocks;
use crate::{
    ActionContext, AnswerActionRegistry, EngineConfig, MessageStatusPolicy, ResponseCache,
    RetainStatusPolicy, StatusFacts,
};

/// The question a contact is currently on, with its script rendered for
/// sending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NextScript {
    pub interaction_step_id: StepId,
    pub question_text: String,
    pub script: String,
    pub answer_options: Vec<String>,
}

pub struct SurveyEngineBuilder {
    db_path: PathBuf,
    config: EngineConfig,
    guard: Arc<dyn PermissionGuard>,
    status_policy: Arc<dyn MessageStatusPolicy>,
    actions: AnswerActionRegistry,
    cache: Option<ResponseCache>,
}

impl SurveyEngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn guard(mut self, guard: Arc<dyn PermissionGuard>) -> Self {
        self.guard = guard;
        self
    }

    #[must_use]
    pub fn status_policy(mut self, policy: Arc<dyn MessageStatusPolicy>) -> Self {
        self.status_policy = policy;
        self
    }

    #[must_use]
    pub fn actions(mut self, actions: AnswerActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    /// Shares an existing cache instead of creating one from the config.
    #[must_use]
    pub fn cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validates the config and migrates the database before handing out the
    /// engine.
    ///
    /// # Errors
    /// Returns [`SurveyError::Configuration`] for an invalid config and
    /// [`SurveyError::Storage`] when the database cannot be opened or
    /// migrated.
    pub fn build(self) -> Result<SurveyEngine, SurveyError> {
        self.config.validate()?;

        let store =
            SqliteSurveyStore::open_with_busy_timeout(&self.db_path, self.config.busy_timeout_ms)
                .map_err(into_survey_error)?;
        store.migrate().map_err(into_survey_error)?;

        let cache = self
            .cache
            .unwrap_or_else(|| ResponseCache::new(&self.config));
        Ok(SurveyEngine {
            trees: TreeCache::new(self.config.tree_cache_capacity),
            db_path: self.db_path,
            config: self.config,
            guard: self.guard,
            status_policy: self.status_policy,
            actions: self.actions,
            cache,
            locks: ContactLocks::default(),
        })
    }
}

/// Reconciles survey answers for campaign contacts.
///
/// Every call opens its own store connection, so one engine can be shared
/// across threads behind an `Arc`.
pub struct SurveyEngine {
    db_path: PathBuf,
    config: EngineConfig,
    guard: Arc<dyn PermissionGuard>,
    status_policy: Arc<dyn MessageStatusPolicy>,
    actions: AnswerActionRegistry,
    cache: ResponseCache,
    trees: TreeCache,
    locks: ContactLocks,
}

impl SurveyEngine {
    #[must_use]
    pub fn builder(db_path: impl Into<PathBuf>) -> SurveyEngineBuilder {
        SurveyEngineBuilder {
            db_path: db_path.into(),
            config: EngineConfig::default(),
            guard: Arc::new(AssignmentOrAdminGuard),
            status_policy: Arc::new(RetainStatusPolicy),
            actions: AnswerActionRegistry::new(),
            cache: None,
        }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// # Errors
    /// Returns [`SurveyError::Storage`] when the database cannot be opened.
    pub fn open_store(&self) -> Result<SqliteSurveyStore, SurveyError> {
        SqliteSurveyStore::open_with_busy_timeout(&self.db_path, self.config.busy_timeout_ms)
            .map_err(into_survey_error)
    }

    /// Applies a batch of answers for one contact and returns the contact's
    /// record as stored afterwards.
    ///
    /// Responses below a branch that is no longer chosen are deleted in the
    /// same transaction. Answer actions of newly chosen branches are
    /// dispatched after the commit; their failures are logged and ledgered
    /// but never fail the call.
    ///
    /// # Errors
    /// - [`SurveyError::InvalidRequest`] for malformed ids or entries naming
    ///   another contact.
    /// - [`SurveyError::NotFound`] for an unknown contact or step.
    /// - [`SurveyError::PermissionDenied`] when the guard rejects `actor`.
    /// - [`SurveyError::CrossCampaignMismatch`] when a step belongs to a
    ///   different campaign than the contact.
    /// - [`SurveyError::Storage`] when the write fails; nothing is persisted.
    pub fn update_question_responses(
        &self,
        inputs: &[QuestionResponseInput],
        contact_id: ContactId,
        actor: &Actor,
    ) -> Result<ContactRecord, SurveyError> {
        let submitted = inputs
            .iter()
            .map(|input| input.parse_for(contact_id))
            .collect::<Result<Vec<_>, _>>()?;
        self.reconcile(&submitted, contact_id, actor)
    }

    /// Clears the answers for `step_ids`, with the same orphan cleanup as
    /// an update. Steps without a stored answer are ignored.
    ///
    /// # Errors
    /// Same as [`SurveyEngine::update_question_responses`].
    pub fn delete_question_responses(
        &self,
        step_ids: &[StepId],
        contact_id: ContactId,
        actor: &Actor,
    ) -> Result<ContactRecord, SurveyError> {
        let submitted: Vec<SubmittedAnswer> = step_ids
            .iter()
            .map(|&interaction_step_id| SubmittedAnswer {
                interaction_step_id,
                value: String::new(),
            })
            .collect();
        self.reconcile(&submitted, contact_id, actor)
    }

    /// Cached answer state, rebuilt from the store on a miss.
    ///
    /// # Errors
    /// Returns [`SurveyError::NotFound`] for an unknown contact.
    pub fn contact_snapshot(&self, contact_id: ContactId) -> Result<ContactSnapshot, SurveyError> {
        if let Some(snapshot) = self.cache.get(contact_id) {
            debug!(contact_id = %contact_id, "response cache hit");
            return Ok((*snapshot).clone());
        }

        let lock = self.locks.lock_for(contact_id);
        let rebuilt = {
            let _guard = lock.lock();
            if let Some(snapshot) = self.cache.get(contact_id) {
                return Ok((*snapshot).clone());
            }
            debug!(contact_id = %contact_id, "response cache miss; rebuilding from store");
            let store = self.open_store()?;
            let snapshot = store
                .contact_snapshot(contact_id)
                .map_err(into_survey_error)?
                .ok_or_else(|| contact_not_found(contact_id))?;
            self.cache.save(contact_id, snapshot.clone());
            snapshot
        };
        drop(lock);
        self.locks.prune();
        Ok(rebuilt)
    }

    /// # Errors
    /// Returns [`SurveyError::NotFound`] for an unknown contact.
    pub fn contact_record(&self, contact_id: ContactId) -> Result<ContactRecord, SurveyError> {
        let contact = load_contact(&self.open_store()?, contact_id)?;
        let snapshot = self.contact_snapshot(contact_id)?;
        Ok(ContactRecord::from_snapshot(&contact, &snapshot))
    }

    /// Stores a new message status and drops the cached snapshot.
    ///
    /// # Errors
    /// Returns [`SurveyError::NotFound`] for an unknown contact.
    pub fn set_message_status(
        &self,
        contact_id: ContactId,
        status: MessageStatus,
    ) -> Result<(), SurveyError> {
        let lock = self.locks.lock_for(contact_id);
        let result = {
            let _guard = lock.lock();
            let result = self
                .open_store()?
                .set_message_status(contact_id, status)
                .map_err(into_survey_error);
            self.cache.invalidate(contact_id);
            result
        };
        drop(lock);
        self.locks.prune();
        result
    }

    /// Renders the script of the step the contact is currently on. `None`
    /// when the campaign has no script yet.
    ///
    /// # Errors
    /// Returns [`SurveyError::NotFound`] for an unknown contact or campaign.
    pub fn next_script(
        &self,
        contact_id: ContactId,
        texter_first_name: &str,
    ) -> Result<Option<NextScript>, SurveyError> {
        let store = self.open_store()?;
        let contact = load_contact(&store, contact_id)?;
        let campaign = load_campaign(&store, &contact)?;
        let tree = self.tree_for(&store, &campaign)?;
        let snapshot = self.contact_snapshot(contact_id)?;

        let answers: BTreeMap<StepId, String> = snapshot
            .question_response_values
            .into_iter()
            .map(|item| (item.interaction_step_id, item.value))
            .collect();
        let Some(step) = tree.current_step(&answers) else {
            return Ok(None);
        };

        let fields = ScriptFields::for_contact(&contact, texter_first_name);
        Ok(Some(NextScript {
            interaction_step_id: step.id,
            question_text: step.question_text.clone(),
            script: render_script(&step.script, &fields),
            answer_options: tree
                .child_options(step.id)
                .into_iter()
                .map(|(_, option)| option.to_string())
                .collect(),
        }))
    }

    /// Re-dispatches the contact's failed answer actions and returns their
    /// ledger rows afterwards.
    ///
    /// # Errors
    /// Returns [`SurveyError::PermissionDenied`] when the guard rejects
    /// `actor`, [`SurveyError::NotFound`] for an unknown contact.
    pub fn retry_failed_actions(
        &self,
        contact_id: ContactId,
        actor: &Actor,
    ) -> Result<Vec<AnswerActionRecord>, SurveyError> {
        let store = self.open_store()?;
        let (contact, _) = self.authorize(&store, contact_id, actor)?;

        let lock = self.locks.lock_for(contact_id);
        let (claimed, recovered) = {
            let _guard = lock.lock();
            let mut claimed = Vec::new();
            for record in store
                .list_failed_actions(contact_id)
                .map_err(into_survey_error)?
            {
                // Another engine on the same database may have claimed it.
                if store
                    .claim_failed_action(record.dispatch_id)
                    .map_err(into_survey_error)?
                {
                    claimed.push(record);
                }
            }
            let recovered = claimed
                .iter()
                .filter(|record| self.dispatch_record(&store, &contact, record))
                .count();
            (claimed, recovered)
        };
        drop(lock);
        self.locks.prune();
        info!(
            contact_id = %contact_id,
            retried = claimed.len(),
            recovered,
            "failed answer actions retried"
        );

        let retried: BTreeSet<_> = claimed.iter().map(|record| record.dispatch_id).collect();
        Ok(store
            .list_actions(contact_id)
            .map_err(into_survey_error)?
            .into_iter()
            .filter(|record| retried.contains(&record.dispatch_id))
            .collect())
    }

    fn reconcile(
        &self,
        submitted: &[SubmittedAnswer],
        contact_id: ContactId,
        actor: &Actor,
    ) -> Result<ContactRecord, SurveyError> {
        let mut store = self.open_store()?;
        let (contact, campaign) = self.authorize(&store, contact_id, actor)?;
        let tree = self.tree_for(&store, &campaign)?;
        check_step_campaigns(&store, &tree, &contact, submitted)?;

        let lock = self.locks.lock_for(contact_id);
        let outcome = {
            let _guard = lock.lock();
            let policy = &*self.status_policy;
            let outcome = store.reconcile_contact(contact_id, |state| {
                ensure_unchanged(&contact, &tree, state)?;
                let plan = plan_reconciliation(
                    &tree,
                    &state.contact,
                    &state.responses,
                    &state.fired_branches,
                    submitted,
                )?;
                let facts = StatusFacts {
                    current: state.contact.message_status,
                    responses_changed: plan.changes_responses(),
                    first_response: state.responses.is_empty()
                        && !plan.final_responses.is_empty(),
                };
                Ok(PlannedWrite {
                    message_status: policy.next_status(&facts),
                    plan,
                })
            });
            match outcome {
                Ok(applied) => {
                    self.cache.save(contact_id, applied.snapshot.clone());
                    Ok(applied)
                }
                Err(err) => {
                    self.cache.invalidate(contact_id);
                    Err(into_survey_error(err))
                }
            }
        };
        drop(lock);
        self.locks.prune();

        let applied = match outcome {
            Ok(applied) => applied,
            Err(err) => {
                warn!(
                    contact_id = %contact_id,
                    error = %err,
                    "question response reconciliation failed"
                );
                return Err(err);
            }
        };

        for answer in &applied.plan.discarded {
            debug!(
                contact_id = %contact_id,
                interaction_step_id = %answer.interaction_step_id,
                value = %answer.value,
                "discarded answer outside the chosen branches"
            );
        }
        info!(
            contact_id = %contact_id,
            inserts = applied.plan.inserts.len(),
            updates = applied.plan.updates.len(),
            deletes = applied.plan.deletes.len(),
            discarded = applied.plan.discarded.len(),
            actions = applied.queued_actions.len(),
            message_status = applied.contact.message_status.as_str(),
            "question responses reconciled"
        );

        for record in &applied.queued_actions {
            self.dispatch_record(&store, &applied.contact, record);
        }

        Ok(ContactRecord::from_snapshot(
            &applied.contact,
            &applied.snapshot,
        ))
    }

    fn authorize(
        &self,
        store: &SqliteSurveyStore,
        contact_id: ContactId,
        actor: &Actor,
    ) -> Result<(CampaignContact, Campaign), SurveyError> {
        let contact = load_contact(store, contact_id)?;
        let campaign = load_campaign(store, &contact)?;
        let role = store
            .user_role(actor.user_id, campaign.organization_id)
            .map_err(into_survey_error)?;
        let assignment = match contact.assignment_id {
            Some(assignment_id) => store
                .load_assignment(assignment_id)
                .map_err(into_survey_error)?,
            None => None,
        };

        self.guard.authorize(&AccessRequest {
            actor,
            organization_id: campaign.organization_id,
            role,
            assignment: assignment.as_ref(),
            contact: &contact,
        })?;
        Ok((contact, campaign))
    }

    fn tree_for(
        &self,
        store: &SqliteSurveyStore,
        campaign: &Campaign,
    ) -> Result<Arc<SurveyTree>, SurveyError> {
        if let Some(tree) = self.trees.get(campaign.id, campaign.script_version) {
            return Ok(tree);
        }

        debug!(
            campaign_id = %campaign.id,
            script_version = campaign.script_version,
            "building survey tree"
        );
        let steps = store.load_steps(campaign.id).map_err(into_survey_error)?;
        let tree = Arc::new(SurveyTree::build(
            campaign.id,
            campaign.script_version,
            steps,
        )?);
        self.trees.insert(Arc::clone(&tree));
        Ok(tree)
    }

    /// Returns whether the handler succeeded. Ledger write failures are
    /// logged only.
    fn dispatch_record(
        &self,
        store: &SqliteSurveyStore,
        contact: &CampaignContact,
        record: &AnswerActionRecord,
    ) -> bool {
        let context = ActionContext::for_record(record, contact);
        match self.actions.dispatch(&record.action, &context) {
            Ok(()) => {
                if let Err(err) = store.mark_action_dispatched(record.dispatch_id) {
                    error!(
                        dispatch_id = %record.dispatch_id,
                        error = %format!("{err:#}"),
                        "failed to mark answer action dispatched"
                    );
                }
                true
            }
            Err(dispatch_err) => {
                warn!(
                    dispatch_id = %record.dispatch_id,
                    contact_id = %contact.id,
                    action = %record.action,
                    error = %dispatch_err,
                    "answer action dispatch failed"
                );
                if let Err(err) =
                    store.mark_action_failed(record.dispatch_id, &dispatch_err.to_string())
                {
                    error!(
                        dispatch_id = %record.dispatch_id,
                        error = %format!("{err:#}"),
                        "failed to record answer action failure"
                    );
                }
                false
            }
        }
    }
}

/// Authorization and the tree are resolved before the write transaction;
/// reject the request if either went stale in between.
fn ensure_unchanged(
    checked: &CampaignContact,
    tree: &SurveyTree,
    state: &ContactState,
) -> Result<(), SurveyError> {
    if state.contact.assignment_id != checked.assignment_id
        || state.contact.campaign_id != checked.campaign_id
    {
        return Err(SurveyError::InvalidRequest(format!(
            "campaign contact {} was reassigned during the request; retry",
            checked.id
        )));
    }
    if state.script_version != tree.script_version() {
        return Err(SurveyError::InvalidRequest(format!(
            "campaign {} script changed to version {} during the request; retry",
            checked.campaign_id, state.script_version
        )));
    }
    Ok(())
}

/// Steps outside the contact's current tree either belong to another
/// campaign or do not exist.
fn check_step_campaigns(
    store: &SqliteSurveyStore,
    tree: &SurveyTree,
    contact: &CampaignContact,
    submitted: &[SubmittedAnswer],
) -> Result<(), SurveyError> {
    let unknown: Vec<StepId> = submitted
        .iter()
        .map(|answer| answer.interaction_step_id)
        .filter(|&step| tree.resolve_campaign(step).is_none())
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }

    let owners = store
        .find_step_campaigns(&unknown)
        .map_err(into_survey_error)?;
    for step in unknown {
        match owners.get(&step) {
            Some(&step_campaign) if step_campaign != contact.campaign_id => {
                return Err(SurveyError::CrossCampaignMismatch {
                    step,
                    step_campaign,
                    contact_campaign: contact.campaign_id,
                });
            }
            _ => return Err(SurveyError::NotFound(format!("interaction step {step}"))),
        }
    }
    Ok(())
}

fn load_contact(
    store: &SqliteSurveyStore,
    contact_id: ContactId,
) -> Result<CampaignContact, SurveyError> {
    store
        .load_contact(contact_id)
        .map_err(into_survey_error)?
        .ok_or_else(|| contact_not_found(contact_id))
}

fn load_campaign(
    store: &SqliteSurveyStore,
    contact: &CampaignContact,
) -> Result<Campaign, SurveyError> {
    store
        .load_campaign(contact.campaign_id)
        .map_err(into_survey_error)?
        .ok_or_else(|| SurveyError::NotFound(format!("campaign {}", contact.campaign_id)))
}

fn contact_not_found(contact_id: ContactId) -> SurveyError {
    SurveyError::NotFound(format!("campaign contact {contact_id}"))
}

/// Recovers a [`SurveyError`] raised inside the store, otherwise reports a
/// storage failure.
pub(crate) fn into_survey_error(err: anyhow::Error) -> SurveyError {
    match err.downcast::<SurveyError>() {
        Ok(survey) => survey,
        Err(other) => SurveyError::Storage(format!("{other:#}")),
    }
}
