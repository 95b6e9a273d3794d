use std::collections::BTreeMap;
use std::sync::Arc;

use survey_kernel_core::{CampaignContact, StepId};
use survey_kernel_store_sqlite::AnswerActionRecord;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ActionDispatchError {
    #[error("unknown answer action: {0}")]
    UnknownAction(String),
    #[error("answer action {action} failed: {reason}")]
    HandlerFailed { action: String, reason: String },
}

/// What a handler sees when a branch carrying its identifier is chosen.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub dispatch_id: Ulid,
    pub contact: &'a CampaignContact,
    pub question_step_id: StepId,
    pub branch_step_id: StepId,
    pub action_data: &'a str,
}

impl<'a> ActionContext<'a> {
    #[must_use]
    pub fn for_record(record: &'a AnswerActionRecord, contact: &'a CampaignContact) -> Self {
        Self {
            dispatch_id: record.dispatch_id,
            contact,
            question_step_id: record.question_step_id,
            branch_step_id: record.branch_step_id,
            action_data: &record.action_data,
        }
    }
}

pub trait AnswerActionHandler: Send + Sync {
    /// # Errors
    /// Returns [`ActionDispatchError::HandlerFailed`] when the side effect
    /// could not be performed.
    fn handle(&self, context: &ActionContext<'_>) -> Result<(), ActionDispatchError>;
}

/// Identifier to handler table consulted for every queued answer action.
#[derive(Clone, Default)]
pub struct AnswerActionRegistry {
    handlers: BTreeMap<String, Arc<dyn AnswerActionHandler>>,
}

impl std::fmt::Debug for AnswerActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerActionRegistry")
            .field("actions", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AnswerActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn AnswerActionHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    #[must_use]
    pub fn with(
        mut self,
        action: impl Into<String>,
        handler: Arc<dyn AnswerActionHandler>,
    ) -> Self {
        self.register(action, handler);
        self
    }

    #[must_use]
    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// # Errors
    /// Returns [`ActionDispatchError::UnknownAction`] when nothing is
    /// registered under `action`, otherwise whatever the handler returns.
    pub fn dispatch(
        &self,
        action: &str,
        context: &ActionContext<'_>,
    ) -> Result<(), ActionDispatchError> {
        let handler = self
            .handlers
            .get(action)
            .ok_or_else(|| ActionDispatchError::UnknownAction(action.to_string()))?;
        handler.handle(context)
    }
}

/// Records the dispatch in the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingActionHandler;

impl AnswerActionHandler for LoggingActionHandler {
    fn handle(&self, context: &ActionContext<'_>) -> Result<(), ActionDispatchError> {
        tracing::info!(
            dispatch_id = %context.dispatch_id,
            contact_id = %context.contact.id,
            question_step_id = %context.question_step_id,
            branch_step_id = %context.branch_step_id,
            action_data = context.action_data,
            "answer action dispatched"
        );
        Ok(())
    }
}
