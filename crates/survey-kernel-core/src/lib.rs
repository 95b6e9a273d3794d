//! Domain model and pure planning logic for survey question responses.
//!
//! Nothing in this crate touches storage: the store crate loads rows, hands
//! them to [`plan_reconciliation`], and applies the resulting
//! [`ReconcilePlan`] inside its own transaction.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

mod model;
mod permission;
mod reconcile;
mod template;
mod tree;

pub use model::{
    Actor, Assignment, Campaign, CampaignContact, ContactRecord, ContactSnapshot,
    InteractionStep, MessageStatus, QuestionResponse, QuestionResponseInput,
    QuestionResponseValue, Role, SubmittedAnswer,
};
pub use permission::{AccessRequest, AssignmentOrAdminGuard, PermissionGuard};
pub use reconcile::{
    collapse_submitted, plan_reconciliation, DeleteReason, QueuedAction, ReconcilePlan,
    ResponseDelete, ResponseInsert, ResponseUpdate,
};
pub use template::{render_script, ScriptFields};
pub use tree::SurveyTree;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SurveyError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(
        "cross-campaign mismatch: interaction step {step} belongs to campaign \
         {step_campaign}, contact belongs to campaign {contact_campaign}"
    )]
    CrossCampaignMismatch {
        step: StepId,
        step_campaign: CampaignId,
        contact_campaign: CampaignId,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

macro_rules! entity_id {
    ($name:ident, $label:literal) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Parses a decimal id as sent by API callers.
            ///
            /// # Errors
            /// Returns [`SurveyError::InvalidRequest`] when `raw` is not a
            /// positive integer.
            pub fn parse(raw: &str) -> Result<Self, SurveyError> {
                match raw.trim().parse::<i64>() {
                    Ok(value) if value > 0 => Ok(Self(value)),
                    _ => Err(SurveyError::InvalidRequest(format!(
                        "invalid {} id: {raw:?}",
                        $label
                    ))),
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(CampaignId, "campaign");
entity_id!(ContactId, "campaign contact");
entity_id!(StepId, "interaction step");
entity_id!(AssignmentId, "assignment");
entity_id!(OrganizationId, "organization");
entity_id!(UserId, "user");

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SurveyError::InvalidRequest`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SurveyError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SurveyError::InvalidRequest(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SurveyError::InvalidRequest(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SurveyError::InvalidRequest`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SurveyError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            SurveyError::InvalidRequest(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
