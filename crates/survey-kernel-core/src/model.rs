use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    AssignmentId, CampaignId, ContactId, OrganizationId, StepId, SurveyError, UserId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    NeedsMessage,
    Messaged,
    NeedsResponse,
    Responded,
    Convo,
    MessageError,
    Closed,
}

impl MessageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeedsMessage => "needsMessage",
            Self::Messaged => "messaged",
            Self::NeedsResponse => "needsResponse",
            Self::Responded => "responded",
            Self::Convo => "convo",
            Self::MessageError => "messageError",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "needsMessage" => Some(Self::NeedsMessage),
            "messaged" => Some(Self::Messaged),
            "needsResponse" => Some(Self::NeedsResponse),
            "responded" => Some(Self::Responded),
            "convo" => Some(Self::Convo),
            "messageError" => Some(Self::MessageError),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Organization roles, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Texter,
    Supervolunteer,
    Admin,
    Owner,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Texter => "TEXTER",
            Self::Supervolunteer => "SUPERVOLUNTEER",
            Self::Admin => "ADMIN",
            Self::Owner => "OWNER",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TEXTER" => Some(Self::Texter),
            "SUPERVOLUNTEER" => Some(Self::Supervolunteer),
            "ADMIN" => Some(Self::Admin),
            "OWNER" => Some(Self::Owner),
            _ => None,
        }
    }

    /// Roles at or above `SUPERVOLUNTEER` may edit any contact in the
    /// organization.
    #[must_use]
    pub fn is_admin_equivalent(self) -> bool {
        self >= Self::Supervolunteer
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractionStep {
    pub id: StepId,
    pub campaign_id: CampaignId,
    pub question_text: String,
    pub script: String,
    pub answer_option: String,
    pub answer_actions: String,
    pub answer_actions_data: String,
    pub parent_interaction_id: Option<StepId>,
    pub is_deleted: bool,
}

impl InteractionStep {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_interaction_id.is_none()
    }

    #[must_use]
    pub fn has_answer_action(&self) -> bool {
        !self.answer_actions.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Campaign {
    pub id: CampaignId,
    pub organization_id: OrganizationId,
    pub title: String,
    pub script_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub id: AssignmentId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignContact {
    pub id: ContactId,
    pub campaign_id: CampaignId,
    pub assignment_id: Option<AssignmentId>,
    pub message_status: MessageStatus,
    pub cell: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionResponse {
    pub id: i64,
    pub campaign_contact_id: ContactId,
    pub interaction_step_id: StepId,
    pub value: String,
    pub created_at: OffsetDateTime,
}

/// One entry of an `updateQuestionResponses` request, ids still in their
/// wire (string) form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResponseInput {
    pub campaign_contact_id: String,
    pub interaction_step_id: String,
    pub value: String,
}

impl QuestionResponseInput {
    /// Parses the wire ids and checks the entry targets `contact_id`.
    ///
    /// # Errors
    /// Returns [`SurveyError::InvalidRequest`] for malformed ids or when the
    /// entry names a different contact than the request.
    pub fn parse_for(&self, contact_id: ContactId) -> Result<SubmittedAnswer, SurveyError> {
        let entry_contact = ContactId::parse(&self.campaign_contact_id)?;
        if entry_contact != contact_id {
            return Err(SurveyError::InvalidRequest(format!(
                "question response for contact {entry_contact} submitted in a request for contact {contact_id}"
            )));
        }

        Ok(SubmittedAnswer {
            interaction_step_id: StepId::parse(&self.interaction_step_id)?,
            value: self.value.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmittedAnswer {
    pub interaction_step_id: StepId,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResponseValue {
    pub interaction_step_id: StepId,
    pub value: String,
}

/// Cached per-contact view: message status plus responses in insertion
/// order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactSnapshot {
    pub contact_id: ContactId,
    pub message_status: MessageStatus,
    pub question_response_values: Vec<QuestionResponseValue>,
}

/// The contact record handed back to API callers after a reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: ContactId,
    pub campaign_id: CampaignId,
    pub assignment_id: Option<AssignmentId>,
    pub message_status: MessageStatus,
    pub cell: String,
    pub question_response_values: Vec<QuestionResponseValue>,
}

impl ContactRecord {
    #[must_use]
    pub fn from_snapshot(contact: &CampaignContact, snapshot: &ContactSnapshot) -> Self {
        Self {
            id: contact.id,
            campaign_id: contact.campaign_id,
            assignment_id: contact.assignment_id,
            message_status: snapshot.message_status,
            cell: contact.cell.clone(),
            question_response_values: snapshot.question_response_values.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
}
