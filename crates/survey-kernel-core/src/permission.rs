use crate::{Actor, Assignment, CampaignContact, OrganizationId, Role, SurveyError};

/// Everything a guard needs to decide whether `actor` may edit `contact`.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub actor: &'a Actor,
    pub organization_id: OrganizationId,
    pub role: Option<Role>,
    pub assignment: Option<&'a Assignment>,
    pub contact: &'a CampaignContact,
}

pub trait PermissionGuard: Send + Sync {
    /// # Errors
    /// Returns [`SurveyError::PermissionDenied`] when the actor may not edit
    /// the contact.
    fn authorize(&self, request: &AccessRequest<'_>) -> Result<(), SurveyError>;
}

/// Admin-equivalent roles pass; everyone else must own the contact's
/// assignment.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssignmentOrAdminGuard;

impl PermissionGuard for AssignmentOrAdminGuard {
    fn authorize(&self, request: &AccessRequest<'_>) -> Result<(), SurveyError> {
        if request.role.is_some_and(Role::is_admin_equivalent) {
            return Ok(());
        }

        let owns_assignment = request.assignment.is_some_and(|assignment| {
            request.contact.assignment_id == Some(assignment.id)
                && assignment.campaign_id == request.contact.campaign_id
                && assignment.user_id == request.actor.user_id
        });
        if owns_assignment {
            return Ok(());
        }

        Err(SurveyError::PermissionDenied(format!(
            "user {} may not edit contact {} in organization {}",
            request.actor.user_id, request.contact.id, request.organization_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssignmentId, CampaignId, ContactId, MessageStatus, UserId};

    fn contact() -> CampaignContact {
        CampaignContact {
            id: ContactId(10),
            campaign_id: CampaignId(1),
            assignment_id: Some(AssignmentId(3)),
            message_status: MessageStatus::Messaged,
            cell: "+15555550100".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        }
    }

    fn assignment(user: i64) -> Assignment {
        Assignment {
            id: AssignmentId(3),
            campaign_id: CampaignId(1),
            user_id: UserId(user),
        }
    }

    fn check(
        actor: i64,
        role: Option<Role>,
        assignment: Option<&Assignment>,
    ) -> Result<(), SurveyError> {
        let actor = Actor {
            user_id: UserId(actor),
        };
        let contact = contact();
        AssignmentOrAdminGuard.authorize(&AccessRequest {
            actor: &actor,
            organization_id: OrganizationId(1),
            role,
            assignment,
            contact: &contact,
        })
    }

    #[test]
    fn assigned_texter_may_edit() {
        let owned = assignment(7);
        assert!(check(7, Some(Role::Texter), Some(&owned)).is_ok());
    }

    #[test]
    fn other_texter_is_denied() {
        let owned = assignment(7);
        assert!(matches!(
            check(8, Some(Role::Texter), Some(&owned)),
            Err(SurveyError::PermissionDenied(_))
        ));
        assert!(check(8, None, None).is_err());
    }

    #[test]
    fn admin_equivalents_bypass_assignment_ownership() {
        assert!(check(8, Some(Role::Supervolunteer), None).is_ok());
        assert!(check(8, Some(Role::Owner), None).is_ok());
    }

    #[test]
    fn assignment_must_match_the_contact() {
        let mut elsewhere = assignment(7);
        elsewhere.id = AssignmentId(4);
        assert!(check(7, Some(Role::Texter), Some(&elsewhere)).is_err());
    }
}
