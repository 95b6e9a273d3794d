use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    CampaignContact, ContactId, QuestionResponse, QuestionResponseValue, StepId,
    SubmittedAnswer, SurveyError, SurveyTree,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseInsert {
    pub interaction_step_id: StepId,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseUpdate {
    pub response_id: i64,
    pub interaction_step_id: StepId,
    pub previous_value: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    /// The caller submitted an empty value for the step.
    Cleared,
    /// The step sits below a branch that is no longer chosen.
    Orphaned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseDelete {
    pub response_id: i64,
    pub interaction_step_id: StepId,
    pub value: String,
    pub reason: DeleteReason,
}

/// An answer action bound to a branch the contact has now chosen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedAction {
    pub campaign_contact_id: ContactId,
    pub question_step_id: StepId,
    pub branch_step_id: StepId,
    pub action: String,
    pub action_data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub inserts: Vec<ResponseInsert>,
    pub updates: Vec<ResponseUpdate>,
    pub deletes: Vec<ResponseDelete>,
    /// Submitted answers dropped because they sit below a branch the contact
    /// has not chosen.
    pub discarded: Vec<SubmittedAnswer>,
    /// Responses after the plan is applied, in insertion order.
    pub final_responses: Vec<QuestionResponseValue>,
    pub actions_to_fire: Vec<QueuedAction>,
}

impl ReconcilePlan {
    #[must_use]
    pub fn changes_responses(&self) -> bool {
        !(self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty())
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.changes_responses() && self.actions_to_fire.is_empty()
    }
}

/// Collapses duplicate step ids, keeping the last value and the position of
/// the first occurrence.
#[must_use]
pub fn collapse_submitted(submitted: &[SubmittedAnswer]) -> Vec<SubmittedAnswer> {
    let mut positions: BTreeMap<StepId, usize> = BTreeMap::new();
    let mut collapsed: Vec<SubmittedAnswer> = Vec::with_capacity(submitted.len());
    for answer in submitted {
        if let Some(&position) = positions.get(&answer.interaction_step_id) {
            collapsed[position].value.clone_from(&answer.value);
        } else {
            positions.insert(answer.interaction_step_id, collapsed.len());
            collapsed.push(answer.clone());
        }
    }
    collapsed
}

/// Diffs a contact's stored responses against a submitted batch.
///
/// `existing` must be ordered by response id. `fired_branches` holds the
/// branch steps whose answer action was already queued for this contact.
///
/// # Errors
/// Returns [`SurveyError::NotFound`] for steps outside the tree and
/// [`SurveyError::CrossCampaignMismatch`] for steps of another campaign.
pub fn plan_reconciliation(
    tree: &SurveyTree,
    contact: &CampaignContact,
    existing: &[QuestionResponse],
    fired_branches: &BTreeSet<StepId>,
    submitted: &[SubmittedAnswer],
) -> Result<ReconcilePlan, SurveyError> {
    for answer in submitted {
        let step = answer.interaction_step_id;
        match tree.resolve_campaign(step) {
            None => {
                return Err(SurveyError::NotFound(format!("interaction step {step}")));
            }
            Some(step_campaign) if step_campaign != contact.campaign_id => {
                return Err(SurveyError::CrossCampaignMismatch {
                    step,
                    step_campaign,
                    contact_campaign: contact.campaign_id,
                });
            }
            Some(_) => {}
        }
    }

    let collapsed = collapse_submitted(submitted);
    let stored: BTreeMap<StepId, &QuestionResponse> = existing
        .iter()
        .map(|response| (response.interaction_step_id, response))
        .collect();

    let mut desired: BTreeMap<StepId, &str> = BTreeMap::new();
    let mut orphaned: BTreeSet<StepId> = BTreeSet::new();
    for answer in &collapsed {
        let step = answer.interaction_step_id;
        if let Some(previous) = stored.get(&step) {
            if previous.value == answer.value {
                continue;
            }
            if let Some(old_branch) = tree.child_for_answer(step, &previous.value) {
                orphaned.extend(tree.subtree(old_branch.id));
            }
        }
        desired.insert(step, answer.value.as_str());
    }

    let mut plan = ReconcilePlan::default();
    for response in existing {
        let step = response.interaction_step_id;
        if orphaned.contains(&step) {
            plan.deletes.push(delete_of(response, DeleteReason::Orphaned));
            continue;
        }
        match desired.get(&step) {
            Some(value) if value.is_empty() => {
                plan.deletes.push(delete_of(response, DeleteReason::Cleared));
            }
            Some(value) => {
                plan.updates.push(ResponseUpdate {
                    response_id: response.id,
                    interaction_step_id: step,
                    previous_value: response.value.clone(),
                    value: (*value).to_string(),
                });
                plan.final_responses.push(QuestionResponseValue {
                    interaction_step_id: step,
                    value: (*value).to_string(),
                });
            }
            None => plan.final_responses.push(QuestionResponseValue {
                interaction_step_id: step,
                value: response.value.clone(),
            }),
        }
    }

    let mut answers: BTreeMap<StepId, &str> = plan
        .final_responses
        .iter()
        .map(|item| (item.interaction_step_id, item.value.as_str()))
        .collect();
    let mut candidates: BTreeSet<StepId> = BTreeSet::new();
    for answer in &collapsed {
        let step = answer.interaction_step_id;
        if orphaned.contains(&step) || stored.contains_key(&step) || answer.value.is_empty() {
            continue;
        }
        candidates.insert(step);
        answers.insert(step, answer.value.as_str());
    }
    // Dropping one answer can cut the path of answers below it.
    loop {
        let unreachable: Vec<StepId> = candidates
            .iter()
            .copied()
            .filter(|&step| !on_chosen_path(tree, &answers, step))
            .collect();
        if unreachable.is_empty() {
            break;
        }
        for step in unreachable {
            candidates.remove(&step);
            answers.remove(&step);
        }
    }

    for answer in collapsed {
        let step = answer.interaction_step_id;
        if orphaned.contains(&step) {
            plan.discarded.push(answer);
            continue;
        }
        if stored.contains_key(&step) || answer.value.is_empty() {
            continue;
        }
        if !candidates.contains(&step) {
            plan.discarded.push(answer);
            continue;
        }
        plan.final_responses.push(QuestionResponseValue {
            interaction_step_id: step,
            value: answer.value.clone(),
        });
        plan.inserts.push(ResponseInsert {
            interaction_step_id: step,
            value: answer.value,
        });
    }

    plan.actions_to_fire = pending_actions(tree, contact, &plan.final_responses, fired_branches);
    Ok(plan)
}

fn pending_actions(
    tree: &SurveyTree,
    contact: &CampaignContact,
    responses: &[QuestionResponseValue],
    fired_branches: &BTreeSet<StepId>,
) -> Vec<QueuedAction> {
    responses
        .iter()
        .filter_map(|response| {
            let branch = tree.child_for_answer(response.interaction_step_id, &response.value)?;
            if !branch.has_answer_action() || fired_branches.contains(&branch.id) {
                return None;
            }
            Some(QueuedAction {
                campaign_contact_id: contact.id,
                question_step_id: response.interaction_step_id,
                branch_step_id: branch.id,
                action: branch.answer_actions.trim().to_string(),
                action_data: branch.answer_actions_data.clone(),
            })
        })
        .collect()
}

/// Whether every question above `step` is answered with the option that
/// leads to it.
fn on_chosen_path(tree: &SurveyTree, answers: &BTreeMap<StepId, &str>, step: StepId) -> bool {
    let Some(mut current) = tree.step(step) else {
        return false;
    };
    while let Some(parent) = current.parent_interaction_id {
        if answers.get(&parent) != Some(&current.answer_option.as_str()) {
            return false;
        }
        let Some(next) = tree.step(parent) else {
            return false;
        };
        current = next;
    }
    true
}

fn delete_of(response: &QuestionResponse, reason: DeleteReason) -> ResponseDelete {
    ResponseDelete {
        response_id: response.id,
        interaction_step_id: response.interaction_step_id,
        value: response.value.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::fixtures::*;
    use crate::{CampaignId, MessageStatus};
    use proptest::prelude::*;
    use time::OffsetDateTime;

    fn must<T>(result: Result<T, SurveyError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn color_tree() -> SurveyTree {
        must(SurveyTree::build(CAMPAIGN, 1, color_steps()))
    }

    fn contact() -> CampaignContact {
        CampaignContact {
            id: ContactId(1),
            campaign_id: CAMPAIGN,
            assignment_id: None,
            message_status: MessageStatus::Messaged,
            cell: "+15555550100".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        }
    }

    fn answer(step: StepId, value: &str) -> SubmittedAnswer {
        SubmittedAnswer {
            interaction_step_id: step,
            value: value.to_string(),
        }
    }

    fn stored(rows: &[(StepId, &str)]) -> Vec<QuestionResponse> {
        rows.iter()
            .zip(1_i64..)
            .map(|((step, value), id)| QuestionResponse {
                id,
                campaign_contact_id: ContactId(1),
                interaction_step_id: *step,
                value: (*value).to_string(),
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .collect()
    }

    fn values(plan: &ReconcilePlan) -> Vec<(StepId, String)> {
        plan.final_responses
            .iter()
            .map(|item| (item.interaction_step_id, item.value.clone()))
            .collect()
    }

    /// Applies a plan to an in-memory row set the way the store does.
    fn apply(rows: &mut Vec<QuestionResponse>, plan: &ReconcilePlan, next_id: &mut i64) {
        let deleted: BTreeSet<i64> = plan.deletes.iter().map(|item| item.response_id).collect();
        rows.retain(|row| !deleted.contains(&row.id));
        for update in &plan.updates {
            for row in rows.iter_mut() {
                if row.id == update.response_id {
                    row.value.clone_from(&update.value);
                }
            }
        }
        for insert in &plan.inserts {
            *next_id += 1;
            rows.push(QuestionResponse {
                id: *next_id,
                campaign_contact_id: ContactId(1),
                interaction_step_id: insert.interaction_step_id,
                value: insert.value.clone(),
                created_at: OffsetDateTime::UNIX_EPOCH,
            });
        }
    }

    #[test]
    fn fresh_contact_gets_both_answers_inserted() {
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &[],
            &BTreeSet::new(),
            &[answer(ROOT, "Red"), answer(RED, "Crimson")],
        ));

        assert_eq!(plan.inserts.len(), 2);
        assert!(plan.updates.is_empty());
        assert!(plan.deletes.is_empty());
        assert_eq!(
            values(&plan),
            vec![(ROOT, "Red".to_string()), (RED, "Crimson".to_string())]
        );
    }

    #[test]
    fn changing_mid_tree_answer_orphans_descendants() {
        let existing = stored(&[(ROOT, "Red"), (RED, "Crimson")]);
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &existing,
            &BTreeSet::new(),
            &[answer(ROOT, "Purple")],
        ));

        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].previous_value, "Red");
        assert_eq!(plan.updates[0].value, "Purple");
        assert_eq!(
            plan.deletes,
            vec![ResponseDelete {
                response_id: 2,
                interaction_step_id: RED,
                value: "Crimson".to_string(),
                reason: DeleteReason::Orphaned,
            }]
        );
        assert_eq!(values(&plan), vec![(ROOT, "Purple".to_string())]);
    }

    #[test]
    fn unchanged_answers_are_a_noop() {
        let existing = stored(&[(ROOT, "Red"), (RED, "Crimson")]);
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &existing,
            &BTreeSet::new(),
            &[answer(ROOT, "Red"), answer(RED, "Crimson")],
        ));
        assert!(plan.is_noop());
        assert_eq!(plan.final_responses.len(), 2);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let existing = stored(&[(ROOT, "Purple")]);
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &existing,
            &BTreeSet::new(),
            &[],
        ));
        assert!(plan.is_noop());
        assert_eq!(values(&plan), vec![(ROOT, "Purple".to_string())]);
    }

    #[test]
    fn unknown_answer_values_are_stored_verbatim() {
        let existing = stored(&[(ROOT, "Red"), (RED, "Crimson")]);
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &existing,
            &BTreeSet::new(),
            &[answer(ROOT, "Magenta")],
        ));
        assert_eq!(values(&plan), vec![(ROOT, "Magenta".to_string())]);
        assert_eq!(plan.deletes.len(), 1);

        let from_free_text = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &stored(&[(ROOT, "Magenta")]),
            &BTreeSet::new(),
            &[answer(ROOT, "Red")],
        ));
        assert!(from_free_text.deletes.is_empty());
        assert_eq!(from_free_text.updates.len(), 1);
    }

    #[test]
    fn duplicate_steps_use_last_value_in_list_order() {
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &[],
            &BTreeSet::new(),
            &[answer(ROOT, "Red"), answer(ROOT, "Purple")],
        ));
        assert_eq!(values(&plan), vec![(ROOT, "Purple".to_string())]);
    }

    #[test]
    fn answers_below_an_abandoned_branch_are_discarded() {
        let existing = stored(&[(ROOT, "Red"), (RED, "Crimson")]);
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &existing,
            &BTreeSet::new(),
            &[answer(ROOT, "Purple"), answer(RED, "Firebrick")],
        ));
        assert_eq!(plan.discarded, vec![answer(RED, "Firebrick")]);
        assert_eq!(values(&plan), vec![(ROOT, "Purple".to_string())]);
    }

    #[test]
    fn answers_under_an_unchosen_branch_are_discarded() {
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &stored(&[(ROOT, "Purple")]),
            &BTreeSet::new(),
            &[answer(RED, "Crimson")],
        ));
        assert!(plan.is_noop());
        assert_eq!(plan.discarded, vec![answer(RED, "Crimson")]);
        assert_eq!(values(&plan), vec![(ROOT, "Purple".to_string())]);

        let fresh = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &[],
            &BTreeSet::new(),
            &[answer(RED, "Crimson"), answer(CRIMSON, "x")],
        ));
        assert!(fresh.inserts.is_empty());
        assert_eq!(fresh.discarded.len(), 2);
        assert!(fresh.final_responses.is_empty());
    }

    #[test]
    fn child_answers_follow_a_new_branch_in_the_same_batch() {
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &stored(&[(ROOT, "Purple")]),
            &BTreeSet::new(),
            &[answer(RED, "Crimson"), answer(ROOT, "Red")],
        ));
        assert!(plan.discarded.is_empty());
        assert_eq!(
            values(&plan),
            vec![(ROOT, "Red".to_string()), (RED, "Crimson".to_string())]
        );
    }

    #[test]
    fn empty_value_clears_the_response_and_its_branch() {
        let existing = stored(&[(ROOT, "Red"), (RED, "Crimson")]);
        let plan = must(plan_reconciliation(
            &color_tree(),
            &contact(),
            &existing,
            &BTreeSet::new(),
            &[answer(ROOT, "")],
        ));
        assert!(plan.final_responses.is_empty());
        assert_eq!(
            plan.deletes.iter().map(|item| item.reason).collect::<Vec<_>>(),
            vec![DeleteReason::Cleared, DeleteReason::Orphaned]
        );
    }

    #[test]
    fn foreign_and_unknown_steps_are_rejected() {
        let mut other_campaign = contact();
        other_campaign.campaign_id = CampaignId(2);
        let result = plan_reconciliation(
            &color_tree(),
            &other_campaign,
            &[],
            &BTreeSet::new(),
            &[answer(ROOT, "Red")],
        );
        assert!(matches!(
            result,
            Err(SurveyError::CrossCampaignMismatch { .. })
        ));

        let result = plan_reconciliation(
            &color_tree(),
            &contact(),
            &[],
            &BTreeSet::new(),
            &[answer(StepId(404), "Red")],
        );
        assert!(matches!(result, Err(SurveyError::NotFound(_))));
    }

    #[test]
    fn actions_fire_once_per_branch() {
        let mut steps = color_steps();
        steps[4].answer_actions = "tag-contact".to_string();
        steps[4].answer_actions_data = "{\"tag\":\"purple\"}".to_string();
        let tree = must(SurveyTree::build(CAMPAIGN, 1, steps));

        let plan = must(plan_reconciliation(
            &tree,
            &contact(),
            &[],
            &BTreeSet::new(),
            &[answer(ROOT, "Purple")],
        ));
        assert_eq!(plan.actions_to_fire.len(), 1);
        assert_eq!(plan.actions_to_fire[0].branch_step_id, PURPLE);
        assert_eq!(plan.actions_to_fire[0].action, "tag-contact");

        let fired: BTreeSet<StepId> = [PURPLE].into_iter().collect();
        let again = must(plan_reconciliation(
            &tree,
            &contact(),
            &stored(&[(ROOT, "Purple")]),
            &fired,
            &[answer(ROOT, "Purple")],
        ));
        assert!(again.actions_to_fire.is_empty());
    }

    #[test]
    fn collapse_keeps_first_position_and_last_value() {
        let collapsed = collapse_submitted(&[
            answer(ROOT, "Red"),
            answer(RED, "Crimson"),
            answer(ROOT, "Purple"),
        ]);
        assert_eq!(collapsed, vec![answer(ROOT, "Purple"), answer(RED, "Crimson")]);
    }

    fn arbitrary_answer() -> impl Strategy<Value = SubmittedAnswer> {
        let steps = prop::sample::select(vec![ROOT, RED, CRIMSON, FIREBRICK, PURPLE]);
        let values =
            prop::sample::select(vec!["", "Red", "Purple", "Crimson", "Firebrick", "Magenta"]);
        (steps, values).prop_map(|(step, value)| answer(step, value))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_branch_changes_never_leave_orphans(
            batches in prop::collection::vec(prop::collection::vec(arbitrary_answer(), 0..5), 1..8)
        ) {
            let tree = color_tree();
            let contact = contact();
            let mut rows: Vec<QuestionResponse> = Vec::new();
            let mut next_id = 0_i64;

            // Seed a consistent path so later batches exercise branch changes.
            let seed = must(plan_reconciliation(
                &tree, &contact, &rows, &BTreeSet::new(),
                &[answer(ROOT, "Red"), answer(RED, "Crimson")],
            ));
            apply(&mut rows, &seed, &mut next_id);

            for batch in batches {
                let before: BTreeMap<StepId, String> = rows
                    .iter()
                    .map(|row| (row.interaction_step_id, row.value.clone()))
                    .collect();
                let plan = must(plan_reconciliation(&tree, &contact, &rows, &BTreeSet::new(), &batch));
                apply(&mut rows, &plan, &mut next_id);

                let after: BTreeMap<StepId, String> = rows
                    .iter()
                    .map(|row| (row.interaction_step_id, row.value.clone()))
                    .collect();
                prop_assert_eq!(after.len(), rows.len());

                // Nothing survives below a branch that was just abandoned.
                for (step, old_value) in &before {
                    if after.get(step) == Some(old_value) {
                        continue;
                    }
                    if let Some(old_branch) = tree.child_for_answer(*step, old_value) {
                        for below in tree.subtree(old_branch.id) {
                            prop_assert!(
                                !after.contains_key(&below),
                                "response on {} survived a change of {}", below, step
                            );
                        }
                    }
                }

                prop_assert!(
                    tree.orphaned_answers(&after).is_empty(),
                    "orphaned responses after {:?}: {:?}", batch, after
                );

                let final_values: Vec<(StepId, String)> = rows
                    .iter()
                    .map(|row| (row.interaction_step_id, row.value.clone()))
                    .collect();
                prop_assert_eq!(values(&plan), final_values);
            }
        }
    }
}
