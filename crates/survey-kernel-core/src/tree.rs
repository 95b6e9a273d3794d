use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{CampaignId, InteractionStep, StepId, SurveyError};

/// Arena index over one campaign's interaction steps.
///
/// Deleted steps stay in the arena so historical responses still resolve to
/// their campaign, but they never appear as children and are never walked
/// into.
#[derive(Debug, Clone)]
pub struct SurveyTree {
    campaign_id: CampaignId,
    script_version: u32,
    steps: Vec<InteractionStep>,
    index: HashMap<StepId, usize>,
    children: HashMap<StepId, Vec<usize>>,
    root: Option<usize>,
}

impl SurveyTree {
    /// Builds the index for a campaign from all of its steps.
    ///
    /// # Errors
    /// Returns [`SurveyError::Configuration`] when steps belong to another
    /// campaign, reference unknown parents, form a cycle, have more than one
    /// active root, or repeat an answer option among active siblings.
    pub fn build(
        campaign_id: CampaignId,
        script_version: u32,
        steps: Vec<InteractionStep>,
    ) -> Result<Self, SurveyError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (position, step) in steps.iter().enumerate() {
            if step.campaign_id != campaign_id {
                return Err(SurveyError::Configuration(format!(
                    "interaction step {} belongs to campaign {}, not {campaign_id}",
                    step.id, step.campaign_id
                )));
            }
            if index.insert(step.id, position).is_some() {
                return Err(SurveyError::Configuration(format!(
                    "duplicate interaction step id {}",
                    step.id
                )));
            }
        }

        let mut children: HashMap<StepId, Vec<usize>> = HashMap::new();
        let mut root = None;
        for (position, step) in steps.iter().enumerate() {
            if step.is_deleted {
                continue;
            }
            match step.parent_interaction_id {
                None => {
                    if let Some(existing) = root {
                        let existing: &InteractionStep = &steps[existing];
                        return Err(SurveyError::Configuration(format!(
                            "campaign {campaign_id} has two active root steps: {} and {}",
                            existing.id, step.id
                        )));
                    }
                    root = Some(position);
                }
                Some(parent) => {
                    if !index.contains_key(&parent) {
                        return Err(SurveyError::Configuration(format!(
                            "interaction step {} references unknown parent {parent}",
                            step.id
                        )));
                    }
                    let siblings = children.entry(parent).or_default();
                    if siblings
                        .iter()
                        .any(|&other| steps[other].answer_option == step.answer_option)
                    {
                        return Err(SurveyError::Configuration(format!(
                            "answer option {:?} repeated under interaction step {parent}",
                            step.answer_option
                        )));
                    }
                    siblings.push(position);
                }
            }
        }

        let tree = Self {
            campaign_id,
            script_version,
            steps,
            index,
            children,
            root,
        };
        tree.ensure_acyclic()?;
        Ok(tree)
    }

    #[must_use]
    pub fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    #[must_use]
    pub fn script_version(&self) -> u32 {
        self.script_version
    }

    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&InteractionStep> {
        self.index.get(&id).map(|&position| &self.steps[position])
    }

    #[must_use]
    pub fn root(&self) -> Option<&InteractionStep> {
        self.root.map(|position| &self.steps[position])
    }

    /// Campaign owning `id`, including soft-deleted steps.
    #[must_use]
    pub fn resolve_campaign(&self, id: StepId) -> Option<CampaignId> {
        self.step(id).map(|step| step.campaign_id)
    }

    #[must_use]
    pub fn child_options(&self, id: StepId) -> Vec<(StepId, &str)> {
        self.children(id)
            .map(|child| (child.id, child.answer_option.as_str()))
            .collect()
    }

    #[must_use]
    pub fn child_for_answer(&self, id: StepId, value: &str) -> Option<&InteractionStep> {
        self.children(id).find(|child| child.answer_option == value)
    }

    #[must_use]
    pub fn is_valid_answer(&self, id: StepId, value: &str) -> bool {
        self.child_for_answer(id, value).is_some()
    }

    /// `id` and every active step below it.
    #[must_use]
    pub fn subtree(&self, id: StepId) -> Vec<StepId> {
        let mut collected = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            collected.push(current);
            stack.extend(self.children(current).map(|child| child.id));
        }
        collected
    }

    /// Walks from the root following `answers` and returns the deepest step
    /// reached, which is the question the contact is currently on.
    #[must_use]
    pub fn current_step(&self, answers: &BTreeMap<StepId, String>) -> Option<&InteractionStep> {
        let mut current = self.root()?;
        while let Some(value) = answers.get(&current.id) {
            match self.child_for_answer(current.id, value) {
                Some(next) => current = next,
                None => break,
            }
        }
        Some(current)
    }

    /// Answered steps whose parent question is answered with a different
    /// branch (or not at all). Deleted or unknown steps are ignored.
    #[must_use]
    pub fn orphaned_answers(&self, answers: &BTreeMap<StepId, String>) -> Vec<StepId> {
        answers
            .keys()
            .filter_map(|&id| {
                let step = self.step(id)?;
                if step.is_deleted {
                    return None;
                }
                let parent = step.parent_interaction_id?;
                let consistent = answers
                    .get(&parent)
                    .is_some_and(|value| *value == step.answer_option);
                (!consistent).then_some(id)
            })
            .collect()
    }

    fn children(&self, id: StepId) -> impl Iterator<Item = &InteractionStep> + '_ {
        self.children
            .get(&id)
            .into_iter()
            .flatten()
            .map(|&position| &self.steps[position])
    }

    fn ensure_acyclic(&self) -> Result<(), SurveyError> {
        for step in &self.steps {
            let mut seen = HashSet::new();
            let mut cursor = Some(step.id);
            while let Some(id) = cursor {
                if !seen.insert(id) {
                    return Err(SurveyError::Configuration(format!(
                        "interaction step {} is part of a parent cycle",
                        step.id
                    )));
                }
                cursor = self.step(id).and_then(|item| item.parent_interaction_id);
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn must<T>(result: Result<T, SurveyError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn color_tree() -> SurveyTree {
        must(SurveyTree::build(CAMPAIGN, 1, color_steps()))
    }

    #[test]
    fn resolves_children_by_answer_option() {
        let tree = color_tree();
        assert_eq!(tree.root().map(|step| step.id), Some(ROOT));
        assert_eq!(tree.child_options(ROOT), vec![(RED, "Red"), (PURPLE, "Purple")]);
        assert_eq!(tree.child_for_answer(RED, "Crimson").map(|s| s.id), Some(CRIMSON));
        assert!(tree.is_valid_answer(ROOT, "Purple"));
        assert!(!tree.is_valid_answer(ROOT, "Magenta"));
        assert!(tree.child_options(PURPLE).is_empty());
    }

    #[test]
    fn subtree_covers_all_descendants() {
        let tree = color_tree();
        let mut below_red = tree.subtree(RED);
        below_red.sort();
        assert_eq!(below_red, vec![RED, CRIMSON, FIREBRICK]);
        assert_eq!(tree.subtree(PURPLE), vec![PURPLE]);
    }

    #[test]
    fn deleted_steps_resolve_campaign_but_are_not_children() {
        let mut steps = color_steps();
        steps[4].is_deleted = true;
        let mut replacement = step(StepId(6), Some(ROOT), "Purple", "");
        replacement.script = "new purple".to_string();
        steps.push(replacement);

        let tree = must(SurveyTree::build(CAMPAIGN, 2, steps));
        assert_eq!(tree.resolve_campaign(PURPLE), Some(CAMPAIGN));
        assert_eq!(tree.child_for_answer(ROOT, "Purple").map(|s| s.id), Some(StepId(6)));
        assert_eq!(tree.script_version(), 2);
    }

    #[test]
    fn rejects_duplicate_sibling_answers() {
        let mut steps = color_steps();
        steps.push(step(StepId(9), Some(ROOT), "Red", ""));
        assert!(matches!(
            SurveyTree::build(CAMPAIGN, 1, steps),
            Err(SurveyError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_parent_cycles_and_foreign_steps() {
        let mut cyclic = color_steps();
        cyclic[0].parent_interaction_id = Some(CRIMSON);
        assert!(SurveyTree::build(CAMPAIGN, 1, cyclic).is_err());

        let mut foreign = color_steps();
        foreign[2].campaign_id = CampaignId(99);
        assert!(SurveyTree::build(CAMPAIGN, 1, foreign).is_err());
    }

    #[test]
    fn current_step_follows_answers_down_the_tree() {
        let tree = color_tree();
        let mut answers = BTreeMap::new();
        assert_eq!(tree.current_step(&answers).map(|s| s.id), Some(ROOT));

        answers.insert(ROOT, "Red".to_string());
        assert_eq!(tree.current_step(&answers).map(|s| s.id), Some(RED));

        answers.insert(RED, "Firebrick".to_string());
        assert_eq!(tree.current_step(&answers).map(|s| s.id), Some(FIREBRICK));

        answers.insert(ROOT, "Magenta".to_string());
        assert_eq!(tree.current_step(&answers).map(|s| s.id), Some(ROOT));
    }

    #[test]
    fn orphaned_answers_flags_mismatched_parents() {
        let tree = color_tree();
        let mut answers = BTreeMap::new();
        answers.insert(ROOT, "Purple".to_string());
        answers.insert(RED, "Crimson".to_string());
        assert_eq!(tree.orphaned_answers(&answers), vec![RED]);

        answers.insert(ROOT, "Red".to_string());
        assert!(tree.orphaned_answers(&answers).is_empty());
    }

    #[test]
    fn empty_campaign_has_no_root() {
        let tree = must(SurveyTree::build(CAMPAIGN, 0, Vec::new()));
        assert!(tree.root().is_none());
        assert!(tree.current_step(&BTreeMap::new()).is_none());
    }
}
