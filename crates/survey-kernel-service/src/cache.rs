use std::sync::Arc;

use moka::sync::Cache;
use survey_kernel_core::{CampaignId, ContactId, ContactSnapshot, SurveyTree};

use crate::EngineConfig;

/// Write-through cache of per-contact answer snapshots.
///
/// The durable store stays the source of truth: entries are saved only after
/// a commit and dropped whenever a reconciliation fails.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    inner: Cache<ContactId, Arc<ContactSnapshot>>,
}

impl ResponseCache {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.cache_capacity);
        if let Some(ttl) = config.cache_ttl() {
            builder = builder.time_to_live(ttl);
        }
        Self {
            inner: builder.build(),
        }
    }

    pub fn save(&self, contact_id: ContactId, snapshot: ContactSnapshot) {
        self.inner.insert(contact_id, Arc::new(snapshot));
    }

    #[must_use]
    pub fn get(&self, contact_id: ContactId) -> Option<Arc<ContactSnapshot>> {
        self.inner.get(&contact_id)
    }

    pub fn invalidate(&self, contact_id: ContactId) {
        self.inner.invalidate(&contact_id);
    }
}

/// Built survey trees keyed by campaign and script version, so saving a new
/// script never serves a stale tree.
#[derive(Debug, Clone)]
pub(crate) struct TreeCache {
    inner: Cache<(CampaignId, u32), Arc<SurveyTree>>,
}

impl TreeCache {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::new(capacity),
        }
    }

    pub(crate) fn get(
        &self,
        campaign_id: CampaignId,
        script_version: u32,
    ) -> Option<Arc<SurveyTree>> {
        self.inner.get(&(campaign_id, script_version))
    }

    pub(crate) fn insert(&self, tree: Arc<SurveyTree>) {
        self.inner
            .insert((tree.campaign_id(), tree.script_version()), tree);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use survey_kernel_core::{MessageStatus, QuestionResponseValue, StepId};

    fn snapshot(value: &str) -> ContactSnapshot {
        ContactSnapshot {
            contact_id: ContactId(1),
            message_status: MessageStatus::Messaged,
            question_response_values: vec![QuestionResponseValue {
                interaction_step_id: StepId(1),
                value: value.to_string(),
            }],
        }
    }

    #[test]
    fn save_overwrites_and_invalidate_drops() {
        let cache = ResponseCache::new(&EngineConfig::default());
        assert!(cache.get(ContactId(1)).is_none());

        cache.save(ContactId(1), snapshot("Red"));
        cache.save(ContactId(1), snapshot("Purple"));
        let cached = cache.get(ContactId(1));
        assert_eq!(
            cached.map(|item| item.question_response_values[0].value.clone()),
            Some("Purple".to_string())
        );

        cache.invalidate(ContactId(1));
        assert!(cache.get(ContactId(1)).is_none());
    }

    #[test]
    fn tree_cache_is_keyed_by_script_version() {
        let cache = TreeCache::new(4);
        let tree = match SurveyTree::build(CampaignId(1), 2, Vec::new()) {
            Ok(value) => value,
            Err(err) => panic!("empty tree rejected: {err}"),
        };
        cache.insert(Arc::new(tree));
        assert!(cache.get(CampaignId(1), 2).is_some());
        assert!(cache.get(CampaignId(1), 3).is_none());
    }
}
