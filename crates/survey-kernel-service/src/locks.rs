use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use survey_kernel_core::ContactId;

/// In-process mutual exclusion per contact. Calls for different contacts
/// never contend here.
#[derive(Debug, Default)]
pub(crate) struct ContactLocks {
    locks: DashMap<ContactId, Arc<Mutex<()>>>,
}

impl ContactLocks {
    pub(crate) fn lock_for(&self, contact_id: ContactId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(contact_id).or_default().value())
    }

    /// Drops entries nobody holds.
    pub(crate) fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_contact_shares_one_mutex() {
        let locks = ContactLocks::default();
        let first = locks.lock_for(ContactId(1));
        let second = locks.lock_for(ContactId(1));
        assert!(Arc::ptr_eq(&first, &second));

        let guard = first.lock();
        assert!(second.try_lock().is_none());
        drop(guard);
        assert!(second.try_lock().is_some());
    }

    #[test]
    fn prune_keeps_held_locks_only() {
        let locks = ContactLocks::default();
        let held = locks.lock_for(ContactId(1));
        drop(locks.lock_for(ContactId(2)));
        assert_eq!(locks.len(), 2);

        locks.prune();
        assert_eq!(locks.len(), 1);
        assert!(Arc::ptr_eq(&held, &locks.lock_for(ContactId(1))));
    }
}
