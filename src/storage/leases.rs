//! Study leases keep a study directory alive while a request reads from it.
//!
//! A sweep may only delete a study while holding the [`EvictionClaim`] returned
//! by [`LeaseTable::begin_eviction`], which is refused while any lease is held.
//! A lease requested during an eviction waits for it to finish; the holder must
//! then re-check what is on disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Held(usize),
    Evicting,
}

#[derive(Debug, Default)]
pub(crate) struct LeaseTable {
    state: Mutex<HashMap<String, LeaseState>>,
    evicted: Notify,
}

impl LeaseTable {
    fn state(&self) -> MutexGuard<'_, HashMap<String, LeaseState>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a lease on `study_uid`, waiting out any eviction in progress.
    pub(crate) async fn acquire(self: &Arc<Self>, study_uid: &str) -> StudyLease {
        loop {
            let notified = {
                let mut state = self.state();
                match state.get_mut(study_uid) {
                    None => {
                        state.insert(study_uid.to_string(), LeaseState::Held(1));
                        return self.lease(study_uid);
                    }
                    Some(LeaseState::Held(count)) => {
                        *count += 1;
                        return self.lease(study_uid);
                    }
                    // registered before the lock is released, so the wakeup cannot be missed
                    Some(LeaseState::Evicting) => self.evicted.notified(),
                }
            };
            notified.await;
        }
    }

    fn lease(self: &Arc<Self>, study_uid: &str) -> StudyLease {
        StudyLease {
            table: Arc::clone(self),
            study_uid: study_uid.to_string(),
        }
    }

    fn release(&self, study_uid: &str) {
        let mut state = self.state();
        if let Some(LeaseState::Held(count)) = state.get_mut(study_uid) {
            if *count > 1 {
                *count -= 1;
            } else {
                state.remove(study_uid);
            }
        }
    }

    /// Claim `study_uid` for deletion. Returns `None` while it is leased or already claimed.
    ///
    /// The claim is released when the returned guard drops, including when the
    /// sweep holding it is cancelled mid-eviction.
    pub(crate) fn begin_eviction(self: &Arc<Self>, study_uid: &str) -> Option<EvictionClaim> {
        let mut state = self.state();
        if state.contains_key(study_uid) {
            return None;
        }
        state.insert(study_uid.to_string(), LeaseState::Evicting);
        Some(EvictionClaim {
            table: Arc::clone(self),
            study_uid: study_uid.to_string(),
        })
    }

    fn end_eviction(&self, study_uid: &str) {
        let mut state = self.state();
        if state.get(study_uid) == Some(&LeaseState::Evicting) {
            state.remove(study_uid);
        }
        drop(state);
        self.evicted.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn is_leased(&self, study_uid: &str) -> bool {
        matches!(self.state().get(study_uid), Some(LeaseState::Held(_)))
    }
}

/// Guard returned by [`RetrievalCache::lease`](crate::storage::RetrievalCache::lease).
/// The study cannot be evicted until every guard for it is dropped.
#[derive(Debug)]
pub struct StudyLease {
    table: Arc<LeaseTable>,
    study_uid: String,
}

impl StudyLease {
    pub fn study_uid(&self) -> &str {
        &self.study_uid
    }
}

impl Drop for StudyLease {
    fn drop(&mut self) {
        self.table.release(&self.study_uid);
    }
}

/// Exclusive right to delete a study, held by a sweep
#[derive(Debug)]
pub(crate) struct EvictionClaim {
    table: Arc<LeaseTable>,
    study_uid: String,
}

impl Drop for EvictionClaim {
    fn drop(&mut self) {
        self.table.end_eviction(&self.study_uid);
    }
}
