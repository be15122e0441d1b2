use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use crate::catalog::ItemId;

/// Items with a pipeline run in flight in this process.
#[derive(Clone, Default)]
pub struct Claims {
    inner: Arc<Mutex<HashSet<ItemId>>>,
}

/// Releases the claim when dropped.
pub struct ClaimGuard {
    inner: Arc<Mutex<HashSet<ItemId>>>,
    id: ItemId,
}

impl Claims {
    /// `None` if `id` is already claimed.
    pub fn try_claim(&self, id: ItemId) -> Option<ClaimGuard> {
        let mut claimed = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(id) {
            return None;
        }

        Some(ClaimGuard {
            inner: self.inner.clone(),
            id,
        })
    }

    pub fn is_claimed(&self, id: ItemId) -> bool {
        self.inner
            .lock()
            .map(|claimed| claimed.contains(&id))
            .unwrap_or(false)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut claimed = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        claimed.remove(&self.id);
    }
}
