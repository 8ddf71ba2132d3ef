// Per-user serialisation of profile read-modify-write cycles
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per user id, shared by every service that loads and then
/// saves a `UserSecurityProfile`. Different users never wait on each other.
#[derive(Debug, Default)]
pub struct ProfileLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProfileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `user_id`'s profile. Held until the
    /// guard drops.
    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            // Slots nobody holds or waits on are dropped here.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(user_id.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
