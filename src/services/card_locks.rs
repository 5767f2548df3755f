//! Per-card serialization
//!
//! Two notifications for the same card must not interleave their
//! classify/extract/write phases. A keyed lock map hands out one async mutex
//! per card id, created lazily; notifications for different cards proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct CardLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CardLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a card, holding it for the guard's lifetime.
    pub async fn acquire(&self, card_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(card_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
