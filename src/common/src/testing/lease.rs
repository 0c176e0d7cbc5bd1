use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::lease::{Lease, LeaseError, LeaseService};
use crate::time::TimeProvider;

/// [`LeaseService`] keeping leases in process memory, expiring them against
/// the given clock.
#[derive(Debug)]
pub struct InMemoryLeaseService {
    time_provider: Arc<dyn TimeProvider>,
    leases: Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>,
    obtained: Mutex<Vec<String>>,
}

impl InMemoryLeaseService {
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            time_provider,
            leases: Mutex::new(HashMap::new()),
            obtained: Mutex::new(Vec::new()),
        }
    }

    /// Take `key` on behalf of some other process
    pub fn hold(&self, key: &str, timeout: Duration) {
        let expires_at = self.time_provider.now()
            + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.leases
            .lock()
            .insert(key.to_string(), (Uuid::new_v4(), expires_at));
    }

    pub fn is_held(&self, key: &str) -> bool {
        let now = self.time_provider.now();
        self.leases
            .lock()
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now)
    }

    /// Keys of every lease successfully obtained through [`LeaseService::try_obtain`]
    pub fn obtained_keys(&self) -> Vec<String> {
        self.obtained.lock().clone()
    }
}

#[async_trait]
impl LeaseService for InMemoryLeaseService {
    async fn try_obtain(&self, key: &str, timeout: Duration) -> Result<Option<Lease>, LeaseError> {
        let now = self.time_provider.now();
        let mut leases = self.leases.lock();
        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let uuid = Uuid::new_v4();
        let expires_at = now + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        leases.insert(key.to_string(), (uuid, expires_at));
        self.obtained.lock().push(key.to_string());
        Ok(Some(Lease {
            key: key.to_string(),
            uuid,
        }))
    }

    async fn cancel(&self, lease: &Lease) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock();
        if leases.get(&lease.key).is_some_and(|(uuid, _)| *uuid == lease.uuid) {
            leases.remove(&lease.key);
        }
        Ok(())
    }
}
