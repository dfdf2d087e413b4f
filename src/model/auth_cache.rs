//! Authorization cache.
//!
//! Remembers the idTag verdicts the Central System handed out in Authorize
//! and StartTransaction responses. `LocalPreAuthorize` consults it to skip
//! the Authorize round-trip, and the offline decision path uses it to tell
//! known-good from known-bad tags.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::types::{AuthorizationStatus, IdTagInfo};
use tracing::debug;

#[derive(Debug, Clone)]
pub(crate) struct CachedAuth {
    pub status: AuthorizationStatus,
    pub parent_id_tag: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
}

impl CachedAuth {
    pub fn is_accepted(&self, now: DateTime<Utc>) -> bool {
        self.status == AuthorizationStatus::Accepted
            && self.expiry_date.map_or(true, |expiry| now < expiry)
    }
}

/// In-memory idTag → verdict map.
pub(crate) struct AuthorizationCache {
    enabled: bool,
    entries: HashMap<String, CachedAuth>,
}

impl AuthorizationCache {
    pub fn new() -> Self {
        Self {
            enabled: true,
            entries: HashMap::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.entries.clear();
        }
    }

    /// Record a verdict from an Authorize or StartTransaction response.
    pub fn update(&mut self, id_tag: &str, info: &IdTagInfo) {
        if !self.enabled {
            return;
        }
        debug!(id_tag, status = ?info.status, "Authorization cache updated");
        self.entries.insert(
            id_tag.to_string(),
            CachedAuth {
                status: info.status.clone(),
                parent_id_tag: info.parent_id_tag.clone(),
                expiry_date: info.expiry_date,
            },
        );
    }

    pub fn lookup(&self, id_tag: &str) -> Option<&CachedAuth> {
        self.entries.get(id_tag)
    }

    /// Cache hit with a still-valid Accepted verdict.
    pub fn accepted(&self, id_tag: &str, now: DateTime<Utc>) -> Option<&CachedAuth> {
        self.entries
            .get(id_tag)
            .filter(|entry| entry.is_accepted(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn info(status: AuthorizationStatus) -> IdTagInfo {
        IdTagInfo {
            status,
            expiry_date: None,
            parent_id_tag: None,
        }
    }

    #[test]
    fn accepted_hit_and_blocked_miss() {
        let mut cache = AuthorizationCache::new();
        let now = Utc::now();
        cache.update("GOOD", &info(AuthorizationStatus::Accepted));
        cache.update("BAD", &info(AuthorizationStatus::Blocked));

        assert!(cache.accepted("GOOD", now).is_some());
        assert!(cache.accepted("BAD", now).is_none());
        assert!(cache.lookup("BAD").is_some());
        assert!(cache.lookup("UNSEEN").is_none());
    }

    #[test]
    fn expired_entries_do_not_pre_authorize() {
        let mut cache = AuthorizationCache::new();
        let now = Utc::now();
        let mut expired = info(AuthorizationStatus::Accepted);
        expired.expiry_date = Some(now - Duration::minutes(1));
        cache.update("OLD", &expired);
        assert!(cache.accepted("OLD", now).is_none());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let mut cache = AuthorizationCache::new();
        cache.set_enabled(false);
        cache.update("TAG", &info(AuthorizationStatus::Accepted));
        assert!(cache.lookup("TAG").is_none());
    }
}
