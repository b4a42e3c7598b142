//! Cache Events
//!
//! Immutable records of element lifecycle changes, delivered to listeners
//! after the change is visible to readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::TierKind;

/// Element lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// A key was written that was absent
    Put {
        cache: String,
        key: String,
        version: u64,
        timestamp: DateTime<Utc>,
    },

    /// A resident key was overwritten
    Updated {
        cache: String,
        key: String,
        old_version: u64,
        new_version: u64,
        timestamp: DateTime<Utc>,
    },

    /// A key was removed by a caller
    Removed {
        cache: String,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A key was found or swept past its TTL/TTI
    Expired {
        cache: String,
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A key was dropped from the slowest tier to honor its capacity
    Evicted {
        cache: String,
        key: String,
        tier: TierKind,
        timestamp: DateTime<Utc>,
    },

    /// Every key of the cache was removed
    RemoveAll {
        cache: String,
        removed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    pub fn put(cache: &str, key: &str, version: u64) -> Self {
        CacheEvent::Put {
            cache: cache.to_string(),
            key: key.to_string(),
            version,
            timestamp: Utc::now(),
        }
    }

    pub fn updated(cache: &str, key: &str, old_version: u64, new_version: u64) -> Self {
        CacheEvent::Updated {
            cache: cache.to_string(),
            key: key.to_string(),
            old_version,
            new_version,
            timestamp: Utc::now(),
        }
    }

    pub fn removed(cache: &str, key: &str) -> Self {
        CacheEvent::Removed {
            cache: cache.to_string(),
            key: key.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn expired(cache: &str, key: &str) -> Self {
        CacheEvent::Expired {
            cache: cache.to_string(),
            key: key.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn evicted(cache: &str, key: &str, tier: TierKind) -> Self {
        CacheEvent::Evicted {
            cache: cache.to_string(),
            key: key.to_string(),
            tier,
            timestamp: Utc::now(),
        }
    }

    pub fn remove_all(cache: &str, removed: usize) -> Self {
        CacheEvent::RemoveAll {
            cache: cache.to_string(),
            removed,
            timestamp: Utc::now(),
        }
    }

    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Put { .. } => "Put",
            CacheEvent::Updated { .. } => "Updated",
            CacheEvent::Removed { .. } => "Removed",
            CacheEvent::Expired { .. } => "Expired",
            CacheEvent::Evicted { .. } => "Evicted",
            CacheEvent::RemoveAll { .. } => "RemoveAll",
        }
    }

    pub fn cache(&self) -> &str {
        match self {
            CacheEvent::Put { cache, .. }
            | CacheEvent::Updated { cache, .. }
            | CacheEvent::Removed { cache, .. }
            | CacheEvent::Expired { cache, .. }
            | CacheEvent::Evicted { cache, .. }
            | CacheEvent::RemoveAll { cache, .. } => cache,
        }
    }

    /// Affected key, if the event concerns a single key
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Put { key, .. }
            | CacheEvent::Updated { key, .. }
            | CacheEvent::Removed { key, .. }
            | CacheEvent::Expired { key, .. }
            | CacheEvent::Evicted { key, .. } => Some(key),
            CacheEvent::RemoveAll { .. } => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CacheEvent::Put { timestamp, .. }
            | CacheEvent::Updated { timestamp, .. }
            | CacheEvent::Removed { timestamp, .. }
            | CacheEvent::Expired { timestamp, .. }
            | CacheEvent::Evicted { timestamp, .. }
            | CacheEvent::RemoveAll { timestamp, .. } => *timestamp,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
