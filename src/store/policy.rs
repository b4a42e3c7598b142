//! Eviction Policies
//!
//! A tier over its bound draws a bounded sample of resident entries and asks
//! its policy for a victim. Policies only rank candidates; locking, removal
//! and demotion stay in the tiered store.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::element::{CacheKey, EvictionData};
use crate::error::{Error, Result};

/// Smallest eviction sample drawn from a tier
pub const MIN_SAMPLE_SIZE: usize = 15;

/// Largest eviction sample drawn from a tier
pub const MAX_SAMPLE_SIZE: usize = 512;

/// Sample size for a tier holding `population` evictable entries
///
/// Grows as `population / 64` between the bounds and never exceeds the
/// population itself.
pub fn sample_size(population: usize) -> usize {
    (population / 64)
        .clamp(MIN_SAMPLE_SIZE, MAX_SAMPLE_SIZE)
        .min(population)
}

/// Snapshot of the metadata a policy ranks on
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: CacheKey,
    pub eviction: EvictionData,
    pub hit_count: u64,
    /// Absolute expiry in millis, `u64::MAX` if never
    pub expiration_time: u64,
    pub pinned: bool,
}

impl Candidate {
    #[inline]
    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis > self.expiration_time
    }
}

/// Ranks eviction candidates
pub trait Policy: Send + Sync + fmt::Debug {
    /// Policy name as accepted by configuration
    fn name(&self) -> &'static str;

    /// `Less` when `a` should be evicted before `b`
    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering;

    /// Whether candidates arrive in hand order and are swept rather than scored
    fn sweeps(&self) -> bool {
        false
    }

    /// Index of the chosen victim within `candidates`
    fn select_victim(&self, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| self.compare(a, b))
            .map(|(idx, _)| idx)
    }
}

/// Least recently used
#[derive(Debug, Default, Clone, Copy)]
pub struct LruPolicy;

impl Policy for LruPolicy {
    fn name(&self) -> &'static str {
        "LRU"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.eviction.access_tick.cmp(&b.eviction.access_tick)
    }
}

/// Least frequently used, ties broken by oldest insertion
#[derive(Debug, Default, Clone, Copy)]
pub struct LfuPolicy;

impl Policy for LfuPolicy {
    fn name(&self) -> &'static str {
        "LFU"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.hit_count
            .cmp(&b.hit_count)
            .then(a.eviction.insert_tick.cmp(&b.eviction.insert_tick))
    }
}

/// First in, first out
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoPolicy;

impl Policy for FifoPolicy {
    fn name(&self) -> &'static str {
        "FIFO"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.eviction.insert_tick.cmp(&b.eviction.insert_tick)
    }
}

/// Second-chance clock
///
/// Candidates arrive in hand order. The first one with a clear reference bit
/// is the victim; the caller clears the bits of every candidate passed over.
/// When every bit is set the sweep wraps and the first candidate loses.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClockPolicy;

impl Policy for ClockPolicy {
    fn name(&self) -> &'static str {
        "CLOCK"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.eviction.referenced.cmp(&b.eviction.referenced)
    }

    fn sweeps(&self) -> bool {
        true
    }

    fn select_victim(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(
            candidates
                .iter()
                .position(|c| !c.eviction.referenced)
                .unwrap_or(0),
        )
    }
}

/// Closed set of eviction policies selectable by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionPolicyKind {
    #[default]
    Lru,
    Lfu,
    Fifo,
    Clock,
}

impl EvictionPolicyKind {
    /// Instantiate the policy
    pub fn build(self) -> Box<dyn Policy> {
        match self {
            EvictionPolicyKind::Lru => Box::new(LruPolicy),
            EvictionPolicyKind::Lfu => Box::new(LfuPolicy),
            EvictionPolicyKind::Fifo => Box::new(FifoPolicy),
            EvictionPolicyKind::Clock => Box::new(ClockPolicy),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvictionPolicyKind::Lru => "LRU",
            EvictionPolicyKind::Lfu => "LFU",
            EvictionPolicyKind::Fifo => "FIFO",
            EvictionPolicyKind::Clock => "CLOCK",
        }
    }
}

impl FromStr for EvictionPolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LRU" => Ok(EvictionPolicyKind::Lru),
            "LFU" => Ok(EvictionPolicyKind::Lfu),
            "FIFO" => Ok(EvictionPolicyKind::Fifo),
            "CLOCK" => Ok(EvictionPolicyKind::Clock),
            _ => Err(Error::UnknownEvictionPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for EvictionPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, insert: u64, access: u64, hits: u64, referenced: bool) -> Candidate {
        Candidate {
            key: CacheKey::new(key),
            eviction: EvictionData {
                insert_tick: insert,
                access_tick: access,
                referenced,
            },
            hit_count: hits,
            expiration_time: u64::MAX,
            pinned: false,
        }
    }

    #[test]
    fn test_sample_size_bounds() {
        assert_eq!(sample_size(0), 0);
        assert_eq!(sample_size(4), 4);
        assert_eq!(sample_size(100), 15);
        assert_eq!(sample_size(64 * 100), 100);
        assert_eq!(sample_size(10_000_000), MAX_SAMPLE_SIZE);
    }

    #[test]
    fn test_lru_picks_oldest_access() {
        let candidates = vec![
            candidate("a", 1, 9, 0, false),
            candidate("b", 2, 3, 0, false),
            candidate("c", 3, 7, 0, false),
        ];
        let idx = LruPolicy.select_victim(&candidates).unwrap();
        assert_eq!(candidates[idx].key.as_str(), "b");
    }

    #[test]
    fn test_lfu_tie_breaks_on_insert_order() {
        let candidates = vec![
            candidate("late", 5, 5, 1, false),
            candidate("early", 2, 8, 1, false),
            candidate("hot", 1, 1, 7, false),
        ];
        let idx = LfuPolicy.select_victim(&candidates).unwrap();
        assert_eq!(candidates[idx].key.as_str(), "early");
    }

    #[test]
    fn test_fifo_ignores_access() {
        let candidates = vec![
            candidate("a", 4, 1, 0, false),
            candidate("b", 2, 99, 50, true),
        ];
        let idx = FifoPolicy.select_victim(&candidates).unwrap();
        assert_eq!(candidates[idx].key.as_str(), "b");
    }

    #[test]
    fn test_clock_second_chance() {
        let candidates = vec![
            candidate("a", 1, 1, 0, true),
            candidate("b", 2, 2, 0, true),
            candidate("c", 3, 3, 0, false),
        ];
        assert_eq!(ClockPolicy.select_victim(&candidates), Some(2));

        let all_referenced = vec![candidate("a", 1, 1, 0, true), candidate("b", 2, 2, 0, true)];
        assert_eq!(ClockPolicy.select_victim(&all_referenced), Some(0));
        assert_eq!(ClockPolicy.select_victim(&[]), None);
    }

    #[test]
    fn test_policy_kind_from_name() {
        assert_eq!("lru".parse::<EvictionPolicyKind>().unwrap(), EvictionPolicyKind::Lru);
        assert_eq!(" Clock ".parse::<EvictionPolicyKind>().unwrap(), EvictionPolicyKind::Clock);
        assert!(matches!(
            "ARC".parse::<EvictionPolicyKind>(),
            Err(Error::UnknownEvictionPolicy(name)) if name == "ARC"
        ));
        assert_eq!(EvictionPolicyKind::Lfu.build().name(), "LFU");
    }
}
