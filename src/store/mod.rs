//! Local element storage: elements, eviction policies, tiers and the
//! tiered store that ties them together.

pub mod clock;
pub mod element;
mod evictor;
pub mod policy;
pub mod shard;
pub mod tier;
pub mod tiered;

pub use clock::{Clock, ManualClock, SystemClock};
pub use element::{
    CacheKey, DefaultElementValueComparator, Element, ElementValue, ElementValueComparator,
};
pub use policy::EvictionPolicyKind;
pub use tier::{TierCapacity, TierKind};
pub use tiered::{EvictionMode, LifespanDefaults, TieredStore, TieredStoreBuilder};
