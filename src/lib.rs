//! Lock-free concurrent data structures and the safe memory reclamation
//! schemes that back them.
//!
//! Three interchangeable reclamation schemes live under [`schemes`]: epoch
//! based reclamation ([`schemes::Ebr`]), hazard pointers ([`schemes::Hp`])
//! and hazard eras ([`schemes::He`]). Every container in this crate
//! ([`queue::MichaelScottQueue`], [`queue::RamalheteQueue`],
//! [`hashmap::VyukovHashMap`]) is generic over which one protects it,
//! through the [`reclaim::Scheme`]/[`reclaim::Guard`] contract.

mod cache_padded;
mod config;
mod marked_ptr;
mod reclaim;
mod registry;

pub mod hashmap;
pub mod queue;
pub mod schemes;

pub use crate::config::{AbandonStrategy, Config, ConfigBuilder, RegionExtension, ScanStrategy};
pub use crate::hashmap::VyukovHashMap;
pub use crate::marked_ptr::{Atomic, MarkedPtr};
pub use crate::queue::{MichaelScottQueue, RamalheteQueue};
pub use crate::reclaim::{Guard, NotEqual, Reclaimable, Scheme};
pub use crate::schemes::{Ebr, He, Hp};
