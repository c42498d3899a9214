//! Lock-free, unbounded, multi-producer multi-consumer queues, generic over
//! which reclamation scheme ([`crate::schemes::Ebr`], [`crate::schemes::Hp`]
//! or [`crate::schemes::He`]) protects their nodes.

pub mod michael_scott;
pub mod ramalhete;

pub use michael_scott::MichaelScottQueue;
pub use ramalhete::RamalheteQueue;
