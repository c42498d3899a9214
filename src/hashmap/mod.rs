//! A fine-grained-locking hash map with lock-free reads, generic over which
//! reclamation scheme ([`crate::schemes::Ebr`], [`crate::schemes::Hp`] or
//! [`crate::schemes::He`]) protects its overflow chain.

pub mod vyukov;

pub use vyukov::VyukovHashMap;
