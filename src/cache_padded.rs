//! A small padding wrapper to keep hot atomics belonging to different
//! threads off the same cache line.

use core::ops::{Deref, DerefMut};

/// Pads and aligns `T` to the size of a typical cache line (64 bytes on
/// every architecture this crate targets).
#[derive(Debug, Default)]
#[repr(align(64))]
pub(crate) struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
