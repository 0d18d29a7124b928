// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! RLU Traits
//!
//! A type takes part in read-log-update by implementing [`RluObject`]. The engine owns the object
//! header (lock word and write set), so an implementor only describes how the data of a private
//! copy is produced and how the mutated fields of a copy are published back into the original.

/// Data of an object managed by [`crate::Rlu`].
pub trait RluObject: Send + Sync + 'static {
    /// Returns the data of a fresh private copy of `self`.
    ///
    /// The engine stamps the copy with the owning thread, its run counter and a reference back to
    /// the original, before the copy becomes visible to any other thread.
    fn clone_for_write(&self) -> Self;

    /// Copies the mutated fields of `self`, a copy, into `original`.
    ///
    /// This is called during writeback, after the grace period of the committing section has
    /// elapsed. The engine releases the lock of the original afterwards.
    fn publish_back(&self, original: &mut Self);
}

macro_rules! impl_rlu_object {
    ($($ty:ty),*) => {
        $(
            impl RluObject for $ty {
                fn clone_for_write(&self) -> Self {
                    self.clone()
                }

                fn publish_back(&self, original: &mut Self) {
                    original.clone_from(self);
                }
            }
        )*
    };
}

impl_rlu_object!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, bool, String);

impl<T> RluObject for Vec<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone_for_write(&self) -> Self {
        self.clone()
    }

    fn publish_back(&self, original: &mut Self) {
        original.clone_from(self);
    }
}
