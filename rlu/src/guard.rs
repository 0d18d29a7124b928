// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # RLU Guard Types
//!
//! The [`SectionGuard`] follows the RAII pattern. Creating the guard enters a section, dropping
//! it leaves the section again. Leaving a section commits all objects locked inside of it. If
//! the guard is dropped while unwinding, the section is aborted instead, so no half finished
//! writes are ever committed.

use crate::{RluContext, RluObject};
use std::ops::{Deref, DerefMut};

pub struct SectionGuard<'a, T>
where
    T: RluObject,
{
    context: &'a mut RluContext<T>,
}

impl<'a, T> SectionGuard<'a, T>
where
    T: RluObject,
{
    pub(crate) fn new(context: &'a mut RluContext<T>) -> Self {
        context.read_lock();
        Self { context }
    }
}

impl<'a, T> Deref for SectionGuard<'a, T>
where
    T: RluObject,
{
    type Target = RluContext<T>;

    fn deref(&self) -> &Self::Target {
        self.context
    }
}

impl<'a, T> DerefMut for SectionGuard<'a, T>
where
    T: RluObject,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context
    }
}

impl<'a, T> Drop for SectionGuard<'a, T>
where
    T: RluObject,
{
    fn drop(&mut self) {
        // the section may have been aborted through the guard already
        if !self.context.in_section() {
            return;
        }

        if std::thread::panicking() {
            self.context.abort();
        } else {
            self.context.read_unlock();
        }
    }
}
