// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::var::ObjRef;
use thiserror::Error as DeriveError;

/// Global return type
pub type Result<T> = core::result::Result<T, RluError>;

#[derive(Debug, DeriveError, PartialEq, Eq, Clone)]
pub enum RluError {
    /// The object is locked by another section. This is a contention outcome,
    /// the calling section must abort and retry.
    #[error("Object {0} is locked by another section")]
    Locked(ObjRef),

    #[error("Write log exhausted: a section may lock at most {0} objects")]
    LogExhausted(usize),

    #[error("Free list exhausted: a section may retire at most {0} objects")]
    FreeListExhausted(usize),

    #[error("Thread registry exhausted: at most {0} threads can be registered")]
    RegistryExhausted(usize),

    #[error("Object arena exhausted")]
    ArenaExhausted,

    #[error("Object {0} does not reference a live object")]
    InvalidObject(ObjRef),

    #[error("Object {0} is not a copy owned by the current section")]
    NotOwned(ObjRef),

    #[error("Busy breaker tripped after {0} wait units")]
    BreakerTripped(usize),

    #[error("Invalid configuration ({0})")]
    Config(String),
}

impl RluError {
    /// Returns `true`, if the error is a lock conflict that is resolved by
    /// aborting and retrying the section.
    pub fn is_contention(&self) -> bool {
        matches!(self, RluError::Locked(_))
    }
}
