// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Read-Log-Update
//!
//! This crate implements the read-log-update (RLU) synchronization mechanism. Readers run
//! without locks or retries and always observe a consistent snapshot of the shared objects.
//! Writers lock objects, modify private copies in their per thread log and publish all copies
//! of a section at once, after every reader, that might still observe the old versions, has
//! left its section.
//!
//! Objects live in an arena owned by an [`Rlu`] domain and are addressed with [`ObjRef`]
//! handles. Every thread registers once with the domain and runs its sections through its
//! [`RluContext`].
//!
//! The [`list`] module provides two sorted integer sets built on top of the engine, the [`tree`]
//! module an ordered map with range queries.

mod arena;
pub mod breaker;
pub mod config;
mod context;
pub mod error;
pub mod guard;
pub mod list;
mod rlog;
pub mod rlu;
pub mod tree;
pub mod types;
pub mod var;

pub use breaker::BusyBreaker;
pub use config::{RluConfig, RluStrategy};
pub use context::RluContext;
pub use error::{Result, RluError};
pub use guard::SectionGuard;
pub use list::{CoarseList, ConcurrentSet, FineList, Key, Node};
pub use rlu::Rlu;
pub use tree::{BPlusTree, TreeNode};
pub use types::RluObject;
pub use var::{LockState, ObjRef, WriteSet};
