//! Policy store backends.
//!
//! [`MemoryStore`] is a revisioned, watchable store with the same optimistic-concurrency and watch
//! semantics as an etcd-backed API server. [`ValidatingStore`] wraps any [`PolicyStore`] so that
//! malformed records are rejected before they are written.
//!
//! [`PolicyStore`]: rbac_policy_core::PolicyStore

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admission;
mod memory;

pub use self::{
    admission::ValidatingStore,
    memory::{MemoryStore, MemoryStoreConfig},
};
