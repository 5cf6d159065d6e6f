//! RBAC rule index
//!
//! The index consumes the policy store's watches for roles and role bindings and resolves each
//! binding against the role it references. Resolved grants are bucketed by scope (cluster-wide or
//! per namespace) and indexed by subject:
//!
//! ```text
//! [ RoleBinding ] -> [ Role ]
//!        |
//!        v
//! [ Bucket (cluster | namespace) ] -> [ Subject ] -> [ Grant ]
//! ```
//!
//! Every change is published as a new immutable [`Snapshot`]. Readers clone the current snapshot
//! and evaluate against it without holding any lock, so they never block the watch tasks and never
//! observe a partially applied update. Buckets that an update does not touch are shared between
//! successive snapshots.
//!
//! A binding whose role cannot be found is kept as an unresolved entry and grants nothing until the
//! role appears.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
pub mod metrics;
pub mod resolver;
mod snapshot;
mod watch;


pub use self::{
    index::{Index, SharedIndex},
    metrics::IndexMetrics,
    resolver::{Resolution, ResolvedBinding},
    snapshot::{Bucket, Closed, Grant, Reader, Snapshot},
    watch::{spawn_watches, IndexConfig, Watcher},
};
