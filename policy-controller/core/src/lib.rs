//! Policy model shared by the RBAC policy controller.
//!
//! Roles group [`PolicyRule`]s; role bindings grant a role's rules to a set of [`Subject`]s, either
//! cluster-wide or within a single namespace. Both are stored as independently versioned records
//! behind the [`PolicyStore`] contract.
//!
//! ```text
//! [ Subject ] <- [ RoleBinding ] -> [ Role ] -> [ PolicyRule ]
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod role;
pub mod rule;
pub mod store;
mod subject;
pub mod validation;

pub use self::{
    role::{Kind, Object, ObjectKey, Record, Role, RoleBinding, RoleRef},
    rule::{Attributes, PolicyRule, WILDCARD},
    store::{EventType, List, PolicyStore, StoreError, WatchEvent, WatchStream},
    subject::{Subject, UserInfo, SERVICE_ACCOUNT_USER_PREFIX},
    validation::{FieldError, ValidationError},
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// The group every authenticated user belongs to.
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// The group granted full control of the cluster by the default policy.
pub const CLUSTER_ADMIN_GROUP: &str = "system:cluster-admins";
