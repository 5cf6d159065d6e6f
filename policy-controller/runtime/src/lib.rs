#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use rbac_policy_authz as authz;
pub use rbac_policy_bootstrap as bootstrap;
pub use rbac_policy_core as core;
pub use rbac_policy_index as index;
pub use rbac_policy_store as store;

pub mod admin;
mod args;
mod log;

pub use self::{
    admin::Admin,
    args::Args,
    log::{init as init_log, LogFormat},
};
