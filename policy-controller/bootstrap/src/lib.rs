//! Seeds the policy store with a default set of roles and bindings.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod command;
mod document;
mod seed;

pub use self::{
    command::{
        create_bootstrap_policy_file, overwrite_bootstrap_policy,
        CREATE_BOOTSTRAP_POLICY_FILE_COMMAND,
    },
    document::{PolicyDocument, DEFAULT_POLICY_YAML},
    seed::seed,
};
