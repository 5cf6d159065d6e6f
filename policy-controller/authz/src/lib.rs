//! Authorization decisions and access reviews over the RBAC rule index.
//!
//! Decisions are computed against a single immutable index snapshot. When the index cannot be
//! consulted, requests are denied with a reason that begins with [`UNAVAILABLE_PREFIX`] so that
//! callers can tell an infrastructure failure apart from a policy denial.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod authorizer;
mod review;

pub use self::{
    authorizer::{evaluate, Authorizer, Canceled, Decision, DENIED_BY_DEFAULT, UNAVAILABLE_PREFIX},
    review::{AccessReviews, ReviewConfig, ReviewError, ReviewRequest, ReviewResponse, ReviewSubject},
};
