//! Identity Propagation
//!
//! Turns the trusted identity headers set by the upstream gateway into a
//! [`RequestContext`](datascope_rls::RequestContext) bound for the lifetime
//! of one actix-web request.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod middleware;

pub use middleware::{identity_from_headers, HttpError, RequestScope};
