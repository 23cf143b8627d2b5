//! `loomerp-api` — HTTP edge of the event backbone.
//!
//! One middleware stack for every service: identity extraction, the
//! permission gate at handler boundaries, and the audit ledger writer over
//! all mutating requests.

pub mod app;
pub mod authz;
pub mod middleware;
