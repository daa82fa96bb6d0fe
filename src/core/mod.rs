//! Policy compilation core
//!
//! The compilation pipeline, in layer order:
//!
//! - [`fragment`]: partial-rule combination algebra
//! - [`order`]: section descriptors and build-order resolution
//! - [`model`]: the polymorphic rule-object model
//! - [`builtin`]: built-in virtual rule groups (`%stateful`, `%icmp`)
//! - [`limit`]: connection/flow rate-limit strategies
//! - [`compiler`]: batch assembly into the final rule tree
//! - [`error`]: error types for policy compilation

pub mod builtin;
pub mod compiler;
pub mod error;
pub mod fragment;
pub mod limit;
pub mod model;
pub mod order;
