//! Rampart - declarative firewall policy compiler
//!
//! Compiles a declarative policy (zones, services, filter rules, rate
//! limits, NAT) into concrete packet-filter rule sets: per family/table/
//! chain rule tuples with iptables-style match and target text, plus the
//! address-set definitions the rules reference.
//!
//! # Architecture
//!
//! - [`core`] - Compilation pipeline: fragment algebra, section ordering,
//!   rule object model, rate limiting, assembly
//! - [`policy`] - Typed declarative policy document (serde)
//! - [`resolve`] - Injected address-name resolution
//!
//! # Compilation model
//!
//! - Partial rules combine through an ordered cross product; conflicting
//!   combinations shrink away instead of erroring
//! - Section build order resolved once per batch, deterministically
//! - All-or-nothing: the first configuration error aborts the batch

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod core;
pub mod policy;
pub mod resolve;

// Re-export commonly used types
pub use core::compiler::{Compiled, Compiler, RuleTree};
pub use core::error::{Error, ObjectRef, Result};
pub use core::fragment::{Family, Fragment, Location, Table, Trule, combine};
pub use policy::Policy;
pub use resolve::{AddressResolver, StaticResolver};
