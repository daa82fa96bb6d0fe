//! Address-name resolution
//!
//! Name resolution is an injected capability: the compiler core never does
//! network I/O itself. CIDR and host literals resolve intrinsically;
//! anything else is looked up through the [`AddressResolver`] the caller
//! supplies. [`StaticResolver`] backs names with a fixed map and is the
//! default for the CLI (and for tests).

use ipnetwork::IpNetwork;
use std::collections::BTreeMap;

use crate::core::error::{Error, ObjectRef, Result};
use crate::core::fragment::Family;
use crate::policy::family_of;

/// Resolves an address name into (family, network) pairs.
///
/// `origin` identifies the requesting object for error attribution.
pub trait AddressResolver {
    fn resolve(&self, name: &str, origin: &ObjectRef) -> Result<Vec<(Family, IpNetwork)>>;
}

/// Parses `name` as an address or CIDR literal, if it is one.
pub fn parse_literal(name: &str) -> Option<(Family, IpNetwork)> {
    let net: IpNetwork = name.parse().ok()?;
    Some((family_of(&net), net))
}

/// Map-backed resolver; literals resolve without an entry.
#[derive(Debug, Default)]
pub struct StaticResolver {
    names: BTreeMap<String, Vec<IpNetwork>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: impl Into<String>, nets: Vec<IpNetwork>) {
        self.names.insert(name.into(), nets);
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, name: &str, origin: &ObjectRef) -> Result<Vec<(Family, IpNetwork)>> {
        if let Some(literal) = parse_literal(name) {
            return Ok(vec![literal]);
        }
        match self.names.get(name) {
            Some(nets) => Ok(nets.iter().map(|n| (family_of(n), *n)).collect()),
            None => Err(Error::config(
                origin,
                format!("unable to resolve address '{name}'"),
            )),
        }
    }
}
