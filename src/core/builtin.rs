//! Built-in virtual rule groups
//!
//! Virtual sections contribute computed rules directly instead of morphing
//! user objects: `%stateful` establishes connection-tracking groundwork
//! (ESTABLISHED/RELATED admission, loopback, conntrack helper assignment)
//! and `%icmp` admits the control-plane ICMP traffic a reachable host
//! needs. Both run after every data section is loaded and before any user
//! filter rule.

use super::error::{ObjectRef, Result};
use super::fragment::{ChainDef, Family, Fragment, Table, combine};
use super::model::{Ctx, Production, service_frag};
use crate::policy::ServiceDef;

/// ICMPv4 types routed through to acceptance: destination-unreachable,
/// time-exceeded, parameter-problem.
const ICMP4_ACCEPT: [u8; 3] = [3, 11, 12];

/// ICMPv6 error types a forwarding host must pass: destination-unreachable,
/// packet-too-big, time-exceeded, parameter-problem.
const ICMP6_ACCEPT: [u8; 4] = [1, 2, 3, 4];

/// Shared acceptance chain for routed ICMP traffic.
pub const ICMP_CHAIN: &str = "icmp-routing";

/// `%stateful` rule group.
///
/// Per family: ESTABLISHED/RELATED acceptance on every filter chain,
/// loopback acceptance on the host chains, and a raw-table conntrack
/// helper assignment for each distinct helper-carrying service definition
/// any filter references.
pub fn stateful(ctx: &Ctx) -> Result<Production> {
    let mut rules = combine(&[
        Family::alternatives(),
        vec![Fragment::new().table(Table::Filter)],
        vec![
            Fragment::new().chain("INPUT"),
            Fragment::new().chain("FORWARD"),
            Fragment::new().chain("OUTPUT"),
        ],
        vec![
            Fragment::new()
                .matching("-m conntrack --ctstate ESTABLISHED,RELATED")
                .target("ACCEPT"),
        ],
    ]);

    rules.extend(combine(&[
        Family::alternatives(),
        vec![Fragment::new().table(Table::Filter)],
        vec![
            Fragment::new().chain("INPUT").matching("-i lo"),
            Fragment::new().chain("OUTPUT").matching("-o lo"),
        ],
        vec![Fragment::new().target("ACCEPT")],
    ]));

    rules.extend(helper_assignments(ctx)?);
    Ok(Production {
        rules,
        chains: Vec::new(),
    })
}

/// One raw-table CT helper assignment per distinct helper-carrying service
/// definition referenced by any filter, on both traffic legs.
fn helper_assignments(ctx: &Ctx) -> Result<Vec<Fragment>> {
    let origin = ObjectRef::named("builtin", "%stateful");

    // Two services may share a helper on different ports; dedup on the
    // definition, not the helper name
    let mut defs: Vec<&ServiceDef> = Vec::new();
    let service_names = ctx.policy.filter.iter().flat_map(|f| {
        f.service
            .as_slice()
            .iter()
            .chain(f.related.iter().flatten())
    });
    for name in service_names {
        let Some(service) = ctx.policy.service.get(name) else {
            // Unknown references fail at morph time with the right origin
            continue;
        };
        for def in service.as_slice() {
            if def.helper.is_some() && !defs.contains(&def) {
                defs.push(def);
            }
        }
    }

    let mut rules = Vec::new();
    for def in defs {
        let Some(helper) = &def.helper else { continue };
        rules.extend(combine(&[
            Family::alternatives(),
            vec![Fragment::new().table(Table::Raw)],
            vec![
                Fragment::new().chain("PREROUTING"),
                Fragment::new().chain("OUTPUT"),
            ],
            vec![service_frag(def, false, None, &origin)?],
            vec![Fragment::new().target(format!("CT --helper {helper}"))],
        ]));
    }
    Ok(rules)
}

/// `%icmp` rule group.
///
/// ICMPv6 to and from the host is accepted wholesale (neighbor discovery
/// breaks otherwise). Routed ICMPv6 and all ICMPv4 go through a shared
/// chain that accepts the error types end-to-end connectivity depends on
/// and falls through for everything else.
pub fn icmp() -> Production {
    let mut rules = combine(&[
        vec![
            Fragment::new()
                .family(Family::Inet6)
                .table(Table::Filter)
                .matching("-p icmpv6"),
        ],
        vec![
            Fragment::new().chain("INPUT"),
            Fragment::new().chain("OUTPUT"),
        ],
        vec![Fragment::new().target("ACCEPT")],
    ]);

    rules.extend(combine(&[
        vec![
            Fragment::new()
                .family(Family::Inet)
                .matching("-p icmp"),
            Fragment::new()
                .family(Family::Inet6)
                .matching("-p icmpv6"),
        ],
        vec![Fragment::new().table(Table::Filter)],
        vec![
            Fragment::new().chain("INPUT").family(Family::Inet),
            Fragment::new().chain("FORWARD"),
            Fragment::new().chain("OUTPUT").family(Family::Inet),
        ],
        vec![Fragment::new().target(ICMP_CHAIN)],
    ]));

    let mut chain_rules = Vec::new();
    for icmp_type in ICMP4_ACCEPT {
        chain_rules.push(
            Fragment::new()
                .family(Family::Inet)
                .matching(format!("-p icmp --icmp-type {icmp_type}"))
                .target("ACCEPT"),
        );
    }
    for icmp_type in ICMP6_ACCEPT {
        chain_rules.push(
            Fragment::new()
                .family(Family::Inet6)
                .matching(format!("-p icmpv6 --icmpv6-type {icmp_type}"))
                .target("ACCEPT"),
        );
    }

    Production {
        rules,
        chains: vec![ChainDef {
            table: Table::Filter,
            name: ICMP_CHAIN.to_string(),
            rules: chain_rules,
        }],
    }
}
