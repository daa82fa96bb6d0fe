//! Connection/flow rate limiting
//!
//! A limited rule replaces its plain action fragments with one of two
//! strategies:
//!
//! - **Stateful tracking** via the `recent` match, available while the
//!   count fits the tracker's practical per-entry cap ([`RECENT_MAX`]).
//!   Addresses are recorded under a binary netmask derived from the
//!   limit's per-family prefix lengths.
//! - **Fallback counting chain** otherwise: a dedicated auxiliary chain
//!   RETURNs while traffic stays under the effective per-second rate and
//!   drops (after optional logging) beyond it.
//!
//! Exceeding the stateful cap is an expected, handled downgrade, never an
//! error. Either strategy's output is then decorated with the rule's own
//! log/action fragments exactly as an unlimited rule would be.

use tracing::debug;

use super::fragment::{ChainDef, Family, Fragment, Table};
use crate::policy::{AddrSelector, LimitSpec};

/// Practical per-entry cap of the stateful tracking match.
pub const RECENT_MAX: u32 = 20;

/// What the limit measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LimitKind {
    /// New connections
    #[strum(serialize = "conn")]
    Conn,
    /// All packets of matching flows
    #[strum(serialize = "flow")]
    Flow,
}

/// Strategy chosen for a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Stateful,
    Fallback,
}

/// Validated limit attached to a filter rule
#[derive(Debug, Clone, PartialEq)]
pub struct Limit {
    pub kind: LimitKind,
    pub count: u32,
    pub interval: u32,
    pub name: Option<String>,
    pub addr: AddrSelector,
    pub mask_inet: u8,
    pub mask_inet6: u8,
    pub update: bool,
}

impl Limit {
    pub fn from_spec(spec: &LimitSpec, kind: LimitKind) -> Self {
        Self {
            kind,
            count: spec.count,
            interval: spec.interval.max(1),
            name: spec.name.clone(),
            addr: spec.addr,
            mask_inet: spec.mask.inet,
            mask_inet6: spec.mask.inet6,
            update: spec.update,
        }
    }

    /// Chooses between stateful tracking and the counting-chain fallback.
    pub fn strategy(&self) -> Strategy {
        if self.count <= RECENT_MAX {
            Strategy::Stateful
        } else {
            debug!(
                count = self.count,
                cap = RECENT_MAX,
                "limit exceeds stateful tracking cap, using counting chain"
            );
            Strategy::Fallback
        }
    }

    /// Canonical per-second rate for the fallback strategy.
    pub fn rate(&self) -> u32 {
        self.count.div_ceil(self.interval)
    }

    /// Tracker/chain name. Rules share one counter only when the limit is
    /// named AND opts into sharing via `update`; a name without `update`
    /// stays a label, suffixed per rule so each tracks independently.
    pub fn tracking_name(&self, hint: &str) -> String {
        match &self.name {
            Some(name) if self.update => name.clone(),
            Some(name) => format!("{name}-{hint}"),
            None => hint.to_string(),
        }
    }

    fn dir_flag(&self) -> &'static str {
        match self.addr {
            AddrSelector::Src => "--rsource",
            AddrSelector::Dest => "--rdest",
        }
    }

    fn mask(&self, family: Family) -> String {
        match family {
            Family::Inet => ipv4_mask(self.mask_inet),
            Family::Inet6 => ipv6_mask(self.mask_inet6),
        }
    }

    fn recent_match(&self, family: Family, name: &str, op: &str) -> Fragment {
        Fragment::new().family(family).matching(format!(
            "-m recent --name {name} {} --mask {} {op}",
            self.dir_flag(),
            self.mask(family)
        ))
    }

    /// Produces the fragment sequence and auxiliary chains replacing the
    /// rule's plain action fragments.
    ///
    /// `fail_log` is the logger fragment applied to over-limit traffic
    /// before it is dropped; `flow_target` is the rule's resolved jump
    /// target, consumed by the flow-limit accept path. When the returned
    /// decoration is not [`Decoration::terminal`], the caller appends the
    /// rule's own log/action fragments after the sequence exactly as an
    /// unlimited rule would.
    pub fn decorate(
        &self,
        hint: &str,
        fail_log: Option<&Fragment>,
        flow_target: Option<&str>,
    ) -> Decoration {
        let name = self.tracking_name(hint);
        match self.strategy() {
            Strategy::Stateful => self.stateful(&name, fail_log, flow_target),
            Strategy::Fallback => self.fallback(&name, fail_log),
        }
    }

    /// Record-and-test via the `recent` match.
    ///
    /// Update group: over-count entries are logged then dropped. Set group:
    /// unconditionally records the flow; the accept path for flow limits,
    /// target-less for connection limits (the rule's own action follows).
    fn stateful(
        &self,
        name: &str,
        fail_log: Option<&Fragment>,
        flow_target: Option<&str>,
    ) -> Decoration {
        let update = format!(
            "--update --seconds {} --hitcount {}",
            self.interval, self.count
        );
        let mut seq = Vec::new();
        for family in [Family::Inet, Family::Inet6] {
            if let Some(log) = fail_log {
                let mut frag = self.recent_match(family, name, &update);
                frag.matches.extend(log.matches.iter().cloned());
                frag.target = log.target.clone();
                seq.push(frag);
            }
            seq.push(self.recent_match(family, name, &update).target("DROP"));
        }
        for family in [Family::Inet, Family::Inet6] {
            let set = self.recent_match(family, name, "--set");
            seq.push(match self.kind {
                LimitKind::Flow => set.target(flow_target.unwrap_or("ACCEPT")),
                LimitKind::Conn => set,
            });
        }
        Decoration {
            sequence: seq,
            chains: Vec::new(),
            terminal: self.kind == LimitKind::Flow,
        }
    }

    /// Counting chain: RETURN while under the effective rate, log and drop
    /// beyond it. Flow-limited rules RETURN out of the chain so later rules
    /// still apply to the open flow; the surviving path then takes the
    /// rule's own action, appended by the caller.
    fn fallback(&self, name: &str, fail_log: Option<&Fragment>) -> Decoration {
        let mut chain_rules = vec![
            Fragment::new()
                .matching(format!(
                    "-m limit --limit {}/second --limit-burst {}",
                    self.rate(),
                    self.count
                ))
                .target("RETURN"),
        ];
        if let Some(log) = fail_log {
            chain_rules.push(log.clone());
        }
        chain_rules.push(Fragment::new().target("DROP"));

        Decoration {
            sequence: vec![Fragment::new().target(name)],
            chains: vec![ChainDef {
                table: Table::Filter,
                name: name.to_string(),
                rules: chain_rules,
            }],
            terminal: false,
        }
    }
}

/// Limit output spliced in place of the plain action fragments
#[derive(Debug, Clone)]
pub struct Decoration {
    /// Sequential rule fragments (one rule per element after combination)
    pub sequence: Vec<Fragment>,
    /// Auxiliary counting chains to materialize
    pub chains: Vec<ChainDef>,
    /// Whether the sequence already ends in the success disposition
    pub terminal: bool,
}

/// Derives the dotted-quad netmask for an IPv4 prefix length.
pub fn ipv4_mask(bits: u8) -> String {
    let octets: Vec<String> = (0..4)
        .map(|i| {
            let remaining = i32::from(bits) - i * 8;
            let octet: u16 = if remaining >= 8 {
                255
            } else if remaining <= 0 {
                0
            } else {
                (0xff_u16 << (8 - remaining)) & 0xff
            };
            octet.to_string()
        })
        .collect();
    octets.join(".")
}

/// Derives the colon-hex netmask for an IPv6 prefix length, abbreviating a
/// trailing all-zero run of two or more groups with `::`.
pub fn ipv6_mask(bits: u8) -> String {
    let bits = bits.min(128);
    let groups: Vec<u16> = (0..8)
        .map(|i| {
            let remaining = i32::from(bits) - i * 16;
            if remaining >= 16 {
                0xffff
            } else if remaining <= 0 {
                0
            } else {
                ((0xffff_u32 << (16 - remaining)) & 0xffff) as u16
            }
        })
        .collect();

    let zeros = groups.iter().rev().take_while(|g| **g == 0).count();
    if zeros >= 2 {
        let head: Vec<String> = groups[..8 - zeros]
            .iter()
            .map(|g| format!("{g:x}"))
            .collect();
        format!("{}::", head.join(":"))
    } else {
        groups
            .iter()
            .map(|g| format!("{g:x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MaskSpec;
    use proptest::prelude::*;

    use super::Strategy;

    fn spec(count: u32, interval: u32) -> LimitSpec {
        LimitSpec {
            count,
            interval,
            name: None,
            addr: AddrSelector::default(),
            mask: MaskSpec::default(),
            log: None,
            update: false,
        }
    }

    #[test]
    fn test_ipv4_masks() {
        assert_eq!(ipv4_mask(24), "255.255.255.0");
        assert_eq!(ipv4_mask(0), "0.0.0.0");
        assert_eq!(ipv4_mask(32), "255.255.255.255");
        assert_eq!(ipv4_mask(12), "255.240.0.0");
        assert_eq!(ipv4_mask(1), "128.0.0.0");
    }

    #[test]
    fn test_ipv6_masks() {
        assert_eq!(
            ipv6_mask(128),
            "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff"
        );
        assert_eq!(ipv6_mask(64), "ffff:ffff:ffff:ffff::");
        assert_eq!(ipv6_mask(0), "::");
        assert_eq!(ipv6_mask(60), "ffff:ffff:ffff:fff0::");
        // Single trailing zero group stays uncompressed
        assert_eq!(
            ipv6_mask(112),
            "ffff:ffff:ffff:ffff:ffff:ffff:ffff:0"
        );
    }

    #[test]
    fn test_strategy_selection() {
        let stateful = Limit::from_spec(&spec(10, 1), LimitKind::Conn);
        assert_eq!(stateful.strategy(), Strategy::Stateful);

        let fallback = Limit::from_spec(&spec(25, 1), LimitKind::Conn);
        assert_eq!(fallback.strategy(), Strategy::Fallback);

        let high = Limit::from_spec(&spec(150, 1), LimitKind::Flow);
        assert_eq!(high.strategy(), Strategy::Fallback);
        assert_eq!(high.rate(), 150);
    }

    #[test]
    fn test_rate_derivation() {
        assert_eq!(Limit::from_spec(&spec(150, 1), LimitKind::Flow).rate(), 150);
        assert_eq!(Limit::from_spec(&spec(120, 60), LimitKind::Flow).rate(), 2);
        assert_eq!(Limit::from_spec(&spec(90, 60), LimitKind::Flow).rate(), 2);
    }

    #[test]
    fn test_stateful_flow_sequence() {
        let limit = Limit::from_spec(&spec(3, 10), LimitKind::Flow);
        let deco = limit.decorate("limit-1", None, Some("ACCEPT"));
        assert!(deco.chains.is_empty());
        assert!(deco.terminal);
        // Per family: update-drop, then per family: set-accept
        assert_eq!(deco.sequence.len(), 4);
        assert_eq!(deco.sequence[0].target.as_deref(), Some("DROP"));
        assert!(
            deco.sequence[0].matches[0]
                .contains("--update --seconds 10 --hitcount 3")
        );
        assert!(deco.sequence[0].matches[0].contains("--mask 255.255.255.255"));
        assert_eq!(deco.sequence[2].target.as_deref(), Some("ACCEPT"));
        assert!(deco.sequence[2].matches[0].contains("--set"));
    }

    #[test]
    fn test_stateful_conn_sequence_leaves_action_to_caller() {
        let limit = Limit::from_spec(&spec(3, 10), LimitKind::Conn);
        let deco = limit.decorate("limit-1", None, Some("ACCEPT"));
        // update-drop x2, set (no target) x2; the rule appends its action
        assert_eq!(deco.sequence.len(), 4);
        assert_eq!(deco.sequence[2].target, None);
        assert!(!deco.terminal);
    }

    #[test]
    fn test_fallback_builds_counting_chain() {
        let limit = Limit::from_spec(&spec(150, 1), LimitKind::Conn);
        let deco = limit.decorate("limit-2", None, Some("ACCEPT"));
        assert_eq!(deco.chains.len(), 1);
        let chain = &deco.chains[0];
        assert_eq!(chain.name, "limit-2");
        assert_eq!(chain.rules[0].target.as_deref(), Some("RETURN"));
        assert!(chain.rules[0].matches[0].contains("--limit 150/second"));
        assert_eq!(chain.rules.last().unwrap().target.as_deref(), Some("DROP"));
        assert_eq!(deco.sequence.len(), 1);
        assert_eq!(deco.sequence[0].target.as_deref(), Some("limit-2"));
        assert!(!deco.terminal);
    }

    #[test]
    fn test_shared_counter_requires_update() {
        let mut s = spec(5, 1);
        s.name = Some("ssh-guard".into());
        s.update = true;
        let shared = Limit::from_spec(&s, LimitKind::Conn);
        assert_eq!(shared.tracking_name("limit-9"), "ssh-guard");

        s.update = false;
        let independent = Limit::from_spec(&s, LimitKind::Conn);
        assert_eq!(independent.tracking_name("limit-9"), "ssh-guard-limit-9");
    }

    #[test]
    fn test_dest_selector_uses_rdest() {
        let mut s = spec(5, 1);
        s.addr = AddrSelector::Dest;
        let limit = Limit::from_spec(&s, LimitKind::Conn);
        let deco = limit.decorate("x", None, None);
        assert!(deco.sequence[0].matches[0].contains("--rdest"));
    }

    proptest! {
        // IPv4 mask always has exactly `bits` leading ones
        #[test]
        fn test_ipv4_mask_bit_count(bits in 0u8..=32) {
            let mask = ipv4_mask(bits);
            let parsed: std::net::Ipv4Addr = mask.parse().unwrap();
            let value = u32::from(parsed);
            prop_assert_eq!(value.count_ones(), u32::from(bits));
            prop_assert_eq!(value.leading_ones(), u32::from(bits));
        }

        // IPv6 mask round-trips through the standard parser
        #[test]
        fn test_ipv6_mask_roundtrips(bits in 0u8..=128) {
            let mask = ipv6_mask(bits);
            let parsed: std::net::Ipv6Addr = mask.parse().unwrap();
            let value = u128::from(parsed);
            prop_assert_eq!(value.leading_ones(), u32::from(bits));
            prop_assert_eq!(value.count_ones(), u32::from(bits));
        }
    }
}
