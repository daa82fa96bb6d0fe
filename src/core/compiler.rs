//! Configuration assembly
//!
//! The compiler owns the whole batch: it resolves the section build order
//! once, morphs each object section's declarations, collects the produced
//! translation rules (object sections and built-in virtual groups alike) in
//! that order, and inserts them into the rule tree. Auxiliary chains —
//! user-defined custom chains and limit counting chains — are materialized
//! at most once per location, however many rules jump to them.
//!
//! Compilation is all-or-nothing: the first configuration error aborts the
//! batch and nothing partial escapes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use tracing::debug;

use super::builtin;
use super::error::{ObjectRef, Result};
use super::fragment::{Family, Location, Position, RuleSpec, Table, Trule};
use super::model::{Ctx, Production, morph_filter, morph_policy};
use super::order::{READY, Section, SectionSet};
use crate::policy::Policy;
use crate::resolve::AddressResolver;

/// Address-set definition passed through to the compiled artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct IpsetDef {
    pub name: String,
    pub set_type: String,
    pub family: Option<Family>,
}

#[derive(Debug, Default)]
struct ChainRules {
    front: Vec<RuleSpec>,
    back: Vec<RuleSpec>,
}

impl ChainRules {
    fn iter(&self) -> impl Iterator<Item = &RuleSpec> {
        self.front.iter().chain(self.back.iter())
    }
}

/// The compiled rule set: family → table → chain → ordered rules.
///
/// Prepended rules sit at the chain front in production order, appended
/// rules at the back, so prepending never reverses among itself.
#[derive(Debug, Default)]
pub struct RuleTree {
    families: BTreeMap<Family, BTreeMap<Table, BTreeMap<String, ChainRules>>>,
}

impl RuleTree {
    fn insert(&mut self, trule: Trule) {
        let chain = self
            .families
            .entry(trule.location.family)
            .or_default()
            .entry(trule.location.table)
            .or_default()
            .entry(trule.location.chain)
            .or_default();
        match trule.spec.position {
            Position::Prepend => chain.front.push(trule.spec),
            Position::Append => chain.back.push(trule.spec),
        }
    }

    /// The ordered rules of one chain, if it exists.
    pub fn chain(&self, location: &Location) -> Option<Vec<&RuleSpec>> {
        self.families
            .get(&location.family)?
            .get(&location.table)?
            .get(&location.chain)
            .map(|c| c.iter().collect())
    }

    /// Total rule count across all locations.
    pub fn len(&self) -> usize {
        self.families
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(BTreeMap::values)
            .map(|c| c.front.len() + c.back.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only compilation output.
#[derive(Debug)]
pub struct Compiled {
    pub rules: RuleTree,
    pub ipsets: Vec<IpsetDef>,
    /// Chains this compilation created, as opposed to the kernel's own
    aux_chains: BTreeSet<Location>,
}

impl Compiled {
    /// Renders the rule tree as an iptables-restore-style dump, one block
    /// of tables per family.
    pub fn to_restore_text(&self) -> String {
        let mut out = String::new();
        for (family, tables) in &self.rules.families {
            let _ = writeln!(out, "# {family}");
            for (table, chains) in tables {
                let _ = writeln!(out, "*{table}");
                for name in chains.keys() {
                    let location = Location {
                        family: *family,
                        table: *table,
                        chain: name.clone(),
                    };
                    if self.aux_chains.contains(&location) {
                        let _ = writeln!(out, ":{name} -");
                    } else {
                        let _ = writeln!(out, ":{name} ACCEPT");
                    }
                }
                for (name, chain) in chains {
                    for spec in chain.iter() {
                        let _ = writeln!(out, "-A {name} {spec}");
                    }
                }
                let _ = writeln!(out, "COMMIT");
            }
        }
        out
    }
}

/// Batch policy compiler.
pub struct Compiler<'a> {
    ctx: Ctx<'a>,
    sections: SectionSet,
}

impl<'a> Compiler<'a> {
    pub fn new(policy: &'a Policy, resolver: &'a dyn AddressResolver) -> Self {
        let mut sections = SectionSet::new();
        // Data sections load before the barrier, rule producers after;
        // policy defaults always land last in their chains.
        for section in [
            Section::object("zone").before(&[READY]),
            Section::object("service").before(&[READY]),
            Section::object("log").before(&[READY]),
            Section::object("custom").before(&[READY]),
            Section::object("ipset").before(&[READY]),
            Section::virtual_("%stateful").after(&[READY]),
            Section::virtual_("%icmp").after(&["%stateful"]),
            Section::object("filter").after(&["%icmp"]),
            Section::object("policy").after(&["filter"]),
        ] {
            sections.register(section);
        }
        Self {
            ctx: Ctx { policy, resolver },
            sections,
        }
    }

    /// Compiles the whole policy into a rule tree.
    pub fn compile(&self) -> Result<Compiled> {
        let order = self.sections.order()?;
        let mut tree = RuleTree::default();
        let mut aux_chains = BTreeSet::new();

        for name in order {
            for (origin, production) in self.produce(name)? {
                apply(&origin, production, &mut tree, &mut aux_chains)?;
            }
            debug!(section = name, rules = tree.len(), "section applied");
        }

        let ipsets = self
            .ctx
            .policy
            .ipset
            .iter()
            .map(|(name, spec)| IpsetDef {
                name: name.clone(),
                set_type: spec.set_type.clone(),
                family: spec.family,
            })
            .collect();

        Ok(Compiled {
            rules: tree,
            ipsets,
            aux_chains,
        })
    }

    /// Rule productions of one section, in object order.
    fn produce(&self, section: &str) -> Result<Vec<(ObjectRef, Production)>> {
        match section {
            "%stateful" => Ok(vec![(
                ObjectRef::named("builtin", "%stateful"),
                builtin::stateful(&self.ctx)?,
            )]),
            "%icmp" => Ok(vec![(
                ObjectRef::named("builtin", "%icmp"),
                builtin::icmp(),
            )]),
            "filter" => self
                .ctx
                .policy
                .filter
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    let rule = morph_filter(&self.ctx, i, spec)?;
                    let production = rule.trules(&self.ctx)?;
                    Ok((rule.origin().clone(), production))
                })
                .collect(),
            "policy" => self
                .ctx
                .policy
                .policy
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    let rule = morph_policy(&self.ctx, i, spec)?;
                    let production = rule.trules(&self.ctx)?;
                    Ok((rule.origin().clone(), production))
                })
                .collect(),
            // Pure data sections contribute no rules of their own
            _ => Ok(Vec::new()),
        }
    }
}

/// Inserts one production into the tree, materializing its auxiliary
/// chains once per location.
fn apply(
    origin: &ObjectRef,
    production: Production,
    tree: &mut RuleTree,
    aux_chains: &mut BTreeSet<Location>,
) -> Result<()> {
    let trules: Vec<Trule> = production
        .rules
        .into_iter()
        .map(|frag| frag.into_trule(origin))
        .collect::<Result<_>>()?;

    for def in production.chains {
        // A chain exists wherever a rule of this production jumps to it
        let families: BTreeSet<Family> = trules
            .iter()
            .filter(|t| {
                t.location.table == def.table && t.spec.target.as_deref() == Some(&def.name)
            })
            .map(|t| t.location.family)
            .collect();
        for family in families {
            let location = Location {
                family,
                table: def.table,
                chain: def.name.clone(),
            };
            if !aux_chains.insert(location.clone()) {
                continue;
            }
            for frag in &def.rules {
                if frag.family.is_some_and(|f| f != family) {
                    continue;
                }
                tree.insert(Trule {
                    location: location.clone(),
                    spec: frag.command(),
                });
            }
        }
    }

    for trule in trules {
        tree.insert(trule);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::StaticResolver;

    fn compile(json: &str) -> Compiled {
        let policy = Policy::from_json(json).unwrap();
        let resolver = StaticResolver::new();
        Compiler::new(&policy, &resolver).compile().unwrap()
    }

    fn input(family: Family) -> Location {
        Location {
            family,
            table: Table::Filter,
            chain: "INPUT".into(),
        }
    }

    #[test]
    fn test_empty_policy_still_produces_groundwork() {
        let out = compile("{}");
        let rules = out.rules.chain(&input(Family::Inet)).unwrap();
        assert!(
            rules[0]
                .match_text
                .contains("--ctstate ESTABLISHED,RELATED")
        );
        // icmp routing chain materialized for both families
        assert!(out.rules.chain(&Location {
            family: Family::Inet,
            table: Table::Filter,
            chain: builtin::ICMP_CHAIN.into(),
        }).is_some());
    }

    #[test]
    fn test_filter_rules_follow_groundwork_and_policy_comes_last() {
        let out = compile(
            r#"{
                "zone": { "ext": { "iface": "eth0" } },
                "service": { "ssh": { "proto": "tcp", "port": 22 } },
                "filter": [ { "in": "ext", "service": "ssh" } ],
                "policy": [ { "in": "ext", "action": "drop", "log": false } ]
            }"#,
        );
        let rules = out.rules.chain(&input(Family::Inet)).unwrap();
        let pos = |needle: &str| {
            rules
                .iter()
                .position(|r| r.to_string().contains(needle))
                .unwrap_or_else(|| panic!("no rule matching {needle}"))
        };
        assert!(pos("ESTABLISHED,RELATED") < pos("--dport 22"));
        assert!(pos("--dport 22") < pos("-i eth0 -j DROP"));
        assert_eq!(rules.last().unwrap().to_string(), "-i eth0 -j DROP");
    }

    #[test]
    fn test_flow_limited_rule_precedes_groundwork() {
        let out = compile(
            r#"{
                "zone": { "ext": { "iface": "eth0" } },
                "service": { "ssh": { "proto": "tcp", "port": 22 } },
                "filter": [ { "in": "ext", "service": "ssh", "flow-limit": 5 } ]
            }"#,
        );
        let rules = out.rules.chain(&input(Family::Inet)).unwrap();
        assert!(rules[0].match_text.contains("-m recent"));
    }

    #[test]
    fn test_custom_chain_materialized_once_per_location() {
        let out = compile(
            r#"{
                "zone": { "ext": { "iface": "eth0" } },
                "service": {
                    "ssh": { "proto": "tcp", "port": 22 },
                    "dns": { "proto": "udp", "port": 53 }
                },
                "custom": { "scrub": [ { "match": "-f", "target": "DROP" } ] },
                "filter": [
                    { "in": "ext", "service": "ssh", "action": "custom:scrub" },
                    { "in": "ext", "service": "dns", "action": "custom:scrub" }
                ]
            }"#,
        );
        let scrub = Location {
            family: Family::Inet,
            table: Table::Filter,
            chain: "scrub".into(),
        };
        let rules = out.rules.chain(&scrub).unwrap();
        // Two referencing filters, one materialization
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].to_string(), "-f -j DROP");
    }

    #[test]
    fn test_configuration_error_aborts_compilation() {
        let policy =
            Policy::from_json(r#"{ "filter": [ { "in": "nowhere" } ] }"#).unwrap();
        let resolver = StaticResolver::new();
        let err = Compiler::new(&policy, &resolver).compile().unwrap_err();
        assert!(err.to_string().contains("unknown zone 'nowhere'"));
    }

    #[test]
    fn test_ipsets_pass_through() {
        let out = compile(
            r#"{ "ipset": { "blocked": { "type": "hash:ip", "family": "inet" } } }"#,
        );
        assert_eq!(out.ipsets.len(), 1);
        assert_eq!(out.ipsets[0].name, "blocked");
        assert_eq!(out.ipsets[0].set_type, "hash:ip");
        assert_eq!(out.ipsets[0].family, Some(Family::Inet));
    }

    #[test]
    fn test_restore_text_declares_aux_chains() {
        let out = compile(
            r#"{
                "zone": { "ext": { "iface": "eth0" } },
                "service": { "ssh": { "proto": "tcp", "port": 22 } },
                "custom": { "scrub": [ { "target": "DROP" } ] },
                "filter": [ { "in": "ext", "service": "ssh", "action": "custom:scrub" } ]
            }"#,
        );
        let text = out.to_restore_text();
        assert!(text.contains("# inet\n"));
        assert!(text.contains("*filter\n"));
        assert!(text.contains(":scrub -\n"));
        assert!(text.contains(":INPUT ACCEPT\n"));
        assert!(text.contains("-A scrub -j DROP\n"));
        assert!(text.ends_with("COMMIT\n"));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let json = r#"{
            "zone": { "ext": { "iface": "eth0" }, "lan": { "iface": "eth1" } },
            "service": { "ssh": { "proto": "tcp", "port": 22 } },
            "filter": [
                { "in": "ext", "service": "ssh", "action": "drop" },
                { "in": "lan", "out": "ext", "service": "ssh" }
            ]
        }"#;
        assert_eq!(compile(json).to_restore_text(), compile(json).to_restore_text());
    }
}
