//! Rule-fragment combination algebra
//!
//! Every rule-producing component describes its output as *fragments*:
//! partial rule specifications over {family, table, chain, match, target,
//! position}. [`combine`] expands lists of mutually exclusive alternatives
//! (e.g. "inet" vs "inet6", "INPUT" vs "FORWARD") into the ordered cross
//! product of concrete rules, merging attributes as it goes. This module is
//! the single owner of cross-product ordering and merge-conflict semantics.
//!
//! # Merge rules
//!
//! - `match` tokens are cumulative: concatenated left to right.
//! - Every other attribute must agree. If both sides define unequal values,
//!   that combination is silently dropped from the cross product. Callers
//!   rely on the shrinkage: combining a family-unconstrained fragment list
//!   against an `inet`-restricted one makes the `inet6` half vanish.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{Error, ObjectRef, Result};

/// Address family of a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Family {
    /// IPv4
    #[serde(rename = "inet")]
    #[strum(serialize = "inet")]
    Inet,
    /// IPv6
    #[serde(rename = "inet6")]
    #[strum(serialize = "inet6")]
    Inet6,
}

impl Family {
    /// One unconstrained fragment per family, in `inet`, `inet6` order.
    ///
    /// The conventional leftmost input to [`combine`]: restricting
    /// fragments further right shrink the product to the families they
    /// support.
    pub fn alternatives() -> Vec<Fragment> {
        vec![
            Fragment::new().family(Family::Inet),
            Fragment::new().family(Family::Inet6),
        ]
    }
}

/// Packet-filter table a rule lives in
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum Table {
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "mangle")]
    Mangle,
    #[strum(serialize = "raw")]
    Raw,
}

/// Where a rule is inserted within its chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Position {
    #[default]
    #[strum(serialize = "append")]
    Append,
    #[strum(serialize = "prepend")]
    Prepend,
}

/// Partial rule specification.
///
/// Absence of an attribute means "unconstrained / inherited from context",
/// not "empty". The match accumulator is an ordered token list, joined to
/// text only at final command projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub family: Option<Family>,
    pub table: Option<Table>,
    pub chain: Option<String>,
    pub matches: Vec<String>,
    pub target: Option<String>,
    pub position: Option<Position>,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    pub fn table(mut self, table: Table) -> Self {
        self.table = Some(table);
        self
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = Some(chain.into());
        self
    }

    /// Appends one match token (an iptables option string).
    pub fn matching(mut self, token: impl Into<String>) -> Self {
        self.matches.push(token.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    /// Merges two fragments, or `None` when a non-match attribute conflicts.
    fn merge(&self, other: &Fragment) -> Option<Fragment> {
        let family = merge_attr(self.family, other.family)?;
        let table = merge_attr(self.table, other.table)?;
        let chain = merge_attr(self.chain.clone(), other.chain.clone())?;
        let target = merge_attr(self.target.clone(), other.target.clone())?;
        let position = merge_attr(self.position, other.position)?;
        let mut matches = self.matches.clone();
        matches.extend(other.matches.iter().cloned());
        Some(Fragment {
            family,
            table,
            chain,
            matches,
            target,
            position,
        })
    }

    /// The (family, table, chain) triple, if all three are bound.
    pub fn location(&self) -> Option<Location> {
        Some(Location {
            family: self.family?,
            table: self.table?,
            chain: self.chain.clone()?,
        })
    }

    /// Projects the fragment into the representation the rule-tree
    /// insertion step expects, discarding already-consumed routing
    /// attributes.
    pub fn command(&self) -> RuleSpec {
        RuleSpec {
            match_text: self.matches.join(" "),
            target: self.target.clone(),
            position: self.position.unwrap_or_default(),
        }
    }

    /// Converts into a fully location-bound translation rule.
    ///
    /// Every rule inserted into the rule tree must have family, table and
    /// chain bound; an unbound attribute here is a defect in the producing
    /// component, surfaced as a configuration error against `origin`.
    pub fn into_trule(self, origin: &ObjectRef) -> Result<Trule> {
        let location = self.location().ok_or_else(|| {
            Error::config(
                origin,
                format!("rule is not fully located (family/table/chain): {self:?}"),
            )
        })?;
        Ok(Trule {
            location,
            spec: self.command(),
        })
    }
}

fn merge_attr<T: PartialEq>(a: Option<T>, b: Option<T>) -> Option<Option<T>> {
    match (a, b) {
        (None, v) | (v, None) => Some(v),
        (Some(x), Some(y)) if x == y => Some(Some(x)),
        _ => None,
    }
}

/// The (family, table, chain) triple identifying a chain.
///
/// `Ord` so dedup sets and the rule tree iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub family: Family,
    pub table: Table,
    pub chain: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.family, self.table, self.chain)
    }
}

/// Concrete rule body as stored in the rule tree: joined match text plus
/// optional jump target and insertion position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub match_text: String,
    pub target: Option<String>,
    pub position: Position,
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.match_text.is_empty(), &self.target) {
            (false, Some(t)) => write!(f, "{} -j {}", self.match_text, t),
            (false, None) => write!(f, "{}", self.match_text),
            (true, Some(t)) => write!(f, "-j {t}"),
            (true, None) => Ok(()),
        }
    }
}

/// Fully resolved translation rule, ready for rule-tree insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trule {
    pub location: Location,
    pub spec: RuleSpec,
}

/// Definition of an auxiliary chain: its table, name and the rules it
/// contains. Rule fragments may restrict family; table and chain are bound
/// by the compiler, which materializes each definition at most once per
/// location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDef {
    pub table: Table,
    pub name: String,
    pub rules: Vec<Fragment>,
}

/// Ordered cross product of fragment alternative lists.
///
/// Each input list holds mutually exclusive alternatives; the result picks
/// exactly one fragment from each list, leftmost list varying slowest, so
/// callers can predict final rule order. Combinations whose non-match
/// attributes conflict are dropped, never an error.
pub fn combine(lists: &[Vec<Fragment>]) -> Vec<Fragment> {
    let Some((first, rest)) = lists.split_first() else {
        return Vec::new();
    };
    let mut acc = first.clone();
    for list in rest {
        acc = acc
            .iter()
            .flat_map(|a| list.iter().filter_map(|b| a.merge(b)))
            .collect();
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frag(family: Option<Family>, token: Option<&str>) -> Fragment {
        let mut f = Fragment::new();
        f.family = family;
        if let Some(t) = token {
            f = f.matching(t);
        }
        f
    }

    #[test]
    fn test_combine_is_cross_product() {
        let a = vec![frag(None, Some("-i eth0")), frag(None, Some("-i eth1"))];
        let b = Family::alternatives();
        let out = combine(&[a, b]);
        assert_eq!(out.len(), 4);
        // Leftmost list varies slowest
        assert_eq!(out[0].matches, vec!["-i eth0"]);
        assert_eq!(out[0].family, Some(Family::Inet));
        assert_eq!(out[1].family, Some(Family::Inet6));
        assert_eq!(out[2].matches, vec!["-i eth1"]);
    }

    #[test]
    fn test_match_tokens_concatenate() {
        let out = combine(&[
            vec![Fragment::new().matching("-p tcp")],
            vec![Fragment::new().matching("--dport 22")],
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].command().match_text, "-p tcp --dport 22");
    }

    #[test]
    fn test_conflicting_attribute_drops_combination() {
        let generic = Family::alternatives();
        let restricted = vec![Fragment::new().family(Family::Inet).matching("-d 10.0.0.1")];
        let out = combine(&[generic, restricted]);
        // The inet6 half vanishes
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].family, Some(Family::Inet));
    }

    #[test]
    fn test_equal_attributes_carry_through() {
        let a = vec![Fragment::new().chain("INPUT")];
        let b = vec![Fragment::new().chain("INPUT").target("ACCEPT")];
        let out = combine(&[a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chain.as_deref(), Some("INPUT"));
        assert_eq!(out[0].target.as_deref(), Some("ACCEPT"));
    }

    #[test]
    fn test_empty_input_list_yields_empty_product() {
        assert!(combine(&[vec![Fragment::new()], Vec::new()]).is_empty());
        assert!(combine(&[]).is_empty());
    }

    #[test]
    fn test_location_requires_all_three() {
        let f = Fragment::new().family(Family::Inet).table(Table::Filter);
        assert!(f.location().is_none());
        let f = f.chain("INPUT");
        let loc = f.location().unwrap();
        assert_eq!(loc.to_string(), "inet/filter/INPUT");
    }

    #[test]
    fn test_into_trule_rejects_unbound_fragment() {
        let origin = ObjectRef::indexed("filter", 0);
        let err = Fragment::new().matching("-p tcp").into_trule(&origin);
        assert!(err.is_err());
    }

    #[test]
    fn test_rule_spec_display() {
        let spec = Fragment::new()
            .matching("-p tcp")
            .matching("--dport 22")
            .target("ACCEPT")
            .command();
        assert_eq!(spec.to_string(), "-p tcp --dport 22 -j ACCEPT");
        let bare = Fragment::new().target("DROP").command();
        assert_eq!(bare.to_string(), "-j DROP");
    }

    prop_compose! {
        fn arb_chain()(chain in proptest::option::of("[A-Z]{3,8}")) -> Option<String> {
            chain
        }
    }

    prop_compose! {
        fn arb_fragment()(
            family in proptest::option::of(prop_oneof![Just(Family::Inet), Just(Family::Inet6)]),
            chain in arb_chain(),
            token in proptest::option::of("-[a-z]{1,8}"),
        ) -> Fragment {
            Fragment {
                family,
                table: None,
                chain,
                matches: token.into_iter().collect(),
                target: None,
                position: None,
            }
        }
    }

    proptest! {
        // Disjoint attribute sets: full cross product, union of attributes
        #[test]
        fn test_disjoint_lists_multiply(
            tokens_a in prop::collection::vec("-a [a-z]{1,6}", 1..4),
            tokens_b in prop::collection::vec("-b [a-z]{1,6}", 1..4),
        ) {
            let a: Vec<Fragment> = tokens_a.iter().map(|t| Fragment::new().matching(t)).collect();
            let b: Vec<Fragment> = tokens_b.iter().map(|t| Fragment::new().chain("X").matching(t)).collect();
            let out = combine(&[a.clone(), b.clone()]);
            prop_assert_eq!(out.len(), a.len() * b.len());
            for f in &out {
                prop_assert_eq!(f.matches.len(), 2);
                prop_assert_eq!(f.chain.as_deref(), Some("X"));
            }
        }

        // Cardinality never exceeds the full product; survivors have no conflicts
        #[test]
        fn test_combine_shrinks_on_conflict(
            a in prop::collection::vec(arb_fragment(), 1..5),
            b in prop::collection::vec(arb_fragment(), 1..5),
        ) {
            let out = combine(&[a.clone(), b.clone()]);
            prop_assert!(out.len() <= a.len() * b.len());
            let conflicts = a.iter().flat_map(|x| b.iter().map(move |y| (x, y)))
                .filter(|(x, y)| {
                    (x.family.is_some() && y.family.is_some() && x.family != y.family)
                        || (x.chain.is_some() && y.chain.is_some() && x.chain != y.chain)
                })
                .count();
            prop_assert_eq!(out.len(), a.len() * b.len() - conflicts);
        }
    }
}
