//! Section descriptors and build-order resolution
//!
//! A configuration is assembled from named *sections*: object sections
//! (zones, services, filter rules) that hold user-visible declarative
//! objects, and virtual sections (`%`-prefixed) that contribute a computed
//! rule list directly. Sections declare `before`/`after` constraints against
//! other section names; the resolver turns the whole set into one total
//! build order that the compiler follows for both object morphing and rule
//! production.
//!
//! Ordering is deterministic: among sections with no relative constraint,
//! registration (insertion) order wins, so identical input always yields
//! identical rule sets.

use std::collections::BTreeMap;

use super::error::{Error, Result};

/// Synthetic barrier section ("all modules loaded"). Always registered, has
/// no objects and produces no rules; exists so constraints can anchor
/// against the point where every data section is in place.
pub const READY: &str = "%ready";

/// What a section contributes to compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Holds declarative objects keyed by name; morphed before rule
    /// production
    Object,
    /// Produces a computed rule list directly, no user-visible objects
    Virtual,
}

/// Registered configuration section with its ordering constraints
#[derive(Debug, Clone)]
pub struct Section {
    pub name: &'static str,
    pub kind: SectionKind,
    pub before: Vec<&'static str>,
    pub after: Vec<&'static str>,
}

impl Section {
    pub fn object(name: &'static str) -> Self {
        Self {
            name,
            kind: SectionKind::Object,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn virtual_(name: &'static str) -> Self {
        Self {
            name,
            kind: SectionKind::Virtual,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn before(mut self, names: &[&'static str]) -> Self {
        self.before.extend_from_slice(names);
        self
    }

    pub fn after(mut self, names: &[&'static str]) -> Self {
        self.after.extend_from_slice(names);
        self
    }
}

/// The full set of registered sections, immutable once handed to the
/// compiler.
#[derive(Debug, Default)]
pub struct SectionSet {
    sections: Vec<Section>,
}

impl SectionSet {
    pub fn new() -> Self {
        let mut set = Self::default();
        set.register(Section::virtual_(READY));
        set
    }

    /// Registers a section. Later registrations sort later among
    /// unconstrained peers.
    pub fn register(&mut self, section: Section) {
        self.sections.push(section);
    }

    pub fn get(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Resolves one total order over section names consistent with all
    /// `before`/`after` constraints.
    ///
    /// Kahn's algorithm; among ready sections the earliest-registered one
    /// is emitted first. Fails with [`Error::DependencyCycle`] listing the
    /// unresolved members when the constraints are unsatisfiable, and with
    /// [`Error::UnknownSection`] when a constraint references a name never
    /// registered.
    pub fn order(&self) -> Result<Vec<&'static str>> {
        let index: BTreeMap<&str, usize> = self
            .sections
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name, i))
            .collect();

        // dependents[i] holds indices that must come after section i
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.sections.len()];
        let mut indegree: Vec<usize> = vec![0; self.sections.len()];

        let mut edge = |from: usize, to: usize| {
            dependents[from].push(to);
            indegree[to] += 1;
        };

        for (i, section) in self.sections.iter().enumerate() {
            for name in &section.before {
                let j = *index.get(name).ok_or_else(|| Error::UnknownSection {
                    section: section.name.to_string(),
                    reference: (*name).to_string(),
                })?;
                edge(i, j);
            }
            for name in &section.after {
                let j = *index.get(name).ok_or_else(|| Error::UnknownSection {
                    section: section.name.to_string(),
                    reference: (*name).to_string(),
                })?;
                edge(j, i);
            }
        }

        let mut done = vec![false; self.sections.len()];
        let mut out = Vec::with_capacity(self.sections.len());
        while out.len() < self.sections.len() {
            let next = (0..self.sections.len()).find(|&i| !done[i] && indegree[i] == 0);
            let Some(i) = next else {
                let members = self
                    .sections
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !done[*i])
                    .map(|(_, s)| s.name.to_string())
                    .collect();
                return Err(Error::DependencyCycle { members });
            };
            done[i] = true;
            out.push(self.sections[i].name);
            for &j in &dependents[i] {
                indegree[j] -= 1;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(sections: Vec<Section>) -> SectionSet {
        let mut s = SectionSet::new();
        for section in sections {
            s.register(section);
        }
        s
    }

    #[test]
    fn test_registration_order_without_constraints() {
        let s = set(vec![
            Section::object("zone"),
            Section::object("service"),
            Section::object("filter"),
        ]);
        assert_eq!(s.order().unwrap(), vec![READY, "zone", "service", "filter"]);
    }

    #[test]
    fn test_before_after_constraints_honored() {
        let s = set(vec![
            Section::object("filter").after(&["%stateful"]),
            Section::virtual_("%stateful").after(&[READY]),
            Section::object("zone").before(&[READY]),
        ]);
        let order = s.order().unwrap();
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("zone") < pos(READY));
        assert!(pos(READY) < pos("%stateful"));
        assert!(pos("%stateful") < pos("filter"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let build = || {
            set(vec![
                Section::object("b"),
                Section::object("a"),
                Section::virtual_("%x").after(&["a"]).before(&["b"]),
            ])
        };
        assert_eq!(build().order().unwrap(), build().order().unwrap());
        // Insertion order among unconstrained names: "b" registered first
        let order = build().order().unwrap();
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("a") < pos("%x"));
        assert!(pos("%x") < pos("b"));
    }

    #[test]
    fn test_cycle_fails_with_members() {
        let s = set(vec![
            Section::object("a").before(&["b"]),
            Section::object("b").before(&["a"]),
        ]);
        match s.order() {
            Err(Error::DependencyCycle { members }) => {
                assert!(members.contains(&"a".to_string()));
                assert!(members.contains(&"b".to_string()));
                assert!(!members.contains(&READY.to_string()));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_reference_fails() {
        let s = set(vec![Section::object("a").before(&["nonexistent"])]);
        assert!(matches!(s.order(), Err(Error::UnknownSection { .. })));
    }
}
