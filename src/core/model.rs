//! Polymorphic rule-object model
//!
//! Each declarative filter/policy statement is morphed into a rule object
//! that knows how to expand itself, through the fragment algebra, into one
//! or more concrete translation rules. The expansion is layered: base
//! zone/service expansion, then NAT rewriting, then logging, then
//! related-connection and no-track handling, composed as explicit
//! decoration steps rather than an inheritance chain.
//!
//! Zone-to-chain resolution leans entirely on the algebra's conflict
//! semantics: an external source contributes INPUT/FORWARD alternatives,
//! an external destination OUTPUT/FORWARD, the firewall host pins one
//! terminal chain, and every invalid pairing vanishes in [`combine`].

use std::fmt;
use tracing::warn;

use super::error::{Error, ObjectRef, Result};
use super::fragment::{ChainDef, Family, Fragment, Position, Table, combine};
use super::limit::{Limit, LimitKind};
use crate::policy::{
    DnatSpec, FilterSpec, IpsetMatch, LogDirective, LogMode, LogSpec, Policy, PolicySpec, Proto,
    PortSpec, ServiceDef,
};
use crate::resolve::AddressResolver;

/// Compilation context threaded through morphing and rule production.
pub struct Ctx<'a> {
    pub policy: &'a Policy,
    pub resolver: &'a dyn AddressResolver,
}

/// Rules and auxiliary chain definitions one object contributes.
#[derive(Debug, Default)]
pub struct Production {
    pub rules: Vec<Fragment>,
    pub chains: Vec<ChainDef>,
}

/// Disposition of matching traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Accept,
    Drop,
    Reject,
    Tarpit,
    /// Adds nothing; matching continues in the chain
    Pass,
    /// Jump to a user-defined chain
    Custom(String),
}

impl Action {
    /// Parses an action value, rewriting deprecated aliases with a warning.
    pub fn parse(value: Option<&str>, origin: &ObjectRef) -> Result<Action> {
        let value = value.unwrap_or("accept");
        if let Some(alias) = match value {
            "logdrop" => Some(Action::Drop),
            "logreject" => Some(Action::Reject),
            _ => None,
        } {
            warn!(%origin, action = value, "deprecated action alias, use the canonical name");
            return Ok(alias);
        }
        if let Some(name) = value.strip_prefix("custom:") {
            return Ok(Action::Custom(name.to_string()));
        }
        match value {
            "accept" => Ok(Action::Accept),
            "drop" => Ok(Action::Drop),
            "reject" => Ok(Action::Reject),
            "tarpit" => Ok(Action::Tarpit),
            "pass" => Ok(Action::Pass),
            other => Err(Error::config(origin, format!("invalid action '{other}'"))),
        }
    }

    /// The jump target for the resolved action, `None` for pass-through.
    pub fn target(&self) -> Option<String> {
        match self {
            Action::Accept => Some("ACCEPT".into()),
            Action::Drop => Some("DROP".into()),
            Action::Reject => Some("REJECT".into()),
            Action::Tarpit => Some("TARPIT".into()),
            Action::Pass => None,
            Action::Custom(name) => Some(name.clone()),
        }
    }

    /// Whether matching traffic is logged when no log directive is given.
    pub fn logs_by_default(&self) -> bool {
        matches!(self, Action::Drop | Action::Reject | Action::Tarpit)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => write!(f, "accept"),
            Action::Drop => write!(f, "drop"),
            Action::Reject => write!(f, "reject"),
            Action::Tarpit => write!(f, "tarpit"),
            Action::Pass => write!(f, "pass"),
            Action::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Resolved logging directive
#[derive(Debug, Clone, PartialEq)]
pub struct Logger {
    mode: LogMode,
    prefix: Option<String>,
    limit: Option<u32>,
}

impl Logger {
    fn from_spec(spec: &LogSpec) -> Self {
        Self {
            mode: spec.mode,
            prefix: spec.prefix.clone(),
            limit: spec.limit,
        }
    }

    /// Default logger: kernel log, one match per second.
    fn default_logger() -> Self {
        Self {
            mode: LogMode::Log,
            prefix: None,
            limit: Some(1),
        }
    }

    /// Resolves a log directive into a concrete logger, honoring the
    /// action's log default when no directive is given.
    pub fn resolve(
        directive: Option<&LogDirective>,
        default_on: bool,
        policy: &Policy,
        origin: &ObjectRef,
    ) -> Result<Option<Logger>> {
        match directive {
            None => Ok(default_on.then(Logger::default_logger)),
            Some(LogDirective::Flag(false)) => Ok(None),
            Some(LogDirective::Flag(true)) => Ok(Some(Logger::default_logger())),
            Some(LogDirective::Named(name)) => policy
                .log
                .get(name)
                .map(|spec| Some(Logger::from_spec(spec)))
                .ok_or_else(|| Error::config(origin, format!("unknown log '{name}'"))),
        }
    }

    /// The logger's rule fragment: optional rate limit plus the log target.
    pub fn frag(&self) -> Fragment {
        let mut frag = Fragment::new();
        if let Some(rate) = self.limit {
            frag = frag.matching(format!("-m limit --limit {rate}/second"));
        }
        let target = match (self.mode, &self.prefix) {
            (LogMode::Log, None) => "LOG".to_string(),
            (LogMode::Log, Some(p)) => format!("LOG --log-prefix \"{p}\""),
            (LogMode::Nflog, None) => "NFLOG".to_string(),
            (LogMode::Nflog, Some(p)) => format!("NFLOG --nflog-prefix \"{p}\""),
        };
        frag.target(target)
    }
}

/// Which end of a rule a zone occupies; decides interface/address flags and
/// the filter-chain alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Src,
    Dest,
}

impl Side {
    fn iface_flag(self) -> &'static str {
        match self {
            Side::Src => "-i",
            Side::Dest => "-o",
        }
    }

    fn addr_flag(self) -> &'static str {
        match self {
            Side::Src => "-s",
            Side::Dest => "-d",
        }
    }

    /// Filter-chain alternatives for this side. The firewall host pins a
    /// terminal chain; external zones offer the terminal and FORWARD, and
    /// conflicting pairs drop out during combination.
    fn chain_alts(self, external: bool) -> Vec<Fragment> {
        match (self, external) {
            (Side::Src, false) => vec![Fragment::new().chain("OUTPUT")],
            (Side::Dest, false) => vec![Fragment::new().chain("INPUT")],
            (Side::Src, true) => vec![
                Fragment::new().chain("INPUT"),
                Fragment::new().chain("FORWARD"),
            ],
            (Side::Dest, true) => vec![
                Fragment::new().chain("OUTPUT"),
                Fragment::new().chain("FORWARD"),
            ],
        }
    }
}

fn identity() -> Vec<Fragment> {
    vec![Fragment::new()]
}

/// Interface-match alternatives for a zone on the given side.
fn zone_iface_frags(ctx: &Ctx, side: Side, zone: Option<&str>, origin: &ObjectRef) -> Result<Vec<Fragment>> {
    let Some(name) = zone else {
        return Ok(identity());
    };
    let zone = ctx
        .policy
        .zone
        .get(name)
        .ok_or_else(|| Error::config(origin, format!("unknown zone '{name}'")))?;
    let ifaces = zone.iface.as_slice();
    if ifaces.is_empty() {
        return Ok(identity());
    }
    Ok(ifaces
        .iter()
        .map(|i| Fragment::new().matching(format!("{} {i}", side.iface_flag())))
        .collect())
}

/// Address-match alternatives for a zone on the given side, one fragment
/// per resolved (family, network) pair.
fn zone_addr_frags(ctx: &Ctx, side: Side, zone: Option<&str>, origin: &ObjectRef) -> Result<Vec<Fragment>> {
    let Some(name) = zone else {
        return Ok(identity());
    };
    let zone = ctx
        .policy
        .zone
        .get(name)
        .ok_or_else(|| Error::config(origin, format!("unknown zone '{name}'")))?;
    let addrs = zone.addr.as_slice();
    if addrs.is_empty() {
        return Ok(identity());
    }
    let mut frags = Vec::new();
    for addr in addrs {
        for (family, net) in ctx.resolver.resolve(addr, origin)? {
            frags.push(
                Fragment::new()
                    .family(family)
                    .matching(format!("{} {net}", side.addr_flag())),
            );
        }
    }
    Ok(frags)
}

/// Interface and address matches combined for one side of a rule.
fn zone_match_frags(ctx: &Ctx, side: Side, zone: Option<&str>, origin: &ObjectRef) -> Result<Vec<Fragment>> {
    Ok(combine(&[
        zone_iface_frags(ctx, side, zone, origin)?,
        zone_addr_frags(ctx, side, zone, origin)?,
    ]))
}

fn port_text(spec: &PortSpec, origin: &ObjectRef) -> Result<String> {
    match spec {
        PortSpec::Num(n) => Ok(n.to_string()),
        PortSpec::Range(range) => {
            let parts: Vec<&str> = range.splitn(2, '-').collect();
            let parse = |s: &str| {
                s.parse::<u16>()
                    .map_err(|_| Error::config(origin, format!("invalid port range '{range}'")))
            };
            if parts.len() != 2 {
                return Err(Error::config(origin, format!("invalid port range '{range}'")));
            }
            let (lo, hi) = (parse(parts[0])?, parse(parts[1])?);
            if lo > hi {
                return Err(Error::config(origin, format!("invalid port range '{range}'")));
            }
            Ok(format!("{lo}:{hi}"))
        }
    }
}

/// Match fragment for one service definition.
///
/// `reply` swaps destination ports for source ports (reply-direction
/// rules); `port_override` replaces the definition's ports with a
/// translated one.
pub(crate) fn service_frag(
    def: &ServiceDef,
    reply: bool,
    port_override: Option<u16>,
    origin: &ObjectRef,
) -> Result<Fragment> {
    let mut frag = Fragment::new();
    if let Some(family) = def.family {
        frag = frag.family(family);
    }
    match def.proto {
        None => Ok(frag),
        Some(proto @ (Proto::Tcp | Proto::Udp)) => {
            frag = frag.matching(format!("-p {proto}"));
            let flag = if reply { "sport" } else { "dport" };
            if let Some(port) = port_override {
                return Ok(frag.matching(format!("--{flag} {port}")));
            }
            let ports = def.port.as_slice();
            match ports.len() {
                0 => Ok(frag),
                1 => Ok(frag.matching(format!("--{flag} {}", port_text(&ports[0], origin)?))),
                _ => {
                    let texts = ports
                        .iter()
                        .map(|p| port_text(p, origin))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(frag.matching(format!("-m multiport --{flag}s {}", texts.join(","))))
                }
            }
        }
        Some(Proto::Icmp) => {
            if def.family == Some(Family::Inet6) {
                return Err(Error::config(origin, "icmp is IPv4 only, use icmpv6"));
            }
            frag = frag.family(Family::Inet).matching("-p icmp");
            match (def.icmp_type, reply) {
                (Some(t), false) => Ok(frag.matching(format!("--icmp-type {t}"))),
                _ => Ok(frag),
            }
        }
        Some(Proto::Icmpv6) => {
            if def.family == Some(Family::Inet) {
                return Err(Error::config(origin, "icmpv6 is IPv6 only, use icmp"));
            }
            frag = frag.family(Family::Inet6).matching("-p icmpv6");
            match (def.icmp_type, reply) {
                (Some(t), false) => Ok(frag.matching(format!("--icmpv6-type {t}"))),
                _ => Ok(frag),
            }
        }
    }
}

/// Resolved destination NAT
#[derive(Debug, Clone, PartialEq)]
pub struct Dnat {
    /// Translated IPv4 host address
    pub addr: String,
    pub port: Option<u16>,
}

/// A named service with its resolved definitions
#[derive(Debug, Clone, PartialEq)]
pub struct NamedService {
    pub name: String,
    pub defs: Vec<ServiceDef>,
}

/// Morphed filter statement, ready to produce translation rules.
///
/// A policy (default-posture) statement morphs into the same type with an
/// empty service dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRule {
    origin: ObjectRef,
    index: usize,
    src: Option<String>,
    dest: Option<String>,
    services: Vec<NamedService>,
    action: Action,
    logger: Option<Logger>,
    dnat: Option<Dnat>,
    no_track: bool,
    limit: Option<Limit>,
    limit_logger: Option<Logger>,
    related: Option<Vec<NamedService>>,
    ipset: Option<IpsetMatch>,
}

fn lookup_services(
    ctx: &Ctx,
    names: &[String],
    origin: &ObjectRef,
) -> Result<Vec<NamedService>> {
    names
        .iter()
        .map(|name| {
            ctx.policy
                .service
                .get(name)
                .map(|v| NamedService {
                    name: name.clone(),
                    defs: v.as_slice().to_vec(),
                })
                .ok_or_else(|| Error::config(origin, format!("unknown service '{name}'")))
        })
        .collect()
}

/// Morphs a raw filter statement, validating every field combination.
pub fn morph_filter(ctx: &Ctx, index: usize, spec: &FilterSpec) -> Result<FilterRule> {
    let origin = ObjectRef::indexed("filter", index);
    let action = Action::parse(spec.action.as_deref(), &origin)?;

    let limit = match (&spec.conn_limit, &spec.flow_limit) {
        (Some(_), Some(_)) => {
            return Err(Error::config(
                &origin,
                "at most one of conn-limit and flow-limit may be set",
            ));
        }
        (Some(d), None) => Some((Limit::from_spec(&d.spec(), LimitKind::Conn), d.spec().log)),
        (None, Some(d)) => Some((Limit::from_spec(&d.spec(), LimitKind::Flow), d.spec().log)),
        (None, None) => None,
    };
    if spec.no_track && matches!(limit, Some((Limit { kind: LimitKind::Conn, .. }, _))) {
        return Err(Error::config(
            &origin,
            "connection limiting requires connection tracking, no-track is not allowed",
        ));
    }
    // Tarpit holds the connection open itself; tracking it is pointless.
    let no_track = spec.no_track || action == Action::Tarpit;

    let logger = Logger::resolve(
        spec.log.as_ref(),
        action.logs_by_default(),
        ctx.policy,
        &origin,
    )?;
    if logger.is_some() && matches!(action, Action::Custom(_)) {
        return Err(Error::config(
            &origin,
            "logging cannot be combined with a custom chain target",
        ));
    }

    if let Some(ipset) = &spec.ipset {
        if !ctx.policy.ipset.contains_key(&ipset.name) {
            return Err(Error::config(
                &origin,
                format!("unknown ipset '{}'", ipset.name),
            ));
        }
    }

    let services = lookup_services(ctx, spec.service.as_slice(), &origin)?;

    let dnat = match &spec.dnat {
        None => None,
        Some(d) => Some(morph_dnat(ctx, spec, d, &action, &services, &origin)?),
    };

    let related = match &spec.related {
        None => None,
        Some(names) => {
            let resolved = lookup_services(ctx, names, &origin)?;
            for service in &resolved {
                if service.defs.iter().all(|d| d.helper.is_none()) {
                    return Err(Error::config(
                        &origin,
                        format!(
                            "related service '{}' defines no conntrack helper",
                            service.name
                        ),
                    ));
                }
            }
            Some(resolved)
        }
    };

    let (limit, limit_logger) = match limit {
        None => (None, None),
        Some((l, log_directive)) => {
            // Limit violations log by default
            let logger = Logger::resolve(log_directive.as_ref(), true, ctx.policy, &origin)?;
            (Some(l), logger)
        }
    };

    Ok(FilterRule {
        origin,
        index,
        src: spec.src.clone(),
        dest: spec.out.clone(),
        services,
        action,
        logger,
        dnat,
        no_track,
        limit,
        limit_logger,
        related,
        ipset: spec.ipset.clone(),
    })
}

fn morph_dnat(
    ctx: &Ctx,
    spec: &FilterSpec,
    dnat: &DnatSpec,
    action: &Action,
    services: &[NamedService],
    origin: &ObjectRef,
) -> Result<Dnat> {
    if *action != Action::Accept {
        return Err(Error::config(origin, "dnat requires action 'accept'"));
    }
    if spec.no_track {
        return Err(Error::config(origin, "dnat cannot be combined with no-track"));
    }
    if spec.ipset.is_some() {
        return Err(Error::config(
            origin,
            "dnat cannot be combined with an ipset match",
        ));
    }
    let v4: Vec<_> = ctx
        .resolver
        .resolve(dnat.addr(), origin)?
        .into_iter()
        .filter(|(family, _)| *family == Family::Inet)
        .collect();
    let net = match v4.as_slice() {
        [] => {
            return Err(Error::config(
                origin,
                format!("no IPv4 address for dnat target '{}'", dnat.addr()),
            ));
        }
        [(_, net)] => net,
        _ => {
            return Err(Error::config(
                origin,
                format!(
                    "dnat target '{}' resolves to multiple IPv4 addresses",
                    dnat.addr()
                ),
            ));
        }
    };
    if net.prefix() != 32 {
        return Err(Error::config(
            origin,
            format!(
                "dnat target '{}' is a network, a single host is required",
                dnat.addr()
            ),
        ));
    }
    if dnat.port().is_some() {
        for service in services {
            for def in &service.defs {
                if !matches!(def.proto, Some(Proto::Tcp | Proto::Udp)) {
                    return Err(Error::config(
                        origin,
                        "port translation requires an unambiguous tcp or udp service",
                    ));
                }
            }
        }
    }
    Ok(Dnat {
        addr: net.ip().to_string(),
        port: dnat.port(),
    })
}

/// Morphs a raw default-posture statement.
pub fn morph_policy(ctx: &Ctx, index: usize, spec: &PolicySpec) -> Result<FilterRule> {
    let origin = ObjectRef::indexed("policy", index);
    let action = Action::parse(spec.action.as_deref(), &origin)?;
    let logger = Logger::resolve(
        spec.log.as_ref(),
        action.logs_by_default(),
        ctx.policy,
        &origin,
    )?;
    if logger.is_some() && matches!(action, Action::Custom(_)) {
        return Err(Error::config(
            &origin,
            "logging cannot be combined with a custom chain target",
        ));
    }
    Ok(FilterRule {
        origin,
        index,
        src: spec.src.clone(),
        dest: spec.out.clone(),
        services: Vec::new(),
        action,
        logger,
        dnat: None,
        no_track: false,
        limit: None,
        limit_logger: None,
        related: None,
        ipset: None,
    })
}

impl FilterRule {
    pub fn origin(&self) -> &ObjectRef {
        &self.origin
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Source-side fragments: chain alternatives with interface/address
    /// matches.
    fn src_frags(&self, ctx: &Ctx) -> Result<Vec<Fragment>> {
        Ok(combine(&[
            Side::Src.chain_alts(self.src.is_some()),
            zone_match_frags(ctx, Side::Src, self.src.as_deref(), &self.origin)?,
        ]))
    }

    /// Destination-side fragments. A destination NAT is IPv4-only: the
    /// inet half routes to the translated host address while the original
    /// destination expansion survives restricted to inet6.
    fn dest_frags(&self, ctx: &Ctx) -> Result<Vec<Fragment>> {
        let chain_alts = Side::Dest.chain_alts(self.dest.is_some());
        match &self.dnat {
            None => Ok(combine(&[
                chain_alts,
                zone_match_frags(ctx, Side::Dest, self.dest.as_deref(), &self.origin)?,
            ])),
            Some(dnat) => {
                let mut alts = combine(&[
                    vec![Fragment::new().family(Family::Inet6)],
                    zone_match_frags(ctx, Side::Dest, self.dest.as_deref(), &self.origin)?,
                ]);
                alts.extend(combine(&[
                    vec![Fragment::new().family(Family::Inet)],
                    zone_iface_frags(ctx, Side::Dest, self.dest.as_deref(), &self.origin)?,
                    vec![Fragment::new().matching(format!("-d {}", dnat.addr))],
                ]));
                Ok(combine(&[chain_alts, alts]))
            }
        }
    }

    /// Service-match alternatives across every definition of every
    /// selected service.
    fn service_frags(
        &self,
        reply: bool,
        port_override: Option<u16>,
    ) -> Result<Vec<Fragment>> {
        let mut frags = Vec::new();
        for service in &self.services {
            for def in &service.defs {
                frags.push(service_frag(def, reply, port_override, &self.origin)?);
            }
        }
        Ok(frags)
    }

    fn ipset_frag(&self) -> Option<Fragment> {
        self.ipset.as_ref().map(|m| {
            let flags = if m.args.is_empty() {
                "src".to_string()
            } else {
                m.args.join(",")
            };
            Fragment::new().matching(format!("-m set --match-set {} {flags}", m.name))
        })
    }

    /// Action/log decoration exactly as applied to an unlimited rule.
    fn plain_decoration(&self) -> Vec<Fragment> {
        let mut seq = Vec::new();
        if let Some(logger) = &self.logger {
            seq.push(logger.frag());
        }
        if let Some(target) = self.action.target() {
            seq.push(Fragment::new().target(target));
        }
        if seq.is_empty() {
            // Pass-through actions add nothing
            seq.push(Fragment::new());
        }
        seq
    }

    /// The mangle step: plain decoration, or the rate-limit subsystem's
    /// output spliced in its place.
    fn mangle_frags(&self) -> (Vec<Fragment>, Vec<ChainDef>) {
        let Some(limit) = &self.limit else {
            return (self.plain_decoration(), Vec::new());
        };
        let hint = format!("limit-{}-{}", limit.kind, self.index + 1);
        let fail_log = self.limit_logger.as_ref().map(Logger::frag);
        let deco = limit.decorate(
            &hint,
            fail_log.as_ref(),
            self.action.target().as_deref(),
        );
        let mut seq = deco.sequence;
        if !deco.terminal {
            seq.extend(self.plain_decoration());
        }
        (seq, deco.chains)
    }

    /// Flow state must be evaluated before any other disposition.
    fn prepends(&self) -> bool {
        !self.no_track
            && matches!(self.limit, Some(Limit { kind: LimitKind::Flow, .. }))
    }

    /// Expands the rule into its translation rules and auxiliary chains.
    pub fn trules(&self, ctx: &Ctx) -> Result<Production> {
        let mut chains = Vec::new();

        let mut lists: Vec<Vec<Fragment>> = vec![
            Family::alternatives(),
            vec![Fragment::new().table(Table::Filter)],
            self.src_frags(ctx)?,
            self.dest_frags(ctx)?,
        ];
        if let Some(frag) = self.ipset_frag() {
            lists.push(vec![frag]);
        }
        // A NAT port only rewrites the IPv4 half of the service expansion;
        // the inet6 half keeps matching the original ports.
        let services = match &self.dnat {
            Some(dnat) if dnat.port.is_some() => {
                let mut split = combine(&[
                    vec![Fragment::new().family(Family::Inet6)],
                    self.service_frags(false, None)?,
                ]);
                split.extend(combine(&[
                    vec![Fragment::new().family(Family::Inet)],
                    self.service_frags(false, dnat.port)?,
                ]));
                split
            }
            _ => self.service_frags(false, None)?,
        };
        if !services.is_empty() {
            lists.push(services);
        }
        if matches!(self.limit, Some(Limit { kind: LimitKind::Conn, .. })) {
            lists.push(vec![
                Fragment::new().matching("-m conntrack --ctstate NEW"),
            ]);
        }
        let (mangle, limit_chains) = self.mangle_frags();
        chains.extend(limit_chains);
        lists.push(mangle);

        let mut rules = combine(&lists);
        if self.prepends() {
            for rule in &mut rules {
                rule.position = Some(Position::Prepend);
            }
        }

        if let Action::Custom(name) = &self.action {
            chains.push(custom_chain(ctx, name, &self.origin)?);
        }

        rules.extend(self.extra_trules(ctx)?);
        Ok(Production { rules, chains })
    }

    /// Auxiliary rule sets beyond the filter's own match: DNAT redirection,
    /// no-track handling and RELATED-helper admission.
    fn extra_trules(&self, ctx: &Ctx) -> Result<Vec<Fragment>> {
        let mut out = Vec::new();
        if let Some(dnat) = &self.dnat {
            out.extend(self.dnat_rules(ctx, dnat)?);
        }
        if self.no_track {
            out.extend(self.no_track_forward_rules(ctx)?);
        }
        if self.action == Action::Accept {
            if self.no_track {
                out.extend(self.no_track_reply_rules(ctx)?);
            }
            out.extend(self.related_rules(ctx)?);
        }
        Ok(out)
    }

    /// The nat-table redirection rule matching the original destination.
    fn dnat_rules(&self, ctx: &Ctx, dnat: &Dnat) -> Result<Vec<Fragment>> {
        let target = match dnat.port {
            Some(port) => format!("DNAT --to-destination {}:{port}", dnat.addr),
            None => format!("DNAT --to-destination {}", dnat.addr),
        };
        Ok(combine(&[
            vec![
                Fragment::new()
                    .family(Family::Inet)
                    .table(Table::Nat)
                    .chain("PREROUTING"),
            ],
            zone_match_frags(ctx, Side::Src, self.src.as_deref(), &self.origin)?,
            zone_addr_frags(ctx, Side::Dest, self.dest.as_deref(), &self.origin)?,
            self.service_frags(false, None)?,
            vec![Fragment::new().target(target)],
        ]))
    }

    /// Raw-table chain for traffic originating at `zone` (the firewall host
    /// has no prerouting leg).
    fn raw_chain(zone: Option<&str>) -> &'static str {
        if zone.is_none() { "OUTPUT" } else { "PREROUTING" }
    }

    /// Raw-table no-track rule for the forward direction. Emitted for every
    /// no-track rule regardless of disposition.
    fn no_track_forward_rules(&self, ctx: &Ctx) -> Result<Vec<Fragment>> {
        let mut forward = vec![
            Family::alternatives(),
            vec![
                Fragment::new()
                    .table(Table::Raw)
                    .chain(Self::raw_chain(self.src.as_deref())),
            ],
            zone_match_frags(ctx, Side::Src, self.src.as_deref(), &self.origin)?,
            zone_addr_frags(ctx, Side::Dest, self.dest.as_deref(), &self.origin)?,
        ];
        let services = self.service_frags(false, None)?;
        if !services.is_empty() {
            forward.push(services);
        }
        forward.push(vec![Fragment::new().target("CT --notrack")]);
        Ok(combine(&forward))
    }

    /// Reply handling for accepted no-track traffic: without a conntrack
    /// entry nothing admits the reverse direction, so it gets its own raw
    /// no-track rule (zones swapped, ports matched as sources) and an
    /// explicit filter accept.
    fn no_track_reply_rules(&self, ctx: &Ctx) -> Result<Vec<Fragment>> {
        let mut out = Vec::new();
        let mut reply = vec![
            Family::alternatives(),
            vec![
                Fragment::new()
                    .table(Table::Raw)
                    .chain(Self::raw_chain(self.dest.as_deref())),
            ],
            zone_match_frags(ctx, Side::Src, self.dest.as_deref(), &self.origin)?,
            zone_addr_frags(ctx, Side::Dest, self.src.as_deref(), &self.origin)?,
        ];
        let reply_services = self.service_frags(true, None)?;
        if !reply_services.is_empty() {
            reply.push(reply_services.clone());
        }
        reply.push(vec![Fragment::new().target("CT --notrack")]);
        out.extend(combine(&reply));

        // Explicit reply-direction filter rule
        let mut reply_filter = vec![
            Family::alternatives(),
            vec![Fragment::new().table(Table::Filter)],
            combine(&[
                Side::Src.chain_alts(self.dest.is_some()),
                zone_match_frags(ctx, Side::Src, self.dest.as_deref(), &self.origin)?,
            ]),
            combine(&[
                Side::Dest.chain_alts(self.src.is_some()),
                zone_match_frags(ctx, Side::Dest, self.src.as_deref(), &self.origin)?,
            ]),
        ];
        if !reply_services.is_empty() {
            reply_filter.push(reply_services);
        }
        reply_filter.push(vec![Fragment::new().target("ACCEPT")]);
        out.extend(combine(&reply_filter));

        Ok(out)
    }

    fn helper_frag(helper: &str) -> Fragment {
        Fragment::new()
            .matching(format!(
                "-m conntrack --ctstate RELATED -m helper --helper {helper}"
            ))
            .target("ACCEPT")
    }

    /// RELATED-state admission for conntrack helper flows.
    ///
    /// With an explicit related-service list, one forward rule per helper;
    /// otherwise generic forward and reply rules for the rule's own
    /// helper-carrying services.
    fn related_rules(&self, ctx: &Ctx) -> Result<Vec<Fragment>> {
        let mut out = Vec::new();
        let forward_sides = |ctx: &Ctx| -> Result<(Vec<Fragment>, Vec<Fragment>)> {
            Ok((
                self.src_frags(ctx)?,
                combine(&[
                    Side::Dest.chain_alts(self.dest.is_some()),
                    zone_match_frags(ctx, Side::Dest, self.dest.as_deref(), &self.origin)?,
                ]),
            ))
        };

        if let Some(related) = &self.related {
            let (src, dest) = forward_sides(ctx)?;
            for service in related {
                for def in &service.defs {
                    if let Some(helper) = &def.helper {
                        out.extend(combine(&[
                            Family::alternatives(),
                            vec![Fragment::new().table(Table::Filter)],
                            src.clone(),
                            dest.clone(),
                            vec![Self::helper_frag(helper)],
                        ]));
                    }
                }
            }
            return Ok(out);
        }

        let helpers: Vec<&String> = self
            .services
            .iter()
            .flat_map(|s| s.defs.iter().filter_map(|d| d.helper.as_ref()))
            .collect();
        if helpers.is_empty() {
            return Ok(out);
        }
        let (src, dest) = forward_sides(ctx)?;
        let reply_src = combine(&[
            Side::Src.chain_alts(self.dest.is_some()),
            zone_match_frags(ctx, Side::Src, self.dest.as_deref(), &self.origin)?,
        ]);
        let reply_dest = combine(&[
            Side::Dest.chain_alts(self.src.is_some()),
            zone_match_frags(ctx, Side::Dest, self.src.as_deref(), &self.origin)?,
        ]);
        for helper in helpers {
            out.extend(combine(&[
                Family::alternatives(),
                vec![Fragment::new().table(Table::Filter)],
                src.clone(),
                dest.clone(),
                vec![Self::helper_frag(helper)],
            ]));
            out.extend(combine(&[
                Family::alternatives(),
                vec![Fragment::new().table(Table::Filter)],
                reply_src.clone(),
                reply_dest.clone(),
                vec![Self::helper_frag(helper)],
            ]));
        }
        Ok(out)
    }
}

/// Resolves a `custom:` target against the policy's custom chain
/// definitions.
fn custom_chain(ctx: &Ctx, name: &str, origin: &ObjectRef) -> Result<ChainDef> {
    let rules = ctx
        .policy
        .custom
        .get(name)
        .ok_or_else(|| Error::config(origin, format!("invalid custom chain '{name}'")))?;
    Ok(ChainDef {
        table: Table::Filter,
        name: name.to_string(),
        rules: rules
            .iter()
            .map(|r| {
                let mut frag = Fragment::new();
                if let Some(family) = r.family {
                    frag = frag.family(family);
                }
                if let Some(m) = &r.match_text {
                    frag = frag.matching(m.clone());
                }
                if let Some(t) = &r.target {
                    frag = frag.target(t.clone());
                }
                frag
            })
            .collect(),
    })
}
