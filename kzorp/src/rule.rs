//! N-dimensional rules.
//!
//! A rule pairs a service with up to 14 dimension lists. Alternatives within
//! a dimension are OR-ed; dimensions are AND-ed; an empty dimension is a
//! wildcard. The [`Dimension`] enum is the single table driving staging
//! capacity checks, matching, and dump building — adding a dimension means
//! extending the enum and the exhaustive matches on it.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::{Ipv4Net, Ipv6Net};

use crate::error::{KzorpError, Result};
use crate::service::Service;
use crate::types::{PacketContext, PortRange};
use crate::zone::Zone;

/// The rule dimensions, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Ifname,
    Ifgroup,
    Proto,
    SrcPort,
    DstPort,
    SrcSubnet,
    SrcSubnet6,
    SrcZone,
    DstSubnet,
    DstSubnet6,
    DstZone,
    DstIfname,
    DstIfgroup,
    Reqid,
}

/// Number of dimensions.
pub const DIMENSION_COUNT: usize = 14;

impl Dimension {
    pub const ALL: [Dimension; DIMENSION_COUNT] = [
        Dimension::Ifname,
        Dimension::Ifgroup,
        Dimension::Proto,
        Dimension::SrcPort,
        Dimension::DstPort,
        Dimension::SrcSubnet,
        Dimension::SrcSubnet6,
        Dimension::SrcZone,
        Dimension::DstSubnet,
        Dimension::DstSubnet6,
        Dimension::DstZone,
        Dimension::DstIfname,
        Dimension::DstIfgroup,
        Dimension::Reqid,
    ];

    /// Position in canonical order.
    pub fn index(self) -> usize {
        match self {
            Self::Ifname => 0,
            Self::Ifgroup => 1,
            Self::Proto => 2,
            Self::SrcPort => 3,
            Self::DstPort => 4,
            Self::SrcSubnet => 5,
            Self::SrcSubnet6 => 6,
            Self::SrcZone => 7,
            Self::DstSubnet => 8,
            Self::DstSubnet6 => 9,
            Self::DstZone => 10,
            Self::DstIfname => 11,
            Self::DstIfgroup => 12,
            Self::Reqid => 13,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ifname => "ifname",
            Self::Ifgroup => "ifgroup",
            Self::Proto => "proto",
            Self::SrcPort => "src-port",
            Self::DstPort => "dst-port",
            Self::SrcSubnet => "src-subnet",
            Self::SrcSubnet6 => "src-subnet6",
            Self::SrcZone => "src-zone",
            Self::DstSubnet => "dst-subnet",
            Self::DstSubnet6 => "dst-subnet6",
            Self::DstZone => "dst-zone",
            Self::DstIfname => "dst-ifname",
            Self::DstIfgroup => "dst-ifgroup",
            Self::Reqid => "reqid",
        }
    }
}

/// Declared alternative counts per dimension, set at rule creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimensionCounts([u32; DIMENSION_COUNT]);

impl DimensionCounts {
    pub fn new(counts: [u32; DIMENSION_COUNT]) -> Self {
        Self(counts)
    }

    pub fn get(&self, dim: Dimension) -> u32 {
        self.0.get(dim.index()).copied().unwrap_or(0)
    }

    pub fn as_array(&self) -> [u32; DIMENSION_COUNT] {
        self.0
    }
}

/// One alternative for one dimension, with zones still referenced by
/// unique name. This is the staging and dump form; resolution to zone
/// references happens at snapshot build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEntry {
    Ifname(String),
    Ifgroup(u32),
    Proto(u8),
    SrcPort(PortRange),
    DstPort(PortRange),
    SrcSubnet(Ipv4Net),
    SrcSubnet6(Ipv6Net),
    SrcZone(String),
    DstSubnet(Ipv4Net),
    DstSubnet6(Ipv6Net),
    DstZone(String),
    DstIfname(String),
    DstIfgroup(u32),
    Reqid(u32),
}

impl RuleEntry {
    pub fn dimension(&self) -> Dimension {
        match self {
            Self::Ifname(_) => Dimension::Ifname,
            Self::Ifgroup(_) => Dimension::Ifgroup,
            Self::Proto(_) => Dimension::Proto,
            Self::SrcPort(_) => Dimension::SrcPort,
            Self::DstPort(_) => Dimension::DstPort,
            Self::SrcSubnet(_) => Dimension::SrcSubnet,
            Self::SrcSubnet6(_) => Dimension::SrcSubnet6,
            Self::SrcZone(_) => Dimension::SrcZone,
            Self::DstSubnet(_) => Dimension::DstSubnet,
            Self::DstSubnet6(_) => Dimension::DstSubnet6,
            Self::DstZone(_) => Dimension::DstZone,
            Self::DstIfname(_) => Dimension::DstIfname,
            Self::DstIfgroup(_) => Dimension::DstIfgroup,
            Self::Reqid(_) => Dimension::Reqid,
        }
    }
}

/// A staged rule: service by name, entries unresolved.
#[derive(Debug, Clone)]
pub(crate) struct RuleDraft {
    pub id: u32,
    pub service: String,
    pub counts: DimensionCounts,
    pub entries: Vec<RuleEntry>,
}

impl RuleDraft {
    pub fn used(&self, dim: Dimension) -> u32 {
        self.entries.iter().filter(|e| e.dimension() == dim).count() as u32
    }

    /// Append one batch of alternatives, at most one per dimension, each
    /// within its declared capacity.
    pub fn append_entries(&mut self, entries: Vec<RuleEntry>) -> Result<()> {
        for (i, entry) in entries.iter().enumerate() {
            let dim = entry.dimension();
            if entries
                .iter()
                .take(i)
                .any(|other| other.dimension() == dim)
            {
                return Err(KzorpError::InvalidArgument(format!(
                    "duplicate dimension in rule entry: {}",
                    dim.name()
                )));
            }
            if self.used(dim) >= self.counts.get(dim) {
                return Err(KzorpError::InvalidArgument(format!(
                    "rule {} dimension {} is full ({} entries)",
                    self.id,
                    dim.name(),
                    self.counts.get(dim)
                )));
            }
        }
        self.entries.extend(entries);
        Ok(())
    }
}

/// Resolved per-dimension alternative lists.
#[derive(Debug, Clone, Default)]
pub struct RuleEntries {
    pub ifname: Vec<String>,
    pub ifgroup: Vec<u32>,
    pub proto: Vec<u8>,
    pub src_port: Vec<PortRange>,
    pub dst_port: Vec<PortRange>,
    pub src_subnet: Vec<Ipv4Net>,
    pub src_subnet6: Vec<Ipv6Net>,
    pub src_zone: Vec<Arc<Zone>>,
    pub dst_subnet: Vec<Ipv4Net>,
    pub dst_subnet6: Vec<Ipv6Net>,
    pub dst_zone: Vec<Arc<Zone>>,
    pub dst_ifname: Vec<String>,
    pub dst_ifgroup: Vec<u32>,
    pub reqid: Vec<u32>,
}

impl RuleEntries {
    pub fn used(&self, dim: Dimension) -> u32 {
        let len = match dim {
            Dimension::Ifname => self.ifname.len(),
            Dimension::Ifgroup => self.ifgroup.len(),
            Dimension::Proto => self.proto.len(),
            Dimension::SrcPort => self.src_port.len(),
            Dimension::DstPort => self.dst_port.len(),
            Dimension::SrcSubnet => self.src_subnet.len(),
            Dimension::SrcSubnet6 => self.src_subnet6.len(),
            Dimension::SrcZone => self.src_zone.len(),
            Dimension::DstSubnet => self.dst_subnet.len(),
            Dimension::DstSubnet6 => self.dst_subnet6.len(),
            Dimension::DstZone => self.dst_zone.len(),
            Dimension::DstIfname => self.dst_ifname.len(),
            Dimension::DstIfgroup => self.dst_ifgroup.len(),
            Dimension::Reqid => self.reqid.len(),
        };
        len as u32
    }

    /// Entries in staging/dump form, zones back to their unique names.
    pub fn to_entries(&self) -> Vec<RuleEntry> {
        let mut out = Vec::new();
        out.extend(self.ifname.iter().cloned().map(RuleEntry::Ifname));
        out.extend(self.ifgroup.iter().copied().map(RuleEntry::Ifgroup));
        out.extend(self.proto.iter().copied().map(RuleEntry::Proto));
        out.extend(self.src_port.iter().copied().map(RuleEntry::SrcPort));
        out.extend(self.dst_port.iter().copied().map(RuleEntry::DstPort));
        out.extend(self.src_subnet.iter().copied().map(RuleEntry::SrcSubnet));
        out.extend(self.src_subnet6.iter().copied().map(RuleEntry::SrcSubnet6));
        out.extend(
            self.src_zone
                .iter()
                .map(|z| RuleEntry::SrcZone(z.unique_name().to_owned())),
        );
        out.extend(self.dst_subnet.iter().copied().map(RuleEntry::DstSubnet));
        out.extend(self.dst_subnet6.iter().copied().map(RuleEntry::DstSubnet6));
        out.extend(
            self.dst_zone
                .iter()
                .map(|z| RuleEntry::DstZone(z.unique_name().to_owned())),
        );
        out.extend(self.dst_ifname.iter().cloned().map(RuleEntry::DstIfname));
        out.extend(self.dst_ifgroup.iter().copied().map(RuleEntry::DstIfgroup));
        out.extend(self.reqid.iter().copied().map(RuleEntry::Reqid));
        out
    }
}

/// A resolved rule inside a frozen snapshot.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: u32,
    pub service: Arc<Service>,
    pub entries: RuleEntries,
}

fn any_or_wildcard<T>(alternatives: &[T], pred: impl Fn(&T) -> bool) -> bool {
    alternatives.is_empty() || alternatives.iter().any(pred)
}

fn zone_listed(alternatives: &[Arc<Zone>], chain: &[Arc<Zone>]) -> bool {
    any_or_wildcard(alternatives, |candidate| {
        chain.iter().any(|z| Arc::ptr_eq(z, candidate))
    })
}

impl Rule {
    /// True if every non-empty dimension has a matching alternative.
    /// `src_zones` / `dst_zones` are the packet's zone chains, most
    /// specific first.
    pub fn matches(
        &self,
        pkt: &PacketContext,
        src_zones: &[Arc<Zone>],
        dst_zones: &[Arc<Zone>],
    ) -> bool {
        Dimension::ALL
            .iter()
            .all(|dim| self.dimension_matches(*dim, pkt, src_zones, dst_zones))
    }

    fn dimension_matches(
        &self,
        dim: Dimension,
        pkt: &PacketContext,
        src_zones: &[Arc<Zone>],
        dst_zones: &[Arc<Zone>],
    ) -> bool {
        let e = &self.entries;
        match dim {
            Dimension::Ifname => any_or_wildcard(&e.ifname, |n| *n == pkt.ingress.name),
            Dimension::Ifgroup => any_or_wildcard(&e.ifgroup, |g| *g == pkt.ingress.group),
            Dimension::Proto => any_or_wildcard(&e.proto, |p| *p == pkt.proto),
            Dimension::SrcPort => any_or_wildcard(&e.src_port, |r| r.contains(pkt.src_port)),
            Dimension::DstPort => any_or_wildcard(&e.dst_port, |r| r.contains(pkt.dst_port)),
            Dimension::SrcSubnet => any_or_wildcard(&e.src_subnet, |n| match pkt.src {
                IpAddr::V4(a) => n.contains(&a),
                IpAddr::V6(_) => false,
            }),
            Dimension::SrcSubnet6 => any_or_wildcard(&e.src_subnet6, |n| match pkt.src {
                IpAddr::V6(a) => n.contains(&a),
                IpAddr::V4(_) => false,
            }),
            Dimension::SrcZone => zone_listed(&e.src_zone, src_zones),
            Dimension::DstSubnet => any_or_wildcard(&e.dst_subnet, |n| match pkt.dst {
                IpAddr::V4(a) => n.contains(&a),
                IpAddr::V6(_) => false,
            }),
            Dimension::DstSubnet6 => any_or_wildcard(&e.dst_subnet6, |n| match pkt.dst {
                IpAddr::V6(a) => n.contains(&a),
                IpAddr::V4(_) => false,
            }),
            Dimension::DstZone => zone_listed(&e.dst_zone, dst_zones),
            Dimension::DstIfname => any_or_wildcard(&e.dst_ifname, |n| {
                pkt.egress.as_ref().is_some_and(|i| i.name == *n)
            }),
            Dimension::DstIfgroup => any_or_wildcard(&e.dst_ifgroup, |g| {
                pkt.egress.as_ref().is_some_and(|i| i.group == *g)
            }),
            Dimension::Reqid => any_or_wildcard(&e.reqid, |r| pkt.reqids.contains(r)),
        }
    }

    /// Back to staging form, for carrying into a new snapshot. The declared
    /// counts shrink to the used counts; committed rules never grow.
    pub(crate) fn draft(&self) -> RuleDraft {
        let mut counts = [0u32; DIMENSION_COUNT];
        for (slot, dim) in counts.iter_mut().zip(Dimension::ALL) {
            *slot = self.entries.used(dim);
        }
        RuleDraft {
            id: self.id,
            service: self.service.name().to_owned(),
            counts: DimensionCounts::new(counts),
            entries: self.entries.to_entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceKind, SessionCounter};

    fn service() -> Arc<Service> {
        Arc::new(Service::new(
            1,
            1,
            "web".to_owned(),
            0,
            ServiceKind::Proxy,
            SessionCounter::default(),
        ))
    }

    fn zone(unique_name: &str) -> Arc<Zone> {
        Arc::new(Zone::new(
            unique_name.to_owned(),
            unique_name.to_owned(),
            None,
            None,
            0,
        ))
    }

    fn pkt() -> PacketContext {
        PacketContext {
            ingress: crate::types::Iface::new("eth0", 1),
            egress: None,
            proto: 6,
            src: "10.1.2.3".parse().unwrap(),
            src_port: 40000,
            dst: "8.8.8.8".parse().unwrap(),
            dst_port: 80,
            reqids: Vec::new(),
        }
    }

    fn empty_rule() -> Rule {
        Rule {
            id: 1,
            service: service(),
            entries: RuleEntries::default(),
        }
    }

    #[test]
    fn all_wildcards_match_anything() {
        assert!(empty_rule().matches(&pkt(), &[], &[]));
    }

    #[test]
    fn ifname_alternatives_are_or_ed() {
        let mut rule = empty_rule();
        rule.entries.ifname = vec!["eth9".to_owned(), "eth0".to_owned()];
        assert!(rule.matches(&pkt(), &[], &[]));

        rule.entries.ifname = vec!["eth9".to_owned()];
        assert!(!rule.matches(&pkt(), &[], &[]));
    }

    #[test]
    fn dimensions_are_and_ed() {
        let mut rule = empty_rule();
        rule.entries.proto = vec![6];
        rule.entries.dst_port = vec![PortRange::new(443, 443).unwrap()];
        // proto matches, dst port does not
        assert!(!rule.matches(&pkt(), &[], &[]));

        rule.entries.dst_port = vec![PortRange::new(80, 80).unwrap()];
        assert!(rule.matches(&pkt(), &[], &[]));
    }

    #[test]
    fn subnet_dimension_is_family_aware() {
        let mut rule = empty_rule();
        rule.entries.src_subnet = vec!["10.0.0.0/8".parse().unwrap()];
        assert!(rule.matches(&pkt(), &[], &[]));

        let mut v6_pkt = pkt();
        v6_pkt.src = "2001:db8::1".parse().unwrap();
        // v4 subnet list cannot match a v6 source
        assert!(!rule.matches(&v6_pkt, &[], &[]));
    }

    #[test]
    fn zone_dimension_matches_anywhere_in_chain() {
        let office = zone("office");
        let internet = zone("internet");
        let mut rule = empty_rule();
        rule.entries.src_zone = vec![internet.clone()];

        // chain [office, internet]: listed ancestor matches
        assert!(rule.matches(&pkt(), &[office.clone(), internet.clone()], &[]));
        // chain [office] only: no match
        assert!(!rule.matches(&pkt(), &[office], &[]));
        // empty chain (no zone for address): no match
        assert!(!rule.matches(&pkt(), &[], &[]));
    }

    #[test]
    fn egress_dimensions_need_an_egress() {
        let mut rule = empty_rule();
        rule.entries.dst_ifname = vec!["eth1".to_owned()];
        assert!(!rule.matches(&pkt(), &[], &[]));

        let mut routed = pkt();
        routed.egress = Some(crate::types::Iface::new("eth1", 7));
        assert!(rule.matches(&routed, &[], &[]));
    }

    #[test]
    fn reqid_matches_on_intersection() {
        let mut rule = empty_rule();
        rule.entries.reqid = vec![7, 9];
        let mut ipsec = pkt();
        ipsec.reqids = vec![9];
        assert!(rule.matches(&ipsec, &[], &[]));
        ipsec.reqids = vec![8];
        assert!(!rule.matches(&ipsec, &[], &[]));
    }

    #[test]
    fn draft_capacity_enforced() {
        let mut counts = [0u32; DIMENSION_COUNT];
        counts[Dimension::Ifname.index()] = 1;
        let mut draft = RuleDraft {
            id: 1,
            service: "web".to_owned(),
            counts: DimensionCounts::new(counts),
            entries: Vec::new(),
        };
        draft
            .append_entries(vec![RuleEntry::Ifname("eth0".to_owned())])
            .unwrap();
        let err = draft
            .append_entries(vec![RuleEntry::Ifname("eth1".to_owned())])
            .unwrap_err();
        assert!(matches!(err, KzorpError::InvalidArgument(_)));
    }

    #[test]
    fn draft_rejects_duplicate_dimension_in_batch() {
        let mut counts = [0u32; DIMENSION_COUNT];
        counts[Dimension::Proto.index()] = 2;
        let mut draft = RuleDraft {
            id: 1,
            service: "web".to_owned(),
            counts: DimensionCounts::new(counts),
            entries: Vec::new(),
        };
        let err = draft
            .append_entries(vec![RuleEntry::Proto(6), RuleEntry::Proto(17)])
            .unwrap_err();
        assert!(matches!(err, KzorpError::InvalidArgument(_)));
    }

    #[test]
    fn rule_roundtrips_through_draft() {
        let office = zone("office");
        let mut rule = empty_rule();
        rule.entries.proto = vec![6];
        rule.entries.src_zone = vec![office];
        rule.entries.dst_port = vec![PortRange::new(80, 88).unwrap()];

        let draft = rule.draft();
        assert_eq!(draft.id, rule.id);
        assert_eq!(draft.service, "web");
        assert_eq!(draft.used(Dimension::Proto), 1);
        assert_eq!(draft.counts.get(Dimension::SrcZone), 1);
        assert!(
            draft
                .entries
                .contains(&RuleEntry::SrcZone("office".to_owned()))
        );
    }
}
