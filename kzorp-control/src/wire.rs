//! Conversions between wire messages and engine types.
//!
//! Requests come in as syntactically valid [`kzorp_proto`] messages; this
//! module applies the semantic checks (prefix masks, known enum codes,
//! family agreement) and produces engine parameters. Dump records go the
//! other way.

use std::net::IpAddr;

use ipnet::IpNet;

use kzorp::{
    Bind, DenyIpv4Method, DenyIpv6Method, Dimension, Iface, KzorpError, NatEntry, NatRange,
    PacketContext, PortRange, RouterTarget, Rule, RuleEntries, RuleEntry, Service, ServiceKind,
    ServiceParams, Verdict, ZoneParams, subnet_from_parts, validate_name,
};
use kzorp::zone::Zone;
use kzorp_proto::{
    AddBindMsg, AddRuleEntryMsg, AddRuleMsg, AddServiceMsg, AddServiceNatMsg, AddZoneMsg,
    QueryMsg, QueryReplyMsg, SVC_DENY, SVC_FORWARD, SVC_PROXY, WireNatRange, WireRuleEntry,
    WireSubnet,
};

pub(crate) fn status_code(error: &KzorpError) -> u8 {
    match error {
        KzorpError::InvalidArgument(_) => kzorp_proto::STATUS_INVALID_ARGUMENT,
        KzorpError::NotFound(_) => kzorp_proto::STATUS_NOT_FOUND,
        KzorpError::AlreadyExists(_) => kzorp_proto::STATUS_ALREADY_EXISTS,
        KzorpError::NoTransaction => kzorp_proto::STATUS_NO_TRANSACTION,
        KzorpError::TransactionConflict(_) => kzorp_proto::STATUS_TRANSACTION_CONFLICT,
        KzorpError::OutOfMemory => kzorp_proto::STATUS_OUT_OF_MEMORY,
        KzorpError::Internal(_) => kzorp_proto::STATUS_INTERNAL,
    }
}

// ---------------------------------------------------------------------------
// Requests in
// ---------------------------------------------------------------------------

pub(crate) fn zone_params(msg: AddZoneMsg) -> Result<ZoneParams, KzorpError> {
    let subnet = msg
        .subnet
        .map(|s| subnet_from_parts(s.addr, s.mask))
        .transpose()?;
    Ok(ZoneParams {
        name: msg.name,
        unique_name: msg.unique_name,
        subnet,
        parent: msg.parent,
    })
}

pub(crate) fn service_params(msg: AddServiceMsg) -> Result<ServiceParams, KzorpError> {
    let kind = match msg.svc_type {
        SVC_PROXY => ServiceKind::Proxy,
        SVC_FORWARD => ServiceKind::Forward {
            snat: Vec::new(),
            dnat: Vec::new(),
            router: msg
                .router
                .map(|(addr, port)| RouterTarget { addr, port }),
        },
        SVC_DENY => {
            let (v4, v6) = msg.deny.ok_or_else(|| {
                KzorpError::InvalidArgument("deny service needs deny methods".to_owned())
            })?;
            ServiceKind::Deny {
                ipv4: DenyIpv4Method::from_code(v4).ok_or_else(|| {
                    KzorpError::InvalidArgument(format!("unknown IPv4 deny method {v4}"))
                })?,
                ipv6: DenyIpv6Method::from_code(v6).ok_or_else(|| {
                    KzorpError::InvalidArgument(format!("unknown IPv6 deny method {v6}"))
                })?,
            }
        }
        other => {
            return Err(KzorpError::InvalidArgument(format!(
                "unknown service type {other}"
            )));
        }
    };
    Ok(ServiceParams {
        name: msg.name,
        flags: msg.flags,
        kind,
        session_count: msg.session_count,
    })
}

fn nat_range(range: &WireNatRange) -> Result<NatRange, KzorpError> {
    if range.min_addr > range.max_addr {
        return Err(KzorpError::InvalidArgument(format!(
            "inverted NAT address range: {}-{}",
            range.min_addr, range.max_addr
        )));
    }
    if range.min_port > range.max_port {
        return Err(KzorpError::InvalidArgument(format!(
            "inverted NAT port range: {}-{}",
            range.min_port, range.max_port
        )));
    }
    Ok(NatRange {
        flags: range.flags,
        min_addr: range.min_addr,
        max_addr: range.max_addr,
        min_port: range.min_port,
        max_port: range.max_port,
    })
}

pub(crate) fn nat_entry(msg: &AddServiceNatMsg) -> Result<NatEntry, KzorpError> {
    Ok(NatEntry {
        src: nat_range(&msg.src)?,
        dst: msg.dst.as_ref().map(nat_range).transpose()?,
        map: nat_range(&msg.map)?,
    })
}

fn subnet4(subnet: WireSubnet, what: &str) -> Result<ipnet::Ipv4Net, KzorpError> {
    match subnet_from_parts(subnet.addr, subnet.mask)? {
        IpNet::V4(net) => Ok(net),
        IpNet::V6(_) => Err(KzorpError::InvalidArgument(format!(
            "{what} must be an IPv4 subnet"
        ))),
    }
}

fn subnet6(subnet: WireSubnet, what: &str) -> Result<ipnet::Ipv6Net, KzorpError> {
    match subnet_from_parts(subnet.addr, subnet.mask)? {
        IpNet::V6(net) => Ok(net),
        IpNet::V4(_) => Err(KzorpError::InvalidArgument(format!(
            "{what} must be an IPv6 subnet"
        ))),
    }
}

pub(crate) fn rule_entry(wire: WireRuleEntry) -> Result<RuleEntry, KzorpError> {
    Ok(match wire {
        WireRuleEntry::Ifname(name) => {
            validate_name(&name)?;
            RuleEntry::Ifname(name)
        }
        WireRuleEntry::Ifgroup(group) => RuleEntry::Ifgroup(group),
        WireRuleEntry::Proto(proto) => RuleEntry::Proto(proto),
        WireRuleEntry::SrcPort(from, to) => RuleEntry::SrcPort(PortRange::new(from, to)?),
        WireRuleEntry::DstPort(from, to) => RuleEntry::DstPort(PortRange::new(from, to)?),
        WireRuleEntry::SrcSubnet(subnet) => {
            RuleEntry::SrcSubnet(subnet4(subnet, "source subnet")?)
        }
        WireRuleEntry::SrcSubnet6(subnet) => {
            RuleEntry::SrcSubnet6(subnet6(subnet, "source subnet")?)
        }
        WireRuleEntry::SrcZone(name) => RuleEntry::SrcZone(name),
        WireRuleEntry::DstSubnet(subnet) => {
            RuleEntry::DstSubnet(subnet4(subnet, "destination subnet")?)
        }
        WireRuleEntry::DstSubnet6(subnet) => {
            RuleEntry::DstSubnet6(subnet6(subnet, "destination subnet")?)
        }
        WireRuleEntry::DstZone(name) => RuleEntry::DstZone(name),
        WireRuleEntry::DstIfname(name) => {
            validate_name(&name)?;
            RuleEntry::DstIfname(name)
        }
        WireRuleEntry::DstIfgroup(group) => RuleEntry::DstIfgroup(group),
        WireRuleEntry::Reqid(reqid) => RuleEntry::Reqid(reqid),
    })
}

pub(crate) fn rule_entries(msg: AddRuleEntryMsg) -> Result<Vec<RuleEntry>, KzorpError> {
    msg.entries.into_iter().map(rule_entry).collect()
}

pub(crate) fn query_context(msg: &QueryMsg) -> PacketContext {
    PacketContext {
        ingress: Iface::new(msg.ifname.clone(), msg.ifgroup.unwrap_or(0)),
        egress: None,
        proto: msg.proto,
        src: msg.src,
        src_port: msg.src_port,
        dst: msg.dst,
        dst_port: msg.dst_port,
        reqids: msg.reqid.into_iter().collect(),
    }
}

pub(crate) fn query_reply(verdict: &Verdict) -> QueryReplyMsg {
    QueryReplyMsg {
        dispatcher: verdict.dispatcher.as_ref().map(|d| d.name().to_owned()),
        client_zone: verdict.client_zone.as_ref().map(|z| z.name().to_owned()),
        server_zone: verdict.server_zone.as_ref().map(|z| z.name().to_owned()),
        service: verdict.service.as_ref().map(|s| s.name().to_owned()),
    }
}

// ---------------------------------------------------------------------------
// Dump records out
// ---------------------------------------------------------------------------

pub(crate) fn subnet_wire(net: IpNet) -> WireSubnet {
    match net {
        IpNet::V4(n) => WireSubnet {
            addr: IpAddr::V4(n.network()),
            mask: IpAddr::V4(n.netmask()),
        },
        IpNet::V6(n) => WireSubnet {
            addr: IpAddr::V6(n.network()),
            mask: IpAddr::V6(n.netmask()),
        },
    }
}

pub(crate) fn zone_record(zone: &Zone) -> AddZoneMsg {
    AddZoneMsg {
        name: zone.name().to_owned(),
        unique_name: (zone.unique_name() != zone.name())
            .then(|| zone.unique_name().to_owned()),
        subnet: zone.subnet().map(subnet_wire),
        parent: zone.parent().map(|p| p.unique_name().to_owned()),
    }
}

fn svc_type_code(kind: &ServiceKind) -> u8 {
    match kind {
        ServiceKind::Proxy => SVC_PROXY,
        ServiceKind::Forward { .. } => SVC_FORWARD,
        ServiceKind::Deny { .. } => SVC_DENY,
    }
}

pub(crate) fn service_record(service: &Service) -> AddServiceMsg {
    let router = match service.kind() {
        ServiceKind::Forward {
            router: Some(target),
            ..
        } => Some((target.addr, target.port)),
        _ => None,
    };
    let deny = match service.kind() {
        ServiceKind::Deny { ipv4, ipv6 } => Some((ipv4.code(), ipv6.code())),
        _ => None,
    };
    AddServiceMsg {
        svc_type: svc_type_code(service.kind()),
        flags: service.flags(),
        name: service.name().to_owned(),
        session_count: Some(service.sessions().get()),
        router,
        deny,
    }
}

fn nat_range_wire(range: &NatRange) -> WireNatRange {
    WireNatRange {
        flags: range.flags,
        min_addr: range.min_addr,
        max_addr: range.max_addr,
        min_port: range.min_port,
        max_port: range.max_port,
    }
}

/// NAT records of a forward service, paired with the opcode to emit them
/// under.
pub(crate) fn service_nat_records(service: &Service) -> Vec<(u8, AddServiceNatMsg)> {
    let ServiceKind::Forward { snat, dnat, .. } = service.kind() else {
        return Vec::new();
    };
    let record = |entry: &NatEntry| AddServiceNatMsg {
        service: service.name().to_owned(),
        src: nat_range_wire(&entry.src),
        dst: entry.dst.as_ref().map(nat_range_wire),
        map: nat_range_wire(&entry.map),
    };
    snat.iter()
        .map(|e| (kzorp_proto::MSG_ADD_SERVICE_NAT_SRC, record(e)))
        .chain(
            dnat.iter()
                .map(|e| (kzorp_proto::MSG_ADD_SERVICE_NAT_DST, record(e))),
        )
        .collect()
}

pub(crate) fn rule_record(dispatcher: &str, rule: &Rule) -> AddRuleMsg {
    let mut counts = [0u32; kzorp_proto::DIMENSION_COUNT];
    for (slot, dim) in counts.iter_mut().zip(Dimension::ALL) {
        *slot = rule.entries.used(dim);
    }
    AddRuleMsg {
        dispatcher: dispatcher.to_owned(),
        rule_id: rule.id,
        service: rule.service.name().to_owned(),
        counts,
    }
}

fn wire_entry_at(entries: &RuleEntries, dim: Dimension, row: usize) -> Option<WireRuleEntry> {
    match dim {
        Dimension::Ifname => entries
            .ifname
            .get(row)
            .map(|v| WireRuleEntry::Ifname(v.clone())),
        Dimension::Ifgroup => entries.ifgroup.get(row).map(|v| WireRuleEntry::Ifgroup(*v)),
        Dimension::Proto => entries.proto.get(row).map(|v| WireRuleEntry::Proto(*v)),
        Dimension::SrcPort => entries
            .src_port
            .get(row)
            .map(|r| WireRuleEntry::SrcPort(r.from_port(), r.to_port())),
        Dimension::DstPort => entries
            .dst_port
            .get(row)
            .map(|r| WireRuleEntry::DstPort(r.from_port(), r.to_port())),
        Dimension::SrcSubnet => entries
            .src_subnet
            .get(row)
            .map(|n| WireRuleEntry::SrcSubnet(subnet_wire(IpNet::V4(*n)))),
        Dimension::SrcSubnet6 => entries
            .src_subnet6
            .get(row)
            .map(|n| WireRuleEntry::SrcSubnet6(subnet_wire(IpNet::V6(*n)))),
        Dimension::SrcZone => entries
            .src_zone
            .get(row)
            .map(|z| WireRuleEntry::SrcZone(z.unique_name().to_owned())),
        Dimension::DstSubnet => entries
            .dst_subnet
            .get(row)
            .map(|n| WireRuleEntry::DstSubnet(subnet_wire(IpNet::V4(*n)))),
        Dimension::DstSubnet6 => entries
            .dst_subnet6
            .get(row)
            .map(|n| WireRuleEntry::DstSubnet6(subnet_wire(IpNet::V6(*n)))),
        Dimension::DstZone => entries
            .dst_zone
            .get(row)
            .map(|z| WireRuleEntry::DstZone(z.unique_name().to_owned())),
        Dimension::DstIfname => entries
            .dst_ifname
            .get(row)
            .map(|v| WireRuleEntry::DstIfname(v.clone())),
        Dimension::DstIfgroup => entries
            .dst_ifgroup
            .get(row)
            .map(|v| WireRuleEntry::DstIfgroup(*v)),
        Dimension::Reqid => entries.reqid.get(row).map(|v| WireRuleEntry::Reqid(*v)),
    }
}

/// Rebuild the add_rule_entry frames for a rule: row `r` carries the
/// `r`-th alternative of every dimension that has one.
pub(crate) fn rule_entry_rows(dispatcher: &str, rule: &Rule) -> Vec<AddRuleEntryMsg> {
    let rows = Dimension::ALL
        .iter()
        .map(|dim| rule.entries.used(*dim))
        .max()
        .unwrap_or(0) as usize;
    (0..rows)
        .map(|row| AddRuleEntryMsg {
            dispatcher: dispatcher.to_owned(),
            rule_id: rule.id,
            entries: Dimension::ALL
                .iter()
                .filter_map(|dim| wire_entry_at(&rule.entries, *dim, row))
                .collect(),
        })
        .collect()
}

pub(crate) fn bind_record(instance: &str, bind: &Bind) -> AddBindMsg {
    AddBindMsg {
        instance: instance.to_owned(),
        proto: bind.proto.code(),
        addr: bind.addr,
        port: bind.port,
    }
}
