//! Shared plain types: names, flow tuples, packet context, port ranges.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{KzorpError, Result};

/// Maximum length of an entity name, in bytes.
pub const NAME_MAX: usize = 127;

/// Identifies one control-plane peer (one connection).
pub type PeerId = u64;

/// Conntrack-zone tag partitioning the tracker's namespace. Distinct from a
/// kzorp zone.
pub type TenancyTag = u32;

/// Check an entity name: non-empty, at most [`NAME_MAX`] bytes.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(KzorpError::InvalidArgument("empty name".to_owned()));
    }
    if name.len() > NAME_MAX {
        return Err(KzorpError::InvalidArgument(format!(
            "name longer than {NAME_MAX} bytes: {} bytes",
            name.len()
        )));
    }
    Ok(())
}

/// A connection's 5-tuple as seen in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    pub proto: u8,
}

impl FlowTuple {
    /// The same flow seen from the other direction.
    pub fn reply(&self) -> FlowTuple {
        FlowTuple {
            src: self.dst,
            src_port: self.dst_port,
            dst: self.src,
            dst_port: self.src_port,
            proto: self.proto,
        }
    }
}

/// Ingress or egress interface identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iface {
    pub name: String,
    pub group: u32,
}

impl Iface {
    pub fn new(name: impl Into<String>, group: u32) -> Self {
        Self {
            name: name.into(),
            group,
        }
    }
}

/// Everything the matcher needs to know about a packet.
#[derive(Debug, Clone)]
pub struct PacketContext {
    pub ingress: Iface,
    /// Not always known (e.g. control-plane queries without a route lookup).
    pub egress: Option<Iface>,
    pub proto: u8,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    /// IPsec request ids attached to the packet; usually empty or one.
    pub reqids: Vec<u32>,
}

impl PacketContext {
    /// The packet's flow tuple, used to key the verdict cache.
    pub fn flow_tuple(&self) -> FlowTuple {
        FlowTuple {
            src: self.src,
            src_port: self.src_port,
            dst: self.dst,
            dst_port: self.dst_port,
            proto: self.proto,
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    from: u16,
    to: u16,
}

impl PortRange {
    pub fn new(from: u16, to: u16) -> Result<Self> {
        if from > to {
            return Err(KzorpError::InvalidArgument(format!(
                "inverted port range: {from}-{to}"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn from_port(&self) -> u16 {
        self.from
    }

    pub fn to_port(&self) -> u16 {
        self.to
    }

    pub fn contains(&self, port: u16) -> bool {
        self.from <= port && port <= self.to
    }
}

/// Build a subnet from an address and a full mask. The mask must be a prefix
/// mask (contiguous high bits) of the same family as the address.
pub fn subnet_from_parts(addr: IpAddr, mask: IpAddr) -> Result<IpNet> {
    match (addr, mask) {
        (IpAddr::V4(a), IpAddr::V4(m)) => {
            let prefix = ipnet::ipv4_mask_to_prefix(m)
                .map_err(|_| KzorpError::InvalidArgument(format!("not a prefix mask: {m}")))?;
            let net = Ipv4Net::new(a, prefix)
                .map_err(|_| KzorpError::InvalidArgument(format!("bad prefix length: {prefix}")))?;
            Ok(IpNet::V4(net.trunc()))
        }
        (IpAddr::V6(a), IpAddr::V6(m)) => {
            let prefix = ipnet::ipv6_mask_to_prefix(m)
                .map_err(|_| KzorpError::InvalidArgument(format!("not a prefix mask: {m}")))?;
            let net = Ipv6Net::new(a, prefix)
                .map_err(|_| KzorpError::InvalidArgument(format!("bad prefix length: {prefix}")))?;
            Ok(IpNet::V6(net.trunc()))
        }
        _ => Err(KzorpError::InvalidArgument(
            "subnet address and mask family mismatch".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_bounds() {
        assert!(validate_name("eth0").is_ok());
        assert!(validate_name(&"x".repeat(NAME_MAX)).is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(NAME_MAX + 1)).is_err());
    }

    #[test]
    fn flow_tuple_reply_swaps_endpoints() {
        let t = FlowTuple {
            src: "10.0.0.1".parse().unwrap(),
            src_port: 1000,
            dst: "10.0.0.2".parse().unwrap(),
            dst_port: 80,
            proto: 6,
        };
        let r = t.reply();
        assert_eq!(r.src, t.dst);
        assert_eq!(r.src_port, t.dst_port);
        assert_eq!(r.dst, t.src);
        assert_eq!(r.dst_port, t.src_port);
        assert_eq!(r.reply(), t);
    }

    #[test]
    fn port_range_contains() {
        let r = PortRange::new(1024, 2048).unwrap();
        assert!(r.contains(1024));
        assert!(r.contains(2048));
        assert!(!r.contains(1023));
        assert!(!r.contains(2049));
    }

    #[test]
    fn port_range_inverted_rejected() {
        assert!(PortRange::new(2, 1).is_err());
        assert!(PortRange::new(80, 80).is_ok());
    }

    #[test]
    fn subnet_from_prefix_mask() {
        let net = subnet_from_parts("10.1.2.3".parse().unwrap(), "255.0.0.0".parse().unwrap())
            .unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/8");

        let net = subnet_from_parts("2001:db8::1".parse().unwrap(), "ffff:ffff::".parse().unwrap())
            .unwrap();
        assert_eq!(net.to_string(), "2001:db8::/32");
    }

    #[test]
    fn subnet_from_non_prefix_mask_rejected() {
        let err = subnet_from_parts(
            "10.0.0.0".parse().unwrap(),
            "255.0.255.0".parse().unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, KzorpError::InvalidArgument(_)));
    }

    #[test]
    fn subnet_family_mismatch_rejected() {
        assert!(
            subnet_from_parts("10.0.0.0".parse().unwrap(), "ffff::".parse().unwrap()).is_err()
        );
    }
}
