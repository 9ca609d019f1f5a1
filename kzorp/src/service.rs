//! Services: the action end of a classification.
//!
//! A service is what happens to a matched connection: hand off to a proxy,
//! forward (optionally through NAT), or deny with a per-family method. NAT
//! ranges are carried as an output shape only; applying them is the packet
//! filter's business.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Proxy sessions are started on behalf of the client (transparent mode).
pub const SVC_FLAG_TRANSPARENT: u32 = 0x01;
/// Forge the client address when connecting out.
pub const SVC_FLAG_FORGE_ADDR: u32 = 0x02;
/// Log session starts.
pub const SVC_FLAG_LOGGING: u32 = 0x04;
/// Flag bits accepted from and shown to the control plane.
pub const SVC_PUBLIC_FLAGS: u32 = SVC_FLAG_TRANSPARENT | SVC_FLAG_FORGE_ADDR | SVC_FLAG_LOGGING;

/// NAT range maps addresses.
pub const NAT_RANGE_MAP_IPS: u32 = 0x01;
/// NAT range maps ports too.
pub const NAT_RANGE_PROTO_SPECIFIED: u32 = 0x02;

/// Live session counter, shared between the incarnations of a service that
/// survive a reconfiguration under the same name.
#[derive(Debug, Clone, Default)]
pub struct SessionCounter(Arc<AtomicU32>);

impl SessionCounter {
    pub fn new(initial: u32) -> Self {
        Self(Arc::new(AtomicU32::new(initial)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decrement(&self) {
        // Saturate at zero; a stray double-destroy must not wrap.
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// True if both handles update the same underlying counter.
    pub fn shares_with(&self, other: &SessionCounter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// How to reject IPv4 traffic for a deny service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyIpv4Method {
    DropPacket,
    TcpReset,
    IcmpNetUnreachable,
    IcmpHostUnreachable,
    IcmpProtoUnreachable,
    IcmpPortUnreachable,
    IcmpAdminProhibited,
}

impl DenyIpv4Method {
    pub fn code(self) -> u8 {
        match self {
            Self::DropPacket => 0,
            Self::TcpReset => 1,
            Self::IcmpNetUnreachable => 2,
            Self::IcmpHostUnreachable => 3,
            Self::IcmpProtoUnreachable => 4,
            Self::IcmpPortUnreachable => 5,
            Self::IcmpAdminProhibited => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::DropPacket),
            1 => Some(Self::TcpReset),
            2 => Some(Self::IcmpNetUnreachable),
            3 => Some(Self::IcmpHostUnreachable),
            4 => Some(Self::IcmpProtoUnreachable),
            5 => Some(Self::IcmpPortUnreachable),
            6 => Some(Self::IcmpAdminProhibited),
            _ => None,
        }
    }
}

/// How to reject IPv6 traffic for a deny service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyIpv6Method {
    DropPacket,
    TcpReset,
    IcmpNoRoute,
    IcmpAdminProhibited,
    IcmpAddrUnreachable,
    IcmpPortUnreachable,
}

impl DenyIpv6Method {
    pub fn code(self) -> u8 {
        match self {
            Self::DropPacket => 0,
            Self::TcpReset => 1,
            Self::IcmpNoRoute => 2,
            Self::IcmpAdminProhibited => 3,
            Self::IcmpAddrUnreachable => 4,
            Self::IcmpPortUnreachable => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::DropPacket),
            1 => Some(Self::TcpReset),
            2 => Some(Self::IcmpNoRoute),
            3 => Some(Self::IcmpAdminProhibited),
            4 => Some(Self::IcmpAddrUnreachable),
            5 => Some(Self::IcmpPortUnreachable),
            _ => None,
        }
    }
}

/// One NAT address/port range (IPv4 only, as in the packet filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatRange {
    pub flags: u32,
    pub min_addr: Ipv4Addr,
    pub max_addr: Ipv4Addr,
    pub min_port: u16,
    pub max_port: u16,
}

/// One SNAT or DNAT mapping: match `src` (and `dst` if present), translate
/// into `map`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatEntry {
    pub src: NatRange,
    pub dst: Option<NatRange>,
    pub map: NatRange,
}

/// Router target for non-transparent forward services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterTarget {
    pub addr: IpAddr,
    pub port: u16,
}

/// The service variants.
#[derive(Debug, Clone)]
pub enum ServiceKind {
    /// Hand the connection to a user-space proxy.
    Proxy,
    /// Forward packets, with optional NAT and router target.
    Forward {
        snat: Vec<NatEntry>,
        dnat: Vec<NatEntry>,
        router: Option<RouterTarget>,
    },
    /// Drop or reject with a per-family method.
    Deny {
        ipv4: DenyIpv4Method,
        ipv6: DenyIpv6Method,
    },
}

impl ServiceKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Forward { .. } => "forward",
            Self::Deny { .. } => "deny",
        }
    }
}

/// A named action endpoint, owned by snapshots via `Arc`.
#[derive(Debug)]
pub struct Service {
    id: u32,
    instance_id: u32,
    name: String,
    flags: u32,
    kind: ServiceKind,
    sessions: SessionCounter,
}

impl Service {
    pub(crate) fn new(
        id: u32,
        instance_id: u32,
        name: String,
        flags: u32,
        kind: ServiceKind,
        sessions: SessionCounter,
    ) -> Self {
        Self {
            id,
            instance_id,
            name,
            flags: flags & SVC_PUBLIC_FLAGS,
            kind,
            sessions,
        }
    }

    /// Stable id, inherited across reconfigurations when the name survives.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_transparent(&self) -> bool {
        self.flags & SVC_FLAG_TRANSPARENT != 0
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub fn sessions(&self) -> &SessionCounter {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_counter_saturates_at_zero() {
        let c = SessionCounter::new(1);
        c.decrement();
        assert_eq!(c.get(), 0);
        c.decrement();
        assert_eq!(c.get(), 0);
        c.increment();
        assert_eq!(c.get(), 1);
    }

    #[test]
    fn session_counter_sharing() {
        let a = SessionCounter::new(5);
        let b = a.clone();
        let c = SessionCounter::new(5);
        assert!(a.shares_with(&b));
        assert!(!a.shares_with(&c));
        b.increment();
        assert_eq!(a.get(), 6);
    }

    #[test]
    fn deny_method_codes_roundtrip() {
        for code in 0..=6 {
            assert_eq!(DenyIpv4Method::from_code(code).unwrap().code(), code);
        }
        assert!(DenyIpv4Method::from_code(7).is_none());
        for code in 0..=5 {
            assert_eq!(DenyIpv6Method::from_code(code).unwrap().code(), code);
        }
        assert!(DenyIpv6Method::from_code(6).is_none());
    }

    #[test]
    fn service_masks_private_flags() {
        let svc = Service::new(
            1,
            1,
            "web".to_owned(),
            0xFFFF_FFFF,
            ServiceKind::Proxy,
            SessionCounter::default(),
        );
        assert_eq!(svc.flags(), SVC_PUBLIC_FLAGS);
        assert!(svc.is_transparent());
    }
}
