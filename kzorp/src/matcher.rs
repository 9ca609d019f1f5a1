//! Packet classification against a snapshot.
//!
//! Zone sets are derived from addresses by longest-prefix match plus the
//! admin-parent chain; dispatchers are then evaluated in registration
//! order, first match wins. "No rule matched" is a verdict, not an error.

use std::net::IpAddr;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::service::Service;
use crate::snapshot::Snapshot;
use crate::types::PacketContext;
use crate::zone::Zone;

/// The result of classifying one packet. All fields are absent when no
/// rule matched and the address resolved to no zone.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub rule_id: Option<u32>,
    /// Most specific zone covering the source address.
    pub client_zone: Option<Arc<Zone>>,
    /// Most specific zone covering the destination address.
    pub server_zone: Option<Arc<Zone>>,
    pub service: Option<Arc<Service>>,
}

impl Verdict {
    /// True if a rule selected a service.
    pub fn is_match(&self) -> bool {
        self.service.is_some()
    }
}

/// The packet's zone chain for an address: longest-prefix zone first, then
/// its admin parents up to the root. Empty if no zone covers the address.
pub fn zone_chain(snapshot: &Snapshot, addr: IpAddr) -> Vec<Arc<Zone>> {
    match snapshot.zone_lookup(addr) {
        Some(zone) => zone.chain().cloned().collect(),
        None => Vec::new(),
    }
}

/// Classify a packet: pick the first matching rule of the first matching
/// dispatcher.
pub fn classify(snapshot: &Snapshot, pkt: &PacketContext) -> Verdict {
    let src_zones = zone_chain(snapshot, pkt.src);
    let dst_zones = zone_chain(snapshot, pkt.dst);

    for dispatcher in snapshot.dispatchers() {
        if let Some(rule) = dispatcher.eval(pkt, &src_zones, &dst_zones) {
            return Verdict {
                dispatcher: Some(dispatcher.clone()),
                rule_id: Some(rule.id),
                client_zone: src_zones.first().cloned(),
                server_zone: dst_zones.first().cloned(),
                service: Some(rule.service.clone()),
            };
        }
    }

    Verdict {
        dispatcher: None,
        rule_id: None,
        client_zone: src_zones.first().cloned(),
        server_zone: dst_zones.first().cloned(),
        service: None,
    }
}
