//! Immutable configuration snapshots.
//!
//! A snapshot owns the full entity set plus the lookup indexes built at
//! freeze time: unique-name maps and per-family radix trees for the zone
//! address lookup. Snapshots are shared by readers without locks and
//! replaced wholesale; a retired snapshot is freed when the last reference
//! (reader or verdict record) drops.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::PrefixMap;
use tracing::warn;

use crate::dispatcher::{Dispatcher, DispatcherDraft};
use crate::error::{KzorpError, Result};
use crate::rule::{Rule, RuleEntries, RuleEntry};
use crate::service::Service;
use crate::zone::Zone;

/// A zone not yet consolidated into a snapshot: the parent is still a
/// unique name.
#[derive(Debug, Clone)]
pub(crate) struct ZoneDraft {
    pub name: String,
    pub unique_name: String,
    pub subnet: Option<IpNet>,
    pub parent: Option<String>,
}

impl ZoneDraft {
    pub fn from_zone(zone: &Zone) -> Self {
        Self {
            name: zone.name().to_owned(),
            unique_name: zone.unique_name().to_owned(),
            subnet: zone.subnet(),
            parent: zone.parent().map(|p| p.unique_name().to_owned()),
        }
    }
}

/// The frozen, atomically published configuration.
pub struct Snapshot {
    generation: u64,
    zones: Vec<Arc<Zone>>,
    zones_by_name: HashMap<String, Arc<Zone>>,
    zone_tree4: PrefixMap<Ipv4Net, Arc<Zone>>,
    zone_tree6: PrefixMap<Ipv6Net, Arc<Zone>>,
    services: Vec<Arc<Service>>,
    services_by_name: HashMap<String, Arc<Service>>,
    dispatchers: Vec<Arc<Dispatcher>>,
    dispatchers_by_name: HashMap<String, Arc<Dispatcher>>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("generation", &self.generation)
            .field("zones", &self.zones.len())
            .field("services", &self.services.len())
            .field("dispatchers", &self.dispatchers.len())
            .finish()
    }
}

impl Snapshot {
    /// The initial, entity-free snapshot.
    pub(crate) fn empty() -> Self {
        Self {
            generation: 0,
            zones: Vec::new(),
            zones_by_name: HashMap::new(),
            zone_tree4: PrefixMap::new(),
            zone_tree6: PrefixMap::new(),
            services: Vec::new(),
            services_by_name: HashMap::new(),
            dispatchers: Vec::new(),
            dispatchers_by_name: HashMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Zones in registration order.
    pub fn zones(&self) -> &[Arc<Zone>] {
        &self.zones
    }

    pub fn zone_by_name(&self, unique_name: &str) -> Option<&Arc<Zone>> {
        self.zones_by_name.get(unique_name)
    }

    /// Most specific zone whose subnet covers `addr`.
    pub fn zone_lookup(&self, addr: IpAddr) -> Option<&Arc<Zone>> {
        match addr {
            IpAddr::V4(a) => self.zone_tree4.get_lpm(&Ipv4Net::from(a)).map(|(_, z)| z),
            IpAddr::V6(a) => self.zone_tree6.get_lpm(&Ipv6Net::from(a)).map(|(_, z)| z),
        }
    }

    /// Services in registration order.
    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    pub fn service_by_name(&self, name: &str) -> Option<&Arc<Service>> {
        self.services_by_name.get(name)
    }

    /// Dispatchers in registration order, which is also their evaluation
    /// order.
    pub fn dispatchers(&self) -> &[Arc<Dispatcher>] {
        &self.dispatchers
    }

    pub fn dispatcher_by_name(&self, name: &str) -> Option<&Arc<Dispatcher>> {
        self.dispatchers_by_name.get(name)
    }
}

/// Accumulates the next snapshot's contents, then freezes them in one step:
/// zone forest consolidation, dispatcher relink, index build.
#[derive(Debug)]
pub(crate) struct SnapshotBuilder {
    pub generation: u64,
    pub zones: Vec<ZoneDraft>,
    pub services: Vec<Arc<Service>>,
    pub dispatchers: Vec<DispatcherDraft>,
}

impl SnapshotBuilder {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            zones: Vec::new(),
            services: Vec::new(),
            dispatchers: Vec::new(),
        }
    }

    pub fn freeze(self) -> Result<Snapshot> {
        let SnapshotBuilder {
            generation,
            zones: zone_drafts,
            services,
            dispatchers: dispatcher_drafts,
        } = self;

        let (zones, zones_by_name) = consolidate_zones(&zone_drafts)?;

        let mut zone_tree4 = PrefixMap::new();
        let mut zone_tree6 = PrefixMap::new();
        for zone in &zones {
            match zone.subnet() {
                Some(IpNet::V4(net)) => {
                    if zone_tree4.insert(net.trunc(), zone.clone()).is_some() {
                        return Err(KzorpError::AlreadyExists(format!("zone subnet {net}")));
                    }
                }
                Some(IpNet::V6(net)) => {
                    if zone_tree6.insert(net.trunc(), zone.clone()).is_some() {
                        return Err(KzorpError::AlreadyExists(format!("zone subnet {net}")));
                    }
                }
                None => {}
            }
        }

        let mut services_by_name = HashMap::with_capacity(services.len());
        for svc in &services {
            if services_by_name
                .insert(svc.name().to_owned(), svc.clone())
                .is_some()
            {
                return Err(KzorpError::AlreadyExists(format!("service {}", svc.name())));
            }
        }

        let mut dispatchers = Vec::with_capacity(dispatcher_drafts.len());
        let mut dispatchers_by_name = HashMap::with_capacity(dispatcher_drafts.len());
        for draft in dispatcher_drafts {
            let dispatcher = Arc::new(relink_dispatcher(draft, &zones_by_name, &services_by_name));
            if dispatchers_by_name
                .insert(dispatcher.name().to_owned(), dispatcher.clone())
                .is_some()
            {
                return Err(KzorpError::AlreadyExists(format!(
                    "dispatcher {}",
                    dispatcher.name()
                )));
            }
            dispatchers.push(dispatcher);
        }

        Ok(Snapshot {
            generation,
            zones,
            zones_by_name,
            zone_tree4,
            zone_tree6,
            services,
            services_by_name,
            dispatchers,
            dispatchers_by_name,
        })
    }
}

/// Rebuild the zone forest: resolve parents by unique name, recompute
/// depths, keep registration order. An unresolved parent aborts the commit.
fn consolidate_zones(
    drafts: &[ZoneDraft],
) -> Result<(Vec<Arc<Zone>>, HashMap<String, Arc<Zone>>)> {
    let mut draft_index: HashMap<&str, usize> = HashMap::with_capacity(drafts.len());
    for (i, draft) in drafts.iter().enumerate() {
        if draft_index.insert(draft.unique_name.as_str(), i).is_some() {
            return Err(KzorpError::AlreadyExists(format!(
                "zone {}",
                draft.unique_name
            )));
        }
    }

    // Depth of each draft, walking the parent chain through the draft set.
    // The walk is bounded so a corrupt parent graph cannot loop forever.
    let mut depths: Vec<u32> = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let mut depth = 0u32;
        let mut cursor = draft.parent.as_deref();
        while let Some(parent_name) = cursor {
            let parent = draft_index
                .get(parent_name)
                .and_then(|i| drafts.get(*i))
                .ok_or_else(|| {
                    KzorpError::Internal(format!("admin parent not found: {parent_name}"))
                })?;
            depth += 1;
            if depth as usize > drafts.len() {
                return Err(KzorpError::Internal("zone parent graph has a cycle".to_owned()));
            }
            cursor = parent.parent.as_deref();
        }
        depths.push(depth);
    }

    // Build parents before children, but keep registration order in the
    // resulting list.
    let mut order: Vec<usize> = (0..drafts.len()).collect();
    order.sort_by_key(|i| depths.get(*i).copied().unwrap_or(0));

    let mut zones_by_name: HashMap<String, Arc<Zone>> = HashMap::with_capacity(drafts.len());
    let mut built: Vec<Option<Arc<Zone>>> = vec![None; drafts.len()];
    for i in order {
        let draft = drafts
            .get(i)
            .ok_or_else(|| KzorpError::Internal("zone build order out of range".to_owned()))?;
        let depth = depths.get(i).copied().unwrap_or(0);
        let parent = match &draft.parent {
            Some(parent_name) => Some(zones_by_name.get(parent_name).cloned().ok_or_else(
                || KzorpError::Internal(format!("admin parent not built: {parent_name}")),
            )?),
            None => None,
        };
        let zone = Arc::new(Zone::new(
            draft.name.clone(),
            draft.unique_name.clone(),
            draft.subnet,
            parent,
            depth,
        ));
        zones_by_name.insert(draft.unique_name.clone(), zone.clone());
        if let Some(slot) = built.get_mut(i) {
            *slot = Some(zone);
        }
    }

    Ok((built.into_iter().flatten().collect(), zones_by_name))
}

/// Resolve a dispatcher draft's names into references of the new snapshot.
/// A rule whose service vanished is dropped; a zone alternative that
/// vanished is dropped from its dimension list.
fn relink_dispatcher(
    draft: DispatcherDraft,
    zones: &HashMap<String, Arc<Zone>>,
    services: &HashMap<String, Arc<Service>>,
) -> Dispatcher {
    let mut rules = Vec::with_capacity(draft.rules.len());
    for rule_draft in draft.rules {
        let Some(service) = services.get(&rule_draft.service) else {
            warn!(
                dispatcher = %draft.name,
                rule = rule_draft.id,
                service = %rule_draft.service,
                "dropping rule: service no longer resolvable"
            );
            continue;
        };
        let mut entries = RuleEntries::default();
        for entry in rule_draft.entries {
            match entry {
                RuleEntry::Ifname(v) => entries.ifname.push(v),
                RuleEntry::Ifgroup(v) => entries.ifgroup.push(v),
                RuleEntry::Proto(v) => entries.proto.push(v),
                RuleEntry::SrcPort(v) => entries.src_port.push(v),
                RuleEntry::DstPort(v) => entries.dst_port.push(v),
                RuleEntry::SrcSubnet(v) => entries.src_subnet.push(v),
                RuleEntry::SrcSubnet6(v) => entries.src_subnet6.push(v),
                RuleEntry::SrcZone(name) => match zones.get(&name) {
                    Some(zone) => entries.src_zone.push(zone.clone()),
                    None => warn!(
                        dispatcher = %draft.name,
                        rule = rule_draft.id,
                        zone = %name,
                        "dropping source zone alternative: zone no longer resolvable"
                    ),
                },
                RuleEntry::DstSubnet(v) => entries.dst_subnet.push(v),
                RuleEntry::DstSubnet6(v) => entries.dst_subnet6.push(v),
                RuleEntry::DstZone(name) => match zones.get(&name) {
                    Some(zone) => entries.dst_zone.push(zone.clone()),
                    None => warn!(
                        dispatcher = %draft.name,
                        rule = rule_draft.id,
                        zone = %name,
                        "dropping destination zone alternative: zone no longer resolvable"
                    ),
                },
                RuleEntry::DstIfname(v) => entries.dst_ifname.push(v),
                RuleEntry::DstIfgroup(v) => entries.dst_ifgroup.push(v),
                RuleEntry::Reqid(v) => entries.reqid.push(v),
            }
        }
        rules.push(Rule {
            id: rule_draft.id,
            service: service.clone(),
            entries,
        });
    }
    Dispatcher::new(draft.name, draft.instance_id, draft.alloc_rules, rules)
}
