//! Administrative zones.
//!
//! A zone is a named region optionally backed by an IP subnet, with an
//! optional administrative parent. Parents form a forest; `depth` is the
//! distance from the root. Zone nodes are immutable: each snapshot rebuilds
//! its zone graph at commit so parent links always point at zones of the
//! same snapshot.

use std::sync::Arc;

use ipnet::IpNet;

/// One zone node, owned by exactly one snapshot.
#[derive(Debug)]
pub struct Zone {
    name: String,
    unique_name: String,
    subnet: Option<IpNet>,
    parent: Option<Arc<Zone>>,
    depth: u32,
}

impl Zone {
    pub(crate) fn new(
        name: String,
        unique_name: String,
        subnet: Option<IpNet>,
        parent: Option<Arc<Zone>>,
        depth: u32,
    ) -> Self {
        Self {
            name,
            unique_name,
            subnet,
            parent,
            depth,
        }
    }

    /// Display name. Not necessarily unique.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tenancy-unique name; the key for all lookups and references.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn subnet(&self) -> Option<IpNet> {
        self.subnet
    }

    pub fn parent(&self) -> Option<&Arc<Zone>> {
        self.parent.as_ref()
    }

    /// Distance from the root of this zone's tree; roots are 0.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Walk from this zone up to its root, most specific first.
    pub fn chain(self: &Arc<Self>) -> ZoneChain<'_> {
        ZoneChain { next: Some(self) }
    }
}

/// Iterator over a zone's admin-parent chain, including the zone itself.
pub struct ZoneChain<'a> {
    next: Option<&'a Arc<Zone>>,
}

impl<'a> Iterator for ZoneChain<'a> {
    type Item = &'a Arc<Zone>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent.as_ref();
        Some(current)
    }
}
