//! Transaction staging.
//!
//! A transaction collects configuration operations from one control peer
//! on top of a base snapshot. Invariants are checked eagerly as operations
//! arrive; the merged view for name lookups is "staged entities first,
//! then the base unless the corresponding flush flag is set". The flush
//! flags behave as if they had been asserted at start time, so they must
//! arrive before any operation depending on them.
//!
//! Commit itself lives in the engine, which owns the snapshot pointer.

use std::sync::Arc;

use ipnet::IpNet;
use tracing::debug;

use crate::dispatcher::DispatcherDraft;
use crate::error::{KzorpError, Result};
use crate::instance::Bind;
use crate::rule::{DimensionCounts, RuleDraft, RuleEntry};
use crate::service::{SVC_FLAG_TRANSPARENT, SVC_PUBLIC_FLAGS, ServiceKind};
use crate::snapshot::{Snapshot, ZoneDraft};
use crate::types::{PeerId, validate_name};

/// Which entity class a flush operation clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    Zones,
    Services,
    Dispatchers,
    Binds,
}

/// Parameters for staging a zone.
#[derive(Debug, Clone)]
pub struct ZoneParams {
    pub name: String,
    /// Defaults to `name`.
    pub unique_name: Option<String>,
    pub subnet: Option<IpNet>,
    /// Unique name of the admin parent.
    pub parent: Option<String>,
}

/// Parameters for staging a service.
#[derive(Debug, Clone)]
pub struct ServiceParams {
    pub name: String,
    pub flags: u32,
    pub kind: ServiceKind,
    /// Initial session count; ignored when the counter migrates from a
    /// surviving base service.
    pub session_count: Option<u32>,
}

/// Which NAT list of a forward service an entry extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatDirection {
    Src,
    Dst,
}

#[derive(Debug, Clone)]
pub(crate) struct StagedService {
    pub name: String,
    pub flags: u32,
    pub kind: ServiceKind,
    pub initial_sessions: u32,
}

/// One open transaction.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub peer: PeerId,
    pub instance_id: u32,
    pub instance_name: String,
    pub cookie: u64,
    pub base: Arc<Snapshot>,
    pub flush_zones: bool,
    pub flush_services: bool,
    pub flush_dispatchers: bool,
    pub flush_binds: bool,
    pub zones: Vec<ZoneDraft>,
    pub services: Vec<StagedService>,
    pub dispatchers: Vec<DispatcherDraft>,
    pub binds: Vec<Bind>,
}

impl Transaction {
    pub fn new(
        peer: PeerId,
        instance_id: u32,
        instance_name: String,
        cookie: u64,
        base: Arc<Snapshot>,
    ) -> Self {
        Self {
            peer,
            instance_id,
            instance_name,
            cookie,
            base,
            flush_zones: false,
            flush_services: false,
            flush_dispatchers: false,
            flush_binds: false,
            zones: Vec::new(),
            services: Vec::new(),
            dispatchers: Vec::new(),
            binds: Vec::new(),
        }
    }

    pub fn set_flush(&mut self, kind: FlushKind) {
        debug!(instance = %self.instance_name, ?kind, "flush flag set");
        match kind {
            FlushKind::Zones => self.flush_zones = true,
            FlushKind::Services => self.flush_services = true,
            FlushKind::Dispatchers => self.flush_dispatchers = true,
            FlushKind::Binds => self.flush_binds = true,
        }
    }

    /// Merged-view zone lookup: staged first, base unless flushed.
    fn zone_in_merged(&self, unique_name: &str) -> bool {
        self.zones.iter().any(|z| z.unique_name == unique_name)
            || (!self.flush_zones && self.base.zone_by_name(unique_name).is_some())
    }

    /// Merged-view service lookup: staged first, base unless flushed.
    fn service_in_merged(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.name == name)
            || (!self.flush_services && self.base.service_by_name(name).is_some())
    }

    pub fn add_zone(&mut self, params: ZoneParams) -> Result<()> {
        validate_name(&params.name)?;
        if let Some(unique_name) = &params.unique_name {
            validate_name(unique_name)?;
        }
        if let Some(parent) = &params.parent {
            validate_name(parent)?;
        }
        let unique_name = params
            .unique_name
            .unwrap_or_else(|| params.name.clone());
        if self.zone_in_merged(&unique_name) {
            return Err(KzorpError::AlreadyExists(format!("zone {unique_name}")));
        }
        if let Some(parent) = &params.parent {
            if !self.zone_in_merged(parent) {
                return Err(KzorpError::NotFound(format!("parent zone {parent}")));
            }
        }
        debug!(zone = %unique_name, "zone staged");
        self.zones.push(ZoneDraft {
            name: params.name,
            unique_name,
            subnet: params.subnet,
            parent: params.parent,
        });
        Ok(())
    }

    pub fn add_service(&mut self, params: ServiceParams) -> Result<()> {
        validate_name(&params.name)?;
        if let ServiceKind::Forward { router, .. } = &params.kind {
            let transparent = params.flags & SVC_FLAG_TRANSPARENT != 0;
            if !transparent && router.is_none() {
                return Err(KzorpError::InvalidArgument(format!(
                    "non-transparent forward service {} needs a router target",
                    params.name
                )));
            }
        }
        if self.services.iter().any(|s| s.name == params.name) {
            return Err(KzorpError::AlreadyExists(format!("service {}", params.name)));
        }
        // A base service may only be re-added when this transaction flushes
        // the instance it belongs to.
        if let Some(base_svc) = self.base.service_by_name(&params.name) {
            if base_svc.instance_id() != self.instance_id || !self.flush_services {
                return Err(KzorpError::AlreadyExists(format!("service {}", params.name)));
            }
        }
        debug!(service = %params.name, kind = params.kind.type_name(), "service staged");
        self.services.push(StagedService {
            name: params.name,
            flags: params.flags & SVC_PUBLIC_FLAGS,
            kind: params.kind,
            initial_sessions: params.session_count.unwrap_or(0),
        });
        Ok(())
    }

    /// NAT entries attach to services staged in this transaction only.
    pub fn add_service_nat(
        &mut self,
        service: &str,
        direction: NatDirection,
        entry: crate::service::NatEntry,
    ) -> Result<()> {
        let staged = self
            .services
            .iter_mut()
            .find(|s| s.name == service)
            .ok_or_else(|| KzorpError::NotFound(format!("service {service}")))?;
        match &mut staged.kind {
            ServiceKind::Forward { snat, dnat, .. } => {
                match direction {
                    NatDirection::Src => snat.push(entry),
                    NatDirection::Dst => dnat.push(entry),
                }
                Ok(())
            }
            _ => Err(KzorpError::InvalidArgument(format!(
                "service {service} is not a forward service"
            ))),
        }
    }

    pub fn add_dispatcher(&mut self, name: &str, alloc_rules: u32) -> Result<()> {
        validate_name(name)?;
        if self.dispatchers.iter().any(|d| d.name == name) {
            return Err(KzorpError::AlreadyExists(format!("dispatcher {name}")));
        }
        if let Some(base_dispatcher) = self.base.dispatcher_by_name(name) {
            let flushed =
                self.flush_dispatchers && base_dispatcher.instance_id() == self.instance_id;
            if !flushed {
                return Err(KzorpError::AlreadyExists(format!("dispatcher {name}")));
            }
        }
        debug!(dispatcher = %name, alloc_rules, "dispatcher staged");
        self.dispatchers.push(DispatcherDraft {
            name: name.to_owned(),
            instance_id: self.instance_id,
            alloc_rules,
            rules: Vec::new(),
        });
        Ok(())
    }

    /// Rules attach to dispatchers staged in this transaction only, with
    /// strictly increasing ids.
    pub fn add_rule(
        &mut self,
        dispatcher: &str,
        rule_id: u32,
        service: &str,
        counts: DimensionCounts,
    ) -> Result<()> {
        if !self.service_in_merged(service) {
            return Err(KzorpError::NotFound(format!("service {service}")));
        }
        let dpt = self
            .dispatchers
            .iter_mut()
            .find(|d| d.name == dispatcher)
            .ok_or_else(|| KzorpError::NotFound(format!("dispatcher {dispatcher}")))?;
        if dpt.rules.len() as u32 >= dpt.alloc_rules {
            return Err(KzorpError::InvalidArgument(format!(
                "dispatcher {dispatcher} has no free rule slots ({} allocated)",
                dpt.alloc_rules
            )));
        }
        if let Some(last) = dpt.last_rule_id() {
            if rule_id == last {
                return Err(KzorpError::AlreadyExists(format!(
                    "rule {rule_id} in dispatcher {dispatcher}"
                )));
            }
            if rule_id < last {
                return Err(KzorpError::InvalidArgument(format!(
                    "rule ids must be strictly increasing: {rule_id} after {last}"
                )));
            }
        }
        debug!(dispatcher = %dispatcher, rule = rule_id, service = %service, "rule staged");
        dpt.rules.push(RuleDraft {
            id: rule_id,
            service: service.to_owned(),
            counts,
            entries: Vec::new(),
        });
        Ok(())
    }

    pub fn add_rule_entry(
        &mut self,
        dispatcher: &str,
        rule_id: u32,
        entries: Vec<RuleEntry>,
    ) -> Result<()> {
        // Zone references must resolve in the merged view at submission
        // time; final resolution happens again at commit.
        for entry in &entries {
            if let RuleEntry::SrcZone(name) | RuleEntry::DstZone(name) = entry {
                if !self.zone_in_merged(name) {
                    return Err(KzorpError::NotFound(format!("zone {name}")));
                }
            }
        }
        let dpt = self
            .dispatchers
            .iter_mut()
            .find(|d| d.name == dispatcher)
            .ok_or_else(|| KzorpError::NotFound(format!("dispatcher {dispatcher}")))?;
        let rule = dpt.rule_mut(rule_id).ok_or_else(|| {
            KzorpError::NotFound(format!("rule {rule_id} in dispatcher {dispatcher}"))
        })?;
        rule.append_entries(entries)
    }

    /// Stage a bind. Conflicts against the instance's live binds are the
    /// engine's business; this only rejects duplicates within the
    /// transaction.
    pub fn stage_bind(&mut self, bind: Bind) -> Result<()> {
        if self.binds.iter().any(|b| b.same_endpoint(&bind)) {
            return Err(KzorpError::AlreadyExists(format!(
                "bind {}:{}",
                bind.addr, bind.port
            )));
        }
        self.binds.push(bind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::BindProto;
    use crate::snapshot::SnapshotBuilder;

    fn empty_tx() -> Transaction {
        Transaction::new(1, 1, "inst".to_owned(), 0, Arc::new(Snapshot::empty()))
    }

    fn tx_with_base_service(instance_id: u32) -> Transaction {
        let mut b = SnapshotBuilder::new(1);
        b.services.push(Arc::new(crate::service::Service::new(
            7,
            instance_id,
            "web".to_owned(),
            0,
            ServiceKind::Proxy,
            crate::service::SessionCounter::default(),
        )));
        Transaction::new(1, 1, "inst".to_owned(), 0, Arc::new(b.freeze().unwrap()))
    }

    fn zone(name: &str, parent: Option<&str>) -> ZoneParams {
        ZoneParams {
            name: name.to_owned(),
            unique_name: None,
            subnet: None,
            parent: parent.map(str::to_owned),
        }
    }

    #[test]
    fn duplicate_zone_rejected() {
        let mut tx = empty_tx();
        tx.add_zone(zone("a", None)).unwrap();
        assert!(matches!(
            tx.add_zone(zone("a", None)).unwrap_err(),
            KzorpError::AlreadyExists(_)
        ));
    }

    #[test]
    fn zone_parent_must_resolve() {
        let mut tx = empty_tx();
        assert!(matches!(
            tx.add_zone(zone("child", Some("missing"))).unwrap_err(),
            KzorpError::NotFound(_)
        ));
        tx.add_zone(zone("parent", None)).unwrap();
        tx.add_zone(zone("child", Some("parent"))).unwrap();
    }

    #[test]
    fn service_name_conflicts_with_base_unless_flushed() {
        let mut tx = tx_with_base_service(1);
        let params = ServiceParams {
            name: "web".to_owned(),
            flags: 0,
            kind: ServiceKind::Proxy,
            session_count: None,
        };
        assert!(matches!(
            tx.add_service(params.clone()).unwrap_err(),
            KzorpError::AlreadyExists(_)
        ));

        tx.set_flush(FlushKind::Services);
        tx.add_service(params).unwrap();
    }

    #[test]
    fn service_of_other_instance_conflicts_even_with_flush() {
        let mut tx = tx_with_base_service(2);
        tx.set_flush(FlushKind::Services);
        let params = ServiceParams {
            name: "web".to_owned(),
            flags: 0,
            kind: ServiceKind::Proxy,
            session_count: None,
        };
        assert!(matches!(
            tx.add_service(params).unwrap_err(),
            KzorpError::AlreadyExists(_)
        ));
    }

    #[test]
    fn non_transparent_forward_needs_router() {
        let mut tx = empty_tx();
        let params = ServiceParams {
            name: "fwd".to_owned(),
            flags: 0,
            kind: ServiceKind::Forward {
                snat: Vec::new(),
                dnat: Vec::new(),
                router: None,
            },
            session_count: None,
        };
        assert!(matches!(
            tx.add_service(params).unwrap_err(),
            KzorpError::InvalidArgument(_)
        ));
    }

    #[test]
    fn nat_only_on_staged_forward_services() {
        let mut tx = empty_tx();
        let entry = crate::service::NatEntry {
            src: crate::service::NatRange {
                flags: 0,
                min_addr: "10.0.0.1".parse().unwrap(),
                max_addr: "10.0.0.9".parse().unwrap(),
                min_port: 0,
                max_port: 0,
            },
            dst: None,
            map: crate::service::NatRange {
                flags: 0,
                min_addr: "192.0.2.1".parse().unwrap(),
                max_addr: "192.0.2.1".parse().unwrap(),
                min_port: 0,
                max_port: 0,
            },
        };
        assert!(matches!(
            tx.add_service_nat("missing", NatDirection::Src, entry.clone())
                .unwrap_err(),
            KzorpError::NotFound(_)
        ));

        tx.add_service(ServiceParams {
            name: "p".to_owned(),
            flags: 0,
            kind: ServiceKind::Proxy,
            session_count: None,
        })
        .unwrap();
        assert!(matches!(
            tx.add_service_nat("p", NatDirection::Src, entry.clone())
                .unwrap_err(),
            KzorpError::InvalidArgument(_)
        ));

        tx.add_service(ServiceParams {
            name: "fwd".to_owned(),
            flags: SVC_FLAG_TRANSPARENT,
            kind: ServiceKind::Forward {
                snat: Vec::new(),
                dnat: Vec::new(),
                router: None,
            },
            session_count: None,
        })
        .unwrap();
        tx.add_service_nat("fwd", NatDirection::Src, entry.clone())
            .unwrap();
        tx.add_service_nat("fwd", NatDirection::Dst, entry).unwrap();
    }

    #[test]
    fn rule_ids_strictly_increasing() {
        let mut tx = empty_tx();
        tx.add_service(ServiceParams {
            name: "web".to_owned(),
            flags: 0,
            kind: ServiceKind::Proxy,
            session_count: None,
        })
        .unwrap();
        tx.add_dispatcher("d", 3).unwrap();
        tx.add_rule("d", 5, "web", DimensionCounts::default()).unwrap();

        assert!(matches!(
            tx.add_rule("d", 5, "web", DimensionCounts::default())
                .unwrap_err(),
            KzorpError::AlreadyExists(_)
        ));
        assert!(matches!(
            tx.add_rule("d", 4, "web", DimensionCounts::default())
                .unwrap_err(),
            KzorpError::InvalidArgument(_)
        ));
        tx.add_rule("d", 6, "web", DimensionCounts::default()).unwrap();
    }

    #[test]
    fn rule_slots_bounded_by_allocation() {
        let mut tx = empty_tx();
        tx.add_service(ServiceParams {
            name: "web".to_owned(),
            flags: 0,
            kind: ServiceKind::Proxy,
            session_count: None,
        })
        .unwrap();
        tx.add_dispatcher("d", 1).unwrap();
        tx.add_rule("d", 1, "web", DimensionCounts::default()).unwrap();
        assert!(matches!(
            tx.add_rule("d", 2, "web", DimensionCounts::default())
                .unwrap_err(),
            KzorpError::InvalidArgument(_)
        ));
    }

    #[test]
    fn rule_requires_resolvable_service() {
        let mut tx = empty_tx();
        tx.add_dispatcher("d", 1).unwrap();
        assert!(matches!(
            tx.add_rule("d", 1, "missing", DimensionCounts::default())
                .unwrap_err(),
            KzorpError::NotFound(_)
        ));
    }

    #[test]
    fn rule_entry_zone_must_resolve() {
        let mut tx = empty_tx();
        tx.add_service(ServiceParams {
            name: "web".to_owned(),
            flags: 0,
            kind: ServiceKind::Proxy,
            session_count: None,
        })
        .unwrap();
        tx.add_dispatcher("d", 1).unwrap();
        let mut counts = [0u32; crate::rule::DIMENSION_COUNT];
        counts[crate::rule::Dimension::SrcZone.index()] = 1;
        tx.add_rule("d", 1, "web", DimensionCounts::new(counts))
            .unwrap();
        assert!(matches!(
            tx.add_rule_entry("d", 1, vec![RuleEntry::SrcZone("nowhere".to_owned())])
                .unwrap_err(),
            KzorpError::NotFound(_)
        ));
    }

    #[test]
    fn staged_bind_duplicates_rejected() {
        let mut tx = empty_tx();
        let bind = Bind {
            proto: BindProto::Tcp,
            addr: "127.0.0.1".parse().unwrap(),
            port: 50080,
            owner: 1,
        };
        tx.stage_bind(bind.clone()).unwrap();
        assert!(matches!(
            tx.stage_bind(bind).unwrap_err(),
            KzorpError::AlreadyExists(_)
        ));
    }
}
