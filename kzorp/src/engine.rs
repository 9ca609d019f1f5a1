//! The engine bundles the process-wide singletons: the current snapshot
//! pointer, the instance table, the verdict cache, and the transaction
//! table. Readers (queries, packet path) only ever touch the snapshot
//! pointer and the cache, both lock-free; writers serialize on the
//! transaction table mutex.
//!
//! Lock order, where both are held: transaction table first, instance
//! table second.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{DEFAULT_CACHE_BUCKETS, VerdictCache, VerdictRecord};
use crate::error::{KzorpError, Result};
use crate::instance::{Bind, BindProto, InstanceTable};
use crate::matcher::{Verdict, classify};
use crate::rule::{DimensionCounts, RuleEntry};
use crate::service::{NatEntry, Service, SessionCounter};
use crate::snapshot::{Snapshot, SnapshotBuilder, ZoneDraft};
use crate::transaction::{
    FlushKind, NatDirection, ServiceParams, Transaction, ZoneParams,
};
use crate::types::{FlowTuple, PacketContext, PeerId, TenancyTag, validate_name};

/// The policy engine. One per process; created at start, dropped at stop.
pub struct Engine {
    snapshot: ArcSwap<Snapshot>,
    transactions: Mutex<HashMap<PeerId, Transaction>>,
    instances: Mutex<InstanceTable>,
    cache: VerdictCache,
    next_peer_id: AtomicU64,
    next_service_id: AtomicU32,
    next_session_id: AtomicU64,
}

impl Engine {
    pub fn new(cache_buckets: usize) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
            transactions: Mutex::new(HashMap::new()),
            instances: Mutex::new(InstanceTable::new()),
            cache: VerdictCache::new(cache_buckets),
            next_peer_id: AtomicU64::new(1),
            next_service_id: AtomicU32::new(1),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// The currently published configuration. Acquire-ordered load; the
    /// returned snapshot stays valid for as long as the caller holds it.
    pub fn current(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Hand out an id for a newly connected control peer.
    pub fn allocate_peer(&self) -> PeerId {
        self.next_peer_id.fetch_add(1, Ordering::Relaxed)
    }

    // -----------------------------------------------------------------
    // Transaction operations (control plane)
    // -----------------------------------------------------------------

    pub fn start_transaction(
        &self,
        peer: PeerId,
        instance_name: &str,
        cookie: Option<u64>,
    ) -> Result<()> {
        validate_name(instance_name)?;
        let mut transactions = self.transactions.lock();
        if transactions.contains_key(&peer) {
            return Err(KzorpError::TransactionConflict(
                "peer already has an open transaction".to_owned(),
            ));
        }
        {
            let mut instances = self.instances.lock();
            let (instance_id, open) = instances.ensure(instance_name);
            if open {
                return Err(KzorpError::TransactionConflict(format!(
                    "instance {instance_name} already has an open transaction"
                )));
            }
            instances.set_transaction_open(instance_id, true);
            let base = self.snapshot.load_full();
            debug!(
                peer,
                instance = %instance_name,
                cookie = cookie.unwrap_or(0),
                base_generation = base.generation(),
                "transaction started"
            );
            transactions.insert(
                peer,
                Transaction::new(
                    peer,
                    instance_id,
                    instance_name.to_owned(),
                    cookie.unwrap_or(0),
                    base,
                ),
            );
        }
        Ok(())
    }

    fn with_transaction<T>(
        &self,
        peer: PeerId,
        op: impl FnOnce(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut transactions = self.transactions.lock();
        let tx = transactions
            .get_mut(&peer)
            .ok_or(KzorpError::NoTransaction)?;
        op(tx)
    }

    pub fn set_flush(&self, peer: PeerId, kind: FlushKind) -> Result<()> {
        self.with_transaction(peer, |tx| {
            tx.set_flush(kind);
            Ok(())
        })
    }

    pub fn add_zone(&self, peer: PeerId, params: ZoneParams) -> Result<()> {
        self.with_transaction(peer, |tx| tx.add_zone(params))
    }

    pub fn add_service(&self, peer: PeerId, params: ServiceParams) -> Result<()> {
        self.with_transaction(peer, |tx| tx.add_service(params))
    }

    pub fn add_service_nat(
        &self,
        peer: PeerId,
        service: &str,
        direction: NatDirection,
        entry: NatEntry,
    ) -> Result<()> {
        self.with_transaction(peer, |tx| tx.add_service_nat(service, direction, entry))
    }

    pub fn add_dispatcher(&self, peer: PeerId, name: &str, alloc_rules: u32) -> Result<()> {
        self.with_transaction(peer, |tx| tx.add_dispatcher(name, alloc_rules))
    }

    pub fn add_rule(
        &self,
        peer: PeerId,
        dispatcher: &str,
        rule_id: u32,
        service: &str,
        counts: DimensionCounts,
    ) -> Result<()> {
        self.with_transaction(peer, |tx| tx.add_rule(dispatcher, rule_id, service, counts))
    }

    pub fn add_rule_entry(
        &self,
        peer: PeerId,
        dispatcher: &str,
        rule_id: u32,
        entries: Vec<RuleEntry>,
    ) -> Result<()> {
        self.with_transaction(peer, |tx| tx.add_rule_entry(dispatcher, rule_id, entries))
    }

    pub fn add_bind(
        &self,
        peer: PeerId,
        instance_name: &str,
        proto: BindProto,
        addr: std::net::IpAddr,
        port: u16,
    ) -> Result<()> {
        if port == 0 {
            return Err(KzorpError::InvalidArgument("zero bind port".to_owned()));
        }
        let mut transactions = self.transactions.lock();
        let tx = transactions
            .get_mut(&peer)
            .ok_or(KzorpError::NoTransaction)?;
        if instance_name != tx.instance_name {
            return Err(KzorpError::InvalidArgument(format!(
                "bind instance {instance_name} does not match transaction instance {}",
                tx.instance_name
            )));
        }
        let bind = Bind {
            proto,
            addr,
            port,
            owner: peer,
        };
        {
            let instances = self.instances.lock();
            // With the bind flush flag a peer may re-register endpoints it
            // already owns; they get replaced at commit anyway.
            let replaceable = tx.flush_binds.then_some(peer);
            if instances.has_conflicting_bind(tx.instance_id, &bind, replaceable) {
                return Err(KzorpError::AlreadyExists(format!(
                    "bind {}:{}",
                    bind.addr, bind.port
                )));
            }
        }
        tx.stage_bind(bind)
    }

    /// Commit the peer's transaction. The transaction always ends here; on
    /// failure the base configuration stays current and everything staged
    /// is dropped.
    pub fn commit(&self, peer: PeerId) -> Result<()> {
        let mut transactions = self.transactions.lock();
        let tx = transactions
            .remove(&peer)
            .ok_or(KzorpError::NoTransaction)?;
        let result = self.commit_transaction(&tx);
        self.instances
            .lock()
            .set_transaction_open(tx.instance_id, false);
        match &result {
            Ok(()) => info!(
                instance = %tx.instance_name,
                cookie = tx.cookie,
                generation = self.snapshot.load().generation(),
                "configuration committed"
            ),
            Err(error) => warn!(
                instance = %tx.instance_name,
                %error,
                "commit failed, base configuration stays current"
            ),
        }
        result
    }

    fn commit_transaction(&self, tx: &Transaction) -> Result<()> {
        // Every declared rule slot must have been populated.
        for dispatcher in &tx.dispatchers {
            if dispatcher.rules.len() as u32 != dispatcher.alloc_rules {
                return Err(KzorpError::InvalidArgument(format!(
                    "dispatcher {}: {} rules staged, {} allocated",
                    dispatcher.name,
                    dispatcher.rules.len(),
                    dispatcher.alloc_rules
                )));
            }
        }

        // Another instance may have committed since this transaction
        // captured its base; clone from the live snapshot so this commit
        // does not undo it. For this transaction's own instance the
        // engaged flag guarantees base == current.
        let base = self.snapshot.load_full();
        let mut builder = SnapshotBuilder::new(base.generation() + 1);

        // Services: carry the surviving ones, then append staged services.
        // A staged service whose name survives from the base inherits the
        // base service's id and live session counter.
        for service in base.services() {
            if tx.flush_services && service.instance_id() == tx.instance_id {
                debug!(service = %service.name(), "flushed service");
                continue;
            }
            builder.services.push(service.clone());
        }
        for staged in &tx.services {
            let (id, sessions) = match base.service_by_name(&staged.name) {
                Some(original) => {
                    debug!(service = %staged.name, "migrating service identity");
                    (original.id(), original.sessions().clone())
                }
                None => (
                    self.next_service_id.fetch_add(1, Ordering::Relaxed),
                    SessionCounter::new(staged.initial_sessions),
                ),
            };
            builder.services.push(Arc::new(Service::new(
                id,
                tx.instance_id,
                staged.name.clone(),
                staged.flags,
                staged.kind.clone(),
                sessions,
            )));
        }

        // Zones: carry unless flushed, then append staged. Parent links
        // are re-resolved inside freeze().
        if !tx.flush_zones {
            for zone in base.zones() {
                builder.zones.push(ZoneDraft::from_zone(zone));
            }
        }
        builder.zones.extend(tx.zones.iter().cloned());

        // Dispatchers: carry unless flushed, then append staged; all of
        // them are relinked against the new zones and services in freeze().
        for dispatcher in base.dispatchers() {
            if tx.flush_dispatchers && dispatcher.instance_id() == tx.instance_id {
                debug!(dispatcher = %dispatcher.name(), "flushed dispatcher");
                continue;
            }
            builder.dispatchers.push(dispatcher.draft());
        }
        builder.dispatchers.extend(tx.dispatchers.iter().cloned());

        let snapshot = builder.freeze()?;

        // Binds: the owner's registrations are replaced wholesale.
        {
            let mut instances = self.instances.lock();
            instances.remove_peer_binds(tx.peer);
            for bind in &tx.binds {
                instances.add_bind(tx.instance_id, bind.clone());
            }
        }

        // The only point where fast-path-visible policy changes.
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }

    /// Drop the peer's open transaction, if any.
    pub fn abort(&self, peer: PeerId) -> bool {
        let mut transactions = self.transactions.lock();
        match transactions.remove(&peer) {
            Some(tx) => {
                self.instances
                    .lock()
                    .set_transaction_open(tx.instance_id, false);
                debug!(peer, instance = %tx.instance_name, "transaction aborted");
                true
            }
            None => false,
        }
    }

    /// Peer disconnect: implicit abort plus removal of the peer's binds.
    pub fn peer_disconnected(&self, peer: PeerId) {
        self.abort(peer);
        self.instances.lock().remove_peer_binds(peer);
        debug!(peer, "peer disconnected");
    }

    /// All binds with their instance names, for dumps.
    pub fn bind_rows(&self) -> Vec<(String, Bind)> {
        self.instances.lock().bind_rows()
    }

    // -----------------------------------------------------------------
    // Fast path
    // -----------------------------------------------------------------

    /// Classify a packet against the current snapshot without touching the
    /// cache. Used by control-plane queries.
    pub fn query(&self, pkt: &PacketContext) -> Verdict {
        let snapshot = self.snapshot.load();
        classify(&snapshot, pkt)
    }

    /// Tracker callback: a new connection appeared. Classifies against the
    /// current snapshot and pins the verdict, unless one is already
    /// cached.
    pub fn conn_new(&self, tag: TenancyTag, pkt: &PacketContext) -> Arc<VerdictRecord> {
        let tuple = pkt.flow_tuple();
        if let Some(existing) = self.cache.lookup(&tuple, tag) {
            return existing;
        }
        let snapshot = self.snapshot.load_full();
        let verdict = classify(&snapshot, pkt);
        let record = Arc::new(VerdictRecord::new(
            self.next_session_id.fetch_add(1, Ordering::Relaxed),
            snapshot.generation(),
            tag,
            tuple,
            verdict,
        ));
        let (record, inserted) = self.cache.insert(record);
        if inserted {
            if let Some(service) = record.verdict().service.as_ref() {
                service.sessions().increment();
            }
            debug!(
                session = record.session_id(),
                generation = record.generation(),
                "verdict cached"
            );
        }
        record
    }

    /// Tracker callback: look up the pinned verdict for a tuple (either
    /// direction) and tenancy tag.
    pub fn conn_lookup(&self, tuple: &FlowTuple, tag: TenancyTag) -> Option<Arc<VerdictRecord>> {
        self.cache.lookup(tuple, tag)
    }

    /// Tracker callback: the connection is being destroyed. Releases the
    /// record's entity references and the service session.
    pub fn conn_destroyed(&self, tuple: &FlowTuple, tag: TenancyTag) -> Option<Arc<VerdictRecord>> {
        let removed = self.cache.remove(tuple, tag)?;
        if let Some(service) = removed.verdict().service.as_ref() {
            service.sessions().decrement();
        }
        debug!(session = removed.session_id(), "verdict released");
        Some(removed)
    }

    /// Number of connections with a pinned verdict.
    pub fn cached_connections(&self) -> usize {
        self.cache.len()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_BUCKETS)
    }
}
