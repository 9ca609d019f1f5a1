//! Instances and proxy binds.
//!
//! An instance is a tenancy partition. Instances are created on first use
//! and never destroyed. Binds tell the local proxy infrastructure where to
//! listen; they belong to an instance, are owned by the control peer that
//! registered them, and disappear when that peer disconnects or when a
//! commit replaces them.

use std::net::IpAddr;

use crate::types::PeerId;

/// Bind transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindProto {
    Tcp,
    Udp,
}

impl BindProto {
    /// IP protocol number.
    pub fn code(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }
}

/// A proxy listen endpoint registered by a control peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub proto: BindProto,
    pub addr: IpAddr,
    pub port: u16,
    pub owner: PeerId,
}

impl Bind {
    /// True if both describe the same listen endpoint, regardless of owner.
    pub fn same_endpoint(&self, other: &Bind) -> bool {
        self.proto == other.proto && self.addr == other.addr && self.port == other.port
    }
}

#[derive(Debug)]
struct Instance {
    id: u32,
    name: String,
    transaction_open: bool,
    binds: Vec<Bind>,
}

/// The process-wide instance list, in registration order.
#[derive(Debug)]
pub(crate) struct InstanceTable {
    instances: Vec<Instance>,
    next_id: u32,
}

impl Default for InstanceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceTable {
    pub fn new() -> Self {
        Self {
            instances: Vec::new(),
            next_id: 1,
        }
    }

    /// Look up an instance by name, creating it on first use. Returns
    /// `(id, transaction_open)`.
    pub fn ensure(&mut self, name: &str) -> (u32, bool) {
        if let Some(instance) = self.instances.iter().find(|i| i.name == name) {
            return (instance.id, instance.transaction_open);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.instances.push(Instance {
            id,
            name: name.to_owned(),
            transaction_open: false,
            binds: Vec::new(),
        });
        (id, false)
    }

    pub fn set_transaction_open(&mut self, id: u32, open: bool) {
        if let Some(instance) = self.instances.iter_mut().find(|i| i.id == id) {
            instance.transaction_open = open;
        }
    }

    /// True if the instance already has a bind for the same endpoint that
    /// the transaction is not allowed to replace. A peer may re-register
    /// its own endpoints when the bind flush flag is set.
    pub fn has_conflicting_bind(
        &self,
        id: u32,
        bind: &Bind,
        replaceable_owner: Option<PeerId>,
    ) -> bool {
        self.instances
            .iter()
            .filter(|i| i.id == id)
            .flat_map(|i| i.binds.iter())
            .any(|existing| {
                existing.same_endpoint(bind) && Some(existing.owner) != replaceable_owner
            })
    }

    pub fn add_bind(&mut self, id: u32, bind: Bind) {
        if let Some(instance) = self.instances.iter_mut().find(|i| i.id == id) {
            instance.binds.push(bind);
        }
    }

    /// Drop every bind owned by `peer`, in all instances.
    pub fn remove_peer_binds(&mut self, peer: PeerId) {
        for instance in &mut self.instances {
            instance.binds.retain(|b| b.owner != peer);
        }
    }

    /// All binds with their instance name, in registration order. Cloned
    /// out so dumps do not hold the table lock.
    pub fn bind_rows(&self) -> Vec<(String, Bind)> {
        self.instances
            .iter()
            .flat_map(|i| i.binds.iter().map(|b| (i.name.clone(), b.clone())))
            .collect()
    }
}
