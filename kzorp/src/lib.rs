//! kzorp policy-classification engine.
//!
//! The engine attaches a *verdict* to each network connection: which
//! administrative zones the endpoints belong to, which dispatcher rule
//! matched, and which service handles the traffic. Configuration arrives
//! as transactions that publish immutable [`snapshot::Snapshot`]s
//! atomically; the packet path classifies through the
//! [`matcher`] and pins results in the [`cache`], both without locks.
//!
//! The connection tracker, the packet hook and the control-plane socket
//! are external; this crate exposes the three tracker callbacks
//! ([`Engine::conn_new`], [`Engine::conn_lookup`],
//! [`Engine::conn_destroyed`]) and the transaction/query API the control
//! plane maps its opcodes onto.

pub mod cache;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod instance;
pub mod matcher;
pub mod rule;
pub mod service;
pub mod snapshot;
pub mod transaction;
pub mod types;
pub mod zone;

pub use cache::{DEFAULT_CACHE_BUCKETS, VerdictCache, VerdictRecord};
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use error::{KzorpError, Result};
pub use instance::{Bind, BindProto};
pub use matcher::{Verdict, classify, zone_chain};
pub use rule::{DIMENSION_COUNT, Dimension, DimensionCounts, Rule, RuleEntries, RuleEntry};
pub use service::{
    DenyIpv4Method, DenyIpv6Method, NatEntry, NatRange, RouterTarget, Service, ServiceKind,
    SessionCounter,
};
pub use snapshot::Snapshot;
pub use transaction::{FlushKind, NatDirection, ServiceParams, ZoneParams};
pub use types::{
    FlowTuple, Iface, NAME_MAX, PacketContext, PeerId, PortRange, TenancyTag, subnet_from_parts,
    validate_name,
};
