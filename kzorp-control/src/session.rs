//! Per-peer control sessions.
//!
//! A session owns one peer id and maps decoded frames onto engine calls.
//! Every request produces at least one reply frame carrying the request's
//! sequence number; get/dump requests produce a record stream terminated
//! by `dump_done`. Closing the session aborts the peer's transaction and
//! removes its binds.

use std::sync::Arc;

use tracing::{debug, warn};

use kzorp::engine::Engine;
use kzorp::{BindProto, DimensionCounts, FlushKind, KzorpError, NatDirection, PeerId};
use kzorp_proto::{
    COMPAT_VERSION, MAJOR_VERSION, MSG_ADD_BIND, MSG_ADD_DISPATCHER, MSG_ADD_RULE,
    MSG_ADD_RULE_ENTRY, MSG_ADD_SERVICE, MSG_ADD_SERVICE_NAT_DST, MSG_ADD_SERVICE_NAT_SRC,
    MSG_ADD_ZONE, MSG_COMMIT, MSG_DUMP_DONE, MSG_FLUSH_BINDS, MSG_FLUSH_DISPATCHERS,
    MSG_FLUSH_SERVICES, MSG_FLUSH_ZONES, MSG_GET_BIND, MSG_GET_DISPATCHER, MSG_GET_SERVICE,
    MSG_GET_VERSION, MSG_GET_ZONE, MSG_QUERY, MSG_START, MSG_STATUS, MSG_QUERY_REPLY,
    MSG_VERSION_REPLY, ProtocolError, RawMessage, STATUS_OK, decode_add_bind,
    decode_add_dispatcher, decode_add_rule, decode_add_rule_entry, decode_add_service,
    decode_add_service_nat, decode_add_zone, decode_get, decode_query, decode_start, encode,
    encode_query_reply, encode_status, encode_version_reply,
};

use crate::dump;
use crate::wire;

/// One control-plane peer.
pub struct PeerSession {
    engine: Arc<Engine>,
    peer: PeerId,
    dump_page: usize,
}

impl PeerSession {
    pub fn new(engine: Arc<Engine>) -> Self {
        let peer = engine.allocate_peer();
        Self {
            engine,
            peer,
            dump_page: dump::DEFAULT_DUMP_PAGE,
        }
    }

    /// Like [`PeerSession::new`] with an explicit dump page size.
    pub fn with_dump_page(engine: Arc<Engine>, dump_page: usize) -> Self {
        let mut session = Self::new(engine);
        session.dump_page = dump_page;
        session
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Handle one decoded frame; returns the encoded reply frames.
    pub fn handle(&self, msg: &RawMessage) -> Vec<u8> {
        match self.handle_inner(msg) {
            Ok(reply) => reply,
            Err(error) => {
                debug!(peer = self.peer, opcode = msg.opcode, %error, "malformed request");
                frame_or_empty(
                    MSG_STATUS,
                    msg.seq,
                    &encode_status(
                        kzorp_proto::STATUS_INVALID_ARGUMENT,
                        &error.to_string(),
                    ),
                )
            }
        }
    }

    /// Abort the peer's transaction and drop its binds. Call on
    /// disconnect.
    pub fn close(&self) {
        self.engine.peer_disconnected(self.peer);
    }

    fn status(&self, seq: u32, result: Result<(), KzorpError>) -> Result<Vec<u8>, ProtocolError> {
        match result {
            Ok(()) => encode(MSG_STATUS, seq, &encode_status(STATUS_OK, "")),
            Err(error) => {
                debug!(peer = self.peer, %error, "operation refused");
                encode(
                    MSG_STATUS,
                    seq,
                    &encode_status(wire::status_code(&error), &error.to_string()),
                )
            }
        }
    }

    fn handle_inner(&self, msg: &RawMessage) -> Result<Vec<u8>, ProtocolError> {
        let seq = msg.seq;
        match msg.opcode {
            MSG_GET_VERSION => encode(
                MSG_VERSION_REPLY,
                seq,
                &encode_version_reply(MAJOR_VERSION, COMPAT_VERSION),
            ),
            MSG_START => {
                let m = decode_start(&msg.payload)?;
                self.status(
                    seq,
                    self.engine
                        .start_transaction(self.peer, &m.instance, m.cookie),
                )
            }
            MSG_COMMIT => self.status(seq, self.engine.commit(self.peer)),
            MSG_FLUSH_ZONES => {
                self.status(seq, self.engine.set_flush(self.peer, FlushKind::Zones))
            }
            MSG_FLUSH_SERVICES => {
                self.status(seq, self.engine.set_flush(self.peer, FlushKind::Services))
            }
            MSG_FLUSH_DISPATCHERS => self.status(
                seq,
                self.engine.set_flush(self.peer, FlushKind::Dispatchers),
            ),
            MSG_FLUSH_BINDS => {
                self.status(seq, self.engine.set_flush(self.peer, FlushKind::Binds))
            }
            MSG_ADD_ZONE => {
                let m = decode_add_zone(&msg.payload)?;
                let result =
                    wire::zone_params(m).and_then(|p| self.engine.add_zone(self.peer, p));
                self.status(seq, result)
            }
            MSG_GET_ZONE => match decode_get(&msg.payload)? {
                Some(name) => {
                    let snapshot = self.engine.current();
                    match snapshot.zone_by_name(&name) {
                        Some(zone) => {
                            let mut out = Vec::new();
                            dump::emit_zone(zone, seq, &mut out)?;
                            out.extend(encode(MSG_DUMP_DONE, seq, &[])?);
                            Ok(out)
                        }
                        None => {
                            self.status(seq, Err(KzorpError::NotFound(format!("zone {name}"))))
                        }
                    }
                }
                None => dump::dump_zones(&self.engine, seq, self.dump_page),
            },
            MSG_ADD_SERVICE => {
                let m = decode_add_service(&msg.payload)?;
                let result =
                    wire::service_params(m).and_then(|p| self.engine.add_service(self.peer, p));
                self.status(seq, result)
            }
            MSG_ADD_SERVICE_NAT_SRC | MSG_ADD_SERVICE_NAT_DST => {
                let direction = if msg.opcode == MSG_ADD_SERVICE_NAT_SRC {
                    NatDirection::Src
                } else {
                    NatDirection::Dst
                };
                let m = decode_add_service_nat(&msg.payload)?;
                let result = wire::nat_entry(&m).and_then(|entry| {
                    self.engine
                        .add_service_nat(self.peer, &m.service, direction, entry)
                });
                self.status(seq, result)
            }
            MSG_GET_SERVICE => match decode_get(&msg.payload)? {
                Some(name) => {
                    let snapshot = self.engine.current();
                    match snapshot.service_by_name(&name) {
                        Some(service) => {
                            let mut out = Vec::new();
                            dump::emit_service(service, seq, &mut out)?;
                            out.extend(encode(MSG_DUMP_DONE, seq, &[])?);
                            Ok(out)
                        }
                        None => self.status(
                            seq,
                            Err(KzorpError::NotFound(format!("service {name}"))),
                        ),
                    }
                }
                None => dump::dump_services(&self.engine, seq, self.dump_page),
            },
            MSG_ADD_DISPATCHER => {
                let m = decode_add_dispatcher(&msg.payload)?;
                self.status(
                    seq,
                    self.engine.add_dispatcher(self.peer, &m.name, m.num_rules),
                )
            }
            MSG_ADD_RULE => {
                let m = decode_add_rule(&msg.payload)?;
                self.status(
                    seq,
                    self.engine.add_rule(
                        self.peer,
                        &m.dispatcher,
                        m.rule_id,
                        &m.service,
                        DimensionCounts::new(m.counts),
                    ),
                )
            }
            MSG_ADD_RULE_ENTRY => {
                let m = decode_add_rule_entry(&msg.payload)?;
                let dispatcher = m.dispatcher.clone();
                let rule_id = m.rule_id;
                let result = wire::rule_entries(m).and_then(|entries| {
                    self.engine
                        .add_rule_entry(self.peer, &dispatcher, rule_id, entries)
                });
                self.status(seq, result)
            }
            MSG_GET_DISPATCHER => match decode_get(&msg.payload)? {
                Some(name) => {
                    let snapshot = self.engine.current();
                    match snapshot.dispatcher_by_name(&name) {
                        Some(dispatcher) => {
                            let mut out = Vec::new();
                            dump::emit_dispatcher(dispatcher, seq, &mut out)?;
                            out.extend(encode(MSG_DUMP_DONE, seq, &[])?);
                            Ok(out)
                        }
                        None => self.status(
                            seq,
                            Err(KzorpError::NotFound(format!("dispatcher {name}"))),
                        ),
                    }
                }
                None => dump::dump_dispatchers(&self.engine, seq, self.dump_page),
            },
            MSG_QUERY => {
                let m = decode_query(&msg.payload)?;
                let verdict = self.engine.query(&wire::query_context(&m));
                encode(
                    MSG_QUERY_REPLY,
                    seq,
                    &encode_query_reply(&wire::query_reply(&verdict))?,
                )
            }
            MSG_ADD_BIND => {
                let m = decode_add_bind(&msg.payload)?;
                let result = match BindProto::from_code(m.proto) {
                    Some(proto) => {
                        self.engine
                            .add_bind(self.peer, &m.instance, proto, m.addr, m.port)
                    }
                    None => Err(KzorpError::InvalidArgument(format!(
                        "bind protocol {} is not TCP or UDP",
                        m.proto
                    ))),
                };
                self.status(seq, result)
            }
            MSG_GET_BIND => dump::dump_binds(&self.engine, seq),
            other => {
                warn!(peer = self.peer, opcode = other, "unknown opcode");
                self.status(
                    seq,
                    Err(KzorpError::InvalidArgument(format!(
                        "unknown opcode 0x{other:02x}"
                    ))),
                )
            }
        }
    }
}

fn frame_or_empty(opcode: u8, seq: u32, payload: &[u8]) -> Vec<u8> {
    encode(opcode, seq, payload).unwrap_or_default()
}
