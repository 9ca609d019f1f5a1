//! Binary control protocol for the kzorp policy engine.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte length][1-byte opcode][4-byte seq][payload]
//! ```
//!
//! - **length**: big-endian u32, size of (opcode + seq + payload)
//! - **opcode**: u8 message type
//! - **seq**: big-endian u32, echoed verbatim in every reply frame
//! - **payload**: opcode-specific binary data
//!
//! ## Opcodes
//!
//! | Opcode | Direction | Name                | Payload |
//! |--------|-----------|---------------------|---------|
//! | 0x01   | C→S       | get_version         | (empty) |
//! | 0x02   | C→S       | start               | `[name instance][1B has_cookie][8B cookie?]` |
//! | 0x03   | C→S       | commit              | (empty) |
//! | 0x04   | C→S       | flush_zones         | (empty) |
//! | 0x05   | C→S / S→C | add_zone            | see [`AddZoneMsg`] |
//! | 0x06   | C→S       | get_zone            | `[1B has_name][name?]` |
//! | 0x07   | C→S       | flush_services      | (empty) |
//! | 0x08   | C→S / S→C | add_service         | see [`AddServiceMsg`] |
//! | 0x09   | C→S / S→C | add_service_nat_src | see [`AddServiceNatMsg`] |
//! | 0x0A   | C→S / S→C | add_service_nat_dst | see [`AddServiceNatMsg`] |
//! | 0x0B   | C→S       | get_service         | `[1B has_name][name?]` |
//! | 0x0C   | C→S       | flush_dispatchers   | (empty) |
//! | 0x0D   | C→S / S→C | add_dispatcher      | `[name][4B num_rules]` |
//! | 0x0E   | C→S / S→C | add_rule            | see [`AddRuleMsg`] |
//! | 0x0F   | C→S / S→C | add_rule_entry      | see [`AddRuleEntryMsg`] |
//! | 0x10   | C→S       | get_dispatcher      | `[1B has_name][name?]` |
//! | 0x11   | C→S       | query               | see [`QueryMsg`] |
//! | 0x12   | C→S       | flush_binds         | (empty) |
//! | 0x13   | C→S / S→C | add_bind            | `[name instance][1B proto][addr][2B port]` |
//! | 0x14   | C→S       | get_bind            | (empty) |
//! | 0x80   | S→C       | status              | `[1B code][2B msg_len][msg]` |
//! | 0x81   | S→C       | version_reply       | `[1B major][1B compat]` |
//! | 0x82   | S→C       | query_reply         | see [`QueryReplyMsg`] |
//! | 0x83   | S→C       | dump_done           | (empty) |
//!
//! Dump replies reuse the corresponding `add_*` frames (a zone dump is a
//! stream of `add_zone` frames) and are terminated by `dump_done`. Every
//! non-dump request is answered with `status`, `version_reply` or
//! `query_reply`.
//!
//! Addresses travel as `[1B family][4B or 16B octets]`; subnets as an
//! address followed by a full mask of the same family. Whether a mask is a
//! valid prefix mask is a policy question and is checked by the consumer,
//! not here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum message body size (64 KiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Minimum body size: opcode (1) + seq (4).
pub const MIN_BODY_SIZE: usize = 5;

/// Maximum length of any name field, in bytes.
pub const NAME_MAX: usize = 127;

/// Protocol version advertised in `version_reply`.
pub const MAJOR_VERSION: u8 = 4;
/// Compatibility version advertised in `version_reply`.
pub const COMPAT_VERSION: u8 = 1;

// Client-to-server opcodes.
pub const MSG_GET_VERSION: u8 = 0x01;
pub const MSG_START: u8 = 0x02;
pub const MSG_COMMIT: u8 = 0x03;
pub const MSG_FLUSH_ZONES: u8 = 0x04;
pub const MSG_ADD_ZONE: u8 = 0x05;
pub const MSG_GET_ZONE: u8 = 0x06;
pub const MSG_FLUSH_SERVICES: u8 = 0x07;
pub const MSG_ADD_SERVICE: u8 = 0x08;
pub const MSG_ADD_SERVICE_NAT_SRC: u8 = 0x09;
pub const MSG_ADD_SERVICE_NAT_DST: u8 = 0x0A;
pub const MSG_GET_SERVICE: u8 = 0x0B;
pub const MSG_FLUSH_DISPATCHERS: u8 = 0x0C;
pub const MSG_ADD_DISPATCHER: u8 = 0x0D;
pub const MSG_ADD_RULE: u8 = 0x0E;
pub const MSG_ADD_RULE_ENTRY: u8 = 0x0F;
pub const MSG_GET_DISPATCHER: u8 = 0x10;
pub const MSG_QUERY: u8 = 0x11;
pub const MSG_FLUSH_BINDS: u8 = 0x12;
pub const MSG_ADD_BIND: u8 = 0x13;
pub const MSG_GET_BIND: u8 = 0x14;

// Server-to-client opcodes.
pub const MSG_STATUS: u8 = 0x80;
pub const MSG_VERSION_REPLY: u8 = 0x81;
pub const MSG_QUERY_REPLY: u8 = 0x82;
pub const MSG_DUMP_DONE: u8 = 0x83;

// Status codes carried by `status` frames.
pub const STATUS_OK: u8 = 0;
pub const STATUS_INVALID_ARGUMENT: u8 = 1;
pub const STATUS_NOT_FOUND: u8 = 2;
pub const STATUS_ALREADY_EXISTS: u8 = 3;
pub const STATUS_NO_TRANSACTION: u8 = 4;
pub const STATUS_TRANSACTION_CONFLICT: u8 = 5;
pub const STATUS_OUT_OF_MEMORY: u8 = 6;
pub const STATUS_INTERNAL: u8 = 7;

// Service type codes.
pub const SVC_PROXY: u8 = 1;
pub const SVC_FORWARD: u8 = 2;
pub const SVC_DENY: u8 = 3;

// Address family tags.
pub const FAMILY_IPV4: u8 = 4;
pub const FAMILY_IPV6: u8 = 6;

// Rule dimension tags, in canonical dimension order.
pub const DIM_IFNAME: u8 = 1;
pub const DIM_IFGROUP: u8 = 2;
pub const DIM_PROTO: u8 = 3;
pub const DIM_SRC_PORT: u8 = 4;
pub const DIM_DST_PORT: u8 = 5;
pub const DIM_SRC_SUBNET: u8 = 6;
pub const DIM_SRC_SUBNET6: u8 = 7;
pub const DIM_SRC_ZONE: u8 = 8;
pub const DIM_DST_SUBNET: u8 = 9;
pub const DIM_DST_SUBNET6: u8 = 10;
pub const DIM_DST_ZONE: u8 = 11;
pub const DIM_DST_IFNAME: u8 = 12;
pub const DIM_DST_IFGROUP: u8 = 13;
pub const DIM_REQID: u8 = 14;

/// Number of rule dimensions.
pub const DIMENSION_COUNT: usize = 14;

/// Protocol error.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    MessageTooLarge(usize),
    MessageTooSmall(usize),
    InvalidPayload(&'static str),
    FieldTooLarge(&'static str, usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge(size) => write!(f, "frame body exceeds the size cap: {size} bytes"),
            Self::MessageTooSmall(size) => write!(f, "frame body below minimum: {size} bytes"),
            Self::InvalidPayload(what) => write!(f, "malformed payload: {what}"),
            Self::FieldTooLarge(field, size) => {
                write!(f, "field too large: {field} ({size} bytes)")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A raw decoded frame.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub opcode: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Payload primitives
// ---------------------------------------------------------------------------

/// Sequential payload reader. All integers are big-endian.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        let chunk = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(ProtocolError::InvalidPayload(what))?;
        self.pos += n;
        Ok(chunk)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?.first().copied().unwrap_or_default())
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
        let bytes: [u8; 2] = self
            .take(2, what)?
            .try_into()
            .map_err(|_| ProtocolError::InvalidPayload(what))?;
        Ok(u16::from_be_bytes(bytes))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        let bytes: [u8; 4] = self
            .take(4, what)?
            .try_into()
            .map_err(|_| ProtocolError::InvalidPayload(what))?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, ProtocolError> {
        let bytes: [u8; 8] = self
            .take(8, what)?
            .try_into()
            .map_err(|_| ProtocolError::InvalidPayload(what))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Read a `[2B len][bytes]` name. Enforces [`NAME_MAX`] and UTF-8.
    fn name(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        let len = self.u16(what)? as usize;
        if len == 0 || len > NAME_MAX {
            return Err(ProtocolError::InvalidPayload(what));
        }
        let bytes = self.take(len, what)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidPayload(what))
    }

    /// Read a `[1B family][octets]` address.
    fn addr(&mut self, what: &'static str) -> Result<IpAddr, ProtocolError> {
        match self.u8(what)? {
            FAMILY_IPV4 => {
                let bytes: [u8; 4] = self
                    .take(4, what)?
                    .try_into()
                    .map_err(|_| ProtocolError::InvalidPayload(what))?;
                Ok(IpAddr::V4(Ipv4Addr::from(bytes)))
            }
            FAMILY_IPV6 => {
                let bytes: [u8; 16] = self
                    .take(16, what)?
                    .try_into()
                    .map_err(|_| ProtocolError::InvalidPayload(what))?;
                Ok(IpAddr::V6(Ipv6Addr::from(bytes)))
            }
            _ => Err(ProtocolError::InvalidPayload(what)),
        }
    }

    /// Read an IPv4 address without a family tag.
    fn addr4(&mut self, what: &'static str) -> Result<Ipv4Addr, ProtocolError> {
        let bytes: [u8; 4] = self
            .take(4, what)?
            .try_into()
            .map_err(|_| ProtocolError::InvalidPayload(what))?;
        Ok(Ipv4Addr::from(bytes))
    }

    /// Read an address + mask pair of the same family.
    fn subnet(&mut self, what: &'static str) -> Result<WireSubnet, ProtocolError> {
        let addr = self.addr(what)?;
        let mask = match addr {
            IpAddr::V4(_) => IpAddr::V4(self.addr4(what)?),
            IpAddr::V6(_) => {
                let bytes: [u8; 16] = self
                    .take(16, what)?
                    .try_into()
                    .map_err(|_| ProtocolError::InvalidPayload(what))?;
                IpAddr::V6(Ipv6Addr::from(bytes))
            }
        };
        Ok(WireSubnet { addr, mask })
    }

    /// Everything not yet consumed.
    fn rest(&self) -> &'a [u8] {
        self.data.get(self.pos..).unwrap_or_default()
    }

    fn finish(&self, what: &'static str) -> Result<(), ProtocolError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(ProtocolError::InvalidPayload(what))
        }
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_name(buf: &mut Vec<u8>, name: &str) -> Result<(), ProtocolError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > NAME_MAX {
        return Err(ProtocolError::FieldTooLarge("name", bytes.len()));
    }
    put_u16(buf, bytes.len() as u16);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_addr(buf: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(a) => {
            buf.push(FAMILY_IPV4);
            buf.extend_from_slice(&a.octets());
        }
        IpAddr::V6(a) => {
            buf.push(FAMILY_IPV6);
            buf.extend_from_slice(&a.octets());
        }
    }
}

fn put_subnet(buf: &mut Vec<u8>, subnet: &WireSubnet) -> Result<(), ProtocolError> {
    match (subnet.addr, subnet.mask) {
        (IpAddr::V4(a), IpAddr::V4(m)) => {
            buf.push(FAMILY_IPV4);
            buf.extend_from_slice(&a.octets());
            buf.extend_from_slice(&m.octets());
            Ok(())
        }
        (IpAddr::V6(a), IpAddr::V6(m)) => {
            buf.push(FAMILY_IPV6);
            buf.extend_from_slice(&a.octets());
            buf.extend_from_slice(&m.octets());
            Ok(())
        }
        _ => Err(ProtocolError::InvalidPayload("subnet family mismatch")),
    }
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// An address + mask pair as it travels on the wire. The mask is not
/// validated here beyond family agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireSubnet {
    pub addr: IpAddr,
    pub mask: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMsg {
    pub instance: String,
    pub cookie: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddZoneMsg {
    pub name: String,
    /// Tenancy-unique name; equals `name` when absent.
    pub unique_name: Option<String>,
    pub subnet: Option<WireSubnet>,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddServiceMsg {
    /// One of [`SVC_PROXY`], [`SVC_FORWARD`], [`SVC_DENY`].
    pub svc_type: u8,
    pub flags: u32,
    pub name: String,
    pub session_count: Option<u32>,
    /// Router target, required for non-transparent forward services.
    pub router: Option<(IpAddr, u16)>,
    /// Deny methods (IPv4, IPv6), required for deny services.
    pub deny: Option<(u8, u8)>,
}

/// One NAT address/port range. Mirrors the output shape of the engine; the
/// ranges are never applied here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireNatRange {
    pub flags: u32,
    pub min_addr: Ipv4Addr,
    pub max_addr: Ipv4Addr,
    pub min_port: u16,
    pub max_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddServiceNatMsg {
    pub service: String,
    pub src: WireNatRange,
    pub dst: Option<WireNatRange>,
    pub map: WireNatRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddDispatcherMsg {
    pub name: String,
    pub num_rules: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRuleMsg {
    pub dispatcher: String,
    pub rule_id: u32,
    pub service: String,
    /// Per-dimension alternative counts, in canonical dimension order.
    pub counts: [u32; DIMENSION_COUNT],
}

/// One alternative for one rule dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireRuleEntry {
    Ifname(String),
    Ifgroup(u32),
    Proto(u8),
    SrcPort(u16, u16),
    DstPort(u16, u16),
    SrcSubnet(WireSubnet),
    SrcSubnet6(WireSubnet),
    SrcZone(String),
    DstSubnet(WireSubnet),
    DstSubnet6(WireSubnet),
    DstZone(String),
    DstIfname(String),
    DstIfgroup(u32),
    Reqid(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRuleEntryMsg {
    pub dispatcher: String,
    pub rule_id: u32,
    pub entries: Vec<WireRuleEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMsg {
    pub proto: u8,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    pub ifname: String,
    pub ifgroup: Option<u32>,
    pub reqid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryReplyMsg {
    pub dispatcher: Option<String>,
    pub client_zone: Option<String>,
    pub server_zone: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddBindMsg {
    pub instance: String,
    pub proto: u8,
    pub addr: IpAddr,
    pub port: u16,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a frame: `[4-byte length][1-byte opcode][4-byte seq][payload]`.
pub fn encode(opcode: u8, seq: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let body_len = 1 + 4 + payload.len();
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body_len));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(opcode);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode start payload.
pub fn encode_start(msg: &StartMsg) -> Result<Vec<u8>, ProtocolError> {
    let mut p = Vec::new();
    put_name(&mut p, &msg.instance)?;
    match msg.cookie {
        Some(cookie) => {
            p.push(1);
            put_u64(&mut p, cookie);
        }
        None => p.push(0),
    }
    Ok(p)
}

/// Encode add_zone payload.
pub fn encode_add_zone(msg: &AddZoneMsg) -> Result<Vec<u8>, ProtocolError> {
    let mut flags = 0u8;
    if msg.unique_name.is_some() {
        flags |= 0x01;
    }
    if msg.subnet.is_some() {
        flags |= 0x02;
    }
    if msg.parent.is_some() {
        flags |= 0x04;
    }
    let mut p = vec![flags];
    put_name(&mut p, &msg.name)?;
    if let Some(uname) = &msg.unique_name {
        put_name(&mut p, uname)?;
    }
    if let Some(subnet) = &msg.subnet {
        put_subnet(&mut p, subnet)?;
    }
    if let Some(parent) = &msg.parent {
        put_name(&mut p, parent)?;
    }
    Ok(p)
}

/// Encode a `[1B has_name][name?]` get payload (get_zone, get_service,
/// get_dispatcher). `None` requests a full dump.
pub fn encode_get(name: Option<&str>) -> Result<Vec<u8>, ProtocolError> {
    match name {
        Some(n) => {
            let mut p = vec![1];
            put_name(&mut p, n)?;
            Ok(p)
        }
        None => Ok(vec![0]),
    }
}

/// Encode add_service payload.
pub fn encode_add_service(msg: &AddServiceMsg) -> Result<Vec<u8>, ProtocolError> {
    let mut p = vec![msg.svc_type];
    put_u32(&mut p, msg.flags);
    put_name(&mut p, &msg.name)?;
    let mut presence = 0u8;
    if msg.session_count.is_some() {
        presence |= 0x01;
    }
    if msg.router.is_some() {
        presence |= 0x02;
    }
    if msg.deny.is_some() {
        presence |= 0x04;
    }
    p.push(presence);
    if let Some(count) = msg.session_count {
        put_u32(&mut p, count);
    }
    if let Some((addr, port)) = msg.router {
        put_addr(&mut p, addr);
        put_u16(&mut p, port);
    }
    if let Some((v4, v6)) = msg.deny {
        p.push(v4);
        p.push(v6);
    }
    Ok(p)
}

fn put_nat_range(buf: &mut Vec<u8>, range: &WireNatRange) {
    put_u32(buf, range.flags);
    buf.extend_from_slice(&range.min_addr.octets());
    buf.extend_from_slice(&range.max_addr.octets());
    put_u16(buf, range.min_port);
    put_u16(buf, range.max_port);
}

/// Encode add_service_nat_src / add_service_nat_dst payload.
pub fn encode_add_service_nat(msg: &AddServiceNatMsg) -> Result<Vec<u8>, ProtocolError> {
    let mut p = Vec::new();
    put_name(&mut p, &msg.service)?;
    p.push(u8::from(msg.dst.is_some()));
    put_nat_range(&mut p, &msg.src);
    if let Some(dst) = &msg.dst {
        put_nat_range(&mut p, dst);
    }
    put_nat_range(&mut p, &msg.map);
    Ok(p)
}

/// Encode add_dispatcher payload.
pub fn encode_add_dispatcher(msg: &AddDispatcherMsg) -> Result<Vec<u8>, ProtocolError> {
    let mut p = Vec::new();
    put_name(&mut p, &msg.name)?;
    put_u32(&mut p, msg.num_rules);
    Ok(p)
}

/// Encode add_rule payload.
pub fn encode_add_rule(msg: &AddRuleMsg) -> Result<Vec<u8>, ProtocolError> {
    let mut p = Vec::new();
    put_name(&mut p, &msg.dispatcher)?;
    put_u32(&mut p, msg.rule_id);
    put_name(&mut p, &msg.service)?;
    for count in msg.counts {
        put_u32(&mut p, count);
    }
    Ok(p)
}

fn put_rule_entry(buf: &mut Vec<u8>, entry: &WireRuleEntry) -> Result<(), ProtocolError> {
    match entry {
        WireRuleEntry::Ifname(name) => {
            buf.push(DIM_IFNAME);
            put_name(buf, name)?;
        }
        WireRuleEntry::Ifgroup(group) => {
            buf.push(DIM_IFGROUP);
            put_u32(buf, *group);
        }
        WireRuleEntry::Proto(proto) => {
            buf.push(DIM_PROTO);
            buf.push(*proto);
        }
        WireRuleEntry::SrcPort(from, to) => {
            buf.push(DIM_SRC_PORT);
            put_u16(buf, *from);
            put_u16(buf, *to);
        }
        WireRuleEntry::DstPort(from, to) => {
            buf.push(DIM_DST_PORT);
            put_u16(buf, *from);
            put_u16(buf, *to);
        }
        WireRuleEntry::SrcSubnet(subnet) => {
            buf.push(DIM_SRC_SUBNET);
            put_subnet(buf, subnet)?;
        }
        WireRuleEntry::SrcSubnet6(subnet) => {
            buf.push(DIM_SRC_SUBNET6);
            put_subnet(buf, subnet)?;
        }
        WireRuleEntry::SrcZone(name) => {
            buf.push(DIM_SRC_ZONE);
            put_name(buf, name)?;
        }
        WireRuleEntry::DstSubnet(subnet) => {
            buf.push(DIM_DST_SUBNET);
            put_subnet(buf, subnet)?;
        }
        WireRuleEntry::DstSubnet6(subnet) => {
            buf.push(DIM_DST_SUBNET6);
            put_subnet(buf, subnet)?;
        }
        WireRuleEntry::DstZone(name) => {
            buf.push(DIM_DST_ZONE);
            put_name(buf, name)?;
        }
        WireRuleEntry::DstIfname(name) => {
            buf.push(DIM_DST_IFNAME);
            put_name(buf, name)?;
        }
        WireRuleEntry::DstIfgroup(group) => {
            buf.push(DIM_DST_IFGROUP);
            put_u32(buf, *group);
        }
        WireRuleEntry::Reqid(reqid) => {
            buf.push(DIM_REQID);
            put_u32(buf, *reqid);
        }
    }
    Ok(())
}

/// Encode add_rule_entry payload. At most one alternative per dimension.
pub fn encode_add_rule_entry(msg: &AddRuleEntryMsg) -> Result<Vec<u8>, ProtocolError> {
    if msg.entries.len() > DIMENSION_COUNT {
        return Err(ProtocolError::FieldTooLarge("entries", msg.entries.len()));
    }
    let mut p = Vec::new();
    put_name(&mut p, &msg.dispatcher)?;
    put_u32(&mut p, msg.rule_id);
    p.push(msg.entries.len() as u8);
    for entry in &msg.entries {
        put_rule_entry(&mut p, entry)?;
    }
    Ok(p)
}

/// Encode query payload.
pub fn encode_query(msg: &QueryMsg) -> Result<Vec<u8>, ProtocolError> {
    let mut p = vec![msg.proto];
    put_addr(&mut p, msg.src);
    put_u16(&mut p, msg.src_port);
    put_addr(&mut p, msg.dst);
    put_u16(&mut p, msg.dst_port);
    put_name(&mut p, &msg.ifname)?;
    let mut presence = 0u8;
    if msg.ifgroup.is_some() {
        presence |= 0x01;
    }
    if msg.reqid.is_some() {
        presence |= 0x02;
    }
    p.push(presence);
    if let Some(group) = msg.ifgroup {
        put_u32(&mut p, group);
    }
    if let Some(reqid) = msg.reqid {
        put_u32(&mut p, reqid);
    }
    Ok(p)
}

/// Encode query_reply payload.
pub fn encode_query_reply(msg: &QueryReplyMsg) -> Result<Vec<u8>, ProtocolError> {
    let mut presence = 0u8;
    if msg.dispatcher.is_some() {
        presence |= 0x01;
    }
    if msg.client_zone.is_some() {
        presence |= 0x02;
    }
    if msg.server_zone.is_some() {
        presence |= 0x04;
    }
    if msg.service.is_some() {
        presence |= 0x08;
    }
    let mut p = vec![presence];
    for name in [
        &msg.dispatcher,
        &msg.client_zone,
        &msg.server_zone,
        &msg.service,
    ]
    .into_iter()
    .flatten()
    {
        put_name(&mut p, name)?;
    }
    Ok(p)
}

/// Encode add_bind payload.
pub fn encode_add_bind(msg: &AddBindMsg) -> Result<Vec<u8>, ProtocolError> {
    let mut p = Vec::new();
    put_name(&mut p, &msg.instance)?;
    p.push(msg.proto);
    put_addr(&mut p, msg.addr);
    put_u16(&mut p, msg.port);
    Ok(p)
}

/// Encode status payload: `[1B code][2B msg_len][msg]`.
///
/// The message is truncated to 65535 bytes if longer.
pub fn encode_status(code: u8, message: &str) -> Vec<u8> {
    let msg = message.as_bytes();
    let msg_len = msg.len().min(u16::MAX as usize) as u16;
    let mut p = Vec::with_capacity(3 + msg_len as usize);
    p.push(code);
    put_u16(&mut p, msg_len);
    p.extend_from_slice(msg.get(..msg_len as usize).unwrap_or(msg));
    p
}

/// Encode version_reply payload.
pub fn encode_version_reply(major: u8, compat: u8) -> Vec<u8> {
    vec![major, compat]
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode start payload.
pub fn decode_start(payload: &[u8]) -> Result<StartMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let instance = r.name("start instance")?;
    let cookie = match r.u8("start cookie flag")? {
        0 => None,
        _ => Some(r.u64("start cookie")?),
    };
    r.finish("start trailing bytes")?;
    Ok(StartMsg { instance, cookie })
}

/// Decode add_zone payload.
pub fn decode_add_zone(payload: &[u8]) -> Result<AddZoneMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let flags = r.u8("add_zone flags")?;
    let name = r.name("add_zone name")?;
    let unique_name = if flags & 0x01 != 0 {
        Some(r.name("add_zone unique name")?)
    } else {
        None
    };
    let subnet = if flags & 0x02 != 0 {
        Some(r.subnet("add_zone subnet")?)
    } else {
        None
    };
    let parent = if flags & 0x04 != 0 {
        Some(r.name("add_zone parent")?)
    } else {
        None
    };
    r.finish("add_zone trailing bytes")?;
    Ok(AddZoneMsg {
        name,
        unique_name,
        subnet,
        parent,
    })
}

/// Decode a `[1B has_name][name?]` get payload. Returns `None` for a dump.
pub fn decode_get(payload: &[u8]) -> Result<Option<String>, ProtocolError> {
    let mut r = Reader::new(payload);
    let result = match r.u8("get name flag")? {
        0 => None,
        _ => Some(r.name("get name")?),
    };
    r.finish("get trailing bytes")?;
    Ok(result)
}

/// Decode add_service payload.
pub fn decode_add_service(payload: &[u8]) -> Result<AddServiceMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let svc_type = r.u8("add_service type")?;
    let flags = r.u32("add_service flags")?;
    let name = r.name("add_service name")?;
    let presence = r.u8("add_service presence")?;
    let session_count = if presence & 0x01 != 0 {
        Some(r.u32("add_service session count")?)
    } else {
        None
    };
    let router = if presence & 0x02 != 0 {
        let addr = r.addr("add_service router addr")?;
        let port = r.u16("add_service router port")?;
        Some((addr, port))
    } else {
        None
    };
    let deny = if presence & 0x04 != 0 {
        let v4 = r.u8("add_service deny ipv4 method")?;
        let v6 = r.u8("add_service deny ipv6 method")?;
        Some((v4, v6))
    } else {
        None
    };
    r.finish("add_service trailing bytes")?;
    Ok(AddServiceMsg {
        svc_type,
        flags,
        name,
        session_count,
        router,
        deny,
    })
}

fn read_nat_range(r: &mut Reader<'_>, what: &'static str) -> Result<WireNatRange, ProtocolError> {
    Ok(WireNatRange {
        flags: r.u32(what)?,
        min_addr: r.addr4(what)?,
        max_addr: r.addr4(what)?,
        min_port: r.u16(what)?,
        max_port: r.u16(what)?,
    })
}

/// Decode add_service_nat_src / add_service_nat_dst payload.
pub fn decode_add_service_nat(payload: &[u8]) -> Result<AddServiceNatMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let service = r.name("add_service_nat service")?;
    let has_dst = r.u8("add_service_nat dst flag")? != 0;
    let src = read_nat_range(&mut r, "add_service_nat src range")?;
    let dst = if has_dst {
        Some(read_nat_range(&mut r, "add_service_nat dst range")?)
    } else {
        None
    };
    let map = read_nat_range(&mut r, "add_service_nat map range")?;
    r.finish("add_service_nat trailing bytes")?;
    Ok(AddServiceNatMsg {
        service,
        src,
        dst,
        map,
    })
}

/// Decode add_dispatcher payload.
pub fn decode_add_dispatcher(payload: &[u8]) -> Result<AddDispatcherMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let name = r.name("add_dispatcher name")?;
    let num_rules = r.u32("add_dispatcher rule count")?;
    r.finish("add_dispatcher trailing bytes")?;
    Ok(AddDispatcherMsg { name, num_rules })
}

/// Decode add_rule payload.
pub fn decode_add_rule(payload: &[u8]) -> Result<AddRuleMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let dispatcher = r.name("add_rule dispatcher")?;
    let rule_id = r.u32("add_rule rule id")?;
    let service = r.name("add_rule service")?;
    let mut counts = [0u32; DIMENSION_COUNT];
    for count in &mut counts {
        *count = r.u32("add_rule dimension count")?;
    }
    r.finish("add_rule trailing bytes")?;
    Ok(AddRuleMsg {
        dispatcher,
        rule_id,
        service,
        counts,
    })
}

fn read_rule_entry(r: &mut Reader<'_>) -> Result<WireRuleEntry, ProtocolError> {
    match r.u8("rule entry dimension")? {
        DIM_IFNAME => Ok(WireRuleEntry::Ifname(r.name("rule entry ifname")?)),
        DIM_IFGROUP => Ok(WireRuleEntry::Ifgroup(r.u32("rule entry ifgroup")?)),
        DIM_PROTO => Ok(WireRuleEntry::Proto(r.u8("rule entry proto")?)),
        DIM_SRC_PORT => Ok(WireRuleEntry::SrcPort(
            r.u16("rule entry src port")?,
            r.u16("rule entry src port")?,
        )),
        DIM_DST_PORT => Ok(WireRuleEntry::DstPort(
            r.u16("rule entry dst port")?,
            r.u16("rule entry dst port")?,
        )),
        DIM_SRC_SUBNET => Ok(WireRuleEntry::SrcSubnet(r.subnet("rule entry src subnet")?)),
        DIM_SRC_SUBNET6 => Ok(WireRuleEntry::SrcSubnet6(
            r.subnet("rule entry src subnet6")?,
        )),
        DIM_SRC_ZONE => Ok(WireRuleEntry::SrcZone(r.name("rule entry src zone")?)),
        DIM_DST_SUBNET => Ok(WireRuleEntry::DstSubnet(r.subnet("rule entry dst subnet")?)),
        DIM_DST_SUBNET6 => Ok(WireRuleEntry::DstSubnet6(
            r.subnet("rule entry dst subnet6")?,
        )),
        DIM_DST_ZONE => Ok(WireRuleEntry::DstZone(r.name("rule entry dst zone")?)),
        DIM_DST_IFNAME => Ok(WireRuleEntry::DstIfname(r.name("rule entry dst ifname")?)),
        DIM_DST_IFGROUP => Ok(WireRuleEntry::DstIfgroup(r.u32("rule entry dst ifgroup")?)),
        DIM_REQID => Ok(WireRuleEntry::Reqid(r.u32("rule entry reqid")?)),
        _ => Err(ProtocolError::InvalidPayload("unknown rule dimension")),
    }
}

/// Decode add_rule_entry payload.
pub fn decode_add_rule_entry(payload: &[u8]) -> Result<AddRuleEntryMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let dispatcher = r.name("add_rule_entry dispatcher")?;
    let rule_id = r.u32("add_rule_entry rule id")?;
    let count = r.u8("add_rule_entry entry count")? as usize;
    if count > DIMENSION_COUNT {
        return Err(ProtocolError::FieldTooLarge("entries", count));
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(read_rule_entry(&mut r)?);
    }
    r.finish("add_rule_entry trailing bytes")?;
    Ok(AddRuleEntryMsg {
        dispatcher,
        rule_id,
        entries,
    })
}

/// Decode query payload.
pub fn decode_query(payload: &[u8]) -> Result<QueryMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let proto = r.u8("query proto")?;
    let src = r.addr("query src addr")?;
    let src_port = r.u16("query src port")?;
    let dst = r.addr("query dst addr")?;
    let dst_port = r.u16("query dst port")?;
    let ifname = r.name("query ifname")?;
    let presence = r.u8("query presence")?;
    let ifgroup = if presence & 0x01 != 0 {
        Some(r.u32("query ifgroup")?)
    } else {
        None
    };
    let reqid = if presence & 0x02 != 0 {
        Some(r.u32("query reqid")?)
    } else {
        None
    };
    r.finish("query trailing bytes")?;
    Ok(QueryMsg {
        proto,
        src,
        src_port,
        dst,
        dst_port,
        ifname,
        ifgroup,
        reqid,
    })
}

/// Decode query_reply payload.
pub fn decode_query_reply(payload: &[u8]) -> Result<QueryReplyMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let presence = r.u8("query_reply presence")?;
    let mut msg = QueryReplyMsg::default();
    if presence & 0x01 != 0 {
        msg.dispatcher = Some(r.name("query_reply dispatcher")?);
    }
    if presence & 0x02 != 0 {
        msg.client_zone = Some(r.name("query_reply client zone")?);
    }
    if presence & 0x04 != 0 {
        msg.server_zone = Some(r.name("query_reply server zone")?);
    }
    if presence & 0x08 != 0 {
        msg.service = Some(r.name("query_reply service")?);
    }
    r.finish("query_reply trailing bytes")?;
    Ok(msg)
}

/// Decode add_bind payload.
pub fn decode_add_bind(payload: &[u8]) -> Result<AddBindMsg, ProtocolError> {
    let mut r = Reader::new(payload);
    let instance = r.name("add_bind instance")?;
    let proto = r.u8("add_bind proto")?;
    let addr = r.addr("add_bind addr")?;
    let port = r.u16("add_bind port")?;
    r.finish("add_bind trailing bytes")?;
    Ok(AddBindMsg {
        instance,
        proto,
        addr,
        port,
    })
}

/// Decode status payload. Returns `(code, message)`.
pub fn decode_status(payload: &[u8]) -> Result<(u8, String), ProtocolError> {
    let mut r = Reader::new(payload);
    let code = r.u8("status code")?;
    let len = r.u16("status message length")? as usize;
    let bytes = r.take(len, "status message")?;
    let message = std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidPayload("invalid UTF-8 in status message"))?;
    r.finish("status trailing bytes")?;
    Ok((code, message))
}

/// Decode version_reply payload. Returns `(major, compat)`.
pub fn decode_version_reply(payload: &[u8]) -> Result<(u8, u8), ProtocolError> {
    let mut r = Reader::new(payload);
    let major = r.u8("version_reply major")?;
    let compat = r.u8("version_reply compat")?;
    r.finish("version_reply trailing bytes")?;
    Ok((major, compat))
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Incremental frame extractor. Bytes of a partial frame stay buffered
/// between calls until the rest of the frame arrives.
pub struct Decoder {
    pending: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Append `data` and return every frame that is now complete.
    ///
    /// An oversized or undersized length field poisons the stream: the
    /// buffer is dropped and the error returned, since resynchronizing
    /// with the peer is not possible.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<RawMessage>, ProtocolError> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut consumed = 0usize;

        loop {
            let rest = self.pending.get(consumed..).unwrap_or_default();
            if rest.len() < HEADER_SIZE {
                break;
            }
            let mut header = Reader::new(rest);
            let body_len = header.u32("frame length")? as usize;
            if body_len > MAX_MESSAGE_SIZE {
                self.pending.clear();
                return Err(ProtocolError::MessageTooLarge(body_len));
            }
            if body_len < MIN_BODY_SIZE {
                self.pending.clear();
                return Err(ProtocolError::MessageTooSmall(body_len));
            }
            if rest.len() < HEADER_SIZE + body_len {
                break;
            }

            let mut body = Reader::new(header.take(body_len, "frame body")?);
            let opcode = body.u8("frame opcode")?;
            let seq = body.u32("frame seq")?;
            frames.push(RawMessage {
                opcode,
                seq,
                payload: body.rest().to_vec(),
            });
            consumed += HEADER_SIZE + body_len;
        }

        self.pending.drain(..consumed);
        Ok(frames)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn encode_decode_roundtrip_empty_payload() {
        let data = encode(MSG_COMMIT, 3, &[]).unwrap();
        let mut dec = Decoder::new();
        let msgs = dec.decode(&data).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].opcode, MSG_COMMIT);
        assert_eq!(msgs[0].seq, 3);
        assert!(msgs[0].payload.is_empty());
    }

    #[test]
    fn decoder_handles_partial_reads() {
        let data = encode(MSG_GET_VERSION, 7, &[]).unwrap();
        let mut dec = Decoder::new();

        let msgs = dec.decode(&data[..4]).unwrap();
        assert!(msgs.is_empty());

        let msgs = dec.decode(&data[4..]).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].opcode, MSG_GET_VERSION);
        assert_eq!(msgs[0].seq, 7);
    }

    #[test]
    fn decoder_handles_multiple_messages() {
        let mut data = encode(MSG_START, 1, &encode_start(&start_msg()).unwrap()).unwrap();
        data.extend_from_slice(&encode(MSG_COMMIT, 2, &[]).unwrap());

        let mut dec = Decoder::new();
        let msgs = dec.decode(&data).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].opcode, MSG_START);
        assert_eq!(msgs[1].opcode, MSG_COMMIT);
    }

    #[test]
    fn decoder_rejects_too_large() {
        let bad = (2 * MAX_MESSAGE_SIZE as u32).to_be_bytes();
        let mut dec = Decoder::new();
        let err = dec.decode(&bad).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge(_)));
    }

    #[test]
    fn decoder_rejects_too_small() {
        let bad = 2_u32.to_be_bytes();
        let mut dec = Decoder::new();
        let err = dec.decode(&bad).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooSmall(2)));
    }

    #[test]
    fn decoder_byte_by_byte() {
        let data = encode(MSG_GET_BIND, 9, &[]).unwrap();
        let mut dec = Decoder::new();

        for (i, &byte) in data.iter().enumerate() {
            let msgs = dec.decode(&[byte]).unwrap();
            if i < data.len() - 1 {
                assert!(msgs.is_empty());
            } else {
                assert_eq!(msgs.len(), 1);
                assert_eq!(msgs[0].opcode, MSG_GET_BIND);
            }
        }
    }

    fn start_msg() -> StartMsg {
        StartMsg {
            instance: "zorp".to_owned(),
            cookie: Some(0xDEAD_BEEF_0000_0001),
        }
    }

    #[test]
    fn start_roundtrip() {
        let payload = encode_start(&start_msg()).unwrap();
        assert_eq!(decode_start(&payload).unwrap(), start_msg());

        let no_cookie = StartMsg {
            instance: "zorp".to_owned(),
            cookie: None,
        };
        let payload = encode_start(&no_cookie).unwrap();
        assert_eq!(decode_start(&payload).unwrap(), no_cookie);
    }

    #[test]
    fn add_zone_roundtrip_full() {
        let msg = AddZoneMsg {
            name: "office".to_owned(),
            unique_name: Some("office-hq".to_owned()),
            subnet: Some(WireSubnet {
                addr: v4("10.0.0.0"),
                mask: v4("255.0.0.0"),
            }),
            parent: Some("internet".to_owned()),
        };
        let payload = encode_add_zone(&msg).unwrap();
        assert_eq!(decode_add_zone(&payload).unwrap(), msg);
    }

    #[test]
    fn add_zone_roundtrip_minimal() {
        let msg = AddZoneMsg {
            name: "internet".to_owned(),
            unique_name: None,
            subnet: None,
            parent: None,
        };
        let payload = encode_add_zone(&msg).unwrap();
        assert_eq!(decode_add_zone(&payload).unwrap(), msg);
    }

    #[test]
    fn add_zone_ipv6_subnet() {
        let msg = AddZoneMsg {
            name: "v6net".to_owned(),
            unique_name: None,
            subnet: Some(WireSubnet {
                addr: "2001:db8::".parse().unwrap(),
                mask: "ffff:ffff::".parse().unwrap(),
            }),
            parent: None,
        };
        let payload = encode_add_zone(&msg).unwrap();
        assert_eq!(decode_add_zone(&payload).unwrap(), msg);
    }

    #[test]
    fn name_too_long_rejected() {
        let msg = AddZoneMsg {
            name: "x".repeat(NAME_MAX + 1),
            unique_name: None,
            subnet: None,
            parent: None,
        };
        assert!(matches!(
            encode_add_zone(&msg).unwrap_err(),
            ProtocolError::FieldTooLarge("name", _)
        ));
    }

    #[test]
    fn subnet_family_mismatch_rejected() {
        let msg = AddZoneMsg {
            name: "bad".to_owned(),
            unique_name: None,
            subnet: Some(WireSubnet {
                addr: v4("10.0.0.0"),
                mask: "ffff::".parse().unwrap(),
            }),
            parent: None,
        };
        assert!(encode_add_zone(&msg).is_err());
    }

    #[test]
    fn add_service_roundtrip_proxy() {
        let msg = AddServiceMsg {
            svc_type: SVC_PROXY,
            flags: 0x01,
            name: "web".to_owned(),
            session_count: None,
            router: None,
            deny: None,
        };
        let payload = encode_add_service(&msg).unwrap();
        assert_eq!(decode_add_service(&payload).unwrap(), msg);
    }

    #[test]
    fn add_service_roundtrip_forward_with_router() {
        let msg = AddServiceMsg {
            svc_type: SVC_FORWARD,
            flags: 0,
            name: "fwd".to_owned(),
            session_count: Some(12),
            router: Some((v4("192.0.2.1"), 8080)),
            deny: None,
        };
        let payload = encode_add_service(&msg).unwrap();
        assert_eq!(decode_add_service(&payload).unwrap(), msg);
    }

    #[test]
    fn add_service_roundtrip_deny() {
        let msg = AddServiceMsg {
            svc_type: SVC_DENY,
            flags: 0,
            name: "drop".to_owned(),
            session_count: None,
            router: None,
            deny: Some((3, 5)),
        };
        let payload = encode_add_service(&msg).unwrap();
        assert_eq!(decode_add_service(&payload).unwrap(), msg);
    }

    #[test]
    fn add_service_nat_roundtrip() {
        let range = WireNatRange {
            flags: 0x01,
            min_addr: "198.51.100.1".parse().unwrap(),
            max_addr: "198.51.100.8".parse().unwrap(),
            min_port: 1024,
            max_port: 65535,
        };
        let msg = AddServiceNatMsg {
            service: "fwd".to_owned(),
            src: range,
            dst: Some(range),
            map: range,
        };
        let payload = encode_add_service_nat(&msg).unwrap();
        assert_eq!(decode_add_service_nat(&payload).unwrap(), msg);

        let msg = AddServiceNatMsg { dst: None, ..msg };
        let payload = encode_add_service_nat(&msg).unwrap();
        assert_eq!(decode_add_service_nat(&payload).unwrap(), msg);
    }

    #[test]
    fn add_rule_roundtrip() {
        let mut counts = [0u32; DIMENSION_COUNT];
        counts[0] = 2;
        counts[7] = 1;
        let msg = AddRuleMsg {
            dispatcher: "d".to_owned(),
            rule_id: 42,
            service: "web".to_owned(),
            counts,
        };
        let payload = encode_add_rule(&msg).unwrap();
        assert_eq!(decode_add_rule(&payload).unwrap(), msg);
    }

    #[test]
    fn add_rule_entry_roundtrip_all_dimensions() {
        let subnet4 = WireSubnet {
            addr: v4("10.0.0.0"),
            mask: v4("255.255.0.0"),
        };
        let subnet6 = WireSubnet {
            addr: "2001:db8::".parse().unwrap(),
            mask: "ffff:ffff:ffff:ffff::".parse().unwrap(),
        };
        let msg = AddRuleEntryMsg {
            dispatcher: "d".to_owned(),
            rule_id: 1,
            entries: vec![
                WireRuleEntry::Ifname("eth0".to_owned()),
                WireRuleEntry::Ifgroup(3),
                WireRuleEntry::Proto(6),
                WireRuleEntry::SrcPort(1024, 2048),
                WireRuleEntry::DstPort(80, 80),
                WireRuleEntry::SrcSubnet(subnet4),
                WireRuleEntry::SrcSubnet6(subnet6),
                WireRuleEntry::SrcZone("office".to_owned()),
                WireRuleEntry::DstSubnet(subnet4),
                WireRuleEntry::DstSubnet6(subnet6),
                WireRuleEntry::DstZone("internet".to_owned()),
                WireRuleEntry::DstIfname("eth1".to_owned()),
                WireRuleEntry::DstIfgroup(9),
                WireRuleEntry::Reqid(77),
            ],
        };
        let payload = encode_add_rule_entry(&msg).unwrap();
        assert_eq!(decode_add_rule_entry(&payload).unwrap(), msg);
    }

    #[test]
    fn query_roundtrip() {
        let msg = QueryMsg {
            proto: 6,
            src: v4("10.1.2.3"),
            src_port: 33000,
            dst: v4("8.8.8.8"),
            dst_port: 80,
            ifname: "eth0".to_owned(),
            ifgroup: Some(1),
            reqid: None,
        };
        let payload = encode_query(&msg).unwrap();
        assert_eq!(decode_query(&payload).unwrap(), msg);
    }

    #[test]
    fn query_reply_roundtrip() {
        let msg = QueryReplyMsg {
            dispatcher: Some("d".to_owned()),
            client_zone: Some("office".to_owned()),
            server_zone: Some("internet".to_owned()),
            service: Some("web".to_owned()),
        };
        let payload = encode_query_reply(&msg).unwrap();
        assert_eq!(decode_query_reply(&payload).unwrap(), msg);

        let empty = QueryReplyMsg::default();
        let payload = encode_query_reply(&empty).unwrap();
        assert_eq!(decode_query_reply(&payload).unwrap(), empty);
    }

    #[test]
    fn add_bind_roundtrip() {
        let msg = AddBindMsg {
            instance: "zorp".to_owned(),
            proto: 6,
            addr: v4("127.0.0.1"),
            port: 50080,
        };
        let payload = encode_add_bind(&msg).unwrap();
        assert_eq!(decode_add_bind(&payload).unwrap(), msg);
    }

    #[test]
    fn status_roundtrip() {
        let payload = encode_status(STATUS_NOT_FOUND, "no such zone");
        let (code, message) = decode_status(&payload).unwrap();
        assert_eq!(code, STATUS_NOT_FOUND);
        assert_eq!(message, "no such zone");
    }

    #[test]
    fn version_reply_roundtrip() {
        let payload = encode_version_reply(MAJOR_VERSION, COMPAT_VERSION);
        assert_eq!(
            decode_version_reply(&payload).unwrap(),
            (MAJOR_VERSION, COMPAT_VERSION)
        );
    }

    #[test]
    fn truncated_payload_rejected() {
        let payload = encode_query(&QueryMsg {
            proto: 6,
            src: v4("10.0.0.1"),
            src_port: 1,
            dst: v4("10.0.0.2"),
            dst_port: 2,
            ifname: "eth0".to_owned(),
            ifgroup: None,
            reqid: None,
        })
        .unwrap();
        assert!(decode_query(&payload[..payload.len() - 1]).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut payload = encode_start(&start_msg()).unwrap();
        payload.push(0);
        assert!(decode_start(&payload).is_err());
    }

    #[test]
    fn empty_name_rejected() {
        let mut p = Vec::new();
        assert!(put_name(&mut p, "").is_err());
    }
}
