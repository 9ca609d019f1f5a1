//! Restartable entity dumps.
//!
//! A dump pages over the live snapshot, re-loading it between pages. When
//! a commit replaces the snapshot mid-dump the cursor is reset and the
//! buffered output discarded, so a dump is always one consistent pass:
//! either fully pre-commit or fully post-commit, never spliced.

use kzorp::engine::Engine;
use kzorp::snapshot::Snapshot;
use kzorp::{Dispatcher, Service};
use kzorp::zone::Zone;
use kzorp_proto::{
    MSG_ADD_BIND, MSG_ADD_DISPATCHER, MSG_ADD_RULE, MSG_ADD_RULE_ENTRY, MSG_ADD_SERVICE,
    MSG_ADD_ZONE, MSG_DUMP_DONE, ProtocolError, encode, encode_add_bind, encode_add_dispatcher,
    encode_add_rule, encode_add_rule_entry, encode_add_service, encode_add_service_nat,
    encode_add_zone,
};

use crate::wire;

/// Records per page before the dump re-checks the snapshot generation.
pub(crate) const DEFAULT_DUMP_PAGE: usize = 64;

fn frame(opcode: u8, seq: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    encode(opcode, seq, payload)
}

/// Drive a paged dump: `count` sizes the item space of a snapshot, `emit`
/// appends the frames of one item. Restarts from the top whenever the
/// snapshot generation moves between pages.
fn paged_dump(
    engine: &Engine,
    page: usize,
    count: impl Fn(&Snapshot) -> usize,
    mut emit: impl FnMut(&Snapshot, usize, &mut Vec<u8>) -> Result<(), ProtocolError>,
) -> Result<Vec<u8>, ProtocolError> {
    let page = page.max(1);
    let mut out = Vec::new();
    let mut cursor = 0usize;
    let mut generation: Option<u64> = None;
    loop {
        let snapshot = engine.current();
        if generation != Some(snapshot.generation()) {
            generation = Some(snapshot.generation());
            cursor = 0;
            out.clear();
        }
        let total = count(&snapshot);
        let end = (cursor + page).min(total);
        while cursor < end {
            emit(&snapshot, cursor, &mut out)?;
            cursor += 1;
        }
        if cursor >= total {
            return Ok(out);
        }
    }
}

pub(crate) fn emit_zone(zone: &Zone, seq: u32, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    out.extend(frame(
        MSG_ADD_ZONE,
        seq,
        &encode_add_zone(&wire::zone_record(zone))?,
    )?);
    Ok(())
}

pub(crate) fn emit_service(
    service: &Service,
    seq: u32,
    out: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    out.extend(frame(
        MSG_ADD_SERVICE,
        seq,
        &encode_add_service(&wire::service_record(service))?,
    )?);
    for (opcode, record) in wire::service_nat_records(service) {
        out.extend(frame(opcode, seq, &encode_add_service_nat(&record)?)?);
    }
    Ok(())
}

pub(crate) fn emit_dispatcher(
    dispatcher: &Dispatcher,
    seq: u32,
    out: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    out.extend(frame(
        MSG_ADD_DISPATCHER,
        seq,
        &encode_add_dispatcher(&kzorp_proto::AddDispatcherMsg {
            name: dispatcher.name().to_owned(),
            num_rules: dispatcher.alloc_rules(),
        })?,
    )?);
    for rule in dispatcher.rules() {
        out.extend(frame(
            MSG_ADD_RULE,
            seq,
            &encode_add_rule(&wire::rule_record(dispatcher.name(), rule))?,
        )?);
        for row in wire::rule_entry_rows(dispatcher.name(), rule) {
            out.extend(frame(MSG_ADD_RULE_ENTRY, seq, &encode_add_rule_entry(&row)?)?);
        }
    }
    Ok(())
}

fn done(seq: u32, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    out.extend(frame(MSG_DUMP_DONE, seq, &[])?);
    Ok(())
}

pub(crate) fn dump_zones(
    engine: &Engine,
    seq: u32,
    page: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let mut out = paged_dump(
        engine,
        page,
        |s| s.zones().len(),
        |s, i, out| match s.zones().get(i) {
            Some(zone) => emit_zone(zone, seq, out),
            None => Ok(()),
        },
    )?;
    done(seq, &mut out)?;
    Ok(out)
}

pub(crate) fn dump_services(
    engine: &Engine,
    seq: u32,
    page: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let mut out = paged_dump(
        engine,
        page,
        |s| s.services().len(),
        |s, i, out| match s.services().get(i) {
            Some(service) => emit_service(service, seq, out),
            None => Ok(()),
        },
    )?;
    done(seq, &mut out)?;
    Ok(out)
}

pub(crate) fn dump_dispatchers(
    engine: &Engine,
    seq: u32,
    page: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let mut out = paged_dump(
        engine,
        page,
        |s| s.dispatchers().len(),
        |s, i, out| match s.dispatchers().get(i) {
            Some(dispatcher) => emit_dispatcher(dispatcher, seq, out),
            None => Ok(()),
        },
    )?;
    done(seq, &mut out)?;
    Ok(out)
}

/// Binds live outside the snapshot; the row set is cloned atomically under
/// the instance table lock, so one pass is always consistent.
pub(crate) fn dump_binds(engine: &Engine, seq: u32) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    for (instance, bind) in engine.bind_rows() {
        out.extend(frame(
            MSG_ADD_BIND,
            seq,
            &encode_add_bind(&wire::bind_record(&instance, &bind))?,
        )?);
    }
    done(seq, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kzorp_proto::Decoder;
    use kzorp::ZoneParams;

    fn add_zone(engine: &Engine, name: &str) {
        let peer = engine.allocate_peer();
        engine.start_transaction(peer, "inst", None).unwrap();
        engine
            .add_zone(
                peer,
                ZoneParams {
                    name: name.to_owned(),
                    unique_name: None,
                    subnet: None,
                    parent: None,
                },
            )
            .unwrap();
        engine.commit(peer).unwrap();
    }

    #[test]
    fn zone_dump_lists_everything_and_terminates() {
        let engine = Engine::default();
        add_zone(&engine, "a");
        add_zone(&engine, "b");

        let bytes = dump_zones(&engine, 9, DEFAULT_DUMP_PAGE).unwrap();
        let mut decoder = Decoder::new();
        let frames = decoder.decode(&bytes).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.seq == 9));
        assert_eq!(frames[0].opcode, MSG_ADD_ZONE);
        assert_eq!(frames[1].opcode, MSG_ADD_ZONE);
        assert_eq!(frames[2].opcode, MSG_DUMP_DONE);

        let names: Vec<String> = frames[..2]
            .iter()
            .map(|f| kzorp_proto::decode_add_zone(&f.payload).unwrap().name)
            .collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn empty_dump_is_just_done() {
        let engine = Engine::default();
        let bytes = dump_binds(&engine, 1).unwrap();
        let mut decoder = Decoder::new();
        let frames = decoder.decode(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, MSG_DUMP_DONE);
    }

    #[test]
    fn dump_restarts_when_generation_moves() {
        let engine = Engine::default();
        add_zone(&engine, "z0");
        add_zone(&engine, "z1");
        add_zone(&engine, "z2");

        // page size 1 forces a generation check after every record; the
        // commit injected mid-dump must restart the pass, never splice
        let mut committed = false;
        let out = paged_dump(
            &engine,
            1,
            |s| s.zones().len(),
            |s, i, out| {
                if i == 1 && !committed {
                    committed = true;
                    add_zone(&engine, "z3");
                }
                if let Some(zone) = s.zones().get(i) {
                    out.extend_from_slice(zone.unique_name().as_bytes());
                    out.push(b';');
                }
                Ok(())
            },
        )
        .unwrap();

        assert!(committed);
        assert_eq!(String::from_utf8(out).unwrap(), "z0;z1;z2;z3;");
    }
}
