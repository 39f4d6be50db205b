// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::sync::Arc;

use bbtrace_common::format::{
    BlockEvent, InsnKind, InsnWidth, MethodEventKind, MethodRecord, Region, RegionFlags, Symbol,
    SymbolFlags,
};
use bbtrace_common::traits::InsnDecoder;

use crate::call_stack::CallStack;
use crate::method_trace::MethodTrace;

fn record(time: u64, addr: u32, kind: MethodEventKind) -> MethodRecord {
    MethodRecord { time, addr, kind }
}

fn cursor(records: Vec<MethodRecord>) -> MethodTrace {
    MethodTrace::new(Box::new(records.into_iter()))
}

#[test]
fn test_priming() {
    let empty = cursor(vec![]);
    assert!(empty.current().is_none());

    let one = cursor(vec![record(10, 0x100, MethodEventKind::Enter)]);
    assert_eq!(one.current().unwrap().time, 10);

    let two = cursor(vec![
        record(10, 0x100, MethodEventKind::Enter),
        record(20, 0x200, MethodEventKind::Enter),
    ]);
    assert_eq!(two.current().unwrap().time, 10);
}

#[test]
fn test_resync_drops_stale_records() {
    let mut c = cursor(vec![
        record(10, 0x100, MethodEventKind::Enter),
        record(20, 0x200, MethodEventKind::Enter),
        record(30, 0x300, MethodEventKind::Exit),
    ]);

    // Events have run ahead to t=25: the t=10 record was never matched
    // and is dropped, the t=20 record becomes current.
    c.resync(25);
    assert_eq!(c.current().unwrap().time, 20);

    c.consume();
    assert_eq!(c.current().unwrap().time, 30);
    c.consume();
    assert!(c.current().is_none());
}

#[test]
fn test_resync_does_not_skip_future_records() {
    let mut c = cursor(vec![
        record(10, 0x100, MethodEventKind::Enter),
        record(20, 0x200, MethodEventKind::Enter),
    ]);
    c.resync(5);
    assert_eq!(c.current().unwrap().time, 10);
}

struct NopDecoder;

impl InsnDecoder for NopDecoder {
    fn decode(&self, _insn: u32, _width: InsnWidth) -> InsnKind {
        InsnKind::Other
    }
}

fn method_symbol(region: &Arc<Region>, shadow: &Arc<Symbol>, name: &str, addr: u32) -> Arc<Symbol> {
    let mut sym = Symbol::new(name, addr, region.clone(), SymbolFlags::empty());
    sym.shadow = Some(shadow.clone());
    Arc::new(sym)
}

/// The method stream is global: two per-thread engines share one cursor
/// and each consumes the records belonging to its own events, in
/// timestamp order.
#[test]
fn test_cursor_shared_between_stacks() {
    let user = Arc::new(Region::new("app", 0x10000, RegionFlags::empty()));
    let managed = Arc::new(Region::new("dex", 0x50000, RegionFlags::empty()));
    let interp = Arc::new(Symbol::new("interp", 0x4000, user, SymbolFlags::empty()));
    let m1 = method_symbol(&managed, &interp, "m1", 0x5000);
    let m2 = method_symbol(&managed, &interp, "m2", 0x6000);

    let methods = MethodTrace::shared(Box::new(
        vec![
            record(15, 0x55000, MethodEventKind::Enter),
            record(25, 0x56000, MethodEventKind::Enter),
        ]
        .into_iter(),
    ));

    let mut thread1 = CallStack::new(1, 16, methods.clone(), NopDecoder, ());
    let mut thread2 = CallStack::new(2, 16, methods, NopDecoder, ());

    let enter_m1 = BlockEvent {
        time: 20,
        addr: 0x55000,
        insn_count: 2,
        width: InsnWidth::Wide,
        last_insn: 0,
    };
    let enter_m2 = BlockEvent {
        time: 30,
        addr: 0x56000,
        ..enter_m1.clone()
    };

    assert_eq!(thread1.id(), 1);
    thread1.update(&enter_m1, &m1).unwrap();
    assert_eq!(thread1.depth(), 1);
    assert!(thread1.frames()[0].is_interpreted());

    thread2.update(&enter_m2, &m2).unwrap();
    assert_eq!(thread2.depth(), 1);
    assert!(thread2.frames()[0].is_interpreted());
}
