// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The shared lookahead cursor over the interpreted-method event stream.

use std::cell::RefCell;
use std::rc::Rc;

use bbtrace_common::format::MethodRecord;
use bbtrace_common::traits::MethodSource;
use tracing::warn;

/// A two-record lookahead window over the global method-event stream.
///
/// The managed runtime emits one unified trace for the whole process, so
/// a single `MethodTrace` is created per trace session and shared by
/// every [`CallStack`](crate::CallStack) instance reading from it. The
/// instances must consume it in global timestamp order; sharing is by
/// `Rc<RefCell<_>>` and access is single-writer by construction
/// (processing is single-threaded and each borrow is confined to one
/// engine dispatch).
pub struct MethodTrace {
    reader: Box<dyn MethodSource>,
    current: Option<MethodRecord>,
    next: Option<MethodRecord>,
}

impl MethodTrace {
    /// Creates the cursor and primes the lookahead window with the first
    /// two records of the stream.
    pub fn new(mut reader: Box<dyn MethodSource>) -> MethodTrace {
        let current = reader.next_record();
        let next = if current.is_some() {
            reader.next_record()
        } else {
            None
        };
        MethodTrace {
            reader,
            current,
            next,
        }
    }

    /// Convenience constructor producing the shared handle handed to
    /// each `CallStack`.
    pub fn shared(reader: Box<dyn MethodSource>) -> Rc<RefCell<MethodTrace>> {
        Rc::new(RefCell::new(MethodTrace::new(reader)))
    }

    /// The record currently in the window, if any.
    pub fn current(&self) -> Option<&MethodRecord> {
        self.current.as_ref()
    }

    /// Slides the window forward while the *next* record is at or before
    /// `time`.
    ///
    /// This re-aligns the window when block events run ahead of the
    /// method stream, e.g. after an exit record whose entry predates the
    /// trace. Records skipped over this way are dropped.
    pub fn resync(&mut self, time: u64) {
        while self.next.as_ref().map_or(false, |next| time >= next.time) {
            if let Some(dropped) = self.current.take() {
                warn!(
                    "method record at t={} addr={:#010x} unmatched, dropping",
                    dropped.time, dropped.addr
                );
            }
            self.advance();
        }
    }

    /// Consumes the current record after a successful match.
    pub fn consume(&mut self) {
        self.advance();
    }

    fn advance(&mut self) {
        self.current = self.next.take();
        self.next = if self.current.is_some() {
            self.reader.next_record()
        } else {
            None
        };
    }
}

impl std::fmt::Debug for MethodTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTrace")
            .field("current", &self.current)
            .field("next", &self.next)
            .finish()
    }
}
