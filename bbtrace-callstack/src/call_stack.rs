// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The call-stack reconstruction engine.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use bbtrace_common::format::{BlockEvent, InsnKind, Symbol, SymbolFlags};
use bbtrace_common::traits::InsnDecoder;
use tracing::{error, trace};

use crate::frame::{FrameFlags, FrameObserver, StackFrame};
use crate::method_trace::MethodTrace;

/// Errors produced while reconstructing a call stack.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The frame store hit its fixed capacity. A truncated stack would
    /// silently corrupt everything downstream, so this ends the run.
    #[error("too many stack frames ({0})")]
    TooManyFrames(usize),
}

/// The verdict for one basic-block event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Action {
    None,
    Push,
    Pop,
}

/// Reconstructs the call stack of one traced execution context from its
/// basic-block events.
///
/// The trace records which block of which function executed when, but
/// not whether control got there by a call or a return; `CallStack`
/// disambiguates using the previous block's last instruction, the shape
/// of the address transition, kernel/user region crossings, and (for
/// interpreted methods) the managed runtime's own entry/exit records.
///
/// Feed events in timestamp order with [`update`](CallStack::update),
/// then drain with [`pop_all`](CallStack::pop_all) when the context's
/// trace ends. Every frame transition is reported to the injected
/// [`FrameObserver`].
pub struct CallStack<D: InsnDecoder, O: FrameObserver> {
    id: u32,
    decoder: D,
    observer: O,
    method_trace: Rc<RefCell<MethodTrace>>,

    /// When set, interpreted methods are collapsed to their native
    /// shadow symbol and no interpreted bookkeeping happens.
    native_only: bool,

    capacity: usize,
    frames: Vec<StackFrame>,
    /// Frames flagged INTERPRETED currently on the stack.
    interp_depth: usize,

    /// Copy of the native stack taken when the first interpreted frame
    /// is pushed; reconciled against the live stack when the last one
    /// is popped.
    snapshot: Vec<StackFrame>,

    prev_function: Option<Arc<Symbol>>,
    prev_event: BlockEvent,

    /// The last event/function seen in user mode, remembered across
    /// kernel entries. A return can be masked by an interrupt firing
    /// before the first caller instruction runs; this is the state to
    /// replay the decision from once the kernel exits.
    user_function: Option<Arc<Symbol>>,
    user_event: BlockEvent,

    skipped_time: u64,
    last_run_time: u64,
}

impl<D: InsnDecoder, O: FrameObserver> CallStack<D, O> {
    /// Creates an engine for one traced execution context with a fixed
    /// frame capacity, reading interpreted-method ground truth from the
    /// shared `method_trace` cursor.
    pub fn new(
        id: u32,
        capacity: usize,
        method_trace: Rc<RefCell<MethodTrace>>,
        decoder: D,
        observer: O,
    ) -> CallStack<D, O> {
        CallStack {
            id,
            decoder,
            observer,
            method_trace,
            native_only: false,
            capacity,
            frames: Vec::with_capacity(capacity),
            interp_depth: 0,
            snapshot: Vec::with_capacity(capacity),
            prev_function: None,
            prev_event: BlockEvent::default(),
            user_function: None,
            user_event: BlockEvent::default(),
            skipped_time: 0,
            last_run_time: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Set to true if you don't want to see any interpreted methods.
    pub fn set_native_only(&mut self, native_only: bool) {
        self.native_only = native_only;
    }

    /// Current stack depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The live frames, bottom of the stack first.
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// Number of interpreted frames currently on the stack; nonzero
    /// exactly while the managed-layer overlay is active.
    pub fn interpreted_depth(&self) -> usize {
        self.interp_depth
    }

    /// Event time adjusted back to the global clock.
    pub fn global_time(&self, time: u64) -> u64 {
        time + self.skipped_time
    }

    /// The context was scheduled back in at `time`.
    pub fn thread_start(&mut self, time: u64) {
        self.skipped_time += time.saturating_sub(self.last_run_time);
    }

    /// The context was scheduled out at `time`.
    pub fn thread_stop(&mut self, time: u64) {
        self.last_run_time = time;
    }

    /// Processes one basic-block event attributed to `function`,
    /// applying whatever pushes and pops it implies.
    pub fn update(&mut self, event: &BlockEvent, function: &Arc<Symbol>) -> Result<(), Error> {
        let mut function = function.clone();
        if self.native_only {
            // Collapse interpreted methods to the native function
            // executing them.
            if let Some(shadow) = &function.shadow {
                function = shadow.clone();
            }
        }

        let action = self.classify(event, &function);
        let method_action = self.method_action(event, &function);
        trace!(
            "stack {}: t={} {} action={:?} method={:?}",
            self.id,
            event.time,
            function.name,
            action,
            method_action
        );

        let prev_is_native = self
            .prev_function
            .as_ref()
            .map_or(true, |prev| !prev.is_managed());
        if action == Action::Pop && prev_is_native {
            // Pop off the native function first, then let the method
            // trace move the interpreted layer.
            self.do_pop(event, &function, Action::None);
            match method_action {
                Action::Pop => self.do_pop(event, &function, Action::Pop),
                Action::Push => self.do_push(event, &function)?,
                Action::None => {}
            }
        } else {
            let action = if method_action != Action::None {
                // The method trace is ground truth.
                method_action
            } else if function.is_managed() {
                // Never move an interpreted method without a matching
                // method record.
                Action::None
            } else {
                action
            };
            match action {
                Action::Pop => self.do_pop(event, &function, method_action),
                Action::Push => self.do_push(event, &function)?,
                Action::None => {}
            }
        }

        // The reconstruction always represents something executing: an
        // emptied stack immediately gets the current function back.
        if self.frames.is_empty() {
            let time = event.time.saturating_sub(self.skipped_time);
            self.simple_push(function.clone(), 0, time)?;
        }

        self.prev_function = Some(function);
        self.prev_event = event.clone();
        Ok(())
    }

    /// Pops every remaining frame; call at end of trace.
    pub fn pop_all(&mut self, time: u64) {
        let time = time.saturating_sub(self.skipped_time);
        while !self.frames.is_empty() {
            self.simple_pop(time);
        }
    }

    /// Decides whether `event` represents a function entry, an exit, or
    /// neither, from the previous block's last instruction and the
    /// shape of the address transition.
    fn classify(&mut self, event: &BlockEvent, function: &Arc<Symbol>) -> Action {
        // Offset of this block from the start of the function; zero
        // means the block is the function entry point.
        let offset = event
            .addr
            .wrapping_sub(function.addr)
            .wrapping_sub(function.region.base);

        let kind = if self.prev_event.insn_count > 0 {
            self.decoder
                .decode(self.prev_event.last_insn, self.prev_event.width)
        } else {
            InsnKind::Invalid
        };

        // If this block directly follows the previous one, it is plain
        // fall-through. Without this check a skipped conditional
        // return-load at the end of the previous block would read as a
        // POP, and fall-through into a local symbol would read as a
        // PUSH.
        if self.prev_event.end_addr() == event.addr {
            return Action::None;
        }

        let same_function = self
            .prev_function
            .as_ref()
            .map_or(false, |prev| prev.same_function(function));
        if same_function {
            if self.prev_event.insn_count > 0 {
                // At the entry point without a plain branch leading
                // here: the function called itself.
                if offset == 0 && kind != InsnKind::Branch {
                    return Action::Push;
                }
                // A return load landing elsewhere in the same function:
                // it returned to itself.
                if offset != 0 && kind == InsnKind::ReturnLoad {
                    return Action::Pop;
                }
            }
            return Action::None;
        }

        let prev_kernel = self
            .prev_function
            .as_ref()
            .map_or(false, |prev| prev.region.is_kernel());
        let cur_kernel = function.region.is_kernel();
        if !prev_kernel && cur_kernel {
            // Entering the kernel. Remember where user mode left off in
            // case this interrupt masked a return.
            self.user_event = self.prev_event.clone();
            self.user_function = self.prev_function.clone();
        } else if prev_kernel && !cur_kernel {
            // Kernel back to user mode is always an exit.
            return Action::Pop;
        }

        let mut action = Action::Push;
        if offset != 0 && self.prev_function.is_some() {
            // Jumping into the middle of another function is usually a
            // return, unless the previous instruction was a call. A
            // plain branch to a local label is neither.
            if !kind.is_branch() || kind == InsnKind::BranchExchange {
                action = Action::Pop;
            } else if !kind.is_branch_link() {
                action = Action::None;
            }
            if function.flags.contains(SymbolFlags::VECTOR_TABLE) {
                action = Action::Push;
            }
        }
        action
    }

    /// Matches `event` against the shared method-record window. Only
    /// meaningful when the current or previous function is managed;
    /// a hit consumes the record and outranks the address heuristic.
    fn method_action(&mut self, event: &BlockEvent, function: &Arc<Symbol>) -> Action {
        let prev_managed = self
            .prev_function
            .as_ref()
            .map_or(false, |prev| prev.is_managed());
        if !function.is_managed() && !prev_managed {
            return Action::None;
        }

        let prev_addr = self.prev_function.as_ref().map(|prev| prev.global_addr());
        let addr = function.global_addr();

        let mut methods = self.method_trace.borrow_mut();
        methods.resync(event.time);

        if let Some(&record) = methods.current() {
            if event.time >= record.time
                && (record.addr == addr || Some(record.addr) == prev_addr)
            {
                methods.consume();
                return if record.is_entry() {
                    Action::Push
                } else {
                    Action::Pop
                };
            }
        }
        Action::None
    }

    /// Pushes `function`, fixing up the stack first for vector-table
    /// dispatch and for kernel frames left over from a fault taken on
    /// the call itself.
    fn do_push(&mut self, event: &BlockEvent, function: &Arc<Symbol>) -> Result<(), Error> {
        let time = event.time.saturating_sub(self.skipped_time);

        if self.frames.len() >= self.capacity {
            return Err(self.overflow());
        }

        // Compute the return address up front; the fixups below may
        // replace it.
        let mut return_addr = self.prev_event.end_addr();

        // Interpreted methods are popped by method records, never by
        // address; a real return address here would only produce false
        // matches in the unwind search.
        if function.is_managed() {
            return_addr = 0;
        }

        // A vector-table frame only dispatches; replace it with the
        // handler being entered, which inherits its return address.
        let prev_vector = self
            .prev_function
            .as_ref()
            .map_or(false, |prev| prev.flags.contains(SymbolFlags::VECTOR_TABLE));
        if prev_vector && !self.frames.is_empty() {
            if let Some(top) = self.frames.last() {
                return_addr = top.return_addr;
            }
            self.simple_pop(time);
        }

        let prev_kernel = self
            .prev_function
            .as_ref()
            .map_or(false, |prev| prev.region.is_kernel());
        if prev_kernel && !function.region.is_kernel() && !self.frames.is_empty() {
            // F1 called F2 and the first instruction of F2 faulted, so
            // the trace shows the kernel "calling" F2. Pop the kernel
            // frames back down to the caller that took the exception
            // and return F2's return address to F1.
            loop {
                let popped = self.simple_pop(time);
                if let Some(top) = self.frames.last_mut() {
                    if top.flags.contains(FrameFlags::CAUSED_EXCEPTION) {
                        top.flags.remove(FrameFlags::CAUSED_EXCEPTION);
                        if let Some(popped) = popped {
                            return_addr = popped.return_addr;
                        }
                        break;
                    }
                }
                if self.frames.is_empty() {
                    break;
                }
            }
        }

        // Entering an exception handler: mark the interrupted frame so
        // the unwind knows where the handler returns.
        if function.flags.contains(SymbolFlags::VECTOR_START) {
            if let Some(top) = self.frames.last_mut() {
                top.flags.insert(FrameFlags::CAUSED_EXCEPTION);
            }
        }

        self.simple_push(function.clone(), return_addr, time)
    }

    /// Pops frames down to the level matched by the unwind search.
    ///
    /// `method_action` is the method-trace verdict for this event; a
    /// `Pop` verdict lets the search cross exactly one interpreted
    /// barrier frame.
    fn do_pop(&mut self, event: &BlockEvent, function: &Arc<Symbol>, method_action: Action) {
        let time = event.time.saturating_sub(self.skipped_time);
        let top = self.frames.len();

        // Search backward for a frame whose return address matches this
        // event. The common case pops one frame, but multi-level
        // unwinds happen.
        let mut target = None;
        let mut allow_method_pop = method_action == Action::Pop;
        for level in (0..top).rev() {
            let frame = &self.frames[level];
            if event.addr == frame.return_addr {
                target = Some(level);
                break;
            }
            if frame.flags.intersects(FrameFlags::POP_BARRIER) {
                if frame.is_interpreted() && allow_method_pop {
                    // At most one method pop per matched exit record.
                    allow_method_pop = false;
                    continue;
                }
                break;
            }
        }

        // No return address matched; search again for the function
        // itself and pop down to (but not including) it.
        let mut target = target.unwrap_or_else(|| {
            let mut allow_method_pop = method_action == Action::Pop;
            for level in (0..top).rev() {
                let frame = &self.frames[level];
                if frame.function.same_function(function) {
                    return level + 1;
                }
                if frame.flags.intersects(FrameFlags::POP_BARRIER) {
                    if frame.is_interpreted() && allow_method_pop {
                        allow_method_pop = false;
                        continue;
                    }
                    return level + 1;
                }
            }
            // Nothing matched at all: unwind everything. The trace may
            // have started mid-execution with call history we never
            // saw, and emptying the stack is the faithful reading.
            0
        });

        // If we are emptying the stack and the bottom frame is already
        // the current function, keep it rather than popping and
        // immediately re-pushing it.
        if target == 0 && !self.frames.is_empty() && self.frames[0].function.same_function(function)
        {
            target = 1;
        }

        while self.frames.len() > target {
            self.simple_pop(time);
        }

        // Whatever exception was pending below has now been unwound
        // past.
        if let Some(top) = self.frames.last_mut() {
            top.flags.remove(FrameFlags::CAUSED_EXCEPTION);
        }

        // Kernel exit: the interrupt may have masked a return that
        // happened just before it. Replay the decision from the saved
        // user-mode state; the replay terminates because that state is
        // already user-mode.
        let prev_kernel = self
            .prev_function
            .as_ref()
            .map_or(false, |prev| prev.region.is_kernel());
        if prev_kernel && !function.region.is_kernel() {
            self.prev_event = self.user_event.clone();
            self.prev_function = self.user_function.clone();
            if self.classify(event, function) == Action::Pop {
                self.do_pop(event, function, method_action);
            }
        }
    }

    /// Pushes one frame and reports it to the observer. Entering the
    /// managed layer (interpreted depth 0 to 1) snapshots the native
    /// stack first.
    fn simple_push(&mut self, function: Arc<Symbol>, return_addr: u32, time: u64) -> Result<(), Error> {
        if self.frames.len() >= self.capacity {
            return Err(self.overflow());
        }

        let managed = function.is_managed();
        if !self.native_only && managed {
            if self.interp_depth == 0 {
                self.snapshot_native_stack();
            }
            self.interp_depth += 1;
        }

        let level = self.frames.len();
        let mut flags = FrameFlags::empty();
        if managed {
            flags.insert(FrameFlags::INTERPRETED);
        }
        self.frames.push(StackFrame {
            function,
            return_addr,
            flags,
            time,
            global_time: time + self.skipped_time,
        });
        self.observer.on_push(level, time, &self.frames[level]);
        Ok(())
    }

    /// Pops one frame, reports it, and returns it. Leaving the managed
    /// layer (interpreted depth 1 to 0) reconciles the observer's view
    /// of the native stack.
    fn simple_pop(&mut self, time: u64) -> Option<StackFrame> {
        let frame = self.frames.pop()?;
        self.observer.on_pop(self.frames.len(), time, &frame);

        if !self.native_only && frame.function.is_managed() {
            self.interp_depth -= 1;
            if self.interp_depth == 0 {
                self.reconcile_native_stack(time);
            }
        }
        Some(frame)
    }

    /// Copies the live stack into the snapshot buffer.
    fn snapshot_native_stack(&mut self) {
        self.snapshot.clear();
        self.snapshot.extend(self.frames.iter().cloned());
    }

    /// The native stack may have moved underneath the interpreted
    /// frames while the observer only saw the managed layer. Replay the
    /// difference: pop the stale snapshot levels from the first
    /// divergence up, then push the live frames from there.
    fn reconcile_native_stack(&mut self, time: u64) {
        let top = self.frames.len().min(self.snapshot.len());
        for level in 0..top {
            if self.snapshot[level]
                .function
                .same_function(&self.frames[level].function)
            {
                continue;
            }
            for stale in (level..top).rev() {
                self.observer.on_pop(stale, time, &self.snapshot[stale]);
            }
            for live in level..self.frames.len() {
                self.observer.on_push(live, time, &self.frames[live]);
            }
            break;
        }
    }

    fn overflow(&self) -> Error {
        error!(
            "stack {}: too many stack frames ({}), skipped_time: {}",
            self.id,
            self.frames.len(),
            self.skipped_time
        );
        for (level, frame) in self.frames.iter().enumerate() {
            error!(
                "  {}: t {} gt {} f {:#x} {:#010x} {:#010x} {}",
                level,
                frame.time,
                frame.global_time,
                frame.flags.bits(),
                frame.return_addr,
                frame.function.global_addr(),
                frame.function.name
            );
        }
        Error::TooManyFrames(self.frames.len())
    }
}
