// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Stack frames and the per-frame notification hook.

use std::sync::Arc;

use bbtrace_common::format::Symbol;
use bitflags::bitflags;

bitflags! {
    /// Status bits of a reconstructed stack frame.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// The function in this frame was interrupted by an exception;
        /// the kernel frames above it return here when the handler is
        /// done.
        const CAUSED_EXCEPTION = 0x1;
        /// The frame is an interpreted method; it moves only on
        /// matching method-trace records, never on the address
        /// heuristic.
        const INTERPRETED = 0x2;
        /// Frames that an unwind search must not discard. Exception
        /// frames are released by the matching return, interpreted
        /// frames by exactly one consumed method-exit record.
        const POP_BARRIER = Self::CAUSED_EXCEPTION.bits() | Self::INTERPRETED.bits();
    }
}

/// A single reconstructed stack frame.
#[derive(Clone, Debug)]
pub struct StackFrame {
    /// The function occupying this level of the stack.
    pub function: Arc<Symbol>,
    /// The address expected to trigger this frame's pop when execution
    /// reaches it again. Zero for interpreted and synthetic frames,
    /// which are never popped by address.
    pub return_addr: u32,
    pub flags: FrameFlags,
    /// Event time minus the accumulated not-scheduled offset of this
    /// execution context.
    pub time: u64,
    /// `time` with the not-scheduled offset added back, comparable
    /// across execution contexts.
    pub global_time: u64,
}

impl StackFrame {
    pub fn is_interpreted(&self) -> bool {
        self.flags.contains(FrameFlags::INTERPRETED)
    }
}

/// Receives a notification for every frame pushed or popped.
///
/// This is the engine's only per-transition side channel: anything that
/// materializes or visualizes the reconstructed stack implements this and
/// mirrors the frame lifecycle into its own structures. The overlay
/// reconciliation performed when the interpreted layer empties reports
/// through the same hooks.
///
/// `()` implements the trait as a no-op for callers that only query the
/// stack after the fact.
pub trait FrameObserver {
    /// A frame was pushed at `level` (0 is the bottom of the stack).
    fn on_push(&mut self, level: usize, time: u64, frame: &StackFrame) {
        let _ = (level, time, frame);
    }

    /// The frame at `level` was popped.
    fn on_pop(&mut self, level: usize, time: u64, frame: &StackFrame) {
        let _ = (level, time, frame);
    }
}

impl FrameObserver for () {}
