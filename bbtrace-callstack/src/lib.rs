// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A library for reconstructing call-stack timelines from instruction-level
//! basic-block traces.
//!
//! The trace says which basic block of which function executed when; it does
//! not say whether control arrived there by a call or a return. [`CallStack`]
//! infers function entries and exits from the previous block's last
//! instruction and the shape of each address transition, keeps the inferred
//! frame stack consistent across kernel entries, exception vectors and
//! self-recursion, and synchronizes the interpreted-method layer against the
//! managed runtime's own entry/exit trace (a shared, time-ordered
//! [`MethodTrace`] cursor).
//!
//! Instruction decoding and record reading are supplied by the caller
//! through the traits in [bbtrace-common](https://crates.io/crates/bbtrace-common);
//! every reconstructed push and pop is reported through a [`FrameObserver`].

mod call_stack;
mod frame;
mod method_trace;

pub use crate::call_stack::*;
pub use crate::frame::*;
pub use crate::method_trace::*;

#[cfg(test)]
mod method_trace_unittest;
