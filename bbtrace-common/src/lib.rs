// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! This crate defines the [record structs and flag words](format/index.html) shared by the
//! bbtrace crates, as well as [the traits](traits/index.html) used to plug in the external
//! instruction decoder and method-trace reader.
//!
//! You probably don't want to use this crate directly, the [bbtrace-callstack][callstack]
//! crate provides the actual call-stack reconstruction built on these types.
//!
//! [callstack]: https://crates.io/crates/bbtrace-callstack

pub mod format;
pub mod traits;
