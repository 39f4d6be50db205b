// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Traits for the external collaborators of the reconstruction engine.

use crate::format::{InsnKind, InsnWidth, MethodRecord};

/// Classifies raw instruction words for the push/pop heuristic.
///
/// The engine never decodes instructions itself; it hands the raw word of
/// the previous block's last instruction to an `InsnDecoder` along with
/// the block's encoding width and acts on the returned [`InsnKind`].
/// A decoder should return [`InsnKind::Invalid`] for words it cannot
/// classify rather than guessing.
pub trait InsnDecoder {
    fn decode(&self, insn: u32, width: InsnWidth) -> InsnKind;
}

/// A sequential reader of the global interpreted-method event stream.
///
/// Records must be produced in non-decreasing timestamp order. `None`
/// means the stream is exhausted; the reader will not be polled again
/// after that.
pub trait MethodSource {
    fn next_record(&mut self) -> Option<MethodRecord>;
}

/// Implement `MethodSource` for plain iterators for convenience; tests
/// and in-memory traces use this.
impl<I> MethodSource for I
where
    I: Iterator<Item = MethodRecord>,
{
    fn next_record(&mut self) -> Option<MethodRecord> {
        self.next()
    }
}
