// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Record structs and flag words for basic-block trace processing.
//!
//! Addresses are `u32` (the traced target is a 32-bit machine) and
//! timestamps are `u64`. Symbols and regions are resolved by the trace
//! reader before events reach the reconstruction engine, so everything
//! here is plain read-only data from the engine's perspective.

use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    /// Attributes of a mapped memory region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// The region belongs to the kernel; used to detect
        /// user/kernel mode transitions.
        const KERNEL = 0x1;
    }
}

bitflags! {
    /// Attributes of a resolved function symbol.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SymbolFlags: u32 {
        /// The symbol is the entry point of an exception vector.
        /// Jumping here is always treated as a call.
        const VECTOR_START = 0x1;
        /// The symbol is an exception dispatch table. Jumping into it
        /// is always treated as a call, and the table frame is popped
        /// when the handler proper is entered.
        const VECTOR_TABLE = 0x2;
    }
}

/// A mapped memory region containing code.
#[derive(Debug)]
pub struct Region {
    /// A human-readable name, for diagnostics only.
    pub name: String,
    /// The load base address of the region.
    pub base: u32,
    pub flags: RegionFlags,
}

impl Region {
    pub fn new<S: Into<String>>(name: S, base: u32, flags: RegionFlags) -> Region {
        Region {
            name: name.into(),
            base,
            flags,
        }
    }

    pub fn is_kernel(&self) -> bool {
        self.flags.contains(RegionFlags::KERNEL)
    }
}

/// A resolved function symbol.
///
/// Two symbols denote the same function iff their [global addresses]
/// are equal; compare them with [`Symbol::same_function`] rather than by
/// value, since hosts may materialize duplicate `Symbol` values for one
/// function.
///
/// [global addresses]: Symbol::global_addr
#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    /// The symbol's start address, relative to its region's base.
    pub addr: u32,
    pub region: Arc<Region>,
    pub flags: SymbolFlags,
    /// For an interpreted method, the native symbol of the interpreter
    /// function executing it. Present iff the symbol belongs to the
    /// managed layer.
    pub shadow: Option<Arc<Symbol>>,
}

impl Symbol {
    pub fn new<S: Into<String>>(
        name: S,
        addr: u32,
        region: Arc<Region>,
        flags: SymbolFlags,
    ) -> Symbol {
        Symbol {
            name: name.into(),
            addr,
            region,
            flags,
            shadow: None,
        }
    }

    /// The absolute address of the function entry point.
    pub fn global_addr(&self) -> u32 {
        self.addr.wrapping_add(self.region.base)
    }

    /// Whether this symbol is an interpreted method overlaid on the
    /// native stack.
    pub fn is_managed(&self) -> bool {
        self.shadow.is_some()
    }

    /// Symbol identity: same function iff same global address.
    pub fn same_function(&self, other: &Symbol) -> bool {
        self.global_addr() == other.global_addr()
    }
}

/// Instruction encoding width of a basic block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsnWidth {
    /// 4-byte instruction words.
    Wide,
    /// 2-byte instruction words.
    Compact,
}

impl InsnWidth {
    /// Size of one instruction, in bytes.
    pub fn insn_size(self) -> u32 {
        match self {
            InsnWidth::Wide => 4,
            InsnWidth::Compact => 2,
        }
    }
}

impl Default for InsnWidth {
    fn default() -> Self {
        InsnWidth::Wide
    }
}

/// One executed basic block, as delivered by the trace reader.
///
/// Events arrive in non-decreasing timestamp order, one per executed
/// block, already attributed to a resolved [`Symbol`]. Only the last
/// instruction word of a block is ever consulted, so that is all the
/// event carries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockEvent {
    pub time: u64,
    /// Absolute address of the first instruction in the block.
    pub addr: u32,
    /// Number of instructions executed in the block.
    pub insn_count: u32,
    pub width: InsnWidth,
    /// The raw word of the block's last instruction.
    pub last_insn: u32,
}

impl BlockEvent {
    /// The address one past the end of the block, i.e. where execution
    /// resumes if the block falls through or returns after a call made
    /// by its last instruction.
    pub fn end_addr(&self) -> u32 {
        self.addr
            .wrapping_add(self.insn_count.wrapping_mul(self.width.insn_size()))
    }
}

/// Classification of a raw instruction word, as produced by an
/// [`InsnDecoder`](crate::traits::InsnDecoder).
///
/// The reconstruction heuristic only cares about a handful of shapes;
/// everything else is [`InsnKind::Other`]. An undecodable word is
/// [`InsnKind::Invalid`], which the heuristic deliberately treats like a
/// non-branch (biasing the verdict toward a return).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsnKind {
    /// A plain branch to a label, not a call.
    Branch,
    /// A branch-and-link, i.e. a function call.
    BranchLink,
    /// A register-exchange branch, the common register-return form.
    BranchExchange,
    /// A load-multiple or pop that reloads the program counter.
    ReturnLoad,
    /// Any other instruction.
    Other,
    /// The decoder could not classify the word.
    Invalid,
}

impl InsnKind {
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            InsnKind::Branch | InsnKind::BranchLink | InsnKind::BranchExchange
        )
    }

    pub fn is_branch_link(self) -> bool {
        self == InsnKind::BranchLink
    }
}

/// Whether a method record marks an entry or an exit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MethodEventKind {
    Enter,
    Exit,
}

/// One interpreted-method event from the managed runtime's own trace.
///
/// These records are ground truth for the managed layer: an interpreted
/// frame is only ever pushed or popped on a matching record. The stream
/// is global and time-ordered across all traced execution contexts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MethodRecord {
    pub time: u64,
    /// Absolute address of the method symbol.
    pub addr: u32,
    pub kind: MethodEventKind,
}

impl MethodRecord {
    pub fn is_entry(&self) -> bool {
        self.kind == MethodEventKind::Enter
    }
}
