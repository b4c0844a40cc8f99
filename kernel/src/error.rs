//! Kernel error codes
//!
//! Every kernel operation returns a signed word: non-negative values carry
//! the operation result, negative values carry one of the error codes below.
//! The codes are stable across releases; user-space runtimes match on the
//! raw numbers.
//!
//! Errors never cross CPUs. A fault taken by a thread is reported through
//! the thread's scheduler endpoint, not through this type.

use crate::Word;

/// Signed return word carried back to user space.
pub type RetWord = isize;

/// Kernel-wide result type.
pub type Result<T> = core::result::Result<T, KernErr>;

/// Error taxonomy, one variant per observable failure.
///
/// Grouped by layer: capability, kernel memory, page table, thread,
/// signal, invocation, and the user-fault escape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernErr {
    /// Target capability slot is occupied.
    CapExists,
    /// Capability slot is empty or the id is out of range.
    CapNotExist,
    /// Capability type does not match the requested operation.
    TypeBad,
    /// Slot is frozen; only thaw and destroy are allowed.
    Frozen,
    /// Thaw on a slot that is not frozen.
    NotFrozen,
    /// Derived flags exceed the parent's flags.
    PermEscalate,
    /// Frozen or unpublished object has not passed a quiescence period yet.
    NotQuiesced,
    /// Outstanding references or children keep the slot alive.
    Busy,

    /// Kernel-memory capability does not permit the operation.
    KmemBad,
    /// Address or length not aligned to the arena slot size.
    KmemAlign,
    /// Range is outside the arena or already marked.
    KmemRange,

    /// Page-table entry is not in the state the operation requires.
    PgtblBad,
    /// Page table still has parents or children registered.
    PgtblNotEmpty,
    /// Entry does not decode to the named child.
    PgtblNotChild,
    /// Address outside the node span, misaligned, or in the kernel range.
    PgtblAddr,

    /// Thread pointer or parameter is invalid.
    ThdBad,
    /// Thread is not in a state that permits the operation.
    ThdState,
    /// Priority outside the configured range.
    ThdPrio,
    /// Operation requires the thread to be bound to a CPU.
    ThdNotBound,

    /// Signal endpoint parameter is invalid.
    SigBad,
    /// Non-blocking receive found the counter at zero.
    SigEmpty,
    /// Counter saturated.
    SigFull,

    /// Invocation is already active on another frame.
    InvActive,
    /// Return-frame sentinel mismatch; the invocation stack is corrupt.
    InvStackBad,

    /// User fault, carrying the architecture fault code.
    Fault(Word),
}

/// Error codes below this are reserved for [`KernErr::Fault`];
/// `Fault(code)` encodes as `-(FAULT_BASE + code)`.
pub const FAULT_BASE: Word = 256;

impl KernErr {
    /// Stable numeric code for this error, as returned to user space.
    pub const fn code(self) -> RetWord {
        match self {
            KernErr::CapExists => -1,
            KernErr::CapNotExist => -2,
            KernErr::TypeBad => -3,
            KernErr::Frozen => -4,
            KernErr::NotFrozen => -5,
            KernErr::PermEscalate => -6,
            KernErr::NotQuiesced => -7,
            KernErr::Busy => -8,
            KernErr::KmemBad => -9,
            KernErr::KmemAlign => -10,
            KernErr::KmemRange => -11,
            KernErr::PgtblBad => -12,
            KernErr::PgtblNotEmpty => -13,
            KernErr::PgtblNotChild => -14,
            KernErr::PgtblAddr => -15,
            KernErr::ThdBad => -16,
            KernErr::ThdState => -17,
            KernErr::ThdPrio => -18,
            KernErr::ThdNotBound => -19,
            KernErr::SigBad => -20,
            KernErr::SigEmpty => -21,
            KernErr::SigFull => -22,
            KernErr::InvActive => -23,
            KernErr::InvStackBad => -24,
            KernErr::Fault(code) => -((FAULT_BASE + code) as RetWord),
        }
    }
}

/// Collapse an operation result into the single signed return word.
pub fn retval(res: Result<Word>) -> RetWord {
    match res {
        Ok(v) => v as RetWord,
        Err(e) => e.code(),
    }
}
