//! Service numbers and argument packing
//!
//! Word 0 of every syscall packs the service id in the high half and the
//! capability id in the low half; words 1..3 carry three parameters.
//! Services that need more than three arguments pack two half-words per
//! parameter. All numbers are stable across releases.

use crate::config::WORD_BITS;
use crate::Word;

pub const HALF_BITS: usize = WORD_BITS / 2;
pub const HALF_MASK: Word = (1 << HALF_BITS) - 1;

/// Split word 0 into (service, capability id).
#[inline]
pub fn unpack_svc(w0: Word) -> (Word, Word) {
    (w0 >> HALF_BITS, w0 & HALF_MASK)
}

/// Pack word 0 from (service, capability id).
#[inline]
pub fn pack_svc(svc: Word, capid: Word) -> Word {
    (svc << HALF_BITS) | (capid & HALF_MASK)
}

/// High half of a packed parameter.
#[inline]
pub fn param_hi(w: Word) -> Word {
    w >> HALF_BITS
}

/// Low half of a packed parameter.
#[inline]
pub fn param_lo(w: Word) -> Word {
    w & HALF_MASK
}

/// Pack two half-words into one parameter.
#[inline]
pub fn pack_param(hi: Word, lo: Word) -> Word {
    (hi << HALF_BITS) | (lo & HALF_MASK)
}

// Hot-path services first; creation services after.

/// Return from the newest invocation. p0 = return value.
pub const SVC_INV_RET: Word = 0;
/// Activate an invocation. cap = invocation, p0 = argument.
pub const SVC_INV_ACT: Word = 1;
/// Send to a signal endpoint. cap = signal, p0 = count.
pub const SVC_SIG_SND: Word = 2;
/// Receive from a signal endpoint. cap = signal, p0 = blocking flag.
pub const SVC_SIG_RCV: Word = 3;
/// Kernel function. cap = kfn, p0 = sub id, p1/p2 = arguments.
pub const SVC_KFN_ACT: Word = 4;
/// Yield the CPU. No capability.
pub const SVC_THD_YIELD: Word = 5;

/// Bind a thread. cap = thread, p0 = cpu, p1 = priority,
/// p2 = scheduler-signal capability id (`!0` for none).
pub const SVC_THD_BIND: Word = 6;
/// Change priority. cap = thread, p0 = priority.
pub const SVC_THD_PRIO: Word = 7;
/// Release the CPU binding. cap = thread.
pub const SVC_THD_FREE: Word = 8;
/// Reset entry state. cap = thread, p0 = ip, p1 = sp, p2 = argument.
pub const SVC_THD_EXEC_SET: Word = 9;
/// Donate budget. cap = source thread, p0 = destination thread
/// capability id, p1 = ticks.
pub const SVC_THD_TIME_XFER: Word = 10;
/// Suspend. cap = thread.
pub const SVC_THD_SUSPEND: Word = 11;
/// Resume. cap = thread.
pub const SVC_THD_RESUME: Word = 12;

/// Create a capability table. cap = destination captbl,
/// p0 = (kmem capid, destination slot), p1 = storage address,
/// p2 = slot count.
pub const SVC_CPT_CRT: Word = 13;
/// Derive a capability. cap = destination captbl,
/// p0 = (source captbl capid, source slot), p1 = destination slot,
/// p2 = new flag bits.
pub const SVC_CPT_ADD: Word = 14;
/// Remove a capability. cap = captbl, p0 = slot.
pub const SVC_CPT_REM: Word = 15;
/// Freeze a capability. cap = captbl, p0 = slot.
pub const SVC_CPT_FRZ: Word = 16;
/// Thaw a capability. cap = captbl, p0 = slot.
pub const SVC_CPT_THAW: Word = 17;

/// Create a page table. cap = destination captbl,
/// p0 = (kmem capid, destination slot),
/// p1 = storage address with bit 0 = is-top,
/// p2 = page-aligned base address with the size order in bits 6..12 and
/// the number order in bits 0..6.
pub const SVC_PGT_CRT: Word = 18;
/// Map a page. cap = page table, p0 = index, p1 = frame, p2 = flags.
pub const SVC_PGT_MAP: Word = 19;
/// Unmap a page. cap = page table, p0 = index.
pub const SVC_PGT_UNMAP: Word = 20;
/// Link a child table. cap = parent, p0 = index, p1 = child capid,
/// p2 = default flag bits.
pub const SVC_PGT_CONS: Word = 21;
/// Sever a child link. cap = parent, p0 = index, p1 = child capid.
pub const SVC_PGT_DES: Word = 22;

/// Create a process. cap = destination captbl,
/// p0 = (kmem capid, destination slot), p1 = storage address,
/// p2 = (captbl capid, pgtbl capid).
pub const SVC_PRC_CRT: Word = 23;
/// Swap a process's captbl. cap = process, p0 = captbl capid.
pub const SVC_PRC_CPT: Word = 24;
/// Swap a process's top pgtbl. cap = process, p0 = pgtbl capid.
pub const SVC_PRC_PGT: Word = 25;

/// Create a thread. cap = destination captbl,
/// p0 = (kmem capid, destination slot), p1 = storage address,
/// p2 = (process capid, priority).
pub const SVC_THD_CRT: Word = 26;
/// Create a signal endpoint. cap = destination captbl,
/// p0 = (kmem capid, destination slot), p1 = storage address.
pub const SVC_SIG_CRT: Word = 27;
/// Create an invocation. cap = destination captbl,
/// p0 = (kmem capid, destination slot), p1 = storage address,
/// p2 = process capid.
pub const SVC_INV_CRT: Word = 28;
/// Register invocation entry state. cap = invocation, p0 = entry ip,
/// p1 = stack, p2 = fault-return policy bit.
pub const SVC_INV_SET: Word = 29;
