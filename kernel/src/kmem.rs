//! Kernel-memory arena
//!
//! A contiguous kernel virtual range `[base, base+size)` carved into
//! power-of-two slots. The kernel object table (Kot) is one bit per slot;
//! a set bit reserves the slot and an object occupies a contiguous run.
//!
//! The arena has no free list and no coalescing. Addresses are chosen by
//! the callers: they arrive through kernel-memory capabilities that carry
//! explicit ranges. The Kot only arbitrates conflicting reservations.
//!
//! Marking flips bits with CAS one word at a time. A call that loses the
//! race rolls back every bit it already set, so a failed `mark` leaves
//! the table exactly as it found it.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::captbl::CapFlags;
use crate::config::{KMEM_MAX_SIZE, KMEM_SLOT_SIZE, KOT_WORDS, WORD_BITS};
use crate::error::{KernErr, Result};
use crate::Word;

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicUsize = AtomicUsize::new(0);

/// The arena and its object table.
///
/// Constructed empty at compile time; `init` pins the live range during
/// boot, before any other CPU can reach the table.
pub struct KmemArena {
    base: AtomicUsize,
    size: AtomicUsize,
    kot: [AtomicUsize; KOT_WORDS],
}

impl KmemArena {
    pub const fn new() -> Self {
        Self { base: ZERO, size: ZERO, kot: [ZERO; KOT_WORDS] }
    }

    /// Set up the arena over `[base, base+size)`.
    ///
    /// `base` and `size` must be slot-aligned and the range must fit the
    /// build-time maximum. Called once, on the boot CPU.
    pub fn init(&self, base: Word, size: usize) -> Result<()> {
        if base % KMEM_SLOT_SIZE != 0 || size % KMEM_SLOT_SIZE != 0 {
            return Err(KernErr::KmemAlign);
        }
        if size == 0 || size > KMEM_MAX_SIZE {
            return Err(KernErr::KmemRange);
        }
        self.base.store(base, Ordering::Relaxed);
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    /// Arena base address.
    #[inline]
    pub fn base(&self) -> Word {
        self.base.load(Ordering::Relaxed)
    }

    /// Arena length in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Whether `[addr, addr+bytes)` lies inside the arena.
    #[inline]
    pub fn in_range(&self, addr: Word, bytes: usize) -> bool {
        let base = self.base();
        let size = self.size();
        addr >= base && bytes <= size && addr - base <= size - bytes
    }

    /// Round a byte count up to whole slots.
    #[inline]
    pub fn round_up(bytes: usize) -> usize {
        (bytes + KMEM_SLOT_SIZE - 1) & !(KMEM_SLOT_SIZE - 1)
    }

    fn slot_span(&self, addr: Word, bytes: usize) -> Result<(usize, usize)> {
        if addr % KMEM_SLOT_SIZE != 0 {
            return Err(KernErr::KmemAlign);
        }
        let bytes = Self::round_up(bytes.max(1));
        if !self.in_range(addr, bytes) {
            return Err(KernErr::KmemRange);
        }
        let first = (addr - self.base()) / KMEM_SLOT_SIZE;
        Ok((first, bytes / KMEM_SLOT_SIZE))
    }

    /// Atomically reserve the slot run covering `[addr, addr+bytes)`.
    ///
    /// On a conflict with a concurrent or earlier reservation the bits
    /// set so far are rolled back and `KmemRange` is returned.
    pub fn mark(&self, addr: Word, bytes: usize) -> Result<()> {
        let (first, count) = self.slot_span(addr, bytes)?;
        let mut slot = first;
        let mut left = count;
        while left > 0 {
            let word = slot / WORD_BITS;
            let off = slot % WORD_BITS;
            let take = left.min(WORD_BITS - off);
            let mask = run_mask(off, take);

            let mut old = self.kot[word].load(Ordering::Relaxed);
            loop {
                if old & mask != 0 {
                    // Lost the race; undo the words this call already set.
                    self.clear_slots(first, slot - first);
                    return Err(KernErr::KmemRange);
                }
                match self.kot[word].compare_exchange_weak(
                    old,
                    old | mask,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(cur) => old = cur,
                }
            }
            slot += take;
            left -= take;
        }
        Ok(())
    }

    /// Release the slot run. Unconditional; the caller must hold the
    /// reservation.
    pub fn clear(&self, addr: Word, bytes: usize) -> Result<()> {
        let (first, count) = self.slot_span(addr, bytes)?;
        self.clear_slots(first, count);
        Ok(())
    }

    /// Whether the whole run is currently reserved.
    pub fn contains(&self, addr: Word, bytes: usize) -> bool {
        let (first, count) = match self.slot_span(addr, bytes) {
            Ok(span) => span,
            Err(_) => return false,
        };
        let mut slot = first;
        let mut left = count;
        while left > 0 {
            let word = slot / WORD_BITS;
            let off = slot % WORD_BITS;
            let take = left.min(WORD_BITS - off);
            let mask = run_mask(off, take);
            if self.kot[word].load(Ordering::Acquire) & mask != mask {
                return false;
            }
            slot += take;
            left -= take;
        }
        true
    }

    fn clear_slots(&self, first: usize, count: usize) {
        let mut slot = first;
        let mut left = count;
        while left > 0 {
            let word = slot / WORD_BITS;
            let off = slot % WORD_BITS;
            let take = left.min(WORD_BITS - off);
            self.kot[word].fetch_and(!run_mask(off, take), Ordering::AcqRel);
            slot += take;
            left -= take;
        }
    }
}

#[inline]
fn run_mask(off: usize, len: usize) -> Word {
    debug_assert!(len >= 1 && off + len <= WORD_BITS);
    if len == WORD_BITS {
        Word::MAX
    } else {
        ((1usize << len) - 1) << off
    }
}

/// A kernel-memory capability's backing object: an explicit sub-range of
/// the arena plus the create permissions delegated with it.
#[repr(C)]
pub struct Kmem {
    base: Word,
    size: usize,
    flags: CapFlags,
}

impl crate::captbl::KernObj for Kmem {
    const TYPE: crate::captbl::CapType = crate::captbl::CapType::KernelMem;
}

impl Kmem {
    pub fn new(base: Word, size: usize, flags: CapFlags) -> Result<Self> {
        if base % KMEM_SLOT_SIZE != 0 || size % KMEM_SLOT_SIZE != 0 {
            return Err(KernErr::KmemAlign);
        }
        Ok(Self { base, size, flags })
    }

    #[inline]
    pub fn base(&self) -> Word {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check that `[addr, addr+bytes)` falls inside this grant and that
    /// the grant carries `need`.
    pub fn check(&self, addr: Word, bytes: usize, need: CapFlags) -> Result<()> {
        if !self.flags.contains(need) {
            return Err(KernErr::KmemBad);
        }
        if addr < self.base
            || bytes > self.size
            || addr - self.base > self.size - bytes
        {
            return Err(KernErr::KmemRange);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::boxed::Box;

    fn arena() -> Box<KmemArena> {
        // 1 MiB arena starting at a slot-aligned fake kernel address.
        let a = Box::new(KmemArena::new());
        a.init(0x100000, 1 << 20).unwrap();
        a
    }

    #[test]
    fn mark_and_clear_round_trip() {
        let a = arena();
        a.mark(0x100000, 4096).unwrap();
        assert!(a.contains(0x100000, 4096));
        a.clear(0x100000, 4096).unwrap();
        assert!(!a.contains(0x100000, KMEM_SLOT_SIZE));
    }

    #[test]
    fn conflicting_mark_rolls_back() {
        let a = arena();
        // Reserve a slot in the middle of the prospective run.
        a.mark(0x100000 + 128 * KMEM_SLOT_SIZE, KMEM_SLOT_SIZE).unwrap();

        // A run overlapping it must fail and leave its own bits clear.
        assert_eq!(
            a.mark(0x100000, 256 * KMEM_SLOT_SIZE),
            Err(KernErr::KmemRange)
        );
        assert!(!a.contains(0x100000, KMEM_SLOT_SIZE));
        assert!(a.contains(0x100000 + 128 * KMEM_SLOT_SIZE, KMEM_SLOT_SIZE));
    }

    #[test]
    fn alignment_and_range_checks() {
        let a = arena();
        assert_eq!(a.mark(0x100001, 64), Err(KernErr::KmemAlign));
        assert_eq!(a.mark(0x100000 + (1 << 20), 64), Err(KernErr::KmemRange));
        // Rounding: a 1-byte request reserves a full slot.
        a.mark(0x100000, 1).unwrap();
        assert!(a.contains(0x100000, KMEM_SLOT_SIZE));
        assert_eq!(a.mark(0x100000, 1), Err(KernErr::KmemRange));
    }

    #[test]
    fn kmem_grant_checks() {
        let g = Kmem::new(0x100000, 1 << 16, CapFlags::KMEM_SIG).unwrap();
        assert!(g.check(0x100000, 64, CapFlags::KMEM_SIG).is_ok());
        assert_eq!(
            g.check(0x100000, 64, CapFlags::KMEM_THD),
            Err(KernErr::KmemBad)
        );
        assert_eq!(
            g.check(0x100000 + (1 << 16), 64, CapFlags::KMEM_SIG),
            Err(KernErr::KmemRange)
        );
    }
}
