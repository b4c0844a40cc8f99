//! Kernel configuration and platform composition
//!
//! Build-time constants for the core, plus the compile-time selection of
//! the platform implementation. Platform selection uses cargo features:
//! - `platform-stub`: software platform for hosted builds and tests
//! - `platform-aarch64`: AArch64 EL1 glue
//!
//! This mirrors runtime component spawning, but resolved at compile time.

use crate::hal::Platform;

/// Natural machine word width in bits.
pub const WORD_BITS: usize = usize::BITS as usize;

/// Maximum number of hardware CPUs the per-CPU tables are sized for.
/// The live CPU count is handed over at boot and may be smaller.
pub const MAX_CPUS: usize = 8;

/// Log2 of the kernel-memory arena slot size in bytes.
pub const KMEM_SLOT_ORDER: usize = 6;

/// Arena slot size in bytes.
pub const KMEM_SLOT_SIZE: usize = 1 << KMEM_SLOT_ORDER;

/// Log2 of the largest supported arena, in bytes. The Kot bitmap and the
/// page-table registry are statically sized for this bound.
pub const KMEM_MAX_ORDER: usize = 24;

/// Largest supported arena in bytes.
pub const KMEM_MAX_SIZE: usize = 1 << KMEM_MAX_ORDER;

/// Number of allocation slots in a maximum-size arena.
pub const KOT_SLOTS: usize = KMEM_MAX_SIZE / KMEM_SLOT_SIZE;

/// Words backing the Kot bitmap.
pub const KOT_WORDS: usize = KOT_SLOTS / WORD_BITS;

/// Log2 of one page-table-registry region. Every page-table node is
/// tracked at this granularity.
pub const PGREG_REGION_ORDER: usize = 12;

/// Number of registry regions in a maximum-size arena.
pub const PGREG_REGIONS: usize = KMEM_MAX_SIZE >> PGREG_REGION_ORDER;

/// Number of scheduler priorities. Higher number wins; ties are FIFO.
pub const MAX_PRIO: usize = 32;

/// Capacity of one per-priority run queue.
pub const RUNQ_CAP: usize = 64;

/// Capacity of one signal-endpoint wait queue.
pub const SIGQ_CAP: usize = 32;

/// Maximum nesting depth of the per-thread invocation stack.
pub const INV_DEPTH: usize = 16;

/// Largest capability table, in slots. Bounded so a slot index fits the
/// quarter-word field of a two-level capability id.
pub const CAPTBL_MAX_SLOTS: usize = if WORD_BITS >= 64 { 4096 } else { 128 };

/// Scheduler ticks that must elapse on every CPU before an unpublished
/// or frozen object may be reclaimed or thawed.
pub const QUIESCENCE_TICKS: usize = 10;

/// Capacity of the deferred-reclamation ring.
pub const QUIESCE_RING: usize = 64;

/// Start of the kernel-shared virtual range; immutable after boot.
/// Walks into this range fail.
pub const KERNEL_BASE: usize = 1 << (WORD_BITS - 1);

/// Default time budget handed to boot threads, in ticks.
pub const BOOT_BUDGET: u32 = u32::MAX;

// Boot capability layout: fixed indices in the initial capability table.
/// The initial capability table itself.
pub const BOOT_CAPTBL: usize = 0;
/// Child table holding the top-level page-table capabilities.
pub const BOOT_TBL_PGTBL: usize = 1;
/// The initial process.
pub const BOOT_INIT_PROC: usize = 2;
/// Child table holding one thread capability per core.
pub const BOOT_TBL_THD: usize = 3;
/// The kernel-function capability.
pub const BOOT_KFN: usize = 4;
/// Child table holding one kernel-memory capability per memory node.
pub const BOOT_TBL_KMEM: usize = 5;
/// Child table holding one timer signal endpoint per core.
pub const BOOT_TBL_TIMER: usize = 6;
/// Child table holding one default interrupt signal endpoint per core.
pub const BOOT_TBL_INT: usize = 7;

/// Slot count of the initial capability table.
pub const BOOT_CAPTBL_SLOTS: usize = 16;

#[cfg(not(all(target_arch = "aarch64", feature = "platform-aarch64", not(test))))]
static PLATFORM: crate::hal::stub::StubPlatform = crate::hal::stub::StubPlatform::new();

#[cfg(all(target_arch = "aarch64", feature = "platform-aarch64", not(test)))]
static PLATFORM: crate::arch::aarch64::A64Platform = crate::arch::aarch64::A64Platform::new();

/// Get the platform implementation selected at compile time.
#[inline]
pub fn platform() -> &'static impl Platform {
    &PLATFORM
}

/// Direct access to the software platform, for tests and hosted tools
/// that need to inspect recorded side effects.
#[cfg(not(all(target_arch = "aarch64", feature = "platform-aarch64", not(test))))]
pub fn stub() -> &'static crate::hal::stub::StubPlatform {
    &PLATFORM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants_are_consistent() {
        assert!(KMEM_SLOT_SIZE.is_power_of_two());
        assert_eq!(KOT_SLOTS % WORD_BITS, 0);
        assert!(MAX_PRIO <= WORD_BITS);
        assert!(BOOT_TBL_INT < BOOT_CAPTBL_SLOTS);
    }
}
