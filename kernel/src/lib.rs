//! Capstan kernel core
//!
//! A capability-based microkernel core for 32/64-bit MCUs and SMP
//! application processors. The core owns the capability system, the
//! architecture-polymorphic page tables, the priority scheduler, signal
//! endpoints, synchronous cross-process invocation and the kernel-memory
//! arena with quiescence-based reclamation.
//!
//! # Architecture
//!
//! - `kmem`: slot-bitmap arena over a fixed kernel virtual range
//! - `captbl`: typed capability slots with refcount/freeze/epoch status
//! - `pgtbl`: nested address-space trees plus the parent/child registry
//! - `sched`/`thread`: per-CPU run queues, binding, budgets, faults
//! - `signal`: counting asynchronous endpoints with wake-one FIFOs
//! - `invocation`: synchronous calls with saved return frames
//! - `syscall`: the dispatcher and the stable service numbering
//! - `boot`: construction of the initial objects and capabilities
//!
//! Architecture bring-up lives outside the core and talks to it through
//! the `hal::Platform` trait and the handler entry points in `syscall`.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod boot;
pub mod captbl;
pub mod config;
pub mod debug;
pub mod error;
pub mod hal;
pub mod invocation;
pub mod kfn;
pub mod kmem;
pub mod pgtbl;
pub mod process;
pub mod sched;
pub mod signal;
pub mod syscall;
pub mod thread;

#[cfg(test)]
mod tests;

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use captbl::{CapType, Captbl};
use config::{MAX_CPUS, QUIESCENCE_TICKS, QUIESCE_RING};
use error::Result;
use invocation::Invocation;
use kfn::KernFunc;
use kmem::{Kmem, KmemArena};
use pgtbl::pgreg::Pgreg;
use pgtbl::Pgtbl;
use process::Process;
use sched::types::CpuLocal;
use signal::SigEndpoint;
use thread::Thread;

/// The natural machine word. Holds a pointer, a packed capability id or
/// a flag set.
pub type Word = usize;

struct Pending {
    addr: Word,
    bytes: usize,
    epoch: usize,
}

struct QuiesceRing {
    items: [Option<Pending>; QUIESCE_RING],
    len: usize,
}

impl QuiesceRing {
    const fn new() -> Self {
        const NONE: Option<Pending> = None;
        Self { items: [NONE; QUIESCE_RING], len: 0 }
    }
}

/// Process-wide kernel state: the arena, the page-table registry and the
/// per-CPU scheduler blocks.
///
/// Constructed once (statically or at test setup), then initialized on
/// the boot CPU before any other CPU is released. Handlers receive it by
/// reference; there is no runtime reinitialization.
pub struct Kernel {
    pub kmem: KmemArena,
    pub pgreg: Pgreg,
    cpus: [CpuLocal; MAX_CPUS],
    ncpu: AtomicUsize,
    epoch: AtomicUsize,
    tid_next: AtomicUsize,
    asid_next: AtomicUsize,
    quiesce: Mutex<QuiesceRing>,
}

impl Kernel {
    pub const fn new() -> Self {
        const CPU: CpuLocal = CpuLocal::new();
        Self {
            kmem: KmemArena::new(),
            pgreg: Pgreg::new(),
            cpus: [CPU; MAX_CPUS],
            ncpu: AtomicUsize::new(0),
            epoch: AtomicUsize::new(0),
            tid_next: AtomicUsize::new(1),
            asid_next: AtomicUsize::new(1),
            quiesce: Mutex::new(QuiesceRing::new()),
        }
    }

    /// Pin the arena range and bring `ncpu` CPUs online. Boot CPU only.
    pub fn init(&self, kmem_base: Word, kmem_size: usize, ncpu: usize) -> Result<()> {
        self.kmem.init(kmem_base, kmem_size)?;
        self.pgreg.init(kmem_base, kmem_size);
        let ncpu = ncpu.clamp(1, MAX_CPUS);
        for id in 0..ncpu {
            self.cpus[id].bring_online(id);
        }
        self.ncpu.store(ncpu, Ordering::Release);
        Ok(())
    }

    /// Per-CPU block. `id` must be a valid CPU index; anything else is a
    /// kernel-internal invariant violation.
    #[inline]
    pub fn cpu(&self, id: usize) -> &CpuLocal {
        &self.cpus[id]
    }

    #[inline]
    pub fn ncpu(&self) -> usize {
        self.ncpu.load(Ordering::Acquire)
    }

    /// Global scheduler-tick epoch.
    #[inline]
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Epoch truncated to the capability status field.
    #[inline]
    pub fn epoch_u32(&self) -> u32 {
        self.epoch() as u32
    }

    pub(crate) fn advance_epoch(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The oldest epoch any online CPU still sits at. Objects
    /// unpublished before this marker minus the quiescence period are
    /// safe to reclaim.
    pub fn min_quiescence(&self) -> usize {
        let mut min = usize::MAX;
        for id in 0..self.ncpu() {
            min = min.min(self.cpus[id].quiescence());
        }
        if min == usize::MAX {
            self.epoch()
        } else {
            min
        }
    }

    /// `min_quiescence` truncated for status-word comparisons.
    #[inline]
    pub fn min_quiescence_u32(&self) -> u32 {
        self.min_quiescence() as u32
    }

    /// Allocate a stable thread id.
    pub fn next_tid(&self) -> usize {
        self.tid_next.fetch_add(1, Ordering::AcqRel)
    }

    /// Allocate an address-space identifier.
    pub fn next_asid(&self) -> u16 {
        (self.asid_next.fetch_add(1, Ordering::AcqRel) & 0xFFFF) as u16
    }

    /// Queue an arena range for release after one quiescence period.
    pub fn reclaim_after(&self, addr: Word, bytes: usize) -> Result<()> {
        let mut ring = self.quiesce.lock();
        if ring.len == QUIESCE_RING {
            return Err(error::KernErr::Busy);
        }
        let epoch = self.epoch();
        for slot in ring.items.iter_mut() {
            if slot.is_none() {
                *slot = Some(Pending { addr, bytes, epoch });
                ring.len += 1;
                return Ok(());
            }
        }
        Err(error::KernErr::Busy)
    }

    /// Release every queued range whose quiescence period has elapsed on
    /// all CPUs. Called from the tick path.
    pub fn reclaim_expired(&self) {
        let min = self.min_quiescence();
        let mut ring = self.quiesce.lock();
        if ring.len == 0 {
            return;
        }
        for i in 0..ring.items.len() {
            let due = match &ring.items[i] {
                Some(p) => min >= p.epoch + QUIESCENCE_TICKS,
                None => false,
            };
            if due {
                if let Some(p) = ring.items[i].take() {
                    let _ = self.kmem.clear(p.addr, p.bytes);
                    ring.len -= 1;
                }
            }
        }
    }

    /// Ranges still waiting out their quiescence period.
    pub fn reclaim_pending(&self) -> usize {
        self.quiesce.lock().len
    }

    /// Per-type liveness check run before an object's root capability is
    /// removed. An error means something outside the capability system
    /// still references the object.
    pub fn check_object_free(&self, ty: CapType, obj: Word) -> Result<()> {
        use error::KernErr;
        match ty {
            CapType::Empty => Ok(()),
            CapType::CapTable => {
                let tbl = unsafe { &*(obj as *const Captbl) };
                if tbl.pinned() > 0 {
                    return Err(KernErr::Busy);
                }
                let occupied = (0..tbl.len())
                    .any(|i| tbl.slot(i).map(|s| !s.is_empty()).unwrap_or(false));
                if occupied {
                    Err(KernErr::Busy)
                } else {
                    Ok(())
                }
            }
            CapType::PageTable => {
                let pt = unsafe { &*(obj as *const Pgtbl) };
                if !self.pgreg.is_free(obj) {
                    return Err(KernErr::PgtblNotEmpty);
                }
                if pt.pinned() > 0 {
                    return Err(KernErr::Busy);
                }
                Ok(())
            }
            CapType::Process => {
                if unsafe { &*(obj as *const Process) }.pinned() > 0 {
                    Err(KernErr::Busy)
                } else {
                    Ok(())
                }
            }
            CapType::Thread => {
                let thd = unsafe { &*(obj as *const Thread) };
                if !thd.is_reclaimable() {
                    return Err(KernErr::ThdState);
                }
                // A suspended thread can still be a CPU's stale current
                // pointer until that CPU reschedules.
                for id in 0..self.ncpu() {
                    if self.cpus[id]
                        .current()
                        .map_or(false, |c| c as *const Thread as Word == obj)
                    {
                        return Err(KernErr::ThdState);
                    }
                }
                Ok(())
            }
            CapType::Invocation => {
                if unsafe { &*(obj as *const Invocation) }.is_active() {
                    Err(KernErr::InvActive)
                } else {
                    Ok(())
                }
            }
            CapType::Signal => {
                let sig = unsafe { &*(obj as *const SigEndpoint) };
                if sig.waiters() > 0 || sig.pinned() > 0 {
                    Err(KernErr::Busy)
                } else {
                    Ok(())
                }
            }
            CapType::KernelFunc | CapType::KernelMem => Ok(()),
        }
    }

    /// Storage footprint of an object, for Kot release.
    pub fn object_bytes(&self, ty: CapType, obj: Word) -> usize {
        match ty {
            CapType::Empty => 0,
            CapType::CapTable => {
                Captbl::bytes_for(unsafe { &*(obj as *const Captbl) }.len())
            }
            CapType::PageTable => {
                Pgtbl::bytes_for(unsafe { &*(obj as *const Pgtbl) }.num_order())
            }
            CapType::Process => Process::bytes(),
            CapType::Thread => Thread::bytes(),
            CapType::Invocation => Invocation::bytes(),
            CapType::Signal => SigEndpoint::bytes(),
            CapType::KernelFunc => KernFunc::bytes(),
            CapType::KernelMem => core::mem::size_of::<Kmem>(),
        }
    }

    /// Run the per-type destructor side effects for a removed root
    /// capability, then queue its storage for quiescent release.
    pub fn retire_object(&self, ty: CapType, obj: Word) -> Result<()> {
        match ty {
            CapType::Process => unsafe { &*(obj as *const Process) }.release(),
            CapType::Thread => unsafe { &*(obj as *const Thread) }.release(),
            CapType::Invocation => unsafe { &*(obj as *const Invocation) }.release(),
            _ => {}
        }
        let bytes = self.object_bytes(ty, obj);
        if self.kmem.in_range(obj, bytes) {
            self.reclaim_after(obj, bytes)?;
        }
        Ok(())
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel instance bring-up code boots and hands to every handler.
/// Constructed at compile time; `boot::kmain` initializes it on core 0.
pub static KERNEL: Kernel = Kernel::new();
