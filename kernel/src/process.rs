//! Processes
//!
//! A process is the binding of one capability table and one top-level
//! page table. Threads and invocations are born into exactly one process
//! and pin it for their lifetime; the process in turn pins its captbl
//! and pgtbl so neither can be reclaimed while referenced.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::captbl::{CapType, Captbl, KernObj};
use crate::error::{KernErr, Result};
use crate::pgtbl::Pgtbl;
use crate::Word;

#[repr(C)]
pub struct Process {
    captbl: AtomicUsize,
    pgtbl: AtomicUsize,
    pins: AtomicUsize,
}

impl KernObj for Process {
    const TYPE: CapType = CapType::Process;
}

impl Process {
    /// Bytes needed for a process object.
    pub fn bytes() -> usize {
        core::mem::size_of::<Process>()
    }

    /// Build a process over `captbl` and `pgtbl`, taking a pin on each.
    ///
    /// # Safety
    /// `addr` must point at reserved, writable kernel memory of at least
    /// `bytes()` bytes; the referenced objects must outlive the process
    /// (guaranteed by the pins as long as destruction honors them).
    pub unsafe fn init_at(addr: Word, captbl: &Captbl, pgtbl: &Pgtbl) -> Result<*mut Process> {
        if !pgtbl.is_top() {
            return Err(KernErr::PgtblBad);
        }
        captbl.pin();
        pgtbl.pin();
        let p = addr as *mut Process;
        p.write(Process {
            captbl: AtomicUsize::new(captbl as *const _ as Word),
            pgtbl: AtomicUsize::new(pgtbl as *const _ as Word),
            pins: AtomicUsize::new(0),
        });
        Ok(p)
    }

    /// The process's capability table.
    #[inline]
    pub fn captbl(&self) -> &Captbl {
        unsafe { &*(self.captbl.load(Ordering::Acquire) as *const Captbl) }
    }

    /// The process's top-level page table.
    #[inline]
    pub fn pgtbl(&self) -> &Pgtbl {
        unsafe { &*(self.pgtbl.load(Ordering::Acquire) as *const Pgtbl) }
    }

    /// Replace the capability table; pins move from the old to the new.
    ///
    /// The caller must have verified no thread of this process is
    /// currently Running on another CPU.
    pub fn swap_captbl(&self, new: &Captbl) -> Result<()> {
        new.pin();
        let old = self
            .captbl
            .swap(new as *const _ as Word, Ordering::AcqRel);
        unsafe { &*(old as *const Captbl) }.unpin();
        Ok(())
    }

    /// Replace the top-level page table; pins move from old to new.
    pub fn swap_pgtbl(&self, new: &Pgtbl) -> Result<()> {
        if !new.is_top() {
            return Err(KernErr::PgtblBad);
        }
        new.pin();
        let old = self.pgtbl.swap(new as *const _ as Word, Ordering::AcqRel);
        unsafe { &*(old as *const Pgtbl) }.unpin();
        Ok(())
    }

    /// Pin the process (a thread or invocation was born into it).
    #[inline]
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn unpin(&self) {
        let old = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0);
    }

    /// Outstanding thread/invocation pins.
    #[inline]
    pub fn pinned(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Drop the captbl/pgtbl pins on destruction. Requires `pinned()`
    /// to have reached zero first.
    pub fn release(&self) {
        debug_assert_eq!(self.pinned(), 0);
        self.captbl().unpin();
        self.pgtbl().unpin();
    }
}
