//! Synchronous invocation
//!
//! An invocation capability names a target process, an entry point and a
//! pre-registered callee stack. Activating it moves the calling thread
//! into the target process (same thread, new address space) after
//! pushing a return frame onto the thread's invocation stack. Return
//! pops the frame, restores the caller's instruction and stack pointers
//! and reloads the caller's address space.
//!
//! One activation at a time: the active back-pointer is claimed by CAS
//! and names the thread currently inside the invocation.
//!
//! Invocations entered from the fault path may carry the fault-return
//! policy: their Return restores the complete saved register state
//! verbatim instead of synthesizing a return value.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::captbl::{CapType, KernObj};
use crate::config;
use crate::error::{KernErr, Result};
use crate::hal::Platform;
use crate::process::Process;
use crate::thread::{InvFrame, Thread, INV_SENTINEL};
use crate::{Kernel, Word};

#[repr(C)]
pub struct Invocation {
    proc_: AtomicUsize,
    entry: AtomicUsize,
    stack: AtomicUsize,
    active: AtomicUsize,
    fault_ret: AtomicBool,
}

impl KernObj for Invocation {
    const TYPE: CapType = CapType::Invocation;
}

impl Invocation {
    /// Bytes needed for an invocation object.
    pub fn bytes() -> usize {
        core::mem::size_of::<Invocation>()
    }

    /// Build an invocation into `proc_`, pinning it. Entry and stack
    /// start unset; `set` must run before the first activation.
    ///
    /// # Safety
    /// `addr` must point at reserved, writable kernel memory of at least
    /// `bytes()` bytes, aligned for `Invocation`.
    pub unsafe fn init_at(addr: Word, proc_: &Process) -> *mut Invocation {
        proc_.pin();
        let inv = addr as *mut Invocation;
        inv.write(Invocation {
            proc_: AtomicUsize::new(proc_ as *const _ as Word),
            entry: AtomicUsize::new(0),
            stack: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            fault_ret: AtomicBool::new(false),
        });
        inv
    }

    /// Target process.
    #[inline]
    pub fn process(&self) -> &Process {
        unsafe { &*(self.proc_.load(Ordering::Acquire) as *const Process) }
    }

    /// Whether a thread is currently inside this invocation.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    /// (Re)register the entry point and callee stack. Rejected while the
    /// invocation is active.
    pub fn set(&self, entry: Word, stack: Word) -> Result<()> {
        if self.is_active() {
            return Err(KernErr::InvActive);
        }
        self.entry.store(entry, Ordering::Relaxed);
        self.stack.store(stack, Ordering::Release);
        Ok(())
    }

    /// Set the fault-return policy bit.
    pub fn set_fault_ret(&self, on: bool) -> Result<()> {
        if self.is_active() {
            return Err(KernErr::InvActive);
        }
        self.fault_ret.store(on, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn fault_ret(&self) -> bool {
        self.fault_ret.load(Ordering::Acquire)
    }

    /// Drop the process pin on destruction.
    pub fn release(&self) {
        self.process().unpin();
    }
}

/// Activate `inv` on the calling thread.
///
/// Pushes the caller's return frame, switches the loaded page table to
/// the target process and redirects the thread to the registered entry
/// with `arg` in the first argument register.
pub fn activate(
    _k: &Kernel,
    thd: &Thread,
    inv: &Invocation,
    arg: Word,
    from_fault: bool,
) -> Result<()> {
    let entry = inv.entry.load(Ordering::Acquire);
    let stack = inv.stack.load(Ordering::Acquire);
    if entry == 0 {
        return Err(KernErr::TypeBad);
    }

    let thd_ptr = thd as *const _ as Word;
    let inv_ptr = inv as *const _ as Word;
    inv.active
        .compare_exchange(0, thd_ptr, Ordering::AcqRel, Ordering::Acquire)
        .map_err(|_| KernErr::InvActive)?;

    // Bound-CPU context: the thread is the one trapping here.
    let frame = unsafe { thd.frame_mut() };
    let pushed = unsafe {
        thd.inv_push(InvFrame {
            inv: inv_ptr,
            saved: *frame,
            sentinel: inv_ptr ^ INV_SENTINEL,
            from_fault,
        })
    };
    if let Err(e) = pushed {
        inv.active.store(0, Ordering::Release);
        return Err(e);
    }

    frame.set_ip(entry);
    frame.set_sp(stack);
    frame.set_arg(arg);

    let pgtbl = inv.process().pgtbl();
    config::platform().load_page_table(pgtbl as *const _ as Word, pgtbl.asid() as Word);
    Ok(())
}

/// Return from the newest active invocation with `retval`.
///
/// Restores the caller's instruction and stack pointers (or, on a
/// fault-entered invocation with the fault-return policy, the complete
/// register state) and reloads the caller's address space. A sentinel
/// mismatch reports a corrupt stack; the dispatcher parks the thread.
pub fn ret(_k: &Kernel, thd: &Thread, retval: Word) -> Result<()> {
    let frame = unsafe { thd.inv_pop()? };
    if frame.sentinel != frame.inv ^ INV_SENTINEL {
        return Err(KernErr::InvStackBad);
    }

    let inv = unsafe { &*(frame.inv as *const Invocation) };
    let thd_ptr = thd as *const _ as Word;
    inv.active
        .compare_exchange(thd_ptr, 0, Ordering::AcqRel, Ordering::Acquire)
        .map_err(|_| KernErr::InvStackBad)?;

    let regs = unsafe { thd.frame_mut() };
    if frame.from_fault && inv.fault_ret() {
        *regs = frame.saved;
    } else {
        regs.set_ip(frame.saved.ip());
        regs.set_sp(frame.saved.sp());
        regs.set_retval(retval as crate::error::RetWord);
    }

    // Land back in the enclosing invocation's process, or the thread's
    // own when the stack is now empty.
    let proc_: &Process = match unsafe { thd.inv_peek() } {
        Some(outer) => unsafe { &*(outer.inv as *const Invocation) }.process(),
        None => thd.process(),
    };
    let pgtbl = proc_.pgtbl();
    config::platform().load_page_table(pgtbl as *const _ as Word, pgtbl.asid() as Word);
    Ok(())
}
