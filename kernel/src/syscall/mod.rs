//! Syscall dispatch and trap entry points
//!
//! The architecture trampoline saves user registers into the current
//! thread's frame, masks interrupts and calls one of the handlers here;
//! on return it restores from the (possibly different) current thread's
//! frame. The dispatcher itself never reenters.
//!
//! Dispatch: read the four syscall words, unpack (service, capability
//! id), resolve the capability in the calling protection domain's
//! captbl, execute, write the signed return word, and finally act on the
//! preemption flag. The only suspension points are the end of dispatch,
//! a blocking receive, invocation activate/return and explicit yield.

pub mod numbers;

use numbers::*;

use crate::captbl::{ops as cap_ops, CapFlags, CapId, Captbl};
use crate::config;
use crate::error::{retval, KernErr, Result};
use crate::hal::Platform;
use crate::invocation::{self, Invocation};
use crate::kfn::{self, KernFunc};
use crate::kmem::Kmem;
use crate::pgtbl::{PageFlags, Pgtbl};
use crate::process::Process;
use crate::sched;
use crate::signal::{self, RecvOutcome, SigEndpoint};
use crate::thread::{ThdState, Thread};
use crate::{Kernel, Word};

/// Fault code reported when an invocation return finds a corrupt stack.
pub const FAULT_INV_STACK: Word = 0xFFF1;

enum Action {
    /// Write this result into the return register.
    Ret(Result<Word>),
    /// The handler already arranged the frame (or switched away).
    Handled,
}

/// The captbl of the protection domain the thread currently executes
/// in: the newest active invocation's process, or its own.
fn domain_captbl(thd: &Thread) -> &Captbl {
    match unsafe { thd.inv_peek() } {
        Some(f) => unsafe { &*(f.inv as *const Invocation) }.process().captbl(),
        None => thd.process().captbl(),
    }
}

/// Syscall entry. The current thread's frame holds the trap state.
pub fn syscall_handler(k: &Kernel) {
    let platform = config::platform();
    let cpu_id = platform.cpu_id();
    let cpu = k.cpu(cpu_id);
    let cur = match cpu.current() {
        Some(t) => t,
        None => return,
    };

    let [w0, p0, p1, p2] = unsafe { cur.frame() }.syscall_words();
    let (svc, cid_raw) = unpack_svc(w0);
    let cid = CapId::new(cid_raw);
    ksyscall_debug_entry(svc, cid_raw, p0, p1, p2);

    let cpt = domain_captbl(cur);
    let action = dispatch(k, cpu_id, cur, cpt, svc, cid, p0, p1, p2);

    if let Action::Ret(res) = action {
        unsafe { cur.frame_mut() }.set_retval(retval(res));
    }

    // End-of-dispatch suspension point.
    if cpu.need_resched() {
        sched::reschedule(k, cpu_id);
    }
}

#[inline]
fn ksyscall_debug_entry(_svc: Word, _cid: Word, _p0: Word, _p1: Word, _p2: Word) {
    crate::ksyscall_debug!(
        "[syscall] svc={} cap={:#x} args=({:#x}, {:#x}, {:#x})",
        _svc,
        _cid,
        _p0,
        _p1,
        _p2
    );
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    k: &Kernel,
    cpu_id: usize,
    cur: &Thread,
    cpt: &Captbl,
    svc: Word,
    cid: CapId,
    p0: Word,
    p1: Word,
    p2: Word,
) -> Action {
    match svc {
        SVC_INV_RET => match invocation::ret(k, cur, p0) {
            Ok(()) => Action::Handled,
            Err(KernErr::InvStackBad) => {
                // Corrupt return stack: park the thread and tell its
                // scheduler, exactly like a hardware fault.
                park_faulted(k, cpu_id, cur, FAULT_INV_STACK);
                Action::Handled
            }
            Err(e) => Action::Ret(Err(e)),
        },

        SVC_INV_ACT => {
            let inv = match cpt.lookup::<Invocation>(cid) {
                Ok(r) => r,
                Err(e) => return Action::Ret(Err(e)),
            };
            if let Err(e) = inv.require(CapFlags::INV_ACT) {
                return Action::Ret(Err(e));
            }
            match invocation::activate(k, cur, &inv, p0, false) {
                Ok(()) => Action::Handled,
                Err(e) => Action::Ret(Err(e)),
            }
        }

        SVC_SIG_SND => Action::Ret((|| {
            let sig = cpt.lookup::<SigEndpoint>(cid)?;
            sig.require(CapFlags::SIG_SND)?;
            signal::send(k, &sig, p0)
        })()),

        SVC_SIG_RCV => {
            let sig = match cpt.lookup::<SigEndpoint>(cid) {
                Ok(r) => r,
                Err(e) => return Action::Ret(Err(e)),
            };
            if let Err(e) = sig.require(CapFlags::SIG_RCV) {
                return Action::Ret(Err(e));
            }
            match signal::receive(k, &sig, cur, p0 != 0) {
                Ok(RecvOutcome::Taken) => Action::Ret(Ok(0)),
                Ok(RecvOutcome::Blocked) => {
                    // Wakes resume here with a success return value.
                    unsafe { cur.frame_mut() }.set_retval(0);
                    sched::schedule_out(k, cpu_id);
                    Action::Handled
                }
                Err(e) => Action::Ret(Err(e)),
            }
        }

        SVC_KFN_ACT => Action::Ret((|| {
            let kfn_cap = cpt.lookup::<KernFunc>(cid)?;
            kfn::activate(kfn_cap.flags(), p0, p1, p2)
        })()),

        SVC_THD_YIELD => {
            unsafe { cur.frame_mut() }.set_retval(0);
            sched::yield_now(k, cpu_id);
            Action::Handled
        }

        SVC_THD_BIND => Action::Ret((|| {
            let thd = cpt.lookup::<Thread>(cid)?;
            thd.require(CapFlags::THD_SCHED)?;
            let sig_addr = if p2 == Word::MAX {
                0
            } else {
                let sig = cpt.lookup::<SigEndpoint>(CapId::new(p2))?;
                sig.addr()
            };
            let old_sig = thd.sched_sig();
            sched::bind(k, &thd, p0, p1 as u32, sig_addr)?;
            rebind_sched_sig(old_sig, sig_addr);
            Ok(0)
        })()),

        SVC_THD_PRIO => Action::Ret((|| {
            let thd = cpt.lookup::<Thread>(cid)?;
            thd.require(CapFlags::THD_SCHED)?;
            set_prio_requeue(k, &thd, p0 as u32)?;
            Ok(0)
        })()),

        SVC_THD_FREE => Action::Ret((|| {
            let thd = cpt.lookup::<Thread>(cid)?;
            thd.require(CapFlags::THD_SCHED)?;
            sched::unbind(k, &thd)?;
            Ok(0)
        })()),

        SVC_THD_EXEC_SET => Action::Ret((|| {
            let thd = cpt.lookup::<Thread>(cid)?;
            thd.require(CapFlags::THD_EXEC)?;
            if thd.state() == ThdState::Running {
                return Err(KernErr::ThdState);
            }
            // Not running, so its frame is quiescent.
            let frame = unsafe { thd.frame_mut() };
            frame.set_ip(p0);
            frame.set_sp(p1);
            frame.set_arg(p2);
            Ok(0)
        })()),

        SVC_THD_TIME_XFER => Action::Ret((|| {
            let src = cpt.lookup::<Thread>(cid)?;
            src.require(CapFlags::THD_TIME)?;
            let dst = cpt.lookup::<Thread>(CapId::new(p0))?;
            let moved = sched::time_xfer(&src, &dst, p1 as u32);
            Ok(moved as Word)
        })()),

        SVC_THD_SUSPEND => Action::Ret((|| {
            let thd = cpt.lookup::<Thread>(cid)?;
            thd.require(CapFlags::THD_SCHED)?;
            sched::suspend(k, &thd)?;
            Ok(0)
        })()),

        SVC_THD_RESUME => Action::Ret((|| {
            let thd = cpt.lookup::<Thread>(cid)?;
            thd.require(CapFlags::THD_SCHED)?;
            sched::resume(k, &thd)?;
            Ok(0)
        })()),

        SVC_CPT_CRT => Action::Ret(captbl_create(k, cpt, cid, p0, p1, p2)),

        SVC_CPT_ADD => Action::Ret((|| {
            let dst = cpt.lookup::<Captbl>(cid)?;
            dst.require(CapFlags::CPT_MOD)?;
            let src = cpt.lookup::<Captbl>(CapId::new(param_hi(p0)))?;
            src.require(CapFlags::CPT_MOD)?;
            let flags = CapFlags::from_bits_truncate(p2 as u32);
            cap_ops::add(&dst, p1, &src, param_lo(p0), flags, k.epoch_u32())?;
            Ok(0)
        })()),

        SVC_CPT_REM => Action::Ret((|| {
            let tbl = cpt.lookup::<Captbl>(cid)?;
            tbl.require(CapFlags::CPT_MOD)?;
            let reclaim = cap_ops::remove(&tbl, p0, |ty, obj| k.check_object_free(ty, obj))?;
            if let Some(r) = reclaim {
                k.retire_object(r.ty, r.obj)?;
            }
            Ok(0)
        })()),

        SVC_CPT_FRZ => Action::Ret((|| {
            let tbl = cpt.lookup::<Captbl>(cid)?;
            tbl.require(CapFlags::CPT_MOD)?;
            cap_ops::freeze(&tbl, p0, k.epoch_u32())?;
            Ok(0)
        })()),

        SVC_CPT_THAW => Action::Ret((|| {
            let tbl = cpt.lookup::<Captbl>(cid)?;
            tbl.require(CapFlags::CPT_MOD)?;
            cap_ops::thaw(&tbl, p0, k.min_quiescence_u32())?;
            Ok(0)
        })()),

        SVC_PGT_CRT => Action::Ret(pgtbl_create(k, cpt, cid, p0, p1, p2)),

        SVC_PGT_MAP => Action::Ret((|| {
            let pt = cpt.lookup::<Pgtbl>(cid)?;
            pt.require(CapFlags::PGTBL_MAP)?;
            pt.map_page(p0, p1, PageFlags::from_bits_truncate(p2 as u32))?;
            Ok(0)
        })()),

        SVC_PGT_UNMAP => Action::Ret((|| {
            let pt = cpt.lookup::<Pgtbl>(cid)?;
            pt.require(CapFlags::PGTBL_MAP)?;
            pt.unmap_page(p0)?;
            Ok(0)
        })()),

        SVC_PGT_CONS => Action::Ret((|| {
            let parent = cpt.lookup::<Pgtbl>(cid)?;
            parent.require(CapFlags::PGTBL_CONS)?;
            let child = cpt.lookup::<Pgtbl>(CapId::new(p1))?;
            child.require(CapFlags::PGTBL_CONS)?;
            parent.cons(p0, &child, PageFlags::from_bits_truncate(p2 as u32), &k.pgreg)?;
            Ok(0)
        })()),

        SVC_PGT_DES => Action::Ret((|| {
            let parent = cpt.lookup::<Pgtbl>(cid)?;
            parent.require(CapFlags::PGTBL_CONS)?;
            let child = cpt.lookup::<Pgtbl>(CapId::new(p1))?;
            parent.des(p0, &child, &k.pgreg)?;
            Ok(0)
        })()),

        SVC_PRC_CRT => Action::Ret(process_create(k, cpt, cid, p0, p1, p2)),

        SVC_PRC_CPT => Action::Ret((|| {
            let prc = cpt.lookup::<Process>(cid)?;
            prc.require(CapFlags::PROC_MOD)?;
            let tbl = cpt.lookup::<Captbl>(CapId::new(p0))?;
            prc.swap_captbl(&tbl)?;
            Ok(0)
        })()),

        SVC_PRC_PGT => Action::Ret((|| {
            let prc = cpt.lookup::<Process>(cid)?;
            prc.require(CapFlags::PROC_MOD)?;
            let pt = cpt.lookup::<Pgtbl>(CapId::new(p0))?;
            prc.swap_pgtbl(&pt)?;
            Ok(0)
        })()),

        SVC_THD_CRT => Action::Ret(thread_create(k, cpt, cid, p0, p1, p2)),

        SVC_SIG_CRT => Action::Ret(sig_create(k, cpt, cid, p0, p1)),

        SVC_INV_CRT => Action::Ret(inv_create(k, cpt, cid, p0, p1, p2)),

        SVC_INV_SET => Action::Ret((|| {
            let inv = cpt.lookup::<Invocation>(cid)?;
            inv.require(CapFlags::INV_ACT)?;
            inv.set(p0, p1)?;
            inv.set_fault_ret(p2 != 0)?;
            Ok(0)
        })()),

        _ => Action::Ret(Err(KernErr::TypeBad)),
    }
}

/// Exchange a thread's scheduler endpoint pin after a successful bind.
fn rebind_sched_sig(old: Word, new: Word) {
    if old == new {
        return;
    }
    if new != 0 {
        unsafe { &*(new as *const SigEndpoint) }.pin();
    }
    if old != 0 {
        unsafe { &*(old as *const SigEndpoint) }.unpin();
    }
}

/// Priority change with requeue and preemption check.
fn set_prio_requeue(k: &Kernel, thd: &Thread, prio: u32) -> Result<()> {
    match thd.state() {
        ThdState::Ready => {
            let cpu_id = thd.cpu().ok_or(KernErr::ThdNotBound)?;
            let ptr = thd as *const _ as *mut Thread;
            k.cpu(cpu_id).run.lock().remove(thd.prio() as usize, ptr);
            thd.set_prio(prio)?;
            sched::enqueue_ready(k, thd)
        }
        ThdState::Running => {
            thd.set_prio(prio)?;
            // A lowered running thread may no longer be the best choice
            // on its CPU.
            if let Some(cpu_id) = thd.cpu() {
                k.cpu(cpu_id).set_need_resched(true);
            }
            Ok(())
        }
        _ => thd.set_prio(prio),
    }
}

/// Park the current thread after a fault-equivalent condition.
fn park_faulted(k: &Kernel, cpu_id: usize, cur: &Thread, code: Word) {
    cur.set_fault(code, unsafe { cur.frame() }.ip());
    cur.set_state(ThdState::BlockedFault);
    let sig = cur.sched_sig();
    if sig != 0 {
        signal::send_kernel(k, unsafe { &*(sig as *const SigEndpoint) });
    }
    sched::schedule_out(k, cpu_id);
}

/// Reserve object storage through a kernel-memory capability.
fn reserve(
    k: &Kernel,
    cpt: &Captbl,
    kmem_cid: CapId,
    need: CapFlags,
    addr: Word,
    bytes: usize,
) -> Result<()> {
    let grant = cpt.lookup::<Kmem>(kmem_cid)?;
    grant.check(addr, bytes, need)?;
    k.kmem.mark(addr, bytes)
}

fn captbl_create(
    k: &Kernel,
    cpt: &Captbl,
    cid: CapId,
    p0: Word,
    p1: Word,
    p2: Word,
) -> Result<Word> {
    let dst = cpt.lookup::<Captbl>(cid)?;
    dst.require(CapFlags::CPT_MOD)?;
    let slots = p2;
    let bytes = Captbl::bytes_for(slots);
    reserve(k, cpt, CapId::new(param_hi(p0)), CapFlags::KMEM_CAPTBL, p1, bytes)?;

    let publish = unsafe {
        Captbl::init_at(p1, slots).and_then(|tbl| {
            cap_ops::publish_root(&dst, param_lo(p0), tbl, CapFlags::all(), k.epoch_u32())
        })
    };
    if let Err(e) = publish {
        let _ = k.kmem.clear(p1, bytes);
        return Err(e);
    }
    Ok(0)
}

fn pgtbl_create(
    k: &Kernel,
    cpt: &Captbl,
    cid: CapId,
    p0: Word,
    p1: Word,
    p2: Word,
) -> Result<Word> {
    let dst = cpt.lookup::<Captbl>(cid)?;
    dst.require(CapFlags::CPT_MOD)?;

    let storage = p1 & !1;
    let is_top = p1 & 1 != 0;
    let base = p2 & !0xFFF;
    let size_order = (p2 >> 6) & 0x3F;
    let num_order = p2 & 0x3F;
    let bytes = Pgtbl::bytes_for(num_order);
    reserve(k, cpt, CapId::new(param_hi(p0)), CapFlags::KMEM_PGTBL, storage, bytes)?;

    let asid = if is_top { k.next_asid() } else { 0 };
    let publish = unsafe {
        Pgtbl::init_at(storage, base, size_order, num_order, is_top, asid).and_then(|pt| {
            cap_ops::publish_root(&dst, param_lo(p0), pt, CapFlags::all(), k.epoch_u32())
        })
    };
    if let Err(e) = publish {
        let _ = k.kmem.clear(storage, bytes);
        return Err(e);
    }
    Ok(0)
}

fn process_create(
    k: &Kernel,
    cpt: &Captbl,
    cid: CapId,
    p0: Word,
    p1: Word,
    p2: Word,
) -> Result<Word> {
    let dst = cpt.lookup::<Captbl>(cid)?;
    dst.require(CapFlags::CPT_MOD)?;
    let new_cpt = cpt.lookup::<Captbl>(CapId::new(param_hi(p2)))?;
    let new_pgt = cpt.lookup::<Pgtbl>(CapId::new(param_lo(p2)))?;

    let bytes = Process::bytes();
    reserve(k, cpt, CapId::new(param_hi(p0)), CapFlags::KMEM_PROC, p1, bytes)?;

    let publish = unsafe {
        Process::init_at(p1, &new_cpt, &new_pgt).and_then(|prc| {
            cap_ops::publish_root(&dst, param_lo(p0), prc, CapFlags::all(), k.epoch_u32())
                .map_err(|e| {
                    (*prc).release();
                    e
                })
        })
    };
    if let Err(e) = publish {
        let _ = k.kmem.clear(p1, bytes);
        return Err(e);
    }
    Ok(0)
}

fn thread_create(
    k: &Kernel,
    cpt: &Captbl,
    cid: CapId,
    p0: Word,
    p1: Word,
    p2: Word,
) -> Result<Word> {
    let dst = cpt.lookup::<Captbl>(cid)?;
    dst.require(CapFlags::CPT_MOD)?;
    let proc_ = cpt.lookup::<Process>(CapId::new(param_hi(p2)))?;

    let bytes = Thread::bytes();
    reserve(k, cpt, CapId::new(param_hi(p0)), CapFlags::KMEM_THD, p1, bytes)?;

    let tid = k.next_tid();
    let publish = unsafe {
        Thread::init_at(p1, tid, &proc_, param_lo(p2) as u32).and_then(|thd| {
            cap_ops::publish_root(&dst, param_lo(p0), thd, CapFlags::all(), k.epoch_u32())
                .map_err(|e| {
                    (*thd).release();
                    e
                })
        })
    };
    if let Err(e) = publish {
        let _ = k.kmem.clear(p1, bytes);
        return Err(e);
    }
    Ok(tid as Word)
}

fn sig_create(k: &Kernel, cpt: &Captbl, cid: CapId, p0: Word, p1: Word) -> Result<Word> {
    let dst = cpt.lookup::<Captbl>(cid)?;
    dst.require(CapFlags::CPT_MOD)?;

    let bytes = SigEndpoint::bytes();
    reserve(k, cpt, CapId::new(param_hi(p0)), CapFlags::KMEM_SIG, p1, bytes)?;

    let publish = unsafe {
        let sig = SigEndpoint::init_at(p1);
        cap_ops::publish_root(&dst, param_lo(p0), sig, CapFlags::all(), k.epoch_u32())
    };
    if let Err(e) = publish {
        let _ = k.kmem.clear(p1, bytes);
        return Err(e);
    }
    Ok(0)
}

fn inv_create(
    k: &Kernel,
    cpt: &Captbl,
    cid: CapId,
    p0: Word,
    p1: Word,
    p2: Word,
) -> Result<Word> {
    let dst = cpt.lookup::<Captbl>(cid)?;
    dst.require(CapFlags::CPT_MOD)?;
    let proc_ = cpt.lookup::<Process>(CapId::new(p2))?;

    let bytes = Invocation::bytes();
    reserve(k, cpt, CapId::new(param_hi(p0)), CapFlags::KMEM_INV, p1, bytes)?;

    let publish = unsafe {
        let inv = Invocation::init_at(p1, &proc_);
        cap_ops::publish_root(&dst, param_lo(p0), inv, CapFlags::all(), k.epoch_u32())
            .map_err(|e| {
                (*inv).release();
                e
            })
    };
    if let Err(e) = publish {
        let _ = k.kmem.clear(p1, bytes);
        return Err(e);
    }
    Ok(0)
}

/// Scheduler-timer entry.
pub fn tick_handler(k: &Kernel) {
    let cpu_id = config::platform().cpu_id();
    sched::tick(k, cpu_id);
    if k.cpu(cpu_id).need_resched() {
        sched::reschedule(k, cpu_id);
    }
}

/// Generic interrupt entry: acknowledge, post the per-CPU vector
/// signal, preempt on the way out if a wake demands it.
pub fn interrupt_handler(k: &Kernel, vector: Word) {
    let platform = config::platform();
    let cpu_id = platform.cpu_id();
    platform.int_ack(vector);

    let sig = k.cpu(cpu_id).vect_sig();
    if sig != 0 {
        signal::send_kernel(k, unsafe { &*(sig as *const SigEndpoint) });
    }
    if k.cpu(cpu_id).need_resched() {
        sched::reschedule(k, cpu_id);
    }
}

/// Fault entry. User faults park the thread and notify its scheduler;
/// kernel faults with no user context halt the CPU.
pub fn fault_handler(k: &Kernel, reason: Word) {
    let platform = config::platform();
    let cpu_id = platform.cpu_id();
    match k.cpu(cpu_id).current() {
        Some(cur) => park_faulted(k, cpu_id, cur, reason),
        None => {
            crate::kerror!("cpu {}: fault {:#x} with no user context", cpu_id, reason);
            platform.halt();
        }
    }
}
