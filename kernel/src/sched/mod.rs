//! Scheduler
//!
//! Strict-priority preemptive scheduling with FIFO order inside each
//! priority. Every CPU owns a run-queue set and a one-word priority
//! bitmap; picking the next thread is an MSB scan. A thread is bound to
//! exactly one CPU at a time and only its bound CPU runs it.
//!
//! Preemption is cooperative with the dispatcher: enqueuing a
//! higher-priority thread raises the target CPU's resched flag, or posts
//! an IPI when the target is remote. The dispatcher acts on the flag at
//! the end of the current kernel entry.
//!
//! Context-switch ordering: the trampoline saves outgoing registers into
//! the outgoing thread's frame before dispatch and restores the incoming
//! thread's frame after it, so the core's part of a switch is updating
//! `current` and loading the incoming address space, with interrupts
//! masked throughout.

pub mod types;

use crate::config::{self, MAX_PRIO};
use crate::error::{KernErr, Result};
use crate::hal::Platform;
use crate::signal;
use crate::thread::{ThdState, Thread};
use crate::{Kernel, Word};

/// IPI vector used to poke a remote CPU into rescheduling.
pub const IPI_RESCHED: Word = 0x2;

/// Raise the preemption flag on `cpu_id` if `prio` beats what runs
/// there, using an IPI when the CPU is not the caller's.
fn preempt_check(k: &Kernel, cpu_id: usize, prio: u32) {
    let cpu = k.cpu(cpu_id);
    let beaten = match cpu.current() {
        Some(cur) => cur.state() != ThdState::Running || prio > cur.prio(),
        None => true,
    };
    if !beaten {
        return;
    }
    let platform = config::platform();
    if cpu_id == platform.cpu_id() {
        cpu.set_need_resched(true);
    } else {
        platform.send_ipi(cpu_id, IPI_RESCHED);
    }
}

/// Make a bound thread Ready and enqueue it on its CPU.
pub fn enqueue_ready(k: &Kernel, thd: &Thread) -> Result<()> {
    let cpu_id = thd.cpu().ok_or(KernErr::ThdNotBound)?;
    let prio = thd.prio() as usize;
    debug_assert!(prio < MAX_PRIO);
    thd.set_state(ThdState::Ready);
    {
        let mut run = k.cpu(cpu_id).run.lock();
        if !run.enqueue(prio, thd as *const _ as *mut Thread) {
            return Err(KernErr::ThdState);
        }
    }
    preempt_check(k, cpu_id, thd.prio());
    Ok(())
}

/// Switch `cpu_id` to `next`: mark it Running, publish it as current and
/// load its address space.
pub fn switch_to(k: &Kernel, cpu_id: usize, next: &Thread) {
    debug_assert_eq!(next.cpu(), Some(cpu_id));
    next.set_state(ThdState::Running);
    k.cpu(cpu_id).set_current(next as *const _ as *mut Thread);
    let pgtbl = next.process().pgtbl();
    config::platform().load_page_table(pgtbl as *const _ as Word, pgtbl.asid() as Word);
}

/// Act on the preemption flag: switch to the highest-priority Ready
/// thread if it beats (or replaces) the current one. Returns whether a
/// switch happened.
pub fn reschedule(k: &Kernel, cpu_id: usize) -> bool {
    let cpu = k.cpu(cpu_id);
    cpu.set_need_resched(false);

    let cur = cpu.current();
    let running = cur.filter(|t| t.state() == ThdState::Running);

    let next = {
        let mut run = cpu.run.lock();
        let highest = match run.highest() {
            Some(h) => h,
            None => {
                if running.is_none() {
                    cpu.set_current(core::ptr::null_mut());
                }
                return false;
            }
        };
        if let Some(cur) = running {
            if highest as u32 <= cur.prio() {
                return false;
            }
            cur.set_state(ThdState::Ready);
            run.enqueue(cur.prio() as usize, cur as *const _ as *mut Thread);
        }
        match run.pop_highest() {
            Some(n) => n,
            None => return false,
        }
    };

    switch_to(k, cpu_id, unsafe { &*next });
    true
}

/// Voluntarily rotate to the back of the current priority's queue.
pub fn yield_now(k: &Kernel, cpu_id: usize) {
    let cpu = k.cpu(cpu_id);
    let next = {
        let mut run = cpu.run.lock();
        if let Some(cur) = cpu.current() {
            if cur.state() == ThdState::Running {
                cur.set_state(ThdState::Ready);
                run.enqueue(cur.prio() as usize, cur as *const _ as *mut Thread);
            }
        }
        run.pop_highest()
    };
    if let Some(next) = next {
        switch_to(k, cpu_id, unsafe { &*next });
    }
}

/// The current thread has blocked or been suspended; hand the CPU to
/// whoever is next, or idle.
pub fn schedule_out(k: &Kernel, cpu_id: usize) {
    let cpu = k.cpu(cpu_id);
    let next = cpu.run.lock().pop_highest();
    match next {
        Some(next) => switch_to(k, cpu_id, unsafe { &*next }),
        None => cpu.set_current(core::ptr::null_mut()),
    }
}

/// Bind a thread to a CPU, setting its priority and scheduler endpoint.
///
/// Binding cannot change while the thread is Running. A Ready thread is
/// moved onto the new CPU's queue, which may preempt it.
pub fn bind(
    k: &Kernel,
    thd: &Thread,
    cpu_id: usize,
    prio: u32,
    sched_sig: Word,
) -> Result<()> {
    if cpu_id >= k.ncpu() {
        return Err(KernErr::ThdBad);
    }
    if thd.state() == ThdState::Running {
        return Err(KernErr::ThdState);
    }
    if prio as usize >= MAX_PRIO {
        return Err(KernErr::ThdPrio);
    }

    // Pull a Ready thread off its old queue under the old priority
    // before the priority changes underneath the queue key.
    let thd_ptr = thd as *const _ as *mut Thread;
    if let Some(old) = thd.cpu() {
        if thd.state() == ThdState::Ready {
            k.cpu(old).run.lock().remove(thd.prio() as usize, thd_ptr);
        }
    }
    thd.set_prio(prio)?;
    thd.set_cpu(Some(cpu_id));
    thd.set_sched_sig(sched_sig);

    if thd.state() == ThdState::Ready {
        let mut run = k.cpu(cpu_id).run.lock();
        run.enqueue(prio as usize, thd_ptr);
        drop(run);
        preempt_check(k, cpu_id, prio);
    }
    Ok(())
}

/// Release a thread's CPU binding. Fails while it is Running.
pub fn unbind(k: &Kernel, thd: &Thread) -> Result<()> {
    let cpu_id = thd.cpu().ok_or(KernErr::ThdNotBound)?;
    if thd.state() == ThdState::Running {
        return Err(KernErr::ThdState);
    }
    if thd.state() == ThdState::Ready {
        k.cpu(cpu_id)
            .run
            .lock()
            .remove(thd.prio() as usize, thd as *const _ as *mut Thread);
        thd.set_state(ThdState::Suspended);
    }
    thd.set_cpu(None);
    Ok(())
}

/// Move a thread into Suspended from any state.
pub fn suspend(k: &Kernel, thd: &Thread) -> Result<()> {
    match thd.state() {
        ThdState::Suspended => Ok(()),
        ThdState::Running => {
            thd.set_state(ThdState::Suspended);
            let cpu_id = thd.cpu().ok_or(KernErr::ThdNotBound)?;
            let platform = config::platform();
            if cpu_id == platform.cpu_id() {
                k.cpu(cpu_id).set_need_resched(true);
            } else {
                platform.send_ipi(cpu_id, IPI_RESCHED);
            }
            Ok(())
        }
        ThdState::Ready => {
            if let Some(cpu_id) = thd.cpu() {
                k.cpu(cpu_id)
                    .run
                    .lock()
                    .remove(thd.prio() as usize, thd as *const _ as *mut Thread);
            }
            thd.set_state(ThdState::Suspended);
            Ok(())
        }
        ThdState::BlockedRecv => {
            let ep = thd.waiting_on();
            if ep != 0 {
                signal::remove_waiter(ep, thd);
                thd.set_waiting_on(0);
            }
            thd.set_state(ThdState::Suspended);
            Ok(())
        }
        ThdState::BlockedSend | ThdState::BlockedFault => {
            thd.set_state(ThdState::Suspended);
            Ok(())
        }
    }
}

/// Resume a Suspended or fault-parked thread.
pub fn resume(k: &Kernel, thd: &Thread) -> Result<()> {
    match thd.state() {
        ThdState::Suspended | ThdState::BlockedFault => {
            if thd.cpu().is_none() {
                return Err(KernErr::ThdNotBound);
            }
            enqueue_ready(k, thd)
        }
        _ => Err(KernErr::ThdState),
    }
}

/// Donate up to `ticks` of budget from `src` to `dst`. Returns the
/// amount actually moved; the destination saturates.
pub fn time_xfer(src: &Thread, dst: &Thread, ticks: u32) -> u32 {
    let taken = src.budget_take(ticks);
    dst.budget_add(taken);
    taken
}

/// One scheduler tick on `cpu_id`.
///
/// Advances the global epoch (boot CPU), publishes this CPU's quiescence
/// marker, reclaims expired arena ranges, burns the running thread's
/// budget and pokes the per-CPU tick endpoint.
pub fn tick(k: &Kernel, cpu_id: usize) {
    if cpu_id == 0 {
        k.advance_epoch();
    }
    let cpu = k.cpu(cpu_id);
    cpu.set_quiescence(k.epoch());
    k.reclaim_expired();

    if let Some(cur) = cpu.current() {
        if cur.state() == ThdState::Running && cur.budget_tick() {
            // Budget exhausted: park the thread and tell its scheduler.
            cur.set_state(ThdState::Suspended);
            let sig = cur.sched_sig();
            if sig != 0 {
                signal::send_kernel(k, unsafe { &*(sig as *const signal::SigEndpoint) });
            }
            cpu.set_need_resched(true);
        }
    }

    let tick_sig = cpu.tick_sig();
    if tick_sig != 0 {
        signal::send_kernel(k, unsafe { &*(tick_sig as *const signal::SigEndpoint) });
    }
}
