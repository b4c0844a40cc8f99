//! End-to-end scenarios
//!
//! Boots a kernel over a leaked host buffer and drives it the way user
//! space would: through the syscall dispatcher with arguments placed in
//! the current thread's frame. The software platform records hardware
//! side effects (IPIs, page-table loads, user-mode entries); tests that
//! read that shared state serialize on one lock.

use core::cell::Cell;

use std::boxed::Box;
use std::sync::Mutex as StdMutex;
use std::vec;

use crate::boot::{self, BootInfo};
use crate::captbl::{CapFlags, CapId, CapType, Captbl};
use crate::config::{
    self, BOOT_CAPTBL, BOOT_INIT_PROC, BOOT_TBL_KMEM, BOOT_TBL_PGTBL, BOOT_TBL_TIMER, MAX_PRIO,
    QUIESCENCE_TICKS,
};
use crate::error::{KernErr, RetWord};
use crate::hal::Platform;
use crate::kmem::Kmem;
use crate::pgtbl::{PageFlags, Pgtbl};
use crate::process::Process;
use crate::sched;
use crate::signal::{self, RecvOutcome, SigEndpoint};
use crate::syscall::{self, numbers::*};
use crate::thread::{ThdState, Thread};
use crate::{Kernel, Word};

static STUB_LOCK: StdMutex<()> = StdMutex::new(());

const USER_ENTRY: Word = 0x4000;
const USER_STACK: Word = 0x9000;

struct Env {
    k: &'static Kernel,
    root: &'static Captbl,
    cursor: Cell<Word>,
    grant_end: Word,
}

fn boot_env(ncpu: usize) -> Env {
    config::stub().set_cpu(0);

    let mem = Box::leak(vec![0u8; (1 << 20) + 4096].into_boxed_slice());
    let base = (mem.as_ptr() as usize + 4095) & !4095;
    let k: &'static Kernel = Box::leak(Box::new(Kernel::new()));
    let info = BootInfo {
        kmem_base: base,
        kmem_size: 1 << 20,
        ncpu,
        user_entry: USER_ENTRY,
        user_stack: USER_STACK,
        top_size_order: 54,
        top_num_order: 9,
    };
    let root = boot::kmain(k, &info).expect("boot");

    let grant = root
        .lookup::<Kmem>(CapId::two_level(BOOT_TBL_KMEM, 0))
        .expect("boot kmem cap");
    let env = Env {
        k,
        root,
        cursor: Cell::new(grant.base()),
        grant_end: grant.base() + grant.size(),
    };
    drop(grant);
    env
}

impl Env {
    /// Pick object storage from the delegated range; the create
    /// operation itself marks the Kot.
    fn alloc(&self, bytes: usize, align: usize) -> Word {
        let addr = (self.cursor.get() + align - 1) & !(align - 1);
        self.cursor.set(addr + ((bytes + 63) & !63));
        assert!(self.cursor.get() <= self.grant_end);
        addr
    }

    fn kmem_cid(&self) -> Word {
        CapId::two_level(BOOT_TBL_KMEM, 0).raw()
    }

    fn cur(&self) -> &'static Thread {
        let t = self.k.cpu(config::stub().cpu_id()).current().expect("current");
        unsafe { &*(t as *const Thread) }
    }

    /// Issue a syscall as the current thread and return the signed word
    /// the dispatcher left in its return register.
    fn syscall(&self, svc: Word, cid: Word, p0: Word, p1: Word, p2: Word) -> RetWord {
        let cur = self.cur();
        unsafe {
            let frame = cur.frame_mut();
            frame.regs[0] = pack_svc(svc, cid);
            frame.regs[1] = p0;
            frame.regs[2] = p1;
            frame.regs[3] = p2;
        }
        syscall::syscall_handler(self.k);
        unsafe { cur.frame() }.retval()
    }

    fn make_thread(&self, prio: u32) -> &'static Thread {
        let proc_ = self
            .root
            .lookup::<Process>(CapId::new(BOOT_INIT_PROC))
            .expect("init proc");
        let addr = self.alloc(Thread::bytes(), 64);
        let thd = unsafe { &*Thread::init_at(addr, self.k.next_tid(), &proc_, prio).unwrap() };
        thd
    }
}

#[test]
fn boot_one_thread() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let before = config::stub().user_entry().0;
    let env = boot_env(1);

    // Capability 0 names the boot captbl itself.
    let slot0 = env.root.slot(BOOT_CAPTBL).unwrap();
    assert_eq!(slot0.cap_type(), CapType::CapTable);
    assert_eq!(slot0.object(), env.root as *const _ as Word);

    // Core 0 entered user mode at the configured entry and stack.
    let (count, entry) = config::stub().user_entry();
    assert_eq!(count, before + 1);
    assert_eq!(entry.ip, USER_ENTRY);
    assert_eq!(entry.sp, USER_STACK);
    assert_eq!(entry.arg, 0);

    // The per-core tick endpoint exists at the fixed index.
    assert!(env
        .root
        .lookup::<SigEndpoint>(CapId::two_level(BOOT_TBL_TIMER, 0))
        .is_ok());
    assert_eq!(MAX_PRIO, 32);

    // The boot thread is current and running with the top pgtbl loaded.
    let cur = env.k.cpu(0).current().unwrap();
    assert_eq!(cur.state(), ThdState::Running);
    let top = env
        .root
        .lookup::<Pgtbl>(CapId::two_level(BOOT_TBL_PGTBL, 0))
        .unwrap();
    assert_eq!(config::stub().loaded_root(), top.addr());
}

#[test]
fn cap_derive_and_freeze() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(1);

    // A fresh captbl of size 8 published at root slot 8.
    let tbl_addr = env.alloc(Captbl::bytes_for(8), 64);
    assert_eq!(
        env.syscall(
            SVC_CPT_CRT,
            BOOT_CAPTBL as Word,
            pack_param(env.kmem_cid(), 8),
            tbl_addr,
            8,
        ),
        0
    );

    // Signal endpoint at slot 2 of the new table.
    let sig_addr = env.alloc(SigEndpoint::bytes(), 64);
    assert_eq!(
        env.syscall(SVC_SIG_CRT, 8, pack_param(env.kmem_cid(), 2), sig_addr, 0),
        0
    );

    // Derive slot3 from slot2 with send-only rights.
    let send = CapFlags::SIG_SND.bits() as Word;
    assert_eq!(
        env.syscall(SVC_CPT_ADD, 8, pack_param(8, 2), 3, send),
        0
    );

    // Freeze slot2; further derivation from it is refused.
    assert_eq!(env.syscall(SVC_CPT_FRZ, 8, 2, 0, 0), 0);
    let both = (CapFlags::SIG_SND | CapFlags::SIG_RCV).bits() as Word;
    assert_eq!(
        env.syscall(SVC_CPT_ADD, 8, pack_param(8, 2), 4, both),
        KernErr::Frozen.code()
    );

    // The unfrozen child still derives.
    assert_eq!(
        env.syscall(SVC_CPT_ADD, 8, pack_param(8, 3), 4, send),
        0
    );
}

#[test]
fn freeze_thaw_requires_quiescence() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(1);

    let sig_addr = env.alloc(SigEndpoint::bytes(), 64);
    assert_eq!(
        env.syscall(SVC_SIG_CRT, 0, pack_param(env.kmem_cid(), 8), sig_addr, 0),
        0
    );
    assert_eq!(env.syscall(SVC_CPT_FRZ, 0, 8, 0, 0), 0);

    // Not a single tick has passed on this CPU yet.
    assert_eq!(
        env.syscall(SVC_CPT_THAW, 0, 8, 0, 0),
        KernErr::NotQuiesced.code()
    );

    for _ in 0..=QUIESCENCE_TICKS {
        sched::tick(env.k, 0);
    }
    assert_eq!(env.syscall(SVC_CPT_THAW, 0, 8, 0, 0), 0);
}

#[test]
fn priority_preemption() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(2);
    config::stub().set_cpu(0);

    // Park the boot thread so constructed threads own the CPU.
    let boot_thd = env.cur();
    sched::suspend(env.k, boot_thd).unwrap();

    let a = env.make_thread(5);
    sched::bind(env.k, a, 0, 5, 0).unwrap();
    sched::resume(env.k, a).unwrap();
    sched::reschedule(env.k, 0);
    assert_eq!(a.state(), ThdState::Running);

    // Same-CPU preemption raises the flag, no IPI.
    let ipi0_before = config::stub().ipi_count(0);
    let b = env.make_thread(10);
    sched::bind(env.k, b, 0, 10, 0).unwrap();
    sched::resume(env.k, b).unwrap();
    assert!(env.k.cpu(0).need_resched());
    assert_eq!(config::stub().ipi_count(0), ipi0_before);

    sched::reschedule(env.k, 0);
    assert_eq!(b.state(), ThdState::Running);
    assert_eq!(a.state(), ThdState::Ready);
    assert_eq!(
        env.k.cpu(0).current().unwrap() as *const Thread,
        b as *const Thread
    );

    // Cross-CPU binding posts an IPI to the target core.
    let ipi1_before = config::stub().ipi_count(1);
    let c = env.make_thread(10);
    sched::bind(env.k, c, 1, 10, 0).unwrap();
    sched::resume(env.k, c).unwrap();
    assert_eq!(config::stub().ipi_count(1), ipi1_before + 1);
}

#[test]
fn signal_wake_one_fifo() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(1);

    let ep_addr = env.alloc(SigEndpoint::bytes(), 64);
    let ep = unsafe { &*SigEndpoint::init_at(ep_addr) };

    let t1 = env.make_thread(5);
    let t2 = env.make_thread(5);
    sched::bind(env.k, t1, 0, 5, 0).unwrap();
    sched::bind(env.k, t2, 0, 5, 0).unwrap();

    assert_eq!(
        signal::receive(env.k, ep, t1, true).unwrap(),
        RecvOutcome::Blocked
    );
    assert_eq!(
        signal::receive(env.k, ep, t2, true).unwrap(),
        RecvOutcome::Blocked
    );
    assert_eq!(ep.waiters(), 2);

    // One send wakes exactly the first waiter.
    assert_eq!(signal::send(env.k, ep, 1).unwrap(), 1);
    assert_eq!(t1.state(), ThdState::Ready);
    assert_eq!(t2.state(), ThdState::BlockedRecv);
    assert_eq!(ep.count(), 0);
    assert_eq!(ep.waiters(), 1);
    assert_eq!(t1.waiting_on(), 0);
    assert_eq!(t2.waiting_on(), ep_addr);

    // A send with no waiter banks the count; a non-blocking receive
    // drains it back to where it started.
    assert_eq!(signal::send(env.k, ep, 1).unwrap(), 1);
    assert_eq!(ep.waiters(), 0);
    assert_eq!(signal::send(env.k, ep, 1).unwrap(), 0);
    assert_eq!(ep.count(), 1);
    assert_eq!(
        signal::receive(env.k, ep, t1, false).unwrap(),
        RecvOutcome::Taken
    );
    assert_eq!(ep.count(), 0);
}

#[test]
fn broadcast_wake_enters_queues_in_tid_order() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(1);

    let ep_addr = env.alloc(SigEndpoint::bytes(), 64);
    let ep = unsafe { &*SigEndpoint::init_at(ep_addr) };

    let ta = env.make_thread(5);
    let tb = env.make_thread(5);
    assert!(ta.tid() < tb.tid());
    sched::bind(env.k, ta, 0, 5, 0).unwrap();
    sched::bind(env.k, tb, 0, 5, 0).unwrap();

    // Arrival order is the reverse of thread-id order.
    assert_eq!(
        signal::receive(env.k, ep, tb, true).unwrap(),
        RecvOutcome::Blocked
    );
    assert_eq!(
        signal::receive(env.k, ep, ta, true).unwrap(),
        RecvOutcome::Blocked
    );

    // A broadcast wake sorts the batch by thread id before enqueueing.
    assert_eq!(signal::send(env.k, ep, 2).unwrap(), 2);
    assert_eq!(ta.state(), ThdState::Ready);
    assert_eq!(tb.state(), ThdState::Ready);
    let first = env.k.cpu(0).run.lock().pop_highest().unwrap();
    let second = env.k.cpu(0).run.lock().pop_highest().unwrap();
    assert_eq!(first, ta as *const Thread as *mut Thread);
    assert_eq!(second, tb as *const Thread as *mut Thread);
}

#[test]
fn invocation_round_trip() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(1);

    // Target process P2: its own captbl and top page table.
    let tbl_addr = env.alloc(Captbl::bytes_for(8), 64);
    assert_eq!(
        env.syscall(
            SVC_CPT_CRT,
            0,
            pack_param(env.kmem_cid(), 8),
            tbl_addr,
            8
        ),
        0
    );
    let pgt_addr = env.alloc(Pgtbl::bytes_for(9), 256);
    assert_eq!(
        env.syscall(
            SVC_PGT_CRT,
            0,
            pack_param(env.kmem_cid(), 9),
            pgt_addr | 1,
            (54 << 6) | 9,
        ),
        0
    );
    let prc_addr = env.alloc(Process::bytes(), 64);
    assert_eq!(
        env.syscall(
            SVC_PRC_CRT,
            0,
            pack_param(env.kmem_cid(), 10),
            prc_addr,
            pack_param(8, 9),
        ),
        0
    );
    let inv_addr = env.alloc(crate::invocation::Invocation::bytes(), 64);
    assert_eq!(
        env.syscall(SVC_INV_CRT, 0, pack_param(env.kmem_cid(), 11), inv_addr, 10),
        0
    );
    assert_eq!(env.syscall(SVC_INV_SET, 11, 0x5000, 0x6000, 0), 0);

    // P2 needs to name the invocation too: code running inside it
    // resolves capabilities in P2's captbl.
    let act = CapFlags::INV_ACT.bits() as Word;
    assert_eq!(env.syscall(SVC_CPT_ADD, 8, pack_param(0, 11), 11, act), 0);

    // Caller state the return must restore.
    let cur = env.cur();
    unsafe {
        let frame = cur.frame_mut();
        frame.set_ip(0x4004);
        frame.set_sp(USER_STACK);
    }

    // Activate with arg 0x42: same thread, target entry, target space.
    env.syscall(SVC_INV_ACT, 11, 0x42, 0, 0);
    {
        let frame = unsafe { cur.frame() };
        assert_eq!(frame.ip(), 0x5000);
        assert_eq!(frame.sp(), 0x6000);
        assert_eq!(frame.arg(), 0x42);
    }
    assert_eq!(config::stub().loaded_root(), pgt_addr);
    assert_eq!(cur.inv_depth(), 1);

    // Return 0x7F: caller ip/sp and address space come back exactly.
    env.syscall(SVC_INV_RET, 0, 0x7F, 0, 0);
    let frame = unsafe { cur.frame() };
    assert_eq!(frame.ip(), 0x4004);
    assert_eq!(frame.sp(), USER_STACK);
    assert_eq!(frame.retval(), 0x7F);
    assert_eq!(cur.inv_depth(), 0);
    let top = env
        .root
        .lookup::<Pgtbl>(CapId::two_level(BOOT_TBL_PGTBL, 0))
        .unwrap();
    assert_eq!(config::stub().loaded_root(), top.addr());

    // A second activation is refused while the first is live.
    env.syscall(SVC_INV_ACT, 11, 1, 0, 0);
    assert_eq!(
        env.syscall(SVC_INV_ACT, 11, 2, 0, 0),
        KernErr::InvActive.code()
    );
    env.syscall(SVC_INV_RET, 0, 0, 0, 0);
}

#[test]
fn pgtbl_destroy_guarded() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(1);

    // Top T at slot 8 (16 entries of 64 KiB), child C at slot 9.
    let t_addr = env.alloc(Pgtbl::bytes_for(4), 256);
    assert_eq!(
        env.syscall(
            SVC_PGT_CRT,
            0,
            pack_param(env.kmem_cid(), 8),
            t_addr | 1,
            (16 << 6) | 4,
        ),
        0
    );
    let c_addr = env.alloc(Pgtbl::bytes_for(4), 256);
    assert_eq!(
        env.syscall(
            SVC_PGT_CRT,
            0,
            pack_param(env.kmem_cid(), 9),
            c_addr,
            (3 << 16) | (12 << 6) | 4,
        ),
        0
    );

    let all = PageFlags::all().bits() as Word;
    assert_eq!(env.syscall(SVC_PGT_CONS, 8, 3, 9, all), 0);

    // C is linked under T: destruction is refused.
    assert_eq!(
        env.syscall(SVC_CPT_REM, 0, 9, 0, 0),
        KernErr::PgtblNotEmpty.code()
    );

    // Sever the link; now C goes away and its storage waits out the
    // quiescence period.
    assert_eq!(env.syscall(SVC_PGT_DES, 8, 3, 9, 0), 0);
    let pending_before = env.k.reclaim_pending();
    assert_eq!(env.syscall(SVC_CPT_REM, 0, 9, 0, 0), 0);
    assert_eq!(env.k.reclaim_pending(), pending_before + 1);

    // After a full quiescence period the Kot bits are released and the
    // storage can be reserved again.
    for _ in 0..=QUIESCENCE_TICKS {
        sched::tick(env.k, 0);
    }
    assert_eq!(env.k.reclaim_pending(), pending_before);
    assert!(env.k.kmem.mark(c_addr, Pgtbl::bytes_for(4)).is_ok());
}

#[test]
fn budget_exhaustion_suspends_and_notifies() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(1);

    let boot_thd = env.cur();
    sched::suspend(env.k, boot_thd).unwrap();

    let sig_addr = env.alloc(SigEndpoint::bytes(), 64);
    let sig = unsafe { &*SigEndpoint::init_at(sig_addr) };

    let t = env.make_thread(5);
    sched::bind(env.k, t, 0, 5, sig_addr).unwrap();
    sig.pin();
    t.budget_add(2);
    sched::resume(env.k, t).unwrap();
    sched::reschedule(env.k, 0);
    assert_eq!(t.state(), ThdState::Running);

    sched::tick(env.k, 0);
    assert_eq!(t.state(), ThdState::Running);
    let sig_count_before = sig.count();
    sched::tick(env.k, 0);

    // Budget hit zero: suspended, scheduler endpoint poked.
    assert_eq!(t.state(), ThdState::Suspended);
    assert_eq!(sig.count(), sig_count_before + 1);

    // Top-up via donation and resume.
    let donor = env.make_thread(5);
    donor.budget_add(100);
    assert_eq!(sched::time_xfer(donor, t, 40), 40);
    assert_eq!(t.budget(), 40);
    assert_eq!(donor.budget(), 60);
    sched::resume(env.k, t).unwrap();
    sched::reschedule(env.k, 0);
    assert_eq!(t.state(), ThdState::Running);
}

#[test]
fn fault_parks_thread_and_notifies_scheduler() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(1);

    let boot_thd = env.cur();
    let sig_addr = env.alloc(SigEndpoint::bytes(), 64);
    let sig = unsafe { &*SigEndpoint::init_at(sig_addr) };
    // Binding cannot change while Running; attach the scheduler
    // endpoint directly.
    assert_eq!(
        sched::bind(env.k, boot_thd, 0, (MAX_PRIO - 1) as u32, sig_addr),
        Err(KernErr::ThdState)
    );
    boot_thd.set_sched_sig(sig_addr);
    sig.pin();

    unsafe { boot_thd.frame_mut() }.set_ip(0x4444);
    syscall::fault_handler(env.k, 13);

    assert_eq!(boot_thd.state(), ThdState::BlockedFault);
    assert_eq!(boot_thd.fault_info(), (13, 0x4444));
    assert_eq!(sig.count(), 1);
    assert!(env.k.cpu(0).current().is_none());

    // Explicit resume brings it back.
    sched::resume(env.k, boot_thd).unwrap();
    sched::reschedule(env.k, 0);
    assert_eq!(boot_thd.state(), ThdState::Running);
}

#[test]
fn walk_reflects_syscall_mappings() {
    let _g = STUB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let env = boot_env(1);

    // A small address space: top of 16 x 64 KiB, child of 16 x 4 KiB.
    let t_addr = env.alloc(Pgtbl::bytes_for(4), 256);
    assert_eq!(
        env.syscall(
            SVC_PGT_CRT,
            0,
            pack_param(env.kmem_cid(), 8),
            t_addr | 1,
            (16 << 6) | 4,
        ),
        0
    );
    let c_addr = env.alloc(Pgtbl::bytes_for(4), 256);
    assert_eq!(
        env.syscall(
            SVC_PGT_CRT,
            0,
            pack_param(env.kmem_cid(), 9),
            c_addr,
            (1 << 16) | (12 << 6) | 4,
        ),
        0
    );
    let all = PageFlags::all().bits() as Word;
    assert_eq!(env.syscall(SVC_PGT_CONS, 8, 1, 9, all), 0);

    let rw = (PageFlags::READ | PageFlags::WRITE).bits() as Word;
    assert_eq!(env.syscall(SVC_PGT_MAP, 9, 2, 0x8_8000, rw), 0);

    let top = env.root.lookup::<Pgtbl>(CapId::new(8)).unwrap();
    let (phys, order, flags) = crate::pgtbl::walk(&top, (1 << 16) + (2 << 12) + 0x10).unwrap();
    assert_eq!(phys, 0x8_8000);
    assert_eq!(order, 12);
    assert_eq!(flags, PageFlags::READ | PageFlags::WRITE);

    // Mapping an occupied entry reports the entry untouched.
    assert_eq!(
        env.syscall(SVC_PGT_MAP, 9, 2, 0x9_0000, rw),
        KernErr::PgtblBad.code()
    );
    assert_eq!(env.syscall(SVC_PGT_UNMAP, 9, 2, 0, 0), 0);
}
