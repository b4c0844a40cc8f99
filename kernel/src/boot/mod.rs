//! Boot
//!
//! The only code allowed to create capabilities without a pre-existing
//! capability. On the boot CPU it initializes the arena and the per-CPU
//! blocks, builds the initial capability table with the fixed layout
//! (captbl, top pgtbl array, init process, per-core threads, kernel
//! function, kernel memory, per-core timer and interrupt signals),
//! releases the secondary CPUs and drops core 0 into user mode at the
//! configured entry.

use spin::Once;

use crate::captbl::{ops as cap_ops, CapFlags, Captbl};
use crate::config::{
    self, BOOT_BUDGET, BOOT_CAPTBL, BOOT_CAPTBL_SLOTS, BOOT_INIT_PROC, BOOT_KFN, BOOT_TBL_INT,
    BOOT_TBL_KMEM, BOOT_TBL_PGTBL, BOOT_TBL_THD, BOOT_TBL_TIMER, KMEM_SLOT_SIZE,
};
use crate::error::{KernErr, Result};
use crate::hal::Platform;
use crate::kfn::KernFunc;
use crate::kmem::{Kmem, KmemArena};
use crate::pgtbl::Pgtbl;
use crate::process::Process;
use crate::sched;
use crate::signal::SigEndpoint;
use crate::thread::{ThdState, Thread};
use crate::{Kernel, Word};

/// Timer period handed to the platform at boot, in platform units.
pub const TICK_INTERVAL: Word = 10_000;

/// Physical/virtual layout handed over by the architecture bring-up.
pub struct BootInfo {
    /// Kernel-memory arena range.
    pub kmem_base: Word,
    pub kmem_size: usize,
    /// Live CPU count.
    pub ncpu: usize,
    /// Initial user entry point and stack top, used for every core's
    /// initial thread.
    pub user_entry: Word,
    pub user_stack: Word,
    /// Shape of the initial top-level page table.
    pub top_size_order: usize,
    pub top_num_order: usize,
}

static RELEASED: Once<()> = Once::new();

/// Bump allocator over the front of the arena, marking the Kot as it
/// goes. Boot only; later allocations come through kernel-memory
/// capabilities.
struct BootAlloc<'a> {
    kmem: &'a KmemArena,
    next: Word,
}

impl<'a> BootAlloc<'a> {
    fn take(&mut self, bytes: usize, align: usize) -> Result<Word> {
        let align = align.max(KMEM_SLOT_SIZE);
        let addr = (self.next + align - 1) & !(align - 1);
        self.kmem.mark(addr, bytes)?;
        self.next = addr + KmemArena::round_up(bytes);
        Ok(addr)
    }
}

/// Construct the initial kernel objects on core 0 and enter user mode.
///
/// Returns the root capability table so the caller (bring-up, or the
/// test harness) can reach the boot capabilities.
pub fn kmain(k: &'static Kernel, info: &BootInfo) -> Result<&'static Captbl> {
    let platform = config::platform();
    k.init(info.kmem_base, info.kmem_size, info.ncpu)?;
    let ncpu = k.ncpu();
    let epoch = k.epoch_u32();
    let mut alloc = BootAlloc { kmem: &k.kmem, next: info.kmem_base };

    crate::kinfo!(
        "boot: arena {:#x}+{:#x}, {} cpu(s)",
        info.kmem_base,
        info.kmem_size,
        ncpu
    );

    // The root capability table, holding a capability to itself.
    let root_addr = alloc.take(Captbl::bytes_for(BOOT_CAPTBL_SLOTS), KMEM_SLOT_SIZE)?;
    let root = unsafe { &*Captbl::init_at(root_addr, BOOT_CAPTBL_SLOTS)? };
    unsafe {
        cap_ops::publish_root(root, BOOT_CAPTBL, root, CapFlags::all(), epoch)?;
    }

    // Top-level page-table array: one top node for the initial process.
    let pgt_tbl_addr = alloc.take(Captbl::bytes_for(4), KMEM_SLOT_SIZE)?;
    let pgt_tbl = unsafe { &*Captbl::init_at(pgt_tbl_addr, 4)? };
    unsafe {
        cap_ops::publish_root(root, BOOT_TBL_PGTBL, pgt_tbl, CapFlags::all(), epoch)?;
    }

    let top_addr = alloc.take(
        Pgtbl::bytes_for(info.top_num_order),
        platform.node_align(),
    )?;
    let top = unsafe {
        &*Pgtbl::init_at(
            top_addr,
            0,
            info.top_size_order,
            info.top_num_order,
            true,
            k.next_asid(),
        )?
    };
    unsafe {
        cap_ops::publish_root(pgt_tbl, 0, top, CapFlags::all(), epoch)?;
    }

    // The initial process binds the root captbl and the top pgtbl.
    let proc_addr = alloc.take(Process::bytes(), KMEM_SLOT_SIZE)?;
    let init_proc = unsafe { &*Process::init_at(proc_addr, root, top)? };
    unsafe {
        cap_ops::publish_root(root, BOOT_INIT_PROC, init_proc, CapFlags::all(), epoch)?;
    }

    // Kernel-function capability.
    let kfn_addr = alloc.take(KernFunc::bytes(), KMEM_SLOT_SIZE)?;
    let kfn = unsafe { &*KernFunc::init_at(kfn_addr) };
    unsafe {
        cap_ops::publish_root(root, BOOT_KFN, kfn, CapFlags::all(), epoch)?;
    }

    // Per-core timer and default-interrupt signal endpoints.
    let timer_tbl_addr = alloc.take(Captbl::bytes_for(ncpu), KMEM_SLOT_SIZE)?;
    let timer_tbl = unsafe { &*Captbl::init_at(timer_tbl_addr, ncpu)? };
    unsafe {
        cap_ops::publish_root(root, BOOT_TBL_TIMER, timer_tbl, CapFlags::all(), epoch)?;
    }
    let int_tbl_addr = alloc.take(Captbl::bytes_for(ncpu), KMEM_SLOT_SIZE)?;
    let int_tbl = unsafe { &*Captbl::init_at(int_tbl_addr, ncpu)? };
    unsafe {
        cap_ops::publish_root(root, BOOT_TBL_INT, int_tbl, CapFlags::all(), epoch)?;
    }

    for cpu_id in 0..ncpu {
        let tick_addr = alloc.take(SigEndpoint::bytes(), KMEM_SLOT_SIZE)?;
        let tick_sig = unsafe { &*SigEndpoint::init_at(tick_addr) };
        unsafe {
            cap_ops::publish_root(
                timer_tbl,
                cpu_id,
                tick_sig,
                CapFlags::SIG_SND | CapFlags::SIG_RCV,
                epoch,
            )?;
        }
        k.cpu(cpu_id).set_tick_sig(tick_addr);

        let vect_addr = alloc.take(SigEndpoint::bytes(), KMEM_SLOT_SIZE)?;
        let vect_sig = unsafe { &*SigEndpoint::init_at(vect_addr) };
        unsafe {
            cap_ops::publish_root(
                int_tbl,
                cpu_id,
                vect_sig,
                CapFlags::SIG_SND | CapFlags::SIG_RCV,
                epoch,
            )?;
        }
        k.cpu(cpu_id).set_vect_sig(vect_addr);
    }

    // Per-core initial threads, bound at the highest priority.
    let thd_tbl_addr = alloc.take(Captbl::bytes_for(ncpu), KMEM_SLOT_SIZE)?;
    let thd_tbl = unsafe { &*Captbl::init_at(thd_tbl_addr, ncpu)? };
    unsafe {
        cap_ops::publish_root(root, BOOT_TBL_THD, thd_tbl, CapFlags::all(), epoch)?;
    }

    let boot_prio = (config::MAX_PRIO - 1) as u32;
    for cpu_id in 0..ncpu {
        let thd_addr = alloc.take(Thread::bytes(), KMEM_SLOT_SIZE)?;
        let thd =
            unsafe { &*Thread::init_at(thd_addr, k.next_tid(), init_proc, boot_prio)? };
        unsafe {
            cap_ops::publish_root(thd_tbl, cpu_id, thd, CapFlags::all(), epoch)?;
        }

        let tick_sig = k.cpu(cpu_id).tick_sig();
        sched::bind(k, thd, cpu_id, boot_prio, tick_sig)?;
        unsafe { &*(tick_sig as *const SigEndpoint) }.pin();
        thd.budget_add(BOOT_BUDGET);
        let frame = unsafe { thd.frame_mut() };
        frame.set_ip(info.user_entry);
        frame.set_sp(info.user_stack);
        frame.set_arg(0);
        sched::resume(k, thd)?;
    }

    // Kernel-memory capability over everything boot did not consume.
    let kmem_tbl_addr = alloc.take(Captbl::bytes_for(1), KMEM_SLOT_SIZE)?;
    let kmem_tbl = unsafe { &*Captbl::init_at(kmem_tbl_addr, 1)? };
    unsafe {
        cap_ops::publish_root(root, BOOT_TBL_KMEM, kmem_tbl, CapFlags::all(), epoch)?;
    }
    let kmem_obj_addr = alloc.take(core::mem::size_of::<Kmem>(), KMEM_SLOT_SIZE)?;
    let free_base = (alloc.next + KMEM_SLOT_SIZE - 1) & !(KMEM_SLOT_SIZE - 1);
    let free_end = info.kmem_base + info.kmem_size;
    if free_base >= free_end {
        return Err(KernErr::KmemRange);
    }
    let grant = Kmem::new(
        free_base,
        free_end - free_base,
        CapFlags::KMEM_CAPTBL
            | CapFlags::KMEM_PGTBL
            | CapFlags::KMEM_PROC
            | CapFlags::KMEM_THD
            | CapFlags::KMEM_SIG
            | CapFlags::KMEM_INV,
    )?;
    unsafe {
        (kmem_obj_addr as *mut Kmem).write(grant);
        cap_ops::publish_root(
            kmem_tbl,
            0,
            kmem_obj_addr as *const Kmem,
            CapFlags::all(),
            epoch,
        )?;
    }

    crate::kinfo!(
        "boot: {} slots used, {:#x}..{:#x} delegated",
        BOOT_CAPTBL_SLOTS,
        free_base,
        free_end
    );

    // Release the secondaries, then drop core 0 into user mode.
    RELEASED.call_once(|| ());
    platform.timer_program(TICK_INTERVAL);
    start_core(k, 0, info.user_entry, info.user_stack)?;
    Ok(root)
}

/// Secondary-CPU entry: wait for the boot CPU to finish construction,
/// then run this core's initial thread.
pub fn secondary_entry(
    k: &'static Kernel,
    cpu_id: usize,
    info: &BootInfo,
) -> Result<()> {
    while RELEASED.get().is_none() {
        core::hint::spin_loop();
    }
    config::platform().timer_program(TICK_INTERVAL);
    start_core(k, cpu_id, info.user_entry, info.user_stack)
}

/// Make the core's initial thread current and enter user mode.
fn start_core(k: &Kernel, cpu_id: usize, entry: Word, stack: Word) -> Result<()> {
    let thd = boot_thread(k, cpu_id)?;
    thd.set_state(ThdState::Running);
    k.cpu(cpu_id)
        .set_current(thd as *const _ as *mut Thread);
    let platform = config::platform();
    let pgtbl = thd.process().pgtbl();
    platform.load_page_table(pgtbl as *const _ as Word, pgtbl.asid() as Word);
    platform.enter_user_mode(entry, stack, 0);
    Ok(())
}

fn boot_thread(k: &Kernel, cpu_id: usize) -> Result<&'static Thread> {
    // Walk the per-CPU current pointer set up by kmain's bind loop; at
    // boot the thread has not run yet, so find it through the run queue.
    let cpu = k.cpu(cpu_id);
    if let Some(cur) = cpu.current() {
        return Ok(unsafe { &*(cur as *const Thread) });
    }
    let next = cpu.run.lock().pop_highest().ok_or(KernErr::ThdBad)?;
    Ok(unsafe { &*next })
}
