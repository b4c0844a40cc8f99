//! Kernel-function capability
//!
//! The controlled escape hatch to architecture operations that do not
//! deserve their own object type: interrupt-controller manipulation,
//! IPIs, power transitions, the debug channel and the architecture
//! parameter query. One capability multiplexes them all; each
//! sub-operation has its own id and is gated by a permission bit, so the
//! groups can be delegated separately.

use crate::captbl::{CapFlags, CapType, KernObj};
use crate::config;
use crate::error::{KernErr, Result};
use crate::hal::Platform;
use crate::Word;

/// Sub-operation ids, stable across releases.
pub mod op {
    use crate::Word;

    pub const INT_ENABLE: Word = 0;
    pub const INT_DISABLE: Word = 1;
    pub const INT_ACK: Word = 2;
    pub const INT_PRIO: Word = 3;
    pub const SEND_IPI: Word = 4;
    /// Returns the architecture's minimum page order.
    pub const QUERY_PAGE_ORDER: Word = 5;
    /// Returns the architecture's maximum page-table depth.
    pub const QUERY_PGTBL_DEPTH: Word = 6;
    pub const PUT_CHAR: Word = 7;
    pub const HALT: Word = 8;
    pub const REBOOT: Word = 9;
}

/// The kernel-function object. Carries no state of its own; the
/// capability's permission mask is the whole point.
#[repr(C)]
pub struct KernFunc {
    _reserved: Word,
}

impl KernObj for KernFunc {
    const TYPE: CapType = CapType::KernelFunc;
}

impl KernFunc {
    /// Bytes needed for the object.
    pub fn bytes() -> usize {
        core::mem::size_of::<KernFunc>()
    }

    /// Build the object in raw kernel memory.
    ///
    /// # Safety
    /// `addr` must point at reserved, writable kernel memory of at least
    /// `bytes()` bytes.
    pub unsafe fn init_at(addr: Word) -> *mut KernFunc {
        let kfn = addr as *mut KernFunc;
        kfn.write(KernFunc { _reserved: 0 });
        kfn
    }
}

/// Permission bit guarding a sub-operation.
fn required_flag(sub_id: Word) -> Result<CapFlags> {
    Ok(match sub_id {
        op::INT_ENABLE | op::INT_DISABLE | op::INT_ACK | op::INT_PRIO | op::SEND_IPI => {
            CapFlags::KFN_INT
        }
        op::QUERY_PAGE_ORDER | op::QUERY_PGTBL_DEPTH => CapFlags::KFN_QUERY,
        op::PUT_CHAR => CapFlags::KFN_DEBUG,
        op::HALT | op::REBOOT => CapFlags::KFN_POWER,
        _ => return Err(KernErr::TypeBad),
    })
}

/// Fan a sub-operation out to the platform.
pub fn activate(flags: CapFlags, sub_id: Word, p1: Word, p2: Word) -> Result<Word> {
    let need = required_flag(sub_id)?;
    if !flags.contains(need) {
        return Err(KernErr::PermEscalate);
    }

    let platform = config::platform();
    match sub_id {
        op::INT_ENABLE => {
            platform.int_enable(p1);
            Ok(0)
        }
        op::INT_DISABLE => {
            platform.int_disable(p1);
            Ok(0)
        }
        op::INT_ACK => {
            platform.int_ack(p1);
            Ok(0)
        }
        op::INT_PRIO => {
            platform.int_prio(p1, p2);
            Ok(0)
        }
        op::SEND_IPI => {
            if p1 >= crate::config::MAX_CPUS {
                return Err(KernErr::ThdBad);
            }
            platform.send_ipi(p1, p2);
            Ok(0)
        }
        op::QUERY_PAGE_ORDER => Ok(platform.min_page_order()),
        op::QUERY_PGTBL_DEPTH => Ok(platform.max_depth()),
        op::PUT_CHAR => {
            platform.put_char(p1 as u8);
            Ok(0)
        }
        op::HALT => {
            platform.halt();
            Ok(0)
        }
        op::REBOOT => {
            platform.reboot();
            Ok(0)
        }
        _ => Err(KernErr::TypeBad),
    }
}
