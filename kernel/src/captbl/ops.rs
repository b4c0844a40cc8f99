//! Capability-table operations
//!
//! Delegation, revocation and lookup over [`Captbl`]s. The operating
//! captbl is always resolved first (it is itself named by a capability);
//! slot positions within it are plain indices, matching the syscall ABI.

use super::{CapFlags, CapId, CapRef, CapSlot, CapType, Captbl, KernObj};
use crate::error::{KernErr, Result};
use crate::Word;

/// What `remove` hands back when a root capability goes away: the caller
/// owns reclaiming the object after one quiescence period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reclaim {
    pub ty: CapType,
    pub obj: Word,
}

impl Captbl {
    /// Resolve a capability id to a typed, counted object reference.
    ///
    /// Both addressing forms are accepted: a direct index into `self`,
    /// or a two-level id routed through a child captbl stored in `self`.
    pub fn lookup<T: KernObj>(&self, cid: CapId) -> Result<CapRef<'_, T>> {
        if !cid.is_two_level() {
            let slot = self.slot(cid.top())?;
            let (obj, flags) = slot.get_ref(T::TYPE)?;
            return Ok(CapRef::new(slot, None, obj, flags));
        }

        let via = self.slot(cid.top())?;
        let (tbl_obj, _) = via.get_ref(CapType::CapTable)?;
        let child = unsafe { &*(tbl_obj as *const Captbl) };
        let slot = match child.slot(cid.sub()) {
            Ok(s) => s,
            Err(e) => {
                via.put_ref();
                return Err(e);
            }
        };
        match slot.get_ref(T::TYPE) {
            Ok((obj, flags)) => Ok(CapRef::new(slot, Some(via), obj, flags)),
            Err(e) => {
                via.put_ref();
                Err(e)
            }
        }
    }
}

/// Derive a capability from `(src, src_idx)` into the empty slot
/// `(dst, dst_idx)`.
///
/// The new flags must be a subset of the source's. The derived slot
/// records the source's root, whose refcount tracks it until removed.
pub fn add(
    dst: &Captbl,
    dst_idx: usize,
    src: &Captbl,
    src_idx: usize,
    new_flags: CapFlags,
    epoch: u32,
) -> Result<()> {
    let src_slot = src.slot(src_idx)?;
    let (ty, obj, src_flags) = src_slot.get_ref_any()?;

    let result = (|| {
        if !src_flags.contains(new_flags) {
            return Err(KernErr::PermEscalate);
        }

        // Children chain to the original root, never to each other.
        let parent = src_slot.parent();
        let root: &CapSlot = if parent == 0 {
            src_slot
        } else {
            unsafe { &*(parent as *const CapSlot) }
        };

        let dst_slot = dst.slot(dst_idx)?;
        dst_slot.claim()?;

        // The root's refcount carries one unit per derived slot.
        if let Err(e) = root.retain_child() {
            dst_slot.abort_claim();
            return Err(e);
        }

        dst_slot.publish(ty, obj, new_flags, root as *const _ as Word, epoch);
        Ok(())
    })();

    src_slot.put_ref();
    result
}

/// Remove the capability at `(tbl, idx)`.
///
/// Fails with `Frozen` on frozen slots and `Busy` while derived children
/// or in-flight lookups hold references. Removing a root additionally
/// runs the per-type liveness check `free`; its error (for page tables,
/// `PgtblNotEmpty`) is surfaced unchanged. On success the returned
/// [`Reclaim`] must be freed after one quiescence period.
pub fn remove(
    tbl: &Captbl,
    idx: usize,
    free: impl FnOnce(CapType, Word) -> Result<()>,
) -> Result<Option<Reclaim>> {
    let slot = tbl.slot(idx)?;
    let ty = slot.cap_type();
    if ty == CapType::Empty {
        return Err(KernErr::CapNotExist);
    }
    let obj = slot.object();
    let parent = slot.parent();

    slot.kill(false)?;

    let reclaim = if parent == 0 {
        if let Err(e) = free(ty, obj) {
            slot.unkill(false);
            return Err(e);
        }
        Some(Reclaim { ty, obj })
    } else {
        // Give the derived slot's unit back to its root.
        unsafe { &*(parent as *const CapSlot) }.put_ref();
        None
    };

    slot.clear();
    Ok(reclaim)
}

/// Freeze the capability at `(tbl, idx)`, recording `epoch`.
pub fn freeze(tbl: &Captbl, idx: usize, epoch: u32) -> Result<()> {
    let slot = tbl.slot(idx)?;
    if slot.is_empty() {
        return Err(KernErr::CapNotExist);
    }
    slot.freeze(epoch)
}

/// Thaw the capability at `(tbl, idx)` once every CPU has passed one
/// quiescence period beyond the freeze epoch.
pub fn thaw(tbl: &Captbl, idx: usize, min_epoch: u32) -> Result<()> {
    let slot = tbl.slot(idx)?;
    if slot.is_empty() {
        return Err(KernErr::CapNotExist);
    }
    slot.thaw(min_epoch)
}

/// Publish a freshly created object as a root capability.
///
/// # Safety
/// `obj` must point at a fully initialized object of `T`'s kind whose
/// storage outlives the capability.
pub unsafe fn publish_root<T: KernObj>(
    tbl: &Captbl,
    idx: usize,
    obj: *const T,
    flags: CapFlags,
    epoch: u32,
) -> Result<()> {
    let slot = tbl.slot(idx)?;
    slot.claim()?;
    slot.publish(T::TYPE, obj as Word, flags, 0, epoch);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SigEndpoint;
    extern crate std;
    use std::boxed::Box;
    use std::vec;

    fn make_tbl(slots: usize) -> &'static Captbl {
        let bytes = Captbl::bytes_for(slots);
        let mem = Box::leak(vec![0u8; bytes + 64].into_boxed_slice());
        let addr = (mem.as_ptr() as usize + 63) & !63;
        unsafe { &*Captbl::init_at(addr, slots).unwrap() }
    }

    fn make_sig() -> &'static SigEndpoint {
        Box::leak(Box::new(SigEndpoint::new()))
    }

    #[test]
    fn derive_and_lookup() {
        let tbl = make_tbl(8);
        let sig = make_sig();
        unsafe {
            publish_root(tbl, 2, sig, CapFlags::SIG_SND | CapFlags::SIG_RCV, 0).unwrap();
        }

        add(tbl, 3, tbl, 2, CapFlags::SIG_SND, 0).unwrap();

        let r = tbl.lookup::<SigEndpoint>(CapId::new(3)).unwrap();
        assert_eq!(r.flags(), CapFlags::SIG_SND);
        assert_eq!(r.addr(), sig as *const _ as usize);
        drop(r);

        // Escalation is refused without touching the target slot.
        assert_eq!(
            add(tbl, 4, tbl, 3, CapFlags::SIG_SND | CapFlags::SIG_RCV, 0),
            Err(KernErr::PermEscalate)
        );
        assert!(tbl.slot(4).unwrap().is_empty());
    }

    #[test]
    fn occupied_destination_is_untouched() {
        let tbl = make_tbl(8);
        let sig = make_sig();
        unsafe {
            publish_root(tbl, 0, sig, CapFlags::SIG_SND, 0).unwrap();
        }
        add(tbl, 1, tbl, 0, CapFlags::SIG_SND, 0).unwrap();
        assert_eq!(add(tbl, 1, tbl, 0, CapFlags::SIG_SND, 0), Err(KernErr::CapExists));
        assert_eq!(tbl.lookup::<SigEndpoint>(CapId::new(1)).unwrap().flags(), CapFlags::SIG_SND);
    }

    #[test]
    fn remove_orders_children_before_root() {
        let tbl = make_tbl(8);
        let sig = make_sig();
        unsafe {
            publish_root(tbl, 0, sig, CapFlags::SIG_SND, 0).unwrap();
        }
        add(tbl, 1, tbl, 0, CapFlags::SIG_SND, 0).unwrap();

        // Root is pinned by its child.
        assert_eq!(remove(tbl, 0, |_, _| Ok(())), Err(KernErr::Busy));

        // Child removal releases the root.
        assert_eq!(remove(tbl, 1, |_, _| Ok(())).unwrap(), None);
        let r = remove(tbl, 0, |_, _| Ok(())).unwrap().unwrap();
        assert_eq!(r.ty, CapType::Signal);
        assert_eq!(r.obj, sig as *const _ as usize);
        assert!(tbl.slot(0).unwrap().is_empty());
    }

    #[test]
    fn pinned_object_blocks_root_removal() {
        let tbl = make_tbl(4);
        let sig = make_sig();
        unsafe {
            publish_root(tbl, 0, sig, CapFlags::SIG_SND, 0).unwrap();
        }
        assert_eq!(remove(tbl, 0, |_, _| Err(KernErr::Busy)), Err(KernErr::Busy));
        // The failed removal left the capability usable.
        assert!(tbl.lookup::<SigEndpoint>(CapId::new(0)).is_ok());
    }

    #[test]
    fn frozen_rejects_derivation_and_removal() {
        let tbl = make_tbl(8);
        let sig = make_sig();
        unsafe {
            publish_root(tbl, 2, sig, CapFlags::SIG_SND, 0).unwrap();
        }
        add(tbl, 3, tbl, 2, CapFlags::SIG_SND, 0).unwrap();

        freeze(tbl, 2, 0).unwrap();
        assert_eq!(add(tbl, 4, tbl, 2, CapFlags::SIG_SND, 0), Err(KernErr::Frozen));
        assert_eq!(remove(tbl, 2, |_, _| Ok(())), Err(KernErr::Frozen));

        // Derivation from the unfrozen child still works.
        add(tbl, 4, tbl, 3, CapFlags::SIG_SND, 0).unwrap();
    }

    #[test]
    fn two_level_resolution() {
        let root = make_tbl(8);
        let child = make_tbl(8);
        let sig = make_sig();
        unsafe {
            publish_root(root, 1, child, CapFlags::CPT_MOD, 0).unwrap();
            publish_root(child, 5, sig, CapFlags::SIG_SND, 0).unwrap();
        }

        let r = root.lookup::<SigEndpoint>(CapId::two_level(1, 5)).unwrap();
        assert_eq!(r.flags(), CapFlags::SIG_SND);
        drop(r);

        assert_eq!(
            root.lookup::<SigEndpoint>(CapId::two_level(1, 6)).unwrap_err(),
            KernErr::CapNotExist
        );
        // Dropped guards release both the leaf and the table slot.
        assert_eq!(root.slot(1).unwrap().refs(), 0);
        assert_eq!(child.slot(5).unwrap().refs(), 0);
    }
}
