//! The vm-stack auxiliary queue.
//!
//! A vCPU's guest kernel stack is written by the guest's own interrupt
//! entry path. Interrupts are delivered at slightly different
//! instruction boundaries across the two runs of an element, so stack
//! pages legitimately differ in a few words. Treating that as an upset
//! would roll back every element that takes a guest interrupt; instead,
//! stack pages that reconcile word-wise are migrated to a private
//! per-vCPU queue where they are double-buffered and committed with
//! slack, and the queue is trimmed to its most recent entry at every
//! commit.

use crate::compare::{patch_words, VM_STACK_PATCH_LIMIT};
use crate::frame::FrameAllocator;
use crate::paging::AddressSpace;
use crate::report::{MismatchReport, ReportCtx};
use crate::shadow::{ShadowId, ShadowRegistry};
use log::trace;

impl ShadowRegistry {
    fn vm_stack_ids(&self) -> Vec<ShadowId> {
        self.vm_stack.iter().copied().collect()
    }

    /// Repoint the queue at the second shadow for the second run.
    pub fn restore_vm_stack_state0(&self, aspace: &mut AddressSpace) {
        for &id in &self.vm_stack {
            let e = self.entry(id);
            aspace
                .cow_update(e.origin, e.shadow[1], e.attr)
                .expect("vm-stack mapping vanished");
        }
    }

    /// Repoint the queue back at the first shadow.
    pub fn restore_vm_stack_state1(&self, aspace: &mut AddressSpace) {
        for &id in &self.vm_stack {
            let e = self.entry(id);
            aspace
                .cow_update(e.origin, e.shadow[0], e.attr)
                .expect("vm-stack mapping vanished");
        }
    }

    /// Reseed the queue's shadows from the committed frames for a full
    /// re-execution.
    pub fn rollback_vm_stack(&self, frames: &mut FrameAllocator, aspace: &mut AddressSpace) {
        for &id in &self.vm_stack {
            let e = self.entry(id);
            frames.copy_page(e.shadow[0], e.old_phys);
            frames.copy_page(e.shadow[1], e.old_phys);
            aspace
                .cow_update(e.origin, e.shadow[0], e.attr)
                .expect("vm-stack mapping vanished");
        }
    }

    /// Whether any queued stack page has been written this element.
    pub fn is_kernel_vm_modified(&self, frames: &FrameAllocator) -> bool {
        self.vm_stack
            .iter()
            .any(|&id| frames.crc(self.entry(id).shadow[0]) != self.entry(id).crc)
    }

    /// Refresh the queue at element start: content changed out-of-band
    /// reseeds the shadows, and the mappings return to the first shadow.
    pub(crate) fn place_vm_stack(&mut self, frames: &mut FrameAllocator, aspace: &mut AddressSpace) {
        for id in self.vm_stack_ids() {
            let (origin, old_phys, attr, shadow) = {
                let e = self.entry(id);
                (e.origin, e.old_phys, e.attr, e.shadow)
            };
            let crc0 = frames.crc(old_phys);
            if crc0 != self.entry(id).crc {
                frames.copy_page(shadow[0], old_phys);
                frames.copy_page(shadow[1], old_phys);
                self.entry_mut(id).crc = crc0;
            }
            aspace
                .cow_update(origin, shadow[0], attr)
                .expect("vm-stack mapping vanished");
        }
    }

    /// Compare both shadows of every queued stack page, reconciling
    /// small word-wise jitter in place.
    pub(crate) fn compare_vm_stack(
        &mut self,
        frames: &mut FrameAllocator,
        ctx: &ReportCtx,
    ) -> Option<MismatchReport> {
        for id in self.vm_stack_ids() {
            let (s0, s1) = {
                let e = self.entry(id);
                (e.shadow[0], e.shadow[1])
            };
            let crc0 = frames.crc(s0);
            let crc1 = frames.crc(s1);
            if crc0 == crc1 {
                self.entry_mut(id).crc1 = Some(crc0);
                continue;
            }
            if let Some(crc) = patch_words(frames, s0, s1, VM_STACK_PATCH_LIMIT) {
                self.entry_mut(id).crc1 = Some(crc);
                continue;
            }
            let index = frames
                .first_mismatch(s0, s1)
                .expect("checksums differ but pages compare equal");
            return Some(self.build_mismatch_report(frames, id, index, ctx, true));
        }
        None
    }

    /// Commit the queue: write changed pages back, then trim the queue
    /// to its most recent entry. Trimmed pages return to copy-on-write
    /// protection and their shadows are freed.
    pub(crate) fn commit_vm_stack(&mut self, frames: &mut FrameAllocator, aspace: &mut AddressSpace) {
        for id in self.vm_stack_ids() {
            let (origin, old_phys, attr, shadow0, crc, crc1) = {
                let e = self.entry(id);
                (e.origin, e.old_phys, e.attr, e.shadow[0], e.crc, e.crc1)
            };
            if let Some(c) = crc1 {
                if c != crc {
                    frames.copy_page(old_phys, shadow0);
                    self.entry_mut(id).crc = c;
                }
            }
            self.entry_mut(id).crc1 = None;
            aspace
                .cow_update(origin, old_phys, attr)
                .expect("vm-stack mapping vanished");
        }
        if self.vm_stack.len() > 1 {
            let head = self.vm_stack.pop_front().expect("len checked");
            let (origin, old_phys, attr) = {
                let e = self.entry(head);
                (e.origin, e.old_phys, e.attr)
            };
            aspace
                .cow_update(origin, old_phys, attr.shadowed())
                .expect("vm-stack mapping vanished");
            self.destroy(head, frames);
            trace!("vm-stack trimmed to {} entries", self.vm_stack.len());
        }
    }

    /// Migrate a live entry whose divergence reconciled word-wise into
    /// the vm-stack queue.
    ///
    /// The entry's stored attributes are elevated to writable with COW
    /// cleared — queued stack pages stay writable between elements; they
    /// are re-protected only when trimmed out of the queue. Its content
    /// is committed immediately, and a twin migrates along with it.
    pub(crate) fn commit_vm_stack_ce(
        &mut self,
        id: ShadowId,
        crc: u32,
        frames: &mut FrameAllocator,
        aspace: &mut AddressSpace,
    ) {
        let pos = self.live_position(id);
        assert!(self.live_remove(id), "vm-stack migration of a non-live entry");
        if let Some(p) = pos {
            if p < self.carried() {
                self.carried_dec();
            }
        }

        let (old_phys, shadow0) = {
            let e = self.entry_mut(id);
            e.attr = e.attr.run();
            (e.old_phys, e.shadow[0])
        };
        let crc0 = frames.crc(old_phys);
        if crc0 != crc {
            frames.copy_page(old_phys, shadow0);
            self.entry_mut(id).crc = crc;
        }
        self.entry_mut(id).crc1 = Some(crc);
        let (origin, attr) = {
            let e = self.entry(id);
            (e.origin, e.attr)
        };
        aspace
            .cow_update(origin, old_phys, attr)
            .expect("mapping vanished during vm-stack migration");
        self.vm_stack.push_back(id);

        if let Some(t) = self.entry(id).twin {
            self.live_remove(t);
            let (t_origin, t_old, t_attr) = {
                let te = self.entry(t);
                (te.origin, te.old_phys, te.attr)
            };
            aspace
                .cow_update(t_origin, t_old, t_attr)
                .expect("twin mapping vanished during vm-stack migration");
            self.vm_stack.push_back(t);
        }
        trace!(
            "vm-stack adopted page {}, queue len {}",
            self.entry(id).page_addr,
            self.vm_stack.len()
        );
    }
}
