//! The compare and commit protocol.
//!
//! Compare decides whether the two runs of a processing element produced
//! the same memory image; commit writes the agreed image back to the
//! original frames and restores the copy-on-write protections. Commit
//! is the single linearization point of an element: until it runs,
//! outside observers only see pre-element content.

use crate::addr::PhysAddr;
use crate::frame::FrameAllocator;
use crate::paging::AddressSpace;
use crate::report::{MismatchReport, ReportCtx};
use crate::shadow::ShadowRegistry;
use crate::stats::PeCounters;
use log::trace;

/// Upper bound on the number of words the vm-stack heuristic may patch
/// to reconcile a vCPU page. Guest interrupt jitter touches a handful of
/// stack words; anything larger is treated as a genuine divergence.
pub const VM_STACK_PATCH_LIMIT: usize = 8;

/// Patch divergent words of `dst` from `src`, at most `limit` of them.
/// Returns the common CRC once the pages agree, `None` if the divergence
/// is wider than `limit` words.
pub(crate) fn patch_words(
    frames: &mut FrameAllocator,
    dst: PhysAddr,
    src: PhysAddr,
    limit: usize,
) -> Option<u32> {
    let mut patched = 0;
    loop {
        match frames.first_mismatch(dst, src) {
            None => return Some(frames.crc(dst)),
            Some(index) if patched < limit => {
                let w = frames.read_word(src, index);
                frames.write_word(dst, index, w);
                patched += 1;
            }
            Some(_) => return None,
        }
    }
}

impl ShadowRegistry {
    /// Compare both shadows of every live entry.
    ///
    /// Matching entries record their post-run checksum for commit. A
    /// divergent entry of a vCPU gets the vm-stack reconciliation
    /// attempt first (guest interrupts land on the kernel stack at
    /// slightly different points across runs); a reconciled entry is
    /// committed through the vm-stack fast path and the walk continues.
    /// Anything else is a real divergence: the report is assembled and
    /// returned.
    pub fn compare(
        &mut self,
        frames: &mut FrameAllocator,
        aspace: &mut AddressSpace,
        is_vcpu: bool,
        ctx: &ReportCtx,
    ) -> Option<MismatchReport> {
        if is_vcpu {
            if let Some(report) = self.compare_vm_stack(frames, ctx) {
                return Some(report);
            }
        }
        for id in self.live_ids() {
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
            if is_vcpu {
                if let Some(crc) = patch_words(frames, s0, s1, VM_STACK_PATCH_LIMIT) {
                    self.commit_vm_stack_ce(id, crc, frames, aspace);
                    continue;
                }
            }
            let index = frames
                .first_mismatch(s0, s1)
                .expect("checksums differ but pages compare equal");
            let report = self.build_mismatch_report(frames, id, index, ctx, false);
            for lid in self.live_ids() {
                let le = self.entry(lid);
                trace!(
                    "cow v {} phys {} shadows {}/{}",
                    le.page_addr,
                    le.old_phys,
                    le.shadow[0],
                    le.shadow[1],
                );
            }
            return Some(report);
        }
        None
    }

    /// Write the agreed post-state back and drain the live set.
    ///
    /// Must only run after [`compare`](Self::compare) found agreement.
    /// Entries carried from the previous element that were not touched
    /// again are destroyed (their page has been stable for two
    /// elements), unless `keep_cow` pins them; everything else re-parks
    /// for the next element. All mappings return to the original frame
    /// with the original attributes — COW set, WRITE clear.
    pub fn commit(
        &mut self,
        frames: &mut FrameAllocator,
        aspace: &mut AddressSpace,
        is_vcpu: bool,
        counters: &mut PeCounters,
    ) {
        if is_vcpu {
            self.commit_vm_stack(frames, aspace);
        }
        debug_assert_eq!(self.parked_len(), 0, "parked set not empty at commit");

        let carried = self.carried();
        let keep_cow = self.keep_cow;
        let mut count = 0usize;
        while let Some(id) = self.live_pop_front() {
            let (old_phys, shadow0, crc, crc1, twin, origin, attr) = {
                let e = self.entry(id);
                (e.old_phys, e.shadow[0], e.crc, e.crc1, e.twin, e.origin, e.attr)
            };
            let changed = crc1 != Some(crc);
            if changed {
                frames.copy_page(old_phys, shadow0);
                if let Some(c) = crc1 {
                    self.entry_mut(id).crc = c;
                }
            }
            self.entry_mut(id).crc1 = None;
            let keep = keep_cow || changed;

            let mut destroy_pair = false;
            let mut destroy_single = false;
            if count < carried {
                if let Some(t) = twin {
                    if let Some(pos) = self.live_position(t) {
                        if pos + count < carried {
                            count += 1;
                            if keep {
                                counters.reused_carried += 1;
                            }
                        }
                        self.live_remove(t);
                    }
                    let (t_origin, t_attr) = {
                        let te = self.entry(t);
                        (te.origin, te.attr)
                    };
                    aspace
                        .cow_update(t_origin, old_phys, t_attr)
                        .expect("twin mapping vanished at commit");
                    if keep {
                        counters.reused_carried += 1;
                        self.entry_mut(t).crc1 = None;
                        self.parked_push(id);
                        self.parked_push(t);
                    } else {
                        destroy_pair = true;
                    }
                } else if keep {
                    counters.reused_carried += 1;
                    self.parked_push(id);
                } else {
                    destroy_single = true;
                }
            } else {
                // Born this element: survives at least one more.
                self.parked_push(id);
                if let Some(t) = twin {
                    self.live_remove(t);
                    let (t_origin, t_attr) = {
                        let te = self.entry(t);
                        (te.origin, te.attr)
                    };
                    aspace
                        .cow_update(t_origin, old_phys, t_attr)
                        .expect("twin mapping vanished at commit");
                    self.entry_mut(t).crc1 = None;
                    self.parked_push(t);
                }
            }

            aspace
                .cow_update(origin, old_phys, attr)
                .expect("mapping vanished at commit");
            if destroy_pair {
                let t = twin.expect("pair destruction without twin");
                self.destroy(id, frames);
                self.destroy(t, frames);
            } else if destroy_single {
                self.destroy(id, frames);
            }
            count += 1;
        }
        trace!("commit drained, {} entries had been carried", carried);
        self.set_carried(0);
        self.keep_cow = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::VirtAddr;
    use crate::attr::PageAttr;
    use crate::paging::{MappingRef, PageKind};
    use crate::regs::RegisterFile;
    use crate::shadow::CowFault;
    use crate::stats::TraceRing;

    struct Rig {
        frames: FrameAllocator,
        aspace: AddressSpace,
        reg: ShadowRegistry,
        counters: PeCounters,
    }

    impl Rig {
        fn new() -> Self {
            Rig {
                frames: FrameAllocator::new(64),
                aspace: AddressSpace::new(),
                reg: ShadowRegistry::new(),
                counters: PeCounters::default(),
            }
        }

        fn fault(&mut self, virt: VirtAddr) -> PhysAddr {
            let phys = self.frames.alloc_page().unwrap();
            let attr = PageAttr::user_data().shadowed();
            self.aspace.host.map(virt, phys, attr, PageKind::Normal);
            let regs = RegisterFile::default();
            self.reg
                .resolve_cow_fault(
                    &mut self.frames,
                    &mut self.aspace,
                    &regs,
                    CowFault {
                        origin: MappingRef::Host(virt),
                        virt,
                        phys,
                        attr,
                        kind: PageKind::Normal,
                        opcode: 0x89,
                    },
                    &mut self.counters,
                )
                .unwrap();
            phys
        }

        fn compare(&mut self) -> Option<MismatchReport> {
            let ctx = ReportCtx::default();
            self.reg
                .compare(&mut self.frames, &mut self.aspace, false, &ctx)
        }

        fn commit(&mut self) {
            self.reg.commit(
                &mut self.frames,
                &mut self.aspace,
                false,
                &mut self.counters,
            );
        }
    }

    #[test]
    fn equal_shadows_compare_clean_and_commit() {
        let mut rig = Rig::new();
        let virt = VirtAddr(0x4000);
        let phys = rig.fault(virt);
        let sh = rig.reg.entry(rig.reg.live_nth(0).unwrap()).shadow;

        // Both runs wrote the same value.
        rig.frames.write_word(sh[0], 0, 0x1122_3344);
        rig.frames.write_word(sh[1], 0, 0x1122_3344);

        assert!(rig.compare().is_none());
        rig.commit();

        assert_eq!(rig.frames.read_word(phys, 0), 0x1122_3344);
        let m = rig.aspace.host.lookup(virt).unwrap();
        assert_eq!(m.phys, phys);
        assert!(m.attr.cow && !m.attr.writable, "protection restored");
        assert!(rig.reg.live_is_empty());
        assert_eq!(rig.reg.parked_len(), 1, "fresh entry re-parks");
    }

    #[test]
    fn committed_crc_matches_frame() {
        let mut rig = Rig::new();
        let virt = VirtAddr(0x4000);
        let phys = rig.fault(virt);
        let id = rig.reg.live_nth(0).unwrap();
        let sh = rig.reg.entry(id).shadow;
        rig.frames.write_word(sh[0], 5, 0xfeed);
        rig.frames.write_word(sh[1], 5, 0xfeed);
        assert!(rig.compare().is_none());
        rig.commit();
        assert_eq!(
            rig.reg.entry(id).crc,
            rig.frames.crc(phys),
            "entry crc must equal committed frame crc"
        );
        assert_eq!(rig.reg.entry(id).crc1, None, "crc1 dies at commit");
    }

    #[test]
    fn divergent_shadow_is_reported() {
        let mut rig = Rig::new();
        let virt = VirtAddr(0x4000);
        let _phys = rig.fault(virt);
        let sh = rig.reg.entry(rig.reg.live_nth(0).unwrap()).shadow;

        rig.frames.write_word(sh[0], 7, 0xAA);
        rig.frames.write_word(sh[1], 7, 0xBB);

        let report = rig.compare().expect("divergence must be detected");
        assert_eq!(report.word_index, 7);
        assert_eq!(report.val1, 0xAA);
        assert_eq!(report.val2, 0xBB);
        assert_eq!(report.val0, 0, "committed frame untouched");
        assert!(!report.vm_stack);
    }

    #[test]
    fn twin_pair_commits_both_writes_once() {
        let mut rig = Rig::new();
        let (v1, v2) = (VirtAddr(0x4000), VirtAddr(0x8000));
        let phys = rig.fault(v1);
        let attr = PageAttr::user_data().shadowed();
        rig.aspace.host.map(v2, phys, attr, PageKind::Normal);
        let regs = RegisterFile::default();
        rig.reg
            .resolve_cow_fault(
                &mut rig.frames,
                &mut rig.aspace,
                &regs,
                CowFault {
                    origin: MappingRef::Host(v2),
                    virt: v2,
                    phys,
                    attr,
                    kind: PageKind::Normal,
                    opcode: 0x89,
                },
                &mut rig.counters,
            )
            .unwrap();

        let sh = rig.reg.entry(rig.reg.live_nth(0).unwrap()).shadow;
        // Writes through both aliases, both runs agreeing.
        for s in sh {
            rig.frames.page_mut(s)[0] = 0xAA;
            rig.frames.page_mut(s)[1] = 0xBB;
        }

        assert!(rig.compare().is_none());
        rig.commit();

        assert_eq!(rig.frames.page(phys)[0], 0xAA);
        assert_eq!(rig.frames.page(phys)[1], 0xBB);
        for v in [v1, v2] {
            let m = rig.aspace.host.lookup(v).unwrap();
            assert_eq!(m.phys, phys);
            assert!(m.attr.cow);
        }
        assert_eq!(rig.reg.parked_len(), 2, "twins park together");
        assert!(rig.reg.live_is_empty());
    }

    #[test]
    fn unchanged_carried_entry_is_destroyed() {
        let mut rig = Rig::new();
        let virt = VirtAddr(0x4000);
        let phys = rig.fault(virt);
        let sh = rig.reg.entry(rig.reg.live_nth(0).unwrap()).shadow;
        rig.frames.write_word(sh[0], 0, 1);
        rig.frames.write_word(sh[1], 0, 1);
        assert!(rig.compare().is_none());
        rig.commit();
        assert_eq!(rig.reg.parked_len(), 1);

        // Next element: the page is never touched again.
        let mut ring = TraceRing::new(8);
        rig.reg
            .place_phys0(&mut rig.frames, &mut rig.aspace, &mut ring, 1);
        assert_eq!(rig.reg.carried(), 1);
        let frames_live = rig.frames.in_use();
        assert!(rig.compare().is_none());
        rig.commit();

        assert_eq!(rig.reg.parked_len(), 0, "stable page stops being shadowed");
        assert_eq!(
            rig.frames.in_use(),
            frames_live - 2,
            "shadow pair returned to the allocator"
        );
        let m = rig.aspace.host.lookup(virt).unwrap();
        assert_eq!(m.phys, phys);
        assert!(m.attr.cow);
    }

    #[test]
    fn keep_cow_pins_unchanged_carried_entries() {
        let mut rig = Rig::new();
        let virt = VirtAddr(0x4000);
        rig.fault(virt);
        let sh = rig.reg.entry(rig.reg.live_nth(0).unwrap()).shadow;
        rig.frames.write_word(sh[0], 0, 1);
        rig.frames.write_word(sh[1], 0, 1);
        assert!(rig.compare().is_none());
        rig.commit();

        let mut ring = TraceRing::new(8);
        rig.reg
            .place_phys0(&mut rig.frames, &mut rig.aspace, &mut ring, 1);
        rig.reg.keep_cow = true;
        assert!(rig.compare().is_none());
        rig.commit();

        assert_eq!(rig.reg.parked_len(), 1, "keep_cow retains the entry");
        assert!(!rig.reg.keep_cow, "flag clears at commit");
    }

    #[test]
    fn changed_carried_entry_reparks() {
        let mut rig = Rig::new();
        let virt = VirtAddr(0x4000);
        let phys = rig.fault(virt);
        let id = rig.reg.live_nth(0).unwrap();
        let sh = rig.reg.entry(id).shadow;
        rig.frames.write_word(sh[0], 0, 1);
        rig.frames.write_word(sh[1], 0, 1);
        assert!(rig.compare().is_none());
        rig.commit();

        let mut ring = TraceRing::new(8);
        rig.reg
            .place_phys0(&mut rig.frames, &mut rig.aspace, &mut ring, 1);
        // Touched again this element.
        rig.frames.write_word(sh[0], 3, 9);
        rig.frames.write_word(sh[1], 3, 9);
        assert!(rig.compare().is_none());
        rig.commit();
        assert_eq!(rig.reg.parked_len(), 1, "hot page stays shadowed");
        assert_eq!(rig.frames.read_word(phys, 3), 9);
        assert_eq!(rig.counters.reused_carried, 1);
    }

    #[test]
    fn patch_words_respects_limit() {
        let mut frames = FrameAllocator::new(4);
        let a = frames.alloc_page().unwrap();
        let b = frames.alloc_page().unwrap();
        for i in 0..3 {
            frames.write_word(b, i, 0x55);
        }
        assert!(patch_words(&mut frames, a, b, 2).is_none());
        assert!(patch_words(&mut frames, a, b, 1).is_some(), "one left");
        assert_eq!(frames.crc(a), frames.crc(b));
    }
}
