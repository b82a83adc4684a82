//! Shadow entries and the shadow registry.
//!
//! Every page a processing element writes is *shadowed*: the first store
//! faults, the interposer allocates an order-1 block of two frames, seeds
//! both with the current page content, and repoints the faulting mapping
//! at the first shadow. The original frame stays frozen until commit, so
//! outside observers only ever see pre-element or post-element content.
//!
//! The registry keeps entries in an index-based arena and threads them on
//! three queues:
//!
//! - the **live** queue — pages being double-buffered by the element in
//!   flight;
//! - the **parked** queue — entries carried over from the previous
//!   element of the same thread (frequently-written pages stay shadowed
//!   so they don't re-fault every element);
//! - the **vm-stack** queue — guest kernel stack pages of a vCPU, which
//!   are compared with slack (see the vm-stack module).
//!
//! Aliasing: two mappings of the same physical frame share one shadow
//! pair and cite each other as *twins*. Twins are weak references — the
//! arena owns both entries, exactly one of them owns the frame pair, and
//! the pair is destroyed or committed together.

use crate::addr::{PhysAddr, VirtAddr, PAGE_SIZE, WORD_SIZE};
use crate::attr::PageAttr;
use crate::frame::FrameAllocator;
use crate::paging::{AddressSpace, MappingRef, PageKind, Space};
use crate::regs::{FaultSnapshot, RegisterFile};
use crate::stats::{PeCounters, TraceEntry, TraceRing};
use log::trace;
use std::collections::VecDeque;
use thiserror::Error;

/// Handle of a shadow entry in the registry arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct ShadowId(pub(crate) usize);

/// Errors raised while interposing on a write fault.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShadowError {
    /// The allocator could not provide a shadow pair. Fatal to the
    /// current element; the thread is killed.
    #[error("no shadow frames left for page {virt}")]
    OutOfFrames { virt: VirtAddr },
    /// Copy-on-write on a 2 MiB mapping; the compare and commit paths
    /// assume 4 KiB throughout.
    #[error("copy-on-write on big page {virt} is not supported")]
    BigPageUnsupported { virt: VirtAddr },
}

/// Arguments of a resolved copy-on-write fault.
#[derive(Clone, Copy, Debug)]
pub struct CowFault {
    /// The page-table entry that faulted.
    pub origin: MappingRef,
    /// Faulting virtual address (not necessarily page-aligned).
    pub virt: VirtAddr,
    /// Physical frame the entry maps.
    pub phys: PhysAddr,
    /// Attributes of the faulting entry (write-stripped, COW set).
    pub attr: PageAttr,
    /// Mapping granularity.
    pub kind: PageKind,
    /// First opcode byte at the faulting RIP, for diagnostics.
    pub opcode: u8,
}

/// Per-modified-page record: the original frame plus two shadow frames.
#[derive(Debug)]
pub struct ShadowEntry {
    /// Virtual page being shadowed.
    pub page_addr: VirtAddr,
    /// The original frame, still referenced by other mappings.
    pub old_phys: PhysAddr,
    /// First-run and second-run shadow frames; one contiguous order-1
    /// block, so both derive from `shadow[0]`.
    pub shadow: [PhysAddr; 2],
    /// Attributes of the mapping as it stood before the fault
    /// (COW set, WRITE clear). Restored verbatim at commit.
    pub attr: PageAttr,
    pub kind: PageKind,
    /// The one page-table entry this record interposed on.
    pub origin: MappingRef,
    /// CRC32 of the committed content, maintained across elements.
    pub crc: u32,
    /// CRC32 of the post-run shadow; present only between compare and
    /// commit.
    pub crc1: Option<u32>,
    /// Aliased entry mapping the same `old_phys`, if any.
    pub twin: Option<ShadowId>,
    /// Registers of the faulting thread at interposition time.
    pub snapshot: FaultSnapshot,
    /// Whether this entry allocated (and must free) the shadow pair.
    owns_frames: bool,
}

/// The per-thread shadow registry.
pub struct ShadowRegistry {
    slots: Vec<Option<ShadowEntry>>,
    free: Vec<ShadowId>,
    live: VecDeque<ShadowId>,
    parked: VecDeque<ShadowId>,
    pub(crate) vm_stack: VecDeque<ShadowId>,
    /// Live entries migrated from the parked queue this element.
    carried: usize,
    /// Force carried entries to stay shadowed through commit even when
    /// unchanged. Set by the embedder, cleared when commit finishes.
    pub keep_cow: bool,
}

impl ShadowRegistry {
    pub fn new() -> Self {
        ShadowRegistry {
            slots: Vec::new(),
            free: Vec::new(),
            live: VecDeque::new(),
            parked: VecDeque::new(),
            vm_stack: VecDeque::new(),
            carried: 0,
            keep_cow: false,
        }
    }

    // ─── Arena plumbing ──────────────────────────────────────────────

    fn insert(&mut self, entry: ShadowEntry) -> ShadowId {
        if let Some(id) = self.free.pop() {
            self.slots[id.0] = Some(entry);
            id
        } else {
            self.slots.push(Some(entry));
            ShadowId(self.slots.len() - 1)
        }
    }

    /// Borrow an entry. Panics on a dead id (registry bug).
    pub fn entry(&self, id: ShadowId) -> &ShadowEntry {
        self.slots[id.0].as_ref().expect("dead shadow id")
    }

    pub(crate) fn entry_mut(&mut self, id: ShadowId) -> &mut ShadowEntry {
        self.slots[id.0].as_mut().expect("dead shadow id")
    }

    fn remove_id(queue: &mut VecDeque<ShadowId>, id: ShadowId) -> bool {
        if let Some(pos) = queue.iter().position(|&x| x == id) {
            queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Tear an entry out of the arena, freeing the shadow pair if this
    /// side owns it. A surviving twin inherits ownership of the pair.
    pub(crate) fn destroy(&mut self, id: ShadowId, frames: &mut FrameAllocator) {
        let e = self.slots[id.0].take().expect("destroy of dead shadow id");
        match e.twin {
            Some(t) if self.slots.get(t.0).is_some_and(|s| s.is_some()) => {
                let te = self.entry_mut(t);
                te.twin = None;
                if e.owns_frames {
                    te.owns_frames = true;
                }
            }
            _ => {
                if e.owns_frames {
                    frames.free_pair(e.shadow[0]);
                }
            }
        }
        self.free.push(id);
    }

    // ─── Queue views ─────────────────────────────────────────────────

    #[inline]
    pub fn live_is_empty(&self) -> bool {
        self.live.is_empty()
    }

    #[inline]
    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    #[inline]
    pub fn vm_stack_len(&self) -> usize {
        self.vm_stack.len()
    }

    /// Live entries that came from the previous element.
    #[inline]
    pub fn carried(&self) -> usize {
        self.carried
    }

    pub(crate) fn live_ids(&self) -> Vec<ShadowId> {
        self.live.iter().copied().collect()
    }

    pub(crate) fn live_pop_front(&mut self) -> Option<ShadowId> {
        self.live.pop_front()
    }

    pub(crate) fn live_position(&self, id: ShadowId) -> Option<usize> {
        self.live.iter().position(|&x| x == id)
    }

    pub(crate) fn live_remove(&mut self, id: ShadowId) -> bool {
        Self::remove_id(&mut self.live, id)
    }

    pub(crate) fn parked_push(&mut self, id: ShadowId) {
        self.parked.push_back(id);
    }

    pub(crate) fn set_carried(&mut self, n: usize) {
        self.carried = n;
    }

    pub(crate) fn carried_dec(&mut self) {
        self.carried -= 1;
    }

    /// The nth live entry, if any. Fault-injection harnesses use this to
    /// pick a target page.
    pub fn live_nth(&self, n: usize) -> Option<ShadowId> {
        self.live.get(n).copied()
    }

    /// Whether a page parked from the previous element covers `virt`.
    /// A write there would have been re-shadowed by the parked-set
    /// migration rather than by a fresh fault.
    pub fn would_have_been_cowed(&self, virt: VirtAddr) -> bool {
        let page = virt.page_base();
        self.parked
            .iter()
            .any(|&id| self.entry(id).page_addr == page)
    }

    /// Find the live entry shadowing physical frame `phys`.
    ///
    /// Panics if the entry found already has a twin: a third mapping of
    /// the same frame would break the pairwise twin invariant, which is
    /// a registry bug, not an input error.
    pub fn find_live_by_phys(&self, phys: PhysAddr) -> Option<ShadowId> {
        let phys = phys.page_base();
        for &id in &self.live {
            let e = self.entry(id);
            if e.old_phys == phys {
                assert!(
                    e.twin.is_none(),
                    "third alias of frame {phys}: twin invariant violated"
                );
                return Some(id);
            }
        }
        None
    }

    // ─── Fault interposition ─────────────────────────────────────────

    /// Handle a write fault on a COW-protected page.
    ///
    /// Creates a shadow entry for the page, seeds the shadow pair (or
    /// shares an existing pair when the frame is already shadowed under
    /// another virtual address), and repoints the faulting mapping at
    /// the first shadow with WRITE granted and COW cleared — the only
    /// place this subsystem elevates a permission.
    pub fn resolve_cow_fault(
        &mut self,
        frames: &mut FrameAllocator,
        aspace: &mut AddressSpace,
        regs: &RegisterFile,
        fault: CowFault,
        counters: &mut PeCounters,
    ) -> Result<ShadowId, ShadowError> {
        counters.cow_faults += 1;
        let virt = fault.virt.page_base();
        let phys = fault.phys.page_base();
        if fault.kind == PageKind::Big {
            return Err(ShadowError::BigPageUnsupported { virt });
        }

        let snapshot = capture_fault_snapshot(regs, aspace, frames, fault);

        // A frame already shadowed under another virtual address must
        // share its pair, so stores through either mapping land in the
        // same two buffers. The decision is by physical equality only.
        let id = if let Some(alias) = self.find_live_by_phys(phys) {
            let (shadow, crc) = {
                let a = self.entry(alias);
                (a.shadow, a.crc)
            };
            let id = self.insert(ShadowEntry {
                page_addr: virt,
                old_phys: phys,
                shadow,
                attr: fault.attr,
                kind: fault.kind,
                origin: fault.origin,
                crc,
                crc1: None,
                twin: Some(alias),
                snapshot,
                owns_frames: false,
            });
            self.entry_mut(alias).twin = Some(id);
            id
        } else {
            let base = frames
                .alloc_pair()
                .map_err(|_| ShadowError::OutOfFrames { virt })?;
            let pair = [base, base.add(PAGE_SIZE as u64)];
            frames.copy_page(pair[0], phys);
            frames.copy_page(pair[1], phys);
            let crc = frames.crc(phys);
            self.insert(ShadowEntry {
                page_addr: virt,
                old_phys: phys,
                shadow: pair,
                attr: fault.attr,
                kind: fault.kind,
                origin: fault.origin,
                crc,
                crc1: None,
                twin: None,
                snapshot,
                owns_frames: true,
            })
        };

        let shadow0 = self.entry(id).shadow[0];
        aspace
            .cow_update(fault.origin, shadow0, fault.attr.run())
            .expect("faulting entry vanished during interposition");
        self.live.push_back(id);
        trace!(
            "cow fault v {} phys {} shadows {}/{}",
            virt,
            phys,
            shadow0,
            self.entry(id).shadow[1],
        );
        Ok(id)
    }

    // ─── Run transitions ─────────────────────────────────────────────

    /// Repoint every live mapping at the second shadow, so the second
    /// run writes into its own buffer. Called when the first run ends.
    pub fn restore_state0(&self, aspace: &mut AddressSpace) {
        for &id in &self.live {
            let e = self.entry(id);
            aspace
                .cow_update(e.origin, e.shadow[1], e.attr.run())
                .expect("live mapping vanished");
        }
    }

    /// Repoint every live mapping back at the first shadow. Used when
    /// the first run must be stepped further to catch up the second.
    pub fn restore_state1(&self, aspace: &mut AddressSpace) {
        for &id in &self.live {
            let e = self.entry(id);
            aspace
                .cow_update(e.origin, e.shadow[0], e.attr.run())
                .expect("live mapping vanished");
        }
    }

    /// Reseed both shadows of every live entry from the original frame
    /// and point the mappings at the first shadow, ready for a full
    /// re-execution. Idempotent.
    pub fn rollback(&self, frames: &mut FrameAllocator, aspace: &mut AddressSpace) {
        for &id in &self.live {
            let e = self.entry(id);
            frames.copy_page(e.shadow[0], e.old_phys);
            frames.copy_page(e.shadow[1], e.old_phys);
            aspace
                .cow_update(e.origin, e.shadow[0], e.attr.run())
                .expect("live mapping vanished");
        }
    }

    /// Abort the element: restore every live mapping to the original
    /// frame with its original attributes and destroy the live entries.
    /// No partial commit is possible.
    pub fn cancel(&mut self, frames: &mut FrameAllocator, aspace: &mut AddressSpace) {
        while let Some(id) = self.live.pop_front() {
            let (origin, old_phys, attr) = {
                let e = self.entry(id);
                (e.origin, e.old_phys, e.attr)
            };
            // The mapping may already be gone when the kernel tore the
            // space down; ignore.
            let _ = aspace.cow_update(origin, old_phys, attr);
            self.destroy(id, frames);
        }
        self.carried = 0;
    }

    /// Release every entry the registry still holds (thread teardown).
    pub fn release_all(&mut self, frames: &mut FrameAllocator, aspace: &mut AddressSpace) {
        self.cancel(frames, aspace);
        while let Some(id) = self.parked.pop_front() {
            self.destroy(id, frames);
        }
        while let Some(id) = self.vm_stack.pop_front() {
            let (origin, old_phys, attr) = {
                let e = self.entry(id);
                (e.origin, e.old_phys, e.attr)
            };
            let _ = aspace.cow_update(origin, old_phys, attr.shadowed());
            self.destroy(id, frames);
        }
    }

    // ─── Element boundary: parked-set migration ──────────────────────

    /// Move the entries parked by the previous element back into the
    /// live set at the start of a new element.
    ///
    /// Each entry's backing mapping is re-checked: if the kernel
    /// unmapped or remapped the page out-of-band the entry (and its
    /// twin) is silently destroyed. Content changed out-of-band reseeds
    /// the shadows and refreshes the checksum. Surviving entries are
    /// repointed at the first shadow with WRITE granted.
    pub fn place_phys0(
        &mut self,
        frames: &mut FrameAllocator,
        aspace: &mut AddressSpace,
        ring: &mut TraceRing,
        pe: u64,
    ) {
        assert!(self.live.is_empty(), "live set must drain before migration");
        self.carried = 0;
        while let Some(id) = self.parked.pop_front() {
            let (origin, old_phys, attr, shadow, twin) = {
                let e = self.entry(id);
                (e.origin, e.old_phys, e.attr, e.shadow, e.twin)
            };
            let stale = match aspace.lookup_ref(origin) {
                None => true,
                Some(m) => m.phys != old_phys || m.attr != attr,
            };
            if stale {
                trace!("parked entry for {} is stale, dropping", origin.virt());
                if let Some(t) = twin {
                    if Self::remove_id(&mut self.parked, t) {
                        self.destroy(t, frames);
                    }
                }
                self.destroy(id, frames);
                continue;
            }
            let crc0 = frames.crc(old_phys);
            if crc0 != self.entry(id).crc {
                frames.copy_page(shadow[0], old_phys);
                frames.copy_page(shadow[1], old_phys);
                self.entry_mut(id).crc = crc0;
            }
            aspace
                .cow_update(origin, shadow[0], attr.run())
                .expect("mapping verified above");
            self.live.push_back(id);
            self.carried += 1;
            let mut twin_page = None;
            if let Some(t) = twin {
                if Self::remove_id(&mut self.parked, t) {
                    let (t_origin, t_attr, t_page) = {
                        let te = self.entry(t);
                        (te.origin, te.attr, te.page_addr)
                    };
                    aspace
                        .cow_update(t_origin, shadow[0], t_attr.run())
                        .expect("twin mapping vanished");
                    self.live.push_back(t);
                    self.carried += 1;
                    twin_page = Some(t_page);
                }
            }
            ring.push(TraceEntry {
                pe,
                note: "placed",
                page: self.entry(id).page_addr,
                old_phys,
                shadow0: shadow[0],
                shadow1: shadow[1],
                twin_page,
            });
        }
        self.place_vm_stack(frames, aspace);
    }
}

impl Default for ShadowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture the faulting thread's registers, reading the word at guest
/// RSP+0x10 through the vTLB when the fault originates from a vCPU.
fn capture_fault_snapshot(
    regs: &RegisterFile,
    aspace: &AddressSpace,
    frames: &FrameAllocator,
    fault: CowFault,
) -> FaultSnapshot {
    let stack_word = if fault.origin.space() == Space::Guest {
        let slot = VirtAddr(regs.rsp.wrapping_add(0x10));
        aspace
            .guest
            .lookup(slot)
            .map(|m| frames.read_word(m.phys, slot.offset() / WORD_SIZE))
            .unwrap_or(0)
    } else {
        0
    };
    FaultSnapshot {
        rip: regs.rip,
        rcx: regs.rcx,
        rsp: regs.rsp,
        stack_word,
        opcode: fault.opcode,
    }
}
