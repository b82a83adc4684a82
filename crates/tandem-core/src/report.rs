//! The mismatch report.
//!
//! When the two runs of a processing element disagree, the core emits a
//! single-line report carrying everything needed to triage the
//! divergence offline: the page, the word, the three values (committed,
//! first run, second run), the registers captured when the page was
//! first shadowed, and the element's counter state.

use crate::addr::{PhysAddr, VirtAddr, WORD_SIZE};
use crate::frame::FrameAllocator;
use crate::shadow::{ShadowId, ShadowRegistry};
use std::fmt;

/// Counter state of the element under comparison, owned by the report.
#[derive(Clone, Debug, Default)]
pub struct ReportCtx {
    /// Name of the protection domain the thread belongs to.
    pub domain: String,
    /// Number of the element being compared.
    pub pe_number: u64,
    /// Raw counter reading at the end of the first run.
    pub counter0: u64,
    /// Raw counter reading at the end of the second run.
    pub counter1: u64,
    /// COW faults taken by this element.
    pub cow_faults: u64,
    /// Elements started so far.
    pub pe_total: u64,
    /// vCPU elements started so far.
    pub vm_pe_total: u64,
}

/// Everything known about one divergent word.
#[derive(Clone, Debug)]
pub struct MismatchReport {
    pub domain: String,
    pub pe_number: u64,
    /// Report concerns the vm-stack queue rather than the live set.
    pub vm_stack: bool,
    /// Page and word index of the first divergent word.
    pub page_addr: VirtAddr,
    pub word_index: usize,
    pub old_phys: PhysAddr,
    pub shadow0: PhysAddr,
    pub shadow1: PhysAddr,
    /// Registers captured at the COW fault that created the entry.
    pub rip: u64,
    pub opcode: u8,
    pub rcx: u64,
    pub rsp: u64,
    pub stack_word: u64,
    /// Word values: committed frame, first-run shadow, second-run shadow.
    pub val0: u64,
    pub val1: u64,
    pub val2: u64,
    pub cow_faults: u64,
    pub counter0: u64,
    pub counter1: u64,
    pub pe_total: u64,
    pub vm_pe_total: u64,
    pub vm_stack_len: usize,
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let off = self.word_index * WORD_SIZE;
        write!(
            f,
            "MISMATCH{} pd {} pe {} virt {}:{} phys0 {} phys1 {} phys2 {} \
             rip {:#x}:{:02x} rcx {:#x} rsp {:#x}:{:#x} \
             ptr1 {}+{:#x} ptr2 {}+{:#x} \
             val0 {:#x} val1 {:#x} val2 {:#x} \
             cow_faults {} counter1 {:#x} counter2 {:#x} nb_pe {} nb_vm_pe {} vm_stack {}",
            if self.vm_stack { " IN VM STACK" } else { "" },
            self.domain,
            self.pe_number,
            self.page_addr,
            self.word_index,
            self.old_phys,
            self.shadow0,
            self.shadow1,
            self.rip,
            self.opcode,
            self.rcx,
            self.rsp,
            self.stack_word,
            self.shadow0,
            off,
            self.shadow1,
            off,
            self.val0,
            self.val1,
            self.val2,
            self.cow_faults,
            self.counter0,
            self.counter1,
            self.pe_total,
            self.vm_pe_total,
            self.vm_stack_len,
        )
    }
}

impl ShadowRegistry {
    /// Assemble the report for a divergent entry.
    pub(crate) fn build_mismatch_report(
        &self,
        frames: &FrameAllocator,
        id: ShadowId,
        word_index: usize,
        ctx: &ReportCtx,
        vm_stack: bool,
    ) -> MismatchReport {
        let e = self.entry(id);
        MismatchReport {
            domain: ctx.domain.clone(),
            pe_number: ctx.pe_number,
            vm_stack,
            page_addr: e.page_addr,
            word_index,
            old_phys: e.old_phys,
            shadow0: e.shadow[0],
            shadow1: e.shadow[1],
            rip: e.snapshot.rip,
            opcode: e.snapshot.opcode,
            rcx: e.snapshot.rcx,
            rsp: e.snapshot.rsp,
            stack_word: e.snapshot.stack_word,
            val0: frames.read_word(e.old_phys, word_index),
            val1: frames.read_word(e.shadow[0], word_index),
            val2: frames.read_word(e.shadow[1], word_index),
            cow_faults: ctx.cow_faults,
            counter0: ctx.counter0,
            counter1: ctx.counter1,
            pe_total: ctx.pe_total,
            vm_pe_total: ctx.vm_pe_total,
            vm_stack_len: self.vm_stack_len(),
        }
    }
}
