//! The execution context: one thread or vCPU.

use crate::addr::VirtAddr;
use crate::driver::PeState;
use crate::paging::{AddressSpace, MappingRef, Space};
use crate::regs::RegisterFile;
use crate::shadow::ShadowRegistry;

/// Whether the context is a native user thread or a hardware-virtualized
/// guest CPU.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadKind {
    Native,
    Vcpu,
}

/// One schedulable execution context.
///
/// The element state machine, the shadow registry, and the address
/// space are all per-thread: a CPU that preempts between runs carries
/// the whole element along with the thread, and no state is shared
/// across CPUs.
pub struct Thread {
    pub name: String,
    /// Name of the owning protection domain, for reports.
    pub domain: String,
    pub kind: ThreadKind,
    pub regs: RegisterFile,
    pub aspace: AddressSpace,
    pub shadows: ShadowRegistry,
    pub pe: PeState,
}

impl Thread {
    pub fn new(name: &str, domain: &str, kind: ThreadKind) -> Self {
        Thread {
            name: name.to_owned(),
            domain: domain.to_owned(),
            kind,
            regs: RegisterFile::default(),
            aspace: AddressSpace::new(),
            shadows: ShadowRegistry::new(),
            pe: PeState::default(),
        }
    }

    #[inline]
    pub fn is_vcpu(&self) -> bool {
        self.kind == ThreadKind::Vcpu
    }

    /// The table this thread's user-level accesses translate through.
    #[inline]
    pub fn space(&self) -> Space {
        match self.kind {
            ThreadKind::Native => Space::Host,
            ThreadKind::Vcpu => Space::Guest,
        }
    }

    /// The mapping reference for one of this thread's pages.
    #[inline]
    pub fn origin(&self, virt: VirtAddr) -> MappingRef {
        match self.kind {
            ThreadKind::Native => MappingRef::Host(virt.page_base()),
            ThreadKind::Vcpu => MappingRef::Guest(virt.page_base()),
        }
    }
}
