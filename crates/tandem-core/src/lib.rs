//! Tandem — a fault-masking double-execution core.
//!
//! Every bounded segment of guest or user execution (a *processing
//! element*) runs twice. Writes are interposed by copy-on-write
//! shadowing, so each run lands its stores in a private shadow frame;
//! the architectural and memory state of the two runs is compared, and
//! results are written back only if both agree. A disagreement is a
//! transient hardware fault (a single-event upset): the element rolls
//! back and re-executes, and the fault is masked before anything
//! outside the thread can observe it.
//!
//! # Architecture
//!
//! - [`addr`], [`attr`] — addresses and mapping attributes
//! - [`frame`] — the physical frame arena (order-0/order-1 allocation)
//! - [`paging`] — soft host page table and guest vTLB
//! - [`regs`], [`clock`] — register file and the retired-instruction
//!   counter with its imprecise overflow interrupt
//! - [`shadow`] — shadow entries, the live/parked registries, the COW
//!   fault interposer
//! - [`compare`] — the compare and commit protocol
//! - [`vmstack`] — the per-vCPU guest-kernel-stack queue
//! - [`driver`] — the element state machine in the exception path
//! - [`exec`] — deterministic workload execution and the page-fault gate
//! - [`report`], [`stats`] — mismatch reports, counters, trace ring
//!
//! # Example
//!
//! ```
//! use tandem_core::addr::VirtAddr;
//! use tandem_core::attr::PageAttr;
//! use tandem_core::exec::{run_workload, Op, Workload};
//! use tandem_core::machine::{Machine, MachineConfig};
//! use tandem_core::paging::PageKind;
//! use tandem_core::thread::{Thread, ThreadKind};
//!
//! let mut machine = Machine::new(MachineConfig::default());
//! let mut thread = Thread::new("worker", "pd0", ThreadKind::Native);
//!
//! // Map one write-protected page.
//! let phys = machine.frames.alloc_page().unwrap();
//! thread.aspace.host.map(
//!     VirtAddr(0x4000),
//!     phys,
//!     PageAttr::user_data().shadowed(),
//!     PageKind::Normal,
//! );
//!
//! let workload = Workload::new(vec![Op::Write {
//!     addr: VirtAddr(0x4000),
//!     val: 0x11223344,
//! }]);
//! let outcome = run_workload(&mut thread, &mut machine, &workload, None).unwrap();
//! assert_eq!(outcome.commits, 1);
//! assert_eq!(machine.frames.read_word(phys, 0), 0x11223344);
//! ```

pub mod addr;
pub mod attr;
pub mod clock;
pub mod compare;
pub mod driver;
pub mod exec;
pub mod frame;
pub mod machine;
pub mod paging;
pub mod regs;
pub mod report;
pub mod shadow;
pub mod stats;
pub mod thread;
pub mod vmstack;

pub use addr::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use attr::PageAttr;
pub use driver::{Decision, PeStop};
pub use exec::{run_workload, Op, Workload, WorkloadOutcome};
pub use machine::{Machine, MachineConfig};
pub use thread::{Thread, ThreadKind};
