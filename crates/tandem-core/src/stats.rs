//! Execution counters and the bounded diagnostic trace ring.

use crate::addr::{PhysAddr, VirtAddr};
use log::{debug, info};
use std::collections::VecDeque;

/// Counters kept across the life of a machine.
///
/// The per-element subset (`cow_faults`, `reused_carried`) is reset at
/// every element boundary; the rest accumulates.
#[derive(Debug, Clone, Default)]
pub struct PeCounters {
    /// COW faults taken during the current processing element.
    pub cow_faults: u64,
    /// Carried entries that were touched again this element.
    pub reused_carried: u64,
    /// Processing elements started.
    pub pe_total: u64,
    /// Processing elements started on vCPUs.
    pub vm_pe_total: u64,
    /// Single-step iterations taken for counter reconciliation.
    pub pmi_single_steps: u64,
    /// Deterministic stops, by class.
    pub pio_stops: u64,
    pub mmio_stops: u64,
    pub rdtsc_stops: u64,
    /// Exceptions observed (all vectors).
    pub exceptions: u64,
    /// Divergences that forced a rollback.
    pub rollbacks: u64,
    /// Rollbacks recovered by a clean re-execution.
    pub recovered: u64,
    /// Divergences surfaced as detected upsets.
    pub seu_detected: u64,
}

impl PeCounters {
    /// Reset the per-element counters at an element boundary.
    pub fn reset_pe(&mut self) {
        self.cow_faults = 0;
        self.reused_carried = 0;
    }

    /// Log a one-shot summary of every counter.
    pub fn dump(&self) {
        info!(
            "counters: pe {} vm_pe {} cow_faults {} pmi_ss {} pio {} mmio {} rdtsc {} \
             exc {} rollbacks {} recovered {} seu {}",
            self.pe_total,
            self.vm_pe_total,
            self.cow_faults,
            self.pmi_single_steps,
            self.pio_stops,
            self.mmio_stops,
            self.rdtsc_stops,
            self.exceptions,
            self.rollbacks,
            self.recovered,
            self.seu_detected,
        );
    }
}

/// One diagnostic trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Element number the record belongs to.
    pub pe: u64,
    /// What happened.
    pub note: &'static str,
    /// Virtual page involved.
    pub page: VirtAddr,
    /// Committed frame.
    pub old_phys: PhysAddr,
    /// First- and second-run shadow frames.
    pub shadow0: PhysAddr,
    pub shadow1: PhysAddr,
    /// Aliased page of the twin, when one exists.
    pub twin_page: Option<VirtAddr>,
}

/// Bounded ring of [`TraceEntry`] records, dumped on divergence.
pub struct TraceRing {
    entries: VecDeque<TraceEntry>,
    cap: usize,
}

impl TraceRing {
    pub fn new(cap: usize) -> Self {
        TraceRing {
            entries: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    /// Append a record, evicting the oldest when full.
    pub fn push(&mut self, entry: TraceEntry) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Log every record, oldest first.
    pub fn dump_log(&self) {
        for e in &self.entries {
            debug!(
                "trace pe {} {}: v {} phys {} shadows {}/{} twin {:?}",
                e.pe, e.note, e.page, e.old_phys, e.shadow0, e.shadow1, e.twin_page,
            );
        }
    }
}
