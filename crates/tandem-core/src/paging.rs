//! Soft page tables: the host page table and the guest virtual TLB.
//!
//! Both tables share one shape — a map from virtual page to
//! `(phys, attr, kind)` — and one update contract:
//!
//! - `lookup` walks the table;
//! - `cow_update` atomically repoints an existing entry and flushes the
//!   local TLB for the affected address (a trace event in this model);
//! - `is_cow_fault` classifies a write fault against the COW marker.
//!
//! A [`MappingRef`] names the page-table entry a shadow record originated
//! from. It is an enum, so an entry is *by construction* backed by exactly
//! one of the two tables.

use crate::addr::{PhysAddr, VirtAddr};
use crate::attr::PageAttr;
use log::trace;
use std::collections::BTreeMap;
use thiserror::Error;

/// Mapping granularity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    /// 4 KiB page.
    Normal,
    /// 2 MiB page. Accepted by the tables, rejected by the shadow
    /// interposer.
    Big,
}

/// One page-table entry.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Mapping {
    pub phys: PhysAddr,
    pub attr: PageAttr,
    pub kind: PageKind,
}

/// Which table a mapping lives in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Space {
    Host,
    Guest,
}

/// Reference to the page-table entry a shadow record interposed on:
/// exactly one of a host-PT entry or a guest-vTLB entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MappingRef {
    Host(VirtAddr),
    Guest(VirtAddr),
}

impl MappingRef {
    /// The virtual page the entry maps.
    #[inline]
    pub fn virt(self) -> VirtAddr {
        match self {
            MappingRef::Host(v) | MappingRef::Guest(v) => v,
        }
    }

    /// The table the entry lives in.
    #[inline]
    pub fn space(self) -> Space {
        match self {
            MappingRef::Host(_) => Space::Host,
            MappingRef::Guest(_) => Space::Guest,
        }
    }
}

/// Page-fault error bits, decoded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageFaultErr {
    pub user: bool,
    pub write: bool,
}

/// Errors from page-table updates.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PagingError {
    /// `cow_update` on a virtual page with no entry.
    #[error("no mapping for virtual page {virt}")]
    Unmapped { virt: VirtAddr },
}

/// A soft page table (host PT or guest vTLB).
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<u64, Mapping>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) a mapping.
    pub fn map(&mut self, virt: VirtAddr, phys: PhysAddr, attr: PageAttr, kind: PageKind) {
        self.entries.insert(
            virt.page_base().0,
            Mapping {
                phys: phys.page_base(),
                attr,
                kind,
            },
        );
    }

    /// Remove a mapping, returning it if present.
    pub fn unmap(&mut self, virt: VirtAddr) -> Option<Mapping> {
        self.entries.remove(&virt.page_base().0)
    }

    /// Walk the table.
    pub fn lookup(&self, virt: VirtAddr) -> Option<Mapping> {
        self.entries.get(&virt.page_base().0).copied()
    }

    /// Atomically repoint an existing entry to `phys` with `attr`, and
    /// flush the local TLB for the affected address.
    pub fn cow_update(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        attr: PageAttr,
    ) -> Result<(), PagingError> {
        let virt = virt.page_base();
        let entry = self
            .entries
            .get_mut(&virt.0)
            .ok_or(PagingError::Unmapped { virt })?;
        entry.phys = phys.page_base();
        entry.attr = attr;
        trace!("cow_update {virt} -> {phys} attr {:?} (tlb flush)", attr);
        Ok(())
    }

    /// Classify a page fault: is this a write fault on a COW-marked,
    /// present mapping?
    pub fn is_cow_fault(&self, virt: VirtAddr, err: PageFaultErr) -> bool {
        if !err.write {
            return false;
        }
        matches!(self.lookup(virt), Some(m) if m.attr.cow && m.attr.present)
    }

    /// Number of installed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The two tables of one execution context.
#[derive(Default)]
pub struct AddressSpace {
    pub host: PageTable,
    pub guest: PageTable,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table a space selector names.
    pub fn table(&self, space: Space) -> &PageTable {
        match space {
            Space::Host => &self.host,
            Space::Guest => &self.guest,
        }
    }

    pub fn table_mut(&mut self, space: Space) -> &mut PageTable {
        match space {
            Space::Host => &mut self.host,
            Space::Guest => &mut self.guest,
        }
    }

    /// Look up the entry a [`MappingRef`] points at.
    pub fn lookup_ref(&self, origin: MappingRef) -> Option<Mapping> {
        self.table(origin.space()).lookup(origin.virt())
    }

    /// Repoint the entry a [`MappingRef`] points at.
    pub fn cow_update(
        &mut self,
        origin: MappingRef,
        phys: PhysAddr,
        attr: PageAttr,
    ) -> Result<(), PagingError> {
        self.table_mut(origin.space())
            .cow_update(origin.virt(), phys, attr)
    }
}
