//! Page-mapping attributes.
//!
//! The core reasons about permissions as a small tagged struct
//! ([`PageAttr`]) and only speaks the hardware bit layout ([`HwAttr`]) at
//! the page-table boundary. The copy-on-write marker shares the attribute
//! word with the ordinary permission bits, exactly as the hardware format
//! packs it into an ignored PTE bit.

use bitflags::bitflags;

bitflags! {
    /// Hardware layout of a page-table attribute word.
    ///
    /// Bit positions follow the x86-64 PTE format; `COW` lives in one of
    /// the ignored bits (bit 11).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct HwAttr: u64 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
        const COW     = 1 << 11;
    }
}

/// Decoded mapping attributes.
///
/// `cow` marks a mapping whose write permission was deliberately stripped
/// so that the first store faults into the shadow subsystem.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PageAttr {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub cow: bool,
}

impl PageAttr {
    /// Attributes of an ordinary user data mapping.
    pub const fn user_data() -> Self {
        PageAttr {
            present: true,
            writable: true,
            user: true,
            cow: false,
        }
    }

    /// The write-protected form installed before a page is shadowed:
    /// WRITE stripped, COW set.
    #[inline]
    pub fn shadowed(self) -> Self {
        PageAttr {
            writable: false,
            cow: true,
            ..self
        }
    }

    /// The form installed while a run is in flight: WRITE granted, COW
    /// cleared, so stores land in the shadow frame without faulting.
    #[inline]
    pub fn run(self) -> Self {
        PageAttr {
            writable: true,
            cow: false,
            ..self
        }
    }

    /// Encode into the hardware bit layout.
    pub fn to_hw(self) -> HwAttr {
        let mut hw = HwAttr::empty();
        hw.set(HwAttr::PRESENT, self.present);
        hw.set(HwAttr::WRITE, self.writable);
        hw.set(HwAttr::USER, self.user);
        hw.set(HwAttr::COW, self.cow);
        hw
    }

    /// Decode from the hardware bit layout.
    pub fn from_hw(hw: HwAttr) -> Self {
        PageAttr {
            present: hw.contains(HwAttr::PRESENT),
            writable: hw.contains(HwAttr::WRITE),
            user: hw.contains(HwAttr::USER),
            cow: hw.contains(HwAttr::COW),
        }
    }
}
