//! Per-VCPU MMU state observed by the walker and the shadow table manager.

use crate::addr::GuestVirtAddr;
use crate::descriptor::PagingFormat;
use crate::regions::{VECTOR_BASE_HIGH, VECTOR_BASE_LOW};

/// Architecture revision of the emulated CPU. Fixed for the lifetime of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchRevision {
    /// VMSAv5: subpage permissions, tiny pages, no supersections.
    V5,
    /// VMSAv6: supersections, extended small pages, APX/XN bits.
    V6,
}

/// Snapshot of the guest's translation-related system registers.
///
/// All fields are guest-controlled and updated by the (out of scope)
/// coprocessor emulation; this crate only reads them. The shadow tables for a
/// given VCPU are manipulated exclusively from that VCPU's thread, so a
/// shared reference is all any operation here needs.
#[derive(Debug, Clone)]
pub struct MmuContext {
    /// Translation table base 0 (c2). 16 KiB aligned when TTBCR.N is zero.
    pub ttbr0: u32,
    /// Translation table base 1 (c2, V6 only). Always 16 KiB aligned.
    pub ttbr1: u32,
    /// TTBCR.N: number of high address bits selecting TTBR1 (0 disables the
    /// split and all walks use TTBR0).
    pub ttbcr_n: u8,
    /// Domain access control register (c3), two bits per domain.
    pub dacr: u32,
    /// CP15 c1 M bit: guest translation enabled.
    pub mmu_enabled: bool,
    /// CP15 c1 XP bit: extended (subpage-free) page table format.
    pub extended_paging: bool,
    /// CP15 c1 V bit: guest exception vectors at the high base.
    pub high_vectors: bool,
    /// CPU generation being emulated.
    pub revision: ArchRevision,
}

impl MmuContext {
    /// The descriptor format the guest's tables use right now.
    pub fn paging_format(&self) -> PagingFormat {
        match self.revision {
            ArchRevision::V5 => PagingFormat::V5,
            ArchRevision::V6 if self.extended_paging => PagingFormat::V6Extended,
            ArchRevision::V6 => PagingFormat::V6Compat,
        }
    }

    /// Whether shadow entries must be written in the extended format.
    pub fn extended(&self) -> bool {
        self.paging_format() == PagingFormat::V6Extended
    }

    /// Translation table base used for `gva`, honoring the TTBCR.N split.
    pub fn ttbr_for(&self, gva: GuestVirtAddr) -> u32 {
        if self.ttbcr_n == 0 || gva >> (32 - self.ttbcr_n as u32) == 0 {
            self.ttbr0
        } else {
            self.ttbr1
        }
    }

    /// Exception vector base the guest expects, per its V bit.
    pub fn guest_vector_base(&self) -> GuestVirtAddr {
        if self.high_vectors {
            VECTOR_BASE_HIGH
        } else {
            VECTOR_BASE_LOW
        }
    }
}

impl Default for MmuContext {
    fn default() -> Self {
        Self {
            ttbr0: 0,
            ttbr1: 0,
            ttbcr_n: 0,
            dacr: 0,
            mmu_enabled: false,
            extended_paging: false,
            high_vectors: false,
            revision: ArchRevision::V6,
        }
    }
}
