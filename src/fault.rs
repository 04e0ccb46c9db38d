//! Architectural fault codes and synthetic fault injection.

use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;

use crate::addr::GuestVirtAddr;

numeric_enum! {
    #[repr(u8)]
    /// Fault status codes as encoded in the low four FSR bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ArmFault {
        Alignment = 0x1,
        TranslationSection = 0x5,
        TranslationPage = 0x7,
        DomainSection = 0x9,
        DomainPage = 0xb,
        ExternalAbortL1 = 0xc,
        PermissionSection = 0xd,
        ExternalAbortL2 = 0xe,
        PermissionPage = 0xf,
    }
}

impl ArmFault {
    /// Whether the fault is reported at page rather than section granularity.
    pub fn is_page_granular(self) -> bool {
        matches!(
            self,
            Self::TranslationPage | Self::DomainPage | Self::PermissionPage
        )
    }
}

bitflags! {
    /// Exceptions queued for injection on the next guest entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingExceptions: u8 {
        const DATA_ABORT = 1 << 0;
        const PREFETCH_ABORT = 1 << 1;
    }
}

/// The guest-visible fault registers of one VCPU.
///
/// The exit handler copies these into the emulated CP15 state before
/// re-entering the guest.
#[derive(Debug, Clone, Default)]
pub struct FaultState {
    /// Fault address register (c6), data aborts only.
    pub far: u32,
    /// Data fault status register (c5).
    pub dfsr: u32,
    /// Instruction fault status register (c5).
    pub ifsr: u32,
    pub pending: PendingExceptions,
}

impl FaultState {
    /// Makes a fault computed by the walker visible to the guest.
    ///
    /// Writes the status register for the faulting access type and marks the
    /// matching abort pending. Prefetch aborts carry no fault address on this
    /// architecture generation, so only the IFSR is written for them.
    pub fn inject_mmu_fault(
        &mut self,
        fault_addr: GuestVirtAddr,
        fault: ArmFault,
        domain: u8,
        is_prefetch: bool,
    ) {
        let fsr = (fault as u32 & 0xf) | ((domain as u32 & 0xf) << 4);
        if is_prefetch {
            trace!("injecting prefetch abort, fsr {fsr:#x}");
            self.ifsr = fsr;
            self.pending |= PendingExceptions::PREFETCH_ABORT;
        } else {
            trace!("injecting data abort at {fault_addr:#010x}, fsr {fsr:#x}");
            self.far = fault_addr;
            self.dfsr = fsr;
            self.pending |= PendingExceptions::DATA_ABORT;
        }
    }
}
