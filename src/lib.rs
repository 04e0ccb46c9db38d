#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

#[cfg(test)]
extern crate std;

mod access;
mod addr;
mod context;
mod descriptor;
mod fault;
mod frame;
mod hal;
mod regions;
mod shadow;
mod walker;

#[cfg(test)]
mod tests;

/// Host physical address, from the host's point of view (not the guest's).
pub type HostPhysAddr = memory_addr::PhysAddr;
/// Host virtual address in the hypervisor's own mapping.
pub type HostVirtAddr = memory_addr::VirtAddr;

pub use access::{
    AccessKind, AccessRequest, ApPerm, DomainAccess, SPECIAL_DOMAIN, ap_allows, decode_ap,
    domain_access, effective_dacr, encode_ap, is_guest_writable,
};
pub use addr::{Gfn, GuestPhysAddr, GuestVirtAddr, PAGE_SHIFT, gpa_to_gfn};
pub use context::{ArchRevision, MmuContext};
pub use descriptor::{L1Descriptor, L2Descriptor, PagingFormat};
pub use fault::{ArmFault, FaultState, PendingExceptions};
pub use frame::{ContiguousPhysFrames, PhysFrame};
pub use hal::{GuestMemory, ShadowMmuHal};
pub use regions::{SHARED_PAGE_BASE, SpecialRegions, VECTOR_BASE_HIGH, VECTOR_BASE_LOW};
pub use shadow::{L1_ENTRIES, L2_ENTRIES, RootId, ShadowMmu, ShadowRoot};
pub use walker::{MapInfo, Translation, translate, translate_to_host};
