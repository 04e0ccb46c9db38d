//! Interfaces the shadow MMU consumes from the rest of the hypervisor.

use axerrno::AxResult;

use crate::addr::{Gfn, GuestPhysAddr};
use crate::{HostPhysAddr, HostVirtAddr};

/// Host services required by the shadow table manager.
///
/// Modeled after the per-arch VCPU HAL: frame allocation for shadow tables
/// and a direct physical-to-virtual translation for writing their entries.
pub trait ShadowMmuHal {
    /// Allocates a 4 KiB host frame.
    fn alloc_frame() -> Option<HostPhysAddr>;

    /// Deallocates a host frame previously returned by [`Self::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);

    /// Allocates `frame_count` physically contiguous frames, naturally
    /// aligned to the block size. The 16 KiB shadow root depends on this
    /// alignment, since the translation-table-base register ignores the low
    /// 14 address bits.
    fn alloc_contiguous_frames(frame_count: usize) -> Option<HostPhysAddr>;

    /// Deallocates a contiguous block from [`Self::alloc_contiguous_frames`].
    fn dealloc_contiguous_frames(paddr: HostPhysAddr, frame_count: usize);

    /// Converts a host physical address to a directly accessible virtual one.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// Allocates a fresh address-space identifier, if the host CPU has
    /// tagged TLBs. Shadow roots are tagged with the result.
    fn alloc_asid() -> Option<u16> {
        None
    }
}

/// Access to guest memory, provided by the generic guest-memory layer.
///
/// The walker fetches page-table descriptors through [`GuestMemory::read`];
/// the shadow table manager releases pinned guest pages through
/// [`GuestMemory::release`]. Pinning itself happens in the exit handler,
/// between a successful walk and the matching `install` call.
pub trait GuestMemory {
    /// Reads guest memory at `gpa` into `buf`.
    ///
    /// A failure here means the guest placed a page table outside its own
    /// memory (or the slot layout is broken) and is reported as a hard
    /// error, never as an architectural fault.
    fn read(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> AxResult;

    /// Reads one little-endian descriptor word.
    fn read_u32(&self, gpa: GuestPhysAddr) -> AxResult<u32> {
        let mut buf = [0u8; 4];
        self.read(gpa, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Whether `gfn` falls inside a registered guest memory slot.
    fn is_visible_gfn(&self, gfn: Gfn) -> bool;

    /// Number of registered guest memory slots.
    fn slot_count(&self) -> usize;

    /// Base frame number of slot `slot`.
    fn slot_base_gfn(&self, slot: usize) -> Gfn;

    /// Pins the guest page at `gfn` for direct host access and returns its
    /// host frame.
    fn pin(&self, gfn: Gfn) -> Option<HostPhysAddr>;

    /// Takes an extra reference on a host frame about to enter a shadow
    /// table outside the pin path (the special regions). Balanced by a later
    /// [`GuestMemory::release`] when the mapping is torn down.
    fn retain(&self, paddr: HostPhysAddr);

    /// Releases a page pinned by [`GuestMemory::pin`] or retained by
    /// [`GuestMemory::retain`]. `dirty` tells the guest-memory layer whether
    /// the content must be preserved.
    fn release(&self, paddr: HostPhysAddr, dirty: bool);

    /// Translates a visible `gfn` to a host virtual address without pinning.
    fn gfn_to_host(&self, gfn: Gfn) -> Option<HostVirtAddr>;
}
