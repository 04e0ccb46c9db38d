//! The two fixed regions bound into every shadow root.
//!
//! The shared communication page carries the world-switch trampoline state;
//! the vector page backs the guest's exception vectors at whichever base the
//! host currently uses. Both are installed under [`SPECIAL_DOMAIN`] so no
//! guest DACR value can make them unreachable while guest code runs.

use axerrno::AxResult;

use crate::HostPhysAddr;
use crate::access::{ApPerm, SPECIAL_DOMAIN};
use crate::addr::GuestVirtAddr;
use crate::context::MmuContext;
use crate::hal::{GuestMemory, ShadowMmuHal};
use crate::shadow::{RootId, ShadowMmu};

/// Exception vector base with the V bit set.
pub const VECTOR_BASE_HIGH: GuestVirtAddr = 0xffff_0000;
/// Exception vector base with the V bit clear.
pub const VECTOR_BASE_LOW: GuestVirtAddr = 0x0000_0000;
/// Default guest virtual address of the shared communication page, in the
/// same section as the high vectors.
pub const SHARED_PAGE_BASE: GuestVirtAddr = 0xffff_1000;

/// Host frames and guest addresses of the fixed regions.
#[derive(Debug, Clone)]
pub struct SpecialRegions {
    /// Where the shared page sits in guest virtual space.
    pub shared_page_gva: GuestVirtAddr,
    /// Hypervisor-owned frame backing the shared page.
    pub shared_page_frame: HostPhysAddr,
    /// Hypervisor-owned frame backing the guest-visible vector page.
    pub vector_frame: HostPhysAddr,
}

impl SpecialRegions {
    pub fn new(shared_page_frame: HostPhysAddr, vector_frame: HostPhysAddr) -> Self {
        Self {
            shared_page_gva: SHARED_PAGE_BASE,
            shared_page_frame,
            vector_frame,
        }
    }
}

impl<H: ShadowMmuHal> ShadowMmu<H> {
    /// Vector base currently bound into this VCPU's shadow tables.
    pub fn host_vector_base(&self) -> GuestVirtAddr {
        if self.host_vectors_high() {
            VECTOR_BASE_HIGH
        } else {
            VECTOR_BASE_LOW
        }
    }

    /// (Re)initializes a root: releases any existing mappings, then binds
    /// the shared page and the vector page. Must be re-run whenever the root
    /// is flushed.
    pub fn init_root<M: GuestMemory>(
        &mut self,
        ctx: &MmuContext,
        mem: &M,
        id: RootId,
    ) -> AxResult {
        debug!("initializing shadow root {id:?}");
        self.flush_root(ctx, mem, id);

        let shared_gva = self.regions().shared_page_gva;
        let shared_frame = self.regions().shared_page_frame;
        mem.retain(shared_frame);
        self.map_special(ctx, id, shared_gva, shared_frame)?;

        let vector_base = self.host_vector_base();
        let vector_frame = self.regions().vector_frame;
        mem.retain(vector_frame);
        self.map_special(ctx, id, vector_base, vector_frame)
    }

    /// Rebinds the vector page when the host changes vector base. A no-op if
    /// `high` matches the active base.
    pub fn switch_vector_base<M: GuestMemory>(
        &mut self,
        ctx: &MmuContext,
        mem: &M,
        id: RootId,
        high: bool,
    ) -> AxResult {
        if high == self.host_vectors_high() {
            return Ok(());
        }
        debug!("switching to {} vectors", if high { "high" } else { "low" });

        if high {
            // The low base owns a whole section of guest mappings; release
            // them all, the vector page's reference included.
            self.unmap_section(ctx, mem, id, VECTOR_BASE_LOW)?;
        } else {
            // The high section also carries the shared page and must stay,
            // so only the vector entry is cleared; drop its reference here
            // since unmap_page does not.
            self.unmap_page(id, VECTOR_BASE_HIGH)?;
            mem.release(self.regions().vector_frame, false);
        }
        self.set_host_vectors_high(high);

        let vector_base = self.host_vector_base();
        let vector_frame = self.regions().vector_frame;
        mem.retain(vector_frame);
        self.map_special(ctx, id, vector_base, vector_frame)
    }

    fn map_special(
        &mut self,
        ctx: &MmuContext,
        id: RootId,
        gva: GuestVirtAddr,
        frame: HostPhysAddr,
    ) -> AxResult {
        self.install(
            ctx,
            id,
            gva,
            frame,
            SPECIAL_DOMAIN,
            ApPerm::ReadWrite,
            ApPerm::None,
            true,
        )
    }
}
