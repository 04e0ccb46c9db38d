//! RAII wrappers around HAL-allocated host frames.

use core::marker::PhantomData;

use axerrno::{AxResult, ax_err_type};

use crate::HostPhysAddr;
use crate::hal::ShadowMmuHal;

pub(crate) use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// A single 4 KiB host frame, deallocated on drop. Backs the packed level-2
/// shadow tables.
#[derive(Debug)]
pub struct PhysFrame<H: ShadowMmuHal> {
    start_paddr: HostPhysAddr,
    _marker: PhantomData<H>,
}

impl<H: ShadowMmuHal> PhysFrame<H> {
    /// Allocates a frame and fills it with zeros.
    pub fn alloc_zero() -> AxResult<Self> {
        let start_paddr = H::alloc_frame()
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate shadow table frame failed"))?;
        assert_ne!(start_paddr.as_usize(), 0);
        let frame = Self {
            start_paddr,
            _marker: PhantomData,
        };
        unsafe { core::ptr::write_bytes(frame.as_mut_ptr(), 0, PAGE_SIZE) };
        Ok(frame)
    }

    /// Starting physical address of the frame.
    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_mut_ptr()
    }
}

impl<H: ShadowMmuHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        H::dealloc_frame(self.start_paddr);
        debug!("deallocated PhysFrame({:#x})", self.start_paddr);
    }
}

/// A naturally aligned block of contiguous host frames, deallocated on drop.
/// Backs the 16 KiB shadow level-1 root, which the hardware requires to be
/// physically contiguous and 16 KiB aligned.
#[derive(Debug)]
pub struct ContiguousPhysFrames<H: ShadowMmuHal> {
    start_paddr: HostPhysAddr,
    frame_count: usize,
    _marker: PhantomData<H>,
}

impl<H: ShadowMmuHal> ContiguousPhysFrames<H> {
    /// Allocates `frame_count` contiguous frames and fills them with zeros.
    pub fn alloc_zero(frame_count: usize) -> AxResult<Self> {
        let start_paddr = H::alloc_contiguous_frames(frame_count)
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate contiguous frames failed"))?;
        assert_ne!(start_paddr.as_usize(), 0);
        assert_eq!(start_paddr.as_usize() % (frame_count * PAGE_SIZE), 0);
        let frames = Self {
            start_paddr,
            frame_count,
            _marker: PhantomData,
        };
        unsafe { core::ptr::write_bytes(frames.as_mut_ptr(), 0, frames.size()) };
        Ok(frames)
    }

    /// Starting physical address of the block.
    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn size(&self) -> usize {
        PAGE_SIZE * self.frame_count
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_mut_ptr()
    }
}

impl<H: ShadowMmuHal> Drop for ContiguousPhysFrames<H> {
    fn drop(&mut self) {
        H::dealloc_contiguous_frames(self.start_paddr, self.frame_count);
        debug!(
            "deallocated ContiguousPhysFrames({:#x}, {} frames)",
            self.start_paddr, self.frame_count
        );
    }
}
