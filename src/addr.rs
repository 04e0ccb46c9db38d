//! Guest-side address types.
//!
//! The emulated architecture is 32-bit, so guest addresses are plain `u32`
//! values. Host-side addresses come from [`memory_addr`].

/// A guest virtual address.
pub type GuestVirtAddr = u32;

/// A guest physical address.
pub type GuestPhysAddr = u32;

/// A guest frame number (guest physical address >> [`PAGE_SHIFT`]).
pub type Gfn = u32;

/// Log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Returns the frame number containing `gpa`.
pub const fn gpa_to_gfn(gpa: GuestPhysAddr) -> Gfn {
    gpa >> PAGE_SHIFT
}
