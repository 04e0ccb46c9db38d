//! Shadow page table management.
//!
//! The hardware walks these tables, not the guest's. Every level-1 entry is
//! either Fault or Coarse; sections the guest maps are expanded page by page
//! so each pinned guest frame can be released individually. Level-2 tables
//! are 1 KiB and packed four to a host frame; the frame is freed when its
//! last sub-table is released.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use axerrno::AxResult;

use crate::HostPhysAddr;
use crate::access::{self, ApPerm, SPECIAL_DOMAIN};
use crate::addr::GuestVirtAddr;
use crate::context::MmuContext;
use crate::descriptor::{
    L1_DOMAIN_MASK, L1_DOMAIN_SHIFT, encode_coarse, encode_extended_small, encode_small,
    replicate_subpage_ap,
};
use crate::frame::{ContiguousPhysFrames, PAGE_SIZE, PhysFrame};
use crate::hal::{GuestMemory, ShadowMmuHal};
use crate::regions::SpecialRegions;

/// Entries in a level-1 root table (one per 1 MiB, 4 GiB total).
pub const L1_ENTRIES: usize = 4096;
/// Entries in a level-2 sub-table (one per 4 KiB, 1 MiB total).
pub const L2_ENTRIES: usize = 256;

const L2_TABLE_SIZE: usize = 1024;
const SUBTABLES_PER_FRAME: u8 = 4;
const ROOT_FRAMES: usize = 4;

/// Guest addresses at and above this are kernel space and kept global in the
/// TLB; the range is flushed on world switch instead.
const KERNEL_SPACE_BASE: GuestVirtAddr = 0xbf00_0000;

/// Opaque handle to a shadow root registered on a [`ShadowMmu`]. Never
/// reused, so a stale handle is detected rather than aliased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootId(u32);

struct SubTableFrame<H: ShadowMmuHal> {
    frame: PhysFrame<H>,
    /// Sub-tables alive in this frame (1..=4). Shared frames may be counted
    /// from two VCPU threads, hence the atomic.
    live: AtomicU8,
}

/// Allocator packing four 1 KiB level-2 tables into each host frame.
///
/// The bump cursor is owned here, per VCPU; released sub-table slots are not
/// recycled, the whole frame is freed once its count drops to zero.
struct SubTableArena<H: ShadowMmuHal> {
    frames: BTreeMap<usize, SubTableFrame<H>>,
    cursor: Option<(usize, u8)>,
}

impl<H: ShadowMmuHal> SubTableArena<H> {
    fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
            cursor: None,
        }
    }

    /// Hands out the next free 1 KiB sub-table, zeroed, allocating a fresh
    /// frame when the current one is exhausted.
    fn alloc(&mut self) -> AxResult<HostPhysAddr> {
        let (pfn, slot) = match self.cursor.take() {
            Some(cursor) => cursor,
            None => {
                let frame = PhysFrame::<H>::alloc_zero()?;
                let pfn = frame.start_paddr().as_usize() / PAGE_SIZE;
                self.frames.insert(
                    pfn,
                    SubTableFrame {
                        frame,
                        live: AtomicU8::new(0),
                    },
                );
                (pfn, 0)
            }
        };
        let info = self.frames.get(&pfn).expect("cursor points at a missing frame");
        info.live.fetch_add(1, Ordering::Relaxed);
        if slot + 1 < SUBTABLES_PER_FRAME {
            self.cursor = Some((pfn, slot + 1));
        }
        Ok(HostPhysAddr::from(
            pfn * PAGE_SIZE + slot as usize * L2_TABLE_SIZE,
        ))
    }

    /// Drops one sub-table reference on the frame owning `table_pa`, freeing
    /// the frame when the last one goes away.
    fn release(&mut self, table_pa: HostPhysAddr) {
        let pfn = table_pa.as_usize() / PAGE_SIZE;
        let info = self
            .frames
            .get(&pfn)
            .expect("release of an unknown shadow sub-table frame");
        let prev = info.live.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "shadow sub-table count underflow");
        if prev == 1 {
            if matches!(self.cursor, Some((cursor_pfn, _)) if cursor_pfn == pfn) {
                self.cursor = None;
            }
            self.frames.remove(&pfn);
        }
    }

    fn contains(&self, table_pa: HostPhysAddr) -> bool {
        self.frames.contains_key(&(table_pa.as_usize() / PAGE_SIZE))
    }
}

/// One 16 KiB shadow level-1 root, shadowing a single guest translation
/// table base within one MMU context.
pub struct ShadowRoot<H: ShadowMmuHal> {
    id: RootId,
    table: ContiguousPhysFrames<H>,
    asid: Option<u16>,
    guest_ttbr: u32,
}

impl<H: ShadowMmuHal> ShadowRoot<H> {
    pub fn id(&self) -> RootId {
        self.id
    }

    /// Physical base of the root table, suitable for the hardware TTBR.
    pub fn phys_addr(&self) -> HostPhysAddr {
        self.table.start_paddr()
    }

    /// Address-space identifier tagging this root, when the host CPU has
    /// tagged TLBs.
    pub fn asid(&self) -> Option<u16> {
        self.asid
    }

    /// Guest translation table base this root shadows.
    pub fn guest_ttbr(&self) -> u32 {
        self.guest_ttbr
    }

    /// Raw level-1 entry at `index`. Volatile: the hardware walks this table.
    pub fn entry(&self, index: usize) -> u32 {
        assert!(index < L1_ENTRIES);
        unsafe { (self.table.as_mut_ptr() as *const u32).add(index).read_volatile() }
    }

    fn set_entry(&self, index: usize, value: u32) {
        assert!(index < L1_ENTRIES);
        unsafe {
            (self.table.as_mut_ptr() as *mut u32)
                .add(index)
                .write_volatile(value)
        }
    }
}

fn l2_entry_at<H: ShadowMmuHal>(table_pa: HostPhysAddr, index: usize) -> u32 {
    assert!(index < L2_ENTRIES);
    unsafe {
        (H::phys_to_virt(table_pa).as_ptr() as *const u32)
            .add(index)
            .read_volatile()
    }
}

fn set_l2_entry_at<H: ShadowMmuHal>(table_pa: HostPhysAddr, index: usize, value: u32) {
    assert!(index < L2_ENTRIES);
    unsafe {
        (H::phys_to_virt(table_pa).as_mut_ptr() as *mut u32)
            .add(index)
            .write_volatile(value)
    }
}

fn coarse_table_pa(l1: u32) -> HostPhysAddr {
    HostPhysAddr::from((l1 & !0x3ff) as usize)
}

/// Releases one populated shadow level-2 entry back to the guest-memory
/// layer.
///
/// The dirty hint is derived from the domain and AP bits against the
/// *current* DACR; a page whose domain class changed since it was last
/// written can be misclassified. Accepted approximation: Manager-domain and
/// clean pages dominate in practice.
fn release_l2_entry<H: ShadowMmuHal, M: GuestMemory>(
    ctx: &MmuContext,
    mem: &M,
    domain: u8,
    pte: u32,
) {
    let kind = pte & 0x3;
    if kind == 0 {
        return;
    }
    let small = if ctx.extended() {
        kind & 0b10 != 0
    } else {
        kind == 0b10
    };
    assert!(small, "large page in shadow page table: {pte:#010x}");
    let ap = ((pte >> 4) & 0x3) as u8;
    let apx = ctx.extended() && pte & (1 << 9) != 0;
    let dirty = access::is_guest_writable(ctx.dacr, domain, ap, apx);
    mem.release(HostPhysAddr::from((pte & 0xffff_f000) as usize), dirty);
}

/// Releases a whole level-2 sub-table referenced by a coarse level-1 entry.
fn release_subtable<H: ShadowMmuHal, M: GuestMemory>(
    ctx: &MmuContext,
    mem: &M,
    arena: &mut SubTableArena<H>,
    l1: u32,
) {
    let table_pa = coarse_table_pa(l1);
    let domain = ((l1 & L1_DOMAIN_MASK) >> L1_DOMAIN_SHIFT) as u8;
    for index in 0..L2_ENTRIES {
        release_l2_entry::<H, M>(ctx, mem, domain, l2_entry_at::<H>(table_pa, index));
    }
    arena.release(table_pa);
}

fn flush_children<H: ShadowMmuHal, M: GuestMemory>(
    ctx: &MmuContext,
    mem: &M,
    arena: &mut SubTableArena<H>,
    root: &ShadowRoot<H>,
) {
    for index in 0..L1_ENTRIES {
        let l1 = root.entry(index);
        match l1 & 0x3 {
            0b00 => {}
            0b01 => {
                release_subtable::<H, M>(ctx, mem, arena, l1);
                root.set_entry(index, 0);
            }
            _ => panic!("shadow L1 entry {l1:#010x} is neither fault nor coarse"),
        }
    }
}

/// Per-VCPU shadow table state: the root list, the sub-table arena and the
/// special-region bindings.
pub struct ShadowMmu<H: ShadowMmuHal> {
    roots: Vec<ShadowRoot<H>>,
    arena: SubTableArena<H>,
    regions: SpecialRegions,
    host_vectors_high: bool,
    next_id: u32,
}

impl<H: ShadowMmuHal> ShadowMmu<H> {
    pub fn new(regions: SpecialRegions) -> Self {
        Self {
            roots: Vec::new(),
            arena: SubTableArena::new(),
            regions,
            host_vectors_high: true,
            next_id: 0,
        }
    }

    pub fn regions(&self) -> &SpecialRegions {
        &self.regions
    }

    /// Vector base currently bound into the shadow tables.
    pub fn host_vectors_high(&self) -> bool {
        self.host_vectors_high
    }

    pub(crate) fn set_host_vectors_high(&mut self, high: bool) {
        self.host_vectors_high = high;
    }

    pub fn root(&self, id: RootId) -> Option<&ShadowRoot<H>> {
        self.roots.iter().find(|root| root.id == id)
    }

    /// Root already shadowing `guest_ttbr`, if one exists on this VCPU.
    pub fn find_root(&self, guest_ttbr: u32) -> Option<RootId> {
        self.roots
            .iter()
            .find(|root| root.guest_ttbr == guest_ttbr)
            .map(|root| root.id)
    }

    fn root_index(&self, id: RootId) -> usize {
        self.roots
            .iter()
            .position(|root| root.id == id)
            .expect("stale shadow root id")
    }

    /// Allocates a zeroed root shadowing `guest_ttbr`, registers it and binds
    /// the special regions into it.
    pub fn allocate_root<M: GuestMemory>(
        &mut self,
        ctx: &MmuContext,
        mem: &M,
        guest_ttbr: u32,
    ) -> AxResult<RootId> {
        let table = ContiguousPhysFrames::alloc_zero(ROOT_FRAMES)?;
        let id = RootId(self.next_id);
        self.next_id += 1;
        let asid = H::alloc_asid();
        debug!(
            "allocated shadow root {id:?} for guest ttbr {guest_ttbr:#010x} (asid {asid:?})"
        );
        self.roots.push(ShadowRoot {
            id,
            table,
            asid,
            guest_ttbr,
        });
        self.init_root(ctx, mem, id)?;
        Ok(id)
    }

    /// Maps one guest virtual page to a host frame.
    ///
    /// `host_frame` must already be pinned by the caller. An existing entry
    /// for `gva` is overwritten in place. Mappings landing in the same 1 MiB
    /// section as a special region have their domain folded into AP bits and
    /// are installed under [`SPECIAL_DOMAIN`] instead.
    #[allow(clippy::too_many_arguments)]
    pub fn install(
        &mut self,
        ctx: &MmuContext,
        id: RootId,
        gva: GuestVirtAddr,
        host_frame: HostPhysAddr,
        domain: u8,
        priv_ap: ApPerm,
        user_ap: ApPerm,
        exec: bool,
    ) -> AxResult {
        let (ap, apx) = access::encode_ap(priv_ap, user_ap, ctx.extended())?;
        self.install_raw(ctx, id, gva, host_frame, domain, ap, apx, !exec)
    }

    #[allow(clippy::too_many_arguments)]
    fn install_raw(
        &mut self,
        ctx: &MmuContext,
        id: RootId,
        gva: GuestVirtAddr,
        host_frame: HostPhysAddr,
        mut domain: u8,
        mut ap: u8,
        mut apx: bool,
        xn: bool,
    ) -> AxResult {
        let l1_index = (gva >> 20) as usize;

        if domain != SPECIAL_DOMAIN {
            let shared_index = (self.regions.shared_page_gva >> 20) as usize;
            let vector_index = (self.host_vector_base() >> 20) as usize;
            if l1_index == shared_index || l1_index == vector_index {
                (ap, apx) = access::domain_to_ap(ctx.dacr, domain, ap, apx);
                domain = SPECIAL_DOMAIN;
            }
        }

        // The shared page stays in the TLB across world switches, and kernel
        // mappings are global because that range is flushed wholesale.
        let ng = !(gva & !0xfff == self.regions.shared_page_gva || gva >= KERNEL_SPACE_BASE);

        let index = self.root_index(id);
        let Self { roots, arena, .. } = self;
        let root = &roots[index];

        let l1 = root.entry(l1_index);
        let table_pa = match l1 & 0x3 {
            0b00 => {
                let pa = arena.alloc()?;
                assert!(
                    (pa.as_usize() as u64) < 1 << 32,
                    "shadow sub-table beyond the 32-bit physical space"
                );
                root.set_entry(l1_index, encode_coarse(pa.as_usize() as u32, domain));
                pa
            }
            0b01 => {
                // Refresh the domain: the guest may have retagged the region.
                root.set_entry(
                    l1_index,
                    (l1 & !L1_DOMAIN_MASK) | ((domain as u32 & 0xf) << L1_DOMAIN_SHIFT),
                );
                let pa = coarse_table_pa(l1);
                assert!(
                    arena.contains(pa),
                    "shadow L1 entry references an unknown sub-table frame"
                );
                pa
            }
            _ => panic!("shadow L1 entry {l1:#010x} is neither fault nor coarse"),
        };

        assert!(
            (host_frame.as_usize() as u64) < 1 << 32,
            "host frame beyond the 32-bit physical space"
        );
        let pfn = (host_frame.as_usize() >> 12) as u32;
        let pte = if ctx.extended() {
            encode_extended_small(pfn, ap, apx, xn, ng)
        } else {
            encode_small(pfn, replicate_subpage_ap(ap))
        };
        let slot = ((gva >> 12) & 0xff) as usize;
        set_l2_entry_at::<H>(table_pa, slot, pte);
        trace!("shadow map {gva:#010x} -> pfn {pfn:#x} (pte {pte:#010x}, domain {domain})");
        Ok(())
    }

    /// Clears the level-2 entry for `gva`, leaving the sub-table and its
    /// reference count alone so the page can be remapped cheaply. Succeeds
    /// if the entry is already unmapped.
    pub fn unmap_page(&mut self, id: RootId, gva: GuestVirtAddr) -> AxResult {
        let index = self.root_index(id);
        let root = &self.roots[index];
        let l1 = root.entry((gva >> 20) as usize);
        match l1 & 0x3 {
            0b00 => Ok(()),
            0b01 => {
                set_l2_entry_at::<H>(coarse_table_pa(l1), ((gva >> 12) & 0xff) as usize, 0);
                Ok(())
            }
            _ => panic!("shadow L1 entry {l1:#010x} is neither fault nor coarse"),
        }
    }

    /// Tears down the whole 1 MiB region containing `gva`: releases every
    /// pinned guest page in it, drops the sub-table and resets the level-1
    /// entry to Fault.
    pub fn unmap_section<M: GuestMemory>(
        &mut self,
        ctx: &MmuContext,
        mem: &M,
        id: RootId,
        gva: GuestVirtAddr,
    ) -> AxResult {
        let index = self.root_index(id);
        let Self { roots, arena, .. } = self;
        let root = &roots[index];
        let l1_index = (gva >> 20) as usize;
        let l1 = root.entry(l1_index);
        match l1 & 0x3 {
            0b00 => Ok(()),
            0b01 => {
                debug!("unmapping shadow section at {:#010x}", gva & 0xfff0_0000);
                release_subtable::<H, M>(ctx, mem, arena, l1);
                root.set_entry(l1_index, 0);
                Ok(())
            }
            _ => panic!("shadow L1 entry {l1:#010x} is neither fault nor coarse"),
        }
    }

    /// Releases every mapping of the root, then the root itself, and drops
    /// it from this VCPU's list.
    pub fn free_root<M: GuestMemory>(
        &mut self,
        ctx: &MmuContext,
        mem: &M,
        id: RootId,
    ) -> AxResult {
        let index = self.root_index(id);
        {
            let Self { roots, arena, .. } = self;
            flush_children::<H, M>(ctx, mem, arena, &roots[index]);
        }
        let root = self.roots.swap_remove(index);
        debug!(
            "freed shadow root {:?} (guest ttbr {:#010x})",
            root.id, root.guest_ttbr
        );
        Ok(())
    }

    pub(crate) fn flush_root<M: GuestMemory>(&mut self, ctx: &MmuContext, mem: &M, id: RootId) {
        let index = self.root_index(id);
        let Self { roots, arena, .. } = self;
        flush_children::<H, M>(ctx, mem, arena, &roots[index]);
    }

    /// Shadow level-2 entry currently mapping `gva`, if its section has been
    /// expanded. Diagnostic only.
    pub fn l2_entry(&self, id: RootId, gva: GuestVirtAddr) -> Option<u32> {
        let root = self.root(id)?;
        let l1 = root.entry((gva >> 20) as usize);
        if l1 & 0x3 != 0b01 {
            return None;
        }
        Some(l2_entry_at::<H>(
            coarse_table_pa(l1),
            ((gva >> 12) & 0xff) as usize,
        ))
    }

    /// Iterates over (frame base, live sub-table count) pairs of the arena.
    /// Diagnostic only.
    pub fn subtable_frames(&self) -> impl Iterator<Item = (HostPhysAddr, u8)> + '_ {
        self.arena.frames.values().map(|subtable| {
            (
                subtable.frame.start_paddr(),
                subtable.live.load(Ordering::Relaxed),
            )
        })
    }
}
