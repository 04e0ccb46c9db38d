//! Walks the guest's own translation tables.
//!
//! The walk reproduces what the guest's MMU would do if it were real: level-1
//! lookup, domain check, optional level-2 lookup, permission check. Faults
//! are part of the result, not errors; only broken guest state (page tables
//! outside guest memory, unshadowable descriptor kinds) aborts the walk.

use axerrno::{AxResult, ax_err, ax_err_type};

use crate::HostVirtAddr;
use crate::access::{self, AccessRequest, DomainAccess};
use crate::addr::{Gfn, GuestVirtAddr, PAGE_SHIFT, gpa_to_gfn};
use crate::context::MmuContext;
use crate::descriptor::{L1Descriptor, L2Descriptor, PagingFormat, replicate_subpage_ap};
use crate::fault::ArmFault;
use crate::hal::GuestMemory;

/// Mapping metadata collected during a walk, later consumed when the shadow
/// entry is installed. Never stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapInfo {
    pub domain: u8,
    /// Four 2-bit subpage AP fields (replicated when the source descriptor
    /// has a single field).
    pub ap: u8,
    pub apx: bool,
    pub xn: bool,
    /// C/B at bits 2..3, TEX at bits 4..6.
    pub cache_bits: u8,
}

/// Result of a successful walk. `fault` carries the architectural fault the
/// access would raise; the frame number is resolved even then, so callers can
/// log or correlate both.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub gfn: Gfn,
    pub fault: Option<ArmFault>,
    pub info: MapInfo,
}

impl Translation {
    fn faulted(gfn: Gfn, fault: ArmFault, domain: u8) -> Self {
        Self {
            gfn,
            fault: Some(fault),
            info: MapInfo {
                domain,
                ..MapInfo::default()
            },
        }
    }
}

/// Returns a frame number guaranteed not to alias any registered guest
/// memory, by scanning below the slot bases for a gap.
fn invisible_gfn<M: GuestMemory>(mem: &M) -> Gfn {
    let mut gfn: Gfn = 0x00ff_ffff;
    for slot in 0..mem.slot_count() {
        if !mem.is_visible_gfn(gfn) {
            break;
        }
        gfn = mem.slot_base_gfn(slot).wrapping_sub(1);
    }
    assert!(
        !mem.is_visible_gfn(gfn),
        "guest memory slots leave no invisible frame number"
    );
    gfn
}

/// Translates a guest virtual address to a guest frame number.
///
/// With the guest MMU disabled the mapping is the identity with maximal
/// permissions and no table is read. Otherwise the guest's two-level table is
/// walked through `mem`; a failed read there is a hard error, distinct from
/// any architectural fault.
///
/// When both the level-1 domain check and a level-2 (or section permission)
/// check fail, the domain fault is reported: domain faults architecturally
/// preempt permission faults.
pub fn translate<M: GuestMemory>(
    ctx: &MmuContext,
    mem: &M,
    gva: GuestVirtAddr,
    req: AccessRequest,
) -> AxResult<Translation> {
    if !ctx.mmu_enabled {
        return Ok(Translation {
            gfn: gva >> PAGE_SHIFT,
            fault: None,
            info: MapInfo {
                domain: 0,
                ap: 0xff,
                apx: false,
                xn: false,
                cache_bits: 0x0c,
            },
        });
    }

    let format = ctx.paging_format();
    let l1_addr = ctx.ttbr_for(gva) | ((gva >> 20) << 2);
    let l1_raw = mem.read_u32(l1_addr)?;
    trace!("walk {gva:#010x}: l1 entry at {l1_addr:#010x} = {l1_raw:#010x}");

    match L1Descriptor::decode(l1_raw, format)? {
        L1Descriptor::Fault => Ok(Translation::faulted(
            invisible_gfn(mem),
            ArmFault::TranslationSection,
            0,
        )),
        L1Descriptor::Section {
            base,
            domain,
            ap,
            apx,
            xn,
            cache,
        } => {
            let fault = match access::domain_access(ctx.dacr, domain) {
                DomainAccess::NoAccess => Some(ArmFault::DomainSection),
                DomainAccess::Client if !access::ap_allows(ap, apx, xn, req) => {
                    Some(ArmFault::PermissionSection)
                }
                _ => None,
            };
            Ok(Translation {
                gfn: gpa_to_gfn(base | (gva & 0x000f_ffff)),
                fault,
                info: MapInfo {
                    domain,
                    ap: replicate_subpage_ap(ap),
                    apx,
                    xn,
                    cache_bits: cache,
                },
            })
        }
        L1Descriptor::Supersection {
            base,
            ap,
            apx,
            xn,
            cache,
        } => {
            // Supersections always belong to domain 0.
            let fault = match access::domain_access(ctx.dacr, 0) {
                DomainAccess::NoAccess => Some(ArmFault::DomainSection),
                DomainAccess::Client if !access::ap_allows(ap, apx, xn, req) => {
                    Some(ArmFault::PermissionSection)
                }
                _ => None,
            };
            Ok(Translation {
                gfn: gpa_to_gfn(base | (gva & 0x00ff_ffff)),
                fault,
                info: MapInfo {
                    domain: 0,
                    ap: replicate_subpage_ap(ap),
                    apx,
                    xn,
                    cache_bits: cache,
                },
            })
        }
        L1Descriptor::Coarse { table_base, domain } => {
            let domain_type = access::domain_access(ctx.dacr, domain);
            let domain_fault =
                (domain_type == DomainAccess::NoAccess).then_some(ArmFault::DomainPage);
            let client = domain_type == DomainAccess::Client;

            let l2_addr = table_base | (((gva >> 12) & 0xff) << 2);
            let l2_raw = mem.read_u32(l2_addr)?;
            trace!("walk {gva:#010x}: l2 entry at {l2_addr:#010x} = {l2_raw:#010x}");

            let (gpa, perm_fault, info) = match L2Descriptor::decode(l2_raw, format) {
                L2Descriptor::Fault => {
                    return Ok(Translation {
                        gfn: invisible_gfn(mem),
                        fault: domain_fault.or(Some(ArmFault::TranslationPage)),
                        info: MapInfo {
                            domain,
                            ..MapInfo::default()
                        },
                    });
                }
                L2Descriptor::Large { .. } => {
                    return ax_err!(Unsupported, "64 KiB guest pages are not supported");
                }
                L2Descriptor::Tiny { .. } => {
                    return ax_err!(Unsupported, "1 KiB guest pages are not supported");
                }
                L2Descriptor::Small {
                    base,
                    subpage_ap,
                    cache,
                } => {
                    if format == PagingFormat::V6Compat && !uniform_subpages(subpage_ap) {
                        warn!("guest uses differing subpage permissions: {subpage_ap:#x}");
                        return ax_err!(
                            InvalidData,
                            "differing subpage permissions are unsupported on this revision"
                        );
                    }
                    let subpage = (gva >> 10) & 0x3;
                    let ap = (subpage_ap >> (2 * subpage)) & 0x3;
                    let denied = client && !access::ap_allows(ap, false, false, req);
                    (
                        base | (gva & 0xfff),
                        denied.then_some(ArmFault::PermissionPage),
                        MapInfo {
                            domain,
                            ap: subpage_ap,
                            apx: false,
                            xn: false,
                            cache_bits: cache,
                        },
                    )
                }
                L2Descriptor::ExtendedSmall {
                    base,
                    ap,
                    apx,
                    xn,
                    cache,
                } => {
                    let denied = client && !access::ap_allows(ap, apx, xn, req);
                    (
                        base | (gva & 0xfff),
                        denied.then_some(ArmFault::PermissionPage),
                        MapInfo {
                            domain,
                            ap: replicate_subpage_ap(ap),
                            apx,
                            xn,
                            cache_bits: cache,
                        },
                    )
                }
            };

            Ok(Translation {
                gfn: gpa_to_gfn(gpa),
                fault: domain_fault.or(perm_fault),
                info,
            })
        }
    }
}

fn uniform_subpages(subpage_ap: u8) -> bool {
    let ap = subpage_ap & 0x3;
    subpage_ap == replicate_subpage_ap(ap)
}

/// Translates a guest virtual address all the way to a host virtual address.
///
/// Fails on any architectural fault, on frames outside registered guest
/// memory, and on walk errors. Used for instruction and operand inspection
/// where a faulting access is simply not readable.
pub fn translate_to_host<M: GuestMemory>(
    ctx: &MmuContext,
    mem: &M,
    gva: GuestVirtAddr,
    req: AccessRequest,
) -> AxResult<HostVirtAddr> {
    let translation = translate(ctx, mem, gva, req)?;
    if translation.fault.is_some() {
        return ax_err!(BadAddress, "guest mapping faults");
    }
    if !mem.is_visible_gfn(translation.gfn) {
        return ax_err!(BadAddress, "frame outside registered guest memory");
    }
    let host = mem
        .gfn_to_host(translation.gfn)
        .ok_or_else(|| ax_err_type!(BadAddress, "guest frame has no host mapping"))?;
    Ok(host + (gva & 0xfff) as usize)
}
