use axerrno::AxError;

use crate::access::{AccessKind, AccessRequest};
use crate::context::{ArchRevision, MmuContext};
use crate::descriptor::encode_extended_small;
use crate::fault::ArmFault;
use crate::hal::GuestMemory;
use crate::tests::mock::TestGuestMemory;
use crate::walker::{translate, translate_to_host};

const L1_BASE: u32 = 0x8000;
const L2_BASE: u32 = 0x4000;

/// 4 MiB of guest RAM at guest physical zero.
fn guest_ram() -> TestGuestMemory {
    TestGuestMemory::new(1024)
}

fn v6_ctx(extended: bool) -> MmuContext {
    MmuContext {
        ttbr0: L1_BASE,
        dacr: 0b01,
        mmu_enabled: true,
        extended_paging: extended,
        revision: ArchRevision::V6,
        ..MmuContext::default()
    }
}

fn set_l1(mem: &TestGuestMemory, gva: u32, word: u32) {
    mem.write_u32(L1_BASE + (gva >> 20) * 4, word);
}

fn set_l2(mem: &TestGuestMemory, gva: u32, word: u32) {
    mem.write_u32(L2_BASE + ((gva >> 12) & 0xff) * 4, word);
}

fn section(base: u32, domain: u32, ap: u32) -> u32 {
    base | ap << 10 | domain << 5 | 0xc | 0b10
}

fn coarse(table: u32, domain: u32) -> u32 {
    table | domain << 5 | 0b01
}

fn small(base: u32, subpage_ap: u32) -> u32 {
    base | subpage_ap << 4 | 0xc | 0b10
}

const PRIV_READ: AccessRequest = AccessRequest::privileged(AccessKind::Read);
const PRIV_WRITE: AccessRequest = AccessRequest::privileged(AccessKind::Write);
const USER_WRITE: AccessRequest = AccessRequest::user(AccessKind::Write);

#[test]
fn mmu_disabled_is_identity() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(true);
    ctx.mmu_enabled = false;

    let translation = translate(&ctx, &mem, 0x1234_5678, USER_WRITE).unwrap();
    assert_eq!(translation.gfn, 0x12345);
    assert_eq!(translation.fault, None);
    assert_eq!(translation.info.ap, 0xff);
}

#[test]
fn section_translation() {
    let mem = guest_ram();
    let ctx = v6_ctx(true);
    set_l1(&mem, 0x1234_5678, section(0x0030_0000, 0, 0b11));

    let translation = translate(&ctx, &mem, 0x1234_5678, USER_WRITE).unwrap();
    assert_eq!(translation.fault, None);
    assert_eq!(translation.gfn, 0x345);
    assert_eq!(translation.info.domain, 0);
    assert_eq!(translation.info.ap, 0xff);
    assert_eq!(translation.info.cache_bits, 0xc);
}

#[test]
fn section_domain_fault_still_resolves_the_frame() {
    let mem = guest_ram();
    let ctx = v6_ctx(true); // domain 5 is not configured, so no access
    set_l1(&mem, 0x1234_5678, section(0x0030_0000, 5, 0b11));

    let translation = translate(&ctx, &mem, 0x1234_5678, PRIV_READ).unwrap();
    assert_eq!(translation.fault, Some(ArmFault::DomainSection));
    assert_eq!(translation.gfn, 0x345);
    assert_eq!(translation.info.domain, 5);
}

#[test]
fn section_permission_fault() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(true);
    ctx.dacr = 0b01 << 10; // domain 5 client
    set_l1(&mem, 0x1234_5678, section(0x0030_0000, 5, 0b01));

    let denied = translate(&ctx, &mem, 0x1234_5678, USER_WRITE).unwrap();
    assert_eq!(denied.fault, Some(ArmFault::PermissionSection));

    let allowed = translate(&ctx, &mem, 0x1234_5678, PRIV_WRITE).unwrap();
    assert_eq!(allowed.fault, None);
}

#[test]
fn manager_domain_ignores_ap_bits() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(true);
    ctx.dacr = 0b11 << 10;
    set_l1(&mem, 0x1234_5678, section(0x0030_0000, 5, 0b00));

    let translation = translate(&ctx, &mem, 0x1234_5678, USER_WRITE).unwrap();
    assert_eq!(translation.fault, None);
}

#[test]
fn l1_fault_yields_invisible_frame() {
    let mem = guest_ram();
    let ctx = v6_ctx(true);

    let translation = translate(&ctx, &mem, 0x1234_5678, PRIV_READ).unwrap();
    assert_eq!(translation.fault, Some(ArmFault::TranslationSection));
    assert!(!mem.is_visible_gfn(translation.gfn));
}

#[test]
fn small_page_translation() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(false); // v6 compat, subpage fields
    ctx.dacr = 0b01 << 6;
    set_l1(&mem, 0x1234_5678, coarse(L2_BASE, 3));
    // Kernel read-write, user no access, on all four subpages.
    set_l2(&mem, 0x1234_5678, small(0x0020_0000, 0x55));

    let denied = translate(&ctx, &mem, 0x1234_5678, USER_WRITE).unwrap();
    assert_eq!(denied.fault, Some(ArmFault::PermissionPage));

    let allowed = translate(&ctx, &mem, 0x1234_5678, PRIV_WRITE).unwrap();
    assert_eq!(allowed.fault, None);
    assert_eq!(allowed.gfn, 0x200);
    assert_eq!(allowed.info.domain, 3);
    assert_eq!(allowed.info.ap, 0x55);
}

#[test]
fn domain_fault_preempts_permission_fault() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(false);
    ctx.dacr = 0; // domain 3 locked out
    set_l1(&mem, 0x1234_5678, coarse(L2_BASE, 3));
    set_l2(&mem, 0x1234_5678, small(0x0020_0000, 0x55));

    let translation = translate(&ctx, &mem, 0x1234_5678, USER_WRITE).unwrap();
    assert_eq!(translation.fault, Some(ArmFault::DomainPage));
}

#[test]
fn l2_fault() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(false);
    ctx.dacr = 0b01 << 6;
    set_l1(&mem, 0x1234_5678, coarse(L2_BASE, 3));

    let translation = translate(&ctx, &mem, 0x1234_5678, PRIV_READ).unwrap();
    assert_eq!(translation.fault, Some(ArmFault::TranslationPage));
    assert!(!mem.is_visible_gfn(translation.gfn));

    // With the domain locked out as well, the domain fault wins.
    ctx.dacr = 0;
    let translation = translate(&ctx, &mem, 0x1234_5678, PRIV_READ).unwrap();
    assert_eq!(translation.fault, Some(ArmFault::DomainPage));
}

#[test]
fn differing_subpages_rejected_on_v6() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(false);
    ctx.dacr = 0b01 << 6;
    set_l1(&mem, 0x1234_5678, coarse(L2_BASE, 3));
    // Subpage 1 read-write for everyone, the rest kernel-only.
    set_l2(&mem, 0x1234_5678, small(0x0020_0000, 0x5d));

    assert_eq!(
        translate(&ctx, &mem, 0x1234_5678, PRIV_READ).unwrap_err(),
        AxError::InvalidData
    );
}

#[test]
fn differing_subpages_honored_on_v5() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(false);
    ctx.revision = ArchRevision::V5;
    ctx.dacr = 0b01 << 6;
    set_l1(&mem, 0x1234_5678, coarse(L2_BASE, 3));
    set_l2(&mem, 0x1234_5678, small(0x0020_0000, 0x5d));

    // gva bits 11:10 select the subpage: 0x...400 hits subpage 1.
    let rw = translate(&ctx, &mem, 0x1234_5478, USER_WRITE).unwrap();
    assert_eq!(rw.fault, None);
    let denied = translate(&ctx, &mem, 0x1234_5078, USER_WRITE).unwrap();
    assert_eq!(denied.fault, Some(ArmFault::PermissionPage));
}

#[test]
fn extended_small_execute_never() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(true);
    ctx.dacr = 0b01 << 6;
    set_l1(&mem, 0x1234_5678, coarse(L2_BASE, 3));
    set_l2(&mem, 0x1234_5678, encode_extended_small(0x222, 0b11, false, true, false));

    let exec = translate(
        &ctx,
        &mem,
        0x1234_5678,
        AccessRequest::privileged(AccessKind::Execute),
    )
    .unwrap();
    assert_eq!(exec.fault, Some(ArmFault::PermissionPage));

    let read = translate(&ctx, &mem, 0x1234_5678, PRIV_READ).unwrap();
    assert_eq!(read.fault, None);
    assert_eq!(read.gfn, 0x222);
}

#[test]
fn large_pages_are_unshadowable() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(true);
    ctx.dacr = 0b01 << 6;
    set_l1(&mem, 0x1234_5678, coarse(L2_BASE, 3));
    set_l2(&mem, 0x1234_5678, 0x0031_0000 | 0b01);

    assert_eq!(
        translate(&ctx, &mem, 0x1234_5678, PRIV_READ).unwrap_err(),
        AxError::Unsupported
    );
}

#[test]
fn ttbcr_splits_the_address_space() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(true);
    ctx.ttbcr_n = 1;
    ctx.ttbr1 = 0x10000;

    set_l1(&mem, 0x1234_5678, section(0x0030_0000, 0, 0b11));
    mem.write_u32(0x10000 + (0x8123_4567 >> 20) * 4, section(0x0010_0000, 0, 0b11));

    let low = translate(&ctx, &mem, 0x1234_5678, PRIV_READ).unwrap();
    assert_eq!(low.gfn, 0x345);
    let high = translate(&ctx, &mem, 0x8123_4567, PRIV_READ).unwrap();
    assert_eq!(high.gfn, 0x134);
}

#[test]
fn supersection_translation() {
    let mem = guest_ram();
    let ctx = v6_ctx(false);
    set_l1(&mem, 0x1234_5678, 0x0100_0000 | 1 << 18 | 0b11 << 10 | 0b10);

    let translation = translate(&ctx, &mem, 0x1234_5678, USER_WRITE).unwrap();
    assert_eq!(translation.fault, None);
    assert_eq!(translation.gfn, 0x1345);
    assert_eq!(translation.info.domain, 0);
}

#[test]
fn table_outside_guest_memory_is_a_hard_error() {
    let mem = guest_ram();
    let mut ctx = v6_ctx(true);
    ctx.ttbr0 = 0x0040_0000; // past the end of RAM

    assert!(translate(&ctx, &mem, 0x1234_5678, PRIV_READ).is_err());
}

#[test]
fn host_translation() {
    let mem = guest_ram();
    let ctx = v6_ctx(true);
    set_l1(&mem, 0x0010_2000, section(0x0030_0000, 0, 0b11));

    let host = translate_to_host(&ctx, &mem, 0x0010_2304, PRIV_READ).unwrap();
    assert_eq!(host, mem.gfn_to_host(0x302).unwrap() + 0x304);

    // A faulting mapping is not readable.
    assert_eq!(
        translate_to_host(&ctx, &mem, 0x4000_0000, PRIV_READ).unwrap_err(),
        AxError::BadAddress
    );
}
