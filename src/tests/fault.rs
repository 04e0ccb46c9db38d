use crate::fault::{ArmFault, FaultState, PendingExceptions};

#[test]
fn fsr_codes() {
    assert_eq!(ArmFault::TranslationSection as u32, 0x5);
    assert_eq!(ArmFault::DomainPage as u32, 0xb);
    assert_eq!(ArmFault::PermissionPage as u32, 0xf);
    assert_eq!(ArmFault::try_from(0x9), Ok(ArmFault::DomainSection));
    assert!(ArmFault::try_from(0x2).is_err());
}

#[test]
fn granularity() {
    assert!(ArmFault::TranslationPage.is_page_granular());
    assert!(ArmFault::DomainPage.is_page_granular());
    assert!(ArmFault::PermissionPage.is_page_granular());
    assert!(!ArmFault::TranslationSection.is_page_granular());
    assert!(!ArmFault::Alignment.is_page_granular());
}

#[test]
fn data_abort_injection() {
    let mut state = FaultState::default();
    state.inject_mmu_fault(0x1234_5678, ArmFault::PermissionSection, 3, false);
    assert_eq!(state.far, 0x1234_5678);
    assert_eq!(state.dfsr, 0x3d);
    assert_eq!(state.ifsr, 0);
    assert_eq!(state.pending, PendingExceptions::DATA_ABORT);
}

#[test]
fn prefetch_abort_carries_no_address() {
    let mut state = FaultState::default();
    state.inject_mmu_fault(0x1234_5678, ArmFault::TranslationPage, 0, true);
    assert_eq!(state.far, 0);
    assert_eq!(state.dfsr, 0);
    assert_eq!(state.ifsr, 0x7);
    assert_eq!(state.pending, PendingExceptions::PREFETCH_ABORT);
}

#[test]
fn aborts_accumulate() {
    let mut state = FaultState::default();
    state.inject_mmu_fault(0x1000, ArmFault::DomainSection, 5, false);
    state.inject_mmu_fault(0x2000, ArmFault::TranslationSection, 0, true);
    assert_eq!(state.dfsr, 0x59);
    assert_eq!(state.ifsr, 0x5);
    assert_eq!(
        state.pending,
        PendingExceptions::DATA_ABORT | PendingExceptions::PREFETCH_ABORT
    );
}
