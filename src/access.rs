//! Domain and access-permission resolution.
//!
//! Legacy VMSA gates every mapping twice: the level-1 descriptor names one of
//! 16 domains whose class comes from the DACR, and only Client-class domains
//! fall through to the per-page AP bits. The hypervisor reserves domain 15
//! for its own pages so the guest can never lock it out of the shadow table.

use axerrno::{AxResult, ax_err};

/// Domain number reserved for hypervisor-owned mappings (shared page and
/// exception vectors). The guest's own setting for this domain is overridden.
pub const SPECIAL_DOMAIN: u8 = 15;

/// Class of a domain as configured in the DACR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainAccess {
    /// Every access faults, regardless of AP bits.
    NoAccess,
    /// Accesses are checked against the page's AP bits.
    Client,
    /// Every access succeeds, AP bits are ignored.
    Manager,
}

/// Effective access a mapping grants at one privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApPerm {
    None,
    ReadOnly,
    ReadWrite,
}

/// What the guest instruction is trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// A requested guest access: operation plus originating privilege level.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest {
    /// Access comes from user mode (not a privileged CPU mode).
    pub user: bool,
    pub kind: AccessKind,
}

impl AccessRequest {
    pub const fn user(kind: AccessKind) -> Self {
        Self { user: true, kind }
    }

    pub const fn privileged(kind: AccessKind) -> Self {
        Self { user: false, kind }
    }
}

/// Looks up the class of `domain` in a DACR value.
///
/// The reserved encoding 0b10 denies access, like NoAccess.
pub fn domain_access(dacr: u32, domain: u8) -> DomainAccess {
    debug_assert!(domain < 16);
    match (dacr >> (2 * domain as u32)) & 0x3 {
        0b01 => DomainAccess::Client,
        0b11 => DomainAccess::Manager,
        _ => DomainAccess::NoAccess,
    }
}

/// DACR value the shadow mappings are judged against: the guest's own
/// register with [`SPECIAL_DOMAIN`] forced to Client, so hypervisor pages
/// obey their explicit AP bits no matter what the guest wrote there.
pub fn effective_dacr(guest_dacr: u32) -> u32 {
    (guest_dacr & 0x3fff_ffff) | 0b01 << (2 * SPECIAL_DOMAIN as u32)
}

/// Decodes a 2-bit AP field (plus APX) into the permission granted at the
/// given privilege level.
pub fn decode_ap(ap: u8, apx: bool, user: bool) -> ApPerm {
    match (apx, ap & 0x3) {
        (false, 0b00) => ApPerm::None,
        (false, 0b01) => {
            if user {
                ApPerm::None
            } else {
                ApPerm::ReadWrite
            }
        }
        (false, 0b10) => {
            if user {
                ApPerm::ReadOnly
            } else {
                ApPerm::ReadWrite
            }
        }
        (false, _) => ApPerm::ReadWrite,
        // APX set: read-only encodings. 0b00 is reserved and denies.
        (true, 0b00) => ApPerm::None,
        (true, 0b01) => {
            if user {
                ApPerm::None
            } else {
                ApPerm::ReadOnly
            }
        }
        (true, _) => ApPerm::ReadOnly,
    }
}

/// Whether AP bits permit `req` on a Client-domain page.
///
/// Execute requests fold into read checks, but only when the mapping is not
/// execute-never.
pub fn ap_allows(ap: u8, apx: bool, xn: bool, req: AccessRequest) -> bool {
    let perm = decode_ap(ap, apx, req.user);
    match req.kind {
        AccessKind::Read => perm != ApPerm::None,
        AccessKind::Write => perm == ApPerm::ReadWrite,
        AccessKind::Execute => !xn && perm != ApPerm::None,
    }
}

/// Converts an explicit (privileged, user) permission pair into the AP/APX
/// encoding for a shadow entry.
///
/// Rejects pairs the hardware cannot express: user rights exceeding
/// privileged rights, privileged read-only with user read-write, and any
/// privileged read-only mapping when the extended format is unavailable.
pub fn encode_ap(priv_ap: ApPerm, user_ap: ApPerm, extended: bool) -> AxResult<(u8, bool)> {
    if priv_ap == ApPerm::None && user_ap != ApPerm::None {
        return ax_err!(InvalidInput, "user access without privileged access");
    }
    if extended {
        if priv_ap == ApPerm::ReadOnly && user_ap == ApPerm::ReadWrite {
            return ax_err!(InvalidInput, "user rights exceed privileged rights");
        }
    } else if priv_ap == ApPerm::ReadOnly {
        return ax_err!(
            InvalidInput,
            "privileged read-only requires the extended page table format"
        );
    }
    Ok(match (priv_ap, user_ap) {
        (ApPerm::None, _) => (0b00, false),
        (ApPerm::ReadWrite, ApPerm::None) => (0b01, false),
        (ApPerm::ReadWrite, ApPerm::ReadOnly) => (0b10, false),
        (ApPerm::ReadWrite, ApPerm::ReadWrite) => (0b11, false),
        (ApPerm::ReadOnly, ApPerm::None) => (0b01, true),
        (ApPerm::ReadOnly, _) => (0b10, true),
    })
}

/// Folds a guest domain into explicit AP bits.
///
/// Used when a guest mapping lands in the same 1 MiB section as a special
/// region: the section's domain is taken over by [`SPECIAL_DOMAIN`], so the
/// guest's intended domain semantics must be baked into the AP bits instead.
pub fn domain_to_ap(dacr: u32, domain: u8, ap: u8, apx: bool) -> (u8, bool) {
    match domain_access(dacr, domain) {
        DomainAccess::NoAccess => (0b00, false),
        DomainAccess::Manager => (0b11, false),
        DomainAccess::Client => (ap, apx),
    }
}

/// Whether the guest could currently write through a shadow mapping with the
/// given domain and AP bits. Drives the dirty/clean hint when a pinned guest
/// page is released.
pub fn is_guest_writable(guest_dacr: u32, domain: u8, ap: u8, apx: bool) -> bool {
    match domain_access(effective_dacr(guest_dacr), domain) {
        DomainAccess::Manager => true,
        DomainAccess::Client => decode_ap(ap, apx, false) == ApPerm::ReadWrite,
        DomainAccess::NoAccess => false,
    }
}
