//! Bit-level codec for VMSA translation table descriptors.
//!
//! Decoding classifies raw guest descriptor words into tagged variants; the
//! walker never touches type bits itself. Encoding builds the level-1/level-2
//! words installed into shadow tables, and those are walked by real hardware,
//! so every bit position here is load-bearing.

use axerrno::{AxResult, ax_err};
use bit_field::BitField;

use crate::addr::GuestPhysAddr;

/// Descriptor format selected by CPU revision and the CP15 XP bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingFormat {
    /// VMSAv5: 8-bit subpage AP fields, tiny pages.
    V5,
    /// VMSAv6 with XP clear: v5-compatible encodings plus supersections.
    V6Compat,
    /// VMSAv6 with XP set: 2-bit AP plus APX, XN on small pages.
    V6Extended,
}

/// A decoded level-1 descriptor (one per 1 MiB of guest address space).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L1Descriptor {
    /// No mapping; any access raises a section translation fault.
    Fault,
    /// Pointer to a 1 KiB level-2 (coarse) table.
    Coarse {
        /// Physical base of the level-2 table (1 KiB aligned).
        table_base: GuestPhysAddr,
        /// Domain the whole 1 MiB region belongs to.
        domain: u8,
    },
    /// Direct 1 MiB mapping.
    Section {
        base: GuestPhysAddr,
        domain: u8,
        ap: u8,
        apx: bool,
        xn: bool,
        cache: u8,
    },
    /// Direct 16 MiB mapping (VMSAv6). Always domain 0.
    Supersection {
        base: GuestPhysAddr,
        ap: u8,
        apx: bool,
        xn: bool,
        cache: u8,
    },
}

/// A decoded level-2 descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Descriptor {
    /// No mapping; any access raises a page translation fault.
    Fault,
    /// 64 KiB page. Recognized but never shadowed.
    Large { base: GuestPhysAddr },
    /// 4 KiB page with four 2-bit subpage AP fields (v5-compatible formats).
    Small {
        base: GuestPhysAddr,
        /// AP fields for subpages 0..3, two bits each, subpage 0 lowest.
        subpage_ap: u8,
        cache: u8,
    },
    /// 4 KiB page with a single AP field (and APX/XN in extended format).
    ExtendedSmall {
        base: GuestPhysAddr,
        ap: u8,
        apx: bool,
        xn: bool,
        cache: u8,
    },
    /// 1 KiB page (VMSAv5 only). Recognized but never shadowed.
    Tiny { base: GuestPhysAddr },
}

const TYPE_MASK: u32 = 0x3;

const L1_COARSE_MASK: u32 = !0x3ff;
const L1_SECTION_BASE_MASK: u32 = 0xfff0_0000;
const L1_SUPERSECTION_BASE_MASK: u32 = 0xff00_0000;
pub(crate) const L1_DOMAIN_SHIFT: u32 = 5;
pub(crate) const L1_DOMAIN_MASK: u32 = 0xf << L1_DOMAIN_SHIFT;

const L2_SMALL_BASE_MASK: u32 = 0xffff_f000;
const L2_LARGE_BASE_MASK: u32 = 0xffff_0000;
const L2_TINY_BASE_MASK: u32 = 0xffff_fc00;

/// TEX and C/B bits folded into one byte: C/B at bits 2..3, TEX at bits 4..6.
fn l1_cache_bits(raw: u32) -> u8 {
    ((raw & 0xc) | ((raw >> 8) & 0x70)) as u8
}

fn l2_cache_bits(raw: u32) -> u8 {
    ((raw & 0xc) | ((raw >> 2) & 0x70)) as u8
}

impl L1Descriptor {
    /// Classifies a raw level-1 word.
    ///
    /// Fine page tables (type 0b11) and supersections with non-zero extended
    /// base bits (a >32-bit physical address space) are hard errors: the
    /// walk cannot continue and no architectural fault describes them.
    pub fn decode(raw: u32, format: PagingFormat) -> AxResult<Self> {
        match raw & TYPE_MASK {
            0b00 => Ok(Self::Fault),
            0b01 => Ok(Self::Coarse {
                table_base: raw & L1_COARSE_MASK,
                domain: raw.get_bits(5..=8) as u8,
            }),
            0b10 => {
                let extended = format == PagingFormat::V6Extended;
                let supersection = format != PagingFormat::V5 && raw.get_bit(18);
                let ap = raw.get_bits(10..=11) as u8;
                let apx = extended && raw.get_bit(15);
                let xn = extended && raw.get_bit(4);
                let cache = l1_cache_bits(raw);
                if supersection {
                    if raw.get_bits(20..=23) != 0 || raw.get_bits(5..=8) != 0 {
                        return ax_err!(
                            Unsupported,
                            "supersection maps beyond a 32-bit physical address space"
                        );
                    }
                    Ok(Self::Supersection {
                        base: raw & L1_SUPERSECTION_BASE_MASK,
                        ap,
                        apx,
                        xn,
                        cache,
                    })
                } else {
                    Ok(Self::Section {
                        base: raw & L1_SECTION_BASE_MASK,
                        domain: raw.get_bits(5..=8) as u8,
                        ap,
                        apx,
                        xn,
                        cache,
                    })
                }
            }
            _ => ax_err!(Unsupported, "fine page tables are not supported"),
        }
    }

    /// Domain of this descriptor; supersections are architecturally domain 0.
    pub fn domain(&self) -> Option<u8> {
        match *self {
            Self::Fault => None,
            Self::Coarse { domain, .. } | Self::Section { domain, .. } => Some(domain),
            Self::Supersection { .. } => Some(0),
        }
    }
}

impl L2Descriptor {
    /// Classifies a raw level-2 word. Infallible: every bit pattern means
    /// something in every format, even if what it means is "unshadowable".
    pub fn decode(raw: u32, format: PagingFormat) -> Self {
        match (raw & TYPE_MASK, format) {
            (0b00, _) => Self::Fault,
            (0b01, _) => Self::Large {
                base: raw & L2_LARGE_BASE_MASK,
            },
            // XP set: bit 1 selects an extended small page, bit 0 is XN.
            (_, PagingFormat::V6Extended) => Self::ExtendedSmall {
                base: raw & L2_SMALL_BASE_MASK,
                ap: raw.get_bits(4..=5) as u8,
                apx: raw.get_bit(9),
                xn: raw.get_bit(0),
                cache: l2_cache_bits(raw),
            },
            (0b10, _) => Self::Small {
                base: raw & L2_SMALL_BASE_MASK,
                subpage_ap: raw.get_bits(4..=11) as u8,
                cache: (raw & 0xc) as u8,
            },
            (_, PagingFormat::V6Compat) => Self::ExtendedSmall {
                base: raw & L2_SMALL_BASE_MASK,
                ap: raw.get_bits(4..=5) as u8,
                apx: false,
                xn: false,
                cache: l2_cache_bits(raw),
            },
            (_, PagingFormat::V5) => Self::Tiny {
                base: raw & L2_TINY_BASE_MASK,
            },
        }
    }
}

/// Replicates a 2-bit AP field across all four subpage slots.
pub fn replicate_subpage_ap(ap: u8) -> u8 {
    let ap = ap & 0x3;
    ap | ap << 2 | ap << 4 | ap << 6
}

/// Builds a level-1 coarse entry pointing at a shadow level-2 table.
pub fn encode_coarse(table_base: u32, domain: u8) -> u32 {
    (table_base & L1_COARSE_MASK) | ((domain as u32 & 0xf) << L1_DOMAIN_SHIFT) | 0b01
}

/// Builds a v5-compatible small page entry for a shadow table.
///
/// Shadow mappings are always normal write-back memory (C/B set); the guest's
/// own cacheability hints are not propagated.
pub fn encode_small(pfn: u32, subpage_ap: u8) -> u32 {
    (pfn << 12) | ((subpage_ap as u32) << 4) | 0xc | 0b10
}

/// Builds an extended small page entry for a shadow table.
pub fn encode_extended_small(pfn: u32, ap: u8, apx: bool, xn: bool, ng: bool) -> u32 {
    let mut raw = (pfn << 12) | 0b10;
    raw.set_bit(0, xn);
    raw |= 0xc; // normal memory, write-back, TEX = 0
    raw.set_bits(4..=5, ap as u32 & 0x3);
    raw.set_bit(9, apx);
    raw.set_bit(11, ng);
    raw
}
