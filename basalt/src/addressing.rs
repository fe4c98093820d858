//! Address spaces of a two-stage translation world.
//!
//! A guest runs with three kinds of addresses in flight: the guest virtual
//! address ([`Gva`]) it computes with, the intermediate physical address
//! ([`Ipa`]) its own stage-1 tables produce, and the host physical address
//! ([`Pa`]) the hypervisor's stage-2 tables finally resolve to. Mixing them
//! up is the classic hypervisor bug, so each gets its own newtype.

/// Page size of the 4KB translation granule.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get the page frame of an address.
pub const PAGE_SHIFT: usize = 12;
/// log2 of the number of entries per translation table.
pub const TABLE_SHIFT: usize = 9;
/// Entries per translation table level.
pub const PTRS_PER_TABLE: usize = 1 << TABLE_SHIFT;
/// Mask for the in-page offset bits.
pub const PAGE_MASK: u64 = 0xfff;

/// Host physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(u64);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a range check.
    #[inline]
    pub const fn new(addr: u64) -> Option<Self> {
        if addr < 1 << 48 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Round down to the containing page boundary.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// True if this address is page aligned.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

/// Intermediate (guest) physical address, the input of stage-2 translation.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Ipa(u64);

impl Ipa {
    /// Create a new intermediate physical address with a range check.
    #[inline]
    pub const fn new(addr: u64) -> Option<Self> {
        if addr < 1 << 48 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Round down to the containing page boundary.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// In-page offset bits.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    /// Table index for a level with the given shift.
    #[inline]
    pub const fn table_index(self, shift: usize) -> usize {
        ((self.0 >> shift) as usize) & (PTRS_PER_TABLE - 1)
    }
}

/// Guest virtual address, resolved by the guest's own stage-1 tables.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gva(u64);

impl Gva {
    /// Create a new guest virtual address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// In-page offset bits.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u64> for $t {
            type Output = Self;

            fn add(self, other: u64) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<u64> for $t {
            fn add_assign(&mut self, other: u64) {
                self.0 += other;
            }
        }
        impl core::ops::Sub<u64> for $t {
            type Output = Self;

            fn sub(self, other: u64) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = u64;

            fn sub(self, other: $t) -> u64 {
                self.0 - other.0
            }
        }
        impl core::ops::BitAnd<u64> for $t {
            type Output = Self;

            fn bitand(self, other: u64) -> Self {
                Self(self.0 & other)
            }
        }
        impl core::ops::BitOr<u64> for $t {
            type Output = Self;

            fn bitor(self, other: u64) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($t), "(0x{:x})"), self.0)
            }
        }
    };
}

impl_arith!(Pa);
impl_arith!(Ipa);
impl_arith!(Gva);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_arith() {
        let ipa = Ipa::new(0x3f00_3010).unwrap();
        assert_eq!(ipa.page_base().into_u64(), 0x3f00_3000);
        assert_eq!(ipa.page_offset(), 0x10);
        assert_eq!(ipa.table_index(12), 3);
        assert_eq!(ipa.table_index(21), (0x3f00_3010u64 >> 21) as usize & 511);
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(Pa::new(1 << 48).is_none());
        assert!(Pa::new((1 << 48) - 1).is_some());
    }
}
