//! Stage-2 translation tables and guest-memory access.
//!
//! Each guest owns a three-level table walked from IPA bits 38:12. RAM is
//! mapped on demand when the guest first touches a page. Peripheral pages
//! get a deliberately inaccessible leaf, so every guest device access
//! raises a stage-2 permission fault the trap layer turns into emulation.

use super::palloc::{AllocError, PageAllocator};
use basalt::{Ipa, Pa, PAGE_SIZE};

const LEVEL_SHIFTS: [usize; 3] = [30, 21, 12];
const OA_MASK: u64 = 0x0000_ffff_ffff_f000;

bitflags::bitflags! {
    /// Lower attribute bits of a stage-2 descriptor.
    pub struct Stage2Flags: u64 {
        const VALID = 1 << 0;
        /// Page descriptor at level 3, table descriptor above.
        const PAGE = 1 << 1;
        /// MemAttr[3:0]: normal memory, inner/outer write-back.
        const MEMATTR_NORMAL = 0b1111 << 2;
        const S2AP_READ = 1 << 6;
        const S2AP_WRITE = 1 << 7;
        /// Inner shareable.
        const SH_INNER = 0b11 << 8;
        const AF = 1 << 10;
    }
}

impl Stage2Flags {
    /// Leaf attributes of demand-paged guest RAM.
    pub const NORMAL: Self = Self::from_bits_truncate(
        Self::VALID.bits()
            | Self::PAGE.bits()
            | Self::MEMATTR_NORMAL.bits()
            | Self::S2AP_READ.bits()
            | Self::S2AP_WRITE.bits()
            | Self::SH_INNER.bits()
            | Self::AF.bits(),
    );

    /// Valid leaf with no access permission. Any guest access faults,
    /// which is how peripheral pages reach the device models.
    pub const INACCESSIBLE: Self = Self::from_bits_truncate(
        Self::VALID.bits() | Self::PAGE.bits() | Self::SH_INNER.bits() | Self::AF.bits(),
    );
}

/// One stage-2 descriptor.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Stage2Entry(u64);

impl Stage2Entry {
    pub const fn raw(self) -> u64 {
        self.0
    }

    fn table(pa: Pa) -> Self {
        Self(pa.into_u64() | (Stage2Flags::VALID | Stage2Flags::PAGE).bits())
    }

    fn leaf(pa: Pa, flags: Stage2Flags) -> Self {
        Self((pa.into_u64() & OA_MASK) | flags.bits())
    }

    pub fn is_valid(self) -> bool {
        self.0 & Stage2Flags::VALID.bits() != 0
    }

    /// Output address, bits 47:12.
    pub fn output(self) -> Pa {
        // OA_MASK keeps the value below 1 << 48.
        match Pa::new(self.0 & OA_MASK) {
            Some(pa) => pa,
            None => Pa::ZERO,
        }
    }

    pub fn flags(self) -> Stage2Flags {
        Stage2Flags::from_bits_truncate(self.0)
    }

    /// True when the leaf permits any guest access.
    pub fn accessible(self) -> bool {
        self.0 & (Stage2Flags::S2AP_READ | Stage2Flags::S2AP_WRITE).bits() != 0
    }
}

impl core::fmt::Debug for Stage2Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Stage2Entry(0x{:x})", self.0)
    }
}

/// Errors raised while building stage-2 mappings.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Stage2MapError {
    /// Address is not page aligned.
    Unaligned,
    /// The IPA already has a valid leaf.
    AlreadyMapped,
    /// The frame arena is exhausted.
    OutOfMemory,
}

impl From<AllocError> for Stage2MapError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfMemory => Self::OutOfMemory,
            AllocError::Unaligned => Self::Unaligned,
            // Table frames only come from the same allocator, so the
            // range errors cannot happen on the mapping path.
            AllocError::OutOfRange | AllocError::NotAllocated => Self::OutOfMemory,
        }
    }
}

/// A guest's stage-2 address space.
pub struct AddressSpace {
    root: Pa,
    vmid: u64,
}

impl AddressSpace {
    /// Allocate an empty level-1 root.
    pub fn new(alloc: &mut PageAllocator, vmid: u64) -> Result<Self, Stage2MapError> {
        let root = alloc.alloc()?;
        Ok(Self { root, vmid })
    }

    pub fn root(&self) -> Pa {
        self.root
    }

    pub fn vmid(&self) -> u64 {
        self.vmid
    }

    /// Descend to the level-3 table covering `ipa`, creating intermediate
    /// tables when `create` is set.
    fn level3_table(
        &self,
        alloc: &mut PageAllocator,
        ipa: Ipa,
        create: bool,
    ) -> Result<Option<Pa>, Stage2MapError> {
        let mut table = self.root;
        for shift in &LEVEL_SHIFTS[..2] {
            let idx = ipa.table_index(*shift);
            let entry = Stage2Entry(alloc.table(table)?[idx]);
            table = if entry.is_valid() {
                entry.output()
            } else if create {
                let next = alloc.alloc()?;
                alloc.table_mut(table)?[idx] = Stage2Entry::table(next).raw();
                next
            } else {
                return Ok(None);
            };
        }
        Ok(Some(table))
    }

    /// Install a leaf mapping `ipa` to `pa` with the given attributes.
    pub fn map_page(
        &mut self,
        alloc: &mut PageAllocator,
        ipa: Ipa,
        pa: Pa,
        flags: Stage2Flags,
    ) -> Result<(), Stage2MapError> {
        if ipa.page_offset() != 0 || !pa.is_page_aligned() {
            return Err(Stage2MapError::Unaligned);
        }
        let l3 = match self.level3_table(alloc, ipa, true)? {
            Some(pa) => pa,
            None => return Err(Stage2MapError::OutOfMemory),
        };
        let idx = ipa.table_index(LEVEL_SHIFTS[2]);
        let slot = &mut alloc.table_mut(l3)?[idx];
        if Stage2Entry(*slot).is_valid() {
            return Err(Stage2MapError::AlreadyMapped);
        }
        *slot = Stage2Entry::leaf(pa, flags).raw();
        Ok(())
    }

    /// Mark a page so every guest access to it traps.
    pub fn map_inaccessible(
        &mut self,
        alloc: &mut PageAllocator,
        ipa: Ipa,
    ) -> Result<(), Stage2MapError> {
        self.map_page(alloc, ipa, Pa::ZERO, Stage2Flags::INACCESSIBLE)
    }

    /// Demand-page one frame of RAM at `ipa`.
    pub fn alloc_and_map(
        &mut self,
        alloc: &mut PageAllocator,
        ipa: Ipa,
    ) -> Result<Pa, Stage2MapError> {
        let pa = alloc.alloc()?;
        match self.map_page(alloc, ipa.page_base(), pa, Stage2Flags::NORMAL) {
            Ok(()) => Ok(pa),
            Err(e) => {
                // Mapping never half-installs a leaf, so just give the
                // frame back.
                let _ = alloc.free(pa);
                Err(e)
            }
        }
    }

    /// Find the leaf covering `ipa`, if one is installed.
    pub fn walk(&self, alloc: &mut PageAllocator, ipa: Ipa) -> Option<Stage2Entry> {
        let l3 = self.level3_table(alloc, ipa, false).ok()??;
        let entry = Stage2Entry(alloc.table(l3).ok()?[ipa.table_index(LEVEL_SHIFTS[2])]);
        entry.is_valid().then(|| entry)
    }
}

/// Errors of byte-level guest memory access.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GuestMemError {
    /// No RAM leaf covers this IPA.
    NotMapped(Ipa),
    /// Demand allocation failed while writing.
    Map(Stage2MapError),
}

/// Byte-level view of one guest's RAM through its stage-2 tables.
pub struct GuestMemory<'a> {
    space: &'a mut AddressSpace,
    alloc: &'a mut PageAllocator,
}

impl<'a> GuestMemory<'a> {
    pub fn new(space: &'a mut AddressSpace, alloc: &'a mut PageAllocator) -> Self {
        Self { space, alloc }
    }

    fn frame_of(&mut self, ipa: Ipa) -> Result<Pa, GuestMemError> {
        let entry = self
            .space
            .walk(self.alloc, ipa)
            .filter(|e| e.accessible())
            .ok_or(GuestMemError::NotMapped(ipa))?;
        Ok(entry.output())
    }

    /// Copy bytes out of guest RAM. Fails on the first unmapped page.
    pub fn read_bytes(&mut self, mut ipa: Ipa, mut buf: &mut [u8]) -> Result<(), GuestMemError> {
        while !buf.is_empty() {
            let pa = self.frame_of(ipa)?;
            let off = ipa.page_offset() as usize;
            let n = core::cmp::min(PAGE_SIZE - off, buf.len());
            let page = self.alloc.page(pa).map_err(|_| GuestMemError::NotMapped(ipa))?;
            buf[..n].copy_from_slice(&page[off..off + n]);
            buf = &mut buf[n..];
            ipa = ipa.page_base() + PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Copy bytes into guest RAM. Fails on the first unmapped page.
    pub fn write_bytes(&mut self, mut ipa: Ipa, mut buf: &[u8]) -> Result<(), GuestMemError> {
        while !buf.is_empty() {
            let pa = self.frame_of(ipa)?;
            let off = ipa.page_offset() as usize;
            let n = core::cmp::min(PAGE_SIZE - off, buf.len());
            let page = self
                .alloc
                .page_mut(pa)
                .map_err(|_| GuestMemError::NotMapped(ipa))?;
            page[off..off + n].copy_from_slice(&buf[..n]);
            buf = &buf[n..];
            ipa = ipa.page_base() + PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Copy bytes into guest RAM, demand-paging missing frames. Used by
    /// the loaders to populate a fresh guest image.
    pub fn write_bytes_alloc(&mut self, mut ipa: Ipa, mut buf: &[u8]) -> Result<(), GuestMemError> {
        while !buf.is_empty() {
            if self.space.walk(self.alloc, ipa).is_none() {
                self.space
                    .alloc_and_map(self.alloc, ipa)
                    .map_err(GuestMemError::Map)?;
            }
            let pa = self.frame_of(ipa)?;
            let off = ipa.page_offset() as usize;
            let n = core::cmp::min(PAGE_SIZE - off, buf.len());
            let page = self
                .alloc
                .page_mut(pa)
                .map_err(|_| GuestMemError::NotMapped(ipa))?;
            page[off..off + n].copy_from_slice(&buf[..n]);
            buf = &buf[n..];
            ipa = ipa.page_base() + PAGE_SIZE as u64;
        }
        Ok(())
    }

    pub fn read_u32(&mut self, ipa: Ipa) -> Result<u32, GuestMemError> {
        let mut b = [0u8; 4];
        self.read_bytes(ipa, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_u32(&mut self, ipa: Ipa, val: u32) -> Result<(), GuestMemError> {
        self.write_bytes(ipa, &val.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> (PageAllocator, AddressSpace) {
        let mut alloc = PageAllocator::new(Pa::new(0x40_0000).unwrap(), 128).unwrap();
        let space = AddressSpace::new(&mut alloc, 1).unwrap();
        (alloc, space)
    }

    #[test]
    fn map_then_walk() {
        let (mut alloc, mut space) = world();
        let ipa = Ipa::new(0x8_0000).unwrap();
        let pa = alloc.alloc().unwrap();
        space
            .map_page(&mut alloc, ipa, pa, Stage2Flags::NORMAL)
            .unwrap();
        let entry = space.walk(&mut alloc, ipa + 0x123).unwrap();
        assert_eq!(entry.output(), pa);
        assert!(entry.accessible());
    }

    #[test]
    fn remap_is_rejected() {
        let (mut alloc, mut space) = world();
        let ipa = Ipa::new(0x8_0000).unwrap();
        space.alloc_and_map(&mut alloc, ipa).unwrap();
        assert_eq!(
            space.alloc_and_map(&mut alloc, ipa),
            Err(Stage2MapError::AlreadyMapped)
        );
        // The failed attempt must not leak its frame.
        let used = alloc.used();
        assert_eq!(
            space.alloc_and_map(&mut alloc, ipa),
            Err(Stage2MapError::AlreadyMapped)
        );
        assert_eq!(alloc.used(), used);
    }

    #[test]
    fn unaligned_map_is_rejected() {
        let (mut alloc, mut space) = world();
        let pa = alloc.alloc().unwrap();
        assert_eq!(
            space.map_page(
                &mut alloc,
                Ipa::new(0x8_0010).unwrap(),
                pa,
                Stage2Flags::NORMAL
            ),
            Err(Stage2MapError::Unaligned)
        );
    }

    #[test]
    fn inaccessible_leaf_is_valid_but_faults() {
        let (mut alloc, mut space) = world();
        let ipa = Ipa::new(0x3f20_1000).unwrap();
        space.map_inaccessible(&mut alloc, ipa).unwrap();
        let entry = space.walk(&mut alloc, ipa).unwrap();
        assert!(entry.is_valid());
        assert!(!entry.accessible());
        assert_eq!(entry.output(), Pa::ZERO);
    }

    #[test]
    fn distant_ipas_use_separate_tables() {
        let (mut alloc, mut space) = world();
        let lo = Ipa::new(0x0).unwrap();
        let hi = Ipa::new(0x3fff_f000).unwrap();
        space.alloc_and_map(&mut alloc, lo).unwrap();
        space.alloc_and_map(&mut alloc, hi).unwrap();
        assert!(space.walk(&mut alloc, lo).is_some());
        assert!(space.walk(&mut alloc, hi).is_some());
        assert!(space.walk(&mut alloc, Ipa::new(0x2000_0000).unwrap()).is_none());
    }

    #[test]
    fn guest_memory_crosses_pages() {
        let (mut alloc, mut space) = world();
        let ipa = Ipa::new(0x8_0ff0).unwrap();
        let data: Vec<u8> = (0..64u8).collect();
        {
            let mut mem = GuestMemory::new(&mut space, &mut alloc);
            mem.write_bytes_alloc(ipa, &data).unwrap();
            let mut back = vec![0u8; 64];
            mem.read_bytes(ipa, &mut back).unwrap();
            assert_eq!(back, data);
        }
        // The span straddles a page boundary.
        assert!(space.walk(&mut alloc, ipa).is_some());
        assert!(space.walk(&mut alloc, ipa + 0x1000).is_some());
    }

    #[test]
    fn unmapped_read_reports_address() {
        let (mut alloc, mut space) = world();
        let ipa = Ipa::new(0x9_0000).unwrap();
        let mut mem = GuestMemory::new(&mut space, &mut alloc);
        let mut b = [0u8; 4];
        assert_eq!(mem.read_bytes(ipa, &mut b), Err(GuestMemError::NotMapped(ipa)));
    }
}
