//! Guest image loaders.
//!
//! A loader populates a fresh task's RAM through its stage-2 view and
//! reports the register state the guest boots with. Images come either
//! from an in-memory buffer or from a [`FileSystem`] backend such as the
//! SD card driver.

use alloc::string::String;
use alloc::vec::Vec;

use crate::mm::{GuestMemError, GuestMemory};
use basalt::Ipa;

/// Where a Linux kernel image is placed, per the arm64 boot protocol.
pub const KERNEL_LOAD_ADDR: u64 = 0x8_0000;
/// Where the flattened device tree is placed.
pub const DTB_LOAD_ADDR: u64 = 0x2000_0000;

#[derive(Debug)]
pub enum LoadError {
    /// The backing store has no such file.
    NotFound(String),
    /// The image does not fit or RAM ran out.
    Memory(GuestMemError),
    /// The load or entry address is outside the guest's address range.
    BadAddress(u64),
}

impl From<GuestMemError> for LoadError {
    fn from(e: GuestMemError) -> Self {
        Self::Memory(e)
    }
}

/// Register state a freshly loaded guest starts from.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub pc: u64,
    pub sp: u64,
    /// Initial x0, the DTB pointer for Linux guests.
    pub x0: u64,
}

/// Source of guest images.
pub trait FileSystem {
    fn read_file(&mut self, name: &str) -> Result<Vec<u8>, LoadError>;
}

/// Populates one guest and names its entry state.
pub trait Loader {
    fn load(&mut self, mem: &mut GuestMemory<'_>) -> Result<BootInfo, LoadError>;
}

fn checked_ipa(addr: u64) -> Result<Ipa, LoadError> {
    Ipa::new(addr).ok_or(LoadError::BadAddress(addr))
}

/// Flat binary dropped at a fixed address.
#[derive(Debug)]
pub struct RawBinaryLoader {
    image: Vec<u8>,
    load_addr: u64,
    entry: u64,
    sp: u64,
}

impl RawBinaryLoader {
    pub fn new(image: Vec<u8>, load_addr: u64, entry: u64, sp: u64) -> Self {
        Self {
            image,
            load_addr,
            entry,
            sp,
        }
    }

    pub fn from_fs(
        fs: &mut dyn FileSystem,
        name: &str,
        load_addr: u64,
        entry: u64,
        sp: u64,
    ) -> Result<Self, LoadError> {
        Ok(Self::new(fs.read_file(name)?, load_addr, entry, sp))
    }
}

impl Loader for RawBinaryLoader {
    fn load(&mut self, mem: &mut GuestMemory<'_>) -> Result<BootInfo, LoadError> {
        mem.write_bytes_alloc(checked_ipa(self.load_addr)?, &self.image)?;
        Ok(BootInfo {
            pc: self.entry,
            sp: self.sp,
            x0: 0,
        })
    }
}

/// arm64 Linux kernel plus device tree.
pub struct LinuxLoader {
    kernel: Vec<u8>,
    dtb: Vec<u8>,
}

impl LinuxLoader {
    pub fn new(kernel: Vec<u8>, dtb: Vec<u8>) -> Self {
        Self { kernel, dtb }
    }

    pub fn from_fs(
        fs: &mut dyn FileSystem,
        kernel_name: &str,
        dtb_name: &str,
    ) -> Result<Self, LoadError> {
        Ok(Self::new(fs.read_file(kernel_name)?, fs.read_file(dtb_name)?))
    }
}

impl Loader for LinuxLoader {
    fn load(&mut self, mem: &mut GuestMemory<'_>) -> Result<BootInfo, LoadError> {
        mem.write_bytes_alloc(checked_ipa(KERNEL_LOAD_ADDR)?, &self.kernel)?;
        mem.write_bytes_alloc(checked_ipa(DTB_LOAD_ADDR)?, &self.dtb)?;
        Ok(BootInfo {
            pc: KERNEL_LOAD_ADDR,
            // The kernel sets up its own stack.
            sp: 0,
            x0: DTB_LOAD_ADDR,
        })
    }
}
