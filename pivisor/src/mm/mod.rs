//! Guest physical memory: the page arena and stage-2 translation.

pub mod palloc;
pub mod stage2;

pub use palloc::{AllocError, PageAllocator};
pub use stage2::{AddressSpace, GuestMemError, GuestMemory, Stage2Entry, Stage2Flags, Stage2MapError};
