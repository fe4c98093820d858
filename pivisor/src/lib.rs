//! A type-2 hypervisor engine for the Raspberry Pi 3.
//!
//! The engine runs at EL2 and multiplexes unmodified EL1 guests over the
//! single Cortex-A53 core: stage-2 translation with demand paging, trap
//! and emulate for the BCM2837 peripherals, a priority scheduler, and a
//! per-guest console multiplexed onto the physical UART.
//!
//! All privileged operations are behind [`basalt::Platform`], so every
//! module here also compiles and runs on a host.

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod console;
pub mod dev;
pub mod fifo;
pub mod hv;
pub mod loader;
pub mod mm;
pub mod sched;
pub mod task;
pub mod timer;
pub mod trap;

#[cfg(test)]
pub mod mock;

pub use hv::Hypervisor;
