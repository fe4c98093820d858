//! Hardware definitions for the pivisor hypervisor.
//!
//! This crate is the bottom of the stack: it knows what the AArch64
//! virtualization extensions and the BCM2837 peripherals look like, but it
//! never touches them. Every real hardware access goes through the
//! [`Platform`] trait, which the EL2 entry layer implements on the board and
//! the test suite implements in software. Everything above this crate is
//! ordinary, host-compilable Rust.
//!
//! [`Platform`]: platform::Platform

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod addressing;
pub mod board;
pub mod esr;
#[macro_use]
pub mod kprint;
pub mod platform;
pub mod sysreg;

pub use addressing::{Gva, Ipa, Pa, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PTRS_PER_TABLE, TABLE_SHIFT};
pub use platform::{CpuContext, Platform};
