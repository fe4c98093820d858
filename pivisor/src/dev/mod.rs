//! Trap-and-emulate device models.
//!
//! Every guest access to a peripheral page raises a stage-2 permission
//! fault, and the trap layer routes the access into the current task's
//! [`BoardModel`]. Models never touch hardware directly; the few physical
//! accesses they need (the system timer counter) go through the
//! [`Platform`] handle in the [`DeviceContext`].

pub mod rpi3;

use crate::console::TaskConsole;
use crate::mm::GuestMemory;
use basalt::board;
use basalt::{Pa, Platform};

pub use rpi3::Rpi3Board;

/// Per-access environment handed to a board model.
pub struct DeviceContext<'a> {
    /// The faulting task's console FIFOs.
    pub console: &'a mut TaskConsole,
    /// Physical machine access.
    pub platform: &'a mut dyn Platform,
    /// The faulting task's RAM, for devices that do DMA-style accesses.
    pub memory: GuestMemory<'a>,
}

impl DeviceContext<'_> {
    /// Free-running physical system timer count.
    pub fn physical_count(&mut self) -> u64 {
        let clo = self.platform.mmio_read32(board::reg(board::SYSTIMER_CLO)) as u64;
        let chi = self.platform.mmio_read32(board::reg(board::SYSTIMER_CHI)) as u64;
        clo | (chi << 32)
    }
}

/// An emulated board: all peripheral state of one guest.
pub trait BoardModel {
    /// Emulate a read of a trapped peripheral register.
    fn mmio_read(&mut self, ctx: &mut DeviceContext<'_>, addr: Pa) -> u64;

    /// Emulate a write to a trapped peripheral register.
    fn mmio_write(&mut self, ctx: &mut DeviceContext<'_>, addr: Pa, val: u64);

    /// Account for wall-clock time that passed while the guest was out,
    /// right before it runs again.
    fn entering_vm(&mut self, ctx: &mut DeviceContext<'_>);

    /// Record the hand-off point when the guest stops running.
    fn leaving_vm(&mut self, ctx: &mut DeviceContext<'_>);

    /// Whether the emulated interrupt controller asserts IRQ.
    fn irq_asserted(&mut self, ctx: &mut DeviceContext<'_>) -> bool;

    /// Whether the emulated interrupt controller asserts FIQ.
    fn fiq_asserted(&mut self, ctx: &mut DeviceContext<'_>) -> bool;
}
