//! Hardware seam between the hypervisor engine and the EL2 machine.
//!
//! Everything that needs privileged instructions or a real BCM2837 goes
//! through [`Platform`]. The engine itself is plain Rust over this trait,
//! which is what lets the whole of it run in a hosted test harness.

use crate::addressing::{Gva, Ipa, Pa};
use crate::sysreg::SysRegs;

/// Callee-saved register context for a context switch.
///
/// Matches the layout the switch stub saves and restores, so the engine
/// can hand two of these to [`Platform::cpu_switch_to`].
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct CpuContext {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub fp: u64,
    pub sp: u64,
    pub pc: u64,
}

/// Privileged operations the engine delegates to the machine.
///
/// The EL2 implementation wraps MMIO accesses, system-register moves and
/// the context-switch stub. Tests substitute a mock that records calls.
pub trait Platform {
    /// 32-bit read from a physical device register.
    fn mmio_read32(&mut self, addr: Pa) -> u32;

    /// 32-bit write to a physical device register.
    fn mmio_write32(&mut self, addr: Pa, val: u32);

    /// Load a guest's EL1/EL0 system registers into hardware.
    fn load_guest_sysregs(&mut self, regs: &SysRegs);

    /// Capture the hardware EL1/EL0 system registers into a snapshot.
    fn store_guest_sysregs(&mut self, regs: &mut SysRegs);

    /// Point stage-2 translation at a root table and assign the VMID.
    fn install_stage2(&mut self, root: Pa, vmid: u64);

    /// Raise or clear the virtual IRQ line (HCR_EL2.VI).
    fn set_virtual_irq(&mut self, pending: bool);

    /// Raise or clear the virtual FIQ line (HCR_EL2.VF).
    fn set_virtual_fiq(&mut self, pending: bool);

    /// Unmask physical interrupts at EL2.
    fn enable_irq(&mut self);

    /// Mask physical interrupts at EL2.
    fn disable_irq(&mut self);

    /// Walk the current guest's stage-1 tables for a virtual address.
    ///
    /// Returns `None` when the address has no valid stage-1 mapping, or
    /// when the guest MMU is off and the address is already an IPA.
    fn translate_stage1(&mut self, va: Gva) -> Option<Ipa>;

    /// Switch from one callee-saved context to another.
    fn cpu_switch_to(&mut self, prev: *mut CpuContext, next: *const CpuContext);

    /// Emit one byte on the hypervisor console.
    fn putc(&mut self, b: u8);

    /// Stop the core. Only reached on unrecoverable errors.
    fn halt(&mut self) -> !;
}
