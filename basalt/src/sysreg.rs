//! Virtual system-register file and EL2 control definitions.
//!
//! A guest's EL1/EL0 system registers live in a [`SysRegs`] snapshot that
//! the entry layer swaps in and out around guest execution. Registers the
//! virtualization configuration traps (HCR_EL2.TACR/TID1/TID2/TID3) are
//! additionally reachable by encoding through [`SYSREG_TRAP_TABLE`], so the
//! dispatcher can service the MSR/MRS without ever touching hardware.

use crate::esr::SysRegEncoding;

bitflags::bitflags! {
    /// HCR_EL2, hypervisor configuration.
    pub struct Hcr: u64 {
        /// Stage-2 translation enable.
        const VM = 1 << 0;
        /// Set/way invalidation overrides.
        const SWIO = 1 << 1;
        /// Route physical FIQ to EL2.
        const FMO = 1 << 3;
        /// Route physical IRQ to EL2.
        const IMO = 1 << 4;
        /// Route SError to EL2.
        const AMO = 1 << 5;
        /// Virtual FIQ pending.
        const VF = 1 << 6;
        /// Virtual IRQ pending.
        const VI = 1 << 7;
        /// Trap WFI.
        const TWI = 1 << 13;
        /// Trap ID group 1 registers.
        const TID1 = 1 << 16;
        /// Trap ID group 2 (cache ID) registers.
        const TID2 = 1 << 17;
        /// Trap ID group 3 registers.
        const TID3 = 1 << 18;
        /// Trap ACTLR accesses.
        const TACR = 1 << 21;
        /// EL1 is AArch64.
        const RW = 1 << 31;
    }
}

impl Hcr {
    /// Configuration every guest runs under.
    pub const GUEST: Self = Self::from_bits_truncate(
        Self::VM.bits()
            | Self::SWIO.bits()
            | Self::FMO.bits()
            | Self::IMO.bits()
            | Self::AMO.bits()
            | Self::TWI.bits()
            | Self::TID1.bits()
            | Self::TID2.bits()
            | Self::TID3.bits()
            | Self::TACR.bits()
            | Self::RW.bits(),
    );
}

/// VTCR_EL2 value: 4KB granule, 39-bit IPA, three levels starting at 1.
pub const VTCR_VALUE: u64 =
    (1 << 30) | (1 << 29) | (1 << 19) | (5 << 16) | (1 << 6) | (64 - 39);

/// SPSR mode field: EL1 with SP_EL1 (EL1h).
pub const PSR_MODE_EL1H: u64 = 0x5;
/// SPSR interrupt masks (D, A, I, F).
pub const PSR_MASK_ALL: u64 = 0xf << 6;

/// SCTLR_EL1 MMU-enable bit, forced off in the pristine baseline.
pub const SCTLR_MMU_ENABLE: u64 = 1;

/// Snapshot of a guest's EL1/EL0 system registers.
///
/// The save/restore set is moved wholesale by
/// [`Platform::store_guest_sysregs`]/[`Platform::load_guest_sysregs`]; the
/// trapped subset is also addressable by encoding via [`SysRegId`].
///
/// [`Platform::store_guest_sysregs`]: crate::platform::Platform::store_guest_sysregs
/// [`Platform::load_guest_sysregs`]: crate::platform::Platform::load_guest_sysregs
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct SysRegs {
    // Saved and restored around guest execution, never trapped.
    pub sctlr_el1: u64,
    pub ttbr0_el1: u64,
    pub ttbr1_el1: u64,
    pub tcr_el1: u64,
    pub esr_el1: u64,
    pub far_el1: u64,
    pub afsr0_el1: u64,
    pub afsr1_el1: u64,
    pub mair_el1: u64,
    pub amair_el1: u64,
    pub contextidr_el1: u64,
    pub cpacr_el1: u64,
    pub elr_el1: u64,
    pub fpcr: u64,
    pub fpsr: u64,
    pub midr_el1: u64,
    pub mpidr_el1: u64,
    pub par_el1: u64,
    pub sp_el0: u64,
    pub sp_el1: u64,
    pub spsr_el1: u64,
    pub tpidr_el0: u64,
    pub tpidr_el1: u64,
    pub tpidrro_el0: u64,
    pub vbar_el1: u64,

    // Trapped by HCR_EL2.TACR.
    pub actlr_el1: u64,

    // Trapped by HCR_EL2.TID3: ID registers, read-only constants.
    pub id_pfr0_el1: u64,
    pub id_pfr1_el1: u64,
    pub id_mmfr0_el1: u64,
    pub id_mmfr1_el1: u64,
    pub id_mmfr2_el1: u64,
    pub id_mmfr3_el1: u64,
    pub id_isar0_el1: u64,
    pub id_isar1_el1: u64,
    pub id_isar2_el1: u64,
    pub id_isar3_el1: u64,
    pub id_isar4_el1: u64,
    pub id_isar5_el1: u64,
    pub mvfr0_el1: u64,
    pub mvfr1_el1: u64,
    pub mvfr2_el1: u64,
    pub id_aa64pfr0_el1: u64,
    pub id_aa64pfr1_el1: u64,
    pub id_aa64dfr0_el1: u64,
    pub id_aa64dfr1_el1: u64,
    pub id_aa64isar0_el1: u64,
    pub id_aa64isar1_el1: u64,
    pub id_aa64mmfr0_el1: u64,
    pub id_aa64mmfr1_el1: u64,
    pub id_aa64afr0_el1: u64,
    pub id_aa64afr1_el1: u64,

    // Trapped by HCR_EL2.TID2.
    pub ctr_el0: u64,
    pub ccsidr_el1: u64,
    pub clidr_el1: u64,
    pub csselr_el1: u64,

    // Trapped by HCR_EL2.TID1.
    pub aidr_el1: u64,
    pub revidr_el1: u64,

    // Generic timer registers.
    pub cntkctl_el1: u64,
    pub cntp_ctl_el0: u64,
    pub cntp_cval_el0: u64,
    pub cntp_tval_el0: u64,
    pub cntv_ctl_el0: u64,
    pub cntv_cval_el0: u64,
    pub cntv_tval_el0: u64,
}

/// Names of the registers reachable through the trap table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SysRegId {
    ActlrEl1,
    IdPfr0El1,
    IdPfr1El1,
    IdMmfr0El1,
    IdMmfr1El1,
    IdMmfr2El1,
    IdMmfr3El1,
    IdIsar0El1,
    IdIsar1El1,
    IdIsar2El1,
    IdIsar3El1,
    IdIsar4El1,
    IdIsar5El1,
    Mvfr0El1,
    Mvfr1El1,
    Mvfr2El1,
    IdAa64Pfr0El1,
    IdAa64Pfr1El1,
    IdAa64Dfr0El1,
    IdAa64Dfr1El1,
    IdAa64Isar0El1,
    IdAa64Isar1El1,
    IdAa64Mmfr0El1,
    IdAa64Mmfr1El1,
    IdAa64Afr0El1,
    IdAa64Afr1El1,
    CtrEl0,
    CcsidrEl1,
    ClidrEl1,
    CsselrEl1,
    AidrEl1,
    RevidrEl1,
}

impl SysRegs {
    /// Read a trapped register from the snapshot.
    pub fn get(&self, id: SysRegId) -> u64 {
        match id {
            SysRegId::ActlrEl1 => self.actlr_el1,
            SysRegId::IdPfr0El1 => self.id_pfr0_el1,
            SysRegId::IdPfr1El1 => self.id_pfr1_el1,
            SysRegId::IdMmfr0El1 => self.id_mmfr0_el1,
            SysRegId::IdMmfr1El1 => self.id_mmfr1_el1,
            SysRegId::IdMmfr2El1 => self.id_mmfr2_el1,
            SysRegId::IdMmfr3El1 => self.id_mmfr3_el1,
            SysRegId::IdIsar0El1 => self.id_isar0_el1,
            SysRegId::IdIsar1El1 => self.id_isar1_el1,
            SysRegId::IdIsar2El1 => self.id_isar2_el1,
            SysRegId::IdIsar3El1 => self.id_isar3_el1,
            SysRegId::IdIsar4El1 => self.id_isar4_el1,
            SysRegId::IdIsar5El1 => self.id_isar5_el1,
            SysRegId::Mvfr0El1 => self.mvfr0_el1,
            SysRegId::Mvfr1El1 => self.mvfr1_el1,
            SysRegId::Mvfr2El1 => self.mvfr2_el1,
            SysRegId::IdAa64Pfr0El1 => self.id_aa64pfr0_el1,
            SysRegId::IdAa64Pfr1El1 => self.id_aa64pfr1_el1,
            SysRegId::IdAa64Dfr0El1 => self.id_aa64dfr0_el1,
            SysRegId::IdAa64Dfr1El1 => self.id_aa64dfr1_el1,
            SysRegId::IdAa64Isar0El1 => self.id_aa64isar0_el1,
            SysRegId::IdAa64Isar1El1 => self.id_aa64isar1_el1,
            SysRegId::IdAa64Mmfr0El1 => self.id_aa64mmfr0_el1,
            SysRegId::IdAa64Mmfr1El1 => self.id_aa64mmfr1_el1,
            SysRegId::IdAa64Afr0El1 => self.id_aa64afr0_el1,
            SysRegId::IdAa64Afr1El1 => self.id_aa64afr1_el1,
            SysRegId::CtrEl0 => self.ctr_el0,
            SysRegId::CcsidrEl1 => self.ccsidr_el1,
            SysRegId::ClidrEl1 => self.clidr_el1,
            SysRegId::CsselrEl1 => self.csselr_el1,
            SysRegId::AidrEl1 => self.aidr_el1,
            SysRegId::RevidrEl1 => self.revidr_el1,
        }
    }

    /// Write a trapped register in the snapshot.
    ///
    /// Writes to read-only registers are discarded, matching what the real
    /// device would do with a write the architecture ignores.
    pub fn set(&mut self, id: SysRegId, val: u64) {
        match id {
            SysRegId::ActlrEl1 => self.actlr_el1 = val,
            SysRegId::CsselrEl1 => self.csselr_el1 = val,
            // Everything else in the trapped set is an ID constant.
            _ => {}
        }
    }
}

/// Static lookup table from encoding to snapshot register.
///
/// Accesses with encodings not listed here are read-as-zero /
/// write-discarded by the dispatcher.
pub const SYSREG_TRAP_TABLE: &[(SysRegEncoding, SysRegId)] = &[
    (SysRegEncoding::new(3, 0, 1, 0, 1), SysRegId::ActlrEl1),
    (SysRegEncoding::new(3, 0, 0, 1, 0), SysRegId::IdPfr0El1),
    (SysRegEncoding::new(3, 0, 0, 1, 1), SysRegId::IdPfr1El1),
    (SysRegEncoding::new(3, 0, 0, 1, 4), SysRegId::IdMmfr0El1),
    (SysRegEncoding::new(3, 0, 0, 1, 5), SysRegId::IdMmfr1El1),
    (SysRegEncoding::new(3, 0, 0, 1, 6), SysRegId::IdMmfr2El1),
    (SysRegEncoding::new(3, 0, 0, 1, 7), SysRegId::IdMmfr3El1),
    (SysRegEncoding::new(3, 0, 0, 2, 0), SysRegId::IdIsar0El1),
    (SysRegEncoding::new(3, 0, 0, 2, 1), SysRegId::IdIsar1El1),
    (SysRegEncoding::new(3, 0, 0, 2, 2), SysRegId::IdIsar2El1),
    (SysRegEncoding::new(3, 0, 0, 2, 3), SysRegId::IdIsar3El1),
    (SysRegEncoding::new(3, 0, 0, 2, 4), SysRegId::IdIsar4El1),
    (SysRegEncoding::new(3, 0, 0, 2, 5), SysRegId::IdIsar5El1),
    (SysRegEncoding::new(3, 0, 0, 3, 0), SysRegId::Mvfr0El1),
    (SysRegEncoding::new(3, 0, 0, 3, 1), SysRegId::Mvfr1El1),
    (SysRegEncoding::new(3, 0, 0, 3, 2), SysRegId::Mvfr2El1),
    (SysRegEncoding::new(3, 0, 0, 4, 0), SysRegId::IdAa64Pfr0El1),
    (SysRegEncoding::new(3, 0, 0, 4, 1), SysRegId::IdAa64Pfr1El1),
    (SysRegEncoding::new(3, 0, 0, 5, 0), SysRegId::IdAa64Dfr0El1),
    (SysRegEncoding::new(3, 0, 0, 5, 1), SysRegId::IdAa64Dfr1El1),
    (SysRegEncoding::new(3, 0, 0, 5, 4), SysRegId::IdAa64Afr0El1),
    (SysRegEncoding::new(3, 0, 0, 5, 5), SysRegId::IdAa64Afr1El1),
    (SysRegEncoding::new(3, 0, 0, 6, 0), SysRegId::IdAa64Isar0El1),
    (SysRegEncoding::new(3, 0, 0, 6, 1), SysRegId::IdAa64Isar1El1),
    (SysRegEncoding::new(3, 0, 0, 7, 0), SysRegId::IdAa64Mmfr0El1),
    (SysRegEncoding::new(3, 0, 0, 7, 1), SysRegId::IdAa64Mmfr1El1),
    (SysRegEncoding::new(3, 3, 0, 0, 1), SysRegId::CtrEl0),
    (SysRegEncoding::new(3, 1, 0, 0, 0), SysRegId::CcsidrEl1),
    (SysRegEncoding::new(3, 1, 0, 0, 1), SysRegId::ClidrEl1),
    (SysRegEncoding::new(3, 2, 0, 0, 0), SysRegId::CsselrEl1),
    (SysRegEncoding::new(3, 1, 0, 0, 7), SysRegId::AidrEl1),
    (SysRegEncoding::new(3, 0, 0, 0, 6), SysRegId::RevidrEl1),
];

/// Look up a trapped encoding.
pub fn lookup(encoding: SysRegEncoding) -> Option<SysRegId> {
    SYSREG_TRAP_TABLE
        .iter()
        .find(|(e, _)| *e == encoding)
        .map(|(_, id)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_table_lookup() {
        assert_eq!(
            lookup(SysRegEncoding::new(3, 0, 1, 0, 1)),
            Some(SysRegId::ActlrEl1)
        );
        assert_eq!(
            lookup(SysRegEncoding::new(3, 3, 0, 0, 1)),
            Some(SysRegId::CtrEl0)
        );
        // TTBR0_EL1 is save/restored, never in the trap table.
        assert_eq!(lookup(SysRegEncoding::new(3, 0, 2, 0, 0)), None);
    }

    #[test]
    fn id_registers_are_read_only() {
        let mut regs = SysRegs {
            ctr_el0: 0x8444_c004,
            ..Default::default()
        };
        regs.set(SysRegId::CtrEl0, 0);
        assert_eq!(regs.get(SysRegId::CtrEl0), 0x8444_c004);

        regs.set(SysRegId::ActlrEl1, 7);
        assert_eq!(regs.get(SysRegId::ActlrEl1), 7);
    }
}
