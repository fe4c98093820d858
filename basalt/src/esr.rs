//! ESR_EL2 syndrome decoding.
//!
//! Every trap out of the guest arrives with a syndrome word; this module
//! turns the raw bits into typed views. Nothing here reads hardware; the
//! entry layer hands the raw value in and the dispatcher pattern-matches on
//! the result.

use num_enum::TryFromPrimitive;

/// Exception classes of ESR_EL2[31:26] that the dispatcher handles.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionClass {
    /// Trapped WFI or WFE instruction.
    TrapWfx = 0x01,
    /// Access to SIMD or floating-point trapped by CPTR_EL2.
    TrapFpReg = 0x07,
    /// HVC instruction execution in AArch64 state.
    Hvc64 = 0x16,
    /// Trapped MSR, MRS or system instruction in AArch64 state.
    TrapSystem = 0x18,
    /// Access to SVE functionality trapped by CPTR_EL2.
    TrapSve = 0x19,
    /// Data abort from a lower exception level.
    DataAbortLow = 0x24,
}

/// Access size of a data abort, from ISS.SAS.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum AccessSize {
    Byte = 0,
    HalfWord = 1,
    Word = 2,
    DoubleWord = 3,
}

impl AccessSize {
    /// Number of bytes moved by the faulting access.
    pub const fn bytes(self) -> usize {
        1 << self as usize
    }

    /// Mask selecting the transferred low bits of a register.
    pub const fn mask(self) -> u64 {
        match self {
            AccessSize::Byte => 0xff,
            AccessSize::HalfWord => 0xffff,
            AccessSize::Word => 0xffff_ffff,
            AccessSize::DoubleWord => u64::MAX,
        }
    }
}

/// Coarse classification of the fault status code of a data abort.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FaultKind {
    /// No descriptor at some level: the address was never mapped.
    Translation,
    /// Access-flag fault.
    AccessFlag,
    /// Present descriptor forbids the access, the trap-on-purpose case.
    Permission,
    /// Anything else (alignment, external abort, ...).
    Other,
}

/// Decoded ISS of a data abort taken from a lower exception level.
#[derive(Debug, Clone, Copy)]
pub struct DataAbort {
    /// Instruction syndrome valid: SAS/SRT/WNR below are meaningful.
    pub isv: bool,
    /// Access width.
    pub size: AccessSize,
    /// Index of the general-purpose register moved by the access.
    pub srt: usize,
    /// True for a write, false for a read.
    pub write: bool,
    /// Fault occurred during a stage-1 translation table walk.
    pub s1ptw: bool,
    /// Raw data fault status code.
    pub dfsc: u8,
}

impl DataAbort {
    /// Classify the fault status code.
    pub fn kind(&self) -> FaultKind {
        match self.dfsc >> 2 {
            0b0001 => FaultKind::Translation,
            0b0010 => FaultKind::AccessFlag,
            0b0011 => FaultKind::Permission,
            _ => FaultKind::Other,
        }
    }
}

/// Decoded ISS of a trapped MSR/MRS access.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SysRegAccess {
    pub op0: u8,
    pub op1: u8,
    pub crn: u8,
    pub crm: u8,
    pub op2: u8,
    /// Index of the transferred general-purpose register.
    pub rt: usize,
    /// True for MRS (guest reads), false for MSR (guest writes).
    pub read: bool,
}

impl SysRegAccess {
    /// The (op0, op1, crn, crm, op2) key used by the trap table.
    pub const fn encoding(&self) -> SysRegEncoding {
        SysRegEncoding {
            op0: self.op0,
            op1: self.op1,
            crn: self.crn,
            crm: self.crm,
            op2: self.op2,
        }
    }
}

/// A system-register encoding, the key of the static trap table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SysRegEncoding {
    pub op0: u8,
    pub op1: u8,
    pub crn: u8,
    pub crm: u8,
    pub op2: u8,
}

impl SysRegEncoding {
    pub const fn new(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> Self {
        Self {
            op0,
            op1,
            crn,
            crm,
            op2,
        }
    }
}

/// Raw ESR_EL2 value with typed accessors.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Esr(u64);

impl Esr {
    const EC_SHIFT: u64 = 26;

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Raw exception class bits.
    pub const fn class_bits(self) -> u8 {
        ((self.0 >> Self::EC_SHIFT) & 0x3f) as u8
    }

    /// Exception class, if it is one the dispatcher knows.
    pub fn class(self) -> Option<ExceptionClass> {
        ExceptionClass::try_from(self.class_bits()).ok()
    }

    /// Human-readable name of the exception class, for diagnostics.
    pub fn class_name(self) -> &'static str {
        SYNC_CLASS_NAMES
            .get(self.class_bits() as usize)
            .copied()
            .unwrap_or("(unknown)")
    }

    /// Immediate operand of an HVC instruction (ISS[15:0]).
    pub const fn hvc_imm(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Decode the ISS as a data abort.
    pub fn data_abort(self) -> DataAbort {
        let iss = self.0 & 0x1ff_ffff;
        DataAbort {
            isv: iss & (1 << 24) != 0,
            // SAS is two bits, so every encoding maps to a variant.
            size: match (iss >> 22) & 0x3 {
                0 => AccessSize::Byte,
                1 => AccessSize::HalfWord,
                2 => AccessSize::Word,
                _ => AccessSize::DoubleWord,
            },
            srt: ((iss >> 16) & 0x1f) as usize,
            write: iss & (1 << 6) != 0,
            s1ptw: iss & (1 << 7) != 0,
            dfsc: (iss & 0x3f) as u8,
        }
    }

    /// Decode the ISS as a trapped MSR/MRS access.
    pub fn sysreg_access(self) -> SysRegAccess {
        let iss = self.0 & 0x1ff_ffff;
        SysRegAccess {
            op0: ((iss >> 20) & 0x3) as u8,
            op2: ((iss >> 17) & 0x7) as u8,
            op1: ((iss >> 14) & 0x7) as u8,
            crn: ((iss >> 10) & 0xf) as u8,
            rt: ((iss >> 5) & 0x1f) as usize,
            crm: ((iss >> 1) & 0xf) as u8,
            read: iss & 1 != 0,
        }
    }
}

impl core::fmt::Debug for Esr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Esr(0x{:x}, {})", self.0, self.class_name())
    }
}

/// Names of all synchronous exception classes, indexed by EC.
pub const SYNC_CLASS_NAMES: [&str; 64] = [
    "Unknown reason.",
    "Trapped WFI or WFE instruction execution.",
    "(unknown)",
    "Trapped MCR or MRC access with (coproc==0b1111).",
    "Trapped MCRR or MRRC access with (coproc==0b1111).",
    "Trapped MCR or MRC access with (coproc==0b1110).",
    "Trapped LDC or STC access.",
    "Access to SVE, Advanced SIMD, or floating-point functionality trapped by CPACR_EL1.FPEN, CPTR_EL2.FPEN, CPTR_EL2.TFP, or CPTR_EL3.TFP control.",
    "Trapped VMRS access, from ID group trap.",
    "Trapped use of a Pointer authentication instruction because HCR_EL2.API == 0 || SCR_EL3.API == 0.",
    "(unknown)",
    "(unknown)",
    "Trapped MRRC access with (coproc==0b1110).",
    "Branch Target Exception.",
    "Illegal Execution state.",
    "(unknown)",
    "(unknown)",
    "SVC instruction execution in AArch32 state.",
    "HVC instruction execution in AArch32 state.",
    "SMC instruction execution in AArch32 state.",
    "(unknown)",
    "SVC instruction execution in AArch64 state.",
    "HVC instruction execution in AArch64 state.",
    "SMC instruction execution in AArch64 state.",
    "Trapped MSR, MRS or System instruction execution in AArch64 state.",
    "Access to SVE functionality trapped as a result of CPACR_EL1.ZEN, CPTR_EL2.ZEN, CPTR_EL2.TZ, or CPTR_EL3.EZ.",
    "Trapped ERET, ERETAA, or ERETAB instruction execution.",
    "(unknown)",
    "Exception from a Pointer Authentication instruction authentication failure.",
    "(unknown)",
    "(unknown)",
    "(unknown)",
    "Instruction Abort from a lower Exception level.",
    "Instruction Abort taken without a change in Exception level.",
    "PC alignment fault exception.",
    "(unknown)",
    "Data Abort from a lower Exception level.",
    "Data Abort without a change in Exception level.",
    "SP alignment fault exception.",
    "(unknown)",
    "Trapped floating-point exception taken from AArch32 state.",
    "(unknown)",
    "(unknown)",
    "(unknown)",
    "Trapped floating-point exception taken from AArch64 state.",
    "(unknown)",
    "(unknown)",
    "SError interrupt.",
    "Breakpoint exception from a lower Exception level.",
    "Breakpoint exception taken without a change in Exception level.",
    "Software Step exception from a lower Exception level.",
    "Software Step exception taken without a change in Exception level.",
    "Watchpoint from a lower Exception level.",
    "Watchpoint exceptions without a change in Exception level.",
    "(unknown)",
    "(unknown)",
    "BKPT instruction execution in AArch32 state.",
    "(unknown)",
    "Vector Catch exception from AArch32 state.",
    "(unknown)",
    "BRK instruction execution in AArch64 state.",
    "(unknown)",
    "(unknown)",
    "(unknown)",
];

/// Rebuild the faulting IPA from HPFAR_EL2 and the page offset of FAR_EL2.
#[inline]
pub fn fault_ipa(hpfar: u64, far: u64) -> crate::addressing::Ipa {
    // FIPA lives in HPFAR_EL2[39:4] on this core; masking it keeps the
    // result inside the 48-bit range Ipa accepts.
    let page = ((hpfar & 0xffff_fff0) >> 4) << 12;
    match crate::addressing::Ipa::new(page | (far & 0xfff)) {
        Some(ipa) => ipa,
        None => unreachable!(),
    }
}
