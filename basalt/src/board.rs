//! BCM2837 (Raspberry Pi 3) peripheral register map.
//!
//! Guest operating-system drivers hard-code these addresses and bit
//! positions, so the emulation layer must present exactly this layout.
//! All addresses are bus addresses as seen by the guest (and, on this
//! board, identical host physical addresses).

use crate::addressing::Pa;

/// Base of the peripheral window.
pub const PBASE: u64 = 0x3f00_0000;
/// First address of the device region mapped inaccessible for every guest.
pub const DEVICE_BASE: u64 = PBASE;
/// Total guest-visible physical memory size.
pub const PHYS_MEMORY_SIZE: u64 = 0x4000_0000;
/// 2MB section size (one level-2 block).
pub const SECTION_SIZE: u64 = 1 << 21;
/// Bottom of the page arena; everything below is hypervisor text/data.
pub const LOW_MEMORY: u64 = 2 * SECTION_SIZE;

// System timer.
pub const SYSTIMER_CS: u64 = PBASE + 0x3000;
pub const SYSTIMER_CLO: u64 = PBASE + 0x3004;
pub const SYSTIMER_CHI: u64 = PBASE + 0x3008;
pub const SYSTIMER_C0: u64 = PBASE + 0x300c;
pub const SYSTIMER_C1: u64 = PBASE + 0x3010;
pub const SYSTIMER_C2: u64 = PBASE + 0x3014;
pub const SYSTIMER_C3: u64 = PBASE + 0x3018;

pub const SYSTIMER_CS_M0: u32 = 1 << 0;
pub const SYSTIMER_CS_M1: u32 = 1 << 1;
pub const SYSTIMER_CS_M2: u32 = 1 << 2;
pub const SYSTIMER_CS_M3: u32 = 1 << 3;

// Interrupt controller.
pub const IRQ_BASIC_PENDING: u64 = PBASE + 0xb200;
pub const IRQ_PENDING_1: u64 = PBASE + 0xb204;
pub const IRQ_PENDING_2: u64 = PBASE + 0xb208;
pub const FIQ_CONTROL: u64 = PBASE + 0xb20c;
pub const ENABLE_IRQS_1: u64 = PBASE + 0xb210;
pub const ENABLE_IRQS_2: u64 = PBASE + 0xb214;
pub const ENABLE_BASIC_IRQS: u64 = PBASE + 0xb218;
pub const DISABLE_IRQS_1: u64 = PBASE + 0xb21c;
pub const DISABLE_IRQS_2: u64 = PBASE + 0xb220;
pub const DISABLE_BASIC_IRQS: u64 = PBASE + 0xb224;

/// System timer match 1 in pending/enable register 1.
pub const SYSTEM_TIMER_IRQ_1: u32 = 1 << 1;
/// System timer match 3 in pending/enable register 1.
pub const SYSTEM_TIMER_IRQ_3: u32 = 1 << 3;
/// AUX (mini UART) interrupt in pending/enable register 1.
pub const AUX_IRQ_BIT: u32 = 1 << 29;
/// PL011 interrupt number (register 2, bit 57 - 32).
pub const UART_IRQ_BIT: u32 = 1 << (57 - 32);

// AUX block (mini UART).
pub const AUX_IRQ: u64 = PBASE + 0x21_5000;
pub const AUX_ENABLES: u64 = PBASE + 0x21_5004;
pub const AUX_MU_IO_REG: u64 = PBASE + 0x21_5040;
pub const AUX_MU_IER_REG: u64 = PBASE + 0x21_5044;
pub const AUX_MU_IIR_REG: u64 = PBASE + 0x21_5048;
pub const AUX_MU_LCR_REG: u64 = PBASE + 0x21_504c;
pub const AUX_MU_MCR_REG: u64 = PBASE + 0x21_5050;
pub const AUX_MU_LSR_REG: u64 = PBASE + 0x21_5054;
pub const AUX_MU_MSR_REG: u64 = PBASE + 0x21_5058;
pub const AUX_MU_SCRATCH: u64 = PBASE + 0x21_505c;
pub const AUX_MU_CNTL_REG: u64 = PBASE + 0x21_5060;
pub const AUX_MU_STAT_REG: u64 = PBASE + 0x21_5064;
pub const AUX_MU_BAUD_REG: u64 = PBASE + 0x21_5068;

/// DLAB bit of the mini-UART line control register.
pub const LCR_DLAB: u8 = 0x80;

// PL011 UART.
pub const PL011_DR: u64 = PBASE + 0x20_1000;
pub const PL011_RSRECR: u64 = PBASE + 0x20_1004;
pub const PL011_FR: u64 = PBASE + 0x20_1018;
pub const PL011_ILPR: u64 = PBASE + 0x20_1020;
pub const PL011_IBRD: u64 = PBASE + 0x20_1024;
pub const PL011_FBRD: u64 = PBASE + 0x20_1028;
pub const PL011_LCRH: u64 = PBASE + 0x20_102c;
pub const PL011_CR: u64 = PBASE + 0x20_1030;
pub const PL011_IFLS: u64 = PBASE + 0x20_1034;
pub const PL011_IMSC: u64 = PBASE + 0x20_1038;
pub const PL011_RIS: u64 = PBASE + 0x20_103c;
pub const PL011_MIS: u64 = PBASE + 0x20_1040;
pub const PL011_ICR: u64 = PBASE + 0x20_1044;
pub const PL011_DMACR: u64 = PBASE + 0x20_1048;
pub const PL011_ITCR: u64 = PBASE + 0x20_1080;
pub const PL011_ITIP: u64 = PBASE + 0x20_1084;
pub const PL011_ITOP: u64 = PBASE + 0x20_1088;
pub const PL011_IDR: u64 = PBASE + 0x20_108c;

// VideoCore mailbox.
pub const VIDEOCORE_MBOX: u64 = PBASE + 0xb880;
pub const MBOX_READ: u64 = VIDEOCORE_MBOX;
pub const MBOX_POLL: u64 = VIDEOCORE_MBOX + 0x10;
pub const MBOX_SENDER: u64 = VIDEOCORE_MBOX + 0x14;
pub const MBOX_STATUS: u64 = VIDEOCORE_MBOX + 0x18;
pub const MBOX_CONFIG: u64 = VIDEOCORE_MBOX + 0x1c;
pub const MBOX_WRITE: u64 = VIDEOCORE_MBOX + 0x20;

pub const MBOX_FULL_BIT: u32 = 31;
pub const MBOX_EMPTY_BIT: u32 = 30;
pub const MBOX_RESPONSE_OK: u32 = 0x8000_0000;
pub const MBOX_RESPONSE_ERROR: u32 = 0x8000_0001;

/// Convenience: a register address as a checked `Pa`.
#[inline]
pub const fn reg(addr: u64) -> Pa {
    match Pa::new(addr) {
        Some(pa) => pa,
        None => panic!("register address out of range"),
    }
}
