//! Emulated BCM2837 peripherals: interrupt controller, AUX mini UART,
//! PL011 UART, system timer and the VideoCore mailbox.
//!
//! The interrupt controller derives its pending registers from live
//! device state instead of latching them, so a guest polling
//! IRQ_PENDING_1 always sees the current truth. The system timer runs on
//! virtual time: an offset absorbs every interval the guest was
//! descheduled, and comparator matches are delivered by arming the
//! physical comparator 3 with the nearest virtual expiry.

use super::{BoardModel, DeviceContext};
use crate::fifo::Fifo;
use basalt::board::*;
use basalt::{warning, Gva, Ipa, Pa};

/// Shortest distance to a virtual comparator expiry. Shorter distances
/// would let the virtual counter pass the comparator before the guest
/// gets to run again.
const MIN_EXPIRE: u32 = 10_000;

#[derive(Default)]
struct IntCtrl {
    fiq_control: u32,
    irqs_1_enabled: u32,
    irqs_2_enabled: u32,
    basic_irqs_enabled: u32,
}

struct MiniUart {
    enables: u8,
    io: u8,
    ier: u8,
    lcr: u8,
    mcr: u8,
    msr: u8,
    scratch: u8,
    cntl: u8,
    baud: u16,
}

impl Default for MiniUart {
    fn default() -> Self {
        Self {
            enables: 0,
            io: 0,
            ier: 0,
            lcr: 0,
            mcr: 0,
            msr: 0x10,
            scratch: 0,
            cntl: 0x3,
            baud: 0,
        }
    }
}

struct Pl011 {
    ibrd: u32,
    fbrd: u32,
    lcrh: u32,
    cr: u32,
    ifls: u32,
    imsc: u32,
}

impl Default for Pl011 {
    fn default() -> Self {
        Self {
            ibrd: 0,
            fbrd: 0,
            lcrh: 0,
            cr: 0x300,
            ifls: 0,
            imsc: 0,
        }
    }
}

#[derive(Default)]
struct SysTimer {
    /// Physical count at the last hand-off to this guest.
    last_physical_count: u64,
    /// How far the virtual counter lags the physical one.
    offset: u64,
    cs: u32,
    compare: [u32; 4],
    /// Remaining virtual ticks until each comparator matches; 0 is idle.
    expire: [u32; 4],
}

/// All emulated peripheral state of one guest.
pub struct Rpi3Board {
    intctrl: IntCtrl,
    mu: MiniUart,
    pl011: Pl011,
    systimer: SysTimer,
    mbox: Fifo,
}

fn bit(v: u32, n: u32) -> bool {
    v & (1 << n) != 0
}

impl Rpi3Board {
    /// `physical_count` anchors virtual time at creation.
    pub fn new(physical_count: u64) -> Self {
        Self {
            intctrl: IntCtrl::default(),
            mu: MiniUart::default(),
            pl011: Pl011::default(),
            systimer: SysTimer {
                last_physical_count: physical_count,
                ..SysTimer::default()
            },
            mbox: Fifo::new(),
        }
    }

    fn virtual_count(&self, ctx: &mut DeviceContext<'_>) -> u64 {
        ctx.physical_count() - self.systimer.offset
    }

    fn intctrl_read(&mut self, ctx: &mut DeviceContext<'_>, addr: u64) -> u64 {
        match addr {
            IRQ_BASIC_PENDING => {
                let pending1 = (self.intctrl_read(ctx, IRQ_PENDING_1) != 0) as u64;
                let pending2 = (self.intctrl_read(ctx, IRQ_PENDING_2) != 0) as u64;
                (pending1 << 8) | (pending2 << 9)
            }
            IRQ_PENDING_1 => {
                let match1 = bit(self.intctrl.irqs_1_enabled, 1) && self.systimer.cs & 0x2 != 0;
                let match3 = bit(self.intctrl.irqs_1_enabled, 3) && self.systimer.cs & 0x8 != 0;
                let aux = bit(self.intctrl.irqs_1_enabled, 29) && self.aux_read(ctx, AUX_IRQ) != 0;
                ((match1 as u64) << 1) | ((match3 as u64) << 3) | ((aux as u64) << 29)
            }
            IRQ_PENDING_2 => {
                let uart = bit(self.intctrl.irqs_2_enabled, 57 - 32)
                    && self.pl011_read(ctx, PL011_MIS) != 0;
                (uart as u64) << (57 - 32)
            }
            FIQ_CONTROL => self.intctrl.fiq_control as u64,
            ENABLE_IRQS_1 => self.intctrl.irqs_1_enabled as u64,
            ENABLE_IRQS_2 => self.intctrl.irqs_2_enabled as u64,
            ENABLE_BASIC_IRQS => self.intctrl.basic_irqs_enabled as u64,
            DISABLE_IRQS_1 => (!self.intctrl.irqs_1_enabled) as u64,
            DISABLE_IRQS_2 => (!self.intctrl.irqs_2_enabled) as u64,
            DISABLE_BASIC_IRQS => (!self.intctrl.basic_irqs_enabled) as u64,
            _ => 0,
        }
    }

    fn intctrl_write(&mut self, addr: u64, val: u64) {
        let val = val as u32;
        match addr {
            FIQ_CONTROL => self.intctrl.fiq_control = val,
            ENABLE_IRQS_1 => self.intctrl.irqs_1_enabled |= val,
            ENABLE_IRQS_2 => self.intctrl.irqs_2_enabled |= val,
            ENABLE_BASIC_IRQS => self.intctrl.basic_irqs_enabled |= val,
            DISABLE_IRQS_1 => self.intctrl.irqs_1_enabled &= !val,
            DISABLE_IRQS_2 => self.intctrl.irqs_2_enabled &= !val,
            DISABLE_BASIC_IRQS => self.intctrl.basic_irqs_enabled &= !val,
            _ => {}
        }
    }

    fn aux_read(&mut self, ctx: &mut DeviceContext<'_>, addr: u64) -> u64 {
        // The mini UART registers read as zero until AUXENB gates them on.
        if self.mu.enables & 1 == 0 && (AUX_MU_IO_REG..=AUX_MU_BAUD_REG).contains(&addr) {
            return 0;
        }
        match addr {
            AUX_IRQ => {
                let mu_pending =
                    self.mu.enables & 1 != 0 && self.aux_read(ctx, AUX_MU_IIR_REG) & 1 == 0;
                mu_pending as u64
            }
            AUX_ENABLES => self.mu.enables as u64,
            AUX_MU_IO_REG => {
                if self.mu.lcr & LCR_DLAB != 0 {
                    // DLAB aliases IO onto the low baud byte, and any IO
                    // access drops DLAB again.
                    self.mu.lcr &= !LCR_DLAB;
                    (self.mu.baud & 0xff) as u64
                } else {
                    ctx.console.in_fifo.pop().unwrap_or(0) & 0xff
                }
            }
            AUX_MU_IER_REG => {
                if self.mu.lcr & LCR_DLAB != 0 {
                    (self.mu.baud >> 8) as u64
                } else {
                    self.mu.ier as u64
                }
            }
            AUX_MU_IIR_REG => {
                let tx_int = self.mu.ier & 0x2 != 0 && ctx.console.out_fifo.is_empty();
                let rx_int = self.mu.ier & 0x1 != 0 && !ctx.console.in_fifo.is_empty();
                let mut int_id = (tx_int as u64) | ((rx_int as u64) << 1);
                if int_id == 0x3 {
                    // Receive outranks transmit.
                    int_id = 0x1;
                }
                ((int_id == 0) as u64) | (int_id << 1) | (0x3 << 6)
            }
            AUX_MU_LCR_REG => self.mu.lcr as u64,
            AUX_MU_MCR_REG => self.mu.mcr as u64,
            AUX_MU_LSR_REG => {
                let dready = !ctx.console.in_fifo.is_empty();
                let tx_empty = !ctx.console.out_fifo.is_full();
                let tx_idle = ctx.console.out_fifo.is_empty();
                (dready as u64) | ((tx_empty as u64) << 5) | ((tx_idle as u64) << 6)
            }
            AUX_MU_MSR_REG => self.mu.msr as u64,
            AUX_MU_SCRATCH => self.mu.scratch as u64,
            AUX_MU_CNTL_REG => self.mu.cntl as u64,
            AUX_MU_STAT_REG => {
                let sym_avail = !ctx.console.in_fifo.is_empty();
                let space_avail = !ctx.console.out_fifo.is_full();
                let rx_idle = ctx.console.in_fifo.is_empty();
                let tx_idle = !ctx.console.out_fifo.is_empty();
                let tx_full = !space_avail;
                let tx_empty = ctx.console.out_fifo.is_empty();
                let tx_done = rx_idle && tx_empty;
                let rx_level = core::cmp::min(ctx.console.in_fifo.len(), 8) as u64;
                let tx_level = core::cmp::min(ctx.console.out_fifo.len(), 8) as u64;
                (sym_avail as u64)
                    | ((space_avail as u64) << 1)
                    | ((rx_idle as u64) << 2)
                    | ((tx_idle as u64) << 3)
                    | ((tx_full as u64) << 5)
                    | ((tx_empty as u64) << 8)
                    | ((tx_done as u64) << 9)
                    | (rx_level << 16)
                    | (tx_level << 24)
            }
            AUX_MU_BAUD_REG => self.mu.baud as u64,
            _ => 0,
        }
    }

    fn aux_write(&mut self, ctx: &mut DeviceContext<'_>, addr: u64, val: u64) {
        if self.mu.enables & 1 == 0 && (AUX_MU_IO_REG..=AUX_MU_BAUD_REG).contains(&addr) {
            return;
        }
        match addr {
            AUX_ENABLES => self.mu.enables = val as u8,
            AUX_MU_IO_REG => {
                if self.mu.lcr & LCR_DLAB != 0 {
                    self.mu.lcr &= !LCR_DLAB;
                    self.mu.baud = (self.mu.baud & 0xff00) | (val as u16 & 0xff);
                } else if ctx.console.out_fifo.push(val & 0xff).is_err() {
                    warning!("mini uart: tx overrun");
                }
            }
            AUX_MU_IER_REG => {
                if self.mu.lcr & LCR_DLAB != 0 {
                    self.mu.baud = (self.mu.baud & 0xff) | ((val as u16 & 0xff) << 8);
                } else {
                    self.mu.ier = val as u8;
                }
            }
            AUX_MU_IIR_REG => {
                if val & 0x2 != 0 {
                    ctx.console.in_fifo.clear();
                }
                if val & 0x4 != 0 {
                    ctx.console.out_fifo.clear();
                }
            }
            AUX_MU_LCR_REG => self.mu.lcr = val as u8,
            AUX_MU_MCR_REG => self.mu.mcr = val as u8,
            AUX_MU_SCRATCH => self.mu.scratch = val as u8,
            AUX_MU_CNTL_REG => self.mu.cntl = val as u8,
            AUX_MU_BAUD_REG => self.mu.baud = val as u16,
            _ => {}
        }
    }

    fn pl011_read(&mut self, ctx: &mut DeviceContext<'_>, addr: u64) -> u64 {
        match addr {
            PL011_DR => {
                if self.pl011.cr & 0x1 != 0 && self.pl011.cr & 0x200 != 0 {
                    ctx.console.in_fifo.pop().unwrap_or(0) & 0xff
                } else {
                    0
                }
            }
            PL011_FR => {
                let busy = !ctx.console.out_fifo.is_empty();
                let rxfe = ctx.console.in_fifo.is_empty();
                let txff = ctx.console.out_fifo.is_full();
                let rxff = ctx.console.in_fifo.is_full();
                let txfe = ctx.console.out_fifo.is_empty();
                ((busy as u64) << 3)
                    | ((rxfe as u64) << 4)
                    | ((txff as u64) << 5)
                    | ((rxff as u64) << 6)
                    | ((txfe as u64) << 7)
            }
            PL011_IBRD => self.pl011.ibrd as u64,
            PL011_FBRD => self.pl011.fbrd as u64,
            PL011_LCRH => self.pl011.lcrh as u64,
            PL011_CR => self.pl011.cr as u64,
            PL011_IFLS => self.pl011.ifls as u64,
            PL011_IMSC => self.pl011.imsc as u64,
            PL011_RIS => {
                let uart_en = self.pl011.cr & 0x1 != 0;
                let tx_en = self.pl011.cr & 0x100 != 0;
                let rx_en = self.pl011.cr & 0x200 != 0;
                let tx_int = uart_en && tx_en && ctx.console.out_fifo.is_empty();
                let rx_int = uart_en && rx_en && !ctx.console.in_fifo.is_empty();
                ((rx_int as u64) << 4) | ((tx_int as u64) << 5)
            }
            PL011_MIS => self.pl011_read(ctx, PL011_RIS) & !(self.pl011.imsc as u64),
            _ => 0,
        }
    }

    fn pl011_write(&mut self, ctx: &mut DeviceContext<'_>, addr: u64, val: u64) {
        match addr {
            PL011_DR => {
                if self.pl011.cr & 0x1 != 0
                    && self.pl011.cr & 0x100 != 0
                    && ctx.console.out_fifo.push(val & 0xff).is_err()
                {
                    warning!("pl011: tx overrun");
                }
            }
            PL011_IBRD => self.pl011.ibrd = val as u32,
            PL011_FBRD => self.pl011.fbrd = val as u32,
            PL011_LCRH => self.pl011.lcrh = val as u32,
            PL011_CR => self.pl011.cr = val as u32,
            PL011_IFLS => self.pl011.ifls = val as u32,
            PL011_IMSC => self.pl011.imsc = val as u32,
            PL011_ICR => {
                if val & 0x10 != 0 {
                    ctx.console.in_fifo.clear();
                }
                if val & 0x20 != 0 {
                    ctx.console.out_fifo.clear();
                }
            }
            _ => {}
        }
    }

    fn systimer_read(&mut self, ctx: &mut DeviceContext<'_>, addr: u64) -> u64 {
        match addr {
            SYSTIMER_CS => self.systimer.cs as u64,
            SYSTIMER_CLO => self.virtual_count(ctx) & 0xffff_ffff,
            SYSTIMER_CHI => self.virtual_count(ctx) >> 32,
            SYSTIMER_C0 => self.systimer.compare[0] as u64,
            SYSTIMER_C1 => self.systimer.compare[1] as u64,
            SYSTIMER_C2 => self.systimer.compare[2] as u64,
            SYSTIMER_C3 => self.systimer.compare[3] as u64,
            _ => 0,
        }
    }

    fn systimer_write(&mut self, ctx: &mut DeviceContext<'_>, addr: u64, val: u64) {
        let val = val as u32;
        let current_clo = self.systimer_read(ctx, SYSTIMER_CLO) as u32;
        let set_comparator = |t: &mut SysTimer, n: usize| {
            t.compare[n] = val;
            let distance = if val > current_clo { val - current_clo } else { 1 };
            t.expire[n] = core::cmp::max(distance, MIN_EXPIRE);
        };
        match addr {
            // Write 1 to clear a match bit.
            SYSTIMER_CS => self.systimer.cs &= !val,
            SYSTIMER_C0 => set_comparator(&mut self.systimer, 0),
            SYSTIMER_C1 => set_comparator(&mut self.systimer, 1),
            SYSTIMER_C2 => set_comparator(&mut self.systimer, 2),
            SYSTIMER_C3 => set_comparator(&mut self.systimer, 3),
            _ => {}
        }
    }

    fn mbox_read(&mut self, addr: u64) -> u64 {
        match addr {
            MBOX_READ => self.mbox.pop().unwrap_or(0),
            MBOX_STATUS => {
                ((self.mbox.is_empty() as u64) << MBOX_EMPTY_BIT)
                    | ((self.mbox.is_full() as u64) << MBOX_FULL_BIT)
            }
            _ => 0,
        }
    }

    fn mbox_write(&mut self, ctx: &mut DeviceContext<'_>, addr: u64, val: u64) {
        if addr != MBOX_WRITE {
            return;
        }
        self.process_mbox_message(ctx, val & !0xf);
        if self.mbox.push(val).is_err() {
            warning!("mailbox: response queue overrun");
        }
    }

    /// Answer a property message in place: the response code goes into
    /// the second word of the guest's message buffer.
    fn process_mbox_message(&mut self, ctx: &mut DeviceContext<'_>, msg: u64) {
        let ipa = match ctx.platform.translate_stage1(Gva::new(msg)) {
            Some(ipa) => ipa,
            // Guest MMU off, the address already is an IPA.
            None => match Ipa::new(msg) {
                Some(ipa) => ipa,
                None => {
                    warning!("mailbox: message address 0x{:x} out of range", msg);
                    return;
                }
            },
        };
        if ctx.memory.write_u32(ipa + 4, MBOX_RESPONSE_OK).is_err() {
            warning!("mailbox: message buffer at {} not mapped", ipa);
        }
    }
}

impl BoardModel for Rpi3Board {
    fn mmio_read(&mut self, ctx: &mut DeviceContext<'_>, addr: Pa) -> u64 {
        let addr = addr.into_u64();
        match addr {
            IRQ_BASIC_PENDING..=DISABLE_BASIC_IRQS => self.intctrl_read(ctx, addr),
            AUX_IRQ..=AUX_MU_BAUD_REG => self.aux_read(ctx, addr),
            PL011_DR..=PL011_IDR => self.pl011_read(ctx, addr),
            SYSTIMER_CS..=SYSTIMER_C3 => self.systimer_read(ctx, addr),
            MBOX_READ..=MBOX_WRITE => self.mbox_read(addr),
            _ => 0,
        }
    }

    fn mmio_write(&mut self, ctx: &mut DeviceContext<'_>, addr: Pa, val: u64) {
        let addr = addr.into_u64();
        match addr {
            IRQ_BASIC_PENDING..=DISABLE_BASIC_IRQS => self.intctrl_write(addr, val),
            AUX_IRQ..=AUX_MU_BAUD_REG => self.aux_write(ctx, addr, val),
            PL011_DR..=PL011_IDR => self.pl011_write(ctx, addr, val),
            SYSTIMER_CS..=SYSTIMER_C3 => self.systimer_write(ctx, addr, val),
            MBOX_READ..=MBOX_WRITE => self.mbox_write(ctx, addr, val),
            _ => {}
        }
    }

    fn entering_vm(&mut self, ctx: &mut DeviceContext<'_>) {
        let lapse = ctx.physical_count() - self.systimer.last_physical_count;
        self.systimer.offset += lapse;

        let mut matched = 0u32;
        for n in 0..4 {
            let expire = &mut self.systimer.expire[n];
            if *expire == 0 {
                continue;
            }
            if lapse >= *expire as u64 {
                *expire = 0;
                matched |= 1 << n;
            } else {
                *expire -= lapse as u32;
            }
        }

        // Arm the physical comparator with the nearest pending expiry.
        if let Some(upcoming) = self
            .systimer
            .expire
            .iter()
            .copied()
            .filter(|&e| e != 0)
            .min()
        {
            let clo = ctx.platform.mmio_read32(reg(SYSTIMER_CLO));
            ctx.platform
                .mmio_write32(reg(SYSTIMER_C3), clo.wrapping_add(upcoming));
        }

        // Latch only matches that were not already pending.
        let fired = !self.systimer.cs & matched;
        self.systimer.cs |= fired;
    }

    fn leaving_vm(&mut self, ctx: &mut DeviceContext<'_>) {
        self.systimer.last_physical_count = ctx.physical_count();
    }

    fn irq_asserted(&mut self, ctx: &mut DeviceContext<'_>) -> bool {
        self.intctrl_read(ctx, IRQ_BASIC_PENDING) != 0
    }

    fn fiq_asserted(&mut self, ctx: &mut DeviceContext<'_>) -> bool {
        if self.intctrl.fiq_control & 0x80 == 0 {
            return false;
        }
        let source = self.intctrl.fiq_control & 0x7f;
        match source {
            0..=31 => self.intctrl_read(ctx, IRQ_PENDING_1) & (1 << source) != 0,
            32..=63 => self.intctrl_read(ctx, IRQ_PENDING_2) & (1 << (source - 32)) != 0,
            64..=71 => self.intctrl_read(ctx, IRQ_BASIC_PENDING) & (1 << (source - 64)) != 0,
            _ => false,
        }
    }
}
