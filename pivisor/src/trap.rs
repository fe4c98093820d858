//! Exception dispatch: everything that pulls a guest back into EL2.
//!
//! The vector stubs save the trap frame and forward here. Faults a guest
//! cannot recover from retire the task instead of taking the whole
//! machine down.

use basalt::board::{reg, AUX_IRQ_BIT, AUX_MU_IO_REG, IRQ_PENDING_1, SYSTEM_TIMER_IRQ_1};
use basalt::esr::{fault_ipa, DataAbort, Esr, ExceptionClass, FaultKind};
use basalt::{info, sysreg, warning, Ipa, Pa, Platform};

use crate::hv::Hypervisor;
use crate::mm::Stage2MapError;
use crate::timer;

/// Hypercall: log a liveness message.
pub const HVC_NOTIFY: u16 = 0;
/// Hypercall: retire the calling guest.
pub const HVC_EXIT: u16 = 1;

impl<P: Platform> Hypervisor<P> {
    /// Entry for every synchronous exception taken from a guest.
    pub fn handle_sync(&mut self, esr: u64, far: u64, hpfar: u64) {
        self.vm_leaving_work();
        let esr = Esr::new(esr);
        match esr.class() {
            Some(ExceptionClass::TrapWfx) => {
                if let Some(task) = self.tasks[self.current].as_mut() {
                    task.stats.wfx_traps += 1;
                    task.frame.pc += 4;
                }
                // Nothing to do until an interrupt: let a pending tick in,
                // then give the core away.
                self.platform.enable_irq();
                self.reschedule();
                self.platform.disable_irq();
            }
            Some(ExceptionClass::Hvc64) => self.handle_hvc(esr.hvc_imm()),
            Some(ExceptionClass::TrapSystem) => self.handle_sysreg(esr),
            Some(ExceptionClass::DataAbortLow) => self.handle_data_abort(esr, far, hpfar),
            Some(ExceptionClass::TrapFpReg) | Some(ExceptionClass::TrapSve) => {
                warning!(
                    "task {}: unsupported FP/SIMD trap ({})",
                    self.current,
                    esr.class_name()
                );
                self.exit_current();
            }
            None => {
                warning!(
                    "task {}: uncaught synchronous exception: {} (esr 0x{:x}, far 0x{:x})",
                    self.current,
                    esr.class_name(),
                    esr.raw(),
                    far
                );
                self.exit_current();
            }
        }
        self.vm_entering_work();
    }

    /// Entry for a physical interrupt taken while a guest was running.
    pub fn handle_irq(&mut self) {
        self.vm_leaving_work();
        let pending = self.platform.mmio_read32(reg(IRQ_PENDING_1));
        if pending & SYSTEM_TIMER_IRQ_1 != 0 {
            timer::rearm_tick(&mut self.platform);
            self.timer_tick();
        }
        if pending & basalt::board::SYSTEM_TIMER_IRQ_3 != 0 {
            timer::ack_guest_match(&mut self.platform);
        }
        if pending & AUX_IRQ_BIT != 0 {
            let received = self.platform.mmio_read32(reg(AUX_MU_IO_REG)) as u8;
            self.handle_console_input(received);
        }
        self.vm_entering_work();
    }

    fn handle_hvc(&mut self, imm: u16) {
        if let Some(task) = self.tasks[self.current].as_mut() {
            task.stats.hvc_traps += 1;
        }
        match imm {
            HVC_NOTIFY => info!("task {}: hvc notify", self.current),
            HVC_EXIT => self.exit_current(),
            n => warning!("task {}: unknown hypercall {}", self.current, n),
        }
    }

    fn handle_sysreg(&mut self, esr: Esr) {
        let access = esr.sysreg_access();
        let task = match self.tasks[self.current].as_mut() {
            Some(task) => task,
            None => return,
        };
        task.stats.sysreg_traps += 1;

        match sysreg::lookup(access.encoding()) {
            Some(id) if access.read => {
                if access.rt != 31 {
                    task.frame.regs[access.rt] = task.sysregs.get(id);
                }
            }
            Some(id) => {
                let val = if access.rt == 31 {
                    0
                } else {
                    task.frame.regs[access.rt]
                };
                task.sysregs.set(id, val);
            }
            // Not a register we virtualize: reads as zero, writes vanish.
            None if access.read => {
                warning!(
                    "task {}: read of unknown sysreg ({},{},{},{},{})",
                    task.id,
                    access.op0,
                    access.op1,
                    access.crn,
                    access.crm,
                    access.op2
                );
                if access.rt != 31 {
                    task.frame.regs[access.rt] = 0;
                }
            }
            None => {
                warning!(
                    "task {}: write to unknown sysreg ({},{},{},{},{})",
                    task.id,
                    access.op0,
                    access.op1,
                    access.crn,
                    access.crm,
                    access.op2
                );
            }
        }
        task.frame.pc += 4;
    }

    fn handle_data_abort(&mut self, esr: Esr, far: u64, hpfar: u64) {
        let abort = esr.data_abort();
        let ipa = fault_ipa(hpfar, far);
        match abort.kind() {
            FaultKind::Translation => self.demand_page(ipa),
            FaultKind::Permission => self.emulate_mmio(abort, ipa),
            kind => {
                warning!(
                    "task {}: unrecoverable data abort at {} ({:?}, dfsc 0x{:x})",
                    self.current,
                    ipa,
                    kind,
                    abort.dfsc
                );
                self.exit_current();
            }
        }
    }

    /// First touch of a RAM page: back it with a zeroed frame and let the
    /// instruction replay.
    fn demand_page(&mut self, ipa: Ipa) {
        let Self {
            alloc,
            tasks,
            current,
            ..
        } = self;
        let task = match tasks[*current].as_mut() {
            Some(task) => task,
            None => return,
        };
        match task.space.alloc_and_map(alloc, ipa) {
            Ok(_) => task.stats.page_faults += 1,
            // The page arrived between fault and handler; replay as-is.
            Err(Stage2MapError::AlreadyMapped) => {}
            Err(e) => {
                warning!("task {}: demand paging at {} failed: {:?}", *current, ipa, e);
                self.exit_current();
            }
        }
    }

    /// Permission fault on a premapped peripheral page: run the access
    /// through the task's board model instead of memory.
    fn emulate_mmio(&mut self, abort: DataAbort, ipa: Ipa) {
        if !abort.isv {
            warning!(
                "task {}: MMIO access at {} without syndrome, cannot emulate",
                self.current,
                ipa
            );
            self.exit_current();
            return;
        }
        // Peripheral pages are identity-premapped, so the IPA is the
        // device address.
        let addr = match Pa::new(ipa.into_u64()) {
            Some(pa) => pa,
            None => {
                self.exit_current();
                return;
            }
        };

        let Self {
            platform,
            alloc,
            tasks,
            current,
            ..
        } = self;
        let task = match tasks[*current].as_mut() {
            Some(task) => task,
            None => return,
        };

        if abort.write {
            let val = if abort.srt == 31 {
                0
            } else {
                task.frame.regs[abort.srt]
            } & abort.size.mask();
            task.mmio_write(platform, alloc, addr, val);
        } else {
            let val = task.mmio_read(platform, alloc, addr) & abort.size.mask();
            if abort.srt != 31 {
                task.frame.regs[abort.srt] = val;
            }
        }
        task.stats.mmio_traps += 1;
        task.frame.pc += 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fresh_hv, spawn_guest};
    use crate::task::TaskState;
    use basalt::board::{
        AUX_ENABLES, AUX_MU_IIR_REG, AUX_MU_LSR_REG, ENABLE_IRQS_1, SYSTIMER_C1, SYSTIMER_CLO,
        SYSTIMER_CS,
    };

    fn esr_wfx() -> u64 {
        0x01 << 26
    }

    fn esr_hvc(imm: u16) -> u64 {
        (0x16 << 26) | imm as u64
    }

    fn esr_sysreg(op0: u64, op1: u64, crn: u64, crm: u64, op2: u64, rt: u64, read: bool) -> u64 {
        (0x18 << 26)
            | (op0 << 20)
            | (op2 << 17)
            | (op1 << 14)
            | (crn << 10)
            | (rt << 5)
            | (crm << 1)
            | read as u64
    }

    fn esr_dabt(write: bool, srt: u64, dfsc: u64) -> u64 {
        // ISV set, 32-bit access.
        let mut iss = (1 << 24) | (2 << 22) | (srt << 16) | dfsc;
        if write {
            iss |= 1 << 6;
        }
        (0x24 << 26) | iss
    }

    fn fault_at(hv: &mut crate::hv::Hypervisor<crate::mock::MockPlatform>, esr: u64, addr: u64) {
        let far = addr & 0xfff;
        let hpfar = (addr >> 12) << 4;
        hv.handle_sync(esr, far, hpfar);
    }

    const DFSC_TRANSLATION_L3: u64 = 0b000111;
    const DFSC_PERMISSION_L3: u64 = 0b001111;

    #[test]
    fn translation_fault_backs_page_with_zeroed_frame() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.current = a;

        let used = hv.alloc.used();
        fault_at(&mut hv, esr_dabt(true, 3, DFSC_TRANSLATION_L3), 0x9_0010);
        assert!(hv.alloc.used() > used);
        assert_eq!(hv.task(a).unwrap().stats.page_faults, 1);

        // The new frame reads back as zeroes.
        let task = hv.tasks[a].as_mut().unwrap();
        let mut mem = task.guest_memory(&mut hv.alloc);
        assert_eq!(mem.read_u32(Ipa::new(0x9_0010).unwrap()).unwrap(), 0);

        // A second fault on the same page is a spurious replay, not a
        // guest error.
        fault_at(&mut hv, esr_dabt(false, 3, DFSC_TRANSLATION_L3), 0x9_0ff0);
        assert_eq!(hv.task(a).unwrap().state, TaskState::Running);
        assert_eq!(hv.task(a).unwrap().stats.page_faults, 1);
    }

    #[test]
    fn mmio_write_reaches_board_and_console() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.current = a;

        // Guest enables the mini UART, then transmits one byte.
        hv.task_mut(a).unwrap().frame.regs[2] = 1;
        fault_at(&mut hv, esr_dabt(true, 2, DFSC_PERMISSION_L3), AUX_ENABLES);
        hv.task_mut(a).unwrap().frame.regs[3] = b'A' as u64;
        let pc_before = hv.task(a).unwrap().frame.pc;
        fault_at(&mut hv, esr_dabt(true, 3, DFSC_PERMISSION_L3), AUX_MU_IO_REG);

        assert_eq!(hv.task(a).unwrap().frame.pc, pc_before + 4);
        assert_eq!(hv.task(a).unwrap().stats.mmio_traps, 2);

        // The transmitter is no longer idle; LSR reflects it.
        fault_at(&mut hv, esr_dabt(false, 4, DFSC_PERMISSION_L3), AUX_MU_LSR_REG);
        assert_eq!(hv.task(a).unwrap().frame.regs[4], 0x20);

        // Nothing reached the physical UART yet; the guest is not
        // forwarded.
        assert!(hv.platform.out.is_empty());

        // Forward it: pending output flushes out.
        hv.handle_console_input(b'?');
        hv.handle_console_input(b'1');
        assert_eq!(hv.platform.out.last(), Some(&b'A'));
    }

    #[test]
    fn emulated_registers_never_touch_hardware() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.current = a;

        hv.task_mut(a).unwrap().frame.regs[5] = 0xff;
        hv.platform.writes.clear();
        fault_at(&mut hv, esr_dabt(true, 5, DFSC_PERMISSION_L3), ENABLE_IRQS_1);
        fault_at(&mut hv, esr_dabt(true, 5, DFSC_PERMISSION_L3), SYSTIMER_CS);

        assert!(hv
            .platform
            .writes
            .iter()
            .all(|(addr, _)| *addr != ENABLE_IRQS_1 && *addr != SYSTIMER_CS));
    }

    #[test]
    fn wfx_yields_and_advances_pc() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        let b = spawn_guest(&mut hv, "b");
        hv.current = a;
        hv.task_mut(a).unwrap().frame.pc = 0x1000;
        hv.task_mut(a).unwrap().counter = 5;
        hv.task_mut(b).unwrap().counter = 3;

        hv.handle_sync(esr_wfx(), 0, 0);
        assert_eq!(hv.task(a).unwrap().frame.pc, 0x1004);
        assert_eq!(hv.task(a).unwrap().stats.wfx_traps, 1);
        // The slice survives a WFI yield; the guest still outranks b.
        assert_eq!(hv.current_id(), a);
    }

    #[test]
    fn hvc_exit_retires_the_guest_for_good() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        let b = spawn_guest(&mut hv, "b");
        hv.current = a;

        hv.handle_sync(esr_hvc(HVC_EXIT), 0, 0);
        assert_eq!(hv.task(a).unwrap().state, TaskState::Zombie);
        assert_ne!(hv.current_id(), a);

        for _ in 0..100 {
            hv.timer_tick();
            assert_ne!(hv.current_id(), a);
        }
        let _ = b;
    }

    #[test]
    fn hvc_notify_is_harmless() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.current = a;
        hv.handle_sync(esr_hvc(HVC_NOTIFY), 0, 0);
        assert_eq!(hv.task(a).unwrap().state, TaskState::Running);
        assert_eq!(hv.task(a).unwrap().stats.hvc_traps, 1);
    }

    #[test]
    fn trapped_id_register_reads_from_snapshot() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.current = a;
        hv.task_mut(a).unwrap().sysregs.ctr_el0 = 0x8444_c004;

        // MRS x7, CTR_EL0
        hv.handle_sync(esr_sysreg(3, 3, 0, 0, 1, 7, true), 0, 0);
        let task = hv.task(a).unwrap();
        assert_eq!(task.frame.regs[7], 0x8444_c004);
        assert_eq!(task.stats.sysreg_traps, 1);
        assert_eq!(task.frame.pc, 4);

        // MSR CTR_EL0, x7 is silently dropped: the register is read-only.
        hv.task_mut(a).unwrap().frame.regs[7] = 0;
        hv.handle_sync(esr_sysreg(3, 3, 0, 0, 1, 7, false), 0, 0);
        assert_eq!(hv.task(a).unwrap().sysregs.ctr_el0, 0x8444_c004);

        // ACTLR_EL1 is writable and round-trips.
        hv.task_mut(a).unwrap().frame.regs[9] = 0x5;
        hv.handle_sync(esr_sysreg(3, 0, 1, 0, 1, 9, false), 0, 0);
        hv.handle_sync(esr_sysreg(3, 0, 1, 0, 1, 10, true), 0, 0);
        assert_eq!(hv.task(a).unwrap().frame.regs[10], 0x5);
    }

    #[test]
    fn unknown_sysreg_reads_zero() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.current = a;
        hv.task_mut(a).unwrap().frame.regs[4] = 0xdead;
        // TTBR0_EL1 is save/restored, not trapped; an access that still
        // lands here reads as zero.
        hv.handle_sync(esr_sysreg(3, 0, 2, 0, 0, 4, true), 0, 0);
        assert_eq!(hv.task(a).unwrap().frame.regs[4], 0);
    }

    #[test]
    fn scheduler_tick_irq_drives_timer_and_rearm() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.current = a;
        hv.task_mut(a).unwrap().counter = 2;

        hv.platform.regs.insert(IRQ_PENDING_1, SYSTEM_TIMER_IRQ_1);
        hv.platform.writes.clear();
        hv.handle_irq();

        assert_eq!(hv.task(a).unwrap().counter, 1);
        assert!(hv.platform.writes.iter().any(|(addr, _)| *addr == SYSTIMER_C1));
        assert!(hv
            .platform
            .writes
            .iter()
            .any(|(addr, val)| *addr == SYSTIMER_CS && *val == 0x2));
    }

    #[test]
    fn console_irq_feeds_forwarded_task() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.forwarded = a;
        hv.platform.regs.insert(IRQ_PENDING_1, AUX_IRQ_BIT);
        hv.platform.regs.insert(AUX_MU_IO_REG, b'x' as u32);
        hv.handle_irq();

        assert_eq!(
            hv.task_mut(a).unwrap().console.in_fifo.pop(),
            Some(b'x' as u64)
        );
        // The receive interrupt got acked at the physical UART.
        assert!(hv
            .platform
            .writes
            .iter()
            .any(|(addr, val)| *addr == AUX_MU_IIR_REG && *val == 0x2));
    }

    #[test]
    fn virtual_irq_line_follows_board_state() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        let b = spawn_guest(&mut hv, "b");
        hv.current = a;

        // Guest a unmasks the comparator 1 interrupt and programs it just
        // ahead of the virtual counter.
        hv.task_mut(a).unwrap().frame.regs[2] = 1 << 1;
        fault_at(&mut hv, esr_dabt(true, 2, DFSC_PERMISSION_L3), ENABLE_IRQS_1);
        fault_at(&mut hv, esr_dabt(false, 3, DFSC_PERMISSION_L3), SYSTIMER_CLO);
        let clo = hv.task(a).unwrap().frame.regs[3];
        hv.task_mut(a).unwrap().frame.regs[4] = clo + 100;
        fault_at(&mut hv, esr_dabt(true, 4, DFSC_PERMISSION_L3), SYSTIMER_C1);
        assert!(!hv.platform.virq);

        // a yields to b, time passes while a is descheduled, then a gets
        // the core back: the expiry is accounted at that hand-off and the
        // virtual interrupt line rises.
        hv.task_mut(a).unwrap().counter = 0;
        hv.task_mut(b).unwrap().counter = 5;
        hv.handle_sync(esr_wfx(), 0, 0);
        assert_eq!(hv.current_id(), b);

        hv.platform.advance_time(20_000);
        hv.task_mut(b).unwrap().counter = 0;
        hv.task_mut(a).unwrap().counter = 5;
        hv.handle_sync(esr_wfx(), 0, 0);
        assert_eq!(hv.current_id(), a);
        assert!(hv.platform.virq);

        // Clearing the match drops the line again.
        hv.task_mut(a).unwrap().frame.regs[5] = 0x2;
        fault_at(&mut hv, esr_dabt(true, 5, DFSC_PERMISSION_L3), SYSTIMER_CS);
        assert!(!hv.platform.virq);
    }
}
