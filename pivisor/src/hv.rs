//! The hypervisor: task table, machine handle and boot sequence.

use alloc::boxed::Box;
use alloc::string::String;
use basalt::board::{reg, AUX_IRQ_BIT, ENABLE_IRQS_1, SYSTEM_TIMER_IRQ_1};
use basalt::sysreg::{SysRegs, SCTLR_MMU_ENABLE};
use basalt::{info, Platform};

use crate::loader::{LoadError, Loader};
use crate::mm::PageAllocator;
use crate::task::{Task, TaskError, NR_TASKS};
use crate::timer;

/// Errors of guest creation.
#[derive(Debug)]
pub enum CreateError {
    Task(TaskError),
    Load(LoadError),
}

impl From<TaskError> for CreateError {
    fn from(e: TaskError) -> Self {
        Self::Task(e)
    }
}

impl From<LoadError> for CreateError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

/// The whole machine: one platform, one frame arena, up to [`NR_TASKS`]
/// guests.
pub struct Hypervisor<P: Platform> {
    pub platform: P,
    pub alloc: PageAllocator,
    pub(crate) tasks: [Option<Box<Task>>; NR_TASKS],
    pub(crate) current: usize,
    pub(crate) nr_tasks: usize,
    /// Task whose console is wired to the physical UART.
    pub(crate) forwarded: usize,
    /// Previous byte seen on the physical console, for escape handling.
    pub(crate) console_prev: u8,
    /// Reset EL1 register file every new guest starts from.
    pristine: Option<SysRegs>,
}

impl<P: Platform> Hypervisor<P> {
    /// Bring the machine up: boot task in slot 0, scheduler tick armed,
    /// physical timer and UART interrupts unmasked.
    pub fn new(mut platform: P, mut alloc: PageAllocator) -> Result<Self, TaskError> {
        let boot = Task::boot(&mut alloc, &mut platform)?;

        timer::init(&mut platform);
        platform.mmio_write32(reg(ENABLE_IRQS_1), SYSTEM_TIMER_IRQ_1 | AUX_IRQ_BIT);
        platform.enable_irq();

        let mut tasks: [Option<Box<Task>>; NR_TASKS] = core::array::from_fn(|_| None);
        tasks[0] = Some(Box::new(boot));

        Ok(Self {
            platform,
            alloc,
            tasks,
            current: 0,
            nr_tasks: 1,
            forwarded: 0,
            console_prev: 0,
            pristine: None,
        })
    }

    /// The EL1 register file a fresh guest boots with: the hardware reset
    /// state, captured once, with the MMU forced off.
    fn pristine_sysregs(&mut self) -> SysRegs {
        if self.pristine.is_none() {
            let mut regs = SysRegs::default();
            self.platform.store_guest_sysregs(&mut regs);
            regs.sctlr_el1 &= !SCTLR_MMU_ENABLE;
            self.pristine = Some(regs);
        }
        match &self.pristine {
            Some(regs) => regs.clone(),
            None => unreachable!(),
        }
    }

    /// Create a guest and populate it through `loader`.
    pub fn create_task(&mut self, name: &str, loader: &mut dyn Loader) -> Result<usize, CreateError> {
        let id = self.nr_tasks;
        if id >= NR_TASKS {
            return Err(CreateError::Task(TaskError::TooMany));
        }

        let priority = match self.tasks[self.current].as_ref() {
            Some(task) => task.priority,
            None => 1,
        };
        let pristine = self.pristine_sysregs();
        let mut task = Task::new(
            id,
            String::from(name),
            priority,
            &mut self.alloc,
            &mut self.platform,
            &pristine,
        )?;

        let boot = loader.load(&mut task.guest_memory(&mut self.alloc))?;
        task.frame.pc = boot.pc;
        task.frame.sp = boot.sp;
        task.frame.regs[0] = boot.x0;

        info!("created task {} [{}]", id, name);
        self.tasks[id] = Some(Box::new(task));
        self.nr_tasks += 1;
        Ok(id)
    }

    pub fn current_id(&self) -> usize {
        self.current
    }

    pub fn task(&self, id: usize) -> Option<&Task> {
        self.tasks.get(id)?.as_deref()
    }

    pub fn task_mut(&mut self, id: usize) -> Option<&mut Task> {
        self.tasks.get_mut(id)?.as_deref_mut()
    }

    /// Book-keeping on every guest exit: snapshot the EL1 registers,
    /// close the board's time accounting, mirror pending console output.
    pub fn vm_leaving_work(&mut self) {
        let Self {
            platform,
            alloc,
            tasks,
            current,
            ..
        } = self;
        if let Some(task) = tasks[*current].as_mut() {
            platform.store_guest_sysregs(&mut task.sysregs);
            task.leaving_vm(platform, alloc);
        }
        let forwarded = self.forwarded;
        self.flush_console(forwarded);
    }

    /// Book-keeping right before a guest runs: account elapsed time,
    /// refresh the virtual interrupt lines, install its machine state.
    pub fn vm_entering_work(&mut self) {
        let Self {
            platform,
            alloc,
            tasks,
            current,
            ..
        } = self;
        if let Some(task) = tasks[*current].as_mut() {
            task.entering_vm(platform, alloc);
            let irq = task.irq_asserted(platform, alloc);
            let fiq = task.fiq_asserted(platform, alloc);
            platform.set_virtual_irq(irq);
            platform.set_virtual_fiq(fiq);
            platform.load_guest_sysregs(&task.sysregs);
            platform.install_stage2(task.space.root(), task.space.vmid());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::RawBinaryLoader;
    use crate::mock::fresh_hv;
    use crate::task::TaskState;

    #[test]
    fn boot_arms_tick_and_unmasks_irqs() {
        let hv = fresh_hv();
        assert!(hv
            .platform
            .writes
            .iter()
            .any(|(a, _)| *a == basalt::board::SYSTIMER_C1));
        assert!(hv
            .platform
            .writes
            .iter()
            .any(|(a, v)| *a == basalt::board::ENABLE_IRQS_1
                && *v == (SYSTEM_TIMER_IRQ_1 | AUX_IRQ_BIT)));
        assert_eq!(hv.current_id(), 0);
        assert_eq!(hv.task(0).unwrap().state, TaskState::Running);
    }

    #[test]
    fn created_task_gets_loader_entry_state() {
        let mut hv = fresh_hv();
        let mut loader = RawBinaryLoader::new(vec![0xaa; 32], 0x0, 0x0, 0x10_0000);
        let id = hv.create_task("guest", &mut loader).unwrap();
        assert_eq!(id, 1);
        let task = hv.task(id).unwrap();
        assert_eq!(task.frame.pc, 0x0);
        assert_eq!(task.frame.sp, 0x10_0000);
        assert_eq!(task.state, TaskState::Running);
    }

    #[test]
    fn entering_work_installs_machine_state() {
        let mut hv = fresh_hv();
        let mut loader = RawBinaryLoader::new(vec![0u8; 16], 0x0, 0x0, 0x1000);
        let id = hv.create_task("guest", &mut loader).unwrap();
        hv.current = id;
        hv.vm_entering_work();
        let (root, vmid) = hv.platform.stage2.unwrap();
        assert_eq!(vmid, id as u64);
        assert_eq!(root, hv.task(id).unwrap().space.root());
        assert!(!hv.platform.virq);
    }
}
