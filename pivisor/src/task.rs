//! Guest tasks: one schedulable EL1 machine each.

use alloc::boxed::Box;
use alloc::string::String;
use basalt::board::{DEVICE_BASE, PHYS_MEMORY_SIZE, SECTION_SIZE};
use basalt::sysreg::{SysRegs, PSR_MODE_EL1H};
use basalt::{CpuContext, Ipa, Pa, Platform, PAGE_SIZE};

use crate::console::TaskConsole;
use crate::dev::{BoardModel, DeviceContext, Rpi3Board};
use crate::mm::{AddressSpace, GuestMemory, PageAllocator, Stage2MapError};
use crate::timer;

/// Size of the task table, including the boot task in slot 0.
pub const NR_TASKS: usize = 64;

/// Saved general-purpose state of a trapped guest.
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TaskState {
    Running,
    /// Exited; keeps its slot but is never scheduled again.
    Zombie,
}

/// Trap counters, shown by the console task list.
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub wfx_traps: u64,
    pub hvc_traps: u64,
    pub sysreg_traps: u64,
    pub page_faults: u64,
    pub mmio_traps: u64,
}

/// Errors of task construction.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TaskError {
    /// The task table is full.
    TooMany,
    /// Stage-2 setup failed.
    Map(Stage2MapError),
}

impl From<Stage2MapError> for TaskError {
    fn from(e: Stage2MapError) -> Self {
        Self::Map(e)
    }
}

/// One guest and everything the hypervisor knows about it.
pub struct Task {
    /// Slot index, doubling as the stage-2 VMID.
    pub id: usize,
    pub name: String,
    pub state: TaskState,
    /// Remaining time slice, in scheduler ticks.
    pub counter: i64,
    pub priority: i64,
    /// Non-zero while preemption is off for this task.
    pub preempt_count: i64,
    /// Callee-saved EL2 context for `cpu_switch_to`.
    pub cpu_context: CpuContext,
    pub frame: TrapFrame,
    pub sysregs: SysRegs,
    pub space: AddressSpace,
    pub board: Box<dyn BoardModel>,
    pub console: TaskConsole,
    pub stats: TaskStats,
}

impl Task {
    /// Build a fresh guest: empty stage-2 tables with every peripheral
    /// page premapped inaccessible, a reset board model, and the pristine
    /// EL1 register file.
    pub fn new(
        id: usize,
        name: String,
        priority: i64,
        alloc: &mut PageAllocator,
        platform: &mut dyn Platform,
        pristine: &SysRegs,
    ) -> Result<Self, TaskError> {
        let mut space = AddressSpace::new(alloc, id as u64)?;

        let mut addr = DEVICE_BASE;
        while addr < PHYS_MEMORY_SIZE - SECTION_SIZE {
            // The range check in AddressSpace::new keeps these in bounds.
            if let Some(ipa) = Ipa::new(addr) {
                space.map_inaccessible(alloc, ipa)?;
            }
            addr += PAGE_SIZE as u64;
        }

        let board = Box::new(Rpi3Board::new(timer::physical_count(platform)));

        let mut frame = TrapFrame::default();
        frame.pstate = PSR_MODE_EL1H;

        Ok(Self {
            id,
            name,
            state: TaskState::Running,
            counter: priority,
            priority,
            preempt_count: 0,
            cpu_context: CpuContext::default(),
            frame,
            sysregs: pristine.clone(),
            space,
            board: board as Box<dyn BoardModel>,
            console: TaskConsole::new(),
            stats: TaskStats::default(),
        })
    }

    /// The boot task occupying slot 0: the hypervisor's own idle loop.
    /// It never runs guest code, so it gets no board or RAM.
    pub fn boot(
        alloc: &mut PageAllocator,
        platform: &mut dyn Platform,
    ) -> Result<Self, TaskError> {
        let space = AddressSpace::new(alloc, 0)?;
        Ok(Self {
            id: 0,
            name: String::from("boot"),
            state: TaskState::Running,
            counter: 0,
            priority: 1,
            preempt_count: 0,
            cpu_context: CpuContext::default(),
            frame: TrapFrame::default(),
            sysregs: SysRegs::default(),
            space,
            board: Box::new(Rpi3Board::new(timer::physical_count(platform))),
            console: TaskConsole::new(),
            stats: TaskStats::default(),
        })
    }

    /// Byte-level access to this task's RAM.
    pub fn guest_memory<'a>(&'a mut self, alloc: &'a mut PageAllocator) -> GuestMemory<'a> {
        GuestMemory::new(&mut self.space, alloc)
    }

    fn with_ctx<R>(
        &mut self,
        platform: &mut dyn Platform,
        alloc: &mut PageAllocator,
        f: impl FnOnce(&mut dyn BoardModel, &mut DeviceContext<'_>) -> R,
    ) -> R {
        let Task {
            board,
            console,
            space,
            ..
        } = self;
        let mut ctx = DeviceContext {
            console,
            platform,
            memory: GuestMemory::new(space, alloc),
        };
        f(board.as_mut(), &mut ctx)
    }

    pub fn mmio_read(
        &mut self,
        platform: &mut dyn Platform,
        alloc: &mut PageAllocator,
        addr: Pa,
    ) -> u64 {
        self.with_ctx(platform, alloc, |board, ctx| board.mmio_read(ctx, addr))
    }

    pub fn mmio_write(
        &mut self,
        platform: &mut dyn Platform,
        alloc: &mut PageAllocator,
        addr: Pa,
        val: u64,
    ) {
        self.with_ctx(platform, alloc, |board, ctx| {
            board.mmio_write(ctx, addr, val)
        })
    }

    pub fn entering_vm(&mut self, platform: &mut dyn Platform, alloc: &mut PageAllocator) {
        self.with_ctx(platform, alloc, |board, ctx| board.entering_vm(ctx))
    }

    pub fn leaving_vm(&mut self, platform: &mut dyn Platform, alloc: &mut PageAllocator) {
        self.with_ctx(platform, alloc, |board, ctx| board.leaving_vm(ctx))
    }

    pub fn irq_asserted(&mut self, platform: &mut dyn Platform, alloc: &mut PageAllocator) -> bool {
        self.with_ctx(platform, alloc, |board, ctx| board.irq_asserted(ctx))
    }

    pub fn fiq_asserted(&mut self, platform: &mut dyn Platform, alloc: &mut PageAllocator) -> bool {
        self.with_ctx(platform, alloc, |board, ctx| board.fiq_asserted(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPlatform;
    use basalt::board::{LOW_MEMORY, PBASE};

    #[test]
    fn new_task_premaps_device_pages_inaccessible() {
        let mut platform = MockPlatform::new();
        let mut alloc = PageAllocator::new(Pa::new(LOW_MEMORY).unwrap(), 512).unwrap();
        let pristine = SysRegs::default();
        let mut task = Task::new(
            1,
            String::from("t"),
            2,
            &mut alloc,
            &mut platform,
            &pristine,
        )
        .unwrap();

        let uart = Ipa::new(PBASE + 0x21_5000).unwrap();
        let entry = task.space.walk(&mut alloc, uart).unwrap();
        assert!(entry.is_valid());
        assert!(!entry.accessible());

        // Ordinary RAM is not mapped until the guest touches it.
        assert!(task.space.walk(&mut alloc, Ipa::new(0x8_0000).unwrap()).is_none());
        assert_eq!(task.counter, task.priority);
        assert_eq!(task.frame.pstate, PSR_MODE_EL1H);
    }
}
