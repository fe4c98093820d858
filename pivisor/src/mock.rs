//! Software stand-ins for the EL2 machine, used by the test suite.

use crate::console::TaskConsole;
use crate::dev::DeviceContext;
use crate::mm::{AddressSpace, GuestMemory, PageAllocator};
use basalt::board::{SYSTIMER_CHI, SYSTIMER_CLO};
use basalt::sysreg::SysRegs;
use basalt::{CpuContext, Gva, Ipa, Pa, Platform};
use std::collections::HashMap;

/// A recording [`Platform`] with a software system timer.
pub struct MockPlatform {
    /// MMIO register backing store.
    pub regs: HashMap<u64, u32>,
    /// Physical system timer count, advanced explicitly by tests.
    pub now: u64,
    /// Everything sent through `putc`.
    pub out: Vec<u8>,
    pub virq: bool,
    pub vfiq: bool,
    pub irq_enabled: bool,
    /// Last installed stage-2 root and VMID.
    pub stage2: Option<(Pa, u64)>,
    /// The "hardware" EL1 register file.
    pub hw_sysregs: SysRegs,
    /// Stage-1 page map (VA page base to IPA page base). Empty means the
    /// guest MMU is off and addresses pass through.
    pub stage1: HashMap<u64, u64>,
    /// MMIO write log in call order.
    pub writes: Vec<(u64, u32)>,
    /// Context switch log.
    pub switches: usize,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            regs: HashMap::new(),
            now: 1_000_000,
            out: Vec::new(),
            virq: false,
            vfiq: false,
            irq_enabled: false,
            stage2: None,
            hw_sysregs: SysRegs::default(),
            stage1: HashMap::new(),
            writes: Vec::new(),
            switches: 0,
        }
    }

    pub fn advance_time(&mut self, delta: u64) {
        self.now += delta;
    }

    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.out).into_owned()
    }
}

impl Platform for MockPlatform {
    fn mmio_read32(&mut self, addr: Pa) -> u32 {
        match addr.into_u64() {
            a if a == SYSTIMER_CLO => self.now as u32,
            a if a == SYSTIMER_CHI => (self.now >> 32) as u32,
            a => self.regs.get(&a).copied().unwrap_or(0),
        }
    }

    fn mmio_write32(&mut self, addr: Pa, val: u32) {
        self.writes.push((addr.into_u64(), val));
        self.regs.insert(addr.into_u64(), val);
    }

    fn load_guest_sysregs(&mut self, regs: &SysRegs) {
        self.hw_sysregs = regs.clone();
    }

    fn store_guest_sysregs(&mut self, regs: &mut SysRegs) {
        *regs = self.hw_sysregs.clone();
    }

    fn install_stage2(&mut self, root: Pa, vmid: u64) {
        self.stage2 = Some((root, vmid));
    }

    fn set_virtual_irq(&mut self, pending: bool) {
        self.virq = pending;
    }

    fn set_virtual_fiq(&mut self, pending: bool) {
        self.vfiq = pending;
    }

    fn enable_irq(&mut self) {
        self.irq_enabled = true;
    }

    fn disable_irq(&mut self) {
        self.irq_enabled = false;
    }

    fn translate_stage1(&mut self, va: Gva) -> Option<Ipa> {
        if self.stage1.is_empty() {
            return Ipa::new(va.into_u64());
        }
        let page = va.into_u64() & !basalt::PAGE_MASK;
        let ipa_page = *self.stage1.get(&page)?;
        Ipa::new(ipa_page | va.page_offset())
    }

    fn cpu_switch_to(&mut self, _prev: *mut CpuContext, _next: *const CpuContext) {
        self.switches += 1;
    }

    fn putc(&mut self, b: u8) {
        self.out.push(b);
    }

    fn halt(&mut self) -> ! {
        panic!("halt");
    }
}

/// A hypervisor over a [`MockPlatform`] with a roomy arena.
pub fn fresh_hv() -> crate::hv::Hypervisor<MockPlatform> {
    let alloc = PageAllocator::new(Pa::new(basalt::board::LOW_MEMORY).unwrap(), 2048).unwrap();
    crate::hv::Hypervisor::new(MockPlatform::new(), alloc).unwrap()
}

/// Create a minimal guest task and return its id.
pub fn spawn_guest(hv: &mut crate::hv::Hypervisor<MockPlatform>, name: &str) -> usize {
    let mut loader = crate::loader::RawBinaryLoader::new(vec![0u8; 16], 0, 0, 0x1000);
    hv.create_task(name, &mut loader).unwrap()
}

/// Everything a [`DeviceContext`] borrows, bundled for device-model tests.
pub struct TestRig {
    pub platform: MockPlatform,
    pub console: TaskConsole,
    pub alloc: PageAllocator,
    pub space: AddressSpace,
}

impl TestRig {
    pub fn new() -> Self {
        let mut alloc =
            PageAllocator::new(Pa::new(basalt::board::LOW_MEMORY).unwrap(), 256).unwrap();
        let space = AddressSpace::new(&mut alloc, 1).unwrap();
        Self {
            platform: MockPlatform::new(),
            console: TaskConsole::new(),
            alloc,
            space,
        }
    }

    pub fn ctx(&mut self) -> DeviceContext<'_> {
        DeviceContext {
            console: &mut self.console,
            platform: &mut self.platform,
            memory: GuestMemory::new(&mut self.space, &mut self.alloc),
        }
    }
}
