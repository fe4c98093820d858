//! Per-guest consoles multiplexed onto the physical UART.
//!
//! Each task owns an input and an output FIFO. The emulated UARTs read
//! and write those FIFOs; only the forwarded task's output is mirrored to
//! the physical UART. Typing `?<digit>` on the physical console switches
//! the forwarded task, `?l` prints the task table.

use crate::fifo::Fifo;
use crate::hv::Hypervisor;
use crate::task::{TaskState, NR_TASKS};
use basalt::board::{reg, AUX_MU_IIR_REG};
use basalt::{info, warning, Platform};

/// Escape prefix on the physical console.
pub const ESCAPE_CHAR: u8 = b'?';

/// The two FIFOs connecting a guest's emulated UARTs to the outside.
pub struct TaskConsole {
    /// Bytes typed for this guest, drained by its emulated UARTs.
    pub in_fifo: Fifo,
    /// Bytes the guest transmitted, drained to the physical UART when
    /// the guest is forwarded.
    pub out_fifo: Fifo,
}

impl TaskConsole {
    pub fn new() -> Self {
        Self {
            in_fifo: Fifo::new(),
            out_fifo: Fifo::new(),
        }
    }
}

impl Default for TaskConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> Hypervisor<P> {
    /// One byte arrived on the physical UART.
    pub fn handle_console_input(&mut self, received: u8) {
        if self.console_prev == ESCAPE_CHAR {
            if received.is_ascii_digit() {
                let id = (received - b'0') as usize;
                if id < NR_TASKS && self.tasks[id].is_some() {
                    self.forwarded = id;
                    info!("console: forwarded to task {}", id);
                    self.flush_console(id);
                } else {
                    warning!("console: no task {}", received - b'0');
                }
            } else if received == b'l' {
                self.show_task_list();
            }
        } else if received != ESCAPE_CHAR {
            let forwarded = self.forwarded;
            if let Some(task) = self.tasks[forwarded].as_mut() {
                if task.state == TaskState::Running
                    && task.console.in_fifo.push(received as u64).is_err()
                {
                    warning!("console: input overrun for task {}", forwarded);
                }
            }
        }
        self.console_prev = received;
        // Ack the physical receive interrupt.
        self.platform.mmio_write32(reg(AUX_MU_IIR_REG), 0x2);
    }

    /// Mirror a task's pending output to the physical UART.
    pub fn flush_console(&mut self, id: usize) {
        if let Some(task) = self.tasks[id].as_mut() {
            while let Some(b) = task.console.out_fifo.pop() {
                if b as u8 == b'\n' {
                    self.platform.putc(b'\r');
                }
                self.platform.putc(b as u8);
            }
        }
    }

    /// Print one line per task on the hypervisor console.
    pub fn show_task_list(&mut self) {
        info!("  id state    counter priority stats");
        for task in self.tasks.iter().flatten() {
            info!(
                "{:>4} {:<8} {:>7} {:>8} wfx={} hvc={} sysreg={} pf={} mmio={} [{}]",
                task.id,
                match task.state {
                    TaskState::Running => "running",
                    TaskState::Zombie => "zombie",
                },
                task.counter,
                task.priority,
                task.stats.wfx_traps,
                task.stats.hvc_traps,
                task.stats.sysreg_traps,
                task.stats.page_faults,
                task.stats.mmio_traps,
                task.name,
            );
        }
    }
}
