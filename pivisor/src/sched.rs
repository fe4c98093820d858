//! Priority scheduler with decaying time slices.
//!
//! Each task carries a `counter` of remaining ticks. The runnable task
//! with the largest counter runs next; when every runnable counter hits
//! zero, all tasks age by `counter = counter / 2 + priority`, so higher
//! priority earns proportionally more CPU and sleepers regain credit.

use basalt::{info, CpuContext, Platform};

use crate::hv::Hypervisor;
use crate::task::TaskState;

impl<P: Platform> Hypervisor<P> {
    fn bump_preempt(&mut self, id: usize, delta: i64) {
        if let Some(task) = self.tasks[id].as_mut() {
            task.preempt_count += delta;
        }
    }

    /// Select the runnable task with the greatest remaining slice,
    /// aging everyone whenever all runnable slices are spent.
    fn pick_next(&mut self) -> usize {
        loop {
            let mut c: i64 = -1;
            let mut next = 0;
            for (i, slot) in self.tasks.iter().enumerate() {
                if let Some(task) = slot {
                    if task.state == TaskState::Running && task.counter > c {
                        c = task.counter;
                        next = i;
                    }
                }
            }
            if c != 0 {
                return next;
            }
            for task in self.tasks.iter_mut().flatten() {
                task.counter = (task.counter >> 1) + task.priority;
            }
        }
    }

    /// Pick and switch, without touching the current slice.
    pub fn reschedule(&mut self) {
        let prev = self.current;
        self.bump_preempt(prev, 1);
        let next = self.pick_next();
        self.switch_to(next);
        self.bump_preempt(prev, -1);
    }

    /// Voluntarily yield the rest of the slice.
    pub fn schedule(&mut self) {
        if let Some(task) = self.tasks[self.current].as_mut() {
            task.counter = 0;
        }
        self.reschedule();
    }

    /// One scheduler tick: burn a unit of the current slice and switch
    /// when it runs out, unless preemption is off.
    pub fn timer_tick(&mut self) {
        let (counter, preempt) = match self.tasks[self.current].as_mut() {
            Some(task) => {
                task.counter -= 1;
                (task.counter, task.preempt_count)
            }
            None => return,
        };
        if counter > 0 || preempt > 0 {
            return;
        }
        if let Some(task) = self.tasks[self.current].as_mut() {
            task.counter = 0;
        }
        self.reschedule();
    }

    fn switch_to(&mut self, next: usize) {
        if next == self.current {
            return;
        }
        let prev = self.current;
        self.current = next;

        let prev_ctx = match self.tasks[prev].as_mut() {
            Some(task) => &mut task.cpu_context as *mut CpuContext,
            None => core::ptr::null_mut(),
        };
        let next_ctx = match self.tasks[next].as_ref() {
            Some(task) => &task.cpu_context as *const CpuContext,
            None => return,
        };
        self.platform.cpu_switch_to(prev_ctx, next_ctx);
    }

    /// Retire the current task and hand the core to someone else.
    pub fn exit_current(&mut self) {
        if let Some(task) = self.tasks[self.current].as_mut() {
            task.state = TaskState::Zombie;
            info!("task {} [{}] exited", task.id, task.name);
        }
        self.schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{fresh_hv, spawn_guest};

    #[test]
    fn picks_largest_counter() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        let b = spawn_guest(&mut hv, "b");
        hv.task_mut(a).unwrap().counter = 3;
        hv.task_mut(b).unwrap().counter = 7;
        hv.reschedule();
        assert_eq!(hv.current_id(), b);
    }

    #[test]
    fn aging_gives_priority_proportional_slices() {
        let mut hv = fresh_hv();
        let lo = spawn_guest(&mut hv, "lo");
        let hi = spawn_guest(&mut hv, "hi");
        hv.task_mut(lo).unwrap().priority = 1;
        hv.task_mut(lo).unwrap().counter = 0;
        hv.task_mut(hi).unwrap().priority = 4;
        hv.task_mut(hi).unwrap().counter = 0;
        // Boot task must not win the refill round.
        hv.task_mut(0).unwrap().priority = 0;
        hv.task_mut(0).unwrap().counter = 0;

        let mut runs = [0usize; 2];
        for _ in 0..300 {
            hv.reschedule();
            match hv.current_id() {
                id if id == lo => runs[0] += 1,
                id if id == hi => runs[1] += 1,
                _ => {}
            }
            // Burn the whole slice.
            if let Some(task) = hv.task_mut(hv.current_id()) {
                task.counter = 0;
            }
        }
        // Rough 4:1 split in favor of the high-priority guest.
        assert!(runs[1] > runs[0] * 2, "runs: {:?}", runs);
    }

    #[test]
    fn zombies_are_never_selected() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        let b = spawn_guest(&mut hv, "b");
        hv.reschedule();
        hv.current = a;
        hv.exit_current();
        assert_ne!(hv.current_id(), a);
        for _ in 0..50 {
            hv.timer_tick();
            assert_ne!(hv.current_id(), a);
        }
        let _ = b;
    }

    #[test]
    fn tick_respects_remaining_slice_and_preemption() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.current = a;
        hv.task_mut(a).unwrap().counter = 3;

        hv.timer_tick();
        assert_eq!(hv.current_id(), a);
        assert_eq!(hv.task(a).unwrap().counter, 2);

        // With preemption off the slice may go negative but no switch
        // happens.
        hv.task_mut(a).unwrap().preempt_count = 1;
        for _ in 0..5 {
            hv.timer_tick();
        }
        assert_eq!(hv.current_id(), a);
        assert!(hv.task(a).unwrap().counter < 0);

        hv.task_mut(a).unwrap().preempt_count = 0;
        hv.timer_tick();
        assert_ne!(hv.current_id(), a);
    }

    #[test]
    fn yield_zeroes_slice_and_switches() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        let b = spawn_guest(&mut hv, "b");
        hv.current = a;
        hv.task_mut(a).unwrap().counter = 10;
        hv.task_mut(b).unwrap().counter = 5;
        hv.schedule();
        assert_eq!(hv.task(a).unwrap().counter, 0);
        assert_eq!(hv.current_id(), b);
        assert!(hv.platform.switches > 0);
    }

    #[test]
    fn all_zombies_falls_back_to_boot_task() {
        let mut hv = fresh_hv();
        let a = spawn_guest(&mut hv, "a");
        hv.current = a;
        hv.exit_current();
        assert_eq!(hv.current_id(), 0);
    }
}
