//! Physical system timer driver.
//!
//! Comparator 1 paces the scheduler tick; comparator 3 is armed by the
//! device models with the nearest virtual timer expiry.

use basalt::board::{
    reg, SYSTIMER_C1, SYSTIMER_CHI, SYSTIMER_CLO, SYSTIMER_CS, SYSTIMER_CS_M1, SYSTIMER_CS_M3,
};
use basalt::Platform;

/// Scheduler tick period in timer ticks (1MHz).
pub const TICK_INTERVAL: u32 = 400_000;

/// Free-running 64-bit count.
pub fn physical_count(platform: &mut dyn Platform) -> u64 {
    let clo = platform.mmio_read32(reg(SYSTIMER_CLO)) as u64;
    let chi = platform.mmio_read32(reg(SYSTIMER_CHI)) as u64;
    clo | (chi << 32)
}

/// Arm the first scheduler tick.
pub fn init(platform: &mut dyn Platform) {
    let clo = platform.mmio_read32(reg(SYSTIMER_CLO));
    platform.mmio_write32(reg(SYSTIMER_C1), clo.wrapping_add(TICK_INTERVAL));
}

/// Acknowledge a scheduler tick and arm the next one.
pub fn rearm_tick(platform: &mut dyn Platform) {
    let clo = platform.mmio_read32(reg(SYSTIMER_CLO));
    platform.mmio_write32(reg(SYSTIMER_C1), clo.wrapping_add(TICK_INTERVAL));
    platform.mmio_write32(reg(SYSTIMER_CS), SYSTIMER_CS_M1);
}

/// Acknowledge a comparator 3 match. The emulated timers pick the event
/// up from their own expiry bookkeeping on the next guest entry.
pub fn ack_guest_match(platform: &mut dyn Platform) {
    platform.mmio_write32(reg(SYSTIMER_CS), SYSTIMER_CS_M3);
}
