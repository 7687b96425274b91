#![cfg(feature = "sim")]

use norflash::access::BusWidth;
use norflash::poll::{self, wait_erase_timer, wait_toggle, PollLimits};
use norflash::sim::ScriptedBus;

const ADDR: u32 = 0x0001_0000;

#[test]
fn test_converges_on_equal_toggles() {
    let mut bus = ScriptedBus::new(&[0x40, 0x00, 0x40, 0x40]);
    wait_toggle(&mut bus, BusWidth::Bits16, ADDR, &PollLimits::default()).unwrap();
    assert_eq!(bus.reads(), 4);
    assert_eq!(bus.remaining(), 0);
    assert!(bus.writes().is_empty());
}

#[test]
fn test_converged_reads_ignore_timeout_bit() {
    // Toggle bits agree, so the timeout bit on the second read is never consulted.
    let mut bus = ScriptedBus::new(&[0x60, 0x60]);
    wait_toggle(&mut bus, BusWidth::Bits8, ADDR, &PollLimits::default()).unwrap();
    assert_eq!(bus.reads(), 2);
    assert!(bus.writes().is_empty());
}

#[test]
fn test_completion_racing_timeout() {
    // Timeout bit set while still toggling, then the operation completes.
    let mut bus = ScriptedBus::new(&[0x40, 0x20, 0x44, 0x44]);
    wait_toggle(&mut bus, BusWidth::Bits16, ADDR, &PollLimits::default()).unwrap();
    assert_eq!(bus.reads(), 4);
    assert!(bus.writes().is_empty());
}

#[test]
fn test_timeout_resets_device() {
    let mut bus = ScriptedBus::new(&[0x40, 0x20, 0x40, 0x00]);
    let result = wait_toggle(&mut bus, BusWidth::Bits16, ADDR, &PollLimits::default());
    assert!(matches!(result, Err(poll::Error::Timeout { address: ADDR })));
    assert_eq!(bus.reads(), 4);
    assert_eq!(bus.writes(), &[(ADDR, 0xF0)]);
}

#[test]
fn test_poll_limit() {
    let mut bus = ScriptedBus::cycle(&[0x40, 0x00]);
    let limits = PollLimits { max_reads: Some(10), deadline: None };
    let result = wait_toggle(&mut bus, BusWidth::Bits16, ADDR, &limits);
    assert!(matches!(result, Err(poll::Error::PollLimit { address: ADDR, reads: 10 })));
    assert_eq!(bus.reads(), 10);
    assert_eq!(bus.writes(), &[(ADDR, 0xF0)]);
}

#[test]
fn test_bus_error_propagates() {
    let mut bus = ScriptedBus::new(&[0x40]);
    let result = wait_toggle(&mut bus, BusWidth::Bits16, ADDR, &PollLimits::default());
    assert!(matches!(result, Err(poll::Error::Access(_))));
}

#[test]
fn test_dual_chip_waits_for_both() {
    // The low chip finishes first; the high chip keeps toggling for one more read.
    let mut bus = ScriptedBus::new(&[0x0040_0040, 0x0000_0040, 0x0040_0040, 0x0040_0040]);
    wait_toggle(&mut bus, BusWidth::Bits32, ADDR, &PollLimits::default()).unwrap();
    assert_eq!(bus.reads(), 4);
}

#[test]
fn test_dual_chip_timeout_on_one_chip() {
    let mut bus = ScriptedBus::new(&[0x0040_0000, 0x0020_0040, 0x0040_0000, 0x0000_0000]);
    let result = wait_toggle(&mut bus, BusWidth::Bits32, ADDR, &PollLimits::default());
    assert!(matches!(result, Err(poll::Error::Timeout { .. })));
    assert_eq!(bus.writes(), &[(ADDR, 0x00F0_00F0)]);
}

#[test]
fn test_dual_chip_finished_half_reads_data() {
    // The high chip finishes first and returns erased data, whose DQ5 is set.
    // Only the low chip's status bits matter until it finishes too.
    let mut bus = ScriptedBus::new(&[0x0000_0040, 0xFFFF_0000, 0xFFFF_0040, 0xFFFF_0000,
                                     0xFFFF_FFFF, 0xFFFF_FFFF]);
    wait_toggle(&mut bus, BusWidth::Bits32, ADDR, &PollLimits::default()).unwrap();
    assert_eq!(bus.reads(), 6);
    assert_eq!(bus.remaining(), 0);
    assert!(bus.writes().is_empty());
}

#[test]
fn test_erase_timer() {
    let mut bus = ScriptedBus::new(&[0x00, 0x40, 0x48]);
    wait_erase_timer(&mut bus, BusWidth::Bits16, ADDR, &PollLimits::default()).unwrap();
    assert_eq!(bus.reads(), 3);

    // Both chips must have started.
    let mut bus = ScriptedBus::new(&[0x0000_0008, 0x0008_0008]);
    wait_erase_timer(&mut bus, BusWidth::Bits32, ADDR, &PollLimits::default()).unwrap();
    assert_eq!(bus.reads(), 2);
}

#[test]
fn test_erase_timer_limit() {
    let mut bus = ScriptedBus::cycle(&[0x40, 0x00]);
    let limits = PollLimits { max_reads: Some(5), deadline: None };
    let result = wait_erase_timer(&mut bus, BusWidth::Bits8, ADDR, &limits);
    assert!(matches!(result, Err(poll::Error::PollLimit { reads: 5, .. })));
    assert_eq!(bus.writes(), &[(ADDR, 0xF0)]);
}

#[test]
fn test_limits() {
    let limits = PollLimits::default();
    assert_eq!(limits.max_reads, Some(PollLimits::DEFAULT_MAX_READS));
    assert_eq!(limits.deadline, None);

    let limits = PollLimits::from_timeout(std::time::Duration::from_millis(100));
    assert_eq!(limits.deadline, Some(std::time::Duration::from_millis(200)));

    assert_eq!(PollLimits::unbounded().max_reads, None);
}
