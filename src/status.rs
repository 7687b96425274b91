//! Status bits read back from a device while an embedded operation is running.
//!
//! While an erase or program operation is in progress, reading any address in
//! the affected sector returns status bits instead of array data. Each chip on
//! the bus drives its own status byte, so on 32-bit dual parts every bit is
//! checked in both halves of the word.

use crate::access::BusWidth;

/// DQ3: sector erase timer has expired and the erase has started.
pub const ERASE_TIMER_BIT: u8 = 1 << 3;
/// DQ5: the device exceeded its internal timing limit.
pub const TIMEOUT_BIT: u8 = 1 << 5;
/// DQ6: toggles on every read while an operation is in progress.
pub const TOGGLE_BIT: u8 = 1 << 6;

/// Snapshot of the status bits of every chip on the bus.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Status {
    value: u32,
    width: BusWidth,
}

impl Status {
    pub fn new(width: BusWidth, value: u32) -> Self {
        Status { value: value & width.mask(), width }
    }

    /// Raw value as read from the bus.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Toggle bits of all chips, suitable for comparing consecutive reads.
    pub fn toggle(&self) -> u32 {
        self.value & self.width.broadcast(TOGGLE_BIT)
    }

    /// Check if the toggle bit is set on any chip.
    pub fn is_toggle_bit_set(&self) -> bool {
        self.toggle() != 0
    }

    /// Check if any chip reports its timing limit exceeded.
    pub fn is_timeout_bit_set(&self) -> bool {
        self.value & self.width.broadcast(TIMEOUT_BIT) != 0
    }

    /// Toggle bits, out of `changed`, belonging to chips that also report a timeout.
    ///
    /// A chip that has finished returns array data, where DQ5 means nothing, so
    /// only chips still toggling are considered.
    pub fn timed_out_toggles(&self, changed: u32) -> u32 {
        ((self.value & self.width.broadcast(TIMEOUT_BIT)) << 1) & changed
    }

    /// Check if every chip has started its sector erase.
    pub fn is_erase_timer_set(&self) -> bool {
        let mask = self.width.broadcast(ERASE_TIMER_BIT);
        self.value & mask == mask
    }
}

#[test]
fn test_status_bits_16() {
    let s = Status::new(BusWidth::Bits16, 0x0048);
    assert!(s.is_toggle_bit_set());
    assert!(s.is_erase_timer_set());
    assert!(!s.is_timeout_bit_set());
    assert_eq!(s.toggle(), 0x40);
}

#[test]
fn test_status_bits_dual() {
    // Only the low chip has started its erase.
    let s = Status::new(BusWidth::Bits32, 0x0000_0008);
    assert!(!s.is_erase_timer_set());
    assert!(Status::new(BusWidth::Bits32, 0x0008_0008).is_erase_timer_set());

    // A timeout on either chip counts.
    assert!(Status::new(BusWidth::Bits32, 0x0020_0000).is_timeout_bit_set());

    // Only a chip still toggling can be timed out.
    let s = Status::new(BusWidth::Bits32, 0xFFFF_0060);
    assert_eq!(s.timed_out_toggles(0x0000_0040), 0x0000_0040);
    assert_eq!(s.timed_out_toggles(0x0040_0000), 0x0040_0000);
    let s = Status::new(BusWidth::Bits32, 0xFFFF_0040);
    assert_eq!(s.timed_out_toggles(0x0000_0040), 0);

    // Toggle comparison sees both chips.
    let a = Status::new(BusWidth::Bits32, 0x0040_0040);
    let b = Status::new(BusWidth::Bits32, 0x0040_0000);
    assert_ne!(a.toggle(), b.toggle());
}

#[test]
fn test_status_masks_width() {
    let s = Status::new(BusWidth::Bits8, 0xFF60);
    assert_eq!(s.value(), 0x60);
    assert!(s.is_timeout_bit_set());
}
