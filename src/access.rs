// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Memory-mapped access to the flash device.
//!
//! The algorithms in this crate never touch memory directly. Instead every read
//! and write is performed through a `MemoryAccess` provider, which may be a
//! volatile pointer wrapper running on the target, a debug probe performing
//! memory accesses remotely, or the simulated devices in `sim`.

/// Trait for objects which provide memory-mapped access to a flash device.
///
/// Addresses are absolute addresses in the target's address space.
/// Providers implement the three access sizes; the provided `read_word()`
/// and `write_word()` methods select one based on a `BusWidth`.
pub trait MemoryAccess {
    fn read8(&mut self, address: u32) -> anyhow::Result<u8>;
    fn read16(&mut self, address: u32) -> anyhow::Result<u16>;
    fn read32(&mut self, address: u32) -> anyhow::Result<u32>;

    fn write8(&mut self, address: u32, value: u8) -> anyhow::Result<()>;
    fn write16(&mut self, address: u32, value: u16) -> anyhow::Result<()>;
    fn write32(&mut self, address: u32, value: u32) -> anyhow::Result<()>;

    /// Read one bus-width unit from `address`, zero-extended into a `u32`.
    fn read_word(&mut self, width: BusWidth, address: u32) -> anyhow::Result<u32> {
        match width {
            BusWidth::Bits8 => self.read8(address).map(u32::from),
            BusWidth::Bits16 => self.read16(address).map(u32::from),
            BusWidth::Bits32 => self.read32(address),
        }
    }

    /// Write one bus-width unit to `address`, truncating `value` to the bus width.
    fn write_word(&mut self, width: BusWidth, address: u32, value: u32) -> anyhow::Result<()> {
        log::trace!("Write 0x{:0w$X} to 0x{:08X}", value, address, w = width.unit_bytes() * 2);
        match width {
            BusWidth::Bits8 => self.write8(address, value as u8),
            BusWidth::Bits16 => self.write16(address, value as u16),
            BusWidth::Bits32 => self.write32(address, value),
        }
    }
}

impl<M: MemoryAccess + ?Sized> MemoryAccess for &mut M {
    fn read8(&mut self, address: u32) -> anyhow::Result<u8> {
        (**self).read8(address)
    }

    fn read16(&mut self, address: u32) -> anyhow::Result<u16> {
        (**self).read16(address)
    }

    fn read32(&mut self, address: u32) -> anyhow::Result<u32> {
        (**self).read32(address)
    }

    fn write8(&mut self, address: u32, value: u8) -> anyhow::Result<()> {
        (**self).write8(address, value)
    }

    fn write16(&mut self, address: u32, value: u16) -> anyhow::Result<()> {
        (**self).write16(address, value)
    }

    fn write32(&mut self, address: u32, value: u32) -> anyhow::Result<()> {
        (**self).write32(address, value)
    }
}

/// Width of the data bus between the processor and the flash device(s).
///
/// 32-bit parts are two 16-bit chips side by side, one on each half of the bus.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusWidth {
    Bits8,
    Bits16,
    Bits32,
}

/// Command-cycle addresses of the common command set, in device words.
const CYCLE_ADDR_1: u32 = 0x555;
const CYCLE_ADDR_2: u32 = 0x2AA;

impl BusWidth {
    /// Number of bytes transferred per bus access.
    pub fn unit_bytes(&self) -> usize {
        match self {
            BusWidth::Bits8 => 1,
            BusWidth::Bits16 => 2,
            BusWidth::Bits32 => 4,
        }
    }

    /// Mask of the valid bits of a value on this bus.
    pub fn mask(&self) -> u32 {
        match self {
            BusWidth::Bits8 => 0x0000_00FF,
            BusWidth::Bits16 => 0x0000_FFFF,
            BusWidth::Bits32 => 0xFFFF_FFFF,
        }
    }

    /// Number of chips sharing the bus.
    pub fn chips(&self) -> usize {
        match self {
            BusWidth::Bits32 => 2,
            _ => 1,
        }
    }

    /// Device-relative byte offset of the given command cycle address.
    pub fn command_offset(&self, cycle: CommandCycle) -> u32 {
        let word = match cycle {
            CommandCycle::First => CYCLE_ADDR_1,
            CommandCycle::Second => CYCLE_ADDR_2,
        };
        word * self.unit_bytes() as u32
    }

    /// Replicate a command byte across every chip on the bus.
    pub fn broadcast(&self, byte: u8) -> u32 {
        match self {
            BusWidth::Bits32 => u32::from(byte) | (u32::from(byte) << 16),
            _ => u32::from(byte),
        }
    }
}

/// The two fixed addresses used by unlock and command cycles.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandCycle {
    /// Word address 0x555.
    First,
    /// Word address 0x2AA.
    Second,
}

#[test]
fn test_command_offsets() {
    assert_eq!(BusWidth::Bits8.command_offset(CommandCycle::First), 0x555);
    assert_eq!(BusWidth::Bits8.command_offset(CommandCycle::Second), 0x2AA);
    assert_eq!(BusWidth::Bits16.command_offset(CommandCycle::First), 0xAAA);
    assert_eq!(BusWidth::Bits16.command_offset(CommandCycle::Second), 0x554);
    assert_eq!(BusWidth::Bits32.command_offset(CommandCycle::First), 0x1554);
    assert_eq!(BusWidth::Bits32.command_offset(CommandCycle::Second), 0xAA8);
}

#[test]
fn test_broadcast() {
    assert_eq!(BusWidth::Bits8.broadcast(0xAA), 0xAA);
    assert_eq!(BusWidth::Bits16.broadcast(0x55), 0x55);
    assert_eq!(BusWidth::Bits32.broadcast(0xF0), 0x00F0_00F0);
}
