//! Unlock and command sequences of the AMD/JEDEC common command set.
//!
//! Every command starts with the two unlock cycles, written at the two fixed
//! command addresses scaled to the bus width. Command bytes are broadcast to
//! every chip on the bus so both halves of a dual part see the same sequence.

use num_enum::IntoPrimitive;
use crate::access::{BusWidth, CommandCycle, MemoryAccess};

/// Command set bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    Unlock1             = 0xAA,
    Unlock2             = 0x55,
    EraseSetup          = 0x80,
    ChipErase           = 0x10,
    SectorErase         = 0x30,
    Program             = 0xA0,
    Reset               = 0xF0,
}

/// Issues command sequences to a device at `base`.
pub struct Sequencer<'a, M: MemoryAccess> {
    access: &'a mut M,
    width: BusWidth,
    base: u32,
}

impl<'a, M: MemoryAccess> Sequencer<'a, M> {
    pub fn new(access: &'a mut M, width: BusWidth, base: u32) -> Self {
        Sequencer { access, width, base }
    }

    /// Write `command` to the given command cycle address.
    fn cycle(&mut self, cycle: CommandCycle, command: Command) -> anyhow::Result<()> {
        let address = self.base + self.width.command_offset(cycle);
        self.write(address, command)
    }

    /// Write `command` at an absolute address.
    fn write(&mut self, address: u32, command: Command) -> anyhow::Result<()> {
        let value = self.width.broadcast(command.into());
        self.access.write_word(self.width, address, value)
    }

    /// Issue the two unlock cycles.
    pub fn unlock(&mut self) -> anyhow::Result<()> {
        self.cycle(CommandCycle::First, Command::Unlock1)?;
        self.cycle(CommandCycle::Second, Command::Unlock2)
    }

    /// Unlock, erase setup, unlock.
    fn erase_preamble(&mut self) -> anyhow::Result<()> {
        self.unlock()?;
        self.cycle(CommandCycle::First, Command::EraseSetup)?;
        self.unlock()
    }

    /// Start erasing the whole device.
    pub fn chip_erase(&mut self) -> anyhow::Result<()> {
        log::debug!("Issuing chip erase at base 0x{:08X}", self.base);
        self.erase_preamble()?;
        self.cycle(CommandCycle::First, Command::ChipErase)
    }

    /// Start erasing the sector at `address`.
    ///
    /// The final command byte is written to the sector itself rather than a
    /// command address.
    pub fn sector_erase(&mut self, address: u32) -> anyhow::Result<()> {
        log::debug!("Issuing sector erase at 0x{:08X}", address);
        self.erase_preamble()?;
        self.write(address, Command::SectorErase)
    }

    /// Start programming one bus-width unit `value` at `address`.
    pub fn program(&mut self, address: u32, value: u32) -> anyhow::Result<()> {
        self.unlock()?;
        self.cycle(CommandCycle::First, Command::Program)?;
        self.access.write_word(self.width, address, value & self.width.mask())
    }

    /// Return the device at `address` to read mode.
    pub fn reset(&mut self, address: u32) -> anyhow::Result<()> {
        log::debug!("Resetting device at 0x{:08X}", address);
        self.write(address, Command::Reset)
    }
}
