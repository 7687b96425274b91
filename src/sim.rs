// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Simulated flash devices for testing without hardware.
//!
//! `SimNor` models a parallel NOR device (or a pair of interleaved devices)
//! implementing the common command set, including toggle, timeout and erase
//! timer status bits and fault injection. `ScriptedBus` simply plays back a
//! fixed sequence of read values. `SimSpiFlash` models a basic SPI flash for
//! use with the `spi-flash` crate.

use std::collections::VecDeque;
use std::time::Duration;
use anyhow::bail;
use crate::access::{BusWidth, CommandCycle, MemoryAccess};
use crate::command::Command;
use crate::device::DeviceDescriptor;
use crate::status::{ERASE_TIMER_BIT, TIMEOUT_BIT, TOGGLE_BIT};

/// Misbehaviour to inject into a simulated operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Keep toggling forever without ever setting the timeout bit.
    NeverConverge,
    /// Set the timeout bit after `after` status reads and keep toggling until reset.
    Timeout { after: u32 },
    /// Set the timeout bit after `after` status reads, then complete on the next read.
    TimeoutRace { after: u32 },
}

/// Position in the command state machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Mode {
    Read,
    Unlocked1,
    Unlocked2,
    EraseSetup,
    EraseUnlocked1,
    EraseUnlocked2,
    ProgramSetup,
    Busy,
}

/// An embedded operation in progress.
#[derive(Copy, Clone, Debug)]
struct Operation {
    /// Status reads made so far.
    reads: u32,
    /// Status reads after which the operation completes, if ever.
    done_after: Option<u32>,
    /// Status reads after which the timeout bit is set, if ever.
    timeout_after: Option<u32>,
    /// Status reads for which the erase timer bit stays clear.
    timer_after: Option<u32>,
}

/// Simulated memory-mapped NOR flash.
pub struct SimNor {
    device: DeviceDescriptor,
    width: BusWidth,
    base: u32,
    memory: Vec<u8>,
    mode: Mode,
    toggle: bool,
    operation: Option<Operation>,
    program_reads: u32,
    erase_reads: u32,
    erase_timer_reads: u32,
    chip_skew: u32,
    pending_fault: Option<(usize, Fault)>,
    writes: Vec<(u32, u32)>,
    status_reads: u64,
    operations_started: usize,
}

impl SimNor {
    /// Create a simulated device for `device`, mapped at its default start
    /// address, with every byte erased.
    ///
    /// Panics if `device` is not a parallel bus device.
    pub fn new(device: &DeviceDescriptor) -> Self {
        let width = device.bus_width().expect("SimNor requires a parallel bus device");
        SimNor {
            device: device.clone(),
            width,
            base: device.start,
            memory: vec![device.erased_value; device.size as usize],
            mode: Mode::Read,
            toggle: false,
            operation: None,
            program_reads: 2,
            erase_reads: 8,
            erase_timer_reads: 2,
            chip_skew: 0,
            pending_fault: None,
            writes: Vec::new(),
            status_reads: 0,
            operations_started: 0,
        }
    }

    /// Map the device at `base` instead of its default start address.
    pub fn with_base(mut self, base: u32) -> Self {
        self.base = base;
        self
    }

    /// Set how many status reads program and erase operations stay busy for.
    pub fn with_busy_reads(mut self, program: u32, erase: u32) -> Self {
        self.program_reads = program;
        self.erase_reads = erase;
        self
    }

    /// Set how many status reads the erase timer bit stays clear after a sector erase.
    pub fn with_erase_timer_reads(mut self, reads: u32) -> Self {
        self.erase_timer_reads = reads;
        self
    }

    /// Let the upper chip of a dual part finish each operation `reads` status
    /// reads before the lower chip.
    pub fn with_chip_skew(mut self, reads: u32) -> Self {
        self.chip_skew = reads;
        self
    }

    /// Inject `fault` into the operation started after `skip` further operations.
    pub fn inject(&mut self, skip: usize, fault: Fault) {
        self.pending_fault = Some((skip, fault));
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Every write made to the device, as (address, value).
    pub fn writes(&self) -> &[(u32, u32)] {
        &self.writes
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Number of reads answered with status rather than array data.
    pub fn status_reads(&self) -> u64 {
        self.status_reads
    }

    /// Number of embedded operations started.
    pub fn operations_started(&self) -> usize {
        self.operations_started
    }

    pub fn is_busy(&self) -> bool {
        self.mode == Mode::Busy
    }

    fn offset(&self, address: u32, len: usize) -> anyhow::Result<usize> {
        match address.checked_sub(self.base) {
            Some(offset) if offset as usize + len <= self.memory.len() => Ok(offset as usize),
            _ => bail!("Address 0x{:08X} is outside the simulated device", address),
        }
    }

    fn is_command(&self, offset: usize, value: u32, cycle: CommandCycle, command: Command)
        -> bool
    {
        offset as u32 == self.width.command_offset(cycle)
            && value == self.width.broadcast(command.into())
    }

    fn start(&mut self, busy_reads: u32, timer_after: Option<u32>) -> bool {
        self.operations_started += 1;
        let fault = match self.pending_fault {
            Some((0, fault)) => {
                self.pending_fault = None;
                Some(fault)
            },
            Some((skip, fault)) => {
                self.pending_fault = Some((skip - 1, fault));
                None
            },
            None => None,
        };
        let (done_after, timeout_after) = match fault {
            None => (Some(busy_reads), None),
            Some(Fault::NeverConverge) => (None, None),
            Some(Fault::Timeout { after }) => (None, Some(after)),
            Some(Fault::TimeoutRace { after }) => (Some(after + 1), Some(after)),
        };
        self.operation = Some(Operation { reads: 0, done_after, timeout_after, timer_after });
        self.mode = Mode::Busy;
        // Array contents only change for operations that are allowed to finish.
        done_after.is_some()
    }

    fn program(&mut self, offset: usize, value: u32) {
        if self.start(self.program_reads, None) {
            let bytes = value.to_le_bytes();
            for (i, byte) in bytes.iter().take(self.width.unit_bytes()).enumerate() {
                self.memory[offset + i] &= byte;
            }
        }
    }

    fn erase_sector(&mut self, offset: usize) {
        let timer = Some(self.erase_timer_reads);
        if self.start(self.erase_reads, timer) {
            if let Some(sector) = self.device.sector_at_offset(offset as u32) {
                let start = sector.address as usize;
                let end = start + sector.size as usize;
                let erased = self.device.erased_value;
                self.memory[start..end].iter_mut().for_each(|b| *b = erased);
            }
        }
    }

    fn erase_chip(&mut self) {
        if self.start(self.erase_reads, None) {
            let erased = self.device.erased_value;
            self.memory.iter_mut().for_each(|b| *b = erased);
        }
    }

    fn write(&mut self, address: u32, value: u32) -> anyhow::Result<()> {
        let offset = self.offset(address, self.width.unit_bytes())?;
        self.writes.push((address, value));

        if value == self.width.broadcast(Command::Reset.into()) && self.mode != Mode::ProgramSetup {
            self.mode = Mode::Read;
            self.operation = None;
            return Ok(());
        }

        use CommandCycle::{First, Second};
        let mode = self.mode;
        self.mode = match mode {
            Mode::Read if self.is_command(offset, value, First, Command::Unlock1) =>
                Mode::Unlocked1,
            Mode::Unlocked1 if self.is_command(offset, value, Second, Command::Unlock2) =>
                Mode::Unlocked2,
            Mode::Unlocked2 if self.is_command(offset, value, First, Command::EraseSetup) =>
                Mode::EraseSetup,
            Mode::Unlocked2 if self.is_command(offset, value, First, Command::Program) =>
                Mode::ProgramSetup,
            Mode::EraseSetup if self.is_command(offset, value, First, Command::Unlock1) =>
                Mode::EraseUnlocked1,
            Mode::EraseUnlocked1 if self.is_command(offset, value, Second, Command::Unlock2) =>
                Mode::EraseUnlocked2,
            Mode::EraseUnlocked2 if self.is_command(offset, value, First, Command::ChipErase) => {
                self.erase_chip();
                Mode::Busy
            },
            Mode::EraseUnlocked2 if value == self.width.broadcast(Command::SectorErase.into()) => {
                self.erase_sector(offset);
                Mode::Busy
            },
            Mode::ProgramSetup => {
                self.program(offset, value);
                Mode::Busy
            },
            // Writes during an operation are ignored.
            Mode::Busy => Mode::Busy,
            _ => Mode::Read,
        };
        Ok(())
    }

    fn data(&self, offset: usize, len: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes[..len].copy_from_slice(&self.memory[offset..offset + len]);
        u32::from_le_bytes(bytes)
    }

    /// Check if `chip` has finished the current operation after `op.reads` status reads.
    fn chip_done(&self, op: &Operation, chip: usize) -> bool {
        // The upper chip of a dual part finishes early by the configured skew.
        let skew = if chip == 1 { self.chip_skew } else { 0 };
        matches!(op.done_after, Some(n) if op.reads >= n.saturating_sub(skew))
    }

    /// Produce the next status value, advancing the current operation.
    ///
    /// On dual parts a chip which has already finished drives array data
    /// onto its half of the bus while the other still drives status.
    fn status(&mut self, offset: usize, len: usize) -> Option<u32> {
        let mut op = self.operation?;
        let chips = self.width.chips();
        let done = [self.chip_done(&op, 0), chips < 2 || self.chip_done(&op, 1)];
        if done.iter().all(|&d| d) {
            self.operation = None;
            self.mode = Mode::Read;
            return None;
        }
        op.reads += 1;
        self.status_reads += 1;
        self.toggle = !self.toggle;

        let mut status = 0u8;
        if self.toggle {
            status |= TOGGLE_BIT;
        }
        if matches!(op.timeout_after, Some(n) if op.reads > n) {
            status |= TIMEOUT_BIT;
        }
        match op.timer_after {
            Some(n) if op.reads > n => status |= ERASE_TIMER_BIT,
            Some(_) => (),
            None => status |= ERASE_TIMER_BIT,
        }
        self.operation = Some(op);

        if chips == 1 {
            return Some(u32::from(status));
        }
        let data = self.data(offset, len);
        Some((0..chips).fold(0, |value, chip| {
            let shift = 16 * chip;
            let half = if done[chip] { (data >> shift) & 0xFFFF } else { u32::from(status) };
            value | (half << shift)
        }))
    }

    fn read(&mut self, address: u32, len: usize) -> anyhow::Result<u32> {
        let offset = self.offset(address, len)?;
        match self.status(offset, len) {
            Some(status) => Ok(status),
            None => Ok(self.data(offset, len)),
        }
    }
}

impl MemoryAccess for SimNor {
    fn read8(&mut self, address: u32) -> anyhow::Result<u8> {
        self.read(address, 1).map(|v| v as u8)
    }

    fn read16(&mut self, address: u32) -> anyhow::Result<u16> {
        self.read(address, 2).map(|v| v as u16)
    }

    fn read32(&mut self, address: u32) -> anyhow::Result<u32> {
        self.read(address, 4)
    }

    fn write8(&mut self, address: u32, value: u8) -> anyhow::Result<()> {
        self.write(address, u32::from(value))
    }

    fn write16(&mut self, address: u32, value: u16) -> anyhow::Result<()> {
        self.write(address, u32::from(value))
    }

    fn write32(&mut self, address: u32, value: u32) -> anyhow::Result<()> {
        self.write(address, value)
    }
}

/// Memory access which plays back scripted read values and records writes.
pub struct ScriptedBus {
    script: VecDeque<u32>,
    cycle: bool,
    writes: Vec<(u32, u32)>,
    reads: u64,
}

impl ScriptedBus {
    /// Play back `values` once; reading past the end is an error.
    pub fn new(values: &[u32]) -> Self {
        ScriptedBus { script: values.iter().copied().collect(), cycle: false,
                      writes: Vec::new(), reads: 0 }
    }

    /// Play back `values` repeatedly, forever.
    pub fn cycle(values: &[u32]) -> Self {
        ScriptedBus { cycle: true, ..ScriptedBus::new(values) }
    }

    pub fn writes(&self) -> &[(u32, u32)] {
        &self.writes
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Number of scripted values not yet read.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    fn next(&mut self) -> anyhow::Result<u32> {
        let value = match self.script.pop_front() {
            Some(value) => value,
            None => bail!("Read script exhausted after {} reads", self.reads),
        };
        if self.cycle {
            self.script.push_back(value);
        }
        self.reads += 1;
        Ok(value)
    }
}

impl MemoryAccess for ScriptedBus {
    fn read8(&mut self, _address: u32) -> anyhow::Result<u8> {
        self.next().map(|v| v as u8)
    }

    fn read16(&mut self, _address: u32) -> anyhow::Result<u16> {
        self.next().map(|v| v as u16)
    }

    fn read32(&mut self, _address: u32) -> anyhow::Result<u32> {
        self.next()
    }

    fn write8(&mut self, address: u32, value: u8) -> anyhow::Result<()> {
        self.writes.push((address, u32::from(value)));
        Ok(())
    }

    fn write16(&mut self, address: u32, value: u16) -> anyhow::Result<()> {
        self.writes.push((address, u32::from(value)));
        Ok(())
    }

    fn write32(&mut self, address: u32, value: u32) -> anyhow::Result<()> {
        self.writes.push((address, value));
        Ok(())
    }
}

/// Simulated SPI flash with 3-byte addressing, for the `spi-flash` crate.
pub struct SimSpiFlash {
    memory: Vec<u8>,
    jedec_id: [u8; 3],
    page_size: usize,
    write_enabled: bool,
    busy_polls: u32,
    busy_remaining: u32,
    commands: Vec<u8>,
}

impl SimSpiFlash {
    /// Create an erased simulated SPI flash of `size` bytes reporting `jedec_id`.
    pub fn new(size: usize, page_size: usize, jedec_id: [u8; 3]) -> Self {
        SimSpiFlash {
            memory: vec![0xFF; size],
            jedec_id,
            page_size,
            write_enabled: false,
            busy_polls: 2,
            busy_remaining: 0,
            commands: Vec::new(),
        }
    }

    /// Simulate a bus with nothing attached, which reads back all zeros.
    pub fn absent() -> Self {
        SimSpiFlash::new(0, 256, [0, 0, 0])
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Opcodes of every transaction so far.
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    fn address(data: &[u8]) -> usize {
        let mut bytes = [0u8; 4];
        let n = usize::min(3, data.len().saturating_sub(1));
        bytes[1..1 + n].copy_from_slice(&data[1..1 + n]);
        u32::from_be_bytes(bytes) as usize
    }

    fn erase(&mut self, address: usize, size: usize) {
        if self.memory.is_empty() {
            return;
        }
        let start = address - address % size;
        let end = usize::min(start + size, self.memory.len());
        if start < end {
            self.memory[start..end].iter_mut().for_each(|b| *b = 0xFF);
        }
        self.busy_remaining = self.busy_polls;
    }

    fn read_into(&self, address: usize, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.memory.get(address + i).copied().unwrap_or(0);
        }
    }
}

impl spi_flash::FlashAccess for SimSpiFlash {
    type Error = anyhow::Error;

    fn exchange(&mut self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut rx = vec![0u8; data.len()];
        let opcode = match data.first() {
            Some(&opcode) => opcode,
            None => return Ok(rx),
        };
        self.commands.push(opcode);
        if self.memory.is_empty() {
            return Ok(rx);
        }

        let busy = self.busy_remaining > 0;
        match opcode {
            0x06 if !busy => self.write_enabled = true,
            0x04 if !busy => self.write_enabled = false,
            0x05 => {
                if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                }
                let status = (busy as u8) | ((self.write_enabled as u8) << 1);
                rx.iter_mut().skip(1).for_each(|b| *b = status);
            },
            0x9F => {
                for (b, id) in rx.iter_mut().skip(1).zip(self.jedec_id.iter()) {
                    *b = *id;
                }
            },
            0x90 if rx.len() >= 6 => {
                rx[4] = self.jedec_id[0];
                rx[5] = self.jedec_id[2];
            },
            0xAB if rx.len() >= 5 => rx[4] = self.jedec_id[2],
            0x03 if rx.len() > 4 => {
                let address = Self::address(data);
                self.read_into(address, &mut rx[4..]);
            },
            0x0B if rx.len() > 5 => {
                let address = Self::address(data);
                self.read_into(address, &mut rx[5..]);
            },
            0x02 if self.write_enabled && !busy => {
                let address = Self::address(data);
                let page = address - address % self.page_size;
                for (i, byte) in data.iter().skip(4).enumerate() {
                    // Writes past the end of a page wrap to its start.
                    let target = page + (address - page + i) % self.page_size;
                    if let Some(cell) = self.memory.get_mut(target) {
                        *cell &= byte;
                    }
                }
                self.write_enabled = false;
                self.busy_remaining = self.busy_polls;
            },
            0x20 | 0x52 | 0xD8 if self.write_enabled && !busy => {
                let size = match opcode {
                    0x20 => 4 * 1024,
                    0x52 => 32 * 1024,
                    _ => 64 * 1024,
                };
                self.erase(Self::address(data), size);
                self.write_enabled = false;
            },
            0xC7 | 0x60 if self.write_enabled && !busy => {
                let size = self.memory.len();
                self.erase(0, size);
                self.write_enabled = false;
            },
            _ => (),
        }
        Ok(rx)
    }

    fn delay(&mut self, _dur: Duration) {}
}
