//! Flash programming lifecycle: initialise, erase, program, de-initialise.
//!
//! A driver is created for one device descriptor and one memory access provider.
//! Calling `init()` consumes the driver and returns a session which carries the
//! operation context (the base address the device is mapped at). All erase and
//! program operations happen on the session, and `uninit()` hands the driver
//! back, so only one session can ever be active per driver.

use std::convert::TryFrom;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::access::{BusWidth, MemoryAccess};
use crate::command::Sequencer;
use crate::device::{DeviceDescriptor, GeometryError};
use crate::poll::{self, PollLimits};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Device '{0}' is not a parallel flash device.")]
    NotParallel(String),
    #[error("Invalid device geometry")]
    Geometry(#[from] GeometryError),
    #[error("Address 0x{0:08X} is outside the device.")]
    AddressOutOfRange(u32),
    #[error("Polling error")]
    Poll(#[from] poll::Error),
    #[error("Verification failed at 0x{address:08X}: wrote 0x{wrote:02X}, read 0x{read:02X}.")]
    VerifyMismatch { address: u32, wrote: u8, read: u8 },
    #[error("Memory at 0x{address:08X} is not blank: read 0x{read:02X}.")]
    NotBlank { address: u32, read: u8 },
    #[error(transparent)]
    Access(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Purpose of a programming session, as passed to Init and UnInit.
///
/// The function is advisory: no operation depends on it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Function {
    /// Any code the host passes that is not one of the others.
    Unknown = 0,
    Erase = 1,
    Program = 2,
    Verify = 3,
}

/// State established by Init and used by every later operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OperationContext {
    /// Address the device is mapped at.
    pub base: u32,
    /// Target clock frequency in Hz.
    pub clock: u32,
    pub function: Function,
}

/// An idle flash driver, ready to start a session.
pub trait FlashDriver: Sized {
    type Session: FlashAlgorithm<Driver = Self>;
    type Error: std::error::Error + Send + Sync + 'static;

    fn device(&self) -> &DeviceDescriptor;

    /// Start a session with the device mapped at `base`.
    ///
    /// On failure the driver is handed back alongside the error.
    fn init(self, base: u32, clock: u32, function: Function)
        -> std::result::Result<Self::Session, (Self, Self::Error)>;
}

/// An active programming session.
pub trait FlashAlgorithm: Sized {
    type Driver: FlashDriver<Session = Self>;
    type Error: std::error::Error + Send + Sync + 'static;

    fn context(&self) -> &OperationContext;

    /// Erase the entire device.
    fn erase_chip(&mut self) -> std::result::Result<(), Self::Error>;

    /// Erase the sector starting at `address`.
    fn erase_sector(&mut self, address: u32) -> std::result::Result<(), Self::Error>;

    /// Program `data` starting at `address`.
    fn program_page(&mut self, address: u32, data: &[u8]) -> std::result::Result<(), Self::Error>;

    /// End the session, returning the idle driver and the outcome of any
    /// de-initialisation.
    fn uninit(self, function: Function)
        -> (Self::Driver, std::result::Result<(), Self::Error>);
}

/// Driver for memory-mapped NOR flash using the common command set.
pub struct NorFlash<M: MemoryAccess> {
    device: DeviceDescriptor,
    width: BusWidth,
    access: M,
    limits: PollLimits,
}

impl<M: MemoryAccess> NorFlash<M> {
    /// Create a new driver for `device`, accessed through `access`.
    ///
    /// Fails if the descriptor is not for a parallel bus device, or if its
    /// sector map is invalid.
    pub fn new(device: DeviceDescriptor, access: M) -> Result<Self> {
        let width = match device.bus_width() {
            Some(width) => width,
            None => return Err(Error::NotParallel(device.name.to_string())),
        };
        device.validate()?;
        Ok(NorFlash { device, width, access, limits: PollLimits::default() })
    }

    /// Replace the local polling limits.
    pub fn with_limits(mut self, limits: PollLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> PollLimits {
        self.limits
    }

    pub fn bus_width(&self) -> BusWidth {
        self.width
    }

    pub fn access(&mut self) -> &mut M {
        &mut self.access
    }

    pub fn into_access(self) -> M {
        self.access
    }

    /// Start a session with the device mapped at `base`.
    ///
    /// Parallel NOR requires no handshake, so this always succeeds.
    pub fn init(self, base: u32, clock: u32, function: Function) -> Session<M> {
        log::debug!("Init '{}' at 0x{:08X}, clock {}Hz, function {:?}",
                    self.device.name, base, clock, function);
        Session { flash: self, context: OperationContext { base, clock, function } }
    }
}

impl<M: MemoryAccess> FlashDriver for NorFlash<M> {
    type Session = Session<M>;
    type Error = Error;

    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    fn init(self, base: u32, clock: u32, function: Function)
        -> std::result::Result<Session<M>, (Self, Error)>
    {
        Ok(NorFlash::init(self, base, clock, function))
    }
}

/// Active session on a memory-mapped NOR device.
pub struct Session<M: MemoryAccess> {
    flash: NorFlash<M>,
    context: OperationContext,
}

impl<M: MemoryAccess> Session<M> {
    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.flash.device
    }

    pub fn access(&mut self) -> &mut M {
        &mut self.flash.access
    }

    /// Check the `len` bytes at `address` lie inside the device as mapped for
    /// this session, returning the device-relative offset of `address`.
    ///
    /// An empty range is checked as a single byte.
    fn offset(&self, address: u32, len: usize) -> Result<u32> {
        let size = u64::from(self.flash.device.size);
        match address.checked_sub(self.context.base) {
            Some(offset) if u64::from(offset) + len.max(1) as u64 <= size => Ok(offset),
            _ => Err(Error::AddressOutOfRange(address)),
        }
    }

    fn sequencer(&mut self) -> Sequencer<'_, M> {
        Sequencer::new(&mut self.flash.access, self.flash.width, self.context.base)
    }

    /// Erase the entire device.
    pub fn erase_chip(&mut self) -> Result<()> {
        let base = self.context.base;
        self.sequencer().chip_erase()?;
        poll::wait_toggle(&mut self.flash.access, self.flash.width, base, &self.flash.limits)?;
        log::debug!("Chip erase complete");
        Ok(())
    }

    /// Erase the sector starting at `address`.
    ///
    /// After the command is issued, waits for the erase timer bit before
    /// polling for completion.
    pub fn erase_sector(&mut self, address: u32) -> Result<()> {
        let offset = self.offset(address, 1)?;
        match self.flash.device.sector_at_offset(offset) {
            Some(sector) if sector.address == offset => {
                log::debug!("Erasing {} byte sector at 0x{:08X}", sector.size, address);
            },
            Some(sector) => {
                log::warn!("Address 0x{:08X} is not the start of its {} byte sector",
                           address, sector.size);
            },
            None => (),
        }

        let (width, limits) = (self.flash.width, self.flash.limits);
        self.sequencer().sector_erase(address)?;
        poll::wait_erase_timer(&mut self.flash.access, width, address, &limits)?;
        poll::wait_toggle(&mut self.flash.access, width, address, &limits)?;
        Ok(())
    }

    /// Program `data` starting at `address`, one bus-width unit at a time.
    ///
    /// A final partial unit is padded with the erased value. Stops at the first
    /// unit which fails, without attempting the rest.
    pub fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let unit = self.flash.width.unit_bytes();
        // Padding extends the write to a whole number of units.
        self.offset(address, data.len().div_ceil(unit) * unit)?;
        if data.len() > self.flash.device.page_size as usize {
            log::warn!("Programming {} bytes, more than the {} byte page size",
                       data.len(), self.flash.device.page_size);
        }
        log::debug!("Programming {} bytes at 0x{:08X}", data.len(), address);

        let (width, limits) = (self.flash.width, self.flash.limits);
        let erased = self.flash.device.erased_value;
        let mut address = address;
        for chunk in data.chunks(unit) {
            let mut bytes = [erased; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            let value = u32::from_le_bytes(bytes) & width.mask();
            self.sequencer().program(address, value)?;
            poll::wait_toggle(&mut self.flash.access, width, address, &limits)?;
            address = address.wrapping_add(unit as u32);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `address`.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.offset(address, buf.len())?;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.flash.access.read8(address.wrapping_add(i as u32))?;
        }
        Ok(())
    }

    /// Compare the device contents at `address` with `data`.
    ///
    /// Returns `VerifyMismatch` for the first differing byte.
    pub fn verify(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.offset(address, data.len())?;
        for (i, &wrote) in data.iter().enumerate() {
            let address = address.wrapping_add(i as u32);
            let read = self.flash.access.read8(address)?;
            if read != wrote {
                log::error!("Verify mismatch at 0x{:08X}: wrote 0x{:02X}, read 0x{:02X}",
                            address, wrote, read);
                return Err(Error::VerifyMismatch { address, wrote, read });
            }
        }
        Ok(())
    }

    /// Check that `size` bytes starting at `address` all hold the erased value.
    pub fn blank_check(&mut self, address: u32, size: u32) -> Result<()> {
        self.offset(address, size as usize)?;
        let erased = self.flash.device.erased_value;
        for i in 0..size {
            let address = address.wrapping_add(i);
            let read = self.flash.access.read8(address)?;
            if read != erased {
                return Err(Error::NotBlank { address, read });
            }
        }
        Ok(())
    }

    /// End the session and return the idle driver.
    pub fn uninit(self, function: Function) -> NorFlash<M> {
        log::debug!("UnInit '{}', function {:?}", self.flash.device.name, function);
        self.flash
    }
}

impl<M: MemoryAccess> FlashAlgorithm for Session<M> {
    type Driver = NorFlash<M>;
    type Error = Error;

    fn context(&self) -> &OperationContext {
        &self.context
    }

    fn erase_chip(&mut self) -> Result<()> {
        Session::erase_chip(self)
    }

    fn erase_sector(&mut self, address: u32) -> Result<()> {
        Session::erase_sector(self, address)
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        Session::program_page(self, address, data)
    }

    fn uninit(self, function: Function) -> (NorFlash<M>, Result<()>) {
        (Session::uninit(self, function), Ok(()))
    }
}

/// Parse a host tool function code, mapping unrecognised codes to `Function::Unknown`.
pub fn function_from_code(code: u32) -> Function {
    Function::try_from(code).unwrap_or(Function::Unknown)
}

#[test]
fn test_function_codes() {
    assert_eq!(function_from_code(1), Function::Erase);
    assert_eq!(function_from_code(2), Function::Program);
    assert_eq!(function_from_code(3), Function::Verify);
    assert_eq!(function_from_code(0), Function::Unknown);
    assert_eq!(function_from_code(7), Function::Unknown);
    assert_eq!(u32::from(Function::Verify), 3);
}
