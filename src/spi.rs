//! Driver for SPI flash mapped into the address space by a SPI flash interface.
//!
//! Parallel NOR devices are programmed through `algorithm::NorFlash`; SPI parts
//! share the same `FlashDriver` lifecycle but forward every operation to the
//! `spi-flash` crate, using addresses relative to the mapped base.

use spi_flash::{Flash, FlashAccess, FlashID};
use crate::algorithm::{FlashAlgorithm, FlashDriver, Function, OperationContext};
use crate::device::{DeviceDescriptor, DeviceType, GeometryError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Device '{0}' is not a SPI flash device.")]
    NotSpi(String),
    #[error("Device capacity of {0} bytes needs more than 3 address bytes.")]
    Capacity(u32),
    #[error("Invalid device geometry")]
    Geometry(#[from] GeometryError),
    #[error("Address 0x{0:08X} is outside the device.")]
    AddressOutOfRange(u32),
    #[error("No erase instruction for {0} byte sectors.")]
    UnsupportedSectorSize(u32),
    #[error("Verification failed at 0x{address:08X}: wrote 0x{wrote:02X}, read 0x{read:02X}.")]
    VerifyMismatch { address: u32, wrote: u8, read: u8 },
    #[error("SPI flash error")]
    Flash(#[from] spi_flash::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Largest capacity addressable with 3-byte addresses.
const MAX_CAPACITY: u32 = 1 << 24;

/// Erase instruction for a given sector size.
fn erase_opcode(size: u32) -> Result<u8> {
    match size {
        0x1000 => Ok(0x20),
        0x8000 => Ok(0x52),
        0x10000 => Ok(0xD8),
        _ => Err(Error::UnsupportedSectorSize(size)),
    }
}

/// Idle driver for a SPI flash device.
pub struct SpiFlash<A: FlashAccess> {
    device: DeviceDescriptor,
    access: A,
}

impl<A: FlashAccess> SpiFlash<A>
where
    spi_flash::Error: From<A::Error>,
{
    pub fn new(device: DeviceDescriptor, access: A) -> Result<Self> {
        if device.device_type != DeviceType::ExtSpi {
            return Err(Error::NotSpi(device.name.to_string()));
        }
        if device.size > MAX_CAPACITY {
            return Err(Error::Capacity(device.size));
        }
        device.validate()?;
        for region in device.sectors.iter() {
            erase_opcode(region.size)?;
        }
        Ok(SpiFlash { device, access })
    }

    pub fn access(&mut self) -> &mut A {
        &mut self.access
    }

    pub fn into_access(self) -> A {
        self.access
    }

    /// Wrap the access provider in a `Flash` configured from the descriptor.
    fn flash(&mut self) -> Flash<'_, A> {
        let mut flash = Flash::new(&mut self.access);
        flash.set_capacity(self.device.size as usize);
        flash.set_page_size(self.device.page_size as usize);
        if let Some(region) = self.device.sectors.first() {
            flash.set_erase_size(region.size as usize);
            if let Ok(opcode) = erase_opcode(region.size) {
                flash.set_erase_opcode(opcode);
            }
        }
        flash
    }

    /// Start a session with the device mapped at `base`.
    ///
    /// The flash is woken, reset, and identified; a bus with nothing attached fails here.
    pub fn init(mut self, base: u32, clock: u32, function: Function)
        -> std::result::Result<SpiSession<A>, (Self, Error)>
    {
        log::debug!("Init '{}' at 0x{:08X}, clock {}Hz, function {:?}",
                    self.device.name, base, clock, function);
        let result = self.flash().read_id();
        let id = match result {
            Ok(id) => id,
            Err(e) => return Err((self, e.into())),
        };
        log::info!("Found SPI flash: {}", id);
        Ok(SpiSession { flash: self, context: OperationContext { base, clock, function }, id })
    }
}

impl<A: FlashAccess> FlashDriver for SpiFlash<A>
where
    spi_flash::Error: From<A::Error>,
{
    type Session = SpiSession<A>;
    type Error = Error;

    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    fn init(self, base: u32, clock: u32, function: Function)
        -> std::result::Result<SpiSession<A>, (Self, Error)>
    {
        SpiFlash::init(self, base, clock, function)
    }
}

/// Active session on a SPI flash device.
pub struct SpiSession<A: FlashAccess> {
    flash: SpiFlash<A>,
    context: OperationContext,
    id: FlashID,
}

impl<A: FlashAccess> SpiSession<A>
where
    spi_flash::Error: From<A::Error>,
{
    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.flash.device
    }

    /// Identification read during Init.
    pub fn id(&self) -> &FlashID {
        &self.id
    }

    pub fn access(&mut self) -> &mut A {
        &mut self.flash.access
    }

    /// Device-relative offset of the `len` bytes starting at `address`.
    fn offset(&self, address: u32, len: usize) -> Result<u32> {
        let size = u64::from(self.flash.device.size);
        match address.checked_sub(self.context.base) {
            Some(offset) if u64::from(offset) + len.max(1) as u64 <= size => Ok(offset),
            _ => Err(Error::AddressOutOfRange(address)),
        }
    }

    pub fn erase_chip(&mut self) -> Result<()> {
        log::debug!("Erasing SPI flash '{}'", self.flash.device.name);
        self.flash.flash().erase()?;
        Ok(())
    }

    /// Erase the sector containing `address`, using the erase instruction for its size.
    pub fn erase_sector(&mut self, address: u32) -> Result<()> {
        let offset = self.offset(address, 1)?;
        let sector = self.flash.device.sector_at_offset(offset)
                         .ok_or(Error::AddressOutOfRange(address))?;
        if sector.address != offset {
            log::warn!("Address 0x{:08X} is not the start of its {} byte sector",
                       address, sector.size);
        }
        let opcode = erase_opcode(sector.size)?;
        log::debug!("Erasing {} byte sector at 0x{:06X} with 0x{:02X}",
                    sector.size, offset, opcode);

        let mut flash = self.flash.flash();
        let n = flash.address_bytes() as usize;
        let bytes = offset.to_be_bytes();
        flash.write_enable()?;
        flash.write(opcode, &bytes[4 - n..])?;
        flash.wait_while_busy()?;
        Ok(())
    }

    /// Program `data` starting at `address`, split at page boundaries.
    pub fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let offset = self.offset(address, data.len())?;
        let page_size = self.flash.device.page_size;
        if data.len() > page_size as usize {
            log::warn!("Programming {} bytes, more than the {} byte page size",
                       data.len(), page_size);
        }
        log::debug!("Programming {} bytes at 0x{:08X}", data.len(), address);

        let mut flash = self.flash.flash();
        let mut offset = offset;
        let mut data = data;
        while !data.is_empty() {
            let room = (page_size - offset % page_size) as usize;
            let (page, rest) = data.split_at(usize::min(room, data.len()));
            flash.page_program(offset, page)?;
            offset += page.len() as u32;
            data = rest;
        }
        Ok(())
    }

    /// Read `length` bytes starting at `address`.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let offset = self.offset(address, length)?;
        Ok(self.flash.flash().read(offset, length)?)
    }

    /// Compare the device contents at `address` with `data`.
    pub fn verify(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let readback = self.read(address, data.len())?;
        for (i, (&wrote, &read)) in data.iter().zip(readback.iter()).enumerate() {
            if wrote != read {
                let address = address + i as u32;
                log::error!("Verify mismatch at 0x{:08X}: wrote 0x{:02X}, read 0x{:02X}",
                            address, wrote, read);
                return Err(Error::VerifyMismatch { address, wrote, read });
            }
        }
        Ok(())
    }

    /// End the session and return the idle driver.
    pub fn uninit(self, function: Function) -> SpiFlash<A> {
        log::debug!("UnInit '{}', function {:?}", self.flash.device.name, function);
        self.flash
    }
}

impl<A: FlashAccess> FlashAlgorithm for SpiSession<A>
where
    spi_flash::Error: From<A::Error>,
{
    type Driver = SpiFlash<A>;
    type Error = Error;

    fn context(&self) -> &OperationContext {
        &self.context
    }

    fn erase_chip(&mut self) -> Result<()> {
        SpiSession::erase_chip(self)
    }

    fn erase_sector(&mut self, address: u32) -> Result<()> {
        SpiSession::erase_sector(self, address)
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        SpiSession::program_page(self, address, data)
    }

    fn uninit(self, function: Function) -> (SpiFlash<A>, Result<()>) {
        (SpiSession::uninit(self, function), Ok(()))
    }
}

#[test]
fn test_erase_opcodes() {
    assert_eq!(erase_opcode(0x1000).unwrap(), 0x20);
    assert_eq!(erase_opcode(0x8000).unwrap(), 0x52);
    assert_eq!(erase_opcode(0x10000).unwrap(), 0xD8);
    assert!(matches!(erase_opcode(0x2000), Err(Error::UnsupportedSectorSize(0x2000))));
}
