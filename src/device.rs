// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Static description of a flash part: address range, bus type, page size,
//! erased value, timing budgets and the sector map.
//!
//! Descriptors are plain data. The registry in `devices` defines them as
//! constants; `DeviceDescriptor::from_bytes()` additionally parses the binary
//! descriptor record consumed by host programming tools.

use std::borrow::Cow;
use std::convert::{TryFrom, TryInto};
use std::time::Duration;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::access::BusWidth;

/// Violations of the sector map and descriptor invariants.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum GeometryError {
    #[error("Sector map is empty.")]
    EmptySectorMap,
    #[error("First sector region starts at 0x{address:08X} instead of 0.")]
    FirstRegionNotAtStart { address: u32 },
    #[error("Sector region {index} has a sector size of zero.")]
    ZeroSectorSize { index: usize },
    #[error("Sector region {index} does not start after the previous region.")]
    RegionNotIncreasing { index: usize },
    #[error("Sector region {index} spans 0x{span:X} bytes, not a multiple of its sector size 0x{size:X}.")]
    PartialSector { index: usize, span: u32, size: u32 },
    #[error("Sector map covers 0x{covered:X} bytes but the device is 0x{size:X} bytes.")]
    CoverageMismatch { covered: u64, size: u32 },
    #[error("Page size is zero.")]
    ZeroPageSize,
}

/// Errors parsing or generating a binary descriptor record.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum RecordError {
    #[error("Descriptor record too short: {0} bytes.")]
    TooShort(usize),
    #[error("Unsupported descriptor record version 0x{0:04X}.")]
    BadVersion(u16),
    #[error("Unknown device type {0}.")]
    BadDeviceType(u16),
    #[error("Reserved field is 0x{0:08X}, must be zero.")]
    ReservedNonZero(u32),
    #[error("Sector list has no terminator.")]
    MissingTerminator,
    #[error("Device name is not valid UTF-8.")]
    BadName,
    #[error("Device name is longer than {} bytes.", NAME_LEN - 1)]
    NameTooLong,
    #[error("Sector list has more than {} entries.", SECTOR_NUM)]
    TooManySectors,
}

/// Device type codes as used in the descriptor record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum DeviceType {
    Unknown = 0,
    OnChip = 1,
    Ext8Bit = 2,
    Ext16Bit = 3,
    Ext32Bit = 4,
    ExtSpi = 5,
}

impl DeviceType {
    /// Parallel bus width for memory-mapped parts, or None otherwise.
    pub fn bus_width(&self) -> Option<BusWidth> {
        match self {
            DeviceType::Ext8Bit => Some(BusWidth::Bits8),
            DeviceType::Ext16Bit => Some(BusWidth::Bits16),
            DeviceType::Ext32Bit => Some(BusWidth::Bits32),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Unknown => "unknown",
            DeviceType::OnChip => "on-chip",
            DeviceType::Ext8Bit => "8-bit bus",
            DeviceType::Ext16Bit => "16-bit bus",
            DeviceType::Ext32Bit => "32-bit bus",
            DeviceType::ExtSpi => "SPI",
        }
    }
}

/// One entry of a sector map: from `address` up to the next region's address
/// (or the end of the device), every sector is `size` bytes.
///
/// `address` is relative to the device start.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SectorRegion {
    pub size: u32,
    pub address: u32,
}

impl SectorRegion {
    pub const fn new(size: u32, address: u32) -> Self {
        SectorRegion { size, address }
    }
}

/// A single erasable sector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SectorInfo {
    /// Absolute start address.
    pub address: u32,
    /// Size in bytes.
    pub size: u32,
}

impl SectorInfo {
    pub fn contains(&self, address: u32) -> bool {
        address >= self.address && (address - self.address) < self.size
    }
}

/// Descriptor record interface version.
pub const RECORD_VERSION: u16 = 0x0101;
/// Length of the fixed name field, including the NUL terminator.
pub const NAME_LEN: usize = 128;
/// Maximum number of sector entries in a record, including the terminator.
pub const SECTOR_NUM: usize = 512;
/// Value of both words of the terminating sector entry.
pub const SECTOR_END: u32 = 0xFFFF_FFFF;

const OFFSET_TYPE: usize = 130;
const OFFSET_START: usize = 132;
const OFFSET_SIZE: usize = 136;
const OFFSET_PAGE: usize = 140;
const OFFSET_RESERVED: usize = 144;
const OFFSET_EMPTY: usize = 148;
const OFFSET_TO_PROG: usize = 152;
const OFFSET_TO_ERASE: usize = 156;
const OFFSET_SECTORS: usize = 160;
/// Length of a complete record.
pub const RECORD_LEN: usize = OFFSET_SECTORS + SECTOR_NUM * 8;

/// Static description of one flash part.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceDescriptor {
    /// Display name.
    pub name: Cow<'static, str>,
    /// Bus type.
    pub device_type: DeviceType,
    /// Default start address of the device in the target's address space.
    pub start: u32,
    /// Total size in bytes.
    pub size: u32,
    /// Largest chunk accepted by a single page program operation.
    pub page_size: u32,
    /// Content of erased memory.
    pub erased_value: u8,
    /// Advisory page program timeout in milliseconds.
    pub program_timeout_ms: u32,
    /// Advisory sector erase timeout in milliseconds.
    pub erase_timeout_ms: u32,
    /// Sector map, in ascending address order.
    pub sectors: Cow<'static, [SectorRegion]>,
}

impl DeviceDescriptor {
    /// First address after the end of the device.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.size)
    }

    /// Check if the absolute `address` lies inside the device.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && (address - self.start) < self.size
    }

    pub fn bus_width(&self) -> Option<BusWidth> {
        self.device_type.bus_width()
    }

    pub fn program_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.program_timeout_ms))
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.erase_timeout_ms))
    }

    pub fn region_count(&self) -> usize {
        self.sectors.len()
    }

    /// Number of bytes covered by region `index`.
    ///
    /// The span of a region runs up to the start of the next region,
    /// or to the end of the device for the last region.
    pub fn region_span(&self, index: usize) -> u32 {
        let region = self.sectors[index];
        match self.sectors.get(index + 1) {
            Some(next) => next.address.wrapping_sub(region.address),
            None => self.size.wrapping_sub(region.address),
        }
    }

    /// Number of sectors in region `index`.
    pub fn region_sectors(&self, index: usize) -> u32 {
        match self.sectors[index].size {
            0 => 0,
            size => self.region_span(index) / size,
        }
    }

    /// Total number of sectors on the device.
    pub fn sector_count(&self) -> usize {
        (0..self.region_count()).map(|i| self.region_sectors(i) as usize).sum()
    }

    /// Iterate over every sector of the device, in address order.
    pub fn sectors(&self) -> impl Iterator<Item = SectorInfo> + '_ {
        let start = self.start;
        self.sectors.iter().enumerate().flat_map(move |(index, region)| {
            (0..self.region_sectors(index)).map(move |n| SectorInfo {
                address: start + region.address + n * region.size,
                size: region.size,
            })
        })
    }

    /// Find the index of the sector region containing the device-relative `offset`.
    pub fn region_at_offset(&self, offset: u32) -> Option<usize> {
        if offset >= self.size {
            return None;
        }
        self.sectors.iter().rposition(|region| region.address <= offset)
    }

    /// Find the sector containing the device-relative `offset`.
    ///
    /// The returned sector address is device-relative.
    pub fn sector_at_offset(&self, offset: u32) -> Option<SectorInfo> {
        let index = self.region_at_offset(offset)?;
        let region = self.sectors[index];
        if region.size == 0 {
            return None;
        }
        let n = (offset - region.address) / region.size;
        Some(SectorInfo { address: region.address + n * region.size, size: region.size })
    }

    /// Find the sector containing the absolute `address`.
    pub fn sector_at(&self, address: u32) -> Option<SectorInfo> {
        if !self.contains(address) {
            return None;
        }
        self.sector_at_offset(address - self.start)
            .map(|s| SectorInfo { address: s.address + self.start, size: s.size })
    }

    /// Check the descriptor invariants.
    ///
    /// Regions must start at offset 0, be strictly increasing, each span a
    /// whole number of sectors, and together cover exactly the device size.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.page_size == 0 {
            return Err(GeometryError::ZeroPageSize);
        }
        let first = self.sectors.first().ok_or(GeometryError::EmptySectorMap)?;
        if first.address != 0 {
            return Err(GeometryError::FirstRegionNotAtStart { address: first.address });
        }

        let mut covered: u64 = 0;
        for (index, region) in self.sectors.iter().enumerate() {
            if region.size == 0 {
                return Err(GeometryError::ZeroSectorSize { index });
            }
            if index > 0 && region.address <= self.sectors[index - 1].address {
                return Err(GeometryError::RegionNotIncreasing { index });
            }
            if index + 1 == self.sectors.len() && region.address >= self.size {
                return Err(GeometryError::CoverageMismatch {
                    covered: u64::from(region.address), size: self.size
                });
            }
            let span = self.region_span(index);
            if span % region.size != 0 {
                return Err(GeometryError::PartialSector { index, span, size: region.size });
            }
            covered += u64::from(region.size) * u64::from(span / region.size);
        }

        if covered != u64::from(self.size) {
            return Err(GeometryError::CoverageMismatch { covered, size: self.size });
        }
        Ok(())
    }

    /// Generate the binary descriptor record for this device.
    ///
    /// The record is always `RECORD_LEN` bytes, with unused sector
    /// entries after the terminator left as zero.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        if self.name.len() >= NAME_LEN {
            return Err(RecordError::NameTooLong);
        }
        if self.sectors.len() >= SECTOR_NUM {
            return Err(RecordError::TooManySectors);
        }

        let mut data = vec![0u8; RECORD_LEN];
        data[0..2].copy_from_slice(&RECORD_VERSION.to_le_bytes());
        data[2..2 + self.name.len()].copy_from_slice(self.name.as_bytes());
        let device_type: u16 = self.device_type.into();
        data[OFFSET_TYPE..OFFSET_TYPE + 2].copy_from_slice(&device_type.to_le_bytes());
        put_u32(&mut data, OFFSET_START, self.start);
        put_u32(&mut data, OFFSET_SIZE, self.size);
        put_u32(&mut data, OFFSET_PAGE, self.page_size);
        put_u32(&mut data, OFFSET_RESERVED, 0);
        data[OFFSET_EMPTY] = self.erased_value;
        put_u32(&mut data, OFFSET_TO_PROG, self.program_timeout_ms);
        put_u32(&mut data, OFFSET_TO_ERASE, self.erase_timeout_ms);

        let mut offset = OFFSET_SECTORS;
        for region in self.sectors.iter() {
            put_u32(&mut data, offset, region.size);
            put_u32(&mut data, offset + 4, region.address);
            offset += 8;
        }
        put_u32(&mut data, offset, SECTOR_END);
        put_u32(&mut data, offset + 4, SECTOR_END);

        Ok(data)
    }

    /// Parse a binary descriptor record.
    ///
    /// Only the bytes up to and including the sector terminator are
    /// required; a full `RECORD_LEN` record is not necessary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, RecordError> {
        log::debug!("Parsing descriptor record of {} bytes", data.len());
        if data.len() < OFFSET_SECTORS + 8 {
            return Err(RecordError::TooShort(data.len()));
        }

        let version = u16::from_le_bytes([data[0], data[1]]);
        if version != RECORD_VERSION {
            return Err(RecordError::BadVersion(version));
        }

        let name_field = &data[2..2 + NAME_LEN];
        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| RecordError::BadName)?
            .to_owned();

        let raw_type = u16::from_le_bytes([data[OFFSET_TYPE], data[OFFSET_TYPE + 1]]);
        let device_type = DeviceType::try_from(raw_type)
            .map_err(|_| RecordError::BadDeviceType(raw_type))?;

        let reserved = get_u32(data, OFFSET_RESERVED);
        if reserved != 0 {
            return Err(RecordError::ReservedNonZero(reserved));
        }

        let mut sectors = Vec::new();
        let mut terminated = false;
        for entry in data[OFFSET_SECTORS..].chunks_exact(8).take(SECTOR_NUM) {
            let size = get_u32(entry, 0);
            let address = get_u32(entry, 4);
            if size == SECTOR_END && address == SECTOR_END {
                terminated = true;
                break;
            }
            sectors.push(SectorRegion { size, address });
        }
        if !terminated {
            return Err(RecordError::MissingTerminator);
        }

        let descriptor = DeviceDescriptor {
            name: Cow::Owned(name),
            device_type,
            start: get_u32(data, OFFSET_START),
            size: get_u32(data, OFFSET_SIZE),
            page_size: get_u32(data, OFFSET_PAGE),
            erased_value: data[OFFSET_EMPTY],
            program_timeout_ms: get_u32(data, OFFSET_TO_PROG),
            erase_timeout_ms: get_u32(data, OFFSET_TO_ERASE),
            sectors: Cow::Owned(sectors),
        };
        log::debug!("Parsed descriptor: {:?}", descriptor);
        Ok(descriptor)
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Device: {}", self.name)?;
        writeln!(f, "  Type: {}", self.device_type.name())?;
        writeln!(f, "  Address: 0x{:08X}..0x{:08X} ({} bytes)",
                 self.start, self.end(), self.size)?;
        writeln!(f, "  Page size: {} bytes", self.page_size)?;
        writeln!(f, "  Erased value: 0x{:02X}", self.erased_value)?;
        writeln!(f, "  Timeouts: program page {}ms, erase sector {}ms",
                 self.program_timeout_ms, self.erase_timeout_ms)?;
        writeln!(f, "  Sector map:")?;
        for (index, region) in self.sectors.iter().enumerate() {
            writeln!(f, "    0x{:08X}: {} x {} kB", region.address,
                     self.region_sectors(index), region.size / 1024)?;
        }
        Ok(())
    }
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(data: &[u8], offset: usize) -> u32 {
    // Callers have already checked the slice is long enough.
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGIONS: &[SectorRegion] = &[
        SectorRegion::new(0x10000, 0x000000),
        SectorRegion::new(0x08000, 0x1F0000),
        SectorRegion::new(0x02000, 0x1F8000),
        SectorRegion::new(0x04000, 0x1FC000),
    ];

    fn descriptor(regions: &'static [SectorRegion]) -> DeviceDescriptor {
        DeviceDescriptor {
            name: Cow::Borrowed("Test Flash"),
            device_type: DeviceType::Ext16Bit,
            start: 0,
            size: 0x200000,
            page_size: 1024,
            erased_value: 0xFF,
            program_timeout_ms: 100,
            erase_timeout_ms: 3000,
            sectors: Cow::Borrowed(regions),
        }
    }

    #[test]
    fn test_region_sums() {
        let d = descriptor(REGIONS);
        assert_eq!(d.region_sectors(0), 31);
        assert_eq!(d.region_sectors(1), 1);
        assert_eq!(d.region_sectors(2), 2);
        assert_eq!(d.region_sectors(3), 1);
        assert_eq!(d.sector_count(), 35);
        assert_eq!(d.validate(), Ok(()));
    }

    #[test]
    fn test_sector_lookup() {
        let d = descriptor(REGIONS);
        assert_eq!(d.sector_at(0x0), Some(SectorInfo { address: 0x0, size: 0x10000 }));
        assert_eq!(d.sector_at(0x1EFFFF), Some(SectorInfo { address: 0x1E0000, size: 0x10000 }));
        assert_eq!(d.sector_at(0x1F7FFF), Some(SectorInfo { address: 0x1F0000, size: 0x8000 }));
        assert_eq!(d.sector_at(0x1FA000), Some(SectorInfo { address: 0x1FA000, size: 0x2000 }));
        assert_eq!(d.sector_at(0x1FFFFF), Some(SectorInfo { address: 0x1FC000, size: 0x4000 }));
        assert_eq!(d.sector_at(0x200000), None);
    }

    #[test]
    fn test_sector_lookup_offset_start() {
        let mut d = descriptor(REGIONS);
        d.start = 0x8000_0000;
        assert_eq!(d.sector_at(0x0), None);
        assert_eq!(d.sector_at(0x801F_9000),
                   Some(SectorInfo { address: 0x801F_8000, size: 0x2000 }));
        assert_eq!(d.sectors().next(), Some(SectorInfo { address: 0x8000_0000, size: 0x10000 }));
    }

    #[test]
    fn test_sectors_iter_contiguous() {
        let d = descriptor(REGIONS);
        let mut next = d.start;
        for sector in d.sectors() {
            assert_eq!(sector.address, next);
            next += sector.size;
        }
        assert_eq!(u64::from(next), d.end());
    }

    #[test]
    fn test_validate_errors() {
        const GAP: &[SectorRegion] = &[SectorRegion::new(0x10000, 0x0),
                                       SectorRegion::new(0x8000, 0x1F4000)];
        assert!(matches!(descriptor(GAP).validate(),
                         Err(GeometryError::PartialSector { index: 0, .. })));

        const LATE: &[SectorRegion] = &[SectorRegion::new(0x10000, 0x10000)];
        assert_eq!(descriptor(LATE).validate(),
                   Err(GeometryError::FirstRegionNotAtStart { address: 0x10000 }));

        const BACKWARDS: &[SectorRegion] = &[SectorRegion::new(0x10000, 0x0),
                                             SectorRegion::new(0x8000, 0x100000),
                                             SectorRegion::new(0x8000, 0x80000)];
        assert_eq!(descriptor(BACKWARDS).validate(),
                   Err(GeometryError::RegionNotIncreasing { index: 2 }));

        const ZERO: &[SectorRegion] = &[SectorRegion::new(0, 0x0)];
        assert_eq!(descriptor(ZERO).validate(), Err(GeometryError::ZeroSectorSize { index: 0 }));

        assert_eq!(descriptor(&[]).validate(), Err(GeometryError::EmptySectorMap));

        const SHORT: &[SectorRegion] = &[SectorRegion::new(0x10000, 0x0),
                                         SectorRegion::new(0x30000, 0x1F0000)];
        assert!(matches!(descriptor(SHORT).validate(),
                         Err(GeometryError::PartialSector { index: 1, .. })));
    }

    #[test]
    fn test_record_layout() {
        let d = descriptor(REGIONS);
        let data = d.to_bytes().unwrap();
        assert_eq!(data.len(), RECORD_LEN);
        assert_eq!(&data[0..2], &[0x01, 0x01]);
        assert_eq!(&data[2..12], b"Test Flash");
        assert_eq!(data[12], 0);
        assert_eq!(&data[130..132], &[3, 0]);
        assert_eq!(&data[136..140], &[0x00, 0x00, 0x20, 0x00]);
        assert_eq!(&data[140..144], &[0x00, 0x04, 0x00, 0x00]);
        assert_eq!(data[148], 0xFF);
        assert_eq!(&data[156..160], &3000u32.to_le_bytes());
        assert_eq!(&data[168..176], &[0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x1F, 0x00]);
        assert_eq!(&data[192..200], &[0xFF; 8]);
        assert_eq!(DeviceDescriptor::from_bytes(&data).unwrap(), d);
    }

    #[test]
    fn test_record_errors() {
        let d = descriptor(REGIONS);
        let data = d.to_bytes().unwrap();

        assert_eq!(DeviceDescriptor::from_bytes(&data[..100]), Err(RecordError::TooShort(100)));

        let mut bad = data.clone();
        bad[0] = 0x02;
        assert_eq!(DeviceDescriptor::from_bytes(&bad), Err(RecordError::BadVersion(0x0102)));

        let mut bad = data.clone();
        bad[130] = 9;
        assert_eq!(DeviceDescriptor::from_bytes(&bad), Err(RecordError::BadDeviceType(9)));

        let mut bad = data.clone();
        bad[144] = 1;
        assert_eq!(DeviceDescriptor::from_bytes(&bad), Err(RecordError::ReservedNonZero(1)));

        assert_eq!(DeviceDescriptor::from_bytes(&data[..190]), Err(RecordError::MissingTerminator));
    }
}
