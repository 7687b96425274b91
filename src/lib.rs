// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! norflash
//!
//! Flash programming algorithms for parallel NOR flash using the AMD/JEDEC
//! common command set, and for SPI flash mapped into the address space.

pub mod access;
pub mod device;
pub mod devices;
pub mod status;
pub mod command;
pub mod poll;
pub mod algorithm;
pub mod contract;
pub mod spi;

#[cfg(feature = "sim")]
pub mod sim;

pub use access::{MemoryAccess, BusWidth};
pub use device::{DeviceDescriptor, DeviceType, SectorRegion, SectorInfo};
pub use poll::PollLimits;
pub use algorithm::{FlashAlgorithm, FlashDriver, Function, NorFlash, Session};
pub use contract::Contract;
pub use spi::{SpiFlash, SpiSession};
