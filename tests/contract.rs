#![cfg(feature = "sim")]

use norflash::algorithm::Function;
use norflash::contract::{Contract, FAILED, OK};
use norflash::devices::{AM29F320DB, LPC18XX43XX_S25FL032};
use norflash::sim::{Fault, SimNor, SimSpiFlash};
use norflash::{NorFlash, SpiFlash};

fn contract() -> Contract<NorFlash<SimNor>> {
    let device = &AM29F320DB.descriptor;
    Contract::new(NorFlash::new(device.clone(), SimNor::new(device)).unwrap())
}

#[test]
fn test_lifecycle() {
    let mut contract = contract();
    assert!(!contract.is_active());
    assert_eq!(contract.init(0, 12_000_000, 2), OK);
    assert!(contract.is_active());
    assert_eq!(contract.erase_sector(0), OK);
    assert_eq!(contract.program_page(0, 4, &[0xDE, 0xAD, 0xBE, 0xEF]), OK);
    assert_eq!(contract.uninit(2), OK);
    assert!(!contract.is_active());

    let flash = contract.into_driver().unwrap();
    assert_eq!(&flash.into_access().memory()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn test_calls_without_init_fail() {
    let mut contract = contract();
    assert_eq!(contract.erase_chip(), FAILED);
    assert_eq!(contract.erase_sector(0), FAILED);
    assert_eq!(contract.program_page(0, 2, &[0, 0]), FAILED);
    assert_eq!(contract.uninit(1), FAILED);

    assert_eq!(contract.init(0, 0, 1), OK);
    assert_eq!(contract.uninit(1), OK);
    assert_eq!(contract.erase_chip(), FAILED);
}

#[test]
fn test_double_init_fails() {
    let mut contract = contract();
    assert_eq!(contract.init(0, 0, 1), OK);
    assert_eq!(contract.init(0, 0, 1), FAILED);
    assert!(contract.is_active());
    assert_eq!(contract.erase_chip(), OK);
}

#[test]
fn test_bad_arguments() {
    let mut contract = contract();
    assert_eq!(contract.init(0, 0, 2), OK);
    assert_eq!(contract.program_page(0, 8, &[1, 2, 3]), FAILED);
    assert_eq!(contract.program_page(0x0040_0000, 2, &[1, 2]), FAILED);
    assert!(contract.is_active());
    assert!(contract.session().unwrap().access().writes().is_empty());
}

#[test]
fn test_unrecognised_function_codes() {
    let mut contract = contract();
    assert_eq!(contract.init(0, 0, 0), OK);
    assert_eq!(contract.session().unwrap().context().function, Function::Unknown);
    assert_eq!(contract.uninit(7), OK);
    assert!(!contract.is_active());

    assert_eq!(contract.init(0, 0, 7), OK);
    assert_eq!(contract.erase_sector(0), OK);
    assert_eq!(contract.uninit(0), OK);
}

#[test]
fn test_device_failure_reported() {
    let device = &AM29F320DB.descriptor;
    let mut sim = SimNor::new(device);
    sim.inject(0, Fault::Timeout { after: 2 });
    let mut contract = Contract::new(NorFlash::new(device.clone(), sim).unwrap());
    assert_eq!(contract.init(0, 0, 2), OK);
    assert_eq!(contract.program_page(0, 2, &[0x12, 0x34]), FAILED);

    // The device was reset, so the session remains usable.
    assert_eq!(contract.program_page(2, 2, &[0x56, 0x78]), OK);
    let session = contract.session().unwrap();
    assert_eq!(&session.access().memory()[..4], &[0xFF, 0xFF, 0x56, 0x78]);
    assert_eq!(contract.uninit(2), OK);
}

#[test]
fn test_spi_init_failure_keeps_driver() {
    let device = &LPC18XX43XX_S25FL032.descriptor;
    let flash = SpiFlash::new(device.clone(), SimSpiFlash::absent()).unwrap();
    let mut contract = Contract::new(flash);
    assert_eq!(contract.init(0x1400_0000, 0, 1), FAILED);
    assert!(!contract.is_active());
    assert_eq!(contract.erase_chip(), FAILED);
    assert!(contract.into_driver().is_some());
}
