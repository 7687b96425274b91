// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{fs::File, io::Write, time::Instant};
use clap::{Command, Arg, ArgAction, crate_description, crate_version, value_parser};
use clap_num::{maybe_hex, si_number};
use anyhow::bail;
use indicatif::{ProgressBar, ProgressStyle};

use norflash::{DeviceDescriptor, DeviceType, FlashAlgorithm, Function, NorFlash, PollLimits,
               SpiFlash};
use norflash::devices::{self, DeviceEntry};
use norflash::sim::{SimNor, SimSpiFlash};

const DATA_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
const COUNT_PROGRESS_TPL: &str =
    " {msg} [{bar:40}] {pos}/{len} sectors ({eta_precise})";
const PROGRESS_CHARS: &str = "=> ";

/// JEDEC ID reported by the simulated SPI flash.
const SIM_SPI_ID: [u8; 3] = [0x01, 0x02, 0x15];

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let device_arg = || Arg::new("device")
        .help("Device id or name (see `devices` output)")
        .required(true);
    let matches = Command::new("norflash")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("freq")
             .help("Target clock frequency in Hz passed to Init (k and M suffixes allowed)")
             .long("freq")
             .short('f')
             .action(ArgAction::Set)
             .default_value("12M")
             .value_parser(si_number::<u32>)
             .global(true))
        .subcommand(Command::new("devices")
            .about("List supported flash devices"))
        .subcommand(Command::new("info")
            .about("Show a device's descriptor and sector map")
            .arg(device_arg()))
        .subcommand(Command::new("check")
            .about("Validate the sector map of every supported device"))
        .subcommand(Command::new("sector")
            .about("Find the sector containing an address")
            .arg(device_arg())
            .arg(Arg::new("address")
                 .help("Absolute address (decimal, or hex with 0x prefix)")
                 .required(true)
                 .value_parser(maybe_hex::<u32>)))
        .subcommand(Command::new("descriptor")
            .about("Write a device's binary descriptor record to a file")
            .arg(device_arg())
            .arg(Arg::new("file")
                 .help("File to write the descriptor record to")
                 .required(true)))
        .subcommand(Command::new("parse")
            .about("Read and validate a binary descriptor record")
            .arg(Arg::new("file")
                 .help("Descriptor record file to read")
                 .required(true)))
        .subcommand(Command::new("simulate")
            .about("Erase, program and verify a binary file on a simulated device")
            .arg(device_arg())
            .arg(Arg::new("file")
                 .help("File to program")
                 .required(true))
            .arg(Arg::new("offset")
                 .help("Start offset (in bytes) inside the device (decimal, or hex with 0x prefix)")
                 .long("offset")
                 .action(ArgAction::Set)
                 .value_parser(maybe_hex::<u32>)
                 .default_value("0"))
            .arg(Arg::new("verify")
                 .help("Disable readback verification")
                 .short('n')
                 .long("no-verify")
                 .action(ArgAction::SetFalse))
            .arg(Arg::new("max-reads")
                 .help("Maximum status reads per wait before giving up")
                 .long("max-reads")
                 .action(ArgAction::Set)
                 .value_parser(value_parser!(u64)))
            .arg(Arg::new("image")
                 .help("Write the simulated device contents to this file afterwards")
                 .long("image")
                 .action(ArgAction::Set)))
        .get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    match matches.subcommand() {
        Some(("devices", _)) => print_device_list(),
        Some(("info", matches)) => {
            let entry = lookup(matches.get_one::<String>("device").unwrap())?;
            print!("{}", entry.descriptor);
            println!("  Sectors: {}", entry.descriptor.sector_count());
        },
        Some(("check", _)) => {
            let mut failed = 0;
            for entry in devices::all() {
                match entry.descriptor.validate() {
                    Ok(()) => if !quiet { println!("  {:<24} ok", entry.id) },
                    Err(e) => {
                        println!("  {:<24} {}", entry.id, e);
                        failed += 1;
                    },
                }
            }
            if failed > 0 {
                bail!("{} device descriptors are invalid.", failed);
            }
        },
        Some(("sector", matches)) => {
            let entry = lookup(matches.get_one::<String>("device").unwrap())?;
            let address = *matches.get_one::<u32>("address").unwrap();
            match entry.descriptor.sector_at(address) {
                Some(sector) => println!("Sector 0x{:08X}, {} bytes", sector.address, sector.size),
                None => bail!("Address 0x{:08X} is not inside {}.", address, entry.descriptor.name),
            }
        },
        Some(("descriptor", matches)) => {
            let entry = lookup(matches.get_one::<String>("device").unwrap())?;
            let path = matches.get_one::<String>("file").unwrap();
            let data = entry.descriptor.to_bytes()?;
            let mut file = File::create(path)?;
            file.write_all(&data)?;
            if !quiet { println!("Wrote {} byte descriptor record to {}", data.len(), path) };
        },
        Some(("parse", matches)) => {
            let path = matches.get_one::<String>("file").unwrap();
            let data = std::fs::read(path)?;
            let descriptor = DeviceDescriptor::from_bytes(&data)?;
            print!("{}", descriptor);
            descriptor.validate()?;
        },
        Some(("simulate", matches)) => {
            let entry = lookup(matches.get_one::<String>("device").unwrap())?;
            let path = matches.get_one::<String>("file").unwrap();
            let offset = *matches.get_one::<u32>("offset").unwrap();
            let verify = matches.get_flag("verify");
            let clock = *matches.get_one::<u32>("freq").unwrap();
            let mut limits = PollLimits::default();
            if let Some(&max_reads) = matches.get_one::<u64>("max-reads") {
                limits.max_reads = Some(max_reads);
            }
            let data = std::fs::read(path)?;
            let image = simulate(&entry.descriptor, offset, &data, verify, clock, limits, quiet)?;
            if let Some(path) = matches.get_one::<String>("image") {
                let mut file = File::create(path)?;
                file.write_all(&image)?;
            }
        },
        _ => panic!("Unhandled command."),
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

fn lookup(name: &str) -> anyhow::Result<&'static DeviceEntry> {
    match devices::by_name(name) {
        Some(entry) => Ok(entry),
        None => bail!("Unknown device '{}', see `norflash devices` for supported devices.", name),
    }
}

fn print_device_list() {
    println!("Supported devices:");
    for entry in devices::all() {
        let d = &entry.descriptor;
        println!("  {:<24} {:<32} {:<12} {:>5} kB", entry.id, d.name, d.device_type.name(),
                 d.size / 1024);
    }
}

/// Erase, program, and optionally verify `data` at `offset` on a simulated device,
/// returning the final device contents.
fn simulate(device: &DeviceDescriptor, offset: u32, data: &[u8], verify: bool, clock: u32,
            limits: PollLimits, quiet: bool) -> anyhow::Result<Vec<u8>>
{
    if u64::from(offset) + data.len() as u64 > u64::from(device.size) {
        bail!("{} bytes at offset 0x{:08X} do not fit in the {} byte device.",
              data.len(), offset, device.size);
    }
    let base = device.start;
    let address = base + offset;

    if device.device_type == DeviceType::ExtSpi {
        let sim = SimSpiFlash::new(device.size as usize, device.page_size as usize, SIM_SPI_ID);
        let flash = SpiFlash::new(device.clone(), sim)?;
        let mut session = flash.init(base, clock, Function::Program).map_err(|(_, e)| e)?;
        write_image(&mut session, device, address, data, quiet)?;
        if verify {
            if !quiet { println!("Verifying...") };
            session.verify(address, data)?;
        }
        let mut flash = session.uninit(Function::Program);
        Ok(flash.access().memory().to_vec())
    } else {
        let sim = SimNor::new(device);
        let flash = NorFlash::new(device.clone(), sim)?.with_limits(limits);
        let mut session = flash.init(base, clock, Function::Program);
        write_image(&mut session, device, address, data, quiet)?;
        if verify {
            if !quiet { println!("Verifying...") };
            session.verify(address, data)?;
        }
        let mut flash = session.uninit(Function::Program);
        Ok(flash.access().memory().to_vec())
    }
}

/// Erase every sector overlapping `data` and then program it page by page.
fn write_image<S: FlashAlgorithm>(session: &mut S, device: &DeviceDescriptor, address: u32,
                                  data: &[u8], quiet: bool) -> anyhow::Result<()>
{
    let end = u64::from(address) + data.len() as u64;
    let sectors: Vec<_> = device.sectors()
        .filter(|s| u64::from(s.address) < end && u64::from(s.address + s.size) > u64::from(address))
        .collect();

    let pb = progress_bar(sectors.len() as u64, COUNT_PROGRESS_TPL, quiet)?;
    pb.set_message("Erasing");
    for sector in sectors.iter() {
        session.erase_sector(sector.address)?;
        pb.inc(1);
    }
    pb.finish();

    let page_size = device.page_size as usize;
    let pb = progress_bar(data.len() as u64, DATA_PROGRESS_TPL, quiet)?;
    pb.set_message("Writing");
    let mut written = 0;
    for page in data.chunks(page_size) {
        session.program_page(address + written as u32, page)?;
        written += page.len();
        pb.set_position(written as u64);
    }
    pb.finish();
    Ok(())
}

fn progress_bar(len: u64, template: &str, quiet: bool) -> anyhow::Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    Ok(ProgressBar::new(len).with_style(ProgressStyle::default_bar()
        .template(template)?.progress_chars(PROGRESS_CHARS)))
}
