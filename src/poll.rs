//! Completion polling using the toggle and timeout status bits.
//!
//! The device signals completion by its toggle bit reading the same value twice
//! in a row. If it exceeds its own internal timing limit it sets the timeout
//! bit instead; one more pair of reads then decides between a completion that
//! raced the timeout and a genuine failure, after which the device is reset.
//!
//! Because a faulty device may never do either, every wait is additionally
//! bounded by `PollLimits`.

use std::time::{Duration, Instant};
use crate::access::{BusWidth, MemoryAccess};
use crate::command::Sequencer;
use crate::status::Status;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Device at 0x{address:08X} reported a timeout and was reset.")]
    Timeout { address: u32 },
    #[error("Polling 0x{address:08X} gave up after {reads} reads.")]
    PollLimit { address: u32, reads: u64 },
    #[error(transparent)]
    Access(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Local bounds on how long a single wait may poll.
///
/// The device's own timeout bit is always honoured first; these limits only
/// stop a device that never converges and never reports a timeout from
/// blocking the caller forever.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PollLimits {
    /// Maximum number of status reads per wait.
    pub max_reads: Option<u64>,
    /// Maximum wall-clock time per wait.
    pub deadline: Option<Duration>,
}

impl PollLimits {
    pub const DEFAULT_MAX_READS: u64 = 1_000_000;

    /// No local limits at all; waits rely entirely on the device.
    pub fn unbounded() -> Self {
        PollLimits { max_reads: None, deadline: None }
    }

    /// Derive a wall-clock deadline of twice the advisory `timeout`.
    pub fn from_timeout(timeout: Duration) -> Self {
        PollLimits { max_reads: Some(Self::DEFAULT_MAX_READS), deadline: Some(timeout * 2) }
    }
}

impl Default for PollLimits {
    fn default() -> Self {
        PollLimits { max_reads: Some(Self::DEFAULT_MAX_READS), deadline: None }
    }
}

/// Counts the status reads of one wait and enforces its `PollLimits`.
struct Sampler<'a, M: MemoryAccess> {
    access: &'a mut M,
    width: BusWidth,
    address: u32,
    reads: u64,
    max_reads: Option<u64>,
    deadline: Option<Instant>,
}

impl<'a, M: MemoryAccess> Sampler<'a, M> {
    fn new(access: &'a mut M, width: BusWidth, address: u32, limits: &PollLimits) -> Self {
        Sampler {
            access, width, address,
            reads: 0,
            max_reads: limits.max_reads,
            deadline: limits.deadline.map(|d| Instant::now() + d),
        }
    }

    fn read(&mut self) -> Result<Status> {
        let value = self.access.read_word(self.width, self.address)?;
        self.reads += 1;
        let status = Status::new(self.width, value);
        log::trace!("Status at 0x{:08X}: 0x{:X}", self.address, status.value());
        Ok(status)
    }

    /// Fail with `PollLimit` if this wait has run out of reads or time.
    ///
    /// The device is reset before returning the error so it is left in read mode.
    fn check_limits(&mut self) -> Result<()> {
        let out_of_reads = matches!(self.max_reads, Some(max) if self.reads >= max);
        let out_of_time = matches!(self.deadline, Some(deadline) if Instant::now() >= deadline);
        if out_of_reads || out_of_time {
            log::error!("Device at 0x{:08X} did not respond within {} reads",
                        self.address, self.reads);
            self.reset()?;
            Err(Error::PollLimit { address: self.address, reads: self.reads })
        } else {
            Ok(())
        }
    }

    fn reset(&mut self) -> Result<()> {
        Sequencer::new(&mut *self.access, self.width, self.address).reset(self.address)?;
        Ok(())
    }
}

/// Wait for an embedded program or erase operation at `address` to finish.
///
/// Returns `Ok(())` as soon as two consecutive reads show the same toggle bits.
/// If a chip whose toggle bit is still changing sets its timeout bit, one
/// further pair of reads is made; if that chip still toggles the device is
/// reset and `Error::Timeout` returned. On dual parts a chip which has already
/// finished drives array data, so its DQ5 is ignored.
pub fn wait_toggle<M: MemoryAccess>(access: &mut M, width: BusWidth, address: u32,
                                    limits: &PollLimits) -> Result<()>
{
    let mut sampler = Sampler::new(access, width, address, limits);

    let mut last = sampler.read()?.toggle();
    loop {
        let status = sampler.read()?;
        let changed = status.toggle() ^ last;
        if changed == 0 {
            log::trace!("Operation at 0x{:08X} done after {} reads", address, sampler.reads);
            return Ok(());
        }
        last = status.toggle();

        let suspects = status.timed_out_toggles(changed);
        if suspects != 0 {
            log::debug!("Timeout bit set at 0x{:08X}, checking toggle once more", address);
            let first = sampler.read()?.toggle();
            if first == last {
                return Ok(());
            }
            let second = sampler.read()?.toggle();
            if (first ^ second) & suspects != 0 {
                log::error!("Device at 0x{:08X} timed out, resetting", address);
                sampler.reset()?;
                return Err(Error::Timeout { address });
            }
            if first == second {
                return Ok(());
            }
            last = second;
        }
        sampler.check_limits()?;
    }
}

/// Wait for the sector erase timer bit to be set on every chip at `address`.
///
/// Once set, the device no longer accepts further sector addresses and the
/// erase itself is running.
pub fn wait_erase_timer<M: MemoryAccess>(access: &mut M, width: BusWidth, address: u32,
                                         limits: &PollLimits) -> Result<()>
{
    let mut sampler = Sampler::new(access, width, address, limits);
    while !sampler.read()?.is_erase_timer_set() {
        sampler.check_limits()?;
    }
    log::trace!("Erase timer running at 0x{:08X} after {} reads", address, sampler.reads);
    Ok(())
}
