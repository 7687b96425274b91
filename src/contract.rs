//! Adapter exposing a driver through the fixed host-tool calling contract.
//!
//! Host tools call Init, then any sequence of EraseChip, EraseSector and
//! ProgramPage, then UnInit. Every call returns 0 for success or 1 for failure;
//! the underlying error is logged rather than returned.

use crate::algorithm::{function_from_code, FlashAlgorithm, FlashDriver, Function};

/// Result code for a successful call.
pub const OK: i32 = 0;
/// Result code for a failed call.
pub const FAILED: i32 = 1;

enum State<D: FlashDriver> {
    Idle(D),
    Active(D::Session),
    /// Only observed while a transition is in progress.
    Switching,
}

/// Host-tool contract around a `FlashDriver`.
pub struct Contract<D: FlashDriver> {
    state: State<D>,
}

impl<D: FlashDriver> Contract<D> {
    pub fn new(driver: D) -> Self {
        Contract { state: State::Idle(driver) }
    }

    /// Check if a session is active.
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    /// Access the active session, if any.
    pub fn session(&mut self) -> Option<&mut D::Session> {
        match &mut self.state {
            State::Active(session) => Some(session),
            _ => None,
        }
    }

    /// Recover the idle driver, or None if a session is still active.
    pub fn into_driver(self) -> Option<D> {
        match self.state {
            State::Idle(driver) => Some(driver),
            _ => None,
        }
    }

    /// Init(adr, clk, fnc).
    pub fn init(&mut self, adr: u32, clk: u32, fnc: u32) -> i32 {
        let function = parse_function("Init", fnc);
        match std::mem::replace(&mut self.state, State::Switching) {
            State::Idle(driver) => match driver.init(adr, clk, function) {
                Ok(session) => {
                    self.state = State::Active(session);
                    OK
                },
                Err((driver, e)) => {
                    log::error!("Init failed: {}", describe(&e));
                    self.state = State::Idle(driver);
                    FAILED
                },
            },
            state => {
                log::error!("Init called while a session is already active");
                self.state = state;
                FAILED
            },
        }
    }

    /// UnInit(fnc).
    pub fn uninit(&mut self, fnc: u32) -> i32 {
        let function = parse_function("UnInit", fnc);
        match std::mem::replace(&mut self.state, State::Switching) {
            State::Active(session) => {
                let (driver, result) = session.uninit(function);
                self.state = State::Idle(driver);
                report("UnInit", result)
            },
            state => {
                log::error!("UnInit called without an active session");
                self.state = state;
                FAILED
            },
        }
    }

    /// EraseChip().
    pub fn erase_chip(&mut self) -> i32 {
        match self.session() {
            Some(session) => report("EraseChip", session.erase_chip()),
            None => not_active("EraseChip"),
        }
    }

    /// EraseSector(adr).
    pub fn erase_sector(&mut self, adr: u32) -> i32 {
        match self.session() {
            Some(session) => report("EraseSector", session.erase_sector(adr)),
            None => not_active("EraseSector"),
        }
    }

    /// ProgramPage(adr, sz, buf).
    ///
    /// Fails without touching the device if `buf` holds fewer than `sz` bytes.
    pub fn program_page(&mut self, adr: u32, sz: u32, buf: &[u8]) -> i32 {
        let data = match buf.get(..sz as usize) {
            Some(data) => data,
            None => {
                log::error!("ProgramPage size {} exceeds buffer of {} bytes", sz, buf.len());
                return FAILED;
            }
        };
        match self.session() {
            Some(session) => report("ProgramPage", session.program_page(adr, data)),
            None => not_active("ProgramPage"),
        }
    }
}

/// Function codes are advisory, so an unrecognised one is carried through.
fn parse_function(call: &str, fnc: u32) -> Function {
    let function = function_from_code(fnc);
    if function == Function::Unknown {
        log::warn!("{} called with unrecognised function code {}", call, fnc);
    }
    function
}

/// Format `e` followed by each error in its source chain.
fn describe(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn report<E: std::error::Error>(call: &str, result: Result<(), E>) -> i32 {
    match result {
        Ok(()) => OK,
        Err(e) => {
            log::error!("{} failed: {}", call, describe(&e));
            FAILED
        },
    }
}

fn not_active(call: &str) -> i32 {
    log::error!("{} called without Init", call);
    FAILED
}

#[test]
fn test_describe_includes_sources() {
    use crate::{algorithm, poll};
    let e = algorithm::Error::Poll(poll::Error::PollLimit { address: 0, reads: 50 });
    let message = describe(&e);
    assert!(message.contains("Polling error"));
    assert!(message.contains("gave up after 50 reads"));
}
