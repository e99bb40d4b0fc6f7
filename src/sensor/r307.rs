//! Driver for R307 / AS608 optical fingerprint modules
//!
//! The module speaks a small packet protocol over UART (57600 baud):
//!
//! ```text
//! EF 01 | addr (4) | pid | len (2, BE) | payload | checksum (2, BE)
//! ```
//!
//! `len` counts the payload plus the checksum. The checksum is the wrapping
//! 16-bit sum of pid, both length bytes, and the payload. Commands go out
//! with pid 0x01; the module answers with an ack (pid 0x07) whose first
//! payload byte is a confirmation code.

use heapless::Vec;
use log::debug;

use super::{CaptureOutcome, FingerprintSensor, SensorError};
use crate::SlotId;

const HEADER: [u8; 2] = [0xEF, 0x01];
const DEFAULT_ADDRESS: u32 = 0xFFFF_FFFF;

const PID_COMMAND: u8 = 0x01;
const PID_ACK: u8 = 0x07;

const GEN_IMG: u8 = 0x01;
const IMG2TZ: u8 = 0x02;
const SEARCH: u8 = 0x04;
const REG_MODEL: u8 = 0x05;
const STORE: u8 = 0x06;
const EMPTY: u8 = 0x0D;
const VFY_PWD: u8 = 0x13;

const CODE_OK: u8 = 0x00;
const CODE_NO_FINGER: u8 = 0x02;
const CODE_NOT_FOUND: u8 = 0x09;

const ACK_TIMEOUT_MS: u32 = 1_000;
const FINGER_POLL_MS: u32 = 100;

/// Longest frame we send (Search: 6 payload bytes)
type Frame = Vec<u8, 32>;
type AckPayload = Vec<u8, 64>;

/// Byte pipe to the module, usually a UART
pub trait SensorLink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), SensorError>;

    /// Read up to `buf.len()` bytes, returning 0 if nothing arrived in time
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, SensorError>;

    fn delay_ms(&mut self, ms: u32);
}

pub struct R307<L> {
    link: L,
    address: u32,
    /// Templates searched on match, i.e. the configured slot capacity
    search_pages: u16,
    /// Polls of `FINGER_POLL_MS` before giving up on a finger
    finger_polls: u32,
}

impl<L: SensorLink> R307<L> {
    pub fn new(link: L, search_pages: u16) -> Self {
        Self {
            link,
            address: DEFAULT_ADDRESS,
            search_pages,
            finger_polls: 100,
        }
    }

    /// Override how long enrollment waits for a finger
    pub fn with_finger_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.finger_polls = (timeout_ms / FINGER_POLL_MS).max(1);
        self
    }

    /// Check the module is present and accepts `password`
    pub fn verify_password(&mut self, password: u32) -> Result<(), SensorError> {
        self.expect_ok(VFY_PWD, &password.to_be_bytes())
    }

    pub fn into_link(self) -> L {
        self.link
    }

    fn command(&mut self, instruction: u8, params: &[u8]) -> Result<AckPayload, SensorError> {
        let mut payload: Vec<u8, 8> = Vec::new();
        payload
            .push(instruction)
            .map_err(|_| SensorError::Link("command too long".into()))?;
        payload
            .extend_from_slice(params)
            .map_err(|_| SensorError::Link("command too long".into()))?;

        let frame = encode_frame(self.address, PID_COMMAND, &payload)?;
        self.link.write(&frame)?;
        let ack = self.read_ack()?;
        debug!("r307 {:#04x} -> code {:#04x}", instruction, ack[0]);
        Ok(ack)
    }

    fn expect_ok(&mut self, instruction: u8, params: &[u8]) -> Result<(), SensorError> {
        match self.command(instruction, params)?[0] {
            CODE_OK => Ok(()),
            code => Err(SensorError::Rejected(code)),
        }
    }

    fn read_ack(&mut self) -> Result<AckPayload, SensorError> {
        let mut head = [0u8; 9];
        self.read_exact(&mut head)?;
        if head[..2] != HEADER {
            return Err(SensorError::Link("bad frame header".into()));
        }
        if head[6] != PID_ACK {
            return Err(SensorError::Link(format!("unexpected packet id {:#04x}", head[6])));
        }
        let len = u16::from_be_bytes([head[7], head[8]]) as usize;
        if !(3..=64).contains(&len) {
            return Err(SensorError::Link(format!("bad ack length {len}")));
        }

        let mut rest = [0u8; 64];
        self.read_exact(&mut rest[..len])?;
        let (payload, sum) = rest[..len].split_at(len - 2);
        let expected = checksum(PID_ACK, len as u16, payload);
        if u16::from_be_bytes([sum[0], sum[1]]) != expected {
            return Err(SensorError::Link("ack checksum mismatch".into()));
        }

        let mut out = AckPayload::new();
        // payload.len() <= 62 by the length check above
        let _ = out.extend_from_slice(payload);
        Ok(out)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SensorError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.link.read(&mut buf[filled..], ACK_TIMEOUT_MS)?;
            if n == 0 {
                return Err(SensorError::Link("no response from sensor".into()));
            }
            filled += n;
        }
        Ok(())
    }

    fn wait_for_finger(&mut self) -> Result<(), SensorError> {
        for _ in 0..self.finger_polls {
            match self.command(GEN_IMG, &[])?[0] {
                CODE_OK => return Ok(()),
                CODE_NO_FINGER => self.link.delay_ms(FINGER_POLL_MS),
                code => return Err(SensorError::Rejected(code)),
            }
        }
        Err(SensorError::Timeout)
    }

    fn wait_for_removal(&mut self) -> Result<(), SensorError> {
        for _ in 0..self.finger_polls {
            if self.command(GEN_IMG, &[])?[0] == CODE_NO_FINGER {
                return Ok(());
            }
            self.link.delay_ms(FINGER_POLL_MS);
        }
        Err(SensorError::Timeout)
    }
}

impl<L: SensorLink> FingerprintSensor for R307<L> {
    fn capture_and_match(&mut self) -> Result<CaptureOutcome, SensorError> {
        match self.command(GEN_IMG, &[])?[0] {
            CODE_OK => {}
            CODE_NO_FINGER => return Ok(CaptureOutcome::NoFinger),
            code => return Err(SensorError::Rejected(code)),
        }
        self.expect_ok(IMG2TZ, &[1])?;

        let [pages_hi, pages_lo] = self.search_pages.to_be_bytes();
        let ack = self.command(SEARCH, &[1, 0, 0, pages_hi, pages_lo])?;
        match ack[0] {
            CODE_OK if ack.len() >= 5 => Ok(CaptureOutcome::Matched {
                slot: u16::from_be_bytes([ack[1], ack[2]]),
                confidence: u16::from_be_bytes([ack[3], ack[4]]),
            }),
            CODE_OK => Err(SensorError::Link("short search ack".into())),
            CODE_NOT_FOUND => Ok(CaptureOutcome::NoMatch),
            code => Err(SensorError::Rejected(code)),
        }
    }

    /// Two reads of the same finger, merged into one template
    fn capture_and_enroll(&mut self, slot: SlotId) -> Result<(), SensorError> {
        for buffer in 1..=2u8 {
            self.wait_for_finger()?;
            self.expect_ok(IMG2TZ, &[buffer])?;
            if buffer == 1 {
                self.wait_for_removal()?;
            }
        }
        self.expect_ok(REG_MODEL, &[])?;
        let [slot_hi, slot_lo] = slot.to_be_bytes();
        self.expect_ok(STORE, &[1, slot_hi, slot_lo])
    }

    fn erase_all(&mut self) -> Result<(), SensorError> {
        self.expect_ok(EMPTY, &[])
    }
}

fn checksum(pid: u8, len: u16, payload: &[u8]) -> u16 {
    let [len_hi, len_lo] = len.to_be_bytes();
    payload
        .iter()
        .chain([pid, len_hi, len_lo].iter())
        .fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)))
}

fn encode_frame(address: u32, pid: u8, payload: &[u8]) -> Result<Frame, SensorError> {
    let len = (payload.len() + 2) as u16;
    let mut frame = Frame::new();
    let overflow = |_| SensorError::Link("frame too long".into());
    frame.extend_from_slice(&HEADER).map_err(overflow)?;
    frame.extend_from_slice(&address.to_be_bytes()).map_err(overflow)?;
    frame.push(pid).map_err(|_| SensorError::Link("frame too long".into()))?;
    frame.extend_from_slice(&len.to_be_bytes()).map_err(overflow)?;
    frame.extend_from_slice(payload).map_err(overflow)?;
    frame
        .extend_from_slice(&checksum(pid, len, payload).to_be_bytes())
        .map_err(overflow)?;
    Ok(frame)
}
