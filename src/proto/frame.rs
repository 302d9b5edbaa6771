//! Wire framing.
//!
//! Every frame is a 16-byte ASCII header followed by the payload:
//! 8 decimal digits of serial number, 8 decimal digits of payload
//! length. Requests carry the next value of a counter that starts at 1
//! and wraps from 99999999 back to 1; replies echo the request's serial
//! bytes verbatim; the pre-session greeting carries 8 spaces.
//!
//! A header whose length field is not all digits, or whose length is
//! zero, means the stream is out of sync and the connection is dead.

use std::io::{Read, Write};

use thiserror::Error;
use tracing::{debug, trace};

pub const SERIAL_LEN: usize = 8;
pub const SIZE_LEN: usize = 8;
pub const HEADER_LEN: usize = SERIAL_LEN + SIZE_LEN;
pub const SERIAL_MAX: u32 = 99_999_999;

/// Initial capacity of the send and receive buffers.
pub const INIT_SIZE: usize = 2048;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("corrupted packet header")]
    CorruptedPacket,

    #[error("serialization failure: expected serial {expected}, got {got:?}")]
    SerialMismatch { expected: u32, got: [u8; SERIAL_LEN] },
}

/// How the serial field of an outgoing frame is filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Serial {
    /// Pre-session greeting: 8 spaces.
    Greeting,
    /// A numbered request.
    Number(u32),
    /// A reply echoing the request's serial bytes.
    Echo([u8; SERIAL_LEN]),
}

/// Request serial counter: 1..=99999999, then wraps to 1.
#[derive(Debug)]
pub struct SerialCounter {
    next: u32,
}

impl Default for SerialCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn take(&mut self) -> u32 {
        let serial = self.next;
        self.next = if serial == SERIAL_MAX { 1 } else { serial + 1 };
        serial
    }
}

/// One received frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub serial: [u8; SERIAL_LEN],
    pub payload: Vec<u8>,
}

impl Frame {
    /// Parsed serial, `None` for a greeting frame.
    pub fn serial_number(&self) -> Option<u32> {
        parse_digits(&self.serial)
    }

    /// Raised when this frame does not answer the outstanding request.
    pub fn check_serial(&self, expected: u32) -> Result<(), FrameError> {
        if self.serial_number() == Some(expected) {
            Ok(())
        } else {
            Err(FrameError::SerialMismatch {
                expected,
                got: self.serial,
            })
        }
    }
}

fn parse_digits(field: &[u8]) -> Option<u32> {
    let mut value: u32 = 0;
    for &b in field {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (b - b'0') as u32;
    }
    Some(value)
}

fn format_serial(serial: Serial) -> [u8; SERIAL_LEN] {
    match serial {
        Serial::Greeting => *b"        ",
        Serial::Echo(raw) => raw,
        Serial::Number(n) => {
            let mut field = [b'0'; SERIAL_LEN];
            let mut n = n;
            for slot in field.iter_mut().rev() {
                *slot = b'0' + (n % 10) as u8;
                n /= 10;
            }
            field
        }
    }
}

/// Sending half of a framed connection.
pub struct FrameWriter<W: Write> {
    dst: W,
    buf: Vec<u8>,
    serials: SerialCounter,
    shutdown: bool,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(dst: W) -> Self {
        Self {
            dst,
            buf: Vec::with_capacity(INIT_SIZE),
            serials: SerialCounter::new(),
            shutdown: false,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.dst
    }

    pub fn into_inner(self) -> W {
        self.dst
    }

    /// Stop sending; later sends are logged and dropped.
    pub fn shutdown(&mut self) {
        self.shutdown = true;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Send a numbered request, returning the serial it was stamped with.
    pub fn send_request(&mut self, payload: &[u8]) -> Result<u32, FrameError> {
        let serial = self.serials.take();
        self.send(Serial::Number(serial), payload)?;
        Ok(serial)
    }

    pub fn send(&mut self, serial: Serial, payload: &[u8]) -> Result<(), FrameError> {
        if self.shutdown {
            debug!(payload = %String::from_utf8_lossy(payload), "nos");
            return Ok(());
        }
        self.buf.clear();
        self.buf.extend_from_slice(&format_serial(serial));
        let mut size = [b'0'; SIZE_LEN];
        let mut n = payload.len();
        for slot in size.iter_mut().rev() {
            *slot = b'0' + (n % 10) as u8;
            n /= 10;
        }
        self.buf.extend_from_slice(&size);
        self.buf.extend_from_slice(payload);
        self.dst.write_all(&self.buf)?;
        self.dst.flush()?;
        trace!(frame = %String::from_utf8_lossy(&self.buf), "snd");
        Ok(())
    }
}

/// Receiving half of a framed connection.
///
/// Accumulates stream bytes and hands back whole frames; partial frames
/// stay buffered across reads, and several frames arriving in one read
/// come back one at a time.
pub struct FrameReader<R: Read> {
    src: R,
    buf: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(src: R) -> Self {
        Self {
            src,
            buf: Vec::with_capacity(INIT_SIZE),
        }
    }

    /// Read the next frame, blocking until one is complete.
    pub fn read_frame(&mut self) -> Result<Frame, FrameError> {
        loop {
            if let Some(frame) = self.try_parse()? {
                trace!(
                    serial = %String::from_utf8_lossy(&frame.serial),
                    payload = %String::from_utf8_lossy(&frame.payload),
                    "rcv"
                );
                return Ok(frame);
            }
            let mut chunk = [0u8; INIT_SIZE];
            let n = self.src.read(&mut chunk)?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_parse(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let size = match parse_digits(&self.buf[SERIAL_LEN..HEADER_LEN]) {
            Some(size) if size > 0 => size as usize,
            _ => {
                debug!(pending = %String::from_utf8_lossy(&self.buf), "bad");
                self.buf.clear();
                return Err(FrameError::CorruptedPacket);
            }
        };
        if self.buf.len() < HEADER_LEN + size {
            return Ok(None);
        }
        let mut serial = [0u8; SERIAL_LEN];
        serial.copy_from_slice(&self.buf[..SERIAL_LEN]);
        let payload = self.buf[HEADER_LEN..HEADER_LEN + size].to_vec();
        self.buf.drain(..HEADER_LEN + size);
        Ok(Some(Frame { serial, payload }))
    }
}
