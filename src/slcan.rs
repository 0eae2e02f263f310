//! Serial line CAN adapters speaking the Lawicel ASCII protocol.
//!
//! A standard data frame is sent as `tIIIL<data>\r`: three hex digits of
//! identifier, one digit of length and two hex digits per data byte. The
//! adapter answers commands with `\r` (ok) or `\x07` (error).

use crate::error::TransportError;
use crate::frame::{Frame, MAX_PAYLOAD};
use crate::transport::Transport;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

const CR: u8 = b'\r';
const BELL: u8 = 0x07;

pub const OPEN_COMMAND: &str = "O\r";
pub const CLOSE_COMMAND: &str = "C\r";

/// Command selecting one of the standard bit rates.
pub fn bitrate_command(bitrate: u32) -> Result<String, TransportError> {
    let code = match bitrate {
        10_000 => 0,
        20_000 => 1,
        50_000 => 2,
        100_000 => 3,
        125_000 => 4,
        250_000 => 5,
        500_000 => 6,
        800_000 => 7,
        1_000_000 => 8,
        _ => {
            return Err(TransportError::Protocol(format!(
                "unsupported bitrate {bitrate}"
            )))
        }
    };
    Ok(format!("S{code}\r"))
}

pub fn encode_frame(frame: &Frame) -> String {
    let mut line = format!("t{:03X}{:X}", frame.id(), frame.dlc());
    for byte in frame.data() {
        line.push_str(&format!("{byte:02X}"));
    }
    line.push('\r');
    line
}

fn hex(digits: &str) -> Result<u32, TransportError> {
    u32::from_str_radix(digits, 16)
        .map_err(|_| TransportError::Protocol(format!("invalid hex '{digits}'")))
}

/// Parses one line without its terminator. Acknowledgements and frame kinds
/// the core does not handle yield `None`.
pub fn decode_line(line: &str) -> Result<Option<Frame>, TransportError> {
    let Some(kind) = line.chars().next() else {
        return Ok(None);
    };
    match kind {
        't' => {
            let body = &line[1..];
            if body.len() < 4 || !body.is_ascii() {
                return Err(TransportError::Protocol(format!("short frame '{line}'")));
            }
            let id = hex(&body[..3])?;
            let dlc = hex(&body[3..4])? as usize;
            if dlc > MAX_PAYLOAD || body.len() != 4 + dlc * 2 {
                return Err(TransportError::Protocol(format!("bad length in '{line}'")));
            }
            let data = (0..dlc)
                .map(|i| hex(&body[4 + i * 2..6 + i * 2]).map(|b| b as u8))
                .collect::<Result<Vec<u8>, _>>()?;
            Frame::new(id as u16, &data)
                .map(Some)
                .map_err(|err| TransportError::Protocol(err.to_string()))
        }
        'T' => Err(TransportError::Protocol(
            "extended identifiers are not supported".to_string(),
        )),
        _ => {
            log::trace!("ignoring adapter line '{line}'");
            Ok(None)
        }
    }
}

/// Byte stream to an adapter.
pub trait SlcanPort: Read + Write + Send {
    /// Independent handle on the same port, used for sending while another
    /// thread reads.
    fn try_clone_port(&self) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }
}

/// CAN access through a serial line adapter.
#[derive(Debug)]
pub struct SlcanBus<P> {
    port: P,
    name: String,
    rx_buffer: Vec<u8>,
    open: bool,
    owner: bool,
}

impl<P: Read + Write + Send> SlcanBus<P> {
    /// Configures the bit rate and opens the channel.
    pub fn new(port: P, name: &str, bitrate: u32) -> Result<Self, TransportError> {
        let mut bus = Self {
            port,
            name: name.to_string(),
            rx_buffer: Vec::new(),
            open: false,
            owner: true,
        };
        bus.write_command(CLOSE_COMMAND)?;
        bus.write_command(&bitrate_command(bitrate)?)?;
        bus.write_command(OPEN_COMMAND)?;
        bus.open = true;
        Ok(bus)
    }

    fn write_command(&mut self, command: &str) -> Result<(), TransportError> {
        log::trace!("slcan write {:?}", command);
        self.port.write_all(command.as_bytes())?;
        Ok(())
    }

    /// Takes the next complete line out of the receive buffer.
    fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        let end = self
            .rx_buffer
            .iter()
            .position(|b| *b == CR || *b == BELL)?;
        let line: Vec<u8> = self.rx_buffer.drain(..=end).collect();
        if line[end] == BELL {
            return Some(Err(TransportError::Protocol(
                "adapter reported an error".to_string(),
            )));
        }
        Some(Ok(String::from_utf8_lossy(&line[..end]).into_owned()))
    }
}

impl<P: SlcanPort + 'static> Transport for SlcanBus<P> {
    fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.write_command(&encode_frame(frame))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(line) = self.next_line() {
                if let Some(frame) = decode_line(&line?)? {
                    return Ok(Some(frame));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let mut chunk = [0u8; 64];
            match self.port.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    log::trace!("slcan read {:02X?}", &chunk[..n]);
                    self.rx_buffer.extend_from_slice(&chunk[..n]);
                }
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        if self.open {
            self.open = false;
            if self.owner {
                self.write_command(CLOSE_COMMAND)?;
            }
        }
        Ok(())
    }

    fn channel_info(&self) -> String {
        format!("slcan adapter on '{}'", self.name)
    }

    fn send_handle(&self) -> Option<Box<dyn Transport>> {
        let port = self.port.try_clone_port()?;
        Some(Box::new(SlcanBus {
            port,
            name: self.name.clone(),
            rx_buffer: Vec::new(),
            open: self.open,
            owner: false,
        }))
    }
}
