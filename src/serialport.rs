use crate::error::TransportError;
use crate::slcan::{SlcanBus, SlcanPort};
use std::time::Duration;

/// Serial line speed of the common USB adapters; the CAN bit rate is set separately.
pub const SERIAL_BAUD_RATE: u32 = 115_200;

impl SlcanPort for Box<dyn serialport::SerialPort> {
    fn try_clone_port(&self) -> Option<Self> {
        match self.try_clone() {
            Ok(port) => Some(port),
            Err(err) => {
                log::warn!("Cannot clone serial port, sending and receiving share one handle: {err}");
                None
            }
        }
    }
}

pub type SerialSlcanBus = SlcanBus<Box<dyn serialport::SerialPort>>;

/// Opens a serial line CAN adapter on `device` and starts the channel.
pub fn open_slcan(
    device: &str,
    bitrate: u32,
    timeout: Duration,
) -> Result<SerialSlcanBus, TransportError> {
    log::debug!("open slcan adapter {device} at {bitrate} bit/s");
    let port = serialport::new(device, SERIAL_BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(timeout)
        .open()?;
    SlcanBus::new(port, device, bitrate)
}
