//! Decoding of received payloads into named values.

use crate::fault::Readings;
use crate::frame::{Frame, LayoutTable};
use crate::Error;

/// Something that knows how to turn a raw payload into named values.
pub trait SchemaDecoder {
    fn decode(&self, id: u16, payload: &[u8]) -> Result<Readings, Error>;
}

impl SchemaDecoder for LayoutTable {
    fn decode(&self, id: u16, payload: &[u8]) -> Result<Readings, Error> {
        let frame = Frame::new(id, payload)?;
        Ok(self.unpack(&frame)?.readings)
    }
}

/// Schema failures are not fatal for a receiver, they are logged and skipped.
pub fn decode_or_log(schema: &dyn SchemaDecoder, frame: &Frame) -> Option<Readings> {
    match schema.decode(frame.id(), frame.data()) {
        Ok(readings) => Some(readings),
        Err(err) => {
            log::warn!("Schema decoding failed for 0x{:03X}: {err}", frame.id());
            None
        }
    }
}
