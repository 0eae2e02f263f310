//! Conversion of physical quantities to and from fixed width CAN signal fields.
//!
//! A value is scaled (`raw = round(value * scale)`), range checked against the
//! field width and signedness, and written in the configured byte order.
//! Values that do not fit are rejected with [`Error::Range`]; nothing is
//! truncated or wrapped.

use crate::Error;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

/// Width of a signal field in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum Width {
    One,
    Two,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::One => 1,
            Width::Two => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum Signedness {
    Signed,
    Unsigned,
}

impl Signedness {
    fn as_str(self) -> &'static str {
        match self {
            Signedness::Signed => "signed",
            Signedness::Unsigned => "unsigned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum ByteOrder {
    Big,
    Little,
}

/// Binary representation of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct SignalSpec {
    /// Units per physical unit, e.g. 1000 for mV per V.
    pub scale: u32,
    pub width: Width,
    pub signedness: Signedness,
    pub byte_order: ByteOrder,
}

impl SignalSpec {
    pub const fn new(scale: u32, width: Width, signedness: Signedness, byte_order: ByteOrder) -> Self {
        Self {
            scale,
            width,
            signedness,
            byte_order,
        }
    }

    /// Cell voltage in millivolts, 2 bytes unsigned big endian.
    pub const fn millivolts() -> Self {
        Self::new(1000, Width::Two, Signedness::Unsigned, ByteOrder::Big)
    }

    /// Temperature at 0.1 °C resolution, 2 bytes signed big endian.
    pub const fn decicelsius() -> Self {
        Self::new(10, Width::Two, Signedness::Signed, ByteOrder::Big)
    }

    /// Plain unsigned byte, e.g. a status code.
    pub const fn byte() -> Self {
        Self::new(1, Width::One, Signedness::Unsigned, ByteOrder::Big)
    }

    /// Smallest and largest raw value the field can hold.
    pub fn raw_bounds(&self) -> (i64, i64) {
        match (self.width, self.signedness) {
            (Width::One, Signedness::Unsigned) => (0, u8::MAX as i64),
            (Width::One, Signedness::Signed) => (i8::MIN as i64, i8::MAX as i64),
            (Width::Two, Signedness::Unsigned) => (0, u16::MAX as i64),
            (Width::Two, Signedness::Signed) => (i16::MIN as i64, i16::MAX as i64),
        }
    }

    /// Physical range representable by this spec.
    pub fn physical_bounds(&self) -> (f64, f64) {
        let (min, max) = self.raw_bounds();
        let scale = self.scale as f64;
        (min as f64 / scale, max as f64 / scale)
    }

    fn range_error(&self, value: f64) -> Error {
        Error::Range {
            value,
            scale: self.scale,
            width: self.width.bytes(),
            signedness: self.signedness.as_str(),
        }
    }
}

/// Encodes `value` into `spec.width` bytes.
pub fn encode(value: f64, spec: &SignalSpec) -> Result<Vec<u8>, Error> {
    if spec.scale == 0 || !value.is_finite() {
        return Err(spec.range_error(value));
    }
    let scaled = (value * spec.scale as f64).round();
    let (min, max) = spec.raw_bounds();
    if scaled < min as f64 || scaled > max as f64 {
        log::trace!("encode {value} rejected, raw {scaled} outside {min}..={max}");
        return Err(spec.range_error(value));
    }
    let raw = scaled as i64;

    let bytes = match spec.width {
        Width::One => vec![raw as u8],
        Width::Two => {
            let word = raw as u16;
            match spec.byte_order {
                ByteOrder::Big => word.to_be_bytes().to_vec(),
                ByteOrder::Little => word.to_le_bytes().to_vec(),
            }
        }
    };
    log::trace!("encode {value} -> raw={raw} bytes={bytes:02X?}");
    Ok(bytes)
}

/// Decodes the first `spec.width` bytes of `bytes` into a physical value.
pub fn decode(bytes: &[u8], spec: &SignalSpec) -> Result<f64, Error> {
    let width = spec.width.bytes();
    if bytes.len() < width {
        return Err(Error::FieldLength {
            expected: width,
            actual: bytes.len(),
        });
    }
    if spec.scale == 0 {
        return Err(spec.range_error(f64::NAN));
    }
    let raw: i64 = match (spec.width, spec.signedness) {
        (Width::One, Signedness::Unsigned) => bytes[0] as i64,
        (Width::One, Signedness::Signed) => bytes[0] as i8 as i64,
        (Width::Two, signedness) => {
            let pair = [bytes[0], bytes[1]];
            let word = match spec.byte_order {
                ByteOrder::Big => u16::from_be_bytes(pair),
                ByteOrder::Little => u16::from_le_bytes(pair),
            };
            match signedness {
                Signedness::Unsigned => word as i64,
                Signedness::Signed => word as i16 as i64,
            }
        }
    };
    Ok(raw as f64 / spec.scale as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voltage_encodes_big_endian_millivolts() {
        let spec = SignalSpec::millivolts();
        assert_eq!(encode(4.0, &spec).unwrap(), vec![0x0F, 0xA0]);
        assert_eq!(encode(3.0, &spec).unwrap(), vec![0x0B, 0xB8]);
        assert_eq!(encode(4.2, &spec).unwrap(), vec![0x10, 0x68]);
    }

    #[test]
    fn rounding_does_not_truncate() {
        // 4.3 * 1000 is 4299.999... in binary floating point
        let spec = SignalSpec::millivolts();
        assert_eq!(encode(4.3, &spec).unwrap(), 4300u16.to_be_bytes().to_vec());
    }

    #[test]
    fn known_bytes_decode_to_volts() {
        let spec = SignalSpec::millivolts();
        for (bytes, expected) in [([0x0F, 0xA0], 4.0), ([0x0B, 0xB8], 3.0), ([0x10, 0x68], 4.2)] {
            let volts = decode(&bytes, &spec).unwrap();
            assert!((volts - expected).abs() < 1e-9, "{bytes:02X?} -> {volts}");
        }
    }

    #[test]
    fn negative_temperature_signed() {
        let spec = SignalSpec::decicelsius();
        let bytes = encode(-5.0, &spec).unwrap();
        assert_eq!(bytes, vec![0xFF, 0xCE]);
        assert_eq!(decode(&bytes, &spec).unwrap(), -5.0);
    }

    #[test]
    fn little_endian_order() {
        let spec = SignalSpec::new(1000, Width::Two, Signedness::Unsigned, ByteOrder::Little);
        assert_eq!(encode(4.0, &spec).unwrap(), vec![0xA0, 0x0F]);
        assert_eq!(decode(&[0xA0, 0x0F], &spec).unwrap(), 4.0);
    }

    #[test]
    fn round_trip_within_half_unit() {
        let spec = SignalSpec::decicelsius();
        let mut value = -3276.0;
        while value < 3276.0 {
            let decoded = decode(&encode(value, &spec).unwrap(), &spec).unwrap();
            assert!((decoded - value).abs() <= 0.5 / spec.scale as f64 + 1e-9);
            value += 12.345;
        }
    }

    #[test]
    fn out_of_range_is_rejected() {
        let unsigned = SignalSpec::millivolts();
        assert!(matches!(encode(-0.001, &unsigned), Err(Error::Range { .. })));
        assert!(matches!(encode(65.536, &unsigned), Err(Error::Range { .. })));
        assert!(encode(65.535, &unsigned).is_ok());

        let signed = SignalSpec::decicelsius();
        assert!(matches!(encode(3276.8, &signed), Err(Error::Range { .. })));
        assert!(matches!(encode(-3276.9, &signed), Err(Error::Range { .. })));
        assert!(encode(-3276.8, &signed).is_ok());

        assert!(matches!(encode(256.0, &SignalSpec::byte()), Err(Error::Range { .. })));
        assert!(matches!(encode(f64::NAN, &SignalSpec::byte()), Err(Error::Range { .. })));
    }

    #[test]
    fn short_input_is_rejected() {
        let spec = SignalSpec::millivolts();
        assert!(matches!(
            decode(&[0x0F], &spec),
            Err(Error::FieldLength {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn physical_bounds_follow_scale() {
        assert_eq!(SignalSpec::millivolts().physical_bounds(), (0.0, 65.535));
        assert_eq!(SignalSpec::decicelsius().physical_bounds(), (-3276.8, 3276.7));
    }
}
