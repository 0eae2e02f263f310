//! CAN frames and their declared byte layouts.

use crate::codec::{self, SignalSpec};
use crate::fault::{FaultReport, Readings};
use crate::Error;
use embedded_can::{Id, StandardId};
use std::fmt;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

pub const MAX_PAYLOAD: usize = 8;

/// Validates an 11 bit identifier.
pub fn standard_id(id: u16) -> Result<StandardId, Error> {
    StandardId::new(id).ok_or(Error::InvalidId(id as u32))
}

#[cfg(feature = "protocol_serde")]
mod serde_standard_id {
    use embedded_can::StandardId;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &StandardId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(id.as_raw())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StandardId, D::Error> {
        let raw = u16::deserialize(deserializer)?;
        StandardId::new(raw)
            .ok_or_else(|| D::Error::custom(format!("invalid CAN identifier 0x{raw:X}")))
    }
}

/// Classic CAN data frame with an 11 bit identifier.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct Frame {
    #[cfg_attr(feature = "protocol_serde", serde(with = "serde_standard_id"))]
    id: StandardId,
    payload: [u8; MAX_PAYLOAD],
    dlc: u8,
}

impl Frame {
    /// Builds a frame from up to 8 data bytes; shorter data is zero padded.
    pub fn new(id: u16, data: &[u8]) -> Result<Self, Error> {
        Self::from_standard(standard_id(id)?, data)
    }

    pub fn from_standard(id: StandardId, data: &[u8]) -> Result<Self, Error> {
        if data.len() > MAX_PAYLOAD {
            return Err(Error::Overflow {
                required: data.len(),
                available: MAX_PAYLOAD,
            });
        }
        let mut payload = [0u8; MAX_PAYLOAD];
        payload[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            payload,
            dlc: data.len() as u8,
        })
    }

    pub fn id(&self) -> u16 {
        self.id.as_raw()
    }

    pub fn standard_id(&self) -> StandardId {
        self.id
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// The full 8 byte payload including padding.
    pub fn payload(&self) -> &[u8; MAX_PAYLOAD] {
        &self.payload
    }

    /// Only the `dlc` data bytes.
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.dlc as usize]
    }
}

/// Data frames with standard identifiers only; everything else is rejected.
impl embedded_can::Frame for Frame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        match id.into() {
            Id::Standard(id) => Frame::from_standard(id, data).ok(),
            Id::Extended(_) => None,
        }
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None
    }

    fn is_extended(&self) -> bool {
        false
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        Id::Standard(self.id)
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        Frame::data(self)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(0x{:03X} [{}] {:02X?})", self.id(), self.dlc, self.data())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X} [{}]", self.id(), self.dlc)?;
        for byte in self.data() {
            write!(f, " {byte:02X}")?;
        }
        Ok(())
    }
}

/// Concatenates `fields` in order and zero pads the result to `total_width` bytes.
pub fn assemble(frame_id: u16, fields: &[&[u8]], total_width: usize) -> Result<Frame, Error> {
    if total_width > MAX_PAYLOAD {
        return Err(Error::Overflow {
            required: total_width,
            available: MAX_PAYLOAD,
        });
    }
    let required: usize = fields.iter().map(|f| f.len()).sum();
    if required > total_width {
        return Err(Error::Overflow {
            required,
            available: total_width,
        });
    }
    let mut data = Vec::with_capacity(total_width);
    for field in fields {
        data.extend_from_slice(field);
    }
    data.resize(total_width, 0);
    Frame::new(frame_id, &data)
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum FieldSource {
    /// Encoded reading of `signal`.
    Signal { signal: String, spec: SignalSpec },
    /// Fault code byte of a rule group.
    FaultCode { group: String },
    /// `1` when the rule group raised a fault, `0` otherwise.
    FaultFlag { group: String },
    Reserved { width: usize },
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct Field {
    pub name: String,
    pub source: FieldSource,
}

impl Field {
    pub fn signal(signal: &str, spec: SignalSpec) -> Self {
        Self {
            name: signal.to_string(),
            source: FieldSource::Signal {
                signal: signal.to_string(),
                spec,
            },
        }
    }

    pub fn fault_code(group: &str) -> Self {
        Self {
            name: format!("{group}_fault"),
            source: FieldSource::FaultCode {
                group: group.to_string(),
            },
        }
    }

    pub fn fault_flag(group: &str) -> Self {
        Self {
            name: "fault_flag".to_string(),
            source: FieldSource::FaultFlag {
                group: group.to_string(),
            },
        }
    }

    pub fn reserved(width: usize) -> Self {
        Self {
            name: "reserved".to_string(),
            source: FieldSource::Reserved { width },
        }
    }

    pub fn width(&self) -> usize {
        match &self.source {
            FieldSource::Signal { spec, .. } => spec.width.bytes(),
            FieldSource::FaultCode { .. } | FieldSource::FaultFlag { .. } => 1,
            FieldSource::Reserved { width } => *width,
        }
    }

    fn encode(&self, readings: &Readings, faults: &FaultReport) -> Result<Vec<u8>, Error> {
        match &self.source {
            FieldSource::Signal { signal, spec } => {
                let value = readings
                    .get(signal)
                    .copied()
                    .ok_or_else(|| Error::MissingSignal(signal.clone()))?;
                codec::encode(value, spec)
            }
            FieldSource::FaultCode { group } => {
                let fault = faults
                    .get(group)
                    .ok_or_else(|| Error::MissingGroup(group.clone()))?;
                Ok(vec![fault.code])
            }
            FieldSource::FaultFlag { group } => {
                let fault = faults
                    .get(group)
                    .ok_or_else(|| Error::MissingGroup(group.clone()))?;
                Ok(vec![u8::from(fault.is_fault())])
            }
            FieldSource::Reserved { width } => Ok(vec![0; *width]),
        }
    }
}

/// Values read back from a frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFrame {
    pub readings: Readings,
    /// Fault code or flag bytes by rule group.
    pub fault_codes: Vec<(String, u8)>,
}

/// Fixed field order of one frame kind, validated when declared.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct FrameLayout {
    name: String,
    fields: Vec<Field>,
}

impl FrameLayout {
    pub fn declare(name: &str, fields: Vec<Field>) -> Result<Self, Error> {
        let required: usize = fields.iter().map(Field::width).sum();
        if required > MAX_PAYLOAD {
            return Err(Error::Overflow {
                required,
                available: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            name: name.to_string(),
            fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Byte offset of the first fault code or flag field.
    pub fn offset_of_fault(&self) -> Option<usize> {
        let mut offset = 0;
        for field in &self.fields {
            if matches!(
                field.source,
                FieldSource::FaultCode { .. } | FieldSource::FaultFlag { .. }
            ) {
                return Some(offset);
            }
            offset += field.width();
        }
        None
    }

    /// Encodes every field and pads the frame to 8 bytes.
    pub fn pack(&self, id: u16, readings: &Readings, faults: &FaultReport) -> Result<Frame, Error> {
        let encoded = self
            .fields
            .iter()
            .map(|field| field.encode(readings, faults))
            .collect::<Result<Vec<_>, _>>()?;
        let slices: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();
        assemble(id, &slices, MAX_PAYLOAD)
    }

    pub fn unpack(&self, frame: &Frame) -> Result<DecodedFrame, Error> {
        let payload = frame.data();
        let mut decoded = DecodedFrame::default();
        let mut offset = 0;
        for field in &self.fields {
            let width = field.width();
            if let FieldSource::Reserved { .. } = field.source {
                offset += width;
                continue;
            }
            if payload.len() < offset + width {
                return Err(Error::FieldLength {
                    expected: offset + width,
                    actual: payload.len(),
                });
            }
            let bytes = &payload[offset..offset + width];
            match &field.source {
                FieldSource::Signal { signal, spec } => {
                    decoded
                        .readings
                        .insert(signal.clone(), codec::decode(bytes, spec)?);
                }
                FieldSource::FaultCode { group } | FieldSource::FaultFlag { group } => {
                    decoded.fault_codes.push((group.clone(), bytes[0]));
                }
                FieldSource::Reserved { .. } => {}
            }
            offset += width;
        }
        Ok(decoded)
    }
}

/// Layouts by identifier, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutTable {
    layouts: Vec<(u16, FrameLayout)>,
}

impl LayoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(mut self, id: u16, layout: FrameLayout) -> Result<Self, Error> {
        standard_id(id)?;
        if self.get(id).is_some() {
            return Err(Error::DuplicateLayout(id));
        }
        self.layouts.push((id, layout));
        Ok(self)
    }

    pub fn get(&self, id: u16) -> Option<&FrameLayout> {
        self.layouts
            .iter()
            .find(|(layout_id, _)| *layout_id == id)
            .map(|(_, layout)| layout)
    }

    pub fn ids(&self) -> Vec<u16> {
        self.layouts.iter().map(|(id, _)| *id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &FrameLayout)> {
        self.layouts.iter().map(|(id, layout)| (*id, layout))
    }

    pub fn pack(&self, id: u16, readings: &Readings, faults: &FaultReport) -> Result<Frame, Error> {
        self.get(id)
            .ok_or(Error::UnknownFrame(id))?
            .pack(id, readings, faults)
    }

    /// One frame per declared layout, in declaration order.
    pub fn assemble_all(&self, readings: &Readings, faults: &FaultReport) -> Result<Vec<Frame>, Error> {
        self.layouts
            .iter()
            .map(|(id, layout)| layout.pack(*id, readings, faults))
            .collect()
    }

    pub fn unpack(&self, frame: &Frame) -> Result<DecodedFrame, Error> {
        self.get(frame.id())
            .ok_or(Error::UnknownFrame(frame.id()))?
            .unpack(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{classify_all, Thresholds};

    fn status_layout() -> FrameLayout {
        FrameLayout::declare(
            "bms_status",
            vec![
                Field::signal("voltage", SignalSpec::millivolts()),
                Field::signal("temperature", SignalSpec::decicelsius()),
                Field::fault_flag("thermal"),
                Field::signal("status", SignalSpec::byte()),
                Field::reserved(2),
            ],
        )
        .unwrap()
    }

    #[test]
    fn assemble_pads_to_width() {
        let frame = assemble(0x201, &[&[0x0F, 0xA0], &[0x01]], 8).unwrap();
        assert_eq!(frame.payload(), &[0x0F, 0xA0, 0x01, 0, 0, 0, 0, 0]);
        assert_eq!(frame.dlc(), 8);

        let short = assemble(0x204, &[&[0x03]], 1).unwrap();
        assert_eq!(short.data(), &[0x03]);
    }

    #[test]
    fn assemble_rejects_overflow() {
        let nine = [0u8; 9];
        assert!(matches!(
            assemble(0x201, &[&nine[..5], &nine[5..]], 8),
            Err(Error::Overflow {
                required: 9,
                available: 8
            })
        ));
        assert!(matches!(
            assemble(0x201, &[&[1, 2, 3]], 2),
            Err(Error::Overflow { .. })
        ));
    }

    #[test]
    fn frame_id_must_be_standard() {
        assert!(matches!(Frame::new(0x800, &[]), Err(Error::InvalidId(0x800))));
        assert!(Frame::new(0x7FF, &[]).is_ok());
        assert!(matches!(
            LayoutTable::new().declare(0x900, FrameLayout::declare("x", vec![]).unwrap()),
            Err(Error::InvalidId(0x900))
        ));
    }

    #[test]
    fn embedded_can_frame_view() {
        use embedded_can::{ExtendedId, Frame as _, Id, StandardId};

        let id = StandardId::new(0x201).unwrap();
        let frame = <Frame as embedded_can::Frame>::new(id, &[0x01, 0x0F]).unwrap();
        assert_eq!(frame.standard_id(), id);
        assert!(frame.is_standard() && frame.is_data_frame());
        assert_eq!(embedded_can::Frame::id(&frame), Id::Standard(id));
        assert_eq!(embedded_can::Frame::dlc(&frame), 2);
        assert_eq!(embedded_can::Frame::data(&frame), &[0x01, 0x0F]);

        let extended = ExtendedId::new(0x1234).unwrap();
        assert!(<Frame as embedded_can::Frame>::new(extended, &[]).is_none());
        assert!(<Frame as embedded_can::Frame>::new_remote(id, 0).is_none());
        assert!(<Frame as embedded_can::Frame>::new(id, &[0; 9]).is_none());
    }

    #[test]
    fn layout_overflow_fails_at_declaration() {
        let result = FrameLayout::declare(
            "too_wide",
            vec![
                Field::signal("voltage", SignalSpec::millivolts()),
                Field::reserved(7),
            ],
        );
        assert!(matches!(result, Err(Error::Overflow { required: 9, .. })));
    }

    #[test]
    fn status_frame_layout() {
        let readings: Readings = [("voltage", 3.72), ("temperature", 26.4), ("status", 1.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let faults = FaultReport::default();
        let layout = status_layout();
        assert!(matches!(
            layout.pack(0x123, &readings, &faults),
            Err(Error::MissingGroup(group)) if group == "thermal"
        ));

        let faults = classify_all(&readings, &[Thresholds::default().thermal_group()]).unwrap();
        let frame = layout.pack(0x123, &readings, &faults).unwrap();
        assert_eq!(frame.payload(), &[0x0E, 0x88, 0x01, 0x08, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(layout.offset_of_fault(), Some(4));

        let decoded = layout.unpack(&frame).unwrap();
        assert!((decoded.readings["voltage"] - 3.72).abs() < 1e-9);
        assert!((decoded.readings["temperature"] - 26.4).abs() < 1e-9);
        assert_eq!(decoded.fault_codes, vec![("thermal".to_string(), 0)]);
    }

    #[test]
    fn table_rejects_duplicates_and_unknown_ids() {
        let table = LayoutTable::new().declare(0x123, status_layout()).unwrap();
        assert!(matches!(
            table.clone().declare(0x123, status_layout()),
            Err(Error::DuplicateLayout(0x123))
        ));
        let frame = Frame::new(0x321, &[0; 8]).unwrap();
        assert!(matches!(table.unpack(&frame), Err(Error::UnknownFrame(0x321))));
    }

    #[test]
    fn display_shows_data_bytes() {
        let frame = Frame::new(0x201, &[0x01, 0x00]).unwrap();
        assert_eq!(frame.to_string(), "201 [2] 01 00");
    }
}
