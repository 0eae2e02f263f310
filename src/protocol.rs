//! Wire identifiers of the BMS frames and the profiles built on them.
//!
//! A [`Profile`] ties one [`LayoutTable`] to the rule groups that feed its
//! fault fields. Each profile owns its table, so identifiers only need to be
//! unique within a profile.

use crate::codec::SignalSpec;
use crate::fault::{classify_all, FaultKind, FaultReport, Readings, RuleGroup, Thresholds};
use crate::frame::{DecodedFrame, Field, Frame, FrameLayout, LayoutTable};
use crate::scenario::{Expectation, TestCase};
use crate::Error;

pub const VOLTAGE_STATUS_ID: u16 = 0x101;
pub const BMS_STATUS_ID: u16 = 0x123;
pub const VOLTAGE_MEASUREMENT_ID: u16 = 0x200;
/// Thermal profile reuses 0x200 for the cell temperature.
pub const CELL_TEMPERATURE_ID: u16 = 0x200;
pub const VOLTAGE_FAULT_ID: u16 = 0x201;
pub const TEMPERATURE_FAULT_ID: u16 = 0x202;
pub const CURRENT_FAULT_ID: u16 = 0x204;

/// Frame layouts and rule groups that belong together.
///
/// Built once at startup; layouts are validated while the profile is built so
/// a layout that does not fit into a frame never reaches the send path.
#[derive(Debug, Clone)]
pub struct Profile {
    name: String,
    layouts: LayoutTable,
    groups: Vec<RuleGroup>,
}

impl Profile {
    pub fn new(name: &str, layouts: LayoutTable, groups: Vec<RuleGroup>) -> Self {
        Self {
            name: name.to_string(),
            layouts,
            groups,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layouts(&self) -> &LayoutTable {
        &self.layouts
    }

    pub fn groups(&self) -> &[RuleGroup] {
        &self.groups
    }

    pub fn classify(&self, readings: &Readings) -> Result<FaultReport, Error> {
        classify_all(readings, &self.groups)
    }

    /// Classifies only the groups whose signals are all in `readings`.
    pub fn classify_available(&self, readings: &Readings) -> Result<FaultReport, Error> {
        let applicable: Vec<RuleGroup> = self
            .groups
            .iter()
            .filter(|group| group.applies_to(readings))
            .cloned()
            .collect();
        classify_all(readings, &applicable)
    }

    /// Classifies `readings` and assembles every declared frame.
    pub fn evaluate(&self, readings: &Readings) -> Result<(FaultReport, Vec<Frame>), Error> {
        let report = self.classify(readings)?;
        let frames = self.layouts.assemble_all(readings, &report)?;
        Ok((report, frames))
    }

    /// Decodes a received frame and classifies whatever it carries.
    pub fn inspect(&self, frame: &Frame) -> Result<(DecodedFrame, FaultReport), Error> {
        let decoded = self.layouts.unpack(frame)?;
        let report = self.classify_available(&decoded.readings)?;
        Ok((decoded, report))
    }

    /// Fast charge check: one fault code frame per channel.
    pub fn fast_charge(thresholds: &Thresholds) -> Result<Self, Error> {
        let layouts = LayoutTable::new()
            .declare(
                VOLTAGE_FAULT_ID,
                FrameLayout::declare("voltage_fault", vec![Field::fault_code("voltage")])?,
            )?
            .declare(
                CURRENT_FAULT_ID,
                FrameLayout::declare("current_fault", vec![Field::fault_code("current")])?,
            )?
            .declare(
                TEMPERATURE_FAULT_ID,
                FrameLayout::declare("temperature_fault", vec![Field::fault_code("temperature")])?,
            )?;
        Ok(Self::new(
            "fast-charge",
            layouts,
            vec![
                thresholds.overvoltage_group(),
                thresholds.current_group(),
                thresholds.temperature_group(),
            ],
        ))
    }

    /// Overvoltage test: voltage[2] fault[1] reserved[5].
    pub fn overvoltage(thresholds: &Thresholds) -> Result<Self, Error> {
        let layouts = LayoutTable::new().declare(
            VOLTAGE_FAULT_ID,
            FrameLayout::declare(
                "voltage_fault",
                vec![
                    Field::signal("voltage", SignalSpec::millivolts()),
                    Field::fault_code("voltage"),
                    Field::reserved(5),
                ],
            )?,
        )?;
        Ok(Self::new(
            "overvoltage",
            layouts,
            vec![thresholds.overvoltage_group()],
        ))
    }

    /// Voltage measurement plus a separate fault code frame.
    pub fn voltage_fault(thresholds: &Thresholds) -> Result<Self, Error> {
        let layouts = LayoutTable::new()
            .declare(
                VOLTAGE_MEASUREMENT_ID,
                FrameLayout::declare(
                    "voltage",
                    vec![
                        Field::signal("voltage", SignalSpec::millivolts()),
                        Field::reserved(6),
                    ],
                )?,
            )?
            .declare(
                VOLTAGE_FAULT_ID,
                FrameLayout::declare(
                    "voltage_fault",
                    vec![Field::fault_code("voltage"), Field::reserved(7)],
                )?,
            )?;
        Ok(Self::new(
            "voltage-fault",
            layouts,
            vec![thresholds.voltage_group()],
        ))
    }

    /// Voltage status frame checked against the diagnostic window.
    pub fn voltage_check(thresholds: &Thresholds) -> Result<Self, Error> {
        let layouts = LayoutTable::new().declare(
            VOLTAGE_STATUS_ID,
            FrameLayout::declare(
                "voltage_status",
                vec![Field::signal("voltage", SignalSpec::millivolts())],
            )?,
        )?;
        Ok(Self::new(
            "voltage-check",
            layouts,
            vec![thresholds.voltage_window_group()],
        ))
    }

    /// BMS status: voltage[2] temperature[2] fault_flag[1] status[1] reserved[2].
    pub fn bms_status(thresholds: &Thresholds) -> Result<Self, Error> {
        let layouts = LayoutTable::new().declare(
            BMS_STATUS_ID,
            FrameLayout::declare(
                "bms_status",
                vec![
                    Field::signal("voltage", SignalSpec::millivolts()),
                    Field::signal("temperature", SignalSpec::decicelsius()),
                    Field::fault_flag("thermal"),
                    Field::signal("status", SignalSpec::byte()),
                    Field::reserved(2),
                ],
            )?,
        )?;
        Ok(Self::new(
            "bms-status",
            layouts,
            vec![thresholds.thermal_group()],
        ))
    }

    /// Single temperature sensor at 0.1 °C resolution.
    pub fn thermal(thresholds: &Thresholds) -> Result<Self, Error> {
        let layouts = LayoutTable::new().declare(
            CELL_TEMPERATURE_ID,
            FrameLayout::declare(
                "cell_temperature",
                vec![
                    Field::signal("temperature", SignalSpec::decicelsius()),
                    Field::reserved(6),
                ],
            )?,
        )?;
        Ok(Self::new("thermal", layouts, vec![thresholds.thermal_group()]))
    }
}

fn fault_frames(voltage: u8, current: u8, temperature: u8) -> Vec<Expectation> {
    vec![
        Expectation::payload(VOLTAGE_FAULT_ID, &[voltage]),
        Expectation::payload(CURRENT_FAULT_ID, &[current]),
        Expectation::payload(TEMPERATURE_FAULT_ID, &[temperature]),
    ]
}

/// Fast charge cases. TC_BMS_FAST_002 expects no fault at 4.3 V and therefore fails.
pub fn fast_charge_cases() -> Vec<TestCase> {
    vec![
        TestCase::new(
            "TC_BMS_FAST_001",
            &[
                ("voltage", 3.7),
                ("current", 20.0),
                ("temp1", 40.0),
                ("temp2", 41.0),
                ("soc", 50.0),
            ],
            fault_frames(0x00, 0x00, 0x00),
        ),
        TestCase::new(
            "TC_BMS_FAST_002",
            &[
                ("voltage", 4.3),
                ("current", 25.0),
                ("temp1", 50.0),
                ("temp2", 50.0),
                ("soc", 90.0),
            ],
            fault_frames(0x00, 0x00, 0x00),
        ),
        TestCase::new(
            "TC_BMS_FAST_003",
            &[
                ("voltage", 4.0),
                ("current", 35.0),
                ("temp1", 55.0),
                ("temp2", 55.0),
                ("soc", 80.0),
            ],
            fault_frames(0x00, 0x03, 0x00),
        ),
        TestCase::new(
            "TC_BMS_FAST_004",
            &[
                ("voltage", 4.0),
                ("current", 20.0),
                ("temp1", 65.0),
                ("temp2", 57.0),
                ("soc", 85.0),
            ],
            fault_frames(0x00, 0x00, 0x02),
        ),
    ]
}

pub fn overvoltage_cases() -> Vec<TestCase> {
    [
        ("TC_BMS_OV_001", 3.7, 0x00),
        ("TC_BMS_OV_002", 4.2, 0x00),
        ("TC_BMS_OV_003", 4.3, 0x01),
    ]
    .into_iter()
    .map(|(case_id, voltage, fault)| {
        TestCase::new(
            case_id,
            &[("voltage", voltage)],
            vec![Expectation::fault_byte(VOLTAGE_FAULT_ID, fault)],
        )
    })
    .collect()
}

/// Short label of a fault kind for console output.
pub fn fault_label(kind: FaultKind) -> &'static str {
    match kind {
        FaultKind::None => "OK",
        FaultKind::Overvoltage => "OV",
        FaultKind::Undervoltage => "UV",
        FaultKind::Overcurrent => "OC",
        FaultKind::Overtemperature => "OT",
        FaultKind::Undertemperature => "UT",
        FaultKind::ThermalAsymmetry => "TA",
    }
}
