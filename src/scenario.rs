//! Scripted test cases run through classifier and assembler.
//!
//! Each case is classified and assembled with a [`Profile`], then the produced
//! frames are compared position by position with the expected sequence. A case
//! passes only when every compared byte matches; errors turn a case into a
//! failure and never stop the run.

use crate::fault::{FaultClassification, Readings};
use crate::frame::Frame;
use crate::protocol::Profile;
use crate::Error;
use std::fmt;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum Expected {
    /// Leading payload bytes of the frame.
    Payload(Vec<u8>),
    /// Byte at the layout's fault field.
    FaultByte(u8),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct Expectation {
    pub frame_id: u16,
    pub check: Expected,
}

impl Expectation {
    pub fn payload(frame_id: u16, bytes: &[u8]) -> Self {
        Self {
            frame_id,
            check: Expected::Payload(bytes.to_vec()),
        }
    }

    pub fn fault_byte(frame_id: u16, code: u8) -> Self {
        Self {
            frame_id,
            check: Expected::FaultByte(code),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct TestCase {
    pub case_id: String,
    pub inputs: Readings,
    pub expected: Vec<Expectation>,
}

impl TestCase {
    pub fn new(case_id: &str, inputs: &[(&str, f64)], expected: Vec<Expectation>) -> Self {
        Self {
            case_id: case_id.to_string(),
            inputs: inputs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum Status {
    Pass,
    Fail,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Pass => write!(f, "Pass"),
            Status::Fail => write!(f, "Fail"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct ReportEntry {
    pub case_id: String,
    pub inputs: Readings,
    /// Raised faults only.
    pub faults: Vec<FaultClassification>,
    pub frames: Vec<Frame>,
    pub status: Status,
    /// Error or first mismatch of a failed case.
    pub detail: Option<String>,
}

impl ReportEntry {
    pub fn passed(&self) -> bool {
        self.status == Status::Pass
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl Summary {
    pub fn of(report: &[ReportEntry]) -> Self {
        let passed = report.iter().filter(|e| e.passed()).count();
        Self {
            total: report.len(),
            passed,
            failed: report.len() - passed,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} cases, {} passed, {} failed",
            self.total, self.passed, self.failed
        )
    }
}

fn compare(profile: &Profile, frames: &[Frame], expected: &[Expectation]) -> Option<String> {
    if frames.len() != expected.len() {
        return Some(format!(
            "produced {} frames, expected {}",
            frames.len(),
            expected.len()
        ));
    }
    for (index, (frame, expectation)) in frames.iter().zip(expected).enumerate() {
        if frame.id() != expectation.frame_id {
            return Some(format!(
                "frame #{index}: id 0x{:03X}, expected 0x{:03X}",
                frame.id(),
                expectation.frame_id
            ));
        }
        match &expectation.check {
            Expected::Payload(bytes) => {
                if !frame.payload().starts_with(bytes) {
                    return Some(format!(
                        "frame 0x{:03X}: payload {:02X?}, expected {bytes:02X?}",
                        frame.id(),
                        frame.payload()
                    ));
                }
            }
            Expected::FaultByte(code) => {
                let offset = profile
                    .layouts()
                    .get(frame.id())
                    .and_then(|layout| layout.offset_of_fault());
                let Some(offset) = offset else {
                    return Some(format!("frame 0x{:03X} has no fault field", frame.id()));
                };
                let actual = frame.payload()[offset];
                if actual != *code {
                    return Some(format!(
                        "frame 0x{:03X}: fault 0x{actual:02X}, expected 0x{code:02X}",
                        frame.id()
                    ));
                }
            }
        }
    }
    None
}

fn evaluate(profile: &Profile, case: &TestCase) -> Result<(Vec<FaultClassification>, Vec<Frame>), Error> {
    let (report, frames) = profile.evaluate(&case.inputs)?;
    Ok((report.faults().cloned().collect(), frames))
}

/// Runs every case and reports each one independently.
pub fn run(profile: &Profile, cases: &[TestCase]) -> Vec<ReportEntry> {
    cases
        .iter()
        .map(|case| {
            let (faults, frames, status, detail) = match evaluate(profile, case) {
                Ok((faults, frames)) => match compare(profile, &frames, &case.expected) {
                    None => (faults, frames, Status::Pass, None),
                    Some(mismatch) => (faults, frames, Status::Fail, Some(mismatch)),
                },
                Err(err) => (Vec::new(), Vec::new(), Status::Fail, Some(err.to_string())),
            };
            match &detail {
                Some(detail) => log::warn!("{} {status}: {detail}", case.case_id),
                None => log::info!("{} {status}", case.case_id),
            }
            ReportEntry {
                case_id: case.case_id.clone(),
                inputs: case.inputs.clone(),
                faults,
                frames,
                status,
                detail,
            }
        })
        .collect()
}
