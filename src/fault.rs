//! Threshold based fault classification.
//!
//! Rules are grouped per fault channel (voltage, current, temperature). A group
//! is evaluated in declaration order and the first rule that fires decides the
//! fault code, so priority is explicit in the rule table.

use crate::Error;
use std::collections::HashMap;
use std::fmt;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

/// Named physical values of one evaluation.
pub type Readings = HashMap<String, f64>;

pub const NO_FAULT: u8 = 0x00;
pub const OVERVOLTAGE: u8 = 0x01;
pub const UNDERVOLTAGE: u8 = 0x02;
pub const OVERTEMPERATURE: u8 = 0x02;
pub const OVERCURRENT: u8 = 0x03;
pub const UNDERTEMPERATURE: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum FaultKind {
    None,
    Overvoltage,
    Undervoltage,
    Overcurrent,
    Overtemperature,
    Undertemperature,
    ThermalAsymmetry,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultKind::None => write!(f, "None"),
            FaultKind::Overvoltage => write!(f, "Overvoltage"),
            FaultKind::Undervoltage => write!(f, "Undervoltage"),
            FaultKind::Overcurrent => write!(f, "Overcurrent"),
            FaultKind::Overtemperature => write!(f, "Overtemperature"),
            FaultKind::Undertemperature => write!(f, "Undertemperature"),
            FaultKind::ThermalAsymmetry => write!(f, "Thermal asymmetry"),
        }
    }
}

/// A signal value that contributed to a fault.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct Reading {
    pub name: String,
    pub value: f64,
}

/// Predicate over several signals.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum CrossCheck {
    /// Fires when `|a - b| > limit`.
    AbsDifferenceAbove { a: String, b: String, limit: f64 },
}

impl CrossCheck {
    fn signals(&self) -> [&str; 2] {
        match self {
            CrossCheck::AbsDifferenceAbove { a, b, .. } => [a.as_str(), b.as_str()],
        }
    }

    fn holds(&self, readings: &Readings) -> Result<bool, Error> {
        match self {
            CrossCheck::AbsDifferenceAbove { a, b, limit } => {
                let diff = (reading(readings, a)? - reading(readings, b)?).abs();
                Ok(diff > *limit)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct ThresholdRule {
    pub kind: FaultKind,
    pub code: u8,
    /// Signals checked against `min`/`max`.
    pub signals: Vec<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub cross_check: Option<CrossCheck>,
}

impl ThresholdRule {
    /// Fires when `signal > max`.
    pub fn above(kind: FaultKind, code: u8, signal: &str, max: f64) -> Self {
        Self {
            kind,
            code,
            signals: vec![signal.to_string()],
            min: None,
            max: Some(max),
            cross_check: None,
        }
    }

    /// Fires when `signal < min`.
    pub fn below(kind: FaultKind, code: u8, signal: &str, min: f64) -> Self {
        Self {
            kind,
            code,
            signals: vec![signal.to_string()],
            min: Some(min),
            max: None,
            cross_check: None,
        }
    }

    /// Fires when `|signal| > limit`.
    pub fn magnitude_above(kind: FaultKind, code: u8, signal: &str, limit: f64) -> Self {
        Self {
            kind,
            code,
            signals: vec![signal.to_string()],
            min: Some(-limit),
            max: Some(limit),
            cross_check: None,
        }
    }

    pub fn with_cross_check(mut self, check: CrossCheck) -> Self {
        self.cross_check = Some(check);
        self
    }

    /// All signal names this rule reads, in order of first use.
    pub fn referenced_signals(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.signals.iter().map(String::as_str).collect();
        if let Some(check) = &self.cross_check {
            for name in check.signals() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Returns the triggering signals when the rule fires.
    fn evaluate(&self, readings: &Readings) -> Result<Option<Vec<Reading>>, Error> {
        let mut triggering = Vec::new();
        for name in &self.signals {
            let value = reading(readings, name)?;
            let below = self.min.is_some_and(|min| value < min);
            let above = self.max.is_some_and(|max| value > max);
            if below || above {
                triggering.push(Reading {
                    name: name.clone(),
                    value,
                });
            }
        }
        if let Some(check) = &self.cross_check {
            if check.holds(readings)? {
                for name in check.signals() {
                    if !triggering.iter().any(|r| r.name == name) {
                        triggering.push(Reading {
                            name: name.to_string(),
                            value: reading(readings, name)?,
                        });
                    }
                }
            }
        }
        if triggering.is_empty() {
            Ok(None)
        } else {
            Ok(Some(triggering))
        }
    }
}

fn reading(readings: &Readings, name: &str) -> Result<f64, Error> {
    readings
        .get(name)
        .copied()
        .ok_or_else(|| Error::MissingSignal(name.to_string()))
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct FaultClassification {
    pub code: u8,
    pub kind: FaultKind,
    pub triggering_signals: Vec<Reading>,
}

impl FaultClassification {
    pub fn none() -> Self {
        Self {
            code: NO_FAULT,
            kind: FaultKind::None,
            triggering_signals: Vec::new(),
        }
    }

    pub fn is_fault(&self) -> bool {
        self.kind != FaultKind::None
    }
}

impl fmt::Display for FaultClassification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.triggering_signals.is_empty() {
            let signals: Vec<String> = self
                .triggering_signals
                .iter()
                .map(|r| format!("{}={}", r.name, r.value))
                .collect();
            write!(f, ": {}", signals.join(", "))?;
        }
        Ok(())
    }
}

/// Evaluates `rules` in order and returns the first firing rule's classification.
///
/// Every signal referenced by any rule must be present, regardless of which
/// rule would fire.
pub fn classify(readings: &Readings, rules: &[ThresholdRule]) -> Result<FaultClassification, Error> {
    for rule in rules {
        for name in rule.referenced_signals() {
            reading(readings, name)?;
        }
    }
    for rule in rules {
        if let Some(triggering_signals) = rule.evaluate(readings)? {
            log::trace!("rule {:?} fired on {triggering_signals:?}", rule.kind);
            return Ok(FaultClassification {
                code: rule.code,
                kind: rule.kind,
                triggering_signals,
            });
        }
    }
    Ok(FaultClassification::none())
}

/// Rules of one fault channel.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct RuleGroup {
    pub name: String,
    pub rules: Vec<ThresholdRule>,
}

impl RuleGroup {
    pub fn new(name: &str, rules: Vec<ThresholdRule>) -> Self {
        Self {
            name: name.to_string(),
            rules,
        }
    }

    pub fn classify(&self, readings: &Readings) -> Result<FaultClassification, Error> {
        classify(readings, &self.rules)
    }

    /// True when every signal the group reads is present.
    pub fn applies_to(&self, readings: &Readings) -> bool {
        self.rules
            .iter()
            .flat_map(ThresholdRule::referenced_signals)
            .all(|name| readings.contains_key(name))
    }
}

/// Classification of every group of one evaluation, in group order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultReport {
    entries: Vec<(String, FaultClassification)>,
}

impl FaultReport {
    pub fn get(&self, group: &str) -> Option<&FaultClassification> {
        self.entries
            .iter()
            .find(|(name, _)| name == group)
            .map(|(_, classification)| classification)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FaultClassification)> {
        self.entries.iter().map(|(name, c)| (name.as_str(), c))
    }

    /// Only the groups that raised a fault.
    pub fn faults(&self) -> impl Iterator<Item = &FaultClassification> {
        self.entries.iter().map(|(_, c)| c).filter(|c| c.is_fault())
    }

    pub fn has_fault(&self) -> bool {
        self.faults().next().is_some()
    }
}

pub fn classify_all(readings: &Readings, groups: &[RuleGroup]) -> Result<FaultReport, Error> {
    let mut entries = Vec::with_capacity(groups.len());
    for group in groups {
        entries.push((group.name.clone(), group.classify(readings)?));
    }
    Ok(FaultReport { entries })
}

/// Numeric limits used to build the standard rule groups.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "protocol_serde", serde(default))]
pub struct Thresholds {
    pub voltage_max: f64,
    pub voltage_min: f64,
    /// Acceptance window of the voltage diagnostic.
    pub voltage_window_min: f64,
    pub current_limit: f64,
    pub temperature_max: f64,
    pub temperature_min: f64,
    pub asymmetry_limit: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            voltage_max: 4.2,
            voltage_min: 3.0,
            voltage_window_min: 2.5,
            current_limit: 30.0,
            temperature_max: 60.0,
            temperature_min: 0.0,
            asymmetry_limit: 7.0,
        }
    }
}

impl Thresholds {
    pub fn voltage_group(&self) -> RuleGroup {
        RuleGroup::new(
            "voltage",
            vec![
                ThresholdRule::above(FaultKind::Overvoltage, OVERVOLTAGE, "voltage", self.voltage_max),
                ThresholdRule::below(FaultKind::Undervoltage, UNDERVOLTAGE, "voltage", self.voltage_min),
            ],
        )
    }

    /// Overvoltage only, as used by the overvoltage test suite.
    pub fn overvoltage_group(&self) -> RuleGroup {
        RuleGroup::new(
            "voltage",
            vec![ThresholdRule::above(
                FaultKind::Overvoltage,
                OVERVOLTAGE,
                "voltage",
                self.voltage_max,
            )],
        )
    }

    /// Diagnostic window of the voltage check, faults outside `[window_min, max]`.
    pub fn voltage_window_group(&self) -> RuleGroup {
        RuleGroup::new(
            "voltage",
            vec![
                ThresholdRule::above(FaultKind::Overvoltage, OVERVOLTAGE, "voltage", self.voltage_max),
                ThresholdRule::below(
                    FaultKind::Undervoltage,
                    UNDERVOLTAGE,
                    "voltage",
                    self.voltage_window_min,
                ),
            ],
        )
    }

    pub fn current_group(&self) -> RuleGroup {
        RuleGroup::new(
            "current",
            vec![ThresholdRule::magnitude_above(
                FaultKind::Overcurrent,
                OVERCURRENT,
                "current",
                self.current_limit,
            )],
        )
    }

    /// Both pack sensors above the limit or too far apart raise one overtemperature code.
    pub fn temperature_group(&self) -> RuleGroup {
        let mut rule = ThresholdRule {
            kind: FaultKind::Overtemperature,
            code: OVERTEMPERATURE,
            signals: vec!["temp1".to_string(), "temp2".to_string()],
            min: None,
            max: Some(self.temperature_max),
            cross_check: None,
        };
        rule = rule.with_cross_check(CrossCheck::AbsDifferenceAbove {
            a: "temp1".to_string(),
            b: "temp2".to_string(),
            limit: self.asymmetry_limit,
        });
        RuleGroup::new("temperature", vec![rule])
    }

    /// Single sensor window used by the thermal monitor.
    pub fn thermal_group(&self) -> RuleGroup {
        RuleGroup::new(
            "thermal",
            vec![
                ThresholdRule::above(
                    FaultKind::Overtemperature,
                    OVERTEMPERATURE,
                    "temperature",
                    self.temperature_max,
                ),
                ThresholdRule::below(
                    FaultKind::Undertemperature,
                    UNDERTEMPERATURE,
                    "temperature",
                    self.temperature_min,
                ),
            ],
        )
    }
}
