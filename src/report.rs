use crate::commandline::ReportFormat;
use anyhow::{Context, Result};
use canbms_lib::scenario::{ReportEntry, Summary};
use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// One CSV line per test case.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    case_id: &'a str,
    status: String,
    inputs: String,
    faults: String,
    frames: String,
    detail: &'a str,
}

impl<'a> From<&'a ReportEntry> for CsvRow<'a> {
    fn from(entry: &'a ReportEntry) -> Self {
        let mut inputs: Vec<String> = entry
            .inputs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        inputs.sort();
        let faults: Vec<String> = entry
            .faults
            .iter()
            .map(|fault| format!("0x{:02X} {}", fault.code, fault.kind))
            .collect();
        let frames: Vec<String> = entry.frames.iter().map(ToString::to_string).collect();
        Self {
            case_id: &entry.case_id,
            status: entry.status.to_string(),
            inputs: inputs.join(";"),
            faults: faults.join(";"),
            frames: frames.join(";"),
            detail: entry.detail.as_deref().unwrap_or(""),
        }
    }
}

pub fn write_csv<W: Write>(writer: W, entries: &[ReportEntry]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for entry in entries {
        writer.serialize(CsvRow::from(entry))?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    suite: &'a str,
    generated_at: String,
    summary: Summary,
    entries: &'a [ReportEntry],
}

pub fn write_json<W: Write>(writer: W, suite: &str, entries: &[ReportEntry]) -> Result<()> {
    let report = JsonReport {
        suite,
        generated_at: chrono::Local::now().to_rfc3339(),
        summary: Summary::of(entries),
        entries,
    };
    serde_json::to_writer_pretty(writer, &report)?;
    Ok(())
}

/// Writes the report to `output`, or to stdout when no file is given.
pub fn write_report(
    output: Option<&Path>,
    format: ReportFormat,
    suite: &str,
    entries: &[ReportEntry],
) -> Result<()> {
    let writer: Box<dyn Write> = match output {
        Some(path) => Box::new(
            File::create(path)
                .with_context(|| format!("failed to create report file {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    match format {
        ReportFormat::Csv => write_csv(writer, entries),
        ReportFormat::Json => write_json(writer, suite, entries),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canbms_lib::fault::Thresholds;
    use canbms_lib::protocol::{fast_charge_cases, overvoltage_cases, Profile};
    use canbms_lib::scenario;

    #[test]
    fn csv_has_one_row_per_case() {
        let profile = Profile::fast_charge(&Thresholds::default()).unwrap();
        let entries = scenario::run(&profile, &fast_charge_cases());
        let mut out = Vec::new();
        write_csv(&mut out, &entries).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "case_id,status,inputs,faults,frames,detail");
        assert_eq!(lines.len(), 5);
        assert!(lines[1].starts_with("TC_BMS_FAST_001,Pass,current=20;soc=50;temp1=40;temp2=41;voltage=3.7,,"));
        assert!(lines[2].starts_with("TC_BMS_FAST_002,Fail,"));
        assert!(lines[2].contains("0x01 Overvoltage"));
        assert!(lines[3].contains("0x03 Overcurrent"));
    }

    #[test]
    fn json_report_file() {
        let profile = Profile::overvoltage(&Thresholds::default()).unwrap();
        let entries = scenario::run(&profile, &overvoltage_cases());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(Some(&path), ReportFormat::Json, "overvoltage", &entries).unwrap();

        let value: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(value["suite"], "overvoltage");
        assert_eq!(value["summary"]["total"], 3);
        assert_eq!(value["summary"]["passed"], 3);
        assert_eq!(value["entries"][2]["case_id"], "TC_BMS_OV_003");
        assert_eq!(value["entries"][2]["faults"][0]["code"], 1);
    }
}
