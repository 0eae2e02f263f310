use anyhow::{bail, Context, Result};
use canbms_lib::codec;
use canbms_lib::fault::{Readings, Thresholds};
use canbms_lib::frame::Frame;
use canbms_lib::listener::{FrameLogger, Notifier};
use canbms_lib::protocol::{self, fault_label, Profile, BMS_STATUS_ID, VOLTAGE_STATUS_ID};
use canbms_lib::scenario::{self, Summary};
use canbms_lib::schema::decode_or_log;
use canbms_lib::transport::{connect_or_mock, NullTransport, Transport, VirtualChannel};
use clap::Parser;
use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle};
use log::*;
use std::io::Write;
use std::path::Path;
use std::{ops::Deref, panic};

mod commandline;
mod config;
mod daemon;
mod mqtt;
mod report;

use commandline::{BusKind, CliArgs, CliCommands, Suite};

fn logging_init(loglevel: LevelFilter, log_dir: Option<&Path>) -> Result<LoggerHandle> {
    let mut logger = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?;
    if let Some(dir) = log_dir {
        logger = logger
            .log_to_file(FileSpec::default().directory(dir).basename("canbms"))
            .duplicate_to_stderr(Duplicate::All);
    }
    let log_handle = logger.start().with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn open_bus(args: &CliArgs, channel: &VirtualChannel) -> Box<dyn Transport> {
    match args.bus {
        BusKind::Mock => Box::new(NullTransport),
        BusKind::Virtual => connect_or_mock(Ok(channel.connect(true))),
        BusKind::Slcan => connect_or_mock(canbms_lib::serialport::open_slcan(
            &args.device,
            args.bitrate,
            args.timeout,
        )),
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.trim_start_matches("0x");
    if !digits.is_ascii() {
        bail!("Invalid hex digits in '{text}'");
    }
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits in '{text}'");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn readings(values: &[(&str, f64)]) -> Readings {
    values.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn classify(thresholds: &Thresholds, values: &[(&str, f64)]) -> Result<()> {
    let profile = Profile::fast_charge(thresholds)?;
    let (report, frames) = profile
        .evaluate(&readings(values))
        .with_context(|| "Cannot classify readings")?;
    for (group, fault) in report.iter() {
        println!("{group}: 0x{:02X} [{}] {fault}", fault.code, fault_label(fault.kind));
    }
    for frame in frames {
        println!("{frame}");
    }
    Ok(())
}

fn send_status(
    bus: &mut dyn Transport,
    thresholds: &Thresholds,
    values: &[(&str, f64)],
    force_fault: bool,
    id: u16,
    frame_log: Option<&Path>,
) -> Result<()> {
    let profile = Profile::bms_status(thresholds)?;
    let layout = profile
        .layouts()
        .get(BMS_STATUS_ID)
        .with_context(|| "BMS status layout missing")?;
    let readings = readings(values);
    let report = profile.classify(&readings)?;
    let mut frame = layout
        .pack(id, &readings, &report)
        .with_context(|| "Cannot build BMS status frame")?;
    if force_fault {
        if let Some(offset) = layout.offset_of_fault() {
            let mut data = frame.data().to_vec();
            data[offset] = 1;
            frame = Frame::new(id, &data)?;
        }
    }

    let mut notifier = Notifier::default();
    if let Some(path) = frame_log {
        let logger = FrameLogger::open(path)
            .with_context(|| format!("Cannot open frame log {}", path.display()))?;
        notifier.add(Box::new(logger));
    }

    let result = bus.send(&frame);
    match &result {
        Ok(()) => {
            println!("Sent BMS frame on {}", bus.channel_info());
            println!("Raw data: {:?}", frame.data());
            notifier.dispatch(&frame);
        }
        Err(e) => println!("Failed to send: {e}"),
    }
    notifier.stop();
    bus.shutdown()?;
    result.with_context(|| format!("Cannot send {frame}"))
}

fn simulate_voltage(
    bus: &mut dyn Transport,
    thresholds: &Thresholds,
    voltages: &[f64],
    interval: std::time::Duration,
) -> Result<()> {
    let profile = Profile::voltage_fault(thresholds)?;
    println!("Starting CAN fault simulation...");
    for (index, voltage) in voltages.iter().enumerate() {
        let (report, frames) = match profile.evaluate(&readings(&[("voltage", *voltage)])) {
            Ok(evaluated) => evaluated,
            Err(e) => {
                error!("Cannot simulate {voltage} V: {e}");
                continue;
            }
        };
        for frame in &frames {
            if let Err(e) = bus.send(frame) {
                error!("Failed to send {frame}: {e}");
            }
        }
        let code = report.get("voltage").map(|f| f.code).unwrap_or_default();
        println!("[{}] Voltage={voltage:.2}V | Fault=0x{code:02X}", index + 1);
        std::thread::sleep(interval);
    }
    bus.shutdown()?;
    println!("CAN bus shutdown complete.");
    Ok(())
}

fn check_voltage(
    bus: &mut dyn Transport,
    thresholds: &Thresholds,
    voltages: &[f64],
    settle: std::time::Duration,
    timeout: std::time::Duration,
    out: &mut dyn Write,
) -> Result<()> {
    let profile = Profile::voltage_check(thresholds)?;
    for voltage in voltages {
        match profile.layouts().pack(
            VOLTAGE_STATUS_ID,
            &readings(&[("voltage", *voltage)]),
            &Default::default(),
        ) {
            Ok(frame) => match bus.send(&frame) {
                Ok(()) => info!("Sent voltage: {voltage:.3} V"),
                Err(e) => error!("Send failed: {e}"),
            },
            Err(e) => error!("Cannot encode {voltage} V: {e}"),
        }
        std::thread::sleep(settle);

        let frame = match bus.receive(timeout) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                writeln!(out, "No CAN message received.")?;
                warn!("No CAN message received.");
                continue;
            }
            Err(e) => {
                writeln!(out, "Receive failed: {e}")?;
                error!("Receive failed: {e}");
                continue;
            }
        };
        match profile.inspect(&frame) {
            Ok((decoded, report)) => {
                if let Some(received) = decoded.readings.get("voltage") {
                    writeln!(out, "Received voltage: {received:.3} V")?;
                    info!("Received voltage: {received:.3} V");
                }
                for fault in report.faults() {
                    let warning = format!("Voltage out of range: {fault}");
                    writeln!(out, "{warning}")?;
                    warn!("{warning}");
                }
            }
            Err(e) => warn!("Unexpected frame {frame}: {e}"),
        }
        if let Some(decoded) = decode_or_log(profile.layouts(), &frame) {
            writeln!(out, "Decoded values: {decoded:?}")?;
        }
    }
    bus.shutdown()?;
    Ok(())
}

fn run_suite(
    thresholds: &Thresholds,
    suite: Suite,
    output: Option<&Path>,
    format: commandline::ReportFormat,
) -> Result<()> {
    let (name, profile, cases) = match suite {
        Suite::FastCharge => (
            "fast-charge",
            Profile::fast_charge(thresholds)?,
            protocol::fast_charge_cases(),
        ),
        Suite::Overvoltage => (
            "overvoltage",
            Profile::overvoltage(thresholds)?,
            protocol::overvoltage_cases(),
        ),
    };
    let entries = scenario::run(&profile, &cases);
    for entry in &entries {
        match &entry.detail {
            Some(detail) => println!("{} {}: {detail}", entry.case_id, entry.status),
            None => println!("{} {}", entry.case_id, entry.status),
        }
    }
    println!("{}", Summary::of(&entries));
    if let Some(path) = output {
        report::write_report(Some(path), format, name, &entries)?;
        info!("Report written to {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter(), args.log_dir.as_deref())?;

    let app_config = config::AppConfig::load_or_default(&args.config)?;
    let thresholds = &app_config.thresholds;
    let channel = VirtualChannel::new("vcan0");

    match &args.command {
        CliCommands::Encode { value, field } => {
            let bytes = codec::encode(*value, &field.spec())
                .with_context(|| format!("Cannot encode {value}"))?;
            println!("{}", hex_bytes(&bytes));
        }
        CliCommands::Decode { hex, field } => {
            let bytes = parse_hex(hex)?;
            let value = codec::decode(&bytes, &field.spec())
                .with_context(|| format!("Cannot decode '{hex}'"))?;
            println!("{value}");
        }
        CliCommands::Classify {
            voltage,
            current,
            temp1,
            temp2,
        } => classify(
            thresholds,
            &[
                ("voltage", *voltage),
                ("current", *current),
                ("temp1", *temp1),
                ("temp2", *temp2),
            ],
        )?,
        CliCommands::SendStatus {
            voltage,
            temperature,
            fault,
            status,
            id,
            frame_log,
        } => {
            let mut bus = open_bus(&args, &channel);
            send_status(
                bus.as_mut(),
                thresholds,
                &[
                    ("voltage", *voltage),
                    ("temperature", *temperature),
                    ("status", f64::from(*status)),
                ],
                *fault,
                *id,
                frame_log.as_deref(),
            )?
        }
        CliCommands::SimulateVoltage { voltages, interval } => {
            let mut bus = open_bus(&args, &channel);
            simulate_voltage(bus.as_mut(), thresholds, voltages, *interval)?
        }
        CliCommands::CheckVoltage { voltages, settle } => {
            let mut bus = open_bus(&args, &channel);
            check_voltage(
                bus.as_mut(),
                thresholds,
                voltages,
                *settle,
                args.timeout,
                &mut std::io::stdout(),
            )?
        }
        CliCommands::Test {
            suite,
            report,
            format,
        } => run_suite(thresholds, *suite, report.as_deref(), *format)?,
        CliCommands::ThermalMonitor {
            count,
            cadence,
            frame_log,
            mqtt_config,
        } => {
            let mut thermal = app_config.thermal.clone();
            if let Some(count) = count {
                thermal.count = *count;
            }
            if let Some(cadence) = cadence {
                thermal.cadence = *cadence;
            }
            let bus = open_bus(&args, &channel);
            daemon::run(
                bus,
                Profile::thermal(thresholds)?,
                daemon::ThermalOptions {
                    config: thermal,
                    frame_log: frame_log.clone(),
                    mqtt_config: mqtt_config.clone(),
                },
            )?
        }
    }

    Ok(())
}
