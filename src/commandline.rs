use crate::config::AppConfig;
use canbms_lib::codec::{ByteOrder, SignalSpec, Signedness, Width};
use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// Accepts every frame and never receives one
    Mock,
    /// In-process loopback channel
    Virtual,
    /// Serial line CAN adapter on --device
    Slcan,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suite {
    /// TC_BMS_FAST_001..004 on the voltage/current/temperature fault frames
    FastCharge,
    /// TC_BMS_OV_001..003 on the voltage fault frame
    Overvoltage,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Csv,
    Json,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct FieldArgs {
    /// Raw units per physical unit (1000 for millivolts, 10 for 0.1 °C)
    #[arg(long, default_value_t = 1000)]
    pub scale: u32,
    /// Field width in bytes (1 or 2)
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=2))]
    pub width: u8,
    /// Two's complement field
    #[arg(long, action)]
    pub signed: bool,
    /// Least significant byte first
    #[arg(long, action)]
    pub little_endian: bool,
}

impl FieldArgs {
    pub fn spec(&self) -> SignalSpec {
        SignalSpec::new(
            self.scale,
            if self.width == 1 { Width::One } else { Width::Two },
            if self.signed {
                Signedness::Signed
            } else {
                Signedness::Unsigned
            },
            if self.little_endian {
                ByteOrder::Little
            } else {
                ByteOrder::Big
            },
        )
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Encode a physical value into a field
    Encode {
        /// Physical value, e.g. 4.0 for 4.0 V
        #[arg(allow_negative_numbers = true)]
        value: f64,
        #[command(flatten)]
        field: FieldArgs,
    },
    /// Decode field bytes given as hex, e.g. "0FA0" or "0F A0"
    Decode {
        hex: String,
        #[command(flatten)]
        field: FieldArgs,
    },
    /// Classify readings against the voltage, current and temperature rules
    Classify {
        #[arg(long, allow_negative_numbers = true)]
        voltage: f64,
        #[arg(long, allow_negative_numbers = true)]
        current: f64,
        #[arg(long, allow_negative_numbers = true)]
        temp1: f64,
        #[arg(long, allow_negative_numbers = true)]
        temp2: f64,
    },
    /// Send one BMS status frame (voltage, temperature, fault flag and status)
    SendStatus {
        #[arg(long, default_value_t = 3.72)]
        voltage: f64,
        #[arg(long, default_value_t = 26.4, allow_negative_numbers = true)]
        temperature: f64,
        /// Force the fault flag regardless of the thermal rules
        #[arg(long, action)]
        fault: bool,
        #[arg(long, default_value_t = 1)]
        status: u8,
        /// Frame identifier (decimal or 0x prefixed hex)
        #[arg(long, value_parser = maybe_hex::<u16>, default_value = "0x123")]
        id: u16,
        /// Append the sent frame to this capture file
        #[arg(long)]
        frame_log: Option<PathBuf>,
    },
    /// Send voltage measurement and fault code frames for each voltage
    SimulateVoltage {
        #[arg(default_values_t = [3.7, 4.3, 2.9, 4.0, 3.2])]
        voltages: Vec<f64>,
        /// Pause between voltages
        #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
        interval: Duration,
    },
    /// Send voltage status frames, read them back and check the diagnostic window
    CheckVoltage {
        #[arg(default_values_t = [3.8, 4.3, 2.2, 3.95])]
        voltages: Vec<f64>,
        /// Pause between sending and receiving
        #[arg(long, value_parser = humantime::parse_duration, default_value = "200ms")]
        settle: Duration,
    },
    /// Run a built-in test suite and write the report
    Test {
        #[arg(value_enum)]
        suite: Suite,
        /// Report file
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ReportFormat::Csv)]
        format: ReportFormat,
    },
    /// Simulate a temperature sensor and monitor the bus asynchronously
    ThermalMonitor {
        /// Number of frames to send (overrides the configuration file)
        #[arg(long)]
        count: Option<usize>,
        /// Pause between frames, e.g. "400ms" (overrides the configuration file)
        #[arg(long, value_parser = humantime::parse_duration)]
        cadence: Option<Duration>,
        /// Append every received frame to this capture file
        #[arg(long)]
        frame_log: Option<PathBuf>,
        /// Publish classified frames to the MQTT broker configured in this file
        #[arg(long)]
        mqtt_config: Option<PathBuf>,
    },
}

const fn about_text() -> &'static str {
    "BMS fault classification and CAN simulation tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// CAN bus to use; an unavailable adapter falls back to the mock bus
    #[arg(long, value_enum, default_value_t = BusKind::Virtual)]
    pub bus: BusKind,

    /// Serial port device of the CAN adapter (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// CAN bit rate of the adapter
    #[arg(long, default_value_t = 500_000)]
    pub bitrate: u32,

    /// Timeout for bus I/O operations (e.g., "100ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub timeout: Duration,

    /// YAML file with thresholds and monitor settings
    #[arg(long, default_value_t = AppConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub config: String,

    /// Additionally write the log into this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommands,
}
