use anyhow::{Context, Result};
use canbms_lib::fault::Readings;
use canbms_lib::frame::Frame;
use canbms_lib::listener::{ConsoleReporter, FrameLogger, Listener};
use canbms_lib::monitor::{buffered_reader, BufferedMessages, Monitor, MonitorSummary};
use canbms_lib::protocol::{Profile, CELL_TEMPERATURE_ID};
use canbms_lib::transport::Transport;
use log::{error, info, warn};
use rand::seq::SliceRandom;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ThermalConfig;
use crate::mqtt;

pub struct ThermalOptions {
    pub config: ThermalConfig,
    pub frame_log: Option<PathBuf>,
    pub mqtt_config: Option<PathBuf>,
}

/// Picks `count` temperatures from `samples` at random.
pub fn simulate_temperatures(samples: &[f64], count: usize) -> Vec<f64> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| samples.choose(&mut rng).copied().unwrap_or(25.0))
        .collect()
}

/// Cell temperature frames of the thermal profile.
pub fn temperature_frames(profile: &Profile, temperatures: &[f64]) -> Result<Vec<Frame>> {
    let layout = profile
        .layouts()
        .get(CELL_TEMPERATURE_ID)
        .with_context(|| "Thermal profile has no cell temperature layout")?;
    let mut frames = Vec::with_capacity(temperatures.len());
    for temperature in temperatures {
        let readings: Readings = [("temperature".to_string(), *temperature)].into();
        // faults are decided by the receiving side
        let report = profile.classify(&readings)?;
        let frame = layout
            .pack(CELL_TEMPERATURE_ID, &readings, &report)
            .with_context(|| format!("Cannot encode temperature {temperature} °C"))?;
        frames.push(frame);
    }
    Ok(frames)
}

async fn drain_buffer(mut messages: BufferedMessages) -> usize {
    let mut count = 0;
    while let Some(frame) = messages.get_message().await {
        log::debug!("Buffered {frame}");
        count += 1;
    }
    count
}

fn print_summary(summary: &MonitorSummary) {
    println!(
        "Sent {} frames ({} failed), received {}",
        summary.sent, summary.send_failures, summary.received
    );
    for listener in &summary.listeners {
        println!(
            "  {}: {} handled, {} failed",
            listener.name, listener.handled, listener.failed
        );
    }
}

/// Runs until the producer is done or `interrupt` completes, then shuts the
/// monitor down in order.
async fn supervise<F>(mut monitor: Monitor, interrupt: F) -> Result<MonitorSummary>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = monitor.wait_producer() => {}
        _ = interrupt => info!("Interrupted, stopping thermal monitor"),
    }
    Ok(monitor.shutdown().await?)
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

pub fn run(
    transport: Box<dyn Transport>,
    profile: Profile,
    options: ThermalOptions,
) -> Result<()> {
    let ThermalOptions {
        config,
        frame_log,
        mqtt_config,
    } = options;
    info!(
        "Starting thermal monitor: count={}, cadence={:?}",
        config.count, config.cadence
    );
    let profile = Arc::new(profile);
    let temperatures = simulate_temperatures(&config.samples, config.count);
    let frames = temperature_frames(&profile, &temperatures)?;

    let (reader, messages) = buffered_reader(config.buffer_size);
    let mut listeners: Vec<Box<dyn Listener>> = vec![
        Box::new(ConsoleReporter::stdout(profile.clone())),
        Box::new(reader),
    ];
    if let Some(path) = &frame_log {
        let logger = FrameLogger::open(path)
            .with_context(|| format!("Cannot open frame log {}", path.display()))?;
        listeners.push(Box::new(logger));
    }
    if let Some(config_file) = &mqtt_config {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at {config_file:?}"))?;
        info!("Successfully loaded MQTT config from {config_file:?}: {config:?}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        listeners.push(Box::new(mqtt::MqttListener::new(publisher, profile.clone())));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Cannot start async runtime")?;

    runtime.block_on(async move {
        let buffered = tokio::spawn(drain_buffer(messages));
        let mut monitor = Monitor::start(transport, listeners, config.poll_interval);
        monitor.spawn_producer(frames, config.cadence).await;
        let summary = supervise(monitor, ctrl_c()).await?;
        match buffered.await {
            Ok(count) => info!("Reader buffered {count} frames"),
            Err(e) => error!("Reader task failed: {e}"),
        }
        if summary.sent != summary.received {
            warn!(
                "{} frames sent but {} received",
                summary.sent, summary.received
            );
        }
        print_summary(&summary);
        Ok::<(), anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use canbms_lib::codec;
    use canbms_lib::fault::Thresholds;
    use canbms_lib::transport::VirtualChannel;
    use std::time::Duration;

    #[test]
    fn simulated_values_come_from_samples() {
        let samples = [22.5, 65.5];
        let values = simulate_temperatures(&samples, 20);
        assert_eq!(values.len(), 20);
        assert!(values.iter().all(|v| samples.contains(v)));
        assert_eq!(simulate_temperatures(&[], 2), vec![25.0, 25.0]);
    }

    #[test]
    fn frames_encode_decicelsius() {
        let profile = Profile::thermal(&Thresholds::default()).unwrap();
        let frames = temperature_frames(&profile, &[22.5, -5.0]).unwrap();
        assert_eq!(frames[0].data(), &[0x00, 0xE1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(frames[1].data()[..2], [0xFF, 0xCE]);
        assert!(temperature_frames(&profile, &[4000.0]).is_err());
        let decoded = codec::decode(frames[1].data(), &codec::SignalSpec::decicelsius()).unwrap();
        assert_eq!(decoded, -5.0);
    }

    #[test]
    fn monitor_runs_on_virtual_bus() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("thermal.log");
        let channel = VirtualChannel::new("thermal");
        let options = ThermalOptions {
            config: ThermalConfig {
                count: 3,
                cadence: Duration::from_millis(5),
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
            frame_log: Some(log.clone()),
            mqtt_config: None,
        };
        let profile = Profile::thermal(&Thresholds::default()).unwrap();
        run(Box::new(channel.connect(true)), profile, options).unwrap();
        let content = std::fs::read_to_string(log).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.lines().all(|line| line.contains(" 200 [8] ")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interrupt_shuts_down_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("interrupted.log");
        let channel = VirtualChannel::new("interrupted");
        let profile = Profile::thermal(&Thresholds::default()).unwrap();
        let frames = temperature_frames(&profile, &[30.0; 100]).unwrap();
        let listeners: Vec<Box<dyn Listener>> = vec![Box::new(FrameLogger::open(&log).unwrap())];

        let mut monitor = Monitor::start(
            Box::new(channel.connect(true)),
            listeners,
            Duration::from_millis(5),
        );
        monitor.spawn_producer(frames, Duration::from_millis(20)).await;
        let summary = supervise(monitor, tokio::time::sleep(Duration::from_millis(70)))
            .await
            .unwrap();

        assert!(summary.sent > 0 && summary.sent < 100, "{}", summary.sent);
        assert_eq!(summary.received, summary.sent);
        let content = std::fs::read_to_string(log).unwrap();
        assert_eq!(content.lines().count(), summary.sent);
    }
}
