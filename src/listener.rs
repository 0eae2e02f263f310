//! Frame consumers and the ordered fan-out to them.
//!
//! Listeners are called in registration order. A listener that fails is
//! logged and reported, the remaining listeners still get the frame.

use crate::frame::Frame;
use crate::protocol::{fault_label, Profile};
use crate::Error;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait Listener: Send {
    fn name(&self) -> &str;

    fn handle(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Called once when no more frames will be delivered.
    fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct ListenerFailure {
    pub listener: String,
    pub frame_id: Option<u16>,
    pub error: Error,
}

/// Delivers `frame` to every listener in order and collects their failures.
pub fn dispatch(frame: &Frame, listeners: &mut [Box<dyn Listener>]) -> Vec<ListenerFailure> {
    let mut failures = Vec::new();
    for listener in listeners.iter_mut() {
        if let Err(error) = listener.handle(frame) {
            log::error!(
                "Listener '{}' failed on 0x{:03X}: {error}",
                listener.name(),
                frame.id()
            );
            failures.push(ListenerFailure {
                listener: listener.name().to_string(),
                frame_id: Some(frame.id()),
                error,
            });
        }
    }
    failures
}

/// Synchronous fan-out over a fixed listener list.
#[derive(Default)]
pub struct Notifier {
    listeners: Vec<Box<dyn Listener>>,
}

impl Notifier {
    pub fn new(listeners: Vec<Box<dyn Listener>>) -> Self {
        Self { listeners }
    }

    pub fn add(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn names(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.name()).collect()
    }

    pub fn dispatch(&mut self, frame: &Frame) -> Vec<ListenerFailure> {
        dispatch(frame, &mut self.listeners)
    }

    /// Stops every listener; one failing stop does not skip the others.
    pub fn stop(&mut self) -> Vec<ListenerFailure> {
        let mut failures = Vec::new();
        for listener in self.listeners.iter_mut() {
            if let Err(error) = listener.stop() {
                log::error!("Listener '{}' failed to stop: {error}", listener.name());
                failures.push(ListenerFailure {
                    listener: listener.name().to_string(),
                    frame_id: None,
                    error,
                });
            }
        }
        failures
    }
}

/// Prints decoded and classified frames and forwards them to the log.
pub struct ConsoleReporter<W> {
    profile: Arc<Profile>,
    out: W,
}

impl ConsoleReporter<std::io::Stdout> {
    pub fn stdout(profile: Arc<Profile>) -> Self {
        Self::new(profile, std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn new(profile: Arc<Profile>, out: W) -> Self {
        Self { profile, out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Listener for ConsoleReporter<W> {
    fn name(&self) -> &str {
        "console"
    }

    fn handle(&mut self, frame: &Frame) -> Result<(), Error> {
        let (decoded, report) = match self.profile.inspect(frame) {
            Ok(inspected) => inspected,
            Err(err) => {
                log::warn!("Cannot decode 0x{:03X}: {err}", frame.id());
                writeln!(self.out, "Received {frame}")?;
                return Ok(());
            }
        };

        let mut values: Vec<String> = decoded
            .readings
            .iter()
            .map(|(name, value)| format!("{name}={value:.3}"))
            .collect();
        values.sort();
        values.extend(
            decoded
                .fault_codes
                .iter()
                .map(|(group, code)| format!("{group}_fault=0x{code:02X}")),
        );
        writeln!(
            self.out,
            "Received 0x{:03X}: {}",
            frame.id(),
            values.join(" ")
        )?;

        for (group, fault) in report.iter() {
            if fault.is_fault() {
                let warning = format!("[{}] {group} fault: {fault}", fault_label(fault.kind));
                writeln!(self.out, "{warning}")?;
                log::warn!("{warning}");
            } else {
                log::info!("0x{:03X} {group} OK ({})", frame.id(), values.join(" "));
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.out.flush()?;
        Ok(())
    }
}

/// Appends every frame with a timestamp to a capture file.
pub struct FrameLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FrameLogger {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log::debug!("Logging frames to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Listener for FrameLogger {
    fn name(&self) -> &str {
        "frame-logger"
    }

    fn handle(&mut self, frame: &Frame) -> Result<(), Error> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(self.writer, "{timestamp} {frame}")?;
        self.writer.flush()?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::Thresholds;
    use crate::protocol::CELL_TEMPERATURE_ID;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        seen: Arc<Mutex<Vec<(String, u16)>>>,
    }

    impl Listener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle(&mut self, frame: &Frame) -> Result<(), Error> {
            self.seen
                .lock()
                .unwrap()
                .push((self.name.clone(), frame.id()));
            Ok(())
        }
    }

    struct Broken;

    impl Listener for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn handle(&mut self, _frame: &Frame) -> Result<(), Error> {
            Err(Error::Io(std::io::Error::other("disk full")))
        }

        fn stop(&mut self) -> Result<(), Error> {
            Err(Error::Io(std::io::Error::other("disk full")))
        }
    }

    fn recorder(name: &str, seen: &Arc<Mutex<Vec<(String, u16)>>>) -> Box<dyn Listener> {
        Box::new(Recorder {
            name: name.to_string(),
            seen: seen.clone(),
        })
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = Notifier::new(vec![
            recorder("first", &seen),
            Box::new(Broken),
            recorder("last", &seen),
        ]);
        assert_eq!(notifier.names(), vec!["first", "broken", "last"]);

        for id in [0x101, 0x102] {
            let failures = notifier.dispatch(&Frame::new(id, &[]).unwrap());
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].listener, "broken");
            assert_eq!(failures[0].frame_id, Some(id));
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("first".to_string(), 0x101),
                ("last".to_string(), 0x101),
                ("first".to_string(), 0x102),
                ("last".to_string(), 0x102),
            ]
        );

        let failures = notifier.stop();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].frame_id, None);
    }

    #[test]
    fn console_reporter_prints_faults() {
        let profile = Arc::new(Profile::thermal(&Thresholds::default()).unwrap());
        let mut reporter = ConsoleReporter::new(profile, Vec::new());
        reporter
            .handle(&Frame::new(CELL_TEMPERATURE_ID, &[0x02, 0x8F, 0, 0, 0, 0, 0, 0]).unwrap())
            .unwrap();
        reporter
            .handle(&Frame::new(CELL_TEMPERATURE_ID, &[0x00, 0xE1, 0, 0, 0, 0, 0, 0]).unwrap())
            .unwrap();
        reporter.handle(&Frame::new(0x555, &[1]).unwrap()).unwrap();

        let output = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "Received 0x200: temperature=65.500");
        assert_eq!(lines[1], "[OT] thermal fault: Overtemperature: temperature=65.5");
        assert_eq!(lines[2], "Received 0x200: temperature=22.500");
        assert_eq!(lines[3], "Received 555 [1] 01");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn frame_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("capture.log");
        let mut logger = FrameLogger::open(&path).unwrap();
        logger.handle(&Frame::new(0x123, &[0x0E, 0x88]).unwrap()).unwrap();
        logger.handle(&Frame::new(0x201, &[0x01]).unwrap()).unwrap();
        logger.stop().unwrap();
        drop(logger);

        let mut reopened = FrameLogger::open(&path).unwrap();
        reopened.handle(&Frame::new(0x202, &[0x02]).unwrap()).unwrap();
        drop(reopened);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" 123 [2] 0E 88"));
        assert!(lines[1].ends_with(" 201 [1] 01"));
        assert!(lines[2].ends_with(" 202 [1] 02"));
    }
}
