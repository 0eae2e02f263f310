/// Errors raised by the codec, classifier, assembler and dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The scaled value does not fit the field width and signedness.
    #[error("Value {value} out of range for {width} byte {signedness} field at scale {scale}")]
    Range {
        value: f64,
        scale: u32,
        width: usize,
        signedness: &'static str,
    },
    /// Assembled fields are wider than the frame.
    #[error("Fields need {required} bytes but the frame holds {available}")]
    Overflow { required: usize, available: usize },
    /// A rule or layout references a signal that was not provided.
    #[error("Signal '{0}' is missing")]
    MissingSignal(String),
    /// A layout references a fault group that was not classified.
    #[error("Fault group '{0}' is missing")]
    MissingGroup(String),
    /// Not enough bytes to decode a field.
    #[error("Field needs {expected} bytes, got {actual}")]
    FieldLength { expected: usize, actual: usize },
    /// Identifier does not fit into an 11 bit CAN identifier.
    #[error("Invalid CAN identifier 0x{0:X}")]
    InvalidId(u32),
    /// A layout was declared twice for the same identifier.
    #[error("Layout for 0x{0:03X} declared twice")]
    DuplicateLayout(u16),
    /// No layout is declared for the identifier.
    #[error("No layout declared for 0x{0:03X}")]
    UnknownFrame(u16),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The bus has been shut down.
    #[error("Bus is closed")]
    Closed,
    /// The adapter did not answer in time.
    #[error("Bus operation timed out")]
    Timeout,
    /// The adapter sent something that could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}
