#![cfg_attr(docsrs, feature(doc_cfg))]
//! # canbms_lib
//!
//! Signal codec and threshold based fault classification for a simulated
//! battery management system talking over CAN.
//!
//! Physical values are scaled into fixed width fields, rule groups decide
//! the fault code of each channel and declared frame layouts assemble both
//! into 8 byte CAN frames. Received frames go the other way and are handed
//! to listeners in registration order.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, everything the `canbms` command line tool needs.
//!
//! ### Transport Features
//! - `serialport`: Serial line CAN adapters through the `serialport` crate.
//! - `tokio-async`: The asynchronous [`monitor`] running listeners on `tokio` tasks.
//!
//! ### Utility Features
//! - `protocol_serde`: `serde` support for the data structures of the library.
//! - `bin-dependencies`: Enables all features required by the `canbms` binary executable.
//!
//! ## Example
//!
//! ```
//! use canbms_lib::fault::{Readings, Thresholds};
//! use canbms_lib::protocol::{Profile, VOLTAGE_FAULT_ID};
//!
//! let profile = Profile::overvoltage(&Thresholds::default()).unwrap();
//! let readings = Readings::from([("voltage".to_string(), 4.3)]);
//! let (report, frames) = profile.evaluate(&readings).unwrap();
//! assert!(report.has_fault());
//! assert_eq!(frames[0].id(), VOLTAGE_FAULT_ID);
//! assert_eq!(frames[0].data(), &[0x10, 0xCC, 0x01, 0, 0, 0, 0, 0]);
//! ```

/// Scaling of physical values into fixed width fields.
pub mod codec;
/// Contains error types for the library.
mod error;
/// Threshold rules and fault codes.
pub mod fault;
/// CAN frames and declared frame layouts.
pub mod frame;
/// Frame consumers.
pub mod listener;
/// Frame identifiers and the standard profiles.
pub mod protocol;
/// Test cases and their reports.
pub mod scenario;
/// Decoding received frames against a layout table.
pub mod schema;
/// Lawicel serial line CAN protocol.
pub mod slcan;
/// Bus abstraction, mock bus and in-process channel.
pub mod transport;

pub use error::{Error, TransportError};

/// Serial line CAN adapters.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous monitor on tokio.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-async")))]
#[cfg(feature = "tokio-async")]
pub mod monitor;
