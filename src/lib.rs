//! Shared SDR device registry.
//!
//! Lets independent source (RX) and sink (TX) processing blocks use the same
//! physical transceiver without stepping on each other:
//!
//! - each device is opened once, however many endpoints reference it
//! - one source and one sink may attach per device; mismatched chip modes or
//!   file backing are reported, not rejected
//! - every configuration call goes through a single re-entrant lock
//! - the device is closed exactly when its last endpoint detaches
//!
//! The vendor SDK sits behind [`SdrDriver`]; [`MockDriver`] simulates it.
//!
//! # Example
//!
//! ```
//! use sdr_registry::{Channel, ChipMode, DeviceRegistry, Endpoint, EndpointKind, MockDriver};
//! use std::sync::Arc;
//!
//! let driver = Arc::new(MockDriver::with_serials(["1D3AC"]));
//! let registry = Arc::new(DeviceRegistry::new(driver.clone()));
//!
//! let (rx, _) = Endpoint::connect(registry.clone(), "1D3AC", EndpointKind::Source, ChipMode::Mimo, None)?;
//! let (tx, report) = Endpoint::connect(registry.clone(), "1D3AC", EndpointKind::Sink, ChipMode::ChannelA, None)?;
//! assert_eq!(report.conflicts.len(), 1);
//!
//! rx.set_gain(Channel::A, 30)?;
//! drop(rx);
//! drop(tx);
//! assert_eq!(driver.open_count(0), 1);
//! assert_eq!(driver.close_count(0), 1);
//! # Ok::<(), sdr_registry::RegistryError>(())
//! ```

pub mod config;
pub mod configure;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod mock;
pub mod registry;

pub use config::{AppConfig, ChannelConfig, ConfigError, EndpointConfig};
pub use driver::{Channel, DeviceHandle, DeviceIndex, Direction, SdrDriver};
pub use endpoint::Endpoint;
pub use error::{RegistryError, RegistryResult};
pub use mock::MockDriver;
pub use registry::{
    AttachReport, Attachments, ChipMode, Conflict, DeviceRegistry, EndpointKind, RegistryLock,
    SessionId,
};
