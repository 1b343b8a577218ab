//! Error types for the device registry.
//!
//! `RegistryError` is the single error type returned by registry and endpoint
//! operations. Variants fall into two groups:
//!
//! - **Lifecycle errors** (`Discovery`, `DeviceNotFound`, `Open`,
//!   `IndexConflict`): raised while
//!   resolving or opening a device. When they come out of
//!   [`DeviceRegistry::open`](crate::registry::DeviceRegistry::open) every other
//!   open device has already been force-closed, because a failed open leaves the
//!   driver session in an unknown state.
//! - **Per-call errors** (`DeviceNotOpen`, `SessionEnded`, `DoubleAttach`,
//!   `Configuration`): local to one call. Attachment state is unchanged and the caller may retry.
//!
//! Source/sink configuration mismatches are not errors; they are reported as
//! [`Conflict`](crate::registry::Conflict) values in an attach report.
//!
//! Driver causes are carried as `anyhow::Error` through `#[source]` so the full
//! chain is preserved for logging.

use crate::driver::DeviceIndex;
use crate::registry::{EndpointKind, SessionId};
use thiserror::Error;

/// Convenience alias for results using the registry error type.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Errors raised by the device registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Device enumeration through the driver failed.
    #[error("Device discovery failed: {0}")]
    Discovery(#[source] anyhow::Error),

    /// No discovered device matched the selector.
    #[error("No device matching '{selector}' among {available} discovered device(s)")]
    DeviceNotFound {
        /// Selector passed to `open`.
        selector: String,
        /// Number of devices in the discovered list.
        available: usize,
    },

    /// The driver refused to open the device.
    #[error("Failed to open device {index}: {source}")]
    Open {
        /// Position of the device in the discovered list.
        index: DeviceIndex,
        /// Driver cause.
        #[source]
        source: anyhow::Error,
    },

    /// Rediscovery moved a different device onto the list position an open
    /// record is keyed by.
    #[error("Device {index} is open as '{open}'; cannot open '{requested}' at the same position")]
    IndexConflict {
        /// Contested list position.
        index: DeviceIndex,
        /// Identifier of the record holding the position.
        open: String,
        /// Identifier the selector resolved to.
        requested: String,
    },

    /// The referenced device has no open record (never opened, or already closed).
    #[error("Device {0} is not open")]
    DeviceNotOpen(DeviceIndex),

    /// The device was closed and opened again since the caller attached.
    #[error("Device {index} was reopened after {session}; reconnect the endpoint")]
    SessionEnded {
        /// Device the call targeted.
        index: DeviceIndex,
        /// Session the caller attached in.
        session: SessionId,
    },

    /// An endpoint of the same kind is already attached to the device.
    #[error("Only one {kind} endpoint is allowed per device; device {index} already has one")]
    DoubleAttach {
        /// Device the attach targeted.
        index: DeviceIndex,
        /// Endpoint kind that was attached twice.
        kind: EndpointKind,
    },

    /// A configuration call was rejected, either by range validation or by the driver.
    #[error("Failed to set {parameter} to {value} on device {index}: {source}")]
    Configuration {
        /// Device being configured.
        index: DeviceIndex,
        /// Parameter name (e.g. "gain", "rf_freq").
        parameter: &'static str,
        /// Requested value, rendered for diagnostics.
        value: String,
        /// Validation or driver cause.
        #[source]
        source: anyhow::Error,
    },
}

impl RegistryError {
    /// True for errors that were escalated with a defensive close-all.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            RegistryError::Discovery(_)
                | RegistryError::DeviceNotFound { .. }
                | RegistryError::Open { .. }
                | RegistryError::IndexConflict { .. }
        )
    }
}
