//! SDR Hardware Driver Boundary
//!
//! The vendor SDK is an external collaborator. The registry only talks to it
//! through [`SdrDriver`], so a real binding and the [`MockDriver`](crate::mock::MockDriver)
//! are interchangeable.
//!
//! Implementations do not need to be thread-safe internally beyond `Send + Sync`:
//! the registry never calls into the driver from two threads at once.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to an open physical device, issued by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Position of a device in the discovered device list when it was opened.
///
/// An open record keeps its index after other devices close and across
/// rediscovery; lookups by serial go through the identifier, not the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIndex(pub usize);

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sample direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Receive
    Rx,
    /// Transmit
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => f.write_str("RX"),
            Direction::Tx => f.write_str("TX"),
        }
    }
}

/// RF channel of a dual-channel transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Channel A (index 0)
    A,
    /// Channel B (index 1)
    B,
}

impl Channel {
    /// Both channels, in driver index order.
    pub const ALL: [Channel; 2] = [Channel::A, Channel::B];

    /// Driver channel index.
    pub fn index(self) -> usize {
        match self {
            Channel::A => 0,
            Channel::B => 1,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::A => f.write_str("A"),
            Channel::B => f.write_str("B"),
        }
    }
}

/// Primitives consumed from the vendor SDK.
///
/// Getters return the value the hardware actually settled on, which may differ
/// from the requested one.
pub trait SdrDriver: Send + Sync {
    /// List device identifier strings (typically an info string embedding the serial).
    fn enumerate(&self) -> Result<Vec<String>>;

    /// Open the device at `index` in the enumerated list.
    fn open(&self, index: usize) -> Result<DeviceHandle>;

    /// Close an open device.
    fn close(&self, handle: DeviceHandle) -> Result<()>;

    /// Set the sample rate for both directions with the given oversampling ratio (0 = driver default).
    fn set_sample_rate(&self, handle: DeviceHandle, rate_hz: f64, oversample: u32) -> Result<()>;

    /// Read back the host sample rate for one direction and channel.
    fn sample_rate(&self, handle: DeviceHandle, dir: Direction, ch: Channel) -> Result<f64>;

    /// Set the LO frequency.
    fn set_lo_frequency(&self, handle: DeviceHandle, dir: Direction, ch: Channel, hz: f64) -> Result<()>;

    /// Read back the LO frequency.
    fn lo_frequency(&self, handle: DeviceHandle, dir: Direction, ch: Channel) -> Result<f64>;

    /// Set the combined gain in dB.
    fn set_gain_db(&self, handle: DeviceHandle, dir: Direction, ch: Channel, gain_db: u32) -> Result<()>;

    /// Read back the combined gain in dB.
    fn gain_db(&self, handle: DeviceHandle, dir: Direction, ch: Channel) -> Result<u32>;

    /// Configure the analog low-pass filter bandwidth.
    fn set_lpf_bandwidth(&self, handle: DeviceHandle, dir: Direction, ch: Channel, hz: f64) -> Result<()>;

    /// Bypass the analog low-pass filter.
    fn bypass_lpf(&self, handle: DeviceHandle, dir: Direction, ch: Channel) -> Result<()>;

    /// Enable or disable the digital (GFIR) low-pass filter.
    fn set_gfir_lpf(
        &self,
        handle: DeviceHandle,
        dir: Direction,
        ch: Channel,
        enabled: bool,
        hz: f64,
    ) -> Result<()>;

    /// Set the NCO frequency. `None` disables the NCO.
    fn set_nco(&self, handle: DeviceHandle, dir: Direction, ch: Channel, hz: Option<f64>) -> Result<()>;

    /// Run on-chip calibration over the given bandwidth.
    fn calibrate(&self, handle: DeviceHandle, dir: Direction, ch: Channel, bandwidth_hz: f64) -> Result<()>;

    /// Select the antenna port by driver index.
    fn set_antenna(&self, handle: DeviceHandle, dir: Direction, ch: Channel, antenna: u32) -> Result<()>;

    /// Enable or disable a channel.
    fn enable_channel(&self, handle: DeviceHandle, dir: Direction, ch: Channel, enabled: bool) -> Result<()>;

    /// Enable or disable automatic DC offset correction.
    fn set_dc_correction(&self, handle: DeviceHandle, enabled: bool) -> Result<()>;
}
