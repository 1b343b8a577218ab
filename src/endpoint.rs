//! Source/sink endpoint attachment.
//!
//! An [`Endpoint`] is what a processing block holds while it uses a device:
//! connecting opens and attaches, dropping detaches (and closes the device if
//! it was the last endpoint). Configuration helpers are bound to the
//! endpoint's direction, so a source only ever tunes the RX side.
//!
//! An endpoint is bound to the device session it attached in. If the device
//! is force-closed and reopened under it, its calls fail with
//! [`RegistryError::SessionEnded`](crate::error::RegistryError::SessionEnded)
//! and dropping it leaves the new session alone.

use crate::driver::{Channel, DeviceIndex, Direction};
use crate::error::RegistryResult;
use crate::registry::{
    AttachReport, ChipMode, Conflict, DeviceRegistry, EndpointKind, SessionId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// RAII attachment of one source or sink to a shared device.
#[derive(Debug)]
pub struct Endpoint {
    registry: Arc<DeviceRegistry>,
    index: DeviceIndex,
    session: SessionId,
    kind: EndpointKind,
    chip_mode: ChipMode,
    file: Option<PathBuf>,
}

impl Endpoint {
    /// Open the device matching `selector` and attach to it.
    ///
    /// The attach report carries any conflict with an endpoint already on the
    /// device; the caller decides whether that is fatal.
    pub fn connect(
        registry: Arc<DeviceRegistry>,
        selector: &str,
        kind: EndpointKind,
        chip_mode: ChipMode,
        file: Option<PathBuf>,
    ) -> RegistryResult<(Self, AttachReport)> {
        let report = registry.connect(selector, kind, chip_mode, file.clone())?;
        let endpoint = Self {
            registry,
            index: report.index,
            session: report.session,
            kind,
            chip_mode,
            file,
        };
        Ok((endpoint, report))
    }

    /// Device this endpoint is attached to.
    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    /// Device session the endpoint attached in.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Source or sink.
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Direction this endpoint configures.
    pub fn direction(&self) -> Direction {
        self.kind.direction()
    }

    /// Chip mode requested at connect time.
    pub fn chip_mode(&self) -> ChipMode {
        self.chip_mode
    }

    /// Replay/record file, if the endpoint is file backed.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Registry the endpoint is attached through.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Run `op` under the registry lock, provided the device is still in
    /// this endpoint's session.
    fn in_session<T>(
        &self,
        op: impl FnOnce(&DeviceRegistry) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let _lock = self.registry.lock();
        self.registry.ensure_session(self.index, self.session)?;
        op(self.registry.as_ref())
    }

    /// Enable the channels of this endpoint's chip mode.
    pub fn apply_chip_mode(&self) -> RegistryResult<Vec<Conflict>> {
        self.in_session(|registry| {
            registry.set_chip_mode(self.index, self.direction(), self.chip_mode)
        })
    }

    /// See [`DeviceRegistry::set_sample_rate`]. Affects both directions.
    pub fn set_sample_rate(&self, rate_hz: f64, oversample: u32) -> RegistryResult<f64> {
        self.in_session(|registry| registry.set_sample_rate(self.index, rate_hz, oversample))
    }

    /// See [`DeviceRegistry::set_oversampling`].
    pub fn set_oversampling(&self, oversample: u32) -> RegistryResult<()> {
        self.in_session(|registry| registry.set_oversampling(self.index, oversample))
    }

    /// Tune the LO of `ch`.
    pub fn set_rf_freq(&self, ch: Channel, hz: f64) -> RegistryResult<f64> {
        self.in_session(|registry| registry.set_rf_freq(self.index, self.direction(), ch, hz))
    }

    /// Set the gain of `ch`.
    pub fn set_gain(&self, ch: Channel, gain_db: u32) -> RegistryResult<u32> {
        self.in_session(|registry| registry.set_gain(self.index, self.direction(), ch, gain_db))
    }

    /// Configure the analog filter of `ch`.
    pub fn set_analog_filter(
        &self,
        ch: Channel,
        enabled: bool,
        bandwidth_hz: f64,
    ) -> RegistryResult<()> {
        self.in_session(|registry| {
            registry.set_analog_filter(self.index, self.direction(), ch, enabled, bandwidth_hz)
        })
    }

    /// Configure the digital filter of `ch`.
    pub fn set_digital_filter(
        &self,
        ch: Channel,
        enabled: bool,
        bandwidth_hz: f64,
    ) -> RegistryResult<()> {
        self.in_session(|registry| {
            registry.set_digital_filter(self.index, self.direction(), ch, enabled, bandwidth_hz)
        })
    }

    /// Set the NCO of `ch`.
    pub fn set_nco(&self, ch: Channel, hz: f64) -> RegistryResult<()> {
        self.in_session(|registry| registry.set_nco(self.index, self.direction(), ch, hz))
    }

    /// Calibrate `ch`.
    pub fn calibrate(&self, ch: Channel, bandwidth_hz: f64) -> RegistryResult<()> {
        self.in_session(|registry| {
            registry.calibrate(self.index, self.direction(), ch, bandwidth_hz)
        })
    }

    /// Select the antenna of `ch`.
    pub fn set_antenna(&self, ch: Channel, antenna: u32) -> RegistryResult<()> {
        self.in_session(|registry| registry.set_antenna(self.index, self.direction(), ch, antenna))
    }

    /// Turn off automatic DC correction on the device.
    pub fn disable_dc_corrections(&self) -> RegistryResult<()> {
        self.in_session(|registry| registry.disable_dc_corrections(self.index))
    }

    /// Detach now instead of at drop.
    pub fn disconnect(self) {
        // Drop does the work
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        debug!(
            device = %self.index,
            kind = %self.kind,
            session = %self.session,
            "Releasing endpoint"
        );
        self.registry.detach(self.index, self.session, self.kind);
    }
}
