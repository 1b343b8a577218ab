//! Shared Device Registry
//!
//! Opens each physical SDR at most once and lets one source (RX) endpoint and
//! one sink (TX) endpoint share it.
//!
//! # Design
//!
//! The driver's thread-safety is not assumed, so every registry operation runs
//! under one process-wide re-entrant lock:
//!
//! - discovery, open, attach, detach and close-all are critical sections
//! - every configuration call is delegated to the driver while the lock is held,
//!   so two devices being configured from two threads still take turns
//! - internal helpers (`close_all` from a failed `open`, `discover` from `open`)
//!   re-enter the lock they already hold
//!
//! Interior state lives in a `RefCell` inside the lock. A `RefCell` borrow is
//! never held across a call that may re-enter the registry.
//!
//! # Lifecycle
//!
//! ```text
//! Unopened -> Open(0) -> Open(1) -> Open(2) -> Open(1) -> Closed
//! ```
//!
//! `Closed` means the record is gone. The physical handle is closed the moment
//! the last endpoint detaches.
//!
//! Records are keyed by the identifier the device was discovered under. Every
//! physical open starts a new [`SessionId`]; attachments carry it, and a detach
//! or endpoint call from an earlier session of the same device is ignored or
//! rejected instead of touching the current one.
//!
//! # Example
//!
//! ```
//! use sdr_registry::{ChipMode, DeviceRegistry, EndpointKind, MockDriver};
//! use std::sync::Arc;
//!
//! let driver = Arc::new(MockDriver::with_serials(["1D3AC"]));
//! let registry = DeviceRegistry::new(driver.clone());
//!
//! let index = registry.open("1D3AC")?;
//! let report = registry.attach(index, EndpointKind::Source, ChipMode::ChannelA, None)?;
//! assert!(report.is_clean());
//! registry.detach(index, report.session, EndpointKind::Source);
//!
//! assert_eq!(driver.close_count(0), 1);
//! # Ok::<(), sdr_registry::RegistryError>(())
//! ```

use crate::driver::{DeviceHandle, DeviceIndex, Direction, SdrDriver};
use crate::error::{RegistryError, RegistryResult};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Kind of logical endpoint attached to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// Receiving block
    Source,
    /// Transmitting block
    Sink,
}

impl EndpointKind {
    /// Sample direction served by this kind.
    pub fn direction(self) -> Direction {
        match self {
            EndpointKind::Source => Direction::Rx,
            EndpointKind::Sink => Direction::Tx,
        }
    }

    /// Kind that serves the given direction.
    pub fn for_direction(dir: Direction) -> Self {
        match dir {
            Direction::Rx => EndpointKind::Source,
            Direction::Tx => EndpointKind::Sink,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Source => f.write_str("source"),
            EndpointKind::Sink => f.write_str("sink"),
        }
    }
}

/// Channel configuration requested by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipMode {
    /// Single channel, A
    ChannelA,
    /// Single channel, B
    ChannelB,
    /// Both channels
    Mimo,
}

impl ChipMode {
    /// Channels that are enabled in this mode.
    pub fn channels(self) -> &'static [crate::driver::Channel] {
        use crate::driver::Channel;
        match self {
            ChipMode::ChannelA => &[Channel::A],
            ChipMode::ChannelB => &[Channel::B],
            ChipMode::Mimo => &Channel::ALL,
        }
    }

    /// Whether `ch` is active in this mode.
    pub fn uses(self, ch: crate::driver::Channel) -> bool {
        self.channels().contains(&ch)
    }
}

impl fmt::Display for ChipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipMode::ChannelA => f.write_str("SISO channel A"),
            ChipMode::ChannelB => f.write_str("SISO channel B"),
            ChipMode::Mimo => f.write_str("MIMO"),
        }
    }
}

/// Non-fatal disagreement between the source and sink sharing a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Source and sink asked for different chip modes.
    ChipMode {
        /// Mode of the source endpoint
        source: Option<ChipMode>,
        /// Mode of the sink endpoint
        sink: Option<ChipMode>,
    },
    /// Source and sink disagree on file backing.
    FileBacking {
        /// Source file, if any
        source: Option<PathBuf>,
        /// Sink file, if any
        sink: Option<PathBuf>,
    },
}

fn fmt_mode(mode: &Option<ChipMode>) -> String {
    mode.map_or_else(|| "unset".to_string(), |m| m.to_string())
}

fn fmt_file(file: &Option<PathBuf>) -> String {
    file.as_deref()
        .map_or_else(|| "live".to_string(), |p| p.display().to_string())
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::ChipMode { source, sink } => write!(
                f,
                "chip mode mismatch (source: {}, sink: {})",
                fmt_mode(source),
                fmt_mode(sink)
            ),
            Conflict::FileBacking { source, sink } => write!(
                f,
                "file backing mismatch (source: {}, sink: {})",
                fmt_file(source),
                fmt_file(sink)
            ),
        }
    }
}

/// Outcome of a successful attach.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct AttachReport {
    /// Device the endpoint attached to
    pub index: DeviceIndex,
    /// Kind that was attached
    pub kind: EndpointKind,
    /// Session of the device the endpoint attached to
    pub session: SessionId,
    /// Diagnostics raised against the other endpoint on the same device
    pub conflicts: Vec<Conflict>,
}

impl AttachReport {
    /// True if no conflict was detected.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// One physical open of a device.
///
/// Issued from a registry-wide counter, so a device that is closed and opened
/// again never reuses an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// Which endpoint kinds are attached to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attachments {
    /// Source endpoint attached
    pub source: bool,
    /// Sink endpoint attached
    pub sink: bool,
}

impl Attachments {
    /// Number of attached endpoints (0, 1 or 2).
    pub fn count(&self) -> usize {
        usize::from(self.source) + usize::from(self.sink)
    }
}

/// Per-kind attachment slot.
#[derive(Debug, Clone, Default)]
struct Slot {
    attached: bool,
    chip_mode: Option<ChipMode>,
    file: Option<PathBuf>,
}

/// One physically open device.
#[derive(Debug)]
struct DeviceRecord {
    index: DeviceIndex,
    identifier: String,
    handle: DeviceHandle,
    session: SessionId,
    source: Slot,
    sink: Slot,
}

impl DeviceRecord {
    fn new(index: DeviceIndex, identifier: String, handle: DeviceHandle, session: SessionId) -> Self {
        Self {
            index,
            identifier,
            handle,
            session,
            source: Slot::default(),
            sink: Slot::default(),
        }
    }

    fn slot(&self, kind: EndpointKind) -> &Slot {
        match kind {
            EndpointKind::Source => &self.source,
            EndpointKind::Sink => &self.sink,
        }
    }

    fn slot_mut(&mut self, kind: EndpointKind) -> &mut Slot {
        match kind {
            EndpointKind::Source => &mut self.source,
            EndpointKind::Sink => &mut self.sink,
        }
    }

    fn attachments(&self) -> Attachments {
        Attachments {
            source: self.source.attached,
            sink: self.sink.attached,
        }
    }

    /// Compare source and sink settings once both are attached.
    fn conflicts(&self) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        if !(self.source.attached && self.sink.attached) {
            return conflicts;
        }
        if self.source.chip_mode != self.sink.chip_mode {
            conflicts.push(Conflict::ChipMode {
                source: self.source.chip_mode,
                sink: self.sink.chip_mode,
            });
        }
        if self.source.file != self.sink.file {
            conflicts.push(Conflict::FileBacking {
                source: self.source.file.clone(),
                sink: self.sink.file.clone(),
            });
        }
        conflicts
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Open devices, in open order
    records: Vec<DeviceRecord>,
    /// Cached enumeration result
    discovered: Option<Vec<String>>,
    /// Set once close-all has run; cleared by the next physical open
    teardown_done: bool,
    /// Last session id handed out
    last_session: u64,
}

impl RegistryState {
    fn position(&self, index: DeviceIndex) -> Option<usize> {
        self.records.iter().position(|r| r.index == index)
    }

    fn find(&self, index: DeviceIndex) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| r.index == index)
    }

    fn find_mut(&mut self, index: DeviceIndex) -> Option<&mut DeviceRecord> {
        self.records.iter_mut().find(|r| r.index == index)
    }

    fn find_by_identifier(&self, identifier: &str) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| r.identifier == identifier)
    }

    fn next_session(&mut self) -> SessionId {
        self.last_session += 1;
        SessionId(self.last_session)
    }
}

/// Pick the discovered device a selector refers to.
///
/// An empty selector picks the first device. Otherwise the first identifier
/// containing the selector wins, since serials are embedded in the driver's
/// info strings.
fn resolve_selector(discovered: &[String], selector: &str) -> Option<usize> {
    if selector.is_empty() {
        return if discovered.is_empty() { None } else { Some(0) };
    }
    discovered.iter().position(|id| id.contains(selector))
}

/// Registry of physically open SDR devices shared by source and sink endpoints.
///
/// Construct one per process at the composition root and hand it to endpoints
/// as `Arc<DeviceRegistry>`.
pub struct DeviceRegistry {
    driver: Arc<dyn SdrDriver>,
    state: ReentrantMutex<RefCell<RegistryState>>,
}

impl DeviceRegistry {
    /// Create an empty registry on top of a driver.
    pub fn new(driver: Arc<dyn SdrDriver>) -> Self {
        Self {
            driver,
            state: ReentrantMutex::new(RefCell::new(RegistryState::default())),
        }
    }

    /// Hold the registry lock across several calls.
    ///
    /// Every registry method takes the same lock, so calls made while the
    /// returned guard is alive (from this thread) form one atomic sequence.
    pub fn lock(&self) -> RegistryLock<'_> {
        RegistryLock {
            _guard: self.state.lock(),
        }
    }

    /// List available devices, enumerating through the driver on first use.
    ///
    /// The result is cached until [`invalidate_discovery`](Self::invalidate_discovery).
    pub fn discover(&self) -> RegistryResult<Vec<String>> {
        let guard = self.state.lock();
        if let Some(list) = guard.borrow().discovered.as_ref() {
            trace!(count = list.len(), "Using cached device list");
            return Ok(list.clone());
        }

        let list = self.driver.enumerate().map_err(RegistryError::Discovery)?;
        info!(count = list.len(), "Discovered devices");
        for (i, id) in list.iter().enumerate() {
            debug!(index = i, device = %id, "Discovered device");
        }
        guard.borrow_mut().discovered = Some(list.clone());
        Ok(list)
    }

    /// Drop the cached device list so the next discovery queries the driver again.
    ///
    /// Open records keep their indices; only call this when no endpoint holds
    /// an index from the previous list.
    pub fn invalidate_discovery(&self) {
        let guard = self.state.lock();
        guard.borrow_mut().discovered = None;
        debug!("Device list cache invalidated");
    }

    /// Resolve `selector` to a device and make sure it is open.
    ///
    /// Returns the existing record when the device is already open. Any failure
    /// force-closes every open device before the error is returned.
    pub fn open(&self, selector: &str) -> RegistryResult<DeviceIndex> {
        let _guard = self.state.lock();
        match self.open_locked(selector) {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!(selector, error = %e, "Open failed, closing all devices");
                self.close_all();
                Err(e)
            }
        }
    }

    fn open_locked(&self, selector: &str) -> RegistryResult<DeviceIndex> {
        let discovered = self.discover()?;
        if selector.is_empty() {
            info!("No serial given, using first device in the list");
        }
        let position =
            resolve_selector(&discovered, selector).ok_or_else(|| RegistryError::DeviceNotFound {
                selector: selector.to_string(),
                available: discovered.len(),
            })?;
        let index = DeviceIndex(position);
        let identifier = discovered[position].clone();

        let guard = self.state.lock();
        if let Some(existing) = guard.borrow().find_by_identifier(&identifier) {
            debug!(device = %existing.index, id = %identifier, "Reusing previously opened device");
            return Ok(existing.index);
        }
        if let Some(held) = guard.borrow().find(index) {
            return Err(RegistryError::IndexConflict {
                index,
                open: held.identifier.clone(),
                requested: identifier,
            });
        }

        let handle = self
            .driver
            .open(position)
            .map_err(|source| RegistryError::Open { index, source })?;

        let mut state = guard.borrow_mut();
        let session = state.next_session();
        info!(device = %index, id = %identifier, %session, "Connected to device");
        state
            .records
            .push(DeviceRecord::new(index, identifier, handle, session));
        state.teardown_done = false;
        Ok(index)
    }

    /// Register an endpoint on an open device.
    ///
    /// Chip-mode and file-backing mismatches with the other endpoint are
    /// reported in the returned [`AttachReport`] and logged; they do not fail
    /// the attach.
    pub fn attach(
        &self,
        index: DeviceIndex,
        kind: EndpointKind,
        chip_mode: ChipMode,
        file: Option<PathBuf>,
    ) -> RegistryResult<AttachReport> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let record = state
            .find_mut(index)
            .ok_or(RegistryError::DeviceNotOpen(index))?;

        let slot = record.slot_mut(kind);
        if slot.attached {
            return Err(RegistryError::DoubleAttach { index, kind });
        }
        *slot = Slot {
            attached: true,
            chip_mode: Some(chip_mode),
            file,
        };

        let conflicts = record.conflicts();
        for conflict in &conflicts {
            warn!(device = %index, %conflict, "Source and sink disagree on shared device");
        }
        debug!(
            device = %index,
            %kind,
            mode = %chip_mode,
            endpoints = record.attachments().count(),
            "Endpoint attached"
        );

        Ok(AttachReport {
            index,
            kind,
            session: record.session,
            conflicts,
        })
    }

    /// Open and attach as one step.
    ///
    /// If the attach fails and nothing else is attached to the device, the
    /// device is closed again.
    pub fn connect(
        &self,
        selector: &str,
        kind: EndpointKind,
        chip_mode: ChipMode,
        file: Option<PathBuf>,
    ) -> RegistryResult<AttachReport> {
        let _guard = self.state.lock();
        let index = self.open(selector)?;
        self.attach(index, kind, chip_mode, file).inspect_err(|_| {
            self.release_if_idle(index);
        })
    }

    /// Remove an endpoint. Closes the device when it was the last one.
    ///
    /// `session` is the one from the endpoint's [`AttachReport`]. Detaching a
    /// kind that is not attached, a device that is not open, or a session the
    /// device has since been reopened past, does nothing.
    pub fn detach(&self, index: DeviceIndex, session: SessionId, kind: EndpointKind) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(position) = state.position(index) else {
            debug!(device = %index, %kind, "Detach on closed device ignored");
            return;
        };

        let record = &mut state.records[position];
        if record.session != session {
            debug!(
                device = %index,
                %kind,
                stale = %session,
                current = %record.session,
                "Detach from an earlier session ignored"
            );
            return;
        }
        let slot = record.slot_mut(kind);
        if !slot.attached {
            debug!(device = %index, %kind, "Detach of unattached endpoint ignored");
            return;
        }
        *slot = Slot::default();

        let remaining = record.attachments().count();
        debug!(device = %index, %kind, remaining, "Endpoint detached");
        if remaining > 0 {
            return;
        }

        let record = state.records.remove(position);
        drop(state);
        self.close_record(&record);
    }

    /// Close a device that has no endpoints attached.
    pub(crate) fn release_if_idle(&self, index: DeviceIndex) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(position) = state.position(index) else {
            return;
        };
        if state.records[position].attachments().count() > 0 {
            return;
        }
        let record = state.records.remove(position);
        drop(state);
        self.close_record(&record);
    }

    /// Force-close every open device and empty the registry.
    ///
    /// Runs at most once until a device is opened again; repeated calls are no-ops.
    pub fn close_all(&self) {
        let guard = self.state.lock();
        let records = {
            let mut state = guard.borrow_mut();
            if state.teardown_done {
                trace!("Close-all already done");
                return;
            }
            state.teardown_done = true;
            std::mem::take(&mut state.records)
        };

        if !records.is_empty() {
            warn!(count = records.len(), "Force-closing all open devices");
        }
        for record in &records {
            self.close_record(record);
        }
    }

    /// Orderly teardown at process exit.
    pub fn shutdown(&self) {
        info!("Shutting down device registry");
        self.close_all();
    }

    fn close_record(&self, record: &DeviceRecord) {
        match self.driver.close(record.handle) {
            Ok(()) => info!(device = %record.index, "Disconnected from device"),
            Err(e) => error!(device = %record.index, error = %e, "Failed to close device"),
        }
    }

    /// Run a driver call against an open device under the registry lock.
    ///
    /// `parameter` and `value` describe the call for logs and for the
    /// [`RegistryError::Configuration`] raised when `op` fails. The device
    /// stays open and attached on failure.
    pub fn configure<T>(
        &self,
        index: DeviceIndex,
        parameter: &'static str,
        value: impl fmt::Display,
        op: impl FnOnce(&dyn SdrDriver, DeviceHandle) -> anyhow::Result<T>,
    ) -> RegistryResult<T> {
        let guard = self.state.lock();
        let handle = guard
            .borrow()
            .find(index)
            .map(|r| r.handle)
            .ok_or(RegistryError::DeviceNotOpen(index))?;

        let value = value.to_string();
        debug!(device = %index, parameter, %value, "Configuring device");
        op(self.driver.as_ref(), handle).map_err(|source| {
            error!(device = %index, parameter, %value, error = %source, "Configuration failed");
            RegistryError::Configuration {
                index,
                parameter,
                value,
                source,
            }
        })
    }

    /// Update the recorded chip mode of an attached endpoint.
    ///
    /// Returns any conflict the new mode creates with the other endpoint.
    pub(crate) fn record_chip_mode(
        &self,
        index: DeviceIndex,
        kind: EndpointKind,
        mode: ChipMode,
    ) -> Vec<Conflict> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let Some(record) = state.find_mut(index) else {
            return Vec::new();
        };
        let slot = record.slot_mut(kind);
        if !slot.attached {
            return Vec::new();
        }
        slot.chip_mode = Some(mode);
        let conflicts = record.conflicts();
        for conflict in &conflicts {
            warn!(device = %index, %conflict, "Source and sink disagree on shared device");
        }
        conflicts
    }

    /// Check that `index` is still open in `session`.
    ///
    /// Hold [`lock`](Self::lock) across this check and the calls it guards.
    pub fn ensure_session(&self, index: DeviceIndex, session: SessionId) -> RegistryResult<()> {
        let guard = self.state.lock();
        let current = guard
            .borrow()
            .find(index)
            .map(|r| r.session)
            .ok_or(RegistryError::DeviceNotOpen(index))?;
        if current != session {
            return Err(RegistryError::SessionEnded { index, session });
        }
        Ok(())
    }

    /// Current session of an open device.
    pub fn session(&self, index: DeviceIndex) -> Option<SessionId> {
        let guard = self.state.lock();
        let session = guard.borrow().find(index).map(|r| r.session);
        session
    }

    /// Number of open devices.
    pub fn record_count(&self) -> usize {
        let guard = self.state.lock();
        let count = guard.borrow().records.len();
        count
    }

    /// Whether a record exists for `index`.
    pub fn is_open(&self, index: DeviceIndex) -> bool {
        let guard = self.state.lock();
        let open = guard.borrow().find(index).is_some();
        open
    }

    /// Attached endpoints of an open device.
    pub fn attachments(&self, index: DeviceIndex) -> Option<Attachments> {
        let guard = self.state.lock();
        let attachments = guard.borrow().find(index).map(DeviceRecord::attachments);
        attachments
    }

    /// Chip mode recorded for an attached endpoint.
    pub fn chip_mode(&self, index: DeviceIndex, kind: EndpointKind) -> Option<ChipMode> {
        let guard = self.state.lock();
        let mode = guard
            .borrow()
            .find(index)
            .and_then(|r| r.slot(kind).chip_mode);
        mode
    }

    /// File backing recorded for an attached endpoint.
    pub fn file_backing(&self, index: DeviceIndex, kind: EndpointKind) -> Option<PathBuf> {
        let guard = self.state.lock();
        let file = guard
            .borrow()
            .find(index)
            .and_then(|r| r.slot(kind).file.as_deref().map(Path::to_path_buf));
        file
    }

    /// Identifier string the device was discovered under.
    pub fn identifier(&self, index: DeviceIndex) -> Option<String> {
        let guard = self.state.lock();
        let id = guard.borrow().find(index).map(|r| r.identifier.clone());
        id
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(guard) = self.state.try_lock() else {
            return f.write_str("DeviceRegistry { <locked> }");
        };
        let Ok(state) = guard.try_borrow() else {
            return f.write_str("DeviceRegistry { <in use> }");
        };
        let result = f
            .debug_struct("DeviceRegistry")
            .field("records", &state.records)
            .field("discovered", &state.discovered)
            .finish();
        result
    }
}

/// Scoped hold on the registry lock, see [`DeviceRegistry::lock`].
#[must_use = "the lock is released when the guard is dropped"]
pub struct RegistryLock<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<RegistryState>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use tracing_test::traced_test;

    fn registry_with(serials: &[&str]) -> (Arc<MockDriver>, DeviceRegistry) {
        let driver = Arc::new(MockDriver::with_serials(serials.iter().copied()));
        let registry = DeviceRegistry::new(driver.clone());
        (driver, registry)
    }

    #[test]
    fn test_resolve_selector() {
        let list = vec![
            "SDR, serial=1D3AC".to_string(),
            "SDR, serial=AABB01".to_string(),
        ];
        assert_eq!(resolve_selector(&list, ""), Some(0));
        assert_eq!(resolve_selector(&list, "AABB"), Some(1));
        assert_eq!(resolve_selector(&list, "FFFF"), None);
        assert_eq!(resolve_selector(&[], ""), None);
    }

    #[test]
    fn test_discovery_is_cached() {
        let (driver, registry) = registry_with(&["1D3AC", "AABB"]);
        let first = registry.discover().unwrap();
        let second = registry.discover().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(driver.enumerate_count(), 1);
    }

    #[test]
    fn test_invalidate_discovery_requeries_driver() {
        let (driver, registry) = registry_with(&["1D3AC"]);
        registry.discover().unwrap();
        registry.invalidate_discovery();
        registry.discover().unwrap();
        assert_eq!(driver.enumerate_count(), 2);
    }

    #[test]
    fn test_discovery_failure_is_not_cached() {
        let (driver, registry) = registry_with(&["1D3AC"]);
        driver.fail_enumerate(true);
        assert!(matches!(
            registry.discover(),
            Err(RegistryError::Discovery(_))
        ));
        driver.fail_enumerate(false);
        assert_eq!(registry.discover().unwrap().len(), 1);
    }

    #[test]
    fn test_open_reuses_record() {
        let (driver, registry) = registry_with(&["AABB"]);
        let a = registry.open("AABB").unwrap();
        let b = registry.open("AABB").unwrap();
        assert_eq!(a, b);
        assert_eq!(driver.open_count(0), 1);
        assert_eq!(registry.record_count(), 1);
    }

    #[test]
    fn test_open_empty_selector_uses_first_device() {
        let (_driver, registry) = registry_with(&["1D3AC", "AABB"]);
        assert_eq!(registry.open("").unwrap(), DeviceIndex(0));
    }

    #[test]
    fn test_attach_sets_bookkeeping() {
        let (_driver, registry) = registry_with(&["AABB"]);
        let index = registry.open("AABB").unwrap();
        let report = registry
            .attach(index, EndpointKind::Sink, ChipMode::Mimo, Some("tx.bin".into()))
            .unwrap();
        assert!(report.is_clean());
        assert_eq!(
            registry.attachments(index),
            Some(Attachments {
                source: false,
                sink: true
            })
        );
        assert_eq!(registry.chip_mode(index, EndpointKind::Sink), Some(ChipMode::Mimo));
        assert_eq!(registry.chip_mode(index, EndpointKind::Source), None);
        assert_eq!(
            registry.file_backing(index, EndpointKind::Sink),
            Some(PathBuf::from("tx.bin"))
        );
    }

    #[test]
    fn test_attach_to_unopened_device() {
        let (_driver, registry) = registry_with(&["AABB"]);
        let result = registry.attach(DeviceIndex(0), EndpointKind::Source, ChipMode::ChannelA, None);
        assert!(matches!(result, Err(RegistryError::DeviceNotOpen(_))));
    }

    #[test]
    fn test_double_attach_leaves_state_unchanged() {
        let (_driver, registry) = registry_with(&["AABB"]);
        let index = registry.open("AABB").unwrap();
        let _ = registry
            .attach(index, EndpointKind::Source, ChipMode::ChannelA, None)
            .unwrap();
        let result = registry.attach(index, EndpointKind::Source, ChipMode::Mimo, None);
        assert!(matches!(
            result,
            Err(RegistryError::DoubleAttach {
                kind: EndpointKind::Source,
                ..
            })
        ));
        assert_eq!(registry.attachments(index).unwrap().count(), 1);
        assert_eq!(
            registry.chip_mode(index, EndpointKind::Source),
            Some(ChipMode::ChannelA)
        );
    }

    #[test]
    fn test_file_backing_conflict() {
        let (_driver, registry) = registry_with(&["AABB"]);
        let index = registry.open("AABB").unwrap();
        let _ = registry
            .attach(index, EndpointKind::Source, ChipMode::Mimo, Some("rx.ini".into()))
            .unwrap();
        let report = registry
            .attach(index, EndpointKind::Sink, ChipMode::Mimo, None)
            .unwrap();
        assert_eq!(
            report.conflicts,
            vec![Conflict::FileBacking {
                source: Some(PathBuf::from("rx.ini")),
                sink: None
            }]
        );
    }

    #[test]
    fn test_detach_closes_on_last_endpoint() {
        let (driver, registry) = registry_with(&["AABB"]);
        let index = registry.open("AABB").unwrap();
        let source = registry
            .attach(index, EndpointKind::Source, ChipMode::ChannelA, None)
            .unwrap();
        let sink = registry
            .attach(index, EndpointKind::Sink, ChipMode::ChannelA, None)
            .unwrap();
        assert_eq!(source.session, sink.session);

        registry.detach(index, sink.session, EndpointKind::Sink);
        assert!(registry.is_open(index));
        assert_eq!(driver.close_count(0), 0);

        registry.detach(index, source.session, EndpointKind::Source);
        assert!(!registry.is_open(index));
        assert_eq!(driver.close_count(0), 1);

        // Late duplicate teardown
        registry.detach(index, source.session, EndpointKind::Source);
        assert_eq!(driver.close_count(0), 1);
    }

    #[test]
    fn test_detach_unattached_kind_is_noop() {
        let (driver, registry) = registry_with(&["AABB"]);
        let index = registry.open("AABB").unwrap();
        let session = registry.session(index).unwrap();
        registry.detach(index, session, EndpointKind::Sink);
        assert!(registry.is_open(index));
        assert_eq!(registry.attachments(index).unwrap().count(), 0);
        assert_eq!(driver.close_count(0), 0);
    }

    #[test]
    fn test_detach_from_earlier_session_is_ignored() {
        let (driver, registry) = registry_with(&["AABB"]);
        let index = registry.open("AABB").unwrap();
        let old = registry
            .attach(index, EndpointKind::Source, ChipMode::ChannelA, None)
            .unwrap();

        registry.close_all();
        let reopened = registry.open("AABB").unwrap();
        let new = registry
            .attach(reopened, EndpointKind::Source, ChipMode::ChannelA, None)
            .unwrap();
        assert_eq!(reopened, index);
        assert_ne!(old.session, new.session);

        registry.detach(index, old.session, EndpointKind::Source);
        assert!(registry.attachments(index).unwrap().source);
        assert_eq!(driver.close_count(0), 1);

        assert!(matches!(
            registry.ensure_session(index, old.session),
            Err(RegistryError::SessionEnded { .. })
        ));
        assert!(registry.ensure_session(index, new.session).is_ok());

        registry.detach(index, new.session, EndpointKind::Source);
        assert!(!registry.is_open(index));
        assert_eq!(driver.close_count(0), 2);
    }

    #[test]
    fn test_reordered_discovery_reuses_record_by_identifier() {
        let (driver, registry) = registry_with(&["AABB", "CCDD"]);
        let aabb = registry.open("AABB").unwrap();

        driver.set_enumeration_order(vec![1, 0]);
        registry.invalidate_discovery();

        // Same device, now listed at position 1: still the open record
        assert_eq!(registry.open("AABB").unwrap(), aabb);
        assert_eq!(driver.open_count(0), 1);
        assert!(registry.identifier(aabb).unwrap().contains("AABB"));

        // CCDD moved onto the position AABB's record is keyed by
        let err = registry.open("CCDD").unwrap_err();
        match err {
            RegistryError::IndexConflict {
                index,
                ref open,
                ref requested,
            } => {
                assert_eq!(index, aabb);
                assert!(open.contains("AABB"));
                assert!(requested.contains("CCDD"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(driver.open_count(1), 0);

        // The failed open tore everything down, so a retry opens CCDD
        assert_eq!(registry.record_count(), 0);
        let ccdd = registry.open("CCDD").unwrap();
        assert!(registry.identifier(ccdd).unwrap().contains("CCDD"));
        assert_eq!(driver.open_count(1), 1);
    }

    #[test]
    fn test_close_all_runs_once_until_rearmed() {
        let (driver, registry) = registry_with(&["AABB", "CCDD"]);
        registry.open("AABB").unwrap();
        registry.open("CCDD").unwrap();

        registry.close_all();
        registry.close_all();
        assert_eq!(registry.record_count(), 0);
        assert_eq!(driver.close_count(0), 1);
        assert_eq!(driver.close_count(1), 1);

        // A new open re-arms teardown
        registry.open("AABB").unwrap();
        registry.close_all();
        assert_eq!(driver.close_count(0), 2);
    }

    #[test]
    fn test_drop_closes_open_devices() {
        let (driver, registry) = registry_with(&["AABB"]);
        let index = registry.open("AABB").unwrap();
        let _ = registry
            .attach(index, EndpointKind::Source, ChipMode::Mimo, None)
            .unwrap();
        drop(registry);
        assert_eq!(driver.close_count(0), 1);
        assert_eq!(driver.open_device_count(), 0);
    }

    #[test]
    fn test_connect_releases_fresh_device_on_attach_failure() {
        let (driver, registry) = registry_with(&["AABB"]);
        let report = registry
            .connect("AABB", EndpointKind::Source, ChipMode::ChannelA, None)
            .unwrap();
        assert_eq!(report.index, DeviceIndex(0));

        let err = registry
            .connect("AABB", EndpointKind::Source, ChipMode::ChannelA, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DoubleAttach { .. }));
        // The existing source keeps the device open
        assert!(registry.is_open(DeviceIndex(0)));
        assert_eq!(driver.open_count(0), 1);
    }

    #[test]
    fn test_configure_under_reentrant_lock() {
        let (_driver, registry) = registry_with(&["AABB"]);
        let index = registry.open("AABB").unwrap();
        let _lock = registry.lock();
        // Nested registry calls from the lock-holding thread must not deadlock
        let rate = registry
            .configure(index, "sample_rate", "1 MS/s", |driver, handle| {
                driver.set_sample_rate(handle, 1e6, 0)?;
                driver.sample_rate(handle, Direction::Rx, crate::driver::Channel::A)
            })
            .unwrap();
        assert_eq!(rate, 1e6);
        assert_eq!(registry.record_count(), 1);
    }

    #[test]
    fn test_configure_unknown_device() {
        let (_driver, registry) = registry_with(&["AABB"]);
        let result = registry.configure(DeviceIndex(4), "gain", 10, |_, _| Ok(()));
        assert!(matches!(result, Err(RegistryError::DeviceNotOpen(DeviceIndex(4)))));
    }

    #[test]
    #[traced_test]
    fn test_conflicts_are_logged() {
        let (_driver, registry) = registry_with(&["AABB"]);
        let index = registry.open("AABB").unwrap();
        let _ = registry
            .attach(index, EndpointKind::Source, ChipMode::Mimo, None)
            .unwrap();
        let report = registry
            .attach(index, EndpointKind::Sink, ChipMode::ChannelB, Some("/tmp/tx.bin".into()))
            .unwrap();
        assert_eq!(report.conflicts.len(), 2);
        assert!(logs_contain("chip mode mismatch"));
        assert!(logs_contain("file backing mismatch"));
    }
}
