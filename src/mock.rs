//! Mock SDR Driver
//!
//! In-memory [`SdrDriver`] used by tests and by the CLI's simulated mode.
//!
//! Besides emulating device state it records what the registry did to it:
//! open/close calls per device, enumeration calls, and how many driver calls
//! were ever in flight at the same time (the serialization probe).

use crate::driver::{Channel, DeviceHandle, Direction, SdrDriver};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Observable state of one simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct MockDeviceState {
    /// Position in the enumerated list
    pub index: usize,
    /// Host sample rate in S/s
    pub sample_rate: f64,
    /// Oversampling ratio (0 = default)
    pub oversample: u32,
    /// LO frequency per direction/channel
    pub lo_frequency: HashMap<(Direction, Channel), f64>,
    /// Gain in dB per direction/channel
    pub gain_db: HashMap<(Direction, Channel), u32>,
    /// Analog LPF bandwidth; `None` when bypassed
    pub lpf_bandwidth: HashMap<(Direction, Channel), Option<f64>>,
    /// Digital LPF (enabled, bandwidth)
    pub gfir: HashMap<(Direction, Channel), (bool, f64)>,
    /// NCO frequency; `None` when disabled
    pub nco: HashMap<(Direction, Channel), Option<f64>>,
    /// Selected antenna index
    pub antenna: HashMap<(Direction, Channel), u32>,
    /// Enabled channels
    pub enabled: HashSet<(Direction, Channel)>,
    /// Calibration bandwidths applied, in call order
    pub calibrations: Vec<(Direction, Channel, f64)>,
    /// Automatic DC correction on/off
    pub dc_correction: bool,
}

impl MockDeviceState {
    fn new(index: usize) -> Self {
        Self {
            index,
            sample_rate: 0.0,
            oversample: 0,
            lo_frequency: HashMap::new(),
            gain_db: HashMap::new(),
            lpf_bandwidth: HashMap::new(),
            gfir: HashMap::new(),
            nco: HashMap::new(),
            antenna: HashMap::new(),
            enabled: HashSet::new(),
            calibrations: Vec::new(),
            dc_correction: true,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    /// Physical device listed at each enumeration position
    order: Vec<usize>,
    devices: HashMap<DeviceHandle, MockDeviceState>,
    enumerate_calls: usize,
    open_calls: HashMap<usize, usize>,
    close_calls: HashMap<usize, usize>,
    fail_enumerate: bool,
    fail_open: HashSet<usize>,
    fail_calls: HashSet<&'static str>,
}

/// Simulated multi-device driver.
#[derive(Debug)]
pub struct MockDriver {
    identifiers: Vec<String>,
    state: Mutex<MockState>,
    call_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Tracks one driver call for the concurrency probe.
struct CallGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockDriver {
    /// Driver exposing one device per serial number.
    pub fn with_serials<I, S>(serials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let identifiers: Vec<String> = serials
            .into_iter()
            .map(|s| format!("SDR-Mock, media=USB 3.0, serial={}", s.as_ref()))
            .collect();
        let order = (0..identifiers.len()).collect();
        Self {
            identifiers,
            state: Mutex::new(MockState {
                next_handle: 1,
                order,
                ..Default::default()
            }),
            call_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make every configuration primitive take at least `delay`.
    ///
    /// Widens the window in which overlapping calls would be observed.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// List the devices in a different order from the next enumeration on.
    ///
    /// `order[i]` is the device (by its position in the serial list given at
    /// construction) reported at position `i`. Counters and [`device`](Self::device)
    /// keep using construction positions.
    pub fn set_enumeration_order(&self, order: Vec<usize>) {
        self.state.lock().order = order;
    }

    /// Make enumeration fail (or succeed again).
    pub fn fail_enumerate(&self, fail: bool) {
        self.state.lock().fail_enumerate = fail;
    }

    /// Make opening the device at `index` fail (or succeed again).
    pub fn fail_open(&self, index: usize, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_open.insert(index);
        } else {
            state.fail_open.remove(&index);
        }
    }

    /// Make a configuration primitive (by trait method name) fail.
    pub fn fail_call(&self, primitive: &'static str, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_calls.insert(primitive);
        } else {
            state.fail_calls.remove(primitive);
        }
    }

    /// Number of enumeration calls so far.
    pub fn enumerate_count(&self) -> usize {
        self.state.lock().enumerate_calls
    }

    /// Number of successful opens of the device at `index`.
    pub fn open_count(&self, index: usize) -> usize {
        self.state.lock().open_calls.get(&index).copied().unwrap_or(0)
    }

    /// Number of closes of the device at `index`.
    pub fn close_count(&self, index: usize) -> usize {
        self.state.lock().close_calls.get(&index).copied().unwrap_or(0)
    }

    /// Devices currently open.
    pub fn open_device_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    /// Highest number of driver calls observed executing at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// State of the open device at `index`, if any.
    pub fn device(&self, index: usize) -> Option<MockDeviceState> {
        self.state
            .lock()
            .devices
            .values()
            .find(|d| d.index == index)
            .cloned()
    }

    fn enter(&self) -> CallGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            std::thread::sleep(self.call_delay);
        }
        CallGuard {
            in_flight: &self.in_flight,
        }
    }

    /// Apply `f` to an open device, honouring injected failures.
    fn with_device<T>(
        &self,
        primitive: &'static str,
        handle: DeviceHandle,
        f: impl FnOnce(&mut MockDeviceState) -> Result<T>,
    ) -> Result<T> {
        let _call = self.enter();
        let mut state = self.state.lock();
        if state.fail_calls.contains(primitive) {
            bail!("{primitive} rejected by device");
        }
        match state.devices.get_mut(&handle) {
            Some(device) => f(device),
            None => bail!("Device not open: {:?}", handle),
        }
    }
}

impl SdrDriver for MockDriver {
    fn enumerate(&self) -> Result<Vec<String>> {
        let _call = self.enter();
        let mut state = self.state.lock();
        state.enumerate_calls += 1;
        if state.fail_enumerate {
            bail!("Device enumeration failed: driver service not running");
        }
        Ok(state
            .order
            .iter()
            .filter_map(|&i| self.identifiers.get(i).cloned())
            .collect())
    }

    fn open(&self, position: usize) -> Result<DeviceHandle> {
        let _call = self.enter();
        let mut state = self.state.lock();
        let Some(index) = state
            .order
            .get(position)
            .copied()
            .filter(|&i| i < self.identifiers.len())
        else {
            bail!("No device at index {position}");
        };
        if state.fail_open.contains(&index) {
            bail!("USB connection to device {index} failed");
        }
        if state.devices.values().any(|d| d.index == index) {
            bail!("Device {index} is already open");
        }

        let handle = DeviceHandle(state.next_handle);
        state.next_handle += 1;
        state.devices.insert(handle, MockDeviceState::new(index));
        *state.open_calls.entry(index).or_default() += 1;
        tracing::trace!(index, ?handle, "Mock device opened");
        Ok(handle)
    }

    fn close(&self, handle: DeviceHandle) -> Result<()> {
        let _call = self.enter();
        let mut state = self.state.lock();
        match state.devices.remove(&handle) {
            Some(device) => {
                *state.close_calls.entry(device.index).or_default() += 1;
                tracing::trace!(index = device.index, ?handle, "Mock device closed");
                Ok(())
            }
            None => bail!("Device not open: {:?}", handle),
        }
    }

    fn set_sample_rate(&self, handle: DeviceHandle, rate_hz: f64, oversample: u32) -> Result<()> {
        self.with_device("set_sample_rate", handle, |d| {
            d.sample_rate = rate_hz;
            d.oversample = oversample;
            Ok(())
        })
    }

    fn sample_rate(&self, handle: DeviceHandle, _dir: Direction, _ch: Channel) -> Result<f64> {
        self.with_device("sample_rate", handle, |d| Ok(d.sample_rate))
    }

    fn set_lo_frequency(&self, handle: DeviceHandle, dir: Direction, ch: Channel, hz: f64) -> Result<()> {
        self.with_device("set_lo_frequency", handle, |d| {
            d.lo_frequency.insert((dir, ch), hz);
            Ok(())
        })
    }

    fn lo_frequency(&self, handle: DeviceHandle, dir: Direction, ch: Channel) -> Result<f64> {
        self.with_device("lo_frequency", handle, |d| {
            Ok(d.lo_frequency.get(&(dir, ch)).copied().unwrap_or(0.0))
        })
    }

    fn set_gain_db(&self, handle: DeviceHandle, dir: Direction, ch: Channel, gain_db: u32) -> Result<()> {
        self.with_device("set_gain_db", handle, |d| {
            d.gain_db.insert((dir, ch), gain_db);
            Ok(())
        })
    }

    fn gain_db(&self, handle: DeviceHandle, dir: Direction, ch: Channel) -> Result<u32> {
        self.with_device("gain_db", handle, |d| {
            Ok(d.gain_db.get(&(dir, ch)).copied().unwrap_or(0))
        })
    }

    fn set_lpf_bandwidth(&self, handle: DeviceHandle, dir: Direction, ch: Channel, hz: f64) -> Result<()> {
        self.with_device("set_lpf_bandwidth", handle, |d| {
            d.lpf_bandwidth.insert((dir, ch), Some(hz));
            Ok(())
        })
    }

    fn bypass_lpf(&self, handle: DeviceHandle, dir: Direction, ch: Channel) -> Result<()> {
        self.with_device("bypass_lpf", handle, |d| {
            d.lpf_bandwidth.insert((dir, ch), None);
            Ok(())
        })
    }

    fn set_gfir_lpf(
        &self,
        handle: DeviceHandle,
        dir: Direction,
        ch: Channel,
        enabled: bool,
        hz: f64,
    ) -> Result<()> {
        self.with_device("set_gfir_lpf", handle, |d| {
            d.gfir.insert((dir, ch), (enabled, hz));
            Ok(())
        })
    }

    fn set_nco(&self, handle: DeviceHandle, dir: Direction, ch: Channel, hz: Option<f64>) -> Result<()> {
        self.with_device("set_nco", handle, |d| {
            d.nco.insert((dir, ch), hz);
            Ok(())
        })
    }

    fn calibrate(&self, handle: DeviceHandle, dir: Direction, ch: Channel, bandwidth_hz: f64) -> Result<()> {
        self.with_device("calibrate", handle, |d| {
            d.calibrations.push((dir, ch, bandwidth_hz));
            Ok(())
        })
    }

    fn set_antenna(&self, handle: DeviceHandle, dir: Direction, ch: Channel, antenna: u32) -> Result<()> {
        self.with_device("set_antenna", handle, |d| {
            d.antenna.insert((dir, ch), antenna);
            Ok(())
        })
    }

    fn enable_channel(&self, handle: DeviceHandle, dir: Direction, ch: Channel, enabled: bool) -> Result<()> {
        self.with_device("enable_channel", handle, |d| {
            if enabled {
                d.enabled.insert((dir, ch));
            } else {
                d.enabled.remove(&(dir, ch));
            }
            Ok(())
        })
    }

    fn set_dc_correction(&self, handle: DeviceHandle, enabled: bool) -> Result<()> {
        self.with_device("set_dc_correction", handle, |d| {
            d.dc_correction = enabled;
            Ok(())
        })
    }
}
