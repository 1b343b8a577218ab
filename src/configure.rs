//! Typed configuration calls.
//!
//! Each call is a thin wrapper over [`DeviceRegistry::configure`]: it runs under
//! the registry lock, checks the requested value, then hands it to the driver.
//! Setters that have a read-back return the value the hardware settled on.

use crate::driver::{Channel, DeviceIndex, Direction};
use crate::error::RegistryResult;
use crate::registry::{ChipMode, Conflict, DeviceRegistry, EndpointKind};
use anyhow::ensure;
use std::ops::RangeInclusive;

/// Oversampling ratios accepted by the hardware; 0 lets the driver choose.
pub const OVERSAMPLING_RATIOS: [u32; 7] = [0, 1, 2, 4, 8, 16, 32];

/// Valid combined gain range in dB for a direction.
pub fn gain_range(dir: Direction) -> RangeInclusive<u32> {
    match dir {
        Direction::Rx => 0..=70,
        Direction::Tx => 0..=60,
    }
}

/// Valid analog low-pass filter bandwidth in Hz for a direction.
pub fn analog_filter_range(dir: Direction) -> RangeInclusive<f64> {
    match dir {
        Direction::Rx => 1.5e6..=130e6,
        Direction::Tx => 5e6..=130e6,
    }
}

fn ensure_positive(value: f64, what: &str) -> anyhow::Result<()> {
    ensure!(
        value.is_finite() && value > 0.0,
        "{what} must be a positive number of Hz"
    );
    Ok(())
}

impl DeviceRegistry {
    /// Set the sample rate of both directions and return the rate read back from RX.
    pub fn set_sample_rate(
        &self,
        index: DeviceIndex,
        rate_hz: f64,
        oversample: u32,
    ) -> RegistryResult<f64> {
        self.configure(
            index,
            "sample_rate",
            format!("{rate_hz} S/s (oversample {oversample})"),
            |driver, handle| {
                ensure_positive(rate_hz, "sample rate")?;
                ensure!(
                    OVERSAMPLING_RATIOS.contains(&oversample),
                    "oversampling must be one of {OVERSAMPLING_RATIOS:?}"
                );
                driver.set_sample_rate(handle, rate_hz, oversample)?;
                driver.sample_rate(handle, Direction::Rx, Channel::A)
            },
        )
    }

    /// Change the oversampling ratio, keeping the current sample rate.
    pub fn set_oversampling(&self, index: DeviceIndex, oversample: u32) -> RegistryResult<()> {
        self.configure(index, "oversampling", oversample, |driver, handle| {
            ensure!(
                OVERSAMPLING_RATIOS.contains(&oversample),
                "oversampling must be one of {OVERSAMPLING_RATIOS:?}"
            );
            let rate = driver.sample_rate(handle, Direction::Rx, Channel::A)?;
            ensure!(rate > 0.0, "sample rate must be set before oversampling");
            driver.set_sample_rate(handle, rate, oversample)
        })
    }

    /// Tune the LO and return the frequency the device settled on.
    pub fn set_rf_freq(
        &self,
        index: DeviceIndex,
        dir: Direction,
        ch: Channel,
        hz: f64,
    ) -> RegistryResult<f64> {
        self.configure(index, "rf_freq", format!("{hz} Hz ({dir} {ch})"), |driver, handle| {
            ensure_positive(hz, "RF frequency")?;
            driver.set_lo_frequency(handle, dir, ch, hz)?;
            driver.lo_frequency(handle, dir, ch)
        })
    }

    /// Set the combined gain and return the gain read back.
    pub fn set_gain(
        &self,
        index: DeviceIndex,
        dir: Direction,
        ch: Channel,
        gain_db: u32,
    ) -> RegistryResult<u32> {
        self.configure(index, "gain", format!("{gain_db} dB ({dir} {ch})"), |driver, handle| {
            let range = gain_range(dir);
            ensure!(
                range.contains(&gain_db),
                "{dir} gain must be within {}..={} dB",
                range.start(),
                range.end()
            );
            driver.set_gain_db(handle, dir, ch, gain_db)?;
            driver.gain_db(handle, dir, ch)
        })
    }

    /// Configure the analog low-pass filter; `enabled == false` bypasses it.
    pub fn set_analog_filter(
        &self,
        index: DeviceIndex,
        dir: Direction,
        ch: Channel,
        enabled: bool,
        bandwidth_hz: f64,
    ) -> RegistryResult<()> {
        let value = if enabled {
            format!("{bandwidth_hz} Hz ({dir} {ch})")
        } else {
            format!("off ({dir} {ch})")
        };
        self.configure(index, "analog_filter", value, |driver, handle| {
            if !enabled {
                return driver.bypass_lpf(handle, dir, ch);
            }
            let range = analog_filter_range(dir);
            ensure!(
                range.contains(&bandwidth_hz),
                "{dir} analog filter bandwidth must be within {}..={} Hz",
                range.start(),
                range.end()
            );
            driver.set_lpf_bandwidth(handle, dir, ch, bandwidth_hz)
        })
    }

    /// Configure the digital (GFIR) low-pass filter.
    pub fn set_digital_filter(
        &self,
        index: DeviceIndex,
        dir: Direction,
        ch: Channel,
        enabled: bool,
        bandwidth_hz: f64,
    ) -> RegistryResult<()> {
        let value = if enabled {
            format!("{bandwidth_hz} Hz ({dir} {ch})")
        } else {
            format!("off ({dir} {ch})")
        };
        self.configure(index, "digital_filter", value, |driver, handle| {
            if enabled {
                ensure_positive(bandwidth_hz, "digital filter bandwidth")?;
            }
            driver.set_gfir_lpf(handle, dir, ch, enabled, bandwidth_hz)
        })
    }

    /// Set the NCO frequency. 0 Hz turns the NCO off; the sign selects the
    /// mixing direction and is passed through.
    pub fn set_nco(
        &self,
        index: DeviceIndex,
        dir: Direction,
        ch: Channel,
        hz: f64,
    ) -> RegistryResult<()> {
        self.configure(index, "nco", format!("{hz} Hz ({dir} {ch})"), |driver, handle| {
            ensure!(hz.is_finite(), "NCO frequency must be finite");
            let nco = (hz != 0.0).then_some(hz);
            driver.set_nco(handle, dir, ch, nco)
        })
    }

    /// Run calibration over `bandwidth_hz`.
    pub fn calibrate(
        &self,
        index: DeviceIndex,
        dir: Direction,
        ch: Channel,
        bandwidth_hz: f64,
    ) -> RegistryResult<()> {
        self.configure(
            index,
            "calibration",
            format!("{bandwidth_hz} Hz ({dir} {ch})"),
            |driver, handle| {
                ensure_positive(bandwidth_hz, "calibration bandwidth")?;
                driver.calibrate(handle, dir, ch, bandwidth_hz)
            },
        )
    }

    /// Select the antenna port.
    pub fn set_antenna(
        &self,
        index: DeviceIndex,
        dir: Direction,
        ch: Channel,
        antenna: u32,
    ) -> RegistryResult<()> {
        self.configure(index, "antenna", format!("{antenna} ({dir} {ch})"), |driver, handle| {
            driver.set_antenna(handle, dir, ch, antenna)
        })
    }

    /// Enable the channels of `mode` for one direction and disable the rest.
    ///
    /// The mode is also recorded for the endpoint serving `dir` when one is
    /// attached; any conflict with the other endpoint is returned.
    pub fn set_chip_mode(
        &self,
        index: DeviceIndex,
        dir: Direction,
        mode: ChipMode,
    ) -> RegistryResult<Vec<Conflict>> {
        let _lock = self.lock();
        self.configure(index, "chip_mode", format!("{mode} ({dir})"), |driver, handle| {
            for ch in Channel::ALL {
                driver.enable_channel(handle, dir, ch, mode.uses(ch))?;
            }
            Ok(())
        })?;
        Ok(self.record_chip_mode(index, EndpointKind::for_direction(dir), mode))
    }

    /// Turn off automatic DC offset correction.
    pub fn disable_dc_corrections(&self, index: DeviceIndex) -> RegistryResult<()> {
        self.configure(index, "dc_correction", "off", |driver, handle| {
            driver.set_dc_correction(handle, false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use crate::mock::MockDriver;
    use std::sync::Arc;

    fn open_device() -> (Arc<MockDriver>, DeviceRegistry, DeviceIndex) {
        let driver = Arc::new(MockDriver::with_serials(["AABB"]));
        let registry = DeviceRegistry::new(driver.clone());
        let index = registry.open("AABB").unwrap();
        (driver, registry, index)
    }

    #[test]
    fn test_sample_rate_read_back() {
        let (driver, registry, index) = open_device();
        let actual = registry.set_sample_rate(index, 10e6, 4).unwrap();
        assert_eq!(actual, 10e6);
        let state = driver.device(0).unwrap();
        assert_eq!(state.oversample, 4);
    }

    #[test]
    fn test_oversampling_keeps_rate() {
        let (driver, registry, index) = open_device();
        registry.set_sample_rate(index, 5e6, 0).unwrap();
        registry.set_oversampling(index, 16).unwrap();
        let state = driver.device(0).unwrap();
        assert_eq!(state.sample_rate, 5e6);
        assert_eq!(state.oversample, 16);
    }

    #[test]
    fn test_invalid_oversampling_rejected() {
        let (_driver, registry, index) = open_device();
        registry.set_sample_rate(index, 5e6, 0).unwrap();
        let err = registry.set_oversampling(index, 3).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Configuration {
                parameter: "oversampling",
                ..
            }
        ));
    }

    #[test]
    fn test_gain_range_per_direction() {
        let (driver, registry, index) = open_device();
        assert_eq!(registry.set_gain(index, Direction::Rx, Channel::A, 70).unwrap(), 70);
        let err = registry
            .set_gain(index, Direction::Tx, Channel::A, 61)
            .unwrap_err();
        match err {
            RegistryError::Configuration { parameter, value, .. } => {
                assert_eq!(parameter, "gain");
                assert!(value.starts_with("61 dB"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Rejected value never reached the driver
        let state = driver.device(0).unwrap();
        assert!(!state.gain_db.contains_key(&(Direction::Tx, Channel::A)));
    }

    #[test]
    fn test_driver_failure_keeps_device_open() {
        let (driver, registry, index) = open_device();
        driver.fail_call("set_lo_frequency", true);
        let err = registry
            .set_rf_freq(index, Direction::Rx, Channel::B, 433.92e6)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Configuration { parameter: "rf_freq", .. }));
        assert!(registry.is_open(index));

        driver.fail_call("set_lo_frequency", false);
        let actual = registry
            .set_rf_freq(index, Direction::Rx, Channel::B, 433.92e6)
            .unwrap();
        assert_eq!(actual, 433.92e6);
    }

    #[test]
    fn test_analog_filter_bypass_and_range() {
        let (driver, registry, index) = open_device();
        registry
            .set_analog_filter(index, Direction::Tx, Channel::A, true, 20e6)
            .unwrap();
        assert!(registry
            .set_analog_filter(index, Direction::Tx, Channel::A, true, 2e6)
            .is_err());
        registry
            .set_analog_filter(index, Direction::Rx, Channel::A, false, 0.0)
            .unwrap();
        let state = driver.device(0).unwrap();
        assert_eq!(state.lpf_bandwidth[&(Direction::Tx, Channel::A)], Some(20e6));
        assert_eq!(state.lpf_bandwidth[&(Direction::Rx, Channel::A)], None);
    }

    #[test]
    fn test_nco_zero_disables() {
        let (driver, registry, index) = open_device();
        registry.set_nco(index, Direction::Rx, Channel::A, -1e6).unwrap();
        registry.set_nco(index, Direction::Tx, Channel::A, 0.0).unwrap();
        let state = driver.device(0).unwrap();
        assert_eq!(state.nco[&(Direction::Rx, Channel::A)], Some(-1e6));
        assert_eq!(state.nco[&(Direction::Tx, Channel::A)], None);
    }

    #[test]
    fn test_chip_mode_enables_channels() {
        let (driver, registry, index) = open_device();
        registry.set_chip_mode(index, Direction::Rx, ChipMode::Mimo).unwrap();
        registry
            .set_chip_mode(index, Direction::Tx, ChipMode::ChannelB)
            .unwrap();
        let enabled = driver.device(0).unwrap().enabled;
        assert!(enabled.contains(&(Direction::Rx, Channel::A)));
        assert!(enabled.contains(&(Direction::Rx, Channel::B)));
        assert!(!enabled.contains(&(Direction::Tx, Channel::A)));
        assert!(enabled.contains(&(Direction::Tx, Channel::B)));
    }

    #[test]
    fn test_chip_mode_change_reports_conflict() {
        let (_driver, registry, index) = open_device();
        let _ = registry
            .attach(index, EndpointKind::Source, ChipMode::Mimo, None)
            .unwrap();
        let _ = registry
            .attach(index, EndpointKind::Sink, ChipMode::Mimo, None)
            .unwrap();
        let conflicts = registry
            .set_chip_mode(index, Direction::Tx, ChipMode::ChannelA)
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            registry.chip_mode(index, EndpointKind::Sink),
            Some(ChipMode::ChannelA)
        );
    }

    #[test]
    fn test_calibrate_antenna_dc() {
        let (driver, registry, index) = open_device();
        registry.calibrate(index, Direction::Rx, Channel::A, 5e6).unwrap();
        registry.set_antenna(index, Direction::Rx, Channel::A, 2).unwrap();
        registry
            .set_digital_filter(index, Direction::Rx, Channel::A, true, 1e6)
            .unwrap();
        registry.disable_dc_corrections(index).unwrap();
        let state = driver.device(0).unwrap();
        assert_eq!(state.calibrations, vec![(Direction::Rx, Channel::A, 5e6)]);
        assert_eq!(state.antenna[&(Direction::Rx, Channel::A)], 2);
        assert_eq!(state.gfir[&(Direction::Rx, Channel::A)], (true, 1e6));
        assert!(!state.dc_correction);
    }
}
