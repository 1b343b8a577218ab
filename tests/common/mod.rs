//! Common test utilities for registry integration tests
//!
//! - Registry construction over the mock driver
//! - Cross-checks between registry bookkeeping and driver-side state

#![allow(dead_code)] // Not every test binary uses every helper

use sdr_registry::{DeviceIndex, DeviceRegistry, MockDriver};
use std::sync::Arc;
use std::time::Duration;

/// Registry over a mock driver exposing `serials`, shared as the endpoints would see it.
pub fn registry_with(serials: &[&str]) -> (Arc<MockDriver>, Arc<DeviceRegistry>) {
    let driver = Arc::new(MockDriver::with_serials(serials.iter().copied()));
    let registry = Arc::new(DeviceRegistry::new(driver.clone()));
    (driver, registry)
}

/// Same as [`registry_with`], but every driver call takes `delay`.
pub fn slow_registry_with(
    serials: &[&str],
    delay: Duration,
) -> (Arc<MockDriver>, Arc<DeviceRegistry>) {
    let driver = Arc::new(MockDriver::with_serials(serials.iter().copied()).with_call_delay(delay));
    let registry = Arc::new(DeviceRegistry::new(driver.clone()));
    (driver, registry)
}

/// Assert the registry and the driver agree on which devices are open.
///
/// # Panics
/// Panics if a device is open on one side only, or was opened more often
/// than closed beyond its current session.
pub fn assert_consistent(driver: &MockDriver, registry: &DeviceRegistry, device_count: usize) {
    assert_eq!(
        driver.open_device_count(),
        registry.record_count(),
        "driver and registry disagree on open device count"
    );
    for i in 0..device_count {
        let open = registry.is_open(DeviceIndex(i));
        let sessions = driver.open_count(i) - driver.close_count(i);
        assert_eq!(
            sessions,
            usize::from(open),
            "device {i}: {} opens, {} closes, registry open = {open}",
            driver.open_count(i),
            driver.close_count(i)
        );
        if let Some(attachments) = registry.attachments(DeviceIndex(i)) {
            assert!(attachments.count() <= 2);
        }
    }
}
