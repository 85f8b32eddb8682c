//! Device driver contract and the alias/name/ip resolver (spec §4.3, §6).
//!
//! `DeviceDriver` mirrors the teacher's service-trait-plus-`#[async_trait]`
//! idiom (`src/grpc/kernel_service.rs` wraps a shared `Arc<Mutex<Kernel>>`
//! behind a generated trait); here the trait is authored directly since
//! there is no protobuf service to generate it from.

use crate::types::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One entry from `devices.json` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub child_id: Option<String>,
    pub brand: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub is_primary_pump: bool,
    #[serde(default)]
    pub is_primary_vibe: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Pump,
    Vibe,
    Other,
}

/// The resolved key device drivers and pending-op registries key on: the
/// device's ip, optionally suffixed `:childId` for multi-outlet hubs.
pub type DeviceKey = String;

/// Result of calling `start_cycle`: whether the driver accepted an
/// indefinite cycle (cycles == 0).
#[derive(Debug, Clone, Copy)]
pub struct CycleHandle {
    pub infinite: bool,
}

/// External device I/O boundary. A driver failure is never fatal to the
/// flow (spec §4.5) — callers broadcast an `error` event and treat the
/// action as returning `false`.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn turn_on(&self, key: &DeviceKey) -> Result<()>;
    async fn turn_off(&self, key: &DeviceKey) -> Result<()>;
    async fn start_cycle(
        &self,
        key: &DeviceKey,
        duration: Duration,
        interval: Duration,
        cycles: u32,
    ) -> Result<CycleHandle>;
    /// Returns `Ok(true)` if a cycle was actually running and got
    /// stopped. `Ok(false)` signals the "no active cycle" case the
    /// interpreter uses as a safety-net `turn_off` trigger (spec §4.3).
    async fn stop_cycle(&self, key: &DeviceKey) -> Result<bool>;
}

/// Default in-process driver used by tests and the standalone server when
/// no real hardware integration is configured. Tracks no real hardware
/// state; completion callbacks are the caller's responsibility to invoke
/// via the timer subsystem.
#[derive(Debug, Default)]
pub struct NullDeviceDriver;

#[async_trait]
impl DeviceDriver for NullDeviceDriver {
    async fn turn_on(&self, key: &DeviceKey) -> Result<()> {
        tracing::debug!(device = %key, "null_driver_turn_on");
        Ok(())
    }

    async fn turn_off(&self, key: &DeviceKey) -> Result<()> {
        tracing::debug!(device = %key, "null_driver_turn_off");
        Ok(())
    }

    async fn start_cycle(
        &self,
        key: &DeviceKey,
        _duration: Duration,
        _interval: Duration,
        cycles: u32,
    ) -> Result<CycleHandle> {
        tracing::debug!(device = %key, cycles, "null_driver_start_cycle");
        Ok(CycleHandle {
            infinite: cycles == 0,
        })
    }

    async fn stop_cycle(&self, key: &DeviceKey) -> Result<bool> {
        tracing::debug!(device = %key, "null_driver_stop_cycle");
        Ok(true)
    }
}

/// Resolves a flow's `device_ref` (alias, name, ip, or `ip:childId`) to a
/// `DeviceKey`, against the catalog loaded from `devices.json`.
#[derive(Debug, Default)]
pub struct DeviceCatalog {
    records: HashMap<String, DeviceRecord>,
    aliases: HashMap<String, String>,
}

impl DeviceCatalog {
    pub fn load(records: Vec<DeviceRecord>) -> Self {
        let mut catalog = Self::default();
        for record in records {
            if let Some(ip) = &record.ip {
                catalog.aliases.insert(record.name.to_lowercase(), ip.clone());
                if let Some(label) = &record.label {
                    catalog.aliases.insert(label.to_lowercase(), ip.clone());
                }
            }
            catalog.records.insert(record.id.clone(), record);
        }
        catalog
    }

    pub fn primary_pump(&self) -> Option<&DeviceRecord> {
        self.records.values().find(|d| d.is_primary_pump)
    }

    pub fn primary_vibe(&self) -> Option<&DeviceRecord> {
        self.records.values().find(|d| d.is_primary_vibe)
    }

    pub fn is_pump(&self, key: &DeviceKey) -> bool {
        let ip = key.split(':').next().unwrap_or(key);
        self.records
            .values()
            .any(|d| d.ip.as_deref() == Some(ip) && d.device_type == DeviceType::Pump)
    }

    /// Resolves `device_ref` to a `DeviceKey`. Accepts: a literal ip (or
    /// `ip:childId`), a device name/label (case-insensitive alias), or the
    /// reserved tokens `primary_pump`/`primary_vibe`.
    pub fn resolve(&self, device_ref: &str) -> Result<DeviceKey> {
        match device_ref {
            "primary_pump" => self
                .primary_pump()
                .and_then(|d| d.ip.clone())
                .ok_or_else(|| Error::not_found("no primary pump configured")),
            "primary_vibe" => self
                .primary_vibe()
                .and_then(|d| d.ip.clone())
                .ok_or_else(|| Error::not_found("no primary vibe configured")),
            other => {
                if other.contains('.') || other.contains(':') {
                    return Ok(other.to_string());
                }
                self.aliases
                    .get(&other.to_lowercase())
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("unknown device alias: {other}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_catalog() -> DeviceCatalog {
        DeviceCatalog::load(vec![DeviceRecord {
            id: "d1".into(),
            name: "Bedroom Pump".into(),
            label: Some("pump".into()),
            ip: Some("10.0.0.5".into()),
            device_id: None,
            child_id: None,
            brand: "acme".into(),
            device_type: DeviceType::Pump,
            is_primary_pump: true,
            is_primary_vibe: false,
        }])
    }

    #[test]
    fn resolves_alias_and_primary_token() {
        let catalog = sample_catalog();
        assert_eq!(catalog.resolve("pump").unwrap(), "10.0.0.5");
        assert_eq!(catalog.resolve("primary_pump").unwrap(), "10.0.0.5");
        assert_eq!(catalog.resolve("10.0.0.5:2").unwrap(), "10.0.0.5:2");
    }

    #[test]
    fn unknown_alias_errors() {
        let catalog = sample_catalog();
        assert!(catalog.resolve("nonexistent").is_err());
    }

    #[test]
    fn is_pump_checks_device_type() {
        let catalog = sample_catalog();
        assert!(catalog.is_pump("10.0.0.5"));
        assert!(catalog.is_pump("10.0.0.5:2"));
    }
}
