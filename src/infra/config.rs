//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::{Coordinate, Money, UserId, Vehicle, VehicleId, VehicleType};
use crate::domain::zone::{Zone, ZoneRules};
use crate::infra::error::TollError;
use crate::services::distance::PathOptions;
use crate::services::fare::{FareModifiers, MultiplierTable};
use crate::services::geofence::{GeofenceSettings, SweepClock};
use crate::services::settlement::Pricing;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "corridor".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    /// `wall` for live feeds, `report` when replaying recorded data
    pub sweep_clock: SweepClock,
    pub lock_timeout_ms: u64,
    pub max_future_skew_secs: u64,
    pub lookup_failure_as_outside: bool,
    pub min_path_points: usize,
    /// Dispatcher shards (single writer each)
    pub shard_count: usize,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 86_400,
            sweep_interval_secs: 300,
            sweep_clock: SweepClock::Wall,
            lock_timeout_ms: 250,
            max_future_skew_secs: 300,
            lookup_failure_as_outside: false,
            min_path_points: 3,
            shard_count: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
    pub max_speed_kmh: f64,
    pub min_distance_meters: f64,
    pub max_jump_km: f64,
    pub smoothing: bool,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        let opts = PathOptions::default();
        Self {
            max_speed_kmh: opts.max_speed_kmh,
            min_distance_meters: opts.min_distance_meters,
            max_jump_km: opts.max_jump_km,
            smoothing: opts.smoothing,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FareConfig {
    /// Floor used by zones that do not set their own
    pub default_minimum_fare: f64,
    pub tax_percentage: f64,
    pub discount_percentage: f64,
    /// Vehicle type to multiplier overrides
    pub multipliers: HashMap<String, f64>,
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            default_minimum_fare: 10.0,
            tax_percentage: 0.0,
            discount_percentage: 0.0,
            multipliers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub rate_per_km: f64,
    #[serde(default)]
    pub minimum_fare: Option<f64>,
    /// Vertices as [lat, lon]
    pub polygon: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleConfig {
    pub id: String,
    pub owner: String,
    pub vehicle_type: VehicleType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub user: String,
    /// Currency units
    pub balance: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// File path for event egress (JSONL format)
    pub file: String,
    pub channel_size: usize,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: "toll_events.jsonl".to_string(), channel_size: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttEgressConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Zone entry, exit and journey cancellation events
    pub events_topic: String,
    /// Charge cancellations
    pub charges_topic: String,
    pub reconciliation_topic: String,
    pub metrics_topic: String,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            events_topic: "toll/events".to_string(),
            charges_topic: "toll/charges".to_string(),
            reconciliation_topic: "toll/reconciliation".to_string(),
            metrics_topic: "toll/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10, prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub site: SiteConfig,
    pub geofence: GeofenceConfig,
    pub distance: DistanceConfig,
    pub fare: FareConfig,
    pub zones: Vec<ZoneConfig>,
    pub vehicles: Vec<VehicleConfig>,
    pub wallets: Vec<WalletConfig>,
    pub egress: EgressConfig,
    pub mqtt_egress: MqttEgressConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    config_file: String,
    stale_after_secs: u64,
    sweep_interval_secs: u64,
    sweep_clock: SweepClock,
    lock_timeout_ms: u64,
    max_future_skew_secs: u64,
    lookup_failure_as_outside: bool,
    min_path_points: usize,
    shard_count: usize,
    path: PathOptions,
    default_minimum_fare: f64,
    modifiers: FareModifiers,
    multiplier_overrides: Vec<(String, f64)>,
    zones: Vec<ZoneConfig>,
    vehicles: Vec<VehicleConfig>,
    wallets: Vec<WalletConfig>,
    egress_file: String,
    egress_channel_size: usize,
    mqtt_egress: MqttEgressConfig,
    metrics_interval_secs: u64,
    prometheus_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        let mut multiplier_overrides: Vec<(String, f64)> = toml_config.fare.multipliers.into_iter().collect();
        multiplier_overrides.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            site_id: toml_config.site.id,
            config_file: config_file.to_string(),
            stale_after_secs: toml_config.geofence.stale_after_secs,
            sweep_interval_secs: toml_config.geofence.sweep_interval_secs,
            sweep_clock: toml_config.geofence.sweep_clock,
            lock_timeout_ms: toml_config.geofence.lock_timeout_ms,
            max_future_skew_secs: toml_config.geofence.max_future_skew_secs,
            lookup_failure_as_outside: toml_config.geofence.lookup_failure_as_outside,
            min_path_points: toml_config.geofence.min_path_points,
            shard_count: toml_config.geofence.shard_count,
            path: PathOptions {
                max_speed_kmh: toml_config.distance.max_speed_kmh,
                min_distance_meters: toml_config.distance.min_distance_meters,
                max_jump_km: toml_config.distance.max_jump_km,
                smoothing: toml_config.distance.smoothing,
            },
            default_minimum_fare: toml_config.fare.default_minimum_fare,
            modifiers: FareModifiers {
                discount_percentage: toml_config.fare.discount_percentage,
                tax_percentage: toml_config.fare.tax_percentage,
            },
            multiplier_overrides,
            zones: toml_config.zones,
            vehicles: toml_config.vehicles,
            wallets: toml_config.wallets,
            egress_file: toml_config.egress.file,
            egress_channel_size: toml_config.egress.channel_size,
            mqtt_egress: toml_config.mqtt_egress,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
        }
    }

    /// Determine config file path from the CLI value or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, &path.display().to_string());
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), TollError> {
        self.zones()?;
        for wallet in &self.wallets {
            if !wallet.balance.is_finite() || wallet.balance < 0.0 {
                return Err(TollError::InvalidInput(format!("wallet {} has invalid balance", wallet.user)));
            }
        }
        if let Some((vehicle_type, _)) = self.multiplier_overrides.iter().find(|(_, m)| !m.is_finite() || *m < 0.0) {
            return Err(TollError::InvalidInput(format!("invalid multiplier for {vehicle_type}")));
        }
        Ok(())
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Resolve the path, then load with fallback to defaults
    pub fn load(cli_path: Option<&str>) -> Self {
        Self::load_from_path(&Self::resolve_config_path(cli_path))
    }

    pub fn geofence_settings(&self) -> GeofenceSettings {
        GeofenceSettings {
            stale_after: Duration::from_secs(self.stale_after_secs),
            sweep_clock: self.sweep_clock,
            lock_timeout: self.lock_timeout(),
            max_future_skew: Duration::from_secs(self.max_future_skew_secs),
            lookup_failure_as_outside: self.lookup_failure_as_outside,
            min_path_points: self.min_path_points,
            path: self.path_options(),
        }
    }

    pub fn path_options(&self) -> PathOptions {
        self.path
    }

    pub fn pricing(&self) -> Pricing {
        let overrides = self.multiplier_overrides.iter().map(|(k, v)| (k.as_str(), *v));
        Pricing { modifiers: self.modifiers, multipliers: MultiplierTable::with_overrides(overrides) }
    }

    /// Build the configured zones, validating each polygon
    pub fn zones(&self) -> Result<Vec<Zone>, TollError> {
        self.zones
            .iter()
            .map(|z| {
                let rules = ZoneRules {
                    rate_per_km: z.rate_per_km,
                    minimum_fare: z.minimum_fare.unwrap_or(self.default_minimum_fare),
                };
                let polygon = z.polygon.iter().map(|[lat, lon]| Coordinate::new(*lat, *lon)).collect();
                Zone::new(&z.id, z.name.as_deref().unwrap_or(&z.id), rules, polygon)
            })
            .collect()
    }

    pub fn vehicles(&self) -> Vec<Vehicle> {
        self.vehicles
            .iter()
            .map(|v| Vehicle {
                id: VehicleId::new(v.id.as_str()),
                owner: UserId::new(v.owner.as_str()),
                vehicle_type: v.vehicle_type.clone(),
            })
            .collect()
    }

    /// Initial wallet balances in minor units
    pub fn wallets(&self) -> Vec<(UserId, Money)> {
        self.wallets.iter().map(|w| (UserId::new(w.user.as_str()), Money::from_major(w.balance))).collect()
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn sweep_interval_secs(&self) -> u64 {
        self.sweep_interval_secs
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn egress_channel_size(&self) -> usize {
        self.egress_channel_size
    }

    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress.enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_egress.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_egress.port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_egress.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_egress.password.as_deref()
    }

    pub fn mqtt_events_topic(&self) -> &str {
        &self.mqtt_egress.events_topic
    }

    pub fn mqtt_charges_topic(&self) -> &str {
        &self.mqtt_egress.charges_topic
    }

    pub fn mqtt_reconciliation_topic(&self) -> &str {
        &self.mqtt_egress.reconciliation_topic
    }

    pub fn mqtt_metrics_topic(&self) -> &str {
        &self.mqtt_egress.metrics_topic
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    #[cfg(test)]
    pub fn with_zones(mut self, zones: Vec<ZoneConfig>) -> Self {
        self.zones = zones;
        self
    }
}
