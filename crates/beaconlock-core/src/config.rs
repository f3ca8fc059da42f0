//! Daemon configuration management.
//!
//! Handles loading and validating beaconlock configuration including:
//! - The beacon to track and the adapter to reach it through
//! - Radio connection parameters and request timeouts
//! - Proximity thresholds and RSSI hysteresis bands
//! - Distance model calibration
//! - The screen-locker command and the displays it covers
//!
//! Configuration is read from a TOML file (missing file means defaults) and
//! then overridden by `BEACONLOCK_`-prefixed environment variables, using
//! `__` to separate nested keys (`BEACONLOCK_DEVICE__ADDRESS`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::distance::DistanceModel;
use crate::types::{
    is_valid_mac_address, ll_version, AddressType, BeaconAddress, BeaconDevice, InvalidAddress,
};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "BEACONLOCK";

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    Validation {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration errors: {}", .0.len(), join_errors(.0))]
    MultipleValidation(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Beacon identity and adapter.
    pub device: DeviceConfig,
    /// Connection establishment parameters.
    pub radio: RadioParams,
    /// Per-request link-layer timeouts.
    pub timeouts: TimeoutsConfig,
    /// Presence decision thresholds.
    pub proximity: ProximityConfig,
    /// Distance model constants.
    pub calibration: CalibrationConfig,
    /// Screen locker settings.
    pub lock: LockConfig,
    /// Link setup retry policy.
    pub setup: SetupConfig,
}

/// The tracked beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Local controller name, e.g. `hci0`.
    pub adapter: String,
    /// Beacon address in `XX:XX:XX:XX:XX:XX` form.
    pub address: String,
    /// Beacon address type.
    pub address_type: AddressType,
    /// Lowest acceptable remote link-layer version code.
    pub min_link_layer_version: u8,
    /// Request link encryption after connecting.
    pub encrypt: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_string(),
            address: "00:07:80:7F:59:9E".to_string(),
            address_type: AddressType::Public,
            min_link_layer_version: ll_version::CORE_4_0,
            encrypt: false,
        }
    }
}

/// LE connection parameters, in controller units.
///
/// Scan and connection intervals are in 0.625 ms and 1.25 ms slots
/// respectively; the supervision timeout is in 10 ms units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioParams {
    /// LE scan interval.
    pub scan_interval: u16,
    /// LE scan window.
    pub scan_window: u16,
    /// Only connect to whitelisted peers.
    pub use_whitelist: bool,
    /// Own address type.
    pub own_address_type: AddressType,
    /// Minimum connection interval.
    pub conn_interval_min: u16,
    /// Maximum connection interval.
    pub conn_interval_max: u16,
    /// Peripheral latency in connection events.
    pub latency: u16,
    /// Link supervision timeout.
    pub supervision_timeout: u16,
    /// Minimum connection event length.
    pub min_ce_length: u16,
    /// Maximum connection event length.
    pub max_ce_length: u16,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            scan_interval: 0x0004,
            scan_window: 0x0004,
            use_whitelist: true,
            own_address_type: AddressType::Public,
            conn_interval_min: 0x000F,
            conn_interval_max: 0x000F,
            latency: 0x0000,
            supervision_timeout: 0x0C80,
            min_ce_length: 0x0001,
            max_ce_length: 0x0001,
        }
    }
}

/// Request timeouts in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Whitelist add.
    pub whitelist_ms: u64,
    /// Connection establishment.
    pub connect_ms: u64,
    /// Disconnect.
    pub disconnect_ms: u64,
    /// RSSI read.
    pub rssi_ms: u64,
    /// Remote version read.
    pub version_ms: u64,
    /// Encryption request.
    pub encrypt_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            whitelist_ms: 1_000,
            connect_ms: 25_000,
            disconnect_ms: 10_000,
            rssi_ms: 1_000,
            version_ms: 2_000,
            encrypt_ms: 10_000,
        }
    }
}

/// Timeouts as [`Duration`]s, the form [`crate::link::DeviceController`] consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeouts {
    /// Whitelist add.
    pub whitelist: Duration,
    /// Connection establishment.
    pub connect: Duration,
    /// Disconnect.
    pub disconnect: Duration,
    /// RSSI read.
    pub rssi: Duration,
    /// Remote version read.
    pub version: Duration,
    /// Encryption request.
    pub encrypt: Duration,
}

impl From<TimeoutsConfig> for LinkTimeouts {
    fn from(t: TimeoutsConfig) -> Self {
        Self {
            whitelist: Duration::from_millis(t.whitelist_ms),
            connect: Duration::from_millis(t.connect_ms),
            disconnect: Duration::from_millis(t.disconnect_ms),
            rssi: Duration::from_millis(t.rssi_ms),
            version: Duration::from_millis(t.version_ms),
            encrypt: Duration::from_millis(t.encrypt_ms),
        }
    }
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        TimeoutsConfig::default().into()
    }
}

/// Inclusive RSSI range in dBm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssiBand {
    /// Lowest accepted sample.
    pub min: i8,
    /// Highest accepted sample.
    pub max: i8,
}

impl RssiBand {
    /// Create a band; `min` and `max` are both inclusive.
    #[must_use]
    pub const fn new(min: i8, max: i8) -> Self {
        Self { min, max }
    }

    /// Returns `true` if `rssi` lies within the band.
    #[must_use]
    pub const fn contains(&self, rssi: i8) -> bool {
        self.min <= rssi && rssi <= self.max
    }
}

/// Presence decision settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// Delay between polling cycles.
    pub poll_interval_ms: u64,
    /// Estimated distance at or beyond which the beacon has left.
    pub departure_distance: f64,
    /// RSSI band a departure sample must also fall in.
    pub departure_band: RssiBand,
    /// Estimated distance at or within which the beacon has returned.
    pub arrival_distance: f64,
    /// RSSI band an arrival sample must also fall in.
    pub arrival_band: RssiBand,
    /// Consecutive failed reads before the beacon is considered lost.
    pub max_consecutive_read_failures: u32,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            departure_distance: 2.0,
            departure_band: RssiBand::new(-75, -71),
            arrival_distance: 2.0,
            arrival_band: RssiBand::new(-70, -30),
            max_consecutive_read_failures: 5,
        }
    }
}

impl ProximityConfig {
    /// The polling interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Distance model constants (see [`DistanceModel`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// RSSI measured at the reference distance.
    pub reference_rssi: f64,
    /// Far-field multiplier.
    pub a: f64,
    /// Far-field exponent.
    pub b: f64,
    /// Far-field offset.
    pub c: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let model = DistanceModel::default();
        Self {
            reference_rssi: model.reference_rssi,
            a: model.a,
            b: model.b,
            c: model.c,
        }
    }
}

impl From<CalibrationConfig> for DistanceModel {
    fn from(c: CalibrationConfig) -> Self {
        Self {
            reference_rssi: c.reference_rssi,
            a: c.a,
            b: c.b,
            c: c.c,
        }
    }
}

/// Screen locker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Locker program and arguments; must stay in the foreground.
    pub command: Vec<String>,
    /// X displays to lock, one locker per display.
    pub displays: Vec<String>,
    /// How long a new locker must keep running to count as holding its display.
    pub startup_grace_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            command: vec!["i3lock".to_string(), "--nofork".to_string()],
            displays: vec![":0".to_string()],
            startup_grace_ms: 200,
        }
    }
}

impl LockConfig {
    /// [`Self::startup_grace_ms`] as a [`Duration`].
    #[must_use]
    pub const fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

/// Retry policy for transient link setup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// Total connection attempts, including the first.
    pub attempts: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub backoff_ms: u64,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl SetupConfig {
    /// Delay before retry number `retry` (starting at 1).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

impl Config {
    /// Load configuration from `path` (or the default location) plus
    /// environment overrides, then validate it.
    ///
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or validation fails.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let path = path.map_or_else(default_config_path, Path::to_path_buf);
        tracing::debug!(path = %path.display(), "Loading configuration");

        let loaded: Self = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Load configuration from a TOML string without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or validation fails.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let loaded: Self = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Render the configuration as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The beacon described by `[device]`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the address is malformed.
    pub fn beacon(&self) -> ConfigResult<BeaconDevice> {
        let address: BeaconAddress = self
            .device
            .address
            .parse()
            .map_err(|e: InvalidAddress| invalid("device.address", e.to_string()))?;
        Ok(BeaconDevice {
            address,
            address_type: self.device.address_type,
        })
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::Validation`] or a
    /// [`ConfigError::MultipleValidation`] listing every problem.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.device.adapter.trim().is_empty() {
            errors.push(invalid("device.adapter", "must not be empty"));
        }
        if !is_valid_mac_address(&self.device.address) {
            errors.push(invalid(
                "device.address",
                "must be in format XX:XX:XX:XX:XX:XX",
            ));
        }

        let radio = &self.radio;
        if radio.scan_window > radio.scan_interval {
            errors.push(invalid(
                "radio.scan_window",
                format!(
                    "window {:#06x} exceeds interval {:#06x}",
                    radio.scan_window, radio.scan_interval
                ),
            ));
        }
        if radio.conn_interval_min > radio.conn_interval_max {
            errors.push(invalid(
                "radio.conn_interval_min",
                "must not exceed conn_interval_max",
            ));
        }
        if radio.min_ce_length > radio.max_ce_length {
            errors.push(invalid("radio.min_ce_length", "must not exceed max_ce_length"));
        }

        let p = &self.proximity;
        if p.poll_interval_ms == 0 {
            errors.push(invalid("proximity.poll_interval_ms", "must be positive"));
        }
        for (field, distance) in [
            ("proximity.departure_distance", p.departure_distance),
            ("proximity.arrival_distance", p.arrival_distance),
        ] {
            if !distance.is_finite() || distance <= 0.0 {
                errors.push(invalid(
                    field,
                    format!("must be a positive distance, got {distance}"),
                ));
            }
        }
        for (field, band) in [
            ("proximity.departure_band", p.departure_band),
            ("proximity.arrival_band", p.arrival_band),
        ] {
            if band.min > band.max {
                errors.push(invalid(
                    field,
                    format!("min {} exceeds max {}", band.min, band.max),
                ));
            }
            if band.max > 0 {
                errors.push(invalid(
                    field,
                    format!("max {} must be at most 0 dBm", band.max),
                ));
            }
        }
        if p.max_consecutive_read_failures == 0 {
            errors.push(invalid(
                "proximity.max_consecutive_read_failures",
                "must be at least 1",
            ));
        }

        let cal = &self.calibration;
        if !(cal.reference_rssi.is_finite() && cal.reference_rssi < 0.0) {
            errors.push(invalid(
                "calibration.reference_rssi",
                format!("must be negative, got {}", cal.reference_rssi),
            ));
        }
        if !(cal.a.is_finite() && cal.a > 0.0) {
            errors.push(invalid(
                "calibration.a",
                format!("must be positive, got {}", cal.a),
            ));
        }
        if !(cal.b.is_finite() && cal.b > 0.0) {
            errors.push(invalid(
                "calibration.b",
                format!("must be positive, got {}", cal.b),
            ));
        }
        if !cal.c.is_finite() {
            errors.push(invalid("calibration.c", "must be finite"));
        }

        if self.lock.command.first().map_or(true, |c| c.trim().is_empty()) {
            errors.push(invalid("lock.command", "must name a program"));
        }
        if self.lock.displays.is_empty() {
            errors.push(invalid("lock.displays", "must list at least one display"));
        }
        if self.lock.startup_grace_ms == 0 {
            errors.push(invalid("lock.startup_grace_ms", "must be positive"));
        }

        if self.setup.attempts == 0 {
            errors.push(invalid("setup.attempts", "must be at least 1"));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidation(errors)),
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Get the default configuration file path.
#[must_use]
pub fn default_config_path() -> PathBuf {
    // Installed: /etc/beaconlock/config.toml
    // Elsewhere: the platform config directory
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/beaconlock/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "beaconlock").map_or_else(
            || PathBuf::from("config.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}
