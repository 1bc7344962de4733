//! Configuration of the simulated device.
//!
//! Values are resolved in three layers: the built in defaults, then an optional TOML file, then
//! environment variables. The file is `vsim.toml` in the working directory unless [`CONFIG_ENV`]
//! names another path.
//!
//! ```toml
//! [address_space]
//! start = 0x1000_0000_0000
//! size = 0x100_0000_0000
//!
//! [granularity]
//! minimum = 0x1000
//! recommended = 0x10000
//!
//! [[device]]
//! name = "sim0"
//! virtual_mem = true
//! memory = 0x4000_0000
//! ```
use std::{env::VarError, fs, io::ErrorKind, path::PathBuf};

use lazy_static::lazy_static;
use log::{debug, error, warn};
use thiserror::Error;
use toml::{Value, map::Map};
use vmem::{VirtAddr, VirtualAddressRange};

/// Environment variable holding the path of the configuration file.
pub const CONFIG_ENV: &str = "VSIM_CONFIG";
/// Environment variable overriding the minimum granularity.
pub const MIN_GRANULARITY_ENV: &str = "VSIM_MIN_GRANULARITY";
/// Environment variable overriding the recommended granularity.
pub const RECOMMENDED_GRANULARITY_ENV: &str = "VSIM_RECOMMENDED_GRANULARITY";
/// Environment variable overriding the first address of the address space.
pub const ADDRESS_SPACE_START_ENV: &str = "VSIM_ADDRESS_SPACE_START";
/// Environment variable overriding the size of the address space.
pub const ADDRESS_SPACE_SIZE_ENV: &str = "VSIM_ADDRESS_SPACE_SIZE";

const DEFAULT_CONFIG_FILE: &str = "vsim.toml";
const DEFAULT_ADDRESS_SPACE_START: usize = 0x1000_0000_0000;
const DEFAULT_ADDRESS_SPACE_SIZE: usize = 0x100_0000_0000;
const DEFAULT_MIN_GRANULARITY: usize = 0x1000;
const DEFAULT_RECOMMENDED_GRANULARITY: usize = 0x10000;
const DEFAULT_DEVICE_MEMORY: usize = 0x4000_0000;

lazy_static! {
    static ref DEFAULT_CONFIG: SimConfig = SimConfig::load().unwrap_or_else(|e| {
        error!("Failed to load simulator configuration, using defaults: {e}");
        SimConfig::default()
    });
}

/// Returns the process wide configuration, loading it on first use.
pub fn default_config() -> &'static SimConfig {
    &DEFAULT_CONFIG
}

/// Errors raised while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("Unable to read {path}: {source}")]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML.
    #[error("Unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value has the wrong type or does not fit with the others.
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// Dotted name of the key, e.g. `granularity.minimum`.
        key: &'static str,
        /// The rejected value.
        value: String,
    },
    /// The named environment variable holds invalid unicode.
    #[error("Environment variable {0} is not valid unicode")]
    NotUnicode(&'static str),
}

/// A simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Name reported for the device.
    pub name: String,
    /// Whether the device can map virtual memory.
    pub virtual_mem: bool,
    /// Bytes of physical memory the device can hand out.
    pub memory: usize,
}

impl DeviceConfig {
    /// Describes a device named `name` with `memory` bytes of physical memory.
    pub fn new(name: impl Into<String>, virtual_mem: bool, memory: usize) -> Self {
        Self {
            name: name.into(),
            virtual_mem,
            memory,
        }
    }
}

/// Configuration of a [`SimulatedBackend`](crate::SimulatedBackend).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// The range reservations are handed out from.
    pub address_space: VirtualAddressRange,
    /// Every size, start and offset must be a multiple of this. A power of two.
    pub minimum_granularity: usize,
    /// Reported as the recommended granularity. A multiple of the minimum.
    pub recommended_granularity: usize,
    /// The simulated devices, in handle order.
    pub devices: Vec<DeviceConfig>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            address_space: VirtualAddressRange::new(
                VirtAddr::new(DEFAULT_ADDRESS_SPACE_START),
                DEFAULT_ADDRESS_SPACE_SIZE,
            ),
            minimum_granularity: DEFAULT_MIN_GRANULARITY,
            recommended_granularity: DEFAULT_RECOMMENDED_GRANULARITY,
            devices: vec![DeviceConfig::new("sim0", true, DEFAULT_DEVICE_MEMORY)],
        }
    }
}

impl SimConfig {
    /// Loads the configuration from the defaults, the configuration file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let (path, explicit) = match read_env(CONFIG_ENV)? {
            Some(path) => (PathBuf::from(path), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        match fs::read_to_string(&path) {
            Ok(contents) => {
                debug!("Reading simulator configuration from {}", path.display());
                config.apply_toml(&contents)?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound && !explicit => {}
            Err(source) => return Err(ConfigError::Io { path, source }),
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from the defaults and a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_toml(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the values present in a TOML document. Unknown sections and keys are ignored.
    pub fn apply_toml(&mut self, contents: &str) -> Result<(), ConfigError> {
        let cfg: Value = toml::from_str(contents)?;

        if let Some(space) = cfg.get("address_space") {
            let space = table(space, "address_space")?;
            let start = get_key(space, "address_space.start", as_usize)?;
            let size = get_key(space, "address_space.size", as_usize)?;
            if let Some(start) = start {
                self.address_space.start = VirtAddr::new(start);
            }
            if let Some(size) = size {
                self.address_space.size = size;
            }
        }

        if let Some(granularity) = cfg.get("granularity") {
            let granularity = table(granularity, "granularity")?;
            if let Some(minimum) = get_key(granularity, "granularity.minimum", as_usize)? {
                self.minimum_granularity = minimum;
            }
            if let Some(recommended) =
                get_key(granularity, "granularity.recommended", as_usize)?
            {
                self.recommended_granularity = recommended;
            }
        }

        if let Some(devices) = cfg.get("device") {
            let devices = devices.as_array().ok_or_else(|| invalid("device", devices))?;
            self.devices = devices
                .iter()
                .map(parse_device)
                .collect::<Result<Vec<_>, _>>()?;
        }

        if let Some(table) = cfg.as_table() {
            for key in table.keys() {
                if !matches!(key.as_str(), "address_space" | "granularity" | "device") {
                    warn!("Ignoring unknown configuration section {key}");
                }
            }
        }
        Ok(())
    }

    /// Applies the `VSIM_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(read_env)
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_with(
        &mut self,
        lookup: impl Fn(&'static str) -> Result<Option<String>, ConfigError>,
    ) -> Result<(), ConfigError> {
        let parse = |key: &'static str| -> Result<Option<usize>, ConfigError> {
            lookup(key)?
                .map(|value| {
                    parse_usize(&value).ok_or(ConfigError::InvalidValue { key, value })
                })
                .transpose()
        };

        if let Some(minimum) = parse(MIN_GRANULARITY_ENV)? {
            self.minimum_granularity = minimum;
        }
        if let Some(recommended) = parse(RECOMMENDED_GRANULARITY_ENV)? {
            self.recommended_granularity = recommended;
        }
        if let Some(start) = parse(ADDRESS_SPACE_START_ENV)? {
            self.address_space.start = VirtAddr::new(start);
        }
        if let Some(size) = parse(ADDRESS_SPACE_SIZE_ENV)? {
            self.address_space.size = size;
        }
        Ok(())
    }

    /// Checks that the values are usable together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let minimum = self.minimum_granularity;
        if !minimum.is_power_of_two() {
            return Err(invalid_value("granularity.minimum", minimum));
        }
        let recommended = self.recommended_granularity;
        if recommended == 0 || recommended % minimum != 0 {
            return Err(invalid_value("granularity.recommended", recommended));
        }
        let start = self.address_space.start;
        if start.is_null() || !start.is_aligned_to(minimum) {
            return Err(invalid_value("address_space.start", start.as_usize()));
        }
        let size = self.address_space.size;
        if size == 0 || size % minimum != 0 || start.checked_add(size).is_none() {
            return Err(invalid_value("address_space.size", size));
        }
        if self.devices.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "device",
                value: "no devices configured".to_string(),
            });
        }
        for device in &self.devices {
            if device.memory % minimum != 0 {
                return Err(invalid_value("device.memory", device.memory));
            }
        }
        Ok(())
    }
}

fn read_env(key: &'static str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode(key)),
    }
}

/// Parses a decimal or `0x` prefixed hexadecimal number. Underscores are allowed as separators.
fn parse_usize(value: &str) -> Option<usize> {
    let value = value.trim().replace('_', "");
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn as_usize(value: &Value) -> Option<usize> {
    match value {
        Value::Integer(i) => usize::try_from(*i).ok(),
        Value::String(s) => parse_usize(s),
        _ => None,
    }
}

fn get_key<T>(
    cfg: &Map<String, Value>,
    key: &'static str,
    convert: fn(&Value) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    let name = key.rsplit('.').next().unwrap_or(key);
    match cfg.get(name) {
        Some(val) => convert(val).map(Some).ok_or_else(|| invalid(key, val)),
        None => Ok(None),
    }
}

fn table<'a>(value: &'a Value, key: &'static str) -> Result<&'a Map<String, Value>, ConfigError> {
    value.as_table().ok_or_else(|| invalid(key, value))
}

fn parse_device(value: &Value) -> Result<DeviceConfig, ConfigError> {
    let device = table(value, "device")?;
    let name = get_key(device, "device.name", |v| v.as_str().map(str::to_string))?
        .ok_or_else(|| invalid("device.name", value))?;
    let virtual_mem = get_key(device, "device.virtual_mem", Value::as_bool)?.unwrap_or(true);
    let memory = get_key(device, "device.memory", as_usize)?.unwrap_or(DEFAULT_DEVICE_MEMORY);
    Ok(DeviceConfig::new(name, virtual_mem, memory))
}

fn invalid(key: &'static str, value: &Value) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    }
}

fn invalid_value(key: &'static str, value: usize) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: format!("{value:#x}"),
    }
}
