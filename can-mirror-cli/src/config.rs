//! Session configuration loading and parsing

use anyhow::{bail, Context, Result};
use can_mirror_core::{
    default_variants, AcquisitionConfig, MirrorRule, SignalLoggerConfig, TraceConfig,
    TransmitEntry, Variant, DEFAULT_SELECTOR_ID,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration (loaded from session.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub trace: Option<TraceSection>,
    #[serde(default)]
    pub mirror: MirrorSection,
    #[serde(default)]
    pub loggers: Vec<LoggerSection>,
    #[serde(default)]
    pub transmit: TransmitSection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Linux SocketCAN interface
    #[default]
    Socketcan,
    /// No hardware; useful to check a configuration
    Simulated,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

fn default_channel() -> String {
    "can0".to_string()
}

fn default_bitrate() -> u32 {
    250_000
}

fn default_reconnect_backoff_ms() -> u64 {
    800
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            channel: default_channel(),
            bitrate: default_bitrate(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

impl BusConfig {
    pub fn acquisition(&self) -> AcquisitionConfig {
        AcquisitionConfig::new(self.channel.clone())
            .with_bitrate(self.bitrate)
            .with_reconnect_backoff(Duration::from_millis(self.reconnect_backoff_ms))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceSection {
    pub path: PathBuf,
    #[serde(flatten)]
    pub settings: TraceConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MirrorSection {
    #[serde(default)]
    pub rules: Vec<MirrorRule>,
}

/// One `[[loggers]]` entry
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LoggerSection {
    /// Fixed database loaded at start
    Eager {
        dbc: PathBuf,
        output_dir: PathBuf,
        #[serde(default)]
        file_prefix: Option<String>,
        #[serde(default = "default_interval_ms")]
        interval_ms: u64,
    },
    /// Database chosen by the first recognized selector frame
    Selector {
        #[serde(default = "default_selector_id")]
        selector_id: u32,
        output_dir: PathBuf,
        /// Directory of the built-in variant databases
        #[serde(default)]
        dbc_dir: Option<PathBuf>,
        /// Replaces the built-in variant map when not empty
        #[serde(default)]
        variants: Vec<VariantSection>,
        #[serde(default = "default_interval_ms")]
        interval_ms: u64,
    },
}

fn default_interval_ms() -> u64 {
    500
}

fn default_selector_id() -> u32 {
    DEFAULT_SELECTOR_ID
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VariantSection {
    /// First payload byte of the selector frame
    pub selector: u8,
    pub name: String,
    pub dbc: PathBuf,
}

impl LoggerSection {
    pub fn logger_config(&self) -> SignalLoggerConfig {
        match self {
            LoggerSection::Eager { output_dir, file_prefix, interval_ms, .. } => {
                let config = SignalLoggerConfig::new(output_dir)
                    .with_interval(Duration::from_millis(*interval_ms));
                match file_prefix {
                    Some(prefix) => config.with_prefix(prefix.clone()),
                    None => config,
                }
            }
            LoggerSection::Selector { output_dir, interval_ms, .. } => {
                SignalLoggerConfig::new(output_dir).with_interval(Duration::from_millis(*interval_ms))
            }
        }
    }

    /// Variant map of a selector logger
    pub fn variant_map(&self) -> BTreeMap<u8, Variant> {
        match self {
            LoggerSection::Selector { dbc_dir, variants, .. } if variants.is_empty() => {
                default_variants(dbc_dir.as_deref().unwrap_or(Path::new(".")))
            }
            LoggerSection::Selector { variants, .. } => variants
                .iter()
                .map(|v| (v.selector, Variant::new(v.name.clone(), v.dbc.clone())))
                .collect(),
            LoggerSection::Eager { .. } => BTreeMap::new(),
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        match self {
            LoggerSection::Eager { dbc, output_dir, .. } => {
                *dbc = resolve(base, dbc);
                *output_dir = resolve(base, output_dir);
            }
            LoggerSection::Selector { output_dir, dbc_dir, variants, .. } => {
                *output_dir = resolve(base, output_dir);
                *dbc_dir = Some(resolve(base, dbc_dir.as_deref().unwrap_or(Path::new("."))));
                for variant in variants {
                    variant.dbc = resolve(base, &variant.dbc);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransmitSection {
    /// JSON file the transmit list is loaded from and saved to
    #[serde(default)]
    pub history: Option<PathBuf>,
    #[serde(default)]
    pub entries: Vec<TransmitEntry>,
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl AppConfig {
    /// Check rules and identifiers before any hardware is touched
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for rule in &self.mirror.rules {
            if !seen.insert(rule.rx_id) {
                bail!("Mirror rule for 0x{:X} defined twice", rule.rx_id);
            }
            let limit = if rule.extended { 0x1FFF_FFFF } else { 0x7FF };
            if rule.tx_id > limit {
                bail!("Mirror target 0x{:X} does not fit its identifier type", rule.tx_id);
            }
        }

        for (idx, entry) in self.transmit.entries.iter().enumerate() {
            entry
                .frame()
                .with_context(|| format!("Invalid transmit entry #{}", idx + 1))?;
        }

        if let Some(trace) = &self.trace {
            if trace.settings.max_file_size == 0 {
                bail!("trace.max_file_size must be greater than zero");
            }
        }
        Ok(())
    }

    /// Make relative paths relative to the configuration file
    fn resolve_paths(&mut self, base: &Path) {
        if let Some(trace) = self.trace.as_mut() {
            trace.path = resolve(base, &trace.path);
        }
        for logger in &mut self.loggers {
            logger.resolve_paths(base);
        }
        if let Some(history) = self.transmit.history.as_mut() {
            *history = resolve(base, history);
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    let base = path.parent().unwrap_or(Path::new("."));
    config.resolve_paths(base);
    config.validate()?;

    Ok(config)
}
