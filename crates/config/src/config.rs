//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: u64 = 1024 * 1024;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Scheduling-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Number of encode slots (0 = derive from CPU count)
    #[serde(default)]
    pub workers: u32,
    /// Upper bound on the coordinator's sleep between ticks
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Never wait for RAM to free up before falling back to disk staging
    #[serde(default)]
    pub no_wait: bool,
    /// Order jobs by ascending file size at admission
    #[serde(default)]
    pub sort_by_size: bool,
}

fn default_tick_interval_ms() -> u64 {
    100
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            tick_interval_ms: default_tick_interval_ms(),
            no_wait: false,
            sort_by_size: false,
        }
    }
}

/// RAM budget configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryConfig {
    /// Maximum RAM (GB) the cache may occupy, before the safety reserve
    #[serde(default = "default_max_ram_load_gb")]
    pub max_ram_load_gb: f64,
    /// RAM (GB) always left to the rest of the system
    #[serde(default = "default_safe_ram_reserve_gb")]
    pub safe_ram_reserve_gb: f64,
    /// Files at or above this size (GB) are never read into RAM
    #[serde(default = "default_max_single_file_gb")]
    pub max_single_file_gb: f64,
    /// How long a RAM acquisition waits for memory before staging to disk
    #[serde(default = "default_ram_wait_timeout_secs")]
    pub ram_wait_timeout_secs: u64,
    /// Poll interval while waiting for memory
    #[serde(default = "default_ram_wait_interval_ms")]
    pub ram_wait_interval_ms: u64,
}

fn default_max_ram_load_gb() -> f64 {
    12.0
}

fn default_safe_ram_reserve_gb() -> f64 {
    3.0
}

fn default_max_single_file_gb() -> f64 {
    12.0
}

fn default_ram_wait_timeout_secs() -> u64 {
    30
}

fn default_ram_wait_interval_ms() -> u64 {
    500
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_ram_load_gb: default_max_ram_load_gb(),
            safe_ram_reserve_gb: default_safe_ram_reserve_gb(),
            max_single_file_gb: default_max_single_file_gb(),
            ram_wait_timeout_secs: default_ram_wait_timeout_secs(),
            ram_wait_interval_ms: default_ram_wait_interval_ms(),
        }
    }
}

impl MemoryConfig {
    /// Aggregate RAM budget in bytes (`max_ram_load - safe_ram_reserve`, floored at 0)
    pub fn ram_budget_bytes(&self) -> u64 {
        gb_to_bytes(self.max_ram_load_gb - self.safe_ram_reserve_gb)
    }

    /// Single-file RAM cap in bytes
    pub fn max_single_file_bytes(&self) -> u64 {
        gb_to_bytes(self.max_single_file_gb)
    }
}

/// Convert a GB figure to bytes, clamping negatives to zero
pub fn gb_to_bytes(gb: f64) -> u64 {
    if gb <= 0.0 || !gb.is_finite() {
        0
    } else {
        (gb * GIB) as u64
    }
}

/// Convert bytes to GB
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / GIB
}

/// Source acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IoConfig {
    /// Parent of the staging directory (system temp dir if unset)
    #[serde(default)]
    pub cache_root: Option<PathBuf>,
    /// Read chunk size for RAM acquisition (MiB)
    #[serde(default = "default_ram_chunk_mib")]
    pub ram_chunk_mib: u64,
    /// Copy chunk size for disk staging (MiB)
    #[serde(default = "default_disk_chunk_mib")]
    pub disk_chunk_mib: u64,
    /// Stage sources even when they live on a low-latency device
    #[serde(default)]
    pub stage_low_latency_sources: bool,
}

fn default_ram_chunk_mib() -> u64 {
    64
}

fn default_disk_chunk_mib() -> u64 {
    32
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            cache_root: None,
            ram_chunk_mib: default_ram_chunk_mib(),
            disk_chunk_mib: default_disk_chunk_mib(),
            stage_low_latency_sources: false,
        }
    }
}

impl IoConfig {
    pub fn ram_chunk_bytes(&self) -> usize {
        (self.ram_chunk_mib.max(1) * MIB) as usize
    }

    pub fn disk_chunk_bytes(&self) -> usize {
        (self.disk_chunk_mib.max(1) * MIB) as usize
    }

    /// Directory the staging directory is created under
    pub fn resolved_cache_root(&self) -> PathBuf {
        self.cache_root.clone().unwrap_or_else(env::temp_dir)
    }
}

/// Encoder invocation configuration
///
/// `args` is passed through untouched; the engine only adds input, output
/// and progress reporting flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_probe_program")]
    pub probe_program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Appended to the source file stem to form the final output name
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
    /// Outputs smaller than this are treated as failed encodes
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// Grace period between asking the encoder to quit and killing it
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Number of trailing encoder output lines kept for failure diagnostics
    #[serde(default = "default_diagnostic_lines")]
    pub diagnostic_lines: usize,
    /// Benchmark mode: encode, measure, then delete the output
    #[serde(default)]
    pub discard_output: bool,
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_probe_program() -> String {
    "ffprobe".to_string()
}

fn default_args() -> Vec<String> {
    ["-c:v", "libx264", "-crf", "23", "-preset", "medium", "-c:a", "copy"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_output_suffix() -> String {
    "_encoded".to_string()
}

fn default_output_extension() -> String {
    "mp4".to_string()
}

fn default_min_output_bytes() -> u64 {
    1024
}

fn default_stop_grace_ms() -> u64 {
    3000
}

fn default_diagnostic_lines() -> usize {
    30
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            probe_program: default_probe_program(),
            args: default_args(),
            output_suffix: default_output_suffix(),
            output_extension: default_output_extension(),
            min_output_bytes: default_min_output_bytes(),
            stop_grace_ms: default_stop_grace_ms(),
            diagnostic_lines: default_diagnostic_lines(),
            discard_output: false,
        }
    }
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and fills missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - TIERCAST_WORKERS -> scheduler.workers
    /// - TIERCAST_NO_WAIT -> scheduler.no_wait
    /// - TIERCAST_MAX_RAM_GB -> memory.max_ram_load_gb
    /// - TIERCAST_RAM_RESERVE_GB -> memory.safe_ram_reserve_gb
    /// - TIERCAST_CACHE_ROOT -> io.cache_root
    /// - TIERCAST_ENCODER -> encoder.program
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TIERCAST_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.scheduler.workers = workers;
            }
        }

        if let Ok(val) = env::var("TIERCAST_NO_WAIT") {
            if let Some(flag) = parse_bool(&val) {
                self.scheduler.no_wait = flag;
            }
        }

        if let Ok(val) = env::var("TIERCAST_MAX_RAM_GB") {
            if let Ok(gb) = val.parse::<f64>() {
                self.memory.max_ram_load_gb = gb;
            }
        }

        if let Ok(val) = env::var("TIERCAST_RAM_RESERVE_GB") {
            if let Ok(gb) = val.parse::<f64>() {
                self.memory.safe_ram_reserve_gb = gb;
            }
        }

        if let Ok(val) = env::var("TIERCAST_CACHE_ROOT") {
            if !val.is_empty() {
                self.io.cache_root = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("TIERCAST_ENCODER") {
            if !val.is_empty() {
                self.encoder.program = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
