//! Config records for the three channel kinds, plus the stats and
//! lifecycle types shared by the runtime manager.
//!
//! Each kind parses in two stages: a `Raw*` struct mirrors the YAML shape
//! loosely (mostly `Option<T>`, tolerant of unknown keys), then
//! `into_config` applies defaulting/validation and fails with
//! `EngineError::Config` on anything a strict schema should reject.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{EngineError, Result};

pub type ChannelName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLifecycleState {
    Disabled,
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct StatsRecord {
    pub processed: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformerType {
    Wrapi,
    Java,
}

impl TransformerType {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "wrapi" => Ok(Self::Wrapi),
            "java" => Ok(Self::Java),
            other => Err(EngineError::Config(format!(
                "unknown transformer type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformerConfig {
    pub kind: TransformerType,
    pub script: Option<PathBuf>,
    pub class: Option<String>,
    pub create_missing: bool,
    pub validate_profile: bool,
}

#[derive(Debug, Clone)]
pub struct ErrorHandlingConfig {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub move_to_error: bool,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            retry_count: 0,
            retry_delay_ms: 0,
            move_to_error: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct TranslateConfig {
    pub name: ChannelName,
    pub enabled: bool,
    pub input_dir: PathBuf,
    pub error_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub destinations: Vec<PathBuf>,
    pub input_pattern: String,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub transformer: TransformerConfig,
    pub error_handling: ErrorHandlingConfig,
    pub archive: ArchiveConfig,
}

impl TranslateConfig {
    /// Mirrors the first `destinations` entry: once resolved, `destinations`
    /// is authoritative and `outputDir` is just a view onto its first
    /// element.
    pub fn output_dir(&self) -> Option<&Path> {
        self.destinations.first().map(|p| p.as_path())
    }
}

#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub name: ChannelName,
    pub enabled: bool,
    pub port: u16,
    pub save_dir: PathBuf,
    pub file_prefix: String,
    pub file_suffix: String,
    pub auto_ack: bool,
}

#[derive(Debug, Clone)]
pub struct OutboundConfig {
    pub name: ChannelName,
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub source_dir: PathBuf,
    pub pattern: String,
    pub wait_for_ack: bool,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub error_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub concurrent_sends: usize,
}

/// Accepts `true`/`false`/`yes`/`no` case-insensitively. `serde_yaml`
/// itself only recognizes the literal `true`/`false` scalars, so this
/// wrapper widens that at the boundary.
#[derive(Debug, Clone, Copy)]
struct FlexBool(bool);

impl<'de> Deserialize<'de> for FlexBool {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bool(bool),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bool(b) => Ok(FlexBool(b)),
            Repr::Text(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" => Ok(FlexBool(true)),
                "false" | "no" => Ok(FlexBool(false)),
                other => Err(serde::de::Error::custom(format!(
                    "expected true/false/yes/no, got '{other}'"
                ))),
            },
        }
    }
}

/// A `destinations` entry, accepting block form (`- path: X`) or shorthand
/// (`- X`).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DestinationEntry {
    Shorthand(String),
    Block { path: String },
}

impl DestinationEntry {
    fn into_path(self) -> String {
        match self {
            Self::Shorthand(s) => s,
            Self::Block { path } => path,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransformerConfig {
    #[serde(rename = "type")]
    kind: String,
    script: Option<String>,
    class: Option<String>,
    create_missing: Option<FlexBool>,
    validate_profile: Option<FlexBool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawErrorHandlingConfig {
    retry_count: Option<i64>,
    retry_delay_ms: Option<i64>,
    move_to_error: Option<FlexBool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArchiveConfig {
    enabled: Option<FlexBool>,
    compress: Option<FlexBool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTranslateConfig {
    name: String,
    enabled: Option<FlexBool>,
    input_dir: String,
    error_dir: Option<String>,
    archive_dir: Option<String>,
    destinations: Option<Vec<DestinationEntry>>,
    output_dir: Option<String>,
    input_pattern: Option<String>,
    poll_interval_ms: Option<i64>,
    batch_size: Option<i64>,
    transformer: Option<RawTransformerConfig>,
    error_handling: Option<RawErrorHandlingConfig>,
    archive: Option<RawArchiveConfig>,
}

impl RawTranslateConfig {
    pub fn into_config(self) -> Result<TranslateConfig> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("channel name must not be empty".into()));
        }

        let destinations: Vec<PathBuf> = match (self.destinations, self.output_dir) {
            (Some(list), _) if !list.is_empty() => {
                list.into_iter().map(|e| PathBuf::from(e.into_path())).collect()
            }
            (_, Some(single)) => vec![PathBuf::from(single)],
            _ => {
                return Err(EngineError::Config(format!(
                    "channel '{}' needs 'destinations' or 'outputDir'",
                    self.name
                )))
            }
        };

        let poll_interval_ms = match self.poll_interval_ms {
            Some(v) if v >= 200 => v as u64,
            Some(v) => {
                return Err(EngineError::Config(format!(
                    "channel '{}': pollIntervalMs must be >= 200, got {v}",
                    self.name
                )))
            }
            None => 1000,
        };

        let batch_size = match self.batch_size {
            Some(v) if v >= 1 => v as usize,
            Some(v) => {
                return Err(EngineError::Config(format!(
                    "channel '{}': batchSize must be >= 1, got {v}",
                    self.name
                )))
            }
            None => 10,
        };

        let transformer = match self.transformer {
            Some(raw) => TransformerConfig {
                kind: TransformerType::parse(&raw.kind)?,
                script: raw.script.map(PathBuf::from),
                class: raw.class,
                create_missing: raw.create_missing.map(|b| b.0).unwrap_or(false),
                validate_profile: raw.validate_profile.map(|b| b.0).unwrap_or(false),
            },
            None => {
                return Err(EngineError::Config(format!(
                    "channel '{}' is missing a 'transformer' block",
                    self.name
                )))
            }
        };

        let error_handling = self
            .error_handling
            .map(|raw| -> Result<ErrorHandlingConfig> {
                let retry_count = match raw.retry_count {
                    Some(v) if v >= 0 => v as u32,
                    Some(v) => {
                        return Err(EngineError::Config(format!(
                            "channel '{}': retryCount must be >= 0, got {v}",
                            self.name
                        )))
                    }
                    None => 0,
                };
                let retry_delay_ms = match raw.retry_delay_ms {
                    Some(v) if v >= 0 => v as u64,
                    Some(v) => {
                        return Err(EngineError::Config(format!(
                            "channel '{}': retryDelayMs must be >= 0, got {v}",
                            self.name
                        )))
                    }
                    None => 0,
                };
                Ok(ErrorHandlingConfig {
                    retry_count,
                    retry_delay_ms,
                    move_to_error: raw.move_to_error.map(|b| b.0).unwrap_or(true),
                })
            })
            .transpose()?
            .unwrap_or_default();

        let archive = self
            .archive
            .map(|raw| ArchiveConfig {
                enabled: raw.enabled.map(|b| b.0).unwrap_or(false),
                compress: raw.compress.map(|b| b.0).unwrap_or(false),
            })
            .unwrap_or_default();

        Ok(TranslateConfig {
            name: self.name,
            enabled: self.enabled.map(|b| b.0).unwrap_or(true),
            input_dir: PathBuf::from(self.input_dir),
            error_dir: self.error_dir.map(PathBuf::from),
            archive_dir: self.archive_dir.map(PathBuf::from),
            destinations,
            input_pattern: self.input_pattern.unwrap_or_else(|| "*.hl7".to_string()),
            poll_interval_ms,
            batch_size,
            transformer,
            error_handling,
            archive,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInboundConfig {
    name: String,
    enabled: Option<FlexBool>,
    port: i64,
    save_dir: String,
    file_prefix: Option<String>,
    file_suffix: Option<String>,
    auto_ack: Option<FlexBool>,
}

impl RawInboundConfig {
    pub fn into_config(self) -> Result<InboundConfig> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("channel name must not be empty".into()));
        }
        let port = validate_port(&self.name, self.port)?;
        Ok(InboundConfig {
            name: self.name,
            enabled: self.enabled.map(|b| b.0).unwrap_or(true),
            port,
            save_dir: PathBuf::from(self.save_dir),
            file_prefix: self.file_prefix.unwrap_or_default(),
            file_suffix: self.file_suffix.unwrap_or_else(|| ".hl7".to_string()),
            auto_ack: self.auto_ack.map(|b| b.0).unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOutboundConfig {
    name: String,
    enabled: Option<FlexBool>,
    host: String,
    port: i64,
    source_dir: String,
    pattern: Option<String>,
    wait_for_ack: Option<FlexBool>,
    connect_timeout_ms: Option<i64>,
    read_timeout_ms: Option<i64>,
    poll_interval_ms: Option<i64>,
    error_dir: Option<String>,
    archive_dir: Option<String>,
    concurrent_sends: Option<i64>,
}

impl RawOutboundConfig {
    pub fn into_config(self) -> Result<OutboundConfig> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("channel name must not be empty".into()));
        }
        let port = validate_port(&self.name, self.port)?;
        let poll_interval_ms = match self.poll_interval_ms {
            Some(v) if v >= 200 => v as u64,
            Some(v) => {
                return Err(EngineError::Config(format!(
                    "channel '{}': pollIntervalMs must be >= 200, got {v}",
                    self.name
                )))
            }
            None => 1000,
        };
        let concurrent_sends = match self.concurrent_sends {
            Some(v) if v >= 1 => v as usize,
            Some(v) => {
                return Err(EngineError::Config(format!(
                    "channel '{}': concurrentSends must be >= 1, got {v}",
                    self.name
                )))
            }
            None => 1,
        };
        Ok(OutboundConfig {
            name: self.name,
            enabled: self.enabled.map(|b| b.0).unwrap_or(true),
            host: self.host,
            port,
            source_dir: PathBuf::from(self.source_dir),
            pattern: self.pattern.unwrap_or_else(|| "*.hl7".to_string()),
            wait_for_ack: self.wait_for_ack.map(|b| b.0).unwrap_or(true),
            connect_timeout_ms: self.connect_timeout_ms.unwrap_or(5000).max(0) as u64,
            read_timeout_ms: self.read_timeout_ms.unwrap_or(5000).max(0) as u64,
            poll_interval_ms,
            error_dir: self.error_dir.map(PathBuf::from),
            archive_dir: self.archive_dir.map(PathBuf::from),
            concurrent_sends,
        })
    }
}

fn validate_port(channel_name: &str, port: i64) -> Result<u16> {
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(EngineError::Config(format!(
            "channel '{channel_name}': port must be in 1..=65535, got {port}"
        )))
    }
}
