//! Server configuration loading from file and environment variables.

use holo_session::{InvalidConfig, PipelineConfig};
use holo_types::{CompanionProfile, ParticipantId, Tier};
use holo_voice::engines::HttpGenerationConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Streaming pipeline thresholds. Required; there are no defaults.
    pub pipeline: PipelineConfig,

    /// Which speech and language engines to drive.
    #[serde(default)]
    pub engines: EnginesConfig,

    /// Participant tiers, standing in for the account service.
    #[serde(default)]
    pub entitlements: EntitlementsConfig,

    /// Companion profiles, standing in for the asset service.
    #[serde(default)]
    pub companions: Vec<CompanionProfile>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted audio frame, in bytes, including the timestamp.
    #[serde(default = "default_max_audio_frame_bytes")]
    pub max_audio_frame_bytes: usize,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "holo_session=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Engine selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnginesConfig {
    /// Canned engines for development: every utterance is heard as
    /// `transcript` and answered with `reply`.
    Scripted {
        #[serde(default = "default_scripted_transcript")]
        transcript: String,
        #[serde(default = "default_scripted_reply")]
        reply: Vec<String>,
        /// Pause before each reply chunk, in ms.
        #[serde(default)]
        chunk_delay_ms: u64,
    },
    /// Local recognition and synthesis binaries plus an HTTP language model.
    Local {
        recognition: RecognitionBinaryConfig,
        synthesis: SynthesisBinaryConfig,
        generation: HttpGenerationConfig,
    },
}

/// A whisper.cpp-compatible recognizer.
#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionBinaryConfig {
    pub binary_path: PathBuf,
    pub model_path: PathBuf,
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
}

/// A piper-compatible synthesizer.
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisBinaryConfig {
    pub binary_path: PathBuf,
    pub voices_dir: PathBuf,
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
}

/// Static entitlement table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntitlementsConfig {
    /// Tier for participants not listed in `tiers`.
    #[serde(default)]
    pub default_tier: Tier,

    #[serde(default)]
    pub tiers: HashMap<ParticipantId, Tier>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_max_audio_frame_bytes() -> usize {
    64 * 1024
}

fn default_db_path() -> String {
    "holo.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_scripted_transcript() -> String {
    "hello".to_string()
}

fn default_scripted_reply() -> Vec<String> {
    vec!["Hi there!".to_string()]
}

fn default_engine_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_audio_frame_bytes: default_max_audio_frame_bytes(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self::Scripted {
            transcript: default_scripted_transcript(),
            reply: default_scripted_reply(),
            chunk_delay_ms: 0,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The pipeline section is inconsistent.
    #[error(transparent)]
    Invalid(#[from] InvalidConfig),
}

/// Parses and validates configuration text. No environment overrides.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(contents)?;
    config.pipeline.validate()?;
    Ok(config)
}

/// Loads configuration from a TOML file.
///
/// Unlike the `server`, `database` and `logging` sections, the pipeline
/// thresholds have no defaults, so a missing file is an error.
///
/// Environment variable overrides:
/// - `HOLO_HOST` overrides `server.host`
/// - `HOLO_PORT` overrides `server.port`
/// - `HOLO_DB_PATH` overrides `database.path`
/// - `HOLO_LOG_LEVEL` overrides `logging.level`
/// - `HOLO_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let mut config = parse_config(&contents)?;

    // Environment variable overrides
    if let Ok(host) = std::env::var("HOLO_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("HOLO_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("HOLO_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("HOLO_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("HOLO_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = include_str!("../config.example.toml");

    #[test]
    fn example_config_parses() {
        let config = parse_config(EXAMPLE).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.pipeline.latency.hard_deadline_ms, 2000);
        assert_eq!(config.entitlements.tiers.get("ada"), Some(&Tier::Premium));
        assert_eq!(config.companions.len(), 1);
        assert!(matches!(config.engines, EnginesConfig::Scripted { .. }));
    }

    #[test]
    fn ambient_sections_default() {
        let pipeline_only = EXAMPLE
            .split("[pipeline.latency]")
            .nth(1)
            .map(|rest| format!("[pipeline.latency]{rest}"))
            .unwrap();
        let pipeline_only = pipeline_only
            .split("[engines]")
            .next()
            .unwrap()
            .to_string();
        let config = parse_config(&pipeline_only).unwrap();
        assert_eq!(config.server.host, default_host());
        assert_eq!(config.database.path, "holo.db");
        assert_eq!(config.logging.level, "info");
        assert!(config.companions.is_empty());
        assert_eq!(config.entitlements.default_tier, Tier::Free);
    }

    #[test]
    fn pipeline_section_is_required() {
        let err = parse_config("[server]\nport = 4000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn inconsistent_pipeline_is_rejected() {
        let broken = EXAMPLE.replace(
            "generation_soft_deadline_ms = 800",
            "generation_soft_deadline_ms = 2500",
        );
        assert!(matches!(
            parse_config(&broken).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            load_config(path.to_str().unwrap()).unwrap_err(),
            ConfigError::FileRead(_)
        ));
    }

    #[test]
    fn local_engines_parse() {
        let engines: EnginesConfig = toml::from_str(
            r#"
            kind = "local"
            [recognition]
            binary_path = "/opt/whisper/main"
            model_path = "/opt/whisper/base.en.bin"
            [synthesis]
            binary_path = "/opt/piper/piper"
            voices_dir = "/opt/piper/voices"
            timeout_secs = 10
            [generation]
            base_url = "http://localhost:8080/v1"
            model = "companion-7b"
            "#,
        )
        .unwrap();
        let EnginesConfig::Local {
            recognition,
            synthesis,
            generation,
        } = engines
        else {
            panic!("expected local engines");
        };
        assert_eq!(recognition.timeout_secs, 30);
        assert_eq!(synthesis.timeout_secs, 10);
        assert_eq!(generation.model, "companion-7b");
    }
}
