//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use peoplespot_core::pipeline::{DEFAULT_CONFIDENCE, EncodeMode};

/// Server configuration, read from `PEOPLESPOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// ONNX detection model
    pub model: PathBuf,
    /// Directory annotated videos are written to
    pub output_dir: PathBuf,
    /// Max upload size in bytes
    pub max_upload_bytes: usize,
    /// Initial slider value on the form and fallback when `conf` is omitted
    pub default_confidence: f32,
    /// Encode frames as they are annotated instead of buffering the video
    pub streaming: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
            model: PathBuf::from("yolo12n.onnx"),
            output_dir: PathBuf::from("."),
            max_upload_bytes: 512 * 1024 * 1024, // 512MB
            default_confidence: DEFAULT_CONFIDENCE,
            streaming: false,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults
    /// for anything missing or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("PEOPLESPOT_HOST").unwrap_or(defaults.host),
            port: env_parse("PEOPLESPOT_PORT").unwrap_or(defaults.port),
            model: std::env::var("PEOPLESPOT_MODEL")
                .map(PathBuf::from)
                .unwrap_or(defaults.model),
            output_dir: std::env::var("PEOPLESPOT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            max_upload_bytes: env_parse::<usize>("PEOPLESPOT_MAX_UPLOAD_MB")
                .map(|mb| mb.saturating_mul(1024 * 1024))
                .unwrap_or(defaults.max_upload_bytes),
            default_confidence: env_parse::<f32>("PEOPLESPOT_DEFAULT_CONFIDENCE")
                .filter(|c| !c.is_nan())
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(defaults.default_confidence),
            streaming: std::env::var("PEOPLESPOT_STREAMING")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.streaming),
        }
    }

    pub fn encode_mode(&self) -> EncodeMode {
        if self.streaming {
            EncodeMode::Streaming
        } else {
            EncodeMode::Buffered
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_form_interface() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 7860);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.default_confidence, 0.45);
        assert_eq!(config.encode_mode(), EncodeMode::Buffered);
        assert_eq!(config.bind_addr().unwrap().port(), 7860);
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag("1"));
        assert!(parse_flag(" TRUE "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("nope"));
    }

    #[test]
    fn bad_host_is_reported() {
        let config = ServerConfig {
            host: "not a host".into(),
            ..ServerConfig::default()
        };
        assert!(config.bind_addr().is_err());
    }
}
