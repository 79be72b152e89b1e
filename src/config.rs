//! Configuration for the relay service.

use crate::application::orchestrator::PipelineSettings;
use crate::domain::media::{FieldNames, TranscodeOptions, TransportMode};
use std::env;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_UPLOAD_URL: &str = "https://sandbox.luvdav.com/File_Upload/upload.php";
pub const DEFAULT_BRIDGE_CAPACITY: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Serve the HTML upload form at `/`
    pub is_test: bool,
    /// Transcoder executable
    pub ffmpeg_path: PathBuf,
    /// Remote endpoint receiving the transcoded file
    pub upload_url: String,
    /// Parent directory of per-session scratch areas
    pub scratch_dir: PathBuf,
    /// Bytes each stream bridge may hold before writers wait
    pub bridge_capacity: usize,
    pub transport_mode: TransportMode,
    /// Overrides the mode's default transcoder output flags when set
    pub output_options: Option<Vec<String>>,
    pub fields: FieldNames,
}

impl RelayConfig {
    /// Load configuration from `.env` and environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = FieldNames::default();

        Self {
            addr: var("ADDR").unwrap_or_else(|| String::from("127.0.0.1")),
            port: var("PORT").unwrap_or_else(|| String::from("3000")),
            is_test: var("IS_TEST")
                .unwrap_or_else(|| String::from("true"))
                .parse()
                .unwrap_or(true),
            ffmpeg_path: var("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            upload_url: var("UPLOAD_URL").unwrap_or_else(|| String::from(DEFAULT_UPLOAD_URL)),
            scratch_dir: var("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("mediarelay")),
            bridge_capacity: parsed(&var, "BRIDGE_CAPACITY")
                .filter(|capacity| *capacity > 0)
                .unwrap_or(DEFAULT_BRIDGE_CAPACITY),
            transport_mode: parsed(&var, "TRANSPORT_MODE").unwrap_or_default(),
            output_options: var("OUTPUT_OPTIONS")
                .map(|options| options.split_whitespace().map(String::from).collect()),
            fields: FieldNames {
                file: var("FILE_FIELD").unwrap_or(defaults.file),
                name: var("NAME_FIELD").unwrap_or(defaults.name),
            },
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let mut options = TranscodeOptions::for_mode(self.transport_mode);
        if let Some(output_options) = &self.output_options {
            options.output_options = output_options.clone();
        }

        PipelineSettings {
            bridge_capacity: self.bridge_capacity,
            scratch_root: self.scratch_dir.clone(),
            mode: self.transport_mode,
            options,
            fields: self.fields.clone(),
        }
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> RelayConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);

        assert_eq!(config.bind_address(), "127.0.0.1:3000");
        assert!(config.is_test);
        assert_eq!(config.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.upload_url, DEFAULT_UPLOAD_URL);
        assert_eq!(config.bridge_capacity, DEFAULT_BRIDGE_CAPACITY);
        assert_eq!(config.transport_mode, TransportMode::Streaming);
        assert_eq!(config.fields, FieldNames::default());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config(&[
            ("IS_TEST", "maybe"),
            ("BRIDGE_CAPACITY", "lots"),
            ("TRANSPORT_MODE", "carrier-pigeon"),
        ]);

        assert!(config.is_test);
        assert_eq!(config.bridge_capacity, DEFAULT_BRIDGE_CAPACITY);
        assert_eq!(config.transport_mode, TransportMode::Streaming);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert_eq!(
            config(&[("BRIDGE_CAPACITY", "0")]).bridge_capacity,
            DEFAULT_BRIDGE_CAPACITY
        );
    }

    #[test]
    fn test_pipeline_settings_follow_mode() {
        let settings = config(&[
            ("TRANSPORT_MODE", "file"),
            ("SCRATCH_DIR", "/var/tmp/relay"),
            ("BRIDGE_CAPACITY", "4096"),
            ("NAME_FIELD", "title"),
        ])
        .pipeline_settings();

        assert_eq!(settings.mode, TransportMode::FileBacked);
        assert_eq!(settings.scratch_root, PathBuf::from("/var/tmp/relay"));
        assert_eq!(settings.bridge_capacity, 4096);
        assert_eq!(settings.fields.name, "title");
        assert_eq!(settings.options, TranscodeOptions::for_mode(TransportMode::FileBacked));
    }

    #[test]
    fn test_output_options_override() {
        let settings = config(&[("OUTPUT_OPTIONS", "-c:v libx264  -preset veryfast")])
            .pipeline_settings();

        assert_eq!(
            settings.options.output_options,
            vec!["-c:v", "libx264", "-preset", "veryfast"]
        );
        assert_eq!(settings.options.output_format, "mp4");
    }
}
