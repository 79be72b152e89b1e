use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Container every upload is normalized to.
pub const OUTPUT_FORMAT: &str = "mp4";
pub const OUTPUT_MIME: &str = "video/mp4";

/// How transcoded output reaches the egress stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Transcoder stdout is piped straight into the output bridge.
    #[default]
    Streaming,
    /// Transcoder writes a file in the session scratch area, which is forwarded
    /// into the output bridge once the process has exited.
    FileBacked,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "streaming" | "stream" | "pipe" => Ok(Self::Streaming),
            "file" | "file_backed" | "file-backed" => Ok(Self::FileBacked),
            other => Err(format!("unknown transport mode: {}", other)),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Streaming => write!(f, "streaming"),
            TransportMode::FileBacked => write!(f, "file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeOptions {
    pub output_format: String,
    /// Codec/container flags, passed to the transcoder in order.
    pub output_options: Vec<String>,
}

impl TranscodeOptions {
    /// Defaults for a transport mode. A pipe is not seekable, so streamed MP4
    /// must be fragmented; a file can carry a regular `moov` atom up front.
    pub fn for_mode(mode: TransportMode) -> Self {
        let movflags = match mode {
            TransportMode::Streaming => "frag_keyframe+empty_moov+default_base_moof",
            TransportMode::FileBacked => "+faststart",
        };
        Self {
            output_format: OUTPUT_FORMAT.to_string(),
            output_options: vec!["-movflags".to_string(), movflags.to_string()],
        }
    }
}

/// Everything the transcoder needs besides its two bridges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub options: TranscodeOptions,
    /// Output file for [`TransportMode::FileBacked`]; `None` pipes stdout.
    pub spool: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscodeReport {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub exit_code: Option<i32>,
    /// Whether the transcoder printed its clean-completion marker.
    pub completion_marker: bool,
}

/// Plain (non-file) multipart fields, by name.
pub type FormFields = HashMap<String, String>;

/// Multipart field names recognised on the inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNames {
    pub file: String,
    pub name: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            file: "file".to_string(),
            name: "fileName".to_string(),
        }
    }
}

/// Naming for the outbound upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub file_type: String,
    pub file_name: String,
}

impl UploadMetadata {
    /// Uses the client's name field when it is a plain file name, otherwise a
    /// timestamp-derived one.
    pub fn from_fields(fields: &FormFields, names: &FieldNames, now: DateTime<Utc>) -> Self {
        let file_name = match fields.get(&names.name).map(|name| name.trim()) {
            Some(name) if name_is_valid(name) => name.to_string(),
            Some(name) => {
                tracing::warn!(name, "ignoring unusable upload name");
                default_file_name(now)
            }
            None => default_file_name(now),
        };

        Self {
            file_type: OUTPUT_FORMAT.to_string(),
            file_name,
        }
    }

    /// File name attached to the binary part; always carries the output extension.
    pub fn attachment_name(&self) -> String {
        let has_extension = Path::new(&self.file_name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.file_type));
        if has_extension {
            self.file_name.clone()
        } else {
            format!("{}.{}", self.file_name, self.file_type)
        }
    }
}

pub fn default_file_name(now: DateTime<Utc>) -> String {
    format!("{}.{}", now.format("%Y%m%d%H%M%S"), OUTPUT_FORMAT)
}

fn name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.contains(|c| c == '/' || c == '\\') {
        return false;
    }
    Path::new(name)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

/// Outcome of an accepted egress POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResult {
    pub status: u16,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    fn fields(pairs: &[(&str, &str)]) -> FormFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_name_from_fields() {
        let meta = UploadMetadata::from_fields(
            &fields(&[("fileName", "clip")]),
            &FieldNames::default(),
            fixed_now(),
        );
        assert_eq!(meta.file_name, "clip");
        assert_eq!(meta.file_type, "mp4");
        assert_eq!(meta.attachment_name(), "clip.mp4");
    }

    #[test]
    fn test_default_name_is_timestamp() {
        let meta = UploadMetadata::from_fields(&FormFields::new(), &FieldNames::default(), fixed_now());
        assert_eq!(meta.file_name, "20240309140507.mp4");
        assert_eq!(meta.attachment_name(), "20240309140507.mp4");
    }

    #[test]
    fn test_invalid_path_with_parent() {
        let meta = UploadMetadata::from_fields(
            &fields(&[("fileName", "../escape")]),
            &FieldNames::default(),
            fixed_now(),
        );
        assert_eq!(meta.file_name, "20240309140507.mp4");
    }

    #[test]
    fn test_invalid_path_with_multiple_components() {
        assert!(!name_is_valid("dir1/dir2"));
        assert!(!name_is_valid("/root_directory"));
        assert!(!name_is_valid(".."));
        assert!(!name_is_valid(""));
        assert!(name_is_valid("holiday video.mov"));
    }

    #[test]
    fn test_transport_mode_parse() {
        assert_eq!("file".parse::<TransportMode>(), Ok(TransportMode::FileBacked));
        assert_eq!("Streaming".parse::<TransportMode>(), Ok(TransportMode::Streaming));
        assert!("carrier-pigeon".parse::<TransportMode>().is_err());
    }

    #[test]
    fn test_streamed_output_is_fragmented() {
        let options = TranscodeOptions::for_mode(TransportMode::Streaming);
        assert_eq!(options.output_format, "mp4");
        assert!(options.output_options[1].contains("frag_keyframe"));
    }
}
