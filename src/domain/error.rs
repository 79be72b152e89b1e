//! Failure taxonomy for the upload pipeline, one enum per stage.

use super::bridge::BridgeError;
use super::session::Stage;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("malformed multipart body: {0}")]
    MalformedMultipart(String),

    #[error("no file field in multipart body")]
    NoFileField,

    /// The transcoder stopped consuming the upload.
    #[error("upload stream interrupted: {0}")]
    Bridge(#[from] BridgeError),
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder failed to start ({program:?}): {source}")]
    ProcessSpawnFailed {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transcoder exited with {}: {diagnostics}", exit_label(.code))]
    ProcessExitedWithError {
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("transcoder stream I/O error: {0}")]
    StreamIo(#[from] io::Error),

    /// One of the bridges was closed by a peer stage.
    #[error("transcoder stream interrupted: {0}")]
    Bridge(#[from] BridgeError),

    #[error("transcoder produced no output")]
    EmptyOutput,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// Non-2xx answer (status present) or transport failure (status absent).
    #[error("upload failed{}: {detail}", status_label(.status))]
    UploadFailed { status: Option<u16>, detail: String },
}

fn status_label(status: &Option<u16>) -> String {
    status
        .map(|status| format!(" with status {}", status))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ingress(#[from] IngressError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("session scratch area unavailable: {0}")]
    Scratch(#[source] io::Error),

    #[error("pipeline task panicked: {0}")]
    TaskPanicked(String),
}

impl PipelineError {
    /// Whether this error only reports a bridge closed by another stage,
    /// in which case that stage holds the actual cause.
    pub fn is_peer_closure(&self) -> bool {
        matches!(
            self,
            PipelineError::Ingress(IngressError::Bridge(_))
                | PipelineError::Transcode(TranscodeError::Bridge(_))
        )
    }
}

/// The failure reported to the caller: which stage failed, and why.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl StageFailure {
    pub fn new(stage: Stage, error: impl Into<PipelineError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_failed_carries_remote_body() {
        let err = RelayError::UploadFailed {
            status: Some(500),
            detail: "quota exceeded".into(),
        };
        assert_eq!(err.to_string(), "upload failed with status 500: quota exceeded");

        let transport = RelayError::UploadFailed {
            status: None,
            detail: "connection refused".into(),
        };
        assert_eq!(transport.to_string(), "upload failed: connection refused");
    }

    #[test]
    fn test_exit_error_message() {
        let err = TranscodeError::ProcessExitedWithError {
            code: Some(1),
            diagnostics: "pipe:0: Invalid data found when processing input".into(),
        };
        assert_eq!(
            err.to_string(),
            "transcoder exited with status 1: pipe:0: Invalid data found when processing input"
        );
    }

    #[test]
    fn test_peer_closure_classification() {
        assert!(PipelineError::from(IngressError::Bridge(BridgeError::Closed)).is_peer_closure());
        assert!(PipelineError::from(TranscodeError::Bridge(BridgeError::Aborted("x".into())))
            .is_peer_closure());
        assert!(!PipelineError::from(IngressError::NoFileField).is_peer_closure());
        assert!(!PipelineError::from(TranscodeError::EmptyOutput).is_peer_closure());
    }
}
