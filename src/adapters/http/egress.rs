//! Outbound relay: streams transcoded output to the remote upload endpoint
//! as a multipart POST.

use crate::domain::bridge::ByteStream;
use crate::domain::error::RelayError;
use crate::domain::media::{RelayResult, UploadMetadata, OUTPUT_MIME};
use crate::ports::upload::UploadSink;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use std::error::Error as StdError;
use tracing::{info, warn};

pub const SUBMIT_LABEL: &str = "Upload Video";

#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
    endpoint: String,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }

    fn form(content: ByteStream, metadata: &UploadMetadata) -> Result<Form, RelayError> {
        let file = Part::stream(Body::wrap_stream(content))
            .file_name(metadata.attachment_name())
            .mime_str(OUTPUT_MIME)
            .map_err(transport)?;

        Ok(Form::new()
            .text("fileType", metadata.file_type.clone())
            .text("fileName", metadata.file_name.clone())
            .part("fileToUpload", file)
            .text("submit", SUBMIT_LABEL))
    }
}

#[async_trait]
impl UploadSink for HttpUploader {
    async fn send(
        &self,
        content: ByteStream,
        metadata: UploadMetadata,
    ) -> Result<RelayResult, RelayError> {
        let form = Self::form(content, &metadata)?;
        info!(endpoint = %self.endpoint, file_name = %metadata.file_name, "relaying transcoded upload");

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "could not read upload response body");
                String::new()
            }
        };

        if status.is_success() {
            info!(status = status.as_u16(), "remote endpoint accepted upload");
            Ok(RelayResult {
                status: status.as_u16(),
                body,
            })
        } else {
            warn!(status = status.as_u16(), body = %body, "remote endpoint rejected upload");
            Err(RelayError::UploadFailed {
                status: Some(status.as_u16()),
                detail: body,
            })
        }
    }
}

/// Flattens a transport error and its causes into one line.
fn transport(err: reqwest::Error) -> RelayError {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    RelayError::UploadFailed {
        status: None,
        detail,
    }
}
