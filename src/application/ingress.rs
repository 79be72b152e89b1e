//! Incremental reader for the inbound multipart body.
//!
//! The file part is copied into the input bridge one chunk at a time; plain
//! fields are collected as text. Whatever fields precede the file part are
//! handed to the orchestrator the moment the file part starts.

use crate::domain::bridge::BridgeWriter;
use crate::domain::error::IngressError;
use crate::domain::media::{FieldNames, FormFields};
use axum::extract::multipart::{Field, Multipart, MultipartError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What the ingress stage saw once the body has been fully consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressReport {
    pub fields: FormFields,
    pub file_name: Option<String>,
    pub bytes: u64,
}

/// Reads the whole body. On failure the bridge is aborted with the error so
/// the transcoder does not wait on input that will never arrive.
pub async fn receive(
    mut multipart: Multipart,
    names: FieldNames,
    sink: BridgeWriter,
    on_file: oneshot::Sender<FormFields>,
) -> Result<IngressReport, IngressError> {
    let mut sink = Some(sink);
    let result = read_parts(&mut multipart, &names, &mut sink, on_file).await;
    if let Err(err) = &result {
        if let Some(sink) = sink.take() {
            sink.abort(err.to_string());
        }
    }
    result
}

async fn read_parts(
    multipart: &mut Multipart,
    names: &FieldNames,
    sink: &mut Option<BridgeWriter>,
    on_file: oneshot::Sender<FormFields>,
) -> Result<IngressReport, IngressError> {
    let mut report = IngressReport::default();
    let mut on_file = Some(on_file);
    let mut interrupted = None;

    while let Some(mut field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        let is_file = name == names.file || field.file_name().is_some();

        if !is_file {
            let value = field.text().await.map_err(malformed)?;
            debug!(field = %name, "form field received");
            report.fields.insert(name, value);
            continue;
        }

        let Some(writer) = sink.as_mut() else {
            warn!(field = %name, "ignoring additional file part");
            discard(&mut field).await?;
            continue;
        };

        report.file_name = field.file_name().map(str::to_string);
        info!(field = %name, file_name = ?report.file_name, "file part started");
        if let Some(on_file) = on_file.take() {
            // The orchestrator may have stopped listening; it still joins this task.
            let _ = on_file.send(report.fields.clone());
        }

        while let Some(chunk) = field.chunk().await.map_err(malformed)? {
            let len = chunk.len() as u64;
            if let Err(e) = writer.write(chunk).await {
                warn!(error = %e, "transcoder input closed, discarding remaining upload");
                interrupted = Some(e);
                discard(&mut field).await?;
                break;
            }
            report.bytes += len;
        }

        if let Some(writer) = sink.take() {
            if interrupted.is_none() {
                writer.finish();
            }
        }
        debug!(bytes = report.bytes, "file part complete");
    }

    if let Some(e) = interrupted {
        return Err(IngressError::Bridge(e));
    }
    if on_file.is_some() {
        return Err(IngressError::NoFileField);
    }
    Ok(report)
}

/// Reads a part to its end without keeping the data.
async fn discard(field: &mut Field<'_>) -> Result<(), IngressError> {
    while field.chunk().await.map_err(malformed)?.is_some() {}
    Ok(())
}

fn malformed(err: MultipartError) -> IngressError {
    IngressError::MalformedMultipart(err.body_text())
}
