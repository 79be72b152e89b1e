use super::ingress::{self, IngressReport};
use crate::domain::bridge::{bridge, BridgeHandle, BridgeReader};
use crate::domain::error::{IngressError, PipelineError, StageFailure, TranscodeError};
use crate::domain::media::{
    FieldNames, RelayResult, TranscodeOptions, TranscodeRequest, TransportMode, UploadMetadata,
};
use crate::domain::session::{SessionState, Stage, UploadSession};
use crate::ports::transcoder::Transcoder;
use crate::ports::upload::UploadSink;
use axum::extract::Multipart;
use bytes::Bytes;
use chrono::Utc;
use futures::future::{self, Future};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub bridge_capacity: usize,
    pub scratch_root: PathBuf,
    pub mode: TransportMode,
    pub options: TranscodeOptions,
    pub fields: FieldNames,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let mode = TransportMode::default();
        Self {
            bridge_capacity: 1024 * 1024,
            scratch_root: std::env::temp_dir().join("mediarelay"),
            mode,
            options: TranscodeOptions::for_mode(mode),
            fields: FieldNames::default(),
        }
    }
}

/// Runs one upload through receive, transcode and relay.
pub struct PipelineService<T, U> {
    transcoder: Arc<T>,
    uploader: Arc<U>,
    settings: PipelineSettings,
}

impl<T, U> PipelineService<T, U>
where
    T: Transcoder + 'static,
    U: UploadSink + 'static,
{
    pub fn new(transcoder: T, uploader: U, settings: PipelineSettings) -> Self {
        Self {
            transcoder: Arc::new(transcoder),
            uploader: Arc::new(uploader),
            settings,
        }
    }

    /// Handles one request end to end.
    pub async fn handle_upload(&self, multipart: Multipart) -> Result<RelayResult, StageFailure> {
        let (outcome, _state) = self.process(multipart).await;
        outcome
    }

    /// Runs a session and reports its terminal state with the outcome. Every
    /// exit path closes the session, which removes its scratch area.
    async fn process(
        &self,
        multipart: Multipart,
    ) -> (Result<RelayResult, StageFailure>, SessionState) {
        let opened = UploadSession::open(&self.settings.scratch_root, self.settings.mode);
        let mut session = match opened {
            Ok(session) => session,
            Err(e) => {
                let failure = StageFailure::new(Stage::Receiving, PipelineError::Scratch(e));
                let state = SessionState::Failed {
                    stage: failure.stage,
                    message: failure.to_string(),
                };
                return (Err(failure), state);
            }
        };
        let span = tracing::info_span!("upload", session = %session.id());

        let outcome = self.run(&mut session, multipart).instrument(span).await;
        match &outcome {
            Ok(_) => session.transition(SessionState::Done),
            Err(failure) => session.transition(SessionState::Failed {
                stage: failure.stage,
                message: failure.to_string(),
            }),
        }
        (outcome, session.close())
    }

    async fn run(
        &self,
        session: &mut UploadSession,
        multipart: Multipart,
    ) -> Result<RelayResult, StageFailure> {
        let (input_tx, input_rx) = bridge(self.settings.bridge_capacity);
        let (output_tx, mut output_rx) = bridge(self.settings.bridge_capacity);
        let latch = FailureLatch::new(input_tx.handle(), output_tx.handle());

        let (file_tx, file_rx) = oneshot::channel();
        let ingress = tokio::spawn(latch.clone().watch(
            Stage::Receiving,
            ingress::receive(multipart, self.settings.fields.clone(), input_tx, file_tx),
        ));

        let leading_fields = match file_rx.await {
            Ok(fields) => fields,
            Err(_) => {
                // Ingress finished without ever reaching a file part.
                settle(&latch, Stage::Receiving, ingress).await;
                return Err(latch.take().unwrap_or_else(|| {
                    StageFailure::new(Stage::Receiving, IngressError::NoFileField)
                }));
            }
        };
        session.transition(SessionState::Transcoding);

        let request = TranscodeRequest {
            options: self.settings.options.clone(),
            spool: session.spool_path(),
        };
        let transcoder = self.transcoder.clone();
        let transcode = tokio::spawn(latch.clone().watch(Stage::Transcoding, async move {
            transcoder.transcode(input_rx, output_tx, request).await
        }));

        // Egress starts on the first transcoded chunk, so a transcoder that
        // fails before producing anything never reaches the remote endpoint.
        let mut ingress = Some(ingress);
        let mut received = None;
        let relay = match output_rx.read().await {
            Some(Ok(first)) => {
                // Spooled output only exists once the process has exited, so
                // fields sent after the file can be waited for.
                if self.settings.mode == TransportMode::FileBacked {
                    if let Some(task) = ingress.take() {
                        received = settle(&latch, Stage::Receiving, task).await;
                    }
                }
                let fields = match &received {
                    Some(report) => &report.fields,
                    None => &leading_fields,
                };
                let metadata =
                    UploadMetadata::from_fields(fields, &self.settings.fields, Utc::now());
                Some(self.start_relay(&latch, first, output_rx, metadata))
            }
            Some(Err(e)) => {
                info!(error = %e, "transcoded output unavailable, skipping relay");
                None
            }
            None => None,
        };

        let report = settle(&latch, Stage::Transcoding, transcode).await;
        if let Some(report) = &report {
            info!(
                bytes_in = report.bytes_in,
                bytes_out = report.bytes_out,
                marker = report.completion_marker,
                "transcoding complete"
            );
            session.transition(SessionState::Relaying);
        }

        let relayed = match relay {
            Some(task) => settle(&latch, Stage::Relaying, task).await,
            None => None,
        };
        if let Some(task) = ingress {
            received = settle(&latch, Stage::Receiving, task).await;
        }
        log_ingress(received.as_ref());

        if let Some(failure) = latch.take_primary() {
            return Err(failure);
        }
        // A transcoder may stop reading once it has what it needs; the
        // upload's leftover bytes are then dropped without failing the session.
        match (report, relayed) {
            (Some(_), Some(relayed)) => Ok(relayed),
            (Some(_), None) => Err(StageFailure::new(
                Stage::Transcoding,
                TranscodeError::EmptyOutput,
            )),
            (None, _) => Err(latch.take().unwrap_or_else(|| {
                StageFailure::new(
                    Stage::Transcoding,
                    PipelineError::TaskPanicked("transcoder finished without a result".into()),
                )
            })),
        }
    }

    fn start_relay(
        &self,
        latch: &FailureLatch,
        first: Bytes,
        rest: BridgeReader,
        metadata: UploadMetadata,
    ) -> JoinHandle<Option<RelayResult>> {
        let content = stream::once(future::ready(Ok(first)))
            .chain(rest.into_stream())
            .boxed();
        let uploader = self.uploader.clone();
        let output = latch.output.clone();
        tokio::spawn(latch.clone().watch(Stage::Relaying, async move {
            let result = uploader.send(content, metadata).await;
            // A relay that failed because the output was aborted is reporting
            // the transcoder's failure, not its own.
            if let (Err(_), Some(cause)) = (&result, output.abort_reason()) {
                return Err(PipelineError::Transcode(TranscodeError::Bridge(cause)));
            }
            result.map_err(PipelineError::from)
        }))
    }
}

fn log_ingress(report: Option<&IngressReport>) {
    if let Some(report) = report {
        info!(
            bytes = report.bytes,
            file_name = ?report.file_name,
            fields = report.fields.len(),
            "upload received"
        );
    }
}

/// Waits for a stage task; a panic is recorded as that stage's failure.
async fn settle<R>(latch: &FailureLatch, stage: Stage, task: JoinHandle<Option<R>>) -> Option<R> {
    match task.await {
        Ok(value) => value,
        Err(e) => {
            latch.record(stage, panicked(e));
            None
        }
    }
}

fn panicked(error: JoinError) -> PipelineError {
    PipelineError::TaskPanicked(error.to_string())
}

#[derive(Default)]
struct Recorded {
    primary: Option<StageFailure>,
    secondary: Option<StageFailure>,
}

/// Keeps the first failure of the session, shared by every stage task.
#[derive(Clone)]
struct FailureLatch {
    recorded: Arc<Mutex<Recorded>>,
    input: BridgeHandle,
    output: BridgeHandle,
}

impl FailureLatch {
    fn new(input: BridgeHandle, output: BridgeHandle) -> Self {
        Self {
            recorded: Arc::default(),
            input,
            output,
        }
    }

    /// A primary failure cancels both bridges. A peer closure is only kept as
    /// a fallback: the peer that closed has its own failure to report, or
    /// simply had no more use for the data.
    fn record(&self, stage: Stage, error: PipelineError) {
        let failure = StageFailure::new(stage, error);
        let mut recorded = self.recorded.lock();
        if failure.error.is_peer_closure() {
            debug!(%stage, error = %failure, "stage stopped after its peer closed");
            recorded.secondary.get_or_insert(failure);
            return;
        }
        if recorded.primary.is_some() {
            debug!(%stage, error = %failure, "later failure ignored");
            return;
        }
        warn!(%stage, error = %failure, "pipeline stage failed");
        let reason = failure.to_string();
        recorded.primary = Some(failure);
        drop(recorded);
        self.input.abort(reason.clone());
        self.output.abort(reason);
    }

    fn take_primary(&self) -> Option<StageFailure> {
        self.recorded.lock().primary.take()
    }

    fn take(&self) -> Option<StageFailure> {
        let mut recorded = self.recorded.lock();
        recorded.primary.take().or_else(|| recorded.secondary.take())
    }

    /// Runs a stage, recording its failure the moment it happens.
    async fn watch<F, R, E>(self, stage: Stage, task: F) -> Option<R>
    where
        F: Future<Output = Result<R, E>>,
        E: Into<PipelineError>,
    {
        match task.await {
            Ok(value) => Some(value),
            Err(e) => {
                self.record(stage, e.into());
                None
            }
        }
    }
}
