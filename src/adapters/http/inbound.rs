//! Inbound HTTP surface: one upload endpoint and, in test deployments, a
//! form to drive it from a browser.

use crate::application::orchestrator::PipelineService;
use crate::domain::error::{IngressError, StageFailure};
use crate::domain::session::Stage;
use crate::ports::transcoder::Transcoder;
use crate::ports::upload::UploadSink;
use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

pub fn router<T, U>(pipeline: Arc<PipelineService<T, U>>, is_test: bool) -> Router
where
    T: Transcoder + 'static,
    U: UploadSink + 'static,
{
    let mut router = Router::new()
        .route("/upload", post(upload_media::<T, U>))
        .layer(DefaultBodyLimit::disable())
        .with_state(pipeline);

    if is_test {
        router = router.route("/", get(root));
    }
    router
}

// Accepts a multipart upload and runs it through the transcode/relay pipeline.
async fn upload_media<T, U>(
    State(pipeline): State<Arc<PipelineService<T, U>>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response
where
    T: Transcoder + 'static,
    U: UploadSink + 'static,
{
    let outcome = match multipart {
        Ok(multipart) => pipeline.handle_upload(multipart).await,
        Err(rejection) => Err(StageFailure::new(
            Stage::Receiving,
            IngressError::MalformedMultipart(rejection.body_text()),
        )),
    };

    match outcome {
        Ok(relayed) => {
            info!(status = relayed.status, "upload relayed");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(failure) => {
            error!(stage = %failure.stage, error = %failure, "upload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    message: failure.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn root() -> Html<&'static str> {
    Html(
        r#"
        <!doctype html>
        <html>
            <head>
                <title>Upload something!</title>
            </head>
            <body>
                <h1>Transcode and relay a video</h1>
                <form action="/upload" method="post" enctype="multipart/form-data">
                    <div>
                        <label>
                            File name:
                            <input type="text" name="fileName">
                        </label>
                    </div>
                    <div>
                        <label>
                            Upload file:
                            <input type="file" name="file">
                        </label>
                    </div>
                    <div>
                        <input type="submit" value="Upload file">
                    </div>
                </form>
            </body>
        </html>
        "#,
    )
}
