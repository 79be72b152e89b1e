use crate::domain::bridge::ByteStream;
use crate::domain::error::RelayError;
use crate::domain::media::{RelayResult, UploadMetadata};
use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadSink: Send + Sync {
    /// Streams `content` to the remote endpoint. Anything but a 2xx answer is an error.
    async fn send(
        &self,
        content: ByteStream,
        metadata: UploadMetadata,
    ) -> Result<RelayResult, RelayError>;
}
