use crate::domain::bridge::{BridgeReader, BridgeWriter};
use crate::domain::error::TranscodeError;
use crate::domain::media::{TranscodeReport, TranscodeRequest};
use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Converts everything read from `input` and writes the result to `output`.
    ///
    /// Implementations finish `output` only after the conversion fully
    /// succeeded, and abort it with the returned error otherwise.
    async fn transcode(
        &self,
        input: BridgeReader,
        output: BridgeWriter,
        request: TranscodeRequest,
    ) -> Result<TranscodeReport, TranscodeError>;
}
