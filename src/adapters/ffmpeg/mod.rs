//! Process-backed transcoder driver.
//!
//! Each call spawns one transcoder process. Its stdin is fed from the input
//! bridge, its stdout (or spool file) is forwarded into the output bridge and
//! its stderr goes to [`Diagnostics`].

pub mod diagnostics;

use crate::domain::bridge::{BridgeReader, BridgeWriter};
use crate::domain::error::TranscodeError;
use crate::domain::media::{TranscodeReport, TranscodeRequest};
use crate::ports::transcoder::Transcoder;
use async_trait::async_trait;
use diagnostics::Diagnostics;
use futures::StreamExt;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// How the process arguments are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Invocation {
    Ffmpeg,
    /// Argument template; `{format}` and `{output}` are substituted per call.
    Template(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ProcessTranscoder {
    program: PathBuf,
    invocation: Invocation,
}

impl ProcessTranscoder {
    pub fn ffmpeg(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            invocation: Invocation::Ffmpeg,
        }
    }

    /// Runs `program` with a custom argument template. Input always arrives on
    /// stdin; `{output}` expands to the spool path, or `pipe:1` when streaming.
    pub fn custom(program: impl Into<PathBuf>, template: Vec<String>) -> Self {
        Self {
            program: program.into(),
            invocation: Invocation::Template(template),
        }
    }

    fn arguments(&self, request: &TranscodeRequest) -> Vec<OsString> {
        let output: OsString = match &request.spool {
            Some(path) => path.clone().into_os_string(),
            None => OsString::from("pipe:1"),
        };

        match &self.invocation {
            Invocation::Ffmpeg => {
                let mut args: Vec<OsString> = [
                    "-hide_banner",
                    "-nostats",
                    "-progress",
                    "pipe:2",
                    "-i",
                    "pipe:0",
                    "-f",
                ]
                .into_iter()
                .map(OsString::from)
                .collect();
                args.push(request.options.output_format.clone().into());
                args.extend(request.options.output_options.iter().map(OsString::from));
                if request.spool.is_some() {
                    args.push("-y".into());
                }
                args.push(output);
                args
            }
            Invocation::Template(template) => template
                .iter()
                .map(|arg| match arg.as_str() {
                    "{output}" => output.clone(),
                    "{format}" => OsString::from(&request.options.output_format),
                    other => OsString::from(other),
                })
                .collect(),
        }
    }

    async fn drive(
        &self,
        child: &mut Child,
        input: BridgeReader,
        output: &mut BridgeWriter,
        request: &TranscodeRequest,
    ) -> Result<TranscodeReport, TranscodeError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("transcoder stdin not captured"))?;
        let stdout = child.stdout.take();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("transcoder stderr not captured"))?;
        let monitor = tokio::spawn(Diagnostics::collect(stderr));

        let (bytes_in, piped_out) = tokio::try_join!(feed(input, stdin), async {
            match stdout {
                Some(stdout) => forward(stdout, output).await,
                None => Ok(0),
            }
        })?;

        let status = child.wait().await?;
        let diagnostics = match monitor.await {
            Ok(diagnostics) => diagnostics,
            Err(e) => {
                warn!(error = %e, "transcoder diagnostics task failed");
                Diagnostics::default()
            }
        };

        if !status.success() {
            return Err(TranscodeError::ProcessExitedWithError {
                code: status.code(),
                diagnostics: diagnostics.tail(),
            });
        }
        if matches!(self.invocation, Invocation::Ffmpeg) && !diagnostics.completed {
            warn!("transcoder exited cleanly without a completion marker");
        }
        if diagnostics.flagged > 0 {
            warn!(
                flagged = diagnostics.flagged,
                "transcoder succeeded after reporting problems"
            );
        }

        // The process has exited, so every descriptor it held on the spool is
        // closed and the file length is final.
        let bytes_out = match &request.spool {
            Some(path) => forward_spool(path, output).await?,
            None => piped_out,
        };

        Ok(TranscodeReport {
            bytes_in,
            bytes_out,
            exit_code: status.code(),
            completion_marker: diagnostics.completed,
        })
    }
}

#[async_trait]
impl Transcoder for ProcessTranscoder {
    async fn transcode(
        &self,
        input: BridgeReader,
        mut output: BridgeWriter,
        request: TranscodeRequest,
    ) -> Result<TranscodeReport, TranscodeError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.arguments(&request))
            .stdin(Stdio::piped())
            .stdout(if request.spool.is_some() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(command = ?command, "spawning transcoder");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = TranscodeError::ProcessSpawnFailed {
                    program: self.program.clone(),
                    source,
                };
                output.abort(err.to_string());
                return Err(err);
            }
        };
        info!(pid = ?child.id(), program = ?self.program, "transcoder started");

        match self.drive(&mut child, input, &mut output, &request).await {
            Ok(report) => {
                output.finish();
                info!(
                    bytes_in = report.bytes_in,
                    bytes_out = report.bytes_out,
                    "transcoder finished"
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "transcoder already exited");
                }
                if let Err(e) = child.wait().await {
                    warn!(error = %e, "failed to reap transcoder");
                }
                output.abort(err.to_string());
                Err(err)
            }
        }
    }
}

/// Copies the input bridge into the process stdin, then closes stdin.
/// Returns the number of bytes the process accepted.
async fn feed(mut input: BridgeReader, mut stdin: ChildStdin) -> Result<u64, TranscodeError> {
    let mut copied = 0u64;
    while let Some(chunk) = input.read().await {
        let chunk = chunk?;
        match stdin.write_all(&chunk).await {
            Ok(()) => copied += chunk.len() as u64,
            // The process stopped reading; its exit status decides the outcome.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(copied, "transcoder closed stdin early");
                return Ok(copied);
            }
            Err(e) => return Err(e.into()),
        }
    }
    if let Err(e) = stdin.shutdown().await {
        debug!(error = %e, "transcoder stdin already closed");
    }
    Ok(copied)
}

/// Reads `source` in chunks and writes them to the output bridge.
async fn forward<R>(source: R, output: &mut BridgeWriter) -> Result<u64, TranscodeError>
where
    R: AsyncRead + Unpin,
{
    let mut chunks = ReaderStream::with_capacity(source, CHUNK_SIZE);
    let mut total = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        total += chunk.len() as u64;
        output.write(chunk).await?;
    }
    Ok(total)
}

async fn forward_spool(path: &Path, output: &mut BridgeWriter) -> Result<u64, TranscodeError> {
    let file = File::open(path).await?;
    let length = file.metadata().await?.len();
    debug!(path = ?path, length, "forwarding spooled output");
    forward(file.take(length), output).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bridge::{bridge, BridgeError};
    use crate::domain::media::{TranscodeOptions, TransportMode};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn shell(script: &str) -> ProcessTranscoder {
        ProcessTranscoder::custom(
            "sh",
            vec![
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
                "{output}".to_string(),
            ],
        )
    }

    fn streaming() -> TranscodeRequest {
        TranscodeRequest {
            options: TranscodeOptions::for_mode(TransportMode::Streaming),
            spool: None,
        }
    }

    async fn run(
        transcoder: &ProcessTranscoder,
        payload: Vec<u8>,
        request: TranscodeRequest,
    ) -> (Result<TranscodeReport, TranscodeError>, Result<Vec<u8>, BridgeError>) {
        let (mut in_tx, in_rx) = bridge(1024);
        let (out_tx, out_rx) = bridge(1024);

        let producer = tokio::spawn(async move {
            for chunk in payload.chunks(4096) {
                if in_tx.write(Bytes::copy_from_slice(chunk)).await.is_err() {
                    return;
                }
            }
            in_tx.finish();
        });
        let consumer = tokio::spawn(async move {
            let mut stream = out_rx.into_stream();
            let mut received = Vec::new();
            while let Some(chunk) = stream.next().await {
                received.extend_from_slice(&chunk?);
            }
            Ok(received)
        });

        let result = transcoder.transcode(in_rx, out_tx, request).await;
        producer.await.unwrap();
        (result, consumer.await.unwrap())
    }

    #[test]
    fn test_ffmpeg_arguments_for_pipes() {
        let transcoder = ProcessTranscoder::ffmpeg("ffmpeg");
        let args: Vec<String> = transcoder
            .arguments(&streaming())
            .into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect();

        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-nostats",
                "-progress",
                "pipe:2",
                "-i",
                "pipe:0",
                "-f",
                "mp4",
                "-movflags",
                "frag_keyframe+empty_moov+default_base_moof",
                "pipe:1",
            ]
        );
    }

    #[test]
    fn test_ffmpeg_arguments_for_spool() {
        let transcoder = ProcessTranscoder::ffmpeg("ffmpeg");
        let request = TranscodeRequest {
            options: TranscodeOptions::for_mode(TransportMode::FileBacked),
            spool: Some(PathBuf::from("/scratch/out.mp4")),
        };
        let args = transcoder.arguments(&request);

        assert_eq!(args[args.len() - 2], OsString::from("-y"));
        assert_eq!(args[args.len() - 1], OsString::from("/scratch/out.mp4"));
    }

    #[tokio::test]
    async fn test_streams_through_process() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (result, output) = run(&shell("cat"), payload.clone(), streaming()).await;

        let report = result.unwrap();
        assert_eq!(report.bytes_in, payload.len() as u64);
        assert_eq!(report.bytes_out, payload.len() as u64);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(output.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_spooled_output_forwarded_after_exit() {
        let scratch = tempdir().unwrap();
        let spool = scratch.path().join("out.mp4");
        let request = TranscodeRequest {
            options: TranscodeOptions::for_mode(TransportMode::FileBacked),
            spool: Some(spool.clone()),
        };

        let (result, output) = run(&shell("cat > \"$1\""), b"spooled bytes".to_vec(), request).await;

        assert_eq!(result.unwrap().bytes_out, 13);
        assert_eq!(output.unwrap(), b"spooled bytes".to_vec());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let transcoder = ProcessTranscoder::ffmpeg("/nonexistent/bin/ffmpeg");
        let (result, output) = run(&transcoder, vec![7u8; 10_000], streaming()).await;

        assert!(matches!(result, Err(TranscodeError::ProcessSpawnFailed { .. })));
        assert!(matches!(output, Err(BridgeError::Aborted(reason)) if reason.contains("failed to start")));
    }

    #[tokio::test]
    async fn test_non_zero_exit_aborts_output() {
        let transcoder = shell("cat > /dev/null; echo 'Invalid data found' >&2; exit 3");
        let (result, output) = run(&transcoder, vec![1u8; 5000], streaming()).await;

        match result {
            Err(TranscodeError::ProcessExitedWithError { code, diagnostics }) => {
                assert_eq!(code, Some(3));
                assert_eq!(diagnostics, "Invalid data found");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(output, Err(BridgeError::Aborted(reason)) if reason.contains("status 3")));
    }

    #[tokio::test]
    async fn test_aborted_input_kills_process() {
        let (mut in_tx, in_rx) = bridge(64);
        let (out_tx, _out_rx) = bridge(64);
        in_tx.write(Bytes::from_static(b"partial upload")).await.unwrap();
        in_tx.abort("malformed multipart body");

        let result = shell("cat").transcode(in_rx, out_tx, streaming()).await;

        assert!(matches!(
            result,
            Err(TranscodeError::Bridge(BridgeError::Aborted(reason))) if reason == "malformed multipart body"
        ));
    }

    #[tokio::test]
    async fn test_early_stdin_close_counts_accepted_bytes() {
        let payload: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();
        let (result, output) = run(&shell("head -c 100"), payload.clone(), streaming()).await;

        let report = result.unwrap();
        assert!(report.bytes_in >= 1024, "bytes_in = {}", report.bytes_in);
        assert!(report.bytes_in < payload.len() as u64);
        assert_eq!(output.unwrap(), payload[..100].to_vec());
    }
}
