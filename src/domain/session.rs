use super::media::{TransportMode, OUTPUT_FORMAT};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

/// Pipeline component a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Receiving,
    Transcoding,
    Relaying,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Receiving => "receiving",
            Stage::Transcoding => "transcoding",
            Stage::Relaying => "relaying",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Receiving,
    Transcoding,
    Relaying,
    Done,
    Failed { stage: Stage, message: String },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed { .. })
    }
}

/// One request's lifecycle, from validated headers to the response.
///
/// The scratch directory, when one exists, is private to the session and
/// removed by [`UploadSession::close`] (or on drop, should the request be
/// cancelled first).
#[derive(Debug)]
pub struct UploadSession {
    id: String,
    output_format: &'static str,
    scratch: Option<TempDir>,
    state: SessionState,
    started: Instant,
}

impl UploadSession {
    /// Creates the session. File-backed transport gets a unique directory
    /// under `scratch_root`; streaming needs no filesystem at all.
    pub fn open(scratch_root: &Path, mode: TransportMode) -> io::Result<Self> {
        let id = Uuid::new_v4().to_string();
        let scratch = match mode {
            TransportMode::Streaming => None,
            TransportMode::FileBacked => {
                std::fs::create_dir_all(scratch_root)?;
                Some(
                    tempfile::Builder::new()
                        .prefix(&format!("session-{}-", id))
                        .tempdir_in(scratch_root)?,
                )
            }
        };

        info!(session = %id, %mode, "upload session opened");
        Ok(Self {
            id,
            output_format: OUTPUT_FORMAT,
            scratch,
            state: SessionState::Receiving,
            started: Instant::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|dir| dir.path())
    }

    /// Where a file-backed transcoder writes its output.
    pub fn spool_path(&self) -> Option<PathBuf> {
        self.scratch_dir()
            .map(|dir| dir.join(format!("{}.{}", self.id, self.output_format)))
    }

    /// Moves to `next`; terminal states are final.
    pub fn transition(&mut self, next: SessionState) {
        if self.state.is_terminal() {
            warn!(session = %self.id, from = ?self.state, to = ?next, "ignoring transition out of terminal state");
            return;
        }
        info!(session = %self.id, from = ?self.state, to = ?next, "session state changed");
        self.state = next;
    }

    /// Releases every resource held for the session and returns its final state.
    /// Removal failures are logged, never surfaced: the outcome is already decided.
    pub fn close(mut self) -> SessionState {
        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(session = %self.id, path = ?path, error = %e, "CleanupFailed: could not remove scratch area");
            }
        }
        info!(
            session = %self.id,
            state = ?self.state,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "upload session closed"
        );
        self.state.clone()
    }
}
