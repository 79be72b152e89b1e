//! Reader for the transcoder's diagnostic side channel (stderr).
//!
//! ffmpeg is started with `-progress pipe:2`, so stderr interleaves regular
//! log lines with `key=value` progress records. A `progress=end` record is
//! the clean-completion marker.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

const TAIL_LINES: usize = 16;

static PROGRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z_0-9]+)=(\S*)$").expect("progress pattern"));

static FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|invalid|failed|could not|no such file|not supported)\b")
        .expect("failure pattern")
});

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    tail: VecDeque<String>,
    pub completed: bool,
    pub out_time: Option<String>,
    pub flagged: usize,
}

impl Diagnostics {
    pub fn observe(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if let Some(captures) = PROGRESS.captures(line) {
            let value = &captures[2];
            match &captures[1] {
                "progress" => {
                    if value == "end" {
                        self.completed = true;
                    }
                    debug!(out_time = ?self.out_time, state = value, "transcoder progress");
                }
                "out_time" => self.out_time = Some(value.to_string()),
                _ => {}
            }
            return;
        }

        if FAILURE.is_match(line) {
            self.flagged += 1;
            warn!(line, "transcoder reported a problem");
        } else {
            debug!(line, "transcoder");
        }

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    /// Last log lines, newest last, for error reports.
    pub fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Consumes `stderr` to end-of-file.
    pub async fn collect<R>(stderr: R) -> Self
    where
        R: AsyncRead + Unpin,
    {
        let mut diagnostics = Self::default();
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => diagnostics.observe(&line),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed reading transcoder diagnostics");
                    break;
                }
            }
        }
        diagnostics
    }
}
