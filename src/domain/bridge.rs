//! In-process byte conduit between one writer and one reader.
//!
//! A bridge holds at most `capacity` bytes. `BridgeWriter::write` suspends
//! while the buffer is full, which is what keeps a fast producer (the HTTP
//! body, the transcoder's stdout) from running arbitrarily far ahead of a
//! slow consumer. Either side can close the bridge; closing with a reason
//! fails every pending and future operation on both ends with that reason.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

/// Boxed byte stream handed between pipeline stages.
pub type ByteStream = BoxStream<'static, Result<Bytes, BridgeError>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The other end went away before the transfer completed.
    #[error("stream bridge closed by peer")]
    Closed,
    /// The bridge was closed with an error by either end or by the orchestrator.
    #[error("stream bridge aborted: {0}")]
    Aborted(String),
}

#[derive(Debug)]
enum Status {
    Open,
    Finished,
    Failed(BridgeError),
    ReaderGone,
}

#[derive(Debug)]
struct State {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    high_water: usize,
    status: Status,
}

#[derive(Debug)]
struct Shared {
    capacity: usize,
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
}

impl Shared {
    fn fail(&self, error: BridgeError) {
        {
            let mut state = self.state.lock();
            if matches!(state.status, Status::Failed(_) | Status::ReaderGone) {
                return;
            }
            state.chunks.clear();
            state.buffered = 0;
            state.status = Status::Failed(error);
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Creates a bridge buffering at most `capacity` bytes (minimum one).
pub fn bridge(capacity: usize) -> (BridgeWriter, BridgeReader) {
    let shared = Arc::new(Shared {
        capacity: capacity.max(1),
        state: Mutex::new(State {
            chunks: VecDeque::new(),
            buffered: 0,
            high_water: 0,
            status: Status::Open,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
    });

    (
        BridgeWriter {
            shared: shared.clone(),
        },
        BridgeReader { shared },
    )
}

/// Write side of a bridge. Dropping it without calling [`finish`] aborts
/// the bridge so a reader never mistakes a truncated transfer for a complete one.
///
/// [`finish`]: BridgeWriter::finish
#[derive(Debug)]
pub struct BridgeWriter {
    shared: Arc<Shared>,
}

impl BridgeWriter {
    /// Queues `data`, suspending while the bridge is at capacity. Chunks larger
    /// than the capacity are split so the buffer bound always holds.
    pub async fn write(&mut self, mut data: Bytes) -> Result<(), BridgeError> {
        while !data.is_empty() {
            let space = self.shared.writable.notified();
            {
                let mut state = self.shared.state.lock();
                match &state.status {
                    Status::Open => {}
                    Status::Failed(error) => return Err(error.clone()),
                    Status::Finished | Status::ReaderGone => return Err(BridgeError::Closed),
                }

                let room = self.shared.capacity - state.buffered;
                if room > 0 {
                    let piece = data.split_to(room.min(data.len()));
                    state.buffered += piece.len();
                    state.high_water = state.high_water.max(state.buffered);
                    state.chunks.push_back(piece);
                    drop(state);
                    self.shared.readable.notify_waiters();
                    continue;
                }
            }
            space.await;
        }
        Ok(())
    }

    /// Closes the bridge cleanly; the reader drains what is buffered, then sees end-of-data.
    pub fn finish(self) {
        {
            let mut state = self.shared.state.lock();
            if matches!(state.status, Status::Open) {
                state.status = Status::Finished;
            }
        }
        self.shared.readable.notify_waiters();
    }

    pub fn abort(self, reason: impl Into<String>) {
        self.shared.fail(BridgeError::Aborted(reason.into()));
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for BridgeWriter {
    fn drop(&mut self) {
        let open = matches!(self.shared.state.lock().status, Status::Open);
        if open {
            self.shared
                .fail(BridgeError::Aborted("writer dropped before finishing".into()));
        }
    }
}

/// Read side of a bridge. Dropping it makes further writes fail with [`BridgeError::Closed`].
#[derive(Debug)]
pub struct BridgeReader {
    shared: Arc<Shared>,
}

impl BridgeReader {
    /// Next chunk, in write order. `None` once the writer finished and the buffer
    /// is drained; `Some(Err(_))` on every call after the bridge was aborted.
    pub async fn read(&mut self) -> Option<Result<Bytes, BridgeError>> {
        loop {
            let data = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(chunk) = state.chunks.pop_front() {
                    state.buffered -= chunk.len();
                    drop(state);
                    self.shared.writable.notify_waiters();
                    return Some(Ok(chunk));
                }
                match &state.status {
                    Status::Open => {}
                    Status::Failed(error) => return Some(Err(error.clone())),
                    Status::Finished | Status::ReaderGone => return None,
                }
            }
            data.await;
        }
    }

    /// Adapts the reader into a stream that ends after the first error.
    pub fn into_stream(self) -> ByteStream {
        stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.read().await? {
                Ok(chunk) => Some((Ok(chunk), Some(reader))),
                Err(error) => Some((Err(error), None)),
            }
        })
        .boxed()
    }

    pub fn abort(self, reason: impl Into<String>) {
        self.shared.fail(BridgeError::Aborted(reason.into()));
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for BridgeReader {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if !matches!(state.status, Status::Open) {
                return;
            }
            state.chunks.clear();
            state.buffered = 0;
            state.status = Status::ReaderGone;
        }
        self.shared.writable.notify_waiters();
    }
}

/// Out-of-band control over a bridge, held by whoever needs to cancel it.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl BridgeHandle {
    /// Closes the bridge with `reason` unless it already failed or lost its reader.
    pub fn abort(&self, reason: impl Into<String>) {
        self.shared.fail(BridgeError::Aborted(reason.into()));
    }

    pub fn abort_reason(&self) -> Option<BridgeError> {
        match &self.shared.state.lock().status {
            Status::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason().is_some()
    }

    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffered
    }

    /// Largest number of bytes ever buffered at once.
    pub fn high_water(&self) -> usize {
        self.shared.state.lock().high_water
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_bytes_come_out_in_write_order() {
        let (mut writer, reader) = bridge(7);
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let expected = payload.clone();

        let producer = tokio::spawn(async move {
            for chunk in payload.chunks(333) {
                writer.write(Bytes::copy_from_slice(chunk)).await.unwrap();
            }
            writer.finish();
        });

        let mut received = Vec::new();
        let mut stream = reader.into_stream();
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        producer.await.unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_fast_writer_never_exceeds_capacity() {
        let (mut writer, mut reader) = bridge(1024);
        let handle = writer.handle();

        let producer = tokio::spawn(async move {
            for _ in 0..64 {
                writer.write(Bytes::from(vec![1u8; 700])).await.unwrap();
            }
            writer.finish();
        });

        let mut total = 0;
        while let Some(chunk) = reader.read().await {
            assert!(handle.buffered() <= 1024);
            total += chunk.unwrap().len();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        producer.await.unwrap();

        assert_eq!(total, 64 * 700);
        assert!(handle.high_water() <= handle.capacity());
        assert!(handle.high_water() > 0);
    }

    #[tokio::test]
    async fn test_write_blocks_while_full() {
        let (mut writer, mut reader) = bridge(4);
        writer.write(Bytes::from_static(b"abcd")).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), writer.write(Bytes::from_static(b"e"))).await;
        assert!(blocked.is_err(), "write should wait for free space");

        assert_eq!(reader.read().await.unwrap().unwrap(), Bytes::from_static(b"abcd"));
        timeout(Duration::from_millis(50), writer.write(Bytes::from_static(b"e")))
            .await
            .expect("write should resume once space is freed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_abort_wakes_pending_reader() {
        let (writer, mut reader) = bridge(16);
        let handle = writer.handle();

        let pending = tokio::spawn(async move { reader.read().await });
        tokio::task::yield_now().await;
        handle.abort("transcoder crashed");

        let result = timeout(Duration::from_millis(100), pending).await.unwrap().unwrap();
        assert_eq!(
            result,
            Some(Err(BridgeError::Aborted("transcoder crashed".into())))
        );
        drop(writer);
    }

    #[tokio::test]
    async fn test_abort_wakes_pending_writer() {
        let (mut writer, reader) = bridge(2);
        let handle = reader.handle();
        writer.write(Bytes::from_static(b"xy")).await.unwrap();

        let pending = tokio::spawn(async move { writer.write(Bytes::from_static(b"z")).await });
        tokio::task::yield_now().await;
        handle.abort("upload rejected");

        let result = timeout(Duration::from_millis(100), pending).await.unwrap().unwrap();
        assert_eq!(result, Err(BridgeError::Aborted("upload rejected".into())));
        drop(reader);
    }

    #[tokio::test]
    async fn test_abort_discards_buffered_data() {
        let (mut writer, mut reader) = bridge(64);
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        writer.abort("boom");

        assert_eq!(reader.read().await, Some(Err(BridgeError::Aborted("boom".into()))));
        assert_eq!(reader.read().await, Some(Err(BridgeError::Aborted("boom".into()))));
    }

    #[tokio::test]
    async fn test_finish_drains_before_end_of_data() {
        let (mut writer, mut reader) = bridge(64);
        writer.write(Bytes::from_static(b"tail")).await.unwrap();
        writer.finish();

        assert_eq!(reader.read().await, Some(Ok(Bytes::from_static(b"tail"))));
        assert_eq!(reader.read().await, None);
    }

    #[tokio::test]
    async fn test_dropped_writer_aborts() {
        let (writer, mut reader) = bridge(8);
        drop(writer);

        assert!(matches!(reader.read().await, Some(Err(BridgeError::Aborted(_)))));
    }

    #[tokio::test]
    async fn test_dropped_reader_fails_writes() {
        let (mut writer, reader) = bridge(8);
        drop(reader);

        assert_eq!(
            writer.write(Bytes::from_static(b"late")).await,
            Err(BridgeError::Closed)
        );
    }

    #[tokio::test]
    async fn test_stream_stops_after_error() {
        let (writer, reader) = bridge(8);
        writer.abort("gone");

        let items: Vec<_> = reader.into_stream().collect().await;
        assert_eq!(items, vec![Err(BridgeError::Aborted("gone".into()))]);
    }
}
