//! Single-slot conduit between the blocking archive producer and the async HTTP body.
//!
//! The producer side ([`BridgeWriter`]) runs on a blocking thread and hands over chunks of up to
//! [`CHUNK_SIZE`] bytes; each handover waits until the one before it has been taken by the
//! consumer ([`BridgeReader`]).  So the producer is never more than one queued chunk ahead of
//! the network, and a slow client slows the filesystem walk down instead of filling memory.
//!
//! The two halves share a [`CancellationToken`].  The reader cancels it when it is dropped or
//! [`BridgeReader::cancel`] is called, which makes any pending or future [`BridgeWriter::write`]
//! fail with [`Error::Cancelled`].
//!
//! ```text
//!   Idle ──first chunk──▶ Streaming ──signal_done/error──▶ Draining ──final read──▶ Closed
//!    └──────────────signal_done/error──────────────────────▲
//! ```

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result, CHUNK_SIZE};

/// Lifecycle of a bridge, shared by both halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    /// Nothing has been written yet.
    Idle,
    /// The producer has written at least one chunk.
    Streaming,
    /// The producer has signalled the end of the stream; the reader may still have a chunk to
    /// collect.
    Draining,
    /// The reader has seen the end of the stream (or an error).
    Closed,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BridgeState::Idle,
            1 => BridgeState::Streaming,
            2 => BridgeState::Draining,
            _ => BridgeState::Closed,
        }
    }
}

#[derive(Debug, Default)]
struct SharedState(AtomicU8);

impl SharedState {
    fn get(&self) -> BridgeState {
        BridgeState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: BridgeState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves from `from` to `to`; does nothing if the state is anything else.
    fn advance(&self, from: BridgeState, to: BridgeState) {
        let _ = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire);
    }
}

enum Message {
    Chunk(Bytes),
    Done,
    Failed(Error),
}

/// Creates a new bridge.  Each request gets its own; bridges are never shared.
pub fn channel() -> (BridgeWriter, BridgeReader) {
    let (tx, rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let state = Arc::new(SharedState::default());

    let writer = BridgeWriter {
        tx,
        cancel: cancel.clone(),
        state: Arc::clone(&state),
        pending: BytesMut::new(),
    };
    let reader = BridgeReader { rx, cancel, state };
    (writer, reader)
}

/// Producer half.  Every method blocks and must not be called from async code.
pub struct BridgeWriter {
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    state: Arc<SharedState>,
    /// Bytes written through `io::Write` that don't yet fill a chunk.
    pending: BytesMut,
}

impl BridgeWriter {
    /// Hands `chunk` to the consumer, waiting until the previous chunk has been taken.
    ///
    /// Fails with [`Error::Cancelled`] if the consumer went away, either before or while
    /// waiting.
    pub fn write(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.state.advance(BridgeState::Idle, BridgeState::Streaming);
        self.send(Message::Chunk(chunk))
    }

    /// Ends the stream successfully, after handing over any bytes still pending from
    /// `io::Write`.
    pub fn signal_done(mut self) -> Result<()> {
        self.flush_pending()?;
        self.state.set(BridgeState::Draining);
        self.send(Message::Done)
    }

    /// Ends the stream with `err`, which the consumer sees instead of the end of the stream.
    /// Bytes still pending from `io::Write` are discarded.
    pub fn signal_error(self, err: Error) -> Result<()> {
        debug!("archive producer failed: {err}");
        self.state.set(BridgeState::Draining);
        self.send(Message::Failed(err))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> BridgeState {
        self.state.get()
    }

    fn send(&self, message: Message) -> Result<()> {
        let sent = futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                result = self.tx.send(message) => result.is_ok(),
            }
        });
        if sent {
            Ok(())
        } else {
            trace!("bridge consumer is gone");
            Err(Error::Cancelled)
        }
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        self.write(chunk)
    }
}

impl io::Write for BridgeWriter {
    /// Buffers into the pending chunk and hands it over once it reaches [`CHUNK_SIZE`].
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled.into_io(io::ErrorKind::BrokenPipe));
        }
        if self.pending.capacity() == 0 {
            self.pending.reserve(CHUNK_SIZE);
        }

        let n = buf.len().min(CHUNK_SIZE - self.pending.len());
        self.pending.extend_from_slice(&buf[..n]);

        if self.pending.len() == CHUNK_SIZE {
            self.flush_pending()
                .map_err(|err| err.into_io(io::ErrorKind::BrokenPipe))?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()
            .map_err(|err| err.into_io(io::ErrorKind::BrokenPipe))
    }
}

impl fmt::Debug for BridgeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeWriter")
            .field("state", &self.state.get())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Consumer half.
pub struct BridgeReader {
    rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    state: Arc<SharedState>,
}

impl BridgeReader {
    /// Waits for the next chunk.
    ///
    /// Returns `Ok(None)` once the producer has signalled the end of the stream, or the
    /// producer's error if it signalled one.  A producer that goes away without signalling
    /// anything is reported as [`Error::ProducerVanished`], never as a clean end.  After any of
    /// these the bridge is closed and further reads fail with [`Error::BridgeClosed`].
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        if self.state.get() == BridgeState::Closed {
            return Err(Error::BridgeClosed);
        }

        let message = self.rx.recv().await;
        if !matches!(message, Some(Message::Chunk(_))) {
            self.close();
        }

        match message {
            Some(Message::Chunk(chunk)) => Ok(Some(chunk)),
            Some(Message::Done) => Ok(None),
            Some(Message::Failed(err)) => Err(Error::Producer(Box::new(err))),
            None => Err(Error::ProducerVanished),
        }
    }

    /// Tells the producer to stop.  Pending and future writes fail with
    /// [`Error::Cancelled`].
    pub fn cancel(&mut self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> BridgeState {
        self.state.get()
    }

    /// Number of chunks handed over but not yet read.  Never more than one.
    pub fn depth(&self) -> usize {
        self.rx.len()
    }

    fn close(&mut self) {
        self.state.set(BridgeState::Closed);
        self.rx.close();
    }
}

impl Drop for BridgeReader {
    fn drop(&mut self) {
        if self.state.get() != BridgeState::Closed {
            debug!("bridge reader dropped before the end of the stream, cancelling producer");
        }
        self.cancel.cancel();
    }
}

impl fmt::Debug for BridgeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeReader")
            .field("state", &self.state.get())
            .field("depth", &self.rx.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{io::Write, thread, time::Duration};

    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let (mut writer, mut reader) = channel();
        assert_eq!(reader.state(), BridgeState::Idle);

        let producer = thread::spawn(move || {
            for i in 0..10u8 {
                writer.write(Bytes::from(vec![i; 3])).unwrap();
            }
            writer.signal_done().unwrap();
        });

        let mut received = vec![];
        while let Some(chunk) = reader.read().await.unwrap() {
            assert!(matches!(
                reader.state(),
                BridgeState::Streaming | BridgeState::Draining
            ));
            received.push(chunk[0]);
        }
        producer.join().unwrap();

        assert_eq!(received, (0..10u8).collect::<Vec<_>>());
        assert_eq!(reader.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn test_read_after_close_fails() {
        let (writer, mut reader) = channel();
        thread::spawn(move || writer.signal_done().unwrap());

        assert!(reader.read().await.unwrap().is_none());
        assert!(matches!(reader.read().await, Err(Error::BridgeClosed)));
        assert!(matches!(reader.read().await, Err(Error::BridgeClosed)));
    }

    #[tokio::test]
    async fn test_producer_error_is_surfaced() {
        let (mut writer, mut reader) = channel();
        thread::spawn(move || {
            writer.write(Bytes::from_static(b"partial")).unwrap();
            writer
                .signal_error(Error::Traversal {
                    path: "/srv/gone".into(),
                    source: io::ErrorKind::NotFound.into(),
                })
                .unwrap();
        });

        assert_eq!(reader.read().await.unwrap().unwrap(), &b"partial"[..]);
        match reader.read().await {
            Err(Error::Producer(inner)) => assert!(matches!(*inner, Error::Traversal { .. })),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(reader.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn test_vanished_producer_is_not_a_clean_end() {
        let (mut writer, mut reader) = channel();
        thread::spawn(move || {
            writer.write(Bytes::from_static(b"partial")).unwrap();
            drop(writer);
        });

        assert!(reader.read().await.unwrap().is_some());
        assert!(matches!(reader.read().await, Err(Error::ProducerVanished)));
        assert!(matches!(reader.read().await, Err(Error::BridgeClosed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_depth_never_exceeds_one() {
        let (mut writer, mut reader) = channel();
        let producer = tokio::task::spawn_blocking(move || {
            for _ in 0..50 {
                writer.write(Bytes::from_static(&[0; 16])).unwrap();
            }
            writer.signal_done().unwrap();
        });

        let mut chunks = 0;
        loop {
            // give the producer every chance to run ahead
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert!(reader.depth() <= 1, "depth {}", reader.depth());
            match reader.read().await.unwrap() {
                Some(_) => chunks += 1,
                None => break,
            }
        }
        producer.await.unwrap();
        assert_eq!(chunks, 50);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropping_reader_stops_producer() {
        let (mut writer, mut reader) = channel();
        let producer = tokio::task::spawn_blocking(move || {
            let mut written = 0;
            loop {
                match writer.write(Bytes::from_static(&[1; 1024])) {
                    Ok(()) => written += 1,
                    Err(err) => return (written, err),
                }
            }
        });

        reader.read().await.unwrap().unwrap();
        drop(reader);

        let (written, err) = tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .expect("producer did not stop")
            .unwrap();
        assert!(matches!(err, Error::Cancelled));
        assert!(written < 10, "producer ran ahead: {written}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_wakes_blocked_producer() {
        let (mut writer, mut reader) = channel();
        let producer = tokio::task::spawn_blocking(move || {
            writer.write(Bytes::from_static(b"one")).unwrap();
            // blocks: the slot is taken until the reader reads
            writer.write(Bytes::from_static(b"two"))
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        reader.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .expect("producer did not stop")
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_io_write_coalesces_chunks() {
        let (mut writer, mut reader) = channel();
        let producer = thread::spawn(move || {
            for _ in 0..(CHUNK_SIZE / 512 + 1) {
                writer.write_all(&[9; 512]).unwrap();
            }
            writer.signal_done().unwrap();
        });

        let first = reader.read().await.unwrap().unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        let second = reader.read().await.unwrap().unwrap();
        assert_eq!(second.len(), 512);
        assert!(reader.read().await.unwrap().is_none());
        producer.join().unwrap();
    }

    #[test]
    fn test_io_write_after_cancel_fails() {
        let (mut writer, mut reader) = channel();
        reader.cancel();
        let err = writer.write_all(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(matches!(Error::from_io("x", err), Error::Cancelled));
    }

    #[test]
    fn test_signal_error_discards_pending() {
        let (mut writer, mut reader) = channel();
        writer.write_all(b"buffered").unwrap();
        assert_eq!(writer.state(), BridgeState::Idle);

        writer.signal_error(Error::Cancelled).unwrap();
        let result = futures::executor::block_on(reader.read());
        assert!(matches!(result, Err(Error::Producer(_))));
    }
}
