//! Writer Task
//!
//! The writer task is the only consumer of the packet buffer and the only
//! mutator of the sink while it runs. It handles one packet at a time: take,
//! seek, write, release the packet, report the commit.
//!
//! ## Architecture
//!
//! ```text
//! Producer 1 ──┐
//! Producer 2 ──┤──► PacketBuffer ──► WriterTask ──► seek + write ──► Sink
//! Producer 3 ──┘                         │
//!                                        └──► mark_committed ──► drain barriers
//! ```
//!
//! Cancellation is observed only between packets. A write that has started
//! always finishes; packets still queued at that point are left behind, so
//! callers flush before cancelling when they need them.

use crate::coalesce::buffer::PacketBuffer;
use crate::coalesce::error::CoalesceError;
use crate::coalesce::sink::SinkSlot;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Why the writer task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterExit {
    /// Cancellation observed between packets
    Cancelled,
    /// Buffer or sink was released underneath the task
    Closed,
    /// A sink write failed; the buffer was marked failed with this reason
    Failed(String),
    /// The task panicked or was aborted
    Aborted,
}

/// Writer task that owns the consuming side of the buffer
pub struct WriterTask {
    buffer: Arc<PacketBuffer>,
    sink: Arc<SinkSlot>,
    cancel: CancellationToken,
    packets_written: u64,
    bytes_written: u64,
}

impl WriterTask {
    fn new(buffer: Arc<PacketBuffer>, sink: Arc<SinkSlot>, cancel: CancellationToken) -> Self {
        WriterTask {
            buffer,
            sink,
            cancel,
            packets_written: 0,
            bytes_written: 0,
        }
    }

    /// Run the writer loop until cancelled, closed or failed
    pub async fn run(mut self) -> WriterExit {
        debug!("writer task started");

        let exit = loop {
            let packet = match self.buffer.take(&self.cancel).await {
                Ok(packet) => packet,
                Err(CoalesceError::Cancelled) => break WriterExit::Cancelled,
                Err(CoalesceError::ResourceUnavailable(reason)) => {
                    break WriterExit::Failed(reason)
                }
                Err(_) => break WriterExit::Closed,
            };

            let offset = packet.offset();
            let len = packet.len();
            let result = self
                .sink
                .with(|sink| sink.write_at(offset, packet.payload()));
            // Release the packet's buffer before reporting the commit
            drop(packet);

            match result {
                Ok(()) => {
                    self.buffer.mark_committed(len);
                    self.packets_written = self.packets_written.saturating_add(1);
                    self.bytes_written = self.bytes_written.saturating_add(u64::from(len));
                }
                Err(CoalesceError::StreamDisposed) => break WriterExit::Closed,
                Err(e) => {
                    let cause = match e {
                        CoalesceError::ResourceUnavailable(msg) => msg,
                        other => other.to_string(),
                    };
                    let reason = format!(
                        "write of {} bytes at offset {} failed: {}",
                        len, offset, cause
                    );
                    error!("{}", reason);
                    self.buffer.fail(reason.clone());
                    break WriterExit::Failed(reason);
                }
            }
        };

        info!(
            packets_written = self.packets_written,
            bytes_written = self.bytes_written,
            ?exit,
            "writer task exiting"
        );
        exit
    }
}

// ============================================================================
// WriterHandle - owner-side control of a spawned writer task
// ============================================================================

/// Handle for cancelling and joining the writer task
#[derive(Debug)]
pub struct WriterHandle {
    cancel: CancellationToken,
    task: JoinHandle<WriterExit>,
}

impl WriterHandle {
    /// Request cooperative cancellation without waiting
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the task to exit. An in-progress write completes
    /// first.
    pub async fn shutdown(self) -> WriterExit {
        self.cancel.cancel();
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                error!("writer task did not exit cleanly: {}", e);
                WriterExit::Aborted
            }
        }
    }
}

/// Spawn a writer task on the current tokio runtime
pub fn spawn_writer(buffer: Arc<PacketBuffer>, sink: Arc<SinkSlot>) -> WriterHandle {
    let cancel = CancellationToken::new();
    let task = WriterTask::new(buffer, sink, cancel.clone());
    WriterHandle {
        cancel,
        task: tokio::spawn(task.run()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coalesce::packet::Packet;
    use crate::coalesce::sink::{MemorySink, Sink, SinkKind, SinkReader};
    use parking_lot::Mutex;
    use std::io::{Error as IoError, ErrorKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory sink whose writes are slow and observable from the test
    struct SlowSink {
        inner: Arc<Mutex<MemorySink>>,
        started: Arc<AtomicBool>,
        delay: Duration,
    }

    impl Sink for SlowSink {
        fn kind(&self) -> SinkKind {
            SinkKind::Memory
        }

        fn position(&self) -> u64 {
            self.inner.lock().position()
        }

        fn seek(&mut self, pos: u64) -> Result<u64, IoError> {
            self.inner.lock().seek(pos)
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
            self.started.store(true, Ordering::SeqCst);
            // Byte at a time so a torn write would be visible
            for chunk in data.chunks(1) {
                std::thread::sleep(self.delay / data.len().max(1) as u32);
                self.inner.lock().write_all(chunk)?;
            }
            Ok(())
        }

        fn flush(&mut self, _sync: bool) -> Result<(), IoError> {
            Ok(())
        }

        fn size(&mut self) -> Result<u64, IoError> {
            self.inner.lock().size()
        }

        fn set_len(&mut self, len: u64) -> Result<(), IoError> {
            self.inner.lock().set_len(len)
        }

        fn reader(&mut self) -> Result<SinkReader, IoError> {
            self.inner.lock().reader()
        }
    }

    /// Sink that refuses every write
    struct BrokenSink;

    impl Sink for BrokenSink {
        fn kind(&self) -> SinkKind {
            SinkKind::File
        }

        fn position(&self) -> u64 {
            0
        }

        fn seek(&mut self, pos: u64) -> Result<u64, IoError> {
            Ok(pos)
        }

        fn write_all(&mut self, _data: &[u8]) -> Result<(), IoError> {
            Err(IoError::new(ErrorKind::Other, "device unplugged"))
        }

        fn flush(&mut self, _sync: bool) -> Result<(), IoError> {
            Ok(())
        }

        fn size(&mut self) -> Result<u64, IoError> {
            Ok(0)
        }

        fn set_len(&mut self, _len: u64) -> Result<(), IoError> {
            Ok(())
        }

        fn reader(&mut self) -> Result<SinkReader, IoError> {
            Err(IoError::new(ErrorKind::Other, "device unplugged"))
        }
    }

    fn packet(offset: u64, fill: u8, len: usize) -> Packet {
        Packet::new(offset, vec![fill; len]).unwrap()
    }

    #[tokio::test]
    async fn test_writer_commits_packets_at_offsets() {
        let buffer = Arc::new(PacketBuffer::new(0));
        let slot = Arc::new(SinkSlot::new(Box::new(MemorySink::new())));
        let handle = spawn_writer(buffer.clone(), slot.clone());

        buffer.admit(packet(4, b'B', 4)).await.unwrap();
        buffer.admit(packet(0, b'A', 4)).await.unwrap();
        buffer.drain().await.unwrap();

        let content = slot.with(|s| Ok(s.snapshot())).unwrap().unwrap();
        assert_eq!(content, b"AAAABBBB");

        let stats = buffer.stats();
        assert_eq!(stats.committed_packets, 2);
        assert_eq!(stats.committed_bytes, 8);
        assert_eq!(stats.pending_bytes, 0);

        assert_eq!(handle.shutdown().await, WriterExit::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancellation_completes_in_progress_write() {
        let buffer = Arc::new(PacketBuffer::new(0));
        let inner = Arc::new(Mutex::new(MemorySink::new()));
        let started = Arc::new(AtomicBool::new(false));
        let slot = Arc::new(SinkSlot::new(Box::new(SlowSink {
            inner: inner.clone(),
            started: started.clone(),
            delay: Duration::from_millis(200),
        })));
        let handle = spawn_writer(buffer.clone(), slot);

        buffer.admit(packet(0, b'a', 8)).await.unwrap();
        buffer.admit(packet(8, b'b', 8)).await.unwrap();

        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(handle.shutdown().await, WriterExit::Cancelled);

        // First packet landed whole; the queued one was never started
        assert_eq!(inner.lock().as_bytes(), b"aaaaaaaa");
        let stats = buffer.stats();
        assert_eq!(stats.committed_packets, 1);
        assert_eq!(stats.queued_packets, 1);
    }

    #[tokio::test]
    async fn test_write_failure_fails_buffer() {
        let buffer = Arc::new(PacketBuffer::new(0));
        let slot = Arc::new(SinkSlot::new(Box::new(BrokenSink)));
        let handle = spawn_writer(buffer.clone(), slot);

        buffer.admit(packet(0, 1, 4)).await.unwrap();
        let err = buffer.drain().await.unwrap_err();
        assert!(
            matches!(err, CoalesceError::ResourceUnavailable(ref m) if m.contains("device unplugged")),
            "unexpected error: {:?}",
            err
        );

        let err = buffer.admit(packet(4, 1, 4)).await.unwrap_err();
        assert!(matches!(err, CoalesceError::ResourceUnavailable(_)));

        match handle.shutdown().await {
            WriterExit::Failed(reason) => assert!(reason.contains("offset 0")),
            other => panic!("unexpected exit: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_leaves_queued_packets() {
        let buffer = Arc::new(PacketBuffer::new(0));
        let slot = Arc::new(SinkSlot::new(Box::new(MemorySink::new())));
        let handle = spawn_writer(buffer.clone(), slot.clone());

        handle.cancel();
        assert_eq!(handle.shutdown().await, WriterExit::Cancelled);

        buffer.admit(packet(0, 1, 4)).await.unwrap();
        assert_eq!(buffer.stats().queued_packets, 1);
        let content = slot.with(|s| Ok(s.snapshot())).unwrap().unwrap();
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn test_writer_exits_when_buffer_disposed() {
        let buffer = Arc::new(PacketBuffer::new(0));
        let slot = Arc::new(SinkSlot::new(Box::new(MemorySink::new())));
        let handle = spawn_writer(buffer.clone(), slot);

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.dispose();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
        assert_eq!(handle.shutdown().await, WriterExit::Closed);
    }
}
