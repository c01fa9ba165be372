//! Coalescing Stream
//!
//! Public surface over one sink. Producers hand in `(offset, bytes)` ranges
//! and get control back as soon as the range is admitted; the writer task
//! commits them in admission order. Everything that looks at the sink
//! directly (flush, reads, snapshots, length changes) goes through the
//! buffer's drain barrier first.

use crate::coalesce::buffer::{BufferStats, PacketBuffer};
use crate::coalesce::config::CoalesceConfig;
use crate::coalesce::error::CoalesceError;
use crate::coalesce::packet::Packet;
use crate::coalesce::sink::{MemorySink, Sink, SinkKind, SinkReader, SinkSlot, SinkSpec};
use crate::coalesce::writer::{spawn_writer, WriterHandle};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Write-coalescing stream over a file or memory sink
///
/// Sink I/O (file writes, `fsync` on flush) runs synchronously inside the
/// writer task and inside `flush`/`dispose`. Streams over file sinks should
/// live on a multi-threaded runtime so a slow disk stalls one worker rather
/// than every task.
pub struct CoalescingStream {
    buffer: Arc<PacketBuffer>,
    sink: Arc<SinkSlot>,
    writer: Mutex<Option<WriterHandle>>,
    disposed: AtomicBool,
    config: CoalesceConfig,
}

impl std::fmt::Debug for CoalescingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingStream")
            .field("sink_kind", &self.sink.kind())
            .field("disposed", &self.is_disposed())
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl CoalescingStream {
    /// Open `spec` with a buffer of `memory_cap_bytes` (0 = unbounded) and
    /// start the writer task. Must be called from within a tokio runtime.
    pub fn open(spec: &SinkSpec, memory_cap_bytes: u64) -> Result<Self, CoalesceError> {
        Self::open_with_config(spec, CoalesceConfig::with_memory_cap(memory_cap_bytes))
    }

    pub fn open_with_config(
        spec: &SinkSpec,
        config: CoalesceConfig,
    ) -> Result<Self, CoalesceError> {
        let sink = spec.open(&config)?;
        info!(
            ?spec,
            memory_cap_bytes = config.memory_cap_bytes,
            "opening coalescing stream"
        );
        Self::with_sink(sink, config)
    }

    /// Open over a caller-supplied sink
    pub fn with_sink(sink: Box<dyn Sink>, config: CoalesceConfig) -> Result<Self, CoalesceError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(CoalesceError::ResourceUnavailable(
                "no tokio runtime available for the writer task".to_string(),
            ));
        }

        let buffer = Arc::new(PacketBuffer::new(config.memory_cap_bytes));
        let sink = Arc::new(SinkSlot::new(sink));
        let writer = spawn_writer(buffer.clone(), sink.clone());

        Ok(CoalescingStream {
            buffer,
            sink,
            writer: Mutex::new(Some(writer)),
            disposed: AtomicBool::new(false),
            config,
        })
    }

    fn ensure_open(&self) -> Result<(), CoalesceError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CoalesceError::StreamDisposed);
        }
        Ok(())
    }

    fn ensure_memory_backed(&self) -> Result<(), CoalesceError> {
        match self.sink.kind() {
            Some(SinkKind::Memory) => Ok(()),
            Some(SinkKind::File) => Err(CoalesceError::Unsupported(
                "snapshots require a memory-backed sink",
            )),
            None => Err(CoalesceError::StreamDisposed),
        }
    }

    /// Queue `bytes` for `offset`. Returns once admitted, not once committed;
    /// waits only while the buffer is paused.
    pub async fn write(&self, offset: u64, bytes: impl Into<Bytes>) -> Result<(), CoalesceError> {
        let packet = Packet::new(offset, bytes)?;
        self.write_packet(packet).await.map(|_| ())
    }

    /// Queue a prepared packet, returning its commit ticket
    pub async fn write_packet(&self, packet: Packet) -> Result<u64, CoalesceError> {
        self.ensure_open()?;
        self.buffer.admit(packet).await.map_err(|e| {
            if e.is_disposed() && self.is_disposed() {
                CoalesceError::StreamDisposed
            } else {
                e
            }
        })
    }

    /// Queue `bytes` for `offset` and wait until they are in the sink
    pub async fn write_durable(
        &self,
        offset: u64,
        bytes: impl Into<Bytes>,
    ) -> Result<(), CoalesceError> {
        let ticket = self.write_packet(Packet::new(offset, bytes)?).await?;
        self.buffer.wait_for_commit(ticket).await
    }

    /// Drain barrier: every write admitted before this call is committed and
    /// the sink's own buffering pushed down when this returns.
    pub async fn flush(&self) -> Result<(), CoalesceError> {
        self.ensure_open()?;
        self.flush_inner().await
    }

    async fn flush_inner(&self) -> Result<(), CoalesceError> {
        let committed_through = self.buffer.drain().await?;
        let sync = self.config.sync_on_flush;
        self.sink.with(|sink| sink.flush(sync))?;
        debug!(committed_through, sync, "flush complete");
        Ok(())
    }

    /// Flush, rewind, and return a reader over the committed content
    pub async fn open_for_read(&self) -> Result<SinkReader, CoalesceError> {
        self.ensure_open()?;
        self.flush_inner().await?;
        self.sink.with(|sink| {
            sink.seek(0)?;
            sink.reader()
        })
    }

    /// Move the sink cursor. No-op when the sink cannot seek or is already
    /// there. Packet commits use their own offsets and are unaffected.
    pub fn seek(&self, offset: u64) -> Result<u64, CoalesceError> {
        self.ensure_open()?;
        self.sink.with(|sink| {
            if sink.is_seekable() && sink.position() != offset {
                sink.seek(offset)
            } else {
                Ok(sink.position())
            }
        })
    }

    pub fn position(&self) -> Result<u64, CoalesceError> {
        self.ensure_open()?;
        self.sink.with(|sink| Ok(sink.position()))
    }

    /// Truncate or extend the sink once pending writes are committed
    pub async fn set_length(&self, len: u64) -> Result<(), CoalesceError> {
        self.ensure_open()?;
        self.flush_inner().await?;
        self.sink.with(|sink| sink.set_len(len))
    }

    /// Size of the sink once pending writes are committed
    pub async fn length(&self) -> Result<u64, CoalesceError> {
        self.ensure_open()?;
        self.flush_inner().await?;
        self.sink.with(|sink| sink.size())
    }

    /// Copy of the committed content (memory sinks only)
    pub async fn snapshot(&self) -> Result<Vec<u8>, CoalesceError> {
        self.ensure_open()?;
        self.ensure_memory_backed()?;
        self.flush_inner().await?;
        self.sink
            .with(|sink| Ok(sink.snapshot()))?
            .ok_or(CoalesceError::Unsupported(
                "snapshots require a memory-backed sink",
            ))
    }

    /// Replace the memory sink's content. Rejected with `NotIdle` unless no
    /// write is pending or in flight.
    pub fn set_snapshot(&self, bytes: Vec<u8>) -> Result<(), CoalesceError> {
        self.ensure_open()?;
        self.ensure_memory_backed()?;
        let len = bytes.len();
        self.buffer.with_idle(|| {
            self.sink.replace(Box::new(MemorySink::from_bytes(bytes)));
        })?;
        debug!(len, "memory sink replaced from snapshot");
        Ok(())
    }

    /// Swap in the sink described by `spec`. The new sink is opened first;
    /// the swap happens only while the stream is idle, and the old sink is
    /// flushed and released afterwards.
    pub fn reconfigure(&self, spec: &SinkSpec) -> Result<(), CoalesceError> {
        self.ensure_open()?;
        let next = spec.open(&self.config)?;
        let previous = self.buffer.with_idle(|| self.sink.replace(next))?;

        if let Some(mut previous) = previous {
            if let Err(e) = previous.flush(self.config.sync_on_flush) {
                warn!("flushing replaced sink failed: {}", e);
            }
        }
        info!(?spec, "coalescing stream reconfigured");
        Ok(())
    }

    /// Flush, stop the writer task, and release the buffer and sink.
    ///
    /// Safe to call more than once; only the first call does any work and
    /// reports the result of its final flush.
    pub async fn dispose(&self) -> Result<(), CoalesceError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Stalled producers fail here rather than slip in behind the final drain
        self.buffer.close_admission();
        let flushed = self.flush_inner().await;
        if let Err(e) = &flushed {
            warn!("final flush before dispose failed: {}", e);
        }

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let exit = writer.shutdown().await;
            debug!(?exit, "writer task stopped");
        }

        self.buffer.dispose();
        if let Some(mut sink) = self.sink.release() {
            if let Err(e) = sink.flush(self.config.sync_on_flush) {
                warn!("flushing sink on release failed: {}", e);
            }
        }

        info!("coalescing stream disposed");
        flushed
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn sink_kind(&self) -> Option<SinkKind> {
        self.sink.kind()
    }

    pub fn config(&self) -> &CoalesceConfig {
        &self.config
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }
}

impl Drop for CoalescingStream {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending_bytes = self.buffer.pending_bytes();
        if pending_bytes > 0 {
            warn!(
                pending_bytes,
                "coalescing stream dropped without dispose, discarding uncommitted writes"
            );
        }
        if let Some(writer) = self.writer.get_mut().take() {
            writer.cancel();
        }
        self.buffer.dispose();
    }
}
