//! Bounded Packet Buffer
//!
//! Mailbox between many producers and the single writer task. Capacity is a
//! byte budget with full-drain hysteresis:
//!
//! ```text
//!              pending > capacity
//!   Admitting ───────────────────► Paused
//!       ▲                            │
//!       └────────────────────────────┘
//!              pending == 0
//! ```
//!
//! Pending bytes only go down when the writer task reports a packet as
//! committed, never on dequeue. Drain barriers wait on the committed packet
//! count reaching a ticket taken at call time, so a packet that has left the
//! queue but not yet reached the sink still holds the barrier closed.

use crate::coalesce::error::CoalesceError;
use crate::coalesce::packet::Packet;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Point-in-time counters for a packet buffer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub admitted_packets: u64,
    pub committed_packets: u64,
    pub admitted_bytes: u64,
    pub committed_bytes: u64,
    pub pending_bytes: u64,
    pub peak_pending_bytes: u64,
    pub queued_packets: usize,
    /// Admitting -> Paused transitions
    pub pause_transitions: u64,
    /// Admissions that had to wait for a resume
    pub stalled_admissions: u64,
    pub paused: bool,
    pub failed: bool,
}

struct BufferState {
    queue: VecDeque<Packet>,
    pending_bytes: u64,
    paused: bool,
    closed: bool,
    /// No further packets accepted; queued and in-flight ones still commit
    admission_closed: bool,
    /// Terminal sink failure reported by the writer task
    failure: Option<String>,
    /// A packet has been taken but not yet marked committed
    in_flight: bool,
    /// Packets admitted so far; doubles as the admission ticket
    admitted: u64,
    /// Packets committed so far (FIFO, so the first `committed` tickets)
    committed: u64,
    admitted_bytes: u64,
    committed_bytes: u64,
    peak_pending_bytes: u64,
    pause_transitions: u64,
    stalled_admissions: u64,
}

impl BufferState {
    fn new() -> Self {
        BufferState {
            queue: VecDeque::new(),
            pending_bytes: 0,
            paused: false,
            closed: false,
            admission_closed: false,
            failure: None,
            in_flight: false,
            admitted: 0,
            committed: 0,
            admitted_bytes: 0,
            committed_bytes: 0,
            peak_pending_bytes: 0,
            pause_transitions: 0,
            stalled_admissions: 0,
        }
    }

    fn ensure_open(&self) -> Result<(), CoalesceError> {
        if self.closed {
            return Err(CoalesceError::BufferDisposed);
        }
        if let Some(reason) = &self.failure {
            return Err(CoalesceError::ResourceUnavailable(reason.clone()));
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.pending_bytes == 0 && self.queue.is_empty() && !self.in_flight
    }

    fn push(&mut self, packet: Packet, capacity: u64) -> u64 {
        let len = u64::from(packet.len());
        self.queue.push_back(packet);
        self.pending_bytes = self.pending_bytes.saturating_add(len);
        self.admitted_bytes = self.admitted_bytes.saturating_add(len);
        self.admitted = self.admitted.saturating_add(1);
        self.peak_pending_bytes = self.peak_pending_bytes.max(self.pending_bytes);

        if capacity > 0 && !self.paused && self.pending_bytes > capacity {
            self.paused = true;
            self.pause_transitions = self.pause_transitions.saturating_add(1);
            debug!(
                pending_bytes = self.pending_bytes,
                capacity, "packet buffer over capacity, pausing admission"
            );
        }

        self.admitted
    }
}

/// Byte-bounded FIFO of packets with hysteresis backpressure
pub struct PacketBuffer {
    /// Byte capacity (0 = unbounded)
    capacity: u64,
    state: Mutex<BufferState>,
    /// Wakes producers stalled on a paused buffer
    producers: Notify,
    /// Wakes the writer task when a packet is queued
    consumer: Notify,
    /// Wakes drain barriers after each commit
    commits: Notify,
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PacketBuffer {
    pub fn new(capacity: u64) -> Self {
        PacketBuffer {
            capacity,
            state: Mutex::new(BufferState::new()),
            producers: Notify::new(),
            consumer: Notify::new(),
            commits: Notify::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Queue a packet, waiting while the buffer is paused.
    ///
    /// Returns the packet's ticket: once `wait_for_commit(ticket)` resolves,
    /// this packet and every packet admitted before it are in the sink.
    pub async fn admit(&self, packet: Packet) -> Result<u64, CoalesceError> {
        let mut stalled = false;
        loop {
            let notified = self.producers.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                state.ensure_open()?;
                if state.admission_closed {
                    return Err(CoalesceError::BufferDisposed);
                }
                if self.capacity == 0 || !state.paused {
                    let ticket = state.push(packet, self.capacity);
                    drop(state);
                    self.consumer.notify_one();
                    return Ok(ticket);
                }
                if !stalled {
                    stalled = true;
                    state.stalled_admissions = state.stalled_admissions.saturating_add(1);
                }
            }

            notified.await;
        }
    }

    /// Oldest queued packet, waiting until one arrives or `cancel` fires.
    ///
    /// Cancellation is checked before each dequeue, so once it is observed
    /// nothing further leaves the queue.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<Packet, CoalesceError> {
        loop {
            if cancel.is_cancelled() {
                return Err(CoalesceError::Cancelled);
            }

            let notified = self.consumer.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                state.ensure_open()?;
                if let Some(packet) = state.queue.pop_front() {
                    state.in_flight = true;
                    return Ok(packet);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(CoalesceError::Cancelled),
            }
        }
    }

    /// Record that the last taken packet (of `len` bytes) is in the sink.
    /// Must only be called after the sink write returned.
    pub fn mark_committed(&self, len: u32) {
        let resumed = {
            let mut state = self.state.lock();
            debug_assert!(
                state.in_flight || state.closed || state.failure.is_some(),
                "commit reported with no packet in flight"
            );
            let len = u64::from(len);
            state.in_flight = false;
            state.pending_bytes = state.pending_bytes.saturating_sub(len);
            state.committed = state.committed.saturating_add(1);
            state.committed_bytes = state.committed_bytes.saturating_add(len);

            if state.paused && state.pending_bytes == 0 {
                state.paused = false;
                true
            } else {
                false
            }
        };

        if resumed {
            debug!("packet buffer fully drained, resuming admission");
            self.producers.notify_waiters();
        }
        self.commits.notify_waiters();
    }

    /// Wait until the packet holding `ticket` (and all before it) is committed
    pub async fn wait_for_commit(&self, ticket: u64) -> Result<(), CoalesceError> {
        self.wait_until(&self.commits, |state| {
            state.ensure_open()?;
            Ok(state.committed >= ticket)
        })
        .await
    }

    /// Drain barrier: wait for every packet admitted before this call to be
    /// committed. Packets admitted afterwards do not extend the wait.
    pub async fn drain(&self) -> Result<u64, CoalesceError> {
        let target = {
            let state = self.state.lock();
            state.ensure_open()?;
            state.admitted
        };
        self.wait_for_commit(target).await?;
        Ok(target)
    }

    /// Wait for full quiescence: nothing pending and nothing in flight
    pub async fn wait_until_all_committed(&self) -> Result<(), CoalesceError> {
        self.wait_until(&self.commits, |state| {
            state.ensure_open()?;
            Ok(state.is_idle())
        })
        .await
    }

    /// Run `f` while holding the buffer idle: no packet can be admitted or
    /// taken until it returns. Fails with `NotIdle` if anything is pending.
    pub fn with_idle<R>(&self, f: impl FnOnce() -> R) -> Result<R, CoalesceError> {
        let state = self.state.lock();
        state.ensure_open()?;
        if !state.is_idle() {
            return Err(CoalesceError::NotIdle);
        }
        Ok(f())
    }

    /// Stop accepting packets. Producers stalled on a paused buffer and
    /// every later `admit` fail with `BufferDisposed`; packets already
    /// admitted are still taken and committed, so `drain()` keeps working.
    pub fn close_admission(&self) {
        {
            let mut state = self.state.lock();
            if state.admission_closed {
                return;
            }
            state.admission_closed = true;
        }
        self.producers.notify_waiters();
    }

    pub fn is_admission_closed(&self) -> bool {
        self.state.lock().admission_closed
    }

    /// Terminal failure: queued packets are dropped and every current and
    /// future caller sees `ResourceUnavailable(reason)`.
    pub fn fail(&self, reason: impl Into<String>) {
        {
            let mut state = self.state.lock();
            if state.failure.is_none() {
                state.failure = Some(reason.into());
            }
            let dropped = state.queue.len();
            if dropped > 0 {
                warn!(dropped, "packet buffer failed, discarding queued packets");
            }
            state.queue.clear();
            state.pending_bytes = 0;
            state.in_flight = false;
            state.paused = false;
        }
        self.wake_all();
    }

    /// Close the buffer. Waiters are woken and observe `BufferDisposed`;
    /// later calls are no-ops.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.admission_closed = true;
            state.queue.clear();
            state.pending_bytes = 0;
            state.paused = false;
        }
        self.wake_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.state.lock().pending_bytes
    }

    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        BufferStats {
            admitted_packets: state.admitted,
            committed_packets: state.committed,
            admitted_bytes: state.admitted_bytes,
            committed_bytes: state.committed_bytes,
            pending_bytes: state.pending_bytes,
            peak_pending_bytes: state.peak_pending_bytes,
            queued_packets: state.queue.len(),
            pause_transitions: state.pause_transitions,
            stalled_admissions: state.stalled_admissions,
            paused: state.paused,
            failed: state.failure.is_some(),
        }
    }

    fn wake_all(&self) {
        self.producers.notify_waiters();
        self.consumer.notify_waiters();
        self.commits.notify_waiters();
    }

    async fn wait_until<F>(&self, notify: &Notify, mut ready: F) -> Result<(), CoalesceError>
    where
        F: FnMut(&BufferState) -> Result<bool, CoalesceError>,
    {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let done = {
                let state = self.state.lock();
                ready(&*state)?
            };
            if done {
                return Ok(());
            }

            notified.await;
        }
    }
}
