//! Write-Coalescing Segment Stream
//!
//! Lets many download segments write disjoint byte ranges into one output
//! without waiting on the disk. Producers admit packets into a byte-bounded
//! buffer; a single writer task commits them to the sink in admission order.
//!
//! ## Architecture
//!
//! ```text
//! write(offset, bytes) ─► PacketBuffer ─► WriterTask ─► seek + write ─► Sink
//!                          (backpressure)      │                        (file | memory)
//!                                              ▼
//! flush / read / dispose ◄─── drain barrier (committed count)
//! ```
//!
//! ## Key Properties
//!
//! - **Bounded memory**: admission pauses once pending bytes exceed the cap
//!   and resumes only after a full drain
//! - **Race-free flush**: barriers wait for commits, not for an empty queue
//! - **Single mutator**: only the writer task touches the sink while writes
//!   are outstanding
//! - **Cooperative shutdown**: an in-progress write always completes

pub mod buffer;
pub mod config;
pub mod dst;
pub mod error;
pub mod packet;
pub mod simulated_sink;
pub mod sink;
pub mod stream;
pub mod writer;

pub use buffer::{BufferStats, PacketBuffer};
pub use config::CoalesceConfig;
pub use dst::{
    run_dst_batch, summarize_batch, CoalesceDSTConfig, CoalesceDSTHarness, CoalesceDSTResult,
};
pub use error::CoalesceError;
pub use packet::Packet;
pub use simulated_sink::{SimulatedSink, SimulatedSinkConfig, SimulatedSinkStats};
pub use sink::{FileSink, MemorySink, ReadSeek, Sink, SinkKind, SinkReader, SinkSlot, SinkSpec};
pub use stream::CoalescingStream;
pub use writer::{spawn_writer, WriterExit, WriterHandle, WriterTask};
