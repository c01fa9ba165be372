pub mod coalesce;
pub mod observability;

#[cfg(test)]
mod stateright;

pub use coalesce::{
    BufferStats, CoalesceConfig, CoalesceError, CoalescingStream, FileSink, MemorySink, Packet,
    PacketBuffer, Sink, SinkKind, SinkReader, SinkSpec,
};
