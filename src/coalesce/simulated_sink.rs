//! Simulated Sink with Fault Injection
//!
//! DST-compatible memory sink that fails writes and flushes with seeded,
//! reproducible probabilities. A torn write lands a prefix of the packet
//! before reporting the error, as a short write to a real device would.

use crate::coalesce::sink::{MemorySink, Sink, SinkKind, SinkReader};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedSinkConfig {
    /// Probability of a write failing before any byte lands
    pub write_fail_prob: f64,
    /// Probability of a write landing only a prefix, then failing
    pub torn_write_prob: f64,
    /// Probability of flush failure
    pub flush_fail_prob: f64,
}

impl Default for SimulatedSinkConfig {
    fn default() -> Self {
        SimulatedSinkConfig {
            write_fail_prob: 0.01,  // 1%
            torn_write_prob: 0.005, // 0.5%
            flush_fail_prob: 0.0,
        }
    }
}

impl SimulatedSinkConfig {
    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedSinkConfig {
            write_fail_prob: 0.0,
            torn_write_prob: 0.0,
            flush_fail_prob: 0.0,
        }
    }

    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedSinkConfig {
            write_fail_prob: 0.05,
            torn_write_prob: 0.02,
            flush_fail_prob: 0.0,
        }
    }

    pub fn injects_faults(&self) -> bool {
        self.write_fail_prob > 0.0 || self.torn_write_prob > 0.0 || self.flush_fail_prob > 0.0
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedSinkStats {
    pub write_attempts: u64,
    pub write_failures: u64,
    pub torn_writes: u64,
    pub seeks: u64,
    pub flush_attempts: u64,
    pub flush_failures: u64,
}

impl SimulatedSinkStats {
    /// Writes that did not fully land
    pub fn failed_writes(&self) -> u64 {
        self.write_failures.saturating_add(self.torn_writes)
    }
}

/// Shared view of a simulated sink that outlives handing the sink to a stream
#[derive(Clone)]
pub struct SimulatedSinkProbe {
    inner: Arc<Mutex<MemorySink>>,
    stats: Arc<Mutex<SimulatedSinkStats>>,
}

impl SimulatedSinkProbe {
    pub fn stats(&self) -> SimulatedSinkStats {
        self.stats.lock().clone()
    }

    /// Raw content, including anything a torn write left behind
    pub fn content(&self) -> Vec<u8> {
        self.inner.lock().as_bytes().to_vec()
    }
}

/// Memory sink that injects faults
pub struct SimulatedSink {
    inner: Arc<Mutex<MemorySink>>,
    config: SimulatedSinkConfig,
    rng: ChaCha8Rng,
    stats: Arc<Mutex<SimulatedSinkStats>>,
}

impl SimulatedSink {
    pub fn new(seed: u64, config: SimulatedSinkConfig) -> Self {
        SimulatedSink {
            inner: Arc::new(Mutex::new(MemorySink::new())),
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
            stats: Arc::new(Mutex::new(SimulatedSinkStats::default())),
        }
    }

    pub fn probe(&self) -> SimulatedSinkProbe {
        SimulatedSinkProbe {
            inner: Arc::clone(&self.inner),
            stats: Arc::clone(&self.stats),
        }
    }

    fn roll(&mut self, prob: f64) -> bool {
        prob > 0.0 && self.rng.gen_bool(prob.min(1.0))
    }
}

impl Sink for SimulatedSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Memory
    }

    fn position(&self) -> u64 {
        self.inner.lock().position()
    }

    fn seek(&mut self, pos: u64) -> Result<u64, IoError> {
        self.stats.lock().seeks += 1;
        self.inner.lock().seek(pos)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.stats.lock().write_attempts += 1;

        if self.roll(self.config.write_fail_prob) {
            self.stats.lock().write_failures += 1;
            return Err(IoError::new(ErrorKind::Other, "simulated write failure"));
        }

        if data.len() > 1 && self.roll(self.config.torn_write_prob) {
            let landed = self.rng.gen_range(1..data.len());
            self.inner.lock().write_all(&data[..landed])?;
            self.stats.lock().torn_writes += 1;
            return Err(IoError::new(
                ErrorKind::WriteZero,
                format!("simulated torn write: {} of {} bytes", landed, data.len()),
            ));
        }

        self.inner.lock().write_all(data)
    }

    fn flush(&mut self, _sync: bool) -> Result<(), IoError> {
        self.stats.lock().flush_attempts += 1;
        if self.roll(self.config.flush_fail_prob) {
            self.stats.lock().flush_failures += 1;
            return Err(IoError::new(ErrorKind::Other, "simulated flush failure"));
        }
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

    fn snapshot(&self) -> Option<Vec<u8>> {
        self.inner.lock().snapshot()
    }
}
