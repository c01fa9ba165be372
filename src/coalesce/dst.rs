//! Coalescing Stream Deterministic Simulation Testing Harness
//!
//! Verifies the stream's guarantees under randomized producer interleavings
//! and sink fault injection:
//!
//! - **Union invariant**: disjoint writes in any order produce exactly the
//!   expected content after a flush
//! - **Barrier invariant**: every write acknowledged before a `flush()` call
//!   is in the sink when that flush returns
//! - **Memory bound**: pending bytes never exceed capacity plus one packet
//! - **No silent loss**: if any sink write failed, the final flush fails
//! - **Disposal**: writes after `dispose()` are rejected, and a dispose that
//!   races producers stalled on a paused buffer never drops a write it
//!   acknowledged
//!
//! ## DST Methodology
//!
//! 1. Partition a seeded content buffer into random disjoint chunks
//! 2. Shuffle the chunks across a random number of producer tasks
//! 3. Run producers and a barrier checker on a single-threaded runtime with
//!    seeded yield points, writing into a `SimulatedSink`
//! 4. Check the invariants against the shadow content

use crate::coalesce::config::CoalesceConfig;
use crate::coalesce::error::CoalesceError;
use crate::coalesce::simulated_sink::{SimulatedSink, SimulatedSinkConfig, SimulatedSinkStats};
use crate::coalesce::stream::CoalescingStream;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;

/// Result of a single DST run
#[derive(Debug)]
pub struct CoalesceDSTResult {
    pub seed: u64,
    pub content_len: usize,
    pub chunks: usize,
    pub producers: usize,
    pub capacity: u64,
    pub max_chunk_len: usize,
    pub peak_pending_bytes: u64,
    pub acknowledged_writes: usize,
    pub rejected_writes: usize,
    pub barrier_checks: usize,
    pub content_crc: u32,
    pub sink_stats: SimulatedSinkStats,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the DST harness
#[derive(Debug, Clone)]
pub struct CoalesceDSTConfig {
    /// Upper bound on the simulated download size
    pub max_content_len: usize,
    /// Upper bound on a single chunk
    pub max_chunk_len: usize,
    /// Upper bound on concurrent producers
    pub max_producers: usize,
    /// Buffer capacities to pick from (0 = unbounded)
    pub capacities: Vec<u64>,
    /// Mid-run flush barriers to verify
    pub barrier_checks: usize,
    /// Upper bound on yields before each producer write
    pub max_yields: u32,
    /// Dispose from a separate task while producers are still writing
    pub dispose_mid_run: bool,
    /// Fault injection config
    pub sink_config: SimulatedSinkConfig,
}

impl Default for CoalesceDSTConfig {
    fn default() -> Self {
        CoalesceDSTConfig {
            max_content_len: 4096,
            max_chunk_len: 256,
            max_producers: 8,
            capacities: vec![0, 64, 256, 1024],
            barrier_checks: 4,
            max_yields: 4,
            dispose_mid_run: false,
            sink_config: SimulatedSinkConfig::default(),
        }
    }
}

impl CoalesceDSTConfig {
    /// No faults, baseline correctness
    pub fn baseline() -> Self {
        CoalesceDSTConfig {
            sink_config: SimulatedSinkConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Tiny capacities so nearly every run stalls producers
    pub fn backpressure() -> Self {
        CoalesceDSTConfig {
            max_chunk_len: 64,
            capacities: vec![1, 16, 32],
            sink_config: SimulatedSinkConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Dispose races paused producers; tiny capacities keep them stalled
    pub fn early_dispose() -> Self {
        CoalesceDSTConfig {
            max_chunk_len: 64,
            capacities: vec![1, 16, 64],
            dispose_mid_run: true,
            sink_config: SimulatedSinkConfig::no_faults(),
            ..Default::default()
        }
    }

    /// Frequent sink failures
    pub fn chaos() -> Self {
        CoalesceDSTConfig {
            sink_config: SimulatedSinkConfig::high_chaos(),
            ..Default::default()
        }
    }
}

/// One chunk of the simulated download
#[derive(Debug, Clone)]
struct Chunk {
    offset: u64,
    data: Vec<u8>,
    yields: u32,
}

/// Shared record of what producers and barriers observed
#[derive(Debug, Default)]
struct Observations {
    /// Ranges whose `write()` returned Ok, in acknowledgement order
    acknowledged: Vec<(u64, usize)>,
    rejected: usize,
    barrier_checks: usize,
    /// Result of the mid-run dispose, once it returned
    dispose_result: Option<Result<(), CoalesceError>>,
    violations: Vec<String>,
}

/// Coalescing stream DST harness
pub struct CoalesceDSTHarness {
    seed: u64,
    rng: ChaCha8Rng,
    config: CoalesceDSTConfig,
}

impl CoalesceDSTHarness {
    pub fn new(seed: u64, config: CoalesceDSTConfig) -> Self {
        CoalesceDSTHarness {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    /// Byte at position `i` of the simulated download
    fn expected_byte(seed: u64, i: u64) -> u8 {
        (i.wrapping_mul(31) ^ seed.wrapping_mul(0x9E37_79B9)).wrapping_add(i >> 8) as u8
    }

    /// Run a single DST scenario on a fresh single-threaded runtime
    pub fn run(&mut self) -> CoalesceDSTResult {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => return self.failed_setup(format!("Failed to build runtime: {}", e)),
        };
        runtime.block_on(self.run_scenario())
    }

    fn failed_setup(&self, message: String) -> CoalesceDSTResult {
        CoalesceDSTResult {
            seed: self.seed,
            content_len: 0,
            chunks: 0,
            producers: 0,
            capacity: 0,
            max_chunk_len: 0,
            peak_pending_bytes: 0,
            acknowledged_writes: 0,
            rejected_writes: 0,
            barrier_checks: 0,
            content_crc: 0,
            sink_stats: SimulatedSinkStats::default(),
            passed: false,
            error_message: Some(message),
        }
    }

    async fn run_scenario(&mut self) -> CoalesceDSTResult {
        let seed = self.seed;

        // Phase 1: Build the workload from the seed
        let content_len = self.rng.gen_range(1..=self.config.max_content_len.max(1));
        let expected: Arc<Vec<u8>> = Arc::new(
            (0..content_len as u64)
                .map(|i| Self::expected_byte(seed, i))
                .collect(),
        );

        let mut chunks = Vec::new();
        let mut offset = 0usize;
        while offset < content_len {
            let len = self
                .rng
                .gen_range(1..=self.config.max_chunk_len.max(1))
                .min(content_len - offset);
            chunks.push(Chunk {
                offset: offset as u64,
                data: expected[offset..offset + len].to_vec(),
                yields: self.rng.gen_range(0..=self.config.max_yields),
            });
            offset += len;
        }
        chunks.shuffle(&mut self.rng);
        let max_chunk_len = chunks.iter().map(|c| c.data.len()).max().unwrap_or(0);
        let chunk_count = chunks.len();

        let producers = self.rng.gen_range(1..=self.config.max_producers.max(1));
        let capacity = self
            .config
            .capacities
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(0);

        let mut assignments: Vec<Vec<Chunk>> = vec![Vec::new(); producers];
        for (i, chunk) in chunks.into_iter().enumerate() {
            assignments[i % producers].push(chunk);
        }
        let barrier_yields: Vec<u32> = (0..self.config.barrier_checks)
            .map(|_| self.rng.gen_range(0..=self.config.max_yields.saturating_mul(4)))
            .collect();
        let dispose_yields = self.rng.gen_range(0..=self.config.max_yields.saturating_mul(8));

        // Phase 2: Run producers and barrier checks against a simulated sink
        let sink = SimulatedSink::new(self.rng.gen(), self.config.sink_config.clone());
        let probe = sink.probe();
        let stream_config = CoalesceConfig {
            memory_cap_bytes: capacity,
            sync_on_flush: false,
            file_buffer_bytes: 0,
        };
        let stream = match CoalescingStream::with_sink(Box::new(sink), stream_config) {
            Ok(s) => Arc::new(s),
            Err(e) => return self.failed_setup(format!("Failed to open stream: {}", e)),
        };
        let observations = Arc::new(Mutex::new(Observations::default()));

        let mut tasks = Vec::new();
        for work in assignments {
            let stream = stream.clone();
            let observations = observations.clone();
            tasks.push(tokio::spawn(async move {
                for chunk in work {
                    for _ in 0..chunk.yields {
                        tokio::task::yield_now().await;
                    }
                    let len = chunk.data.len();
                    match stream.write(chunk.offset, chunk.data).await {
                        Ok(()) => observations.lock().acknowledged.push((chunk.offset, len)),
                        Err(e) => {
                            let mut obs = observations.lock();
                            obs.rejected += 1;
                            if obs.dispose_result.is_none()
                                && !e.is_disposed()
                                && !matches!(e, CoalesceError::ResourceUnavailable(_))
                            {
                                obs.violations
                                    .push(format!("write at {} rejected with {}", chunk.offset, e));
                            }
                            return;
                        }
                    }
                }
            }));
        }

        {
            let stream = stream.clone();
            let observations = observations.clone();
            let probe = probe.clone();
            let expected = expected.clone();
            tasks.push(tokio::spawn(async move {
                for yields in barrier_yields {
                    for _ in 0..yields {
                        tokio::task::yield_now().await;
                    }
                    let acknowledged = observations.lock().acknowledged.clone();
                    if stream.flush().await.is_err() {
                        return;
                    }
                    let content = probe.content();
                    let mut obs = observations.lock();
                    obs.barrier_checks += 1;
                    for (offset, len) in acknowledged {
                        let start = offset as usize;
                        let end = start + len;
                        if content.len() < end || content[start..end] != expected[start..end] {
                            obs.violations.push(format!(
                                "flush returned before acknowledged range {}..{} was committed",
                                start, end
                            ));
                            break;
                        }
                    }
                }
            }));
        }

        if self.config.dispose_mid_run {
            let stream = stream.clone();
            let observations = observations.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..dispose_yields {
                    tokio::task::yield_now().await;
                }
                let result = stream.dispose().await;
                observations.lock().dispose_result = Some(result);
            }));
        }

        let joined = tokio::time::timeout(
            Duration::from_secs(30),
            futures::future::join_all(tasks),
        )
        .await;
        if joined.is_err() {
            observations
                .lock()
                .violations
                .push("producers or barriers deadlocked".to_string());
        }

        // Phase 3: Final flush and invariant checks
        let final_flush = if self.config.dispose_mid_run {
            observations
                .lock()
                .dispose_result
                .clone()
                .unwrap_or_else(|| {
                    Err(CoalesceError::ResourceUnavailable(
                        "mid-run dispose never returned".to_string(),
                    ))
                })
        } else {
            match tokio::time::timeout(Duration::from_secs(10), stream.flush()).await {
                Ok(result) => result,
                Err(_) => Err(CoalesceError::ResourceUnavailable(
                    "final flush timed out".to_string(),
                )),
            }
        };
        let stats = stream.stats();
        let content = probe.content();
        let sink_stats = probe.stats();
        let acknowledged = observations.lock().acknowledged.clone();
        let mut violations = std::mem::take(&mut observations.lock().violations);

        if sink_stats.failed_writes() > 0 {
            // NO SILENT LOSS: a failed commit must poison the stream
            if !matches!(final_flush, Err(CoalesceError::ResourceUnavailable(_))) {
                violations.push(format!(
                    "{} sink writes failed but final flush returned {:?}",
                    sink_stats.failed_writes(),
                    final_flush
                ));
            }
        } else {
            if let Err(e) = &final_flush {
                violations.push(format!("final flush failed without faults: {}", e));
            }

            // ACKNOWLEDGED WRITES LAND, even when dispose cut producers off
            if let Some((offset, len)) = acknowledged.iter().copied().find(|&(offset, len)| {
                let start = offset as usize;
                content.len() < start + len || content[start..start + len] != expected[start..start + len]
            }) {
                violations.push(format!(
                    "acknowledged range {}..{} missing after final flush",
                    offset,
                    offset as usize + len
                ));
            }

            // UNION INVARIANT
            if !self.config.dispose_mid_run && content != *expected {
                let first_diff = content
                    .iter()
                    .zip(expected.iter())
                    .position(|(a, b)| a != b)
                    .unwrap_or_else(|| content.len().min(expected.len()));
                violations.push(format!(
                    "content mismatch: len {} vs expected {}, first difference at {}",
                    content.len(),
                    expected.len(),
                    first_diff
                ));
            }
        }

        // MEMORY BOUND
        if capacity > 0 && stats.peak_pending_bytes > capacity + max_chunk_len as u64 {
            violations.push(format!(
                "peak pending {} exceeds capacity {} + packet {}",
                stats.peak_pending_bytes, capacity, max_chunk_len
            ));
        }

        // DISPOSAL
        let disposed = stream.dispose().await;
        if !self.config.dispose_mid_run && sink_stats.failed_writes() == 0 {
            if let Err(e) = disposed {
                violations.push(format!("dispose failed without faults: {}", e));
            }
        }
        match stream.write(0, vec![0u8]).await {
            Err(e) if e.is_disposed() => {}
            other => violations.push(format!("write after dispose returned {:?}", other)),
        }

        let obs = observations.lock();
        let passed = violations.is_empty();
        let error_message = if passed {
            None
        } else {
            Some(format!("INVARIANT VIOLATION: {}", violations.join("; ")))
        };

        CoalesceDSTResult {
            seed,
            content_len,
            chunks: chunk_count,
            producers,
            capacity,
            max_chunk_len,
            peak_pending_bytes: stats.peak_pending_bytes,
            acknowledged_writes: obs.acknowledged.len(),
            rejected_writes: obs.rejected,
            barrier_checks: obs.barrier_checks,
            content_crc: crc32fast::hash(&content),
            sink_stats,
            passed,
            error_message,
        }
    }
}

/// Run a batch of DST tests across multiple seeds
pub fn run_dst_batch(
    seeds: std::ops::Range<u64>,
    config: CoalesceDSTConfig,
) -> Vec<CoalesceDSTResult> {
    seeds
        .map(|seed| {
            let mut harness = CoalesceDSTHarness::new(seed, config.clone());
            harness.run()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_batch(results: &[CoalesceDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let total_chunks: usize = results.iter().map(|r| r.chunks).sum();
    let total_acked: usize = results.iter().map(|r| r.acknowledged_writes).sum();
    let total_rejected: usize = results.iter().map(|r| r.rejected_writes).sum();
    let total_barriers: usize = results.iter().map(|r| r.barrier_checks).sum();
    let faulted = results
        .iter()
        .filter(|r| r.sink_stats.failed_writes() > 0)
        .count();

    let mut summary = format!(
        "Coalesce DST Batch: {}/{} passed ({} failed)\n\
         Chunks: {}, Acknowledged: {}, Rejected: {}, Barrier checks: {}, Runs with sink faults: {}",
        passed, total, failed, total_chunks, total_acked, total_rejected, total_barriers, faulted
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}
