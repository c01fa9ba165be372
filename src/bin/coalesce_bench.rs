//! Segmented download simulation against a real file.
//!
//! Usage: `coalesce-bench [output-path] [total-mib] [segments]`
//!
//! Each segment task writes its byte range in shuffled chunks, the way
//! parallel HTTP range requests arrive. Buffer settings come from the
//! `COALESCE_*` environment variables.

use coalesce_stream::observability::{init_logging, LogConfig};
use coalesce_stream::{CoalesceConfig, CoalescingStream, SinkSpec};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;

const CHUNK_LEN: u64 = 16 * 1024;

fn content_byte(i: u64) -> u8 {
    (i.wrapping_mul(2_654_435_761) >> 13) as u8
}

fn chunk_bytes(offset: u64, len: u64) -> Vec<u8> {
    (offset..offset + len).map(content_byte).collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&LogConfig::from_env());

    let path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| env::temp_dir().join("coalesce-bench.bin"));
    let total_mib: u64 = env::args().nth(2).and_then(|s| s.parse().ok()).unwrap_or(64);
    let segments: u64 = env::args()
        .nth(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(8)
        .max(1);
    let total_len = total_mib * 1024 * 1024;
    let config = CoalesceConfig::from_env();

    println!("Coalescing Stream Benchmark\n");
    println!("Configuration:");
    println!("  Output:            {}", path.display());
    println!("  Size:              {} MiB", total_mib);
    println!("  Segments:          {}", segments);
    println!("  Memory cap:        {} bytes", config.memory_cap_bytes);
    println!("  File buffer:       {} bytes", config.file_buffer_bytes);
    println!("  Sync on flush:     {}\n", config.sync_on_flush);

    let spec = SinkSpec::File {
        path: path.clone(),
        truncate: true,
    };
    let stream = Arc::new(CoalescingStream::open_with_config(&spec, config)?);

    let start = Instant::now();
    let segment_len = total_len.div_ceil(segments);
    let mut handles = Vec::new();
    for segment in 0..segments {
        let stream = stream.clone();
        let seg_start = segment * segment_len;
        let seg_end = (seg_start + segment_len).min(total_len);
        handles.push(tokio::spawn(async move {
            let mut offsets: Vec<u64> = (seg_start..seg_end).step_by(CHUNK_LEN as usize).collect();
            offsets.shuffle(&mut ChaCha8Rng::seed_from_u64(segment));
            for offset in offsets {
                let len = CHUNK_LEN.min(seg_end - offset);
                stream.write(offset, chunk_bytes(offset, len)).await?;
            }
            Ok::<(), coalesce_stream::CoalesceError>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }
    let admitted = start.elapsed();

    stream.flush().await?;
    let flushed = start.elapsed();
    let stats = stream.stats();
    stream.dispose().await?;

    let secs = flushed.as_secs_f64().max(f64::EPSILON);
    println!("Results:");
    println!("  All writes admitted: {:.2?}", admitted);
    println!("  Flushed:             {:.2?}", flushed);
    println!(
        "  Throughput:          {:.1} MiB/s",
        total_len as f64 / (1024.0 * 1024.0) / secs
    );
    println!("  Buffer stats:\n{}", serde_json::to_string_pretty(&stats)?);

    let written = std::fs::read(&path)?;
    let expected = crc32fast::hash(&chunk_bytes(0, total_len));
    let actual = crc32fast::hash(&written);
    if written.len() as u64 != total_len || actual != expected {
        return Err(format!(
            "verification failed: {} bytes, crc {:08x} (expected {} bytes, crc {:08x})",
            written.len(),
            actual,
            total_len,
            expected
        )
        .into());
    }
    println!("\nVerified {} bytes (crc32 {:08x})", written.len(), actual);

    Ok(())
}
