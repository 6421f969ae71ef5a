//! # Lookup Benchmark Harness
//!
//! Purpose: Provide a repeatable benchmark driver for the kvbuf codec, the
//! ILS record builder, and the sync engine over the loopback transport, so
//! baseline throughput can be compared over time.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed for stable comparisons.
//! 2. **Allocation Control**: Pre-build names and reply images to keep setup
//!    costs off the hot path.
//! 3. **Full Path Coverage**: The QUERY stage runs the same code a wrapper
//!    does: encode, call, trust check, decode.
//!
//! Usage: `li-bench [entries] [ops] [value_size]`; set `RUST_LOG=debug` for
//! engine logs.

use std::env;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use tracing::info;
use tracing_subscriber::EnvFilter;

use li_client::{LookupClient, LoopbackTransport};
use li_common::{IlsRecord, IlsValue, KvArray, Kvbuf};

const DEFAULT_ENTRY_COUNT: usize = 64;
const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_VALUE_SIZE: usize = 16;

struct BenchConfig {
    entry_count: usize,
    op_count: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        BenchConfig {
            entry_count: parse_usize(args.next(), DEFAULT_ENTRY_COUNT).max(1),
            op_count: parse_usize(args.next(), DEFAULT_OP_COUNT).max(1),
            value_size: parse_usize(args.next(), DEFAULT_VALUE_SIZE).max(1),
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, len: usize) -> usize {
        (self.next_u64() % len as u64) as usize
    }
}

fn build_names(count: usize, size: usize, rng: &mut XorShift64) -> Vec<String> {
    (0..count)
        .map(|_| {
            (0..size)
                .map(|_| char::from(b'a' + (rng.next_u64() % 26) as u8))
                .collect()
        })
        .collect()
}

/// passwd-shaped reply with one dictionary per name.
fn build_reply(names: &[String]) -> Kvbuf {
    let mut kv = Kvbuf::new();
    for (uid, name) in names.iter().enumerate() {
        kv.add_dict();
        kv.add_key("pw_name");
        kv.add_val(name);
        kv.add_key("pw_uid");
        kv.add_val(&(500 + uid).to_string());
        kv.add_key("pw_dir");
        kv.add_val(&format!("/Users/{name}"));
    }
    kv
}

fn report(label: &str, ops: usize, elapsed: std::time::Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    info!(label, ops, secs, ops_per_sec, nanos_per_op, "stage finished");
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    run()
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args();
    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let names = build_names(config.entry_count, config.value_size, &mut rng);

    let reply = build_reply(&names);
    ensure!(!reply.is_failed(), "reply buffer allocation failed");
    let image: Bytes = reply.freeze();
    println!(
        "entries={}, ops={}, value_size={}, reply_bytes={}",
        config.entry_count,
        config.op_count,
        config.value_size,
        image.len()
    );

    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(names.len());
        black_box(Kvbuf::query_key_val("login", &names[idx]));
    }
    report("ENCODE", config.op_count, start.elapsed());

    let start = Instant::now();
    for _ in 0..config.op_count {
        let array = KvArray::decode(image.clone()).context("decode reply image")?;
        black_box(array.len());
    }
    report("DECODE", config.op_count, start.elapsed());

    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(names.len());
        let record = IlsRecord::build(
            "s4s",
            &[
                IlsValue::Str(Some(&names[idx])),
                IlsValue::U32(500 + idx as u32),
                IlsValue::Str(Some("/bin/zsh")),
            ],
        )
        .context("build ils record")?;
        let header = record.header_size();
        record.release(header).context("release ils record")?;
    }
    report("ILS", config.op_count, start.elapsed());

    let transport = Arc::new(LoopbackTransport::new());
    let served = image.clone();
    transport.serve("getpwnam", move |_| served.to_vec());
    let client = LookupClient::new(transport);

    let start = Instant::now();
    for _ in 0..config.op_count {
        let idx = rng.next_index(names.len());
        let result = client
            .query_key_val("getpwnam", "login", &names[idx])
            .context("query loopback service")?;
        black_box(result);
    }
    report("QUERY", config.op_count, start.elapsed());

    let stats = client.stats();
    info!(
        queries = stats.queries,
        attempts = stats.attempts,
        retries = stats.retries,
        "engine stats"
    );
    Ok(())
}
