//! End-to-end throughput benchmark for tether.
//!
//! Drives a running server with reconnecting client pumps and counts echoed
//! payloads. The target path must be a room with `echo = true`:
//!
//! ```toml
//! [[rooms]]
//! path = "/echo"
//! echo = true
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_client::{ConnectionPump, PumpConfig};
use tether_core::Hooks;

const DEFAULT_URL: &str = "ws://127.0.0.1:9000/echo";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("tether end-to-end throughput");
    println!("  target:  {}", url);
    println!("  clients: {}", num_clients);
    println!("  warmup {}s, measurement {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let echoed = Arc::new(AtomicU64::new(0));
    let mut pumps = Vec::with_capacity(num_clients);

    for _ in 0..num_clients {
        let counter = echoed.clone();
        let config = PumpConfig::new(url.clone()).with_hooks(Hooks::new().on_receive(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            None
        }));
        let pump = match ConnectionPump::websocket(config) {
            Ok(pump) => pump,
            Err(e) => {
                eprintln!("Invalid client config: {}", e);
                return;
            }
        };
        if let Err(e) = pump.run() {
            eprintln!("Client {} failed to start: {}", pump.id(), e);
            return;
        }
        pumps.push(pump);
    }

    for pump in &pumps {
        if tokio::time::timeout(Duration::from_secs(5), pump.connected())
            .await
            .is_err()
        {
            eprintln!("Client {} could not connect to {}", pump.id(), url);
            return;
        }
    }
    println!("All {} clients connected", num_clients);

    let writers: Vec<_> = pumps
        .iter()
        .cloned()
        .map(|pump| {
            tokio::spawn(async move {
                let payload = vec![0u8; 64];
                while pump.write(payload.clone()).await.is_ok() {
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;
    echoed.store(0, Ordering::SeqCst);
    let start = Instant::now();

    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed();
    let total = echoed.load(Ordering::SeqCst);

    let per_sec = total as f64 / elapsed.as_secs_f64();
    println!();
    println!("Results");
    println!("  duration:    {:>10.2}s", elapsed.as_secs_f64());
    println!("  echoed:      {:>10}", total);
    println!("  throughput:  {:>10.0} msg/s", per_sec);
    println!("  per client:  {:>10.0} msg/s", per_sec / num_clients as f64);

    for pump in &pumps {
        pump.stop();
    }
    for writer in writers {
        writer.abort();
    }
}
