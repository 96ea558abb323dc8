use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::tempdir;
use vtbus::pubchannel::{Channel, Subscription};

const PAYLOAD_SIZE: usize = 4096;
const SLOTS: u32 = 8;
const FRAMES: usize = 2000;

fn bench_publish_receive_latency(_c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let channel = Channel::create(dir.path(), "bench", PAYLOAD_SIZE as u64, SLOTS, b"{}").expect("create");
    let publisher = channel.publisher();
    let mut subscriber = Subscription::open(dir.path(), "bench").expect("subscribe");

    let payload = vec![0u8; PAYLOAD_SIZE];
    let mut latencies = Vec::with_capacity(FRAMES);

    println!("\nRunning PubChannel publish/receive latency benchmark...");
    println!("  Payload size: {PAYLOAD_SIZE} bytes");
    println!("  Slots:        {SLOTS}");
    println!("  Frames:       {FRAMES}");

    let start = Instant::now();
    for _ in 0..FRAMES {
        let send_at = start.elapsed();
        publisher.publish(&payload, "raw", send_at.as_secs(), send_at.subsec_micros()).expect("publish");
        subscriber.receive().expect("receive");
        let recv_at = start.elapsed();
        latencies.push(recv_at.saturating_sub(send_at));
    }

    latencies.sort_unstable();
    let p50 = latencies[latencies.len() / 2];
    let p99 = latencies[(latencies.len() as f64 * 0.99) as usize];

    println!("\nLatency:");
    println!("  P50: {p50:?}");
    println!("  P99: {p99:?}");
    println!("  Max: {:?}", latencies[latencies.len() - 1]);
    assert!(p50 < Duration::from_secs(1), "sanity check: publish/receive should be well under a second");
}

criterion_group!(benches, bench_publish_receive_latency);
criterion_main!(benches);
