use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use ulid::Ulid;

use holdfast::sync::{HttpTransport, SlotTransport};

fn full_week_json() -> serde_json::Value {
    let windows: Vec<serde_json::Value> = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]
        .iter()
        .map(|d| {
            serde_json::json!({
                "weekday": d,
                "start": "00:00:00",
                "end": "23:59:59",
                "slotMinutes": 30,
            })
        })
        .collect();
    serde_json::json!({ "windows": windows })
}

async fn define_schedule(client: &reqwest::Client, base: &str, rid: Ulid) {
    let resp = client
        .put(format!("{base}/schedule/{rid}"))
        .json(&full_week_json())
        .send()
        .await
        .expect("schedule request failed");
    assert!(resp.status().is_success(), "schedule update rejected");
}

fn first_slot_day() -> DateTime<Utc> {
    let tomorrow = Utc::now().date_naive() + chrono::Duration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).unwrap())
}

// 46 starts per day keeps clear of the end-of-day boundary
fn slot_at(day0: DateTime<Utc>, i: usize) -> DateTime<Utc> {
    let day = (i / 46) as i64;
    let idx = (i % 46) as i64;
    day0 + chrono::Duration::days(day) + chrono::Duration::minutes(30 * idx)
}

async fn reserve(
    client: &reqwest::Client,
    base: &str,
    rid: Ulid,
    slot: DateTime<Utc>,
    token: &str,
) -> bool {
    client
        .post(format!("{base}/slots/reserve"))
        .header("x-holder-token", token)
        .json(&serde_json::json!({ "resourceId": rid, "datetime": slot }))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

async fn release(
    client: &reqwest::Client,
    base: &str,
    rid: Ulid,
    slot: DateTime<Utc>,
    token: &str,
) -> bool {
    client
        .post(format!("{base}/slots/release"))
        .header("x-holder-token", token)
        .json(&serde_json::json!({ "resourceId": rid, "datetime": slot }))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential(base: &str, rid: Ulid) {
    let client = reqwest::Client::new();
    let day0 = first_slot_day();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let slot = slot_at(day0, i);
        let t = Instant::now();
        assert!(reserve(&client, base, rid, slot, "bench-seq").await);
        latencies.push(t.elapsed());
        assert!(release(&client, base, rid, slot, "bench-seq").await);
    }

    let elapsed = start.elapsed();
    let ops = (n * 2) as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} hold/release cycles in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("reserve latency", &mut latencies);
}

async fn phase2_contention(base: &str, rid: Ulid) {
    let n_tasks = 10;
    let n_slots = 200;
    let day0 = first_slot_day();

    let start = Instant::now();
    let mut handles = Vec::new();

    // Every task races for the same slots; each slot has one winner
    for t in 0..n_tasks {
        let base = base.to_string();
        handles.push(tokio::spawn(async move {
            let client = reqwest::Client::new();
            let token = format!("bench-task-{t}");
            let mut wins = 0usize;
            for i in 0..n_slots {
                if reserve(&client, &base, rid, slot_at(day0, i), &token).await {
                    wins += 1;
                }
            }
            wins
        }));
    }

    let mut total_wins = 0usize;
    for h in handles {
        total_wins += h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let attempts = n_tasks * n_slots;
    let ops = attempts as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_slots} contended slots: {total_wins}/{n_slots} slots won, {attempts} attempts in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(base: &str) {
    let client = reqwest::Client::new();
    let day0 = first_slot_day();

    // Resources the writers churn and the readers watch
    let mut rids = Vec::new();
    for _ in 0..5 {
        let rid = Ulid::new();
        define_schedule(&client, base, rid).await;
        rids.push(rid);
    }

    // Writer tasks: continuously cycle holds in the background
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for (w, &rid) in rids.iter().enumerate() {
        let base = base.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = reqwest::Client::new();
            let token = format!("bench-writer-{w}");
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let slot = slot_at(day0, i % 500);
                let _ = reserve(&client, &base, rid, slot, &token).await;
                let _ = release(&client, &base, rid, slot, &token).await;
                i += 1;
            }
        }));
    }

    // Reader tasks: fetch calendar snapshots of the churning resources
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let base = base.to_string();
        let rid = rids[r % rids.len()];
        reader_handles.push(tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let resp = client
                    .get(format!("{base}/slots?resourceId={rid}&days=7"))
                    .send()
                    .await
                    .unwrap();
                resp.bytes().await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("calendar snapshot", &mut all_latencies);
}

async fn phase4_stream_fanout(base: &str) {
    let n_watchers = 50;
    let n_events = 10;

    let client = reqwest::Client::new();
    let rid = Ulid::new();
    define_schedule(&client, base, rid).await;
    let day0 = first_slot_day();

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_watchers {
        let base = base.to_string();
        handles.push(tokio::spawn(async move {
            let transport = HttpTransport::new(&base).unwrap();
            let mut stream = transport.subscribe(rid).await.unwrap();
            let mut seen = 0usize;
            while seen < n_events * 2 {
                match tokio::time::timeout(Duration::from_secs(10), stream.next()).await {
                    Ok(Some(Ok(_))) => seen += 1,
                    _ => break,
                }
            }
            seen
        }));
    }

    // Give the watchers a moment to connect before mutating
    tokio::time::sleep(Duration::from_millis(300)).await;

    for i in 0..n_events {
        let slot = slot_at(day0, i);
        assert!(reserve(&client, base, rid, slot, "bench-fanout").await);
        assert!(release(&client, base, rid, slot, "bench-fanout").await);
    }

    let expected = n_events * 2;
    let mut delivered = 0usize;
    let mut complete = 0usize;
    for h in handles {
        let seen = h.await.unwrap();
        delivered += seen;
        if seen == expected {
            complete += 1;
        }
    }

    let elapsed = start.elapsed();
    println!(
        "  {n_watchers} watchers x {expected} events: {complete}/{n_watchers} saw everything, {delivered} events delivered in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("HOLDFAST_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("HOLDFAST_PORT")
        .unwrap_or_else(|_| "8080".into())
        .parse()
        .expect("invalid HOLDFAST_PORT");
    let base = format!("http://{host}:{port}");

    println!("=== holdfast stress benchmark ===");
    println!("target: {base}\n");

    // Each phase reserves on its own resources to avoid interference

    println!("[setup]");
    let client = reqwest::Client::new();
    let seq_rid = Ulid::new();
    define_schedule(&client, &base, seq_rid).await;
    let storm_rid = Ulid::new();
    define_schedule(&client, &base, storm_rid).await;
    println!("  created 2 resources");

    println!("\n[phase 1] sequential hold/release throughput");
    phase1_sequential(&base, seq_rid).await;

    println!("\n[phase 2] contended reserve storm");
    phase2_contention(&base, storm_rid).await;

    println!("\n[phase 3] snapshot latency under write load");
    phase3_read_under_load(&base).await;

    println!("\n[phase 4] event fan-out");
    phase4_stream_fanout(&base).await;

    println!("\n=== benchmark complete ===");
}
