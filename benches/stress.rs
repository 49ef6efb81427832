use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const T0: i64 = 1_700_000_000_000;
const SLOT: i64 = 15_000; // 15 s slots in ms

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(format!("bench_{}", Ulid::new()))
        .user("bench")
        .password("marquee");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Register a 15 s video on the client's tenant and return its id.
async fn register_content(client: &tokio_postgres::Client) -> String {
    let msgs = client
        .simple_query(
            "INSERT INTO contents (title, kind, url, duration) VALUES ('Bench loop', 'video', 'https://cdn/bench.mp4', 15)",
        )
        .await
        .unwrap();
    msgs.iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(r) => r.get("id").map(str::to_string),
            _ => None,
        })
        .expect("content row")
}

async fn schedule(client: &tokio_postgres::Client, content_id: &str, start: i64) {
    client
        .batch_execute(&format!(
            "INSERT INTO schedules (content_id, start) VALUES ('{content_id}', {start})"
        ))
        .await
        .unwrap();
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let cid = register_content(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        schedule(&client, &cid, T0 + (i as i64) * SLOT).await;
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} schedules in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every insert lands on the same instant, so each one is shifted behind
/// the whole timeline.
async fn phase2_conflicting(host: &str, port: u16) {
    let client = connect(host, port).await;
    let cid = register_content(&client).await;

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for _ in 0..n {
        let t = Instant::now();
        schedule(&client, &cid, T0).await;
        latencies.push(t.elapsed());
    }
    println!("  {n} shifted schedules in {:.2}s", start.elapsed().as_secs_f64());
    print_latency("shift latency", &mut latencies);
}

async fn phase3_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let cid = register_content(&client).await;
            for j in 0..n_per_task {
                schedule(&client, &cid, T0 + (j as i64) * SLOT).await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} displays x {n_per_task} schedules = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase4_playback_reads(host: &str, port: u16) {
    let client = connect(host, port).await;
    let cid = register_content(&client).await;
    for i in 0..500 {
        schedule(&client, &cid, T0 + i * SLOT).await;
    }

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    for i in 0..n {
        let at = T0 + (i as i64 * 7_919) % (500 * SLOT);
        let t = Instant::now();
        client
            .simple_query(&format!("SELECT * FROM current WHERE at = {at}"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    print_latency("current() latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("MARQUEE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("MARQUEE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid MARQUEE_PORT");

    println!("=== marquee stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential, non-conflicting writes");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] conflicting writes");
    phase2_conflicting(&host, port).await;

    println!("\n[phase 3] concurrent displays");
    phase3_concurrent(&host, port).await;

    println!("\n[phase 4] playback reads");
    phase4_playback_reads(&host, port).await;

    println!("\n=== benchmark complete ===");
}
