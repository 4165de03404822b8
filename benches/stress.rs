use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Duration as Days, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const GROUP_MAX: u32 = 25;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("slotwise")
        .password("slotwise");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
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
        println!("  {label}: no samples");
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

fn day(i: usize) -> String {
    let base = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default();
    (base + Days::days(i as i64)).to_string()
}

/// One program with `n_slots` daily 07:00 slots.
async fn setup_program(client: &tokio_postgres::Client, title: &str, n_slots: usize) {
    client
        .batch_execute(&format!(
            "INSERT INTO programs (catalog, title, group_max) VALUES ('live', '{title}', {GROUP_MAX})"
        ))
        .await
        .unwrap();
    for chunk in (0..n_slots).collect::<Vec<_>>().chunks(100) {
        let values: Vec<String> = chunk
            .iter()
            .map(|&i| format!("('live', '{title}', '{}', '07:00', '08:00')", day(i)))
            .collect();
        client
            .batch_execute(&format!(
                "INSERT INTO slots (catalog, program, date, start_time, end_time) VALUES {}",
                values.join(", ")
            ))
            .await
            .unwrap();
    }
}

fn reserve_sql(title: &str, slot: usize, occupancy: &str, user: &str) -> String {
    format!(
        "INSERT INTO reservations (catalog, program, date, start_time, end_time, occupancy, user_id) \
         VALUES ('live', '{title}', '{}', '07:00', '08:00', '{occupancy}', '{user}')",
        day(slot)
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let n = 2000;
    setup_program(&client, "Sequential", n).await;

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        client
            .simple_query(&reserve_sql("Sequential", i, "individual", "bench"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve latency", &mut latencies);
}

/// Many clients race for the seats of one group slot; exactly GROUP_MAX may win.
async fn phase2_contention(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    setup_program(&setup, "Contended", 1).await;
    drop(setup);

    let n_clients = 100;
    let won = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for c in 0..n_clients {
        let host = host.to_string();
        let tenant = tenant.clone();
        let won = won.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let sql = reserve_sql("Contended", 0, "group", &format!("user{c}"));
            if client.simple_query(&sql).await.is_ok() {
                won.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients, {won} seats granted (capacity {GROUP_MAX}) in {:.2}s{}",
        start.elapsed().as_secs_f64(),
        if won == GROUP_MAX as usize { "" } else { "  <-- CAPACITY VIOLATION" }
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    setup_program(&setup, "Busy", 500).await;
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let user = format!("writer{w}_{i}");
                let _ = client
                    .simple_query(&reserve_sql("Busy", i % 500, "group", &user))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 200;
    let mut readers = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        readers.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query("SELECT * FROM slots WHERE catalog = 'live' AND program = 'Busy'")
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("slot listing (500 slots)", &mut all);
}

async fn phase4_lifecycle_tick(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    setup_program(&client, "Cohort", 10).await;

    let n = 1000;
    for i in 0..n {
        let slot = i % 10;
        client
            .simple_query(&format!(
                r#"INSERT INTO bookings (user_id, catalog, program, occupancy, slots, min_persons, waiting_period_end)
                   VALUES ('u{i}', 'live', 'Cohort', 'group',
                           '[{{"date":"{}","start":"07:00","end":"08:00"}}]', 5, '2024-12-31')"#,
                day(slot)
            ))
            .await
            .ok();
    }

    let t = Instant::now();
    let rows = client
        .simple_query("SELECT * FROM lifecycle_tick WHERE as_of = '2024-12-31'")
        .await
        .unwrap();
    println!(
        "  tick over {n} waiting bookings took {:.2}ms ({} messages)",
        t.elapsed().as_secs_f64() * 1000.0,
        rows.len()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTWISE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTWISE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTWISE_PORT");

    println!("=== slotwise stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential reserve throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contention on one group slot");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] lifecycle tick");
    phase4_lifecycle_tick(&host, port).await;

    println!("\n=== benchmark complete ===");
}
