use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ulid::Ulid;

use slotguard::booking::{BookingErrorKind, BookingService};
use slotguard::config::Config;
use slotguard::model::{Ms, ReservationCandidate, TimeWindow};
use slotguard::notify::NotifyHub;
use slotguard::store::WalStore;

const HOUR: Ms = 3_600_000; // 1 hour in ms

fn open_service() -> Arc<BookingService> {
    let dir = std::env::temp_dir().join(format!("slotguard_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let config = Config {
        data_dir: dir,
        ..Config::default()
    };
    let store = Arc::new(WalStore::open(config.wal_path(), Arc::new(NotifyHub::new())).unwrap());
    Arc::new(BookingService::from_config(store, &config))
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

fn slot(rid: Ulid, hour: i64) -> ReservationCandidate {
    ReservationCandidate::new(rid, TimeWindow::new(hour * HOUR, (hour + 1) * HOUR), "")
}

async fn phase1_sequential(svc: &BookingService) {
    let rid = Ulid::new();
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        svc.create_booking(slot(rid, i as i64)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_disjoint_concurrent(svc: &Arc<BookingService>) {
    let n_tasks = 10;
    let n_per_task = 200;
    let start = Instant::now();

    let handles: Vec<_> = (0..n_tasks)
        .map(|_| {
            let svc = svc.clone();
            tokio::spawn(async move {
                let rid = Ulid::new();
                for j in 0..n_per_task {
                    svc.create_booking(slot(rid, j)).await.unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task as usize;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Many callers race for the same few slots; each slot must be won once.
async fn phase3_contended(svc: &Arc<BookingService>) {
    let rid = Ulid::new();
    let n_slots = 50;
    let contenders = 20;
    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..n_slots * contenders)
        .map(|i| {
            let svc = svc.clone();
            let wins = wins.clone();
            let conflicts = conflicts.clone();
            tokio::spawn(async move {
                let t = Instant::now();
                match svc.create_booking(slot(rid, (i % n_slots) as i64)).await {
                    Ok(_) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.kind() == BookingErrorKind::Conflict => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => eprintln!("unexpected: {e}"),
                }
                t.elapsed()
            })
        })
        .collect();

    let mut latencies = Vec::with_capacity(handles.len());
    for h in handles {
        latencies.push(h.await.unwrap());
    }

    let elapsed = start.elapsed();
    let won = wins.load(Ordering::Relaxed);
    println!(
        "  {} attempts on {n_slots} slots in {:.2}s: {won} won, {} conflicts",
        n_slots * contenders,
        elapsed.as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(won, n_slots, "a slot was double-booked or lost");
    print_latency("contended booking", &mut latencies);
}

async fn phase4_read_under_load(svc: &Arc<BookingService>) {
    let rid = Ulid::new();
    for i in 0..200 {
        svc.create_booking(slot(rid, i)).await.unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let writers: Vec<_> = (0..5)
        .map(|_| {
            let svc = svc.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let wrid = Ulid::new();
                let mut i = 0i64;
                while !stop.load(Ordering::Relaxed) {
                    let _ = svc.create_booking(slot(wrid, i)).await;
                    i += 1;
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..10)
        .map(|_| {
            let svc = svc.clone();
            tokio::spawn(async move {
                let mut latencies = Vec::with_capacity(500);
                for _ in 0..500 {
                    let t = Instant::now();
                    let listed = svc
                        .active_reservations_or_empty(rid, TimeWindow::new(0, 200 * HOUR))
                        .await;
                    assert_eq!(listed.len(), 200);
                    latencies.push(t.elapsed());
                }
                latencies
            })
        })
        .collect();

    let mut all_latencies = Vec::new();
    for h in readers {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }

    print_latency("active reservation query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    println!("=== slotguard stress benchmark ===\n");
    let svc = open_service();

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&svc).await;

    println!("\n[phase 2] concurrent disjoint bookings");
    phase2_disjoint_concurrent(&svc).await;

    println!("\n[phase 3] contended slots");
    phase3_contended(&svc).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&svc).await;

    println!("\n=== done ===");
}
