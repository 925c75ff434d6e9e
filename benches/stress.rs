use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use coachbook::config::EngineConfig;
use coachbook::engine::{Engine, EngineError, RuleDefinition};
use coachbook::model::*;

fn open_engine() -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("coachbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let config = EngineConfig {
        energy_max_retries: 32,
        ..EngineConfig::default()
    };
    Arc::new(Engine::new(dir.join("ledger.wal"), config).expect("open engine"))
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

/// Hour-long slot `n` counted from 06:00 on the base date, 14 per day.
fn slot(base: NaiveDate, n: u64) -> (NaiveDate, NaiveTime, NaiveTime) {
    let date = base + Days::new(n / 14);
    let hour = 6 + (n % 14) as u32;
    let start = NaiveTime::from_hms_opt(hour, 0, 0).expect("valid hour");
    let end = NaiveTime::from_hms_opt(hour + 1, 0, 0).expect("valid hour");
    (date, start, end)
}

async fn setup(engine: &Engine, coaches: u64, students: u64) {
    engine
        .define_card(Card {
            id: 1,
            name: "bench pack".into(),
            times: 10_000,
            duration_days: None,
            active: true,
        })
        .await
        .expect("define card");
    for c in 0..coaches {
        engine.register_coach(1_000 + c, None).await.expect("register coach");
    }
    for s in 0..students {
        engine.register_student(s, None).await.expect("register student");
        engine.purchase_membership(s, 1, None).await.expect("purchase");
    }
    engine
        .define_rule(RuleDefinition {
            code: "training".into(),
            name: "Training completed".into(),
            points: 10,
            multiplier: 1.0,
            daily_limit: None,
            weekly_limit: None,
            monthly_limit: None,
        })
        .await
        .expect("define rule");
    println!("  {coaches} coaches, {students} students");
}

async fn phase1_sequential(engine: &Engine, base: NaiveDate) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let (date, s, e) = slot(base, i);
        let t = Instant::now();
        engine
            .create_booking(BookingRequest {
                student_id: 0,
                coach_id: 1_000,
                schedule_id: None,
                date,
                start: s,
                end: e,
                course_type: "private".into(),
                remark: None,
            })
            .await
            .expect("sequential booking");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every task books with its own student against a small pool of coaches,
/// so coach locks are contended and some slots conflict.
async fn phase2_contended(engine: Arc<Engine>, base: NaiveDate, coaches: u64, students: u64) {
    let n_per_task = 200;
    let start = Instant::now();
    let mut handles = Vec::new();

    for s in 1..students {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(n_per_task);
            let mut conflicts = 0u64;
            for j in 0..n_per_task as u64 {
                let (date, st, en) = slot(base, j);
                let t = Instant::now();
                let result = engine
                    .create_booking(BookingRequest {
                        student_id: s,
                        coach_id: 1_000 + (s + j) % coaches,
                        schedule_id: None,
                        date,
                        start: st,
                        end: en,
                        course_type: "group".into(),
                        remark: None,
                    })
                    .await;
                latencies.push(t.elapsed());
                match result {
                    Ok(_) => {}
                    Err(EngineError::Conflict { .. }) => conflicts += 1,
                    Err(e) => panic!("unexpected booking error: {e}"),
                }
            }
            (latencies, conflicts)
        }));
    }

    let mut latencies = Vec::new();
    let mut conflicts = 0;
    for h in handles {
        let (l, c) = h.await.expect("booking task");
        latencies.extend(l);
        conflicts += c;
    }

    let elapsed = start.elapsed();
    let total = latencies.len();
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {} tasks x {n_per_task} attempts = {total} in {:.2}s = {ops:.0} ops/sec, {conflicts} conflicts",
        students - 1,
        elapsed.as_secs_f64()
    );
    print_latency("booking latency", &mut latencies);
}

/// Many tasks earning on the same account: every posting races on one
/// version.
async fn phase3_energy_hot_account(engine: Arc<Engine>) {
    let n_tasks = 16;
    let n_per_task = 100;
    let start = Instant::now();
    let mut handles = Vec::new();

    for task in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(n_per_task);
            let mut exhausted = 0u64;
            for j in 0..n_per_task {
                let reference = Reference::new("bench", format!("{task}-{j}"));
                let t = Instant::now();
                match engine.earn(42, "training", reference, None).await {
                    Ok(_) => latencies.push(t.elapsed()),
                    Err(EngineError::ConcurrencyExhausted { .. }) => exhausted += 1,
                    Err(e) => panic!("unexpected energy error: {e}"),
                }
            }
            (latencies, exhausted)
        }));
    }

    let mut latencies = Vec::new();
    let mut exhausted = 0;
    for h in handles {
        let (l, x) = h.await.expect("energy task");
        latencies.extend(l);
        exhausted += x;
    }

    let elapsed = start.elapsed();
    let account = engine.energy_account(42);
    println!(
        "  {} postings in {:.2}s, {exhausted} gave up, balance={} version={}",
        latencies.len(),
        elapsed.as_secs_f64(),
        account.balance,
        account.version
    );
    print_latency("earn latency", &mut latencies);
}

async fn phase4_compaction(engine: &Engine) {
    let appends = engine.wal_appends_since_compact().await;
    let t = Instant::now();
    engine.compact_wal().await.expect("compact");
    println!("  compacted {appends} appends in {:.2}ms", t.elapsed().as_secs_f64() * 1000.0);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).init();

    let coaches = 4;
    let students = 17;
    let base = NaiveDate::from_ymd_opt(2027, 1, 4).expect("valid date");

    println!("=== coachbook stress benchmark ===\n");

    println!("[setup]");
    let engine = open_engine();
    setup(&engine, coaches, students).await;

    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(&engine, base).await;

    println!("\n[phase 2] contended bookings");
    let later = base + Days::new(365);
    phase2_contended(engine.clone(), later, coaches, students).await;

    println!("\n[phase 3] energy CAS on one hot account");
    phase3_energy_hot_account(engine.clone()).await;

    println!("\n[phase 4] WAL compaction");
    phase4_compaction(&engine).await;

    println!("\n=== benchmark complete ===");
}
