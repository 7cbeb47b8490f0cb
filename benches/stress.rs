use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ulid::Ulid;

use lessonbook::config::Config;
use lessonbook::engine::{Engine, EngineError};
use lessonbook::model::*;
use lessonbook::notify::NotifyHub;
use lessonbook::store::{MemoryStore, PgStore, SchedulingStore};

const HOUR: i64 = 3_600_000; // 1 hour in ms
const DAY: i64 = 24 * HOUR;

fn now_ms() -> Ms {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
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
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

fn person(prefix: &str) -> Identity {
    let id = format!("{prefix}-{}", Ulid::new());
    Identity::new(id.clone(), prefix, format!("{id}@example.com"))
}

fn lesson_at(appointed_at: Ms, subject: &str) -> NewLesson {
    NewLesson {
        subject_name: subject.into(),
        grade: "9".into(),
        level: "basic".into(),
        description: "bench".into(),
        appointed_at,
        format: LessonFormat::Online,
        location_or_link: None,
    }
}

/// Six lessons for each of `tutors` fresh tutors, two hours apart.
async fn seed_lessons(engine: &Engine, tutors: usize, subject: &str) -> Vec<Ulid> {
    let base = now_ms() + 2 * DAY;
    let mut ids = Vec::with_capacity(tutors * 6);
    for _ in 0..tutors {
        let tutor = person("tutor");
        for k in 0..6 {
            let lesson = engine
                .create_lesson(&tutor, lesson_at(base + k * 2 * HOUR, subject))
                .await
                .expect("seed lesson");
            ids.push(lesson.id);
        }
    }
    ids
}

async fn phase1_sequential_creates(engine: &Engine) {
    let n_tutors = 200;
    let base = now_ms() + 2 * DAY;
    let mut latencies = Vec::with_capacity(n_tutors * 6);
    let start = Instant::now();

    for _ in 0..n_tutors {
        let tutor = person("tutor");
        for k in 0..6 {
            let t = Instant::now();
            engine
                .create_lesson(&tutor, lesson_at(base + k * 2 * HOUR, "Maths"))
                .await
                .expect("create lesson");
            latencies.push(t.elapsed());
        }
    }

    let elapsed = start.elapsed();
    let n = latencies.len();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} lessons in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_seat_contention(engine: Arc<Engine>) {
    let lessons = seed_lessons(&engine, 20, "Physics").await;
    let per_lesson = 8;

    let start = Instant::now();
    let mut handles = Vec::new();
    for &lesson_id in &lessons {
        for _ in 0..per_lesson {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                let result = engine.enroll_to_lesson(lesson_id, &person("tutee")).await;
                (result.map(|_| ()), t.elapsed())
            }));
        }
    }

    let mut latencies = Vec::with_capacity(handles.len());
    let (mut ok, mut full, mut other) = (0usize, 0usize, 0usize);
    for h in handles {
        let (result, elapsed) = h.await.expect("task panicked");
        latencies.push(elapsed);
        match result {
            Ok(()) => ok += 1,
            Err(EngineError::LessonFull) => full += 1,
            Err(e) => {
                eprintln!("    unexpected: {e}");
                other += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    println!(
        "  {} lessons x {per_lesson} tutees: {ok} seated, {full} full, {other} other in {:.2}s",
        lessons.len(),
        elapsed.as_secs_f64()
    );
    assert_eq!(ok, lessons.len() * 2, "seat count drifted");
    print_latency("enroll latency", &mut latencies);
}

async fn phase3_search_under_load(engine: Arc<Engine>) {
    let lessons = seed_lessons(&engine, 10, "Biology").await;

    // Writers churn enroll/withdraw in the background.
    let stop = Arc::new(AtomicBool::new(false));
    let churned = Arc::new(AtomicUsize::new(0));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let engine = engine.clone();
        let stop = stop.clone();
        let churned = churned.clone();
        let lesson_id = lessons[w % lessons.len()];
        writer_handles.push(tokio::spawn(async move {
            let tutee = person("churn");
            while !stop.load(Ordering::Relaxed) {
                if engine.enroll_to_lesson(lesson_id, &tutee).await.is_ok() {
                    let _ = engine.withdraw_from_lesson(lesson_id, &tutee.user_id).await;
                    churned.fetch_add(1, Ordering::Relaxed);
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let engine = engine.clone();
        reader_handles.push(tokio::spawn(async move {
            let search = LessonSearch {
                subject_name: "Biology".into(),
                grade: "9".into(),
                level: "basic".into(),
            };
            let tutee = person("reader");
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                engine
                    .search_available_lessons(&search, &tutee.user_id)
                    .await
                    .expect("search");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.expect("reader panicked"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    println!("  {} enroll/withdraw cycles during reads", churned.load(Ordering::Relaxed));
    print_latency("search latency", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    let store: Arc<dyn SchedulingStore> = match &config.database_url {
        Some(_) => {
            let store = PgStore::connect(&config).await.expect("connect to postgres");
            store.migrate().await.expect("migrate");
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::new()),
    };
    let engine = Arc::new(Engine::new(store, Arc::new(NotifyHub::new())));

    println!("=== lessonbook stress benchmark ===");
    println!(
        "store: {}\n",
        if config.database_url.is_some() { "postgres" } else { "memory" }
    );

    println!("[phase 1] sequential lesson creation");
    phase1_sequential_creates(&engine).await;

    println!("\n[phase 2] concurrent enrollment on contended seats");
    phase2_seat_contention(engine.clone()).await;

    println!("\n[phase 3] search latency under enroll/withdraw churn");
    phase3_search_under_load(engine.clone()).await;

    println!("\n=== benchmark complete ===");
}
