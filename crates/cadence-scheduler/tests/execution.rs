//! Running claimed jobs: settlement, timeouts, late completions and the
//! retry policy, driven one scan tick at a time on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use cadence_scheduler::{
    Completion, EveryOptions, JobFilter, JobOptions, JobRecord, JobStatus, Processor, Scheduler,
    SchedulerConfig, SchedulerEvent,
};
use cadence_store::{JobId, JobStore, JobUpdate, MemoryStore, NewJob};
use chrono::{DateTime, TimeDelta, Utc};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;

fn scheduler(store: &Arc<MemoryStore>) -> Scheduler {
    let config = SchedulerConfig::default().process_jobs(false);
    Scheduler::new(Arc::clone(store) as _, config).unwrap()
}

fn failing() -> Processor {
    Processor::new(|_| async { Err("FAIL".to_string()) })
}

async fn next_event(rx: &mut broadcast::Receiver<SchedulerEvent>) -> SchedulerEvent {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("timed out waiting for a scheduler event")
        .expect("event channel closed")
}

/// Skip events until one matches.
async fn wait_for(
    rx: &mut broadcast::Receiver<SchedulerEvent>,
    pred: impl Fn(&SchedulerEvent) -> bool,
) -> SchedulerEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn fetch(store: &MemoryStore, id: &JobId) -> JobRecord {
    store.find_one(&JobFilter::by_id(id)).await.unwrap().unwrap()
}

async fn make_due(store: &MemoryStore, id: &JobId) {
    let update = JobUpdate::new().next_run_at(Some(Utc::now() - TimeDelta::seconds(1)));
    assert!(store.update_one(&JobFilter::by_id(id), &update).await.unwrap());
}

fn assert_about(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    let drift = (actual - expected).num_seconds().abs();
    assert!(drift <= 5, "{} is not close to {}", actual, expected);
}

#[tokio::test(start_paused = true)]
async fn test_successful_one_shot_is_done() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    let (tx, mut seen) = mpsc::unbounded_channel::<Value>();
    scheduler
        .define_job(
            "email",
            Processor::new(move |data| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(data);
                    Ok(())
                }
            }),
            JobOptions::new(),
        )
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler.now("email", json!({"to": "a"})).await.unwrap();
    assert_eq!(scheduler.process_jobs().await, 1);

    let event = next_event(&mut events).await;
    assert!(matches!(&event, SchedulerEvent::Completed { job: j } if j.id == job.id));
    assert_eq!(seen.recv().await, Some(json!({"to": "a"})));

    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Done);
    assert_eq!(record.locked_at, None);
    assert_eq!(record.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_failed_one_shot_records_error() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job("report", failing(), JobOptions::new())
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler.now("report", json!({})).await.unwrap();
    scheduler.process_jobs().await;

    match next_event(&mut events).await {
        SchedulerEvent::Error { job: j, message } => {
            assert_eq!(j.unwrap().id, job.id);
            assert_eq!(message, "Job error [report]: FAIL");
        }
        other => panic!("unexpected event {:?}", other),
    }

    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Error);
    assert_eq!(record.last_error.as_deref(), Some("FAIL"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_late_completion() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job(
            "slow",
            Processor::new(|_| async {
                sleep(Duration::from_millis(100)).await;
                Ok(())
            }),
            JobOptions::new().timeout(Duration::from_millis(50)),
        )
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler.now("slow", json!({})).await.unwrap();
    scheduler.process_jobs().await;

    match next_event(&mut events).await {
        SchedulerEvent::Error { message, .. } => {
            assert_eq!(message, "Job error [slow]: job timeout after 50ms");
        }
        other => panic!("unexpected event {:?}", other),
    }
    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Error);
    assert_eq!(record.last_error.as_deref(), Some("job timeout after 50ms"));

    // The processor was not cancelled and reports in later
    match wait_for(&mut events, |e| matches!(e, SchedulerEvent::LateCompletion { .. })).await {
        SchedulerEvent::LateCompletion {
            elapsed, timeout, ..
        } => {
            assert!(elapsed >= Duration::from_millis(100));
            assert_eq!(timeout, Duration::from_millis(50));
        }
        _ => unreachable!(),
    }

    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Error, "late success does not revive");
    let last_error = record.last_error.unwrap();
    assert!(last_error.starts_with("job done after timeout. took "));
    assert!(last_error.ends_with("timeout: 50ms"));
}

#[tokio::test(start_paused = true)]
async fn test_late_completion_leaves_reclaimed_job_alone() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job(
            "slow",
            Processor::new(|_| async {
                sleep(Duration::from_millis(100)).await;
                Ok(())
            }),
            JobOptions::new().timeout(Duration::from_millis(50)),
        )
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler.now("slow", json!({})).await.unwrap();
    scheduler.process_jobs().await;
    wait_for(&mut events, |e| matches!(e, SchedulerEvent::Error { .. })).await;

    // Another worker takes the job over before the first run reports in
    let claimed_at = fetch(&store, &job.id).await.locked_at.unwrap();
    let takeover = JobUpdate::new()
        .status(JobStatus::Processing)
        .locked_at(Some(claimed_at + TimeDelta::minutes(11)))
        .worker_id(Some("other".to_string()))
        .last_error(Some("other worker's run".to_string()));
    assert!(
        store
            .update_one(&JobFilter::by_id(&job.id), &takeover)
            .await
            .unwrap()
    );

    wait_for(&mut events, |e| matches!(e, SchedulerEvent::LateCompletion { .. })).await;

    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Processing);
    assert_eq!(record.worker_id.as_deref(), Some("other"));
    assert_eq!(record.last_error.as_deref(), Some("other worker's run"));
}

#[tokio::test(start_paused = true)]
async fn test_callback_sync_error_wins_over_later_callback() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job(
            "cb",
            Processor::with_callback(|_, done: Completion| {
                tokio::spawn(async move {
                    sleep(Duration::from_millis(10)).await;
                    done.ok();
                });
                Err("sync failure".to_string())
            }),
            JobOptions::new(),
        )
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler.now("cb", json!({})).await.unwrap();
    scheduler.process_jobs().await;

    match next_event(&mut events).await {
        SchedulerEvent::Error { message, .. } => {
            assert_eq!(message, "Job error [cb]: sync failure");
        }
        other => panic!("unexpected event {:?}", other),
    }
    wait_for(&mut events, |e| matches!(e, SchedulerEvent::LateCompletion { .. })).await;

    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Error);
    assert!(
        record
            .last_error
            .unwrap()
            .starts_with("job done after timeout")
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropped_completion_times_out() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job(
            "forgetful",
            Processor::with_callback(|_, done| {
                drop(done);
                Ok(())
            }),
            JobOptions::new().timeout(Duration::from_secs(1)),
        )
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler.now("forgetful", json!({})).await.unwrap();
    scheduler.process_jobs().await;

    match next_event(&mut events).await {
        SchedulerEvent::Error { message, .. } => {
            assert_eq!(message, "Job error [forgetful]: job timeout after 1000ms");
        }
        other => panic!("unexpected event {:?}", other),
    }
    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_default_timeout_applies_without_job_option() {
    let store = Arc::new(MemoryStore::new());
    let config = SchedulerConfig::default()
        .default_timeout(Duration::from_millis(200))
        .process_jobs(false);
    let scheduler = Scheduler::new(Arc::clone(&store) as _, config).unwrap();
    scheduler
        .define_job(
            "hang",
            Processor::new(|_| std::future::pending()),
            JobOptions::new(),
        )
        .unwrap();
    let mut events = scheduler.subscribe();

    scheduler.now("hang", json!({})).await.unwrap();
    scheduler.process_jobs().await;

    match next_event(&mut events).await {
        SchedulerEvent::Error { message, .. } => {
            assert_eq!(message, "Job error [hang]: job timeout after 200ms");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_processor_fails_the_job() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job("ghost", failing(), JobOptions::new())
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler.now("ghost", json!({})).await.unwrap();
    assert_eq!(scheduler.process_jobs().await, 1);
    // The run task has not been polled yet on this runtime
    scheduler.clear_job_definitions();

    match next_event(&mut events).await {
        SchedulerEvent::Error { message, .. } => {
            assert_eq!(
                message,
                "Job error [ghost]: job with the name ghost does not have a processor"
            );
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(fetch(&store, &job.id).await.status, JobStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_processor_fails_the_job() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job(
            "boom",
            Processor::new(|data: Value| async move {
                if data["explode"] == json!(true) {
                    panic!("kaboom");
                }
                Ok(())
            }),
            JobOptions::new(),
        )
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler
        .now("boom", json!({"explode": true}))
        .await
        .unwrap();
    scheduler.process_jobs().await;

    match next_event(&mut events).await {
        SchedulerEvent::Error { message, .. } => assert!(message.contains("kaboom")),
        other => panic!("unexpected event {:?}", other),
    }
    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Error);
    assert!(record.last_error.unwrap().contains("kaboom"));
}

#[tokio::test(start_paused = true)]
async fn test_long_interval_backs_off_then_gives_up() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job("flaky", failing(), JobOptions::new())
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler
        .every("10 minutes", "flaky", json!({}), EveryOptions { run_now: true })
        .await
        .unwrap();

    for (failures, minutes) in [(1u32, 5i64), (2, 15), (3, 30)] {
        assert_eq!(scheduler.process_jobs().await, 1);
        let event =
            wait_for(&mut events, |e| matches!(e, SchedulerEvent::Rescheduled { .. })).await;
        let SchedulerEvent::Rescheduled {
            next_run_at,
            err_counter,
            ..
        } = event
        else {
            unreachable!()
        };
        assert_eq!(err_counter, failures);
        assert_about(next_run_at, Utc::now() + TimeDelta::minutes(minutes));

        let record = fetch(&store, &job.id).await;
        assert_eq!(record.status, JobStatus::Scheduled);
        assert_eq!(record.err_counter, failures);
        assert_eq!(record.locked_at, None);
        assert_eq!(record.last_error.as_deref(), Some("FAIL"));

        // Not due yet
        assert!(scheduler.claim_next_job().await.unwrap().is_none());
        make_due(&store, &job.id).await;
    }

    scheduler.process_jobs().await;
    let event = wait_for(&mut events, |e| matches!(e, SchedulerEvent::GaveUp { .. })).await;
    assert!(matches!(event, SchedulerEvent::GaveUp { failures: 4, .. }));

    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Error);
    assert_eq!(record.next_run_at, None);
    assert_eq!(record.err_counter, 4);
    assert_eq!(record.locked_at, None);
    assert!(scheduler.claim_next_job().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_short_interval_retries_on_cadence() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job("poll", failing(), JobOptions::new())
        .unwrap();
    let mut events = scheduler.subscribe();

    let job = scheduler
        .every("1 minute", "poll", json!({}), EveryOptions { run_now: true })
        .await
        .unwrap();

    for failures in 1..=5u32 {
        scheduler.process_jobs().await;
        let event =
            wait_for(&mut events, |e| matches!(e, SchedulerEvent::Rescheduled { .. })).await;
        let SchedulerEvent::Rescheduled {
            next_run_at,
            err_counter,
            ..
        } = event
        else {
            unreachable!()
        };
        assert_eq!(err_counter, failures);
        assert_about(next_run_at, Utc::now() + TimeDelta::minutes(1));
        make_due(&store, &job.id).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_failure_chain() {
    let mut record = NewJob::once("sync", json!({}), Utc::now() - TimeDelta::seconds(5))
        .recurring(3_600_000, "1 hour")
        .into_record(JobId::generate());
    record.err_counter = 2;
    let store = Arc::new(MemoryStore::from_records(vec![record.clone()]));
    let scheduler = scheduler(&store);
    scheduler
        .define_job("sync", Processor::new(|_| async { Ok(()) }), JobOptions::new())
        .unwrap();
    let mut events = scheduler.subscribe();

    scheduler.process_jobs().await;
    match next_event(&mut events).await {
        SchedulerEvent::Rescheduled {
            next_run_at,
            err_counter,
            ..
        } => {
            assert_eq!(err_counter, 0);
            assert_about(next_run_at, Utc::now() + TimeDelta::hours(1));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let stored = fetch(&store, &record.id).await;
    assert_eq!(stored.status, JobStatus::Scheduled);
    assert_eq!(stored.err_counter, 0);
    assert_eq!(stored.worker_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_completion_is_skipped_after_lease_is_lost() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = scheduler(&store);
    scheduler
        .define_job(
            "contested",
            Processor::new(|_| async {
                sleep(Duration::from_millis(10)).await;
                Ok(())
            }),
            JobOptions::new(),
        )
        .unwrap();

    let job = scheduler.now("contested", json!({})).await.unwrap();
    scheduler.process_jobs().await;

    // Another worker takes over the job before this run finishes
    let takeover = JobUpdate::new()
        .locked_at(Some(Utc::now() + TimeDelta::seconds(1)))
        .worker_id(Some("thief".to_string()));
    assert!(
        store
            .update_one(&JobFilter::by_id(&job.id), &takeover)
            .await
            .unwrap()
    );

    sleep(Duration::from_millis(100)).await;

    let record = fetch(&store, &job.id).await;
    assert_eq!(record.status, JobStatus::Processing);
    assert_eq!(record.worker_id.as_deref(), Some("thief"));
}
