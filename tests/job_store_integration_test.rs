//! Integration tests for the job store against a real Postgres instance.
//!
//! These require a running PostgreSQL database; set `DATABASE_URL` before
//! running. Each test uses its own randomly-suffixed table prefix so tests
//! can run concurrently against the same database without clobbering each
//! other's rows. Run with: `DATABASE_URL=postgres://... cargo test --test job_store_integration_test`

use chrono::{Duration, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use jobstore::acquisition::{acquire_next_triggers, complete_trigger, fire_trigger, FireResult};
use jobstore::cluster::{
    ClusterManager, FAILED_JOB_ORIG_TRIGGER_GROUP, FAILED_JOB_ORIG_TRIGGER_NAME,
};
use jobstore::codec::{BinaryCodec, JobDataCodec, PropertiesCodec};
use jobstore::error::StoreError;
use jobstore::gateway::Gateway;
use jobstore::misfire::scan_misfires;
use jobstore::model::{
    Calendar, JobDataMap, JobDetail, JobKey, MisfireInstruction, Trigger, TriggerKey,
    TriggerSchedule, TriggerState,
};
use jobstore::repository::{CalendarRepository, JobRepository, TriggerRepository};
use jobstore::resolver::{ClassResolver, JobFactoryHandle, NullClassResolver};
use jobstore::state_machine::{pause_group, resume_group};

async fn setup_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to test database")
}

/// Apply the schema under a fresh, randomly-suffixed table prefix so
/// concurrent test runs never collide, then return a `Gateway` bound to it.
async fn setup_gateway(pool: &PgPool) -> Gateway {
    let prefix = format!("TEST_{}_", Uuid::new_v4().simple());
    let template = include_str!("../migrations/0001_init.sql");
    let ddl = template.replace("QRTZ_", &prefix);
    for statement in ddl.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement)
            .execute(pool)
            .await
            .unwrap_or_else(|e| panic!("failed executing: {statement}\n{e}"));
    }
    Gateway::new(pool.clone(), prefix)
}

fn sample_job(name: &str, group: &str, stateful: bool) -> JobDetail {
    JobDetail {
        key: JobKey::new(name, group),
        description: Some("test job".to_string()),
        job_class_name: "com.example.NoOpJob".to_string(),
        durable: true,
        volatile: false,
        stateful,
        requests_recovery: false,
        job_data: JobDataMap::new(),
        listener_names: vec!["audit".to_string()],
    }
}

fn sample_simple_trigger(
    name: &str,
    group: &str,
    job: &JobKey,
    next_fire_ms: i64,
    repeat_count: i64,
) -> Trigger {
    let now = Utc::now();
    Trigger {
        key: TriggerKey::new(name, group),
        job_key: job.clone(),
        description: None,
        volatile: false,
        next_fire_time: chrono::Utc.timestamp_millis_opt(next_fire_ms).single(),
        prev_fire_time: None,
        start_time: now,
        end_time: None,
        calendar_name: None,
        misfire_instruction: MisfireInstruction::FireNow,
        state: TriggerState::Waiting,
        job_data: JobDataMap::new(),
        schedule: TriggerSchedule::Simple {
            repeat_count,
            repeat_interval_ms: 1_000,
            times_triggered: 0,
        },
    }
}

// --- duplicate job insert fails ----------------------------------------

#[tokio::test]
async fn duplicate_job_insert_fails_with_already_exists() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let mut conn = pool.acquire().await.unwrap();

    let job = sample_job("j1", "g1", false);
    job_repo.insert(&mut conn, &job).await.unwrap();

    let err = job_repo.insert(&mut conn, &job).await.unwrap_err();
    assert!(matches!(err, StoreError::JobAlreadyExists(_)));
}

// --- acquisition round trip ----------------------------------------------

#[tokio::test]
async fn acquire_claims_waiting_trigger_and_inserts_fired_entry() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let mut conn = pool.acquire().await.unwrap();

    let job = sample_job("j1", "g1", false);
    job_repo.insert(&mut conn, &job).await.unwrap();
    let trigger = sample_simple_trigger("t1", "g1", &job.key, 1_000, 3);
    trigger_repo.insert(&mut conn, &trigger).await.unwrap();

    let acquired = acquire_next_triggers(
        &gw,
        &mut conn,
        "instance-A",
        Utc.timestamp_millis_opt(0).single().unwrap(),
        Duration::milliseconds(5_000),
        10,
    )
    .await
    .unwrap();

    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].trigger.key, trigger.key);

    let state = trigger_repo.trigger_state(&mut conn, &trigger.key).await.unwrap();
    assert_eq!(state, Some(TriggerState::Acquired));

    // round-trip: re-reading the trigger should reproduce every attribute.
    let reread = trigger_repo.get(&mut conn, &trigger.key).await.unwrap().unwrap();
    assert_eq!(reread.job_key, trigger.job_key);
    assert_eq!(reread.next_fire_time, trigger.next_fire_time);
    match reread.schedule {
        TriggerSchedule::Simple { repeat_count, .. } => assert_eq!(repeat_count, 3),
        _ => panic!("expected simple schedule"),
    }
}

// --- firing a finite simple trigger advances TIMES_TRIGGERED and completes
// once REPEAT_COUNT is exhausted, instead of firing forever -------------

#[tokio::test]
async fn firing_a_finite_simple_trigger_completes_once_repeat_count_is_exhausted() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let mut conn = pool.acquire().await.unwrap();

    let job = sample_job("j1", "g1", false);
    job_repo.insert(&mut conn, &job).await.unwrap();
    // repeat_count = 1: one repeat after the initial fire, then done.
    let trigger = sample_simple_trigger("t1", "g1", &job.key, 1_000, 1);
    trigger_repo.insert(&mut conn, &trigger).await.unwrap();

    // The trigger's NEXT_FIRE_TIME starts at a fixed past epoch instant, but
    // `fire_trigger` recomputes each subsequent one from the real wall clock,
    // so every acquisition window below is anchored to `Utc::now()`.
    let window = Duration::milliseconds(5_000);

    // First fire: TIMES_TRIGGERED (0) < REPEAT_COUNT (1), so another fire
    // remains and the trigger goes back to Waiting.
    let first = acquire_next_triggers(&gw, &mut conn, "A", Utc::now(), window, 1)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    fire_trigger(&gw, &mut conn, &first[0].fire_instance_id, &first[0].trigger, false)
        .await
        .unwrap();

    let after_first = trigger_repo.get(&mut conn, &trigger.key).await.unwrap().unwrap();
    assert_eq!(after_first.state, TriggerState::Waiting);
    match after_first.schedule {
        TriggerSchedule::Simple { times_triggered, .. } => assert_eq!(times_triggered, 1),
        _ => panic!("expected simple schedule"),
    }
    assert!(after_first.next_fire_time.is_some());

    // Second fire: TIMES_TRIGGERED (1) >= REPEAT_COUNT (1), so there are no
    // more fires and the trigger must move to Complete.
    let second = acquire_next_triggers(&gw, &mut conn, "A", Utc::now(), window, 1)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    fire_trigger(&gw, &mut conn, &second[0].fire_instance_id, &second[0].trigger, false)
        .await
        .unwrap();

    let after_second = trigger_repo.get(&mut conn, &trigger.key).await.unwrap().unwrap();
    assert_eq!(after_second.state, TriggerState::Complete);
    assert_eq!(after_second.next_fire_time, None);
}

// --- two instances race on the same trigger -----------------------------

#[tokio::test]
async fn only_one_instance_wins_a_concurrent_acquisition() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let mut conn = pool.acquire().await.unwrap();

    let job = sample_job("j1", "g1", false);
    job_repo.insert(&mut conn, &job).await.unwrap();
    let trigger = sample_simple_trigger("t1", "g1", &job.key, 1_000, 3);
    trigger_repo.insert(&mut conn, &trigger).await.unwrap();
    drop(conn);

    let now = Utc.timestamp_millis_opt(0).single().unwrap();
    let window = Duration::milliseconds(5_000);

    let mut conn_a = pool.acquire().await.unwrap();
    let a = acquire_next_triggers(&gw, &mut conn_a, "A", now, window, 10).await.unwrap();

    let mut conn_b = pool.acquire().await.unwrap();
    let b = acquire_next_triggers(&gw, &mut conn_b, "B", now, window, 10).await.unwrap();

    let total_wins = a.len() + b.len();
    assert_eq!(total_wins, 1, "exactly one instance should win the race");
}

// --- stateful-job blocking fan-out --------------------------------------
// A stateful job may have at most one of its triggers ACQUIRED or EXECUTING
// at any instant; firing one parks both it and every sibling in BLOCKED
// until completion unblocks them all.

#[tokio::test]
async fn firing_a_stateful_trigger_blocks_itself_and_its_sibling_then_unblocks_on_completion() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let mut conn = pool.acquire().await.unwrap();

    let job = sample_job("statefuljob", "g1", true);
    job_repo.insert(&mut conn, &job).await.unwrap();

    let t1 = sample_simple_trigger("t1", "g1", &job.key, 1_000, -1);
    let t2 = sample_simple_trigger("t2", "g1", &job.key, 2_000, -1);
    trigger_repo.insert(&mut conn, &t1).await.unwrap();
    trigger_repo.insert(&mut conn, &t2).await.unwrap();

    let now = Utc.timestamp_millis_opt(0).single().unwrap();
    let acquired = acquire_next_triggers(&gw, &mut conn, "A", now, Duration::milliseconds(5_000), 1)
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    let acquired_trigger = &acquired[0];

    let result = fire_trigger(&gw, &mut conn, &acquired_trigger.fire_instance_id, &acquired_trigger.trigger, true)
        .await
        .unwrap();
    assert_eq!(result, FireResult::Proceed);

    let fired_state = trigger_repo.trigger_state(&mut conn, &acquired_trigger.trigger.key).await.unwrap();
    assert_eq!(
        fired_state,
        Some(TriggerState::Blocked),
        "the fired trigger itself must park in Blocked, not Waiting, while its job is stateful"
    );
    let sibling_state = trigger_repo.trigger_state(&mut conn, &t2.key).await.unwrap();
    assert_eq!(sibling_state, Some(TriggerState::Blocked));

    // A second instance racing to acquire the now-Blocked trigger must fail.
    let race = acquire_next_triggers(&gw, &mut conn, "B", now, Duration::milliseconds(5_000), 1)
        .await
        .unwrap();
    assert!(race.is_empty(), "a Blocked trigger must not be acquirable by another instance");

    complete_trigger(
        &gw,
        &mut conn,
        &acquired_trigger.fire_instance_id,
        &acquired_trigger.trigger.key,
        Some(&job.key),
        true,
        false,
        None,
    )
    .await
    .unwrap();

    let fired_state_after = trigger_repo.trigger_state(&mut conn, &acquired_trigger.trigger.key).await.unwrap();
    assert_eq!(fired_state_after, Some(TriggerState::Waiting));
    let sibling_state_after = trigger_repo.trigger_state(&mut conn, &t2.key).await.unwrap();
    assert_eq!(sibling_state_after, Some(TriggerState::Waiting));
}

// --- cluster recovery ------------------------------------------------

#[tokio::test]
async fn dead_instance_recovery_creates_recovery_trigger_and_drops_heartbeat() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let cluster = ClusterManager::new(gw.clone());
    let mut conn = pool.acquire().await.unwrap();

    let mut job = sample_job("recoverable", "g1", false);
    job.requests_recovery = true;
    job_repo.insert(&mut conn, &job).await.unwrap();

    let trigger = sample_simple_trigger("t1", "g1", &job.key, 1_000, -1);
    trigger_repo.insert(&mut conn, &trigger).await.unwrap();

    let now = Utc.timestamp_millis_opt(0).single().unwrap();
    let acquired = acquire_next_triggers(&gw, &mut conn, "dead-A", now, Duration::milliseconds(5_000), 1)
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);

    // Simulate instance "dead-A" checking in a long time ago, then stopping.
    let stale_checkin = now - Duration::milliseconds(100_000);
    cluster.check_in(&mut conn, "dead-A", stale_checkin, 15_000).await.unwrap();

    let recovered = cluster.detect_and_recover(&mut conn, "survivor-B", now).await.unwrap();
    assert_eq!(recovered, vec!["dead-A".to_string()]);

    let recovery_key = TriggerKey::recovery("t1");
    let recovery_trigger = trigger_repo.get(&mut conn, &recovery_key).await.unwrap();
    assert!(recovery_trigger.is_some());
    let recovery_trigger = recovery_trigger.unwrap();
    assert_eq!(
        recovery_trigger.job_data.get(FAILED_JOB_ORIG_TRIGGER_NAME).and_then(|v| v.as_str()),
        Some("t1")
    );
    assert_eq!(
        recovery_trigger.job_data.get(FAILED_JOB_ORIG_TRIGGER_GROUP).and_then(|v| v.as_str()),
        Some("g1")
    );
}

// --- pause/resume group -------------------------------------------------

#[tokio::test]
async fn pausing_a_group_moves_waiting_to_paused_and_resume_inverts_it() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let mut conn = pool.acquire().await.unwrap();

    let job = sample_job("j1", "g1", false);
    job_repo.insert(&mut conn, &job).await.unwrap();
    let trigger = sample_simple_trigger("t1", "g1", &job.key, 1_000, -1);
    trigger_repo.insert(&mut conn, &trigger).await.unwrap();

    pause_group(&gw, &mut conn, "g1").await.unwrap();
    let paused = trigger_repo.trigger_state(&mut conn, &trigger.key).await.unwrap();
    assert_eq!(paused, Some(TriggerState::Paused));
    assert!(trigger_repo.group_is_paused(&mut conn, "g1").await.unwrap());

    resume_group(&gw, &mut conn, "g1").await.unwrap();
    let resumed = trigger_repo.trigger_state(&mut conn, &trigger.key).await.unwrap();
    assert_eq!(resumed, Some(TriggerState::Waiting));
    assert!(!trigger_repo.group_is_paused(&mut conn, "g1").await.unwrap());
}

// --- misfire handling ---------------------------------------------------

#[tokio::test]
async fn misfire_scan_fires_now_and_leaves_trigger_waiting() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let mut conn = pool.acquire().await.unwrap();

    let job = sample_job("j1", "g1", false);
    job_repo.insert(&mut conn, &job).await.unwrap();
    let trigger = sample_simple_trigger("t1", "g1", &job.key, 3_000, -1);
    trigger_repo.insert(&mut conn, &trigger).await.unwrap();

    let now = Utc.timestamp_millis_opt(10_000).single().unwrap();
    let touched = scan_misfires(&gw, &mut conn, now, 5_000, None).await.unwrap();
    assert_eq!(touched, vec![trigger.key.clone()]);

    let reread = trigger_repo.get(&mut conn, &trigger.key).await.unwrap().unwrap();
    assert_eq!(reread.state, TriggerState::Waiting);
    assert_eq!(reread.next_fire_time, Some(now));
}

// --- calendar-in-use: delete is refused while a trigger still references it ---

#[tokio::test]
async fn deleting_a_referenced_calendar_fails_and_leaves_db_unchanged() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let calendar_repo = CalendarRepository::new(gw.clone());
    let mut conn = pool.acquire().await.unwrap();

    calendar_repo
        .insert(&mut conn, &Calendar { name: "holidays".to_string(), payload: vec![1, 2, 3] })
        .await
        .unwrap();

    let job = sample_job("j1", "g1", false);
    job_repo.insert(&mut conn, &job).await.unwrap();
    let mut trigger = sample_simple_trigger("t1", "g1", &job.key, 1_000, -1);
    trigger.calendar_name = Some("holidays".to_string());
    trigger_repo.insert(&mut conn, &trigger).await.unwrap();

    let err = calendar_repo.delete(&mut conn, "holidays").await.unwrap_err();
    assert!(matches!(err, StoreError::CalendarInUse(_)));

    let still_there = calendar_repo.get(&mut conn, "holidays").await.unwrap();
    assert!(still_there.is_some());
}

// --- codec round trip ----------------------------------------------------

#[test]
fn binary_and_properties_codecs_round_trip_their_valid_inputs() {
    let mut map = JobDataMap::new();
    map.insert("alpha", "one");
    map.insert("beta", "two");

    let binary = BinaryCodec;
    let encoded = binary.encode(&map).unwrap();
    let decoded = binary.decode(&encoded).unwrap();
    assert_eq!(decoded.entries, map.entries);

    let properties = PropertiesCodec;
    let encoded = properties.encode(&map).unwrap();
    let decoded = properties.decode(&encoded).unwrap();
    assert_eq!(decoded.entries, map.entries);
}

// --- job deletion cascades to a non-durable job's last trigger ----------

#[tokio::test]
async fn deleting_last_trigger_of_non_durable_job_deletes_the_job() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let trigger_repo = TriggerRepository::new(gw.clone(), false);
    let mut conn = pool.acquire().await.unwrap();

    let mut job = sample_job("transient-job", "g1", false);
    job.durable = false;
    job_repo.insert(&mut conn, &job).await.unwrap();
    let trigger = sample_simple_trigger("t1", "g1", &job.key, 1_000, -1);
    trigger_repo.insert(&mut conn, &trigger).await.unwrap();

    let deleted = trigger_repo.delete(&mut conn, &trigger.key, &job_repo).await.unwrap();
    assert!(deleted);

    let job_after = job_repo.get(&mut conn, &job.key).await.unwrap();
    assert!(job_after.is_none(), "non-durable job with no remaining triggers should be deleted");
}

// --- class resolver seam: unconfigured passes class names through, a
// configured one rejects whatever it doesn't recognize --------------------

struct AllowlistResolver(Vec<String>);

impl ClassResolver for AllowlistResolver {
    fn resolve(&self, class_name: &str) -> jobstore::error::Result<JobFactoryHandle> {
        if self.0.iter().any(|c| c == class_name) {
            Ok(JobFactoryHandle(class_name.to_string()))
        } else {
            Err(StoreError::ClassLoad(format!("'{class_name}' is not on the allowlist")))
        }
    }
}

#[tokio::test]
async fn job_repository_without_a_resolver_accepts_any_class_name() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false);
    let mut conn = pool.acquire().await.unwrap();

    let job = sample_job("j1", "g1", false);
    job_repo.insert(&mut conn, &job).await.unwrap();
}

#[tokio::test]
async fn job_repository_with_a_resolver_rejects_an_unresolvable_class() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false)
        .with_resolver(std::sync::Arc::new(AllowlistResolver(vec!["com.example.NoOpJob".to_string()])));
    let mut conn = pool.acquire().await.unwrap();

    let mut job = sample_job("j1", "g1", false);
    job.job_class_name = "com.example.UnknownJob".to_string();
    let err = job_repo.insert(&mut conn, &job).await.unwrap_err();
    assert!(matches!(err, StoreError::ClassLoad(_)));

    job.job_class_name = "com.example.NoOpJob".to_string();
    job_repo.insert(&mut conn, &job).await.unwrap();
}

#[tokio::test]
async fn job_repository_with_null_resolver_rejects_every_class() {
    let pool = setup_pool().await;
    let gw = setup_gateway(&pool).await;
    let job_repo = JobRepository::new(gw.clone(), false).with_resolver(std::sync::Arc::new(NullClassResolver));
    let mut conn = pool.acquire().await.unwrap();

    let job = sample_job("j1", "g1", false);
    let err = job_repo.insert(&mut conn, &job).await.unwrap_err();
    assert!(matches!(err, StoreError::ClassLoad(_)));
}
