//! End-to-end scheduler tests against a temp SQLite file and a mocked
//! weather provider.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use meteo_core::config::{DatabaseConfig, WeatherConfig};
use meteo_core::db::JobStore;
use meteo_core::jobs::{JobExecutor, JobId, JobType, NewJob, WeatherJobHandler};
use meteo_core::provider::WeatherProvider;
use meteo_core::registry::JobRegistry;
use meteo_core::scheduler::Scheduler;
use meteo_core::websocket::{Broadcaster, CONNECTION_BUFFER};

struct TestApp {
    server: MockServer,
    registry: Arc<JobRegistry>,
    executor: Arc<JobExecutor>,
    scheduler: Arc<Scheduler>,
    broadcaster: Arc<Broadcaster>,
}

async fn spawn_app(max_history: usize) -> TestApp {
    let server = MockServer::start().await;

    let db_path = tempfile::tempdir()
        .unwrap()
        .into_path()
        .join("meteo-test.sqlite");
    let store = JobStore::connect(&DatabaseConfig {
        url: format!("sqlite://{}", db_path.display()),
        max_connections: 2,
    })
    .await
    .unwrap();

    let registry = JobRegistry::new(store, max_history);
    let broadcaster = Arc::new(Broadcaster::new());

    let provider = Arc::new(
        WeatherProvider::new(&WeatherConfig {
            base_url: server.uri(),
            api_key: "test-key".to_string(),
            timeout_secs: 5,
        })
        .unwrap(),
    );

    let mut executor = JobExecutor::new(registry.clone(), broadcaster.clone());
    executor.register_handler(Arc::new(WeatherJobHandler::new(provider)));
    let executor = Arc::new(executor);

    let scheduler = Scheduler::new(registry.clone(), executor.clone());

    TestApp {
        server,
        registry,
        executor,
        scheduler,
        broadcaster,
    }
}

fn current_body(temp_c: f64) -> serde_json::Value {
    serde_json::json!({
        "location": { "name": "Dublin", "region": "Dublin", "country": "Ireland" },
        "current": {
            "last_updated": "2024-01-15 14:30",
            "temp_c": temp_c,
            "is_day": 1,
            "condition": { "text": "Overcast", "icon": "//cdn.example/overcast.png", "code": 1009 },
            "wind_kph": 19.1,
            "wind_degree": 200,
            "wind_dir": "SSW",
            "precip_mm": 0.0,
            "humidity": 82,
            "cloud": 100,
            "feelslike_c": 5.9,
            "vis_km": 10.0,
            "uv": 1.0,
            "gust_kph": 27.0
        }
    })
}

fn weather_job() -> NewJob {
    NewJob {
        job_type: JobType::Weather,
        // Fires once a year; only the immediate run happens during a test.
        schedule: "0 0 1 1 *".to_string(),
        details: serde_json::json!({ "location": "dublin-dublin-ireland" }),
    }
}

async fn mock_current_ok(server: &MockServer, temp_c: f64) {
    Mock::given(method("GET"))
        .and(path("/current.json"))
        .and(query_param("q", "dublin-dublin-ireland"))
        .respond_with(ResponseTemplate::new(200).set_body_json(current_body(temp_c)))
        .mount(server)
        .await;
}

/// Poll until a job's history reaches `len` or the deadline passes.
async fn wait_for_history(registry: &JobRegistry, id: JobId, len: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if registry.history(id).len() >= len {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "history for job {} never reached {} entries",
            id,
            len
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn add_job_assigns_fresh_id_and_runs_immediately() {
    let app = spawn_app(10).await;
    mock_current_ok(&app.server, 8.0).await;

    let before = app.registry.load_all().await.unwrap();
    let job = app.scheduler.add_job(weather_job()).await.unwrap();

    assert!(before.iter().all(|j| j.id != job.id));
    let after = app.registry.load_all().await.unwrap();
    assert!(after.iter().any(|j| j.id == job.id));
    assert!(app.scheduler.is_scheduled(job.id));

    // The immediate run lands one history entry without waiting for cron.
    wait_for_history(&app.registry, job.id, 1).await;
    let history = app.registry.history(job.id);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload["location"]["name"], "Dublin");
}

#[tokio::test]
async fn add_job_rejects_invalid_cron_without_persisting() {
    let app = spawn_app(10).await;
    let before = app.registry.load_all().await.unwrap().len();

    let err = app
        .scheduler
        .add_job(NewJob {
            job_type: JobType::Weather,
            schedule: "not a cron".to_string(),
            details: serde_json::json!({ "location": "dublin-dublin-ireland" }),
        })
        .await
        .unwrap_err();

    assert_eq!(err.code(), meteo_core::ErrorCode::InvalidCronExpression);
    assert_eq!(app.registry.load_all().await.unwrap().len(), before);
}

#[tokio::test]
async fn failed_run_leaves_history_unchanged_then_success_appends() {
    let app = spawn_app(10).await;

    Mock::given(method("GET"))
        .and(path("/current.json"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&app.server)
        .await;

    let job = app.registry.add(weather_job()).await.unwrap();
    let job = app
        .registry
        .load_all()
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.id == job.id)
        .unwrap();

    app.executor.execute(&job).await;
    assert!(app.registry.history(job.id).is_empty());

    mock_current_ok(&app.server, 9.5).await;
    app.executor.execute(&job).await;

    let history = app.registry.history(job.id);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload["current"]["temp_c"], 9.5);
}

#[tokio::test]
async fn history_is_bounded_with_fifo_eviction() {
    let app = spawn_app(3).await;
    let job = app.registry.add(weather_job()).await.unwrap();

    for i in 1..=5 {
        Mock::given(method("GET"))
            .and(path("/current.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(current_body(i as f64)))
            .up_to_n_times(1)
            .mount(&app.server)
            .await;
        app.executor.execute(&job).await;
    }

    let history = app.registry.history(job.id);
    assert_eq!(history.len(), 3);
    // Runs 1 and 2 were evicted, oldest first.
    assert_eq!(history[0].payload["current"]["temp_c"], 3.0);
    assert_eq!(history[2].payload["current"]["temp_c"], 5.0);
    assert!(history[0].updated <= history[1].updated);
}

#[tokio::test]
async fn overlapping_firings_are_skipped_not_queued() {
    let app = spawn_app(10).await;

    Mock::given(method("GET"))
        .and(path("/current.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(current_body(8.0))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&app.server)
        .await;

    let job = app.registry.add(weather_job()).await.unwrap();

    let slow = {
        let executor = app.executor.clone();
        let job = job.clone();
        tokio::spawn(async move { executor.execute(&job).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Fires while the first run is still in flight; must be a no-op.
    app.executor.execute(&job).await;
    slow.await.unwrap();

    assert_eq!(app.registry.history(job.id).len(), 1);
}

#[tokio::test]
async fn remove_job_stops_runs_and_drops_history() {
    let app = spawn_app(10).await;
    mock_current_ok(&app.server, 8.0).await;

    let job = app.scheduler.add_job(weather_job()).await.unwrap();
    wait_for_history(&app.registry, job.id, 1).await;

    app.scheduler.remove_job(job.id).await.unwrap();

    assert!(!app.scheduler.is_scheduled(job.id));
    assert!(app.registry.history(job.id).is_empty());
    let jobs = app.registry.load_all().await.unwrap();
    assert!(jobs.iter().all(|j| j.id != job.id));

    // A straggling execution for the removed job must be discarded.
    app.executor.execute(&job).await;
    assert!(app.registry.history(job.id).is_empty());
}

#[tokio::test]
async fn completed_run_is_broadcast_with_full_history() {
    let app = spawn_app(10).await;
    mock_current_ok(&app.server, 8.0).await;

    let (tx, mut rx) = mpsc::channel(CONNECTION_BUFFER);
    app.broadcaster.register(tx);

    // A dead subscriber must not block delivery to the live one.
    let (dead_tx, dead_rx) = mpsc::channel(CONNECTION_BUFFER);
    drop(dead_rx);
    app.broadcaster.register(dead_tx);

    let job = app.registry.add(weather_job()).await.unwrap();
    app.executor.execute(&job).await;

    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let text = match frame {
        axum::extract::ws::Message::Text(text) => text,
        other => panic!("unexpected frame: {:?}", other),
    };

    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "WEATHER_JOB_UPDATE");
    assert_eq!(value["payload"]["jobId"], job.id.0);
    let weathers = value["payload"]["weathers"].as_array().unwrap();
    assert_eq!(weathers.len(), 1);
    assert_eq!(weathers[0]["location"]["country"], "Ireland");
    assert_eq!(weathers[0]["current"]["temp_c"], 8.0);
    assert!(weathers[0]["updated"].is_string());
}

#[tokio::test]
async fn scheduling_twice_is_rejected() {
    let app = spawn_app(10).await;
    mock_current_ok(&app.server, 8.0).await;

    let job = app.scheduler.add_job(weather_job()).await.unwrap();
    let job = app
        .registry
        .load_all()
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.id == job.id)
        .unwrap();

    let err = app.scheduler.schedule(&job).unwrap_err();
    assert_eq!(err.code(), meteo_core::ErrorCode::AlreadyScheduled);

    // Unscheduling frees the slot; unscheduling again is a no-op.
    app.scheduler.unschedule(job.id);
    app.scheduler.unschedule(job.id);
    app.scheduler.schedule(&job).unwrap();
}

#[tokio::test]
async fn start_schedules_persisted_jobs() {
    let app = spawn_app(10).await;
    mock_current_ok(&app.server, 8.0).await;

    // The fresh database is seeded with one default weather job.
    app.scheduler.start().await.unwrap();
    let jobs = app.registry.load_all().await.unwrap();
    assert!(!jobs.is_empty());
    for job in &jobs {
        assert!(app.scheduler.is_scheduled(job.id));
    }

    app.scheduler.shutdown();
    for job in &jobs {
        assert!(!app.scheduler.is_scheduled(job.id));
    }
}
