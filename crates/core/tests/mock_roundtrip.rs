use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bulkgen_core::api::{CreateJobResponse, JobResponse};
use bulkgen_core::backoff::BackoffPolicy;
use bulkgen_core::client_queue::{ClientQueue, HttpTransport, QueueSettings, RunOutcome};
use bulkgen_core::config::AppConfig;
use bulkgen_core::server::{app_router, AppState};
use bulkgen_core::types::{JobStatus, PromptStatus};
use serde_json::json;
use tempfile::TempDir;

struct RunningServer {
    base_url: String,
    state: AppState,
    _data_dir: TempDir,
}

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.generation.mock_delay_ms = 0;
    config.queue.poll_interval_ms = 20;
    config.queue.base_delay_ms = 5;
    config.queue.max_delay_ms = 20;
    config.queue.flush_debounce_ms = 10;
    config.rate_limit.max_requests = 1_000;
    config
}

async fn spawn_server() -> RunningServer {
    let data_dir = tempfile::tempdir().unwrap();
    let state = AppState::new(fast_config(), data_dir.path());
    state.start();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app_router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    RunningServer {
        base_url: format!("http://{addr}/"),
        state,
        _data_dir: data_dir,
    }
}

#[tokio::test]
async fn client_queue_drains_through_live_server() {
    let server = spawn_server().await;
    let queue_dir = tempfile::tempdir().unwrap();

    let transport = HttpTransport::new(
        &server.base_url,
        Duration::from_secs(10),
        Duration::from_secs(10),
    )
    .unwrap();
    let settings = QueueSettings {
        backoff: BackoffPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            abort_threshold: BackoffPolicy::DEFAULT_ABORT_THRESHOLD,
        },
        persist_debounce: Duration::from_millis(10),
        ..QueueSettings::default()
    };
    let queue = ClientQueue::restore(
        queue_dir.path(),
        "MOCK".to_string(),
        Arc::new(transport),
        settings,
    )
    .await
    .unwrap();

    assert_eq!(queue.load_prompts(["a lighthouse", "a fox"], 2, Some("ink")), 4);
    assert_eq!(queue.run().await, RunOutcome::Drained);
    queue.close().await;

    let counts = queue.counts();
    assert_eq!(counts.completed, 4);
    assert_eq!(counts.error, 0);

    let stored = std::fs::read_dir(queue.results().dir())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "png"))
        .count();
    assert_eq!(stored, 4);

    server.state.shutdown().await;
}

#[tokio::test]
async fn server_job_runs_to_completion_and_serves_images() {
    let server = spawn_server().await;
    let http = reqwest::Client::new();

    let created = http
        .post(format!("{}api/jobs", server.base_url))
        .json(&json!({
            "cookie": "MOCK",
            "prompts": ["a red kite", "  ", "a blue boat"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), reqwest::StatusCode::CREATED);
    let created: CreateJobResponse = created.json().await.unwrap();
    assert_eq!(created.total_count, 2);

    let mut job: Option<JobResponse> = None;
    for _ in 0..200 {
        let current: JobResponse = http
            .get(format!("{}api/jobs/{}", server.base_url, created.id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if current.status.is_terminal() {
            job = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let job = job.expect("job should finish");

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_count, 2);
    assert_eq!(job.progress, 100);
    assert!(job
        .prompts
        .iter()
        .all(|prompt| prompt.status == PromptStatus::Completed));

    let image_url = job.prompts[0].image.clone().expect("image url");
    let image = http
        .get(format!(
            "{}{}",
            server.base_url.trim_end_matches('/'),
            image_url
        ))
        .send()
        .await
        .unwrap();
    assert!(image.status().is_success());
    assert!(!image.bytes().await.unwrap().is_empty());

    server.state.shutdown().await;
}
