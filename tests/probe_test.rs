//! Probe endpoints and the worker loops.

mod support;

use axum::http::StatusCode;
use hubsettle::api::{self, AppState};
use hubsettle::domain::{NewProcessRequest, ProcessStatus, ProcessType, QueueName};
use hubsettle::orchestration::spawn_workers;
use std::time::Duration;
use tokio::sync::watch;
use support::*;
use tower::util::ServiceExt;

async fn get(app: axum::Router, uri: &str) -> (StatusCode, String) {
    let request = axum::http::Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let env = setup().await;
    let app = api::create_router(AppState::new(env.repo.clone()));

    let (status, body) = get(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("ok"));
}

#[tokio::test]
async fn test_ready_endpoint() {
    let env = setup().await;
    let app = api::create_router(AppState::new(env.repo.clone()));

    let (status, body) = get(app, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("ready"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let env = setup().await;
    let app = api::create_router(AppState::new(env.repo.clone()));

    let (status, _) = get(app, "/invoices").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_poller_drains_queues_and_workers_stop_on_shutdown() {
    let mut env = setup().await;
    env.config.poll_interval = Duration::from_millis(10);

    add_point(&env.repo, true).await;
    let process = env
        .services
        .processes
        .create(
            &NewProcessRequest {
                process_type: ProcessType::Switch,
                metering_point_id: point_id(),
                effective_date: date(2030, 1, 1),
            },
            date(2029, 12, 1),
            now(),
        )
        .await
        .unwrap();
    env.services
        .processes
        .send_request(process.id, now())
        .await
        .unwrap();
    env.hub.push(
        QueueName::Process,
        "msg-1",
        "process_acknowledgement",
        r#"{"correlation_id":"corr-1","outcome":"acknowledged"}"#,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&env.services, &env.config, shutdown_rx);

    let mut acknowledged = false;
    for _ in 0..200 {
        let current = env.services.processes.get(process.id).await.unwrap().unwrap();
        if current.status == ProcessStatus::Acknowledged {
            acknowledged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(acknowledged);
    assert_eq!(env.hub.queue_len(QueueName::Process), 0);

    shutdown_tx.send(true).unwrap();
    for handle in workers {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
