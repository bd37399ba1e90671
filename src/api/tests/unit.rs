use super::super::*;
use crate::collector::Collector;
use crate::config::SchedulerConfig;
use crate::reporter::LoggingReporter;
use tokio::net::TcpListener;

async fn test_server() -> String {
    let events = Arc::new(EventBus::new());
    let store = Arc::new(Store::open(":memory:", events.clone()).unwrap());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        events.clone(),
        &SchedulerConfig {
            tick_interval_secs: 1,
            heartbeat_interval_secs: 10,
            agent_grace_period_secs: 30,
            cancel_grace_secs: 30,
        },
        90,
    ));
    let collector = Arc::new(Collector::new(store.clone(), events.clone(), scheduler.clone(), Arc::new(LoggingReporter)));
    let server = Arc::new(ApiServer::new(
        "127.0.0.1".to_string(),
        0,
        vec!["http://localhost:3000".to_string()],
        store,
        events,
        scheduler,
        collector,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.build_router();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .await
            .unwrap();
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    format!("http://{addr}")
}

#[tokio::test]
async fn health_reports_success() {
    let base = test_server().await;
    let response = reqwest::get(format!("{base}/api/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], serde_json::Value::Bool(true));
}

#[tokio::test]
async fn create_task_rejects_an_unknown_subtask_kind() {
    let base = test_server().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/api/tasks"))
        .json(&serde_json::json!({
            "name": "t1",
            "subtasks": [{
                "name": "delete_everything",
                "target_agent": "a1",
                "order": 0,
                "timeout_seconds": 30,
            }],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], serde_json::Value::Bool(false));
}

#[tokio::test]
async fn create_task_accepts_a_well_formed_request() {
    let base = test_server().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/api/tasks"))
        .json(&serde_json::json!({
            "name": "nightly check",
            "subtasks": [{
                "name": "get_hostname",
                "target_agent": "a1",
                "order": 0,
                "timeout_seconds": 30,
            }],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["data"]["id"].is_i64());
}

#[tokio::test]
async fn get_task_on_an_unknown_id_is_a_404() {
    let base = test_server().await;
    let response = reqwest::get(format!("{base}/api/tasks/999999")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn cors_allows_the_configured_origin() {
    let base = test_server().await;
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{base}/api/health"))
        .header("Origin", "http://localhost:3000")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn register_and_fetch_agent_roundtrips() {
    let base = test_server().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/api/agents/register"))
        .json(&serde_json::json!({
            "name": "a1",
            "address": "10.0.0.1:9000",
            "capabilities": ["get_hostname"],
            "fingerprint": {},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = reqwest::get(format!("{base}/api/agents/a1")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"]["name"], "a1");
}
