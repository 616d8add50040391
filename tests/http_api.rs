mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use clinic_checkin::app::build_services;
use clinic_checkin::db;
use clinic_checkin::handlers::router;
use clinic_checkin::sms::SmsGateway;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use common::{setup_pool, test_config, RecordingGateway};

async fn test_app() -> Router {
    let pool = setup_pool().await;
    router(build_services(&test_config(), pool, None).state)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn check_in_returns_queue_position() {
    let app = test_app().await;
    let (status, body) = send(
        &app,
        post_json(
            "/check-in",
            json!({"fullName": "Alex Gordon", "phoneNumber": "5195550123"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["queueNumber"], json!(1));
    assert_eq!(body["patientsAhead"], json!(0));
    assert_eq!(body["estimatedWait"], json!(0));
    assert!(body["timestamp"].is_string());
    assert!(body["entryId"].is_i64());
}

#[tokio::test]
async fn invalid_check_in_reports_each_field() {
    let app = test_app().await;
    let (status, body) = send(
        &app,
        post_json("/check-in", json!({"fullName": "  ", "phoneNumber": "555-01"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Invalid input"));
    let fields: Vec<&str> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["fullName", "phoneNumber"]);

    // Nothing was queued.
    let (_, status_body) = send(&app, get("/queue/status")).await;
    assert_eq!(status_body["queueLength"], json!(0));
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let app = test_app().await;
    let req = Request::post("/check-in")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"][0]["field"], json!("body"));
}

#[tokio::test]
async fn queue_status_counts_waiting_entries() {
    let app = test_app().await;
    for i in 0..5 {
        let (status, _) = send(
            &app,
            post_json(
                "/check-in",
                json!({"fullName": "Pat Doe", "phoneNumber": format!("519555000{i}")}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(&app, get("/queue/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queueLength"], json!(5));
    // Estimates 0, 10, 20, 30, 40 minutes.
    assert_eq!(body["currentWaitTime"], json!(20));
    assert_eq!(body["clinicStatus"], json!("open"));
}

#[tokio::test]
async fn front_desk_updates_move_the_queue() {
    let app = test_app().await;
    let (_, first) = send(
        &app,
        post_json(
            "/check-in",
            json!({"fullName": "Alex Gordon", "phoneNumber": "5195550123"}),
        ),
    )
    .await;
    let (_, second) = send(
        &app,
        post_json(
            "/check-in",
            json!({"fullName": "Sam Lee", "phoneNumber": "5195550124"}),
        ),
    )
    .await;
    let first_id = first["entryId"].as_i64().unwrap();
    let second_id = second["entryId"].as_i64().unwrap();
    assert_eq!(second["queueNumber"], json!(2));

    let (status, body) = send(
        &app,
        post_json(
            &format!("/queue/entries/{first_id}/status"),
            json!({"status": "in_service"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("in_service"));
    assert_eq!(body["position"], Value::Null);

    let (status, body) = send(&app, get(&format!("/queue/entries/{second_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["position"], json!(1));
    assert_eq!(body["patientsAhead"], json!(0));
    assert_eq!(body["notificationState"], json!("pending"));

    // Backwards moves are rejected.
    let (status, _) = send(
        &app,
        post_json(
            &format!("/queue/entries/{first_id}/status"),
            json!({"status": "waiting"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = send(&app, get("/queue/status")).await;
    assert_eq!(body["queueLength"], json!(1));
}

#[tokio::test]
async fn unknown_entry_is_not_found() {
    let app = test_app().await;
    let (status, body) = send(&app, get("/queue/entries/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("999"));
}

#[tokio::test]
async fn storage_outage_fails_check_in_without_side_effects() {
    let td = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/clinic.db", td.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let gateway = RecordingGateway::default();
    let services = build_services(
        &test_config(),
        pool.clone(),
        Some(Arc::new(gateway.clone()) as Arc<dyn SmsGateway>),
    );
    let app = router(services.state);
    pool.close().await;

    let (status, body) = send(
        &app,
        post_json(
            "/check-in",
            json!({"fullName": "Alex Gordon", "phoneNumber": "5195550123"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"error": "Check-in failed"}));

    let (status, body) = send(&app, get("/queue/status")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], json!("Queue unavailable"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.started(), 0);

    let reopened = db::init_pool(&url).await.unwrap();
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries")
        .fetch_one(&reopened)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}
