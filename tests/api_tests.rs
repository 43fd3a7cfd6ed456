mod common;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use common::{BASE_DN, TestEnv, people};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

async fn spawn_app() -> (Router, TestEnv) {
    let env = TestEnv::new().await;
    let state = ldapguard::api::create_app_state(Arc::clone(&env.shared), None);
    let app = ldapguard::api::router(state).await;
    (app, env)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn with_json(method: &str, uri: &str, token: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = send(
        app,
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("Content-Type", "application/json")
            .body(Body::from(
                json!({ "username": username, "password": password }).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["access_token"].as_str().unwrap().to_string()
}

async fn create_server(app: &Router, token: &str, env: &TestEnv) -> i64 {
    let target = env.memory.add_directory(BASE_DN, people(3));
    let (status, body) = send(
        app,
        with_json(
            "POST",
            "/api/ldap-servers",
            token,
            &json!({
                "name": "primary",
                "host": target.host,
                "port": target.port,
                "base_dn": BASE_DN,
                "bind_dn": target.bind_dn,
                "bind_password": "secret",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["has_bind_password"], true);
    assert!(body.get("bind_password").is_none());
    body["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let (app, _env) = spawn_app().await;

    let (status, body) = send(
        &app,
        Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "connected");
}

#[tokio::test]
async fn test_auth_endpoints() {
    let (app, _env) = spawn_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/ldap-servers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("www-authenticate"));
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["detail"].is_string());

    let (status, _) = send(&app, get("/api/ldap-servers", "not-a-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("Content-Type", "application/json")
            .body(Body::from(
                json!({ "username": "admin", "password": "wrong" }).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = login(&app, "admin", "password").await;
    let (status, body) = send(&app, get("/api/auth/me", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "admin");
    assert_eq!(body["role"], "admin");
}

#[tokio::test]
async fn test_roles_are_enforced() {
    let (app, _env) = spawn_app().await;
    let admin = login(&app, "admin", "password").await;

    let (status, _) = send(
        &app,
        with_json(
            "POST",
            "/api/auth/users",
            &admin,
            &json!({
                "username": "watcher",
                "password": "watcher-pass",
                "role": "viewer",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let viewer = login(&app, "watcher", "watcher-pass").await;

    let (status, _) = send(&app, get("/api/backups", &viewer)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            "/api/ldap-servers",
            &viewer,
            &json!({ "name": "x", "host": "memory", "base_dn": BASE_DN }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["detail"].is_string());

    let (status, _) = send(&app, get("/api/audit-logs", &viewer)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_backup_lifecycle_over_http() {
    let (app, env) = spawn_app().await;
    let token = login(&app, "admin", "password").await;
    let server_id = create_server(&app, &token, &env).await;

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            "/api/backups/",
            &token,
            &json!({ "ldap_server_id": server_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["backup_type"], "full");
    assert_eq!(body["encrypted"], true);
    let backup_id = body["id"].as_i64().unwrap();

    // No worker is running here, so the job is still pending and cannot be
    // restored or deleted.
    let (status, body) = send(
        &app,
        with_json(
            "POST",
            "/api/restores",
            &token,
            &json!({ "backup_id": backup_id, "ldap_server_id": server_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/backups/{backup_id}"))
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            &format!("/api/backups/{backup_id}/cancel"),
            &token,
            &json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = send(&app, get(&format!("/api/backups/{backup_id}"), &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");

    let (status, body) = send(
        &app,
        get(&format!("/api/backups/{backup_id}/transitions"), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(2));

    let (status, body) = send(&app, get("/api/backups?status=failed", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let (status, _) = send(&app, get("/api/backups?status=bogus", &token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        get("/api/audit-logs?action=backup.created", &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_backup_for_unknown_server_is_not_found() {
    let (app, _env) = spawn_app().await;
    let token = login(&app, "admin", "password").await;

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            "/api/backups",
            &token,
            &json!({ "ldap_server_id": 4242 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn test_batch_delete_requires_ids() {
    let (app, _env) = spawn_app().await;
    let token = login(&app, "admin", "password").await;

    let (status, _) = send(
        &app,
        with_json(
            "POST",
            "/api/backups/batch-delete",
            &token,
            &json!({ "backup_ids": [] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_connection_test_reports_failure_in_body() {
    let (app, env) = spawn_app().await;
    let token = login(&app, "admin", "password").await;
    let server_id = create_server(&app, &token, &env).await;

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            &format!("/api/ldap-servers/{server_id}/test"),
            &token,
            &json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["entries_found"], 5);

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            "/api/ldap-servers/test",
            &token,
            &json!({
                "host": "memory",
                "port": 1,
                "base_dn": BASE_DN,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_schedules_validate_cron() {
    let (app, env) = spawn_app().await;
    let token = login(&app, "admin", "password").await;
    let server_id = create_server(&app, &token, &env).await;

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            "/api/scheduled-backups",
            &token,
            &json!({
                "name": "broken",
                "ldap_server_id": server_id,
                "cron_expression": "61 * * * *",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["detail"]
            .as_str()
            .is_some_and(|d| d.starts_with("ScheduleInvalid"))
    );

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            "/api/scheduled-backups",
            &token,
            &json!({
                "name": "nightly",
                "ldap_server_id": server_id,
                "cron_expression": "0 2 * * *",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["retention_days"], 30);
    assert!(body["next_run_at"].is_string());
    let schedule_id = body["id"].as_i64().unwrap();

    let (status, _) = send(
        &app,
        with_json(
            "POST",
            "/api/scheduled-backups",
            &token,
            &json!({
                "name": "nightly",
                "ldap_server_id": server_id,
                "cron_expression": "0 3 * * *",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            &format!("/api/scheduled-backups/{schedule_id}/run"),
            &token,
            &json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    assert_eq!(body["scheduled_backup_id"], schedule_id);

    let (status, _) = send(
        &app,
        with_json(
            "POST",
            &format!("/api/scheduled-backups/{schedule_id}/run"),
            &token,
            &json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_settings_roundtrip() {
    let (app, _env) = spawn_app().await;
    let token = login(&app, "admin", "password").await;

    let (status, body) = send(
        &app,
        with_json(
            "PUT",
            "/api/settings",
            &token,
            &json!({ "key": "ui.theme", "value": "dark" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = send(&app, get("/api/settings/ui.theme", &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "dark");

    let (status, _) = send(
        &app,
        with_json("POST", "/api/settings/batch", &token, &json!([])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get("/api/settings/missing.key", &token)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_key_authenticates_with_its_role() {
    let (app, _env) = spawn_app().await;
    let token = login(&app, "admin", "password").await;

    let (status, body) = send(
        &app,
        with_json(
            "POST",
            "/api/api-keys",
            &token,
            &json!({ "name": "monitoring", "permissions": "read" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let key = body["key"].as_str().unwrap().to_string();
    let key_id = body["id"].as_i64().unwrap();

    let (status, _) = send(
        &app,
        Request::builder()
            .uri("/api/backups")
            .header("X-Api-Key", &key)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/backups")
            .header("X-Api-Key", &key)
            .header("Content-Type", "application/json")
            .body(Body::from(json!({ "ldap_server_id": 1 }).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(format!("/api/api-keys/{key_id}/revoke"))
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, get("/api/backups", &key)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_config_export_omits_secrets() {
    let (app, env) = spawn_app().await;
    let token = login(&app, "admin", "password").await;
    create_server(&app, &token, &env).await;

    let (status, body) = send(&app, get("/api/config/export", &token)).await;
    assert_eq!(status, StatusCode::OK);

    let servers = body["ldap_servers"].as_array().unwrap();
    assert_eq!(servers.len(), 1);
    assert!(servers[0].get("bind_password").is_none());
    let users = body["users"].as_array().unwrap();
    assert!(users.iter().all(|u| u.get("hashed_password").is_none()));

    // Importing the same document again finds everything already present.
    let (status, imported) = send(
        &app,
        with_json("POST", "/api/config/import", &token, &body),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{imported}");
    assert_eq!(imported["imported"]["servers"], 0);
    assert_eq!(imported["imported"]["users"], 0);
}

#[tokio::test]
async fn test_security_headers_are_set() {
    let (app, _env) = spawn_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert!(headers.contains_key("x-request-id"));
}
