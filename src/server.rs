//! HTTP surface: liveness, health, metrics and the command API.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /` | plain-text liveness |
//! | `GET /health` | status and current cycle state |
//! | `GET /metrics` | cycle counters |
//! | `GET /api/v1/info` | tracked destinations and command help |
//! | `PUT /api/v1/destinations/{id}` | start tracking a destination |
//! | `DELETE /api/v1/destinations/{id}` | stop tracking a destination |
//! | `POST /api/v1/sync` | run a cycle now |
//! | `GET /api/v1/preview` | fetch and filter without posting |
//!
//! When an API key is configured every `/api/*` route requires
//! `Authorization: Bearer <key>`.

use crate::lifecycle::{CycleError, Synchronizer};
use crate::metrics::format_uptime;
use crate::render::DaysLeft;
use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Events shown by the preview endpoint
const PREVIEW_LIMIT: usize = 3;

pub struct AppState {
    pub synchronizer: Arc<Synchronizer>,
    pub api_key: Option<String>,
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message.into() })))
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/info", get(info_handler))
        .route(
            "/api/v1/destinations/{id}",
            put(track_destination).delete(untrack_destination),
        )
        .route("/api/v1/sync", post(trigger_sync))
        .route("/api/v1/preview", get(preview))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(api_key) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if !req.uri().path().starts_with("/api/") {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if token == api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn root() -> &'static str {
    "Beacon is running"
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sync = &state.synchronizer;
    Json(json!({
        "status": "ok",
        "cycle": sync.state(),
        "running": sync.is_running(),
    }))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.synchronizer.metrics().snapshot();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": snapshot.uptime_seconds,
        "uptime": format_uptime(snapshot.uptime_seconds),
        "cycles": {
            "committed": snapshot.cycles_committed,
            "aborted": snapshot.cycles_aborted,
        },
        "messages": {
            "posted": snapshot.posts,
            "post_failures": snapshot.post_failures,
            "deleted": snapshot.deletes,
            "delete_failures": snapshot.delete_failures,
        },
        "status": "running"
    }))
}

async fn info_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let destinations = state.synchronizer.registry().list().await;

    Json(json!({
        "tracked": destinations.len(),
        "destinations": destinations,
        "commands": {
            "PUT /api/v1/destinations/{id}": "start posting events to a destination",
            "DELETE /api/v1/destinations/{id}": "stop posting events to a destination",
            "POST /api/v1/sync": "refresh events at every destination now",
            "GET /api/v1/preview": "show what the next refresh would post",
        }
    }))
}

async fn track_destination(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let added = state
        .synchronizer
        .registry()
        .add(&id)
        .await
        .map_err(|e| {
            error!(destination = %id, error = %e, "Failed to save registry");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(json!({ "destination": id, "tracked": true, "changed": added })))
}

async fn untrack_destination(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let removed = state
        .synchronizer
        .registry()
        .remove(&id)
        .await
        .map_err(|e| {
            error!(destination = %id, error = %e, "Failed to save registry");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(json!({ "destination": id, "tracked": false, "changed": removed })))
}

async fn trigger_sync(State(state): State<Arc<AppState>>) -> ApiResult {
    let sync = &state.synchronizer;

    if sync.registry().is_empty().await {
        return Err(api_error(
            StatusCode::PRECONDITION_FAILED,
            "no destinations are tracked, add one first",
        ));
    }

    info!("Manual synchronization requested");

    // Detached so a disconnecting client cannot cancel a cycle mid-reconcile.
    let cycle = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.trigger_manual().await })
    };
    let result = cycle.await.map_err(|e| {
        error!(error = %e, "Manual synchronization task failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "synchronization task failed")
    })?;

    match result {
        Ok(report) => Ok(Json(json!(report))),
        Err(e) => {
            let status = match &e {
                CycleError::Busy => StatusCode::CONFLICT,
                CycleError::Fetch(_) | CycleError::TimedOut(_) => StatusCode::BAD_GATEWAY,
                CycleError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err(api_error(status, e.to_string()))
        }
    }
}

async fn preview(State(state): State<Arc<AppState>>) -> ApiResult {
    let preview = state.synchronizer.preview().await.map_err(|e| {
        warn!(error = %e, "Preview fetch failed");
        api_error(StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    let now = Utc::now();
    let events: Vec<Value> = preview
        .normalized
        .events
        .iter()
        .take(PREVIEW_LIMIT)
        .map(|event| {
            json!({
                "title": event.title,
                "created_at": event.created_at,
                "end_at": event.end_at,
                "days_left": DaysLeft::between(event.end_at, now).to_string(),
                "region": event.region,
                "link": event.link,
            })
        })
        .collect();

    Ok(Json(json!({
        "fetched": preview.fetched,
        "displayable": preview.normalized.events.len(),
        "rejected": preview.normalized.rejected.len(),
        "events": events,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawEvent;
    use crate::lifecycle::tests::{event, harness, harness_with, no_delays, FakeSink, FakeSource, Harness};
    use crate::lifecycle::{CycleState, SyncSettings, Trigger};
    use crate::store::{HandleList, KeyValueStore};
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn app(h: &Harness, api_key: Option<&str>) -> Router {
        router(Arc::new(AppState {
            synchronizer: h.sync.clone(),
            api_key: api_key.map(str::to_string),
        }))
    }

    fn request(method: &str, uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: Router, req: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let h = harness(vec![], &[]).await;

        let response = app(&h, None).oneshot(request("GET", "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Beacon is running");

        let (status, body) = send(app(&h, None), request("GET", "/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cycle"], "idle");
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_api_requires_key_when_configured() {
        let h = harness(vec![], &[]).await;

        let (status, _) = send(app(&h, Some("secret")), request("GET", "/api/v1/info")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = HttpRequest::builder()
            .uri("/api/v1/info")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(&h, Some("secret")), wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let right = HttpRequest::builder()
            .uri("/api/v1/info")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(&h, Some("secret")), right).await;
        assert_eq!(status, StatusCode::OK);

        // Health stays open.
        let (status, _) = send(app(&h, Some("secret")), request("GET", "/health")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_track_and_untrack() {
        let h = harness(vec![], &[]).await;

        let (status, body) = send(app(&h, None), request("PUT", "/api/v1/destinations/123")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);

        let (_, body) = send(app(&h, None), request("PUT", "/api/v1/destinations/123")).await;
        assert_eq!(body["changed"], false);

        let (_, body) = send(app(&h, None), request("GET", "/api/v1/info")).await;
        assert_eq!(body["tracked"], 1);
        assert_eq!(body["destinations"], json!(["123"]));

        let (status, body) =
            send(app(&h, None), request("DELETE", "/api/v1/destinations/123")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);

        let (status, body) =
            send(app(&h, None), request("DELETE", "/api/v1/destinations/123")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], false);
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_sync_without_destinations() {
        let h = harness(vec![event("A")], &[]).await;
        let (status, _) = send(app(&h, None), request("POST", "/api/v1/sync")).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_sync_posts_and_reports() {
        let h = harness(vec![event("A"), event("B")], &["chan"]).await;

        let (status, body) = send(app(&h, None), request("POST", "/api/v1/sync")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["trigger"], "manual");
        assert_eq!(body["displayable"], 2);
        assert_eq!(body["destinations"][0]["destination"], "chan");
        assert_eq!(body["destinations"][0]["status"], "synced");
        assert_eq!(body["destinations"][0]["posted"], 2);
        assert_eq!(h.sink.live_titles("chan"), vec!["A", "B"]);

        let (_, metrics) = send(app(&h, None), request("GET", "/metrics")).await;
        assert_eq!(metrics["cycles"]["committed"], 1);
        assert_eq!(metrics["messages"]["posted"], 2);
    }

    #[tokio::test]
    async fn test_sync_fetch_failure_is_bad_gateway() {
        let h = harness(vec![event("A")], &["chan"]).await;
        h.source.set_failing(true);

        let (status, body) = send(app(&h, None), request("POST", "/api/v1/sync")).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("fetch failed"));
    }

    #[tokio::test]
    async fn test_sync_while_running_is_conflict() {
        let gate = Arc::new(Notify::new());
        let source = FakeSource {
            events: StdMutex::new(vec![event("A")]),
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let h = harness_with(source, FakeSink::default(), &["chan"], no_delays()).await;

        let mut state = h.sync.subscribe_state();
        let running = {
            let sync = h.sync.clone();
            tokio::spawn(async move { sync.run_cycle(Trigger::Scheduled).await })
        };
        state
            .wait_for(|s| *s == CycleState::Fetching)
            .await
            .unwrap();

        let (status, _) = send(app(&h, None), request("POST", "/api/v1/sync")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        gate.notify_one();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_survives_client_disconnect() {
        let settings = SyncSettings {
            post_delay: Duration::from_secs(1),
            ..no_delays()
        };
        let h = harness_with(
            FakeSource::with_events(vec![event("A")]),
            FakeSink::default(),
            &["chan"],
            settings,
        )
        .await;
        h.sync.run_cycle(Trigger::Scheduled).await.unwrap();
        h.source.set_events(vec![event("B"), event("C")]);

        let pending = tokio::spawn(send(app(&h, None), request("POST", "/api/v1/sync")));

        // Old message deleted, first new one posted, cycle pacing before the next.
        while h.sink.live_titles("chan") != vec!["B"] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        let mut state = h.sync.subscribe_state();
        state
            .wait_for(|s| matches!(s, CycleState::Committed | CycleState::Aborted))
            .await
            .unwrap();
        assert_eq!(h.sync.state(), CycleState::Committed);

        let live: Vec<_> = h.sink.live.lock().unwrap()["chan"]
            .iter()
            .map(|(handle, _)| handle.clone())
            .collect();
        assert_eq!(h.sink.live_titles("chan"), vec!["B", "C"]);
        assert_eq!(h.messages.load().await["chan"], HandleList(live));
    }

    #[tokio::test]
    async fn test_preview_limits_events() {
        let h = harness(
            vec![
                event("A"),
                event("B"),
                event("C"),
                event("D"),
                RawEvent::new("Broken"),
            ],
            &["chan"],
        )
        .await;

        let (status, body) = send(app(&h, None), request("GET", "/api/v1/preview")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fetched"], 5);
        assert_eq!(body["displayable"], 4);
        assert_eq!(body["rejected"], 1);
        assert_eq!(body["events"].as_array().unwrap().len(), 3);
        assert_eq!(body["events"][0]["title"], "A");
        assert!(h.sink.calls.lock().unwrap().is_empty());
    }
}
