//! Drives `HttpBackend` and the realtime driver against an in-process fake server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use hearth_client::{HttpBackend, run_realtime};
use hearth_sync::config::SyncConfig;
use hearth_sync::realtime::{Realtime, SubscriptionEvent};
use hearth_sync::{Backend, RoomSession, RoomStatus, SyncContext, SyncError};
use hearth_types::api::RealtimeSubscribeRequest;
use hearth_types::events::RecordAction;
use hearth_types::models::RoomKind;

const TOKEN: &str = "tok-1";

#[derive(Default)]
struct Recorded {
    list_queries: Vec<HashMap<String, String>>,
    created: Vec<(String, Value)>,
    heartbeats: Vec<Value>,
    topic_requests: Vec<RealtimeSubscribeRequest>,
    realtime_connects: usize,
}

type Shared = Arc<Mutex<Recorded>>;

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"status": 401, "message": "The request requires valid record authorization token.", "data": {}})),
    )
        .into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some(TOKEN)
}

fn message_json(id: &str, room: &str, author: &str, body: &str, created: &str) -> Value {
    json!({
        "id": id,
        "room": room,
        "author": author,
        "author_name": "",
        "body": body,
        "created": created,
        "expires_at": "",
        "expand": {"author": {"display_name": author.to_uppercase()}},
    })
}

async fn login(Json(req): Json<Value>) -> Response {
    if req["identity"] != "ash@hearth.test" || req["password"] != "kindling" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": 400, "message": "Failed to authenticate.", "data": {}})),
        )
            .into_response();
    }
    Json(json!({
        "token": TOKEN,
        "record": {"id": "u1", "email": "ash@hearth.test", "display_name": "Ash"},
    }))
    .into_response()
}

async fn auth_refresh() -> Response {
    unauthorized()
}

async fn list_records(
    State(state): State<Shared>,
    Path(collection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    state.lock().unwrap().list_queries.push(query);

    // Newest first, as requested by `sort=-created`.
    let items = match collection.as_str() {
        "messages" => vec![
            message_json("m2", "r1", "u2", "second", "2026-10-19 10:00:05.000Z"),
            message_json("m1", "r1", "u3", "first", "2026-10-19 10:00:00.000Z"),
        ],
        _ => Vec::new(),
    };
    Json(json!({"page": 1, "perPage": 200, "totalItems": items.len(), "items": items})).into_response()
}

async fn get_record(Path((collection, id)): Path<(String, String)>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    match (collection.as_str(), id.as_str()) {
        ("rooms", "r1") => Json(json!({"id": "r1", "name": "Campfire", "type": "campfire"})).into_response(),
        ("direct_messages", "d1") => {
            Json(json!({"id": "d1", "participant_a": "u1", "participant_b": "u2"})).into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": 404, "message": "The requested resource wasn't found.", "data": {}})),
        )
            .into_response(),
    }
}

async fn create_record(
    State(state): State<Shared>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if collection == "room_members" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": 400,
                "message": "Failed to create record.",
                "data": {"room": {"code": "validation_not_unique", "message": "Value must be unique."}},
            })),
        )
            .into_response();
    }

    state.lock().unwrap().created.push((collection.clone(), body.clone()));
    let scope = if collection == "dm_messages" { "dm" } else { "room" };
    let mut record = json!({
        "id": "srv1",
        "author": body["author"],
        "author_name": "Ash",
        "body": body["body"],
        "created": "2026-10-19 10:01:00.000Z",
        "expires_at": "2026-10-19 10:06:00.000Z",
    });
    record[scope] = body[scope].clone();
    Json(record).into_response()
}

async fn heartbeat(State(state): State<Shared>, Json(body): Json<Value>) -> StatusCode {
    state.lock().unwrap().heartbeats.push(body);
    StatusCode::NO_CONTENT
}

async fn presence(Path(room_id): Path<String>) -> Response {
    if room_id != "r1" {
        return (StatusCode::NOT_FOUND, Json(json!({"status": 404, "message": "Room not found."}))).into_response();
    }
    Json(json!({
        "online": [
            {"user_id": "u1", "display_name": "Ash", "updated_at": "2026-10-19 10:00:00.000Z"},
            {"user_id": "u2", "display_name": "Ember", "updated_at": "2026-10-19 10:00:10.000Z"},
        ],
        "count": 2,
    }))
    .into_response()
}

async fn health() -> impl IntoResponse {
    ([(header::DATE, "Mon, 19 Oct 2026 10:00:30 GMT")], Json(json!({"code": 200})))
}

async fn realtime_stream(State(state): State<Shared>) -> impl IntoResponse {
    let n = {
        let mut state = state.lock().unwrap();
        state.realtime_connects += 1;
        state.realtime_connects
    };
    let record = message_json("m9", "r1", "u2", "pushed", "2026-10-19 10:02:00.000Z");
    let body = format!(
        "id:c{n}\nevent:PB_CONNECT\ndata:{{\"clientId\":\"c{n}\"}}\n\n\
         : comment\n\n\
         event:messages/*\ndata:{}\n\n",
        json!({"action": "create", "record": record}),
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn realtime_topics(
    State(state): State<Shared>,
    Json(req): Json<RealtimeSubscribeRequest>,
) -> StatusCode {
    state.lock().unwrap().topic_requests.push(req);
    StatusCode::NO_CONTENT
}

async fn serve() -> (String, Shared) {
    let shared = Shared::default();
    let app = Router::new()
        .route("/api/collections/users/auth-with-password", post(login))
        .route("/api/collections/users/auth-refresh", post(auth_refresh))
        .route("/api/collections/{collection}/records", get(list_records).post(create_record))
        .route("/api/collections/{collection}/records/{id}", get(get_record))
        .route("/api/hearth/presence/heartbeat", post(heartbeat))
        .route("/api/hearth/presence/{room_id}", get(presence))
        .route("/api/health", get(health))
        .route("/api/realtime", get(realtime_stream).post(realtime_topics))
        .with_state(shared.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), shared)
}

async fn signed_in() -> (HttpBackend, Shared) {
    let (url, shared) = serve().await;
    let backend = HttpBackend::new(url);
    backend.login("ash@hearth.test", "kindling").await.unwrap();
    (backend, shared)
}

#[tokio::test]
async fn login_stores_session() {
    let (url, _shared) = serve().await;
    let backend = HttpBackend::new(url);

    assert!(matches!(
        backend.login("ash@hearth.test", "wrong").await,
        Err(SyncError::Status { status: 400, .. })
    ));
    assert!(backend.current_user().is_none());

    let user = backend.login("ash@hearth.test", "kindling").await.unwrap();
    assert_eq!(user.id, "u1");
    assert_eq!(backend.current_user().unwrap().display_name(), "Ash");
    assert_eq!(backend.token().as_deref(), Some(TOKEN));

    backend.clear_auth();
    assert!(backend.current_user().is_none());
}

#[tokio::test]
async fn lists_newest_page_oldest_first() {
    let (backend, shared) = signed_in().await;

    let page = backend.list_messages(RoomKind::Campfire, "r1", 50).await.unwrap();
    let ids: Vec<&str> = page.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(page[0].display_name(), "U3");
    assert_eq!(page[0].expires_at, None);

    let recorded = shared.lock().unwrap();
    let query = &recorded.list_queries[0];
    assert_eq!(query["perPage"], "50");
    assert_eq!(query["sort"], "-created");
    assert_eq!(query["filter"], r#"(room="r1")"#);
}

#[tokio::test]
async fn requests_without_session_are_unauthorized() {
    let (url, _shared) = serve().await;
    let backend = HttpBackend::new(url);

    assert_eq!(
        backend.list_messages(RoomKind::Campfire, "r1", 50).await,
        Err(SyncError::Unauthorized)
    );
    assert_eq!(backend.auth_refresh().await, Err(SyncError::NoSession));
    assert_eq!(
        backend.create_message(RoomKind::Campfire, "r1", "hi").await,
        Err(SyncError::NoSession)
    );
}

#[tokio::test]
async fn creates_scoped_messages() {
    let (backend, shared) = signed_in().await;

    let created = backend.create_message(RoomKind::Campfire, "r1", "hello").await.unwrap();
    assert_eq!(created.id, "srv1");
    assert_eq!(created.room, "r1");
    assert!(created.expires_at.is_some());

    let dm = backend.create_message(RoomKind::Direct, "d1", "psst").await.unwrap();
    assert_eq!(dm.room, "d1");

    let recorded = shared.lock().unwrap();
    assert_eq!(recorded.created[0].0, "messages");
    assert_eq!(recorded.created[0].1, json!({"author": "u1", "body": "hello", "room": "r1"}));
    assert_eq!(recorded.created[1].0, "dm_messages");
    assert_eq!(recorded.created[1].1["dm"], "d1");
}

#[tokio::test]
async fn duplicate_membership_is_conflict() {
    let (backend, _shared) = signed_in().await;
    assert_eq!(backend.join_room("r1").await, Err(SyncError::Conflict));
}

#[tokio::test]
async fn presence_endpoints() {
    let (backend, shared) = signed_in().await;

    backend.heartbeat("r1").await.unwrap();
    assert_eq!(shared.lock().unwrap().heartbeats, vec![json!({"room_id": "r1"})]);

    let online = backend.presence("r1").await.unwrap();
    let names: Vec<&str> = online.iter().map(|p| p.display_name.as_str()).collect();
    assert_eq!(names, vec!["Ash", "Ember"]);
    assert!(online[1].last_seen.is_some());

    assert!(matches!(backend.presence("nowhere").await, Err(SyncError::NotFound(_))));
}

#[tokio::test]
async fn server_time_comes_from_date_header() {
    let (backend, _shared) = signed_in().await;
    let time = backend.server_time().await.unwrap();
    assert_eq!(time, Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 30).unwrap());
}

#[tokio::test]
async fn rejected_refresh_is_unauthorized() {
    let (backend, _shared) = signed_in().await;
    assert_eq!(backend.auth_refresh().await, Err(SyncError::Unauthorized));
}

async fn next_event(sub: &mut hearth_sync::realtime::Subscription) -> SubscriptionEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for realtime event")
        .expect("realtime hub closed")
}

#[tokio::test]
async fn looks_up_rooms_and_conversations() {
    let (backend, _shared) = signed_in().await;

    assert_eq!(backend.get_room(RoomKind::Campfire, "r1").await, Ok(()));
    assert_eq!(backend.get_room(RoomKind::Direct, "d1").await, Ok(()));
    assert_eq!(
        backend.get_room(RoomKind::Den, "nope").await,
        Err(SyncError::NotFound("/api/collections/rooms/records/nope".into()))
    );
    assert!(matches!(
        backend.get_room(RoomKind::Direct, "r1").await,
        Err(SyncError::NotFound(_))
    ));
}

#[tokio::test]
async fn unknown_room_opens_as_not_found() {
    let (backend, shared) = signed_in().await;
    let ctx = SyncContext::new(Arc::new(backend), SyncConfig::default());

    for (kind, id) in [(RoomKind::Campfire, "nope"), (RoomKind::Direct, "d404")] {
        let room = RoomSession::open(&ctx, kind, id);
        let mut view_rx = room.subscribe();
        let view = tokio::time::timeout(
            Duration::from_secs(5),
            view_rx.wait_for(|v| v.status != RoomStatus::Loading),
        )
        .await
        .expect("timed out waiting for room status")
        .expect("room task ended")
        .clone();
        assert_eq!(view.status, RoomStatus::NotFound);
        assert!(view.messages.is_empty());
    }
    assert!(shared.lock().unwrap().list_queries.is_empty());
}

#[tokio::test]
async fn realtime_driver_connects_forwards_and_reconnects() {
    let (backend, shared) = signed_in().await;
    let backend = Arc::new(backend);
    let realtime = Realtime::new();
    let mut sub = realtime.subscribe("messages");

    let driver = tokio::spawn(run_realtime(
        backend.clone(),
        realtime.clone(),
        SyncConfig {
            reconnect_backoff: vec![Duration::from_millis(50)],
            ..SyncConfig::default()
        },
    ));

    assert_eq!(next_event(&mut sub).await, SubscriptionEvent::Connected);
    match next_event(&mut sub).await {
        SubscriptionEvent::Record(event) => {
            assert_eq!(event.action, RecordAction::Create);
            assert_eq!(event.record.id, "m9");
        }
        other => panic!("expected record event, got {:?}", other),
    }

    // The fake server closes every stream after one event.
    assert_eq!(next_event(&mut sub).await, SubscriptionEvent::Disconnected);
    assert_eq!(next_event(&mut sub).await, SubscriptionEvent::Connected);
    driver.abort();

    let recorded = shared.lock().unwrap();
    assert!(recorded.realtime_connects >= 2);
    assert_eq!(recorded.topic_requests[0].client_id, "c1");
    assert_eq!(recorded.topic_requests[0].subscriptions, vec!["messages/*".to_string()]);
    assert_eq!(recorded.topic_requests[1].client_id, "c2");
}
