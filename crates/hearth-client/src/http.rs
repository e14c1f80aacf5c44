//! `Backend` over the Hearth REST API.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, header};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use hearth_sync::{Backend, SyncError};
use hearth_types::api::{
    AuthResponse, ErrorResponse, HeartbeatRequest, JoinRoomRequest, ListResponse,
    PasswordAuthRequest, PresenceResponse, RealtimeSubscribeRequest,
};
use hearth_types::models::{MessageRecord, PresenceEntry, RoomKind, User};

struct AuthState {
    token: String,
    user: User,
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    auth: RwLock<Option<AuthState>>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth: RwLock::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn token(&self) -> Option<String> {
        self.auth.read().expect("auth lock poisoned").as_ref().map(|a| a.token.clone())
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sign in with email (or username) and password.
    pub async fn login(&self, identity: &str, password: &str) -> Result<User, SyncError> {
        let req = self
            .client
            .post(self.url("/api/collections/users/auth-with-password"))
            .json(&PasswordAuthRequest {
                identity: identity.to_string(),
                password: password.to_string(),
            });
        let auth: AuthResponse = execute(req).await?;
        info!("Signed in as {}", auth.record.display_name());
        Ok(self.store_auth(auth))
    }

    /// Register the realtime topics this client wants pushed.
    pub async fn set_realtime_topics(
        &self,
        client_id: &str,
        topics: Vec<String>,
    ) -> Result<(), SyncError> {
        debug!("Subscribing realtime client {} to {:?}", client_id, topics);
        let req = self
            .authorized(self.client.post(self.url("/api/realtime")))
            .json(&RealtimeSubscribeRequest {
                client_id: client_id.to_string(),
                subscriptions: topics,
            });
        execute_empty(req).await
    }

    /// Attach the session token, if there is one.
    pub fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => req.header(header::AUTHORIZATION, token),
            None => req,
        }
    }

    fn user_id(&self) -> Result<String, SyncError> {
        self.current_user().map(|u| u.id).ok_or(SyncError::NoSession)
    }

    fn store_auth(&self, auth: AuthResponse) -> User {
        let user = auth.record.clone();
        *self.auth.write().expect("auth lock poisoned") = Some(AuthState {
            token: auth.token,
            user: auth.record,
        });
        user
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn current_user(&self) -> Option<User> {
        self.auth.read().expect("auth lock poisoned").as_ref().map(|a| a.user.clone())
    }

    fn clear_auth(&self) {
        *self.auth.write().expect("auth lock poisoned") = None;
    }

    async fn list_messages(
        &self,
        kind: RoomKind,
        room_id: &str,
        page_size: u32,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        let filter = format!("({}=\"{}\")", kind.scope_field(), room_id.replace('"', "\\\""));
        let per_page = page_size.to_string();
        let req = self
            .authorized(
                self.client
                    .get(self.url(&format!("/api/collections/{}/records", kind.collection()))),
            )
            .query(&[
                ("page", "1"),
                ("perPage", per_page.as_str()),
                ("sort", "-created"),
                ("filter", filter.as_str()),
                ("expand", "author"),
            ]);

        let page: ListResponse<MessageRecord> = execute(req).await?;
        let mut items = page.items;
        // Fetched newest-first so the page holds the latest messages.
        items.reverse();
        Ok(items)
    }

    async fn create_message(
        &self,
        kind: RoomKind,
        room_id: &str,
        body: &str,
    ) -> Result<MessageRecord, SyncError> {
        let mut payload = json!({
            "author": self.user_id()?,
            "body": body,
        });
        payload[kind.scope_field()] = json!(room_id);

        let req = self
            .authorized(
                self.client
                    .post(self.url(&format!("/api/collections/{}/records", kind.collection()))),
            )
            .json(&payload);
        execute(req).await
    }

    async fn get_room(&self, kind: RoomKind, room_id: &str) -> Result<(), SyncError> {
        let req = self.authorized(self.client.get(self.url(&format!(
            "/api/collections/{}/records/{}",
            kind.room_collection(),
            room_id
        ))));
        execute_empty(req).await
    }

    async fn join_room(&self, room_id: &str) -> Result<(), SyncError> {
        let req = self
            .authorized(self.client.post(self.url("/api/collections/room_members/records")))
            .json(&JoinRoomRequest {
                room: room_id.to_string(),
                user: self.user_id()?,
                role: "member".into(),
            });
        execute_empty(req).await
    }

    async fn heartbeat(&self, room_id: &str) -> Result<(), SyncError> {
        let req = self
            .authorized(self.client.post(self.url("/api/hearth/presence/heartbeat")))
            .json(&HeartbeatRequest {
                room_id: room_id.to_string(),
            });
        execute_empty(req).await
    }

    async fn presence(&self, room_id: &str) -> Result<Vec<PresenceEntry>, SyncError> {
        let req = self.authorized(
            self.client
                .get(self.url(&format!("/api/hearth/presence/{}", room_id))),
        );
        let resp: PresenceResponse = execute(req).await?;
        Ok(resp.online)
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, SyncError> {
        let resp = self
            .client
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(network)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let date = resp
            .headers()
            .get(header::DATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SyncError::Decode("health response has no Date header".into()))?;
        DateTime::parse_from_rfc2822(date)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| SyncError::Decode(format!("bad Date header '{}': {}", date, e)))
    }

    async fn auth_refresh(&self) -> Result<User, SyncError> {
        if self.token().is_none() {
            return Err(SyncError::NoSession);
        }
        let req = self.authorized(
            self.client
                .post(self.url("/api/collections/users/auth-refresh")),
        );
        let auth: AuthResponse = execute(req).await?;
        Ok(self.store_auth(auth))
    }
}

pub(crate) fn network(e: reqwest::Error) -> SyncError {
    SyncError::Network(e.to_string())
}

async fn execute<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, SyncError> {
    let resp = req.send().await.map_err(network)?;
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    let body = resp.bytes().await.map_err(network)?;
    serde_json::from_slice(&body).map_err(|e| SyncError::Decode(e.to_string()))
}

async fn execute_empty(req: RequestBuilder) -> Result<(), SyncError> {
    let resp = req.send().await.map_err(network)?;
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    Ok(())
}

/// Map a non-2xx response onto the sync error taxonomy.
pub(crate) async fn error_from_response(resp: Response) -> SyncError {
    let status = resp.status().as_u16();
    let url = resp.url().path().to_string();
    let body = resp.text().await.unwrap_or_default();
    let err: ErrorResponse = serde_json::from_str(&body).unwrap_or_default();
    classify(status, &url, err)
}

fn classify(status: u16, path: &str, err: ErrorResponse) -> SyncError {
    match status {
        401 | 403 => SyncError::Unauthorized,
        404 => SyncError::NotFound(path.to_string()),
        409 => SyncError::Conflict,
        400 if err.is_unique_violation() => SyncError::Conflict,
        _ => SyncError::Status {
            status,
            message: err.message,
        },
    }
}
