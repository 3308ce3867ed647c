use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::ChatClient;
use crate::client::events::{
    InboundEvent, MembershipChange, MessageContent, SyncBatch, SyncEvent,
};
use crate::config::{LoginMethod, ServerConfig};

/// Timeout handed to the sync long poll, in milliseconds.
const SYNC_TIMEOUT_MS: u32 = 30_000;

/// One authenticated connection to a Matrix homeserver, speaking the
/// client-server HTTP API directly.
pub struct MatrixClient {
    http: reqwest::Client,
    /// Base URL of the homeserver. Doubles as the server identity everywhere
    /// in the relay engine (connection table keys, group memberships, logs).
    homeserver: String,
    user_id: String,
    access_token: String,
    stopped: AtomicBool,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    user_id: String,
}

#[derive(Deserialize)]
struct WhoamiResponse {
    user_id: String,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    content_uri: String,
}

// ── Sync wire format (the slice of it the bridge consumes) ──────────────

#[derive(Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Deserialize, Default)]
struct SyncRooms {
    /// Ordered map so one batch flattens to a deterministic room order.
    #[serde(default)]
    join: BTreeMap<String, JoinedRoom>,
}

#[derive(Deserialize, Default)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Deserialize, Default)]
struct Timeline {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    sender: String,
    #[serde(default)]
    state_key: Option<String>,
    content: serde_json::Value,
}

impl MatrixClient {
    /// Log in to the homeserver described by `cfg` and resolve the bound
    /// user id. Supports password login and pre-issued access tokens.
    pub async fn connect(cfg: &ServerConfig, device_id: &str, display_name: &str) -> Result<Self> {
        let http = reqwest::Client::new();

        let access_token = match &cfg.login {
            LoginMethod::Password { user, password } => {
                info!(server = %cfg.homeserver, %user, "logging in with password");
                login_password(&http, &cfg.homeserver, user, password, device_id, display_name)
                    .await?
            }
            LoginMethod::AccessToken { token, .. } => token.clone(),
        };

        let client = Self {
            http,
            homeserver: cfg.homeserver.clone(),
            user_id: String::new(),
            access_token,
            stopped: AtomicBool::new(false),
        };

        let user_id = client
            .whoami()
            .await
            .with_context(|| format!("whoami failed against {}", cfg.homeserver))?;

        if let LoginMethod::AccessToken {
            user_id: configured,
            ..
        } = &cfg.login
            && configured != &user_id
        {
            warn!(
                server = %cfg.homeserver,
                %configured,
                actual = %user_id,
                "configured user id does not match the token's owner"
            );
        }

        Ok(Self { user_id, ..client })
    }

    async fn whoami(&self) -> Result<String> {
        let url = format!("{}/_matrix/client/v3/account/whoami", self.homeserver);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("whoami request failed")?;
        let resp = expect_success(resp, "whoami").await?;
        let whoami: WhoamiResponse = resp.json().await.context("failed to parse whoami response")?;
        Ok(whoami.user_id)
    }
}

async fn login_password(
    http: &reqwest::Client,
    homeserver: &str,
    user: &str,
    password: &str,
    device_id: &str,
    display_name: &str,
) -> Result<String> {
    let url = format!("{homeserver}/_matrix/client/v3/login");
    let body = serde_json::json!({
        "type": "m.login.password",
        "identifier": { "type": "m.id.user", "user": user },
        "password": password,
        "device_id": device_id,
        "initial_device_display_name": display_name,
    });

    let resp = http
        .post(&url)
        .json(&body)
        .send()
        .await
        .context("login request failed")?;
    let resp = expect_success(resp, "login").await?;
    let login: LoginResponse = resp.json().await.context("failed to parse login response")?;

    info!(
        server = %homeserver,
        user_id = %login.user_id,
        "login successful (consider switching to access_token login)"
    );
    Ok(login.access_token)
}

/// Turn a non-2xx response into an error carrying the status and body.
async fn expect_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("{what} returned {status}: {body}"));
    }
    Ok(resp)
}

/// Split an `mxc://server/media-id` URI into its server and media id parts.
pub fn parse_mxc(uri: &str) -> Result<(&str, &str)> {
    let rest = uri
        .strip_prefix("mxc://")
        .ok_or_else(|| anyhow!("not an mxc URI: {uri}"))?;
    let (server, media_id) = rest
        .split_once('/')
        .ok_or_else(|| anyhow!("malformed mxc URI: {uri}"))?;
    if server.is_empty() || media_id.is_empty() {
        return Err(anyhow!("malformed mxc URI: {uri}"));
    }
    Ok((server, media_id))
}

/// Flatten a sync response into the engine-facing batch, keeping timeline
/// order within each room and processing rooms in lexicographic order (the
/// sync payload itself doesn't order rooms against each other). Event types
/// other than messages and membership changes are dropped here.
fn flatten_sync(sync: SyncResponse) -> SyncBatch {
    let mut events = Vec::new();
    for (room, joined) in sync.rooms.join {
        for raw in joined.timeline.events {
            match raw.kind.as_str() {
                "m.room.message" => match serde_json::from_value::<MessageContent>(raw.content) {
                    Ok(content) => {
                        events.push(SyncEvent::Message(InboundEvent {
                            sender: raw.sender,
                            room: room.clone(),
                            content,
                        }));
                    }
                    Err(e) => {
                        warn!(room = %room, error = %e, "skipping malformed message event");
                    }
                },
                "m.room.member" => {
                    let membership = raw
                        .content
                        .get("membership")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if let Some(state_key) = raw.state_key {
                        events.push(SyncEvent::Membership(MembershipChange {
                            room: room.clone(),
                            state_key,
                            membership: membership.into(),
                        }));
                    }
                }
                _ => {}
            }
        }
    }
    SyncBatch {
        next_batch: sync.next_batch,
        events,
    }
}

impl ChatClient for MatrixClient {
    fn homeserver(&self) -> &str {
        &self.homeserver
    }

    fn identity(&self) -> &str {
        &self.user_id
    }

    async fn sync_once(&self, since: Option<&str>) -> Result<SyncBatch> {
        // After stop() the long poll would outlive the shutdown grace period,
        // so return an empty batch instead of issuing it.
        if self.stopped.load(Ordering::Relaxed) {
            return Ok(SyncBatch {
                next_batch: since.unwrap_or_default().to_string(),
                events: Vec::new(),
            });
        }

        let mut url = format!(
            "{}/_matrix/client/v3/sync?timeout={}",
            self.homeserver, SYNC_TIMEOUT_MS
        );
        if let Some(token) = since {
            url.push_str("&since=");
            url.push_str(&urlencoding::encode(token));
        }

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("sync request failed")?;
        let resp = expect_success(resp, "sync").await?;
        let sync: SyncResponse = resp.json().await.context("failed to parse sync response")?;
        Ok(flatten_sync(sync))
    }

    async fn send_message(&self, room: &str, content: &MessageContent) -> Result<String> {
        let url = format!(
            "{}/_matrix/client/v3/rooms/{}/send/m.room.message/{}",
            self.homeserver,
            urlencoding::encode(room),
            Uuid::new_v4()
        );
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&self.access_token)
            .json(content)
            .send()
            .await
            .context("send request failed")?;
        let resp = expect_success(resp, "send").await?;
        let sent: SendResponse = resp.json().await.context("failed to parse send response")?;
        Ok(sent.event_id)
    }

    async fn send_text(&self, room: &str, body: &str) -> Result<String> {
        self.send_message(room, &MessageContent::text(body)).await
    }

    async fn download(&self, mxc: &str) -> Result<Vec<u8>> {
        let (server, media_id) = parse_mxc(mxc)?;
        let url = format!(
            "{}/_matrix/media/v3/download/{}/{}",
            self.homeserver,
            urlencoding::encode(server),
            urlencoding::encode(media_id)
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("download request failed")?;
        let resp = expect_success(resp, "download").await?;
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .context("failed to read media body")
    }

    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        let url = format!("{}/_matrix/media/v3/upload", self.homeserver);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .header("Content-Type", mime_type)
            .body(bytes)
            .send()
            .await
            .context("upload request failed")?;
        let resp = expect_success(resp, "upload").await?;
        let upload: UploadResponse = resp.json().await.context("failed to parse upload response")?;
        Ok(upload.content_uri)
    }

    async fn join_room(&self, room: &str) -> Result<()> {
        let url = format!(
            "{}/_matrix/client/v3/join/{}",
            self.homeserver,
            urlencoding::encode(room)
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("join request failed")?;
        expect_success(resp, "join").await?;
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mxc_accepts_valid_uris() {
        let (server, media_id) = parse_mxc("mxc://x.example/abcDEF123").unwrap();
        assert_eq!(server, "x.example");
        assert_eq!(media_id, "abcDEF123");
    }

    #[test]
    fn parse_mxc_rejects_other_schemes() {
        assert!(parse_mxc("https://x.example/abc").is_err());
        assert!(parse_mxc("").is_err());
    }

    #[test]
    fn parse_mxc_rejects_missing_parts() {
        assert!(parse_mxc("mxc://x.example").is_err());
        assert!(parse_mxc("mxc:///abc").is_err());
        assert!(parse_mxc("mxc://x.example/").is_err());
    }

    #[test]
    fn flatten_sync_keeps_timeline_order_and_filters_types() {
        let sync: SyncResponse = serde_json::from_value(serde_json::json!({
            "next_batch": "s72595_4483",
            "rooms": { "join": { "!room:x.example": { "timeline": { "events": [
                { "type": "m.room.member", "sender": "@admin:x.example",
                  "state_key": "@bridge:x.example", "content": { "membership": "ban" } },
                { "type": "m.room.message", "sender": "@u:x.example",
                  "content": { "msgtype": "m.text", "body": "hi" } },
                { "type": "m.reaction", "sender": "@u:x.example",
                  "content": { } }
            ] } } } }
        }))
        .unwrap();

        let batch = flatten_sync(sync);
        assert_eq!(batch.next_batch, "s72595_4483");
        assert_eq!(batch.events.len(), 2);
        assert!(matches!(&batch.events[0], SyncEvent::Membership(m)
            if m.state_key == "@bridge:x.example" && m.membership.is_leave_or_ban()));
        assert!(matches!(&batch.events[1], SyncEvent::Message(m)
            if m.sender == "@u:x.example" && m.room == "!room:x.example"));
    }

    #[test]
    fn flatten_sync_orders_rooms_deterministically() {
        let sync: SyncResponse = serde_json::from_value(serde_json::json!({
            "next_batch": "s2",
            "rooms": { "join": {
                "!beta:y.example": { "timeline": { "events": [
                    { "type": "m.room.message", "sender": "@u:y.example",
                      "content": { "msgtype": "m.text", "body": "second" } }
                ] } },
                "!alpha:y.example": { "timeline": { "events": [
                    { "type": "m.room.message", "sender": "@u:y.example",
                      "content": { "msgtype": "m.text", "body": "first" } }
                ] } }
            } }
        }))
        .unwrap();

        let batch = flatten_sync(sync);
        let rooms: Vec<&str> = batch
            .events
            .iter()
            .map(|event| match event {
                SyncEvent::Message(m) => m.room.as_str(),
                SyncEvent::Membership(m) => m.room.as_str(),
            })
            .collect();
        assert_eq!(rooms, vec!["!alpha:y.example", "!beta:y.example"]);
    }

    #[test]
    fn flatten_sync_skips_malformed_messages() {
        let sync: SyncResponse = serde_json::from_value(serde_json::json!({
            "next_batch": "s1",
            "rooms": { "join": { "!room:x.example": { "timeline": { "events": [
                { "type": "m.room.message", "sender": "@u:x.example",
                  "content": { "body": "no msgtype" } }
            ] } } } }
        }))
        .unwrap();

        let batch = flatten_sync(sync);
        assert!(batch.events.is_empty());
    }
}
