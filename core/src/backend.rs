/// REST client for the messaging backend.
///
/// Every request carries `Authorization: Bearer <token>`. Push feeds use the
/// same token as a `token` query parameter on the WebSocket URL.
use crate::error::{ChatError, Result};
use crate::types::{
    MessageId, MessageRecord, ProfileSettings, RoomId, RoomKind, UserProfile, UserSummary,
};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct Backend {
    http: reqwest::Client,
    api_url: String,
    ws_url: String,
    token: String,
    timeout: Option<Duration>,
}

#[derive(Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<MessageRecord>,
}

#[derive(Deserialize)]
struct UserSearch {
    #[serde(default)]
    users: Vec<UserSummary>,
}

#[derive(Serialize)]
struct CreateRoomRequest<'a> {
    room_type: &'a str,
    recipient_emails: &'a [String],
}

#[derive(Deserialize)]
struct CreateRoomResponse {
    room: CreatedRoom,
}

#[derive(Deserialize)]
struct CreatedRoom {
    #[serde(rename = "ID", alias = "id")]
    id: RoomId,
}

#[derive(Deserialize)]
struct UpdatedProfile {
    user: UpdatedUser,
}

#[derive(Deserialize)]
struct UpdatedUser {
    #[serde(default)]
    avatar_url: Option<String>,
}

impl Backend {
    /// `ws_url` overrides the push-feed base; by default it is derived from `api_url`.
    pub fn new(
        api_url: &str,
        ws_url: Option<&str>,
        token: &str,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let api_url = api_url.trim_end_matches('/').to_string();
        let ws_url = match ws_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => websocket_base(&api_url)?,
        };
        let http = reqwest::Client::builder()
            .user_agent(concat!("chatline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            api_url,
            ws_url,
            token: token.to_string(),
            timeout,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Room list feed URL
    pub fn rooms_feed_url(&self) -> String {
        format!(
            "{}/messages/rooms/socket?token={}",
            self.ws_url,
            urlencoding::encode(&self.token)
        )
    }

    /// Per-conversation message feed URL
    pub fn thread_feed_url(&self, room_id: RoomId) -> String {
        format!(
            "{}/messages/{}/socket?token={}",
            self.ws_url,
            room_id,
            urlencoding::encode(&self.token)
        )
    }

    /// One page of messages, newest `limit` strictly below `before` when given
    pub async fn fetch_messages(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRecord>> {
        let mut query = vec![
            ("room_id", room_id.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before_id", before.to_string()));
        }
        debug!("Fetching messages room={} limit={} before={:?}", room_id, limit, before);

        let page: MessagePage = self
            .json(self.get("/messages").query(&query))
            .await?;
        Ok(page.messages)
    }

    /// Current user behind the bearer token
    pub async fn validate(&self) -> Result<UserProfile> {
        self.json(self.get("/auth/validate")).await
    }

    pub async fn profile_settings(&self) -> Result<ProfileSettings> {
        self.json(self.get("/user/update")).await
    }

    /// Submit profile text fields; returns the settings with the stored avatar URL
    pub async fn update_profile_settings(
        &self,
        settings: &ProfileSettings,
    ) -> Result<ProfileSettings> {
        let form = Form::new()
            .text("username", settings.username.clone())
            .text("first_name", settings.first_name.clone())
            .text("last_name", settings.last_name.clone());
        let updated: UpdatedProfile = self
            .json(self.post("/user/update").multipart(form))
            .await?;

        let mut out = settings.clone();
        if updated.user.avatar_url.is_some() {
            out.avatar_url = updated.user.avatar_url;
        }
        Ok(out)
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>> {
        let found: UserSearch = self
            .json(self.get("/users/search").query(&[("q", query)]))
            .await?;
        Ok(found.users)
    }

    /// Create a conversation with the given recipients; returns its id
    pub async fn create_room(&self, kind: RoomKind, recipients: &[String]) -> Result<RoomId> {
        let body = CreateRoomRequest {
            room_type: kind.as_str(),
            recipient_emails: recipients,
        };
        let created: CreateRoomResponse = self
            .json(self.post("/messages/rooms/create").json(&body))
            .await?;
        Ok(created.room.id)
    }

    /// Post a message; each file goes into the same form as a `files` part
    pub async fn send_message(
        &self,
        room_id: RoomId,
        content: &str,
        files: &[PathBuf],
    ) -> Result<()> {
        let mut form = Form::new().text("content", content.trim().to_string());
        for path in files {
            let data = tokio::fs::read(path).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            debug!("Attaching {} ({} bytes)", name, data.len());
            form = form.part("files", Part::bytes(data).file_name(name));
        }
        self.send(self.post(&format!("/messages/send/{}", room_id)).multipart(form))
            .await?;
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.send(self.post("/auth/logout")).await?;
        Ok(())
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http.get(format!("{}{}", self.api_url, path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http.post(format!("{}{}", self.api_url, path)))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.bearer_auth(&self.token);
        match self.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Backend {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let bytes = self.send(builder).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// `http(s)://host/path` -> `ws(s)://host/path`
pub fn websocket_base(api_url: &str) -> Result<String> {
    if let Some(rest) = api_url.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else if api_url.starts_with("ws://") || api_url.starts_with("wss://") {
        Ok(api_url.to_string())
    } else {
        Err(ChatError::Config(format!(
            "API URL must start with http:// or https://: {}",
            api_url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_base() {
        assert_eq!(
            websocket_base("https://conn.example.com").unwrap(),
            "wss://conn.example.com"
        );
        assert_eq!(
            websocket_base("http://127.0.0.1:8080/api").unwrap(),
            "ws://127.0.0.1:8080/api"
        );
        assert!(websocket_base("conn.example.com").is_err());
    }

    #[test]
    fn test_feed_urls_encode_token() {
        let backend = Backend::new("https://api.example/", None, "a b+c", None).unwrap();
        assert_eq!(
            backend.rooms_feed_url(),
            "wss://api.example/messages/rooms/socket?token=a%20b%2Bc"
        );
        assert_eq!(
            backend.thread_feed_url(RoomId(12)),
            "wss://api.example/messages/12/socket?token=a%20b%2Bc"
        );
    }

    #[tokio::test]
    async fn test_send_message_attaches_files() {
        use http_body_util::{BodyExt, Full};
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{Request, Response};
        use hyper_util::rt::TokioIo;
        use std::convert::Infallible;
        use std::sync::{Arc, Mutex};

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "attached body").unwrap();

        let seen: Arc<Mutex<Option<(String, String)>>> = Arc::new(Mutex::new(None));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let record = seen.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                let record = record.clone();
                async move {
                    let path = req.uri().path().to_string();
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    *record.lock().unwrap() =
                        Some((path, String::from_utf8_lossy(&body).into_owned()));
                    Ok::<_, Infallible>(Response::new(Full::new(bytes::Bytes::new())))
                }
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .await;
        });

        let backend = Backend::new(&base, None, "t", None).unwrap();
        backend
            .send_message(RoomId(5), "  see attached ", &[path])
            .await
            .unwrap();

        let (path, body) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(path, "/messages/send/5");
        assert!(body.contains("name=\"content\""));
        assert!(body.contains("see attached\r\n"));
        assert!(body.contains("name=\"files\"; filename=\"notes.txt\""));
        assert!(body.contains("attached body"));
    }

    #[tokio::test]
    async fn test_send_message_missing_file_is_io_error() {
        let backend = Backend::new("http://127.0.0.1:9", None, "t", None).unwrap();
        let err = backend
            .send_message(RoomId(1), "hi", &[PathBuf::from("/nonexistent/chatline.bin")])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Io(_)));
    }

    #[test]
    fn test_explicit_ws_url_wins() {
        let backend =
            Backend::new("http://127.0.0.1:1", Some("ws://127.0.0.1:2/"), "t", None).unwrap();
        assert_eq!(
            backend.rooms_feed_url(),
            "ws://127.0.0.1:2/messages/rooms/socket?token=t"
        );
    }
}
