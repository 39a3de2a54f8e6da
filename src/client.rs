//! TextNow web API client
//!
//! Replays the browser session (cookies + CSRF header) against the message
//! list, send and attachment endpoints.

use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Wrapper keys the message list has been seen under
const LIST_KEYS: &[&str] = &["messages", "data", "result"];

/// Storage PUT may answer without a body
const UPLOAD_ACCEPTED: &[StatusCode] = &[StatusCode::OK, StatusCode::CREATED, StatusCode::NO_CONTENT];

/// `contact_type` for a plain phone number
const CONTACT_TYPE_PHONE: &str = "2";

/// Direction of a vendor message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn code(&self) -> u8 {
        match self {
            MessageDirection::Inbound => 1,
            MessageDirection::Outbound => 2,
        }
    }
}

/// A message as returned by the vendor, read leniently
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage(pub Value);

impl RawMessage {
    /// Message id; numeric ids are stringified, empty ids are `None`
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn contact_value(&self) -> Option<&str> {
        self.0
            .get("contact_value")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Message body, empty if absent
    pub fn text(&self) -> &str {
        self.0.get("message").and_then(Value::as_str).unwrap_or("")
    }

    pub fn direction(&self) -> Option<MessageDirection> {
        let code = match self.0.get("message_direction")? {
            Value::Number(n) => n.as_u64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        match code {
            1 => Some(MessageDirection::Inbound),
            2 => Some(MessageDirection::Outbound),
            _ => None,
        }
    }

    /// Vendor timestamp (`timestamp` or `date`), if any
    pub fn timestamp(&self) -> Option<String> {
        ["timestamp", "date"].iter().find_map(|k| match self.0.get(*k)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }
}

/// Attachment flavours accepted by `send_attachment`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Voice,
}

impl AttachmentKind {
    fn message_type(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "2",
            AttachmentKind::Voice => "5",
        }
    }

    fn media_type(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "images",
            AttachmentKind::Voice => "audio",
        }
    }
}

/// Operations the coordinator and command handlers need from the vendor
#[async_trait]
pub trait VendorApi: Send + Sync {
    /// Fetch messages newer than `cursor`
    async fn poll(&self, cursor: &str) -> Result<Vec<RawMessage>>;

    async fn send_sms(&self, phone: &str, text: &str) -> Result<()>;

    async fn send_mms(&self, phone: &str, caption: &str, file: Vec<u8>, filename: &str)
        -> Result<()>;

    async fn send_voice(&self, phone: &str, audio: Vec<u8>, filename: &str) -> Result<()>;

    /// Release the HTTP session
    async fn shutdown(&self) {}
}

/// Flatten the message list response into a list
///
/// Accepts a bare array or an object wrapping it under a known key;
/// anything else is an empty list.
pub fn normalize_message_list(body: Value) -> Vec<RawMessage> {
    let list = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => LIST_KEYS
            .iter()
            .find_map(|k| match map.remove(*k) {
                Some(Value::Array(items)) if !items.is_empty() => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    list.into_iter().map(RawMessage).collect()
}

/// Content type for an attachment, by file extension
pub fn content_type_for(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    match ext {
        "png" => "image/png",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mp3" | "m4a" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => "image/jpeg",
    }
}

/// Percent-decode a CSRF token copied from a cookie jar
///
/// The header must carry the decoded form or authenticated requests fail.
pub fn decode_csrf(token: &str) -> String {
    if !token.contains('%') {
        return token.to_string();
    }
    urlencoding::decode(token)
        .map(|t| t.into_owned())
        .unwrap_or_else(|_| token.to_string())
}

fn cookie_header(config: &Config) -> String {
    let mut cookie = format!("connect.sid={}; _csrf={}", config.connect_sid, config.csrf);
    if let Some(xsrf) = config.xsrf_token.as_deref().filter(|x| !x.is_empty()) {
        cookie.push_str(&format!("; XSRF-TOKEN={}", xsrf));
    }
    cookie
}

/// reqwest-backed [`VendorApi`]
pub struct TextNowClient {
    base_url: String,
    username: String,
    cookie: String,
    csrf: String,
    session: Mutex<Option<Client>>,
}

impl TextNowClient {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            cookie: cookie_header(config),
            csrf: decode_csrf(&config.csrf),
            session: Mutex::new(None),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/api/users/{}/messages", self.base_url, self.username)
    }

    /// The shared session, built on first use
    async fn session(&self) -> Result<Client> {
        let mut guard = self.session.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let header = |v: &str| {
            HeaderValue::from_str(v).map_err(|e| Error::Config(format!("invalid header value: {}", e)))
        };
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, header(&self.cookie)?);
        headers.insert("x-csrf-token", header(&self.csrf)?);
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));

        let client = Client::builder().default_headers(headers).build()?;
        debug!(base_url = %self.base_url, "Created TextNow session");
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Turn anything but a 200 into `Error::Send`
    async fn check_send(response: Response, step: &str, phone: &str) -> Result<Response> {
        Self::check_status(response, &[StatusCode::OK], step, phone).await
    }

    async fn check_status(
        response: Response,
        accepted: &[StatusCode],
        step: &str,
        phone: &str,
    ) -> Result<Response> {
        let status = response.status();
        if accepted.contains(&status) {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!(phone = phone, step = step, status = status.as_u16(), body = %body, "TextNow request rejected");
        Err(Error::Send {
            status: status.as_u16(),
            body,
        })
    }

    /// Three-step attachment send: request upload URL, PUT bytes, send_attachment
    async fn send_attachment(
        &self,
        phone: &str,
        kind: AttachmentKind,
        caption: &str,
        file: Vec<u8>,
        filename: &str,
    ) -> Result<()> {
        let session = self.session().await?;

        // Step 1: upload URL
        let response = session
            .post(format!("{}/api/v3/attachment_url", self.base_url))
            .json(&json!({
                "file_name": filename,
                "file_size": file.len(),
                "message_type": kind.message_type(),
            }))
            .send()
            .await?;
        let response = Self::check_send(response, "attachment_url", phone).await?;
        let upload: Value = response.json().await?;
        let media_url = upload
            .get("media_url")
            .or_else(|| upload.get("result"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                error!(phone = phone, response = %upload, "No media_url in upload response");
                Error::Send {
                    status: StatusCode::OK.as_u16(),
                    body: "no media_url in upload response".to_string(),
                }
            })?;

        // Step 2: raw upload
        let response = session
            .put(&media_url)
            .header(CONTENT_TYPE, content_type_for(filename))
            .body(file)
            .send()
            .await?;
        Self::check_status(response, UPLOAD_ACCEPTED, "upload", phone).await?;

        // Step 3: send referencing the uploaded file
        let mut form = vec![
            ("contact_value", phone.to_string()),
            ("contact_type", CONTACT_TYPE_PHONE.to_string()),
            ("attachment_url", media_url.clone()),
            ("message_type", kind.message_type().to_string()),
            ("media_type", kind.media_type().to_string()),
        ];
        if !caption.is_empty() {
            form.push(("message", caption.to_string()));
        }

        let result = async {
            let response = session
                .post(format!("{}/api/v3/send_attachment", self.base_url))
                .form(&form)
                .send()
                .await?;
            Self::check_send(response, "send_attachment", phone).await
        }
        .await;

        if let Err(e) = result {
            // Uploaded file is not rolled back
            warn!(phone = phone, media_url = %media_url, "Attachment uploaded but not sent");
            return Err(e);
        }

        debug!(phone = phone, kind = ?kind, "Attachment sent");
        Ok(())
    }
}

#[async_trait]
impl VendorApi for TextNowClient {
    async fn poll(&self, cursor: &str) -> Result<Vec<RawMessage>> {
        let session = self.session().await?;
        let response = session
            .get(self.messages_url())
            .query(&[
                ("start_message_id", cursor),
                ("direction", "future"),
                ("page_size", "0"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "message list returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let body: Value = response.json().await?;
        Ok(normalize_message_list(body))
    }

    async fn send_sms(&self, phone: &str, text: &str) -> Result<()> {
        let session = self.session().await?;
        let response = session
            .post(self.messages_url())
            .json(&json!({
                "contact_value": phone,
                "message_direction": MessageDirection::Outbound.code(),
                "contact_type": 2,
                "message": text,
            }))
            .send()
            .await?;
        Self::check_send(response, "send_sms", phone).await?;
        debug!(phone = phone, "SMS sent");
        Ok(())
    }

    async fn send_mms(
        &self,
        phone: &str,
        caption: &str,
        file: Vec<u8>,
        filename: &str,
    ) -> Result<()> {
        self.send_attachment(phone, AttachmentKind::Image, caption, file, filename)
            .await
    }

    async fn send_voice(&self, phone: &str, audio: Vec<u8>, filename: &str) -> Result<()> {
        self.send_attachment(phone, AttachmentKind::Voice, "", audio, filename)
            .await
    }

    async fn shutdown(&self) {
        if self.session.lock().await.take().is_some() {
            debug!("Closed TextNow session");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST, PUT};
    use httpmock::MockServer;
    use std::path::Path;

    const PHONE: &str = "+15551234567";

    fn client_for(base_url: &str) -> TextNowClient {
        let mut config = Config::for_test(Path::new("/tmp"));
        config.base_url = base_url.to_string();
        config.csrf = "abc%3D%3D".to_string();
        TextNowClient::new(&config)
    }

    fn sms_body(text: &str) -> Value {
        json!({
            "contact_value": PHONE,
            "message_direction": 2,
            "contact_type": 2,
            "message": text,
        })
    }

    #[test]
    fn test_normalize_bare_list() {
        let list = normalize_message_list(json!([{"id": 1}, {"id": 2}]));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_normalize_wrapped_list() {
        for key in ["messages", "data", "result"] {
            let list = normalize_message_list(json!({ key: [{"id": 1}] }));
            assert_eq!(list.len(), 1, "key {key}");
        }
        // Empty wrapper falls through to the next key
        let list = normalize_message_list(json!({"messages": [], "data": [{"id": 3}]}));
        assert_eq!(list[0].id().as_deref(), Some("3"));
    }

    #[test]
    fn test_normalize_unrecognized_shape() {
        assert!(normalize_message_list(json!({"status": "ok"})).is_empty());
        assert!(normalize_message_list(json!("nope")).is_empty());
        assert!(normalize_message_list(json!({"messages": "x"})).is_empty());
    }

    #[test]
    fn test_raw_message_accessors() {
        let msg = RawMessage(json!({
            "id": 5,
            "contact_value": " +15551234567 ",
            "message": "2",
            "message_direction": 1,
            "date": "2024-05-01T12:00:00Z"
        }));
        assert_eq!(msg.id().as_deref(), Some("5"));
        assert_eq!(msg.contact_value(), Some("+15551234567"));
        assert_eq!(msg.text(), "2");
        assert_eq!(msg.direction(), Some(MessageDirection::Inbound));
        assert_eq!(msg.timestamp().as_deref(), Some("2024-05-01T12:00:00Z"));

        let odd = RawMessage(json!({"id": "", "message_direction": "2"}));
        assert_eq!(odd.id(), None);
        assert_eq!(odd.contact_value(), None);
        assert_eq!(odd.text(), "");
        assert_eq!(odd.direction(), Some(MessageDirection::Outbound));
        assert_eq!(odd.timestamp(), None);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("photo.PNG"), "image/png");
        assert_eq!(content_type_for("anim.gif"), "image/gif");
        assert_eq!(content_type_for("clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("memo.m4a"), "audio/mpeg");
        assert_eq!(content_type_for("memo.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("pic.jpg"), "image/jpeg");
        assert_eq!(content_type_for("noext"), "image/jpeg");
    }

    #[test]
    fn test_decode_csrf() {
        assert_eq!(decode_csrf("abc%3D%3D"), "abc==");
        assert_eq!(decode_csrf("plain-token"), "plain-token");
    }

    #[test]
    fn test_cookie_header() {
        let mut config = Config::for_test(Path::new("/tmp"));
        assert_eq!(cookie_header(&config), "connect.sid=sid; _csrf=csrf");
        config.xsrf_token = Some("x1".to_string());
        assert_eq!(
            cookie_header(&config),
            "connect.sid=sid; _csrf=csrf; XSRF-TOKEN=x1"
        );
    }

    #[tokio::test]
    async fn test_poll_request_shape() {
        let server = MockServer::start_async().await;
        let list = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/users/tester/messages")
                    .query_param("start_message_id", "0")
                    .query_param("direction", "future")
                    .query_param("page_size", "0")
                    .header("x-csrf-token", "abc==")
                    .header("cookie", "connect.sid=sid; _csrf=abc%3D%3D")
                    .header("x-requested-with", "XMLHttpRequest");
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({"messages": [{
                        "id": 9,
                        "contact_value": PHONE,
                        "message": "hi",
                        "message_direction": 1
                    }]}));
            })
            .await;
        let client = client_for(&server.base_url());

        let messages = client.poll("0").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "hi");
        list.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn test_poll_non_200_is_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/users/tester/messages");
                then.status(500).body("{}");
            })
            .await;
        let client = client_for(&server.base_url());
        let result = client.poll("0").await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_send_sms_payload_and_error() {
        let server = MockServer::start_async().await;
        let accepted = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/users/tester/messages")
                    .header("x-csrf-token", "abc==")
                    .json_body(sms_body("hello"));
                then.status(200).json_body(json!({}));
            })
            .await;
        let denied = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/users/tester/messages")
                    .json_body(sms_body("again"));
                then.status(403).body("denied");
            })
            .await;
        let client = client_for(&server.base_url());

        client.send_sms(PHONE, "hello").await.unwrap();
        let err = client.send_sms(PHONE, "again").await.unwrap_err();
        match err {
            Error::Send { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "denied");
            }
            other => panic!("expected Send error, got {other:?}"),
        }
        accepted.assert_calls_async(1).await;
        denied.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn test_send_sms_requires_exactly_200() {
        for status in [201, 204] {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST).path("/api/users/tester/messages");
                    then.status(status);
                })
                .await;
            let client = client_for(&server.base_url());
            let err = client.send_sms(PHONE, "hello").await.unwrap_err();
            assert!(
                matches!(err, Error::Send { status: s, .. } if s == status),
                "status {status}"
            );
        }
    }

    #[tokio::test]
    async fn test_send_mms_three_steps() {
        let server = MockServer::start_async().await;
        let upload_url = format!("{}/upload/abc", server.base_url());
        let request_url = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v3/attachment_url")
                    .header("x-csrf-token", "abc==")
                    .json_body(json!({
                        "file_name": "cat.png",
                        "file_size": 7,
                        "message_type": "2",
                    }));
                then.status(200).json_body(json!({"media_url": &upload_url}));
            })
            .await;
        let upload = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/upload/abc")
                    .header("content-type", "image/png")
                    .body("PNGDATA");
                // Storage answers 201 on create
                then.status(201);
            })
            .await;
        let send = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v3/send_attachment")
                    .form_urlencoded_tuple("contact_value", PHONE)
                    .form_urlencoded_tuple("contact_type", "2")
                    .form_urlencoded_tuple("attachment_url", upload_url.as_str())
                    .form_urlencoded_tuple("message_type", "2")
                    .form_urlencoded_tuple("media_type", "images")
                    .form_urlencoded_tuple("message", "look");
                then.status(200).json_body(json!({}));
            })
            .await;
        let client = client_for(&server.base_url());

        client
            .send_mms(PHONE, "look", b"PNGDATA".to_vec(), "cat.png")
            .await
            .unwrap();
        request_url.assert_calls_async(1).await;
        upload.assert_calls_async(1).await;
        send.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn test_send_voice_stops_when_upload_fails() {
        let server = MockServer::start_async().await;
        let upload_url = format!("{}/upload/voice", server.base_url());
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v3/attachment_url")
                    .json_body(json!({
                        "file_name": "memo.m4a",
                        "file_size": 5,
                        "message_type": "5",
                    }));
                then.status(200).json_body(json!({"media_url": &upload_url}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/upload/voice");
                then.status(500).body("boom");
            })
            .await;
        let send = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v3/send_attachment");
                then.status(200);
            })
            .await;
        let client = client_for(&server.base_url());

        let err = client
            .send_voice(PHONE, b"AUDIO".to_vec(), "memo.m4a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Send { status: 500, .. }));
        send.assert_calls_async(0).await;
    }

    #[tokio::test]
    async fn test_send_attachment_rejects_non_200() {
        let server = MockServer::start_async().await;
        let upload_url = format!("{}/upload/voice", server.base_url());
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v3/attachment_url");
                then.status(200).json_body(json!({"media_url": &upload_url}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/upload/voice");
                then.status(204);
            })
            .await;
        let send = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v3/send_attachment")
                    .form_urlencoded_tuple("message_type", "5")
                    .form_urlencoded_tuple("media_type", "audio");
                then.status(202);
            })
            .await;
        let client = client_for(&server.base_url());

        let err = client
            .send_voice(PHONE, b"AUDIO".to_vec(), "memo.m4a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Send { status: 202, .. }));
        send.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn test_missing_media_url_is_send_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v3/attachment_url");
                then.status(200).json_body(json!({}));
            })
            .await;
        let client = client_for(&server.base_url());
        let err = client
            .send_mms(PHONE, "", b"X".to_vec(), "a.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Send { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_drops_session() {
        let client = client_for("http://127.0.0.1:9");
        client.session().await.unwrap();
        assert!(client.session.lock().await.is_some());
        client.shutdown().await;
        assert!(client.session.lock().await.is_none());
    }
}
