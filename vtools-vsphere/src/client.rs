//! vSphere REST API HTTP client with session-based authentication.
//!
//! Talks to vCenter / ESXi via `{scheme}://{host}:{port}/api/...`. A session
//! is created on first use and dropped again on `401`.

use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, VsphereError};
use crate::types::VsphereConfig;

const SESSION_HEADER: &str = "vmware-api-session-id";

/// Longest response body excerpt kept in error messages.
const BODY_EXCERPT: usize = 500;

pub struct VsphereClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    session: RwLock<Option<String>>,
}

impl VsphereClient {
    /// Build a client from config. Does not contact the host.
    pub fn new(config: &VsphereConfig) -> Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(VsphereError::Client)?;

        Ok(Self {
            http,
            base_url: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            session: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn is_logged_in(&self) -> bool {
        self.session.read().await.is_some()
    }

    // ── Session management ──────────────────────────────────────────

    async fn login(&self) -> Result<String> {
        let url = format!("{}/api/session", self.base_url);
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let resp = check_status(resp).await?;

        // The session id comes back as a quoted JSON string.
        let session_id: String = parse_response(resp).await?;
        debug!(base_url = %self.base_url, "Created vSphere session");
        Ok(session_id)
    }

    async fn session_id(&self) -> Result<String> {
        if let Some(sid) = self.session.read().await.clone() {
            return Ok(sid);
        }
        let mut session = self.session.write().await;
        if let Some(sid) = session.clone() {
            return Ok(sid);
        }
        let sid = self.login().await?;
        *session = Some(sid.clone());
        Ok(sid)
    }

    async fn invalidate(&self, sid: &str) {
        let mut session = self.session.write().await;
        if session.as_deref() == Some(sid) {
            *session = None;
        }
    }

    /// Delete the current session (DELETE /api/session).
    pub async fn logout(&self) -> Result<()> {
        let Some(sid) = self.session.write().await.take() else {
            return Ok(());
        };
        let url = format!("{}/api/session", self.base_url);
        let resp = self
            .http
            .delete(&url)
            .header(SESSION_HEADER, sid.as_str())
            .send()
            .await?;
        match check_status(resp).await {
            Ok(_) | Err(VsphereError::Unauthorized(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── HTTP helpers ────────────────────────────────────────────────

    async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        let sid = self.session_id().await?;
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header(SESSION_HEADER, sid.as_str());
        if let Some(body) = body {
            req = req.json(body);
        }

        match check_status(req.send().await?).await {
            Err(VsphereError::Unauthorized(msg)) => {
                self.invalidate(&sid).await;
                Err(VsphereError::Unauthorized(msg))
            }
            other => other,
        }
    }

    /// GET a JSON response. An expired session is renewed once.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = match self.request::<()>(Method::GET, path, None).await {
            Err(VsphereError::Unauthorized(_)) => {
                warn!(path, "vSphere session rejected, logging in again");
                self.request::<()>(Method::GET, path, None).await?
            }
            other => other?,
        };
        parse_response(resp).await
    }

    /// POST with JSON body, return parsed response.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self.request(Method::POST, path, Some(body)).await?;
        parse_response(resp).await
    }

    /// POST with no body, discarding the response.
    pub async fn post_empty(&self, path: &str) -> Result<()> {
        self.request::<()>(Method::POST, path, None).await?;
        Ok(())
    }

    /// PATCH with JSON body, discarding the response.
    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        self.request(Method::PATCH, path, Some(body)).await?;
        Ok(())
    }

    /// DELETE, discarding the response.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.request::<()>(Method::DELETE, path, None).await?;
        Ok(())
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let body = excerpt(&body).to_string();
    match status {
        StatusCode::UNAUTHORIZED => Err(VsphereError::Unauthorized(body)),
        StatusCode::FORBIDDEN => Err(VsphereError::Forbidden(body)),
        StatusCode::NOT_FOUND => Err(VsphereError::NotFound(body)),
        _ => Err(VsphereError::Api {
            status: status.as_u16(),
            body,
        }),
    }
}

async fn parse_response<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let text = resp.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| VsphereError::Parse(format!("{e}, body: {}", excerpt(&text))))
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(BODY_EXCERPT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
