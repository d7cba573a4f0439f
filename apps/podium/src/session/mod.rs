//! Session control plane: configuration plus the named remote procedures
//! exposed by the callable backend (advance a session, report a violation,
//! confirm fullscreen re-entry). Store reads/writes live elsewhere; this
//! module only speaks request/response.

pub mod listeners;
pub mod machine;
pub mod paths;

use async_trait::async_trait;
use podium_proto::QuestionOption;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    base_url: Url,
    bearer_token: Option<String>,
}

impl SessionConfig {
    pub fn new(server_base_url: impl AsRef<str>) -> Result<Self, SessionError> {
        // Centralized override so callers and env stay consistent.
        let mut base = std::env::var("PODIUM_CONTROL_BASE")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| server_base_url.as_ref().trim().to_string());
        if base.is_empty() {
            return Err(SessionError::InvalidConfig(
                "control server base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let scheme = infer_scheme(&base);
            base = format!("{scheme}{base}");
        }
        let parsed = Url::parse(&base).map_err(|err| {
            SessionError::InvalidConfig(format!("invalid control server url: {err}"))
        })?;
        Ok(Self {
            base_url: parsed,
            bearer_token: None,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }
}

/// Bare hosts that look local get plain http; anything else is assumed to
/// sit behind TLS.
fn infer_scheme(base: &str) -> &'static str {
    let host = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base)
        .to_ascii_lowercase();
    let local = host.starts_with("localhost")
        || host == "0.0.0.0"
        || host.starts_with("127.")
        || host == "::1"
        || host.starts_with("10.")
        || host.starts_with("192.168.");
    if local { "http://" } else { "https://" }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("not eligible for this session: {0}")]
    NotEligible(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl SessionError {
    /// Transient errors are retried with backoff; the rest are terminal for
    /// the current session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Network(_) | SessionError::HttpStatus(_) | SessionError::Server(_)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceSessionRequest {
    pub poll_id: String,
    pub status: podium_proto::SessionStatus,
    pub question_index: u32,
    pub question_text: String,
    pub options: Vec<QuestionOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceSessionResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportViolationRequest {
    pub poll_id: String,
    pub student_email: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportViolationResponse {
    pub success: bool,
    /// Version the server assigned to this lock; the client must apply it
    /// to its pill so a later unlock can be matched.
    #[serde(default)]
    pub lock_version: u64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub poll_id: String,
    pub student_email: String,
    pub lock_version: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[async_trait]
pub trait ControlBackend: Send + Sync {
    async fn advance_session(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &AdvanceSessionRequest,
    ) -> Result<AdvanceSessionResponse, SessionError>;

    async fn report_violation(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &ReportViolationRequest,
    ) -> Result<ReportViolationResponse, SessionError>;

    async fn confirm_fullscreen_resume(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &ResumeRequest,
    ) -> Result<ResumeResponse, SessionError>;
}

pub struct ReqwestControlBackend {
    client: reqwest::Client,
}

impl ReqwestControlBackend {
    pub fn new() -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client })
    }

    async fn post_json<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp, SessionError> {
        let url = base_url.join(endpoint).map_err(|err| {
            SessionError::InvalidConfig(format!("invalid endpoint {endpoint}: {err}"))
        })?;
        let mut builder = self.client.post(url);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.json(request).send().await?;
        if !response.status().is_success() {
            return Err(SessionError::HttpStatus(response.status()));
        }
        Ok(response.json::<Resp>().await?)
    }
}

#[async_trait]
impl ControlBackend for ReqwestControlBackend {
    async fn advance_session(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &AdvanceSessionRequest,
    ) -> Result<AdvanceSessionResponse, SessionError> {
        self.post_json(base_url, auth_token, "rpc/advanceSession", request)
            .await
    }

    async fn report_violation(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &ReportViolationRequest,
    ) -> Result<ReportViolationResponse, SessionError> {
        self.post_json(base_url, auth_token, "rpc/reportViolation", request)
            .await
    }

    async fn confirm_fullscreen_resume(
        &self,
        base_url: &Url,
        auth_token: Option<&str>,
        request: &ResumeRequest,
    ) -> Result<ResumeResponse, SessionError> {
        self.post_json(base_url, auth_token, "rpc/confirmFullscreenResume", request)
            .await
    }
}

/// Thin typed facade over the control backend. Clones share the underlying
/// HTTP client.
#[derive(Clone)]
pub struct SessionManager {
    config: Arc<SessionConfig>,
    backend: Arc<dyn ControlBackend>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let backend = Arc::new(ReqwestControlBackend::new()?);
        Ok(Self {
            config: Arc::new(config),
            backend,
        })
    }

    pub fn with_backend(config: SessionConfig, backend: Arc<dyn ControlBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn advance_session(
        &self,
        request: AdvanceSessionRequest,
    ) -> Result<(), SessionError> {
        let response = self
            .backend
            .advance_session(
                self.config.base_url(),
                self.config.bearer_token(),
                &request,
            )
            .await?;
        if !response.success {
            let message = response
                .message
                .unwrap_or_else(|| "advance rejected".to_string());
            return Err(classify_rejection(message));
        }
        Ok(())
    }

    pub async fn report_violation(
        &self,
        request: ReportViolationRequest,
    ) -> Result<u64, SessionError> {
        let response = self
            .backend
            .report_violation(
                self.config.base_url(),
                self.config.bearer_token(),
                &request,
            )
            .await?;
        if !response.success {
            let message = response
                .message
                .unwrap_or_else(|| "violation report rejected".to_string());
            return Err(classify_rejection(message));
        }
        Ok(response.lock_version)
    }

    pub async fn confirm_fullscreen_resume(
        &self,
        request: ResumeRequest,
    ) -> Result<ResumeResponse, SessionError> {
        let response = self
            .backend
            .confirm_fullscreen_resume(
                self.config.base_url(),
                self.config.bearer_token(),
                &request,
            )
            .await?;
        Ok(response)
    }
}

/// Eligibility rejections (expired link, not enrolled) are terminal and must
/// not be retried; everything else stays a retryable server error.
fn classify_rejection(message: String) -> SessionError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("enrolled")
        || lowered.contains("expired")
        || lowered.contains("invalid link")
        || lowered.contains("not authorized")
    {
        SessionError::NotEligible(message)
    } else {
        SessionError::Server(message)
    }
}
