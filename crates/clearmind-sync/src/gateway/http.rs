//! `RemoteGateway` over HTTP/JSON

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::sync::{OutboxEntry, SyncMethod};

use super::{
    AuthResponse, Credential, GatewayError, LoginRequest, RegisterRequest, RemoteGateway,
    RemoteUser,
};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// `/auth/me` answers with the bare user; some deployments wrap it.
#[derive(Deserialize)]
#[serde(untagged)]
enum MeResponse {
    Wrapped { user: RemoteUser },
    Bare(RemoteUser),
}

/// Map a non-success HTTP status and its `detail` onto the gateway taxonomy.
pub fn classify_status(status: u16, detail: String) -> GatewayError {
    match status {
        401 => GatewayError::Unauthorized(detail),
        408 | 429 | 500..=599 => GatewayError::Unavailable { status, detail },
        _ => GatewayError::Rejected { status, detail },
    }
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpGateway {
    /// `base_url` is the API root, e.g. `https://host/api`.
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        reqwest::Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("api_base_url: {}", e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.timeout)
            } else {
                GatewayError::Connectivity(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = error_detail(response).await;
        debug!(status = status.as_u16(), %detail, "Remote call failed");
        Err(classify_status(status.as_u16(), detail))
    }

    async fn auth(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> Result<AuthResponse, GatewayError> {
        let response = self
            .execute(self.client.post(self.url(path)).json(body))
            .await?;
        response
            .json::<AuthResponse>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

/// Extract FastAPI-style `{"detail": ...}` from an error body.
async fn error_detail(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<Value>(&body) {
        Ok(Value::Object(map)) => match map.get("detail") {
            Some(Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => body,
        },
        _ if body.is_empty() => format!("HTTP {}", status.as_u16()),
        _ => body,
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, GatewayError> {
        self.auth("/auth/register", request).await
    }

    async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, GatewayError> {
        self.auth("/auth/login", request).await
    }

    async fn me(&self, credential: &Credential) -> Result<RemoteUser, GatewayError> {
        let response = self
            .execute(
                self.client
                    .get(self.url("/auth/me"))
                    .bearer_auth(&credential.access_token),
            )
            .await?;
        match response.json::<MeResponse>().await {
            Ok(MeResponse::Wrapped { user }) | Ok(MeResponse::Bare(user)) => Ok(user),
            Err(e) => Err(GatewayError::InvalidResponse(e.to_string())),
        }
    }

    async fn deliver(
        &self,
        entry: &OutboxEntry,
        credential: Option<&Credential>,
    ) -> Result<(), GatewayError> {
        let method = match entry.method {
            SyncMethod::Create => Method::POST,
            SyncMethod::Update => Method::PUT,
            SyncMethod::Delete => Method::DELETE,
        };
        let mut request = self
            .client
            .request(method, self.url(&entry.resource_path()))
            .header(IDEMPOTENCY_HEADER, entry.idempotency_key());
        if let Some(credential) = credential {
            request = request.bearer_auth(&credential.access_token);
        }
        if entry.method != SyncMethod::Delete {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(entry.payload.clone());
        }

        self.execute(request).await?;
        debug!(entry_id = %entry.id, path = %entry.resource_path(), "Delivered entry");
        Ok(())
    }
}
