use anyhow::Context;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use reqwest::Method;
use std::time::Duration;
use tokio::time::timeout;

/// Result of one call to the remote service.
///
/// `status` is either the remote HTTP status or one synthesized locally
/// (413 oversize body, 500 transport failure, 504 deadline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutcome {
    pub status: u16,
    pub body: Bytes,
}

impl RemoteOutcome {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// `{"error": message}` with the given status.
    pub fn error(status: u16, message: impl AsRef<str>) -> Self {
        let body = serde_json::json!({ "error": message.as_ref() }).to_string();
        Self::new(status, body)
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// `None` disables the per-call deadline.
    pub deadline: Option<Duration>,
    pub max_body_bytes: usize,
}

enum CallFailure {
    TooLarge,
    Transport(reqwest::Error),
}

impl CallFailure {
    fn into_outcome(self) -> RemoteOutcome {
        match self {
            CallFailure::TooLarge => RemoteOutcome::error(413, "response too large"),
            CallFailure::Transport(err) => {
                RemoteOutcome::error(500, format!("Failed to fetch data: {err}"))
            }
        }
    }
}

/// Issues single bounded requests against the remote service.
///
/// Every call resolves to exactly one [`RemoteOutcome`]. When the deadline
/// wins the race the transfer future is dropped, which closes the connection.
#[derive(Clone)]
pub struct Executor {
    client: reqwest::Client,
    cfg: ExecutorConfig,
    authorization: Option<String>,
}

impl Executor {
    pub fn new(cfg: ExecutorConfig) -> anyhow::Result<Self> {
        // Redirects are relayed to the caller as-is.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build HTTP client")?;

        let authorization = if cfg.username.is_empty() && cfg.password.is_empty() {
            None
        } else {
            let raw = format!("{}:{}", cfg.username, cfg.password);
            Some(format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(raw)
            ))
        };

        Ok(Self {
            client,
            cfg,
            authorization,
        })
    }

    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        silent: bool,
    ) -> RemoteOutcome {
        if silent {
            tracing::trace!(%method, path, "torrserver: request");
        } else {
            tracing::debug!(%method, path, "torrserver: request");
        }

        let url = format!("{}{}", self.cfg.base_url, path);
        let mut request = self.client.request(method, &url);
        if let Some(auth) = &self.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let result = match self.cfg.deadline {
            Some(deadline) => match timeout(deadline, self.transfer(request)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    tracing::debug!(path, ?deadline, "torrserver: request deadline exceeded");
                    return RemoteOutcome::error(504, "request timeout");
                }
            },
            None => self.transfer(request).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(failure) => {
                let outcome = failure.into_outcome();
                tracing::debug!(path, status = outcome.status, "torrserver: request failed");
                outcome
            }
        }
    }

    async fn transfer(&self, request: reqwest::RequestBuilder) -> Result<RemoteOutcome, CallFailure> {
        let max = self.cfg.max_body_bytes;
        let mut response = request.send().await.map_err(CallFailure::Transport)?;
        let status = response.status().as_u16();

        if response.content_length().is_some_and(|len| len > max as u64) {
            return Err(CallFailure::TooLarge);
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(CallFailure::Transport)? {
            // Dropping `response` here aborts the rest of the transfer.
            if body.len() + chunk.len() > max {
                return Err(CallFailure::TooLarge);
            }
            body.extend_from_slice(&chunk);
        }

        Ok(RemoteOutcome {
            status,
            body: body.freeze(),
        })
    }
}
