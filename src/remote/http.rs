//! HTTP adapter for the remote replication endpoint.
//!
//! - `GET  {base}/changes?since=N` → [`PullBatch`]
//! - `POST {base}/push` with `{"docs": [...]}` → [`PushAck`]

use super::{PullBatch, PushAck, RemoteError, RemoteStore};
use crate::entity::{Checkpoint, EntityRecord};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::debug;

#[derive(Serialize)]
struct PushRequest<'a> {
    docs: &'a [EntityRecord],
}

pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .user_agent(concat!("taskflow-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn pull(&self, since: Checkpoint) -> Result<PullBatch, RemoteError> {
        let url = format!("{}/changes", self.base_url);
        debug!("[remote] GET {} since={}", url, since);
        let resp = self
            .authorized(self.client.get(&url).query(&[("since", since.0)]))
            .send()
            .await
            .map_err(transport_error)?;

        let resp = check_status(resp).await?;
        resp.json::<PullBatch>()
            .await
            .map_err(|e| RemoteError::Protocol(format!("invalid pull response: {}", e)))
    }

    async fn push(&self, records: Vec<EntityRecord>) -> Result<PushAck, RemoteError> {
        let url = format!("{}/push", self.base_url);
        debug!("[remote] POST {} ({} docs)", url, records.len());
        let resp = self
            .authorized(self.client.post(&url).json(&PushRequest { docs: &records }))
            .send()
            .await
            .map_err(transport_error)?;

        let resp = check_status(resp).await?;
        resp.json::<PushAck>()
            .await
            .map_err(|e| RemoteError::Protocol(format!("invalid push response: {}", e)))
    }
}

async fn check_status(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status, body))
}

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: String) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(body),
        StatusCode::PAYLOAD_TOO_LARGE => RemoteError::PayloadTooLarge,
        StatusCode::GONE | StatusCode::UPGRADE_REQUIRED => RemoteError::IncompatibleSchema(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Unavailable {
                status: Some(status.as_u16()),
                message: body,
            }
        }
        s if s.is_server_error() => RemoteError::Unavailable {
            status: Some(s.as_u16()),
            message: body,
        },
        s => RemoteError::Protocol(format!("HTTP {}: {}", s.as_u16(), body)),
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else if e.is_connect() {
        RemoteError::Unreachable(e.to_string())
    } else if e.is_decode() {
        RemoteError::Protocol(e.to_string())
    } else {
        RemoteError::Unavailable {
            status: None,
            message: e.to_string(),
        }
    }
}
