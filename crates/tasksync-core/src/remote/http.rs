//! REST client for the task API.
//!
//! `POST {base}/tasks`, `PUT {base}/tasks/{id}` and `DELETE {base}/tasks/{id}`
//! with JSON bodies. Connect failures and timeouts are reported as the
//! unreachable sentinel.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::Deserialize;

use super::wire::{RecordResponse, TaskPayload};
use super::{RemoteClient, RemoteError, RemoteRecord, RemoteResult, UpdateReply};
use crate::config::SyncSettings;
use crate::models::Task;
use crate::config::{is_http_url, normalize_text_option};
use crate::error::compact_detail;

/// HTTP implementation of [`RemoteClient`]
#[derive(Clone, Debug)]
pub struct HttpRemoteClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemoteClient {
    /// Build a client for `base_url` with a per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RemoteResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { base_url, client })
    }

    /// Build a client from settings; `None` when no API URL is configured
    pub fn from_settings(settings: &SyncSettings) -> RemoteResult<Option<Self>> {
        let Some(base_url) = normalize_text_option(settings.api_base_url.clone()) else {
            return Ok(None);
        };
        Self::new(base_url, settings.request_timeout()).map(Some)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn tasks_url(&self) -> String {
        format!("{}/tasks", self.base_url)
    }

    fn task_url(&self, server_id: &str) -> String {
        format!("{}/tasks/{}", self.base_url, urlencoding::encode(server_id))
    }
}

impl RemoteClient for HttpRemoteClient {
    async fn create_remote(&self, task: &Task) -> RemoteResult<Option<RemoteRecord>> {
        let payload = TaskPayload::from_task(task)?;
        let response = match self
            .client
            .post(self.tasks_url())
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) if is_connectivity_error(&error) => {
                tracing::debug!(task_id = %task.id, "Remote unreachable on create: {error}");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        let body = read_record(ensure_success(response).await?).await?;
        let id = body.id().ok_or_else(|| {
            RemoteError::InvalidPayload("create response did not include an id".to_string())
        })?;
        Ok(Some(RemoteRecord {
            id,
            status: body.status,
        }))
    }

    async fn update_remote(&self, server_id: &str, task: &Task) -> RemoteResult<UpdateReply> {
        let payload = TaskPayload::from_task(task)?;
        let response = match self
            .client
            .put(self.task_url(server_id))
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) if is_connectivity_error(&error) => {
                tracing::debug!(server_id, "Remote unreachable on update: {error}");
                return Ok(UpdateReply::Unreachable);
            }
            Err(error) => return Err(error.into()),
        };

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(UpdateReply::NotFound);
        }

        let body = read_record(ensure_success(response).await?).await?;
        Ok(UpdateReply::Applied(body.status))
    }

    async fn delete_remote(&self, server_id: &str) -> RemoteResult<()> {
        let response = match self.client.delete(self.task_url(server_id)).send().await {
            Ok(response) => response,
            Err(error) if is_connectivity_error(&error) => return Err(RemoteError::Unreachable),
            Err(error) => return Err(error.into()),
        };

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(server_id.to_string()));
        }

        ensure_success(response).await?;
        Ok(())
    }
}

fn is_connectivity_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

async fn ensure_success(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Api {
        status: status.as_u16(),
        message: parse_api_error(status, &body),
    })
}

async fn read_record(response: Response) -> RemoteResult<RecordResponse> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|error| {
        RemoteError::InvalidPayload(format!("{error}: {}", compact_detail(&body)))
    })
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return message.trim().to_string();
        }
    }

    let trimmed = compact_detail(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}

fn normalize_base_url(raw: String) -> RemoteResult<String> {
    let base_url = normalize_text_option(Some(raw)).ok_or_else(|| {
        RemoteError::InvalidConfiguration("API base URL must not be empty".to_string())
    })?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(RemoteError::InvalidConfiguration(
            "API base URL must include http:// or https://".to_string(),
        ))
    }
}
