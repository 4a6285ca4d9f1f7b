//! HTTP/JSON client for the execution service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::{ExecutionClient, ExecutionId, ExecutionStatus};
use crate::batching::request::ExperimentRequest;
use crate::{Error, Result};

const SUBMIT_PATH: &str = "/api/experiment/submit";
const STATUS_PATH: &str = "/api/experiment/";

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    data: SubmitData,
}

#[derive(Debug, Deserialize)]
struct SubmitData {
    exp_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: ExecutionStatus,
}

/// Execution service client over reqwest.
#[derive(Debug, Clone)]
pub struct HttpExecutionClient {
    base_url: String,
    http: Client,
}

impl HttpExecutionClient {
    /// Create a client for the service at `base_url`.
    ///
    /// Without a `timeout` requests use reqwest's defaults.
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: builder.build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn submit(&self, request: &ExperimentRequest) -> Result<ExecutionId> {
        let url = format!("{}{}", self.base_url, SUBMIT_PATH);
        debug!(%url, samples = request.samples.len(), tasks = request.tasks.len(), "submit: sending");

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Submission {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "submit: rejected");
            return Err(Error::Submission {
                status: Some(status.as_u16()),
                message: text,
            });
        }

        let body: SubmitResponse = response.json().await.map_err(|e| Error::Submission {
            status: Some(status.as_u16()),
            message: format!("malformed response: {}", e),
        })?;
        debug!(exp_id = %body.data.exp_id, "submit: accepted");
        Ok(ExecutionId(body.data.exp_id))
    }

    async fn status(&self, id: &ExecutionId) -> Result<ExecutionStatus> {
        let url = format!("{}{}{}", self.base_url, STATUS_PATH, id);
        let poll_error = |message: String| Error::Poll {
            execution_id: id.to_string(),
            message,
        };

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| poll_error(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            return Err(poll_error(format!("HTTP {}: {}", status.as_u16(), text)));
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| poll_error(format!("malformed response: {}", e)))?;
        debug!(execution_id = %id, status = %body.status, "status: polled");
        Ok(body.status)
    }
}
