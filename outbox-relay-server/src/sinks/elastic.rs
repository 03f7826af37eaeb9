//! Elasticsearch-compatible search sink.
//!
//! Documents are written with `PUT {base}/{index}/_doc/{id}`, so delivering
//! the same event twice overwrites the same document.

use async_trait::async_trait;
use outbox_relay_core::sinks::{Document, SearchSink, SinkError};
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

pub struct ElasticSearchSink {
    http_client: reqwest::Client,
    base_url: Url,
    credentials: Option<(String, Option<String>)>,
}

impl ElasticSearchSink {
    /// Create a new sink.
    ///
    /// `timeout` bounds each request; the workflow applies its own deadline
    /// on top of it.
    pub fn new(
        base_url: Url,
        credentials: Option<(String, Option<String>)>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url,
            credentials,
        })
    }

    fn document_url(&self, document: &Document) -> Result<Url, SinkError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SinkError::Unavailable(format!("invalid search url {}", self.base_url)))?
            .pop_if_empty()
            .extend([document.index.as_str(), "_doc", document.id.as_str()]);
        Ok(url)
    }
}

#[async_trait]
impl SearchSink for ElasticSearchSink {
    async fn index(&self, document: &Document) -> Result<(), SinkError> {
        let url = self.document_url(document)?;

        let mut request = self.http_client.put(url).json(&document.body);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, password.as_ref());
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(index = %document.index, id = %document.id, "Document indexed");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

fn request_error(e: reqwest::Error) -> SinkError {
    if e.is_timeout() {
        SinkError::Timeout
    } else {
        SinkError::Unavailable(e.to_string())
    }
}

/// 429 is backpressure, 5xx are retryable, anything else is a rejection.
fn classify_status(status: StatusCode, body: String) -> SinkError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        SinkError::Backpressure(body)
    } else if status.is_server_error() {
        SinkError::Unavailable(format!("status {}: {}", status.as_u16(), body))
    } else {
        SinkError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}
