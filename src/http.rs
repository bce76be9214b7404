//! HTTP transport.
//!
//! Thin wrapper around a shared `reqwest::Client` with three entry points:
//! unary JSON ([`HttpTransport::do_json`]), server-sent-event streaming
//! ([`HttpTransport::do_sse`]), and resumable upload
//! ([`HttpTransport::do_upload`]).
//!
//! The transport never retries and never classifies server errors: non-2xx
//! responses come back as [`Error::Http`] with the status and body
//! untouched, and retry policy lives with the callers (the coordinator for
//! unary calls, the stream manager for SSE).

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Method;
use tracing::{debug, trace};

use crate::error::StreamErrorKind;
use crate::{Error, Result};

/// Header tuple list applied to outgoing requests.
pub type Headers = Vec<(String, String)>;

/// A unary response: status, response headers we care about, raw body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lowercased names.
    pub headers: Headers,
    /// Raw body text.
    pub body: String,
}

impl HttpResponse {
    /// Deserializes the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Shared HTTP transport. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing `reqwest::Client`.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Sends a unary JSON request.
    ///
    /// Non-2xx responses are returned as [`Error::Http`] carrying the raw
    /// body; transport failures (DNS, TCP, TLS, timeout) surface as
    /// [`Error::Transport`].
    pub async fn do_json(
        &self,
        method: Method,
        url: &str,
        headers: &Headers,
        body: Option<&serde_json::Value>,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        trace!(%method, url, "sending unary request");
        let mut request = self.client.request(method, url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let response_headers = collect_headers(response.headers());
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            debug!(status, "unary request failed");
            return Err(Error::http(status, body));
        }
        Ok(HttpResponse {
            status,
            headers: response_headers,
            body,
        })
    }

    /// Opens an SSE request and feeds each decoded `data:` frame to
    /// `on_chunk` in receipt order.
    ///
    /// Returns `Ok(())` when the server closes the stream cleanly. Non-`data:`
    /// lines are ignored per the SSE grammar. A frame that is not valid JSON
    /// produces [`Error::Stream`] with [`StreamErrorKind::Parse`].
    pub async fn do_sse<F>(
        &self,
        url: &str,
        headers: &Headers,
        body: &serde_json::Value,
        timeout: Duration,
        mut on_chunk: F,
    ) -> Result<()>
    where
        F: FnMut(serde_json::Value),
    {
        trace!(url, "opening SSE request");
        let mut request = self.client.post(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.json(body).send().await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            debug!(status, "SSE request rejected");
            return Err(Error::http(status, body));
        }

        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| {
                Error::stream(StreamErrorKind::UpstreamClosed, 0, e.to_string())
            })?;
            if event.data.is_empty() || event.data == "[DONE]" {
                continue;
            }
            let chunk: serde_json::Value = serde_json::from_str(&event.data).map_err(|e| {
                Error::stream(
                    StreamErrorKind::Parse,
                    0,
                    format!("bad SSE frame: {e}"),
                )
            })?;
            on_chunk(chunk);
        }
        trace!(url, "SSE stream closed cleanly");
        Ok(())
    }

    /// Runs the resumable upload handshake: a `start` request carrying the
    /// JSON metadata and content headers, then a single `upload, finalize`
    /// request with the bytes against the session URL the server returned.
    pub async fn do_upload(
        &self,
        url: &str,
        headers: &Headers,
        metadata: &serde_json::Value,
        content_type: &str,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        let mut start = self
            .client
            .post(url)
            .timeout(timeout)
            .header("x-goog-upload-protocol", "resumable")
            .header("x-goog-upload-command", "start")
            .header("x-upload-content-type", content_type)
            .header("x-upload-content-length", bytes.len().to_string());
        for (name, value) in headers {
            start = start.header(name.as_str(), value.as_str());
        }
        let response = start.json(metadata).send().await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::http(status, body));
        }
        let session_url = response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::validation("upload start response did not include a session URL")
            })?
            .to_string();

        let mut upload = self
            .client
            .post(&session_url)
            .timeout(timeout)
            .header("x-goog-upload-command", "upload, finalize")
            .header("x-goog-upload-offset", "0")
            .body(bytes);
        for (name, value) in headers {
            upload = upload.header(name.as_str(), value.as_str());
        }
        let response = upload.send().await?;
        let status = response.status().as_u16();
        let response_headers = collect_headers(response.headers());
        let body = response.text().await?;
        if !(200..300).contains(&status) {
            return Err(Error::http(status, body));
        }
        Ok(HttpResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

fn collect_headers(map: &reqwest::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_response_json() {
        let response = HttpResponse {
            status: 200,
            headers: vec![],
            body: r#"{"totalTokens": 42}"#.to_string(),
        };
        let parsed: crate::types::CountTokensResponse = response.json().unwrap();
        assert_eq!(parsed.total_tokens, 42);
    }

    #[test]
    fn test_http_response_json_error() {
        let response = HttpResponse {
            status: 200,
            headers: vec![],
            body: "not json".to_string(),
        };
        let parsed: Result<serde_json::Value> = response.json();
        assert!(matches!(parsed, Err(Error::Json(_))));
    }

    #[test]
    fn test_transport_construction() {
        let transport = HttpTransport::new(Duration::from_secs(5));
        assert!(transport.is_ok());
    }
}
