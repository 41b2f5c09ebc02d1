//! Client for the per-service remote provisioning API.
//!
//! Every service declares one base URL per environment tag. The broker
//! talks to it on three routes:
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | GET | `/resources/{instance}/` | fetch instance credentials |
//! | POST | `/resources/{instance}/` (`hostname=<ip>`) | bind an app unit |
//! | DELETE | `/resources/{instance}/hostname/{ip}/` | unbind an app unit |
//!
//! Responses carrying data are flat JSON objects of string pairs.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::debug;

/// Credential pairs returned by a service API.
pub type Credentials = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("request to {uri} failed: {reason}")]
    Request { uri: String, reason: String },

    #[error("request to {uri} timed out")]
    Timeout { uri: String },

    #[error("{uri} responded {status}: {body}")]
    Status { uri: String, status: u16, body: String },

    #[error("invalid response from {uri}: {reason}")]
    Decode { uri: String, reason: String },
}

/// HTTP client for service APIs. Cheap to clone; connections are pooled.
#[derive(Clone)]
pub struct ServiceApiClient {
    http: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl ServiceApiClient {
    /// Create a client whose every exchange is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let http = Client::builder(TokioExecutor::new()).build_http();
        Self { http, timeout }
    }

    /// `GET /resources/{instance}/`
    pub async fn fetch_credentials(
        &self,
        endpoint: &str,
        instance: &str,
    ) -> Result<Credentials, RemoteError> {
        let uri = resource_uri(endpoint, &format!("/resources/{}/", urlencoding::encode(instance)))?;
        let body = self.send(Method::GET, uri.clone(), None).await?;
        decode_credentials(&uri, &body)
    }

    /// `POST /resources/{instance}/` with form body `hostname={unit_ip}`.
    pub async fn bind(
        &self,
        endpoint: &str,
        instance: &str,
        unit_ip: &str,
    ) -> Result<Credentials, RemoteError> {
        let uri = resource_uri(endpoint, &format!("/resources/{}/", urlencoding::encode(instance)))?;
        let form = format!("hostname={}", urlencoding::encode(unit_ip));
        let body = self.send(Method::POST, uri.clone(), Some(form)).await?;
        decode_credentials(&uri, &body)
    }

    /// `DELETE /resources/{instance}/hostname/{unit_ip}/`. The body is ignored.
    pub async fn unbind(
        &self,
        endpoint: &str,
        instance: &str,
        unit_ip: &str,
    ) -> Result<(), RemoteError> {
        let path = format!(
            "/resources/{}/hostname/{}/",
            urlencoding::encode(instance),
            urlencoding::encode(unit_ip)
        );
        let uri = resource_uri(endpoint, &path)?;
        self.send(Method::DELETE, uri, None).await?;
        Ok(())
    }

    async fn send(&self, method: Method, uri: Uri, form: Option<String>) -> Result<Bytes, RemoteError> {
        let uri_str = uri.to_string();
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(USER_AGENT, "tether-broker/0.1");
        if form.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        }
        let req = builder
            .body(Full::new(Bytes::from(form.unwrap_or_default())))
            .map_err(|e| RemoteError::Request {
                uri: uri_str.clone(),
                reason: e.to_string(),
            })?;

        let exchange = async {
            let resp = self.http.request(req).await.map_err(|e| RemoteError::Request {
                uri: uri_str.clone(),
                reason: e.to_string(),
            })?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| RemoteError::Request {
                    uri: uri_str.clone(),
                    reason: e.to_string(),
                })?
                .to_bytes();
            Ok::<_, RemoteError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| RemoteError::Timeout {
                uri: uri_str.clone(),
            })??;

        debug!(%method, uri = %uri_str, %status, "service API call");

        if !status.is_success() {
            return Err(RemoteError::Status {
                uri: uri_str,
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        Ok(body)
    }
}

/// Join a service base URL and a path. A base without a scheme is http.
fn resource_uri(endpoint: &str, path: &str) -> Result<Uri, RemoteError> {
    let base = endpoint.trim().trim_end_matches('/');
    let base = if base.contains("://") {
        base.to_string()
    } else {
        format!("http://{base}")
    };
    let uri: Uri = format!("{base}{path}")
        .parse()
        .map_err(|e: http::uri::InvalidUri| RemoteError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;
    if uri.scheme_str() != Some("http") {
        return Err(RemoteError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: "only http endpoints are supported".to_string(),
        });
    }
    Ok(uri)
}

/// An empty body is an empty credential set.
fn decode_credentials(uri: &Uri, body: &[u8]) -> Result<Credentials, RemoteError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Credentials::new());
    }
    serde_json::from_slice(body).map_err(|e| RemoteError::Decode {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}
