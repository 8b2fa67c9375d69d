use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub proxy_url: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            proxy_url: None,
            global_concurrency: 16,
            per_provider_concurrency: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unauthorized: http {status} for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("upstream_{status} for {url}")]
    Upstream { status: u16, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timeout fetching {url}")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid header {0}")]
    InvalidHeader(String),
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Maps a non-success status onto the failure taxonomy adapters surface.
pub fn status_error(status: StatusCode, url: impl Into<String>) -> FetchError {
    let url = url.into();
    let code = status.as_u16();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        FetchError::Unauthorized { status: code, url }
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchError::Upstream { status: code, url }
    } else {
        FetchError::HttpStatus { status: code, url }
    }
}

/// Lower-cases header names and trims values so adapters can pass loose pairs.
pub fn normalize_headers(pairs: &[(&str, &str)]) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        let name = name.trim().to_ascii_lowercase();
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
        let header_value = HeaderValue::from_str(value.trim())
            .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Shared HTTP client with global and per-provider concurrency limits.
///
/// Requests are attempted once: retry is owned by the job queue and the
/// per-provider circuit breaker, not by the transport.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("configuring proxy {proxy_url}"))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            timeout: config.timeout,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
        })
    }

    async fn per_provider_semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    pub async fn send(
        &self,
        provider: &str,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<&JsonValue>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", provider, %method, url);
        async move {
            let _global = self.global_limit.acquire().await.expect("semaphore not closed");
            let per_provider = self.per_provider_semaphore(provider).await;
            let _provider = per_provider.acquire().await.expect("semaphore not closed");

            let mut request = self
                .client
                .request(method, url)
                .headers(headers)
                .timeout(self.timeout);
            if let Some(body) = body {
                request = request.json(body);
            }

            let resp = request.send().await.map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout { url: url.to_string() }
                } else {
                    FetchError::Request(err)
                }
            })?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(status_error(status, final_url));
            }
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn get_text(
        &self,
        provider: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<String, FetchError> {
        let headers = normalize_headers(headers)?;
        let resp = self.send(provider, Method::GET, url, headers, None).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        provider: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let mut headers = normalize_headers(headers)?;
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("application/json"));
        let resp = self.send(provider, Method::GET, url, headers, None).await?;
        decode_json(&resp)
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        provider: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: &JsonValue,
    ) -> Result<T, FetchError> {
        let mut headers = normalize_headers(headers)?;
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("application/json"));
        let resp = self
            .send(provider, Method::POST, url, headers, Some(body))
            .await?;
        decode_json(&resp)
    }
}

fn decode_json<T: DeserializeOwned>(resp: &FetchedResponse) -> Result<T, FetchError> {
    serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
        url: resp.final_url.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_failure_taxonomy() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "u"),
            FetchError::Unauthorized { status: 401, .. }
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "u"),
            FetchError::Unauthorized { status: 403, .. }
        ));
        let limited = status_error(StatusCode::TOO_MANY_REQUESTS, "u");
        assert_eq!(limited.to_string(), "upstream_429 for u");
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "u"),
            FetchError::Upstream { status: 502, .. }
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "u"),
            FetchError::HttpStatus { status: 404, .. }
        ));
    }

    #[test]
    fn headers_are_normalized() {
        let map = normalize_headers(&[(" Authorization ", " Bearer abc "), ("X-Api-Key", "k")])
            .unwrap();
        assert_eq!(map.get("authorization").unwrap(), "Bearer abc");
        assert_eq!(map.get("x-api-key").unwrap(), "k");
        assert!(normalize_headers(&[("bad header", "v")]).is_err());
    }

    #[tokio::test]
    async fn proxy_configuration_is_validated() {
        let err = HttpFetcher::new(HttpClientConfig {
            proxy_url: Some("::not a url::".into()),
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
