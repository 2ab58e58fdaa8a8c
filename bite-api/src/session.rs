use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, header, redirect};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::http::{HttpRequest, RawResponse};

/// Shared HTTP session for one service instance.
///
/// Every physical call holds a permit for its whole duration so the
/// semaphore bounds both in-flight work and open connections.
#[derive(Debug, Clone)]
pub struct Session {
    client: Client,
    permits: Arc<Semaphore>,
    concurrent: usize,
    base: String,
    timeout: Option<Duration>,
}

impl Session {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let mut builder = Client::builder()
            .default_headers(headers)
            .user_agent(format!("bite-api-{}", env!("CARGO_PKG_VERSION")))
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(!config.verify)
            .pool_max_idle_per_host(config.concurrent);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Unexpected(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.concurrent)),
            concurrent: config.concurrent,
            base: config.base.clone(),
            timeout: config.timeout,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrent
    }

    /// Sends exactly one request. Never retries and never follows redirects.
    pub async fn send(&self, request: &HttpRequest) -> Result<RawResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Unexpected("session closed".to_string()))?;

        debug!(method = request.method.as_str(), url = %request.url, "sending request");

        let mut builder = self.client.request(request.method.into(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        let headers = response.headers().clone();
        if status == reqwest::StatusCode::MOVED_PERMANENTLY {
            let new = headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Err(Error::Moved {
                old: request.url.clone(),
                new,
            });
        }

        let url = response.url().to_string();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        Ok(RawResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            url,
            headers,
            body,
        })
    }

    fn classify(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
            return Error::request(format!("request timed out (timeout: {}s)", secs));
        }
        if is_tls_failure(&err) {
            return Error::request("SSL certificate verification failed");
        }
        if err.is_connect() {
            return Error::request(format!("failed to establish connection: {}", self.base));
        }
        Error::request(format!("HTTP request failed: {}", err))
    }
}

fn is_tls_failure(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        let msg = e.to_string().to_lowercase();
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            return true;
        }
        source = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::service::ServiceKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base: &str) -> ServiceConfig {
        ServiceConfig::new(base, ServiceKind::BugzillaRest).unwrap()
    }

    fn get(url: String) -> HttpRequest {
        HttpRequest {
            method: Method::Get,
            url,
            headers: vec![("X-Test".to_string(), "1".to_string())],
            body: None,
        }
    }

    #[tokio::test]
    async fn test_send_passes_headers_and_returns_body() {
        // Given: モックサーバーを起動
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/version"))
            .and(header("X-Test", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"version\":\"5.0\"}"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let session = Session::new(&config(&mock_server.uri())).unwrap();

        // When: リクエストを送信
        let response = session
            .send(&get(format!("{}/rest/version", mock_server.uri())))
            .await
            .unwrap();

        // Then: ステータスと本文が返る
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{\"version\":\"5.0\"}");
    }

    #[tokio::test]
    async fn test_moved_permanently_is_not_followed() {
        // Given: 301を返すサーバー
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("Location", "https://new.example.org/rest"),
            )
            .mount(&mock_server)
            .await;

        let session = Session::new(&config(&mock_server.uri())).unwrap();
        let url = format!("{}/old", mock_server.uri());

        // When: リクエストを送信
        let result = session.send(&get(url.clone())).await;

        // Then: 移転エラーになる
        match result {
            Err(Error::Moved { old, new }) => {
                assert_eq!(old, url);
                assert_eq!(new, "https://new.example.org/rest");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_status_is_returned_unclassified() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&mock_server)
            .await;

        let session = Session::new(&config(&mock_server.uri())).unwrap();
        let response = session.send(&get(mock_server.uri())).await.unwrap();

        assert_eq!(response.status, 503);
        assert_eq!(response.body, "down");
    }

    #[tokio::test]
    async fn test_connection_failure_is_classified() {
        // 使われていないポートへ接続
        let session = Session::new(&config("http://127.0.0.1:9")).unwrap();
        let result = session.send(&get("http://127.0.0.1:9/rest".to_string())).await;

        match result {
            Err(Error::Request { msg, .. }) => {
                assert_eq!(msg, "failed to establish connection: http://127.0.0.1:9");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&mock_server)
            .await;

        let session = Session::new(&config(&mock_server.uri()).timeout(1)).unwrap();
        let result = session.send(&get(mock_server.uri())).await;

        match result {
            Err(Error::Request { msg, .. }) => assert_eq!(msg, "request timed out (timeout: 1s)"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
