/*
 * debboost - Concurrent package downloader and mirror ranking engine.
 * Copyright (C) 2025  compiledkernel-idk and debboost contributors
 */

//! Network transport used by transfer workers and mirror probes.

use crate::error::{DebboostError, DebboostResult, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tokio::time::timeout;

/// An open response body
pub struct TransferBody {
    /// Advertised length, if the server sent one
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, TransferError>>,
}

/// Opens a URI for reading
///
/// Implementations report non-success statuses as [`TransferError::HttpStatus`]
/// and must not buffer the body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, uri: &str) -> Result<TransferBody, TransferError>;
}

/// Read a small resource completely, e.g. a mirror list
///
/// The whole request, body included, must finish within `limit`.
pub async fn fetch_text(
    transport: &dyn Transport,
    uri: &str,
    limit: Duration,
) -> Result<String, TransferError> {
    let fetch = async {
        let mut body = transport.open(uri).await?;
        let mut data = Vec::new();
        while let Some(chunk) = body.stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok::<String, TransferError>(String::from_utf8_lossy(&data).into_owned())
    };
    timeout(limit, fetch).await.map_err(|_| TransferError::Timeout {
        uri: uri.to_string(),
    })?
}

/// Client settings for [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub proxy: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("debboost/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            proxy: None,
        }
    }
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(settings: &HttpSettings) -> DebboostResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true);

        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| DebboostError::ConfigError {
                message: format!("invalid proxy '{}': {}", proxy, e),
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| DebboostError::ConfigError {
            message: format!("failed to build HTTP client: {}", e),
        })?;
        Ok(Self { client })
    }
}

fn classify(uri: &str, error: reqwest::Error) -> TransferError {
    if error.is_timeout() {
        TransferError::Timeout {
            uri: uri.to_string(),
        }
    } else {
        TransferError::Connection {
            uri: uri.to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, uri: &str) -> Result<TransferBody, TransferError> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| classify(uri, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }

        let content_length = response.content_length();
        let owned_uri = uri.to_string();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| classify(&owned_uri, e)))
            .boxed();

        Ok(TransferBody {
            content_length,
            stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeTransport, Route};

    #[tokio::test]
    async fn test_http_transport_streams_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/debian/pool/a.deb")
            .with_status(200)
            .with_body("hello")
            .expect(2)
            .create_async()
            .await;

        let transport = HttpTransport::new(&HttpSettings::default()).unwrap();
        let uri = format!("{}/debian/pool/a.deb", server.url());
        let body = transport.open(&uri).await.unwrap();
        assert_eq!(body.content_length, Some(5));

        let text = fetch_text(&transport, &uri, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(text, "hello");
        mock.assert_async().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_text_times_out() {
        let transport = FakeTransport::new();
        transport.route(
            "http://stalled.example/mirrors.txt",
            Route::ok(b"http://a.example/".to_vec()).delay(Duration::from_secs(24 * 3600)),
        );

        let result = fetch_text(
            &transport,
            "http://stalled.example/mirrors.txt",
            Duration::from_secs(30),
        )
        .await;
        assert!(matches!(result, Err(TransferError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_http_transport_status_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing.deb")
            .with_status(404)
            .create_async()
            .await;

        let transport = HttpTransport::new(&HttpSettings::default()).unwrap();
        let result = transport.open(&format!("{}/missing.deb", server.url())).await;
        assert!(matches!(
            result,
            Err(TransferError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_http_transport_connection_refused() {
        let transport = HttpTransport::new(&HttpSettings::default()).unwrap();
        let result = transport.open("http://127.0.0.1:1/a.deb").await;
        assert!(matches!(result, Err(TransferError::Connection { .. })));
    }
}
