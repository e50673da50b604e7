//! HTTP client for OpenAI-compatible `/v1/embeddings` services.

use super::{EmbeddingItem, VectorProvider};
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Async embeddings client; one request per batch, no retries.
#[derive(Clone)]
pub struct HttpVectorProvider {
    client: Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl HttpVectorProvider {
    /// Builds a new client for `base_url`.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::Transport(format!("failed to build HTTP client: {}", e)))?;
        let endpoint = format!("{}/v1/embeddings", base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn classify(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout {
                millis: self.timeout.as_millis() as u64,
            }
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl VectorProvider for HttpVectorProvider {
    async fn embed_batch(&self, items: &[EmbeddingItem]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: items,
        };
        debug!("POST {} with {} items", self.endpoint, items.len());

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| self.classify(e))?;
        decode_vectors(parsed, items.len())
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}

/// Restore submission order and check the one-vector-per-item contract
fn decode_vectors(
    mut parsed: EmbeddingResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    if parsed.data.iter().all(|entry| entry.index.is_some()) {
        parsed.data.sort_by_key(|entry| entry.index);
    }

    if parsed.data.len() != expected {
        return Err(ProviderError::CountMismatch {
            expected,
            got: parsed.data.len(),
        });
    }

    Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [EmbeddingItem],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_derived_from_base_url() {
        let provider =
            HttpVectorProvider::new("https://embed.local/", "bge-m3", Duration::from_secs(5))
                .unwrap();
        assert_eq!(provider.endpoint(), "https://embed.local/v1/embeddings");
    }

    #[test]
    fn response_is_reordered_by_index() {
        let parsed: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [{"embedding": [2.0], "index": 1}, {"embedding": [1.0], "index": 0}]}"#,
        )
        .unwrap();
        assert_eq!(decode_vectors(parsed, 2).unwrap(), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn short_response_is_a_protocol_error() {
        let parsed: EmbeddingResponse =
            serde_json::from_str(r#"{"data": [{"embedding": [1.0]}]}"#).unwrap();
        let err = decode_vectors(parsed, 2).unwrap_err();
        assert!(matches!(
            err,
            ProviderError::CountMismatch {
                expected: 2,
                got: 1
            }
        ));
        assert_eq!(err.kind(), "protocol");
    }

    /// Serve one connection on a local port with `respond`
    async fn serve_once<F, Fut>(respond: F) -> String
    where
        F: FnOnce(tokio::net::TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                respond(stream).await;
            }
        });
        format!("http://{}", addr)
    }

    /// Read one request up to the end of its body
    async fn read_request(stream: &mut tokio::net::TcpStream) {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn error_status_is_reported_as_rejected() {
        let base = serve_once(|mut stream| async move {
            use tokio::io::AsyncWriteExt;
            read_request(&mut stream).await;
            let response = "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 4\r\nconnection: close\r\n\r\nbusy";
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        })
        .await;

        let provider = HttpVectorProvider::new(&base, "bge-m3", Duration::from_secs(5)).unwrap();
        let err = provider
            .embed_batch(&[EmbeddingItem::text("hello")])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "rejected");
        match err {
            ProviderError::Rejected { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "busy");
            }
            other => panic!("expected a rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_server_is_reported_as_timeout() {
        let base = serve_once(|mut stream| async move {
            read_request(&mut stream).await;
            // Hold the connection open without answering
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        })
        .await;

        let provider = HttpVectorProvider::new(&base, "bge-m3", Duration::from_millis(300)).unwrap();
        let err = provider
            .embed_batch(&[EmbeddingItem::text("hello")])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "timeout");
        assert!(matches!(err, ProviderError::Timeout { millis: 300 }));
        assert_eq!(err.to_string(), "request timed out after 300ms");
    }
}
