/// HTTP client used by delivery tasks.
///
/// A delivery is a single GET against the requested target. Anything other than
/// `200 OK` counts as a failed attempt, as does any transport failure.
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid request url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("{code} - {reason}: status code")]
    Status { code: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl RequestError {
    fn from_status(status: StatusCode) -> Self {
        Self::Status {
            code: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
        }
    }
}

/// Performs the network call behind a delivery task.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sender: Send + Sync {
    /// Issues a GET to `url` and returns the response status.
    async fn get(&self, url: &str) -> Result<StatusCode, RequestError>;
}

/// `Sender` backed by a `reqwest::Client` with a per-request timeout.
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(1))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build http client: {}", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn get(&self, url: &str) -> Result<StatusCode, RequestError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| RequestError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        // the body is dropped unread; only the status matters
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| RequestError::Transport(e.to_string()))?;

        Ok(response.status())
    }
}

/// Sends one GET through `sender` and maps a non-OK status to a failure.
pub async fn send(sender: &dyn Sender, url: &str) -> Result<(), RequestError> {
    tracing::info!(url, "http GET");

    let status = sender.get(url).await?;
    if status != StatusCode::OK {
        return Err(RequestError::from_status(status));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{Expectation, Server, matchers::*, responders};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_send_ok() {
        let mut sender = MockSender::new();
        sender.expect_get().times(1).returning(|_| Ok(StatusCode::OK));

        assert_eq!(send(&sender, "http://example.com").await, Ok(()));
    }

    #[tokio::test]
    async fn test_send_non_ok_status_is_failure() {
        let mut sender = MockSender::new();
        sender
            .expect_get()
            .times(1)
            .returning(|_| Ok(StatusCode::SERVICE_UNAVAILABLE));

        let err = send(&sender, "http://example.com").await.unwrap_err();

        assert_eq!(
            err,
            RequestError::Status {
                code: 503,
                reason: "Service Unavailable".to_string()
            }
        );
        assert_eq!(err.to_string(), "503 - Service Unavailable: status code");
    }

    #[tokio::test]
    async fn test_send_other_success_codes_are_failures() {
        let mut sender = MockSender::new();
        sender.expect_get().returning(|_| Ok(StatusCode::NO_CONTENT));

        let err = send(&sender, "http://example.com").await.unwrap_err();

        assert!(matches!(err, RequestError::Status { code: 204, .. }));
    }

    #[tokio::test]
    async fn test_send_transport_error_is_propagated() {
        let mut sender = MockSender::new();
        sender
            .expect_get()
            .returning(|_| Err(RequestError::Transport("connection refused".to_string())));

        let err = send(&sender, "http://example.com").await.unwrap_err();

        assert_eq!(err.to_string(), "transport error: connection refused");
    }

    #[tokio::test]
    async fn test_http_sender_returns_status() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/hook"))
                .respond_with(responders::status_code(500)),
        );

        let sender = HttpSender::new(Duration::from_secs(5)).unwrap();
        let status = sender.get(&server.url("/hook").to_string()).await.unwrap();

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_http_sender_invalid_url() {
        let sender = HttpSender::new(Duration::from_secs(5)).unwrap();

        let err = sender.get(":").await.unwrap_err();

        assert!(matches!(err, RequestError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_http_sender_timeout_is_transport_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/slow")).respond_with(
                responders::delay_and_then(
                    Duration::from_millis(500),
                    responders::status_code(200),
                ),
            ),
        );

        let sender = HttpSender::new(Duration::from_millis(20)).unwrap();
        let err = sender.get(&server.url("/slow").to_string()).await.unwrap_err();

        assert!(matches!(err, RequestError::Transport(_)));
    }
}
