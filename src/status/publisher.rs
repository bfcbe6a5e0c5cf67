//! Status broadcast to the message bus

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::StatusSnapshot;

/// Destination for status broadcasts
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    /// Publish one snapshot
    async fn publish(&self, snapshot: &StatusSnapshot) -> Result<()>;
}

/// Publishes snapshots as JSON over HTTP POST
pub struct HttpStatusPublisher {
    client: reqwest::Client,
    url: Url,
}

impl HttpStatusPublisher {
    /// Build the client and confirm the endpoint answers
    pub async fn connect(url: &str, request_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Config {
            message: format!("invalid broadcast URL '{}': {}", url, e),
            key: Some("status.broadcast_url".to_string()),
        })?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        client.head(url.clone()).send().await?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl StatusPublisher for HttpStatusPublisher {
    async fn publish(&self, snapshot: &StatusSnapshot) -> Result<()> {
        self.client
            .post(self.url.clone())
            .json(&snapshot.clone().bounded())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Connect the broadcast publisher, giving up after `timeout`
///
/// The bus is not critical: a failed or slow connection only logs a
/// warning and the manager runs without broadcasting for the rest of the
/// process lifetime.
pub async fn init_publisher(url: &str, timeout: Duration) -> Option<Arc<dyn StatusPublisher>> {
    let url = url.to_string();
    let handle = tokio::spawn(async move { HttpStatusPublisher::connect(&url, timeout).await });
    let abort = handle.abort_handle();

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(publisher))) => {
            tracing::info!("Connected status broadcast");
            Some(Arc::new(publisher))
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!(error = %e, "Status broadcast unavailable; continuing without it");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Status broadcast initialization task failed");
            None
        }
        Err(_) => {
            abort.abort();
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Status broadcast did not connect in time; continuing without it"
            );
            None
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn publishes_snapshot_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/status", server.uri());
        let publisher = init_publisher(&url, Duration::from_secs(5)).await.unwrap();
        let snapshot = StatusSnapshot {
            manager_name: "Proto-7_CTM".into(),
            ..StatusSnapshot::default()
        };
        publisher.publish(&snapshot).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let post = requests
            .iter()
            .find(|r| r.method.as_str() == "POST")
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&post.body).unwrap();
        assert_eq!(body["manager_name"], "Proto-7_CTM");
    }

    #[tokio::test]
    async fn rejected_publish_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let publisher = init_publisher(&server.uri(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(publisher.publish(&StatusSnapshot::default()).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_bus_yields_none() {
        // Nothing listens on port 9 of the loopback interface
        let publisher = init_publisher("http://127.0.0.1:9/status", Duration::from_secs(5)).await;
        assert!(publisher.is_none());
    }

    #[tokio::test]
    async fn slow_bus_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        let publisher = init_publisher(&server.uri(), Duration::from_millis(200)).await;
        assert!(publisher.is_none());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
