use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::AppError;

pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True when `url` answers with a success status.
    async fn check(&self, url: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    http_client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, url: &str) -> bool {
        match self.http_client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(url = %url, status = %status, "Health check response");
                status.is_success()
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/health", addr)
    }

    #[tokio::test]
    async fn success_status_is_healthy() {
        let url = serve_once("HTTP/1.1 200 OK").await;
        assert!(HttpHealthProbe::new().unwrap().check(&url).await);
    }

    #[tokio::test]
    async fn error_status_is_unhealthy() {
        let url = serve_once("HTTP/1.1 503 Service Unavailable").await;
        assert!(!HttpHealthProbe::new().unwrap().check(&url).await);
    }

    #[tokio::test]
    async fn connection_refused_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!HttpHealthProbe::new().unwrap().check(&format!("http://{}/", addr)).await);
    }
}
